/// Kinds of timeouts needed to run the protocol logic
///
/// A driver arms at most one deadline per kind per connection and feeds
/// expiries back through `Connection::handle_timeout`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection = 0,
    /// When to abandon a connection after no activity
    Idle = 1,
    /// When a closing or draining connection may be freed
    Close = 2,
    /// When to send a PING frame to keep the connection alive
    KeepAlive = 3,
}

impl Timer {
    pub(crate) const COUNT: usize = 4;

    pub(crate) const VALUES: [Self; Self::COUNT] = [
        Timer::LossDetection,
        Timer::Idle,
        Timer::Close,
        Timer::KeepAlive,
    ];
}
