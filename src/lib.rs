//! Protocol state machine for QUIC (draft-12 wire generation).
//!
//! This crate contains no I/O. An [`Endpoint`] consumes incoming UDP
//! datagrams and routes them to [`Connection`]s by destination connection
//! ID; connections consume datagrams and timer expiries and produce
//! outgoing datagrams, timer updates, and application events. Drivers are
//! responsible for sockets, clocks, and the TLS implementation, the latter
//! supplied through the traits in [`crypto`].

use std::{fmt, ops, time::Duration};

mod assembler;
mod coding;
mod config;
mod range_set;
#[cfg(test)]
mod tests;
mod transport_parameters;
mod varint;

mod connection;
pub use crate::connection::{Connection, ConnectionError, Event, TimerSetting, TimerUpdate};

pub mod crypto;

mod frame;
pub use crate::frame::{ApplicationClose, ConnectionClose};

mod endpoint;
pub use crate::endpoint::{ConnectError, ConnectionHandle, DatagramEvent, Endpoint};

mod packet;
pub use crate::packet::SpaceId;

mod shared;
pub use crate::shared::{
    ConnectionEvent, ConnectionId, EcnCodepoint, EndpointEvent, ResetToken, Transmit,
};

mod spaces;

mod stream;
pub use crate::stream::{ReadError, WriteError};

mod timer;
pub use crate::timer::Timer;

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, TransportError};

pub use crate::config::{ClientConfig, ConfigError, EndpointConfig, ServerConfig, TransportConfig};

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0xff00_000c;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Directionality {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Directionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Directionality::Bi => "bidirectional",
            Directionality::Uni => "unidirectional",
        };
        f.write_str(s)
    }
}

/// Identifier for a stream within a particular connection
///
/// The two low bits identify the initiating side and the directionality;
/// the remaining bits are a per-type index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.directionality() {
            Directionality::Uni => "uni",
            Directionality::Bi => "bi",
        };
        write!(f, "{} {}directional stream {}", initiator, dir, self.index())
    }
}

impl StreamId {
    pub(crate) fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        StreamId(index << 2 | (directionality as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<StreamId> {
        varint::read(buf).map(StreamId).ok_or(coding::UnexpectedEnd)
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        varint::write(self.0, buf).unwrap()
    }
}

//
// Useful internal constants
//

/// Length of a stateless reset token, and of the trailer that conveys one
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
/// Largest connection ID representable in a header length nibble
pub(crate) const MAX_CID_SIZE: usize = 18;
/// Smallest nonzero connection ID permitted by the header encoding
pub(crate) const MIN_CID_SIZE: usize = 4;
/// Datagrams carrying Initial packets must be padded at least this large
pub(crate) const MIN_INITIAL_SIZE: usize = 1200;
/// Timers may fire this much later than requested
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Exponent applied to ACK delay values we encode
pub(crate) const ACK_DELAY_EXPONENT: u8 = 3;
