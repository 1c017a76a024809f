use std::collections::VecDeque;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::assembler::Assembler;
use crate::range_set::RangeSet;
use crate::transport_error::TransportError;
use crate::{Directionality, Side, StreamId};

#[derive(Debug)]
pub(crate) enum Stream {
    Send(Send),
    Recv(Recv),
    Both(Send, Recv),
}

impl Stream {
    pub(crate) fn new_bi() -> Self {
        Stream::Both(Send::new(), Recv::new())
    }

    pub(crate) fn send(&self) -> Option<&Send> {
        match *self {
            Stream::Send(ref x) => Some(x),
            Stream::Both(ref x, _) => Some(x),
            _ => None,
        }
    }

    pub(crate) fn recv(&self) -> Option<&Recv> {
        match *self {
            Stream::Recv(ref x) => Some(x),
            Stream::Both(_, ref x) => Some(x),
            _ => None,
        }
    }

    pub(crate) fn send_mut(&mut self) -> Option<&mut Send> {
        match *self {
            Stream::Send(ref mut x) => Some(x),
            Stream::Both(ref mut x, _) => Some(x),
            _ => None,
        }
    }

    pub(crate) fn recv_mut(&mut self) -> Option<&mut Recv> {
        match *self {
            Stream::Recv(ref mut x) => Some(x),
            Stream::Both(_, ref mut x) => Some(x),
            _ => None,
        }
    }

    /// Safe to free
    pub(crate) fn is_closed(&self) -> bool {
        self.send().map_or(true, |x| x.is_closed()) && self.recv().map_or(true, |x| x.is_closed())
    }
}

impl From<Send> for Stream {
    fn from(x: Send) -> Stream {
        Stream::Send(x)
    }
}
impl From<Recv> for Stream {
    fn from(x: Recv) -> Stream {
        Stream::Recv(x)
    }
}

#[derive(Debug)]
pub(crate) struct Send {
    /// Total bytes of application data submitted so far
    pub(crate) offset: u64,
    /// Largest offset the peer permits us to send at
    pub(crate) max_data: u64,
    pub(crate) state: SendState,
    /// Number of bytes sent but unacked
    pub(crate) bytes_in_flight: u64,
}

impl Send {
    pub(crate) fn new() -> Self {
        Self {
            offset: 0,
            max_data: 0,
            state: SendState::Ready,
            bytes_in_flight: 0,
        }
    }

    pub(crate) fn write_budget(&mut self) -> Result<u64, WriteError> {
        match self.state {
            SendState::ResetSent {
                ref mut stop_reason,
            }
            | SendState::ResetRecvd {
                ref mut stop_reason,
            } => {
                if let Some(error_code) = stop_reason.take() {
                    return Err(WriteError::Stopped { error_code });
                }
            }
            _ => {}
        };

        let budget = self.max_data - self.offset;
        if budget == 0 {
            Err(WriteError::Blocked)
        } else {
            Ok(budget)
        }
    }

    /// All data acknowledged and STOP_SENDING error code, if any, processed by application
    pub(crate) fn is_closed(&self) -> bool {
        use self::SendState::*;
        matches!(self.state, DataRecvd | ResetRecvd { stop_reason: None })
    }
}

/// Errors triggered while writing to a send stream
#[derive(Debug, Error, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum WriteError {
    /// The peer is not able to accept additional data, or the connection is congested.
    #[error("unable to accept further writes")]
    Blocked,
    /// The peer is no longer accepting data on this stream.
    #[error("stopped by peer: error {error_code}")]
    Stopped {
        /// Application-defined reason for stopping the stream
        error_code: u16,
    },
}

#[derive(Debug)]
pub(crate) struct Recv {
    pub(crate) state: RecvState,
    /// Offsets covered by data received so far, including gaps
    pub(crate) recvd: RangeSet,
    /// Data received but not yet reassembled
    pub(crate) buffered: VecDeque<(Bytes, u64)>,
    /// Whether any unordered reads have been performed, making this stream
    /// unusable for ordered reads
    pub(crate) unordered: bool,
    pub(crate) assembler: Assembler,
    /// Number of bytes read by the application. Equal to assembler.offset
    /// when `unordered` is false.
    pub(crate) bytes_read: u64,
}

impl Recv {
    pub(crate) fn new() -> Self {
        Self {
            state: RecvState::Recv { size: None },
            recvd: RangeSet::new(),
            buffered: VecDeque::new(),
            unordered: false,
            assembler: Assembler::new(),
            bytes_read: 0,
        }
    }

    /// Whether a read is guaranteed to fail now, but might succeed later
    pub(crate) fn is_blocked(&self) -> bool {
        self.buffered.is_empty() && self.assembler.blocked() && !self.is_finished()
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        assert!(
            !self.unordered,
            "cannot perform ordered reads following unordered reads on a stream"
        );

        for (data, offset) in self.buffered.drain(..) {
            self.assembler.insert(offset, &data);
        }

        if !self.assembler.blocked() {
            let n = self.assembler.read(buf);
            self.bytes_read += n as u64;
            Ok(n)
        } else {
            Err(self.read_blocked())
        }
    }

    pub(crate) fn read_unordered(&mut self) -> Result<(Bytes, u64), ReadError> {
        self.unordered = true;

        // Return data we already have buffered, regardless of state
        if let Some(x) = self.buffered.pop_front() {
            self.bytes_read += x.0.len() as u64;
            Ok(x)
        } else {
            Err(self.read_blocked())
        }
    }

    fn read_blocked(&mut self) -> ReadError {
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                ReadError::Reset { error_code }
            }
            RecvState::Closed => panic!("tried to read from a closed stream"),
            RecvState::Recv { .. } => ReadError::Blocked,
            RecvState::DataRecvd { .. } => {
                self.state = RecvState::Closed;
                ReadError::Finished
            }
        }
    }

    /// No more data expected from peer
    pub(crate) fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv { .. })
    }

    /// All data read by application
    pub(crate) fn is_closed(&self) -> bool {
        self.state == RecvState::Closed
    }

    pub(crate) fn buffer(&mut self, data: Bytes, offset: u64) {
        if data.is_empty() {
            return;
        }
        self.buffered.push_back((data, offset));
    }

    /// Offset after the largest byte received
    pub(crate) fn limit(&self) -> u64 {
        self.recvd.max().map_or(0, |x| x + 1)
    }

    pub(crate) fn final_offset(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::DataRecvd { size } => Some(size),
            _ => None,
        }
    }

    pub(crate) fn reset(&mut self, error_code: u16, final_offset: u64) {
        if self.is_closed() {
            return;
        }
        self.state = RecvState::ResetRecvd {
            size: final_offset,
            error_code,
        };
        // Drop buffers so that future reads fail immediately, ensuring they
        // don't issue flow control credit redundant to that already issued
        self.buffered.clear();
        self.assembler.clear();
    }
}

/// Errors triggered when reading from a recv stream
#[derive(Debug, Error, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ReadError {
    /// No more data is currently available on this stream.
    #[error("blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream.
    #[error("reset by peer: error {error_code}")]
    Reset {
        /// Application-defined reason for resetting the stream
        error_code: u16,
    },
    /// The data on this stream has been fully delivered and no more will be transmitted.
    #[error("finished")]
    Finished,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendState {
    Ready,
    DataSent,
    ResetSent { stop_reason: Option<u16> },
    DataRecvd,
    ResetRecvd { stop_reason: Option<u16> },
}

impl SendState {
    pub(crate) fn was_reset(self) -> bool {
        use self::SendState::*;
        matches!(self, ResetSent { .. } | ResetRecvd { .. })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RecvState {
    Recv { size: Option<u64> },
    DataRecvd { size: u64 },
    ResetRecvd { size: u64, error_code: u16 },
    Closed,
}

/// The set of streams open, or openable by the peer, on a connection
pub(crate) struct Streams {
    pub(crate) streams: FxHashMap<StreamId, Stream>,
    /// Lowest locally-initiated index that hasn't been opened
    pub(crate) next_uni: u64,
    pub(crate) next_bi: u64,
    /// Limits dictated by the peer on locally-initiated streams
    pub(crate) max_uni: u64,
    pub(crate) max_bi: u64,
    /// Limits we dictate on remotely-initiated streams
    pub(crate) max_remote_uni: u64,
    pub(crate) max_remote_bi: u64,
    /// Lowest remotely-initiated index that hasn't actually been opened
    pub(crate) next_remote_uni: u64,
    pub(crate) next_remote_bi: u64,
    /// Next remotely-initiated index to report to the application, once opened
    pub(crate) next_reported_remote_uni: u64,
    pub(crate) next_reported_remote_bi: u64,
}

impl Streams {
    pub(crate) fn new(side: Side, max_remote_uni: u64, max_remote_bi: u64) -> Self {
        let mut streams = FxHashMap::default();
        for i in 0..max_remote_uni {
            streams.insert(
                StreamId::new(!side, Directionality::Uni, i),
                Recv::new().into(),
            );
        }
        for i in 0..max_remote_bi {
            streams.insert(StreamId::new(!side, Directionality::Bi, i), Stream::new_bi());
        }
        Self {
            streams,
            next_uni: 0,
            next_bi: 0,
            max_uni: 0,
            max_bi: 0,
            max_remote_uni,
            max_remote_bi,
            next_remote_uni: 0,
            next_remote_bi: 0,
            next_reported_remote_uni: 0,
            next_reported_remote_bi: 0,
        }
    }

    /// Look up a stream we may legally receive data on, validating the ID
    pub(crate) fn get_recv_stream(
        &mut self,
        side: Side,
        id: StreamId,
    ) -> Result<Option<&mut Stream>, TransportError> {
        if side == id.initiator() {
            match id.directionality() {
                Directionality::Uni => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "illegal operation on send-only stream",
                    ));
                }
                Directionality::Bi if id.index() >= self.next_bi => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "operation on unopened stream",
                    ));
                }
                Directionality::Bi => {}
            };
        } else {
            let limit = match id.directionality() {
                Directionality::Bi => self.max_remote_bi,
                Directionality::Uni => self.max_remote_uni,
            };
            if id.index() >= limit {
                return Err(TransportError::STREAM_ID_ERROR(""));
            }
        }
        Ok(self.streams.get_mut(&id))
    }

    pub(crate) fn get_recv_mut(&mut self, id: StreamId) -> Option<&mut Recv> {
        self.streams.get_mut(&id)?.recv_mut()
    }

    pub(crate) fn get_send_mut(&mut self, id: StreamId) -> Option<&mut Send> {
        self.streams.get_mut(&id)?.send_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_stream_reassembly() {
        let mut rs = Recv::new();
        rs.buffer(Bytes::from_static(b"world"), 5);
        rs.buffer(Bytes::from_static(b"hello"), 0);
        rs.recvd.insert(0..10);
        let mut buf = [0; 16];
        assert_eq!(rs.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"helloworld");
        assert_eq!(rs.bytes_read, 10);
        assert_eq!(rs.read(&mut buf), Err(ReadError::Blocked));
    }

    #[test]
    fn recv_stream_finish() {
        let mut rs = Recv::new();
        rs.buffer(Bytes::from_static(b"abc"), 0);
        rs.recvd.insert(0..3);
        rs.state = RecvState::DataRecvd { size: 3 };
        let mut buf = [0; 16];
        assert_eq!(rs.read(&mut buf).unwrap(), 3);
        assert_eq!(rs.read(&mut buf), Err(ReadError::Finished));
        assert!(rs.is_closed());
    }

    #[test]
    fn reset_discards_buffers() {
        let mut rs = Recv::new();
        rs.buffer(Bytes::from_static(b"abc"), 0);
        rs.reset(42, 3);
        assert!(rs.buffered.is_empty());
        let mut buf = [0; 4];
        assert_eq!(rs.read(&mut buf), Err(ReadError::Reset { error_code: 42 }));
    }

    #[test]
    fn send_stream_budget() {
        let mut ss = Send::new();
        assert_eq!(ss.write_budget(), Err(WriteError::Blocked));
        ss.max_data = 10;
        assert_eq!(ss.write_budget(), Ok(10));
        ss.offset = 10;
        assert_eq!(ss.write_budget(), Err(WriteError::Blocked));
        ss.state = SendState::ResetRecvd {
            stop_reason: Some(7),
        };
        assert_eq!(ss.write_budget(), Err(WriteError::Stopped { error_code: 7 }));
    }

    #[test]
    fn remote_stream_limits() {
        let mut streams = Streams::new(Side::Server, 1, 1);
        let legal = StreamId::new(Side::Client, Directionality::Uni, 0);
        assert!(streams.get_recv_stream(Side::Server, legal).unwrap().is_some());
        let excessive = StreamId::new(Side::Client, Directionality::Uni, 1);
        assert!(streams.get_recv_stream(Side::Server, excessive).is_err());
        // Sending on our own unopened bidi stream is a state error
        let unopened = StreamId::new(Side::Server, Directionality::Bi, 0);
        assert!(streams.get_recv_stream(Side::Server, unopened).is_err());
    }
}
