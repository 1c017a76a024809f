use std::{
    fmt::{self, Write},
    mem,
    ops::RangeInclusive,
};

use bytes::{Buf, BufMut, Bytes};

use crate::{
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    range_set::RangeSet,
    shared::{ConnectionId, EcnCodepoint, ResetToken},
    transport_error::{Code as ErrorCode, TransportError},
    StreamId, MAX_CID_SIZE, RESET_TOKEN_SIZE,
};

/// A QUIC frame type byte
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct Type(u8);

impl Type {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0))
        } else {
            None
        }
    }
}

impl coding::Codec for Type {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Type(buf.get()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.0);
    }
}

pub(crate) trait FrameStruct {
    /// Smallest number of bytes this type of frame is guaranteed to fit within.
    const SIZE_BOUND: usize;
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl Type {
            $(pub(crate) const $name: Type = Type($val);)*
        }

        impl fmt::Debug for Type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "Type({:02x})", self.0),
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

frame_types! {
    PADDING = 0x00,
    RST_STREAM = 0x01,
    CONNECTION_CLOSE = 0x02,
    APPLICATION_CLOSE = 0x03,
    MAX_DATA = 0x04,
    MAX_STREAM_DATA = 0x05,
    MAX_STREAM_ID = 0x06,
    PING = 0x07,
    BLOCKED = 0x08,
    STREAM_BLOCKED = 0x09,
    STREAM_ID_BLOCKED = 0x0a,
    NEW_CONNECTION_ID = 0x0b,
    STOP_SENDING = 0x0c,
    ACK = 0x0d,
    PATH_CHALLENGE = 0x0e,
    PATH_RESPONSE = 0x0f,
    // 0x10..=0x17 STREAM
    CRYPTO = 0x18,
    PONG = 0x19,
    ACK_ECN = 0x1a,
}

const STREAM_TYS: RangeInclusive<u8> = RangeInclusive::new(0x10, 0x17);

#[derive(Debug, Clone)]
pub(crate) enum Frame {
    /// One or more consecutive PADDING bytes, coalesced
    Padding(usize),
    RstStream(RstStream),
    Close(Close),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreamId(StreamId),
    Ping(Bytes),
    Blocked { offset: u64 },
    StreamBlocked { id: StreamId, offset: u64 },
    StreamIdBlocked { id: StreamId },
    NewConnectionId(NewConnectionId),
    StopSending { id: StreamId, error_code: u16 },
    Ack(Ack),
    PathChallenge(u64),
    PathResponse(u64),
    Stream(Stream),
    Crypto(Crypto),
    Pong(Bytes),
    /// A frame that could not be decoded; terminates iteration
    Invalid { ty: Option<Type>, reason: &'static str },
}

impl Frame {
    pub(crate) fn ty(&self) -> Option<Type> {
        use self::Frame::*;
        Some(match *self {
            Padding(_) => Type::PADDING,
            RstStream(_) => Type::RST_STREAM,
            Close(self::Close::Connection(_)) => Type::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => Type::APPLICATION_CLOSE,
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreamId(_) => Type::MAX_STREAM_ID,
            Ping(_) => Type::PING,
            Blocked { .. } => Type::BLOCKED,
            StreamBlocked { .. } => Type::STREAM_BLOCKED,
            StreamIdBlocked { .. } => Type::STREAM_ID_BLOCKED,
            NewConnectionId(_) => Type::NEW_CONNECTION_ID,
            StopSending { .. } => Type::STOP_SENDING,
            Ack(self::Ack { ecn: None, .. }) => Type::ACK,
            Ack(self::Ack { ecn: Some(_), .. }) => Type::ACK_ECN,
            PathChallenge(_) => Type::PATH_CHALLENGE,
            PathResponse(_) => Type::PATH_RESPONSE,
            Stream(ref x) => {
                let mut ty = *STREAM_TYS.start();
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                Type(ty)
            }
            Crypto(_) => Type::CRYPTO,
            Pong(_) => Type::PONG,
            Invalid { ty, .. } => return ty,
        })
    }

    /// Whether receipt of this frame obligates the receiver to acknowledge
    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Frame::Ack(_) | Frame::Padding(_) | Frame::Close(_))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Close {
    Connection(ConnectionClose),
    Application(ApplicationClose),
}

impl Close {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        match *self {
            Close::Connection(ref x) => x.encode(out, max_len),
            Close::Application(ref x) => x.encode(out, max_len),
        }
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Close::Connection(x.into())
    }
}
impl From<ConnectionClose> for Close {
    fn from(x: ConnectionClose) -> Self {
        Close::Connection(x)
    }
}
impl From<ApplicationClose> for Close {
    fn from(x: ApplicationClose) -> Self {
        Close::Application(x)
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded in the specification
    pub error_code: ErrorCode,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            reason: x.reason.into(),
        }
    }
}

impl FrameStruct for ConnectionClose {
    const SIZE_BOUND: usize = 1 + 2 + 8;
}

impl ConnectionClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(Type::CONNECTION_CLOSE); // 1 byte
        out.write(self.error_code); // 2 bytes
        let max_len = max_len - 3 - varint_size_bound(self.reason.len() as u64);
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64); // <= 8 bytes
        out.put_slice(&self.reason[..actual_len]);
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: u16,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reason.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
            write!(f, " (code {})", self.error_code)?;
        } else {
            self.error_code.fmt(f)?;
        }
        Ok(())
    }
}

impl FrameStruct for ApplicationClose {
    const SIZE_BOUND: usize = 1 + 2 + 8;
}

impl ApplicationClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(Type::APPLICATION_CLOSE); // 1 byte
        out.write(self.error_code); // 2 bytes
        let max_len = max_len - 3 - varint_size_bound(self.reason.len() as u64);
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64); // <= 8 bytes
        out.put_slice(&self.reason[..actual_len]);
    }
}

fn varint_size_bound(x: u64) -> usize {
    crate::varint::size(x).unwrap_or(8)
}

#[derive(Clone, Eq, PartialEq)]
pub(crate) struct Ack {
    pub(crate) largest: u64,
    pub(crate) delay: u64,
    /// Encoded [gap, block] pairs beyond the first block
    pub(crate) additional: Bytes,
    pub(crate) ecn: Option<EcnCounts>,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges = "[".to_string();
        let mut first = true;
        for range in self.iter() {
            if !first {
                ranges.push(',');
            }
            write!(ranges, "{range:?}").unwrap();
            first = false;
        }
        ranges.push(']');

        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ecn", &self.ecn)
            .field("ranges", &ranges)
            .finish()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = AckIter<'a>;

    fn into_iter(self) -> AckIter<'a> {
        AckIter::new(self.largest, &self.additional[..])
    }
}

impl Ack {
    /// PANICS if `ranges` is empty
    pub(crate) fn encode<W: BufMut>(
        delay: u64,
        ranges: &RangeSet,
        ecn: Option<&EcnCounts>,
        buf: &mut W,
    ) {
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        let first_size = first.end - first.start;
        buf.write(if ecn.is_some() {
            Type::ACK_ECN
        } else {
            Type::ACK
        });
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first_size - 1);
        let mut prev = first.start;
        for block in rest {
            let size = block.end - block.start;
            buf.write_var(prev - block.end - 1);
            buf.write_var(size - 1);
            prev = block.start;
        }
        if let Some(x) = ecn {
            x.encode(buf)
        }
    }

    pub(crate) fn iter(&self) -> AckIter<'_> {
        self.into_iter()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct EcnCounts {
    pub(crate) ect0: u64,
    pub(crate) ect1: u64,
    pub(crate) ce: u64,
}

impl std::ops::AddAssign<EcnCodepoint> for EcnCounts {
    fn add_assign(&mut self, rhs: EcnCodepoint) {
        match rhs {
            EcnCodepoint::Ect0 => {
                self.ect0 += 1;
            }
            EcnCodepoint::Ect1 => {
                self.ect1 += 1;
            }
            EcnCodepoint::Ce => {
                self.ce += 1;
            }
        }
    }
}

impl EcnCounts {
    pub(crate) const ZERO: Self = Self {
        ect0: 0,
        ect1: 0,
        ce: 0,
    };

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write_var(self.ect0);
        out.write_var(self.ect1);
        out.write_var(self.ce);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) offset: u64,
    pub(crate) fin: bool,
    pub(crate) data: Bytes,
}

impl FrameStruct for Stream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

impl Stream {
    pub(crate) fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let mut ty = *STREAM_TYS.start();
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.write(ty); // 1 byte
        out.write(self.id); // <= 8 bytes
        if self.offset != 0 {
            out.write_var(self.offset); // <= 8 bytes
        }
        if length {
            out.write_var(self.data.len() as u64); // <= 8 bytes
        }
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Crypto {
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
}

impl Crypto {
    pub(crate) const SIZE_BOUND: usize = 1 + 8 + 8;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct RstStream {
    pub(crate) id: StreamId,
    pub(crate) error_code: u16,
    pub(crate) final_offset: u64,
}

impl FrameStruct for RstStream {
    const SIZE_BOUND: usize = 1 + 8 + 2 + 8;
}

impl RstStream {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::RST_STREAM); // 1 byte
        out.write(self.id); // <= 8 bytes
        out.write(self.error_code); // 2 bytes
        out.write_var(self.final_offset); // <= 8 bytes
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NewConnectionId {
    pub(crate) sequence: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

impl FrameStruct for NewConnectionId {
    const SIZE_BOUND: usize = 1 + 8 + 1 + MAX_CID_SIZE + RESET_TOKEN_SIZE;
}

impl NewConnectionId {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }

    fn read<R: Buf>(bytes: &mut R) -> Result<Self, IterErr> {
        let sequence = bytes.get_var()?;
        let length = bytes.get::<u8>()? as usize;
        if length > MAX_CID_SIZE || length == 0 {
            return Err(IterErr::Malformed);
        }
        if length > bytes.remaining() {
            return Err(IterErr::UnexpectedEnd);
        }
        let mut stage = [0; MAX_CID_SIZE];
        bytes.copy_to_slice(&mut stage[..length]);
        let id = ConnectionId::new(&stage[..length]);
        if bytes.remaining() < RESET_TOKEN_SIZE {
            return Err(IterErr::UnexpectedEnd);
        }
        let mut reset_token = [0; RESET_TOKEN_SIZE];
        bytes.copy_to_slice(&mut reset_token);
        Ok(Self {
            sequence,
            id,
            reset_token: reset_token.into(),
        })
    }
}

pub(crate) struct Iter {
    bytes: Bytes,
    last_ty: Option<Type>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Self {
        Self {
            bytes: payload,
            last_ty: None,
        }
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn take_u8_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get::<u8>()? as usize;
        if len > self.bytes.remaining() {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len))
    }

    fn take_remaining(&mut self) -> Bytes {
        mem::take(&mut self.bytes)
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<Type>()?;
        self.last_ty = Some(ty);
        Ok(match ty {
            Type::PADDING => {
                let mut len = 1;
                while self.bytes.has_remaining() && self.bytes.chunk()[0] == 0 {
                    self.bytes.advance(1);
                    len += 1;
                }
                Frame::Padding(len)
            }
            Type::RST_STREAM => Frame::RstStream(RstStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
                final_offset: self.bytes.get_var()?,
            }),
            Type::CONNECTION_CLOSE => Frame::Close(Close::Connection(ConnectionClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            })),
            Type::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            })),
            Type::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAM_ID => Frame::MaxStreamId(self.bytes.get()?),
            Type::PING => Frame::Ping(self.take_u8_len()?),
            Type::PONG => Frame::Pong(self.take_u8_len()?),
            Type::BLOCKED => Frame::Blocked {
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_BLOCKED => Frame::StreamBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_ID_BLOCKED => Frame::StreamIdBlocked {
                id: self.bytes.get()?,
            },
            Type::NEW_CONNECTION_ID => Frame::NewConnectionId(NewConnectionId::read(&mut self.bytes)?),
            Type::STOP_SENDING => Frame::StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
            },
            Type::ACK | Type::ACK_ECN => {
                let largest = self.bytes.get_var()?;
                let delay = self.bytes.get_var()?;
                let extra_blocks = self.bytes.get_var()? as usize;
                let n = scan_ack_blocks(&self.bytes[..], largest, extra_blocks)?;
                Frame::Ack(Ack {
                    delay,
                    largest,
                    additional: self.bytes.split_to(n),
                    // Late drafts carry ECN counts in a distinct frame type; a
                    // packet that ends at the ranges simply omits them
                    ecn: if ty != Type::ACK_ECN || !self.bytes.has_remaining() {
                        None
                    } else {
                        Some(EcnCounts {
                            ect0: self.bytes.get_var()?,
                            ect1: self.bytes.get_var()?,
                            ce: self.bytes.get_var()?,
                        })
                    },
                })
            }
            Type::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            Type::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            Type::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            _ => match ty.stream() {
                Some(s) => Frame::Stream(Stream {
                    id: self.bytes.get()?,
                    offset: if s.off() { self.bytes.get_var()? } else { 0 },
                    fin: s.fin(),
                    data: if s.len() {
                        self.take_len()?
                    } else {
                        self.take_remaining()
                    },
                }),
                None => return Err(IterErr::InvalidFrameId),
            },
        })
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(x),
            Err(e) => {
                // Corrupt frame, skip it and everything that follows
                self.bytes = Bytes::new();
                Some(Frame::Invalid {
                    ty: self.last_ty,
                    reason: e.reason(),
                })
            }
        }
    }
}

/// Validate exactly `n` additional ACK blocks in `buf` and return the number of bytes they cover
fn scan_ack_blocks(mut buf: &[u8], largest: u64, n: usize) -> Result<usize, IterErr> {
    let total_len = buf.remaining();
    let first_block = buf.get_var()?;
    let mut smallest = largest.checked_sub(first_block).ok_or(IterErr::Malformed)?;
    for _ in 0..n {
        let gap = buf.get_var()?;
        smallest = smallest.checked_sub(gap + 2).ok_or(IterErr::Malformed)?;
        let block = buf.get_var()?;
        smallest = smallest.checked_sub(block).ok_or(IterErr::Malformed)?;
    }
    Ok(total_len - buf.remaining())
}

#[derive(Debug)]
enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed,
}

impl IterErr {
    fn reason(&self) -> &'static str {
        use self::IterErr::*;
        match *self {
            UnexpectedEnd => "unexpected end",
            InvalidFrameId => "invalid frame ID",
            Malformed => "malformed",
        }
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AckIter<'a> {
    largest: u64,
    data: &'a [u8],
}

impl<'a> AckIter<'a> {
    fn new(largest: u64, data: &'a [u8]) -> Self {
        Self { largest, data }
    }
}

impl Iterator for AckIter<'_> {
    type Item = RangeInclusive<u64>;
    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        if !self.data.has_remaining() {
            return None;
        }
        let block = self.data.get_var().unwrap();
        let largest = self.largest;
        if let Ok(gap) = self.data.get_var() {
            self.largest -= block + gap + 2;
        }
        Some(largest - block..=largest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf)).collect()
    }

    #[test]
    fn ack_coding() {
        const PACKETS: &[u64] = &[1, 2, 3, 5, 10, 11, 14];
        let mut ranges = RangeSet::new();
        for &packet in PACKETS {
            ranges.insert_one(packet);
        }
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, None, &mut buf);
        let frames = frames(buf);
        assert_eq!(frames.len(), 1);
        match frames[0] {
            Frame::Ack(ref ack) => {
                let mut packets = ack.iter().flatten().collect::<Vec<_>>();
                packets.sort_unstable();
                assert_eq!(&packets[..], PACKETS);
                assert_eq!(ack.delay, 42);
            }
            ref x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_blocks() {
        // largest=12, delay=40, 1 extra block, first covers 3, then gap=2 block=1
        let mut ranges = RangeSet::new();
        ranges.insert(9..13);
        ranges.insert(4..6);
        let mut buf = Vec::new();
        Ack::encode(40, &ranges, None, &mut buf);
        assert_eq!(&buf[..], &[0x0d, 12, 40, 1, 3, 2, 1]);
        match &frames(buf)[0] {
            Frame::Ack(ack) => {
                assert_eq!(ack.largest, 12);
                assert_eq!(ack.delay, 40);
                let mut acked = ack.iter().flatten().collect::<Vec<_>>();
                acked.sort_unstable();
                assert_eq!(&acked[..], &[4, 5, 9, 10, 11, 12]);
            }
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_ecn_coding() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        let counts = EcnCounts {
            ect0: 2,
            ect1: 0,
            ce: 1,
        };
        let mut buf = Vec::new();
        Ack::encode(7, &ranges, Some(&counts), &mut buf);
        match &frames(buf)[0] {
            Frame::Ack(ack) => assert_eq!(ack.ecn, Some(counts)),
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_ecn_counts_absent_at_end_of_packet() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        let mut buf = Vec::new();
        Ack::encode(7, &ranges, None, &mut buf);
        buf[0] = 0x1a; // rewrite type to ACK_ECN; counts omitted
        match &frames(buf)[0] {
            Frame::Ack(ack) => assert_eq!(ack.ecn, None),
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn padding_coalesced() {
        let mut buf = vec![0u8; 7];
        buf.push(0x07); // empty PING
        buf.push(0);
        buf.extend_from_slice(&[0u8; 3]);
        let frames = frames(buf);
        assert_eq!(frames.len(), 3);
        assert_matches!(frames[0], Frame::Padding(7));
        assert_matches!(frames[1], Frame::Ping(ref x) if x.is_empty());
        assert_matches!(frames[2], Frame::Padding(3));
    }

    #[test]
    fn stream_coding() {
        let data = Bytes::from_static(b"hello quic");
        for &(offset, fin, length) in
            &[(0u64, false, true), (42, true, true), (7, false, false)]
        {
            let frame = Stream {
                id: StreamId(4),
                offset,
                fin,
                data: data.clone(),
            };
            let mut buf = Vec::new();
            frame.encode(length, &mut buf);
            match &frames(buf)[0] {
                Frame::Stream(x) => {
                    assert_eq!(x.id, StreamId(4));
                    assert_eq!(x.offset, offset);
                    assert_eq!(x.fin, fin);
                    assert_eq!(x.data, data);
                }
                x => panic!("incorrect frame {x:?}"),
            }
        }
    }

    #[test]
    fn crypto_coding() {
        let frame = Crypto {
            offset: 1234,
            data: Bytes::from_static(b"client hello"),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        match &frames(buf)[0] {
            Frame::Crypto(x) => {
                assert_eq!(x.offset, 1234);
                assert_eq!(&x.data[..], b"client hello");
            }
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn rst_stream_coding() {
        let frame = RstStream {
            id: StreamId(8),
            error_code: 9,
            final_offset: 777,
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_matches!(
            frames(buf)[0],
            Frame::RstStream(RstStream {
                id: StreamId(8),
                error_code: 9,
                final_offset: 777,
            })
        );
    }

    #[test]
    fn new_connection_id_coding() {
        let frame = NewConnectionId {
            sequence: 3,
            id: ConnectionId::new(&[0xab; 8]),
            reset_token: [0xcd; RESET_TOKEN_SIZE].into(),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        match frames(buf)[0] {
            Frame::NewConnectionId(x) => assert_eq!(x, frame),
            ref x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn close_coding() {
        let frame = ConnectionClose {
            error_code: ErrorCode::FLOW_CONTROL_ERROR,
            reason: Bytes::from_static(b"too much data"),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf, 1200);
        match &frames(buf)[0] {
            Frame::Close(Close::Connection(x)) => assert_eq!(*x, frame),
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn close_reason_truncated_to_fit() {
        let frame = ApplicationClose {
            error_code: 5,
            reason: Bytes::from(vec![b'x'; 500]),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf, 64);
        assert!(buf.len() <= 64);
        match &frames(buf)[0] {
            Frame::Close(Close::Application(x)) => {
                assert_eq!(x.error_code, 5);
                assert!(x.reason.len() < 500);
            }
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ping_pong_coding() {
        let mut buf = Vec::new();
        buf.write(Type::PING);
        buf.write::<u8>(4);
        buf.put_slice(b"abcd");
        buf.write(Type::PONG);
        buf.write::<u8>(4);
        buf.put_slice(b"abcd");
        let frames = frames(buf);
        assert_matches!(frames[0], Frame::Ping(ref x) if &x[..] == b"abcd");
        assert_matches!(frames[1], Frame::Pong(ref x) if &x[..] == b"abcd");
    }

    #[test]
    fn unknown_type_is_invalid() {
        let frames = frames(vec![0x3f, 1, 2, 3]);
        assert_eq!(frames.len(), 1);
        assert_matches!(
            frames[0],
            Frame::Invalid {
                reason: "invalid frame ID",
                ..
            }
        );
    }

    #[test]
    fn truncated_frame_is_invalid() {
        let mut buf = Vec::new();
        buf.write(Type::CRYPTO);
        buf.write_var(0);
        buf.write_var(20); // length runs past the packet
        buf.put_slice(b"short");
        assert_matches!(frames(buf)[0], Frame::Invalid { .. });
    }
}
