use std::{cmp::Ordering, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    crypto,
    shared::ConnectionId,
    MAX_CID_SIZE, MIN_CID_SIZE, VERSION,
};

// Because of packet number protection, a header's variable-length packet
// number cannot be decoded without keys for its encryption level, and those
// live on the connection the packet is addressed to (or, for Initial
// packets, are derived from the destination connection ID). We therefore
// first decode the invariant part of the header, which identifies the
// destination CID, version, and packet type, and complete the decode once
// the right keys are in hand.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    /// The underlying partially-decoded packet data
    pub(crate) fn data(&self) -> &[u8] {
        self.buf.get_ref()
    }

    pub(crate) fn has_long_header(&self) -> bool {
        !matches!(self.plain_header, PlainHeader::Short { .. })
    }

    pub(crate) fn is_initial(&self) -> bool {
        matches!(
            self.plain_header,
            PlainHeader::Long {
                ty: LongType::Initial,
                ..
            }
        )
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            self.plain_header,
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        use self::PlainHeader::*;
        match self.plain_header {
            Long { ty, .. } => match ty {
                LongType::Initial => Some(SpaceId::Initial),
                LongType::Handshake => Some(SpaceId::Handshake),
                LongType::ZeroRtt => Some(SpaceId::Data),
                LongType::Retry => None,
            },
            Short { .. } => Some(SpaceId::Data),
            VersionNegotiate { .. } => None,
        }
    }

    pub(crate) fn dst_cid(&self) -> ConnectionId {
        self.plain_header.dst_cid()
    }

    /// Length of the packet being decoded
    pub(crate) fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    pub(crate) fn finish<H>(self, header_keys: Option<&H>) -> Result<Packet, PacketDecodeError>
    where
        H: crypto::HeaderKeys,
    {
        use self::PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        let header = match plain_header {
            Long {
                ty: LongType::Retry,
                dst_cid,
                src_cid,
                ..
            } => {
                let odcil = buf.get::<u8>()? & 0x0f;
                let orig_dst_cid = decode_cid(nibble_cid_len(odcil), &mut buf)?;
                let token_len = buf.get_ref().len() - buf.position() as usize;
                let token = buf.copy_to_bytes(token_len);
                Header::Retry {
                    dst_cid,
                    src_cid,
                    orig_dst_cid,
                    token,
                }
            }
            Long {
                ty,
                dst_cid,
                src_cid,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number: Self::decrypt_header(&mut buf, header_keys.unwrap())?,
            },
            Short { spin, dst_cid, .. } => {
                let number = Self::decrypt_header(&mut buf, header_keys.unwrap())?;
                let key_phase = buf.get_ref()[0] & KEY_PHASE_BIT != 0;
                Header::Short {
                    spin,
                    key_phase,
                    dst_cid,
                    number,
                }
            }
            VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => Header::VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            },
        };

        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        Ok(Packet {
            header,
            header_data: bytes.split_to(header_len).freeze(),
            payload: bytes,
        })
    }

    fn decrypt_header<H>(
        buf: &mut io::Cursor<BytesMut>,
        header_keys: &H,
    ) -> Result<PacketNumber, PacketDecodeError>
    where
        H: crypto::HeaderKeys,
    {
        let packet_length = buf.get_ref().len();
        let pn_offset = buf.position() as usize;
        if packet_length < pn_offset + 4 + header_keys.sample_size() {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to extract packet number protection sample",
            ));
        }

        header_keys.decrypt(pn_offset, buf.get_mut());

        let len = PacketNumber::decode_len(buf.get_ref()[0])?;
        PacketNumber::decode(len, buf)
    }
}

pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl Header {
    pub(crate) fn initial(
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    ) -> Self {
        Header::Long {
            ty: LongType::Initial,
            dst_cid,
            src_cid,
            number,
        }
    }

    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        let start = w.len();
        match *self {
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                debug_assert!(ty != LongType::Retry);
                w.write(LONG_HEADER_FORM | FIXED_BIT | (ty as u8) << 4 | number.tag());
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write::<u16>(0); // Payload length placeholder; see `set_payload_length`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some(number.len()),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                ref orig_dst_cid,
                ref token,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (LongType::Retry as u8) << 4);
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write(cid_len_nibble(orig_dst_cid));
                w.put_slice(orig_dst_cid);
                w.put_slice(token);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(
                    SHORT_FIXED_BITS
                        | if key_phase { KEY_PHASE_BIT } else { 0 }
                        | if spin { SPIN_BIT } else { 0 }
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some(number.len()),
                }
            }
            VersionNegotiate {
                random,
                ref dst_cid,
                ref src_cid,
            } => {
                w.write(LONG_HEADER_FORM | random);
                w.write::<u32>(0);
                Self::encode_cids(w, dst_cid, src_cid);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
        }
    }

    fn encode_cids<W: BufMut>(w: &mut W, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        w.put_u8(cid_len_nibble(dst_cid) << 4 | cid_len_nibble(src_cid));
        w.put_slice(dst_cid);
        w.put_slice(src_cid);
    }

    /// Whether the packet payload is protected by packet encryption
    pub(crate) fn is_protected(&self) -> bool {
        !matches!(
            *self,
            Header::Retry { .. } | Header::VersionNegotiate { .. }
        )
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        match *self {
            Long { number, .. } => Some(number),
            Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub(crate) fn space(&self) -> SpaceId {
        use self::Header::*;
        match *self {
            Short { .. } => SpaceId::Data,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => SpaceId::Data,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Initial,
        }
    }

    pub(crate) fn is_short(&self) -> bool {
        matches!(*self, Header::Short { .. })
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            *self,
            Header::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use self::Header::*;
        match *self {
            Long { ref dst_cid, .. } => dst_cid,
            Retry { ref dst_cid, .. } => dst_cid,
            Short { ref dst_cid, .. } => dst_cid,
            VersionNegotiate { ref dst_cid, .. } => dst_cid,
        }
    }
}

pub(crate) struct PartialEncode {
    pub(crate) start: usize,
    pub(crate) header_len: usize,
    // Packet number length, if one is present
    pn: Option<usize>,
}

impl PartialEncode {
    /// Apply packet number protection once the payload is in place
    pub(crate) fn finish<H>(self, buf: &mut [u8], header_keys: &H)
    where
        H: crypto::HeaderKeys,
    {
        let PartialEncode {
            start, header_len, ..
        } = self;
        let pn_len = match self.pn {
            Some(x) => x,
            None => return,
        };
        let pn_pos = start + header_len - pn_len;
        debug_assert!(
            pn_pos + 4 + header_keys.sample_size() <= buf.len(),
            "packet must be padded to at least {} bytes to sample for packet number protection",
            pn_pos + 4 + header_keys.sample_size()
        );
        header_keys.encrypt(pn_pos, buf);
    }
}

/// Write the payload length of a long header once the payload size is known
pub(crate) fn set_payload_length(buf: &mut [u8], header_len: usize, pn_len: usize, tag_len: usize) {
    let len = buf.len() - header_len + pn_len + tag_len;
    assert!(len < 2usize.pow(14)); // Fits in the two-byte placeholder
    let slice = &mut buf[header_len - pn_len - 2..header_len - pn_len];
    slice.copy_from_slice(&(len as u16 | 0b01 << 14).to_be_bytes());
}

#[derive(Debug)]
pub(crate) enum PlainHeader {
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Short {
        spin: bool,
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn dst_cid(&self) -> ConnectionId {
        use self::PlainHeader::*;
        match *self {
            Long { dst_cid, .. } => dst_cid,
            Short { dst_cid, .. } => dst_cid,
            VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        match *self {
            PlainHeader::Long {
                ty: LongType::Retry,
                ..
            } => None,
            PlainHeader::Long { len, .. } => Some(len),
            _ => None,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            if first & SHORT_FIXED_BITS != SHORT_FIXED_BITS {
                return Err(PacketDecodeError::InvalidHeader("fixed bits unset"));
            }
            let spin = first & SPIN_BIT != 0;
            let dst_cid = decode_cid(local_cid_len, buf)?;
            Ok(PlainHeader::Short { spin, dst_cid })
        } else {
            let version = buf.get::<u32>()?;

            let cil = buf.get::<u8>()?;
            let dst_cid = decode_cid(nibble_cid_len(cil >> 4), buf)?;
            let src_cid = decode_cid(nibble_cid_len(cil & 0x0f), buf)?;

            if version == 0 {
                let random = first & !LONG_HEADER_FORM;
                return Ok(PlainHeader::VersionNegotiate {
                    random,
                    dst_cid,
                    src_cid,
                });
            }

            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    source_cid: src_cid,
                    destination: dst_cid,
                    version,
                });
            }

            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }

            let ty = LongType::from_byte(first);
            let len = if ty == LongType::Retry {
                0
            } else {
                buf.get_var()?
            };
            Ok(PlainHeader::Long {
                ty,
                dst_cid,
                src_cid,
                len,
            })
        }
    }
}

/// Expand a connection ID length nibble; nonzero nibbles are offset by three
fn nibble_cid_len(nibble: u8) -> usize {
    debug_assert!(nibble <= 0x0f);
    match nibble {
        0 => 0,
        x => x as usize + 3,
    }
}

/// Compress a connection ID length into its nibble form
fn cid_len_nibble(cid: &ConnectionId) -> u8 {
    debug_assert!(cid.is_empty() || (MIN_CID_SIZE..=MAX_CID_SIZE).contains(&cid.len()));
    match cid.len() {
        0 => 0,
        x => (x - 3) as u8,
    }
}

fn decode_cid<R: Buf>(len: usize, buf: &mut R) -> Result<ConnectionId, PacketDecodeError> {
    if buf.remaining() < len {
        return Err(PacketDecodeError::InvalidHeader(
            "connection ID longer than packet",
        ));
    }
    let mut stage = [0; MAX_CID_SIZE];
    buf.copy_to_slice(&mut stage[..len]);
    Ok(ConnectionId::new(&stage[..len]))
}

/// A truncated packet number, encoded in the low 1, 2, or 4 bytes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl PacketNumber {
    /// Truncate a packet number against the largest acknowledged by the peer
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 32 {
            PacketNumber::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<PacketNumber, PacketDecodeError> {
        use self::PacketNumber::*;
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            4 => U32(r.get()?),
            _ => unreachable!(),
        };
        Ok(pn)
    }

    pub(crate) fn decode_len(tag: u8) -> Result<usize, PacketDecodeError> {
        match tag & 0b11 {
            0b00 => Ok(1),
            0b01 => Ok(2),
            0b10 => Ok(4),
            _ => Err(PacketDecodeError::InvalidHeader(
                "illegal packet number length",
            )),
        }
    }

    fn tag(self) -> u8 {
        use self::PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U32(_) => 0b10,
        }
    }

    /// Reconstruct the full packet number, choosing the candidate closest to `expected`
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use self::PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // Stripping the low bits of `expected` and substituting the truncated
        // value can land outside the window; shift by one period if so.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version {version:x}")]
    UnsupportedVersion {
        source_cid: ConnectionId,
        destination: ConnectionId,
        version: u32,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x40;
const SHORT_FIXED_BITS: u8 = 0x30;
pub(crate) const SPIN_BIT: u8 = 0x08;

/// Long packet types
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Initial = 0x0,
    ZeroRtt = 0x1,
    Handshake = 0x2,
    Retry = 0x3,
}

impl LongType {
    fn from_byte(b: u8) -> Self {
        use self::LongType::*;
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => ZeroRtt,
            0x2 => Handshake,
            0x3 => Retry,
            _ => unreachable!(),
        }
    }
}

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    Handshake = 1,
    /// Application data space, used for 0-RTT and post-handshake/1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub(crate) const VALUES: [Self; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];

    pub fn iter() -> impl Iterator<Item = Self> {
        Self::VALUES.iter().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io;

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn roundtrip_packet_numbers() {
        check_pn(PacketNumber::U8(0x7f), &hex!("7f"));
        check_pn(PacketNumber::U16(0x80), &hex!("0080"));
        check_pn(PacketNumber::U16(0x3fff), &hex!("3fff"));
        check_pn(PacketNumber::U32(0x0000_4000), &hex!("00004000"));
        check_pn(PacketNumber::U32(0xffff_ffff), &hex!("ffffffff"));
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, 0), &hex!("10"));
        check_pn(PacketNumber::new(0x100, 0), &hex!("0100"));
        check_pn(PacketNumber::new(0x10000, 0), &hex!("00010000"));
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(actual, PacketNumber::new(actual, expected).expand(expected));
            }
        }
    }

    #[test]
    fn pn_expand_window() {
        // Every value within half the encoding window of the expectation
        // reconstructs exactly
        for expected in 512u64..768 {
            for actual in (expected - 127)..(expected + 128) {
                assert_eq!(
                    actual,
                    PacketNumber::U8(actual as u8).expand(expected),
                    "pn {actual} expected {expected}"
                );
            }
        }
    }

    #[test]
    fn cid_nibbles() {
        assert_eq!(nibble_cid_len(0), 0);
        assert_eq!(nibble_cid_len(1), 4);
        assert_eq!(nibble_cid_len(15), 18);
        let cid = ConnectionId::new(&[0xab; 8]);
        assert_eq!(cid_len_nibble(&cid), 5);
    }

    #[test]
    fn short_header_roundtrip() {
        use crate::crypto::testing::NullHeaderKeys;
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let mut buf = Vec::new();
        let header = Header::Short {
            spin: true,
            key_phase: false,
            dst_cid: dcid,
            number: PacketNumber::U16(0x1234),
        };
        let encode = header.encode(&mut buf);
        buf.resize(buf.len() + 32, 0); // payload stand-in
        encode.finish(&mut buf, &NullHeaderKeys);

        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), dcid.len()).unwrap();
        assert!(rest.is_none());
        assert!(!decode.has_long_header());
        assert_eq!(decode.dst_cid(), dcid);
        let packet = decode.finish(Some(&NullHeaderKeys)).unwrap();
        match packet.header {
            Header::Short {
                spin: true,
                key_phase: false,
                number: PacketNumber::U16(0x1234),
                ..
            } => {}
            _ => panic!("unexpected header {:?}", packet.header),
        }
    }

    #[test]
    fn long_header_roundtrip() {
        use crate::crypto::testing::NullHeaderKeys;
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let scid = ConnectionId::new(&hex!("c0ffee00c0ffee00"));
        let mut buf = Vec::new();
        let header = Header::initial(dcid, scid, PacketNumber::U32(0xabcd));
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        buf.resize(header_len + 64, 0);
        set_payload_length(&mut buf, header_len, 4, 0);
        encode.finish(&mut buf, &NullHeaderKeys);

        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), 0).unwrap();
        assert!(rest.is_none());
        assert!(decode.is_initial());
        assert_eq!(decode.space(), Some(SpaceId::Initial));
        let packet = decode.finish(Some(&NullHeaderKeys)).unwrap();
        match packet.header {
            Header::Long {
                ty: LongType::Initial,
                number: PacketNumber::U32(0xabcd),
                dst_cid,
                src_cid,
            } => {
                assert_eq!(dst_cid, dcid);
                assert_eq!(src_cid, scid);
            }
            _ => panic!("unexpected header {:?}", packet.header),
        }
        assert_eq!(packet.payload.len(), 64);
    }

    #[test]
    fn unsupported_version() {
        let mut buf = Vec::new();
        buf.write::<u8>(LONG_HEADER_FORM | FIXED_BIT);
        buf.write::<u32>(0x0a1a_2a3a);
        buf.write::<u8>(0);
        match PartialDecode::new(buf.as_slice().into(), 0) {
            Err(PacketDecodeError::UnsupportedVersion {
                version: 0x0a1a_2a3a,
                ..
            }) => {}
            x => panic!("unexpected {x:?}"),
        }
    }
}
