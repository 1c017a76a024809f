use std::{fmt, net::SocketAddr, ops, time::Instant};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

use crate::coding::{self, BufExt, BufMutExt};
use crate::packet::PartialDecode;
use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Events sent from an Endpoint to a Connection
#[derive(Debug)]
pub struct ConnectionEvent(pub(crate) ConnectionEventInner);

#[derive(Debug)]
pub(crate) enum ConnectionEventInner {
    /// A datagram has been received for the Connection
    Datagram {
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        first_decode: PartialDecode,
        remaining: Option<BytesMut>,
    },
    /// New connection identifiers have been issued for the Connection
    NewIdentifiers(Vec<IssuedCid>),
    /// A version negotiation packet was emitted for this connection's initial
    /// destination ID; receive tracking restarts from packet number zero
    ResetInitialNumbering { now: Instant },
}

/// Events sent from a Connection to an Endpoint
#[derive(Debug)]
pub struct EndpointEvent(pub(crate) EndpointEventInner);

impl EndpointEvent {
    /// Construct an event that indicating that a `Connection` will no longer emit events
    ///
    /// Useful for notifying an `Endpoint` that a `Connection` has been destroyed outside of the
    /// usual state machine flow.
    pub fn drained() -> Self {
        Self(EndpointEventInner::Drained)
    }

    /// Determine whether this is the last event a `Connection` will emit
    pub fn is_drained(&self) -> bool {
        matches!(self.0, EndpointEventInner::Drained)
    }
}

#[derive(Debug)]
pub(crate) enum EndpointEventInner {
    /// The connection has been drained
    Drained,
    /// The peer supplied a stateless reset token for the connection ID we address it by
    ResetToken(ResetToken),
    /// The connection needs connection identifiers to offer its peer
    NeedIdentifiers(u64),
}

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    pub(crate) fn new(key: &impl crate::crypto::HmacKey, id: &ConnectionId) -> Self {
        let signature = key.sign(id);
        let mut result = [0; RESET_TOKEN_SIZE];
        result.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
        result.into()
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq<[u8]> for ResetToken {
    fn eq(&self, other: &[u8]) -> bool {
        &self.0[..] == other
    }
}

/// A connection ID newly issued by the endpoint on a connection's behalf
#[derive(Debug, Copy, Clone)]
pub(crate) struct IssuedCid {
    pub(crate) sequence: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

/// Explicit congestion notification codepoint
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EcnCodepoint {
    /// The ECT(0) codepoint, indicating that an endpoint is ECN-capable
    Ect0 = 0b10,
    /// The ECT(1) codepoint, indicating that an endpoint is ECN-capable
    Ect1 = 0b01,
    /// The CE codepoint, signalling that congestion was experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    /// Extract the codepoint from the low bits of an IP TOS field
    pub fn from_bits(x: u8) -> Option<Self> {
        use EcnCodepoint::*;
        Some(match x & 0b11 {
            0b10 => Ect0,
            0b01 => Ect1,
            0b11 => Ce,
            _ => {
                return None;
            }
        })
    }
}

/// An outgoing UDP datagram, ready for the socket
#[derive(Debug)]
pub struct Transmit {
    /// The socket address to send the datagram to
    pub destination: SocketAddr,
    /// Explicit congestion notification bits to set on the packet
    pub ecn: Option<EcnCodepoint>,
    /// Contents of the datagram
    pub contents: Box<[u8]>,
}

impl coding::Codec for ConnectionId {
    /// Decodes a length-prefixed connection ID, as used away from packet headers
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        let mut stage = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut stage[..len]);
        Ok(ConnectionId::new(&stage[..len]))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.len);
        buf.put_slice(self);
    }
}
