//! Interfaces to the cryptographic oracles backing a connection
//!
//! The protocol logic is generic over the TLS implementation and the AEAD
//! used for packet protection. This module defines the traits a backend
//! must supply: a handshake [`Session`] that consumes and produces
//! handshake bytes and yields keys as encryption levels become ready,
//! [`PacketKeys`] sealing and opening packet payloads, [`HeaderKeys`]
//! protecting packet numbers, and an [`HmacKey`] for deriving stateless
//! reset tokens.

use bytes::BytesMut;

use crate::{
    endpoint::ConnectError, shared::ConnectionId, transport_parameters::TransportParameters,
    Side, TransportError,
};

/// A cryptographic handshake (commonly TLS 1.3)
pub trait Session: Sized {
    /// Type used to hold configuration for client sessions
    type ClientConfig: ClientConfig<Self>;
    /// Type used to hold configuration for server sessions
    type ServerConfig: ServerConfig<Self>;
    /// Keys used to protect packet payloads at one encryption level
    type Keys: PacketKeys<HeaderKeys = Self::HeaderKeys>;
    /// Keys used to protect packet numbers
    type HeaderKeys: HeaderKeys;
    /// Type used to sign stateless reset tokens
    type HmacKey: HmacKey;

    /// Derive keys for the Initial encryption level from the first
    /// destination connection ID chosen by the client
    fn initial_keys(id: &ConnectionId, side: Side) -> Self::Keys;

    /// Accept handshake bytes delivered in CRYPTO frames
    fn read_handshake(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Produce handshake bytes for the current encryption level
    ///
    /// Returns keys for the next level once the handshake has progressed
    /// far enough to derive them. Call repeatedly until no bytes are
    /// emitted.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Self::Keys>;

    /// Returns `true` until the handshake has completed
    fn is_handshaking(&self) -> bool;

    /// The peer's transport parameters, once its first flight has been read
    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError>;

    /// 0-RTT keys, if early data is possible
    fn early_crypto(&self) -> Option<Self::Keys>;

    /// Whether the peer accepted data protected with the 0-RTT keys
    ///
    /// `None` until the handshake has progressed far enough to know.
    fn early_data_accepted(&self) -> Option<bool>;
}

/// Client-side configuration for the handshake
pub trait ClientConfig<S: Session>: Clone {
    /// Begin a handshake with a server identified by `server_name`,
    /// conveying the local transport parameters
    fn start_session(
        &self,
        server_name: &str,
        params: &TransportParameters,
    ) -> Result<S, ConnectError>;
}

/// Server-side configuration for the handshake
pub trait ServerConfig<S: Session>: Clone + Send + Sync {
    /// Begin a handshake with a newly connecting client
    fn start_session(&self, params: &TransportParameters) -> S;
}

/// AEAD keys protecting packet payloads at a single encryption level
pub trait PacketKeys: Sized + Send {
    /// Keys protecting packet numbers at the same level
    type HeaderKeys: HeaderKeys;

    /// Seal the payload in place, appending the authentication tag
    ///
    /// `buf[..header_len]` is the packet header, used as associated data.
    fn seal(&self, packet: u64, buf: &mut Vec<u8>, header_len: usize);

    /// Open the payload in place, verifying and stripping the tag
    fn open(&self, packet: u64, header: &[u8], payload: &mut BytesMut) -> Result<(), CryptoError>;

    /// Derive packet number protection keys for this level
    fn header_keys(&self) -> Self::HeaderKeys;

    /// Length of the authentication tag appended to sealed payloads
    fn tag_len(&self) -> usize;
}

/// Keys protecting packet numbers
pub trait HeaderKeys: Send {
    /// Unmask the packet number starting at `pn_offset`
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Mask the packet number starting at `pn_offset`
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Bytes of ciphertext sampled to generate the mask
    fn sample_size(&self) -> usize;
}

/// A key for signing with HMAC-based algorithms
pub trait HmacKey: Send + Sync {
    /// Signatures produced by `sign`
    type Signature: AsRef<[u8]>;
    /// Sign `data`
    fn sign(&self, data: &[u8]) -> Self::Signature;
}

/// A packet failed to authenticate
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CryptoError;

/// Keys bundled with their packet number protection, as stored per space
pub(crate) struct CryptoSpace<K: PacketKeys> {
    pub(crate) packet: K,
    pub(crate) header: K::HeaderKeys,
}

impl<K: PacketKeys> CryptoSpace<K> {
    pub(crate) fn new(packet: K) -> Self {
        Self {
            header: packet.header_keys(),
            packet,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A deterministic stand-in for the TLS and AEAD oracles
    //!
    //! The handshake is a fixed two-flight script carrying real transport
    //! parameters; payload protection appends a checksum tag bound to the
    //! encryption level, so packets opened with the wrong level's keys fail
    //! to authenticate just as they would under a real AEAD.

    use std::collections::VecDeque;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::coding::{BufExt, BufMutExt};

    pub(crate) const TAG_LEN: usize = 16;

    const MSG_CLIENT_HELLO: u8 = 1;
    const MSG_SERVER_HELLO: u8 = 2;
    const MSG_SERVER_FINISHED: u8 = 3;
    const MSG_CLIENT_FINISHED: u8 = 4;

    /// Encryption level tags baked into authentication tags
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub(crate) enum Level {
        Initial = 0,
        ZeroRtt = 1,
        Handshake = 2,
        Data = 3,
    }

    pub(crate) struct TestingSession {
        side: Side,
        params: TransportParameters,
        peer_params: Option<TransportParameters>,
        recv_buf: Vec<u8>,
        actions: VecDeque<Action>,
        handshaking: bool,
        enable_early: bool,
        early_accepted: Option<bool>,
    }

    enum Action {
        Write(Vec<u8>),
        Keys(Level),
    }

    fn message(ty: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + body.len());
        out.write(ty);
        out.write::<u16>(body.len() as u16);
        out.put_slice(body);
        out
    }

    impl TestingSession {
        fn new(side: Side, params: TransportParameters, enable_early: bool) -> Self {
            let mut this = Self {
                side,
                params,
                peer_params: None,
                recv_buf: Vec::new(),
                actions: VecDeque::new(),
                handshaking: true,
                enable_early,
                early_accepted: None,
            };
            if side.is_client() {
                let mut body = Vec::new();
                this.params.write(Side::Client, &mut body);
                this.actions.push_back(Action::Write(message(MSG_CLIENT_HELLO, &body)));
            }
            this
        }

        fn handle_message(&mut self, ty: u8, body: &[u8]) -> Result<(), TransportError> {
            match (self.side, ty) {
                (Side::Server, MSG_CLIENT_HELLO) => {
                    let params = TransportParameters::read(Side::Client, &mut &body[..])
                        .map_err(|_| TransportError::crypto(47, "malformed client params"))?;
                    self.peer_params = Some(params);
                    let mut sh = Vec::new();
                    sh.write::<u8>(self.enable_early as u8);
                    self.params.write(Side::Server, &mut sh);
                    self.actions.push_back(Action::Write(message(MSG_SERVER_HELLO, &sh)));
                    self.actions.push_back(Action::Keys(Level::Handshake));
                    self.actions
                        .push_back(Action::Write(message(MSG_SERVER_FINISHED, &[])));
                }
                (Side::Server, MSG_CLIENT_FINISHED) => {
                    self.handshaking = false;
                    self.actions.push_back(Action::Keys(Level::Data));
                }
                (Side::Client, MSG_SERVER_HELLO) => {
                    let mut r = &body[..];
                    let accepted = BufExt::get::<u8>(&mut r).map_err(|_| {
                        TransportError::crypto(50, "truncated server hello")
                    })? != 0;
                    self.early_accepted = Some(self.enable_early && accepted);
                    let params = TransportParameters::read(Side::Server, &mut r)
                        .map_err(|_| TransportError::crypto(47, "malformed server params"))?;
                    self.peer_params = Some(params);
                    self.actions.push_back(Action::Keys(Level::Handshake));
                }
                (Side::Client, MSG_SERVER_FINISHED) => {
                    self.handshaking = false;
                    self.actions
                        .push_back(Action::Write(message(MSG_CLIENT_FINISHED, &[])));
                    self.actions.push_back(Action::Keys(Level::Data));
                }
                _ => {
                    return Err(TransportError::crypto(10, "unexpected handshake message"));
                }
            }
            Ok(())
        }
    }

    impl Session for TestingSession {
        type ClientConfig = TestingClientConfig;
        type ServerConfig = TestingServerConfig;
        type Keys = TestingKeys;
        type HeaderKeys = NullHeaderKeys;
        type HmacKey = TrivialHmacKey;

        fn initial_keys(id: &ConnectionId, _side: Side) -> TestingKeys {
            TestingKeys {
                level: Level::Initial,
                cid_mix: id.iter().fold(0, |acc, &x| acc ^ x),
            }
        }

        fn read_handshake(&mut self, buf: &[u8]) -> Result<(), TransportError> {
            self.recv_buf.extend_from_slice(buf);
            loop {
                if self.recv_buf.len() < 3 {
                    return Ok(());
                }
                let len = u16::from_be_bytes([self.recv_buf[1], self.recv_buf[2]]) as usize;
                if self.recv_buf.len() < 3 + len {
                    return Ok(());
                }
                let msg = self.recv_buf.drain(..3 + len).collect::<Vec<_>>();
                self.handle_message(msg[0], &msg[3..])?;
            }
        }

        fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<TestingKeys> {
            match self.actions.pop_front() {
                Some(Action::Write(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    None
                }
                Some(Action::Keys(level)) => Some(TestingKeys { level, cid_mix: 0 }),
                None => None,
            }
        }

        fn is_handshaking(&self) -> bool {
            self.handshaking
        }

        fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError> {
            Ok(self.peer_params)
        }

        fn early_crypto(&self) -> Option<TestingKeys> {
            if !self.enable_early {
                return None;
            }
            // Clients may write 0-RTT immediately; servers can read it once
            // they've seen the client's first flight
            if self.side.is_server() && self.peer_params.is_none() {
                return None;
            }
            Some(TestingKeys {
                level: Level::ZeroRtt,
                cid_mix: 0,
            })
        }

        fn early_data_accepted(&self) -> Option<bool> {
            self.early_accepted
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct TestingClientConfig {
        pub(crate) params_override: Option<TransportParameters>,
        pub(crate) enable_early: bool,
    }

    impl ClientConfig<TestingSession> for TestingClientConfig {
        fn start_session(
            &self,
            _server_name: &str,
            params: &TransportParameters,
        ) -> Result<TestingSession, ConnectError> {
            let params = self.params_override.unwrap_or(*params);
            Ok(TestingSession::new(Side::Client, params, self.enable_early))
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct TestingServerConfig {
        pub(crate) accept_early: bool,
    }

    impl ServerConfig<TestingSession> for TestingServerConfig {
        fn start_session(&self, params: &TransportParameters) -> TestingSession {
            TestingSession::new(Side::Server, *params, self.accept_early)
        }
    }

    /// Payload protection that appends a checksum tag bound to the level
    #[derive(Debug, Copy, Clone)]
    pub(crate) struct TestingKeys {
        level: Level,
        cid_mix: u8,
    }

    impl TestingKeys {
        fn tag(&self, packet: u64, header: &[u8], payload: &[u8]) -> [u8; TAG_LEN] {
            let mut acc = [0u8; TAG_LEN];
            for (i, &b) in header.iter().chain(payload.iter()).enumerate() {
                acc[i % TAG_LEN] ^= b;
            }
            acc[0] ^= self.level as u8;
            acc[1] ^= self.cid_mix;
            for (i, b) in packet.to_be_bytes().into_iter().enumerate() {
                acc[8 + i] ^= b;
            }
            acc
        }
    }

    impl PacketKeys for TestingKeys {
        type HeaderKeys = NullHeaderKeys;

        fn seal(&self, packet: u64, buf: &mut Vec<u8>, header_len: usize) {
            let (header, payload) = buf.split_at(header_len);
            let tag = self.tag(packet, header, payload);
            buf.extend_from_slice(&tag);
        }

        fn open(
            &self,
            packet: u64,
            header: &[u8],
            payload: &mut BytesMut,
        ) -> Result<(), CryptoError> {
            if payload.len() < TAG_LEN {
                return Err(CryptoError);
            }
            let plain_len = payload.len() - TAG_LEN;
            let expected = self.tag(packet, header, &payload[..plain_len]);
            if expected[..] != payload[plain_len..] {
                return Err(CryptoError);
            }
            payload.truncate(plain_len);
            Ok(())
        }

        fn header_keys(&self) -> NullHeaderKeys {
            NullHeaderKeys
        }

        fn tag_len(&self) -> usize {
            TAG_LEN
        }
    }

    /// Packet number protection that leaves packets alone
    #[derive(Debug, Copy, Clone)]
    pub(crate) struct NullHeaderKeys;

    impl HeaderKeys for NullHeaderKeys {
        fn decrypt(&self, _pn_offset: usize, _packet: &mut [u8]) {}
        fn encrypt(&self, _pn_offset: usize, _packet: &mut [u8]) {}
        fn sample_size(&self) -> usize {
            0
        }
    }

    pub(crate) struct TrivialHmacKey(pub(crate) [u8; 32]);

    impl HmacKey for TrivialHmacKey {
        type Signature = [u8; 32];
        fn sign(&self, data: &[u8]) -> [u8; 32] {
            let mut out = self.0;
            for (i, &b) in data.iter().enumerate() {
                out[i % 32] = out[i % 32].wrapping_add(b).rotate_left(3);
            }
            out
        }
    }
}
