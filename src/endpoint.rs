use std::{
    collections::VecDeque,
    fmt, iter,
    net::SocketAddr,
    ops::{Index, IndexMut},
    sync::Arc,
    time::Instant,
};

use bytes::BytesMut;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    coding::BufMutExt,
    config::{ClientConfig, ConfigError, EndpointConfig, ServerConfig},
    connection::{Connection, ConnectionError},
    crypto::{
        ClientConfig as _, PacketKeys, ServerConfig as _, Session,
    },
    frame,
    packet::{set_payload_length, Header, PacketDecodeError, PacketNumber, PartialDecode},
    shared::{
        ConnectionEvent, ConnectionEventInner, ConnectionId, EcnCodepoint, EndpointEvent,
        EndpointEventInner, IssuedCid, ResetToken, Transmit,
    },
    transport_parameters::TransportParameters,
    Side, TransportError, MAX_CID_SIZE, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE, VERSION,
};

/// The main entry point to the library
///
/// This object performs no I/O whatsoever. Instead, it routes incoming
/// datagrams to the `Connection` addressed by their destination connection
/// ID, creates new connections for unmatched Initial packets, and generates
/// the stateless packets - version negotiation, stateless reset, immediate
/// close - that require no connection state.
pub struct Endpoint<S>
where
    S: Session,
{
    rng: StdRng,
    transmits: VecDeque<Transmit>,
    /// Demux by the client-chosen CID that Initial and 0-RTT packets carry
    connection_ids_initial: FxHashMap<ConnectionId, ConnectionHandle>,
    connection_ids: FxHashMap<ConnectionId, ConnectionHandle>,
    /// Identifies connections with zero-length CIDs
    connection_remotes: FxHashMap<SocketAddr, ConnectionHandle>,
    /// Reset tokens provided by the peer for the CID each connection is currently sending to
    ///
    /// Incoming stateless resets do not have correct CIDs, so this is how the
    /// recipient connection, if any, is found.
    connection_reset_tokens: ResetTokenTable,
    connections: Slab<ConnectionMeta>,
    config: Arc<EndpointConfig<S>>,
    server_config: Option<Arc<ServerConfig<S>>>,
    incoming_handshakes: usize,
    /// Whether incoming connections should be unconditionally rejected
    reject_new_connections: bool,
}

impl<S> Endpoint<S>
where
    S: Session,
{
    /// Create a new endpoint
    ///
    /// Returns `Err` if the configuration is invalid.
    pub fn new(
        config: Arc<EndpointConfig<S>>,
        server_config: Option<Arc<ServerConfig<S>>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(ref server_config) = server_config {
            server_config.transport.validate()?;
        }
        Ok(Self {
            rng: StdRng::from_entropy(),
            transmits: VecDeque::new(),
            connection_ids_initial: FxHashMap::default(),
            connection_ids: FxHashMap::default(),
            connection_remotes: FxHashMap::default(),
            connection_reset_tokens: ResetTokenTable::default(),
            connections: Slab::new(),
            incoming_handshakes: 0,
            reject_new_connections: false,
            config,
            server_config,
        })
    }

    fn is_server(&self) -> bool {
        self.server_config.is_some()
    }

    /// Get the next stateless packet to transmit
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Process `EndpointEvent`s emitted from related `Connection`s
    ///
    /// In turn, processing this event may return a `ConnectionEvent` for the same `Connection`.
    pub fn handle_event(
        &mut self,
        ch: ConnectionHandle,
        event: EndpointEvent,
    ) -> Option<ConnectionEvent> {
        use EndpointEventInner::*;
        match event.0 {
            NeedIdentifiers(n) => {
                if self.config.local_cid_len != 0 {
                    return Some(self.send_new_identifiers(ch, n));
                }
            }
            ResetToken(token) => {
                let remote = self.connections[ch].initial_remote;
                if let Some(old) = self.connections[ch].reset_token.replace((remote, token)) {
                    self.connection_reset_tokens.remove(old.0, old.1);
                }
                if self.connection_reset_tokens.insert(remote, token, ch) {
                    debug!("duplicate reset token");
                }
            }
            Drained => {
                let conn = self.connections.remove(ch.0);
                if !conn.init_cid.is_empty() {
                    self.connection_ids_initial.remove(&conn.init_cid);
                }
                for cid in conn.loc_cids.values() {
                    self.connection_ids.remove(cid);
                }
                self.connection_remotes.remove(&conn.initial_remote);
                if let Some((remote, token)) = conn.reset_token {
                    self.connection_reset_tokens.remove(remote, token);
                }
            }
        }
        None
    }

    /// Process an incoming UDP datagram
    pub fn handle(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
    ) -> Option<(ConnectionHandle, DatagramEvent<S>)> {
        let datagram_len = data.len();
        let (first_decode, remaining) = match PartialDecode::new(data, self.config.local_cid_len) {
            Ok(x) => x,
            Err(PacketDecodeError::UnsupportedVersion {
                source_cid: source,
                destination,
                version,
            }) => {
                if !self.is_server() {
                    debug!("dropping packet with unsupported version");
                    return None;
                }
                trace!(version, "sending version negotiation");
                let mut buf = Vec::<u8>::new();
                Header::VersionNegotiate {
                    random: self.rng.gen::<u8>() | 0x40,
                    src_cid: destination,
                    dst_cid: source,
                }
                .encode(&mut buf);
                // Grease the version list with a reserved value
                if version != GREASE_VERSION {
                    buf.write::<u32>(GREASE_VERSION);
                } else {
                    buf.write::<u32>(GREASE_VERSION ^ 0x10);
                }
                buf.write::<u32>(VERSION);
                self.transmits.push_back(Transmit {
                    destination: remote,
                    ecn: None,
                    contents: buf.into(),
                });
                // The mismatched Initial never reached the connection, so its
                // receive state restarts; the client's next Initial reuses
                // packet number zero
                if let Some(&ch) = self.connection_ids_initial.get(&destination) {
                    return Some((
                        ch,
                        DatagramEvent::ConnectionEvent(ConnectionEvent(
                            ConnectionEventInner::ResetInitialNumbering { now },
                        )),
                    ));
                }
                return None;
            }
            Err(e) => {
                trace!("malformed header: {}", e);
                return None;
            }
        };

        //
        // Handle packet on existing connection, if any
        //

        let dst_cid = first_decode.dst_cid();
        let known_ch = {
            let ch = if self.config.local_cid_len > 0 {
                self.connection_ids.get(&dst_cid)
            } else {
                None
            };
            ch.or_else(|| {
                if first_decode.is_initial() || first_decode.is_0rtt() {
                    self.connection_ids_initial.get(&dst_cid)
                } else {
                    None
                }
            })
            .or_else(|| {
                if self.config.local_cid_len == 0 {
                    self.connection_remotes.get(&remote)
                } else {
                    None
                }
            })
            .or_else(|| {
                let data = first_decode.data();
                if data.len() < RESET_TOKEN_SIZE {
                    return None;
                }
                self.connection_reset_tokens
                    .get(remote, &data[data.len() - RESET_TOKEN_SIZE..])
            })
            .cloned()
        };
        if let Some(ch) = known_ch {
            return Some((
                ch,
                DatagramEvent::ConnectionEvent(ConnectionEvent(ConnectionEventInner::Datagram {
                    now,
                    remote,
                    ecn,
                    first_decode,
                    remaining,
                })),
            ));
        }

        //
        // Potentially create a new connection
        //

        if !self.is_server() {
            debug!("packet for unrecognized connection {}", dst_cid);
            return None;
        }

        if first_decode.has_long_header() {
            if !first_decode.is_initial() {
                debug!(
                    "ignoring non-initial packet for unknown connection {}",
                    dst_cid
                );
                return None;
            }
            if datagram_len < MIN_INITIAL_SIZE {
                debug!("ignoring short initial for connection {}", dst_cid);
                return None;
            }

            let crypto = S::initial_keys(&dst_cid, Side::Server);
            let header_keys = crypto.header_keys();
            return match first_decode.finish(Some(&header_keys)) {
                Ok(packet) => self
                    .handle_first_packet(now, remote, ecn, packet, remaining, &crypto)
                    .map(|(ch, conn)| (ch, DatagramEvent::NewConnection(conn))),
                Err(e) => {
                    trace!("unable to decode initial packet: {}", e);
                    None
                }
            };
        }

        //
        // If we got this far, we're a server receiving a seemingly valid
        // packet for an unknown connection. Send a stateless reset.
        //

        if !dst_cid.is_empty() {
            self.stateless_reset(datagram_len, remote, &dst_cid);
        } else {
            trace!("dropping unrecognized short packet without ID");
        }
        None
    }

    fn stateless_reset(
        &mut self,
        inciting_dgram_len: usize,
        remote: SocketAddr,
        dst_cid: &ConnectionId,
    ) {
        /// Minimum amount of padding for the reset to look like a short-header packet
        const MIN_PADDING_LEN: usize = 5;

        // Prevent amplification attacks and reset loops by ensuring we pad to
        // at most 1 byte smaller than the inciting packet.
        let max_padding_len = match inciting_dgram_len.checked_sub(RESET_TOKEN_SIZE) {
            Some(headroom) if headroom > MIN_PADDING_LEN => headroom - 1,
            _ => {
                debug!(
                    "ignoring unexpected {} byte packet: not larger than minimum stateless reset size",
                    inciting_dgram_len
                );
                return;
            }
        };

        debug!("sending stateless reset for {} to {}", dst_cid, remote);
        let mut buf = Vec::<u8>::new();
        // Resets with at least this much padding can't possibly be
        // distinguished from real packets
        const IDEAL_MIN_PADDING_LEN: usize = MIN_PADDING_LEN + MAX_CID_SIZE;
        let padding_len = if max_padding_len <= IDEAL_MIN_PADDING_LEN {
            max_padding_len
        } else {
            self.rng.gen_range(IDEAL_MIN_PADDING_LEN..max_padding_len)
        };
        buf.reserve_exact(padding_len + RESET_TOKEN_SIZE);
        buf.resize(padding_len, 0);
        self.rng.fill_bytes(&mut buf[0..padding_len]);
        // Indistinguishable from a short header, but careful to carry a legal
        // packet number length so receivers attempt (and fail) decryption
        // rather than discarding the packet as malformed
        buf[0] = (buf[0] & 0b0100_1100) | 0b0011_0000;
        buf.extend_from_slice(&ResetToken::new(&self.config.reset_key, dst_cid));

        debug_assert!(buf.len() < inciting_dgram_len);

        self.transmits.push_back(Transmit {
            destination: remote,
            ecn: None,
            contents: buf.into(),
        });
    }

    /// Initiate a connection
    pub fn connect(
        &mut self,
        now: Instant,
        config: ClientConfig<S>,
        remote: SocketAddr,
        server_name: &str,
    ) -> Result<(ConnectionHandle, Connection<S>), ConnectError> {
        if self.is_full() {
            return Err(ConnectError::TooManyConnections);
        }
        config.transport.validate()?;
        let remote_id = ConnectionId::random(&mut self.rng, MAX_CID_SIZE);
        trace!(initial_dcid = %remote_id, "connecting");
        self.add_connection(
            remote_id,
            remote_id,
            remote,
            ConnectionOpts::Client {
                config,
                server_name: server_name.into(),
            },
            now,
        )
    }

    fn send_new_identifiers(&mut self, ch: ConnectionHandle, num: u64) -> ConnectionEvent {
        let mut ids = vec![];
        for _ in 0..num {
            let id = self.new_cid();
            self.connection_ids.insert(id, ch);
            let meta = &mut self.connections[ch];
            meta.cids_issued += 1;
            let sequence = meta.cids_issued;
            meta.loc_cids.insert(sequence, id);
            ids.push(IssuedCid {
                sequence,
                id,
                reset_token: ResetToken::new(&self.config.reset_key, &id),
            });
        }
        ConnectionEvent(ConnectionEventInner::NewIdentifiers(ids))
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.rng, self.config.local_cid_len);
            if !self.connection_ids.contains_key(&cid) {
                break cid;
            }
            assert!(self.config.local_cid_len > 0);
        }
    }

    fn add_connection(
        &mut self,
        init_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddr,
        opts: ConnectionOpts<S>,
        now: Instant,
    ) -> Result<(ConnectionHandle, Connection<S>), ConnectError> {
        let loc_cid = self.new_cid();
        let (client_config, server_name, transport, params, tls) = match opts {
            ConnectionOpts::Client {
                config,
                server_name,
            } => {
                let params = TransportParameters::new(&config.transport);
                let tls = config.crypto.start_session(&server_name, &params)?;
                (
                    Some(config.clone()),
                    Some(server_name),
                    config.transport,
                    params,
                    tls,
                )
            }
            ConnectionOpts::Server => {
                let config = self.server_config.as_ref().unwrap();
                let params = TransportParameters {
                    stateless_reset_token: Some(ResetToken::new(
                        &self.config.reset_key,
                        &loc_cid,
                    )),
                    ..TransportParameters::new(&config.transport)
                };
                let tls = config.crypto.start_session(&params);
                (None, None, config.transport.clone(), params, tls)
            }
        };

        // The address a client dials is validated by construction
        let remote_validated = client_config.is_some();
        let conn = Connection::new(
            self.config.clone(),
            transport,
            init_cid,
            loc_cid,
            rem_cid,
            remote,
            client_config,
            server_name,
            params,
            tls,
            now,
            remote_validated,
        );
        let id = self.connections.insert(ConnectionMeta {
            init_cid,
            cids_issued: 0,
            loc_cids: iter::once((0, loc_cid)).collect(),
            initial_remote: remote,
            reset_token: None,
        });
        let ch = ConnectionHandle(id);

        if self.config.local_cid_len > 0 {
            self.connection_ids.insert(loc_cid, ch);
        } else {
            self.connection_remotes.insert(remote, ch);
        }
        Ok((ch, conn))
    }

    fn handle_first_packet(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        mut packet: crate::packet::Packet,
        rest: Option<BytesMut>,
        crypto: &S::Keys,
    ) -> Option<(ConnectionHandle, Connection<S>)> {
        let (src_cid, dst_cid, packet_number) = match packet.header {
            Header::Long {
                ty: crate::packet::LongType::Initial,
                src_cid,
                dst_cid,
                number,
            } => (src_cid, dst_cid, number),
            _ => panic!("non-initial packet in handle_first_packet()"),
        };
        let packet_number = packet_number.expand(0);

        if crypto
            .open(packet_number, &packet.header_data, &mut packet.payload)
            .is_err()
        {
            debug!(packet_number, "failed to authenticate initial packet");
            return None;
        };

        // Local CID used for stateless replies
        let temp_loc_cid = self.new_cid();
        let server_config = self.server_config.as_ref().unwrap();

        if self.incoming_handshakes == server_config.accept_buffer as usize
            || self.reject_new_connections
            || self.is_full()
        {
            debug!("rejecting connection due to full accept buffer");
            self.initial_close(
                remote,
                crypto,
                &src_cid,
                &temp_loc_cid,
                TransportError::SERVER_BUSY(""),
            );
            return None;
        }

        if dst_cid.len() < 8 {
            debug!(
                "rejecting connection due to invalid DCID length {}",
                dst_cid.len()
            );
            self.initial_close(
                remote,
                crypto,
                &src_cid,
                &temp_loc_cid,
                TransportError::PROTOCOL_VIOLATION("invalid destination CID length"),
            );
            return None;
        }

        let (ch, mut conn) = self
            .add_connection(dst_cid, src_cid, remote, ConnectionOpts::Server, now)
            .unwrap();
        if !dst_cid.is_empty() {
            self.connection_ids_initial.insert(dst_cid, ch);
        }
        match conn.handle_first_packet(now, remote, ecn, packet_number, packet, rest) {
            Ok(()) => {
                trace!(id = ch.0, icid = %dst_cid, "connection incoming");
                self.incoming_handshakes += 1;
                Some((ch, conn))
            }
            Err(e) => {
                debug!("handshake failed: {}", e);
                self.handle_event(ch, EndpointEvent(EndpointEventInner::Drained));
                if let ConnectionError::TransportError(e) = e {
                    self.initial_close(remote, crypto, &src_cid, &temp_loc_cid, e);
                }
                None
            }
        }
    }

    fn initial_close(
        &mut self,
        destination: SocketAddr,
        crypto: &S::Keys,
        remote_id: &ConnectionId,
        local_id: &ConnectionId,
        reason: TransportError,
    ) {
        let number = PacketNumber::U8(0);
        let header = Header::initial(*remote_id, *local_id, number);

        let mut buf = Vec::<u8>::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        let max_len = MIN_INITIAL_SIZE - header_len - crypto.tag_len();
        frame::Close::from(reason).encode(&mut buf, max_len);
        set_payload_length(&mut buf, header_len, number.len(), crypto.tag_len());
        crypto.seal(0, &mut buf, header_len);
        let header_keys = crypto.header_keys();
        partial_encode.finish(&mut buf, &header_keys);
        self.transmits.push_back(Transmit {
            destination,
            ecn: None,
            contents: buf.into(),
        })
    }

    /// Free a handshake slot for reuse
    ///
    /// Every time a [`DatagramEvent::NewConnection`] is yielded by `handle`, a
    /// slot is consumed, up to a limit of [`ServerConfig::accept_buffer`].
    /// Calling this indicates the application's acceptance of that connection
    /// and releases the slot for reuse.
    pub fn accept(&mut self) {
        // Don't overflow if a buggy caller invokes this too many times.
        self.incoming_handshakes = self.incoming_handshakes.saturating_sub(1);
    }

    /// Unconditionally reject future incoming connections
    pub fn reject_new_connections(&mut self) {
        self.reject_new_connections = true;
    }

    /// Access the configuration used by this endpoint
    pub fn config(&self) -> &EndpointConfig<S> {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn known_connections(&self) -> usize {
        self.connections.len()
    }

    /// Whether we've used up 3/4 of the available CID space
    fn is_full(&self) -> bool {
        self.config.local_cid_len <= 4
            && self.config.local_cid_len != 0
            && (2usize.pow(self.config.local_cid_len as u32 * 8) - self.connection_ids.len())
                < 2usize.pow(self.config.local_cid_len as u32 * 8 - 2)
    }
}

impl<S> fmt::Debug for Endpoint<S>
where
    S: Session,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Endpoint")
            .field("connections", &self.connections.len())
            .field("incoming_handshakes", &self.incoming_handshakes)
            .field("reject_new_connections", &self.reject_new_connections)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct ConnectionMeta {
    init_cid: ConnectionId,
    /// Number of local connection IDs issued in NEW_CONNECTION_ID frames
    cids_issued: u64,
    loc_cids: FxHashMap<u64, ConnectionId>,
    /// Remote address the connection began with
    initial_remote: SocketAddr,
    /// Reset token provided by the peer for the CID we're currently sending
    /// to, and the address being sent to
    reset_token: Option<(SocketAddr, ResetToken)>,
}

/// Internal identifier for a `Connection` currently associated with an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

impl Index<ConnectionHandle> for Slab<ConnectionMeta> {
    type Output = ConnectionMeta;
    fn index(&self, ch: ConnectionHandle) -> &ConnectionMeta {
        &self[ch.0]
    }
}

impl IndexMut<ConnectionHandle> for Slab<ConnectionMeta> {
    fn index_mut(&mut self, ch: ConnectionHandle) -> &mut ConnectionMeta {
        &mut self[ch.0]
    }
}

/// Event resulting from processing a single datagram
#[allow(clippy::large_enum_variant)]
pub enum DatagramEvent<S>
where
    S: Session,
{
    /// The datagram is redirected to its `Connection`
    ConnectionEvent(ConnectionEvent),
    /// The datagram has resulted in starting a new `Connection`
    NewConnection(Connection<S>),
}

enum ConnectionOpts<S: Session> {
    Client {
        config: ClientConfig<S>,
        server_name: String,
    },
    Server,
}

/// Errors in the parameters being used to create a new connection
///
/// These arise before any I/O has been performed.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConnectError {
    /// The number of active connections on the local endpoint is at the limit
    ///
    /// Try a larger `EndpointConfig::local_cid_len`.
    #[error("too many connections")]
    TooManyConnections,
    /// The domain name supplied was malformed
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
    /// The transport configuration was invalid
    #[error("transport configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Default, Debug)]
struct ResetTokenTable(FxHashMap<SocketAddr, FxHashMap<ResetToken, ConnectionHandle>>);

impl ResetTokenTable {
    fn insert(&mut self, remote: SocketAddr, token: ResetToken, ch: ConnectionHandle) -> bool {
        self.0
            .entry(remote)
            .or_default()
            .insert(token, ch)
            .is_some()
    }

    fn remove(&mut self, remote: SocketAddr, token: ResetToken) {
        use std::collections::hash_map::Entry;
        match self.0.entry(remote) {
            Entry::Vacant(_) => {}
            Entry::Occupied(mut e) => {
                e.get_mut().remove(&token);
                if e.get().is_empty() {
                    e.remove_entry();
                }
            }
        }
    }

    fn get(&self, remote: SocketAddr, token: &[u8]) -> Option<&ConnectionHandle> {
        let token = ResetToken::from(<[u8; RESET_TOKEN_SIZE]>::try_from(token).ok()?);
        self.0.get(&remote)?.get(&token)
    }
}

/// Reserved version used to exercise peers' version negotiation handling
const GREASE_VERSION: u32 = 0x0a1a_2a3a;
