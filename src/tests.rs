use std::cmp;
use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use bytes::Bytes;
use tracing::{info, trace};

use super::*;
use crate::crypto::testing::{
    TestingClientConfig, TestingServerConfig, TestingSession, TrivialHmacKey,
};

fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trace".into()),
        )
        .with_test_writer()
        .try_init();
}

fn endpoint_config() -> Arc<EndpointConfig<TestingSession>> {
    Arc::new(EndpointConfig::new(TrivialHmacKey([0xab; 32])))
}

fn server_config() -> ServerConfig<TestingSession> {
    ServerConfig::new(TestingServerConfig::default())
}

fn client_config() -> ClientConfig<TestingSession> {
    ClientConfig {
        crypto: TestingClientConfig::default(),
        transport: Arc::new(TransportConfig::default()),
    }
}

struct Pair {
    server: TestEndpoint,
    client: TestEndpoint,
    time: Instant,
    /// One-way packet transit time
    latency: Duration,
}

impl Default for Pair {
    fn default() -> Self {
        Pair::new(endpoint_config(), server_config())
    }
}

impl Pair {
    fn new(
        endpoint_config: Arc<EndpointConfig<TestingSession>>,
        server_config: ServerConfig<TestingSession>,
    ) -> Self {
        subscribe();
        let server = Endpoint::new(endpoint_config.clone(), Some(Arc::new(server_config))).unwrap();
        let client = Endpoint::new(endpoint_config, None).unwrap();

        let server_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);
        let client_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 44433);
        Self {
            server: TestEndpoint::new(server, server_addr),
            client: TestEndpoint::new(client, client_addr),
            time: Instant::now(),
            latency: Duration::new(0, 0),
        }
    }

    fn connect(&mut self) {
        info!("connecting");
        let (ch, conn) = self
            .client
            .endpoint
            .connect(self.time, client_config(), self.server.addr, "localhost")
            .unwrap();
        self.client.attach(ch, conn);
        self.drive();
        assert_matches!(self.client_conn().poll(), Some(Event::Connected));
        assert_matches!(self.server_conn().poll(), Some(Event::Connected));
    }

    /// Process I/O until the pair is quiescent; does not advance time
    fn drive(&mut self) {
        for _ in 0..100 {
            let client_busy = self.drive_side(Side::Client);
            let server_busy = self.drive_side(Side::Server);
            if !client_busy && !server_busy {
                return;
            }
        }
        panic!("pair failed to quiesce");
    }

    fn drive_side(&mut self, side: Side) -> bool {
        let time = self.time;
        let latency = self.latency;
        let (this, other) = match side {
            Side::Client => (&mut self.client, &mut self.server),
            Side::Server => (&mut self.server, &mut self.client),
        };
        let remote = other.addr;
        this.drive(time, remote);
        let mut busy = false;
        for transmit in this.outbound.drain(..) {
            busy = true;
            trace!(len = transmit.contents.len(), ?side, "delivering datagram");
            other
                .inbound
                .push_back((time + latency, transmit.ecn, transmit.contents.into()));
        }
        busy
    }

    /// Advance time to the earliest armed timer or queued delivery
    fn advance(&mut self) -> bool {
        let next = [self.client.next_wakeup(), self.server.next_wakeup()]
            .into_iter()
            .flatten()
            .min();
        match next {
            Some(t) => {
                self.time = cmp::max(self.time, t);
                true
            }
            None => false,
        }
    }

    /// Advance repeatedly until neither side has anything left to do
    fn drive_to_idle(&mut self) {
        for _ in 0..100 {
            self.drive();
            if !self.advance() {
                return;
            }
        }
        panic!("endpoints did not go idle");
    }

    fn client_conn(&mut self) -> &mut Connection<TestingSession> {
        self.client.conn.as_mut().unwrap()
    }

    fn server_conn(&mut self) -> &mut Connection<TestingSession> {
        self.server.conn.as_mut().unwrap()
    }
}

struct TestEndpoint {
    endpoint: Endpoint<TestingSession>,
    addr: SocketAddr,
    ch: Option<ConnectionHandle>,
    conn: Option<Connection<TestingSession>>,
    timers: [Option<Instant>; 4],
    inbound: VecDeque<(Instant, Option<EcnCodepoint>, Box<[u8]>)>,
    outbound: VecDeque<Transmit>,
}

impl TestEndpoint {
    fn new(endpoint: Endpoint<TestingSession>, addr: SocketAddr) -> Self {
        Self {
            endpoint,
            addr,
            ch: None,
            conn: None,
            timers: [None; 4],
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    fn attach(&mut self, ch: ConnectionHandle, conn: Connection<TestingSession>) {
        self.ch = Some(ch);
        self.conn = Some(conn);
    }

    fn drive(&mut self, now: Instant, remote: SocketAddr) {
        while self
            .inbound
            .front()
            .map_or(false, |(arrival, _, _)| *arrival <= now)
        {
            let (_, ecn, data) = self.inbound.pop_front().unwrap();
            if let Some((ch, event)) = self.endpoint.handle(now, remote, ecn, data[..].into()) {
                match event {
                    DatagramEvent::NewConnection(conn) => {
                        self.endpoint.accept();
                        self.attach(ch, conn);
                    }
                    DatagramEvent::ConnectionEvent(event) => {
                        if let Some(conn) = &mut self.conn {
                            conn.handle_event(event);
                        }
                    }
                }
            }
        }

        if let Some(conn) = &mut self.conn {
            let ch = self.ch.unwrap();
            for &timer in Timer::VALUES.iter() {
                if self.timers[timer as usize].map_or(false, |t| t <= now) {
                    trace!(?timer, "timeout");
                    self.timers[timer as usize] = None;
                    conn.handle_timeout(now, timer);
                }
            }
            loop {
                let mut keep_going = false;
                while let Some(TimerUpdate { timer, update }) = conn.poll_timers() {
                    self.timers[timer as usize] = match update {
                        TimerSetting::Start(time) => Some(time),
                        TimerSetting::Stop => None,
                    };
                }
                while let Some(event) = conn.poll_endpoint_events() {
                    if let Some(event) = self.endpoint.handle_event(ch, event) {
                        conn.handle_event(event);
                        keep_going = true;
                    }
                }
                if !keep_going {
                    break;
                }
            }
            while let Some(transmit) = conn.poll_transmit(now) {
                self.outbound.push_back(transmit);
            }
        }
        while let Some(transmit) = self.endpoint.poll_transmit() {
            self.outbound.push_back(transmit);
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let timer = self.timers.iter().flatten().min().copied();
        let delivery = self.inbound.front().map(|(arrival, _, _)| *arrival);
        [timer, delivery].into_iter().flatten().min()
    }
}

#[test]
fn handshake() {
    let mut pair = Pair::default();
    pair.connect();
    assert!(!pair.client_conn().is_handshaking());
    assert!(!pair.server_conn().is_handshaking());
}

#[test]
fn stream_reassembly_and_fin() {
    let mut pair = Pair::default();
    pair.connect();

    let s = pair.client_conn().open(Directionality::Bi).unwrap();
    assert_eq!(pair.client_conn().write(s, b"hello").unwrap(), 5);
    pair.drive();
    assert_eq!(pair.client_conn().write(s, b"world").unwrap(), 5);
    pair.client_conn().finish(s);
    pair.drive();

    assert_matches!(pair.server_conn().poll(), Some(Event::StreamOpened));
    assert_eq!(pair.server_conn().accept(), Some(s));
    let mut buf = [0; 16];
    assert_eq!(pair.server_conn().read(s, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"helloworld");
    assert_matches!(
        pair.server_conn().read(s, &mut buf),
        Err(ReadError::Finished)
    );

    // The sender learns its data arrived
    pair.drive();
    let mut finished = false;
    while let Some(event) = pair.client_conn().poll() {
        if matches!(event, Event::StreamFinished { stream } if stream == s) {
            finished = true;
        }
    }
    assert!(finished);
}

#[test]
fn out_of_order_delivery() {
    let mut pair = Pair::default();
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    pair.client_conn().write(s, b"hello").unwrap();
    pair.drive_side(Side::Client);
    // Hold the first data packet back
    let held = pair.server.inbound.pop_back().unwrap();
    pair.client_conn().write(s, b"world").unwrap();
    pair.drive_side(Side::Client);
    pair.server.inbound.push_back(held);
    pair.drive();

    assert_matches!(pair.server_conn().poll(), Some(Event::StreamOpened));
    let mut buf = [0; 16];
    assert_eq!(pair.server_conn().read(s, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"helloworld");
}

#[test]
fn stream_flow_control_violation() {
    let mut config = server_config();
    config.transport = Arc::new(TransportConfig {
        stream_receive_window: 10,
        ..TransportConfig::default()
    });
    let mut pair = Pair::new(endpoint_config(), config);
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    // An honest sender stops at the advertised limit; overdrive it
    pair.client_conn().force_stream_send_limit(s, 1024);
    assert_eq!(pair.client_conn().write(s, &[0; 11]).unwrap(), 11);
    pair.drive();

    let errored = std::iter::from_fn(|| pair.server_conn().poll()).any(|event| {
        matches!(
            &event,
            Event::ConnectionLost {
                reason: ConnectionError::TransportError(e),
            } if e.code == TransportErrorCode::FLOW_CONTROL_ERROR
        )
    });
    assert!(errored, "server should abort on flow control violation");

    // The close packet reaches the client
    let closed = std::iter::from_fn(|| pair.client_conn().poll()).any(|event| {
        matches!(
            &event,
            Event::ConnectionLost {
                reason: ConnectionError::ConnectionClosed { reason },
            } if reason.error_code == TransportErrorCode::FLOW_CONTROL_ERROR
        )
    });
    assert!(closed, "client should observe the close");
}

#[test]
fn connection_flow_control_violation() {
    let mut config = server_config();
    config.transport = Arc::new(TransportConfig {
        receive_window: 30,
        stream_receive_window: 1024,
        ..TransportConfig::default()
    });
    let mut pair = Pair::new(endpoint_config(), config);
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    pair.client_conn().force_connection_send_limit(1024);
    assert_eq!(pair.client_conn().write(s, &[0; 31]).unwrap(), 31);
    pair.drive();

    let errored = std::iter::from_fn(|| pair.server_conn().poll()).any(|event| {
        matches!(
            &event,
            Event::ConnectionLost {
                reason: ConnectionError::TransportError(e),
            } if e.code == TransportErrorCode::FLOW_CONTROL_ERROR
        )
    });
    assert!(errored);
}

#[test]
fn loss_declared_by_packet_threshold() {
    let mut pair = Pair::default();
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    // Send five packets, each carrying one chunk
    let now = pair.time;
    for chunk in [&b"aa"[..], b"bb", b"cc", b"dd", b"ee"] {
        pair.client_conn().write(s, chunk).unwrap();
        let transmit = pair.client_conn().poll_transmit(now).unwrap();
        pair.server
            .inbound
            .push_back((now, transmit.ecn, transmit.contents.into()));
    }
    // Lose everything but the last
    for _ in 0..4 {
        pair.server.inbound.pop_front();
    }
    assert_eq!(pair.client_conn().lost_packets(), 0);
    pair.drive();

    // Acknowledgment of the newest packet leaves the two oldest beyond the
    // reordering threshold; the rest await the time threshold
    assert_eq!(pair.client_conn().lost_packets(), 2);

    // Lost chunks were rebundled and redelivered, and the time threshold
    // eventually catches the rest
    pair.drive_to_idle();
    let mut buf = [0; 16];
    assert_eq!(pair.server_conn().read(s, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"aabbccddee");
}

#[test]
fn lost_handshake_flight_retransmits() {
    let mut pair = Pair::default();
    let (ch, conn) = pair
        .client
        .endpoint
        .connect(pair.time, client_config(), pair.server.addr, "localhost")
        .unwrap();
    pair.client.attach(ch, conn);
    pair.drive_side(Side::Client);
    // First flight vanishes
    pair.server.inbound.clear();
    pair.drive();
    assert!(pair.client_conn().is_handshaking());

    // The handshake completes after the retransmission alarm
    pair.drive_to_idle();
    assert!(!pair.client_conn().is_handshaking());
    assert!(!pair.server_conn().is_handshaking());
}

#[test]
fn close_and_drain() {
    let mut pair = Pair::default();
    pair.connect();

    let now = pair.time;
    pair.client_conn()
        .close(now, 42, Bytes::from_static(b"goodbye"));
    pair.drive();

    let closed = std::iter::from_fn(|| pair.server_conn().poll()).any(|event| {
        matches!(
            &event,
            Event::ConnectionLost {
                reason: ConnectionError::ApplicationClosed { reason },
            } if reason.error_code == 42 && reason.reason == "goodbye"
        )
    });
    assert!(closed);

    // Both sides settle after the drain period
    pair.drive_to_idle();
    assert!(pair.client_conn().is_drained());
    assert!(pair.server_conn().is_drained());
    assert_eq!(pair.server.endpoint.known_connections(), 0);
}

#[test]
fn closing_repeats_close_packet() {
    let mut pair = Pair::default();
    pair.connect();

    let now = pair.time;
    pair.client_conn().close(now, 0, Bytes::new());
    pair.drive_side(Side::Client);
    // Drop the close packet; the server keeps transmitting
    pair.client.inbound.clear();
    pair.server.inbound.clear();

    let s = pair.server_conn().open(Directionality::Uni).unwrap();
    pair.server_conn().write(s, b"anyone there?").unwrap();
    pair.drive_side(Side::Server);
    assert!(!pair.client.inbound.is_empty());
    pair.drive();

    // Any packet arriving at a closing connection evokes another close
    let closed = std::iter::from_fn(|| pair.server_conn().poll()).any(|event| {
        matches!(
            &event,
            Event::ConnectionLost {
                reason: ConnectionError::ApplicationClosed { .. },
            }
        )
    });
    assert!(closed);
}

#[test]
fn idle_timeout() {
    let mut pair = Pair::default();
    pair.connect();
    pair.drive_to_idle();

    let timed_out = std::iter::from_fn(|| pair.client_conn().poll()).any(|event| {
        matches!(
            &event,
            Event::ConnectionLost {
                reason: ConnectionError::TimedOut,
            }
        )
    });
    assert!(timed_out);
    assert!(pair.client_conn().is_drained());
}

#[test]
fn version_negotiation() {
    let mut pair = Pair::default();
    // A well-formed Initial of an unsupported version, from scratch
    let mut packet = Vec::new();
    packet.push(0b1100_0000);
    packet.extend_from_slice(&0xbad0_bad0u32.to_be_bytes());
    packet.push(0x55); // 8-byte connection IDs
    packet.extend_from_slice(&[0xaa; 8]);
    packet.extend_from_slice(&[0xbb; 8]);
    packet.resize(1200, 0);
    let time = pair.time;
    let client_addr = pair.client.addr;
    pair.server.inbound.push_back((time, None, packet.into()));
    pair.server.drive(time, client_addr);

    let reply = pair.server.outbound.pop_front().expect("no reply sent");
    // Long form carrying version zero
    assert_eq!(reply.contents[0] & 0x80, 0x80);
    assert_eq!(&reply.contents[1..5], &[0, 0, 0, 0]);
    // The supported version list includes ours
    let versions = reply.contents[6 + 16..]
        .chunks(4)
        .map(|x| u32::from_be_bytes(x.try_into().unwrap()))
        .collect::<Vec<_>>();
    assert!(versions.contains(&VERSION));
}

#[test]
fn version_negotiation_resets_initial_numbering() {
    let mut pair = Pair::default();
    let (ch, conn) = pair
        .client
        .endpoint
        .connect(pair.time, client_config(), pair.server.addr, "localhost")
        .unwrap();
    pair.client.attach(ch, conn);
    pair.drive_side(Side::Client);
    // Deliver the real Initial so the server creates a connection
    pair.drive_side(Side::Server);
    assert_eq!(pair.server.endpoint.known_connections(), 1);

    // An Initial for the same connection with a bogus version draws a
    // version negotiation packet and restarts receive tracking, rather than
    // killing the connection
    let mut packet = Vec::new();
    packet.push(0b1100_0000);
    packet.extend_from_slice(&0xbad0_bad0u32.to_be_bytes());
    packet.push(0xf0); // 18-byte DCID, absent SCID
    packet.extend_from_slice(&pair.client.conn.as_ref().unwrap().initial_dcid());
    packet.resize(1200, 0);
    pair.server
        .inbound
        .push_back((pair.time, None, packet.into()));
    pair.drive();

    // The handshake still completes
    pair.drive_to_idle();
    let connected = std::iter::from_fn(|| pair.client.conn.as_mut().unwrap().poll())
        .any(|event| matches!(event, Event::Connected));
    assert!(connected);
}

#[test]
fn stream_id_limits() {
    let mut config = server_config();
    config.transport = Arc::new(TransportConfig {
        stream_window_uni: 1,
        ..TransportConfig::default()
    });
    let mut pair = Pair::new(endpoint_config(), config);
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    assert_eq!(pair.client_conn().open(Directionality::Uni), None);

    pair.client_conn().write(s, b"first").unwrap();
    pair.client_conn().finish(s);
    pair.drive();

    assert_matches!(pair.server_conn().poll(), Some(Event::StreamOpened));
    assert_eq!(pair.server_conn().accept(), Some(s));
    let mut buf = [0; 16];
    assert_eq!(pair.server_conn().read(s, &mut buf).unwrap(), 5);
    assert_matches!(
        pair.server_conn().read(s, &mut buf),
        Err(ReadError::Finished)
    );
    pair.drive();

    // Closing the first stream raises the limit
    let available = std::iter::from_fn(|| pair.client_conn().poll()).any(|event| {
        matches!(
            event,
            Event::StreamAvailable {
                directionality: Directionality::Uni,
            }
        )
    });
    assert!(available);
    assert!(pair.client_conn().open(Directionality::Uni).is_some());
}

#[test]
fn rst_stream_final_offset() {
    let mut pair = Pair::default();
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    pair.client_conn().write(s, b"partial").unwrap();
    pair.drive();
    pair.client_conn().reset(s, 7);
    pair.drive();

    assert_matches!(pair.server_conn().poll(), Some(Event::StreamOpened));
    let mut buf = [0; 16];
    // Data before the reset is discarded
    assert_matches!(
        pair.server_conn().read(s, &mut buf),
        Err(ReadError::Reset { error_code: 7 })
    );
}

#[test]
fn stop_sending() {
    let mut pair = Pair::default();
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    pair.client_conn().write(s, b"unwanted").unwrap();
    pair.drive();
    assert_matches!(pair.server_conn().poll(), Some(Event::StreamOpened));
    pair.server_conn().stop_sending(s, 9);
    pair.drive();

    // The sender resets the stream and learns why
    assert_matches!(
        pair.client_conn().write(s, b"more"),
        Err(WriteError::Stopped { error_code: 9 })
    );
}

#[test]
fn path_challenge_response() {
    let mut pair = Pair::default();
    pair.connect();

    pair.server_conn().validate_path();
    assert!(!pair.server_conn().path_validated());
    pair.drive();
    assert!(pair.server_conn().path_validated());
}

#[test]
fn new_connection_ids_issued() {
    let mut pair = Pair::default();
    pair.connect();
    pair.drive();

    // The server adopts a fresh client-issued CID as soon as one arrives,
    // since the handshake CID carries no reset token; the client holds a
    // token for the server's handshake CID and needn't switch
    assert!(!pair.server_conn().using_handshake_rem_cid());
    assert!(pair.client_conn().using_handshake_rem_cid());
    assert_eq!(pair.client.endpoint.known_connections(), 1);
}

#[test]
fn stateless_reset() {
    let mut pair = Pair::default();
    pair.connect();
    pair.drive();

    // The server loses all state
    let fresh = Endpoint::new(endpoint_config(), Some(Arc::new(server_config()))).unwrap();
    pair.server.endpoint = fresh;
    pair.server.conn = None;
    pair.server.ch = None;
    pair.server.timers = [None; 4];

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    pair.client_conn().write(s, b"hello?").unwrap();
    pair.drive();

    let reset = std::iter::from_fn(|| pair.client_conn().poll()).any(|event| {
        matches!(
            &event,
            Event::ConnectionLost {
                reason: ConnectionError::Reset,
            }
        )
    });
    assert!(reset, "client should detect the stateless reset");
}

#[test]
fn congestion_window_halves_on_loss() {
    let mut pair = Pair::default();
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    let now = pair.time;
    for chunk in [&b"aa"[..], b"bb", b"cc", b"dd", b"ee"] {
        pair.client_conn().write(s, chunk).unwrap();
        let transmit = pair.client_conn().poll_transmit(now).unwrap();
        pair.server
            .inbound
            .push_back((now, transmit.ecn, transmit.contents.into()));
    }
    for _ in 0..4 {
        pair.server.inbound.pop_front();
    }
    let window_before = pair.client_conn().congestion_window();
    pair.drive();

    assert!(pair.client_conn().lost_packets() > 0);
    let window_after = pair.client_conn().congestion_window();
    assert!(
        window_after < window_before,
        "window {window_after} not reduced from {window_before}"
    );
    assert!(window_after >= 2 * 1460);
}

#[test]
fn pto_collapses_congestion_window() {
    let mut pair = Pair::default();
    pair.connect();

    let s = pair.client_conn().open(Directionality::Uni).unwrap();
    pair.client_conn().write(s, b"into the void").unwrap();
    pair.drive_side(Side::Client);
    // No acknowledgment ever arrives
    pair.server.inbound.clear();
    assert!(pair.client_conn().congestion_window() > 2 * 1460);

    // The probe timeout fires without any packet having been declared lost,
    // and the window estimate is abandoned wholesale
    pair.advance();
    pair.drive_side(Side::Client);
    assert_eq!(pair.client_conn().lost_packets(), 0);
    assert_eq!(pair.client_conn().congestion_window(), 2 * 1460);
}

#[test]
fn ping_elicits_ack() {
    let mut pair = Pair::default();
    pair.connect();

    pair.client_conn().ping();
    pair.drive();
    // Fully acknowledged again once the PING has been answered
    assert_eq!(pair.client_conn().bytes_in_flight(), 0);
}
