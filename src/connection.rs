use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{cmp, mem};

use bytes::{Buf, Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::coding::BufMutExt;
use crate::config::{ClientConfig, EndpointConfig, TransportConfig};
use crate::crypto::{
    ClientConfig as _, CryptoSpace, HeaderKeys, PacketKeys, Session,
};
use crate::frame::{self, ApplicationClose, Close, ConnectionClose, Frame, FrameStruct};
use crate::packet::{
    set_payload_length, Header, LongType, Packet, PacketNumber, PartialDecode, SpaceId,
};
use crate::range_set::RangeSet;
use crate::shared::{
    ConnectionEvent, ConnectionEventInner, ConnectionId, EcnCodepoint, EndpointEvent,
    EndpointEventInner, ResetToken, Transmit,
};
use crate::spaces::{PacketSpace, Retransmits, SentPacket};
use crate::stream::{self, ReadError, Stream, Streams, WriteError};
use crate::timer::Timer;
use crate::transport_parameters::TransportParameters;
use crate::{
    Directionality, Side, StreamId, TransportError, ACK_DELAY_EXPONENT, MIN_INITIAL_SIZE,
    RESET_TOKEN_SIZE, TIMER_GRANULARITY,
};

/// Protocol state machine for a single connection
///
/// Owns every per-connection subsystem: one packet number space per
/// encryption level, the stream set and its flow control ledger, loss
/// detection, and the congestion window. All methods are synchronous;
/// drivers feed in datagrams and timer expiries and drain transmits, timer
/// updates, and events.
pub struct Connection<S>
where
    S: Session,
{
    endpoint_config: Arc<EndpointConfig<S>>,
    config: Arc<TransportConfig>,
    rng: StdRng,
    tls: S,
    /// DCID of the first Initial packet, from which Initial keys derive
    pub(crate) init_cid: ConnectionId,
    loc_cids: FxHashMap<u64, ConnectionId>,
    /// The CID we chose ourselves, used while handshaking
    handshake_cid: ConnectionId,
    rem_cid: ConnectionId,
    /// The CID the peer initially chose, for use during the handshake
    rem_handshake_cid: ConnectionId,
    rem_cid_seq: u64,
    /// Additional CIDs supplied by the peer, by sequence number
    rem_cids: FxHashMap<u64, (ConnectionId, ResetToken)>,
    remote: SocketAddr,
    state: State,
    side: Side,
    mtu: u16,
    zero_rtt_crypto: Option<CryptoSpace<S::Keys>>,
    /// Most recent key phase bit observed; key updates are a design hook only
    key_phase: bool,
    /// Parameters advertised by the peer; defaults until its first flight arrives
    params: TransportParameters,
    params_applied: bool,
    /// Parameters we advertise, retained so a Retry can restart the handshake
    local_params: TransportParameters,
    /// Streams blocked on connection-level flow control or congestion
    blocked_streams: FxHashSet<StreamId>,
    /// Limit on outgoing data, dictated by the peer
    max_data: u64,
    data_sent: u64,
    /// Sum of the end offsets of all streams, gaps included
    data_recvd: u64,
    /// Limit on incoming data
    local_max_data: u64,
    client_config: Option<ClientConfig<S>>,
    server_name: Option<String>,
    /// The CID we addressed our first Initial to, if a Retry redirected us
    orig_rem_cid: Option<ConnectionId>,
    /// Total number of outgoing packets deemed lost
    lost_packets: u64,
    io: IoQueue,
    events: VecDeque<Event>,
    endpoint_events: VecDeque<EndpointEventInner>,
    /// Number of local connection IDs issued in NEW_CONNECTION_ID frames
    cids_issued: u64,
    cids_requested: bool,
    /// Outgoing spin bit state
    spin: bool,
    /// Packet number spaces: Initial, Handshake, Data
    spaces: [PacketSpace<S::Keys>; 3],
    /// Highest usable packet number space
    highest_space: SpaceId,
    /// Packets received at levels whose keys are not yet installed
    unkeyed_packets: VecDeque<(Instant, SocketAddr, Option<EcnCodepoint>, PartialDecode)>,
    /// Latest PATH_CHALLENGE token issued to the peer
    path_challenge: Option<u64>,
    /// Whether the peer has opened streams the application hasn't seen yet
    stream_opened: bool,
    accepted_0rtt: bool,
    /// Whether the idle timer should be reset on the next ack-eliciting transmit
    permit_idle_reset: bool,
    /// Negotiated idle timeout, seconds
    idle_timeout: u16,

    //
    // Queued non-retransmittable data
    //
    path_challenge_pending: bool,
    ping_pending: bool,
    /// Echo owed for a PING that carried a payload
    pong_pending: Option<Bytes>,
    /// PATH_RESPONSE owed on the current path
    path_response: Option<PathResponse>,

    //
    // Loss detection
    //
    /// Times all unacked handshake data has been retransmitted without an ack
    crypto_count: u32,
    /// Consecutive probe timeouts without an intervening ack
    pto_count: u32,
    /// When the earliest sent packet will be declared lost by time threshold
    loss_time: Option<Instant>,
    /// Space in which the next probe should be sent
    probe_space: Option<SpaceId>,
    time_of_last_sent_ack_eliciting_packet: Instant,
    time_of_last_sent_crypto_packet: Instant,
    rtt: RttEstimator,

    //
    // Congestion control
    //
    /// Summary statistics of packets sent but neither acked nor deemed lost
    in_flight: InFlight,
    /// Maximum number of bytes in flight that may be sent
    congestion_window: u64,
    /// The time loss was most recently detected, opening a recovery epoch.
    /// Packets sent before this instant don't shrink the window again; an
    /// ack for a packet sent after it closes the epoch.
    recovery_start_time: Instant,
    /// Slow start threshold in bytes; below it the window grows by the
    /// number of bytes acknowledged
    ssthresh: u64,
    /// ECN counts observed on received packets, echoed in our ACKs
    ecn_counters: frame::EcnCounts,
    /// Whether we mark outgoing packets ECT(0)
    sending_ecn: bool,
    /// Whether the most recently received packet had an ECN codepoint set
    receiving_ecn: bool,
    remote_validated: bool,
    total_recvd: u64,
    total_sent: u64,

    streams: Streams,
}

impl<S> Connection<S>
where
    S: Session,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint_config: Arc<EndpointConfig<S>>,
        config: Arc<TransportConfig>,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddr,
        client_config: Option<ClientConfig<S>>,
        server_name: Option<String>,
        local_params: TransportParameters,
        tls: S,
        now: Instant,
        remote_validated: bool,
    ) -> Self {
        let side = if client_config.is_some() {
            Side::Client
        } else {
            Side::Server
        };
        let initial_space = PacketSpace {
            crypto: Some(CryptoSpace::new(S::initial_keys(&init_cid, side))),
            ..PacketSpace::new(now)
        };
        let mut loc_cids = FxHashMap::default();
        loc_cids.insert(0, loc_cid);
        let state = State::Handshake(state::Handshake {
            rem_cid_set: side.is_server(),
        });
        let streams = Streams::new(side, config.stream_window_uni, config.stream_window_bidi);
        let mut this = Self {
            endpoint_config,
            rng: StdRng::from_entropy(),
            tls,
            init_cid,
            loc_cids,
            handshake_cid: loc_cid,
            rem_cid,
            rem_handshake_cid: rem_cid,
            rem_cid_seq: 0,
            rem_cids: FxHashMap::default(),
            remote,
            side,
            state,
            mtu: config.max_datagram_size as u16,
            zero_rtt_crypto: None,
            key_phase: false,
            params: TransportParameters::default(),
            params_applied: false,
            local_params,
            blocked_streams: FxHashSet::default(),
            max_data: 0,
            data_sent: 0,
            data_recvd: 0,
            local_max_data: u64::from(config.receive_window),
            client_config,
            server_name,
            orig_rem_cid: None,
            lost_packets: 0,
            io: IoQueue::new(),
            events: VecDeque::new(),
            endpoint_events: VecDeque::new(),
            cids_issued: 0,
            cids_requested: false,
            spin: false,
            spaces: [
                initial_space,
                PacketSpace::new(now),
                PacketSpace::new(now),
            ],
            highest_space: SpaceId::Initial,
            unkeyed_packets: VecDeque::new(),
            path_challenge: None,
            stream_opened: false,
            accepted_0rtt: false,
            permit_idle_reset: true,
            idle_timeout: config.idle_timeout,

            path_challenge_pending: false,
            ping_pending: false,
            pong_pending: None,
            path_response: None,

            crypto_count: 0,
            pto_count: 0,
            loss_time: None,
            probe_space: None,
            time_of_last_sent_ack_eliciting_packet: now,
            time_of_last_sent_crypto_packet: now,
            rtt: RttEstimator::new(),

            in_flight: InFlight::new(),
            congestion_window: config.initial_window,
            recovery_start_time: now,
            ssthresh: u64::MAX,
            ecn_counters: frame::EcnCounts::ZERO,
            sending_ecn: true,
            receiving_ecn: false,
            remote_validated,
            total_recvd: 0,
            total_sent: 0,

            streams,
            config,
        };
        if side.is_client() {
            // Kick off the handshake
            this.write_tls();
            this.init_0rtt();
        }
        this
    }

    /// Process an event delivered by this connection's endpoint
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        use self::ConnectionEventInner::*;
        match event.0 {
            Datagram {
                now,
                remote,
                ecn,
                first_decode,
                remaining,
            } => {
                // Migration across network paths is unsupported; a datagram
                // from elsewhere is not for us
                if remote != self.remote {
                    trace!("discarding packet from unexpected remote {}", remote);
                    return;
                }
                self.handle_decode(now, remote, ecn, first_decode);
                if let Some(data) = remaining {
                    self.handle_coalesced(now, remote, ecn, data);
                }
                self.flush_unkeyed();
            }
            NewIdentifiers(ids) => {
                for cid in ids {
                    self.loc_cids.insert(cid.sequence, cid.id);
                    self.cids_issued = cmp::max(self.cids_issued, cid.sequence);
                    self.space_mut(SpaceId::Data)
                        .pending
                        .new_cids
                        .push(frame::NewConnectionId {
                            sequence: cid.sequence,
                            id: cid.id,
                            reset_token: cid.reset_token,
                        });
                }
            }
            ResetInitialNumbering { now } => {
                trace!("restarting Initial receive state after version negotiation");
                self.spaces[SpaceId::Initial as usize].reset_rx_state(now);
            }
        }
    }

    /// Process a timer expiry
    pub fn handle_timeout(&mut self, now: Instant, timer: Timer) {
        match timer {
            Timer::Close => {
                self.state = State::Drained;
                self.endpoint_events.push_back(EndpointEventInner::Drained);
            }
            Timer::Idle => {
                self.close_common(now);
                self.events.push_back(ConnectionError::TimedOut.into());
                self.state = State::Draining;
            }
            Timer::KeepAlive => {
                trace!("sending keep-alive");
                self.ping();
            }
            Timer::LossDetection => {
                self.on_loss_detection_timeout(now);
            }
        }
    }

    /// Returns application-facing events
    pub fn poll(&mut self) -> Option<Event> {
        if mem::replace(&mut self.stream_opened, false) {
            return Some(Event::StreamOpened);
        }
        self.events.pop_front()
    }

    /// Returns events for the endpoint that created this connection
    pub fn poll_endpoint_events(&mut self) -> Option<EndpointEvent> {
        self.endpoint_events.pop_front().map(EndpointEvent)
    }

    /// Returns timer changes to apply
    pub fn poll_timers(&mut self) -> Option<TimerUpdate> {
        for (&timer, update) in Timer::VALUES.iter().zip(self.io.timers.iter_mut()) {
            if let Some(update) = update.take() {
                return Some(TimerUpdate { timer, update });
            }
        }
        None
    }

    fn on_packet_sent(
        &mut self,
        now: Instant,
        space: SpaceId,
        packet_number: u64,
        packet: SentPacket,
    ) {
        let SentPacket {
            size,
            is_crypto_packet,
            ack_eliciting,
            ..
        } = packet;

        self.in_flight.insert(&packet);
        self.space_mut(space)
            .sent_packets
            .insert(packet_number, packet);
        self.reset_keep_alive(now);
        if size != 0 {
            if ack_eliciting {
                self.time_of_last_sent_ack_eliciting_packet = now;
                if self.permit_idle_reset {
                    self.reset_idle_timeout(now);
                }
                self.permit_idle_reset = false;
            }
            if is_crypto_packet {
                self.time_of_last_sent_crypto_packet = now;
            }
            self.set_loss_detection_timer();
        }
    }

    fn on_ack_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.space(space).next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "ack of unsent packet",
            ));
        }
        trace!(space = ?space, largest = ack.largest, "handling ack");
        let was_blocked = self.blocked();
        let largest_acked_packet = &mut self.space_mut(space).largest_acked_packet;
        let prev_largest = *largest_acked_packet;
        *largest_acked_packet = cmp::max(ack.largest, *largest_acked_packet);

        // An RTT sample is only drawn from the largest acked packet, and only
        // if it is newly acked and ack-eliciting
        let largest_acked_time_sent =
            if let Some(info) = self.space(space).sent_packets.get(&ack.largest).cloned() {
                if info.ack_eliciting {
                    let delay = Duration::from_micros(
                        ack.delay
                            .checked_shl(u32::from(self.params.ack_delay_exponent))
                            .unwrap_or(u64::MAX),
                    );
                    self.rtt
                        .update(cmp::min(delay, self.max_ack_delay()), now - info.time_sent);
                }
                Some(info.time_sent)
            } else {
                None
            };

        // Avoid DoS from unreasonably huge ack ranges by processing only the
        // packets we actually sent and still track
        let newly_acked = ack
            .iter()
            .flat_map(|range| {
                self.space(space)
                    .sent_packets
                    .range(range)
                    .map(|(&n, _)| n)
            })
            .collect::<Vec<_>>();
        if newly_acked.is_empty() {
            return Ok(());
        }
        for &packet in &newly_acked {
            self.on_packet_acked(space, packet);
        }

        // Must run before crypto/pto counts are clobbered
        self.detect_lost_packets(now);

        self.crypto_count = 0;
        self.pto_count = 0;
        self.probe_space = None;

        // Explicit congestion notification
        if self.sending_ecn {
            if let Some(ecn) = ack.ecn {
                // Only ECN counters from in-order ACKs yield a well-defined
                // count increase to compare against newly acked packets
                if ack.largest > prev_largest {
                    self.process_ecn(
                        now,
                        space,
                        newly_acked.len() as u64,
                        ecn,
                        largest_acked_time_sent.unwrap(),
                    );
                }
            } else {
                // We start out sending ECN, so any unmarked ack disables it
                debug!("ECN not acknowledged by peer");
                self.sending_ecn = false;
            }
        }

        self.set_loss_detection_timer();
        if was_blocked && !self.blocked() {
            for stream in self.blocked_streams.drain() {
                self.events.push_back(Event::StreamWritable { stream });
            }
        }
        Ok(())
    }

    /// Process a new ECN block from an in-order ACK
    fn process_ecn(
        &mut self,
        now: Instant,
        space: SpaceId,
        newly_acked: u64,
        ecn: frame::EcnCounts,
        largest_sent_time: Instant,
    ) {
        match self.space_mut(space).detect_ecn(newly_acked, ecn) {
            Err(e) => {
                debug!("halting ECN due to verification failure: {}", e);
                self.sending_ecn = false;
            }
            Ok(false) => {}
            Ok(true) => {
                self.congestion_event(now, largest_sent_time);
            }
        }
    }

    // Not timing-aware, so it's safe to call this for inferred acks, such as
    // arise from high-latency handshakes
    fn on_packet_acked(&mut self, space: SpaceId, packet: u64) {
        let info = match self.space_mut(space).sent_packets.remove(&packet) {
            Some(x) => x,
            None => return,
        };
        self.in_flight.remove(&info);
        if info.ack_eliciting {
            // The congestion window does not grow during recovery
            if !self.in_recovery(info.time_sent) {
                if self.congestion_window < self.ssthresh {
                    // Slow start
                    self.congestion_window += u64::from(info.size);
                } else {
                    // Congestion avoidance
                    self.congestion_window += self.config.max_datagram_size
                        * u64::from(info.size)
                        / self.congestion_window;
                }
            }
        }

        // Update state for confirmed delivery of frames
        for (id, _) in info.retransmits.rst_stream {
            if let stream::SendState::ResetSent { stop_reason } =
                self.streams.get_send_mut(id).unwrap().state
            {
                self.streams.get_send_mut(id).unwrap().state =
                    stream::SendState::ResetRecvd { stop_reason };
                if stop_reason.is_none() {
                    self.maybe_cleanup(id);
                }
            }
        }
        for frame in info.retransmits.stream {
            let ss = match self.streams.get_send_mut(frame.id) {
                Some(x) => x,
                None => continue,
            };
            ss.bytes_in_flight -= frame.data.len() as u64;
            if ss.state == stream::SendState::DataSent && ss.bytes_in_flight == 0 {
                ss.state = stream::SendState::DataRecvd;
                self.maybe_cleanup(frame.id);
                self.events
                    .push_back(Event::StreamFinished { stream: frame.id });
            }
        }
        self.space_mut(space).pending_acks.subtract(&info.acks);
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        if self.in_flight.crypto != 0 {
            trace!("retransmitting handshake packets");
            for &space_id in [SpaceId::Initial, SpaceId::Handshake].iter() {
                if self.spaces[space_id as usize].crypto.is_none() {
                    continue;
                }
                let sent_packets =
                    mem::take(&mut self.space_mut(space_id).sent_packets);
                for (_, packet) in sent_packets {
                    self.in_flight.remove(&packet);
                    self.space_mut(space_id).pending += packet.retransmits;
                }
            }
            self.crypto_count = self.crypto_count.saturating_add(1);
        } else if self.state.is_handshake() && self.side.is_client() {
            trace!("sending anti-deadlock handshake packet");
            self.io.probes += 1;
            self.probe_space = Some(self.highest_space);
            self.crypto_count = self.crypto_count.saturating_add(1);
        } else if self.loss_time.is_some() {
            // Time threshold loss detection
            self.detect_lost_packets(now);
        } else {
            trace!(in_flight = self.in_flight.bytes, "PTO fired");
            self.io.probes += 2;
            self.probe_space = Some(self.earliest_eliciting_space());
            self.pto_count = self.pto_count.saturating_add(1);
            // A retransmission timeout invalidates the window estimate
            // outright; probes themselves are exempt from the gate
            self.congestion_window = self.config.minimum_window;
        }
        self.set_loss_detection_timer();
    }

    /// The space holding the oldest unacknowledged ack-eliciting packet
    fn earliest_eliciting_space(&self) -> SpaceId {
        let mut best = self.highest_space;
        let mut best_time = None;
        for id in SpaceId::iter() {
            if self.space(id).crypto.is_none() {
                continue;
            }
            let earliest = self
                .space(id)
                .sent_packets
                .values()
                .filter(|p| p.ack_eliciting)
                .map(|p| p.time_sent)
                .min();
            if let Some(t) = earliest {
                if best_time.map_or(true, |bt| t < bt) {
                    best = id;
                    best_time = Some(t);
                }
            }
        }
        best
    }

    fn detect_lost_packets(&mut self, now: Instant) {
        self.loss_time = None;
        let mut lost_packets = Vec::<u64>::new();
        let mut rtt = self.rtt.latest;
        if let Some(smoothed) = self.rtt.smoothed {
            rtt = cmp::max(rtt, smoothed);
        }
        let loss_delay = cmp::max(
            TIMER_GRANULARITY,
            rtt + ((rtt * u32::from(self.config.time_threshold)) / 65536),
        );
        let lost_send_time = now.checked_sub(loss_delay);

        let mut lost_ack_eliciting = false;
        let mut largest_lost_time = None;
        for space in self.spaces.iter_mut().filter(|x| x.crypto.is_some()) {
            lost_packets.clear();
            let lost_pn = space
                .largest_acked_packet
                .saturating_sub(u64::from(self.config.packet_threshold));
            for (&packet, info) in space.sent_packets.range(0..space.largest_acked_packet) {
                if lost_send_time.map_or(false, |lost| info.time_sent <= lost)
                    || packet <= lost_pn
                {
                    lost_packets.push(packet);
                } else {
                    let next_loss_time = info.time_sent + loss_delay;
                    self.loss_time = Some(self.loss_time.map_or(next_loss_time, |loss_time| {
                        cmp::min(loss_time, next_loss_time)
                    }));
                }
            }

            if let Some(&largest_lost) = lost_packets.last() {
                let old_bytes_in_flight = self.in_flight.bytes;
                let largest_lost_sent = space.sent_packets[&largest_lost].time_sent;
                largest_lost_time =
                    Some(largest_lost_time.map_or(largest_lost_sent, |lost_time| {
                        cmp::max(lost_time, largest_lost_sent)
                    }));
                self.lost_packets += lost_packets.len() as u64;
                trace!("packets lost: {:?}", lost_packets);
                for packet in &lost_packets {
                    let info = space.sent_packets.remove(packet).unwrap();
                    self.in_flight.remove(&info);
                    space.pending += info.retransmits;
                }
                // Lost ack-only packets incur no congestion penalty
                lost_ack_eliciting |= old_bytes_in_flight != self.in_flight.bytes;
            }
        }
        if lost_ack_eliciting {
            self.congestion_event(now, largest_lost_time.unwrap());
        }
    }

    fn congestion_event(&mut self, now: Instant, sent_time: Instant) {
        // Only one window reduction per recovery epoch
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = now;
        self.congestion_window =
            (self.congestion_window * u64::from(self.config.loss_reduction_factor)) >> 16;
        self.congestion_window = cmp::max(self.congestion_window, self.config.minimum_window);
        self.ssthresh = self.congestion_window;
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        sent_time <= self.recovery_start_time
    }

    fn set_loss_detection_timer(&mut self) {
        if self.in_flight.crypto != 0 || (self.state.is_handshake() && self.side.is_client()) {
            // Handshake retransmission alarm
            let timeout = if let Some(smoothed) = self.rtt.smoothed {
                2 * smoothed
            } else {
                2 * Duration::from_micros(self.config.initial_rtt)
            };
            let timeout = cmp::max(timeout, TIMER_GRANULARITY)
                * 2u32.pow(cmp::min(self.crypto_count, MAX_BACKOFF_EXPONENT));
            self.io.timer_start(
                Timer::LossDetection,
                self.time_of_last_sent_crypto_packet + timeout,
            );
            return;
        }

        if self.in_flight.ack_eliciting == 0 {
            self.io.timer_stop(Timer::LossDetection);
            return;
        }

        if let Some(loss_time) = self.loss_time {
            // Time threshold loss detection
            self.io.timer_start(Timer::LossDetection, loss_time);
            return;
        }

        // Probe timeout, doubled per consecutive unanswered expiry
        let timeout = self.pto() * 2u32.pow(cmp::min(self.pto_count, MAX_BACKOFF_EXPONENT));
        self.io.timer_start(
            Timer::LossDetection,
            self.time_of_last_sent_ack_eliciting_packet + timeout,
        );
    }

    /// Probe timeout
    fn pto(&self) -> Duration {
        let rtt = self
            .rtt
            .smoothed
            .unwrap_or_else(|| Duration::from_micros(self.config.initial_rtt));
        let computed = rtt + 4 * self.rtt.var + self.max_ack_delay();
        cmp::max(computed, TIMER_GRANULARITY)
    }

    fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.params.max_ack_delay))
    }

    fn on_packet_authenticated(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ecn: Option<EcnCodepoint>,
        packet: Option<u64>,
        spin: bool,
        size: usize,
    ) {
        self.remote_validated |= self.state.is_handshake() && space_id == SpaceId::Handshake;
        self.total_recvd = self.total_recvd.wrapping_add(size as u64);
        self.reset_keep_alive(now);
        self.reset_idle_timeout(now);
        self.permit_idle_reset = true;
        self.receiving_ecn |= ecn.is_some();
        if let Some(x) = ecn {
            self.ecn_counters += x;
        }

        let packet = match packet {
            Some(x) => x,
            None => return,
        };
        trace!(space = ?space_id, packet, "packet authenticated");
        if self.spaces[SpaceId::Initial as usize].crypto.is_some()
            && space_id == SpaceId::Handshake
            && self.side.is_server()
        {
            // A server stops sending and processing Initial packets when it
            // receives its first Handshake packet
            self.discard_space(SpaceId::Initial);
        }
        let space = &mut self.spaces[space_id as usize];
        space.pending_acks.insert_one(packet);
        if space.pending_acks.len() > MAX_ACK_BLOCKS {
            space.pending_acks.pop_min();
        }
        if packet >= space.rx_packet {
            space.rx_packet = packet;
            space.rx_packet_time = now;
            // Update the outgoing spin bit, inverting iff we're the client
            self.spin = self.side.is_client() ^ spin;
        }
    }

    fn reset_idle_timeout(&mut self, now: Instant) {
        if self.idle_timeout == 0 {
            return;
        }
        if self.state.is_closed() {
            self.io.timer_stop(Timer::Idle);
            return;
        }
        self.io
            .timer_start(Timer::Idle, now + Duration::from_secs(self.idle_timeout.into()));
    }

    fn reset_keep_alive(&mut self, now: Instant) {
        if self.config.keep_alive_interval == 0 || self.state.is_closed() {
            return;
        }
        self.io.timer_start(
            Timer::KeepAlive,
            now + Duration::from_secs(self.config.keep_alive_interval.into()),
        );
    }

    fn queue_stream_data(&mut self, stream: StreamId, data: Bytes) {
        let ss = self.streams.get_send_mut(stream).unwrap();
        assert_eq!(ss.state, stream::SendState::Ready);
        let offset = ss.offset;
        ss.offset += data.len() as u64;
        ss.bytes_in_flight += data.len() as u64;
        self.data_sent += data.len() as u64;
        self.space_mut(SpaceId::Data)
            .pending
            .stream
            .push_back(frame::Stream {
                offset,
                fin: false,
                data,
                id: stream,
            });
    }

    /// Abandon transmission on a stream
    ///
    /// # Panics
    /// - when applied to a receive-only stream
    pub fn reset(&mut self, stream_id: StreamId, error_code: u16) {
        assert!(
            stream_id.directionality() == Directionality::Bi
                || stream_id.initiator() == self.side,
            "only streams supporting outgoing data may be reset"
        );
        let stream = match self.streams.get_send_mut(stream_id) {
            Some(x) => x,
            None => return,
        };
        match stream.state {
            stream::SendState::DataRecvd
            | stream::SendState::ResetSent { .. }
            | stream::SendState::ResetRecvd { .. } => {
                return; // Nothing to do
            }
            _ => {}
        }
        stream.state = stream::SendState::ResetSent { stop_reason: None };
        self.space_mut(SpaceId::Data)
            .pending
            .rst_stream
            .push((stream_id, error_code));
    }

    fn init_0rtt(&mut self) {
        if let Some(keys) = self.tls.early_crypto() {
            trace!("0-RTT enabled");
            self.zero_rtt_crypto = Some(CryptoSpace::new(keys));
        }
    }

    fn read_tls(&mut self, space_id: SpaceId, crypto: &frame::Crypto) -> Result<(), TransportError> {
        let space = &mut self.spaces[space_id as usize];
        space.crypto_stream.insert(crypto.offset, &crypto.data);
        let contiguous = space.crypto_stream.read_contiguous();
        if !contiguous.is_empty() {
            trace!(
                space = ?space_id,
                bytes = contiguous.len(),
                "delivering handshake bytes"
            );
            self.tls.read_handshake(&contiguous)?;
        }
        if !self.params_applied {
            if let Some(params) = self.tls.transport_parameters()? {
                self.set_params(params)?;
            }
        }
        Ok(())
    }

    fn write_tls(&mut self) {
        loop {
            let space = self.highest_space;
            let mut outgoing = Vec::new();
            if let Some(crypto) = self.tls.write_handshake(&mut outgoing) {
                match space {
                    SpaceId::Initial => self.upgrade_crypto(SpaceId::Handshake, crypto),
                    SpaceId::Handshake => self.upgrade_crypto(SpaceId::Data, crypto),
                    _ => unreachable!("got updated secrets during 1-RTT"),
                }
            }
            if outgoing.is_empty() && space == self.highest_space {
                break;
            }
            if outgoing.is_empty() {
                continue;
            }
            let offset = self.space_mut(space).crypto_offset;
            self.space_mut(space).crypto_offset += outgoing.len() as u64;
            trace!(space = ?space, offset, bytes = outgoing.len(), "queuing handshake bytes");
            self.space_mut(space)
                .pending
                .crypto
                .push_back(frame::Crypto {
                    offset,
                    data: outgoing.into(),
                });
        }
    }

    fn upgrade_crypto(&mut self, space: SpaceId, crypto: S::Keys) {
        debug_assert!(
            self.spaces[space as usize].crypto.is_none(),
            "already reached packet space {space:?}"
        );
        trace!(space = ?space, "new keys installed");
        self.spaces[space as usize].crypto = Some(CryptoSpace::new(crypto));
        debug_assert!(space as usize > self.highest_space as usize);
        self.highest_space = space;
    }

    fn discard_space(&mut self, space: SpaceId) {
        trace!(space = ?space, "discarding space");
        let space = &mut self.spaces[space as usize];
        space.crypto = None;
        space.pending = Retransmits::default();
        space.pending_acks = RangeSet::new();
        for (_, packet) in mem::take(&mut space.sent_packets) {
            self.in_flight.remove(&packet);
        }
    }

    /// Process the first packet of an incoming connection (server only)
    pub(crate) fn handle_first_packet(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        packet_number: u64,
        packet: Packet,
        remaining: Option<BytesMut>,
    ) -> Result<(), ConnectionError> {
        let len = packet.header_data.len() + packet.payload.len();
        self.total_recvd = len as u64;

        self.on_packet_authenticated(
            now,
            SpaceId::Initial,
            ecn,
            Some(packet_number),
            false,
            len,
        );
        self.spaces[SpaceId::Initial as usize]
            .dedup
            .insert(packet_number);
        self.process_early_payload(now, packet)?;
        if self.state.is_closed() {
            return Ok(());
        }
        // 0-RTT keys become readable once the client's first flight is in
        self.init_0rtt();
        if let Some(data) = remaining {
            self.handle_coalesced(now, remote, ecn, data);
        }
        Ok(())
    }

    fn handle_coalesced(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
    ) {
        let mut remaining = Some(data);
        while let Some(data) = remaining {
            match PartialDecode::new(data, self.endpoint_config.local_cid_len) {
                Ok((partial_decode, rest)) => {
                    remaining = rest;
                    self.handle_decode(now, remote, ecn, partial_decode);
                }
                Err(e) => {
                    trace!("malformed header: {}", e);
                    return;
                }
            }
        }
    }

    fn keys_available(&self, decode: &PartialDecode) -> bool {
        if decode.is_0rtt() {
            return self.zero_rtt_crypto.is_some();
        }
        match decode.space() {
            Some(space) => self.spaces[space as usize].crypto.is_some(),
            None => true, // Unprotected packet
        }
    }

    fn handle_decode(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        partial_decode: PartialDecode,
    ) {
        if !self.keys_available(&partial_decode) {
            if partial_decode
                .space()
                .map_or(false, |space| (space as usize) < self.highest_space as usize)
            {
                trace!("dropping packet for retired space");
                return;
            }
            // Keys are installed asynchronously as the handshake proceeds;
            // hold early-arriving packets rather than dropping them
            if self.unkeyed_packets.len() >= MAX_UNKEYED_PACKETS {
                debug!("dropping packet for which no keys are buffered");
                self.unkeyed_packets.pop_front();
            }
            trace!(len = partial_decode.len(), "buffering packet without keys");
            self.unkeyed_packets
                .push_back((now, remote, ecn, partial_decode));
            return;
        }
        let header_keys = if partial_decode.is_0rtt() {
            Some(&self.zero_rtt_crypto.as_ref().unwrap().header)
        } else {
            partial_decode
                .space()
                .and_then(|space| self.spaces[space as usize].crypto.as_ref())
                .map(|crypto| &crypto.header)
        };
        match partial_decode.finish(header_keys) {
            Ok(packet) => self.handle_packet(now, remote, ecn, packet),
            Err(e) => {
                trace!("unable to complete packet decoding: {}", e);
            }
        }
    }

    /// Reprocess buffered packets whose keys have since been installed
    fn flush_unkeyed(&mut self) {
        loop {
            let ready = self
                .unkeyed_packets
                .iter()
                .position(|(_, _, _, decode)| self.keys_available(decode));
            match ready {
                Some(i) => {
                    let (now, remote, ecn, decode) = self.unkeyed_packets.remove(i).unwrap();
                    self.handle_decode(now, remote, ecn, decode);
                }
                None => return,
            }
        }
    }

    fn handle_packet(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        mut packet: Packet,
    ) {
        trace!(
            space = ?packet.header.space(),
            len = packet.payload.len() + packet.header_data.len(),
            dst_cid = %packet.header.dst_cid(),
            "got packet"
        );
        let was_closed = self.state.is_closed();
        let was_drained = self.state.is_drained();

        let stateless_reset = self.params.stateless_reset_token.map_or(false, |token| {
            packet.payload.len() >= RESET_TOKEN_SIZE
                && token == packet.payload[packet.payload.len() - RESET_TOKEN_SIZE..]
        });

        let result = match self.decrypt_packet(&mut packet) {
            Err(Some(e)) => {
                warn!("got illegal packet: {}", e);
                Err(e.into())
            }
            Err(None) => {
                if stateless_reset {
                    Err(ConnectionError::Reset)
                } else {
                    debug!("failed to authenticate packet");
                    return;
                }
            }
            Ok(number) => {
                let duplicate = number.and_then(|n| {
                    if self.space_mut(packet.header.space()).dedup.insert(n) {
                        Some(n)
                    } else {
                        None
                    }
                });

                if let Some(number) = duplicate {
                    if stateless_reset {
                        Err(ConnectionError::Reset)
                    } else {
                        warn!("discarding possible duplicate packet {}", number);
                        return;
                    }
                } else {
                    if !self.state.is_closed() {
                        let spin = match packet.header {
                            Header::Short { spin, .. } => spin,
                            _ => false,
                        };
                        self.on_packet_authenticated(
                            now,
                            packet.header.space(),
                            ecn,
                            number,
                            spin,
                            packet.header_data.len() + packet.payload.len(),
                        );
                    }
                    self.handle_connected_inner(now, number, packet)
                }
            }
        };

        // State transitions for error cases
        if let Err(conn_err) = result {
            self.events.push_back(conn_err.clone().into());
            self.state = match conn_err {
                ConnectionError::ApplicationClosed { reason } => State::closed(reason),
                ConnectionError::ConnectionClosed { reason } => State::closed(reason),
                ConnectionError::Reset => {
                    debug!("got stateless reset");
                    for &timer in &Timer::VALUES {
                        self.io.timer_stop(timer);
                    }
                    State::Drained
                }
                ConnectionError::TimedOut => {
                    unreachable!("timeouts aren't generated by packet processing");
                }
                ConnectionError::TransportError(err) => {
                    debug!("closing connection due to transport error: {}", err);
                    State::closed(err)
                }
                ConnectionError::VersionMismatch => State::Draining,
            };
        }

        if !was_closed && self.state.is_closed() {
            self.close_common(now);
        }
        if !was_drained && self.state.is_drained() {
            self.endpoint_events.push_back(EndpointEventInner::Drained);
        }

        // Transmit CONNECTION_CLOSE if necessary
        if let State::Closed(_) = self.state {
            self.io.close = remote == self.remote;
        }
    }

    fn handle_connected_inner(
        &mut self,
        now: Instant,
        number: Option<u64>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match self.state {
            State::Handshake(ref state) => {
                match packet.header {
                    Header::Retry {
                        src_cid: rem_cid,
                        orig_dst_cid,
                        ..
                    } => {
                        if self.side.is_server() {
                            return Err(TransportError::PROTOCOL_VIOLATION(
                                "client sent Retry",
                            )
                            .into());
                        }
                        if self.orig_rem_cid.is_some() || orig_dst_cid != self.rem_cid {
                            // A client accepts at most one Retry per
                            // connection attempt, and only one echoing the
                            // DCID of its first Initial
                            return Ok(());
                        }
                        trace!("retrying with CID {}", rem_cid);
                        self.orig_rem_cid = Some(self.rem_cid);
                        self.rem_cid = rem_cid;
                        self.rem_handshake_cid = rem_cid;
                        self.on_packet_acked(SpaceId::Initial, 0);

                        // Reset the handshake from the top
                        let client_config = self.client_config.as_ref().unwrap();
                        self.tls = client_config
                            .crypto
                            .start_session(
                                self.server_name.as_deref().unwrap_or(""),
                                &self.local_params,
                            )
                            .expect("session previously started with the same parameters");
                        self.discard_space(SpaceId::Initial);
                        self.spaces[0] = PacketSpace {
                            crypto: Some(CryptoSpace::new(S::initial_keys(
                                &rem_cid,
                                self.side,
                            ))),
                            next_packet_number: self.spaces[0].next_packet_number,
                            ..PacketSpace::new(now)
                        };
                        self.write_tls();

                        self.state = State::Handshake(state::Handshake {
                            rem_cid_set: false,
                        });
                        Ok(())
                    }
                    Header::Long {
                        ty: LongType::Handshake,
                        src_cid: rem_cid,
                        ..
                    } => {
                        if rem_cid != self.rem_handshake_cid {
                            debug!(
                                "discarding packet with mismatched remote CID: {} != {}",
                                self.rem_handshake_cid, rem_cid
                            );
                            return Ok(());
                        }

                        self.process_early_payload(now, packet)?;
                        if self.state.is_closed() {
                            return Ok(());
                        }

                        if self.tls.is_handshaking() {
                            trace!("handshake ongoing");
                            return Ok(());
                        }

                        if !self.params_applied {
                            return Err(TransportError::PROTOCOL_VIOLATION(
                                "transport parameters missing",
                            )
                            .into());
                        }
                        if self.side.is_client() && self.has_0rtt() {
                            if self.tls.early_data_accepted() == Some(true) {
                                self.accepted_0rtt = true;
                            } else {
                                self.reject_0rtt();
                            }
                        }
                        self.events.push_back(Event::Connected);
                        self.state = State::Established;
                        trace!("established");
                        self.request_cids();
                        Ok(())
                    }
                    Header::Long {
                        ty: LongType::Initial,
                        src_cid: rem_cid,
                        ..
                    } => {
                        if !state.rem_cid_set {
                            trace!("switching remote CID to {}", rem_cid);
                            self.rem_cid = rem_cid;
                            self.rem_handshake_cid = rem_cid;
                            self.state = State::Handshake(state::Handshake {
                                rem_cid_set: true,
                            });
                        } else if rem_cid != self.rem_handshake_cid {
                            debug!(
                                "discarding packet with mismatched remote CID: {} != {}",
                                self.rem_handshake_cid, rem_cid
                            );
                            return Ok(());
                        }
                        self.process_early_payload(now, packet)?;
                        Ok(())
                    }
                    Header::Long {
                        ty: LongType::Retry,
                        ..
                    } => unreachable!("Retry packets use Header::Retry, not Header::Long"),
                    Header::Long {
                        ty: LongType::ZeroRtt,
                        ..
                    } => {
                        debug_assert!(self.side.is_server());
                        self.process_payload(now, number.unwrap(), packet.payload.freeze())?;
                        Ok(())
                    }
                    Header::VersionNegotiate { .. } => {
                        if packet.payload.len() % 4 != 0 {
                            return Err(TransportError::PROTOCOL_VIOLATION(
                                "malformed version negotiation",
                            )
                            .into());
                        }
                        let mut payload = &packet.payload[..];
                        while payload.has_remaining() {
                            let version = payload.get_u32();
                            if version == crate::VERSION {
                                // Our version is supported, so this packet is spurious
                                return Ok(());
                            }
                        }
                        debug!("remote doesn't support our version");
                        Err(ConnectionError::VersionMismatch)
                    }
                    // TODO: SHOULD buffer these to improve reordering tolerance
                    Header::Short { .. } => {
                        trace!("dropping short packet during handshake");
                        Ok(())
                    }
                }
            }
            State::Established => {
                match packet.header.space() {
                    SpaceId::Data => {
                        self.process_payload(now, number.unwrap(), packet.payload.freeze())?
                    }
                    _ => self.process_early_payload(now, packet)?,
                }
                Ok(())
            }
            State::Closed(_) => {
                for frame in frame::Iter::new(packet.payload.freeze()) {
                    let peer_reason = match frame {
                        Frame::Close(Close::Application(reason)) => {
                            ConnectionError::ApplicationClosed { reason }
                        }
                        Frame::Close(Close::Connection(reason)) => {
                            ConnectionError::ConnectionClosed { reason }
                        }
                        _ => {
                            continue;
                        }
                    };
                    self.events.push_back(Event::ConnectionLost {
                        reason: peer_reason,
                    });
                    trace!("draining");
                    self.state = State::Draining;
                    return Ok(());
                }
                Ok(())
            }
            State::Draining | State::Drained => Ok(()),
        }
    }

    /// Process an Initial or Handshake packet payload
    fn process_early_payload(
        &mut self,
        now: Instant,
        packet: Packet,
    ) -> Result<(), TransportError> {
        debug_assert_ne!(packet.header.space(), SpaceId::Data);
        let space = packet.header.space();
        let payload = packet.payload.freeze();
        if payload.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION("packet carries no frames"));
        }
        for frame in frame::Iter::new(payload) {
            match frame {
                Frame::Padding(_) => {}
                _ => {
                    trace!(ty = ?frame.ty(), "got frame");
                }
            }
            if frame.is_ack_eliciting() {
                self.space_mut(space).permit_ack_only = true;
            }
            match frame {
                Frame::Invalid { reason, .. } => {
                    return Err(TransportError::FRAME_ENCODING_ERROR(reason));
                }
                Frame::Padding(_) => {}
                Frame::Ping(data) => {
                    if !data.is_empty() {
                        self.pong_pending = Some(data);
                    }
                }
                Frame::Pong(_) => {
                    // We only send empty PINGs, which elicit nothing
                    trace!("got unsolicited PONG");
                }
                Frame::Crypto(frame) => {
                    self.read_tls(space, &frame)?;
                }
                Frame::Ack(ack) => {
                    self.on_ack_received(now, space, ack)?;
                }
                Frame::Close(Close::Connection(reason)) => {
                    trace!("peer aborted the handshake: {}", reason.error_code);
                    self.events
                        .push_back(ConnectionError::ConnectionClosed { reason }.into());
                    self.state = State::Draining;
                    return Ok(());
                }
                Frame::Close(Close::Application(reason)) => {
                    self.events
                        .push_back(ConnectionError::ApplicationClosed { reason }.into());
                    self.state = State::Draining;
                    return Ok(());
                }
                _ => {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "illegal frame type in handshake",
                    ));
                }
            }
        }
        self.write_tls();
        Ok(())
    }

    fn process_payload(
        &mut self,
        now: Instant,
        number: u64,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION("packet carries no frames"));
        }
        let is_0rtt = self.space(SpaceId::Data).crypto.is_none();
        for frame in frame::Iter::new(payload) {
            match frame {
                Frame::Padding(_) => {}
                _ => {
                    trace!(ty = ?frame.ty(), "got frame");
                }
            }
            if is_0rtt {
                match frame {
                    Frame::Padding(_) | Frame::Stream { .. } => {}
                    _ => {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "illegal frame type in 0-RTT",
                        ));
                    }
                }
            }
            if frame.is_ack_eliciting() {
                self.space_mut(SpaceId::Data).permit_ack_only = true;
            }
            match frame {
                Frame::Invalid { reason, .. } => {
                    return Err(TransportError::FRAME_ENCODING_ERROR(reason));
                }
                Frame::Crypto(frame) => {
                    self.read_tls(SpaceId::Data, &frame)?;
                }
                Frame::Stream(frame) => {
                    trace!(id = %frame.id, offset = frame.offset, len = frame.data.len(), fin = frame.fin, "got stream frame");
                    let data_recvd = self.data_recvd;
                    let max_data = self.local_max_data;
                    match self.streams.get_recv_stream(self.side, frame.id) {
                        Err(e) => {
                            debug!(id = %frame.id, "received illegal stream frame");
                            return Err(e);
                        }
                        Ok(None) => {
                            trace!("dropping frame for closed stream");
                            continue;
                        }
                        _ => {}
                    }
                    let rs = self.streams.get_recv_mut(frame.id).unwrap();
                    let was_blocked = rs.is_blocked();
                    if rs.is_finished() {
                        trace!("dropping frame for finished stream");
                        continue;
                    }

                    let end = frame.offset + frame.data.len() as u64;
                    if let Some(final_offset) = rs.final_offset() {
                        if end > final_offset || (frame.fin && end != final_offset) {
                            debug!(end, final_offset, "final offset error");
                            return Err(TransportError::FINAL_OFFSET_ERROR(""));
                        }
                    }
                    let prev_end = rs.limit();
                    let new_bytes = end.saturating_sub(prev_end);
                    let stream_max_data =
                        rs.bytes_read + u64::from(self.config.stream_receive_window);
                    if end > stream_max_data || data_recvd + new_bytes > max_data {
                        debug!(stream = %frame.id, recvd = data_recvd, new_bytes, "flow control error");
                        return Err(TransportError::FLOW_CONTROL_ERROR(""));
                    }
                    if frame.fin {
                        if let stream::RecvState::Recv { ref mut size } = rs.state {
                            *size = Some(end);
                        }
                    }
                    rs.recvd.insert(frame.offset..end);
                    rs.buffer(frame.data, frame.offset);
                    if let stream::RecvState::Recv { size: Some(size) } = rs.state {
                        if rs.recvd.len() == 1 && rs.recvd.iter().next().unwrap() == (0..size) {
                            rs.state = stream::RecvState::DataRecvd { size };
                        }
                    }

                    self.on_stream_frame(was_blocked, frame.id);
                    self.data_recvd += new_bytes;
                }
                Frame::Ack(ack) => {
                    self.on_ack_received(now, SpaceId::Data, ack)?;
                }
                Frame::Padding(_) => {}
                Frame::Ping(data) => {
                    if !data.is_empty() {
                        self.pong_pending = Some(data);
                    }
                }
                Frame::Pong(_) => {
                    trace!("got unsolicited PONG");
                }
                Frame::Close(Close::Connection(reason)) => {
                    self.events
                        .push_back(ConnectionError::ConnectionClosed { reason }.into());
                    self.state = State::Draining;
                    return Ok(());
                }
                Frame::Close(Close::Application(reason)) => {
                    self.events
                        .push_back(ConnectionError::ApplicationClosed { reason }.into());
                    self.state = State::Draining;
                    return Ok(());
                }
                Frame::PathChallenge(token) => {
                    if self
                        .path_response
                        .as_ref()
                        .map_or(true, |x| x.packet <= number)
                    {
                        self.path_response = Some(PathResponse {
                            packet: number,
                            token,
                        });
                    }
                }
                Frame::PathResponse(token) => {
                    if self.path_challenge != Some(token) {
                        continue;
                    }
                    trace!("path validated");
                    self.path_challenge = None;
                    self.remote_validated = true;
                }
                Frame::MaxData(bytes) => {
                    let was_blocked = self.blocked();
                    // Limits may only rise; stale increases are ignored
                    self.max_data = cmp::max(bytes, self.max_data);
                    if was_blocked && !self.blocked() {
                        for stream in self.blocked_streams.drain() {
                            self.events.push_back(Event::StreamWritable { stream });
                        }
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    if id.initiator() != self.side && id.directionality() == Directionality::Uni
                    {
                        debug!(stream = %id, "got MAX_STREAM_DATA on recv-only stream");
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "MAX_STREAM_DATA on recv-only stream",
                        ));
                    }
                    if let Some(ss) = self.streams.get_send_mut(id) {
                        if offset > ss.max_data {
                            trace!(stream = %id, old = ss.max_data, new = offset, "stream limit increased");
                            if ss.offset == ss.max_data {
                                self.events.push_back(Event::StreamWritable { stream: id });
                            }
                            ss.max_data = offset;
                        }
                    } else {
                        debug!(stream = %id, "got MAX_STREAM_DATA on unopened stream");
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "MAX_STREAM_DATA on unopened stream",
                        ));
                    }
                }
                Frame::MaxStreamId(id) => {
                    if id.initiator() != self.side {
                        debug!(stream = %id, "got MAX_STREAM_ID for peer-initiated streams");
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "MAX_STREAM_ID for peer-initiated stream",
                        ));
                    }
                    let limit = id.index() + 1;
                    let current = match id.directionality() {
                        Directionality::Uni => &mut self.streams.max_uni,
                        Directionality::Bi => &mut self.streams.max_bi,
                    };
                    if limit > *current {
                        *current = limit;
                        self.events.push_back(Event::StreamAvailable {
                            directionality: id.directionality(),
                        });
                    }
                }
                Frame::RstStream(frame::RstStream {
                    id,
                    error_code,
                    final_offset,
                }) => {
                    let rs = match self.streams.get_recv_stream(self.side, id) {
                        Err(e) => {
                            debug!("received illegal RST_STREAM");
                            return Err(e);
                        }
                        Ok(None) => {
                            trace!("received RST_STREAM on closed stream");
                            continue;
                        }
                        Ok(Some(stream)) => stream.recv_mut().unwrap(),
                    };
                    let was_blocked = rs.is_blocked();
                    let limit = rs.limit();

                    // The final offset must agree with any previously observed
                    if let Some(offset) = rs.final_offset() {
                        if offset != final_offset {
                            return Err(TransportError::FINAL_OFFSET_ERROR(
                                "inconsistent value",
                            ));
                        }
                    } else if limit > final_offset {
                        return Err(TransportError::FINAL_OFFSET_ERROR(
                            "lower than high water mark",
                        ));
                    }

                    rs.reset(error_code, final_offset);

                    // Update flow control
                    if rs.bytes_read != final_offset {
                        self.data_recvd += final_offset - limit;
                        // bytes_read is always <= limit, so this won't underflow
                        self.local_max_data += final_offset - rs.bytes_read;
                        self.space_mut(SpaceId::Data).pending.max_data = true;
                    }

                    self.on_stream_frame(was_blocked, id);
                }
                Frame::Blocked { offset } => {
                    debug!(offset, "peer claims to be blocked at connection level");
                }
                Frame::StreamBlocked { id, offset } => {
                    if id.initiator() == self.side && id.directionality() == Directionality::Uni
                    {
                        debug!(stream = %id, "got STREAM_BLOCKED on send-only stream");
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "STREAM_BLOCKED on send-only stream",
                        ));
                    }
                    debug!(stream = %id, offset, "peer claims to be blocked at stream level");
                }
                Frame::StreamIdBlocked { id } => {
                    debug!(stream = %id, "peer claims to be blocked on stream IDs");
                }
                Frame::StopSending { id, error_code } => {
                    if id.initiator() != self.side {
                        if id.directionality() == Directionality::Uni {
                            debug!(stream = %id, "got STOP_SENDING on recv-only stream");
                            return Err(TransportError::STREAM_STATE_ERROR(
                                "STOP_SENDING on recv-only stream",
                            ));
                        }
                    } else if id.index() >= match id.directionality() {
                        Directionality::Uni => self.streams.next_uni,
                        Directionality::Bi => self.streams.next_bi,
                    } {
                        debug!(stream = %id, "got STOP_SENDING on unopened stream");
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "STOP_SENDING on unopened stream",
                        ));
                    }
                    self.reset(id, error_code);
                    let ss = match self.streams.get_send_mut(id) {
                        Some(x) => x,
                        None => {
                            trace!("STOP_SENDING on closed stream");
                            continue;
                        }
                    };
                    ss.state = stream::SendState::ResetSent {
                        stop_reason: Some(error_code),
                    };
                    if self.blocked_streams.remove(&id) || ss.offset == ss.max_data {
                        self.events.push_back(Event::StreamWritable { stream: id });
                    }
                }
                Frame::NewConnectionId(frame) => {
                    trace!(sequence = frame.sequence, id = %frame.id, "got NEW_CONNECTION_ID");
                    if self.rem_cid.is_empty() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "NEW_CONNECTION_ID when CIDs aren't in use",
                        ));
                    }
                    if let Some(&(existing, _)) = self.rem_cids.get(&frame.sequence) {
                        if existing != frame.id {
                            return Err(TransportError::PROTOCOL_VIOLATION(
                                "conflicting NEW_CONNECTION_ID for sequence number",
                            ));
                        }
                        continue;
                    }
                    if self.params.stateless_reset_token.is_none() && self.rem_cid_seq == 0 {
                        // We're still addressing the peer by its handshake
                        // CID, for which no reset token exists; switch
                        // immediately so stateless resets become detectable
                        self.update_rem_cid(frame.sequence, frame.id, frame.reset_token);
                    } else if self.rem_cids.len() < MAX_REMOTE_CIDS {
                        self.rem_cids
                            .insert(frame.sequence, (frame.id, frame.reset_token));
                    }
                }
            }
        }

        Ok(())
    }

    /// Notify the application that new streams were opened or a stream became readable.
    fn on_stream_frame(&mut self, notify_readable: bool, stream: StreamId) {
        if stream.initiator() == self.side {
            // Notifying about the opening of locally-initiated streams would be redundant.
            if notify_readable {
                self.events.push_back(Event::StreamReadable { stream });
            }
            return;
        }
        let next = match stream.directionality() {
            Directionality::Bi => &mut self.streams.next_remote_bi,
            Directionality::Uni => &mut self.streams.next_remote_uni,
        };
        if stream.index() >= *next {
            *next = stream.index() + 1;
            self.stream_opened = true;
        } else if notify_readable {
            self.events.push_back(Event::StreamReadable { stream });
        }
    }

    fn update_rem_cid(&mut self, sequence: u64, id: ConnectionId, token: ResetToken) {
        trace!(sequence, id = %id, "switching to new remote CID");
        self.rem_cid = id;
        self.rem_cid_seq = sequence;
        self.params.stateless_reset_token = Some(token);
        self.endpoint_events
            .push_back(EndpointEventInner::ResetToken(token));
    }

    fn request_cids(&mut self) {
        if self.endpoint_config.local_cid_len == 0 || self.cids_requested {
            return;
        }
        self.cids_requested = true;
        self.endpoint_events
            .push_back(EndpointEventInner::NeedIdentifiers(CIDS_OFFERED));
    }

    fn set_params(&mut self, params: TransportParameters) -> Result<(), TransportError> {
        // A server echoes the CID the client first dialed iff it sent a Retry
        if self.side.is_client() && self.orig_rem_cid != params.original_connection_id {
            debug!(
                expected = ?self.orig_rem_cid,
                actual = ?params.original_connection_id,
                "original connection ID mismatch"
            );
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "original CID mismatch",
            ));
        }

        self.streams.max_bi = u64::from(params.initial_max_bidi_streams);
        self.streams.max_uni = u64::from(params.initial_max_uni_streams);
        self.max_data = u64::from(params.initial_max_data);
        for i in 0..self.streams.max_remote_bi {
            let id = StreamId::new(!self.side, Directionality::Bi, i);
            self.streams.get_send_mut(id).unwrap().max_data =
                u64::from(params.initial_max_stream_data_bidi_local);
        }
        self.idle_timeout = if self.config.idle_timeout == 0 || params.idle_timeout == 0 {
            cmp::max(self.config.idle_timeout, params.idle_timeout)
        } else {
            cmp::min(self.config.idle_timeout, params.idle_timeout)
        };
        if let Some(token) = params.stateless_reset_token {
            self.endpoint_events
                .push_back(EndpointEventInner::ResetToken(token));
        }
        self.params = params;
        self.params_applied = true;
        Ok(())
    }

    fn reject_0rtt(&mut self) {
        debug!("0-RTT rejected by peer");
        self.accepted_0rtt = false;
        self.zero_rtt_crypto = None;
        // Rebundle everything sent under the rejected keys for ordinary
        // 1-RTT transmission; their packet numbers are not reused
        let sent_packets = mem::take(&mut self.space_mut(SpaceId::Data).sent_packets);
        for (_, packet) in sent_packets {
            self.in_flight.remove(&packet);
            self.space_mut(SpaceId::Data).pending += packet.retransmits;
        }
    }

    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        max_size: usize,
    ) -> (Retransmits, RangeSet) {
        let is_0rtt = space_id == SpaceId::Data && self.space(space_id).crypto.is_none();
        let mut sent = Retransmits::default();

        // PING
        if space_id == SpaceId::Data && mem::replace(&mut self.ping_pending, false) {
            trace!("PING");
            buf.write(frame::Type::PING);
            buf.write::<u8>(0);
        }

        // PONG
        if space_id == SpaceId::Data && buf.len() + 2 + 255 < max_size {
            if let Some(data) = self.pong_pending.take() {
                trace!("PONG");
                buf.write(frame::Type::PONG);
                buf.write::<u8>(data.len() as u8);
                buf.extend_from_slice(&data);
            }
        }

        let space = &mut self.spaces[space_id as usize];

        // ACK
        // 0-RTT packets must never carry acks (which would have to be of
        // handshake packets)
        let acks = if !space.pending_acks.is_empty() && !is_0rtt {
            let delay = micros_from(now - space.rx_packet_time) >> ACK_DELAY_EXPONENT;
            trace!(
                ranges = ?space.pending_acks.iter().collect::<Vec<_>>(),
                delay,
                "ACK"
            );
            let ecn = if self.receiving_ecn {
                Some(&self.ecn_counters)
            } else {
                None
            };
            frame::Ack::encode(delay, &space.pending_acks, ecn, buf);
            space.pending_acks.clone()
        } else {
            RangeSet::new()
        };

        // PATH_CHALLENGE
        if buf.len() + 10 < max_size && space_id == SpaceId::Data {
            // Transmit challenges with every outgoing frame on an unvalidated path
            if let Some(token) = self.path_challenge {
                // But only send a packet solely for that purpose at most once
                self.path_challenge_pending = false;
                trace!(token, "PATH_CHALLENGE");
                buf.write(frame::Type::PATH_CHALLENGE);
                buf.write::<u64>(token);
            }
        }

        // PATH_RESPONSE
        if buf.len() + 10 < max_size && space_id == SpaceId::Data {
            if let Some(response) = self.path_response.take() {
                trace!(token = response.token, "PATH_RESPONSE");
                buf.write(frame::Type::PATH_RESPONSE);
                buf.write::<u64>(response.token);
            }
        }

        // CRYPTO
        while buf.len() + frame::Crypto::SIZE_BOUND < max_size && !is_0rtt {
            let mut frame = match space.pending.crypto.pop_front() {
                Some(x) => x,
                None => break,
            };
            let len = cmp::min(
                frame.data.len(),
                max_size - buf.len() - frame::Crypto::SIZE_BOUND,
            );
            let data = frame.data.split_to(len);
            let truncated = frame::Crypto {
                offset: frame.offset,
                data,
            };
            trace!(
                offset = truncated.offset,
                len = truncated.data.len(),
                "CRYPTO"
            );
            truncated.encode(buf);
            sent.crypto.push_back(truncated);
            if !frame.data.is_empty() {
                frame.offset += len as u64;
                space.pending.crypto.push_front(frame);
            }
        }

        // The application might reasonably decide to abandon a stream before
        // the connection is established, but these frame types are forbidden
        // in 0-RTT, so they must wait for the handshake to complete
        if !is_0rtt {
            // RST_STREAM
            while buf.len() + frame::RstStream::SIZE_BOUND < max_size {
                let (id, error_code) = match space.pending.rst_stream.pop() {
                    Some(x) => x,
                    None => break,
                };
                let stream = match self.streams.streams.get(&id) {
                    Some(x) => x,
                    None => continue,
                };
                trace!(stream = %id, "RST_STREAM");
                sent.rst_stream.push((id, error_code));
                frame::RstStream {
                    id,
                    error_code,
                    final_offset: stream.send().unwrap().offset,
                }
                .encode(buf);
            }

            // STOP_SENDING
            while buf.len() + 11 < max_size {
                let (id, error_code) = match space.pending.stop_sending.pop() {
                    Some(x) => x,
                    None => break,
                };
                let stream = match self.streams.streams.get(&id) {
                    Some(x) => x.recv().unwrap(),
                    None => continue,
                };
                if stream.is_finished() {
                    continue;
                }
                trace!(stream = %id, "STOP_SENDING");
                sent.stop_sending.push((id, error_code));
                buf.write(frame::Type::STOP_SENDING);
                buf.write(id);
                buf.write::<u16>(error_code);
            }
        }

        // MAX_DATA
        if space.pending.max_data && buf.len() + 9 < max_size {
            trace!(value = self.local_max_data, "MAX_DATA");
            space.pending.max_data = false;
            sent.max_data = true;
            buf.write(frame::Type::MAX_DATA);
            buf.write_var(self.local_max_data);
        }

        // MAX_STREAM_DATA
        while buf.len() + 17 < max_size {
            let id = match space.pending.max_stream_data.iter().next() {
                Some(x) => *x,
                None => break,
            };
            space.pending.max_stream_data.remove(&id);
            let rs = match self.streams.streams.get(&id) {
                Some(x) => x.recv().unwrap(),
                None => continue,
            };
            if rs.is_finished() {
                continue;
            }
            sent.max_stream_data.insert(id);
            let max = rs.bytes_read + u64::from(self.config.stream_receive_window);
            trace!(stream = %id, max, "MAX_STREAM_DATA");
            buf.write(frame::Type::MAX_STREAM_DATA);
            buf.write(id);
            buf.write_var(max);
        }

        // MAX_STREAM_ID (unidirectional)
        if space.pending.max_uni_stream_id
            && buf.len() + 9 < max_size
            && self.streams.max_remote_uni > 0
        {
            space.pending.max_uni_stream_id = false;
            sent.max_uni_stream_id = true;
            trace!(value = self.streams.max_remote_uni, "MAX_STREAM_ID (unidirectional)");
            buf.write(frame::Type::MAX_STREAM_ID);
            buf.write(StreamId::new(
                !self.side,
                Directionality::Uni,
                self.streams.max_remote_uni - 1,
            ));
        }

        // MAX_STREAM_ID (bidirectional)
        if space.pending.max_bi_stream_id
            && buf.len() + 9 < max_size
            && self.streams.max_remote_bi > 0
        {
            space.pending.max_bi_stream_id = false;
            sent.max_bi_stream_id = true;
            trace!(value = self.streams.max_remote_bi, "MAX_STREAM_ID (bidirectional)");
            buf.write(frame::Type::MAX_STREAM_ID);
            buf.write(StreamId::new(
                !self.side,
                Directionality::Bi,
                self.streams.max_remote_bi - 1,
            ));
        }

        // BLOCKED
        if space.pending.blocked && buf.len() + 9 < max_size {
            space.pending.blocked = false;
            sent.blocked = true;
            trace!(offset = self.max_data, "BLOCKED");
            buf.write(frame::Type::BLOCKED);
            buf.write_var(self.max_data);
        }

        // STREAM_BLOCKED
        while buf.len() + 17 < max_size {
            let id = match space.pending.stream_blocked.iter().next() {
                Some(x) => *x,
                None => break,
            };
            space.pending.stream_blocked.remove(&id);
            let ss = match self.streams.streams.get(&id) {
                Some(x) => x.send().unwrap(),
                None => continue,
            };
            trace!(stream = %id, "STREAM_BLOCKED");
            sent.stream_blocked.insert(id);
            buf.write(frame::Type::STREAM_BLOCKED);
            buf.write(id);
            buf.write_var(ss.max_data);
        }

        // STREAM_ID_BLOCKED
        if space.pending.stream_id_blocked_uni && buf.len() + 9 < max_size {
            space.pending.stream_id_blocked_uni = false;
            sent.stream_id_blocked_uni = true;
            trace!("STREAM_ID_BLOCKED (unidirectional)");
            buf.write(frame::Type::STREAM_ID_BLOCKED);
            buf.write(StreamId::new(
                self.side,
                Directionality::Uni,
                self.streams.max_uni,
            ));
        }
        if space.pending.stream_id_blocked_bi && buf.len() + 9 < max_size {
            space.pending.stream_id_blocked_bi = false;
            sent.stream_id_blocked_bi = true;
            trace!("STREAM_ID_BLOCKED (bidirectional)");
            buf.write(frame::Type::STREAM_ID_BLOCKED);
            buf.write(StreamId::new(
                self.side,
                Directionality::Bi,
                self.streams.max_bi,
            ));
        }

        // NEW_CONNECTION_ID
        while buf.len() + frame::NewConnectionId::SIZE_BOUND < max_size {
            let frame = match space.pending.new_cids.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(sequence = frame.sequence, id = %frame.id, "NEW_CONNECTION_ID");
            frame.encode(buf);
            sent.new_cids.push(frame);
        }

        // STREAM
        while buf.len() + frame::Stream::SIZE_BOUND < max_size {
            let mut stream = match space.pending.stream.pop_front() {
                Some(x) => x,
                None => break,
            };
            if self
                .streams
                .streams
                .get(&stream.id)
                .map_or(true, |s| s.send().unwrap().state.was_reset())
            {
                continue;
            }
            let len = cmp::min(
                stream.data.len(),
                max_size - buf.len() - frame::Stream::SIZE_BOUND,
            );
            let data = stream.data.split_to(len);
            let fin = stream.fin && stream.data.is_empty();
            trace!(id = %stream.id, offset = stream.offset, len, fin, "STREAM");
            let frame = frame::Stream {
                id: stream.id,
                offset: stream.offset,
                fin,
                data,
            };
            frame.encode(true, buf);
            sent.stream.push_back(frame);
            if !stream.data.is_empty() {
                stream.offset += len as u64;
                space.pending.stream.push_front(stream);
            }
        }

        (sent, acks)
    }

    /// Returns packets to transmit
    ///
    /// Connections should be polled for transmit after:
    /// - the application performed some I/O on the connection
    /// - an incoming packet is handled
    /// - the loss detection timer expires
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        let (space_id, close) = match self.state {
            State::Draining | State::Drained => {
                return None;
            }
            State::Closed(_) => {
                if mem::replace(&mut self.io.close, false) {
                    (self.highest_space, true)
                } else {
                    return None;
                }
            }
            _ => {
                let id = SpaceId::VALUES
                    .iter()
                    .find(|&&x| self.space(x).crypto.is_some() && self.space(x).can_send())
                    .cloned()
                    .or_else(|| {
                        if self.space(SpaceId::Data).crypto.is_some() && self.can_send_1rtt() {
                            Some(SpaceId::Data)
                        } else if self.io.probes != 0 {
                            let probe_space = self
                                .probe_space
                                .filter(|&x| self.space(x).crypto.is_some())
                                .unwrap_or(self.highest_space);
                            Some(probe_space)
                        } else if self.zero_rtt_crypto.is_some()
                            && self.side.is_client()
                            && (self.space(SpaceId::Data).can_send() || self.can_send_1rtt())
                        {
                            Some(SpaceId::Data)
                        } else {
                            None
                        }
                    })?;
                (id, false)
            }
        };
        let probe = !close && self.io.probes != 0;
        let mut ack_only = self.space(space_id).pending.is_empty();
        if space_id == SpaceId::Data {
            ack_only &= !self.can_send_1rtt();
            if !probe && !ack_only && self.congestion_blocked() {
                return None;
            }
        }
        if self.state.is_handshake()
            && !self.remote_validated
            && self.side.is_server()
            && self.total_recvd * 3 < self.total_sent + u64::from(self.mtu)
        {
            trace!("blocked by anti-amplification");
            return None;
        }

        //
        // From here on, we've determined that a packet will definitely be sent.
        //

        self.io.probes = self.io.probes.saturating_sub(1);
        if self.io.probes == 0 {
            self.probe_space = None;
        }
        if self.spaces[SpaceId::Initial as usize].crypto.is_some()
            && space_id == SpaceId::Handshake
            && self.side.is_client()
        {
            // A client stops both sending and processing Initial packets when
            // it sends its first Handshake packet
            self.discard_space(SpaceId::Initial);
        }

        let space = &mut self.spaces[space_id as usize];
        let exact_number = space.get_tx_number();
        trace!(space = ?space_id, number = exact_number, "sending packet");
        let number = PacketNumber::new(exact_number, space.largest_acked_packet);
        let header = match space_id {
            SpaceId::Data if space.crypto.is_some() => Header::Short {
                dst_cid: self.rem_cid,
                number,
                spin: self.spin,
                key_phase: self.key_phase,
            },
            SpaceId::Data => Header::Long {
                ty: LongType::ZeroRtt,
                src_cid: self.handshake_cid,
                dst_cid: self.rem_cid,
                number,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                src_cid: self.handshake_cid,
                dst_cid: self.rem_cid,
                number,
            },
            SpaceId::Initial => Header::initial(self.rem_cid, self.handshake_cid, number),
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();

        if probe && ack_only && !self.state.is_handshake() {
            // Nothing ack-eliciting to send, so we need to make something up
            self.ping_pending = true;
            ack_only = false;
        }

        let (tag_len, sample_size) = {
            let crypto = match space.crypto {
                Some(ref crypto) => crypto,
                None => self
                    .zero_rtt_crypto
                    .as_ref()
                    .expect("tried to send 0-RTT without keys"),
            };
            (crypto.packet.tag_len(), crypto.header.sample_size())
        };
        let max_size = self.mtu as usize - tag_len;

        let sent = if close {
            trace!("sending CONNECTION_CLOSE");
            let max_len = max_size - header_len;
            match self.state {
                State::Closed(state::Closed { ref reason }) => reason.encode(&mut buf, max_len),
                _ => unreachable!("tried to make a close packet when the connection wasn't closed"),
            }
            None
        } else {
            Some(self.populate_packet(now, space_id, &mut buf, max_size))
        };

        if !close && buf.len() == header_len {
            // A probe found nothing to carry; an empty payload is illegal, and
            // a bare PING still elicits the ack we're fishing for
            buf.write(frame::Type::PING);
            buf.write::<u8>(0);
            ack_only = false;
        }

        let space = &mut self.spaces[space_id as usize];

        let mut padded = false;
        if self.side.is_client() && space_id == SpaceId::Initial {
            // Initial-bearing datagrams must be padded to defeat amplification
            // attacks launched with tiny packets
            if buf.len() < MIN_INITIAL_SIZE - tag_len {
                buf.resize(MIN_INITIAL_SIZE - tag_len, 0);
                padded = true;
            }
        }

        let pn_len = number.len();
        // Packets must be large enough for the sample used to protect the
        // packet number
        let protected_payload_len = (buf.len() + tag_len) - header_len;
        if let Some(padding_minus_one) =
            (sample_size + 3).checked_sub(pn_len + protected_payload_len)
        {
            let padding = padding_minus_one + 1;
            padded = true;
            trace!(padding, "PADDING");
            buf.resize(buf.len() + padding, 0);
        }
        if !header.is_short() {
            set_payload_length(&mut buf, header_len, pn_len, tag_len);
        }
        {
            let crypto = match space.crypto {
                Some(ref crypto) => crypto,
                None => self.zero_rtt_crypto.as_ref().unwrap(),
            };
            crypto.packet.seal(exact_number, &mut buf, header_len);
            partial_encode.finish(&mut buf, &crypto.header);
        }

        if let Some((sent, acks)) = sent {
            // If we sent any acks, don't immediately resend them. Setting this
            // even if ack_only is false needlessly prevents us from ACKing the
            // next packet if it's ACK-only, but saves the need for subtler
            // logic to avoid double-transmitting acks all the time.
            space.permit_ack_only &= acks.is_empty();

            self.on_packet_sent(
                now,
                space_id,
                exact_number,
                SentPacket {
                    acks,
                    time_sent: now,
                    size: if padded || !ack_only {
                        buf.len() as u16
                    } else {
                        0
                    },
                    is_crypto_packet: space_id != SpaceId::Data && !ack_only,
                    ack_eliciting: !ack_only,
                    retransmits: sent,
                },
            );
        }

        trace!(len = buf.len(), remote = %self.remote, "sending datagram");
        self.total_sent = self.total_sent.wrapping_add(buf.len() as u64);

        Some(Transmit {
            destination: self.remote,
            contents: buf.into(),
            ecn: if self.sending_ecn {
                Some(EcnCodepoint::Ect0)
            } else {
                None
            },
        })
    }

    /// Close a connection immediately
    ///
    /// This does not ensure delivery of outstanding data. It is the
    /// application's responsibility to call this only when all important
    /// communications have been completed.
    pub fn close(&mut self, now: Instant, error_code: u16, reason: Bytes) {
        let was_closed = self.state.is_closed();
        if !was_closed {
            self.close_common(now);
            self.io.close = true;
        }

        match self.state {
            State::Handshake(_) | State::Established => {
                self.state = State::closed(ApplicationClose { error_code, reason });
            }
            _ => {}
        }
    }

    fn close_common(&mut self, now: Instant) {
        trace!("connection closed");
        self.io.timer_stop(Timer::LossDetection);
        self.io.timer_stop(Timer::Idle);
        self.io.timer_stop(Timer::KeepAlive);
        self.io.timer_start(Timer::Close, now + 3 * self.pto());
    }

    /// Open a single stream if possible
    ///
    /// Returns `None` if the streams in the given direction are currently exhausted.
    pub fn open(&mut self, direction: Directionality) -> Option<StreamId> {
        if self.state.is_closed() {
            return None;
        }
        let (id, stream) = match direction {
            Directionality::Uni if self.streams.next_uni < self.streams.max_uni => {
                self.streams.next_uni += 1;
                (
                    StreamId::new(self.side, direction, self.streams.next_uni - 1),
                    stream::Send::new().into(),
                )
            }
            Directionality::Bi if self.streams.next_bi < self.streams.max_bi => {
                self.streams.next_bi += 1;
                (
                    StreamId::new(self.side, direction, self.streams.next_bi - 1),
                    Stream::new_bi(),
                )
            }
            _ => {
                self.space_mut(SpaceId::Data)
                    .pending
                    .stream_id_blocked(direction);
                return None;
            }
        };
        let mut stream = stream;
        if let Some(ss) = stream.send_mut() {
            ss.max_data = match direction {
                Directionality::Uni => u64::from(self.params.initial_max_stream_data_uni),
                Directionality::Bi => {
                    u64::from(self.params.initial_max_stream_data_bidi_remote)
                }
            };
        }
        let old = self.streams.streams.insert(id, stream);
        assert!(old.is_none(), "stream already exists");
        Some(id)
    }

    /// Ping the remote endpoint
    ///
    /// Useful for preventing an otherwise idle connection from timing out.
    pub fn ping(&mut self) {
        self.ping_pending = true;
    }

    /// Issue a PATH_CHALLENGE to confirm the peer still holds its address
    pub fn validate_path(&mut self) {
        if self.path_challenge.is_none() && !self.state.is_closed() {
            self.path_challenge = Some(self.rng.gen());
            self.path_challenge_pending = true;
        }
    }

    /// Whether the current path has been validated since the last challenge
    pub fn path_validated(&self) -> bool {
        self.path_challenge.is_none() && self.remote_validated
    }

    /// Discard state for a stream if it's fully closed
    fn maybe_cleanup(&mut self, id: StreamId) {
        match self.streams.streams.entry(id) {
            std::collections::hash_map::Entry::Vacant(_) => {}
            std::collections::hash_map::Entry::Occupied(e) => {
                if e.get().is_closed() {
                    e.remove_entry();
                    if id.initiator() != self.side {
                        self.alloc_remote_stream(id.directionality());
                    }
                }
            }
        }
    }

    fn alloc_remote_stream(&mut self, ty: Directionality) {
        let space = &mut self.spaces[SpaceId::Data as usize];
        match ty {
            Directionality::Bi => {
                self.streams.max_remote_bi += 1;
                space.pending.max_bi_stream_id = true;
            }
            Directionality::Uni => {
                self.streams.max_remote_uni += 1;
                space.pending.max_uni_stream_id = true;
            }
        };
        let id = StreamId::new(
            !self.side,
            ty,
            match ty {
                Directionality::Bi => self.streams.max_remote_bi - 1,
                Directionality::Uni => self.streams.max_remote_uni - 1,
            },
        );
        let mut stream = match ty {
            Directionality::Bi => Stream::new_bi(),
            Directionality::Uni => stream::Recv::new().into(),
        };
        if let Some(ss) = stream.send_mut() {
            ss.max_data = u64::from(self.params.initial_max_stream_data_bidi_local);
        }
        self.streams.streams.insert(id, stream);
    }

    /// Accept a remotely initiated stream if possible
    pub fn accept(&mut self) -> Option<StreamId> {
        let id = if self.streams.next_reported_remote_uni < self.streams.next_remote_uni {
            let x = self.streams.next_reported_remote_uni;
            self.streams.next_reported_remote_uni = x + 1;
            StreamId::new(!self.side, Directionality::Uni, x)
        } else if self.streams.next_reported_remote_bi < self.streams.next_remote_bi {
            let x = self.streams.next_reported_remote_bi;
            self.streams.next_reported_remote_bi = x + 1;
            StreamId::new(!self.side, Directionality::Bi, x)
        } else {
            return None;
        };
        Some(id)
    }

    /// Signal the end of outgoing data on a stream
    ///
    /// # Panics
    /// - when applied to a stream that does not have an outgoing direction
    pub fn finish(&mut self, id: StreamId) {
        let ss = self
            .streams
            .get_send_mut(id)
            .expect("unknown or recv-only stream");
        assert_eq!(ss.state, stream::SendState::Ready);
        ss.state = stream::SendState::DataSent;
        let offset = ss.offset;
        self.space_mut(SpaceId::Data).finish_stream(id, offset);
    }

    /// Read data from a stream, in order
    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        let rs = self.streams.get_recv_mut(id).expect("not a recv stream");
        match rs.read(buf) {
            Ok(len) => {
                self.local_max_data += len as u64;
                let space = &mut self.spaces[SpaceId::Data as usize];
                space.pending.max_data = true;
                if !rs.is_finished() {
                    space.pending.max_stream_data.insert(id);
                }
                Ok(len)
            }
            e @ Err(ReadError::Finished) | e @ Err(ReadError::Reset { .. }) => {
                self.maybe_cleanup(id);
                e
            }
            e => e,
        }
    }

    /// Read data from a stream without regard for ordering
    ///
    /// May return data well ahead of the current read offset, which the
    /// returned offset identifies.
    pub fn read_unordered(&mut self, id: StreamId) -> Result<(Bytes, u64), ReadError> {
        let rs = self.streams.get_recv_mut(id).expect("not a recv stream");
        match rs.read_unordered() {
            Ok((data, offset)) => {
                self.local_max_data += data.len() as u64;
                let space = &mut self.spaces[SpaceId::Data as usize];
                space.pending.max_data = true;
                if !rs.is_finished() {
                    space.pending.max_stream_data.insert(id);
                }
                Ok((data, offset))
            }
            e @ Err(ReadError::Finished) | e @ Err(ReadError::Reset { .. }) => {
                self.maybe_cleanup(id);
                e
            }
            e => e,
        }
    }

    /// Ask the peer to stop sending on a stream
    pub fn stop_sending(&mut self, id: StreamId, error_code: u16) {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() != self.side,
            "only streams supporting incoming data may be stopped"
        );
        let stream = self
            .streams
            .streams
            .get(&id)
            .expect("stream must have begun sending to be stopped")
            .recv()
            .unwrap();
        // Only bother if there's data we haven't received yet
        if !stream.is_finished() {
            self.space_mut(SpaceId::Data)
                .pending
                .stop_sending
                .push((id, error_code));
        }
    }

    fn congestion_blocked(&self) -> bool {
        self.congestion_window < self.in_flight.bytes + u64::from(self.mtu)
    }

    fn blocked(&self) -> bool {
        self.data_sent >= self.max_data || self.congestion_blocked()
    }

    fn decrypt_packet(&mut self, packet: &mut Packet) -> Result<Option<u64>, Option<TransportError>> {
        if !packet.header.is_protected() {
            // Unprotected packets also don't have packet numbers
            return Ok(None);
        }
        let space = packet.header.space();
        let rx_packet = self.space(space).rx_packet;
        let number = packet.header.number().unwrap().expand(rx_packet + 1);

        if let Header::Short { key_phase, .. } = packet.header {
            // Key updates are unimplemented; remember the phase regardless
            self.key_phase = key_phase;
        }
        let crypto = if packet.header.is_0rtt() {
            &self.zero_rtt_crypto.as_ref().unwrap().packet
        } else {
            &self.space(space).crypto.as_ref().unwrap().packet
        };

        crypto
            .open(number, &packet.header_data, &mut packet.payload)
            .map_err(|_| None)?;
        Ok(Some(number))
    }

    /// Transmit data on a stream
    ///
    /// Returns the number of bytes successfully written.
    pub fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<usize, WriteError> {
        assert!(stream.directionality() == Directionality::Bi || stream.initiator() == self.side);
        if self.state.is_closed() {
            trace!(stream = %stream, "write blocked; connection draining");
            return Err(WriteError::Blocked);
        }

        if self.blocked() {
            if self.data_sent >= self.max_data {
                self.space_mut(SpaceId::Data).pending.blocked = true;
            }
            trace!(stream = %stream, "write blocked by connection-level flow control or congestion");
            self.blocked_streams.insert(stream);
            return Err(WriteError::Blocked);
        }
        let conn_budget = self.max_data - self.data_sent;

        let ss = self
            .streams
            .get_send_mut(stream)
            .expect("stream already closed");
        let stream_budget = match ss.write_budget() {
            Ok(budget) => budget,
            Err(e) => {
                if let WriteError::Blocked = e {
                    self.space_mut(SpaceId::Data)
                        .pending
                        .stream_blocked
                        .insert(stream);
                    trace!(stream = %stream, "write blocked by stream-level flow control");
                }
                return Err(e);
            }
        };

        let n = conn_budget.min(stream_budget).min(data.len() as u64) as usize;
        self.queue_stream_data(stream, Bytes::copy_from_slice(&data[..n]));
        trace!(stream = %stream, len = n, "wrote data");
        Ok(n)
    }

    /// Whether the handshake is still in progress
    pub fn is_handshaking(&self) -> bool {
        self.state.is_handshake()
    }

    /// Whether the connection is closed or in the process of closing
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether the connection has been fully terminated and may be freed
    pub fn is_drained(&self) -> bool {
        self.state.is_drained()
    }

    /// Whether 0-RTT data was accepted by the peer
    pub fn accepted_0rtt(&self) -> bool {
        self.accepted_0rtt
    }

    /// Whether 0-RTT keys are available for sending
    pub fn has_0rtt(&self) -> bool {
        self.zero_rtt_crypto.is_some()
    }

    /// Which side of the connection we are
    pub fn side(&self) -> Side {
        self.side
    }

    /// The CID the peer is currently addressed by
    pub fn rem_cid(&self) -> ConnectionId {
        self.rem_cid
    }

    /// Total number of outgoing packets that have been deemed lost
    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    /// Bytes of unacknowledged in-flight data
    pub fn bytes_in_flight(&self) -> u64 {
        self.in_flight.bytes
    }

    /// Current congestion window, in bytes
    pub fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    fn space(&self, id: SpaceId) -> &PacketSpace<S::Keys> {
        &self.spaces[id as usize]
    }

    fn space_mut(&mut self, id: SpaceId) -> &mut PacketSpace<S::Keys> {
        &mut self.spaces[id as usize]
    }

    fn can_send_1rtt(&self) -> bool {
        self.ping_pending
            || self.pong_pending.is_some()
            || self.path_response.is_some()
            || self.path_challenge_pending
    }
}

#[cfg(test)]
impl<S> Connection<S>
where
    S: Session,
{
    /// Pretend the peer granted a larger stream send window than it did
    pub(crate) fn force_stream_send_limit(&mut self, id: StreamId, limit: u64) {
        self.streams.get_send_mut(id).unwrap().max_data = limit;
    }

    /// Pretend the peer granted a larger connection send window than it did
    pub(crate) fn force_connection_send_limit(&mut self, limit: u64) {
        self.max_data = limit;
    }

    /// The destination CID carried by the first Initial packet
    pub(crate) fn initial_dcid(&self) -> ConnectionId {
        self.init_cid
    }

    /// Whether the peer is still addressed by the CID it chose at handshake time
    pub(crate) fn using_handshake_rem_cid(&self) -> bool {
        self.rem_cid_seq == 0
    }
}

/// I/O actions queued for upcoming polls
#[derive(Debug)]
struct IoQueue {
    /// Number of probe packets to transmit
    probes: u8,
    /// Whether to transmit a close packet
    close: bool,
    /// Changes to each of the connection's timers
    timers: [Option<TimerSetting>; Timer::COUNT],
}

impl IoQueue {
    fn new() -> Self {
        Self {
            probes: 0,
            close: false,
            timers: [None; Timer::COUNT],
        }
    }

    /// Start or reset a timer associated with this connection.
    fn timer_start(&mut self, timer: Timer, time: Instant) {
        self.timers[timer as usize] = Some(TimerSetting::Start(time));
    }

    /// Stop one of the timers associated with this connection.
    fn timer_stop(&mut self, timer: Timer) {
        self.timers[timer as usize] = Some(TimerSetting::Stop);
    }
}

/// Change applicable to one of a connection's timers
#[derive(Debug, Copy, Clone)]
pub enum TimerSetting {
    /// Set the timer to expire at a certain point in time
    Start(Instant),
    /// Cancel the timer if it's currently running
    Stop,
}

/// Change to apply to a specific timer
#[derive(Debug, Copy, Clone)]
pub struct TimerUpdate {
    pub timer: Timer,
    pub update: TimerSetting,
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// The connection was successfully established
    Connected,
    /// The connection was lost
    ///
    /// Emitted at the end of the lifetime of a connection, even if it was
    /// closed locally.
    ConnectionLost {
        /// Why the connection ended
        reason: ConnectionError,
    },
    /// One or more new streams has been opened by the peer
    StreamOpened,
    /// An existing stream has data waiting to be read
    StreamReadable {
        /// The affected stream
        stream: StreamId,
    },
    /// A formerly write-blocked stream might now accept a write
    StreamWritable {
        /// The affected stream
        stream: StreamId,
    },
    /// All data sent on a stream has been received by the peer
    StreamFinished {
        /// The affected stream
        stream: StreamId,
    },
    /// At least one new stream of a certain directionality may be opened
    StreamAvailable {
        /// On which direction streams are newly available
        directionality: Directionality,
    },
}

impl From<ConnectionError> for Event {
    fn from(x: ConnectionError) -> Self {
        Event::ConnectionLost { reason: x }
    }
}

/// Reasons why a connection might be lost
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The peer doesn't implement any supported version
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {reason}")]
    ConnectionClosed {
        /// The reason for closing
        reason: ConnectionClose,
    },
    /// The peer closed the connection
    #[error("closed by peer: {reason}")]
    ApplicationClosed {
        /// The reason for closing
        reason: ApplicationClose,
    },
    /// The peer is unable to continue processing this connection, usually due to having restarted
    #[error("reset by peer")]
    Reset,
    /// The peer has become unreachable
    #[error("timed out")]
    TimedOut,
}

#[derive(Clone)]
enum State {
    Handshake(state::Handshake),
    Established,
    /// A close is being sent to the peer in response to any incoming traffic
    Closed(state::Closed),
    /// Terminating quietly; all output is suppressed until the drain period ends
    Draining,
    /// Waiting for the application to observe the end of the connection
    Drained,
}

impl State {
    fn closed<R: Into<Close>>(reason: R) -> Self {
        State::Closed(state::Closed {
            reason: reason.into(),
        })
    }

    fn is_handshake(&self) -> bool {
        matches!(*self, State::Handshake(_))
    }

    fn is_closed(&self) -> bool {
        matches!(*self, State::Closed(_) | State::Draining | State::Drained)
    }

    fn is_drained(&self) -> bool {
        matches!(*self, State::Drained)
    }
}

mod state {
    use super::*;

    #[derive(Clone)]
    pub struct Handshake {
        /// Whether the remote CID has been set by the peer yet
        ///
        /// Always set for servers
        pub rem_cid_set: bool,
    }

    #[derive(Clone)]
    pub struct Closed {
        pub reason: Close,
    }
}

/// Represents one or more packets subject to retransmission
#[derive(Debug, Clone)]
struct PathResponse {
    /// The packet number the corresponding PATH_CHALLENGE was received in
    packet: u64,
    token: u64,
}

struct InFlight {
    /// Sum of the sizes of all sent packets considered "in flight" by
    /// congestion control
    ///
    /// The size does not include IP or UDP overhead. Packets only containing
    /// ACK frames do not count towards this to ensure congestion control does
    /// not impede congestion feedback.
    bytes: u64,
    /// Number of unacknowledged Initial or Handshake packets bearing CRYPTO frames
    crypto: u64,
    /// Number of packets in flight containing frames other than ACK and PADDING
    ///
    /// This can be 0 even when bytes is not 0 because PADDING frames cause a
    /// packet to be considered "in flight" by congestion control.
    ack_eliciting: u64,
}

impl InFlight {
    fn new() -> Self {
        Self {
            bytes: 0,
            crypto: 0,
            ack_eliciting: 0,
        }
    }

    fn insert(&mut self, packet: &SentPacket) {
        self.bytes += u64::from(packet.size);
        self.crypto += u64::from(packet.is_crypto_packet);
        self.ack_eliciting += u64::from(packet.ack_eliciting);
    }

    /// Update counters to account for a packet becoming acknowledged, lost, or abandoned
    fn remove(&mut self, packet: &SentPacket) {
        self.bytes -= u64::from(packet.size);
        self.crypto -= u64::from(packet.is_crypto_packet);
        self.ack_eliciting -= u64::from(packet.ack_eliciting);
    }
}

struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC 6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC 6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay
    min: Duration,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            latest: Duration::new(0, 0),
            smoothed: None,
            var: Duration::new(0, 0),
            min: Duration::new(u64::MAX, 0),
        }
    }

    fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        // Adjust for ack delay if it's plausible.
        if self.latest - self.min > ack_delay {
            self.latest -= ack_delay;
        }
        // Based on RFC 6298.
        if let Some(smoothed) = self.smoothed {
            let var_sample = if smoothed > self.latest {
                smoothed - self.latest
            } else {
                self.latest - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + self.latest) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
        }
    }
}

fn micros_from(x: Duration) -> u64 {
    x.as_secs() * 1000 * 1000 + u64::from(x.subsec_micros())
}

/// Ensures we can always fit all our ACKs in a single minimum-MTU packet with room to spare
const MAX_ACK_BLOCKS: usize = 64;

/// Limit on packets buffered while awaiting keys for their encryption level
const MAX_UNKEYED_PACKETS: usize = 10;

/// Number of additional connection IDs offered to the peer after the handshake
const CIDS_OFFERED: u64 = 4;

/// Limit on peer-supplied connection IDs retained for future use
const MAX_REMOTE_CIDS: usize = 32;

// Prevents overflow and improves behavior in extreme circumstances
const MAX_BACKOFF_EXPONENT: u32 = 16;
