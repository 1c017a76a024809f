use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::assembler::Assembler;
use crate::crypto::{CryptoSpace, PacketKeys};
use crate::frame;
use crate::range_set::RangeSet;
use crate::{Directionality, StreamId};

pub(crate) struct PacketSpace<K: PacketKeys> {
    pub(crate) crypto: Option<CryptoSpace<K>>,
    pub(crate) dedup: Dedup,
    /// Highest received packet number
    pub(crate) rx_packet: u64,
    /// Time at which the above was received
    pub(crate) rx_packet_time: Instant,

    /// Data to send
    pub(crate) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(crate) pending_acks: RangeSet,
    /// Set iff we have received a non-ack frame since the last ack-only packet we sent
    pub(crate) permit_ack_only: bool,

    /// The packet number of the next packet that will be sent, if any
    pub(crate) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(crate) largest_acked_packet: u64,
    /// Transmitted but not acked
    // BTreeMap for efficient range queries on ACK and during loss detection
    pub(crate) sent_packets: BTreeMap<u64, SentPacket>,
    /// Recent ECN counters sent by the peer in ACK frames
    ///
    /// Updated (and inspected) whenever we receive an ACK with a new highest
    /// acked packet number. Stored per space so that validation is not
    /// confused by near-simultaneous ACKs already processed in another space.
    pub(crate) ecn_feedback: frame::EcnCounts,

    /// Incoming cryptographic handshake stream
    pub(crate) crypto_stream: Assembler,
    /// Current offset of outgoing cryptographic handshake stream
    pub(crate) crypto_offset: u64,
}

impl<K: PacketKeys> PacketSpace<K> {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,
            rx_packet_time: now,

            pending: Retransmits::default(),
            pending_acks: RangeSet::new(),
            permit_ack_only: false,

            next_packet_number: 0,
            largest_acked_packet: 0,
            sent_packets: BTreeMap::new(),
            ecn_feedback: frame::EcnCounts::ZERO,

            crypto_stream: Assembler::new(),
            crypto_offset: 0,
        }
    }

    /// Assigns the packet number for the next packet sent in this space
    ///
    /// Strictly increasing; numbers are never reused, so data lost in one
    /// packet is always rebundled under a fresh number.
    pub(crate) fn get_tx_number(&mut self) -> u64 {
        // TODO: Handle packet number overflow gracefully
        assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    pub(crate) fn can_send(&self) -> bool {
        !self.pending.is_empty() || (self.permit_ack_only && !self.pending_acks.is_empty())
    }

    /// Restart receive-side packet number tracking, as after answering an
    /// Initial with a version negotiation packet
    pub(crate) fn reset_rx_state(&mut self, now: Instant) {
        self.dedup = Dedup::new();
        self.rx_packet = 0;
        self.rx_packet_time = now;
        self.pending_acks = RangeSet::new();
        self.permit_ack_only = false;
    }

    /// Verifies sanity of an ECN block and returns whether congestion was encountered
    pub(crate) fn detect_ecn(
        &mut self,
        newly_acked: u64,
        ecn: frame::EcnCounts,
    ) -> Result<bool, &'static str> {
        let ect0_increase = ecn
            .ect0
            .checked_sub(self.ecn_feedback.ect0)
            .ok_or("peer ECT(0) count regression")?;
        let ect1_increase = ecn
            .ect1
            .checked_sub(self.ecn_feedback.ect1)
            .ok_or("peer ECT(1) count regression")?;
        let ce_increase = ecn
            .ce
            .checked_sub(self.ecn_feedback.ce)
            .ok_or("peer CE count regression")?;
        let total_increase = ect0_increase + ect1_increase + ce_increase;
        if total_increase < newly_acked {
            return Err("ECN bleaching");
        }
        if (ect0_increase + ce_increase) < newly_acked || ect1_increase != 0 {
            return Err("ECN corruption");
        }
        self.ecn_feedback = ecn;
        Ok(ce_increase != 0)
    }

    /// Queue a FIN for `id` at `offset`, merging with pending data when possible
    pub(crate) fn finish_stream(&mut self, id: StreamId, offset: u64) {
        for frame in &mut self.pending.stream {
            if frame.id == id && frame.offset + frame.data.len() as u64 == offset {
                frame.fin = true;
                return;
            }
        }
        self.pending.stream.push_back(frame::Stream {
            id,
            data: bytes::Bytes::new(),
            offset,
            fin: true,
        });
    }
}

/// Represents one or more packets subject to retransmission
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    /// The time the packet was sent
    pub(crate) time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP
    /// overhead, but including QUIC framing overhead. Zero if this packet is
    /// not counted towards congestion control, i.e. not an "in flight" packet.
    pub(crate) size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet
    pub(crate) ack_eliciting: bool,
    /// Whether the packet carries handshake bytes whose loss would stall the handshake
    pub(crate) is_crypto_packet: bool,
    /// The acknowledgments this packet conveyed
    pub(crate) acks: RangeSet,
    /// Data carried, for rebundling under a new packet number if lost
    pub(crate) retransmits: Retransmits,
}

/// Retransmittable data queue
#[derive(Debug, Clone, Default)]
pub(crate) struct Retransmits {
    pub(crate) max_data: bool,
    pub(crate) max_uni_stream_id: bool,
    pub(crate) max_bi_stream_id: bool,
    pub(crate) blocked: bool,
    pub(crate) stream_id_blocked_uni: bool,
    pub(crate) stream_id_blocked_bi: bool,
    pub(crate) stream_blocked: FxHashSet<StreamId>,
    pub(crate) stream: VecDeque<frame::Stream>,
    pub(crate) rst_stream: Vec<(StreamId, u16)>,
    pub(crate) stop_sending: Vec<(StreamId, u16)>,
    pub(crate) max_stream_data: FxHashSet<StreamId>,
    pub(crate) crypto: VecDeque<frame::Crypto>,
    pub(crate) new_cids: Vec<frame::NewConnectionId>,
}

impl Retransmits {
    pub(crate) fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_uni_stream_id
            && !self.max_bi_stream_id
            && !self.blocked
            && !self.stream_id_blocked_uni
            && !self.stream_id_blocked_bi
            && self.stream_blocked.is_empty()
            && self.stream.is_empty()
            && self.rst_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.crypto.is_empty()
            && self.new_cids.is_empty()
    }

    pub(crate) fn stream_id_blocked(&mut self, directionality: Directionality) {
        match directionality {
            Directionality::Uni => self.stream_id_blocked_uni = true,
            Directionality::Bi => self.stream_id_blocked_bi = true,
        }
    }
}

impl ::std::ops::AddAssign for Retransmits {
    fn add_assign(&mut self, rhs: Self) {
        // Queue recycled STREAM and CRYPTO data ahead of fresh data to limit
        // in-stream head-of-line blocking
        self.max_data |= rhs.max_data;
        self.max_uni_stream_id |= rhs.max_uni_stream_id;
        self.max_bi_stream_id |= rhs.max_bi_stream_id;
        self.blocked |= rhs.blocked;
        self.stream_id_blocked_uni |= rhs.stream_id_blocked_uni;
        self.stream_id_blocked_bi |= rhs.stream_id_blocked_bi;
        self.stream_blocked.extend(&rhs.stream_blocked);
        for stream in rhs.stream.into_iter().rev() {
            self.stream.push_front(stream);
        }
        self.rst_stream.extend_from_slice(&rhs.rst_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        for crypto in rhs.crypto.into_iter().rev() {
            self.crypto.push_front(crypto);
        }
        self.new_cids.extend(&rhs.new_cids);
    }
}

impl ::std::iter::FromIterator<Retransmits> for Retransmits {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Retransmits>,
    {
        let mut result = Retransmits::default();
        for packet in iter {
            result += packet;
        }
        result
    }
}

/// Tracks authenticated packet numbers so replayed packets are dropped
/// before their frames are processed.
///
/// The numbers seen so far are held exactly as ranges. Memory stays bounded
/// by pruning the oldest range once the reordering pattern grows past
/// [`MAX_DEDUP_RANGES`] disjoint clusters; anything beneath the pruning
/// floor is then presumed seen. QUIC never reuses packet numbers, so a
/// legitimate peer loses nothing to pruning.
pub(crate) struct Dedup {
    seen: RangeSet,
    /// Numbers below this have been pruned from `seen` and read as duplicates
    floor: u64,
}

/// Disjoint spans of received packet numbers retained before pruning
const MAX_DEDUP_RANGES: usize = 64;

impl Dedup {
    /// Construct an empty tracker positioned at the start.
    pub(crate) fn new() -> Self {
        Self {
            seen: RangeSet::new(),
            floor: 0,
        }
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub(crate) fn insert(&mut self, packet: u64) -> bool {
        if packet < self.floor {
            return true;
        }
        let duplicate = !self.seen.insert_one(packet);
        if self.seen.len() > MAX_DEDUP_RANGES {
            let pruned = self.seen.pop_min().unwrap();
            self.floor = pruned.end;
        }
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_sanity() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert!(dedup.insert(0));
        assert!(!dedup.insert(1));
        assert!(!dedup.insert(4));
        assert!(dedup.insert(4));
        assert!(!dedup.insert(3));
        assert!(!dedup.insert(2));
        assert!(dedup.insert(2));
        assert!(dedup.insert(1));
    }

    #[test]
    fn dedup_in_order() {
        let mut dedup = Dedup::new();
        for i in 0..500 {
            assert!(!dedup.insert(i));
        }
        for i in 0..500 {
            assert!(dedup.insert(i));
        }
        // One contiguous run never triggers pruning
        assert_eq!(dedup.floor, 0);
    }

    #[test]
    fn dedup_pruning() {
        let mut dedup = Dedup::new();
        // Every other number, so each insert opens a fresh range
        for i in 0..=MAX_DEDUP_RANGES as u64 {
            assert!(!dedup.insert(2 * i));
        }
        // The oldest range fell off; numbers beneath the floor read as seen
        assert!(dedup.floor > 0);
        assert!(dedup.insert(0));
        // Gaps above the floor still fill in normally
        assert!(!dedup.insert(3));
        assert!(dedup.insert(4));
    }
}
