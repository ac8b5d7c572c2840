use core::fmt;
use std::net::SocketAddr;

use crate::config::Config;
use crate::phy::{Device, MAX_PACKET_SIZE};
use crate::storage::RangeSet;
use crate::time::{Duration, Instant};
use crate::wire::{Packet, PacketKind, Repr, SeqNumber, SeqRange, MAX_SACKS, MAX_SEGMENT_SIZE};

pub(crate) mod congestion;

use self::congestion::{Controller, Recovery};

const MSS: u32 = MAX_SEGMENT_SIZE as u32;

/// The state of a connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    /// Allocated but not yet started in either direction.
    Init,
    /// We sent (or are about to send) a CONNECT and wait for its ACK.
    ConnectStarted,
    /// A CONNECT arrived while ours was in flight: simultaneous open.
    ConnectReceivedWhileStarted,
    /// A CONNECT arrived from an unknown peer; awaiting confirmation.
    ConnectReceived,
    /// Handshake complete, data may flow.
    Connected,
    /// Terminated; only `close` remains meaningful.
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Init => write!(f, "INIT"),
            State::ConnectStarted => write!(f, "CONNECT-STARTED"),
            State::ConnectReceivedWhileStarted => write!(f, "CONNECT-RECEIVED-WHILE-STARTED"),
            State::ConnectReceived => write!(f, "CONNECT-RECEIVED"),
            State::Connected => write!(f, "CONNECTED"),
            State::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Result of one handshake timer poll.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum HandshakePoll {
    /// Nothing was due.
    Idle,
    /// A CONNECT or ACCEPT went out.
    Progressed,
    /// The attempt budget is spent; the connection must be torn down.
    Exhausted,
}

/// Outcome of a confirming packet on an unconfirmed incoming connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum ConfirmOutcome {
    /// The packet did not confirm anything; drop it.
    Ignored,
    /// A rendezvous connection completed; this side also initiated.
    Rendezvous,
    /// A plain incoming connection completed.
    Incoming,
}

/// One logical connection multiplexed over a host's datagram socket.
///
/// Holds both directions of the byte stream: a fixed receive buffer with
/// the descriptors of out-of-order data, and a lazily grown send buffer
/// with the peer's selective acknowledgments and the congestion state.
/// All timers are driven by the instants handed down from the host's poll.
#[derive(Debug)]
pub struct Connection {
    pub(crate) state: State,
    pub(crate) config: Config,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) local_port: u16,
    pub(crate) remote_port: u16,
    pub(crate) created_at: Instant,
    pub(crate) connect_attempts: u8,

    /// Fixed-size receive window; `rx_buffer[0]` corresponds to `rx_start_seq`.
    pub(crate) rx_buffer: Vec<u8>,
    /// Received but not yet contiguous ranges present in `rx_buffer`.
    pub(crate) rx_segments: RangeSet,
    /// Length of the contiguous prefix ready for `read`.
    pub(crate) rx_bytes_ready: u32,
    /// Sequence number of `rx_buffer[0]`, the next byte expected in order.
    pub(crate) rx_start_seq: SeqNumber,
    pub(crate) rx_last_packet_at: Instant,

    /// Unacknowledged and unsent data; `tx_buffer[0]` is `tx_start_seq`.
    pub(crate) tx_buffer: Vec<u8>,
    /// Ranges above `tx_start_seq` the peer holds out of order.
    pub(crate) tx_acked: RangeSet,
    /// First unacknowledged sequence number.
    pub(crate) tx_start_seq: SeqNumber,
    /// Next sequence number to transmit.
    pub(crate) tx_next_seq: SeqNumber,
    /// `None` until the first packet leaves, which makes the first
    /// handshake transmission due immediately.
    pub(crate) tx_last_packet_at: Option<Instant>,
    /// Acknowledgment-only packets currently owed to the peer.
    pub(crate) tx_mandatory_acks: u8,
    /// Payload packets seen since the last scheduled acknowledgment.
    pub(crate) tx_acks_skipped: u8,

    pub(crate) congestion: Controller,
}

impl Connection {
    pub(crate) fn new(
        config: Config,
        remote_addr: SocketAddr,
        local_port: u16,
        isn: SeqNumber,
        now: Instant,
    ) -> Connection {
        Connection {
            state: State::Init,
            config,
            remote_addr,
            local_port,
            remote_port: 0,
            created_at: now,
            connect_attempts: 0,
            rx_buffer: Vec::new(),
            rx_segments: RangeSet::new(),
            rx_bytes_ready: 0,
            rx_start_seq: SeqNumber(0),
            rx_last_packet_at: now,
            tx_buffer: Vec::new(),
            tx_acked: RangeSet::new(),
            tx_start_seq: isn,
            tx_next_seq: isn,
            tx_last_packet_at: None,
            tx_mandatory_acks: 0,
            tx_acks_skipped: 0,
            congestion: Controller::new(now),
        }
    }

    /// The current connection state.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The peer's address; meaningful once a handshake direction is known.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Bytes currently ready for [`read`](Connection::read).
    pub fn bytes_ready(&self) -> u32 {
        self.rx_bytes_ready
    }

    /// Free space in the send buffer.
    pub fn send_capacity(&self) -> usize {
        self.config.connection_buf_size as usize - self.tx_buffer.len()
    }

    /// Release every buffer; the connection keeps only its identity.
    pub(crate) fn release(&mut self) {
        self.rx_buffer = Vec::new();
        self.tx_buffer = Vec::new();
        self.rx_segments.clear();
        self.tx_acked.clear();
        self.rx_bytes_ready = 0;
    }

    fn since(now: Instant, when: Option<Instant>) -> Duration {
        match when {
            Some(when) => now - when,
            None => Duration::MAX,
        }
    }

    // === user-facing data path ===

    /// Append up to `data.len()` bytes to the send buffer, returning how
    /// many were accepted. Zero unless the connection is established or
    /// the buffer is full.
    pub fn send(&mut self, data: &[u8]) -> usize {
        if self.state != State::Connected {
            return 0;
        }

        let room = self.config.connection_buf_size as usize - self.tx_buffer.len();
        let accepted = data.len().min(room);
        self.tx_buffer.extend_from_slice(&data[..accepted]);
        accepted
    }

    /// Copy up to `buf.len()` contiguous bytes out of the receive buffer,
    /// advancing the receive window. Zero unless established.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.state != State::Connected {
            return 0;
        }

        let count = (self.rx_bytes_ready as usize).min(buf.len());
        if count == 0 {
            return 0;
        }

        buf[..count].copy_from_slice(&self.rx_buffer[..count]);
        self.rx_buffer.copy_within(count.., 0);
        self.rx_start_seq += count as u32;
        self.rx_bytes_ready -= count as u32;
        count
    }

    // === receiver engine ===

    /// Place an arriving payload into the receive buffer and record its
    /// range. Returns whether any part of it fell inside the window.
    pub(crate) fn deposit(&mut self, seq: SeqNumber, payload: &[u8]) -> bool {
        let win_start = self.rx_start_seq + self.rx_bytes_ready;
        let win_end = self.rx_start_seq + (self.config.connection_buf_size - 1);

        let data_start = seq;
        let data_end = seq + (payload.len() as u32 - 1);

        // no space, or entirely outside the window
        if win_end < win_start {
            return false;
        }
        if data_end < win_start {
            return false;
        }
        if win_end < data_start {
            return false;
        }

        let common_start = data_start.max(win_start);
        let common_end = win_end.min(data_end);
        let size = common_end - common_start + 1;

        let buf_pos = (common_start - self.rx_start_seq) as usize;
        let data_pos = (common_start - data_start) as usize;
        self.rx_buffer[buf_pos..buf_pos + size as usize]
            .copy_from_slice(&payload[data_pos..data_pos + size as usize]);

        self.rx_segments.insert(SeqRange::new(common_start, size));
        true
    }

    /// Extend the contiguous prefix with any segments that now adjoin it,
    /// returning the number of newly readable bytes.
    pub(crate) fn deliver_ready(&mut self) -> u32 {
        let expected = self.rx_start_seq + self.rx_bytes_ready;
        let added = self.rx_segments.take_contiguous(expected);
        self.rx_bytes_ready += added;
        added
    }

    /// Account one received payload packet against the delayed-ACK policy.
    fn schedule_ack(&mut self) {
        if (self.tx_mandatory_acks as u32) >= self.config.max_consecutive_acknowledges {
            return;
        }
        if self.tx_mandatory_acks == 0 {
            // always answer the first unacknowledged packet
            self.tx_mandatory_acks = 1;
            self.tx_acks_skipped = 0;
        } else if (self.tx_acks_skipped as u32) >= self.config.skip_packets_before_acknowledgement {
            self.tx_mandatory_acks += 1;
            self.tx_acks_skipped = 0;
        } else {
            self.tx_acks_skipped += 1;
        }
    }

    // === packet output ===

    /// Build and send one packet. The header always carries the cumulative
    /// ACK and up to [MAX_SACKS] ranges from the head of `rx_segments`;
    /// `max_payload` bytes of `tx_buffer` starting at `seq` follow. Returns
    /// payload bytes sent; a send shorter than the header counts as a drop.
    fn transmit_segment(
        &mut self,
        kind: PacketKind,
        seq: SeqNumber,
        max_payload: u32,
        now: Instant,
        device: &mut dyn Device,
    ) -> u32 {
        let offset = (seq - self.tx_start_seq) as usize;
        if offset >= self.tx_buffer.len() {
            return 0;
        }

        let mut sacks = heapless::Vec::<SeqRange, MAX_SACKS>::new();
        for range in self.rx_segments.iter().take(MAX_SACKS) {
            let _ = sacks.push(range);
        }

        let repr = Repr {
            kind,
            src_port: self.local_port,
            dst_port: self.remote_port,
            seq_number: seq,
            ack_number: self.rx_start_seq,
            sacks,
        };

        let header_len = repr.header_len();
        let available = self.tx_buffer.len() - offset;
        let payload_len = available
            .min(max_payload as usize)
            .min(MAX_PACKET_SIZE - header_len);

        let mut frame = [0u8; MAX_PACKET_SIZE];
        let frame_len = header_len + payload_len;
        let mut packet = Packet::new_unchecked(&mut frame[..frame_len]);
        repr.emit(&mut packet);
        packet
            .payload_mut()
            .copy_from_slice(&self.tx_buffer[offset..offset + payload_len]);

        let sent = device.send(&frame[..frame_len], self.remote_addr);
        if sent < header_len {
            return 0;
        }

        self.tx_last_packet_at = Some(now);
        if self.tx_mandatory_acks > 0 {
            self.tx_mandatory_acks -= 1;
        }
        (sent - header_len) as u32
    }

    /// Send a payload-free packet: handshake, bare ACK or ping.
    fn send_empty(&mut self, kind: PacketKind, now: Instant, device: &mut dyn Device) {
        let mut sacks = heapless::Vec::<SeqRange, MAX_SACKS>::new();
        for range in self.rx_segments.iter().take(MAX_SACKS) {
            let _ = sacks.push(range);
        }

        let repr = Repr {
            kind,
            src_port: self.local_port,
            dst_port: self.remote_port,
            seq_number: self.tx_start_seq,
            ack_number: self.rx_start_seq,
            sacks,
        };

        let mut frame = [0u8; MAX_PACKET_SIZE];
        let frame_len = repr.header_len();
        repr.emit(&mut Packet::new_unchecked(&mut frame[..frame_len]));

        let sent = device.send(&frame[..frame_len], self.remote_addr);
        if sent >= frame_len {
            self.tx_last_packet_at = Some(now);
            if self.tx_mandatory_acks > 0 {
                self.tx_mandatory_acks -= 1;
            }
        }
    }

    /// Transmit new data at `tx_next_seq`, clipped by `window` bytes of
    /// outstanding data. Arms the retransmission timer on success.
    fn send_new(&mut self, window: u32, now: Instant, device: &mut dyn Device) -> u32 {
        let in_flight = self.tx_next_seq - self.tx_start_seq;
        let limit = (self.tx_buffer.len() as u32).min(window);
        if in_flight >= limit {
            return 0;
        }

        let sent = self.transmit_segment(
            PacketKind::Data,
            self.tx_next_seq,
            limit - in_flight,
            now,
            device,
        );
        if sent > 0 {
            net_trace!(
                "rudp: data sent ({} octets, seq {}, ack {})",
                sent,
                self.tx_next_seq,
                self.rx_start_seq
            );
            self.tx_next_seq += sent;
            // reset the retransmission timer
            self.congestion.last_data_sent_at = now;
        }
        sent
    }

    /// Retransmit buffered data starting at `seq`, without touching the
    /// retransmission timer.
    fn transmit_at(
        &mut self,
        seq: SeqNumber,
        max_payload: u32,
        now: Instant,
        device: &mut dyn Device,
    ) -> u32 {
        let sent = self.transmit_segment(PacketKind::Data, seq, max_payload, now, device);
        if sent > 0 && self.tx_next_seq < seq + sent {
            self.tx_next_seq = seq + sent;
        }
        sent
    }

    // === sender engine: acknowledgment intake ===

    pub(crate) fn process_established(
        &mut self,
        repr: &Repr,
        payload: &[u8],
        now: Instant,
        device: &mut dyn Device,
    ) {
        if repr.src_port != self.remote_port {
            return;
        }

        self.rx_last_packet_at = now;

        if !self.tx_buffer.is_empty() {
            let acked = self.take_acknowledged(repr.ack_number);
            if acked > 0 {
                self.tx_acked.prune(repr.ack_number);
                self.merge_peer_sacks(&repr.sacks);
                self.on_ack_progress(acked, now, device);
            } else {
                self.merge_peer_sacks(&repr.sacks);
                self.on_duplicate_ack(repr.ack_number);
            }
        }

        if !payload.is_empty() && self.deposit(repr.seq_number, payload) {
            self.schedule_ack();
        }
    }

    /// Drop data covered by the cumulative acknowledgment from the send
    /// buffer. Returns the number of newly acknowledged bytes.
    fn take_acknowledged(&mut self, ack: SeqNumber) -> u32 {
        let win_start = self.tx_start_seq;
        let win_end = self.tx_next_seq - 1;
        let last_acked = ack - 1;

        if last_acked < win_start {
            return 0;
        }
        if win_end < last_acked {
            return 0;
        }

        let bytes = ack - win_start;
        self.tx_buffer.drain(..bytes as usize);
        self.tx_start_seq = ack;

        net_trace!("rudp: ack {} accepted {} octets", ack, bytes);
        bytes
    }

    /// Merge the packet's SACK table, keeping only ranges that lie within
    /// the send window.
    fn merge_peer_sacks(&mut self, sacks: &[SeqRange]) {
        for range in sacks {
            if range.start >= self.tx_start_seq && range.end() <= self.tx_next_seq {
                self.tx_acked.insert(*range);
            }
        }
    }

    /// The cumulative acknowledgment moved: grow the window, or drive the
    /// recovery state machine forward.
    fn on_ack_progress(&mut self, bytes_acked: u32, now: Instant, device: &mut dyn Device) {
        if self.congestion.recovery != Recovery::Off {
            if self.tx_start_seq < self.congestion.recovery_point {
                // still recovering; credit a full segment once one is acked
                if bytes_acked >= MSS {
                    self.congestion.inflate(MSS, &self.config);
                }
            } else if !self.tx_acked.is_empty() {
                // data beyond the recovery point was lost as well
                let mode = self.congestion.recovery;
                self.enter_recovery(mode, now, device);
            } else {
                self.congestion.exit_recovery(&self.config);
            }
        } else if self.congestion.cwnd < self.congestion.ssthresh {
            // slow start
            let cap = self.config.max_cwnd_inc_on_slowstart_in_packets * MSS;
            self.congestion.inflate(bytes_acked.min(cap), &self.config);
        } else {
            // congestion avoidance
            let increment = MSS * MSS / self.congestion.cwnd;
            self.congestion.inflate(increment, &self.config);
        }

        self.congestion.duplicate_acks = 0;
        // reset the retransmission timer
        self.congestion.last_data_sent_at = now;
    }

    /// An acknowledgment that moved nothing. It counts as a duplicate only
    /// when it names the head of outstanding data and the peer reported
    /// out-of-order ranges.
    fn on_duplicate_ack(&mut self, ack: SeqNumber) {
        if ack != self.tx_start_seq || !(ack < self.tx_next_seq) {
            return;
        }
        if self.tx_acked.is_empty() {
            return;
        }

        self.congestion.duplicate_acks = self.congestion.duplicate_acks.saturating_add(1);

        if self.congestion.recovery != Recovery::Off {
            // one more segment has left the network
            self.congestion.inflate(MSS, &self.config);
            net_trace!(
                "rudp: duplicate ack in recovery, cwnd {}",
                self.congestion.cwnd
            );
        }
    }

    // === sender engine: transmission selection ===

    /// At most one data transmission per poll tick.
    pub(crate) fn egress(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        if !self.tx_buffer.is_empty() && self.transmit_pending(now, device) {
            return true;
        }

        // no data went out, so maybe a special packet is due
        if self.send_pending_ack(now, device) {
            return true;
        }
        self.send_keepalive(now, device)
    }

    fn transmit_pending(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        let sent = if self.congestion.recovery != Recovery::Off {
            self.egress_recovery(now, device)
        } else {
            self.egress_normal(now, device)
        };
        if sent {
            return true;
        }

        // check the timer last, once the pending data had its chance
        self.poll_retransmit_timer(now, device)
    }

    fn egress_normal(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        if (self.congestion.duplicate_acks as u32) >= self.config.duplicate_acks_for_retransmit {
            return self.enter_recovery(Recovery::ByLoss, now, device);
        }

        if self.congestion.duplicate_acks > 0 {
            // limited transmit
            let window = self.congestion.cwnd + self.congestion.duplicate_acks as u32 * MSS;
            return self.send_new(window, now, device) > 0;
        }

        self.send_new(self.congestion.cwnd, now, device) > 0
    }

    fn egress_recovery(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        if self.retransmit_next_hole(now, device) > 0 {
            return true;
        }

        if (self.congestion.duplicate_acks as u32) >= self.config.duplicate_acks_for_retransmit
            && self.congestion.retransmit_rescue < self.congestion.retransmit_next
        {
            // retransmitted packets seem lost themselves; resend the head
            // segment, it is the most robust thing to put on the wire
            if self.retransmit_clamped(self.tx_start_seq, u32::MAX, now, device) > 0 {
                net_trace!("rudp: rescue retransmission at {}", self.tx_start_seq);
                self.congestion.retransmit_rescue = self.congestion.retransmit_next;
                self.congestion.duplicate_acks = 0;
                return true;
            }
        }

        // duplicate ACKs inflate cwnd while recovering, so new data flows
        // without limited transmit
        self.recovery_send_new(now, device) > 0
    }

    /// Selectively retransmit the next hole the peer's SACKs reveal.
    fn retransmit_next_hole(&mut self, now: Instant, device: &mut dyn Device) -> u32 {
        if self.tx_acked.is_empty() {
            return 0;
        }

        let seq = self.congestion.retransmit_next.max(self.tx_start_seq);
        match self.tx_acked.hole_after(seq) {
            Some((start, end)) => self.retransmit_clamped(start, end - start, now, device),
            None => 0,
        }
    }

    /// Retransmit at `seq` if the congestion window has room for a full
    /// segment, charging the window for what went out.
    fn retransmit_clamped(
        &mut self,
        seq: SeqNumber,
        max_payload: u32,
        now: Instant,
        device: &mut dyn Device,
    ) -> u32 {
        if self.congestion.cwnd < MSS {
            return 0;
        }

        let sent = self.transmit_at(seq, max_payload, now, device);
        if sent > 0 {
            self.congestion.deflate(sent);
            if self.congestion.retransmit_next < seq + sent {
                self.congestion.retransmit_next = seq + sent;
            }
            net_trace!(
                "rudp: retransmitted {} octets at {}, cwnd {}",
                sent,
                seq,
                self.congestion.cwnd
            );
        }
        sent
    }

    /// Send new data while in recovery, also charged against the window.
    fn recovery_send_new(&mut self, now: Instant, device: &mut dyn Device) -> u32 {
        if self.congestion.cwnd < MSS {
            return 0;
        }

        let sent = self.send_new(self.tx_buffer.len() as u32, now, device);
        if sent > 0 {
            self.congestion.deflate(sent);
        }
        sent
    }

    fn enter_recovery(&mut self, mode: Recovery, now: Instant, device: &mut dyn Device) -> bool {
        let in_flight = self.tx_next_seq - self.tx_start_seq;
        self.congestion.enter_recovery(
            mode,
            in_flight,
            self.tx_next_seq,
            self.tx_start_seq,
            &self.config,
        );

        if self.retransmit_next_hole(now, device) > 0 {
            return true;
        }
        self.recovery_send_new(now, device) > 0
    }

    fn poll_retransmit_timer(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        let timeout = Duration::from_millis(self.config.data_retransmission_timeout);
        if now - self.congestion.last_data_sent_at < timeout {
            return false;
        }
        self.congestion.last_data_sent_at = now;

        if self.congestion.recovery != Recovery::Off {
            // the retransmissions themselves are being lost
            return self.enter_recovery(Recovery::ByTimeout, now, device);
        }
        if !self.tx_acked.is_empty() {
            // the receiver reported holes; go restore them
            return self.enter_recovery(Recovery::ByTimeout, now, device);
        }

        self.slow_start_by_timeout(now, device)
    }

    /// Nothing is selectively acknowledged, so no hole is known: restart
    /// from the head segment in slow start, staying out of recovery.
    fn slow_start_by_timeout(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        let in_flight = self.tx_next_seq - self.tx_start_seq;
        self.congestion.slow_start_on_timeout(in_flight, &self.config);

        let sent = self.transmit_at(self.tx_start_seq, u32::MAX, now, device);
        if sent > 0 {
            net_trace!("rudp: head segment retransmitted at {}", self.tx_start_seq);
        }
        sent > 0
    }

    // === special packets ===

    fn send_pending_ack(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        if self.tx_mandatory_acks == 0 {
            return false;
        }
        self.send_empty(PacketKind::Ack, now, device);
        net_trace!("rudp: ack {} sent", self.rx_start_seq);
        true
    }

    fn send_keepalive(&mut self, now: Instant, device: &mut dyn Device) -> bool {
        let interval = Duration::from_millis(self.config.ping_interval);
        if Self::since(now, self.tx_last_packet_at) < interval {
            return false;
        }
        self.send_empty(PacketKind::Ping, now, device);
        net_trace!("rudp: ping sent, ack {}", self.rx_start_seq);
        true
    }

    // === lifecycle ===

    pub(crate) fn start_connect(&mut self) {
        self.state = State::ConnectStarted;
    }

    /// An unknown CONNECT arrived; become an unconfirmed incoming
    /// connection awaiting its confirming packet.
    pub(crate) fn handle_incoming_connect(&mut self, src_port: u16, seq: SeqNumber, now: Instant) {
        self.state = State::ConnectReceived;
        self.remote_port = src_port;
        self.rx_start_seq = seq;
        self.rx_last_packet_at = now;
    }

    /// A CONNECT arrived from the peer we are connecting to: simultaneous
    /// open. Our send state is preserved; theirs is recorded.
    pub(crate) fn handle_rendezvous_connect(&mut self, src_port: u16, seq: SeqNumber, now: Instant) {
        net_trace!("rudp: CONNECT received while in started state");
        self.state = State::ConnectReceivedWhileStarted;
        self.remote_port = src_port;
        self.rx_start_seq = seq;
        self.rx_last_packet_at = now;
    }

    /// A packet acknowledging our CONNECT completes the handshake on the
    /// initiating side.
    pub(crate) fn handle_connect_ack(&mut self, repr: &Repr, now: Instant) -> bool {
        if repr.ack_number != self.tx_start_seq {
            return false;
        }

        self.rx_buffer = vec![0; self.config.connection_buf_size as usize];
        self.state = State::Connected;
        self.remote_port = repr.src_port;
        self.rx_start_seq = repr.seq_number;
        self.rx_last_packet_at = now;
        self.congestion.reset(now, self.tx_start_seq, &self.config);
        true
    }

    /// The peer's confirming packet (possibly already carrying data)
    /// completes an incoming or rendezvous handshake.
    pub(crate) fn handle_confirm(
        &mut self,
        repr: &Repr,
        payload: &[u8],
        now: Instant,
    ) -> ConfirmOutcome {
        if repr.src_port != self.remote_port {
            return ConfirmOutcome::Ignored;
        }
        if repr.ack_number != self.tx_start_seq {
            return ConfirmOutcome::Ignored;
        }

        self.rx_buffer = vec![0; self.config.connection_buf_size as usize];

        if !payload.is_empty() {
            if !self.deposit(repr.seq_number, payload) {
                return ConfirmOutcome::Ignored;
            }
            self.schedule_ack();
        } else if repr.seq_number != self.rx_start_seq {
            return ConfirmOutcome::Ignored;
        }

        self.rx_last_packet_at = now;
        self.congestion.reset(now, self.tx_start_seq, &self.config);

        let outcome = if self.state == State::ConnectReceivedWhileStarted {
            ConfirmOutcome::Rendezvous
        } else {
            ConfirmOutcome::Incoming
        };
        self.state = State::Connected;
        outcome
    }

    /// Refresh the idle timer; used for duplicate CONNECTs.
    pub(crate) fn touch_rx(&mut self, now: Instant) {
        self.rx_last_packet_at = now;
    }

    pub(crate) fn idle_timed_out(&self, now: Instant) -> bool {
        now - self.rx_last_packet_at >= Duration::from_millis(self.config.connection_timeout)
    }

    /// Drive the handshake retransmission timer of a not-yet-established
    /// connection.
    pub(crate) fn poll_handshake(&mut self, now: Instant, device: &mut dyn Device) -> HandshakePoll {
        let (timeout, attempts, kind) = match self.state {
            State::ConnectStarted => (
                self.config.connect_retransmission_timeout,
                self.config.max_connect_attempts,
                PacketKind::Connect,
            ),
            State::ConnectReceived | State::ConnectReceivedWhileStarted => (
                self.config.accept_retransmission_timeout,
                self.config.max_accepted_attempts,
                PacketKind::Accept,
            ),
            _ => return HandshakePoll::Idle,
        };

        if Self::since(now, self.tx_last_packet_at) < Duration::from_millis(timeout) {
            return HandshakePoll::Idle;
        }

        if (self.connect_attempts as u32) < attempts {
            self.send_empty(kind, now, device);
            self.connect_attempts += 1;
            net_trace!("rudp: {:?} sent, attempt {}", kind, self.connect_attempts);
            HandshakePoll::Progressed
        } else {
            HandshakePoll::Exhausted
        }
    }
}

#[cfg(test)]
mod test {
    use super::congestion::Recovery;
    use super::*;

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    /// A device that swallows and remembers everything sent through it.
    struct Sink {
        frames: Vec<Vec<u8>>,
    }

    impl Sink {
        fn new() -> Sink {
            Sink { frames: Vec::new() }
        }

        fn repr(&self, index: usize) -> Repr {
            let packet = Packet::new_checked(&self.frames[index][..]).unwrap();
            Repr::parse(&packet).unwrap()
        }

        fn payload_len(&self, index: usize) -> usize {
            let packet = Packet::new_checked(&self.frames[index][..]).unwrap();
            packet.payload().len()
        }
    }

    impl Device for Sink {
        fn data_available(&self) -> bool {
            false
        }
        fn recv(&mut self, _buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
            None
        }
        fn send(&mut self, buf: &[u8], _dst: SocketAddr) -> usize {
            self.frames.push(buf.to_vec());
            buf.len()
        }
    }

    fn established_with(config: Config, tx_isn: u32, rx_isn: u32) -> Connection {
        let now = Instant::from_millis(0);
        let mut conn = Connection::new(config.clone(), peer_addr(), 1000, SeqNumber(tx_isn), now);
        conn.state = State::Connected;
        conn.remote_port = 2000;
        conn.rx_start_seq = SeqNumber(rx_isn);
        conn.rx_buffer = vec![0; config.connection_buf_size as usize];
        conn.tx_last_packet_at = Some(now);
        conn.congestion.reset(now, SeqNumber(tx_isn), &config);
        conn
    }

    fn established(tx_isn: u32, rx_isn: u32) -> Connection {
        established_with(Config::default(), tx_isn, rx_isn)
    }

    fn sack_list(entries: &[(SeqNumber, u32)]) -> heapless::Vec<SeqRange, MAX_SACKS> {
        let mut sacks = heapless::Vec::new();
        for &(start, size) in entries {
            sacks.push(SeqRange::new(start, size)).unwrap();
        }
        sacks
    }

    fn data_repr(seq: SeqNumber) -> Repr {
        Repr {
            kind: PacketKind::Data,
            src_port: 2000,
            dst_port: 1000,
            seq_number: seq,
            ack_number: SeqNumber(0),
            sacks: heapless::Vec::new(),
        }
    }

    fn ack_repr(ack: SeqNumber, sacks: &[(SeqNumber, u32)]) -> Repr {
        Repr {
            kind: PacketKind::Ack,
            src_port: 2000,
            dst_port: 1000,
            seq_number: SeqNumber(0),
            ack_number: ack,
            sacks: sack_list(sacks),
        }
    }

    const SEGMENT: usize = MAX_SEGMENT_SIZE;

    fn out_of_order_feed(rx_isn: u32) {
        let mut conn = established(5_000, rx_isn);
        let mut sink = Sink::new();
        let now = Instant::from_millis(0);

        let total = 5 * SEGMENT;
        let stream: Vec<u8> = (0..total).map(|i| (i * 31) as u8).collect();

        // segments arrive as [1, 3, 2, 5, 4]
        for &index in &[0usize, 2, 1, 4, 3] {
            let seq = SeqNumber(rx_isn) + (index * SEGMENT) as u32;
            let payload = &stream[index * SEGMENT..(index + 1) * SEGMENT];
            conn.process_established(&data_repr(seq), payload, now, &mut sink);
        }

        assert_eq!(conn.deliver_ready(), total as u32);
        assert!(conn.rx_segments.is_empty());
        assert_eq!(conn.rx_bytes_ready, total as u32);

        let mut buf = vec![0u8; total];
        assert_eq!(conn.read(&mut buf), total);
        assert_eq!(buf, stream);
        assert_eq!(conn.rx_start_seq, SeqNumber(rx_isn) + total as u32);
    }

    #[test]
    fn out_of_order_segments_reassemble() {
        out_of_order_feed(7_000);
    }

    #[test]
    fn out_of_order_segments_reassemble_across_wrap() {
        // the stream wraps through 2³² mid-transfer
        out_of_order_feed(u32::MAX - 3_000);
    }

    #[test]
    fn deposit_preserves_unread_data() {
        let mut conn = established(1, 1_000);

        conn.deposit(SeqNumber(1_000), &[0xAA; 100]);
        assert_eq!(conn.deliver_ready(), 100);

        // more data arrives while the first chunk is still unread
        conn.deposit(SeqNumber(1_100), &[0xBB; 100]);
        assert_eq!(conn.deliver_ready(), 100);
        assert_eq!(conn.rx_bytes_ready, 200);

        let mut buf = [0u8; 200];
        assert_eq!(conn.read(&mut buf), 200);
        assert!(buf[..100].iter().all(|&b| b == 0xAA));
        assert!(buf[100..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn deposit_clips_to_window() {
        let mut conn = established(1, 1_000);
        let window = conn.config.connection_buf_size;

        // straddles the window tail: only the inside part is kept
        assert!(conn.deposit(SeqNumber(1_000) + (window - 100), &[0xCC; 300]));
        assert_eq!(conn.rx_segments.first().unwrap().size, 100);

        // entirely beyond the window
        assert!(!conn.deposit(SeqNumber(1_000) + window, &[0xCC; 16]));

        // entirely below the window once data was delivered and read
        let mut conn = established(1, 1_000);
        conn.deposit(SeqNumber(1_000), &[0xDD; 50]);
        conn.deliver_ready();
        let mut buf = [0u8; 50];
        conn.read(&mut buf);
        assert!(!conn.deposit(SeqNumber(1_000), &[0xDD; 30]));
    }

    #[test]
    fn deposit_rejects_when_buffer_full() {
        let mut conn = established(1, 1_000);
        conn.rx_bytes_ready = conn.config.connection_buf_size;
        assert!(!conn.deposit(SeqNumber(1_000), &[0xEE; 8]));
    }

    #[test]
    fn no_io_before_connected() {
        let mut conn = Connection::new(
            Config::default(),
            peer_addr(),
            1000,
            SeqNumber(9),
            Instant::from_millis(0),
        );
        assert_eq!(conn.send(b"data"), 0);
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf), 0);
    }

    #[test]
    fn delayed_ack_ladder() {
        let config = Config {
            skip_packets_before_acknowledgement: 2,
            max_consecutive_acknowledges: 3,
            ..Config::default()
        };
        let mut conn = established_with(config, 1, 1_000);

        let expected = [
            // (mandatory, skipped) after each payload packet
            (1, 0),
            (1, 1),
            (1, 2),
            (2, 0),
            (2, 1),
            (2, 2),
            (3, 0),
            // ceiling reached, nothing changes
            (3, 0),
            (3, 0),
        ];
        for &(mandatory, skipped) in &expected {
            conn.schedule_ack();
            assert_eq!((conn.tx_mandatory_acks, conn.tx_acks_skipped), (mandatory, skipped));
        }

        // each outbound packet repays one acknowledgment
        let mut sink = Sink::new();
        let now = Instant::from_millis(0);
        assert!(conn.egress(now, &mut sink));
        assert!(conn.egress(now, &mut sink));
        assert!(conn.egress(now, &mut sink));
        assert!(!conn.egress(now, &mut sink));
        assert_eq!(sink.frames.len(), 3);
        assert_eq!(sink.repr(0).kind, PacketKind::Ack);
        assert_eq!(conn.tx_mandatory_acks, 0);
    }

    #[test]
    fn keepalive_after_quiet_interval() {
        let mut conn = established(1, 1_000);
        let mut sink = Sink::new();

        assert!(!conn.egress(Instant::from_millis(1_499), &mut sink));
        assert!(conn.egress(Instant::from_millis(1_500), &mut sink));
        assert_eq!(sink.frames.len(), 1);
        let ping = sink.repr(0);
        assert_eq!(ping.kind, PacketKind::Ping);
        assert_eq!(ping.seq_number, conn.tx_start_seq);
        assert_eq!(ping.ack_number, conn.rx_start_seq);
    }

    #[test]
    fn slow_start_then_congestion_avoidance() {
        let mut conn = established(10_000, 1_000);
        let mut sink = Sink::new();
        let now = Instant::from_millis(0);

        conn.send(&vec![0x11; 10 * SEGMENT]);
        assert!(conn.egress(now, &mut sink));
        assert_eq!(sink.payload_len(0), SEGMENT);

        // slow start: the window grows by what was acknowledged
        let ack = SeqNumber(10_000) + SEGMENT as u32;
        conn.process_established(&ack_repr(ack, &[]), &[], now, &mut sink);
        assert_eq!(conn.congestion.cwnd, 3 * SEGMENT as u32);

        // at the threshold, growth turns additive
        conn.congestion.ssthresh = conn.congestion.cwnd;
        assert!(conn.egress(now, &mut sink));
        let ack = ack + SEGMENT as u32;
        conn.process_established(&ack_repr(ack, &[]), &[], now, &mut sink);
        let mss = SEGMENT as u32;
        assert_eq!(conn.congestion.cwnd, 3 * mss + mss * mss / (3 * mss));
    }

    #[test]
    fn duplicate_acks_enter_loss_recovery() {
        let mut conn = established(20_000, 1_000);
        let mut sink = Sink::new();
        let now = Instant::from_millis(0);
        let isn = SeqNumber(20_000);
        let mss = SEGMENT as u32;

        conn.send(&vec![0x22; 5 * SEGMENT]);
        assert!(conn.egress(now, &mut sink));
        assert!(conn.egress(now, &mut sink));
        assert_eq!(conn.tx_next_seq, isn + 2 * mss);

        // the peer holds the second segment and keeps acknowledging the
        // first unacknowledged byte
        let sack = (isn + mss, mss);
        conn.process_established(&ack_repr(isn, &[sack]), &[], now, &mut sink);
        assert_eq!(conn.congestion.duplicate_acks, 1);
        conn.process_established(&ack_repr(isn, &[sack]), &[], now, &mut sink);
        assert_eq!(conn.congestion.duplicate_acks, 2);

        assert!(conn.egress(now, &mut sink));
        assert_eq!(conn.congestion.recovery, Recovery::ByLoss);
        // in flight 2 segments: 70% is below the floor of 4 segments
        assert_eq!(conn.congestion.ssthresh, 4 * mss);
        // cwnd = max(ssthresh, dupacks × mss) minus the retransmission
        assert_eq!(conn.congestion.cwnd, 4 * mss - mss);
        assert_eq!(conn.congestion.duplicate_acks, 0);

        // the hole at the head was retransmitted, capped to its size
        let retransmit = sink.repr(2);
        assert_eq!(retransmit.seq_number, isn);
        assert_eq!(sink.payload_len(2), SEGMENT);
        assert_eq!(conn.congestion.retransmit_next, isn + mss);

        // filling the hole releases recovery once the point is reached
        let recovery_point = conn.congestion.recovery_point;
        conn.process_established(&ack_repr(recovery_point, &[]), &[], now, &mut sink);
        assert_eq!(conn.congestion.recovery, Recovery::Off);
        assert_eq!(conn.congestion.cwnd, conn.congestion.ssthresh);
    }

    #[test]
    fn timeout_without_sacks_restarts_slow_start() {
        let mut conn = established(30_000, 1_000);
        let mut sink = Sink::new();
        let mss = SEGMENT as u32;

        conn.send(&vec![0x33; SEGMENT]);
        assert!(conn.egress(Instant::from_millis(0), &mut sink));

        // nothing comes back until the retransmission timer fires
        let rto = conn.config.data_retransmission_timeout;
        assert!(conn.egress(Instant::from_millis(rto), &mut sink));
        assert_eq!(sink.frames.len(), 2);
        assert_eq!(sink.repr(1).seq_number, conn.tx_start_seq);
        assert_eq!(conn.congestion.recovery, Recovery::Off);
        assert_eq!(conn.congestion.cwnd, 2 * mss);
        assert_eq!(conn.congestion.ssthresh, 4 * mss);
    }

    #[test]
    fn timeout_with_sacks_enters_timeout_recovery() {
        let mut conn = established(40_000, 1_000);
        let mut sink = Sink::new();
        let now = Instant::from_millis(0);
        let isn = SeqNumber(40_000);
        let mss = SEGMENT as u32;

        conn.send(&vec![0x44; 3 * SEGMENT]);
        assert!(conn.egress(now, &mut sink));
        assert!(conn.egress(now, &mut sink));

        // first segment acknowledged, then the third arrives out of order
        conn.process_established(&ack_repr(isn + mss, &[]), &[], now, &mut sink);
        assert!(conn.egress(now, &mut sink));
        let head = conn.tx_start_seq;
        conn.process_established(&ack_repr(head, &[(head + mss, mss)]), &[], now, &mut sink);
        assert!(!conn.tx_acked.is_empty());

        // silence until the timer fires: recovery by timeout
        let rto = conn.config.data_retransmission_timeout;
        assert!(conn.egress(Instant::from_millis(rto), &mut sink));
        assert_eq!(conn.congestion.recovery, Recovery::ByTimeout);
        let last = sink.frames.len() - 1;
        assert_eq!(sink.repr(last).seq_number, head);
        assert_eq!(sink.payload_len(last), SEGMENT);
        assert_eq!(conn.congestion.cwnd, 2 * mss - mss);
    }

    #[test]
    fn replayed_acknowledgment_is_idempotent() {
        let mut conn = established(50_000, 1_000);
        let mut sink = Sink::new();
        let now = Instant::from_millis(0);
        let mss = SEGMENT as u32;

        conn.send(&vec![0x55; 3 * SEGMENT]);
        assert!(conn.egress(now, &mut sink));
        assert!(conn.egress(now, &mut sink));

        let ack = SeqNumber(50_000) + mss;
        conn.process_established(&ack_repr(ack, &[(ack, mss)]), &[], now, &mut sink);
        let tx_start = conn.tx_start_seq;
        let sacked: Vec<_> = conn.tx_acked.iter().collect();
        assert_eq!(tx_start, ack);
        assert_eq!(sacked.len(), 1);

        // replaying the same acknowledgment changes nothing
        conn.process_established(&ack_repr(ack, &[(ack, mss)]), &[], now, &mut sink);
        assert_eq!(conn.tx_start_seq, tx_start);
        assert_eq!(conn.tx_acked.iter().collect::<Vec<_>>(), sacked);

        // and a stale acknowledgment cannot move the window backwards
        conn.process_established(&ack_repr(SeqNumber(50_000), &[]), &[], now, &mut sink);
        assert_eq!(conn.tx_start_seq, tx_start);
    }

    #[test]
    fn acknowledgment_advances_across_wrap() {
        let isn = u32::MAX - 1_000;
        let mut conn = established(isn, 1_000);
        let mut sink = Sink::new();
        let now = Instant::from_millis(0);
        let mss = SEGMENT as u32;

        conn.send(&vec![0x66; 3 * SEGMENT]);
        assert!(conn.egress(now, &mut sink));

        let ack = SeqNumber(isn) + mss;
        conn.process_established(&ack_repr(ack, &[]), &[], now, &mut sink);
        assert_eq!(conn.tx_start_seq, ack);
        assert_eq!(conn.tx_buffer.len(), 2 * SEGMENT);
        assert_eq!(conn.congestion.cwnd, 3 * mss);
    }
}
