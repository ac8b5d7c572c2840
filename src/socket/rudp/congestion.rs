use crate::config::Config;
use crate::time::Instant;
use crate::wire::{SeqNumber, MAX_SEGMENT_SIZE};

const MSS: u32 = MAX_SEGMENT_SIZE as u32;

/// Loss recovery mode of a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    Off,
    /// Entered on enough duplicate ACKs.
    ByLoss,
    /// Entered on a retransmission timeout.
    ByTimeout,
}

/// Congestion state of one connection.
///
/// This is bookkeeping only: window arithmetic, thresholds and the
/// retransmission cursors. The decisions about *what* to put on the wire
/// stay with the sender engine, which consults and updates this state.
#[derive(Debug)]
pub(crate) struct Controller {
    /// Congestion window, in bytes.
    pub(crate) cwnd: u32,
    /// Slow start threshold, in bytes.
    pub(crate) ssthresh: u32,
    /// Consecutive duplicate acknowledgment count.
    pub(crate) duplicate_acks: u8,
    pub(crate) recovery: Recovery,
    /// Recovery lasts until the cumulative ACK reaches this sequence.
    pub(crate) recovery_point: SeqNumber,
    /// Next sequence to selectively retransmit.
    pub(crate) retransmit_next: SeqNumber,
    /// Gate for the rescue retransmission of the head segment.
    pub(crate) retransmit_rescue: SeqNumber,
    /// Last transmission that armed the retransmission timer.
    pub(crate) last_data_sent_at: Instant,
}

impl Controller {
    pub(crate) fn new(now: Instant) -> Controller {
        Controller {
            cwnd: 0,
            ssthresh: 0,
            duplicate_acks: 0,
            recovery: Recovery::Off,
            recovery_point: SeqNumber(0),
            retransmit_next: SeqNumber(0),
            retransmit_rescue: SeqNumber(0),
            last_data_sent_at: now,
        }
    }

    /// Initialize for a freshly established connection.
    pub(crate) fn reset(&mut self, now: Instant, start_seq: SeqNumber, config: &Config) {
        self.last_data_sent_at = now;
        self.cwnd = config.initial_cwnd_in_packets * MSS;
        self.ssthresh = config.connection_buf_size;
        self.duplicate_acks = 0;
        self.recovery = Recovery::Off;
        self.recovery_point = start_seq;
        self.retransmit_next = start_seq;
        self.retransmit_rescue = start_seq;
    }

    pub(crate) fn inflate(&mut self, bytes: u32, config: &Config) {
        self.cwnd = self
            .cwnd
            .saturating_add(bytes)
            .min(config.connection_buf_size);
    }

    pub(crate) fn deflate(&mut self, bytes: u32) {
        self.cwnd = self.cwnd.saturating_sub(bytes);
    }

    fn update_ssthresh(&mut self, bytes_in_flight: u32, factor_percent: u32, config: &Config) {
        let scaled = (bytes_in_flight as u64 * factor_percent as u64 / 100) as u32;
        self.ssthresh = scaled.max(config.min_ssthresh_in_packets * MSS);
    }

    /// Enter (or re-enter) a recovery mode.
    ///
    /// `ssthresh` is only recomputed when recovery was off; re-entry keeps
    /// the previously halved threshold.
    pub(crate) fn enter_recovery(
        &mut self,
        mode: Recovery,
        bytes_in_flight: u32,
        next_seq: SeqNumber,
        start_seq: SeqNumber,
        config: &Config,
    ) {
        match mode {
            Recovery::ByLoss => {
                if self.recovery == Recovery::Off {
                    self.update_ssthresh(
                        bytes_in_flight,
                        config.ssthresh_factor_on_loss_percent,
                        config,
                    );
                }
                self.cwnd = self.ssthresh.max(self.duplicate_acks as u32 * MSS);
            }
            Recovery::ByTimeout => {
                if self.recovery == Recovery::Off {
                    self.update_ssthresh(
                        bytes_in_flight,
                        config.ssthresh_factor_on_timeout_percent,
                        config,
                    );
                }
                self.cwnd = config.cwnd_on_timeout_in_packets * MSS;
            }
            Recovery::Off => debug_assert!(false, "recovery cannot be entered as Off"),
        }

        self.duplicate_acks = 0;
        self.recovery = mode;
        self.recovery_point = next_seq;
        self.retransmit_next = start_seq;
        self.retransmit_rescue = start_seq;

        net_trace!(
            "cc: enter recovery {:?}, point {}, cwnd {}, ssthresh {}",
            mode,
            self.recovery_point,
            self.cwnd,
            self.ssthresh
        );
    }

    /// Leave recovery once the lost data is fully restored.
    pub(crate) fn exit_recovery(&mut self, config: &Config) {
        match self.recovery {
            Recovery::ByLoss => self.cwnd = self.ssthresh,
            Recovery::ByTimeout => self.cwnd = config.cwnd_on_timeout_in_packets * MSS,
            Recovery::Off => {}
        }
        self.recovery = Recovery::Off;

        net_trace!("cc: exit recovery, cwnd {}, ssthresh {}", self.cwnd, self.ssthresh);
    }

    /// Timeout with nothing selectively acknowledged: fall back to slow
    /// start without entering recovery.
    pub(crate) fn slow_start_on_timeout(&mut self, bytes_in_flight: u32, config: &Config) {
        if self.recovery == Recovery::Off {
            self.update_ssthresh(
                bytes_in_flight,
                config.ssthresh_factor_on_timeout_percent,
                config,
            );
        }
        self.cwnd = config.cwnd_on_timeout_in_packets * MSS;
        self.duplicate_acks = 0;

        net_trace!(
            "cc: slow start on timeout, cwnd {}, ssthresh {}",
            self.cwnd,
            self.ssthresh
        );
    }
}
