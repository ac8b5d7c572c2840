//! Host configuration.

/// Tunables for a [`Host`] and every connection it owns.
///
/// `Config::default()` gives the recommended value for every knob; most
/// applications only ever touch `random_seed`.
///
/// [`Host`]: crate::iface::Host
#[derive(Debug, Clone)]
pub struct Config {
    /// Seed for the per-host pseudo-random source used for initial
    /// sequence numbers and local port draws.
    ///
    /// It is strongly recommended that the seed differs on each start,
    /// to avoid port and sequence collisions across restarts. It does
    /// not have to be cryptographically secure.
    pub random_seed: u64,

    /// Per-connection receive/send window cap, in bytes.
    pub connection_buf_size: u32,
    /// OS-level receive buffer size requested from the socket.
    pub socket_buf_size: u32,

    /// Starting congestion window, in packets (MSS units).
    pub initial_cwnd_in_packets: u32,
    /// Congestion window after a retransmission timeout, in packets.
    pub cwnd_on_timeout_in_packets: u32,
    /// Floor for the slow start threshold, in packets.
    pub min_ssthresh_in_packets: u32,
    /// Per-ACK cap on congestion window growth during slow start, in packets.
    pub max_cwnd_inc_on_slowstart_in_packets: u32,
    /// Duplicate ACK count that triggers loss recovery.
    pub duplicate_acks_for_retransmit: u32,
    /// `ssthresh` as a percentage of in-flight data on timeout.
    pub ssthresh_factor_on_timeout_percent: u32,
    /// `ssthresh` as a percentage of in-flight data on duplicate-ACK loss.
    pub ssthresh_factor_on_loss_percent: u32,

    /// Per-host connection cap; reaching it recycles the oldest
    /// unconfirmed incoming connection.
    pub max_connections: u32,
    /// Idle receive timeout in milliseconds; expiry tears the connection down.
    pub connection_timeout: u32,
    /// Keep-alive interval in milliseconds.
    pub ping_interval: u32,
    /// Interval between CONNECT retransmissions, in milliseconds.
    pub connect_retransmission_timeout: u32,
    /// CONNECT attempts before the originator gives up.
    pub max_connect_attempts: u32,
    /// Interval between ACCEPT retransmissions, in milliseconds.
    pub accept_retransmission_timeout: u32,
    /// ACCEPT attempts before an incoming connection is dropped.
    pub max_accepted_attempts: u32,
    /// Retransmission timeout for data, in milliseconds.
    pub data_retransmission_timeout: u32,
    /// Payload packets to let pass before scheduling another acknowledgment.
    pub skip_packets_before_acknowledgement: u32,
    /// Ceiling on acknowledgments owed at any one time.
    pub max_consecutive_acknowledges: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            random_seed: 0,
            connection_buf_size: 65536,
            socket_buf_size: 4_194_304,
            initial_cwnd_in_packets: 2,
            cwnd_on_timeout_in_packets: 2,
            min_ssthresh_in_packets: 4,
            max_cwnd_inc_on_slowstart_in_packets: 50,
            duplicate_acks_for_retransmit: 2,
            ssthresh_factor_on_timeout_percent: 50,
            ssthresh_factor_on_loss_percent: 70,
            max_connections: 500,
            connection_timeout: 8000,
            ping_interval: 1500,
            connect_retransmission_timeout: 2000,
            max_connect_attempts: 3,
            accept_retransmission_timeout: 1000,
            max_accepted_attempts: 2,
            data_retransmission_timeout: 600,
            skip_packets_before_acknowledgement: 0,
            max_consecutive_acknowledges: 10,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }
}
