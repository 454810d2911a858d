//! Resolved connection parameters.
//!
//! The library consumes already-resolved values: host-name lookup, config
//! files and CLI parsing are the embedding application's business. The
//! defaults below match the switcher's fixed control port and the timing
//! the protocol expects.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// UDP port every ATEM listens on for control sessions.
pub const ATEM_PORT: u16 = 9910;

/// Connection parameters for one switcher.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Switcher address.
    pub peer_host: IpAddr,
    /// Switcher control port.
    pub peer_port: u16,
    /// Socket read timeout; doubles as the liveness probe interval.
    pub recv_timeout_ms: u32,
    /// Consecutive silent probe intervals before the session is declared
    /// dead and re-established.
    pub liveness_probes_before_reset: u32,
    /// Cache sent packets so the switcher can request retransmission.
    pub store_send_enabled: bool,
    /// Retransmit cache depth; the oldest entry is evicted when full.
    pub max_unacked: u32,
}

impl ConnectionConfig {
    /// Defaults for every field except the peer address.
    pub fn new(peer_host: IpAddr) -> Self {
        ConnectionConfig {
            peer_host,
            peer_port: ATEM_PORT,
            recv_timeout_ms: 1000,
            liveness_probes_before_reset: 4,
            store_send_enabled: true,
            max_unacked: 32,
        }
    }

    /// The resolved peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.peer_host, self.peer_port)
    }

    /// The probe interval as a [`Duration`].
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms as u64)
    }
}
