//! Tunable timing and buffering knobs for a dilated session.
//!
//! burrow is a library; the embedding application owns any config file.
//! Everything here defaults to values that work on real networks.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DilationConfig {
    /// Send a PING after this much outbound silence while an L2 is active.
    pub ping_interval: Duration,

    /// Declare the active L2 lost after this much inbound silence.
    pub liveness_timeout: Duration,

    /// Leader: after the first candidate becomes ready, wait this long
    /// for a better one before selecting.
    pub selection_delay: Duration,

    /// Give up on a generation after this long with no selection; the
    /// leader then starts the next generation.
    pub connector_giveup: Duration,

    /// Per-candidate negotiation deadline.
    pub negotiation_timeout: Duration,

    /// Pause registered subchannel producers once this many bytes of
    /// sealed frames await acknowledgement.
    pub outbound_high_watermark: usize,

    /// Resume producers once the unacknowledged backlog drains below
    /// this. Must be below the high watermark.
    pub outbound_low_watermark: usize,

    /// Hostnames published in listening hints. Richer hint discovery
    /// (interface enumeration, NAT traversal) is the embedding
    /// application's concern; it can pre-seed this list.
    pub advertise_hosts: Vec<String>,
}

impl Default for DilationConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
            selection_delay: Duration::from_secs(1),
            connector_giveup: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(10),
            outbound_high_watermark: 1 << 20,
            outbound_low_watermark: 1 << 18,
            advertise_hosts: vec!["127.0.0.1".to_string()],
        }
    }
}
