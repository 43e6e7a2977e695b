//! Recognized options and defaults.
//!
//! Collected once at startup into a single immutable value, passed by
//! `Arc` into whichever components need it, rather than read from process
//! globals the way the original implementation's `extern`-declared option
//! set was.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::addr::Addr;

fn default_broadcast_interval() -> u64 {
    30
}
fn default_timeout() -> u64 {
    240
}
fn default_alarm_timeout() -> u64 {
    9
}
fn default_interlink_netmask() -> u8 {
    28
}
fn default_minimum_netmask() -> u8 {
    24
}
fn default_port() -> u16 {
    12345
}
fn default_min_routable() -> u32 {
    0xac10_0000 // 172.16.0.0
}
fn default_max_routable() -> u32 {
    0xac1f_ffff // 172.31.255.255
}

/// Immutable configuration for one daemon instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between unforced broadcast runs.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,

    /// Seconds of silence from a neighbor before its tree is discarded.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Seconds between periodic driver ticks.
    #[serde(default = "default_alarm_timeout")]
    pub alarm_timeout_secs: u64,

    /// Minimum prefix length (inclusive) for a subnet to be scanned for
    /// neighbors; must be `< 32`.
    #[serde(default = "default_interlink_netmask")]
    pub interlink_netmask: u8,

    /// Aggregation never produces a route shorter (numerically smaller
    /// netmask) than this.
    #[serde(default = "default_minimum_netmask")]
    pub minimum_netmask: u8,

    /// UDP port used for the signed broadcast protocol.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret used to key the packet signature. Must be configured
    /// out of band; there is no key exchange (see non-goals).
    #[serde(default)]
    pub secret_key: Vec<u8>,

    /// When false, computed route changes are logged but not installed.
    #[serde(default)]
    pub real_route_updates: bool,

    /// Marks this node's own addresses as gateway-flagged in its tree.
    #[serde(default)]
    pub this_is_a_gateway: bool,

    /// Neighbor addresses treated as upstream default-gateway candidates.
    #[serde(default)]
    pub default_gateways: BTreeSet<Addr>,

    /// Interfaces considered zero-cost ("ethernet") hops during merge.
    #[serde(default)]
    pub zero_hop_ifaces: BTreeSet<String>,

    #[serde(default = "default_min_routable")]
    min_routable: u32,
    #[serde(default = "default_max_routable")]
    max_routable: u32,

    /// Opt-in: write every accepted/rejected packet to `debug_packet_dump_dir`.
    #[serde(default)]
    pub debug_packet_dump: bool,

    /// Directory for the above; defaults to the system temp dir at use time.
    #[serde(default)]
    pub debug_packet_dump_dir: Option<std::path::PathBuf>,
}

impl Config {
    pub fn min_routable(&self) -> Addr {
        Addr::new(self.min_routable)
    }

    pub fn max_routable(&self) -> Addr {
        Addr::new(self.max_routable)
    }

    pub fn broadcast_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn alarm_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.alarm_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast_interval_secs: default_broadcast_interval(),
            timeout_secs: default_timeout(),
            alarm_timeout_secs: default_alarm_timeout(),
            interlink_netmask: default_interlink_netmask(),
            minimum_netmask: default_minimum_netmask(),
            port: default_port(),
            secret_key: Vec::new(),
            real_route_updates: false,
            this_is_a_gateway: false,
            default_gateways: BTreeSet::new(),
            zero_hop_ifaces: BTreeSet::new(),
            min_routable: default_min_routable(),
            max_routable: default_max_routable(),
            debug_packet_dump: false,
            debug_packet_dump_dir: None,
        }
    }
}
