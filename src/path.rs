//! Concrete network paths and their per-bond slot state.
//!
//! A `Path` is a (local socket, remote address) pair a peer is reachable
//! over. Each bond keeps up to [`MAX_PATHS`] nominated paths in a fixed
//! array of [`PathSlot`]s; slot indices are stable for the lifetime of the
//! nomination, which lets the flow table and the failover queue store plain
//! indices instead of handles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::link::{IpvPreference, LinkMode};
use crate::stats::{Ewma, SampleBuffer};

/// Maximum nominated paths per peer.
pub const MAX_PATHS: usize = 16;

/// Cap on the outstanding-ack and inbound-expectation maps of a slot.
pub const MAX_OUTSTANDING: usize = 128;

/// Ceiling for the post-failure refractory period.
pub const MAX_REFRACTORY_PERIOD: i64 = 60_000;

/// Rolling window sizes for the per-slot sample buffers.
const LATENCY_SAMPLE_WINDOW: usize = 32;
const VALIDITY_SAMPLE_WINDOW: usize = 32;
const QOS_RECORD_SIZE_WINDOW: usize = 8;

/// Smoothing factor for the per-window packet-loss observations.
const LOSS_EWMA_ALPHA: f32 = 0.25;

/// Opaque handle to a bound local socket, resolved to an interface name by
/// the transport collaborator.
pub type LocalSocket = u64;

/// A concrete way of reaching the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub addr: SocketAddr,
    pub local_socket: LocalSocket,
}

impl Path {
    pub fn new(addr: SocketAddr, local_socket: LocalSocket) -> Self {
        Self { addr, local_socket }
    }

    pub fn is_v6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

/// Per-bond state for one nominated path.
#[derive(Debug)]
pub struct PathSlot {
    pub path: Option<Arc<Path>>,
    /// Interface name resolved at nomination time.
    pub ifname: String,

    pub nominated_at: i64,
    pub last_alive_toggle: i64,
    pub last_qos_sent: i64,
    pub last_in: i64,
    pub last_out: i64,

    pub alive: bool,
    pub eligible: bool,
    pub bonded: bool,
    pub only_path_on_link: bool,
    pub enabled: bool,
    pub negotiated: bool,
    pub should_reallocate_flows: bool,

    /// Link preferences inherited at nomination.
    pub ipv_pref: IpvPreference,
    pub mode: LinkMode,

    pub packets_in: u64,
    pub packets_out: u64,
    pub assigned_flow_count: u32,
    pub packets_received_since_last_qos: u32,

    pub latency_samples: SampleBuffer,
    pub validity_samples: SampleBuffer,
    pub qos_record_size: SampleBuffer,

    /// packet id -> time sent, awaiting a QoS acknowledgement.
    pub qos_stats_out: HashMap<u64, i64>,
    /// packet id -> time received, awaiting inclusion in a QoS report.
    pub qos_stats_in: HashMap<u64, i64>,
    /// Records acknowledged since the last quality estimation.
    pub qos_records_acked: u32,

    pub latency_mean: f32,
    pub latency_variance: f32,
    pub packet_loss_ratio: f32,
    pub packet_error_ratio: f32,
    pub throughput_mean: f32,
    pub loss_estimate: Ewma,

    /// Share of traffic this slot should carry, 0-255.
    pub allocation: u8,
    /// Load-adjusted assignment weight used when the bond is under-loaded.
    pub affinity: u8,
    pub failover_score: i32,
    pub refractory_period: i64,
}

impl Default for PathSlot {
    fn default() -> Self {
        Self {
            path: None,
            ifname: String::new(),
            nominated_at: 0,
            last_alive_toggle: 0,
            last_qos_sent: 0,
            last_in: 0,
            last_out: 0,
            alive: false,
            eligible: false,
            bonded: false,
            only_path_on_link: false,
            enabled: false,
            negotiated: false,
            should_reallocate_flows: false,
            ipv_pref: IpvPreference::Any,
            mode: LinkMode::Spare,
            packets_in: 0,
            packets_out: 0,
            assigned_flow_count: 0,
            packets_received_since_last_qos: 0,
            latency_samples: SampleBuffer::new(LATENCY_SAMPLE_WINDOW),
            validity_samples: SampleBuffer::new(VALIDITY_SAMPLE_WINDOW),
            qos_record_size: SampleBuffer::new(QOS_RECORD_SIZE_WINDOW),
            qos_stats_out: HashMap::new(),
            qos_stats_in: HashMap::new(),
            qos_records_acked: 0,
            latency_mean: 0.0,
            latency_variance: 0.0,
            packet_loss_ratio: 0.0,
            packet_error_ratio: 0.0,
            throughput_mean: 0.0,
            loss_estimate: Ewma::new(LOSS_EWMA_ALPHA),
            allocation: 0,
            affinity: 0,
            failover_score: 0,
            refractory_period: 0,
        }
    }
}

impl PathSlot {
    /// Place a freshly nominated path into this slot, inheriting the
    /// hosting link's preferences.
    pub fn occupy(
        &mut self,
        now: i64,
        path: Arc<Path>,
        ifname: String,
        ipv_pref: IpvPreference,
        mode: LinkMode,
        enabled: bool,
    ) {
        *self = Self::default();
        self.path = Some(path);
        self.ifname = ifname;
        self.nominated_at = now;
        self.last_in = now;
        self.last_alive_toggle = now;
        self.ipv_pref = ipv_pref;
        self.mode = mode;
        self.enabled = enabled;
    }

    pub fn is_occupied(&self) -> bool {
        self.path.is_some()
    }

    /// Time since this slot last received anything.
    pub fn age(&self, now: i64) -> i64 {
        now - self.last_in
    }

    /// Whether traffic may use this slot at all: the hosting link must be
    /// enabled and the path's address family acceptable to it.
    pub fn allowed(&self) -> bool {
        self.enabled
            && self
                .path
                .as_ref()
                .is_some_and(|p| self.ipv_pref.allows(p.is_v6()))
    }

    /// Whether this slot is a first-choice path on its link.
    pub fn preferred(&self) -> bool {
        self.only_path_on_link
            || self
                .path
                .as_ref()
                .is_some_and(|p| self.ipv_pref.prefers(p.is_v6()))
    }

    pub fn is_primary(&self) -> bool {
        self.mode == LinkMode::Primary
    }

    /// Whether a QoS report is due: a full table, or the send interval has
    /// elapsed with something to report.
    pub fn needs_qos(&self, now: i64, qos_send_interval: i64, table_size: usize) -> bool {
        self.packets_received_since_last_qos > 0
            && (self.packets_received_since_last_qos as usize >= table_size
                || (now - self.last_qos_sent) > qos_send_interval)
    }

    /// Grow the refractory period on failure; let it drain while healthy.
    pub fn adjust_refractory_period(&mut self, punishment: i64, punish: bool) {
        if punish {
            self.refractory_period =
                (self.refractory_period + punishment).min(MAX_REFRACTORY_PERIOD);
        } else {
            self.refractory_period /= 2;
        }
    }

    pub fn reset_packet_counts(&mut self) {
        self.packets_in = 0;
        self.packets_out = 0;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
