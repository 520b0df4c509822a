//! Per-peer bond engine.
//!
//! A `Bond` aggregates every nominated path to one peer under a single
//! bonding policy. The enclosing node drives it from three directions:
//!
//! - hot packet paths call [`Bond::record_incoming_packet`],
//!   [`Bond::record_outgoing_packet`] and [`Bond::appropriate_path`];
//! - a timer thread calls [`Bond::process_background_tasks`], which runs
//!   curation, quality estimation, ambient probing, and the per-policy
//!   periodic work;
//! - protocol handlers feed in QoS reports and path-negotiation petitions.
//!
//! Every operation degrades instead of failing: unknown paths are ignored,
//! an empty bond yields no send path, and full tables evict or drop.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::flow::{FlowTable, NO_FLOW};
use crate::link::{IpvPreference, LinkRegistry, UserLinkFlags};
use crate::path::{Path, PathSlot, MAX_OUTSTANDING, MAX_PATHS};
use crate::proto::{self, Verb};
use crate::runtime::{PeerProfile, SecureEntropy, Transport};

mod active_backup;
mod balance;
mod negotiation;
mod quality;

/// Default failover interval in milliseconds.
pub const FAILOVER_DEFAULT_INTERVAL: i64 = 5_000;

/// Smallest permitted failover interval.
pub const FAILOVER_MIN_INTERVAL: i64 = 250;

/// Heartbeats emitted per failover interval.
pub const ECHOS_PER_FAILOVER: i64 = 4;

/// Cadence of optimization work: link reselection under `optimize`,
/// negotiation checks, and the nomination trial period.
pub const OPTIMIZE_INTERVAL: i64 = 15_000;

/// Background ticks arriving faster than this are ignored.
pub const BACKGROUND_TASK_MIN_INTERVAL: i64 = 1_000;

/// Quiet period after which negotiation request budgets reset.
pub const PATH_NEGOTIATION_CUTOFF_TIME: i64 = 60_000;

/// Negotiation requests allowed per cutoff window.
pub const PATH_NEGOTIATION_TRY_COUNT: u32 = 3;

/// Refractory extension applied when a path loses eligibility.
pub const DEFAULT_REFRACTORY_PERIOD: i64 = 8_000;

/// Fraction of the current allocation a challenger must beat before
/// `optimize` reselects.
pub const AB_OPTIMIZE_MIN_THRESHOLD: f32 = 0.10;

/// Failover-score handicaps.
pub const HANDICAP_PREFERRED: i32 = 30;
pub const HANDICAP_PRIMARY: i32 = 20;
pub const HANDICAP_NEGOTIATED: i32 = 5_000;

/// Outstanding QoS records older than this count as lost.
pub const QOS_RECORD_TIMEOUT: i64 = 5_000;

/// Cadence of the periodic status dump.
pub const STATUS_INTERVAL: i64 = 30_000;

/// Cadence of flow expiry sweeps, and the idle age that expires a flow.
pub const FLOW_REBALANCE_INTERVAL: i64 = 30_000;

/// Default striping width for balance-rr.
pub const DEFAULT_PACKETS_PER_LINK: u32 = 64;

/// Number of quality weights. Order: latency, throughput, jitter, loss,
/// error, capacity. Throughput and capacity are carried for configuration
/// compatibility but do not enter the weighted quality sum.
pub const QUALITY_WEIGHT_COUNT: usize = 6;

pub(crate) const QW_LAT: usize = 0;
pub(crate) const QW_PDV: usize = 2;
pub(crate) const QW_PLR: usize = 3;
pub(crate) const QW_PER: usize = 4;

pub const DEFAULT_QUALITY_WEIGHTS: [f32; QUALITY_WEIGHT_COUNT] = [0.3, 0.1, 0.3, 0.1, 0.1, 0.1];

/// Normalization ceilings for the quality metrics.
pub(crate) const MAX_ACCEPTABLE_LATENCY: f32 = 100.0;
pub(crate) const MAX_ACCEPTABLE_JITTER: f32 = 50.0;
pub(crate) const MAX_ACCEPTABLE_LOSS: f32 = 0.10;
pub(crate) const MAX_ACCEPTABLE_ERROR: f32 = 0.10;

/// The five bonding policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    ActiveBackup,
    Broadcast,
    BalanceRr,
    BalanceXor,
    BalanceAware,
}

impl Policy {
    pub fn is_balance(self) -> bool {
        matches!(
            self,
            Policy::BalanceRr | Policy::BalanceXor | Policy::BalanceAware
        )
    }

    /// Whether flows are hashed onto stable paths under this policy.
    pub fn uses_flow_hashing(self) -> bool {
        matches!(self, Policy::BalanceXor | Policy::BalanceAware)
    }

    pub fn name(self) -> &'static str {
        match self {
            Policy::ActiveBackup => "active-backup",
            Policy::Broadcast => "broadcast",
            Policy::BalanceRr => "balance-rr",
            Policy::BalanceXor => "balance-xor",
            Policy::BalanceAware => "balance-aware",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "active-backup" => Some(Policy::ActiveBackup),
            "broadcast" => Some(Policy::Broadcast),
            "balance-rr" => Some(Policy::BalanceRr),
            "balance-xor" => Some(Policy::BalanceXor),
            "balance-aware" => Some(Policy::BalanceAware),
            _ => None,
        }
    }
}

/// How active-backup reselects once a primary link recovers or a better
/// candidate appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkSelectMethod {
    /// Switch back to a primary link as soon as one is available.
    Always,
    /// Switch back to a primary link only if it scores higher.
    Better,
    /// Only switch when the active link fails.
    Failure,
    /// Continuously chase the best-scoring link, with hysteresis.
    #[default]
    Optimize,
}

/// Tunable parameters a bond is constructed from. Policy templates in the
/// registry are stored in this form.
#[derive(Debug, Clone)]
pub struct BondParams {
    pub policy: Policy,
    pub up_delay: i64,
    pub down_delay: i64,
    pub link_select_method: LinkSelectMethod,
    pub packets_per_link: u32,
    failover_interval: i64,
    quality_weights: [f32; QUALITY_WEIGHT_COUNT],
}

impl BondParams {
    pub fn new(policy: Policy) -> Self {
        let mut params = Self {
            policy,
            up_delay: 0,
            down_delay: 0,
            link_select_method: LinkSelectMethod::default(),
            packets_per_link: 0,
            failover_interval: FAILOVER_DEFAULT_INTERVAL,
            quality_weights: DEFAULT_QUALITY_WEIGHTS,
        };
        match policy {
            Policy::Broadcast => params.down_delay = 30_000,
            Policy::BalanceRr => params.packets_per_link = DEFAULT_PACKETS_PER_LINK,
            _ => {}
        }
        params
    }

    pub fn failover_interval(&self) -> i64 {
        self.failover_interval
    }

    pub fn set_failover_interval(&mut self, interval: i64) {
        self.failover_interval = interval.max(FAILOVER_MIN_INTERVAL);
    }

    pub fn quality_weights(&self) -> [f32; QUALITY_WEIGHT_COUNT] {
        self.quality_weights
    }

    /// Install user quality weights. Vectors that do not sum to 1.0 (within
    /// rounding) are rejected and the previous weights retained.
    pub fn set_quality_weights(&mut self, weights: [f32; QUALITY_WEIGHT_COUNT]) -> bool {
        let total: f32 = weights.iter().sum();
        if (0.99..=1.01).contains(&total) {
            self.quality_weights = weights;
            true
        } else {
            false
        }
    }
}

/// Everything guarded by the bond's path lock: the slot array, bonded-set
/// map, per-policy selection state, and the background timers.
pub(crate) struct PathsState {
    pub(crate) slots: [PathSlot; MAX_PATHS],
    /// bonded index -> slot index; its length is the bonded path count.
    pub(crate) bond_idx_map: Vec<usize>,
    pub(crate) num_alive_links: u8,
    pub(crate) num_total_links: u8,
    pub(crate) is_healthy: bool,

    pub(crate) failover_interval: i64,
    pub(crate) up_delay: i64,
    pub(crate) down_delay: i64,
    pub(crate) monitor_interval: i64,
    pub(crate) qos_send_interval: i64,
    pub(crate) quality_estimation_interval: i64,
    pub(crate) packets_per_link: u32,
    pub(crate) quality_weights: [f32; QUALITY_WEIGHT_COUNT],

    pub(crate) ab_path_idx: Option<usize>,
    pub(crate) ab_failover_queue: VecDeque<usize>,
    pub(crate) ab_select: LinkSelectMethod,
    pub(crate) last_ab_change: i64,

    pub(crate) rr_idx: usize,
    pub(crate) rr_packets_on_curr_link: u32,

    pub(crate) local_utility: i32,
    pub(crate) negotiated_path_idx: Option<usize>,
    pub(crate) sent_negotiation_requests: u32,
    pub(crate) last_negotiation_request_at: i64,
    pub(crate) last_negotiation_check: i64,

    pub(crate) last_background_check: i64,
    pub(crate) last_quality_estimation: i64,
    pub(crate) last_flow_rebalance: i64,
    pub(crate) last_status_dump: i64,
    pub(crate) last_frame: i64,
    pub(crate) overhead_bytes: u64,
    /// Cheap free-running entropy mixed from outgoing packet ids.
    pub(crate) entropy_byte: u8,
    pub(crate) total_underload: u32,
}

impl PathsState {
    pub(crate) fn num_bonded(&self) -> usize {
        self.bond_idx_map.len()
    }

    pub(crate) fn slot_idx_of(&self, path: &Arc<Path>) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.path.as_ref().is_some_and(|p| Arc::ptr_eq(p, path)))
    }
}

/// Point-in-time view of one nominated path, for operators and tests.
#[derive(Debug, Clone)]
pub struct PathStatus {
    pub slot: usize,
    pub addr: SocketAddr,
    pub ifname: String,
    pub alive: bool,
    pub eligible: bool,
    pub bonded: bool,
    pub negotiated: bool,
    pub assigned_flow_count: u32,
    pub packets_in: u64,
    pub packets_out: u64,
    pub latency_mean: f32,
    pub latency_variance: f32,
    pub packet_loss_ratio: f32,
    pub packet_error_ratio: f32,
    pub allocation: u8,
    pub failover_score: i32,
}

/// Point-in-time view of a bond.
#[derive(Debug, Clone)]
pub struct BondStatus {
    pub policy: Policy,
    pub policy_alias: String,
    pub healthy: bool,
    pub num_alive_links: u8,
    pub num_total_links: u8,
    pub num_bonded: usize,
    pub active_path: Option<SocketAddr>,
    pub negotiated_path: Option<SocketAddr>,
    pub flow_count: usize,
    pub paths: Vec<PathStatus>,
}

/// Per-peer aggregation of network paths under one policy.
pub struct Bond {
    policy: Policy,
    policy_alias: String,
    peer: PeerProfile,
    local_address: u64,
    user_flags: UserLinkFlags,
    links: Arc<LinkRegistry>,
    transport: Arc<dyn Transport>,
    entropy: Arc<dyn SecureEntropy>,
    paths: Mutex<PathsState>,
    flows: Mutex<FlowTable>,
}

impl Bond {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        params: &BondParams,
        policy_alias: String,
        peer: PeerProfile,
        local_address: u64,
        user_flags: UserLinkFlags,
        links: Arc<LinkRegistry>,
        transport: Arc<dyn Transport>,
        entropy: Arc<dyn SecureEntropy>,
    ) -> Self {
        let failover_interval = params.failover_interval();
        let state = PathsState {
            slots: std::array::from_fn(|_| PathSlot::default()),
            bond_idx_map: Vec::new(),
            num_alive_links: 0,
            num_total_links: 0,
            is_healthy: false,
            failover_interval,
            up_delay: params.up_delay,
            down_delay: params.down_delay,
            monitor_interval: failover_interval / ECHOS_PER_FAILOVER,
            qos_send_interval: failover_interval * 2,
            quality_estimation_interval: failover_interval * 2,
            packets_per_link: params.packets_per_link,
            quality_weights: params.quality_weights(),
            ab_path_idx: None,
            ab_failover_queue: VecDeque::new(),
            ab_select: params.link_select_method,
            last_ab_change: 0,
            rr_idx: 0,
            rr_packets_on_curr_link: 0,
            local_utility: 0,
            negotiated_path_idx: None,
            sent_negotiation_requests: 0,
            last_negotiation_request_at: 0,
            last_negotiation_check: 0,
            last_background_check: 0,
            last_quality_estimation: 0,
            last_flow_rebalance: 0,
            last_status_dump: 0,
            last_frame: 0,
            overhead_bytes: 0,
            entropy_byte: entropy.byte(),
            total_underload: 0,
        };
        Self {
            policy: params.policy,
            policy_alias,
            peer,
            local_address,
            user_flags,
            links,
            transport,
            entropy,
            paths: Mutex::new(state),
            flows: Mutex::new(FlowTable::new()),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn policy_alias(&self) -> &str {
        &self.policy_alias
    }

    pub fn peer_address(&self) -> u64 {
        self.peer.address
    }

    pub fn is_healthy(&self) -> bool {
        self.paths.lock().unwrap().is_healthy
    }

    /// Heartbeat cadence of this bond, for the caller's timer.
    pub fn monitor_interval(&self) -> i64 {
        self.paths.lock().unwrap().monitor_interval
    }

    /// Offer a candidate path to the bond. Paths on interfaces outside the
    /// policy's link list are silently dropped; accepted paths start their
    /// trial period immediately.
    pub fn nominate(&self, path: Arc<Path>, now: i64) {
        let link =
            self.links
                .link_for_socket(&self.policy_alias, self.transport.as_ref(), path.local_socket);
        if !self.links.link_allowed(&self.policy_alias, link.ifname()) {
            debug!(
                peer = self.peer.address,
                ifname = link.ifname(),
                "nomination dropped, interface not allowed by policy"
            );
            return;
        }
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        if st.slot_idx_of(&path).is_none() {
            let Some(free) = st.slots.iter().position(|s| !s.is_occupied()) else {
                debug!(peer = self.peer.address, "nomination dropped, all path slots occupied");
                return;
            };
            let ifname = link.ifname().to_string();
            let mut shares_link = false;
            for slot in st.slots.iter_mut() {
                if slot.is_occupied() && slot.ifname == ifname {
                    slot.only_path_on_link = false;
                    shares_link = true;
                }
            }
            st.slots[free].occupy(
                now,
                Arc::clone(&path),
                ifname.clone(),
                link.ipv_pref(),
                link.mode(),
                link.enabled(),
            );
            st.slots[free].only_path_on_link = !shares_link;
            info!(
                peer = self.peer.address,
                ifname = %ifname,
                addr = %path.addr,
                "nominated path, trial period started"
            );
        }
        self.curate(st, now, true);
        self.estimate_quality(st, now);
    }

    /// Pick the path the next egress packet should use. `None` means the
    /// caller must drop, defer, or (under broadcast) fan out to every
    /// nominated path itself.
    pub fn appropriate_path(&self, now: i64, flow_id: i32) -> Option<Arc<Path>> {
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        match self.policy {
            Policy::ActiveBackup => {
                let idx = st.ab_path_idx?;
                st.slots[idx].path.clone()
            }
            Policy::Broadcast => None,
            Policy::BalanceRr => self.rr_path(st),
            Policy::BalanceXor | Policy::BalanceAware => self.flow_path(st, now, flow_id),
        }
    }

    /// Account an egress packet: QoS expectation tracking, packet counters,
    /// flow byte counters, entropy mixing.
    pub fn record_outgoing_packet(
        &self,
        path: &Arc<Path>,
        packet_id: u64,
        payload_len: u16,
        verb: Verb,
        flow_id: i32,
        now: i64,
    ) {
        let is_frame = verb.is_frame();
        let should_record = proto::qos_eligible_packet_id(packet_id) && verb.tracks_qos();
        {
            let mut guard = self.paths.lock().unwrap();
            let st = &mut *guard;
            st.entropy_byte = st.entropy_byte.wrapping_add((packet_id >> 8) as u8);
            if is_frame || should_record {
                let Some(idx) = st.slot_idx_of(path) else {
                    return;
                };
                let slot = &mut st.slots[idx];
                slot.last_out = now;
                if is_frame {
                    slot.packets_out += 1;
                    st.last_frame = now;
                }
                if should_record && slot.qos_stats_out.len() < MAX_OUTSTANDING {
                    slot.qos_stats_out.insert(packet_id, now);
                }
            }
        }
        if self.policy.uses_flow_hashing() && flow_id != NO_FLOW {
            let mut flows = self.flows.lock().unwrap();
            if let Some(flow) = flows.get_mut(flow_id) {
                flow.bytes_out += payload_len as u64;
            }
        }
    }

    /// Account an ingress packet: liveness, QoS reporting expectations,
    /// validity samples, and flow learning (the peer's ingress path choice
    /// pins new flows for symmetric routing).
    pub fn record_incoming_packet(
        &self,
        path: &Arc<Path>,
        packet_id: u64,
        payload_len: u16,
        verb: Verb,
        flow_id: i32,
        now: i64,
    ) {
        let is_frame = verb.is_frame();
        let should_record = proto::qos_eligible_packet_id(packet_id) && verb.tracks_qos();
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        let Some(idx) = st.slot_idx_of(path) else {
            return;
        };
        {
            let slot = &mut st.slots[idx];
            if !slot.alive {
                slot.last_alive_toggle = now;
            }
            slot.last_in = now;
            if (is_frame || should_record) && slot.allowed() {
                if is_frame {
                    slot.packets_in += 1;
                    st.last_frame = now;
                }
                if should_record {
                    if slot.qos_stats_in.len() < MAX_OUTSTANDING {
                        slot.qos_stats_in.insert(packet_id, now);
                        slot.packets_received_since_last_qos += 1;
                    }
                    slot.validity_samples.push(1.0);
                }
            }
        }
        if flow_id != NO_FLOW && self.policy.is_balance() {
            let mut flows = self.flows.lock().unwrap();
            if !flows.contains(flow_id) {
                self.create_flow(st, &mut flows, Some(idx), flow_id, 0, now);
            }
            if let Some(flow) = flows.get_mut(flow_id) {
                flow.bytes_in += payload_len as u64;
            }
        }
    }

    /// Note a packet that failed upstream validation on a path. Feeds the
    /// packet-error ratio.
    pub fn record_incoming_invalid_packet(&self, path: &Arc<Path>) {
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        if let Some(idx) = st.slot_idx_of(path) {
            st.slots[idx].validity_samples.push(0.0);
        }
    }

    /// Run curation, quality estimation, ambient probing, per-policy tasks,
    /// and negotiation checks. Safe to call from a shared timer thread; calls
    /// arriving faster than [`BACKGROUND_TASK_MIN_INTERVAL`] are ignored.
    pub fn process_background_tasks(&self, now: i64) {
        if !self.peer.multipath_supported {
            return;
        }
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        if (now - st.last_background_check) < BACKGROUND_TASK_MIN_INTERVAL {
            return;
        }
        st.last_background_check = now;

        self.curate(st, now, false);
        if (now - st.last_quality_estimation) > st.quality_estimation_interval {
            st.last_quality_estimation = now;
            self.estimate_quality(st, now);
        }
        self.dump_status(st, now, false);
        self.send_ambient_probes(st, now);

        match self.policy {
            Policy::ActiveBackup => self.process_active_backup_tasks(st, now),
            Policy::Broadcast => {}
            Policy::BalanceRr | Policy::BalanceXor | Policy::BalanceAware => {
                self.process_balance_tasks(st, now)
            }
        }

        if self.policy == Policy::ActiveBackup
            && st.ab_select == LinkSelectMethod::Optimize
            && (now - st.last_negotiation_check) > OPTIMIZE_INTERVAL
        {
            st.last_negotiation_check = now;
            self.negotiation_check(st, now);
        }
    }

    /// Refresh per-slot state machines and, when needed, rebuild the bonded
    /// path set.
    fn curate(&self, st: &mut PathsState, now: i64, mut rebuild: bool) {
        let failover_interval = st.failover_interval;
        let up_delay = st.up_delay;
        let down_delay = st.down_delay;
        let flow_hashing = self.policy.uses_flow_hashing();

        let mut num_total: u8 = 0;
        let mut num_alive: u8 = 0;
        for slot in st.slots.iter_mut() {
            if !slot.is_occupied() {
                continue;
            }
            num_total += 1;
            slot.alive = slot.age(now) < failover_interval;

            let acceptable_age = slot.age(now) < failover_interval + down_delay;
            let satisfied_up_delay = (now - slot.last_alive_toggle) >= up_delay;
            let in_trial = (now - slot.nominated_at) < OPTIMIZE_INTERVAL;
            let eligible = slot.allowed() && ((acceptable_age && satisfied_up_delay) || in_trial);

            if eligible != slot.eligible {
                if eligible {
                    info!(
                        peer = self.peer.address,
                        ifname = %slot.ifname,
                        "link is eligible"
                    );
                    rebuild = true;
                } else {
                    info!(
                        peer = self.peer.address,
                        ifname = %slot.ifname,
                        "link is no longer eligible"
                    );
                    slot.adjust_refractory_period(DEFAULT_REFRACTORY_PERIOD, true);
                    if slot.bonded {
                        slot.bonded = false;
                        slot.allocation = 0;
                        rebuild = true;
                        if flow_hashing {
                            slot.should_reallocate_flows = true;
                            debug!(
                                peer = self.peer.address,
                                ifname = %slot.ifname,
                                "bonded link lost, flow reallocation pending"
                            );
                        }
                    }
                }
            }
            if eligible {
                slot.adjust_refractory_period(DEFAULT_REFRACTORY_PERIOD, false);
                num_alive += 1;
            }
            slot.eligible = eligible;
        }

        st.num_alive_links = num_alive;
        st.num_total_links = num_total;
        let healthy = match self.policy {
            Policy::ActiveBackup => num_alive >= 2,
            Policy::Broadcast => num_alive >= 1,
            Policy::BalanceRr | Policy::BalanceXor | Policy::BalanceAware => {
                num_alive == num_total
            }
        };
        if healthy != st.is_healthy {
            info!(
                peer = self.peer.address,
                healthy,
                alive = num_alive,
                total = num_total,
                "bond health changed"
            );
            st.is_healthy = healthy;
            self.dump_status(st, now, true);
        }

        if self.policy.is_balance() && (rebuild || st.bond_idx_map.is_empty()) {
            self.rebuild_bonded_set(st);
        }
    }

    /// Re-form the bonded set from the eligible slots, honoring each link's
    /// IP-version preference. Replaces the bonded-index map wholesale.
    fn rebuild_bonded_set(&self, st: &mut PathsState) {
        let mut by_link: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, slot) in st.slots.iter().enumerate() {
            if slot.is_occupied() && slot.eligible {
                by_link.entry(slot.ifname.clone()).or_default().push(i);
            }
        }

        let mut new_map: Vec<usize> = Vec::new();
        for (ifname, idxs) in &by_link {
            let pref = st.slots[idxs[0]].ipv_pref;
            match pref {
                // Strict family limits are enforced by allowed() itself.
                IpvPreference::Any | IpvPreference::V4 | IpvPreference::V6 => {
                    new_map.extend(idxs.iter().copied().filter(|&i| st.slots[i].allowed()));
                }
                IpvPreference::PreferV4 | IpvPreference::PreferV6 => {
                    let preferred: Vec<usize> = idxs
                        .iter()
                        .copied()
                        .filter(|&i| st.slots[i].allowed() && st.slots[i].preferred())
                        .collect();
                    if preferred.is_empty() {
                        debug!(
                            peer = self.peer.address,
                            ifname = %ifname,
                            "first-choice address family unavailable on link, settling"
                        );
                        new_map.extend(idxs.iter().copied().filter(|&i| st.slots[i].allowed()));
                    } else {
                        new_map.extend(preferred);
                    }
                }
            }
        }

        for (i, slot) in st.slots.iter_mut().enumerate() {
            if !slot.is_occupied() {
                continue;
            }
            let bonded = new_map.contains(&i);
            if !bonded {
                slot.allocation = 0;
            }
            slot.bonded = bonded;
        }
        st.bond_idx_map = new_map;
        if self.policy == Policy::BalanceRr {
            // Restart the stripe deterministically on the refreshed set.
            st.rr_idx = 0;
            st.rr_packets_on_curr_link = 0;
        }
        debug!(
            peer = self.peer.address,
            num_bonded = st.bond_idx_map.len(),
            "rebuilt bonded path set"
        );
    }

    /// Periodic state dump at debug/trace level.
    fn dump_status(&self, st: &mut PathsState, now: i64, force: bool) {
        let elapsed = now - st.last_status_dump;
        if !force && elapsed < STATUS_INTERVAL {
            return;
        }
        st.last_status_dump = now;
        let ambient_kbps = if elapsed > 0 {
            (st.overhead_bytes as f32 / (elapsed as f32 / 1000.0)) / 1000.0
        } else {
            0.0
        };
        st.overhead_bytes = 0;
        debug!(
            peer = self.peer.address,
            policy = self.policy.name(),
            failover_interval = st.failover_interval,
            monitor_interval = st.monitor_interval,
            up_delay = st.up_delay,
            down_delay = st.down_delay,
            num_bonded = st.num_bonded(),
            ms_since_last_frame = now - st.last_frame,
            ambient_kbps,
            "bond status"
        );
        for (i, slot) in st.slots.iter().enumerate() {
            if !slot.is_occupied() {
                continue;
            }
            trace!(
                slot = i,
                ifname = %slot.ifname,
                alive = slot.alive,
                eligible = slot.eligible,
                bonded = slot.bonded,
                flows = slot.assigned_flow_count,
                latency = slot.latency_mean,
                jitter = slot.latency_variance,
                loss = slot.packet_loss_ratio,
                error = slot.packet_error_ratio,
                qos_records = slot.qos_record_size.mean(),
                allocation = slot.allocation,
                "path status"
            );
        }
    }

    /// Snapshot of the bond for operators and tests.
    pub fn status(&self) -> BondStatus {
        let guard = self.paths.lock().unwrap();
        let st = &*guard;
        let paths = st
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let path = s.path.as_ref()?;
                Some(PathStatus {
                    slot: i,
                    addr: path.addr,
                    ifname: s.ifname.clone(),
                    alive: s.alive,
                    eligible: s.eligible,
                    bonded: s.bonded,
                    negotiated: s.negotiated,
                    assigned_flow_count: s.assigned_flow_count,
                    packets_in: s.packets_in,
                    packets_out: s.packets_out,
                    latency_mean: s.latency_mean,
                    latency_variance: s.latency_variance,
                    packet_loss_ratio: s.packet_loss_ratio,
                    packet_error_ratio: s.packet_error_ratio,
                    allocation: s.allocation,
                    failover_score: s.failover_score,
                })
            })
            .collect();
        let active_path = st
            .ab_path_idx
            .and_then(|i| st.slots[i].path.as_ref())
            .map(|p| p.addr);
        let negotiated_path = st
            .negotiated_path_idx
            .and_then(|i| st.slots[i].path.as_ref())
            .map(|p| p.addr);
        let status = BondStatus {
            policy: self.policy,
            policy_alias: self.policy_alias.clone(),
            healthy: st.is_healthy,
            num_alive_links: st.num_alive_links,
            num_total_links: st.num_total_links,
            num_bonded: st.num_bonded(),
            active_path,
            negotiated_path,
            flow_count: 0,
            paths,
        };
        drop(guard);
        BondStatus {
            flow_count: self.flows.lock().unwrap().len(),
            ..status
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::link::{Link, LinkMode};
    use crate::path::LocalSocket;
    use std::sync::Mutex as StdMutex;

    /// Transport fake: socket N resolves to interface `ethN`, every probe is
    /// recorded for inspection.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: StdMutex<Vec<(SocketAddr, Verb, Vec<u8>)>>,
    }

    impl Transport for RecordingTransport {
        fn put_packet(
            &self,
            _peer: u64,
            _local_socket: LocalSocket,
            addr: SocketAddr,
            verb: Verb,
            payload: &[u8],
        ) {
            self.sent.lock().unwrap().push((addr, verb, payload.to_vec()));
        }

        fn interface_name(&self, local_socket: LocalSocket) -> Option<String> {
            Some(format!("eth{local_socket}"))
        }
    }

    pub(crate) struct FixedEntropy(pub u8);

    impl SecureEntropy for FixedEntropy {
        fn fill(&self, buf: &mut [u8]) {
            buf.fill(self.0);
        }
    }

    pub(crate) struct TestHarness {
        pub bond: Bond,
        pub transport: Arc<RecordingTransport>,
        pub links: Arc<LinkRegistry>,
    }

    pub(crate) fn harness(params: BondParams) -> TestHarness {
        harness_with(params, 0x0a0b0c0d0e, 0x0102030405, 0)
    }

    pub(crate) fn harness_with(
        params: BondParams,
        peer_address: u64,
        local_address: u64,
        entropy: u8,
    ) -> TestHarness {
        let transport = Arc::new(RecordingTransport::default());
        let links = Arc::new(LinkRegistry::new());
        let bond = Bond::new(
            &params,
            params.policy.name().to_string(),
            PeerProfile::new(peer_address),
            local_address,
            UserLinkFlags::default(),
            Arc::clone(&links),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(FixedEntropy(entropy)),
        );
        TestHarness {
            bond,
            transport,
            links,
        }
    }

    pub(crate) fn path(socket: LocalSocket) -> Arc<Path> {
        Arc::new(Path::new(
            format!("192.0.2.{}:9993", socket + 1).parse().unwrap(),
            socket,
        ))
    }

    pub(crate) fn primary_link(ifname: &str) -> Link {
        Link::new(ifname, LinkMode::Primary, IpvPreference::Any, None, 0, true)
    }

    /// Keep the given paths alive with regular traffic from `from` to `to`,
    /// running the background sweep once per simulated second.
    pub(crate) fn drive_traffic(bond: &Bond, paths: &[Arc<Path>], from: i64, to: i64) {
        let mut t = from;
        let mut id: u64 = 1;
        while t <= to {
            for p in paths {
                bond.record_incoming_packet(p, id, 100, Verb::Frame, NO_FLOW, t);
                id += 1;
            }
            bond.process_background_tasks(t);
            t += 1_000;
        }
    }
}
