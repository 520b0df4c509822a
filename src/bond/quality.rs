//! Quality estimation and QoS accounting.
//!
//! Each path's quality is estimated from rolling observations: latency
//! samples recovered from QoS round trips, validity samples from upstream
//! packet authentication, and loss inferred from QoS records that were
//! never acknowledged. The estimator turns these into relative per-path
//! allocations (0-255) that drive balance-aware assignment and failover
//! scoring.

use std::sync::Arc;

use tracing::trace;

use super::{
    Bond, PathsState, MAX_ACCEPTABLE_ERROR, MAX_ACCEPTABLE_JITTER, MAX_ACCEPTABLE_LATENCY,
    MAX_ACCEPTABLE_LOSS, QOS_RECORD_TIMEOUT, QW_LAT, QW_PDV, QW_PER, QW_PLR,
};
use crate::path::{Path, PathSlot, MAX_PATHS};
use crate::proto::{self, QosRecord, Verb, QOS_TABLE_SIZE};

/// Map a raw observation onto (0, 1], decaying exponentially toward the
/// acceptability ceiling.
fn normalize(value: f32, max_acceptable: f32) -> f32 {
    (-4.0 * (value / max_acceptable).clamp(0.0, 1.0)).exp()
}

impl Bond {
    /// Ingest a QOS_MEASUREMENT payload received on `path`. Each record that
    /// matches an outstanding expectation yields one latency sample:
    /// half the round trip minus the peer's holding time.
    pub fn received_qos(&self, path: &Arc<Path>, now: i64, records: &[QosRecord]) {
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        let Some(idx) = st.slot_idx_of(path) else {
            return;
        };
        let slot = &mut st.slots[idx];
        for record in records {
            if let Some(sent_at) = slot.qos_stats_out.remove(&record.packet_id) {
                let one_way = ((now - sent_at) - record.holding_time_ms as i64) as f32 / 2.0;
                slot.latency_samples.push(one_way);
                slot.qos_records_acked += 1;
            }
        }
        slot.qos_record_size.push(records.len() as f32);
        trace!(
            peer = self.peer.address,
            ifname = %slot.ifname,
            records = records.len(),
            "received QoS report"
        );
    }

    /// Emit heartbeats and QoS reports on every allowed path that is due.
    pub(crate) fn send_ambient_probes(&self, st: &mut PathsState, now: i64) {
        let monitor_interval = st.monitor_interval;
        let qos_send_interval = st.qos_send_interval;
        let mut overhead: u64 = 0;
        for slot in st.slots.iter_mut() {
            if !slot.is_occupied() || !slot.allowed() {
                continue;
            }
            let Some(path) = slot.path.clone() else {
                continue;
            };
            if self.peer.echo_supported
                && monitor_interval > 0
                && (now - slot.last_out) >= monitor_interval
            {
                trace!(
                    peer = self.peer.address,
                    ifname = %slot.ifname,
                    "sending heartbeat"
                );
                self.transport.put_packet(
                    self.peer.address,
                    path.local_socket,
                    path.addr,
                    Verb::Echo,
                    &[],
                );
                slot.last_out = now;
            }
            if slot.needs_qos(now, qos_send_interval, QOS_TABLE_SIZE) {
                let payload = drain_qos_report(slot, now);
                if !payload.is_empty() {
                    self.transport.put_packet(
                        self.peer.address,
                        path.local_socket,
                        path.addr,
                        Verb::QosMeasurement,
                        &payload,
                    );
                    overhead += payload.len() as u64;
                    slot.packets_received_since_last_qos = 0;
                    slot.last_qos_sent = now;
                    slot.last_out = now;
                }
            }
        }
        st.overhead_bytes += overhead;
    }

    /// Re-derive per-path summary statistics and distribute allocations
    /// across the bonded set in proportion to relative quality.
    pub(crate) fn estimate_quality(&self, st: &mut PathsState, now: i64) {
        // Relative user-declared link speeds.
        if !st.bond_idx_map.is_empty() && self.user_flags.specified_speeds {
            let mut total_speed: u64 = 0;
            for &i in &st.bond_idx_map {
                if !st.slots[i].allowed() {
                    continue;
                }
                if let Some(link) = self.links.link_by_name(&self.policy_alias, &st.slots[i].ifname)
                {
                    total_speed += link.speed();
                }
            }
            if total_speed > 0 {
                for &i in &st.bond_idx_map {
                    if !st.slots[i].allowed() {
                        continue;
                    }
                    if let Some(link) =
                        self.links.link_by_name(&self.policy_alias, &st.slots[i].ifname)
                    {
                        let relative =
                            ((link.speed() as f64 / total_speed as f64) * 255.0).round() as u8;
                        link.set_relative_speed(relative);
                    }
                }
            }
        }

        let mut lat = [0f32; MAX_PATHS];
        let mut pdv = [0f32; MAX_PATHS];
        let mut plr = [0f32; MAX_PATHS];
        let mut per = [0f32; MAX_PATHS];
        let (mut max_lat, mut max_pdv, mut max_plr, mut max_per) = (0f32, 0f32, 0f32, 0f32);

        for i in 0..MAX_PATHS {
            let slot = &mut st.slots[i];
            if !slot.is_occupied() || !slot.allowed() {
                continue;
            }
            slot.latency_mean = slot.latency_samples.mean();
            slot.latency_variance = slot.latency_samples.stddev();
            slot.packet_error_ratio = if slot.validity_samples.is_empty() {
                0.0
            } else {
                1.0 - slot.validity_samples.mean()
            };
            if self.user_flags.specified_speeds {
                if let Some(link) = self.links.link_by_name(&self.policy_alias, &slot.ifname) {
                    slot.throughput_mean = link.speed() as f32;
                }
            }

            // Expire unacknowledged QoS records as losses.
            let outstanding_before = slot.qos_stats_out.len();
            slot.qos_stats_out
                .retain(|_, sent_at| (now - *sent_at) < QOS_RECORD_TIMEOUT);
            let lost = (outstanding_before - slot.qos_stats_out.len()) as u32;
            let acked = slot.qos_records_acked;
            slot.qos_records_acked = 0;
            if lost + acked > 0 {
                slot.loss_estimate
                    .update(lost as f32 / (lost + acked) as f32);
            }
            slot.packet_loss_ratio = slot.loss_estimate.value();

            lat[i] = normalize(slot.latency_mean, MAX_ACCEPTABLE_LATENCY);
            pdv[i] = normalize(slot.latency_variance, MAX_ACCEPTABLE_JITTER);
            plr[i] = normalize(slot.packet_loss_ratio, MAX_ACCEPTABLE_LOSS);
            per[i] = normalize(slot.packet_error_ratio, MAX_ACCEPTABLE_ERROR);
            max_lat = max_lat.max(lat[i]);
            max_pdv = max_pdv.max(pdv[i]);
            max_plr = max_plr.max(plr[i]);
            max_per = max_per.max(per[i]);
        }

        // Weighted sum of the normalized-relative metrics, bonded slots only.
        let qw = st.quality_weights;
        let mut quality = [0f32; MAX_PATHS];
        let mut total_quality = 0f32;
        for i in 0..MAX_PATHS {
            let slot = &st.slots[i];
            if !slot.is_occupied() || !slot.bonded {
                continue;
            }
            quality[i] += (if max_lat > 0.0 { lat[i] / max_lat } else { 0.0 }) * qw[QW_LAT];
            quality[i] += (if max_pdv > 0.0 { pdv[i] / max_pdv } else { 0.0 }) * qw[QW_PDV];
            quality[i] += (if max_plr > 0.0 { plr[i] / max_plr } else { 0.0 }) * qw[QW_PLR];
            quality[i] += (if max_per > 0.0 { per[i] / max_per } else { 0.0 }) * qw[QW_PER];
            total_quality += quality[i];
        }

        if total_quality > 0.0 {
            for i in 0..MAX_PATHS {
                let slot = &mut st.slots[i];
                if !slot.is_occupied() || !slot.bonded {
                    continue;
                }
                let share = ((quality[i] / total_quality) * 255.0).ceil().min(255.0);
                slot.allocation = share as u8;
            }
        }
    }
}

/// Serialize and clear the pending QoS expectations of a slot, oldest ids
/// first, up to the per-packet record cap.
fn drain_qos_report(slot: &mut PathSlot, now: i64) -> Vec<u8> {
    let budget = (slot.packets_received_since_last_qos as usize).min(QOS_TABLE_SIZE);
    let mut ids: Vec<u64> = slot.qos_stats_in.keys().copied().collect();
    ids.sort_unstable();
    ids.truncate(budget);

    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(received_at) = slot.qos_stats_in.remove(&id) {
            let holding = (now - received_at).clamp(0, u16::MAX as i64) as u16;
            records.push(QosRecord {
                packet_id: id,
                holding_time_ms: holding,
            });
        }
    }
    proto::encode_qos_records(&records)
}
