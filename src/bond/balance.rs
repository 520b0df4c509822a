//! Balance policies: rr striping, xor/aware flow pinning, and the periodic
//! flow maintenance they share.

use std::sync::Arc;

use tracing::{debug, info, trace};

use super::{Bond, PathsState, Policy, FLOW_REBALANCE_INTERVAL};
use crate::flow::{Flow, FlowTable, NO_FLOW};
use crate::path::{Path, MAX_PATHS};

/// A bonded link performing below this fraction of the mean allocation gets
/// its flows migrated away (balance-aware).
const UNDERPERFORMANCE_FRACTION: f32 = 0.33;

impl Bond {
    /// balance-rr send-path selection: emit `packets_per_link` packets per
    /// bonded link, then advance to the next eligible one. A width of zero
    /// degenerates to a random bonded slot per packet.
    pub(crate) fn rr_path(&self, st: &mut PathsState) -> Option<Arc<Path>> {
        let num_bonded = st.num_bonded();
        if num_bonded == 0 {
            return None;
        }
        if st.packets_per_link == 0 {
            let slot_idx = st.bond_idx_map[st.entropy_byte as usize % num_bonded];
            return st.slots[slot_idx].path.clone();
        }
        if st.rr_idx >= num_bonded {
            st.rr_idx = 0;
            st.rr_packets_on_curr_link = 0;
        }
        let current_usable = {
            let slot = &st.slots[st.bond_idx_map[st.rr_idx]];
            slot.is_occupied() && slot.eligible
        };
        if st.rr_packets_on_curr_link >= st.packets_per_link || !current_usable {
            st.rr_packets_on_curr_link = 0;
            for step in 1..=num_bonded {
                let candidate = (st.rr_idx + step) % num_bonded;
                let slot = &st.slots[st.bond_idx_map[candidate]];
                if slot.is_occupied() && slot.eligible {
                    st.rr_idx = candidate;
                    break;
                }
            }
        }
        st.rr_packets_on_curr_link += 1;
        st.slots[st.bond_idx_map[st.rr_idx]].path.clone()
    }

    /// balance-xor / balance-aware send-path selection: unclassified traffic
    /// takes a random bonded slot, classified traffic sticks to its flow's
    /// assigned path.
    pub(crate) fn flow_path(
        &self,
        st: &mut PathsState,
        now: i64,
        flow_id: i32,
    ) -> Option<Arc<Path>> {
        let num_bonded = st.num_bonded();
        if num_bonded == 0 {
            return None;
        }
        if flow_id == NO_FLOW {
            let slot_idx = st.bond_idx_map[st.entropy_byte as usize % num_bonded];
            return st.slots[slot_idx].path.clone();
        }
        let entropy = self.entropy.byte();
        let mut flows = self.flows.lock().unwrap();
        if let Some(flow) = flows.get_mut(flow_id) {
            flow.last_activity = now;
            let idx = flow.assigned_path;
            return st.slots[idx].path.clone();
        }
        let assigned = self.create_flow(st, &mut flows, None, flow_id, entropy, now)?;
        st.slots[assigned].path.clone()
    }

    /// Track a new flow. An ingress slot, when given, pins the flow to the
    /// path the remote peer chose for it; egress flows are assigned by
    /// policy. Returns the assigned slot index.
    pub(crate) fn create_flow(
        &self,
        st: &mut PathsState,
        flows: &mut FlowTable,
        incoming_idx: Option<usize>,
        flow_id: i32,
        entropy: u8,
        now: i64,
    ) -> Option<usize> {
        if st.num_bonded() == 0 {
            debug!(
                peer = self.peer.address,
                flow = flow_id,
                "unable to assign flow, bond has no links"
            );
            return None;
        }
        if flows.is_full() {
            if let Some(evicted) = flows.evict_oldest(now) {
                debug!(
                    peer = self.peer.address,
                    flow = evicted.id,
                    "forgot oldest flow, table is full"
                );
                let slot = &mut st.slots[evicted.assigned_path];
                slot.assigned_flow_count = slot.assigned_flow_count.saturating_sub(1);
            }
        }
        let mut flow = Flow::new(flow_id, now);
        let assigned = match incoming_idx {
            Some(idx) => {
                flow.assign(idx, now);
                st.slots[idx].assigned_flow_count += 1;
                trace!(
                    peer = self.peer.address,
                    flow = flow_id,
                    slot = idx,
                    "assigned in-flow to the peer's chosen path"
                );
                idx
            }
            None => self.assign_flow_to_bonded_path(st, &mut flow, entropy, now)?,
        };
        flows.insert(flow);
        Some(assigned)
    }

    /// Pick a bonded slot for an egress flow according to policy and record
    /// the assignment.
    pub(crate) fn assign_flow_to_bonded_path(
        &self,
        st: &mut PathsState,
        flow: &mut Flow,
        entropy: u8,
        now: i64,
    ) -> Option<usize> {
        let num_bonded = st.num_bonded();
        if num_bonded == 0 {
            return None;
        }
        let idx = match self.policy {
            Policy::BalanceXor => st.bond_idx_map[flow.id.unsigned_abs() as usize % num_bonded],
            Policy::BalanceAware => self.weighted_bonded_slot(st, entropy)?,
            _ => return None,
        };
        flow.assign(idx, now);
        st.slots[idx].assigned_flow_count += 1;
        trace!(
            peer = self.peer.address,
            flow = flow.id,
            slot = idx,
            flows_on_slot = st.slots[idx].assigned_flow_count,
            "assigned out-flow"
        );
        Some(idx)
    }

    /// Weighted random pick over the bonded set. Underload state switches
    /// the segment weights from allocation to affinity; entropy is rescaled
    /// to the actual weight sum so sums short of 255 stay reachable.
    fn weighted_bonded_slot(&self, st: &PathsState, entropy: u8) -> Option<usize> {
        let use_affinity = st.total_underload > 0;
        let segment = |i: usize| -> u32 {
            if use_affinity {
                st.slots[i].affinity as u32
            } else {
                st.slots[i].allocation as u32
            }
        };
        let total: u32 = st.bond_idx_map.iter().map(|&i| segment(i)).sum();
        if total == 0 {
            // No allocations yet, e.g. right after a rebuild: uniform pick.
            return Some(st.bond_idx_map[entropy as usize % st.num_bonded()]);
        }
        let mut remaining = entropy as u32 % total;
        for &i in &st.bond_idx_map {
            let weight = segment(i);
            if remaining <= weight {
                return Some(i);
            }
            remaining -= weight;
        }
        st.bond_idx_map.last().copied()
    }

    /// Periodic balance work: flow expiry, byte-count resets, and flow
    /// reallocation away from dead or under-performing links.
    pub(crate) fn process_balance_tasks(&self, st: &mut PathsState, now: i64) {
        if !self.policy.uses_flow_hashing() {
            return;
        }
        let mut flows = self.flows.lock().unwrap();

        if (now - st.last_flow_rebalance) > FLOW_REBALANCE_INTERVAL {
            st.last_flow_rebalance = now;
            for evicted in flows.evict_idle(FLOW_REBALANCE_INTERVAL, now) {
                debug!(
                    peer = self.peer.address,
                    flow = evicted.id,
                    "forgot idle flow"
                );
                let slot = &mut st.slots[evicted.assigned_path];
                slot.assigned_flow_count = slot.assigned_flow_count.saturating_sub(1);
            }
            flows.reset_byte_counts();
        }

        for i in 0..MAX_PATHS {
            if !st.slots[i].is_occupied() {
                continue;
            }
            if !st.slots[i].eligible && st.slots[i].should_reallocate_flows {
                info!(
                    peer = self.peer.address,
                    ifname = %st.slots[i].ifname,
                    "reallocating flows from dead link"
                );
                self.reallocate_flows_from(st, &mut flows, i, now);
                st.slots[i].should_reallocate_flows = false;
            }
        }

        if self.policy == Policy::BalanceAware {
            let num_bonded = st.num_bonded();
            if num_bonded > 0 {
                let total: u32 = st
                    .bond_idx_map
                    .iter()
                    .filter(|&&i| st.slots[i].eligible)
                    .map(|&i| st.slots[i].allocation as u32)
                    .sum();
                let minimum =
                    (UNDERPERFORMANCE_FRACTION * (total as f32 / num_bonded as f32)) as u32;
                for i in 0..MAX_PATHS {
                    let underperforming = {
                        let s = &st.slots[i];
                        s.is_occupied()
                            && s.bonded
                            && s.eligible
                            && (s.allocation as u32) < minimum
                            && s.assigned_flow_count > 0
                    };
                    if underperforming {
                        info!(
                            peer = self.peer.address,
                            ifname = %st.slots[i].ifname,
                            allocation = st.slots[i].allocation,
                            "reallocating flows from under-performing link"
                        );
                        self.reallocate_flows_from(st, &mut flows, i, now);
                    }
                }
            }
        }
    }

    /// Re-assign every flow currently pinned to `slot_idx`.
    fn reallocate_flows_from(
        &self,
        st: &mut PathsState,
        flows: &mut FlowTable,
        slot_idx: usize,
        now: i64,
    ) {
        let pinned: Vec<i32> = flows
            .iter()
            .filter(|f| f.assigned_path == slot_idx)
            .map(|f| f.id)
            .collect();
        for id in pinned {
            let entropy = self.entropy.byte();
            let Some(flow) = flows.get_mut(id) else {
                continue;
            };
            if self.assign_flow_to_bonded_path(st, flow, entropy, now).is_some() {
                let slot = &mut st.slots[slot_idx];
                slot.assigned_flow_count = slot.assigned_flow_count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{BondParams, Policy};
    use super::*;
    use crate::proto::Verb;

    fn rr_params(packets_per_link: u32) -> BondParams {
        let mut params = BondParams::new(Policy::BalanceRr);
        params.packets_per_link = packets_per_link;
        params
    }

    #[test]
    fn test_rr_stripes_packets_per_link() {
        let h = harness(rr_params(3));
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);

        let picks: Vec<_> = (0..6)
            .map(|_| h.bond.appropriate_path(1_000, NO_FLOW).unwrap().addr)
            .collect();
        assert_eq!(
            picks,
            vec![a.addr, a.addr, a.addr, b.addr, b.addr, b.addr]
        );
        // The stripe wraps around.
        assert_eq!(h.bond.appropriate_path(1_000, NO_FLOW).unwrap().addr, a.addr);
    }

    #[test]
    fn test_rr_skips_ineligible_slot() {
        let h = harness(rr_params(1));
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);
        {
            let mut guard = h.bond.paths.lock().unwrap();
            let idx = guard.slot_idx_of(&b).unwrap();
            guard.slots[idx].eligible = false;
        }
        for _ in 0..4 {
            assert_eq!(h.bond.appropriate_path(0, NO_FLOW).unwrap().addr, a.addr);
        }
    }

    #[test]
    fn test_xor_pins_flow_by_modulus() {
        let h = harness(BondParams::new(Policy::BalanceXor));
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);

        // |7| mod 2 = 1: the second bonded slot.
        let first = h.bond.appropriate_path(1_000, 7).unwrap();
        let second = h.bond.appropriate_path(2_000, 7).unwrap();
        assert_eq!(first.addr, b.addr);
        assert_eq!(second.addr, b.addr);

        let status = h.bond.status();
        assert_eq!(status.flow_count, 1);
        let b_status = status.paths.iter().find(|p| p.addr == b.addr).unwrap();
        assert_eq!(b_status.assigned_flow_count, 1);
    }

    #[test]
    fn test_incoming_flow_pinned_to_ingress_path() {
        let h = harness(BondParams::new(Policy::BalanceXor));
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);

        // Flow 8 would hash to slot 0, but it arrives on b: honor the
        // peer's choice for symmetric routing.
        h.bond
            .record_incoming_packet(&b, 0x11, 64, Verb::Frame, 8, 500);
        assert_eq!(h.bond.appropriate_path(600, 8).unwrap().addr, b.addr);
    }

    #[test]
    fn test_aware_weighted_assignment_follows_allocation() {
        let h = harness_with(BondParams::new(Policy::BalanceAware), 0x0a, 0x0b, 200);
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);
        {
            let mut guard = h.bond.paths.lock().unwrap();
            let st = &mut *guard;
            let ia = st.slot_idx_of(&a).unwrap();
            let ib = st.slot_idx_of(&b).unwrap();
            st.slots[ia].allocation = 50;
            st.slots[ib].allocation = 205;
        }
        // entropy 200 % 255 = 200; 200 > 50 so the walk lands on b.
        assert_eq!(h.bond.appropriate_path(1_000, 42).unwrap().addr, b.addr);
    }

    #[test]
    fn test_aware_zero_allocation_falls_back_uniform() {
        let h = harness_with(BondParams::new(Policy::BalanceAware), 0x0a, 0x0b, 3);
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);
        {
            // Simulate the window right after a rebuild, before any
            // estimation has distributed allocations.
            let mut guard = h.bond.paths.lock().unwrap();
            for slot in guard.slots.iter_mut() {
                slot.allocation = 0;
            }
        }
        // Degenerate weights: uniform pick, entropy 3 % 2 = 1 -> b.
        assert_eq!(h.bond.appropriate_path(1_000, 9).unwrap().addr, b.addr);
    }

    #[test]
    fn test_flow_table_overflow_evicts_single_oldest() {
        let h = harness(BondParams::new(Policy::BalanceXor));
        let a = path(0);
        h.bond.nominate(Arc::clone(&a), 0);

        {
            let mut guard = h.bond.paths.lock().unwrap();
            let st = &mut *guard;
            let mut flows = h.bond.flows.lock().unwrap();
            for id in 0..crate::flow::MAX_FLOWS as i32 {
                // Stagger activity so id 0 is the oldest.
                self_create(&h.bond, st, &mut flows, id, id as i64);
            }
            assert!(flows.is_full());
            self_create(&h.bond, st, &mut flows, 900_000, 1_000_000);
            assert_eq!(flows.len(), crate::flow::MAX_FLOWS);
            assert!(!flows.contains(0));
            assert!(flows.contains(900_000));
        }

        fn self_create(
            bond: &Bond,
            st: &mut PathsState,
            flows: &mut FlowTable,
            id: i32,
            now: i64,
        ) {
            bond.create_flow(st, flows, None, id, 0, now);
        }
    }

    #[test]
    fn test_dead_path_flows_are_reallocated() {
        let h = harness(BondParams::new(Policy::BalanceXor));
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);
        drive_traffic(&h.bond, &[Arc::clone(&a), Arc::clone(&b)], 1_000, 16_000);

        // 100 flows split 50/50 by the xor modulus.
        for id in 0..100 {
            h.bond.appropriate_path(16_000, id).unwrap();
        }
        let status = h.bond.status();
        assert!(status
            .paths
            .iter()
            .all(|p| p.assigned_flow_count == 50));

        // Path a dies; its flows all land on b.
        let mut t = 17_000;
        while t <= 23_000 {
            h.bond
                .record_incoming_packet(&b, t as u64, 64, Verb::Frame, NO_FLOW, t);
            h.bond.process_background_tasks(t);
            t += 1_000;
        }
        let status = h.bond.status();
        let a_status = status.paths.iter().find(|p| p.addr == a.addr).unwrap();
        let b_status = status.paths.iter().find(|p| p.addr == b.addr).unwrap();
        assert!(!a_status.eligible);
        assert_eq!(a_status.assigned_flow_count, 0);
        assert_eq!(b_status.assigned_flow_count, 100);
        assert_eq!(status.flow_count, 100);
    }

    #[test]
    fn test_idle_flows_expire() {
        let h = harness(BondParams::new(Policy::BalanceXor));
        let a = path(0);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.appropriate_path(1_000, 5).unwrap();
        assert_eq!(h.bond.status().flow_count, 1);

        // Keep the path alive but the flow idle past the rebalance window.
        // Two windows must elapse: the first sweep runs before the flow's
        // idle age strictly exceeds the cutoff.
        let mut t = 2_000;
        while t <= 2 * FLOW_REBALANCE_INTERVAL + 4_000 {
            h.bond
                .record_incoming_packet(&a, t as u64, 64, Verb::Frame, NO_FLOW, t);
            h.bond.process_background_tasks(t);
            t += 1_000;
        }
        assert_eq!(h.bond.status().flow_count, 0);
        assert_eq!(h.bond.status().paths[0].assigned_flow_count, 0);
    }
}
