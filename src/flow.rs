//! Flow identification and the per-bond flow table.
//!
//! A flow is one identified conversation (a 5-tuple hash computed upstream)
//! pinned to a single path so its packets stay ordered. The table is capped
//! at [`MAX_FLOWS`]; overflow evicts the single least-recently-active flow.

use std::collections::HashMap;

/// Maximum tracked flows per bond.
pub const MAX_FLOWS: usize = 65_535;

/// Sentinel for unclassified traffic.
pub const NO_FLOW: i32 = -1;

/// One tracked conversation.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: i32,
    /// Slot index of the path this flow is pinned to.
    pub assigned_path: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_activity: i64,
    pub created_at: i64,
}

impl Flow {
    pub fn new(id: i32, now: i64) -> Self {
        Self {
            id,
            assigned_path: 0,
            bytes_in: 0,
            bytes_out: 0,
            last_activity: now,
            created_at: now,
        }
    }

    pub fn assign(&mut self, slot_idx: usize, now: i64) {
        self.assigned_path = slot_idx;
        self.last_activity = now;
    }

    /// Time since this flow last carried traffic.
    pub fn age(&self, now: i64) -> i64 {
        now - self.last_activity
    }

    pub fn reset_byte_counts(&mut self) {
        self.bytes_in = 0;
        self.bytes_out = 0;
    }
}

/// Flow-id keyed table with LRU-by-activity eviction.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<i32, Flow>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.flows.len() >= MAX_FLOWS
    }

    pub fn contains(&self, flow_id: i32) -> bool {
        self.flows.contains_key(&flow_id)
    }

    pub fn get(&self, flow_id: i32) -> Option<&Flow> {
        self.flows.get(&flow_id)
    }

    pub fn get_mut(&mut self, flow_id: i32) -> Option<&mut Flow> {
        self.flows.get_mut(&flow_id)
    }

    pub fn insert(&mut self, flow: Flow) {
        self.flows.insert(flow.id, flow);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Flow> {
        self.flows.values_mut()
    }

    /// Remove the single oldest flow by last activity. Returns the removed
    /// flow so the caller can release its slot accounting.
    pub fn evict_oldest(&mut self, now: i64) -> Option<Flow> {
        let oldest = self
            .flows
            .values()
            .max_by_key(|f| f.age(now))
            .map(|f| f.id)?;
        self.flows.remove(&oldest)
    }

    /// Remove every flow idle for longer than `max_age`. Returns the removed
    /// flows for slot accounting.
    pub fn evict_idle(&mut self, max_age: i64, now: i64) -> Vec<Flow> {
        let expired: Vec<i32> = self
            .flows
            .values()
            .filter(|f| f.age(now) > max_age)
            .map(|f| f.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.flows.remove(&id))
            .collect()
    }

    pub fn reset_byte_counts(&mut self) {
        for flow in self.flows.values_mut() {
            flow.reset_byte_counts();
        }
    }
}
