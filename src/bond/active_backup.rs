//! Active-backup link selection and failover.
//!
//! One slot carries all traffic; the rest wait in a failover queue ordered
//! by failover score. The queue is rebuilt every background tick, either
//! from the user's explicit failover instructions or from measured
//! performance, and the configured link-select method decides when the
//! active slot is allowed to change.

use tracing::{debug, info, warn};

use super::{
    Bond, LinkSelectMethod, PathsState, Policy, AB_OPTIMIZE_MIN_THRESHOLD, HANDICAP_NEGOTIATED,
    HANDICAP_PREFERRED, HANDICAP_PRIMARY, OPTIMIZE_INTERVAL,
};
use crate::path::MAX_PATHS;

/// Score penalty a failover target inherits from the link it backs up.
const FAILOVER_TARGET_DEDUCTION: i32 = 10;

impl Bond {
    pub(crate) fn process_active_backup_tasks(&self, st: &mut PathsState, now: i64) {
        let previous = st.ab_path_idx;

        if st.ab_path_idx.is_none() {
            st.ab_path_idx = self.select_initial_active_path(st);
            if let Some(idx) = st.ab_path_idx {
                info!(
                    peer = self.peer.address,
                    ifname = %st.slots[idx].ifname,
                    "selected initial active link"
                );
            }
        }
        let Some(mut current) = st.ab_path_idx else {
            return;
        };

        // Drop candidates that lost eligibility.
        let slots = &st.slots;
        st.ab_failover_queue
            .retain(|&i| slots[i].is_occupied() && slots[i].eligible);

        if self.user_flags.specified_failover {
            self.rebuild_failover_queue_user(st, current);
        } else {
            self.rebuild_failover_queue_auto(st, current);
        }

        // Best candidate first; slot index is the deterministic tie-break.
        let mut ordered: Vec<usize> = st.ab_failover_queue.iter().copied().collect();
        ordered.sort_by(|&a, &b| {
            st.slots[b]
                .failover_score
                .cmp(&st.slots[a].failover_score)
                .then(a.cmp(&b))
        });
        st.ab_failover_queue = ordered.into();

        if st.ab_failover_queue.is_empty() {
            debug!(peer = self.peer.address, "failover queue is empty, not fault-tolerant");
            return;
        }

        // Failure reselection applies under every link-select method.
        if !st.slots[current].eligible {
            warn!(
                peer = self.peer.address,
                ifname = %st.slots[current].ifname,
                "active link failed, selecting from failover queue"
            );
            self.dequeue_next_active_path(st, now);
        }
        if st.ab_path_idx != previous {
            st.last_ab_change = now;
        }
        current = match st.ab_path_idx {
            Some(idx) => idx,
            None => return,
        };

        match st.ab_select {
            LinkSelectMethod::Failure => {}
            LinkSelectMethod::Always => {
                if let Some(&head) = st.ab_failover_queue.front() {
                    if !st.slots[current].is_primary() && st.slots[head].is_primary() {
                        self.dequeue_next_active_path(st, now);
                        if let Some(idx) = st.ab_path_idx {
                            info!(
                                peer = self.peer.address,
                                ifname = %st.slots[idx].ifname,
                                "switched back to primary link (select: always)"
                            );
                        }
                    }
                }
            }
            LinkSelectMethod::Better => {
                if let Some(&head) = st.ab_failover_queue.front() {
                    if !st.slots[current].is_primary()
                        && st.slots[head].is_primary()
                        && st.slots[head].failover_score > st.slots[current].failover_score
                    {
                        self.dequeue_next_active_path(st, now);
                        if let Some(idx) = st.ab_path_idx {
                            info!(
                                peer = self.peer.address,
                                ifname = %st.slots[idx].ifname,
                                "switched back to better primary link (select: better)"
                            );
                        }
                    }
                }
            }
            LinkSelectMethod::Optimize => {
                let Some(&head) = st.ab_failover_queue.front() else {
                    return;
                };
                if st.slots[head].negotiated {
                    self.dequeue_next_active_path(st, now);
                    st.last_negotiation_check = now;
                    if let Some(idx) = st.ab_path_idx {
                        info!(
                            peer = self.peer.address,
                            ifname = %st.slots[idx].ifname,
                            "switched to negotiated link (select: optimize)"
                        );
                    }
                } else if (now - st.last_ab_change) > OPTIMIZE_INTERVAL {
                    // Reselect only past a hysteresis threshold, to prevent
                    // flapping between near-equal links.
                    let gain = st.slots[head].failover_score - st.slots[current].failover_score;
                    let threshold =
                        (AB_OPTIMIZE_MIN_THRESHOLD * st.slots[current].allocation as f32) as i32;
                    if gain > 0 && gain > threshold {
                        self.dequeue_next_active_path(st, now);
                        if let Some(idx) = st.ab_path_idx {
                            info!(
                                peer = self.peer.address,
                                ifname = %st.slots[idx].ifname,
                                score_gain = gain,
                                "switched to better link (select: optimize)"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Pick the first active slot. Primary designations win when the user
    /// declared any, with preferred paths ahead of non-preferred ones.
    fn select_initial_active_path(&self, st: &PathsState) -> Option<usize> {
        if !self.user_flags.specified_links {
            return (0..MAX_PATHS).find(|&i| st.slots[i].is_occupied() && st.slots[i].eligible);
        }
        if self.user_flags.specified_primary {
            let mut non_preferred = None;
            for i in 0..MAX_PATHS {
                let slot = &st.slots[i];
                if !slot.is_occupied() || !slot.eligible || !slot.is_primary() {
                    continue;
                }
                if slot.preferred() {
                    return Some(i);
                }
                if non_preferred.is_none() {
                    non_preferred = Some(i);
                }
            }
            if non_preferred.is_none() {
                debug!(
                    peer = self.peer.address,
                    "user-designated primary link is not yet ready"
                );
            }
            return non_preferred;
        }
        (0..MAX_PATHS).find(|&i| st.slots[i].is_occupied() && st.slots[i].eligible)
    }

    /// Queue rebuild from measured performance: score = allocation plus a
    /// single designation handicap, negotiated links dominating.
    fn rebuild_failover_queue_auto(&self, st: &mut PathsState, current: usize) {
        let negotiated_idx = st.negotiated_path_idx;
        let ab_select = st.ab_select;
        for i in 0..MAX_PATHS {
            if !st.slots[i].is_occupied() || !st.slots[i].allowed() || !st.slots[i].eligible {
                continue;
            }
            let mut handicap = 0i32;
            if st.slots[i].preferred() {
                handicap = HANDICAP_PREFERRED;
            }
            // Under optimize, user link designations are ignored in favor of
            // measured quality.
            if st.slots[i].is_primary() && ab_select != LinkSelectMethod::Optimize {
                handicap = HANDICAP_PRIMARY;
            }
            let negotiated = negotiated_idx == Some(i);
            if negotiated {
                handicap = HANDICAP_NEGOTIATED;
            }
            st.slots[i].negotiated = negotiated;
            st.slots[i].failover_score = st.slots[i].allocation as i32 + handicap;
            st.slots[i].bonded = true;
            if i != current && !st.ab_failover_queue.contains(&i) {
                st.ab_failover_queue.push_front(i);
                debug!(
                    peer = self.peer.address,
                    ifname = %st.slots[i].ifname,
                    queued = st.ab_failover_queue.len(),
                    "added link to failover queue"
                );
            }
        }
    }

    /// Queue rebuild from explicit user failover instructions, propagating
    /// scores onto each link's declared failover target.
    fn rebuild_failover_queue_user(&self, st: &mut PathsState, current: usize) {
        for slot in st.slots.iter_mut() {
            if slot.is_occupied() {
                slot.failover_score = 0;
            }
        }
        for i in 0..MAX_PATHS {
            if !st.slots[i].is_occupied() || !st.slots[i].allowed() || !st.slots[i].eligible {
                continue;
            }
            let mut handicap = st.slots[i].failover_score;
            if st.slots[i].preferred() {
                handicap += HANDICAP_PREFERRED;
            }
            if st.slots[i].is_primary() {
                handicap += HANDICAP_PRIMARY;
            }
            if st.slots[i].failover_score == 0 {
                st.slots[i].failover_score = if handicap != 0 {
                    handicap
                } else {
                    st.slots[i].allocation as i32
                };
            }

            let failover_target = self
                .links
                .link_by_name(&self.policy_alias, &st.slots[i].ifname)
                .and_then(|l| l.failover_to().map(str::to_string));
            if let Some(target) = failover_target {
                for j in 0..MAX_PATHS {
                    if j == i || !st.slots[j].is_occupied() || st.slots[j].ifname != target {
                        continue;
                    }
                    let inherited = handicap - FAILOVER_TARGET_DEDUCTION;
                    let mut score = st.slots[j].failover_score.max(inherited);
                    if !st.slots[j].preferred() {
                        score -= 1;
                    }
                    st.slots[j].failover_score = score;
                }
            }

            st.slots[i].bonded = true;
            if i != current && !st.ab_failover_queue.contains(&i) {
                st.ab_failover_queue.push_front(i);
            }
        }
    }

    /// Promote the queue head to active. All packet counters restart so the
    /// next negotiation window measures the new link from scratch.
    pub(crate) fn dequeue_next_active_path(&self, st: &mut PathsState, now: i64) {
        let Some(next) = st.ab_failover_queue.pop_front() else {
            return;
        };
        st.ab_path_idx = Some(next);
        st.last_ab_change = now;
        for slot in st.slots.iter_mut() {
            if slot.is_occupied() {
                slot.reset_packet_counts();
            }
        }
    }

    /// Manually rotate to the next failover candidate. Returns whether a
    /// rotation happened.
    pub fn rotate_active_link(&self, now: i64) -> bool {
        if self.policy != Policy::ActiveBackup {
            return false;
        }
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        if st.ab_failover_queue.is_empty() {
            return false;
        }
        let previous = st.ab_path_idx;
        self.dequeue_next_active_path(st, now);
        if st.ab_path_idx != previous {
            if let Some(idx) = st.ab_path_idx {
                info!(
                    peer = self.peer.address,
                    ifname = %st.slots[idx].ifname,
                    "forcibly rotated active link"
                );
            }
            true
        } else {
            false
        }
    }
}
