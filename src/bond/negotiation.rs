//! Peer-to-peer path negotiation.
//!
//! Two peers can end up sending to each other over different links, each
//! convinced its own choice is best. Every optimization interval the bond
//! compares where most traffic goes out against where most comes in; when
//! they disagree it computes a utility (how much it would lose by moving to
//! the peer's link) and petitions the peer with it. The peer with less to
//! lose yields, and ties break on numeric node address.

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    Bond, LinkSelectMethod, PathsState, Policy, HANDICAP_NEGOTIATED, OPTIMIZE_INTERVAL,
    PATH_NEGOTIATION_CUTOFF_TIME, PATH_NEGOTIATION_TRY_COUNT,
};
use crate::path::Path;
use crate::proto::{self, Verb};

impl Bond {
    /// Compare dominant ingress and egress paths and, when they disagree,
    /// petition the peer to converge on ours (or concede to theirs).
    pub(crate) fn negotiation_check(&self, st: &mut PathsState, now: i64) {
        let mut max_in: Option<(usize, u64)> = None;
        let mut max_out: Option<(usize, u64)> = None;
        for (i, slot) in st.slots.iter_mut().enumerate() {
            if !slot.is_occupied() {
                continue;
            }
            if slot.packets_in > max_in.map_or(0, |(_, count)| count) {
                max_in = Some((i, slot.packets_in));
            }
            if slot.packets_out > max_out.map_or(0, |(_, count)| count) {
                max_out = Some((i, slot.packets_out));
            }
            slot.reset_packet_counts();
        }
        let (Some((in_idx, _)), Some((out_idx, _))) = (max_in, max_out) else {
            return;
        };
        if in_idx == out_idx {
            // Peers agree; nothing to argue about.
            return;
        }

        let mut utility = st.slots[out_idx].failover_score - st.slots[in_idx].failover_score;
        if st.slots[out_idx].negotiated {
            utility -= HANDICAP_NEGOTIATED;
        }
        st.local_utility = utility;

        if (now - st.last_negotiation_request_at) > PATH_NEGOTIATION_CUTOFF_TIME {
            st.sent_negotiation_requests = 0;
        }
        if st.sent_negotiation_requests < PATH_NEGOTIATION_TRY_COUNT {
            if utility >= 0 {
                self.send_negotiation_request(st, out_idx, now);
            }
        } else if (now - st.last_negotiation_request_at) > 2 * OPTIMIZE_INTERVAL && utility == 0 {
            // Nothing to lose locally: concede to the peer's preference.
            debug!(
                peer = self.peer.address,
                "negotiation exhausted with zero utility, adopting the peer's path"
            );
            st.negotiated_path_idx = Some(in_idx);
        }
    }

    fn send_negotiation_request(&self, st: &mut PathsState, slot_idx: usize, now: i64) {
        let Some(path) = st.slots[slot_idx].path.clone() else {
            return;
        };
        let utility = st.local_utility.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        info!(
            peer = self.peer.address,
            ifname = %st.slots[slot_idx].ifname,
            utility,
            "sending path negotiation request"
        );
        let payload = proto::encode_utility(utility);
        self.transport.put_packet(
            self.peer.address,
            path.local_socket,
            path.addr,
            Verb::PathNegotiationRequest,
            &payload,
        );
        st.overhead_bytes += payload.len() as u64;
        st.sent_negotiation_requests += 1;
        st.last_negotiation_request_at = now;
        st.slots[slot_idx].last_out = now;
    }

    /// Handle a peer's petition to move traffic onto the path it arrived on.
    /// The stronger utility wins; on a tie the numerically larger node
    /// address yields.
    pub fn process_incoming_path_negotiation_request(&self, path: &Arc<Path>, remote_utility: i16) {
        if self.policy != Policy::ActiveBackup {
            return;
        }
        let mut guard = self.paths.lock().unwrap();
        let st = &mut *guard;
        if st.ab_select != LinkSelectMethod::Optimize {
            return;
        }
        let Some(idx) = st.slot_idx_of(path) else {
            // Petitions on unknown paths are dropped.
            return;
        };
        if st.last_negotiation_check == 0 {
            // We have not formed an opinion yet.
            return;
        }
        let remote = remote_utility as i32;
        if remote > st.local_utility {
            info!(
                peer = self.peer.address,
                ifname = %st.slots[idx].ifname,
                remote_utility,
                local_utility = st.local_utility,
                "peer's utility is greater, switching to suggested link"
            );
            st.negotiated_path_idx = Some(idx);
        } else if remote < st.local_utility {
            debug!(
                peer = self.peer.address,
                ifname = %st.slots[idx].ifname,
                remote_utility,
                local_utility = st.local_utility,
                "peer's utility is lower, ignoring petition"
            );
        } else if self.local_address > self.peer.address {
            info!(
                peer = self.peer.address,
                ifname = %st.slots[idx].ifname,
                "utilities equal, yielding to peer as the larger address"
            );
            st.negotiated_path_idx = Some(idx);
        } else {
            debug!(
                peer = self.peer.address,
                ifname = %st.slots[idx].ifname,
                "utilities equal, keeping local choice"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{BondParams, Policy};
    use super::*;
    use crate::flow::NO_FLOW;

    fn negotiating_bond() -> (TestHarness, Arc<Path>, Arc<Path>) {
        let h = harness(BondParams::new(Policy::ActiveBackup));
        let a = path(0);
        let b = path(1);
        h.bond.nominate(Arc::clone(&a), 0);
        h.bond.nominate(Arc::clone(&b), 0);
        (h, a, b)
    }

    /// Drive asymmetric traffic (out on `out`, in on `in_`) and step the
    /// background timer past the first negotiation check.
    fn asymmetric_warmup(h: &TestHarness, out: &Arc<Path>, in_: &Arc<Path>) {
        let mut t = 1_000;
        let mut id = 1u64;
        while t <= 16_000 {
            h.bond
                .record_incoming_packet(in_, id, 64, Verb::Frame, NO_FLOW, t);
            h.bond
                .record_incoming_packet(out, id + 1, 64, Verb::Frame, NO_FLOW, t);
            h.bond
                .record_outgoing_packet(out, id + 2, 64, Verb::Frame, NO_FLOW, t);
            h.bond
                .record_outgoing_packet(out, id + 3, 64, Verb::Frame, NO_FLOW, t);
            h.bond.process_background_tasks(t);
            id += 4;
            t += 1_000;
        }
    }

    #[test]
    fn test_disagreement_sends_petition() {
        let (h, a, b) = negotiating_bond();
        // Most traffic out on b, most in on a.
        asymmetric_warmup(&h, &b, &a);
        let sent = h.transport.sent.lock().unwrap();
        let petitions: Vec<_> = sent
            .iter()
            .filter(|(_, verb, _)| *verb == Verb::PathNegotiationRequest)
            .collect();
        assert!(!petitions.is_empty());
        // Petitions travel on the dominant egress path.
        assert!(petitions.iter().all(|(addr, _, _)| *addr == b.addr));
    }

    #[test]
    fn test_agreement_sends_nothing() {
        let (h, a, _b) = negotiating_bond();
        // All traffic in and out on the same path.
        asymmetric_warmup(&h, &a, &a);
        let sent = h.transport.sent.lock().unwrap();
        assert!(!sent
            .iter()
            .any(|(_, verb, _)| *verb == Verb::PathNegotiationRequest));
    }

    #[test]
    fn test_stronger_remote_utility_wins() {
        let (h, a, b) = negotiating_bond();
        asymmetric_warmup(&h, &b, &a);
        h.bond.process_incoming_path_negotiation_request(&a, 1_000);
        assert_eq!(h.bond.status().negotiated_path, Some(a.addr));
    }

    #[test]
    fn test_weaker_remote_utility_ignored() {
        let (h, a, b) = negotiating_bond();
        asymmetric_warmup(&h, &b, &a);
        h.bond.process_incoming_path_negotiation_request(&a, -5_000);
        assert_eq!(h.bond.status().negotiated_path, None);
    }

    #[test]
    fn test_unknown_path_petition_dropped() {
        let (h, a, b) = negotiating_bond();
        asymmetric_warmup(&h, &b, &a);
        let stranger = path(9);
        h.bond
            .process_incoming_path_negotiation_request(&stranger, 1_000);
        assert_eq!(h.bond.status().negotiated_path, None);
    }

    #[test]
    fn test_tie_break_larger_address_yields() {
        // Peer X (small address) talking to peer Y (large address): on equal
        // utilities only the larger endpoint adopts the suggestion.
        let small = 0x01;
        let large = 0xff_ffff_ffff;

        // Bond at the larger node, peer is the smaller node.
        let h_large = harness_with(BondParams::new(Policy::ActiveBackup), small, large, 0);
        let a1 = path(0);
        let b1 = path(1);
        h_large.bond.nominate(Arc::clone(&a1), 0);
        h_large.bond.nominate(Arc::clone(&b1), 0);
        // Warm up with symmetric traffic so local utility stays zero but the
        // negotiation check has run.
        asymmetric_warmup(&h_large, &a1, &a1);
        h_large
            .bond
            .process_incoming_path_negotiation_request(&b1, 0);
        assert_eq!(h_large.bond.status().negotiated_path, Some(b1.addr));

        // Bond at the smaller node, peer is the larger node.
        let h_small = harness_with(BondParams::new(Policy::ActiveBackup), large, small, 0);
        let a2 = path(0);
        let b2 = path(1);
        h_small.bond.nominate(Arc::clone(&a2), 0);
        h_small.bond.nominate(Arc::clone(&b2), 0);
        asymmetric_warmup(&h_small, &a2, &a2);
        h_small
            .bond
            .process_incoming_path_negotiation_request(&b2, 0);
        assert_eq!(h_small.bond.status().negotiated_path, None);
    }

    #[test]
    fn test_petition_budget_is_bounded_per_window() {
        let (h, a, b) = negotiating_bond();
        // Long-running asymmetry, many negotiation checks.
        let mut t = 1_000;
        let mut id = 1u64;
        while t <= 50_000 {
            h.bond
                .record_incoming_packet(&a, id, 64, Verb::Frame, NO_FLOW, t);
            h.bond
                .record_incoming_packet(&b, id + 1, 64, Verb::Frame, NO_FLOW, t);
            h.bond
                .record_outgoing_packet(&b, id + 2, 64, Verb::Frame, NO_FLOW, t);
            h.bond
                .record_outgoing_packet(&b, id + 3, 64, Verb::Frame, NO_FLOW, t);
            h.bond.process_background_tasks(t);
            id += 4;
            t += 1_000;
        }
        let sent = h.transport.sent.lock().unwrap();
        let petitions = sent
            .iter()
            .filter(|(_, verb, _)| *verb == Verb::PathNegotiationRequest)
            .count();
        assert!(petitions as u32 <= super::PATH_NEGOTIATION_TRY_COUNT);
    }
}
