//! Process-wide bonding registries.
//!
//! `BondManager` owns everything that outlives any single peer: the link
//! definitions, the named policy templates, the peer-to-policy assignments,
//! and the per-peer bonds themselves. Bonds are created lazily when traffic
//! first arrives from a peer and destroyed with the peer.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::bond::{Bond, BondParams, Policy, FAILOVER_DEFAULT_INTERVAL};
use crate::link::{Link, LinkRegistry};
use crate::runtime::{Clock, PeerProfile, SecureEntropy, Transport};

struct RegistryState {
    bonds: HashMap<u64, Arc<Bond>>,
    templates: HashMap<String, BondParams>,
    assignments: HashMap<u64, String>,
    default_policy: Option<Policy>,
    default_alias: Option<String>,
}

/// Owner of the process-wide bonding state.
pub struct BondManager {
    local_address: u64,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    entropy: Arc<dyn SecureEntropy>,
    links: Arc<LinkRegistry>,
    state: Mutex<RegistryState>,
    min_monitor_interval: AtomicI64,
}

impl BondManager {
    pub fn new(
        local_address: u64,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        entropy: Arc<dyn SecureEntropy>,
    ) -> Self {
        Self {
            local_address,
            clock,
            transport,
            entropy,
            links: Arc::new(LinkRegistry::new()),
            state: Mutex::new(RegistryState {
                bonds: HashMap::new(),
                templates: HashMap::new(),
                assignments: HashMap::new(),
                default_policy: None,
                default_alias: None,
            }),
            min_monitor_interval: AtomicI64::new(FAILOVER_DEFAULT_INTERVAL),
        }
    }

    pub fn local_address(&self) -> u64 {
        self.local_address
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.links
    }

    /// Define a link for a policy alias.
    pub fn add_link(&self, policy_alias: &str, link: Link) {
        debug!(alias = policy_alias, ifname = link.ifname(), "registered link");
        self.links.add_link(policy_alias, link);
    }

    /// Register a named policy template. Returns false if the alias is
    /// already taken.
    pub fn register_policy(&self, alias: &str, params: BondParams) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.templates.entry(alias.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                info!(alias, policy = params.policy.name(), "registered policy template");
                v.insert(params);
                true
            }
        }
    }

    /// Assign a peer to a policy alias. Returns false if the peer already
    /// has an assignment.
    pub fn assign_policy(&self, peer_address: u64, alias: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.assignments.entry(peer_address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(alias.to_string());
                true
            }
        }
    }

    /// Set the default policy by base code.
    pub fn set_default_policy(&self, policy: Policy) {
        let mut state = self.state.lock().unwrap();
        state.default_policy = Some(policy);
        state.default_alias = None;
    }

    /// Set the default policy to a registered template alias. Returns false
    /// if no such template exists.
    pub fn set_default_policy_alias(&self, alias: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.templates.contains_key(alias) {
            return false;
        }
        state.default_alias = Some(alias.to_string());
        state.default_policy = None;
        true
    }

    /// Look up the bond for a peer, if one exists.
    pub fn bond(&self, peer_address: u64) -> Option<Arc<Bond>> {
        self.state.lock().unwrap().bonds.get(&peer_address).map(Arc::clone)
    }

    /// Look up or lazily create the bond for a peer. Returns `None` when no
    /// assignment, template, or default policy applies.
    pub fn bond_for_peer(&self, peer: &PeerProfile) -> Option<Arc<Bond>> {
        // Resolve the parameters under the registry lock, then build the
        // bond outside it: the link registry's own lock is taken while
        // deriving the user flags, and the two are never held together.
        let (params, alias) = {
            let state = self.state.lock().unwrap();
            if let Some(existing) = state.bonds.get(&peer.address) {
                return Some(Arc::clone(existing));
            }
            match state.assignments.get(&peer.address) {
                Some(alias) => match state.templates.get(alias) {
                    Some(params) => (params.clone(), alias.clone()),
                    None => {
                        warn!(
                            peer = peer.address,
                            alias = %alias,
                            "assigned policy template not found, falling back to default"
                        );
                        Self::default_params(&state)?
                    }
                },
                None => Self::default_params(&state)?,
            }
        };

        let user_flags = self.links.user_flags(&alias);
        let bond = Arc::new(Bond::new(
            &params,
            alias,
            peer.clone(),
            self.local_address,
            user_flags,
            Arc::clone(&self.links),
            Arc::clone(&self.transport),
            Arc::clone(&self.entropy),
        ));

        let mut state = self.state.lock().unwrap();
        match state.bonds.entry(peer.address) {
            Entry::Occupied(e) => Some(Arc::clone(e.get())),
            Entry::Vacant(v) => {
                info!(
                    peer = peer.address,
                    policy = bond.policy().name(),
                    alias = bond.policy_alias(),
                    "created bond"
                );
                Some(Arc::clone(v.insert(bond)))
            }
        }
    }

    fn default_params(state: &RegistryState) -> Option<(BondParams, String)> {
        if let Some(alias) = &state.default_alias {
            if let Some(params) = state.templates.get(alias) {
                return Some((params.clone(), alias.clone()));
            }
        }
        state
            .default_policy
            .map(|policy| (BondParams::new(policy), policy.name().to_string()))
    }

    /// Drop a peer's bond (the peer is going away).
    pub fn destroy_bond(&self, peer_address: u64) {
        let mut state = self.state.lock().unwrap();
        if state.bonds.remove(&peer_address).is_some() {
            info!(peer = peer_address, "destroyed bond");
        }
    }

    pub fn bond_count(&self) -> usize {
        self.state.lock().unwrap().bonds.len()
    }

    /// Run background work on every bond and refresh the aggregate monitor
    /// interval for the caller's timer.
    pub fn process_background_tasks(&self) {
        let now = self.clock.now();
        let mut min_interval = FAILOVER_DEFAULT_INTERVAL;
        let state = self.state.lock().unwrap();
        for bond in state.bonds.values() {
            min_interval = min_interval.min(bond.monitor_interval());
            bond.process_background_tasks(now);
        }
        drop(state);
        self.min_monitor_interval.store(min_interval, Ordering::Relaxed);
    }

    /// Shortest monitor interval across all live bonds: how often the timer
    /// thread should fire to keep every bond's heartbeats on schedule.
    pub fn min_monitor_interval(&self) -> i64 {
        self.min_monitor_interval.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::LocalSocket;
    use crate::proto::Verb;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicI64 as TestClockCell;

    struct TestClock(TestClockCell);

    impl Clock for TestClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn put_packet(
            &self,
            _peer: u64,
            _local_socket: LocalSocket,
            _addr: SocketAddr,
            _verb: Verb,
            _payload: &[u8],
        ) {
        }

        fn interface_name(&self, local_socket: LocalSocket) -> Option<String> {
            Some(format!("eth{local_socket}"))
        }
    }

    struct ZeroEntropy;

    impl SecureEntropy for ZeroEntropy {
        fn fill(&self, buf: &mut [u8]) {
            buf.fill(0);
        }
    }

    fn manager() -> BondManager {
        BondManager::new(
            0x0102030405,
            Arc::new(TestClock(TestClockCell::new(0))),
            Arc::new(NullTransport),
            Arc::new(ZeroEntropy),
        )
    }

    #[test]
    fn test_no_policy_configured_yields_no_bond() {
        let manager = manager();
        assert!(manager.bond_for_peer(&PeerProfile::new(0xaa)).is_none());
    }

    #[test]
    fn test_default_policy_creates_bond_lazily() {
        let manager = manager();
        manager.set_default_policy(Policy::BalanceXor);
        assert!(manager.bond(0xaa).is_none());

        let bond = manager.bond_for_peer(&PeerProfile::new(0xaa)).unwrap();
        assert_eq!(bond.policy(), Policy::BalanceXor);
        assert_eq!(manager.bond_count(), 1);

        // Same peer resolves to the same bond.
        let again = manager.bond_for_peer(&PeerProfile::new(0xaa)).unwrap();
        assert!(Arc::ptr_eq(&bond, &again));
    }

    #[test]
    fn test_assignment_overrides_default() {
        let manager = manager();
        manager.set_default_policy(Policy::BalanceXor);
        assert!(manager.register_policy("fast", BondParams::new(Policy::ActiveBackup)));
        assert!(manager.assign_policy(0xbb, "fast"));

        let bond = manager.bond_for_peer(&PeerProfile::new(0xbb)).unwrap();
        assert_eq!(bond.policy(), Policy::ActiveBackup);
        assert_eq!(bond.policy_alias(), "fast");
    }

    #[test]
    fn test_missing_template_falls_back_to_default() {
        let manager = manager();
        manager.set_default_policy(Policy::Broadcast);
        assert!(manager.assign_policy(0xcc, "ghost"));
        let bond = manager.bond_for_peer(&PeerProfile::new(0xcc)).unwrap();
        assert_eq!(bond.policy(), Policy::Broadcast);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let manager = manager();
        assert!(manager.register_policy("plan", BondParams::new(Policy::BalanceRr)));
        assert!(!manager.register_policy("plan", BondParams::new(Policy::Broadcast)));
        assert!(manager.assign_policy(0xdd, "plan"));
        assert!(!manager.assign_policy(0xdd, "other"));
    }

    #[test]
    fn test_default_alias_template() {
        let manager = manager();
        let mut params = BondParams::new(Policy::BalanceAware);
        params.set_failover_interval(2_000);
        assert!(manager.register_policy("tuned", params));
        assert!(!manager.set_default_policy_alias("missing"));
        assert!(manager.set_default_policy_alias("tuned"));

        let bond = manager.bond_for_peer(&PeerProfile::new(0xee)).unwrap();
        assert_eq!(bond.policy(), Policy::BalanceAware);
        // failover 2000 / 4 echoes per interval
        assert_eq!(bond.monitor_interval(), 500);
    }

    #[test]
    fn test_destroy_bond() {
        let manager = manager();
        manager.set_default_policy(Policy::BalanceXor);
        manager.bond_for_peer(&PeerProfile::new(0xaa)).unwrap();
        manager.destroy_bond(0xaa);
        assert!(manager.bond(0xaa).is_none());
        assert_eq!(manager.bond_count(), 0);
    }

    #[test]
    fn test_background_sweep_tracks_min_monitor_interval() {
        let manager = manager();
        let mut params = BondParams::new(Policy::BalanceXor);
        params.set_failover_interval(1_000);
        assert!(manager.register_policy("quick", params));
        assert!(manager.assign_policy(0xaa, "quick"));
        manager.bond_for_peer(&PeerProfile::new(0xaa)).unwrap();

        manager.process_background_tasks();
        // failover 1000 -> monitor interval 250.
        assert_eq!(manager.min_monitor_interval(), 250);
    }
}
