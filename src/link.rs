//! Logical links and the process-wide link registry.
//!
//! A link is a local network interface as the bonding layer sees it: a name
//! plus the user's declared preferences for it (primary/spare role, IP
//! version preference, failover target, speed). One link may host several
//! paths at once, e.g. an IPv4 and an IPv6 path over the same interface.
//!
//! Links are defined per policy alias. Interfaces that show up in traffic
//! without a user definition are registered on the fly as spare links so
//! that every path can always be attributed to a link.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::path::LocalSocket;
use crate::runtime::Transport;

/// Longest interface name carried by the wire/OS boundary.
pub const IFNAME_MAX_LEN: usize = 32;

/// Role a link plays inside a bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    Primary,
    Spare,
}

/// User preference for which IP family a link should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpvPreference {
    #[default]
    Any,
    V4,
    V6,
    PreferV4,
    PreferV6,
}

impl IpvPreference {
    /// Whether a path of the given family may be used at all.
    pub fn allows(self, is_v6: bool) -> bool {
        match self {
            IpvPreference::Any | IpvPreference::PreferV4 | IpvPreference::PreferV6 => true,
            IpvPreference::V4 => !is_v6,
            IpvPreference::V6 => is_v6,
        }
    }

    /// Whether a path of the given family is the first choice on this link.
    pub fn prefers(self, is_v6: bool) -> bool {
        match self {
            IpvPreference::Any => false,
            IpvPreference::V4 | IpvPreference::PreferV4 => !is_v6,
            IpvPreference::V6 | IpvPreference::PreferV6 => is_v6,
        }
    }
}

/// A logical local interface participating in a bonding policy.
#[derive(Debug)]
pub struct Link {
    ifname: String,
    mode: LinkMode,
    ipv_pref: IpvPreference,
    failover_to: Option<String>,
    /// User-declared speed in bits/s, 0 = unknown.
    speed: u64,
    enabled: bool,
    user_specified: bool,
    /// Speed relative to the other links of the alias, 0-255. Written by the
    /// quality estimator while the link is shared behind an `Arc`.
    relative_speed: AtomicU8,
}

impl Link {
    pub fn new(
        ifname: impl Into<String>,
        mode: LinkMode,
        ipv_pref: IpvPreference,
        failover_to: Option<String>,
        speed: u64,
        enabled: bool,
    ) -> Self {
        Self {
            ifname: ifname.into(),
            mode,
            ipv_pref,
            failover_to,
            speed,
            enabled,
            user_specified: false,
            relative_speed: AtomicU8::new(0),
        }
    }

    /// A link learned from traffic rather than configuration.
    pub fn spare(ifname: impl Into<String>) -> Self {
        Self::new(ifname, LinkMode::Spare, IpvPreference::Any, None, 0, true)
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_primary(&self) -> bool {
        self.mode == LinkMode::Primary
    }

    pub fn ipv_pref(&self) -> IpvPreference {
        self.ipv_pref
    }

    pub fn failover_to(&self) -> Option<&str> {
        self.failover_to.as_deref()
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_user_specified(&self) -> bool {
        self.user_specified
    }

    pub fn set_user_specified(&mut self, user_specified: bool) {
        self.user_specified = user_specified;
    }

    pub fn relative_speed(&self) -> u8 {
        self.relative_speed.load(Ordering::Relaxed)
    }

    pub fn set_relative_speed(&self, relative: u8) {
        self.relative_speed.store(relative, Ordering::Relaxed);
    }
}

/// Aggregate facts about the user's link definitions for one policy alias.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserLinkFlags {
    pub specified_links: bool,
    pub specified_primary: bool,
    pub specified_failover: bool,
    pub specified_speeds: bool,
}

#[derive(Default)]
struct AliasLinks {
    /// Ordered user definitions; an empty list allows every interface.
    definitions: Vec<Arc<Link>>,
    by_iface: HashMap<String, Arc<Link>>,
}

/// Process-wide mapping of interface name to link descriptor per policy
/// alias.
#[derive(Default)]
pub struct LinkRegistry {
    aliases: Mutex<HashMap<String, AliasLinks>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user-defined link for a policy alias.
    pub fn add_link(&self, policy_alias: &str, mut link: Link) {
        link.set_user_specified(true);
        let link = Arc::new(link);
        let mut aliases = self.aliases.lock().unwrap();
        let entry = aliases.entry(policy_alias.to_string()).or_default();
        entry.definitions.push(Arc::clone(&link));
        entry
            .by_iface
            .entry(link.ifname().to_string())
            .or_insert(link);
    }

    /// Whether a policy alias permits paths on the named interface. An alias
    /// without link definitions permits everything.
    pub fn link_allowed(&self, policy_alias: &str, ifname: &str) -> bool {
        let aliases = self.aliases.lock().unwrap();
        match aliases.get(policy_alias) {
            None => true,
            Some(entry) => {
                entry.definitions.is_empty()
                    || entry.definitions.iter().any(|l| l.ifname() == ifname)
            }
        }
    }

    /// Resolve the link behind a local socket, registering a spare link for
    /// interfaces that have no user definition yet.
    pub fn link_for_socket(
        &self,
        policy_alias: &str,
        transport: &dyn Transport,
        local_socket: LocalSocket,
    ) -> Arc<Link> {
        let mut ifname = transport
            .interface_name(local_socket)
            .unwrap_or_default();
        truncate_ifname(&mut ifname);
        let mut aliases = self.aliases.lock().unwrap();
        let entry = aliases.entry(policy_alias.to_string()).or_default();
        Arc::clone(
            entry
                .by_iface
                .entry(ifname.clone())
                .or_insert_with(|| Arc::new(Link::spare(ifname))),
        )
    }

    /// Look up a link of a policy alias by interface name.
    pub fn link_by_name(&self, policy_alias: &str, ifname: &str) -> Option<Arc<Link>> {
        let aliases = self.aliases.lock().unwrap();
        aliases
            .get(policy_alias)?
            .by_iface
            .get(ifname)
            .map(Arc::clone)
    }

    /// What the user's definitions imply for a bond using this alias.
    pub fn user_flags(&self, policy_alias: &str) -> UserLinkFlags {
        let aliases = self.aliases.lock().unwrap();
        let mut flags = UserLinkFlags::default();
        if let Some(entry) = aliases.get(policy_alias) {
            for link in entry.by_iface.values() {
                if !link.is_user_specified() {
                    continue;
                }
                flags.specified_links = true;
                if link.is_primary() {
                    flags.specified_primary = true;
                }
                if link.failover_to().is_some() {
                    flags.specified_failover = true;
                }
                if link.speed() > 0 {
                    flags.specified_speeds = true;
                }
            }
        }
        flags
    }
}

fn truncate_ifname(name: &mut String) {
    if name.len() > IFNAME_MAX_LEN {
        let mut end = IFNAME_MAX_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Verb;
    use std::net::SocketAddr;

    struct NamedTransport(&'static str);

    impl Transport for NamedTransport {
        fn put_packet(
            &self,
            _peer: u64,
            _local_socket: LocalSocket,
            _addr: SocketAddr,
            _verb: Verb,
            _payload: &[u8],
        ) {
        }

        fn interface_name(&self, _local_socket: LocalSocket) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[test]
    fn test_ipv_preference_rules() {
        assert!(IpvPreference::Any.allows(true));
        assert!(IpvPreference::Any.allows(false));
        assert!(!IpvPreference::Any.prefers(false));

        assert!(IpvPreference::V4.allows(false));
        assert!(!IpvPreference::V4.allows(true));

        assert!(IpvPreference::PreferV6.allows(false));
        assert!(IpvPreference::PreferV6.prefers(true));
        assert!(!IpvPreference::PreferV6.prefers(false));
    }

    #[test]
    fn test_empty_alias_allows_everything() {
        let registry = LinkRegistry::new();
        assert!(registry.link_allowed("default", "eth0"));
    }

    #[test]
    fn test_definitions_restrict_interfaces() {
        let registry = LinkRegistry::new();
        registry.add_link(
            "plan",
            Link::new("eth0", LinkMode::Primary, IpvPreference::Any, None, 0, true),
        );
        assert!(registry.link_allowed("plan", "eth0"));
        assert!(!registry.link_allowed("plan", "wlan0"));
    }

    #[test]
    fn test_link_for_socket_registers_spare() {
        let registry = LinkRegistry::new();
        let transport = NamedTransport("wlan0");
        let link = registry.link_for_socket("plan", &transport, 7);
        assert_eq!(link.ifname(), "wlan0");
        assert_eq!(link.mode(), LinkMode::Spare);
        assert!(!link.is_user_specified());

        // Resolving again yields the same descriptor.
        let again = registry.link_for_socket("plan", &transport, 7);
        assert!(Arc::ptr_eq(&link, &again));
        // A learned spare never counts as user-specified.
        assert!(!registry.user_flags("plan").specified_links);
    }

    #[test]
    fn test_user_flags() {
        let registry = LinkRegistry::new();
        registry.add_link(
            "plan",
            Link::new(
                "eth0",
                LinkMode::Primary,
                IpvPreference::Any,
                Some("wlan0".to_string()),
                1_000_000_000,
                true,
            ),
        );
        let flags = registry.user_flags("plan");
        assert!(flags.specified_links);
        assert!(flags.specified_primary);
        assert!(flags.specified_failover);
        assert!(flags.specified_speeds);
    }

    #[test]
    fn test_ifname_truncation() {
        let mut name = "a".repeat(40);
        truncate_ifname(&mut name);
        assert_eq!(name.len(), IFNAME_MAX_LEN);
    }
}
