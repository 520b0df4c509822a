//! TOML configuration surface for the bonding registries.
//!
//! The enclosing node loads one of these files at boot and applies it to a
//! [`BondManager`] before any traffic is handled:
//!
//! ```toml
//! default_policy = "balance-aware"
//!
//! [policies.wan-bond]
//! policy = "active-backup"
//! failover_interval_ms = 2000
//! link_select_method = "optimize"
//! quality_weights = [0.3, 0.1, 0.3, 0.1, 0.1, 0.1]
//!
//! [[policies.wan-bond.links]]
//! ifname = "eth0"
//! mode = "primary"
//! speed = 1000000000
//!
//! [[policies.wan-bond.links]]
//! ifname = "wlan0"
//! failover_to = "eth0"
//!
//! [peers]
//! "a1b2c3d4e5" = "wan-bond"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bond::{
    BondParams, LinkSelectMethod, Policy, FAILOVER_DEFAULT_INTERVAL, QUALITY_WEIGHT_COUNT,
};
use crate::link::{IpvPreference, Link, LinkMode};
use crate::registry::BondManager;

/// Root of the bonding configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BondingConfig {
    /// Base policy name or template alias applied to unassigned peers.
    pub default_policy: Option<String>,
    /// Named policy templates.
    pub policies: BTreeMap<String, PolicyConfig>,
    /// Peer overlay addresses (hex) to policy alias.
    pub peers: BTreeMap<String, String>,
}

/// One named policy template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub policy: Policy,
    #[serde(default = "default_failover_interval")]
    pub failover_interval_ms: i64,
    #[serde(default)]
    pub up_delay_ms: i64,
    #[serde(default)]
    pub down_delay_ms: i64,
    #[serde(default)]
    pub link_select_method: LinkSelectMethod,
    /// Six weights summing to 1.0: latency, throughput, jitter, loss,
    /// error, capacity. Invalid vectors are ignored.
    #[serde(default)]
    pub quality_weights: Option<Vec<f32>>,
    #[serde(default)]
    pub packets_per_link: Option<u32>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

fn default_failover_interval() -> i64 {
    FAILOVER_DEFAULT_INTERVAL
}

/// One link definition inside a policy template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub ifname: String,
    #[serde(default = "default_link_mode")]
    pub mode: LinkMode,
    #[serde(default)]
    pub ipv_pref: IpvPreference,
    #[serde(default)]
    pub failover_to: Option<String>,
    /// Declared speed in bits/s, 0 = unknown.
    #[serde(default)]
    pub speed: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_link_mode() -> LinkMode {
    LinkMode::Spare
}

fn default_true() -> bool {
    true
}

/// Load a configuration file; a missing file yields the defaults.
pub fn load(path: &Path) -> Result<BondingConfig> {
    if !path.exists() {
        return Ok(BondingConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: BondingConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

/// Write a configuration file.
pub fn save(path: &Path, cfg: &BondingConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!("config already exists at {}", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

/// Populate a manager's registries from a parsed configuration.
pub fn apply(cfg: &BondingConfig, manager: &BondManager) -> Result<()> {
    for (alias, policy_cfg) in &cfg.policies {
        let mut params = BondParams::new(policy_cfg.policy);
        params.set_failover_interval(policy_cfg.failover_interval_ms);
        params.up_delay = policy_cfg.up_delay_ms;
        params.down_delay = policy_cfg.down_delay_ms;
        params.link_select_method = policy_cfg.link_select_method;
        if let Some(packets_per_link) = policy_cfg.packets_per_link {
            params.packets_per_link = packets_per_link;
        }
        if let Some(weights) = &policy_cfg.quality_weights {
            if weights.len() == QUALITY_WEIGHT_COUNT {
                let mut array = [0f32; QUALITY_WEIGHT_COUNT];
                array.copy_from_slice(weights);
                if !params.set_quality_weights(array) {
                    warn!(alias = %alias, "quality weights do not sum to 1.0, keeping defaults");
                }
            } else {
                warn!(
                    alias = %alias,
                    count = weights.len(),
                    "expected {QUALITY_WEIGHT_COUNT} quality weights, keeping defaults"
                );
            }
        }
        if !manager.register_policy(alias, params) {
            warn!(alias = %alias, "policy alias already registered, skipping");
            continue;
        }
        for link_cfg in &policy_cfg.links {
            manager.add_link(
                alias,
                Link::new(
                    &link_cfg.ifname,
                    link_cfg.mode,
                    link_cfg.ipv_pref,
                    link_cfg.failover_to.clone(),
                    link_cfg.speed,
                    link_cfg.enabled,
                ),
            );
        }
    }

    for (peer_hex, alias) in &cfg.peers {
        let peer = u64::from_str_radix(peer_hex, 16)
            .with_context(|| format!("invalid peer address: {peer_hex}"))?;
        if !manager.assign_policy(peer, alias) {
            warn!(peer = %peer_hex, "peer already has a policy assignment, skipping");
        }
    }

    if let Some(default) = &cfg.default_policy {
        if let Some(policy) = Policy::from_name(default) {
            manager.set_default_policy(policy);
        } else if !manager.set_default_policy_alias(default) {
            anyhow::bail!("unknown default policy or template alias: {default}");
        }
    }
    Ok(())
}
