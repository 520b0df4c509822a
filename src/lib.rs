//! Multipath bonding core for a peer-to-peer overlay network.
//!
//! For each remote peer this library aggregates multiple underlying network
//! paths into a single logical link and decides, packet by packet, which
//! path to transmit on, while continuously measuring path quality and
//! reacting to failure.
//!
//! # Architecture
//!
//! - `link`: logical links (local interfaces) and the per-alias registry
//! - `path`: concrete paths and their per-bond slot state
//! - `flow`: flow identification and the capped flow table
//! - `proto`: control verbs and wire payload codecs
//! - `runtime`: traits the enclosing node implements (clock, transport,
//!   entropy) and the peer facts a bond is built from
//! - `bond`: the per-peer engine; five policies (active-backup, broadcast,
//!   balance-rr, balance-xor, balance-aware), curation, quality estimation,
//!   failover, and path negotiation
//! - `registry`: the process-wide `BondManager` owning links, policy
//!   templates, peer assignments, and bonds
//! - `config`: TOML configuration surface populating the registries
//!
//! # Driving the core
//!
//! The node creates a [`BondManager`] at boot, applies configuration, and
//! then wires three call sites:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use pathbond::{BondManager, PeerProfile, Policy};
//! # fn example(
//! #     clock: Arc<dyn pathbond::Clock>,
//! #     transport: Arc<dyn pathbond::Transport>,
//! #     entropy: Arc<dyn pathbond::SecureEntropy>,
//! # ) {
//! let manager = BondManager::new(0x0102030405, clock, transport, entropy);
//! manager.set_default_policy(Policy::BalanceAware);
//!
//! // On first traffic from a peer:
//! let _bond = manager.bond_for_peer(&PeerProfile::new(0xa1b2c3d4e5));
//!
//! // Hot paths call bond.record_incoming_packet / record_outgoing_packet /
//! // appropriate_path; a timer thread calls:
//! manager.process_background_tasks();
//! # }
//! ```

pub mod bond;
pub mod config;
pub mod flow;
pub mod link;
pub mod path;
pub mod proto;
pub mod registry;
pub mod runtime;
pub mod stats;

pub use bond::{Bond, BondParams, BondStatus, LinkSelectMethod, PathStatus, Policy};
pub use config::BondingConfig;
pub use flow::{Flow, NO_FLOW};
pub use link::{IpvPreference, Link, LinkMode};
pub use path::{LocalSocket, Path};
pub use proto::{QosRecord, Verb};
pub use registry::BondManager;
pub use runtime::{Clock, OsEntropy, PeerProfile, SecureEntropy, Transport};
