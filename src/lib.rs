//! Served-type migration and graceful reparenting for a sharded database
//! cluster.
//!
//! This crate coordinates a topology store and a fleet of tablet agents to
//! perform two multi-step cluster actions:
//! - **Served-type migration**: moving a traffic role (master, replica,
//!   rdonly) from a shard being split to the shards replicating from it,
//!   including a write-preserving master cutover
//! - **Graceful reparent**: replacing the master of a shard with one of its
//!   slaves after checking that no slave is ahead of it
//!
//! # Features
//!
//! - Ordered shard locking with the outcome recorded into each lock
//! - Parallel per-master fan-out with deadlines and error aggregation
//! - Fresh-read-before-mutate shard updates through pure transforms
//! - Operator remediation hints on every failure that needs manual recovery
//!
//! # Example
//!
//! ```rust,ignore
//! use shard_wrangler::{TabletType, Wrangler, WranglerConfig};
//! use std::time::Duration;
//!
//! let config = WranglerConfig::new()
//!     .with_lock_timeout(Duration::from_secs(10))
//!     .with_action_timeout(Duration::from_secs(30));
//! let wrangler = Wrangler::new(config, topo, agents, serving_graph)?;
//!
//! // Move rdonly traffic from ks/0 to the shards split out of it.
//! wrangler.migrate_served_types("ks", "0", TabletType::Rdonly, false).await?;
//!
//! // Hand the master role of ks/-80 to another tablet.
//! wrangler.reparent_shard("ks", "-80", &master_elect, false).await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  Wrangler                   │
//! │  • migrate_served_types                     │
//! │  • reparent_shard                           │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌────────────┐  ┌────────────┐
//! │TopoServer│  │  Tablet    │  │  Serving   │
//! │ + locks  │  │  Actions   │  │  Graph     │
//! └──────────┘  └────────────┘  └────────────┘
//! ```
//!
//! # Failure Model
//!
//! Nothing is retried or rolled back. Every remote call is bounded by a
//! deadline, every parallel phase joins before returning, and every failure
//! is reported. A lock release error never replaces the failure that caused
//! the release.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod metrics;
pub mod testing;
pub mod topo;
pub mod types;
pub mod wrangler;

// Re-export main types for convenience
pub use concurrency::{for_each_parallel, ErrorSet};
pub use config::WranglerConfig;
pub use error::{Error, Result};
pub use metrics::{WranglerMetrics, WranglerMetricsSnapshot};
pub use topo::{ServedTypes, ShardInfo, ShardKey, SourceShard, TabletInfo, TopoServer};
pub use types::{BlpPosition, ReplicationPosition, RestartSlaveData, TabletAlias, TabletType};
pub use wrangler::{
    ActionNode, MigrationState, ReparentValidator, ServingGraph, TabletActions, Wrangler,
};
