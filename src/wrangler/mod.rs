//! Cluster orchestration: served-type migration and graceful reparent.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                               Wrangler                                │
//! │                                                                       │
//! │   migrate_served_types (keyspace.rs)    reparent_shard (reparent.rs)  │
//! │            │            │                   │             │           │
//! │            ▼            ▼                   ▼             ▼           │
//! │   ┌──────────────┐  ┌──────────────────┐  ┌────────────────────────┐  │
//! │   │ LockManager  │  │ Master fan-out   │  │ ReparentValidator      │  │
//! │   │ ShardLockPlan│  │ (fanout.rs)      │  │ (validator.rs)         │  │
//! │   └──────┬───────┘  └────────┬─────────┘  └────────────────────────┘  │
//! │          │                   │ for_each_parallel + ErrorSet           │
//! │          │                   ▼                                        │
//! │          │          ┌──────────────────┐                              │
//! │          │          │ ActionDispatcher │                              │
//! │          │          └────────┬─────────┘                              │
//! └──────────┼───────────────────┼────────────────────────────────────────┘
//!            ▼                   ▼
//!       TopoServer          TabletActions             ServingGraph
//! ```
//!
//! A [`Wrangler`] owns no cluster state. Every protocol reads what it needs
//! from the [`TopoServer`] and writes its results back before releasing its
//! locks.

pub mod action;
mod fanout;
pub mod keyspace;
pub mod lock;
pub mod reparent;
pub mod serving;
pub mod validator;

pub use action::{
    ActionDispatcher, ActionHandle, ActionName, ActionNode, ActionRequest, ActionState,
    TabletAction, TabletActions,
};
pub use keyspace::{migrate_destination_served_types, migrate_source_served_types, MigrationState};
pub use lock::{HeldShardLocks, LockManager, ShardLockPlan};
pub use reparent::is_majority;
pub use serving::ServingGraph;
pub use validator::{ReparentValidator, TopologyValidator};

use crate::config::WranglerConfig;
use crate::error::Result;
use crate::metrics::WranglerMetrics;
use crate::topo::TopoServer;
use std::sync::Arc;

/// Entry point for cluster-wide actions.
#[derive(Debug, Clone)]
pub struct Wrangler {
    topo: Arc<dyn TopoServer>,
    dispatcher: ActionDispatcher,
    locks: LockManager,
    serving_graph: Arc<dyn ServingGraph>,
    validator: Arc<dyn ReparentValidator>,
    config: WranglerConfig,
    metrics: Arc<WranglerMetrics>,
}

impl Wrangler {
    /// Create a wrangler using the built-in [`TopologyValidator`].
    pub fn new(
        config: WranglerConfig,
        topo: Arc<dyn TopoServer>,
        actions: Arc<dyn TabletActions>,
        serving_graph: Arc<dyn ServingGraph>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(WranglerMetrics::new());
        let dispatcher = ActionDispatcher::new(actions, config.action_timeout, Arc::clone(&metrics));
        let locks = LockManager::new(Arc::clone(&topo), config.lock_timeout, Arc::clone(&metrics));
        let validator = Arc::new(TopologyValidator::new(Arc::clone(&topo), dispatcher.clone()));

        tracing::debug!(
            lock_timeout = ?config.lock_timeout,
            action_timeout = ?config.action_timeout,
            "Wrangler created"
        );

        Ok(Self {
            topo,
            dispatcher,
            locks,
            serving_graph,
            validator,
            config,
            metrics,
        })
    }

    /// Replace the pre-reparent checks.
    pub fn with_validator(mut self, validator: Arc<dyn ReparentValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// The topology store.
    pub fn topo(&self) -> &Arc<dyn TopoServer> {
        &self.topo
    }

    /// The action dispatcher.
    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// The lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Configuration in use.
    pub fn config(&self) -> &WranglerConfig {
        &self.config
    }

    /// Operation metrics.
    pub fn metrics(&self) -> &Arc<WranglerMetrics> {
        &self.metrics
    }
}
