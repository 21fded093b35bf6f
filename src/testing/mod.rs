//! Test doubles and scenario fixtures for the wrangler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        WranglerFixture                          │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌─────────────────┐  │
//! │  │ MemoryTopo   │◄──│ FakeTabletManager│   │ RecordingServing│  │
//! │  │ - lock log   │   │ - positions      │   │ Graph           │  │
//! │  │ - update     │   │ - scripted faults│   │ - rebuild log   │  │
//! │  │   failures   │   │ - call log       │   │ - failures      │  │
//! │  └──────┬───────┘   └────────┬─────────┘   └────────┬────────┘  │
//! │         └────────────────────┼──────────────────────┘           │
//! │                              ▼                                  │
//! │                          Wrangler                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let fixture = WranglerFixture::new()?;
//! let split = fixture.setup_split("ks");
//! fixture
//!     .wrangler
//!     .migrate_served_types("ks", "0", TabletType::Rdonly, false)
//!     .await?;
//! ```

mod fake_agent;

mod migration_tests;

pub use fake_agent::{ActionFault, FakeTabletManager, RecordingServingGraph, ServingRebuild};

use crate::config::WranglerConfig;
use crate::error::Result;
use crate::topo::{MemoryTopo, ShardInfo, ShardKey, SourceShard, TabletInfo};
use crate::types::{TabletAlias, TabletType};
use crate::wrangler::Wrangler;
use std::sync::Arc;
use std::time::Duration;

/// Cell every fixture tablet lives in.
pub const TEST_CELL: &str = "test";

/// Position every fixture master and slave starts at.
pub const INITIAL_POSITION: u64 = 100;

/// Alias of a fixture tablet.
pub fn tablet_alias(uid: u32) -> TabletAlias {
    TabletAlias::new(TEST_CELL, uid)
}

/// Shards created by [`WranglerFixture::setup_split`].
#[derive(Debug, Clone)]
pub struct SplitLayout {
    /// The shard being split.
    pub source: ShardKey,
    /// Master of the source shard.
    pub source_master: TabletAlias,
    /// Destination shards with their masters, sorted by name.
    pub destinations: Vec<(ShardKey, TabletAlias)>,
}

/// Tablets created by [`WranglerFixture::setup_replicated_shard`].
#[derive(Debug, Clone)]
pub struct ReplicatedShard {
    /// The shard.
    pub key: ShardKey,
    /// Current master.
    pub master: TabletAlias,
    /// Replica-type slaves, electable.
    pub replicas: Vec<TabletAlias>,
    /// Read-only slave.
    pub rdonly: TabletAlias,
    /// Lagged slave, excluded from consistency checks.
    pub lagged: TabletAlias,
}

/// A wrangler wired to in-memory collaborators.
#[derive(Debug)]
pub struct WranglerFixture {
    /// Topology store.
    pub topo: Arc<MemoryTopo>,
    /// Tablet agent.
    pub agent: Arc<FakeTabletManager>,
    /// Serving graph.
    pub serving_graph: Arc<RecordingServingGraph>,
    /// The wrangler under test.
    pub wrangler: Wrangler,
}

impl WranglerFixture {
    /// Create a fixture with short timeouts.
    pub fn new() -> Result<Self> {
        Self::with_config(Self::default_config())
    }

    /// Timeouts short enough for hang scenarios to finish quickly.
    pub fn default_config() -> WranglerConfig {
        WranglerConfig::new()
            .with_lock_timeout(Duration::from_millis(500))
            .with_action_timeout(Duration::from_millis(100))
    }

    /// Create a fixture with the given configuration.
    pub fn with_config(config: WranglerConfig) -> Result<Self> {
        let topo = Arc::new(MemoryTopo::new());
        let agent = Arc::new(FakeTabletManager::new(Arc::clone(&topo)));
        let serving_graph = Arc::new(RecordingServingGraph::new());
        let wrangler = Wrangler::new(
            config,
            topo.clone(),
            agent.clone(),
            serving_graph.clone(),
        )?;
        Ok(Self {
            topo,
            agent,
            serving_graph,
            wrangler,
        })
    }

    /// Register a tablet in the store at [`INITIAL_POSITION`].
    pub fn add_tablet(
        &self,
        uid: u32,
        key: &ShardKey,
        tablet_type: TabletType,
        parent: Option<&TabletAlias>,
    ) -> TabletAlias {
        let alias = tablet_alias(uid);
        let mut tablet = TabletInfo::new(alias.clone(), &key.keyspace, &key.shard, tablet_type);
        tablet.parent = parent.cloned();
        self.topo.add_tablet(tablet);
        self.agent.set_position(&alias, INITIAL_POSITION);
        alias
    }

    /// Source shard `0` serving every role, split into `-80` and `80-`
    /// which replicate from it and are already caught up.
    pub fn setup_split(&self, keyspace: &str) -> SplitLayout {
        let source = ShardKey::new(keyspace, "0");
        let source_master = self.add_tablet(100, &source, TabletType::Master, None);
        self.topo.add_shard(
            ShardInfo::new(keyspace, "0")
                .with_master(source_master.clone())
                .with_served_types([TabletType::Master, TabletType::Replica, TabletType::Rdonly]),
        );

        let mut destinations = Vec::new();
        for (uid, name) in [(200, "-80"), (300, "80-")] {
            let key = ShardKey::new(keyspace, name);
            let master = self.add_tablet(uid, &key, TabletType::Master, None);
            self.topo.add_shard(
                ShardInfo::new(keyspace, name)
                    .with_master(master.clone())
                    .with_source_shard(SourceShard::new(0, keyspace, "0")),
            );
            self.agent.set_blp_position(&master, 0, INITIAL_POSITION);
            destinations.push((key, master));
        }

        SplitLayout {
            source,
            source_master,
            destinations,
        }
    }

    /// Shard with a master, two replicas, an rdonly and a lagged slave,
    /// all replicating from the master at the same position.
    pub fn setup_replicated_shard(&self, keyspace: &str, shard: &str) -> ReplicatedShard {
        let key = ShardKey::new(keyspace, shard);
        let master = self.add_tablet(1, &key, TabletType::Master, None);
        let replicas = vec![
            self.add_tablet(2, &key, TabletType::Replica, Some(&master)),
            self.add_tablet(3, &key, TabletType::Replica, Some(&master)),
        ];
        let rdonly = self.add_tablet(4, &key, TabletType::Rdonly, Some(&master));
        let lagged = self.add_tablet(5, &key, TabletType::Lag, Some(&master));
        self.topo.add_shard(
            ShardInfo::new(keyspace, shard)
                .with_master(master.clone())
                .with_served_types([TabletType::Master, TabletType::Replica, TabletType::Rdonly]),
        );

        ReplicatedShard {
            key,
            master,
            replicas,
            rdonly,
            lagged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_layout() {
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");

        let dest = fixture.topo.shard("ks", "-80").unwrap();
        assert!(dest.replicates_from(&split.source));
        assert!(dest.served_types.is_empty());
        assert_eq!(split.destinations.len(), 2);
        assert_eq!(
            fixture.topo.shard("ks", "0").unwrap().served_types.len(),
            3
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WranglerConfig::new().with_lock_timeout(Duration::ZERO);
        assert!(WranglerFixture::with_config(config).unwrap_err().is_precondition());
    }
}
