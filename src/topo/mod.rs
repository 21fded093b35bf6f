//! Topology data model and the metadata store interface.
//!
//! The topology store owns the shard and tablet records and the advisory
//! locks that serialize cluster actions. This crate never persists anything
//! itself: it reads records, mutates copies in memory, and hands them back
//! through [`TopoServer`].
//!
//! # Freshness
//!
//! Every protocol step that mutates a [`ShardInfo`] re-reads it from the store
//! right before mutating it. Copies loaded earlier (for validation, or before
//! locks were taken) are never written back.

pub mod memory;

use crate::error::Result;
use crate::types::{TabletAlias, TabletType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use memory::{LockEvent, MemoryTopo};

/// Identity of a shard: keyspace plus shard name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    /// Keyspace name.
    pub keyspace: String,
    /// Shard name, e.g. `-80` or `80-`.
    pub shard: String,
}

impl ShardKey {
    /// Create a new shard key.
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.shard)
    }
}

/// Ordered, duplicate-free set of the roles a shard serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TabletType>", into = "Vec<TabletType>")]
pub struct ServedTypes(Vec<TabletType>);

impl ServedTypes {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `served_type` is in the set.
    pub fn contains(&self, served_type: TabletType) -> bool {
        self.0.contains(&served_type)
    }

    /// Append `served_type`. Returns false if it was already present.
    pub fn insert(&mut self, served_type: TabletType) -> bool {
        if self.contains(served_type) {
            return false;
        }
        self.0.push(served_type);
        true
    }

    /// Remove `served_type`. Returns false if it was absent.
    pub fn remove(&mut self, served_type: TabletType) -> bool {
        let before = self.0.len();
        self.0.retain(|t| *t != served_type);
        self.0.len() != before
    }

    /// Number of served roles.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no roles are served.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Roles in insertion order.
    pub fn as_slice(&self) -> &[TabletType] {
        &self.0
    }
}

impl From<Vec<TabletType>> for ServedTypes {
    fn from(types: Vec<TabletType>) -> Self {
        let mut set = ServedTypes::new();
        for t in types {
            set.insert(t);
        }
        set
    }
}

impl From<ServedTypes> for Vec<TabletType> {
    fn from(set: ServedTypes) -> Self {
        set.0
    }
}

impl<const N: usize> From<[TabletType; N]> for ServedTypes {
    fn from(types: [TabletType; N]) -> Self {
        types.to_vec().into()
    }
}

/// Upstream stream of a filtered-replication destination shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceShard {
    /// Stream id on the destination.
    pub uid: u32,
    /// Source keyspace.
    pub keyspace: String,
    /// Source shard name.
    pub shard: String,
}

impl SourceShard {
    /// Create a new source shard descriptor.
    pub fn new(uid: u32, keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            uid,
            keyspace: keyspace.into(),
            shard: shard.into(),
        }
    }

    /// Key of the shard this stream replicates from.
    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.keyspace.clone(), self.shard.clone())
    }
}

/// Shard record as kept in the topology store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    keyspace: String,
    shard_name: String,
    /// Current master, if the shard has one.
    pub master_alias: Option<TabletAlias>,
    /// Roles this shard is authorized to serve.
    pub served_types: ServedTypes,
    /// Filtered replication sources, non-empty only for a resharding destination.
    pub source_shards: Vec<SourceShard>,
}

impl ShardInfo {
    /// Create an empty shard record.
    pub fn new(keyspace: impl Into<String>, shard_name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard_name: shard_name.into(),
            master_alias: None,
            served_types: ServedTypes::new(),
            source_shards: Vec::new(),
        }
    }

    /// Set the master alias.
    pub fn with_master(mut self, master: TabletAlias) -> Self {
        self.master_alias = Some(master);
        self
    }

    /// Set the served types.
    pub fn with_served_types(mut self, served_types: impl Into<ServedTypes>) -> Self {
        self.served_types = served_types.into();
        self
    }

    /// Add a filtered replication source.
    pub fn with_source_shard(mut self, source: SourceShard) -> Self {
        self.source_shards.push(source);
        self
    }

    /// Keyspace name.
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// Shard name.
    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    /// Identity of this shard.
    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.keyspace.clone(), self.shard_name.clone())
    }

    /// Whether this shard declares a filtered replication stream from `source`.
    pub fn replicates_from(&self, source: &ShardKey) -> bool {
        self.source_shards
            .iter()
            .any(|s| s.keyspace == source.keyspace && s.shard == source.shard)
    }
}

/// Tablet record as kept in the topology store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletInfo {
    /// Unique tablet id.
    pub alias: TabletAlias,
    /// Keyspace the tablet belongs to.
    pub keyspace: String,
    /// Shard the tablet belongs to.
    pub shard: String,
    /// Current role.
    pub tablet_type: TabletType,
    /// Tablet this one replicates from. `None` for a master.
    pub parent: Option<TabletAlias>,
}

impl TabletInfo {
    /// Create a tablet record with no parent.
    pub fn new(
        alias: TabletAlias,
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        tablet_type: TabletType,
    ) -> Self {
        Self {
            alias,
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
            parent: None,
        }
    }

    /// Set the parent tablet.
    pub fn with_parent(mut self, parent: TabletAlias) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Key of the shard this tablet belongs to.
    pub fn shard_key(&self) -> ShardKey {
        ShardKey::new(self.keyspace.clone(), self.shard.clone())
    }
}

/// Scope of an advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockScope {
    /// Whole keyspace.
    Keyspace(String),
    /// One shard.
    Shard(ShardKey),
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Keyspace(keyspace) => write!(f, "{keyspace}"),
            LockScope::Shard(key) => write!(f, "{key}"),
        }
    }
}

/// Proof of a held lock, handed back on release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a store-specific lock path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The lock path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Topology metadata store.
///
/// Lock contents and unlock results are JSON-serialized
/// [`ActionNode`](crate::wrangler::ActionNode)s, so observers can see what
/// holds a lock and how it ended.
#[async_trait::async_trait]
pub trait TopoServer: Send + Sync + fmt::Debug {
    /// Names of all shards in a keyspace.
    async fn get_shard_names(&self, keyspace: &str) -> Result<Vec<String>>;

    /// Read a shard record.
    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardInfo>;

    /// Write a shard record back.
    async fn update_shard(&self, shard: &ShardInfo) -> Result<()>;

    /// Read a tablet record.
    async fn get_tablet(&self, alias: &TabletAlias) -> Result<TabletInfo>;

    /// Write a tablet record back.
    async fn update_tablet(&self, tablet: &TabletInfo) -> Result<()>;

    /// All tablets of a shard, keyed by alias.
    async fn get_tablet_map(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> Result<BTreeMap<TabletAlias, TabletInfo>>;

    /// Block until the keyspace lock is acquired or `timeout` elapses.
    async fn lock_keyspace_for_action(
        &self,
        keyspace: &str,
        contents: &str,
        timeout: Duration,
    ) -> Result<LockToken>;

    /// Release a keyspace lock, recording the action's final state.
    async fn unlock_keyspace_for_action(
        &self,
        keyspace: &str,
        token: &LockToken,
        results: &str,
    ) -> Result<()>;

    /// Block until the shard lock is acquired or `timeout` elapses.
    async fn lock_shard_for_action(
        &self,
        keyspace: &str,
        shard: &str,
        contents: &str,
        timeout: Duration,
    ) -> Result<LockToken>;

    /// Release a shard lock, recording the action's final state.
    async fn unlock_shard_for_action(
        &self,
        keyspace: &str,
        shard: &str,
        token: &LockToken,
        results: &str,
    ) -> Result<()>;
}
