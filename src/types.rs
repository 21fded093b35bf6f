//! Core types used throughout the shard wrangler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a tablet: the cell it lives in plus a numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    /// Cell (data center) name.
    pub cell: String,
    /// Numeric id, unique within the cell.
    pub uid: u32,
}

impl TabletAlias {
    /// Create a new alias.
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// Role of a tablet in its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletType {
    /// Not part of any shard yet.
    Idle,
    /// Accepts writes; root of the shard's replication graph.
    Master,
    /// Serves replica traffic.
    Replica,
    /// Serves read-only batch traffic.
    Rdonly,
    /// Batch processing slave.
    Batch,
    /// Replicating, ready to be promoted to a serving type.
    Spare,
    /// Replicating, used for experiments.
    Experimental,
    /// Replicating, undergoing a schema change.
    #[serde(rename = "schema_upgrade")]
    Schema,
    /// Purposely lagged slave.
    Lag,
    /// Lagged slave whose parent is gone.
    LagOrphan,
    /// Taking a backup.
    Backup,
    /// Restoring from a backup.
    Restore,
    /// Permanently retired.
    Scrap,
}

impl TabletType {
    /// Types a shard can be authorized to serve.
    pub fn is_served_type(&self) -> bool {
        matches!(self, TabletType::Master | TabletType::Replica | TabletType::Rdonly)
    }

    /// Types that replicate from the shard master.
    pub fn is_slave_type(&self) -> bool {
        matches!(
            self,
            TabletType::Replica
                | TabletType::Rdonly
                | TabletType::Batch
                | TabletType::Spare
                | TabletType::Experimental
                | TabletType::Schema
                | TabletType::Lag
                | TabletType::LagOrphan
                | TabletType::Backup
                | TabletType::Restore
        )
    }

    /// Slave types whose replication can be checked and redirected during a
    /// reparent. Lagged slaves are deliberately behind and are skipped.
    pub fn is_restartable(&self) -> bool {
        self.is_slave_type() && !matches!(self, TabletType::Lag | TabletType::LagOrphan)
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TabletType::Idle => "idle",
            TabletType::Master => "master",
            TabletType::Replica => "replica",
            TabletType::Rdonly => "rdonly",
            TabletType::Batch => "batch",
            TabletType::Spare => "spare",
            TabletType::Experimental => "experimental",
            TabletType::Schema => "schema_upgrade",
            TabletType::Lag => "lag",
            TabletType::LagOrphan => "lag_orphan",
            TabletType::Backup => "backup",
            TabletType::Restore => "restore",
            TabletType::Scrap => "scrap",
        };
        f.write_str(name)
    }
}

/// Opaque, totally ordered marker of how far a tablet has applied its
/// replication stream. Only compared, never interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationPosition(u64);

impl ReplicationPosition {
    /// Create a position from a replication group id.
    pub const fn new(group_id: u64) -> Self {
        Self(group_id)
    }

    /// The underlying replication group id.
    pub fn group_id(&self) -> u64 {
        self.0
    }

    /// Whether this position has reached `target`.
    pub fn has_reached(&self, target: &ReplicationPosition) -> bool {
        self >= target
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group:{}", self.0)
    }
}

/// Target position for one filtered replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlpPosition {
    /// Stream id, matching [`SourceShard::uid`](crate::topo::SourceShard).
    pub uid: u32,
    /// Position the stream must reach.
    pub position: ReplicationPosition,
}

/// Reparent state handed from the promoted master-elect to the slaves
/// that must now replicate from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartSlaveData {
    /// The new master.
    pub parent: TabletAlias,
    /// Position the new master started serving from.
    pub position: ReplicationPosition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_alias_display() {
        let alias = TabletAlias::new("nyc", 42);
        assert_eq!(alias.to_string(), "nyc-0000000042");
    }

    #[test]
    fn test_tablet_type_classes() {
        assert!(TabletType::Master.is_served_type());
        assert!(TabletType::Rdonly.is_served_type());
        assert!(!TabletType::Spare.is_served_type());

        assert!(!TabletType::Master.is_slave_type());
        assert!(TabletType::Replica.is_restartable());
        assert!(TabletType::Lag.is_slave_type());
        assert!(!TabletType::Lag.is_restartable());
        assert!(!TabletType::Scrap.is_restartable());
        assert!(!TabletType::Idle.is_restartable());
    }

    #[test]
    fn test_position_ordering() {
        let a = ReplicationPosition::new(10);
        let b = ReplicationPosition::new(12);
        assert!(b.has_reached(&a));
        assert!(a.has_reached(&a));
        assert!(!a.has_reached(&b));
    }

    #[test]
    fn test_tablet_type_serde_names() {
        let json = serde_json::to_string(&TabletType::LagOrphan).unwrap();
        assert_eq!(json, "\"lag_orphan\"");

        // Wire name and display name agree for every type.
        for tablet_type in [TabletType::Schema, TabletType::Rdonly, TabletType::LagOrphan] {
            let json = serde_json::to_string(&tablet_type).unwrap();
            assert_eq!(json, format!("\"{tablet_type}\""));
        }
        let parsed: TabletType = serde_json::from_str("\"schema_upgrade\"").unwrap();
        assert_eq!(parsed, TabletType::Schema);
    }
}
