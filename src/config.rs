//! Configuration types for the shard wrangler.

use crate::error::{Error, Result};
use std::time::Duration;

/// Main configuration for a [`Wrangler`](crate::wrangler::Wrangler).
#[derive(Debug, Clone)]
pub struct WranglerConfig {
    /// How long to wait for a keyspace or shard lock before giving up.
    pub lock_timeout: Duration,

    /// Deadline for every remote tablet action, including catch-up waits.
    pub action_timeout: Duration,

    /// Cells to rebuild the serving graph in after a migration.
    /// `None` rebuilds every cell.
    pub rebuild_cells: Option<Vec<String>>,

    /// Whether the keyspace graph rebuild is forced even when unchanged.
    pub force_rebuild: bool,
}

impl Default for WranglerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(30),
            rebuild_cells: None,
            force_rebuild: true,
        }
    }
}

impl WranglerConfig {
    /// Create a configuration with default timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the per-action timeout.
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Restrict serving graph rebuilds to the given cells.
    pub fn with_rebuild_cells(mut self, cells: Vec<String>) -> Self {
        self.rebuild_cells = Some(cells);
        self
    }

    /// Enable or disable forced keyspace graph rebuilds.
    pub fn with_force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }

    /// Check that the configuration can be used.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(Error::Precondition("lock_timeout must be non-zero".to_string()));
        }
        if self.action_timeout.is_zero() {
            return Err(Error::Precondition(
                "action_timeout must be non-zero".to_string(),
            ));
        }
        if matches!(&self.rebuild_cells, Some(cells) if cells.is_empty()) {
            return Err(Error::Precondition(
                "rebuild_cells must name at least one cell".to_string(),
            ));
        }
        Ok(())
    }
}
