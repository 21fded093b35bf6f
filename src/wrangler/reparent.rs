//! Graceful master reparent.
//!
//! Replaces a live master with one of its slaves without losing writes:
//!
//! ```text
//!   checks ─► demote M ─► slaves ≤ pos(M)? ─► promote E ─► restart slaves ─► scrap M ─► finalize
//!     │          │               │                 │              │              │
//!   abort      abort           abort             abort         warn only      warn only
//!                              (M read-only)     (M read-only)
//! ```
//!
//! Every check runs before the first mutation. After promotion nothing
//! aborts: slave restart failures are reported once the new master has been
//! published.

use crate::concurrency::{for_each_parallel, ErrorSet};
use crate::error::{Error, Result};
use crate::metrics::OperationKind;
use crate::topo::{ShardKey, TabletInfo};
use crate::types::{ReplicationPosition, RestartSlaveData, TabletAlias, TabletType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use super::action::{ActionNode, ActionRequest};
use super::Wrangler;

/// Whether enough slaves were redirected to the new master to open it for
/// writes. An empty slave set counts as a majority.
pub fn is_majority(succeeded: usize, attempted: usize) -> bool {
    attempted == 0 || succeeded * 2 > attempted
}

impl Wrangler {
    /// Gracefully reparent `keyspace/shard` to `master_elect`, with the shard
    /// locked for the whole run.
    pub async fn reparent_shard(
        &self,
        keyspace: &str,
        shard: &str,
        master_elect: &TabletAlias,
        leave_master_read_only: bool,
    ) -> Result<()> {
        let started = Instant::now();
        self.metrics.record_start(OperationKind::Reparent);

        let result = self
            .reparent_shard_with_lock(keyspace, shard, master_elect, leave_master_read_only)
            .await;

        match &result {
            Ok(()) => tracing::info!(keyspace, shard, master_elect = %master_elect, "Reparent complete"),
            Err(e) => tracing::warn!(keyspace, shard, master_elect = %master_elect, error = %e, "Reparent failed"),
        }
        self.metrics
            .record_end(OperationKind::Reparent, started.elapsed(), result.is_ok());
        result
    }

    async fn reparent_shard_with_lock(
        &self,
        keyspace: &str,
        shard: &str,
        master_elect: &TabletAlias,
        leave_master_read_only: bool,
    ) -> Result<()> {
        let key = ShardKey::new(keyspace, shard);
        let mut node = ActionNode::reparent_shard(master_elect, leave_master_read_only);
        let token = self.locks.lock_shard(&key, &node).await?;

        let outcome = self
            .reparent_shard_locked(&key, master_elect, leave_master_read_only)
            .await;
        let released = self
            .locks
            .unlock_shard(&key, &mut node, &token, outcome.as_ref().err())
            .await;
        // A release failure after a failed reparent is only logged.
        outcome.and(released)
    }

    async fn reparent_shard_locked(
        &self,
        key: &ShardKey,
        master_elect: &TabletAlias,
        leave_master_read_only: bool,
    ) -> Result<()> {
        let shard = self.topo.get_shard(&key.keyspace, &key.shard).await?;
        let master_alias = shard
            .master_alias
            .clone()
            .ok_or_else(|| Error::Precondition(format!("shard {key} has no master")))?;

        let mut tablets = self.topo.get_tablet_map(&key.keyspace, &key.shard).await?;
        let master = tablets.remove(&master_alias).ok_or_else(|| {
            Error::Precondition(format!("master {master_alias} of {key} is not in the tablet map"))
        })?;
        let elect = match tablets.get(master_elect) {
            Some(tablet) => tablet.clone(),
            None if *master_elect == master_alias => master.clone(),
            None => {
                let known: Vec<String> = tablets.keys().map(ToString::to_string).collect();
                return Err(Error::Precondition(format!(
                    "master elect {master_elect} not in replication graph of {key}: {known:?}"
                )));
            }
        };
        let slaves: BTreeMap<TabletAlias, TabletInfo> = tablets
            .into_iter()
            .filter(|(_, t)| t.tablet_type != TabletType::Scrap)
            .collect();

        self.reparent_shard_graceful(slaves, &master, &elect, leave_master_read_only)
            .await
    }

    /// Run the graceful reparent protocol. The caller holds the shard lock.
    ///
    /// `slaves` maps every live tablet of the shard except the current
    /// master, and must include the master-elect.
    pub async fn reparent_shard_graceful(
        &self,
        mut slaves: BTreeMap<TabletAlias, TabletInfo>,
        master: &TabletInfo,
        master_elect: &TabletInfo,
        leave_master_read_only: bool,
    ) -> Result<()> {
        if let Some(parent) = &master.parent {
            return Err(Error::Precondition(format!(
                "master tablet {} should not have a parent, has {parent}",
                master.alias
            )));
        }
        if master.tablet_type != TabletType::Master {
            return Err(Error::Precondition(format!(
                "master tablet {} has type {}",
                master.alias, master.tablet_type
            )));
        }
        if master.alias == master_elect.alias {
            return Err(Error::Precondition(format!(
                "master tablet {} should not match master elect, this must be forced",
                master.alias
            )));
        }
        if !slaves.contains_key(&master_elect.alias) {
            let known: Vec<String> = slaves.keys().map(ToString::to_string).collect();
            return Err(Error::Precondition(format!(
                "master elect {} not in replication graph of {}: {known:?}",
                master_elect.alias,
                master.shard_key()
            )));
        }

        let dead_master_hint = format!("if the master is dead, run: ScrapTablet -force {}", master.alias);
        self.validator
            .validate_shard(&master.keyspace, &master.shard, true)
            .await
            .map_err(|e| e.with_hint(&dead_master_hint))?;
        self.validator
            .check_slave_replication(&slaves, &master.alias)
            .await?;
        self.validator.check_master_elect(master_elect).await?;

        tracing::info!(master = %master.alias, "Demoting master");
        let master_position = self
            .dispatcher
            .demote_master(&master.alias)
            .await
            .map_err(|e| e.with_hint(&dead_master_hint))?;

        let read_only_hint = format!("demoted master is still read-only, run: SetReadWrite {}", master.alias);
        tracing::info!(shard = %master.shard_key(), position = %master_position, "Checking slaves");
        let restartable: Vec<&TabletInfo> = slaves
            .values()
            .filter(|t| t.tablet_type.is_restartable())
            .collect();
        self.check_slave_consistency(&restartable, master_position)
            .await
            .map_err(|e| e.with_hint(&read_only_hint))?;

        tracing::info!(master_elect = %master_elect.alias, "Promoting slave");
        let restart_data = self
            .dispatcher
            .promote_slave(&master_elect.alias)
            .await
            .map_err(|e| e.with_hint(&read_only_hint))?;

        slaves.remove(&master_elect.alias);

        let (majority_restart, restart_result) = self.restart_slaves(&slaves, &restart_data).await;

        tracing::info!(master = %master.alias, "Scrapping demoted master");
        if let Err(e) = self.dispatcher.run(&master.alias, ActionRequest::Scrap).await {
            tracing::warn!(master = %master.alias, error = %e, "Scrap demoted master failed");
        }

        self.finish_reparent(master_elect, majority_restart, leave_master_read_only)
            .await?;

        if let Err(e) = &restart_result {
            tracing::warn!(error = %e, "Some slaves failed to restart against the new master");
        }
        restart_result
    }

    /// Every slave's position must not be ahead of the demoted master's.
    async fn check_slave_consistency(
        &self,
        slaves: &[&TabletInfo],
        master_position: ReplicationPosition,
    ) -> Result<()> {
        let errors = ErrorSet::new();
        for_each_parallel(slaves.iter().copied(), &errors, |slave| async move {
            let position = self.dispatcher.slave_position(&slave.alias).await?;
            if position > master_position {
                return Err(Error::Consistency(format!(
                    "slave {} is at {position}, ahead of demoted master at {master_position}",
                    slave.alias
                )));
            }
            if position < master_position {
                tracing::debug!(slave = %slave.alias, position = %position, "Slave behind demoted master");
            }
            Ok(())
        })
        .await;
        errors.result()
    }

    /// Point every slave at the new master in parallel. Returns whether a
    /// majority succeeded, along with the failures.
    async fn restart_slaves(
        &self,
        slaves: &BTreeMap<TabletAlias, TabletInfo>,
        restart_data: &RestartSlaveData,
    ) -> (bool, Result<()>) {
        let errors = ErrorSet::new();
        let restarted = AtomicUsize::new(0);
        for_each_parallel(slaves.keys(), &errors, |alias| {
            let restarted = &restarted;
            async move {
                tracing::info!(slave = %alias, parent = %restart_data.parent, "Restarting slave");
                self.dispatcher
                    .run(alias, ActionRequest::RestartSlave(restart_data))
                    .await?;
                restarted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        let succeeded = restarted.load(Ordering::SeqCst);
        let majority = is_majority(succeeded, slaves.len());
        if !majority {
            tracing::warn!(succeeded, attempted = slaves.len(), "Minority of slaves restarted");
        }
        (majority, errors.result())
    }

    /// Publish the new master and open it for writes when safe.
    async fn finish_reparent(
        &self,
        master_elect: &TabletInfo,
        majority_restart: bool,
        leave_master_read_only: bool,
    ) -> Result<()> {
        if majority_restart && !leave_master_read_only {
            tracing::info!(master = %master_elect.alias, "Marking new master read-write");
            if let Err(e) = self
                .dispatcher
                .run(&master_elect.alias, ActionRequest::SetReadWrite)
                .await
            {
                tracing::warn!(master = %master_elect.alias, error = %e, "Failed to mark new master read-write");
            }
        } else {
            tracing::warn!(
                master = %master_elect.alias,
                majority_restart,
                leave_master_read_only,
                "Leaving new master read-only, run: SetReadWrite {}",
                master_elect.alias
            );
        }

        let key = master_elect.shard_key();
        let mut shard = self.topo.get_shard(&key.keyspace, &key.shard).await?;
        shard.master_alias = Some(master_elect.alias.clone());
        self.topo
            .update_shard(&shard)
            .await
            .map_err(|e| Error::Persistence {
                keyspace: key.keyspace.clone(),
                shard: key.shard.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(shard = %key, "Rebuilding shard serving graph");
        self.serving_graph
            .rebuild_shard_graph(&key.keyspace, &key.shard)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority() {
        assert!(is_majority(0, 0));
        assert!(is_majority(1, 1));
        assert!(is_majority(2, 3));
        assert!(!is_majority(1, 2));
        assert!(!is_majority(0, 3));
    }
}
