//! Keyspace and shard locking.
//!
//! # Lock Ordering
//!
//! Operations touching several shards take their locks through a
//! [`ShardLockPlan`], which fixes the order once:
//!
//! ```text
//! acquire:  sources (ascending by name)  →  destinations (ascending by name)
//! release:  exact reverse of acquire
//! ```
//!
//! Two migrations over overlapping shard sets therefore always contend on the
//! same first lock instead of deadlocking.
//!
//! # Partial Acquisition
//!
//! If acquiring the N-th lock fails, the N-1 locks already taken stay held.
//! They are logged and must be released by an operator; no automatic cleanup
//! is attempted.

use crate::concurrency::ErrorSet;
use crate::error::{Error, Result};
use crate::metrics::WranglerMetrics;
use crate::topo::{LockToken, ShardKey, TopoServer};
use std::sync::Arc;
use std::time::Duration;

use super::action::ActionNode;

/// Acquires and releases topology locks on behalf of an [`ActionNode`].
#[derive(Debug, Clone)]
pub struct LockManager {
    topo: Arc<dyn TopoServer>,
    timeout: Duration,
    metrics: Arc<WranglerMetrics>,
}

impl LockManager {
    /// Create a lock manager with the given acquisition timeout.
    pub fn new(topo: Arc<dyn TopoServer>, timeout: Duration, metrics: Arc<WranglerMetrics>) -> Self {
        Self {
            topo,
            timeout,
            metrics,
        }
    }

    /// Lock a whole keyspace.
    pub async fn lock_keyspace(&self, keyspace: &str, node: &ActionNode) -> Result<LockToken> {
        tracing::info!(keyspace, action = %node.action, "Locking keyspace");
        let token = self
            .topo
            .lock_keyspace_for_action(keyspace, &node.to_json()?, self.timeout)
            .await?;
        self.metrics.locks_acquired.inc();
        Ok(token)
    }

    /// Release a keyspace lock, recording `outcome` into the descriptor.
    ///
    /// Returns only the release's own error. When `outcome` is a failure the
    /// caller keeps reporting that failure; the release error is secondary.
    pub async fn unlock_keyspace(
        &self,
        keyspace: &str,
        node: &mut ActionNode,
        token: &LockToken,
        outcome: Option<&Error>,
    ) -> Result<()> {
        node.finish(outcome);
        log_unlock(keyspace, node, outcome);
        let released = match node.to_json() {
            Ok(results) => {
                self.topo
                    .unlock_keyspace_for_action(keyspace, token, &results)
                    .await
            }
            Err(e) => Err(e),
        };
        self.record_release(keyspace, outcome, released)
    }

    /// Lock one shard.
    pub async fn lock_shard(&self, key: &ShardKey, node: &ActionNode) -> Result<LockToken> {
        tracing::info!(keyspace = %key.keyspace, shard = %key.shard, action = %node.action, "Locking shard");
        let token = self
            .topo
            .lock_shard_for_action(&key.keyspace, &key.shard, &node.to_json()?, self.timeout)
            .await?;
        self.metrics.locks_acquired.inc();
        Ok(token)
    }

    /// Release a shard lock, recording `outcome` into the descriptor.
    ///
    /// Same error contract as [`unlock_keyspace`](Self::unlock_keyspace).
    pub async fn unlock_shard(
        &self,
        key: &ShardKey,
        node: &mut ActionNode,
        token: &LockToken,
        outcome: Option<&Error>,
    ) -> Result<()> {
        node.finish(outcome);
        let scope = key.to_string();
        log_unlock(&scope, node, outcome);
        let released = match node.to_json() {
            Ok(results) => {
                self.topo
                    .unlock_shard_for_action(&key.keyspace, &key.shard, token, &results)
                    .await
            }
            Err(e) => Err(e),
        };
        self.record_release(&scope, outcome, released)
    }

    fn record_release(&self, scope: &str, outcome: Option<&Error>, released: Result<()>) -> Result<()> {
        match released {
            Ok(()) => {
                self.metrics.locks_released.inc();
                Ok(())
            }
            Err(e) => {
                self.metrics.lock_release_failures.inc();
                if outcome.is_some() {
                    // The action's own failure stays the reported one.
                    tracing::warn!(scope, error = %e, "Unlock failed after action failure");
                } else {
                    tracing::error!(scope, error = %e, "Unlock failed");
                }
                Err(e)
            }
        }
    }
}

fn log_unlock(scope: &str, node: &ActionNode, outcome: Option<&Error>) {
    match outcome {
        Some(e) => tracing::info!(scope, action = %node.action, error = %e, "Unlocking for failed action"),
        None => tracing::info!(scope, action = %node.action, "Unlocking for successful action"),
    }
}

/// Ordered set of shard locks for a multi-shard operation.
///
/// Built once from the source and destination shards; both acquisition and
/// release follow the order it fixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLockPlan {
    order: Vec<ShardKey>,
}

impl ShardLockPlan {
    /// Sort each group by name and put sources first. Duplicates, including a
    /// shard listed as both source and destination, are locked once.
    pub fn new(mut sources: Vec<ShardKey>, mut destinations: Vec<ShardKey>) -> Self {
        sources.sort();
        sources.dedup();
        destinations.sort();
        destinations.dedup();
        destinations.retain(|d| !sources.contains(d));

        let mut order = sources;
        order.extend(destinations);
        Self { order }
    }

    /// Shards in acquisition order.
    pub fn acquisition_order(&self) -> &[ShardKey] {
        &self.order
    }

    /// Take every lock in order. Stops at the first failure, leaving the
    /// locks already taken held.
    pub async fn acquire(self, locks: &LockManager, node: &ActionNode) -> Result<HeldShardLocks> {
        let mut held = Vec::with_capacity(self.order.len());
        for key in self.order {
            match locks.lock_shard(&key, node).await {
                Ok(token) => held.push((key, token)),
                Err(e) => {
                    let stranded: Vec<String> = held.iter().map(|(k, _)| k.to_string()).collect();
                    tracing::error!(
                        keyspace = %key.keyspace,
                        shard = %key.shard,
                        error = %e,
                        still_locked = ?stranded,
                        "Failed to lock shard, may need to unlock other shards manually"
                    );
                    return Err(e);
                }
            }
        }
        Ok(HeldShardLocks { held })
    }
}

/// Shard locks taken through a [`ShardLockPlan`], in acquisition order.
#[derive(Debug)]
#[must_use = "held shard locks must be released"]
pub struct HeldShardLocks {
    held: Vec<(ShardKey, LockToken)>,
}

impl HeldShardLocks {
    /// Shards currently held, in acquisition order.
    pub fn shards(&self) -> impl Iterator<Item = &ShardKey> {
        self.held.iter().map(|(key, _)| key)
    }

    /// Release every lock in reverse acquisition order. Each release is
    /// attempted regardless of earlier failures. Release errors go into
    /// `errors` only when `outcome` is a success; otherwise they are logged
    /// and `outcome` stays the reported failure.
    pub async fn release(
        self,
        locks: &LockManager,
        node: &mut ActionNode,
        outcome: Option<&Error>,
        errors: &ErrorSet,
    ) {
        for (key, token) in self.held.into_iter().rev() {
            let released = locks.unlock_shard(&key, node, &token, outcome).await;
            if outcome.is_none() {
                errors.record(released);
            }
        }
    }
}
