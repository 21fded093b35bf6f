//! In-memory topology store.
//!
//! Holds shard and tablet records in maps and implements the advisory locks
//! with a waiter notification, so a blocked `lock_*_for_action` call wakes as
//! soon as the holder releases. Every acquire and release is appended to a
//! lock log. Shard writes and lock releases can be made to fail, which is
//! what the scenario tests in [`crate::testing`] rely on.

use crate::error::{Error, Result};
use crate::types::TabletAlias;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use super::{LockScope, LockToken, ShardInfo, ShardKey, TabletInfo, TopoServer};

/// One entry of the lock log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// A lock was granted.
    Acquired(LockScope),
    /// A lock was released.
    Released(LockScope),
}

#[derive(Debug)]
struct HeldLock {
    token: LockToken,
    contents: String,
}

/// In-memory [`TopoServer`].
#[derive(Debug, Default)]
pub struct MemoryTopo {
    shards: Mutex<BTreeMap<ShardKey, ShardInfo>>,
    tablets: Mutex<BTreeMap<TabletAlias, TabletInfo>>,
    locks: Mutex<HashMap<LockScope, HeldLock>>,
    lock_released: Notify,
    lock_log: Mutex<Vec<LockEvent>>,
    unlock_results: Mutex<HashMap<LockScope, String>>,
    failing_updates: Mutex<HashMap<ShardKey, String>>,
    failing_unlocks: Mutex<HashMap<LockScope, String>>,
    shard_updates: AtomicU64,
    next_lock_id: AtomicU64,
}

impl MemoryTopo {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a shard record.
    pub fn add_shard(&self, shard: ShardInfo) {
        self.shards.lock().insert(shard.key(), shard);
    }

    /// Insert or replace a tablet record.
    pub fn add_tablet(&self, tablet: TabletInfo) {
        self.tablets.lock().insert(tablet.alias.clone(), tablet);
    }

    /// Current shard record, if any.
    pub fn shard(&self, keyspace: &str, shard: &str) -> Option<ShardInfo> {
        self.shards.lock().get(&ShardKey::new(keyspace, shard)).cloned()
    }

    /// Current tablet record, if any.
    pub fn tablet(&self, alias: &TabletAlias) -> Option<TabletInfo> {
        self.tablets.lock().get(alias).cloned()
    }

    /// Every lock acquire and release, in order.
    pub fn lock_events(&self) -> Vec<LockEvent> {
        self.lock_log.lock().clone()
    }

    /// Whether `scope` is currently locked.
    pub fn is_locked(&self, scope: &LockScope) -> bool {
        self.locks.lock().contains_key(scope)
    }

    /// Contents attached to the lock currently held on `scope`.
    pub fn lock_contents(&self, scope: &LockScope) -> Option<String> {
        self.locks.lock().get(scope).map(|held| held.contents.clone())
    }

    /// Results recorded by the last release of `scope`.
    pub fn last_unlock_results(&self, scope: &LockScope) -> Option<String> {
        self.unlock_results.lock().get(scope).cloned()
    }

    /// Make every subsequent write of this shard fail with `reason`.
    pub fn fail_updates_for(&self, keyspace: &str, shard: &str, reason: impl Into<String>) {
        self.failing_updates
            .lock()
            .insert(ShardKey::new(keyspace, shard), reason.into());
    }

    /// Make every subsequent release of `scope` fail with `reason`. The
    /// lock stays held.
    pub fn fail_unlocks_for(&self, scope: LockScope, reason: impl Into<String>) {
        self.failing_unlocks.lock().insert(scope, reason.into());
    }

    /// Number of successful shard writes.
    pub fn shard_update_count(&self) -> u64 {
        self.shard_updates.load(Ordering::SeqCst)
    }

    fn try_lock(&self, scope: &LockScope, contents: &str) -> Option<LockToken> {
        let mut locks = self.locks.lock();
        if locks.contains_key(scope) {
            return None;
        }
        let id = self.next_lock_id.fetch_add(1, Ordering::SeqCst);
        let token = LockToken::new(format!("/locks/{scope}/{id:010}"));
        locks.insert(
            scope.clone(),
            HeldLock {
                token: token.clone(),
                contents: contents.to_string(),
            },
        );
        self.lock_log.lock().push(LockEvent::Acquired(scope.clone()));
        Some(token)
    }

    async fn lock(&self, scope: LockScope, contents: &str, timeout: Duration) -> Result<LockToken> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let released = self.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(token) = self.try_lock(&scope, contents) {
                return Ok(token);
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(Error::LockTimeout {
                    scope: scope.to_string(),
                    timeout,
                });
            }
        }
    }

    fn unlock(&self, scope: LockScope, token: &LockToken, results: &str) -> Result<()> {
        if let Some(reason) = self.failing_unlocks.lock().get(&scope) {
            return Err(Error::Store(reason.clone()));
        }
        {
            let mut locks = self.locks.lock();
            match locks.get(&scope) {
                None => {
                    return Err(Error::LockConflict {
                        scope: scope.to_string(),
                        reason: "lock is not held".to_string(),
                    });
                }
                Some(held) if held.token != *token => {
                    return Err(Error::LockConflict {
                        scope: scope.to_string(),
                        reason: format!(
                            "lock is held under {}, not {}",
                            held.token.as_str(),
                            token.as_str()
                        ),
                    });
                }
                Some(_) => {
                    locks.remove(&scope);
                }
            }
        }
        self.unlock_results
            .lock()
            .insert(scope.clone(), results.to_string());
        self.lock_log.lock().push(LockEvent::Released(scope));
        self.lock_released.notify_waiters();
        Ok(())
    }
}

#[async_trait::async_trait]
impl TopoServer for MemoryTopo {
    async fn get_shard_names(&self, keyspace: &str) -> Result<Vec<String>> {
        Ok(self
            .shards
            .lock()
            .keys()
            .filter(|k| k.keyspace == keyspace)
            .map(|k| k.shard.clone())
            .collect())
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardInfo> {
        self.shard(keyspace, shard)
            .ok_or_else(|| Error::NotFound(format!("shard {keyspace}/{shard}")))
    }

    async fn update_shard(&self, shard: &ShardInfo) -> Result<()> {
        let key = shard.key();
        if let Some(reason) = self.failing_updates.lock().get(&key) {
            return Err(Error::Store(reason.clone()));
        }
        let mut shards = self.shards.lock();
        if !shards.contains_key(&key) {
            return Err(Error::NotFound(format!("shard {key}")));
        }
        shards.insert(key, shard.clone());
        self.shard_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> Result<TabletInfo> {
        self.tablet(alias)
            .ok_or_else(|| Error::NotFound(format!("tablet {alias}")))
    }

    async fn update_tablet(&self, tablet: &TabletInfo) -> Result<()> {
        let mut tablets = self.tablets.lock();
        if !tablets.contains_key(&tablet.alias) {
            return Err(Error::NotFound(format!("tablet {}", tablet.alias)));
        }
        tablets.insert(tablet.alias.clone(), tablet.clone());
        Ok(())
    }

    async fn get_tablet_map(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> Result<BTreeMap<TabletAlias, TabletInfo>> {
        Ok(self
            .tablets
            .lock()
            .values()
            .filter(|t| t.keyspace == keyspace && t.shard == shard)
            .map(|t| (t.alias.clone(), t.clone()))
            .collect())
    }

    async fn lock_keyspace_for_action(
        &self,
        keyspace: &str,
        contents: &str,
        timeout: Duration,
    ) -> Result<LockToken> {
        self.lock(LockScope::Keyspace(keyspace.to_string()), contents, timeout)
            .await
    }

    async fn unlock_keyspace_for_action(
        &self,
        keyspace: &str,
        token: &LockToken,
        results: &str,
    ) -> Result<()> {
        self.unlock(LockScope::Keyspace(keyspace.to_string()), token, results)
    }

    async fn lock_shard_for_action(
        &self,
        keyspace: &str,
        shard: &str,
        contents: &str,
        timeout: Duration,
    ) -> Result<LockToken> {
        self.lock(LockScope::Shard(ShardKey::new(keyspace, shard)), contents, timeout)
            .await
    }

    async fn unlock_shard_for_action(
        &self,
        keyspace: &str,
        shard: &str,
        token: &LockToken,
        results: &str,
    ) -> Result<()> {
        self.unlock(LockScope::Shard(ShardKey::new(keyspace, shard)), token, results)
    }
}
