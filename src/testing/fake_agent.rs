//! Scriptable tablet agent and serving graph for scenario tests.
//!
//! [`FakeTabletManager`] executes tablet actions against in-memory tablet
//! state and applies role/parent changes to a [`MemoryTopo`], the way a real
//! agent would update its own record. Faults can be scripted per tablet and
//! action:
//!
//! ```rust,ignore
//! let agent = FakeTabletManager::new(topo.clone());
//! agent.set_position(&master, 100);
//! agent.inject(&replica, TabletAction::RestartSlave, ActionFault::Fail("io".into()));
//! agent.inject(&dest, TabletAction::WaitBlpPosition, ActionFault::Hang);
//! ```

use crate::error::{Error, Result};
use crate::topo::MemoryTopo;
use crate::types::{
    BlpPosition, ReplicationPosition, RestartSlaveData, TabletAlias, TabletType,
};
use crate::wrangler::{ActionHandle, ServingGraph, TabletAction, TabletActions};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often a blocked catch-up wait re-checks its stream.
const BLP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Scripted failure of one action on one tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFault {
    /// The agent cannot be reached; the call fails before the action starts.
    Unreachable,
    /// The action runs and fails with this message.
    Fail(String),
    /// The action never finishes.
    Hang,
}

/// Agent-side state of one tablet.
#[derive(Debug, Clone, Default)]
struct TabletState {
    position: ReplicationPosition,
    read_only: bool,
    blp_positions: HashMap<u32, ReplicationPosition>,
}

/// In-memory tablet agent.
#[derive(Debug)]
pub struct FakeTabletManager {
    topo: Arc<MemoryTopo>,
    tablets: RwLock<HashMap<TabletAlias, TabletState>>,
    faults: RwLock<HashMap<(TabletAlias, TabletAction), ActionFault>>,
    calls: Mutex<Vec<(TabletAlias, TabletAction)>>,
    pending: Mutex<HashMap<ActionHandle, (TabletAlias, TabletAction)>>,
    next_handle: AtomicU64,
}

impl FakeTabletManager {
    /// Create an agent that applies tablet changes to `topo`.
    pub fn new(topo: Arc<MemoryTopo>) -> Self {
        Self {
            topo,
            tablets: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Set the replication position a tablet reports.
    pub fn set_position(&self, tablet: &TabletAlias, group_id: u64) {
        self.tablets.write().entry(tablet.clone()).or_default().position =
            ReplicationPosition::new(group_id);
    }

    /// Set how far a filtered replication stream of a tablet has applied.
    pub fn set_blp_position(&self, tablet: &TabletAlias, uid: u32, group_id: u64) {
        self.tablets
            .write()
            .entry(tablet.clone())
            .or_default()
            .blp_positions
            .insert(uid, ReplicationPosition::new(group_id));
    }

    /// Script a fault for `action` on `tablet`.
    pub fn inject(&self, tablet: &TabletAlias, action: TabletAction, fault: ActionFault) {
        self.faults.write().insert((tablet.clone(), action), fault);
    }

    /// Remove every scripted fault.
    pub fn clear_faults(&self) {
        self.faults.write().clear();
    }

    /// Whether the tablet currently refuses writes.
    pub fn is_read_only(&self, tablet: &TabletAlias) -> bool {
        self.tablets
            .read()
            .get(tablet)
            .map(|s| s.read_only)
            .unwrap_or(false)
    }

    /// Every action received, in arrival order.
    pub fn calls(&self) -> Vec<(TabletAlias, TabletAction)> {
        self.calls.lock().clone()
    }

    /// Tablets that received `action`, in arrival order.
    pub fn calls_for(&self, action: TabletAction) -> Vec<TabletAlias> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, a)| *a == action)
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn fault(&self, tablet: &TabletAlias, action: TabletAction) -> Option<ActionFault> {
        self.faults.read().get(&(tablet.clone(), action)).cloned()
    }

    fn failed(tablet: &TabletAlias, action: TabletAction, reason: &str) -> Error {
        Error::Action {
            target: tablet.to_string(),
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Log the call and apply an `Unreachable` fault.
    fn receive(&self, tablet: &TabletAlias, action: TabletAction) -> Result<()> {
        self.calls.lock().push((tablet.clone(), action));
        match self.fault(tablet, action) {
            Some(ActionFault::Unreachable) => {
                Err(Error::Store(format!("agent for {tablet} is unreachable")))
            }
            _ => Ok(()),
        }
    }

    /// Apply `Fail` and `Hang` faults of a blocking call.
    async fn execute(&self, tablet: &TabletAlias, action: TabletAction, timeout: Duration) -> Result<()> {
        match self.fault(tablet, action) {
            Some(ActionFault::Fail(reason)) => Err(Self::failed(tablet, action, &reason)),
            Some(ActionFault::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(Error::ActionTimeout {
                    target: tablet.to_string(),
                    action: action.to_string(),
                    timeout,
                })
            }
            _ => Ok(()),
        }
    }

    /// Queue an action whose effects apply now; its outcome is reported by
    /// `wait_for_completion`.
    fn queue(&self, tablet: &TabletAlias, action: TabletAction) -> Result<ActionHandle> {
        self.receive(tablet, action)?;
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = ActionHandle::new(format!("/actions/{tablet}/{id:010}"));
        self.pending
            .lock()
            .insert(handle.clone(), (tablet.clone(), action));
        Ok(handle)
    }

    fn update_tablet(&self, alias: &TabletAlias, apply: impl FnOnce(&mut crate::topo::TabletInfo)) -> Result<()> {
        let mut tablet = self
            .topo
            .tablet(alias)
            .ok_or_else(|| Error::NotFound(format!("tablet {alias}")))?;
        apply(&mut tablet);
        self.topo.add_tablet(tablet);
        Ok(())
    }

    fn set_read_only_flag(&self, tablet: &TabletAlias, read_only: bool) {
        self.tablets.write().entry(tablet.clone()).or_default().read_only = read_only;
    }

    fn position(&self, tablet: &TabletAlias) -> ReplicationPosition {
        self.tablets
            .read()
            .get(tablet)
            .map(|s| s.position)
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TabletActions for FakeTabletManager {
    async fn set_read_only(&self, tablet: &TabletAlias) -> Result<ActionHandle> {
        let handle = self.queue(tablet, TabletAction::SetReadOnly)?;
        if self.fault(tablet, TabletAction::SetReadOnly).is_none() {
            self.set_read_only_flag(tablet, true);
        }
        Ok(handle)
    }

    async fn set_read_write(&self, tablet: &TabletAlias) -> Result<ActionHandle> {
        let handle = self.queue(tablet, TabletAction::SetReadWrite)?;
        if self.fault(tablet, TabletAction::SetReadWrite).is_none() {
            self.set_read_only_flag(tablet, false);
        }
        Ok(handle)
    }

    async fn ping(&self, tablet: &TabletAlias) -> Result<ActionHandle> {
        self.queue(tablet, TabletAction::Ping)
    }

    async fn scrap(&self, tablet: &TabletAlias) -> Result<ActionHandle> {
        let handle = self.queue(tablet, TabletAction::Scrap)?;
        if self.fault(tablet, TabletAction::Scrap).is_none() {
            self.update_tablet(tablet, |t| t.tablet_type = TabletType::Scrap)?;
        }
        Ok(handle)
    }

    async fn restart_slave(
        &self,
        tablet: &TabletAlias,
        data: &RestartSlaveData,
    ) -> Result<ActionHandle> {
        let handle = self.queue(tablet, TabletAction::RestartSlave)?;
        if self.fault(tablet, TabletAction::RestartSlave).is_none() {
            self.update_tablet(tablet, |t| t.parent = Some(data.parent.clone()))?;
            self.tablets.write().entry(tablet.clone()).or_default().position = data.position;
        }
        Ok(handle)
    }

    async fn demote_master(
        &self,
        tablet: &TabletAlias,
        timeout: Duration,
    ) -> Result<ReplicationPosition> {
        self.receive(tablet, TabletAction::DemoteMaster)?;
        self.execute(tablet, TabletAction::DemoteMaster, timeout).await?;
        self.set_read_only_flag(tablet, true);
        Ok(self.position(tablet))
    }

    async fn promote_slave(
        &self,
        tablet: &TabletAlias,
        timeout: Duration,
    ) -> Result<RestartSlaveData> {
        self.receive(tablet, TabletAction::PromoteSlave)?;
        self.execute(tablet, TabletAction::PromoteSlave, timeout).await?;
        self.update_tablet(tablet, |t| {
            t.tablet_type = TabletType::Master;
            t.parent = None;
        })?;
        self.set_read_only_flag(tablet, true);
        Ok(RestartSlaveData {
            parent: tablet.clone(),
            position: self.position(tablet),
        })
    }

    async fn master_position(
        &self,
        tablet: &TabletAlias,
        timeout: Duration,
    ) -> Result<ReplicationPosition> {
        self.receive(tablet, TabletAction::MasterPosition)?;
        self.execute(tablet, TabletAction::MasterPosition, timeout).await?;
        Ok(self.position(tablet))
    }

    async fn slave_position(
        &self,
        tablet: &TabletAlias,
        timeout: Duration,
    ) -> Result<ReplicationPosition> {
        self.receive(tablet, TabletAction::SlavePosition)?;
        self.execute(tablet, TabletAction::SlavePosition, timeout).await?;
        Ok(self.position(tablet))
    }

    async fn wait_blp_position(
        &self,
        tablet: &TabletAlias,
        position: &BlpPosition,
        timeout: Duration,
    ) -> Result<()> {
        self.receive(tablet, TabletAction::WaitBlpPosition)?;
        self.execute(tablet, TabletAction::WaitBlpPosition, timeout).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let applied = self
                .tablets
                .read()
                .get(tablet)
                .and_then(|s| s.blp_positions.get(&position.uid).copied());
            if applied.is_some_and(|p| p.has_reached(&position.position)) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ActionTimeout {
                    target: tablet.to_string(),
                    action: TabletAction::WaitBlpPosition.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(BLP_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_completion(&self, handle: &ActionHandle, timeout: Duration) -> Result<()> {
        let queued = self.pending.lock().remove(handle);
        let Some((tablet, action)) = queued else {
            return Err(Error::NotFound(format!("action {}", handle.as_str())));
        };
        self.execute(&tablet, action, timeout).await
    }
}

/// One serving graph rebuild request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServingRebuild {
    /// A keyspace rebuild.
    Keyspace {
        keyspace: String,
        cells: Option<Vec<String>>,
        force: bool,
    },
    /// A single shard rebuild.
    Shard { keyspace: String, shard: String },
}

/// [`ServingGraph`] that records rebuild requests and can be made to fail.
#[derive(Debug, Default)]
pub struct RecordingServingGraph {
    rebuilds: Mutex<Vec<ServingRebuild>>,
    failure: Mutex<Option<String>>,
}

impl RecordingServingGraph {
    /// Create a graph that accepts every rebuild.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent rebuild fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    /// Rebuild requests received, in order.
    pub fn rebuilds(&self) -> Vec<ServingRebuild> {
        self.rebuilds.lock().clone()
    }

    fn record(&self, rebuild: ServingRebuild) -> Result<()> {
        self.rebuilds.lock().push(rebuild);
        match self.failure.lock().as_ref() {
            Some(reason) => Err(Error::Store(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ServingGraph for RecordingServingGraph {
    async fn rebuild_keyspace_graph(
        &self,
        keyspace: &str,
        cells: Option<&[String]>,
        force: bool,
    ) -> Result<()> {
        self.record(ServingRebuild::Keyspace {
            keyspace: keyspace.to_string(),
            cells: cells.map(<[String]>::to_vec),
            force,
        })
    }

    async fn rebuild_shard_graph(&self, keyspace: &str, shard: &str) -> Result<()> {
        self.record(ServingRebuild::Shard {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
        })
    }
}
