//! Action descriptors and the remote tablet action primitive.
//!
//! An [`ActionNode`] describes a cluster action while it holds a lock; it is
//! serialized into the lock when acquired and finalized when released.
//!
//! [`TabletActions`] is the agent RPC surface. [`ActionDispatcher`] wraps it
//! with per-action deadlines and uniform error reporting: whether the agent
//! was unreachable or the action failed while running, callers see an
//! [`Error::Action`] or [`Error::ActionTimeout`] naming the tablet and action.

use crate::error::{Error, Result};
use crate::metrics::WranglerMetrics;
use crate::types::{BlpPosition, ReplicationPosition, RestartSlaveData, TabletAlias, TabletType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Extra time granted on top of the remote deadline before the dispatcher
/// gives up on an agent that never answers.
const LOCAL_DEADLINE_SLACK: Duration = Duration::from_millis(250);

/// Lifecycle state of an action holding a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Lock held, action in progress.
    Running,
    /// Action finished cleanly.
    Done,
    /// Action finished with an error.
    Failed,
}

/// Cluster-level actions that take topology locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionName {
    /// Served-type migration between shards.
    MigrateServedTypes,
    /// Graceful master reparent of one shard.
    ReparentShard,
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionName::MigrateServedTypes => write!(f, "MigrateServedTypes"),
            ActionName::ReparentShard => write!(f, "ReparentShard"),
        }
    }
}

/// Descriptor of an in-flight cluster action, attached to its locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNode {
    /// Unique id of this action instance.
    pub guid: Uuid,
    /// What is being done.
    pub action: ActionName,
    /// Action arguments, for observers.
    pub args: BTreeMap<String, String>,
    /// Current state.
    pub state: ActionState,
    /// Failure message once `state` is `Failed`.
    pub error: Option<String>,
    /// Creation time (unix millis).
    pub started_at_ms: u64,
}

impl ActionNode {
    /// Create a running descriptor with no arguments.
    pub fn new(action: ActionName) -> Self {
        Self {
            guid: Uuid::new_v4(),
            action,
            args: BTreeMap::new(),
            state: ActionState::Running,
            error: None,
            started_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.insert(key.into(), value.to_string());
        self
    }

    /// Descriptor for a served-type migration.
    pub fn migrate_served_types(served_type: TabletType, reverse: bool) -> Self {
        Self::new(ActionName::MigrateServedTypes)
            .with_arg("served_type", served_type)
            .with_arg("reverse", reverse)
    }

    /// Descriptor for a graceful reparent.
    pub fn reparent_shard(master_elect: &TabletAlias, leave_master_read_only: bool) -> Self {
        Self::new(ActionName::ReparentShard)
            .with_arg("master_elect", master_elect)
            .with_arg("leave_master_read_only", leave_master_read_only)
    }

    /// Record the action's outcome.
    pub fn finish(&mut self, outcome: Option<&Error>) {
        match outcome {
            Some(e) => {
                self.state = ActionState::Failed;
                self.error = Some(e.to_string());
            }
            None => {
                self.state = ActionState::Done;
                self.error = None;
            }
        }
    }

    /// Serialize for storage in a lock.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a descriptor read back from a lock.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Handle of an asynchronously running tablet action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionHandle(String);

impl ActionHandle {
    /// Wrap an agent-specific action path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The action path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Kinds of remote tablet actions, for error reporting and test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TabletAction {
    SetReadOnly,
    SetReadWrite,
    Ping,
    Scrap,
    DemoteMaster,
    PromoteSlave,
    RestartSlave,
    MasterPosition,
    SlavePosition,
    WaitBlpPosition,
}

impl fmt::Display for TabletAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TabletAction::SetReadOnly => "SetReadOnly",
            TabletAction::SetReadWrite => "SetReadWrite",
            TabletAction::Ping => "Ping",
            TabletAction::Scrap => "Scrap",
            TabletAction::DemoteMaster => "DemoteMaster",
            TabletAction::PromoteSlave => "PromoteSlave",
            TabletAction::RestartSlave => "RestartSlave",
            TabletAction::MasterPosition => "MasterPosition",
            TabletAction::SlavePosition => "SlavePosition",
            TabletAction::WaitBlpPosition => "WaitBlpPosition",
        };
        f.write_str(name)
    }
}

/// Remote operations executed by tablet agents.
///
/// Handle-returning calls only queue the action; its outcome arrives through
/// [`wait_for_completion`](TabletActions::wait_for_completion). The other
/// calls block on the agent and are given a deadline directly.
#[async_trait::async_trait]
pub trait TabletActions: Send + Sync + fmt::Debug {
    /// Stop accepting writes.
    async fn set_read_only(&self, tablet: &TabletAlias) -> Result<ActionHandle>;

    /// Start accepting writes.
    async fn set_read_write(&self, tablet: &TabletAlias) -> Result<ActionHandle>;

    /// No-op round trip. Forces the agent to reload its shard record, which
    /// also stops filtered replication on a destination master.
    async fn ping(&self, tablet: &TabletAlias) -> Result<ActionHandle>;

    /// Retire the tablet.
    async fn scrap(&self, tablet: &TabletAlias) -> Result<ActionHandle>;

    /// Point a slave at a new master.
    async fn restart_slave(
        &self,
        tablet: &TabletAlias,
        data: &RestartSlaveData,
    ) -> Result<ActionHandle>;

    /// Make a master read-only and return its final replication position.
    async fn demote_master(
        &self,
        tablet: &TabletAlias,
        timeout: Duration,
    ) -> Result<ReplicationPosition>;

    /// Turn a slave into the master, returning what the other slaves need
    /// to replicate from it.
    async fn promote_slave(&self, tablet: &TabletAlias, timeout: Duration)
        -> Result<RestartSlaveData>;

    /// Current position of a master.
    async fn master_position(
        &self,
        tablet: &TabletAlias,
        timeout: Duration,
    ) -> Result<ReplicationPosition>;

    /// Position a slave has applied up to.
    async fn slave_position(
        &self,
        tablet: &TabletAlias,
        timeout: Duration,
    ) -> Result<ReplicationPosition>;

    /// Block until the tablet's filtered replication stream `position.uid`
    /// has reached `position.position`.
    async fn wait_blp_position(
        &self,
        tablet: &TabletAlias,
        position: &BlpPosition,
        timeout: Duration,
    ) -> Result<()>;

    /// Block until a queued action has finished, returning its error.
    async fn wait_for_completion(&self, handle: &ActionHandle, timeout: Duration) -> Result<()>;
}

/// Handle-returning actions the dispatcher can run to completion.
#[derive(Debug, Clone, Copy)]
pub enum ActionRequest<'a> {
    SetReadOnly,
    SetReadWrite,
    Ping,
    Scrap,
    RestartSlave(&'a RestartSlaveData),
}

impl ActionRequest<'_> {
    /// Kind of this request.
    pub fn kind(&self) -> TabletAction {
        match self {
            ActionRequest::SetReadOnly => TabletAction::SetReadOnly,
            ActionRequest::SetReadWrite => TabletAction::SetReadWrite,
            ActionRequest::Ping => TabletAction::Ping,
            ActionRequest::Scrap => TabletAction::Scrap,
            ActionRequest::RestartSlave(_) => TabletAction::RestartSlave,
        }
    }
}

/// Single remote action, bounded by a deadline. The unit of fan-out.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    actions: Arc<dyn TabletActions>,
    timeout: Duration,
    metrics: Arc<WranglerMetrics>,
}

impl ActionDispatcher {
    /// Create a dispatcher with the given per-action timeout.
    pub fn new(
        actions: Arc<dyn TabletActions>,
        timeout: Duration,
        metrics: Arc<WranglerMetrics>,
    ) -> Self {
        Self {
            actions,
            timeout,
            metrics,
        }
    }

    /// The per-action timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Queue an action on a tablet.
    pub async fn invoke(
        &self,
        tablet: &TabletAlias,
        request: ActionRequest<'_>,
    ) -> Result<ActionHandle> {
        let actions = &self.actions;
        self.guard(tablet, request.kind(), self.timeout, async move {
            match request {
                ActionRequest::SetReadOnly => actions.set_read_only(tablet).await,
                ActionRequest::SetReadWrite => actions.set_read_write(tablet).await,
                ActionRequest::Ping => actions.ping(tablet).await,
                ActionRequest::Scrap => actions.scrap(tablet).await,
                ActionRequest::RestartSlave(data) => actions.restart_slave(tablet, data).await,
            }
        })
        .await
    }

    /// Wait for a queued action to finish.
    pub async fn await_completion(
        &self,
        tablet: &TabletAlias,
        kind: TabletAction,
        handle: &ActionHandle,
    ) -> Result<()> {
        self.guard_remote(
            tablet,
            kind,
            self.actions.wait_for_completion(handle, self.timeout),
        )
        .await
    }

    /// Queue an action and wait for it to finish.
    pub async fn run(&self, tablet: &TabletAlias, request: ActionRequest<'_>) -> Result<()> {
        let handle = self.invoke(tablet, request).await?;
        self.await_completion(tablet, request.kind(), &handle).await
    }

    /// Demote a master, returning its final position.
    pub async fn demote_master(&self, tablet: &TabletAlias) -> Result<ReplicationPosition> {
        self.guard_remote(
            tablet,
            TabletAction::DemoteMaster,
            self.actions.demote_master(tablet, self.timeout),
        )
        .await
    }

    /// Promote a slave to master.
    pub async fn promote_slave(&self, tablet: &TabletAlias) -> Result<RestartSlaveData> {
        self.guard_remote(
            tablet,
            TabletAction::PromoteSlave,
            self.actions.promote_slave(tablet, self.timeout),
        )
        .await
    }

    /// Current position of a master.
    pub async fn master_position(&self, tablet: &TabletAlias) -> Result<ReplicationPosition> {
        self.guard_remote(
            tablet,
            TabletAction::MasterPosition,
            self.actions.master_position(tablet, self.timeout),
        )
        .await
    }

    /// Current position of a slave.
    pub async fn slave_position(&self, tablet: &TabletAlias) -> Result<ReplicationPosition> {
        self.guard_remote(
            tablet,
            TabletAction::SlavePosition,
            self.actions.slave_position(tablet, self.timeout),
        )
        .await
    }

    /// Wait for a filtered replication stream to catch up.
    pub async fn wait_blp_position(&self, tablet: &TabletAlias, position: &BlpPosition) -> Result<()> {
        self.guard_remote(
            tablet,
            TabletAction::WaitBlpPosition,
            self.actions.wait_blp_position(tablet, position, self.timeout),
        )
        .await
    }

    /// Guard a call that carries the remote deadline itself.
    async fn guard_remote<T>(
        &self,
        tablet: &TabletAlias,
        kind: TabletAction,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.guard(tablet, kind, self.timeout + LOCAL_DEADLINE_SLACK, call)
            .await
    }

    async fn guard<T>(
        &self,
        tablet: &TabletAlias,
        kind: TabletAction,
        deadline: Duration,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.metrics.actions_dispatched.inc();
        let outcome = match tokio::time::timeout(deadline, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_action_error() => Err(e),
            Ok(Err(e)) => Err(Error::Action {
                target: tablet.to_string(),
                action: kind.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ActionTimeout {
                target: tablet.to_string(),
                action: kind.to_string(),
                timeout: self.timeout,
            }),
        };
        if let Err(e) = &outcome {
            self.metrics.actions_failed.inc();
            tracing::debug!(tablet = %tablet, action = %kind, error = %e, "Tablet action failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ActionFault, FakeTabletManager};
    use crate::topo::MemoryTopo;

    #[test]
    fn test_action_node_finish() {
        let mut node = ActionNode::migrate_served_types(TabletType::Rdonly, false);
        assert_eq!(node.state, ActionState::Running);
        assert_eq!(node.args.get("served_type").map(String::as_str), Some("rdonly"));
        assert_eq!(node.args.get("reverse").map(String::as_str), Some("false"));

        node.finish(Some(&Error::Store("zk gone".to_string())));
        assert_eq!(node.state, ActionState::Failed);
        assert!(node.error.as_deref().unwrap().contains("zk gone"));

        node.finish(None);
        assert_eq!(node.state, ActionState::Done);
        assert!(node.error.is_none());
    }

    #[test]
    fn test_action_node_json() {
        let node = ActionNode::reparent_shard(&TabletAlias::new("nyc", 2), true);
        let json = node.to_json().unwrap();
        assert!(json.contains("\"ReparentShard\""));
        assert!(json.contains("\"running\""));
        assert_eq!(ActionNode::from_json(&json).unwrap(), node);
    }

    #[test]
    fn test_request_kind() {
        let data = RestartSlaveData {
            parent: TabletAlias::new("nyc", 1),
            position: ReplicationPosition::new(3),
        };
        assert_eq!(ActionRequest::RestartSlave(&data).kind(), TabletAction::RestartSlave);
        assert_eq!(ActionRequest::Ping.kind().to_string(), "Ping");
    }

    fn dispatcher_with_agent() -> (Arc<FakeTabletManager>, ActionDispatcher, Arc<WranglerMetrics>) {
        let agent = Arc::new(FakeTabletManager::new(Arc::new(MemoryTopo::new())));
        let metrics = Arc::new(WranglerMetrics::new());
        let dispatcher = ActionDispatcher::new(
            agent.clone(),
            Duration::from_millis(20),
            Arc::clone(&metrics),
        );
        (agent, dispatcher, metrics)
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_an_action_error() {
        let (agent, dispatcher, metrics) = dispatcher_with_agent();
        let tablet = TabletAlias::new("nyc", 1);
        agent.inject(&tablet, TabletAction::SetReadOnly, ActionFault::Unreachable);

        match dispatcher.run(&tablet, ActionRequest::SetReadOnly).await.unwrap_err() {
            Error::Action { target, action, .. } => {
                assert_eq!(target, tablet.to_string());
                assert_eq!(action, "SetReadOnly");
            }
            other => panic!("expected action error, got {other:?}"),
        }
        assert_eq!(agent.calls_for(TabletAction::SetReadOnly).len(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.actions_dispatched, 1);
        assert_eq!(snapshot.actions_failed, 1);
    }

    #[tokio::test]
    async fn test_execution_failure_surfaces_on_completion() {
        let (agent, dispatcher, _) = dispatcher_with_agent();
        let tablet = TabletAlias::new("nyc", 2);
        agent.inject(&tablet, TabletAction::Ping, ActionFault::Fail("crashed".to_string()));

        let handle = dispatcher.invoke(&tablet, ActionRequest::Ping).await.unwrap();
        let err = dispatcher
            .await_completion(&tablet, TabletAction::Ping, &handle)
            .await
            .unwrap_err();
        assert!(err.is_action_error());
        assert!(err.to_string().contains("crashed"));
    }

    #[tokio::test]
    async fn test_hung_action_times_out() {
        let (agent, dispatcher, _) = dispatcher_with_agent();
        let tablet = TabletAlias::new("nyc", 3);
        agent.inject(&tablet, TabletAction::MasterPosition, ActionFault::Hang);

        let err = dispatcher.master_position(&tablet).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_action_error());
    }
}
