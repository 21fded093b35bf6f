//! Pre-reparent checks.
//!
//! A graceful reparent refuses to start unless the shard's replication graph
//! looks sane. The checks sit behind [`ReparentValidator`] so deployments can
//! add their own (hardware health, maintenance windows); [`TopologyValidator`]
//! is the built-in implementation, working purely from the topology records
//! and cheap tablet actions.

use crate::concurrency::{for_each_parallel, ErrorSet};
use crate::error::{Error, Result};
use crate::topo::{TabletInfo, TopoServer};
use crate::types::{TabletAlias, TabletType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::action::{ActionDispatcher, ActionRequest};

/// Delegated pass/fail checks run before a reparent mutates anything.
#[async_trait::async_trait]
pub trait ReparentValidator: Send + Sync + fmt::Debug {
    /// Structural check of one shard. With `ping`, every tablet must also
    /// answer a round trip.
    async fn validate_shard(&self, keyspace: &str, shard: &str, ping: bool) -> Result<()>;

    /// Every slave replicates from `master` and can report a position.
    async fn check_slave_replication(
        &self,
        slaves: &BTreeMap<TabletAlias, TabletInfo>,
        master: &TabletAlias,
    ) -> Result<()>;

    /// The master-elect is fit to take over.
    async fn check_master_elect(&self, tablet: &TabletInfo) -> Result<()>;
}

/// [`ReparentValidator`] backed by the topology store and tablet actions.
#[derive(Debug, Clone)]
pub struct TopologyValidator {
    topo: Arc<dyn TopoServer>,
    dispatcher: ActionDispatcher,
}

impl TopologyValidator {
    /// Create a validator.
    pub fn new(topo: Arc<dyn TopoServer>, dispatcher: ActionDispatcher) -> Self {
        Self { topo, dispatcher }
    }
}

#[async_trait::async_trait]
impl ReparentValidator for TopologyValidator {
    async fn validate_shard(&self, keyspace: &str, shard: &str, ping: bool) -> Result<()> {
        let shard_info = self.topo.get_shard(keyspace, shard).await?;
        let master = shard_info
            .master_alias
            .clone()
            .ok_or_else(|| Error::Validation(format!("shard {keyspace}/{shard} has no master")))?;

        let tablets = self.topo.get_tablet_map(keyspace, shard).await?;
        let errors = ErrorSet::new();

        match tablets.get(&master) {
            None => errors.record_error(Error::Validation(format!(
                "master {master} of {keyspace}/{shard} is not in the tablet map"
            ))),
            Some(t) if t.tablet_type != TabletType::Master => {
                errors.record_error(Error::Validation(format!(
                    "shard master {master} has type {}",
                    t.tablet_type
                )))
            }
            Some(t) if t.parent.is_some() => errors.record_error(Error::Validation(format!(
                "shard master {master} has a parent"
            ))),
            Some(_) => {}
        }

        let live: Vec<&TabletInfo> = tablets
            .values()
            .filter(|t| t.tablet_type != TabletType::Scrap)
            .collect();

        for tablet in &live {
            if tablet.alias == master {
                continue;
            }
            if tablet.tablet_type == TabletType::Master {
                errors.record_error(Error::Validation(format!(
                    "tablet {} claims to be master, shard master is {master}",
                    tablet.alias
                )));
            } else if tablet.tablet_type.is_slave_type() && tablet.parent.as_ref() != Some(&master) {
                errors.record_error(Error::Validation(format!(
                    "tablet {} is not replicating from master {master}",
                    tablet.alias
                )));
            }
        }

        if ping {
            let dispatcher = &self.dispatcher;
            for_each_parallel(live, &errors, |tablet| async move {
                dispatcher.run(&tablet.alias, ActionRequest::Ping).await
            })
            .await;
        }

        errors.result()
    }

    async fn check_slave_replication(
        &self,
        slaves: &BTreeMap<TabletAlias, TabletInfo>,
        master: &TabletAlias,
    ) -> Result<()> {
        let errors = ErrorSet::new();
        let dispatcher = &self.dispatcher;
        for_each_parallel(slaves.values(), &errors, |slave| async move {
            if slave.parent.as_ref() != Some(master) {
                return Err(Error::Validation(format!(
                    "slave {} has parent {:?}, expected {master}",
                    slave.alias,
                    slave.parent.as_ref().map(|p| p.to_string())
                )));
            }
            if slave.tablet_type.is_restartable() {
                dispatcher.slave_position(&slave.alias).await?;
            }
            Ok(())
        })
        .await;
        errors.result()
    }

    async fn check_master_elect(&self, tablet: &TabletInfo) -> Result<()> {
        match tablet.tablet_type {
            TabletType::Backup | TabletType::Restore => Err(Error::Validation(format!(
                "master elect {} is busy ({})",
                tablet.alias, tablet.tablet_type
            ))),
            t if t.is_restartable() => Ok(()),
            t => Err(Error::Validation(format!(
                "master elect {} has ineligible type {t}",
                tablet.alias
            ))),
        }
    }
}
