//! Served-type migration between a source shard and its destinations.
//!
//! # Protocol
//!
//! ```text
//! Validating ──► Locking ──► Mutating ──┬──────────────────► Persisting
//!                                       │ (master only)          ▲
//!                                       └──► MasterCutover ──────┘
//!
//! Persisting ──► Unlocking ──► RebuildingGraph ──► Done | Failed
//! ```
//!
//! - **Validating** runs before any lock is taken and never writes.
//! - **Mutating** re-reads every shard under lock and applies the pure
//!   [`migrate_source_served_types`] / [`migrate_destination_served_types`]
//!   transforms in memory.
//! - **MasterCutover** makes the source masters read-only, captures their
//!   positions and waits for every destination stream to reach them. Only
//!   then are the destinations' source lists cleared.
//! - **Persisting** writes sources, then destinations. A failure partway
//!   leaves the earlier writes in place.
//! - **Unlocking** always runs, in reverse lock order.
//! - **RebuildingGraph** only runs when everything before it was clean.
//!
//! Nothing is rolled back. A source master made read-only by a cutover that
//! then failed stays read-only.

use crate::concurrency::ErrorSet;
use crate::error::{Error, Result};
use crate::metrics::OperationKind;
use crate::topo::{ShardInfo, ShardKey};
use crate::types::TabletType;
use std::fmt;
use std::time::Instant;

use super::action::ActionNode;
use super::lock::ShardLockPlan;
use super::Wrangler;

/// Step of a served-type migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Checking direction, role and destinations.
    Validating,
    /// Taking the shard locks.
    Locking,
    /// Re-reading and mutating shard records in memory.
    Mutating,
    /// Draining writes from the source masters into the destinations.
    MasterCutover,
    /// Writing the shard records back.
    Persisting,
    /// Releasing the shard locks.
    Unlocking,
    /// Rebuilding the keyspace serving graph.
    RebuildingGraph,
    /// Migration finished cleanly.
    Done,
    /// Migration failed.
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Validating => write!(f, "validating"),
            MigrationState::Locking => write!(f, "locking"),
            MigrationState::Mutating => write!(f, "mutating"),
            MigrationState::MasterCutover => write!(f, "master_cutover"),
            MigrationState::Persisting => write!(f, "persisting"),
            MigrationState::Unlocking => write!(f, "unlocking"),
            MigrationState::RebuildingGraph => write!(f, "rebuilding_graph"),
            MigrationState::Done => write!(f, "done"),
            MigrationState::Failed => write!(f, "failed"),
        }
    }
}

impl MigrationState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Done | MigrationState::Failed)
    }
}

/// Tracks and logs the state of one migration run.
#[derive(Debug)]
struct MigrationRun<'a> {
    source: &'a ShardKey,
    served_type: TabletType,
    state: MigrationState,
}

impl<'a> MigrationRun<'a> {
    fn new(source: &'a ShardKey, served_type: TabletType) -> Self {
        Self {
            source,
            served_type,
            state: MigrationState::Validating,
        }
    }

    fn advance(&mut self, next: MigrationState) {
        tracing::info!(
            source = %self.source,
            served_type = %self.served_type,
            from = %self.state,
            to = %next,
            "Migration state change"
        );
        self.state = next;
    }
}

/// Apply a migration to a source shard record.
///
/// Forward removes `served_type`, reverse adds it back. Fails without
/// touching the record when the role is not where the direction expects.
pub fn migrate_source_served_types(
    mut shard: ShardInfo,
    served_type: TabletType,
    reverse: bool,
) -> Result<ShardInfo> {
    let changed = if reverse {
        shard.served_types.insert(served_type)
    } else {
        shard.served_types.remove(served_type)
    };
    if !changed {
        let why = if reverse { "already serving" } else { "not serving" };
        return Err(Error::Precondition(format!(
            "source shard {} is {why} type {served_type}",
            shard.key()
        )));
    }
    Ok(shard)
}

/// Apply a migration to a destination shard record.
///
/// Forward adds `served_type`, reverse removes it.
pub fn migrate_destination_served_types(
    mut shard: ShardInfo,
    served_type: TabletType,
    reverse: bool,
) -> Result<ShardInfo> {
    let changed = if reverse {
        shard.served_types.remove(served_type)
    } else {
        shard.served_types.insert(served_type)
    };
    if !changed {
        let why = if reverse { "not serving" } else { "already serving" };
        return Err(Error::Precondition(format!(
            "destination shard {} is {why} type {served_type}",
            shard.key()
        )));
    }
    Ok(shard)
}

impl Wrangler {
    /// Move `served_type` from the source shard `keyspace/shard` to every
    /// shard replicating from it, or back again with `reverse`.
    ///
    /// Migrating the master role drains the source masters into the
    /// destinations before the switch and cannot be reversed.
    pub async fn migrate_served_types(
        &self,
        keyspace: &str,
        shard: &str,
        served_type: TabletType,
        reverse: bool,
    ) -> Result<()> {
        let started = Instant::now();
        self.metrics.record_start(OperationKind::Migration);
        let source = ShardKey::new(keyspace, shard);
        let mut run = MigrationRun::new(&source, served_type);

        let result = self.run_migration(&mut run, reverse).await;

        match &result {
            Ok(()) => run.advance(MigrationState::Done),
            Err(e) => {
                tracing::warn!(source = %source, served_type = %served_type, error = %e, "Migration failed");
                run.advance(MigrationState::Failed);
            }
        }
        self.metrics
            .record_end(OperationKind::Migration, started.elapsed(), result.is_ok());
        result
    }

    async fn run_migration(&self, run: &mut MigrationRun<'_>, reverse: bool) -> Result<()> {
        let source = run.source;
        let served_type = run.served_type;

        if !served_type.is_served_type() {
            return Err(Error::Precondition(format!(
                "{served_type} is not a type a shard can serve"
            )));
        }
        // A finished master migration leaves the sources dead.
        if reverse && served_type == TabletType::Master {
            return Err(Error::Precondition(format!(
                "cannot migrate master back to {source}"
            )));
        }

        let destinations = self.find_destination_shards(source).await?;
        if destinations.is_empty() {
            return Err(Error::Precondition(format!(
                "cannot find any destination shard replicating from {source}"
            )));
        }

        let source_info = self.topo.get_shard(&source.keyspace, &source.shard).await?;
        let serving = source_info.served_types.contains(served_type);
        if reverse && serving {
            return Err(Error::Precondition(format!(
                "source shard {source} is already serving type {served_type}"
            )));
        }
        if !reverse && !serving {
            return Err(Error::Precondition(format!(
                "source shard {source} is not serving type {served_type}"
            )));
        }
        if served_type == TabletType::Master && source_info.served_types.len() > 1 {
            return Err(Error::Precondition(format!(
                "cannot migrate master out of {source} until everything else is migrated out"
            )));
        }

        let sources = vec![source.clone()];
        let destinations: Vec<ShardKey> = destinations.iter().map(ShardInfo::key).collect();

        run.advance(MigrationState::Locking);
        let mut node = ActionNode::migrate_served_types(served_type, reverse);
        let held = ShardLockPlan::new(sources.clone(), destinations.clone())
            .acquire(&self.locks, &node)
            .await?;

        let errors = ErrorSet::new();
        let outcome = self
            .migrate_served_types_locked(run, &sources, &destinations, reverse)
            .await;
        errors.record(outcome.clone());

        run.advance(MigrationState::Unlocking);
        held.release(&self.locks, &mut node, outcome.as_ref().err(), &errors)
            .await;

        if errors.is_empty() {
            run.advance(MigrationState::RebuildingGraph);
            errors.record(
                self.serving_graph
                    .rebuild_keyspace_graph(
                        &source.keyspace,
                        self.config.rebuild_cells.as_deref(),
                        self.config.force_rebuild,
                    )
                    .await,
            );
        }

        errors.result()
    }

    /// Shards of the source's keyspace that declare a filtered replication
    /// stream from it, sorted by name.
    pub async fn find_destination_shards(&self, source: &ShardKey) -> Result<Vec<ShardInfo>> {
        let mut destinations = Vec::new();
        for name in self.topo.get_shard_names(&source.keyspace).await? {
            let shard = self.topo.get_shard(&source.keyspace, &name).await?;
            if shard.replicates_from(source) {
                tracing::info!(destination = %shard.key(), source = %source, "Found destination shard");
                destinations.push(shard);
            }
        }
        destinations.sort_by(|a, b| a.shard_name().cmp(b.shard_name()));
        Ok(destinations)
    }

    /// Mutate, cut over and persist, with every shard locked.
    async fn migrate_served_types_locked(
        &self,
        run: &mut MigrationRun<'_>,
        sources: &[ShardKey],
        destinations: &[ShardKey],
        reverse: bool,
    ) -> Result<()> {
        let served_type = run.served_type;

        run.advance(MigrationState::Mutating);
        let mut source_shards = Vec::with_capacity(sources.len());
        for key in sources {
            let fresh = self.topo.get_shard(&key.keyspace, &key.shard).await?;
            source_shards.push(migrate_source_served_types(fresh, served_type, reverse)?);
        }
        let mut destination_shards = Vec::with_capacity(destinations.len());
        for key in destinations {
            let fresh = self.topo.get_shard(&key.keyspace, &key.shard).await?;
            destination_shards.push(migrate_destination_served_types(
                fresh,
                served_type,
                reverse,
            )?);
        }

        if served_type == TabletType::Master {
            run.advance(MigrationState::MasterCutover);
            self.make_masters_read_only(&source_shards).await?;
            let positions = self.get_masters_position(&source_shards).await?;
            self.wait_for_filtered_replication(&positions, &destination_shards)
                .await?;
            for shard in &mut destination_shards {
                shard.source_shards.clear();
            }
        }

        run.advance(MigrationState::Persisting);
        let mut persisted: Vec<String> = Vec::new();
        for shard in source_shards.iter().chain(destination_shards.iter()) {
            if let Err(e) = self.topo.update_shard(shard).await {
                if !persisted.is_empty() {
                    tracing::error!(
                        shard = %shard.key(),
                        persisted = ?persisted,
                        error = %e,
                        "Shard records partially updated, manual recovery required"
                    );
                }
                return Err(Error::Persistence {
                    keyspace: shard.keyspace().to_string(),
                    shard: shard.shard_name().to_string(),
                    reason: e.to_string(),
                });
            }
            persisted.push(shard.key().to_string());
        }

        // The ping also stops filtered replication on the new masters.
        if served_type == TabletType::Master {
            self.make_masters_read_write(&destination_shards).await?;
        }
        Ok(())
    }
}
