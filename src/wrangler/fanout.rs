//! Batch operations over the masters of a set of shards.
//!
//! Each runs one dispatcher call per shard concurrently and joins them all
//! before returning. The result is the reduced [`ErrorSet`]; an error means at
//! least one master failed, and nothing can be assumed about the others.

use crate::concurrency::{for_each_parallel, ErrorSet};
use crate::error::{Error, Result};
use crate::topo::{ShardInfo, ShardKey};
use crate::types::{BlpPosition, ReplicationPosition, TabletAlias};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::action::ActionRequest;
use super::Wrangler;

fn master_of(shard: &ShardInfo) -> Result<&TabletAlias> {
    shard.master_alias.as_ref().ok_or_else(|| {
        Error::Precondition(format!(
            "shard {}/{} has no master",
            shard.keyspace(),
            shard.shard_name()
        ))
    })
}

impl Wrangler {
    /// Set every shard master read-only.
    ///
    /// A shard without a master is a failure for that shard only.
    pub async fn make_masters_read_only(&self, shards: &[ShardInfo]) -> Result<()> {
        let errors = ErrorSet::new();
        for_each_parallel(shards, &errors, |shard| async move {
            let master = master_of(shard)?;
            tracing::info!(master = %master, "Making master read-only");
            self.dispatcher.run(master, ActionRequest::SetReadOnly).await?;
            tracing::info!(master = %master, "Master is read-only");
            Ok(())
        })
        .await;
        errors.result()
    }

    /// Current replication position of every shard master.
    ///
    /// On error the positions that were collected are discarded.
    pub async fn get_masters_position(
        &self,
        shards: &[ShardInfo],
    ) -> Result<HashMap<ShardKey, ReplicationPosition>> {
        let positions = Mutex::new(HashMap::with_capacity(shards.len()));
        let errors = ErrorSet::new();
        for_each_parallel(shards, &errors, |shard| {
            let positions = &positions;
            async move {
                let master = master_of(shard)?;
                tracing::info!(master = %master, "Gathering master position");
                let tablet = self.topo.get_tablet(master).await?;
                let position = self.dispatcher.master_position(&tablet.alias).await?;
                tracing::info!(master = %master, position = %position, "Got master position");
                positions.lock().insert(shard.key(), position);
                Ok(())
            }
        })
        .await;
        errors.result()?;
        Ok(positions.into_inner())
    }

    /// Wait until every destination's filtered replication streams have
    /// reached the matching source positions.
    ///
    /// Destinations are waited on in parallel; the streams of one
    /// destination one after another, each failure recorded on its own.
    pub async fn wait_for_filtered_replication(
        &self,
        source_positions: &HashMap<ShardKey, ReplicationPosition>,
        destinations: &[ShardInfo],
    ) -> Result<()> {
        let errors = ErrorSet::new();
        for_each_parallel(destinations, &errors, |dest| {
            let errors = &errors;
            async move {
                let master = master_of(dest)?;
                for source in &dest.source_shards {
                    let Some(position) = source_positions.get(&source.key()) else {
                        errors.record_error(Error::Precondition(format!(
                            "no master position captured for {}, source of {}",
                            source.key(),
                            dest.key()
                        )));
                        continue;
                    };
                    let target = BlpPosition {
                        uid: source.uid,
                        position: *position,
                    };
                    tracing::info!(master = %master, uid = source.uid, position = %position, "Waiting for filtered replication to catch up");
                    match self.dispatcher.wait_blp_position(master, &target).await {
                        Ok(()) => tracing::info!(master = %master, uid = source.uid, "Caught up"),
                        Err(e) => errors.record_error(e),
                    }
                }
                Ok(())
            }
        })
        .await;
        errors.result()
    }

    /// Resynchronize every shard master through a ping. The agent reloads
    /// its shard record, which turns a destination master read-write and
    /// stops its filtered replication once `source_shards` is empty.
    pub async fn make_masters_read_write(&self, shards: &[ShardInfo]) -> Result<()> {
        let errors = ErrorSet::new();
        for_each_parallel(shards, &errors, |shard| async move {
            let master = master_of(shard)?;
            tracing::info!(master = %master, "Pinging master");
            self.dispatcher.run(master, ActionRequest::Ping).await?;
            tracing::info!(master = %master, "Master responded");
            Ok(())
        })
        .await;
        errors.result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tablet_alias, ActionFault, WranglerFixture, INITIAL_POSITION};
    use crate::wrangler::TabletAction;

    #[tokio::test]
    async fn test_missing_master_fails_only_its_shard() {
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");
        let shards = vec![
            fixture.topo.shard("ks", "-80").unwrap(),
            ShardInfo::new("ks", "orphan"),
            fixture.topo.shard("ks", "80-").unwrap(),
        ];

        let err = fixture.wrangler.make_masters_read_only(&shards).await.unwrap_err();
        assert!(err.to_string().contains("orphan"));
        for (_, master) in &split.destinations {
            assert!(fixture.agent.is_read_only(master));
        }
    }

    #[tokio::test]
    async fn test_positions_keyed_by_shard() {
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");
        fixture.agent.set_position(&split.source_master, 42);
        let source = fixture.topo.shard("ks", "0").unwrap();

        let positions = fixture
            .wrangler
            .get_masters_position(std::slice::from_ref(&source))
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[&split.source], ReplicationPosition::new(42));
    }

    #[tokio::test]
    async fn test_every_stream_failure_is_kept() {
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");
        let dest_master = &split.destinations[0].1;

        // A second stream from a shard whose position was never captured.
        let mut dest = fixture.topo.shard("ks", "-80").unwrap();
        dest.source_shards
            .push(crate::topo::SourceShard::new(1, "ks", "elsewhere"));
        fixture
            .agent
            .inject(dest_master, TabletAction::WaitBlpPosition, ActionFault::Fail("stream stopped".to_string()));

        let positions =
            HashMap::from([(split.source.clone(), ReplicationPosition::new(INITIAL_POSITION))]);
        let err = fixture
            .wrangler
            .wait_for_filtered_replication(&positions, &[dest])
            .await
            .unwrap_err();
        match err {
            Error::Aggregate(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].is_action_error());
                assert!(errors[1].is_precondition());
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_write_pings_every_master() {
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");
        let shards = vec![
            fixture.topo.shard("ks", "-80").unwrap(),
            fixture.topo.shard("ks", "80-").unwrap(),
        ];

        fixture.wrangler.make_masters_read_write(&shards).await.unwrap();
        let mut pinged = fixture.agent.calls_for(TabletAction::Ping);
        pinged.sort();
        assert_eq!(pinged, vec![tablet_alias(200), tablet_alias(300)]);
    }
}
