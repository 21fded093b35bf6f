//! Served-type migration scenarios.
//!
//! | Scenario                        | Verification                                   |
//! |---------------------------------|------------------------------------------------|
//! | Forward replica migration       | Role moves, lock order, keyspace rebuild       |
//! | Full split                      | rdonly, replica, master in turn; cutover       |
//! | Destination never catches up    | Times out, source still serves master          |
//! | Rejected migrations             | Fail before any lock or write                  |
//! | Persistence failure             | Partial writes, locks released, no rebuild     |
//! | Lock contention                 | Times out, earlier locks stay held             |
//! | Concurrent migrations           | Serialize on the source lock, both succeed     |

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::testing::{ActionFault, ServingRebuild, WranglerFixture, INITIAL_POSITION};
    use crate::topo::{LockEvent, LockScope, ShardKey, TopoServer};
    use crate::types::TabletType;
    use crate::wrangler::{ActionNode, ActionState, TabletAction};
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init();
    }

    fn served(fixture: &WranglerFixture, shard: &str) -> Vec<TabletType> {
        fixture
            .topo
            .shard("ks", shard)
            .unwrap()
            .served_types
            .as_slice()
            .to_vec()
    }

    fn shard_scope(shard: &str) -> LockScope {
        LockScope::Shard(ShardKey::new("ks", shard))
    }

    #[tokio::test]
    async fn test_forward_replica_migration() {
        init_tracing();
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");

        fixture
            .wrangler
            .migrate_served_types("ks", "0", TabletType::Replica, false)
            .await
            .unwrap();

        assert_eq!(served(&fixture, "0"), vec![TabletType::Master, TabletType::Rdonly]);
        assert_eq!(served(&fixture, "-80"), vec![TabletType::Replica]);
        assert_eq!(served(&fixture, "80-"), vec![TabletType::Replica]);

        // Sources first, then destinations by name; release in reverse.
        assert_eq!(
            fixture.topo.lock_events(),
            vec![
                LockEvent::Acquired(shard_scope("0")),
                LockEvent::Acquired(shard_scope("-80")),
                LockEvent::Acquired(shard_scope("80-")),
                LockEvent::Released(shard_scope("80-")),
                LockEvent::Released(shard_scope("-80")),
                LockEvent::Released(shard_scope("0")),
            ]
        );

        assert_eq!(
            fixture.serving_graph.rebuilds(),
            vec![ServingRebuild::Keyspace {
                keyspace: "ks".to_string(),
                cells: None,
                force: true,
            }]
        );

        // Only the master role needs the tablets.
        assert!(fixture.agent.calls().is_empty());

        let results = fixture.topo.last_unlock_results(&shard_scope("0")).unwrap();
        assert_eq!(ActionNode::from_json(&results).unwrap().state, ActionState::Done);

        let metrics = fixture.wrangler.metrics().snapshot();
        assert_eq!(metrics.migrations_completed, 1);
        assert_eq!(metrics.locks_acquired, 3);
        assert_eq!(metrics.locks_released, 3);
    }

    #[tokio::test]
    async fn test_reverse_migration_restores_source() {
        init_tracing();
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");
        let wrangler = &fixture.wrangler;

        wrangler
            .migrate_served_types("ks", "0", TabletType::Rdonly, false)
            .await
            .unwrap();
        wrangler
            .migrate_served_types("ks", "0", TabletType::Rdonly, true)
            .await
            .unwrap();

        assert_eq!(
            served(&fixture, "0"),
            vec![TabletType::Master, TabletType::Replica, TabletType::Rdonly]
        );
        assert!(served(&fixture, "-80").is_empty());
        assert!(served(&fixture, "80-").is_empty());
    }

    #[tokio::test]
    async fn test_full_split_with_master_cutover() {
        init_tracing();
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");
        let wrangler = &fixture.wrangler;

        for served_type in [TabletType::Rdonly, TabletType::Replica, TabletType::Master] {
            wrangler
                .migrate_served_types("ks", "0", served_type, false)
                .await
                .unwrap();
        }

        assert!(served(&fixture, "0").is_empty());
        for (key, master) in &split.destinations {
            let dest = fixture.topo.shard("ks", &key.shard).unwrap();
            assert_eq!(
                dest.served_types.as_slice(),
                &[TabletType::Rdonly, TabletType::Replica, TabletType::Master]
            );
            assert!(dest.source_shards.is_empty());
            assert!(!fixture.agent.is_read_only(master));
        }
        assert!(fixture.agent.is_read_only(&split.source_master));

        // Cutover order: freeze source, read its position, drain, then resync.
        let actions: Vec<TabletAction> = fixture.agent.calls().into_iter().map(|(_, a)| a).collect();
        let first = |action| actions.iter().position(|a| *a == action).unwrap();
        assert!(first(TabletAction::SetReadOnly) < first(TabletAction::MasterPosition));
        assert!(first(TabletAction::MasterPosition) < first(TabletAction::WaitBlpPosition));
        assert!(first(TabletAction::WaitBlpPosition) < first(TabletAction::Ping));
        assert_eq!(fixture.agent.calls_for(TabletAction::Ping).len(), 2);

        assert_eq!(fixture.serving_graph.rebuilds().len(), 3);
    }

    #[tokio::test]
    async fn test_master_cutover_times_out_when_destination_lags() {
        init_tracing();
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");
        let wrangler = &fixture.wrangler;

        for served_type in [TabletType::Rdonly, TabletType::Replica] {
            wrangler
                .migrate_served_types("ks", "0", served_type, false)
                .await
                .unwrap();
        }

        let (_, lagging_master) = &split.destinations[1];
        fixture
            .agent
            .set_blp_position(lagging_master, 0, INITIAL_POSITION - 10);
        let updates_before = fixture.topo.shard_update_count();

        let err = wrangler
            .migrate_served_types("ks", "0", TabletType::Master, false)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");

        // Nothing was persisted: the source still serves master and the
        // destinations still replicate from it.
        assert_eq!(fixture.topo.shard_update_count(), updates_before);
        assert_eq!(served(&fixture, "0"), vec![TabletType::Master]);
        for (key, _) in &split.destinations {
            let dest = fixture.topo.shard("ks", &key.shard).unwrap();
            assert!(!dest.served_types.contains(TabletType::Master));
            assert!(dest.replicates_from(&split.source));
        }

        // No rollback: the source master stays read-only.
        assert!(fixture.agent.is_read_only(&split.source_master));
        assert!(fixture.agent.calls_for(TabletAction::Ping).is_empty());

        for scope in ["0", "-80", "80-"] {
            assert!(!fixture.topo.is_locked(&shard_scope(scope)));
        }
        let results = fixture.topo.last_unlock_results(&shard_scope("0")).unwrap();
        assert_eq!(ActionNode::from_json(&results).unwrap().state, ActionState::Failed);

        assert_eq!(fixture.serving_graph.rebuilds().len(), 2);
        assert_eq!(wrangler.metrics().snapshot().migrations_failed, 1);
    }

    #[tokio::test]
    async fn test_master_cutover_stops_when_source_cannot_be_frozen() {
        init_tracing();
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");
        let wrangler = &fixture.wrangler;

        for served_type in [TabletType::Rdonly, TabletType::Replica] {
            wrangler
                .migrate_served_types("ks", "0", served_type, false)
                .await
                .unwrap();
        }
        fixture.agent.inject(
            &split.source_master,
            TabletAction::SetReadOnly,
            ActionFault::Unreachable,
        );

        let err = wrangler
            .migrate_served_types("ks", "0", TabletType::Master, false)
            .await
            .unwrap_err();
        assert!(err.is_action_error(), "unexpected error: {err}");
        assert!(fixture.agent.calls_for(TabletAction::MasterPosition).is_empty());
        assert_eq!(served(&fixture, "0"), vec![TabletType::Master]);
    }

    #[tokio::test]
    async fn test_master_cannot_migrate_back() {
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");

        let err = fixture
            .wrangler
            .migrate_served_types("ks", "0", TabletType::Master, true)
            .await
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(fixture.topo.lock_events().is_empty());
        assert_eq!(fixture.topo.shard_update_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_before_locking() {
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");
        let wrangler = &fixture.wrangler;

        // Reverse of a role the source still serves.
        let err = wrangler
            .migrate_served_types("ks", "0", TabletType::Replica, true)
            .await
            .unwrap_err();
        assert!(err.is_precondition());

        // Master while other roles remain.
        let err = wrangler
            .migrate_served_types("ks", "0", TabletType::Master, false)
            .await
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("everything else"));

        // Not a servable role.
        let err = wrangler
            .migrate_served_types("ks", "0", TabletType::Spare, false)
            .await
            .unwrap_err();
        assert!(err.is_precondition());

        // No shard replicates from the destination.
        let err = wrangler
            .migrate_served_types("ks", "-80", TabletType::Replica, false)
            .await
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("destination"));

        assert!(fixture.topo.lock_events().is_empty());
        assert_eq!(fixture.topo.shard_update_count(), 0);
    }

    #[tokio::test]
    async fn test_second_identical_migration_is_rejected() {
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");
        let wrangler = &fixture.wrangler;

        wrangler
            .migrate_served_types("ks", "0", TabletType::Replica, false)
            .await
            .unwrap();
        let updates = fixture.topo.shard_update_count();
        let lock_events = fixture.topo.lock_events().len();

        let err = wrangler
            .migrate_served_types("ks", "0", TabletType::Replica, false)
            .await
            .unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(fixture.topo.shard_update_count(), updates);
        assert_eq!(fixture.topo.lock_events().len(), lock_events);
        assert_eq!(served(&fixture, "-80"), vec![TabletType::Replica]);
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_partial_state() {
        init_tracing();
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");
        fixture.topo.fail_updates_for("ks", "80-", "store unavailable");

        let err = fixture
            .wrangler
            .migrate_served_types("ks", "0", TabletType::Replica, false)
            .await
            .unwrap_err();
        match &err {
            Error::Persistence { shard, reason, .. } => {
                assert_eq!(shard, "80-");
                assert!(reason.contains("store unavailable"));
            }
            other => panic!("expected persistence error, got {other:?}"),
        }

        // Sources and the first destination were written before the failure.
        assert_eq!(served(&fixture, "0"), vec![TabletType::Master, TabletType::Rdonly]);
        assert_eq!(served(&fixture, "-80"), vec![TabletType::Replica]);
        assert!(served(&fixture, "80-").is_empty());

        for scope in ["0", "-80", "80-"] {
            assert!(!fixture.topo.is_locked(&shard_scope(scope)));
            let results = fixture.topo.last_unlock_results(&shard_scope(scope)).unwrap();
            let node = ActionNode::from_json(&results).unwrap();
            assert_eq!(node.state, ActionState::Failed);
            assert!(node.error.unwrap().contains("store unavailable"));
        }
        assert!(fixture.serving_graph.rebuilds().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_failure_is_reported() {
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");
        fixture.serving_graph.fail_with("serving graph down");

        let err = fixture
            .wrangler
            .migrate_served_types("ks", "0", TabletType::Rdonly, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Store("serving graph down".to_string()));

        // The migration itself was persisted.
        assert_eq!(served(&fixture, "-80"), vec![TabletType::Rdonly]);
    }

    #[tokio::test]
    async fn test_lock_contention_times_out_and_strands_earlier_locks() {
        init_tracing();
        let config = WranglerFixture::default_config().with_lock_timeout(Duration::from_millis(50));
        let fixture = WranglerFixture::with_config(config).unwrap();
        fixture.setup_split("ks");

        let _held = fixture
            .topo
            .lock_shard_for_action("ks", "80-", "{}", Duration::from_millis(10))
            .await
            .unwrap();

        let err = fixture
            .wrangler
            .migrate_served_types("ks", "0", TabletType::Replica, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        // Locks taken before the failure need manual release.
        assert!(fixture.topo.is_locked(&shard_scope("0")));
        assert!(fixture.topo.is_locked(&shard_scope("-80")));
        assert_eq!(fixture.topo.shard_update_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_migrations_serialize_on_source() {
        init_tracing();
        let fixture = WranglerFixture::new().unwrap();
        fixture.setup_split("ks");
        let wrangler = &fixture.wrangler;

        let (replica, rdonly) = tokio::join!(
            wrangler.migrate_served_types("ks", "0", TabletType::Replica, false),
            wrangler.migrate_served_types("ks", "0", TabletType::Rdonly, false),
        );
        replica.unwrap();
        rdonly.unwrap();

        // Each run re-read the shards under lock, so neither lost the other's write.
        assert_eq!(served(&fixture, "0"), vec![TabletType::Master]);
        let mut dest = served(&fixture, "-80");
        dest.sort();
        assert_eq!(dest, vec![TabletType::Replica, TabletType::Rdonly]);

        // The second run only started locking after the first released.
        let events = fixture.topo.lock_events();
        assert_eq!(events.len(), 12);
        assert_eq!(events[5], LockEvent::Released(shard_scope("0")));
        assert_eq!(events[6], LockEvent::Acquired(shard_scope("0")));
    }

    #[tokio::test]
    async fn test_destination_discovery_is_sorted_and_scoped() {
        let fixture = WranglerFixture::new().unwrap();
        let split = fixture.setup_split("ks");
        fixture.setup_split("other");

        let found = fixture
            .wrangler
            .find_destination_shards(&split.source)
            .await
            .unwrap();
        let names: Vec<&str> = found.iter().map(|s| s.shard_name()).collect();
        assert_eq!(names, vec!["-80", "80-"]);
        assert!(found.iter().all(|s| s.keyspace() == "ks"));
    }
}
