//! MigrationScheduler tests – commit ordering, energy conservation, the
//! silent `no_root_spots` path, and remote failure restore.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use world_mesh::codec::TransferRegistry;
    use world_mesh::connection::ConnectionStore;
    use world_mesh::discovery::{DiscoveryConfig, DiscoveryService};
    use world_mesh::history::TransferHistory;
    use world_mesh::manager::{CreateWorldOptions, WorldInstance, WorldManager};
    use world_mesh::peer::{PeerClient, PeerClientConfig};
    use world_mesh::runner::RunnerConfig;
    use world_mesh::scheduler::MigrationScheduler;
    use world_mesh::types::{Connection, ServerInfo, ServerStatus};

    struct Fixture {
        _dir: TempDir,
        manager: Arc<WorldManager>,
        history: Arc<TransferHistory>,
        scheduler: Arc<MigrationScheduler>,
        discovery: Arc<DiscoveryService>,
    }

    fn make_fixture(with_peers: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let manager = Arc::new(WorldManager::new(RunnerConfig::default()));
        let history = Arc::new(TransferHistory::new(dir.path().join("transfers.log")));
        let registry = Arc::new(TransferRegistry::with_defaults());
        let connections = Arc::new(ConnectionStore::new(dir.path().join("connections.json")));
        let discovery = Arc::new(DiscoveryService::new(
            dir.path().join("registry.json"),
            DiscoveryConfig::default(),
        ));
        let peers = with_peers.then(|| {
            Arc::new(
                PeerClient::new(PeerClientConfig {
                    timeout: Duration::from_millis(500),
                    max_retries: 0,
                    retry_delay: Duration::from_millis(10),
                    max_idle_per_host: 2,
                    discovery_api_key: None,
                })
                .unwrap(),
            )
        });

        let scheduler = Arc::new(MigrationScheduler::new(
            connections,
            manager.clone(),
            history.clone(),
            registry,
            Some(discovery.clone()),
            peers,
            "server-a".to_string(),
            Duration::from_secs(2),
        ));
        Fixture {
            _dir: dir,
            manager,
            history,
            scheduler,
            discovery,
        }
    }

    fn make_tank(
        fixture: &Fixture,
        name: &str,
        fish: u64,
        plants: u64,
    ) -> Arc<WorldInstance> {
        fixture
            .manager
            .create(
                "tank",
                name,
                CreateWorldOptions {
                    config: Some(json!({
                        "fish_count": fish,
                        "plant_count": plants,
                        "food_count": 0,
                    })),
                    seed: Some(11),
                    persistent: false,
                    description: String::new(),
                },
            )
            .unwrap()
    }

    fn entity_count(instance: &WorldInstance) -> usize {
        instance.runner.with_backend(|b| b.entities().len())
    }

    // -----------------------------------------------------------------------
    // Local migration
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn local_migration_moves_one_entity_and_conserves_energy() {
        let fixture = make_fixture(false);
        let source = make_tank(&fixture, "Src", 3, 0);
        let dest = make_tank(&fixture, "Dst", 0, 0);

        let connection = Connection::new(source.world_id.clone(), dest.world_id.clone(), 100);
        fixture.scheduler.check_migration(&connection).await;

        // No loss, no duplicate: exactly one fish changed worlds.
        assert_eq!(entity_count(&source), 2);
        assert_eq!(entity_count(&dest), 1);

        let burned = source.runner.with_backend(|b| {
            b.stats().energy_burns.get("migration").copied().unwrap_or(0.0)
        });
        let gained = dest.runner.with_backend(|b| {
            b.stats()
                .energy_gains
                .get("migration_in")
                .copied()
                .unwrap_or(0.0)
        });
        assert!(burned > 0.0);
        assert!((burned - gained).abs() < 1e-9);

        let records = fixture.history.query(10, None, false);
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].entity_type, "fish");
        assert!(records[0].entity_new_id.is_some());
        assert!(records[0].selection_seed.is_some());
    }

    #[tokio::test]
    async fn silent_no_root_spots_changes_nothing() {
        let fixture = make_fixture(false);
        // Only plants are eligible on the source; the destination's twelve
        // root spots are all taken.
        let source = make_tank(&fixture, "Meadow", 0, 3);
        let dest = make_tank(&fixture, "Jungle", 0, 12);

        let connection = Connection::new(source.world_id.clone(), dest.world_id.clone(), 100);
        for _ in 0..50 {
            fixture.scheduler.check_migration(&connection).await;
        }

        assert_eq!(fixture.history.len(), 0);
        assert_eq!(entity_count(&source), 3);
        assert_eq!(entity_count(&dest), 12);
    }

    #[tokio::test]
    async fn paused_worlds_are_skipped() {
        let fixture = make_fixture(false);
        let source = make_tank(&fixture, "Src", 2, 0);
        let dest = make_tank(&fixture, "Dst", 0, 0);
        source.runner.handle_command("pause", None).unwrap();

        let connection = Connection::new(source.world_id.clone(), dest.world_id.clone(), 100);
        fixture.scheduler.check_migration(&connection).await;

        assert_eq!(entity_count(&source), 2);
        assert_eq!(entity_count(&dest), 0);
        assert_eq!(fixture.history.len(), 0);
    }

    #[tokio::test]
    async fn zero_probability_never_fires() {
        let fixture = make_fixture(false);
        let source = make_tank(&fixture, "Src", 2, 0);
        let dest = make_tank(&fixture, "Dst", 0, 0);

        let connection = Connection::new(source.world_id.clone(), dest.world_id.clone(), 0);
        for _ in 0..20 {
            fixture.scheduler.check_migration(&connection).await;
        }
        assert_eq!(entity_count(&source), 2);
        assert_eq!(entity_count(&dest), 0);
    }

    #[tokio::test]
    async fn missing_worlds_are_tolerated() {
        let fixture = make_fixture(false);
        let connection = Connection::new("ghost-a", "ghost-b", 100);
        fixture.scheduler.check_migration(&connection).await;
        assert_eq!(fixture.history.len(), 0);
    }

    // -----------------------------------------------------------------------
    // Remote migration
    // -----------------------------------------------------------------------

    fn remote_connection(source: &WorldInstance, dest_server: &str) -> Connection {
        let mut connection = Connection::new(source.world_id.clone(), "w-far", 100);
        connection.source_server_id = Some("server-a".to_string());
        connection.dest_server_id = Some(dest_server.to_string());
        connection
    }

    #[tokio::test]
    async fn unreachable_peer_restores_the_entity() {
        let fixture = make_fixture(true);
        let source = make_tank(&fixture, "Src", 2, 0);

        // A registered peer nothing listens behind.
        fixture.discovery.register(ServerInfo {
            server_id: "remote-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9,
            hostname: "127.0.0.1".to_string(),
            status: ServerStatus::Online,
            version: "0".to_string(),
            world_count: 0,
            is_local: false,
            uptime_seconds: 0.0,
        });

        let connection = remote_connection(&source, "remote-1");
        fixture.scheduler.check_migration(&connection).await;

        // Removed for the send, restored after the failure.
        assert_eq!(entity_count(&source), 2);

        let records = fixture.history.query(10, None, false);
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error.as_deref(), Some("unreachable_server"));
        assert_eq!(records[0].dest_world_id, "remote-1:w-far");
    }

    #[tokio::test]
    async fn unknown_destination_server_records_failure_without_removal() {
        let fixture = make_fixture(true);
        let source = make_tank(&fixture, "Src", 2, 0);

        let connection = remote_connection(&source, "nobody");
        fixture.scheduler.check_migration(&connection).await;

        assert_eq!(entity_count(&source), 2);
        let records = fixture.history.query(10, None, false);
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error.as_deref(), Some("unknown_server"));
    }
}
