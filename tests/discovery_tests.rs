//! DiscoveryService tests – registration, heartbeats, and the stale-server
//! classification, run with compressed timeouts.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;
    use world_mesh::discovery::{DiscoveryConfig, DiscoveryService};
    use world_mesh::types::{ServerInfo, ServerStatus};

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(200),
            cleanup_interval: Duration::from_millis(10),
            prune_timeout: Duration::from_millis(1000),
        }
    }

    fn info(server_id: &str, host: &str, port: u16) -> ServerInfo {
        ServerInfo {
            server_id: server_id.to_string(),
            host: host.to_string(),
            port,
            hostname: host.to_string(),
            status: ServerStatus::Online,
            version: "0.1.0".to_string(),
            world_count: 1,
            is_local: false,
            uptime_seconds: 0.0,
        }
    }

    fn sleep(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    #[test]
    fn register_and_list() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::new(dir.path().join("registry.json"), fast_config());

        service.register(info("p1", "10.0.0.1", 8000));
        service.register(info("p2", "10.0.0.2", 8000));

        assert_eq!(service.server_count(), 2);
        let online = service.list(Some(ServerStatus::Online), true);
        assert_eq!(online.len(), 2);
        assert!(service.get("p1").is_some());
    }

    #[test]
    fn reregistration_under_new_id_evicts_the_old_entry() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::new(dir.path().join("registry.json"), fast_config());

        service.register(info("old-identity", "10.0.0.1", 8000));
        // Same host:port, fresh id: the server restarted.
        service.register(info("new-identity", "10.0.0.1", 8000));

        assert!(service.get("old-identity").is_none());
        assert!(service.get("new-identity").is_some());
        assert_eq!(service.server_count(), 1);
    }

    #[test]
    fn list_can_exclude_local_servers() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::new(dir.path().join("registry.json"), fast_config());
        let mut me = info("me", "10.0.0.1", 8000);
        me.is_local = true;
        service.register(me);
        service.register(info("peer", "10.0.0.2", 8000));

        assert_eq!(service.list(None, true).len(), 2);
        let remote_only = service.list(None, false);
        assert_eq!(remote_only.len(), 1);
        assert_eq!(remote_only[0].server_id, "peer");
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    #[test]
    fn heartbeat_from_unknown_server_is_rejected() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::new(dir.path().join("registry.json"), fast_config());
        assert!(!service.heartbeat("stranger", None));
    }

    #[test]
    fn heartbeat_revives_an_offline_server() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::new(dir.path().join("registry.json"), fast_config());
        service.register(info("p1", "10.0.0.1", 8000));

        sleep(300);
        service.cleanup_stale_servers();
        assert_eq!(service.get("p1").unwrap().status, ServerStatus::Offline);

        assert!(service.heartbeat("p1", Some(info("p1", "10.0.0.1", 8000))));
        assert_eq!(service.get("p1").unwrap().status, ServerStatus::Online);
    }

    // -----------------------------------------------------------------------
    // Stale classification
    // -----------------------------------------------------------------------

    #[test]
    fn heartbeat_age_classifies_degraded_then_offline_then_pruned() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::new(dir.path().join("registry.json"), fast_config());
        service.register(info("p1", "10.0.0.1", 8000));

        // Past 2 × heartbeat_interval but inside the timeout: degraded.
        sleep(80);
        service.cleanup_stale_servers();
        assert_eq!(service.get("p1").unwrap().status, ServerStatus::Degraded);

        // Past the heartbeat timeout: offline.
        sleep(220);
        service.cleanup_stale_servers();
        assert_eq!(service.get("p1").unwrap().status, ServerStatus::Offline);

        // Past the prune timeout: gone entirely.
        sleep(800);
        service.cleanup_stale_servers();
        assert!(service.get("p1").is_none());
        assert_eq!(service.server_count(), 0);
    }

    #[test]
    fn fresh_heartbeats_keep_a_server_online() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::new(dir.path().join("registry.json"), fast_config());
        service.register(info("p1", "10.0.0.1", 8000));

        for _ in 0..4 {
            sleep(20);
            assert!(service.heartbeat("p1", None));
        }
        service.cleanup_stale_servers();
        assert_eq!(service.get("p1").unwrap().status, ServerStatus::Online);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    #[test]
    fn registry_survives_a_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        {
            let service = DiscoveryService::new(&path, fast_config());
            service.register(info("p1", "10.0.0.1", 8000));
            service.register(info("p2", "10.0.0.2", 8001));
        }

        let reloaded = DiscoveryService::new(&path, fast_config());
        assert_eq!(reloaded.server_count(), 2);
        assert_eq!(reloaded.get("p2").unwrap().port, 8001);
    }
}
