//! SnapshotStore unit tests – save/restore round trips, the two-pass
//! nectar restore, retention, and error classification.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::tempdir;
    use world_mesh::backend::EntityState;
    use world_mesh::codec::TransferRegistry;
    use world_mesh::error::SnapshotError;
    use world_mesh::manager::{CreateWorldOptions, WorldManager};
    use world_mesh::runner::RunnerConfig;
    use world_mesh::snapshot::SnapshotStore;

    fn make_store(dir: &std::path::Path) -> SnapshotStore {
        SnapshotStore::new(
            dir.join("worlds"),
            Arc::new(TransferRegistry::with_defaults()),
        )
    }

    fn make_manager() -> WorldManager {
        WorldManager::new(RunnerConfig::default())
    }

    fn tank_options(fish: u64, plants: u64) -> CreateWorldOptions {
        CreateWorldOptions {
            config: Some(json!({
                "fish_count": fish,
                "plant_count": plants,
                "food_count": 0,
            })),
            seed: Some(5),
            persistent: true,
            description: "test world".to_string(),
        }
    }

    fn type_counts(
        runner: &world_mesh::runner::WorldRunner,
    ) -> HashMap<String, usize> {
        runner.with_backend(|b| {
            let mut counts = HashMap::new();
            for entity in b.entities() {
                *counts.entry(entity.snapshot_type().to_string()).or_insert(0) += 1;
            }
            counts
        })
    }

    // -----------------------------------------------------------------------
    // Round trip
    // -----------------------------------------------------------------------

    #[test]
    fn save_restore_round_trip_preserves_world_state() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let manager = make_manager();

        let source = manager
            .create("tank", "Alpha", tank_options(2, 2))
            .unwrap();
        source.runner.step(None).unwrap();
        source.runner.step(None).unwrap();
        source.runner.step(None).unwrap();
        source.runner.with_backend(|b| {
            b.stats_mut().births = 4;
            b.stats_mut().deaths = 2;
            b.stats_mut()
                .death_causes
                .insert("starvation".to_string(), 2);
        });
        source.runner.handle_command("pause", None).unwrap();

        let path = store.save(&source).expect("save should succeed");
        let snapshot = store.load(&path).unwrap();
        assert_eq!(snapshot.world_id, source.world_id);
        assert_eq!(snapshot.frame, 3);
        assert!(snapshot.paused);
        assert_eq!(snapshot.metadata.name, "Alpha");
        assert_eq!(snapshot.metadata.world_type, "tank");
        assert_eq!(snapshot.metadata.seed, Some(5));
        assert!(snapshot.metadata.persistent);
        assert_eq!(snapshot.entities.len(), 4);

        let target = manager
            .create("tank", "Alpha Restored", tank_options(0, 0))
            .unwrap();
        assert!(store.restore(&snapshot, &target.runner));

        assert_eq!(target.runner.frame_count(), 3);
        assert!(target.runner.paused());
        assert_eq!(type_counts(&source.runner), type_counts(&target.runner));
        target.runner.with_backend(|b| {
            assert_eq!(b.stats().births, 4);
            assert_eq!(b.stats().deaths, 2);
            assert_eq!(b.stats().death_causes.get("starvation"), Some(&2));
        });
    }

    // -----------------------------------------------------------------------
    // Two-pass nectar restore
    // -----------------------------------------------------------------------

    #[test]
    fn nectar_is_rebound_to_the_restored_plant() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let manager = make_manager();

        let source = manager.create("tank", "Garden", tank_options(0, 1)).unwrap();
        source.runner.with_backend(|b| {
            let plant_id = b.entities()[0].id.clone();
            b.spawn(
                EntityState::Nectar {
                    energy: 5.0,
                    source_plant_id: plant_id,
                },
                10.0,
                10.0,
            );
        });

        let path = store.save(&source).unwrap();
        let snapshot = store.load(&path).unwrap();

        let target = manager
            .create("tank", "Garden Restored", tank_options(0, 0))
            .unwrap();
        assert!(store.restore(&snapshot, &target.runner));

        target.runner.with_backend(|b| {
            let plant_id = b
                .entities()
                .iter()
                .find(|e| e.snapshot_type() == "plant")
                .map(|e| e.id.clone())
                .expect("plant restored");
            let nectar = b
                .entities()
                .iter()
                .find(|e| e.snapshot_type() == "nectar")
                .expect("nectar restored");
            match &nectar.state {
                EntityState::Nectar {
                    source_plant_id, ..
                } => assert_eq!(source_plant_id, &plant_id),
                _ => unreachable!(),
            }
        });
    }

    #[test]
    fn orphaned_nectar_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let manager = make_manager();

        let source = manager.create("tank", "Orphanage", tank_options(0, 1)).unwrap();
        source.runner.with_backend(|b| {
            b.spawn(
                EntityState::Nectar {
                    energy: 5.0,
                    source_plant_id: "long-gone".to_string(),
                },
                10.0,
                10.0,
            );
        });

        let path = store.save(&source).unwrap();
        let snapshot = store.load(&path).unwrap();

        let target = manager
            .create("tank", "Orphanage Restored", tank_options(0, 0))
            .unwrap();
        assert!(store.restore(&snapshot, &target.runner));
        target.runner.with_backend(|b| {
            assert!(b.entities().iter().all(|e| e.snapshot_type() != "nectar"));
        });
    }

    // -----------------------------------------------------------------------
    // Error classification
    // -----------------------------------------------------------------------

    #[test]
    fn missing_and_corrupt_snapshots_are_distinct() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());

        let missing = store.load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, SnapshotError::Missing(_)));

        let corrupt_path = dir.path().join("corrupt.json");
        std::fs::write(&corrupt_path, b"{{{ definitely not json").unwrap();
        let corrupt = store.load(&corrupt_path).unwrap_err();
        assert!(matches!(corrupt, SnapshotError::Corrupt { .. }));

        let partial_path = dir.path().join("partial.json");
        std::fs::write(
            &partial_path,
            serde_json::to_vec(&json!({
                "schema_version": 1,
                "world_id": "w1",
                "metadata": {"name": "x", "world_type": "tank"},
                "entities": [],
            }))
            .unwrap(),
        )
        .unwrap();
        let partial = store.load(&partial_path).unwrap_err();
        assert!(matches!(partial, SnapshotError::MissingField("frame")));
    }

    // -----------------------------------------------------------------------
    // Listing, retention, discovery
    // -----------------------------------------------------------------------

    fn write_fixture_snapshot(dir: &std::path::Path, world_id: &str, stamp: &str, frame: u64) {
        let snapshot_dir = dir.join("worlds").join(world_id).join("snapshots");
        std::fs::create_dir_all(&snapshot_dir).unwrap();
        let body = json!({
            "schema_version": 1,
            "world_id": world_id,
            "saved_at": "2026-08-01T00:00:00Z",
            "frame": frame,
            "metadata": {"name": "fixture", "world_type": "tank"},
            "entities": [],
            "ecosystem": {"births": 0, "deaths": 0, "generation": 0},
            "paused": false,
        });
        std::fs::write(
            snapshot_dir.join(format!("snapshot_{}.json", stamp)),
            serde_json::to_vec(&body).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn list_is_newest_first_and_retain_trims_the_tail() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        for (i, stamp) in ["20240101_000001", "20240101_000002", "20240101_000003", "20240101_000004"]
            .iter()
            .enumerate()
        {
            write_fixture_snapshot(dir.path(), "w1", stamp, i as u64);
        }

        let listed = store.list("w1");
        assert_eq!(listed.len(), 4);
        assert!(listed[0].filename.contains("000004"));
        assert_eq!(listed[0].frame, 3);

        let deleted = store.retain("w1", 2);
        assert_eq!(deleted, 2);
        let remaining = store.list("w1");
        assert_eq!(remaining.len(), 2);
        assert!(remaining[1].filename.contains("000003"));
    }

    #[test]
    fn discover_all_maps_each_world_to_its_latest_snapshot() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        write_fixture_snapshot(dir.path(), "w1", "20240101_000001", 1);
        write_fixture_snapshot(dir.path(), "w1", "20240101_000009", 9);
        write_fixture_snapshot(dir.path(), "w2", "20240101_000005", 5);

        let found = store.discover_all();
        assert_eq!(found.len(), 2);
        assert!(found["w1"].to_string_lossy().contains("000009"));
        assert!(found["w2"].to_string_lossy().contains("000005"));
    }
}
