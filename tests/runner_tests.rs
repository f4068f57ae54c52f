//! WorldRunner unit tests – command handling, the state cache, and the
//! full/delta pipeline.

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use world_mesh::backend::{
        create_backend, EcosystemStats, Entity, EntityState, StepError, WorldBackend,
    };
    use world_mesh::error::ErrorCode;
    use world_mesh::protocol::StatePayload;
    use world_mesh::runner::{RunnerConfig, WorldRunner};

    fn make_runner(fish: u64) -> WorldRunner {
        let backend = create_backend(
            "tank",
            Some(7),
            Some(&json!({
                "fish_count": fish,
                "plant_count": 0,
                "food_count": 0,
            })),
        )
        .unwrap();
        WorldRunner::new(
            "w-test".to_string(),
            backend,
            "tank",
            "side",
            RunnerConfig::default(),
        )
    }

    // -----------------------------------------------------------------------
    // Stepping & commands
    // -----------------------------------------------------------------------

    #[test]
    fn step_advances_frame_counter() {
        let runner = make_runner(2);
        assert_eq!(runner.frame_count(), 0);
        runner.step(None).unwrap();
        runner.step(None).unwrap();
        assert_eq!(runner.frame_count(), 2);
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let runner = make_runner(1);
        runner.handle_command("pause", None).unwrap();
        runner.handle_command("pause", None).unwrap();
        assert!(runner.paused());
        runner.handle_command("resume", None).unwrap();
        runner.handle_command("resume", None).unwrap();
        assert!(!runner.paused());
    }

    #[test]
    fn reset_clears_frame_counter_and_reseeds() {
        let runner = make_runner(2);
        runner.step(None).unwrap();
        let response = runner
            .handle_command("reset", Some(&json!({"seed": 99})))
            .unwrap()
            .unwrap();
        assert_eq!(response.get("frame_count").and_then(Value::as_u64), Some(0));
        assert_eq!(runner.frame_count(), 0);
    }

    #[test]
    fn fast_forward_toggles() {
        let runner = make_runner(1);
        runner.handle_command("fast_forward", None).unwrap();
        assert!(runner.fast_forward());
        runner
            .handle_command("fast_forward", Some(&json!({"enabled": false})))
            .unwrap();
        assert!(!runner.fast_forward());
    }

    #[test]
    fn world_specific_commands_reach_the_backend() {
        let runner = make_runner(0);
        let before = runner.with_backend(|b| b.entities().len());
        let response = runner
            .handle_command("spawn_fish", None)
            .unwrap()
            .unwrap();
        assert_eq!(response.get("success").and_then(Value::as_bool), Some(true));
        let after = runner.with_backend(|b| b.entities().len());
        assert_eq!(after, before + 1);
    }

    #[test]
    fn unknown_commands_answer_in_band() {
        let runner = make_runner(1);
        let response = runner.handle_command("warp_drive", None).unwrap().unwrap();
        assert_eq!(
            response.get("success").and_then(Value::as_bool),
            Some(false)
        );
    }

    // -----------------------------------------------------------------------
    // State pipeline
    // -----------------------------------------------------------------------

    #[test]
    fn first_frame_is_full_and_cached() {
        let runner = make_runner(3);
        let state = runner.get_state(false, true);
        assert!(state.is_full());
        match &state {
            StatePayload::Full(full) => {
                assert_eq!(full.entities.len(), 3);
                assert_eq!(full.world_id, "w-test");
                assert_eq!(full.world_type, "tank");
            }
            StatePayload::Delta(_) => unreachable!(),
        }

        // Same frame: the cache is served untouched.
        let again = runner.get_state(false, true);
        assert_eq!(again.frame(), state.frame());
    }

    #[test]
    fn subsequent_frames_emit_deltas() {
        let runner = make_runner(3);
        let _ = runner.get_state(true, false);

        runner.step(None).unwrap();
        runner.step(None).unwrap();
        let state = runner.get_state(false, true);
        match state {
            StatePayload::Delta(delta) => {
                assert!(!delta.updates.is_empty());
                assert_eq!(delta.frame, 2);
            }
            StatePayload::Full(_) => panic!("expected a delta frame"),
        }
    }

    #[test]
    fn force_full_always_builds_a_full_frame() {
        let runner = make_runner(2);
        let _ = runner.get_state(true, false);
        runner.step(None).unwrap();
        runner.step(None).unwrap();
        let state = runner.get_state(true, false);
        assert!(state.is_full());
    }

    #[test]
    fn delta_reports_added_and_removed_entities() {
        let runner = make_runner(2);
        let _ = runner.get_state(true, false);

        // Mutate the population between emissions. The food goes in a
        // corner far from every fish so nothing eats it mid-test.
        let removed_id = runner.with_backend(|b| {
            let id = b.entities()[0].id.clone();
            b.remove(&id);
            let fish: Vec<(f32, f32)> = b.entities().iter().map(|e| (e.x, e.y)).collect();
            let (x, y) = [(0.0, 0.0), (799.0, 0.0), (0.0, 599.0), (799.0, 599.0)]
                .into_iter()
                .find(|(cx, cy)| {
                    fish.iter()
                        .all(|(fx, fy)| (fx - cx).hypot(fy - cy) > 50.0)
                })
                .unwrap_or((400.0, 0.0));
            b.spawn(
                EntityState::Food {
                    energy: 5.0,
                    food_type: "flake".to_string(),
                },
                x,
                y,
            );
            id
        });
        runner.step(None).unwrap();
        runner.step(None).unwrap();

        let state = runner.get_state(false, true);
        match state {
            StatePayload::Delta(delta) => {
                assert!(delta.removed.contains(&removed_id));
                assert!(delta
                    .added
                    .iter()
                    .any(|frame| frame.entity_type == "food"));
            }
            StatePayload::Full(_) => panic!("expected a delta frame"),
        }
    }

    #[test]
    fn cache_invalidation_forces_a_full_rebuild() {
        let runner = make_runner(2);
        let _ = runner.get_state(true, false);
        runner.step(None).unwrap();
        runner.invalidate_cache();
        let state = runner.get_state(false, true);
        assert!(state.is_full());
    }

    #[test]
    fn payload_frames_are_monotonic() {
        let runner = make_runner(2);
        let mut last = 0;
        for _ in 0..20 {
            runner.step(None).unwrap();
            let frame = runner.get_state(false, true).frame();
            assert!(frame >= last);
            last = frame;
        }
    }

    #[test]
    fn serialize_state_returns_canonical_json_bytes() {
        let runner = make_runner(1);
        let state = runner.get_state(true, false);
        let bytes = runner.serialize_state(&state);
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.get("type").and_then(Value::as_str), Some("update"));
        assert!(parsed.get("entities").is_some());
    }

    // -----------------------------------------------------------------------
    // Degradation
    // -----------------------------------------------------------------------

    struct FailingBackend {
        stats: EcosystemStats,
        entities: Vec<Entity>,
    }

    impl WorldBackend for FailingBackend {
        fn world_type(&self) -> &'static str {
            "tank"
        }
        fn bounds(&self) -> (f32, f32) {
            (100.0, 100.0)
        }
        fn reset(&mut self, _seed: Option<u64>, _config: Option<&Value>) {}
        fn step(&mut self, _actions: Option<&Value>) -> Result<(), StepError> {
            Err(StepError("physics blew up".to_string()))
        }
        fn entities(&self) -> &[Entity] {
            &self.entities
        }
        fn spawn(&mut self, state: EntityState, x: f32, y: f32) -> String {
            self.entities.push(Entity {
                id: "f1".to_string(),
                x,
                y,
                state,
            });
            "f1".to_string()
        }
        fn remove(&mut self, _id: &str) -> Option<Entity> {
            None
        }
        fn clear(&mut self) {
            self.entities.clear();
        }
        fn stats(&self) -> &EcosystemStats {
            &self.stats
        }
        fn stats_mut(&mut self) -> &mut EcosystemStats {
            &mut self.stats
        }
    }

    #[test]
    fn repeated_step_failures_degrade_the_runner() {
        let backend = Box::new(FailingBackend {
            stats: EcosystemStats::default(),
            entities: Vec::new(),
        });
        let config = RunnerConfig {
            max_step_failures: 3,
            ..RunnerConfig::default()
        };
        let runner = WorldRunner::new("w-bad".to_string(), backend, "tank", "side", config);

        for _ in 0..3 {
            assert!(runner.step(None).is_err());
        }
        assert!(runner.degraded());
        // Frame counter never advanced.
        assert_eq!(runner.frame_count(), 0);

        // Degraded runners refuse stepping with the dedicated code...
        let err = runner.step(None).unwrap_err();
        assert_eq!(err.code, ErrorCode::DegradedRunner);

        // ...but stay responsive to control commands; reset clears the flag.
        runner.handle_command("reset", None).unwrap();
        assert!(!runner.degraded());
    }
}
