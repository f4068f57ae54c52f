//! Transfer codec unit tests

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use world_mesh::backend::{create_backend, EntityState, WorldBackend};
    use world_mesh::codec::{TransferContext, TransferRegistry, TRANSFER_SCHEMA_VERSION};
    use world_mesh::error::ErrorCode;

    fn make_tank(fish: u64, plants: u64) -> Box<dyn WorldBackend> {
        create_backend(
            "tank",
            Some(42),
            Some(&json!({
                "fish_count": fish,
                "plant_count": plants,
                "food_count": 0,
            })),
        )
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    #[test]
    fn fish_serialization_stamps_type_and_schema() {
        let registry = TransferRegistry::with_defaults();
        let tank = make_tank(1, 0);
        let fish = &tank.entities()[0];

        let data = registry
            .try_serialize(fish, &TransferContext::default())
            .unwrap();
        assert_eq!(data.get("type").and_then(Value::as_str), Some("fish"));
        assert_eq!(
            data.get("schema_version").and_then(Value::as_u64),
            Some(TRANSFER_SCHEMA_VERSION)
        );
        assert!(data.contains_key("x"));
        assert!(data.contains_key("y"));
        assert!(data.contains_key("energy"));
    }

    #[test]
    fn fish_round_trips_into_another_world() {
        let registry = TransferRegistry::with_defaults();
        let source = make_tank(1, 0);
        let fish = &source.entities()[0];
        let energy = fish.energy().unwrap();

        let data = registry
            .try_serialize(fish, &TransferContext::default())
            .unwrap();

        let mut dest = make_tank(0, 0);
        let new_id = registry
            .try_deserialize(&Value::Object(data), dest.as_mut())
            .unwrap();

        let restored = dest.entity(&new_id).unwrap();
        assert_eq!(restored.snapshot_type(), "fish");
        assert_eq!(restored.energy().unwrap(), energy);
        // The destination allocated the id; the wire id is not reused.
        assert!(!new_id.is_empty());
    }

    // -----------------------------------------------------------------------
    // Root-spot back-pressure
    // -----------------------------------------------------------------------

    #[test]
    fn plant_into_full_world_reports_no_root_spots() {
        let registry = TransferRegistry::with_defaults();
        let source = make_tank(0, 1);
        let plant = &source.entities()[0];
        let data = registry
            .try_serialize(plant, &TransferContext::default())
            .unwrap();

        // Twelve plants occupy every root spot.
        let mut dest = make_tank(0, 12);
        let err = registry
            .try_deserialize(&Value::Object(data), dest.as_mut())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoRootSpots);
    }

    #[test]
    fn plant_into_petri_reports_no_root_spots() {
        let registry = TransferRegistry::with_defaults();
        let source = make_tank(0, 1);
        let plant = &source.entities()[0];
        let data = registry
            .try_serialize(plant, &TransferContext::default())
            .unwrap();

        // Petri dishes have no root spots at all.
        let mut dest = create_backend("petri", Some(1), None).unwrap();
        let err = registry
            .try_deserialize(&Value::Object(data), dest.as_mut())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoRootSpots);
    }

    #[test]
    fn removing_a_plant_frees_its_root_spot() {
        let registry = TransferRegistry::with_defaults();
        let source = make_tank(0, 1);
        let data = registry
            .try_serialize(&source.entities()[0], &TransferContext::default())
            .unwrap();

        let mut dest = make_tank(0, 12);
        let resident_id = dest
            .entities()
            .iter()
            .find(|e| e.snapshot_type() == "plant")
            .unwrap()
            .id
            .clone();
        dest.remove(&resident_id).unwrap();

        let new_id = registry
            .try_deserialize(&Value::Object(data), dest.as_mut())
            .unwrap();
        assert!(dest.entity(&new_id).is_some());
    }

    // -----------------------------------------------------------------------
    // Tagged errors
    // -----------------------------------------------------------------------

    #[test]
    fn non_object_payload_is_invalid() {
        let registry = TransferRegistry::with_defaults();
        let mut dest = make_tank(0, 0);
        let err = registry
            .try_deserialize(&json!("not an object"), dest.as_mut())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn missing_type_field_is_reported() {
        let registry = TransferRegistry::with_defaults();
        let mut dest = make_tank(0, 0);
        let err = registry
            .try_deserialize(&json!({"x": 1.0, "y": 2.0}), dest.as_mut())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingType);
    }

    #[test]
    fn unknown_type_tag_is_reported() {
        let registry = TransferRegistry::with_defaults();
        let mut dest = make_tank(0, 0);
        let err = registry
            .try_deserialize(
                &json!({"type": "dragon", "x": 1.0, "y": 2.0}),
                dest.as_mut(),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownType);
    }

    #[test]
    fn malformed_fish_fails_deserialization() {
        let registry = TransferRegistry::with_defaults();
        let mut dest = make_tank(0, 0);
        let err = registry
            .try_deserialize(&json!({"type": "fish", "x": 1.0}), dest.as_mut())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DeserializeFailed);
    }

    // -----------------------------------------------------------------------
    // Eligibility
    // -----------------------------------------------------------------------

    #[test]
    fn only_fish_and_plants_are_migratable() {
        let registry = TransferRegistry::with_defaults();
        let mut tank = make_tank(1, 1);
        tank.spawn(
            EntityState::Food {
                energy: 5.0,
                food_type: "flake".to_string(),
            },
            10.0,
            10.0,
        );

        let migratable: Vec<&str> = tank
            .entities()
            .iter()
            .filter(|e| registry.is_migratable(e))
            .map(|e| e.snapshot_type())
            .collect();
        assert_eq!(migratable.len(), 2);
        assert!(migratable.contains(&"fish"));
        assert!(migratable.contains(&"plant"));
    }
}
