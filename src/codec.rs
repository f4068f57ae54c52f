//! Entity transfer codecs.
//!
//! A codec is the **only** mechanism by which an entity leaves a world –
//! whether into a snapshot file, across a local migration, or over the wire
//! to a peer. Codecs are keyed by a stable string `type` tag and return
//! tagged outcomes instead of panicking; `no_root_spots` in particular is a
//! back-pressure signal, not a fault.

use std::collections::HashMap;

use log::warn;
use serde_json::{Map, Value};

use crate::backend::{Entity, EntityState, WorldBackend};
use crate::error::{ErrorCode, TransferError};
use crate::types::{Direction, EntityId};

/// Portable JSON dict describing one entity. Always carries `type` and
/// `schema_version`, plus at minimum `id`, `x` and `y`.
pub type SerializedEntity = Map<String, Value>;

pub const TRANSFER_SCHEMA_VERSION: u64 = 2;

/// Entity types the migration scheduler may pick from a source world.
pub const MIGRATABLE_TYPES: [&str; 2] = ["fish", "plant"];

/// Optional contextual information for transfers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferContext {
    /// For plants: which boundary the entity crossed, so the destination
    /// can place it at the matching edge.
    pub migration_direction: Option<Direction>,
}

// ---------------------------------------------------------------------------
// Codec trait
// ---------------------------------------------------------------------------

/// Serializer/deserializer for one entity type tag.
pub trait TransferCodec: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// True if this codec can serialize `entity`.
    fn can_serialize(&self, entity: &Entity) -> bool;

    /// Serialize `entity` into a portable dict (without `type` /
    /// `schema_version`, which the registry stamps).
    fn serialize(
        &self,
        entity: &Entity,
        ctx: &TransferContext,
    ) -> Result<SerializedEntity, TransferError>;

    /// Reconstruct the entity inside `target`, returning its fresh id.
    fn deserialize(
        &self,
        data: &SerializedEntity,
        target: &mut dyn WorldBackend,
    ) -> Result<EntityId, TransferError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of transfer codecs, routing by `type` tag.
///
/// Keeps transfer policy (routing) separate from transfer mechanics
/// (per-type field layout). Registering a codec for an existing tag
/// replaces the previous one with a warning.
pub struct TransferRegistry {
    codecs: Vec<Box<dyn TransferCodec>>,
    by_type: HashMap<&'static str, usize>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self {
            codecs: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    /// Registry with the built-in fish/plant/food/nectar/microbe codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FishCodec));
        registry.register(Box::new(PlantCodec));
        registry.register(Box::new(FoodCodec));
        registry.register(Box::new(NectarCodec));
        registry.register(Box::new(MicrobeCodec));
        registry
    }

    pub fn register(&mut self, codec: Box<dyn TransferCodec>) {
        let name = codec.type_name();
        if self.by_type.contains_key(name) {
            warn!("Overriding existing transfer codec for type={:?}", name);
        }
        self.codecs.push(codec);
        self.by_type.insert(name, self.codecs.len() - 1);
    }

    pub fn codec_for_entity(&self, entity: &Entity) -> Option<&dyn TransferCodec> {
        self.codecs
            .iter()
            .find(|c| c.can_serialize(entity))
            .map(|c| c.as_ref())
    }

    /// True if the scheduler may select this entity for migration.
    pub fn is_migratable(&self, entity: &Entity) -> bool {
        MIGRATABLE_TYPES.contains(&entity.snapshot_type())
    }

    /// Serialize `entity`, stamping `type` and `schema_version`.
    pub fn try_serialize(
        &self,
        entity: &Entity,
        ctx: &TransferContext,
    ) -> Result<SerializedEntity, TransferError> {
        let codec = self.codec_for_entity(entity).ok_or_else(|| {
            TransferError::new(
                ErrorCode::UnsupportedEntity,
                format!("cannot transfer entity of type {}", entity.snapshot_type()),
            )
            .with_context("entity_type", entity.snapshot_type())
        })?;

        let mut payload = codec.serialize(entity, ctx).map_err(|e| {
            TransferError::new(ErrorCode::SerializeFailed, e.message)
                .with_context("codec", codec.type_name())
        })?;

        if let Some(existing) = payload.get("type").and_then(Value::as_str) {
            if existing != codec.type_name() {
                return Err(TransferError::new(
                    ErrorCode::InvalidPayload,
                    "transfer codec returned mismatched type field",
                )
                .with_context("codec", codec.type_name())
                .with_context("payload_type", existing));
            }
        }
        payload.insert("type".into(), Value::from(codec.type_name()));
        payload
            .entry("schema_version")
            .or_insert(Value::from(TRANSFER_SCHEMA_VERSION));
        Ok(payload)
    }

    /// Deserialize a portable dict into `target`. `no_root_spots` and
    /// friends come back as tagged errors – never panics.
    pub fn try_deserialize(
        &self,
        data: &Value,
        target: &mut dyn WorldBackend,
    ) -> Result<EntityId, TransferError> {
        let map = data.as_object().ok_or_else(|| {
            TransferError::new(
                ErrorCode::InvalidPayload,
                "cannot deserialize entity: expected object",
            )
        })?;
        let entity_type = map.get("type").and_then(Value::as_str).ok_or_else(|| {
            TransferError::new(
                ErrorCode::MissingType,
                "cannot deserialize entity: missing 'type' field",
            )
        })?;
        let codec = self
            .by_type
            .get(entity_type)
            .map(|&i| self.codecs[i].as_ref())
            .ok_or_else(|| {
                TransferError::new(
                    ErrorCode::UnknownType,
                    format!("unknown entity type: {}", entity_type),
                )
                .with_context("entity_type", entity_type)
            })?;

        codec.deserialize(map, target)
    }
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn require_f32(data: &SerializedEntity, key: &'static str) -> Result<f32, TransferError> {
    data.get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .ok_or_else(|| missing_key(key))
}

fn require_f64(data: &SerializedEntity, key: &'static str) -> Result<f64, TransferError> {
    data.get(key).and_then(Value::as_f64).ok_or_else(|| missing_key(key))
}

fn require_str<'a>(
    data: &'a SerializedEntity,
    key: &'static str,
) -> Result<&'a str, TransferError> {
    data.get(key).and_then(Value::as_str).ok_or_else(|| missing_key(key))
}

fn missing_key(key: &'static str) -> TransferError {
    TransferError::new(
        ErrorCode::DeserializeFailed,
        format!("missing or invalid key '{}'", key),
    )
}

fn opt_f32(data: &SerializedEntity, key: &str) -> f32 {
    data.get(key).and_then(Value::as_f64).unwrap_or(0.0) as f32
}

// ---------------------------------------------------------------------------
// Fish
// ---------------------------------------------------------------------------

pub struct FishCodec;

impl TransferCodec for FishCodec {
    fn type_name(&self) -> &'static str {
        "fish"
    }

    fn can_serialize(&self, entity: &Entity) -> bool {
        matches!(entity.state, EntityState::Fish { .. })
    }

    fn serialize(
        &self,
        entity: &Entity,
        _ctx: &TransferContext,
    ) -> Result<SerializedEntity, TransferError> {
        let EntityState::Fish {
            energy,
            max_energy,
            age,
            generation,
            ref species,
            vel_x,
            vel_y,
        } = entity.state
        else {
            return Err(TransferError::new(
                ErrorCode::UnsupportedEntity,
                "not a fish",
            ));
        };
        let mut data = SerializedEntity::new();
        data.insert("id".into(), Value::from(entity.id.clone()));
        data.insert("x".into(), Value::from(entity.x));
        data.insert("y".into(), Value::from(entity.y));
        data.insert("vel_x".into(), Value::from(vel_x));
        data.insert("vel_y".into(), Value::from(vel_y));
        data.insert("energy".into(), Value::from(energy));
        data.insert("max_energy".into(), Value::from(max_energy));
        data.insert("age".into(), Value::from(age));
        data.insert("generation".into(), Value::from(generation));
        data.insert("species".into(), Value::from(species.clone()));
        Ok(data)
    }

    fn deserialize(
        &self,
        data: &SerializedEntity,
        target: &mut dyn WorldBackend,
    ) -> Result<EntityId, TransferError> {
        let x = require_f32(data, "x")?;
        let y = require_f32(data, "y")?;
        let state = EntityState::Fish {
            energy: require_f64(data, "energy")?,
            max_energy: require_f64(data, "max_energy")?,
            age: data.get("age").and_then(Value::as_u64).unwrap_or(0),
            generation: data.get("generation").and_then(Value::as_u64).unwrap_or(0) as u32,
            species: require_str(data, "species")?.to_string(),
            vel_x: opt_f32(data, "vel_x"),
            vel_y: opt_f32(data, "vel_y"),
        };
        Ok(target.spawn(state, x, y))
    }
}

// ---------------------------------------------------------------------------
// Plant
// ---------------------------------------------------------------------------

pub struct PlantCodec;

impl TransferCodec for PlantCodec {
    fn type_name(&self) -> &'static str {
        "plant"
    }

    fn can_serialize(&self, entity: &Entity) -> bool {
        matches!(entity.state, EntityState::Plant { .. })
    }

    fn serialize(
        &self,
        entity: &Entity,
        ctx: &TransferContext,
    ) -> Result<SerializedEntity, TransferError> {
        let EntityState::Plant {
            energy,
            max_energy,
            generation,
            ..
        } = entity.state
        else {
            return Err(TransferError::new(
                ErrorCode::UnsupportedEntity,
                "not a plant",
            ));
        };
        let mut data = SerializedEntity::new();
        data.insert("id".into(), Value::from(entity.id.clone()));
        data.insert("x".into(), Value::from(entity.x));
        data.insert("y".into(), Value::from(entity.y));
        data.insert("energy".into(), Value::from(energy));
        data.insert("max_energy".into(), Value::from(max_energy));
        data.insert("generation".into(), Value::from(generation));
        if let Some(direction) = ctx.migration_direction {
            data.insert(
                "migration_direction".into(),
                Value::from(direction.to_string()),
            );
        }
        Ok(data)
    }

    fn deserialize(
        &self,
        data: &SerializedEntity,
        target: &mut dyn WorldBackend,
    ) -> Result<EntityId, TransferError> {
        // A migrating plant enters at the boundary it crossed; a restored
        // plant keeps its saved position.
        let x = match data.get("migration_direction").and_then(Value::as_str) {
            Some("right") => 0.0,
            Some("left") => target.bounds().0,
            _ => require_f32(data, "x")?,
        };
        let y = require_f32(data, "y")?;
        let energy = require_f64(data, "energy")?;
        let max_energy = require_f64(data, "max_energy")?;
        let generation = data.get("generation").and_then(Value::as_u64).unwrap_or(0) as u32;

        // Plants are rooted: the destination must have a free root spot or
        // the transfer backs off with `no_root_spots`.
        let Some(root_spot) = target.claim_root_spot() else {
            return Err(TransferError::new(
                ErrorCode::NoRootSpots,
                "no available root spots",
            ));
        };
        let state = EntityState::Plant {
            energy,
            max_energy,
            generation,
            root_spot,
        };
        Ok(target.spawn(state, x, y))
    }
}

// ---------------------------------------------------------------------------
// Food
// ---------------------------------------------------------------------------

pub struct FoodCodec;

impl TransferCodec for FoodCodec {
    fn type_name(&self) -> &'static str {
        "food"
    }

    fn can_serialize(&self, entity: &Entity) -> bool {
        matches!(entity.state, EntityState::Food { .. })
    }

    fn serialize(
        &self,
        entity: &Entity,
        _ctx: &TransferContext,
    ) -> Result<SerializedEntity, TransferError> {
        let EntityState::Food {
            energy,
            ref food_type,
        } = entity.state
        else {
            return Err(TransferError::new(
                ErrorCode::UnsupportedEntity,
                "not food",
            ));
        };
        let mut data = SerializedEntity::new();
        data.insert("id".into(), Value::from(entity.id.clone()));
        data.insert("x".into(), Value::from(entity.x));
        data.insert("y".into(), Value::from(entity.y));
        data.insert("energy".into(), Value::from(energy));
        data.insert("food_type".into(), Value::from(food_type.clone()));
        Ok(data)
    }

    fn deserialize(
        &self,
        data: &SerializedEntity,
        target: &mut dyn WorldBackend,
    ) -> Result<EntityId, TransferError> {
        let x = require_f32(data, "x")?;
        let y = require_f32(data, "y")?;
        let state = EntityState::Food {
            energy: require_f64(data, "energy")?,
            food_type: require_str(data, "food_type")?.to_string(),
        };
        Ok(target.spawn(state, x, y))
    }
}

// ---------------------------------------------------------------------------
// Microbe
// ---------------------------------------------------------------------------

/// Microbes are petri-dish residents; they snapshot but do not migrate.
pub struct MicrobeCodec;

impl TransferCodec for MicrobeCodec {
    fn type_name(&self) -> &'static str {
        "microbe"
    }

    fn can_serialize(&self, entity: &Entity) -> bool {
        matches!(entity.state, EntityState::Microbe { .. })
    }

    fn serialize(
        &self,
        entity: &Entity,
        _ctx: &TransferContext,
    ) -> Result<SerializedEntity, TransferError> {
        let EntityState::Microbe {
            energy,
            generation,
            vel_x,
            vel_y,
        } = entity.state
        else {
            return Err(TransferError::new(
                ErrorCode::UnsupportedEntity,
                "not a microbe",
            ));
        };
        let mut data = SerializedEntity::new();
        data.insert("id".into(), Value::from(entity.id.clone()));
        data.insert("x".into(), Value::from(entity.x));
        data.insert("y".into(), Value::from(entity.y));
        data.insert("energy".into(), Value::from(energy));
        data.insert("generation".into(), Value::from(generation));
        data.insert("vel_x".into(), Value::from(vel_x));
        data.insert("vel_y".into(), Value::from(vel_y));
        Ok(data)
    }

    fn deserialize(
        &self,
        data: &SerializedEntity,
        target: &mut dyn WorldBackend,
    ) -> Result<EntityId, TransferError> {
        let x = require_f32(data, "x")?;
        let y = require_f32(data, "y")?;
        let state = EntityState::Microbe {
            energy: require_f64(data, "energy")?,
            generation: data.get("generation").and_then(Value::as_u64).unwrap_or(0) as u32,
            vel_x: opt_f32(data, "vel_x"),
            vel_y: opt_f32(data, "vel_y"),
        };
        Ok(target.spawn(state, x, y))
    }
}

// ---------------------------------------------------------------------------
// Nectar
// ---------------------------------------------------------------------------

/// Nectar blobs reference their source plant. Snapshot restore rewrites
/// `source_plant_id` to the freshly assigned plant id before calling this
/// codec (second restore pass).
pub struct NectarCodec;

impl TransferCodec for NectarCodec {
    fn type_name(&self) -> &'static str {
        "nectar"
    }

    fn can_serialize(&self, entity: &Entity) -> bool {
        matches!(entity.state, EntityState::Nectar { .. })
    }

    fn serialize(
        &self,
        entity: &Entity,
        _ctx: &TransferContext,
    ) -> Result<SerializedEntity, TransferError> {
        let EntityState::Nectar {
            energy,
            ref source_plant_id,
        } = entity.state
        else {
            return Err(TransferError::new(
                ErrorCode::UnsupportedEntity,
                "not nectar",
            ));
        };
        let mut data = SerializedEntity::new();
        data.insert("id".into(), Value::from(entity.id.clone()));
        data.insert("x".into(), Value::from(entity.x));
        data.insert("y".into(), Value::from(entity.y));
        data.insert("energy".into(), Value::from(energy));
        data.insert(
            "source_plant_id".into(),
            Value::from(source_plant_id.clone()),
        );
        Ok(data)
    }

    fn deserialize(
        &self,
        data: &SerializedEntity,
        target: &mut dyn WorldBackend,
    ) -> Result<EntityId, TransferError> {
        let x = require_f32(data, "x")?;
        let y = require_f32(data, "y")?;
        let source_plant_id = require_str(data, "source_plant_id")?.to_string();

        let is_plant = target
            .entity(&source_plant_id)
            .map(|e| matches!(e.state, EntityState::Plant { .. }))
            .unwrap_or(false);
        if !is_plant {
            return Err(TransferError::new(
                ErrorCode::DeserializeFailed,
                format!("source plant not present: {}", source_plant_id),
            )
            .with_context("source_plant_id", source_plant_id));
        }

        let state = EntityState::Nectar {
            energy: require_f64(data, "energy")?,
            source_plant_id,
        };
        Ok(target.spawn(state, x, y))
    }
}
