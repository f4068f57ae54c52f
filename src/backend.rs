//! World backends: the simulation engines the server hosts.
//!
//! The core treats backends as opaque – it only relies on the
//! [`WorldBackend`] contract (reset, step, entity access, stats, root
//! spots, the energy ledger). The built-in `tank`, `petri` and `soccer`
//! backends are intentionally small; entity behaviour is not the point of
//! this crate, the hosting of it is.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde_json::{Map, Value};

use crate::error::WorldError;
use crate::protocol::EntityFrame;
use crate::types::{EntityId, WorldTypeMeta};

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Type-specific state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityState {
    Fish {
        energy: f64,
        max_energy: f64,
        age: u64,
        generation: u32,
        species: String,
        vel_x: f32,
        vel_y: f32,
    },
    Plant {
        energy: f64,
        max_energy: f64,
        generation: u32,
        /// Index of the claimed root spot in the hosting world.
        root_spot: usize,
    },
    Food {
        energy: f64,
        food_type: String,
    },
    Nectar {
        energy: f64,
        source_plant_id: EntityId,
    },
    Microbe {
        energy: f64,
        generation: u32,
        vel_x: f32,
        vel_y: f32,
    },
    Ball {
        vel_x: f32,
        vel_y: f32,
    },
    Player {
        team: String,
        vel_x: f32,
        vel_y: f32,
    },
}

/// One entity inside a world: an id (unique within the world), a position
/// and type-specific state.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub x: f32,
    pub y: f32,
    pub state: EntityState,
}

impl Entity {
    /// Stable type tag used by codecs and the migration eligibility check.
    pub fn snapshot_type(&self) -> &'static str {
        match self.state {
            EntityState::Fish { .. } => "fish",
            EntityState::Plant { .. } => "plant",
            EntityState::Food { .. } => "food",
            EntityState::Nectar { .. } => "nectar",
            EntityState::Microbe { .. } => "microbe",
            EntityState::Ball { .. } => "ball",
            EntityState::Player { .. } => "player",
        }
    }

    pub fn energy(&self) -> Option<f64> {
        match self.state {
            EntityState::Fish { energy, .. }
            | EntityState::Plant { energy, .. }
            | EntityState::Food { energy, .. }
            | EntityState::Nectar { energy, .. }
            | EntityState::Microbe { energy, .. } => Some(energy),
            _ => None,
        }
    }

    pub fn generation(&self) -> Option<u32> {
        match self.state {
            EntityState::Fish { generation, .. }
            | EntityState::Plant { generation, .. }
            | EntityState::Microbe { generation, .. } => Some(generation),
            _ => None,
        }
    }

    fn velocity(&self) -> (f32, f32) {
        match self.state {
            EntityState::Fish { vel_x, vel_y, .. }
            | EntityState::Microbe { vel_x, vel_y, .. }
            | EntityState::Ball { vel_x, vel_y }
            | EntityState::Player { vel_x, vel_y, .. } => (vel_x, vel_y),
            _ => (0.0, 0.0),
        }
    }

    /// Full wire frame for broadcast payloads.
    pub fn to_frame(&self) -> EntityFrame {
        let (vel_x, vel_y) = self.velocity();
        let mut frame = EntityFrame {
            id: self.id.clone(),
            entity_type: self.snapshot_type().to_string(),
            x: self.x,
            y: self.y,
            vel_x,
            vel_y,
            energy: self.energy(),
            max_energy: None,
            generation: self.generation(),
            age: None,
            species: None,
            food_type: None,
            source_plant_id: None,
        };
        match &self.state {
            EntityState::Fish {
                max_energy,
                age,
                species,
                ..
            } => {
                frame.max_energy = Some(*max_energy);
                frame.age = Some(*age);
                frame.species = Some(species.clone());
            }
            EntityState::Plant { max_energy, .. } => {
                frame.max_energy = Some(*max_energy);
            }
            EntityState::Food { food_type, .. } => {
                frame.food_type = Some(food_type.clone());
            }
            EntityState::Nectar {
                source_plant_id, ..
            } => {
                frame.source_plant_id = Some(source_plant_id.clone());
            }
            _ => {}
        }
        frame
    }
}

// ---------------------------------------------------------------------------
// Ecosystem stats & energy ledger
// ---------------------------------------------------------------------------

/// Births/deaths/generation counters plus the energy ledger every backend
/// maintains. Migration relies on the ledger to keep energy-in and
/// energy-out symmetric across a transfer.
#[derive(Debug, Clone, Default)]
pub struct EcosystemStats {
    pub births: u64,
    pub deaths: u64,
    pub generation: u32,
    pub death_causes: HashMap<String, u64>,
    pub energy_gains: HashMap<String, f64>,
    pub energy_burns: HashMap<String, f64>,
}

impl EcosystemStats {
    pub fn record_death(&mut self, cause: &str) {
        self.deaths += 1;
        *self.death_causes.entry(cause.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("step failed: {0}")]
pub struct StepError(pub String);

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Contract between the server core and a simulation engine.
///
/// Callers serialize access externally (the runner's lock); implementations
/// are plain single-threaded state machines.
pub trait WorldBackend: Send {
    fn world_type(&self) -> &'static str;

    /// World-space dimensions `(width, height)`.
    fn bounds(&self) -> (f32, f32);

    /// Reinitialise to a fresh population. Deterministic for a given seed.
    fn reset(&mut self, seed: Option<u64>, config: Option<&Value>);

    /// Advance the simulation by one frame.
    fn step(&mut self, actions: Option<&Value>) -> Result<(), StepError>;

    fn entities(&self) -> &[Entity];

    fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities().iter().find(|e| e.id == id)
    }

    /// Insert an entity, assigning a fresh id.
    fn spawn(&mut self, state: EntityState, x: f32, y: f32) -> EntityId;

    fn remove(&mut self, id: &str) -> Option<Entity>;

    /// Drop every entity and release all root spots.
    fn clear(&mut self);

    fn stats(&self) -> &EcosystemStats;

    fn stats_mut(&mut self) -> &mut EcosystemStats;

    /// Claim a free root spot for an incoming plant. `None` means the world
    /// is full – the `no_root_spots` back-pressure signal.
    fn claim_root_spot(&mut self) -> Option<usize> {
        None
    }

    fn record_energy_gain(&mut self, source: &str, amount: f64) {
        *self
            .stats_mut()
            .energy_gains
            .entry(source.to_string())
            .or_insert(0.0) += amount;
    }

    fn record_energy_burn(&mut self, reason: &str, amount: f64) {
        *self
            .stats_mut()
            .energy_burns
            .entry(reason.to_string())
            .or_insert(0.0) += amount;
    }

    /// World-type-specific extras for full frames (event lists, …).
    fn extras(&self) -> Map<String, Value> {
        Map::new()
    }

    /// World-type-specific commands forwarded from clients. `None` means
    /// the command is not recognised by this backend.
    fn handle_command(&mut self, command: &str, data: Option<&Value>) -> Option<Value> {
        let _ = (command, data);
        None
    }
}

// ---------------------------------------------------------------------------
// World type registry
// ---------------------------------------------------------------------------

/// Capabilities of every world type this server can host.
pub fn world_type_registry() -> Vec<WorldTypeMeta> {
    vec![
        WorldTypeMeta {
            mode_id: "tank".into(),
            world_type: "tank".into(),
            view_mode: "side".into(),
            display_name: "Tank".into(),
            supports_persistence: true,
            supports_actions: true,
            supports_websocket: true,
            supports_transfer: true,
        },
        WorldTypeMeta {
            mode_id: "petri".into(),
            world_type: "petri".into(),
            view_mode: "topdown".into(),
            display_name: "Petri Dish".into(),
            supports_persistence: true,
            supports_actions: false,
            supports_websocket: true,
            supports_transfer: true,
        },
        WorldTypeMeta {
            mode_id: "soccer".into(),
            world_type: "soccer".into(),
            view_mode: "topdown".into(),
            display_name: "Soccer Pitch".into(),
            supports_persistence: false,
            supports_actions: true,
            supports_websocket: true,
            supports_transfer: false,
        },
    ]
}

pub fn world_type_meta(world_type: &str) -> Option<WorldTypeMeta> {
    world_type_registry()
        .into_iter()
        .find(|m| m.world_type == world_type)
}

/// Instantiate a backend for `world_type`, already reset with `seed`.
pub fn create_backend(
    world_type: &str,
    seed: Option<u64>,
    config: Option<&Value>,
) -> Result<Box<dyn WorldBackend>, WorldError> {
    let mut backend: Box<dyn WorldBackend> = match world_type {
        "tank" => Box::new(TankBackend::new()),
        "petri" => Box::new(PetriBackend::new()),
        "soccer" => Box::new(SoccerBackend::new()),
        other => {
            return Err(WorldError::UnknownType {
                requested: other.to_string(),
                known: world_type_registry()
                    .into_iter()
                    .map(|m| m.world_type)
                    .collect(),
            })
        }
    };
    backend.reset(seed, config);
    Ok(backend)
}

// ---------------------------------------------------------------------------
// Tank backend
// ---------------------------------------------------------------------------

const TANK_WIDTH: f32 = 800.0;
const TANK_HEIGHT: f32 = 600.0;
const TANK_ROOT_SPOTS: usize = 12;
const FISH_METABOLISM: f64 = 0.05;
const EAT_RADIUS: f32 = 12.0;

/// A 2D aquarium: fish swim and eat, plants photosynthesise in fixed root
/// spots and shed nectar, food drifts to the floor.
pub struct TankBackend {
    width: f32,
    height: f32,
    entities: Vec<Entity>,
    root_spots: Vec<bool>,
    stats: EcosystemStats,
    rng: Pcg64,
    next_id: u64,
    food_timer: u32,
}

impl TankBackend {
    pub fn new() -> Self {
        Self {
            width: TANK_WIDTH,
            height: TANK_HEIGHT,
            entities: Vec::new(),
            root_spots: vec![false; TANK_ROOT_SPOTS],
            stats: EcosystemStats::default(),
            rng: Pcg64::seed_from_u64(0),
            next_id: 0,
            food_timer: 0,
        }
    }

    fn alloc_id(&mut self) -> EntityId {
        self.next_id += 1;
        format!("e{}", self.next_id)
    }

    fn spawn_fish(&mut self, x: f32, y: f32, generation: u32) -> EntityId {
        let species = if self.rng.gen_bool(0.5) { "guppy" } else { "tetra" };
        let vel_x = self.rng.gen_range(-2.0..2.0);
        let vel_y = self.rng.gen_range(-1.0..1.0);
        self.spawn(
            EntityState::Fish {
                energy: 60.0,
                max_energy: 100.0,
                age: 0,
                generation,
                species: species.to_string(),
                vel_x,
                vel_y,
            },
            x,
            y,
        )
    }

    fn spawn_food_at(&mut self, x: f32, y: f32) -> EntityId {
        self.spawn(
            EntityState::Food {
                energy: 10.0,
                food_type: "flake".to_string(),
            },
            x,
            y,
        )
    }
}

impl Default for TankBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldBackend for TankBackend {
    fn world_type(&self) -> &'static str {
        "tank"
    }

    fn bounds(&self) -> (f32, f32) {
        (self.width, self.height)
    }

    fn reset(&mut self, seed: Option<u64>, config: Option<&Value>) {
        self.clear();
        self.stats = EcosystemStats::default();
        self.rng = Pcg64::seed_from_u64(seed.unwrap_or(42));
        self.food_timer = 0;

        let fish_count = config
            .and_then(|c| c.get("fish_count"))
            .and_then(Value::as_u64)
            .unwrap_or(6) as usize;
        let plant_count = config
            .and_then(|c| c.get("plant_count"))
            .and_then(Value::as_u64)
            .unwrap_or(3) as usize;
        let food_count = config
            .and_then(|c| c.get("food_count"))
            .and_then(Value::as_u64)
            .unwrap_or(8) as usize;

        for _ in 0..fish_count {
            let x = self.rng.gen_range(0.0..self.width);
            let y = self.rng.gen_range(0.0..self.height * 0.8);
            self.spawn_fish(x, y, 0);
        }
        for _ in 0..plant_count.min(TANK_ROOT_SPOTS) {
            if let Some(root_spot) = self.claim_root_spot() {
                let x = (root_spot as f32 + 0.5) * self.width / TANK_ROOT_SPOTS as f32;
                let y = self.height - 10.0;
                self.spawn(
                    EntityState::Plant {
                        energy: 40.0,
                        max_energy: 80.0,
                        generation: 0,
                        root_spot,
                    },
                    x,
                    y,
                );
            }
        }
        for _ in 0..food_count {
            let x = self.rng.gen_range(0.0..self.width);
            let y = self.rng.gen_range(0.0..self.height);
            self.spawn_food_at(x, y);
        }
    }

    fn step(&mut self, _actions: Option<&Value>) -> Result<(), StepError> {
        let mut dead: Vec<(EntityId, &'static str)> = Vec::new();
        let mut eaten: Vec<EntityId> = Vec::new();
        let mut fish_births: Vec<(f32, f32, u32)> = Vec::new();
        let mut nectar_drops: Vec<(EntityId, f32, f32)> = Vec::new();

        // Positions of edible entities, captured before the mutable sweep.
        let meals: Vec<(EntityId, f32, f32, f64)> = self
            .entities
            .iter()
            .filter(|e| matches!(e.state, EntityState::Food { .. } | EntityState::Nectar { .. }))
            .map(|e| (e.id.clone(), e.x, e.y, e.energy().unwrap_or(0.0)))
            .collect();
        let mut claimed: Vec<&EntityId> = Vec::new();

        let (width, height) = (self.width, self.height);
        for entity in &mut self.entities {
            match &mut entity.state {
                EntityState::Fish {
                    energy,
                    max_energy,
                    age,
                    generation,
                    vel_x,
                    vel_y,
                    ..
                } => {
                    entity.x += *vel_x;
                    entity.y += *vel_y;
                    if entity.x < 0.0 || entity.x > width {
                        *vel_x = -*vel_x;
                        entity.x = entity.x.clamp(0.0, width);
                    }
                    if entity.y < 0.0 || entity.y > height {
                        *vel_y = -*vel_y;
                        entity.y = entity.y.clamp(0.0, height);
                    }
                    *age += 1;
                    *energy -= FISH_METABOLISM;

                    if *energy <= 0.0 {
                        dead.push((entity.id.clone(), "starvation"));
                        continue;
                    }

                    for (meal_id, mx, my, meal_energy) in &meals {
                        if claimed.contains(&meal_id) {
                            continue;
                        }
                        let dx = entity.x - mx;
                        let dy = entity.y - my;
                        if dx * dx + dy * dy <= EAT_RADIUS * EAT_RADIUS {
                            *energy = (*energy + meal_energy).min(*max_energy);
                            eaten.push(meal_id.clone());
                            claimed.push(meal_id);
                            break;
                        }
                    }

                    if *energy > 0.8 * *max_energy {
                        *energy *= 0.5;
                        fish_births.push((entity.x, entity.y, *generation + 1));
                    }
                }
                EntityState::Plant {
                    energy, max_energy, ..
                } => {
                    *energy = (*energy + 0.02).min(*max_energy);
                    if *energy > 0.6 * *max_energy {
                        *energy -= 5.0;
                        nectar_drops.push((entity.id.clone(), entity.x, entity.y - 20.0));
                    }
                }
                EntityState::Food { .. } | EntityState::Nectar { .. } => {
                    if entity.y < height - 4.0 {
                        entity.y += 0.5;
                    }
                }
                _ => {}
            }
        }

        for meal_id in eaten {
            if let Some(meal) = self.remove(&meal_id) {
                let source = match meal.state {
                    EntityState::Nectar { .. } => "nectar",
                    _ => "food",
                };
                self.record_energy_gain(source, meal.energy().unwrap_or(0.0));
            }
        }
        for (id, cause) in dead {
            if self.remove(&id).is_some() {
                self.stats.record_death(cause);
            }
        }
        for (x, y, generation) in fish_births {
            self.spawn_fish(x, y, generation);
            self.stats.births += 1;
            self.stats.generation = self.stats.generation.max(generation);
        }
        for (source_plant_id, x, y) in nectar_drops {
            self.spawn(
                EntityState::Nectar {
                    energy: 5.0,
                    source_plant_id,
                },
                x,
                y,
            );
        }

        // Ambient food drip so the tank never fully starves.
        self.food_timer += 1;
        if self.food_timer >= 90 {
            self.food_timer = 0;
            let x = self.rng.gen_range(0.0..self.width);
            self.spawn_food_at(x, 0.0);
        }

        Ok(())
    }

    fn entities(&self) -> &[Entity] {
        &self.entities
    }

    fn spawn(&mut self, state: EntityState, x: f32, y: f32) -> EntityId {
        let id = self.alloc_id();
        self.entities.push(Entity {
            id: id.clone(),
            x,
            y,
            state,
        });
        id
    }

    fn remove(&mut self, id: &str) -> Option<Entity> {
        let index = self.entities.iter().position(|e| e.id == id)?;
        let entity = self.entities.remove(index);
        if let EntityState::Plant { root_spot, .. } = entity.state {
            if let Some(taken) = self.root_spots.get_mut(root_spot) {
                *taken = false;
            }
        }
        Some(entity)
    }

    fn clear(&mut self) {
        self.entities.clear();
        self.root_spots = vec![false; TANK_ROOT_SPOTS];
    }

    fn stats(&self) -> &EcosystemStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut EcosystemStats {
        &mut self.stats
    }

    fn claim_root_spot(&mut self) -> Option<usize> {
        let free = self.root_spots.iter().position(|taken| !taken)?;
        self.root_spots[free] = true;
        Some(free)
    }

    fn handle_command(&mut self, command: &str, data: Option<&Value>) -> Option<Value> {
        match command {
            "add_food" => {
                let x = data
                    .and_then(|d| d.get("x"))
                    .and_then(Value::as_f64)
                    .map(|v| v as f32)
                    .unwrap_or_else(|| self.rng.gen_range(0.0..self.width));
                let y = data
                    .and_then(|d| d.get("y"))
                    .and_then(Value::as_f64)
                    .map(|v| v as f32)
                    .unwrap_or(0.0);
                let id = self.spawn_food_at(x, y);
                Some(serde_json::json!({ "success": true, "entity_id": id }))
            }
            "spawn_fish" => {
                let x = self.rng.gen_range(0.0..self.width);
                let y = self.rng.gen_range(0.0..self.height * 0.8);
                let id = self.spawn_fish(x, y, 0);
                self.stats.births += 1;
                Some(serde_json::json!({ "success": true, "entity_id": id }))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Petri backend
// ---------------------------------------------------------------------------

const PETRI_SIZE: f32 = 400.0;

/// A petri dish of drifting microbes that divide when fed and die when
/// starved. Top-down view, no root spots: incoming plants are refused.
pub struct PetriBackend {
    entities: Vec<Entity>,
    stats: EcosystemStats,
    rng: Pcg64,
    next_id: u64,
}

impl PetriBackend {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            stats: EcosystemStats::default(),
            rng: Pcg64::seed_from_u64(0),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> EntityId {
        self.next_id += 1;
        format!("m{}", self.next_id)
    }
}

impl Default for PetriBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldBackend for PetriBackend {
    fn world_type(&self) -> &'static str {
        "petri"
    }

    fn bounds(&self) -> (f32, f32) {
        (PETRI_SIZE, PETRI_SIZE)
    }

    fn reset(&mut self, seed: Option<u64>, config: Option<&Value>) {
        self.clear();
        self.stats = EcosystemStats::default();
        self.rng = Pcg64::seed_from_u64(seed.unwrap_or(7));
        let count = config
            .and_then(|c| c.get("microbe_count"))
            .and_then(Value::as_u64)
            .unwrap_or(12) as usize;
        for _ in 0..count {
            let x = self.rng.gen_range(0.0..PETRI_SIZE);
            let y = self.rng.gen_range(0.0..PETRI_SIZE);
            let vel_x = self.rng.gen_range(-1.0..1.0);
            let vel_y = self.rng.gen_range(-1.0..1.0);
            self.spawn(
                EntityState::Microbe {
                    energy: 20.0,
                    generation: 0,
                    vel_x,
                    vel_y,
                },
                x,
                y,
            );
        }
    }

    fn step(&mut self, _actions: Option<&Value>) -> Result<(), StepError> {
        let mut dead = Vec::new();
        let mut divisions = Vec::new();

        for entity in &mut self.entities {
            if let EntityState::Microbe {
                energy,
                generation,
                vel_x,
                vel_y,
            } = &mut entity.state
            {
                entity.x = (entity.x + *vel_x).rem_euclid(PETRI_SIZE);
                entity.y = (entity.y + *vel_y).rem_euclid(PETRI_SIZE);
                // Ambient nutrient gradient minus metabolism.
                *energy += 0.03;
                if *energy <= 0.0 {
                    dead.push(entity.id.clone());
                } else if *energy >= 40.0 {
                    *energy *= 0.5;
                    divisions.push((entity.x, entity.y, *generation + 1, *energy));
                }
            }
        }

        for id in dead {
            if self.remove(&id).is_some() {
                self.stats.record_death("starvation");
            }
        }
        for (x, y, generation, energy) in divisions {
            let vel_x = self.rng.gen_range(-1.0..1.0);
            let vel_y = self.rng.gen_range(-1.0..1.0);
            self.spawn(
                EntityState::Microbe {
                    energy,
                    generation,
                    vel_x,
                    vel_y,
                },
                x,
                y,
            );
            self.stats.births += 1;
            self.stats.generation = self.stats.generation.max(generation);
        }
        Ok(())
    }

    fn entities(&self) -> &[Entity] {
        &self.entities
    }

    fn spawn(&mut self, state: EntityState, x: f32, y: f32) -> EntityId {
        let id = self.alloc_id();
        self.entities.push(Entity {
            id: id.clone(),
            x,
            y,
            state,
        });
        id
    }

    fn remove(&mut self, id: &str) -> Option<Entity> {
        let index = self.entities.iter().position(|e| e.id == id)?;
        Some(self.entities.remove(index))
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

// ---------------------------------------------------------------------------
// Soccer backend
// ---------------------------------------------------------------------------

const PITCH_WIDTH: f32 = 600.0;
const PITCH_HEIGHT: f32 = 400.0;

/// A minimal soccer pitch: one ball, two teams of three. Exists to prove
/// the core hosts world types it knows nothing about; not persistent and
/// closed to transfers.
pub struct SoccerBackend {
    entities: Vec<Entity>,
    stats: EcosystemStats,
    rng: Pcg64,
    next_id: u64,
    goals: Vec<Value>,
}

impl SoccerBackend {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            stats: EcosystemStats::default(),
            rng: Pcg64::seed_from_u64(0),
            next_id: 0,
            goals: Vec::new(),
        }
    }

    fn alloc_id(&mut self) -> EntityId {
        self.next_id += 1;
        format!("p{}", self.next_id)
    }
}

impl Default for SoccerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldBackend for SoccerBackend {
    fn world_type(&self) -> &'static str {
        "soccer"
    }

    fn bounds(&self) -> (f32, f32) {
        (PITCH_WIDTH, PITCH_HEIGHT)
    }

    fn reset(&mut self, seed: Option<u64>, _config: Option<&Value>) {
        self.clear();
        self.stats = EcosystemStats::default();
        self.goals.clear();
        self.rng = Pcg64::seed_from_u64(seed.unwrap_or(1));
        let vel_x = self.rng.gen_range(-3.0..3.0);
        let vel_y = self.rng.gen_range(-3.0..3.0);
        self.spawn(
            EntityState::Ball { vel_x, vel_y },
            PITCH_WIDTH / 2.0,
            PITCH_HEIGHT / 2.0,
        );
        for team in ["home", "away"] {
            for i in 0..3 {
                let x = if team == "home" {
                    PITCH_WIDTH * 0.25
                } else {
                    PITCH_WIDTH * 0.75
                };
                let y = (i as f32 + 1.0) * PITCH_HEIGHT / 4.0;
                let vel_x = self.rng.gen_range(-1.5..1.5);
                let vel_y = self.rng.gen_range(-1.5..1.5);
                self.spawn(
                    EntityState::Player {
                        team: team.to_string(),
                        vel_x,
                        vel_y,
                    },
                    x,
                    y,
                );
            }
        }
    }

    fn step(&mut self, _actions: Option<&Value>) -> Result<(), StepError> {
        let mut goal: Option<&'static str> = None;
        for entity in &mut self.entities {
            let (vel_x, vel_y) = match &mut entity.state {
                EntityState::Ball { vel_x, vel_y } => (vel_x, vel_y),
                EntityState::Player { vel_x, vel_y, .. } => (vel_x, vel_y),
                _ => continue,
            };
            entity.x += *vel_x;
            entity.y += *vel_y;
            if entity.y < 0.0 || entity.y > PITCH_HEIGHT {
                *vel_y = -*vel_y;
                entity.y = entity.y.clamp(0.0, PITCH_HEIGHT);
            }
            if entity.x < 0.0 || entity.x > PITCH_WIDTH {
                if matches!(entity.state, EntityState::Ball { .. }) {
                    goal = Some(if entity.x < 0.0 { "away" } else { "home" });
                    entity.x = PITCH_WIDTH / 2.0;
                    entity.y = PITCH_HEIGHT / 2.0;
                } else {
                    entity.x = entity.x.clamp(0.0, PITCH_WIDTH);
                    if let EntityState::Player { vel_x, .. } = &mut entity.state {
                        *vel_x = -*vel_x;
                    }
                }
            }
        }
        if let Some(team) = goal {
            self.goals.push(serde_json::json!({ "team": team }));
            if self.goals.len() > 10 {
                self.goals.remove(0);
            }
        }
        Ok(())
    }

    fn entities(&self) -> &[Entity] {
        &self.entities
    }

    fn spawn(&mut self, state: EntityState, x: f32, y: f32) -> EntityId {
        let id = self.alloc_id();
        self.entities.push(Entity {
            id: id.clone(),
            x,
            y,
            state,
        });
        id
    }

    fn remove(&mut self, id: &str) -> Option<Entity> {
        let index = self.entities.iter().position(|e| e.id == id)?;
        Some(self.entities.remove(index))
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

    fn extras(&self) -> Map<String, Value> {
        let mut extras = Map::new();
        extras.insert("events".into(), Value::Array(self.goals.clone()));
        extras
    }
}
