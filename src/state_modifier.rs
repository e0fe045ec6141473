//! The sole write entry for player stats/abilities/inventory, map tiles,
//! monsters, quests, and patch batches. Every mutation produces a
//! `ModificationRecord`. Grounded in full on
//! `original_source/game_state_modifier.py`.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{MapGenerationConfig, ReleaseStage};
use crate::error::EngineError;
use crate::model::entity::{Ability, Entity};
use crate::model::item::Item;
use crate::model::map::{EventData, GameMap, MapTile, Terrain, TileCoord};
use crate::model::quest::ProgressBucket;
use crate::model::state::{GameState, GenerationMetrics, PatchBatchRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub record_type: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub source: String,
    pub target_id: String,
    pub changes: serde_json::Value,
    pub success: bool,
    pub error_message: Option<String>,
}

impl ModificationRecord {
    fn ok(record_type: &str, source: &str, target_id: &str, changes: serde_json::Value) -> Self {
        Self {
            record_type: record_type.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            target_id: target_id.to_string(),
            changes,
            success: true,
            error_message: None,
        }
    }

    fn err(record_type: &str, source: &str, target_id: &str, message: impl Into<String>) -> Self {
        Self {
            record_type: record_type.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            target_id: target_id.to_string(),
            changes: serde_json::Value::Null,
            success: false,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerUpdates {
    pub hp: Option<i32>,
    pub mp: Option<i32>,
    pub level: Option<i32>,
    pub abilities: HashMap<Ability, i32>,
    pub ac: Option<i32>,
    pub shield: Option<i32>,
    pub temporary_hp: Option<i32>,
    pub experience: Option<i32>,
    pub add_items: Vec<Item>,
    pub remove_item_ids: Vec<String>,
}

pub struct StateModifier;

const LEVEL_CAP: i32 = 100;

impl StateModifier {
    pub fn apply_player_updates(state: &mut GameState, updates: &PlayerUpdates, source: &str) -> ModificationRecord {
        let player_id = state.player.core().id.clone();
        let core = state.player.core_mut();

        if let Some(hp) = updates.hp {
            core.stats.hp = hp.clamp(0, core.stats.max_hp);
        }
        if let Some(mp) = updates.mp {
            core.stats.mp = mp.clamp(0, core.stats.max_mp);
        }
        if let Some(level) = updates.level {
            core.stats.level = level.clamp(1, LEVEL_CAP);
        }
        for (ability, value) in &updates.abilities {
            core.abilities.set(*ability, *value);
        }
        if let Some(ac) = updates.ac {
            core.stats.ac = ac.clamp(0, 50);
        }
        if let Some(shield) = updates.shield {
            core.combat_runtime.shield = shield.max(0);
        }
        if let Some(temp_hp) = updates.temporary_hp {
            core.combat_runtime.temporary_hp = temp_hp.max(0);
        }
        if let Some(exp) = updates.experience {
            core.stats.experience = exp.max(0);
        }
        core.sync_combat_runtime_mirrors();
        for item in &updates.add_items {
            core.inventory.push(item.clone());
        }
        core.inventory.retain(|i| !updates.remove_item_ids.contains(&i.id));

        crate::entity_manager::EntityManager::update_proficiency_bonus(&mut state.player);

        ModificationRecord::ok(
            "player_update",
            source,
            &player_id,
            serde_json::json!({"hp": updates.hp, "mp": updates.mp, "level": updates.level}),
        )
    }

    /// Loops level-ups while `exp >= level * 1000` (cap 100); each step
    /// raises maxHp by 10 and maxMp by 5, refills to max, and resets
    /// `exp -= level*1000`. Protective exit if level did not advance, and a
    /// hard iteration cap matching the level cap regardless of exp supplied.
    pub fn apply_player_progression_updates(state: &mut GameState, exp_gained: i32, source: &str) -> ModificationRecord {
        let player_id = state.player.core().id.clone();
        let core = state.player.core_mut();
        core.stats.experience += exp_gained.max(0);

        let mut levels_gained = 0;
        for _ in 0..LEVEL_CAP {
            if core.stats.level >= LEVEL_CAP {
                break;
            }
            let threshold = core.stats.level * 1000;
            if core.stats.experience < threshold {
                break;
            }
            let level_before = core.stats.level;
            core.stats.level += 1;
            if core.stats.level == level_before {
                // Protective exit: level failed to advance.
                break;
            }
            core.stats.max_hp += 10;
            core.stats.max_mp += 5;
            core.stats.hp = core.stats.max_hp;
            core.stats.mp = core.stats.max_mp;
            core.stats.experience -= threshold;
            levels_gained += 1;
        }

        crate::entity_manager::EntityManager::update_proficiency_bonus(&mut state.player);

        ModificationRecord::ok(
            "player_progression",
            source,
            &player_id,
            serde_json::json!({"exp_gained": exp_gained, "levels_gained": levels_gained}),
        )
    }

    pub fn apply_player_resource_delta(state: &mut GameState, hp_delta: i32, mp_delta: i32, source: &str) -> ModificationRecord {
        let player_id = state.player.core().id.clone();
        let core = state.player.core_mut();
        core.stats.hp = (core.stats.hp + hp_delta).clamp(0, core.stats.max_hp);
        core.stats.mp = (core.stats.mp + mp_delta).clamp(0, core.stats.max_mp);
        ModificationRecord::ok(
            "player_resource_delta",
            source,
            &player_id,
            serde_json::json!({"hp_delta": hp_delta, "mp_delta": mp_delta}),
        )
    }

    /// Fields permitted in a per-tile update payload, mirroring
    /// `generation_contract.py`'s `allowed_tile_fields`.
    pub const ALLOWED_TILE_FIELDS: [&'static str; 16] = [
        "terrain",
        "items",
        "monster",
        "has_event",
        "event_type",
        "event_data",
        "is_event_hidden",
        "event_triggered",
        "items_collected",
        "trap_detected",
        "trap_disarmed",
        "room_id",
        "room_type",
        "is_explored",
        "is_visible",
        "character_id",
    ];

    /// Strict contract validation: only the whitelisted root key `tiles` is
    /// permitted, keyed `"x,y"` within map bounds; unknown root keys or
    /// per-tile fields fail the whole call with the state unchanged.
    pub fn apply_map_updates(
        state: &mut GameState,
        map_updates: &serde_json::Map<String, serde_json::Value>,
        source: &str,
    ) -> Result<ModificationRecord, EngineError> {
        for root_key in map_updates.keys() {
            if root_key != "tiles" {
                return Err(EngineError::MapUpdatesContractUnauthorizedField(format!(
                    "unknown root key: {root_key}"
                )));
            }
        }
        let tiles = match map_updates.get("tiles").and_then(|v| v.as_object()) {
            Some(t) => t,
            None => {
                let map_id = state.current_map.id.clone();
                return Ok(ModificationRecord::ok("map_update", source, &map_id, serde_json::json!({})));
            }
        };

        for (tile_key, payload) in tiles {
            let coord = TileCoord::parse_key(tile_key).ok_or_else(|| {
                EngineError::MapUpdatesContractTypeError(format!("malformed tile key: {tile_key}"))
            })?;
            if !state.current_map.in_bounds(coord) {
                return Err(EngineError::MapUpdatesContractTypeError(format!(
                    "tile out of bounds: {tile_key}"
                )));
            }
            let obj = payload
                .as_object()
                .ok_or_else(|| EngineError::MapUpdatesContractTypeError(format!("tile payload not an object: {tile_key}")))?;
            for field in obj.keys() {
                if !Self::ALLOWED_TILE_FIELDS.contains(&field.as_str()) {
                    return Err(EngineError::MapUpdatesContractUnauthorizedField(format!(
                        "unauthorized tile field: {field}"
                    )));
                }
            }
        }

        // Validation passed for every tile; now apply.
        for (tile_key, payload) in tiles {
            let coord = TileCoord::parse_key(tile_key).expect("validated above");
            let obj = payload.as_object().expect("validated above");
            apply_tile_payload(&mut state.current_map, coord, obj);
        }

        let map_id = state.current_map.id.clone();
        Ok(ModificationRecord::ok(
            "map_update",
            source,
            &map_id,
            serde_json::json!({"tiles_updated": tiles.len()}),
        ))
    }

    /// Enforces the single-active-quest invariant: an explicit activation
    /// wins and deactivates every other quest; otherwise if multiple quests
    /// end up active, the first is kept and the rest deactivated.
    pub fn apply_quest_updates(state: &mut GameState, explicit_activate_id: Option<&str>, source: &str) -> ModificationRecord {
        if let Some(id) = explicit_activate_id {
            for quest in &mut state.quests {
                quest.is_active = quest.id == id;
            }
        } else {
            let mut seen_active = false;
            for quest in &mut state.quests {
                if quest.is_active {
                    if seen_active {
                        quest.is_active = false;
                    } else {
                        seen_active = true;
                    }
                }
            }
        }
        ModificationRecord::ok(
            "quest_update",
            source,
            explicit_activate_id.unwrap_or("none"),
            serde_json::json!({"active_quest": state.active_quest().map(|q| q.id.clone())}),
        )
    }
}

fn apply_tile_payload(map: &mut GameMap, coord: TileCoord, payload: &serde_json::Map<String, serde_json::Value>) {
    let key = coord.key();
    let tile = map
        .tiles
        .entry(key)
        .or_insert_with(|| MapTile::new(coord.x, coord.y, Terrain::Floor));

    if let Some(v) = payload.get("terrain").and_then(|v| v.as_str()) {
        if let Ok(t) = serde_json::from_value::<Terrain>(serde_json::Value::String(v.to_string())) {
            tile.terrain = t;
        }
    }
    if let Some(v) = payload.get("has_event").and_then(|v| v.as_bool()) {
        tile.has_event = v;
    }
    if let Some(v) = payload.get("event_type").and_then(|v| v.as_str()) {
        tile.event_type = Some(v.to_string());
    }
    if let Some(v) = payload.get("event_data") {
        if let Ok(e) = serde_json::from_value::<EventData>(v.clone()) {
            tile.event_data = Some(e);
        } else {
            tile.event_data = Some(EventData::Custom(v.clone()));
        }
    }
    if let Some(v) = payload.get("is_event_hidden").and_then(|v| v.as_bool()) {
        tile.is_event_hidden = v;
    }
    if let Some(v) = payload.get("event_triggered").and_then(|v| v.as_bool()) {
        tile.event_triggered = v;
    }
    if let Some(v) = payload.get("trap_detected").and_then(|v| v.as_bool()) {
        tile.trap_detected = v;
    }
    if let Some(v) = payload.get("trap_disarmed").and_then(|v| v.as_bool()) {
        tile.trap_disarmed = v;
    }
    if let Some(v) = payload.get("room_id").and_then(|v| v.as_u64()) {
        tile.room_id = Some(v as u32);
    }
    if let Some(v) = payload.get("room_type").and_then(|v| v.as_str()) {
        tile.room_type = Some(v.to_string());
    }
    if let Some(v) = payload.get("is_explored").and_then(|v| v.as_bool()) {
        tile.is_explored = v;
    }
    if let Some(v) = payload.get("is_visible").and_then(|v| v.as_bool()) {
        tile.is_visible = v;
    }
    if let Some(v) = payload.get("character_id") {
        tile.character_id = v.as_str().map(|s| s.to_string());
    }
    if let Some(v) = payload.get("monster").and_then(|v| v.as_str()) {
        tile.character_id = Some(v.to_string());
    }
    if let Some(arr) = payload.get("items_collected").and_then(|v| v.as_array()) {
        tile.items_collected = arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect();
    }
    if let Some(arr) = payload.get("items").and_then(|v| v.as_array()) {
        if let Ok(items) = serde_json::from_value::<Vec<Item>>(serde_json::Value::Array(arr.clone())) {
            tile.items = items;
        }
    }
}

// ---------------------------------------------------------------------
// Patch batches (§4.6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    Full,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchTarget {
    Tile,
    Event,
    Monster,
    QuestBinding,
    Room,
    Corridor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub op: PatchOp,
    pub target: PatchTarget,
    pub tile: Option<String>,
    pub payload: serde_json::Value,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub intent_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchBatch {
    pub batch_id: String,
    pub patches: Vec<Patch>,
    pub rollback_mode: RollbackMode,
    #[serde(default)]
    pub depends_on_batch: Option<String>,
}

struct Snapshot {
    tiles: HashMap<String, MapTile>,
    monsters: Vec<Entity>,
    quests: Vec<crate::model::quest::Quest>,
    pending_events: Vec<String>,
    generation_metrics: GenerationMetrics,
}

fn take_snapshot(state: &GameState) -> Snapshot {
    Snapshot {
        tiles: state.current_map.tiles.clone(),
        monsters: state.monsters.clone(),
        quests: state.quests.clone(),
        pending_events: state.pending_events.clone(),
        generation_metrics: state.generation_metrics.clone(),
    }
}

fn restore_snapshot(state: &mut GameState, snapshot: Snapshot) {
    state.current_map.tiles = snapshot.tiles;
    state.monsters = snapshot.monsters;
    state.quests = snapshot.quests;
    state.pending_events = snapshot.pending_events;
    state.generation_metrics = snapshot.generation_metrics;
}

fn apply_one_patch(state: &mut GameState, patch: &Patch) -> Result<(), EngineError> {
    match patch.target {
        PatchTarget::Tile => {
            let tile_key = patch.tile.as_ref().ok_or_else(|| {
                EngineError::PatchBatchFieldError("tile patch missing tile key".to_string())
            })?;
            let mut tiles_obj = serde_json::Map::new();
            tiles_obj.insert(tile_key.clone(), patch.payload.clone());
            let mut root = serde_json::Map::new();
            root.insert("tiles".to_string(), serde_json::Value::Object(tiles_obj));
            StateModifier::apply_map_updates(state, &root, "patch_batch").map(|_| ())
        }
        PatchTarget::Monster => {
            apply_monster_patch(state, patch);
            Ok(())
        }
        PatchTarget::Event | PatchTarget::QuestBinding | PatchTarget::Room | PatchTarget::Corridor => {
            // These target kinds carry free-form payloads consumed by the
            // map orchestrator/quest binder; recorded as a pending event for
            // downstream processing rather than mutated here directly.
            state.pending_events.push(format!("patch:{:?}:{}", patch.target, patch.id));
            Ok(())
        }
    }
}

fn apply_monster_patch(state: &mut GameState, patch: &Patch) {
    match patch.op {
        PatchOp::Remove => {
            if let Some(id) = patch.payload.get("id").and_then(|v| v.as_str()) {
                state.monsters.retain(|m| m.core().id != id);
            }
        }
        PatchOp::Add | PatchOp::Update => {
            // Monster construction from a generative payload is owned by
            // MonsterSpawnManager; here we only maintain the tile
            // character_id back-reference when a monster already exists.
            if let Some(id) = patch.payload.get("id").and_then(|v| v.as_str()) {
                if let Some(tile_key) = patch.tile.as_ref() {
                    if let Some(coord) = TileCoord::parse_key(tile_key) {
                        if let Some(tile) = state.current_map.get_tile_mut(coord) {
                            tile.character_id = Some(id.to_string());
                        }
                    }
                }
            }
        }
    }
}

fn post_check_connectivity(map: &GameMap) -> bool {
    let start = map
        .tiles
        .values()
        .find(|t| t.terrain == Terrain::StairsUp)
        .or_else(|| map.tiles.values().find(|t| t.terrain.is_walkable()));
    let start = match start {
        Some(t) => t.coord(),
        None => return true,
    };
    let reachable = map.reachable_from(start);
    let walkable_count = map.walkable_tiles().count();
    reachable.len() >= walkable_count
}

fn post_check_stairs_legality(map: &GameMap, max_depth: i32) -> bool {
    let has_up = map.tiles.values().any(|t| t.terrain == Terrain::StairsUp);
    let has_down = map.tiles.values().any(|t| t.terrain == Terrain::StairsDown);
    if map.depth <= 1 && has_up {
        return false;
    }
    if map.depth >= max_depth && has_down {
        return false;
    }
    true
}

fn post_check_no_monster_event_collision(state: &GameState) -> bool {
    for monster in &state.monsters {
        if let Some(pos_tile) = state
            .current_map
            .get_tile(TileCoord { x: monster.core().position.x, y: monster.core().position.y })
        {
            if pos_tile.has_event {
                return false;
            }
        }
    }
    true
}

fn post_check_progress_budget(state: &GameState) -> bool {
    state.quests.iter().all(|quest| {
        [
            ProgressBucket::Events,
            ProgressBucket::QuestMonsters,
            ProgressBucket::MapTransition,
            ProgressBucket::ExplorationBuffer,
        ]
        .into_iter()
        .all(|bucket| quest.ledger_sum(bucket) <= quest.progress_plan.budget.get(bucket) + 1e-6)
    })
}

pub fn apply_patch_batch(
    state: &mut GameState,
    batch: &PatchBatch,
    map_gen_config: &MapGenerationConfig,
    max_depth: i32,
) -> Result<ModificationRecord, EngineError> {
    if let Some(dep) = &batch.depends_on_batch {
        if state.generation_metrics.last_patch_batch_id.as_deref() != Some(dep.as_str()) {
            return Err(EngineError::PatchBatchDependencyError(format!(
                "expected last batch {dep}, found {:?}",
                state.generation_metrics.last_patch_batch_id
            )));
        }
    }

    let first_snapshot = take_snapshot(state);
    let mut applied_ids = Vec::new();
    let high_risk_blocked = matches!(map_gen_config.release_stage, ReleaseStage::Debug | ReleaseStage::Canary)
        && map_gen_config.disable_high_risk_patch;

    for patch in &batch.patches {
        if high_risk_blocked && patch.risk_level >= RiskLevel::High {
            let record = PatchBatchRecord {
                batch_id: batch.batch_id.clone(),
                applied_patch_ids: applied_ids.clone(),
                rollback_applied: true,
                success: false,
                diagnostics: vec!["high_risk_patch_blocked".to_string()],
            };
            restore_snapshot(state, first_snapshot);
            state.generation_metrics.push_patch_batch(record);
            return Err(EngineError::PatchPostCheckFailed("high_risk_patch_blocked".to_string()));
        }

        let before_patch_snapshot = take_snapshot(state);
        match apply_one_patch(state, patch) {
            Ok(()) => applied_ids.push(patch.id.clone()),
            Err(e) => {
                match batch.rollback_mode {
                    RollbackMode::Partial => restore_snapshot(state, before_patch_snapshot),
                    RollbackMode::Full => {
                        restore_snapshot(state, first_snapshot);
                        state.generation_metrics.push_patch_batch(PatchBatchRecord {
                            batch_id: batch.batch_id.clone(),
                            applied_patch_ids: vec![],
                            rollback_applied: true,
                            success: false,
                            diagnostics: vec![e.to_string()],
                        });
                        return Err(e);
                    }
                }
            }
        }
    }

    let mut diagnostics = Vec::new();
    if !post_check_connectivity(&state.current_map) {
        diagnostics.push("connectivity_failed".to_string());
    }
    if !post_check_stairs_legality(&state.current_map, max_depth) {
        diagnostics.push("stairs_legality_failed".to_string());
    }
    if !post_check_no_monster_event_collision(state) {
        diagnostics.push("monster_event_collision".to_string());
    }
    if !post_check_progress_budget(state) {
        diagnostics.push("progress_budget_exceeded".to_string());
    }

    if !diagnostics.is_empty() {
        restore_snapshot(state, first_snapshot);
        state.generation_metrics.push_patch_batch(PatchBatchRecord {
            batch_id: batch.batch_id.clone(),
            applied_patch_ids: vec![],
            rollback_applied: true,
            success: false,
            diagnostics: diagnostics.clone(),
        });
        return Err(EngineError::PatchPostCheckFailed(diagnostics.join(",")));
    }

    state.generation_metrics.push_patch_batch(PatchBatchRecord {
        batch_id: batch.batch_id.clone(),
        applied_patch_ids: applied_ids.clone(),
        rollback_applied: false,
        success: true,
        diagnostics: vec![],
    });

    Ok(ModificationRecord::ok(
        "patch_batch",
        "patch_batch",
        &batch.batch_id,
        serde_json::json!({"applied": applied_ids}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, EntityCore, PlayerEntity, Position, Stats};
    use crate::model::map::GenerationMetadata;
    use crate::model::quest::{CompletionGuard, CompletionPolicy, ProgressBudget, ProgressPlan, Quest};
    use std::collections::{HashMap as StdHashMap, HashSet};

    fn make_state() -> GameState {
        let mut tiles = StdHashMap::new();
        tiles.insert("0,0".to_string(), MapTile::new(0, 0, Terrain::Floor));
        tiles.insert("1,0".to_string(), MapTile::new(1, 0, Terrain::Floor));
        let map = GameMap {
            id: "map1".into(),
            name: "Floor 1".into(),
            width: 2,
            height: 1,
            depth: 1,
            floor_theme: "stone".into(),
            tiles,
            generation_metadata: GenerationMetadata::default(),
        };
        let player = Entity::Player(PlayerEntity {
            core: EntityCore {
                id: "player1".into(),
                name: "Hero".into(),
                class: "fighter".into(),
                creature_type: "humanoid".into(),
                abilities: Abilities::default(),
                stats: Stats {
                    ac_components: AcComponents { base: 10, ..Default::default() },
                    ..Default::default()
                },
                combat_runtime: CombatRuntime::default(),
                resistances: StdHashMap::new(),
                vulnerabilities: StdHashMap::new(),
                immunities: HashSet::new(),
                equipped_items: StdHashMap::new(),
                inventory: vec![],
                position: Position { x: 0, y: 0 },
                saving_throw_proficiencies: HashSet::new(),
                skill_proficiencies: HashSet::new(),
                proficiency_bonus: 2,
            },
        });
        GameState {
            id: "game1".into(),
            player,
            current_map: map,
            monsters: vec![],
            quests: vec![],
            turn_count: 0,
            game_time: 0,
            created_at: Utc::now(),
            last_saved: Utc::now(),
            is_game_over: false,
            game_over_reason: None,
            pending_events: vec![],
            pending_effects: vec![],
            pending_choice_context: None,
            pending_quest_completion: None,
            pending_new_quest_generation: false,
            pending_map_transition: None,
            undo_tokens: vec![],
            combat_rules: Default::default(),
            combat_rule_version: 1,
            combat_authority_mode: Default::default(),
            combat_snapshot: None,
            generation_metrics: Default::default(),
            migration_history: vec![],
        }
    }

    #[test]
    fn map_update_rejects_unknown_root_key() {
        let mut state = make_state();
        let mut root = serde_json::Map::new();
        root.insert("monsters".to_string(), serde_json::json!({}));
        let result = StateModifier::apply_map_updates(&mut state, &root, "test");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), "MAP_UPDATES_CONTRACT_UNAUTHORIZED_FIELD");
    }

    #[test]
    fn map_update_rejects_unknown_tile_field() {
        let mut state = make_state();
        let mut tiles = serde_json::Map::new();
        tiles.insert("0,0".to_string(), serde_json::json!({"not_a_field": true}));
        let mut root = serde_json::Map::new();
        root.insert("tiles".to_string(), serde_json::Value::Object(tiles));
        let result = StateModifier::apply_map_updates(&mut state, &root, "test");
        assert!(result.is_err());
    }

    #[test]
    fn map_update_applies_whitelisted_fields() {
        let mut state = make_state();
        let mut tiles = serde_json::Map::new();
        tiles.insert("0,0".to_string(), serde_json::json!({"has_event": true, "event_type": "story"}));
        let mut root = serde_json::Map::new();
        root.insert("tiles".to_string(), serde_json::Value::Object(tiles));
        let result = StateModifier::apply_map_updates(&mut state, &root, "test").unwrap();
        assert!(result.success);
        assert!(state.current_map.get_tile(TileCoord { x: 0, y: 0 }).unwrap().has_event);
    }

    #[test]
    fn single_active_quest_invariant_explicit_activation() {
        let mut state = make_state();
        let mut q1 = sample_quest("q1");
        q1.is_active = true;
        let mut q2 = sample_quest("q2");
        q2.is_active = true;
        state.quests = vec![q1, q2];
        StateModifier::apply_quest_updates(&mut state, Some("q2"), "test");
        assert!(!state.quests[0].is_active);
        assert!(state.quests[1].is_active);
    }

    #[test]
    fn single_active_quest_invariant_implicit_keeps_first() {
        let mut state = make_state();
        let mut q1 = sample_quest("q1");
        q1.is_active = true;
        let mut q2 = sample_quest("q2");
        q2.is_active = true;
        state.quests = vec![q1, q2];
        StateModifier::apply_quest_updates(&mut state, None, "test");
        assert!(state.quests[0].is_active);
        assert!(!state.quests[1].is_active);
    }

    #[test]
    fn progression_levels_up_and_refills_resources() {
        let mut state = make_state();
        state.player.core_mut().stats.max_hp = 10;
        state.player.core_mut().stats.hp = 5;
        StateModifier::apply_player_progression_updates(&mut state, 1000, "test");
        assert_eq!(state.player.core().stats.level, 2);
        assert_eq!(state.player.core().stats.max_hp, 20);
        assert_eq!(state.player.core().stats.hp, 20);
    }

    #[test]
    fn patch_budget_violation_rolls_back() {
        let mut state = make_state();
        let mut quest = sample_quest("q1");
        quest.progress_plan.budget.events = 1.0;
        quest.push_ledger(ProgressBucket::Events, 2.0, "seed");
        state.quests = vec![quest];
        let snapshot_tiles = state.current_map.tiles.clone();

        let batch = PatchBatch {
            batch_id: "b1".into(),
            patches: vec![Patch {
                id: "p1".into(),
                op: PatchOp::Update,
                target: PatchTarget::Tile,
                tile: Some("0,0".to_string()),
                payload: serde_json::json!({"has_event": true, "event_type": "story"}),
                risk_level: RiskLevel::Low,
                intent_reason: "test".into(),
            }],
            rollback_mode: RollbackMode::Full,
            depends_on_batch: None,
        };
        let cfg = MapGenerationConfig::default();
        let result = apply_patch_batch(&mut state, &batch, &cfg, 5);
        assert!(result.is_err());
        assert_eq!(state.current_map.tiles, snapshot_tiles);
        assert!(state.generation_metrics.patch_batches.back().unwrap().rollback_applied);
    }

    fn sample_quest(id: &str) -> Quest {
        Quest {
            id: id.to_string(),
            title: "Quest".into(),
            description: String::new(),
            quest_type: "main".into(),
            is_active: false,
            is_completed: false,
            progress_percentage: 0.0,
            objectives: vec![],
            completed_objectives: vec![],
            special_monsters: vec![],
            special_events: vec![],
            target_floors: vec![1],
            progress_plan: ProgressPlan {
                completion_policy: CompletionPolicy::Hybrid,
                budget: ProgressBudget {
                    events: 10.0,
                    quest_monsters: 10.0,
                    map_transition: 10.0,
                    exploration_buffer: 10.0,
                },
                final_objective_id: None,
            },
            completion_guard: CompletionGuard::default(),
            progress_ledger: vec![],
            story_context: String::new(),
            llm_notes: String::new(),
            experience_reward: 0,
        }
    }
}
