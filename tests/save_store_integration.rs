//! End-to-end coverage of the close_game -> disk -> load_game round trip
//! against a real filesystem, rather than the unit-level `SaveStore` tests
//! that hand-roll a `std::env::temp_dir()` subpath per run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use labyrinthia_engine::config::EngineConfig;
use labyrinthia_engine::llm_client::NullLlmClient;
use labyrinthia_engine::model::entity::{
    Abilities, AcComponents, CombatRuntime, Entity, EntityCore, PlayerEntity, Position, Stats,
};
use labyrinthia_engine::model::map::{GameMap, GenerationMetadata};
use labyrinthia_engine::model::state::GameState;
use labyrinthia_engine::save_store::SaveStore;
use labyrinthia_engine::GameEngine;
use serde_json::json;

fn player(name: &str) -> Entity {
    Entity::Player(PlayerEntity {
        core: EntityCore {
            id: "p1".into(),
            name: name.to_string(),
            class: "fighter".into(),
            creature_type: "humanoid".into(),
            abilities: Abilities::default(),
            stats: Stats { ac_components: AcComponents { base: 10, ..Default::default() }, ..Default::default() },
            combat_runtime: CombatRuntime::default(),
            resistances: HashMap::new(),
            vulnerabilities: HashMap::new(),
            immunities: HashSet::new(),
            equipped_items: HashMap::new(),
            inventory: vec![],
            position: Position { x: 0, y: 0 },
            saving_throw_proficiencies: HashSet::new(),
            skill_proficiencies: HashSet::new(),
            proficiency_bonus: 2,
        },
    })
}

fn state(id: &str, name: &str) -> GameState {
    let now = chrono::Utc::now();
    GameState {
        id: id.to_string(),
        player: player(name),
        current_map: GameMap {
            id: "map1".into(),
            name: "Floor 1".into(),
            width: 1,
            height: 1,
            depth: 1,
            floor_theme: "stone".into(),
            tiles: HashMap::new(),
            generation_metadata: GenerationMetadata::default(),
        },
        monsters: vec![],
        quests: vec![],
        turn_count: 0,
        game_time: 0,
        created_at: now,
        last_saved: now,
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

#[tokio::test]
async fn close_game_persists_state_that_load_game_can_read_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = EngineConfig::default();
    config.storage.saves_dir = dir.path().to_string_lossy().into_owned();

    let engine = GameEngine::new(config.clone(), Arc::new(NullLlmClient));
    engine.register_game("alice", "g1", state("g1", "Alice")).await;
    engine.process_player_action("alice", "g1", "rest", json!({}), None).await;
    engine.close_game("alice", "g1").await.expect("close_game persists");

    let store = SaveStore::new(dir.path());
    let loaded = store.load_game("alice", "g1").await.expect("load_game finds the save close_game wrote");
    assert_eq!(loaded.id, "g1");
    assert_eq!(loaded.player.core().name, "Alice");
}

#[tokio::test]
async fn saves_are_isolated_per_user_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SaveStore::new(dir.path());

    store.save_game("alice", &state("g1", "Alice")).await.expect("save alice");
    store.save_game("bob", &state("g1", "Bob")).await.expect("save bob");

    let alice_saves = store.list_saves("alice").await.expect("list alice");
    let bob_saves = store.list_saves("bob").await.expect("list bob");
    assert_eq!(alice_saves.len(), 1);
    assert_eq!(bob_saves.len(), 1);
    assert_eq!(alice_saves[0].player_name, "Alice");
    assert_eq!(bob_saves[0].player_name, "Bob");
}
