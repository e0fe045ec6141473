//! Integration coverage for `GameEngine::process_player_action`'s dispatch
//! table: actions not reachable by any unit test inside a single module
//! because they depend on the full engine (lock, idempotency cache,
//! availability gate) being wired together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use labyrinthia_engine::config::EngineConfig;
use labyrinthia_engine::llm_client::NullLlmClient;
use labyrinthia_engine::model::entity::{
    Abilities, AcComponents, CombatRuntime, Entity, EntityCore, PlayerEntity, Position, Stats,
};
use labyrinthia_engine::model::item::Item;
use labyrinthia_engine::model::map::{GameMap, GenerationMetadata};
use labyrinthia_engine::model::state::{Choice, EventChoiceContext, GameState};
use labyrinthia_engine::GameEngine;
use serde_json::json;

fn player() -> Entity {
    Entity::Player(PlayerEntity {
        core: EntityCore {
            id: "p1".into(),
            name: "Hero".into(),
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

fn base_state() -> GameState {
    let now = chrono::Utc::now();
    GameState {
        id: "game1".into(),
        player: player(),
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

fn engine() -> Arc<GameEngine> {
    GameEngine::new(EngineConfig::default(), Arc::new(NullLlmClient))
}

fn potion() -> Item {
    Item {
        id: "potion-1".into(),
        name: "Healing Potion".into(),
        description: String::new(),
        item_type: "consumable".into(),
        rarity: "common".into(),
        value: 10,
        weight: 0.5,
        properties: HashMap::new(),
        is_equippable: false,
        equip_slot: None,
        unique_key: None,
        equip_requirements: None,
        equip_passive_effects: vec![],
        affixes: vec![],
        set_id: None,
        set_thresholds: HashMap::new(),
        max_charges: Some(1),
        charges: Some(1),
        cooldown_turns: 0,
        current_cooldown: 0,
        effect_payload: Some(json!({"hp_delta": 5})),
        is_quest_item: false,
        quest_lock_reason: None,
        hint_level: Default::default(),
        trigger_hint: None,
        risk_hint: None,
        expected_outcomes: vec![],
        requires_use_confirmation: false,
    }
}

#[tokio::test]
async fn unknown_action_is_reported_without_panicking() {
    let engine = engine();
    engine.register_game("u1", "g1", base_state()).await;
    let result = engine.process_player_action("u1", "g1", "fly", json!({}), None).await;
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("UNKNOWN_ACTION"));
}

#[tokio::test]
async fn unregistered_game_reports_game_not_found() {
    let engine = engine();
    let result = engine.process_player_action("u1", "missing", "rest", json!({}), None).await;
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("GAME_NOT_FOUND"));
}

#[tokio::test]
async fn resolve_choice_dispatches_to_the_pending_trap_context() {
    let engine = engine();
    let mut state = base_state();
    state.pending_choice_context = Some(EventChoiceContext {
        id: "trap-1,1".to_string(),
        event_type: "trap".to_string(),
        title: "A pit trap blocks the way".to_string(),
        description: String::new(),
        context_data: json!({"tile_key": "1,1"}),
        choices: vec![Choice {
            id: "retreat".to_string(),
            text: "Retreat".to_string(),
            description: String::new(),
            consequences: json!({"action": "retreat"}),
            requirements: serde_json::Value::Null,
            is_available: true,
        }],
    });
    engine.register_game("u1", "g1", state).await;

    let result = engine
        .process_player_action("u1", "g1", "resolve_choice", json!({"context_id": "trap-1,1", "choice_id": "retreat"}), None)
        .await;

    assert!(result.success);
    assert_eq!(result.reason, "retreat");
    assert!(result.events.iter().any(|e| e.contains("step back")));
}

#[tokio::test]
async fn resolve_choice_without_a_pending_context_is_a_soft_failure() {
    let engine = engine();
    engine.register_game("u1", "g1", base_state()).await;

    let result = engine
        .process_player_action("u1", "g1", "resolve_choice", json!({"context_id": "trap-1,1", "choice_id": "retreat"}), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.reason, "no_pending_choice");
}

#[tokio::test]
async fn idempotent_use_item_replay_does_not_consume_twice() {
    let engine = engine();
    let mut state = base_state();
    state.player.core_mut().inventory.push(potion());
    engine.register_game("u1", "g1", state).await;

    let params = json!({"item_id": "potion-1"});
    let first = engine.process_player_action("u1", "g1", "use_item", params.clone(), Some("key-1")).await;
    assert!(first.success);
    assert!(!first.idempotent_replay);

    let second = engine.process_player_action("u1", "g1", "use_item", params, Some("key-1")).await;
    assert!(second.success);
    assert!(second.idempotent_replay);
    assert!(second.message.starts_with("idempotent replay:"));

    engine.close_game("u1", "g1").await.ok();
}
