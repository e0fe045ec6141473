//! The orchestrator. Grounded on spec §4.15 directly — the
//! `original_source` game engine is a 4400+ line module not excerpted in
//! full in the retrieved pack, so the dispatch table and per-action
//! semantics here follow the specification's own description rather than a
//! ported file. Concurrency shape (per-game lock, bounded worker pools,
//! cooperative cancellation) is grounded on [[lock_manager]]/[[task_manager]]
//! and the `mk-server`/`ai-bridge` tokio idiom noted in `DESIGN.md`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use crate::combat::evaluator::{self, AuthorityMode as EvalAuthorityMode, BreakdownRow, CombatProjection, MitigationPolicy};
use crate::config::{CombatAuthorityMode, EngineConfig};
use crate::effect_engine::EffectEngine;
use crate::error::EngineError;
use crate::event_choice::{EventChoiceFactory, EventChoiceSystem};
use crate::idempotency::{IdempotencyCache, Lookup};
use crate::llm_client::LlmClient;
use crate::lock_manager::GameStateLockManager;
use crate::map_orchestrator::{MapGenerationRequest, MapOrchestrator};
use crate::model::entity::{Ability, DamageType, Entity, MonsterEntity, Position};
use crate::model::item::Item;
use crate::model::map::{EventData, TileCoord};
use crate::model::state::{GameState, PendingMapTransition, TransitionDirection, UndoToken};
use crate::monster_spawn::MonsterSpawnManager;
use crate::progress::compensator::QuestProgressCompensator;
use crate::progress::manager::{ProgressContext, ProgressEventType, ProgressManager};
use crate::roll_resolver::{self, AttackType};
use crate::save_store::SaveStore;
use crate::session_registry::SessionRegistry;
use crate::state_modifier::StateModifier;
use crate::task_manager::{TaskManager, TaskType};
use crate::trap_manager::TrapManager;

/// Actions that may carry an `idempotency_key` and are cached/replayed.
const IDEMPOTENT_ACTIONS: &[&str] = &["use_item", "drop_item", "attack"];

/// How many turns an undo token for a dropped item stays valid.
const DROP_UNDO_VALID_TURNS: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerformanceSample {
    pub turn_elapsed_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    pub reason: String,
    pub events: Vec<String>,
    pub error_code: Option<String>,
    pub retryable: bool,
    #[serde(default)]
    pub impact_summary: Value,
    pub action_trace_id: Option<String>,
    #[serde(default)]
    pub idempotent_replay: bool,
    #[serde(default)]
    pub llm_interaction_required: bool,
    pub narrative: Option<String>,
    pub performance: Option<PerformanceSample>,
    pub combat_breakdown: Option<Vec<BreakdownRow>>,
    pub combat_projection: Option<CombatProjection>,
}

impl ActionResult {
    fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), reason: "ok".to_string(), ..Default::default() }
    }

    fn soft_fail(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), reason: reason.into(), ..Default::default() }
    }
}

fn err_result(err: EngineError) -> ActionResult {
    ActionResult {
        success: false,
        message: err.message(),
        reason: err.code().to_string(),
        error_code: Some(err.code().to_string()),
        retryable: err.retryable(),
        ..Default::default()
    }
}

fn to_eval_mode(mode: CombatAuthorityMode) -> EvalAuthorityMode {
    match mode {
        CombatAuthorityMode::Local => EvalAuthorityMode::Local,
        CombatAuthorityMode::Hybrid => EvalAuthorityMode::Hybrid,
        CombatAuthorityMode::Server => EvalAuthorityMode::Server,
    }
}

fn seed_from_sha1(s: &str) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(bytes)
}

/// Canonical safe-parameter fingerprint per action, per spec §5.
fn fingerprint(action: &str, params: &Value) -> Value {
    match action {
        "attack" => json!({ "target_id": params.get("target_id").cloned().unwrap_or(Value::Null) }),
        "use_item" | "drop_item" => json!({
            "item_id": params.get("item_id").cloned().unwrap_or(Value::Null),
            "force": params.get("force").cloned().unwrap_or(json!(false)),
        }),
        "cast_spell" => json!({
            "spell_id": params.get("spell_id").cloned().unwrap_or(Value::Null),
            "target_id": params.get("target_id").cloned().unwrap_or(Value::Null),
        }),
        _ => Value::Null,
    }
}

fn monster_exp_reward(monster: &Entity) -> i64 {
    let core = monster.core();
    core.stats.level.max(1) as i64 * 10 + core.stats.max_hp as i64 / 5
}

#[derive(Default)]
struct CombatTelemetry {
    samples_ms: VecDeque<u64>,
    total_count: u64,
    error_count: u64,
}

impl CombatTelemetry {
    const MAX_SAMPLES: usize = 200;

    fn record(&mut self, elapsed_ms: u64, was_error: bool) {
        self.samples_ms.push_back(elapsed_ms);
        if self.samples_ms.len() > Self::MAX_SAMPLES {
            self.samples_ms.pop_front();
        }
        self.total_count += 1;
        if was_error {
            self.error_count += 1;
        }
    }

    fn percentile(&self, pct: f64) -> u64 {
        if self.samples_ms.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples_ms.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn error_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_count as f64
        }
    }
}

/// The single orchestrator instance a host binds its games through. Held in
/// an `Arc` so its background auto-save/cleanup loops can hold a handle back
/// to `self` without a separate supervisor type.
pub struct GameEngine {
    config: EngineConfig,
    games: Mutex<HashMap<(String, String), GameState>>,
    lock_manager: GameStateLockManager,
    task_manager: Arc<TaskManager>,
    save_store: Arc<SaveStore>,
    session_registry: Arc<SessionRegistry>,
    idempotency: IdempotencyCache,
    llm_client: Arc<dyn LlmClient>,
    map_orchestrator: MapOrchestrator,
    trap_manager: TrapManager,
    progress_manager: ProgressManager,
    compensator: QuestProgressCompensator,
    auto_save_tasks: Mutex<HashMap<(String, String), String>>,
    combat_telemetry: Mutex<CombatTelemetry>,
}

impl GameEngine {
    pub fn new(config: EngineConfig, llm_client: Arc<dyn LlmClient>) -> Arc<Self> {
        let task_manager = Arc::new(TaskManager::new(config.combat.max_concurrent_llm_requests));
        let save_store = Arc::new(SaveStore::new(config.storage.saves_dir.clone()));
        Arc::new(Self {
            map_orchestrator: MapOrchestrator::new(llm_client.clone()),
            progress_manager: ProgressManager::new(llm_client.clone()),
            compensator: QuestProgressCompensator,
            trap_manager: TrapManager::default(),
            lock_manager: GameStateLockManager::new(),
            session_registry: Arc::new(SessionRegistry::new()),
            idempotency: IdempotencyCache::new(Duration::from_secs(config.session.idempotency_ttl_secs), config.session.idempotency_cache_cap),
            auto_save_tasks: Mutex::new(HashMap::new()),
            combat_telemetry: Mutex::new(CombatTelemetry::default()),
            task_manager,
            save_store,
            llm_client,
            games: Mutex::new(HashMap::new()),
            config,
        })
    }

    fn mitigation_policy(&self) -> MitigationPolicy {
        MitigationPolicy {
            resistance_clamp_min: self.config.combat.resistance_clamp_min,
            resistance_clamp_max: self.config.combat.resistance_clamp_max,
            vulnerability_multiplier_min: self.config.combat.vulnerability_multiplier_min,
            vulnerability_multiplier_max: self.config.combat.vulnerability_multiplier_max,
            critical_multiplier: self.config.combat.critical_multiplier,
            ..Default::default()
        }
    }

    /// Registers a freshly created/loaded game, starting its auto-save task.
    /// Separate from `process_player_action` so a host can add a game once
    /// at load time.
    pub async fn register_game(self: &Arc<Self>, user_id: &str, game_id: &str, state: GameState) {
        self.games.lock().await.insert((user_id.to_string(), game_id.to_string()), state);
        self.session_registry.touch(user_id, game_id).await;
        self.spawn_auto_save(user_id, game_id).await;
    }

    async fn spawn_auto_save(self: &Arc<Self>, user_id: &str, game_id: &str) {
        let engine = self.clone();
        let user_id = user_id.to_string();
        let game_id = game_id.to_string();
        let interval = Duration::from_secs(self.config.session.auto_save_interval_secs);
        let task_id = self.task_manager.spawn(TaskType::AutoSave, &format!("auto_save:{user_id}:{game_id}"), async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = engine.save_now(&user_id, &game_id).await {
                    log::warn!("auto-save failed for {user_id}/{game_id}: {e}");
                }
            }
        });
        self.auto_save_tasks.lock().await.insert((user_id.to_string(), game_id.to_string()), task_id);
    }

    async fn save_now(&self, user_id: &str, game_id: &str) -> Result<(), EngineError> {
        let snapshot = {
            let games = self.games.lock().await;
            games.get(&(user_id.to_string(), game_id.to_string())).cloned()
        };
        let Some(mut state) = snapshot else { return Ok(()) };
        state.last_saved = chrono::Utc::now();
        self.save_store.save_game(user_id, &state).await
    }

    /// Cancels the auto-save task, saves once more, and drops the lock and
    /// in-memory state for this game.
    pub async fn close_game(self: &Arc<Self>, user_id: &str, game_id: &str) -> Result<(), EngineError> {
        if let Some(task_id) = self.auto_save_tasks.lock().await.remove(&(user_id.to_string(), game_id.to_string())) {
            self.task_manager.cancel_task(&task_id, true).await;
        }
        let _guard = self.lock_manager.lock_game_state(user_id, game_id, "close_game").await;
        self.save_now(user_id, game_id).await?;
        self.games.lock().await.remove(&(user_id.to_string(), game_id.to_string()));
        self.lock_manager.remove_lock(user_id, game_id).await;
        self.session_registry.forget(user_id, game_id).await;
        Ok(())
    }

    /// Background loop closing games whose last activity exceeds
    /// `game_session_timeout_secs`, run every `session_cleanup_interval_secs`.
    pub fn spawn_session_cleanup(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(engine.config.session.session_cleanup_interval_secs);
            let timeout = Duration::from_secs(engine.config.session.game_session_timeout_secs);
            loop {
                tokio::time::sleep(interval).await;
                for (user_id, game_id) in engine.session_registry.idle_sessions(timeout).await {
                    log::info!("closing idle session {user_id}/{game_id}");
                    if let Err(e) = engine.close_game(&user_id, &game_id).await {
                        log::warn!("idle session close failed for {user_id}/{game_id}: {e}");
                    }
                }
                engine.lock_manager.cleanup_unused_locks(Duration::from_secs(engine.config.session.idle_lock_cleanup_secs)).await;
            }
        });
    }

    /// The full §4.15 dispatch: lock, idempotency, availability gate,
    /// per-action handler, post-turn bookkeeping, narrative request.
    pub async fn process_player_action(
        self: &Arc<Self>,
        user_id: &str,
        game_id: &str,
        action: &str,
        params: Value,
        idempotency_key: Option<&str>,
    ) -> ActionResult {
        let start = Instant::now();
        let _guard = self.lock_manager.lock_game_state(user_id, game_id, action).await;
        self.session_registry.touch(user_id, game_id).await;

        let mut games = self.games.lock().await;
        let Some(state) = games.get_mut(&(user_id.to_string(), game_id.to_string())) else {
            return err_result(EngineError::GameNotFound(game_id.to_string()));
        };

        if state.combat_rule_version == 0 {
            state.combat_rules = Default::default();
            state.combat_rule_version = 1;
        }

        if IDEMPOTENT_ACTIONS.contains(&action) {
            if let Some(key) = idempotency_key {
                let fp = fingerprint(action, &params);
                match self.idempotency.lookup(user_id, game_id, action, key, &fp).await {
                    Lookup::Hit(cached) => {
                        let mut result: ActionResult = serde_json::from_value(cached).unwrap_or_default();
                        result.message = format!("idempotent replay: {}", result.message);
                        result.idempotent_replay = true;
                        return result;
                    }
                    Lookup::Miss | Lookup::FingerprintMismatch => {}
                }
            }
        }

        let availability = EffectEngine::get_action_availability(&state.player, &state.pending_effects);
        let blocked = match action {
            "move" => !availability.can_move,
            "attack" => !availability.can_attack,
            "cast_spell" => !availability.can_cast_spell,
            "use_item" => !availability.can_use_item,
            _ => false,
        };
        if blocked {
            return err_result(EngineError::ActionBlockedByStatus(action.to_string()));
        }

        let mut result = match action {
            "move" => self.handle_move(state, &params),
            "attack" => self.handle_attack(state, &params, game_id).await,
            "use_item" => self.handle_use_item(state, &params).await,
            "drop_item" => self.handle_drop_item(state, &params),
            "undo_drop_item" => self.handle_undo_drop_item(state, &params),
            "cast_spell" => self.handle_cast_spell(state, &params),
            "interact" => self.handle_interact(state, &params).await,
            "rest" => self.handle_rest(state),
            "resolve_choice" => self.handle_resolve_choice(state, &params),
            "transition_map" => self.handle_transition_map(state, &params, user_id, game_id).await,
            other => return err_result(EngineError::UnknownAction(other.to_string())),
        };

        let was_error = !result.success && result.error_code.as_deref() == Some("ACTION_PROCESS_ERROR");

        if result.success {
            state.turn_count += 1;
            state.game_time += 1;

            result.events.extend(tick_status_effects(state));
            for item in state.player.core_mut().inventory.iter_mut() {
                item.tick_cooldown();
            }
            for item in state.player.core_mut().equipped_items.values_mut() {
                item.tick_cooldown();
            }

            self.run_monster_turns(state, game_id).await;

            result.events.append(&mut state.pending_events);

            let compensation = self.compensator.check_and_compensate(state);
            if compensation.compensated {
                result.events.push(format!("quest progress adjusted: {}", compensation.reason));
            }

            if state.pending_new_quest_generation {
                match self.llm_client.generate_json("generate_next_quest").await {
                    Ok(_) => result.events.push("a new quest awaits".to_string()),
                    Err(_) => log::warn!("new-quest generation degraded: llm unavailable"),
                }
                state.pending_new_quest_generation = false;
            }

            if state.player.core().stats.hp <= 0 && !state.is_game_over {
                state.is_game_over = true;
                state.game_over_reason = Some("player_defeated".to_string());
                result.events.push("You have fallen.".to_string());
            }

            state.rebuild_combat_snapshot();
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let (p50, p95) = {
            let mut telemetry = self.combat_telemetry.lock().await;
            telemetry.record(elapsed_ms, was_error);
            (telemetry.percentile(0.5), telemetry.percentile(0.95))
        };
        result.performance = Some(PerformanceSample { turn_elapsed_ms: elapsed_ms, p50_ms: p50, p95_ms: p95 });
        self.evaluate_release_gate(state, p95).await;

        result.action_trace_id = idempotency_key.map(|k| k.to_string());
        result.llm_interaction_required = !(action == "move" && result.events.is_empty());

        if result.llm_interaction_required && !state.is_game_over {
            let prompt = interaction_prompt(action, &result);
            if let Ok(value) = self.llm_client.generate_json(&prompt).await {
                result.narrative = value.get("narrative").and_then(|v| v.as_str()).map(|s| s.to_string());
            }
        }

        if IDEMPOTENT_ACTIONS.contains(&action) {
            if let Some(key) = idempotency_key {
                let fp = fingerprint(action, &params);
                if let Ok(cached) = serde_json::to_value(&result) {
                    self.idempotency.store(user_id, game_id, action, key, fp, cached).await;
                }
            }
        }

        result
    }

    /// Degrades `combat_authority_mode` one step (`Server` -> `Hybrid` ->
    /// `Local`) when p95 latency or error rate crosses the configured
    /// thresholds. Logged, never surfaced to the client — `COMBAT_AUTO_DEGRADE`
    /// is telemetric per spec §7.
    async fn evaluate_release_gate(&self, state: &mut GameState, p95_ms: u64) {
        let telemetry = self.combat_telemetry.lock().await;
        let error_rate = telemetry.error_rate();
        drop(telemetry);
        let degrade = p95_ms > self.config.combat.latency_p95_degrade_ms || error_rate > self.config.combat.error_rate_degrade;
        if !degrade {
            return;
        }
        let next = match state.combat_authority_mode {
            CombatAuthorityMode::Server => Some(CombatAuthorityMode::Hybrid),
            CombatAuthorityMode::Hybrid => Some(CombatAuthorityMode::Local),
            CombatAuthorityMode::Local => None,
        };
        if let Some(next) = next {
            log::warn!("{}", EngineError::CombatAutoDegrade(format!("p95={p95_ms}ms error_rate={error_rate:.3}, degrading authority mode")));
            state.combat_authority_mode = next;
        }
    }

    // ---- move ----

    fn handle_move(&self, state: &mut GameState, params: &Value) -> ActionResult {
        let (Some(x), Some(y)) = (params.get("x").and_then(Value::as_i64), params.get("y").and_then(Value::as_i64)) else {
            return err_result(EngineError::ActionProcessError("move requires x, y".to_string()));
        };
        let target = TileCoord { x: x as i32, y: y as i32 };
        if !state.current_map.in_bounds(target) {
            return ActionResult::soft_fail("out_of_bounds", "You can't go that way.");
        }
        let Some(tile) = state.current_map.get_tile(target) else {
            return ActionResult::soft_fail("no_such_tile", "There is nothing there.");
        };
        if !tile.terrain.is_walkable() {
            return ActionResult::soft_fail("blocked_by_wall", "A wall blocks the way.");
        }

        let player_id = state.player.core().id.clone();
        let origin = state.player.core().position;
        if let Some(old_tile) = state.current_map.get_tile_mut(TileCoord { x: origin.x, y: origin.y }) {
            if old_tile.character_id.as_deref() == Some(player_id.as_str()) {
                old_tile.character_id = None;
            }
        }
        state.player.core_mut().position = Position { x: target.x, y: target.y };

        let mut result = ActionResult::ok("You move.");

        if let Some(tile) = state.current_map.get_tile_mut(target) {
            tile.character_id = Some(player_id);
            tile.is_explored = true;
            tile.is_visible = true;
        }
        for dx in -1..=1 {
            for dy in -1..=1 {
                let coord = TileCoord { x: target.x + dx, y: target.y + dy };
                if let Some(t) = state.current_map.get_tile_mut(coord) {
                    t.is_explored = true;
                    t.is_visible = true;
                }
            }
        }

        if let Some(tile) = state.current_map.get_tile_mut(target) {
            if tile.has_event && !tile.event_triggered {
                if let Some(EventData::Trap(_)) = tile.event_data.clone() {
                    if let Some(EventData::Trap(mut trap)) = tile.event_data.clone() {
                        if !trap.is_disarmed {
                            let mut rng = SmallRng::seed_from_u64(seed_from_sha1(&format!(
                                "trap|{}|{}",
                                state.id, state.turn_count
                            )));
                            let resolution = self.trap_manager.trigger(&mut rng, state, &mut trap);
                            result.events.push(resolution.narration);
                            if let Some(tile) = state.current_map.get_tile_mut(target) {
                                tile.event_data = Some(EventData::Trap(trap));
                                tile.event_triggered = true;
                            }
                        }
                    }
                }
            }
        }

        result
    }

    // ---- attack ----

    async fn handle_attack(&self, state: &mut GameState, params: &Value, game_id: &str) -> ActionResult {
        let Some(target_id) = params.get("target_id").and_then(Value::as_str) else {
            return err_result(EngineError::TargetNotFound("missing target_id".to_string()));
        };
        let Some(idx) = state.monsters.iter().position(|m| m.is_alive() && m.core().id == target_id) else {
            return err_result(EngineError::TargetNotFound(target_id.to_string()));
        };

        let distance = state.player.core().position.chebyshev_distance(&state.monsters[idx].core().position);
        if distance > self.config.game.attack_range {
            return err_result(EngineError::TargetOutOfRange(target_id.to_string()));
        }

        let seed = seed_from_sha1(&format!("attack|{game_id}|{}|{}|{target_id}", state.turn_count, state.player.core().id));
        let attacker = state.player.clone();
        let policy = self.mitigation_policy();
        let eval_mode = to_eval_mode(state.combat_authority_mode);

        if eval_mode == EvalAuthorityMode::Local {
            let mut snapshot = state.monsters[idx].clone();
            let eval = evaluator::evaluate_attack(
                &attacker,
                &mut snapshot,
                AttackType::Melee,
                None,
                DamageType::Physical,
                true,
                attacker.core().proficiency_bonus,
                0.0,
                0.0,
                None,
                None,
                false,
                &policy,
                eval_mode,
                Some(seed),
            );
            let projection = eval.to_projection(monster_exp_reward(&snapshot));
            return ActionResult {
                success: true,
                message: "predicted attack".to_string(),
                reason: "ok".to_string(),
                combat_breakdown: Some(eval.breakdown),
                combat_projection: Some(projection),
                ..Default::default()
            };
        }

        let defender = &mut state.monsters[idx];
        let eval = evaluator::evaluate_attack(
            &attacker,
            defender,
            AttackType::Melee,
            None,
            DamageType::Physical,
            true,
            attacker.core().proficiency_bonus,
            0.0,
            0.0,
            None,
            None,
            false,
            &policy,
            eval_mode,
            Some(seed),
        );

        let mut result = ActionResult::ok(if eval.hit { "Your attack connects." } else { "Your attack misses." });
        result.combat_breakdown = Some(eval.breakdown.clone());

        if eval.death {
            let monster = state.monsters.remove(idx);
            let exp = monster_exp_reward(&monster);
            result.combat_projection = Some(eval.to_projection(exp));
            StateModifier::apply_player_progression_updates(state, exp as i32, "combat_kill");
            result.events.push(format!("{} is defeated!", monster.core().name));
            result.events.extend(EffectEngine::dispatch_on_kill(&mut state.player));

            if let Some(quest_monster_id) = monster.quest_monster_id().map(|s| s.to_string()) {
                let mut progress_value = 100.0;
                if let Some(quest) = state.active_quest_mut() {
                    if let Some(sm) = quest.special_monsters.iter_mut().find(|sm| sm.quest_monster_id == quest_monster_id) {
                        sm.defeated = true;
                        progress_value = sm.progress_value;
                    }
                }
                let progress = self
                    .progress_manager
                    .process_event(
                        state,
                        ProgressContext {
                            event_type: ProgressEventType::CombatVictory,
                            context_data: json!({"quest_monster_id": quest_monster_id, "progress_value": progress_value}),
                        },
                    )
                    .await;
                if progress.quest_completed {
                    result.events.push("Your quest is complete!".to_string());
                }
            }
        } else {
            result.combat_projection = Some(eval.to_projection(0));
        }

        result
    }

    // ---- use_item / equip / unequip ----

    async fn handle_use_item(&self, state: &mut GameState, params: &Value) -> ActionResult {
        let Some(item_id) = params.get("item_id").and_then(Value::as_str) else {
            return err_result(EngineError::ItemNotFound("missing item_id".to_string()));
        };
        let force = params.get("force").and_then(Value::as_bool).unwrap_or(false);

        let Some(item_idx) = state.player.core().inventory.iter().position(|i| i.id == item_id) else {
            return err_result(EngineError::ItemNotFound(item_id.to_string()));
        };
        if state.player.core().inventory[item_idx].is_on_cooldown() {
            return err_result(EngineError::ItemOnCooldown(item_id.to_string()));
        }
        if !state.player.core().inventory[item_idx].has_charges() {
            return err_result(EngineError::ItemNoCharges(item_id.to_string()));
        }
        if state.player.core().inventory[item_idx].is_quest_item && !force {
            return err_result(EngineError::QuestItemLocked(item_id.to_string()));
        }

        let item = state.player.core().inventory[item_idx].clone();

        if item.is_equippable {
            return self.toggle_equip(state, item_idx, item);
        }

        let mut result = ActionResult::ok(format!("You use {}.", item.name));
        let effect = match item.effect_payload.clone() {
            Some(payload) => Ok(payload),
            None => {
                let prompt = format!("item_effect item_id={item_id} name={}", item.name);
                self.llm_client.generate_json(&prompt).await.map_err(|_| ())
            }
        };

        match effect {
            Ok(payload) => {
                if let Some(hp_delta) = payload.get("hp_delta").and_then(Value::as_i64) {
                    StateModifier::apply_player_resource_delta(state, hp_delta as i32, 0, "item_effect");
                }
                if let Some(mp_delta) = payload.get("mp_delta").and_then(Value::as_i64) {
                    StateModifier::apply_player_resource_delta(state, 0, mp_delta as i32, "item_effect");
                }
                if let Some(scope) = payload.get("effect_scope").and_then(Value::as_str) {
                    if scope == "trigger" || scope == "ritual" {
                        state.pending_choice_context =
                            Some(EventChoiceFactory::trap_context(&format!("item-{item_id}"), &item.name, true, false));
                    }
                }
            }
            Err(()) => {
                log::warn!("item effect degraded to no-op: llm unavailable for {item_id}");
            }
        }

        if let Some(item) = state.player.core_mut().inventory.get_mut(item_idx) {
            item.consume_charge();
            item.current_cooldown = item.cooldown_turns;
            if item.max_charges.is_some() && item.charges == Some(0) {
                result.events.push(format!("{} is spent.", item.name));
            }
        }

        result
    }

    fn equip_requirement_violation(state: &GameState, item: &Item) -> Option<String> {
        let Some(requirements) = &item.equip_requirements else { return None };
        let stats = &state.player.core().stats;
        if let Some(min_level) = requirements.level {
            if stats.level < min_level {
                return Some(format!("requires level {min_level}"));
            }
        }
        if !requirements.classes.is_empty() && !requirements.classes.iter().any(|c| c == &state.player.core().class) {
            return Some(format!("requires class in {:?}", requirements.classes));
        }
        for (ability_name, min_score) in &requirements.abilities {
            let Some(ability) = parse_ability(ability_name) else { continue };
            if state.player.core().abilities.get(ability) < *min_score {
                return Some(format!("requires {ability_name} {min_score}"));
            }
        }
        None
    }

    fn toggle_equip(&self, state: &mut GameState, item_idx: usize, item: Item) -> ActionResult {
        let Some(slot) = item.equip_slot.clone() else {
            return err_result(EngineError::InvalidEquipSlot(item.id.clone()));
        };

        if let Some(violation) = Self::equip_requirement_violation(state, &item) {
            return err_result(EngineError::EquipRequirementNotMet(violation));
        }

        if let Some(unique_key) = &item.unique_key {
            let conflict = state
                .player
                .core()
                .equipped_items
                .values()
                .find(|equipped| equipped.id != item.id && equipped.unique_key.as_deref() == Some(unique_key.as_str()));
            if let Some(conflict) = conflict {
                return ActionResult::soft_fail("unique_key_conflict", format!("{} conflicts with {}", item.name, conflict.name));
            }
        }

        if let Some(previous) = state.player.core_mut().equipped_items.remove(&slot) {
            let trace = passive_trace_for(&previous, &slot);
            EffectEngine::revert_effects_by_source(&mut state.player, &trace);
            state.player.core_mut().inventory.push(previous.clone());
            if previous.id == item.id {
                if let Some(pos) = state.player.core().inventory.iter().position(|i| i.id == item.id) {
                    state.player.core_mut().inventory.remove(pos);
                }
                state.player.core_mut().sync_combat_runtime_mirrors();
                return ActionResult::ok(format!("You unequip {}.", previous.name));
            }
        }

        state.player.core_mut().inventory.remove(item_idx);
        EffectEngine::apply_equipment_passive_effects(&mut state.player, &item, &slot);
        state.player.core_mut().equipped_items.insert(slot, item.clone());
        state.player.core_mut().sync_combat_runtime_mirrors();
        ActionResult::ok(format!("You equip {}.", item.name))
    }

    // ---- drop_item / undo_drop_item ----

    fn handle_drop_item(&self, state: &mut GameState, params: &Value) -> ActionResult {
        let Some(item_id) = params.get("item_id").and_then(Value::as_str) else {
            return err_result(EngineError::ItemNotFound("missing item_id".to_string()));
        };
        let force = params.get("force").and_then(Value::as_bool).unwrap_or(false);

        let Some(idx) = state.player.core().inventory.iter().position(|i| i.id == item_id) else {
            return err_result(EngineError::ItemNotFound(item_id.to_string()));
        };
        if state.player.core().inventory[idx].is_quest_item && !force {
            return err_result(EngineError::QuestItemLocked(item_id.to_string()));
        }

        let item = state.player.core_mut().inventory.remove(idx);
        let position = state.player.core().position;
        let tile_key = TileCoord { x: position.x, y: position.y }.key();
        if let Some(tile) = state.current_map.get_tile_mut(TileCoord { x: position.x, y: position.y }) {
            tile.items.push(item.clone());
        }
        state.undo_tokens.push(UndoToken { item_id: item.id.clone(), tile_key, turn_issued: state.turn_count, valid_turns: DROP_UNDO_VALID_TURNS });

        ActionResult::ok(format!("You drop {}.", item.name))
    }

    fn handle_undo_drop_item(&self, state: &mut GameState, params: &Value) -> ActionResult {
        let Some(item_id) = params.get("item_id").and_then(Value::as_str) else {
            return err_result(EngineError::UndoTokenMissing("missing item_id".to_string()));
        };
        let Some(token_idx) = state.undo_tokens.iter().position(|t| t.item_id == item_id) else {
            return err_result(EngineError::UndoTokenMissing(item_id.to_string()));
        };
        let (valid_turns, turn_issued, tile_key) = {
            let token = &state.undo_tokens[token_idx];
            (token.valid_turns, token.turn_issued, token.tile_key.clone())
        };
        if state.turn_count > turn_issued + valid_turns {
            state.undo_tokens.remove(token_idx);
            return err_result(EngineError::UndoExpired(item_id.to_string()));
        }
        let Some(coord) = TileCoord::parse_key(&tile_key) else {
            state.undo_tokens.remove(token_idx);
            return err_result(EngineError::UndoTokenInvalid(item_id.to_string()));
        };
        let Some(tile) = state.current_map.get_tile_mut(coord) else {
            state.undo_tokens.remove(token_idx);
            return err_result(EngineError::UndoTokenInvalid(item_id.to_string()));
        };
        let Some(item_pos) = tile.items.iter().position(|i| i.id == item_id) else {
            state.undo_tokens.remove(token_idx);
            return err_result(EngineError::UndoTokenInvalid(item_id.to_string()));
        };
        let item = tile.items.remove(item_pos);
        state.undo_tokens.remove(token_idx);
        state.player.core_mut().inventory.push(item.clone());
        ActionResult::ok(format!("You pick {} back up.", item.name))
    }

    // ---- cast_spell ----

    fn handle_cast_spell(&self, state: &mut GameState, params: &Value) -> ActionResult {
        let Some(spell_level) = params.get("level").and_then(Value::as_i64) else {
            return err_result(EngineError::SpellResourceUpdateFailed("missing spell level".to_string()));
        };
        let cost = spell_level as i32 * 10;
        if state.player.core().stats.mp < cost {
            return err_result(EngineError::SpellResourceUpdateFailed(format!("needs {cost} mp")));
        }
        StateModifier::apply_player_resource_delta(state, 0, -cost, "cast_spell");

        let mut result = ActionResult::ok("You cast a spell.");

        if let Some(target_id) = params.get("target_id").and_then(Value::as_str) {
            if let Some(idx) = state.monsters.iter().position(|m| m.is_alive() && m.core().id == target_id) {
                let min_damage = spell_level as i32 * 5;
                let max_damage = spell_level as i32 * 10;
                let seed = seed_from_sha1(&format!("cast_spell|{}|{}|{target_id}", state.id, state.turn_count));
                let damage = min_damage + (seed % (max_damage - min_damage + 1).max(1) as u64) as i32;
                let monster = &mut state.monsters[idx];
                monster.core_mut().stats.hp = (monster.core().stats.hp - damage).max(0);
                result.events.push(format!("The spell deals {damage} damage."));
                if !monster.is_alive() {
                    let dead = state.monsters.remove(idx);
                    result.events.push(format!("{} is defeated!", dead.core().name));
                    let exp = monster_exp_reward(&dead);
                    StateModifier::apply_player_progression_updates(state, exp as i32, "spell_kill");
                }
            }
        }

        result
    }

    // ---- interact ----

    async fn handle_interact(&self, state: &mut GameState, params: &Value) -> ActionResult {
        let position = state.player.core().position;
        let coord = TileCoord { x: position.x, y: position.y };
        let Some(tile_terrain) = state.current_map.get_tile(coord).map(|t| t.terrain) else {
            return ActionResult::soft_fail("no_tile", "There is nothing here.");
        };

        match tile_terrain {
            crate::model::map::Terrain::Door => {
                if let Some(tile) = state.current_map.get_tile_mut(coord) {
                    tile.terrain = crate::model::map::Terrain::Floor;
                }
                ActionResult::ok("The door swings open.")
            }
            crate::model::map::Terrain::Treasure => {
                let already_collected = state
                    .current_map
                    .get_tile(coord)
                    .map(|t| t.items_collected.contains("treasure"))
                    .unwrap_or(true);
                if already_collected {
                    return ActionResult::soft_fail("already_collected", "This cache is empty.");
                }
                let prompt = format!("generate_treasure depth={}", state.current_map.depth);
                let generated = self.llm_client.generate_json(&prompt).await.ok();
                let item = item_from_llm_payload(generated, &state.current_map.floor_theme);
                state.player.core_mut().inventory.push(item.clone());
                if let Some(tile) = state.current_map.get_tile_mut(coord) {
                    tile.items_collected.insert("treasure".to_string());
                }
                let mut result = ActionResult::ok(format!("You find {}.", item.name));
                result.events.push(format!("picked up {}", item.name));
                let _ = self
                    .progress_manager
                    .process_event(state, ProgressContext { event_type: ProgressEventType::TreasureFound, context_data: json!({}) })
                    .await;
                result
            }
            _ => {
                if params.get("item_tile").and_then(Value::as_bool).unwrap_or(false) {
                    ActionResult::ok("You search the area but find nothing new.")
                } else {
                    ActionResult::soft_fail("nothing_to_interact", "Nothing to interact with here.")
                }
            }
        }
    }

    // ---- rest ----

    fn handle_rest(&self, state: &mut GameState) -> ActionResult {
        let stats = &state.player.core().stats;
        let hp_delta = (stats.max_hp - stats.hp).min(stats.max_hp / 4);
        let mp_delta = (stats.max_mp - stats.mp).min(stats.max_mp / 2);
        let record = StateModifier::apply_player_resource_delta(state, hp_delta, mp_delta, "rest");
        if !record.success {
            return err_result(EngineError::RestResourceUpdateFailed(record.error_message.unwrap_or_default()));
        }
        ActionResult::ok(format!("You rest and recover {hp_delta} hp, {mp_delta} mp."))
    }

    // ---- resolve_choice ----

    fn handle_resolve_choice(&self, state: &mut GameState, params: &Value) -> ActionResult {
        let Some(context_id) = params.get("context_id").and_then(Value::as_str) else {
            return err_result(EngineError::ChoiceContextNotFound("missing context_id".to_string()));
        };
        let Some(choice_id) = params.get("choice_id").and_then(Value::as_str) else {
            return err_result(EngineError::ChoiceContextNotFound("missing choice_id".to_string()));
        };
        let resolution = EventChoiceSystem::resolve_choice(state, context_id, choice_id);
        if !resolution.resolved {
            return ActionResult::soft_fail(resolution.outcome, "That choice can't be resolved right now.");
        }
        let mut result = ActionResult::ok(resolution.messages.join(" "));
        result.events = resolution.messages;
        result.reason = resolution.outcome;
        result
    }

    // ---- transition_map ----

    async fn handle_transition_map(&self, state: &mut GameState, params: &Value, user_id: &str, game_id: &str) -> ActionResult {
        let direction = match params.get("direction").and_then(Value::as_str) {
            Some("up") => TransitionDirection::Up,
            _ => TransitionDirection::Down,
        };
        let from_depth = state.current_map.depth;
        let new_depth = match direction {
            TransitionDirection::Down => from_depth + 1,
            TransitionDirection::Up => from_depth - 1,
        };
        if new_depth < 1 || new_depth > self.config.game.max_quest_floors as i32 {
            return ActionResult::soft_fail("no_such_floor", "There is nowhere further to go.");
        }

        let request = MapGenerationRequest {
            width: state.current_map.width,
            height: state.current_map.height,
            depth: new_depth,
            theme: state.current_map.floor_theme.clone(),
            quest_context: None,
            max_quest_floors: self.config.game.max_quest_floors as i32,
            monster_hints_enabled: true,
            seed: format!("{game_id}-{new_depth}"),
            user_id: user_id.to_string(),
            source: "transition_map".to_string(),
            provided_contract: None,
            requested_contract_version: None,
        };
        let outcome = self.map_orchestrator.generate_map(request, &self.config.map_generation, &mut state.generation_metrics.map_generation).await;
        state.current_map = outcome.map;
        state.pending_map_transition = Some(PendingMapTransition { direction, from_depth });

        let mirrored_terrain = match direction {
            TransitionDirection::Down => crate::model::map::Terrain::StairsUp,
            TransitionDirection::Up => crate::model::map::Terrain::StairsDown,
        };
        let spawn_coord = state
            .current_map
            .tiles
            .values()
            .find(|t| t.terrain == mirrored_terrain)
            .map(|t| t.coord())
            .or_else(|| state.current_map.walkable_tiles().next().map(|t| t.coord()))
            .unwrap_or(TileCoord { x: 0, y: 0 });
        state.player.core_mut().position = Position { x: spawn_coord.x, y: spawn_coord.y };

        state.monsters.clear();
        let hints = json!({});
        let count = (2 + new_depth.min(5)) as usize;
        let positions = MonsterSpawnManager::spawn_positions(&state.current_map, &hints, count);
        for (i, pos) in positions.into_iter().enumerate() {
            let mut monster = spawn_basic_monster(&format!("{game_id}-m{new_depth}-{i}"), new_depth, state.player.core().stats.level);
            let report = MonsterSpawnManager::apply_guardrails(&mut monster, state.player.core().stats.level, new_depth, &self.config.game);
            if !report.downgrades.is_empty() {
                log::info!("spawn guardrails applied to {}: {:?}", monster.core.id, report.downgrades);
            }
            monster.core.position = Position { x: pos.x, y: pos.y };
            state.monsters.push(Entity::Monster(monster));
        }

        let mut result = ActionResult::ok(format!("You descend to depth {new_depth}.", ));
        result.events.push(format!("arrived at depth {new_depth}"));

        let progress = self
            .progress_manager
            .process_event(state, ProgressContext { event_type: ProgressEventType::MapTransition, context_data: json!(new_depth) })
            .await;
        if progress.quest_completed {
            result.events.push("Your quest is complete!".to_string());
        }

        result
    }

    // ---- monster turns ----

    async fn run_monster_turns(&self, state: &mut GameState, game_id: &str) {
        let policy = self.mitigation_policy();
        let player_position = state.player.core().position;
        let attack_range = self.config.game.attack_range;
        let chase_range = self.config.game.monster_chase_range;
        let monster_ids: Vec<String> = state.monsters.iter().filter(|m| m.is_alive()).map(|m| m.core().id.clone()).collect();

        for monster_id in monster_ids {
            let Some(idx) = state.monsters.iter().position(|m| m.core().id == monster_id && m.is_alive()) else { continue };
            let monster_position = state.monsters[idx].core().position;
            let distance = monster_position.chebyshev_distance(&player_position);

            if distance <= attack_range {
                let seed = seed_from_sha1(&format!("monster_attack|{game_id}|{}|{monster_id}|{}", state.turn_count, state.player.core().id));
                let attacker = state.monsters[idx].clone();
                let eval = evaluator::evaluate_attack(
                    &attacker,
                    &mut state.player,
                    AttackType::Melee,
                    None,
                    DamageType::Physical,
                    true,
                    attacker.core().proficiency_bonus,
                    0.0,
                    0.0,
                    None,
                    None,
                    false,
                    &policy,
                    EvalAuthorityMode::Server,
                    Some(seed),
                );
                if eval.hit {
                    state.pending_events.push(format!("{} hits you for {} damage.", attacker.core().name, eval.final_damage));
                    let healed = EffectEngine::dispatch_regen_per_turn(&mut state.monsters[idx]);
                    if healed > 0 {
                        state.pending_events.push(format!("{} regenerates {healed} hp.", attacker.core().name));
                    }
                }
            } else if distance <= chase_range {
                let dx = (player_position.x - monster_position.x).signum();
                let dy = (player_position.y - monster_position.y).signum();
                let target = TileCoord { x: monster_position.x + dx, y: monster_position.y + dy };
                let walkable = state
                    .current_map
                    .get_tile(target)
                    .map(|t| t.terrain.is_walkable() && t.character_id.is_none())
                    .unwrap_or(false);
                if walkable {
                    state.monsters[idx].core_mut().position = Position { x: target.x, y: target.y };
                }
            }
        }
    }
}

fn tick_status_effects(state: &mut GameState) -> Vec<String> {
    let mut events = Vec::new();
    state.pending_effects.retain_mut(|pending| {
        pending.effect.remaining_turns -= 1;
        if pending.effect.remaining_turns <= 0 {
            events.push(format!("{} expired", pending.effect.name));
            false
        } else {
            true
        }
    });
    events
}

fn parse_ability(name: &str) -> Option<Ability> {
    match name.to_ascii_lowercase().as_str() {
        "str" | "strength" => Some(Ability::Str),
        "dex" | "dexterity" => Some(Ability::Dex),
        "con" | "constitution" => Some(Ability::Con),
        "int" | "intelligence" => Some(Ability::Int),
        "wis" | "wisdom" => Some(Ability::Wis),
        "cha" | "charisma" => Some(Ability::Cha),
        _ => None,
    }
}

/// Reconstructs an equivalent trace from the item's own affix/passive lists
/// rather than persisting the original apply-time trace; only `key`/`delta`
/// matter to `revert_effects_by_source`, and those are fully recoverable
/// from the item.
fn passive_trace_for(item: &Item, slot: &str) -> Vec<crate::effect_engine::EffectTraceRow> {
    let key = format!("equip:{slot}:{}", item.id);
    let mut trace = Vec::new();
    for effect in &item.equip_passive_effects {
        trace.push(crate::effect_engine::EffectTraceRow {
            stage: crate::effect_engine::STAGE_EQUIP_PASSIVE,
            source: key.clone(),
            item_id: Some(item.id.clone()),
            key: effect.key.clone(),
            before: 0.0,
            delta: effect.value,
            after: 0.0,
        });
    }
    for affix in &item.affixes {
        trace.push(crate::effect_engine::EffectTraceRow {
            stage: crate::effect_engine::STAGE_AFFIX,
            source: key.clone(),
            item_id: Some(item.id.clone()),
            key: affix.key.clone(),
            before: 0.0,
            delta: affix.value,
            after: 0.0,
        });
    }
    trace
}

fn interaction_prompt(action: &str, result: &ActionResult) -> String {
    let kind = match action {
        "move" => "movement",
        "attack" => "combat-attack",
        "use_item" | "drop_item" | "undo_drop_item" => "item-use",
        "interact" | "rest" | "transition_map" => "exploration",
        _ => "combat-defense",
    };
    format!("narrate kind={kind} message={} events={:?}", result.message, result.events)
}

fn item_from_llm_payload(payload: Option<Value>, theme: &str) -> Item {
    let name = payload
        .as_ref()
        .and_then(|v| v.get("name"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{theme} trinket"));
    Item {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        description: String::new(),
        item_type: "treasure".to_string(),
        rarity: "common".to_string(),
        value: 10,
        weight: 0.1,
        properties: HashMap::new(),
        is_equippable: false,
        equip_slot: None,
        unique_key: None,
        equip_requirements: None,
        equip_passive_effects: vec![],
        affixes: vec![],
        set_id: None,
        set_thresholds: HashMap::new(),
        max_charges: None,
        charges: None,
        cooldown_turns: 0,
        current_cooldown: 0,
        effect_payload: None,
        is_quest_item: false,
        quest_lock_reason: None,
        hint_level: Default::default(),
        trigger_hint: None,
        risk_hint: None,
        expected_outcomes: vec![],
        requires_use_confirmation: false,
    }
}

fn spawn_basic_monster(id: &str, depth: i32, player_level: i32) -> MonsterEntity {
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, EntityCore, Stats};
    use std::collections::HashSet;

    let level = player_level.max(1);
    let max_hp = 10 + depth * 5 + level * 2;
    MonsterEntity {
        core: EntityCore {
            id: id.to_string(),
            name: format!("floor {depth} lurker"),
            class: "monster".to_string(),
            creature_type: "beast".to_string(),
            abilities: Abilities::default(),
            stats: Stats {
                hp: max_hp,
                max_hp,
                level,
                ac_components: AcComponents { base: 10 + depth, ..Default::default() },
                ..Default::default()
            },
            combat_runtime: CombatRuntime::default(),
            resistances: HashMap::new(),
            vulnerabilities: HashMap::new(),
            immunities: HashSet::new(),
            equipped_items: HashMap::new(),
            inventory: Vec::new(),
            position: Position { x: 0, y: 0 },
            saving_throw_proficiencies: HashSet::new(),
            skill_proficiencies: HashSet::new(),
            proficiency_bonus: 2,
        },
        quest_monster_id: None,
        is_final_objective: false,
    }
}
