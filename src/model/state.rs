//! Top-level game state and its satellite structures: pending choice
//! contexts, combat snapshot, and generation metrics (patch-batch history,
//! map-generation counters, progress-guard counters).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{CombatRuntime, Entity};
use super::map::GameMap;
use super::quest::Quest;
use crate::config::CombatAuthorityMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEffect {
    pub id: String,
    pub name: String,
    pub source_key: String,
    pub remaining_turns: i32,
    #[serde(default)]
    pub blocks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEffect {
    pub target_id: String,
    pub effect: StatusEffect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub consequences: serde_json::Value,
    #[serde(default)]
    pub requirements: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_available: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventChoiceContext {
    pub id: String,
    pub event_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context_data: serde_json::Value,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMapTransition {
    pub direction: TransitionDirection,
    pub from_depth: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionDirection {
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoToken {
    pub item_id: String,
    pub tile_key: String,
    pub turn_issued: u64,
    pub valid_turns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatRules {
    pub damage_order: Vec<String>,
    pub ac_policy: String,
    #[serde(default)]
    pub telemetry_enabled: bool,
}

impl Default for CombatRules {
    fn default() -> Self {
        Self {
            damage_order: vec![
                "immunity_short_circuit".to_string(),
                "shield".to_string(),
                "temporary_hp".to_string(),
                "resistance".to_string(),
                "vulnerability".to_string(),
                "minimum_damage".to_string(),
            ],
            ac_policy: "hit_threshold_only".to_string(),
            telemetry_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatSnapshot {
    pub player_hp: i32,
    pub player_shield: i32,
    pub player_temporary_hp: i32,
    pub living_monster_count: usize,
    pub last_rebuilt_turn: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapGenerationCounters {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub fallback_used: u64,
    pub rollback_used: u64,
    pub repairs: u64,
    pub unreachable_reports: u64,
    pub stairs_violations: u64,
    #[serde(default)]
    pub per_stage: HashMap<String, u64>,
    #[serde(default)]
    pub per_provider: HashMap<String, u64>,
    #[serde(default)]
    pub per_error_code: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressMetrics {
    #[serde(default)]
    pub guard_blocked_reasons: HashMap<String, u64>,
    #[serde(default)]
    pub final_objective_guard_blocked_reasons: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBatchRecord {
    pub batch_id: String,
    pub applied_patch_ids: Vec<String>,
    pub rollback_applied: bool,
    pub success: bool,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

const PATCH_BATCH_HISTORY_CAP: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    #[serde(default)]
    pub patch_batches: VecDeque<PatchBatchRecord>,
    #[serde(default)]
    pub last_patch_batch_id: Option<String>,
    #[serde(default)]
    pub map_generation: MapGenerationCounters,
    #[serde(default)]
    pub progress_metrics: ProgressMetrics,
}

impl Default for GenerationMetrics {
    fn default() -> Self {
        Self {
            patch_batches: VecDeque::with_capacity(PATCH_BATCH_HISTORY_CAP),
            last_patch_batch_id: None,
            map_generation: MapGenerationCounters::default(),
            progress_metrics: ProgressMetrics::default(),
        }
    }
}

impl GenerationMetrics {
    pub fn push_patch_batch(&mut self, record: PatchBatchRecord) {
        if self.patch_batches.len() >= PATCH_BATCH_HISTORY_CAP {
            self.patch_batches.pop_front();
        }
        self.last_patch_batch_id = Some(record.batch_id.clone());
        self.patch_batches.push_back(record);
    }

    pub fn record_guard_block(&mut self, reason: &str, is_final_objective: bool) {
        let map = if is_final_objective {
            &mut self.progress_metrics.final_objective_guard_blocked_reasons
        } else {
            &mut self.progress_metrics.guard_blocked_reasons
        };
        *map.entry(reason.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub id: String,
    pub player: Entity,
    pub current_map: GameMap,
    #[serde(default)]
    pub monsters: Vec<Entity>,
    #[serde(default)]
    pub quests: Vec<Quest>,
    #[serde(default)]
    pub turn_count: u64,
    #[serde(default)]
    pub game_time: u64,
    pub created_at: DateTime<Utc>,
    pub last_saved: DateTime<Utc>,
    #[serde(default)]
    pub is_game_over: bool,
    #[serde(default)]
    pub game_over_reason: Option<String>,
    #[serde(default)]
    pub pending_events: Vec<String>,
    #[serde(default)]
    pub pending_effects: Vec<PendingEffect>,
    #[serde(default)]
    pub pending_choice_context: Option<EventChoiceContext>,
    #[serde(default)]
    pub pending_quest_completion: Option<String>,
    #[serde(default)]
    pub pending_new_quest_generation: bool,
    #[serde(default)]
    pub pending_map_transition: Option<PendingMapTransition>,
    #[serde(default)]
    pub undo_tokens: Vec<UndoToken>,
    #[serde(default)]
    pub combat_rules: CombatRules,
    #[serde(default = "default_combat_rule_version")]
    pub combat_rule_version: u32,
    #[serde(default)]
    pub combat_authority_mode: CombatAuthorityMode,
    #[serde(default)]
    pub combat_snapshot: Option<CombatSnapshot>,
    #[serde(default)]
    pub generation_metrics: GenerationMetrics,
    #[serde(default)]
    pub migration_history: Vec<String>,
}

fn default_combat_rule_version() -> u32 {
    1
}

impl GameState {
    pub fn find_monster(&self, id: &str) -> Option<&Entity> {
        self.monsters.iter().find(|m| m.core().id == id)
    }

    pub fn find_monster_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.monsters.iter_mut().find(|m| m.core().id == id)
    }

    pub fn living_monsters(&self) -> impl Iterator<Item = &Entity> {
        self.monsters.iter().filter(|m| m.is_alive())
    }

    pub fn active_quest(&self) -> Option<&Quest> {
        self.quests.iter().find(|q| q.is_active && !q.is_completed)
    }

    pub fn active_quest_mut(&mut self) -> Option<&mut Quest> {
        self.quests.iter_mut().find(|q| q.is_active && !q.is_completed)
    }

    pub fn rebuild_combat_snapshot(&mut self) {
        self.combat_snapshot = Some(CombatSnapshot {
            player_hp: self.player.core().stats.hp,
            player_shield: self.player.core().combat_runtime.shield,
            player_temporary_hp: self.player.core().combat_runtime.temporary_hp,
            living_monster_count: self.living_monsters().count(),
            last_rebuilt_turn: self.turn_count,
        });
    }
}

pub fn zero_combat_runtime() -> CombatRuntime {
    CombatRuntime::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_batch_history_is_bounded() {
        let mut metrics = GenerationMetrics::default();
        for i in 0..250 {
            metrics.push_patch_batch(PatchBatchRecord {
                batch_id: format!("b{i}"),
                applied_patch_ids: vec![],
                rollback_applied: false,
                success: true,
                diagnostics: vec![],
            });
        }
        assert_eq!(metrics.patch_batches.len(), PATCH_BATCH_HISTORY_CAP);
        assert_eq!(metrics.patch_batches.front().unwrap().batch_id, "b50");
        assert_eq!(metrics.last_patch_batch_id, Some("b249".to_string()));
    }

    #[test]
    fn guard_block_counters_split_by_final_objective() {
        let mut metrics = GenerationMetrics::default();
        metrics.record_guard_block("require_final_floor_not_met", true);
        metrics.record_guard_block("require_final_floor_not_met", true);
        metrics.record_guard_block("mandatory_events_missing", false);
        assert_eq!(
            metrics.progress_metrics.final_objective_guard_blocked_reasons["require_final_floor_not_met"],
            2
        );
        assert_eq!(metrics.progress_metrics.guard_blocked_reasons["mandatory_events_missing"], 1);
    }
}
