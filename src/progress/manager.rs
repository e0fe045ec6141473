//! Event→progress-increment rules, guard enforcement, and graceful-degrading
//! LLM story refresh. Grounded on `original_source/progress_manager.py`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ProgressConfig;
use crate::llm_client::LlmClient;
use crate::model::quest::CompletionPolicy;
use crate::model::state::{Choice, EventChoiceContext, GameState};
use crate::state_modifier::StateModifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    MapTransition,
    CombatVictory,
    TreasureFound,
    StoryEvent,
    Exploration,
    ObjectiveComplete,
    CustomEvent,
}

#[derive(Debug, Clone)]
pub struct ProgressContext {
    pub event_type: ProgressEventType,
    pub context_data: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessResult {
    pub success: bool,
    pub progress_increment: f64,
    pub new_progress: f64,
    pub quest_completed: bool,
    pub guard_reasons: Vec<String>,
    pub story_update: Option<String>,
}

pub struct ProgressManager {
    llm_client: Arc<dyn LlmClient>,
}

impl ProgressManager {
    pub fn new(llm_client: Arc<dyn LlmClient>) -> Self {
        Self { llm_client }
    }

    /// Computes the raw (pre-guard) increment for an event type, per
    /// `progress_manager.py`'s `_setup_default_rules`.
    fn raw_increment(event: &ProgressContext, current_progress: f64, config: &ProgressConfig) -> f64 {
        match event.event_type {
            ProgressEventType::MapTransition => {
                let depth = event.context_data.as_i64().unwrap_or(0) as f64;
                (depth - current_progress).max(0.0)
            }
            ProgressEventType::CombatVictory => event
                .context_data
                .get("progress_value")
                .and_then(|v| v.as_f64())
                .unwrap_or(config.combat_victory_base),
            ProgressEventType::StoryEvent => event
                .context_data
                .get("progress_value")
                .and_then(|v| v.as_f64())
                .unwrap_or(config.story_event_base),
            ProgressEventType::TreasureFound => event
                .context_data
                .get("progress_value")
                .and_then(|v| v.as_f64())
                .unwrap_or(config.treasure_found_base),
            ProgressEventType::Exploration => event
                .context_data
                .get("progress_value")
                .and_then(|v| v.as_f64())
                .unwrap_or(2.0),
            ProgressEventType::ObjectiveComplete | ProgressEventType::CustomEvent => {
                log::warn!("no progress rule registered for {:?}", event.event_type);
                0.0
            }
        }
    }

    /// Processes one progress event against the game's active quest,
    /// returning the computed increment and any guard-block reasons. LLM
    /// story refresh failure degrades to a numeric-only update.
    pub async fn process_event(&self, state: &mut GameState, event: ProgressContext) -> ProcessResult {
        let Some(quest) = state.active_quest().cloned() else {
            return ProcessResult {
                success: false,
                guard_reasons: vec!["no_active_quest".to_string()],
                ..Default::default()
            };
        };

        let config = ProgressConfig::default();
        let current_progress = quest.progress_percentage;
        let mut increment = Self::raw_increment(&event, current_progress, &config);
        let mut guard_reasons = Vec::new();

        let final_objective_requested = event
            .context_data
            .get("quest_monster_id")
            .and_then(|v| v.as_str())
            .map(|id| quest.progress_plan.final_objective_id.as_deref() == Some(id))
            .unwrap_or(false);

        let max_single = quest.completion_guard.max_single_increment_except_final;
        let mut final_burst = false;

        if final_objective_requested {
            let policy_allows = matches!(
                quest.progress_plan.completion_policy,
                CompletionPolicy::SingleTarget100 | CompletionPolicy::Hybrid
            );
            if !policy_allows {
                guard_reasons.push("completion_policy_disallow_final_burst".to_string());
            }
            let floor_ok = !quest.completion_guard.require_final_floor
                || quest.target_floors.contains(&state.current_map.depth);
            if !floor_ok {
                guard_reasons.push("require_final_floor_not_met".to_string());
            }
            let events_ok = !quest.completion_guard.require_all_mandatory_events || quest.all_mandatory_events_triggered();
            if !events_ok {
                guard_reasons.push("mandatory_events_missing".to_string());
            }

            if guard_reasons.is_empty() {
                final_burst = true;
                increment = 100.0 - current_progress;
            }
        } else if matches!(quest.progress_plan.completion_policy, CompletionPolicy::Hybrid) && increment > max_single {
            increment = max_single;
        }

        for reason in &guard_reasons {
            state.generation_metrics.record_guard_block(reason, final_objective_requested);
        }

        let new_progress = (current_progress + increment).min(100.0);
        let quest_id = quest.id.clone();

        let prompt = format!(
            "progress update: quest={} old={:.1} new={:.1} event={:?}",
            quest.title, current_progress, new_progress, event.event_type
        );
        let mut story_update = None;
        match self.llm_client.generate_json(&prompt).await {
            Ok(value) => {
                story_update = value.get("story_context").and_then(|v| v.as_str()).map(|s| s.to_string());
            }
            Err(e) => {
                log::warn!("llm story refresh failed, degrading to numeric-only update: {e}");
            }
        }

        let quest_mut = state.active_quest_mut().expect("active quest checked above");
        quest_mut.set_progress(new_progress);
        if let Some(story) = &story_update {
            quest_mut.story_context = story.clone();
        }

        let quest_completed = final_burst && new_progress >= 100.0;
        if quest_completed {
            complete_quest(state, &quest_id);
        }

        ProcessResult {
            success: true,
            progress_increment: increment,
            new_progress,
            quest_completed,
            guard_reasons,
            story_update,
        }
    }
}

fn complete_quest(state: &mut GameState, quest_id: &str) {
    let exp_reward = {
        let Some(quest) = state.quests.iter_mut().find(|q| q.id == quest_id) else {
            return;
        };
        quest.is_completed = true;
        quest.is_active = false;
        quest.set_progress(100.0);
        quest.experience_reward
    };

    StateModifier::apply_player_progression_updates(state, exp_reward as i32, "quest_completion");

    let title = state.quests.iter().find(|q| q.id == quest_id).map(|q| q.title.clone()).unwrap_or_default();
    let message = format!("Quest complete: {title}! Gained {exp_reward} experience.");
    state.pending_events.push(message.clone());

    state.pending_choice_context = Some(EventChoiceContext {
        id: format!("quest-complete-{quest_id}"),
        event_type: "quest_completion".to_string(),
        title: format!("{title} complete"),
        description: message,
        context_data: serde_json::json!({"quest_id": quest_id, "experience_reward": exp_reward}),
        choices: vec![Choice {
            id: "continue".to_string(),
            text: "Continue onward".to_string(),
            description: String::new(),
            consequences: serde_json::Value::Null,
            requirements: serde_json::Value::Null,
            is_available: true,
        }],
    });
    state.pending_quest_completion = Some(quest_id.to_string());
    state.pending_new_quest_generation = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::NullLlmClient;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, EntityCore, PlayerEntity, Position, Stats};
    use crate::model::map::{GameMap, GenerationMetadata};
    use crate::model::quest::{CompletionGuard, ProgressBudget, ProgressPlan, Quest};
    use chrono::Utc;
    use std::collections::{HashMap as StdHashMap, HashSet};

    fn make_state(quest: Quest) -> GameState {
        let map = GameMap {
            id: "map1".into(),
            name: "Floor 1".into(),
            width: 1,
            height: 1,
            depth: 1,
            floor_theme: "stone".into(),
            tiles: StdHashMap::new(),
            generation_metadata: GenerationMetadata::default(),
        };
        let player = make_player();
        GameState {
            id: "game1".into(),
            player,
            current_map: map,
            monsters: vec![],
            quests: vec![quest],
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

    fn make_player() -> crate::model::entity::Entity {
        crate::model::entity::Entity::Player(PlayerEntity {
            core: EntityCore {
                id: "p1".into(),
                name: "Hero".into(),
                class: "fighter".into(),
                creature_type: "humanoid".into(),
                abilities: Abilities::default(),
                stats: Stats { ac_components: AcComponents { base: 10, ..Default::default() }, ..Default::default() },
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
        })
    }

    fn sample_quest() -> Quest {
        Quest {
            id: "q1".into(),
            title: "Clear the depths".into(),
            description: String::new(),
            quest_type: "main".into(),
            is_active: true,
            is_completed: false,
            progress_percentage: 50.0,
            objectives: vec![],
            completed_objectives: vec![],
            special_monsters: vec![],
            special_events: vec![],
            target_floors: vec![1],
            progress_plan: ProgressPlan {
                completion_policy: CompletionPolicy::Hybrid,
                budget: ProgressBudget { events: 100.0, quest_monsters: 100.0, map_transition: 100.0, exploration_buffer: 100.0 },
                final_objective_id: Some("boss".into()),
            },
            completion_guard: CompletionGuard::default(),
            progress_ledger: vec![],
            story_context: String::new(),
            llm_notes: String::new(),
            experience_reward: 500,
        }
    }

    #[tokio::test]
    async fn hybrid_caps_non_final_increment() {
        let mut state = make_state(sample_quest());
        let manager = ProgressManager::new(Arc::new(NullLlmClient));
        let result = manager
            .process_event(
                &mut state,
                ProgressContext {
                    event_type: ProgressEventType::StoryEvent,
                    context_data: serde_json::json!({"progress_value": 80.0}),
                },
            )
            .await;
        assert_eq!(result.progress_increment, 25.0);
        assert_eq!(result.new_progress, 75.0);
    }

    #[tokio::test]
    async fn final_objective_burst_completes_quest() {
        let mut state = make_state(sample_quest());
        let manager = ProgressManager::new(Arc::new(NullLlmClient));
        let result = manager
            .process_event(
                &mut state,
                ProgressContext {
                    event_type: ProgressEventType::CombatVictory,
                    context_data: serde_json::json!({"quest_monster_id": "boss"}),
                },
            )
            .await;
        assert_eq!(result.new_progress, 100.0);
        assert!(result.quest_completed);
        assert!(state.quests[0].is_completed);
        assert_eq!(state.player.core().stats.experience, 500);
    }

    #[tokio::test]
    async fn final_floor_guard_blocks_burst() {
        let mut quest = sample_quest();
        quest.completion_guard.require_final_floor = true;
        quest.target_floors = vec![5];
        let mut state = make_state(quest);
        let manager = ProgressManager::new(Arc::new(NullLlmClient));
        let result = manager
            .process_event(
                &mut state,
                ProgressContext {
                    event_type: ProgressEventType::CombatVictory,
                    context_data: serde_json::json!({"quest_monster_id": "boss"}),
                },
            )
            .await;
        assert!(result.guard_reasons.contains(&"require_final_floor_not_met".to_string()));
        assert!(!result.quest_completed);
    }
}
