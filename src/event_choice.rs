//! Pending-choice contexts and choice resolution. Grounded on spec §4.11
//! directly (no surviving `original_source` file for this component in the
//! retrieved pack); dispatch mirrors the same by-event-type match
//! `progress::compensator`/`progress::manager` already use for the
//! quest-completion choice context they raise.

use crate::model::state::{Choice, EventChoiceContext, GameState};

#[derive(Debug, Clone, Default)]
pub struct ChoiceResolution {
    pub resolved: bool,
    pub outcome: String,
    pub messages: Vec<String>,
}

pub struct EventChoiceSystem;

impl EventChoiceSystem {
    /// Resolves the current pending choice context, dispatching on its
    /// `event_type`. A trap context accepts any choice id or
    /// `consequences.action` that maps to retreat semantics without raising
    /// — the spec requires this tolerance explicitly, since client UIs are
    /// free to label the retreat option however they like.
    pub fn resolve_choice(state: &mut GameState, context_id: &str, choice_id: &str) -> ChoiceResolution {
        let Some(context) = state.pending_choice_context.clone() else {
            return ChoiceResolution { resolved: false, outcome: "no_pending_choice".to_string(), ..Default::default() };
        };
        if context.id != context_id {
            return ChoiceResolution { resolved: false, outcome: "context_id_mismatch".to_string(), ..Default::default() };
        }

        let Some(choice) = context.choices.iter().find(|c| c.id == choice_id) else {
            return ChoiceResolution { resolved: false, outcome: "unknown_choice_id".to_string(), ..Default::default() };
        };
        if !choice.is_available {
            return ChoiceResolution { resolved: false, outcome: "choice_unavailable".to_string(), ..Default::default() };
        }

        let resolution = match context.event_type.as_str() {
            "trap" => Self::resolve_trap_choice(choice),
            "quest_completion" => Self::resolve_quest_completion_choice(choice),
            "item_use" => Self::resolve_item_use_choice(choice),
            _ => ChoiceResolution { resolved: true, outcome: "story_choice_acknowledged".to_string(), messages: vec![choice.text.clone()] },
        };

        state.pending_choice_context = None;
        resolution
    }

    fn is_retreat_choice(choice: &Choice) -> bool {
        if choice.id.eq_ignore_ascii_case("retreat") {
            return true;
        }
        choice
            .consequences
            .get("action")
            .and_then(|v| v.as_str())
            .map(|a| a.eq_ignore_ascii_case("retreat"))
            .unwrap_or(false)
    }

    fn resolve_trap_choice(choice: &Choice) -> ChoiceResolution {
        if Self::is_retreat_choice(choice) {
            return ChoiceResolution {
                resolved: true,
                outcome: "retreat".to_string(),
                messages: vec!["You step back from the trap.".to_string()],
            };
        }
        ChoiceResolution { resolved: true, outcome: choice.id.clone(), messages: vec![choice.text.clone()] }
    }

    fn resolve_quest_completion_choice(choice: &Choice) -> ChoiceResolution {
        ChoiceResolution { resolved: true, outcome: "continue".to_string(), messages: vec![choice.text.clone()] }
    }

    fn resolve_item_use_choice(choice: &Choice) -> ChoiceResolution {
        ChoiceResolution { resolved: true, outcome: choice.id.clone(), messages: vec![choice.text.clone()] }
    }
}

#[derive(Debug, Clone)]
pub struct EventChoiceFactory;

impl EventChoiceFactory {
    /// Builds the context a trap presents: detect/disarm/avoid/retreat,
    /// trimmed to whichever options are actually legal given what's already
    /// been detected/disarmed. `TrapManager` is the sole caller.
    pub fn trap_context(trap_tile_key: &str, trap_name: &str, detected: bool, disarmed: bool) -> EventChoiceContext {
        let mut choices = Vec::new();
        if !detected {
            choices.push(Choice {
                id: "detect".to_string(),
                text: "Search for a trap".to_string(),
                description: String::new(),
                consequences: serde_json::Value::Null,
                requirements: serde_json::Value::Null,
                is_available: true,
            });
        }
        if detected && !disarmed {
            choices.push(Choice {
                id: "disarm".to_string(),
                text: "Attempt to disarm it".to_string(),
                description: String::new(),
                consequences: serde_json::Value::Null,
                requirements: serde_json::Value::Null,
                is_available: true,
            });
            choices.push(Choice {
                id: "avoid".to_string(),
                text: "Carefully step around it".to_string(),
                description: String::new(),
                consequences: serde_json::Value::Null,
                requirements: serde_json::Value::Null,
                is_available: true,
            });
        }
        choices.push(Choice {
            id: "retreat".to_string(),
            text: "Retreat".to_string(),
            description: String::new(),
            consequences: serde_json::json!({"action": "retreat"}),
            requirements: serde_json::Value::Null,
            is_available: true,
        });

        EventChoiceContext {
            id: format!("trap-{trap_tile_key}"),
            event_type: "trap".to_string(),
            title: format!("A {trap_name} blocks the way"),
            description: String::new(),
            context_data: serde_json::json!({"tile_key": trap_tile_key}),
            choices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, Entity, EntityCore, PlayerEntity, Position, Stats};
    use crate::model::map::{GameMap, GenerationMetadata};
    use chrono::Utc;
    use std::collections::{HashMap as StdHashMap, HashSet};

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

    fn make_state(context: EventChoiceContext) -> GameState {
        GameState {
            id: "game1".into(),
            player: player(),
            current_map: GameMap {
                id: "map1".into(),
                name: "Floor".into(),
                width: 1,
                height: 1,
                depth: 1,
                floor_theme: "stone".into(),
                tiles: StdHashMap::new(),
                generation_metadata: GenerationMetadata::default(),
            },
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
            pending_choice_context: Some(context),
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
    fn unknown_retreat_label_on_trap_context_resolves_as_retreat() {
        let context = EventChoiceFactory::trap_context("3,4", "spike trap", true, false);
        let mut state = make_state(context);
        let resolution = EventChoiceSystem::resolve_choice(&mut state, "trap-3,4", "retreat");
        assert!(resolution.resolved);
        assert_eq!(resolution.outcome, "retreat");
        assert!(state.pending_choice_context.is_none());
    }

    #[test]
    fn unknown_choice_id_is_reported_not_panicked() {
        let context = EventChoiceFactory::trap_context("1,1", "pit trap", false, false);
        let mut state = make_state(context);
        let resolution = EventChoiceSystem::resolve_choice(&mut state, "trap-1,1", "does_not_exist");
        assert!(!resolution.resolved);
        assert_eq!(resolution.outcome, "unknown_choice_id");
    }

    #[test]
    fn mismatched_context_id_is_rejected() {
        let context = EventChoiceFactory::trap_context("1,1", "pit trap", false, false);
        let mut state = make_state(context);
        let resolution = EventChoiceSystem::resolve_choice(&mut state, "trap-9,9", "retreat");
        assert!(!resolution.resolved);
        assert_eq!(resolution.outcome, "context_id_mismatch");
    }
}
