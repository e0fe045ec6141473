//! Status effects, equipment-passive effects, hooks, and turn ticks.
//! Grounded on the teacher's `model/buff.rs` (stage-ordered affix
//! application) generalized to equipment passives/affixes/sets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity_manager::ActionAvailability;
use crate::model::entity::Entity;
use crate::model::item::Item;
use crate::model::state::{PendingEffect, StatusEffect};

/// Ascending stage order for equipment-affix application, per §4.4.
pub const STAGE_BASE: i32 = 10;
pub const STAGE_EQUIP_PASSIVE: i32 = 20;
pub const STAGE_AFFIX: i32 = 30;
pub const STAGE_SET: i32 = 40;
pub const STAGE_STATUS: i32 = 50;
pub const STAGE_SITUATIONAL: i32 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectTraceRow {
    pub stage: i32,
    pub source: String,
    pub item_id: Option<String>,
    pub key: String,
    pub before: f64,
    pub delta: f64,
    pub after: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    OnAttack,
    OnHit,
    OnDamageTaken,
    OnKill,
    OnTurnStart,
    OnTurnEnd,
}

fn source_key(slot: &str, item_id: &str) -> String {
    format!("equip:{slot}:{item_id}")
}

pub struct EffectEngine;

impl EffectEngine {
    pub fn get_action_availability(entity: &Entity, pending_effects: &[PendingEffect]) -> ActionAvailability {
        let mut availability = ActionAvailability {
            can_move: true,
            can_attack: true,
            can_cast_spell: true,
            can_use_item: true,
            blocked_actions: HashMap::new(),
        };
        if !entity.is_alive() {
            availability.can_move = false;
            availability.can_attack = false;
            availability.can_cast_spell = false;
            availability.can_use_item = false;
            return availability;
        }
        let entity_id = &entity.core().id;
        for effect in pending_effects.iter().filter(|pe| &pe.target_id == entity_id).map(|pe| &pe.effect) {
            for blocked in &effect.blocks {
                availability.blocked_actions.entry(blocked.clone()).or_default().push(effect.id.clone());
                match blocked.as_str() {
                    "move" => availability.can_move = false,
                    "attack" => availability.can_attack = false,
                    "cast_spell" => availability.can_cast_spell = false,
                    "use_item" => availability.can_use_item = false,
                    _ => {}
                }
            }
        }
        availability
    }

    /// Applies an item's equip-passive effects, recording a trace row per
    /// delta so `revert_effects_by_source` can undo exactly what was done.
    pub fn apply_equipment_passive_effects(entity: &mut Entity, item: &Item, slot: &str) -> Vec<EffectTraceRow> {
        let key = source_key(slot, &item.id);
        let mut trace = Vec::new();
        for effect in &item.equip_passive_effects {
            let before = apply_delta_get_before(entity, &effect.key, effect.value);
            trace.push(EffectTraceRow {
                stage: STAGE_EQUIP_PASSIVE,
                source: key.clone(),
                item_id: Some(item.id.clone()),
                key: effect.key.clone(),
                before,
                delta: effect.value,
                after: before + effect.value,
            });
        }
        for affix in &item.affixes {
            let before = apply_delta_get_before(entity, &affix.key, affix.value);
            trace.push(EffectTraceRow {
                stage: STAGE_AFFIX,
                source: key.clone(),
                item_id: Some(item.id.clone()),
                key: affix.key.clone(),
                before,
                delta: affix.value,
                after: before + affix.value,
            });
        }
        trace
    }

    /// Reverts every delta previously recorded under `source_key`; identity
    /// on the entity's derived state once all traces are undone.
    pub fn revert_effects_by_source(entity: &mut Entity, trace: &[EffectTraceRow]) {
        for row in trace.iter().rev() {
            apply_delta_get_before(entity, &row.key, -row.delta);
        }
    }

    pub fn process_turn_effects(effects: &mut Vec<StatusEffect>) -> Vec<String> {
        let mut events = Vec::new();
        effects.retain_mut(|effect| {
            effect.remaining_turns -= 1;
            if effect.remaining_turns <= 0 {
                events.push(format!("{} expired", effect.name));
                false
            } else {
                true
            }
        });
        events
    }

    /// Sums every equipped item's affix/passive delta for a well-known
    /// trigger key (`on_kill_heal`, `regen_per_turn`, ...). Reuses the same
    /// affix/passive schema equip application does rather than adding a
    /// dedicated hook-binding field to `Item`.
    fn sum_equipped_key(entity: &Entity, key: &str) -> f64 {
        entity
            .core()
            .equipped_items
            .values()
            .map(|item| {
                item.affixes.iter().filter(|a| a.key == key).map(|a| a.value).sum::<f64>()
                    + item.equip_passive_effects.iter().filter(|e| e.key == key).map(|e| e.value).sum::<f64>()
            })
            .sum()
    }

    /// `Hook::OnKill`: heals the killer by any equipped `on_kill_heal`
    /// affix/passive total, capped at `max_hp`.
    pub fn dispatch_on_kill(entity: &mut Entity) -> Vec<String> {
        let total = Self::sum_equipped_key(entity, "on_kill_heal");
        if total <= 0.0 {
            return Vec::new();
        }
        let core = entity.core_mut();
        let before = core.stats.hp;
        core.stats.hp = (core.stats.hp + total as i32).min(core.stats.max_hp);
        if core.stats.hp == before {
            return Vec::new();
        }
        vec![format!("{} regenerates {} hp from a killing blow", core.name, core.stats.hp - before)]
    }

    /// `Hook::OnTurnEnd` regen: heals by any equipped `regen_per_turn`
    /// affix/passive total, capped at `max_hp`. Returns the amount healed.
    pub fn dispatch_regen_per_turn(entity: &mut Entity) -> i32 {
        let total = Self::sum_equipped_key(entity, "regen_per_turn");
        if total <= 0.0 {
            return 0;
        }
        let core = entity.core_mut();
        let before = core.stats.hp;
        core.stats.hp = (core.stats.hp + total as i32).min(core.stats.max_hp);
        core.stats.hp - before
    }
}

/// Apply a numeric delta to one of a handful of well-known derived fields;
/// returns the value before the delta for trace-row bookkeeping.
fn apply_delta_get_before(entity: &mut Entity, key: &str, delta: f64) -> f64 {
    let core = entity.core_mut();
    match key {
        "ac" => {
            let before = core.stats.ac_components.situational as f64;
            core.stats.ac_components.situational += delta as i32;
            core.stats.recompute_ac();
            before
        }
        "max_hp" => {
            let before = core.stats.max_hp as f64;
            core.stats.max_hp = (core.stats.max_hp as f64 + delta).max(1.0) as i32;
            before
        }
        "speed" => {
            let before = core.stats.speed as f64;
            core.stats.speed = (core.stats.speed as f64 + delta).max(0.0) as i32;
            before
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, EntityCore, PlayerEntity, Position, Stats};
    use crate::model::item::{EquipPassiveEffect, Item};
    use std::collections::{HashMap as StdHashMap, HashSet};

    fn make_entity() -> Entity {
        Entity::Player(PlayerEntity {
            core: EntityCore {
                id: "p1".into(),
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
        })
    }

    fn make_item() -> Item {
        Item {
            id: "shield-1".into(),
            name: "Shield of Warding".into(),
            description: String::new(),
            item_type: "armor".into(),
            rarity: "rare".into(),
            value: 0,
            weight: 0.0,
            properties: StdHashMap::new(),
            is_equippable: true,
            equip_slot: Some("off_hand".into()),
            unique_key: None,
            equip_requirements: None,
            equip_passive_effects: vec![EquipPassiveEffect {
                key: "ac".into(),
                value: 2.0,
                stage_order: STAGE_EQUIP_PASSIVE,
            }],
            affixes: vec![],
            set_id: None,
            set_thresholds: StdHashMap::new(),
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

    #[test]
    fn apply_then_revert_is_identity() {
        let mut entity = make_entity();
        let ac_before = entity.core().stats.ac;
        let item = make_item();
        let trace = EffectEngine::apply_equipment_passive_effects(&mut entity, &item, "off_hand");
        assert_ne!(entity.core().stats.ac, ac_before);
        EffectEngine::revert_effects_by_source(&mut entity, &trace);
        assert_eq!(entity.core().stats.ac, ac_before);
    }

    #[test]
    fn dead_entity_has_all_actions_blocked() {
        let mut entity = make_entity();
        entity.core_mut().stats.hp = 0;
        let availability = EffectEngine::get_action_availability(&entity, &[]);
        assert!(!availability.can_move);
        assert!(!availability.can_attack);
    }

    #[test]
    fn blocked_action_from_pending_status_effect_is_reported() {
        let entity = make_entity();
        let pending = vec![crate::model::state::PendingEffect {
            target_id: entity.core().id.clone(),
            effect: StatusEffect {
                id: "stun-1".into(),
                name: "Stunned".into(),
                source_key: "trap:1".into(),
                remaining_turns: 2,
                blocks: vec!["move".into(), "attack".into()],
            },
        }];
        let availability = EffectEngine::get_action_availability(&entity, &pending);
        assert!(!availability.can_move);
        assert!(!availability.can_attack);
        assert!(availability.can_cast_spell);
        assert!(availability.blocked_actions.contains_key("move"));
    }

    #[test]
    fn turn_effects_expire_after_duration() {
        let mut effects = vec![StatusEffect {
            id: "e1".into(),
            name: "Poisoned".into(),
            source_key: "trap:1".into(),
            remaining_turns: 1,
            blocks: vec![],
        }];
        let events = EffectEngine::process_turn_effects(&mut effects);
        assert!(effects.is_empty());
        assert_eq!(events.len(), 1);
    }
}
