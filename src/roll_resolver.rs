//! Wraps `dice::roll_dice` with DnD-style modifier composition: ability
//! checks, saving throws, and attack rolls. Grounded on
//! `original_source/roll_resolver.py`'s `CheckResult` contract.

use serde::{Deserialize, Serialize};

use crate::dice::{self, RollOptions};
use crate::model::entity::{Ability, Entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    Melee,
    Ranged,
    Spell,
}

impl AttackType {
    pub fn ability(&self) -> Ability {
        match self {
            AttackType::Melee => Ability::Str,
            AttackType::Ranged => Ability::Dex,
            AttackType::Spell => Ability::Int,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdvState {
    pub advantage: bool,
    pub disadvantage: bool,
}

impl AdvState {
    fn to_roll_options(self) -> RollOptions {
        RollOptions {
            advantage: self.advantage,
            disadvantage: self.disadvantage,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub total: i32,
    pub success: bool,
    pub critical_success: bool,
    pub critical_failure: bool,
    pub breakdown: String,
    pub ui_text: String,
}

fn proficiency_bonus_contribution(proficient: bool, expertise: bool, proficiency_bonus: i32) -> i32 {
    if expertise {
        proficiency_bonus * 2
    } else if proficient {
        proficiency_bonus
    } else {
        0
    }
}

/// `abilityCheck(entity, ability, dc, skill?, proficient, expertise, adv/disadv, extraBonus)`.
/// Skill proficiency is auto-detected from `entity.skill_proficiencies` when
/// `skill` is supplied and `proficient` was not already forced `true`.
pub fn ability_check(
    entity: &Entity,
    ability: Ability,
    dc: i32,
    skill: Option<&str>,
    mut proficient: bool,
    expertise: bool,
    adv: AdvState,
    extra_bonus: i32,
) -> CheckResult {
    let core = entity.core();
    if let Some(skill_name) = skill {
        proficient = proficient || core.skill_proficiencies.contains(skill_name);
    }
    let ability_mod = core.abilities.modifier(ability);
    let prof = proficiency_bonus_contribution(proficient, expertise, core.proficiency_bonus);
    let modifier = ability_mod + prof + extra_bonus;

    let outcome = dice::roll_dice(1, 20, modifier, adv.to_roll_options());
    let success = outcome.total >= dc;
    let breakdown = format!(
        "d20({}) + ability_mod({}) + proficiency({}) + extra({}) = {} vs DC {}",
        outcome.picked.first().map(|d| d.value).unwrap_or(0),
        ability_mod,
        prof,
        extra_bonus,
        outcome.total,
        dc
    );
    CheckResult {
        total: outcome.total,
        success,
        critical_success: outcome.is_crit_20,
        critical_failure: outcome.is_crit_1,
        ui_text: format!(
            "{} check: {} ({})",
            ability_label(ability),
            outcome.total,
            if success { "success" } else { "failure" }
        ),
        breakdown,
    }
}

/// `savingThrow(entity, ability, dc, proficient, adv/disadv, extraBonus)`.
/// Save proficiency is auto-detected from `entity.saving_throw_proficiencies`
/// when `proficient` was not already forced `true`.
pub fn saving_throw(
    entity: &Entity,
    ability: Ability,
    dc: i32,
    mut proficient: bool,
    adv: AdvState,
    extra_bonus: i32,
) -> CheckResult {
    let core = entity.core();
    proficient = proficient || core.saving_throw_proficiencies.contains(&ability);
    let ability_mod = core.abilities.modifier(ability);
    let prof = proficiency_bonus_contribution(proficient, false, core.proficiency_bonus);
    let modifier = ability_mod + prof + extra_bonus;

    let outcome = dice::roll_dice(1, 20, modifier, adv.to_roll_options());
    let success = outcome.total >= dc;
    CheckResult {
        total: outcome.total,
        success,
        critical_success: outcome.is_crit_20,
        critical_failure: outcome.is_crit_1,
        breakdown: format!(
            "d20({}) + ability_mod({}) + proficiency({}) + extra({}) = {} vs DC {}",
            outcome.picked.first().map(|d| d.value).unwrap_or(0),
            ability_mod,
            prof,
            extra_bonus,
            outcome.total,
            dc
        ),
        ui_text: format!(
            "{} save: {} ({})",
            ability_label(ability),
            outcome.total,
            if success { "success" } else { "failure" }
        ),
    }
}

/// `attackRoll(attacker, target, attackType, proficient, adv/disadv, extraBonus)`.
/// Ability selection: melee->str, ranged->dex, spell->int.
pub fn attack_roll(
    attacker: &Entity,
    target: &Entity,
    attack_type: AttackType,
    proficient: bool,
    adv: AdvState,
    extra_bonus: i32,
) -> CheckResult {
    let ability = attack_type.ability();
    let core = attacker.core();
    let ability_mod = core.abilities.modifier(ability);
    let prof = proficiency_bonus_contribution(proficient, false, core.proficiency_bonus);
    let modifier = ability_mod + prof + extra_bonus;

    let outcome = dice::roll_dice(1, 20, modifier, adv.to_roll_options());
    let ac = target.core().stats.ac_effective();
    let success = outcome.is_crit_20 || (!outcome.is_crit_1 && outcome.total >= ac);
    CheckResult {
        total: outcome.total,
        success,
        critical_success: outcome.is_crit_20,
        critical_failure: outcome.is_crit_1,
        breakdown: format!(
            "d20({}) + ability_mod({}) + proficiency({}) + extra({}) = {} vs AC {}",
            outcome.picked.first().map(|d| d.value).unwrap_or(0),
            ability_mod,
            prof,
            extra_bonus,
            outcome.total,
            ac
        ),
        ui_text: format!(
            "{:?} attack: {} ({})",
            attack_type,
            outcome.total,
            if success { "hit" } else { "miss" }
        ),
    }
}

fn ability_label(ability: Ability) -> &'static str {
    match ability {
        Ability::Str => "Strength",
        Ability::Dex => "Dexterity",
        Ability::Con => "Constitution",
        Ability::Int => "Intelligence",
        Ability::Wis => "Wisdom",
        Ability::Cha => "Charisma",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, EntityCore, PlayerEntity, Position, Stats};
    use std::collections::{HashMap, HashSet};

    fn make_entity(dex: i32, ac: i32) -> Entity {
        let mut abilities = Abilities::default();
        abilities.dex = dex;
        let mut stats = Stats::default();
        stats.ac_components = AcComponents {
            base: ac,
            ..Default::default()
        };
        stats.recompute_ac();
        Entity::Player(PlayerEntity {
            core: EntityCore {
                id: "e1".into(),
                name: "Test".into(),
                class: "fighter".into(),
                creature_type: "humanoid".into(),
                abilities,
                stats,
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

    #[test]
    fn attack_roll_crit_20_always_hits() {
        let attacker = make_entity(10, 10);
        let target = make_entity(10, 100);
        // Run many times; a crit-20 roll must always succeed regardless of AC.
        for _ in 0..50 {
            let result = attack_roll(&attacker, &target, AttackType::Melee, false, AdvState::default(), 0);
            if result.critical_success {
                assert!(result.success);
            }
        }
    }

    #[test]
    fn ability_check_applies_proficiency_bonus() {
        let entity = make_entity(16, 10);
        let with_prof = ability_check(&entity, Ability::Dex, 10, None, true, false, AdvState::default(), 0);
        assert!(with_prof.breakdown.contains("proficiency(2)"));
    }
}
