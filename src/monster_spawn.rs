//! Guardrails and spawn-point distribution for generated monsters. Grounded
//! on spec §4.10 directly (no surviving `original_source` file for this
//! component in the retrieved pack) and on
//! `original_source/game_engine.py`'s `_get_monster_spawn_positions` for the
//! hint-first, fallback-to-any-walkable-tile distribution strategy.

use std::collections::HashSet;

use crate::config::GameConfig;
use crate::model::entity::MonsterEntity;
use crate::model::map::{GameMap, TileCoord};
use crate::model::state::{PendingEffect, StatusEffect};

/// The only action names `EffectEngine::get_action_availability` recognizes;
/// any other `blocks` entry on a generated status effect is illegitimate.
pub const ALLOWED_STATUS_BLOCKS: &[&str] = &["move", "attack", "cast_spell", "use_item"];

#[derive(Debug, Clone, Default)]
pub struct SpawnGuardrailReport {
    pub downgrades: Vec<String>,
    pub stripped_status_effects: Vec<String>,
}

pub struct MonsterSpawnManager;

impl MonsterSpawnManager {
    /// Power budget an ordinary (non-final-objective) monster at this floor
    /// should not exceed, scaled off player level and depth the same way
    /// the rest of the crate scales difficulty with those two inputs.
    fn power_budget(player_level: i32, depth: i32) -> i32 {
        let level_component = player_level.max(1) * 12;
        let depth_component = depth.max(1) * 6;
        (level_component + depth_component).max(20)
    }

    /// Clamps a freshly generated monster's HP/AC/level to the floor's power
    /// budget. Quest final objectives are allowed to exceed the HP budget
    /// (bosses are meant to), recorded as `high_hp_allowed_final_objective`
    /// rather than silently passing or being clamped away.
    pub fn apply_guardrails(monster: &mut MonsterEntity, player_level: i32, depth: i32, config: &GameConfig) -> SpawnGuardrailReport {
        let mut report = SpawnGuardrailReport::default();
        let budget = Self::power_budget(player_level, depth);

        if monster.core.stats.max_hp > budget {
            if monster.is_final_objective {
                report.downgrades.push("high_hp_allowed_final_objective".to_string());
            } else {
                report.downgrades.push("max_hp_clamped_to_power_budget".to_string());
                monster.core.stats.max_hp = budget;
                monster.core.stats.hp = monster.core.stats.hp.min(budget);
            }
        }

        let ac_cap = 10 + (depth.max(1) + player_level.max(1)) / 2;
        if monster.core.stats.ac_components.base > ac_cap && !monster.is_final_objective {
            report.downgrades.push("ac_clamped_to_power_budget".to_string());
            monster.core.stats.ac_components.base = ac_cap;
            monster.core.stats.recompute_ac();
        }

        let level_cap = config.level_cap as i32;
        if monster.core.stats.level > level_cap {
            report.downgrades.push("level_clamped_to_cap".to_string());
            monster.core.stats.level = level_cap;
        }

        report
    }

    /// Strips status-pack entries with an illegal `blocks` action or a
    /// non-positive duration before they reach `GameState.pending_effects`.
    pub fn sanitize_status_pack(monster_id: &str, pack: Vec<StatusEffect>, report: &mut SpawnGuardrailReport) -> Vec<PendingEffect> {
        pack.into_iter()
            .filter_map(|mut effect| {
                if effect.remaining_turns <= 0 {
                    report.stripped_status_effects.push(format!("{}:non_positive_duration", effect.id));
                    return None;
                }
                let before = effect.blocks.len();
                effect.blocks.retain(|b| ALLOWED_STATUS_BLOCKS.contains(&b.as_str()));
                if effect.blocks.len() != before {
                    report.stripped_status_effects.push(format!("{}:illegal_block_stripped", effect.id));
                }
                Some(PendingEffect { target_id: monster_id.to_string(), effect })
            })
            .collect()
    }

    /// Distributes spawn points for `count` monsters: prefers the local
    /// provider's `monster_hints.spawn_points`, then fills any remainder
    /// from other unoccupied walkable tiles.
    pub fn spawn_positions(map: &GameMap, monster_hints: &serde_json::Value, count: usize) -> Vec<TileCoord> {
        if count == 0 {
            return Vec::new();
        }
        let mut positions = Vec::new();
        let mut used: HashSet<(i32, i32)> = HashSet::new();

        if let Some(points) = monster_hints.get("spawn_points").and_then(|v| v.as_array()) {
            for point in points {
                let (Some(x), Some(y)) = (point.get("x").and_then(|v| v.as_i64()), point.get("y").and_then(|v| v.as_i64())) else {
                    continue;
                };
                let coord = TileCoord { x: x as i32, y: y as i32 };
                if used.contains(&(coord.x, coord.y)) {
                    continue;
                }
                let Some(tile) = map.get_tile(coord) else { continue };
                if tile.character_id.is_some() || !tile.terrain.is_walkable() {
                    continue;
                }
                positions.push(coord);
                used.insert((coord.x, coord.y));
                if positions.len() >= count {
                    return positions;
                }
            }
        }

        for tile in map.tiles.values() {
            if positions.len() >= count {
                break;
            }
            if tile.character_id.is_some() || !tile.terrain.is_walkable() || used.contains(&(tile.x, tile.y)) {
                continue;
            }
            positions.push(TileCoord { x: tile.x, y: tile.y });
            used.insert((tile.x, tile.y));
        }

        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, EntityCore, Position, Stats};
    use crate::model::map::{GenerationMetadata, MapTile, Terrain};
    use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};

    fn monster(max_hp: i32, is_final_objective: bool) -> MonsterEntity {
        MonsterEntity {
            core: EntityCore {
                id: "m1".into(),
                name: "Ogre".into(),
                class: "brute".into(),
                creature_type: "giant".into(),
                abilities: Abilities::default(),
                stats: Stats { max_hp, hp: max_hp, ac_components: AcComponents { base: 10, ..Default::default() }, ..Default::default() },
                combat_runtime: CombatRuntime::default(),
                resistances: StdHashMap::new(),
                vulnerabilities: StdHashMap::new(),
                immunities: StdHashSet::new(),
                equipped_items: StdHashMap::new(),
                inventory: vec![],
                position: Position { x: 0, y: 0 },
                saving_throw_proficiencies: StdHashSet::new(),
                skill_proficiencies: StdHashSet::new(),
                proficiency_bonus: 2,
            },
            quest_monster_id: None,
            is_final_objective,
        }
    }

    #[test]
    fn ordinary_monster_over_budget_gets_clamped() {
        let mut m = monster(10_000, false);
        let report = MonsterSpawnManager::apply_guardrails(&mut m, 1, 1, &GameConfig::default());
        assert!(report.downgrades.contains(&"max_hp_clamped_to_power_budget".to_string()));
        assert!(m.core.stats.max_hp < 10_000);
    }

    #[test]
    fn final_objective_over_budget_is_allowed_not_clamped() {
        let mut m = monster(10_000, true);
        let report = MonsterSpawnManager::apply_guardrails(&mut m, 1, 1, &GameConfig::default());
        assert!(report.downgrades.contains(&"high_hp_allowed_final_objective".to_string()));
        assert_eq!(m.core.stats.max_hp, 10_000);
    }

    #[test]
    fn illegal_status_block_is_stripped() {
        let mut report = SpawnGuardrailReport::default();
        let pack = vec![StatusEffect {
            id: "e1".into(),
            name: "Cursed".into(),
            source_key: "spawn".into(),
            remaining_turns: 3,
            blocks: vec!["move".into(), "delete_save_file".into()],
        }];
        let pending = MonsterSpawnManager::sanitize_status_pack("m1", pack, &mut report);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].effect.blocks, vec!["move".to_string()]);
        assert!(report.stripped_status_effects.iter().any(|r| r.contains("illegal_block_stripped")));
    }

    #[test]
    fn non_positive_duration_effect_is_dropped() {
        let mut report = SpawnGuardrailReport::default();
        let pack = vec![StatusEffect {
            id: "e2".into(),
            name: "Expired".into(),
            source_key: "spawn".into(),
            remaining_turns: 0,
            blocks: vec![],
        }];
        let pending = MonsterSpawnManager::sanitize_status_pack("m1", pack, &mut report);
        assert!(pending.is_empty());
    }

    fn sample_map() -> GameMap {
        let mut tiles = StdHashMap::new();
        tiles.insert("1,1".to_string(), MapTile::new(1, 1, Terrain::Floor));
        tiles.insert("2,2".to_string(), MapTile::new(2, 2, Terrain::Floor));
        GameMap {
            id: "map1".into(),
            name: "Floor".into(),
            width: 5,
            height: 5,
            depth: 1,
            floor_theme: "stone".into(),
            tiles,
            generation_metadata: GenerationMetadata::default(),
        }
    }

    #[test]
    fn spawn_positions_prefers_hint_points_then_falls_back() {
        let map = sample_map();
        let hints = serde_json::json!({"spawn_points": [{"x": 1, "y": 1, "type": "encounter"}]});
        let positions = MonsterSpawnManager::spawn_positions(&map, &hints, 2);
        assert_eq!(positions.len(), 2);
        assert!(positions.contains(&TileCoord { x: 1, y: 1 }));
    }
}
