//! Map/tile model, including the trap schema grounded on
//! `trap_schema.py`'s `TrapSchema`/`TrapDataValidator`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::item::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terrain {
    Wall,
    Floor,
    Door,
    Trap,
    Treasure,
    StairsUp,
    StairsDown,
}

impl Terrain {
    pub fn is_walkable(&self) -> bool {
        matches!(
            self,
            Terrain::Floor | Terrain::Door | Terrain::Trap | Terrain::Treasure | Terrain::StairsUp | Terrain::StairsDown
        )
    }
}

pub const VALID_TRAP_TYPES: &[&str] = &["damage", "debuff", "teleport", "alarm", "restraint"];
pub const VALID_DAMAGE_TYPES: &[&str] = &[
    "physical", "fire", "cold", "lightning", "poison", "necrotic", "radiant", "psychic", "force", "acid", "thunder",
];
pub const VALID_DEBUFF_TYPES: &[&str] = &["poisoned", "blinded", "slowed", "weakened", "frightened"];

/// Grounded on `original_source/trap_schema.py`'s `TrapSchema` dataclass and
/// `TrapDataValidator.validate_and_normalize` clamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrapData {
    pub trap_type: String,
    pub trap_name: String,
    #[serde(default)]
    pub trap_description: String,
    pub detect_dc: i32,
    pub disarm_dc: i32,
    pub save_dc: i32,
    #[serde(default)]
    pub damage: Option<i32>,
    #[serde(default)]
    pub damage_type: Option<String>,
    #[serde(default)]
    pub save_half_damage: bool,
    #[serde(default)]
    pub debuff_type: Option<String>,
    #[serde(default)]
    pub debuff_duration: Option<i32>,
    #[serde(default)]
    pub teleport_range: Option<i32>,
    #[serde(default)]
    pub alarm_radius: Option<i32>,
    #[serde(default)]
    pub summon_monsters: bool,
    #[serde(default)]
    pub restraint_dc: Option<i32>,
    #[serde(default)]
    pub restraint_duration: Option<i32>,
    #[serde(default)]
    pub is_detected: bool,
    #[serde(default)]
    pub is_disarmed: bool,
    #[serde(default)]
    pub is_triggered: bool,
}

impl TrapData {
    /// Clamp every DC/duration/radius field into the `trap_schema.py` ranges.
    /// Unknown `trap_type`/`damage_type`/`debuff_type` fall back to the first
    /// valid entry rather than being rejected, matching the Python
    /// validator's `_normalize_enum`-style tolerance.
    pub fn validate_and_normalize(&mut self) {
        if !VALID_TRAP_TYPES.contains(&self.trap_type.as_str()) {
            self.trap_type = VALID_TRAP_TYPES[0].to_string();
        }
        self.detect_dc = clamp_dc(self.detect_dc);
        self.disarm_dc = clamp_dc(self.disarm_dc);
        self.save_dc = clamp_dc(self.save_dc);

        if let Some(dt) = &self.damage_type {
            if !VALID_DAMAGE_TYPES.contains(&dt.as_str()) {
                self.damage_type = Some(VALID_DAMAGE_TYPES[0].to_string());
            }
        }
        if let Some(d) = self.damage {
            self.damage = Some(d.clamp(1, 100));
        }
        if let Some(dt) = &self.debuff_type {
            if !VALID_DEBUFF_TYPES.contains(&dt.as_str()) {
                self.debuff_type = Some(VALID_DEBUFF_TYPES[0].to_string());
            }
        }
        if let Some(d) = self.debuff_duration {
            self.debuff_duration = Some(d.clamp(1, 10));
        }
        if let Some(d) = self.restraint_duration {
            self.restraint_duration = Some(d.clamp(1, 10));
        }
        if let Some(r) = self.alarm_radius {
            self.alarm_radius = Some(r.clamp(5, 20));
        }
    }
}

fn clamp_dc(dc: i32) -> i32 {
    dc.clamp(5, 30)
}

/// Typed event payload; `Custom` keeps forward compatibility with
/// LLM-authored shapes the engine doesn't recognize yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    Combat { encounter_hint: Option<String> },
    Treasure { loot_hint: Option<String> },
    Trap(TrapData),
    Story { narrative_hint: Option<String> },
    Mystery { flavor: Option<String> },
    Custom(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    pub fn key(&self) -> String {
        format!("{},{}", self.x, self.y)
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let (x, y) = key.split_once(',')?;
        Some(Self {
            x: x.trim().parse().ok()?,
            y: y.trim().parse().ok()?,
        })
    }

    pub fn chebyshev_distance(&self, other: &TileCoord) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapTile {
    pub x: i32,
    pub y: i32,
    pub terrain: Terrain,
    #[serde(default)]
    pub is_explored: bool,
    #[serde(default)]
    pub is_visible: bool,
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub items_collected: HashSet<String>,
    #[serde(default)]
    pub room_id: Option<u32>,
    #[serde(default)]
    pub room_type: Option<String>,
    #[serde(default)]
    pub has_event: bool,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub event_data: Option<EventData>,
    #[serde(default)]
    pub is_event_hidden: bool,
    #[serde(default)]
    pub event_triggered: bool,
    #[serde(default)]
    pub trap_detected: bool,
    #[serde(default)]
    pub trap_disarmed: bool,
}

impl MapTile {
    pub fn new(x: i32, y: i32, terrain: Terrain) -> Self {
        Self {
            x,
            y,
            terrain,
            is_explored: false,
            is_visible: false,
            character_id: None,
            items: Vec::new(),
            items_collected: HashSet::new(),
            room_id: None,
            room_type: None,
            has_event: false,
            event_type: None,
            event_data: None,
            is_event_hidden: false,
            event_triggered: false,
            trap_detected: false,
            trap_disarmed: false,
        }
    }

    pub fn coord(&self) -> TileCoord {
        TileCoord { x: self.x, y: self.y }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    #[serde(default)]
    pub contract_hash: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub validation_reports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMap {
    pub id: String,
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
    pub floor_theme: String,
    pub tiles: HashMap<String, MapTile>,
    #[serde(default)]
    pub generation_metadata: GenerationMetadata,
}

impl GameMap {
    pub fn get_tile(&self, coord: TileCoord) -> Option<&MapTile> {
        self.tiles.get(&coord.key())
    }

    pub fn get_tile_mut(&mut self, coord: TileCoord) -> Option<&mut MapTile> {
        self.tiles.get_mut(&coord.key())
    }

    pub fn in_bounds(&self, coord: TileCoord) -> bool {
        coord.x >= 0 && coord.y >= 0 && coord.x < self.width && coord.y < self.height
    }

    pub fn walkable_tiles(&self) -> impl Iterator<Item = &MapTile> {
        self.tiles.values().filter(|t| t.terrain.is_walkable())
    }

    /// BFS over walkable terrain from `start`; returns the set of reachable
    /// walkable tile keys. Used by both the generator's validate-and-repair
    /// pass and the patch-batch connectivity post-check.
    pub fn reachable_from(&self, start: TileCoord) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut queue = std::collections::VecDeque::new();
        if self.get_tile(start).map_or(false, |t| t.terrain.is_walkable()) {
            visited.insert(start.key());
            queue.push_back(start);
        }
        while let Some(cur) = queue.pop_front() {
            for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let next = TileCoord { x: cur.x + dx, y: cur.y + dy };
                if visited.contains(&next.key()) {
                    continue;
                }
                if let Some(tile) = self.get_tile(next) {
                    if tile.terrain.is_walkable() {
                        visited.insert(next.key());
                        queue.push_back(next);
                    }
                }
            }
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_dc_clamps_into_range() {
        let mut trap = TrapData {
            trap_type: "damage".into(),
            trap_name: "Spike Pit".into(),
            trap_description: String::new(),
            detect_dc: 1,
            disarm_dc: 99,
            save_dc: 15,
            damage: Some(500),
            damage_type: Some("unknown".into()),
            save_half_damage: false,
            debuff_type: None,
            debuff_duration: None,
            teleport_range: None,
            alarm_radius: Some(1),
            summon_monsters: false,
            restraint_dc: None,
            restraint_duration: Some(99),
            is_detected: false,
            is_disarmed: false,
            is_triggered: false,
        };
        trap.validate_and_normalize();
        assert_eq!(trap.detect_dc, 5);
        assert_eq!(trap.disarm_dc, 30);
        assert_eq!(trap.damage, Some(100));
        assert_eq!(trap.damage_type, Some("physical".to_string()));
        assert_eq!(trap.alarm_radius, Some(5));
        assert_eq!(trap.restraint_duration, Some(10));
    }

    #[test]
    fn tile_coord_key_roundtrips() {
        let coord = TileCoord { x: 3, y: -2 };
        let key = coord.key();
        assert_eq!(TileCoord::parse_key(&key), Some(coord));
    }

    #[test]
    fn reachable_from_respects_walls() {
        let mut tiles = HashMap::new();
        tiles.insert("0,0".to_string(), MapTile::new(0, 0, Terrain::Floor));
        tiles.insert("1,0".to_string(), MapTile::new(1, 0, Terrain::Wall));
        tiles.insert("2,0".to_string(), MapTile::new(2, 0, Terrain::Floor));
        let map = GameMap {
            id: "m1".into(),
            name: "test".into(),
            width: 3,
            height: 1,
            depth: 1,
            floor_theme: "stone".into(),
            tiles,
            generation_metadata: GenerationMetadata::default(),
        };
        let reachable = map.reachable_from(TileCoord { x: 0, y: 0 });
        assert!(reachable.contains("0,0"));
        assert!(!reachable.contains("2,0"));
    }
}
