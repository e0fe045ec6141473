//! Local procedural map generator: the `legacy` chain `MapOrchestrator` can
//! always fall back to. Grounded in full on
//! `original_source/local_map_provider.py` — room carving, MST/hub/linear
//! corridor connection, room-role assignment, stairs/door/trap/treasure
//! placement, quest-aware event placement, BFS validate-and-repair, and
//! monster-hint emission.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::map::{EventData, GameMap, GenerationMetadata, MapTile, Terrain, TileCoord, TrapData};
use crate::model::quest::SpecialEvent;

/// Subset of quest fields the generator reads. Accepted as a loose context
/// rather than a full `Quest` since callers may only have an in-progress
/// quest draft (or nothing at all) when a floor is generated.
#[derive(Debug, Clone, Default)]
pub struct QuestGenerationContext {
    pub quest_type: String,
    pub map_themes: Vec<String>,
    pub special_events: Vec<SpecialEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayoutStyle {
    Standard,
    Linear,
    Hub,
}

#[derive(Debug, Clone)]
struct MapRequirements {
    min_rooms: i32,
    max_rooms: i32,
    needs_boss_room: bool,
    needs_treasure_room: bool,
    needs_special_rooms: i32,
    layout_style: LayoutStyle,
}

#[derive(Debug, Clone)]
struct Room {
    id: u32,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    room_type: String,
}

impl Room {
    fn center(&self) -> TileCoord {
        TileCoord { x: self.x + self.width / 2, y: self.y + self.height / 2 }
    }

    fn label(&self) -> String {
        format!("room-{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Stairs {
    up: Option<TileCoord>,
    down: Option<TileCoord>,
}

const VALID_THEMES: &[&str] = &[
    "normal", "magic", "abandoned", "cave", "combat", "grassland", "desert", "farmland", "snowfield", "town",
];

pub struct LocalMapProvider;

impl LocalMapProvider {
    /// Generates a floor using the thread-local RNG; see
    /// [`generate_map_with`](Self::generate_map_with) for a seedable variant.
    pub fn generate_map(
        &self,
        width: i32,
        height: i32,
        depth: i32,
        theme: &str,
        quest_context: Option<&QuestGenerationContext>,
        max_quest_floors: i32,
        monster_hints_enabled: bool,
    ) -> (GameMap, serde_json::Value) {
        self.generate_map_with(
            &mut rand::thread_rng(),
            width,
            height,
            depth,
            theme,
            quest_context,
            max_quest_floors,
            monster_hints_enabled,
        )
    }

    pub fn generate_map_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        width: i32,
        height: i32,
        depth: i32,
        theme: &str,
        quest_context: Option<&QuestGenerationContext>,
        max_quest_floors: i32,
        monster_hints_enabled: bool,
    ) -> (GameMap, serde_json::Value) {
        let depth = depth.max(1);
        let mut game_map = GameMap {
            id: format!("map-{:x}", rng.gen::<u64>()),
            name: String::new(),
            width,
            height,
            depth,
            floor_theme: infer_floor_theme(theme, quest_context),
            tiles: std::collections::HashMap::new(),
            generation_metadata: GenerationMetadata::default(),
        };
        game_map.name = build_map_name(theme, depth);

        let requirements = analyze_quest_requirements(quest_context, depth, max_quest_floors);
        let rooms = build_rooms(rng, width, height, &requirements);

        init_walls(&mut game_map);
        carve_rooms(&mut game_map, &rooms);
        connect_rooms(rng, &mut game_map, &rooms, &requirements);
        let rooms = assign_room_types(rng, rooms, depth, &requirements, max_quest_floors);
        paint_room_types(&mut game_map, &rooms);
        let stairs = place_stairs(&mut game_map, &rooms, depth, max_quest_floors);
        place_special_terrain(rng, &mut game_map, &stairs);
        place_events(rng, &mut game_map, quest_context, depth);

        let validation_report = validate_and_repair_map(&mut game_map, &rooms, &stairs, quest_context, depth);
        let monster_hints =
            build_monster_hints(rng, &game_map, &rooms, quest_context, max_quest_floors, monster_hints_enabled);

        game_map.generation_metadata.provider = Some("local_map_provider".to_string());
        game_map.generation_metadata.validation_reports.push(validation_report.to_string());

        (game_map, monster_hints)
    }
}

fn infer_floor_theme(theme: &str, quest_context: Option<&QuestGenerationContext>) -> String {
    if VALID_THEMES.contains(&theme) {
        return theme.to_string();
    }

    if let Some(ctx) = quest_context {
        if let Some(candidate) = ctx.map_themes.iter().find(|t| VALID_THEMES.contains(&t.as_str())) {
            return candidate.clone();
        }

        let mapped = match ctx.quest_type.as_str() {
            "boss_fight" => Some("combat"),
            "exploration" => Some("abandoned"),
            "rescue" => Some("cave"),
            "investigation" => Some("town"),
            _ => None,
        };
        if let Some(mapped) = mapped {
            return mapped.to_string();
        }
    }

    "normal".to_string()
}

fn build_map_name(theme: &str, depth: i32) -> String {
    let name = if theme.trim().is_empty() { "Adventure Zone" } else { theme };
    if name.contains("stage/floor") {
        name.to_string()
    } else {
        format!("{name} (stage/floor {depth})")
    }
}

fn init_walls(map: &mut GameMap) {
    for x in 0..map.width {
        for y in 0..map.height {
            let coord = TileCoord { x, y };
            map.tiles.insert(coord.key(), MapTile::new(x, y, Terrain::Wall));
        }
    }
}

fn analyze_quest_requirements(
    quest_context: Option<&QuestGenerationContext>,
    depth: i32,
    max_quest_floors: i32,
) -> MapRequirements {
    let mut requirements = MapRequirements {
        min_rooms: 3,
        max_rooms: 8,
        needs_boss_room: false,
        needs_treasure_room: false,
        needs_special_rooms: 0,
        layout_style: LayoutStyle::Standard,
    };

    let Some(ctx) = quest_context else {
        if depth >= max_quest_floors {
            requirements.needs_boss_room = true;
            requirements.layout_style = LayoutStyle::Linear;
        }
        return requirements;
    };

    match ctx.quest_type.as_str() {
        "boss_fight" => {
            requirements.needs_boss_room = true;
            requirements.layout_style = LayoutStyle::Linear;
        }
        "treasure_hunt" => {
            requirements.needs_treasure_room = true;
            requirements.needs_special_rooms = 1;
        }
        "exploration" => {
            requirements.layout_style = LayoutStyle::Hub;
            requirements.needs_special_rooms = 1;
        }
        _ => {}
    }

    let current_floor_events = ctx.special_events.iter().filter(|e| matches_depth_hint(e.location_hint, depth)).count();
    let required_rooms = (3i32).max(current_floor_events as i32);
    requirements.min_rooms = requirements.min_rooms.max(required_rooms).min(10);

    if depth >= max_quest_floors {
        requirements.needs_boss_room = true;
        requirements.layout_style = LayoutStyle::Linear;
    }

    requirements
}

fn matches_depth_hint(location_hint: Option<i32>, depth: i32) -> bool {
    match location_hint {
        Some(hint) => hint == depth,
        None => true,
    }
}

fn build_rooms<R: Rng + ?Sized>(rng: &mut R, width: i32, height: i32, req: &MapRequirements) -> Vec<Room> {
    let min_rooms = req.min_rooms.max(3);
    let max_rooms = req.max_rooms.max(min_rooms).min(12);
    let area_guess = if width * height > 0 { (width * height) / 120 } else { min_rooms };
    let room_count = min_rooms.max(max_rooms.min(area_guess));

    let mut rooms = Vec::new();
    let mut attempts = room_count * 24;
    let mut next_id = 1;

    while (rooms.len() as i32) < room_count && attempts > 0 {
        attempts -= 1;
        let rw = rng.gen_range(4..=8);
        let rh = rng.gen_range(4..=8);
        if width - rw - 2 <= 1 || height - rh - 2 <= 1 {
            break;
        }
        let rx = rng.gen_range(1..=(width - rw - 2));
        let ry = rng.gen_range(1..=(height - rh - 2));
        let candidate = Room { id: next_id, x: rx, y: ry, width: rw, height: rh, room_type: "normal".to_string() };

        if rooms.iter().any(|r| overlap(&candidate, r)) {
            continue;
        }

        rooms.push(candidate);
        next_id += 1;
    }

    if rooms.is_empty() {
        rooms.push(Room {
            id: 1,
            x: 1,
            y: 1,
            width: (width - 2).max(4),
            height: (height - 2).max(4),
            room_type: "entrance".to_string(),
        });
    }

    rooms
}

fn overlap(a: &Room, b: &Room) -> bool {
    let margin = 1;
    a.x - margin < b.x + b.width + margin
        && a.x + a.width + margin > b.x - margin
        && a.y - margin < b.y + b.height + margin
        && a.y + a.height + margin > b.y - margin
}

fn carve_rooms(map: &mut GameMap, rooms: &[Room]) {
    for room in rooms {
        for x in room.x..room.x + room.width {
            for y in room.y..room.y + room.height {
                if let Some(tile) = map.get_tile_mut(TileCoord { x, y }) {
                    tile.terrain = Terrain::Floor;
                    tile.room_id = Some(room.id);
                    tile.room_type = Some(room.room_type.clone());
                }
            }
        }
    }
}

fn connect_rooms<R: Rng + ?Sized>(rng: &mut R, map: &mut GameMap, rooms: &[Room], req: &MapRequirements) {
    if rooms.len() <= 1 {
        return;
    }

    match req.layout_style {
        LayoutStyle::Hub => {
            for room in &rooms[1..] {
                connect_two_rooms(map, &rooms[0], room);
            }
        }
        LayoutStyle::Linear => {
            for pair in rooms.windows(2) {
                connect_two_rooms(map, &pair[0], &pair[1]);
            }
        }
        LayoutStyle::Standard => connect_all_rooms(rng, map, rooms),
    }
}

fn connect_two_rooms(map: &mut GameMap, a: &Room, b: &Room) {
    let ca = a.center();
    let cb = b.center();
    carve_corridor(map, ca.x, ca.y, cb.x, ca.y);
    carve_corridor(map, cb.x, ca.y, cb.x, cb.y);
}

/// Minimum-spanning-tree connection over room-center Manhattan distance, plus
/// up to two extra edges (kept with 30% probability) so the floor isn't a
/// strict tree.
fn connect_all_rooms<R: Rng + ?Sized>(rng: &mut R, map: &mut GameMap, rooms: &[Room]) {
    if rooms.len() <= 1 {
        return;
    }

    let mut distances: Vec<(i32, usize, usize)> = Vec::new();
    for i in 0..rooms.len() {
        for j in (i + 1)..rooms.len() {
            let ca = rooms[i].center();
            let cb = rooms[j].center();
            let d = (ca.x - cb.x).abs() + (ca.y - cb.y).abs();
            distances.push((d, i, j));
        }
    }
    distances.sort_by_key(|(d, ..)| *d);

    let mut parent: Vec<usize> = (0..rooms.len()).collect();
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let mut used_edges = 0usize;
    let mut remaining = Vec::new();
    for (d, i, j) in distances {
        let (pi, pj) = (find(&mut parent, i), find(&mut parent, j));
        if pi != pj {
            parent[pi] = pj;
            connect_two_rooms(map, &rooms[i], &rooms[j]);
            used_edges += 1;
            if used_edges >= rooms.len() - 1 {
                break;
            }
        } else {
            remaining.push((d, i, j));
        }
    }

    let extra = remaining.len().min(2);
    for (_, i, j) in remaining.iter().rev().take(extra) {
        if rng.gen_bool(0.3) {
            connect_two_rooms(map, &rooms[*i], &rooms[*j]);
        }
    }
}

fn carve_corridor(map: &mut GameMap, x1: i32, y1: i32, x2: i32, y2: i32) {
    if x1 == x2 {
        for y in y1.min(y2)..=y1.max(y2) {
            set_corridor_tile(map, x1, y);
        }
        return;
    }
    for x in x1.min(x2)..=x1.max(x2) {
        set_corridor_tile(map, x, y1);
    }
}

fn set_corridor_tile(map: &mut GameMap, x: i32, y: i32) {
    let Some(tile) = map.get_tile_mut(TileCoord { x, y }) else { return };
    if matches!(tile.terrain, Terrain::StairsUp | Terrain::StairsDown | Terrain::Trap | Terrain::Treasure | Terrain::Door) {
        return;
    }
    if tile.terrain == Terrain::Wall {
        tile.terrain = Terrain::Floor;
    }
    if tile.room_type.is_none() {
        tile.room_type = Some("corridor".to_string());
    }
}

fn assign_room_types<R: Rng + ?Sized>(
    rng: &mut R,
    mut rooms: Vec<Room>,
    depth: i32,
    req: &MapRequirements,
    max_quest_floors: i32,
) -> Vec<Room> {
    if rooms.is_empty() {
        return rooms;
    }

    let needs_boss = req.needs_boss_room || depth >= max_quest_floors;
    rooms[0].room_type = "entrance".to_string();
    if rooms.len() > 1 {
        let last = rooms.len() - 1;
        rooms[last].room_type = if needs_boss { "boss".to_string() } else { "special".to_string() };
    }

    let mut assigned_special = 0;
    let mut assigned_treasure = 0;
    let last = rooms.len().saturating_sub(1).max(1);
    for room in rooms.iter_mut().take(last).skip(1) {
        if room.room_type != "normal" {
            continue;
        }
        if assigned_treasure < i32::from(req.needs_treasure_room) {
            room.room_type = "treasure".to_string();
            assigned_treasure += 1;
            continue;
        }
        if assigned_special < req.needs_special_rooms {
            room.room_type = "special".to_string();
            assigned_special += 1;
            continue;
        }
        let roll: f64 = rng.gen();
        if roll < 0.2 {
            room.room_type = "treasure".to_string();
        } else if roll < 0.45 {
            room.room_type = "special".to_string();
        }
    }

    rooms
}

fn paint_room_types(map: &mut GameMap, rooms: &[Room]) {
    for room in rooms {
        for x in room.x..room.x + room.width {
            for y in room.y..room.y + room.height {
                if let Some(tile) = map.get_tile_mut(TileCoord { x, y }) {
                    if tile.room_id == Some(room.id) {
                        tile.room_type = Some(room.room_type.clone());
                    }
                }
            }
        }
    }
}

fn place_stairs(map: &mut GameMap, rooms: &[Room], depth: i32, max_quest_floors: i32) -> Stairs {
    let mut stairs = Stairs::default();
    let Some(first) = rooms.first() else { return stairs };

    if depth > 1 {
        let up = first.center();
        if let Some(tile) = map.get_tile_mut(up) {
            tile.terrain = Terrain::StairsUp;
            stairs.up = Some(up);
        }
    }

    if depth < max_quest_floors && rooms.len() > 1 {
        let down = rooms[rooms.len() - 1].center();
        if let Some(tile) = map.get_tile_mut(down) {
            tile.terrain = Terrain::StairsDown;
            stairs.down = Some(down);
        }
    }

    stairs
}

fn place_special_terrain<R: Rng + ?Sized>(rng: &mut R, map: &mut GameMap, stairs: &Stairs) {
    let mut blocked = HashSet::new();
    if let Some(up) = stairs.up {
        blocked.insert(up.key());
    }
    if let Some(down) = stairs.down {
        blocked.insert(down.key());
    }

    let mut floor_tiles: Vec<TileCoord> = map
        .tiles
        .values()
        .filter(|t| t.terrain == Terrain::Floor && !blocked.contains(&t.coord().key()))
        .map(|t| t.coord())
        .collect();
    floor_tiles.shuffle(rng);

    let trap_count = (floor_tiles.len() / 30).clamp(1, 4);
    let treasure_count = (floor_tiles.len() / 40).clamp(1, 3);

    for _ in 0..trap_count {
        let Some(coord) = floor_tiles.pop() else { break };
        if let Some(tile) = map.get_tile_mut(coord) {
            tile.terrain = Terrain::Trap;
            tile.trap_detected = false;
            tile.trap_disarmed = false;
        }
    }
    for _ in 0..treasure_count {
        let Some(coord) = floor_tiles.pop() else { break };
        if let Some(tile) = map.get_tile_mut(coord) {
            if tile.terrain == Terrain::Floor {
                tile.terrain = Terrain::Treasure;
            }
        }
    }

    place_doors(rng, map, &blocked);
}

fn place_doors<R: Rng + ?Sized>(rng: &mut R, map: &mut GameMap, blocked: &HashSet<String>) {
    let mut candidates: Vec<TileCoord> = Vec::new();
    for tile in map.tiles.values() {
        let coord = tile.coord();
        if blocked.contains(&coord.key()) || tile.terrain != Terrain::Floor {
            continue;
        }
        let neighbors = neighbors4(coord);
        let neighbor_tiles: Vec<Option<&MapTile>> = neighbors.iter().map(|n| map.get_tile(*n)).collect();
        let has_corridor = neighbor_tiles.iter().flatten().any(|n| n.room_type.as_deref() == Some("corridor"));
        let has_room = neighbor_tiles
            .iter()
            .flatten()
            .any(|n| n.room_type.as_deref().map(|t| t != "corridor").unwrap_or(false));
        let wall_count = neighbor_tiles.iter().flatten().filter(|n| n.terrain == Terrain::Wall).count();

        if has_corridor && has_room && wall_count >= 1 {
            candidates.push(coord);
        }
    }

    candidates.shuffle(rng);
    let door_target = (candidates.len() / 3).clamp(1, 8).min(candidates.len());
    for coord in candidates.into_iter().take(door_target) {
        if let Some(tile) = map.get_tile_mut(coord) {
            if tile.terrain == Terrain::Floor {
                tile.terrain = Terrain::Door;
            }
        }
    }
}

fn neighbors4(coord: TileCoord) -> [TileCoord; 4] {
    [
        TileCoord { x: coord.x + 1, y: coord.y },
        TileCoord { x: coord.x - 1, y: coord.y },
        TileCoord { x: coord.x, y: coord.y + 1 },
        TileCoord { x: coord.x, y: coord.y - 1 },
    ]
}

fn place_events<R: Rng + ?Sized>(rng: &mut R, map: &mut GameMap, quest_context: Option<&QuestGenerationContext>, depth: i32) {
    let mut event_tiles: Vec<TileCoord> = map
        .tiles
        .values()
        .filter(|t| matches!(t.terrain, Terrain::Floor | Terrain::Door) && !t.has_event && t.character_id.is_none())
        .map(|t| t.coord())
        .collect();
    event_tiles.shuffle(rng);

    if let Some(ctx) = quest_context {
        for event in &ctx.special_events {
            if !matches_depth_hint(event.location_hint, depth) {
                continue;
            }
            let Some(coord) = event_tiles.pop() else { break };
            let Some(tile) = map.get_tile_mut(coord) else { continue };
            tile.has_event = true;
            tile.event_type = Some("story".to_string());
            tile.is_event_hidden = true;
            tile.event_triggered = false;
            tile.event_data = Some(EventData::Custom(serde_json::json!({
                "quest_event_id": event.event_id,
                "progress_value": event.progress_value,
                "is_mandatory": event.is_mandatory,
            })));
        }
    }

    let normal_event_count = (event_tiles.len() / 18).clamp(2, 8);
    let event_types = ["combat", "treasure", "story", "trap", "mystery"];
    for _ in 0..normal_event_count {
        let Some(coord) = event_tiles.pop() else { break };
        let Some(tile) = map.get_tile_mut(coord) else { continue };
        let event_type = event_types[rng.gen_range(0..event_types.len())];
        tile.has_event = true;
        tile.event_type = Some(event_type.to_string());
        tile.is_event_hidden = rng.gen_bool(2.0 / 3.0);
        tile.event_triggered = false;
        tile.event_data = Some(default_event_payload(rng, event_type));
    }
}

fn default_event_payload<R: Rng + ?Sized>(rng: &mut R, event_type: &str) -> EventData {
    match event_type {
        "combat" => {
            let count = rng.gen_range(1..=3);
            let difficulty = ["easy", "medium", "hard"][rng.gen_range(0..3)];
            EventData::Combat { encounter_hint: Some(format!("{difficulty} encounter, {count} foes")) }
        }
        "treasure" => {
            let kind = ["gold", "item", "magic_item"][rng.gen_range(0..3)];
            let value = rng.gen_range(50..=300);
            EventData::Treasure { loot_hint: Some(format!("{kind} worth about {value}")) }
        }
        "trap" => {
            let trap_type = ["damage", "debuff", "teleport"][rng.gen_range(0..3)];
            let mut trap = TrapData {
                trap_type: trap_type.to_string(),
                trap_name: "Generated trap".to_string(),
                trap_description: String::new(),
                detect_dc: rng.gen_range(12..=18),
                disarm_dc: rng.gen_range(15..=20),
                save_dc: rng.gen_range(12..=16),
                damage: Some(rng.gen_range(6..=24)),
                damage_type: Some("physical".to_string()),
                save_half_damage: false,
                debuff_type: None,
                debuff_duration: None,
                teleport_range: None,
                alarm_radius: None,
                summon_monsters: false,
                restraint_dc: None,
                restraint_duration: None,
                is_detected: false,
                is_disarmed: false,
                is_triggered: false,
            };
            trap.validate_and_normalize();
            EventData::Trap(trap)
        }
        "mystery" => {
            let kind = ["puzzle", "riddle", "choice"][rng.gen_range(0..3)];
            EventData::Mystery { flavor: Some(kind.to_string()) }
        }
        _ => {
            let kind = ["discovery", "memory", "vision", "encounter"][rng.gen_range(0..4)];
            EventData::Story { narrative_hint: Some(kind.to_string()) }
        }
    }
}

fn is_walkable_for_pathing(tile: Option<&MapTile>) -> bool {
    tile.map(|t| t.terrain.is_walkable()).unwrap_or(false)
}

fn collect_reachable(map: &GameMap, start: TileCoord) -> HashSet<String> {
    if !is_walkable_for_pathing(map.get_tile(start)) {
        return HashSet::new();
    }
    map.reachable_from(start)
}

fn get_key_targets(map: &GameMap, stairs: &Stairs) -> Vec<TileCoord> {
    let mut targets = Vec::new();
    if let Some(up) = stairs.up {
        targets.push(up);
    }
    if let Some(down) = stairs.down {
        targets.push(down);
    }

    for tile in map.tiles.values() {
        if !tile.has_event {
            continue;
        }
        let is_mandatory = match &tile.event_data {
            Some(EventData::Custom(v)) => v.get("is_mandatory").and_then(|v| v.as_bool()).unwrap_or(false),
            _ => false,
        };
        if is_mandatory {
            targets.push(tile.coord());
        }
    }

    let mut seen = HashSet::new();
    targets.retain(|t| seen.insert(t.key()));
    targets
}

/// Carves an L-shaped corridor from the nearest reachable tile to each
/// unreachable key target. Never carves through a stairs tile: if the
/// target itself is stairs, routes to an adjacent non-stairs neighbor
/// instead.
fn repair_unreachable_targets(map: &mut GameMap, reachable: &mut HashSet<String>, targets: &[TileCoord]) -> u64 {
    let mut repaired = 0u64;
    if reachable.is_empty() {
        return repaired;
    }

    for &target in targets {
        if reachable.contains(&target.key()) {
            continue;
        }

        let mut best: Option<TileCoord> = None;
        let mut best_dist = i32::MAX;
        for key in reachable.iter() {
            let Some(src) = TileCoord::parse_key(key) else { continue };
            let dist = (target.x - src.x).abs() + (target.y - src.y).abs();
            if dist < best_dist {
                best_dist = dist;
                best = Some(src);
            }
        }
        let Some(src) = best else { continue };

        let mut end = target;
        if map.get_tile(target).map(|t| matches!(t.terrain, Terrain::StairsUp | Terrain::StairsDown)).unwrap_or(false) {
            let mut neighbor_candidates: Vec<TileCoord> = neighbors4(target)
                .into_iter()
                .filter(|n| {
                    map.get_tile(*n)
                        .map(|t| !matches!(t.terrain, Terrain::StairsUp | Terrain::StairsDown))
                        .unwrap_or(false)
                })
                .collect();
            neighbor_candidates.sort_by_key(|n| (n.x - src.x).abs() + (n.y - src.y).abs());
            if let Some(first) = neighbor_candidates.into_iter().next() {
                end = first;
            }
        }

        carve_corridor(map, src.x, src.y, end.x, src.y);
        carve_corridor(map, end.x, src.y, end.x, end.y);
        repaired += 1;
        reachable.extend(collect_reachable(map, src));
    }

    repaired
}

fn validate_and_repair_map(
    map: &mut GameMap,
    rooms: &[Room],
    stairs: &Stairs,
    quest_context: Option<&QuestGenerationContext>,
    depth: i32,
) -> serde_json::Value {
    if rooms.is_empty() {
        return serde_json::json!({"connectivity_ok": false, "warnings": ["rooms_empty"]});
    }

    let start = stairs.up.unwrap_or_else(|| rooms[0].center());
    let mut reachable = collect_reachable(map, start);
    let targets = get_key_targets(map, stairs);

    let unreachable_before = targets.iter().filter(|t| !reachable.contains(&t.key())).count();
    let repaired = if unreachable_before > 0 {
        let unreachable_targets: Vec<TileCoord> = targets.iter().filter(|t| !reachable.contains(&t.key())).copied().collect();
        let n = repair_unreachable_targets(map, &mut reachable, &unreachable_targets);
        reachable = collect_reachable(map, start);
        n
    } else {
        0
    };

    let unreachable_after = targets.iter().filter(|t| !reachable.contains(&t.key())).count();
    let mut warnings: Vec<String> = Vec::new();

    let walkable = map.tiles.values().filter(|t| t.terrain.is_walkable()).count();
    let min_walkable = ((map.width * map.height) as f64 * 0.15).max(20.0) as usize;
    if walkable < min_walkable {
        warnings.push("walkable_area_low".to_string());
    }

    let mut report = serde_json::json!({
        "connectivity_ok": unreachable_after == 0,
        "repaired_targets": repaired,
        "unreachable_targets_before": unreachable_before,
        "unreachable_targets_after": unreachable_after,
        "required_target_count": targets.len(),
        "walkable_tiles": walkable,
        "warnings": warnings,
    });

    if let Some(ctx) = quest_context {
        let mandatory_total = ctx.special_events.iter().filter(|e| matches_depth_hint(e.location_hint, depth) && e.is_mandatory).count();
        let placed_mandatory = map
            .tiles
            .values()
            .filter(|t| t.has_event)
            .filter(|t| matches!(&t.event_data, Some(EventData::Custom(v)) if v.get("is_mandatory").and_then(|v| v.as_bool()).unwrap_or(false)))
            .count();
        report["mandatory_events_expected"] = serde_json::json!(mandatory_total);
        report["mandatory_events_placed"] = serde_json::json!(placed_mandatory);
        if mandatory_total > placed_mandatory {
            report["warnings"].as_array_mut().unwrap().push(serde_json::json!("mandatory_events_partially_placed"));
        }
    }

    report
}

fn build_monster_hints<R: Rng + ?Sized>(
    rng: &mut R,
    map: &GameMap,
    rooms: &[Room],
    quest_context: Option<&QuestGenerationContext>,
    max_quest_floors: i32,
    monster_hints_enabled: bool,
) -> serde_json::Value {
    let quest_type = quest_context.map(|c| c.quest_type.as_str()).filter(|s| !s.is_empty()).unwrap_or("exploration");
    let difficulty = match quest_type {
        "boss_fight" => "hard",
        "rescue" => "medium",
        "investigation" => "normal",
        _ => "medium",
    };

    let mut normal_candidates = Vec::new();
    let mut boss_candidates = Vec::new();
    let mut special_candidates = Vec::new();
    for tile in map.tiles.values() {
        if !tile.terrain.is_walkable() || matches!(tile.terrain, Terrain::StairsUp | Terrain::StairsDown) {
            continue;
        }
        match tile.room_type.as_deref() {
            Some("boss") => boss_candidates.push(tile.coord()),
            Some("special") => special_candidates.push(tile.coord()),
            _ => normal_candidates.push(tile.coord()),
        }
    }
    normal_candidates.shuffle(rng);
    boss_candidates.shuffle(rng);
    special_candidates.shuffle(rng);

    let depth = map.depth.max(1);
    let mut encounter_count = (rooms.len() as i32 / 2).clamp(1, 8);
    let mut boss_count = if depth >= max_quest_floors { 1 } else { 0 };
    if quest_type == "boss_fight" {
        boss_count = boss_count.max(1);
        encounter_count = (encounter_count + 1).min(8);
    }

    let mut spawn_points = Vec::new();
    for _ in 0..encounter_count {
        let coord = normal_candidates.pop().or_else(|| special_candidates.pop()).or_else(|| boss_candidates.pop());
        let Some(coord) = coord else { break };
        spawn_points.push(serde_json::json!({"x": coord.x, "y": coord.y, "role": "encounter"}));
    }
    for _ in 0..boss_count {
        let coord = boss_candidates.pop().or_else(|| special_candidates.pop()).or_else(|| normal_candidates.pop());
        let Some(coord) = coord else { break };
        spawn_points.push(serde_json::json!({"x": coord.x, "y": coord.y, "role": "boss"}));
    }

    let room_intents: Vec<serde_json::Value> = rooms
        .iter()
        .map(|room| match room.room_type.as_str() {
            "boss" => serde_json::json!({"id": room.label(), "role": "boss", "event_intents": [], "monster_intents": {"difficulty": "boss", "count": boss_count.max(1)}}),
            "special" => serde_json::json!({"id": room.label(), "role": "special", "event_intents": ["story", "mystery"], "monster_intents": {}}),
            "treasure" => serde_json::json!({"id": room.label(), "role": "treasure", "event_intents": ["treasure"], "monster_intents": {}}),
            other => serde_json::json!({"id": room.label(), "role": other, "event_intents": [], "monster_intents": {"difficulty": difficulty, "count": 1}}),
        })
        .collect();

    let mut hint = serde_json::json!({
        "source": "local_map_provider",
        "spawn_strategy": "llm_generate_by_positions",
        "recommended_player_level": (1 + depth * 2).clamp(1, 30),
        "encounter_difficulty": difficulty,
        "encounter_count": encounter_count,
        "boss_count": boss_count,
        "spawn_points": spawn_points,
        "llm_context": {
            "quest_type": quest_type,
            "map_title": map.name,
            "map_depth": depth,
            "floor_theme": map.floor_theme,
            "width": map.width,
            "height": map.height,
            "blueprint_mode": false,
        },
        "room_intents": room_intents,
        "corridor_intents": [],
    });

    if !monster_hints_enabled {
        hint["spawn_points"] = serde_json::json!([]);
    }

    hint
}
