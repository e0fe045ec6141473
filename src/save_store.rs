//! Per-user save-file persistence. Grounded on
//! `original_source/user_session_manager.py` (`UserSessionManager`'s
//! save/list/load/delete/import/export methods and user-metadata file) for
//! the directory layout and JSON shape, and on the teacher's
//! `src/storage_io.rs` for the atomic-write idiom — kept, with compression
//! dropped per [[DESIGN.md]] since save payloads here are small per-session
//! JSON rather than bulk simulation archives.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use crate::error::EngineError;
use crate::model::state::GameState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSummary {
    pub id: String,
    pub player_name: String,
    pub player_level: i32,
    pub map_name: String,
    pub turn_count: u64,
    pub created_at: String,
    pub last_saved: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMetadata {
    pub user_id: String,
    pub created_at: String,
    pub last_access: String,
}

pub struct SaveStore {
    saves_dir: PathBuf,
}

impl SaveStore {
    pub fn new(saves_dir: impl Into<PathBuf>) -> Self {
        Self { saves_dir: saves_dir.into() }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.saves_dir.join(user_id)
    }

    fn save_path(&self, user_id: &str, save_id: &str) -> PathBuf {
        self.user_dir(user_id).join(format!("{save_id}.json"))
    }

    fn metadata_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("user_metadata.json")
    }

    /// Creates the user's save directory and refreshes `user_metadata.json`,
    /// preserving `created_at` across calls the way the original does.
    pub async fn ensure_user(&self, user_id: &str) -> Result<(), EngineError> {
        let dir = self.user_dir(user_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::SaveIoFailed(format!("create user dir {dir:?}: {e}")))?;

        let metadata_path = self.metadata_path(user_id);
        let now = chrono::Utc::now().to_rfc3339();
        let mut metadata = match fs::read(&metadata_path).await {
            Ok(bytes) => serde_json::from_slice::<UserMetadata>(&bytes)
                .unwrap_or_else(|_| UserMetadata { user_id: user_id.to_string(), created_at: now.clone(), last_access: now.clone() }),
            Err(_) => UserMetadata { user_id: user_id.to_string(), created_at: now.clone(), last_access: now.clone() },
        };
        metadata.last_access = now;
        self.write_atomic(&metadata_path, &serde_json::to_vec_pretty(&metadata).unwrap()).await
    }

    /// Writes `bytes` to `path` via a temp-file-then-rename, so a crash
    /// mid-write never leaves a half-written save on disk.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| EngineError::SaveIoFailed(format!("write {tmp_path:?}: {e}")))?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| EngineError::SaveIoFailed(format!("rename {tmp_path:?} -> {path:?}: {e}")))
    }

    pub async fn save_game(&self, user_id: &str, state: &GameState) -> Result<(), EngineError> {
        self.ensure_user(user_id).await?;
        let path = self.save_path(user_id, &state.id);
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| EngineError::SaveDataInvalid(format!("serialize game state: {e}")))?;
        self.write_atomic(&path, &bytes).await?;
        log::info!("game saved for user {user_id}: {path:?}");
        Ok(())
    }

    pub async fn load_game(&self, user_id: &str, save_id: &str) -> Result<GameState, EngineError> {
        let path = self.save_path(user_id, save_id);
        let bytes = fs::read(&path)
            .await
            .map_err(|_| EngineError::SaveNotFound(format!("{user_id}/{save_id}")))?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::SaveDataInvalid(format!("deserialize {path:?}: {e}")))
    }

    pub async fn delete_save(&self, user_id: &str, save_id: &str) -> Result<bool, EngineError> {
        let path = self.save_path(user_id, save_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::SaveIoFailed(format!("delete {path:?}: {e}"))),
        }
    }

    /// Lists every save for `user_id`, newest `last_saved` first.
    pub async fn list_saves(&self, user_id: &str) -> Result<Vec<SaveSummary>, EngineError> {
        let dir = self.user_dir(user_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::SaveIoFailed(format!("read dir {dir:?}: {e}"))),
        };

        let mut saves = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| EngineError::SaveIoFailed(e.to_string()))? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if path.extension().and_then(|e| e.to_str()) != Some("json") || stem == "user_metadata" {
                continue;
            }
            let Ok(bytes) = fs::read(&path).await else { continue };
            let Ok(value) = serde_json::from_slice::<Value>(&bytes) else { continue };
            let file_size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            saves.push(summarize(stem, &value, file_size));
        }
        saves.sort_by(|a, b| b.last_saved.cmp(&a.last_saved));
        Ok(saves)
    }

    pub async fn export_save(&self, user_id: &str, save_id: &str) -> Result<Value, EngineError> {
        let path = self.save_path(user_id, save_id);
        let bytes = fs::read(&path).await.map_err(|_| EngineError::SaveNotFound(format!("{user_id}/{save_id}")))?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::SaveDataInvalid(e.to_string()))
    }

    /// Imports save data under a freshly generated id, recording the import
    /// provenance fields the original tags imports with.
    pub async fn import_save(&self, user_id: &str, mut save_data: Value) -> Result<String, EngineError> {
        if save_data.get("player").is_none() || save_data.get("current_map").is_none() {
            return Err(EngineError::SaveDataInvalid("missing player or current_map".to_string()));
        }
        let original_id = save_data.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());
        let new_id = uuid::Uuid::new_v4().to_string();
        if let Some(obj) = save_data.as_object_mut() {
            obj.insert("id".to_string(), Value::String(new_id.clone()));
            obj.insert("imported_at".to_string(), Value::String(chrono::Utc::now().to_rfc3339()));
            if let Some(original_id) = original_id {
                obj.insert("original_id".to_string(), Value::String(original_id));
            }
        }
        self.ensure_user(user_id).await?;
        let path = self.save_path(user_id, &new_id);
        let bytes = serde_json::to_vec_pretty(&save_data).map_err(|e| EngineError::SaveDataInvalid(e.to_string()))?;
        self.write_atomic(&path, &bytes).await?;
        Ok(new_id)
    }
}

fn summarize(stem: &str, value: &Value, file_size: u64) -> SaveSummary {
    let player = value.get("player").and_then(|p| p.get("Player")).or_else(|| value.get("player"));
    let stats = player.and_then(|p| p.get("core")).and_then(|c| c.get("stats"));
    SaveSummary {
        id: value.get("id").and_then(|v| v.as_str()).unwrap_or(stem).to_string(),
        player_name: player
            .and_then(|p| p.get("core"))
            .and_then(|c| c.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string(),
        player_level: stats.and_then(|s| s.get("level")).and_then(|v| v.as_i64()).unwrap_or(1) as i32,
        map_name: value
            .get("current_map")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string(),
        turn_count: value.get("turn_count").and_then(|v| v.as_u64()).unwrap_or(0),
        created_at: value.get("created_at").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        last_saved: value.get("last_saved").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        file_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Abilities, AcComponents, CombatRuntime, Entity, EntityCore, PlayerEntity, Position, Stats};
    use crate::model::map::{GameMap, GenerationMetadata};
    use chrono::Utc;
    use std::collections::{HashMap as StdHashMap, HashSet};

    fn sample_state(id: &str) -> GameState {
        GameState {
            id: id.to_string(),
            player: Entity::Player(PlayerEntity {
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
            }),
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
            turn_count: 3,
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

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("labyrinthia_save_test_{}", uuid::Uuid::new_v4()));
        let store = SaveStore::new(&dir);
        let state = sample_state("game-1");
        store.save_game("user-1", &state).await.unwrap();
        let loaded = store.load_game("user-1", "game-1").await.unwrap();
        assert_eq!(loaded.id, "game-1");
        assert_eq!(loaded.turn_count, 3);
        fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn load_missing_save_reports_not_found() {
        let dir = std::env::temp_dir().join(format!("labyrinthia_save_test_{}", uuid::Uuid::new_v4()));
        let store = SaveStore::new(&dir);
        let err = store.load_game("user-1", "nope").await.unwrap_err();
        assert_eq!(err.code(), "SAVE_NOT_FOUND");
    }

    #[tokio::test]
    async fn delete_then_list_reflects_removal() {
        let dir = std::env::temp_dir().join(format!("labyrinthia_save_test_{}", uuid::Uuid::new_v4()));
        let store = SaveStore::new(&dir);
        store.save_game("user-1", &sample_state("game-1")).await.unwrap();
        let saves = store.list_saves("user-1").await.unwrap();
        assert_eq!(saves.len(), 1);
        let deleted = store.delete_save("user-1", "game-1").await.unwrap();
        assert!(deleted);
        let saves = store.list_saves("user-1").await.unwrap();
        assert!(saves.is_empty());
        fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn import_assigns_fresh_id_and_tracks_original() {
        let dir = std::env::temp_dir().join(format!("labyrinthia_save_test_{}", uuid::Uuid::new_v4()));
        let store = SaveStore::new(&dir);
        let payload = serde_json::to_value(sample_state("old-id")).unwrap();
        let new_id = store.import_save("user-1", payload).await.unwrap();
        assert_ne!(new_id, "old-id");
        let loaded = store.load_game("user-1", &new_id).await.unwrap();
        assert_eq!(loaded.id, new_id);
        fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn import_rejects_missing_required_fields() {
        let dir = std::env::temp_dir().join(format!("labyrinthia_save_test_{}", uuid::Uuid::new_v4()));
        let store = SaveStore::new(&dir);
        let err = store.import_save("user-1", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.code(), "SAVE_DATA_INVALID");
    }
}
