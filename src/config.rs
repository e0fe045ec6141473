//! Nested, `Default`-derived configuration tree for the engine.
//!
//! Mirrors the teacher's `UserPreferences` nesting style (one struct per
//! concern, hand-written `Default` impls carrying literal defaults) rather
//! than a flat bag of fields. Values here are compile-time defaults; a host
//! binary may override individual fields from environment variables before
//! constructing `GameEngine`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub game: GameConfig,
    pub combat: CombatConfig,
    pub map_generation: MapGenerationConfig,
    pub progress: ProgressConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            game: GameConfig::default(),
            combat: CombatConfig::default(),
            map_generation: MapGenerationConfig::default(),
            progress: ProgressConfig::default(),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub max_quest_floors: u32,
    pub quest_progress_multiplier: f64,
    pub level_cap: u32,
    pub attack_range: i32,
    pub monster_chase_range: i32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            max_quest_floors: 10,
            quest_progress_multiplier: 1.0,
            level_cap: 100,
            attack_range: 1,
            monster_chase_range: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombatAuthorityMode {
    Local,
    Hybrid,
    Server,
}

impl Default for CombatAuthorityMode {
    fn default() -> Self {
        CombatAuthorityMode::Hybrid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatConfig {
    pub authority_mode: CombatAuthorityMode,
    pub diff_threshold: f64,
    pub critical_multiplier: f64,
    pub resistance_clamp_min: f64,
    pub resistance_clamp_max: f64,
    pub vulnerability_multiplier_min: f64,
    pub vulnerability_multiplier_max: f64,
    pub max_concurrent_llm_requests: usize,
    /// p95 latency (ms) above which the release gate degrades authority mode.
    pub latency_p95_degrade_ms: u64,
    /// Error-rate (0.0-1.0) above which the release gate degrades authority mode.
    pub error_rate_degrade: f64,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            authority_mode: CombatAuthorityMode::Hybrid,
            diff_threshold: 0.1,
            critical_multiplier: 1.5,
            resistance_clamp_min: 0.0,
            resistance_clamp_max: 1.0,
            vulnerability_multiplier_min: 1.0,
            vulnerability_multiplier_max: 3.0,
            max_concurrent_llm_requests: 4,
            latency_p95_degrade_ms: 2000,
            error_rate_degrade: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStage {
    Debug,
    Canary,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapGenerationConfig {
    pub provider: String,
    pub release_stage: ReleaseStage,
    pub canary_percent: u32,
    pub fallback_to_llm: bool,
    pub force_legacy_chain: bool,
    pub disable_high_risk_patch: bool,
    pub canary_seed: String,
    pub map_alert_blocking_enabled: bool,
    pub key_objective_unreachable_rate_warn: f64,
    pub key_objective_unreachable_rate_block: f64,
    pub stairs_violation_rate_warn: f64,
    pub stairs_violation_rate_block: f64,
    pub progress_anomaly_rate_warn: f64,
    pub progress_anomaly_rate_block: f64,
    pub final_objective_guard_block_rate_warn: f64,
    pub final_objective_guard_block_rate_block: f64,
}

impl Default for MapGenerationConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            release_stage: ReleaseStage::Stable,
            canary_percent: 0,
            fallback_to_llm: false,
            force_legacy_chain: true,
            disable_high_risk_patch: true,
            canary_seed: "default-canary".to_string(),
            map_alert_blocking_enabled: true,
            key_objective_unreachable_rate_warn: 0.02,
            key_objective_unreachable_rate_block: 0.05,
            stairs_violation_rate_warn: 0.01,
            stairs_violation_rate_block: 0.03,
            progress_anomaly_rate_warn: 0.05,
            progress_anomaly_rate_block: 0.1,
            final_objective_guard_block_rate_warn: 0.1,
            final_objective_guard_block_rate_block: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    pub max_single_increment_except_final: f64,
    pub min_progress_before_final_burst: f64,
    pub combat_victory_base: f64,
    pub story_event_base: f64,
    pub treasure_found_base: f64,
    pub exploration_bonus_cap: f64,
    pub mandatory_events_bonus_cap: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_single_increment_except_final: 25.0,
            min_progress_before_final_burst: 70.0,
            combat_victory_base: 5.0,
            story_event_base: 10.0,
            treasure_found_base: 2.0,
            exploration_bonus_cap: 10.0,
            mandatory_events_bonus_cap: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub saves_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            saves_dir: "saves/users".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub game_session_timeout_secs: u64,
    pub auto_save_interval_secs: u64,
    pub session_cleanup_interval_secs: u64,
    pub cookie_name: String,
    pub cookie_ttl_days: u32,
    pub idempotency_ttl_secs: u64,
    pub idempotency_cache_cap: usize,
    pub lock_wait_warning_ms: u64,
    pub idle_lock_cleanup_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            game_session_timeout_secs: 3600,
            auto_save_interval_secs: 60,
            session_cleanup_interval_secs: 600,
            cookie_name: "labyrinthia_user_id".to_string(),
            cookie_ttl_days: 30,
            idempotency_ttl_secs: 120,
            idempotency_cache_cap: 256,
            lock_wait_warning_ms: 100,
            idle_lock_cleanup_secs: 1800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.progress.max_single_increment_except_final, 25.0);
        assert_eq!(cfg.progress.min_progress_before_final_burst, 70.0);
        assert_eq!(cfg.session.idempotency_ttl_secs, 120);
        assert_eq!(cfg.session.idempotency_cache_cap, 256);
        assert_eq!(cfg.session.lock_wait_warning_ms, 100);
        assert_eq!(cfg.session.cookie_ttl_days, 30);
    }
}
