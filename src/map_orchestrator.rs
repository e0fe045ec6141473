//! Release-stage routing between the `legacy` (local procedural) and
//! `contract_v2` (LLM-driven, contract-shaped) map-generation chains, with
//! fallback/rollback bookkeeping and alert-threshold checks. Grounded on the
//! spec's MapOrchestrator section (no direct `original_source` file covers
//! this component); chain selection and the counters it updates follow
//! `config::MapGenerationConfig` and `model::state::MapGenerationCounters`
//! field-for-field, and contract handling reuses `contract.rs`.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::{MapGenerationConfig, ReleaseStage};
use crate::contract::resolve_generation_contract;
use crate::llm_client::LlmClient;
use crate::map_provider::{LocalMapProvider, QuestGenerationContext};
use crate::model::map::{GameMap, Terrain};
use crate::model::state::MapGenerationCounters;

/// `sha256("{seed}:{userId}:{source}")`, first 8 hex chars read as a u64,
/// `mod 100`. Grounded on spec §4.8 step 1.
pub fn stable_bucket(seed: &str, user_id: &str, source: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{seed}:{user_id}:{source}").as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    let value = u64::from_str_radix(&hex, 16).unwrap_or(0);
    (value % 100) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Legacy,
    ContractV2,
}

#[derive(Debug, Clone)]
pub struct MapGenerationRequest {
    pub width: i32,
    pub height: i32,
    pub depth: i32,
    pub theme: String,
    pub quest_context: Option<QuestGenerationContext>,
    pub max_quest_floors: i32,
    pub monster_hints_enabled: bool,
    pub seed: String,
    pub user_id: String,
    pub source: String,
    pub provided_contract: Option<serde_json::Value>,
    pub requested_contract_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MapGenerationOutcome {
    pub map: GameMap,
    pub chain_used: Chain,
    pub fallback_used: bool,
    pub rollback_used: bool,
    pub local_validation: serde_json::Value,
}

pub struct MapOrchestrator {
    local_provider: LocalMapProvider,
    llm_client: Arc<dyn LlmClient>,
}

impl MapOrchestrator {
    pub fn new(llm_client: Arc<dyn LlmClient>) -> Self {
        Self { local_provider: LocalMapProvider, llm_client }
    }

    /// Whether any alert rate has crossed its `_block` threshold, forcing
    /// legacy regardless of release stage. Rates are computed against the
    /// counters accumulated so far (spec §4.8 step 3).
    fn has_blocking_p1(&self, counters: &MapGenerationCounters, config: &MapGenerationConfig) -> bool {
        if !config.map_alert_blocking_enabled || counters.total == 0 {
            return false;
        }
        let total = counters.total as f64;
        let unreachable_rate = counters.unreachable_reports as f64 / total;
        let stairs_rate = counters.stairs_violations as f64 / total;
        unreachable_rate >= config.key_objective_unreachable_rate_block
            || stairs_rate >= config.stairs_violation_rate_block
    }

    fn select_chain(&self, request: &MapGenerationRequest, config: &MapGenerationConfig, counters: &MapGenerationCounters) -> Chain {
        if self.has_blocking_p1(counters, config) {
            return Chain::Legacy;
        }
        if config.force_legacy_chain {
            return Chain::Legacy;
        }
        match config.release_stage {
            ReleaseStage::Debug | ReleaseStage::Stable => Chain::ContractV2,
            ReleaseStage::Canary => {
                let bucket = stable_bucket(&request.seed, &request.user_id, &request.source);
                if bucket < config.canary_percent {
                    Chain::ContractV2
                } else {
                    Chain::Legacy
                }
            }
        }
    }

    fn run_legacy(&self, request: &MapGenerationRequest) -> (GameMap, serde_json::Value) {
        let (mut map, local_validation) = self.local_provider.generate_map(
            request.width,
            request.height,
            request.depth,
            &request.theme,
            request.quest_context.as_ref(),
            request.max_quest_floors,
            request.monster_hints_enabled,
        );
        map.generation_metadata.provider = Some("local_map_provider".to_string());
        (map, local_validation)
    }

    /// Attempts the LLM-driven chain: resolves the contract, asks the LLM
    /// client for a JSON map payload, and deserializes it into a `GameMap`.
    /// Any failure along the way (LLM error, malformed JSON, shape mismatch)
    /// is reported as `None` so the caller can roll back to legacy.
    async fn run_contract_v2(&self, request: &MapGenerationRequest) -> Option<(GameMap, String)> {
        let resolution = resolve_generation_contract(
            request.provided_contract.as_ref(),
            request.requested_contract_version.as_deref(),
            Some(request.source.as_str()),
        );
        let prompt = format!(
            "generate_map depth={} width={} height={} theme={} contract={}",
            request.depth, request.width, request.height, request.theme, resolution.contract
        );
        let value = self.llm_client.generate_json(&prompt).await.ok()?;
        let mut map: GameMap = serde_json::from_value(value).ok()?;
        map.generation_metadata.provider = Some("contract_v2".to_string());
        Some((map, request.depth.to_string()))
    }

    /// Expected stairs per spec §4.9 step 4: up at the entrance iff
    /// `depth > 1`, down at the boss/final room iff `depth < max_quest_floors`.
    fn stairs_violation(map: &GameMap, max_quest_floors: i32) -> bool {
        let has_up = map.tiles.values().any(|t| t.terrain == Terrain::StairsUp);
        let has_down = map.tiles.values().any(|t| t.terrain == Terrain::StairsDown);
        let needs_up = map.depth > 1;
        let needs_down = map.depth < max_quest_floors;
        (needs_up && !has_up) || (needs_down && !has_down)
    }

    fn record_error(counters: &mut MapGenerationCounters, code: &str) {
        *counters.per_error_code.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Runs the selected chain, recording every counter spec §4.8 names.
    pub async fn generate_map(
        &self,
        request: MapGenerationRequest,
        config: &MapGenerationConfig,
        counters: &mut MapGenerationCounters,
    ) -> MapGenerationOutcome {
        counters.total += 1;
        let selected = self.select_chain(&request, config, counters);
        *counters.per_stage.entry(format!("{:?}", config.release_stage).to_lowercase()).or_insert(0) += 1;

        let (map, local_validation, chain_used, fallback_used, rollback_used) = match selected {
            Chain::Legacy => {
                let (map, report) = self.run_legacy(&request);
                (map, report, Chain::Legacy, false, false)
            }
            Chain::ContractV2 => match self.run_contract_v2(&request).await {
                Some((map, _)) => (map, serde_json::Value::Null, Chain::ContractV2, false, false),
                None => {
                    log::warn!("contract_v2 map generation failed, rolling back to local provider");
                    Self::record_error(counters, "contract_v2_unavailable");
                    let (map, report) = self.run_legacy(&request);
                    (map, report, Chain::Legacy, false, true)
                }
            },
        };

        let resolution = resolve_generation_contract(
            request.provided_contract.as_ref(),
            request.requested_contract_version.as_deref(),
            Some(request.source.as_str()),
        );
        let mut map = map;
        map.generation_metadata.contract_hash = Some(crate::contract::contract_hash(&resolution.contract));

        *counters.per_provider.entry(map.generation_metadata.provider.clone().unwrap_or_default()).or_insert(0) += 1;
        if fallback_used {
            counters.fallback_used += 1;
        }
        if rollback_used {
            counters.rollback_used += 1;
        }
        if Self::stairs_violation(&map, request.max_quest_floors) {
            counters.stairs_violations += 1;
        }
        if let Some(connectivity_ok) = local_validation.get("connectivity_ok").and_then(|v| v.as_bool()) {
            if !connectivity_ok {
                counters.unreachable_reports += 1;
            }
        }
        if let Some(repaired) = local_validation.get("repaired_targets").and_then(|v| v.as_u64()) {
            counters.repairs += repaired;
        }
        counters.success += 1;

        MapGenerationOutcome { map, chain_used, fallback_used, rollback_used, local_validation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::NullLlmClient;

    fn request(seed: &str) -> MapGenerationRequest {
        MapGenerationRequest {
            width: 12,
            height: 12,
            depth: 1,
            theme: "normal".to_string(),
            quest_context: None,
            max_quest_floors: 10,
            monster_hints_enabled: true,
            seed: seed.to_string(),
            user_id: "user-1".to_string(),
            source: "new_game".to_string(),
            provided_contract: None,
            requested_contract_version: None,
        }
    }

    #[test]
    fn stable_bucket_is_deterministic_for_same_inputs() {
        let a = stable_bucket("seed-1", "user-1", "new_game");
        let b = stable_bucket("seed-1", "user-1", "new_game");
        assert_eq!(a, b);
        assert!(a < 100);
    }

    #[tokio::test]
    async fn force_legacy_chain_always_uses_local_provider() {
        let orchestrator = MapOrchestrator::new(Arc::new(NullLlmClient));
        let config = MapGenerationConfig { force_legacy_chain: true, ..MapGenerationConfig::default() };
        let mut counters = MapGenerationCounters::default();
        let outcome = orchestrator.generate_map(request("s1"), &config, &mut counters).await;
        assert_eq!(outcome.chain_used, Chain::Legacy);
        assert!(!outcome.rollback_used);
        assert_eq!(counters.total, 1);
        assert_eq!(counters.success, 1);
        assert!(outcome.map.generation_metadata.contract_hash.is_some());
    }

    #[tokio::test]
    async fn stable_release_stage_rolls_back_to_legacy_when_llm_unavailable() {
        let orchestrator = MapOrchestrator::new(Arc::new(NullLlmClient));
        let config = MapGenerationConfig {
            force_legacy_chain: false,
            release_stage: ReleaseStage::Stable,
            ..MapGenerationConfig::default()
        };
        let mut counters = MapGenerationCounters::default();
        let outcome = orchestrator.generate_map(request("s2"), &config, &mut counters).await;
        assert_eq!(outcome.chain_used, Chain::Legacy);
        assert!(outcome.rollback_used);
        assert_eq!(counters.rollback_used, 1);
        assert_eq!(counters.per_error_code["contract_v2_unavailable"], 1);
    }

    #[tokio::test]
    async fn canary_bucket_above_percent_stays_legacy() {
        let orchestrator = MapOrchestrator::new(Arc::new(NullLlmClient));
        let config = MapGenerationConfig {
            force_legacy_chain: false,
            release_stage: ReleaseStage::Canary,
            canary_percent: 0,
            ..MapGenerationConfig::default()
        };
        let mut counters = MapGenerationCounters::default();
        let outcome = orchestrator.generate_map(request("s3"), &config, &mut counters).await;
        assert_eq!(outcome.chain_used, Chain::Legacy);
        assert!(!outcome.rollback_used);
    }

    #[tokio::test]
    async fn blocking_p1_forces_legacy_even_off_force_flag() {
        let orchestrator = MapOrchestrator::new(Arc::new(NullLlmClient));
        let config = MapGenerationConfig {
            force_legacy_chain: false,
            release_stage: ReleaseStage::Stable,
            map_alert_blocking_enabled: true,
            key_objective_unreachable_rate_block: 0.5,
            ..MapGenerationConfig::default()
        };
        let mut counters = MapGenerationCounters { total: 10, unreachable_reports: 8, ..Default::default() };
        let outcome = orchestrator.generate_map(request("s4"), &config, &mut counters).await;
        assert_eq!(outcome.chain_used, Chain::Legacy);
    }
}
