//! Generation-contract resolution and hashing. Grounded in full on
//! `original_source/generation_contract.py`: version, default contract,
//! deep-merge resolution, and a stable sha256 hash for cache/telemetry keys.

use sha2::{Digest, Sha256};

pub const CONTRACT_VERSION: &str = "2.0.0";

/// The contract is intentionally left as a loosely-typed JSON tree (mirroring
/// the original's plain dict) since its `blueprint`/`safety`/`progress`/
/// `map_updates` sections are consumed by several components that each read
/// only the keys they care about.
pub fn default_generation_contract() -> serde_json::Value {
    serde_json::json!({
        "contract_version": CONTRACT_VERSION,
        "blueprint": {
            "schema_version": "v2",
            "max_nodes": 32,
            "max_edges": 96,
            "max_intents_per_item": 8,
            "allow_absolute_coordinates": false,
            "room_size_whitelist": ["small", "medium", "large"],
            "placement_policy_whitelist": ["center", "edge", "branch", "corridor_adjacent"],
            "event_policy_whitelist": ["mandatory", "optional", "forbidden"],
            "corridor_kind_whitelist": ["direct", "branch", "loop"],
            "corridor_gate_whitelist": ["none", "locked", "key", "boss_gate"],
            "corridor_risk_whitelist": ["low", "medium", "high", "deadly"],
        },
        "safety": {
            "trap_density_cap": 0.35,
            "enforce_connectivity": true,
            "enforce_key_path": true,
            "enforce_stair_legality": true,
            "require_entrance": true,
            "require_objective_or_boss": true,
            "max_room_must_contain": 8,
            "max_quest_bindings": 64,
        },
        "progress": {
            "max_single_increment_except_final": 25.0,
            "min_progress_before_final_burst": 70.0,
            "completion_policy": "aggregate",
            "require_final_floor": false,
            "require_all_mandatory_events": false,
        },
        "map_updates": {
            "schema": "tiles_dict_v1",
            "allowed_root_keys": ["tiles"],
            "allowed_tile_fields": crate::state_modifier::StateModifier::ALLOWED_TILE_FIELDS,
        },
    })
}

/// Stable sha256 hash of the contract, computed over its sorted-key, compact
/// JSON encoding so semantically-identical contracts always hash equal.
pub fn contract_hash(contract: &serde_json::Value) -> String {
    let canonical = canonicalize(contract);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap(),
    }
}

fn deep_merge(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let new_value = match merged.get(key) {
                    Some(existing) if existing.is_object() && value.is_object() => deep_merge(existing, value),
                    _ => value.clone(),
                };
                merged.insert(key.clone(), new_value);
            }
            serde_json::Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

#[derive(Debug, Clone)]
pub struct ContractResolution {
    pub contract: serde_json::Value,
    pub source: String,
    pub warnings: Vec<String>,
}

/// Resolves a caller-provided contract fragment against the default, deep
/// merging and pinning `contract_version` to the current supported version.
/// An unsupported `requested_version` is recorded as a warning, not a
/// rejection: the resolved contract still applies.
pub fn resolve_generation_contract(
    provided_contract: Option<&serde_json::Value>,
    requested_version: Option<&str>,
    source_hint: Option<&str>,
) -> ContractResolution {
    let base = default_generation_contract();
    let mut warnings = Vec::new();
    let source = source_hint.unwrap_or("default").to_string();

    if let Some(version) = requested_version {
        let trimmed = version.trim();
        if trimmed != CONTRACT_VERSION && trimmed != "v2" && trimmed != "2" {
            warnings.push(format!("unsupported_contract_version:{version}"));
        }
    }

    let Some(provided) = provided_contract else {
        return ContractResolution { contract: base, source, warnings };
    };

    if !provided.is_object() {
        warnings.push("invalid_contract_type_fallback_default".to_string());
        log::warn!("generation contract is not an object, falling back to default");
        return ContractResolution { contract: base, source: "default".to_string(), warnings };
    }

    let mut merged = deep_merge(&base, provided);
    merged["contract_version"] = serde_json::Value::String(CONTRACT_VERSION.to_string());
    ContractResolution { contract: merged, source, warnings }
}

/// Pulls an inline `generation_contract`/`contract_version` out of an
/// arbitrary quest-context payload, classifying the source as `manual`
/// (explicit contract object), `llm` (version hint only), or `default`.
pub fn extract_contract_request(
    quest_context: Option<&serde_json::Value>,
) -> (Option<serde_json::Value>, Option<String>, String) {
    let Some(context) = quest_context.and_then(|v| v.as_object()) else {
        return (None, None, "default".to_string());
    };

    let provided = context.get("generation_contract").filter(|v| v.is_object()).cloned();
    let requested_version = context
        .get("contract_version")
        .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| Some(v.to_string())))
        .filter(|s| !s.is_empty());

    let source = if provided.is_some() {
        "manual"
    } else if requested_version.is_some() {
        "llm"
    } else {
        "default"
    };

    (provided, requested_version, source.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = serde_json::json!({"a": 1, "b": 2});
        let b = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(contract_hash(&a), contract_hash(&b));
    }

    #[test]
    fn resolve_merges_and_pins_version() {
        let provided = serde_json::json!({"safety": {"trap_density_cap": 0.1}});
        let resolution = resolve_generation_contract(Some(&provided), None, Some("manual"));
        assert_eq!(resolution.contract["contract_version"], CONTRACT_VERSION);
        assert_eq!(resolution.contract["safety"]["trap_density_cap"], 0.1);
        assert_eq!(resolution.contract["safety"]["enforce_connectivity"], true);
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn resolve_falls_back_on_non_object_contract() {
        let provided = serde_json::json!("not-an-object");
        let resolution = resolve_generation_contract(Some(&provided), None, Some("manual"));
        assert_eq!(resolution.source, "default");
        assert!(resolution.warnings.contains(&"invalid_contract_type_fallback_default".to_string()));
    }

    #[test]
    fn extract_contract_request_classifies_source() {
        let ctx = serde_json::json!({"contract_version": "2"});
        let (provided, version, source) = extract_contract_request(Some(&ctx));
        assert!(provided.is_none());
        assert_eq!(version.as_deref(), Some("2"));
        assert_eq!(source, "llm");
    }
}
