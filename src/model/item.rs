//! Item model. `effect_payload` is intrinsically schema-loose (LLM-authored
//! or locally templated); it is kept as a validated JSON value rather than a
//! fixed struct, per the re-architecture guidance on dynamic dicts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintLevel {
    None,
    Vague,
    Clear,
}

impl Default for HintLevel {
    fn default() -> Self {
        HintLevel::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipRequirements {
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub abilities: HashMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipPassiveEffect {
    pub key: String,
    pub value: f64,
    #[serde(default)]
    pub stage_order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affix {
    pub name: String,
    pub key: String,
    pub value: f64,
    #[serde(default)]
    pub stage_order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub item_type: String,
    #[serde(default)]
    pub rarity: String,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub is_equippable: bool,
    #[serde(default)]
    pub equip_slot: Option<String>,
    /// Items that share a `unique_key` are mutually exclusive across slots.
    #[serde(default)]
    pub unique_key: Option<String>,
    #[serde(default)]
    pub equip_requirements: Option<EquipRequirements>,
    #[serde(default)]
    pub equip_passive_effects: Vec<EquipPassiveEffect>,
    #[serde(default)]
    pub affixes: Vec<Affix>,
    #[serde(default)]
    pub set_id: Option<String>,
    #[serde(default)]
    pub set_thresholds: HashMap<u32, String>,
    #[serde(default)]
    pub max_charges: Option<i32>,
    #[serde(default)]
    pub charges: Option<i32>,
    #[serde(default)]
    pub cooldown_turns: i32,
    #[serde(default)]
    pub current_cooldown: i32,
    #[serde(default)]
    pub effect_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub is_quest_item: bool,
    #[serde(default)]
    pub quest_lock_reason: Option<String>,
    #[serde(default)]
    pub hint_level: HintLevel,
    #[serde(default)]
    pub trigger_hint: Option<String>,
    #[serde(default)]
    pub risk_hint: Option<String>,
    #[serde(default)]
    pub expected_outcomes: Vec<String>,
    #[serde(default)]
    pub requires_use_confirmation: bool,
}

impl Item {
    pub fn is_on_cooldown(&self) -> bool {
        self.current_cooldown > 0
    }

    pub fn has_charges(&self) -> bool {
        match self.charges {
            Some(c) => c > 0,
            None => true,
        }
    }

    pub fn consume_charge(&mut self) {
        if let Some(c) = self.charges.as_mut() {
            *c = (*c - 1).max(0);
        }
        self.current_cooldown = self.cooldown_turns;
    }

    pub fn tick_cooldown(&mut self) {
        if self.current_cooldown > 0 {
            self.current_cooldown -= 1;
        }
    }
}
