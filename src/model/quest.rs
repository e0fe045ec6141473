//! Quest model: objectives, progress budget/guard policy, and the
//! append-only progress ledger that backs the budget post-check.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    SingleTarget100,
    Aggregate,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialMonster {
    pub quest_monster_id: String,
    #[serde(default)]
    pub is_final_objective: bool,
    #[serde(default)]
    pub progress_value: f64,
    #[serde(default)]
    pub defeated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialEvent {
    pub event_id: String,
    #[serde(default)]
    pub is_mandatory: bool,
    #[serde(default)]
    pub progress_value: f64,
    #[serde(default)]
    pub location_hint: Option<i32>,
    #[serde(default)]
    pub triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressBudget {
    #[serde(default)]
    pub events: f64,
    #[serde(default)]
    pub quest_monsters: f64,
    #[serde(default)]
    pub map_transition: f64,
    #[serde(default)]
    pub exploration_buffer: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressBucket {
    Events,
    QuestMonsters,
    MapTransition,
    ExplorationBuffer,
}

impl ProgressBudget {
    pub fn get(&self, bucket: ProgressBucket) -> f64 {
        match bucket {
            ProgressBucket::Events => self.events,
            ProgressBucket::QuestMonsters => self.quest_monsters,
            ProgressBucket::MapTransition => self.map_transition,
            ProgressBucket::ExplorationBuffer => self.exploration_buffer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPlan {
    pub completion_policy: CompletionPolicy,
    #[serde(default)]
    pub budget: ProgressBudget,
    #[serde(default)]
    pub final_objective_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionGuard {
    #[serde(default)]
    pub require_final_floor: bool,
    #[serde(default)]
    pub require_all_mandatory_events: bool,
    #[serde(default = "default_min_progress_before_final_burst")]
    pub min_progress_before_final_burst: f64,
    #[serde(default = "default_max_single_increment_except_final")]
    pub max_single_increment_except_final: f64,
}

fn default_min_progress_before_final_burst() -> f64 {
    70.0
}
fn default_max_single_increment_except_final() -> f64 {
    25.0
}

impl Default for CompletionGuard {
    fn default() -> Self {
        Self {
            require_final_floor: false,
            require_all_mandatory_events: false,
            min_progress_before_final_burst: default_min_progress_before_final_burst(),
            max_single_increment_except_final: default_max_single_increment_except_final(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub bucket: ProgressBucket,
    pub increment: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub quest_type: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub progress_percentage: f64,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub completed_objectives: Vec<String>,
    #[serde(default)]
    pub special_monsters: Vec<SpecialMonster>,
    #[serde(default)]
    pub special_events: Vec<SpecialEvent>,
    #[serde(default)]
    pub target_floors: Vec<i32>,
    pub progress_plan: ProgressPlan,
    #[serde(default)]
    pub completion_guard: CompletionGuard,
    #[serde(default)]
    pub progress_ledger: Vec<LedgerEntry>,
    #[serde(default)]
    pub story_context: String,
    #[serde(default)]
    pub llm_notes: String,
    #[serde(default)]
    pub experience_reward: i64,
}

impl Quest {
    pub fn set_progress(&mut self, value: f64) {
        self.progress_percentage = value.clamp(0.0, 100.0);
    }

    pub fn ledger_sum(&self, bucket: ProgressBucket) -> f64 {
        self.progress_ledger
            .iter()
            .filter(|e| e.bucket == bucket)
            .map(|e| e.increment)
            .sum()
    }

    pub fn push_ledger(&mut self, bucket: ProgressBucket, increment: f64, reason: impl Into<String>) {
        self.progress_ledger.push(LedgerEntry {
            bucket,
            increment,
            reason: reason.into(),
        });
    }

    pub fn all_mandatory_events_triggered(&self) -> bool {
        self.special_events.iter().filter(|e| e.is_mandatory).all(|e| e.triggered)
    }

    pub fn final_objective_defeated(&self) -> bool {
        match &self.progress_plan.final_objective_id {
            Some(id) => self
                .special_monsters
                .iter()
                .any(|m| &m.quest_monster_id == id && m.defeated),
            None => false,
        }
    }
}
