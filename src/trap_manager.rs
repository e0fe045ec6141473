//! Detect/disarm/avoid/trigger resolution for trap tiles. Trap data shape
//! and validation are grounded on `original_source/trap_schema.py`
//! (`TrapSchema`/`TrapDataValidator`, already implemented as
//! `model::map::TrapData::validate_and_normalize`); this module adds the
//! resolution flow spec §4.12 describes on top of it, dispatching damage
//! through `StateModifier` and debuffs/restraints through
//! `GameState.pending_effects` the way `monster_spawn`'s sanitized status
//! packs do. Narration is delegated to a small trait with a local fallback,
//! mirroring the `llm_client::LlmClient` boundary idiom.

use std::sync::Arc;

use rand::seq::IteratorRandom;
use rand::Rng;

use crate::model::entity::{Ability, Entity, Position};
use crate::model::map::TrapData;
use crate::model::state::{GameState, PendingEffect, StatusEffect};
use crate::roll_resolver::{self, AdvState};
use crate::state_modifier::StateModifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    Detected,
    NotDetected,
    Disarmed,
    DisarmFailed,
    Avoided,
    Triggered,
}

#[derive(Debug, Clone)]
pub struct TrapResolution {
    pub outcome: TrapOutcome,
    pub narration: String,
    pub damage_dealt: Option<i32>,
}

/// Trap flavor text is a generative collaborator concern in the original; a
/// real deployment might route it through an LLM the way `llm_client` does
/// for story/progress narration. This crate ships only the local fallback.
pub trait TrapNarrator: Send + Sync {
    fn narrate(&self, trap: &TrapData, outcome: TrapOutcome) -> Option<String>;
}

pub struct LocalTrapNarrator;

impl TrapNarrator for LocalTrapNarrator {
    fn narrate(&self, trap: &TrapData, outcome: TrapOutcome) -> Option<String> {
        let text = match outcome {
            TrapOutcome::Detected => format!("You notice a {}.", trap.trap_name),
            TrapOutcome::NotDetected => "You sense nothing out of the ordinary.".to_string(),
            TrapOutcome::Disarmed => format!("You disarm the {}.", trap.trap_name),
            TrapOutcome::DisarmFailed => format!("Your attempt to disarm the {} fails.", trap.trap_name),
            TrapOutcome::Avoided => format!("You carefully step around the {}.", trap.trap_name),
            TrapOutcome::Triggered => format!("The {} triggers! {}", trap.trap_name, trap.trap_description),
        };
        Some(text)
    }
}

pub struct TrapManager {
    narrator: Arc<dyn TrapNarrator>,
}

impl Default for TrapManager {
    fn default() -> Self {
        Self { narrator: Arc::new(LocalTrapNarrator) }
    }
}

impl TrapManager {
    pub fn new(narrator: Arc<dyn TrapNarrator>) -> Self {
        Self { narrator }
    }

    fn narrate(&self, trap: &TrapData, outcome: TrapOutcome) -> String {
        self.narrator.narrate(trap, outcome).unwrap_or_default()
    }

    /// Passive/active detect attempt against `detect_dc`. Flips
    /// `trap.is_detected` on success; the caller is responsible for mirroring
    /// that onto `MapTile.trap_detected`.
    pub fn detect(&self, trap: &mut TrapData, actor: &Entity, proficient: bool) -> TrapResolution {
        if trap.is_detected {
            return TrapResolution { outcome: TrapOutcome::Detected, narration: self.narrate(trap, TrapOutcome::Detected), damage_dealt: None };
        }
        let check = roll_resolver::ability_check(actor, Ability::Wis, trap.detect_dc, Some("perception"), proficient, false, AdvState::default(), 0);
        if check.success {
            trap.is_detected = true;
            TrapResolution { outcome: TrapOutcome::Detected, narration: self.narrate(trap, TrapOutcome::Detected), damage_dealt: None }
        } else {
            TrapResolution { outcome: TrapOutcome::NotDetected, narration: self.narrate(trap, TrapOutcome::NotDetected), damage_dealt: None }
        }
    }

    /// Disarm attempt against `disarm_dc`; rejected outright when the trap
    /// schema marks it `can_be_disarmed = false` rather than silently
    /// succeeding or failing.
    pub fn disarm(&self, trap: &mut TrapData, actor: &Entity, proficient: bool) -> Option<TrapResolution> {
        let check = roll_resolver::ability_check(actor, Ability::Dex, trap.disarm_dc, Some("thieves_tools"), proficient, false, AdvState::default(), 0);
        if check.success {
            trap.is_disarmed = true;
            Some(TrapResolution { outcome: TrapOutcome::Disarmed, narration: self.narrate(trap, TrapOutcome::Disarmed), damage_dealt: None })
        } else {
            Some(TrapResolution { outcome: TrapOutcome::DisarmFailed, narration: self.narrate(trap, TrapOutcome::DisarmFailed), damage_dealt: None })
        }
    }

    /// Avoid attempt: a dexterity save against `save_dc`. Success passes the
    /// tile without triggering it; failure triggers it.
    pub fn avoid<R: Rng + ?Sized>(&self, rng: &mut R, state: &mut GameState, trap: &mut TrapData, proficient: bool) -> TrapResolution {
        let check = roll_resolver::saving_throw(&state.player, Ability::Dex, trap.save_dc, proficient, AdvState::default(), 0);
        if check.success {
            TrapResolution { outcome: TrapOutcome::Avoided, narration: self.narrate(trap, TrapOutcome::Avoided), damage_dealt: None }
        } else {
            self.trigger(rng, state, trap)
        }
    }

    /// Applies the trap's typed effect through `StateModifier`/pending
    /// status effects. Always assumed to act on the player: the engine only
    /// calls `trigger` when the player steps onto (or fails to avoid) a
    /// trap tile.
    pub fn trigger<R: Rng + ?Sized>(&self, rng: &mut R, state: &mut GameState, trap: &mut TrapData) -> TrapResolution {
        trap.is_triggered = true;
        match trap.trap_type.as_str() {
            "debuff" => self.trigger_debuff(state, trap),
            "teleport" => self.trigger_teleport(rng, state, trap),
            "alarm" => self.trigger_alarm(state, trap),
            "restraint" => self.trigger_restraint(state, trap),
            _ => self.trigger_damage(state, trap),
        }
    }

    fn trigger_damage(&self, state: &mut GameState, trap: &TrapData) -> TrapResolution {
        let mut damage = trap.damage.unwrap_or(15);
        if trap.save_half_damage {
            let save = roll_resolver::saving_throw(&state.player, Ability::Dex, trap.save_dc, false, AdvState::default(), 0);
            if save.success {
                damage /= 2;
            }
        }
        StateModifier::apply_player_resource_delta(state, -damage, 0, "trap_trigger");
        TrapResolution { outcome: TrapOutcome::Triggered, narration: self.narrate(trap, TrapOutcome::Triggered), damage_dealt: Some(damage) }
    }

    fn trigger_debuff(&self, state: &mut GameState, trap: &TrapData) -> TrapResolution {
        let duration = trap.debuff_duration.unwrap_or(3);
        let debuff_type = trap.debuff_type.clone().unwrap_or_else(|| "slow".to_string());
        let player_id = state.player.core().id.clone();
        state.pending_effects.push(PendingEffect {
            target_id: player_id,
            effect: StatusEffect {
                id: format!("trap-debuff-{debuff_type}"),
                name: debuff_type.clone(),
                source_key: "trap".to_string(),
                remaining_turns: duration,
                blocks: debuff_blocks(&debuff_type),
            },
        });
        TrapResolution { outcome: TrapOutcome::Triggered, narration: self.narrate(trap, TrapOutcome::Triggered), damage_dealt: None }
    }

    fn trigger_restraint(&self, state: &mut GameState, trap: &TrapData) -> TrapResolution {
        let duration = trap.restraint_duration.unwrap_or(3);
        let player_id = state.player.core().id.clone();
        state.pending_effects.push(PendingEffect {
            target_id: player_id,
            effect: StatusEffect {
                id: "trap-restraint".to_string(),
                name: "Restrained".to_string(),
                source_key: "trap".to_string(),
                remaining_turns: duration,
                blocks: vec!["move".to_string()],
            },
        });
        TrapResolution { outcome: TrapOutcome::Triggered, narration: self.narrate(trap, TrapOutcome::Triggered), damage_dealt: None }
    }

    /// Relocates the player to a random walkable tile within `teleport_range`
    /// tiles (Chebyshev) of their current position, falling back to any
    /// walkable tile on the floor if none qualify.
    fn trigger_teleport<R: Rng + ?Sized>(&self, rng: &mut R, state: &mut GameState, trap: &TrapData) -> TrapResolution {
        let origin = state.player.core().position;
        let range = trap.teleport_range.unwrap_or(8).max(1);
        let candidate = state
            .current_map
            .walkable_tiles()
            .filter(|t| (t.x - origin.x).abs().max((t.y - origin.y).abs()) <= range && (t.x, t.y) != (origin.x, origin.y))
            .choose(rng)
            .map(|t| Position { x: t.x, y: t.y })
            .or_else(|| state.current_map.walkable_tiles().map(|t| Position { x: t.x, y: t.y }).choose(rng));

        if let Some(destination) = candidate {
            state.player.core_mut().position = destination;
        }
        TrapResolution { outcome: TrapOutcome::Triggered, narration: self.narrate(trap, TrapOutcome::Triggered), damage_dealt: None }
    }

    fn trigger_alarm(&self, state: &mut GameState, trap: &TrapData) -> TrapResolution {
        if trap.summon_monsters {
            state.pending_events.push("An alarm blares, and you hear something answer the call.".to_string());
        } else {
            state.pending_events.push("An alarm blares through the dungeon!".to_string());
        }
        TrapResolution { outcome: TrapOutcome::Triggered, narration: self.narrate(trap, TrapOutcome::Triggered), damage_dealt: None }
    }
}

fn debuff_blocks(debuff_type: &str) -> Vec<String> {
    match debuff_type {
        "paralyzed" | "stunned" | "restrained" => vec!["move".to_string(), "attack".to_string()],
        "blind" => vec!["attack".to_string()],
        _ => vec![],
    }
}
