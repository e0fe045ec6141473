//! Pure, seedable dice rolling.
//!
//! `roll_dice` is the contract primitive every higher-level check (ability
//! checks, saves, attack rolls, combat damage) is built on. Advantage and
//! disadvantage only make sense for a single d20 roll; requesting them with
//! any other shape is accepted but ignored with a logged warning rather than
//! rejected, matching the original's permissive behavior.

use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::formula::DiceFormula;

/// One physical die result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DieRoll {
    pub sides: u32,
    pub value: u32,
}

/// Full result of a `roll_dice` call: every physical die rolled, the subset
/// actually counted toward the total (after advantage/disadvantage/drop
/// rules), and the final total with crit flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollOutcome {
    pub rolls: Vec<DieRoll>,
    pub picked: Vec<DieRoll>,
    pub modifier: i32,
    pub total: i32,
    pub is_crit_20: bool,
    pub is_crit_1: bool,
    pub breakdown: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollOptions {
    pub advantage: bool,
    pub disadvantage: bool,
    pub reroll_ones: bool,
    pub drop_lowest: bool,
}

/// Roll `count` dice of `sides` faces, apply `options`, and add `modifier`.
///
/// Advantage/disadvantage is only meaningful for `count == 1 && sides == 20`;
/// for any other shape the flags are ignored and a warning is logged, per the
/// pure-dice contract.
pub fn roll_dice(count: u32, sides: u32, modifier: i32, options: RollOptions) -> RollOutcome {
    roll_dice_with(&mut rand::thread_rng(), count, sides, modifier, options)
}

pub fn roll_dice_with<R: Rng + ?Sized>(
    rng: &mut R,
    count: u32,
    sides: u32,
    modifier: i32,
    options: RollOptions,
) -> RollOutcome {
    let is_single_d20 = count == 1 && sides == 20;
    if (options.advantage || options.disadvantage) && !is_single_d20 {
        warn!(
            "advantage/disadvantage requested for {}d{}, which is not a single d20 roll; ignoring",
            count, sides
        );
    }

    let mut rolls: Vec<DieRoll> = Vec::with_capacity(count.max(1) as usize);

    if is_single_d20 && (options.advantage || options.disadvantage) {
        let a = roll_one(rng, sides, options.reroll_ones);
        let b = roll_one(rng, sides, options.reroll_ones);
        rolls.push(a);
        rolls.push(b);
        let picked = if options.advantage {
            if a.value >= b.value {
                a
            } else {
                b
            }
        } else if a.value <= b.value {
            a
        } else {
            b
        };
        let total = picked.value as i32 + modifier;
        return RollOutcome {
            is_crit_20: picked.value == 20,
            is_crit_1: picked.value == 1,
            breakdown: format!(
                "{}({},{}) {:+} = {}",
                if options.advantage { "adv" } else { "disadv" },
                a.value,
                b.value,
                modifier,
                total
            ),
            rolls,
            picked: vec![picked],
            modifier,
            total,
        };
    }

    for _ in 0..count {
        rolls.push(roll_one(rng, sides, options.reroll_ones));
    }

    let mut picked = rolls.clone();
    if options.drop_lowest && picked.len() > 1 {
        if let Some((idx, _)) = picked
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.value)
        {
            picked.remove(idx);
        }
    }

    let sum: i32 = picked.iter().map(|d| d.value as i32).sum();
    let total = sum + modifier;
    let is_single_die = count == 1;
    let is_crit_20 = is_single_die && sides == 20 && picked.first().map_or(false, |d| d.value == 20);
    let is_crit_1 = is_single_die && sides == 20 && picked.first().map_or(false, |d| d.value == 1);

    RollOutcome {
        breakdown: format!(
            "{}d{}{:+} [{}] = {}",
            count,
            sides,
            modifier,
            picked
                .iter()
                .map(|d| d.value.to_string())
                .collect::<Vec<_>>()
                .join(","),
            total
        ),
        rolls,
        picked,
        modifier,
        total,
        is_crit_20,
        is_crit_1,
    }
}

fn roll_one<R: Rng + ?Sized>(rng: &mut R, sides: u32, reroll_ones: bool) -> DieRoll {
    let mut value = rng.gen_range(1..=sides);
    if reroll_ones && value == 1 {
        value = rng.gen_range(1..=sides);
    }
    DieRoll { sides, value }
}

/// Parse `NdM(+/-K)` notation (e.g. `"2d6+3"`, `"1d20-1"`, `"3d8"`) and roll it.
pub fn parse_and_roll(expr: &str) -> Result<RollOutcome, String> {
    parse_and_roll_with(&mut rand::thread_rng(), expr)
}

pub fn parse_and_roll_with<R: Rng + ?Sized>(rng: &mut R, expr: &str) -> Result<RollOutcome, String> {
    let (count, sides, modifier) = parse_expr(expr)?;
    Ok(roll_dice_with(rng, count, sides, modifier, RollOptions::default()))
}

fn parse_expr(expr: &str) -> Result<(u32, u32, i32), String> {
    let s = expr.trim().replace(' ', "");
    let (dice_part, modifier) = if let Some(pos) = s[1..].find(['+', '-']).map(|p| p + 1) {
        let (d, m) = s.split_at(pos);
        let modifier: i32 = m.parse().map_err(|_| format!("invalid modifier in {expr:?}"))?;
        (d, modifier)
    } else {
        (s.as_str(), 0)
    };

    let d_pos = dice_part
        .find('d')
        .ok_or_else(|| format!("missing 'd' separator in {expr:?}"))?;
    let count_str = &dice_part[..d_pos];
    let sides_str = &dice_part[d_pos + 1..];
    let count: u32 = if count_str.is_empty() {
        1
    } else {
        count_str.parse().map_err(|_| format!("invalid dice count in {expr:?}"))?
    };
    let sides: u32 = sides_str.parse().map_err(|_| format!("invalid die sides in {expr:?}"))?;
    Ok((count, sides, modifier))
}

/// Evaluate a bracketed dice formula (`DiceFormula::Expr` accepts the same
/// `"NdM[Label]+K[Label]"` bracket-annotated terms the teacher's affix system
/// produced), returning the numeric total. `dice_multiplier` scales dice
/// counts (not flat modifiers), matching multi-hit effects.
pub fn evaluate(formula: &DiceFormula, dice_multiplier: u32) -> f64 {
    match formula {
        DiceFormula::Value(v) => *v,
        DiceFormula::Expr(s) => parse_and_roll_bracketed(s, dice_multiplier).0,
    }
}

pub fn average(formula: &DiceFormula) -> f64 {
    match formula {
        DiceFormula::Value(v) => *v,
        DiceFormula::Expr(s) => parse_average_bracketed(s),
    }
}

fn parse_and_roll_bracketed(expr: &str, dice_multiplier: u32) -> (f64, Vec<(String, f64)>) {
    let s = expr.replace(' ', "");
    let mut total = 0.0;
    let mut modifiers = Vec::new();
    let mut current_term = String::new();
    let mut sign = 1.0;

    let finish_term = |term: &str, sign: f64, total: &mut f64, modifiers: &mut Vec<(String, f64)>| {
        if term.is_empty() {
            return;
        }
        let (cleaned, name) = strip_bracket(term);
        let val = sign * eval_term(cleaned, dice_multiplier);
        modifiers.push((name.unwrap_or_else(|| cleaned.to_string()), val));
        *total += val;
    };

    for c in s.chars() {
        if c == '+' || c == '-' {
            finish_term(&current_term, sign, &mut total, &mut modifiers);
            current_term.clear();
            sign = if c == '+' { 1.0 } else { -1.0 };
        } else {
            current_term.push(c);
        }
    }
    finish_term(&current_term, sign, &mut total, &mut modifiers);
    (total, modifiers)
}

fn parse_average_bracketed(expr: &str) -> f64 {
    let s = expr.replace(' ', "");
    let mut sum = 0.0;
    let mut current_term = String::new();
    let mut sign = 1.0;
    for c in s.chars() {
        if c == '+' || c == '-' {
            if !current_term.is_empty() {
                let (cleaned, _) = strip_bracket(&current_term);
                sum += sign * average_term(cleaned);
                current_term.clear();
            }
            sign = if c == '+' { 1.0 } else { -1.0 };
        } else {
            current_term.push(c);
        }
    }
    if !current_term.is_empty() {
        let (cleaned, _) = strip_bracket(&current_term);
        sum += sign * average_term(cleaned);
    }
    sum
}

fn strip_bracket(term: &str) -> (&str, Option<String>) {
    if let Some(bracket_pos) = term.find('[') {
        let name = term[bracket_pos + 1..term.len() - 1].to_string();
        (&term[..bracket_pos], Some(name))
    } else {
        (term, None)
    }
}

fn eval_term(term: &str, dice_multiplier: u32) -> f64 {
    if let Some(d_pos) = term.find('d') {
        let count: i64 = term[..d_pos].parse().unwrap_or(1);
        let sides: i64 = term[d_pos + 1..].parse().unwrap_or(6);
        let mut rng = rand::thread_rng();
        let mut sum = 0i64;
        for _ in 0..(count * dice_multiplier as i64) {
            sum += rng.gen_range(1..=sides.max(1));
        }
        return sum as f64;
    }
    term.parse().unwrap_or(0.0)
}

fn average_term(term: &str) -> f64 {
    if let Some(d_pos) = term.find('d') {
        let count: f64 = term[..d_pos].parse().unwrap_or(1.0);
        let sides: f64 = term[d_pos + 1..].parse().unwrap_or(6.0);
        return count * (sides + 1.0) / 2.0;
    }
    term.parse().unwrap_or(0.0)
}
