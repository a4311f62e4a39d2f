//! Built-in combinators: tasks executed inside the engine rather than by
//! an external tool.
//!
//! `minimum`/`maximum` implement weighted metric selection with
//! goal-satisfaction preference; `join`/`nop` pass their inputs through;
//! `verify` gates the flow on metric assertions; `mux` keeps the
//! selection interface but does not pick a winner yet.

use fab_core::Chip;
use log::warn;
use regex::Regex;

use crate::Task;

pub const BUILTINS: &[&str] = &["minimum", "maximum", "nop", "mux", "join", "verify"];

pub fn is_builtin(tool: &str) -> bool {
    BUILTINS.contains(&tool)
}

/// Merge outputs from a list of input tasks.
pub fn join_tasks(inputs: &[Task]) -> Vec<Task> {
    inputs.to_vec()
}

/// Pass a single input through unchanged.
pub fn nop(inputs: &[Task]) -> Vec<Task> {
    inputs.to_vec()
}

/// Select the input task with the lowest weighted score.
pub fn minimum(chip: &Chip, flow: &str, node: &Task, inputs: &[Task]) -> (f64, Option<Task>) {
    minmax(chip, flow, node, inputs, Extremum::Minimum)
}

/// Select the input task with the highest weighted score.
pub fn maximum(chip: &Chip, flow: &str, node: &Task, inputs: &[Task]) -> (f64, Option<Task>) {
    minmax(chip, flow, node, inputs, Extremum::Maximum)
}

/// Select an input using caller-supplied criteria instead of the node
/// weights. The selection body is not implemented; the interface is
/// fixed so flows can already bind it.
pub fn mux(_chip: &Chip, _flow: &str, _node: &Task, _inputs: &[Task], _selector: &[String]) -> (f64, Option<Task>) {
    (0.0, None)
}

#[derive(Clone, Copy, PartialEq)]
enum Extremum {
    Minimum,
    Maximum,
}

/// An input is eligible when its error bit is clear and every metric
/// with a defined goal is within that goal.
fn eligible(chip: &Chip, step: &str, index: &str) -> bool {
    if chip.get_int(&["flowstatus", step, index, "error"]).unwrap_or(0) == 1 {
        return false;
    }
    for metric in chip.getkeys(&["metric", step, index]) {
        if let Some(goal) = chip.get_float(&["metric", step, index, &metric, "goal"]) {
            let real = chip
                .get_float(&["metric", step, index, &metric, "real"])
                .unwrap_or(0.0);
            if real.abs() > goal {
                warn!(
                    "step {}{} fails the goal for the '{}' metric",
                    step, index, metric
                );
                return false;
            }
        }
    }
    true
}

fn minmax(chip: &Chip, flow: &str, node: &Task, inputs: &[Task], op: Extremum) -> (f64, Option<Task>) {
    let survivors: Vec<&Task> = inputs
        .iter()
        .filter(|(s, i)| eligible(chip, s, i))
        .collect();

    // per-metric normalization bounds across the eligible inputs
    let metrics = chip.getkeys(&["flowgraph", flow, &node.0, &node.1, "weight"]);
    let mut bounds: Vec<(String, f64, f64, f64)> = Vec::new();
    for metric in metrics {
        let weight = chip
            .get_float(&["flowgraph", flow, &node.0, &node.1, "weight", &metric])
            .unwrap_or(0.0);
        if weight == 0.0 {
            continue;
        }
        // the upper bound saturates at zero so all-negative metrics
        // (slack) normalize against zero rather than their own maximum
        let mut lo = f64::INFINITY;
        let mut hi: f64 = 0.0;
        for (s, i) in &survivors {
            let real = chip.get_float(&["metric", s, i, &metric, "real"]).unwrap_or(0.0);
            lo = lo.min(real);
            hi = hi.max(real);
        }
        bounds.push((metric, weight, lo, hi));
    }

    let mut best_score = match op {
        Extremum::Minimum => f64::INFINITY,
        Extremum::Maximum => f64::NEG_INFINITY,
    };
    let mut winner: Option<Task> = None;
    for (s, i) in &survivors {
        let mut score = 0.0;
        for (metric, weight, lo, hi) in &bounds {
            let real = chip.get_float(&["metric", s, i, metric, "real"]).unwrap_or(0.0);
            let scaled = if (hi - lo) != 0.0 { (real - lo) / (hi - lo) } else { *hi };
            score += scaled * weight;
        }
        let better = match op {
            Extremum::Minimum => score < best_score,
            Extremum::Maximum => score > best_score,
        };
        if better {
            best_score = score;
            winner = Some((s.clone(), i.clone()));
        }
    }

    (best_score, winner)
}

fn compare(value: f64, op: &str, goal: f64) -> Option<bool> {
    match op {
        ">" => Some(value > goal),
        ">=" => Some(value >= goal),
        "<" => Some(value < goal),
        "<=" => Some(value <= goal),
        "==" => Some(value == goal),
        "!=" => Some(value != goal),
        _ => None,
    }
}

/// Test assertions of the form `metric op goal` (e.g. `errors==0`)
/// against every input task. True iff all assertions hold everywhere.
pub fn verify(chip: &Chip, inputs: &[Task], assertions: &[String]) -> bool {
    let pattern = Regex::new(r"^\s*(\w+)\s*(==|!=|>=|<=|>|<)\s*(-?\d+(?:\.\d+)?)\s*$")
        .expect("static regex");
    for assertion in assertions {
        let Some(caps) = pattern.captures(assertion) else {
            log::error!("malformed assertion '{}'", assertion);
            chip.raise_error();
            return false;
        };
        let metric = &caps[1];
        let op = &caps[2];
        let goal: f64 = caps[3].parse().expect("regex guarantees a number");
        for (s, i) in inputs {
            let real = chip.get_float(&["metric", s, i, metric, "real"]).unwrap_or(0.0);
            match compare(real, op, goal) {
                Some(true) => {}
                Some(false) => return false,
                None => {
                    chip.raise_error();
                    return false;
                }
            }
        }
    }
    true
}
