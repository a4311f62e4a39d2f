//! Flowgraph construction and static validation.
//!
//! A flowgraph node binds a tool (external executable or built-in) to a
//! `(step, index)` task; directed edges declare which upstream outputs a
//! task consumes.

use std::collections::{BTreeMap, BTreeSet};

use fab_core::Chip;
use log::{error, warn};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::builtins;
use crate::Task;

/// Create a flowgraph node by binding a tool to a task, seeding a zero
/// weight for every known metric.
pub fn node(chip: &mut Chip, flow: &str, step: &str, tool: &str, index: usize) {
    let index = index.to_string();
    chip.set(&["flowgraph", flow, step, &index, "tool"], tool);
    for metric in chip.getkeys(&["metric", "default", "default"]) {
        chip.set(&["flowgraph", flow, step, &index, "weight", &metric], 0.0);
    }
}

/// Create a directed edge by appending the tail task to the head task's
/// input list.
pub fn edge(chip: &mut Chip, flow: &str, tail: &str, head: &str, tail_index: usize, head_index: usize) {
    let head_index = head_index.to_string();
    chip.add(
        &["flowgraph", flow, head, &head_index, "input"],
        (tail, tail_index.to_string().as_str()),
    );
}

fn node_inputs(chip: &Chip, flow: &str, step: &str, index: &str) -> Vec<Task> {
    chip.get_pairs(&["flowgraph", flow, step, index, "input"])
}

/// All paths from a task back to root nodes without inputs; each path is
/// the list of traversed task ids.
fn all_paths(chip: &Chip, flow: &str, step: &str, index: &str, path: &[String]) -> Vec<Vec<String>> {
    let inputs = node_inputs(chip, flow, step, index);
    if inputs.is_empty() {
        return vec![path.to_vec()];
    }
    let mut out = Vec::new();
    for (in_step, in_index) in inputs {
        let mut next = path.to_vec();
        next.push(format!("{}{}", in_step, in_index));
        out.extend(all_paths(chip, flow, &in_step, &in_index, &next));
    }
    out
}

/// Whether the flowgraph contains a dependency cycle.
pub fn has_cycle(chip: &Chip, flow: &str) -> bool {
    let mut graph = DiGraph::<(), ()>::new();
    let mut ids = BTreeMap::new();
    let mut edges = Vec::new();
    for step in chip.getkeys(&["flowgraph", flow]) {
        for index in chip.getkeys(&["flowgraph", flow, &step]) {
            let head = format!("{}{}", step, index);
            let head_id = *ids.entry(head.clone()).or_insert_with(|| graph.add_node(()));
            for (in_step, in_index) in node_inputs(chip, flow, &step, &index) {
                edges.push((format!("{}{}", in_step, in_index), head_id));
            }
        }
    }
    for (tail, head_id) in edges {
        let tail_id = *ids.entry(tail).or_insert_with(|| graph.add_node(()));
        graph.add_edge(tail_id, head_id, ());
    }
    is_cyclic_directed(&graph)
}

/// Steps of a flow ordered by their longest path from a root node.
/// Sibling ties keep a stable, deterministic order.
pub fn list_steps(chip: &Chip, flow: &str) -> Vec<String> {
    if has_cycle(chip, flow) {
        error!("flowgraph {} contains a dependency cycle", flow);
        chip.raise_error();
        return Vec::new();
    }

    let steps = chip.getkeys(&["flowgraph", flow]);
    let mut depth: Vec<(String, usize)> = steps
        .into_iter()
        .map(|step| {
            let longest = all_paths(chip, flow, &step, "0", &[])
                .into_iter()
                .map(|p| p.len())
                .max()
                .unwrap_or(0);
            (step, longest)
        })
        .collect();
    depth.sort_by_key(|(_, d)| *d);
    depth.into_iter().map(|(step, _)| step).collect()
}

/// The set of filenames guaranteed to be present in a task's `outputs/`
/// directory after it succeeds: tool declarations for external tools,
/// the intersection of upstream outputs for minimum/maximum, and the
/// union for join/nop. The import step additionally stages every
/// collected file.
pub fn gather_outputs(chip: &Chip, flow: &str, step: &str, index: &str) -> BTreeSet<String> {
    let tool = chip
        .get_str(&["flowgraph", flow, step, index, "tool"])
        .unwrap_or_default();

    let mut outputs: BTreeSet<String> = BTreeSet::new();
    if builtins::is_builtin(&tool) {
        let upstream: Vec<BTreeSet<String>> = node_inputs(chip, flow, step, index)
            .into_iter()
            .map(|(s, i)| gather_outputs(chip, flow, &s, &i))
            .collect();
        match tool.as_str() {
            "minimum" | "maximum" => {
                if let Some((first, rest)) = upstream.split_first() {
                    outputs = rest.iter().fold(first.clone(), |acc, set| {
                        acc.intersection(set).cloned().collect()
                    });
                }
            }
            "join" | "nop" => {
                for set in upstream {
                    outputs.extend(set);
                }
            }
            _ => {
                warn!("outputs of builtin '{}' cannot be gathered statically", tool);
            }
        }
    } else if chip.valid(&["eda", &tool, "output", step, index], true) {
        outputs = chip
            .get_strings(&["eda", &tool, "output", step, index])
            .into_iter()
            .collect();
    }

    if step == "import" {
        for path in chip.collect_paths() {
            outputs.insert(fab_core::paths::imported_filename(&path));
        }
    }

    outputs
}

/// Verify that every filename an external tool declares as input will be
/// produced by its upstream task (or already sits in the upstream output
/// directory when that step is not part of this run).
pub fn check_flowgraph_io(chip: &Chip, flow: &str, steplist: &[String]) -> bool {
    if steplist.len() < 2 {
        return true;
    }

    for step in steplist {
        for index in chip.getkeys(&["flowgraph", flow, step]) {
            let tool = chip
                .get_str(&["flowgraph", flow, step, &index, "tool"])
                .unwrap_or_default();
            if builtins::is_builtin(&tool) {
                // builtins pass through whatever they receive
                continue;
            }

            let in_tasks = node_inputs(chip, flow, step, &index);
            let inputs: BTreeSet<String> = if in_tasks.len() > 1 {
                warn!("tool task {}{} has more than one input task", step, index);
                continue;
            } else if let Some((in_step, in_index)) = in_tasks.first() {
                if !steplist.contains(in_step) {
                    // upstream not part of this run: its outputs must
                    // already be on disk, possibly borrowed from another job
                    let jobname = chip.get_str(&["jobname"]).unwrap_or_default();
                    let in_job = chip
                        .get_str(&["jobinput", &jobname, step, &index])
                        .unwrap_or(jobname);
                    let outdir = chip
                        .workdir(Some(&in_job), Some(in_step), in_index)
                        .join("outputs");
                    match std::fs::read_dir(&outdir) {
                        Ok(entries) => entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.file_name().to_string_lossy().into_owned())
                            .collect(),
                        Err(_) => {
                            error!(
                                "no outputs found for {}{} in {}",
                                in_step,
                                in_index,
                                outdir.display()
                            );
                            return false;
                        }
                    }
                } else {
                    gather_outputs(chip, flow, in_step, in_index)
                }
            } else {
                BTreeSet::new()
            };

            let required = if chip.valid(&["eda", &tool, "input", step, &index], true) {
                chip.get_strings(&["eda", &tool, "input", step, &index])
            } else {
                Vec::new()
            };
            for requirement in required {
                if !inputs.contains(&requirement) {
                    error!(
                        "invalid flow: {}{} will not receive required input {}",
                        step, index, requirement
                    );
                    return false;
                }
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_chip() -> Chip {
        let mut chip = Chip::new(Some("top"));
        chip.set(&["flow"], "f");
        node(&mut chip, "f", "import", "nop", 0);
        node(&mut chip, "f", "syn", "yosys", 0);
        edge(&mut chip, "f", "import", "syn", 0, 0);
        chip
    }

    #[test]
    fn test_list_steps_orders_by_depth() {
        let chip = two_step_chip();
        assert_eq!(list_steps(&chip, "f"), vec!["import", "syn"]);
    }

    #[test]
    fn test_list_steps_is_topological() {
        let mut chip = Chip::new(Some("top"));
        node(&mut chip, "f", "import", "nop", 0);
        node(&mut chip, "f", "syn", "yosys", 0);
        node(&mut chip, "f", "place", "openroad", 0);
        node(&mut chip, "f", "route", "openroad", 0);
        edge(&mut chip, "f", "import", "syn", 0, 0);
        edge(&mut chip, "f", "syn", "place", 0, 0);
        edge(&mut chip, "f", "place", "route", 0, 0);

        let order = list_steps(&chip, "f");
        let pos = |s: &str| order.iter().position(|x| x == s).unwrap();
        assert!(pos("import") < pos("syn"));
        assert!(pos("syn") < pos("place"));
        assert!(pos("place") < pos("route"));
    }

    #[test]
    fn test_cycle_detection() {
        let mut chip = two_step_chip();
        edge(&mut chip, "f", "syn", "import", 0, 0);
        assert!(has_cycle(&chip, "f"));
        assert!(list_steps(&chip, "f").is_empty());
        assert!(chip.has_error());
    }

    #[test]
    fn test_gather_outputs_union_for_join() {
        let mut chip = Chip::new(Some("top"));
        node(&mut chip, "f", "syna", "toola", 0);
        node(&mut chip, "f", "synb", "toolb", 0);
        node(&mut chip, "f", "merge", "join", 0);
        edge(&mut chip, "f", "syna", "merge", 0, 0);
        edge(&mut chip, "f", "synb", "merge", 0, 0);
        chip.add(&["eda", "toola", "output", "syna", "0"], vec!["a.v", "common.v"]);
        chip.add(&["eda", "toolb", "output", "synb", "0"], vec!["b.v", "common.v"]);

        let outputs = gather_outputs(&chip, "f", "merge", "0");
        let expect: BTreeSet<String> =
            ["a.v", "b.v", "common.v"].iter().map(|s| s.to_string()).collect();
        assert_eq!(outputs, expect);
    }

    #[test]
    fn test_gather_outputs_intersection_for_minimum() {
        let mut chip = Chip::new(Some("top"));
        node(&mut chip, "f", "placea", "toola", 0);
        node(&mut chip, "f", "placeb", "toolb", 0);
        node(&mut chip, "f", "best", "minimum", 0);
        edge(&mut chip, "f", "placea", "best", 0, 0);
        edge(&mut chip, "f", "placeb", "best", 0, 0);
        chip.add(&["eda", "toola", "output", "placea", "0"], vec!["a.def", "common.def"]);
        chip.add(&["eda", "toolb", "output", "placeb", "0"], vec!["b.def", "common.def"]);

        let outputs = gather_outputs(&chip, "f", "best", "0");
        let expect: BTreeSet<String> = ["common.def"].iter().map(|s| s.to_string()).collect();
        assert_eq!(outputs, expect);
    }

    #[test]
    fn test_check_flowgraph_io_accepts_produced_inputs() {
        let mut chip = two_step_chip();
        chip.set(&["copyall"], false);
        chip.add(&["source"], "top.v");
        chip.add(&["eda", "yosys", "input", "syn", "0"], "top.v");
        // import stages 'source' under its hashed name, so the literal
        // filename is only produced when a tool declares it
        let staged = fab_core::paths::imported_filename("top.v");
        let produced = gather_outputs(&chip, "f", "import", "0");
        assert!(produced.contains(&staged));
        assert!(!check_flowgraph_io(&chip, "f", &["import".into(), "syn".into()]));

        let mut chip = two_step_chip();
        chip.add(&["source"], "top.v");
        let staged = fab_core::paths::imported_filename("top.v");
        chip.add(&["eda", "yosys", "input", "syn", "0"], staged.as_str());
        assert!(check_flowgraph_io(&chip, "f", &["import".into(), "syn".into()]));
    }
}
