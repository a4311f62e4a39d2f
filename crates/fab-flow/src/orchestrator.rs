//! Run orchestration: worker spawning, status wiring, and final
//! manifest reconciliation.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::thread;

use fab_core::{logging, Chip};
use log::{error, info};
use regex::Regex;

use crate::builtins;
use crate::check;
use crate::graph;
use crate::runner::{self, DeferHook, StatusBoard};
use crate::task_id;
use crate::tools::Registry;
use crate::FlowError;

/// Completion notice sent by each worker back to the orchestrator.
pub struct TaskEvent {
    pub step: String,
    pub index: String,
    pub failed: bool,
}

/// Execute the configured flow. Equivalent to `run_with_hook` without a
/// scheduler deferral hook.
pub fn run(chip: &mut Chip, registry: &Arc<Registry>) -> Result<(), FlowError> {
    run_with_hook(chip, registry, None)
}

pub fn run_with_hook(
    chip: &mut Chip,
    registry: &Arc<Registry>,
    defer: Option<Arc<DeferHook>>,
) -> Result<(), FlowError> {
    let flow = chip
        .get_str(&["flow"])
        .ok_or_else(|| FlowError::Run("no flow configured".to_string()))?;

    // a flow naming a bare tool becomes a two-node import -> tool graph
    if !chip.getkeys(&["flowgraph"]).contains(&flow) {
        let tool = flow.clone();
        let step = chip.get_str(&["arg", "step"]).ok_or_else(|| {
            FlowError::Run("arg step must be specified for a single tool flow".to_string())
        })?;
        graph::node(chip, &flow, &step, &tool, 0);
        if step != "import" {
            graph::node(chip, &flow, "import", "nop", 0);
            graph::edge(chip, &flow, "import", &step, 0, 0);
        }
        chip.set(&["arg", "step"], Option::<String>::None);
    }

    // resolve the active slice
    let steplist = if let Some(step) = chip.get_str(&["arg", "step"]) {
        vec![step]
    } else {
        let configured = chip.get_strings(&["steplist"]);
        if !configured.is_empty() {
            configured
        } else {
            // full flow from scratch: stale results would shadow this run
            let jobdir = chip.workdir(None, None, "0");
            if jobdir.is_dir() {
                fs::remove_dir_all(&jobdir)?;
            }
            graph::list_steps(chip, &flow)
        }
    };
    if steplist.is_empty() {
        return Err(FlowError::Run("flowgraph has no steps".to_string()));
    }

    let mut indexlist: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for step in &steplist {
        let indices = if let Some(index) = chip.get_str(&["arg", "index"]) {
            vec![index]
        } else {
            let configured = chip.get_strings(&["indexlist"]);
            if !configured.is_empty() {
                configured
            } else {
                chip.getkeys(&["flowgraph", &flow, step])
            }
        };
        indexlist.insert(step.clone(), indices);
    }

    // export globally configured environment variables
    for key in chip.getkeys(&["env"]) {
        if let Some(value) = chip.get_str(&["env", &key]) {
            std::env::set_var(key, value);
        }
    }

    // seed status and run tool setup for the active slice
    let board = Arc::new(StatusBoard::new());
    for step in chip.getkeys(&["flowgraph", &flow]) {
        for index in chip.getkeys(&["flowgraph", &flow, &step]) {
            let id = task_id(&step, &index);
            let active = steplist.contains(&step)
                && indexlist.get(&step).map(|l| l.contains(&index)).unwrap_or(false);
            if active {
                chip.set(&["flowstatus", &step, &index, "error"], 1);
                board.seed(&id, true, true);
                let tool = chip
                    .get_str(&["flowgraph", &flow, &step, &index, "tool"])
                    .unwrap_or_default();
                if !builtins::is_builtin(&tool) {
                    let adapter = registry.tool(&tool).ok_or_else(|| {
                        FlowError::Tool(format!("setup not found for tool {}", tool))
                    })?;
                    chip.set(&["arg", "step"], step.as_str());
                    chip.set(&["arg", "index"], index.as_str());
                    adapter.setup(chip)?;
                    chip.set(&["arg", "step"], Option::<String>::None);
                    chip.set(&["arg", "index"], Option::<String>::None);
                }
            } else {
                chip.set(&["flowstatus", &step, &index, "error"], 0);
                board.seed(&id, false, false);
            }
        }
    }

    // auto-increment the job id from existing sibling job directories
    if chip.get_bool(&["jobincr"]) {
        let jobname = chip.get_str(&["jobname"]).unwrap_or_default();
        if let Some(design_dir) = chip.workdir(None, None, "0").parent().map(|p| p.to_path_buf()) {
            if let Ok(pattern) = Regex::new(&format!("^{}(\\d+)$", regex::escape(&jobname))) {
                let mut jobid = 0u64;
                if let Ok(entries) = fs::read_dir(&design_dir) {
                    for entry in entries.flatten() {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if let Some(caps) = pattern.captures(&name) {
                            if let Ok(n) = caps[1].parse::<u64>() {
                                jobid = jobid.max(n);
                            }
                        }
                    }
                }
                chip.set(&["jobid"], (jobid + 1).to_string());
            }
        }
    }

    info!("checking manifest before running");
    if !chip.get_bool(&["skipcheck"]) {
        check::check_manifest(chip)?;
    }
    if chip.has_error() {
        error!("check failed, see previous errors");
        return Err(FlowError::Run("pre-run check failed".to_string()));
    }

    // one worker per active task; the parent logger identity is
    // dropped around the spawn phase and workers install their own
    logging::clear_task();
    let (tx, rx) = crossbeam_channel::unbounded::<TaskEvent>();
    let mut handles = Vec::new();
    for step in &steplist {
        for index in &indexlist[step] {
            let worker_chip = chip.clone();
            let registry = Arc::clone(registry);
            let board = Arc::clone(&board);
            let defer = defer.clone();
            let tx = tx.clone();
            let step = step.clone();
            let index = index.clone();
            handles.push(thread::spawn(move || {
                let failed = runner::run_task_safe(
                    worker_chip,
                    &registry,
                    &step,
                    &index,
                    &board,
                    defer.as_deref(),
                );
                let _ = tx.send(TaskEvent { step, index, failed });
            }));
        }
    }
    drop(tx);
    for event in rx.iter() {
        if event.failed {
            error!("task {}{} failed", event.step, event.index);
        } else {
            info!("task {}{} completed", event.step, event.index);
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
    logging::clear_task();

    // a step has failed only when every one of its indices failed;
    // surviving siblings keep weighted-selection flows alive
    let mut halt = false;
    for step in &steplist {
        let all_failed = indexlist[step]
            .iter()
            .all(|index| board.has_error(&task_id(step, index)));
        if all_failed && !indexlist[step].is_empty() {
            halt = true;
        }
    }
    if halt {
        error!("run failed, see previous errors");
        return Err(FlowError::Run("one or more steps failed".to_string()));
    }

    // merge the manifests of the last step back into this chip
    chip.set(&["arg", "step"], Option::<String>::None);
    chip.set(&["arg", "index"], Option::<String>::None);

    let design = chip.get_str(&["design"]).unwrap_or_default();
    let laststep = steplist.last().expect("non-empty steplist");
    let mut last_step_succeeded = false;
    for index in &indexlist[laststep] {
        let manifest = chip
            .workdir(None, Some(laststep), index)
            .join("outputs")
            .join(format!("{}.pkg.json", design));
        if manifest.is_file() {
            last_step_succeeded = true;
            let builddir = chip.get_str(&["dir"]);
            chip.read_manifest(&manifest, None, true, true)?;
            if let Some(builddir) = builddir {
                chip.set(&["dir"], builddir);
            }
        }
    }

    if !last_step_succeeded {
        // walk forward to name the first step with no surviving manifest
        let mut failed_step = laststep.clone();
        for step in &steplist[..steplist.len() - 1] {
            let step_has_manifest = indexlist[step].iter().any(|index| {
                chip.workdir(None, Some(step), index)
                    .join("outputs")
                    .join(format!("{}.pkg.json", design))
                    .is_file()
            });
            if !step_has_manifest {
                failed_step = step.clone();
                break;
            }
        }
        error!(
            "run failed on step {}, see logs in {} for details",
            failed_step,
            chip.workdir(None, Some(&failed_step), "0").display()
        );
        return Err(FlowError::Run(format!("step {} produced no manifest", failed_step)));
    }

    let jobname = chip.get_str(&["jobname"]).unwrap_or_else(|| "job0".to_string());
    chip.snapshot_history(&jobname);
    Ok(())
}
