//! Pre-run manifest validation.

use fab_core::Chip;
use log::error;

use crate::builtins;
use crate::graph;
use crate::FlowError;

/// Verify the integrity of the manifest before (or inside) a run:
/// a legal flowgraph, satisfied `require` settings, per-tool parameter
/// requirements, path allow-lists, and producible flowgraph I/O. Returns
/// an explicit status rather than relying on the object error latch.
pub fn check_manifest(chip: &Chip) -> Result<(), FlowError> {
    let mut errors = 0usize;

    let flow = chip.get_str(&["flow"]).unwrap_or_default();

    // flowgraph legality
    if !chip.getkeys(&["flowgraph"]).contains(&flow) {
        error!("flowgraph {} not defined", flow);
        errors += 1;
        return Err(FlowError::CheckFailed(errors));
    }
    let legal_steps = chip.getkeys(&["flowgraph", &flow]);
    if !legal_steps.iter().any(|s| s == "import") {
        error!("flowgraph does not contain an import step");
        errors += 1;
    }

    let steplist = if let Some(step) = chip.get_str(&["arg", "step"]) {
        vec![step]
    } else {
        let configured = chip.get_strings(&["steplist"]);
        if configured.is_empty() {
            graph::list_steps(chip, &flow)
        } else {
            configured
        }
    };

    // schema-wide requirement settings
    let mode = chip.get_str(&["mode"]).unwrap_or_default();
    for key in chip.allkeys() {
        if key.iter().any(|seg| seg == "default") {
            continue;
        }
        let refs: Vec<&str> = key.iter().map(String::as_str).collect();
        if !chip.keypath_empty(&refs) {
            continue;
        }
        match chip.get_field(&refs, "require").as_str() {
            Some("all") => {
                error!("global requirement missing for [{}]", key.join(","));
                errors += 1;
            }
            Some(require) if require == mode && !mode.is_empty() => {
                error!("mode requirement missing for [{}]", key.join(","));
                errors += 1;
            }
            _ => {}
        }
    }

    // per-tool requirements for every task in the run
    let known_tools = chip.getkeys(&["eda"]);
    for step in &steplist {
        for index in chip.getkeys(&["flowgraph", &flow, step]) {
            let tool = chip
                .get_str(&["flowgraph", &flow, step, &index, "tool"])
                .unwrap_or_default();
            if builtins::is_builtin(&tool) {
                continue;
            }
            if !known_tools.contains(&tool) {
                error!("tool {} for task {}{} has no setup", tool, step, index);
                errors += 1;
                continue;
            }
            for item in chip.get_strings(&["eda", &tool, "require", step, &index]) {
                let keypath: Vec<&str> = item.split(',').collect();
                if chip.keypath_empty(&keypath) {
                    error!("value empty for [{}] required by {}", item, tool);
                    errors += 1;
                }
            }
            if chip.keypath_empty(&["eda", &tool, "exe"]) {
                error!("executable not specified for tool {}", tool);
                errors += 1;
            }
        }
    }

    if std::env::var("SC_VALID_PATHS").is_ok() && !chip.check_files() {
        errors += 1;
    }

    if !graph::check_flowgraph_io(chip, &flow, &steplist) {
        errors += 1;
    }

    // task-scoped checks, active only inside a runner
    let step = chip.get_str(&["arg", "step"]);
    let index = chip.get_str(&["arg", "index"]);
    if let (Some(step), Some(index)) = (step, index) {
        if !chip.get_bool(&["skipall"]) {
            let tool = chip
                .get_str(&["flowgraph", &flow, &step, &index, "tool"])
                .unwrap_or_default();
            let input_dir = chip.workdir(None, Some(&step), &index).join("inputs");
            for filename in chip.get_strings(&["eda", &tool, "input", &step, &index]) {
                if !input_dir.join(&filename).is_file() {
                    error!("required input {} not received for {}{}", filename, step, index);
                    errors += 1;
                }
            }
            if !builtins::is_builtin(&tool) {
                for item in chip.get_strings(&["eda", &tool, "require", &step, &index]) {
                    let keypath: Vec<&str> = item.split(',').collect();
                    let is_path = chip
                        .get_field(&keypath, "type")
                        .as_str()
                        .map(|t| t.contains("file") || t.contains("dir"))
                        .unwrap_or(false);
                    if is_path {
                        let found = chip.find_files(&keypath, false);
                        if found.is_empty() || found.iter().any(Option::is_none) {
                            error!("required file keypath [{}] cannot be resolved", item);
                            errors += 1;
                        }
                    }
                }
            }
        }
    }

    if errors > 0 {
        Err(FlowError::CheckFailed(errors))
    } else {
        Ok(())
    }
}
