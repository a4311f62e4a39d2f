//! Full flow execution scenarios driving real subprocesses.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use fab_core::Chip;
use fab_flow::graph::{edge, node};
use fab_flow::orchestrator;
use fab_flow::tools::Registry;
use tempfile::TempDir;

/// A chip wired to a two-step flow (import -> syn) running `sh` inside
/// an isolated build tree.
fn shell_chip(dir: &TempDir, command: &str) -> Chip {
    let mut chip = Chip::new(Some("top"));
    chip.set(&["dir"], dir.path().join("build").display().to_string());
    chip.set(&["flow"], "f");
    chip.set(&["quiet"], true);

    let source = dir.path().join("top.v");
    fs::write(&source, "module top(); endmodule\n").unwrap();
    chip.add(&["source"], source.display().to_string());

    node(&mut chip, "f", "import", "nop", 0);
    node(&mut chip, "f", "syn", "shell", 0);
    edge(&mut chip, "f", "import", "syn", 0, 0);
    chip.set(&["eda", "shell", "exe"], "sh");
    chip.add(&["eda", "shell", "option", "syn", "0"], command);
    chip
}

fn manifest_path(chip: &Chip, step: &str) -> std::path::PathBuf {
    chip.workdir(None, Some(step), "0")
        .join("outputs")
        .join("top.pkg.json")
}

#[test]
fn test_two_step_flow_succeeds() {
    let dir = TempDir::new().unwrap();
    let mut chip = shell_chip(&dir, "-c 'echo synth done'");
    chip.add(&["eda", "shell", "regex", "syn", "0", "hits"], "synth");

    let registry = Arc::new(Registry::new());
    orchestrator::run(&mut chip, &registry).unwrap();

    // every task left a manifest and a clean status behind
    assert!(manifest_path(&chip, "import").is_file());
    assert!(manifest_path(&chip, "syn").is_file());
    assert_eq!(chip.get_int(&["flowstatus", "syn", "0", "error"]), Some(0));

    let syn_dir = chip.workdir(None, Some("syn"), "0");
    let log = fs::read_to_string(syn_dir.join("syn.log")).unwrap();
    assert!(log.contains("synth done"));

    // log scan wrote the matching lines to <step>.<suffix>
    let hits = fs::read_to_string(syn_dir.join("syn.hits")).unwrap();
    assert!(hits.contains("synth done"));

    // tool interface artifacts
    assert!(syn_dir.join("sc_manifest.json").is_file());
    assert!(syn_dir.join("replay.sh").is_file());

    // import staged the source under its collision-free name
    let staged = fab_core::paths::imported_filename(
        &dir.path().join("top.v").display().to_string(),
    );
    assert!(chip
        .workdir(None, Some("import"), "0")
        .join("outputs")
        .join(&staged)
        .is_file());

    // runtime metrics were recorded and merged back
    assert!(chip.get_float(&["metric", "syn", "0", "exetime", "real"]).is_some());
}

#[test]
fn test_failing_tool_halts_downstream() {
    let dir = TempDir::new().unwrap();
    let mut chip = shell_chip(&dir, "-c 'exit 7'");
    node(&mut chip, "f", "place", "shell", 0);
    edge(&mut chip, "f", "syn", "place", 0, 0);
    chip.add(&["eda", "shell", "option", "place", "0"], "-c 'echo placed'");

    let registry = Arc::new(Registry::new());
    let result = orchestrator::run(&mut chip, &registry);
    assert!(result.is_err());

    // the failing step ran and logged, but produced no manifest
    let syn_dir = chip.workdir(None, Some("syn"), "0");
    assert!(syn_dir.join("syn.log").is_file());
    assert!(!manifest_path(&chip, "syn").is_file());

    // downstream halted before running its tool
    let place_dir = chip.workdir(None, Some("place"), "0");
    assert!(!manifest_path(&chip, "place").is_file());
    assert!(!place_dir.join("place.log").exists());
}

#[test]
fn test_partial_run_reuses_upstream_outputs() {
    let dir = TempDir::new().unwrap();
    let mut chip = shell_chip(&dir, "-c 'echo first pass'");
    let registry = Arc::new(Registry::new());
    orchestrator::run(&mut chip, &registry).unwrap();

    // rerun only syn; import outputs are taken from disk
    let mut rerun = shell_chip(&dir, "-c 'echo second pass'");
    rerun.add(&["steplist"], "syn");
    orchestrator::run(&mut rerun, &registry).unwrap();

    let log = fs::read_to_string(
        rerun.workdir(None, Some("syn"), "0").join("syn.log"),
    )
    .unwrap();
    assert!(log.contains("second pass"));
}

#[test]
fn test_timeout_terminates_tool() {
    let dir = TempDir::new().unwrap();
    let mut chip = shell_chip(&dir, "-c 'sleep 30'");
    chip.set(&["flowgraph", "f", "syn", "0", "timeout"], 0.5);

    let registry = Arc::new(Registry::new());
    let started = Instant::now();
    let result = orchestrator::run(&mut chip, &registry);
    assert!(result.is_err());
    assert!(started.elapsed().as_secs() < 20, "timeout was not enforced");
}

#[test]
fn test_run_aborts_on_check_failure() {
    let dir = TempDir::new().unwrap();
    let mut chip = shell_chip(&dir, "-c 'echo hi'");
    // drop the executable declaration: the pre-run check must refuse
    chip.set_field(&["eda", "shell", "exe"], "value", Option::<String>::None);

    let registry = Arc::new(Registry::new());
    let result = orchestrator::run(&mut chip, &registry);
    assert!(result.is_err());
    assert!(!Path::new(&manifest_path(&chip, "syn")).exists());
}
