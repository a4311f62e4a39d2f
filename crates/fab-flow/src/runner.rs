//! Single-task execution: staging, subprocess control, and result
//! publication.
//!
//! Each task runs in its own worker over a deep copy of the parent chip;
//! the shared status board is the only memory common to workers, and
//! everything else flows through on-disk manifests.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Local;
use fab_core::{paths, Chip};
use log::{error, info, warn};

use crate::builtins;
use crate::check;
use crate::logscan;
use crate::record;
use crate::task_id;
use crate::tools::Registry;
use crate::FlowError;
use crate::Task;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-task `active`/`error` bits shared across workers. Each key is a
/// task id; reads and writes are atomic per key.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<HashMap<String, (bool, bool)>>,
}

impl StatusBoard {
    pub fn new() -> StatusBoard {
        StatusBoard::default()
    }

    pub fn seed(&self, id: &str, active: bool, error: bool) {
        self.inner
            .lock()
            .expect("status board lock")
            .insert(id.to_string(), (active, error));
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("status board lock")
            .get(id)
            .map(|(active, _)| *active)
            .unwrap_or(false)
    }

    pub fn has_error(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("status board lock")
            .get(id)
            .map(|(_, error)| *error)
            .unwrap_or(false)
    }

    /// Record a worker's terminal state: error bit first, then the
    /// active bit that releases downstream waiters.
    pub fn publish(&self, id: &str, error: bool) {
        self.inner
            .lock()
            .expect("status board lock")
            .insert(id.to_string(), (false, error));
    }
}

/// Pluggable deferral callback for cluster schedulers. The hook owns
/// task completion: it must publish the task's bits before returning.
pub type DeferHook =
    dyn Fn(&mut Chip, &str, &str, &StatusBoard) -> Result<(), FlowError> + Send + Sync;

fn halt(step: &str, index: &str, reason: impl Into<String>) -> FlowError {
    let reason = reason.into();
    error!("halting step '{}' index '{}': {}", step, index, reason);
    FlowError::Halt(reason)
}

/// Stage collected files for the import step: every `copy`-flagged file
/// lands in `inputs/` under its staged name, then links into `outputs/`
/// minus whatever the tool itself will produce and the manifest.
pub fn collect(chip: &Chip, flow: &str, step: &str, index: &str, workdir: &Path) -> Result<(), FlowError> {
    let indir = workdir.join("inputs");
    fs::create_dir_all(&indir)?;

    info!("collecting input sources");
    for path in chip.collect_paths() {
        let name = paths::imported_filename(&path);
        match chip.find_sc_file(&path, false) {
            Some(abspath) => {
                info!("copying {} into inputs", abspath.display());
                fs::copy(&abspath, indir.join(name))?;
            }
            None => return Err(halt(step, index, format!("input file {} not found", path))),
        }
    }

    let outdir = workdir.join("outputs");
    fs::create_dir_all(&outdir)?;

    let tool = chip
        .get_str(&["flowgraph", flow, step, index, "tool"])
        .unwrap_or_default();
    if !builtins::is_builtin(&tool) {
        // link staged files through to outputs so import tools don't have to
        let mut ignore = chip.get_strings(&["eda", &tool, "output", step, index]);
        let design = chip.get_str(&["design"]).unwrap_or_default();
        ignore.push(format!("{}.pkg.json", design));
        paths::copytree(&indir, &outdir, &ignore, true)?;
    } else if tool != "join" && tool != "nop" {
        return Err(halt(step, index, format!("invalid import step builtin {}", tool)));
    }
    Ok(())
}

fn tool_exe(chip: &Chip, tool: &str) -> Option<String> {
    let exe = chip.get_str(&["eda", tool, "exe"])?;
    let joined = match chip.get_str(&["eda", tool, "path"]) {
        Some(path) if !path.is_empty() => format!("{}/{}", path, exe),
        _ => exe,
    };
    Some(paths::resolve_env_vars(&joined))
}

/// Environment exported to the child process: global `env` parameters,
/// design `param` values, license servers, and per-task tool variables.
fn task_env(chip: &Chip, tool: &str, step: &str, index: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in chip.getkeys(&["env"]) {
        if let Some(value) = chip.get_str(&["env", &key]) {
            env.insert(key, value);
        }
    }
    for key in chip.getkeys(&["param"]) {
        if let Some(value) = chip.get_str(&["param", &key]) {
            env.insert(key, value);
        }
    }
    for name in chip.getkeys(&["eda", tool, "licenseserver"]) {
        let servers = chip.get_strings(&["eda", tool, "licenseserver", &name]);
        if !servers.is_empty() {
            env.insert(name, servers.join(":"));
        }
    }
    for name in chip.getkeys(&["eda", tool, "env", step, index]) {
        if let Some(value) = chip.get_str(&["eda", tool, "env", step, index, &name]) {
            env.insert(name, value);
        }
    }
    env
}

/// Build the command line for an external tool and write the matching
/// `replay.sh` into the work directory.
fn make_cmd(
    chip: &Chip,
    registry: &Registry,
    tool: &str,
    step: &str,
    index: &str,
    workdir: &Path,
    env: &BTreeMap<String, String>,
) -> Result<Vec<String>, FlowError> {
    let exe = tool_exe(chip, tool)
        .ok_or_else(|| halt(step, index, format!("no executable for tool {}", tool)))?;

    let mut cmdline = vec![exe];
    for option in chip.get_strings(&["eda", tool, "option", step, index]) {
        cmdline.extend(
            shell_words::split(&option)
                .map_err(|e| halt(step, index, format!("bad tool option: {}", e)))?,
        );
    }
    for script in chip
        .find_files(&["eda", tool, "script", step, index], false)
        .into_iter()
        .flatten()
    {
        cmdline.push(script.display().to_string());
    }
    if let Some(adapter) = registry.tool(tool) {
        cmdline.extend(adapter.runtime_options(chip));
    }

    let replay = workdir.join("replay.sh");
    let mut script = File::create(&replay)?;
    writeln!(script, "#!/bin/bash")?;
    for (key, value) in env {
        writeln!(script, "export {}={}", key, value)?;
    }
    writeln!(script, "{}", shell_words::join(&cmdline))?;
    drop(script);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&replay, fs::Permissions::from_mode(0o755))?;
    }

    Ok(cmdline)
}

/// Probe the tool version through its `vswitch` and enforce the declared
/// allow-list when `vercheck` is on.
fn check_version(
    chip: &Chip,
    registry: &Registry,
    tool: &str,
    step: &str,
    index: &str,
) -> Result<Option<String>, FlowError> {
    let vswitch = chip.get_strings(&["eda", tool, "vswitch"]);
    let Some(exe) = tool_exe(chip, tool) else {
        return Ok(None);
    };
    if vswitch.is_empty() {
        return Ok(None);
    }

    let output = Command::new(&exe)
        .args(&vswitch)
        .output()
        .map_err(|e| halt(step, index, format!("version probe of {} failed: {}", exe, e)))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let Some(adapter) = registry.tool(tool) else {
        return Err(halt(step, index, format!("tool {} has no adapter", tool)));
    };
    let Some(version) = adapter.parse_version(&text) else {
        return Err(halt(step, index, format!("tool {} does not parse a version", tool)));
    };
    info!("tool '{}' found with version '{}'", exe, version);

    if chip.get_bool(&["vercheck"]) {
        let allowed = chip.get_strings(&["eda", tool, "version"]);
        if !allowed.is_empty() && !allowed.contains(&version) {
            error!(
                "version check failed for {}: found {}, expected one of [{}]",
                tool,
                version,
                allowed.join(", ")
            );
            return Err(halt(step, index, "tool version not allowed"));
        }
    }
    Ok(Some(version))
}

/// Run the tool command under a shell with the log captured, tailed to
/// stdout unless quiet, and the configured timeout enforced.
fn execute(
    cmdline: &[String],
    env: &BTreeMap<String, String>,
    workdir: &Path,
    step: &str,
    index: &str,
    timeout: Option<f64>,
    quiet: bool,
    interactive: bool,
) -> Result<i32, FlowError> {
    let cmdstr = shell_words::join(cmdline);
    info!("running in {}", workdir.display());
    info!("{}", cmdstr);

    let logpath = workdir.join(format!("{}.log", step));
    let mut command = Command::new("sh");
    command.arg("-c").arg(&cmdstr).current_dir(workdir).envs(env);

    if interactive {
        // breakpoint step: hand the terminal to the tool so it can prompt
        fs::write(&logpath, "interactive session; output not captured\n")?;
        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let status = command.status()?;
        return Ok(status.code().unwrap_or(1));
    }

    let log_out = File::create(&logpath)?;
    let log_err = log_out.try_clone()?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_out))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // own process group so a timeout can take down the whole tree
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))?;
                Ok(())
            });
        }
    }

    let started = Instant::now();
    let mut child = command.spawn()?;
    let mut tail = File::open(&logpath)?;
    let mut buffer = String::new();

    loop {
        if let Some(status) = child.try_wait()? {
            if !quiet {
                buffer.clear();
                tail.read_to_string(&mut buffer)?;
                print!("{}", buffer);
            }
            return Ok(status.code().unwrap_or(1));
        }
        if !quiet {
            buffer.clear();
            tail.read_to_string(&mut buffer)?;
            print!("{}", buffer);
        }
        if let Some(limit) = timeout {
            if started.elapsed().as_secs_f64() > limit {
                error!("step timed out after {} seconds", limit);
                #[cfg(unix)]
                {
                    let _ = nix::sys::signal::killpg(
                        nix::unistd::Pid::from_raw(child.id() as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
                let _ = child.kill();
                let _ = child.wait();
                return Err(halt(step, index, "timeout exceeded"));
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Execute one `(step, index)` task end to end. The caller publishes the
/// terminal bits; this function only reports success or failure.
pub fn run_task(
    chip: &mut Chip,
    registry: &Registry,
    step: &str,
    index: &str,
    board: &StatusBoard,
    defer: Option<&DeferHook>,
) -> Result<(), FlowError> {
    let design = chip
        .get_str(&["design"])
        .ok_or_else(|| halt(step, index, "design not set"))?;
    let flow = chip
        .get_str(&["flow"])
        .ok_or_else(|| halt(step, index, "flow not set"))?;
    let tool = chip
        .get_str(&["flowgraph", &flow, step, index, "tool"])
        .ok_or_else(|| halt(step, index, "task has no tool"))?;
    let is_builtin = builtins::is_builtin(&tool);
    let bkpt = cfg!(unix) && chip.get_strings(&["bkpt"]).iter().any(|s| s == step);
    let quiet = chip.get_bool(&["quiet"]) && !bkpt;
    let inputs = chip.get_pairs(&["flowgraph", &flow, step, index, "input"]);

    // wait until every upstream task has published completion
    info!("waiting for inputs...");
    loop {
        let pending = inputs
            .iter()
            .any(|(s, i)| board.is_active(&task_id(s, i)));
        if !pending {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let wall_start = Instant::now();
    let record_start = Local::now();

    // hand the task to a cluster scheduler when one is configured
    if chip.get_str(&["jobscheduler"]).is_some() && !inputs.is_empty() {
        if let Some(hook) = defer {
            return hook(chip, step, index, board);
        }
        warn!("jobscheduler set but no deferral hook installed; running locally");
    }

    // fresh, isolated work directory
    let job = chip.get_str(&["jobname"]).unwrap_or_else(|| "job0".to_string());
    let in_job = chip
        .get_str(&["jobinput", &job, step, index])
        .unwrap_or_else(|| job.clone());
    let workdir = chip.workdir(None, Some(step), index);
    if workdir.is_dir() {
        fs::remove_dir_all(&workdir)?;
    }
    fs::create_dir_all(workdir.join("inputs"))?;
    fs::create_dir_all(workdir.join("outputs"))?;
    fs::create_dir_all(workdir.join("reports"))?;

    // fan in upstream manifests; the local configuration wins
    for (in_step, in_index) in &inputs {
        let upstream_error = board.has_error(&task_id(in_step, in_index));
        chip.set(
            &["flowstatus", in_step, in_index, "error"],
            if upstream_error { 1 } else { 0 },
        );
        if !upstream_error {
            let manifest = chip
                .workdir(Some(&in_job), Some(in_step), in_index)
                .join("outputs")
                .join(format!("{}.pkg.json", design));
            chip.read_manifest(&manifest, None, true, false)
                .map_err(|e| halt(step, index, format!("cannot merge upstream manifest: {}", e)))?;
        }
    }

    chip.set(&["arg", "step"], Option::<String>::None);
    chip.set(&["arg", "index"], Option::<String>::None);

    for metric in chip.getkeys(&["metric", "default", "default"]) {
        chip.set(&["metric", step, index, &metric, "real"], 0.0);
    }

    // input selection through the task's builtin
    let node: Task = (step.to_string(), index.to_string());
    let args = chip.get_strings(&["flowgraph", &flow, step, index, "args"]);
    let sel_inputs: Vec<Task> = if is_builtin {
        info!("running built in task '{}'", tool);
        match tool.as_str() {
            "minimum" | "maximum" => {
                let (score, winner) = if tool == "minimum" {
                    builtins::minimum(chip, &flow, &node, &inputs)
                } else {
                    builtins::maximum(chip, &flow, &node, &inputs)
                };
                match winner {
                    Some(task) => {
                        info!("selected {}{} with score {:.2}", task.0, task.1, score);
                        vec![task]
                    }
                    None => return Err(halt(step, index, "no inputs selected")),
                }
            }
            "mux" => match builtins::mux(chip, &flow, &node, &inputs, &args) {
                (_, Some(task)) => vec![task],
                (_, None) => return Err(halt(step, index, "no inputs selected")),
            },
            "verify" => {
                if !builtins::verify(chip, &inputs, &args) {
                    return Err(halt(step, index, "verification assertions failed"));
                }
                inputs.clone()
            }
            "join" => builtins::join_tasks(&inputs),
            "nop" => builtins::nop(&inputs),
            _ => unreachable!("builtin list is closed"),
        }
    } else {
        inputs.clone()
    };
    chip.set(&["flowstatus", step, index, "select"], sel_inputs.clone());

    // stage inputs: import collects, everything else links upstream outputs
    if step == "import" {
        collect(chip, &flow, step, index, &workdir)?;
    }
    let staged: Vec<Task> = if sel_inputs.is_empty() { inputs.clone() } else { sel_inputs };
    for (in_step, in_index) in &staged {
        if chip.get_int(&["flowstatus", in_step, in_index, "error"]) == Some(1) {
            return Err(halt(
                step,
                index,
                format!("halting due to previous error in {}{}", in_step, in_index),
            ));
        }
        let upstream_outputs = chip
            .workdir(Some(&in_job), Some(in_step), in_index)
            .join("outputs");
        paths::copytree(
            &upstream_outputs,
            &workdir.join("inputs"),
            &[format!("{}.pkg.json", design)],
            true,
        )?;
    }

    // reference scripts
    if !is_builtin && chip.get_bool(&["eda", &tool, "copy"]) {
        for refdir in chip
            .find_files(&["eda", &tool, "refdir", step, index], false)
            .into_iter()
            .flatten()
        {
            paths::copytree(&refdir, &workdir, &[], false)?;
        }
    }

    chip.set(&["arg", "step"], step);
    chip.set(&["arg", "index"], index);

    if !chip.get_bool(&["skipcheck"]) {
        check::check_manifest(chip).map_err(|e| halt(step, index, format!("{}", e)))?;
    }

    if !is_builtin {
        if let Some(adapter) = registry.tool(&tool) {
            adapter
                .pre_process(chip)
                .map_err(|e| halt(step, index, format!("pre-processing failed: {}", e)))?;
        }
    }

    let env = task_env(chip, &tool, step, index);

    let toolversion = if !is_builtin {
        check_version(chip, registry, &tool, step, index)?
    } else {
        None
    };

    // manifest for the tool to source; absolute paths, and TCL keeps
    // empty lists so scripts can index blindly
    if let Some(format) = chip.get_str(&["eda", &tool, "format"]) {
        let prune = format != "tcl";
        chip.write_manifest(&workdir.join(format!("sc_manifest.{}", format)), prune, true)
            .map_err(|e| halt(step, index, format!("cannot write tool manifest: {}", e)))?;
    }

    let exe_start = Instant::now();
    if is_builtin {
        paths::copytree(&workdir.join("inputs"), &workdir.join("outputs"), &[], true)?;
    } else if !chip.get_bool(&["skipall"]) {
        let cmdline = make_cmd(chip, registry, &tool, step, index, &workdir, &env)?;
        let timeout = chip.get_float(&["flowgraph", &flow, step, index, "timeout"]);
        let retcode = execute(&cmdline, &env, &workdir, step, index, timeout, quiet, bkpt)?;
        if retcode != 0 {
            warn!(
                "command failed with code {}, see log {}",
                retcode,
                workdir.join(format!("{}.log", step)).display()
            );
            if !chip.get_bool(&["eda", &tool, "continue"]) {
                return Err(halt(step, index, "tool returned non-zero exit status"));
            }
        }
    }
    let exetime = (exe_start.elapsed().as_secs_f64() * 100.0).round() / 100.0;
    chip.set(&["metric", step, index, "exetime", "real"], exetime);

    if !is_builtin && !chip.get_bool(&["skipall"]) {
        if let Some(adapter) = registry.tool(&tool) {
            adapter
                .post_process(chip)
                .map_err(|e| halt(step, index, format!("post-processing failed: {}", e)))?;
        }
        logscan::check_logfile(chip, &workdir, &tool, step, index, !quiet)?;
    }

    if chip.get_bool(&["hash"]) && !is_builtin {
        chip.hash_files(&["eda", &tool, "output", step, index]);
        for item in chip.get_strings(&["eda", &tool, "require", step, index]) {
            let keypath: Vec<&str> = item.split(',').collect();
            let is_file = chip
                .get_field(&keypath, "type")
                .as_str()
                .map(|t| t.contains("file"))
                .unwrap_or(false);
            if is_file {
                chip.hash_files(&keypath);
            }
        }
        if chip.has_error() {
            return Err(halt(step, index, "file hash mismatch"));
        }
    }

    let tasktime = (wall_start.elapsed().as_secs_f64() * 100.0).round() / 100.0;
    chip.set(&["metric", step, index, "tasktime", "real"], tasktime);

    if chip.get_bool(&["track"]) {
        record::make_record(
            chip,
            &job,
            step,
            index,
            record_start,
            Local::now(),
            toolversion.as_deref(),
        );
    }

    chip.set(&["flowstatus", step, index, "error"], 0);
    chip.set(&["arg", "step"], Option::<String>::None);
    chip.set(&["arg", "index"], Option::<String>::None);

    chip.write_manifest(
        &workdir.join("outputs").join(format!("{}.pkg.json", design)),
        true,
        false,
    )
    .map_err(|e| halt(step, index, format!("cannot write manifest: {}", e)))?;

    if chip.get_bool(&["clean"]) {
        // staged inputs are recoverable from the upstream output trees
        let _ = fs::remove_dir_all(workdir.join("inputs"));
    }

    Ok(())
}

/// Worker entry point: runs the task, absorbs panics, and publishes the
/// terminal `error`/`active` bits exactly once.
pub fn run_task_safe(
    mut chip: Chip,
    registry: &Registry,
    step: &str,
    index: &str,
    board: &StatusBoard,
    defer: Option<&DeferHook>,
) -> bool {
    let job = chip.get_str(&["jobname"]).unwrap_or_else(|| "job0".to_string());
    fab_core::logging::set_task(&job, step, index);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_task(&mut chip, registry, step, index, board, defer)
    }));

    let failed = match outcome {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!("{}", e);
            true
        }
        Err(_) => {
            error!("uncaught panic while running step {}", step);
            true
        }
    };
    board.publish(&task_id(step, index), failed);
    fab_core::logging::clear_task();
    failed
}
