//! `fab` command line front-end.
//!
//! Thin wrapper over the engine: schema parameters surface as long
//! switches, compiler-style short forms are pre-tokenized, and switches
//! apply in a fixed startup order (design, loglevel, mode, arg step,
//! target, cfg manifests, then everything else).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use fab_core::Chip;
use fab_flow::orchestrator;
use fab_flow::tools::Registry;

#[derive(Parser, Debug)]
#[command(name = "fab", disable_version_flag = true, disable_help_flag = false)]
struct Cli {
    /// Name of the top level design
    #[arg(long)]
    design: Option<String>,

    /// Logging verbosity (debug/info/warning/error)
    #[arg(long)]
    loglevel: Option<String>,

    /// Compilation mode (asic or fpga)
    #[arg(long)]
    mode: Option<String>,

    /// Restrict the run to a single step
    #[arg(long = "arg_step")]
    arg_step: Option<String>,

    /// Restrict the run to a single index
    #[arg(long = "arg_index")]
    arg_index: Option<String>,

    /// Compilation target loaded at startup
    #[arg(long)]
    target: Option<String>,

    /// Flowgraph to execute
    #[arg(long)]
    flow: Option<String>,

    /// Manifest files merged at startup (repeatable)
    #[arg(long)]
    cfg: Vec<PathBuf>,

    /// Job directory name
    #[arg(long)]
    jobname: Option<String>,

    /// Build directory root
    #[arg(long)]
    dir: Option<String>,

    /// Steps to execute (repeatable)
    #[arg(long)]
    steplist: Vec<String>,

    /// Design source files (repeatable)
    #[arg(long)]
    source: Vec<String>,

    /// Optimization mode (-O0..-O3)
    #[arg(long)]
    optmode: Option<String>,

    /// Preprocessor-style defines (-DNAME=value)
    #[arg(long)]
    define: Vec<String>,

    /// Simulator-style plusargs (+name+value)
    #[arg(long)]
    plusarg: Vec<String>,

    #[arg(long)]
    quiet: bool,

    #[arg(long)]
    jobincr: bool,

    #[arg(long)]
    track: bool,

    #[arg(long)]
    hash: bool,

    #[arg(long)]
    vercheck: bool,

    #[arg(long)]
    skipcheck: bool,

    /// Print the version and exit
    #[arg(long)]
    version: bool,
}

/// Rewrite the raw argument list into plain long switches: single-dash
/// schema switches become double-dash, and the compiler-like short forms
/// `-O<n>`, `-DNAME=v` and `+arg+value` expand to their parameters.
fn pretokenize(args: impl Iterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    for arg in args {
        if let Some(plusarg) = arg.strip_prefix('+') {
            out.push("--plusarg".to_string());
            out.push(plusarg.to_string());
        } else if arg.starts_with("-O") && arg.len() > 2 && !arg.starts_with("--") {
            out.push("--optmode".to_string());
            out.push(arg[1..].to_string());
        } else if arg.starts_with("-D") && arg.len() > 2 && !arg.starts_with("--") {
            out.push("--define".to_string());
            out.push(arg[2..].to_string());
        } else if arg.starts_with('-') && !arg.starts_with("--") && arg.len() > 2 {
            out.push(format!("-{}", arg));
        } else {
            out.push(arg);
        }
    }
    out
}

fn main() -> Result<()> {
    // stable report widths regardless of the hosting terminal
    std::env::set_var("COLUMNS", "80");

    let mut raw = std::env::args();
    let argv0 = raw.next().unwrap_or_else(|| "fab".to_string());
    let mut args = pretokenize(raw);
    args.insert(0, argv0);
    let cli = Cli::parse_from(args);

    if cli.version {
        println!("fab {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let registry = Arc::new(Registry::new());
    let mut chip = Chip::new(cli.design.as_deref());

    // fixed startup order
    if let Some(loglevel) = &cli.loglevel {
        chip.set(&["loglevel"], loglevel.as_str());
    }
    if let Some(mode) = &cli.mode {
        chip.set(&["mode"], mode.as_str());
    }
    if let Some(step) = &cli.arg_step {
        chip.set(&["arg", "step"], step.as_str());
    }
    if let Some(index) = &cli.arg_index {
        chip.set(&["arg", "index"], index.as_str());
    }
    if let Some(target) = &cli.target {
        chip.set(&["target"], target.as_str());
        if let Err(e) = registry.load_target(&mut chip, target) {
            bail!("cannot load target '{}': {}", target, e);
        }
    }
    for cfg in &cli.cfg {
        chip.add(&["cfg"], cfg.display().to_string());
        if let Err(e) = chip.read_manifest(cfg, None, true, true) {
            bail!("cannot read manifest {}: {}", cfg.display(), e);
        }
    }

    // remaining switches
    if let Some(flow) = &cli.flow {
        chip.set(&["flow"], flow.as_str());
    }
    if let Some(jobname) = &cli.jobname {
        chip.set(&["jobname"], jobname.as_str());
    }
    if let Some(dir) = &cli.dir {
        chip.set(&["dir"], dir.as_str());
    }
    for step in &cli.steplist {
        chip.add(&["steplist"], step.as_str());
    }
    for source in &cli.source {
        chip.add(&["source"], source.as_str());
    }
    if let Some(optmode) = &cli.optmode {
        chip.set(&["optmode"], optmode.as_str());
    }
    for define in &cli.define {
        chip.add(&["define"], define.as_str());
    }
    for plusarg in &cli.plusarg {
        chip.add(&["plusarg"], plusarg.as_str());
    }
    for (key, enabled) in [
        ("quiet", cli.quiet),
        ("jobincr", cli.jobincr),
        ("track", cli.track),
        ("hash", cli.hash),
        ("vercheck", cli.vercheck),
        ("skipcheck", cli.skipcheck),
    ] {
        if enabled {
            chip.set(&[key], true);
        }
    }

    if chip.has_error() {
        bail!("invalid command line configuration");
    }
    if chip.get_str(&["flow"]).is_none() {
        bail!("no flow configured; pass -flow or -target");
    }

    match orchestrator::run(&mut chip, &registry) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(args: &[&str]) -> Vec<String> {
        pretokenize(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_single_dash_switch_promotion() {
        assert_eq!(tokens(&["-design", "top"]), vec!["--design", "top"]);
    }

    #[test]
    fn test_optmode_short_form() {
        assert_eq!(tokens(&["-O3"]), vec!["--optmode", "O3"]);
    }

    #[test]
    fn test_define_short_form() {
        assert_eq!(tokens(&["-DCFG_TARGET=45"]), vec!["--define", "CFG_TARGET=45"]);
    }

    #[test]
    fn test_plusarg_form() {
        assert_eq!(tokens(&["+verbose+2"]), vec!["--plusarg", "verbose+2"]);
    }

    #[test]
    fn test_double_dash_untouched() {
        assert_eq!(tokens(&["--design", "top"]), vec!["--design", "top"]);
    }
}
