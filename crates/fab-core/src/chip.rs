//! The `Chip` object: owner of the configuration schema, the error
//! latch, and the filesystem context of one compilation.
//!
//! Accessor errors follow a fixed policy: the failure is logged, the
//! object-wide error flag latches, and the call returns a neutral value.
//! The latch is one-way for the life of the object; the orchestrator is
//! the only caller that deliberately resets it before re-checking.

use std::cell::Cell as StdCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::defaults;
use crate::error::SchemaError;
use crate::hash;
use crate::logging;
use crate::manifest;
use crate::paths;
use crate::schema::{Node, Param};
use crate::value::{CellInput, Value};

#[derive(Clone)]
pub struct Chip {
    cfg: Node,
    history: BTreeMap<String, Node>,
    error: StdCell<bool>,
    cwd: PathBuf,
    root: PathBuf,
}

fn join(keypath: &[&str]) -> String {
    keypath.join(",")
}

/// Read-only descent that falls through `default` templates for missing
/// keys, so reads of never-written dynamic keys see the template's
/// (empty) state instead of failing.
fn lookup_ro<'a>(mut node: &'a Node, keypath: &[&str]) -> Result<&'a Node, SchemaError> {
    for (i, seg) in keypath.iter().enumerate() {
        let map = node
            .as_branch()
            .ok_or_else(|| SchemaError::NotABranch(join(&keypath[..i])))?;
        node = map
            .get(*seg)
            .or_else(|| map.get("default"))
            .ok_or_else(|| SchemaError::UnknownKeypath(join(keypath)))?;
    }
    Ok(node)
}

impl Chip {
    pub fn new(design: Option<&str>) -> Chip {
        logging::init();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let root = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| cwd.clone());
        let mut chip = Chip {
            cfg: defaults::schema_cfg(),
            history: BTreeMap::new(),
            error: StdCell::new(false),
            cwd,
            root,
        };
        if let Some(name) = design {
            chip.set(&["design"], name);
        }
        if let Some(level) = chip.get_str(&["loglevel"]) {
            logging::set_level(&level);
        }
        chip
    }

    // --- Error latch ---

    pub fn has_error(&self) -> bool {
        self.error.get()
    }

    pub fn raise_error(&self) {
        self.error.set(true);
    }

    /// Drop the latch. Reserved for the orchestrator's pre-run recheck.
    pub fn reset_error(&self) {
        self.error.set(false);
    }

    fn fail(&self, e: &SchemaError) {
        error!("{}", e);
        self.error.set(true);
    }

    // --- Schema access ---

    pub fn get(&self, keypath: &[&str]) -> Value {
        self.get_field(keypath, "value")
    }

    pub fn get_field(&self, keypath: &[&str], field: &str) -> Value {
        debug!("reading from [{}], field '{}'", join(keypath), field);
        let read = lookup_ro(&self.cfg, keypath)
            .and_then(|node| {
                node.as_param()
                    .ok_or_else(|| SchemaError::NotAParam(join(keypath)))
            })
            .and_then(|param| param.read_field(field, &join(keypath)));
        match read {
            Ok(value) => value,
            Err(e) => {
                self.fail(&e);
                Value::Null
            }
        }
    }

    /// Read from a completed job's snapshot instead of the live schema.
    pub fn get_job(&self, job: &str, keypath: &[&str]) -> Value {
        let Some(cfg) = self.history.get(job) else {
            self.fail(&SchemaError::UnknownJob(job.to_string()));
            return Value::Null;
        };
        let read = lookup_ro(cfg, keypath)
            .and_then(|node| {
                node.as_param()
                    .ok_or_else(|| SchemaError::NotAParam(join(keypath)))
            })
            .and_then(|param| param.read(&join(keypath)));
        match read {
            Ok(value) => value,
            Err(e) => {
                self.fail(&e);
                Value::Null
            }
        }
    }

    pub fn get_str(&self, keypath: &[&str]) -> Option<String> {
        self.get(keypath).as_str().map(str::to_string)
    }

    pub fn get_bool(&self, keypath: &[&str]) -> bool {
        self.get(keypath).as_bool()
    }

    pub fn get_int(&self, keypath: &[&str]) -> Option<i64> {
        self.get(keypath).as_int()
    }

    pub fn get_float(&self, keypath: &[&str]) -> Option<f64> {
        self.get(keypath).as_float()
    }

    pub fn get_strings(&self, keypath: &[&str]) -> Vec<String> {
        self.get(keypath).strings()
    }

    pub fn get_pairs(&self, keypath: &[&str]) -> Vec<(String, String)> {
        self.get(keypath).pairs()
    }

    /// Immediate child keys under a keypath, `default` excluded.
    pub fn getkeys(&self, keypath: &[&str]) -> Vec<String> {
        match lookup_ro(&self.cfg, keypath)
            .and_then(|node| node.child_keys(&[]))
        {
            Ok(keys) => keys,
            Err(e) => {
                self.fail(&e);
                Vec::new()
            }
        }
    }

    /// Every leaf keypath in the schema, templates included.
    pub fn allkeys(&self) -> Vec<Vec<String>> {
        self.cfg.allkeys()
    }

    /// Deep copy of the subtree at a keypath.
    pub fn getdict(&self, keypath: &[&str]) -> Option<Node> {
        match self.cfg.lookup(keypath) {
            Ok(node) => Some(node.clone()),
            Err(e) => {
                self.fail(&e);
                None
            }
        }
    }

    /// Whether a keypath names a known parameter. With `default_valid`,
    /// `default` segments in the schema act as wildcards.
    pub fn valid(&self, keypath: &[&str], default_valid: bool) -> bool {
        for known in self.cfg.allkeys() {
            if known.len() != keypath.len() {
                continue;
            }
            let matched = known.iter().zip(keypath.iter()).all(|(schema_seg, seg)| {
                schema_seg == seg || (default_valid && schema_seg == "default")
            });
            if matched {
                return true;
            }
        }
        false
    }

    pub fn set(&mut self, keypath: &[&str], value: impl Into<CellInput>) {
        self.set_clobber(keypath, value, true);
    }

    pub fn set_clobber(&mut self, keypath: &[&str], value: impl Into<CellInput>, clobber: bool) {
        let input = value.into();
        // keep the active logger in sync with the schema immediately
        if keypath.len() == 1 && keypath[0] == "loglevel" {
            if let CellInput::One(level) = &input {
                logging::set_level(level);
            }
        }
        debug!("setting [{}]", join(keypath));
        let result = self
            .cfg
            .param_mut(keypath)
            .and_then(|param| param.write_value(input, clobber, &join(keypath)));
        if let Err(e) = result {
            self.fail(&e);
        }
    }

    pub fn set_field(&mut self, keypath: &[&str], field: &str, value: impl Into<CellInput>) {
        let result = self
            .cfg
            .param_mut(keypath)
            .and_then(|param| param.write_field(field, value.into(), &join(keypath)));
        if let Err(e) = result {
            self.fail(&e);
        }
    }

    pub fn add(&mut self, keypath: &[&str], value: impl Into<CellInput>) {
        debug!("appending to [{}]", join(keypath));
        let result = self
            .cfg
            .param_mut(keypath)
            .and_then(|param| param.append_value(value.into(), &join(keypath)));
        if let Err(e) = result {
            self.fail(&e);
        }
    }

    pub fn add_field(&mut self, keypath: &[&str], field: &str, value: impl Into<CellInput>) {
        let result = self
            .cfg
            .param_mut(keypath)
            .and_then(|param| param.append_field(field, value.into(), &join(keypath)));
        if let Err(e) = result {
            self.fail(&e);
        }
    }

    /// True when neither value nor default is set for the parameter.
    pub fn keypath_empty(&self, keypath: &[&str]) -> bool {
        match lookup_ro(&self.cfg, keypath).ok().and_then(Node::as_param) {
            Some(param) => param.value.is_empty() && param.defvalue.is_empty(),
            None => true,
        }
    }

    pub(crate) fn param(&self, keypath: &[&str]) -> Option<&Param> {
        lookup_ro(&self.cfg, keypath).ok().and_then(Node::as_param)
    }

    // --- Filesystem context ---

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Work directory `<dir>/<design>/<jobname>[/<step>/<index>]`,
    /// absolute against the launch directory.
    pub fn workdir(&self, jobname: Option<&str>, step: Option<&str>, index: &str) -> PathBuf {
        let job = jobname
            .map(str::to_string)
            .or_else(|| self.get_str(&["jobname"]))
            .unwrap_or_else(|| "job0".to_string());
        let builddir = self.get_str(&["dir"]).unwrap_or_else(|| "build".to_string());
        let design = self.get_str(&["design"]).unwrap_or_default();
        let mut path = self.cwd.join(builddir).join(design).join(job);
        if let Some(step) = step {
            path = path.join(step).join(index);
        }
        path
    }

    /// Resolve a logical filename to an absolute path: `$VAR` expansion,
    /// then pass-through for absolute/cwd-relative hits, then the search
    /// roots (install root, cwd, `scpath`, `$SCPATH`).
    pub fn find_sc_file(&self, filename: &str, missing_ok: bool) -> Option<PathBuf> {
        let expanded = paths::resolve_env_vars(filename);
        let direct = if Path::new(&expanded).is_absolute() {
            PathBuf::from(&expanded)
        } else {
            self.cwd.join(&expanded)
        };
        if direct.exists() {
            return Some(direct);
        }

        let mut searchdirs = vec![self.root.clone(), self.cwd.clone()];
        for entry in self.get_strings(&["scpath"]) {
            searchdirs.push(PathBuf::from(entry));
        }
        if let Ok(scpath) = std::env::var("SCPATH") {
            for entry in scpath.split(':') {
                if !entry.is_empty() {
                    searchdirs.push(PathBuf::from(entry));
                }
            }
        }

        for dir in searchdirs {
            let base = if dir.is_absolute() { dir } else { self.cwd.join(dir) };
            let candidate = base.join(&expanded);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        if !missing_ok {
            self.fail(&SchemaError::FileNotFound(filename.to_string()));
        }
        None
    }

    /// Absolute paths for a file/dir parameter, one entry per item (None
    /// when unresolved). Tool `input`/`output` declarations resolve
    /// against the task work directory; `copy` parameters resolve against
    /// their staged import names first.
    pub fn find_files(&self, keypath: &[&str], missing_ok: bool) -> Vec<Option<PathBuf>> {
        let keypathstr = join(keypath);
        let Some(param) = self.param(keypath) else {
            self.fail(&SchemaError::UnknownKeypath(keypathstr));
            return Vec::new();
        };
        let ty = match param.schema_type() {
            Ok(ty) => ty,
            Err(e) => {
                self.fail(&e);
                return Vec::new();
            }
        };
        if !ty.is_file() && !ty.is_dir() {
            self.fail(&SchemaError::NotAFileParam(keypathstr));
            return Vec::new();
        }

        let items = match self.get(keypath) {
            Value::Str(s) => vec![s],
            Value::StrList(items) => items,
            _ => Vec::new(),
        };

        // tool input/output filenames live in the task work directory
        if keypath.first() == Some(&"eda")
            && keypath.len() >= 5
            && matches!(keypath[2], "input" | "output")
        {
            let iodir = self
                .workdir(None, Some(keypath[3]), keypath[4])
                .join(format!("{}s", keypath[2]));
            return items
                .iter()
                .map(|name| {
                    let path = iodir.join(name);
                    path.is_file().then_some(path)
                })
                .collect();
        }

        let staged = (self.get_bool(&["copyall"]) || param.copy_flag()) && ty.is_file();
        items
            .iter()
            .map(|item| {
                if staged {
                    let name = paths::imported_filename(item);
                    let path = self
                        .workdir(None, Some("import"), "0")
                        .join("outputs")
                        .join(name);
                    if path.is_file() {
                        return Some(path);
                    }
                }
                self.find_sc_file(item, missing_ok)
            })
            .collect()
    }

    /// Scalar convenience over `find_files`.
    pub fn find_file(&self, keypath: &[&str], missing_ok: bool) -> Option<PathBuf> {
        self.find_files(keypath, missing_ok).into_iter().flatten().next()
    }

    /// Absolute path of a result file
    /// `<workdir>/outputs/<design>.<filetype>`, latching when missing.
    pub fn find_result(&self, filetype: &str, step: &str, index: &str) -> Option<PathBuf> {
        let design = self.get_str(&["design"]).unwrap_or_default();
        let path = self
            .workdir(None, Some(step), index)
            .join("outputs")
            .join(format!("{}.{}", design, filetype));
        if path.is_file() {
            Some(path)
        } else {
            self.raise_error();
            None
        }
    }

    /// Every path that the import step will stage: values of file
    /// parameters with `copy` set, or all file parameters under
    /// `copyall`.
    pub fn collect_paths(&self) -> Vec<String> {
        let copyall = self.get_bool(&["copyall"]);
        let mut out = Vec::new();
        for kp in self.cfg.allkeys() {
            if kp.iter().any(|seg| seg == "default") {
                continue;
            }
            let refs: Vec<&str> = kp.iter().map(String::as_str).collect();
            let Some(param) = self.param(&refs) else { continue };
            let is_file = param.schema_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file && (copyall || param.copy_flag()) {
                out.extend(self.get(&refs).strings());
            }
        }
        out
    }

    /// Compute content hashes for a file parameter and store them in its
    /// `filehash` field. A mismatch against previously recorded hashes
    /// latches the error flag.
    pub fn hash_files(&mut self, keypath: &[&str]) -> Vec<String> {
        let keypathstr = join(keypath);
        let is_file = self
            .param(keypath)
            .and_then(|p| p.schema_type().ok())
            .map(|t| t.is_file())
            .unwrap_or(false);
        if !is_file {
            self.fail(&SchemaError::NotAFileParam(keypathstr));
            return Vec::new();
        }

        let files = self.find_files(keypath, false);
        if !files.is_empty() {
            info!("computing hash values for [{}]", keypathstr);
        }
        let mut hashes = Vec::new();
        for file in files {
            match file.as_deref().map(hash::sha256_file) {
                Some(Ok(digest)) => hashes.push(digest),
                Some(Err(e)) => self.fail(&SchemaError::Io(e)),
                None => self.raise_error(),
            }
        }

        let previous = self.get_field(keypath, "filehash").strings();
        for (old, new) in previous.iter().zip(hashes.iter()) {
            if old != new {
                error!("hash mismatch for [{}]", keypathstr);
                self.raise_error();
            }
        }
        self.set_field(keypath, "filehash", hashes.clone());
        self.set_field(keypath, "hashalgo", "sha256");
        hashes
    }

    // --- Manifest I/O ---

    /// Deep-merge another tree into this chip (or into a named history
    /// snapshot). `clear=false` appends list values; non-value fields
    /// overwrite when present on the source.
    pub fn merge_manifest(&mut self, src: &Node, job: Option<&str>, clear: bool, clobber: bool) {
        let dst = match job {
            Some(job) => self
                .history
                .entry(job.to_string())
                .or_insert_with(defaults::schema_cfg),
            None => &mut self.cfg,
        };
        let errors = dst.merge_from(src, clear, clobber);
        for e in errors {
            error!("{}", e);
            self.error.set(true);
        }
    }

    pub fn read_manifest(
        &mut self,
        filename: &Path,
        job: Option<&str>,
        clear: bool,
        clobber: bool,
    ) -> Result<(), SchemaError> {
        debug!("reading manifest {}", filename.display());
        let src = manifest::from_file(filename)?;
        self.merge_manifest(&src, job, clear, clobber);
        Ok(())
    }

    /// Serialize the schema; format follows the extension. Pruned output
    /// keeps empty lists only for TCL, whose consumers index into them.
    pub fn write_manifest(
        &self,
        filename: &Path,
        prune: bool,
        abspath: bool,
    ) -> Result<(), SchemaError> {
        debug!("writing manifest to {}", filename.display());
        let is_tcl = filename.extension().map(|e| e == "tcl").unwrap_or(false);
        let mut cfg = if prune {
            self.cfg.prune(is_tcl).unwrap_or_else(Node::branch)
        } else {
            self.cfg.clone()
        };
        if abspath {
            self.abspath_tree(&mut cfg);
        }
        manifest::write_file(&cfg, filename)
    }

    /// Rewrite every file/dir value in a tree to an absolute path where
    /// one can be resolved.
    fn abspath_tree(&self, cfg: &mut Node) {
        for kp in cfg.allkeys() {
            if kp.iter().any(|seg| seg == "default") {
                continue;
            }
            let refs: Vec<&str> = kp.iter().map(String::as_str).collect();
            let Ok(param) = cfg.param_mut(&refs) else { continue };
            let ty = match param.schema_type() {
                Ok(ty) => ty,
                Err(_) => continue,
            };
            if !ty.is_file() && !ty.is_dir() {
                continue;
            }
            let rewrite = |item: &String| -> String {
                self.find_sc_file(item, true)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| item.clone())
            };
            match &mut param.value {
                crate::value::Cell::Scalar(item) => *item = rewrite(item),
                crate::value::Cell::List(items) => {
                    for item in items.iter_mut() {
                        *item = rewrite(item);
                    }
                }
                crate::value::Cell::Null => {}
            }
        }
    }

    /// Snapshot the current schema under a job name, readable later via
    /// `get_job`.
    pub fn snapshot_history(&mut self, jobname: &str) {
        self.history.insert(jobname.to_string(), self.cfg.clone());
    }

    /// Enforce `SC_VALID_PATHS`: every resolvable file/dir value must
    /// live under the build tree or one of the allowed roots.
    pub fn check_files(&self) -> bool {
        let Ok(valid_paths) = std::env::var("SC_VALID_PATHS") else {
            return true;
        };
        let mut allowed: Vec<PathBuf> = vec![self
            .cwd
            .join(self.get_str(&["dir"]).unwrap_or_else(|| "build".to_string()))];
        allowed.extend(valid_paths.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));

        for kp in self.cfg.allkeys() {
            if kp.iter().any(|seg| seg == "default") {
                continue;
            }
            let refs: Vec<&str> = kp.iter().map(String::as_str).collect();
            let Some(param) = self.param(&refs) else { continue };
            let ty = match param.schema_type() {
                Ok(ty) => ty,
                Err(_) => continue,
            };
            if (!ty.is_file() && !ty.is_dir()) || param.effective().is_empty() {
                continue;
            }
            for path in self.find_files(&refs, true).into_iter().flatten() {
                let ok = allowed.iter().any(|root| path.starts_with(root));
                if !ok {
                    error!(
                        "keypath [{}] resolves outside of allowed directories: {}",
                        join(&refs),
                        path.display()
                    );
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_scalar() {
        let mut chip = Chip::new(None);
        chip.set(&["design"], "top");
        assert_eq!(chip.get_str(&["design"]).as_deref(), Some("top"));
        assert!(!chip.has_error());
    }

    #[test]
    fn test_add_builds_list() {
        let mut chip = Chip::new(Some("top"));
        chip.add(&["source"], "hello.v");
        chip.add(&["source"], "world.v");
        assert_eq!(
            chip.get_strings(&["source"]),
            vec!["hello.v".to_string(), "world.v".to_string()]
        );
    }

    #[test]
    fn test_add_to_scalar_latches_error() {
        let mut chip = Chip::new(Some("top"));
        chip.add(&["design"], "x");
        assert!(chip.has_error());
        // the value is untouched
        assert_eq!(chip.get_str(&["design"]).as_deref(), Some("top"));
    }

    #[test]
    fn test_default_wildcard_cloning() {
        let mut chip = Chip::new(Some("top"));
        chip.set(&["stdcell", "NangateOpenCellLibrary", "rev"], "r1p0");
        assert_eq!(
            chip.getkeys(&["stdcell"]),
            vec!["NangateOpenCellLibrary".to_string()]
        );
        assert_eq!(
            chip.get_str(&["stdcell", "NangateOpenCellLibrary", "rev"]).as_deref(),
            Some("r1p0")
        );
    }

    #[test]
    fn test_unknown_keypath_latches() {
        let chip = Chip::new(None);
        assert!(chip.get(&["nonesuch"]).is_null());
        assert!(chip.has_error());
    }

    #[test]
    fn test_clobber_false_is_noop() {
        let mut chip = Chip::new(None);
        chip.set(&["jobname"], "first");
        chip.set_clobber(&["jobname"], "second", false);
        assert_eq!(chip.get_str(&["jobname"]).as_deref(), Some("first"));
    }

    #[test]
    fn test_locked_version_ignores_writes() {
        let mut chip = Chip::new(None);
        let before = chip.get_str(&["version", "software"]);
        chip.set(&["version", "software"], "99.0.0");
        assert_eq!(chip.get_str(&["version", "software"]), before);
    }

    #[test]
    fn test_valid_with_default_wildcard() {
        let chip = Chip::new(None);
        assert!(chip.valid(&["design"], false));
        assert!(!chip.valid(&["stdcell", "mylib", "rev"], false));
        assert!(chip.valid(&["stdcell", "mylib", "rev"], true));
        assert!(!chip.valid(&["blah"], true));
    }

    #[test]
    fn test_tuple_parameter() {
        let mut chip = Chip::new(None);
        chip.add(&["flowgraph", "f", "syn", "0", "input"], ("import", "0"));
        assert_eq!(
            chip.get_pairs(&["flowgraph", "f", "syn", "0", "input"]),
            vec![("import".to_string(), "0".to_string())]
        );
    }

    #[test]
    fn test_job_history_access() {
        let mut chip = Chip::new(Some("top"));
        chip.set(&["jobname"], "job1");
        chip.snapshot_history("job1");
        chip.set(&["jobname"], "job2");
        assert_eq!(
            chip.get_job("job1", &["jobname"]).as_str(),
            Some("job1")
        );
    }

    #[test]
    fn test_metric_reads_default_zero_when_unset() {
        let chip = Chip::new(None);
        // never-written dynamic keys read through the template
        assert!(chip.get(&["metric", "syn", "0", "errors", "real"]).is_null());
        assert!(!chip.has_error());
    }
}
