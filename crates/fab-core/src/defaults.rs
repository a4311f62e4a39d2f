//! The default configuration schema.
//!
//! Every parameter the driver knows about is declared here, including the
//! `default` templates that dynamic subtrees (flows, tools, libraries,
//! metrics, records) are cloned from on first write.

use std::collections::BTreeMap;

use crate::schema::{Node, Param};
use crate::value::Cell;

/// Metric names tracked per task. Each gets a `real` and a `goal` leaf,
/// and every flowgraph node is seeded with a zero weight per name.
pub const METRICS: &[&str] = &[
    "errors",
    "warnings",
    "cellarea",
    "totalarea",
    "utilization",
    "peakpower",
    "standbypower",
    "setupslack",
    "setuptns",
    "holdslack",
    "holdtns",
    "wirelength",
    "overflow",
    "memory",
    "exetime",
    "tasktime",
];

struct P(Param);

impl P {
    fn new(ty: &str) -> P {
        P(Param::new(ty))
    }

    fn def(mut self, v: &str) -> P {
        self.0.defvalue = Cell::Scalar(v.to_string());
        self
    }

    fn require(mut self, r: &str) -> P {
        self.0.require = Some(r.to_string());
        self
    }

    fn lock(mut self) -> P {
        self.0.lock = Some("true".to_string());
        self
    }

    fn copy(mut self) -> P {
        self.0.copy = Some("true".to_string());
        self
    }

    fn switch(mut self, s: &str) -> P {
        self.0.switch.push(s.to_string());
        self
    }

    fn help(mut self, short: &str) -> P {
        self.0.shorthelp = short.to_string();
        self
    }

    fn example(mut self, e: &str) -> P {
        self.0.example.push(e.to_string());
        self
    }
}

fn insert(root: &mut BTreeMap<String, Node>, keypath: &[&str], p: P) {
    let mut map = root;
    let (leaf, branches) = keypath.split_last().expect("non-empty keypath");
    for seg in branches {
        let entry = map
            .entry((*seg).to_string())
            .or_insert_with(Node::branch);
        map = match entry {
            Node::Branch(children) => children,
            Node::Param(_) => panic!("parameter in the middle of keypath {:?}", keypath),
        };
    }
    let mut param = p.0;
    if param.value.is_empty() && !param.defvalue.is_empty() {
        // locked parameters carry their default as the live value
        if param.locked() {
            param.value = param.defvalue.clone();
        }
    }
    map.insert((*leaf).to_string(), Node::Param(param));
}

/// Build the full default schema tree.
pub fn schema_cfg() -> Node {
    let mut r = BTreeMap::new();

    // run options
    insert(&mut r, &["design"], P::new("str")
        .require("all")
        .switch("-design <str>")
        .help("Name of the top level design")
        .example("fab -design top"));
    insert(&mut r, &["mode"], P::new("str")
        .switch("-mode <str>")
        .help("Compilation mode (asic or fpga)"));
    insert(&mut r, &["target"], P::new("str")
        .switch("-target <str>")
        .help("Compilation target loaded at startup"));
    insert(&mut r, &["flow"], P::new("str")
        .switch("-flow <str>")
        .help("Name of the flowgraph to execute"));
    insert(&mut r, &["loglevel"], P::new("str")
        .def("info")
        .switch("-loglevel <str>")
        .help("Logging verbosity (debug/info/warning/error)"));
    insert(&mut r, &["dir"], P::new("dir")
        .def("build")
        .switch("-dir <dir>")
        .help("Build directory root"));
    insert(&mut r, &["jobname"], P::new("str")
        .def("job0")
        .switch("-jobname <str>")
        .help("Job directory name"));
    insert(&mut r, &["jobid"], P::new("str"));
    insert(&mut r, &["jobincr"], P::new("bool").switch("-jobincr"));
    insert(&mut r, &["steplist"], P::new("[str]").switch("-steplist <str>"));
    insert(&mut r, &["indexlist"], P::new("[str]"));
    insert(&mut r, &["arg", "step"], P::new("str").switch("-arg_step <str>"));
    insert(&mut r, &["arg", "index"], P::new("str").switch("-arg_index <str>"));
    insert(&mut r, &["source"], P::new("[file]")
        .copy()
        .switch("-source <file>")
        .help("Design source files"));
    insert(&mut r, &["cfg"], P::new("[file]")
        .switch("-cfg <file>")
        .help("Manifest files read at startup"));
    insert(&mut r, &["scpath"], P::new("[dir]").switch("-scpath <dir>"));
    insert(&mut r, &["copyall"], P::new("bool").switch("-copyall"));
    insert(&mut r, &["quiet"], P::new("bool").switch("-quiet"));
    insert(&mut r, &["hash"], P::new("bool").switch("-hash"));
    insert(&mut r, &["track"], P::new("bool").switch("-track"));
    insert(&mut r, &["clean"], P::new("bool").switch("-clean"));
    insert(&mut r, &["vercheck"], P::new("bool").switch("-vercheck"));
    insert(&mut r, &["skipcheck"], P::new("bool").switch("-skipcheck"));
    insert(&mut r, &["skipall"], P::new("bool").switch("-skipall"));
    insert(&mut r, &["bkpt"], P::new("[str]").switch("-bkpt <str>"));
    insert(&mut r, &["jobscheduler"], P::new("str"));
    insert(&mut r, &["optmode"], P::new("str").def("O0").switch("-O<str>"));
    insert(&mut r, &["define"], P::new("[str]").switch("-D<str>"));
    insert(&mut r, &["plusarg"], P::new("[str]").switch("+<str>"));
    insert(&mut r, &["jobinput", "default", "default", "default"], P::new("str"));
    insert(&mut r, &["env", "default"], P::new("str"));
    insert(&mut r, &["param", "default"], P::new("str"));
    insert(&mut r, &["version", "software"], P::new("str")
        .def(env!("CARGO_PKG_VERSION"))
        .lock()
        .switch("-version"));

    // standard cell library template
    insert(&mut r, &["stdcell", "default", "rev"], P::new("str"));
    insert(&mut r, &["stdcell", "default", "libarch"], P::new("str"));
    insert(&mut r, &["stdcell", "default", "lef"], P::new("[file]"));
    insert(&mut r, &["stdcell", "default", "lib"], P::new("[file]"));

    // flowgraph: flow/step/index
    let fg = &["flowgraph", "default", "default", "default"];
    insert(&mut r, &[fg[0], fg[1], fg[2], fg[3], "tool"], P::new("str"));
    insert(&mut r, &[fg[0], fg[1], fg[2], fg[3], "input"], P::new("[(str,str)]"));
    insert(&mut r, &[fg[0], fg[1], fg[2], fg[3], "weight", "default"], P::new("float"));
    insert(&mut r, &[fg[0], fg[1], fg[2], fg[3], "args"], P::new("[str]"));
    insert(&mut r, &[fg[0], fg[1], fg[2], fg[3], "timeout"], P::new("float"));

    // metrics: step/index/name
    for name in METRICS {
        insert(&mut r, &["metric", "default", "default", name, "real"], P::new("float"));
        insert(&mut r, &["metric", "default", "default", name, "goal"], P::new("float"));
    }

    // flow status: step/index
    insert(&mut r, &["flowstatus", "default", "default", "error"], P::new("int"));
    insert(&mut r, &["flowstatus", "default", "default", "select"], P::new("[(str,str)]"));

    // tool capability block: eda/<tool>/...
    let t = &["eda", "default"];
    insert(&mut r, &[t[0], t[1], "exe"], P::new("str"));
    insert(&mut r, &[t[0], t[1], "path"], P::new("dir"));
    insert(&mut r, &[t[0], t[1], "vswitch"], P::new("[str]"));
    insert(&mut r, &[t[0], t[1], "version"], P::new("[str]"));
    insert(&mut r, &[t[0], t[1], "format"], P::new("str"));
    insert(&mut r, &[t[0], t[1], "copy"], P::new("bool"));
    insert(&mut r, &[t[0], t[1], "continue"], P::new("bool"));
    insert(&mut r, &[t[0], t[1], "refdir", "default", "default"], P::new("[dir]"));
    insert(&mut r, &[t[0], t[1], "option", "default", "default"], P::new("[str]"));
    insert(&mut r, &[t[0], t[1], "script", "default", "default"], P::new("[file]"));
    insert(&mut r, &[t[0], t[1], "input", "default", "default"], P::new("[file]"));
    insert(&mut r, &[t[0], t[1], "output", "default", "default"], P::new("[file]"));
    insert(&mut r, &[t[0], t[1], "require", "default", "default"], P::new("[str]"));
    insert(&mut r, &[t[0], t[1], "regex", "default", "default", "default"], P::new("[str]"));
    insert(&mut r, &[t[0], t[1], "licenseserver", "default"], P::new("[str]"));
    insert(&mut r, &[t[0], t[1], "env", "default", "default", "default"], P::new("str"));

    // provenance record: job/step/index
    let rec = &["record", "default", "default", "default"];
    for leaf in [
        "userid", "machine", "region", "ipaddr", "macaddr", "platform", "distro",
        "starttime", "endtime", "arch",
    ] {
        insert(&mut r, &[rec[0], rec[1], rec[2], rec[3], leaf], P::new("str"));
    }
    for leaf in ["software", "tool", "os", "kernel"] {
        insert(&mut r, &[rec[0], rec[1], rec[2], rec[3], "version", leaf], P::new("str"));
    }

    Node::Branch(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_has_core_parameters() {
        let cfg = schema_cfg();
        for kp in [
            vec!["design"],
            vec!["flowgraph", "default", "default", "default", "tool"],
            vec!["metric", "default", "default", "errors", "real"],
            vec!["eda", "default", "exe"],
            vec!["flowstatus", "default", "default", "error"],
        ] {
            let refs: Vec<&str> = kp.clone();
            assert!(cfg.param(&refs).is_ok(), "missing {:?}", kp);
        }
    }

    #[test]
    fn test_software_version_is_locked() {
        let cfg = schema_cfg();
        let param = cfg.param(&["version", "software"]).unwrap();
        assert!(param.locked());
        assert!(!param.value.is_empty());
    }

    #[test]
    fn test_metric_names_visible_through_template() {
        let cfg = schema_cfg();
        let names = cfg.child_keys(&["metric", "default", "default"]).unwrap();
        assert_eq!(names.len(), METRICS.len());
        assert!(names.contains(&"setupslack".to_string()));
    }
}
