//! Manifest serialization: JSON (canonical), YAML, a TCL dictionary
//! form, and a flat CSV listing.

use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::SchemaError;
use crate::schema::Node;

/// Leaf keypaths of a tree with `default` templates filtered out, which
/// is the set the text emitters iterate over.
fn concrete_keys(cfg: &Node) -> Vec<Vec<String>> {
    cfg.allkeys()
        .into_iter()
        .filter(|kp| !kp.iter().any(|seg| seg == "default"))
        .collect()
}

pub fn to_json(cfg: &Node) -> Result<String, SchemaError> {
    serde_json::to_string_pretty(cfg)
        .map_err(|e| SchemaError::Io(std::io::Error::other(e)))
}

pub fn to_yaml(cfg: &Node) -> Result<String, SchemaError> {
    serde_yaml::to_string(cfg).map_err(|e| SchemaError::Io(std::io::Error::other(e)))
}

/// Emit `dict set <prefix> <k1> <k2> … [list v1 v2 …]` per parameter.
/// `$VAR` references become `$env(VAR)` so the dictionary can be sourced
/// by TCL-driven tools.
pub fn to_tcl(cfg: &Node, prefix: &str) -> Result<String, SchemaError> {
    let envref = Regex::new(r"^\$(\w+)(.*)$").expect("static regex");
    let mut out = String::new();
    for kp in concrete_keys(cfg) {
        let refs: Vec<&str> = kp.iter().map(String::as_str).collect();
        let param = cfg.param(&refs)?;
        let value = param.read(&kp.join(","))?;
        let mut items = value.to_strings();
        for item in &mut items {
            if let Some(caps) = envref.captures(item) {
                *item = format!("$env({}){}", &caps[1], &caps[2]);
            }
        }
        let keystr = kp.join(" ");
        let valstr = items.join(" ").replace(';', "\\;");
        out.push_str(&format!("{} {} [list {}]\n", prefix, keystr, valstr));
    }
    Ok(out)
}

/// Emit one `"k1,k2,…",item` row per value; list parameters expand to one
/// row per element. Embedded quotes double per CSV convention.
pub fn to_csv(cfg: &Node) -> Result<String, SchemaError> {
    let mut out = String::new();
    for kp in concrete_keys(cfg) {
        let refs: Vec<&str> = kp.iter().map(String::as_str).collect();
        let param = cfg.param(&refs)?;
        let value = param.read(&kp.join(","))?;
        let keystr = kp.join(",").replace('"', "\"\"");
        let items = value.to_strings();
        if items.is_empty() {
            out.push_str(&format!("\"{}\",\n", keystr));
        }
        for item in items {
            out.push_str(&format!("\"{}\",{}\n", keystr, item));
        }
    }
    Ok(out)
}

/// Parse a manifest file; the format follows the extension (json, yaml).
pub fn from_file(path: &Path) -> Result<Node, SchemaError> {
    let text = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => serde_json::from_str(&text)
            .map_err(|e| SchemaError::Io(std::io::Error::other(e))),
        "yaml" | "yml" => serde_yaml::from_str(&text)
            .map_err(|e| SchemaError::Io(std::io::Error::other(e))),
        _ => Err(SchemaError::BadManifestFormat(path.display().to_string())),
    }
}

/// Write a tree to a file; the format follows the extension
/// (json, yaml, tcl, csv).
pub fn write_file(cfg: &Node, path: &Path) -> Result<(), SchemaError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let text = match ext.as_str() {
        "json" => to_json(cfg)?,
        "yaml" | "yml" => to_yaml(cfg)?,
        "tcl" => {
            let mut body = String::from("# auto-generated manifest, do not edit\n");
            body.push_str(&to_tcl(cfg, "dict set sc_cfg")?);
            body
        }
        "csv" => to_csv(cfg)?,
        _ => return Err(SchemaError::BadManifestFormat(path.display().to_string())),
    };
    fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Param;
    use crate::value::CellInput;
    use std::collections::BTreeMap;

    fn sample() -> Node {
        let mut sources = Param::new("[file]");
        sources
            .write_value(CellInput::from(vec!["$PDK_ROOT/tech.lef", "top.v"]), true, "source")
            .unwrap();
        let mut quiet = Param::new("bool");
        quiet.write_value(CellInput::from(true), true, "quiet").unwrap();
        let mut map = BTreeMap::new();
        map.insert("source".to_string(), Node::Param(sources));
        map.insert("quiet".to_string(), Node::Param(quiet));
        Node::Branch(map)
    }

    #[test]
    fn test_tcl_env_reference() {
        let text = to_tcl(&sample(), "dict set sc_cfg").unwrap();
        assert!(text.contains("dict set sc_cfg source [list $env(PDK_ROOT)/tech.lef top.v]"));
        assert!(text.contains("dict set sc_cfg quiet [list true]"));
    }

    #[test]
    fn test_csv_expands_lists() {
        let text = to_csv(&sample()).unwrap();
        assert!(text.contains("\"source\",$PDK_ROOT/tech.lef"));
        assert!(text.contains("\"source\",top.v"));
        assert!(text.contains("\"quiet\",true"));
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        write_file(&sample(), &path).unwrap();
        let back = from_file(&path).unwrap();
        assert_eq!(
            back.param(&["source"]).unwrap().read("source").unwrap().strings(),
            vec!["$PDK_ROOT/tech.lef".to_string(), "top.v".to_string()]
        );
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.yaml");
        write_file(&sample(), &path).unwrap();
        let back = from_file(&path).unwrap();
        assert!(back.param(&["quiet"]).unwrap().read("quiet").unwrap().as_bool());
    }
}
