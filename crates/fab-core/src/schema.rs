//! The hierarchical parameter tree backing the configuration manifest.
//!
//! The tree is a nested string-keyed mapping whose leaves are `Param`
//! cells. Subtrees keyed `default` are templates: the first write through
//! a sibling key that does not exist yet instantiates a deep copy of the
//! template under that key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::value::{self, Cell, CellInput, SchemaType, Value};

/// A single schema parameter leaf.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Param {
    #[serde(rename = "type")]
    pub ty: String,

    #[serde(default)]
    pub value: Cell,

    #[serde(default)]
    pub defvalue: Cell,

    /// `null`, `all`, or a mode name that makes this parameter required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require: Option<String>,

    /// When `"true"`, writes are silently ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,

    /// When `"true"`, file values are staged into the import workdir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub switch: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shorthelp: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub help: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub example: Vec<String>,

    /// Content hashes, parallel in order to `value` for file lists.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filehash: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashalgo: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub author: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<String>,
}

impl Param {
    pub fn new(ty: &str) -> Param {
        Param {
            ty: ty.to_string(),
            value: Cell::Null,
            defvalue: if ty.starts_with('[') {
                Cell::List(Vec::new())
            } else {
                Cell::Null
            },
            require: None,
            lock: None,
            copy: None,
            switch: Vec::new(),
            shorthelp: String::new(),
            help: String::new(),
            example: Vec::new(),
            filehash: Vec::new(),
            hashalgo: None,
            date: Vec::new(),
            author: Vec::new(),
            signature: Vec::new(),
        }
    }

    pub fn schema_type(&self) -> Result<SchemaType, SchemaError> {
        SchemaType::parse(&self.ty)
    }

    pub fn is_list(&self) -> bool {
        self.ty.starts_with('[')
    }

    pub fn locked(&self) -> bool {
        self.lock.as_deref() == Some("true")
    }

    pub fn copy_flag(&self) -> bool {
        self.copy.as_deref() == Some("true")
    }

    /// The cell that `get` reads: the value when set, the default
    /// otherwise.
    pub fn effective(&self) -> &Cell {
        if self.value.is_empty() && !self.defvalue.is_empty() {
            &self.defvalue
        } else {
            &self.value
        }
    }

    /// Typed read of the effective value.
    pub fn read(&self, keypath: &str) -> Result<Value, SchemaError> {
        value::decode(self.effective(), &self.schema_type()?, keypath)
    }

    /// Write the value, honoring the lock bit and the clobber rule: a
    /// locked parameter ignores the write silently, and a non-empty value
    /// is only replaced when `clobber` is set.
    pub fn write_value(
        &mut self,
        input: CellInput,
        clobber: bool,
        keypath: &str,
    ) -> Result<(), SchemaError> {
        if self.locked() {
            log::debug!("ignoring write to locked parameter [{}]", keypath);
            return Ok(());
        }
        if !clobber && !self.value.is_empty() {
            log::debug!(
                "ignoring write to [{}], value already set and clobber disabled",
                keypath
            );
            return Ok(());
        }
        self.value = value::encode(input, &self.schema_type()?, keypath)?;
        Ok(())
    }

    /// Append items to a list-typed value. Erroring on scalars.
    pub fn append_value(&mut self, input: CellInput, keypath: &str) -> Result<(), SchemaError> {
        if self.locked() {
            log::debug!("ignoring add to locked parameter [{}]", keypath);
            return Ok(());
        }
        let ty = self.schema_type()?;
        if !ty.is_list() {
            return Err(SchemaError::AddToScalar(keypath.to_string()));
        }
        let incoming = match value::encode(input, &ty, keypath)? {
            Cell::List(items) => items,
            _ => Vec::new(),
        };
        match &mut self.value {
            Cell::List(items) => items.extend(incoming),
            _ => self.value = Cell::List(incoming),
        }
        Ok(())
    }

    /// Typed read of a non-value field.
    pub fn read_field(&self, field: &str, keypath: &str) -> Result<Value, SchemaError> {
        let opt_str = |v: &Option<String>| match v {
            Some(s) => Value::Str(s.clone()),
            None => Value::Null,
        };
        match field {
            "value" => self.read(keypath),
            "type" => Ok(Value::Str(self.ty.clone())),
            "defvalue" => value::decode(&self.defvalue, &self.schema_type()?, keypath),
            "require" => Ok(opt_str(&self.require)),
            "hashalgo" => Ok(opt_str(&self.hashalgo)),
            "lock" => Ok(Value::Bool(self.locked())),
            "copy" => Ok(Value::Bool(self.copy_flag())),
            "shorthelp" => Ok(Value::Str(self.shorthelp.clone())),
            "help" => Ok(Value::Str(self.help.clone())),
            "switch" => Ok(Value::StrList(self.switch.clone())),
            "example" => Ok(Value::StrList(self.example.clone())),
            "filehash" => Ok(Value::StrList(self.filehash.clone())),
            "date" => Ok(Value::StrList(self.date.clone())),
            "author" => Ok(Value::StrList(self.author.clone())),
            "signature" => Ok(Value::StrList(self.signature.clone())),
            other => Err(SchemaError::UnknownField {
                keypath: keypath.to_string(),
                field: other.to_string(),
            }),
        }
    }

    /// Write a non-value field. Boolean fields insist on booleans; the
    /// append-only provenance fields accept scalars or lists.
    pub fn write_field(
        &mut self,
        field: &str,
        input: CellInput,
        keypath: &str,
    ) -> Result<(), SchemaError> {
        let as_scalar = |input: CellInput| -> Result<Option<String>, SchemaError> {
            match input {
                CellInput::Null => Ok(None),
                CellInput::One(s) => Ok(Some(s)),
                CellInput::Many(_) => Err(SchemaError::TypeMismatch {
                    keypath: keypath.to_string(),
                    reason: format!("field '{}' takes a scalar", field),
                }),
            }
        };
        let as_list = |input: CellInput| -> Vec<String> {
            match input {
                CellInput::Null => Vec::new(),
                CellInput::One(s) => vec![s],
                CellInput::Many(items) => items,
            }
        };
        match field {
            "value" => self.write_value(input, true, keypath),
            "lock" | "copy" => {
                let raw = as_scalar(input)?;
                match raw.as_deref() {
                    Some("true") | Some("false") | None => {
                        if field == "lock" {
                            self.lock = raw;
                        } else {
                            self.copy = raw;
                        }
                        Ok(())
                    }
                    Some(other) => Err(SchemaError::TypeMismatch {
                        keypath: keypath.to_string(),
                        reason: format!("field '{}' must be boolean, got '{}'", field, other),
                    }),
                }
            }
            "type" => {
                self.ty = as_scalar(input)?.unwrap_or_default();
                Ok(())
            }
            "require" => {
                self.require = as_scalar(input)?;
                Ok(())
            }
            "hashalgo" => {
                self.hashalgo = as_scalar(input)?;
                Ok(())
            }
            "shorthelp" => {
                self.shorthelp = as_scalar(input)?.unwrap_or_default();
                Ok(())
            }
            "help" => {
                self.help = as_scalar(input)?.unwrap_or_default();
                Ok(())
            }
            "switch" => {
                self.switch = as_list(input);
                Ok(())
            }
            "example" => {
                self.example = as_list(input);
                Ok(())
            }
            "filehash" => {
                self.filehash = as_list(input);
                Ok(())
            }
            "date" => {
                self.date = as_list(input);
                Ok(())
            }
            "author" => {
                self.author = as_list(input);
                Ok(())
            }
            "signature" => {
                self.signature = as_list(input);
                Ok(())
            }
            other => Err(SchemaError::UnknownField {
                keypath: keypath.to_string(),
                field: other.to_string(),
            }),
        }
    }

    /// Append to an append-only field (`filehash`, `date`, `author`,
    /// `signature`) or to the value of a list parameter.
    pub fn append_field(
        &mut self,
        field: &str,
        input: CellInput,
        keypath: &str,
    ) -> Result<(), SchemaError> {
        let items = match input {
            CellInput::Null => Vec::new(),
            CellInput::One(s) => vec![s],
            CellInput::Many(items) => items,
        };
        match field {
            "value" => self.append_value(CellInput::Many(items), keypath),
            "filehash" => {
                self.filehash.extend(items);
                Ok(())
            }
            "date" => {
                self.date.extend(items);
                Ok(())
            }
            "author" => {
                self.author.extend(items);
                Ok(())
            }
            "signature" => {
                self.signature.extend(items);
                Ok(())
            }
            other => Err(SchemaError::AddToField {
                keypath: keypath.to_string(),
                field: other.to_string(),
            }),
        }
    }
}

/// A node in the schema tree: either a parameter leaf or a branch of
/// named children. Serialized untagged; a mapping carrying a `type` and
/// `defvalue` field is a leaf.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Param(Param),
    Branch(BTreeMap<String, Node>),
}

fn join(keypath: &[&str]) -> String {
    keypath.join(",")
}

impl Node {
    pub fn branch() -> Node {
        Node::Branch(BTreeMap::new())
    }

    pub fn as_branch(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Branch(map) => Some(map),
            Node::Param(_) => None,
        }
    }

    pub fn as_param(&self) -> Option<&Param> {
        match self {
            Node::Param(p) => Some(p),
            Node::Branch(_) => None,
        }
    }

    /// Read-only descent. Does not instantiate templates.
    pub fn lookup(&self, keypath: &[&str]) -> Result<&Node, SchemaError> {
        let mut node = self;
        for (i, seg) in keypath.iter().enumerate() {
            let map = node
                .as_branch()
                .ok_or_else(|| SchemaError::NotABranch(join(&keypath[..i])))?;
            node = map
                .get(*seg)
                .ok_or_else(|| SchemaError::UnknownKeypath(join(keypath)))?;
        }
        Ok(node)
    }

    pub fn param(&self, keypath: &[&str]) -> Result<&Param, SchemaError> {
        self.lookup(keypath)?
            .as_param()
            .ok_or_else(|| SchemaError::NotAParam(join(keypath)))
    }

    /// Mutable descent that clones `default` templates for missing keys,
    /// which is how dynamic subtrees come into existence on first write.
    pub fn param_mut(&mut self, keypath: &[&str]) -> Result<&mut Param, SchemaError> {
        let mut node = self;
        for (i, seg) in keypath.iter().enumerate() {
            let map = match node {
                Node::Branch(map) => map,
                Node::Param(_) => return Err(SchemaError::NotABranch(join(&keypath[..i]))),
            };
            if !map.contains_key(*seg) {
                match map.get("default") {
                    Some(template) => {
                        let clone = template.clone();
                        map.insert((*seg).to_string(), clone);
                    }
                    None => return Err(SchemaError::UnknownKeypath(join(keypath))),
                }
            }
            node = map.get_mut(*seg).expect("key inserted above");
        }
        match node {
            Node::Param(p) => Ok(p),
            Node::Branch(_) => Err(SchemaError::NotAParam(join(keypath))),
        }
    }

    /// Immediate child keys of a branch, `default` excluded.
    pub fn child_keys(&self, keypath: &[&str]) -> Result<Vec<String>, SchemaError> {
        let map = self
            .lookup(keypath)?
            .as_branch()
            .ok_or_else(|| SchemaError::NotABranch(join(keypath)))?;
        Ok(map.keys().filter(|k| *k != "default").cloned().collect())
    }

    /// Every leaf keypath in the tree, `default` templates included.
    pub fn allkeys(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        self.walk(&mut Vec::new(), &mut out);
        out
    }

    fn walk(&self, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        match self {
            Node::Param(_) => out.push(prefix.clone()),
            Node::Branch(map) => {
                for (key, child) in map {
                    prefix.push(key.clone());
                    child.walk(prefix, out);
                    prefix.pop();
                }
            }
        }
    }

    /// A deep copy with `default` templates removed, help text stripped,
    /// and leaves dropped when both value and default are empty. Empty
    /// lists survive only when `keep_lists` is set.
    pub fn prune(&self, keep_lists: bool) -> Option<Node> {
        let cell_empty = |cell: &Cell| match cell {
            Cell::Null => true,
            Cell::Scalar(_) => false,
            Cell::List(items) => items.is_empty() && !keep_lists,
        };
        match self {
            Node::Param(p) => {
                if cell_empty(&p.value) && cell_empty(&p.defvalue) {
                    return None;
                }
                let mut stripped = p.clone();
                stripped.help = String::new();
                stripped.example = Vec::new();
                Some(Node::Param(stripped))
            }
            Node::Branch(map) => {
                let mut out = BTreeMap::new();
                for (key, child) in map {
                    if key == "default" {
                        continue;
                    }
                    if let Some(kept) = child.prune(keep_lists) {
                        out.insert(key.clone(), kept);
                    }
                }
                if out.is_empty() {
                    None
                } else {
                    Some(Node::Branch(out))
                }
            }
        }
    }

    /// Deep-merge another tree into this one. Values merge under the
    /// clobber rule (`clear=false` appends to list parameters instead of
    /// replacing); the mutable non-value fields (`lock`, `copy`, file
    /// provenance) overwrite whenever present on the source. Returns the
    /// per-key errors encountered; merging continues past them.
    pub fn merge_from(&mut self, src: &Node, clear: bool, clobber: bool) -> Vec<SchemaError> {
        let mut errors = Vec::new();
        for key in src.allkeys() {
            if key.iter().any(|seg| seg == "default") {
                continue;
            }
            let refs: Vec<&str> = key.iter().map(String::as_str).collect();
            let keypath = join(&refs);
            let sp = match src.param(&refs) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let dst = match self.param_mut(&refs) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let input = match &sp.value {
                Cell::Null => CellInput::Null,
                Cell::Scalar(s) => CellInput::One(s.clone()),
                Cell::List(items) => CellInput::Many(items.clone()),
            };
            let result = if sp.is_list() && !clear {
                dst.append_value(input, &keypath)
            } else {
                dst.write_value(input, clobber, &keypath)
            };
            if let Err(e) = result {
                errors.push(e);
            }
            if sp.copy.is_some() {
                dst.copy = sp.copy.clone();
            }
            if !sp.filehash.is_empty() {
                dst.filehash = sp.filehash.clone();
            }
            if sp.hashalgo.is_some() {
                dst.hashalgo = sp.hashalgo.clone();
            }
            if !sp.date.is_empty() {
                dst.date = sp.date.clone();
            }
            if !sp.author.is_empty() {
                dst.author = sp.author.clone();
            }
            if !sp.signature.is_empty() {
                dst.signature = sp.signature.clone();
            }
            // lock last so a locked source cannot block its own value
            if sp.lock.is_some() {
                dst.lock = sp.lock.clone();
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_default() -> Node {
        let mut rev = Param::new("str");
        rev.shorthelp = "Library revision".to_string();
        let mut template = BTreeMap::new();
        template.insert("rev".to_string(), Node::Param(rev));
        let mut stdcell = BTreeMap::new();
        stdcell.insert("default".to_string(), Node::Branch(template));
        let mut root = BTreeMap::new();
        root.insert("stdcell".to_string(), Node::Branch(stdcell));
        root.insert("design".to_string(), Node::Param(Param::new("str")));
        Node::Branch(root)
    }

    #[test]
    fn test_default_template_cloned_on_write() {
        let mut root = tree_with_default();
        let param = root
            .param_mut(&["stdcell", "NangateOpenCellLibrary", "rev"])
            .unwrap();
        param
            .write_value(CellInput::from("r1p0"), true, "stdcell,NangateOpenCellLibrary,rev")
            .unwrap();

        let keys = root.child_keys(&["stdcell"]).unwrap();
        assert_eq!(keys, vec!["NangateOpenCellLibrary".to_string()]);

        let rev = root
            .param(&["stdcell", "NangateOpenCellLibrary", "rev"])
            .unwrap();
        assert_eq!(rev.read("x").unwrap(), Value::Str("r1p0".to_string()));
    }

    #[test]
    fn test_getkeys_excludes_default() {
        let root = tree_with_default();
        assert!(root.child_keys(&["stdcell"]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_keypath() {
        let root = tree_with_default();
        assert!(matches!(
            root.param(&["nonesuch"]),
            Err(SchemaError::UnknownKeypath(_))
        ));
    }

    #[test]
    fn test_lock_makes_writes_silent() {
        let mut param = Param::new("str");
        param.write_value(CellInput::from("first"), true, "k").unwrap();
        param.write_field("lock", CellInput::from("true"), "k").unwrap();
        param.write_value(CellInput::from("second"), true, "k").unwrap();
        assert_eq!(param.read("k").unwrap(), Value::Str("first".to_string()));
    }

    #[test]
    fn test_clobber_false_preserves_value() {
        let mut param = Param::new("str");
        param.write_value(CellInput::from("kept"), true, "k").unwrap();
        param.write_value(CellInput::from("dropped"), false, "k").unwrap();
        assert_eq!(param.read("k").unwrap(), Value::Str("kept".to_string()));
    }

    #[test]
    fn test_append_value() {
        let mut param = Param::new("[file]");
        param.append_value(CellInput::from("hello.v"), "source").unwrap();
        param.append_value(CellInput::from("world.v"), "source").unwrap();
        assert_eq!(
            param.read("source").unwrap(),
            Value::StrList(vec!["hello.v".to_string(), "world.v".to_string()])
        );
    }

    #[test]
    fn test_append_to_scalar_fails() {
        let mut param = Param::new("str");
        assert!(matches!(
            param.append_value(CellInput::from("x"), "design"),
            Err(SchemaError::AddToScalar(_))
        ));
    }

    #[test]
    fn test_prune_drops_empty_leaves_and_defaults() {
        let mut root = tree_with_default();
        root.param_mut(&["design"])
            .unwrap()
            .write_value(CellInput::from("top"), true, "design")
            .unwrap();
        let pruned = root.prune(false).unwrap();
        assert!(pruned.lookup(&["design"]).is_ok());
        // stdcell held only a default template, so the branch disappears
        assert!(pruned.lookup(&["stdcell"]).is_err());
    }

    #[test]
    fn test_merge_appends_lists_when_clear_disabled() {
        let mklist = |items: &[&str]| {
            let mut p = Param::new("[str]");
            p.write_value(
                CellInput::Many(items.iter().map(|s| s.to_string()).collect()),
                true,
                "idirs",
            )
            .unwrap();
            let mut map = BTreeMap::new();
            map.insert("idirs".to_string(), Node::Param(p));
            Node::Branch(map)
        };
        let mut dst = mklist(&["a"]);
        let src = mklist(&["b", "c"]);
        let errors = dst.merge_from(&src, false, true);
        assert!(errors.is_empty());
        assert_eq!(
            dst.param(&["idirs"]).unwrap().read("idirs").unwrap(),
            Value::StrList(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let mut root = tree_with_default();
        root.param_mut(&["design"])
            .unwrap()
            .write_value(CellInput::from("top"), true, "design")
            .unwrap();
        let text = serde_json::to_string(&root).unwrap();
        let back: Node = serde_json::from_str(&text).unwrap();
        assert_eq!(
            back.param(&["design"]).unwrap().read("design").unwrap(),
            Value::Str("top".to_string())
        );
    }
}
