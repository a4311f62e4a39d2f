//! Typed views over the stringly-stored schema cells.
//!
//! Parameter values are stored in their canonical string form (the form
//! that round-trips through manifests); all coercion to and from typed
//! values happens here, at the schema boundary.

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Declared type of a schema parameter, parsed from its string form
/// (e.g. `str`, `[file]`, `(float,float)`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaType {
    Str,
    Int,
    Float,
    Bool,
    File,
    Dir,
    StrPair,
    FloatPair,
    List(Box<SchemaType>),
}

impl SchemaType {
    pub fn parse(s: &str) -> Result<SchemaType, SchemaError> {
        if let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            return Ok(SchemaType::List(Box::new(SchemaType::parse(inner)?)));
        }
        match s {
            "str" => Ok(SchemaType::Str),
            "int" => Ok(SchemaType::Int),
            "float" => Ok(SchemaType::Float),
            "bool" => Ok(SchemaType::Bool),
            "file" => Ok(SchemaType::File),
            "dir" => Ok(SchemaType::Dir),
            "(str,str)" => Ok(SchemaType::StrPair),
            "(float,float)" => Ok(SchemaType::FloatPair),
            _ => Err(SchemaError::BadTypeString(s.to_string())),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, SchemaType::List(_))
    }

    pub fn is_file(&self) -> bool {
        match self {
            SchemaType::File => true,
            SchemaType::List(inner) => inner.is_file(),
            _ => false,
        }
    }

    pub fn is_dir(&self) -> bool {
        match self {
            SchemaType::Dir => true,
            SchemaType::List(inner) => inner.is_dir(),
            _ => false,
        }
    }

    /// Element type for lists, self for scalars.
    pub fn base(&self) -> &SchemaType {
        match self {
            SchemaType::List(inner) => inner.base(),
            other => other,
        }
    }
}

/// Raw storage cell of a parameter value: unset, one string, or a string
/// list. Serialized as `null`, a string, or an array.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Null,
    Scalar(String),
    List(Vec<String>),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Null => true,
            Cell::Scalar(_) => false,
            Cell::List(items) => items.is_empty(),
        }
    }
}

/// A typed parameter value as returned by `get`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Pair(String, String),
    FloatPair(f64, f64),
    StrList(Vec<String>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    PairList(Vec<(String, String)>),
    FloatPairList(Vec<(f64, f64)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// String items of a list value; empty for anything else.
    pub fn strings(&self) -> Vec<String> {
        match self {
            Value::StrList(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        match self {
            Value::PairList(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Canonical string forms of the value, one entry per item; used by
    /// the TCL and CSV emitters.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Value::Null => Vec::new(),
            Value::Str(s) => vec![s.clone()],
            Value::Int(v) => vec![v.to_string()],
            Value::Float(v) => vec![v.to_string()],
            Value::Bool(v) => vec![v.to_string()],
            Value::Pair(a, b) => vec![format!("({},{})", a, b)],
            Value::FloatPair(a, b) => vec![format!("({},{})", a, b)],
            Value::StrList(items) => items.clone(),
            Value::IntList(items) => items.iter().map(|v| v.to_string()).collect(),
            Value::FloatList(items) => items.iter().map(|v| v.to_string()).collect(),
            Value::PairList(items) => {
                items.iter().map(|(a, b)| format!("({},{})", a, b)).collect()
            }
            Value::FloatPairList(items) => {
                items.iter().map(|(a, b)| format!("({},{})", a, b)).collect()
            }
        }
    }
}

fn parse_pair(raw: &str, keypath: &str) -> Result<(String, String), SchemaError> {
    let trimmed: String = raw
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | '\'' | '"') && !c.is_whitespace())
        .collect();
    let mut parts = trimmed.splitn(2, ',');
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => Ok((a.to_string(), b.to_string())),
        _ => Err(SchemaError::TypeMismatch {
            keypath: keypath.to_string(),
            reason: format!("cannot parse '{}' as a pair", raw),
        }),
    }
}

fn decode_scalar(raw: &str, ty: &SchemaType, keypath: &str) -> Result<Value, SchemaError> {
    let mismatch = |reason: String| SchemaError::TypeMismatch {
        keypath: keypath.to_string(),
        reason,
    };
    match ty {
        SchemaType::Str | SchemaType::File | SchemaType::Dir => Ok(Value::Str(raw.to_string())),
        SchemaType::Int => raw
            .parse::<i64>()
            .or_else(|_| raw.parse::<f64>().map(|f| f as i64))
            .map(Value::Int)
            .map_err(|_| mismatch(format!("cannot parse '{}' as int", raw))),
        SchemaType::Float => raw
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| mismatch(format!("cannot parse '{}' as float", raw))),
        SchemaType::Bool => match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(mismatch(format!("cannot parse '{}' as bool", other))),
        },
        SchemaType::StrPair => {
            let (a, b) = parse_pair(raw, keypath)?;
            Ok(Value::Pair(a, b))
        }
        SchemaType::FloatPair => {
            let (a, b) = parse_pair(raw, keypath)?;
            let fa = a
                .parse::<f64>()
                .map_err(|_| mismatch(format!("cannot parse '{}' as float pair", raw)))?;
            let fb = b
                .parse::<f64>()
                .map_err(|_| mismatch(format!("cannot parse '{}' as float pair", raw)))?;
            Ok(Value::FloatPair(fa, fb))
        }
        SchemaType::List(_) => unreachable!("list handled by decode"),
    }
}

/// Decode a storage cell into a typed value according to the declared
/// parameter type. Unset scalars decode to `Null`; unset lists decode to
/// the empty list of their element type.
pub fn decode(cell: &Cell, ty: &SchemaType, keypath: &str) -> Result<Value, SchemaError> {
    if let SchemaType::List(base) = ty {
        let items: &[String] = match cell {
            Cell::Null => &[],
            Cell::List(items) => items,
            Cell::Scalar(_) => {
                return Err(SchemaError::TypeMismatch {
                    keypath: keypath.to_string(),
                    reason: "scalar stored in list parameter".to_string(),
                })
            }
        };
        return match base.as_ref() {
            SchemaType::Int => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match decode_scalar(item, base, keypath)? {
                        Value::Int(v) => out.push(v),
                        _ => unreachable!(),
                    }
                }
                Ok(Value::IntList(out))
            }
            SchemaType::Float => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match decode_scalar(item, base, keypath)? {
                        Value::Float(v) => out.push(v),
                        _ => unreachable!(),
                    }
                }
                Ok(Value::FloatList(out))
            }
            SchemaType::StrPair => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(parse_pair(item, keypath)?);
                }
                Ok(Value::PairList(out))
            }
            SchemaType::FloatPair => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match decode_scalar(item, base, keypath)? {
                        Value::FloatPair(a, b) => out.push((a, b)),
                        _ => unreachable!(),
                    }
                }
                Ok(Value::FloatPairList(out))
            }
            _ => Ok(Value::StrList(items.to_vec())),
        };
    }

    match cell {
        Cell::Null => Ok(Value::Null),
        Cell::Scalar(raw) => decode_scalar(raw, ty, keypath),
        Cell::List(_) => Err(SchemaError::TypeMismatch {
            keypath: keypath.to_string(),
            reason: "list stored in scalar parameter".to_string(),
        }),
    }
}

/// Input accepted by `set`/`add` before type checking. Conversions exist
/// for the common Rust shapes; everything normalizes to canonical string
/// storage form.
#[derive(Clone, Debug)]
pub enum CellInput {
    Null,
    One(String),
    Many(Vec<String>),
}

impl From<&str> for CellInput {
    fn from(v: &str) -> Self {
        CellInput::One(v.to_string())
    }
}

impl From<String> for CellInput {
    fn from(v: String) -> Self {
        CellInput::One(v)
    }
}

impl From<bool> for CellInput {
    fn from(v: bool) -> Self {
        CellInput::One(v.to_string())
    }
}

impl From<i32> for CellInput {
    fn from(v: i32) -> Self {
        CellInput::One(v.to_string())
    }
}

impl From<i64> for CellInput {
    fn from(v: i64) -> Self {
        CellInput::One(v.to_string())
    }
}

impl From<usize> for CellInput {
    fn from(v: usize) -> Self {
        CellInput::One(v.to_string())
    }
}

impl From<f64> for CellInput {
    fn from(v: f64) -> Self {
        CellInput::One(v.to_string())
    }
}

impl From<(&str, &str)> for CellInput {
    fn from((a, b): (&str, &str)) -> Self {
        CellInput::One(format!("({},{})", a, b))
    }
}

impl From<(f64, f64)> for CellInput {
    fn from((a, b): (f64, f64)) -> Self {
        CellInput::One(format!("({},{})", a, b))
    }
}

impl From<Vec<String>> for CellInput {
    fn from(v: Vec<String>) -> Self {
        CellInput::Many(v)
    }
}

impl From<Vec<&str>> for CellInput {
    fn from(v: Vec<&str>) -> Self {
        CellInput::Many(v.into_iter().map(str::to_string).collect())
    }
}

impl From<&[String]> for CellInput {
    fn from(v: &[String]) -> Self {
        CellInput::Many(v.to_vec())
    }
}

impl From<Vec<(String, String)>> for CellInput {
    fn from(v: Vec<(String, String)>) -> Self {
        CellInput::Many(v.into_iter().map(|(a, b)| format!("({},{})", a, b)).collect())
    }
}

impl From<Option<String>> for CellInput {
    fn from(v: Option<String>) -> Self {
        match v {
            Some(s) => CellInput::One(s),
            None => CellInput::Null,
        }
    }
}

fn check_item(item: &str, ty: &SchemaType, keypath: &str) -> Result<(), SchemaError> {
    decode_scalar(item, ty, keypath).map(|_| ())
}

/// Validate an input against the declared type and produce the storage
/// cell. Scalars reject list inputs; lists auto-wrap scalar inputs.
pub fn encode(input: CellInput, ty: &SchemaType, keypath: &str) -> Result<Cell, SchemaError> {
    match ty {
        SchemaType::List(base) => {
            let items = match input {
                CellInput::Null => Vec::new(),
                CellInput::One(item) => vec![item],
                CellInput::Many(items) => items,
            };
            for item in &items {
                check_item(item, base, keypath)?;
            }
            Ok(Cell::List(items))
        }
        scalar => match input {
            CellInput::Null => Ok(Cell::Null),
            CellInput::One(item) => {
                check_item(&item, scalar, keypath)?;
                Ok(Cell::Scalar(item))
            }
            CellInput::Many(_) => Err(SchemaError::TypeMismatch {
                keypath: keypath.to_string(),
                reason: "value must be a scalar".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parsing() {
        assert_eq!(SchemaType::parse("str").unwrap(), SchemaType::Str);
        assert_eq!(
            SchemaType::parse("[file]").unwrap(),
            SchemaType::List(Box::new(SchemaType::File))
        );
        assert_eq!(SchemaType::parse("(float,float)").unwrap(), SchemaType::FloatPair);
        assert!(SchemaType::parse("widget").is_err());
    }

    #[test]
    fn test_bool_round_trip() {
        let ty = SchemaType::Bool;
        let cell = encode(CellInput::from(true), &ty, "quiet").unwrap();
        assert_eq!(cell, Cell::Scalar("true".to_string()));
        assert_eq!(decode(&cell, &ty, "quiet").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_scalar_rejects_list() {
        let ty = SchemaType::Str;
        let err = encode(CellInput::from(vec!["a", "b"]), &ty, "design");
        assert!(err.is_err());
    }

    #[test]
    fn test_list_wraps_scalar() {
        let ty = SchemaType::parse("[str]").unwrap();
        let cell = encode(CellInput::from("hello.v"), &ty, "source").unwrap();
        assert_eq!(cell, Cell::List(vec!["hello.v".to_string()]));
    }

    #[test]
    fn test_tuple_canonical_form() {
        let ty = SchemaType::FloatPair;
        let cell = encode(CellInput::from((0.0, 10.5)), &ty, "corner").unwrap();
        assert_eq!(cell, Cell::Scalar("(0,10.5)".to_string()));
        assert_eq!(
            decode(&cell, &ty, "corner").unwrap(),
            Value::FloatPair(0.0, 10.5)
        );
    }

    #[test]
    fn test_unset_list_decodes_empty() {
        let ty = SchemaType::parse("[str]").unwrap();
        assert_eq!(decode(&Cell::Null, &ty, "source").unwrap(), Value::StrList(vec![]));
    }

    #[test]
    fn test_int_mismatch() {
        let ty = SchemaType::Int;
        assert!(encode(CellInput::from("abc"), &ty, "jobid").is_err());
    }
}
