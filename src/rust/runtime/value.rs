// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    component::ComponentId,
    runtime::fail::Fail,
};
use ::std::{
    collections::BTreeMap,
    fmt,
};
use ::yaml_rust::{
    yaml::Hash,
    Yaml,
};

//==============================================================================
// Structures
//==============================================================================

/// Dynamically-typed value exchanged at the message boundary.
///
/// Configuration mappings, call arguments and call results are all carried as
/// values of this type.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Component(ComponentId),
}

/// A configuration section or keyword argument bag.
pub type ValueMap = BTreeMap<String, Value>;

//==============================================================================
// Associate Functions
//==============================================================================

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Result<&str, Fail> {
        match self {
            Value::Str(s) => Ok(s.as_str()),
            _ => Err(Self::unexpected("string", self)),
        }
    }

    /// Reads an integer. Strings holding an integer are accepted.
    pub fn as_int(&self) -> Result<i64, Fail> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
            Value::Str(s) => s.trim().parse::<i64>().map_err(|_| Self::unexpected("integer", self)),
            _ => Err(Self::unexpected("integer", self)),
        }
    }

    /// Reads a non-negative integer as a count.
    pub fn as_usize(&self) -> Result<usize, Fail> {
        let i: i64 = self.as_int()?;
        match usize::try_from(i) {
            Ok(u) => Ok(u),
            Err(_) => Err(Fail::new(libc::ERANGE, &format!("value {} is out of range", i))),
        }
    }

    /// Reads a floating point number. Integers and numeric strings are accepted.
    pub fn as_float(&self) -> Result<f64, Fail> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::Str(s) => s.trim().parse::<f64>().map_err(|_| Self::unexpected("float", self)),
            _ => Err(Self::unexpected("float", self)),
        }
    }

    /// Reads a flag. Accepts the usual textual spellings found in config files.
    pub fn as_bool(&self) -> Result<bool, Fail> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Str(s) => match s.trim().to_uppercase().as_str() {
                "TRUE" | "ON" | "YES" | "1" => Ok(true),
                "FALSE" | "OFF" | "NO" | "0" | "" => Ok(false),
                _ => Err(Self::unexpected("boolean", self)),
            },
            _ => Err(Self::unexpected("boolean", self)),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], Fail> {
        match self {
            Value::List(l) => Ok(l.as_slice()),
            _ => Err(Self::unexpected("list", self)),
        }
    }

    pub fn as_map(&self) -> Result<&ValueMap, Fail> {
        match self {
            Value::Map(m) => Ok(m),
            _ => Err(Self::unexpected("mapping", self)),
        }
    }

    pub fn as_map_mut(&mut self) -> Result<&mut ValueMap, Fail> {
        match self {
            Value::Map(m) => Ok(m),
            other => Err(Self::unexpected("mapping", other)),
        }
    }

    pub fn as_component(&self) -> Result<&ComponentId, Fail> {
        match self {
            Value::Component(id) => Ok(id),
            _ => Err(Self::unexpected("component id", self)),
        }
    }

    /// Reads a list of words. Both a whitespace separated string and a list of
    /// scalars are accepted; `None` reads as the empty list.
    pub fn to_string_list(&self) -> Result<Vec<String>, Fail> {
        match self {
            Value::None => Ok(Vec::new()),
            Value::Str(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
            Value::List(l) => l
                .iter()
                .map(|v| match v {
                    Value::List(_) | Value::Map(_) | Value::None => Err(Self::unexpected("scalar", v)),
                    _ => Ok(v.to_string()),
                })
                .collect(),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(vec![self.to_string()]),
            _ => Err(Self::unexpected("list of words", self)),
        }
    }

    /// Reads a list of numbers in the same shapes accepted by [Value::to_string_list].
    pub fn to_float_list(&self) -> Result<Vec<f64>, Fail> {
        match self {
            Value::List(l) => l.iter().map(Value::as_float).collect(),
            _ => self
                .to_string_list()?
                .iter()
                .map(|s| s.parse::<f64>().map_err(|_| Self::unexpected("float", self)))
                .collect(),
        }
    }

    /// Converts a parsed YAML document node.
    pub fn from_yaml(yaml: &Yaml) -> Value {
        match yaml {
            Yaml::Null | Yaml::BadValue | Yaml::Alias(_) => Value::None,
            Yaml::Boolean(b) => Value::Bool(*b),
            Yaml::Integer(i) => Value::Int(*i),
            Yaml::Real(_) => match yaml.as_f64() {
                Some(f) => Value::Float(f),
                None => Value::None,
            },
            Yaml::String(s) => Value::Str(s.clone()),
            Yaml::Array(a) => Value::List(a.iter().map(Value::from_yaml).collect()),
            Yaml::Hash(h) => {
                let mut map: ValueMap = ValueMap::new();
                for (k, v) in h {
                    let key: String = match k {
                        Yaml::String(s) => s.clone(),
                        Yaml::Integer(i) => i.to_string(),
                        Yaml::Real(r) => r.clone(),
                        Yaml::Boolean(b) => b.to_string(),
                        _ => continue,
                    };
                    map.insert(key, Value::from_yaml(v));
                }
                Value::Map(map)
            },
        }
    }

    /// Converts into a YAML node, e.g. for writing a merged configuration back out.
    pub fn to_yaml(&self) -> Yaml {
        match self {
            Value::None => Yaml::Null,
            Value::Bool(b) => Yaml::Boolean(*b),
            Value::Int(i) => Yaml::Integer(*i),
            Value::Float(f) => Yaml::Real(format!("{:?}", f)),
            Value::Str(s) => Yaml::String(s.clone()),
            Value::List(l) => Yaml::Array(l.iter().map(Value::to_yaml).collect()),
            Value::Map(m) => {
                let mut hash: Hash = Hash::new();
                for (k, v) in m {
                    hash.insert(Yaml::String(k.clone()), v.to_yaml());
                }
                Yaml::Hash(hash)
            },
            Value::Component(id) => Yaml::String(id.to_string()),
        }
    }

    fn unexpected(expected: &str, got: &Value) -> Fail {
        let cause: String = format!("expected {}, found {:?}", expected, got);
        Fail::new(libc::EINVAL, &cause)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Renders scalars the way they are spelled in configuration files.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(l) => {
                let words: Vec<String> = l.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", words.join(" "))
            },
            Value::Map(m) => write!(f, "{:?}", m),
            Value::Component(id) => write!(f, "{}", id),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<usize> for Value {
    fn from(u: usize) -> Self {
        Value::Int(u as i64)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::Int(u as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<ComponentId> for Value {
    fn from(id: ComponentId) -> Self {
        Value::Component(id)
    }
}

impl From<ValueMap> for Value {
    fn from(m: ValueMap) -> Self {
        Value::Map(m)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        match o {
            Some(v) => v.into(),
            None => Value::None,
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
