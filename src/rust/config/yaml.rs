// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    value::{
        Value,
        ValueMap,
    },
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Bound on nested `$NAME` references followed while expanding one string.
const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Characters that disqualify an environment variable from being merged into a configuration.
const ENV_REJECTED_CHARS: &[char] = &['{', '}', '(', ')', '$'];

//======================================================================================================================
// Structures
//======================================================================================================================

/// A configuration file holding exactly one YAML mapping.
#[derive(Clone, Debug)]
pub struct ConfigFile {
    path: PathBuf,
    root: Yaml,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ConfigFile {
    /// Reads and parses the configuration file at `path`.
    pub fn new(path: &Path) -> Result<Self, Fail> {
        let mut text: String = String::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_string(&mut text)?;
            },
            Err(e) => {
                let cause: String = format!("cannot open configuration file {:?} ({})", path, e);
                error!("new(): {}", cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        }
        Self::from_str_at(&text, path)
    }

    /// Parses `text` as if it had been read from `path`.
    pub fn from_str_at(text: &str, path: &Path) -> Result<Self, Fail> {
        let documents: Vec<Yaml> = YamlLoader::load_from_str(text)?;
        let root: &Yaml = match &documents[..] {
            [doc] => doc,
            _ => {
                let cause: String = format!("{:?} must hold exactly one document", path);
                error!("from_str_at(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if !matches!(root, Yaml::Hash(_)) {
            let cause: String = format!("{:?} is not a mapping", path);
            error!("from_str_at(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(Self {
            path: path.to_path_buf(),
            root: root.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Yaml {
        &self.root
    }

    /// Directory holding the file, made absolute against the current directory.
    pub fn directory(&self) -> PathBuf {
        let absolute: PathBuf = if self.path.is_absolute() {
            self.path.clone()
        } else {
            match ::std::env::current_dir() {
                Ok(cwd) => cwd.join(&self.path),
                Err(_) => self.path.clone(),
            }
        };
        match absolute.parent() {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("/"),
        }
    }

    /// Converts the whole document into a value mapping.
    pub fn to_map(&self) -> Result<ValueMap, Fail> {
        match Value::from_yaml(&self.root) {
            Value::Map(map) => Ok(map),
            _ => Err(Fail::new(libc::EINVAL, "configuration root is not a mapping")),
        }
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Same as [ConfigFile::get_option], additionally checking that the option is a mapping.
    pub fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let cause: String = format!("section \"{}\" is not a mapping", index);
                error!("get_subsection(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    pub fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let cause: String = format!("missing configuration option \"{}\"", index);
                error!("get_option(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    pub fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let cause: String = format!("parameter \"{}\" has unexpected type", index);
                error!("get_typed_option(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating it as a string accepted by `parser`.
    pub fn get_typed_str_option<T, Fn>(yaml: &Yaml, index: &str, parser: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&str) -> Option<T>,
    {
        let option: &Yaml = Self::get_option(yaml, index)?;
        if let Some(value) = option.as_str() {
            if let Some(value) = parser(value) {
                return Ok(value);
            }
        }
        let cause: String = format!("parameter \"{}\" has unexpected value {:?}", index, option);
        error!("get_typed_str_option(): {}", cause);
        Err(Fail::new(libc::EINVAL, &cause))
    }

    /// Index `yaml` to find a flag at `index`. YAML booleans and the ON/OFF, TRUE/FALSE, YES/NO spellings are
    /// accepted.
    pub fn get_bool_option(yaml: &Yaml, index: &str) -> Result<bool, Fail> {
        let option: &Yaml = Self::get_option(yaml, index)?;
        let flag: Option<bool> = match option {
            Yaml::Boolean(b) => Some(*b),
            Yaml::Integer(i) => Some(*i != 0),
            Yaml::String(s) => match s.trim().to_uppercase().as_str() {
                "TRUE" | "ON" | "YES" => Some(true),
                "FALSE" | "OFF" | "NO" => Some(false),
                _ => None,
            },
            _ => None,
        };
        match flag {
            Some(flag) => Ok(flag),
            None => {
                let cause: String = format!("parameter \"{}\" is not a flag ({:?})", index, option);
                error!("get_bool_option(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    pub fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            return match var.trim().parse() {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    let cause: String = format!("environment variable {} has unexpected type", index);
                    error!("get_typed_env_option(): {}", cause);
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            };
        }
        Ok(None)
    }

    /// Similar to [ConfigFile::get_typed_option] using `Yaml::as_i64` as the receiver, but additionally verifies that
    /// the destination type may hold the value.
    pub fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let cause: String = format!("parameter \"{}\" is out of range", index);
                error!("get_int_option(): {}", cause);
                Err(Fail::new(libc::ERANGE, &cause))
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the mapping of process environment variables eligible for merging into configurations.
pub fn environment_map<I>(vars: I) -> ValueMap
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(_, v)| !v.contains(ENV_REJECTED_CHARS))
        .map(|(k, v)| (k, Value::Str(v)))
        .collect()
}

/// Copies into `dst` every entry of `src` whose key `dst` lacks.
pub fn merge_absent(dst: &mut ValueMap, src: &ValueMap) {
    for (key, value) in src.iter() {
        if !dst.contains_key(key) {
            dst.insert(key.clone(), value.clone());
        }
    }
}

/// Expands `$NAME`, `${NAME}` and `$$` throughout `map`.
///
/// Names resolve against the enclosing section first and the top-level mapping second. Unknown names are left as
/// they are.
pub fn interpolate(map: &mut ValueMap) {
    let top: ValueMap = map.clone();
    for value in map.values_mut() {
        match value {
            Value::Map(section) => {
                let local: ValueMap = section.clone();
                for inner in section.values_mut() {
                    interpolate_value(inner, &local, &top);
                }
            },
            other => interpolate_value(other, &top, &top),
        }
    }
}

/// Expands references in a single string.
pub fn expand(text: &str, local: &ValueMap, global: &ValueMap) -> String {
    expand_at_depth(text, local, global, 0)
}

fn interpolate_value(value: &mut Value, local: &ValueMap, global: &ValueMap) {
    match value {
        Value::Str(s) if s.contains('$') => *s = expand(s, local, global),
        Value::List(items) => {
            for item in items.iter_mut() {
                interpolate_value(item, local, global);
            }
        },
        Value::Map(section) => {
            for inner in section.values_mut() {
                interpolate_value(inner, local, global);
            }
        },
        _ => (),
    }
}

fn lookup(name: &str, local: &ValueMap, global: &ValueMap) -> Option<String> {
    let found: &Value = match local.get(name) {
        Some(v) => v,
        None => global.get(name)?,
    };
    match found {
        Value::Map(_) | Value::None => None,
        v => Some(v.to_string()),
    }
}

fn expand_at_depth(text: &str, local: &ValueMap, global: &ValueMap, depth: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out: String = String::with_capacity(text.len());
    let mut i: usize = 0;
    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        // "$$" escapes a dollar sign.
        if chars.get(i + 1) == Some(&'$') {
            out.push('$');
            i += 2;
            continue;
        }
        let (name, end): (String, usize) = if chars.get(i + 1) == Some(&'{') {
            match chars[i + 2..].iter().position(|c| *c == '}') {
                Some(offset) => (chars[i + 2..i + 2 + offset].iter().collect(), i + 3 + offset),
                None => (String::new(), i + 1),
            }
        } else {
            let len: usize = chars[i + 1..]
                .iter()
                .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                .count();
            (chars[i + 1..i + 1 + len].iter().collect(), i + 1 + len)
        };
        let replacement: Option<String> = if name.is_empty() {
            None
        } else {
            lookup(&name, local, global)
        };
        match replacement {
            Some(r) if depth < MAX_INTERPOLATION_DEPTH && r.contains('$') => {
                out.push_str(&expand_at_depth(&r, local, global, depth + 1))
            },
            Some(r) => out.push_str(&r),
            None => out.extend(&chars[i..end.max(i + 1)]),
        }
        i = end.max(i + 1);
    }
    out
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        environment_map,
        interpolate,
        ConfigFile,
    };
    use crate::runtime::value::{
        Value,
        ValueMap,
    };
    use ::anyhow::Result;
    use ::std::path::Path;

    fn parse(text: &str) -> Result<ValueMap> {
        Ok(ConfigFile::from_str_at(text, Path::new("test.yaml"))?.to_map()?)
    }

    /// Tests flag spellings.
    #[test]
    fn test_bool_option() -> Result<()> {
        let file: ConfigFile =
            ConfigFile::from_str_at("A: true\nB: OFF\nC: yes\nD: maybe\n", Path::new("test.yaml"))?;
        crate::ensure_eq!(ConfigFile::get_bool_option(file.root(), "A")?, true);
        crate::ensure_eq!(ConfigFile::get_bool_option(file.root(), "B")?, false);
        crate::ensure_eq!(ConfigFile::get_bool_option(file.root(), "C")?, true);
        if ConfigFile::get_bool_option(file.root(), "D").is_ok() {
            anyhow::bail!("\"maybe\" is not a flag");
        }
        if ConfigFile::get_bool_option(file.root(), "E").is_ok() {
            anyhow::bail!("a missing flag should be reported");
        }
        Ok(())
    }

    /// Tests references to top-level and section keys.
    #[test]
    fn test_interpolate_sections() -> Result<()> {
        let mut map: ValueMap = parse(
            "SIM_ROOT: /tmp/run\nSIM_NAME: demo\nLOG_FILE: ${SIM_ROOT}/$SIM_NAME.log\nDRV:\n  NAME: drv\n  BIN: \
             $SIM_ROOT/bin/$NAME\n  PRICE: $$5\n",
        )?;
        interpolate(&mut map);
        crate::ensure_eq!(map.get("LOG_FILE"), Some(&Value::from("/tmp/run/demo.log")));
        let section: &ValueMap = match map.get("DRV") {
            Some(Value::Map(section)) => section,
            _ => anyhow::bail!("section DRV is missing"),
        };
        crate::ensure_eq!(section.get("BIN"), Some(&Value::from("/tmp/run/bin/drv")));
        crate::ensure_eq!(section.get("PRICE"), Some(&Value::from("$5")));
        Ok(())
    }

    /// Tests that unknown names and reference cycles are left in place.
    #[test]
    fn test_interpolate_unknown_and_cycles() -> Result<()> {
        let mut map: ValueMap = parse("A: $B\nB: $A\nC: $NOPE/x\nD: ${open\n")?;
        interpolate(&mut map);
        crate::ensure_eq!(map.get("C"), Some(&Value::from("$NOPE/x")));
        crate::ensure_eq!(map.get("D"), Some(&Value::from("${open")));
        crate::ensure_eq!(map.get("A").map(|v| v.to_string().starts_with('$')), Some(true));
        Ok(())
    }

    /// Tests that missing options and non-mapping sections are rejected.
    #[test]
    fn test_option_lookup() -> Result<()> {
        let file: ConfigFile = ConfigFile::from_str_at("A: 3\nS:\n  X: 1\n", Path::new("t.yaml"))?;
        crate::ensure_eq!(ConfigFile::get_int_option::<u8>(file.root(), "A")?, 3);
        crate::ensure_eq!(ConfigFile::get_option(file.root(), "B").is_err(), true);
        crate::ensure_eq!(ConfigFile::get_subsection(file.root(), "A").is_err(), true);
        crate::ensure_eq!(ConfigFile::get_subsection(file.root(), "S").is_ok(), true);
        crate::ensure_eq!(ConfigFile::from_str_at("- 1\n- 2\n", Path::new("l.yaml")).is_err(), true);
        Ok(())
    }

    /// Tests that environment values resembling shell functions are filtered.
    #[test]
    fn test_environment_filter() -> Result<()> {
        let env: ValueMap = environment_map(vec![
            ("HOME".to_string(), "/home/u".to_string()),
            ("BASH_FUNC".to_string(), "() { echo; }".to_string()),
            ("PS1".to_string(), "$ ".to_string()),
        ]);
        crate::ensure_eq!(env.len(), 1);
        crate::ensure_eq!(env.get("HOME"), Some(&Value::from("/home/u")));
        Ok(())
    }
}
