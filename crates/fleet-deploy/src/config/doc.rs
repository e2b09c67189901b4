use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// A fleet file with its `extends` chain already folded in.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        self.value
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("invalid config {}: {e}", self.path.display())))
    }
}

/// Deep-merge `overlay` into `base`; tables merge key by key, anything else replaces.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(slot) => merge(slot, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// `extends` is one path or a list, relative to the file that names it.
fn base_files(file: &Path, value: &mut Value) -> Result<Vec<PathBuf>> {
    let Some(raw) = value.as_table_mut().and_then(|t| t.remove("extends")) else {
        return Ok(Vec::new());
    };
    let names = match raw {
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(Error::msg(format!(
                    "'extends' in {} must list file paths",
                    file.display()
                ))),
            })
            .collect::<Result<_>>()?,
        _ => {
            return Err(Error::msg(format!(
                "'extends' in {} must be a path or a list of paths",
                file.display()
            )));
        }
    };
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    Ok(names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(|n| dir.join(n))
        .collect())
}

fn load_chain(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if chain.contains(&key) {
        return Err(Error::msg(format!(
            "config extends cycle at {}",
            key.display()
        )));
    }
    chain.push(key);

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut own = ConfigDoc::parse(path, &raw)?.value;
    let mut merged = Value::Table(Default::default());
    for base in base_files(path, &mut own)? {
        merge(&mut merged, load_chain(&base, chain)?);
    }
    merge(&mut merged, own);

    chain.pop();
    Ok(merged)
}

/// Read `path`, layering it over every file it `extends` (in listed order).
pub fn load_doc(path: &Path) -> Result<ConfigDoc> {
    let value = load_chain(path, &mut Vec::new())?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}
