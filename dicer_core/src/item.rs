use crate::value::{FieldPath, Value};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Errors raised when writing a field onto an item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// The item has no field at this path.
    #[error("Item does not accept path '{0}'")]
    UnknownPath(String),
    /// The item knows the path but refuses the value.
    #[error("Item rejected value for '{path}': {reason}")]
    Rejected { path: String, reason: String },
}

/// One test invocation under construction.
///
/// Constraints read sibling fields through `get` (for guards and helper
/// arguments), write exactly one field each through `set`, and record the
/// failure signatures the target is expected to print.
pub trait Item: fmt::Debug {
    fn get(&self, path: &FieldPath) -> Option<Value>;

    fn set(&mut self, path: &FieldPath, value: Value) -> Result<(), ItemError>;

    /// Whether `set` can ever succeed for `path`. Checked once when constraints load.
    fn accepts(&self, _path: &FieldPath) -> bool {
        true
    }

    fn fail_patts(&self) -> &BTreeSet<String>;

    fn add_fail_patt(&mut self, pattern: String);
}

/// Map-backed item keyed by dotted field path, with an optional closed schema.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldItem {
    fields: BTreeMap<String, Value>,
    #[serde(skip)]
    schema: Option<BTreeSet<FieldPath>>,
    fail_patts: BTreeSet<String>,
}

impl FieldItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// An item that only accepts the given paths.
    pub fn with_schema(paths: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            schema: Some(paths.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Item for FieldItem {
    fn get(&self, path: &FieldPath) -> Option<Value> {
        self.fields.get(&path.to_string()).cloned()
    }

    fn set(&mut self, path: &FieldPath, value: Value) -> Result<(), ItemError> {
        if !self.accepts(path) {
            return Err(ItemError::UnknownPath(path.to_string()));
        }
        self.fields.insert(path.to_string(), value);
        Ok(())
    }

    fn accepts(&self, path: &FieldPath) -> bool {
        self.schema.as_ref().is_none_or(|s| s.contains(path))
    }

    fn fail_patts(&self) -> &BTreeSet<String> {
        &self.fail_patts
    }

    fn add_fail_patt(&mut self, pattern: String) {
        self.fail_patts.insert(pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> FieldPath {
        raw.parse().unwrap()
    }

    #[test]
    fn set_then_get_by_either_path_spelling() {
        let mut item = FieldItem::new();
        item.set(&path("/disk/size"), Value::Int(4)).unwrap();
        assert_eq!(item.get(&path("disk.size")), Some(Value::Int(4)));
        assert_eq!(item.get(&path("disk.name")), None);
        assert_eq!(item.len(), 1);
    }

    #[test]
    fn schema_rejects_unknown_paths() {
        let mut item = FieldItem::with_schema([path("name")]);
        assert!(item.accepts(&path("name")));
        assert!(!item.accepts(&path("size")));
        assert_eq!(
            item.set(&path("size"), Value::Int(1)),
            Err(ItemError::UnknownPath("size".into()))
        );
        assert!(item.is_empty());
    }

    #[test]
    fn fail_patterns_accumulate_without_duplicates() {
        let mut item = FieldItem::new();
        item.add_fail_patt("invalid size".into());
        item.add_fail_patt("invalid size".into());
        item.add_fail_patt("bad name".into());
        let patts: Vec<&str> = item.fail_patts().iter().map(String::as_str).collect();
        assert_eq!(patts, vec!["bad name", "invalid size"]);
    }
}
