//! Oracle records on disk and the providers built from them.
//!
//! A provider directory holds YAML files under `oracles/`, each a list of
//! records:
//!
//! ```yaml
//! - name: size
//!   oracle: |
//!     if size Is Integer:
//!         if size Gt 0:
//!             return success()
//!         return fail("invalid size")
//! - name: label
//!   require: size is passed
//!   path: /meta/label
//!   fail-ratio: 0.3
//!   oracle: meta.label Is String
//! ```

use crate::config::GenerationSettings;
use crate::constraint::{Constraint, ConstraintError};
use crate::helpers::HelperRegistry;
use crate::item::{FieldItem, Item};
use crate::manager::{ConstraintManager, ManagerError, Precondition, Statuses};
use crate::trace::Solver;
use crate::value::FieldPath;
use log::{info, warn};
use rand_core::RngCore;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse oracle records in {path:?}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("No oracle records found under {0:?}")]
    NoRecords(PathBuf),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Generation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: ManagerError,
    },
}

/// One oracle definition as written in a provider's YAML files.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleRecord {
    pub name: String,
    #[serde(default)]
    pub require: Option<String>,
    #[serde(default)]
    pub path: Option<FieldPath>,
    pub oracle: String,
    #[serde(default)]
    pub fail_ratio: Option<f64>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProviderError + '_ {
    move |source| ProviderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads every `*.yaml`/`*.yml` file under `<dir>/oracles`, in file name order.
pub fn load_records(dir: &Path) -> Result<Vec<OracleRecord>, ProviderError> {
    let oracle_dir = dir.join("oracles");
    let mut files: Vec<PathBuf> = fs::read_dir(&oracle_dir)
        .map_err(io_error(&oracle_dir))?
        .map(|entry| entry.map(|e| e.path()).map_err(io_error(&oracle_dir)))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    files.sort();

    let mut records = Vec::new();
    for file in &files {
        let content = fs::read_to_string(file).map_err(io_error(file))?;
        let parsed: Option<Vec<OracleRecord>> =
            serde_yaml::from_str(&content).map_err(|source| ProviderError::Yaml {
                path: file.clone(),
                source,
            })?;
        match parsed {
            Some(batch) => records.extend(batch),
            None => warn!("Oracle file {file:?} is empty"),
        }
    }
    if records.is_empty() {
        return Err(ProviderError::NoRecords(oracle_dir));
    }
    Ok(records)
}

/// Compiles records into a manager. `fail_ratio` applies where a record sets none.
pub fn build_manager(
    records: &[OracleRecord],
    helpers: &HelperRegistry,
    settings: &GenerationSettings,
) -> Result<ConstraintManager, ProviderError> {
    let mut constraints = Vec::with_capacity(records.len());
    for record in records {
        let constraint = Constraint::new(
            record.name.clone(),
            record.path.clone(),
            &record.oracle,
            helpers,
        )?
        .with_fail_ratio(record.fail_ratio.unwrap_or(settings.fail_ratio))?;
        let require = record
            .require
            .as_deref()
            .map(|src| {
                Precondition::parse(src).map_err(|source| ManagerError::Precondition {
                    name: record.name.clone(),
                    source,
                })
            })
            .transpose()?;
        constraints.push((constraint, require));
    }
    Ok(ConstraintManager::new(constraints)?.with_max_sweeps(settings.max_sweeps))
}

/// Source of constrained items for one target.
pub trait Provider {
    type Item: Item;

    fn name(&self) -> &str;

    fn manager(&self) -> &ConstraintManager;

    fn helpers(&self) -> &HelperRegistry;

    fn sample_retries(&self) -> usize;

    fn new_item(&self) -> Self::Item;

    /// Builds one item and runs every constraint on it.
    fn generate(&self, rng: &mut dyn RngCore) -> Result<(Self::Item, Statuses), ManagerError> {
        let mut item = self.new_item();
        let solver = Solver::new(self.helpers()).with_sample_retries(self.sample_retries());
        let statuses = self.manager().constrain(&mut item, &solver, rng)?;
        Ok((item, statuses))
    }

    /// Like `generate`, starting over with a fresh item on retryable errors.
    fn generate_with_retries(
        &self,
        rng: &mut dyn RngCore,
        attempts: usize,
    ) -> Result<(Self::Item, Statuses), ProviderError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.generate(rng) {
                Ok(generated) => return Ok(generated),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("Provider '{}' attempt {attempt}/{attempts}: {e}", self.name());
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(ProviderError::RetriesExhausted { attempts, last: e });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Provider backed by a directory of oracle files, producing [`FieldItem`]s.
#[derive(Debug)]
pub struct DirectoryProvider {
    name: String,
    root: PathBuf,
    helpers: HelperRegistry,
    manager: ConstraintManager,
    sample_retries: usize,
}

impl DirectoryProvider {
    /// Loads and compiles `<dir>/oracles`. `helpers` must already hold every
    /// helper the oracles call.
    pub fn load(
        dir: &Path,
        helpers: HelperRegistry,
        settings: &GenerationSettings,
    ) -> Result<Self, ProviderError> {
        let records = load_records(dir)?;
        let manager = build_manager(&records, &helpers, settings)?;
        manager.check_paths(&FieldItem::new())?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        info!(
            "Loaded provider '{name}' with {} constraints from {dir:?}",
            manager.len()
        );
        Ok(Self {
            name,
            root: dir.to_path_buf(),
            helpers,
            manager,
            sample_retries: settings.sample_retries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Provider for DirectoryProvider {
    type Item = FieldItem;

    fn name(&self) -> &str {
        &self.name
    }

    fn manager(&self) -> &ConstraintManager {
        &self.manager
    }

    fn helpers(&self) -> &HelperRegistry {
        &self.helpers
    }

    fn sample_retries(&self) -> usize {
        self.sample_retries
    }

    fn new_item(&self) -> FieldItem {
        FieldItem::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_deserialize_with_optional_fields() {
        let records: Vec<OracleRecord> = serde_yaml::from_str(
            r#"
- name: size
  oracle: size Is Integer
- name: label
  require: size is passed
  path: /meta/label
  fail-ratio: 0.5
  oracle: |
    if meta.label Is String:
        return success()
    return fail("bad label")
"#,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].require, None);
        assert_eq!(records[1].path, Some("meta.label".parse().unwrap()));
        assert_eq!(records[1].fail_ratio, Some(0.5));
        assert!(records[1].oracle.contains("return fail"));
    }

    #[test]
    fn unknown_record_keys_are_rejected() {
        let parsed: Result<Vec<OracleRecord>, _> =
            serde_yaml::from_str("- name: a\n  oracle: a Is Integer\n  weight: 3\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn build_manager_applies_default_and_record_ratios() {
        let records: Vec<OracleRecord> = serde_yaml::from_str(
            "- name: a\n  oracle: a Is Integer\n- name: b\n  fail-ratio: 0.9\n  oracle: b Is Integer\n",
        )
        .unwrap();
        let settings = GenerationSettings {
            fail_ratio: 0.2,
            ..GenerationSettings::default()
        };
        let manager = build_manager(&records, &HelperRegistry::new(), &settings).unwrap();
        let ratios: Vec<f64> = manager.constraints().map(Constraint::fail_ratio).collect();
        assert_eq!(ratios, vec![0.2, 0.9]);
    }

    #[test]
    fn malformed_precondition_names_the_record() {
        let records: Vec<OracleRecord> = serde_yaml::from_str(
            "- name: a\n  require: b Gt 3\n  oracle: a Is Integer\n- name: b\n  oracle: b Is Integer\n",
        )
        .unwrap();
        let err = build_manager(&records, &HelperRegistry::new(), &GenerationSettings::default())
            .unwrap_err();
        assert!(
            matches!(&err, ProviderError::Manager(ManagerError::Precondition { name, .. }) if name == "a"),
            "{err}"
        );
    }
}
