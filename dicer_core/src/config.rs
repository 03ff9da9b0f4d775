use crate::constraint::DEFAULT_FAIL_RATIO;
use crate::manager::DEFAULT_MAX_SWEEPS;
use crate::symbol::DEFAULT_SAMPLE_RETRIES;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Fresh items tried per iteration when generation hits a retryable error.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

pub fn default_iterations() -> u64 {
    1_000
}
pub fn default_max_retries() -> usize {
    10
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            seed: None,
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GenerationSettings {
    /// Default for records that carry no `fail-ratio` of their own.
    #[serde(default = "default_fail_ratio")]
    pub fail_ratio: f64,
    #[serde(default = "default_sample_retries")]
    pub sample_retries: usize,
    #[serde(default = "default_max_sweeps")]
    pub max_sweeps: usize,
}

fn default_fail_ratio() -> f64 {
    DEFAULT_FAIL_RATIO
}
fn default_sample_retries() -> usize {
    DEFAULT_SAMPLE_RETRIES
}
fn default_max_sweeps() -> usize {
    DEFAULT_MAX_SWEEPS
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            fail_ratio: default_fail_ratio(),
            sample_retries: default_sample_retries(),
            max_sweeps: default_max_sweeps(),
        }
    }
}

/// How to launch the target for one item. `{field}` placeholders in `command`
/// are replaced by the item's field values.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default)]
    pub provider_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl TargetSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DicerConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub target: TargetSettings,
}

impl DicerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: DicerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        if !(0.0..=1.0).contains(&config.generation.fail_ratio) {
            anyhow::bail!(
                "generation.fail-ratio must be within 0..=1, got {}",
                config.generation.fail_ratio
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config: DicerConfig = toml::from_str("").unwrap();
        assert_eq!(config, DicerConfig::default());
        assert_eq!(config.generation.fail_ratio, 0.1);
        assert_eq!(config.target.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn full_config_parses_kebab_case_keys() {
        let config: DicerConfig = toml::from_str(
            r#"
            [fuzzer]
            max-iterations = 50
            seed = 7
            max-retries = 3

            [generation]
            fail-ratio = 0.25
            sample-retries = 200
            max-sweeps = 8

            [target]
            provider-dirs = ["providers/disk"]
            command = ["mkfs", "--size", "{size}"]
            timeout-ms = 500
            working-dir = "/tmp"
            "#,
        )
        .unwrap();
        assert_eq!(config.fuzzer.max_iterations, 50);
        assert_eq!(config.fuzzer.seed, Some(7));
        assert_eq!(config.generation.fail_ratio, 0.25);
        assert_eq!(config.generation.max_sweeps, 8);
        assert_eq!(config.target.command[2], "{size}");
        assert_eq!(config.target.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<DicerConfig>("[fuzzer]\nthreads = 4\n").is_err());
    }

    #[test]
    fn load_from_file_validates_fail_ratio() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[generation]\nfail-ratio = 2.0").unwrap();
        let err = DicerConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("fail-ratio"), "{err}");

        assert!(DicerConfig::load_from_file(Path::new("/nonexistent/dicer.toml")).is_err());
    }
}
