//! Configuration: optional YAML file + env var overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "persona.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorConfig {
    /// Directory holding the snapshot and backup files
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Snapshot key (file stem for the file backend)
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Whether snapshots are written at all
    #[serde(default = "default_true")]
    pub persistence: bool,

    /// Periodic background save
    #[serde(default = "default_true")]
    pub autosave: bool,

    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_seconds: u64,

    /// Upper bound on conditions per complex trigger
    #[serde(default = "default_max_conditions")]
    pub max_conditions: usize,

    /// Reject associations pointing at missing memories/emotions on add/update
    #[serde(default = "default_true")]
    pub enforce_association_references: bool,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".persona")
}
fn default_storage_key() -> String {
    "upps_persona_data".into()
}
fn default_true() -> bool {
    true
}
fn default_autosave_interval() -> u64 {
    30
}
fn default_max_conditions() -> usize {
    10
}

impl EditorConfig {
    /// Load config from a YAML file with env var overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;

        let mut config: EditorConfig = if content.trim().is_empty() {
            EditorConfig::default()
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        };

        // Relative storage dirs resolve against the config file's directory
        if config.storage_dir.is_relative() {
            if let Some(parent) = config_path.parent() {
                config.storage_dir = parent.join(&config.storage_dir);
            }
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load `dir/persona.yaml` if present, otherwise defaults (env overrides still apply).
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(DEFAULT_CONFIG_FILE);
        if config_path.exists() {
            return Self::load(&config_path);
        }
        let mut config = EditorConfig {
            storage_dir: dir.join(default_storage_dir()),
            ..EditorConfig::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("PERSONA_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Ok(key) = std::env::var("PERSONA_STORAGE_KEY") {
            self.storage_key = key;
        }
        if let Ok(secs) = std::env::var("PERSONA_AUTOSAVE_SECONDS") {
            self.autosave_interval_seconds = secs
                .trim()
                .parse()
                .with_context(|| format!("PERSONA_AUTOSAVE_SECONDS is not a number: {secs}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.autosave_interval_seconds == 0 {
            anyhow::bail!("autosave_interval_seconds must be greater than 0");
        }
        if self.max_conditions == 0 {
            anyhow::bail!("max_conditions must be at least 1");
        }
        if self.storage_key.trim().is_empty() {
            anyhow::bail!("storage_key must not be empty");
        }
        Ok(())
    }

    /// Location of the primary snapshot for the file backend.
    pub fn snapshot_path(&self) -> PathBuf {
        self.storage_dir.join(format!("{}.json", self.storage_key))
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            storage_key: default_storage_key(),
            persistence: true,
            autosave: true,
            autosave_interval_seconds: default_autosave_interval(),
            max_conditions: default_max_conditions(),
            enforce_association_references: true,
        }
    }
}
