use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::MatchError;
use crate::output::ReportFormat;

/// RSA threshold below which a position counts as buried
pub const DEFAULT_RSA_THRESHOLD: f64 = 0.25;

/// Settings for a matching run, loaded from TOML and overridden by CLI flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchConfig {
    pub rsa_threshold: f64,
    /// Allele reference store (JSON, optionally gzipped)
    pub database: Option<PathBuf>,
    /// Directory holding eplets_I.json, eplets_DQ.json and eplets_DRB.json
    pub eplets_dir: Option<PathBuf>,
    pub output: PathBuf,
    pub format: ReportFormat,
    /// Worker threads for batch runs (0 = auto)
    pub threads: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            rsa_threshold: DEFAULT_RSA_THRESHOLD,
            database: None,
            eplets_dir: None,
            output: PathBuf::from("./results"),
            format: ReportFormat::Json,
            threads: 0,
        }
    }
}

impl MatchConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: MatchConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), MatchError> {
        if !self.rsa_threshold.is_finite() || !(0.0..=1.0).contains(&self.rsa_threshold) {
            return Err(MatchError::Input(format!(
                "RSA threshold must be between 0 and 1, got {}",
                self.rsa_threshold
            )));
        }
        Ok(())
    }

    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}
