// ⚙️ Run configuration (TOML)
//
// Every field has a default, so an empty file is a valid configuration.
// Display-name tables given here are layered over the built-in constants.

use crate::constants::{AGENCY_DISPLAY_NAMES, ASSISTANCE_TYPE_DISPLAY_NAMES, FISCAL_YEARS};
use crate::error::ReconError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// SQLite database holding the relational snapshot
    pub database: PathBuf,

    /// Base directory for relative source paths
    pub data_dir: PathBuf,

    /// Fiscal years covered by per-program series
    pub fiscal_years: Vec<String>,

    pub sources: SourcePaths,

    /// Extra registry agency name → display name entries
    pub agency_display_names: HashMap<String, String>,

    /// Extra registry assistance-type label → display name entries
    pub assistance_type_display_names: HashMap<String, String>,

    /// Contract funding office code → program id
    pub contract_office_programs: HashMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            database: PathBuf::from("transformed/database.db"),
            data_dir: PathBuf::from("data"),
            fiscal_years: FISCAL_YEARS.iter().map(|y| y.to_string()).collect(),
            sources: SourcePaths::default(),
            agency_display_names: HashMap::new(),
            assistance_type_display_names: HashMap::new(),
            contract_office_programs: HashMap::new(),
        }
    }
}

// ============================================================================
// SOURCE PATHS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcePaths {
    pub assistance_listings: PathBuf,
    pub dictionary: PathBuf,
    pub organizations: PathBuf,
    pub usaspending_hashes: PathBuf,
    pub category_mapping: PathBuf,
    pub additional_programs: PathBuf,
    pub improper_payment_mapping: PathBuf,
    pub assistance_initial_dir: PathBuf,
    pub contract_initial_dir: PathBuf,
    pub assistance_delta_dir: PathBuf,
    pub contract_delta_dir: PathBuf,
}

impl Default for SourcePaths {
    fn default() -> Self {
        SourcePaths {
            assistance_listings: PathBuf::from("extracted/assistance-listings.json"),
            dictionary: PathBuf::from("extracted/dictionary.json"),
            organizations: PathBuf::from("extracted/organizations.json"),
            usaspending_hashes: PathBuf::from("extracted/usaspending-program-search-hashes.json"),
            category_mapping: PathBuf::from("source/program-to-function-sub-function.csv"),
            additional_programs: PathBuf::from("source/additional-programs.csv"),
            improper_payment_mapping: PathBuf::from("source/improper-payment-program-mapping.csv"),
            assistance_initial_dir: PathBuf::from("extracted/usaspending/assistance/initial"),
            contract_initial_dir: PathBuf::from("extracted/usaspending/contract/initial"),
            assistance_delta_dir: PathBuf::from("extracted/usaspending/assistance/delta"),
            contract_delta_dir: PathBuf::from("extracted/usaspending/contract/delta"),
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ReconError> {
        toml::from_str(raw).map_err(|e| ReconError::Config(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.fiscal_years.is_empty() {
            return Err(ReconError::Config("fiscal_years must not be empty".to_string()));
        }
        if let Some(bad) = self
            .fiscal_years
            .iter()
            .find(|y| y.len() != 4 || !y.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(ReconError::Config(format!("invalid fiscal year '{}'", bad)));
        }
        Ok(())
    }

    /// Resolve a source path against `data_dir` unless it is absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database)
    }

    /// Built-in agency display names plus configured overrides
    pub fn agency_display_names(&self) -> HashMap<String, String> {
        merge_names(AGENCY_DISPLAY_NAMES, &self.agency_display_names)
    }

    pub fn assistance_type_display_names(&self) -> HashMap<String, String> {
        merge_names(ASSISTANCE_TYPE_DISPLAY_NAMES, &self.assistance_type_display_names)
    }
}

fn merge_names(
    builtin: &[(&str, &str)],
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut names: HashMap<String, String> = builtin
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (k, v) in overrides {
        names.insert(k.clone(), v.clone());
    }
    names
}
