//! The template descriptor — the unit the registry resolves, caches, and
//! gates compatibility on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub name: String,
    pub version: semver::Version,
    pub description: String,
    pub min_flutter_sdk: semver::Version,
    pub min_dart_sdk: semver::Version,
    #[serde(default)]
    pub cli_min_version: Option<semver::Version>,
    #[serde(default)]
    pub cli_max_version: Option<semver::Version>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub deprecation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub eol_date: Option<DateTime<Utc>>,
    #[serde(default = "default_variables_schema")]
    pub variables_schema: serde_json::Value,
}

fn default_variables_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("deprecation_date ({deprecation}) is after eol_date ({eol})")]
    DeprecationAfterEol { deprecation: String, eol: String },
    #[error("cli_min_version ({min}) is greater than cli_max_version ({max})")]
    CliVersionRangeInverted { min: String, max: String },
}

impl TemplateDescriptor {
    /// Validate the descriptor's cross-field invariants. Parsing a
    /// `template.yaml` that violates these is treated as a corrupted entry
    /// upstream, not a panic.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if let (Some(dep), Some(eol)) = (self.deprecation_date, self.eol_date) {
            if dep > eol {
                return Err(DescriptorError::DeprecationAfterEol {
                    deprecation: dep.to_rfc3339(),
                    eol: eol.to_rfc3339(),
                });
            }
        }
        if let (Some(min), Some(max)) = (&self.cli_min_version, &self.cli_max_version) {
            if min > max {
                return Err(DescriptorError::CliVersionRangeInverted {
                    min: min.to_string(),
                    max: max.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn is_eol(&self, now: DateTime<Utc>) -> bool {
        self.eol_date.is_some_and(|eol| now >= eol)
    }

    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}
