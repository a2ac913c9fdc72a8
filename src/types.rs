//! Core scan types
//!
//! Findings, the immutable per-run execution context and region-set
//! resolution shared by the orchestrator and every check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::PolicyThresholds;

/// Region sentinel meaning "account-level, not tied to a region"
pub const GLOBAL_REGION: &str = "global";

/// Whether a region identifier is the global sentinel
pub fn is_global(region: &str) -> bool {
    region == GLOBAL_REGION
}

/// A single compliance observation about one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Identifier shared by every finding of one run
    pub execution_id: String,
    /// Cloud account the finding belongs to
    pub account_id: String,
    /// Service label, equal to the shipper subsystem
    pub service: String,
    /// Predicate that produced the finding
    #[serde(rename = "test_name")]
    pub check_name: String,
    /// Resource identifier (ARN, name, or a pseudo-resource)
    #[serde(rename = "resource")]
    pub resource_id: String,
    /// Region identifier or `global`
    pub region: String,
    /// True when the resource violates the rule
    pub issue_found: bool,
    /// Free-form details about the resource
    #[serde(default)]
    pub additional_data: Map<String, Value>,
}

impl Finding {
    /// Attach one key to `additional_data`
    pub fn with_data(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.additional_data.insert(key.to_string(), value);
        self
    }

    /// Merge an object into `additional_data`; non-object values are stored under `details`
    pub fn with_details(mut self, details: &Value) -> Self {
        match details {
            Value::Object(map) => {
                for (key, value) in map {
                    self.additional_data.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                self.additional_data
                    .insert("details".to_string(), other.clone());
            }
        }
        self
    }
}

/// Immutable values shared by every check of one run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Unique id for this run
    pub execution_id: String,
    /// Account identity resolved at start-up
    pub account_id: String,
    /// Resolved region set, always ending with `global`
    pub regions: Vec<String>,
    /// Lowercase names of the selected checks
    pub checks: Vec<String>,
    /// Policy windows and limits used by predicates
    pub thresholds: PolicyThresholds,
    /// Reference instant for age-based rules
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(account_id: impl Into<String>, regions: Vec<String>, checks: Vec<String>) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            regions,
            checks,
            thresholds: PolicyThresholds::default(),
            started_at: Utc::now(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: PolicyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }
}

// ============================================================================
// Region resolution
// ============================================================================

/// Normalize a region list: trim, drop blanks, dedupe in order and make sure
/// `global` is present exactly once (appended when missing).
///
/// Returns `None` when an identifier is not a plausible region name or when
/// no concrete region remains.
pub fn resolve_region_set<I, S>(regions: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut resolved: Vec<String> = Vec::new();

    for region in regions {
        let region = region.as_ref().trim().to_lowercase();
        if region.is_empty() {
            continue;
        }
        if !is_valid_region_name(&region) {
            return None;
        }
        if !resolved.contains(&region) {
            resolved.push(region);
        }
    }

    if resolved.iter().all(|r| is_global(r)) {
        return None;
    }

    if let Some(pos) = resolved.iter().position(|r| is_global(r)) {
        resolved.remove(pos);
    }
    resolved.push(GLOBAL_REGION.to_string());

    Some(resolved)
}

fn is_valid_region_name(region: &str) -> bool {
    region
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && region.chars().next().is_some_and(|c| c.is_ascii_lowercase())
}
