//! Scan configuration
//!
//! Policy thresholds used by predicates and the Coralogix delivery settings.
//! Both are populated from CLI flags with environment fallbacks.

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Days without use after which a console password or access key is stale
pub const DEFAULT_UNUSED_CREDENTIAL_DAYS: i64 = 45;

/// Maximum access key age before rotation is required
pub const DEFAULT_KEY_ROTATION_DAYS: i64 = 90;

/// Minimum console password length
pub const DEFAULT_MIN_PASSWORD_LENGTH: u64 = 14;

/// Number of previous passwords that may not be reused
pub const DEFAULT_PASSWORD_REUSE_PREVENTION: u64 = 24;

/// Longest password lifetime the account policy may allow
pub const DEFAULT_MAX_PASSWORD_AGE_DAYS: u64 = 90;

/// Days without access after which a secret is considered unused
pub const DEFAULT_UNUSED_SECRET_DAYS: i64 = 14;

/// Application label attached to every bulk request
pub const DEFAULT_APPLICATION_NAME: &str = "CSPM";

/// Numeric limits for age and strength rules
#[derive(Debug, Clone, PartialEq, Eq, Args, Serialize, Deserialize)]
pub struct PolicyThresholds {
    /// Days after which unused user credentials should be removed
    #[arg(long, env = "CSPM_UNUSED_CREDENTIAL_DAYS", default_value_t = DEFAULT_UNUSED_CREDENTIAL_DAYS)]
    pub unused_credential_days: i64,

    /// Maximum access key age in days
    #[arg(long, env = "CSPM_KEY_ROTATION_DAYS", default_value_t = DEFAULT_KEY_ROTATION_DAYS)]
    pub key_rotation_days: i64,

    /// Minimum password length required by the account password policy
    #[arg(long, env = "CSPM_MIN_PASSWORD_LENGTH", default_value_t = DEFAULT_MIN_PASSWORD_LENGTH)]
    pub min_password_length: u64,

    /// Minimum password reuse prevention count
    #[arg(long, env = "CSPM_PASSWORD_REUSE_PREVENTION", default_value_t = DEFAULT_PASSWORD_REUSE_PREVENTION)]
    pub password_reuse_prevention: u64,

    /// Maximum password age in days the password policy may allow
    #[arg(long, env = "CSPM_MAX_PASSWORD_AGE_DAYS", default_value_t = DEFAULT_MAX_PASSWORD_AGE_DAYS)]
    pub max_password_age_days: u64,

    /// Days without access after which a secret is unused
    #[arg(long, env = "CSPM_UNUSED_SECRET_DAYS", default_value_t = DEFAULT_UNUSED_SECRET_DAYS)]
    pub unused_secret_days: i64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            unused_credential_days: DEFAULT_UNUSED_CREDENTIAL_DAYS,
            key_rotation_days: DEFAULT_KEY_ROTATION_DAYS,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            password_reuse_prevention: DEFAULT_PASSWORD_REUSE_PREVENTION,
            max_password_age_days: DEFAULT_MAX_PASSWORD_AGE_DAYS,
            unused_secret_days: DEFAULT_UNUSED_SECRET_DAYS,
        }
    }
}

/// Coralogix account region codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestionRegion {
    #[default]
    #[value(name = "EU1", alias = "eu1")]
    Eu1,
    #[value(name = "EU2", alias = "eu2")]
    Eu2,
    #[value(name = "US1", alias = "us1")]
    Us1,
    #[value(name = "US2", alias = "us2")]
    Us2,
    #[value(name = "AP1", alias = "ap1")]
    Ap1,
    #[value(name = "AP2", alias = "ap2")]
    Ap2,
    #[value(name = "AP3", alias = "ap3")]
    Ap3,
}

impl IngestionRegion {
    /// Base domain of the Coralogix region
    pub fn host(&self) -> &'static str {
        match self {
            IngestionRegion::Eu1 => "coralogix.com",
            IngestionRegion::Eu2 => "eu2.coralogix.com",
            IngestionRegion::Us1 => "coralogix.us",
            IngestionRegion::Us2 => "cx498.coralogix.com",
            IngestionRegion::Ap1 => "coralogix.in",
            IngestionRegion::Ap2 => "coralogixsg.com",
            IngestionRegion::Ap3 => "ap3.coralogix.com",
        }
    }

    /// Bulk log ingestion URL for the region
    pub fn bulk_url(&self) -> String {
        format!("https://ingress.{}/logs/v1/bulk", self.host())
    }
}

impl fmt::Display for IngestionRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            IngestionRegion::Eu1 => "EU1",
            IngestionRegion::Eu2 => "EU2",
            IngestionRegion::Us1 => "US1",
            IngestionRegion::Us2 => "US2",
            IngestionRegion::Ap1 => "AP1",
            IngestionRegion::Ap2 => "AP2",
            IngestionRegion::Ap3 => "AP3",
        };
        write!(f, "{}", code)
    }
}

/// Where and how findings are delivered
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Full bulk ingestion URL
    pub url: String,
    /// Bearer token; only optional in dry-run mode
    pub api_key: Option<String>,
    /// Constant application label
    pub application_name: String,
    /// Log findings instead of posting them
    pub dry_run: bool,
}

impl DeliveryConfig {
    pub fn new(region: IngestionRegion) -> Self {
        Self {
            url: region.bulk_url(),
            api_key: None,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            dry_run: false,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
