//! Run-level errors and their process exit statuses

use thiserror::Error;

use crate::checks::registry::RegistryError;
use crate::cloud::ProviderError;
use crate::shipper::DeliveryError;

/// Stable process exit statuses
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const CONFIG: u8 = 1;
    pub const DELIVERY_REJECTED: u8 = 2;
    pub const DELIVERY_TRANSPORT: u8 = 3;
    pub const REGIONS: u8 = 7;
    pub const CHECK_FAILED: u8 = 8;
    pub const UNKNOWN_CHECK: u8 = 9;
}

/// Fatal conditions that abort a scan
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    UnknownCheck(#[from] RegistryError),

    #[error("unable to resolve regions: {0}")]
    Regions(String),

    #[error("failed to resolve account identity: {0}")]
    Identity(#[source] ProviderError),

    #[error("{failed} check run(s) failed")]
    ChecksFailed { failed: usize },

    #[error("delivery failed for {service} in {region}: {source}")]
    Delivery {
        service: String,
        region: String,
        #[source]
        source: DeliveryError,
    },
}

impl ScanError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            ScanError::Config(_) | ScanError::Identity(_) => exit_code::CONFIG,
            ScanError::UnknownCheck(_) => exit_code::UNKNOWN_CHECK,
            ScanError::Regions(_) => exit_code::REGIONS,
            ScanError::ChecksFailed { .. } => exit_code::CHECK_FAILED,
            ScanError::Delivery { source, .. } => match source {
                DeliveryError::Rejected { .. } => exit_code::DELIVERY_REJECTED,
                DeliveryError::Transport { .. } => exit_code::DELIVERY_TRANSPORT,
            },
        }
    }
}
