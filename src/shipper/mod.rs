//! Finding Batcher / Shipper
//!
//! Delivers findings to the log ingestion endpoint in ordered batches.
//! One shipper exists per check service; its subsystem label is the
//! service name. Delivery failures are returned to the caller and never
//! retried here.

pub mod coralogix;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DeliveryConfig;
use crate::types::Finding;

pub use coralogix::{CoralogixShipper, CoralogixShippers};

/// Maximum findings per bulk request
pub const BATCH_SIZE: usize = 800;

/// Severity attached to every log entry
pub const LOG_SEVERITY: u8 = 3;

/// Delivery failures; both abort the run
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("ingestion endpoint rejected batch {batch}/{total} with HTTP {status}: {body}")]
    Rejected {
        batch: usize,
        total: usize,
        status: u16,
        body: String,
    },

    #[error("failed to send batch {batch}/{total}: {source}")]
    Transport {
        batch: usize,
        total: usize,
        #[source]
        source: reqwest::Error,
    },
}

/// Sends findings for one subsystem
#[async_trait]
pub trait FindingShipper: Send + Sync {
    /// Subsystem label (the check's service name)
    fn subsystem(&self) -> &str;

    /// Deliver all findings, returning the number of batches sent
    async fn send_bulk(&self, findings: &[Finding]) -> Result<usize, DeliveryError>;
}

/// Builds the shipper for a subsystem
pub trait ShipperFactory: Send + Sync {
    fn shipper_for(&self, subsystem: &str) -> Arc<dyn FindingShipper>;
}

/// Pick the delivery backend for a configuration
pub fn shipper_factory(config: &DeliveryConfig) -> Result<Arc<dyn ShipperFactory>> {
    if config.dry_run {
        return Ok(Arc::new(DryRunShippers));
    }

    let Some(api_key) = config.api_key.as_deref().filter(|key| !key.is_empty()) else {
        bail!("API key is required unless delivery is disabled (--dry-run)");
    };

    Ok(Arc::new(CoralogixShippers::new(
        &config.url,
        api_key,
        &config.application_name,
    )?))
}

/// Number of batches needed for `count` findings
pub fn batch_count(count: usize, batch_size: usize) -> usize {
    count.div_ceil(batch_size.max(1))
}

// ============================================================================
// Wire format
// ============================================================================

/// Bulk ingestion envelope
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest<'a> {
    pub application_name: &'a str,
    pub subsystem_name: &'a str,
    pub log_entries: Vec<LogEntry<'a>>,
}

#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    pub severity: u8,
    pub text: &'a Finding,
}

impl<'a> BulkRequest<'a> {
    pub fn new(application_name: &'a str, subsystem_name: &'a str, batch: &'a [Finding]) -> Self {
        Self {
            application_name,
            subsystem_name,
            log_entries: batch
                .iter()
                .map(|finding| LogEntry {
                    severity: LOG_SEVERITY,
                    text: finding,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Dry run
// ============================================================================

/// Logs findings instead of delivering them
pub struct DryRunShipper {
    subsystem: String,
}

#[async_trait]
impl FindingShipper for DryRunShipper {
    fn subsystem(&self) -> &str {
        &self.subsystem
    }

    async fn send_bulk(&self, findings: &[Finding]) -> Result<usize, DeliveryError> {
        let batches = batch_count(findings.len(), BATCH_SIZE);
        for finding in findings {
            debug!(
                subsystem = %self.subsystem,
                check = %finding.check_name,
                resource = %finding.resource_id,
                region = %finding.region,
                issue_found = finding.issue_found,
                "Dry run finding"
            );
        }
        info!(
            subsystem = %self.subsystem,
            count = findings.len(),
            batches,
            "Dry run - findings not delivered"
        );
        Ok(batches)
    }
}

pub struct DryRunShippers;

impl ShipperFactory for DryRunShippers {
    fn shipper_for(&self, subsystem: &str) -> Arc<dyn FindingShipper> {
        Arc::new(DryRunShipper {
            subsystem: subsystem.to_string(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestionRegion;
    use serde_json::Map;

    fn finding(n: usize) -> Finding {
        Finding {
            execution_id: "exec-1".into(),
            account_id: "123456789012".into(),
            service: "S3".into(),
            check_name: "buckets_should_have_versioning_enabled".into(),
            resource_id: format!("bucket-{}", n),
            region: "global".into(),
            issue_found: n % 2 == 0,
            additional_data: Map::new(),
        }
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(batch_count(0, BATCH_SIZE), 0);
        assert_eq!(batch_count(800, BATCH_SIZE), 1);
        assert_eq!(batch_count(801, BATCH_SIZE), 2);
        assert_eq!(batch_count(1601, BATCH_SIZE), 3);
    }

    #[test]
    fn test_bulk_envelope_shape() {
        let findings = vec![finding(1), finding(2)];
        let request = BulkRequest::new("CSPM", "S3", &findings);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["applicationName"], "CSPM");
        assert_eq!(value["subsystemName"], "S3");
        let entries = value["logEntries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["severity"], 3);
        assert_eq!(entries[1]["text"]["resource"], "bucket-2");
        assert_eq!(entries[1]["text"]["test_name"], "buckets_should_have_versioning_enabled");
    }

    #[tokio::test]
    async fn test_dry_run_shipper_always_succeeds() {
        let factory = shipper_factory(
            &DeliveryConfig::new(IngestionRegion::Eu1).with_dry_run(true),
        )
        .unwrap();
        let shipper = factory.shipper_for("IAM");
        assert_eq!(shipper.subsystem(), "IAM");
        let findings: Vec<Finding> = (0..801).map(finding).collect();
        assert_eq!(shipper.send_bulk(&findings).await.unwrap(), 2);
    }

    #[test]
    fn test_live_delivery_requires_api_key() {
        let config = DeliveryConfig::new(IngestionRegion::Eu1);
        assert!(shipper_factory(&config).is_err());
        assert!(shipper_factory(&config.with_api_key("key")).is_ok());
    }
}
