//! Coralogix bulk log shipper

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{batch_count, BulkRequest, DeliveryError, FindingShipper, ShipperFactory, BATCH_SIZE};
use crate::types::Finding;

/// Timeout for a single bulk request
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Posts findings to the Coralogix bulk endpoint for one subsystem
pub struct CoralogixShipper {
    http: Client,
    url: String,
    api_key: String,
    application: String,
    subsystem: String,
    batch_size: usize,
}

impl CoralogixShipper {
    pub fn new(http: Client, url: &str, api_key: &str, application: &str, subsystem: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key: api_key.to_string(),
            application: application.to_string(),
            subsystem: subsystem.to_string(),
            batch_size: BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl FindingShipper for CoralogixShipper {
    fn subsystem(&self) -> &str {
        &self.subsystem
    }

    async fn send_bulk(&self, findings: &[Finding]) -> Result<usize, DeliveryError> {
        let total = batch_count(findings.len(), self.batch_size);

        // Batches go out strictly in order, the next one only after the previous succeeded
        for (index, batch) in findings.chunks(self.batch_size).enumerate() {
            let number = index + 1;
            let request = BulkRequest::new(&self.application, &self.subsystem, batch);

            let response = self
                .http
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|source| {
                    error!(subsystem = %self.subsystem, batch = number, total, error = %source, "Failed to send findings");
                    DeliveryError::Transport {
                        batch: number,
                        total,
                        source,
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                error!(
                    subsystem = %self.subsystem,
                    batch = number,
                    total,
                    status = status.as_u16(),
                    "Ingestion endpoint rejected findings"
                );
                return Err(DeliveryError::Rejected {
                    batch: number,
                    total,
                    status: status.as_u16(),
                    body,
                });
            }

            debug!(subsystem = %self.subsystem, batch = number, total, count = batch.len(), "Batch delivered");
        }

        info!(
            subsystem = %self.subsystem,
            count = findings.len(),
            batches = total,
            "Findings delivered"
        );
        Ok(total)
    }
}

/// Hands out Coralogix shippers sharing one connection pool
pub struct CoralogixShippers {
    http: Client,
    url: String,
    api_key: String,
    application: String,
}

impl CoralogixShippers {
    pub fn new(url: &str, api_key: &str, application: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            url: url.to_string(),
            api_key: api_key.to_string(),
            application: application.to_string(),
        })
    }

    /// Use a preconfigured HTTP client (proxy, TLS or timeout settings)
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }
}

impl ShipperFactory for CoralogixShippers {
    fn shipper_for(&self, subsystem: &str) -> Arc<dyn FindingShipper> {
        Arc::new(CoralogixShipper::new(
            self.http.clone(),
            &self.url,
            &self.api_key,
            &self.application,
            subsystem,
        ))
    }
}
