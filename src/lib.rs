//! CSPM Engine
//!
//! Audits a cloud account for security misconfigurations and ships the
//! findings to a Coralogix bulk ingestion endpoint.
//!
//! ## Modules
//! - `checks` - per-service inventories, predicate tables and the check registry
//! - `cloud` - provider accessor traits, the AWS implementation and the throttle guard
//! - `shipper` - ordered, size-bounded batch delivery
//! - `orchestrator` - the (check x region) worker pool
//! - `config`, `types`, `error` - shared settings, data model and exit statuses

pub mod checks;
pub mod cloud;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod shipper;
pub mod types;

pub use checks::registry::CheckRegistry;
pub use cloud::{CloudAccessor, CloudProvider, ThrottleGuard};
pub use config::{DeliveryConfig, IngestionRegion, PolicyThresholds};
pub use error::ScanError;
pub use orchestrator::{ScanOrchestrator, ScanRequest, ScanSummary};
pub use types::{ExecutionContext, Finding, GLOBAL_REGION};
