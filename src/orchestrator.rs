//! Scan Orchestrator
//!
//! Resolves checks, regions and identity, then fans the (check x region)
//! matrix onto a bounded worker pool:
//!
//! ```text
//! registry.resolve ─► regions ─► account_id ─► ExecutionContext
//!                                                   │
//!        ┌──────────── one shipper per service ◄────┘
//!        ▼
//!   JoinSet<(check, region)> ── Semaphore(max_workers) ── drain ─► summary
//! ```
//!
//! Every spawned task is joined before `run` returns. A failing check is
//! isolated to its task and reported after the drain; the first delivery
//! failure closes the pool so queued tasks never start.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::checks::registry::{CheckDescriptor, CheckRegistry};
use crate::checks::{CheckError, CheckOutcome, CheckParams};
use crate::cloud::{CloudAccessor, ThrottleGuard};
use crate::config::PolicyThresholds;
use crate::error::ScanError;
use crate::shipper::ShipperFactory;
use crate::types::{resolve_region_set, ExecutionContext};

/// Concurrent check runs
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// What to scan; `None` means discover regions / run every check
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub regions: Option<Vec<String>>,
    pub checks: Option<Vec<String>>,
}

/// Totals of a finished scan
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub execution_id: String,
    pub account_id: String,
    pub regions: Vec<String>,
    pub checks: Vec<String>,
    /// (check, region) tasks submitted
    pub tasks: usize,
    /// Tasks that delivered findings
    pub shipped: usize,
    pub findings: usize,
    pub batches: usize,
    pub no_findings: usize,
    /// Tasks with no predicate for their region scope
    pub skipped: usize,
    pub failed: usize,
    /// Tasks dropped after a delivery failure closed the pool
    pub not_started: usize,
    pub duration_secs: f64,
}

/// How one task ended
enum TaskResult {
    NotStarted,
    Finished(Result<CheckOutcome, CheckError>),
    Panicked(String),
}

struct TaskReport {
    service: &'static str,
    region: String,
    result: TaskResult,
}

pub struct ScanOrchestrator {
    accessor: Arc<dyn CloudAccessor>,
    registry: CheckRegistry,
    shippers: Arc<dyn ShipperFactory>,
    guard: ThrottleGuard,
    max_workers: usize,
    thresholds: PolicyThresholds,
}

impl ScanOrchestrator {
    pub fn new(
        accessor: Arc<dyn CloudAccessor>,
        registry: CheckRegistry,
        shippers: Arc<dyn ShipperFactory>,
    ) -> Self {
        Self {
            accessor,
            registry,
            shippers,
            guard: ThrottleGuard::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            thresholds: PolicyThresholds::default(),
        }
    }

    pub fn with_throttle_guard(mut self, guard: ThrottleGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_thresholds(mut self, thresholds: PolicyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Region set to scan, always ending with `global`
    async fn resolve_regions(&self, requested: Option<Vec<String>>) -> Result<Vec<String>, ScanError> {
        let explicit = requested.filter(|list| list.iter().any(|r| !r.trim().is_empty()));

        match explicit {
            Some(list) => resolve_region_set(&list).ok_or_else(|| {
                ScanError::Regions(format!("invalid region list: {}", list.join(",")))
            }),
            None => {
                let discovered = self
                    .accessor
                    .discover_regions()
                    .await
                    .map_err(|e| ScanError::Regions(format!("region discovery failed: {}", e)))?;
                debug!(count = discovered.len(), "Discovered regions");
                resolve_region_set(&discovered)
                    .ok_or_else(|| ScanError::Regions("no enabled regions discovered".to_string()))
            }
        }
    }

    /// Run the whole scan. Returns only after every task has finished.
    pub async fn run(&self, request: ScanRequest) -> Result<ScanSummary, ScanError> {
        let started = Instant::now();

        // Unknown names fail here, before any provider call
        let selected = self.registry.resolve(request.checks.as_deref())?;
        let regions = self.resolve_regions(request.regions).await?;
        let account_id = self.accessor.account_id().await.map_err(ScanError::Identity)?;

        let context = Arc::new(
            ExecutionContext::new(account_id, regions.clone(), selected.keys().cloned().collect())
                .with_thresholds(self.thresholds.clone()),
        );

        info!(
            execution_id = %context.execution_id,
            account_id = %context.account_id,
            provider = %self.registry.provider(),
            regions = ?context.regions,
            checks = ?context.checks,
            max_workers = self.max_workers,
            "Starting scan"
        );

        let mut summary = ScanSummary {
            execution_id: context.execution_id.clone(),
            account_id: context.account_id.clone(),
            regions: context.regions.clone(),
            checks: context.checks.clone(),
            ..Default::default()
        };

        let pool = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for descriptor in selected.values() {
            let shipper = self.shippers.shipper_for(descriptor.service);
            for region in &regions {
                let params = CheckParams {
                    context: context.clone(),
                    accessor: self.accessor.clone(),
                    region: region.clone(),
                    shipper: shipper.clone(),
                    guard: self.guard.clone(),
                };
                tasks.spawn(run_task(*descriptor, params, pool.clone()));
                summary.tasks += 1;
            }
        }

        let mut delivery_failure: Option<ScanError> = None;

        while let Some(joined) = tasks.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Task join failed");
                    summary.failed += 1;
                    continue;
                }
            };
            let (service, region) = (report.service, report.region);

            match report.result {
                TaskResult::NotStarted => {
                    debug!(service = service, region = %region, "Task not started");
                    summary.not_started += 1;
                }
                TaskResult::Finished(Ok(CheckOutcome::Skipped)) => summary.skipped += 1,
                TaskResult::Finished(Ok(CheckOutcome::NoFindings)) => summary.no_findings += 1,
                TaskResult::Finished(Ok(CheckOutcome::Shipped { findings, batches })) => {
                    summary.shipped += 1;
                    summary.findings += findings;
                    summary.batches += batches;
                }
                TaskResult::Finished(Err(CheckError::Delivery(source))) => {
                    error!(service = service, region = %region, error = %source, "Delivery failed");
                    if delivery_failure.is_none() {
                        delivery_failure = Some(ScanError::Delivery {
                            service: service.to_string(),
                            region,
                            source,
                        });
                    }
                }
                TaskResult::Finished(Err(e)) => {
                    error!(service = service, region = %region, error = %e, "Check failed");
                    summary.failed += 1;
                }
                TaskResult::Panicked(reason) => {
                    error!(service = service, region = %region, error = %reason, "Check panicked");
                    summary.failed += 1;
                }
            }
        }

        summary.duration_secs = started.elapsed().as_secs_f64();
        info!(
            execution_id = %summary.execution_id,
            tasks = summary.tasks,
            shipped = summary.shipped,
            findings = summary.findings,
            no_findings = summary.no_findings,
            skipped = summary.skipped,
            failed = summary.failed,
            not_started = summary.not_started,
            duration_secs = summary.duration_secs,
            "Scan finished"
        );

        if let Some(failure) = delivery_failure {
            return Err(failure);
        }
        if summary.failed > 0 {
            return Err(ScanError::ChecksFailed {
                failed: summary.failed,
            });
        }
        Ok(summary)
    }
}

/// One (check, region) task: wait for a worker slot, build the check, run it
async fn run_task(descriptor: CheckDescriptor, params: CheckParams, pool: Arc<Semaphore>) -> TaskReport {
    let region = params.region.clone();
    let report = |result| TaskReport {
        service: descriptor.service,
        region: region.clone(),
        result,
    };

    let Ok(_permit) = pool.clone().acquire_owned().await else {
        return report(TaskResult::NotStarted);
    };

    // Inner task so a panicking check surfaces as a JoinError for this task only
    let handle = tokio::spawn(async move {
        let check = (descriptor.factory)(params);
        debug!(service = check.service(), region = %check.region(), "Check started");
        check.run().await
    });

    let result = match handle.await {
        Ok(result) => result,
        Err(e) => return report(TaskResult::Panicked(e.to_string())),
    };

    // Close while this task still holds its slot so no queued task starts
    if matches!(result, Err(CheckError::Delivery(_))) {
        pool.close();
    }
    report(TaskResult::Finished(result))
}
