//! GuardDuty check
//!
//! Regional. Every rule reports one finding per detector; a region with no
//! detector gets a single finding against the `GuardDuty` pseudo-resource.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{has_tags, CheckScope, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::ApiCall;
use crate::types::Finding;

const SERVICE: &str = "guardduty";

/// Resource id used when a region has no detector
const NO_DETECTOR_RESOURCE: &str = "GuardDuty";
const NO_DETECTOR: &str = "no detector found";

const ENABLED: &str = "ENABLED";

#[derive(Debug, Clone)]
pub struct Detector {
    pub id: String,
    /// GetDetector response
    pub details: Value,
}

impl Detector {
    fn is_enabled(&self) -> bool {
        self.details["status"].as_str() == Some(ENABLED)
    }

    fn feature(&self, name: &str) -> Option<&Value> {
        self.details["features"]
            .as_array()?
            .iter()
            .find(|f| f["name"].as_str() == Some(name))
    }

    fn feature_enabled(&self, name: &str) -> bool {
        self.feature(name)
            .is_some_and(|f| f["status"].as_str() == Some(ENABLED))
    }

    fn additional_enabled(&self, feature: &str, name: &str) -> bool {
        self.feature(feature)
            .and_then(|f| f["additionalConfiguration"].as_array())
            .is_some_and(|configs| {
                configs.iter().any(|c| {
                    c["name"].as_str() == Some(name) && c["status"].as_str() == Some(ENABLED)
                })
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct GuardDutyInventory {
    pub detectors: Vec<Detector>,
}

#[async_trait]
impl ServiceInventory for GuardDutyInventory {
    const SERVICE: &'static str = "GuardDuty";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let mut ids = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut call = ApiCall::get("/detector");
            if let Some(token) = &token {
                call = call.param("nextToken", token.clone());
            }
            let page = scope
                .call(SERVICE, call)
                .await
                .context("Failed to list GuardDuty detectors")?;

            if let Some(page_ids) = page["detectorIds"].as_array() {
                ids.extend(page_ids.iter().filter_map(|id| id.as_str()).map(String::from));
            }
            token = page["nextToken"]
                .as_str()
                .filter(|t| !t.is_empty())
                .map(String::from);
            if token.is_none() {
                break;
            }
        }

        let mut detectors = Vec::with_capacity(ids.len());
        for id in ids {
            let details = scope
                .call(SERVICE, ApiCall::get(format!("/detector/{}", id)))
                .await
                .with_context(|| format!("Failed to describe GuardDuty detector {}", id))?;
            detectors.push(Detector { id, details });
        }

        Ok(Self { detectors })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .regional("guardduty_should_be_enabled", guardduty_should_be_enabled)
            .regional("s3_protection_should_be_enabled", s3_protection_should_be_enabled)
            .regional(
                "runtime_monitoring_should_be_enabled",
                runtime_monitoring_should_be_enabled,
            )
            .regional(
                "ec2_runtime_monitoring_should_be_enabled",
                ec2_runtime_monitoring_should_be_enabled,
            )
            .regional(
                "ecs_runtime_monitoring_should_be_enabled",
                ecs_runtime_monitoring_should_be_enabled,
            )
            .regional(
                "eks_runtime_monitoring_should_be_enabled",
                eks_runtime_monitoring_should_be_enabled,
            )
            .regional("detectors_should_be_tagged", detectors_should_be_tagged)
            .regional(
                "lambda_protection_should_be_enabled",
                lambda_protection_should_be_enabled,
            )
            .regional("rds_protection_should_be_enabled", rds_protection_should_be_enabled)
            .regional(
                "eks_audit_logs_monitoring_should_be_enabled",
                eks_audit_logs_monitoring_should_be_enabled,
            )
            .regional(
                "malware_protection_for_ec2_should_be_enabled",
                malware_protection_for_ec2_should_be_enabled,
            )
    }
}

/// One finding per detector, `issue_found` when `compliant` is false
fn per_detector<F>(inv: &GuardDutyInventory, ctx: &PredicateContext<'_>, compliant: F) -> Vec<Finding>
where
    F: Fn(&Detector) -> bool,
{
    if inv.detectors.is_empty() {
        return vec![ctx
            .finding(NO_DETECTOR_RESOURCE, true)
            .with_data("detector_id", NO_DETECTOR)];
    }

    inv.detectors
        .iter()
        .map(|detector| {
            ctx.finding(detector.id.clone(), !compliant(detector))
                .with_data("detector_id", &detector.id)
                .with_data("status", &detector.details["status"])
        })
        .collect()
}

fn guardduty_should_be_enabled(inv: &GuardDutyInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, Detector::is_enabled))
}

fn s3_protection_should_be_enabled(inv: &GuardDutyInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| {
        d.details["dataSources"]["s3Logs"]["status"].as_str() == Some(ENABLED)
            || d.feature_enabled("S3_DATA_EVENTS")
    }))
}

fn runtime_monitoring_should_be_enabled(
    inv: &GuardDutyInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| d.feature_enabled("RUNTIME_MONITORING")))
}

fn ec2_runtime_monitoring_should_be_enabled(
    inv: &GuardDutyInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| {
        d.additional_enabled("RUNTIME_MONITORING", "EC2_AGENT_MANAGEMENT")
    }))
}

fn ecs_runtime_monitoring_should_be_enabled(
    inv: &GuardDutyInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| {
        d.additional_enabled("RUNTIME_MONITORING", "ECS_FARGATE_AGENT_MANAGEMENT")
    }))
}

fn eks_runtime_monitoring_should_be_enabled(
    inv: &GuardDutyInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| {
        d.additional_enabled("RUNTIME_MONITORING", "EKS_ADDON_MANAGEMENT")
            || d.additional_enabled("EKS_RUNTIME_MONITORING", "EKS_ADDON_MANAGEMENT")
    }))
}

fn detectors_should_be_tagged(inv: &GuardDutyInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| has_tags(&d.details["tags"])))
}

fn lambda_protection_should_be_enabled(
    inv: &GuardDutyInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| d.feature_enabled("LAMBDA_NETWORK_LOGS")))
}

fn rds_protection_should_be_enabled(inv: &GuardDutyInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| d.feature_enabled("RDS_LOGIN_EVENTS")))
}

fn eks_audit_logs_monitoring_should_be_enabled(
    inv: &GuardDutyInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| {
        d.feature_enabled("EKS_AUDIT_LOGS")
            || d.details["dataSources"]["kubernetes"]["auditLogs"]["status"].as_str() == Some(ENABLED)
    }))
}

fn malware_protection_for_ec2_should_be_enabled(
    inv: &GuardDutyInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(per_detector(inv, ctx, |d| d.feature_enabled("EBS_MALWARE_PROTECTION")))
}
