//! CloudTrail check
//!
//! Global. Trails are listed once from the default region; status, event
//! selectors and tags are read per trail from its home region.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{flag, CheckScope, Fetched, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::ApiCall;
use crate::types::Finding;

const SERVICE: &str = "cloudtrail";

/// Resource id for account-wide trail rules
const ACCOUNT_RESOURCE: &str = "CloudTrail";

#[derive(Debug, Clone)]
pub struct Trail {
    /// DescribeTrails entry
    pub details: Value,
    /// GetTrailStatus response
    pub status: Fetched<Value>,
    /// GetEventSelectors response
    pub event_selectors: Fetched<Value>,
    /// Tags of the trail
    pub tags: Fetched<Value>,
}

impl Trail {
    fn arn(&self) -> String {
        self.details["TrailARN"]
            .as_str()
            .or_else(|| self.details["Name"].as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn name(&self) -> &str {
        self.details["Name"].as_str().unwrap_or_default()
    }

    fn is_logging(&self) -> Option<bool> {
        self.status.present().map(|s| flag(&s["IsLogging"]))
    }

    fn finding(&self, ctx: &PredicateContext<'_>, issue_found: bool) -> Finding {
        ctx.finding(self.arn(), issue_found)
            .with_data("trail_name", self.name())
            .with_data("home_region", &self.details["HomeRegion"])
    }
}

/// Whether the selectors record both read and write management events
fn records_all_management_events(selectors: &Value) -> bool {
    let basic = selectors["EventSelectors"]
        .as_array()
        .is_some_and(|list| {
            list.iter().any(|s| {
                flag(&s["IncludeManagementEvents"]) && s["ReadWriteType"].as_str() == Some("All")
            })
        });

    let advanced = selectors["AdvancedEventSelectors"]
        .as_array()
        .is_some_and(|list| {
            list.iter().any(|s| {
                let fields = s["FieldSelectors"].as_array().cloned().unwrap_or_default();
                let management = fields.iter().any(|f| {
                    f["Field"].as_str() == Some("eventCategory")
                        && f["Equals"]
                            .as_array()
                            .is_some_and(|v| v.iter().any(|e| e.as_str() == Some("Management")))
                });
                let read_only_filter = fields.iter().any(|f| f["Field"].as_str() == Some("readOnly"));
                management && !read_only_filter
            })
        });

    basic || advanced
}

#[derive(Debug, Clone, Default)]
pub struct CloudTrailInventory {
    pub trails: Vec<Trail>,
}

#[async_trait]
impl ServiceInventory for CloudTrailInventory {
    const SERVICE: &'static str = "CloudTrail";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let listing = scope
            .call(SERVICE, ApiCall::json("DescribeTrails", json!({})))
            .await
            .context("Failed to describe trails")?;

        let mut trails = Vec::new();
        for details in listing["trailList"].as_array().cloned().unwrap_or_default() {
            let arn = details["TrailARN"].as_str().unwrap_or_default().to_string();
            let home = details["HomeRegion"]
                .as_str()
                .unwrap_or(scope.region())
                .to_string();

            let status = scope
                .fetch(SERVICE, &home, ApiCall::json("GetTrailStatus", json!({ "Name": arn })), &[])
                .await;
            let event_selectors = scope
                .fetch(
                    SERVICE,
                    &home,
                    ApiCall::json("GetEventSelectors", json!({ "TrailName": arn })),
                    &[],
                )
                .await;
            let tags = scope
                .fetch(
                    SERVICE,
                    &home,
                    ApiCall::json("ListTags", json!({ "ResourceIdList": [arn] })),
                    &[],
                )
                .await
                .map(|response| {
                    response["ResourceTagList"][0]["TagsList"]
                        .as_array()
                        .map(|tags| Value::Array(tags.clone()))
                        .unwrap_or_else(|| json!([]))
                });

            trails.push(Trail {
                details,
                status,
                event_selectors,
                tags,
            });
        }

        Ok(Self { trails })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .global(
                "cloudtrail_should_be_enabled_and_configured_with_at_least_one_multi_region_trail_that_includes_read_and_write_management_events",
                multi_region_trail_with_read_write_management_events,
            )
            .global(
                "trail_should_have_encryption_at_rest_enabled",
                trail_should_have_encryption_at_rest_enabled,
            )
            .global("at_least_one_trail_is_enabled", at_least_one_trail_is_enabled)
            .global(
                "log_file_validation_should_be_enabled",
                log_file_validation_should_be_enabled,
            )
            .global(
                "trails_should_be_integrated_with_cloudwatch_logs",
                trails_should_be_integrated_with_cloudwatch_logs,
            )
            .global("trails_should_be_tagged", trails_should_be_tagged)
    }
}

fn multi_region_trail_with_read_write_management_events(
    inv: &CloudTrailInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .trails
        .iter()
        .filter_map(|trail| {
            let selectors = trail.event_selectors.present()?;
            let logging = trail.is_logging()?;
            let multi_region = flag(&trail.details["IsMultiRegionTrail"]);
            let read_write = records_all_management_events(selectors);
            Some(
                trail
                    .finding(ctx, !(multi_region && logging && read_write))
                    .with_data("is_multi_region_trail", multi_region)
                    .with_data("is_logging", logging)
                    .with_data("read_write_management_events", read_write),
            )
        })
        .collect())
}

fn trail_should_have_encryption_at_rest_enabled(
    inv: &CloudTrailInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .trails
        .iter()
        .map(|trail| {
            let kms_key = trail.details["KmsKeyId"].as_str().filter(|k| !k.is_empty());
            trail
                .finding(ctx, kms_key.is_none())
                .with_data("kms_key_id", kms_key)
        })
        .collect())
}

fn at_least_one_trail_is_enabled(inv: &CloudTrailInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    let logging: Vec<String> = inv
        .trails
        .iter()
        .filter(|trail| trail.is_logging() == Some(true))
        .map(|trail| trail.arn())
        .collect();

    // Unknown status on some trail: the account cannot be judged
    if logging.is_empty() && inv.trails.iter().any(|trail| !trail.status.is_evaluable()) {
        return Ok(Vec::new());
    }

    Ok(vec![ctx
        .finding(ACCOUNT_RESOURCE, logging.is_empty())
        .with_data("trail_count", inv.trails.len())
        .with_data("logging_trails", logging)])
}

fn log_file_validation_should_be_enabled(
    inv: &CloudTrailInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .trails
        .iter()
        .map(|trail| {
            let enabled = flag(&trail.details["LogFileValidationEnabled"]);
            trail
                .finding(ctx, !enabled)
                .with_data("log_file_validation_enabled", enabled)
        })
        .collect())
}

fn trails_should_be_integrated_with_cloudwatch_logs(
    inv: &CloudTrailInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .trails
        .iter()
        .map(|trail| {
            let log_group = trail.details["CloudWatchLogsLogGroupArn"]
                .as_str()
                .filter(|arn| !arn.is_empty());
            trail
                .finding(ctx, log_group.is_none())
                .with_data("cloudwatch_logs_log_group_arn", log_group)
        })
        .collect())
}

fn trails_should_be_tagged(inv: &CloudTrailInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(inv
        .trails
        .iter()
        .filter_map(|trail| {
            let tags = trail.tags.present()?;
            let tagged = tags.as_array().is_some_and(|t| !t.is_empty());
            Some(trail.finding(ctx, !tagged).with_data("tags", tags))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{evaluate, Scope};
    use crate::cloud::testing::{api_error, StaticAccessor};
    use crate::cloud::ThrottleGuard;
    use crate::types::ExecutionContext;
    use std::sync::Arc;

    fn context() -> ExecutionContext {
        ExecutionContext::new("123456789012", vec![], vec![])
    }

    fn accessor() -> StaticAccessor {
        StaticAccessor::new(|service, region, call| {
            assert_eq!(service, "cloudtrail");
            let ApiCall::Json { action, body } = call else {
                panic!("unexpected call {:?}", call);
            };
            match action.as_str() {
                "DescribeTrails" => {
                    assert_eq!(region, "global");
                    Ok(json!({"trailList": [
                        {
                            "Name": "org",
                            "TrailARN": "arn:trail/org",
                            "HomeRegion": "us-east-1",
                            "IsMultiRegionTrail": true,
                            "KmsKeyId": "arn:kms/key",
                            "LogFileValidationEnabled": true,
                            "CloudWatchLogsLogGroupArn": "arn:logs/group"
                        },
                        {
                            "Name": "legacy",
                            "TrailARN": "arn:trail/legacy",
                            "HomeRegion": "eu-west-1",
                            "IsMultiRegionTrail": false
                        }
                    ]}))
                }
                "GetTrailStatus" => match body["Name"].as_str() {
                    Some("arn:trail/org") => {
                        assert_eq!(region, "us-east-1");
                        Ok(json!({"IsLogging": true}))
                    }
                    _ => {
                        assert_eq!(region, "eu-west-1");
                        Ok(json!({"IsLogging": false}))
                    }
                },
                "GetEventSelectors" => match body["TrailName"].as_str() {
                    Some("arn:trail/org") => Ok(json!({"EventSelectors": [
                        {"ReadWriteType": "All", "IncludeManagementEvents": true}
                    ]})),
                    _ => Ok(json!({"AdvancedEventSelectors": [
                        {"FieldSelectors": [
                            {"Field": "eventCategory", "Equals": ["Management"]},
                            {"Field": "readOnly", "Equals": ["true"]}
                        ]}
                    ]})),
                },
                "ListTags" => match body["ResourceIdList"][0].as_str() {
                    Some("arn:trail/org") => Ok(json!({"ResourceTagList": [
                        {"ResourceId": "arn:trail/org", "TagsList": [{"Key": "env", "Value": "prod"}]}
                    ]})),
                    _ => Err(api_error(400, "AccessDeniedException")),
                },
                other => panic!("unexpected action {}", other),
            }
        })
    }

    #[tokio::test]
    async fn test_trails_are_read_from_their_home_region() {
        let scope = CheckScope::new(
            Arc::new(context()),
            Arc::new(accessor()),
            "global",
            ThrottleGuard::default(),
        );
        let inventory = CloudTrailInventory::collect(&scope).await.unwrap();
        assert_eq!(inventory.trails.len(), 2);
        assert!(!inventory.trails[1].tags.is_evaluable());

        let table = CloudTrailInventory::predicates();
        assert!(table.for_scope(Scope::Regional).is_empty());
        let findings = evaluate(
            &table.for_scope(Scope::Global),
            &inventory,
            &context(),
            "CloudTrail",
            "global",
        );

        let by_check = |check: &str| -> Vec<(String, bool)> {
            findings
                .iter()
                .filter(|f| f.check_name == check)
                .map(|f| (f.resource_id.clone(), f.issue_found))
                .collect()
        };

        assert_eq!(
            by_check("cloudtrail_should_be_enabled_and_configured_with_at_least_one_multi_region_trail_that_includes_read_and_write_management_events"),
            vec![("arn:trail/org".into(), false), ("arn:trail/legacy".into(), true)]
        );
        assert_eq!(
            by_check("at_least_one_trail_is_enabled"),
            vec![("CloudTrail".into(), false)]
        );
        assert_eq!(
            by_check("trail_should_have_encryption_at_rest_enabled"),
            vec![("arn:trail/org".into(), false), ("arn:trail/legacy".into(), true)]
        );
        assert_eq!(
            by_check("trails_should_be_tagged"),
            vec![("arn:trail/org".into(), false)]
        );
        assert_eq!(
            by_check("trails_should_be_integrated_with_cloudwatch_logs")[1],
            ("arn:trail/legacy".into(), true)
        );
    }

    #[test]
    fn test_no_trails_is_an_account_issue() {
        let table = CloudTrailInventory::predicates();
        let findings = evaluate(
            &table.for_scope(Scope::Global),
            &CloudTrailInventory::default(),
            &context(),
            "CloudTrail",
            "global",
        );
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].resource_id, "CloudTrail");
        assert!(findings[0].issue_found);
    }

    #[test]
    fn test_unreadable_trail_status_is_not_an_account_issue() {
        let trail = |status: Fetched<Value>| Trail {
            details: json!({"Name": "t", "TrailARN": "arn:trail/t"}),
            status,
            event_selectors: Fetched::Absent,
            tags: Fetched::Absent,
        };
        let ctx_data = context();
        let ctx = PredicateContext::new(&ctx_data, "CloudTrail", "global", "at_least_one_trail_is_enabled");

        let unknown = CloudTrailInventory {
            trails: vec![trail(Fetched::Unavailable("AccessDenied".into()))],
        };
        assert!(at_least_one_trail_is_enabled(&unknown, &ctx).unwrap().is_empty());

        let mixed = CloudTrailInventory {
            trails: vec![
                trail(Fetched::Unavailable("AccessDenied".into())),
                trail(Fetched::Present(json!({"IsLogging": true}))),
            ],
        };
        let findings = at_least_one_trail_is_enabled(&mixed, &ctx).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].issue_found);

        let stopped = CloudTrailInventory {
            trails: vec![trail(Fetched::Present(json!({"IsLogging": false})))],
        };
        assert!(at_least_one_trail_is_enabled(&stopped, &ctx).unwrap()[0].issue_found);
    }

    #[test]
    fn test_management_event_selectors() {
        assert!(records_all_management_events(&json!({"EventSelectors": [
            {"ReadWriteType": "All", "IncludeManagementEvents": true}
        ]})));
        assert!(!records_all_management_events(&json!({"EventSelectors": [
            {"ReadWriteType": "WriteOnly", "IncludeManagementEvents": true}
        ]})));
        assert!(records_all_management_events(&json!({"AdvancedEventSelectors": [
            {"FieldSelectors": [{"Field": "eventCategory", "Equals": ["Management"]}]}
        ]})));
        assert!(!records_all_management_events(&json!({})));
    }
}
