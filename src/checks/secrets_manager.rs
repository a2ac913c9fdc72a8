//! Secret Manager check
//!
//! Regional. Rotation, usage and tagging rules over every secret listed in
//! the region.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{flag, has_tags, timestamp, CheckScope, PredicateContext, PredicateTable, ServiceInventory};
use crate::types::Finding;

const SERVICE: &str = "secretsmanager";

#[derive(Debug, Clone, Default)]
pub struct SecretsManagerInventory {
    /// `SecretList` entries from ListSecrets
    pub secrets: Vec<Value>,
}

fn resource(secret: &Value) -> String {
    secret["ARN"]
        .as_str()
        .or_else(|| secret["Name"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn base_finding(ctx: &PredicateContext<'_>, secret: &Value, issue_found: bool) -> Finding {
    ctx.finding(resource(secret), issue_found)
        .with_data("name", &secret["Name"])
}

#[async_trait]
impl ServiceInventory for SecretsManagerInventory {
    const SERVICE: &'static str = "Secret Manager";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let secrets = scope
            .paginate_json(SERVICE, "ListSecrets", "SecretList", "NextToken")
            .await
            .context("Failed to list secrets")?;
        Ok(Self { secrets })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .regional(
                "secrets_should_have_automatic_rotation_enabled",
                secrets_should_have_automatic_rotation_enabled,
            )
            .regional(
                "remove_unused_secrets_manager_secrets",
                remove_unused_secrets_manager_secrets,
            )
            .regional("secrets_should_be_tagged", secrets_should_be_tagged)
    }
}

fn secrets_should_have_automatic_rotation_enabled(
    inv: &SecretsManagerInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .secrets
        .iter()
        .map(|secret| {
            let enabled = flag(&secret["RotationEnabled"]);
            base_finding(ctx, secret, !enabled)
                .with_data("rotation_enabled", enabled)
                .with_data("rotation_rules", &secret["RotationRules"])
        })
        .collect())
}

/// A secret never accessed, or not accessed within the window, is unused
fn remove_unused_secrets_manager_secrets(
    inv: &SecretsManagerInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let window = ctx.thresholds().unused_secret_days;

    Ok(inv
        .secrets
        .iter()
        .map(|secret| {
            let last_accessed = timestamp(&secret["LastAccessedDate"]);
            let unused = match last_accessed {
                Some(at) => ctx.days_since(at) > window,
                None => true,
            };
            base_finding(ctx, secret, unused)
                .with_data("last_accessed", last_accessed.map(|t| t.to_rfc3339()))
                .with_data("unused_days_threshold", window)
        })
        .collect())
}

fn secrets_should_be_tagged(
    inv: &SecretsManagerInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .secrets
        .iter()
        .map(|secret| {
            let tagged = has_tags(&secret["Tags"]);
            base_finding(ctx, secret, !tagged).with_data("tags", &secret["Tags"])
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{evaluate, Scope};
    use crate::types::ExecutionContext;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn findings_for(secrets: Vec<Value>, check: &str) -> Vec<Finding> {
        let started = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let context = ExecutionContext::new("123456789012", vec![], vec![]).with_started_at(started);
        let table = SecretsManagerInventory::predicates();
        let predicates: Vec<_> = table
            .for_scope(Scope::Regional)
            .into_iter()
            .filter(|p| p.name == check)
            .collect();
        evaluate(
            &predicates,
            &SecretsManagerInventory { secrets },
            &context,
            "Secret Manager",
            "us-east-1",
        )
    }

    #[test]
    fn test_rotation_rule() {
        let findings = findings_for(
            vec![
                json!({"ARN": "arn:s:1", "Name": "one", "RotationEnabled": true}),
                json!({"ARN": "arn:s:2", "Name": "two"}),
            ],
            "secrets_should_have_automatic_rotation_enabled",
        );
        assert_eq!(findings.len(), 2);
        assert!(!findings[0].issue_found);
        assert!(findings[1].issue_found);
        assert_eq!(findings[1].resource_id, "arn:s:2");
        assert_eq!(findings[1].service, "Secret Manager");
    }

    #[test]
    fn test_unused_secret_window() {
        let started = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let recent = (started - Duration::days(3)).timestamp();
        let stale = (started - Duration::days(40)).timestamp();

        let findings = findings_for(
            vec![
                json!({"ARN": "recent", "LastAccessedDate": recent}),
                json!({"ARN": "stale", "LastAccessedDate": stale}),
                json!({"ARN": "never"}),
            ],
            "remove_unused_secrets_manager_secrets",
        );
        let issues: Vec<(&str, bool)> = findings
            .iter()
            .map(|f| (f.resource_id.as_str(), f.issue_found))
            .collect();
        assert_eq!(issues, vec![("recent", false), ("stale", true), ("never", true)]);
    }

    #[test]
    fn test_tagging_rule() {
        let findings = findings_for(
            vec![
                json!({"ARN": "a", "Tags": [{"Key": "owner", "Value": "x"}]}),
                json!({"ARN": "b", "Tags": []}),
            ],
            "secrets_should_be_tagged",
        );
        assert!(!findings[0].issue_found);
        assert!(findings[1].issue_found);
    }
}
