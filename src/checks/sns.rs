//! SNS check
//!
//! Regional. Tagging, KMS encryption and access policy rules for every topic.
//! Attributes and tags are read per topic.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{CheckScope, Fetched, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::aws::xml::list_of;
use crate::cloud::ApiCall;
use crate::types::Finding;

const SERVICE: &str = "sns";

/// Condition keys that pin a wildcard principal to the account
const OWNER_CONDITION_KEYS: &[&str] = &["AWS:SourceOwner", "AWS:SourceAccount", "aws:SourceAccount"];

#[derive(Debug, Clone)]
pub struct Topic {
    pub arn: String,
    /// GetTopicAttributes entries as a key/value map
    pub attributes: Fetched<Map<String, Value>>,
    /// ListTagsForResource entries
    pub tags: Fetched<Vec<Value>>,
}

impl Topic {
    /// Name part of the ARN
    fn name(&self) -> &str {
        self.arn.rsplit(':').next().unwrap_or(&self.arn)
    }

    fn finding(&self, ctx: &PredicateContext<'_>, issue_found: bool) -> Finding {
        ctx.finding(self.arn.clone(), issue_found)
            .with_data("topic_name", self.name())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnsInventory {
    pub topics: Vec<Topic>,
}

/// Query-protocol `entry` list to a map
fn attribute_map(response: &Value) -> Map<String, Value> {
    list_of(&response["Attributes"]["entry"])
        .into_iter()
        .filter_map(|entry| Some((entry["key"].as_str()?.to_string(), entry["value"].clone())))
        .collect()
}

#[async_trait]
impl ServiceInventory for SnsInventory {
    const SERVICE: &'static str = "SNS";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let listed = scope
            .paginate_next_token(SERVICE, ApiCall::query("ListTopics"), "Topics")
            .await
            .context("Failed to list topics")?;

        let mut topics = Vec::with_capacity(listed.len());
        for entry in listed {
            let Some(arn) = entry["TopicArn"].as_str().map(String::from) else {
                continue;
            };

            let attributes = scope
                .fetch(
                    SERVICE,
                    scope.region(),
                    ApiCall::query("GetTopicAttributes").param("TopicArn", arn.as_str()),
                    &[],
                )
                .await
                .map(|response| attribute_map(&response));
            let tags = scope
                .fetch(
                    SERVICE,
                    scope.region(),
                    ApiCall::query("ListTagsForResource").param("ResourceArn", arn.as_str()),
                    &[],
                )
                .await
                .map(|response| {
                    let tags = list_of(&response["Tags"]);
                    tags.into_iter().cloned().collect::<Vec<Value>>()
                });

            topics.push(Topic {
                arn,
                attributes,
                tags,
            });
        }

        Ok(Self { topics })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .regional("topics_should_be_tagged", topics_should_be_tagged)
            .regional(
                "topics_should_be_encrypted_at_rest_using_aws_kms",
                topics_should_be_encrypted_at_rest_using_aws_kms,
            )
            .regional(
                "topic_access_policies_should_not_allow_public_access",
                topic_access_policies_should_not_allow_public_access,
            )
    }
}

fn topics_should_be_tagged(inv: &SnsInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(inv
        .topics
        .iter()
        .filter_map(|topic| {
            let tags = topic.tags.present()?;
            Some(topic.finding(ctx, tags.is_empty()).with_data("tags", tags))
        })
        .collect())
}

fn topics_should_be_encrypted_at_rest_using_aws_kms(
    inv: &SnsInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .topics
        .iter()
        .filter_map(|topic| {
            let attributes = topic.attributes.present()?;
            let key = attributes
                .get("KmsMasterKeyId")
                .and_then(Value::as_str)
                .filter(|k| !k.is_empty());
            Some(topic.finding(ctx, key.is_none()).with_data("kms_key_id", key))
        })
        .collect())
}

/// Whether a principal element names everyone
fn is_wildcard_principal(principal: &Value) -> bool {
    match principal {
        Value::String(s) => s == "*",
        Value::Object(map) => ["AWS", "Service"].iter().any(|kind| {
            map.get(*kind)
                .is_some_and(|value| list_of(value).iter().any(|p| p.as_str() == Some("*")))
        }),
        _ => false,
    }
}

/// Whether a statement's condition restricts it to `account_id`
fn restricted_to_account(condition: &Value, account_id: &str) -> bool {
    ["StringEquals", "ArnEquals", "StringLike"].iter().any(|operator| {
        OWNER_CONDITION_KEYS.iter().any(|key| {
            list_of(&condition[*operator][*key])
                .iter()
                .any(|value| value.as_str() == Some(account_id))
        })
    })
}

/// Allow statements open to everyone without an account condition
fn public_statements(policy: &Value, account_id: &str) -> usize {
    list_of(&policy["Statement"])
        .into_iter()
        .filter(|statement| statement["Effect"].as_str() != Some("Deny"))
        .filter(|statement| is_wildcard_principal(&statement["Principal"]))
        .filter(|statement| !restricted_to_account(&statement["Condition"], account_id))
        .count()
}

/// Topics without a policy are private. Unparseable policies are skipped.
fn topic_access_policies_should_not_allow_public_access(
    inv: &SnsInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .topics
        .iter()
        .filter_map(|topic| {
            let attributes = topic.attributes.present()?;
            let public = match attributes.get("Policy").and_then(Value::as_str) {
                Some(raw) => {
                    let policy: Value = serde_json::from_str(raw).ok()?;
                    public_statements(&policy, ctx.account_id())
                }
                None => 0,
            };
            Some(topic.finding(ctx, public > 0).with_data("public_statements", public))
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
    use serde_json::json;
    use std::sync::Arc;

    const ACCOUNT: &str = "123456789012";

    fn context() -> ExecutionContext {
        ExecutionContext::new(ACCOUNT, vec![], vec![])
    }

    fn arn(name: &str) -> String {
        format!("arn:aws:sns:ap-south-1:{}:{}", ACCOUNT, name)
    }

    fn entries(attributes: &[(&str, String)]) -> Value {
        let entries: Vec<Value> = attributes
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value}))
            .collect();
        json!({"Attributes": {"entry": entries}})
    }

    fn accessor() -> StaticAccessor {
        let open_policy = json!({"Statement": [
            {"Effect": "Allow", "Principal": {"AWS": "*"}, "Action": "SNS:Publish"}
        ]})
        .to_string();
        let pinned_policy = json!({"Statement": {
            "Effect": "Allow",
            "Principal": "*",
            "Action": "SNS:Publish",
            "Condition": {"StringEquals": {"AWS:SourceOwner": ACCOUNT}}
        }})
        .to_string();

        StaticAccessor::new(move |service, region, call| {
            assert_eq!((service, region), ("sns", "ap-south-1"));
            let ApiCall::Query { action, params } = call else {
                panic!("unexpected call {:?}", call);
            };
            let target = params.first().map(|(_, v)| v.as_str()).unwrap_or_default();
            match action.as_str() {
                "ListTopics" => Ok(json!({"Topics": [
                    {"TopicArn": arn("alerts")},
                    {"TopicArn": arn("events")},
                    {"TopicArn": arn("legacy")}
                ]})),
                "GetTopicAttributes" if target == arn("alerts") => Ok(entries(&[
                    ("KmsMasterKeyId", "alias/aws/sns".to_string()),
                    ("Policy", pinned_policy.clone()),
                ])),
                "GetTopicAttributes" if target == arn("events") => {
                    Ok(entries(&[("Policy", open_policy.clone())]))
                }
                "GetTopicAttributes" => Err(api_error(403, "AuthorizationError")),
                "ListTagsForResource" if target == arn("alerts") => Ok(json!({"Tags": [
                    {"Key": "team", "Value": "ops"}
                ]})),
                "ListTagsForResource" => Ok(json!({"Tags": ""})),
                other => panic!("unexpected action {}", other),
            }
        })
    }

    #[tokio::test]
    async fn test_collect_and_evaluate() {
        let scope = CheckScope::new(
            Arc::new(context()),
            Arc::new(accessor()),
            "ap-south-1",
            ThrottleGuard::default(),
        );
        let inventory = SnsInventory::collect(&scope).await.unwrap();
        assert_eq!(inventory.topics.len(), 3);
        assert_eq!(inventory.topics[0].name(), "alerts");
        assert!(!inventory.topics[2].attributes.is_evaluable());

        let table = SnsInventory::predicates();
        assert!(table.for_scope(Scope::Global).is_empty());
        let findings = evaluate(
            &table.for_scope(Scope::Regional),
            &inventory,
            &context(),
            "SNS",
            "ap-south-1",
        );

        let by_check = |check: &str| -> Vec<(String, bool)> {
            findings
                .iter()
                .filter(|f| f.check_name == check)
                .map(|f| (f.resource_id.clone(), f.issue_found))
                .collect()
        };

        assert_eq!(
            by_check("topics_should_be_tagged"),
            vec![(arn("alerts"), false), (arn("events"), true), (arn("legacy"), true)]
        );
        assert_eq!(
            by_check("topics_should_be_encrypted_at_rest_using_aws_kms"),
            vec![(arn("alerts"), false), (arn("events"), true)],
            "topics whose attributes are unreadable are not evaluated"
        );
        assert_eq!(
            by_check("topic_access_policies_should_not_allow_public_access"),
            vec![(arn("alerts"), false), (arn("events"), true)]
        );
    }

    #[test]
    fn test_public_statement_detection() {
        let deny = json!({"Statement": [{"Effect": "Deny", "Principal": "*"}]});
        assert_eq!(public_statements(&deny, ACCOUNT), 0);

        let scoped = json!({"Statement": [{"Effect": "Allow", "Principal": {"AWS": "arn:aws:iam::1:root"}}]});
        assert_eq!(public_statements(&scoped, ACCOUNT), 0);

        let other_account = json!({"Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": ["events.amazonaws.com", "*"]},
            "Condition": {"StringEquals": {"AWS:SourceOwner": "999999999999"}}
        }]});
        assert_eq!(public_statements(&other_account, ACCOUNT), 1);

        let account_condition = json!({"Statement": [{
            "Effect": "Allow",
            "Principal": "*",
            "Condition": {"StringEquals": {"aws:SourceAccount": [ACCOUNT]}}
        }]});
        assert_eq!(public_statements(&account_condition, ACCOUNT), 0);
    }
}
