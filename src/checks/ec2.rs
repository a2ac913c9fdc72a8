//! EC2 check
//!
//! Regional. Instances and security groups are the primary inventory; Auto
//! Scaling groups, launch configurations, launch templates and Elastic IPs
//! are secondary listings whose failure only silences the rules reading them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;

use super::{has_tags, CheckScope, Fetched, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::aws::xml::list_of;
use crate::cloud::ApiCall;
use crate::types::Finding;

const SERVICE: &str = "ec2";
const AUTOSCALING: &str = "autoscaling";

/// Tag EC2 Auto Scaling puts on the instances it launches
const ASG_MEMBER_TAG: &str = "aws:autoscaling:groupName";

#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    /// DescribeLaunchTemplates entry
    pub details: Value,
    /// Data of the default version
    pub default_version: Fetched<Value>,
}

impl LaunchTemplate {
    fn name(&self) -> &str {
        self.details["launchTemplateName"]
            .as_str()
            .or_else(|| self.details["launchTemplateId"].as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Ec2Inventory {
    /// Instances flattened out of every reservation
    pub instances: Vec<Value>,
    pub security_groups: Vec<Value>,
    pub auto_scaling_groups: Fetched<Vec<Value>>,
    pub launch_configurations: Fetched<Vec<Value>>,
    pub launch_templates: Fetched<Vec<LaunchTemplate>>,
    pub addresses: Fetched<Vec<Value>>,
}

impl Default for Ec2Inventory {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            security_groups: Vec::new(),
            auto_scaling_groups: Fetched::Present(Vec::new()),
            launch_configurations: Fetched::Present(Vec::new()),
            launch_templates: Fetched::Present(Vec::new()),
            addresses: Fetched::Present(Vec::new()),
        }
    }
}

fn instance_id(instance: &Value) -> String {
    instance["instanceId"].as_str().unwrap_or_default().to_string()
}

fn group_id(group: &Value) -> String {
    group["groupId"].as_str().unwrap_or_default().to_string()
}

/// Keys of an EC2 `tagSet`
fn tag_keys(tag_set: &Value) -> Vec<&str> {
    list_of(tag_set)
        .into_iter()
        .filter_map(|tag| tag["key"].as_str())
        .collect()
}

fn non_empty(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

/// IMDSv2 is enforced when session tokens are required
fn requires_imdsv2(metadata_options: &Value, tokens_key: &str) -> bool {
    metadata_options[tokens_key].as_str() == Some("required")
}

#[async_trait]
impl ServiceInventory for Ec2Inventory {
    const SERVICE: &'static str = "EC2";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let reservations = scope
            .paginate_next_token(SERVICE, ApiCall::query("DescribeInstances"), "reservationSet")
            .await
            .context("Failed to describe instances")?;
        let instances: Vec<Value> = reservations
            .iter()
            .flat_map(|reservation| list_of(&reservation["instancesSet"]))
            .cloned()
            .collect();

        let security_groups = scope
            .paginate_next_token(SERVICE, ApiCall::query("DescribeSecurityGroups"), "securityGroupInfo")
            .await
            .context("Failed to describe security groups")?;

        let auto_scaling_groups = Fetched::from_result(
            scope
                .paginate_next_token(
                    AUTOSCALING,
                    ApiCall::query("DescribeAutoScalingGroups"),
                    "AutoScalingGroups",
                )
                .await,
        );
        let launch_configurations = Fetched::from_result(
            scope
                .paginate_next_token(
                    AUTOSCALING,
                    ApiCall::query("DescribeLaunchConfigurations"),
                    "LaunchConfigurations",
                )
                .await,
        );
        let addresses: Fetched<Vec<Value>> = Fetched::from_result(
            scope
                .call(SERVICE, ApiCall::query("DescribeAddresses"))
                .await
                .map(|response| {
                    let addresses = list_of(&response["addressesSet"]);
                    addresses.into_iter().cloned().collect()
                }),
        );

        let launch_templates = match scope
            .paginate_next_token(SERVICE, ApiCall::query("DescribeLaunchTemplates"), "launchTemplates")
            .await
        {
            Ok(listed) => {
                let mut templates = Vec::with_capacity(listed.len());
                for details in listed {
                    let default_version = scope
                        .fetch(
                            SERVICE,
                            scope.region(),
                            ApiCall::query("DescribeLaunchTemplateVersions")
                                .param("LaunchTemplateId", details["launchTemplateId"].as_str().unwrap_or_default())
                                .param("LaunchTemplateVersion.1", "$Default"),
                            &[],
                        )
                        .await
                        .map(|response| {
                            let versions = list_of(&response["launchTemplateVersionSet"]);
                            versions
                                .first()
                                .map(|version| version["launchTemplateData"].clone())
                                .unwrap_or(Value::Null)
                        });
                    templates.push(LaunchTemplate {
                        details,
                        default_version,
                    });
                }
                Fetched::Present(templates)
            }
            Err(e) => Fetched::from_result(Err(e)),
        };

        Ok(Self {
            instances,
            security_groups,
            auto_scaling_groups,
            launch_configurations,
            launch_templates,
            addresses,
        })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .regional(
                "auto_scaling_group_should_have_tags",
                auto_scaling_group_should_have_tags,
            )
            .regional(
                "auto_scaling_group_should_cover_multiple_availability_zones",
                auto_scaling_group_should_cover_multiple_availability_zones,
            )
            .regional(
                "launch_template_require_instance_metadata_v2",
                launch_template_require_instance_metadata_v2,
            )
            .regional(
                "launch_configuration_require_instance_metadata_v2",
                launch_configuration_require_instance_metadata_v2,
            )
            .regional(
                "auto_scaling_groups_should_use_launch_templates",
                auto_scaling_groups_should_use_launch_templates,
            )
            .regional("unused_eips_should_be_removed", unused_eips_should_be_removed)
            .regional("instances_should_be_tagged", instances_should_be_tagged)
            .regional(
                "instances_launched_using_auto_scaling_group_should_not_have_public_ip_addresses",
                instances_launched_using_auto_scaling_group_should_not_have_public_ip_addresses,
            )
            .regional(
                "unused_security_groups_should_be_removed",
                unused_security_groups_should_be_removed,
            )
            .regional(
                "security_groups_should_be_tagged",
                security_groups_should_be_tagged,
            )
    }
}

// ----------------------------------------------------------------------------
// Auto Scaling
// ----------------------------------------------------------------------------

fn asg_finding(ctx: &PredicateContext<'_>, group: &Value, issue_found: bool) -> Finding {
    let name = group["AutoScalingGroupName"].as_str().unwrap_or_default();
    let resource = non_empty(&group["AutoScalingGroupARN"]).unwrap_or(name);
    ctx.finding(resource, issue_found)
        .with_data("auto_scaling_group_name", name)
}

fn auto_scaling_group_should_have_tags(inv: &Ec2Inventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    let Some(groups) = inv.auto_scaling_groups.present() else {
        return Ok(Vec::new());
    };
    Ok(groups
        .iter()
        .map(|group| {
            let tags = list_of(&group["Tags"]);
            asg_finding(ctx, group, tags.is_empty()).with_data("tags", tags)
        })
        .collect())
}

fn auto_scaling_group_should_cover_multiple_availability_zones(
    inv: &Ec2Inventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let Some(groups) = inv.auto_scaling_groups.present() else {
        return Ok(Vec::new());
    };
    Ok(groups
        .iter()
        .map(|group| {
            let zones = list_of(&group["AvailabilityZones"]);
            asg_finding(ctx, group, zones.len() < 2).with_data("availability_zones", zones)
        })
        .collect())
}

fn auto_scaling_groups_should_use_launch_templates(
    inv: &Ec2Inventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let Some(groups) = inv.auto_scaling_groups.present() else {
        return Ok(Vec::new());
    };
    Ok(groups
        .iter()
        .map(|group| {
            let launch_configuration = non_empty(&group["LaunchConfigurationName"]);
            asg_finding(ctx, group, launch_configuration.is_some())
                .with_data("launch_configuration_name", launch_configuration)
        })
        .collect())
}

fn launch_configuration_require_instance_metadata_v2(
    inv: &Ec2Inventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let Some(configurations) = inv.launch_configurations.present() else {
        return Ok(Vec::new());
    };
    Ok(configurations
        .iter()
        .map(|config| {
            let name = config["LaunchConfigurationName"].as_str().unwrap_or_default();
            let required = requires_imdsv2(&config["MetadataOptions"], "HttpTokens");
            ctx.finding(non_empty(&config["LaunchConfigurationARN"]).unwrap_or(name), !required)
                .with_data("launch_configuration_name", name)
                .with_data("http_tokens", &config["MetadataOptions"]["HttpTokens"])
        })
        .collect())
}

fn launch_template_require_instance_metadata_v2(
    inv: &Ec2Inventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let Some(templates) = inv.launch_templates.present() else {
        return Ok(Vec::new());
    };
    Ok(templates
        .iter()
        .filter_map(|template| {
            let data = template.default_version.present()?;
            let required = requires_imdsv2(&data["metadataOptions"], "httpTokens");
            Some(
                ctx.finding(template.name(), !required)
                    .with_data("launch_template_id", &template.details["launchTemplateId"])
                    .with_data("default_version", &template.details["defaultVersionNumber"])
                    .with_data("latest_version", &template.details["latestVersionNumber"]),
            )
        })
        .collect())
}

// ----------------------------------------------------------------------------
// Addresses, instances and security groups
// ----------------------------------------------------------------------------

/// An Elastic IP with no association is unused
fn unused_eips_should_be_removed(inv: &Ec2Inventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    let Some(addresses) = inv.addresses.present() else {
        return Ok(Vec::new());
    };
    Ok(addresses
        .iter()
        .map(|address| {
            let association = non_empty(&address["associationId"])
                .or_else(|| non_empty(&address["instanceId"]))
                .or_else(|| non_empty(&address["networkInterfaceId"]));
            ctx.finding(address["publicIp"].as_str().unwrap_or_default(), association.is_none())
                .with_data("allocation_id", &address["allocationId"])
                .with_data("association", association)
        })
        .collect())
}

fn instances_should_be_tagged(inv: &Ec2Inventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(inv
        .instances
        .iter()
        .map(|instance| {
            let tagged = has_tags(&instance["tagSet"]);
            ctx.finding(instance_id(instance), !tagged)
                .with_data("tags", list_of(&instance["tagSet"]))
        })
        .collect())
}

fn instances_launched_using_auto_scaling_group_should_not_have_public_ip_addresses(
    inv: &Ec2Inventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .instances
        .iter()
        .filter(|instance| tag_keys(&instance["tagSet"]).contains(&ASG_MEMBER_TAG))
        .map(|instance| {
            let public_ip = non_empty(&instance["ipAddress"]);
            ctx.finding(instance_id(instance), public_ip.is_some())
                .with_data("public_ip", public_ip)
        })
        .collect())
}

/// A group no instance references is unused
fn unused_security_groups_should_be_removed(
    inv: &Ec2Inventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let in_use: BTreeSet<String> = inv
        .instances
        .iter()
        .flat_map(|instance| list_of(&instance["groupSet"]))
        .map(group_id)
        .collect();

    Ok(inv
        .security_groups
        .iter()
        .map(|group| {
            let id = group_id(group);
            let used = in_use.contains(&id);
            ctx.finding(id, !used)
                .with_data("security_group_name", &group["groupName"])
        })
        .collect())
}

fn security_groups_should_be_tagged(inv: &Ec2Inventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(inv
        .security_groups
        .iter()
        .map(|group| {
            let tagged = has_tags(&group["tagSet"]);
            ctx.finding(group_id(group), !tagged)
                .with_data("security_group_name", &group["groupName"])
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

    fn context() -> ExecutionContext {
        ExecutionContext::new("123456789012", vec![], vec![])
    }

    fn accessor(autoscaling_denied: bool) -> StaticAccessor {
        StaticAccessor::new(move |service, region, call| {
            assert_eq!(region, "eu-west-1");
            let ApiCall::Query { action, params } = call else {
                panic!("unexpected call {:?}", call);
            };
            match (service, action.as_str()) {
                ("ec2", "DescribeInstances") => Ok(json!({"reservationSet": [
                    {"instancesSet": [
                        {
                            "instanceId": "i-web",
                            "ipAddress": "203.0.113.10",
                            "tagSet": [{"key": "aws:autoscaling:groupName", "value": "web"}],
                            "groupSet": [{"groupId": "sg-web", "groupName": "web"}]
                        },
                        {
                            "instanceId": "i-bare",
                            "tagSet": "",
                            "groupSet": [{"groupId": "sg-web", "groupName": "web"}]
                        }
                    ]},
                    {"instancesSet": [
                        {
                            "instanceId": "i-worker",
                            "tagSet": [{"key": "aws:autoscaling:groupName", "value": "workers"}],
                            "groupSet": [{"groupId": "sg-worker", "groupName": "worker"}]
                        }
                    ]}
                ]})),
                ("ec2", "DescribeSecurityGroups") => Ok(json!({"securityGroupInfo": [
                    {"groupId": "sg-web", "groupName": "web", "tagSet": [{"key": "team", "value": "a"}]},
                    {"groupId": "sg-worker", "groupName": "worker"},
                    {"groupId": "sg-stale", "groupName": "stale", "tagSet": ""}
                ]})),
                ("ec2", "DescribeAddresses") => Ok(json!({"addressesSet": [
                    {"publicIp": "198.51.100.1", "allocationId": "eipalloc-1", "associationId": "eipassoc-1"},
                    {"publicIp": "198.51.100.2", "allocationId": "eipalloc-2"}
                ]})),
                ("ec2", "DescribeLaunchTemplates") => Ok(json!({"launchTemplates": [
                    {"launchTemplateId": "lt-1", "launchTemplateName": "strict", "defaultVersionNumber": "2"},
                    {"launchTemplateId": "lt-2", "launchTemplateName": "loose", "defaultVersionNumber": "1"}
                ]})),
                ("ec2", "DescribeLaunchTemplateVersions") => {
                    assert!(params.contains(&("LaunchTemplateVersion.1".to_string(), "$Default".to_string())));
                    let id = params.iter().find(|(k, _)| k == "LaunchTemplateId").map(|(_, v)| v.as_str());
                    let tokens = if id == Some("lt-1") { "required" } else { "optional" };
                    Ok(json!({"launchTemplateVersionSet": [
                        {"launchTemplateData": {"metadataOptions": {"httpTokens": tokens}}}
                    ]}))
                }
                ("autoscaling", _) if autoscaling_denied => Err(api_error(403, "AccessDenied")),
                ("autoscaling", "DescribeAutoScalingGroups") => Ok(json!({"AutoScalingGroups": [
                    {
                        "AutoScalingGroupName": "web",
                        "AutoScalingGroupARN": "arn:asg/web",
                        "AvailabilityZones": ["eu-west-1a", "eu-west-1b"],
                        "Tags": [{"Key": "team", "Value": "a"}],
                        "LaunchTemplate": {"LaunchTemplateId": "lt-1"}
                    },
                    {
                        "AutoScalingGroupName": "workers",
                        "AutoScalingGroupARN": "arn:asg/workers",
                        "AvailabilityZones": ["eu-west-1a"],
                        "Tags": "",
                        "LaunchConfigurationName": "old-config"
                    }
                ]})),
                ("autoscaling", "DescribeLaunchConfigurations") => Ok(json!({"LaunchConfigurations": [
                    {"LaunchConfigurationName": "old-config", "MetadataOptions": {"HttpTokens": "optional"}}
                ]})),
                other => panic!("unexpected call {:?}", other),
            }
        })
    }

    async fn findings(autoscaling_denied: bool) -> Vec<Finding> {
        let scope = CheckScope::new(
            Arc::new(context()),
            Arc::new(accessor(autoscaling_denied)),
            "eu-west-1",
            ThrottleGuard::default(),
        );
        let inventory = Ec2Inventory::collect(&scope).await.unwrap();
        let table = Ec2Inventory::predicates();
        assert!(table.for_scope(Scope::Global).is_empty());
        evaluate(
            &table.for_scope(Scope::Regional),
            &inventory,
            &context(),
            "EC2",
            "eu-west-1",
        )
    }

    fn by_check(findings: &[Finding], check: &str) -> Vec<(String, bool)> {
        findings
            .iter()
            .filter(|f| f.check_name == check)
            .map(|f| (f.resource_id.clone(), f.issue_found))
            .collect()
    }

    #[tokio::test]
    async fn test_collect_and_evaluate() {
        let findings = findings(false).await;

        assert_eq!(
            by_check(&findings, "auto_scaling_group_should_have_tags"),
            vec![("arn:asg/web".into(), false), ("arn:asg/workers".into(), true)]
        );
        assert_eq!(
            by_check(&findings, "auto_scaling_group_should_cover_multiple_availability_zones"),
            vec![("arn:asg/web".into(), false), ("arn:asg/workers".into(), true)]
        );
        assert_eq!(
            by_check(&findings, "auto_scaling_groups_should_use_launch_templates"),
            vec![("arn:asg/web".into(), false), ("arn:asg/workers".into(), true)]
        );
        assert_eq!(
            by_check(&findings, "launch_configuration_require_instance_metadata_v2"),
            vec![("old-config".into(), true)]
        );
        assert_eq!(
            by_check(&findings, "launch_template_require_instance_metadata_v2"),
            vec![("strict".into(), false), ("loose".into(), true)]
        );
        assert_eq!(
            by_check(&findings, "unused_eips_should_be_removed"),
            vec![("198.51.100.1".into(), false), ("198.51.100.2".into(), true)]
        );
        assert_eq!(
            by_check(&findings, "instances_should_be_tagged"),
            vec![("i-web".into(), false), ("i-bare".into(), true), ("i-worker".into(), false)]
        );
        assert_eq!(
            by_check(
                &findings,
                "instances_launched_using_auto_scaling_group_should_not_have_public_ip_addresses"
            ),
            vec![("i-web".into(), true), ("i-worker".into(), false)]
        );
        assert_eq!(
            by_check(&findings, "unused_security_groups_should_be_removed"),
            vec![("sg-web".into(), false), ("sg-worker".into(), false), ("sg-stale".into(), true)]
        );
        assert_eq!(
            by_check(&findings, "security_groups_should_be_tagged"),
            vec![("sg-web".into(), false), ("sg-worker".into(), true), ("sg-stale".into(), true)]
        );
    }

    #[tokio::test]
    async fn test_denied_autoscaling_only_silences_its_rules() {
        let findings = findings(true).await;

        assert!(by_check(&findings, "auto_scaling_group_should_have_tags").is_empty());
        assert!(by_check(&findings, "launch_configuration_require_instance_metadata_v2").is_empty());
        assert_eq!(by_check(&findings, "instances_should_be_tagged").len(), 3);
        assert_eq!(by_check(&findings, "launch_template_require_instance_metadata_v2").len(), 2);
    }

    #[tokio::test]
    async fn test_instance_listing_failure_fails_collection() {
        let accessor = StaticAccessor::new(|_, _, _| Err(api_error(403, "UnauthorizedOperation")));
        let scope = CheckScope::new(
            Arc::new(context()),
            Arc::new(accessor),
            "eu-west-1",
            ThrottleGuard::default(),
        );
        let err = Ec2Inventory::collect(&scope).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to describe instances"));
    }
}
