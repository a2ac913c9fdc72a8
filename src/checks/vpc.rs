//! VPC check
//!
//! Regional. Flow logging, tagging and private interface endpoints for every
//! VPC in the region. VPCs are the primary inventory; flow logs, endpoints,
//! endpoint services and peering connections are secondary listings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;

use super::{has_tags, CheckScope, Fetched, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::aws::xml::list_of;
use crate::cloud::ApiCall;
use crate::types::Finding;

const SERVICE: &str = "ec2";

/// Endpoint service owners that are AWS itself
const AWS_OWNERS: &[&str] = &["amazon", "aws-marketplace"];

#[derive(Debug, Clone)]
pub struct VpcInventory {
    pub vpcs: Vec<Value>,
    pub flow_logs: Fetched<Vec<Value>>,
    pub endpoints: Fetched<Vec<Value>>,
    pub endpoint_services: Fetched<Vec<Value>>,
    pub peering_connections: Fetched<Vec<Value>>,
}

impl Default for VpcInventory {
    fn default() -> Self {
        Self {
            vpcs: Vec::new(),
            flow_logs: Fetched::Present(Vec::new()),
            endpoints: Fetched::Present(Vec::new()),
            endpoint_services: Fetched::Present(Vec::new()),
            peering_connections: Fetched::Present(Vec::new()),
        }
    }
}

fn vpc_id(vpc: &Value) -> String {
    vpc["vpcId"].as_str().unwrap_or_default().to_string()
}

async fn listing(scope: &CheckScope, action: &str, items_key: &str) -> Fetched<Vec<Value>> {
    Fetched::from_result(
        scope
            .paginate_next_token(SERVICE, ApiCall::query(action), items_key)
            .await,
    )
}

#[async_trait]
impl ServiceInventory for VpcInventory {
    const SERVICE: &'static str = "VPC";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let vpcs = scope
            .paginate_next_token(SERVICE, ApiCall::query("DescribeVpcs"), "vpcSet")
            .await
            .context("Failed to describe VPCs")?;

        Ok(Self {
            vpcs,
            flow_logs: listing(scope, "DescribeFlowLogs", "flowLogSet").await,
            endpoints: listing(scope, "DescribeVpcEndpoints", "vpcEndpointSet").await,
            endpoint_services: listing(scope, "DescribeVpcEndpointServices", "serviceDetailSet").await,
            peering_connections: listing(scope, "DescribeVpcPeeringConnections", "vpcPeeringConnectionSet")
                .await,
        })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .regional("vpcs_should_be_tagged", vpcs_should_be_tagged)
            .regional("vpc_flow_logs_should_be_tagged", vpc_flow_logs_should_be_tagged)
            .regional(
                "vpc_endpoint_services_should_be_tagged",
                vpc_endpoint_services_should_be_tagged,
            )
            .regional(
                "vpc_peering_connections_should_be_tagged",
                vpc_peering_connections_should_be_tagged,
            )
            .regional(
                "vpc_flow_logging_should_be_enabled_in_all_vpcs",
                vpc_flow_logging_should_be_enabled_in_all_vpcs,
            )
            .regional(
                "vpcs_should_be_configured_with_an_interface_endpoint_for_ecr_api",
                interface_endpoint_for_ecr_api,
            )
            .regional(
                "vpcs_should_be_configured_with_an_interface_endpoint_for_docker_registry",
                interface_endpoint_for_docker_registry,
            )
            .regional(
                "vpcs_should_be_configured_with_an_interface_endpoint_for_systems_manager",
                interface_endpoint_for_systems_manager,
            )
            .regional(
                "vpcs_should_be_configured_with_an_interface_endpoint_for_systems_manager_contacts",
                interface_endpoint_for_systems_manager_contacts,
            )
            .regional(
                "vpcs_should_be_configured_with_an_interface_endpoint_for_systems_manager_incidents",
                interface_endpoint_for_systems_manager_incidents,
            )
    }
}

fn vpcs_should_be_tagged(inv: &VpcInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(inv
        .vpcs
        .iter()
        .map(|vpc| {
            let tagged = has_tags(&vpc["tagSet"]);
            ctx.finding(vpc_id(vpc), !tagged)
                .with_data("tags", list_of(&vpc["tagSet"]))
        })
        .collect())
}

fn vpc_flow_logs_should_be_tagged(inv: &VpcInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    let Some(flow_logs) = inv.flow_logs.present() else {
        return Ok(Vec::new());
    };
    Ok(flow_logs
        .iter()
        .map(|flow_log| {
            let tagged = has_tags(&flow_log["tagSet"]);
            ctx.finding(flow_log["resourceId"].as_str().unwrap_or_default(), !tagged)
                .with_data("flow_log_id", &flow_log["flowLogId"])
        })
        .collect())
}

/// Customer-owned endpoint services only
fn vpc_endpoint_services_should_be_tagged(
    inv: &VpcInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let Some(services) = inv.endpoint_services.present() else {
        return Ok(Vec::new());
    };
    Ok(services
        .iter()
        .filter(|service| {
            let owner = service["owner"].as_str().unwrap_or_default();
            !AWS_OWNERS.contains(&owner)
        })
        .map(|service| {
            let tagged = has_tags(&service["tagSet"]);
            ctx.finding(service["serviceId"].as_str().unwrap_or_default(), !tagged)
                .with_data("service_name", &service["serviceName"])
        })
        .collect())
}

fn vpc_peering_connections_should_be_tagged(
    inv: &VpcInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let Some(peerings) = inv.peering_connections.present() else {
        return Ok(Vec::new());
    };
    Ok(peerings
        .iter()
        .map(|peering| {
            let tagged = has_tags(&peering["tagSet"]);
            ctx.finding(
                peering["vpcPeeringConnectionId"].as_str().unwrap_or_default(),
                !tagged,
            )
            .with_data("accepter_vpc_id", &peering["accepterVpcInfo"]["vpcId"])
            .with_data("requester_vpc_id", &peering["requesterVpcInfo"]["vpcId"])
            .with_data("peering_tags", list_of(&peering["tagSet"]))
        })
        .collect())
}

fn vpc_flow_logging_should_be_enabled_in_all_vpcs(
    inv: &VpcInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let Some(flow_logs) = inv.flow_logs.present() else {
        return Ok(Vec::new());
    };
    let logged: BTreeSet<&str> = flow_logs
        .iter()
        .filter_map(|flow_log| flow_log["resourceId"].as_str())
        .collect();

    Ok(inv
        .vpcs
        .iter()
        .map(|vpc| {
            let id = vpc_id(vpc);
            let enabled = logged.contains(id.as_str());
            ctx.finding(id, !enabled)
        })
        .collect())
}

/// One finding per VPC: compliant when an available endpoint for
/// `com.amazonaws.{region}.{suffix}` is attached to it
fn interface_endpoint(inv: &VpcInventory, ctx: &PredicateContext<'_>, suffix: &str) -> Vec<Finding> {
    let Some(endpoints) = inv.endpoints.present() else {
        return Vec::new();
    };
    let service_name = format!("com.amazonaws.{}.{}", ctx.region(), suffix);
    let served: BTreeSet<&str> = endpoints
        .iter()
        .filter(|endpoint| {
            endpoint["serviceName"].as_str() == Some(service_name.as_str())
                && endpoint["state"].as_str().is_some_and(|s| s.eq_ignore_ascii_case("available"))
        })
        .filter_map(|endpoint| endpoint["vpcId"].as_str())
        .collect();

    inv.vpcs
        .iter()
        .map(|vpc| {
            let id = vpc_id(vpc);
            let configured = served.contains(id.as_str());
            ctx.finding(id, !configured)
                .with_data("service_name", &service_name)
        })
        .collect()
}

fn interface_endpoint_for_ecr_api(inv: &VpcInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(interface_endpoint(inv, ctx, "ecr.api"))
}

fn interface_endpoint_for_docker_registry(inv: &VpcInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(interface_endpoint(inv, ctx, "ecr.dkr"))
}

fn interface_endpoint_for_systems_manager(inv: &VpcInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(interface_endpoint(inv, ctx, "ssm"))
}

fn interface_endpoint_for_systems_manager_contacts(
    inv: &VpcInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(interface_endpoint(inv, ctx, "ssm-contacts"))
}

fn interface_endpoint_for_systems_manager_incidents(
    inv: &VpcInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(interface_endpoint(inv, ctx, "ssm-incidents"))
}
