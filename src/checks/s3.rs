//! S3 check
//!
//! Global. Buckets are listed once; each bucket's settings are read from the
//! region the bucket lives in.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{flag, CheckScope, Fetched, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::aws::xml::list_of;
use crate::cloud::ApiCall;
use crate::types::Finding;

const SERVICE: &str = "s3";

/// `GetPublicAccessBlock` settings that must all be enabled
const PUBLIC_ACCESS_SETTINGS: [&str; 4] = [
    "BlockPublicAcls",
    "IgnorePublicAcls",
    "BlockPublicPolicy",
    "RestrictPublicBuckets",
];

#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub region: String,
    pub public_access_block: Fetched<Value>,
    pub versioning: Fetched<Value>,
}

impl Bucket {
    fn arn(&self) -> String {
        format!("arn:aws:s3:::{}", self.name)
    }

    fn finding(&self, ctx: &PredicateContext<'_>, issue_found: bool) -> Finding {
        ctx.finding(self.arn(), issue_found)
            .with_data("bucket_name", &self.name)
            .with_data("bucket_region", &self.region)
    }
}

/// Region from a `GetBucketLocation` constraint
fn location_region(constraint: &Value) -> String {
    match constraint.as_str() {
        None | Some("") => "us-east-1".to_string(),
        Some("EU") => "eu-west-1".to_string(),
        Some(region) => region.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct S3Inventory {
    pub buckets: Vec<Bucket>,
}

#[async_trait]
impl ServiceInventory for S3Inventory {
    const SERVICE: &'static str = "S3";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let listing = scope
            .call(SERVICE, ApiCall::get("/"))
            .await
            .context("Failed to list buckets")?;

        let mut buckets = Vec::new();
        for entry in list_of(&listing["Buckets"]["Bucket"]) {
            let Some(name) = entry["Name"].as_str() else {
                continue;
            };

            let region = match entry["BucketRegion"].as_str().filter(|r| !r.is_empty()) {
                Some(region) => region.to_string(),
                None => {
                    let location = scope
                        .fetch(
                            SERVICE,
                            scope.region(),
                            ApiCall::get(format!("/{}", name)).param("location", ""),
                            &[],
                        )
                        .await;
                    match location {
                        Fetched::Present(constraint) => location_region(&constraint),
                        _ => scope.region().to_string(),
                    }
                }
            };

            let public_access_block = scope
                .fetch(
                    SERVICE,
                    &region,
                    ApiCall::get(format!("/{}", name)).param("publicAccessBlock", ""),
                    &["NoSuchPublicAccessBlockConfiguration"],
                )
                .await;
            let versioning = scope
                .fetch(
                    SERVICE,
                    &region,
                    ApiCall::get(format!("/{}", name)).param("versioning", ""),
                    &[],
                )
                .await;

            buckets.push(Bucket {
                name: name.to_string(),
                region,
                public_access_block,
                versioning,
            });
        }

        Ok(Self { buckets })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .global(
                "buckets_should_have_block_public_access_settings_enabled",
                buckets_should_have_block_public_access_settings_enabled,
            )
            .global(
                "buckets_should_have_versioning_enabled",
                buckets_should_have_versioning_enabled,
            )
    }
}

fn buckets_should_have_block_public_access_settings_enabled(
    inv: &S3Inventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .buckets
        .iter()
        .filter(|bucket| bucket.public_access_block.is_evaluable())
        .map(|bucket| {
            let disabled: Vec<&str> = match bucket.public_access_block.present() {
                Some(config) => PUBLIC_ACCESS_SETTINGS
                    .iter()
                    .copied()
                    .filter(|setting| !flag(&config[*setting]))
                    .collect(),
                None => PUBLIC_ACCESS_SETTINGS.to_vec(),
            };
            bucket
                .finding(ctx, !disabled.is_empty())
                .with_data("disabled_settings", disabled)
        })
        .collect())
}

fn buckets_should_have_versioning_enabled(inv: &S3Inventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(inv
        .buckets
        .iter()
        .filter_map(|bucket| {
            let versioning = bucket.versioning.present()?;
            let status = versioning["Status"].as_str().unwrap_or("Disabled");
            Some(
                bucket
                    .finding(ctx, status != "Enabled")
                    .with_data("versioning_status", status),
            )
        })
        .collect())
}
