//! ECR check
//!
//! Regional. Image scanning, tag immutability, lifecycle policy and KMS
//! encryption rules for every private repository.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{flag, CheckScope, Fetched, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::ApiCall;
use crate::types::Finding;

const SERVICE: &str = "ecr";

#[derive(Debug, Clone)]
pub struct Repository {
    /// DescribeRepositories entry
    pub details: Value,
    /// GetLifecyclePolicy result
    pub lifecycle_policy: Fetched<Value>,
}

impl Repository {
    fn arn(&self) -> String {
        self.details["repositoryArn"]
            .as_str()
            .or_else(|| self.details["repositoryName"].as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn name(&self) -> &str {
        self.details["repositoryName"].as_str().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EcrInventory {
    pub repositories: Vec<Repository>,
}

#[async_trait]
impl ServiceInventory for EcrInventory {
    const SERVICE: &'static str = "ECR";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let listed = scope
            .paginate_json(SERVICE, "DescribeRepositories", "repositories", "nextToken")
            .await
            .context("Failed to describe ECR repositories")?;

        let mut repositories = Vec::with_capacity(listed.len());
        for details in listed {
            let name = details["repositoryName"].as_str().unwrap_or_default().to_string();
            let lifecycle_policy = scope
                .fetch(
                    SERVICE,
                    scope.region(),
                    ApiCall::json("GetLifecyclePolicy", json!({ "repositoryName": name })),
                    &["LifecyclePolicyNotFoundException"],
                )
                .await;
            repositories.push(Repository {
                details,
                lifecycle_policy,
            });
        }

        Ok(Self { repositories })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .regional(
                "private_repositories_should_have_image_scanning_configured",
                private_repositories_should_have_image_scanning_configured,
            )
            .regional(
                "private_repositories_should_have_tag_immutability_configured",
                private_repositories_should_have_tag_immutability_configured,
            )
            .regional(
                "repositories_should_have_at_least_one_lifecycle_policy_configured",
                repositories_should_have_at_least_one_lifecycle_policy_configured,
            )
            .regional(
                "repositories_should_be_encrypted_with_kms",
                repositories_should_be_encrypted_with_kms,
            )
    }
}

fn private_repositories_should_have_image_scanning_configured(
    inv: &EcrInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .repositories
        .iter()
        .map(|repo| {
            let scan_on_push = flag(&repo.details["imageScanningConfiguration"]["scanOnPush"]);
            ctx.finding(repo.arn(), !scan_on_push)
                .with_data("repository_name", repo.name())
                .with_data("scan_on_push", scan_on_push)
        })
        .collect())
}

fn private_repositories_should_have_tag_immutability_configured(
    inv: &EcrInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .repositories
        .iter()
        .map(|repo| {
            let mutability = repo.details["imageTagMutability"].as_str().unwrap_or("MUTABLE");
            ctx.finding(repo.arn(), !mutability.starts_with("IMMUTABLE"))
                .with_data("repository_name", repo.name())
                .with_data("image_tag_mutability", mutability)
        })
        .collect())
}

fn repositories_should_have_at_least_one_lifecycle_policy_configured(
    inv: &EcrInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .repositories
        .iter()
        .filter(|repo| repo.lifecycle_policy.is_evaluable())
        .map(|repo| {
            let configured = repo.lifecycle_policy.present().is_some();
            ctx.finding(repo.arn(), !configured)
                .with_data("repository_name", repo.name())
                .with_data("lifecycle_policy_configured", configured)
        })
        .collect())
}

fn repositories_should_be_encrypted_with_kms(
    inv: &EcrInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .repositories
        .iter()
        .map(|repo| {
            let encryption = repo.details["encryptionConfiguration"]["encryptionType"]
                .as_str()
                .unwrap_or("AES256");
            ctx.finding(repo.arn(), !encryption.starts_with("KMS"))
                .with_data("repository_name", repo.name())
                .with_data("encryption_type", encryption)
        })
        .collect())
}
