//! Check Registry
//!
//! Explicit table of the checks available for a provider, keyed by
//! lowercase name, and resolution of a user allow-list against it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use super::cloudtrail::CloudTrailInventory;
use super::ec2::Ec2Inventory;
use super::ecr::EcrInventory;
use super::guardduty::GuardDutyInventory;
use super::iam::IamInventory;
use super::s3::S3Inventory;
use super::secrets_manager::SecretsManagerInventory;
use super::sns::SnsInventory;
use super::vpc::VpcInventory;
use super::{Check, CheckParams, ServiceCheck, ServiceInventory};
use crate::cloud::CloudProvider;

/// Builds a check for one region
pub type CheckFactory = fn(CheckParams) -> Box<dyn Check>;

/// A registered check
#[derive(Clone, Copy)]
pub struct CheckDescriptor {
    /// Lowercase registry key
    pub name: &'static str,
    /// Service label and shipper subsystem
    pub service: &'static str,
    pub factory: CheckFactory,
}

impl fmt::Debug for CheckDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckDescriptor")
            .field("name", &self.name)
            .field("service", &self.service)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown check(s): {}. Available checks: {}", .unknown.join(", "), .available.join(", "))]
    UnknownCheck {
        unknown: Vec<String>,
        available: Vec<String>,
    },
}

fn build<I: ServiceInventory>(params: CheckParams) -> Box<dyn Check> {
    Box::new(ServiceCheck::<I>::new(params))
}

/// Name to factory table for one provider
#[derive(Debug, Clone)]
pub struct CheckRegistry {
    provider: CloudProvider,
    checks: BTreeMap<&'static str, CheckDescriptor>,
}

impl CheckRegistry {
    /// Empty registry
    pub fn new(provider: CloudProvider) -> Self {
        Self {
            provider,
            checks: BTreeMap::new(),
        }
    }

    /// Every check implemented for `provider`
    pub fn for_provider(provider: CloudProvider) -> Self {
        match provider {
            CloudProvider::Aws => Self::new(provider)
                .with::<CloudTrailInventory>("cloudtrail")
                .with::<Ec2Inventory>("ec2")
                .with::<EcrInventory>("ecr")
                .with::<GuardDutyInventory>("guardduty")
                .with::<IamInventory>("iam")
                .with::<S3Inventory>("s3")
                .with::<SecretsManagerInventory>("secret_manager")
                .with::<SnsInventory>("sns")
                .with::<VpcInventory>("vpc"),
        }
    }

    /// Register a service inventory under `name`
    pub fn with<I: ServiceInventory>(self, name: &'static str) -> Self {
        self.with_factory(name, I::SERVICE, build::<I>)
    }

    /// Register a prebuilt factory under `name`
    pub fn with_factory(mut self, name: &'static str, service: &'static str, factory: CheckFactory) -> Self {
        self.checks.insert(
            name,
            CheckDescriptor {
                name,
                service,
                factory,
            },
        );
        self
    }

    pub fn provider(&self) -> CloudProvider {
        self.provider
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> Option<&CheckDescriptor> {
        self.checks.get(name)
    }

    /// Checks selected by an allow-list; no list (or an empty one) selects everything.
    ///
    /// Names are matched case-insensitively. Any unknown name fails the whole
    /// resolution, listing the valid names.
    pub fn resolve(
        &self,
        allow_list: Option<&[String]>,
    ) -> Result<BTreeMap<String, CheckDescriptor>, RegistryError> {
        let requested: Vec<String> = allow_list
            .unwrap_or_default()
            .iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        if requested.is_empty() {
            return Ok(self
                .checks
                .iter()
                .map(|(name, descriptor)| (name.to_string(), *descriptor))
                .collect());
        }

        let unknown: BTreeSet<&String> = requested
            .iter()
            .filter(|name| !self.checks.contains_key(name.as_str()))
            .collect();
        if !unknown.is_empty() {
            return Err(RegistryError::UnknownCheck {
                unknown: unknown.into_iter().cloned().collect(),
                available: self.names().iter().map(|n| n.to_string()).collect(),
            });
        }

        Ok(requested
            .into_iter()
            .filter_map(|name| {
                let descriptor = *self.checks.get(name.as_str())?;
                Some((name, descriptor))
            })
            .collect())
    }
}
