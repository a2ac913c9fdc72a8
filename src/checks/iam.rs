//! IAM check
//!
//! Global. Account password policy, root access keys and per-user credential
//! hygiene (console MFA, key rotation, unused credentials).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{flag, timestamp, CheckScope, Fetched, PredicateContext, PredicateTable, ServiceInventory};
use crate::cloud::aws::xml::list_of;
use crate::cloud::ApiCall;
use crate::config::PolicyThresholds;
use crate::types::Finding;

const SERVICE: &str = "iam";

/// Numeric field that may arrive as a string (query protocol) or a number
fn count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct AccessKey {
    /// ListAccessKeys entry
    pub details: Value,
    /// `AccessKeyLastUsed` from GetAccessKeyLastUsed
    pub last_used: Fetched<Value>,
}

impl AccessKey {
    fn id(&self) -> &str {
        self.details["AccessKeyId"].as_str().unwrap_or_default()
    }

    fn is_active(&self) -> bool {
        self.details["Status"].as_str() == Some("Active")
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        timestamp(&self.details["CreateDate"])
    }

    /// Last use, or creation for a key never used. `None` when unknown.
    fn last_activity(&self) -> Option<DateTime<Utc>> {
        let last_used = self.last_used.present()?;
        timestamp(&last_used["LastUsedDate"]).or_else(|| self.created())
    }
}

#[derive(Debug, Clone)]
pub struct User {
    /// ListUsers entry
    pub details: Value,
    /// Present when the user has a console password
    pub login_profile: Fetched<Value>,
    pub mfa_devices: Fetched<Vec<Value>>,
    pub access_keys: Fetched<Vec<AccessKey>>,
}

impl User {
    fn name(&self) -> &str {
        self.details["UserName"].as_str().unwrap_or_default()
    }

    fn arn(&self) -> String {
        self.details["Arn"]
            .as_str()
            .unwrap_or_else(|| self.name())
            .to_string()
    }

    fn finding(&self, ctx: &PredicateContext<'_>, issue_found: bool) -> Finding {
        ctx.finding(self.arn(), issue_found)
            .with_data("user_name", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct IamInventory {
    /// `PasswordPolicy` of the account
    pub password_policy: Fetched<Value>,
    /// GetAccountSummary `SummaryMap`
    pub summary: Fetched<Value>,
    pub users: Vec<User>,
}

impl IamInventory {
    fn summary_value(&self, key: &str) -> Option<u64> {
        let summary = self.summary.present()?;
        list_of(&summary["entry"])
            .into_iter()
            .find(|entry| entry["key"].as_str() == Some(key))
            .and_then(|entry| count(&entry["value"]))
    }
}

#[async_trait]
impl ServiceInventory for IamInventory {
    const SERVICE: &'static str = "IAM";

    async fn collect(scope: &CheckScope) -> Result<Self> {
        let region = scope.region();

        let password_policy = scope
            .fetch(SERVICE, region, ApiCall::query("GetAccountPasswordPolicy"), &["NoSuchEntity"])
            .await
            .map(|mut response| response["PasswordPolicy"].take());
        let summary = scope
            .fetch(SERVICE, region, ApiCall::query("GetAccountSummary"), &[])
            .await
            .map(|mut response| response["SummaryMap"].take());

        let listed = scope
            .paginate_query(SERVICE, ApiCall::query("ListUsers"), "Users")
            .await
            .context("Failed to list IAM users")?;

        let mut users = Vec::with_capacity(listed.len());
        for details in listed {
            let name = details["UserName"].as_str().unwrap_or_default().to_string();

            let login_profile = scope
                .fetch(
                    SERVICE,
                    region,
                    ApiCall::query("GetLoginProfile").param("UserName", name.clone()),
                    &["NoSuchEntity"],
                )
                .await
                .map(|mut response| response["LoginProfile"].take());
            let mfa_devices: Fetched<Vec<Value>> = scope
                .fetch(
                    SERVICE,
                    region,
                    ApiCall::query("ListMFADevices").param("UserName", name.clone()),
                    &[],
                )
                .await
                .map(|response| list_of(&response["MFADevices"]).into_iter().cloned().collect());

            let access_keys = match scope
                .fetch(
                    SERVICE,
                    region,
                    ApiCall::query("ListAccessKeys").param("UserName", name.clone()),
                    &[],
                )
                .await
            {
                Fetched::Present(response) => {
                    let mut keys = Vec::new();
                    for key in list_of(&response["AccessKeyMetadata"]) {
                        let key_id = key["AccessKeyId"].as_str().unwrap_or_default().to_string();
                        let last_used = scope
                            .fetch(
                                SERVICE,
                                region,
                                ApiCall::query("GetAccessKeyLastUsed").param("AccessKeyId", key_id),
                                &[],
                            )
                            .await
                            .map(|mut response| response["AccessKeyLastUsed"].take());
                        keys.push(AccessKey {
                            details: key.clone(),
                            last_used,
                        });
                    }
                    Fetched::Present(keys)
                }
                Fetched::Absent => Fetched::Present(Vec::new()),
                Fetched::Unavailable(reason) => Fetched::Unavailable(reason),
            };

            users.push(User {
                details,
                login_profile,
                mfa_devices,
                access_keys,
            });
        }

        Ok(Self {
            password_policy,
            summary,
            users,
        })
    }

    fn predicates() -> PredicateTable<Self> {
        PredicateTable::new()
            .global(
                "iam_password_policy_requires_at_least_one_uppercase_letter",
                requires_uppercase,
            )
            .global(
                "iam_password_policy_requires_at_least_one_lowercase_letter",
                requires_lowercase,
            )
            .global("iam_password_policy_requires_symbols", requires_symbols)
            .global("iam_password_policy_requires_numbers", requires_numbers)
            .global(
                "iam_password_policy_requires_minimum_password_length",
                requires_minimum_length,
            )
            .global(
                "iam_password_policy_expires_passwords_within_window",
                expires_passwords,
            )
            .global("iam_password_policy_prevents_password_reuse", prevents_reuse)
            .global(
                "root_user_access_key_should_not_exist",
                root_user_access_key_should_not_exist,
            )
            .global(
                "mfa_should_be_enabled_for_all_iam_users",
                mfa_should_be_enabled_for_all_iam_users,
            )
            .global(
                "mfa_should_be_enabled_for_users_with_console_access",
                mfa_should_be_enabled_for_users_with_console_access,
            )
            .global(
                "access_keys_should_be_rotated_within_window",
                access_keys_should_be_rotated_within_window,
            )
            .global(
                "user_credentials_unused_within_window_should_be_removed",
                user_credentials_unused_within_window_should_be_removed,
            )
    }
}

// ============================================================================
// Password policy
// ============================================================================

/// One account-level finding per rule; a missing policy fails every rule
fn password_policy_rule(
    inv: &IamInventory,
    ctx: &PredicateContext<'_>,
    compliant: impl Fn(&Value, &PolicyThresholds) -> bool,
) -> Vec<Finding> {
    match &inv.password_policy {
        Fetched::Present(policy) => vec![ctx
            .finding(ctx.account_id(), !compliant(policy, ctx.thresholds()))
            .with_data("password_policy", policy)],
        Fetched::Absent => vec![ctx
            .finding(ctx.account_id(), true)
            .with_data("password_policy", "not configured")],
        Fetched::Unavailable(_) => Vec::new(),
    }
}

fn requires_uppercase(inv: &IamInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(password_policy_rule(inv, ctx, |policy, _| {
        flag(&policy["RequireUppercaseCharacters"])
    }))
}

fn requires_lowercase(inv: &IamInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(password_policy_rule(inv, ctx, |policy, _| {
        flag(&policy["RequireLowercaseCharacters"])
    }))
}

fn requires_symbols(inv: &IamInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(password_policy_rule(inv, ctx, |policy, _| flag(&policy["RequireSymbols"])))
}

fn requires_numbers(inv: &IamInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(password_policy_rule(inv, ctx, |policy, _| flag(&policy["RequireNumbers"])))
}

fn requires_minimum_length(inv: &IamInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(password_policy_rule(inv, ctx, |policy, thresholds| {
        count(&policy["MinimumPasswordLength"]).unwrap_or(0) >= thresholds.min_password_length
    }))
}

fn expires_passwords(inv: &IamInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(password_policy_rule(inv, ctx, |policy, thresholds| {
        flag(&policy["ExpirePasswords"])
            && count(&policy["MaxPasswordAge"]).is_some_and(|age| age <= thresholds.max_password_age_days)
    }))
}

fn prevents_reuse(inv: &IamInventory, ctx: &PredicateContext<'_>) -> Result<Vec<Finding>> {
    Ok(password_policy_rule(inv, ctx, |policy, thresholds| {
        count(&policy["PasswordReusePrevention"]).unwrap_or(0) >= thresholds.password_reuse_prevention
    }))
}

// ============================================================================
// Root and users
// ============================================================================

fn root_user_access_key_should_not_exist(
    inv: &IamInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    if !inv.summary.is_evaluable() {
        return Ok(Vec::new());
    }
    let present = inv.summary_value("AccountAccessKeysPresent").unwrap_or(0);
    let root = format!("arn:aws:iam::{}:root", ctx.account_id());

    Ok(vec![ctx
        .finding(root, present > 0)
        .with_data("account_access_keys_present", present)])
}

fn mfa_should_be_enabled_for_all_iam_users(
    inv: &IamInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .users
        .iter()
        .filter_map(|user| {
            let devices = user.mfa_devices.present()?;
            Some(
                user.finding(ctx, devices.is_empty())
                    .with_data("mfa_devices", devices.len()),
            )
        })
        .collect())
}

/// Users without a console password are compliant
fn mfa_should_be_enabled_for_users_with_console_access(
    inv: &IamInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    Ok(inv
        .users
        .iter()
        .filter_map(|user| match &user.login_profile {
            Fetched::Present(_) => {
                let devices = user.mfa_devices.present()?;
                Some(
                    user.finding(ctx, devices.is_empty())
                        .with_data("console_access", true)
                        .with_data("mfa_devices", devices.len()),
                )
            }
            Fetched::Absent => Some(user.finding(ctx, false).with_data("console_access", false)),
            Fetched::Unavailable(_) => None,
        })
        .collect())
}

fn access_keys_should_be_rotated_within_window(
    inv: &IamInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let window = ctx.thresholds().key_rotation_days;
    let mut findings = Vec::new();

    for user in &inv.users {
        let Some(keys) = user.access_keys.present() else {
            continue;
        };
        for key in keys.iter().filter(|key| key.is_active()) {
            let Some(created) = key.created() else {
                continue;
            };
            let age = ctx.days_since(created);
            findings.push(
                user.finding(ctx, age > window)
                    .with_data("access_key_id", key.id())
                    .with_data("key_age_days", age)
                    .with_data("rotation_days_threshold", window),
            );
        }
    }

    Ok(findings)
}

/// A console password or active key idle for longer than the window is stale.
/// Never-used credentials age from their creation date.
fn user_credentials_unused_within_window_should_be_removed(
    inv: &IamInventory,
    ctx: &PredicateContext<'_>,
) -> Result<Vec<Finding>> {
    let window = ctx.thresholds().unused_credential_days;
    let mut findings = Vec::new();

    for user in &inv.users {
        let (Some(keys), true) = (user.access_keys.present(), user.login_profile.is_evaluable()) else {
            continue;
        };

        let mut stale = Vec::new();
        if let Fetched::Present(profile) = &user.login_profile {
            let last_login = timestamp(&user.details["PasswordLastUsed"])
                .or_else(|| timestamp(&profile["CreateDate"]));
            if last_login.is_some_and(|at| ctx.days_since(at) > window) {
                stale.push(json!({"credential": "password", "last_activity": last_login.map(|t| t.to_rfc3339())}));
            }
        }
        for key in keys.iter().filter(|key| key.is_active()) {
            let last_activity = key.last_activity();
            if last_activity.is_some_and(|at| ctx.days_since(at) > window) {
                stale.push(json!({"credential": key.id(), "last_activity": last_activity.map(|t| t.to_rfc3339())}));
            }
        }

        findings.push(
            user.finding(ctx, !stale.is_empty())
                .with_data("stale_credentials", stale)
                .with_data("unused_days_threshold", window),
        );
    }

    Ok(findings)
}
