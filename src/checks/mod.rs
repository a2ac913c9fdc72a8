//! Compliance Checks
//!
//! A check covers one cloud service in one region. Each service provides:
//! - an inventory type collected once per run of the check
//! - a `PredicateTable` naming its rules, each tagged global or regional
//!
//! `ServiceCheck` ties the two together: it picks the predicates matching
//! its region scope, collects the inventory only if there is something to
//! evaluate, runs every predicate in isolation and hands the findings to
//! the shipper for its service.
//!
//! ## Scope
//! The `global` region runs only global predicates; every concrete region
//! runs only regional predicates. A service can therefore appear in the
//! task matrix for every region without double-reporting account-level
//! resources.

pub mod cloudtrail;
pub mod ec2;
pub mod ecr;
pub mod guardduty;
pub mod iam;
pub mod registry;
pub mod s3;
pub mod secrets_manager;
pub mod sns;
pub mod vpc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::cloud::aws::xml::list_of;
use crate::cloud::{ApiCall, CloudAccessor, ProviderError, ThrottleGuard};
use crate::config::PolicyThresholds;
use crate::shipper::{DeliveryError, FindingShipper};
use crate::types::{is_global, ExecutionContext, Finding};

/// Region scope a predicate applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Regional,
}

impl Scope {
    pub fn of(region: &str) -> Self {
        if is_global(region) {
            Scope::Global
        } else {
            Scope::Regional
        }
    }
}

// ============================================================================
// Predicates
// ============================================================================

/// A rule over a service inventory
pub type PredicateFn<I> = fn(&I, &PredicateContext<'_>) -> Result<Vec<Finding>>;

pub struct Predicate<I> {
    pub name: &'static str,
    pub scope: Scope,
    eval: PredicateFn<I>,
}

/// Explicit, ordered registration of a service's rules
pub struct PredicateTable<I> {
    predicates: Vec<Predicate<I>>,
}

impl<I> Default for PredicateTable<I> {
    fn default() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }
}

impl<I> PredicateTable<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account-level rule
    pub fn global(mut self, name: &'static str, eval: PredicateFn<I>) -> Self {
        self.predicates.push(Predicate {
            name,
            scope: Scope::Global,
            eval,
        });
        self
    }

    /// Register a per-region rule
    pub fn regional(mut self, name: &'static str, eval: PredicateFn<I>) -> Self {
        self.predicates.push(Predicate {
            name,
            scope: Scope::Regional,
            eval,
        });
        self
    }

    /// Predicates applicable to a scope, in registration order
    pub fn for_scope(&self, scope: Scope) -> Vec<&Predicate<I>> {
        self.predicates.iter().filter(|p| p.scope == scope).collect()
    }

    pub fn names(&self, scope: Scope) -> Vec<&'static str> {
        self.for_scope(scope).iter().map(|p| p.name).collect()
    }
}

/// What a predicate sees besides the inventory
pub struct PredicateContext<'a> {
    context: &'a ExecutionContext,
    service: &'a str,
    region: &'a str,
    check_name: &'a str,
}

impl<'a> PredicateContext<'a> {
    pub fn new(
        context: &'a ExecutionContext,
        service: &'a str,
        region: &'a str,
        check_name: &'a str,
    ) -> Self {
        Self {
            context,
            service,
            region,
            check_name,
        }
    }

    /// Start a finding for `resource` with every run-level field filled in
    pub fn finding(&self, resource: impl Into<String>, issue_found: bool) -> Finding {
        Finding {
            execution_id: self.context.execution_id.clone(),
            account_id: self.context.account_id.clone(),
            service: self.service.to_string(),
            check_name: self.check_name.to_string(),
            resource_id: resource.into(),
            region: self.region.to_string(),
            issue_found,
            additional_data: Default::default(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.context.account_id
    }

    pub fn region(&self) -> &str {
        self.region
    }

    pub fn thresholds(&self) -> &PolicyThresholds {
        &self.context.thresholds
    }

    /// Reference instant for age rules
    pub fn now(&self) -> DateTime<Utc> {
        self.context.started_at
    }

    /// Whole days elapsed since `instant`
    pub fn days_since(&self, instant: DateTime<Utc>) -> i64 {
        (self.now() - instant).num_days()
    }
}

/// Run `predicates` against `inventory`; a failing predicate is logged and skipped
pub fn evaluate<I>(
    predicates: &[&Predicate<I>],
    inventory: &I,
    context: &ExecutionContext,
    service: &str,
    region: &str,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    for predicate in predicates {
        let ctx = PredicateContext::new(context, service, region, predicate.name);
        match (predicate.eval)(inventory, &ctx) {
            Ok(mut produced) => {
                debug!(
                    service = %service,
                    region = %region,
                    predicate = predicate.name,
                    count = produced.len(),
                    "Predicate evaluated"
                );
                findings.append(&mut produced);
            }
            Err(e) => {
                error!(
                    service = %service,
                    region = %region,
                    predicate = predicate.name,
                    error = %format!("{:#}", e),
                    "Predicate failed"
                );
            }
        }
    }

    findings
}

// ============================================================================
// Inventory collection
// ============================================================================

/// Result of a per-resource lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Present(T),
    /// The provider reported the setting is not configured
    Absent,
    /// The lookup failed; the resource is not evaluable for rules needing it
    Unavailable(String),
}

impl<T> Fetched<T> {
    pub fn present(&self) -> Option<&T> {
        match self {
            Fetched::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_evaluable(&self) -> bool {
        !matches!(self, Fetched::Unavailable(_))
    }

    /// Secondary listing; a failure only makes the rules reading it non-evaluable
    pub fn from_result(result: Result<T, ProviderError>) -> Self {
        match result {
            Ok(value) => Fetched::Present(value),
            Err(e) => {
                debug!(error = %e, "Listing unavailable");
                Fetched::Unavailable(e.to_string())
            }
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Fetched<U> {
        match self {
            Fetched::Present(value) => Fetched::Present(f(value)),
            Fetched::Absent => Fetched::Absent,
            Fetched::Unavailable(reason) => Fetched::Unavailable(reason),
        }
    }
}

/// A service's inventory and rules
#[async_trait]
pub trait ServiceInventory: Sized + Send + Sync + 'static {
    /// Service label, also the shipper subsystem
    const SERVICE: &'static str;

    /// Read everything the predicates need for one region scope
    async fn collect(scope: &CheckScope) -> Result<Self>;

    /// Rules of this service
    fn predicates() -> PredicateTable<Self>;
}

/// Provider access for one check run, every call guarded against throttling
pub struct CheckScope {
    context: Arc<ExecutionContext>,
    accessor: Arc<dyn CloudAccessor>,
    region: String,
    guard: ThrottleGuard,
}

impl CheckScope {
    pub fn new(
        context: Arc<ExecutionContext>,
        accessor: Arc<dyn CloudAccessor>,
        region: &str,
        guard: ThrottleGuard,
    ) -> Self {
        Self {
            context,
            accessor,
            region: region.to_string(),
            guard,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Call `service` in this scope's region
    pub async fn call(&self, service: &str, call: ApiCall) -> Result<Value, ProviderError> {
        self.call_in(service, &self.region, call).await
    }

    /// Call `service` in an explicit region (e.g. a trail's home region)
    pub async fn call_in(
        &self,
        service: &str,
        region: &str,
        call: ApiCall,
    ) -> Result<Value, ProviderError> {
        let client = self.accessor.client(service, region)?;
        let operation = call.operation();
        self.guard.call(&operation, || client.send(&call)).await
    }

    /// Per-resource lookup where some error codes mean "not configured"
    pub async fn fetch(
        &self,
        service: &str,
        region: &str,
        call: ApiCall,
        absent_codes: &[&str],
    ) -> Fetched<Value> {
        let operation = call.operation();
        match self.call_in(service, region, call).await {
            Ok(value) => Fetched::Present(value),
            Err(e) if absent_codes.iter().any(|code| e.is_code(code)) => Fetched::Absent,
            Err(e) => {
                debug!(service = %service, region = %region, operation = %operation, error = %e, "Lookup unavailable");
                Fetched::Unavailable(e.to_string())
            }
        }
    }

    /// Follow a json-1.1 pagination token until exhausted
    pub async fn paginate_json(
        &self,
        service: &str,
        action: &str,
        items_key: &str,
        token_key: &str,
    ) -> Result<Vec<Value>, ProviderError> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut body = json!({});
            if let Some(token) = &token {
                body[token_key] = Value::String(token.clone());
            }
            let mut page = self.call(service, ApiCall::json(action, body)).await?;

            if let Value::Array(batch) = page[items_key].take() {
                items.extend(batch);
            }
            token = page[token_key]
                .as_str()
                .filter(|t| !t.is_empty())
                .map(String::from);
            if token.is_none() {
                return Ok(items);
            }
        }
    }

    /// Follow a query-protocol `NextToken` listing until exhausted.
    ///
    /// EC2 returns the token as `nextToken`, other query services as `NextToken`.
    pub async fn paginate_next_token(
        &self,
        service: &str,
        call: ApiCall,
        items_key: &str,
    ) -> Result<Vec<Value>, ProviderError> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut page_call = call.clone();
            if let Some(token) = &token {
                page_call = page_call.param("NextToken", token.clone());
            }
            let page = self.call(service, page_call).await?;

            items.extend(list_of(&page[items_key]).into_iter().cloned());

            token = page["NextToken"]
                .as_str()
                .or_else(|| page["nextToken"].as_str())
                .filter(|t| !t.is_empty())
                .map(String::from);
            if token.is_none() {
                return Ok(items);
            }
        }
    }

    /// Follow a query-protocol `Marker` / `IsTruncated` listing until exhausted
    pub async fn paginate_query(
        &self,
        service: &str,
        call: ApiCall,
        items_key: &str,
    ) -> Result<Vec<Value>, ProviderError> {
        let mut items = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut page_call = call.clone();
            if let Some(marker) = &marker {
                page_call = page_call.param("Marker", marker.clone());
            }
            let page = self.call(service, page_call).await?;

            items.extend(list_of(&page[items_key]).into_iter().cloned());

            let truncated = page["IsTruncated"].as_str() == Some("true")
                || page["IsTruncated"].as_bool() == Some(true);
            marker = page["Marker"].as_str().map(String::from);
            if !truncated || marker.is_none() {
                return Ok(items);
            }
        }
    }
}

// ============================================================================
// Check
// ============================================================================

/// Everything a check needs for one (service, region) task
#[derive(Clone)]
pub struct CheckParams {
    pub context: Arc<ExecutionContext>,
    pub accessor: Arc<dyn CloudAccessor>,
    pub region: String,
    pub shipper: Arc<dyn FindingShipper>,
    pub guard: ThrottleGuard,
}

/// How a check run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No predicates for this region scope
    Skipped,
    /// Predicates ran but produced nothing
    NoFindings,
    Shipped { findings: usize, batches: usize },
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("inventory collection failed: {0:#}")]
    Inventory(anyhow::Error),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// One unit of work in the scan matrix
#[async_trait]
pub trait Check: Send + Sync {
    /// Service label
    fn service(&self) -> &str;

    fn region(&self) -> &str;

    /// Collect, evaluate and ship
    async fn run(&self) -> Result<CheckOutcome, CheckError>;
}

/// Generic check over a `ServiceInventory`
pub struct ServiceCheck<I: ServiceInventory> {
    scope: CheckScope,
    shipper: Arc<dyn FindingShipper>,
    predicates: PredicateTable<I>,
}

impl<I: ServiceInventory> ServiceCheck<I> {
    pub fn new(params: CheckParams) -> Self {
        Self {
            scope: CheckScope::new(params.context, params.accessor, &params.region, params.guard),
            shipper: params.shipper,
            predicates: I::predicates(),
        }
    }
}

#[async_trait]
impl<I: ServiceInventory> Check for ServiceCheck<I> {
    fn service(&self) -> &str {
        I::SERVICE
    }

    fn region(&self) -> &str {
        self.scope.region()
    }

    async fn run(&self) -> Result<CheckOutcome, CheckError> {
        let region = self.scope.region();
        let predicates = self.predicates.for_scope(Scope::of(region));

        if predicates.is_empty() {
            debug!(service = I::SERVICE, region = %region, "No predicates for region scope");
            return Ok(CheckOutcome::Skipped);
        }

        let started = Instant::now();
        let inventory = I::collect(&self.scope)
            .await
            .map_err(CheckError::Inventory)?;

        let findings = evaluate(
            &predicates,
            &inventory,
            self.scope.context(),
            I::SERVICE,
            region,
        );

        if findings.is_empty() {
            info!(service = I::SERVICE, region = %region, "No findings");
            return Ok(CheckOutcome::NoFindings);
        }

        info!(
            service = I::SERVICE,
            region = %region,
            count = findings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sending findings"
        );
        let batches = self.shipper.send_bulk(&findings).await?;

        Ok(CheckOutcome::Shipped {
            findings: findings.len(),
            batches,
        })
    }
}

// ============================================================================
// Helpers shared by service checks
// ============================================================================

/// Timestamp from an ISO-8601 string or epoch seconds
pub(crate) fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs.trunc() as i64, 0).single()
        }
        _ => None,
    }
}

/// Provider booleans arrive as JSON booleans or as "true"/"false" strings
pub(crate) fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Whether a tag collection (list or map) has at least one entry
pub(crate) fn has_tags(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}
