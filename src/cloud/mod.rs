//! Cloud Accessor
//!
//! Provider-neutral abstraction over cloud APIs:
//! - `CloudAccessor` hands out per-(service, region) clients and resolves
//!   the region list and account identity
//! - `ServiceClient` sends one `ApiCall` and returns the decoded response
//! - `ProviderError` carries the service error code used for throttling
//!   classification by the `ThrottleGuard`

pub mod aws;
pub mod throttle;

use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use throttle::ThrottleGuard;

/// Supported cloud providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[default]
    Aws,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "aws"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Throttling sub-classes with distinct backoff ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleKind {
    /// Generic API limit (`LimitExceededException` and friends)
    LimitExceeded,
    /// Request-rate limit (`RequestLimitExceeded` and friends)
    RequestRate,
}

impl ThrottleKind {
    /// Classify a provider error code
    pub fn classify(code: &str) -> Option<Self> {
        match code {
            "LimitExceededException"
            | "Throttling"
            | "ThrottlingException"
            | "TooManyRequestsException" => Some(ThrottleKind::LimitExceeded),
            "RequestLimitExceeded" | "SlowDown" | "RequestThrottledException" => {
                Some(ThrottleKind::RequestRate)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ThrottleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleKind::LimitExceeded => write!(f, "limit_exceeded"),
            ThrottleKind::RequestRate => write!(f, "request_rate"),
        }
    }
}

/// Errors returned by cloud API calls
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{code} (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("missing credentials: {0}")]
    Credentials(String),

    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    #[error("throttled {attempts} times, giving up: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Service error code, if the provider returned one
    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code),
            ProviderError::RetryExhausted { last, .. } => last.code(),
            _ => None,
        }
    }

    /// Whether the error carries the given service error code
    pub fn is_code(&self, expected: &str) -> bool {
        self.code() == Some(expected)
    }

    /// Throttling sub-class; `None` means the error is fatal for the call
    pub fn throttle_kind(&self) -> Option<ThrottleKind> {
        match self {
            ProviderError::Api { code, .. } => ThrottleKind::classify(code),
            _ => None,
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

/// One provider API request, independent of the wire protocol details
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    /// JSON-RPC style call (`X-Amz-Target`)
    Json { action: String, body: Value },
    /// Form-encoded query call
    Query {
        action: String,
        params: Vec<(String, String)>,
    },
    /// Resource-oriented REST call
    Rest {
        method: Method,
        path: String,
        query: Vec<(String, String)>,
        body: Option<Value>,
    },
}

impl ApiCall {
    pub fn json(action: &str, body: Value) -> Self {
        ApiCall::Json {
            action: action.to_string(),
            body,
        }
    }

    pub fn query(action: &str) -> Self {
        ApiCall::Query {
            action: action.to_string(),
            params: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        ApiCall::Rest {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Add a form parameter (query calls) or query-string pair (REST calls)
    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        match &mut self {
            ApiCall::Query { params, .. } => params.push((key.to_string(), value.into())),
            ApiCall::Rest { query, .. } => query.push((key.to_string(), value.into())),
            ApiCall::Json { body, .. } => {
                if let Value::Object(map) = body {
                    map.insert(key.to_string(), Value::String(value.into()));
                }
            }
        }
        self
    }

    /// Short operation label for logs and lookups
    pub fn operation(&self) -> String {
        match self {
            ApiCall::Json { action, .. } | ApiCall::Query { action, .. } => action.clone(),
            ApiCall::Rest {
                method, path, query, ..
            } => {
                if query.is_empty() {
                    format!("{} {}", method, path)
                } else {
                    let keys: Vec<&str> = query.iter().map(|(k, _)| k.as_str()).collect();
                    format!("{} {}?{}", method, path, keys.join("&"))
                }
            }
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A client bound to one service in one region
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Service identifier (e.g. `iam`, `guardduty`)
    fn service(&self) -> &str;

    /// Region the client talks to
    fn region(&self) -> &str;

    /// Send one call and return the decoded response body
    async fn send(&self, call: &ApiCall) -> Result<Value, ProviderError>;
}

/// Entry point to one provider's APIs
#[async_trait]
pub trait CloudAccessor: Send + Sync {
    /// Provider served by this accessor
    fn provider(&self) -> CloudProvider;

    /// Client for `service` in `region`; `global` maps to the provider's default region
    fn client(&self, service: &str, region: &str) -> Result<Arc<dyn ServiceClient>, ProviderError>;

    /// Regions enabled for the account
    async fn discover_regions(&self) -> Result<Vec<String>, ProviderError>;

    /// Account identity of the configured credentials
    async fn account_id(&self) -> Result<String, ProviderError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory accessor answering calls from a closure

    use super::*;
    use std::sync::Mutex;

    pub(crate) type Responder =
        dyn Fn(&str, &str, &ApiCall) -> Result<Value, ProviderError> + Send + Sync;

    /// Recorded (service, region, operation)
    pub(crate) type CallLog = Arc<Mutex<Vec<(String, String, String)>>>;

    pub(crate) fn api_error(status: u16, code: &str) -> ProviderError {
        ProviderError::Api {
            status,
            code: code.to_string(),
            message: format!("{} raised by test", code),
        }
    }

    #[derive(Clone)]
    pub(crate) struct StaticAccessor {
        responder: Arc<Responder>,
        regions: Vec<String>,
        account: String,
        pub calls: CallLog,
    }

    impl StaticAccessor {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&str, &str, &ApiCall) -> Result<Value, ProviderError> + Send + Sync + 'static,
        {
            Self {
                responder: Arc::new(responder),
                regions: vec!["us-east-1".to_string()],
                account: "123456789012".to_string(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn with_regions(mut self, regions: &[&str]) -> Self {
            self.regions = regions.iter().map(|r| r.to_string()).collect();
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    struct StaticClient {
        service: String,
        region: String,
        responder: Arc<Responder>,
        calls: CallLog,
    }

    #[async_trait]
    impl ServiceClient for StaticClient {
        fn service(&self) -> &str {
            &self.service
        }

        fn region(&self) -> &str {
            &self.region
        }

        async fn send(&self, call: &ApiCall) -> Result<Value, ProviderError> {
            self.calls.lock().unwrap().push((
                self.service.clone(),
                self.region.clone(),
                call.operation(),
            ));
            (self.responder)(&self.service, &self.region, call)
        }
    }

    #[async_trait]
    impl CloudAccessor for StaticAccessor {
        fn provider(&self) -> CloudProvider {
            CloudProvider::Aws
        }

        fn client(
            &self,
            service: &str,
            region: &str,
        ) -> Result<Arc<dyn ServiceClient>, ProviderError> {
            Ok(Arc::new(StaticClient {
                service: service.to_string(),
                region: region.to_string(),
                responder: self.responder.clone(),
                calls: self.calls.clone(),
            }))
        }

        async fn discover_regions(&self) -> Result<Vec<String>, ProviderError> {
            self.calls.lock().unwrap().push((
                "ec2".to_string(),
                "us-east-1".to_string(),
                "DescribeRegions".to_string(),
            ));
            Ok(self.regions.clone())
        }

        async fn account_id(&self) -> Result<String, ProviderError> {
            Ok(self.account.clone())
        }
    }
}
