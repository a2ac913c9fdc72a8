//! AWS Cloud Accessor
//!
//! Talks to AWS service APIs directly over reqwest with SigV4 signing.
//! Four wire protocols are covered, enough for the services the checks read:
//! - query (sts, ec2, autoscaling, iam, sns): form-encoded POST, XML response
//! - json-1.1 (secretsmanager, ecr, cloudtrail): `X-Amz-Target` POST
//! - rest-json (guardduty)
//! - rest-xml (s3, path-style addressing)
//!
//! Every response is normalized to `serde_json::Value`. Errors from every
//! protocol are decoded into `ProviderError::Api` with the service error code
//! so the `ThrottleGuard` can classify them.

pub mod sigv4;
pub mod xml;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ApiCall, CloudAccessor, CloudProvider, ProviderError, ServiceClient, ThrottleGuard};
use crate::types::is_global;
use sigv4::{canonical_query, encode_path, SignableRequest};

pub use sigv4::AwsCredentials;

/// Region used for `global` scope and discovery when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Per-request HTTP timeout
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Service metadata
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Query,
    Json,
    RestJson,
    RestXml,
}

#[derive(Debug)]
struct ServiceSpec {
    name: &'static str,
    /// SigV4 service name
    signing_name: &'static str,
    /// Hostname prefix before `.{region}.amazonaws.com`
    endpoint_prefix: &'static str,
    protocol: Protocol,
    api_version: &'static str,
    /// `X-Amz-Target` prefix for json-1.1 services
    target_prefix: &'static str,
    /// Partition-wide endpoint and its signing region
    global_endpoint: Option<(&'static str, &'static str)>,
}

const SERVICES: &[ServiceSpec] = &[
    ServiceSpec {
        name: "sts",
        signing_name: "sts",
        endpoint_prefix: "sts",
        protocol: Protocol::Query,
        api_version: "2011-06-15",
        target_prefix: "",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "ec2",
        signing_name: "ec2",
        endpoint_prefix: "ec2",
        protocol: Protocol::Query,
        api_version: "2016-11-15",
        target_prefix: "",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "autoscaling",
        signing_name: "autoscaling",
        endpoint_prefix: "autoscaling",
        protocol: Protocol::Query,
        api_version: "2011-01-01",
        target_prefix: "",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "sns",
        signing_name: "sns",
        endpoint_prefix: "sns",
        protocol: Protocol::Query,
        api_version: "2010-03-31",
        target_prefix: "",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "iam",
        signing_name: "iam",
        endpoint_prefix: "iam",
        protocol: Protocol::Query,
        api_version: "2010-05-08",
        target_prefix: "",
        global_endpoint: Some(("iam.amazonaws.com", "us-east-1")),
    },
    ServiceSpec {
        name: "s3",
        signing_name: "s3",
        endpoint_prefix: "s3",
        protocol: Protocol::RestXml,
        api_version: "2006-03-01",
        target_prefix: "",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "guardduty",
        signing_name: "guardduty",
        endpoint_prefix: "guardduty",
        protocol: Protocol::RestJson,
        api_version: "2017-11-28",
        target_prefix: "",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "secretsmanager",
        signing_name: "secretsmanager",
        endpoint_prefix: "secretsmanager",
        protocol: Protocol::Json,
        api_version: "2017-10-17",
        target_prefix: "secretsmanager",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "ecr",
        signing_name: "ecr",
        endpoint_prefix: "api.ecr",
        protocol: Protocol::Json,
        api_version: "2015-09-21",
        target_prefix: "AmazonEC2ContainerRegistry_V20150921",
        global_endpoint: None,
    },
    ServiceSpec {
        name: "cloudtrail",
        signing_name: "cloudtrail",
        endpoint_prefix: "cloudtrail",
        protocol: Protocol::Json,
        api_version: "2013-11-01",
        target_prefix: "com.amazonaws.cloudtrail.v20131101.CloudTrail_20131101",
        global_endpoint: None,
    },
];

fn service_spec(name: &str) -> Option<&'static ServiceSpec> {
    SERVICES.iter().find(|spec| spec.name == name)
}

// ============================================================================
// Credentials
// ============================================================================

impl AwsCredentials {
    /// Read static credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let access_key_id = read("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| ProviderError::Credentials("AWS_ACCESS_KEY_ID is not set".into()))?;
        let secret_access_key = read("AWS_SECRET_ACCESS_KEY").ok_or_else(|| {
            ProviderError::Credentials("AWS_SECRET_ACCESS_KEY is not set".into())
        })?;

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: read("AWS_SESSION_TOKEN"),
        })
    }
}

// ============================================================================
// Accessor
// ============================================================================

/// AWS implementation of `CloudAccessor`
pub struct AwsAccessor {
    http: Client,
    credentials: Arc<AwsCredentials>,
    /// Region used for `global` scope and discovery calls
    default_region: String,
    guard: ThrottleGuard,
}

impl AwsAccessor {
    pub fn new(credentials: AwsCredentials, default_region: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            credentials: Arc::new(credentials),
            default_region: default_region.into(),
            guard: ThrottleGuard::default(),
        })
    }

    /// Throttle policy for discovery and identity calls
    pub fn with_throttle_guard(mut self, guard: ThrottleGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    fn service_client(&self, service: &str, region: &str) -> Result<AwsServiceClient, ProviderError> {
        let spec = service_spec(service)
            .ok_or_else(|| ProviderError::UnsupportedService(service.to_string()))?;

        let region = if is_global(region) {
            self.default_region.clone()
        } else {
            region.to_string()
        };

        let (host, signing_region) = match spec.global_endpoint {
            Some((host, signing_region)) => (host.to_string(), signing_region.to_string()),
            None => (
                format!("{}.{}.amazonaws.com", spec.endpoint_prefix, region),
                region.clone(),
            ),
        };

        Ok(AwsServiceClient {
            http: self.http.clone(),
            credentials: self.credentials.clone(),
            spec,
            region,
            host,
            signing_region,
        })
    }
}

#[async_trait]
impl CloudAccessor for AwsAccessor {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Aws
    }

    fn client(&self, service: &str, region: &str) -> Result<Arc<dyn ServiceClient>, ProviderError> {
        Ok(Arc::new(self.service_client(service, region)?))
    }

    async fn discover_regions(&self) -> Result<Vec<String>, ProviderError> {
        let client = self.service_client("ec2", &self.default_region)?;
        let call = ApiCall::query("DescribeRegions");
        let response = self.guard.call("DescribeRegions", || client.send(&call)).await?;

        let regions: Vec<String> = xml::list_of(&response["regionInfo"])
            .iter()
            .filter_map(|region| region["regionName"].as_str())
            .map(String::from)
            .collect();

        if regions.is_empty() {
            return Err(ProviderError::Decode(
                "DescribeRegions returned no regions".to_string(),
            ));
        }
        Ok(regions)
    }

    async fn account_id(&self) -> Result<String, ProviderError> {
        let client = self.service_client("sts", &self.default_region)?;
        let call = ApiCall::query("GetCallerIdentity");
        let response = self.guard.call("GetCallerIdentity", || client.send(&call)).await?;

        response["Account"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::Decode("GetCallerIdentity returned no account".into()))
    }
}

// ============================================================================
// Service client
// ============================================================================

/// Signed client for one AWS service in one region
pub struct AwsServiceClient {
    http: Client,
    credentials: Arc<AwsCredentials>,
    spec: &'static ServiceSpec,
    region: String,
    host: String,
    signing_region: String,
}

/// A fully signed request, ready to send
#[derive(Debug)]
struct PreparedRequest {
    method: Method,
    url: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl AwsServiceClient {
    fn prepare(&self, call: &ApiCall, now: DateTime<Utc>) -> Result<PreparedRequest, ProviderError> {
        let mut signed = BTreeMap::new();
        let mut unsigned = BTreeMap::new();

        let (method, path, query, body) = match (call, self.spec.protocol) {
            (ApiCall::Query { action, params }, Protocol::Query) => {
                let mut form = vec![
                    ("Action".to_string(), action.clone()),
                    ("Version".to_string(), self.spec.api_version.to_string()),
                ];
                form.extend(params.iter().cloned());
                unsigned.insert(
                    "content-type".to_string(),
                    "application/x-www-form-urlencoded; charset=utf-8".to_string(),
                );
                let body = canonical_query(&form).into_bytes();
                (Method::POST, "/".to_string(), Vec::new(), body)
            }
            (ApiCall::Json { action, body }, Protocol::Json) => {
                signed.insert(
                    "x-amz-target".to_string(),
                    format!("{}.{}", self.spec.target_prefix, action),
                );
                unsigned.insert(
                    "content-type".to_string(),
                    "application/x-amz-json-1.1".to_string(),
                );
                let body = serde_json::to_vec(body)
                    .map_err(|e| ProviderError::Decode(format!("unserializable request: {}", e)))?;
                (Method::POST, "/".to_string(), Vec::new(), body)
            }
            (
                ApiCall::Rest {
                    method,
                    path,
                    query,
                    body,
                },
                Protocol::RestJson | Protocol::RestXml,
            ) => {
                let body = match body {
                    Some(body) => {
                        unsigned.insert("content-type".to_string(), "application/json".to_string());
                        serde_json::to_vec(body).map_err(|e| {
                            ProviderError::Decode(format!("unserializable request: {}", e))
                        })?
                    }
                    None => Vec::new(),
                };
                (method.clone(), encode_path(path), query.clone(), body)
            }
            (call, protocol) => {
                return Err(ProviderError::UnsupportedService(format!(
                    "{} does not accept {} over {:?}",
                    self.spec.name,
                    call.operation(),
                    protocol
                )))
            }
        };

        let mut headers = sigv4::sign(
            SignableRequest {
                method: method.as_str(),
                host: &self.host,
                path: &path,
                query: &query,
                payload: &body,
                headers: signed,
            },
            &self.credentials,
            &self.signing_region,
            self.spec.signing_name,
            now,
        );
        headers.extend(unsigned);

        let mut url = format!("https://{}{}", self.host, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(&query));
        }

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
        })
    }
}

#[async_trait]
impl ServiceClient for AwsServiceClient {
    fn service(&self) -> &str {
        self.spec.name
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn send(&self, call: &ApiCall) -> Result<Value, ProviderError> {
        let prepared = self.prepare(call, Utc::now())?;
        debug!(
            service = %self.spec.name,
            region = %self.region,
            operation = %call.operation(),
            "Calling AWS API"
        );

        let mut request = self.http.request(prepared.method, &prepared.url);
        for (name, value) in &prepared.headers {
            // reqwest derives Host from the URL
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }

        let response = request.body(prepared.body).send().await?;
        let status = response.status();
        let error_type = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = response.text().await?;

        if !status.is_success() {
            return Err(parse_error(
                self.spec.protocol,
                status.as_u16(),
                &text,
                error_type.as_deref(),
            ));
        }

        decode_body(self.spec.protocol, call, &text)
    }
}

// ============================================================================
// Response decoding
// ============================================================================

fn decode_body(protocol: Protocol, call: &ApiCall, text: &str) -> Result<Value, ProviderError> {
    if text.trim().is_empty() {
        return Ok(json!({}));
    }

    match protocol {
        Protocol::Json | Protocol::RestJson => serde_json::from_str(text)
            .map_err(|e| ProviderError::Decode(format!("invalid JSON response: {}", e))),
        Protocol::Query => {
            let (_, mut content) = xml::parse(text)?;
            let wrapper = match call {
                ApiCall::Query { action, .. } => format!("{}Result", action),
                _ => String::new(),
            };
            match content.get_mut(&wrapper) {
                Some(result) => Ok(result.take()),
                None => Ok(content),
            }
        }
        Protocol::RestXml => Ok(xml::parse(text)?.1),
    }
}

fn parse_error(protocol: Protocol, status: u16, text: &str, error_type: Option<&str>) -> ProviderError {
    let (code, message) = match protocol {
        Protocol::Json | Protocol::RestJson => json_error(text, error_type),
        Protocol::Query | Protocol::RestXml => xml_error(text),
    };

    let code = code.unwrap_or_else(|| match status {
        429 => "TooManyRequestsException".to_string(),
        503 => "ServiceUnavailable".to_string(),
        _ => format!("HTTP{}", status),
    });

    ProviderError::Api {
        status,
        code,
        message: message.unwrap_or_else(|| text.chars().take(200).collect()),
    }
}

fn json_error(text: &str, error_type: Option<&str>) -> (Option<String>, Option<String>) {
    let body: Value = serde_json::from_str(text).unwrap_or(Value::Null);

    let code = body["__type"]
        .as_str()
        .or_else(|| body["code"].as_str())
        .or_else(|| body["Code"].as_str())
        .or(error_type)
        .map(normalize_error_code);

    let message = body["message"]
        .as_str()
        .or_else(|| body["Message"].as_str())
        .map(String::from);

    (code, message)
}

// `com.amazon.coral.service#ThrottlingException` or `ThrottlingException:http://...`
fn normalize_error_code(raw: &str) -> String {
    let code = raw.rsplit('#').next().unwrap_or(raw);
    code.split(':').next().unwrap_or(code).to_string()
}

fn xml_error(text: &str) -> (Option<String>, Option<String>) {
    let Ok((_, content)) = xml::parse(text) else {
        return (None, None);
    };

    // ErrorResponse/Error, Response/Errors/Error (EC2) or a bare Error root (S3)
    let error = if content.get("Error").is_some() {
        &content["Error"]
    } else if content.get("Errors").is_some() {
        &content["Errors"]["Error"]
    } else {
        &content
    };

    let field = |name: &str| {
        error[name]
            .as_str()
            .filter(|value| !value.is_empty())
            .map(String::from)
    };
    (field("Code"), field("Message"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn accessor() -> AwsAccessor {
        AwsAccessor::new(
            AwsCredentials {
                access_key_id: "AKIDEXAMPLE".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
            "eu-west-1",
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_query_call_targets_global_iam_endpoint() {
        let client = accessor().service_client("iam", "global").unwrap();
        let request = client
            .prepare(&ApiCall::query("ListUsers").param("Marker", "m 1"), now())
            .unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url, "https://iam.amazonaws.com/");
        assert_eq!(
            String::from_utf8(request.body).unwrap(),
            "Action=ListUsers&Marker=m%201&Version=2010-05-08"
        );
        assert!(request.headers["authorization"].contains("/20240501/us-east-1/iam/aws4_request"));
        assert_eq!(
            request.headers["content-type"],
            "application/x-www-form-urlencoded; charset=utf-8"
        );
    }

    #[test]
    fn test_regional_query_services() {
        let accessor = accessor();
        let client = accessor.service_client("autoscaling", "eu-central-1").unwrap();
        let request = client
            .prepare(&ApiCall::query("DescribeAutoScalingGroups"), now())
            .unwrap();
        assert_eq!(request.url, "https://autoscaling.eu-central-1.amazonaws.com/");
        assert_eq!(
            String::from_utf8(request.body).unwrap(),
            "Action=DescribeAutoScalingGroups&Version=2011-01-01"
        );
        assert!(request.headers["authorization"].contains("/eu-central-1/autoscaling/aws4_request"));

        let client = accessor.service_client("sns", "ap-south-1").unwrap();
        let request = client
            .prepare(&ApiCall::query("ListTopics").param("NextToken", "t"), now())
            .unwrap();
        assert_eq!(request.url, "https://sns.ap-south-1.amazonaws.com/");
        assert_eq!(
            String::from_utf8(request.body).unwrap(),
            "Action=ListTopics&NextToken=t&Version=2010-03-31"
        );
    }

    #[test]
    fn test_global_scope_maps_to_default_region() {
        let accessor = accessor();
        let client = accessor.service_client("s3", "global").unwrap();
        assert_eq!(client.region(), "eu-west-1");
        assert_eq!(client.host, "s3.eu-west-1.amazonaws.com");
        assert_eq!(accessor.default_region(), "eu-west-1");
    }

    #[test]
    fn test_json_call_sets_target() {
        let client = accessor().service_client("ecr", "ap-south-1").unwrap();
        let request = client
            .prepare(&ApiCall::json("DescribeRepositories", json!({})), now())
            .unwrap();

        assert_eq!(request.url, "https://api.ecr.ap-south-1.amazonaws.com/");
        assert_eq!(
            request.headers["x-amz-target"],
            "AmazonEC2ContainerRegistry_V20150921.DescribeRepositories"
        );
        assert!(request.headers["authorization"].contains("/ap-south-1/ecr/aws4_request"));
        assert_eq!(request.body, b"{}");
    }

    #[test]
    fn test_rest_call_builds_path_and_query() {
        let client = accessor().service_client("s3", "us-west-2").unwrap();
        let request = client
            .prepare(&ApiCall::get("/my-bucket").param("versioning", ""), now())
            .unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url, "https://s3.us-west-2.amazonaws.com/my-bucket?versioning=");
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_protocol_mismatch_and_unknown_service() {
        let accessor = accessor();
        assert!(matches!(
            accessor.service_client("lambda", "us-east-1"),
            Err(ProviderError::UnsupportedService(_))
        ));

        let client = accessor.service_client("iam", "global").unwrap();
        assert!(client.prepare(&ApiCall::get("/"), now()).is_err());
    }

    #[test]
    fn test_json_error_codes() {
        let err = parse_error(
            Protocol::Json,
            400,
            r#"{"__type":"com.amazonaws.secretsmanager#ThrottlingException","message":"slow down"}"#,
            None,
        );
        assert!(err.is_code("ThrottlingException"));
        assert_eq!(err.to_string(), "ThrottlingException (HTTP 400): slow down");

        let err = parse_error(
            Protocol::RestJson,
            400,
            "",
            Some("BadRequestException:http://internal.amazon.com/"),
        );
        assert!(err.is_code("BadRequestException"));
    }

    #[test]
    fn test_xml_error_codes() {
        let iam = "<ErrorResponse><Error><Type>Sender</Type><Code>NoSuchEntity</Code>\
            <Message>missing</Message></Error></ErrorResponse>";
        assert!(parse_error(Protocol::Query, 404, iam, None).is_code("NoSuchEntity"));

        let ec2 = "<Response><Errors><Error><Code>RequestLimitExceeded</Code>\
            <Message>Request limit exceeded.</Message></Error></Errors></Response>";
        assert!(parse_error(Protocol::Query, 503, ec2, None).is_code("RequestLimitExceeded"));

        let s3 = "<Error><Code>NoSuchPublicAccessBlockConfiguration</Code></Error>";
        assert!(parse_error(Protocol::RestXml, 404, s3, None)
            .is_code("NoSuchPublicAccessBlockConfiguration"));

        assert!(parse_error(Protocol::RestXml, 429, "", None).is_code("TooManyRequestsException"));
        assert!(parse_error(Protocol::RestXml, 500, "oops", None).is_code("HTTP500"));
    }

    #[test]
    fn test_query_result_wrapper_is_removed() {
        let text = "<GetCallerIdentityResponse><GetCallerIdentityResult>\
            <Account>123456789012</Account></GetCallerIdentityResult>\
            <ResponseMetadata><RequestId>r</RequestId></ResponseMetadata>\
            </GetCallerIdentityResponse>";
        let value = decode_body(Protocol::Query, &ApiCall::query("GetCallerIdentity"), text).unwrap();
        assert_eq!(value["Account"], "123456789012");

        // EC2 responses have no Result wrapper
        let text = "<DescribeRegionsResponse><requestId>r</requestId><regionInfo>\
            <item><regionName>eu-west-1</regionName></item>\
            <item><regionName>us-east-1</regionName></item>\
            </regionInfo></DescribeRegionsResponse>";
        let value = decode_body(Protocol::Query, &ApiCall::query("DescribeRegions"), text).unwrap();
        assert_eq!(value["regionInfo"][1]["regionName"], "us-east-1");
    }

    #[test]
    fn test_credentials_from_lookup() {
        let creds = AwsCredentials::from_lookup(|key| match key {
            "AWS_ACCESS_KEY_ID" => Some("AKID".into()),
            "AWS_SECRET_ACCESS_KEY" => Some("secret".into()),
            "AWS_SESSION_TOKEN" => Some("  ".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert!(creds.session_token.is_none());

        let missing = AwsCredentials::from_lookup(|_| None);
        assert!(matches!(missing, Err(ProviderError::Credentials(_))));
    }
}
