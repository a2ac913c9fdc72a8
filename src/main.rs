//! CSPM scanner - standalone binary
//!
//! Runs every selected compliance check across the account's regions and
//! ships the findings to Coralogix. The process exit status identifies the
//! failure class (see `cspm_engine::error::exit_code`).

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cspm_engine::cloud::aws::{AwsAccessor, AwsCredentials, DEFAULT_REGION};
use cspm_engine::cloud::throttle::DEFAULT_MAX_ATTEMPTS;
use cspm_engine::config::DEFAULT_APPLICATION_NAME;
use cspm_engine::error::exit_code;
use cspm_engine::orchestrator::DEFAULT_MAX_WORKERS;
use cspm_engine::shipper::shipper_factory;
use cspm_engine::{
    CheckRegistry, CloudProvider, DeliveryConfig, IngestionRegion, PolicyThresholds, ScanError,
    ScanOrchestrator, ScanRequest, ThrottleGuard,
};

/// Cloud security posture scanner
#[derive(Parser, Debug)]
#[command(name = "cspm", version, about)]
struct Args {
    /// Cloud provider to scan
    #[arg(long, value_enum, default_value_t = CloudProvider::Aws, env = "CSPM_PROVIDER")]
    provider: CloudProvider,

    /// Comma separated regions to scan (discovered when omitted)
    #[arg(long, env = "AWS_REGIONS", value_delimiter = ',')]
    regions: Option<Vec<String>>,

    /// Comma separated checks to run (all when omitted)
    #[arg(long, env = "AWS_SERVICES", value_delimiter = ',')]
    services: Option<Vec<String>>,

    /// Region used for account-wide calls and region discovery
    #[arg(long, env = "AWS_DEFAULT_REGION", default_value = DEFAULT_REGION)]
    default_region: String,

    /// Coralogix region code
    #[arg(long, value_enum, env = "CX_ENDPOINT", default_value_t = IngestionRegion::Eu1)]
    cx_endpoint: IngestionRegion,

    /// Full bulk ingestion URL, overrides --cx-endpoint
    #[arg(long, env = "CX_INGRESS_URL")]
    ingress_url: Option<String>,

    /// Coralogix send-your-data API key
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Application label on every bulk request
    #[arg(long, env = "CX_APPLICATION", default_value = DEFAULT_APPLICATION_NAME)]
    application_name: String,

    /// Dry run - log findings instead of shipping them
    #[arg(long, env = "CSPM_DRY_RUN", default_value = "false")]
    dry_run: bool,

    /// Concurrent check runs
    #[arg(long, env = "CSPM_MAX_WORKERS", default_value_t = DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// Attempts per throttled provider call
    #[arg(long, env = "CSPM_THROTTLE_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    #[command(flatten)]
    thresholds: PolicyThresholds,

    /// Debug logging
    #[arg(long, short)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "CSPM_LOG_JSON")]
    log_json: bool,
}

fn init_logging(args: &Args) {
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Provider registry, rejecting unknown `--services` names before credentials are read
fn select_checks(args: &Args) -> Result<CheckRegistry, ScanError> {
    let registry = CheckRegistry::for_provider(args.provider);
    registry.resolve(args.services.as_deref())?;
    Ok(registry)
}

/// Accessor and delivery wiring for the selected provider
fn build_orchestrator(args: &Args, registry: CheckRegistry) -> Result<ScanOrchestrator> {
    let guard = ThrottleGuard::new(args.max_attempts);

    let accessor = match args.provider {
        CloudProvider::Aws => {
            let credentials = AwsCredentials::from_env()?;
            AwsAccessor::new(credentials, args.default_region.clone())?
                .with_throttle_guard(guard.clone())
        }
    };

    let mut delivery = DeliveryConfig::new(args.cx_endpoint)
        .with_application_name(args.application_name.clone())
        .with_dry_run(args.dry_run);
    if let Some(url) = &args.ingress_url {
        delivery = delivery.with_url(url.clone());
    }
    if let Some(key) = &args.api_key {
        delivery = delivery.with_api_key(key.clone());
    }
    let shippers = shipper_factory(&delivery)?;

    Ok(ScanOrchestrator::new(
        Arc::new(accessor),
        registry,
        shippers,
    )
    .with_throttle_guard(guard)
    .with_max_workers(args.max_workers)
    .with_thresholds(args.thresholds.clone()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    info!(
        provider = %args.provider,
        default_region = %args.default_region,
        dry_run = args.dry_run,
        "Starting CSPM scanner"
    );

    let registry = match select_checks(&args) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Invalid check selection");
            return ExitCode::from(e.exit_code());
        }
    };

    let orchestrator = match build_orchestrator(&args, registry) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Invalid configuration");
            return ExitCode::from(exit_code::CONFIG);
        }
    };

    let request = ScanRequest {
        regions: args.regions.clone(),
        checks: args.services.clone(),
    };

    match orchestrator.run(request).await {
        Ok(summary) => {
            info!(
                execution_id = %summary.execution_id,
                findings = summary.findings,
                "Scan completed"
            );
            ExitCode::from(exit_code::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Scan failed");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_service_is_rejected_before_credentials() {
        let args = Args::try_parse_from(["cspm", "--services", "iam,lambda"]).unwrap();
        let err = select_checks(&args).unwrap_err();
        assert_eq!(err.exit_code(), exit_code::UNKNOWN_CHECK);
        assert!(err.to_string().contains("lambda"));
    }

    #[test]
    fn test_known_services_select_the_provider_registry() {
        let args = Args::try_parse_from(["cspm", "--services", "IAM,s3"]).unwrap();
        let registry = select_checks(&args).unwrap();
        assert_eq!(registry.provider(), CloudProvider::Aws);
    }
}
