use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use oci_ccm::cloudprovider::{
    new_security_list_manager, CloudLoadBalancerProvider, KubeSecretReader,
};
use oci_ccm::config::Config;
use oci_ccm::controller::{self, EventReporter, ServiceContext, VolumeContext};
use oci_ccm::oci::{CloudClient, OciHttpClient};
use oci_ccm::volume::{OciProvisioner, ProvisionerType, VolumeSettings, DEFAULT_MIN_VOLUME_SIZE};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the cloud controller (load balancers and security lists)
    Run(RunArgs),
    /// Run the volume provisioner
    Provision(ProvisionArgs),
    /// Load and validate a provider configuration file
    ValidateConfig(ValidateArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Provider configuration file
    #[arg(long, env = "CONFIG_YAML_FILENAME", default_value = oci_ccm::config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Cluster name reported to the load balancer reconciler
    #[arg(long, env = "CLUSTER_NAME", default_value = "kubernetes")]
    cluster_name: String,

    /// Prefix for load balancer display names
    #[arg(long, env = "LOAD_BALANCER_PREFIX", default_value = "")]
    load_balancer_prefix: String,

    /// Address of the health and metrics endpoint
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:10258")]
    http_addr: SocketAddr,
}

#[derive(Parser, Debug)]
struct ProvisionArgs {
    /// Provider configuration file
    #[arg(long, env = "CONFIG_YAML_FILENAME", default_value = oci_ccm::config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Storage class provisioner name to serve
    #[arg(long, env = "PROVISIONER_TYPE", default_value = oci_ccm::volume::PROVISIONER_NAME_DEFAULT)]
    provisioner: String,

    /// Region label stamped on volumes; defaults to the configured region
    #[arg(long, env = "OCI_SHORT_REGION")]
    region: Option<String>,

    /// Round block volume requests up to the minimum size
    #[arg(long, env = "VOLUME_ROUNDING_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    volume_rounding_enabled: bool,

    /// Smallest block volume to create when rounding is enabled
    #[arg(long, env = "MIN_VOLUME_SIZE", default_value = DEFAULT_MIN_VOLUME_SIZE)]
    min_volume_size: String,

    /// Prefix for file system display names
    #[arg(long, env = "VOLUME_NAME_PREFIX", default_value = "")]
    volume_name_prefix: String,

    /// Address of the health and metrics endpoint
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:10258")]
    http_addr: SocketAddr,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Provider configuration file
    #[arg(long, env = "CONFIG_YAML_FILENAME", default_value = oci_ccm::config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Also require the load balancer block
    #[arg(long)]
    load_balancing: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("oci-ccm v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::ValidateConfig(validate_args) => validate_config(validate_args),
        Commands::Run(run_args) => {
            init_tracing(args.log_format);
            let result = run_cloud_controller(run_args).await;
            oci_ccm::telemetry::shutdown_telemetry();
            result
        }
        Commands::Provision(provision_args) => {
            init_tracing(args.log_format);
            let result = run_provisioner(provision_args).await;
            oci_ccm::telemetry::shutdown_telemetry();
            result
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json = format == LogFormat::Json;
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true)));

    // Only enable OTEL if an endpoint is provided
    match oci_ccm::telemetry::otlp_endpoint() {
        Some(endpoint) => match oci_ccm::telemetry::init_telemetry(&registry, &endpoint) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        },
        None => {
            registry.init();
            info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
        }
    }
}

fn validate_config(args: ValidateArgs) -> anyhow::Result<()> {
    let cfg = Config::from_file(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config))?;
    if args.load_balancing {
        cfg.validate_for_load_balancing()
            .with_context(|| format!("invalid configuration {}", args.config))?;
    }
    println!("{}: OK", args.config);
    Ok(())
}

/// Identity reported on events: the pod name, else the host name.
fn process_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

#[cfg(feature = "rest-api")]
fn spawn_http_server(addr: SocketAddr) {
    tokio::spawn(async move {
        if let Err(e) = oci_ccm::rest_api::run_server(addr).await {
            tracing::error!("HTTP server error: {:?}", e);
        }
    });
}

#[cfg(not(feature = "rest-api"))]
fn spawn_http_server(addr: SocketAddr) {
    info!("Built without rest-api; not serving {}", addr);
}

async fn run_cloud_controller(args: RunArgs) -> anyhow::Result<()> {
    info!("Starting oci-ccm v{}", env!("CARGO_PKG_VERSION"));

    let cfg = Config::from_file(&args.config)?;
    cfg.validate_for_load_balancing()?;

    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    info!("Connected to Kubernetes cluster");

    let cloud: Arc<dyn CloudClient> = Arc::new(OciHttpClient::new(&cfg)?);
    let security_lists = new_security_list_manager(cloud.clone(), &cfg.load_balancer);
    let provider = CloudLoadBalancerProvider::new(
        cloud,
        Arc::new(KubeSecretReader::new(client.clone())),
        security_lists,
        &cfg,
        &args.load_balancer_prefix,
    );

    let identity = process_identity();
    info!("Reporting events as {}", identity);

    spawn_http_server(args.http_addr);

    let ctx = Arc::new(ServiceContext {
        client: client.clone(),
        provider: Arc::new(provider),
        cluster_name: args.cluster_name,
        reporter: EventReporter::new(client, identity),
    });
    controller::run_service_controller(ctx).await?;
    Ok(())
}

async fn run_provisioner(args: ProvisionArgs) -> anyhow::Result<()> {
    info!("Starting oci-ccm volume provisioner v{}", env!("CARGO_PKG_VERSION"));

    let cfg = Config::from_file(&args.config)?;
    let provisioner_type = ProvisionerType::parse(&args.provisioner)?;

    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    info!("Connected to Kubernetes cluster");

    let cloud: Arc<dyn CloudClient> = Arc::new(OciHttpClient::new(&cfg)?);
    let settings = VolumeSettings {
        provisioner_type,
        region: args.region.unwrap_or_else(|| cfg.auth.region.clone()),
        compartment_id: cfg.compartment.clone(),
        rounding_enabled: args.volume_rounding_enabled,
        min_volume_size: Quantity(args.min_volume_size),
        name_prefix: args.volume_name_prefix,
    };
    let provisioner = OciProvisioner::from_settings(cloud, &settings)?;

    spawn_http_server(args.http_addr);

    let ctx = Arc::new(VolumeContext {
        client: client.clone(),
        provisioner: Arc::new(provisioner),
        provisioner_name: args.provisioner,
        reporter: EventReporter::new(client, process_identity()),
    });
    controller::run_volume_controllers(ctx).await?;
    Ok(())
}
