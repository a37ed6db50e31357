//! Vigil Operator - keeps monitoring agents converged on DesiredAgent specs

mod controller_runner;

use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use vigil_common::crd::{AgentProfile, DesiredAgent};
use vigil_common::kube_utils::KeepFilter;
use vigil_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use vigil_common::OPERATOR_NAME;
use vigil_reconciler::options::{
    DEFAULT_AGENT_TAG, DEFAULT_CLUSTER_AGENT_TAG, DEFAULT_OTEL_COLLECTOR_TAG, DEFAULT_REGISTRY,
};
use vigil_reconciler::OperatorOptions;

/// Vigil - CRD-driven operator for node and cluster monitoring agents
#[derive(Parser, Debug)]
#[command(name = "vigil-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    options: OptionArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

/// Operator-wide switches, each with an environment fallback
#[derive(clap::Args, Debug)]
struct OptionArgs {
    /// Run the default node agent as an ExtendedDaemonSet and canary profile agents behind it
    #[arg(long, env = "VIGIL_EXTENDED_DAEMONSET_ENABLED", default_value_t = false)]
    extended_daemonset: bool,

    /// Seconds a canary must run before profile daemonsets follow it
    #[arg(long, env = "VIGIL_CANARY_DURATION_SECS", default_value_t = 600)]
    canary_duration_secs: u64,

    /// Evaluate AgentProfiles and label matching nodes
    #[arg(long, env = "VIGIL_PROFILES_ENABLED", default_value_t = false)]
    profiles: bool,

    /// Split node agents per node provider
    #[arg(long, env = "VIGIL_INTROSPECTION_ENABLED", default_value_t = false)]
    introspection: bool,

    /// Run process checks inside the core agent container
    #[arg(long, env = "VIGIL_PROCESS_CHECKS_IN_CORE_AGENT", default_value_t = false)]
    process_checks_in_core_agent: bool,

    /// Seconds between successful reconciles of the same agent
    #[arg(long, env = "VIGIL_REQUEUE_PERIOD_SECS", default_value_t = 15)]
    requeue_period_secs: u64,

    /// Comma-separated globs of foreign annotations kept on workload updates
    #[arg(long, env = "VIGIL_KEEP_ANNOTATIONS", default_value = "")]
    keep_annotations: String,

    /// Comma-separated globs of foreign labels kept on workload updates
    #[arg(long, env = "VIGIL_KEEP_LABELS", default_value = "")]
    keep_labels: String,

    /// Image registry used when a DesiredAgent sets none
    #[arg(long, env = "VIGIL_DEFAULT_REGISTRY", default_value = DEFAULT_REGISTRY)]
    registry: String,

    /// Node agent image tag
    #[arg(long, env = "VIGIL_AGENT_TAG", default_value = DEFAULT_AGENT_TAG)]
    agent_tag: String,

    /// Cluster agent image tag
    #[arg(long, env = "VIGIL_CLUSTER_AGENT_TAG", default_value = DEFAULT_CLUSTER_AGENT_TAG)]
    cluster_agent_tag: String,

    /// OTel collector image tag
    #[arg(long, env = "VIGIL_OTEL_COLLECTOR_TAG", default_value = DEFAULT_OTEL_COLLECTOR_TAG)]
    otel_collector_tag: String,

    /// Log line format (json or text)
    #[arg(long, env = "VIGIL_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl OptionArgs {
    fn operator_options(&self) -> OperatorOptions {
        OperatorOptions {
            extended_daemonset_enabled: self.extended_daemonset,
            canary_duration: Duration::from_secs(self.canary_duration_secs),
            profiles_enabled: self.profiles,
            introspection_enabled: self.introspection,
            process_checks_in_core_agent: self.process_checks_in_core_agent,
            requeue_period: Duration::from_secs(self.requeue_period_secs),
            keep_annotations: KeepFilter::new(&self.keep_annotations),
            keep_labels: KeepFilter::new(&self.keep_labels),
            default_registry: self.registry.clone(),
            agent_tag: self.agent_tag.clone(),
            cluster_agent_tag: self.cluster_agent_tag.clone(),
            otel_collector_tag: self.otel_collector_tag.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client's TLS stack needs a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in [DesiredAgent::crd(), AgentProfile::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        log_format: cli.options.log_format,
        ..TelemetryConfig::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.options.operator_options()).await,
    }
}

/// Ensure the operator's CRDs are installed
///
/// Server-side apply keeps the installed schema in step with the binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(OPERATOR_NAME).force();

    tracing::info!("Installing DesiredAgent CRD...");
    crds.patch(
        "desiredagents.agent.vigil.dev",
        &params,
        &Patch::Apply(&DesiredAgent::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install DesiredAgent CRD: {}", e))?;

    tracing::info!("Installing AgentProfile CRD...");
    crds.patch(
        "agentprofiles.agent.vigil.dev",
        &params,
        &Patch::Apply(&AgentProfile::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install AgentProfile CRD: {}", e))?;

    tracing::info!("All Vigil CRDs installed/updated");
    Ok(())
}

async fn run_controller(options: OperatorOptions) -> anyhow::Result<()> {
    tracing::info!(
        extended_daemonset = options.extended_daemonset_enabled,
        profiles = options.profiles_enabled,
        introspection = options.introspection_enabled,
        "Vigil controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let controllers = controller_runner::build_agent_controllers(client, options);
    tracing::info!(count = controllers.len(), "Starting controllers");
    futures::future::join_all(controllers).await;

    tracing::info!("Vigil controller shutting down");
    Ok(())
}
