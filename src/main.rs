//! Ballista Operator - lifecycle management for Ballista clusters on Kubernetes

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt};

use ballista_operator::config::{OperatorArgs, OperatorConfig};
use ballista_operator::controller::{error_policy, reconcile, Context};
use ballista_operator::crd::BallistaCluster;
use ballista_operator::index::{
    index_pods, owner_of, pod_watch_config, role_of, OwnerRoleIndex, WATCH_TIMEOUT_SECS,
};
use ballista_operator::telemetry::{init_tracing, LogFormat};
use ballista_operator::FIELD_MANAGER;

/// Ballista Operator - runs Ballista schedulers and executors as pods
#[derive(Parser, Debug)]
#[command(name = "ballista-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the BallistaCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, value_enum, env = "BALLISTA_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the BallistaCluster controller (default mode)
    Controller(ControllerArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Skip installing the CRD on startup
    #[arg(long)]
    skip_crd_install: bool,

    #[command(flatten)]
    operator: OperatorArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&BallistaCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            let args = ControllerArgs::parse_from(["controller"]);
            run_controller(args).await
        }
    }
}

/// Install or update the BallistaCluster CRD via server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing BallistaCluster CRD...");
    crds.patch(
        BallistaCluster::crd_name(),
        &params,
        &Patch::Apply(&BallistaCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install BallistaCluster CRD: {}", e))?;

    Ok(())
}

/// Run the controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = OperatorConfig::from(args.operator);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid operator configuration: {}", e))?;

    tracing::info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        concurrency = config.concurrency,
        "Ballista operator starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !args.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let index = Arc::new(OwnerRoleIndex::new(
        owner_of,
        role_of,
        config.staleness_window,
    ));

    let (clusters, pods): (Api<BallistaCluster>, Api<Pod>) = match &config.watch_namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    // One pod watch: the index applies each event, then the pod triggers its owner
    let pod_events = index_pods(
        watcher::watcher(pods, pod_watch_config()).default_backoff(),
        index.clone(),
    )
    .touched_objects();

    let concurrency = config.concurrency;
    let ctx = Arc::new(Context::builder(client, index).config(config).build());

    tracing::info!("Starting BallistaCluster controller...");
    Controller::new(
        clusters,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns_stream(pod_events)
    .with_config(ControllerConfig::default().concurrency(concurrency))
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok((cluster, action)) => {
                tracing::debug!(cluster = %cluster.name, ?action, "Cluster reconciliation completed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cluster reconciliation error");
            }
        }
    })
    .await;

    tracing::info!("Ballista operator shutting down");
    Ok(())
}
