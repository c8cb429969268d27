//! Nimbus operator - VirtualMachineDefinition reconciliation

use std::sync::Arc;

use clap::Parser;
use kube::api::{Patch, PatchParams};
use kube::runtime::reflector::store::Writer;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nimbus_common::crd::{VirtualMachineDefinition, VirtualMachineInstance};
use nimbus_common::events::KubeEventPublisher;
use nimbus_operator::controller::DefinitionController;
use nimbus_operator::stores::{ReflectorDefinitionCache, ReflectorInstanceCache, VirtClientImpl};
use nimbus_operator::watch::{run_definition_watch, run_instance_watch};

/// Nimbus - declarative virtual machine lifecycle on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "nimbus-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Number of parallel reconcile workers
    #[arg(long, default_value_t = 3)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let definition_crd = serde_yaml::to_string(&VirtualMachineDefinition::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let instance_crd = serde_yaml::to_string(&VirtualMachineInstance::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        print!("{definition_crd}");
        println!("---");
        print!("{instance_crd}");
        return Ok(());
    }

    run_operator(cli.workers).await
}

/// Ensure the Nimbus CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side
/// apply, so the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("nimbus-operator").force();

    tracing::info!("Installing VirtualMachineDefinition CRD...");
    crds.patch(
        "virtualmachinedefinitions.nimbus.dev",
        &params,
        &Patch::Apply(&VirtualMachineDefinition::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install VirtualMachineDefinition CRD: {}", e))?;

    tracing::info!("Installing VirtualMachineInstance CRD...");
    crds.patch(
        "virtualmachineinstances.nimbus.dev",
        &params,
        &Patch::Apply(&VirtualMachineInstance::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install VirtualMachineInstance CRD: {}", e))?;

    tracing::info!("All Nimbus CRDs installed/updated");
    Ok(())
}

/// Run the controller until a shutdown signal arrives
async fn run_operator(workers: usize) -> anyhow::Result<()> {
    tracing::info!("Nimbus operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let definition_writer = Writer::<VirtualMachineDefinition>::default();
    let definition_store = definition_writer.as_reader();
    let instance_writer = Writer::<VirtualMachineInstance>::default();
    let instance_store = instance_writer.as_reader();

    let events = Arc::new(KubeEventPublisher::new(
        client.clone(),
        "virtualmachine-controller",
    ));
    let controller = Arc::new(DefinitionController::new(
        Arc::new(ReflectorDefinitionCache::new(definition_store.clone())),
        Arc::new(ReflectorInstanceCache::new(instance_store.clone())),
        Arc::new(VirtClientImpl::new(client.clone())),
        events,
    ));

    let definitions: Api<VirtualMachineDefinition> = Api::all(client.clone());
    let instances: Api<VirtualMachineInstance> = Api::all(client);

    tokio::spawn(run_definition_watch(
        definitions,
        definition_writer,
        Arc::clone(&controller),
    ));
    tokio::spawn(run_instance_watch(
        instances,
        instance_writer,
        Arc::clone(&controller),
    ));

    // Workers start only after both caches completed their initial list
    definition_store
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("Definition cache never became ready: {}", e))?;
    instance_store
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("Instance cache never became ready: {}", e))?;
    tracing::info!("Caches synced");

    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                    controller.shutdown();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
            }
        });
    }

    controller.run(workers).await;

    tracing::info!("Nimbus operator shutting down");
    Ok(())
}
