//! Quorum Kubernetes Operator binary.
//!
//! Runs the periodic sweep and the watchers, all feeding one dispatcher that
//! reconciles QuorumAssembly resources.

use clap::Parser;
use kube::{Client, CustomResourceExt};
use quorum_operator::certs::RcgenCertManager;
use quorum_operator::config::OperatorConfig;
use quorum_operator::controller::{
    AssemblyOperator, ControllerContext, ReconcileDispatcher, Sweeper, watch_assemblies,
    watch_stateful_sets,
};
use quorum_operator::crd::QuorumAssembly;
use quorum_operator::observability::{LoggingConfig, init_tracing};
use quorum_operator::platform::KubePlatform;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Debug, Parser)]
#[command(name = "quorum-operator", version, about = "Kubernetes operator for quorum assemblies")]
struct Args {
    /// Print the CustomResourceDefinition YAML and exit.
    #[arg(long)]
    generate_crds: bool,

    /// Namespace to watch. Repeat for several; overrides QUORUM_NAMESPACES.
    #[arg(long = "namespace", value_name = "NS")]
    namespaces: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_crds {
        generate_crds()?;
        return Ok(());
    }

    init_tracing(&LoggingConfig::from_env())?;
    tracing::info!("Starting quorum operator");

    let mut config = OperatorConfig::from_env()?;
    if !args.namespaces.is_empty() {
        config = config.with_namespaces(args.namespaces);
    }
    config.validate()?;

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let platform = Arc::new(KubePlatform::new(client.clone()));
    let ctx = Arc::new(ControllerContext::new(
        platform.clone(),
        platform,
        Arc::new(RcgenCertManager),
        config.clone(),
    ));
    let operator = Arc::new(AssemblyOperator::new(ctx.clone()));
    let dispatcher = ReconcileDispatcher::new(operator, config.max_concurrent_reconciles());

    let scopes: Vec<Option<String>> = if config.namespaces().is_empty() {
        vec![None]
    } else {
        config.namespaces().iter().cloned().map(Some).collect()
    };

    let mut tasks = JoinSet::new();
    for scope in scopes {
        tasks.spawn(watch_assemblies(client.clone(), scope.clone(), dispatcher.clone()));
        tasks.spawn(watch_stateful_sets(client.clone(), scope, dispatcher.clone()));
    }
    let sweeper = Sweeper::new(ctx, dispatcher);

    tokio::select! {
        _ = sweeper.run() => {
            tracing::error!("Periodic reconciliation exited");
        }
        Some(result) = tasks.join_next() => {
            tracing::error!("Watcher exited: {:?}", result);
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tasks.shutdown().await;
    tracing::info!("Quorum operator stopped");
    Ok(())
}

/// Print the CRD as YAML.
fn generate_crds() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&QuorumAssembly::crd())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn namespace_flag_repeats() {
        let args = Args::try_parse_from(["quorum-operator", "--namespace", "a", "--namespace", "b"])
            .expect("parse");
        assert_eq!(args.namespaces, vec!["a", "b"]);
        assert!(!args.generate_crds);
    }
}
