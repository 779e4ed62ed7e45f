//! NodeAllocationState controller
//!
//! Watches ResourceClaims of the driver's resource classes and binds them to
//! devices in this node's NodeAllocationState.
//!
//! ## Usage
//!
//! ```bash
//! # Run against the current kubeconfig
//! dra-example-controller --node-name worker-1 --namespace dra-example-driver
//!
//! # Serve metrics and the runtime profile on :8080
//! dra-example-controller --node-name worker-1 --http-endpoint :8080 --pprof-path /debug/pprof
//!
//! # Run with custom log level
//! RUST_LOG=debug dra-example-controller --node-name worker-1
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use nas_controller::cli::{init_tracing, ControllerArgs};
use nas_controller::config::resolve_client_config;
use nas_controller::controllers::{ClaimTracker, NasDriver, ReconciliationEngine};
use nas_controller::diagnostics::{self, DiagnosticsState};
use nas_controller::metrics::ControllerMetrics;
use nas_controller::status_client;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn task_outcome(
    task: &str,
    result: Result<nas_controller::Result<()>, JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => {
            info!("{} stopped", task);
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "{} failed", task);
            Err(e).with_context(|| format!("{} failed", task))
        }
        Err(e) => {
            error!(error = %e, "{} task panicked", task);
            Err(e).with_context(|| format!("{} task panicked", task))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ControllerArgs::parse();
    init_tracing(args.cluster.log_format);

    let config = Arc::new(args.to_config());
    config.validate().context("invalid flags")?;

    info!(
        node = %config.node_name,
        namespace = %config.namespace,
        workers = config.workers,
        "Starting NodeAllocationState controller"
    );

    let kube_config = resolve_client_config(args.cluster.kubeconfig.as_deref())
        .await
        .context("resolve client configuration")?;
    let client = Client::try_from(kube_config).context("create client")?;
    info!("Connected to Kubernetes API server");

    let status_client = status_client::connect(client.clone(), &config.node_name, &config.namespace)
        .await
        .context("resolve NodeAllocationState identity")?;

    let cancel = CancellationToken::new();
    let metrics = Arc::new(ControllerMetrics::new());
    let tracker = Arc::new(ClaimTracker::new());

    let driver = Arc::new(NasDriver::new(
        status_client,
        config.retry.clone(),
        cancel.clone(),
        metrics.clone(),
    ));
    let engine = Arc::new(ReconciliationEngine::new(
        client,
        config.clone(),
        driver,
        tracker.clone(),
        metrics.clone(),
        cancel.clone(),
    ));

    let http = if config.http.enabled() {
        let state = DiagnosticsState::new(metrics.clone(), tracker.clone(), config.workers);
        let router = diagnostics::router(&config.http, state).context("build diagnostics router")?;
        Some((config.http.endpoint.clone(), router))
    } else {
        info!("Diagnostics server disabled");
        None
    };

    let mut engine_task = tokio::spawn(engine.run());
    let mut http_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match http {
                Some((endpoint, router)) => diagnostics::serve(&endpoint, router, cancel).await,
                None => {
                    cancel.cancelled().await;
                    Ok(())
                }
            }
        })
    };

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        result = &mut engine_task => task_outcome("Reconciliation engine", result),
        result = &mut http_task => task_outcome("Diagnostics server", result),
    };

    // Stops in-flight conflict retries and the diagnostics server.
    cancel.cancel();

    info!("NodeAllocationState controller shutting down");
    outcome
}
