//! Publish the readiness of this node's NodeAllocationState.
//!
//! ```bash
//! set-nas-status --node-name worker-1 --status Ready
//! ```

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use nas_controller::cli::{init_tracing, SetStatusArgs};
use nas_controller::config::resolve_client_config;
use nas_controller::{set_status, status_client, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn run(args: SetStatusArgs) -> anyhow::Result<()> {
    // Validate before touching the cluster.
    let status = args.parsed_status()?;

    let kube_config = resolve_client_config(args.cluster.kubeconfig.as_deref())
        .await
        .context("resolve client configuration")?;
    let client = Client::try_from(kube_config).context("create client")?;

    let namespace = args.cluster.namespace();
    let status_client = status_client::connect(client, &args.cluster.node_name, &namespace)
        .await
        .context("resolve NodeAllocationState identity")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    set_status(&status_client, &RetryPolicy::default(), &cancel, status)
        .await
        .with_context(|| {
            format!(
                "set status of NodeAllocationState {}/{}",
                namespace, args.cluster.node_name
            )
        })?;

    info!(node = %args.cluster.node_name, status = %status, "NodeAllocationState status updated");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = SetStatusArgs::parse();
    init_tracing(args.cluster.log_format);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
