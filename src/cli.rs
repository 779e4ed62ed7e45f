//! Command-line flags for both binaries and the shared tracing setup.
//!
//! Every flag can also be set through an environment variable; an explicit
//! flag wins over the environment, which wins over the default.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{detect_namespace, ControllerConfig, HttpConfig, DEFAULT_RESOURCE_CLASS};
use crate::crd::NodeAllocationStateStatus;
use crate::retry::RetryPolicy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    #[default]
    Json,
}

/// Install the global subscriber. `RUST_LOG` filters, defaulting to `info`.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Flags shared by everything that talks to the cluster.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Absolute path to a kubeconfig file; KUBECONFIG and in-cluster
    /// credentials are used when unset
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Name of the node whose NodeAllocationState is managed
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Namespace of the NodeAllocationState objects
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl ClusterArgs {
    pub fn namespace(&self) -> String {
        detect_namespace(self.namespace.as_deref())
    }
}

/// Node-level allocation controller for the example GPU resource driver
#[derive(Parser, Debug)]
#[command(name = "dra-example-controller")]
#[command(version, about)]
pub struct ControllerArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Number of claims reconciled concurrently
    #[arg(long, env = "WORKERS", default_value_t = 10)]
    pub workers: u16,

    /// Address for the diagnostics HTTP server (example: `:8080`); disabled when empty
    #[arg(long, env = "HTTP_ENDPOINT", default_value = "")]
    pub http_endpoint: String,

    /// HTTP path for Prometheus metrics; disabled when empty
    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// HTTP path for the runtime profile; disabled when empty
    #[arg(long, env = "PPROF_PATH", default_value = "")]
    pub pprof_path: String,

    /// Resource class handled by this driver; may be repeated
    #[arg(
        long = "resource-class",
        env = "RESOURCE_CLASS",
        value_delimiter = ',',
        default_value = DEFAULT_RESOURCE_CLASS
    )]
    pub resource_classes: Vec<String>,

    /// Attempts per conflicting NodeAllocationState update
    #[arg(long, env = "CONFLICT_RETRY_ATTEMPTS", default_value_t = 5)]
    pub conflict_retry_attempts: u32,

    /// Delay after the first conflict, in milliseconds
    #[arg(long, env = "CONFLICT_RETRY_INITIAL_DELAY_MS", default_value_t = 10)]
    pub conflict_retry_initial_delay_ms: u64,
}

impl ControllerArgs {
    pub fn to_config(&self) -> ControllerConfig {
        ControllerConfig {
            node_name: self.cluster.node_name.clone(),
            namespace: self.cluster.namespace(),
            workers: self.workers,
            resource_classes: self.resource_classes.clone(),
            retry: RetryPolicy {
                max_attempts: self.conflict_retry_attempts,
                initial_delay: Duration::from_millis(self.conflict_retry_initial_delay_ms),
                ..RetryPolicy::default()
            },
            http: HttpConfig {
                endpoint: self.http_endpoint.clone(),
                metrics_path: self.metrics_path.clone(),
                profile_path: self.pprof_path.clone(),
            },
        }
    }
}

/// Set the status of this node's NodeAllocationState
#[derive(Parser, Debug)]
#[command(name = "set-nas-status")]
#[command(version, about)]
pub struct SetStatusArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// The status to set [Ready | NotReady]
    #[arg(long, env = "STATUS")]
    pub status: String,
}

impl SetStatusArgs {
    pub fn parsed_status(&self) -> crate::error::Result<NodeAllocationStateStatus> {
        self.status.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_defaults() {
        let args = ControllerArgs::try_parse_from([
            "dra-example-controller",
            "--node-name",
            "worker-1",
            "--namespace",
            "dra",
        ])
        .unwrap();
        let config = args.to_config();
        assert_eq!(config.node_name, "worker-1");
        assert_eq!(config.namespace, "dra");
        assert_eq!(config.workers, 10);
        assert_eq!(config.resource_classes, vec![DEFAULT_RESOURCE_CLASS.to_string()]);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(config.http.endpoint, "");
        assert_eq!(config.http.metrics_path, "/metrics");
        assert_eq!(config.http.profile_path, "");
        assert_eq!(args.cluster.log_format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_controller_flags() {
        let args = ControllerArgs::try_parse_from([
            "dra-example-controller",
            "--node-name=worker-2",
            "--namespace=dra",
            "--kubeconfig=/tmp/kubeconfig",
            "--workers=3",
            "--http-endpoint=:8080",
            "--pprof-path=/debug/pprof",
            "--resource-class=gpu.example.com",
            "--resource-class=gpu.nvidia.com",
            "--conflict-retry-attempts=8",
            "--log-format=text",
        ])
        .unwrap();
        let config = args.to_config();
        assert_eq!(config.workers, 3);
        assert_eq!(config.http.endpoint, ":8080");
        assert_eq!(config.http.profile_path, "/debug/pprof");
        assert_eq!(config.resource_classes.len(), 2);
        assert!(config.handles_class("gpu.nvidia.com"));
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(args.cluster.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
        assert_eq!(args.cluster.log_format, LogFormat::Text);
    }

    #[test]
    fn test_set_status_args() {
        let args = SetStatusArgs::try_parse_from([
            "set-nas-status",
            "--node-name=worker-1",
            "--namespace=dra",
            "--status=notready",
        ])
        .unwrap();
        assert_eq!(args.parsed_status().unwrap(), NodeAllocationStateStatus::NotReady);

        let args = SetStatusArgs::try_parse_from([
            "set-nas-status",
            "--node-name=worker-1",
            "--namespace=dra",
            "--status=Broken",
        ])
        .unwrap();
        assert!(args.parsed_status().is_err());
    }

    #[test]
    fn test_rejects_bad_log_format() {
        assert!(SetStatusArgs::try_parse_from([
            "set-nas-status",
            "--node-name=worker-1",
            "--status=Ready",
            "--log-format=xml",
        ])
        .is_err());
    }
}
