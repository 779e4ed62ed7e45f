//! Immutable runtime configuration and cluster client resolution.
//!
//! Flags are parsed once in `main` and turned into a [`ControllerConfig`] that
//! is shared by `Arc` with every component; nothing reads process-wide
//! mutable state after startup.

use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;

use crate::error::{OperatorError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_RESOURCE_CLASS: &str = "gpu.example.com";
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Settings for the diagnostics HTTP server.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    /// Listen address; the server is disabled when empty
    pub endpoint: String,
    /// Metrics path; disabled when empty
    pub metrics_path: String,
    /// Profiling path; disabled when empty
    pub profile_path: String,
}

impl HttpConfig {
    pub fn enabled(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

/// Everything the controller process needs after startup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub node_name: String,
    pub namespace: String,
    pub workers: u16,
    pub resource_classes: Vec<String>,
    pub retry: RetryPolicy,
    pub http: HttpConfig,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(OperatorError::Configuration(
                "node name is required (--node-name or NODE_NAME)".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(OperatorError::Configuration(
                "--workers must be at least 1".to_string(),
            ));
        }
        if self.resource_classes.is_empty() {
            return Err(OperatorError::Configuration(
                "at least one --resource-class is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handles_class(&self, class: &str) -> bool {
        self.resource_classes.iter().any(|c| c == class)
    }
}

/// Namespace for the driver's objects.
///
/// Priority: explicit value → service account file → `"default"`.
pub fn detect_namespace(explicit: Option<&str>) -> String {
    if let Some(ns) = explicit.filter(|ns| !ns.is_empty()) {
        return ns.to_string();
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Where cluster credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientConfigSource {
    /// Path given with --kubeconfig
    Flag(PathBuf),
    /// Path from the KUBECONFIG environment variable
    Env(PathBuf),
    /// Service account credentials mounted into the pod
    InCluster,
}

impl ClientConfigSource {
    /// Explicit flag beats `KUBECONFIG`, which beats in-cluster credentials.
    pub fn select(flag: Option<&Path>, env: Option<&str>) -> Self {
        if let Some(path) = flag.filter(|p| !p.as_os_str().is_empty()) {
            return ClientConfigSource::Flag(path.to_path_buf());
        }
        match env.filter(|v| !v.is_empty()) {
            Some(path) => ClientConfigSource::Env(PathBuf::from(path)),
            None => ClientConfigSource::InCluster,
        }
    }
}

/// Resolve a kube client configuration from `--kubeconfig` and the environment.
pub async fn resolve_client_config(flag: Option<&Path>) -> Result<kube::Config> {
    let env = std::env::var("KUBECONFIG").ok();
    let source = ClientConfigSource::select(flag, env.as_deref());
    match &source {
        ClientConfigSource::Flag(path) | ClientConfigSource::Env(path) => {
            info!(source = ?source, "Using kubeconfig file");
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                OperatorError::ClientConfig(format!(
                    "create out-of-cluster client configuration from {}: {}",
                    path.display(),
                    e
                ))
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    OperatorError::ClientConfig(format!(
                        "create out-of-cluster client configuration: {}",
                        e
                    ))
                })
        }
        ClientConfigSource::InCluster => {
            info!("Using in-cluster client configuration");
            kube::Config::incluster().map_err(|e| {
                OperatorError::ClientConfig(format!(
                    "create in-cluster client configuration: {}",
                    e
                ))
            })
        }
    }
}
