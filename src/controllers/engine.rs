use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};
use k8s_openapi::api::resource::v1alpha2::ResourceClaim;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    Client, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::finalizer::{finalizers_with, finalizers_without, ClaimFinalizers, KubeClaimFinalizers};
use super::{
    error_policy_backoff, ClaimOperation, ClaimRequest, ClaimTracker, FailureBackoff,
    ReconcileCallbacks,
};
use crate::config::ControllerConfig;
use crate::error::{OperatorError, Result};
use crate::metrics::ControllerMetrics;

const WATCH_TIMEOUT_SECS: u32 = 25;
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const NODE_NAME_FIELD: &str = "metadata.name";

/// Turn a ResourceClaim into a unit of work for this node.
///
/// Only claims of our resource classes that are allocated to this node are
/// considered. A claim that is being deleted or whose deallocation was
/// requested is unprepared; every other claim is prepared. Claims without an
/// allocation yield `None` unless they are being released, since a binding
/// may outlive the allocation.
pub fn classify_claim(
    claim: &ResourceClaim,
    config: &ControllerConfig,
) -> Result<Option<ClaimRequest>> {
    if !config.handles_class(&claim.spec.resource_class_name) {
        return Ok(None);
    }

    let releasing = claim.metadata.deletion_timestamp.is_some()
        || claim
            .status
            .as_ref()
            .and_then(|s| s.deallocation_requested)
            .unwrap_or(false);
    let allocation = claim.status.as_ref().and_then(|s| s.allocation.as_ref());
    match allocation {
        None if !releasing => return Ok(None),
        Some(allocation) => {
            let here = allocation
                .available_on_nodes
                .as_ref()
                .map_or(true, |selector| selector_matches_node(selector, &config.node_name));
            if !here {
                return Ok(None);
            }
        }
        None => {}
    }

    let name = claim.name_any();
    let namespace = claim.namespace().unwrap_or_default();
    let uid = claim.uid().ok_or_else(|| {
        OperatorError::InvalidState(format!("claim {}/{} has no uid", namespace, name))
    })?;

    Ok(Some(ClaimRequest {
        uid,
        namespace,
        name,
        operation: if releasing {
            ClaimOperation::Unprepare
        } else {
            ClaimOperation::Prepare
        },
    }))
}

/// Node labels are not available here, so terms are matched on the node
/// name alone: the `metadata.name` field and the hostname label.
fn selector_matches_node(selector: &NodeSelector, node_name: &str) -> bool {
    selector
        .node_selector_terms
        .iter()
        .any(|term| term_matches_node(term, node_name))
}

fn term_matches_node(term: &NodeSelectorTerm, node_name: &str) -> bool {
    let fields = term.match_fields.iter().flatten().map(|r| (r, NODE_NAME_FIELD));
    let labels = term.match_expressions.iter().flatten().map(|r| (r, HOSTNAME_LABEL));
    let mut requirements = fields.chain(labels).peekable();
    // An empty term selects nothing.
    if requirements.peek().is_none() {
        return false;
    }
    requirements.all(|(req, key)| requirement_matches(req, key, node_name))
}

fn requirement_matches(req: &NodeSelectorRequirement, key: &str, node_name: &str) -> bool {
    if req.key != key {
        return false;
    }
    let listed = req.values.iter().flatten().any(|v| v == node_name);
    match req.operator.as_str() {
        "In" => listed,
        "NotIn" => !listed,
        _ => false,
    }
}

fn claim_key(claim: &ResourceClaim) -> String {
    claim
        .uid()
        .unwrap_or_else(|| format!("{}/{}", claim.namespace().unwrap_or_default(), claim.name_any()))
}

/// Moves a claim through its lifecycle and invokes the driver callbacks.
pub(crate) struct Dispatcher {
    callbacks: Arc<dyn ReconcileCallbacks>,
    tracker: Arc<ClaimTracker>,
    metrics: Arc<ControllerMetrics>,
}

impl Dispatcher {
    pub(crate) fn new(
        callbacks: Arc<dyn ReconcileCallbacks>,
        tracker: Arc<ClaimTracker>,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            callbacks,
            tracker,
            metrics,
        }
    }

    /// Seed the tracker with the claims already bound on this node.
    pub(crate) async fn resync(&self) -> Result<usize> {
        let uids = self.callbacks.on_list().await?;
        let count = uids.len();
        self.tracker.seed_prepared(uids);
        Ok(count)
    }

    pub(crate) async fn dispatch(&self, request: &ClaimRequest) -> Result<()> {
        let state = self
            .tracker
            .request(&request.uid, request.operation)
            .map_err(|e| {
                OperatorError::InvalidState(format!(
                    "claim {}/{}: {}",
                    request.namespace, request.name, e
                ))
            })?;
        debug!(claim = %request.uid, state = %state, operation = %request.operation, "Dispatching claim");

        match request.operation {
            ClaimOperation::Prepare => {
                let devices = self.callbacks.on_prepare(request).await?;
                debug!(claim = %request.uid, gpus = ?devices.gpu_uuids().collect::<Vec<_>>(), "Claim prepared");
            }
            ClaimOperation::Unprepare => self.callbacks.on_unprepare(request).await?,
        }

        let state = self.tracker.complete(&request.uid, request.operation);
        self.metrics.record_success(request.operation);
        info!(
            claim = %format!("{}/{}", request.namespace, request.name),
            uid = %request.uid,
            state = %state,
            "Reconciled claim"
        );
        Ok(())
    }

    pub(crate) fn forget(&self, uid: &str) {
        self.tracker.forget(uid);
    }
}

/// Per-claim reconcile step: finalizer bookkeeping around the dispatch.
///
/// The finalizer goes on before a prepare can persist a binding and comes
/// off only after the unprepare succeeded.
pub(crate) struct ClaimReconciler {
    config: Arc<ControllerConfig>,
    dispatcher: Dispatcher,
    finalizers: Arc<dyn ClaimFinalizers>,
    backoff: FailureBackoff,
    metrics: Arc<ControllerMetrics>,
}

impl ClaimReconciler {
    pub(crate) fn new(
        config: Arc<ControllerConfig>,
        dispatcher: Dispatcher,
        finalizers: Arc<dyn ClaimFinalizers>,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            finalizers,
            backoff: FailureBackoff::new(),
            metrics,
        }
    }

    pub(crate) async fn reconcile(&self, claim: &ResourceClaim) -> Result<Action> {
        let Some(request) = classify_claim(claim, &self.config)? else {
            self.backoff.reset(&claim_key(claim));
            return Ok(Action::await_change());
        };

        match request.operation {
            ClaimOperation::Prepare => {
                if let Some(finalizers) = finalizers_with(claim) {
                    if !self.write_finalizers(claim, finalizers).await? {
                        debug!(claim = %request.uid, "Claim deleted before prepare");
                        self.release(&request.uid);
                        return Ok(Action::await_change());
                    }
                }
                self.dispatcher.dispatch(&request).await?;
            }
            ClaimOperation::Unprepare => {
                self.dispatcher.dispatch(&request).await?;
                let gone = match finalizers_without(claim) {
                    Some(finalizers) => {
                        let exists = self.write_finalizers(claim, finalizers).await?;
                        info!(claim = %claim.name_any(), "Finalizer removed");
                        !exists
                    }
                    None => false,
                };
                if gone || claim.metadata.deletion_timestamp.is_some() {
                    self.release(&request.uid);
                    return Ok(Action::await_change());
                }
            }
        }

        self.backoff.reset(&request.uid);
        Ok(Action::await_change())
    }

    pub(crate) fn error_policy(&self, claim: &ResourceClaim, error: &OperatorError) -> Action {
        let key = claim_key(claim);
        let terminal = error.is_terminal();
        self.metrics.record_error(terminal);
        if terminal {
            error!(claim = %key, error = %error, "Claim failed permanently; waiting for it to change");
        } else {
            warn!(claim = %key, error = %error, "Claim reconcile failed; requeueing");
        }
        error_policy_backoff(&self.backoff, &key, error)
    }

    /// Conditional on the observed resourceVersion. `Ok(false)` when the
    /// claim no longer exists.
    async fn write_finalizers(&self, claim: &ResourceClaim, finalizers: Vec<String>) -> Result<bool> {
        match self
            .finalizers
            .set_finalizers(
                &claim.namespace().unwrap_or_default(),
                &claim.name_any(),
                claim.resource_version(),
                finalizers,
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop all per-claim state once the claim is gone.
    fn release(&self, uid: &str) {
        self.dispatcher.forget(uid);
        self.backoff.reset(uid);
    }
}

/// Watches ResourceClaims and reconciles them with bounded concurrency.
pub struct ReconciliationEngine {
    client: Client,
    config: Arc<ControllerConfig>,
    reconciler: ClaimReconciler,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    pub fn new(
        client: Client,
        config: Arc<ControllerConfig>,
        callbacks: Arc<dyn ReconcileCallbacks>,
        tracker: Arc<ClaimTracker>,
        metrics: Arc<ControllerMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let dispatcher = Dispatcher::new(callbacks, tracker, metrics.clone());
        let finalizers = Arc::new(KubeClaimFinalizers::new(client.clone()));
        Self {
            reconciler: ClaimReconciler::new(config.clone(), dispatcher, finalizers, metrics),
            client,
            config,
            cancel,
        }
    }

    /// Run until the process is signalled or the token is cancelled.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        match self.reconciler.dispatcher.resync().await {
            Ok(count) => info!(claims = count, "Recovered bound claims from allocation record"),
            Err(e) => warn!(error = %e, "Could not list bound claims; starting with an empty tracker"),
        }

        let claims: Api<ResourceClaim> = Api::all(self.client.clone());
        info!(
            node = %self.config.node_name,
            workers = self.config.workers,
            classes = ?self.config.resource_classes,
            "Starting ResourceClaim controller"
        );

        let cancel = self.cancel.clone();
        let controller = Controller::new(
            claims,
            watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(controller::Config::default().concurrency(self.config.workers))
        .shutdown_on_signal()
        .run(
            |claim, ctx| async move { ctx.reconciler.reconcile(&claim).await },
            |claim, error, ctx| ctx.reconciler.error_policy(&claim, error),
            Arc::clone(&self),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(claim = %obj.name, "Reconcile loop iteration done"),
                Err(e) => warn!(error = %e, "Reconcile loop error"),
            }
        });

        tokio::select! {
            _ = controller => info!("ResourceClaim controller stopped"),
            _ = cancel.cancelled() => info!("ResourceClaim controller cancelled"),
        }
        Ok(())
    }
}
