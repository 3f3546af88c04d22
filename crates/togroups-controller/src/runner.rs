//! Controller runner - builds the futures that make up the operator
//!
//! `build_controllers` returns boxed futures that the binary composes, so
//! construction stays free of runtime decisions such as leader election.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use togroups_common::crd::{CiliumClusterwideNetworkPolicy, CiliumNetworkPolicy};
use togroups_common::PARENT_UID_LABEL;

use crate::controller::{error_policy, reconcile, ControllerContext};
use crate::model::DerivationSource;
use crate::reconciler::Reconciler;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watch user-authored policies only
fn source_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .labels(&format!("!{PARENT_UID_LABEL}"))
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Watch derivatives only
fn derivative_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .labels(PARENT_UID_LABEL)
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Build the controller futures
///
/// - a controller per Cilium policy kind, also triggered by changes to the
///   derivatives it owns
/// - a deletion watcher per kind that removes derivatives of deleted sources
/// - the orphan sweeper
pub fn build_controllers(client: Client, ctx: Arc<ControllerContext>) -> Vec<BoxedTask> {
    let cnps: Api<CiliumNetworkPolicy> = Api::all(client.clone());
    let ccnps: Api<CiliumClusterwideNetworkPolicy> = Api::all(client);

    info!("- CiliumNetworkPolicy controller");
    info!("- CiliumClusterwideNetworkPolicy controller");
    info!(
        interval_secs = ctx.reconciler.config().orphan_sweep_interval.as_secs(),
        "- orphan sweeper"
    );

    vec![
        policy_controller(cnps.clone(), ctx.clone(), "CiliumNetworkPolicy"),
        policy_controller(ccnps.clone(), ctx.clone(), "CiliumClusterwideNetworkPolicy"),
        Box::pin(watch_deletions(cnps, ctx.clone())),
        Box::pin(watch_deletions(ccnps, ctx.clone())),
        Box::pin(run_orphan_sweeper(
            ctx.reconciler.clone(),
            ctx.shutdown.clone(),
        )),
    ]
}

fn policy_controller<K: DerivationSource>(
    api: Api<K>,
    ctx: Arc<ControllerContext>,
    name: &'static str,
) -> BoxedTask {
    Box::pin(
        Controller::new(api.clone(), source_watcher_config())
            .owns(api, derivative_watcher_config())
            .shutdown_on_signal()
            .run(reconcile::<K>, error_policy::<K>, ctx)
            .for_each(log_reconcile_result(name)),
    )
}

/// Remove derivatives of source policies as they are deleted
///
/// The owner reference on each derivative lets the API server collect it
/// too; this watcher makes removal immediate and clears reconciler state.
async fn watch_deletions<K: DerivationSource>(api: Api<K>, ctx: Arc<ControllerContext>) {
    let stream = watcher::watcher(api, source_watcher_config()).default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        let event = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(Event::Delete(policy))) => handle_deleted(&ctx, &policy).await,
            Some(Ok(_)) => {}
            Some(Err(e)) => warn!(error = %e, "policy watch error"),
            None => break,
        }
    }
    debug!("deletion watcher stopped");
}

async fn handle_deleted<K: DerivationSource>(ctx: &ControllerContext, policy: &K) {
    if policy.is_derivative() {
        return;
    }
    let identity = match policy.identity() {
        Ok(identity) => identity,
        Err(e) => {
            warn!(policy = %policy.name_any(), error = %e, "cannot identify deleted policy");
            return;
        }
    };
    info!(policy = %identity, "source policy deleted, removing derivative");
    if let Err(e) = ctx.reconciler.cleanup(&identity).await {
        // the orphan sweep retries this
        warn!(policy = %identity, error = %e, "failed to remove derivative of deleted policy");
    }
}

/// Periodically delete derivatives whose source no longer exists
pub async fn run_orphan_sweeper(reconciler: Arc<Reconciler>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(reconciler.config().orphan_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = reconciler.sweep_orphans().await {
                    warn!(error = %e, "orphan sweep failed");
                }
            }
        }
    }
    debug!("orphan sweeper stopped");
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
