//! togroups operator - materializes Cilium toGroups policies into address-based derivatives

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use togroups_common::events::KubeEventPublisher;
use togroups_common::leader_election::{LeaderElector, LeaderGuard, LEADER_LEASE_NAME};
use togroups_common::retry::RetryConfig;
use togroups_common::{ProviderKind, FIELD_MANAGER};
use togroups_controller::{
    build_controllers, ControllerContext, DerivativeBuilder, KubePolicyStore, Reconciler,
    ReconcilerConfig,
};
use togroups_provider::{GroupResolver, ProviderRegistry, ResolverConfig, StaticGroupTable};

/// togroups - derive address-based Cilium policies from toGroups references
#[derive(Parser, Debug)]
#[command(name = "togroups-operator", version, about, long_about = None)]
struct Cli {
    /// Re-derive every policy this often, in seconds
    #[arg(long, env = "TOGROUPS_REFRESH_INTERVAL_SECS", default_value_t = 300)]
    refresh_interval_secs: u64,

    /// Deadline for one provider call, in seconds
    #[arg(long, env = "TOGROUPS_RESOLVE_TIMEOUT_SECS", default_value_t = 10)]
    resolve_timeout_secs: u64,

    /// Deadline for one reconcile run, in seconds
    #[arg(long, env = "TOGROUPS_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    reconcile_timeout_secs: u64,

    /// Provider calls allowed in flight at once
    #[arg(long, env = "TOGROUPS_MAX_CONCURRENT_RESOLUTIONS", default_value_t = 4)]
    max_concurrent_resolutions: usize,

    /// Attempts when a derivative write hits a version conflict
    #[arg(long, env = "TOGROUPS_CONFLICT_RETRIES", default_value_t = 5)]
    conflict_retries: u32,

    /// Attempts for a store call while the API server is unavailable
    #[arg(long, env = "TOGROUPS_STORE_RETRIES", default_value_t = 5)]
    store_retries: u32,

    /// Sweep derivatives of deleted policies this often, in seconds
    #[arg(long, env = "TOGROUPS_ORPHAN_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    orphan_sweep_interval_secs: u64,

    /// YAML group table served as the AWS provider
    #[arg(long, env = "TOGROUPS_STATIC_GROUPS_FILE")]
    static_groups_file: Option<PathBuf>,

    /// Only write derivatives while holding the leader lease
    #[arg(long, env = "TOGROUPS_LEADER_ELECTION")]
    leader_election: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    lease_namespace: String,

    /// Identity in the leader lease (defaults to the hostname)
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Log as JSON lines
    #[arg(long, env = "TOGROUPS_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            timeout: Duration::from_secs(self.resolve_timeout_secs),
            max_concurrent: self.max_concurrent_resolutions,
        }
    }

    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            conflict_retries: self.conflict_retries,
            store_retry: RetryConfig::with_max_attempts(self.store_retries),
            orphan_sweep_interval: Duration::from_secs(self.orphan_sweep_interval_secs),
        }
    }

    fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| FIELD_MANAGER.to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let client = Client::try_default().await?;

    let registry = Arc::new(ProviderRegistry::new());
    if let Some(path) = &cli.static_groups_file {
        let table = StaticGroupTable::load(path).await?;
        registry.register(ProviderKind::Aws, Arc::new(table));
    }
    if registry.is_empty() {
        warn!("No group providers registered; policies referencing groups will fail to derive");
    }
    info!(providers = ?registry.kinds(), "Group providers ready");

    let resolver = Arc::new(GroupResolver::new(registry, cli.resolver_config()));
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubePolicyStore::new(client.clone())),
        Arc::new(DerivativeBuilder::new(resolver)),
        Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER)),
        cli.reconciler_config(),
    ));

    let mut leadership = if cli.leader_election {
        let identity = cli.identity();
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &cli.lease_namespace,
            &identity,
        ));
        info!(identity = %identity, namespace = %cli.lease_namespace, "Waiting for leadership");
        Some(elector.acquire().await)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(ControllerContext::new(reconciler, shutdown.clone()));

    info!("Starting togroups controllers");
    let controllers = build_controllers(client, ctx);

    tokio::select! {
        _ = futures::future::join_all(controllers) => {
            info!("Controllers stopped");
        }
        _ = leadership_lost(&mut leadership) => {
            warn!("Leadership lost, stopping controllers");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    shutdown.cancel();

    if let Some(guard) = &leadership {
        if let Err(e) = guard.release_leadership().await {
            warn!(error = %e, "Failed to release leader lease");
        }
    }

    info!("togroups operator shutting down");
    Ok(())
}

/// Resolves when leadership is lost; never when leader election is off
async fn leadership_lost(guard: &mut Option<LeaderGuard>) {
    match guard {
        Some(guard) => guard.lost().await,
        None => std::future::pending().await,
    }
}
