//! Kubernetes controller glue
//!
//! `reconcile` and `error_policy` are generic over the two Cilium policy
//! kinds so one pair of functions serves both controllers.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use togroups_common::{Error, Result};

use crate::model::DerivationSource;
use crate::reconciler::Reconciler;

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the policy controllers
pub struct ControllerContext {
    /// Lifecycle reconciler shared by every controller
    pub reconciler: Arc<Reconciler>,
    /// Fires when the operator shuts down or loses leadership
    pub shutdown: CancellationToken,
}

impl ControllerContext {
    /// Create a context
    pub fn new(reconciler: Arc<Reconciler>, shutdown: CancellationToken) -> Self {
        Self {
            reconciler,
            shutdown,
        }
    }

    /// Periodic re-derivation interval
    pub fn refresh_interval(&self) -> Duration {
        self.reconciler.config().refresh_interval
    }

    /// Context over `store` with no providers registered
    #[cfg(test)]
    pub(crate) fn for_testing(store: Arc<dyn crate::store::PolicyStore>) -> Self {
        use togroups_common::events::NoopEventPublisher;
        use togroups_provider::{GroupResolver, ProviderRegistry, ResolverConfig};

        let resolver =
            GroupResolver::new(Arc::new(ProviderRegistry::new()), ResolverConfig::default());
        let builder = crate::derive::DerivativeBuilder::new(Arc::new(resolver));
        let reconciler = Reconciler::new(
            store,
            Arc::new(builder),
            Arc::new(NoopEventPublisher),
            Default::default(),
        );
        Self::new(Arc::new(reconciler), CancellationToken::new())
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile one source policy
///
/// Derivatives are never derived from. Policies being deleted are left to
/// the deletion watcher. Everything else is re-derived and requeued at the
/// refresh interval so group membership changes are picked up.
#[instrument(skip(policy, ctx), fields(kind = %K::kind(&()), policy = %policy.name_any()))]
pub async fn reconcile<K: DerivationSource>(
    policy: Arc<K>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    if policy.is_derivative() {
        return Ok(Action::await_change());
    }
    if policy.meta().deletion_timestamp.is_some() {
        debug!("policy is being deleted, skipping");
        return Ok(Action::await_change());
    }

    let source = policy.to_source()?;
    let outcome = ctx.reconciler.reconcile(&source, &ctx.shutdown).await?;
    debug!(outcome = outcome.as_str(), "policy reconciled");

    Ok(Action::requeue(ctx.refresh_interval()))
}

/// Error policy: transient failures come back in 30s, broken policies at the refresh interval
pub fn error_policy<K: DerivationSource>(
    policy: Arc<K>,
    error: &Error,
    ctx: Arc<ControllerContext>,
) -> Action {
    let after = error.requeue_after(ctx.refresh_interval());
    warn!(
        policy = %policy.name_any(),
        namespace = ?policy.namespace(),
        error = %error,
        retry_in_secs = after.as_secs(),
        "derivation failed, will retry"
    );
    Action::requeue(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use togroups_common::crd::{
        CiliumClusterwideNetworkPolicy, CiliumNetworkPolicy, EgressRule, PortProtocol, PortRule,
        Rule,
    };

    use crate::model::{DerivativePolicy, PolicyIdentity, PolicyScope, RuleSets};
    use crate::store::MockPolicyStore;

    fn plain_rule() -> Rule {
        Rule {
            egress: vec![EgressRule {
                to_ports: vec![PortRule {
                    ports: vec![PortProtocol::tcp(5555)],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn cnp(spec: Option<Rule>) -> CiliumNetworkPolicy {
        CiliumNetworkPolicy::new(
            ObjectMeta {
                name: Some("test".into()),
                namespace: Some("testns".into()),
                uid: Some("123".into()),
                ..Default::default()
            },
            spec,
            None,
        )
    }

    /// Story: derivatives written by the operator are never derived again
    #[tokio::test]
    async fn story_derivative_objects_are_ignored() {
        let ctx = Arc::new(ControllerContext::for_testing(Arc::new(MockPolicyStore::new())));
        let derivative = DerivativePolicy::new(
            PolicyIdentity::new(PolicyScope::Namespaced("testns".into()), "test", "123"),
            RuleSets::Single(plain_rule()),
        );

        let action = reconcile(Arc::new(derivative.to_cnp()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deleting_policy_is_skipped() {
        let ctx = Arc::new(ControllerContext::for_testing(Arc::new(MockPolicyStore::new())));
        let mut policy = cnp(Some(plain_rule()));
        policy.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let action = reconcile(Arc::new(policy), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a policy without groups is requeued at the refresh interval
    ///
    /// Nothing is written; the store is only asked to remove a derivative
    /// that might be left over from an earlier version of the policy.
    #[tokio::test]
    async fn story_policy_without_groups_requeues_at_refresh() {
        let mut store = MockPolicyStore::new();
        store
            .expect_delete_derivative()
            .withf(|scope, name| {
                scope == &PolicyScope::Namespaced("testns".into()) && name == "test-togroups-123"
            })
            .times(1)
            .returning(|_, _| Ok(false));
        let ctx = Arc::new(ControllerContext::for_testing(Arc::new(store)));

        let action = reconcile(Arc::new(cnp(Some(plain_rule()))), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(ctx.refresh_interval()));
    }

    #[tokio::test]
    async fn policy_without_rules_is_a_derivation_error() {
        let ctx = Arc::new(ControllerContext::for_testing(Arc::new(MockPolicyStore::new())));
        let err = reconcile(Arc::new(cnp(None)), ctx).await.unwrap_err();
        assert!(matches!(err, Error::PolicyDerivation { .. }));
    }

    /// Story: broken policies are not hammered, outages are retried soon
    #[test]
    fn story_error_policy_cadence() {
        let ctx = Arc::new(ControllerContext::for_testing(Arc::new(MockPolicyStore::new())));
        let policy = Arc::new(CiliumClusterwideNetworkPolicy::new(
            ObjectMeta {
                name: Some("ccnp-test".into()),
                ..Default::default()
            },
            None,
            None,
        ));

        let action = error_policy(
            policy.clone(),
            &Error::policy_derivation("neither spec nor specs is set"),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(ctx.refresh_interval()));

        let action = error_policy(
            policy,
            &Error::StoreUnavailable {
                message: "connection refused".into(),
            },
            ctx,
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }
}
