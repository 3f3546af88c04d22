//! Provider registry
//!
//! One provider per kind. The registry is created in `main` (or a test),
//! filled before the controllers start, and shared by `Arc`.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use togroups_common::{GroupReference, ProviderKind};

/// Error type providers may return; wrapped into a resolution error by the resolver
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Resolves group references of one provider kind into addresses
///
/// Implementations are called concurrently from many reconciles and should
/// stop work promptly once `cancel` fires.
#[async_trait]
pub trait GroupProvider: Send + Sync {
    /// Current addresses behind `group`. An empty list is a valid answer.
    async fn resolve(
        &self,
        group: &GroupReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpAddr>, ProviderError>;
}

/// Adapter turning an async closure into a [`GroupProvider`]
pub struct FnProvider<F>(F);

/// Wrap an async closure as a provider
///
/// ```ignore
/// registry.register(
///     ProviderKind::Aws,
///     Arc::new(provider_fn(|_group, _cancel| async {
///         Ok(vec!["192.168.1.1".parse()?])
///     })),
/// );
/// ```
pub fn provider_fn<F, Fut>(f: F) -> FnProvider<F>
where
    F: Fn(GroupReference, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<IpAddr>, ProviderError>> + Send,
{
    FnProvider(f)
}

#[async_trait]
impl<F, Fut> GroupProvider for FnProvider<F>
where
    F: Fn(GroupReference, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<IpAddr>, ProviderError>> + Send,
{
    async fn resolve(
        &self,
        group: &GroupReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpAddr>, ProviderError> {
        (self.0)(group.clone(), cancel.clone()).await
    }
}

/// Table of providers keyed by kind
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<ProviderKind, Arc<dyn GroupProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for `kind`, replacing and returning any previous one
    pub fn register(
        &self,
        kind: ProviderKind,
        provider: Arc<dyn GroupProvider>,
    ) -> Option<Arc<dyn GroupProvider>> {
        let previous = self.providers.insert(kind, provider);
        if previous.is_some() {
            warn!(provider = %kind, "Replacing previously registered group provider");
        } else {
            info!(provider = %kind, "Registered group provider");
        }
        previous
    }

    /// Provider registered for `kind`, if any
    pub fn lookup(&self, kind: ProviderKind) -> Option<Arc<dyn GroupProvider>> {
        self.providers.get(&kind).map(|p| Arc::clone(p.value()))
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.iter().map(|e| *e.key()).collect();
        kinds.sort();
        kinds
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use togroups_common::crd::AwsGroup;

    fn fixed(addr: &'static str) -> Arc<dyn GroupProvider> {
        Arc::new(provider_fn(move |_group, _cancel| async move {
            Ok::<_, ProviderError>(vec![addr.parse::<IpAddr>()?])
        }))
    }

    fn aws() -> GroupReference {
        GroupReference::Aws(AwsGroup::default())
    }

    #[tokio::test]
    async fn lookup_returns_registered_provider() {
        let registry = ProviderRegistry::new();
        assert!(registry.lookup(ProviderKind::Aws).is_none());
        assert!(registry.is_empty());

        registry.register(ProviderKind::Aws, fixed("192.168.1.1"));

        let provider = registry.lookup(ProviderKind::Aws).unwrap();
        let addrs = provider
            .resolve(&aws(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(addrs, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(registry.kinds(), vec![ProviderKind::Aws]);
    }

    /// Story: re-registering a kind replaces the earlier provider
    #[tokio::test]
    async fn story_last_registration_wins() {
        let registry = ProviderRegistry::new();
        assert!(registry
            .register(ProviderKind::Aws, fixed("10.0.0.1"))
            .is_none());
        assert!(registry
            .register(ProviderKind::Aws, fixed("10.0.0.2"))
            .is_some());

        let addrs = registry
            .lookup(ProviderKind::Aws)
            .unwrap()
            .resolve(&aws(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(addrs, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(registry.kinds().len(), 1);
    }

    #[tokio::test]
    async fn closure_provider_sees_the_group() {
        let provider = provider_fn(|group: GroupReference, _cancel| async move {
            let addrs = match group {
                GroupReference::Aws(aws) if aws.region == "eu-west-1" => {
                    vec!["10.1.0.1".parse::<IpAddr>()?]
                }
                GroupReference::Aws(_) => vec![],
            };
            Ok::<_, ProviderError>(addrs)
        });

        let eu = GroupReference::Aws(AwsGroup {
            region: "eu-west-1".to_string(),
            ..Default::default()
        });
        let token = CancellationToken::new();
        assert_eq!(provider.resolve(&eu, &token).await.unwrap().len(), 1);
        assert!(provider.resolve(&aws(), &token).await.unwrap().is_empty());
    }
}
