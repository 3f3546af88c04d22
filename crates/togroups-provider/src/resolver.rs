//! Group resolver
//!
//! Looks up the provider for a group reference and calls it under a
//! deadline, a cancellation token, and a shared bound on in-flight calls.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use togroups_common::crd::CidrRule;
use togroups_common::metrics::{ResolutionResult, ResolutionTimer};
use togroups_common::{Error, GroupReference, Result};

use crate::registry::ProviderRegistry;

/// Resolver tuning
#[derive(Clone, Debug, PartialEq)]
pub struct ResolverConfig {
    /// Deadline for a single provider call
    pub timeout: Duration,
    /// Maximum provider calls in flight across all reconciles
    pub max_concurrent: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_concurrent: 4,
        }
    }
}

/// Snapshot of the addresses behind one group reference
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedAddressSet {
    addresses: Vec<IpAddr>,
    resolved_at: DateTime<Utc>,
}

impl ResolvedAddressSet {
    /// Sorted, de-duplicated snapshot taken now
    pub fn new(mut addresses: Vec<IpAddr>) -> Self {
        addresses.sort();
        addresses.dedup();
        Self {
            addresses,
            resolved_at: Utc::now(),
        }
    }

    /// Addresses in ascending order
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// When the provider answered
    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }

    /// True if the group currently has no members
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// One host CIDR rule per address
    pub fn cidr_rules(&self) -> impl Iterator<Item = CidrRule> + '_ {
        self.addresses.iter().copied().map(CidrRule::host)
    }
}

/// Resolves group references through the registered providers
pub struct GroupResolver {
    registry: Arc<ProviderRegistry>,
    config: ResolverConfig,
    permits: Semaphore,
}

impl GroupResolver {
    /// Create a resolver over `registry`
    pub fn new(registry: Arc<ProviderRegistry>, config: ResolverConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            registry,
            config,
            permits,
        }
    }

    /// Resolve one group reference
    ///
    /// Fails with `UnknownProvider` if nothing is registered for the group's
    /// kind, and with `ProviderResolution` if the provider errors, misses the
    /// deadline, or `cancel` fires first. Zero addresses is a success.
    pub async fn resolve(
        &self,
        group: &GroupReference,
        cancel: &CancellationToken,
    ) -> Result<ResolvedAddressSet> {
        let kind = group.kind();
        let provider = self
            .registry
            .lookup(kind)
            .ok_or_else(|| Error::unknown_provider(kind.as_str()))?;

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit
                .map_err(|_| Error::internal_with_context("resolver", "resolution pool closed"))?,
            _ = cancel.cancelled() => {
                return Err(Error::resolution(kind.as_str(), "cancelled before provider was called"));
            }
        };

        let timer = ResolutionTimer::start(kind.as_str());
        let call_token = cancel.child_token();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err((ResolutionResult::Cancelled, "cancelled".to_string())),
            res = tokio::time::timeout(self.config.timeout, provider.resolve(group, &call_token)) => {
                match res {
                    Ok(Ok(addresses)) => Ok(addresses),
                    Ok(Err(e)) => Err((ResolutionResult::Error, e.to_string())),
                    Err(_) => Err((
                        ResolutionResult::Timeout,
                        format!("timed out after {}ms", self.config.timeout.as_millis()),
                    )),
                }
            }
        };
        // Providers that spawned work see the deadline too
        call_token.cancel();

        match outcome {
            Ok(addresses) => {
                timer.complete(ResolutionResult::Success);
                let set = ResolvedAddressSet::new(addresses);
                debug!(provider = %kind, addresses = set.addresses().len(), "Group resolved");
                Ok(set)
            }
            Err((result, message)) => {
                timer.complete(result);
                warn!(provider = %kind, result = result.as_str(), error = %message, "Group resolution failed");
                Err(Error::resolution(kind.as_str(), message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use togroups_common::crd::AwsGroup;
    use togroups_common::ProviderKind;

    use crate::registry::{provider_fn, ProviderError};

    fn aws_group(label: &str) -> GroupReference {
        GroupReference::Aws(AwsGroup {
            labels: [("test".to_string(), label.to_string())].into(),
            ..Default::default()
        })
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn resolver_with(registry: ProviderRegistry, timeout: Duration) -> GroupResolver {
        GroupResolver::new(
            Arc::new(registry),
            ResolverConfig {
                timeout,
                max_concurrent: 2,
            },
        )
    }

    #[tokio::test]
    async fn unregistered_kind_is_unknown_provider() {
        let resolver = resolver_with(ProviderRegistry::new(), Duration::from_secs(1));
        let err = resolver
            .resolve(&aws_group("a"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProvider { ref kind } if kind == "aws"));
    }

    #[tokio::test]
    async fn addresses_are_sorted_and_deduplicated() {
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderKind::Aws,
            Arc::new(provider_fn(|_g, _c| async {
                Ok::<_, ProviderError>(vec![
                    "10.0.0.2".parse::<IpAddr>()?,
                    "10.0.0.1".parse::<IpAddr>()?,
                    "10.0.0.2".parse::<IpAddr>()?,
                ])
            })),
        );
        let resolver = resolver_with(registry, Duration::from_secs(1));

        let set = resolver
            .resolve(&aws_group("a"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(set.addresses(), &[ip("10.0.0.1"), ip("10.0.0.2")]);
        let cidrs: Vec<_> = set.cidr_rules().filter_map(|r| r.cidr).collect();
        assert_eq!(cidrs, vec!["10.0.0.1/32", "10.0.0.2/32"]);
    }

    /// Story: a group with no members is an answer, not a failure
    #[tokio::test]
    async fn story_empty_group_is_success() {
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderKind::Aws,
            Arc::new(provider_fn(|_g, _c| async { Ok::<_, ProviderError>(vec![]) })),
        );
        let resolver = resolver_with(registry, Duration::from_secs(1));

        let set = resolver
            .resolve(&aws_group("a"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn provider_error_becomes_resolution_error() {
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderKind::Aws,
            Arc::new(provider_fn(|_g, _c| async {
                Err::<Vec<IpAddr>, ProviderError>("DescribeNetworkInterfaces throttled".into())
            })),
        );
        let resolver = resolver_with(registry, Duration::from_secs(1));

        let err = resolver
            .resolve(&aws_group("a"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::ProviderResolution { kind, message } => {
                assert_eq!(kind, "aws");
                assert!(message.contains("throttled"));
            }
            other => panic!("expected ProviderResolution, got {other:?}"),
        }
    }

    /// Story: a hung provider is cut off at the deadline and told to stop
    #[tokio::test]
    async fn story_slow_provider_times_out_and_is_cancelled() {
        let saw_cancel = Arc::new(AtomicUsize::new(0));
        let seen = saw_cancel.clone();

        let registry = ProviderRegistry::new();
        registry.register(
            ProviderKind::Aws,
            Arc::new(provider_fn(move |_g, cancel: CancellationToken| {
                let seen = seen.clone();
                async move {
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        seen.fetch_add(1, Ordering::SeqCst);
                    });
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, ProviderError>(vec![])
                }
            })),
        );
        let resolver = resolver_with(registry, Duration::from_millis(50));

        let err = resolver
            .resolve(&aws_group("a"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        // Give the spawned watcher a moment to observe the cancellation
        for _ in 0..50 {
            if saw_cancel.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_caller_gets_resolution_error() {
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderKind::Aws,
            Arc::new(provider_fn(|_g, _c| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, ProviderError>(vec![])
            })),
        );
        let resolver = resolver_with(registry, Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = resolver.resolve(&aws_group("a"), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::ProviderResolution { .. }));
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn concurrent_calls_are_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let registry = ProviderRegistry::new();
        {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            registry.register(
                ProviderKind::Aws,
                Arc::new(provider_fn(move |_g, _c| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ProviderError>(vec!["10.0.0.1".parse::<IpAddr>()?])
                    }
                })),
            );
        }
        let resolver = Arc::new(resolver_with(registry, Duration::from_secs(5)));

        let mut handles = Vec::new();
        for i in 0..6 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(&aws_group(&i.to_string()), &CancellationToken::new())
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
