//! Lifecycle reconciler
//!
//! Owns the mapping from a source policy to its derivative. Each run builds
//! the desired derivative, compares it with what is stored, and creates,
//! replaces, deletes, or leaves it alone. Runs for the same derivative are
//! serialized through a keyed lock; runs for different derivatives proceed
//! concurrently.
//!
//! A failed build never touches the stored derivative. The last good
//! derivative stays in place and the failure is reported on the source's
//! status and as a Warning event.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use togroups_common::crd::DerivativeStatus;
use togroups_common::events::{DerivativeEvent, EventPublisher};
use togroups_common::metrics::{self, WriteOperation};
use togroups_common::retry::retry_transient;
use togroups_common::{Error, Result};

use crate::config::ReconcilerConfig;
use crate::derive::{Derivation, DerivativeBuilder};
use crate::model::{PolicyIdentity, SourcePolicy};
use crate::store::PolicyStore;

/// What a reconcile run did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A derivative was written for the first time
    Created,
    /// The stored derivative was replaced
    Updated,
    /// The stored derivative already matched
    Unchanged,
    /// The derivative was removed
    Deleted,
    /// No derivative was needed and none existed
    NothingToDo,
}

impl ReconcileOutcome {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::NothingToDo => "nothing_to_do",
        }
    }
}

/// Last known lifecycle state of a derivative
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivativeState {
    /// The source needs no derivative
    NoDerivative,
    /// A derivative matching the last successful build is stored
    Derived,
    /// The source is gone and its derivative is being removed
    Deleting,
}

/// One async mutex per key, created on first use
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the mutex for `key` unless someone is holding or waiting on it
    fn forget(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Drives derivatives towards what their sources currently call for
pub struct Reconciler {
    store: Arc<dyn PolicyStore>,
    builder: Arc<DerivativeBuilder>,
    events: Arc<dyn EventPublisher>,
    locks: KeyedLocks,
    states: DashMap<String, DerivativeState>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        store: Arc<dyn PolicyStore>,
        builder: Arc<DerivativeBuilder>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            builder,
            events,
            locks: KeyedLocks::default(),
            states: DashMap::new(),
            config,
        }
    }

    /// Tuning in effect
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Last known state of the derivative with qualified name `key`
    pub fn state(&self, key: &str) -> Option<DerivativeState> {
        self.states.get(key).map(|s| *s)
    }

    /// Bring the derivative of `source` up to date
    ///
    /// Bounded by the reconcile deadline; a run that times out stops where it
    /// is and makes no further writes. Version conflicts re-read the source
    /// and rebuild, up to `conflict_retries` attempts.
    #[instrument(skip(self, source, cancel), fields(policy = %source.identity))]
    pub async fn reconcile(
        &self,
        source: &SourcePolicy,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let key = source.identity.key();
        let _guard = self.locks.lock(&key).await;

        let run = cancel.child_token();
        let deadline = self.config.reconcile_timeout;
        let result =
            match tokio::time::timeout(deadline, self.reconcile_with_retries(source, &run)).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout("reconcile", deadline)),
            };
        run.cancel();

        match &result {
            Ok(outcome) => {
                metrics::record_derivation(outcome.as_str());
                debug!(outcome = outcome.as_str(), "Reconcile finished");
            }
            Err(e) => {
                metrics::record_derivation_failure(e.kind_label());
                warn!(error = %e, "Reconcile failed");
            }
        }
        result
    }

    async fn reconcile_with_retries(
        &self,
        source: &SourcePolicy,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let attempts = self.config.conflict_retries.max(1);
        let mut current = source.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.apply(&current, cancel).await {
                Err(e) if e.is_conflict() && attempt < attempts => e,
                other => return other,
            };
            debug!(attempt, error = %err, "Derivative changed underneath us, re-reading source");

            let store = &self.store;
            let identity = &current.identity;
            let fresh = self
                .with_backoff("get_source", move || store.get_source(identity))
                .await?;
            match fresh {
                Some(fresh) if fresh.identity.uid == current.identity.uid => current = fresh,
                _ => {
                    info!("Source deleted or recreated during reconcile, removing its derivative");
                    let identity = current.identity.clone();
                    return self.remove_derivative(&identity).await;
                }
            }
        }
    }

    /// One build-and-write pass
    async fn apply(
        &self,
        source: &SourcePolicy,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let derivation = match self.builder.build(source, cancel).await {
            Ok(derivation) => derivation,
            Err(e) => {
                self.report_failure(source, &e).await;
                return Err(e);
            }
        };

        let identity = &source.identity;
        let name = identity.derivative_name();

        let derivative = match derivation {
            Derivation::NotNeeded => {
                // removed by an earlier run; the orphan sweep covers strays
                let removed =
                    self.state(&identity.key()) == Some(DerivativeState::NoDerivative);
                let outcome = if removed {
                    ReconcileOutcome::NothingToDo
                } else {
                    self.remove_derivative(identity).await?
                };
                if source.derivative_status.is_some() {
                    self.write_status(identity, &name, None).await;
                }
                return Ok(outcome);
            }
            Derivation::Derived(derivative) => derivative,
        };

        let store = &self.store;
        let scope = derivative.scope();
        let stored = self
            .with_backoff("get_derivative", || store.get_derivative(scope, &name))
            .await?;

        let outcome = match stored {
            Some(stored) if stored.matches(&derivative) => ReconcileOutcome::Unchanged,
            Some(stored) => {
                let version = stored.resource_version.ok_or_else(|| {
                    Error::internal_with_context(
                        "reconciler",
                        format!("stored derivative {name} has no resourceVersion"),
                    )
                })?;
                let desired = &derivative;
                let version = version.as_str();
                self.with_backoff("replace_derivative", move || {
                    store.replace_derivative(desired, version)
                })
                .await?;
                metrics::record_write(WriteOperation::Replace);
                ReconcileOutcome::Updated
            }
            None => {
                let desired = &derivative;
                self.with_backoff("create_derivative", move || store.create_derivative(desired))
                    .await?;
                metrics::record_write(WriteOperation::Create);
                ReconcileOutcome::Created
            }
        };
        self.states.insert(identity.key(), DerivativeState::Derived);

        match outcome {
            ReconcileOutcome::Created => {
                info!(derivative = %name, "Derivative created");
                let event = DerivativeEvent::Created {
                    derivative: name.clone(),
                };
                self.publish(identity, event).await;
            }
            ReconcileOutcome::Updated => {
                info!(derivative = %name, "Derivative updated");
                let event = DerivativeEvent::Updated {
                    derivative: name.clone(),
                };
                self.publish(identity, event).await;
            }
            _ => debug!(derivative = %name, "Derivative up to date"),
        }

        let succeeded = DerivativeStatus::succeeded();
        let recorded = source
            .derivative_status
            .as_ref()
            .is_some_and(|s| s.same_outcome(&succeeded));
        if !recorded {
            self.write_status(identity, &name, Some(succeeded)).await;
        }
        Ok(outcome)
    }

    /// Remove the derivative of a deleted source
    ///
    /// Deleting a derivative that does not exist is success.
    #[instrument(skip(self, identity), fields(policy = %identity))]
    pub async fn cleanup(&self, identity: &PolicyIdentity) -> Result<ReconcileOutcome> {
        let key = identity.key();
        let result = {
            let _guard = self.locks.lock(&key).await;
            self.states.insert(key.clone(), DerivativeState::Deleting);
            let result = self.remove_derivative(identity).await;
            if result.is_ok() {
                self.states.remove(&key);
            }
            result
        };
        self.locks.forget(&key);
        result
    }

    /// Delete the derivative of `identity`; the caller holds its lock
    async fn remove_derivative(&self, identity: &PolicyIdentity) -> Result<ReconcileOutcome> {
        let name = identity.derivative_name();
        let store = &self.store;
        let scope = &identity.scope;
        let deleted = self
            .with_backoff("delete_derivative", || store.delete_derivative(scope, &name))
            .await?;

        if !deleted {
            self.states
                .insert(identity.key(), DerivativeState::NoDerivative);
            return Ok(ReconcileOutcome::NothingToDo);
        }

        metrics::record_write(WriteOperation::Delete);
        self.states
            .insert(identity.key(), DerivativeState::NoDerivative);
        info!(derivative = %name, "Derivative deleted");
        self.publish(identity, DerivativeEvent::Deleted { derivative: name }).await;
        Ok(ReconcileOutcome::Deleted)
    }

    /// Delete managed derivatives whose parent no longer exists
    ///
    /// Derivatives are listed before sources so a derivative written after
    /// the listing cannot be mistaken for an orphan. Returns the number
    /// removed; individual delete failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let store = &self.store;
        let derivatives = self
            .with_backoff("list_derivatives", || store.list_derivatives())
            .await?;
        let live: HashSet<String> = self
            .with_backoff("list_source_uids", || store.list_source_uids())
            .await?
            .into_iter()
            .collect();

        let mut removed = 0usize;
        for derivative in derivatives {
            if !derivative.managed {
                continue;
            }
            let Some(parent) = derivative.parent_uid.as_deref() else {
                continue;
            };
            if live.contains(parent) {
                continue;
            }

            let key = derivative.key();
            let result = {
                let _guard = self.locks.lock(&key).await;
                let scope = &derivative.scope;
                let name = derivative.name.as_str();
                self.with_backoff("delete_derivative", move || {
                    store.delete_derivative(scope, name)
                })
                .await
            };
            self.locks.forget(&key);

            match result {
                Ok(true) => {
                    removed += 1;
                    self.states.remove(&key);
                    metrics::record_write(WriteOperation::Delete);
                    info!(derivative = %key, parent_uid = parent, "Removed orphaned derivative");
                }
                Ok(false) => {
                    self.states.remove(&key);
                }
                Err(e) => {
                    warn!(derivative = %key, error = %e, "Failed to remove orphaned derivative");
                }
            }
        }

        metrics::record_orphans_removed(removed as u64);
        if removed > 0 {
            info!(removed, "Orphan sweep finished");
        }
        Ok(removed)
    }

    async fn report_failure(&self, source: &SourcePolicy, error: &Error) {
        let identity = &source.identity;
        let name = identity.derivative_name();
        warn!(derivative = %name, error = %error, "Derivation failed, keeping previous derivative");

        let failed = DerivativeStatus::failed(error.to_string());
        let recorded = source
            .derivative_status
            .as_ref()
            .is_some_and(|s| s.same_outcome(&failed));
        if !recorded {
            self.write_status(identity, &name, Some(failed)).await;
        }
        let message = error.to_string();
        self.publish(identity, DerivativeEvent::Failed { message }).await;
    }

    /// Best-effort status write; failures are logged only
    async fn write_status(
        &self,
        identity: &PolicyIdentity,
        derivative: &str,
        status: Option<DerivativeStatus>,
    ) {
        if let Err(e) = self
            .store
            .patch_source_status(identity, derivative, status)
            .await
        {
            warn!(derivative, error = %e, "Failed to update source policy status");
        }
    }

    async fn publish(&self, identity: &PolicyIdentity, event: DerivativeEvent) {
        self.events.publish(&identity.object_ref(), event).await;
    }

    /// Retry a store call while the store is unavailable
    async fn with_backoff<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_transient(&self.config.store_retry, operation, Error::is_unavailable, op).await
    }
}
