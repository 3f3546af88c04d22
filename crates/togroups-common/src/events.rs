//! Kubernetes Events on source policies
//!
//! Every change the operator makes to a derivative is announced on the
//! source policy, so `kubectl describe cnp <name>` shows when its derivative
//! was created, replaced, removed, or failed to build. Publishing is
//! fire-and-forget: a failed event is logged and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Something that happened to a policy's derivative
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DerivativeEvent {
    /// Derivative written for the first time
    Created {
        /// Derivative name
        derivative: String,
    },
    /// Derivative replaced with new content
    Updated {
        /// Derivative name
        derivative: String,
    },
    /// Derivative removed (no group references left, or source gone)
    Deleted {
        /// Derivative name
        derivative: String,
    },
    /// Resolution or assembly failed; any previous derivative is kept
    Failed {
        /// Rendered error
        message: String,
    },
}

impl DerivativeEvent {
    /// Normal for changes, Warning for failures
    pub fn type_(&self) -> EventType {
        match self {
            DerivativeEvent::Failed { .. } => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    /// REASON column in `kubectl get events`
    pub fn reason(&self) -> &'static str {
        match self {
            DerivativeEvent::Created { .. } => "DerivativeCreated",
            DerivativeEvent::Updated { .. } => "DerivativeUpdated",
            DerivativeEvent::Deleted { .. } => "DerivativeDeleted",
            DerivativeEvent::Failed { .. } => "DerivationFailed",
        }
    }

    /// ACTION column in `kubectl get events`
    pub fn action(&self) -> &'static str {
        match self {
            DerivativeEvent::Deleted { .. } => "Delete",
            _ => "Derive",
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            DerivativeEvent::Created { derivative } => {
                format!("Created derivative policy {derivative}")
            }
            DerivativeEvent::Updated { derivative } => {
                format!("Updated derivative policy {derivative}")
            }
            DerivativeEvent::Deleted { derivative } => {
                format!("Deleted derivative policy {derivative}")
            }
            DerivativeEvent::Failed { message } => message.clone(),
        }
    }
}

/// Sink for derivative events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on the source policy `policy`
    async fn publish(&self, policy: &ObjectReference, event: DerivativeEvent);
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when known
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, policy: &ObjectReference, event: DerivativeEvent) {
        let reason = event.reason();
        let recorded = Event {
            type_: event.type_(),
            reason: reason.to_string(),
            note: Some(event.note()),
            action: event.action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&recorded, policy).await {
            warn!(
                reason,
                policy = ?policy.name,
                namespace = ?policy.namespace,
                error = %e,
                "Failed to publish policy event"
            );
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _policy: &ObjectReference, _event: DerivativeEvent) {}
}
