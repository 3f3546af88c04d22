//! Common types for togroups: Cilium policy types, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod group;
pub mod leader_election;
pub mod metrics;
pub mod retry;

pub use error::Error;
pub use group::{GroupReference, ProviderKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager / controller name used on every write
pub const FIELD_MANAGER: &str = "togroups-operator";

/// Label carrying the UID of the source policy a derivative was generated from
pub const PARENT_UID_LABEL: &str = "io.cilium.network.policy.parent.uuid";

/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on derivatives this operator owns
pub const MANAGED_BY_VALUE: &str = "togroups-operator";

/// Infix between the source name and UID in derivative names
pub const DERIVATIVE_INFIX: &str = "togroups";
