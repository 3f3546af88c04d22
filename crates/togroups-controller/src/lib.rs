//! Derivative policy controller
//!
//! Turns Cilium policies whose rules reference external groups (`toGroups`,
//! `fromGroups`) into derivative policies that name the groups' current
//! addresses, and keeps those derivatives in step with their sources.
//!
//! ```text
//! change event / timer
//!   -> Reconciler reads the source
//!   -> DerivativeBuilder resolves groups and assembles the derivative
//!   -> Reconciler diffs against the stored derivative
//!   -> create / replace / delete through the PolicyStore
//! ```

pub mod config;
pub mod controller;
pub mod derive;
pub mod model;
pub mod reconciler;
pub mod runner;
pub mod store;

pub use config::ReconcilerConfig;
pub use controller::{error_policy, reconcile, ControllerContext};
pub use derive::{Derivation, DerivativeBuilder};
pub use model::{
    derivative_name, DerivationSource, DerivativePolicy, PolicyIdentity, PolicyScope, RuleSets,
    SourcePolicy, StoredDerivative,
};
pub use reconciler::{DerivativeState, ReconcileOutcome, Reconciler};
pub use runner::{build_controllers, run_orphan_sweeper};
pub use store::{KubePolicyStore, PolicyStore};
