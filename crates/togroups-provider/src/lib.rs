//! Group providers: registration, resolution, and a static table provider
//!
//! A provider turns a [`GroupReference`](togroups_common::GroupReference) into
//! the IP addresses currently behind it. Providers are registered per
//! [`ProviderKind`](togroups_common::ProviderKind) in a [`ProviderRegistry`]
//! built at startup, and invoked through the [`GroupResolver`], which adds
//! deadlines, cancellation, and a bound on concurrent calls.

pub mod registry;
pub mod resolver;
pub mod static_table;

pub use registry::{provider_fn, FnProvider, GroupProvider, ProviderError, ProviderRegistry};
pub use resolver::{GroupResolver, ResolvedAddressSet, ResolverConfig};
pub use static_table::{StaticGroupEntry, StaticGroupTable};
