//! CiliumNetworkPolicy and CiliumClusterwideNetworkPolicy resources
//!
//! Cilium owns these CRDs, so we implement `kube::Resource` by hand instead of
//! deriving a CustomResource we would never install. A policy carries either a
//! single rule-set in `spec`, a list in `specs`, or both.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::Resource;
use serde::{Deserialize, Serialize};

use super::rule::{Extra, Rule};

const GROUP: &str = "cilium.io";
const VERSION: &str = "v2";

/// API version shared by both policy kinds
pub const CILIUM_API_VERSION: &str = "cilium.io/v2";

/// Namespaced Cilium network policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicy {
    /// API version
    #[serde(default = "api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "CiliumNetworkPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Single rule-set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Rule>,
    /// Multiple rule-sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<Vec<Rule>>,
    /// Status written by Cilium agents and this operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PolicyStatus>,
}

impl CiliumNetworkPolicy {
    /// Kind name
    pub const KIND: &'static str = "CiliumNetworkPolicy";

    fn default_kind() -> String {
        Self::KIND.to_string()
    }

    /// Create a new CiliumNetworkPolicy
    pub fn new(metadata: ObjectMeta, spec: Option<Rule>, specs: Option<Vec<Rule>>) -> Self {
        Self {
            api_version: CILIUM_API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata,
            spec,
            specs,
            status: None,
        }
    }
}

impl Resource for CiliumNetworkPolicy {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(Self::KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("ciliumnetworkpolicies")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Cluster-scoped Cilium network policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumClusterwideNetworkPolicy {
    /// API version
    #[serde(default = "api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "CiliumClusterwideNetworkPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Single rule-set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Rule>,
    /// Multiple rule-sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<Vec<Rule>>,
    /// Status written by Cilium agents and this operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PolicyStatus>,
}

impl CiliumClusterwideNetworkPolicy {
    /// Kind name
    pub const KIND: &'static str = "CiliumClusterwideNetworkPolicy";

    fn default_kind() -> String {
        Self::KIND.to_string()
    }

    /// Create a new CiliumClusterwideNetworkPolicy
    pub fn new(metadata: ObjectMeta, spec: Option<Rule>, specs: Option<Vec<Rule>>) -> Self {
        Self {
            api_version: CILIUM_API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata,
            spec,
            specs,
            status: None,
        }
    }
}

impl Resource for CiliumClusterwideNetworkPolicy {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(Self::KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("ciliumclusterwidenetworkpolicies")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

fn api_version() -> String {
    CILIUM_API_VERSION.to_string()
}

/// Policy status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Per-derivative outcome, keyed by derivative name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derivative_policies: BTreeMap<String, DerivativeStatus>,
    /// Per-node enforcement status and anything else Cilium writes
    #[serde(flatten)]
    pub extra: Extra,
}

/// Outcome of the last derivation attempt for one derivative
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivativeStatus {
    /// Whether the derivative reflects the current source
    #[serde(default)]
    pub ok: bool,
    /// Last derivation error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC 3339 timestamp of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl DerivativeStatus {
    /// Successful derivation at the current time
    pub fn succeeded() -> Self {
        Self {
            ok: true,
            error: None,
            last_updated: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Failed derivation at the current time
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            last_updated: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Same outcome, ignoring when it was recorded
    pub fn same_outcome(&self, other: &DerivativeStatus) -> bool {
        self.ok == other.ok && self.error == other.error
    }
}
