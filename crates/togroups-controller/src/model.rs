//! Source and derivative policy model
//!
//! The controller works on [`SourcePolicy`] and [`DerivativePolicy`] rather
//! than the raw Cilium resources so that namespaced and clusterwide policies
//! share one code path. Conversion to and from the wire types lives here.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use serde::de::DeserializeOwned;

use togroups_common::crd::{
    CiliumClusterwideNetworkPolicy, CiliumNetworkPolicy, DerivativeStatus, Rule,
    CILIUM_API_VERSION,
};
use togroups_common::{
    Error, Result, DERIVATIVE_INFIX, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PARENT_UID_LABEL,
};

// =============================================================================
// Identity
// =============================================================================

/// Where a policy lives
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyScope {
    /// CiliumNetworkPolicy in a namespace
    Namespaced(String),
    /// CiliumClusterwideNetworkPolicy
    Clusterwide,
}

impl PolicyScope {
    /// Namespace, or None for clusterwide
    pub fn namespace(&self) -> Option<&str> {
        match self {
            PolicyScope::Namespaced(ns) => Some(ns),
            PolicyScope::Clusterwide => None,
        }
    }

    /// Cilium kind for this scope
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyScope::Namespaced(_) => CiliumNetworkPolicy::KIND,
            PolicyScope::Clusterwide => CiliumClusterwideNetworkPolicy::KIND,
        }
    }

    /// `namespace/name` or `name`
    pub fn qualify(&self, name: &str) -> String {
        match self {
            PolicyScope::Namespaced(ns) => format!("{ns}/{name}"),
            PolicyScope::Clusterwide => name.to_string(),
        }
    }
}

/// Identity of a source policy instance
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PolicyIdentity {
    /// Namespace or clusterwide
    pub scope: PolicyScope,
    /// Object name
    pub name: String,
    /// Object UID; a recreated policy gets a new one
    pub uid: String,
}

impl PolicyIdentity {
    /// Create an identity
    pub fn new(scope: PolicyScope, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Name of the derivative generated from this policy instance
    pub fn derivative_name(&self) -> String {
        derivative_name(&self.name, &self.uid)
    }

    /// Serialization key: the derivative's qualified name
    pub fn key(&self) -> String {
        self.scope.qualify(&self.derivative_name())
    }

    /// Reference for events and owner references
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(CILIUM_API_VERSION.to_string()),
            kind: Some(self.scope.kind().to_string()),
            name: Some(self.name.clone()),
            namespace: self.scope.namespace().map(str::to_string),
            uid: Some(self.uid.clone()),
            ..Default::default()
        }
    }

    fn from_meta(meta: &ObjectMeta, scope: PolicyScope) -> Result<Self> {
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::policy_derivation("policy has no name"))?;
        let uid = meta
            .uid
            .clone()
            .ok_or_else(|| Error::policy_derivation("policy has no uid").in_policy(&name))?;
        Ok(Self { scope, name, uid })
    }
}

impl fmt::Display for PolicyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scope.qualify(&self.name))
    }
}

/// `<name>-togroups-<uid>`
pub fn derivative_name(name: &str, uid: &str) -> String {
    format!("{name}-{DERIVATIVE_INFIX}-{uid}")
}

// =============================================================================
// Rule-sets
// =============================================================================

/// Rule-sets of a policy: `spec` when there is exactly one, `specs` otherwise
#[derive(Clone, Debug, PartialEq)]
pub enum RuleSets {
    /// Exactly one rule-set
    Single(Rule),
    /// Zero or more than one rule-set, in order
    Multi(Vec<Rule>),
}

impl RuleSets {
    /// Combine the wire `spec` and `specs` fields (spec first)
    ///
    /// Returns None when the policy carries no rule-set at all.
    pub fn from_parts(spec: Option<Rule>, specs: Option<Vec<Rule>>) -> Option<Self> {
        let mut rules: Vec<Rule> = spec.into_iter().collect();
        rules.extend(specs.unwrap_or_default());
        if rules.is_empty() {
            None
        } else {
            Some(Self::from_rules(rules))
        }
    }

    /// Single for one rule-set, Multi otherwise
    pub fn from_rules(mut rules: Vec<Rule>) -> Self {
        if rules.len() == 1 {
            if let Some(rule) = rules.pop() {
                return RuleSets::Single(rule);
            }
        }
        RuleSets::Multi(rules)
    }

    /// Split back into the wire `spec` / `specs` fields
    pub fn into_parts(self) -> (Option<Rule>, Option<Vec<Rule>>) {
        match self {
            RuleSets::Single(rule) => (Some(rule), None),
            RuleSets::Multi(rules) => (None, Some(rules)),
        }
    }

    /// Number of rule-sets
    pub fn len(&self) -> usize {
        match self {
            RuleSets::Single(_) => 1,
            RuleSets::Multi(rules) => rules.len(),
        }
    }

    /// True if there are no rule-sets
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rule-sets in order
    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        match self {
            RuleSets::Single(rule) => std::slice::from_ref(rule).iter(),
            RuleSets::Multi(rules) => rules.iter(),
        }
    }

    /// True if any rule-set references an external group
    pub fn has_group_references(&self) -> bool {
        self.iter().any(Rule::has_group_references)
    }
}

// =============================================================================
// Source policy
// =============================================================================

/// A user-authored policy that may reference external groups
#[derive(Clone, Debug, PartialEq)]
pub struct SourcePolicy {
    /// Identity of this policy instance
    pub identity: PolicyIdentity,
    /// Rule-sets as authored
    pub rule_sets: RuleSets,
    /// Status recorded for this policy's derivative, if any
    pub derivative_status: Option<DerivativeStatus>,
}

impl SourcePolicy {
    fn from_parts(
        identity: PolicyIdentity,
        spec: Option<&Rule>,
        specs: Option<&Vec<Rule>>,
        status: Option<&togroups_common::crd::PolicyStatus>,
    ) -> Result<Self> {
        let rule_sets = RuleSets::from_parts(spec.cloned(), specs.cloned()).ok_or_else(|| {
            Error::policy_derivation_for(identity.to_string(), "neither spec nor specs is set")
        })?;
        let derivative_status = status
            .and_then(|s| s.derivative_policies.get(&identity.derivative_name()))
            .cloned();
        Ok(Self {
            identity,
            rule_sets,
            derivative_status,
        })
    }
}

/// A Cilium policy kind the controller derives from
pub trait DerivationSource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    /// Identity of this object
    fn identity(&self) -> Result<PolicyIdentity>;

    /// Convert to the derivation model
    fn to_source(&self) -> Result<SourcePolicy>;

    /// True for derivatives, which must never be derived from again
    fn is_derivative(&self) -> bool {
        self.meta()
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(PARENT_UID_LABEL))
    }
}

impl DerivationSource for CiliumNetworkPolicy {
    fn identity(&self) -> Result<PolicyIdentity> {
        let namespace = self.metadata.namespace.clone().ok_or_else(|| {
            Error::policy_derivation("CiliumNetworkPolicy has no namespace")
                .in_policy(self.metadata.name.as_deref().unwrap_or_default())
        })?;
        PolicyIdentity::from_meta(&self.metadata, PolicyScope::Namespaced(namespace))
    }

    fn to_source(&self) -> Result<SourcePolicy> {
        SourcePolicy::from_parts(
            self.identity()?,
            self.spec.as_ref(),
            self.specs.as_ref(),
            self.status.as_ref(),
        )
    }
}

impl DerivationSource for CiliumClusterwideNetworkPolicy {
    fn identity(&self) -> Result<PolicyIdentity> {
        PolicyIdentity::from_meta(&self.metadata, PolicyScope::Clusterwide)
    }

    fn to_source(&self) -> Result<SourcePolicy> {
        SourcePolicy::from_parts(
            self.identity()?,
            self.spec.as_ref(),
            self.specs.as_ref(),
            self.status.as_ref(),
        )
    }
}

// =============================================================================
// Derivative policy
// =============================================================================

/// Address-only policy generated from a source policy
#[derive(Clone, Debug, PartialEq)]
pub struct DerivativePolicy {
    /// Source this derivative belongs to
    pub parent: PolicyIdentity,
    /// Rule-sets with every group reference replaced by addresses
    pub rule_sets: RuleSets,
}

impl DerivativePolicy {
    /// Create a derivative for `parent`
    pub fn new(parent: PolicyIdentity, rule_sets: RuleSets) -> Self {
        Self { parent, rule_sets }
    }

    /// Object name
    pub fn name(&self) -> String {
        self.parent.derivative_name()
    }

    /// Same scope as the parent
    pub fn scope(&self) -> &PolicyScope {
        &self.parent.scope
    }

    /// Metadata with parent label and owner reference
    pub fn metadata(&self) -> ObjectMeta {
        let labels = BTreeMap::from([
            (PARENT_UID_LABEL.to_string(), self.parent.uid.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ]);
        ObjectMeta {
            name: Some(self.name()),
            namespace: self.scope().namespace().map(str::to_string),
            labels: Some(labels),
            owner_references: Some(vec![OwnerReference {
                api_version: CILIUM_API_VERSION.to_string(),
                kind: self.scope().kind().to_string(),
                name: self.parent.name.clone(),
                uid: self.parent.uid.clone(),
                controller: Some(true),
                block_owner_deletion: None,
            }]),
            ..Default::default()
        }
    }

    /// Namespaced wire object
    pub fn to_cnp(&self) -> CiliumNetworkPolicy {
        let (spec, specs) = self.rule_sets.clone().into_parts();
        CiliumNetworkPolicy::new(self.metadata(), spec, specs)
    }

    /// Clusterwide wire object
    pub fn to_ccnp(&self) -> CiliumClusterwideNetworkPolicy {
        let (spec, specs) = self.rule_sets.clone().into_parts();
        CiliumClusterwideNetworkPolicy::new(self.metadata(), spec, specs)
    }
}

/// A derivative as currently stored
#[derive(Clone, Debug, PartialEq)]
pub struct StoredDerivative {
    /// Object name
    pub name: String,
    /// Namespace or clusterwide
    pub scope: PolicyScope,
    /// Value of the parent UID label
    pub parent_uid: Option<String>,
    /// Whether this operator manages it
    pub managed: bool,
    /// Stored rule-sets, None if the object had neither spec nor specs
    pub rule_sets: Option<RuleSets>,
    /// Version for optimistic concurrency
    pub resource_version: Option<String>,
}

impl StoredDerivative {
    fn from_parts(
        meta: &ObjectMeta,
        scope: PolicyScope,
        spec: Option<Rule>,
        specs: Option<Vec<Rule>>,
    ) -> Self {
        let labels = meta.labels.as_ref();
        Self {
            name: meta.name.clone().unwrap_or_default(),
            scope,
            parent_uid: labels.and_then(|l| l.get(PARENT_UID_LABEL).cloned()),
            managed: labels
                .and_then(|l| l.get(MANAGED_BY_LABEL))
                .is_some_and(|v| v == MANAGED_BY_VALUE),
            rule_sets: RuleSets::from_parts(spec, specs),
            resource_version: meta.resource_version.clone(),
        }
    }

    /// Read a stored namespaced derivative
    pub fn from_cnp(cnp: CiliumNetworkPolicy) -> Self {
        let scope = PolicyScope::Namespaced(cnp.metadata.namespace.clone().unwrap_or_default());
        Self::from_parts(&cnp.metadata, scope, cnp.spec, cnp.specs)
    }

    /// Read a stored clusterwide derivative
    pub fn from_ccnp(ccnp: CiliumClusterwideNetworkPolicy) -> Self {
        Self::from_parts(&ccnp.metadata, PolicyScope::Clusterwide, ccnp.spec, ccnp.specs)
    }

    /// True if the stored object already says what `desired` says
    pub fn matches(&self, desired: &DerivativePolicy) -> bool {
        self.name == desired.name()
            && &self.scope == desired.scope()
            && self.parent_uid.as_deref() == Some(desired.parent.uid.as_str())
            && self.managed
            && self.rule_sets.as_ref() == Some(&desired.rule_sets)
    }

    /// Qualified name, used as the serialization key
    pub fn key(&self) -> String {
        self.scope.qualify(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use togroups_common::crd::{EgressRule, EndpointSelector, PortProtocol, PortRule};

    fn rule(label: &str) -> Rule {
        Rule {
            endpoint_selector: Some(EndpointSelector::from_labels([(label, "true")])),
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

    fn cnp(spec: Option<Rule>, specs: Option<Vec<Rule>>) -> CiliumNetworkPolicy {
        CiliumNetworkPolicy::new(
            ObjectMeta {
                name: Some("test".to_string()),
                namespace: Some("testns".to_string()),
                uid: Some("123".to_string()),
                ..Default::default()
            },
            spec,
            specs,
        )
    }

    #[test]
    fn derivative_name_joins_name_and_uid() {
        let id = PolicyIdentity::new(PolicyScope::Namespaced("testns".into()), "test", "123");
        assert_eq!(id.derivative_name(), "test-togroups-123");
        assert_eq!(id.key(), "testns/test-togroups-123");
        assert_eq!(id.to_string(), "testns/test");

        let id = PolicyIdentity::new(PolicyScope::Clusterwide, "ccnp-test", "456");
        assert_eq!(id.derivative_name(), "ccnp-test-togroups-456");
        assert_eq!(id.key(), "ccnp-test-togroups-456");
    }

    #[test]
    fn rule_sets_normalize_to_single_for_one_entry() {
        assert!(RuleSets::from_parts(None, None).is_none());
        assert!(RuleSets::from_parts(None, Some(vec![])).is_none());

        let single = RuleSets::from_parts(Some(rule("a")), None).unwrap();
        assert_eq!(single, RuleSets::Single(rule("a")));

        let from_specs = RuleSets::from_parts(None, Some(vec![rule("a")])).unwrap();
        assert_eq!(from_specs, RuleSets::Single(rule("a")));

        let both = RuleSets::from_parts(Some(rule("a")), Some(vec![rule("b"), rule("c")])).unwrap();
        assert_eq!(both.len(), 3);
        let labels: Vec<_> = both
            .iter()
            .map(|r| r.endpoint_selector.as_ref().unwrap().match_labels.keys().next().unwrap().clone())
            .collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
    }

    #[test]
    fn into_parts_uses_spec_or_specs() {
        let (spec, specs) = RuleSets::Single(rule("a")).into_parts();
        assert!(spec.is_some() && specs.is_none());

        let (spec, specs) = RuleSets::Multi(vec![rule("a"), rule("b")]).into_parts();
        assert!(spec.is_none());
        assert_eq!(specs.map(|s| s.len()), Some(2));
    }

    #[test]
    fn source_requires_spec_or_specs() {
        let err = cnp(None, None).to_source().unwrap_err();
        assert!(matches!(err, Error::PolicyDerivation { .. }));
        assert!(err.to_string().contains("testns/test"));
    }

    #[test]
    fn source_reads_identity_and_own_status_entry() {
        let mut policy = cnp(Some(rule("a")), None);
        let mut status = togroups_common::crd::PolicyStatus::default();
        status
            .derivative_policies
            .insert("test-togroups-123".into(), DerivativeStatus::failed("boom"));
        status
            .derivative_policies
            .insert("test-togroups-old".into(), DerivativeStatus::succeeded());
        policy.status = Some(status);

        let source = policy.to_source().unwrap();
        assert_eq!(
            source.identity,
            PolicyIdentity::new(PolicyScope::Namespaced("testns".into()), "test", "123")
        );
        assert_eq!(source.derivative_status.unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn cnp_without_namespace_is_rejected() {
        let mut policy = cnp(Some(rule("a")), None);
        policy.metadata.namespace = None;
        assert!(policy.identity().is_err());
    }

    #[test]
    fn derivatives_are_recognised_by_parent_label() {
        let derivative = DerivativePolicy::new(
            PolicyIdentity::new(PolicyScope::Namespaced("testns".into()), "test", "123"),
            RuleSets::Single(rule("a")),
        );
        assert!(derivative.to_cnp().is_derivative());
        assert!(!cnp(Some(rule("a")), None).is_derivative());
    }

    #[test]
    fn derivative_metadata_points_at_parent() {
        let derivative = DerivativePolicy::new(
            PolicyIdentity::new(PolicyScope::Clusterwide, "ccnp-test", "456"),
            RuleSets::Multi(vec![rule("a"), rule("b")]),
        );
        let ccnp = derivative.to_ccnp();

        assert_eq!(ccnp.metadata.name.as_deref(), Some("ccnp-test-togroups-456"));
        assert!(ccnp.metadata.namespace.is_none());
        let labels = ccnp.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[PARENT_UID_LABEL], "456");
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        let owner = &ccnp.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "CiliumClusterwideNetworkPolicy");
        assert_eq!(owner.uid, "456");
        assert!(ccnp.spec.is_none());
        assert_eq!(ccnp.specs.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn stored_derivative_matches_only_same_content() {
        let desired = DerivativePolicy::new(
            PolicyIdentity::new(PolicyScope::Namespaced("testns".into()), "test", "123"),
            RuleSets::Single(rule("a")),
        );
        let mut stored_obj = desired.to_cnp();
        stored_obj.metadata.resource_version = Some("7".into());

        let stored = StoredDerivative::from_cnp(stored_obj.clone());
        assert!(stored.matches(&desired));
        assert_eq!(stored.resource_version.as_deref(), Some("7"));

        stored_obj.spec = Some(rule("b"));
        assert!(!StoredDerivative::from_cnp(stored_obj.clone()).matches(&desired));

        stored_obj.spec = Some(rule("a"));
        stored_obj.metadata.labels = None;
        assert!(!StoredDerivative::from_cnp(stored_obj).matches(&desired));
    }
}
