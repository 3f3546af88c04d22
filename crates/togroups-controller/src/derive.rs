//! Derivative rule builder and policy assembler
//!
//! Every rule that references external groups is rewritten into one that
//! names the groups' current addresses instead. Rules without group
//! references are copied verbatim, and any resolution failure aborts the
//! whole policy so a derivative is never built from a partial view.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use togroups_common::crd::{CidrRule, EgressRule, Groups, IngressRule, Rule};
use togroups_common::{GroupReference, Result};
use togroups_provider::{GroupResolver, ResolvedAddressSet};

use crate::model::{DerivativePolicy, RuleSets, SourcePolicy};

/// Result of assembling a derivative
#[derive(Clone, Debug, PartialEq)]
pub enum Derivation {
    /// The source references no groups; no derivative should exist
    NotNeeded,
    /// The derivative to store
    Derived(DerivativePolicy),
}

/// Builds derivative policies from source policies
pub struct DerivativeBuilder {
    resolver: Arc<GroupResolver>,
}

impl DerivativeBuilder {
    /// Create a builder resolving through `resolver`
    pub fn new(resolver: Arc<GroupResolver>) -> Self {
        Self { resolver }
    }

    /// Assemble the derivative for `source`
    ///
    /// Returns [`Derivation::NotNeeded`] when no rule anywhere references a
    /// group. The derivative has one rule-set per source rule-set, in order.
    #[instrument(skip(self, source, cancel), fields(policy = %source.identity))]
    pub async fn build(
        &self,
        source: &SourcePolicy,
        cancel: &CancellationToken,
    ) -> Result<Derivation> {
        if !source.rule_sets.has_group_references() {
            debug!("No group references, derivative not needed");
            return Ok(Derivation::NotNeeded);
        }

        let policy = source.identity.to_string();
        let mut derived = Vec::with_capacity(source.rule_sets.len());
        for rule in source.rule_sets.iter() {
            derived.push(self.derive_rule_set(&policy, rule, cancel).await?);
        }

        let derivative = DerivativePolicy::new(source.identity.clone(), RuleSets::from_rules(derived));
        debug!(
            derivative = %derivative.name(),
            rule_sets = derivative.rule_sets.len(),
            "Derivative assembled"
        );
        Ok(Derivation::Derived(derivative))
    }

    async fn derive_rule_set(
        &self,
        policy: &str,
        rule: &Rule,
        cancel: &CancellationToken,
    ) -> Result<Rule> {
        let mut egress = Vec::with_capacity(rule.egress.len());
        for r in &rule.egress {
            egress.push(self.derive_egress(policy, r, cancel).await?);
        }
        let mut ingress = Vec::with_capacity(rule.ingress.len());
        for r in &rule.ingress {
            ingress.push(self.derive_ingress(policy, r, cancel).await?);
        }
        Ok(Rule {
            egress,
            ingress,
            ..rule.clone()
        })
    }

    /// Rewrite one egress rule
    ///
    /// Groups are replaced by host CIDRs; ports and other destinations are
    /// kept. If the groups were the only destinations and they resolve to no
    /// addresses, the result is an empty rule: it names no peer and so
    /// allows nothing, where the ports alone would allow every peer.
    pub async fn derive_egress(
        &self,
        policy: &str,
        rule: &EgressRule,
        cancel: &CancellationToken,
    ) -> Result<EgressRule> {
        if rule.to_groups.is_empty() {
            return Ok(rule.clone());
        }
        let resolved = self.resolve_all(policy, &rule.to_groups, cancel).await?;

        let mut derived = rule.clone();
        derived.to_groups.clear();
        merge_host_cidrs(&mut derived.to_cidr_set, &resolved);
        if !derived.has_peers() {
            return Ok(EgressRule::default());
        }
        Ok(derived)
    }

    /// Rewrite one ingress rule; same rules as [`Self::derive_egress`]
    pub async fn derive_ingress(
        &self,
        policy: &str,
        rule: &IngressRule,
        cancel: &CancellationToken,
    ) -> Result<IngressRule> {
        if rule.from_groups.is_empty() {
            return Ok(rule.clone());
        }
        let resolved = self.resolve_all(policy, &rule.from_groups, cancel).await?;

        let mut derived = rule.clone();
        derived.from_groups.clear();
        merge_host_cidrs(&mut derived.from_cidr_set, &resolved);
        if !derived.has_peers() {
            return Ok(IngressRule::default());
        }
        Ok(derived)
    }

    /// Address sets behind every group, resolved in declaration order
    async fn resolve_all(
        &self,
        policy: &str,
        groups: &[Groups],
        cancel: &CancellationToken,
    ) -> Result<Vec<ResolvedAddressSet>> {
        let mut resolved = Vec::with_capacity(groups.len());
        for entry in groups {
            let group = GroupReference::try_from(entry).map_err(|e| e.in_policy(policy))?;
            let set = self.resolver.resolve(&group, cancel).await?;
            debug!(
                provider = %group.kind(),
                addresses = set.addresses().len(),
                resolved_at = %set.resolved_at(),
                "Group resolved"
            );
            resolved.push(set);
        }
        Ok(resolved)
    }
}

/// Append a host CIDR per resolved address, skipping ones already present
fn merge_host_cidrs(cidr_set: &mut Vec<CidrRule>, resolved: &[ResolvedAddressSet]) {
    for host in resolved.iter().flat_map(|set| set.cidr_rules()) {
        if !cidr_set.contains(&host) {
            cidr_set.push(host);
        }
    }
}
