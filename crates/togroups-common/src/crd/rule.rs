//! Cilium policy rule types
//!
//! Only the fields derivation reads or rewrites are typed. Everything else
//! (deny rules, L7 rules, selectors we never inspect) lands in the flattened
//! `extra` map of the enclosing struct and is written back verbatim, so a
//! derivative never loses semantics of its source.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields not modelled explicitly, preserved as-is
pub type Extra = BTreeMap<String, Value>;

/// One Cilium policy rule-set (the `spec` of a CiliumNetworkPolicy, or one entry of `specs`)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Endpoints the rule-set applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_selector: Option<EndpointSelector>,
    /// Ingress rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<IngressRule>,
    /// Egress rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<EgressRule>,
    /// Unmodelled fields (nodeSelector, ingressDeny, egressDeny, labels, ...)
    #[serde(flatten)]
    pub extra: Extra,
}

impl Rule {
    /// True if any ingress or egress rule references an external group
    pub fn has_group_references(&self) -> bool {
        self.egress.iter().any(|r| !r.to_groups.is_empty())
            || self.ingress.iter().any(|r| !r.from_groups.is_empty())
    }
}

/// Endpoint selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSelector {
    /// Match labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// matchExpressions and friends
    #[serde(flatten)]
    pub extra: Extra,
}

impl EndpointSelector {
    /// Selector matching the given labels
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            extra: Extra::new(),
        }
    }
}

/// Cilium egress rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    /// L4 port constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<PortRule>,
    /// Destination CIDRs
    #[serde(rename = "toCIDR", default, skip_serializing_if = "Vec::is_empty")]
    pub to_cidr: Vec<String>,
    /// Destination CIDR rules with exceptions
    #[serde(rename = "toCIDRSet", default, skip_serializing_if = "Vec::is_empty")]
    pub to_cidr_set: Vec<CidrRule>,
    /// External groups whose members are allowed destinations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_groups: Vec<Groups>,
    /// toEndpoints, toEntities, toFQDNs, toServices, ...
    #[serde(flatten)]
    pub extra: Extra,
}

impl EgressRule {
    /// True if the rule names any destination, typed or pass-through
    ///
    /// A rule with ports but no destination allows every peer, so callers
    /// must check this before emitting a rule they emptied.
    pub fn has_peers(&self) -> bool {
        !self.to_cidr.is_empty()
            || !self.to_cidr_set.is_empty()
            || !self.to_groups.is_empty()
            || EGRESS_PEER_FIELDS.iter().any(|f| self.extra.contains_key(*f))
    }
}

/// Pass-through egress fields that select destinations
const EGRESS_PEER_FIELDS: &[&str] = &[
    "toEndpoints",
    "toEntities",
    "toFQDNs",
    "toServices",
    "toNodes",
];

/// Cilium ingress rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// L4 port constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<PortRule>,
    /// Source CIDRs
    #[serde(rename = "fromCIDR", default, skip_serializing_if = "Vec::is_empty")]
    pub from_cidr: Vec<String>,
    /// Source CIDR rules with exceptions
    #[serde(rename = "fromCIDRSet", default, skip_serializing_if = "Vec::is_empty")]
    pub from_cidr_set: Vec<CidrRule>,
    /// External groups whose members are allowed sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_groups: Vec<Groups>,
    /// fromEndpoints, fromEntities, icmps, ...
    #[serde(flatten)]
    pub extra: Extra,
}

impl IngressRule {
    /// True if the rule names any source; see [`EgressRule::has_peers`]
    pub fn has_peers(&self) -> bool {
        !self.from_cidr.is_empty()
            || !self.from_cidr_set.is_empty()
            || !self.from_groups.is_empty()
            || INGRESS_PEER_FIELDS.iter().any(|f| self.extra.contains_key(*f))
    }
}

/// Pass-through ingress fields that select sources
const INGRESS_PEER_FIELDS: &[&str] = &["fromEndpoints", "fromEntities", "fromNodes"];

/// CIDR rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CidrRule {
    /// CIDR prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    /// Excluded sub-prefixes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
    /// cidrGroupRef, cidrGroupSelector
    #[serde(flatten)]
    pub extra: Extra,
}

impl CidrRule {
    /// Single-host prefix for an address (`/32` for IPv4, `/128` for IPv6)
    pub fn host(addr: IpAddr) -> Self {
        let bits = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            cidr: Some(format!("{addr}/{bits}")),
            except: Vec::new(),
            extra: Extra::new(),
        }
    }
}

/// L4 port rule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortProtocol>,
    /// L7 rules, TLS contexts, ...
    #[serde(flatten)]
    pub extra: Extra,
}

/// Port and protocol
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortProtocol {
    /// Port number or name
    pub port: String,
    /// Protocol (TCP, UDP, SCTP, ANY)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// endPort
    #[serde(flatten)]
    pub extra: Extra,
}

impl PortProtocol {
    /// TCP port
    pub fn tcp(port: u16) -> Self {
        Self {
            port: port.to_string(),
            protocol: Some("TCP".to_string()),
            extra: Extra::new(),
        }
    }
}

/// One `toGroups`/`fromGroups` entry
///
/// Exactly one provider member is expected to be set.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Groups {
    /// AWS security-group selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsGroup>,
    /// Provider members this build does not understand
    #[serde(flatten)]
    pub extra: Extra,
}

/// AWS group selection criteria
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AwsGroup {
    /// Instance tags that must all match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Security group IDs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups_ids: Vec<String>,
    /// Security group names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups_names: Vec<String>,
    /// AWS region; empty means the provider's default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_cilium_egress_with_groups() {
        let rule: Rule = serde_json::from_value(json!({
            "endpointSelector": {"matchLabels": {"test": "true"}},
            "egress": [{
                "toPorts": [{"ports": [{"port": "5555", "protocol": "TCP"}]}],
                "toGroups": [{"aws": {
                    "labels": {"test": "a"},
                    "securityGroupsIds": ["sg-1"],
                    "region": "us-east-1"
                }}]
            }]
        }))
        .unwrap();

        assert!(rule.has_group_references());
        let aws = rule.egress[0].to_groups[0].aws.as_ref().unwrap();
        assert_eq!(aws.labels.get("test").map(String::as_str), Some("a"));
        assert_eq!(aws.security_groups_ids, vec!["sg-1"]);
        assert_eq!(aws.region, "us-east-1");
        assert_eq!(rule.egress[0].to_ports[0].ports[0].port, "5555");
    }

    /// Unmodelled fields survive a parse/serialize cycle untouched
    #[test]
    fn unknown_fields_are_preserved() {
        let source = json!({
            "endpointSelector": {
                "matchLabels": {"app": "web"},
                "matchExpressions": [{"key": "tier", "operator": "Exists"}]
            },
            "egressDeny": [{"toEntities": ["world"]}],
            "egress": [{
                "toEndpoints": [{"matchLabels": {"app": "db"}}],
                "toPorts": [{
                    "ports": [{"port": "80", "protocol": "TCP", "endPort": 90}],
                    "rules": {"http": [{"method": "GET"}]}
                }],
                "toCIDRSet": [{"cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"]}]
            }],
            "ingress": [{"fromEntities": ["cluster"]}]
        });

        let rule: Rule = serde_json::from_value(source.clone()).unwrap();
        assert!(!rule.has_group_references());
        assert!(rule.extra.contains_key("egressDeny"));
        assert_eq!(serde_json::to_value(&rule).unwrap(), source);
    }

    #[test]
    fn ingress_from_groups_count_as_references() {
        let rule: Rule = serde_json::from_value(json!({
            "ingress": [{"fromGroups": [{"aws": {"securityGroupsNames": ["web"]}}]}]
        }))
        .unwrap();
        assert!(rule.has_group_references());
    }

    #[test]
    fn host_cidr_uses_family_prefix() {
        let v4 = CidrRule::host("192.168.1.1".parse().unwrap());
        assert_eq!(v4.cidr.as_deref(), Some("192.168.1.1/32"));

        let v6 = CidrRule::host("fd00::1".parse().unwrap());
        assert_eq!(v6.cidr.as_deref(), Some("fd00::1/128"));
    }

    #[test]
    fn peers_include_pass_through_selectors() {
        let ports_only: EgressRule = serde_json::from_value(json!({
            "toPorts": [{"ports": [{"port": "5555", "protocol": "TCP"}]}]
        }))
        .unwrap();
        assert!(!ports_only.has_peers());

        let fqdn: EgressRule =
            serde_json::from_value(json!({"toFQDNs": [{"matchName": "example.com"}]})).unwrap();
        assert!(fqdn.has_peers());

        let cidr: EgressRule = serde_json::from_value(json!({"toCIDR": ["10.0.0.0/8"]})).unwrap();
        assert!(cidr.has_peers());

        let icmp_only: IngressRule =
            serde_json::from_value(json!({"icmps": [{"fields": [{"type": 8}]}]})).unwrap();
        assert!(!icmp_only.has_peers());

        let entities: IngressRule =
            serde_json::from_value(json!({"fromEntities": ["cluster"]})).unwrap();
        assert!(entities.has_peers());
    }

    #[test]
    fn empty_egress_rule_serializes_to_empty_object() {
        let value = serde_json::to_value(EgressRule::default()).unwrap();
        assert_eq!(value, json!({}));
    }
}
