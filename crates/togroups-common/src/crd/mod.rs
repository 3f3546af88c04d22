//! Cilium policy resources and the rule types derivation operates on

mod policy;
mod rule;

pub use policy::{
    CiliumClusterwideNetworkPolicy, CiliumNetworkPolicy, DerivativeStatus, PolicyStatus,
    CILIUM_API_VERSION,
};
pub use rule::{
    AwsGroup, CidrRule, EgressRule, EndpointSelector, Extra, Groups, IngressRule, PortProtocol,
    PortRule, Rule,
};
