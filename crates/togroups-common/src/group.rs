//! Typed group references
//!
//! The wire form (`Groups`) is an object with one optional member per
//! provider. Derivation works on [`GroupReference`], where exactly one
//! provider is selected and the provider kind is explicit.

use std::fmt;

use crate::crd::{AwsGroup, Groups};
use crate::Error;

/// Provider kinds a group reference can name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    /// AWS security groups and instance tags
    Aws,
}

impl ProviderKind {
    /// Label value used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to externally managed group membership
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GroupReference {
    /// AWS selection criteria
    Aws(AwsGroup),
}

impl GroupReference {
    /// Provider kind responsible for resolving this reference
    pub fn kind(&self) -> ProviderKind {
        match self {
            GroupReference::Aws(_) => ProviderKind::Aws,
        }
    }
}

impl TryFrom<&Groups> for GroupReference {
    type Error = Error;

    fn try_from(groups: &Groups) -> Result<Self, Self::Error> {
        if !groups.extra.is_empty() {
            let names: Vec<&str> = groups.extra.keys().map(String::as_str).collect();
            return Err(Error::policy_derivation(format!(
                "unsupported group provider {}",
                names.join(", ")
            )));
        }
        match &groups.aws {
            Some(aws) => Ok(GroupReference::Aws(aws.clone())),
            None => Err(Error::policy_derivation(
                "group reference does not name a provider",
            )),
        }
    }
}
