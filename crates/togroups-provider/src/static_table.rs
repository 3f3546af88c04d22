//! Static group table provider
//!
//! Serves AWS group references from a YAML file instead of the AWS API.
//! Useful for development clusters and for pinning membership during
//! incident response.
//!
//! ```yaml
//! groups:
//!   - labels: {team: payments}
//!     securityGroupsIds: [sg-0123]
//!     region: us-east-1
//!     addresses: [10.0.1.5, 10.0.1.6]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use togroups_common::crd::AwsGroup;
use togroups_common::{Error, GroupReference, Result};

use crate::registry::{GroupProvider, ProviderError};

/// One set of instances and the criteria that select it
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticGroupEntry {
    /// Instance tags
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Security group IDs the instances belong to
    #[serde(default)]
    pub security_groups_ids: Vec<String>,
    /// Security group names the instances belong to
    #[serde(default)]
    pub security_groups_names: Vec<String>,
    /// Region of the instances
    #[serde(default)]
    pub region: String,
    /// Addresses of the instances
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

impl StaticGroupEntry {
    /// Whether `group` selects this entry
    ///
    /// Every criterion the group sets must hold: its labels are a subset of
    /// the entry's, it shares at least one security group ID and one name
    /// when those lists are given, and the region matches when set. A group
    /// with no labels, IDs or names selects nothing; the region only narrows.
    fn matches(&self, group: &AwsGroup) -> bool {
        if group.labels.is_empty()
            && group.security_groups_ids.is_empty()
            && group.security_groups_names.is_empty()
        {
            return false;
        }
        let labels = group
            .labels
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v));
        let ids = group.security_groups_ids.is_empty()
            || group
                .security_groups_ids
                .iter()
                .any(|id| self.security_groups_ids.contains(id));
        let names = group.security_groups_names.is_empty()
            || group
                .security_groups_names
                .iter()
                .any(|n| self.security_groups_names.contains(n));
        let region = group.region.is_empty() || group.region == self.region;
        labels && ids && names && region
    }
}

/// In-memory group membership table
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StaticGroupTable {
    #[serde(default)]
    groups: Vec<StaticGroupEntry>,
}

impl StaticGroupTable {
    /// Build a table from entries
    pub fn new(groups: Vec<StaticGroupEntry>) -> Self {
        Self { groups }
    }

    /// Parse a table from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for_kind("StaticGroupTable", e.to_string()))
    }

    /// Read and parse a YAML table from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::internal_with_context(
                "static-groups",
                format!("reading {}: {e}", path.display()),
            )
        })?;
        let table = Self::from_yaml(&yaml)?;
        info!(
            path = %path.display(),
            entries = table.groups.len(),
            "Loaded static group table"
        );
        Ok(table)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn lookup(&self, group: &AwsGroup) -> Vec<IpAddr> {
        let addresses: BTreeSet<IpAddr> = self
            .groups
            .iter()
            .filter(|entry| entry.matches(group))
            .flat_map(|entry| entry.addresses.iter().copied())
            .collect();
        addresses.into_iter().collect()
    }
}

#[async_trait]
impl GroupProvider for StaticGroupTable {
    async fn resolve(
        &self,
        group: &GroupReference,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<IpAddr>, ProviderError> {
        if cancel.is_cancelled() {
            return Err("cancelled".into());
        }
        match group {
            GroupReference::Aws(aws) => Ok(self.lookup(aws)),
        }
    }
}
