//! Policy store
//!
//! The reconciler reads sources and writes derivatives through the
//! [`PolicyStore`] trait so its lifecycle logic can be tested without an API
//! server. [`KubePolicyStore`] is the Kubernetes implementation; it picks the
//! CiliumNetworkPolicy or CiliumClusterwideNetworkPolicy API by scope.

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::debug;

use togroups_common::crd::{CiliumClusterwideNetworkPolicy, CiliumNetworkPolicy, DerivativeStatus};
use togroups_common::{Error, Result, PARENT_UID_LABEL};

use crate::model::{
    DerivationSource, DerivativePolicy, PolicyIdentity, PolicyScope, SourcePolicy,
    StoredDerivative,
};

/// Access to source policies and their derivatives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Current source policy with the identity's name and scope
    ///
    /// Returns the object even if its UID differs from `identity.uid`; callers
    /// decide what a recreated source means.
    async fn get_source(&self, identity: &PolicyIdentity) -> Result<Option<SourcePolicy>>;

    /// UIDs of every live source policy (derivatives excluded)
    async fn list_source_uids(&self) -> Result<Vec<String>>;

    /// Stored derivative, if any
    async fn get_derivative(&self, scope: &PolicyScope, name: &str)
        -> Result<Option<StoredDerivative>>;

    /// Create a derivative; fails with StoreConflict if it already exists
    async fn create_derivative(&self, policy: &DerivativePolicy) -> Result<()>;

    /// Replace a derivative, guarded by `resource_version`
    async fn replace_derivative(
        &self,
        policy: &DerivativePolicy,
        resource_version: &str,
    ) -> Result<()>;

    /// Delete a derivative; returns false if it did not exist
    async fn delete_derivative(&self, scope: &PolicyScope, name: &str) -> Result<bool>;

    /// Every stored object carrying the parent UID label
    async fn list_derivatives(&self) -> Result<Vec<StoredDerivative>>;

    /// Set (or with None, remove) the source's status entry for `derivative`
    async fn patch_source_status(
        &self,
        identity: &PolicyIdentity,
        derivative: &str,
        status: Option<DerivativeStatus>,
    ) -> Result<()>;
}

/// Kubernetes-backed store
pub struct KubePolicyStore {
    client: Client,
}

impl KubePolicyStore {
    /// Create a store over `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn cnp(&self, namespace: &str) -> Api<CiliumNetworkPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn ccnp(&self) -> Api<CiliumClusterwideNetworkPolicy> {
        Api::all(self.client.clone())
    }
}

/// 404 becomes None, other errors are classified for retry
fn found<T>(name: &str, result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(Error::from_store(name, e)),
    }
}

fn derivatives_selector() -> ListParams {
    ListParams::default().labels(PARENT_UID_LABEL)
}

fn sources_selector() -> ListParams {
    ListParams::default().labels(&format!("!{PARENT_UID_LABEL}"))
}

#[async_trait]
impl PolicyStore for KubePolicyStore {
    async fn get_source(&self, identity: &PolicyIdentity) -> Result<Option<SourcePolicy>> {
        let name = identity.name.as_str();
        let source = match &identity.scope {
            PolicyScope::Namespaced(ns) => {
                found(name, self.cnp(ns).get(name).await)?.map(|p| p.to_source())
            }
            PolicyScope::Clusterwide => {
                found(name, self.ccnp().get(name).await)?.map(|p| p.to_source())
            }
        };
        source.transpose()
    }

    async fn list_source_uids(&self) -> Result<Vec<String>> {
        let lp = sources_selector();
        let cnps = Api::<CiliumNetworkPolicy>::all(self.client.clone())
            .list(&lp)
            .await
            .map_err(|e| Error::from_store("ciliumnetworkpolicies", e))?;
        let ccnps = self
            .ccnp()
            .list(&lp)
            .await
            .map_err(|e| Error::from_store("ciliumclusterwidenetworkpolicies", e))?;

        Ok(cnps
            .items
            .into_iter()
            .filter_map(|p| p.metadata.uid)
            .chain(ccnps.items.into_iter().filter_map(|p| p.metadata.uid))
            .collect())
    }

    async fn get_derivative(
        &self,
        scope: &PolicyScope,
        name: &str,
    ) -> Result<Option<StoredDerivative>> {
        Ok(match scope {
            PolicyScope::Namespaced(ns) => {
                found(name, self.cnp(ns).get(name).await)?.map(StoredDerivative::from_cnp)
            }
            PolicyScope::Clusterwide => {
                found(name, self.ccnp().get(name).await)?.map(StoredDerivative::from_ccnp)
            }
        })
    }

    async fn create_derivative(&self, policy: &DerivativePolicy) -> Result<()> {
        let name = policy.name();
        let pp = PostParams {
            field_manager: Some(togroups_common::FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let result = match policy.scope() {
            PolicyScope::Namespaced(ns) => self.cnp(ns).create(&pp, &policy.to_cnp()).await.map(drop),
            PolicyScope::Clusterwide => self.ccnp().create(&pp, &policy.to_ccnp()).await.map(drop),
        };
        result.map_err(|e| Error::from_store(&name, e))?;
        debug!(derivative = %name, "Derivative created");
        Ok(())
    }

    async fn replace_derivative(
        &self,
        policy: &DerivativePolicy,
        resource_version: &str,
    ) -> Result<()> {
        let name = policy.name();
        let pp = PostParams {
            field_manager: Some(togroups_common::FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let result = match policy.scope() {
            PolicyScope::Namespaced(ns) => {
                let mut obj = policy.to_cnp();
                obj.metadata.resource_version = Some(resource_version.to_string());
                self.cnp(ns).replace(&name, &pp, &obj).await.map(drop)
            }
            PolicyScope::Clusterwide => {
                let mut obj = policy.to_ccnp();
                obj.metadata.resource_version = Some(resource_version.to_string());
                self.ccnp().replace(&name, &pp, &obj).await.map(drop)
            }
        };
        result.map_err(|e| Error::from_store(&name, e))?;
        debug!(derivative = %name, "Derivative replaced");
        Ok(())
    }

    async fn delete_derivative(&self, scope: &PolicyScope, name: &str) -> Result<bool> {
        let dp = DeleteParams::default();
        let result = match scope {
            PolicyScope::Namespaced(ns) => self.cnp(ns).delete(name, &dp).await.map(drop),
            PolicyScope::Clusterwide => self.ccnp().delete(name, &dp).await.map(drop),
        };
        Ok(found(name, result)?.is_some())
    }

    async fn list_derivatives(&self) -> Result<Vec<StoredDerivative>> {
        let lp = derivatives_selector();
        let cnps = Api::<CiliumNetworkPolicy>::all(self.client.clone())
            .list(&lp)
            .await
            .map_err(|e| Error::from_store("ciliumnetworkpolicies", e))?;
        let ccnps = self
            .ccnp()
            .list(&lp)
            .await
            .map_err(|e| Error::from_store("ciliumclusterwidenetworkpolicies", e))?;

        Ok(cnps
            .items
            .into_iter()
            .map(StoredDerivative::from_cnp)
            .chain(ccnps.items.into_iter().map(StoredDerivative::from_ccnp))
            .collect())
    }

    async fn patch_source_status(
        &self,
        identity: &PolicyIdentity,
        derivative: &str,
        status: Option<DerivativeStatus>,
    ) -> Result<()> {
        // A null entry removes the key under merge-patch semantics
        let patch = json!({
            "status": {
                "derivativePolicies": {
                    derivative: status
                }
            }
        });
        let pp = PatchParams::default();
        let name = identity.name.as_str();
        let result = match &identity.scope {
            PolicyScope::Namespaced(ns) => self
                .cnp(ns)
                .patch_status(name, &pp, &Patch::Merge(&patch))
                .await
                .map(drop),
            PolicyScope::Clusterwide => self
                .ccnp()
                .patch_status(name, &pp, &Patch::Merge(&patch))
                .await
                .map(drop),
        };
        // Source already gone: nothing to record
        found(name, result).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn not_found_is_absent() {
        let r: Result<Option<()>> = found("x", Err(api_error(404)));
        assert!(matches!(r, Ok(None)));
    }

    #[test]
    fn conflict_is_classified() {
        let r: Result<Option<()>> = found("x", Err(api_error(409)));
        assert!(r.unwrap_err().is_conflict());
    }

    #[test]
    fn selectors_split_sources_from_derivatives() {
        assert_eq!(
            derivatives_selector().label_selector.as_deref(),
            Some(PARENT_UID_LABEL)
        );
        assert_eq!(
            sources_selector().label_selector.as_deref(),
            Some("!io.cilium.network.policy.parent.uuid")
        );
    }
}
