//! Keeps subnet connection binding maps in sync with binding resources.
//!
//! A binding connects one subnet to one or more parent subnets. Each parent
//! gets its own binding map, created beneath the parent subnet, and all maps
//! for a binding are written in a single PATCH.

use crate::{
    client::PolicyClient,
    error::Error,
    hierarchy,
    index::{self, Store, INDEX_CR_UID, INDEX_PARENT_PATH, INDEX_SUBNET_PATH, INDEX_VPC_PATH},
    model::SubnetConnectionBindingMap,
    search,
    service::{apply, diff, marked},
    tags,
};
use std::collections::BTreeSet;
use tracing::Instrument;

/// A request to connect `subnet_path` beneath each of `parent_subnet_paths`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetBinding {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub subnet_path: String,
    pub parent_subnet_paths: Vec<String>,
    pub vlan_traffic_tag: i64,
}

#[derive(Debug)]
pub struct SubnetBindingService<C> {
    client: C,
    cluster: String,
    store: Store<SubnetConnectionBindingMap>,
}

// === impl SubnetBinding ===

impl SubnetBinding {
    /// The binding maps this binding should produce, one per distinct parent
    /// subnet.
    pub fn binding_maps(&self, cluster: &str) -> Vec<SubnetConnectionBindingMap> {
        self.parent_subnet_paths
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|parent| {
                let id = tags::binding_map_id(&self.name, parent);
                SubnetConnectionBindingMap {
                    display_name: self.name.clone(),
                    subnet_path: self.subnet_path.clone(),
                    vlan_traffic_tag: self.vlan_traffic_tag,
                    tags: tags::binding_tags(cluster, &self.namespace, &self.name, &self.uid),
                    path: Some(format!("{parent}/subnet-connection-binding-maps/{id}")),
                    parent_path: Some(parent.clone()),
                    id,
                    revision: None,
                    marked_for_delete: false,
                }
            })
            .collect()
    }
}

// === impl SubnetBindingService ===

impl<C: PolicyClient> SubnetBindingService<C> {
    pub fn new(client: C, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
            store: index::binding_map_store(),
        }
    }

    pub fn store(&self) -> &Store<SubnetConnectionBindingMap> {
        &self.store
    }

    /// Loads every binding map owned by this cluster into the store.
    pub async fn initialize(&self) -> Result<usize, Error> {
        let query = search::query(
            "SubnetConnectionBindingMap",
            &self.cluster,
            tags::SCOPE_SUBNET_BINDING_CR_UID,
        );
        search::populate(&self.client, &self.store, &query).await
    }

    /// Creates, updates and deletes the maps of `binding` so that exactly one
    /// exists beneath each parent subnet.
    ///
    /// Returns true if a PATCH was sent.
    pub async fn apply_bindings(&self, binding: &SubnetBinding) -> Result<bool, Error> {
        let existing = self.store.get_by_index(INDEX_CR_UID, &binding.uid);
        let changes = diff(existing, binding.binding_maps(&self.cluster));
        if changes.is_empty() {
            tracing::debug!(uid = %binding.uid, "no changes");
            return Ok(false);
        }
        self.write(changes)
            .instrument(tracing::info_span!("apply_bindings", uid = %binding.uid))
            .await?;
        Ok(true)
    }

    /// Deletes every map owned by the binding with `cr_uid`.
    pub async fn delete_bindings_by_cr_uid(&self, cr_uid: &str) -> Result<bool, Error> {
        let maps = marked(self.store.get_by_index(INDEX_CR_UID, cr_uid));
        if maps.is_empty() {
            tracing::debug!(%cr_uid, "nothing to delete");
            return Ok(false);
        }
        self.write(maps)
            .instrument(tracing::info_span!("delete_bindings", %cr_uid))
            .await?;
        Ok(true)
    }

    /// Returns the maps that connect `subnet_path`.
    pub fn list_by_subnet_path(&self, subnet_path: &str) -> Vec<SubnetConnectionBindingMap> {
        self.store.get_by_index(INDEX_SUBNET_PATH, subnet_path)
    }

    /// Returns the maps created beneath the parent subnet `parent_path`.
    pub fn list_by_parent_path(&self, parent_path: &str) -> Vec<SubnetConnectionBindingMap> {
        self.store.get_by_index(INDEX_PARENT_PATH, parent_path)
    }

    pub fn list_by_vpc_path(&self, vpc_path: &str) -> Vec<SubnetConnectionBindingMap> {
        self.store.get_by_index(INDEX_VPC_PATH, vpc_path)
    }

    /// The UIDs of binding resources with cached maps.
    pub fn list_binding_cr_uids(&self) -> BTreeSet<String> {
        self.store.list_index_func_values(INDEX_CR_UID)
    }

    /// Deletes the maps of bindings that no longer exist.
    ///
    /// Every stale binding is attempted; the first failure is returned.
    pub async fn collect_garbage(
        &self,
        live_cr_uids: &BTreeSet<String>,
    ) -> Result<Vec<String>, Error> {
        let mut deleted = Vec::new();
        let mut first_error = None;
        for uid in self.list_binding_cr_uids() {
            if live_cr_uids.contains(&uid) {
                continue;
            }
            tracing::info!(%uid, "collecting garbage");
            match self.delete_bindings_by_cr_uid(&uid).await {
                Ok(_) => deleted.push(uid),
                Err(error) => {
                    tracing::warn!(%uid, %error, "failed to collect garbage");
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(deleted),
        }
    }

    /// Deletes every map beneath a VPC that is being removed.
    pub async fn cleanup_vpc_children(&self, vpc_path: &str) -> Result<usize, Error> {
        let maps = marked(self.list_by_vpc_path(vpc_path));
        let count = maps.len();
        if count == 0 {
            return Ok(0);
        }
        self.write(maps)
            .instrument(tracing::info_span!("cleanup_vpc", %vpc_path))
            .await?;
        Ok(count)
    }

    async fn write(&self, maps: Vec<SubnetConnectionBindingMap>) -> Result<(), Error> {
        tracing::info!(maps = maps.len(), "patching");
        let root = hierarchy::wrap_binding_maps(maps.clone())?;
        self.client.patch(&root, false).await?;
        for map in maps {
            apply(&self.store, map);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::Root, tests::FakeClient};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const VPC: &str = "/orgs/o1/projects/p1/vpcs/v1";

    fn binding(parents: &[&str]) -> SubnetBinding {
        SubnetBinding {
            namespace: "ns-0".to_string(),
            name: "bind".to_string(),
            uid: "uid-b".to_string(),
            subnet_path: format!("{VPC}/subnets/child"),
            parent_subnet_paths: parents.iter().map(|p| format!("{VPC}/subnets/{p}")).collect(),
            vlan_traffic_tag: 101,
        }
    }

    #[tokio::test]
    async fn apply_update_and_delete() {
        let client = Arc::new(FakeClient::default());
        let svc = SubnetBindingService::new(client.clone(), "test");

        assert!(svc.apply_bindings(&binding(&["s1", "s2"])).await.unwrap());
        assert_eq!(svc.list_by_subnet_path(&format!("{VPC}/subnets/child")).len(), 2);
        assert_eq!(svc.list_by_vpc_path(VPC).len(), 2);
        assert_eq!(client.patches().len(), 1);
        assert!(matches!(client.patches()[0], Root::OrgRoot { .. }));

        assert!(!svc.apply_bindings(&binding(&["s1", "s2"])).await.unwrap());
        assert_eq!(client.patches().len(), 1, "unchanged bindings are not patched");

        // Dropping a parent deletes its map.
        assert!(svc.apply_bindings(&binding(&["s1"])).await.unwrap());
        assert_eq!(svc.list_by_parent_path(&format!("{VPC}/subnets/s2")), vec![]);
        assert_eq!(svc.list_by_parent_path(&format!("{VPC}/subnets/s1")).len(), 1);

        assert!(svc.delete_bindings_by_cr_uid("uid-b").await.unwrap());
        assert!(svc.store().is_empty());
        assert!(!svc.delete_bindings_by_cr_uid("uid-b").await.unwrap());
    }

    #[test]
    fn repeated_parents_yield_one_map_each() {
        let maps = binding(&["s2", "s1", "s2"]).binding_maps("test");
        let parents = maps
            .iter()
            .map(|m| m.parent_path.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            parents,
            vec![format!("{VPC}/subnets/s1"), format!("{VPC}/subnets/s2")]
        );
        assert_ne!(maps[0].id, maps[1].id);
    }

    #[tokio::test]
    async fn failed_patch_leaves_store_untouched() {
        let client = Arc::new(FakeClient::default());
        let svc = SubnetBindingService::new(client.clone(), "test");
        client.fail_patches(true);
        assert!(svc.apply_bindings(&binding(&["s1"])).await.is_err());
        assert!(svc.store().is_empty());
    }

    #[tokio::test]
    async fn garbage_collection_and_vpc_cleanup() {
        let client = Arc::new(FakeClient::default());
        let svc = SubnetBindingService::new(client.clone(), "test");
        svc.apply_bindings(&binding(&["s1"])).await.unwrap();
        svc.apply_bindings(&SubnetBinding {
            name: "other".to_string(),
            uid: "uid-o".to_string(),
            ..binding(&["s1", "s2"])
        })
        .await
        .unwrap();

        let live = ["uid-b".to_string()].into_iter().collect();
        assert_eq!(svc.collect_garbage(&live).await.unwrap(), vec!["uid-o"]);
        assert_eq!(
            svc.list_binding_cr_uids().into_iter().collect::<Vec<_>>(),
            vec!["uid-b"]
        );

        assert_eq!(svc.cleanup_vpc_children(VPC).await.unwrap(), 1);
        assert!(svc.store().is_empty());
        assert_eq!(svc.cleanup_vpc_children(VPC).await.unwrap(), 0);
    }
}
