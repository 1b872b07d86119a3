//! Keeps remote security policies in sync with `SecurityPolicy` and
//! `NetworkPolicy` resources.

use crate::{
    client::PolicyClient,
    compile::{Compiled, Compiler},
    error::Error,
    hierarchy::{self, Hierarchy},
    index::{PolicyStores, Store, StoredResource, INDEX_CR_UID, INDEX_POLICY_ID},
    k8s,
    model::{Group, Rule, SecurityPolicy},
    network_policy,
    pod::{NamespaceLister, PodLister},
    realize::{self, Backoff},
    search,
    tags::{self, IdScheme},
    Config,
};
use ahash::AHashSet;
use std::collections::BTreeSet;
use tracing::Instrument;

/// Creates, updates and deletes remote policies and caches what it has
/// written.
///
/// Every change for one resource is sent as a single hierarchical PATCH. The
/// stores are only updated after the PATCH succeeds.
#[derive(Debug)]
pub struct SecurityPolicyService<C, L> {
    client: C,
    listers: L,
    config: Config,
    stores: PolicyStores,
    backoff: Backoff,
}

/// The objects that must be written for one resource.
#[derive(Debug, Default)]
struct Changes {
    policy: Option<SecurityPolicy>,
    rules: Vec<Rule>,
    groups: Vec<Group>,
}

// === impl SecurityPolicyService ===

impl<C, L> SecurityPolicyService<C, L>
where
    C: PolicyClient,
    L: PodLister + NamespaceLister,
{
    pub fn new(client: C, listers: L, config: Config) -> Self {
        Self {
            client,
            listers,
            config,
            stores: PolicyStores::new(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    pub fn stores(&self) -> &PolicyStores {
        &self.stores
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Loads every object owned by this cluster into the stores.
    pub async fn initialize(&self) -> Result<(), Error> {
        search::initialize(&self.client, &self.config.cluster, &self.stores)
            .instrument(tracing::info_span!("initialize", cluster = %self.config.cluster))
            .await
    }

    /// Compiles `policy` and writes whatever differs from the stores.
    ///
    /// Returns true if a PATCH was sent.
    pub async fn create_or_update_security_policy(
        &self,
        policy: &k8s::SecurityPolicy,
    ) -> Result<bool, Error> {
        let compiled = Compiler::new(&self.config, &self.listers, &self.listers)
            .build_security_policy(policy)
            .await?;
        let cr_uid = tags::Owner::from_policy(policy)?.uid;
        self.sync(&cr_uid, compiled)
            .instrument(tracing::info_span!("sync", %cr_uid))
            .await
    }

    /// Writes the allow and isolation policies derived from a
    /// `NetworkPolicy`.
    pub async fn create_or_update_network_policy(
        &self,
        policy: &k8s::NetworkPolicy,
    ) -> Result<bool, Error> {
        let mut changed = false;
        for derived in network_policy::to_security_policies(policy)? {
            changed |= self.create_or_update_security_policy(&derived).await?;
        }
        Ok(changed)
    }

    /// Deletes every object owned by the `SecurityPolicy` with `cr_uid`.
    pub async fn delete_security_policy(&self, cr_uid: &str) -> Result<bool, Error> {
        self.delete_by_cr_uid(cr_uid)
            .instrument(tracing::info_span!("delete", %cr_uid))
            .await
    }

    /// Deletes the allow and isolation policies of a `NetworkPolicy`.
    pub async fn delete_network_policy(&self, cr_uid: &str) -> Result<bool, Error> {
        let mut changed = false;
        for uid in IdScheme::NetworkPolicy.expected_uids(cr_uid) {
            changed |= self.delete_security_policy(&uid).await?;
        }
        Ok(changed)
    }

    /// The UIDs of `SecurityPolicy` resources with cached policies.
    pub fn list_security_policy_ids(&self) -> BTreeSet<String> {
        self.owner_uids()
            .into_iter()
            .filter(|uid| tags::network_policy_uid(uid).is_none())
            .collect()
    }

    /// The internal (`_allow` / `_isolation` suffixed) UIDs of policies
    /// derived from `NetworkPolicy` resources.
    pub fn list_network_policy_ids(&self) -> BTreeSet<String> {
        self.owner_uids()
            .into_iter()
            .filter(|uid| tags::network_policy_uid(uid).is_some())
            .collect()
    }

    fn owner_uids(&self) -> BTreeSet<String> {
        let mut uids = self.stores.policies.list_index_func_values(INDEX_CR_UID);
        uids.extend(self.stores.rules.list_index_func_values(INDEX_CR_UID));
        uids.extend(self.stores.groups.list_index_func_values(INDEX_CR_UID));
        uids
    }

    /// Deletes policies whose owning resource no longer exists.
    ///
    /// `live_cr_uids` are the UIDs of existing resources of the kind named by
    /// `scheme`. Returns the internal UIDs that were deleted.
    pub async fn collect_garbage(
        &self,
        scheme: IdScheme,
        live_cr_uids: &BTreeSet<String>,
    ) -> Result<Vec<String>, Error> {
        let observed = match scheme {
            IdScheme::SecurityPolicy => self.list_security_policy_ids(),
            IdScheme::NetworkPolicy => self.list_network_policy_ids(),
        };
        let expected = live_cr_uids
            .iter()
            .flat_map(|uid| scheme.expected_uids(uid))
            .collect::<AHashSet<_>>();

        let mut deleted = Vec::new();
        let mut first_error = None;
        for uid in observed.into_iter().filter(|uid| !expected.contains(uid)) {
            tracing::info!(?scheme, %uid, "collecting garbage");
            match self.delete_security_policy(&uid).await {
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

    /// Deletes every cached object beneath a VPC that is being removed.
    pub async fn cleanup_vpc_children(&self, vpc_path: &str) -> Result<usize, Error> {
        let hierarchy = Hierarchy::from_vpc_path(vpc_path)?;
        let prefix = format!("{vpc_path}/");
        let under = |path: &Option<String>| path.as_deref().map_or(false, |p| p.starts_with(&prefix));

        let policies = self
            .stores
            .policies
            .list()
            .into_iter()
            .filter(|p| under(&p.path))
            .collect::<Vec<_>>();
        let groups = marked(
            self.stores
                .groups
                .list()
                .into_iter()
                .filter(|g| under(&g.path))
                .collect(),
        );
        let count = policies.len() + groups.len();
        if count == 0 {
            tracing::debug!(%vpc_path, "no children to clean up");
            return Ok(0);
        }

        // Deleting a policy deletes its rules.
        for mut policy in policies {
            let rules = self.stores.rules.get_by_index(INDEX_POLICY_ID, &policy.id);
            policy.mark_for_delete();
            let root = hierarchy::wrap_security_policy(
                &hierarchy,
                policy.clone(),
                marked(rules.clone()),
                Vec::new(),
            );
            self.client.patch(&root, false).await?;
            remove_all(&self.stores.rules, &rules);
            remove_all(&self.stores.policies, &[policy]);
        }
        if !groups.is_empty() {
            self.client
                .patch(&hierarchy::wrap_groups(&hierarchy, groups.clone()), false)
                .await?;
            remove_all(&self.stores.groups, &groups);
        }
        tracing::info!(%vpc_path, count, "cleaned up VPC children");
        Ok(count)
    }

    /// Waits for the policy of the resource with `cr_uid` to be realized.
    pub async fn wait_realized(&self, cr_uid: &str) -> Result<(), Error> {
        let path = self.config.hierarchy.policy_path(&tags::policy_id(cr_uid));
        realize::wait_realized(&self.client, &path, &self.backoff).await
    }

    async fn sync(&self, cr_uid: &str, compiled: Compiled) -> Result<bool, Error> {
        let Compiled {
            policy,
            rules,
            groups,
        } = compiled;

        let existing_policy = self.stores.policies.get_by_key(&policy.id);
        let policy_changed = existing_policy.map(|p| p.comparable()) != Some(policy.comparable());
        let changes = Changes {
            policy: Some(policy).filter(|_| policy_changed),
            rules: diff(self.stores.rules.get_by_index(INDEX_CR_UID, cr_uid), rules),
            groups: diff(self.stores.groups.get_by_index(INDEX_CR_UID, cr_uid), groups),
        };
        if changes.is_empty() {
            tracing::debug!("no changes");
            return Ok(false);
        }
        self.write(cr_uid, changes).await?;
        Ok(true)
    }

    async fn delete_by_cr_uid(&self, cr_uid: &str) -> Result<bool, Error> {
        let policies = self.stores.policies.get_by_index(INDEX_CR_UID, cr_uid);
        let changes = Changes {
            policy: marked(policies).pop(),
            rules: marked(self.stores.rules.get_by_index(INDEX_CR_UID, cr_uid)),
            groups: marked(self.stores.groups.get_by_index(INDEX_CR_UID, cr_uid)),
        };
        if changes.is_empty() {
            tracing::debug!("nothing to delete");
            return Ok(false);
        }
        self.write(cr_uid, changes).await?;
        Ok(true)
    }

    /// Sends one PATCH for `changes` and then applies them to the stores.
    async fn write(&self, cr_uid: &str, changes: Changes) -> Result<(), Error> {
        let Changes {
            policy,
            rules,
            groups,
        } = changes;
        tracing::info!(
            policy = policy.is_some(),
            rules = rules.len(),
            groups = groups.len(),
            "patching"
        );

        // Rules can only be written beneath their policy.
        let parent = match policy.clone() {
            Some(policy) => Some(policy),
            None if !rules.is_empty() => {
                let id = tags::policy_id(cr_uid);
                self.stores.policies.get_by_key(&id).or_else(|| {
                    Some(SecurityPolicy {
                        id,
                        marked_for_delete: rules.iter().all(|r| r.marked_for_delete),
                        ..Default::default()
                    })
                })
            }
            None => None,
        };
        let root = match parent {
            Some(parent) => hierarchy::wrap_security_policy(
                &self.config.hierarchy,
                parent,
                rules.clone(),
                groups.clone(),
            ),
            None => hierarchy::wrap_groups(&self.config.hierarchy, groups.clone()),
        };
        self.client.patch(&root, false).await?;

        for group in groups {
            apply(&self.stores.groups, group);
        }
        for rule in rules {
            apply(&self.stores.rules, rule);
        }
        if let Some(policy) = policy {
            apply(&self.stores.policies, policy);
        }
        Ok(())
    }
}

// === impl Changes ===

impl Changes {
    fn is_empty(&self) -> bool {
        self.policy.is_none() && self.rules.is_empty() && self.groups.is_empty()
    }
}

/// Returns the objects in `desired` that differ from `existing`, followed by
/// the objects in `existing` that are no longer desired, marked for deletion.
pub(crate) fn diff<T: StoredResource>(existing: Vec<T>, desired: Vec<T>) -> Vec<T> {
    let desired_keys = desired
        .iter()
        .map(|obj| obj.key().to_string())
        .collect::<AHashSet<_>>();
    let mut changes = Vec::new();
    for obj in desired {
        let unchanged = existing
            .iter()
            .find(|e| e.key() == obj.key())
            .map_or(false, |e| e.comparable() == obj.comparable());
        if unchanged {
            tracing::trace!(kind = T::KIND, key = %obj.key(), "no changes");
        } else {
            changes.push(obj);
        }
    }
    for mut stale in existing
        .into_iter()
        .filter(|e| !desired_keys.contains(e.key()))
    {
        tracing::debug!(kind = T::KIND, key = %stale.key(), "stale");
        stale.mark_for_delete();
        changes.push(stale);
    }
    changes
}

pub(crate) fn marked<T: StoredResource>(objects: Vec<T>) -> Vec<T> {
    objects
        .into_iter()
        .map(|mut obj| {
            obj.mark_for_delete();
            obj
        })
        .collect()
}

pub(crate) fn apply<T: StoredResource>(store: &Store<T>, obj: T) {
    let key = obj.key().to_string();
    let deleting = obj.is_marked_for_delete();
    if !store.apply(obj) && deleting {
        tracing::warn!(kind = T::KIND, %key, "deleted object was not in the store");
    }
}

fn remove_all<T: StoredResource>(store: &Store<T>, objects: &[T]) {
    for obj in objects {
        if store.delete(obj.key()).is_none() {
            tracing::warn!(kind = T::KIND, key = %obj.key(), "deleted object was not in the store");
        }
    }
}
