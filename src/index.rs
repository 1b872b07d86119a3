//! A local, indexed cache of the remote objects this process owns.
//!
//! Each object kind has its own [`Store`], keyed by the object's remote ID.
//! Secondary indexes are plain functions from an object to the values it is
//! indexed under, so lookups never need to inspect object types at runtime.

use crate::{
    model::{tag_value, Group, Rule, SecurityPolicy, SubnetConnectionBindingMap, Tag},
    tags,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, BTreeSet},
    fmt,
    sync::Arc,
};

/// An object that may be held in a [`Store`].
pub trait StoredResource: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    const KIND: &'static str;

    fn key(&self) -> &str;

    fn is_marked_for_delete(&self) -> bool;

    fn tags(&self) -> &[Tag];

    /// Returns a copy without remote-assigned fields, for change detection.
    fn comparable(&self) -> Self;

    fn mark_for_delete(&mut self);

    /// The UID of the custom resource that owns this object.
    fn cr_uid(&self) -> Option<&str> {
        tag_value(self.tags(), tags::SCOPE_CR_UID)
    }

    /// Columns rendered by [`dump`].
    fn describe(&self) -> [String; 3];
}

/// Maps an object to the values it is indexed under.
pub type IndexFn<T> = fn(&T) -> Vec<String>;

pub const INDEX_CR_UID: &str = "cr-uid";
pub const INDEX_POLICY_ID: &str = "policy-id";
pub const INDEX_PARENT_PATH: &str = "parent-path";
pub const INDEX_SUBNET_PATH: &str = "subnet-path";
pub const INDEX_VPC_PATH: &str = "vpc-path";

#[derive(Clone)]
pub struct Store<T> {
    inner: Arc<RwLock<LockedStore<T>>>,
}

struct LockedStore<T> {
    objects: AHashMap<String, T>,
    indexers: Vec<(&'static str, IndexFn<T>)>,
    /// Index name -> indexed value -> object keys.
    indices: AHashMap<&'static str, AHashMap<String, AHashSet<String>>>,
}

/// The stores populated for security policies.
#[derive(Clone, Debug)]
pub struct PolicyStores {
    pub groups: Store<Group>,
    pub policies: Store<SecurityPolicy>,
    pub rules: Store<Rule>,
}

// === impl Store ===

impl<T: StoredResource> Store<T> {
    pub fn new(indexers: &[(&'static str, IndexFn<T>)]) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LockedStore {
                objects: AHashMap::new(),
                indexers: indexers.to_vec(),
                indices: indexers
                    .iter()
                    .map(|(name, _)| (*name, AHashMap::new()))
                    .collect(),
            })),
        }
    }

    /// Adds or replaces `obj`, or removes it if it is marked for deletion.
    ///
    /// Returns true if the store changed.
    pub fn apply(&self, obj: T) -> bool {
        if obj.is_marked_for_delete() {
            return self.delete(obj.key()).is_some();
        }
        self.add(obj)
    }

    /// Adds or replaces `obj`. Returns true if the store changed.
    pub fn add(&self, obj: T) -> bool {
        let mut store = self.inner.write();
        let key = obj.key().to_string();
        match store.objects.get(&key).map(|existing| *existing == obj) {
            Some(true) => {
                tracing::debug!(kind = T::KIND, %key, "no changes");
                return false;
            }
            Some(false) => tracing::debug!(kind = T::KIND, %key, "updating"),
            None => tracing::debug!(kind = T::KIND, %key, "adding to store"),
        }
        if let Some(old) = store.objects.insert(key.clone(), obj.clone()) {
            store.unindex(&key, &old);
        }
        store.index(&key, &obj);
        true
    }

    /// Removes the object stored under `key`, returning it if it was present.
    pub fn delete(&self, key: &str) -> Option<T> {
        let mut store = self.inner.write();
        let old = store.objects.remove(key)?;
        store.unindex(key, &old);
        tracing::debug!(kind = T::KIND, %key, "removed from store");
        Some(old)
    }

    pub fn get_by_key(&self, key: &str) -> Option<T> {
        self.inner.read().objects.get(key).cloned()
    }

    /// Returns every stored object, ordered by key.
    pub fn list(&self) -> Vec<T> {
        let store = self.inner.read();
        let mut objects = store.objects.values().cloned().collect::<Vec<_>>();
        objects.sort_by(|a, b| a.key().cmp(b.key()));
        objects
    }

    /// Returns the objects indexed under `value` by the index `name`, ordered
    /// by key. Unknown indexes match nothing.
    pub fn get_by_index(&self, name: &str, value: &str) -> Vec<T> {
        let store = self.inner.read();
        let keys = match store.indices.get(name).and_then(|idx| idx.get(value)) {
            Some(keys) => keys,
            None => return Vec::new(),
        };
        let mut objects = keys
            .iter()
            .filter_map(|k| store.objects.get(k))
            .cloned()
            .collect::<Vec<_>>();
        objects.sort_by(|a, b| a.key().cmp(b.key()));
        objects
    }

    /// Returns every value present in the index `name`.
    pub fn list_index_func_values(&self, name: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .indices
            .get(name)
            .map(|idx| idx.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().objects.is_empty()
    }
}

impl<T: StoredResource> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("kind", &T::KIND)
            .field("len", &self.len())
            .finish()
    }
}

// === impl LockedStore ===

impl<T: StoredResource> LockedStore<T> {
    fn index(&mut self, key: &str, obj: &T) {
        for (name, index_fn) in &self.indexers {
            let index = self.indices.entry(*name).or_default();
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, obj: &T) {
        for (name, index_fn) in &self.indexers {
            if let Some(index) = self.indices.get_mut(name) {
                for value in index_fn(obj) {
                    if let Entry::Occupied(mut keys) = index.entry(value) {
                        keys.get_mut().remove(key);
                        if keys.get().is_empty() {
                            keys.remove();
                        }
                    }
                }
            }
        }
    }
}

// === impl PolicyStores ===

impl PolicyStores {
    pub fn new() -> Self {
        Self {
            groups: Store::new(&[(INDEX_CR_UID, by_cr_uid::<Group>)]),
            policies: Store::new(&[(INDEX_CR_UID, by_cr_uid::<SecurityPolicy>)]),
            rules: Store::new(&[
                (INDEX_CR_UID, by_cr_uid::<Rule>),
                (INDEX_POLICY_ID, rule_policy_id),
            ]),
        }
    }
}

impl Default for PolicyStores {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a binding-map store indexed by owner and by subnet paths.
pub fn binding_map_store() -> Store<SubnetConnectionBindingMap> {
    Store::new(&[
        (INDEX_CR_UID, by_cr_uid::<SubnetConnectionBindingMap>),
        (INDEX_PARENT_PATH, binding_parent_path),
        (INDEX_SUBNET_PATH, binding_subnet_path),
        (INDEX_VPC_PATH, binding_vpc_path),
    ])
}

// === index functions ===

pub fn by_cr_uid<T: StoredResource>(obj: &T) -> Vec<String> {
    obj.cr_uid().map(String::from).into_iter().collect()
}

/// Indexes a rule by the ID of the policy it belongs to.
fn rule_policy_id(rule: &Rule) -> Vec<String> {
    rule.parent_path
        .as_deref()
        .and_then(|p| p.rsplit_once("/security-policies/"))
        .map(|(_, id)| id.to_string())
        .into_iter()
        .collect()
}

fn binding_parent_path(map: &SubnetConnectionBindingMap) -> Vec<String> {
    map.parent_path.clone().into_iter().collect()
}

fn binding_subnet_path(map: &SubnetConnectionBindingMap) -> Vec<String> {
    vec![map.subnet_path.clone()]
}

/// Indexes a binding map by the VPC of its parent subnet.
fn binding_vpc_path(map: &SubnetConnectionBindingMap) -> Vec<String> {
    map.parent_path
        .as_deref()
        .and_then(|p| p.split_once("/subnets/"))
        .map(|(vpc, _)| vpc.to_string())
        .into_iter()
        .collect()
}

// === impl StoredResource ===

impl StoredResource for Group {
    const KIND: &'static str = "Group";

    fn key(&self) -> &str {
        &self.id
    }

    fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn comparable(&self) -> Self {
        Group::comparable(self)
    }

    fn mark_for_delete(&mut self) {
        self.marked_for_delete = true;
    }

    fn describe(&self) -> [String; 3] {
        [
            self.id.clone(),
            self.cr_uid().unwrap_or_default().to_string(),
            format!("{} expressions", self.expression.len()),
        ]
    }
}

impl StoredResource for SecurityPolicy {
    const KIND: &'static str = "SecurityPolicy";

    fn key(&self) -> &str {
        &self.id
    }

    fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn comparable(&self) -> Self {
        SecurityPolicy::comparable(self)
    }

    fn mark_for_delete(&mut self) {
        self.marked_for_delete = true;
    }

    fn describe(&self) -> [String; 3] {
        [
            self.id.clone(),
            self.cr_uid().unwrap_or_default().to_string(),
            format!("priority {} scope {}", self.sequence_number, self.scope.join(",")),
        ]
    }
}

impl StoredResource for Rule {
    const KIND: &'static str = "Rule";

    fn key(&self) -> &str {
        &self.id
    }

    fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn comparable(&self) -> Self {
        Rule::comparable(self)
    }

    fn mark_for_delete(&mut self) {
        self.marked_for_delete = true;
    }

    fn describe(&self) -> [String; 3] {
        let ports = self
            .service_entries
            .iter()
            .map(|e| format!("{}:{}", e.l4_protocol, e.destination_ports.join(",")))
            .collect::<Vec<_>>()
            .join("\n");
        [
            self.id.clone(),
            self.cr_uid().unwrap_or_default().to_string(),
            format!("{:?} {:?} {ports}", self.direction, self.action),
        ]
    }
}

impl StoredResource for SubnetConnectionBindingMap {
    const KIND: &'static str = "SubnetConnectionBindingMap";

    fn key(&self) -> &str {
        &self.id
    }

    fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn comparable(&self) -> Self {
        SubnetConnectionBindingMap::comparable(self)
    }

    fn mark_for_delete(&mut self) {
        self.marked_for_delete = true;
    }

    fn cr_uid(&self) -> Option<&str> {
        tag_value(&self.tags, tags::SCOPE_SUBNET_BINDING_CR_UID)
    }

    fn describe(&self) -> [String; 3] {
        [
            self.id.clone(),
            self.cr_uid().unwrap_or_default().to_string(),
            format!(
                "{} -> {} (vlan {})",
                self.parent_path.as_deref().unwrap_or_default(),
                self.subnet_path,
                self.vlan_traffic_tag
            ),
        ]
    }
}

/// Renders the contents of the policy stores as tables.
pub fn dump(stores: &PolicyStores) -> String {
    format!(
        "{}\n{}\n{}",
        table(&stores.policies),
        table(&stores.rules),
        table(&stores.groups)
    )
}

fn table<T: StoredResource>(store: &Store<T>) -> comfy_table::Table {
    use comfy_table::{presets::UTF8_FULL, *};
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(Row::from(vec![T::KIND, "CR UID", "DETAILS"]));
    for obj in store.list() {
        table.add_row(Row::from(obj.describe().to_vec()));
    }
    table
}
