// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory store doubles for tests.
//!
//! [`MemoryStore`] implements the [`EntityStore`] contract and additionally
//! plays the store's other role: fanning local mutations out to registered
//! listeners. Mutations flagged `distribute: true` reach the listeners (and
//! through the manager, the bus); remote applications with
//! `MutationFlags::REMOTE` do not, which is exactly the loop-suppression
//! behavior the bus relies on.

use std::collections::HashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::listener::{CacheListener, CachedRelationListener};
use crate::protocol::{GroupId, ObjectId, PropertyMap, RelationId, RelationPair};
use crate::store::{CachedGroup, CachedRelation, EntityGroup, EntityStore, MutationFlags};

#[derive(Default)]
struct ListenerSet {
    cache: RwLock<Vec<Arc<dyn CacheListener>>>,
    relation: RwLock<Vec<Arc<dyn CachedRelationListener>>>,
}

/// In-memory entity store.
pub struct MemoryStore {
    initialized: AtomicBool,
    groups: RwLock<HashMap<GroupId, Arc<MemoryGroup>>>,
    relations: RwLock<HashMap<RelationId, Arc<MemoryRelation>>>,
    listeners: Arc<ListenerSet>,
    expired: RwLock<Vec<(bool, GroupId, ObjectId)>>,
    group_resets: RwLock<Vec<(GroupId, bool, bool)>>,
    full_resets: RwLock<Vec<(bool, bool)>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(true),
            groups: RwLock::new(HashMap::new()),
            relations: RwLock::new(HashMap::new()),
            listeners: Arc::new(ListenerSet::default()),
            expired: RwLock::new(Vec::new()),
            group_resets: RwLock::new(Vec::new()),
            full_resets: RwLock::new(Vec::new()),
        }
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    pub fn register_group(&self, group: MemoryGroup) -> Arc<MemoryGroup> {
        let group = Arc::new(group);
        self.groups
            .write()
            .insert(group.group_number(), group.clone());
        group
    }

    pub fn register_relation(&self, relation: MemoryRelation) -> Arc<MemoryRelation> {
        let relation = Arc::new(relation);
        *relation.listeners.write() = Some(self.listeners.clone());
        self.relations
            .write()
            .insert(relation.relation_id, relation.clone());
        relation
    }

    pub fn add_cache_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.cache.write().push(listener);
    }

    pub fn add_relation_listener(&self, listener: Arc<dyn CachedRelationListener>) {
        self.listeners.relation.write().push(listener);
    }

    /// Insert or update an entity locally and notify listeners the way the
    /// real store does after a mutation.
    pub fn put_object(&self, group_id: GroupId, object_id: ObjectId, properties: PropertyMap) {
        let group = self
            .groups
            .read()
            .get(&group_id)
            .cloned()
            .expect("group not registered");
        group.seed(object_id, properties);
        self.notify_object_expired(true, group_id, object_id);
    }

    /// Remove an entity locally and notify listeners.
    pub fn remove_object(&self, group_id: GroupId, object_id: ObjectId) {
        let group = self
            .groups
            .read()
            .get(&group_id)
            .cloned()
            .expect("group not registered");
        group.entries.write().shift_remove(&object_id);
        let listeners = self.listeners.cache.read().clone();
        for listener in listeners {
            listener.cache_object_removed(group_id, object_id);
        }
    }

    /// Expired notifications seen so far, filtered by distribute flag.
    pub fn expired_notifications(&self, distribute: bool) -> Vec<(GroupId, ObjectId)> {
        self.expired
            .read()
            .iter()
            .filter(|(d, _, _)| *d == distribute)
            .map(|(_, g, o)| (*g, *o))
            .collect()
    }

    /// Recorded `reset_group` calls as (group_id, load_everything, distribute).
    pub fn group_resets(&self) -> Vec<(GroupId, bool, bool)> {
        self.group_resets.read().clone()
    }

    /// Recorded `reset_all` calls as (load_everything, distribute).
    pub fn full_resets(&self) -> Vec<(bool, bool)> {
        self.full_resets.read().clone()
    }
}

impl EntityStore for MemoryStore {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn group(&self, group_id: GroupId) -> Option<Arc<dyn EntityGroup>> {
        self.groups
            .read()
            .get(&group_id)
            .cloned()
            .map(|g| g as Arc<dyn EntityGroup>)
    }

    fn cached_relation(&self, relation_id: RelationId) -> Option<Arc<dyn CachedRelation>> {
        self.relations
            .read()
            .get(&relation_id)
            .cloned()
            .map(|r| r as Arc<dyn CachedRelation>)
    }

    fn reset_all(&self, load_everything: bool, distribute: bool) {
        self.full_resets.write().push((load_everything, distribute));
        if distribute {
            let listeners = self.listeners.cache.read().clone();
            for listener in listeners {
                listener.cache_full_reset();
            }
        }
    }

    fn reset_group(&self, group_id: GroupId, load_everything: bool, distribute: bool) {
        self.group_resets
            .write()
            .push((group_id, load_everything, distribute));
        if distribute {
            let listeners = self.listeners.cache.read().clone();
            for listener in listeners {
                listener.cache_group_reset(group_id);
            }
        }
    }

    fn notify_object_expired(&self, distribute: bool, group_id: GroupId, object_id: ObjectId) {
        self.expired.write().push((distribute, group_id, object_id));
        if distribute {
            let listeners = self.listeners.cache.read().clone();
            for listener in listeners {
                listener.cache_object_expired(group_id, object_id);
            }
        }
    }
}

/// In-memory entity group, cached or plain.
pub struct MemoryGroup {
    group_id: GroupId,
    distribute: bool,
    cached: bool,
    entries: RwLock<IndexMap<ObjectId, PropertyMap>>,
}

impl MemoryGroup {
    /// A group with an in-memory cache.
    pub fn cached(group_id: GroupId, distribute: bool) -> Self {
        Self {
            group_id,
            distribute,
            cached: true,
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// A plain group: entities exist but are not locally cached.
    pub fn plain(group_id: GroupId, distribute: bool) -> Self {
        Self {
            group_id,
            distribute,
            cached: false,
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Insert an entity directly, without listener notifications.
    pub fn seed(&self, object_id: ObjectId, properties: PropertyMap) {
        self.entries.write().insert(object_id, properties);
    }

    /// Identifiers currently held, in cache order.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.entries.read().keys().copied().collect()
    }
}

impl EntityGroup for MemoryGroup {
    fn group_number(&self) -> GroupId {
        self.group_id
    }

    fn distribute(&self) -> bool {
        self.distribute
    }

    fn write_map(&self, object_id: ObjectId) -> Option<PropertyMap> {
        self.entries.read().get(&object_id).cloned()
    }

    fn cache(&self) -> Option<&dyn CachedGroup> {
        self.cached.then_some(self as &dyn CachedGroup)
    }
}

impl CachedGroup for MemoryGroup {
    fn contains(&self, object_id: ObjectId) -> bool {
        self.entries.read().contains_key(&object_id)
    }

    fn insert_from_map(&self, object_id: ObjectId, properties: &PropertyMap) {
        self.entries.write().insert(object_id, properties.clone());
    }

    fn update_from_map(&self, object_id: ObjectId, properties: &PropertyMap) {
        self.entries.write().insert(object_id, properties.clone());
    }

    fn reorder(&self, _object_id: ObjectId) {
        // Ordering structure is ascending id order.
        self.entries.write().sort_keys();
    }

    fn remove_from_cache(&self, object_id: ObjectId) {
        self.entries.write().shift_remove(&object_id);
    }
}

/// In-memory cached relation.
pub struct MemoryRelation {
    relation_id: RelationId,
    pairs: RwLock<BTreeSet<RelationPair>>,
    listeners: RwLock<Option<Arc<ListenerSet>>>,
    resets: RwLock<Vec<(bool, bool)>>,
    last_flags: RwLock<Option<MutationFlags>>,
}

impl MemoryRelation {
    pub fn new(relation_id: RelationId) -> Self {
        Self {
            relation_id,
            pairs: RwLock::new(BTreeSet::new()),
            listeners: RwLock::new(None),
            resets: RwLock::new(Vec::new()),
            last_flags: RwLock::new(None),
        }
    }

    pub fn contains(&self, pair: RelationPair) -> bool {
        self.pairs.read().contains(&pair)
    }

    pub fn pairs(&self) -> Vec<RelationPair> {
        self.pairs.read().iter().copied().collect()
    }

    /// Recorded `reset` calls as (load_everything, distribute).
    pub fn resets(&self) -> Vec<(bool, bool)> {
        self.resets.read().clone()
    }

    /// Flags of the most recent mutation.
    pub fn last_flags(&self) -> Option<MutationFlags> {
        *self.last_flags.read()
    }

    fn record(&self, flags: MutationFlags) {
        *self.last_flags.write() = Some(flags);
    }

    fn fan_out(&self, flags: MutationFlags, notify: impl Fn(&dyn CachedRelationListener)) {
        if !flags.distribute {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .as_ref()
            .map(|set| set.relation.read().clone())
            .unwrap_or_default();
        for listener in listeners {
            notify(listener.as_ref());
        }
    }
}

impl CachedRelation for MemoryRelation {
    fn add(&self, left: ObjectId, right: ObjectId, flags: MutationFlags) {
        self.record(flags);
        self.pairs.write().insert(RelationPair::new(left, right));
        self.fan_out(flags, |l| l.add(self.relation_id, left, right));
    }

    fn add_all(&self, pairs: &[RelationPair], flags: MutationFlags) {
        self.record(flags);
        self.pairs.write().extend(pairs.iter().copied());
        self.fan_out(flags, |l| l.add_all(self.relation_id, pairs));
    }

    fn clear(&self, flags: MutationFlags) {
        self.record(flags);
        self.pairs.write().clear();
        self.fan_out(flags, |l| l.clear(self.relation_id));
    }

    fn remove(&self, left: ObjectId, right: ObjectId, flags: MutationFlags) {
        self.record(flags);
        self.pairs.write().remove(&RelationPair::new(left, right));
        self.fan_out(flags, |l| l.remove(self.relation_id, left, right));
    }

    fn remove_all(&self, pairs: &[RelationPair], flags: MutationFlags) {
        self.record(flags);
        {
            let mut set = self.pairs.write();
            for pair in pairs {
                set.remove(pair);
            }
        }
        self.fan_out(flags, |l| l.remove_all(self.relation_id, pairs));
    }

    fn remove_left_value(&self, left: ObjectId, flags: MutationFlags) {
        self.record(flags);
        self.pairs.write().retain(|pair| pair.left != left);
        self.fan_out(flags, |l| l.remove_left_value(self.relation_id, left));
    }

    fn remove_right_value(&self, right: ObjectId, flags: MutationFlags) {
        self.record(flags);
        self.pairs.write().retain(|pair| pair.right != right);
        self.fan_out(flags, |l| l.remove_right_value(self.relation_id, right));
    }

    fn replace_all(&self, pairs: &[RelationPair], flags: MutationFlags) {
        self.record(flags);
        {
            let mut set = self.pairs.write();
            set.clear();
            set.extend(pairs.iter().copied());
        }
        self.fan_out(flags, |l| l.replace_all(self.relation_id, pairs));
    }

    fn reset(&self, load_everything: bool, distribute: bool) {
        self.resets.write().push((load_everything, distribute));
        self.pairs.write().clear();
        if distribute {
            let listeners = self
                .listeners
                .read()
                .as_ref()
                .map(|set| set.relation.read().clone())
                .unwrap_or_default();
            for listener in listeners {
                listener.reset(self.relation_id);
            }
        }
    }
}
