// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contract with the local entity store.
//!
//! The bus never owns cache state. It observes local mutations through the
//! listener hooks and applies remote mutations through these traits. Which
//! groups are cached, how entities materialize from property maps, and how
//! relations persist are all the store's concern.

use std::sync::Arc;

use crate::protocol::{GroupId, ObjectId, PropertyMap, RelationId, RelationPair};

/// Side-effect selectors for relation mutations.
///
/// `distribute` re-emits the mutation on the bus, `notify` informs local
/// listeners, `persist` writes through to the authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationFlags {
    pub distribute: bool,
    pub notify: bool,
    pub persist: bool,
}

impl MutationFlags {
    /// A locally originated mutation: full side effects.
    pub const LOCAL: Self = Self {
        distribute: true,
        notify: true,
        persist: true,
    };

    /// A mutation replayed from a remote peer: update in-memory state and
    /// notify local listeners, but never write back or re-broadcast.
    pub const REMOTE: Self = Self {
        distribute: false,
        notify: true,
        persist: false,
    };
}

/// The local entity store.
pub trait EntityStore: Send + Sync {
    /// Whether local bootstrap has completed. Events arriving earlier are
    /// dropped; subsequent traffic restates anything that matters.
    fn is_initialized(&self) -> bool;

    /// Resolve an entity group by its fleet-wide group number.
    fn group(&self, group_id: GroupId) -> Option<Arc<dyn EntityGroup>>;

    /// Resolve a cached relation by its fleet-wide relation id.
    fn cached_relation(&self, relation_id: RelationId) -> Option<Arc<dyn CachedRelation>>;

    /// Reset every group's cache.
    fn reset_all(&self, load_everything: bool, distribute: bool);

    /// Reset one group's cache.
    fn reset_group(&self, group_id: GroupId, load_everything: bool, distribute: bool);

    /// Notify local listeners that an object expired. `distribute: false`
    /// keeps the notification off the bus.
    fn notify_object_expired(&self, distribute: bool, group_id: GroupId, object_id: ObjectId);
}

/// One entity type within the store, with or without an in-memory cache.
pub trait EntityGroup: Send + Sync {
    fn group_number(&self) -> GroupId;

    /// Gates whether local mutations to this group are broadcast.
    fn distribute(&self) -> bool;

    /// Full property projection of the entity, sufficient to materialize it
    /// from scratch. `None` when the entity no longer exists.
    fn write_map(&self, object_id: ObjectId) -> Option<PropertyMap>;

    /// The in-memory cache, or `None` for a plain (uncached) group.
    fn cache(&self) -> Option<&dyn CachedGroup>;
}

/// The in-memory cache of a cached group.
pub trait CachedGroup: Send + Sync {
    fn contains(&self, object_id: ObjectId) -> bool;

    /// Materialize a new entity from its projection and insert it.
    fn insert_from_map(&self, object_id: ObjectId, properties: &PropertyMap);

    /// Update an existing entity in place from its projection.
    fn update_from_map(&self, object_id: ObjectId, properties: &PropertyMap);

    /// Re-order the entity within the cache's ordering structure after an
    /// in-place update.
    fn reorder(&self, object_id: ObjectId);

    fn remove_from_cache(&self, object_id: ObjectId);
}

/// An in-memory many-to-many relation between entity identifiers.
pub trait CachedRelation: Send + Sync {
    fn add(&self, left: ObjectId, right: ObjectId, flags: MutationFlags);

    fn add_all(&self, pairs: &[RelationPair], flags: MutationFlags);

    fn clear(&self, flags: MutationFlags);

    fn remove(&self, left: ObjectId, right: ObjectId, flags: MutationFlags);

    fn remove_all(&self, pairs: &[RelationPair], flags: MutationFlags);

    fn remove_left_value(&self, left: ObjectId, flags: MutationFlags);

    fn remove_right_value(&self, right: ObjectId, flags: MutationFlags);

    fn replace_all(&self, pairs: &[RelationPair], flags: MutationFlags);

    /// Refresh from the authoritative store.
    fn reset(&self, load_everything: bool, distribute: bool);
}
