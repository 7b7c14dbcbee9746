// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache-change notification hooks.
//!
//! The store invokes these on whatever thread performed the mutation. The
//! manager implements both capability sets and translates each notification
//! into at most one outbound event.

use crate::protocol::{GroupId, ObjectId, RelationId, RelationPair};

/// Entity-level cache notifications.
pub trait CacheListener: Send + Sync {
    /// Every group's cache was reset.
    fn cache_full_reset(&self);

    /// One group's cache was reset.
    fn cache_group_reset(&self, group_id: GroupId);

    /// One entity was updated and its cache entry expired.
    fn cache_object_expired(&self, group_id: GroupId, object_id: ObjectId);

    /// One entity was removed from its group's cache.
    fn cache_object_removed(&self, group_id: GroupId, object_id: ObjectId);
}

/// Relation-level cache notifications.
pub trait CachedRelationListener: Send + Sync {
    fn add(&self, relation_id: RelationId, left: ObjectId, right: ObjectId);

    fn add_all(&self, relation_id: RelationId, pairs: &[RelationPair]);

    fn clear(&self, relation_id: RelationId);

    fn remove(&self, relation_id: RelationId, left: ObjectId, right: ObjectId);

    fn remove_all(&self, relation_id: RelationId, pairs: &[RelationPair]);

    fn remove_left_value(&self, relation_id: RelationId, left: ObjectId);

    fn remove_right_value(&self, relation_id: RelationId, right: ObjectId);

    fn replace_all(&self, relation_id: RelationId, pairs: &[RelationPair]);

    fn reset(&self, relation_id: RelationId);
}
