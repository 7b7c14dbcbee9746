// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire vocabulary for cache coherence events.
//!
//! Two tagged payload families travel over the cache topic: entity events
//! (per-group and per-object invalidation/update) and relation events
//! (mutations of cached many-to-many relations). Both are serialized as
//! JSON and are opaque to the transport.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Topic destination shared by every instance in the fleet.
pub const CACHE_TOPIC: &str = "CACHE.TOPIC";

/// Message property carrying the sender's client id, used for self-loop
/// suppression. A message without this property is dropped rather than
/// ambiguously applied.
pub const CLIENT_UUID_PROPERTY: &str = "Gemini.CacheMgr.ClientUUID";

/// Numeric identifier of an entity group within the store.
pub type GroupId = i32;

/// Identifier of an entity within a group.
pub type ObjectId = i64;

/// Fleet-wide identifier of a cached relation.
pub type RelationId = i64;

/// Ordered property-name to serialized-value projection of one entity.
///
/// Order is preserved on the wire; group materialization may depend on it.
pub type PropertyMap = IndexMap<String, String>;

/// One (left, right) edge of a many-to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationPair {
    pub left: ObjectId,
    pub right: ObjectId,
}

impl RelationPair {
    pub fn new(left: ObjectId, right: ObjectId) -> Self {
        Self { left, right }
    }
}

/// Entity-level cache events.
///
/// `ObjectReset` carries state (a complete projection sufficient to
/// materialize the entity from scratch) so peers can update in place
/// without touching the authoritative store. `GroupReset` carries no state;
/// peers invalidate and lazy-load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EntityCacheEvent {
    FullReset,
    GroupReset {
        group_id: GroupId,
    },
    ObjectReset {
        group_id: GroupId,
        object_id: ObjectId,
        properties: PropertyMap,
    },
    ObjectRemove {
        group_id: GroupId,
        object_id: ObjectId,
    },
}

/// Relation-level cache events.
///
/// Bulk variants never carry more pairs than the configured maximum
/// relation size; oversized mutations are emitted as `Reset` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RelationCacheEvent {
    Add {
        relation_id: RelationId,
        left: ObjectId,
        right: ObjectId,
    },
    AddAll {
        relation_id: RelationId,
        pairs: Vec<RelationPair>,
    },
    Clear {
        relation_id: RelationId,
    },
    Remove {
        relation_id: RelationId,
        left: ObjectId,
        right: ObjectId,
    },
    RemoveAll {
        relation_id: RelationId,
        pairs: Vec<RelationPair>,
    },
    RemoveLeftValue {
        relation_id: RelationId,
        left: ObjectId,
    },
    RemoveRightValue {
        relation_id: RelationId,
        right: ObjectId,
    },
    ReplaceAll {
        relation_id: RelationId,
        pairs: Vec<RelationPair>,
    },
    Reset {
        relation_id: RelationId,
    },
}

/// The wire payload: one event from either family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEvent {
    Entity(EntityCacheEvent),
    Relation(RelationCacheEvent),
}

impl From<EntityCacheEvent> for CacheEvent {
    fn from(event: EntityCacheEvent) -> Self {
        CacheEvent::Entity(event)
    }
}

impl From<RelationCacheEvent> for CacheEvent {
    fn from(event: RelationCacheEvent) -> Self {
        CacheEvent::Relation(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_event_roundtrip() {
        let mut properties = PropertyMap::new();
        properties.insert("name".to_string(), "x".to_string());
        properties.insert("rank".to_string(), "3".to_string());

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectReset {
            group_id: 7,
            object_id: 42,
            properties,
        });

        let json = serde_json::to_string(&event).unwrap();
        let decoded: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_property_order_preserved() {
        let mut properties = PropertyMap::new();
        properties.insert("z".to_string(), "1".to_string());
        properties.insert("a".to_string(), "2".to_string());
        properties.insert("m".to_string(), "3".to_string());

        let json = serde_json::to_vec(&properties).unwrap();
        let decoded: PropertyMap = serde_json::from_slice(&json).unwrap();
        let keys: Vec<&str> = decoded.keys().map(String::as_str).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn test_relation_event_action_tag() {
        let event = CacheEvent::Relation(RelationCacheEvent::RemoveLeftValue {
            relation_id: 5,
            left: 9,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""action":"remove_left_value""#), "{json}");
        assert!(json.contains(r#""relation""#), "{json}");

        let decoded: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_full_reset_has_no_fields() {
        let event = CacheEvent::Entity(EntityCacheEvent::FullReset);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"entity":{"action":"full_reset"}}"#);
    }

    #[test]
    fn test_unknown_action_fails_to_decode() {
        let json = r#"{"entity":{"action":"group_vacuum","group_id":1}}"#;
        assert!(serde_json::from_str::<CacheEvent>(json).is_err());
    }

    #[test]
    fn test_bulk_event_carries_pairs() {
        let pairs = vec![RelationPair::new(1, 2), RelationPair::new(3, 4)];
        let event = CacheEvent::Relation(RelationCacheEvent::AddAll {
            relation_id: 11,
            pairs: pairs.clone(),
        });

        let json = serde_json::to_vec(&event).unwrap();
        match serde_json::from_slice::<CacheEvent>(&json).unwrap() {
            CacheEvent::Relation(RelationCacheEvent::AddAll {
                relation_id,
                pairs: decoded,
            }) => {
                assert_eq!(relation_id, 11);
                assert_eq!(decoded, pairs);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
