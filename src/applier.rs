// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receive side: applies remote cache events to the local store.
//!
//! Every mutation performed here runs with re-broadcast and persistence
//! suppressed; the event already happened on the originating instance and
//! the authoritative store already reflects it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocol::{
    CacheEvent, EntityCacheEvent, RelationCacheEvent, CLIENT_UUID_PROPERTY,
};
use crate::pubsub::Message;
use crate::store::{EntityStore, MutationFlags};
use crate::subscriber::MessageHandler;

/// Applies inbound envelopes to the local store, dropping anything this
/// instance originated itself.
pub struct CacheEventApplier {
    store: Arc<dyn EntityStore>,
    instance_id: String,
}

impl CacheEventApplier {
    pub fn new(store: Arc<dyn EntityStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    fn apply_entity(&self, event: EntityCacheEvent) {
        match event {
            EntityCacheEvent::FullReset => {
                info!("received 'cache full reset'");
                self.store.reset_all(true, false);
            }
            EntityCacheEvent::GroupReset { group_id } => {
                if self.store.group(group_id).is_none() {
                    warn!(group_id, "received 'cache group reset' for unknown group");
                    return;
                }
                info!(group_id, "received 'cache group reset'");
                self.store.reset_group(group_id, true, false);
            }
            EntityCacheEvent::ObjectReset {
                group_id,
                object_id,
                properties,
            } => {
                let Some(group) = self.store.group(group_id) else {
                    warn!(
                        group_id,
                        object_id, "received 'cache object expired' for unknown group"
                    );
                    return;
                };
                let Some(cache) = group.cache() else {
                    // Some instance caches this group, this one does not.
                    // Nothing to update here.
                    return;
                };

                if cache.contains(object_id) {
                    cache.update_from_map(object_id, &properties);
                    cache.reorder(object_id);
                    info!(
                        group_id,
                        object_id, "received 'cache object expired', existing entity"
                    );
                } else {
                    cache.insert_from_map(object_id, &properties);
                    info!(
                        group_id,
                        object_id, "received 'cache object expired', new entity"
                    );
                }
                self.store.notify_object_expired(false, group_id, object_id);
            }
            EntityCacheEvent::ObjectRemove {
                group_id,
                object_id,
            } => {
                let Some(group) = self.store.group(group_id) else {
                    warn!(
                        group_id,
                        object_id, "received 'cache object remove' for unknown group"
                    );
                    return;
                };
                let Some(cache) = group.cache() else {
                    return;
                };
                cache.remove_from_cache(object_id);
                info!(group_id, object_id, "received 'cache object remove'");
            }
        }
    }

    fn apply_relation(&self, event: RelationCacheEvent) {
        let relation_id = match &event {
            RelationCacheEvent::Add { relation_id, .. }
            | RelationCacheEvent::AddAll { relation_id, .. }
            | RelationCacheEvent::Clear { relation_id }
            | RelationCacheEvent::Remove { relation_id, .. }
            | RelationCacheEvent::RemoveAll { relation_id, .. }
            | RelationCacheEvent::RemoveLeftValue { relation_id, .. }
            | RelationCacheEvent::RemoveRightValue { relation_id, .. }
            | RelationCacheEvent::ReplaceAll { relation_id, .. }
            | RelationCacheEvent::Reset { relation_id } => *relation_id,
        };

        let Some(relation) = self.store.cached_relation(relation_id) else {
            warn!(relation_id, "received relation event for unknown relation");
            return;
        };

        match event {
            RelationCacheEvent::Add { left, right, .. } => {
                relation.add(left, right, MutationFlags::REMOTE);
                info!(relation_id, left, right, "received 'rel add'");
            }
            RelationCacheEvent::AddAll { pairs, .. } => {
                relation.add_all(&pairs, MutationFlags::REMOTE);
                info!(relation_id, count = pairs.len(), "received 'rel add all'");
            }
            RelationCacheEvent::Clear { .. } => {
                relation.clear(MutationFlags::REMOTE);
                info!(relation_id, "received 'rel clear'");
            }
            RelationCacheEvent::Remove { left, right, .. } => {
                relation.remove(left, right, MutationFlags::REMOTE);
                info!(relation_id, left, right, "received 'rel remove'");
            }
            RelationCacheEvent::RemoveAll { pairs, .. } => {
                relation.remove_all(&pairs, MutationFlags::REMOTE);
                info!(relation_id, count = pairs.len(), "received 'rel remove all'");
            }
            RelationCacheEvent::RemoveLeftValue { left, .. } => {
                relation.remove_left_value(left, MutationFlags::REMOTE);
                info!(relation_id, left, "received 'rel remove left'");
            }
            RelationCacheEvent::RemoveRightValue { right, .. } => {
                relation.remove_right_value(right, MutationFlags::REMOTE);
                info!(relation_id, right, "received 'rel remove right'");
            }
            RelationCacheEvent::ReplaceAll { pairs, .. } => {
                relation.replace_all(&pairs, MutationFlags::REMOTE);
                info!(relation_id, count = pairs.len(), "received 'rel replace all'");
            }
            RelationCacheEvent::Reset { .. } => {
                relation.reset(true, false);
                info!(relation_id, "received 'rel reset'");
            }
        }
    }
}

impl MessageHandler for CacheEventApplier {
    fn on_message(&self, message: &Message) {
        if !self.store.is_initialized() {
            debug!("entity store is not yet initialized, ignoring message");
            return;
        }

        let event: CacheEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(error) => {
                info!(%error, "message payload is not a cache event, ignoring");
                return;
            }
        };

        let Some(sender) = message.properties.get(CLIENT_UUID_PROPERTY) else {
            info!("message carries no sender client id, ignoring");
            return;
        };
        if *sender == self.instance_id {
            // Sent from self; everyone subscribes to the topic they publish to.
            return;
        }

        match event {
            CacheEvent::Entity(event) => self.apply_entity(event),
            CacheEvent::Relation(event) => self.apply_relation(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PropertyMap, RelationPair, CACHE_TOPIC};
    use crate::store::{CachedRelation as _, EntityGroup as _};
    use crate::testing::{MemoryGroup, MemoryRelation, MemoryStore};
    use bytes::Bytes;
    use std::collections::HashMap;

    fn envelope(event: &CacheEvent, sender: Option<&str>) -> Message {
        let mut properties = HashMap::new();
        if let Some(sender) = sender {
            properties.insert(CLIENT_UUID_PROPERTY.to_string(), sender.to_string());
        }
        Message {
            subject: CACHE_TOPIC.to_string(),
            properties,
            payload: Bytes::from(serde_json::to_vec(event).unwrap()),
        }
    }

    fn store_with_cached_group() -> (Arc<MemoryStore>, Arc<MemoryGroup>) {
        let store = Arc::new(MemoryStore::new());
        let group = store.register_group(MemoryGroup::cached(1, true));
        (store, group)
    }

    fn props(entries: &[(&str, &str)]) -> PropertyMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_object_reset_inserts_new_entity() {
        let (store, group) = store_with_cached_group();
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectReset {
            group_id: 1,
            object_id: 42,
            properties: props(&[("name", "x")]),
        });
        applier.on_message(&envelope(&event, Some("peer")));

        assert_eq!(group.write_map(42), Some(props(&[("name", "x")])));
        // Local listeners were told, without distribution.
        assert_eq!(store.expired_notifications(false), vec![(1, 42)]);
    }

    #[test]
    fn test_object_reset_updates_existing_entity() {
        let (store, group) = store_with_cached_group();
        group.seed(42, props(&[("name", "old")]));
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectReset {
            group_id: 1,
            object_id: 42,
            properties: props(&[("name", "new")]),
        });
        applier.on_message(&envelope(&event, Some("peer")));

        assert_eq!(group.write_map(42), Some(props(&[("name", "new")])));
    }

    #[test]
    fn test_self_originated_envelope_is_dropped() {
        let (store, group) = store_with_cached_group();
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectReset {
            group_id: 1,
            object_id: 42,
            properties: props(&[("name", "x")]),
        });
        applier.on_message(&envelope(&event, Some("self")));

        assert_eq!(group.write_map(42), None);
        assert!(store.expired_notifications(false).is_empty());
    }

    #[test]
    fn test_missing_sender_property_is_dropped() {
        let (store, group) = store_with_cached_group();
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectReset {
            group_id: 1,
            object_id: 42,
            properties: props(&[("name", "x")]),
        });
        applier.on_message(&envelope(&event, None));

        assert_eq!(group.write_map(42), None);
    }

    #[test]
    fn test_uninitialized_store_drops_everything() {
        let (store, group) = store_with_cached_group();
        store.set_initialized(false);
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectReset {
            group_id: 1,
            object_id: 42,
            properties: props(&[("name", "x")]),
        });
        applier.on_message(&envelope(&event, Some("peer")));

        assert_eq!(group.write_map(42), None);
    }

    #[test]
    fn test_undecodable_payload_is_dropped() {
        let (store, _group) = store_with_cached_group();
        let applier = CacheEventApplier::new(store.clone(), "self");

        let mut properties = HashMap::new();
        properties.insert(CLIENT_UUID_PROPERTY.to_string(), "peer".to_string());
        applier.on_message(&Message {
            subject: CACHE_TOPIC.to_string(),
            properties,
            payload: Bytes::from_static(b"not json"),
        });

        assert!(store.expired_notifications(false).is_empty());
    }

    #[test]
    fn test_plain_group_tolerated_silently() {
        let store = Arc::new(MemoryStore::new());
        store.register_group(MemoryGroup::plain(2, true));
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectReset {
            group_id: 2,
            object_id: 9,
            properties: props(&[("name", "x")]),
        });
        applier.on_message(&envelope(&event, Some("peer")));

        // No cache on this instance: no notification, no error.
        assert!(store.expired_notifications(false).is_empty());
    }

    #[test]
    fn test_object_remove_is_idempotent() {
        let (store, group) = store_with_cached_group();
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::ObjectRemove {
            group_id: 1,
            object_id: 77,
        });
        // 77 was never cached; applying twice must be a quiet no-op.
        applier.on_message(&envelope(&event, Some("peer")));
        applier.on_message(&envelope(&event, Some("peer")));

        assert_eq!(group.write_map(77), None);
    }

    #[test]
    fn test_full_reset_applies_without_distribution() {
        let (store, _group) = store_with_cached_group();
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::FullReset);
        applier.on_message(&envelope(&event, Some("peer")));

        assert_eq!(store.full_resets(), vec![(true, false)]);
    }

    #[test]
    fn test_group_reset_applies_without_distribution() {
        let (store, _group) = store_with_cached_group();
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Entity(EntityCacheEvent::GroupReset { group_id: 1 });
        applier.on_message(&envelope(&event, Some("peer")));

        assert_eq!(store.group_resets(), vec![(1, true, false)]);
    }

    #[test]
    fn test_relation_mutations_use_remote_flags() {
        let store = Arc::new(MemoryStore::new());
        let relation = store.register_relation(MemoryRelation::new(5));
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Relation(RelationCacheEvent::Add {
            relation_id: 5,
            left: 1,
            right: 2,
        });
        applier.on_message(&envelope(&event, Some("peer")));

        assert!(relation.contains(RelationPair::new(1, 2)));
        assert_eq!(relation.last_flags(), Some(MutationFlags::REMOTE));
    }

    #[test]
    fn test_relation_reset_event() {
        let store = Arc::new(MemoryStore::new());
        let relation = store.register_relation(MemoryRelation::new(5));
        relation.add(1, 2, MutationFlags::REMOTE);
        let applier = CacheEventApplier::new(store.clone(), "self");

        let event = CacheEvent::Relation(RelationCacheEvent::Reset { relation_id: 5 });
        applier.on_message(&envelope(&event, Some("peer")));

        assert!(!relation.contains(RelationPair::new(1, 2)));
        assert_eq!(relation.resets(), vec![(true, false)]);
    }

    #[test]
    fn test_unknown_relation_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let applier = CacheEventApplier::new(store, "self");

        let event = CacheEvent::Relation(RelationCacheEvent::Clear { relation_id: 404 });
        // Must not panic.
        applier.on_message(&envelope(&event, Some("peer")));
    }
}
