// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache message manager: lifecycle and the send side of the bus.
//!
//! The manager owns the publish and subscribe connections, translates
//! local cache-change notifications into outbound events, and hands
//! inbound envelopes to the [`CacheEventApplier`]. It never repeats
//! actions sent from itself.
//!
//! One async envelope is handled at a time. This should be fine.

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::applier::CacheEventApplier;
use crate::config::{BusConfig, Configurable};
use crate::listener::{CacheListener, CachedRelationListener};
use crate::protocol::{
    CacheEvent, EntityCacheEvent, GroupId, ObjectId, RelationCacheEvent, RelationId,
    RelationPair, CACHE_TOPIC,
};
use crate::publisher::TopicPublisher;
use crate::pubsub::{Connection, ConnectionFactory};
use crate::store::EntityStore;
use crate::subscriber::AsyncSubscriber;

/// Resources attached by one successful connect.
struct Active {
    publisher: TopicPublisher,
    subscriber: AsyncSubscriber,
    // Connections are held so the transport stays alive; dropping them
    // closes the underlying links.
    _publish_connection: Box<dyn Connection>,
    _subscribe_connection: Box<dyn Connection>,
    instance_id: String,
}

impl Active {
    async fn close(self) {
        self.publisher.close().await;
        self.subscriber.close().await;
    }
}

/// Handles cache maintenance events for both sending and handling updates.
pub struct CacheMessageManager {
    store: Arc<dyn EntityStore>,
    publish_factory: Arc<dyn ConnectionFactory>,
    subscribe_factory: Arc<dyn ConnectionFactory>,
    config: ArcSwap<BusConfig>,
    active: RwLock<Option<Active>>,
}

impl CacheMessageManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        publish_factory: Arc<dyn ConnectionFactory>,
        subscribe_factory: Arc<dyn ConnectionFactory>,
        config: &BusConfig,
    ) -> Self {
        Self {
            store,
            publish_factory,
            subscribe_factory,
            config: ArcSwap::from_pointee(config.clone()),
            active: RwLock::new(None),
        }
    }

    /// Starts the publisher/subscriber on the cache topic.
    pub async fn start(&self) -> Result<()> {
        self.connect(self.publish_factory.clone(), self.subscribe_factory.clone())
            .await
    }

    /// (Re)establishes the connections. Any previously attached publisher
    /// or subscriber is closed first; failures close whatever was built so
    /// far and surface to the caller.
    pub async fn connect(
        &self,
        publish_factory: Arc<dyn ConnectionFactory>,
        subscribe_factory: Arc<dyn ConnectionFactory>,
    ) -> Result<()> {
        let existing = self.active.write().take();
        if let Some(active) = existing {
            active.close().await;
        }

        let publish_connection = publish_factory.connect().await?;
        let instance_id = publish_connection.client_id().to_string();
        let publisher = TopicPublisher::new(
            publish_connection.publisher(),
            CACHE_TOPIC,
            instance_id.clone(),
        );
        info!(%instance_id, "cache bus publish connection established");

        let subscribe_connection = match subscribe_factory.connect().await {
            Ok(connection) => connection,
            Err(error) => {
                publisher.close().await;
                return Err(error);
            }
        };
        let applier = Arc::new(CacheEventApplier::new(
            self.store.clone(),
            instance_id.clone(),
        ));
        let subscriber = match AsyncSubscriber::start(
            subscribe_connection.subscriber(),
            CACHE_TOPIC,
            applier,
        )
        .await
        {
            Ok(subscriber) => subscriber,
            Err(error) => {
                publisher.close().await;
                return Err(error);
            }
        };
        info!(
            client_id = %subscribe_connection.client_id(),
            "cache bus subscribe connection established"
        );

        *self.active.write() = Some(Active {
            publisher,
            subscriber,
            _publish_connection: publish_connection,
            _subscribe_connection: subscribe_connection,
            instance_id,
        });
        Ok(())
    }

    /// Closes the publisher and subscriber. Safe if never started.
    pub async fn close(&self) {
        info!("cache message manager is closing");
        let active = self.active.write().take();
        if let Some(active) = active {
            active.close().await;
        }
    }

    /// The client identifier assigned at connect time, if connected.
    pub fn instance_id(&self) -> Option<String> {
        self.active.read().as_ref().map(|a| a.instance_id.clone())
    }

    fn maximum_relation_size(&self) -> usize {
        self.config.load().maximum_relation_size
    }

    /// Stamps the sender property and publishes. Transport failures are
    /// logged and swallowed; the remote side keeps whatever state it had
    /// and the authoritative store remains the source of truth.
    fn send(&self, event: CacheEvent) {
        let mode = self.config.load().delivery_mode;
        let guard = self.active.read();
        let Some(active) = guard.as_ref() else {
            debug!("cache bus is not connected, dropping outbound event");
            return;
        };
        if let Err(error) = active.publisher.send(&event, mode) {
            info!(%error, "failed to send cache event");
        }
    }
}

impl Configurable for CacheMessageManager {
    fn configure(&self, config: &BusConfig) {
        self.config.store(Arc::new(config.clone()));
    }
}

//
// CacheListener methods
//

impl CacheListener for CacheMessageManager {
    fn cache_full_reset(&self) {
        // All instances would slam the authoritative store at once.
        info!("distributing a full cache reset is disabled");
    }

    fn cache_group_reset(&self, group_id: GroupId) {
        let Some(group) = self.store.group(group_id) else {
            debug!(group_id, "group reset for unknown group, not distributing");
            return;
        };
        if !group.distribute() {
            return;
        }
        info!(group_id, "sending 'cache group reset'");
        self.send(EntityCacheEvent::GroupReset { group_id }.into());
    }

    fn cache_object_expired(&self, group_id: GroupId, object_id: ObjectId) {
        let Some(group) = self.store.group(group_id) else {
            debug!(group_id, "object expired in unknown group, not distributing");
            return;
        };
        if !group.distribute() {
            return;
        }

        // The entity can be gone already: it was updated and then removed
        // before this notification fired. A removal event will follow, so
        // the expiration is not worth restating.
        let Some(properties) = group.write_map(object_id) else {
            return;
        };
        info!(group_id, object_id, "sending 'cache object expired'");
        self.send(
            EntityCacheEvent::ObjectReset {
                group_id,
                object_id,
                properties,
            }
            .into(),
        );
    }

    fn cache_object_removed(&self, group_id: GroupId, object_id: ObjectId) {
        let Some(group) = self.store.group(group_id) else {
            debug!(group_id, "object removed in unknown group, not distributing");
            return;
        };
        if !group.distribute() {
            return;
        }
        info!(group_id, object_id, "sending 'remove from cache'");
        self.send(
            EntityCacheEvent::ObjectRemove {
                group_id,
                object_id,
            }
            .into(),
        );
    }
}

//
// CachedRelationListener methods
//

impl CachedRelationListener for CacheMessageManager {
    fn add(&self, relation_id: RelationId, left: ObjectId, right: ObjectId) {
        info!(relation_id, left, right, "sending 'rel add'");
        self.send(
            RelationCacheEvent::Add {
                relation_id,
                left,
                right,
            }
            .into(),
        );
    }

    fn add_all(&self, relation_id: RelationId, pairs: &[RelationPair]) {
        if pairs.len() > self.maximum_relation_size() {
            self.reset(relation_id);
        } else {
            info!(relation_id, count = pairs.len(), "sending 'rel add all'");
            self.send(
                RelationCacheEvent::AddAll {
                    relation_id,
                    pairs: pairs.to_vec(),
                }
                .into(),
            );
        }
    }

    fn clear(&self, relation_id: RelationId) {
        info!(relation_id, "sending 'rel clear'");
        self.send(RelationCacheEvent::Clear { relation_id }.into());
    }

    fn remove(&self, relation_id: RelationId, left: ObjectId, right: ObjectId) {
        info!(relation_id, left, right, "sending 'rel remove'");
        self.send(
            RelationCacheEvent::Remove {
                relation_id,
                left,
                right,
            }
            .into(),
        );
    }

    fn remove_all(&self, relation_id: RelationId, pairs: &[RelationPair]) {
        if pairs.len() > self.maximum_relation_size() {
            self.reset(relation_id);
        } else {
            info!(relation_id, count = pairs.len(), "sending 'rel remove all'");
            self.send(
                RelationCacheEvent::RemoveAll {
                    relation_id,
                    pairs: pairs.to_vec(),
                }
                .into(),
            );
        }
    }

    fn remove_left_value(&self, relation_id: RelationId, left: ObjectId) {
        info!(relation_id, left, "sending 'rel remove left'");
        self.send(RelationCacheEvent::RemoveLeftValue { relation_id, left }.into());
    }

    fn remove_right_value(&self, relation_id: RelationId, right: ObjectId) {
        info!(relation_id, right, "sending 'rel remove right'");
        self.send(RelationCacheEvent::RemoveRightValue { relation_id, right }.into());
    }

    fn replace_all(&self, relation_id: RelationId, pairs: &[RelationPair]) {
        if pairs.len() > self.maximum_relation_size() {
            self.reset(relation_id);
        } else {
            info!(relation_id, count = pairs.len(), "sending 'rel replace all'");
            self.send(
                RelationCacheEvent::ReplaceAll {
                    relation_id,
                    pairs: pairs.to_vec(),
                }
                .into(),
            );
        }
    }

    fn reset(&self, relation_id: RelationId) {
        info!(relation_id, "sending 'rel reset'");
        self.send(RelationCacheEvent::Reset { relation_id }.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryMode;
    use crate::protocol::CLIENT_UUID_PROPERTY;
    use crate::pubsub::{Message, StubBus, Subscription};
    use crate::testing::{MemoryGroup, MemoryStore};
    use futures::StreamExt;
    use std::time::Duration;

    async fn probe(bus: &StubBus) -> Subscription {
        bus.subscriber().subscribe(CACHE_TOPIC).await.unwrap()
    }

    async fn next_event(probe: &mut Subscription) -> (Message, CacheEvent) {
        let message = tokio::time::timeout(Duration::from_secs(1), probe.next())
            .await
            .expect("expected an outbound envelope")
            .expect("stream ended");
        let event = serde_json::from_slice(&message.payload).unwrap();
        (message, event)
    }

    async fn assert_silent(probe: &mut Subscription) {
        let result = tokio::time::timeout(Duration::from_millis(50), probe.next()).await;
        assert!(result.is_err(), "expected no outbound envelope");
    }

    async fn started_manager(
        bus: &StubBus,
        store: Arc<MemoryStore>,
    ) -> Arc<CacheMessageManager> {
        let factory = bus.connection_factory();
        let manager = Arc::new(CacheMessageManager::new(
            store,
            factory.clone(),
            factory,
            &BusConfig::default(),
        ));
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_full_reset_is_not_broadcast() {
        let bus = StubBus::default();
        let store = Arc::new(MemoryStore::new());
        let manager = started_manager(&bus, store).await;

        let mut probe = probe(&bus).await;
        manager.cache_full_reset();
        assert_silent(&mut probe).await;
    }

    #[tokio::test]
    async fn test_distribute_gating() {
        let bus = StubBus::default();
        let store = Arc::new(MemoryStore::new());
        store.register_group(MemoryGroup::cached(1, false));
        let manager = started_manager(&bus, store).await;

        let mut probe = probe(&bus).await;
        manager.cache_group_reset(1);
        manager.cache_object_removed(1, 5);
        assert_silent(&mut probe).await;
    }

    #[tokio::test]
    async fn test_group_reset_is_broadcast() {
        let bus = StubBus::default();
        let store = Arc::new(MemoryStore::new());
        store.register_group(MemoryGroup::cached(3, true));
        let manager = started_manager(&bus, store).await;

        let mut probe = probe(&bus).await;
        manager.cache_group_reset(3);

        let (message, event) = next_event(&mut probe).await;
        assert_eq!(
            event,
            CacheEvent::Entity(EntityCacheEvent::GroupReset { group_id: 3 })
        );
        assert_eq!(
            message.properties.get(CLIENT_UUID_PROPERTY),
            manager.instance_id().as_ref()
        );
    }

    #[tokio::test]
    async fn test_expired_entity_already_removed_is_suppressed() {
        let bus = StubBus::default();
        let store = Arc::new(MemoryStore::new());
        store.register_group(MemoryGroup::cached(1, true));
        let manager = started_manager(&bus, store).await;

        let mut probe = probe(&bus).await;
        // Nothing was seeded for id 7: the lookup misses, as it does when
        // the entity is removed between the update and this notification.
        manager.cache_object_expired(1, 7);
        assert_silent(&mut probe).await;
    }

    #[tokio::test]
    async fn test_bulk_within_threshold_is_sent_verbatim() {
        let bus = StubBus::default();
        let store = Arc::new(MemoryStore::new());
        let manager = started_manager(&bus, store).await;
        manager.configure(&BusConfig {
            maximum_relation_size: 3,
            delivery_mode: DeliveryMode::Persistent,
        });

        let pairs: Vec<RelationPair> =
            (0..3).map(|i| RelationPair::new(i, i + 100)).collect();

        let mut probe = probe(&bus).await;
        manager.add_all(5, &pairs);

        let (_, event) = next_event(&mut probe).await;
        assert_eq!(
            event,
            CacheEvent::Relation(RelationCacheEvent::AddAll {
                relation_id: 5,
                pairs,
            })
        );
    }

    #[tokio::test]
    async fn test_oversized_bulk_degrades_to_reset() {
        let bus = StubBus::default();
        let store = Arc::new(MemoryStore::new());
        let manager = started_manager(&bus, store).await;
        manager.configure(&BusConfig {
            maximum_relation_size: 3,
            delivery_mode: DeliveryMode::Persistent,
        });

        let pairs: Vec<RelationPair> =
            (0..4).map(|i| RelationPair::new(i, i + 100)).collect();

        let mut probe = probe(&bus).await;
        manager.replace_all(5, &pairs);

        let (_, event) = next_event(&mut probe).await;
        assert_eq!(
            event,
            CacheEvent::Relation(RelationCacheEvent::Reset { relation_id: 5 })
        );
        assert_silent(&mut probe).await;
    }

    #[tokio::test]
    async fn test_connect_is_an_idempotent_restart() {
        let bus = StubBus::default();
        let store = Arc::new(MemoryStore::new());
        store.register_group(MemoryGroup::cached(3, true));
        let manager = started_manager(&bus, store).await;
        let first_id = manager.instance_id().unwrap();

        let factory = bus.connection_factory();
        manager.connect(factory.clone(), factory).await.unwrap();
        let second_id = manager.instance_id().unwrap();
        assert_ne!(first_id, second_id);

        // Still able to publish after the restart.
        let mut probe = probe(&bus).await;
        manager.cache_group_reset(3);
        let (_, event) = next_event(&mut probe).await;
        assert_eq!(
            event,
            CacheEvent::Entity(EntityCacheEvent::GroupReset { group_id: 3 })
        );
    }

    #[tokio::test]
    async fn test_close_without_start_is_safe() {
        let bus = StubBus::default();
        let factory = bus.connection_factory();
        let manager = CacheMessageManager::new(
            Arc::new(MemoryStore::new()),
            factory.clone(),
            factory,
            &BusConfig::default(),
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn test_send_before_start_is_dropped() {
        let bus = StubBus::default();
        let factory = bus.connection_factory();
        let manager = CacheMessageManager::new(
            Arc::new(MemoryStore::new()),
            factory.clone(),
            factory,
            &BusConfig::default(),
        );
        // Not connected: must not panic, nothing to observe.
        manager.clear(9);
    }
}
