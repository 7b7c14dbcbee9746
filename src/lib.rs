// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed cache coherence bus.
//!
//! Each process keeps local in-memory caches of entities and of
//! many-to-many relations between entity identifiers. The bus keeps those
//! caches approximately consistent across a fleet by broadcasting
//! invalidation and update events over a shared pub/sub topic.
//!
//! Data flow: local change → [`CacheMessageManager`] (translation) →
//! topic → every subscriber → self-filter → [`CacheEventApplier`] →
//! local store, with re-broadcast suppressed.
//!
//! The bus offers eventual coherence only. The authoritative store is
//! always the source of truth; a lost event means a peer keeps stale state
//! until the next event or reset, never corruption.

pub mod applier;
pub mod config;
pub mod listener;
pub mod manager;
pub mod protocol;
pub mod publisher;
pub mod pubsub;
pub mod store;
pub mod subscriber;
pub mod testing;

pub use applier::CacheEventApplier;
pub use config::{BusConfig, Configurable, ConfigError, DeliveryMode};
pub use listener::{CacheListener, CachedRelationListener};
pub use manager::CacheMessageManager;
pub use protocol::{
    CacheEvent, EntityCacheEvent, GroupId, ObjectId, PropertyMap, RelationCacheEvent,
    RelationId, RelationPair, CACHE_TOPIC, CLIENT_UUID_PROPERTY,
};
pub use publisher::TopicPublisher;
pub use store::{CachedGroup, CachedRelation, EntityGroup, EntityStore, MutationFlags};
pub use subscriber::{AsyncSubscriber, MessageHandler};
