// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory stub implementation of the pubsub traits for testing.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::config::DeliveryMode;
use super::{Connection, ConnectionFactory, Message, Publisher, Subscriber, Subscription};

/// Shared state for stub connections.
///
/// Every connection made through [`StubBus::connection_factory`] sees the
/// same per-subject broadcast channels, so multiple "instances" in one test
/// process behave like peers on one topic.
#[derive(Clone)]
pub struct StubBus {
    inner: Arc<StubBusInner>,
}

struct StubBusInner {
    /// Map of subjects to broadcast channels.
    channels: RwLock<HashMap<String, broadcast::Sender<Message>>>,
    /// Channel capacity for new subscriptions.
    capacity: usize,
}

impl Default for StubBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StubBus {
    /// Create a new stub bus with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(StubBusInner {
                channels: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    /// Create a connection factory for this bus. Each connection is
    /// assigned a fresh client id.
    pub fn connection_factory(&self) -> Arc<StubConnectionFactory> {
        Arc::new(StubConnectionFactory { bus: self.clone() })
    }

    /// Create a publisher directly, bypassing the connection layer. Used by
    /// tests that need to inject raw messages.
    pub fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(StubPublisher { bus: self.clone() })
    }

    /// Create a subscriber directly, bypassing the connection layer.
    pub fn subscriber(&self) -> Arc<dyn Subscriber> {
        Arc::new(StubSubscriber { bus: self.clone() })
    }

    fn get_or_create_channel(&self, subject: &str) -> broadcast::Sender<Message> {
        let channels = self.inner.channels.read();
        if let Some(tx) = channels.get(subject) {
            return tx.clone();
        }
        drop(channels);

        let mut channels = self.inner.channels.write();
        // Double-check after acquiring write lock
        if let Some(tx) = channels.get(subject) {
            return tx.clone();
        }

        let (tx, _) = broadcast::channel(self.inner.capacity);
        channels.insert(subject.to_string(), tx.clone());
        tx
    }
}

/// Connection factory over a [`StubBus`].
pub struct StubConnectionFactory {
    bus: StubBus,
}

#[async_trait]
impl ConnectionFactory for StubConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(StubConnection {
            client_id: Uuid::new_v4().to_string(),
            bus: self.bus.clone(),
        }))
    }
}

struct StubConnection {
    client_id: String,
    bus: StubBus,
}

impl Connection for StubConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        self.bus.publisher()
    }

    fn subscriber(&self) -> Arc<dyn Subscriber> {
        self.bus.subscriber()
    }
}

struct StubPublisher {
    bus: StubBus,
}

impl Publisher for StubPublisher {
    fn publish(&self, message: Message, _mode: DeliveryMode) -> Result<()> {
        let tx = self.bus.get_or_create_channel(&message.subject);
        // Ignore send errors (no receivers is ok)
        let _ = tx.send(message);
        Ok(())
    }

    fn flush(&self) -> BoxFuture<'static, Result<()>> {
        // In-memory delivery is synchronous, nothing to flush
        async { Ok(()) }.boxed()
    }
}

struct StubSubscriber {
    bus: StubBus,
}

impl Subscriber for StubSubscriber {
    fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<Subscription>> {
        let tx = self.bus.get_or_create_channel(subject);
        let rx = tx.subscribe();

        let stream: BoxStream<'static, Message> = BroadcastStream::new(rx)
            .filter_map(|result| async move { result.ok() })
            .boxed();

        async move { Ok(stream) }.boxed()
    }
}
