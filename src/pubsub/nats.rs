// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! NATS implementation of the pubsub traits.
//!
//! Message properties are carried as NATS headers. Persistent envelopes are
//! published through JetStream so briefly disconnected peers do not miss
//! events; non-persistent envelopes go through the core client.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use flume::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot;
use tracing::error;
use uuid::Uuid;

use crate::config::DeliveryMode;
use super::{Connection, ConnectionFactory, Message, Publisher, Subscriber, Subscription};

/// Configuration for the NATS transport.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222").
    pub server_url: String,
}

impl NatsConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    /// Connect to the NATS server and return a client.
    pub async fn connect(&self) -> Result<Client> {
        async_nats::connect(&self.server_url)
            .await
            .context("failed to connect to NATS server")
    }
}

/// Connection factory over a NATS server.
///
/// NATS core has no broker-assigned string client id, so each connection is
/// assigned a fresh uuid at connect time.
pub struct NatsConnectionFactory {
    config: NatsConfig,
}

impl NatsConnectionFactory {
    pub fn new(config: NatsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for NatsConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let client = self.config.connect().await?;
        let jetstream = async_nats::jetstream::new(client.clone());
        Ok(Box::new(NatsConnection {
            client_id: Uuid::new_v4().to_string(),
            publisher: Arc::new(NatsPublisher::new(client.clone(), jetstream)),
            subscriber: Arc::new(NatsSubscriber { client }),
        }))
    }
}

struct NatsConnection {
    client_id: String,
    publisher: Arc<NatsPublisher>,
    subscriber: Arc<NatsSubscriber>,
}

impl Connection for NatsConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        self.publisher.clone()
    }

    fn subscriber(&self) -> Arc<dyn Subscriber> {
        self.subscriber.clone()
    }
}

/// Command sent to the publisher background task.
enum PublishCommand {
    Publish { message: Message, mode: DeliveryMode },
    Flush { done: oneshot::Sender<Result<()>> },
}

/// NATS implementation of the [`Publisher`] trait.
///
/// Uses a background task with a flume channel so `publish` never blocks
/// the mutator thread on the wire.
struct NatsPublisher {
    tx: Sender<PublishCommand>,
}

impl NatsPublisher {
    fn new(client: Client, jetstream: async_nats::jetstream::Context) -> Self {
        let (tx, rx) = flume::unbounded();
        tokio::spawn(Self::run_publish_loop(client, jetstream, rx));
        Self { tx }
    }

    /// Background task that processes publish commands. Transport errors
    /// are logged and the loop continues; losing a coherence event is
    /// tolerable because the authoritative store remains the source of
    /// truth.
    async fn run_publish_loop(
        client: Client,
        jetstream: async_nats::jetstream::Context,
        rx: Receiver<PublishCommand>,
    ) {
        while let Ok(cmd) = rx.recv_async().await {
            match cmd {
                PublishCommand::Publish { message, mode } => {
                    let headers = properties_to_headers(&message.properties);
                    let result = match mode {
                        DeliveryMode::Persistent => {
                            match jetstream
                                .publish_with_headers(message.subject, headers, message.payload)
                                .await
                            {
                                Ok(ack) => ack.await.map(|_| ()).map_err(anyhow::Error::from),
                                Err(e) => Err(anyhow::Error::from(e)),
                            }
                        }
                        DeliveryMode::NonPersistent => client
                            .publish_with_headers(message.subject, headers, message.payload)
                            .await
                            .map_err(anyhow::Error::from),
                    };
                    if let Err(e) = result {
                        error!("failed to publish message: {e}");
                    }
                }
                PublishCommand::Flush { done } => {
                    let result = client.flush().await.context("failed to flush");
                    // Ignore send error (receiver may have dropped)
                    let _ = done.send(result);
                }
            }
        }
    }
}

impl Publisher for NatsPublisher {
    fn publish(&self, message: Message, mode: DeliveryMode) -> Result<()> {
        self.tx
            .send(PublishCommand::Publish { message, mode })
            .map_err(|_| anyhow::anyhow!("publisher task has terminated"))
    }

    fn flush(&self) -> BoxFuture<'static, Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        let tx = self.tx.clone();

        async move {
            tx.send(PublishCommand::Flush { done: done_tx })
                .map_err(|_| anyhow::anyhow!("publisher task has terminated"))?;
            done_rx
                .await
                .map_err(|_| anyhow::anyhow!("publisher task has terminated"))?
        }
        .boxed()
    }
}

/// NATS implementation of the [`Subscriber`] trait.
struct NatsSubscriber {
    client: Client,
}

impl Subscriber for NatsSubscriber {
    fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<Subscription>> {
        let subject = subject.to_string();
        let client = self.client.clone();
        async move {
            let subscriber = client
                .subscribe(subject)
                .await
                .context("failed to subscribe")?;

            let stream: BoxStream<'static, Message> = subscriber
                .map(|msg| Message {
                    subject: msg.subject.to_string(),
                    properties: headers_to_properties(msg.headers.as_ref()),
                    payload: msg.payload,
                })
                .boxed();

            Ok(stream)
        }
        .boxed()
    }
}

fn properties_to_headers(properties: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in properties {
        headers.insert(name.as_str(), value.as_str());
    }
    headers
}

fn headers_to_properties(headers: Option<&HeaderMap>) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                properties.insert(name.to_string(), value.to_string());
            }
        }
    }
    properties
}
