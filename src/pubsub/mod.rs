// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! PubSub abstraction for the cache topic.
//!
//! This module provides traits for publish/subscribe messaging with
//! string-valued message properties, an in-memory stub for testing, and a
//! NATS implementation behind the `nats` feature.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::DeliveryMode;

#[cfg(feature = "nats")]
mod nats;
mod stub;

#[cfg(feature = "nats")]
pub use self::nats::{NatsConfig, NatsConnectionFactory};
pub use stub::{StubBus, StubConnectionFactory};

/// A typed envelope: serialized payload plus string-valued properties.
#[derive(Debug, Clone)]
pub struct Message {
    /// The subject the message was published to.
    pub subject: String,
    /// String-valued message properties carried outside the payload.
    pub properties: HashMap<String, String>,
    /// The serialized payload.
    pub payload: Bytes,
}

/// A subscription stream that yields messages.
pub type Subscription = BoxStream<'static, Message>;

/// Publisher side of the topic.
///
/// `publish` is fire-and-forget: implementations accept the envelope
/// without blocking on the wire, and transport failures surface in logs
/// rather than to the caller.
pub trait Publisher: Send + Sync {
    /// Publish a message at the requested delivery mode.
    fn publish(&self, message: Message, mode: DeliveryMode) -> Result<()>;

    /// Wait until previously accepted messages have reached the transport.
    fn flush(&self) -> BoxFuture<'static, Result<()>>;
}

/// Subscriber side of the topic.
pub trait Subscriber: Send + Sync {
    /// Subscribe to a subject, returning a message stream. The subscription
    /// remains active until the stream is dropped.
    fn subscribe(&self, subject: &str) -> BoxFuture<'static, Result<Subscription>>;
}

/// A started transport connection.
pub trait Connection: Send + Sync {
    /// The transport-assigned unique client identifier for this connection,
    /// fixed at connect time.
    fn client_id(&self) -> &str;

    fn publisher(&self) -> Arc<dyn Publisher>;

    fn subscriber(&self) -> Arc<dyn Subscriber>;
}

/// Opens transport connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}
