// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound side of the cache topic.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::config::DeliveryMode;
use crate::protocol::{CacheEvent, CLIENT_UUID_PROPERTY};
use crate::pubsub::{Message, Publisher};

/// Publishes cache events to the topic, stamping every envelope with this
/// instance's client identifier so peers can filter out their own traffic.
pub struct TopicPublisher {
    transport: Arc<dyn Publisher>,
    subject: String,
    client_id: String,
}

impl TopicPublisher {
    pub fn new(
        transport: Arc<dyn Publisher>,
        subject: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            subject: subject.into(),
            client_id: client_id.into(),
        }
    }

    /// The client identifier stamped on outbound envelopes.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Serialize and publish one event at the requested delivery mode.
    pub fn send(&self, event: &CacheEvent, mode: DeliveryMode) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let mut properties = HashMap::new();
        properties.insert(CLIENT_UUID_PROPERTY.to_string(), self.client_id.clone());

        self.transport.publish(
            Message {
                subject: self.subject.clone(),
                properties,
                payload: Bytes::from(payload),
            },
            mode,
        )
    }

    /// Flush outstanding messages before shutdown or restart.
    pub async fn close(&self) {
        if let Err(error) = self.transport.flush().await {
            tracing::debug!(%error, "flush on publisher close failed");
        }
    }
}
