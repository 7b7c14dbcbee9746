// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound side of the cache topic.
//!
//! One envelope is handled at a time on the delivery task; a slow handler
//! backs up delivery for this subscriber only.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pubsub::{Message, Subscriber};

/// Handles one inbound envelope. Implementations must never panic the
/// delivery task: a bad message is logged and dropped, not fatal.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &Message);
}

/// Dispatches each incoming envelope to a handler on a dedicated delivery
/// task.
pub struct AsyncSubscriber {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncSubscriber {
    /// Subscribe to the subject and start the delivery task.
    pub async fn start(
        subscriber: Arc<dyn Subscriber>,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let mut stream = subscriber.subscribe(subject).await?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        tracing::debug!("subscriber delivery task cancelled");
                        break;
                    }

                    message = stream.next() => {
                        match message {
                            Some(message) => handler.on_message(&message),
                            None => {
                                tracing::debug!("subscription stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop the delivery task and wait for it to finish. Safe to call more
    /// than once.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
