// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RelayOptions;
use crate::backend::{Backend, QueueItem, QueueService};
use crate::backoff::Backoff;
use crate::error::{BackendError, ErrorKind, RelayError};
use crate::message::{Message, MessageId, QueueEnvelope};
use crate::naming::RelayNames;
use crate::overflow::OverflowCodec;
use crate::prefetch::{CreditPrefetcher, PrefetchSource};
use crate::reliable_send::ReliableSender;
use crate::sender::{DestinationGoneHandler, MessageSender};
use crate::stats::{RelayStats, RelayStatsSnapshot};

/// Prefetch source over a request queue shared by the workers of a service.
struct InboundRequests {
    queue: String,
    queues: Arc<dyn QueueService>,
    codec: Arc<OverflowCodec>,
    visibility: std::time::Duration,
    stats: Arc<RelayStats>,
}

struct InboundRequest {
    id: MessageId,
    item: QueueItem,
}

impl InboundRequests {
    async fn delete(&self, item: &QueueItem) -> Result<(), RelayError> {
        match self.queues.delete(&self.queue, &item.receipt).await {
            Ok(()) | Err(BackendError::MissingItem(_)) => Ok(()),
            Err(e) => Err(RelayError::from_backend(e, &self.queue)),
        }
    }
}

#[async_trait]
impl PrefetchSource for InboundRequests {
    type Item = InboundRequest;
    type Output = Message;

    async fn fetch(&self) -> Result<Option<InboundRequest>, RelayError> {
        let items = self
            .queues
            .dequeue_batch(&self.queue, 1, self.visibility)
            .await
            .map_err(|e| RelayError::from_backend(e, &self.queue))?;
        let Some(item) = items.into_iter().next() else {
            self.stats.record_empty_poll();
            return Ok(None);
        };
        self.stats.record_batch(1);

        match QueueEnvelope::decode(&item.body) {
            Ok(envelope) => Ok(Some(InboundRequest {
                id: envelope.id,
                item,
            })),
            Err(err) => {
                tracing::warn!(queue = %self.queue, "deleting undecodable request: {err}");
                self.delete(&item).await?;
                Err(err)
            }
        }
    }

    fn dedup_token(&self, request: &InboundRequest) -> Option<String> {
        Some(request.id.to_string())
    }

    async fn admit(&self, request: InboundRequest) -> Result<Message, RelayError> {
        let message = self.codec.load(&request.item.body).await?;
        self.delete(&request.item).await?;
        if self.codec.is_oversized(&message)
            && let Err(e) = self.codec.discard(message.id()).await
        {
            tracing::debug!(message_id = %message.id(), "overflow cleanup failed: {e}");
        }
        Ok(message)
    }

    async fn discard(&self, request: InboundRequest) -> Result<(), RelayError> {
        tracing::debug!(message_id = %request.id, "duplicate request dropped");
        self.delete(&request.item).await
    }
}

/// Worker end: receives requests of one service and answers them on their reply queues.
pub struct WorkerRelay {
    request_queue: String,
    requests: CreditPrefetcher<InboundRequests>,
    sender: MessageSender,
    reliable: ReliableSender,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
}

impl WorkerRelay {
    pub(super) async fn new(
        backend: Backend,
        options: RelayOptions,
        request_queue: String,
    ) -> Result<Self, RelayError> {
        let RelayOptions { session_id, config } = options;
        let exists = backend
            .queues
            .queue_exists(&request_queue)
            .await
            .map_err(|e| RelayError::from_backend(e, &request_queue))?;
        if !exists {
            return Err(RelayError::destination_gone(&request_queue));
        }

        let names = RelayNames::new(&config.persist.name_prefix, session_id);
        let cancel = CancellationToken::new();
        let stats = Arc::new(RelayStats::default());
        let codec = Arc::new(OverflowCodec::new(
            backend.blobs.clone(),
            names.overflow_container(),
            config.persist.inline_threshold,
        ));
        let reliable = ReliableSender::new(backend.queues.clone(), &config.send, stats.clone());

        let on_gone: DestinationGoneHandler = Arc::new(|queue: &str, err: &RelayError| {
            tracing::warn!(queue, "reply queue gone; responses to it are dropped: {err}");
        });
        let sender = MessageSender::new(
            codec.clone(),
            reliable.clone(),
            config.sender.clone(),
            Backoff::from_config(&config.retriever),
            Some(on_gone),
            &cancel,
        );
        sender.start();
        let sweeper = reliable.spawn_sweeper(config.send.sweep_interval(), cancel.child_token());

        let requests = CreditPrefetcher::unbounded(
            InboundRequests {
                queue: request_queue.clone(),
                queues: backend.queues.clone(),
                codec,
                visibility: config.retriever.visibility_timeout(),
                stats: stats.clone(),
            },
            &config.prefetch,
            &cancel,
        );

        tracing::debug!(queue = %request_queue, "worker relay started");
        Ok(Self {
            request_queue,
            requests,
            sender,
            reliable,
            sweeper: Mutex::new(Some(sweeper)),
            stats,
            cancel,
        })
    }

    pub fn request_queue(&self) -> &str {
        &self.request_queue
    }

    /// The next request; repeated deliveries of a request are dropped.
    pub async fn receive(&self) -> Result<Message, RelayError> {
        self.requests.next().await
    }

    /// Answer `request` with `payload`.
    pub async fn reply(
        &self,
        request: &Message,
        payload: impl Into<Bytes>,
    ) -> Result<(), RelayError> {
        self.send_response(request, Message::response_to(request, payload)).await
    }

    /// Answer `request` with a fault carrying `payload`.
    pub async fn fault(
        &self,
        request: &Message,
        payload: impl Into<Bytes>,
    ) -> Result<(), RelayError> {
        self.send_response(request, Message::fault_for(request, payload)).await
    }

    /// Send `response` to the reply queue of `request`.
    pub async fn send_response(
        &self,
        request: &Message,
        response: Message,
    ) -> Result<(), RelayError> {
        let Some(queue) = request.reply_to() else {
            return Err(RelayError::InvalidState(format!(
                "request {} has no reply queue",
                request.id()
            )));
        };
        let id = response.id();
        self.sender.send(queue, response).await.inspect_err(|err| {
            if err.kind() == ErrorKind::DestinationGone {
                tracing::info!(message_id = %id, queue, "response dropped: {err}");
            }
        })
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.requests.close();
        self.sender.close().await;
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.reliable.close();
        tracing::debug!(queue = %self.request_queue, "worker relay closed");
    }
}

impl Drop for WorkerRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
