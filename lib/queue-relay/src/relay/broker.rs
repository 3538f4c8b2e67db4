// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RelayOptions;
use crate::backend::{Backend, QueueItem, QueueService};
use crate::backoff::Backoff;
use crate::config::RelayConfig;
use crate::error::{BackendError, ErrorKind, RelayError};
use crate::message::{Message, QueueEnvelope};
use crate::naming::RelayNames;
use crate::overflow::OverflowCodec;
use crate::registry::{CorrelationRegistry, PendingCall, ResponseAwaiter, ResponseDisposition};
use crate::reliable_send::ReliableSender;
use crate::retriever::{InvalidQueueHandler, MessageHandler, MessageRetriever};
use crate::sender::{DestinationGoneHandler, MessageSender};
use crate::stats::{RelayStats, RelayStatsSnapshot};

/// Routes every item of the response queue to its pending call.
struct ResponseHandler {
    queues: Arc<dyn QueueService>,
    codec: Arc<OverflowCodec>,
    registry: Arc<CorrelationRegistry>,
    stats: Arc<RelayStats>,
}

impl ResponseHandler {
    /// Returns false if the item should stay in the queue for redelivery.
    async fn route(&self, item: &QueueItem) -> bool {
        match self.codec.load(&item.body).await {
            Ok(response) => {
                let id = response.id();
                let referral = self.codec.is_oversized(&response);
                let disposition = self.registry.on_response_received(response);
                self.stats
                    .record_response(disposition == ResponseDisposition::Completed);
                if referral && let Err(e) = self.codec.discard(id).await {
                    tracing::debug!(message_id = %id, "overflow cleanup failed: {e}");
                }
                true
            }
            Err(err) if err.kind() == ErrorKind::Codec => {
                tracing::warn!(receipt = %item.receipt, "deleting undecodable response: {err}");
                true
            }
            Err(err) if err.kind() == ErrorKind::DestinationGone => {
                // the payload can never be resolved; fail the caller instead
                if let Ok(envelope) = QueueEnvelope::decode(&item.body)
                    && let Some(call) = envelope.relates_to
                {
                    self.registry.complete(&call, Err(err));
                }
                true
            }
            Err(err) => {
                tracing::debug!(receipt = %item.receipt, "response payload unavailable: {err}");
                false
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ResponseHandler {
    async fn handle(&self, queue: &str, items: Vec<QueueItem>) {
        for item in items {
            if !self.route(&item).await {
                continue;
            }
            match self.queues.delete(queue, &item.receipt).await {
                Ok(()) => {}
                Err(BackendError::MissingItem(_)) => {
                    tracing::debug!(
                        queue,
                        receipt = %item.receipt,
                        "response already redelivered"
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        queue,
                        receipt = %item.receipt,
                        "failed to delete response: {e}"
                    );
                }
            }
        }
    }
}

/// Pools started by [`BrokerRelay::start`].
struct Running {
    response_queue: String,
    retriever: MessageRetriever,
    sender: MessageSender,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Broker end: sends requests and correlates their responses.
pub struct BrokerRelay {
    backend: Backend,
    names: RelayNames,
    config: RelayConfig,
    registry: Arc<CorrelationRegistry>,
    codec: Arc<OverflowCodec>,
    reliable: ReliableSender,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
    running: Mutex<Option<Arc<Running>>>,
}

impl BrokerRelay {
    pub(super) async fn new(backend: Backend, options: RelayOptions) -> Result<Self, RelayError> {
        let RelayOptions { session_id, config } = options;
        let names = RelayNames::new(&config.persist.name_prefix, session_id);
        let container = names.overflow_container();
        backend
            .blobs
            .create_container(&container)
            .await
            .map_err(|e| RelayError::from_backend(e, &container))?;

        let stats = Arc::new(RelayStats::default());
        let codec = Arc::new(OverflowCodec::new(
            backend.blobs.clone(),
            container,
            config.persist.inline_threshold,
        ));
        let reliable = ReliableSender::new(backend.queues.clone(), &config.send, stats.clone());

        Ok(Self {
            backend,
            names,
            config,
            registry: Arc::new(CorrelationRegistry::new()),
            codec,
            reliable,
            stats,
            cancel: CancellationToken::new(),
            running: Mutex::new(None),
        })
    }

    /// Create the request queue of `service`. Returns its name.
    pub async fn create_request_storage(&self, service: &str) -> Result<String, RelayError> {
        let queue = self.names.request_queue(service);
        self.backend
            .queues
            .create_queue(&queue)
            .await
            .map_err(|e| RelayError::from_backend(e, &queue))?;
        tracing::debug!(service, queue = %queue, "request storage created");
        Ok(queue)
    }

    /// Create the response queue of this job incarnation and start the relay pools. Returns the
    /// response queue name.
    pub async fn start(&self, job_id: &str, requeue_count: u32) -> Result<String, RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Closed);
        }
        if self.running.lock().is_some() {
            return Err(RelayError::InvalidState("relay already started".to_string()));
        }

        let response_queue = self.names.response_queue(job_id, requeue_count);
        self.backend
            .queues
            .create_queue(&response_queue)
            .await
            .map_err(|e| RelayError::from_backend(e, &response_queue))?;

        let on_invalid: InvalidQueueHandler = {
            let registry = self.registry.clone();
            Arc::new(move |queue: &str, err: &BackendError| {
                registry.on_queue_invalid(queue, RelayError::from_backend(err.clone(), queue));
            })
        };
        let handler = Arc::new(ResponseHandler {
            queues: self.backend.queues.clone(),
            codec: self.codec.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
        });
        let retriever = MessageRetriever::new(
            response_queue.clone(),
            self.backend.queues.clone(),
            handler,
            Some(on_invalid),
            self.config.retriever.clone(),
            &self.cancel,
            self.stats.clone(),
        );

        let on_gone: DestinationGoneHandler = {
            let registry = self.registry.clone();
            Arc::new(move |queue: &str, err: &RelayError| {
                registry.on_queue_invalid(queue, err.clone());
            })
        };
        let sender = MessageSender::new(
            self.codec.clone(),
            self.reliable.clone(),
            self.config.sender.clone(),
            Backoff::from_config(&self.config.retriever),
            Some(on_gone),
            &self.cancel,
        );

        let sweeper = self
            .reliable
            .spawn_sweeper(self.config.send.sweep_interval(), self.cancel.child_token());

        let mut running = self.running.lock();
        if running.is_some() {
            sweeper.abort();
            return Err(RelayError::InvalidState("relay already started".to_string()));
        }
        retriever.start();
        sender.start();
        *running = Some(Arc::new(Running {
            response_queue: response_queue.clone(),
            retriever,
            sender,
            sweeper: Mutex::new(Some(sweeper)),
        }));
        tracing::info!(
            job_id,
            requeue_count,
            response_queue = %response_queue,
            "broker relay started"
        );
        Ok(response_queue)
    }

    /// Send `request` to `request_queue` and return the awaiter of its response.
    ///
    /// Resolves once the request has been delivered to the queue; delivery failures are returned
    /// directly and nothing stays registered.
    pub async fn send(
        &self,
        request_queue: &str,
        mut request: Message,
    ) -> Result<ResponseAwaiter, RelayError> {
        let running = self
            .running
            .lock()
            .clone()
            .ok_or_else(|| RelayError::InvalidState("relay not started".to_string()))?;
        if self.cancel.is_cancelled() {
            return Err(RelayError::Closed);
        }

        request.set_reply_to(&running.response_queue);
        let id = request.id();
        let (call, awaiter) = PendingCall::new(id, request_queue, &running.response_queue);
        self.registry.register(call)?;

        match running.sender.send(request_queue, request).await {
            Ok(()) => Ok(awaiter),
            Err(err) => {
                self.registry.withdraw(&id);
                tracing::debug!(
                    message_id = %id,
                    queue = request_queue,
                    "request not delivered: {err}"
                );
                Err(err)
            }
        }
    }

    pub fn response_queue(&self) -> Option<String> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.response_queue.clone())
    }

    pub fn outstanding(&self) -> usize {
        self.registry.outstanding()
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop every pool and fail outstanding calls with `Closed`.
    pub async fn close(&self) {
        self.cancel.cancel();
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.retriever.stop().await;
            running.sender.close().await;
            let sweeper = running.sweeper.lock().take();
            if let Some(sweeper) = sweeper {
                let _ = sweeper.await;
            }
        }
        self.reliable.close();
        let failed = self.registry.fail_all(RelayError::Closed);
        tracing::info!(failed, "broker relay closed");
    }
}

impl Drop for BrokerRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
