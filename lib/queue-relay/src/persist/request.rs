// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::time::MissedTickBehavior;

use super::SessionShared;
use crate::backend::{QueueItem, Receipt};
use crate::error::{BackendError, RelayError};
use crate::message::{Message, MessageId, QueueEnvelope};
use crate::prefetch::{CreditPrefetcher, PrefetchSource};

/// A request item dequeued but not yet handed out.
pub(crate) struct FetchedRequest {
    id: MessageId,
    item: QueueItem,
}

/// Prefetch source over the request queue.
pub(crate) struct RequestSource {
    shared: Arc<SessionShared>,
}

impl RequestSource {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    async fn delete_request(&self, receipt: &Receipt) -> Result<(), RelayError> {
        let queue = &self.shared.names.request_queue;
        match self.shared.backend.queues.delete(queue, receipt).await {
            Ok(()) => Ok(()),
            // visibility expired and another fetch owns the item now
            Err(BackendError::MissingItem(_)) => {
                tracing::debug!(queue = %queue, %receipt, "request already re-fetched");
                Ok(())
            }
            Err(e) => Err(RelayError::from_backend(e, queue)),
        }
    }
}

#[async_trait]
impl PrefetchSource for RequestSource {
    type Item = FetchedRequest;
    type Output = Message;

    async fn fetch(&self) -> Result<Option<FetchedRequest>, RelayError> {
        let queue = &self.shared.names.request_queue;
        let visibility = self.shared.config.retriever.visibility_timeout();
        let items = self
            .shared
            .backend
            .queues
            .dequeue_batch(queue, 1, visibility)
            .await
            .map_err(|e| RelayError::from_backend(e, queue))?;
        let Some(item) = items.into_iter().next() else {
            return Ok(None);
        };

        match QueueEnvelope::decode(&item.body) {
            Ok(envelope) => Ok(Some(FetchedRequest {
                id: envelope.id,
                item,
            })),
            Err(err) => {
                tracing::warn!(
                    queue = %queue,
                    receipt = %item.receipt,
                    "deleting undecodable request: {err}"
                );
                self.delete_request(&item.receipt).await?;
                Err(err)
            }
        }
    }

    fn dedup_token(&self, request: &FetchedRequest) -> Option<String> {
        Some(request.id.to_string())
    }

    async fn admit(&self, request: FetchedRequest) -> Result<Message, RelayError> {
        let message = self.shared.codec.load(&request.item.body).await?;
        let pending = &self.shared.names.pending_queue;
        self.shared
            .backend
            .queues
            .enqueue(pending, request.item.body.clone())
            .await
            .map_err(|e| RelayError::from_backend(e, pending))?;
        self.delete_request(&request.item.receipt).await?;
        tracing::trace!(message_id = %request.id, "request moved to pending");
        Ok(message)
    }

    async fn discard(&self, request: FetchedRequest) -> Result<(), RelayError> {
        tracing::debug!(message_id = %request.id, "deleting duplicate or aborted request");
        self.delete_request(&request.item.receipt).await
    }
}

/// Store the payload (blob first if oversized) and append the request.
pub(crate) async fn put_request(
    shared: &SessionShared,
    message: &Message,
) -> Result<(), RelayError> {
    let queue = &shared.names.request_queue;
    let body = shared.codec.store(message).await?;
    if let Err(e) = shared.backend.queues.enqueue(queue, body).await {
        if shared.codec.is_oversized(message)
            && let Err(cleanup) = shared.codec.discard(message.id()).await
        {
            tracing::debug!(message_id = %message.id(), "overflow cleanup failed: {cleanup}");
        }
        return Err(RelayError::from_backend(e, queue));
    }
    Ok(())
}

/// Move requests without a stored response from the pending queue back to the request queue.
/// Returns how many were moved.
pub(crate) async fn requeue_pending(
    shared: &SessionShared,
    answered: &DashSet<String>,
) -> Result<usize, RelayError> {
    let queues = &shared.backend.queues;
    let pending = &shared.names.pending_queue;
    let requests = &shared.names.request_queue;
    let visibility = shared.config.retriever.visibility_timeout();
    let mut requeued = 0;

    loop {
        let items = queues
            .dequeue_batch(pending, shared.config.retriever.batch_size, visibility)
            .await
            .map_err(|e| RelayError::from_backend(e, pending))?;
        if items.is_empty() {
            break;
        }

        for item in items {
            match QueueEnvelope::decode(&item.body) {
                Ok(envelope) if answered.contains(&envelope.id.to_string()) => {}
                Ok(_) => {
                    queues
                        .enqueue(requests, item.body.clone())
                        .await
                        .map_err(|e| RelayError::from_backend(e, requests))?;
                    requeued += 1;
                }
                Err(err) => {
                    tracing::warn!(queue = %pending, "dropping undecodable pending request: {err}");
                }
            }
            match queues.delete(pending, &item.receipt).await {
                Ok(()) | Err(BackendError::MissingItem(_)) => {}
                Err(e) => return Err(RelayError::from_backend(e, pending)),
            }
        }
    }
    Ok(requeued)
}

/// Invalidate the request prefetcher once the request queue disappears.
pub(crate) async fn check_loop(
    shared: Arc<SessionShared>,
    requests: CreditPrefetcher<RequestSource>,
) {
    let queue = shared.names.request_queue.clone();
    let mut ticker = tokio::time::interval(shared.config.persist.request_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let gone = match shared.backend.queues.queue_exists(&queue).await {
            Ok(exists) => !exists,
            Err(e) if e.is_destination_gone() => true,
            Err(e) => {
                tracing::debug!(queue = %queue, "request queue check failed: {e}");
                false
            }
        };
        if gone {
            tracing::warn!(queue = %queue, "request queue no longer exists");
            requests.invalidate(RelayError::destination_gone(&queue));
            break;
        }
    }
}
