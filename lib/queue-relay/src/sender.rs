// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound send pool.
//!
//! Messages are queued in memory and drained by a bounded pool of workers. Workers exist only
//! while there is work: `submit` and a periodic supervisor start them, and a worker that finds
//! the queue empty exits. A failed send goes back to the front of the queue and the worker backs
//! off; a destination that no longer exists fails the message for good.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::SenderConfig;
use crate::error::{ErrorKind, RelayError};
use crate::message::Message;
use crate::overflow::OverflowCodec;
use crate::reliable_send::ReliableSender;

pub type DeliveryOutcome = Result<(), RelayError>;

/// Invoked once per destination that turned out to no longer exist.
pub type DestinationGoneHandler = Arc<dyn Fn(&str, &RelayError) + Send + Sync>;

/// A message bound for one queue, optionally carrying a channel for its delivery outcome.
pub struct OutboundMessage {
    queue: String,
    message: Message,
    done: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl OutboundMessage {
    /// Fire-and-forget.
    pub fn new(queue: impl Into<String>, message: Message) -> Self {
        Self {
            queue: queue.into(),
            message,
            done: None,
        }
    }

    /// A message whose delivery outcome can be awaited on the returned receiver.
    pub fn tracked(
        queue: impl Into<String>,
        message: Message,
    ) -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        let outbound = Self {
            queue: queue.into(),
            message,
            done: Some(tx),
        };
        (outbound, rx)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    fn finish(mut self, outcome: DeliveryOutcome) {
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

struct SenderInner {
    outbound: Mutex<VecDeque<OutboundMessage>>,
    codec: Arc<OverflowCodec>,
    reliable: ReliableSender,
    on_destination_gone: Option<DestinationGoneHandler>,
    invalid_destinations: DashSet<String>,
    active_workers: AtomicUsize,
    config: SenderConfig,
    backoff: Backoff,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

pub struct MessageSender {
    inner: Arc<SenderInner>,
}

impl MessageSender {
    pub fn new(
        codec: Arc<OverflowCodec>,
        reliable: ReliableSender,
        config: SenderConfig,
        backoff: Backoff,
        on_destination_gone: Option<DestinationGoneHandler>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                outbound: Mutex::new(VecDeque::new()),
                codec,
                reliable,
                on_destination_gone,
                invalid_destinations: DashSet::new(),
                active_workers: AtomicUsize::new(0),
                config,
                backoff,
                cancel: cancel.child_token(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Start the supervisor that wakes the pool while messages are queued.
    pub fn start(&self) {
        let mut supervisor = self.inner.supervisor.lock();
        if supervisor.is_none() {
            *supervisor = Some(tokio::spawn(supervise(self.inner.clone())));
        }
    }

    pub fn submit(&self, outbound: OutboundMessage) {
        if self.inner.cancel.is_cancelled() {
            outbound.finish(Err(RelayError::Closed));
            return;
        }
        self.inner.outbound.lock().push_back(outbound);
        self.inner.ensure_workers();
    }

    /// Queue `message` for `queue` and wait for its delivery outcome.
    pub async fn send(&self, queue: &str, message: Message) -> DeliveryOutcome {
        let (outbound, rx) = OutboundMessage::tracked(queue, message);
        self.submit(outbound);
        rx.await.unwrap_or(Err(RelayError::Closed))
    }

    /// Number of messages waiting for a worker.
    pub fn pending(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::Acquire)
    }

    pub fn is_destination_gone(&self, queue: &str) -> bool {
        self.inner.invalid_destinations.contains(queue)
    }

    /// Stop the pool and fail every queued message with `Closed`.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        let drained: Vec<_> = self.inner.outbound.lock().drain(..).collect();
        for outbound in drained {
            outbound.finish(Err(RelayError::Closed));
        }
    }
}

impl Drop for MessageSender {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl SenderInner {
    fn ensure_workers(self: &Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let wanted = self.outbound.lock().len().min(self.config.concurrency);
            let active = self.active_workers.load(Ordering::Acquire);
            if active >= wanted {
                return;
            }
            if self
                .active_workers
                .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tokio::spawn(sender_worker(self.clone()));
            }
        }
    }

    async fn deliver(&self, outbound: &OutboundMessage) -> DeliveryOutcome {
        if self.invalid_destinations.contains(&outbound.queue) {
            return Err(RelayError::destination_gone(&outbound.queue));
        }
        let body = self.codec.store(&outbound.message).await?;
        self.reliable
            .send(&outbound.queue, body, outbound.message.id())
            .await
    }

    async fn fail_destination(&self, outbound: OutboundMessage, err: RelayError) {
        // the overflow container can be the missing resource rather than the queue
        let queue_gone =
            matches!(&err, RelayError::DestinationGone { queue, .. } if queue == &outbound.queue);
        if queue_gone && self.invalid_destinations.insert(outbound.queue.clone()) {
            tracing::warn!(queue = %outbound.queue, "destination gone: {err}");
            if let Some(handler) = &self.on_destination_gone {
                handler(&outbound.queue, &err);
            }
        }
        if self.codec.is_oversized(&outbound.message)
            && let Err(e) = self.codec.discard(outbound.message.id()).await
        {
            tracing::debug!(message_id = %outbound.message.id(), "overflow cleanup failed: {e}");
        }
        outbound.finish(Err(err));
    }
}

async fn supervise(inner: Arc<SenderInner>) {
    let mut ticker = tokio::time::interval(inner.config.supervisor_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => inner.ensure_workers(),
        }
    }
}

async fn sender_worker(inner: Arc<SenderInner>) {
    let mut backoff = inner.backoff.clone();

    while !inner.cancel.is_cancelled() {
        let Some(outbound) = inner.outbound.lock().pop_front() else {
            break;
        };

        match inner.deliver(&outbound).await {
            Ok(()) => {
                backoff.reset();
                outbound.finish(Ok(()));
            }
            Err(err) if err.kind() == ErrorKind::DestinationGone => {
                inner.fail_destination(outbound, err).await;
            }
            Err(err) if err.kind() == ErrorKind::Codec => {
                tracing::warn!(
                    message_id = %outbound.message.id(),
                    "dropping unencodable message: {err}"
                );
                outbound.finish(Err(err));
            }
            Err(err) => {
                let delay = backoff.next_delay();
                tracing::debug!(
                    queue = %outbound.queue,
                    message_id = %outbound.message.id(),
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "send failed, requeued: {err}"
                );
                inner.outbound.lock().push_front(outbound);
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    inner.active_workers.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlobStore, QueueService};
    use crate::backend::memory::{InMemoryBackend, Operation};
    use crate::config::SendConfig;
    use crate::message::QueueEnvelope;
    use crate::stats::RelayStats;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn sender(
        backend: &InMemoryBackend,
        on_gone: Option<DestinationGoneHandler>,
        cancel: &CancellationToken,
    ) -> MessageSender {
        backend.create_container("blobs").await.unwrap();
        let codec = Arc::new(OverflowCodec::new(Arc::new(backend.clone()), "blobs", 16));
        let reliable = ReliableSender::new(
            Arc::new(backend.clone()),
            &SendConfig::default(),
            Arc::new(RelayStats::default()),
        );
        let sender = MessageSender::new(
            codec,
            reliable,
            SenderConfig {
                concurrency: 2,
                supervisor_interval_ms: 10,
            },
            Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            on_gone,
            cancel,
        );
        sender.start();
        sender
    }

    #[tokio::test]
    async fn delivers_inline_and_overflow_messages() {
        let backend = InMemoryBackend::new();
        backend.create_queue("out").await.unwrap();
        let cancel = CancellationToken::new();
        let sender = sender(&backend, None, &cancel).await;

        sender.send("out", Message::new("small")).await.unwrap();
        sender
            .send("out", Message::new(vec![9u8; 17]))
            .await
            .unwrap();

        assert_eq!(backend.queue_len("out"), 2);
        assert_eq!(backend.blob_count("blobs"), 1);
        let items = backend
            .dequeue_batch("out", 2, Duration::from_secs(1))
            .await
            .unwrap();
        let referrals = items
            .iter()
            .filter(|i| QueueEnvelope::decode(&i.body).unwrap().stored_externally)
            .count();
        assert_eq!(referrals, 1);
        sender.close().await;
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_place() {
        tokio::time::pause();
        let backend = InMemoryBackend::new();
        backend.create_queue("out").await.unwrap();
        backend.fail_next(Operation::Enqueue, 3);
        let cancel = CancellationToken::new();
        let sender = sender(&backend, None, &cancel).await;

        sender.send("out", Message::new("retry me")).await.unwrap();
        assert_eq!(backend.calls(Operation::Enqueue), 4);
        assert_eq!(backend.queue_len("out"), 1);
        sender.close().await;
    }

    #[tokio::test]
    async fn failed_message_is_redelivered() {
        tokio::time::pause();
        let backend = InMemoryBackend::new();
        backend.create_queue("out").await.unwrap();
        let cancel = CancellationToken::new();
        let sender = sender(&backend, None, &cancel).await;
        backend.fail_next(Operation::Enqueue, 1);

        let first = Message::new("first");
        let (a, rx_a) = OutboundMessage::tracked("out", first.clone());
        sender.submit(a);
        let (b, rx_b) = OutboundMessage::tracked("out", Message::new("second"));
        sender.submit(b);
        rx_a.await.unwrap().unwrap();
        rx_b.await.unwrap().unwrap();
        assert_eq!(backend.queue_len("out"), 2);
        sender.close().await;
    }

    #[tokio::test]
    async fn missing_destination_is_terminal() {
        let backend = InMemoryBackend::new();
        let reports = Arc::new(AtomicUsize::new(0));
        let on_gone: DestinationGoneHandler = {
            let reports = reports.clone();
            Arc::new(move |queue: &str, err: &RelayError| {
                assert_eq!(queue, "nowhere");
                assert_eq!(err.kind(), ErrorKind::DestinationGone);
                reports.fetch_add(1, Ordering::SeqCst);
            })
        };
        let cancel = CancellationToken::new();
        let sender = sender(&backend, Some(on_gone), &cancel).await;

        for _ in 0..3 {
            let err = sender
                .send("nowhere", Message::new(vec![1u8; 64]))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DestinationGone);
        }
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert!(sender.is_destination_gone("nowhere"));
        // overflow blobs of undeliverable messages are cleaned up
        assert_eq!(backend.blob_count("blobs"), 0);
        sender.close().await;
    }

    #[tokio::test]
    async fn close_fails_queued_messages() {
        let backend = InMemoryBackend::new();
        let cancel = CancellationToken::new();
        let sender = sender(&backend, None, &cancel).await;
        sender.close().await;

        let err = sender
            .send("out", Message::new("late"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(sender.pending(), 0);
    }
}
