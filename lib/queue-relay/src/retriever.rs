// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound poll engine.
//!
//! A fixed pool of workers polls one queue. A worker that receives items hands them to the
//! [`MessageHandler`] and polls again immediately; an empty poll or a failed call puts it to sleep
//! with exponential backoff. A missing queue is reported once to the invalid-queue handler and
//! the workers keep backing off against it until they are stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{QueueItem, QueueService};
use crate::backoff::Backoff;
use crate::config::RetrieverConfig;
use crate::error::BackendError;
use crate::stats::RelayStats;

/// Consumer of dequeued batches. Deleting the items is the handler's responsibility.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, queue: &str, items: Vec<QueueItem>);
}

/// Invoked at most once per retriever when its queue no longer exists.
pub type InvalidQueueHandler = Arc<dyn Fn(&str, &BackendError) + Send + Sync>;

struct RetrieverContext {
    queue: String,
    queues: Arc<dyn QueueService>,
    handler: Arc<dyn MessageHandler>,
    on_invalid: Option<InvalidQueueHandler>,
    config: RetrieverConfig,
    invalid_reported: AtomicBool,
    cancel: CancellationToken,
    stats: Arc<RelayStats>,
}

pub struct MessageRetriever {
    ctx: Arc<RetrieverContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRetriever {
    /// Create a retriever for `queue`. Workers stop when `cancel` (or [`Self::stop`]) fires.
    pub fn new(
        queue: impl Into<String>,
        queues: Arc<dyn QueueService>,
        handler: Arc<dyn MessageHandler>,
        on_invalid: Option<InvalidQueueHandler>,
        config: RetrieverConfig,
        cancel: &CancellationToken,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            ctx: Arc::new(RetrieverContext {
                queue: queue.into(),
                queues,
                handler,
                on_invalid,
                config,
                invalid_reported: AtomicBool::new(false),
                cancel: cancel.child_token(),
                stats,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.ctx.queue
    }

    /// Spawn the worker pool. Calling `start` on a running retriever is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        tracing::debug!(
            queue = %self.ctx.queue,
            concurrency = self.ctx.config.concurrency,
            "starting retriever"
        );
        for worker in 0..self.ctx.config.concurrency {
            let ctx = self.ctx.clone();
            workers.push(tokio::spawn(worker_loop(worker, ctx)));
        }
    }

    /// Stop the workers and wait for them to exit.
    pub async fn stop(&self) {
        self.ctx.cancel.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                tracing::error!(queue = %self.ctx.queue, "retriever worker panicked: {e}");
            }
        }
    }

    pub fn is_queue_invalid(&self) -> bool {
        self.ctx.invalid_reported.load(Ordering::Acquire)
    }
}

impl Drop for MessageRetriever {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}

async fn worker_loop(worker: usize, ctx: Arc<RetrieverContext>) {
    let mut backoff = Backoff::from_config(&ctx.config);
    let visibility = ctx.config.visibility_timeout();

    while !ctx.cancel.is_cancelled() {
        // in-flight calls run to completion; cancellation is observed between iterations
        let result = ctx
            .queues
            .dequeue_batch(&ctx.queue, ctx.config.batch_size, visibility)
            .await;

        match result {
            Ok(items) if !items.is_empty() => {
                backoff.reset();
                ctx.stats.record_batch(items.len());
                tracing::trace!(queue = %ctx.queue, worker, count = items.len(), "retrieved batch");
                ctx.handler.handle(&ctx.queue, items).await;
                continue;
            }
            Ok(_) => {
                ctx.stats.record_empty_poll();
            }
            Err(err) if err.is_destination_gone() => {
                if !ctx.invalid_reported.swap(true, Ordering::AcqRel) {
                    tracing::warn!(queue = %ctx.queue, worker, "queue not found: {err}");
                    if let Some(on_invalid) = &ctx.on_invalid {
                        on_invalid(&ctx.queue, &err);
                    }
                }
            }
            Err(err) => {
                tracing::debug!(
                    queue = %ctx.queue,
                    worker,
                    attempt = backoff.attempts(),
                    "dequeue failed: {err}"
                );
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::trace!(queue = %ctx.queue, worker, "retriever worker stopped");
}
