// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reliable send: one enqueue call whose outcome is delivered exactly once.
//!
//! Every call is recorded with a deadline before the enqueue starts. Whichever comes first, the
//! backend completion or the periodic sweep past the deadline, removes the record and completes
//! the caller; the loser is discarded. A backend that never reports completion therefore yields
//! [`RelayError::CallbackLost`] instead of a caller waiting forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::QueueService;
use crate::completion::Completion;
use crate::config::SendConfig;
use crate::error::RelayError;
use crate::message::MessageId;
use crate::stats::RelayStats;

type SendOutcome = Result<(), RelayError>;

struct InFlightSend {
    message_id: MessageId,
    queue: String,
    deadline: Instant,
    completion: Completion<SendOutcome>,
    abort: Option<AbortHandle>,
}

struct ReliableSenderInner {
    queues: Arc<dyn QueueService>,
    in_flight: DashMap<u64, InFlightSend>,
    next_call: AtomicU64,
    callback_timeout: Duration,
    stats: Arc<RelayStats>,
}

/// Cheap to clone; clones share the in-flight table.
#[derive(Clone)]
pub struct ReliableSender {
    inner: Arc<ReliableSenderInner>,
}

impl ReliableSender {
    pub fn new(queues: Arc<dyn QueueService>, config: &SendConfig, stats: Arc<RelayStats>) -> Self {
        Self {
            inner: Arc::new(ReliableSenderInner {
                queues,
                in_flight: DashMap::new(),
                next_call: AtomicU64::new(0),
                callback_timeout: config.callback_timeout(),
                stats,
            }),
        }
    }

    /// Append `body` to `queue`; resolves exactly once with the backend outcome or
    /// [`RelayError::CallbackLost`].
    pub async fn send(&self, queue: &str, body: Bytes, message_id: MessageId) -> SendOutcome {
        let (completion, rx) = Completion::new();
        let call_id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.insert(
            call_id,
            InFlightSend {
                message_id,
                queue: queue.to_string(),
                deadline: Instant::now() + self.inner.callback_timeout,
                completion,
                abort: None,
            },
        );

        let inner = self.inner.clone();
        let queue_name = queue.to_string();
        let handle = tokio::spawn(async move {
            let result = inner
                .queues
                .enqueue(&queue_name, body)
                .await
                .map_err(|e| RelayError::from_backend(e, &queue_name));
            inner.finish(call_id, result);
        });
        if let Some(mut entry) = self.inner.in_flight.get_mut(&call_id) {
            entry.abort = Some(handle.abort_handle());
        }

        rx.await.unwrap_or(Err(RelayError::Closed))
    }

    /// Force-complete every call past its deadline. Returns how many were timed out.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .inner
            .in_flight
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut timed_out = 0;
        for call_id in expired {
            let Some((_, call)) = self
                .inner
                .in_flight
                .remove_if(&call_id, |_, call| call.deadline <= now)
            else {
                continue;
            };

            if let Some(abort) = &call.abort {
                abort.abort();
            }
            let elapsed = call.completion.elapsed();
            tracing::warn!(
                message_id = %call.message_id,
                queue = %call.queue,
                elapsed_ms = elapsed.as_millis() as u64,
                "enqueue completion lost; completing as timed out"
            );
            if call.completion.time_out(Err(RelayError::CallbackLost {
                message_id: call.message_id,
                elapsed,
            })) {
                self.inner.stats.record_callback_lost();
                timed_out += 1;
            }
        }
        timed_out
    }

    /// Run [`Self::sweep`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sender.sweep();
                    }
                }
            }
            tracing::debug!("reliable send sweeper stopped");
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Complete every outstanding call with `Closed`.
    pub fn close(&self) {
        let ids: Vec<u64> = self.inner.in_flight.iter().map(|e| *e.key()).collect();
        for call_id in ids {
            if let Some((_, call)) = self.inner.in_flight.remove(&call_id) {
                if let Some(abort) = &call.abort {
                    abort.abort();
                }
                call.completion.complete(Err(RelayError::Closed));
            }
        }
    }
}

impl ReliableSenderInner {
    fn finish(&self, call_id: u64, result: SendOutcome) {
        match self.in_flight.remove(&call_id) {
            Some((_, call)) => {
                match &result {
                    Ok(()) => self.stats.record_sent(),
                    Err(_) => self.stats.record_send_failure(),
                }
                call.completion.complete(result);
            }
            None => {
                tracing::debug!(call_id, ?result, "late enqueue completion discarded");
            }
        }
    }
}
