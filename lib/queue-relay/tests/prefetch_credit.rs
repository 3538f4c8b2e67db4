// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Semaphore;

use queue_relay::backend::memory::{InMemoryBackend, Operation};
use queue_relay::backend::{QueueItem, QueueService};
use queue_relay::config::PrefetchConfig;
use queue_relay::prefetch::{CreditPrefetcher, PrefetchSource, Pull};
use queue_relay::{CancellationToken, RelayError};

/// Source whose fetches block until the test releases them with a scripted result.
struct ScriptedSource {
    releases: Arc<Semaphore>,
    script: Arc<Mutex<VecDeque<Option<u64>>>>,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self {
            releases: Arc::new(Semaphore::new(0)),
            script: Arc::default(),
        }
    }
}

impl ScriptedSource {
    fn release(&self, result: Option<u64>) {
        self.script.lock().push_back(result);
        self.releases.add_permits(1);
    }
}

#[async_trait]
impl PrefetchSource for ScriptedSource {
    type Item = u64;
    type Output = u64;

    async fn fetch(&self) -> Result<Option<u64>, RelayError> {
        let permit = self
            .releases
            .acquire()
            .await
            .map_err(|_| RelayError::Closed)?;
        permit.forget();
        Ok(self.script.lock().pop_front().flatten())
    }

    async fn admit(&self, item: u64) -> Result<u64, RelayError> {
        Ok(item)
    }
}

async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn credit_is_conserved_under_random_interleavings() {
    const CAPACITY: usize = 6;
    const MAX_OUTSTANDING: usize = 3;

    let config = PrefetchConfig {
        cache_capacity: CAPACITY,
        max_outstanding: MAX_OUTSTANDING,
        empty_retry_ms: 1,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let prefetcher = CreditPrefetcher::new(ScriptedSource::default(), &config, &cancel);
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    let mut waiting = Vec::new();
    let mut next_item = 0u64;

    for event in 0..10_000 {
        match rng.random_range(0..5) {
            0 => prefetcher.notify_more_messages(rng.random_range(1..4)),
            1 => {
                next_item += 1;
                prefetcher.source().release(Some(next_item));
            }
            2 => prefetcher.source().release(None),
            3 => match prefetcher.pull() {
                Pull::Ready(entry) => assert!(entry.is_ok(), "event {event}: {entry:?}"),
                Pull::Waiting(rx) => waiting.push(rx),
            },
            _ => {
                // a puller gives up
                if !waiting.is_empty() {
                    let index = rng.random_range(0..waiting.len());
                    drop(waiting.swap_remove(index));
                }
            }
        }
        settle().await;

        let snapshot = prefetcher.snapshot();
        assert!(
            snapshot.credit + snapshot.outstanding + snapshot.cached <= snapshot.capacity,
            "event {event}: {snapshot:?}"
        );
        assert!(snapshot.outstanding <= MAX_OUTSTANDING, "event {event}: {snapshot:?}");
        assert!(snapshot.message_count >= 0, "event {event}: {snapshot:?}");
    }

    prefetcher.close();
}

/// Source over an in-memory queue whose items carry their dedup token as the body.
struct QueueSource {
    backend: InMemoryBackend,
}

#[async_trait]
impl PrefetchSource for QueueSource {
    type Item = QueueItem;
    type Output = Bytes;

    async fn fetch(&self) -> Result<Option<QueueItem>, RelayError> {
        let items = self
            .backend
            .dequeue_batch("dedup", 1, Duration::from_secs(30))
            .await
            .map_err(|e| RelayError::from_backend(e, "dedup"))?;
        Ok(items.into_iter().next())
    }

    fn dedup_token(&self, item: &QueueItem) -> Option<String> {
        Some(String::from_utf8_lossy(&item.body).into_owned())
    }

    async fn admit(&self, item: QueueItem) -> Result<Bytes, RelayError> {
        QueueService::delete(&self.backend, "dedup", &item.receipt)
            .await
            .map_err(|e| RelayError::from_backend(e, "dedup"))?;
        Ok(item.body)
    }

    async fn discard(&self, item: QueueItem) -> Result<(), RelayError> {
        QueueService::delete(&self.backend, "dedup", &item.receipt)
            .await
            .map_err(|e| RelayError::from_backend(e, "dedup"))
    }
}

#[tokio::test]
async fn repeated_delivery_reaches_the_puller_once() -> anyhow::Result<()> {
    let backend = InMemoryBackend::new();
    backend.create_queue("dedup").await?;
    backend.enqueue("dedup", Bytes::from_static(b"job-1")).await?;
    backend.enqueue("dedup", Bytes::from_static(b"job-1")).await?;

    let config = PrefetchConfig {
        cache_capacity: 4,
        max_outstanding: 1,
        empty_retry_ms: 5,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let prefetcher = CreditPrefetcher::new(
        QueueSource {
            backend: backend.clone(),
        },
        &config,
        &cancel,
    );
    prefetcher.notify_more_messages(2);

    assert_eq!(prefetcher.next().await?, Bytes::from_static(b"job-1"));
    let second = tokio::time::timeout(Duration::from_millis(100), prefetcher.next()).await;
    assert!(second.is_err(), "duplicate delivered: {second:?}");

    assert_eq!(backend.queue_len("dedup"), 0);
    assert_eq!(backend.calls(Operation::Delete), 2);
    prefetcher.close();
    Ok(())
}
