// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Credit-based prefetch.
//!
//! A prefetcher keeps up to `cache_capacity` items ready for pullers. Each slot is a credit:
//! starting a fetch consumes one, and it comes back when the fetched entry is handed to a puller
//! (directly or out of the cache) or when the fetch produced nothing deliverable. At every point
//! `credit + outstanding + cached <= capacity`.
//!
//! New fetches are admitted only while
//!
//! ```text
//! outstanding < max_outstanding && outstanding < message_count && credit > 0
//! ```
//!
//! where `message_count` is how many items the source is known to hold. The gate is re-evaluated
//! after every fetch completion and every credit return.
//!
//! Tokens of admitted items are remembered in a window of `dedup_window` entries, so a repeated
//! delivery is dropped as long as it arrives before its token ages out. Tokens passed to
//! [`CreditPrefetcher::suppress`] are kept until the matching item has been discarded.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::PrefetchConfig;
use crate::error::{ErrorKind, RelayError};

/// A fetched item, or the error the fetch produced.
pub type PrefetchEntry<T> = Result<T, RelayError>;

/// `message_count` used when the size of the source is not tracked.
const UNBOUNDED: i64 = i64::MAX / 2;

/// Backend side of a prefetcher.
#[async_trait]
pub trait PrefetchSource: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    /// Fetch one item. `Ok(None)` means nothing is visible right now.
    async fn fetch(&self) -> Result<Option<Self::Item>, RelayError>;

    /// Whether a failed fetch used up the item it read, leaving one item fewer to fetch.
    fn is_skipped(&self, err: &RelayError) -> bool {
        err.kind() == ErrorKind::Codec
    }

    /// Token identifying repeated deliveries of the same item; `None` disables suppression.
    fn dedup_token(&self, _item: &Self::Item) -> Option<String> {
        None
    }

    /// Accept a first-seen item and produce what pullers receive.
    async fn admit(&self, item: Self::Item) -> Result<Self::Output, RelayError>;

    /// Dispose of a suppressed duplicate.
    async fn discard(&self, _item: Self::Item) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Result of a non-blocking [`CreditPrefetcher::pull`].
pub enum Pull<T> {
    Ready(PrefetchEntry<T>),
    Waiting(oneshot::Receiver<PrefetchEntry<T>>),
}

impl<T> Pull<T> {
    pub async fn resolve(self) -> PrefetchEntry<T> {
        match self {
            Pull::Ready(entry) => entry,
            Pull::Waiting(rx) => rx.await.unwrap_or(Err(RelayError::Closed)),
        }
    }
}

/// Counter values at one point in time. Not an atomic snapshot across counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchSnapshot {
    pub capacity: usize,
    pub credit: usize,
    pub outstanding: usize,
    pub cached: usize,
    pub waiters: usize,
    pub message_count: i64,
}

struct Delivery<T> {
    cache: VecDeque<PrefetchEntry<T>>,
    waiters: VecDeque<oneshot::Sender<PrefetchEntry<T>>>,
    failed: Option<RelayError>,
}

/// Recently admitted tokens, oldest evicted first.
struct DedupWindow {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// `false` if `token` is already in the window.
    fn insert(&mut self, token: &str) -> bool {
        if !self.seen.insert(token.to_string()) {
            return false;
        }
        self.order.push_back(token.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn remove(&mut self, token: &str) {
        if self.seen.remove(token) {
            self.order.retain(|t| t != token);
        }
    }

    fn contains(&self, token: &str) -> bool {
        self.seen.contains(token)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct PrefetchInner<S: PrefetchSource> {
    source: S,
    capacity: usize,
    max_outstanding: usize,
    empty_retry: Duration,
    message_count: AtomicI64,
    outstanding: AtomicUsize,
    credit: AtomicUsize,
    delivery: Mutex<Delivery<S::Output>>,
    window: Mutex<DedupWindow>,
    suppressed: DashSet<String>,
    failed: AtomicBool,
    retry_scheduled: AtomicBool,
    cancel: CancellationToken,
}

pub struct CreditPrefetcher<S: PrefetchSource> {
    inner: Arc<PrefetchInner<S>>,
}

impl<S: PrefetchSource> Clone for CreditPrefetcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: PrefetchSource> CreditPrefetcher<S> {
    /// A prefetcher that fetches only as many items as it has been told exist.
    pub fn new(source: S, config: &PrefetchConfig, cancel: &CancellationToken) -> Self {
        Self::with_count(source, config, cancel, 0)
    }

    /// A prefetcher that keeps fetching as long as it has credit.
    pub fn unbounded(source: S, config: &PrefetchConfig, cancel: &CancellationToken) -> Self {
        let prefetcher = Self::with_count(source, config, cancel, UNBOUNDED);
        prefetcher.inner.check_and_get_more();
        prefetcher
    }

    fn with_count(
        source: S,
        config: &PrefetchConfig,
        cancel: &CancellationToken,
        message_count: i64,
    ) -> Self {
        Self {
            inner: Arc::new(PrefetchInner {
                source,
                capacity: config.cache_capacity,
                max_outstanding: config.max_outstanding,
                empty_retry: config.empty_retry(),
                message_count: AtomicI64::new(message_count),
                outstanding: AtomicUsize::new(0),
                credit: AtomicUsize::new(config.cache_capacity),
                delivery: Mutex::new(Delivery {
                    cache: VecDeque::new(),
                    waiters: VecDeque::new(),
                    failed: None,
                }),
                window: Mutex::new(DedupWindow::new(config.dedup_window)),
                suppressed: DashSet::new(),
                failed: AtomicBool::new(false),
                retry_scheduled: AtomicBool::new(false),
                cancel: cancel.child_token(),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// The source holds `delta` more (or, if negative, fewer) items.
    pub fn notify_more_messages(&self, delta: i64) {
        self.inner.message_count.fetch_add(delta, Ordering::SeqCst);
        self.inner.check_and_get_more();
    }

    pub fn set_message_count(&self, count: i64) {
        self.inner.message_count.store(count, Ordering::SeqCst);
        self.inner.check_and_get_more();
    }

    /// Treat the next item carrying `token` as already delivered.
    pub fn suppress(&self, token: impl Into<String>) {
        self.inner.suppressed.insert(token.into());
    }

    pub fn is_suppressed(&self, token: &str) -> bool {
        self.inner.suppressed.contains(token) || self.inner.window.lock().contains(token)
    }

    /// Number of admitted tokens currently remembered.
    pub fn remembered_tokens(&self) -> usize {
        self.inner.window.lock().len()
    }

    /// Take the next entry if one is cached, otherwise join the queue of waiting pullers.
    pub fn pull(&self) -> Pull<S::Output> {
        let mut delivery = self.inner.delivery.lock();
        if let Some(entry) = delivery.cache.pop_front() {
            drop(delivery);
            self.inner.credit.fetch_add(1, Ordering::SeqCst);
            self.inner.check_and_get_more();
            return Pull::Ready(entry);
        }
        if let Some(err) = &delivery.failed {
            return Pull::Ready(Err(err.clone()));
        }
        let (tx, rx) = oneshot::channel();
        delivery.waiters.push_back(tx);
        drop(delivery);
        self.inner.check_and_get_more();
        Pull::Waiting(rx)
    }

    pub async fn next(&self) -> PrefetchEntry<S::Output> {
        self.pull().resolve().await
    }

    /// Deliver the next entry to `callback` on a spawned task.
    pub fn get_next<F>(&self, callback: F)
    where
        F: FnOnce(PrefetchEntry<S::Output>) + Send + 'static,
    {
        let pull = self.pull();
        tokio::spawn(async move {
            callback(pull.resolve().await);
        });
    }

    /// Fail every waiting and future pull with `error` once the cache is drained, and stop
    /// fetching.
    pub fn invalidate(&self, error: RelayError) {
        self.inner.fail(error);
    }

    pub fn is_invalid(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.fail(RelayError::Closed);
    }

    pub fn snapshot(&self) -> PrefetchSnapshot {
        let delivery = self.inner.delivery.lock();
        PrefetchSnapshot {
            capacity: self.inner.capacity,
            credit: self.inner.credit.load(Ordering::SeqCst),
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            cached: delivery.cache.len(),
            waiters: delivery.waiters.len(),
            message_count: self.inner.message_count.load(Ordering::SeqCst),
        }
    }
}

impl<S: PrefetchSource> PrefetchInner<S> {
    fn check_and_get_more(self: &Arc<Self>) {
        while self.try_start_fetch() {
            let inner = self.clone();
            tokio::spawn(async move { inner.run_fetch().await });
        }
    }

    fn gate_open(&self) -> bool {
        let outstanding = self.outstanding.load(Ordering::SeqCst);
        outstanding < self.max_outstanding
            && (outstanding as i64) < self.message_count.load(Ordering::SeqCst)
    }

    fn try_start_fetch(&self) -> bool {
        loop {
            if self.cancel.is_cancelled() || self.failed.load(Ordering::SeqCst) {
                return false;
            }
            if self
                .credit
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
                .is_err()
            {
                return false;
            }
            let count = self.message_count.load(Ordering::SeqCst);
            let admitted = self
                .outstanding
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |o| {
                    (o < self.max_outstanding && (o as i64) < count).then_some(o + 1)
                })
                .is_ok();
            if admitted {
                return true;
            }
            self.credit.fetch_add(1, Ordering::SeqCst);
            // another caller may have been turned away while this credit was held
            if !self.gate_open() {
                return false;
            }
        }
    }

    /// Finish a fetch that produced nothing for the cache.
    fn release_fetch(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.credit.fetch_add(1, Ordering::SeqCst);
    }

    async fn run_fetch(self: Arc<Self>) {
        let fetched = self.source.fetch().await;
        if self.cancel.is_cancelled() {
            self.release_fetch();
            return;
        }

        match fetched {
            Ok(Some(item)) => {
                let token = self.source.dedup_token(&item);
                if let Some(token) = &token
                    && self.is_duplicate(token)
                {
                    tracing::debug!(token = %token, "duplicate delivery suppressed");
                    match self.source.discard(item).await {
                        Ok(()) => {
                            self.suppressed.remove(token);
                        }
                        Err(e) => {
                            tracing::debug!(token = %token, "failed to discard duplicate: {e}")
                        }
                    }
                    self.release_fetch();
                    self.check_and_get_more();
                    return;
                }

                let entry = self.source.admit(item).await;
                match &entry {
                    Ok(_) => {
                        self.message_count.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(_) => {
                        // the item stays in the source and must not be suppressed on redelivery
                        if let Some(token) = &token {
                            self.window.lock().remove(token);
                        }
                    }
                }
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                self.deliver(entry);
            }
            Ok(None) => {
                self.release_fetch();
                self.schedule_retry();
                return;
            }
            Err(err) if err.kind() == ErrorKind::DestinationGone => {
                self.release_fetch();
                self.fail(err);
                return;
            }
            Err(err) => {
                tracing::debug!("prefetch failed: {err}");
                if self.source.is_skipped(&err) {
                    self.message_count.fetch_sub(1, Ordering::SeqCst);
                }
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                self.deliver(Err(err));
            }
        }
        self.check_and_get_more();
    }

    /// Whether an item carrying `token` must be dropped; records first-seen tokens.
    fn is_duplicate(&self, token: &str) -> bool {
        self.suppressed.contains(token) || !self.window.lock().insert(token)
    }

    fn deliver(&self, mut entry: PrefetchEntry<S::Output>) {
        let mut delivery = self.delivery.lock();
        while let Some(waiter) = delivery.waiters.pop_front() {
            match waiter.send(entry) {
                Ok(()) => {
                    drop(delivery);
                    self.credit.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                // puller went away
                Err(returned) => entry = returned,
            }
        }
        delivery.cache.push_back(entry);
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self.retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.empty_retry) => {
                    inner.retry_scheduled.store(false, Ordering::SeqCst);
                    inner.check_and_get_more();
                }
            }
        });
    }

    fn fail(&self, error: RelayError) {
        self.failed.store(true, Ordering::SeqCst);
        let waiters = {
            let mut delivery = self.delivery.lock();
            if delivery.failed.is_none() {
                delivery.failed = Some(error.clone());
            }
            std::mem::take(&mut delivery.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
