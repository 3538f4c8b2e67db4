// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffered response writes and ordered response reads.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;

use super::{PersistedItem, RESPONSE_PARTITION, SessionShared};
use crate::backend::{TableEntity, TableQuery};
use crate::error::{BackendError, ErrorKind, RelayError};
use crate::message::Message;
use crate::prefetch::{CreditPrefetcher, PrefetchSource};

/// Receives the outcome of every flushed batch that contained responses from one
/// `put_responses` call.
pub type PutResponsesCallback = Arc<dyn Fn(PutResponsesReport) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PutResponsesReport {
    pub result: Result<(), RelayError>,
    /// Responses written by this batch.
    pub persisted: usize,
    /// Responses dropped because their request already had a stored response.
    pub skipped: usize,
    /// End of message was signalled and every committed request now has a response.
    pub is_last_response: bool,
}

impl PutResponsesReport {
    pub(crate) fn failed(error: RelayError, skipped: usize) -> Self {
        Self {
            result: Err(error),
            persisted: 0,
            skipped,
            is_last_response: false,
        }
    }
}

struct QueuedResponse {
    message: Message,
    callback: PutResponsesCallback,
}

/// Per-callback accounting for one flushed batch.
struct Tally {
    callback: PutResponsesCallback,
    persisted: usize,
    skipped: usize,
}

fn tally<'a>(tallies: &'a mut Vec<Tally>, callback: &PutResponsesCallback) -> &'a mut Tally {
    let index = match tallies.iter().position(|t| Arc::ptr_eq(&t.callback, callback)) {
        Some(index) => index,
        None => {
            tallies.push(Tally {
                callback: callback.clone(),
                persisted: 0,
                skipped: 0,
            });
            tallies.len() - 1
        }
    };
    &mut tallies[index]
}

pub(crate) struct ResponseWriter {
    shared: Arc<SessionShared>,
    prefetcher: CreditPrefetcher<ResponseSource>,
    queue: Mutex<VecDeque<QueuedResponse>>,
    tokens: DashSet<String>,
    next_seq: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
}

impl ResponseWriter {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        prefetcher: CreditPrefetcher<ResponseSource>,
        tokens: DashSet<String>,
        next_seq: u64,
    ) -> Self {
        Self {
            shared,
            prefetcher,
            queue: Mutex::new(VecDeque::new()),
            tokens,
            next_seq: AtomicU64::new(next_seq),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Tokens of every stored response.
    pub(crate) fn tokens(&self) -> &DashSet<String> {
        &self.tokens
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn enqueue(&self, responses: Vec<Message>, callback: PutResponsesCallback) {
        let mut queue = self.queue.lock();
        queue.extend(responses.into_iter().map(|message| QueuedResponse {
            message,
            callback: callback.clone(),
        }));
    }

    /// Report `error` for every queued response and drop them.
    pub(crate) fn fail_pending(&self, error: RelayError) {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        let mut tallies = Vec::new();
        for response in &drained {
            tally(&mut tallies, &response.callback);
        }
        for t in tallies {
            (t.callback)(PutResponsesReport::failed(error.clone(), 0));
        }
    }

    /// Flush until the queue is empty or a batch fails.
    pub(crate) async fn flush_all(&self) -> Result<usize, RelayError> {
        let mut persisted = 0;
        while self.pending() > 0 {
            persisted += self.flush_once().await?;
        }
        Ok(persisted)
    }

    /// Write at most one batch. Returns the number of responses persisted.
    pub(crate) async fn flush_once(&self) -> Result<usize, RelayError> {
        let _flushing = self.flush_lock.lock().await;
        let batch: Vec<QueuedResponse> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(self.shared.config.persist.flush_batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tallies = Vec::new();
        let mut in_batch = HashSet::new();
        let mut accepted = Vec::with_capacity(batch.len());
        for response in batch {
            let token = response.message.dedup_token().to_string();
            let t = tally(&mut tallies, &response.callback);
            if self.tokens.contains(&token) || !in_batch.insert(token) {
                tracing::debug!(
                    message_id = %response.message.id(),
                    relates_to = %response.message.dedup_token(),
                    "response already stored; skipped"
                );
                t.skipped += 1;
                continue;
            }
            accepted.push(response);
        }

        if accepted.is_empty() {
            self.report(tallies, Ok(()));
            return Ok(0);
        }

        let base = self.next_seq.load(Ordering::Acquire);
        match self.write(base, &accepted).await {
            Ok(faults) => {
                let persisted = accepted.len();
                self.next_seq
                    .store(base + persisted as u64, Ordering::Release);
                for response in &accepted {
                    self.tokens
                        .insert(response.message.dedup_token().to_string());
                    tally(&mut tallies, &response.callback).persisted += 1;
                }
                self.shared
                    .counters
                    .record_responses(persisted as u64, faults);
                self.prefetcher.notify_more_messages(persisted as i64);
                tracing::trace!(persisted, first_seq = base, "response batch stored");
                self.report(tallies, Ok(()));
                Ok(persisted)
            }
            Err(err) => {
                tracing::warn!(count = accepted.len(), "response batch failed: {err}");
                if err.kind() == ErrorKind::DestinationGone {
                    tracing::warn!(
                        table = %self.shared.names.response_table,
                        "dropping responses for missing storage"
                    );
                } else {
                    let mut queue = self.queue.lock();
                    for response in accepted.into_iter().rev() {
                        queue.push_front(response);
                    }
                }
                self.report(tallies, Err(err.clone()));
                Err(err)
            }
        }
    }

    async fn write(&self, base: u64, accepted: &[QueuedResponse]) -> Result<u64, RelayError> {
        let table = &self.shared.names.response_table;
        let mut faults = 0;
        let mut entities = Vec::with_capacity(accepted.len());
        for (offset, response) in accepted.iter().enumerate() {
            let body = self.shared.codec.store(&response.message).await?;
            let item = PersistedItem::for_response(base + offset as u64, &response.message);
            if item.is_fault {
                faults += 1;
            }
            entities.push(item.into_entity(body));
        }

        match self.shared.backend.tables.batch_insert(table, entities).await {
            Ok(()) => Ok(faults),
            Err(BackendError::Conflict(key)) => {
                // rows were written behind our back; continue after the last one
                self.resync_sequence().await?;
                Err(RelayError::Transient(BackendError::Conflict(key)))
            }
            Err(e) => Err(RelayError::from_backend(e, table)),
        }
    }

    async fn resync_sequence(&self) -> Result<(), RelayError> {
        let table = &self.shared.names.response_table;
        let rows = self
            .shared
            .backend
            .tables
            .query(table, &TableQuery::partition(RESPONSE_PARTITION))
            .await
            .map_err(|e| RelayError::from_backend(e, table))?;
        let next = rows
            .iter()
            .filter_map(|row| row.row_key.parse::<u64>().ok())
            .max()
            .map_or(0, |last| last + 1);
        self.next_seq.fetch_max(next, Ordering::AcqRel);
        Ok(())
    }

    fn report(&self, tallies: Vec<Tally>, result: Result<(), RelayError>) {
        let is_last_response = result.is_ok() && self.shared.counters.is_complete();
        for t in tallies {
            (t.callback)(PutResponsesReport {
                result: result.clone(),
                persisted: t.persisted,
                skipped: t.skipped,
                is_last_response,
            });
        }
    }
}

/// Flush queued responses every `flush_interval` until cancelled.
pub(crate) async fn flush_loop(writer: Arc<ResponseWriter>) {
    let mut ticker = tokio::time::interval(writer.shared.config.persist.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = writer.shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = writer.flush_all().await {
                    tracing::debug!("response flush will be retried: {e}");
                }
            }
        }
    }
    tracing::debug!("response flush loop stopped");
}

fn blob_missing(err: &RelayError) -> bool {
    matches!(
        err,
        RelayError::Overflow {
            source: BackendError::MissingItem(_),
            ..
        }
    )
}

/// Prefetch source reading stored responses in row-key order.
///
/// The cursor moves past a row only once its response has been loaded, or once the row has proven
/// unreadable for good. A failed blob read leaves the row to be read again by the next fetch.
pub(crate) struct ResponseSource {
    shared: Arc<SessionShared>,
    cursor: tokio::sync::Mutex<Option<String>>,
}

impl ResponseSource {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self {
            shared,
            cursor: tokio::sync::Mutex::new(None),
        }
    }

    async fn load(&self, row: &TableEntity) -> Result<Message, RelayError> {
        let (item, body) = PersistedItem::from_entity(row)?;
        let message = self.shared.codec.load(&body).await?;
        tracing::trace!(row_key = %item.row_key, message_id = %item.message_id, "response read");
        Ok(message)
    }
}

#[async_trait]
impl PrefetchSource for ResponseSource {
    type Item = Message;
    type Output = Message;

    async fn fetch(&self) -> Result<Option<Message>, RelayError> {
        let table = &self.shared.names.response_table;
        let mut cursor = self.cursor.lock().await;
        let mut query = TableQuery::partition(RESPONSE_PARTITION).limit(1);
        if let Some(last) = cursor.as_ref() {
            query = query.after(last.clone());
        }
        let rows = self
            .shared
            .backend
            .tables
            .query(table, &query)
            .await
            .map_err(|e| RelayError::from_backend(e, table))?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        match self.load(&row).await {
            Ok(message) => {
                *cursor = Some(row.row_key);
                Ok(Some(message))
            }
            Err(err) if !self.is_skipped(&err) => {
                tracing::debug!(row_key = %row.row_key, "response read failed, will retry: {err}");
                Err(err)
            }
            Err(err) => {
                tracing::warn!(row_key = %row.row_key, "skipping unreadable response: {err}");
                *cursor = Some(row.row_key);
                Err(err)
            }
        }
    }

    fn is_skipped(&self, err: &RelayError) -> bool {
        !err.is_retryable() || blob_missing(err)
    }

    async fn admit(&self, message: Message) -> Result<Message, RelayError> {
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{SessionOptionsBuilder, SessionPersist};
    use super::*;
    use crate::backend::memory::{InMemoryBackend, Operation};
    use crate::config::RelayConfig;

    type Reports = Arc<Mutex<Vec<PutResponsesReport>>>;

    fn collector() -> (PutResponsesCallback, Reports) {
        let reports: Reports = Arc::new(Mutex::new(Vec::new()));
        let callback: PutResponsesCallback = {
            let reports = reports.clone();
            Arc::new(move |report: PutResponsesReport| reports.lock().push(report))
        };
        (callback, reports)
    }

    async fn session(memory: &InMemoryBackend, batch: usize) -> SessionPersist {
        let mut config = RelayConfig::default();
        config.persist.flush_batch_size = batch;
        config.persist.inline_threshold = 64;
        SessionOptionsBuilder::default()
            .session_id("responses")
            .config(config)
            .open(memory.backend())
            .await
            .unwrap()
    }

    fn requests(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::new(format!("request-{i}"))).collect()
    }

    #[tokio::test]
    async fn responses_are_written_in_batches_and_read_in_order() {
        let memory = InMemoryBackend::new();
        let persist = session(&memory, 2).await;
        let (callback, reports) = collector();
        let requests = requests(5);
        let responses: Vec<_> = requests
            .iter()
            .enumerate()
            .map(|(i, r)| Message::response_to(r, format!("response-{i}")))
            .collect();

        persist.put_responses(responses.clone(), callback);
        assert_eq!(persist.pending_responses(), 5);
        assert_eq!(persist.flush().await.unwrap(), 5);

        let reports = reports.lock().clone();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports.iter().map(|r| r.persisted).sum::<usize>(), 5);
        assert!(reports.iter().all(|r| r.result.is_ok()));
        assert_eq!(memory.table_len(&persist.names().response_table), 5);

        for expected in &responses {
            assert_eq!(&persist.next_response().await.unwrap(), expected);
        }
        assert_eq!(persist.counters().responses_count, 5);
    }

    #[tokio::test]
    async fn repeated_responses_are_skipped() {
        let memory = InMemoryBackend::new();
        let persist = session(&memory, 50).await;
        let (callback, reports) = collector();
        let request = Message::new("once");
        let first = Message::response_to(&request, "a");
        let second = Message::response_to(&request, "b");

        persist.put_responses(vec![first.clone(), second], callback.clone());
        persist.flush().await.unwrap();
        persist.put_responses(vec![Message::response_to(&request, "c")], callback);
        persist.flush().await.unwrap();

        let reports = reports.lock().clone();
        assert_eq!(reports[0].persisted, 1);
        assert_eq!(reports[0].skipped, 1);
        assert_eq!(reports[1].persisted, 0);
        assert_eq!(reports[1].skipped, 1);
        assert_eq!(persist.counters().responses_count, 1);
        assert_eq!(persist.next_response().await.unwrap(), first);
    }

    #[tokio::test]
    async fn failed_batch_is_requeued_and_reported() {
        let memory = InMemoryBackend::new();
        let persist = session(&memory, 50).await;
        let (callback, reports) = collector();
        let responses: Vec<_> = requests(3)
            .iter()
            .map(|r| Message::response_to(r, "ok"))
            .collect();

        memory.fail_next(Operation::TableBatchInsert, 1);
        persist.put_responses(responses, callback);
        let err = persist.flush().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(persist.pending_responses(), 3);
        assert_eq!(persist.counters().responses_count, 0);

        assert_eq!(persist.flush().await.unwrap(), 3);
        let reports = reports.lock().clone();
        assert!(reports[0].result.is_err());
        assert_eq!(reports[1].persisted, 3);
    }

    #[tokio::test]
    async fn last_response_is_flagged() {
        let memory = InMemoryBackend::new();
        let persist = session(&memory, 50).await;
        let (callback, reports) = collector();
        let requests = requests(2);
        persist.put_requests(requests.clone()).await.unwrap();
        persist.commit_request_batch(true).await.unwrap();

        persist.put_responses(vec![Message::response_to(&requests[0], "1")], callback.clone());
        persist.flush().await.unwrap();
        persist.put_responses(vec![Message::fault_for(&requests[1], "2")], callback);
        persist.flush().await.unwrap();

        let reports = reports.lock().clone();
        assert!(!reports[0].is_last_response);
        assert!(reports[1].is_last_response);
        assert_eq!(persist.counters().failed_responses_count, 1);
    }

    #[tokio::test]
    async fn oversized_response_goes_through_blob_store() {
        let memory = InMemoryBackend::new();
        let persist = session(&memory, 50).await;
        let (callback, _) = collector();
        let request = Message::new("big");
        let response = Message::response_to(&request, vec![3u8; 65]);

        persist.put_responses(vec![response.clone()], callback);
        persist.flush().await.unwrap();
        assert_eq!(memory.blob_count(&persist.names().blob_container), 1);
        assert_eq!(persist.next_response().await.unwrap(), response);
    }

    #[tokio::test]
    async fn failed_blob_read_does_not_lose_the_response() {
        let memory = InMemoryBackend::new();
        let persist = session(&memory, 50).await;
        let (callback, _) = collector();
        let request = Message::new("big");
        let response = Message::response_to(&request, vec![9u8; 200]);
        let small = Message::response_to(&Message::new("small"), "fits");

        memory.fail_next(Operation::BlobGet, 1);
        persist.put_responses(vec![response.clone(), small.clone()], callback);
        persist.flush().await.unwrap();

        let err = persist.next_response().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert_eq!(persist.next_response().await.unwrap(), response);
        assert_eq!(persist.next_response().await.unwrap(), small);
        assert_eq!(memory.calls(Operation::BlobGet), 2);
    }

    #[tokio::test]
    async fn response_with_missing_blob_is_skipped() {
        let memory = InMemoryBackend::new();
        let first = session(&memory, 50).await;
        let (callback, _) = collector();
        let lost = Message::response_to(&Message::new("a"), vec![1u8; 200]);
        let kept = Message::response_to(&Message::new("b"), "fits");
        first.put_responses(vec![lost, kept.clone()], callback);
        first.flush().await.unwrap();
        let container = first.names().blob_container.clone();
        first.detach().await.unwrap();
        drop(first);

        let blobs = memory.backend().blobs;
        blobs.delete_container(&container).await.unwrap();
        blobs.create_container(&container).await.unwrap();

        let second = session(&memory, 50).await;
        assert!(second.is_reattached());
        let err = second.next_response().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert_eq!(second.next_response().await.unwrap(), kept);
        second.close().await.unwrap();
    }
}
