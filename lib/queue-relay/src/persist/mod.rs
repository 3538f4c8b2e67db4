// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Durable request/response storage for one client session.
//!
//! Requests live in a queue; a request handed to a consumer moves to a private *pending* queue
//! so it survives a consumer crash. Responses are appended to a table under monotonically
//! increasing row keys, one row per request, deduplicated by the request id they answer.
//! Payloads above the inline threshold are stored in a blob container.
//!
//! ```ignore
//! let persist = SessionOptionsBuilder::default()
//!     .session_id("session-1")
//!     .open(backend)
//!     .await?;
//! persist.start().await?;
//!
//! persist.put_requests(vec![Message::new("hello")]).await?;
//! persist.commit_request_batch(true).await?;
//!
//! let request = persist.next_request().await?;
//! persist.put_responses(vec![Message::response_to(&request, "world")], callback);
//! let response = persist.next_response().await?;
//!
//! let counters = persist.close().await?;
//! ```

mod lifecycle;
mod request;
mod response;

pub use response::{PutResponsesCallback, PutResponsesReport};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use derive_builder::Builder;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::backend::{Backend, EntityValue, TableEntity};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::message::{Message, MessageId};
use crate::naming::StorageNames;
use crate::overflow::OverflowCodec;
use crate::prefetch::{CreditPrefetcher, PrefetchEntry};

use lifecycle::Reconciled;
use request::RequestSource;
use response::{ResponseSource, ResponseWriter};

pub(crate) const RESPONSE_PARTITION: &str = "responses";
pub(crate) const META_PARTITION: &str = "meta";
pub(crate) const COUNTERS_ROW: &str = "counters";

/// Final or current counts of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPersistCounter {
    pub requests_count: u64,
    pub responses_count: u64,
    pub failed_responses_count: u64,
}

/// Table metadata of one stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedItem {
    pub row_key: String,
    /// Dedup token: the id of the request this response answers.
    pub token: String,
    pub message_id: MessageId,
    pub is_fault: bool,
}

impl PersistedItem {
    pub fn row_key_for(seq: u64) -> String {
        format!("{seq:020}")
    }

    pub fn for_response(seq: u64, response: &Message) -> Self {
        Self {
            row_key: Self::row_key_for(seq),
            token: response.dedup_token().to_string(),
            message_id: response.id(),
            is_fault: response.is_fault(),
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        self.row_key.parse().ok()
    }

    pub(crate) fn into_entity(self, body: Bytes) -> TableEntity {
        TableEntity::new(RESPONSE_PARTITION, self.row_key)
            .with("token", EntityValue::String(self.token))
            .with("message_id", EntityValue::String(self.message_id.to_string()))
            .with("fault", EntityValue::Bool(self.is_fault))
            .with("body", EntityValue::Binary(body))
    }

    /// Split a response row into its metadata and encoded body.
    pub(crate) fn from_entity(entity: &TableEntity) -> Result<(Self, Bytes), RelayError> {
        let malformed = |field: &str| {
            RelayError::Codec(format!(
                "response row {} has no valid '{field}'",
                entity.row_key
            ))
        };
        let token = entity
            .get("token")
            .and_then(EntityValue::as_str)
            .ok_or_else(|| malformed("token"))?;
        let message_id = entity
            .get("message_id")
            .and_then(EntityValue::as_str)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| malformed("message_id"))?;
        let is_fault = entity
            .get("fault")
            .and_then(EntityValue::as_bool)
            .unwrap_or(false);
        let body = entity
            .get("body")
            .and_then(EntityValue::as_binary)
            .cloned()
            .ok_or_else(|| malformed("body"))?;

        let item = Self {
            row_key: entity.row_key.clone(),
            token: token.to_string(),
            message_id,
            is_fault,
        };
        Ok((item, body))
    }
}

/// Options for [`SessionPersist::open`].
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_options"))]
pub struct SessionOptions {
    /// Session the storage belongs to (required).
    #[builder(setter(into))]
    pub session_id: String,

    /// Client within the session; each client gets its own storage.
    #[builder(setter(into), default = "\"default\".to_string()")]
    pub client_id: String,

    #[builder(default)]
    pub config: RelayConfig,
}

impl SessionOptionsBuilder {
    /// Build the options and open the session storage.
    pub async fn open(self, backend: Backend) -> Result<SessionPersist, RelayError> {
        let options = self
            .build_options()
            .map_err(|e| RelayError::InvalidState(format!("invalid session options: {e}")))?;
        SessionPersist::open(backend, options).await
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    requests: AtomicU64,
    responses: AtomicU64,
    failed_responses: AtomicU64,
    end_of_message: AtomicBool,
}

impl Counters {
    fn snapshot(&self) -> SessionPersistCounter {
        SessionPersistCounter {
            requests_count: self.requests.load(Ordering::Acquire),
            responses_count: self.responses.load(Ordering::Acquire),
            failed_responses_count: self.failed_responses.load(Ordering::Acquire),
        }
    }

    /// End of message was signalled and every committed request has a response.
    pub(crate) fn is_complete(&self) -> bool {
        self.end_of_message.load(Ordering::Acquire)
            && self.responses.load(Ordering::Acquire) >= self.requests.load(Ordering::Acquire)
    }

    pub(crate) fn record_responses(&self, persisted: u64, faults: u64) {
        self.responses.fetch_add(persisted, Ordering::AcqRel);
        self.failed_responses.fetch_add(faults, Ordering::AcqRel);
    }
}

/// State shared by the session facade and its background tasks.
pub(crate) struct SessionShared {
    pub backend: Backend,
    pub names: StorageNames,
    pub config: RelayConfig,
    pub codec: Arc<OverflowCodec>,
    pub counters: Counters,
    pub cancel: CancellationToken,
}

pub struct SessionPersist {
    shared: Arc<SessionShared>,
    requests: CreditPrefetcher<RequestSource>,
    responses: CreditPrefetcher<ResponseSource>,
    writer: Arc<ResponseWriter>,
    open_batch: Mutex<Vec<MessageId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reattached: bool,
    closed: AtomicBool,
}

impl SessionPersist {
    /// Open (creating or reattaching) the storage of `options.session_id`/`options.client_id`.
    pub async fn open(backend: Backend, options: SessionOptions) -> Result<Self, RelayError> {
        options
            .config
            .validate()
            .map_err(|e| RelayError::InvalidState(format!("invalid configuration: {e}")))?;

        let SessionOptions {
            session_id,
            client_id,
            config,
        } = options;
        let names = StorageNames::for_client(&config.persist.name_prefix, &session_id, &client_id);

        let reconciled = lifecycle::reconcile(&backend, &names).await?;
        let restored = match reconciled {
            Reconciled::Reattached => lifecycle::restore(&backend, &names).await?,
            Reconciled::Created => lifecycle::Restored::default(),
        };

        let codec = Arc::new(OverflowCodec::new(
            backend.blobs.clone(),
            names.blob_container.clone(),
            config.persist.inline_threshold,
        ));
        let counters = Counters::default();
        counters.requests.store(restored.requests, Ordering::Release);
        counters
            .end_of_message
            .store(restored.end_of_message, Ordering::Release);
        counters.record_responses(restored.responses, restored.failed_responses);

        let shared = Arc::new(SessionShared {
            backend,
            names,
            config,
            codec,
            counters,
            cancel: CancellationToken::new(),
        });

        let requests = CreditPrefetcher::new(
            RequestSource::new(shared.clone()),
            &shared.config.prefetch,
            &shared.cancel,
        );
        let responses = CreditPrefetcher::new(
            ResponseSource::new(shared.clone()),
            &shared.config.prefetch,
            &shared.cancel,
        );
        responses.set_message_count(restored.responses as i64);
        let writer = Arc::new(ResponseWriter::new(
            shared.clone(),
            responses.clone(),
            restored.tokens,
            restored.next_seq,
        ));

        tracing::debug!(
            session_id = %session_id,
            client_id = %client_id,
            request_queue = %shared.names.request_queue,
            reattached = reconciled == Reconciled::Reattached,
            "session storage opened"
        );

        Ok(Self {
            shared,
            requests,
            responses,
            writer,
            open_batch: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            reattached: reconciled == Reconciled::Reattached,
            closed: AtomicBool::new(false),
        })
    }

    pub fn names(&self) -> &StorageNames {
        &self.shared.names
    }

    pub fn is_reattached(&self) -> bool {
        self.reattached
    }

    pub fn counters(&self) -> SessionPersistCounter {
        self.shared.counters.snapshot()
    }

    /// Responses accepted by [`Self::put_responses`] and not yet written.
    pub fn pending_responses(&self) -> usize {
        self.writer.pending()
    }

    /// Start the response flush loop and the request-check loop.
    ///
    /// On a reattached session, requests left in the pending queue without a response are first
    /// moved back to the request queue.
    pub async fn start(&self) -> Result<(), RelayError> {
        self.ensure_open()?;
        if !self.tasks.lock().is_empty() {
            return Ok(());
        }

        if self.reattached {
            let requeued = request::requeue_pending(&self.shared, self.writer.tokens()).await?;
            let available = self
                .shared
                .backend
                .queues
                .approximate_len(&self.shared.names.request_queue)
                .await
                .map_err(|e| RelayError::from_backend(e, &self.shared.names.request_queue))?;
            tracing::info!(requeued, available, "resuming request delivery");
            self.requests.set_message_count(available as i64);
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        tasks.push(tokio::spawn(response::flush_loop(self.writer.clone())));
        tasks.push(tokio::spawn(request::check_loop(
            self.shared.clone(),
            self.requests.clone(),
        )));
        Ok(())
    }

    /// Append requests to the open batch.
    ///
    /// Items are sent in order; the first failure stops the batch and is returned as
    /// [`RelayError::PartialBatch`]. Items before it stay in the queue and in the open batch.
    pub async fn put_requests(&self, messages: Vec<Message>) -> Result<usize, RelayError> {
        self.ensure_open()?;
        let total = messages.len();
        for (committed, message) in messages.into_iter().enumerate() {
            match request::put_request(&self.shared, &message).await {
                Ok(()) => {
                    self.open_batch.lock().push(message.id());
                }
                Err(source) => {
                    tracing::warn!(
                        message_id = %message.id(),
                        committed,
                        total,
                        "request batch interrupted: {source}"
                    );
                    return Err(RelayError::PartialBatch {
                        committed,
                        total,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(total)
    }

    /// Make the open batch visible to consumers. Returns the committed request total.
    pub async fn commit_request_batch(&self, end_of_message: bool) -> Result<u64, RelayError> {
        self.ensure_open()?;
        let batch = std::mem::take(&mut *self.open_batch.lock());
        let added = batch.len() as u64;
        let counters = &self.shared.counters;
        let requests = counters.requests.fetch_add(added, Ordering::AcqRel) + added;
        if end_of_message {
            counters.end_of_message.store(true, Ordering::Release);
        }
        if added > 0 {
            self.requests.notify_more_messages(added as i64);
        }
        self.write_counters().await?;
        tracing::debug!(added, requests, end_of_message, "request batch committed");
        Ok(requests)
    }

    /// Drop the open batch. Its requests are deleted when fetched instead of being delivered.
    pub fn abort_request_batch(&self) -> usize {
        let batch = std::mem::take(&mut *self.open_batch.lock());
        for id in &batch {
            self.requests.suppress(id.to_string());
        }
        if !batch.is_empty() {
            tracing::debug!(aborted = batch.len(), "request batch aborted");
        }
        batch.len()
    }

    /// Deliver the next request to `callback` on a spawned task.
    pub fn get_request<F>(&self, callback: F)
    where
        F: FnOnce(PrefetchEntry<Message>) + Send + 'static,
    {
        self.requests.get_next(callback);
    }

    pub async fn next_request(&self) -> PrefetchEntry<Message> {
        self.requests.next().await
    }

    /// Queue responses for the next flush; `callback` receives one report per flushed batch
    /// containing any of them.
    pub fn put_responses(&self, responses: Vec<Message>, callback: PutResponsesCallback) {
        if self.closed.load(Ordering::Acquire) {
            callback(PutResponsesReport::failed(RelayError::Closed, 0));
            return;
        }
        self.writer.enqueue(responses, callback);
    }

    /// Write every queued response now.
    pub async fn flush(&self) -> Result<usize, RelayError> {
        self.writer.flush_all().await
    }

    /// Deliver the next stored response to `callback` on a spawned task.
    pub fn get_response<F>(&self, callback: F)
    where
        F: FnOnce(PrefetchEntry<Message>) + Send + 'static,
    {
        self.responses.get_next(callback);
    }

    pub async fn next_response(&self) -> PrefetchEntry<Message> {
        self.responses.next().await
    }

    /// Stop background work, attempt a final flush and delete the session storage.
    pub async fn close(&self) -> Result<SessionPersistCounter, RelayError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(self.counters());
        }
        self.stop().await;
        lifecycle::teardown(&self.shared.backend, &self.shared.names).await?;
        let counters = self.counters();
        tracing::info!(
            requests = counters.requests_count,
            responses = counters.responses_count,
            failed = counters.failed_responses_count,
            "session storage closed"
        );
        Ok(counters)
    }

    /// Stop background work and keep the storage for a later [`Self::open`].
    pub async fn detach(&self) -> Result<SessionPersistCounter, RelayError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(self.counters());
        }
        self.stop().await;
        self.write_counters().await?;
        Ok(self.counters())
    }

    async fn stop(&self) {
        self.shared.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!("session task panicked: {e}");
            }
        }
        if let Err(e) = self.writer.flush_all().await {
            tracing::warn!("final response flush failed: {e}");
        }
        self.writer.fail_pending(RelayError::Closed);
        self.requests.close();
        self.responses.close();
    }

    async fn write_counters(&self) -> Result<(), RelayError> {
        let counters = self.counters();
        let entity = lifecycle::counters_entity(
            counters.requests_count,
            self.shared.counters.end_of_message.load(Ordering::Acquire),
            counters.responses_count,
            counters.failed_responses_count,
        );
        let table = &self.shared.names.response_table;
        self.shared
            .backend
            .tables
            .upsert(table, entity)
            .await
            .map_err(|e| RelayError::from_backend(e, table))
    }

    fn ensure_open(&self) -> Result<(), RelayError> {
        if self.closed.load(Ordering::Acquire) {
            Err(RelayError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for SessionPersist {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_keys_sort_numerically() {
        let keys: Vec<_> = [0u64, 9, 10, 100, 1_000_000]
            .into_iter()
            .map(PersistedItem::row_key_for)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys[0].len(), 20);
    }

    #[test]
    fn persisted_item_entity_round_trip() {
        let request = Message::new("q");
        let response = Message::fault_for(&request, "boom");
        let item = PersistedItem::for_response(7, &response);
        assert_eq!(item.token, request.id().to_string());
        assert_eq!(item.sequence(), Some(7));

        let entity = item.clone().into_entity(Bytes::from_static(b"body"));
        let (parsed, body) = PersistedItem::from_entity(&entity).unwrap();
        assert_eq!(parsed, item);
        assert_eq!(body, Bytes::from_static(b"body"));
    }

    #[test]
    fn malformed_row_is_a_codec_error() {
        let entity = TableEntity::new(RESPONSE_PARTITION, PersistedItem::row_key_for(1));
        let err = PersistedItem::from_entity(&entity).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Codec);
    }

    #[test]
    fn completion_requires_end_of_message() {
        let counters = Counters::default();
        counters.requests.store(2, Ordering::Release);
        counters.record_responses(2, 1);
        assert!(!counters.is_complete());
        counters.end_of_message.store(true, Ordering::Release);
        assert!(counters.is_complete());
        assert_eq!(counters.snapshot().failed_responses_count, 1);
    }

    #[tokio::test]
    async fn missing_session_id_is_rejected() {
        let backend = crate::backend::memory::InMemoryBackend::new().backend();
        let err = SessionOptionsBuilder::default()
            .client_id("c")
            .open(backend)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }
}
