// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Correlation of responses with the callers waiting for them.
//!
//! # Usage Pattern
//!
//! ```ignore
//! let registry = CorrelationRegistry::new();
//! let (call, awaiter) = PendingCall::new(request.id(), "requests", "responses");
//! registry.register(call)?;
//!
//! // ... the request is sent, later the poll engine receives the response
//! registry.on_response_received(response);
//!
//! let response = awaiter.await?;
//! ```
//!
//! # Exactly-once completion
//!
//! Every completion path (a matched response, an explicit [`CorrelationRegistry::complete`], a
//! queue invalidation, shutdown) first removes the call from the registry. The map removal picks a
//! single winner; everyone else observes a missing entry and does nothing.
//!
//! # Queue invalidation
//!
//! Invalid queues are sticky. [`CorrelationRegistry::on_queue_invalid`] re-scans until no entry
//! references the queue, and [`CorrelationRegistry::register`] re-checks the queues after
//! publishing its entries, so a registration racing an invalidation is never left behind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::completion::Completion;
use crate::error::RelayError;
use crate::message::{Message, MessageId};

pub type CallOutcome = Result<Message, RelayError>;

/// A logical queue and whether the backend still has it.
#[derive(Debug)]
pub struct QueueHandle {
    name: String,
    exists: AtomicBool,
}

impl QueueHandle {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exists: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    /// Returns true for the call that flipped the flag.
    fn invalidate(&self) -> bool {
        self.exists.swap(false, Ordering::SeqCst)
    }
}

/// A caller waiting for the response to one request.
pub struct PendingCall {
    message_id: MessageId,
    request_queue: String,
    response_queue: String,
    completion: Completion<CallOutcome>,
}

impl PendingCall {
    pub fn new(
        message_id: MessageId,
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
    ) -> (Self, ResponseAwaiter) {
        let (completion, rx) = Completion::new();
        let call = Self {
            message_id,
            request_queue: request_queue.into(),
            response_queue: response_queue.into(),
            completion,
        };
        (call, ResponseAwaiter { message_id, rx })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn request_queue(&self) -> &str {
        &self.request_queue
    }

    pub fn response_queue(&self) -> &str {
        &self.response_queue
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("message_id", &self.message_id)
            .field("request_queue", &self.request_queue)
            .field("response_queue", &self.response_queue)
            .field("state", &self.completion.state())
            .finish()
    }
}

/// Resolves to the correlated response, or the error the call was completed with.
#[derive(Debug)]
pub struct ResponseAwaiter {
    message_id: MessageId,
    rx: oneshot::Receiver<CallOutcome>,
}

impl ResponseAwaiter {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl Future for ResponseAwaiter {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(RelayError::Closed)))
    }
}

/// What happened to a response handed to [`CorrelationRegistry::on_response_received`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// A waiting caller received it.
    Completed,
    /// Nobody was waiting; the caller should clean the item up.
    Unmatched,
}

#[derive(Default)]
pub struct CorrelationRegistry {
    calls: DashMap<MessageId, PendingCall>,
    request_queues: DashMap<MessageId, String>,
    response_queues: DashMap<MessageId, String>,
    handles: DashMap<String, Arc<QueueHandle>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call.
    ///
    /// Fails with `DestinationGone` if either queue is already invalid, and with `Duplicate` if a
    /// call with the same id is outstanding.
    pub fn register(&self, call: PendingCall) -> Result<(), RelayError> {
        let id = call.message_id;
        let request_queue = call.request_queue.clone();
        let response_queue = call.response_queue.clone();

        if let Some(gone) = self.first_invalid(&request_queue, &response_queue) {
            return Err(RelayError::destination_gone(gone));
        }

        match self.calls.entry(id) {
            Entry::Occupied(_) => return Err(RelayError::Duplicate(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(call);
            }
        }
        self.request_queues.insert(id, request_queue.clone());
        self.response_queues.insert(id, response_queue.clone());

        // an invalidation may have scanned before these entries were visible
        if let Some(gone) = self.first_invalid(&request_queue, &response_queue) {
            if self.take(&id).is_some() {
                return Err(RelayError::destination_gone(gone));
            }
            self.forget(&id);
            return Ok(());
        }

        // completed by a racing path while the entries were being published
        if !self.calls.contains_key(&id) {
            self.forget(&id);
        }
        Ok(())
    }

    /// Complete a call. Returns `false` (and logs) if it was already completed.
    pub fn complete(&self, id: &MessageId, outcome: CallOutcome) -> bool {
        match self.take(id) {
            Some(call) => call.completion.complete(outcome),
            None => {
                tracing::warn!(
                    message_id = %id,
                    "completion ignored: call already completed or unknown"
                );
                false
            }
        }
    }

    /// Remove a call without completing it; its awaiter resolves to `Closed`.
    pub fn withdraw(&self, id: &MessageId) -> bool {
        self.take(id).is_some()
    }

    /// Route a response to its caller by its correlation id.
    pub fn on_response_received(&self, response: Message) -> ResponseDisposition {
        let Some(id) = response.relates_to() else {
            tracing::info!(message_id = %response.id(), "response without correlation id");
            return ResponseDisposition::Unmatched;
        };

        match self.take(&id) {
            Some(call) => {
                call.completion.complete(Ok(response));
                ResponseDisposition::Completed
            }
            None => {
                tracing::info!(
                    message_id = %response.id(),
                    relates_to = %id,
                    "unmatched response"
                );
                ResponseDisposition::Unmatched
            }
        }
    }

    /// Mark `queue` invalid and fail every call referencing it. Returns the number of calls
    /// completed by this invocation.
    pub fn on_queue_invalid(&self, queue: &str, error: RelayError) -> usize {
        if self.queue_handle(queue).invalidate() {
            tracing::warn!(queue, "queue invalidated: {error}");
        }

        let mut completed = 0;
        loop {
            let matched = self.referencing(queue);
            if matched.is_empty() {
                break;
            }
            for id in matched {
                self.forget(&id);
                if let Some((_, call)) = self.calls.remove(&id)
                    && call.completion.complete(Err(error.clone()))
                {
                    completed += 1;
                }
            }
        }

        if completed > 0 {
            tracing::debug!(queue, completed, "failed pending calls of invalid queue");
        }
        completed
    }

    /// Complete every outstanding call with `error`.
    pub fn fail_all(&self, error: RelayError) -> usize {
        let mut completed = 0;
        loop {
            let ids: Vec<MessageId> = self.calls.iter().map(|e| *e.key()).collect();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                if let Some(call) = self.take(&id)
                    && call.completion.complete(Err(error.clone()))
                {
                    completed += 1;
                }
            }
        }
        completed
    }

    pub fn outstanding(&self) -> usize {
        self.calls.len()
    }

    pub fn is_registered(&self, id: &MessageId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn is_invalid(&self, queue: &str) -> bool {
        self.handles
            .get(queue)
            .map(|h| !h.exists())
            .unwrap_or(false)
    }

    /// The handle for `queue`, created on first use.
    pub fn queue_handle(&self, queue: &str) -> Arc<QueueHandle> {
        if let Some(handle) = self.handles.get(queue) {
            return handle.clone();
        }
        self.handles
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueHandle::new(queue)))
            .clone()
    }

    fn first_invalid<'a>(
        &self,
        request_queue: &'a str,
        response_queue: &'a str,
    ) -> Option<&'a str> {
        if self.is_invalid(response_queue) {
            Some(response_queue)
        } else if self.is_invalid(request_queue) {
            Some(request_queue)
        } else {
            None
        }
    }

    fn take(&self, id: &MessageId) -> Option<PendingCall> {
        let (_, call) = self.calls.remove(id)?;
        self.forget(id);
        Some(call)
    }

    fn forget(&self, id: &MessageId) {
        self.request_queues.remove(id);
        self.response_queues.remove(id);
    }

    fn referencing(&self, queue: &str) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .request_queues
            .iter()
            .filter(|e| e.value() == queue)
            .map(|e| *e.key())
            .collect();
        ids.extend(
            self.response_queues
                .iter()
                .filter(|e| e.value() == queue)
                .map(|e| *e.key()),
        );
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
