// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Relay Error System
//!
//! Two layers of errors flow through the relay:
//!
//! - [`BackendError`] is what the external queue/blob/table service reports for a single call.
//! - [`RelayError`] is the typed outcome handed to callers of the relay and persistence APIs.
//!
//! Callers never inspect messages to decide what to do; they inspect [`ErrorKind`] (or the
//! [`RelayError::is_retryable`] shortcut):
//!
//! ```rust,ignore
//! match relay.send(request).await {
//!     Ok(awaiter) => awaiter.await,
//!     Err(err) if err.is_retryable() => retry_later(err),
//!     Err(err) => fail_request(err), // e.g. DestinationGone
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::message::MessageId;

// ============================================================================
// ErrorKind
// ============================================================================

/// Categorizes relay errors into the fixed taxonomy the callers act upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A single backend call failed; retried in place by the workers.
    Transient,
    /// The queue, table or container behind a logical destination no longer exists.
    DestinationGone,
    /// The backend never reported completion of an enqueue before the deadline.
    CallbackLost,
    /// The item was already seen; suppressed by the dedup layer.
    Duplicate,
    /// Writing an oversized payload to the blob store failed.
    Overflow,
    /// A batch was only partially committed.
    PartialBatch,
    /// A queue item or table entity could not be encoded or decoded.
    Codec,
    /// The relay or persistence instance was closed.
    Closed,
    /// The operation is not valid in the current lifecycle state.
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "Transient"),
            ErrorKind::DestinationGone => write!(f, "DestinationGone"),
            ErrorKind::CallbackLost => write!(f, "CallbackLost"),
            ErrorKind::Duplicate => write!(f, "Duplicate"),
            ErrorKind::Overflow => write!(f, "Overflow"),
            ErrorKind::PartialBatch => write!(f, "PartialBatch"),
            ErrorKind::Codec => write!(f, "Codec"),
            ErrorKind::Closed => write!(f, "Closed"),
            ErrorKind::InvalidState => write!(f, "InvalidState"),
        }
    }
}

// ============================================================================
// BackendError
// ============================================================================

/// The kind of backend resource a [`BackendError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Queue,
    Table,
    Container,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Queue => write!(f, "queue"),
            ResourceKind::Table => write!(f, "table"),
            ResourceKind::Container => write!(f, "container"),
        }
    }
}

/// Errors reported by the external queue, blob and table services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The queue, table or container does not exist.
    #[error("{resource} not found: {name}")]
    NotFound { resource: ResourceKind, name: String },

    /// A blob, entity or queue receipt does not exist (or is stale).
    #[error("item not found: {0}")]
    MissingItem(String),

    /// An entity with the same key already exists.
    #[error("entity already exists: {0}")]
    Conflict(String),

    /// An optimistic-concurrency check (ETag) failed.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Any other failure of a single call; safe to retry.
    #[error("backend request failed: {0}")]
    Transient(String),
}

impl BackendError {
    pub fn queue_not_found(name: impl Into<String>) -> Self {
        BackendError::NotFound {
            resource: ResourceKind::Queue,
            name: name.into(),
        }
    }

    pub fn table_not_found(name: impl Into<String>) -> Self {
        BackendError::NotFound {
            resource: ResourceKind::Table,
            name: name.into(),
        }
    }

    pub fn container_not_found(name: impl Into<String>) -> Self {
        BackendError::NotFound {
            resource: ResourceKind::Container,
            name: name.into(),
        }
    }

    /// True for the "queue/table/container not found" class.
    pub fn is_destination_gone(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

// ============================================================================
// RelayError
// ============================================================================

/// The typed outcome of relay and persistence operations.
///
/// `RelayError` is `Clone` so that one invalidation can be fanned out to every waiting caller.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("transient backend failure: {0}")]
    Transient(#[source] BackendError),

    #[error("destination gone: {queue}")]
    DestinationGone {
        queue: String,
        #[source]
        cause: Option<BackendError>,
    },

    #[error("completion callback lost for message {message_id} after {elapsed:?}")]
    CallbackLost {
        message_id: MessageId,
        elapsed: Duration,
    },

    #[error("duplicate item: {0}")]
    Duplicate(String),

    #[error("overflow payload for message {message_id} could not be stored: {source}")]
    Overflow {
        message_id: MessageId,
        #[source]
        source: BackendError,
    },

    #[error("batch partially committed: {committed} of {total} items")]
    PartialBatch {
        committed: usize,
        total: usize,
        #[source]
        source: Box<RelayError>,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("relay closed")]
    Closed,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl RelayError {
    /// Convert a backend failure observed against `destination`.
    ///
    /// The "not found" class becomes [`RelayError::DestinationGone`]; everything else is
    /// [`RelayError::Transient`].
    pub fn from_backend(err: BackendError, destination: &str) -> Self {
        if err.is_destination_gone() {
            RelayError::DestinationGone {
                queue: destination.to_string(),
                cause: Some(err),
            }
        } else {
            RelayError::Transient(err)
        }
    }

    pub fn destination_gone(queue: impl Into<String>) -> Self {
        RelayError::DestinationGone {
            queue: queue.into(),
            cause: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Transient(_) => ErrorKind::Transient,
            RelayError::DestinationGone { .. } => ErrorKind::DestinationGone,
            RelayError::CallbackLost { .. } => ErrorKind::CallbackLost,
            RelayError::Duplicate(_) => ErrorKind::Duplicate,
            RelayError::Overflow { .. } => ErrorKind::Overflow,
            RelayError::PartialBatch { .. } => ErrorKind::PartialBatch,
            RelayError::Codec(_) => ErrorKind::Codec,
            RelayError::Closed => ErrorKind::Closed,
            RelayError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Whether the caller may retry the operation at its own layer.
    ///
    /// `DestinationGone` is terminal; `CallbackLost`, transient and overflow failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Transient(_)
            | RelayError::CallbackLost { .. }
            | RelayError::Overflow { .. } => true,
            RelayError::PartialBatch { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<BackendError> for RelayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound { ref name, .. } => RelayError::DestinationGone {
                queue: name.clone(),
                cause: Some(err),
            },
            other => RelayError::Transient(other),
        }
    }
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RelayError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RelayError::Codec(err.to_string())
    }
}
