// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Size-based routing of payloads between queue items and the blob store.
//!
//! A payload of at most `threshold` bytes travels inline. Anything larger is written to the blob
//! store under the message id first, and the queue item becomes a referral.

use std::sync::Arc;

use bytes::Bytes;

use crate::backend::BlobStore;
use crate::error::{BackendError, RelayError};
use crate::message::{Message, MessageId, QueueEnvelope};

pub struct OverflowCodec {
    blobs: Arc<dyn BlobStore>,
    container: String,
    threshold: usize,
}

impl OverflowCodec {
    pub fn new(blobs: Arc<dyn BlobStore>, container: impl Into<String>, threshold: usize) -> Self {
        Self {
            blobs,
            container: container.into(),
            threshold,
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn blob_name(id: MessageId) -> String {
        id.to_string()
    }

    pub fn is_oversized(&self, message: &Message) -> bool {
        message.payload().len() > self.threshold
    }

    /// Encode `message` into an item body, uploading the payload first when it is oversized.
    pub async fn store(&self, message: &Message) -> Result<Bytes, RelayError> {
        if !self.is_oversized(message) {
            return QueueEnvelope::inline(message).encode();
        }

        self.blobs
            .put(
                &self.container,
                &Self::blob_name(message.id()),
                message.payload().clone(),
            )
            .await
            .map_err(|source| self.overflow_error(message.id(), source))?;

        tracing::debug!(
            message_id = %message.id(),
            size = message.payload().len(),
            container = %self.container,
            "payload stored externally"
        );
        QueueEnvelope::referral(message).encode()
    }

    /// Decode an item body, resolving referrals from the blob store.
    pub async fn load(&self, body: &[u8]) -> Result<Message, RelayError> {
        let envelope = QueueEnvelope::decode(body)?;
        if !envelope.stored_externally {
            return Ok(envelope.into_message(None));
        }

        let id = envelope.id;
        let payload = self
            .blobs
            .get(&self.container, &Self::blob_name(id))
            .await
            .map_err(|source| self.overflow_error(id, source))?;
        Ok(envelope.into_message(Some(payload)))
    }

    /// Remove the blob behind a referral once the message has been consumed.
    pub async fn discard(&self, id: MessageId) -> Result<bool, RelayError> {
        self.blobs
            .delete_if_exists(&self.container, &Self::blob_name(id))
            .await
            .map_err(|e| RelayError::from_backend(e, &self.container))
    }

    fn overflow_error(&self, message_id: MessageId, source: BackendError) -> RelayError {
        if source.is_destination_gone() {
            RelayError::from_backend(source, &self.container)
        } else {
            RelayError::Overflow { message_id, source }
        }
    }
}
