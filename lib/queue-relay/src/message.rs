// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Relay messages and their queue encoding.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

/// Globally unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// An opaque payload with its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    relates_to: Option<MessageId>,
    reply_to: Option<String>,
    is_fault: bool,
    headers: BTreeMap<String, String>,
    payload: Bytes,
}

impl Message {
    /// A new request with a fresh id.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_id(MessageId::new(), payload)
    }

    pub fn with_id(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            relates_to: None,
            reply_to: None,
            is_fault: false,
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// A response correlated with `request`.
    pub fn response_to(request: &Message, payload: impl Into<Bytes>) -> Self {
        let mut response = Self::new(payload);
        response.relates_to = Some(request.id);
        response
    }

    /// A fault response correlated with `request`.
    pub fn fault_for(request: &Message, payload: impl Into<Bytes>) -> Self {
        let mut response = Self::response_to(request, payload);
        response.is_fault = true;
        response
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn relates_to(&self) -> Option<MessageId> {
        self.relates_to
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn is_fault(&self) -> bool {
        self.is_fault
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The key used to collapse repeated deliveries: the correlation id for responses, the
    /// message id otherwise.
    pub fn dedup_token(&self) -> MessageId {
        self.relates_to.unwrap_or(self.id)
    }

    pub(crate) fn set_reply_to(&mut self, queue: &str) {
        self.reply_to = Some(queue.to_string());
    }
}

/// The body of a queue item or stored response.
///
/// When `stored_externally` is set the payload lives in the blob store under the message id and
/// the envelope carries an empty payload (a referral).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub is_fault: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub stored_externally: bool,
    pub payload: Bytes,
}

impl QueueEnvelope {
    pub fn inline(message: &Message) -> Self {
        Self {
            id: message.id,
            relates_to: message.relates_to,
            reply_to: message.reply_to.clone(),
            is_fault: message.is_fault,
            headers: message.headers.clone(),
            stored_externally: false,
            payload: message.payload.clone(),
        }
    }

    pub fn referral(message: &Message) -> Self {
        Self {
            stored_externally: true,
            payload: Bytes::new(),
            ..Self::inline(message)
        }
    }

    pub fn encode(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    pub fn decode(body: &[u8]) -> Result<Self, RelayError> {
        Ok(rmp_serde::from_slice(body)?)
    }

    /// Rebuild the message, substituting `payload` for the envelope's own.
    pub fn into_message(self, payload: Option<Bytes>) -> Message {
        Message {
            id: self.id,
            relates_to: self.relates_to,
            reply_to: self.reply_to,
            is_fault: self.is_fault,
            headers: self.headers,
            payload: payload.unwrap_or(self.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_correlates_with_request() {
        let request = Message::new("hello").with_reply_to("replies");
        let response = Message::response_to(&request, "world");
        assert_eq!(response.relates_to(), Some(request.id()));
        assert_ne!(response.id(), request.id());
        assert_eq!(response.dedup_token(), request.id());
        assert!(!response.is_fault());
        assert!(Message::fault_for(&request, "boom").is_fault());
        assert_eq!(request.dedup_token(), request.id());
    }

    #[test]
    fn message_id_parses_its_display_form() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<MessageId>().is_err());
    }

    #[test]
    fn envelope_preserves_metadata() {
        let message = Message::new(Bytes::from_static(b"payload"))
            .with_reply_to("q-reply")
            .with_header("action", "Echo");
        let body = QueueEnvelope::inline(&message).encode().unwrap();
        let decoded = QueueEnvelope::decode(&body).unwrap();
        assert!(!decoded.stored_externally);
        assert_eq!(decoded.into_message(None), message);
    }

    #[test]
    fn referral_drops_payload() {
        let message = Message::new(vec![7u8; 1024]);
        let envelope = QueueEnvelope::referral(&message);
        assert!(envelope.stored_externally);
        assert!(envelope.payload.is_empty());
        assert_eq!(envelope.id, message.id());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = QueueEnvelope::decode(b"\xc1\xc1").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Codec);
    }
}
