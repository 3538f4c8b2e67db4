// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Abstract storage backend.
//!
//! The relay talks to three external services: a queue service, a blob store for payloads that
//! do not fit into a queue item, and a table store for durable responses and counters. Every
//! call may fail; [`BackendError::NotFound`] marks the "queue/table/container not found" class
//! that the relay treats as a terminal condition for the logical destination.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BackendError;

pub use memory::InMemoryBackend;

pub type BackendResult<T> = Result<T, BackendError>;

/// Opaque token proving ownership of a dequeued item.
///
/// A receipt becomes stale once the item's visibility timeout expires and another poller
/// dequeues it again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub item_id: String,
    pub pop_receipt: String,
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.pop_receipt)
    }
}

/// An item returned by [`QueueService::dequeue_batch`].
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub receipt: Receipt,
    pub dequeue_count: u32,
    pub body: Bytes,
}

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create the queue; succeeds if it already exists.
    async fn create_queue(&self, queue: &str) -> BackendResult<()>;

    /// Delete the queue; succeeds if it does not exist.
    async fn delete_queue(&self, queue: &str) -> BackendResult<()>;

    async fn queue_exists(&self, queue: &str) -> BackendResult<bool>;

    async fn enqueue(&self, queue: &str, body: Bytes) -> BackendResult<()>;

    /// Dequeue up to `max` visible items, hiding them for `visibility`.
    async fn dequeue_batch(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> BackendResult<Vec<QueueItem>>;

    /// Delete a dequeued item. A stale receipt yields [`BackendError::MissingItem`].
    async fn delete(&self, queue: &str, receipt: &Receipt) -> BackendResult<()>;

    async fn approximate_len(&self, queue: &str) -> BackendResult<usize>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn create_container(&self, container: &str) -> BackendResult<()>;

    async fn delete_container(&self, container: &str) -> BackendResult<()>;

    async fn container_exists(&self, container: &str) -> BackendResult<bool>;

    /// Write (or overwrite) a blob.
    async fn put(&self, container: &str, name: &str, data: Bytes) -> BackendResult<()>;

    async fn get(&self, container: &str, name: &str) -> BackendResult<Bytes>;

    /// Returns whether a blob was deleted.
    async fn delete_if_exists(&self, container: &str, name: &str) -> BackendResult<bool>;
}

/// A typed table property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityValue {
    String(String),
    Bool(bool),
    I64(i64),
    Binary(Bytes),
}

impl EntityValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntityValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EntityValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EntityValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            EntityValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// A table row keyed by `(partition_key, row_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    /// Assigned by the store on every write.
    pub etag: Option<String>,
    pub properties: BTreeMap<String, EntityValue>,
}

impl TableEntity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: EntityValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EntityValue> {
        self.properties.get(name)
    }
}

/// Predicate for [`TableStore::query`]. Results are ordered by `(partition_key, row_key)`.
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    pub partition_key: Option<String>,
    pub row_key: Option<String>,
    /// Exclusive lower bound on the row key.
    pub row_key_after: Option<String>,
    pub property_eq: Option<(String, EntityValue)>,
    pub limit: Option<usize>,
}

impl TableQuery {
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: Some(partition_key.into()),
            ..Default::default()
        }
    }

    pub fn row(mut self, row_key: impl Into<String>) -> Self {
        self.row_key = Some(row_key.into());
        self
    }

    pub fn after(mut self, row_key: impl Into<String>) -> Self {
        self.row_key_after = Some(row_key.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: EntityValue) -> Self {
        self.property_eq = Some((name.into(), value));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entity: &TableEntity) -> bool {
        if let Some(pk) = &self.partition_key
            && &entity.partition_key != pk
        {
            return false;
        }
        if let Some(rk) = &self.row_key
            && &entity.row_key != rk
        {
            return false;
        }
        if let Some(after) = &self.row_key_after
            && entity.row_key.as_str() <= after.as_str()
        {
            return false;
        }
        if let Some((name, value)) = &self.property_eq
            && entity.get(name) != Some(value)
        {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn create_table(&self, table: &str) -> BackendResult<()>;

    async fn delete_table(&self, table: &str) -> BackendResult<()>;

    async fn table_exists(&self, table: &str) -> BackendResult<bool>;

    /// Insert a new entity; fails with [`BackendError::Conflict`] if the key exists.
    async fn insert(&self, table: &str, entity: TableEntity) -> BackendResult<()>;

    /// Insert entities of a single partition atomically; nothing is written on failure.
    async fn batch_insert(&self, table: &str, entities: Vec<TableEntity>) -> BackendResult<()>;

    /// Insert or replace an entity.
    async fn upsert(&self, table: &str, entity: TableEntity) -> BackendResult<()>;

    async fn query(&self, table: &str, query: &TableQuery) -> BackendResult<Vec<TableEntity>>;

    /// Delete an entity. With `Some(etag)` the delete only succeeds if the entity is unchanged.
    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> BackendResult<()>;
}

/// The three backend services used by a relay or persistence instance.
#[derive(Clone)]
pub struct Backend {
    pub queues: Arc<dyn QueueService>,
    pub blobs: Arc<dyn BlobStore>,
    pub tables: Arc<dyn TableStore>,
}

impl Backend {
    pub fn new(
        queues: Arc<dyn QueueService>,
        blobs: Arc<dyn BlobStore>,
        tables: Arc<dyn TableStore>,
    ) -> Self {
        Self {
            queues,
            blobs,
            tables,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matching() {
        let entity = TableEntity::new("responses", "00000000000000000003")
            .with("token", EntityValue::String("abc".into()))
            .with("fault", EntityValue::Bool(false));

        assert!(TableQuery::partition("responses").matches(&entity));
        assert!(!TableQuery::partition("meta").matches(&entity));
        assert!(
            TableQuery::partition("responses")
                .after("00000000000000000002")
                .matches(&entity)
        );
        assert!(
            !TableQuery::partition("responses")
                .after("00000000000000000003")
                .matches(&entity)
        );
        assert!(
            TableQuery::default()
                .property("token", EntityValue::String("abc".into()))
                .matches(&entity)
        );
        assert!(
            !TableQuery::default()
                .property("fault", EntityValue::Bool(true))
                .matches(&entity)
        );
    }
}
