// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory backend with fault injection.
//!
//! Implements the queue, blob and table services with the semantics the relay depends on:
//! visibility timeouts and pop receipts for queues, all-or-nothing single-partition batches and
//! ETags for tables. Failures can be injected per [`Operation`], the next enqueue can be made to
//! hang forever (a lost completion), and any resource can be removed out-of-band.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    Backend, BackendResult, BlobStore, QueueItem, QueueService, Receipt, TableEntity, TableQuery,
    TableStore,
};
use crate::error::BackendError;

/// Backend calls that can be observed and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enqueue,
    Dequeue,
    Delete,
    BlobPut,
    BlobGet,
    BlobDelete,
    TableInsert,
    TableBatchInsert,
    TableUpsert,
    TableQuery,
    TableDelete,
}

#[derive(Debug)]
struct StoredItem {
    id: u64,
    body: Bytes,
    visible_at: Instant,
    pop_receipt: Option<String>,
    dequeue_count: u32,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    items: VecDeque<StoredItem>,
}

type Rows = BTreeMap<(String, String), TableEntity>;

#[derive(Default)]
struct MemoryState {
    queues: DashMap<String, Arc<Mutex<MemoryQueue>>>,
    containers: DashMap<String, Arc<DashMap<String, Bytes>>>,
    tables: DashMap<String, Arc<Mutex<Rows>>>,
    failures: Mutex<HashMap<Operation, u32>>,
    calls: DashMap<Operation, u64>,
    hang_enqueues: AtomicU64,
    sequence: AtomicU64,
    deleted: Mutex<Vec<String>>,
}

/// Shared in-memory backend; clones observe the same state.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this instance as the three backend services.
    pub fn backend(&self) -> Backend {
        Backend::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    /// Fail the next `count` calls of `op` with a transient error.
    pub fn fail_next(&self, op: Operation, count: u32) {
        *self.state.failures.lock().entry(op).or_default() += count;
    }

    /// The next enqueue never completes (and never stores its item).
    pub fn hang_next_enqueue(&self) {
        self.state.hang_enqueues.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of calls observed for `op`, including failed ones.
    pub fn calls(&self, op: Operation) -> u64 {
        self.state.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Remove a queue out-of-band, as if another process deleted it.
    pub fn remove_queue(&self, queue: &str) -> bool {
        self.state.queues.remove(queue).is_some()
    }

    pub fn remove_table(&self, table: &str) -> bool {
        self.state.tables.remove(table).is_some()
    }

    /// Queues, tables and containers deleted through the service traits, in deletion order.
    pub fn deleted_resources(&self) -> Vec<String> {
        self.state.deleted.lock().clone()
    }

    fn record_deletion(&self, name: &str, existed: bool) {
        if existed {
            self.state.deleted.lock().push(name.to_string());
        }
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.queues.contains_key(queue)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.tables.contains_key(table)
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.state.containers.contains_key(container)
    }

    /// Total number of items in a queue, visible or not.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .queues
            .get(queue)
            .map(|q| q.lock().items.len())
            .unwrap_or(0)
    }

    pub fn blob_count(&self, container: &str) -> usize {
        self.state
            .containers
            .get(container)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.state
            .tables
            .get(table)
            .map(|t| t.lock().len())
            .unwrap_or(0)
    }

    fn observe(&self, op: Operation) -> BackendResult<()> {
        *self.state.calls.entry(op).or_default() += 1;
        let mut failures = self.state.failures.lock();
        if let Some(remaining) = failures.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(BackendError::Transient(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn next_token(&self) -> String {
        format!("{:016x}", self.state.sequence.fetch_add(1, Ordering::Relaxed))
    }

    fn queue(&self, queue: &str) -> BackendResult<Arc<Mutex<MemoryQueue>>> {
        self.state
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| BackendError::queue_not_found(queue))
    }

    fn container(&self, container: &str) -> BackendResult<Arc<DashMap<String, Bytes>>> {
        self.state
            .containers
            .get(container)
            .map(|c| c.clone())
            .ok_or_else(|| BackendError::container_not_found(container))
    }

    fn table(&self, table: &str) -> BackendResult<Arc<Mutex<Rows>>> {
        self.state
            .tables
            .get(table)
            .map(|t| t.clone())
            .ok_or_else(|| BackendError::table_not_found(table))
    }
}

#[async_trait]
impl QueueService for InMemoryBackend {
    async fn create_queue(&self, queue: &str) -> BackendResult<()> {
        self.state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> BackendResult<()> {
        self.record_deletion(queue, self.state.queues.remove(queue).is_some());
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> BackendResult<bool> {
        Ok(self.state.queues.contains_key(queue))
    }

    async fn enqueue(&self, queue: &str, body: Bytes) -> BackendResult<()> {
        self.observe(Operation::Enqueue)?;
        let hang = self
            .state
            .hang_enqueues
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if hang {
            futures::future::pending::<()>().await;
        }

        let q = self.queue(queue)?;
        let id = self.state.sequence.fetch_add(1, Ordering::Relaxed);
        q.lock().items.push_back(StoredItem {
            id,
            body,
            visible_at: Instant::now(),
            pop_receipt: None,
            dequeue_count: 0,
        });
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> BackendResult<Vec<QueueItem>> {
        self.observe(Operation::Dequeue)?;
        let q = self.queue(queue)?;
        let now = Instant::now();
        let mut guard = q.lock();
        let mut batch = Vec::new();
        for item in guard.items.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if item.visible_at > now {
                continue;
            }
            let pop_receipt = self.next_token();
            item.visible_at = now + visibility;
            item.dequeue_count += 1;
            item.pop_receipt = Some(pop_receipt.clone());
            batch.push(QueueItem {
                receipt: Receipt {
                    item_id: item.id.to_string(),
                    pop_receipt,
                },
                dequeue_count: item.dequeue_count,
                body: item.body.clone(),
            });
        }
        Ok(batch)
    }

    async fn delete(&self, queue: &str, receipt: &Receipt) -> BackendResult<()> {
        self.observe(Operation::Delete)?;
        let q = self.queue(queue)?;
        let mut guard = q.lock();
        let position = guard.items.iter().position(|item| {
            item.id.to_string() == receipt.item_id
                && item.pop_receipt.as_deref() == Some(receipt.pop_receipt.as_str())
        });
        match position {
            Some(index) => {
                guard.items.remove(index);
                Ok(())
            }
            None => Err(BackendError::MissingItem(receipt.to_string())),
        }
    }

    async fn approximate_len(&self, queue: &str) -> BackendResult<usize> {
        Ok(self.queue(queue)?.lock().items.len())
    }
}

#[async_trait]
impl BlobStore for InMemoryBackend {
    async fn create_container(&self, container: &str) -> BackendResult<()> {
        self.state.containers.entry(container.to_string()).or_default();
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> BackendResult<()> {
        self.record_deletion(container, self.state.containers.remove(container).is_some());
        Ok(())
    }

    async fn container_exists(&self, container: &str) -> BackendResult<bool> {
        Ok(self.state.containers.contains_key(container))
    }

    async fn put(&self, container: &str, name: &str, data: Bytes) -> BackendResult<()> {
        self.observe(Operation::BlobPut)?;
        self.container(container)?.insert(name.to_string(), data);
        Ok(())
    }

    async fn get(&self, container: &str, name: &str) -> BackendResult<Bytes> {
        self.observe(Operation::BlobGet)?;
        self.container(container)?
            .get(name)
            .map(|b| b.clone())
            .ok_or_else(|| BackendError::MissingItem(format!("{container}/{name}")))
    }

    async fn delete_if_exists(&self, container: &str, name: &str) -> BackendResult<bool> {
        self.observe(Operation::BlobDelete)?;
        Ok(self.container(container)?.remove(name).is_some())
    }
}

#[async_trait]
impl TableStore for InMemoryBackend {
    async fn create_table(&self, table: &str) -> BackendResult<()> {
        self.state.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> BackendResult<()> {
        self.record_deletion(table, self.state.tables.remove(table).is_some());
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> BackendResult<bool> {
        Ok(self.state.tables.contains_key(table))
    }

    async fn insert(&self, table: &str, mut entity: TableEntity) -> BackendResult<()> {
        self.observe(Operation::TableInsert)?;
        let rows = self.table(table)?;
        let mut rows = rows.lock();
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if rows.contains_key(&key) {
            return Err(BackendError::Conflict(format!("{}/{}", key.0, key.1)));
        }
        entity.etag = Some(self.next_token());
        rows.insert(key, entity);
        Ok(())
    }

    async fn batch_insert(&self, table: &str, entities: Vec<TableEntity>) -> BackendResult<()> {
        self.observe(Operation::TableBatchInsert)?;
        let rows = self.table(table)?;
        let Some(first) = entities.first() else {
            return Ok(());
        };
        if entities
            .iter()
            .any(|e| e.partition_key != first.partition_key)
        {
            return Err(BackendError::Transient(
                "batch spans more than one partition".to_string(),
            ));
        }

        let mut rows = rows.lock();
        for entity in &entities {
            let key = (entity.partition_key.clone(), entity.row_key.clone());
            if rows.contains_key(&key) {
                return Err(BackendError::Conflict(format!("{}/{}", key.0, key.1)));
            }
        }
        for mut entity in entities {
            entity.etag = Some(self.next_token());
            rows.insert(
                (entity.partition_key.clone(), entity.row_key.clone()),
                entity,
            );
        }
        Ok(())
    }

    async fn upsert(&self, table: &str, mut entity: TableEntity) -> BackendResult<()> {
        self.observe(Operation::TableUpsert)?;
        let rows = self.table(table)?;
        entity.etag = Some(self.next_token());
        rows.lock().insert(
            (entity.partition_key.clone(), entity.row_key.clone()),
            entity,
        );
        Ok(())
    }

    async fn query(&self, table: &str, query: &TableQuery) -> BackendResult<Vec<TableEntity>> {
        self.observe(Operation::TableQuery)?;
        let rows = self.table(table)?;
        let rows = rows.lock();
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows
            .values()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> BackendResult<()> {
        self.observe(Operation::TableDelete)?;
        let rows = self.table(table)?;
        let mut rows = rows.lock();
        let key = (partition_key.to_string(), row_key.to_string());
        let Some(existing) = rows.get(&key) else {
            return Err(BackendError::MissingItem(format!(
                "{partition_key}/{row_key}"
            )));
        };
        if let Some(expected) = etag
            && existing.etag.as_deref() != Some(expected)
        {
            return Err(BackendError::PreconditionFailed(format!(
                "{partition_key}/{row_key}"
            )));
        }
        rows.remove(&key);
        Ok(())
    }
}
