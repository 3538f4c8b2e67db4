// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Creation, reconciliation and teardown of session storage.

use dashmap::DashSet;

use super::{COUNTERS_ROW, META_PARTITION, PersistedItem, RESPONSE_PARTITION};
use crate::backend::{Backend, EntityValue, TableEntity, TableQuery};
use crate::error::RelayError;
use crate::naming::StorageNames;

/// How [`reconcile`] found the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reconciled {
    Created,
    Reattached,
}

/// State recovered from an existing response table.
#[derive(Debug, Default)]
pub(crate) struct Restored {
    pub requests: u64,
    pub end_of_message: bool,
    pub responses: u64,
    pub failed_responses: u64,
    pub next_seq: u64,
    pub tokens: DashSet<String>,
}

/// Make sure a complete set of storage exists.
///
/// Both halves present: reattach. Exactly one present: the orphan is torn down and everything is
/// created fresh. Neither present: create.
pub(crate) async fn reconcile(
    backend: &Backend,
    names: &StorageNames,
) -> Result<Reconciled, RelayError> {
    let queue_exists = backend
        .queues
        .queue_exists(&names.request_queue)
        .await
        .map_err(|e| RelayError::from_backend(e, &names.request_queue))?;
    let table_exists = backend
        .tables
        .table_exists(&names.response_table)
        .await
        .map_err(|e| RelayError::from_backend(e, &names.response_table))?;

    match (queue_exists, table_exists) {
        (true, true) => {
            // a crash between creating the table and the container leaves the container missing
            backend
                .blobs
                .create_container(&names.blob_container)
                .await
                .map_err(|e| RelayError::from_backend(e, &names.blob_container))?;
            backend
                .queues
                .create_queue(&names.pending_queue)
                .await
                .map_err(|e| RelayError::from_backend(e, &names.pending_queue))?;
            Ok(Reconciled::Reattached)
        }
        (false, false) => {
            create(backend, names).await?;
            Ok(Reconciled::Created)
        }
        (queue_exists, table_exists) => {
            tracing::warn!(
                request_queue = %names.request_queue,
                response_table = %names.response_table,
                queue_exists,
                table_exists,
                "found half-created session storage; recreating"
            );
            teardown(backend, names).await?;
            create(backend, names).await?;
            Ok(Reconciled::Created)
        }
    }
}

/// Create storage in dependency order: container, request queue, pending queue, table.
pub(crate) async fn create(backend: &Backend, names: &StorageNames) -> Result<(), RelayError> {
    backend
        .blobs
        .create_container(&names.blob_container)
        .await
        .map_err(|e| RelayError::from_backend(e, &names.blob_container))?;
    backend
        .queues
        .create_queue(&names.request_queue)
        .await
        .map_err(|e| RelayError::from_backend(e, &names.request_queue))?;
    backend
        .queues
        .create_queue(&names.pending_queue)
        .await
        .map_err(|e| RelayError::from_backend(e, &names.pending_queue))?;
    backend
        .tables
        .create_table(&names.response_table)
        .await
        .map_err(|e| RelayError::from_backend(e, &names.response_table))?;
    tracing::debug!(request_queue = %names.request_queue, "session storage created");
    Ok(())
}

/// Delete storage in the fixed order response table, pending queue, request queue, container.
///
/// Every step runs even if an earlier one failed; the first failure is returned.
pub(crate) async fn teardown(backend: &Backend, names: &StorageNames) -> Result<(), RelayError> {
    let steps = [
        (
            names.response_table.as_str(),
            backend.tables.delete_table(&names.response_table).await,
        ),
        (
            names.pending_queue.as_str(),
            backend.queues.delete_queue(&names.pending_queue).await,
        ),
        (
            names.request_queue.as_str(),
            backend.queues.delete_queue(&names.request_queue).await,
        ),
        (
            names.blob_container.as_str(),
            backend.blobs.delete_container(&names.blob_container).await,
        ),
    ];

    let mut first_error = None;
    for (resource, result) in steps {
        match result {
            Ok(()) => {}
            Err(e) if e.is_destination_gone() => {}
            Err(e) => {
                tracing::warn!(resource, "teardown step failed: {e}");
                first_error.get_or_insert(RelayError::from_backend(e, resource));
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Read the counters row and rebuild response state from the table.
pub(crate) async fn restore(
    backend: &Backend,
    names: &StorageNames,
) -> Result<Restored, RelayError> {
    let table = names.response_table.as_str();
    let mut restored = Restored::default();

    let meta = backend
        .tables
        .query(table, &TableQuery::partition(META_PARTITION).row(COUNTERS_ROW))
        .await
        .map_err(|e| RelayError::from_backend(e, table))?;
    if let Some(row) = meta.first() {
        restored.requests = row
            .get("requests")
            .and_then(EntityValue::as_i64)
            .map(|n| n.max(0) as u64)
            .unwrap_or(0);
        restored.end_of_message = row
            .get("end_of_message")
            .and_then(EntityValue::as_bool)
            .unwrap_or(false);
    }

    let rows = backend
        .tables
        .query(table, &TableQuery::partition(RESPONSE_PARTITION))
        .await
        .map_err(|e| RelayError::from_backend(e, table))?;
    for row in &rows {
        let (item, _) = PersistedItem::from_entity(row)?;
        restored.responses += 1;
        if item.is_fault {
            restored.failed_responses += 1;
        }
        if let Some(seq) = item.sequence() {
            restored.next_seq = restored.next_seq.max(seq + 1);
        }
        restored.tokens.insert(item.token);
    }

    tracing::info!(
        response_table = %table,
        requests = restored.requests,
        responses = restored.responses,
        failed = restored.failed_responses,
        "reattached to session storage"
    );
    Ok(restored)
}

pub(crate) fn counters_entity(
    requests: u64,
    end_of_message: bool,
    responses: u64,
    failed: u64,
) -> TableEntity {
    TableEntity::new(META_PARTITION, COUNTERS_ROW)
        .with("requests", EntityValue::I64(requests as i64))
        .with("end_of_message", EntityValue::Bool(end_of_message))
        .with("responses", EntityValue::I64(responses as i64))
        .with("failed_responses", EntityValue::I64(failed as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TableStore;
    use crate::backend::memory::InMemoryBackend;

    fn names() -> StorageNames {
        StorageNames::for_client("relay", "s1", "c1")
    }

    #[tokio::test]
    async fn creates_missing_storage() {
        let memory = InMemoryBackend::new();
        let backend = memory.backend();
        let names = names();
        assert_eq!(reconcile(&backend, &names).await.unwrap(), Reconciled::Created);
        assert!(memory.has_queue(&names.request_queue));
        assert!(memory.has_queue(&names.pending_queue));
        assert!(memory.has_table(&names.response_table));
        assert!(memory.has_container(&names.blob_container));

        assert_eq!(reconcile(&backend, &names).await.unwrap(), Reconciled::Reattached);
    }

    #[tokio::test]
    async fn orphaned_half_is_recreated() {
        let memory = InMemoryBackend::new();
        let backend = memory.backend();
        let names = names();
        memory.create_table(&names.response_table).await.unwrap();
        memory
            .insert(
                &names.response_table,
                TableEntity::new(RESPONSE_PARTITION, PersistedItem::row_key_for(0)),
            )
            .await
            .unwrap();

        assert_eq!(reconcile(&backend, &names).await.unwrap(), Reconciled::Created);
        // the stale row went with the old table
        assert_eq!(memory.table_len(&names.response_table), 0);
        assert!(memory.has_queue(&names.request_queue));
    }

    #[tokio::test]
    async fn teardown_tolerates_missing_resources() {
        let memory = InMemoryBackend::new();
        let backend = memory.backend();
        let names = names();
        create(&backend, &names).await.unwrap();
        memory.remove_queue(&names.pending_queue);

        teardown(&backend, &names).await.unwrap();
        assert!(!memory.has_queue(&names.request_queue));
        assert!(!memory.has_table(&names.response_table));
        assert!(!memory.has_container(&names.blob_container));
    }
}
