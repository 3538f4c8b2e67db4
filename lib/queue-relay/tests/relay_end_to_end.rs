// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use bytes::Bytes;

use queue_relay::backend::memory::InMemoryBackend;
use queue_relay::naming::RelayNames;
use queue_relay::{ErrorKind, Message, RelayConfig, RelayOptionsBuilder};

fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.retriever.concurrency = 2;
    config.retriever.backoff_initial_ms = 5;
    config.retriever.backoff_max_ms = 50;
    config.sender.supervisor_interval_ms = 10;
    config.prefetch.empty_retry_ms = 5;
    config.persist.inline_threshold = 256;
    config
}

#[tokio::test]
async fn broker_and_worker_exchange_request_and_response() -> anyhow::Result<()> {
    let memory = InMemoryBackend::new();
    let broker = RelayOptionsBuilder::default()
        .session_id("e2e")
        .config(config())
        .broker(memory.backend())
        .await?;
    let requests = broker.create_request_storage("Echo").await?;
    let response_queue = broker.start("job-1", 0).await?;
    assert_eq!(broker.response_queue().as_deref(), Some(response_queue.as_str()));

    let worker = RelayOptionsBuilder::default()
        .session_id("e2e")
        .config(config())
        .worker(memory.backend(), requests.clone())
        .await?;

    let awaiter = broker.send(&requests, Message::new("hello")).await?;
    assert_eq!(broker.outstanding(), 1);

    let request = worker.receive().await?;
    assert_eq!(request.id(), awaiter.message_id());
    assert_eq!(request.reply_to(), Some(response_queue.as_str()));
    assert_eq!(request.payload(), &Bytes::from_static(b"hello"));
    worker.reply(&request, "world").await?;

    let response = tokio::time::timeout(Duration::from_secs(5), awaiter).await??;
    assert_eq!(response.relates_to(), Some(request.id()));
    assert_eq!(response.payload(), &Bytes::from_static(b"world"));
    assert_eq!(broker.outstanding(), 0);
    assert_eq!(broker.stats().responses_matched, 1);

    worker.close().await;
    broker.close().await;
    Ok(())
}

#[tokio::test]
async fn oversized_payloads_travel_through_the_blob_store() -> anyhow::Result<()> {
    let memory = InMemoryBackend::new();
    let broker = RelayOptionsBuilder::default()
        .session_id("large")
        .config(config())
        .broker(memory.backend())
        .await?;
    let requests = broker.create_request_storage("Echo").await?;
    broker.start("job-1", 0).await?;
    let worker = RelayOptionsBuilder::default()
        .session_id("large")
        .config(config())
        .worker(memory.backend(), requests.clone())
        .await?;

    let payload = Bytes::from(vec![42u8; 4096]);
    let awaiter = broker.send(&requests, Message::new(payload.clone())).await?;
    let request = worker.receive().await?;
    assert_eq!(request.payload(), &payload);
    worker.reply(&request, payload.clone()).await?;

    let response = tokio::time::timeout(Duration::from_secs(5), awaiter).await??;
    assert_eq!(response.payload(), &payload);

    worker.close().await;
    broker.close().await;
    let container = RelayNames::new("relay", "large").overflow_container();
    assert_eq!(memory.blob_count(&container), 0);
    Ok(())
}

#[tokio::test]
async fn deleted_response_queue_fails_pending_calls() -> anyhow::Result<()> {
    let memory = InMemoryBackend::new();
    let broker = RelayOptionsBuilder::default()
        .session_id("gone")
        .config(config())
        .broker(memory.backend())
        .await?;
    let requests = broker.create_request_storage("Echo").await?;
    let response_queue = broker.start("job-1", 0).await?;

    let first = broker.send(&requests, Message::new("a")).await?;
    let second = broker.send(&requests, Message::new("b")).await?;
    assert!(memory.remove_queue(&response_queue));

    for awaiter in [first, second] {
        let outcome = tokio::time::timeout(Duration::from_secs(2), awaiter).await?;
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::DestinationGone);
    }
    assert!(broker.registry().is_invalid(&response_queue));

    // nothing new can be registered against the dead queue
    let err = broker.send(&requests, Message::new("c")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DestinationGone);
    assert_eq!(broker.outstanding(), 0);

    broker.close().await;
    Ok(())
}

#[tokio::test]
async fn close_fails_outstanding_calls() -> anyhow::Result<()> {
    let memory = InMemoryBackend::new();
    let broker = RelayOptionsBuilder::default()
        .session_id("closing")
        .config(config())
        .broker(memory.backend())
        .await?;
    let requests = broker.create_request_storage("Echo").await?;
    broker.start("job-1", 0).await?;

    let awaiter = broker.send(&requests, Message::new("unanswered")).await?;
    broker.close().await;
    assert_eq!(awaiter.await.unwrap_err().kind(), ErrorKind::Closed);

    let err = broker.start("job-1", 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    Ok(())
}

#[tokio::test]
async fn send_before_start_is_rejected() -> anyhow::Result<()> {
    let memory = InMemoryBackend::new();
    let broker = RelayOptionsBuilder::default()
        .session_id("early")
        .broker(memory.backend())
        .await?;
    let requests = broker.create_request_storage("Echo").await?;
    let err = broker.send(&requests, Message::new("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    Ok(())
}
