// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use bytes::Bytes;
use rstest::rstest;

use queue_relay::Message;
use queue_relay::backend::BlobStore;
use queue_relay::backend::memory::InMemoryBackend;
use queue_relay::backoff::Backoff;
use queue_relay::message::QueueEnvelope;
use queue_relay::overflow::OverflowCodec;

const THRESHOLD: usize = 1024;

#[rstest]
#[case(THRESHOLD - 1, false)]
#[case(THRESHOLD, false)]
#[case(THRESHOLD + 1, true)]
#[tokio::test]
async fn payload_size_decides_inline_or_referral(
    #[case] size: usize,
    #[case] referral: bool,
) -> anyhow::Result<()> {
    let memory = InMemoryBackend::new();
    memory.create_container("boundary").await?;
    let codec = OverflowCodec::new(std::sync::Arc::new(memory.clone()), "boundary", THRESHOLD);

    let message = Message::new(Bytes::from(vec![7u8; size]));
    let body = codec.store(&message).await?;
    let envelope = QueueEnvelope::decode(&body)?;
    assert_eq!(envelope.stored_externally, referral);
    assert_eq!(memory.blob_count("boundary"), usize::from(referral));

    let loaded = codec.load(&body).await?;
    assert_eq!(loaded.id(), message.id());
    assert_eq!(loaded.payload().len(), size);
    Ok(())
}

#[test]
fn backoff_doubles_between_bounds() {
    let initial = Duration::from_millis(100);
    let max = Duration::from_secs(5);
    let mut backoff = Backoff::new(initial, max);

    let delays: Vec<Duration> = (0..10).map(|_| backoff.next_delay()).collect();
    assert_eq!(delays[0], initial);
    assert_eq!(delays[1], Duration::from_millis(200));
    assert_eq!(delays[5], Duration::from_millis(3_200));
    assert!(delays[6..].iter().all(|d| *d == max));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    backoff.reset();
    assert_eq!(backoff.next_delay(), initial);
}

#[test]
fn backoff_saturates_after_many_failures() {
    let max = Duration::from_secs(5);
    let mut backoff = Backoff::new(Duration::from_millis(1), max);
    for _ in 0..1_000 {
        assert!(backoff.next_delay() <= max);
    }
    assert_eq!(backoff.current(), max);
}
