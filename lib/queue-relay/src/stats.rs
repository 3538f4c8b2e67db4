// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the workers of one relay instance.
#[derive(Debug, Default)]
pub struct RelayStats {
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    callbacks_lost: AtomicU64,
    batches_retrieved: AtomicU64,
    messages_retrieved: AtomicU64,
    empty_polls: AtomicU64,
    responses_matched: AtomicU64,
    responses_unmatched: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub messages_sent: u64,
    pub send_failures: u64,
    pub callbacks_lost: u64,
    pub batches_retrieved: u64,
    pub messages_retrieved: u64,
    pub empty_polls: u64,
    pub responses_matched: u64,
    pub responses_unmatched: u64,
}

impl RelayStats {
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_lost(&self) {
        self.callbacks_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, messages: usize) {
        self.batches_retrieved.fetch_add(1, Ordering::Relaxed);
        self.messages_retrieved
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn record_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, matched: bool) {
        if matched {
            self.responses_matched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.responses_unmatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            callbacks_lost: self.callbacks_lost.load(Ordering::Relaxed),
            batches_retrieved: self.batches_retrieved.load(Ordering::Relaxed),
            messages_retrieved: self.messages_retrieved.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            responses_unmatched: self.responses_unmatched.load(Ordering::Relaxed),
        }
    }
}
