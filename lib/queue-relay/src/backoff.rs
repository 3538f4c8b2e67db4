// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::config::RetrieverConfig;

/// Exponential backoff shared by the poll and send workers.
///
/// After `n` consecutive failures or empty polls the delay is `min(initial * 2^n, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempts: 0,
        }
    }

    pub fn from_config(config: &RetrieverConfig) -> Self {
        Self::new(config.backoff_initial(), config.backoff_max())
    }

    /// The delay the next wait will use.
    pub fn current(&self) -> Duration {
        // 2^20 already exceeds any sensible ceiling
        let factor = 1u32 << self.attempts.min(20);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Return the current delay and escalate for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetrieverConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(5, 3_200)]
    #[case(6, 5_000)]
    #[case(40, 5_000)]
    fn delay_after_consecutive_empty_polls(#[case] empties: u32, #[case] expected_ms: u64) {
        let mut backoff = Backoff::default();
        for _ in 0..empties {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_millis(expected_ms));
        let expected = std::cmp::min(100u64.saturating_mul(1u64 << empties.min(40)), 5_000);
        assert_eq!(backoff.current().as_millis() as u64, expected);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::default();
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn never_overflows() {
        let mut backoff = Backoff::new(Duration::from_secs(u64::MAX / 2), Duration::MAX);
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::MAX);
    }
}
