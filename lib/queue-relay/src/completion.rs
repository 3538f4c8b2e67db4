// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-shot completion cell.
//!
//! A [`Completion`] starts `Pending` and moves once, by compare-and-swap, to either `Completed`
//! or `TimedOut`. Only the transition winner delivers a value to the paired receiver; every other
//! attempt returns `false` and its value is dropped.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionState {
    Pending = 0,
    Completed = 1,
    TimedOut = 2,
}

impl CompletionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CompletionState::Completed,
            2 => CompletionState::TimedOut,
            _ => CompletionState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompletionState::Pending)
    }
}

pub struct Completion<T> {
    state: AtomicU8,
    sender: Mutex<Option<oneshot::Sender<T>>>,
    created: Instant,
}

impl<T> Completion<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            state: AtomicU8::new(CompletionState::Pending as u8),
            sender: Mutex::new(Some(tx)),
            created: Instant::now(),
        };
        (completion, rx)
    }

    /// Deliver the result. Returns `false` if the cell was already terminal.
    pub fn complete(&self, value: T) -> bool {
        self.transition(CompletionState::Completed, value)
    }

    /// Deliver a timeout outcome. Returns `false` if the cell was already terminal.
    pub fn time_out(&self, value: T) -> bool {
        self.transition(CompletionState::TimedOut, value)
    }

    pub fn state(&self) -> CompletionState {
        CompletionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    fn transition(&self, to: CompletionState, value: T) -> bool {
        if self
            .state
            .compare_exchange(
                CompletionState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        // a dropped receiver means the caller stopped waiting; the transition still counts
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(value);
        }
        true
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_transition_wins() {
        let (completion, rx) = Completion::<u32>::new();
        assert_eq!(completion.state(), CompletionState::Pending);

        assert!(completion.complete(1));
        assert!(!completion.complete(2));
        assert!(!completion.time_out(3));

        assert_eq!(completion.state(), CompletionState::Completed);
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn timeout_is_terminal() {
        let (completion, rx) = Completion::<&'static str>::new();
        assert!(completion.time_out("lost"));
        assert!(!completion.complete("late"));
        assert!(completion.state().is_terminal());
        assert_eq!(rx.await.unwrap(), "lost");
    }

    #[tokio::test]
    async fn dropped_receiver_still_transitions() {
        let (completion, rx) = Completion::<u8>::new();
        drop(rx);
        assert!(completion.complete(1));
        assert_eq!(completion.state(), CompletionState::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_deliver_once() {
        for _ in 0..100 {
            let (completion, rx) = Completion::<usize>::new();
            let completion = Arc::new(completion);
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let c = completion.clone();
                    tokio::spawn(async move {
                        if i % 2 == 0 {
                            c.complete(i)
                        } else {
                            c.time_out(i)
                        }
                    })
                })
                .collect();

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
            let value = rx.await.unwrap();
            let expected = if value % 2 == 0 {
                CompletionState::Completed
            } else {
                CompletionState::TimedOut
            };
            assert_eq!(completion.state(), expected);
        }
    }
}
