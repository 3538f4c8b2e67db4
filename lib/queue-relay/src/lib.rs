// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Queue Relay
//!
//! Message relay and session persistence over cloud queue, table and blob services.
//!
//! The broker end sends requests onto per-service request queues and correlates the responses
//! arriving on its per-job response queue. The worker end consumes a request queue and replies.
//! [`persist::SessionPersist`] stores the requests and responses of one client session durably so
//! that a restarted broker can reattach to it.

pub mod backend;
pub mod backoff;
pub mod completion;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod naming;
pub mod overflow;
pub mod persist;
pub mod prefetch;
pub mod registry;
pub mod relay;
pub mod reliable_send;
pub mod retriever;
pub mod sender;
pub mod stats;

pub use backend::Backend;
pub use config::RelayConfig;
pub use error::{BackendError, ErrorKind, RelayError};
pub use message::{Message, MessageId};
pub use persist::{SessionOptionsBuilder, SessionPersist, SessionPersistCounter};
pub use prefetch::{CreditPrefetcher, PrefetchSource};
pub use registry::{CorrelationRegistry, ResponseAwaiter};
pub use relay::{BrokerRelay, RelayOptionsBuilder, WorkerRelay};

pub use tokio_util::sync::CancellationToken;
