// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Broker and worker ends of the queue relay.
//!
//! ```ignore
//! // broker
//! let broker = RelayOptionsBuilder::default()
//!     .session_id("session-1")
//!     .broker(backend.clone())
//!     .await?;
//! let requests = broker.create_request_storage("Echo").await?;
//! broker.start("job-7", 0).await?;
//! let awaiter = broker.send(&requests, Message::new("hello")).await?;
//!
//! // worker
//! let worker = RelayOptionsBuilder::default()
//!     .session_id("session-1")
//!     .worker(backend, requests)
//!     .await?;
//! let request = worker.receive().await?;
//! worker.reply(&request, "world").await?;
//!
//! let response = awaiter.await?;
//! ```

mod broker;
mod worker;

pub use broker::BrokerRelay;
pub use worker::WorkerRelay;

use derive_builder::Builder;
use validator::Validate;

use crate::backend::Backend;
use crate::config::RelayConfig;
use crate::error::RelayError;

/// Options shared by both relay ends.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_options"))]
pub struct RelayOptions {
    /// Session whose queues the relay uses (required).
    #[builder(setter(into))]
    pub session_id: String,

    #[builder(default)]
    pub config: RelayConfig,
}

impl RelayOptionsBuilder {
    /// Build the options and create the broker end.
    pub async fn broker(self, backend: Backend) -> Result<BrokerRelay, RelayError> {
        BrokerRelay::new(backend, self.validated()?).await
    }

    /// Build the options and create a worker end consuming `request_queue`.
    pub async fn worker(
        self,
        backend: Backend,
        request_queue: impl Into<String>,
    ) -> Result<WorkerRelay, RelayError> {
        WorkerRelay::new(backend, self.validated()?, request_queue.into()).await
    }

    fn validated(self) -> Result<RelayOptions, RelayError> {
        let options = self
            .build_options()
            .map_err(|e| RelayError::InvalidState(format!("invalid relay options: {e}")))?;
        options
            .config
            .validate()
            .map_err(|e| RelayError::InvalidState(format!("invalid configuration: {e}")))?;
        Ok(options)
    }
}
