// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic backend resource names.
//!
//! Names depend only on their inputs, so a restarted process derives the same queues, tables and
//! containers and can reattach to them. Queue and container names are lowercase alphanumerics and
//! single hyphens; table names are alphanumeric only. All names are at most 63 characters.

use xxhash_rust::xxh3::xxh3_64;

const MAX_NAME_LEN: usize = 63;

/// Stable 16-hex-digit digest of `value`.
pub fn short_hash(value: &str) -> String {
    format!("{:016x}", xxh3_64(value.as_bytes()))
}

/// Lowercase, replace anything outside `[a-z0-9]` with single hyphens, trim hyphens.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Eight hex digits identifying a name whose readable part had to be cut.
fn digest(full: &str) -> String {
    short_hash(full)[..8].to_string()
}

/// `base-suffix`, or `head-digest-suffix` when `base` is too long to fit the length limit.
///
/// The digest covers the whole sanitized base, so two bases sharing a long common head still get
/// distinct names.
fn with_suffix(base: &str, suffix: &str) -> String {
    let room = MAX_NAME_LEN - suffix.len() - 1;
    let base = sanitize(base);
    if base.len() <= room {
        return format!("{base}-{suffix}");
    }
    let digest = digest(&base);
    let mut head = base[..room - digest.len() - 1].to_string();
    while head.ends_with('-') {
        head.pop();
    }
    format!("{head}-{digest}-{suffix}")
}

fn table_name(base: &str, suffix: &str) -> String {
    let mut name: String = base
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert(0, 't');
    }
    if name.len() + suffix.len() > MAX_NAME_LEN {
        let digest = digest(&name);
        name.truncate(MAX_NAME_LEN - suffix.len() - digest.len());
        name.push_str(&digest);
    }
    name.push_str(suffix);
    name
}

/// Storage of one persisted client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageNames {
    pub request_queue: String,
    pub pending_queue: String,
    pub response_table: String,
    pub blob_container: String,
}

impl StorageNames {
    pub fn for_client(prefix: &str, session_id: &str, client_id: &str) -> Self {
        let base = format!("{prefix}-{session_id}-{}", short_hash(client_id));
        Self {
            request_queue: with_suffix(&base, "req"),
            pending_queue: with_suffix(&base, "pending"),
            response_table: table_name(&base, "resp"),
            blob_container: with_suffix(&base, "blob"),
        }
    }
}

/// Queues and container used by the broker relay of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNames {
    prefix: String,
    session_id: String,
}

impl RelayNames {
    pub fn new(prefix: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            session_id: session_id.into(),
        }
    }

    /// Request queue shared by every job serving `service`.
    pub fn request_queue(&self, service: &str) -> String {
        let base = format!("{}-{}-{}", self.prefix, self.session_id, &short_hash(service)[..8]);
        with_suffix(&base, "dispatch")
    }

    /// Response queue of one job incarnation.
    pub fn response_queue(&self, job_id: &str, requeue_count: u32) -> String {
        let base = format!("{}-{}-{}-{}", self.prefix, self.session_id, job_id, requeue_count);
        with_suffix(&base, "reply")
    }

    pub fn overflow_container(&self) -> String {
        with_suffix(&format!("{}-{}", self.prefix, self.session_id), "overflow")
    }
}
