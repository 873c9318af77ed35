// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler status codes and asynchronous error delivery.
//!
//! Every submission carries a [`StatusCallback`]; the scheduler delivers
//! exactly one terminal [`Status`] per submission. Fabric-level errors can
//! arrive on a transport thread long after the submitting call returned, so a
//! process-wide [`CallbackTable`] remembers the callback registered under each
//! routing key and can fail all outstanding submissions without racing the
//! normal completion path.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::task::StatusCallback;

/// Categorizes scheduler outcomes into a fixed set of standard kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    Ok,
    UnknownError,
    PreconditionError,
    Aborted,
    InvalidArgument,
    InProgress,
    /// Surfaced from the parameter-server transport.
    DataLoss,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Ok => "OK",
            StatusKind::UnknownError => "UnknownError",
            StatusKind::PreconditionError => "PreconditionError",
            StatusKind::Aborted => "Aborted",
            StatusKind::InvalidArgument => "InvalidArgument",
            StatusKind::InProgress => "InProgress",
            StatusKind::DataLoss => "DataLoss",
        };
        f.write_str(s)
    }
}

/// The outcome of a submission, delivered through its callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    kind: StatusKind,
    reason: String,
}

impl Status {
    pub fn ok() -> Self {
        Self { kind: StatusKind::Ok, reason: String::new() }
    }

    pub fn unknown_error(reason: impl Into<String>) -> Self {
        Self { kind: StatusKind::UnknownError, reason: reason.into() }
    }

    pub fn precondition_error(reason: impl Into<String>) -> Self {
        Self { kind: StatusKind::PreconditionError, reason: reason.into() }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self { kind: StatusKind::Aborted, reason: reason.into() }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self { kind: StatusKind::InvalidArgument, reason: reason.into() }
    }

    pub fn in_progress() -> Self {
        Self { kind: StatusKind::InProgress, reason: String::new() }
    }

    pub fn data_loss(reason: impl Into<String>) -> Self {
        Self { kind: StatusKind::DataLoss, reason: reason.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    pub fn in_progress_kind(&self) -> bool {
        self.kind == StatusKind::InProgress
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.reason)
        }
    }
}

impl std::error::Error for Status {}

/// Remembers the callback registered under each routing key.
///
/// A submission registers once under its first routing key; a fabric error
/// handed to [`CallbackTable::fail_all`] fires every remembered callback with
/// the error status and drains the table, so a callback cannot observe both
/// the error path and the normal completion path.
#[derive(Default)]
pub struct CallbackTable {
    callbacks: DashMap<u64, StatusCallback>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: u64, callback: StatusCallback) {
        self.callbacks.insert(key, callback);
    }

    pub fn remove(&self, key: u64) {
        self.callbacks.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Deliver `status` to every outstanding callback and clear the table.
    pub fn fail_all(&self, status: &Status) {
        let keys: Vec<u64> = self.callbacks.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, cb)) = self.callbacks.remove(&key) {
                tracing::warn!(key, %status, "delivering transport error to callback");
                cb(status.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_status_display() {
        assert_eq!(Status::ok().to_string(), "OK");
        assert_eq!(
            Status::invalid_argument("bad split").to_string(),
            "InvalidArgument: bad split"
        );
    }

    #[test]
    fn test_status_predicates() {
        assert!(Status::ok().is_ok());
        assert!(!Status::aborted("x").is_ok());
        assert!(Status::in_progress().in_progress_kind());
    }

    #[test]
    fn test_status_serialization_roundtrip() {
        let status = Status::data_loss("server 3 vanished");
        let json = serde_json::to_string(&status).unwrap();
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), StatusKind::DataLoss);
        assert_eq!(back.reason(), "server 3 vanished");
    }

    #[test]
    fn test_callback_table_fail_all_fires_once() {
        let table = CallbackTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for key in [10u64, 11, 12] {
            let fired = fired.clone();
            table.record(
                key,
                Arc::new(move |status: Status| {
                    assert_eq!(status.kind(), StatusKind::DataLoss);
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        table.fail_all(&Status::data_loss("link down"));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(table.is_empty());

        // A second sweep has nothing left to deliver.
        table.fail_all(&Status::data_loss("link down"));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
