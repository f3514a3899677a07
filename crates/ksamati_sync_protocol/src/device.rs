//! Device identity, cursors and status rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a client device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Sync progress of one device (`data_sync` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCursor {
    /// Device.
    pub device_id: DeviceId,
    /// Last acknowledged local sequence number.
    pub cursor: u64,
    /// Position in the central change feed already pulled.
    pub remote_cursor: u64,
}

impl DeviceCursor {
    /// Cursor row of a device that has never synced.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            cursor: 0,
            remote_cursor: 0,
        }
    }
}

/// Health of one device (`device_sync_status` row).
///
/// Cursor and pending count change only after a successful cycle; a failed
/// cycle touches the failure fields alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device.
    pub device_id: DeviceId,
    /// Cursor after the last successful cycle.
    pub last_sync_cursor: u64,
    /// Last time the device completed or attempted a cycle.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Entries still pending after the last successful cycle.
    pub pending_count: u64,
    /// Completion time of the last successful cycle.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Error of the last failed cycle, cleared on success.
    pub last_error: Option<String>,
    /// Failed cycles since the last success.
    pub consecutive_failures: u32,
}

impl DeviceStatus {
    /// Status row of a device that has never synced.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            last_sync_cursor: 0,
            last_seen_at: None,
            pending_count: 0,
            last_success_at: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    /// Records a successful cycle.
    pub fn record_success(&mut self, cursor: u64, pending_count: u64, at: DateTime<Utc>) {
        self.last_sync_cursor = cursor;
        self.pending_count = pending_count;
        self.last_seen_at = Some(at);
        self.last_success_at = Some(at);
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    /// Records a failed cycle without touching cursor or pending count.
    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.last_seen_at = Some(at);
        self.last_error = Some(error.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_leaves_progress_untouched() {
        let now = Utc::now();
        let mut status = DeviceStatus::new(DeviceId::new("laptop-1"));
        status.record_success(12, 3, now);

        status.record_failure("connection reset", now);
        status.record_failure("operation timed out", now);

        assert_eq!(status.last_sync_cursor, 12);
        assert_eq!(status.pending_count, 3);
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("operation timed out"));
        assert_eq!(status.last_success_at, Some(now));
    }

    #[test]
    fn success_clears_failures() {
        let now = Utc::now();
        let mut status = DeviceStatus::new(DeviceId::new("laptop-1"));
        status.record_failure("offline", now);
        status.record_success(4, 0, now);

        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
        assert_eq!(status.last_sync_cursor, 4);
    }
}
