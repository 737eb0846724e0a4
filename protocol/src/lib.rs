//! Wire types shared between the supervisor core and any presentation layer.
//!
//! Field names follow the JSON surface the node front ends already speak
//! (`dbPath`, `apiPort`, ...), so a UI can deserialize these types without a
//! translation layer.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::FromRepr;

/// Parameters for one run of the worker process. Immutable once used to
/// start a run; revalidated by the supervisor on every start attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "dbPath")]
    pub db_path: String,
    #[serde(rename = "apiPort")]
    pub api_port: u16,
    #[serde(rename = "p2pPort")]
    pub p2p_port: u16,
}

/// The supervisor's sole source of truth for which operations are currently
/// permitted. Exactly one value at a time; `Updating` is mutually exclusive
/// with every process-facing state and is only entered from `Stopped`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, FromRepr,
)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Updating = 4,
}

impl RunState {
    /// True while a start/stop/update intent is being resolved.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping | Self::Updating)
    }
}

/// Byte counters for one download session. `bytes_total == 0` means the
/// server did not report a length; consumers must treat that as
/// indeterminate rather than computing a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    #[serde(rename = "current")]
    pub bytes_received: u64,
    #[serde(rename = "total")]
    pub bytes_total: u64,
}

impl DownloadProgress {
    /// Whole-number percentage, when the total is known.
    pub fn percent(&self) -> Option<u64> {
        if self.bytes_total == 0 {
            None
        } else {
            Some(self.bytes_received.saturating_mul(100) / self.bytes_total)
        }
    }
}

/// One captured line of worker output, stamped with local receipt time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogLine {
    /// Rendering used for the plain-text log view.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.text
        )
    }
}

/// Latest published worker binary, as reported by the release index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    pub url: String,
    /// Expected byte length of the binary; 0 when the index does not say.
    pub size: u64,
}

/// Events published by the supervisor to subscribers. Per operation they are
/// delivered in occurrence order: progress is non-decreasing and a download
/// ends in exactly one of `DownloadComplete` / `DownloadFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StatusChanged { state: RunState },
    DownloadProgress(DownloadProgress),
    DownloadComplete,
    DownloadFailed { reason: String },
}
