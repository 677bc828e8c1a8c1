//! Shared types for bundlefetch
//!
//! This crate contains the plain data structures shared by the core
//! engine and by host applications (settings, descriptors, statuses
//! and events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Settings
// ============================================================================

/// Process-wide settings, set once before the runtime is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory holding one sub-tree per package
    pub cache_root: PathBuf,
    /// Wall-clock budget for one scheduler tick, in milliseconds
    pub time_slice_ms: u64,
    /// How strictly cached files are checked before being trusted
    pub verify_level: VerifyLevel,
    /// Resources at least this large (bytes) are fetched with range-resume
    pub resume_threshold: u64,
    /// Status codes that delete the partial file when an attempt fails
    pub clear_file_status_codes: Vec<u16>,
    /// Statuses at or above this value fail without consuming retries
    pub hard_fail_status: Option<u16>,
    /// Stall window used when a caller does not pass one
    pub stall_timeout_secs: u64,
    /// Whole-request timeout handed to the transport (None = unbounded)
    pub request_timeout_secs: Option<u64>,
    /// Delay between a failed attempt and the next one
    pub retry_delay_ms: u64,
    /// Delete partial output when a download is aborted
    pub delete_partial_on_abort: bool,
    /// Directory entries a cache scan advances per step
    pub scan_entries_per_step: usize,
    /// Files the batch verifier checks per step
    pub verify_files_per_step: usize,
    /// Records a clear-cache operation discards per step
    pub clear_files_per_step: usize,
    /// User agent sent by the HTTP transport
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_root: dirs::data_dir()
                .map(|p| p.join("bundlefetch").join("cache"))
                .unwrap_or_else(|| PathBuf::from(".bundlefetch/cache")),
            time_slice_ms: 8,
            verify_level: VerifyLevel::Middle,
            resume_threshold: 1024 * 1024,
            clear_file_status_codes: vec![404, 410, 416],
            hard_fail_status: None,
            stall_timeout_secs: 60,
            request_timeout_secs: None,
            retry_delay_ms: 1000,
            delete_partial_on_abort: false,
            scan_entries_per_step: 32,
            verify_files_per_step: 8,
            clear_files_per_step: 16,
            user_agent: format!("bundlefetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ============================================================================
// Verification Types
// ============================================================================

/// Verification strictness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyLevel {
    /// Info file and data file exist
    Low,
    /// Existence plus exact size
    #[default]
    Middle,
    /// Existence, exact size and CRC32
    High,
}

/// Outcome of verifying one cached (or freshly downloaded) file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyResult {
    Succeeded,
    InfoFileNotExisted,
    DataFileNotExisted,
    FileNotComplete,
    FileOverflow,
    FileCrcError,
    Exception,
    CacheNotFound,
}

impl VerifyResult {
    pub fn is_success(self) -> bool {
        self == VerifyResult::Succeeded
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VerifyResult::Succeeded => "verification succeeded",
            VerifyResult::InfoFileNotExisted => "info file does not exist",
            VerifyResult::DataFileNotExisted => "data file does not exist",
            VerifyResult::FileNotComplete => "file is smaller than expected",
            VerifyResult::FileOverflow => "file is larger than expected",
            VerifyResult::FileCrcError => "file checksum mismatch",
            VerifyResult::Exception => "i/o failure during verification",
            VerifyResult::CacheNotFound => "cache entry not found",
        };
        f.write_str(text)
    }
}

// ============================================================================
// Content Types
// ============================================================================

/// Which logical root a content item lives under
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Bundle,
    Raw {
        /// Extension kept on the data file (without the dot)
        extension: Option<String>,
    },
}

/// Candidate URLs for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorUrls {
    pub primary: String,
    pub fallback: String,
}

impl MirrorUrls {
    /// Build a mirror pair, checking that both URLs parse
    pub fn parse(primary: &str, fallback: Option<&str>) -> Result<Self, url::ParseError> {
        let primary = url::Url::parse(primary)?;
        let fallback = match fallback {
            Some(f) => url::Url::parse(f)?,
            None => primary.clone(),
        };
        Ok(Self {
            primary: primary.into(),
            fallback: fallback.into(),
        })
    }

    /// URL used by a 1-based attempt number: odd attempts use the primary,
    /// even attempts the fallback
    pub fn for_attempt(&self, attempt: u32) -> &str {
        if attempt % 2 == 1 {
            &self.primary
        } else {
            &self.fallback
        }
    }
}

/// Describes one remote content item to fetch into the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    /// Package namespace
    pub package: String,
    /// Content key (hash or GUID)
    pub key: String,
    #[serde(default)]
    pub kind: ContentKind,
    /// Expected data-file size in bytes
    pub size: u64,
    /// Expected CRC32 as lowercase hex
    pub crc: String,
    pub urls: MirrorUrls,
}

impl BundleDescriptor {
    pub fn new(
        package: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        crc: impl Into<String>,
        urls: MirrorUrls,
    ) -> Self {
        Self {
            package: package.into(),
            key: key.into(),
            kind: ContentKind::Bundle,
            size,
            crc: crc.into(),
            urls,
        }
    }

    pub fn with_kind(mut self, kind: ContentKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A verified cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub data_path: PathBuf,
    pub info_path: PathBuf,
    pub size: u64,
    pub crc: String,
    pub verified_at: DateTime<Utc>,
}

// ============================================================================
// Status Types
// ============================================================================

/// Status of an async operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }
}

/// Caller-facing download status; internal retries are not visible here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DownloadStatus {
    Ongoing { progress: f32 },
    Succeeded,
    Failed { message: String },
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadStatus::Ongoing { .. })
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to host applications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadProgress {
        package: String,
        key: String,
        downloaded: u64,
        total: u64,
    },
    DownloadStatusChanged {
        package: String,
        key: String,
        status: DownloadStatus,
        at: DateTime<Utc>,
    },
    ScanFinished {
        package: String,
        found: usize,
        verified: usize,
        failed: usize,
    },
    CacheCleared {
        package: String,
        removed: usize,
    },
}
