//! On-disk layout of the cache
//!
//! ```text
//! <root>/<package>/BundleFiles/<key[..2]>/<key>/__data
//!                                              /__info
//!                                              /__temp
//! <root>/<package>/RawFiles/<key[..2]>/<key>/__data.<ext>
//!                                           /__info
//! ```

use crate::error::{BundleError, BundleResult};
use bundlefetch_types::ContentKind;
use std::path::{Path, PathBuf};

pub const DATA_FILE_NAME: &str = "__data";
pub const INFO_FILE_NAME: &str = "__info";
pub const TEMP_FILE_NAME: &str = "__temp";
pub const BUNDLE_ROOT_NAME: &str = "BundleFiles";
pub const RAW_ROOT_NAME: &str = "RawFiles";

/// Which of the two per-package roots an entry lives under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Bundle,
    Raw,
}

impl From<&ContentKind> for RootKind {
    fn from(kind: &ContentKind) -> Self {
        match kind {
            ContentKind::Bundle => RootKind::Bundle,
            ContentKind::Raw { .. } => RootKind::Raw,
        }
    }
}

/// File paths of one cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub dir: PathBuf,
    pub data: PathBuf,
    pub info: PathBuf,
    pub temp: PathBuf,
}

/// Maps (package, kind, key) to paths under a cache root
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_root(&self, package: &str) -> PathBuf {
        self.root.join(package)
    }

    pub fn kind_root(&self, package: &str, kind: RootKind) -> PathBuf {
        let name = match kind {
            RootKind::Bundle => BUNDLE_ROOT_NAME,
            RootKind::Raw => RAW_ROOT_NAME,
        };
        self.package_root(package).join(name)
    }

    pub fn entry_dir(&self, package: &str, kind: RootKind, key: &str) -> PathBuf {
        self.kind_root(package, kind).join(key_prefix(key)).join(key)
    }

    pub fn paths(&self, package: &str, kind: &ContentKind, key: &str) -> CachePaths {
        let dir = self.entry_dir(package, kind.into(), key);
        CachePaths {
            data: dir.join(data_file_name(kind)),
            info: dir.join(INFO_FILE_NAME),
            temp: dir.join(TEMP_FILE_NAME),
            dir,
        }
    }
}

/// Name of the data file; raw files keep their extension
pub fn data_file_name(kind: &ContentKind) -> String {
    match kind {
        ContentKind::Raw {
            extension: Some(ext),
        } if !ext.is_empty() => format!("{}.{}", DATA_FILE_NAME, ext.trim_start_matches('.')),
        _ => DATA_FILE_NAME.to_string(),
    }
}

fn key_prefix(key: &str) -> &str {
    match key.char_indices().nth(2) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

/// Reject names that would escape their directory
pub fn validate_segment(what: &str, value: &str) -> BundleResult<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
        || value.contains('\0');
    if bad {
        return Err(BundleError::InvalidOperation(format!(
            "invalid {} '{}'",
            what, value
        )));
    }
    Ok(())
}

/// Reject raw extensions that would move the data file out of its entry dir
pub fn validate_kind(kind: &ContentKind) -> BundleResult<()> {
    match kind {
        ContentKind::Raw {
            extension: Some(ext),
        } if !ext.is_empty() => validate_segment("extension", ext.trim_start_matches('.')),
        _ => Ok(()),
    }
}
