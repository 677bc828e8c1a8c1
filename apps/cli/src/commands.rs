//! CLI command implementations
//!
//! Each command owns a [`BundleRuntime`] and drives it with a fixed frame
//! loop, the same way an interactive host would.

use crate::output::{self, VerifyRow};
use crate::progress::DownloadProgress;
use crate::OutputFormat;
use anyhow::{anyhow, bail, Context, Result};
use bundlefetch_core::{BatchOptions, BundleRuntime, ClearMode};
use bundlefetch_types::{
    BundleDescriptor, ContentKind, CoreEvent, DownloadStatus, MirrorUrls, OperationStatus,
    Settings, VerifyLevel,
};
use console::style;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Host frame length
const FRAME: Duration = Duration::from_millis(16);

/// Tick `runtime` once per frame until `done` holds, feeding events to
/// `on_event`.
fn frame_loop(
    runtime: &mut BundleRuntime,
    mut on_event: impl FnMut(&CoreEvent),
    done: impl Fn() -> bool,
) {
    let mut events = runtime.subscribe();
    let mut last = Instant::now();
    let mut frames = 0u64;
    while !done() {
        std::thread::sleep(FRAME);
        let now = Instant::now();
        runtime.tick(now - last);
        last = now;
        frames += 1;
        while let Ok(event) = events.try_recv() {
            on_event(&event);
        }
    }
    debug!(frames, "frame loop finished");
}

/// Scan the package so the in-memory registry reflects the disk.
fn scanned_runtime(
    settings: Settings,
    package: &str,
    level: Option<VerifyLevel>,
) -> Result<ScanSummary> {
    let mut runtime = BundleRuntime::new(settings)?;
    let mut scan = bundlefetch_core::CacheScanOperation::new(package);
    if let Some(level) = level {
        scan = scan.with_level(level);
    }
    let handle = runtime.submit(scan);
    frame_loop(&mut runtime, |_| {}, || handle.is_done());
    if handle.status() != OperationStatus::Succeeded {
        bail!(
            "cache scan failed: {}",
            handle.error().unwrap_or_else(|| "unknown error".into())
        );
    }
    let (found, verified, failed, skipped) =
        handle.with(|s| (s.found(), s.verified(), s.failed(), s.skipped()));
    Ok(ScanSummary {
        package: package.to_string(),
        found,
        verified,
        failed,
        skipped,
        runtime,
    })
}

#[derive(Serialize)]
struct ScanSummary {
    package: String,
    found: usize,
    verified: usize,
    failed: usize,
    skipped: usize,
    #[serde(skip)]
    runtime: BundleRuntime,
}

// ============================================================================
// Download Commands
// ============================================================================

pub struct GetRequest {
    pub url: String,
    pub key: String,
    pub size: u64,
    pub crc: String,
    pub fallback: Option<String>,
    pub raw: Option<String>,
    pub retries: u32,
    pub timeout: Option<u64>,
}

pub fn get(
    settings: Settings,
    package: &str,
    request: GetRequest,
    format: OutputFormat,
) -> Result<()> {
    let urls = MirrorUrls::parse(&request.url, request.fallback.as_deref())
        .with_context(|| format!("invalid URL {}", request.url))?;
    let mut descriptor =
        BundleDescriptor::new(package, request.key, request.size, request.crc, urls);
    if let Some(ext) = request.raw {
        descriptor = descriptor.with_kind(ContentKind::Raw {
            extension: Some(ext),
        });
    }

    let mut runtime = BundleRuntime::with_http(settings)?;
    let mut progress = DownloadProgress::new(matches!(format, OutputFormat::Json));
    let handle = runtime.begin_download(
        descriptor,
        request.retries,
        request.timeout.map(Duration::from_secs),
    )?;
    frame_loop(&mut runtime, |e| progress.handle_event(e), || handle.is_done());
    progress.clear();

    #[derive(Serialize)]
    struct GetResult {
        key: String,
        path: PathBuf,
        status: DownloadStatus,
        attempts: u32,
        retries_used: u32,
    }
    let result = GetResult {
        key: handle.key().to_string(),
        path: handle.destination().to_path_buf(),
        status: handle.status(),
        attempts: handle.attempts(),
        retries_used: handle.retries_used(),
    };

    match format {
        OutputFormat::Json => output::print_json(&result)?,
        OutputFormat::Human | OutputFormat::Table => match &result.status {
            DownloadStatus::Succeeded => {
                output::success(format!("{} cached", style(&result.key).cyan()));
                println!("  Path: {}", result.path.display());
                if result.retries_used > 0 {
                    println!("  Retries: {}", result.retries_used);
                }
            }
            DownloadStatus::Failed { message } => {
                output::failure(format!("{}: {}", result.key, message));
            }
            DownloadStatus::Ongoing { .. } => {}
        },
    }

    match result.status {
        DownloadStatus::Failed { message } => Err(anyhow!(message)),
        _ => Ok(()),
    }
}

pub fn fetch_options(
    concurrency: usize,
    retries: u32,
    timeout: Option<u64>,
    fail_fast: bool,
) -> BatchOptions {
    BatchOptions {
        concurrency,
        retries,
        timeout: timeout.map(Duration::from_secs),
        fail_fast,
    }
}

fn read_manifest(path: &Path) -> Result<Vec<BundleDescriptor>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("malformed manifest {}", path.display()))
}

pub fn fetch(
    settings: Settings,
    manifest: &Path,
    options: BatchOptions,
    format: OutputFormat,
) -> Result<()> {
    let descriptors = read_manifest(manifest)?;
    let total = descriptors.len();
    let bytes: u64 = descriptors.iter().map(|d| d.size).sum();

    // Entries already on disk are picked up by the scan instead of downloaded
    let packages: HashSet<String> = descriptors.iter().map(|d| d.package.clone()).collect();
    let mut runtime = BundleRuntime::with_http(settings)?;
    for package in &packages {
        let scan = runtime.scan_cache(package);
        frame_loop(&mut runtime, |_| {}, || scan.is_done());
    }

    let mut progress = DownloadProgress::new(matches!(format, OutputFormat::Json));
    let batch = runtime.download_batch(descriptors, options);
    frame_loop(&mut runtime, |e| progress.handle_event(e), || batch.is_done());
    progress.clear();

    let (succeeded, failed) = batch.with(|b| (b.succeeded().to_vec(), b.failed().to_vec()));

    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct FetchResult<'a> {
                succeeded: &'a [String],
                failed: Vec<FailedEntry<'a>>,
            }
            #[derive(Serialize)]
            struct FailedEntry<'a> {
                key: &'a str,
                error: &'a str,
            }
            output::print_json(&FetchResult {
                succeeded: &succeeded,
                failed: failed
                    .iter()
                    .map(|(key, error)| FailedEntry { key, error })
                    .collect(),
            })?;
        }
        OutputFormat::Human | OutputFormat::Table => {
            for (key, error) in &failed {
                output::failure(format!("{}: {}", key, error));
            }
            println!(
                "{} of {} resources cached ({})",
                style(succeeded.len()).bold(),
                total,
                output::format_bytes(bytes)
            );
        }
    }

    if batch.status() == OperationStatus::Failed {
        bail!(batch.error().unwrap_or_else(|| "fetch failed".into()));
    }
    Ok(())
}

// ============================================================================
// Cache Commands
// ============================================================================

pub fn scan(
    settings: Settings,
    package: &str,
    level: Option<VerifyLevel>,
    format: OutputFormat,
) -> Result<()> {
    let summary = scanned_runtime(settings, package, level)?;
    match format {
        OutputFormat::Json => output::print_json(&summary)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} {}: {} found, {} verified, {} failed",
                style("✓").green().bold(),
                style(&summary.package).cyan(),
                summary.found,
                style(summary.verified).green(),
                style(summary.failed).red()
            );
        }
    }
    Ok(())
}

pub fn list(settings: Settings, package: &str, format: OutputFormat) -> Result<()> {
    let summary = scanned_runtime(settings, package, None)?;
    output::print_records(&summary.runtime.records(package), format)
}

pub fn verify(
    settings: Settings,
    package: &str,
    keys: Vec<String>,
    level: VerifyLevel,
    format: OutputFormat,
) -> Result<()> {
    let summary = scanned_runtime(settings, package, None)?;
    let runtime = &summary.runtime;
    let keys = if keys.is_empty() {
        runtime.cache().keys(package)
    } else {
        keys
    };

    let rows: Vec<VerifyRow> = keys
        .into_iter()
        .map(|key| VerifyRow {
            result: runtime.verify_cached(package, &key, level),
            key,
        })
        .collect();
    output::print_verify_results(&rows, format)?;

    let bad = rows.iter().filter(|r| !r.result.is_success()).count();
    if bad > 0 {
        bail!("{} of {} entries failed verification", bad, rows.len());
    }
    Ok(())
}

pub fn evict(
    settings: Settings,
    package: &str,
    keys: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut summary = scanned_runtime(settings, package, None)?;
    let mut removed = Vec::new();
    for key in keys {
        if summary.runtime.discard(package, &key) {
            removed.push(key);
        } else if !matches!(format, OutputFormat::Json) {
            output::failure(format!("{} is not cached", key));
        }
    }

    match format {
        OutputFormat::Json => output::print_json(&removed)?,
        OutputFormat::Human | OutputFormat::Table => {
            for key in &removed {
                output::success(format!("evicted {}", key));
            }
        }
    }
    Ok(())
}

pub fn clear(
    settings: Settings,
    package: &str,
    keep: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let mode = match keep {
        Some(path) => ClearMode::Unused(
            read_manifest(&path)?
                .into_iter()
                .filter(|d| d.package == package)
                .map(|d| d.key)
                .collect(),
        ),
        None => ClearMode::All,
    };

    let mut summary = scanned_runtime(settings, package, None)?;
    let runtime = &mut summary.runtime;
    let handle = runtime.clear_cache(package, mode);
    frame_loop(runtime, |_| {}, || handle.is_done());
    let removed = handle.with(|c| c.removed());

    match format {
        OutputFormat::Json => output::print_json(&serde_json::json!({ "removed": removed }))?,
        OutputFormat::Human | OutputFormat::Table => {
            let noun = if removed == 1 { "entry" } else { "entries" };
            output::success(format!("removed {} {}", removed, noun));
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn config(settings: &Settings, path: &Path, save: bool, format: OutputFormat) -> Result<()> {
    if save {
        bundlefetch_core::config::save_settings(path, settings)?;
    }
    match format {
        OutputFormat::Json => output::print_json(settings)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!("{}", serde_json::to_string_pretty(settings)?);
            if save {
                output::success(format!("saved to {}", path.display()));
            }
        }
    }
    Ok(())
}
