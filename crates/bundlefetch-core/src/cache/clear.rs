//! Clear-cache operation

use crate::operation::{AsyncOperation, OperationContext, StepResult};
use bundlefetch_types::CoreEvent;
use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use tracing::{info, warn};

/// Which entries a clear removes
#[derive(Debug, Clone)]
pub enum ClearMode {
    /// Every record, then the package directory itself
    All,
    /// Records the given manifest does not require
    Unused(HashSet<String>),
}

/// Discards cache entries a few per step
pub struct ClearCacheOperation {
    package: String,
    mode: ClearMode,
    pending: Option<VecDeque<String>>,
    total: usize,
    removed: usize,
}

impl ClearCacheOperation {
    pub fn new(package: impl Into<String>, mode: ClearMode) -> Self {
        Self {
            package: package.into(),
            mode,
            pending: None,
            total: 0,
            removed: 0,
        }
    }

    pub fn removed(&self) -> usize {
        self.removed
    }

    fn collect(&mut self, ctx: &OperationContext<'_>) -> VecDeque<String> {
        let keys = match &self.mode {
            ClearMode::All => ctx.cache.keys(&self.package),
            ClearMode::Unused(manifest) => ctx.cache.unused_keys(&self.package, manifest),
        };
        self.total = keys.len();
        keys.into()
    }
}

impl AsyncOperation for ClearCacheOperation {
    fn start(&mut self, ctx: &mut OperationContext<'_>) {
        let keys = self.collect(ctx);
        self.pending = Some(keys);
    }

    fn step(&mut self, ctx: &mut OperationContext<'_>) -> StepResult {
        if self.pending.is_none() {
            let keys = self.collect(ctx);
            self.pending = Some(keys);
        }
        let Some(pending) = self.pending.as_mut() else {
            return StepResult::Running;
        };

        let per_step = ctx.settings.clear_files_per_step.max(1);
        for _ in 0..per_step {
            let Some(key) = pending.pop_front() else {
                break;
            };
            if ctx.cache.discard(&self.package, &key) {
                self.removed += 1;
            }
            if ctx.is_busy() {
                break;
            }
        }
        if !pending.is_empty() {
            return StepResult::Running;
        }

        if matches!(self.mode, ClearMode::All) {
            let root = ctx.cache.layout().package_root(&self.package);
            match std::fs::remove_dir_all(&root) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(package = %self.package, path = %root.display(), error = %e, "failed to remove package directory")
                }
            }
        }

        info!(package = %self.package, removed = self.removed, "cache cleared");
        ctx.emit(CoreEvent::CacheCleared {
            package: self.package.clone(),
            removed: self.removed,
        });
        StepResult::Succeeded
    }

    fn progress(&self) -> f32 {
        match &self.pending {
            Some(pending) if self.total > 0 => {
                (self.total - pending.len()) as f32 / self.total as f32
            }
            _ => 0.0,
        }
    }
}
