use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::CollectionLayout;
use crate::logging::hash_path;
use crate::store::{StoreHandle, TOTAL_BYTES_KEY};
use crate::{AppError, AppResult};

/// Size in bytes of a file, or the recursive total of the regular files under
/// a directory. Symlinks are not followed; a missing path sizes to zero.
pub fn size_of(path: &Path) -> AppResult<u64> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "size_of_metadata")
                .with_context("path_hash", hash_path(path)))
        }
    };
    if meta.is_file() {
        return Ok(meta.len());
    }
    if !meta.is_dir() {
        return Ok(0);
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|err| AppError::from(err).with_context("operation", "size_of_walk"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry
            .metadata()
            .map_err(|err| AppError::from(err).with_context("operation", "size_of_entry"))?
            .len();
        total = total.saturating_add(len);
    }
    Ok(total)
}

/// Computes how many bytes the main run still has to move.
#[derive(Debug, Clone)]
pub struct TransferSizeEstimator {
    source_root: PathBuf,
    exclusions: Vec<PathBuf>,
}

impl TransferSizeEstimator {
    pub fn new(source_root: impl Into<PathBuf>, exclusions: Vec<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            exclusions,
        }
    }

    /// Excludes the essential files (moved by the pre-migration step) and the
    /// collection's conflict directory.
    pub fn for_collection(source_root: impl Into<PathBuf>, layout: &CollectionLayout) -> Self {
        let source_root = source_root.into();
        let mut exclusions = layout.essential_paths(&source_root);
        exclusions.push(layout.conflict_dir(&source_root));
        Self::new(source_root, exclusions)
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Total size of the source root minus the size of every exclusion.
    ///
    /// The two measurements are taken at different instants, so the excluded
    /// sum can exceed the total when the tree shrinks in between; the result
    /// is then clamped to zero.
    pub fn estimate(&self) -> AppResult<u64> {
        let total = size_of(&self.source_root)?;
        let mut excluded = 0u64;
        for path in &self.exclusions {
            excluded = excluded.saturating_add(size_of(path)?);
        }

        let remaining = total.checked_sub(excluded).unwrap_or_else(|| {
            tracing::warn!(
                target: "mediamigrate",
                event = "transfer_size_exclusions_exceed_total",
                total,
                excluded,
                source_hash = %hash_path(&self.source_root),
            );
            0
        });

        tracing::info!(
            target: "mediamigrate",
            event = "transfer_size_estimated",
            total,
            excluded,
            remaining,
        );
        Ok(remaining)
    }
}

/// Persists the first total computed for a migration attempt so every
/// restart reuses the same denominator.
#[derive(Clone)]
pub struct TotalSizeCache {
    store: StoreHandle,
}

impl TotalSizeCache {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub fn get_or_set_total(&self, candidate: u64) -> AppResult<u64> {
        let total = self
            .store
            .raw()
            .get_or_set_u64(TOTAL_BYTES_KEY, candidate)
            .map_err(|err| err.with_context("operation", "total_size_get_or_set"))?;
        tracing::debug!(
            target: "mediamigrate",
            event = "total_size_resolved",
            candidate,
            total,
            reused = total != candidate,
        );
        Ok(total)
    }

    pub fn stored(&self) -> AppResult<Option<u64>> {
        self.store.total_bytes()
    }

    pub fn clear(&self) -> AppResult<()> {
        self.store.raw().remove(TOTAL_BYTES_KEY)
    }
}
