use std::path::Path;

use crate::config::CollectionLayout;
use crate::copy_engine::{CopyEngine, FsCopyEngine};
use crate::logging::hash_path;
use crate::store::StoreHandle;
use crate::AppResult;

/// Makes sure the file expected at `expected` is present, moving it from the
/// pre-migration location right away if needed. Returns whether the file is
/// there afterwards. Engine failures are logged and swallowed.
pub fn recover_file(engine: &dyn CopyEngine, expected: &Path) -> bool {
    let path_hash = hash_path(expected);
    if expected.exists() {
        tracing::debug!(
            target: "mediamigrate",
            event = "immediate_recovery_not_needed",
            path_hash = %path_hash,
        );
        return true;
    }

    match engine.migrate_file_immediately(expected) {
        Ok(()) => tracing::info!(
            target: "mediamigrate",
            event = "immediate_recovery_attempted",
            path_hash = %path_hash,
        ),
        Err(err) => tracing::warn!(
            target: "mediamigrate",
            event = "immediate_recovery_failed",
            path_hash = %path_hash,
            code = %err.code(),
            error = %err,
        ),
    }

    expected.exists()
}

/// [`recover_file`] against the migration recorded in `store`. With no
/// migration ongoing there is nowhere to recover from, so only the presence
/// of `expected` is reported.
pub fn recover_from_ongoing_migration(
    store: &StoreHandle,
    layout: &CollectionLayout,
    expected: &Path,
) -> AppResult<bool> {
    match store.migration_paths()? {
        Some(paths) => {
            let engine = FsCopyEngine::new(paths.source, paths.destination, layout.clone());
            Ok(recover_file(&engine, expected))
        }
        None => Ok(expected.exists()),
    }
}
