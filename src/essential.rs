use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CollectionLayout;
use crate::copy_engine::move_file;
use crate::logging::hash_path;
use crate::store::{MigrationPaths, StoreHandle};
use crate::{AppError, AppResult};

/// Moves the files the collection cannot open without, then records the
/// source/destination markers. From that point the migration is ongoing and
/// the tracker moves everything else in the background.
///
/// Returns the relative paths that were moved.
pub fn migrate_essential_files(
    store: &StoreHandle,
    layout: &CollectionLayout,
    source: &Path,
    destination: &Path,
) -> AppResult<Vec<PathBuf>> {
    if let Some(existing) = store.migration_paths()? {
        return Err(AppError::new(
            "MIGRATION/ALREADY_ONGOING",
            "A migration is already in progress.",
        )
        .with_context("source_hash", hash_path(&existing.source))
        .with_context("destination_hash", hash_path(&existing.destination)));
    }

    if !source.is_dir() {
        return Err(AppError::new(
            "MIGRATION/SOURCE_NOT_DIRECTORY",
            "The collection folder to migrate does not exist.",
        )
        .with_context("source_hash", hash_path(source)));
    }
    if destination.starts_with(source) {
        return Err(AppError::new(
            "MIGRATION/DESTINATION_INSIDE_SOURCE",
            "The destination must not be inside the collection folder.",
        ));
    }

    fs::create_dir_all(destination).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "essential_create_destination")
            .with_context("destination_hash", hash_path(destination))
    })?;

    let pending: Vec<&PathBuf> = layout
        .essential_files
        .iter()
        .filter(|relative| source.join(relative).is_file())
        .collect();

    // Nothing moves unless every essential file can move.
    if let Some(relative) = pending
        .iter()
        .find(|relative| destination.join(relative).exists())
    {
        return Err(AppError::new(
            "MIGRATION/ESSENTIAL_EXISTS",
            "The destination already contains a collection.",
        )
        .with_context("relative_path_hash", hash_path(relative)));
    }

    let mut moved: Vec<PathBuf> = Vec::new();
    for relative in pending {
        if let Err(err) = move_file(&source.join(relative), &destination.join(relative)) {
            restore(&moved, source, destination);
            return Err(err.with_context("operation", "essential_move"));
        }
        moved.push(relative.clone());
    }

    // Leftovers from an earlier attempt must not leak into this one.
    store.clear_run_keys()?;
    store.clear_error_text()?;
    store.set_migration_paths(&MigrationPaths {
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
    })?;

    tracing::info!(
        target: "mediamigrate",
        event = "essential_files_migrated",
        moved = moved.len(),
        source_hash = %hash_path(source),
        destination_hash = %hash_path(destination),
    );
    Ok(moved)
}

/// Puts already-moved essential files back so a failed step leaves the
/// collection where it was.
fn restore(moved: &[PathBuf], source: &Path, destination: &Path) {
    for relative in moved.iter().rev() {
        if let Err(err) = move_file(&destination.join(relative), &source.join(relative)) {
            tracing::error!(
                target: "mediamigrate",
                event = "essential_restore_failed",
                relative_path_hash = %hash_path(relative),
                code = %err.code(),
                error = %err,
            );
        }
    }
}
