use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs2::available_space;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::CollectionLayout;
use crate::logging::hash_path;
use crate::{AppError, AppResult};

const CONFLICT_RENAME_LIMIT: usize = 1000;

/// Moves the collection's files from the source tree to the destination.
pub trait CopyEngine: Send + Sync {
    /// Moves every remaining file, reporting the byte length of each one as
    /// soon as it has left the source tree.
    fn migrate_files(&self, on_delta: &mut dyn FnMut(u64)) -> AppResult<()>;

    /// Moves the single file that should live at `expected` (a path in the
    /// destination tree) from its pre-migration location.
    fn migrate_file_immediately(&self, expected: &Path) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveOutcome {
    Moved,
    AlreadyPresent,
    Conflicted,
    Vanished,
}

impl MoveOutcome {
    fn as_str(self) -> &'static str {
        match self {
            MoveOutcome::Moved => "moved",
            MoveOutcome::AlreadyPresent => "identical_deleted",
            MoveOutcome::Conflicted => "conflict",
            MoveOutcome::Vanished => "vanished",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsCopyEngine {
    source: PathBuf,
    destination: PathBuf,
    layout: CollectionLayout,
}

impl FsCopyEngine {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        layout: CollectionLayout,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            layout,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    fn pending_files(&self) -> AppResult<Vec<(PathBuf, u64)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.source)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry
                .map_err(|err| AppError::from(err).with_context("operation", "copy_engine_walk"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(&self.source) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };
            if self.layout.is_excluded(&relative) {
                continue;
            }
            let len = entry
                .metadata()
                .map_err(|err| AppError::from(err).with_context("operation", "copy_engine_entry"))?
                .len();
            files.push((relative, len));
        }
        Ok(files)
    }

    fn move_relative(&self, relative: &Path) -> AppResult<MoveOutcome> {
        let from = self.source.join(relative);
        match self.place(relative, &from) {
            Ok(outcome) => Ok(outcome),
            // Moved out-of-band after the listing, e.g. by an immediate
            // recovery running next to the main transfer.
            Err(err) if !from.exists() => {
                tracing::debug!(
                    target: "mediamigrate",
                    event = "copy_engine_source_taken",
                    relative_path_hash = %hash_path(relative),
                    code = %err.code(),
                );
                Ok(MoveOutcome::Vanished)
            }
            Err(err) => Err(err),
        }
    }

    fn place(&self, relative: &Path, from: &Path) -> AppResult<MoveOutcome> {
        let to = self.destination.join(relative);
        if to.exists() {
            if same_content(from, &to)? {
                fs::remove_file(from).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "copy_engine_remove_duplicate")
                        .with_context("path_hash", hash_path(from))
                })?;
                return Ok(MoveOutcome::AlreadyPresent);
            }
            let conflict_target = unique_path(
                &self
                    .layout
                    .conflict_dir(&self.destination)
                    .join(relative),
            )?;
            move_file(from, &conflict_target)?;
            return Ok(MoveOutcome::Conflicted);
        }

        move_file(from, &to)?;
        Ok(MoveOutcome::Moved)
    }

    fn remove_empty_source_dirs(&self) {
        let conflict_dir = self.layout.conflict_dir(&self.source);
        let dirs: Vec<PathBuf> = WalkDir::new(&self.source)
            .follow_links(false)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .filter(|path| !path.starts_with(&conflict_dir))
            .collect();
        for dir in dirs {
            // Non-empty directories stay.
            let _ = fs::remove_dir(&dir);
        }
    }
}

impl CopyEngine for FsCopyEngine {
    fn migrate_files(&self, on_delta: &mut dyn FnMut(u64)) -> AppResult<()> {
        if !self.source.exists() {
            tracing::info!(
                target: "mediamigrate",
                event = "copy_engine_source_absent",
                source_hash = %hash_path(&self.source),
            );
            return Ok(());
        }

        let files = self.pending_files()?;
        tracing::info!(
            target: "mediamigrate",
            event = "copy_engine_started",
            files = files.len(),
        );

        for (relative, len) in files {
            let outcome = self.move_relative(&relative).map_err(|err| {
                err.with_context("relative_path_hash", hash_path(&relative))
            })?;
            tracing::debug!(
                target: "mediamigrate",
                event = "copy_engine_file",
                outcome = outcome.as_str(),
                relative_path_hash = %hash_path(&relative),
                bytes = len,
            );
            on_delta(len);
        }

        self.remove_empty_source_dirs();
        Ok(())
    }

    fn migrate_file_immediately(&self, expected: &Path) -> AppResult<()> {
        let relative = expected.strip_prefix(&self.destination).map_err(|_| {
            AppError::new(
                "MIGRATION/OUTSIDE_DESTINATION",
                "File is not inside the migration destination.",
            )
            .with_context("path_hash", hash_path(expected))
        })?;

        let from = self.source.join(relative);
        if !from.exists() {
            return Err(AppError::new(
                "MIGRATION/SOURCE_MISSING",
                "File is missing from the migration source.",
            )
            .with_context("relative_path_hash", hash_path(relative)));
        }

        if expected.exists() {
            return Ok(());
        }
        move_file(&from, expected)
            .map_err(|err| err.with_context("operation", "copy_engine_move_immediately"))
    }
}

/// Renames `from` to `to`, falling back to copy, length check, and source
/// removal when a rename is not possible (e.g. across filesystems).
pub fn move_file(from: &Path, to: &Path) -> AppResult<()> {
    let parent = to.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_engine_create_dirs")
            .with_context("path_hash", hash_path(parent))
    })?;

    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    let source_len = fs::metadata(from)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "copy_engine_source_metadata")
                .with_context("path_hash", hash_path(from))
        })?
        .len();

    let free = available_space(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path_hash", hash_path(parent))
    })?;
    if free < source_len {
        return Err(AppError::new(
            "MIGRATION/INSUFFICIENT_SPACE",
            "Not enough free space at the destination.",
        )
        .with_context("required_bytes", source_len.to_string())
        .with_context("available_bytes", free.to_string()));
    }

    let copied = fs::copy(from, to).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_engine_copy")
            .with_context("path_hash", hash_path(from))
    })?;
    if copied != source_len {
        let _ = fs::remove_file(to);
        return Err(AppError::new(
            "MIGRATION/VERIFY_FAILED",
            "Copied file size does not match the source.",
        )
        .with_context("expected_bytes", source_len.to_string())
        .with_context("copied_bytes", copied.to_string()));
    }

    fs::remove_file(from).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_engine_remove_source")
            .with_context("path_hash", hash_path(from))
    })
}

fn file_digest(path: &Path) -> AppResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_engine_digest_open")
            .with_context("path_hash", hash_path(path))
    })?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_engine_digest_read")
            .with_context("path_hash", hash_path(path))
    })?;
    Ok(hasher.finalize().to_vec())
}

fn same_content(a: &Path, b: &Path) -> AppResult<bool> {
    let len_a = fs::metadata(a).map_err(AppError::from)?.len();
    let len_b = fs::metadata(b).map_err(AppError::from)?.len();
    if len_a != len_b {
        return Ok(false);
    }
    Ok(file_digest(a)? == file_digest(b)?)
}

/// `path` when free, otherwise the first free `stem (n).ext` sibling.
fn unique_path(path: &Path) -> AppResult<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let ext = path
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_default();
    for idx in 1..=CONFLICT_RENAME_LIMIT {
        let mut candidate = path.to_path_buf();
        candidate.set_file_name(format!("{stem} ({idx}){ext}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        "MIGRATION/CONFLICT_LIMIT",
        "Exceeded conflict resolution attempts.",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn moves_tree_and_reports_each_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("legacy");
        let destination = dir.path().join("private");
        write(&source.join("collection.media/a.jpg"), &[1; 10]);
        write(&source.join("collection.media/b.jpg"), &[2; 20]);
        write(&source.join("backups/one.colpkg"), &[3; 5]);
        write(&source.join("collection.anki2"), &[4; 99]);

        let engine = FsCopyEngine::new(&source, &destination, CollectionLayout::default());
        let mut deltas = Vec::new();
        engine.migrate_files(&mut |delta| deltas.push(delta)).unwrap();

        deltas.sort_unstable();
        assert_eq!(deltas, vec![5, 10, 20]);
        assert!(destination.join("collection.media/a.jpg").exists());
        assert!(destination.join("backups/one.colpkg").exists());
        assert!(!source.join("collection.media").exists(), "empty dir removed");
        assert!(source.join("collection.anki2").exists(), "essential file untouched");
    }

    #[test]
    fn file_taken_by_recovery_mid_run_is_skipped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("legacy");
        let destination = dir.path().join("private");
        write(&source.join("media/a.jpg"), &[1; 10]);
        write(&source.join("media/b.jpg"), &[2; 20]);
        write(&source.join("media/c.jpg"), &[3; 30]);

        let engine = FsCopyEngine::new(&source, &destination, CollectionLayout::default());
        let taken = destination.join("media/b.jpg");
        let mut deltas = Vec::new();
        engine
            .migrate_files(&mut |delta| {
                if deltas.is_empty() {
                    // b.jpg is already listed; take it before the engine gets there.
                    engine.migrate_file_immediately(&taken).unwrap();
                }
                deltas.push(delta);
            })
            .unwrap();

        assert_eq!(deltas, vec![10, 20, 30]);
        assert_eq!(fs::read(&taken).unwrap(), vec![2; 20]);
        assert!(destination.join("media/c.jpg").exists());
        assert!(!destination.join("conflict").exists());
    }

    #[test]
    fn move_file_reports_missing_source() {
        let dir = tempdir().unwrap();
        let err = move_file(&dir.path().join("gone.jpg"), &dir.path().join("out/gone.jpg"))
            .unwrap_err();
        assert_eq!(err.code(), "IO/NotFound");
    }

    #[test]
    fn identical_destination_file_deletes_source() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("legacy");
        let destination = dir.path().join("private");
        write(&source.join("media/a.jpg"), b"same");
        write(&destination.join("media/a.jpg"), b"same");

        let engine = FsCopyEngine::new(&source, &destination, CollectionLayout::default());
        engine.migrate_files(&mut |_| {}).unwrap();

        assert!(!source.join("media/a.jpg").exists());
        assert_eq!(fs::read(destination.join("media/a.jpg")).unwrap(), b"same");
        assert!(!destination.join("conflict").exists());
    }

    #[test]
    fn differing_destination_file_moves_source_to_conflict_dir() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("legacy");
        let destination = dir.path().join("private");
        write(&source.join("media/a.jpg"), b"legacy");
        write(&destination.join("media/a.jpg"), b"newer");
        write(&destination.join("conflict/media/a.jpg"), b"older conflict");

        let engine = FsCopyEngine::new(&source, &destination, CollectionLayout::default());
        engine.migrate_files(&mut |_| {}).unwrap();

        assert_eq!(fs::read(destination.join("media/a.jpg")).unwrap(), b"newer");
        assert_eq!(
            fs::read(destination.join("conflict/media/a (1).jpg")).unwrap(),
            b"legacy"
        );
    }

    #[test]
    fn immediate_move_handles_single_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("legacy");
        let destination = dir.path().join("private");
        write(&source.join("media/a.jpg"), b"a");
        write(&source.join("media/b.jpg"), b"b");

        let engine = FsCopyEngine::new(&source, &destination, CollectionLayout::default());
        let expected = destination.join("media/a.jpg");
        engine.migrate_file_immediately(&expected).unwrap();

        assert!(expected.exists());
        assert!(!source.join("media/a.jpg").exists());
        assert!(source.join("media/b.jpg").exists(), "only the requested file moves");

        let err = engine
            .migrate_file_immediately(&destination.join("media/missing.jpg"))
            .unwrap_err();
        assert_eq!(err.code(), "MIGRATION/SOURCE_MISSING");

        let err = engine
            .migrate_file_immediately(&dir.path().join("elsewhere/a.jpg"))
            .unwrap_err();
        assert_eq!(err.code(), "MIGRATION/OUTSIDE_DESTINATION");
    }

    #[test]
    fn unique_path_advances_suffix() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("report.pdf");
        write(&base, b"a");
        write(&dir.path().join("report (1).pdf"), b"b");
        let resolved = unique_path(&base).unwrap();
        assert_eq!(resolved.file_name().unwrap().to_string_lossy(), "report (2).pdf");
    }
}
