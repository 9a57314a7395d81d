//! Overall migration status derived from persisted flags and facts about
//! where the collection currently lives.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::StoreHandle;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotNeededReason {
    CollectionIsInTargetFolder,
    CollectionStaysAccessibleWithoutMigration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotOngoing {
    NotNeeded { reason: NotNeededReason },
    Needed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Ongoing {
    NotPaused,
    PausedDueToError { error_text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "detail", rename_all = "snake_case")]
pub enum MediaMigrationState {
    NotOngoing(NotOngoing),
    Ongoing(Ongoing),
}

/// Inputs of [`MediaMigrationState::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationFacts {
    pub migration_ongoing: bool,
    pub error_text: Option<String>,
    pub collection_in_target_folder: bool,
    pub stays_accessible_without_migration: bool,
}

impl MediaMigrationState {
    /// The ongoing flag wins; among not-ongoing states, being in the target
    /// folder wins over staying accessible.
    pub fn resolve(facts: &MigrationFacts) -> Self {
        if facts.migration_ongoing {
            return match facts.error_text.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => {
                    MediaMigrationState::Ongoing(Ongoing::PausedDueToError {
                        error_text: text.to_string(),
                    })
                }
                _ => MediaMigrationState::Ongoing(Ongoing::NotPaused),
            };
        }

        if facts.collection_in_target_folder {
            MediaMigrationState::NotOngoing(NotOngoing::NotNeeded {
                reason: NotNeededReason::CollectionIsInTargetFolder,
            })
        } else if facts.stays_accessible_without_migration {
            MediaMigrationState::NotOngoing(NotOngoing::NotNeeded {
                reason: NotNeededReason::CollectionStaysAccessibleWithoutMigration,
            })
        } else {
            MediaMigrationState::NotOngoing(NotOngoing::Needed)
        }
    }

    pub fn is_ongoing(&self) -> bool {
        matches!(self, MediaMigrationState::Ongoing(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            MediaMigrationState::Ongoing(Ongoing::PausedDueToError { .. })
        )
    }

    pub fn is_needed(&self) -> bool {
        matches!(self, MediaMigrationState::NotOngoing(NotOngoing::Needed))
    }
}

/// Facts about the collection's location that do not live in the store.
pub trait CollectionEnvironment: Send + Sync {
    fn collection_is_in_target_folder(&self) -> bool;
    fn collection_stays_accessible_without_migration(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct FsEnvironment {
    collection_dir: PathBuf,
    target_root: PathBuf,
    legacy_storage_access: bool,
}

impl FsEnvironment {
    pub fn new(
        collection_dir: impl Into<PathBuf>,
        target_root: impl Into<PathBuf>,
        legacy_storage_access: bool,
    ) -> Self {
        Self {
            collection_dir: collection_dir.into(),
            target_root: target_root.into(),
            legacy_storage_access,
        }
    }
}

fn normalized(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl CollectionEnvironment for FsEnvironment {
    fn collection_is_in_target_folder(&self) -> bool {
        normalized(&self.collection_dir).starts_with(normalized(&self.target_root))
    }

    fn collection_stays_accessible_without_migration(&self) -> bool {
        self.legacy_storage_access
    }
}

/// Reads the persisted flags and evaluates the state. Never writes.
pub fn resolve_media_migration_state(
    store: &StoreHandle,
    env: &dyn CollectionEnvironment,
) -> AppResult<MediaMigrationState> {
    let migration_ongoing = store.migration_ongoing()?;
    let error_text = if migration_ongoing {
        store.error_text()?
    } else {
        None
    };
    let facts = MigrationFacts {
        migration_ongoing,
        error_text,
        collection_in_target_folder: env.collection_is_in_target_folder(),
        stays_accessible_without_migration: env.collection_stays_accessible_without_migration(),
    };
    Ok(MediaMigrationState::resolve(&facts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MigrationPaths;

    fn facts(ongoing: bool, error: Option<&str>, private: bool, accessible: bool) -> MigrationFacts {
        MigrationFacts {
            migration_ongoing: ongoing,
            error_text: error.map(str::to_string),
            collection_in_target_folder: private,
            stays_accessible_without_migration: accessible,
        }
    }

    #[test]
    fn resolution_table() {
        let cases = [
            (
                facts(false, None, true, true),
                MediaMigrationState::NotOngoing(NotOngoing::NotNeeded {
                    reason: NotNeededReason::CollectionIsInTargetFolder,
                }),
            ),
            (
                facts(false, None, false, true),
                MediaMigrationState::NotOngoing(NotOngoing::NotNeeded {
                    reason: NotNeededReason::CollectionStaysAccessibleWithoutMigration,
                }),
            ),
            (
                facts(false, None, false, false),
                MediaMigrationState::NotOngoing(NotOngoing::Needed),
            ),
            (
                facts(true, None, false, false),
                MediaMigrationState::Ongoing(Ongoing::NotPaused),
            ),
            (
                facts(true, Some("disk full"), false, false),
                MediaMigrationState::Ongoing(Ongoing::PausedDueToError {
                    error_text: "disk full".into(),
                }),
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(MediaMigrationState::resolve(&input), expected, "{input:?}");
        }
    }

    #[test]
    fn blank_error_text_is_not_a_pause() {
        let state = MediaMigrationState::resolve(&facts(true, Some("  \n"), true, true));
        assert_eq!(state, MediaMigrationState::Ongoing(Ongoing::NotPaused));
    }

    #[test]
    fn error_text_is_ignored_when_not_ongoing() {
        let state = MediaMigrationState::resolve(&facts(false, Some("disk full"), false, false));
        assert!(state.is_needed());
    }

    struct FixedEnv(bool, bool);

    impl CollectionEnvironment for FixedEnv {
        fn collection_is_in_target_folder(&self) -> bool {
            self.0
        }
        fn collection_stays_accessible_without_migration(&self) -> bool {
            self.1
        }
    }

    #[test]
    fn resolves_from_store_without_writing() {
        let store = StoreHandle::in_memory();
        let env = FixedEnv(false, false);
        assert!(resolve_media_migration_state(&store, &env).unwrap().is_needed());

        store
            .set_migration_paths(&MigrationPaths {
                source: "/legacy".into(),
                destination: "/private".into(),
            })
            .unwrap();
        store.set_error_text("disk full").unwrap();
        let state = resolve_media_migration_state(&store, &env).unwrap();
        assert!(state.is_paused());
        assert_eq!(store.error_text().unwrap().as_deref(), Some("disk full"));
    }

    #[test]
    fn fs_environment_detects_collection_under_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("private");
        let collection = target.join("collection");
        std::fs::create_dir_all(&collection).unwrap();

        assert!(FsEnvironment::new(&collection, &target, false).collection_is_in_target_folder());
        let legacy = dir.path().join("legacy");
        std::fs::create_dir_all(&legacy).unwrap();
        let env = FsEnvironment::new(&legacy, &target, true);
        assert!(!env.collection_is_in_target_folder());
        assert!(env.collection_stays_accessible_without_migration());
    }
}
