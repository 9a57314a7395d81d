use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::logging::LOG_FILE_NAME;

pub const STATE_DIR_ENV: &str = "MEDIAMIGRATE_STATE_DIR";
pub const LEGACY_ACCESS_ENV: &str = "MEDIAMIGRATE_LEGACY_ACCESS";

pub const STORE_FILE_NAME: &str = "migration.json";
pub const LOGS_DIR_NAME: &str = "logs";
const APP_DIR_NAME: &str = "mediamigrate";

/// Files moved by the essential pre-migration step, relative to the
/// collection root.
pub const DEFAULT_ESSENTIAL_FILES: &[&str] = &[
    "collection.anki2",
    "collection.anki2-wal",
    "collection.media.db",
    ".nomedia",
];

pub const DEFAULT_CONFLICT_DIR: &str = "conflict";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no usable data directory; set {}", STATE_DIR_ENV)]
    NoDataDir,
    #[error("{name} must be one of 1/0, true/false, yes/no (got {value:?})")]
    InvalidFlag { name: &'static str, value: String },
    #[error("{} is set but empty", STATE_DIR_ENV)]
    EmptyStateDir,
}

/// Which paths inside a collection are special during migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionLayout {
    /// Paths relative to the collection root, moved before the main run.
    pub essential_files: Vec<PathBuf>,
    /// Directory name holding files that could not be moved cleanly.
    pub conflict_dir_name: String,
}

impl Default for CollectionLayout {
    fn default() -> Self {
        Self {
            essential_files: DEFAULT_ESSENTIAL_FILES.iter().map(PathBuf::from).collect(),
            conflict_dir_name: DEFAULT_CONFLICT_DIR.to_string(),
        }
    }
}

impl CollectionLayout {
    pub fn essential_paths(&self, root: &Path) -> Vec<PathBuf> {
        self.essential_files.iter().map(|rel| root.join(rel)).collect()
    }

    pub fn conflict_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.conflict_dir_name)
    }

    /// True when `relative` is an essential file or lives in the conflict
    /// directory; the copy engine skips both.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.essential_files.iter().any(|e| e == relative)
            || relative.starts_with(&self.conflict_dir_name)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub state_dir: PathBuf,
    pub layout: CollectionLayout,
    /// Whether the collection stays reachable at its current location even
    /// if it is never migrated (legacy storage access retained).
    pub legacy_storage_access: bool,
}

impl MigrationConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            layout: CollectionLayout::default(),
            legacy_storage_access: false,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let state_dir = match std::env::var_os(STATE_DIR_ENV) {
            Some(value) if value.is_empty() => return Err(ConfigError::EmptyStateDir),
            Some(value) => PathBuf::from(value),
            None => dirs::data_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join(APP_DIR_NAME),
        };

        let legacy_storage_access = match std::env::var(LEGACY_ACCESS_ENV) {
            Ok(value) => parse_flag(LEGACY_ACCESS_ENV, &value)?,
            Err(_) => false,
        };

        Ok(Self {
            state_dir,
            layout: CollectionLayout::default(),
            legacy_storage_access,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join(STORE_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join(LOGS_DIR_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join(LOG_FILE_NAME)
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "" => Ok(false),
        other => Err(ConfigError::InvalidFlag {
            name,
            value: other.to_string(),
        }),
    }
}
