use std::collections::BTreeMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Error carried through the migration: a stable code for callers, a message
/// for people, hashed context for logs, and the error it wraps.
///
/// Serialized as part of `Progress::Failure`; the chain of messages is what
/// gets persisted as the paused-migration error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    code: String,
    message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<Box<AppError>>,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: AppError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Messages of the whole chain joined with `": "`. Context stays out so
    /// the text does not change with the keys attached along the way.
    pub fn user_text(&self) -> String {
        let mut parts = vec![self.message.as_str()];
        let mut next = self.cause();
        while let Some(cause) = next {
            parts.push(cause.message());
            next = cause.cause();
        }
        parts.join(": ")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let pairs: Vec<String> = self
                .context
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            write!(f, " ({})", pairs.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for AppError {
    fn from(error: io::Error) -> Self {
        let os_code = error.raw_os_error();
        let app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        match os_code {
            Some(code) => app_error.with_context("os_code", code.to_string()),
            None => app_error,
        }
    }
}

impl From<walkdir::Error> for AppError {
    fn from(error: walkdir::Error) -> Self {
        let path_hash = error.path().map(crate::hash_path);
        let depth = error.depth();
        let app_error = match error.into_io_error() {
            Some(io) => AppError::from(io),
            None => AppError::new("WALK/LOOP", "Symlink loop while walking the collection."),
        }
        .with_context("depth", depth.to_string());
        match path_hash {
            Some(hash) => app_error.with_context("path_hash", hash),
            None => app_error,
        }
    }
}

fn json_code(error: &serde_json::Error) -> &'static str {
    use serde_json::error::Category;
    match error.classify() {
        Category::Io => "JSON/IO",
        Category::Syntax => "JSON/SYNTAX",
        Category::Data => "JSON/DATA",
        Category::Eof => "JSON/EOF",
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        let mut app_error = AppError::new(json_code(&error), error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_follows_the_cause_chain() {
        let error = AppError::new("MIGRATION/COPY", "Failed to move file")
            .with_context("path_hash", "abc")
            .with_cause(
                AppError::new("IO/StorageFull", "No space left on device")
                    .with_cause(AppError::new("IO/Other", "quota")),
            );

        assert_eq!(
            error.user_text(),
            "Failed to move file: No space left on device: quota"
        );
        assert_eq!(error.cause().map(AppError::code), Some("IO/StorageFull"));
    }

    #[test]
    fn display_lists_context_in_key_order() {
        let error = AppError::new("STORE/WRITE", "nope")
            .with_context("operation", "put")
            .with_context("key", "migrationErrorText");
        assert_eq!(
            error.to_string(),
            "[STORE/WRITE] nope (key=migrationErrorText, operation=put)"
        );
    }

    #[test]
    fn converts_into_anyhow_with_source_chain() {
        let error = AppError::new("MIGRATION/COPY", "outer")
            .with_cause(AppError::new("IO/Other", "inner"));
        let converted: anyhow::Error = error.clone().into();
        assert_eq!(converted.to_string(), error.to_string());
        assert_eq!(converted.chain().count(), 2);
    }

    #[test]
    fn io_error_keeps_kind_and_os_code() {
        let app_error = AppError::from(io::Error::from_raw_os_error(2));
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(app_error.context().get("os_code").map(String::as_str), Some("2"));
    }

    #[test]
    fn serde_json_error_records_position() {
        let err = serde_json::from_str::<serde_json::Value>("{\"foo\": }").unwrap_err();
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
        assert!(app_error.context().contains_key("column"));
    }

    #[test]
    fn walkdir_error_hashes_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = walkdir::WalkDir::new(&missing)
            .into_iter()
            .next()
            .unwrap()
            .unwrap_err();
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(
            app_error.context().get("path_hash"),
            Some(&crate::hash_path(&missing))
        );
    }

    #[test]
    fn round_trips_through_json() {
        let error = AppError::new("MIGRATION/COPY", "outer")
            .with_context("run_id", "r1")
            .with_cause(AppError::new("IO/Other", "inner"));
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["code"], "MIGRATION/COPY");
        assert_eq!(json["context"]["run_id"], "r1");
        assert_eq!(json["cause"]["message"], "inner");
        assert!(json["cause"].get("context").is_none());

        let back: AppError = serde_json::from_value(json).unwrap();
        assert_eq!(back, error);
    }
}
