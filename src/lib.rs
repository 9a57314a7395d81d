//! Resumable migration of a collection's media files from a legacy location
//! into app-private storage, with progress reporting that survives restarts.

pub mod config;
pub mod copy_engine;
mod error;
pub mod essential;
pub mod logging;
pub mod media_state;
pub mod progress;
pub mod progress_stream;
pub mod recovery;
pub mod store;
pub mod tracker;
pub mod transfer_size;

pub use error::{AppError, AppResult};
pub use logging::{flush_file_logs, hash_path, init_file_logging, init_logging};
