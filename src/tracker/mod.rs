use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::config::CollectionLayout;
use crate::copy_engine::CopyEngine;
use crate::progress::{Progress, ProgressAggregator};
use crate::progress_stream::{ProgressChannel, ProgressSubscription};
use crate::store::StoreHandle;
use crate::transfer_size::{TotalSizeCache, TransferSizeEstimator};
use crate::{AppError, AppResult};

mod machine;
mod observer;

pub use machine::MigrationStateMachine;
pub use observer::{observe, spawn_observer, MigrationObserver};

const NOT_ONGOING_CODE: &str = "MIGRATION/NOT_ONGOING";

/// Upstream sink for run-level failures.
pub trait FailureReporter: Send + Sync {
    fn report(&self, run_id: Uuid, error: &AppError);
}

/// Reports failures as structured error log lines.
pub struct LogFailureReporter;

impl FailureReporter for LogFailureReporter {
    fn report(&self, run_id: Uuid, error: &AppError) {
        tracing::error!(
            target: "mediamigrate",
            event = "migration_run_failed",
            run_id = %run_id,
            code = %error.code(),
            error = %error,
        );
    }
}

/// Drives one migration run for the process lifetime: estimate, persist the
/// total, stream the copy engine's deltas, then settle the persisted keys.
pub struct MigrationTracker {
    store: StoreHandle,
    engine: Arc<dyn CopyEngine>,
    layout: CollectionLayout,
    channel: ProgressChannel,
    machine: Arc<MigrationStateMachine>,
    reporter: Arc<dyn FailureReporter>,
    started: AtomicBool,
    run_id: Uuid,
}

impl MigrationTracker {
    pub fn new(store: StoreHandle, engine: Arc<dyn CopyEngine>, layout: CollectionLayout) -> Self {
        let channel = ProgressChannel::new(Progress::CalculatingTransferSize);
        let machine = Arc::new(MigrationStateMachine::new(channel.clone()));
        Self {
            store,
            engine,
            layout,
            channel,
            machine,
            reporter: Arc::new(LogFailureReporter),
            started: AtomicBool::new(false),
            run_id: Uuid::now_v7(),
        }
    }

    pub fn with_failure_reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.channel.subscribe()
    }

    pub fn latest(&self) -> Progress {
        self.channel.latest()
    }

    fn claim(&self) -> bool {
        let claimed = self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !claimed {
            tracing::warn!(
                target: "mediamigrate",
                event = "migration_already_started",
                run_id = %self.run_id,
            );
        }
        claimed
    }

    /// Spawns the run on the runtime. A second call is ignored.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<Progress>> {
        if !self.claim() {
            return None;
        }
        let tracker = Arc::clone(self);
        Some(tokio::spawn(async move { tracker.execute().await }))
    }

    /// Runs to a terminal state on the current task. `None` when a run was
    /// already started on this tracker.
    pub async fn run(&self) -> Option<Progress> {
        if !self.claim() {
            return None;
        }
        Some(self.execute().await)
    }

    /// Every line logged during the run, including the ones from the
    /// estimator and the copy engine, carries the `run_id` of this span.
    async fn execute(&self) -> Progress {
        let span = tracing::info_span!(
            target: "mediamigrate",
            "migration_run",
            run_id = %self.run_id,
        );
        async {
            tracing::info!(target: "mediamigrate", event = "migration_run_started");
            match self.transfer().await {
                Ok(()) => self.finish_success(),
                Err(err) => self.finish_failure(err),
            }
            self.machine.current()
        }
        .instrument(span)
        .await
    }

    async fn transfer(&self) -> AppResult<()> {
        // A restarted run is no longer paused.
        self.store.clear_error_text()?;

        let paths = self.store.migration_paths()?.ok_or_else(|| {
            AppError::new(NOT_ONGOING_CODE, "No migration is in progress.")
        })?;

        let estimator = TransferSizeEstimator::for_collection(&paths.source, &self.layout);
        let remaining = run_blocking("estimate", move || estimator.estimate()).await?;
        let total = TotalSizeCache::new(self.store.clone()).get_or_set_total(remaining)?;
        let mut aggregator = ProgressAggregator::seed(total, remaining);

        tracing::info!(
            target: "mediamigrate",
            event = "migration_transfer_seeded",
            total,
            remaining,
            transferred = aggregator.transferred(),
        );
        self.machine.transferring(aggregator.transferred(), total);

        let engine = Arc::clone(&self.engine);
        let machine = Arc::clone(&self.machine);
        run_blocking("copy", move || {
            engine.migrate_files(&mut |delta| {
                let delta = i64::try_from(delta).unwrap_or(i64::MAX);
                let reported = aggregator.apply_delta(delta);
                machine.transferring(reported, total);
            })?;
            if aggregator.raw_transferred() != i128::from(total) {
                tracing::debug!(
                    target: "mediamigrate",
                    event = "migration_transfer_drift",
                    total,
                    raw_transferred = %aggregator.raw_transferred(),
                );
            }
            Ok(())
        })
        .await
    }

    fn finish_success(&self) {
        if let Err(err) = self.store.clear_run_keys() {
            self.finish_failure(err.with_context("operation", "clear_run_keys"));
            return;
        }
        if self.machine.succeed() {
            tracing::info!(
                target: "mediamigrate",
                event = "migration_run_succeeded",
            );
        }
    }

    fn finish_failure(&self, error: AppError) {
        let error = error.with_context("run_id", self.run_id.to_string());
        // Without markers there is no migration to pause.
        if error.code() != NOT_ONGOING_CODE {
            if let Err(store_err) = self.store.set_error_text(&error.user_text()) {
                tracing::warn!(
                    target: "mediamigrate",
                    event = "migration_error_text_not_persisted",
                    error = %store_err,
                );
            }
        }
        self.reporter.report(self.run_id, &error);
        self.machine.fail(error);
    }
}

async fn run_blocking<T, F>(operation: &'static str, f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    match tokio::task::spawn_blocking(move || span.in_scope(f)).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(AppError::new(
            "RUNTIME/PANIC",
            panic_message(join_err.into_panic().as_ref()),
        )
        .with_context("operation", operation)),
        Err(join_err) => Err(AppError::new("RUNTIME/CANCELLED", join_err.to_string())
            .with_context("operation", operation)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
