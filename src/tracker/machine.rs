use std::sync::Mutex;

use crate::progress::Progress;
use crate::progress_stream::ProgressChannel;
use crate::AppError;

/// Owns the current [`Progress`] of a run and publishes every accepted
/// transition to the run's channel.
///
/// ```text
/// CalculatingTransferSize --> Transferring --> Transferring ... --> Success
///            \                     \
///             +---------------------+--> Failure
/// ```
pub struct MigrationStateMachine {
    current: Mutex<Progress>,
    channel: ProgressChannel,
}

impl MigrationStateMachine {
    /// Starts in `CalculatingTransferSize`, which is also the channel's
    /// initial value.
    pub fn new(channel: ProgressChannel) -> Self {
        Self {
            current: Mutex::new(Progress::CalculatingTransferSize),
            channel,
        }
    }

    pub fn current(&self) -> Progress {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_done(&self) -> bool {
        self.current().is_done()
    }

    pub fn transferring(&self, transferred_bytes: u64, total_bytes: u64) -> bool {
        self.transition(Progress::transferring(transferred_bytes, total_bytes))
    }

    pub fn succeed(&self) -> bool {
        self.transition(Progress::Success)
    }

    pub fn fail(&self, error: AppError) -> bool {
        self.transition(Progress::Failure { error })
    }

    fn transition(&self, next: Progress) -> bool {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if !allowed(&current, &next) {
            tracing::debug!(
                target: "mediamigrate",
                event = "migration_transition_rejected",
                from = current.label(),
                to = next.label(),
            );
            return false;
        }
        *current = next.clone();
        // Published while holding the lock so observers see transitions in
        // the order they were accepted.
        self.channel.publish(next);
        true
    }
}

fn allowed(from: &Progress, to: &Progress) -> bool {
    use Progress::*;
    match (from, to) {
        (Success, _) | (Failure { .. }, _) => false,
        (CalculatingTransferSize, Transferring { .. }) => true,
        (Transferring { .. }, Transferring { .. }) => true,
        (Transferring { .. }, Success) => true,
        (CalculatingTransferSize, Failure { .. }) | (Transferring { .. }, Failure { .. }) => true,
        _ => false,
    }
}
