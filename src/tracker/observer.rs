use tokio::task::JoinHandle;

use crate::progress::Progress;
use crate::progress_stream::ProgressSubscription;

/// Presentation side of a run: sees every state it receives, and the
/// terminal state once more through [`MigrationObserver::on_finished`].
pub trait MigrationObserver: Send {
    fn on_progress(&mut self, progress: &Progress);
    fn on_finished(&mut self, outcome: &Progress);
}

/// Drains `subscription` into `observer` until the run ends.
pub async fn observe(mut subscription: ProgressSubscription, observer: &mut dyn MigrationObserver) {
    while let Some(progress) = subscription.next().await {
        observer.on_progress(&progress);
        if progress.is_done() {
            observer.on_finished(&progress);
            return;
        }
    }
}

/// Runs [`observe`] on its own task and hands the observer back when done.
pub fn spawn_observer<O>(subscription: ProgressSubscription, mut observer: O) -> JoinHandle<O>
where
    O: MigrationObserver + 'static,
{
    tokio::spawn(async move {
        observe(subscription, &mut observer).await;
        observer
    })
}
