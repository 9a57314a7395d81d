use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::progress::Progress;

const DEFAULT_CAPACITY: usize = 1024;

struct ChannelState {
    latest: Progress,
    sender: broadcast::Sender<Progress>,
}

/// Single-producer, multi-consumer stream of [`Progress`] values that keeps
/// the latest one for late subscribers.
#[derive(Clone)]
pub struct ProgressChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl ProgressChannel {
    pub fn new(initial: Progress) -> Self {
        Self::with_capacity(initial, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(initial: Progress, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                latest: initial,
                sender,
            })),
        }
    }

    pub fn publish(&self, progress: Progress) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.latest = progress.clone();
        // No receivers is fine; late subscribers start from `latest`.
        let _ = state.sender.send(progress);
    }

    pub fn latest(&self) -> Progress {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.latest.clone()
    }

    /// The returned subscription yields the current value first, then every
    /// value published afterwards, in order.
    pub fn subscribe(&self) -> ProgressSubscription {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ProgressSubscription {
            pending: Some(state.latest.clone()),
            receiver: state.sender.subscribe(),
        }
    }
}

pub struct ProgressSubscription {
    pending: Option<Progress>,
    receiver: broadcast::Receiver<Progress>,
}

impl ProgressSubscription {
    /// Next value, or `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<Progress> {
        if let Some(progress) = self.pending.take() {
            return Some(progress);
        }
        loop {
            match self.receiver.recv().await {
                Ok(progress) => return Some(progress),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        target: "mediamigrate",
                        event = "progress_subscriber_lagged",
                        skipped,
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`ProgressSubscription::next`].
    pub fn try_next(&mut self) -> Option<Progress> {
        if let Some(progress) = self.pending.take() {
            return Some(progress);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(progress) => return Some(progress),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
