use serde::{Deserialize, Serialize};

use crate::AppError;

/// State of one migration run as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Progress {
    CalculatingTransferSize,
    Transferring {
        transferred_bytes: u64,
        total_bytes: u64,
    },
    Success,
    Failure {
        error: AppError,
    },
}

impl Progress {
    pub const fn transferring(transferred_bytes: u64, total_bytes: u64) -> Self {
        Progress::Transferring {
            transferred_bytes,
            total_bytes,
        }
    }

    /// `Success` and `Failure` end a run; nothing follows them.
    pub const fn is_done(&self) -> bool {
        matches!(self, Progress::Success | Progress::Failure { .. })
    }

    /// Fraction of the run completed, `None` outside `Transferring`.
    pub fn ratio(&self) -> Option<f64> {
        match self {
            Progress::Transferring {
                transferred_bytes,
                total_bytes,
            } => Some(ratio(*transferred_bytes, *total_bytes)),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Progress::CalculatingTransferSize => "calculating_transfer_size",
            Progress::Transferring { .. } => "transferring",
            Progress::Success => "success",
            Progress::Failure { .. } => "failure",
        }
    }
}

/// `transferred / total` clamped to `[0, 1]`; an empty transfer is complete.
pub fn ratio(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (transferred as f64 / total as f64).clamp(0.0, 1.0)
}

/// Turns the copy engine's byte deltas into the transferred count reported
/// to observers.
///
/// The raw counter is kept unclamped for diagnostics; the reported value is
/// clamped to `[0, total]` and never moves backwards.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    total: u64,
    raw: i128,
    reported: u64,
}

impl ProgressAggregator {
    /// Reconstructs work finished before a restart: the frozen `total` minus
    /// what the source tree still holds now.
    pub fn seed(total: u64, remaining: u64) -> Self {
        let raw = total as i128 - remaining as i128;
        let mut aggregator = Self {
            total,
            raw,
            reported: 0,
        };
        aggregator.reported = aggregator.clamped();
        aggregator
    }

    pub fn apply_delta(&mut self, delta: i64) -> u64 {
        self.raw += delta as i128;
        self.reported = self.reported.max(self.clamped());
        self.reported
    }

    fn clamped(&self) -> u64 {
        self.raw.clamp(0, self.total as i128) as u64
    }

    pub fn transferred(&self) -> u64 {
        self.reported
    }

    pub fn raw_transferred(&self) -> i128 {
        self.raw
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn snapshot(&self) -> Progress {
        Progress::transferring(self.reported, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seed_reconstructs_completed_work() {
        assert_eq!(ProgressAggregator::seed(1000, 1000).transferred(), 0);
        assert_eq!(ProgressAggregator::seed(1000, 650).transferred(), 350);
        assert_eq!(ProgressAggregator::seed(0, 0).transferred(), 0);
    }

    #[test]
    fn seed_tolerates_growth_after_estimation() {
        let aggregator = ProgressAggregator::seed(1000, 1400);
        assert_eq!(aggregator.transferred(), 0);
        assert_eq!(aggregator.raw_transferred(), -400);
    }

    #[test]
    fn deltas_clamp_at_total_but_raw_keeps_counting() {
        let mut aggregator = ProgressAggregator::seed(1000, 1000);
        let reported: Vec<u64> = [600, 600, 100]
            .into_iter()
            .map(|delta| aggregator.apply_delta(delta))
            .collect();
        assert_eq!(reported, vec![600, 1000, 1000]);
        assert_eq!(aggregator.raw_transferred(), 1300);
        assert_eq!(aggregator.snapshot().ratio(), Some(1.0));
    }

    #[test]
    fn negative_delta_never_lowers_reported_value() {
        let mut aggregator = ProgressAggregator::seed(100, 50);
        assert_eq!(aggregator.apply_delta(-30), 50);
        assert_eq!(aggregator.raw_transferred(), 20);
        assert_eq!(aggregator.apply_delta(40), 60);
    }

    #[test]
    fn ratio_of_empty_transfer_is_one() {
        assert_eq!(Progress::transferring(0, 0).ratio(), Some(1.0));
        assert_eq!(Progress::CalculatingTransferSize.ratio(), None);
    }

    #[test]
    fn only_terminal_states_are_done() {
        assert!(!Progress::CalculatingTransferSize.is_done());
        assert!(!Progress::transferring(1, 2).is_done());
        assert!(Progress::Success.is_done());
        assert!(Progress::Failure {
            error: AppError::new("X", "y")
        }
        .is_done());
    }

    #[test]
    fn serializes_with_state_tag() {
        let json = serde_json::to_value(Progress::transferring(5, 10)).unwrap();
        assert_eq!(json["state"], "transferring");
        assert_eq!(json["transferred_bytes"], 5);
        assert_eq!(json["total_bytes"], 10);
    }

    proptest! {
        #[test]
        fn seed_matches_subtraction(total in 0u64..u64::MAX / 2, remaining_frac in 0u64..=100) {
            let remaining = total / 100 * remaining_frac;
            prop_assert_eq!(ProgressAggregator::seed(total, remaining).transferred(), total - remaining);
        }

        #[test]
        fn reported_ratio_stays_in_unit_interval(
            total in 0u64..1_000_000,
            remaining in 0u64..2_000_000,
            deltas in proptest::collection::vec(-5_000i64..50_000, 0..64),
        ) {
            let mut aggregator = ProgressAggregator::seed(total, remaining);
            let mut previous = aggregator.transferred();
            for delta in deltas {
                let reported = aggregator.apply_delta(delta);
                prop_assert!(reported >= previous);
                prop_assert!(reported <= total);
                let r = ratio(reported, total);
                prop_assert!((0.0..=1.0).contains(&r));
                if total == 0 {
                    prop_assert_eq!(r, 1.0);
                }
                previous = reported;
            }
        }
    }
}
