use serde::{Deserialize, Serialize};

use crate::StepId;

/// Snapshot of the per-step counters of a scheduler.
///
/// Counters never decrease, and `done <= running <= submitted` holds for every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    pub step_id: StepId,
    pub submitted: usize,
    /// Tasks that have started (cumulative, not "currently running").
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl StepStatus {
    pub fn empty(step_id: StepId) -> Self {
        Self {
            step_id,
            submitted: 0,
            running: 0,
            done: 0,
            failed: 0,
        }
    }

    /// Fraction of submitted tasks that have a result, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.submitted == 0 {
            return 0.0;
        }
        self.done as f64 / self.submitted as f64
    }

    /// Returns `true` when every submitted task has a result.
    pub fn is_complete(&self) -> bool {
        self.done >= self.submitted
    }

    /// Add the counters of `other` (same step, another backend).
    pub fn merge(&mut self, other: &StepStatus) {
        self.submitted += other.submitted;
        self.running += other.running;
        self.done += other.done;
        self.failed += other.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_of_empty_step_is_zero() {
        let s = StepStatus::empty(StepId::from("a"));
        assert_eq!(s.progress(), 0.0);
        assert!(s.is_complete());
    }

    #[test]
    fn merge_sums_counters() {
        let mut a = StepStatus {
            step_id: StepId::from("a"),
            submitted: 4,
            running: 3,
            done: 2,
            failed: 1,
        };
        let b = StepStatus {
            step_id: StepId::from("a"),
            submitted: 2,
            running: 2,
            done: 2,
            failed: 0,
        };
        a.merge(&b);
        assert_eq!((a.submitted, a.running, a.done, a.failed), (6, 5, 4, 1));
        assert!((a.progress() - 4.0 / 6.0).abs() < f64::EPSILON);
    }
}
