// Execution State
// Shared control flags and counters for one running experiment

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Point-in-time view of an experiment's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub total_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub paused: bool,
    pub cancelled: bool,
}

impl StateSnapshot {
    pub fn successful_runs(&self) -> usize {
        self.completed_runs - self.failed_runs
    }

    pub fn remaining_runs(&self) -> usize {
        self.total_runs.saturating_sub(self.completed_runs)
    }

    /// `completed / total * 100`, or 100 for an empty plan
    pub fn percent_complete(&self) -> f64 {
        if self.total_runs == 0 {
            100.0
        } else {
            self.completed_runs as f64 / self.total_runs as f64 * 100.0
        }
    }
}

/// Control and progress record shared between the executor and control requests.
///
/// Control requests only set flags; the executor observes them at the next
/// run boundary. Counters are written by the executor alone.
#[derive(Debug)]
pub struct ExecutionState {
    total_runs: usize,
    completed_runs: AtomicUsize,
    failed_runs: AtomicUsize,
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl ExecutionState {
    pub fn new(total_runs: usize) -> Self {
        Self {
            total_runs,
            completed_runs: AtomicUsize::new(0),
            failed_runs: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clear the pause flag before resuming
    pub fn clear_pause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn total_runs(&self) -> usize {
        self.total_runs
    }

    pub fn completed_runs(&self) -> usize {
        self.completed_runs.load(Ordering::SeqCst)
    }

    pub fn failed_runs(&self) -> usize {
        self.failed_runs.load(Ordering::SeqCst)
    }

    /// Record a finished run; failed runs count towards both counters
    pub fn record_run(&self, failed: bool) {
        self.completed_runs.fetch_add(1, Ordering::SeqCst);
        if failed {
            self.failed_runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let completed_runs = self.completed_runs();
        // the two loads are not one atomic read
        let failed_runs = self.failed_runs().min(completed_runs);
        StateSnapshot {
            total_runs: self.total_runs,
            completed_runs,
            failed_runs,
            paused: self.is_paused(),
            cancelled: self.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_flags() {
        let state = ExecutionState::new(4);
        assert!(!state.is_paused());
        assert!(!state.is_cancelled());

        state.request_pause();
        state.request_cancel();
        let snap = state.snapshot();
        assert!(snap.paused);
        assert!(snap.cancelled);

        state.clear_pause();
        assert!(!state.is_paused());
        assert!(state.is_cancelled());
    }

    #[test]
    fn test_counters_and_percent() {
        let state = ExecutionState::new(4);
        state.record_run(false);
        state.record_run(true);

        let snap = state.snapshot();
        assert_eq!(snap.completed_runs, 2);
        assert_eq!(snap.failed_runs, 1);
        assert_eq!(snap.successful_runs(), 1);
        assert_eq!(snap.remaining_runs(), 2);
        assert_eq!(snap.percent_complete(), 50.0);
    }

    #[test]
    fn test_empty_plan_is_complete() {
        assert_eq!(ExecutionState::new(0).snapshot().percent_complete(), 100.0);
    }

    #[tokio::test]
    async fn test_concurrent_control_and_reads() {
        let state = Arc::new(ExecutionState::new(1000));

        let writer = {
            let state = state.clone();
            tokio::spawn(async move {
                for i in 0..1000 {
                    state.record_run(i % 10 == 0);
                }
            })
        };
        let controller = {
            let state = state.clone();
            tokio::spawn(async move {
                state.request_pause();
            })
        };

        for _ in 0..100 {
            let snap = state.snapshot();
            assert!(snap.failed_runs <= snap.completed_runs);
            tokio::task::yield_now().await;
        }

        writer.await.unwrap();
        controller.await.unwrap();

        let snap = state.snapshot();
        assert_eq!(snap.completed_runs, 1000);
        assert_eq!(snap.failed_runs, 100);
        assert!(snap.paused);
    }
}
