use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Lifecycle of a hyperopt run. Passed explicitly to strategy calls so they can
/// tell indicator precomputation apart from per-epoch evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HyperoptState {
    #[default]
    Startup,
    DataLoad,
    Indicators,
    Optimize,
    Completed,
    Interrupted,
}

impl HyperoptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HyperoptState::Startup => "startup",
            HyperoptState::DataLoad => "dataload",
            HyperoptState::Indicators => "indicators",
            HyperoptState::Optimize => "optimize",
            HyperoptState::Completed => "completed",
            HyperoptState::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HyperoptState::Completed | HyperoptState::Interrupted)
    }

    /// Legal forward transitions. `Indicators` may be skipped.
    pub fn can_transition_to(&self, next: HyperoptState) -> bool {
        use HyperoptState::*;
        matches!(
            (self, next),
            (Startup, DataLoad)
                | (DataLoad, Indicators)
                | (DataLoad, Optimize)
                | (Indicators, Optimize)
                | (Optimize, Optimize)
                | (Optimize, Completed)
                | (Startup | DataLoad | Indicators | Optimize, Interrupted)
        )
    }
}

impl fmt::Display for HyperoptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<OptimizerStatusData>>,
}

#[derive(Default)]
struct OptimizerStatusData {
    state: HyperoptState,
    phase: String,
    total_epochs: usize,
    completed_epochs: usize,
    failed_epochs: usize,
    best_loss: Option<f64>,
    best_epoch: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct OptimizerStatusSnapshot {
    pub state: HyperoptState,
    pub phase: String,
    pub total_epochs: usize,
    pub completed_epochs: usize,
    pub failed_epochs: usize,
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OptimizerStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn state(&self) -> HyperoptState {
        self.inner
            .lock()
            .map(|data| data.state)
            .unwrap_or(HyperoptState::Startup)
    }

    /// Moves to `next`; illegal transitions are ignored and reported as `false`.
    pub fn transition(&self, next: HyperoptState) -> bool {
        if let Ok(mut data) = self.inner.lock() {
            if data.state.can_transition_to(next) {
                data.state = next;
                data.phase = next.as_str().to_string();
                return true;
            }
        }
        false
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn set_progress(
        &self,
        total_epochs: usize,
        completed_epochs: usize,
        failed_epochs: usize,
    ) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_epochs = total_epochs;
            data.completed_epochs = completed_epochs;
            data.failed_epochs = failed_epochs;
        }
    }

    pub fn record_best(&self, epoch: usize, loss: f64) {
        if let Ok(mut data) = self.inner.lock() {
            data.best_epoch = Some(epoch);
            data.best_loss = Some(loss);
        }
    }

    pub fn snapshot(&self) -> OptimizerStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            OptimizerStatusSnapshot {
                state: data.state,
                phase: data.phase.clone(),
                total_epochs: data.total_epochs,
                completed_epochs: data.completed_epochs,
                failed_epochs: data.failed_epochs,
                best_loss: data.best_loss,
                best_epoch: data.best_epoch,
            }
        } else {
            OptimizerStatusSnapshot {
                state: HyperoptState::Startup,
                phase: "Status unavailable".to_string(),
                total_epochs: 0,
                completed_epochs: 0,
                failed_epochs: 0,
                best_loss: None,
                best_epoch: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_forward_transitions() {
        let status = OptimizerStatus::new();
        assert!(status.transition(HyperoptState::DataLoad));
        assert!(status.transition(HyperoptState::Optimize));
        assert!(!status.transition(HyperoptState::Indicators));
        assert!(status.transition(HyperoptState::Optimize));
        assert!(status.transition(HyperoptState::Completed));
        assert!(status.state().is_terminal());
        assert!(!status.transition(HyperoptState::Interrupted));
    }

    #[test]
    fn interrupt_is_reachable_before_completion() {
        let status = OptimizerStatus::new();
        assert!(status.transition(HyperoptState::Interrupted));
        assert_eq!(status.snapshot().phase, "interrupted");
    }

    #[test]
    fn snapshot_reports_best_epoch() {
        let status = OptimizerStatus::new();
        status.set_progress(10, 4, 1);
        status.record_best(3, -1.5);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.completed_epochs, 4);
        assert_eq!(snapshot.best_epoch, Some(3));
        assert_eq!(snapshot.best_loss, Some(-1.5));
    }
}
