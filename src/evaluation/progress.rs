use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Cell counters for one pass over the evaluation matrix.
pub struct EvaluationProgress {
    label: String,
    status: RunStatus,
    started_at: Instant,
    total_cells: usize,
    completed_cells: usize,
    degraded_rows: usize,
}

impl EvaluationProgress {
    pub fn new(label: impl Into<String>, total_cells: usize) -> Self {
        let label = label.into();
        debug!(run = %label, total_cells, "Starting evaluation progress tracking");
        Self {
            label,
            status: RunStatus::Pending,
            started_at: Instant::now(),
            total_cells,
            completed_cells: 0,
            degraded_rows: 0,
        }
    }

    pub fn completed_cells(&self) -> usize {
        self.completed_cells
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// A zero-cell matrix is at 100 once completed.
    pub fn percent(&self) -> f64 {
        if self.total_cells == 0 {
            return match self.status {
                RunStatus::Completed => 100.0,
                _ => 0.0,
            };
        }
        (self.completed_cells as f64 / self.total_cells as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
    }

    /// Returns the new percentage.
    pub fn complete_cell(&mut self, degraded: usize) -> f64 {
        self.completed_cells += 1;
        self.degraded_rows += degraded;
        self.percent()
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        info!(
            run = %self.label,
            elapsed_ms = %self.elapsed_ms(),
            cells = %self.completed_cells,
            degraded_rows = %self.degraded_rows,
            "Evaluation completed"
        );
    }

    pub fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        info!(
            run = %self.label,
            elapsed_ms = %self.elapsed_ms(),
            cells = %self.completed_cells,
            total_cells = %self.total_cells,
            "Evaluation cancelled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_tracking() {
        let mut progress = EvaluationProgress::new("run", 3);
        assert_eq!(progress.percent(), 0.0);
        progress.start();

        let p1 = progress.complete_cell(0);
        assert!((p1 - 33.333).abs() < 0.01);

        let p2 = progress.complete_cell(1);
        assert!((p2 - 66.666).abs() < 0.01);

        let p3 = progress.complete_cell(2);
        assert_eq!(p3, 100.0);
        assert_eq!(progress.degraded_rows, 3);
        assert_eq!(progress.completed_cells(), 3);
    }

    #[test]
    fn test_percent_empty_matrix() {
        let mut progress = EvaluationProgress::new("empty", 0);
        assert_eq!(progress.percent(), 0.0);
        progress.start();
        assert_eq!(progress.percent(), 0.0);
        progress.complete();
        assert_eq!(progress.percent(), 100.0);
    }

    #[test]
    fn test_cancel_keeps_count() {
        let mut progress = EvaluationProgress::new("run", 4);
        progress.start();
        progress.complete_cell(0);
        progress.cancel();
        assert_eq!(progress.status, RunStatus::Cancelled);
        assert_eq!(progress.percent(), 25.0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
