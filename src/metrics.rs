use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Metrics {
    pub runs_total: AtomicU64,
    pub runs_active: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub cells_total: AtomicU64,
    pub agent_calls_total: AtomicU64,
    pub agent_results_degraded: AtomicU64,
    pub duration_sum_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start_run(&self) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        self.runs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_run(&self, outcome: RunOutcome, duration_ms: u64) {
        self.runs_active.fetch_sub(1, Ordering::Relaxed);
        self.duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        let counter = match outcome {
            RunOutcome::Completed => &self.runs_completed,
            RunOutcome::Failed => &self.runs_failed,
            RunOutcome::Cancelled => &self.runs_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cell(&self, agent_calls: usize, degraded: usize) {
        self.cells_total.fetch_add(1, Ordering::Relaxed);
        self.agent_calls_total
            .fetch_add(agent_calls as u64, Ordering::Relaxed);
        self.agent_results_degraded
            .fetch_add(degraded as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let rows: [(&str, &str, &str, u64); 9] = [
            ("runs_total", "counter", "Total evaluation runs started.", self.runs_total.load(Ordering::Relaxed)),
            ("runs_active", "gauge", "Currently running evaluation runs.", self.runs_active.load(Ordering::Relaxed)),
            ("runs_completed", "counter", "Runs that produced a full result set.", self.runs_completed.load(Ordering::Relaxed)),
            ("runs_failed", "counter", "Runs that stopped on a fatal error.", self.runs_failed.load(Ordering::Relaxed)),
            ("runs_cancelled", "counter", "Runs cancelled before completion.", self.runs_cancelled.load(Ordering::Relaxed)),
            ("cells_total", "counter", "Evaluation cells completed.", self.cells_total.load(Ordering::Relaxed)),
            ("agent_calls_total", "counter", "Judge invocations attempted.", self.agent_calls_total.load(Ordering::Relaxed)),
            ("agent_results_degraded", "counter", "Judge results replaced by a fallback score.", self.agent_results_degraded.load(Ordering::Relaxed)),
            ("run_duration_ms_sum", "counter", "Sum of run durations in ms.", self.duration_sum_ms.load(Ordering::Relaxed)),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in rows {
            out.push_str(&format!(
                "# HELP prompt_arena_{name} {help}\n\
                 # TYPE prompt_arena_{name} {kind}\n\
                 prompt_arena_{name} {value}\n"
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_lifecycle() {
        let m = Metrics::new();
        m.start_run();
        assert_eq!(m.runs_active.load(Ordering::Relaxed), 1);
        assert_eq!(m.runs_total.load(Ordering::Relaxed), 1);

        m.finish_run(RunOutcome::Completed, 5000);
        assert_eq!(m.runs_active.load(Ordering::Relaxed), 0);
        assert_eq!(m.runs_completed.load(Ordering::Relaxed), 1);
        assert_eq!(m.runs_failed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_cell() {
        let m = Metrics::new();
        m.record_cell(2, 1);
        m.record_cell(2, 0);
        assert_eq!(m.cells_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.agent_calls_total.load(Ordering::Relaxed), 4);
        assert_eq!(m.agent_results_degraded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let m = Metrics::new();
        m.start_run();
        m.finish_run(RunOutcome::Cancelled, 1234);
        let out = m.render_prometheus();
        assert!(out.contains("prompt_arena_runs_total 1"));
        assert!(out.contains("prompt_arena_runs_cancelled 1"));
        assert!(out.contains("# TYPE prompt_arena_runs_active gauge"));
        assert!(out.contains("prompt_arena_run_duration_ms_sum 1234"));
    }
}
