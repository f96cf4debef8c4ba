use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::error::PipelineError;
use crate::evaluation::pipeline::RunSummary;
use crate::evaluation::progress::RunStatus;

const REAP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct RunState {
    status: RunStatus,
    progress: f64,
    summary: Option<RunSummary>,
    error: Option<String>,
    error_code: Option<&'static str>,
    finished_at: Option<DateTime<Utc>>,
}

/// One evaluation run tracked by the service.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub meta_prompt_id: u64,
    pub created_at: DateTime<Utc>,
    state: Mutex<RunState>,
    cancel: watch::Sender<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub id: String,
    pub meta_prompt_id: u64,
    pub status: RunStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
}

impl Run {
    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Returns false if the run had already finished.
    pub fn request_cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.cancel.send_replace(true);
        true
    }

    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if state.status == RunStatus::Pending {
            state.status = RunStatus::Running;
        }
    }

    /// Progress never moves backwards.
    pub fn set_progress(&self, percent: f64) {
        let mut state = self.state.lock();
        if percent > state.progress {
            state.progress = percent.min(100.0);
        }
    }

    pub fn complete(&self, summary: RunSummary) {
        let mut state = self.state.lock();
        state.status = RunStatus::Completed;
        state.progress = 100.0;
        state.summary = Some(summary);
        state.finished_at = Some(Utc::now());
    }

    pub fn fail(&self, err: &PipelineError) {
        let mut state = self.state.lock();
        state.status = match err {
            PipelineError::Cancelled { .. } => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        state.error = Some(err.to_string());
        state.error_code = Some(err.code());
        state.finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let state = self.state.lock().clone();
        RunSnapshot {
            id: self.id.clone(),
            meta_prompt_id: self.meta_prompt_id,
            status: state.status,
            progress: state.progress,
            created_at: self.created_at,
            finished_at: state.finished_at,
            summary: state.summary,
            error: state.error,
            error_code: state.error_code,
        }
    }
}

pub struct RunManager {
    runs: DashMap<String, Arc<Run>>,
    ttl_secs: u64,
    start_lock: Mutex<()>,
}

impl RunManager {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            runs: DashMap::new(),
            ttl_secs,
            start_lock: Mutex::new(()),
        }
    }

    /// Register a new run unless one is already active for the meta prompt,
    /// in which case that run is returned as the error.
    pub fn try_create(&self, meta_prompt_id: u64) -> Result<Arc<Run>, Arc<Run>> {
        let _guard = self.start_lock.lock();
        if let Some(active) = self.active_for(meta_prompt_id) {
            return Err(active);
        }
        Ok(self.create(meta_prompt_id))
    }

    fn create(&self, meta_prompt_id: u64) -> Arc<Run> {
        let id = uuid::Uuid::new_v4().to_string();
        let (cancel_tx, _) = watch::channel(false);

        let run = Arc::new(Run {
            id: id.clone(),
            meta_prompt_id,
            created_at: Utc::now(),
            state: Mutex::new(RunState {
                status: RunStatus::Pending,
                progress: 0.0,
                summary: None,
                error: None,
                error_code: None,
                finished_at: None,
            }),
            cancel: cancel_tx,
        });

        self.runs.insert(id, run.clone());
        run
    }

    pub fn get(&self, id: &str) -> Option<Arc<Run>> {
        self.runs.get(id).map(|r| r.value().clone())
    }

    pub fn active_for(&self, meta_prompt_id: u64) -> Option<Arc<Run>> {
        self.runs
            .iter()
            .find(|r| {
                r.value().meta_prompt_id == meta_prompt_id && !r.value().status().is_terminal()
            })
            .map(|r| r.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| !r.value().status().is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<RunSnapshot> {
        let mut all: Vec<RunSnapshot> = self.runs.iter().map(|r| r.value().snapshot()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Drop runs older than the TTL, cancelling any still in flight.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .runs
            .iter()
            .filter(|r| (now - r.value().created_at).num_seconds() > self.ttl_secs as i64)
            .map(|r| r.key().clone())
            .collect();

        let mut reaped = 0;
        for id in expired {
            if let Some((_, run)) = self.runs.remove(&id) {
                run.request_cancel();
                info!(run_id = %id, "Reaped expired run");
                reaped += 1;
            }
        }
        reaped
    }

    pub async fn reaper_loop(&self) {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(REAP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            self.reap_expired(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RunSummary {
        RunSummary {
            meta_prompt_id: 1,
            evaluators: vec!["A".into()],
            variations: 1,
            test_cases: 1,
            criteria: 1,
            raw_rows: 1,
            degraded_rows: 0,
            results: 1,
            dropped_results: 0,
            duration_ms: 3,
        }
    }

    #[test]
    fn test_run_lifecycle() {
        let mgr = RunManager::new(3600);
        let run = mgr.create(1);
        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(mgr.active_count(), 1);

        run.mark_running();
        run.set_progress(40.0);
        run.set_progress(20.0);
        assert_eq!(run.snapshot().progress, 40.0);

        run.complete(summary());
        let snap = mgr.get(&run.id).unwrap().snapshot();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.progress, 100.0);
        assert!(snap.finished_at.is_some());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_fail_records_code() {
        let mgr = RunManager::new(3600);
        let run = mgr.create(1);
        run.fail(&PipelineError::NoEvaluatorsAvailable);
        let snap = run.snapshot();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("no evaluators available"));
        assert_eq!(snap.error_code, Some("no_evaluators"));
    }

    #[test]
    fn test_cancel_signal() {
        let mgr = RunManager::new(3600);
        let run = mgr.create(1);
        let rx = run.cancel_receiver();
        assert!(!*rx.borrow());

        assert!(run.request_cancel());
        assert!(*rx.borrow());

        run.fail(&PipelineError::Cancelled { completed_cells: 2 });
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert!(!run.request_cancel());
    }

    #[test]
    fn test_reap_expired() {
        let mgr = RunManager::new(60);
        let run = mgr.create(1);
        let rx = run.cancel_receiver();

        assert_eq!(mgr.reap_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(mgr.reap_expired(later), 1);
        assert!(mgr.get(&run.id).is_none());
        assert!(*rx.borrow());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_one_active_run_per_meta_prompt() {
        let mgr = RunManager::new(3600);
        let first = mgr.try_create(1).unwrap();
        let conflict = mgr.try_create(1).err().unwrap();
        assert_eq!(conflict.id, first.id);

        assert!(mgr.try_create(2).is_ok());
        assert_eq!(mgr.active_count(), 2);

        first.complete(summary());
        assert!(mgr.active_for(1).is_none());
        let second = mgr.try_create(1).unwrap();
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_list_newest_first() {
        let mgr = RunManager::new(3600);
        let first = mgr.create(1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = mgr.create(2);
        let listed = mgr.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }
}
