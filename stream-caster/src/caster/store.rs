//! Stream repository for per-stream shared state.
//!
//! Status records, process sets and bandwidth tables are only reachable
//! through [`StreamRepository`]; no caller ever holds a raw map.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::job::{ProcessSet, StreamId, StreamState, StreamStatus, Transition};
use crate::{Error, Result};

/// Per-destination throughput in megabits per second.
pub type BandwidthTable = HashMap<String, f64>;

/// Stream repository trait for synchronized access to per-stream state.
pub trait StreamRepository: Send + Sync {
    /// Insert a new status record unless `max_active` non-terminal jobs already exist.
    fn admit(&self, id: StreamId, status: StreamStatus, max_active: usize) -> Result<()>;

    /// Snapshot of one status record.
    fn status(&self, id: &StreamId) -> Option<StreamStatus>;

    /// Snapshot of every status record.
    fn statuses(&self) -> Vec<(StreamId, StreamStatus)>;

    /// Number of jobs in a non-terminal state.
    fn active_count(&self) -> usize;

    /// Apply a lifecycle transition against the current state.
    fn transition(&self, id: &StreamId, next: StreamState) -> Result<Transition>;

    /// Enter `Error` with a message unless the job already ended.
    fn fail(&self, id: &StreamId, message: &str) -> Result<Transition>;

    /// Mutate descriptive fields of a status record (file name, local path).
    fn update_details(&self, id: &StreamId, update: &mut dyn FnMut(&mut StreamStatus))
    -> Result<()>;

    /// Move the job to `Streaming` and store its processes in one step.
    ///
    /// When the job can no longer stream (stopped or failed meanwhile) the
    /// set is handed back so the caller can terminate it.
    fn attach_processes(
        &self,
        id: &StreamId,
        processes: ProcessSet,
    ) -> std::result::Result<(), (Error, ProcessSet)>;

    /// Move the job to `Stream stopped` and detach its processes in one step.
    fn begin_stop(&self, id: &StreamId) -> Result<(Transition, Option<ProcessSet>)>;

    /// Detach the processes of a job that already ended without a stop.
    fn take_processes(&self, id: &StreamId) -> Option<ProcessSet>;

    /// Run `f` against the live process set of a job.
    fn with_processes(
        &self,
        id: &StreamId,
        f: &mut dyn FnMut(&mut ProcessSet) -> Result<()>,
    ) -> Result<()>;

    /// Replace the throughput of every listed destination.
    fn record_bandwidth(&self, id: &StreamId, destinations: &[String], mbps: f64);

    /// Snapshot of the bandwidth table, `None` before the first observation.
    fn bandwidth(&self, id: &StreamId) -> Option<BandwidthTable>;

    /// Drop terminal records finished longer than `retention` ago.
    /// Returns the number of records removed.
    fn purge_finished(&self, retention: Duration, now: DateTime<Utc>) -> usize;
}

/// In-memory implementation of [`StreamRepository`].
///
/// Lock order is always `statuses` before `processes`.
#[derive(Default)]
pub struct InMemoryStreamRepository {
    statuses: RwLock<HashMap<StreamId, StreamStatus>>,
    processes: DashMap<StreamId, ProcessSet>,
    bandwidth: DashMap<StreamId, BandwidthTable>,
}

impl InMemoryStreamRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_status<T>(
        &self,
        id: &StreamId,
        f: impl FnOnce(&mut StreamStatus) -> Result<T>,
    ) -> Result<T> {
        let mut statuses = self.statuses.write();
        let status = statuses
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Stream", id.as_str()))?;
        f(status)
    }
}

impl StreamRepository for InMemoryStreamRepository {
    fn admit(&self, id: StreamId, status: StreamStatus, max_active: usize) -> Result<()> {
        let mut statuses = self.statuses.write();
        let active = statuses
            .values()
            .filter(|s| !s.status.is_terminal())
            .count();
        if active >= max_active {
            return Err(Error::AdmissionRejected { max: max_active });
        }
        if statuses.contains_key(&id) {
            return Err(Error::validation(format!("Stream {id} already exists")));
        }

        info!(stream_id = %id, state = %status.status, "Admitted stream");
        statuses.insert(id, status);
        Ok(())
    }

    fn status(&self, id: &StreamId) -> Option<StreamStatus> {
        self.statuses.read().get(id).cloned()
    }

    fn statuses(&self) -> Vec<(StreamId, StreamStatus)> {
        self.statuses
            .read()
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect()
    }

    fn active_count(&self) -> usize {
        self.statuses
            .read()
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }

    fn transition(&self, id: &StreamId, next: StreamState) -> Result<Transition> {
        self.with_status(id, |status| {
            let outcome = status.transition(next, Utc::now())?;
            if outcome == Transition::Applied {
                info!(stream_id = %id, state = %next, "Stream state changed");
            }
            Ok(outcome)
        })
    }

    fn fail(&self, id: &StreamId, message: &str) -> Result<Transition> {
        self.with_status(id, |status| {
            let outcome = status.fail(message, Utc::now());
            if outcome == Transition::Applied {
                info!(stream_id = %id, state = %StreamState::Error, "Stream state changed");
            }
            Ok(outcome)
        })
    }

    fn update_details(
        &self,
        id: &StreamId,
        update: &mut dyn FnMut(&mut StreamStatus),
    ) -> Result<()> {
        self.with_status(id, |status| {
            update(status);
            Ok(())
        })
    }

    fn attach_processes(
        &self,
        id: &StreamId,
        processes: ProcessSet,
    ) -> std::result::Result<(), (Error, ProcessSet)> {
        let mut statuses = self.statuses.write();
        let Some(status) = statuses.get_mut(id) else {
            return Err((Error::not_found("Stream", id.as_str()), processes));
        };
        if let Err(e) = status.transition(StreamState::Streaming, Utc::now()) {
            return Err((e, processes));
        }

        info!(
            stream_id = %id,
            state = %StreamState::Streaming,
            processes = processes.process_count(),
            "Stream state changed"
        );
        self.processes.insert(id.clone(), processes);
        Ok(())
    }

    fn begin_stop(&self, id: &StreamId) -> Result<(Transition, Option<ProcessSet>)> {
        let mut statuses = self.statuses.write();
        let status = statuses
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Stream", id.as_str()))?;

        let outcome = status.transition(StreamState::Stopped, Utc::now())?;
        if outcome == Transition::Applied {
            info!(stream_id = %id, state = %StreamState::Stopped, "Stream state changed");
        }
        let processes = self.processes.remove(id).map(|(_, set)| set);
        Ok((outcome, processes))
    }

    fn take_processes(&self, id: &StreamId) -> Option<ProcessSet> {
        self.processes.remove(id).map(|(_, set)| set)
    }

    fn with_processes(
        &self,
        id: &StreamId,
        f: &mut dyn FnMut(&mut ProcessSet) -> Result<()>,
    ) -> Result<()> {
        let mut entry = self
            .processes
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Process set", id.as_str()))?;
        f(entry.value_mut())
    }

    fn record_bandwidth(&self, id: &StreamId, destinations: &[String], mbps: f64) {
        let mut table = self.bandwidth.entry(id.clone()).or_default();
        for destination in destinations {
            table.insert(destination.clone(), mbps);
        }
    }

    fn bandwidth(&self, id: &StreamId) -> Option<BandwidthTable> {
        self.bandwidth.get(id).map(|table| table.value().clone())
    }

    fn purge_finished(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };

        let mut statuses = self.statuses.write();
        let expired: Vec<StreamId> = statuses
            .iter()
            .filter(|(_, s)| s.status.is_terminal())
            .filter(|(_, s)| s.finished_at.is_some_and(|at| now - at >= retention))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            statuses.remove(id);
            self.bandwidth.remove(id);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Purged finished stream records");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_status() -> StreamStatus {
        StreamStatus::new("clip.mp4", vec!["srt://a:1".into()], 30, false, None)
    }

    fn streaming(repo: &InMemoryStreamRepository, id: &StreamId) {
        repo.admit(id.clone(), new_status(), 10).unwrap();
        repo.transition(id, StreamState::Downloaded).unwrap();
        repo.attach_processes(id, ProcessSet::Flat(Vec::new()))
            .map_err(|(e, _)| e)
            .unwrap();
    }

    #[test]
    fn test_admission_limit() {
        let repo = InMemoryStreamRepository::new();
        repo.admit("a".into(), new_status(), 2).unwrap();
        repo.admit("b".into(), new_status(), 2).unwrap();

        let err = repo.admit("c".into(), new_status(), 2).unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { max: 2 }));

        repo.begin_stop(&"a".into()).unwrap();
        assert_eq!(repo.active_count(), 1);
        repo.admit("c".into(), new_status(), 2).unwrap();
    }

    #[test]
    fn test_concurrent_admission_respects_limit() {
        let repo = std::sync::Arc::new(InMemoryStreamRepository::new());
        let threads: Vec<_> = (0..16)
            .map(|i| {
                let repo = repo.clone();
                std::thread::spawn(move || repo.admit(format!("s{i}").into(), new_status(), 5).is_ok())
            })
            .collect();
        let admitted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(repo.active_count(), 5);
    }

    #[test]
    fn test_unknown_stream_is_not_found() {
        let repo = InMemoryStreamRepository::new();
        let id = StreamId::from("missing");
        assert!(matches!(repo.begin_stop(&id), Err(Error::NotFound { .. })));
        assert!(matches!(
            repo.transition(&id, StreamState::Stopped),
            Err(Error::NotFound { .. })
        ));
        assert!(repo.status(&id).is_none());
    }

    #[test]
    fn test_attach_moves_to_streaming() {
        let repo = InMemoryStreamRepository::new();
        let id = StreamId::from("s");
        streaming(&repo, &id);

        let status = repo.status(&id).unwrap();
        assert_eq!(status.status, StreamState::Streaming);
        assert!(status.started_at.is_some());
        assert!(repo.with_processes(&id, &mut |_| Ok(())).is_ok());
    }

    #[test]
    fn test_attach_after_stop_hands_processes_back() {
        let repo = InMemoryStreamRepository::new();
        let id = StreamId::from("s");
        repo.admit(id.clone(), new_status(), 10).unwrap();
        repo.transition(&id, StreamState::Downloaded).unwrap();
        repo.begin_stop(&id).unwrap();

        let (err, returned) = repo
            .attach_processes(&id, ProcessSet::Flat(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(returned.process_count(), 0);
        assert!(repo.take_processes(&id).is_none());
    }

    #[test]
    fn test_stop_detaches_processes_once() {
        let repo = InMemoryStreamRepository::new();
        let id = StreamId::from("s");
        streaming(&repo, &id);

        let (outcome, set) = repo.begin_stop(&id).unwrap();
        assert_eq!(outcome, Transition::Applied);
        assert!(set.is_some());

        let (outcome, set) = repo.begin_stop(&id).unwrap();
        assert_eq!(outcome, Transition::Unchanged);
        assert!(set.is_none());
        assert_eq!(repo.status(&id).unwrap().status, StreamState::Stopped);
    }

    #[test]
    fn test_stop_after_error_keeps_message() {
        let repo = InMemoryStreamRepository::new();
        let id = StreamId::from("s");
        streaming(&repo, &id);

        assert_eq!(repo.fail(&id, "Invalid argument").unwrap(), Transition::Applied);
        let (outcome, set) = repo.begin_stop(&id).unwrap();
        assert_eq!(outcome, Transition::Unchanged);
        assert!(set.is_some());

        let status = repo.status(&id).unwrap();
        assert_eq!(status.status, StreamState::Error);
        assert_eq!(status.message.as_deref(), Some("Invalid argument"));
    }

    #[test]
    fn test_bandwidth_is_replaced_not_accumulated() {
        let repo = InMemoryStreamRepository::new();
        let id = StreamId::from("s");
        assert!(repo.bandwidth(&id).is_none());

        let dests = vec!["srt://a:1".to_string()];
        repo.record_bandwidth(&id, &dests, 1.5);
        repo.record_bandwidth(&id, &dests, 2.25);
        assert_eq!(repo.bandwidth(&id).unwrap().get("srt://a:1"), Some(&2.25));
    }

    #[test]
    fn test_purge_removes_only_old_terminal_records() {
        let repo = InMemoryStreamRepository::new();
        streaming(&repo, &"old".into());
        streaming(&repo, &"live".into());
        repo.begin_stop(&"old".into()).unwrap();
        repo.record_bandwidth(&"old".into(), &["srt://a:1".to_string()], 1.0);

        let now = Utc::now();
        assert_eq!(repo.purge_finished(Duration::from_secs(60), now), 0);

        let later = now + chrono::Duration::seconds(120);
        assert_eq!(repo.purge_finished(Duration::from_secs(60), later), 1);
        assert!(repo.status(&"old".into()).is_none());
        assert!(repo.bandwidth(&"old".into()).is_none());
        assert!(repo.status(&"live".into()).is_some());
    }
}
