//! Stream job records and the state machine that guards them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::branch::{Branch, BranchSelector};
use super::process::ProcessHandle;
use crate::{Error, Result};

/// Opaque stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Scheduled,
    Downloading,
    Downloaded,
    Streaming,
    #[serde(rename = "Stream stopped")]
    Stopped,
    Error,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Downloading => "Downloading",
            Self::Downloaded => "Downloaded",
            Self::Streaming => "Streaming",
            Self::Stopped => "Stream stopped",
            Self::Error => "Error",
        }
    }

    /// `Stream stopped` and `Error` never change once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether moving forward from `self` to `next` follows the lifecycle chain.
    fn is_forward_step(&self, next: StreamState) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Downloading)
                | (Self::Downloading, Self::Downloaded)
                | (Self::Downloaded, Self::Streaming)
        )
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed.
    Applied,
    /// The job was already terminal; nothing changed.
    Unchanged,
}

/// Authoritative status record of one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub status: StreamState,
    /// Diagnostic message, set when the job enters `Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Source file name as shown to clients.
    pub file: String,
    pub destination: Vec<String>,
    /// Total requested duration in seconds.
    pub duration: u64,
    /// Stored remaining duration; recomputed live while streaming.
    pub remaining_duration: f64,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub redundant: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Local copy of the source, reclaimed on stop.
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

impl StreamStatus {
    /// Create a record in the initial state for a new job.
    pub fn new(
        file: impl Into<String>,
        destination: Vec<String>,
        duration: u64,
        redundant: bool,
        scheduled_start_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            status: if scheduled_start_time.is_some() {
                StreamState::Scheduled
            } else {
                StreamState::Downloading
            },
            message: None,
            file: file.into(),
            destination,
            duration,
            remaining_duration: duration as f64,
            scheduled_start_time,
            redundant,
            started_at: None,
            finished_at: None,
            local_path: None,
        }
    }

    /// Move to `next` if the lifecycle allows it from the current state.
    ///
    /// Terminal states absorb further stop/error requests without change, so a
    /// late timer or monitor cannot overwrite the outcome already recorded.
    pub fn transition(&mut self, next: StreamState, now: DateTime<Utc>) -> Result<Transition> {
        if self.status.is_terminal() {
            if next.is_terminal() {
                return Ok(Transition::Unchanged);
            }
            return Err(self.invalid(next));
        }

        match next {
            StreamState::Stopped => {
                self.status = StreamState::Stopped;
                self.remaining_duration = 0.0;
                self.finished_at = Some(now);
            }
            StreamState::Error => {
                self.status = StreamState::Error;
                self.finished_at = Some(now);
            }
            StreamState::Streaming if self.status.is_forward_step(next) => {
                self.status = StreamState::Streaming;
                self.started_at = Some(now);
            }
            _ if self.status.is_forward_step(next) => self.status = next,
            _ => return Err(self.invalid(next)),
        }

        Ok(Transition::Applied)
    }

    /// Enter `Error` with a diagnostic message unless the job already ended.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Transition {
        match self.transition(StreamState::Error, now) {
            Ok(Transition::Applied) => {
                self.message = Some(message.into());
                Transition::Applied
            }
            _ => Transition::Unchanged,
        }
    }

    /// Remaining seconds: live countdown while streaming, stored value otherwise.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> f64 {
        match (self.status, self.started_at) {
            (StreamState::Streaming, Some(started)) => {
                let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
                (self.duration as f64 - elapsed).max(0.0)
            }
            _ => self.remaining_duration,
        }
    }

    fn invalid(&self, next: StreamState) -> Error {
        Error::InvalidStateTransition {
            from: self.status.to_string(),
            to: next.to_string(),
        }
    }
}

/// Live processes of one stream.
#[derive(Debug)]
pub enum ProcessSet {
    /// One transmit process per destination, each reading the source itself.
    Flat(Vec<ProcessHandle>),
    /// Two branches fed by a single splitting source process.
    Redundant {
        primary: Branch,
        secondary: Branch,
        splitter: ProcessHandle,
    },
}

impl ProcessSet {
    /// Select a branch of a redundant set.
    pub fn branch_mut(&mut self, selector: BranchSelector) -> Result<&mut Branch> {
        match self {
            Self::Flat(_) => Err(Error::validation("Stream is not redundant")),
            Self::Redundant {
                primary, secondary, ..
            } => Ok(match selector {
                BranchSelector::Primary => primary,
                BranchSelector::Secondary => secondary,
            }),
        }
    }

    /// Every port reserved by this set.
    pub fn ports(&self) -> Vec<u16> {
        match self {
            Self::Flat(_) => Vec::new(),
            Self::Redundant {
                primary, secondary, ..
            } => [primary, secondary]
                .iter()
                .flat_map(|b| [b.remote_port(), b.local_port()])
                .collect(),
        }
    }

    /// Number of live handles in the set.
    pub fn process_count(&self) -> usize {
        match self {
            Self::Flat(handles) => handles.len(),
            Self::Redundant {
                primary, secondary, ..
            } => 1 + primary.process_count() + secondary.process_count(),
        }
    }

    /// Consume the set, yielding every live handle for termination.
    pub fn into_handles(self) -> Vec<ProcessHandle> {
        match self {
            Self::Flat(handles) => handles,
            Self::Redundant {
                primary,
                secondary,
                splitter,
            } => {
                let mut handles = primary.into_handles();
                handles.extend(secondary.into_handles());
                handles.push(splitter);
                handles
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_status() -> StreamStatus {
        let mut status = StreamStatus::new("clip.mp4", vec!["srt://a:1".into()], 60, false, None);
        let now = Utc::now();
        status.transition(StreamState::Downloaded, now).unwrap();
        status.transition(StreamState::Streaming, now).unwrap();
        status
    }

    #[test]
    fn test_initial_state_depends_on_schedule() {
        let immediate = StreamStatus::new("a.mp4", vec![], 10, false, None);
        assert_eq!(immediate.status, StreamState::Downloading);

        let delayed = StreamStatus::new("a.mp4", vec![], 10, false, Some(Utc::now()));
        assert_eq!(delayed.status, StreamState::Scheduled);
    }

    #[test]
    fn test_forward_chain() {
        let mut status = StreamStatus::new("a.mp4", vec![], 10, false, Some(Utc::now()));
        let now = Utc::now();
        for next in [
            StreamState::Downloading,
            StreamState::Downloaded,
            StreamState::Streaming,
        ] {
            assert_eq!(status.transition(next, now).unwrap(), Transition::Applied);
        }
        assert_eq!(status.started_at, Some(now));
    }

    #[test]
    fn test_skipping_steps_is_rejected() {
        let mut status = StreamStatus::new("a.mp4", vec![], 10, false, None);
        let err = status
            .transition(StreamState::Streaming, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(status.status, StreamState::Downloading);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut status = streaming_status();
        let now = Utc::now();
        assert_eq!(
            status.transition(StreamState::Stopped, now).unwrap(),
            Transition::Applied
        );
        assert_eq!(
            status.transition(StreamState::Stopped, now).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(status.remaining_duration, 0.0);
    }

    #[test]
    fn test_error_survives_later_stop() {
        let mut status = streaming_status();
        let now = Utc::now();
        assert_eq!(status.fail("Invalid data found", now), Transition::Applied);
        assert_eq!(
            status.transition(StreamState::Stopped, now).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(status.status, StreamState::Error);
        assert_eq!(status.message.as_deref(), Some("Invalid data found"));
    }

    #[test]
    fn test_second_failure_keeps_first_message() {
        let mut status = streaming_status();
        status.fail("first", Utc::now());
        assert_eq!(status.fail("second", Utc::now()), Transition::Unchanged);
        assert_eq!(status.message.as_deref(), Some("first"));
    }

    #[test]
    fn test_failure_after_stop_is_ignored() {
        let mut status = streaming_status();
        status.transition(StreamState::Stopped, Utc::now()).unwrap();
        assert_eq!(status.fail("late", Utc::now()), Transition::Unchanged);
        assert_eq!(status.status, StreamState::Stopped);
        assert!(status.message.is_none());
    }

    #[test]
    fn test_terminal_state_cannot_resume() {
        let mut status = StreamStatus::new("a.mp4", vec![], 10, false, None);
        status.transition(StreamState::Stopped, Utc::now()).unwrap();
        assert!(status
            .transition(StreamState::Downloaded, Utc::now())
            .is_err());
    }

    #[test]
    fn test_remaining_duration() {
        let mut status = streaming_status();
        let started = status.started_at.unwrap();
        let later = started + chrono::Duration::seconds(15);
        assert!((status.remaining_at(later) - 45.0).abs() < 1e-9);

        let much_later = started + chrono::Duration::seconds(600);
        assert_eq!(status.remaining_at(much_later), 0.0);

        status.transition(StreamState::Stopped, later).unwrap();
        assert_eq!(status.remaining_at(later), 0.0);
    }

    #[test]
    fn test_state_serializes_to_display_strings() {
        assert_eq!(
            serde_json::to_string(&StreamState::Stopped).unwrap(),
            "\"Stream stopped\""
        );
        assert_eq!(
            serde_json::to_string(&StreamState::Streaming).unwrap(),
            "\"Streaming\""
        );
    }
}
