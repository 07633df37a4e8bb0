//! Stream lifecycle orchestration.
//!
//! [`StreamManager`] admits start requests, acquires the source, launches the
//! process topology, attaches monitors, arms the stop timer and tears every
//! process down again. All per-stream state lives in the injected
//! [`StreamRepository`]; the manager itself only holds collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::IndexedRandom;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::branch::{Branch, BranchSelector};
use super::command::CommandLine;
use super::job::{ProcessSet, StreamId, StreamState, StreamStatus, Transition};
use super::monitor::{self, MonitorRole};
use super::ports::PortAllocator;
use super::process::{ProcessHandle, terminate_all};
use super::scheduler::Scheduler;
use super::store::{BandwidthTable, StreamRepository};
use crate::config::CasterConfig;
use crate::storage::{HttpFetcher, MediaStorage, has_allowed_extension};
use crate::{Error, Result};

/// Interval between retention sweeps.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Where a stream's source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    /// Object in the media store.
    File(String),
    /// Remote file downloaded over HTTP.
    Url(String),
    /// Uniformly random object from the media store.
    Any,
}

impl std::fmt::Display for SourceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(name) => f.write_str(name),
            Self::Url(url) => f.write_str(url),
            Self::Any => f.write_str("any available file"),
        }
    }
}

/// Request to start a new stream.
#[derive(Debug, Clone)]
pub struct StartStreamRequest {
    pub source: SourceSelector,
    /// Transmission time in seconds once streaming.
    pub duration_secs: u64,
    pub destinations: Vec<String>,
    /// Delay before acquisition starts.
    pub start_offset_secs: u64,
    pub redundant: bool,
}

impl StartStreamRequest {
    fn validate(&self) -> Result<()> {
        if self.duration_secs == 0 {
            return Err(Error::validation("Duration must be greater than zero"));
        }
        if self.destinations.is_empty() {
            return Err(Error::validation("At least one destination is required"));
        }
        if self.destinations.iter().any(|d| d.trim().is_empty()) {
            return Err(Error::validation("Destinations must not be empty"));
        }
        if self.redundant && self.destinations.len() != 2 {
            return Err(Error::validation(
                "Redundant streams require exactly two destinations",
            ));
        }
        if checked_after(Utc::now(), self.start_offset_secs).is_none() {
            return Err(Error::validation("start_offset out of range"));
        }
        match &self.source {
            SourceSelector::File(name) | SourceSelector::Url(name) if name.trim().is_empty() => {
                Err(Error::validation("Source must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// `now + secs`, or `None` when the instant is not representable.
fn checked_after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::try_seconds(i64::try_from(secs).ok()?)?;
    now.checked_add_signed(delta)
}

/// Accepted start request.
#[derive(Debug, Clone, Serialize)]
pub struct StartStreamResponse {
    pub stream_id: StreamId,
    pub file: String,
    pub destination: Vec<String>,
    pub redundant: bool,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub message: String,
}

/// Entry of the active stream listing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveStreamInfo {
    pub stream_id: StreamId,
    pub status: StreamState,
    pub file: String,
    pub destination: Vec<String>,
    pub remaining_duration: f64,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub redundant: bool,
}

/// State of one branch after a stop or restart.
#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub stream_id: StreamId,
    pub branch: BranchSelector,
    pub destination: String,
    pub remote_port: u16,
    pub active: bool,
    pub remote_pid: Option<u32>,
    pub relay_pid: Option<u32>,
}

impl BranchReport {
    fn new(stream_id: &StreamId, selector: BranchSelector, branch: &Branch) -> Self {
        Self {
            stream_id: stream_id.clone(),
            branch: selector,
            destination: branch.destination().to_string(),
            remote_port: branch.remote_port(),
            active: branch.is_active(),
            remote_pid: branch.remote_pid(),
            relay_pid: branch.relay_pid(),
        }
    }
}

/// Stored upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub filename: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything a background job needs once admitted.
#[derive(Debug, Clone)]
struct JobPlan {
    id: StreamId,
    source: SourceSelector,
    destinations: Vec<String>,
    duration: Duration,
    redundant: bool,
}

/// Stream lifecycle façade.
pub struct StreamManager {
    config: CasterConfig,
    repository: Arc<dyn StreamRepository>,
    storage: Arc<dyn MediaStorage>,
    fetcher: HttpFetcher,
    ports: PortAllocator,
    scheduler: Scheduler,
    file_expiry: DashMap<String, DateTime<Utc>>,
}

impl StreamManager {
    pub fn new(
        config: CasterConfig,
        repository: Arc<dyn StreamRepository>,
        storage: Arc<dyn MediaStorage>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            repository,
            storage,
            fetcher: HttpFetcher::new()?,
            ports: PortAllocator::new(),
            scheduler: Scheduler::new(),
            file_expiry: DashMap::new(),
        })
    }

    pub fn config(&self) -> &CasterConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Admit a stream and start it now or after its offset.
    ///
    /// Returns once the job is admitted; acquisition and launch run in the
    /// background and report through the status record.
    pub async fn start_stream(
        self: &Arc<Self>,
        request: StartStreamRequest,
    ) -> Result<StartStreamResponse> {
        request.validate()?;

        let max = self.config.max_streams;
        if self.repository.active_count() >= max {
            warn!(max, "Maximum number of active streams reached");
            return Err(Error::AdmissionRejected { max });
        }

        let source = match request.source {
            SourceSelector::Any => SourceSelector::File(self.pick_any_media().await?),
            other => other,
        };
        let file = source.to_string();

        if let Some(retention) = self.config.status_retention {
            self.repository.purge_finished(retention, Utc::now());
        }

        let id = StreamId::generate();
        let offset = Duration::from_secs(request.start_offset_secs);
        let scheduled_start_time = if offset.is_zero() {
            None
        } else {
            Some(
                checked_after(Utc::now(), request.start_offset_secs)
                    .ok_or_else(|| Error::validation("start_offset out of range"))?,
            )
        };

        let status = StreamStatus::new(
            file.clone(),
            request.destinations.clone(),
            request.duration_secs,
            request.redundant,
            scheduled_start_time,
        );
        self.repository.admit(id.clone(), status, max)?;

        let plan = JobPlan {
            id: id.clone(),
            source,
            destinations: request.destinations.clone(),
            duration: Duration::from_secs(request.duration_secs),
            redundant: request.redundant,
        };

        let manager = Arc::clone(self);
        let message = if offset.is_zero() {
            tokio::spawn(async move { manager.run_job(plan).await });
            "Stream is downloading and will start shortly.".to_string()
        } else {
            info!(stream_id = %id, delay_secs = offset.as_secs(), "Scheduling stream start");
            self.scheduler
                .schedule(format!("start:{id}"), offset, move || async move {
                    manager.run_job(plan).await
                });
            format!("Stream will start in {} seconds.", offset.as_secs())
        };

        Ok(StartStreamResponse {
            stream_id: id,
            file,
            destination: request.destinations,
            redundant: request.redundant,
            scheduled_start_time,
            message,
        })
    }

    async fn pick_any_media(&self) -> Result<String> {
        let files = self.storage.list().await?;
        files
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| Error::validation("No media files available."))
    }

    /// Acquire, launch and arm the stop timer of an admitted job.
    async fn run_job(self: Arc<Self>, plan: JobPlan) {
        let id = &plan.id;

        match self.repository.status(id).map(|s| s.status) {
            None => return,
            Some(state) if state.is_terminal() => {
                info!(stream_id = %id, state = %state, "Stream ended before it started");
                return;
            }
            Some(StreamState::Scheduled) => {
                if let Err(e) = self.repository.transition(id, StreamState::Downloading) {
                    debug!(stream_id = %id, error = %e, "Scheduled start skipped");
                    return;
                }
            }
            Some(_) => {}
        }

        let path = match self.acquire(&plan.source).await {
            Ok(path) => path,
            Err(e) => {
                let message = format!("Failed to download {}: {}", plan.source, e);
                error!(stream_id = %id, "{}", message);
                if let Err(e) = self.repository.fail(id, &message) {
                    debug!(stream_id = %id, error = %e, "Failure not recorded");
                }
                return;
            }
        };

        // Downloads keep their random-prefixed name so clients can find the copy.
        let downloaded_name = match &plan.source {
            SourceSelector::Url(_) => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string),
            _ => None,
        };
        let mut local_path = Some(path.clone());
        if let Err(e) = self.repository.update_details(id, &mut |status| {
            status.local_path = local_path.take();
            if let Some(name) = downloaded_name.clone() {
                status.file = name;
            }
        }) {
            debug!(stream_id = %id, error = %e, "Source details not recorded");
        }

        if let Err(e) = self.repository.transition(id, StreamState::Downloaded) {
            info!(stream_id = %id, error = %e, "Stream ended during acquisition, discarding source");
            self.reclaim_source(id, Some(path)).await;
            return;
        }

        let launched = if plan.redundant {
            self.launch_redundant(id, &path, &plan.destinations).await
        } else {
            self.launch_flat(id, &path, &plan.destinations).await
        };

        let processes = match launched {
            Ok(processes) => processes,
            Err(e) => {
                let message = format!("Failed to start stream: {e}");
                error!(stream_id = %id, "{}", message);
                if let Err(e) = self.repository.fail(id, &message) {
                    debug!(stream_id = %id, error = %e, "Failure not recorded");
                }
                self.reclaim_source(id, None).await;
                return;
            }
        };

        if let Err((e, processes)) = self.repository.attach_processes(id, processes) {
            info!(stream_id = %id, error = %e, "Stream ended during launch, terminating processes");
            self.release(processes).await;
            self.reclaim_source(id, None).await;
            return;
        }

        let manager = Arc::clone(&self);
        let stop_id = id.clone();
        self.scheduler
            .schedule(format!("stop:{id}"), plan.duration, move || async move {
                info!(stream_id = %stop_id, "Stream duration elapsed");
                if let Err(e) = manager.stop_stream(&stop_id).await {
                    debug!(stream_id = %stop_id, error = %e, "Timed stop skipped");
                }
            });
    }

    async fn acquire(&self, source: &SourceSelector) -> Result<PathBuf> {
        match source {
            SourceSelector::File(name) => self.storage.fetch(name, &self.config.temp_dir).await,
            SourceSelector::Url(url) => self.fetcher.fetch(url, &self.config.temp_dir).await,
            SourceSelector::Any => Err(Error::validation("Source was not resolved")),
        }
    }

    /// One transmit process per destination, each reading the source itself.
    async fn launch_flat(
        self: &Arc<Self>,
        id: &StreamId,
        source: &Path,
        destinations: &[String],
    ) -> Result<ProcessSet> {
        let mut handles = Vec::with_capacity(destinations.len());
        for (index, destination) in destinations.iter().enumerate() {
            let command = CommandLine::transmit(&self.config.ffmpeg_path, source, destination);
            match ProcessHandle::spawn(format!("{id}/transmit-{index}"), command) {
                Ok(mut handle) => {
                    self.attach_monitor(
                        id,
                        &mut handle,
                        MonitorRole::transmit(vec![destination.clone()]),
                    );
                    handles.push(handle);
                }
                Err(e) => {
                    terminate_all(handles, self.config.terminate_grace).await;
                    return Err(e);
                }
            }
        }
        Ok(ProcessSet::Flat(handles))
    }

    /// Splitter feeding two relay branches on freshly allocated ports.
    async fn launch_redundant(
        self: &Arc<Self>,
        id: &StreamId,
        source: &Path,
        destinations: &[String],
    ) -> Result<ProcessSet> {
        let [primary_destination, secondary_destination] = destinations else {
            return Err(Error::validation(
                "Redundant streams require exactly two destinations",
            ));
        };

        let ports = self.ports.allocate(4)?;
        let grace = self.config.terminate_grace;

        let primary = match self
            .spawn_branch(id, BranchSelector::Primary, primary_destination, ports[0], ports[1])
            .await
        {
            Ok(branch) => branch,
            Err(e) => {
                self.ports.release(&ports);
                return Err(e);
            }
        };

        let secondary = match self
            .spawn_branch(id, BranchSelector::Secondary, secondary_destination, ports[2], ports[3])
            .await
        {
            Ok(branch) => branch,
            Err(e) => {
                terminate_all(primary.into_handles(), grace).await;
                self.ports.release(&ports);
                return Err(e);
            }
        };

        let splitter_command = CommandLine::splitter(
            &self.config.ffmpeg_path,
            source,
            &[primary.local_port(), secondary.local_port()],
        );
        let splitter = match ProcessHandle::spawn(format!("{id}/splitter"), splitter_command) {
            Ok(mut handle) => {
                self.attach_monitor(id, &mut handle, MonitorRole::transmit(destinations.to_vec()));
                handle
            }
            Err(e) => {
                let mut handles = primary.into_handles();
                handles.extend(secondary.into_handles());
                terminate_all(handles, grace).await;
                self.ports.release(&ports);
                return Err(e);
            }
        };

        Ok(ProcessSet::Redundant {
            primary,
            secondary,
            splitter,
        })
    }

    /// Remote leg first so the local relay finds a listener to call.
    async fn spawn_branch(
        self: &Arc<Self>,
        id: &StreamId,
        selector: BranchSelector,
        destination: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Branch> {
        let remote = self.spawn_remote_leg(id, selector, remote_port, destination)?;

        let relay_command = CommandLine::local_relay(&self.config.relay_path, local_port, remote_port);
        let relay = match ProcessHandle::spawn(format!("{id}/{selector}-relay"), relay_command) {
            Ok(mut handle) => {
                self.attach_monitor(id, &mut handle, MonitorRole::relay());
                handle
            }
            Err(e) => {
                remote.terminate(self.config.terminate_grace).await;
                return Err(e);
            }
        };

        Ok(Branch::new(destination, remote_port, local_port, remote, relay))
    }

    fn spawn_remote_leg(
        self: &Arc<Self>,
        id: &StreamId,
        selector: BranchSelector,
        remote_port: u16,
        destination: &str,
    ) -> Result<ProcessHandle> {
        let command = CommandLine::remote_relay(&self.config.relay_path, remote_port, destination);
        let mut handle = ProcessHandle::spawn(format!("{id}/{selector}-remote"), command)?;
        self.attach_monitor(id, &mut handle, MonitorRole::relay());
        Ok(handle)
    }

    fn attach_monitor(self: &Arc<Self>, id: &StreamId, handle: &mut ProcessHandle, role: MonitorRole) {
        let Some(stderr) = handle.take_stderr() else {
            return;
        };

        let manager = Arc::clone(self);
        let id = id.clone();
        let label = handle.label().to_string();
        tokio::spawn(async move {
            let failure =
                monitor::watch(stderr, &id, &label, &role, manager.repository.as_ref()).await;
            if let Some(message) = failure {
                manager.handle_process_failure(&id, &message).await;
            }
        });
    }

    async fn handle_process_failure(&self, id: &StreamId, message: &str) {
        match self.repository.fail(id, message) {
            Ok(Transition::Applied) => {
                error!(stream_id = %id, "Stream failed, stopping all processes");
                if let Err(e) = self.stop_stream(id).await {
                    warn!(stream_id = %id, error = %e, "Failed to stop failed stream");
                }
            }
            Ok(Transition::Unchanged) => {
                debug!(stream_id = %id, "Ignoring process failure of finished stream");
            }
            Err(e) => debug!(stream_id = %id, error = %e, "Ignoring process failure"),
        }
    }

    /// Stop a stream, terminating every process and reclaiming its source.
    ///
    /// Stopping a finished stream is a no-op; a stream already in `Error`
    /// keeps its state and message.
    pub async fn stop_stream(&self, id: &StreamId) -> Result<Transition> {
        let (outcome, processes) = self.repository.begin_stop(id)?;

        if let Some(processes) = processes {
            info!(stream_id = %id, processes = processes.process_count(), "Terminating stream processes");
            self.release(processes).await;
        }
        self.reclaim_source(id, None).await;

        Ok(outcome)
    }

    async fn release(&self, processes: ProcessSet) {
        let ports = processes.ports();
        terminate_all(processes.into_handles(), self.config.terminate_grace).await;
        self.ports.release(&ports);
    }

    /// Remove the local source copy when it lives under the temp directory.
    async fn reclaim_source(&self, id: &StreamId, path: Option<PathBuf>) {
        let mut path = path;
        if path.is_none() {
            if let Err(e) = self
                .repository
                .update_details(id, &mut |status| path = status.local_path.take())
            {
                debug!(stream_id = %id, error = %e, "No source copy recorded");
            }
        }
        let Some(path) = path else {
            return;
        };

        if !path.starts_with(&self.config.temp_dir) {
            debug!(stream_id = %id, path = %path.display(), "Source outside temp dir, keeping");
            return;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(stream_id = %id, path = %path.display(), "Removed source copy"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(stream_id = %id, path = %path.display(), error = %e, "Failed to remove source copy"),
        }
    }

    fn require_redundant(&self, id: &StreamId) -> Result<()> {
        let status = self
            .repository
            .status(id)
            .ok_or_else(|| Error::not_found("Stream", id.as_str()))?;
        if !status.redundant {
            return Err(Error::validation("Stream is not redundant"));
        }
        Ok(())
    }

    /// Terminate one branch's remote leg; the relay and other branch keep running.
    pub async fn stop_branch(&self, id: &StreamId, selector: BranchSelector) -> Result<BranchReport> {
        self.require_redundant(id)?;

        let mut taken = None;
        let mut report = None;
        self.repository.with_processes(id, &mut |processes| {
            let branch = processes.branch_mut(selector)?;
            taken = branch.take_remote();
            report = Some(BranchReport::new(id, selector, branch));
            Ok(())
        })?;

        match taken {
            Some(remote) => {
                info!(stream_id = %id, branch = %selector, "Stopping branch");
                remote.terminate(self.config.terminate_grace).await;
            }
            None => debug!(stream_id = %id, branch = %selector, "Branch already stopped"),
        }

        report.ok_or_else(|| Error::not_found("Branch", selector.as_str()))
    }

    /// Respawn one branch's remote leg on its original port.
    ///
    /// A remote leg that is still running is terminated first so the port is
    /// free for the new listener.
    pub async fn restart_branch(
        self: &Arc<Self>,
        id: &StreamId,
        selector: BranchSelector,
    ) -> Result<BranchReport> {
        self.require_redundant(id)?;
        let grace = self.config.terminate_grace;

        let mut previous = None;
        let mut target = None;
        self.repository.with_processes(id, &mut |processes| {
            let branch = processes.branch_mut(selector)?;
            previous = branch.take_remote();
            target = Some((branch.remote_port(), branch.destination().to_string()));
            Ok(())
        })?;

        if let Some(remote) = previous {
            info!(stream_id = %id, branch = %selector, "Terminating running branch before restart");
            remote.terminate(grace).await;
        }

        let (remote_port, destination) =
            target.ok_or_else(|| Error::not_found("Branch", selector.as_str()))?;
        let handle = self.spawn_remote_leg(id, selector, remote_port, &destination)?;

        let mut pending = Some(handle);
        let mut displaced = None;
        let mut report = None;
        let installed = self.repository.with_processes(id, &mut |processes| {
            let branch = processes.branch_mut(selector)?;
            if let Some(handle) = pending.take() {
                displaced = branch.install_remote(handle);
            }
            report = Some(BranchReport::new(id, selector, branch));
            Ok(())
        });

        if let Err(e) = installed {
            if let Some(handle) = pending {
                handle.terminate(grace).await;
            }
            return Err(e);
        }
        if let Some(handle) = displaced {
            handle.terminate(grace).await;
        }

        info!(stream_id = %id, branch = %selector, remote_port, "Branch restarted");
        report.ok_or_else(|| Error::not_found("Branch", selector.as_str()))
    }

    /// Status record with a live remaining duration.
    pub fn stream_status(&self, id: &StreamId) -> Result<StreamStatus> {
        let mut status = self
            .repository
            .status(id)
            .ok_or_else(|| Error::not_found("Stream", id.as_str()))?;
        status.remaining_duration = status.remaining_at(Utc::now());
        Ok(status)
    }

    pub fn bandwidth(&self, id: &StreamId) -> Result<BandwidthTable> {
        self.repository
            .bandwidth(id)
            .ok_or_else(|| Error::not_found("Bandwidth", id.as_str()))
    }

    /// Every non-terminal stream, oldest schedule first.
    pub fn active_streams(&self) -> Vec<ActiveStreamInfo> {
        let now = Utc::now();
        let mut streams: Vec<ActiveStreamInfo> = self
            .repository
            .statuses()
            .into_iter()
            .filter(|(_, status)| !status.status.is_terminal())
            .map(|(stream_id, status)| ActiveStreamInfo {
                remaining_duration: status.remaining_at(now),
                stream_id,
                status: status.status,
                file: status.file,
                destination: status.destination,
                scheduled_start_time: status.scheduled_start_time,
                redundant: status.redundant,
            })
            .collect();
        streams.sort_by(|a, b| {
            a.scheduled_start_time
                .cmp(&b.scheduled_start_time)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        streams
    }

    pub async fn list_media(&self) -> Result<Vec<String>> {
        self.storage.list().await
    }

    /// Store an upload and optionally arm its deletion.
    pub async fn upload(
        self: &Arc<Self>,
        name: &str,
        data: Bytes,
        expire_minutes: Option<u64>,
    ) -> Result<UploadReceipt> {
        let filename = Path::new(name.trim())
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::validation("Upload has no file name"))?;
        if !has_allowed_extension(&filename) {
            return Err(Error::validation(format!(
                "Unsupported file type '{filename}'"
            )));
        }

        let expiry = match expire_minutes.filter(|m| *m > 0) {
            Some(minutes) => {
                let secs = minutes
                    .checked_mul(60)
                    .ok_or_else(|| Error::validation("expire_time out of range"))?;
                let expires_at = checked_after(Utc::now(), secs)
                    .ok_or_else(|| Error::validation("expire_time out of range"))?;
                Some((Duration::from_secs(secs), expires_at))
            }
            None => None,
        };

        self.storage.store(&filename, data).await?;

        let expires_at = match expiry {
            Some((delay, expires_at)) => {
                self.file_expiry.insert(filename.clone(), expires_at);

                let manager = Arc::clone(self);
                let expiring = filename.clone();
                self.scheduler.schedule(
                    format!("expire:{filename}"),
                    delay,
                    move || async move { manager.expire_file(&expiring, expires_at).await },
                );
                Some(expires_at)
            }
            None => {
                self.file_expiry.remove(&filename);
                None
            }
        };

        Ok(UploadReceipt {
            filename,
            expires_at,
        })
    }

    /// Delete an expired upload unless a later upload replaced its expiry.
    async fn expire_file(&self, name: &str, expires_at: DateTime<Utc>) {
        if self
            .file_expiry
            .remove_if(name, |_, at| *at == expires_at)
            .is_none()
        {
            debug!(object = %name, "Expiry superseded, keeping file");
            return;
        }

        match self.storage.delete(name).await {
            Ok(()) => info!(object = %name, "Expired file deleted"),
            Err(e) => warn!(object = %name, error = %e, "Failed to delete expired file"),
        }
    }

    /// Pending upload expiries.
    pub fn file_expiry(&self) -> HashMap<String, DateTime<Utc>> {
        self.file_expiry
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Stop every live stream and drop pending timers.
    pub async fn stop_all(&self) -> usize {
        self.scheduler.shutdown();

        let live: Vec<StreamId> = self
            .repository
            .statuses()
            .into_iter()
            .filter(|(_, status)| !status.status.is_terminal())
            .map(|(id, _)| id)
            .collect();

        let stops = live.iter().map(|id| self.stop_stream(id));
        let stopped = futures::future::join_all(stops)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Transition::Applied)))
            .count();

        info!(stopped, "Stopped all streams");
        stopped
    }

    /// Periodically purge terminal status records past their retention.
    pub fn start_retention_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let retention = self.config.status_retention?;
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Retention sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let purged = manager.repository.purge_finished(retention, Utc::now());
                        if purged > 0 {
                            info!(purged, "Purged finished streams");
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caster::store::InMemoryStreamRepository;
    use crate::storage::LocalStorage;

    struct Fixture {
        manager: Arc<StreamManager>,
        _media: tempfile::TempDir,
        temp: tempfile::TempDir,
    }

    fn fixture(max_streams: usize, files: &[&str]) -> Fixture {
        let media = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        for file in files {
            std::fs::write(media.path().join(file), b"media").unwrap();
        }

        let config = CasterConfig {
            max_streams,
            temp_dir: temp.path().to_path_buf(),
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            relay_path: "/nonexistent/relay".to_string(),
            terminate_grace: Duration::from_secs(1),
            status_retention: None,
        };
        let manager = StreamManager::new(
            config,
            Arc::new(InMemoryStreamRepository::new()),
            Arc::new(LocalStorage::new(media.path())),
        )
        .unwrap();

        Fixture {
            manager: Arc::new(manager),
            _media: media,
            temp,
        }
    }

    fn request(source: SourceSelector, offset: u64) -> StartStreamRequest {
        StartStreamRequest {
            source,
            duration_secs: 60,
            destinations: vec!["srt://dest:9000".to_string()],
            start_offset_secs: offset,
            redundant: false,
        }
    }

    async fn wait_for(manager: &StreamManager, id: &StreamId, state: StreamState) -> StreamStatus {
        for _ in 0..100 {
            let status = manager.stream_status(id).unwrap();
            if status.status == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("stream {id} never reached {state}");
    }

    #[tokio::test]
    async fn test_validation() {
        let f = fixture(10, &["a.mp4"]);

        let mut zero = request(SourceSelector::Any, 0);
        zero.duration_secs = 0;
        assert!(matches!(f.manager.start_stream(zero).await, Err(Error::Validation(_))));

        let mut redundant = request(SourceSelector::Any, 0);
        redundant.redundant = true;
        assert!(matches!(
            f.manager.start_stream(redundant).await,
            Err(Error::Validation(_))
        ));

        let mut none = request(SourceSelector::Any, 0);
        none.destinations.clear();
        assert!(matches!(f.manager.start_stream(none).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_unrepresentable_offset_is_rejected() {
        let f = fixture(10, &["a.mp4"]);
        for offset in [100_000_000_000_000_000, u64::MAX] {
            let err = f
                .manager
                .start_stream(request(SourceSelector::Any, offset))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert!(f.manager.active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_any_source_without_media_is_rejected() {
        let f = fixture(10, &[]);
        let err = f
            .manager
            .start_stream(request(SourceSelector::Any, 0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No media files available."));
    }

    #[tokio::test]
    async fn test_any_source_picks_stored_file() {
        let f = fixture(10, &["only.mp4"]);
        let response = f
            .manager
            .start_stream(request(SourceSelector::Any, 30))
            .await
            .unwrap();
        assert_eq!(response.file, "only.mp4");
        assert!(response.scheduled_start_time.is_some());
    }

    #[tokio::test]
    async fn test_missing_source_ends_in_error() {
        let f = fixture(10, &[]);
        let response = f
            .manager
            .start_stream(request(SourceSelector::File("ghost.mp4".into()), 0))
            .await
            .unwrap();

        let status = wait_for(&f.manager, &response.stream_id, StreamState::Error).await;
        assert!(status.message.unwrap().starts_with("Failed to download ghost.mp4"));
        assert_eq!(f.manager.active_streams().len(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_ends_in_error_and_removes_source() {
        let f = fixture(10, &["a.mp4"]);
        let response = f
            .manager
            .start_stream(request(SourceSelector::File("a.mp4".into()), 0))
            .await
            .unwrap();

        let status = wait_for(&f.manager, &response.stream_id, StreamState::Error).await;
        assert!(status.message.unwrap().starts_with("Failed to start stream"));
        let leftovers = std::fs::read_dir(f.temp.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_scheduled_stream_admission_and_stop() {
        let f = fixture(1, &["a.mp4"]);
        let first = f
            .manager
            .start_stream(request(SourceSelector::File("a.mp4".into()), 60))
            .await
            .unwrap();

        let status = f.manager.stream_status(&first.stream_id).unwrap();
        assert_eq!(status.status, StreamState::Scheduled);
        assert_eq!(f.manager.active_streams().len(), 1);

        let err = f
            .manager
            .start_stream(request(SourceSelector::File("a.mp4".into()), 60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { max: 1 }));

        assert_eq!(
            f.manager.stop_stream(&first.stream_id).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            f.manager.stop_stream(&first.stream_id).await.unwrap(),
            Transition::Unchanged
        );

        f.manager
            .start_stream(request(SourceSelector::File("a.mp4".into()), 60))
            .await
            .unwrap();
        f.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_unknown_stream_queries() {
        let f = fixture(10, &[]);
        let id = StreamId::from("nope");
        assert!(matches!(f.manager.stop_stream(&id).await, Err(Error::NotFound { .. })));
        assert!(matches!(f.manager.stream_status(&id), Err(Error::NotFound { .. })));
        assert!(matches!(f.manager.bandwidth(&id), Err(Error::NotFound { .. })));
        assert!(matches!(
            f.manager.stop_branch(&id, BranchSelector::Primary).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_branch_ops_on_flat_stream_are_rejected() {
        let f = fixture(10, &["a.mp4"]);
        let response = f
            .manager
            .start_stream(request(SourceSelector::File("a.mp4".into()), 60))
            .await
            .unwrap();
        let err = f
            .manager
            .restart_branch(&response.stream_id, BranchSelector::Secondary)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        f.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_upload_with_expiry() {
        let f = fixture(10, &[]);
        assert!(matches!(
            f.manager.upload("notes.txt", Bytes::from_static(b"x"), None).await,
            Err(Error::Validation(_))
        ));

        let receipt = f
            .manager
            .upload("clip.mov", Bytes::from_static(b"x"), Some(5))
            .await
            .unwrap();
        assert!(receipt.expires_at.is_some());
        assert!(f.manager.file_expiry().contains_key("clip.mov"));
        assert_eq!(f.manager.list_media().await.unwrap(), vec!["clip.mov"]);

        f.manager
            .upload("clip.mov", Bytes::from_static(b"y"), None)
            .await
            .unwrap();
        assert!(f.manager.file_expiry().is_empty());
        f.manager.expire_file("clip.mov", receipt.expires_at.unwrap()).await;
        assert_eq!(f.manager.list_media().await.unwrap(), vec!["clip.mov"]);
    }

    #[tokio::test]
    async fn test_unrepresentable_expiry_stores_nothing() {
        let f = fixture(10, &[]);
        for minutes in [u64::MAX / 2, u64::MAX] {
            let err = f
                .manager
                .upload("late.mp4", Bytes::from_static(b"x"), Some(minutes))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert!(f.manager.list_media().await.unwrap().is_empty());
        assert!(f.manager.file_expiry().is_empty());
    }
}
