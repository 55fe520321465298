//! Admission, concurrency limits and progress fan-out for conversion jobs.
//!
//! Every job lives in one arena indexed by [`JobId`], behind a single mutex.
//! State transitions and terminal progress events happen under that mutex, so
//! a subscriber can never observe a job going backwards or miss its end.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ConverterConfig;
use crate::error::{ConvertError, StageError, ValidationError};
use crate::format::FormatRegistry;
use crate::job::JobDescriptor;
use crate::journal::{self, JobRecord};
use crate::media::ContainerFormat;
use crate::pipeline::{EngineOutcome, EngineSettings, PipelineEngine};
use crate::progress::{PipelinePhase, ProgressEvent, ProgressSink};

/// Buffered progress events per job before slow subscribers start skipping
const EVENT_CAPACITY: usize = 64;

/// Handle to a submitted job, valid for the lifetime of its scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(usize);

impl JobId {
    pub fn from_index(index: usize) -> Self {
        JobId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle of a job. Moves Pending -> Running -> terminal, or Pending ->
/// Cancelled/Failed directly; never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub max_parallel_jobs: usize,
    pub memory_budget_bytes: u64,
    pub engine: EngineSettings,
    pub progress_interval: Duration,
    /// Where finished jobs are recorded; `None` keeps no history
    pub journal_dir: Option<PathBuf>,
}

impl From<&ConverterConfig> for SchedulerSettings {
    fn from(config: &ConverterConfig) -> Self {
        Self {
            max_parallel_jobs: config.max_parallel_jobs.max(1),
            memory_budget_bytes: config.memory_budget_bytes,
            engine: config.engine_settings(),
            progress_interval: config.progress_interval(),
            journal_dir: Some(config.job_state_dir.clone()),
        }
    }
}

/// Everything known about one job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: JobId,
    pub run_id: Uuid,
    pub input: PathBuf,
    pub output: PathBuf,
    pub container: ContainerFormat,
    pub state: JobState,
    pub phase: PipelinePhase,
    pub fraction: f64,
    pub eta: Option<Duration>,
    pub error: Option<ConvertError>,
    /// Streams left out of an otherwise successful output
    pub stream_failures: Vec<StageError>,
    pub partial_output: Option<PathBuf>,
    pub bytes_written: u64,
    /// Buffer memory reserved while running
    pub memory_estimate: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobReport {
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            run_id: self.run_id,
            job: self.id,
            input: self.input.clone(),
            output: self.output.clone(),
            container: self.container,
            state: self.state,
            error: self.error.as_ref().map(|e| e.to_string()),
            stream_failures: self.stream_failures.iter().map(|e| e.to_string()).collect(),
            partial_output: self.partial_output.clone(),
            bytes_written: self.bytes_written,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

struct JobEntry {
    run_id: Uuid,
    input: PathBuf,
    output: PathBuf,
    container: ContainerFormat,
    state: JobState,
    memory: u64,
    /// Present until the job starts
    engine: Option<PipelineEngine>,
    cancel: CancellationToken,
    events: broadcast::Sender<ProgressEvent>,
    latest: Arc<Mutex<ProgressEvent>>,
    error: Option<ConvertError>,
    stream_failures: Vec<StageError>,
    partial_output: Option<PathBuf>,
    bytes_written: u64,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobEntry {
    fn snapshot(&self) -> ProgressEvent {
        match self.latest.lock() {
            Ok(latest) => latest.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Rewrite the shared snapshot and publish it
    fn announce(&self, update: impl FnOnce(&mut ProgressEvent)) {
        let mut latest = self.latest.lock().unwrap_or_else(|p| p.into_inner());
        update(&mut latest);
        // no subscribers is fine
        let _ = self.events.send(latest.clone());
    }

    fn report(&self, id: JobId) -> JobReport {
        let latest = self.snapshot();
        JobReport {
            id,
            run_id: self.run_id,
            input: self.input.clone(),
            output: self.output.clone(),
            container: self.container,
            state: self.state,
            phase: latest.phase,
            fraction: latest.fraction,
            eta: latest.eta,
            error: self.error.clone(),
            stream_failures: self.stream_failures.clone(),
            partial_output: self.partial_output.clone(),
            bytes_written: self.bytes_written,
            memory_estimate: self.memory,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Default)]
struct JobTable {
    entries: Vec<JobEntry>,
    queue: VecDeque<JobId>,
    running: usize,
    memory_in_use: u64,
}

struct Shared {
    table: Mutex<JobTable>,
    formats: Arc<FormatRegistry>,
    settings: SchedulerSettings,
}

/// Runs submitted jobs, at most `max_parallel_jobs` at a time, in submission order.
///
/// Cheap to clone; clones share the same jobs. Must be used from within a
/// tokio runtime, since starting a job spawns a task.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(formats: Arc<FormatRegistry>, settings: SchedulerSettings) -> Self {
        info!(
            "Scheduler: {} parallel job(s), {} bytes of buffer memory",
            settings.max_parallel_jobs, settings.memory_budget_bytes
        );
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(JobTable::default()),
                formats,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.shared.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue a validated job. It is Pending on return and may already be running.
    pub fn submit(&self, descriptor: JobDescriptor) -> Result<JobId, ConvertError> {
        let engine_settings = self.shared.settings.engine;
        let memory = descriptor.buffered_bytes(engine_settings.buffer_packets, engine_settings.audio_packet_frames);

        let (id, records) = {
            let mut table = self.table();
            let busy = table
                .entries
                .iter()
                .position(|e| !e.state.is_terminal() && e.output == descriptor.output());
            if let Some(index) = busy {
                return Err(ValidationError::OutputBusy {
                    path: descriptor.output().to_path_buf(),
                    job: JobId(index),
                }
                .into());
            }

            let id = JobId(table.entries.len());
            let input = descriptor.input().to_path_buf();
            let output = descriptor.output().to_path_buf();
            let container = descriptor.container();
            let engine = PipelineEngine::new(descriptor, self.shared.formats.clone(), engine_settings);
            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            info!("Queued {}: {} -> {} (~{} bytes buffered)", id, input.display(), output.display(), memory);
            table.entries.push(JobEntry {
                run_id: engine.run_id(),
                input,
                output,
                container,
                state: JobState::Pending,
                memory,
                engine: Some(engine),
                cancel: CancellationToken::new(),
                events,
                latest: Arc::new(Mutex::new(ProgressEvent::pending(id))),
                error: None,
                stream_failures: Vec::new(),
                partial_output: None,
                bytes_written: 0,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
            });
            table.queue.push_back(id);
            (id, self.pump(&mut table))
        };
        self.journal(records);
        Ok(id)
    }

    /// Start queued jobs while limits allow. Returns records of jobs that
    /// ended without running.
    fn pump(&self, table: &mut JobTable) -> Vec<JobRecord> {
        let settings = &self.shared.settings;
        let budget = settings.memory_budget_bytes;
        let mut records = Vec::new();

        while let Some(&id) = table.queue.front() {
            let Some(memory) = table.entries.get(id.0).map(|e| e.memory) else {
                table.queue.pop_front();
                continue;
            };
            if memory > budget {
                table.queue.pop_front();
                warn!("{} needs {} bytes of buffers, budget is {}", id, memory, budget);
                let error = ConvertError::Resource { required: memory, budget };
                records.extend(self.finish(table, id, JobState::Failed, Some(error)));
                continue;
            }
            if table.running >= settings.max_parallel_jobs || table.memory_in_use + memory > budget {
                debug!("{} waits: {} running, {} bytes in use", id, table.running, table.memory_in_use);
                break;
            }
            table.queue.pop_front();
            self.start(table, id);
        }
        records
    }

    fn start(&self, table: &mut JobTable, id: JobId) {
        let settings = &self.shared.settings;
        let Some(entry) = table.entries.get_mut(id.0) else { return };
        let Some(engine) = entry.engine.take() else { return };

        entry.state = JobState::Running;
        entry.started_at = Some(Utc::now());
        entry.announce(|event| event.state = JobState::Running);
        let memory = entry.memory;
        let sink = Arc::new(ProgressSink::new(id, entry.events.clone(), entry.latest.clone(), settings.progress_interval));
        let cancel = entry.cancel.clone();
        table.running += 1;
        table.memory_in_use += memory;
        info!("Starting {} ({} running)", id, table.running);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let outcome = engine.run(cancel, sink).await;
            scheduler.complete(id, memory, outcome);
        });
    }

    fn complete(&self, id: JobId, memory: u64, outcome: EngineOutcome) {
        let records = {
            let mut table = self.table();
            table.running = table.running.saturating_sub(1);
            table.memory_in_use = table.memory_in_use.saturating_sub(memory);
            if let Some(entry) = table.entries.get_mut(id.0) {
                entry.stream_failures = outcome.stream_failures;
                entry.partial_output = outcome.partial_output;
                entry.bytes_written = outcome.bytes_written;
            }
            let mut records: Vec<JobRecord> = self.finish(&mut table, id, outcome.state, outcome.error).into_iter().collect();
            records.extend(self.pump(&mut table));
            records
        };
        self.journal(records);
    }

    /// Move a job to a terminal state and publish its final event
    fn finish(&self, table: &mut JobTable, id: JobId, state: JobState, error: Option<ConvertError>) -> Option<JobRecord> {
        let entry = table.entries.get_mut(id.0)?;
        if entry.state.is_terminal() || !state.is_terminal() {
            return None;
        }
        entry.state = state;
        entry.error = error;
        entry.finished_at = Some(Utc::now());
        entry.engine = None;

        let message = entry.error.as_ref().map(|e| e.to_string());
        entry.announce(|event| {
            event.state = state;
            event.phase = match state {
                JobState::Succeeded => PipelinePhase::Done,
                JobState::Cancelled => PipelinePhase::Cancelled,
                _ => PipelinePhase::Failed,
            };
            if state == JobState::Succeeded {
                event.fraction = 1.0;
            }
            event.eta = None;
            event.error = message;
        });
        debug!("{} is {}", id, state);
        Some(entry.report(id).to_record())
    }

    fn journal(&self, records: Vec<JobRecord>) {
        let Some(dir) = &self.shared.settings.journal_dir else { return };
        for record in records {
            if let Err(e) = journal::save_record(&record, dir) {
                warn!("Failed to record {}: {:#}", record.job, e);
            }
        }
    }

    /// Request cancellation. Pending jobs end at once; running ones stop at
    /// their next link exchange. Terminal jobs are left alone.
    pub fn cancel(&self, id: JobId) -> Result<(), ConvertError> {
        let records = {
            let mut table = self.table();
            let state = table.entries.get(id.0).map(|e| e.state).ok_or(ConvertError::UnknownJob(id))?;
            match state {
                JobState::Pending => {
                    table.queue.retain(|queued| *queued != id);
                    info!("Cancelled {} before it started", id);
                    let mut records: Vec<JobRecord> =
                        self.finish(&mut table, id, JobState::Cancelled, Some(ConvertError::Cancelled)).into_iter().collect();
                    records.extend(self.pump(&mut table));
                    records
                }
                JobState::Running => {
                    info!("Cancelling {}", id);
                    if let Some(entry) = table.entries.get(id.0) {
                        entry.cancel.cancel();
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };
        self.journal(records);
        Ok(())
    }

    /// Cancel every job that has not finished
    pub fn cancel_all(&self) {
        let ids: Vec<JobId> = {
            let table = self.table();
            (0..table.entries.len())
                .map(JobId)
                .filter(|id| !table.entries[id.0].state.is_terminal())
                .collect()
        };
        for id in ids {
            // ids came from the table, so they exist
            let _ = self.cancel(id);
        }
    }

    pub fn status(&self, id: JobId) -> Result<JobState, ConvertError> {
        self.table().entries.get(id.0).map(|e| e.state).ok_or(ConvertError::UnknownJob(id))
    }

    pub fn report(&self, id: JobId) -> Result<JobReport, ConvertError> {
        self.table().entries.get(id.0).map(|e| e.report(id)).ok_or(ConvertError::UnknownJob(id))
    }

    /// Jobs currently running
    pub fn running(&self) -> Vec<JobId> {
        let table = self.table();
        (0..table.entries.len())
            .map(JobId)
            .filter(|id| table.entries[id.0].state == JobState::Running)
            .collect()
    }

    /// Every job ever submitted, in submission order
    pub fn jobs(&self) -> Vec<JobId> {
        (0..self.table().entries.len()).map(JobId).collect()
    }

    /// Progress of one job, starting with its current state. The stream ends
    /// right after the terminal event.
    pub fn subscribe(&self, id: JobId) -> Result<BoxStream<'static, ProgressEvent>, ConvertError> {
        let (snapshot, receiver) = {
            let table = self.table();
            let entry = table.entries.get(id.0).ok_or(ConvertError::UnknownJob(id))?;
            // subscribe first so nothing between the snapshot and the receiver is lost
            let receiver = entry.events.subscribe();
            (entry.snapshot(), receiver)
        };
        if snapshot.is_terminal() {
            return Ok(stream::once(async move { snapshot }).boxed());
        }

        let live = BroadcastStream::new(receiver).filter_map(|event| async move { event.ok() });
        let mut ended = false;
        let events = stream::once(async move { snapshot }).chain(live).take_while(move |event| {
            let keep = !ended;
            ended = event.is_terminal();
            async move { keep }
        });
        Ok(events.boxed())
    }

    /// Wait for a job to reach a terminal state
    pub async fn wait(&self, id: JobId) -> Result<JobReport, ConvertError> {
        let mut events = self.subscribe(id)?;
        while events.next().await.is_some() {}
        self.report(id)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table();
        f.debug_struct("Scheduler")
            .field("jobs", &table.entries.len())
            .field("queued", &table.queue.len())
            .field("running", &table.running)
            .field("memory_in_use", &table.memory_in_use)
            .finish()
    }
}
