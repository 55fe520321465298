//! Progress events and the engine-side sink that throttles them.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::scheduler::{JobId, JobState};

/// Where a running engine is; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PipelinePhase {
    Initialized = 0,
    Demuxing = 1,
    Transcoding = 2,
    Muxing = 3,
    Finalizing = 4,
    Done = 5,
    Failed = 6,
    Cancelled = 7,
}

impl PipelinePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PipelinePhase::Initialized,
            1 => PipelinePhase::Demuxing,
            2 => PipelinePhase::Transcoding,
            3 => PipelinePhase::Muxing,
            4 => PipelinePhase::Finalizing,
            5 => PipelinePhase::Done,
            6 => PipelinePhase::Failed,
            _ => PipelinePhase::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelinePhase::Done | PipelinePhase::Failed | PipelinePhase::Cancelled)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelinePhase::Initialized => "initialized",
            PipelinePhase::Demuxing => "demuxing",
            PipelinePhase::Transcoding => "transcoding",
            PipelinePhase::Muxing => "muxing",
            PipelinePhase::Finalizing => "finalizing",
            PipelinePhase::Done => "done",
            PipelinePhase::Failed => "failed",
            PipelinePhase::Cancelled => "cancelled",
        };
        f.pad(name)
    }
}

/// One observation of a job, as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job: JobId,
    pub state: JobState,
    pub phase: PipelinePhase,
    /// 0.0 ..= 1.0
    pub fraction: f64,
    pub eta: Option<Duration>,
    /// Set on Failed terminal events
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn pending(job: JobId) -> Self {
        Self {
            job,
            state: JobState::Pending,
            phase: PipelinePhase::Initialized,
            fraction: 0.0,
            eta: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Estimated time left, extrapolated linearly from `elapsed`
pub fn estimate_remaining(elapsed: Duration, fraction: f64) -> Option<Duration> {
    if fraction <= 0.0 || !fraction.is_finite() {
        return None;
    }
    let fraction = fraction.min(1.0);
    Some(elapsed.mul_f64((1.0 - fraction) / fraction))
}

/// Engine side of a job's progress channel.
///
/// Phase changes are published immediately; fraction updates at most once per
/// interval. Terminal events are published by the scheduler, not here, and
/// nothing is published after one.
pub struct ProgressSink {
    job: JobId,
    events: broadcast::Sender<ProgressEvent>,
    latest: Arc<Mutex<ProgressEvent>>,
    interval: Duration,
    started: Instant,
    phase: AtomicU8,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressSink {
    pub fn new(
        job: JobId,
        events: broadcast::Sender<ProgressEvent>,
        latest: Arc<Mutex<ProgressEvent>>,
        interval: Duration,
    ) -> Self {
        Self {
            job,
            events,
            latest,
            interval,
            started: Instant::now(),
            phase: AtomicU8::new(PipelinePhase::Initialized as u8),
            last_emit: Mutex::new(None),
        }
    }

    /// A sink whose events nobody reads, for running an engine standalone
    pub fn detached(job: JobId) -> Self {
        let (events, _) = broadcast::channel(1);
        Self::new(job, events, Arc::new(Mutex::new(ProgressEvent::pending(job))), Duration::from_secs(1))
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn phase(&self) -> PipelinePhase {
        PipelinePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move to `phase` if it is ahead of the current one; returns whether it moved.
    /// Terminal phases are only recorded; the scheduler publishes them together
    /// with the final job state.
    pub fn advance(&self, phase: PipelinePhase) -> bool {
        let target = phase as u8;
        let previous = self.phase.fetch_max(target, Ordering::SeqCst);
        if previous >= target {
            return false;
        }
        if !phase.is_terminal() {
            self.publish(|event| event.phase = event.phase.max(phase), true);
        }
        true
    }

    /// Record overall completion; published when the throttle interval allows
    pub fn fraction(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let eta = estimate_remaining(self.elapsed(), fraction);
        self.publish(
            |event| {
                event.fraction = fraction;
                event.eta = eta;
            },
            false,
        );
    }

    // sends happen under the snapshot lock so subscribers see phases in order
    fn publish(&self, update: impl FnOnce(&mut ProgressEvent), force: bool) {
        let Ok(mut latest) = self.latest.lock() else { return };
        if latest.state.is_terminal() {
            return;
        }
        update(&mut latest);
        latest.state = JobState::Running;
        let now = Instant::now();
        let Ok(mut last) = self.last_emit.lock() else { return };
        let due = last.map(|t| now.duration_since(t) >= self.interval).unwrap_or(true);
        if force || due {
            *last = Some(now);
            // no subscribers is fine
            let _ = self.events.send(latest.clone());
        }
    }
}

/// Tracks how much of each output stream has reached the muxer
pub struct ProgressMeter {
    written: Vec<f64>,
    totals: Vec<f64>,
}

impl ProgressMeter {
    /// `totals` are the expected durations, in seconds, of each output stream
    pub fn new(totals: Vec<f64>) -> Self {
        Self {
            written: vec![0.0; totals.len()],
            totals,
        }
    }

    pub fn record(&mut self, output: usize, end_seconds: f64) {
        if let Some(w) = self.written.get_mut(output) {
            *w = w.max(end_seconds);
        }
    }

    pub fn fraction(&self) -> f64 {
        let total: f64 = self.totals.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let done: f64 = self.written.iter().zip(&self.totals).map(|(w, t)| w.min(*t)).sum();
        (done / total).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(interval: Duration) -> (ProgressSink, broadcast::Receiver<ProgressEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let job = JobId::from_index(0);
        let latest = Arc::new(Mutex::new(ProgressEvent::pending(job)));
        (ProgressSink::new(job, tx, latest, interval), rx)
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let (sink, mut rx) = sink(Duration::from_secs(60));
        assert!(sink.advance(PipelinePhase::Demuxing));
        assert!(sink.advance(PipelinePhase::Muxing));
        assert!(!sink.advance(PipelinePhase::Transcoding));
        assert_eq!(sink.phase(), PipelinePhase::Muxing);

        assert_eq!(rx.try_recv().unwrap().phase, PipelinePhase::Demuxing);
        assert_eq!(rx.try_recv().unwrap().phase, PipelinePhase::Muxing);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_terminal_phase_never_pairs_with_running() {
        let (sink, mut rx) = sink(Duration::ZERO);
        assert!(sink.advance(PipelinePhase::Muxing));
        assert!(sink.advance(PipelinePhase::Done));
        assert_eq!(sink.phase(), PipelinePhase::Done);

        let muxing = rx.try_recv().unwrap();
        assert_eq!((muxing.phase, muxing.state), (PipelinePhase::Muxing, JobState::Running));
        assert!(rx.try_recv().is_err(), "terminal phases belong to the scheduler");

        // once the job is marked finished, late updates are ignored
        {
            let mut latest = sink.latest.lock().unwrap();
            latest.state = JobState::Succeeded;
            latest.phase = PipelinePhase::Done;
        }
        sink.fraction(0.5);
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.latest.lock().unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn test_fraction_updates_are_throttled() {
        let (sink, mut rx) = sink(Duration::from_secs(60));
        sink.fraction(0.1);
        sink.fraction(0.2);
        sink.fraction(0.3);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.fraction, 0.1);
        assert_eq!(first.state, JobState::Running);
        assert!(rx.try_recv().is_err());
        // the latest snapshot still carries the newest value
        assert_eq!(sink.latest.lock().unwrap().fraction, 0.3);
    }

    #[test]
    fn test_meter_weights_streams_by_duration() {
        let mut meter = ProgressMeter::new(vec![10.0, 10.0]);
        meter.record(0, 5.0);
        assert_eq!(meter.fraction(), 0.25);
        meter.record(1, 20.0);
        assert_eq!(meter.fraction(), 0.75);
        meter.record(0, 2.0);
        assert_eq!(meter.fraction(), 0.75);
    }

    #[test]
    fn test_eta_extrapolates() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0.25), Some(Duration::from_secs(30)));
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0.0), None);
    }
}
