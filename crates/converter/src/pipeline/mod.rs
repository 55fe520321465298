//! The pipeline engine: one validated job, executed as concurrent stages.
//!
//! Demux fans packets out per source stream. Copied streams go straight to the
//! muxer; transcoded ones pass through a decode+transform thread and an encode
//! thread. All stages are joined by bounded links, so a slow muxer stalls the
//! demuxer instead of growing memory. Output is written to a `.part` file next
//! to the target and renamed into place only on success.

pub mod link;
mod stages;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::task::{spawn_blocking, JoinError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConvertError, StageError};
use crate::format::ffmpeg::Ffmpeg;
use crate::format::{Decoder, DemuxOptions, Demuxer, Encoder, FormatFamily, FormatRegistry, Muxer};
use crate::job::{JobDescriptor, StreamAction, StreamPlan};
use crate::media::{ContainerFormat, Frame, Packet, StreamInfo};
use crate::progress::{PipelinePhase, ProgressSink};
use crate::scheduler::JobState;
use crate::transform::Transform;
use link::link;
use stages::{MuxInput, MuxSummary, Route, StageFailure};

/// Tuning shared by every engine a scheduler starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Capacity of each inter-stage link
    pub buffer_packets: usize,
    /// Sample frames per packet for formats without natural packets
    pub audio_packet_frames: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            buffer_packets: 8,
            audio_packet_frames: DemuxOptions::default().audio_packet_frames,
        }
    }
}

/// How an engine run ended
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    /// Succeeded, Failed or Cancelled
    pub state: JobState,
    pub error: Option<ConvertError>,
    /// Streams that failed without taking the job down
    pub stream_failures: Vec<StageError>,
    /// Set on success
    pub output: Option<PathBuf>,
    /// Set when a failed or cancelled run left its partial file behind
    pub partial_output: Option<PathBuf>,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

enum PreparedStream {
    Copy,
    Transcode {
        decoder: Box<dyn Decoder>,
        transform: Option<Transform>,
        encoder: Box<dyn Encoder>,
    },
    Failed(StageError),
}

struct Prepared {
    demuxer: Box<dyn Demuxer>,
    muxer: Box<dyn Muxer>,
    streams: Vec<PreparedStream>,
}

#[derive(Default)]
struct Execution {
    fatal: Option<StageError>,
    stream_failures: Vec<StageError>,
    completed: usize,
    packets: u64,
    bytes: u64,
}

impl Execution {
    fn fatal(error: StageError) -> Self {
        Self { fatal: Some(error), ..Default::default() }
    }
}

/// Open both ends of the job and build a codec chain per transcoded stream.
/// Codec setup failures are confined to their stream.
fn prepare(
    formats: &FormatRegistry,
    source: ContainerFormat,
    target: ContainerFormat,
    input: &Path,
    temp: &Path,
    plans: &[StreamPlan],
    options: &DemuxOptions,
) -> Result<Prepared, StageError> {
    let source_family = formats
        .family(source)
        .ok_or_else(|| StageError::Demux(format!("no format family for {}", source)))?;
    let target_family = formats
        .family(target)
        .ok_or_else(|| StageError::Mux(format!("no format family for {}", target)))?;

    let demuxer = source_family
        .open_demuxer(input, options)
        .map_err(|e| StageError::Demux(e.to_string()))?;
    let targets: Vec<StreamInfo> = plans.iter().map(|p| p.target.clone()).collect();
    let muxer = target_family
        .open_muxer(temp, &targets)
        .map_err(|e| StageError::Mux(e.to_string()))?;

    let streams = plans
        .iter()
        .map(|plan| {
            if plan.action == StreamAction::Copy {
                return PreparedStream::Copy;
            }
            let stream = plan.source.index;
            let decoder = match source_family.decoder(&plan.source) {
                Ok(d) => d,
                Err(e) => return PreparedStream::Failed(StageError::Decode { stream, message: e.to_string() }),
            };
            let encoder = match target_family.encoder(&plan.target) {
                Ok(e) => e,
                Err(e) => return PreparedStream::Failed(StageError::Encode { stream, message: e.to_string() }),
            };
            PreparedStream::Transcode {
                decoder,
                transform: Transform::between(&plan.source.params, &plan.target.params),
                encoder,
            }
        })
        .collect();

    Ok(Prepared { demuxer, muxer, streams })
}

fn panicked(stage: &str, e: JoinError) -> String {
    format!("{} worker stopped abnormally: {}", stage, e)
}

/// Runs exactly one job; consumed by [`PipelineEngine::run`]
pub struct PipelineEngine {
    job: JobDescriptor,
    formats: Arc<FormatRegistry>,
    settings: EngineSettings,
    run_id: Uuid,
}

impl PipelineEngine {
    pub fn new(job: JobDescriptor, formats: Arc<FormatRegistry>, settings: EngineSettings) -> Self {
        Self {
            job,
            formats,
            settings,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn job(&self) -> &JobDescriptor {
        &self.job
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Where output is written while the run is in flight
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .job
            .output()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.part", self.run_id.simple()));
        self.job.output().with_file_name(name)
    }

    /// Execute the job to completion, failure or cancellation.
    ///
    /// Never returns an error itself; everything that went wrong is in the
    /// outcome.
    pub async fn run(self, cancel: CancellationToken, progress: Arc<ProgressSink>) -> EngineOutcome {
        let started = Instant::now();
        let temp = self.temp_path();
        info!(
            "▶️  {}: {} -> {} ({} stream(s))",
            progress.job(),
            self.job.input().display(),
            self.job.output().display(),
            self.job.streams().len()
        );

        let exec = self.execute(&temp, &cancel, &progress).await;

        let mut outcome = EngineOutcome {
            state: JobState::Succeeded,
            error: None,
            stream_failures: exec.stream_failures,
            output: None,
            partial_output: None,
            packets_written: exec.packets,
            bytes_written: exec.bytes,
            elapsed: Duration::ZERO,
        };

        if cancel.is_cancelled() {
            outcome.state = JobState::Cancelled;
            outcome.error = Some(ConvertError::Cancelled);
        } else if let Some(fatal) = exec.fatal {
            outcome.state = JobState::Failed;
            outcome.error = Some(fatal.into());
        } else if exec.completed == 0 {
            let cause = outcome
                .stream_failures
                .first()
                .cloned()
                .unwrap_or_else(|| StageError::Mux("no stream completed".to_string()));
            outcome.state = JobState::Failed;
            outcome.error = Some(cause.into());
        }

        if outcome.state == JobState::Succeeded {
            match tokio::fs::rename(&temp, self.job.output()).await {
                Ok(()) => outcome.output = Some(self.job.output().to_path_buf()),
                Err(e) => {
                    outcome.state = JobState::Failed;
                    outcome.error = Some(
                        StageError::Mux(format!("cannot move output into place: {}", e)).into(),
                    );
                }
            }
        }
        if outcome.state != JobState::Succeeded {
            outcome.partial_output = self.discard_partial(&temp).await;
        }

        outcome.elapsed = started.elapsed();
        match outcome.state {
            JobState::Succeeded => {
                progress.advance(PipelinePhase::Done);
                info!(
                    "✅ {}: wrote {} ({} bytes, {} packets) in {:.1}s",
                    progress.job(),
                    self.job.output().display(),
                    outcome.bytes_written,
                    outcome.packets_written,
                    outcome.elapsed.as_secs_f64()
                );
                for failure in &outcome.stream_failures {
                    warn!("{}: output is missing a stream: {}", progress.job(), failure);
                }
            }
            JobState::Cancelled => {
                progress.advance(PipelinePhase::Cancelled);
                warn!("⏹️  {}: cancelled", progress.job());
            }
            _ => {
                progress.advance(PipelinePhase::Failed);
                if let Some(e) = &outcome.error {
                    error!("❌ {}: {}", progress.job(), e);
                }
            }
        }
        outcome
    }

    async fn discard_partial(&self, temp: &Path) -> Option<PathBuf> {
        if !temp.exists() {
            return None;
        }
        if self.job.keep_partial() {
            info!("Keeping partial output {}", temp.display());
            return Some(temp.to_path_buf());
        }
        if let Err(e) = tokio::fs::remove_file(temp).await {
            warn!("Failed to remove partial output {}: {}", temp.display(), e);
        }
        None
    }

    /// The external tool, when some part of this job is beyond the built-in stages
    fn external_tool(&self) -> Option<Arc<Ffmpeg>> {
        let tool = self.formats.tool()?;
        let source = self.formats.family(self.job.source().container);
        let target = self.formats.family(self.job.container());
        let external = |family: &Option<Arc<dyn FormatFamily>>| family.as_ref().map(|f| f.is_external()).unwrap_or(false);
        let undecodable = self.job.streams().iter().any(|plan| {
            plan.action == StreamAction::Transcode && !source.as_ref().map(|f| f.can_decode(&plan.source)).unwrap_or(false)
        });
        (external(&source) || external(&target) || undecodable).then_some(tool)
    }

    async fn execute_external(
        &self,
        tool: &Ffmpeg,
        temp: &Path,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Execution {
        debug!("{}: handing the whole job to {}", progress.job(), tool.ffmpeg_bin.display());
        match tool.convert(&self.job, temp, cancel, progress).await {
            Ok(Some(bytes)) => Execution {
                completed: self.job.streams().len(),
                bytes,
                ..Default::default()
            },
            Ok(None) => Execution::default(),
            Err(e) => Execution::fatal(e),
        }
    }

    async fn execute(&self, temp: &Path, cancel: &CancellationToken, progress: &Arc<ProgressSink>) -> Execution {
        if let Some(tool) = self.external_tool() {
            return self.execute_external(&tool, temp, cancel, progress).await;
        }
        let prepared = {
            let formats = self.formats.clone();
            let source = self.job.source().container;
            let target = self.job.container();
            let input = self.job.input().to_path_buf();
            let temp = temp.to_path_buf();
            let plans = self.job.streams().to_vec();
            let options = DemuxOptions { audio_packet_frames: self.settings.audio_packet_frames };
            spawn_blocking(move || prepare(&formats, source, target, &input, &temp, &plans, &options)).await
        };
        let Prepared { demuxer, muxer, streams } = match prepared {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => return Execution::fatal(e),
            Err(e) => return Execution::fatal(StageError::Demux(panicked("setup", e))),
        };

        let buffer = self.settings.buffer_packets;
        let slots = self.job.source().streams.iter().map(|s| s.index + 1).max().unwrap_or(0);
        let mut routes: Vec<Option<Route>> = (0..slots).map(|_| None).collect();
        let (mux_tx, mux_rx) = link::<MuxInput>(buffer, cancel);
        let mut exec = Execution::default();
        let mut workers = Vec::new();

        for (plan, prepared) in self.job.streams().iter().zip(streams) {
            let source = plan.source.index;
            let output = plan.output_index();
            let Some(slot) = routes.get_mut(source) else { continue };
            match prepared {
                PreparedStream::Failed(e) => {
                    warn!("{}: {}", progress.job(), e);
                    exec.stream_failures.push(e);
                }
                PreparedStream::Copy => {
                    debug!("{}: stream {} copied as output {}", progress.job(), source, output);
                    *slot = Some(Route::Copy { mux: mux_tx.clone(), output });
                }
                PreparedStream::Transcode { decoder, transform, encoder } => {
                    debug!(
                        "{}: stream {} transcoded as output {} ({} -> {})",
                        progress.job(),
                        source,
                        output,
                        plan.source.codec,
                        plan.target.codec
                    );
                    let (packet_tx, packet_rx) = link::<Packet>(buffer, cancel);
                    let (frame_tx, frame_rx) = link::<Frame>(buffer, cancel);
                    *slot = Some(Route::Decode(packet_tx));

                    let sink = progress.clone();
                    workers.push((
                        source,
                        spawn_blocking(move || stages::decode(source, decoder, transform, packet_rx, frame_tx, &sink)),
                    ));
                    let mux = mux_tx.clone();
                    workers.push((
                        source,
                        spawn_blocking(move || stages::encode(source, output, encoder, frame_rx, mux)),
                    ));
                }
            }
        }
        // the muxer sees Closed once every route and encoder has let go
        drop(mux_tx);

        let sink = progress.clone();
        let demux_task = spawn_blocking(move || stages::demux(demuxer, routes, &sink));
        let sink = progress.clone();
        let targets = self.job.targets();
        let mux_task = spawn_blocking(move || stages::mux(muxer, mux_rx, &targets, &sink));

        match demux_task.await {
            Ok(Ok(packets)) => debug!("{}: demux routed {} packets", progress.job(), packets),
            Ok(Err(StageFailure::Failed(e))) => exec.fatal = Some(e),
            Ok(Err(StageFailure::Interrupted(_))) => {}
            Err(e) => exec.fatal = Some(StageError::Demux(panicked("demux", e))),
        }

        let results = join_all(workers.into_iter().map(|(stream, handle)| async move { (stream, handle.await) })).await;
        for (stream, result) in results {
            match result {
                Ok(Ok(())) | Ok(Err(StageFailure::Interrupted(_))) => {}
                Ok(Err(StageFailure::Failed(e))) => {
                    warn!("{}: {}", progress.job(), e);
                    exec.stream_failures.push(e);
                }
                Err(e) => exec.stream_failures.push(StageError::Decode { stream, message: panicked("codec", e) }),
            }
        }

        match mux_task.await {
            Ok(Ok(MuxSummary { completed, packets, bytes })) => {
                exec.completed = completed.iter().filter(|done| **done).count();
                exec.packets = packets;
                exec.bytes = bytes;
            }
            Ok(Err(StageFailure::Failed(e))) => {
                exec.fatal.get_or_insert(e);
            }
            Ok(Err(StageFailure::Interrupted(_))) => {}
            Err(e) => {
                exec.fatal.get_or_insert(StageError::Mux(panicked("mux", e)));
            }
        }
        exec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ThrottledWav};
    use crate::job::{validate, OutputRequest};
    use crate::media::{CodecId, PixelFormat, SampleFormat, StreamKind};
    use crate::probe::{probe_with, DEFAULT_PROBE_BYTES};
    use crate::scheduler::JobId;
    use tempfile::TempDir;

    fn describe(registry: &FormatRegistry, input: &Path, request: &OutputRequest) -> JobDescriptor {
        let info = probe_with(input, registry, DEFAULT_PROBE_BYTES).unwrap();
        validate(&info, request, registry).unwrap()
    }

    async fn convert_with(
        registry: Arc<FormatRegistry>,
        settings: EngineSettings,
        input: &Path,
        request: &OutputRequest,
        cancel: CancellationToken,
    ) -> EngineOutcome {
        let job = describe(&registry, input, request);
        let engine = PipelineEngine::new(job, registry, settings);
        engine.run(cancel, Arc::new(ProgressSink::detached(JobId::from_index(0)))).await
    }

    async fn convert(input: &Path, request: &OutputRequest) -> EngineOutcome {
        let registry = Arc::new(FormatRegistry::with_defaults());
        convert_with(registry, EngineSettings::default(), input, request, CancellationToken::new()).await
    }

    fn reprobe(path: &Path) -> crate::media::MediaInfo {
        probe_with(path, &FormatRegistry::with_defaults(), DEFAULT_PROBE_BYTES).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_round_trip_through_avi_keeps_duration() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tone.wav");
        fixtures::write_wav(&source, 8000, 1, SampleFormat::S16, 8000);

        let avi = dir.path().join("tone.avi");
        let outcome = convert(&source, &OutputRequest::to_path(&avi)).await;
        assert_eq!(outcome.state, JobState::Succeeded, "{:?}", outcome.error);

        let back = dir.path().join("back.wav");
        let outcome = convert(&avi, &OutputRequest::to_path(&back)).await;
        assert_eq!(outcome.state, JobState::Succeeded, "{:?}", outcome.error);
        assert_eq!(outcome.output.as_deref(), Some(back.as_path()));

        let original = reprobe(&source);
        let round = reprobe(&back);
        assert_eq!(round.streams.len(), original.streams.len());
        assert_eq!(round.duration, original.duration);
        assert_eq!(round.streams[0].frames, Some(8000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_adpcm_transcode_keeps_frame_count() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("speech.wav");
        fixtures::write_wav(&source, 22050, 2, SampleFormat::S16, 10_000);

        let target = dir.path().join("speech_adpcm.wav");
        let mut request = OutputRequest::to_path(&target);
        request.audio.codec = Some(CodecId::ImaAdpcm);
        let outcome = convert(&source, &request).await;
        assert_eq!(outcome.state, JobState::Succeeded, "{:?}", outcome.error);

        let info = reprobe(&target);
        assert_eq!(info.streams[0].codec, CodecId::ImaAdpcm);
        assert_eq!(info.streams[0].frames, Some(10_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resample_and_downmix() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("music.wav");
        fixtures::write_wav(&source, 44100, 2, SampleFormat::F32, 44100);

        let target = dir.path().join("music_small.wav");
        let mut request = OutputRequest::to_path(&target);
        request.audio.sample_rate = Some(22050);
        request.audio.channels = Some(1);
        let outcome = convert(&source, &request).await;
        assert_eq!(outcome.state, JobState::Succeeded, "{:?}", outcome.error);

        let info = reprobe(&target);
        let stream = &info.streams[0];
        assert_eq!(stream.sample_rate(), Some(22050));
        assert_eq!(stream.channels(), Some(1));
        assert_eq!(stream.frames, Some(22050));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_y4m_to_avi_converts_pixels() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("clip.y4m");
        fixtures::write_y4m(&source, 16, 8, PixelFormat::Yuv420p, 5);

        let outcome = convert(&source, &OutputRequest::to_container(ContainerFormat::Avi)).await;
        assert_eq!(outcome.state, JobState::Succeeded, "{:?}", outcome.error);

        let info = reprobe(&dir.path().join("clip_converted.avi"));
        assert_eq!(info.streams.len(), 1);
        assert_eq!(info.streams[0].kind, StreamKind::Video);
        assert_eq!(info.streams[0].pixel_format(), Some(PixelFormat::Bgr24));
        assert_eq!(info.streams[0].frames, Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stream_failure_is_local() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.avi");
        fixtures::write_avi_with_broken_audio(&source, 8, 8, 5, 8000);

        let target = dir.path().join("rescued.avi");
        let mut request = OutputRequest::to_path(&target);
        request.audio.sample_rate = Some(16000);
        let outcome = convert(&source, &request).await;

        assert_eq!(outcome.state, JobState::Succeeded, "{:?}", outcome.error);
        assert_eq!(outcome.stream_failures.len(), 1);
        assert_eq!(outcome.stream_failures[0].stream(), Some(1));
        assert!(matches!(outcome.stream_failures[0], StageError::Decode { .. }));

        let info = reprobe(&target);
        let video = info.streams.iter().find(|s| s.kind == StreamKind::Video).unwrap();
        assert_eq!(video.frames, Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_job_fails_when_no_stream_completes() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.avi");
        fixtures::write_avi_with_broken_audio(&source, 8, 8, 5, 8000);

        let target = dir.path().join("audio.wav");
        let mut request = OutputRequest::to_path(&target);
        request.audio.sample_rate = Some(16000);
        request.video.drop = true;
        let outcome = convert(&source, &request).await;

        assert_eq!(outcome.state, JobState::Failed);
        assert!(matches!(outcome.error, Some(ConvertError::Stage(StageError::Decode { stream: 1, .. }))));
        assert!(!target.exists());
        assert_eq!(outcome.partial_output, None);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "part").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keep_partial_on_failure() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.avi");
        fixtures::write_avi_with_broken_audio(&source, 8, 8, 5, 8000);

        let target = dir.path().join("audio.wav");
        let mut request = OutputRequest::to_path(&target);
        request.audio.sample_rate = Some(16000);
        request.video.drop = true;
        request.keep_partial = true;
        let outcome = convert(&source, &request).await;

        assert_eq!(outcome.state, JobState::Failed);
        let partial = outcome.partial_output.unwrap();
        assert!(partial.exists());
        assert!(partial.to_string_lossy().ends_with(".part"));
        assert!(!target.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_truncated_input_fails_whole_job() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("cut.y4m");
        fixtures::write_y4m(&source, 8, 8, PixelFormat::Gray8, 3);
        let len = std::fs::metadata(&source).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&source).unwrap();
        file.set_len(len - 10).unwrap();

        let target = dir.path().join("whole.y4m");
        let outcome = convert(&source, &OutputRequest::to_path(&target)).await;
        assert_eq!(outcome.state, JobState::Failed);
        assert!(matches!(outcome.error, Some(ConvertError::Stage(StageError::Demux(_)))));
        assert!(!target.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_mid_run_removes_partial() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("long.wav");
        fixtures::write_wav(&source, 8000, 1, SampleFormat::S16, 16_000);

        let mut registry = FormatRegistry::with_defaults();
        registry.register(Arc::new(ThrottledWav::new(Duration::from_millis(5))));
        let settings = EngineSettings { buffer_packets: 2, audio_packet_frames: 100 };

        let target = dir.path().join("long_out.wav");
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let registry = Arc::new(registry);
            let request = OutputRequest::to_path(&target);
            let cancel = cancel.clone();
            async move { convert_with(registry, settings, &source, &request, cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(matches!(outcome.error, Some(ConvertError::Cancelled)));
        assert!(!target.exists());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "only the source should remain");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mp4_target_runs_through_ffmpeg() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tone.wav");
        fixtures::write_wav(&source, 8000, 1, SampleFormat::S16, 4000);
        let script = fixtures::write_script(
            dir.path(),
            "fake-ffmpeg",
            "for last; do :; done\necho out_time_us=500000\necho progress=end\nprintf mp4data > \"$last\"",
        );
        let registry = Arc::new(FormatRegistry::with_ffmpeg(Ffmpeg::new(script, "ffprobe")));

        let target = dir.path().join("tone.mp4");
        let outcome = convert_with(
            registry,
            EngineSettings::default(),
            &source,
            &OutputRequest::to_path(&target),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.state, JobState::Succeeded, "{:?}", outcome.error);
        assert_eq!(outcome.output.as_deref(), Some(target.as_path()));
        assert_eq!(outcome.bytes_written, 7);
        assert_eq!(std::fs::read(&target).unwrap(), b"mp4data");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "part").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ffmpeg_failure_fails_the_job() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tone.wav");
        fixtures::write_wav(&source, 8000, 1, SampleFormat::S16, 4000);
        let script = fixtures::write_script(
            dir.path(),
            "fake-ffmpeg",
            "for last; do :; done\nprintf half > \"$last\"\necho 'Conversion failed!' >&2\nexit 1",
        );
        let registry = Arc::new(FormatRegistry::with_ffmpeg(Ffmpeg::new(script, "ffprobe")));

        let target = dir.path().join("tone.mp4");
        let outcome = convert_with(
            registry,
            EngineSettings::default(),
            &source,
            &OutputRequest::to_path(&target),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.state, JobState::Failed);
        assert!(matches!(outcome.error, Some(ConvertError::Stage(StageError::External { .. }))));
        assert!(!target.exists());
        assert!(outcome.partial_output.is_none());
    }

    #[test]
    fn test_native_jobs_stay_in_process() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.wav");
        fixtures::write_wav(&source, 8000, 1, SampleFormat::S16, 100);
        let registry = FormatRegistry::with_defaults();
        let job = describe(&registry, &source, &OutputRequest::to_path(dir.path().join("b.avi")));
        let engine = PipelineEngine::new(job, Arc::new(registry), EngineSettings::default());
        assert!(engine.external_tool().is_none());

        let job = describe(&FormatRegistry::with_defaults(), &source, &OutputRequest::to_path(dir.path().join("b.mp4")));
        let engine = PipelineEngine::new(job, Arc::new(FormatRegistry::with_defaults()), EngineSettings::default());
        assert!(engine.external_tool().is_some());
    }

    #[test]
    fn test_temp_path_sits_beside_output() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.wav");
        fixtures::write_wav(&source, 8000, 1, SampleFormat::U8, 100);
        let registry = FormatRegistry::with_defaults();
        let job = describe(&registry, &source, &OutputRequest::to_path(dir.path().join("b.wav")));
        let engine = PipelineEngine::new(job, Arc::new(registry), EngineSettings::default());
        let temp = engine.temp_path();
        assert_eq!(temp.parent(), Some(dir.path()));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("b.wav."));
        assert!(name.ends_with(".part"));
    }
}
