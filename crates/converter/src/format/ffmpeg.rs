//! Containers handled by the ffmpeg command line tools.
//!
//! Probing runs `ffprobe -print_format json` and maps the report onto
//! [`MediaInfo`]. Jobs touching one of these containers are not split into
//! stages: the engine hands the whole job to a single `ffmpeg` process, follows
//! it through `-progress pipe:1` and kills it on cancellation.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::riff;
use super::{
    CodecCapability, CodecLimits, Decoder, DemuxOptions, Demuxer, Encoder, FormatError, FormatFamily, FormatResult, Muxer,
    ProbeSource,
};
use crate::error::StageError;
use crate::job::{JobDescriptor, StreamAction};
use crate::media::{CodecId, ContainerFormat, MediaInfo, PixelFormat, Rational, StreamInfo, StreamKind, StreamParams};
use crate::progress::{PipelinePhase, ProgressSink};

/// Containers registered with an ffmpeg-backed family
pub const CONTAINERS: [ContainerFormat; 8] = [
    ContainerFormat::Mp4,
    ContainerFormat::Mov,
    ContainerFormat::Webm,
    ContainerFormat::Png,
    ContainerFormat::Jpg,
    ContainerFormat::Webp,
    ContainerFormat::Avif,
    ContainerFormat::Heic,
];

/// stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Used when ffprobe reports no usable frame rate
const FALLBACK_FRAME_RATE: Rational = Rational::new(25, 1);

const MAX_DIMENSION: u32 = 16_384;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    pub format: ProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeFormat {
    pub format_name: String,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    pub index: usize,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pix_fmt: Option<String>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub sample_rate: Option<String>,
    pub channels: Option<u16>,
    pub duration: Option<String>,
    pub nb_frames: Option<String>,
    pub bit_rate: Option<String>,
    pub disposition: Option<HashMap<String, i32>>,
}

fn parse_field<T: FromStr>(value: &Option<String>) -> Option<T> {
    value.as_deref().and_then(|v| v.trim().parse().ok())
}

/// `"30000/1001"` style rates; zero terms mean unknown
fn parse_rate(value: Option<&str>) -> Option<Rational> {
    let (num, den) = value?.split_once('/')?;
    let rate = Rational::new(num.trim().parse().ok()?, den.trim().parse().ok()?);
    (rate.num > 0 && rate.den > 0).then_some(rate)
}

impl ProbeStream {
    fn is_attached_picture(&self) -> bool {
        self.disposition
            .as_ref()
            .and_then(|d| d.get("attached_pic"))
            .map(|v| *v != 0)
            .unwrap_or(false)
    }

    /// `None` for data, attachment and cover-art streams
    fn to_stream_info(&self, container: ContainerFormat, fallback_duration: Option<f64>) -> FormatResult<Option<StreamInfo>> {
        if self.is_attached_picture() {
            return Ok(None);
        }
        let duration = parse_field::<f64>(&self.duration)
            .or(fallback_duration)
            .filter(|d| d.is_finite() && *d >= 0.0);
        let codec = match self.codec_name.as_deref() {
            Some(name) => name.parse().unwrap_or_else(|_| CodecId::Other(name.to_string())),
            None => CodecId::Other("unknown".to_string()),
        };

        let (params, frames) = match self.codec_type.as_deref() {
            Some("audio") => {
                let sample_rate = parse_field::<u32>(&self.sample_rate)
                    .filter(|r| *r > 0)
                    .ok_or_else(|| FormatError::malformed(format!("audio stream {} has no sample rate", self.index)))?;
                let channels = self
                    .channels
                    .filter(|c| *c > 0)
                    .ok_or_else(|| FormatError::malformed(format!("audio stream {} has no channels", self.index)))?;
                let frames = duration.map(|d| (d * sample_rate as f64).round() as u64);
                (StreamParams::Audio { sample_rate, channels }, frames)
            }
            Some("video") => {
                let (width, height) = match (self.width, self.height) {
                    (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                    _ => return Err(FormatError::malformed(format!("video stream {} has no picture size", self.index))),
                };
                let frame_rate = parse_rate(self.r_frame_rate.as_deref())
                    .or_else(|| parse_rate(self.avg_frame_rate.as_deref()))
                    .unwrap_or(FALLBACK_FRAME_RATE);
                let frames = if container.is_image() {
                    Some(1)
                } else {
                    parse_field::<u64>(&self.nb_frames)
                        .or_else(|| duration.map(|d| (d * frame_rate.as_f64()).round() as u64))
                };
                let pixel_format = self.pix_fmt.as_deref().and_then(|p| p.parse::<PixelFormat>().ok());
                (StreamParams::Video { width, height, frame_rate, pixel_format }, frames)
            }
            Some("subtitle") => (StreamParams::Subtitle, duration.map(|d| (d * 1000.0).round() as u64)),
            _ => return Ok(None),
        };

        let mut info = StreamInfo::new(self.index, codec, params, frames);
        if let Some(rate) = parse_field::<u64>(&self.bit_rate) {
            info.bitrate = Some(rate);
        }
        Ok(Some(info))
    }
}

impl ProbeReport {
    pub fn to_media_info(&self, path: &Path, container: ContainerFormat, file_size: u64) -> FormatResult<MediaInfo> {
        let fallback = parse_field::<f64>(&self.format.duration);
        let mut streams = Vec::new();
        for stream in &self.streams {
            if let Some(info) = stream.to_stream_info(container, fallback)? {
                streams.push(info);
            }
        }
        if streams.is_empty() {
            return Err(FormatError::malformed(format!(
                "ffprobe found no audio, video or subtitle streams ({})",
                self.format.format_name
            )));
        }
        Ok(MediaInfo::new(path.to_path_buf(), container, streams, file_size))
    }
}

/// Brands in an ISO base media `ftyp` box: major first, then compatible ones
fn ftyp_brands(header: &[u8]) -> Vec<&[u8]> {
    let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let end = size.min(header.len());
    let mut brands = vec![&header[8..12]];
    if let Some(compatible) = header.get(16..end) {
        brands.extend(compatible.chunks_exact(4));
    }
    brands
}

const HEIF_BRANDS: [&[u8]; 6] = [b"heic", b"heix", b"heim", b"heis", b"hevc", b"hevx"];

fn sniff_iso(header: &[u8]) -> Option<ContainerFormat> {
    if header.len() < 12 {
        return None;
    }
    match &header[4..8] {
        b"ftyp" => {}
        // QuickTime files from before ftyp existed start straight with a top-level atom
        b"moov" | b"mdat" | b"wide" => return Some(ContainerFormat::Mov),
        _ => return None,
    }
    let brands = ftyp_brands(header);
    let major = brands[0];
    let has = |want: &[u8]| brands.iter().any(|b| *b == want);
    if major == b"qt  " {
        Some(ContainerFormat::Mov)
    } else if major == b"avif" || major == b"avis" || (major == b"mif1" || major == b"msf1") && has(b"avif") {
        Some(ContainerFormat::Avif)
    } else if HEIF_BRANDS.contains(&major) || major == b"mif1" || major == b"msf1" {
        Some(ContainerFormat::Heic)
    } else {
        Some(ContainerFormat::Mp4)
    }
}

/// Container of a file from its first bytes, for the formats ffmpeg handles here
pub fn sniff_container(header: &[u8]) -> Option<ContainerFormat> {
    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(ContainerFormat::Png);
    }
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ContainerFormat::Jpg);
    }
    if riff::is_riff_form(header, b"WEBP") {
        return Some(ContainerFormat::Webp);
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        let doctype = &header[..header.len().min(64)];
        return doctype.windows(4).any(|w| w == b"webm").then_some(ContainerFormat::Webm);
    }
    sniff_iso(header)
}

/// Name of ffmpeg's muxer for `container`
pub fn muxer_name(container: ContainerFormat) -> Option<&'static str> {
    match container {
        ContainerFormat::Wav => Some("wav"),
        ContainerFormat::Avi => Some("avi"),
        ContainerFormat::Y4m => Some("yuv4mpegpipe"),
        ContainerFormat::Mp4 => Some("mp4"),
        ContainerFormat::Mov => Some("mov"),
        ContainerFormat::Webm => Some("webm"),
        ContainerFormat::Png | ContainerFormat::Jpg | ContainerFormat::Webp => Some("image2"),
        ContainerFormat::Avif => Some("avif"),
        ContainerFormat::Heic => None,
    }
}

/// Name of the ffmpeg encoder producing `codec` inside `container`
pub fn encoder_name(container: ContainerFormat, codec: &CodecId) -> Option<&'static str> {
    use crate::media::SampleFormat;
    let name = match codec {
        CodecId::Pcm(SampleFormat::U8) => "pcm_u8",
        CodecId::Pcm(SampleFormat::S16) => "pcm_s16le",
        CodecId::Pcm(SampleFormat::S24) => "pcm_s24le",
        CodecId::Pcm(SampleFormat::F32) => "pcm_f32le",
        CodecId::ImaAdpcm => "adpcm_ima_wav",
        // the y4m muxer only takes wrapped frames
        CodecId::RawVideo if container == ContainerFormat::Y4m => "wrapped_avframe",
        CodecId::RawVideo => "rawvideo",
        CodecId::H264 => "libx264",
        CodecId::Av1 => "libaom-av1",
        CodecId::Aac => "aac",
        CodecId::Opus => "libopus",
        CodecId::Png => "png",
        CodecId::Mjpeg => "mjpeg",
        CodecId::Webp => "libwebp",
        CodecId::Other(_) => return None,
    };
    Some(name)
}

/// Command line converting `job` into `temp`
pub fn conversion_args(job: &JobDescriptor, temp: &Path) -> Result<Vec<OsString>, StageError> {
    let container = job.container();
    let unsupported = |message: String| StageError::External { tool: "ffmpeg".to_string(), message };
    let muxer = muxer_name(container).ok_or_else(|| unsupported(format!("ffmpeg cannot write {}", container)))?;

    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-v", "error", "-nostats", "-progress", "pipe:1", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(job.input().as_os_str().to_os_string());
    let mut push = |values: &[String]| args.extend(values.iter().map(OsString::from));

    for plan in job.streams() {
        push(&["-map".to_string(), format!("0:{}", plan.source.index)]);
    }
    for plan in job.streams() {
        let out = plan.output_index();
        if plan.action == StreamAction::Copy {
            push(&[format!("-c:{}", out), "copy".to_string()]);
            continue;
        }
        let encoder = encoder_name(container, &plan.target.codec).ok_or_else(|| StageError::Encode {
            stream: plan.source.index,
            message: format!("no ffmpeg encoder for {}", plan.target.codec),
        })?;
        push(&[format!("-c:{}", out), encoder.to_string()]);
        match &plan.target.params {
            StreamParams::Audio { sample_rate, channels } => {
                push(&[format!("-ar:{}", out), sample_rate.to_string()]);
                push(&[format!("-ac:{}", out), channels.to_string()]);
            }
            StreamParams::Video { width, height, pixel_format, .. } => {
                if plan.source.dimensions() != Some((*width, *height)) {
                    push(&[format!("-s:{}", out), format!("{}x{}", width, height)]);
                }
                if let Some(pix) = pixel_format {
                    push(&[format!("-pix_fmt:{}", out), pix.name().to_string()]);
                }
            }
            StreamParams::Subtitle => {}
        }
        // constant-rate codecs have no bitrate knob
        if let Some(rate) = plan.target.bitrate.filter(|_| plan.target.codec.bitrate(&plan.target.params).is_none()) {
            push(&[format!("-b:{}", out), rate.to_string()]);
        }
    }

    if container.is_image() {
        push(&["-frames:v".to_string(), "1".to_string()]);
        if muxer == "image2" {
            push(&["-update".to_string(), "1".to_string()]);
        }
    }
    push(&["-f".to_string(), muxer.to_string()]);
    args.push(temp.as_os_str().to_os_string());
    Ok(args)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProgressLine {
    /// Seconds of output written so far
    Position(f64),
    End,
}

/// One `key=value` line of `-progress` output
fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.split_once('=')?;
    let value = value.trim();
    match key.trim() {
        // out_time_ms is microseconds too
        "out_time_us" | "out_time_ms" => value
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| ProgressLine::Position(us as f64 / 1_000_000.0)),
        "progress" if value == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

/// Locations of the ffmpeg and ffprobe binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ffmpeg {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Ffmpeg {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    /// Run ffprobe on `path` and parse the JSON output
    pub fn probe_report(&self, path: &Path) -> FormatResult<ProbeReport> {
        debug!("Executing FFprobe for: {}", path.display());
        let output = std::process::Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FormatError::unsupported(format!("cannot run {}: {}", self.ffprobe_bin.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FormatError::malformed(format!(
                "ffprobe failed (exit code {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| FormatError::malformed(format!("cannot parse ffprobe JSON: {}", e)))
    }

    /// Run ffmpeg for `job`, writing to `temp`.
    ///
    /// Returns the size of the written file, or `None` when `cancel` fired and
    /// the process was killed.
    pub async fn convert(
        &self,
        job: &JobDescriptor,
        temp: &Path,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<Option<u64>, StageError> {
        let failed = |message: String| StageError::External { tool: "ffmpeg".to_string(), message };
        let args = conversion_args(job, temp)?;
        debug!(
            "Executing FFmpeg: {} {}",
            self.ffmpeg_bin.display(),
            args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
        );

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("cannot run {}: {}", self.ffmpeg_bin.display(), e)))?;
        let stdout = child.stdout.take().ok_or_else(|| failed("stdout was not captured".to_string()))?;
        let stderr = child.stderr.take().ok_or_else(|| failed("stderr was not captured".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        progress.advance(PipelinePhase::Transcoding);
        let total = job.source().duration.as_secs_f64();
        let mut lines = BufReader::new(stdout).lines();
        let cancelled = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_progress_line(&line) {
                        Some(ProgressLine::Position(seconds)) if total > 0.0 => progress.fraction(seconds / total),
                        Some(ProgressLine::End) => {
                            progress.advance(PipelinePhase::Finalizing);
                        }
                        _ => {}
                    },
                    // stdout closes when the process exits
                    Ok(None) | Err(_) => break false,
                },
            }
        };

        let status = if cancelled {
            None
        } else {
            tokio::select! {
                _ = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            }
        };
        let Some(status) = status else {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop ffmpeg: {}", e);
            }
            stderr_task.abort();
            return Ok(None);
        };

        let status = status.map_err(|e| failed(format!("cannot wait for ffmpeg: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(failed(format!(
                "exit code {}: {}",
                status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let bytes = tokio::fs::metadata(temp)
            .await
            .map(|m| m.len())
            .map_err(|e| failed(format!("no output at {}: {}", temp.display(), e)))?;
        progress.fraction(1.0);
        info!("FFmpeg execution completed successfully");
        Ok(Some(bytes))
    }
}

/// A container family probed by ffprobe and converted by ffmpeg
pub struct FfmpegFamily {
    container: ContainerFormat,
    tool: Arc<Ffmpeg>,
}

impl FfmpegFamily {
    pub fn new(container: ContainerFormat, tool: Arc<Ffmpeg>) -> Self {
        Self { container, tool }
    }

    fn whole_file(&self) -> FormatError {
        FormatError::unsupported(format!("{} files are converted by ffmpeg as a whole", self.container))
    }
}

fn video(codec: CodecId, width: std::ops::RangeInclusive<u32>, pixel_formats: Vec<PixelFormat>) -> CodecCapability {
    CodecCapability {
        codec,
        limits: CodecLimits::Video { width: width.clone(), height: width, pixel_formats },
    }
}

fn audio(codec: CodecId, sample_rate: std::ops::RangeInclusive<u32>) -> CodecCapability {
    CodecCapability {
        codec,
        limits: CodecLimits::Audio { sample_rate, channels: 1..=8 },
    }
}

impl FormatFamily for FfmpegFamily {
    fn container(&self) -> ContainerFormat {
        self.container
    }

    fn sniff(&self, header: &[u8]) -> bool {
        sniff_container(header) == Some(self.container)
    }

    fn probe(&self, source: &mut ProbeSource) -> FormatResult<MediaInfo> {
        let report = self.tool.probe_report(source.path())?;
        report.to_media_info(source.path(), self.container, source.file_size())
    }

    /// WebM and HEIC are read-only; an empty pixel format list leaves the choice to the encoder
    fn codecs(&self) -> Vec<CodecCapability> {
        match self.container {
            ContainerFormat::Mp4 | ContainerFormat::Mov => vec![
                video(CodecId::H264, 2..=8192, vec![PixelFormat::Yuv420p]),
                audio(CodecId::Aac, 8_000..=96_000),
            ],
            ContainerFormat::Png => vec![video(CodecId::Png, 1..=MAX_DIMENSION, Vec::new())],
            ContainerFormat::Jpg => vec![video(CodecId::Mjpeg, 1..=MAX_DIMENSION, Vec::new())],
            ContainerFormat::Webp => vec![video(CodecId::Webp, 1..=MAX_DIMENSION, Vec::new())],
            ContainerFormat::Avif => {
                vec![video(CodecId::Av1, 1..=MAX_DIMENSION, vec![PixelFormat::Yuv420p, PixelFormat::Yuv444p])]
            }
            _ => Vec::new(),
        }
    }

    fn max_streams(&self, kind: StreamKind) -> usize {
        match (self.container, kind) {
            (ContainerFormat::Mp4 | ContainerFormat::Mov, StreamKind::Video) => 1,
            (ContainerFormat::Mp4 | ContainerFormat::Mov, StreamKind::Audio) => 8,
            (ContainerFormat::Png | ContainerFormat::Jpg | ContainerFormat::Webp | ContainerFormat::Avif, StreamKind::Video) => 1,
            _ => 0,
        }
    }

    fn can_decode(&self, stream: &StreamInfo) -> bool {
        stream.kind != StreamKind::Subtitle
    }

    fn is_external(&self) -> bool {
        true
    }

    fn open_demuxer(&self, _path: &Path, _options: &DemuxOptions) -> FormatResult<Box<dyn Demuxer>> {
        Err(self.whole_file())
    }

    fn decoder(&self, _stream: &StreamInfo) -> FormatResult<Box<dyn Decoder>> {
        Err(self.whole_file())
    }

    fn encoder(&self, _target: &StreamInfo) -> FormatResult<Box<dyn Encoder>> {
        Err(self.whole_file())
    }

    fn open_muxer(&self, _path: &Path, _streams: &[StreamInfo]) -> FormatResult<Box<dyn Muxer>> {
        Err(self.whole_file())
    }
}
