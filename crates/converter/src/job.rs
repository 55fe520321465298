//! Job descriptors: the validated, immutable description of one conversion.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::format::{CodecCapability, CodecLimits, FormatFamily, FormatRegistry};
use crate::media::{CodecId, ContainerFormat, MediaInfo, PixelFormat, StreamInfo, StreamKind, StreamParams};

/// Suffix appended to the input stem when no output path is given
pub const CONVERTED_SUFFIX: &str = "_converted";

/// Caller overrides for one stream (or every stream of a kind)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub codec: Option<CodecId>,
    /// Only meaningful as a check for constant-rate codecs
    pub bitrate: Option<u64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<PixelFormat>,
    pub drop: bool,
}

/// What the caller wants produced from a probed input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputRequest {
    /// Defaults to `<stem>_converted.<ext>` next to the input
    pub output: Option<PathBuf>,
    /// Defaults to the output extension, then to the input container
    pub container: Option<ContainerFormat>,
    pub audio: StreamRequest,
    pub video: StreamRequest,
    /// Per source stream index; replaces the kind-wide request
    pub streams: BTreeMap<usize, StreamRequest>,
    pub keep_partial: bool,
    pub overwrite: bool,
}

impl OutputRequest {
    pub fn to_container(container: ContainerFormat) -> Self {
        Self {
            container: Some(container),
            ..Self::default()
        }
    }

    pub fn to_path(output: impl Into<PathBuf>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    fn for_stream(&self, stream: &StreamInfo) -> StreamRequest {
        if let Some(req) = self.streams.get(&stream.index) {
            return req.clone();
        }
        match stream.kind {
            StreamKind::Audio => self.audio.clone(),
            StreamKind::Video => self.video.clone(),
            StreamKind::Subtitle => StreamRequest::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    /// Packets go straight from demux to mux
    Copy,
    /// Decode, transform if needed, encode
    Transcode,
}

/// How one source stream becomes one output stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPlan {
    pub source: StreamInfo,
    /// Output stream; `target.index` is the position in the output container
    pub target: StreamInfo,
    pub action: StreamAction,
}

impl StreamPlan {
    pub fn output_index(&self) -> usize {
        self.target.index
    }

    /// Sample rate, channel layout, size or pixel format change
    pub fn needs_transform(&self) -> bool {
        self.action == StreamAction::Transcode && self.source.params != self.target.params
    }

    /// Rough size of one buffered item on any link of this stream
    fn item_bytes(&self, audio_packet_frames: u32) -> u64 {
        let item = |s: &StreamInfo| match s.params {
            StreamParams::Audio { channels, .. } => audio_packet_frames as u64 * channels as u64 * 4,
            StreamParams::Video { width, height, .. } => width as u64 * height as u64 * 3,
            StreamParams::Subtitle => 0,
        };
        item(&self.source).max(item(&self.target))
    }

    fn links(&self) -> u64 {
        match self.action {
            StreamAction::Copy => 1,
            StreamAction::Transcode => 3,
        }
    }
}

/// A validated conversion. Only [`validate`] builds one, and it is consumed by
/// exactly one engine.
#[derive(Debug)]
pub struct JobDescriptor {
    source: MediaInfo,
    output: PathBuf,
    container: ContainerFormat,
    streams: Vec<StreamPlan>,
    dropped: Vec<usize>,
    keep_partial: bool,
}

impl JobDescriptor {
    pub fn input(&self) -> &Path {
        &self.source.path
    }

    pub fn source(&self) -> &MediaInfo {
        &self.source
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn container(&self) -> ContainerFormat {
        self.container
    }

    pub fn streams(&self) -> &[StreamPlan] {
        &self.streams
    }

    /// Source stream indices left out of the output
    pub fn dropped(&self) -> &[usize] {
        &self.dropped
    }

    pub fn keep_partial(&self) -> bool {
        self.keep_partial
    }

    /// Output streams in container order
    pub fn targets(&self) -> Vec<StreamInfo> {
        self.streams.iter().map(|p| p.target.clone()).collect()
    }

    /// Upper bound on bytes held in links while this job runs
    pub fn buffered_bytes(&self, buffer_packets: usize, audio_packet_frames: u32) -> u64 {
        self.streams
            .iter()
            .map(|p| p.item_bytes(audio_packet_frames) * p.links() * buffer_packets.max(1) as u64)
            .sum()
    }
}

/// `<dir>/<stem>_converted.<ext>`
pub fn derived_output_path(input: &Path, container: ContainerFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{}{}.{}", stem, CONVERTED_SUFFIX, container.extension()))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn check_writable(output: &Path) -> Result<(), ValidationError> {
    let not_writable = |reason: String| ValidationError::OutputNotWritable {
        path: output.to_path_buf(),
        reason,
    };
    if output.is_dir() {
        return Err(not_writable("path is a directory".to_string()));
    }
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let meta = fs::metadata(parent).map_err(|e| not_writable(format!("{}: {}", parent.display(), e)))?;
    if !meta.is_dir() {
        return Err(not_writable(format!("{} is not a directory", parent.display())));
    }
    if meta.permissions().readonly() {
        return Err(not_writable(format!("{} is read-only", parent.display())));
    }
    Ok(())
}

fn check_range<T: Into<u64> + Copy + PartialOrd>(
    stream: usize,
    codec: &CodecId,
    param: &'static str,
    value: T,
    range: &std::ops::RangeInclusive<T>,
) -> Result<(), ValidationError> {
    if range.contains(&value) {
        return Ok(());
    }
    Err(ValidationError::ParameterOutOfRange {
        stream,
        codec: codec.clone(),
        param,
        value: value.into(),
        min: (*range.start()).into(),
        max: (*range.end()).into(),
    })
}

/// Output parameters for `source` under `capability`, honouring `req`
fn target_params(
    source: &StreamInfo,
    capability: &CodecCapability,
    req: &StreamRequest,
    container: ContainerFormat,
) -> Result<StreamParams, ValidationError> {
    let index = source.index;
    match (&source.params, &capability.limits) {
        (StreamParams::Audio { sample_rate, channels }, CodecLimits::Audio { sample_rate: rates, channels: layouts }) => {
            let sample_rate = req.sample_rate.unwrap_or(*sample_rate);
            let channels = req.channels.unwrap_or(*channels);
            check_range(index, &capability.codec, "sample_rate", sample_rate, rates)?;
            check_range(index, &capability.codec, "channels", channels, layouts)?;
            Ok(StreamParams::Audio { sample_rate, channels })
        }
        (
            StreamParams::Video { width, height, frame_rate, pixel_format },
            CodecLimits::Video { width: widths, height: heights, pixel_formats },
        ) => {
            let width = req.width.unwrap_or(*width);
            let height = req.height.unwrap_or(*height);
            check_range(index, &capability.codec, "width", width, widths)?;
            check_range(index, &capability.codec, "height", height, heights)?;
            // an empty list leaves the pixel format to the encoder
            let pixel_format = match req.pixel_format {
                Some(pix) if pixel_formats.is_empty() || pixel_formats.contains(&pix) => Some(pix),
                Some(pix) => {
                    return Err(ValidationError::InvalidParameter {
                        stream: index,
                        reason: format!("pixel format {} is not supported by {}", pix, capability.codec),
                    })
                }
                None if pixel_formats.is_empty() => None,
                None => match pixel_format {
                    Some(pix) if pixel_formats.contains(pix) => Some(*pix),
                    _ => pixel_formats.first().copied(),
                },
            };
            if frame_rate.num == 0 || frame_rate.den == 0 {
                return Err(ValidationError::InvalidParameter {
                    stream: index,
                    reason: format!("frame rate {} is not usable", frame_rate),
                });
            }
            Ok(StreamParams::Video { width, height, frame_rate: *frame_rate, pixel_format })
        }
        _ => Err(ValidationError::UnsupportedCodec {
            stream: index,
            codec: capability.codec.clone(),
            container,
        }),
    }
}

/// Frame count of the output stream, scaled for resampling
fn target_frames(source: &StreamInfo, params: &StreamParams) -> Option<u64> {
    let frames = source.frames?;
    match (&source.params, params) {
        (StreamParams::Audio { sample_rate: from, .. }, StreamParams::Audio { sample_rate: to, .. }) if from != to => {
            Some((frames as u128 * *to as u128).div_ceil(*from as u128) as u64)
        }
        _ => Some(frames),
    }
}

/// Check `request` against the probed `info` and the registered families.
///
/// Pure apart from inspecting the output location.
pub fn validate(info: &MediaInfo, request: &OutputRequest, registry: &FormatRegistry) -> Result<JobDescriptor, ValidationError> {
    let (output, container) = match (&request.output, request.container) {
        (Some(output), Some(container)) => (output.clone(), container),
        (Some(output), None) => {
            let container = output
                .extension()
                .and_then(|e| e.to_str())
                .and_then(ContainerFormat::from_extension)
                .ok_or_else(|| ValidationError::UnknownTargetContainer(output.clone()))?;
            (output.clone(), container)
        }
        (None, container) => {
            let container = container.unwrap_or(info.container);
            (derived_output_path(&info.path, container), container)
        }
    };
    let family = registry
        .family(container)
        .ok_or(ValidationError::UnregisteredContainer(container))?;
    let source_family = registry.family(info.container);

    if same_file(&output, &info.path) {
        return Err(ValidationError::OutputIsInput(output));
    }
    if output.exists() && !request.overwrite {
        return Err(ValidationError::OutputExists(output));
    }
    check_writable(&output)?;

    let mut plans: Vec<StreamPlan> = Vec::new();
    let mut dropped = Vec::new();
    for source in &info.streams {
        let req = request.for_stream(source);
        if req.drop {
            dropped.push(source.index);
            continue;
        }
        let carried = plans.iter().filter(|p| p.source.kind == source.kind).count();
        if carried >= family.max_streams(source.kind) {
            debug!("{} carries at most {} {} stream(s)", container, carried, source.kind);
            return Err(ValidationError::UnsupportedStreamKind {
                stream: source.index,
                kind: source.kind,
                container,
            });
        }
        let plan = plan_stream(
            source,
            &req,
            plans.len(),
            container,
            family.as_ref(),
            info.container,
            source_family.as_deref(),
            registry.tool().is_some(),
        )?;
        plans.push(plan);
    }
    if plans.is_empty() {
        return Err(ValidationError::NoStreams);
    }

    Ok(JobDescriptor {
        source: info.clone(),
        output,
        container,
        streams: plans,
        dropped,
        keep_partial: request.keep_partial,
    })
}

#[allow(clippy::too_many_arguments)]
fn plan_stream(
    source: &StreamInfo,
    req: &StreamRequest,
    output_index: usize,
    container: ContainerFormat,
    family: &dyn FormatFamily,
    source_container: ContainerFormat,
    source_family: Option<&dyn FormatFamily>,
    tool_available: bool,
) -> Result<StreamPlan, ValidationError> {
    let same_family = source_container == container;
    let codec = match &req.codec {
        Some(codec) => codec.clone(),
        None if family.capability(&source.codec).is_some() => source.codec.clone(),
        None => family.default_codec(source.kind).ok_or(ValidationError::UnsupportedStreamKind {
            stream: source.index,
            kind: source.kind,
            container,
        })?,
    };
    let capability = family
        .capability(&codec)
        .filter(|c| c.kind() == source.kind)
        .ok_or_else(|| ValidationError::UnsupportedCodec {
            stream: source.index,
            codec: codec.clone(),
            container,
        })?;
    let params = target_params(source, &capability, req, container)?;

    let mut target = StreamInfo::new(output_index, codec.clone(), params.clone(), target_frames(source, &params));
    if let Some(requested) = req.bitrate {
        match target.bitrate {
            Some(rate) if rate == requested => {}
            Some(rate) => {
                return Err(ValidationError::ParameterOutOfRange {
                    stream: source.index,
                    codec,
                    param: "bitrate",
                    value: requested,
                    min: rate,
                    max: rate,
                })
            }
            None => target.bitrate = Some(requested),
        }
    }

    let action = if same_family && codec == source.codec && params == source.params {
        StreamAction::Copy
    } else {
        StreamAction::Transcode
    };
    // ffmpeg decodes whatever the built-in families cannot, subtitles aside
    let decodable = source_family.map(|f| f.can_decode(source)).unwrap_or(false)
        || (tool_available && source.kind != StreamKind::Subtitle);
    if action == StreamAction::Transcode && !decodable {
        return Err(ValidationError::UndecodableSource {
            stream: source.index,
            codec: source.codec.clone(),
        });
    }
    debug!("stream {} -> output {}: {:?} as {}", source.index, output_index, action, codec);
    Ok(StreamPlan { source: source.clone(), target, action })
}
