use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Container formats with a registered format family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Wav,
    Avi,
    Y4m,
    Mp4,
    Mov,
    Webm,
    Png,
    Jpg,
    Webp,
    Avif,
    Heic,
}

impl ContainerFormat {
    pub const ALL: [ContainerFormat; 11] = [
        ContainerFormat::Wav,
        ContainerFormat::Avi,
        ContainerFormat::Y4m,
        ContainerFormat::Mp4,
        ContainerFormat::Mov,
        ContainerFormat::Webm,
        ContainerFormat::Png,
        ContainerFormat::Jpg,
        ContainerFormat::Webp,
        ContainerFormat::Avif,
        ContainerFormat::Heic,
    ];

    /// Canonical file extension used when deriving output names
    pub fn extension(&self) -> &'static str {
        self.extensions()[0]
    }

    /// Every extension that maps to this container
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ContainerFormat::Wav => &["wav", "wave"],
            ContainerFormat::Avi => &["avi"],
            ContainerFormat::Y4m => &["y4m"],
            ContainerFormat::Mp4 => &["mp4", "m4v", "m4a"],
            ContainerFormat::Mov => &["mov", "qt"],
            ContainerFormat::Webm => &["webm"],
            ContainerFormat::Png => &["png"],
            ContainerFormat::Jpg => &["jpg", "jpeg"],
            ContainerFormat::Webp => &["webp"],
            ContainerFormat::Avif => &["avif"],
            ContainerFormat::Heic => &["heic", "heif"],
        }
    }

    /// Single-picture formats
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            ContainerFormat::Png | ContainerFormat::Jpg | ContainerFormat::Webp | ContainerFormat::Avif | ContainerFormat::Heic
        )
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ContainerFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim_start_matches('.'))
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|c| c.extension()).collect();
                format!("unknown container '{}' (expected one of {})", s, known.join(", "))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Subtitle => "subtitle",
        })
    }
}

/// Storage format of linear PCM samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::F32 => 4,
        }
    }

    pub fn bits(&self) -> u16 {
        (self.bytes_per_sample() * 8) as u16
    }
}

/// Layout of decoded video pictures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Yuv444p,
    Gray8,
    Bgr24,
}

impl PixelFormat {
    /// Dimensions and bytes-per-pixel of each plane for a picture of the given size
    pub fn planes(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Yuv420p => {
                let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
                vec![
                    PlaneLayout { width: w, height: h, bytes_per_pixel: 1 },
                    PlaneLayout { width: cw, height: ch, bytes_per_pixel: 1 },
                    PlaneLayout { width: cw, height: ch, bytes_per_pixel: 1 },
                ]
            }
            PixelFormat::Yuv444p => vec![PlaneLayout { width: w, height: h, bytes_per_pixel: 1 }; 3],
            PixelFormat::Gray8 => vec![PlaneLayout { width: w, height: h, bytes_per_pixel: 1 }],
            PixelFormat::Bgr24 => vec![PlaneLayout { width: w, height: h, bytes_per_pixel: 3 }],
        }
    }

    /// Bytes of one tightly packed picture
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.planes(width, height).iter().map(PlaneLayout::len).sum()
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Gray8 => "gray",
            PixelFormat::Bgr24 => "bgr24",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yuv420p" => Ok(PixelFormat::Yuv420p),
            "yuv444p" => Ok(PixelFormat::Yuv444p),
            "gray" | "gray8" => Ok(PixelFormat::Gray8),
            "bgr24" => Ok(PixelFormat::Bgr24),
            other => Err(format!("unknown pixel format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
}

impl PlaneLayout {
    pub fn stride(&self) -> usize {
        self.width * self.bytes_per_pixel
    }

    pub fn len(&self) -> usize {
        self.stride() * self.height
    }
}

/// Codec identifier of an elementary stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecId {
    Pcm(SampleFormat),
    ImaAdpcm,
    RawVideo,
    H264,
    Av1,
    Aac,
    Opus,
    Png,
    Mjpeg,
    Webp,
    /// Anything a family can describe but not name (fourcc, format tag or tool codec name)
    Other(String),
}

impl CodecId {
    pub fn name(&self) -> String {
        match self {
            CodecId::Pcm(SampleFormat::U8) => "pcm_u8".to_string(),
            CodecId::Pcm(SampleFormat::S16) => "pcm_s16le".to_string(),
            CodecId::Pcm(SampleFormat::S24) => "pcm_s24le".to_string(),
            CodecId::Pcm(SampleFormat::F32) => "pcm_f32le".to_string(),
            CodecId::ImaAdpcm => "adpcm_ima_wav".to_string(),
            CodecId::RawVideo => "rawvideo".to_string(),
            CodecId::H264 => "h264".to_string(),
            CodecId::Av1 => "av1".to_string(),
            CodecId::Aac => "aac".to_string(),
            CodecId::Opus => "opus".to_string(),
            CodecId::Png => "png".to_string(),
            CodecId::Mjpeg => "mjpeg".to_string(),
            CodecId::Webp => "webp".to_string(),
            CodecId::Other(tag) => tag.clone(),
        }
    }

    pub fn kind(&self) -> Option<StreamKind> {
        match self {
            CodecId::Pcm(_) | CodecId::ImaAdpcm | CodecId::Aac | CodecId::Opus => Some(StreamKind::Audio),
            CodecId::RawVideo | CodecId::H264 | CodecId::Av1 | CodecId::Png | CodecId::Mjpeg | CodecId::Webp => {
                Some(StreamKind::Video)
            }
            CodecId::Other(_) => None,
        }
    }

    /// Bitrate of constant-rate codecs for the given parameters
    pub fn bitrate(&self, params: &StreamParams) -> Option<u64> {
        match (self, params) {
            (CodecId::Pcm(fmt), StreamParams::Audio { sample_rate, channels }) => {
                Some(*sample_rate as u64 * *channels as u64 * fmt.bits() as u64)
            }
            (CodecId::ImaAdpcm, StreamParams::Audio { sample_rate, channels }) => {
                Some(*sample_rate as u64 * *channels as u64 * 4)
            }
            (
                CodecId::RawVideo,
                StreamParams::Video { width, height, frame_rate, pixel_format: Some(pix) },
            ) => {
                let bits = pix.frame_size(*width, *height) as f64 * 8.0;
                Some((bits * frame_rate.as_f64()).round() as u64)
            }
            _ => None,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for CodecId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pcm_u8" => Ok(CodecId::Pcm(SampleFormat::U8)),
            "pcm_s16le" | "pcm_s16" => Ok(CodecId::Pcm(SampleFormat::S16)),
            "pcm_s24le" | "pcm_s24" => Ok(CodecId::Pcm(SampleFormat::S24)),
            "pcm_f32le" | "pcm_f32" => Ok(CodecId::Pcm(SampleFormat::F32)),
            "adpcm_ima_wav" | "ima_adpcm" | "adpcm" => Ok(CodecId::ImaAdpcm),
            "rawvideo" | "raw" => Ok(CodecId::RawVideo),
            "h264" | "avc" | "x264" | "libx264" => Ok(CodecId::H264),
            "av1" | "libaom-av1" => Ok(CodecId::Av1),
            "aac" => Ok(CodecId::Aac),
            "opus" | "libopus" => Ok(CodecId::Opus),
            "png" => Ok(CodecId::Png),
            "mjpeg" | "jpeg" | "jpg" => Ok(CodecId::Mjpeg),
            "webp" | "libwebp" => Ok(CodecId::Webp),
            other => Err(format!("unknown codec '{}'", other)),
        }
    }
}

/// Exact rational number, used for frame rates and time bases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    pub fn invert(&self) -> Self {
        Self { num: self.den, den: self.num }
    }

    /// Seconds covered by `ticks` units of this time base
    pub fn seconds(&self, ticks: u64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ticks as f64 * self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Kind-specific stream parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamParams {
    Audio {
        sample_rate: u32,
        channels: u16,
    },
    Video {
        width: u32,
        height: u32,
        frame_rate: Rational,
        /// Known only for uncompressed video
        pixel_format: Option<PixelFormat>,
    },
    Subtitle,
}

impl StreamParams {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamParams::Audio { .. } => StreamKind::Audio,
            StreamParams::Video { .. } => StreamKind::Video,
            StreamParams::Subtitle => StreamKind::Subtitle,
        }
    }

    /// Time base packets of this stream are stamped in
    pub fn time_base(&self) -> Rational {
        match self {
            StreamParams::Audio { sample_rate, .. } => Rational::new(1, *sample_rate),
            StreamParams::Video { frame_rate, .. } => frame_rate.invert(),
            StreamParams::Subtitle => Rational::new(1, 1000),
        }
    }
}

/// One elementary stream of a container, as probed or as planned for output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub codec: CodecId,
    pub params: StreamParams,
    pub time_base: Rational,
    /// Total length in time-base units (samples or pictures), when known
    pub frames: Option<u64>,
    pub duration: Duration,
    pub bitrate: Option<u64>,
}

impl StreamInfo {
    pub fn new(index: usize, codec: CodecId, params: StreamParams, frames: Option<u64>) -> Self {
        let time_base = params.time_base();
        let duration = frames
            .map(|n| Duration::from_secs_f64(time_base.seconds(n)))
            .unwrap_or_default();
        let bitrate = codec.bitrate(&params);
        Self {
            index,
            kind: params.kind(),
            codec,
            params,
            time_base,
            frames,
            duration,
            bitrate,
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        match self.params {
            StreamParams::Audio { sample_rate, .. } => Some(sample_rate),
            _ => None,
        }
    }

    pub fn channels(&self) -> Option<u16> {
        match self.params {
            StreamParams::Audio { channels, .. } => Some(channels),
            _ => None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.params {
            StreamParams::Video { width, height, .. } => Some((width, height)),
            _ => None,
        }
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self.params {
            StreamParams::Video { pixel_format, .. } => pixel_format,
            _ => None,
        }
    }
}

/// Container and stream metadata extracted by probing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub container: ContainerFormat,
    pub streams: Vec<StreamInfo>,
    pub duration: Duration,
    pub file_size: u64,
}

impl MediaInfo {
    pub fn new(path: PathBuf, container: ContainerFormat, streams: Vec<StreamInfo>, file_size: u64) -> Self {
        let duration = streams.iter().map(|s| s.duration).max().unwrap_or_default();
        Self {
            path,
            container,
            streams,
            duration,
            file_size,
        }
    }

    pub fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }

    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }
}

/// Compressed (or stored) data of one stream, as exchanged between demux, decode, encode and mux
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    /// Presentation time in the stream's time base
    pub pts: u64,
    /// Length in the stream's time base
    pub duration: u64,
    pub data: Vec<u8>,
}

/// Interleaved samples normalised to [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub pts: u64,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// A decoded picture; packed formats use a single plane
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: u64,
    pub planes: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    /// Approximate heap size, used for buffer accounting
    pub fn byte_len(&self) -> usize {
        match self {
            Frame::Audio(a) => a.samples.len() * std::mem::size_of::<f32>(),
            Frame::Video(v) => v.planes.iter().map(Vec::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_from_extension() {
        assert_eq!(ContainerFormat::from_extension("WAV"), Some(ContainerFormat::Wav));
        assert_eq!(ContainerFormat::from_extension("wave"), Some(ContainerFormat::Wav));
        assert_eq!(".y4m".parse::<ContainerFormat>(), Ok(ContainerFormat::Y4m));
        assert_eq!(ContainerFormat::from_extension("JPEG"), Some(ContainerFormat::Jpg));
        assert_eq!(ContainerFormat::Mp4.extension(), "mp4");
        assert!(ContainerFormat::Heic.is_image());
        assert!(!ContainerFormat::Mov.is_image());
        assert!(ContainerFormat::from_extension("txt").is_none());
    }

    #[test]
    fn test_yuv420_planes_round_up_odd_sizes() {
        let planes = PixelFormat::Yuv420p.planes(5, 3);
        assert_eq!(planes[0].len(), 15);
        assert_eq!(planes[1].len(), 6);
        assert_eq!(PixelFormat::Yuv420p.frame_size(5, 3), 27);
        assert_eq!(PixelFormat::Bgr24.frame_size(4, 2), 24);
    }

    #[test]
    fn test_pcm_bitrate_and_duration() {
        let params = StreamParams::Audio { sample_rate: 48_000, channels: 2 };
        let stream = StreamInfo::new(0, CodecId::Pcm(SampleFormat::S16), params, Some(96_000));
        assert_eq!(stream.bitrate, Some(1_536_000));
        assert_eq!(stream.duration, Duration::from_secs(2));
        assert_eq!(stream.time_base, Rational::new(1, 48_000));
    }

    #[test]
    fn test_codec_names_parse_back() {
        for codec in [
            CodecId::Pcm(SampleFormat::U8),
            CodecId::Pcm(SampleFormat::S16),
            CodecId::Pcm(SampleFormat::S24),
            CodecId::Pcm(SampleFormat::F32),
            CodecId::ImaAdpcm,
            CodecId::RawVideo,
            CodecId::H264,
            CodecId::Av1,
            CodecId::Aac,
            CodecId::Opus,
            CodecId::Png,
            CodecId::Mjpeg,
            CodecId::Webp,
        ] {
            assert_eq!(codec.name().parse::<CodecId>(), Ok(codec));
        }
    }
}
