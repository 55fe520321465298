//! Codec capability providers.
//!
//! Every supported container family implements [`FormatFamily`], which bundles
//! sniffing, probing, demuxing, decoding, encoding and muxing for that family.
//! The engine only ever talks to these traits; the family is picked when the
//! input is probed and when the job descriptor names the target container.

pub mod avi;
pub mod ffmpeg;
pub mod pcm;
pub mod rawvideo;
pub mod riff;
pub mod wav;
pub mod y4m;
mod adpcm;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::media::{CodecId, ContainerFormat, Frame, MediaInfo, Packet, PixelFormat, StreamInfo, StreamKind};
use ffmpeg::{Ffmpeg, FfmpegFamily};

/// Errors raised by format family implementations
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed data: {0}")]
    Malformed(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl FormatError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        FormatError::Malformed(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        FormatError::Unsupported(msg.into())
    }
}

pub type FormatResult<T> = Result<T, FormatError>;

/// Parameter limits of an encodable codec inside a container
#[derive(Debug, Clone, PartialEq)]
pub enum CodecLimits {
    Audio {
        sample_rate: RangeInclusive<u32>,
        channels: RangeInclusive<u16>,
    },
    Video {
        width: RangeInclusive<u32>,
        height: RangeInclusive<u32>,
        pixel_formats: Vec<PixelFormat>,
    },
}

/// One codec a family can encode and mux
#[derive(Debug, Clone, PartialEq)]
pub struct CodecCapability {
    pub codec: CodecId,
    pub limits: CodecLimits,
}

impl CodecCapability {
    pub fn kind(&self) -> StreamKind {
        match self.limits {
            CodecLimits::Audio { .. } => StreamKind::Audio,
            CodecLimits::Video { .. } => StreamKind::Video,
        }
    }
}

/// Knobs the engine passes down to demuxers
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Sample frames per packet for containers without natural packet boundaries
    pub audio_packet_frames: u32,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self { audio_packet_frames: 4096 }
    }
}

/// Bounded, read-only view of an input file handed to [`FormatFamily::probe`]
pub struct ProbeSource {
    path: PathBuf,
    file: File,
    header: Vec<u8>,
    file_size: u64,
}

impl ProbeSource {
    /// Open `path` and read at most `max_header` bytes from its start
    pub fn open(path: &Path, max_header: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut header = Vec::with_capacity(max_header.min(file_size as usize));
        (&file).take(max_header as u64).read_to_end(&mut header)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            file_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Read `buf.len()` bytes at `offset`, served from the header when possible
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset as usize + buf.len();
        if end <= self.header.len() {
            buf.copy_from_slice(&self.header[offset as usize..end]);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }
}

/// Splits a container into packets, in file order
pub trait Demuxer: Send {
    fn read_packet(&mut self) -> FormatResult<Option<Packet>>;
}

/// Turns packets of one stream into frames
pub trait Decoder: Send {
    fn decode(&mut self, packet: Packet) -> FormatResult<Vec<Frame>>;

    fn flush(&mut self) -> FormatResult<Vec<Frame>> {
        Ok(Vec::new())
    }
}

/// Turns frames into packets of one output stream
pub trait Encoder: Send {
    fn encode(&mut self, frame: Frame) -> FormatResult<Vec<Packet>>;

    fn flush(&mut self) -> FormatResult<Vec<Packet>> {
        Ok(Vec::new())
    }
}

/// Writes packets of every output stream into one container file
pub trait Muxer: Send {
    fn write_packet(&mut self, packet: Packet) -> FormatResult<()>;

    /// Write trailers and patch headers; returns the final file size
    fn finish(self: Box<Self>) -> FormatResult<u64>;
}

/// Capability provider for one container family
pub trait FormatFamily: Send + Sync {
    fn container(&self) -> ContainerFormat;

    /// Cheap magic-number check on the first bytes of a file
    fn sniff(&self, header: &[u8]) -> bool;

    fn probe(&self, source: &mut ProbeSource) -> FormatResult<MediaInfo>;

    /// Codecs this family can encode and mux
    fn codecs(&self) -> Vec<CodecCapability>;

    /// Upper bound on output streams of a kind
    fn max_streams(&self, kind: StreamKind) -> usize;

    fn can_decode(&self, stream: &StreamInfo) -> bool;

    /// Jobs touching this family run as one external process instead of stages
    fn is_external(&self) -> bool {
        false
    }

    fn open_demuxer(&self, path: &Path, options: &DemuxOptions) -> FormatResult<Box<dyn Demuxer>>;

    fn decoder(&self, stream: &StreamInfo) -> FormatResult<Box<dyn Decoder>>;

    fn encoder(&self, target: &StreamInfo) -> FormatResult<Box<dyn Encoder>>;

    fn open_muxer(&self, path: &Path, streams: &[StreamInfo]) -> FormatResult<Box<dyn Muxer>>;

    fn capability(&self, codec: &CodecId) -> Option<CodecCapability> {
        self.codecs().into_iter().find(|c| &c.codec == codec)
    }

    /// First listed codec of a kind is the family default
    fn default_codec(&self, kind: StreamKind) -> Option<CodecId> {
        self.codecs().into_iter().find(|c| c.kind() == kind).map(|c| c.codec)
    }
}

/// The set of format families known to a converter
#[derive(Clone, Default)]
pub struct FormatRegistry {
    families: Vec<Arc<dyn FormatFamily>>,
    tool: Option<Arc<Ffmpeg>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with only the built-in WAV, AVI and Y4M families
    pub fn native() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(wav::WavFamily));
        registry.register(Arc::new(avi::AviFamily));
        registry.register(Arc::new(y4m::Y4mFamily));
        registry
    }

    /// Built-in families plus the ffmpeg-backed ones, run through `tool`
    pub fn with_ffmpeg(tool: Ffmpeg) -> Self {
        let mut registry = Self::native();
        let tool = Arc::new(tool);
        for container in ffmpeg::CONTAINERS {
            registry.register(Arc::new(FfmpegFamily::new(container, tool.clone())));
        }
        registry.tool = Some(tool);
        registry
    }

    /// Every family, with ffmpeg and ffprobe looked up on `PATH`
    pub fn with_defaults() -> Self {
        Self::with_ffmpeg(Ffmpeg::default())
    }

    /// Later registrations for the same container replace earlier ones
    pub fn register(&mut self, family: Arc<dyn FormatFamily>) {
        self.families.retain(|f| f.container() != family.container());
        self.families.push(family);
    }

    pub fn family(&self, container: ContainerFormat) -> Option<Arc<dyn FormatFamily>> {
        self.families.iter().find(|f| f.container() == container).cloned()
    }

    /// External converter for streams the built-in families cannot handle
    pub fn tool(&self) -> Option<Arc<Ffmpeg>> {
        self.tool.clone()
    }

    pub fn detect(&self, header: &[u8]) -> Option<Arc<dyn FormatFamily>> {
        self.families.iter().find(|f| f.sniff(header)).cloned()
    }

    pub fn containers(&self) -> Vec<ContainerFormat> {
        self.families.iter().map(|f| f.container()).collect()
    }

    /// File extensions of every registered container, lowercase
    pub fn extensions(&self) -> Vec<&'static str> {
        self.families
            .iter()
            .flat_map(|f| f.container().extensions().iter().copied())
            .collect()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("containers", &self.containers())
            .field("tool", &self.tool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_detects_magic() {
        let registry = FormatRegistry::with_defaults();
        let wav = b"RIFF\x24\x00\x00\x00WAVEfmt ";
        let avi = b"RIFF\x24\x00\x00\x00AVI LIST";
        let y4m = b"YUV4MPEG2 W2 H2 F25:1\n";

        assert_eq!(registry.detect(wav).map(|f| f.container()), Some(ContainerFormat::Wav));
        assert_eq!(registry.detect(avi).map(|f| f.container()), Some(ContainerFormat::Avi));
        assert_eq!(registry.detect(y4m).map(|f| f.container()), Some(ContainerFormat::Y4m));
        assert!(registry.detect(b"").is_none());
        assert_eq!(
            registry.detect(b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00isommp42").map(|f| f.container()),
            Some(ContainerFormat::Mp4)
        );
        assert_eq!(
            registry.detect(b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR").map(|f| f.container()),
            Some(ContainerFormat::Png)
        );
        assert!(registry.detect(b"\x00\x00\x00\x18ftypmp42").is_some_and(|f| f.is_external()));

        let native = FormatRegistry::native();
        assert!(native.detect(b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00isom").is_none());
        assert!(native.tool().is_none());
    }

    #[test]
    fn test_register_replaces_same_container() {
        let mut registry = FormatRegistry::native();
        registry.register(Arc::new(wav::WavFamily));
        assert_eq!(registry.containers().len(), 3);
        assert!(registry.extensions().contains(&"wave"));

        let full = FormatRegistry::with_defaults();
        assert_eq!(full.containers().len(), ContainerFormat::ALL.len());
        assert!(full.extensions().contains(&"mp4"));
        assert!(full.tool().is_some());
    }

    #[test]
    fn test_probe_source_reads_past_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bytes.bin");
        std::fs::write(&path, (0u8..=255).collect::<Vec<_>>()).unwrap();

        let mut source = ProbeSource::open(&path, 16).unwrap();
        assert_eq!(source.header().len(), 16);
        assert_eq!(source.file_size(), 256);

        let mut buf = [0u8; 4];
        source.read_at(200, &mut buf).unwrap();
        assert_eq!(buf, [200, 201, 202, 203]);
        source.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4, 5]);
    }
}
