//! AVI 1.0 (RIFF `AVI `) with uncompressed `DIB ` video and PCM audio.
//!
//! Layout written and expected:
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl'
//!     avih
//!     LIST 'strl' { strh, strf }   one per stream
//!   LIST 'movi'
//!     00db / 01wb ...              stream number + chunk type
//!   idx1
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::media::{
    CodecId, ContainerFormat, MediaInfo, Packet, PixelFormat, Rational, SampleFormat, StreamInfo, StreamKind,
    StreamParams,
};
use super::pcm::{PcmDecoder, PcmEncoder};
use super::rawvideo::{self, RawVideoDecoder, RawVideoEncoder, RowLayout};
use super::riff::{self, ChunkHeader, FourCc, WaveFormat};
use super::wav;
use super::{
    CodecCapability, CodecLimits, Decoder, DemuxOptions, Demuxer, Encoder, FormatError, FormatFamily, FormatResult,
    Muxer, ProbeSource,
};

const LAYOUT_HEADER_BYTES: usize = 64 * 1024;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const BI_RGB: u32 = 0;
const MAX_AVI_STREAMS: usize = 100;

pub struct AviFamily;

/// One stream as described by its `strl` list
#[derive(Debug, Clone)]
struct AviStream {
    info: StreamInfo,
    /// Bytes per sample frame for audio, zero for video
    block_align: u64,
    rows: RowLayout,
}

struct AviLayout {
    streams: Vec<AviStream>,
    /// Payload of `LIST movi`, starting after the list type
    movi_start: u64,
    movi_end: u64,
}

fn find_list(source: &mut ProbeSource, start: u64, end: u64, list_type: &FourCc) -> FormatResult<Option<ChunkHeader>> {
    let mut pos = start;
    while pos + 12 <= end {
        let chunk = riff::read_chunk_header_at(source, pos)?;
        if &chunk.id == b"LIST" {
            let mut kind = [0u8; 4];
            source.read_at(chunk.offset, &mut kind)?;
            if &kind == list_type {
                return Ok(Some(chunk));
            }
        }
        pos = chunk.end();
    }
    Ok(None)
}

fn read_payload(source: &mut ProbeSource, chunk: &ChunkHeader, max: usize) -> FormatResult<Vec<u8>> {
    let mut buf = vec![0u8; (chunk.size as usize).min(max)];
    source.read_at(chunk.offset, &mut buf)?;
    Ok(buf)
}

/// Parse one `strl` list into a stream description
fn parse_strl(source: &mut ProbeSource, list: &ChunkHeader, index: usize) -> FormatResult<AviStream> {
    let (start, end) = (list.offset + 4, list.offset + list.size as u64);
    let strh = riff::find_chunk(source, start, end, b"strh")?
        .ok_or_else(|| FormatError::malformed(format!("stream {} has no strh", index)))?;
    let strf = riff::find_chunk(source, start, end, b"strf")?
        .ok_or_else(|| FormatError::malformed(format!("stream {} has no strf", index)))?;
    let strh = read_payload(source, &strh, 64)?;
    let strf = read_payload(source, &strf, 256)?;
    if strh.len() < 36 {
        return Err(FormatError::malformed(format!("stream {} strh is {} bytes", index, strh.len())));
    }
    let fcc_type = riff::fourcc(&strh, 0);
    let scale = riff::le_u32(&strh, 20);
    let rate = riff::le_u32(&strh, 24);
    let length = riff::le_u32(&strh, 32) as u64;

    match &fcc_type {
        b"vids" => {
            if strf.len() < 20 {
                return Err(FormatError::malformed(format!("stream {} BITMAPINFOHEADER is {} bytes", index, strf.len())));
            }
            if scale == 0 || rate == 0 {
                return Err(FormatError::malformed(format!("stream {} has frame rate {}/{}", index, rate, scale)));
            }
            let width = riff::le_i32(&strf, 4);
            let height = riff::le_i32(&strf, 8);
            let bit_count = riff::le_u16(&strf, 14);
            let compression = riff::le_u32(&strf, 16);
            if width <= 0 || height == 0 {
                return Err(FormatError::malformed(format!("stream {} has size {}x{}", index, width, height)));
            }
            let (codec, pixel_format) = match (compression, bit_count) {
                (BI_RGB, 24) => (CodecId::RawVideo, Some(PixelFormat::Bgr24)),
                (BI_RGB, bits) => (CodecId::Other(format!("rgb{}", bits)), None),
                (fcc, _) => {
                    let tag = riff::fourcc_str(&fcc.to_le_bytes());
                    (CodecId::Other(tag.trim().to_lowercase()), None)
                }
            };
            // positive height means bottom-up rows
            let rows = if height > 0 { RowLayout::BottomUpDword } else { RowLayout::TopDownDword };
            let params = StreamParams::Video {
                width: width as u32,
                height: height.unsigned_abs(),
                frame_rate: Rational::new(rate, scale),
                pixel_format,
            };
            Ok(AviStream {
                info: StreamInfo::new(index, codec, params, Some(length)),
                block_align: 0,
                rows,
            })
        }
        b"auds" => {
            let format = WaveFormat::parse(&strf)?;
            if format.channels == 0 || format.sample_rate == 0 || format.block_align == 0 {
                return Err(FormatError::malformed(format!("stream {} has a degenerate WAVEFORMATEX", index)));
            }
            let codec = wav::codec_for(&format);
            let frames = match codec {
                CodecId::Pcm(_) => Some(length * scale.max(1) as u64 / format.block_align as u64),
                _ => None,
            };
            let params = StreamParams::Audio {
                sample_rate: format.sample_rate,
                channels: format.channels,
            };
            let mut info = StreamInfo::new(index, codec, params, frames);
            if info.bitrate.is_none() {
                info.bitrate = Some(format.byte_rate as u64 * 8);
            }
            Ok(AviStream {
                info,
                block_align: format.block_align as u64,
                rows: RowLayout::TopDown,
            })
        }
        other => {
            debug!("avi stream {} of type {} is carried as subtitle/data", index, riff::fourcc_str(other));
            Ok(AviStream {
                info: StreamInfo::new(index, CodecId::Other(riff::fourcc_str(other)), StreamParams::Subtitle, None),
                block_align: 0,
                rows: RowLayout::TopDown,
            })
        }
    }
}

impl AviLayout {
    fn locate(source: &mut ProbeSource) -> FormatResult<Self> {
        if !riff::is_riff_form(source.header(), b"AVI ") {
            return Err(FormatError::malformed("missing RIFF/AVI signature"));
        }
        let end = (8 + riff::le_u32(source.header(), 4) as u64).min(source.file_size());

        let hdrl = find_list(source, 12, end, b"hdrl")?
            .ok_or_else(|| FormatError::malformed("missing hdrl list"))?;
        let hdrl_end = (hdrl.offset + hdrl.size as u64).min(end);

        let mut streams = Vec::new();
        let mut pos = hdrl.offset + 4;
        while let Some(strl) = find_list(source, pos, hdrl_end, b"strl")? {
            if streams.len() == MAX_AVI_STREAMS {
                return Err(FormatError::malformed("too many streams"));
            }
            streams.push(parse_strl(source, &strl, streams.len())?);
            pos = strl.end();
        }
        if streams.is_empty() {
            return Err(FormatError::malformed("hdrl declares no streams"));
        }

        let movi = find_list(source, hdrl.end(), end, b"movi")?
            .ok_or_else(|| FormatError::malformed("missing movi list"))?;
        Ok(Self {
            streams,
            movi_start: movi.offset + 4,
            movi_end: (movi.offset + movi.size as u64).min(source.file_size()),
        })
    }
}

/// Chunk id for stream `index`: two decimal digits plus `db` or `wb`
fn chunk_id(index: usize, kind: StreamKind) -> FourCc {
    let digits = format!("{:02}", index % 100);
    let suffix: &[u8; 2] = match kind {
        StreamKind::Video => b"db",
        StreamKind::Audio => b"wb",
        StreamKind::Subtitle => b"tx",
    };
    let d = digits.as_bytes();
    [d[0], d[1], suffix[0], suffix[1]]
}

fn stream_number(id: &FourCc) -> Option<usize> {
    let digits = std::str::from_utf8(&id[..2]).ok()?;
    digits.parse().ok()
}

impl FormatFamily for AviFamily {
    fn container(&self) -> ContainerFormat {
        ContainerFormat::Avi
    }

    fn sniff(&self, header: &[u8]) -> bool {
        riff::is_riff_form(header, b"AVI ")
    }

    fn probe(&self, source: &mut ProbeSource) -> FormatResult<MediaInfo> {
        let layout = AviLayout::locate(source)?;
        debug!(
            "avi probe {}: {} streams, movi {}..{}",
            source.path().display(),
            layout.streams.len(),
            layout.movi_start,
            layout.movi_end
        );
        Ok(MediaInfo::new(
            source.path().to_path_buf(),
            ContainerFormat::Avi,
            layout.streams.into_iter().map(|s| s.info).collect(),
            source.file_size(),
        ))
    }

    fn codecs(&self) -> Vec<CodecCapability> {
        let pcm_limits = CodecLimits::Audio {
            sample_rate: 1_000..=192_000,
            channels: 1..=8,
        };
        vec![
            CodecCapability {
                codec: CodecId::RawVideo,
                limits: CodecLimits::Video {
                    width: 1..=16_384,
                    height: 1..=16_384,
                    pixel_formats: vec![PixelFormat::Bgr24],
                },
            },
            CodecCapability { codec: CodecId::Pcm(SampleFormat::S16), limits: pcm_limits.clone() },
            CodecCapability { codec: CodecId::Pcm(SampleFormat::U8), limits: pcm_limits.clone() },
            CodecCapability { codec: CodecId::Pcm(SampleFormat::S24), limits: pcm_limits },
        ]
    }

    fn max_streams(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Video => 1,
            StreamKind::Audio => 8,
            StreamKind::Subtitle => 0,
        }
    }

    fn can_decode(&self, stream: &StreamInfo) -> bool {
        match stream.codec {
            CodecId::RawVideo => stream.pixel_format() == Some(PixelFormat::Bgr24),
            CodecId::Pcm(_) => true,
            _ => false,
        }
    }

    fn open_demuxer(&self, path: &Path, _options: &DemuxOptions) -> FormatResult<Box<dyn Demuxer>> {
        let mut source = ProbeSource::open(path, LAYOUT_HEADER_BYTES)?;
        let layout = AviLayout::locate(&mut source)?;
        let mut reader = BufReader::new(File::open(path)?);
        reader.seek(SeekFrom::Start(layout.movi_start))?;
        let next_pts = vec![0; layout.streams.len()];
        Ok(Box::new(AviDemuxer {
            reader,
            pos: layout.movi_start,
            end: layout.movi_end,
            streams: layout.streams,
            next_pts,
        }))
    }

    fn decoder(&self, stream: &StreamInfo) -> FormatResult<Box<dyn Decoder>> {
        match (&stream.codec, &stream.params) {
            (CodecId::RawVideo, StreamParams::Video { width, height, pixel_format: Some(PixelFormat::Bgr24), .. }) => {
                // the demuxer hands out bottom-up rows whatever the file stores
                Ok(Box::new(RawVideoDecoder::new(*width, *height, PixelFormat::Bgr24, RowLayout::BottomUpDword)))
            }
            (CodecId::Pcm(fmt), StreamParams::Audio { sample_rate, channels }) => {
                Ok(Box::new(PcmDecoder::new(*fmt, *sample_rate, *channels)))
            }
            (codec, _) => Err(FormatError::unsupported(format!("no AVI decoder for {}", codec))),
        }
    }

    fn encoder(&self, target: &StreamInfo) -> FormatResult<Box<dyn Encoder>> {
        match (&target.codec, &target.params) {
            (CodecId::RawVideo, StreamParams::Video { width, height, pixel_format: Some(PixelFormat::Bgr24), .. }) => Ok(
                Box::new(RawVideoEncoder::new(*width, *height, PixelFormat::Bgr24, RowLayout::BottomUpDword, target.index)),
            ),
            (CodecId::Pcm(fmt), StreamParams::Audio { sample_rate, channels }) => {
                Ok(Box::new(PcmEncoder::new(*fmt, *sample_rate, *channels, target.index)))
            }
            (codec, _) => Err(FormatError::unsupported(format!("no AVI encoder for {}", codec))),
        }
    }

    fn open_muxer(&self, path: &Path, streams: &[StreamInfo]) -> FormatResult<Box<dyn Muxer>> {
        AviMuxer::create(path, streams).map(|m| Box::new(m) as Box<dyn Muxer>)
    }
}

struct AviDemuxer {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
    streams: Vec<AviStream>,
    next_pts: Vec<u64>,
}

impl AviDemuxer {
    /// Rewrite top-down pictures bottom-up so packets match what the muxer writes.
    /// Pictures of the wrong size pass through untouched; the decoder reports them.
    fn normalise_rows(stream: &AviStream, data: Vec<u8>) -> Vec<u8> {
        if let (RowLayout::TopDownDword, StreamParams::Video { width, height, pixel_format: Some(format), .. }) =
            (stream.rows, &stream.info.params)
        {
            let flipped = rawvideo::unpack(*format, *width, *height, RowLayout::TopDownDword, &data)
                .and_then(|planes| rawvideo::pack(*format, *width, *height, RowLayout::BottomUpDword, &planes));
            if let Ok(flipped) = flipped {
                return flipped;
            }
        }
        data
    }
}

impl Demuxer for AviDemuxer {
    fn read_packet(&mut self) -> FormatResult<Option<Packet>> {
        while self.pos + 8 <= self.end {
            let chunk = riff::read_chunk_header(&mut self.reader)?
                .ok_or_else(|| FormatError::malformed("movi list ends early"))?;
            self.pos = chunk.offset;

            // 'rec ' lists group interleaved chunks; descend into them
            if &chunk.id == b"LIST" {
                self.reader.seek(SeekFrom::Current(4))?;
                self.pos += 4;
                continue;
            }
            let next = chunk.end();
            let stream = stream_number(&chunk.id).filter(|&n| n < self.streams.len());
            let Some(index) = stream else {
                self.reader.seek(SeekFrom::Start(next))?;
                self.pos = next;
                continue;
            };
            if chunk.offset + chunk.size as u64 > self.end {
                return Err(FormatError::malformed(format!(
                    "chunk {} at {} runs past the movi list",
                    riff::fourcc_str(&chunk.id),
                    chunk.offset
                )));
            }

            let mut data = vec![0u8; chunk.size as usize];
            self.reader.read_exact(&mut data)?;
            if next != chunk.offset + chunk.size as u64 {
                self.reader.seek(SeekFrom::Start(next))?;
            }
            self.pos = next;

            let stream = &self.streams[index];
            let duration = match stream.info.kind {
                StreamKind::Audio => data.len() as u64 / stream.block_align.max(1),
                _ => 1,
            };
            let pts = self.next_pts[index];
            self.next_pts[index] += duration;
            if data.is_empty() {
                // zero-length video chunks mark dropped frames
                continue;
            }
            let data = Self::normalise_rows(stream, data);
            return Ok(Some(Packet { stream_index: index, pts, duration, data }));
        }
        Ok(None)
    }
}

struct MuxStream {
    id: FourCc,
    kind: StreamKind,
    strh_length_pos: u64,
    frames: u64,
    largest_chunk: u32,
}

struct IndexEntry {
    id: FourCc,
    offset: u32,
    size: u32,
}

struct AviMuxer {
    writer: BufWriter<File>,
    riff_size_pos: u64,
    total_frames_pos: u64,
    suggested_buffer_pos: u64,
    movi_size_pos: u64,
    /// Position of the 'movi' list type; idx1 offsets are relative to it
    movi_type_pos: u64,
    streams: Vec<MuxStream>,
    index: Vec<IndexEntry>,
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn bitmap_info_header(width: u32, height: u32) -> Vec<u8> {
    let image_size = rawvideo::stored_size(PixelFormat::Bgr24, width, height, RowLayout::BottomUpDword);
    let mut out = Vec::with_capacity(40);
    push_u32(&mut out, 40);
    push_u32(&mut out, width);
    push_u32(&mut out, height);
    push_u16(&mut out, 1);
    push_u16(&mut out, 24);
    push_u32(&mut out, BI_RGB);
    push_u32(&mut out, image_size as u32);
    out.extend_from_slice(&[0u8; 16]);
    out
}

impl AviMuxer {
    fn create(path: &Path, streams: &[StreamInfo]) -> FormatResult<Self> {
        if streams.is_empty() || streams.len() > MAX_AVI_STREAMS {
            return Err(FormatError::unsupported(format!("AVI cannot hold {} streams", streams.len())));
        }
        let video = streams.iter().find_map(|s| match s.params {
            StreamParams::Video { width, height, frame_rate, .. } => Some((width, height, frame_rate)),
            _ => None,
        });

        let mut w = BufWriter::new(File::create(path)?);
        let riff_size_pos = riff::begin_chunk(&mut w, b"RIFF")?;
        w.write_all(b"AVI ")?;
        let hdrl_size_pos = riff::begin_chunk(&mut w, b"LIST")?;
        w.write_all(b"hdrl")?;

        let (width, height, micros) = match video {
            Some((width, height, rate)) if rate.num > 0 => {
                (width, height, (1_000_000u64 * rate.den as u64 / rate.num as u64) as u32)
            }
            _ => (0, 0, 0),
        };
        let avih_start = w.stream_position()? + 8;
        let mut avih = Vec::with_capacity(56);
        push_u32(&mut avih, micros);
        push_u32(&mut avih, 0); // max bytes per second
        push_u32(&mut avih, 0); // padding granularity
        push_u32(&mut avih, AVIF_HASINDEX);
        push_u32(&mut avih, 0); // total frames, patched
        push_u32(&mut avih, 0); // initial frames
        push_u32(&mut avih, streams.len() as u32);
        push_u32(&mut avih, 0); // suggested buffer size, patched
        push_u32(&mut avih, width);
        push_u32(&mut avih, height);
        avih.extend_from_slice(&[0u8; 16]);
        riff::write_chunk(&mut w, b"avih", &avih)?;

        let mut mux_streams = Vec::with_capacity(streams.len());
        for (index, stream) in streams.iter().enumerate() {
            let (fcc_type, handler, scale, rate, sample_size, strf, rect) = match (&stream.codec, &stream.params) {
                (CodecId::RawVideo, StreamParams::Video { width, height, frame_rate, pixel_format: Some(PixelFormat::Bgr24) }) => (
                    *b"vids",
                    *b"DIB ",
                    frame_rate.den,
                    frame_rate.num,
                    0,
                    bitmap_info_header(*width, *height),
                    (*width as u16, *height as u16),
                ),
                (codec @ CodecId::Pcm(_), StreamParams::Audio { sample_rate, channels }) => {
                    let format = wav::wave_format_for(codec, *sample_rate, *channels)?;
                    let align = format.block_align as u32;
                    (*b"auds", [0u8; 4], align, format.sample_rate * align, align, format.to_bytes(), (0, 0))
                }
                (codec, _) => return Err(FormatError::unsupported(format!("AVI cannot mux {} stream {}", codec, index))),
            };

            let strl_size_pos = riff::begin_chunk(&mut w, b"LIST")?;
            w.write_all(b"strl")?;
            let strh_start = w.stream_position()? + 8;
            let mut strh = Vec::with_capacity(56);
            strh.extend_from_slice(&fcc_type);
            strh.extend_from_slice(&handler);
            push_u32(&mut strh, 0); // flags
            push_u16(&mut strh, 0); // priority
            push_u16(&mut strh, 0); // language
            push_u32(&mut strh, 0); // initial frames
            push_u32(&mut strh, scale);
            push_u32(&mut strh, rate);
            push_u32(&mut strh, 0); // start
            push_u32(&mut strh, 0); // length, patched
            push_u32(&mut strh, 0); // suggested buffer size
            push_u32(&mut strh, u32::MAX); // quality: default
            push_u32(&mut strh, sample_size);
            push_u16(&mut strh, 0);
            push_u16(&mut strh, 0);
            push_u16(&mut strh, rect.0);
            push_u16(&mut strh, rect.1);
            riff::write_chunk(&mut w, b"strh", &strh)?;
            riff::write_chunk(&mut w, b"strf", &strf)?;
            riff::end_chunk(&mut w, strl_size_pos)?;

            mux_streams.push(MuxStream {
                id: chunk_id(index, stream.kind),
                kind: stream.kind,
                strh_length_pos: strh_start + 32,
                frames: 0,
                largest_chunk: 0,
            });
        }
        riff::end_chunk(&mut w, hdrl_size_pos)?;

        let movi_size_pos = riff::begin_chunk(&mut w, b"LIST")?;
        let movi_type_pos = w.stream_position()?;
        w.write_all(b"movi")?;

        Ok(Self {
            writer: w,
            riff_size_pos,
            total_frames_pos: avih_start + 16,
            suggested_buffer_pos: avih_start + 28,
            movi_size_pos,
            movi_type_pos,
            streams: mux_streams,
            index: Vec::new(),
        })
    }
}

impl Muxer for AviMuxer {
    fn write_packet(&mut self, packet: Packet) -> FormatResult<()> {
        let stream = self
            .streams
            .get_mut(packet.stream_index)
            .ok_or_else(|| FormatError::malformed(format!("packet for unknown output stream {}", packet.stream_index)))?;
        let offset = riff::riff_u32(self.writer.stream_position()? - self.movi_type_pos, "movi offset")?;
        let size = riff::riff_u32(packet.data.len() as u64, "chunk size")?;
        riff::write_chunk(&mut self.writer, &stream.id, &packet.data)?;
        stream.frames += packet.duration;
        stream.largest_chunk = stream.largest_chunk.max(size);
        self.index.push(IndexEntry { id: stream.id, offset, size });
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> FormatResult<u64> {
        riff::end_chunk(&mut self.writer, self.movi_size_pos)?;

        let idx_size_pos = riff::begin_chunk(&mut self.writer, b"idx1")?;
        for entry in &self.index {
            self.writer.write_all(&entry.id)?;
            self.writer.write_all(&AVIIF_KEYFRAME.to_le_bytes())?;
            self.writer.write_all(&entry.offset.to_le_bytes())?;
            self.writer.write_all(&entry.size.to_le_bytes())?;
        }
        riff::end_chunk(&mut self.writer, idx_size_pos)?;

        let video_frames = self
            .streams
            .iter()
            .find(|s| s.kind == StreamKind::Video)
            .map(|s| s.frames)
            .unwrap_or(0);
        let largest = self.streams.iter().map(|s| s.largest_chunk).max().unwrap_or(0);
        riff::patch_u32(&mut self.writer, self.total_frames_pos, riff::riff_u32(video_frames, "frame count")?)?;
        riff::patch_u32(&mut self.writer, self.suggested_buffer_pos, largest)?;
        for stream in &self.streams {
            riff::patch_u32(&mut self.writer, stream.strh_length_pos, riff::riff_u32(stream.frames, "stream length")?)?;
        }
        riff::end_chunk(&mut self.writer, self.riff_size_pos)?;
        self.writer.flush()?;
        Ok(self.writer.stream_position()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_chunk_ids() {
        assert_eq!(&chunk_id(0, StreamKind::Video), b"00db");
        assert_eq!(&chunk_id(1, StreamKind::Audio), b"01wb");
        assert_eq!(stream_number(b"12wb"), Some(12));
        assert_eq!(stream_number(b"JUNK"), None);
    }

    #[test]
    fn test_probe_lists_video_and_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        fixtures::write_avi(&path, 6, 4, 10, Some(8_000));

        let mut source = ProbeSource::open(&path, 64 * 1024).unwrap();
        let info = AviFamily.probe(&mut source).unwrap();
        assert_eq!(info.container, ContainerFormat::Avi);
        assert_eq!(info.streams.len(), 2);

        let video = &info.streams[0];
        assert_eq!(video.kind, StreamKind::Video);
        assert_eq!(video.codec, CodecId::RawVideo);
        assert_eq!(video.dimensions(), Some((6, 4)));
        assert_eq!(video.pixel_format(), Some(PixelFormat::Bgr24));
        assert_eq!(video.frames, Some(10));

        let audio = &info.streams[1];
        assert_eq!(audio.codec, CodecId::Pcm(SampleFormat::S16));
        assert_eq!(audio.sample_rate(), Some(8_000));
        assert_eq!(audio.frames, Some(8_000 * 10 / 25));
    }

    #[test]
    fn test_demuxer_assigns_per_stream_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        fixtures::write_avi(&path, 6, 4, 3, Some(8_000));

        let mut demuxer = AviFamily.open_demuxer(&path, &DemuxOptions::default()).unwrap();
        let mut video_pts = Vec::new();
        let mut audio_pts = Vec::new();
        while let Some(packet) = demuxer.read_packet().unwrap() {
            match packet.stream_index {
                0 => {
                    assert_eq!(packet.data.len(), 4 * 20);
                    video_pts.push(packet.pts);
                }
                1 => audio_pts.push(packet.pts),
                other => panic!("unexpected stream {}", other),
            }
        }
        assert_eq!(video_pts, vec![0, 1, 2]);
        assert_eq!(audio_pts, vec![0, 320, 640]);
    }

    #[test]
    fn test_decoded_pictures_are_top_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.avi");
        fixtures::write_avi(&path, 2, 2, 1, None);

        let mut source = ProbeSource::open(&path, 64 * 1024).unwrap();
        let info = AviFamily.probe(&mut source).unwrap();
        let mut demuxer = AviFamily.open_demuxer(&path, &DemuxOptions::default()).unwrap();
        let mut decoder = AviFamily.decoder(&info.streams[0]).unwrap();
        let packet = demuxer.read_packet().unwrap().unwrap();
        let frame = decoder.decode(packet).unwrap().remove(0);
        let crate::media::Frame::Video(video) = frame else { panic!("expected video") };
        assert_eq!(video.planes[0], fixtures::bgr_picture(2, 2, 0));
    }

    #[test]
    fn test_oversized_chunk_is_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lying.avi");
        fixtures::write_avi(&path, 4, 4, 2, None);

        // claim a 4 GiB movi list and a 4 GiB first frame in a file of a few hundred bytes
        let mut bytes = std::fs::read(&path).unwrap();
        let movi = bytes.windows(4).position(|w| w == b"movi").unwrap();
        bytes[movi - 4..movi].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        let frame = movi + 4;
        assert_eq!(&bytes[frame..frame + 4], b"00db");
        bytes[frame + 4..frame + 8].copy_from_slice(&0xFFFF_FF00u32.to_le_bytes());
        bytes.truncate(frame + 8 + 10);
        std::fs::write(&path, &bytes).unwrap();

        let mut demuxer = AviFamily.open_demuxer(&path, &DemuxOptions::default()).unwrap();
        let err = demuxer.read_packet().unwrap_err();
        assert!(matches!(err, FormatError::Malformed(_)), "{:?}", err);
    }
}
