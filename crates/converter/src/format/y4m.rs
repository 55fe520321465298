//! YUV4MPEG2 streams: one text header line, then `FRAME` lines each followed
//! by a planar picture.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::media::{CodecId, ContainerFormat, MediaInfo, Packet, PixelFormat, Rational, StreamInfo, StreamKind, StreamParams};
use super::rawvideo::{RawVideoDecoder, RawVideoEncoder, RowLayout};
use super::{
    CodecCapability, CodecLimits, Decoder, DemuxOptions, Demuxer, Encoder, FormatError, FormatFamily, FormatResult,
    Muxer, ProbeSource,
};

const MAGIC: &[u8] = b"YUV4MPEG2 ";
const FRAME_TAG: &[u8] = b"FRAME";
const MAX_HEADER_LINE: u64 = 4096;
const DEFAULT_FRAME_RATE: Rational = Rational::new(25, 1);

pub struct Y4mFamily;

#[derive(Debug, Clone, PartialEq)]
struct Y4mHeader {
    width: u32,
    height: u32,
    frame_rate: Rational,
    colorspace: String,
    pixel_format: Option<PixelFormat>,
    /// Header length including the trailing newline
    len: usize,
}

fn pixel_format_for(colorspace: &str) -> Option<PixelFormat> {
    match colorspace {
        "420jpeg" | "420" | "420mpeg2" | "420paldv" => Some(PixelFormat::Yuv420p),
        "444" => Some(PixelFormat::Yuv444p),
        "mono" => Some(PixelFormat::Gray8),
        _ => None,
    }
}

fn colorspace_for(format: PixelFormat) -> FormatResult<&'static str> {
    match format {
        PixelFormat::Yuv420p => Ok("420jpeg"),
        PixelFormat::Yuv444p => Ok("444"),
        PixelFormat::Gray8 => Ok("mono"),
        other => Err(FormatError::unsupported(format!("Y4M cannot store {}", other))),
    }
}

fn parse_ratio(value: &str) -> Option<Rational> {
    let (num, den) = value.split_once(':')?;
    let (num, den) = (num.parse().ok()?, den.parse().ok()?);
    (num > 0 && den > 0).then(|| Rational::new(num, den))
}

impl Y4mHeader {
    fn parse(buf: &[u8]) -> FormatResult<Self> {
        if !buf.starts_with(MAGIC) {
            return Err(FormatError::malformed("missing YUV4MPEG2 signature"));
        }
        let end = buf
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| FormatError::malformed("header line is not terminated"))?;
        let line = String::from_utf8_lossy(&buf[MAGIC.len()..end]);

        let (mut width, mut height) = (None, None);
        let mut frame_rate = DEFAULT_FRAME_RATE;
        let mut colorspace = "420jpeg".to_string();
        for token in line.split_ascii_whitespace() {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('W') => width = value.parse::<u32>().ok(),
                Some('H') => height = value.parse::<u32>().ok(),
                Some('F') => {
                    frame_rate = parse_ratio(value)
                        .ok_or_else(|| FormatError::malformed(format!("bad frame rate '{}'", value)))?
                }
                Some('C') => colorspace = value.to_string(),
                // interlacing, aspect and comments do not affect decoding
                _ => {}
            }
        }
        let (width, height) = match (width, height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(FormatError::malformed("header lacks valid W and H")),
        };
        Ok(Self {
            width,
            height,
            frame_rate,
            pixel_format: pixel_format_for(&colorspace),
            colorspace,
            len: end + 1,
        })
    }

    fn codec(&self) -> CodecId {
        match self.pixel_format {
            Some(_) => CodecId::RawVideo,
            None => CodecId::Other(format!("rawvideo_c{}", self.colorspace)),
        }
    }

    fn stream_info(&self, frames: Option<u64>) -> StreamInfo {
        let params = StreamParams::Video {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            pixel_format: self.pixel_format,
        };
        StreamInfo::new(0, self.codec(), params, frames)
    }
}

impl FormatFamily for Y4mFamily {
    fn container(&self) -> ContainerFormat {
        ContainerFormat::Y4m
    }

    fn sniff(&self, header: &[u8]) -> bool {
        header.starts_with(MAGIC)
    }

    fn probe(&self, source: &mut ProbeSource) -> FormatResult<MediaInfo> {
        let header = Y4mHeader::parse(source.header())?;
        // assumes bare FRAME lines, which is what every common writer emits
        let frames = header.pixel_format.map(|pix| {
            let per_frame = (FRAME_TAG.len() + 1 + pix.frame_size(header.width, header.height)) as u64;
            source.file_size().saturating_sub(header.len as u64) / per_frame
        });
        debug!(
            "y4m probe {}: {}x{} C{} @ {}, {:?} frames",
            source.path().display(),
            header.width,
            header.height,
            header.colorspace,
            header.frame_rate,
            frames
        );
        Ok(MediaInfo::new(
            source.path().to_path_buf(),
            ContainerFormat::Y4m,
            vec![header.stream_info(frames)],
            source.file_size(),
        ))
    }

    fn codecs(&self) -> Vec<CodecCapability> {
        vec![CodecCapability {
            codec: CodecId::RawVideo,
            limits: CodecLimits::Video {
                width: 1..=16_384,
                height: 1..=16_384,
                pixel_formats: vec![PixelFormat::Yuv420p, PixelFormat::Yuv444p, PixelFormat::Gray8],
            },
        }]
    }

    fn max_streams(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Video => 1,
            _ => 0,
        }
    }

    fn can_decode(&self, stream: &StreamInfo) -> bool {
        stream.codec == CodecId::RawVideo && stream.pixel_format().is_some()
    }

    fn open_demuxer(&self, path: &Path, _options: &DemuxOptions) -> FormatResult<Box<dyn Demuxer>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut line = Vec::new();
        (&mut reader).take(MAX_HEADER_LINE).read_until(b'\n', &mut line)?;
        let header = Y4mHeader::parse(&line)?;
        let format = header
            .pixel_format
            .ok_or_else(|| FormatError::unsupported(format!("colorspace C{}", header.colorspace)))?;
        reader.seek(SeekFrom::Start(header.len as u64))?;
        Ok(Box::new(Y4mDemuxer {
            reader,
            frame_size: format.frame_size(header.width, header.height),
            pts: 0,
        }))
    }

    fn decoder(&self, stream: &StreamInfo) -> FormatResult<Box<dyn Decoder>> {
        match (stream.dimensions(), stream.pixel_format()) {
            (Some((w, h)), Some(format)) => Ok(Box::new(RawVideoDecoder::new(w, h, format, RowLayout::TopDown))),
            _ => Err(FormatError::unsupported(format!("no Y4M decoder for {}", stream.codec))),
        }
    }

    fn encoder(&self, target: &StreamInfo) -> FormatResult<Box<dyn Encoder>> {
        match (target.dimensions(), target.pixel_format()) {
            (Some((w, h)), Some(format)) => {
                colorspace_for(format)?;
                Ok(Box::new(RawVideoEncoder::new(w, h, format, RowLayout::TopDown, target.index)))
            }
            _ => Err(FormatError::unsupported("Y4M encoder needs dimensions and a pixel format")),
        }
    }

    fn open_muxer(&self, path: &Path, streams: &[StreamInfo]) -> FormatResult<Box<dyn Muxer>> {
        let stream = match streams {
            [single] => single,
            _ => return Err(FormatError::unsupported(format!("Y4M holds exactly one stream, got {}", streams.len()))),
        };
        let (width, height, frame_rate, format) = match stream.params {
            StreamParams::Video { width, height, frame_rate, pixel_format: Some(format) } => {
                (width, height, frame_rate, format)
            }
            _ => return Err(FormatError::unsupported("Y4M streams are raw video only")),
        };
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(
            writer,
            "YUV4MPEG2 W{} H{} F{}:{} Ip A1:1 C{}",
            width,
            height,
            frame_rate.num,
            frame_rate.den,
            colorspace_for(format)?
        )?;
        Ok(Box::new(Y4mMuxer { writer }))
    }
}

struct Y4mDemuxer {
    reader: BufReader<File>,
    frame_size: usize,
    pts: u64,
}

impl Demuxer for Y4mDemuxer {
    fn read_packet(&mut self) -> FormatResult<Option<Packet>> {
        let mut line = Vec::new();
        (&mut self.reader).take(MAX_HEADER_LINE).read_until(b'\n', &mut line)?;
        if line.is_empty() {
            return Ok(None);
        }
        if !line.starts_with(FRAME_TAG) || line.last() != Some(&b'\n') {
            return Err(FormatError::malformed(format!("expected FRAME marker for picture {}", self.pts)));
        }
        let mut data = vec![0u8; self.frame_size];
        self.reader.read_exact(&mut data).map_err(|e| {
            FormatError::malformed(format!("picture {} is truncated: {}", self.pts, e))
        })?;
        let packet = Packet { stream_index: 0, pts: self.pts, duration: 1, data };
        self.pts += 1;
        Ok(Some(packet))
    }
}

struct Y4mMuxer {
    writer: BufWriter<File>,
}

impl Muxer for Y4mMuxer {
    fn write_packet(&mut self, packet: Packet) -> FormatResult<()> {
        self.writer.write_all(FRAME_TAG)?;
        self.writer.write_all(b"\n")?;
        self.writer.write_all(&packet.data)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> FormatResult<u64> {
        self.writer.flush()?;
        Ok(self.writer.stream_position()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_header_parses_tags() {
        let header = Y4mHeader::parse(b"YUV4MPEG2 W320 H240 F30000:1001 It A1:1 C444 XYSCSS=444\nFRAME").unwrap();
        assert_eq!((header.width, header.height), (320, 240));
        assert_eq!(header.frame_rate, Rational::new(30_000, 1_001));
        assert_eq!(header.pixel_format, Some(PixelFormat::Yuv444p));
        assert_eq!(header.len, 56);
    }

    #[test]
    fn test_header_defaults_and_unknown_colorspace() {
        let header = Y4mHeader::parse(b"YUV4MPEG2 W4 H4\n").unwrap();
        assert_eq!(header.frame_rate, DEFAULT_FRAME_RATE);
        assert_eq!(header.pixel_format, Some(PixelFormat::Yuv420p));

        let header = Y4mHeader::parse(b"YUV4MPEG2 W4 H4 C422p10\n").unwrap();
        assert_eq!(header.pixel_format, None);
        assert_eq!(header.codec(), CodecId::Other("rawvideo_c422p10".to_string()));
    }

    #[test]
    fn test_header_requires_dimensions() {
        assert!(Y4mHeader::parse(b"YUV4MPEG2 W4 F25:1\n").is_err());
        assert!(Y4mHeader::parse(b"YUV4MPEG2 W4 H4").is_err());
    }

    #[test]
    fn test_probe_counts_frames_and_demux_reads_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.y4m");
        fixtures::write_y4m(&path, 8, 6, PixelFormat::Yuv420p, 5);

        let mut source = ProbeSource::open(&path, 64 * 1024).unwrap();
        let info = Y4mFamily.probe(&mut source).unwrap();
        assert_eq!(info.streams[0].frames, Some(5));
        assert_eq!(info.duration.as_millis(), 200);

        let mut demuxer = Y4mFamily.open_demuxer(&path, &DemuxOptions::default()).unwrap();
        let mut count = 0;
        while let Some(packet) = demuxer.read_packet().unwrap() {
            assert_eq!(packet.pts, count);
            assert_eq!(packet.data.len(), 72);
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn test_truncated_picture_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.y4m");
        let mut bytes = b"YUV4MPEG2 W2 H2 F25:1 Cmono\nFRAME\n".to_vec();
        bytes.extend_from_slice(&[1, 2]);
        std::fs::write(&path, bytes).unwrap();

        let mut demuxer = Y4mFamily.open_demuxer(&path, &DemuxOptions::default()).unwrap();
        assert!(matches!(demuxer.read_packet(), Err(FormatError::Malformed(_))));
    }
}
