use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::media::{CodecId, ContainerFormat, MediaInfo, Packet, SampleFormat, StreamInfo, StreamKind, StreamParams};
use super::adpcm::{self, ImaAdpcmDecoder, ImaAdpcmEncoder};
use super::pcm::{PcmDecoder, PcmEncoder};
use super::riff::{self, ChunkHeader, WaveFormat};
use super::{
    CodecCapability, CodecLimits, Decoder, DemuxOptions, Demuxer, Encoder, FormatError, FormatFamily,
    FormatResult, Muxer, ProbeSource,
};

/// Bytes read when locating chunks for demuxing
const LAYOUT_HEADER_BYTES: usize = 4096;

/// RIFF/WAVE with PCM or IMA ADPCM audio
pub struct WavFamily;

/// Map a WAVEFORMATEX to a codec id
pub(crate) fn codec_for(format: &WaveFormat) -> CodecId {
    match (format.format_tag, format.bits_per_sample) {
        (riff::WAVE_FORMAT_PCM, 8) => CodecId::Pcm(SampleFormat::U8),
        (riff::WAVE_FORMAT_PCM, 16) => CodecId::Pcm(SampleFormat::S16),
        (riff::WAVE_FORMAT_PCM, 24) => CodecId::Pcm(SampleFormat::S24),
        (riff::WAVE_FORMAT_IEEE_FLOAT, 32) => CodecId::Pcm(SampleFormat::F32),
        (riff::WAVE_FORMAT_IMA_ADPCM, 4) => CodecId::ImaAdpcm,
        (riff::WAVE_FORMAT_PCM, bits) => CodecId::Other(format!("pcm_{}bit", bits)),
        (tag, _) => CodecId::Other(format!("wav_0x{:04x}", tag)),
    }
}

/// WAVEFORMATEX describing `codec` at the given rate and channel count
pub(crate) fn wave_format_for(codec: &CodecId, sample_rate: u32, channels: u16) -> FormatResult<WaveFormat> {
    match codec {
        CodecId::Pcm(fmt) => {
            let block_align = channels * fmt.bytes_per_sample() as u16;
            let format_tag = if *fmt == SampleFormat::F32 {
                riff::WAVE_FORMAT_IEEE_FLOAT
            } else {
                riff::WAVE_FORMAT_PCM
            };
            Ok(WaveFormat {
                format_tag,
                channels,
                sample_rate,
                byte_rate: sample_rate * block_align as u32,
                block_align,
                bits_per_sample: fmt.bits(),
                samples_per_block: 0,
            })
        }
        CodecId::ImaAdpcm => {
            let block_align = adpcm::block_align_for(sample_rate, channels);
            let samples_per_block = adpcm::samples_per_block(block_align, channels);
            Ok(WaveFormat {
                format_tag: riff::WAVE_FORMAT_IMA_ADPCM,
                channels,
                sample_rate,
                byte_rate: (sample_rate as u64 * block_align as u64 / samples_per_block as u64) as u32,
                block_align,
                bits_per_sample: 4,
                samples_per_block,
            })
        }
        other => Err(FormatError::unsupported(format!("{} cannot be stored as WAVEFORMATEX", other))),
    }
}

/// Where the interesting chunks of a WAV file live
struct WavLayout {
    format: WaveFormat,
    codec: CodecId,
    data: ChunkHeader,
    /// Usable payload bytes of the data chunk (clamped to the file for truncated files)
    data_len: u64,
    fact_frames: Option<u64>,
}

impl WavLayout {
    fn locate(source: &mut ProbeSource) -> FormatResult<Self> {
        if !riff::is_riff_form(source.header(), b"WAVE") {
            return Err(FormatError::malformed("missing RIFF/WAVE signature"));
        }
        let declared = 8 + riff::le_u32(source.header(), 4) as u64;
        let end = declared.min(source.file_size());

        let fmt_chunk = riff::find_chunk(source, 12, end, b"fmt ")?
            .ok_or_else(|| FormatError::malformed("missing fmt chunk"))?;
        let mut fmt_bytes = vec![0u8; (fmt_chunk.size as usize).min(64)];
        source.read_at(fmt_chunk.offset, &mut fmt_bytes)?;
        let format = WaveFormat::parse(&fmt_bytes)?;
        if format.channels == 0 || format.sample_rate == 0 || format.block_align == 0 {
            return Err(FormatError::malformed(format!("degenerate format chunk {:?}", format)));
        }

        let data = riff::find_chunk(source, 12, end, b"data")?
            .ok_or_else(|| FormatError::malformed("missing data chunk"))?;
        let data_len = (data.size as u64).min(source.file_size().saturating_sub(data.offset));

        let fact_frames = match riff::find_chunk(source, 12, end, b"fact")? {
            Some(fact) if fact.size >= 4 => {
                let mut buf = [0u8; 4];
                source.read_at(fact.offset, &mut buf)?;
                Some(u32::from_le_bytes(buf) as u64)
            }
            _ => None,
        };

        Ok(Self {
            codec: codec_for(&format),
            format,
            data,
            data_len,
            fact_frames,
        })
    }

    fn total_frames(&self) -> Option<u64> {
        let blocks = self.data_len / self.format.block_align as u64;
        match self.codec {
            CodecId::Pcm(_) => Some(blocks),
            CodecId::ImaAdpcm => self
                .fact_frames
                .or(Some(blocks * self.format.samples_per_block.max(1) as u64)),
            _ => None,
        }
    }
}

impl FormatFamily for WavFamily {
    fn container(&self) -> ContainerFormat {
        ContainerFormat::Wav
    }

    fn sniff(&self, header: &[u8]) -> bool {
        riff::is_riff_form(header, b"WAVE")
    }

    fn probe(&self, source: &mut ProbeSource) -> FormatResult<MediaInfo> {
        let layout = WavLayout::locate(source)?;
        let params = StreamParams::Audio {
            sample_rate: layout.format.sample_rate,
            channels: layout.format.channels,
        };
        let mut stream = StreamInfo::new(0, layout.codec.clone(), params, layout.total_frames());
        if stream.bitrate.is_none() {
            stream.bitrate = Some(layout.format.byte_rate as u64 * 8);
        }
        debug!(
            "wav probe {}: {} {} Hz {} ch, {} data bytes",
            source.path().display(),
            stream.codec,
            layout.format.sample_rate,
            layout.format.channels,
            layout.data_len
        );
        Ok(MediaInfo::new(
            source.path().to_path_buf(),
            ContainerFormat::Wav,
            vec![stream],
            source.file_size(),
        ))
    }

    fn codecs(&self) -> Vec<CodecCapability> {
        let pcm_limits = CodecLimits::Audio {
            sample_rate: 1_000..=384_000,
            channels: 1..=8,
        };
        vec![
            CodecCapability { codec: CodecId::Pcm(SampleFormat::S16), limits: pcm_limits.clone() },
            CodecCapability { codec: CodecId::Pcm(SampleFormat::U8), limits: pcm_limits.clone() },
            CodecCapability { codec: CodecId::Pcm(SampleFormat::S24), limits: pcm_limits.clone() },
            CodecCapability { codec: CodecId::Pcm(SampleFormat::F32), limits: pcm_limits },
            CodecCapability {
                codec: CodecId::ImaAdpcm,
                limits: CodecLimits::Audio { sample_rate: 1_000..=96_000, channels: 1..=2 },
            },
        ]
    }

    fn max_streams(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Audio => 1,
            _ => 0,
        }
    }

    fn can_decode(&self, stream: &StreamInfo) -> bool {
        matches!(stream.codec, CodecId::Pcm(_) | CodecId::ImaAdpcm)
    }

    fn open_demuxer(&self, path: &Path, options: &DemuxOptions) -> FormatResult<Box<dyn Demuxer>> {
        let mut source = ProbeSource::open(path, LAYOUT_HEADER_BYTES)?;
        let layout = WavLayout::locate(&mut source)?;
        let mut reader = BufReader::new(File::open(path)?);
        reader.seek(SeekFrom::Start(layout.data.offset))?;

        let block_align = layout.format.block_align as u64;
        let (packet_bytes, frames_per_packet) = match layout.codec {
            CodecId::ImaAdpcm => (block_align, layout.format.samples_per_block.max(1) as u64),
            _ => {
                let frames = options.audio_packet_frames.max(1) as u64;
                (frames * block_align, frames)
            }
        };
        Ok(Box::new(WavDemuxer {
            reader,
            remaining: layout.data_len,
            block_align,
            packet_bytes,
            frames_per_packet,
            adpcm: layout.codec == CodecId::ImaAdpcm,
            total_frames: layout.total_frames(),
            pts: 0,
        }))
    }

    fn decoder(&self, stream: &StreamInfo) -> FormatResult<Box<dyn Decoder>> {
        let (sample_rate, channels) = match stream.params {
            StreamParams::Audio { sample_rate, channels } => (sample_rate, channels),
            _ => return Err(FormatError::unsupported("WAV streams are audio only")),
        };
        match stream.codec {
            CodecId::Pcm(fmt) => Ok(Box::new(PcmDecoder::new(fmt, sample_rate, channels))),
            CodecId::ImaAdpcm => Ok(Box::new(ImaAdpcmDecoder::new(sample_rate, channels))),
            ref other => Err(FormatError::unsupported(format!("no WAV decoder for {}", other))),
        }
    }

    fn encoder(&self, target: &StreamInfo) -> FormatResult<Box<dyn Encoder>> {
        let (sample_rate, channels) = match target.params {
            StreamParams::Audio { sample_rate, channels } => (sample_rate, channels),
            _ => return Err(FormatError::unsupported("WAV streams are audio only")),
        };
        match target.codec {
            CodecId::Pcm(fmt) => Ok(Box::new(PcmEncoder::new(fmt, sample_rate, channels, target.index))),
            CodecId::ImaAdpcm => Ok(Box::new(ImaAdpcmEncoder::new(
                sample_rate,
                channels,
                adpcm::block_align_for(sample_rate, channels),
                target.index,
            ))),
            ref other => Err(FormatError::unsupported(format!("no WAV encoder for {}", other))),
        }
    }

    fn open_muxer(&self, path: &Path, streams: &[StreamInfo]) -> FormatResult<Box<dyn Muxer>> {
        let stream = match streams {
            [single] => single,
            _ => return Err(FormatError::unsupported(format!("WAV holds exactly one stream, got {}", streams.len()))),
        };
        let (sample_rate, channels) = match stream.params {
            StreamParams::Audio { sample_rate, channels } => (sample_rate, channels),
            _ => return Err(FormatError::unsupported("WAV streams are audio only")),
        };
        let format = wave_format_for(&stream.codec, sample_rate, channels)?;
        WavMuxer::create(path, &format).map(|m| Box::new(m) as Box<dyn Muxer>)
    }
}

struct WavDemuxer {
    reader: BufReader<File>,
    remaining: u64,
    block_align: u64,
    packet_bytes: u64,
    frames_per_packet: u64,
    adpcm: bool,
    total_frames: Option<u64>,
    pts: u64,
}

impl Demuxer for WavDemuxer {
    fn read_packet(&mut self) -> FormatResult<Option<Packet>> {
        let mut len = self.packet_bytes.min(self.remaining);
        if !self.adpcm {
            len -= len % self.block_align;
        }
        if len == 0 {
            return Ok(None);
        }
        let mut data = vec![0u8; len as usize];
        self.reader.read_exact(&mut data)?;
        self.remaining -= len;

        let duration = if self.adpcm {
            let left = self.total_frames.map(|t| t.saturating_sub(self.pts)).unwrap_or(self.frames_per_packet);
            self.frames_per_packet.min(left)
        } else {
            len / self.block_align
        };
        if duration == 0 {
            return Ok(None);
        }
        let packet = Packet { stream_index: 0, pts: self.pts, duration, data };
        self.pts += duration;
        Ok(Some(packet))
    }
}

struct WavMuxer {
    writer: BufWriter<File>,
    riff_size_pos: u64,
    data_size_pos: u64,
    fact_pos: Option<u64>,
    frames: u64,
    data_bytes: u64,
}

impl WavMuxer {
    fn create(path: &Path, format: &WaveFormat) -> FormatResult<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        let riff_size_pos = riff::begin_chunk(&mut writer, b"RIFF")?;
        writer.write_all(b"WAVE")?;
        riff::write_chunk(&mut writer, b"fmt ", &format.to_bytes())?;
        let fact_pos = if format.format_tag == riff::WAVE_FORMAT_IMA_ADPCM {
            let pos = writer.stream_position()? + 8;
            riff::write_chunk(&mut writer, b"fact", &0u32.to_le_bytes())?;
            Some(pos)
        } else {
            None
        };
        let data_size_pos = riff::begin_chunk(&mut writer, b"data")?;
        Ok(Self {
            writer,
            riff_size_pos,
            data_size_pos,
            fact_pos,
            frames: 0,
            data_bytes: 0,
        })
    }
}

impl Muxer for WavMuxer {
    fn write_packet(&mut self, packet: Packet) -> FormatResult<()> {
        self.data_bytes += packet.data.len() as u64;
        riff::riff_u32(self.data_size_pos + 4 + self.data_bytes, "RIFF size")?;
        self.writer.write_all(&packet.data)?;
        self.frames += packet.duration;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> FormatResult<u64> {
        riff::end_chunk(&mut self.writer, self.data_size_pos)?;
        if let Some(pos) = self.fact_pos {
            riff::patch_u32(&mut self.writer, pos, riff::riff_u32(self.frames, "sample count")?)?;
        }
        riff::end_chunk(&mut self.writer, self.riff_size_pos)?;
        self.writer.flush()?;
        Ok(self.writer.stream_position()?)
    }
}
