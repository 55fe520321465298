//! Synthetic media files for tests, written through the format families themselves.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::format::avi::AviFamily;
use crate::format::wav::WavFamily;
use crate::format::y4m::Y4mFamily;
use crate::format::{
    CodecCapability, Decoder, DemuxOptions, Demuxer, Encoder, FormatFamily, FormatResult, Muxer, ProbeSource,
};
use crate::media::{
    AudioFrame, CodecId, ContainerFormat, Frame, MediaInfo, Packet, PixelFormat, Rational, SampleFormat, StreamInfo,
    StreamKind, StreamParams,
};

pub const FIXTURE_FPS: Rational = Rational::new(25, 1);

/// Interleaved 440 Hz sine at half scale
pub fn sine_samples(frames: u64, channels: u16, sample_rate: u32) -> Vec<f32> {
    (0..frames)
        .flat_map(|i| {
            let v = (i as f32 * 440.0 * std::f32::consts::TAU / sample_rate as f32).sin() * 0.5;
            std::iter::repeat(v).take(channels as usize)
        })
        .collect()
}

/// Deterministic tight top-down BGR picture
pub fn bgr_picture(width: u32, height: u32, seed: u64) -> Vec<u8> {
    (0..(width * height * 3) as u64)
        .map(|i| ((i * 7 + seed * 13) % 251) as u8)
        .collect()
}

/// Deterministic tight planar picture, planes concatenated
pub fn planar_picture(format: PixelFormat, width: u32, height: u32, seed: u64) -> Vec<u8> {
    (0..format.frame_size(width, height) as u64)
        .map(|i| ((i * 5 + seed * 11) % 241) as u8)
        .collect()
}

fn write_packets(family: &dyn FormatFamily, path: &Path, streams: &[StreamInfo], packets: Vec<Packet>) {
    let mut muxer = family.open_muxer(path, streams).unwrap();
    for packet in packets {
        muxer.write_packet(packet).unwrap();
    }
    muxer.finish().unwrap();
}

pub fn write_wav(path: &Path, sample_rate: u32, channels: u16, format: SampleFormat, frames: u64) {
    let target = StreamInfo::new(0, CodecId::Pcm(format), StreamParams::Audio { sample_rate, channels }, None);
    let mut encoder = WavFamily.encoder(&target).unwrap();
    let mut packets = Vec::new();
    let mut pts = 0;
    let samples = sine_samples(frames, channels, sample_rate);
    for chunk in samples.chunks(1024 * channels as usize) {
        let frame = AudioFrame { sample_rate, channels, pts, samples: chunk.to_vec() };
        pts += frame.frames() as u64;
        packets.extend(encoder.encode(Frame::Audio(frame)).unwrap());
    }
    write_packets(&WavFamily, path, &[target], packets);
}

pub fn write_y4m(path: &Path, width: u32, height: u32, format: PixelFormat, frames: u64) {
    let target = StreamInfo::new(
        0,
        CodecId::RawVideo,
        StreamParams::Video { width, height, frame_rate: FIXTURE_FPS, pixel_format: Some(format) },
        None,
    );
    let packets = (0..frames)
        .map(|pts| Packet { stream_index: 0, pts, duration: 1, data: planar_picture(format, width, height, pts) })
        .collect();
    write_packets(&Y4mFamily, path, &[target], packets);
}

/// BGR video at 25 fps, optionally with interleaved mono s16 audio
pub fn write_avi(path: &Path, width: u32, height: u32, frames: u64, audio_rate: Option<u32>) {
    write_avi_inner(path, width, height, frames, audio_rate, false);
}

/// Like [`write_avi`] but every audio chunk carries a stray trailing byte
pub fn write_avi_with_broken_audio(path: &Path, width: u32, height: u32, frames: u64, audio_rate: u32) {
    write_avi_inner(path, width, height, frames, Some(audio_rate), true);
}

fn write_avi_inner(path: &Path, width: u32, height: u32, frames: u64, audio_rate: Option<u32>, broken_audio: bool) {
    let mut streams = vec![StreamInfo::new(
        0,
        CodecId::RawVideo,
        StreamParams::Video { width, height, frame_rate: FIXTURE_FPS, pixel_format: Some(PixelFormat::Bgr24) },
        None,
    )];
    if let Some(sample_rate) = audio_rate {
        streams.push(StreamInfo::new(
            1,
            CodecId::Pcm(SampleFormat::S16),
            StreamParams::Audio { sample_rate, channels: 1 },
            None,
        ));
    }

    let mut video_encoder = AviFamily.encoder(&streams[0]).unwrap();
    let mut audio_encoder = streams.get(1).map(|s| AviFamily.encoder(s).unwrap());
    let per_frame = audio_rate.map(|r| (r / FIXTURE_FPS.num) as u64).unwrap_or(0);
    let audio = audio_rate.map(|r| sine_samples(per_frame * frames, 1, r)).unwrap_or_default();

    let mut packets = Vec::new();
    for n in 0..frames {
        let picture = Frame::Video(crate::media::VideoFrame {
            width,
            height,
            format: PixelFormat::Bgr24,
            pts: n,
            planes: vec![bgr_picture(width, height, n)],
        });
        packets.extend(video_encoder.encode(picture).unwrap());
        if let (Some(encoder), Some(sample_rate)) = (audio_encoder.as_mut(), audio_rate) {
            let range = (n * per_frame) as usize..((n + 1) * per_frame) as usize;
            let frame = AudioFrame { sample_rate, channels: 1, pts: n * per_frame, samples: audio[range].to_vec() };
            for mut packet in encoder.encode(Frame::Audio(frame)).unwrap() {
                if broken_audio {
                    packet.data.push(0);
                }
                packets.push(packet);
            }
        }
    }
    write_packets(&AviFamily, path, &streams, packets);
}

/// WAV family whose demuxers sleep before every packet and count how many are
/// open at once
#[derive(Default)]
pub struct ThrottledWav {
    pub delay: Duration,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl ThrottledWav {
    pub fn new(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }
}

struct ThrottledDemuxer {
    inner: Box<dyn Demuxer>,
    delay: Duration,
    active: Arc<AtomicUsize>,
}

impl Demuxer for ThrottledDemuxer {
    fn read_packet(&mut self) -> FormatResult<Option<Packet>> {
        std::thread::sleep(self.delay);
        self.inner.read_packet()
    }
}

impl Drop for ThrottledDemuxer {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FormatFamily for ThrottledWav {
    fn container(&self) -> ContainerFormat {
        WavFamily.container()
    }

    fn sniff(&self, header: &[u8]) -> bool {
        WavFamily.sniff(header)
    }

    fn probe(&self, source: &mut ProbeSource) -> FormatResult<MediaInfo> {
        WavFamily.probe(source)
    }

    fn codecs(&self) -> Vec<CodecCapability> {
        WavFamily.codecs()
    }

    fn max_streams(&self, kind: StreamKind) -> usize {
        WavFamily.max_streams(kind)
    }

    fn can_decode(&self, stream: &StreamInfo) -> bool {
        WavFamily.can_decode(stream)
    }

    fn open_demuxer(&self, path: &Path, options: &DemuxOptions) -> FormatResult<Box<dyn Demuxer>> {
        let inner = WavFamily.open_demuxer(path, options)?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(ThrottledDemuxer { inner, delay: self.delay, active: self.active.clone() }))
    }

    fn decoder(&self, stream: &StreamInfo) -> FormatResult<Box<dyn Decoder>> {
        WavFamily.decoder(stream)
    }

    fn encoder(&self, target: &StreamInfo) -> FormatResult<Box<dyn Encoder>> {
        WavFamily.encoder(target)
    }

    fn open_muxer(&self, path: &Path, streams: &[StreamInfo]) -> FormatResult<Box<dyn Muxer>> {
        WavFamily.open_muxer(path, streams)
    }
}

/// Executable `sh` script standing in for an external tool
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
