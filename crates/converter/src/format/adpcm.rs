//! IMA ADPCM as stored in WAV files (`WAVE_FORMAT_IMA_ADPCM`).
//!
//! Each block starts with a 4-byte header per channel (predictor, step index)
//! followed by groups of 4 bytes per channel, 8 nibbles each, low nibble first.

use crate::media::{AudioFrame, Frame, Packet};
use super::{Decoder, Encoder, FormatError, FormatResult};

const INDEX_TABLE: [i32; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

/// Block size used when writing, scaled with the sample rate like common encoders do
pub fn block_align_for(sample_rate: u32, channels: u16) -> u16 {
    let scale = (sample_rate / 11_025).clamp(1, 4) as u16;
    256 * channels * scale
}

/// Sample frames held by one block of `block_align` bytes
pub fn samples_per_block(block_align: u16, channels: u16) -> u16 {
    let header = 4 * channels;
    if block_align <= header {
        return 1;
    }
    (block_align - header) * 2 / channels + 1
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    predictor: i32,
    index: i32,
}

impl ChannelState {
    fn expand(&mut self, nibble: u8) -> i16 {
        let step = STEP_TABLE[self.index as usize];
        let mut diff = step >> 3;
        if nibble & 4 != 0 {
            diff += step;
        }
        if nibble & 2 != 0 {
            diff += step >> 1;
        }
        if nibble & 1 != 0 {
            diff += step >> 2;
        }
        if nibble & 8 != 0 {
            self.predictor -= diff;
        } else {
            self.predictor += diff;
        }
        self.predictor = self.predictor.clamp(i16::MIN as i32, i16::MAX as i32);
        self.index = (self.index + INDEX_TABLE[nibble as usize]).clamp(0, 88);
        self.predictor as i16
    }

    fn compress(&mut self, sample: i16) -> u8 {
        let step = STEP_TABLE[self.index as usize];
        let mut diff = sample as i32 - self.predictor;
        let mut nibble = 0u8;
        if diff < 0 {
            nibble = 8;
            diff = -diff;
        }
        let mut mask = 4u8;
        let mut threshold = step;
        for _ in 0..3 {
            if diff >= threshold {
                nibble |= mask;
                diff -= threshold;
            }
            threshold >>= 1;
            mask >>= 1;
        }
        // keep the encoder's predictor in lockstep with what a decoder will reconstruct
        self.expand(nibble);
        nibble
    }
}

/// Decode one block into interleaved 16-bit samples
fn decode_block(data: &[u8], channels: usize) -> FormatResult<Vec<i16>> {
    let header = 4 * channels;
    if channels == 0 || data.len() < header {
        return Err(FormatError::malformed(format!("ADPCM block of {} bytes is shorter than its header", data.len())));
    }
    let body = &data[header..];
    if body.len() % header != 0 {
        return Err(FormatError::malformed(format!(
            "ADPCM block body of {} bytes is not a multiple of {}",
            body.len(),
            header
        )));
    }

    let mut states = Vec::with_capacity(channels);
    let mut out = Vec::with_capacity(channels * (1 + body.len() * 2 / channels));
    for ch in 0..channels {
        let at = ch * 4;
        let predictor = i16::from_le_bytes([data[at], data[at + 1]]);
        let index = data[at + 2] as i32;
        if index > 88 {
            return Err(FormatError::malformed(format!("ADPCM step index {} out of range", index)));
        }
        states.push(ChannelState { predictor: predictor as i32, index });
        out.push(predictor);
    }

    let groups = body.len() / header;
    let mut scratch = vec![0i16; 8 * channels];
    for group in 0..groups {
        for (ch, state) in states.iter_mut().enumerate() {
            let at = (group * channels + ch) * 4;
            for (k, byte) in body[at..at + 4].iter().enumerate() {
                scratch[(2 * k) * channels + ch] = state.expand(byte & 0x0F);
                scratch[(2 * k + 1) * channels + ch] = state.expand(byte >> 4);
            }
        }
        out.extend_from_slice(&scratch);
    }
    Ok(out)
}

pub struct ImaAdpcmDecoder {
    sample_rate: u32,
    channels: u16,
}

impl ImaAdpcmDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }
}

impl Decoder for ImaAdpcmDecoder {
    fn decode(&mut self, packet: Packet) -> FormatResult<Vec<Frame>> {
        let channels = self.channels as usize;
        let mut pcm = decode_block(&packet.data, channels)?;
        // the final block is padded; the packet duration says how much of it is real
        let real = (packet.duration as usize).saturating_mul(channels);
        if real > 0 && real < pcm.len() {
            pcm.truncate(real);
        }
        Ok(vec![Frame::Audio(AudioFrame {
            sample_rate: self.sample_rate,
            channels: self.channels,
            pts: packet.pts,
            samples: pcm.into_iter().map(|s| s as f32 / 32_768.0).collect(),
        })])
    }
}

pub struct ImaAdpcmEncoder {
    sample_rate: u32,
    channels: u16,
    samples_per_block: usize,
    stream_index: usize,
    states: Vec<ChannelState>,
    pending: Vec<i16>,
    next_pts: Option<u64>,
}

impl ImaAdpcmEncoder {
    pub fn new(sample_rate: u32, channels: u16, block_align: u16, stream_index: usize) -> Self {
        Self {
            sample_rate,
            channels,
            samples_per_block: samples_per_block(block_align, channels) as usize,
            stream_index,
            states: vec![ChannelState::default(); channels as usize],
            pending: Vec::new(),
            next_pts: None,
        }
    }

    fn encode_block(&mut self, frames: &[i16], real_frames: usize) -> Packet {
        let channels = self.channels as usize;
        let mut data = Vec::with_capacity(4 * channels * (1 + (self.samples_per_block - 1) / 8));
        for (ch, state) in self.states.iter_mut().enumerate() {
            let first = frames[ch];
            state.predictor = first as i32;
            data.extend_from_slice(&first.to_le_bytes());
            data.push(state.index as u8);
            data.push(0);
        }

        let groups = (self.samples_per_block - 1) / 8;
        for group in 0..groups {
            for (ch, state) in self.states.iter_mut().enumerate() {
                for k in 0..4 {
                    let lo = 1 + group * 8 + 2 * k;
                    let low = state.compress(frames[lo * channels + ch]);
                    let high = state.compress(frames[(lo + 1) * channels + ch]);
                    data.push(low | (high << 4));
                }
            }
        }

        let pts = self.next_pts.unwrap_or(0);
        self.next_pts = Some(pts + real_frames as u64);
        Packet {
            stream_index: self.stream_index,
            pts,
            duration: real_frames as u64,
            data,
        }
    }
}

impl Encoder for ImaAdpcmEncoder {
    fn encode(&mut self, frame: Frame) -> FormatResult<Vec<Packet>> {
        let audio = match frame {
            Frame::Audio(audio) => audio,
            Frame::Video(_) => return Err(FormatError::unsupported("ADPCM encoder fed a video frame")),
        };
        if audio.channels != self.channels || audio.sample_rate != self.sample_rate {
            return Err(FormatError::unsupported(format!(
                "ADPCM encoder configured for {} Hz/{} ch got {} Hz/{} ch",
                self.sample_rate, self.channels, audio.sample_rate, audio.channels
            )));
        }
        if self.next_pts.is_none() {
            self.next_pts = Some(audio.pts);
        }
        self.pending.extend(
            audio.samples.iter()
                .map(|s| (s * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16),
        );

        let block = self.samples_per_block * self.channels as usize;
        let mut packets = Vec::new();
        while self.pending.len() >= block {
            let frames: Vec<i16> = self.pending.drain(..block).collect();
            packets.push(self.encode_block(&frames, self.samples_per_block));
        }
        Ok(packets)
    }

    fn flush(&mut self) -> FormatResult<Vec<Packet>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let channels = self.channels as usize;
        let real = self.pending.len() / channels;
        let mut frames = std::mem::take(&mut self.pending);
        let last: Vec<i16> = frames[frames.len() - channels..].to_vec();
        while frames.len() < self.samples_per_block * channels {
            frames.extend_from_slice(&last);
        }
        Ok(vec![self.encode_block(&frames, real)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frames: usize, channels: u16, rate: u32) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let v = (i as f32 * 440.0 * std::f32::consts::TAU / rate as f32).sin() * 0.5;
                std::iter::repeat(v).take(channels as usize)
            })
            .collect()
    }

    #[test]
    fn test_block_geometry_matches_common_encoders() {
        assert_eq!(block_align_for(8_000, 1), 256);
        assert_eq!(samples_per_block(256, 1), 505);
        assert_eq!(block_align_for(44_100, 2), 2048);
        assert_eq!(samples_per_block(2048, 2), 2041);
    }

    #[test]
    fn test_encode_decode_tracks_signal() {
        let (rate, channels) = (8_000, 2);
        let block_align = block_align_for(rate, channels);
        let mut encoder = ImaAdpcmEncoder::new(rate, channels, block_align, 0);
        let input = sine(1200, channels, rate);
        let frame = Frame::Audio(AudioFrame { sample_rate: rate, channels, pts: 0, samples: input.clone() });

        let mut packets = encoder.encode(frame).unwrap();
        packets.extend(encoder.flush().unwrap());
        let total: u64 = packets.iter().map(|p| p.duration).sum();
        assert_eq!(total, 1200);
        assert!(packets.iter().all(|p| p.data.len() == block_align as usize));

        let mut decoder = ImaAdpcmDecoder::new(rate, channels);
        let mut decoded = Vec::new();
        for packet in packets {
            for frame in decoder.decode(packet).unwrap() {
                if let Frame::Audio(a) = frame {
                    decoded.extend(a.samples);
                }
            }
        }
        assert_eq!(decoded.len(), input.len());
        // ADPCM is lossy; after the step size adapts it follows the waveform closely
        let tail_error = decoded[400..]
            .iter()
            .zip(&input[400..])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(tail_error < 0.05, "max error {}", tail_error);
    }

    #[test]
    fn test_decoder_rejects_bad_step_index() {
        let mut block = vec![0u8; 256];
        block[2] = 120;
        let mut decoder = ImaAdpcmDecoder::new(8_000, 1);
        let packet = Packet { stream_index: 0, pts: 0, duration: 505, data: block };
        assert!(decoder.decode(packet).is_err());
    }
}
