//! Linear PCM codec, shared by the WAV and AVI families.

use crate::media::{AudioFrame, Frame, Packet, SampleFormat};
use super::{Decoder, Encoder, FormatError, FormatResult};

const S16_SCALE: f32 = 32_768.0;
const S24_SCALE: f32 = 8_388_608.0;
const U8_SCALE: f32 = 128.0;

/// Append normalised samples decoded from little-endian `data`
pub fn decode_samples(format: SampleFormat, data: &[u8], out: &mut Vec<f32>) {
    out.reserve(data.len() / format.bytes_per_sample());
    match format {
        SampleFormat::U8 => out.extend(data.iter().map(|&b| (b as f32 - U8_SCALE) / U8_SCALE)),
        SampleFormat::S16 => out.extend(
            data.chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / S16_SCALE),
        ),
        SampleFormat::S24 => out.extend(data.chunks_exact(3).map(|c| {
            // sign-extend through the top byte of an i32
            let v = i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8;
            v as f32 / S24_SCALE
        })),
        SampleFormat::F32 => out.extend(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        ),
    }
}

/// Append `samples` encoded as little-endian `format`, clipping out-of-range values
pub fn encode_samples(format: SampleFormat, samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * format.bytes_per_sample());
    for &s in samples {
        match format {
            SampleFormat::U8 => {
                out.push((s * U8_SCALE + U8_SCALE).round().clamp(0.0, 255.0) as u8);
            }
            SampleFormat::S16 => {
                let v = (s * S16_SCALE).round().clamp(-S16_SCALE, S16_SCALE - 1.0) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            SampleFormat::S24 => {
                let v = (s * S24_SCALE).round().clamp(-S24_SCALE, S24_SCALE - 1.0) as i32;
                out.extend_from_slice(&v.to_le_bytes()[..3]);
            }
            SampleFormat::F32 => out.extend_from_slice(&s.to_le_bytes()),
        }
    }
}

pub struct PcmDecoder {
    format: SampleFormat,
    sample_rate: u32,
    channels: u16,
}

impl PcmDecoder {
    pub fn new(format: SampleFormat, sample_rate: u32, channels: u16) -> Self {
        Self { format, sample_rate, channels }
    }
}

impl Decoder for PcmDecoder {
    fn decode(&mut self, packet: Packet) -> FormatResult<Vec<Frame>> {
        let block = self.format.bytes_per_sample() * self.channels as usize;
        if block == 0 || packet.data.len() % block != 0 {
            return Err(FormatError::malformed(format!(
                "packet of {} bytes is not a whole number of {}-byte sample frames",
                packet.data.len(),
                block
            )));
        }
        let mut samples = Vec::new();
        decode_samples(self.format, &packet.data, &mut samples);
        Ok(vec![Frame::Audio(AudioFrame {
            sample_rate: self.sample_rate,
            channels: self.channels,
            pts: packet.pts,
            samples,
        })])
    }
}

pub struct PcmEncoder {
    format: SampleFormat,
    sample_rate: u32,
    channels: u16,
    stream_index: usize,
}

impl PcmEncoder {
    pub fn new(format: SampleFormat, sample_rate: u32, channels: u16, stream_index: usize) -> Self {
        Self { format, sample_rate, channels, stream_index }
    }
}

impl Encoder for PcmEncoder {
    fn encode(&mut self, frame: Frame) -> FormatResult<Vec<Packet>> {
        let audio = match frame {
            Frame::Audio(audio) => audio,
            Frame::Video(_) => return Err(FormatError::unsupported("PCM encoder fed a video frame")),
        };
        if audio.channels != self.channels || audio.sample_rate != self.sample_rate {
            return Err(FormatError::unsupported(format!(
                "PCM encoder configured for {} Hz/{} ch got {} Hz/{} ch",
                self.sample_rate, self.channels, audio.sample_rate, audio.channels
            )));
        }
        if audio.samples.is_empty() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        encode_samples(self.format, &audio.samples, &mut data);
        Ok(vec![Packet {
            stream_index: self.stream_index,
            pts: audio.pts,
            duration: audio.frames() as u64,
            data,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Integer PCM survives a decode/encode cycle bit for bit
        #[test]
        fn test_s16_is_lossless(values in prop::collection::vec(any::<i16>(), 0..256)) {
            let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let mut samples = Vec::new();
            decode_samples(SampleFormat::S16, &data, &mut samples);
            let mut back = Vec::new();
            encode_samples(SampleFormat::S16, &samples, &mut back);
            prop_assert_eq!(back, data);
        }

        #[test]
        fn test_s24_is_lossless(values in prop::collection::vec(-8_388_608i32..8_388_608, 0..128)) {
            let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()[..3].to_vec()).collect();
            let mut samples = Vec::new();
            decode_samples(SampleFormat::S24, &data, &mut samples);
            let mut back = Vec::new();
            encode_samples(SampleFormat::S24, &samples, &mut back);
            prop_assert_eq!(back, data);
        }
    }

    #[test]
    fn test_out_of_range_samples_clip() {
        let mut out = Vec::new();
        encode_samples(SampleFormat::S16, &[2.0, -2.0], &mut out);
        assert_eq!(out, [0xFF, 0x7F, 0x00, 0x80]);

        out.clear();
        encode_samples(SampleFormat::U8, &[1.5, -1.5, 0.0], &mut out);
        assert_eq!(out, [255, 0, 128]);
    }

    #[test]
    fn test_decoder_rejects_partial_sample_frames() {
        let mut decoder = PcmDecoder::new(SampleFormat::S16, 8_000, 2);
        let packet = Packet { stream_index: 0, pts: 0, duration: 1, data: vec![0; 6] };
        assert!(matches!(decoder.decode(packet), Err(FormatError::Malformed(_))));
    }

    #[test]
    fn test_encoder_stamps_packet_from_frame() {
        let mut encoder = PcmEncoder::new(SampleFormat::F32, 8_000, 2, 3);
        let frame = Frame::Audio(AudioFrame {
            sample_rate: 8_000,
            channels: 2,
            pts: 400,
            samples: vec![0.25; 8],
        });
        let packets = encoder.encode(frame).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].stream_index, 3);
        assert_eq!(packets[0].pts, 400);
        assert_eq!(packets[0].duration, 4);
        assert_eq!(packets[0].data.len(), 32);
    }
}
