//! Optional middle stage: resample / remix audio, rescale / pixel-convert video.

use thiserror::Error;

use crate::media::{AudioFrame, Frame, PixelFormat, StreamParams, VideoFrame};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Mismatch(String),
}

/// Converts frames of one stream from source to target parameters
pub enum Transform {
    Audio(AudioTransform),
    Video(VideoTransform),
}

impl Transform {
    /// `None` when the parameters already match
    pub fn between(source: &StreamParams, target: &StreamParams) -> Option<Self> {
        if source == target {
            return None;
        }
        match (source, target) {
            (
                StreamParams::Audio { sample_rate: in_rate, channels: in_channels },
                StreamParams::Audio { sample_rate: out_rate, channels: out_channels },
            ) => Some(Transform::Audio(AudioTransform::new(*in_rate, *in_channels, *out_rate, *out_channels))),
            (
                StreamParams::Video { .. },
                StreamParams::Video { width, height, pixel_format: Some(format), .. },
            ) => Some(Transform::Video(VideoTransform::new(*width, *height, *format))),
            _ => None,
        }
    }

    pub fn apply(&mut self, frame: Frame) -> Result<Vec<Frame>, TransformError> {
        match (self, frame) {
            (Transform::Audio(t), Frame::Audio(a)) => Ok(t.process(a)?.into_iter().map(Frame::Audio).collect()),
            (Transform::Video(t), Frame::Video(v)) => Ok(vec![Frame::Video(t.process(v))]),
            _ => Err(TransformError::Mismatch("frame kind does not match the stream".to_string())),
        }
    }

    pub fn flush(&mut self) -> Vec<Frame> {
        match self {
            Transform::Audio(t) => t.flush().into_iter().map(Frame::Audio).collect(),
            Transform::Video(_) => Vec::new(),
        }
    }
}

/// Mix interleaved `samples` from `from` channels to `to` channels.
///
/// Downmixing averages every input channel `i` into output `i % to`;
/// upmixing repeats input channels cyclically.
pub fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from as usize, to as usize);
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to < from {
            for c in 0..to {
                let (sum, n) = frame
                    .iter()
                    .skip(c)
                    .step_by(to)
                    .fold((0.0f32, 0u32), |(s, n), v| (s + v, n + 1));
                out.push(sum / n as f32);
            }
        } else {
            out.extend((0..to).map(|c| frame[c % from]));
        }
    }
    out
}

/// Linear-interpolating sample rate converter for interleaved audio.
///
/// The read position is kept as an exact fraction `phase / out_rate` of input
/// frames so output lengths never drift.
pub struct LinearResampler {
    channels: usize,
    in_rate: u64,
    out_rate: u64,
    /// Read position relative to the carried frame, in units of 1/out_rate frames
    phase: u64,
    carry: Option<Vec<f32>>,
    next_pts: Option<u64>,
}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32, channels: u16) -> Self {
        Self {
            channels: channels as usize,
            in_rate: in_rate.max(1) as u64,
            out_rate: out_rate.max(1) as u64,
            phase: 0,
            carry: None,
            next_pts: None,
        }
    }

    fn stamp(&mut self, in_pts: u64, frames: usize) -> u64 {
        let (in_rate, out_rate) = (self.in_rate, self.out_rate);
        let pts = *self
            .next_pts
            .get_or_insert_with(|| (in_pts as u128 * out_rate as u128 / in_rate as u128) as u64);
        self.next_pts = Some(pts + frames as u64);
        pts
    }

    /// Returns resampled samples and the pts of the first one
    pub fn process(&mut self, in_pts: u64, input: &[f32]) -> (u64, Vec<f32>) {
        let c = self.channels.max(1);
        let mut buf = self.carry.take().unwrap_or_default();
        buf.extend_from_slice(input);
        let frames = buf.len() / c;
        let mut out = Vec::new();
        if frames == 0 {
            return (self.stamp(in_pts, 0), out);
        }
        let limit = (frames as u64 - 1) * self.out_rate;
        while self.phase < limit {
            let i = (self.phase / self.out_rate) as usize;
            let frac = (self.phase % self.out_rate) as f32 / self.out_rate as f32;
            for ch in 0..c {
                let a = buf[i * c + ch];
                let b = buf[(i + 1) * c + ch];
                out.push(a + (b - a) * frac);
            }
            self.phase += self.in_rate;
        }
        self.phase -= limit;
        self.carry = Some(buf[(frames - 1) * c..frames * c].to_vec());
        let pts = self.stamp(in_pts, out.len() / c);
        (pts, out)
    }

    /// Emit the positions that fall on the final input frame
    pub fn flush(&mut self) -> (u64, Vec<f32>) {
        let mut out = Vec::new();
        if let Some(last) = self.carry.take() {
            while self.phase < self.out_rate {
                out.extend_from_slice(&last);
                self.phase += self.in_rate;
            }
        }
        let pts = self.next_pts.unwrap_or(0);
        self.next_pts = Some(pts + (out.len() / self.channels.max(1)) as u64);
        (pts, out)
    }
}

pub struct AudioTransform {
    in_channels: u16,
    out_rate: u32,
    out_channels: u16,
    resampler: Option<LinearResampler>,
}

impl AudioTransform {
    pub fn new(in_rate: u32, in_channels: u16, out_rate: u32, out_channels: u16) -> Self {
        let resampler = (in_rate != out_rate).then(|| LinearResampler::new(in_rate, out_rate, out_channels));
        Self { in_channels, out_rate, out_channels, resampler }
    }

    pub fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>, TransformError> {
        if frame.channels != self.in_channels {
            return Err(TransformError::Mismatch(format!(
                "expected {} channels, got {}",
                self.in_channels, frame.channels
            )));
        }
        let mixed = remix(&frame.samples, self.in_channels, self.out_channels);
        let (pts, samples) = match self.resampler.as_mut() {
            Some(r) => r.process(frame.pts, &mixed),
            None => (frame.pts, mixed),
        };
        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(AudioFrame {
            sample_rate: self.out_rate,
            channels: self.out_channels,
            pts,
            samples,
        }))
    }

    pub fn flush(&mut self) -> Option<AudioFrame> {
        let (pts, samples) = self.resampler.as_mut()?.flush();
        (!samples.is_empty()).then(|| AudioFrame {
            sample_rate: self.out_rate,
            channels: self.out_channels,
            pts,
            samples,
        })
    }
}

pub struct VideoTransform {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl VideoTransform {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self { width, height, format }
    }

    pub fn process(&mut self, frame: VideoFrame) -> VideoFrame {
        let converted = if frame.format == self.format {
            frame
        } else {
            convert_pixels(&frame, self.format)
        };
        if (converted.width, converted.height) == (self.width, self.height) {
            return converted;
        }
        let src_layout = self.format.planes(converted.width, converted.height);
        let dst_layout = self.format.planes(self.width, self.height);
        let planes = converted
            .planes
            .iter()
            .zip(src_layout.iter().zip(&dst_layout))
            .map(|(plane, (s, d))| scale_plane(plane, s.width, s.height, s.bytes_per_pixel, d.width, d.height))
            .collect();
        VideoFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            pts: converted.pts,
            planes,
        }
    }
}

/// Bilinear rescale of one plane with `bpp` interleaved components
pub fn scale_plane(src: &[u8], sw: usize, sh: usize, bpp: usize, dw: usize, dh: usize) -> Vec<u8> {
    let mut out = vec![0u8; dw * dh * bpp];
    if sw == 0 || sh == 0 {
        return out;
    }
    let sample_axis = |d: usize, dst_len: usize, src_len: usize| {
        let pos = ((d as f32 + 0.5) * src_len as f32 / dst_len as f32 - 0.5).clamp(0.0, (src_len - 1) as f32);
        let i0 = pos.floor() as usize;
        (i0, (i0 + 1).min(src_len - 1), pos - i0 as f32)
    };
    for y in 0..dh {
        let (y0, y1, fy) = sample_axis(y, dh, sh);
        for x in 0..dw {
            let (x0, x1, fx) = sample_axis(x, dw, sw);
            for k in 0..bpp {
                let at = |xx: usize, yy: usize| src[(yy * sw + xx) * bpp + k] as f32;
                let top = at(x0, y0) + (at(x1, y0) - at(x0, y0)) * fx;
                let bottom = at(x0, y1) + (at(x1, y1) - at(x0, y1)) * fx;
                out[(y * dw + x) * bpp + k] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Full-resolution Y, U, V planes of any supported picture (BT.601, full range)
fn to_yuv444(frame: &VideoFrame) -> [Vec<u8>; 3] {
    let (w, h) = (frame.width as usize, frame.height as usize);
    match frame.format {
        PixelFormat::Yuv444p => [frame.planes[0].clone(), frame.planes[1].clone(), frame.planes[2].clone()],
        PixelFormat::Gray8 => [frame.planes[0].clone(), vec![128; w * h], vec![128; w * h]],
        PixelFormat::Yuv420p => {
            let cw = w.div_ceil(2);
            let up = |plane: &[u8]| {
                let mut full = Vec::with_capacity(w * h);
                for y in 0..h {
                    full.extend((0..w).map(|x| plane[(y / 2) * cw + x / 2]));
                }
                full
            };
            [frame.planes[0].clone(), up(&frame.planes[1]), up(&frame.planes[2])]
        }
        PixelFormat::Bgr24 => {
            let mut planes = [Vec::with_capacity(w * h), Vec::with_capacity(w * h), Vec::with_capacity(w * h)];
            for px in frame.planes[0].chunks_exact(3) {
                let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
                planes[0].push(clamp_u8(0.299 * r + 0.587 * g + 0.114 * b));
                planes[1].push(clamp_u8(-0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0));
                planes[2].push(clamp_u8(0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0));
            }
            planes
        }
    }
}

fn from_yuv444(yuv: [Vec<u8>; 3], width: usize, height: usize, format: PixelFormat) -> Vec<Vec<u8>> {
    let [y, u, v] = yuv;
    match format {
        PixelFormat::Yuv444p => vec![y, u, v],
        PixelFormat::Gray8 => vec![y],
        PixelFormat::Yuv420p => {
            let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
            let down = |plane: &[u8]| {
                let mut out = Vec::with_capacity(cw * ch);
                for cy in 0..ch {
                    for cx in 0..cw {
                        let (mut sum, mut n) = (0u32, 0u32);
                        for yy in (cy * 2)..(cy * 2 + 2).min(height) {
                            for xx in (cx * 2)..(cx * 2 + 2).min(width) {
                                sum += plane[yy * width + xx] as u32;
                                n += 1;
                            }
                        }
                        out.push(((sum + n / 2) / n) as u8);
                    }
                }
                out
            };
            let (u, v) = (down(&u), down(&v));
            vec![y, u, v]
        }
        PixelFormat::Bgr24 => {
            let mut out = Vec::with_capacity(width * height * 3);
            for i in 0..width * height {
                let (yy, cb, cr) = (y[i] as f32, u[i] as f32 - 128.0, v[i] as f32 - 128.0);
                out.push(clamp_u8(yy + 1.772 * cb));
                out.push(clamp_u8(yy - 0.344_136 * cb - 0.714_136 * cr));
                out.push(clamp_u8(yy + 1.402 * cr));
            }
            vec![out]
        }
    }
}

/// Convert a picture to another pixel format at the same size
pub fn convert_pixels(frame: &VideoFrame, format: PixelFormat) -> VideoFrame {
    let yuv = to_yuv444(frame);
    VideoFrame {
        width: frame.width,
        height: frame.height,
        format,
        pts: frame.pts,
        planes: from_yuv444(yuv, frame.width as usize, frame.height as usize, format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Rational;
    use proptest::prelude::*;

    #[test]
    fn test_remix_down_and_up() {
        assert_eq!(remix(&[0.25, 0.75, -1.0, 1.0], 2, 1), vec![0.5, 0.0]);
        assert_eq!(remix(&[0.5, -0.5], 1, 2), vec![0.5, 0.5, -0.5, -0.5]);
        // 4 -> 2 folds channels 0+2 and 1+3
        assert_eq!(remix(&[1.0, 0.0, 0.0, 1.0], 4, 2), vec![0.5, 0.5]);
    }

    #[test]
    fn test_resampler_doubles_frames_and_scales_pts() {
        let mut resampler = LinearResampler::new(8_000, 16_000, 1);
        let input: Vec<f32> = (0..800).map(|i| i as f32 / 800.0).collect();
        let (pts_a, mut out) = resampler.process(400, &input[..400]);
        let (pts_b, rest) = resampler.process(800, &input[400..]);
        out.extend(rest);
        let (_, tail) = resampler.flush();
        out.extend(tail);

        assert_eq!(pts_a, 800);
        assert_eq!(pts_b, 800 + 798);
        assert_eq!(out.len(), 1_600);
        // output is monotone like the ramp it came from
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_audio_transform_remixes_then_resamples() {
        let mut t = AudioTransform::new(48_000, 2, 24_000, 1);
        let frame = AudioFrame { sample_rate: 48_000, channels: 2, pts: 0, samples: vec![0.5; 960 * 2] };
        let mut total = t.process(frame).unwrap().map(|f| f.frames()).unwrap_or(0);
        total += t.flush().map(|f| f.frames()).unwrap_or(0);
        assert_eq!(total, 480);
    }

    #[test]
    fn test_bgr_to_yuv_and_back_is_close() {
        let bgr: Vec<u8> = (0..4 * 4 * 3).map(|i| (i * 17 % 256) as u8).collect();
        let frame = VideoFrame { width: 4, height: 4, format: PixelFormat::Bgr24, pts: 3, planes: vec![bgr.clone()] };
        let yuv = convert_pixels(&frame, PixelFormat::Yuv444p);
        let back = convert_pixels(&yuv, PixelFormat::Bgr24);
        assert_eq!(back.pts, 3);
        for (a, b) in back.planes[0].iter().zip(&bgr) {
            assert!((*a as i32 - *b as i32).abs() <= 3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_gray_to_bgr_is_neutral() {
        let frame = VideoFrame { width: 2, height: 1, format: PixelFormat::Gray8, pts: 0, planes: vec![vec![10, 200]] };
        let bgr = convert_pixels(&frame, PixelFormat::Bgr24);
        assert_eq!(bgr.planes[0], vec![10, 10, 10, 200, 200, 200]);
    }

    #[test]
    fn test_transform_between_matching_params_is_none() {
        let params = StreamParams::Video {
            width: 4,
            height: 4,
            frame_rate: Rational::new(25, 1),
            pixel_format: Some(PixelFormat::Gray8),
        };
        assert!(Transform::between(&params, &params).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Rescaling always yields the requested geometry and keeps flat pictures flat
        #[test]
        fn test_scale_keeps_flat_planes_flat(
            sw in 1usize..24, sh in 1usize..24, dw in 1usize..24, dh in 1usize..24,
            bpp in 1usize..=3, value in any::<u8>(),
        ) {
            let src = vec![value; sw * sh * bpp];
            let out = scale_plane(&src, sw, sh, bpp, dw, dh);
            prop_assert_eq!(out.len(), dw * dh * bpp);
            prop_assert!(out.iter().all(|&v| v == value));
        }

        /// Resampled length is ceil(n * out / in), however the input is split
        #[test]
        fn test_resampled_length(
            n in 1usize..2_000,
            split in 0usize..2_000,
            rates in prop::sample::select(vec![(8_000u32, 44_100u32), (44_100, 48_000), (48_000, 22_050), (22_050, 8_000)]),
        ) {
            let (from, to) = rates;
            let split = split.min(n);
            let input = vec![0.25f32; n];
            let mut r = LinearResampler::new(from, to, 1);
            let mut total = r.process(0, &input[..split]).1.len();
            total += r.process(split as u64, &input[split..]).1.len();
            total += r.flush().1.len();
            let expected = (n as u64 * to as u64).div_ceil(from as u64) as usize;
            prop_assert_eq!(total, expected);
        }
    }
}
