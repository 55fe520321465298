//! Uncompressed video pictures, stored either as tight top-down planes (Y4M)
//! or as bottom-up rows padded to four bytes (AVI `DIB `).

use crate::media::{Frame, Packet, PixelFormat, VideoFrame};
use super::{Decoder, Encoder, FormatError, FormatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLayout {
    /// Rows stored top to bottom with no padding
    TopDown,
    /// Rows stored bottom to top, each padded to a multiple of 4 bytes
    BottomUpDword,
    /// Rows stored top to bottom, each padded to a multiple of 4 bytes
    TopDownDword,
}

impl RowLayout {
    fn stored_stride(&self, stride: usize) -> usize {
        match self {
            RowLayout::TopDown => stride,
            RowLayout::BottomUpDword | RowLayout::TopDownDword => stride.div_ceil(4) * 4,
        }
    }

    fn bottom_up(&self) -> bool {
        matches!(self, RowLayout::BottomUpDword)
    }
}

/// Bytes one picture occupies on disk
pub fn stored_size(format: PixelFormat, width: u32, height: u32, layout: RowLayout) -> usize {
    format
        .planes(width, height)
        .iter()
        .map(|p| layout.stored_stride(p.stride()) * p.height)
        .sum()
}

/// Split stored picture bytes into tight top-down planes
pub fn unpack(format: PixelFormat, width: u32, height: u32, layout: RowLayout, data: &[u8]) -> FormatResult<Vec<Vec<u8>>> {
    let expected = stored_size(format, width, height, layout);
    if data.len() != expected {
        return Err(FormatError::malformed(format!(
            "{}x{} {} picture should be {} bytes, got {}",
            width,
            height,
            format,
            expected,
            data.len()
        )));
    }
    let mut planes = Vec::new();
    let mut at = 0;
    for plane in format.planes(width, height) {
        let stride = plane.stride();
        let stored = layout.stored_stride(stride);
        let mut out = vec![0u8; plane.len()];
        for row in 0..plane.height {
            let dst_row = if layout.bottom_up() { plane.height - 1 - row } else { row };
            let src = at + row * stored;
            out[dst_row * stride..(dst_row + 1) * stride].copy_from_slice(&data[src..src + stride]);
        }
        at += stored * plane.height;
        planes.push(out);
    }
    Ok(planes)
}

/// Inverse of [`unpack`]
pub fn pack(format: PixelFormat, width: u32, height: u32, layout: RowLayout, planes: &[Vec<u8>]) -> FormatResult<Vec<u8>> {
    let layouts = format.planes(width, height);
    if planes.len() != layouts.len() {
        return Err(FormatError::malformed(format!("{} needs {} planes, got {}", format, layouts.len(), planes.len())));
    }
    let mut out = Vec::with_capacity(stored_size(format, width, height, layout));
    for (plane, data) in layouts.iter().zip(planes) {
        if data.len() != plane.len() {
            return Err(FormatError::malformed(format!("plane of {} bytes, expected {}", data.len(), plane.len())));
        }
        let stride = plane.stride();
        let pad = layout.stored_stride(stride) - stride;
        for row in 0..plane.height {
            let src_row = if layout.bottom_up() { plane.height - 1 - row } else { row };
            out.extend_from_slice(&data[src_row * stride..(src_row + 1) * stride]);
            out.extend(std::iter::repeat(0u8).take(pad));
        }
    }
    Ok(out)
}

pub struct RawVideoDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    layout: RowLayout,
}

impl RawVideoDecoder {
    pub fn new(width: u32, height: u32, format: PixelFormat, layout: RowLayout) -> Self {
        Self { width, height, format, layout }
    }
}

impl Decoder for RawVideoDecoder {
    fn decode(&mut self, packet: Packet) -> FormatResult<Vec<Frame>> {
        let planes = unpack(self.format, self.width, self.height, self.layout, &packet.data)?;
        Ok(vec![Frame::Video(VideoFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            pts: packet.pts,
            planes,
        })])
    }
}

pub struct RawVideoEncoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    layout: RowLayout,
    stream_index: usize,
}

impl RawVideoEncoder {
    pub fn new(width: u32, height: u32, format: PixelFormat, layout: RowLayout, stream_index: usize) -> Self {
        Self { width, height, format, layout, stream_index }
    }
}

impl Encoder for RawVideoEncoder {
    fn encode(&mut self, frame: Frame) -> FormatResult<Vec<Packet>> {
        let video = match frame {
            Frame::Video(video) => video,
            Frame::Audio(_) => return Err(FormatError::unsupported("video encoder fed an audio frame")),
        };
        if (video.width, video.height, video.format) != (self.width, self.height, self.format) {
            return Err(FormatError::unsupported(format!(
                "encoder configured for {}x{} {} got {}x{} {}",
                self.width, self.height, self.format, video.width, video.height, video.format
            )));
        }
        let data = pack(self.format, self.width, self.height, self.layout, &video.planes)?;
        Ok(vec![Packet {
            stream_index: self.stream_index,
            pts: video.pts,
            duration: 1,
            data,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bottom_up_rows_are_padded_and_flipped() {
        // 1x2 BGR: top pixel 1,2,3 and bottom pixel 4,5,6
        let planes = vec![vec![1, 2, 3, 4, 5, 6]];
        let stored = pack(PixelFormat::Bgr24, 1, 2, RowLayout::BottomUpDword, &planes).unwrap();
        assert_eq!(stored, vec![4, 5, 6, 0, 1, 2, 3, 0]);
        assert_eq!(stored_size(PixelFormat::Bgr24, 1, 2, RowLayout::BottomUpDword), 8);

        let back = unpack(PixelFormat::Bgr24, 1, 2, RowLayout::BottomUpDword, &stored).unwrap();
        assert_eq!(back, planes);
    }

    #[test]
    fn test_planar_unpack_splits_planes() {
        let data: Vec<u8> = (0..6).collect();
        let planes = unpack(PixelFormat::Yuv420p, 2, 2, RowLayout::TopDown, &data).unwrap();
        assert_eq!(planes, vec![vec![0, 1, 2, 3], vec![4], vec![5]]);
    }

    #[test]
    fn test_wrong_size_is_malformed() {
        let mut decoder = RawVideoDecoder::new(2, 2, PixelFormat::Gray8, RowLayout::TopDown);
        let packet = Packet { stream_index: 0, pts: 0, duration: 1, data: vec![0; 3] };
        assert!(matches!(decoder.decode(packet), Err(FormatError::Malformed(_))));
    }

    #[test]
    fn test_encoder_rejects_mismatched_picture() {
        let mut encoder = RawVideoEncoder::new(4, 4, PixelFormat::Gray8, RowLayout::TopDown, 0);
        let frame = Frame::Video(VideoFrame {
            width: 2,
            height: 2,
            format: PixelFormat::Gray8,
            pts: 0,
            planes: vec![vec![0; 4]],
        });
        assert!(encoder.encode(frame).is_err());
    }
}
