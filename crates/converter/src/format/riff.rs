//! RIFF chunk plumbing shared by the WAV and AVI families.

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::{FormatError, FormatResult, ProbeSource};

pub type FourCc = [u8; 4];

pub fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub fn le_i32(buf: &[u8], at: usize) -> i32 {
    le_u32(buf, at) as i32
}

pub fn fourcc(buf: &[u8], at: usize) -> FourCc {
    [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
}

pub fn fourcc_str(id: &FourCc) -> String {
    String::from_utf8_lossy(id).into_owned()
}

/// Header of one RIFF chunk; `offset` points at the chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: FourCc,
    pub size: u32,
    pub offset: u64,
}

impl ChunkHeader {
    /// Offset of the next sibling chunk (payloads are padded to even length)
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64 + (self.size as u64 & 1)
    }
}

/// Check for `RIFF <size> <form>` at the start of a file
pub fn is_riff_form(header: &[u8], form: &FourCc) -> bool {
    header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == form
}

pub fn read_chunk_header_at(source: &mut ProbeSource, offset: u64) -> FormatResult<ChunkHeader> {
    if offset + 8 > source.file_size() {
        return Err(FormatError::malformed(format!("chunk header at {} runs past end of file", offset)));
    }
    let mut buf = [0u8; 8];
    source.read_at(offset, &mut buf)?;
    Ok(ChunkHeader {
        id: fourcc(&buf, 0),
        size: le_u32(&buf, 4),
        offset: offset + 8,
    })
}

/// Walk sibling chunks in `[start, end)` until `want` is found
pub fn find_chunk(source: &mut ProbeSource, start: u64, end: u64, want: &FourCc) -> FormatResult<Option<ChunkHeader>> {
    let mut pos = start;
    while pos + 8 <= end {
        let chunk = read_chunk_header_at(source, pos)?;
        if &chunk.id == want {
            return Ok(Some(chunk));
        }
        pos = chunk.end();
    }
    Ok(None)
}

/// Read the next chunk header from a sequential reader; `None` at a clean end of file
pub fn read_chunk_header<R: Read + Seek>(reader: &mut R) -> io::Result<Option<ChunkHeader>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk header")),
            n => filled += n,
        }
    }
    let offset = reader.stream_position()?;
    Ok(Some(ChunkHeader {
        id: fourcc(&buf, 0),
        size: le_u32(&buf, 4),
        offset,
    }))
}

/// Start a chunk whose size is patched later; returns the position of the size field
pub fn begin_chunk<W: Write + Seek>(writer: &mut W, id: &FourCc) -> io::Result<u64> {
    writer.write_all(id)?;
    let size_pos = writer.stream_position()?;
    writer.write_all(&0u32.to_le_bytes())?;
    Ok(size_pos)
}

/// Narrow a size, offset or count to a RIFF field; RIFF files stop at 4 GiB
pub fn riff_u32(value: u64, what: &str) -> io::Result<u32> {
    u32::try_from(value).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} {} does not fit a 32-bit RIFF field", what, value),
        )
    })
}

/// Patch the size of a chunk opened with [`begin_chunk`] and pad it to even length
pub fn end_chunk<W: Write + Seek>(writer: &mut W, size_pos: u64) -> io::Result<u32> {
    let end = writer.stream_position()?;
    let size = riff_u32(end - size_pos - 4, "chunk size")?;
    if size & 1 == 1 {
        writer.write_all(&[0])?;
    }
    let resume = writer.stream_position()?;
    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.seek(SeekFrom::Start(resume))?;
    Ok(size)
}

/// Overwrite a little-endian u32 at `pos` without moving the write cursor
pub fn patch_u32<W: Write + Seek>(writer: &mut W, pos: u64, value: u32) -> io::Result<()> {
    let resume = writer.stream_position()?;
    writer.seek(SeekFrom::Start(pos))?;
    writer.write_all(&value.to_le_bytes())?;
    writer.seek(SeekFrom::Start(resume))?;
    Ok(())
}

pub fn write_chunk<W: Write>(writer: &mut W, id: &FourCc, payload: &[u8]) -> io::Result<()> {
    writer.write_all(id)?;
    writer.write_all(&riff_u32(payload.len() as u64, "chunk size")?.to_le_bytes())?;
    writer.write_all(payload)?;
    if payload.len() & 1 == 1 {
        writer.write_all(&[0])?;
    }
    Ok(())
}

/// Fields of a WAVEFORMATEX structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// `wSamplesPerBlock` of IMA ADPCM, zero otherwise
    pub samples_per_block: u16,
}

pub const WAVE_FORMAT_PCM: u16 = 0x0001;
pub const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
pub const WAVE_FORMAT_IMA_ADPCM: u16 = 0x0011;
pub const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

impl WaveFormat {
    pub fn parse(buf: &[u8]) -> FormatResult<Self> {
        if buf.len() < 16 {
            return Err(FormatError::malformed(format!("format chunk is {} bytes, need 16", buf.len())));
        }
        let mut format_tag = le_u16(buf, 0);
        // WAVE_FORMAT_EXTENSIBLE carries the real tag in the first two bytes of the sub-format GUID
        if format_tag == WAVE_FORMAT_EXTENSIBLE && buf.len() >= 26 {
            format_tag = le_u16(buf, 24);
        }
        let samples_per_block = if format_tag == WAVE_FORMAT_IMA_ADPCM && buf.len() >= 20 {
            le_u16(buf, 18)
        } else {
            0
        };
        Ok(Self {
            format_tag,
            channels: le_u16(buf, 2),
            sample_rate: le_u32(buf, 4),
            byte_rate: le_u32(buf, 8),
            block_align: le_u16(buf, 12),
            bits_per_sample: le_u16(buf, 14),
            samples_per_block,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        out.extend_from_slice(&self.format_tag.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.byte_rate.to_le_bytes());
        out.extend_from_slice(&self.block_align.to_le_bytes());
        out.extend_from_slice(&self.bits_per_sample.to_le_bytes());
        if self.format_tag == WAVE_FORMAT_IMA_ADPCM {
            out.extend_from_slice(&2u16.to_le_bytes());
            out.extend_from_slice(&self.samples_per_block.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_odd_chunk_is_padded_and_patched() {
        let mut cursor = Cursor::new(Vec::new());
        let size_pos = begin_chunk(&mut cursor, b"data").unwrap();
        cursor.write_all(&[1, 2, 3]).unwrap();
        let size = end_chunk(&mut cursor, size_pos).unwrap();

        assert_eq!(size, 3);
        let bytes = cursor.into_inner();
        assert_eq!(bytes, vec![b'd', b'a', b't', b'a', 3, 0, 0, 0, 1, 2, 3, 0]);
    }

    /// Tracks the cursor without storing anything
    struct Sparse {
        pos: u64,
    }

    impl Write for Sparse {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.pos += buf.len() as u64;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for Sparse {
        fn seek(&mut self, to: SeekFrom) -> io::Result<u64> {
            self.pos = match to {
                SeekFrom::Start(p) => p,
                SeekFrom::Current(d) => self.pos.saturating_add_signed(d),
                SeekFrom::End(_) => return Err(io::Error::new(io::ErrorKind::Unsupported, "no end")),
            };
            Ok(self.pos)
        }
    }

    #[test]
    fn test_chunk_past_four_gib_is_an_error() {
        let mut writer = Sparse { pos: 0 };
        let size_pos = begin_chunk(&mut writer, b"data").unwrap();
        writer.seek(SeekFrom::Start(u32::MAX as u64 + 16)).unwrap();
        let err = end_chunk(&mut writer, size_pos).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // the largest representable chunk still closes
        let mut writer = Sparse { pos: 0 };
        let size_pos = begin_chunk(&mut writer, b"data").unwrap();
        writer.seek(SeekFrom::Start(size_pos + 4 + u32::MAX as u64 - 1)).unwrap();
        assert_eq!(end_chunk(&mut writer, size_pos).unwrap(), u32::MAX - 1);
        assert!(riff_u32(u32::MAX as u64 + 1, "offset").is_err());
    }

    #[test]
    fn test_sequential_chunk_reader_stops_cleanly() {
        let mut bytes = Vec::new();
        write_chunk(&mut bytes, b"abcd", &[9, 9]).unwrap();
        let mut cursor = Cursor::new(bytes);

        let chunk = read_chunk_header(&mut cursor).unwrap().unwrap();
        assert_eq!(&chunk.id, b"abcd");
        assert_eq!(chunk.size, 2);
        assert_eq!(chunk.end(), 10);
        cursor.seek(SeekFrom::Start(chunk.end())).unwrap();
        assert!(read_chunk_header(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_wave_format_round_trips_adpcm_extension() {
        let fmt = WaveFormat {
            format_tag: WAVE_FORMAT_IMA_ADPCM,
            channels: 2,
            sample_rate: 22_050,
            byte_rate: 22_311,
            block_align: 1024,
            bits_per_sample: 4,
            samples_per_block: 1017,
        };
        let bytes = fmt.to_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(WaveFormat::parse(&bytes).unwrap(), fmt);
    }
}
