use std::io;
use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::error::InputError;
use crate::format::{FormatError, FormatRegistry, ProbeSource};
use crate::media::MediaInfo;

/// Bytes read from the start of a file before a family takes over
pub const DEFAULT_PROBE_BYTES: usize = 64 * 1024;

/// Probe `path` with the built-in format families
pub fn probe(path: &Path) -> Result<MediaInfo, InputError> {
    probe_with(path, &FormatRegistry::with_defaults(), DEFAULT_PROBE_BYTES)
}

/// Probe `path`, reading at most `max_header` bytes up front.
///
/// Families may seek to further chunk headers but never read sample data.
pub fn probe_with(path: &Path, registry: &FormatRegistry, max_header: usize) -> Result<MediaInfo, InputError> {
    let unreadable = |e: io::Error| InputError::UnreadableInput {
        path: path.to_path_buf(),
        source: Arc::new(e),
    };
    let unrecognized = |reason: String| InputError::UnrecognizedFormat {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(unreadable)?;
    if metadata.is_dir() {
        return Err(unreadable(io::Error::new(io::ErrorKind::Other, "is a directory")));
    }
    if metadata.len() == 0 {
        return Err(unrecognized("file is empty".to_string()));
    }

    let mut source = ProbeSource::open(path, max_header.max(16)).map_err(unreadable)?;
    let family = registry
        .detect(source.header())
        .ok_or_else(|| unrecognized("no registered format family recognises the header".to_string()))?;
    debug!("probing {} as {}", path.display(), family.container());

    family.probe(&mut source).map_err(|e| match e {
        FormatError::Io(e) if e.kind() != io::ErrorKind::UnexpectedEof => unreadable(e),
        other => unrecognized(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::media::{ContainerFormat, SampleFormat};

    #[test]
    fn test_zero_byte_file_is_unrecognized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        std::fs::write(&path, b"").unwrap();

        let err = probe(&path).unwrap_err();
        assert!(matches!(err, InputError::UnrecognizedFormat { .. }), "{:?}", err);
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = probe(&dir.path().join("nope.wav")).unwrap_err();
        assert!(matches!(err, InputError::UnreadableInput { .. }));

        let err = probe(dir.path()).unwrap_err();
        assert!(matches!(err, InputError::UnreadableInput { .. }));
    }

    #[test]
    fn test_foreign_and_truncated_files_are_unrecognized() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("notes.wav");
        std::fs::write(&text, "just some text, not audio").unwrap();
        assert!(matches!(probe(&text), Err(InputError::UnrecognizedFormat { .. })));

        // a RIFF/WAVE header with nothing after it
        let stub = dir.path().join("stub.wav");
        std::fs::write(&stub, b"RIFF\x04\x00\x00\x00WAVE").unwrap();
        assert!(matches!(probe(&stub), Err(InputError::UnrecognizedFormat { .. })));
    }

    #[test]
    fn test_probe_reads_only_the_header_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.wav");
        // ~1.7 MB of audio, far beyond the header window
        fixtures::write_wav(&path, 44_100, 2, SampleFormat::S16, 441_000);

        let info = probe_with(&path, &FormatRegistry::with_defaults(), 512).unwrap();
        assert_eq!(info.container, ContainerFormat::Wav);
        assert_eq!(info.duration.as_secs(), 10);
        assert_eq!(info.file_size, std::fs::metadata(&path).unwrap().len());
    }
}
