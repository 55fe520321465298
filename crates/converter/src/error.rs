use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::media::{CodecId, ContainerFormat, StreamKind};
use crate::scheduler::JobId;

/// The input file could not be inspected
#[derive(Debug, Clone, Error)]
pub enum InputError {
    #[error("cannot read input {}: {source}", .path.display())]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("unrecognized format for {}: {reason}", .path.display())]
    UnrecognizedFormat { path: PathBuf, reason: String },
}

/// The requested output cannot be produced from the probed input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("cannot infer a target container from {}", .0.display())]
    UnknownTargetContainer(PathBuf),
    #[error("no format family registered for {0}")]
    UnregisteredContainer(ContainerFormat),
    #[error("stream {stream}: {container} cannot carry {kind} streams")]
    UnsupportedStreamKind {
        stream: usize,
        kind: StreamKind,
        container: ContainerFormat,
    },
    #[error("stream {stream}: codec {codec} is not supported in {container}")]
    UnsupportedCodec {
        stream: usize,
        codec: CodecId,
        container: ContainerFormat,
    },
    #[error("stream {stream}: source codec {codec} cannot be decoded")]
    UndecodableSource { stream: usize, codec: CodecId },
    #[error("stream {stream}: {param} {value} is outside {min}..={max} supported by {codec}")]
    ParameterOutOfRange {
        stream: usize,
        codec: CodecId,
        param: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("stream {stream}: {reason}")]
    InvalidParameter { stream: usize, reason: String },
    #[error("output {} is the input file", .0.display())]
    OutputIsInput(PathBuf),
    #[error("output {} already exists", .0.display())]
    OutputExists(PathBuf),
    #[error("output {} is not writable: {reason}", .path.display())]
    OutputNotWritable { path: PathBuf, reason: String },
    #[error("no streams left to convert")]
    NoStreams,
    #[error("output {} is already claimed by {job}", .path.display())]
    OutputBusy { path: PathBuf, job: JobId },
}

/// A pipeline stage failed; Decode/Transform/Encode are local to one stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("demux failed: {0}")]
    Demux(String),
    #[error("decode failed on stream {stream}: {message}")]
    Decode { stream: usize, message: String },
    #[error("transform failed on stream {stream}: {message}")]
    Transform { stream: usize, message: String },
    #[error("encode failed on stream {stream}: {message}")]
    Encode { stream: usize, message: String },
    #[error("mux failed: {0}")]
    Mux(String),
    /// An external tool running the whole conversion failed
    #[error("{tool} failed: {message}")]
    External { tool: String, message: String },
}

impl StageError {
    /// Stream the failure is confined to, if any
    pub fn stream(&self) -> Option<usize> {
        match self {
            StageError::Decode { stream, .. }
            | StageError::Transform { stream, .. }
            | StageError::Encode { stream, .. } => Some(*stream),
            StageError::Demux(_) | StageError::Mux(_) | StageError::External { .. } => None,
        }
    }

    /// Demux, mux and external tool failures take the whole job down
    pub fn is_fatal(&self) -> bool {
        self.stream().is_none()
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("job needs {required} bytes of buffer memory but the budget is {budget} bytes")]
    Resource { required: u64, budget: u64 },
    #[error("job was cancelled")]
    Cancelled,
    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

pub type Result<T, E = ConvertError> = std::result::Result<T, E>;
