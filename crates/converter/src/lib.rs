pub mod config;
pub mod error;
pub mod format;
pub mod job;
pub mod journal;
pub mod media;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod scan;
pub mod scheduler;
pub mod transform;

#[cfg(test)]
mod fixtures;

pub use config::ConverterConfig;
pub use error::{ConvertError, InputError, StageError, ValidationError};
pub use format::FormatRegistry;
pub use job::{validate, JobDescriptor, OutputRequest, StreamRequest};
pub use media::{CodecId, ContainerFormat, MediaInfo, PixelFormat, SampleFormat, StreamInfo, StreamKind};
pub use probe::probe;
pub use progress::{PipelinePhase, ProgressEvent};
pub use scheduler::{JobId, JobReport, JobState, Scheduler, SchedulerSettings};
