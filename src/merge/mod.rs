//! Post-processing of recorded sessions
//!
//! The merge pipeline combines each source's parts into the final media and
//! reports its steps through a progress relay.

pub mod ffmpeg;
pub mod pipeline;
pub mod relay;
pub mod types;

pub use pipeline::{FfmpegMergePipeline, MergePipeline};
pub use relay::{ProgressReceiver, ProgressRelay};
pub use types::{
    MergeError, MergeInput, MergeOutput, MergeStep, ProcessingOptions, ProgressEvent,
    ProgressKind, StepUpdate,
};
