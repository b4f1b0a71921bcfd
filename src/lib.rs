#![forbid(unsafe_code)]

//! Keyframed image generation: parameter interpolation over a timeline, and a single-worker
//! scheduler that drives a generation backend and persists every frame with its parameters.

pub mod backend;
pub mod events;
pub mod foundation;
pub mod interp;
pub mod job;
pub mod library;
pub mod output;
pub mod params;
pub mod preferences;
pub mod scheduler;
pub mod timeline;

pub use backend::{GenerationBackend, Generated, StepState, preview::PreviewBackend};
pub use events::{
    ArtifactPaths, GeneratedArtifact, JobOutcome, ProgressEvent, ResultEvent, SchedulerEvent,
    SchedulerState,
};
pub use foundation::core::{FrameIndex, FrameRange};
pub use foundation::error::{ReverieError, ReverieResult};
pub use interp::{InterpMode, Lerp, interpolate, interpolate_settings};
pub use job::{Job, JobHandle, JobId};
pub use library::{FrameMetadata, FsLibrary, Library};
pub use params::{GeneratorSettings, OutputFormat, OutputSettings, ParameterSet, Sampler, Upscale};
pub use preferences::{ModelSettings, Preferences};
pub use scheduler::{Scheduler, SchedulerOpts};
pub use timeline::{Keyframe, Timeline};
