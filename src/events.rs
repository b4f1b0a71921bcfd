//! Notifications emitted by the scheduler's worker.
//!
//! Ordering contract: every subscriber receives events in exactly the order the worker emitted
//! them. Delivery uses unbounded channels, so a slow observer never blocks the worker.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
        mpsc,
    },
};

use image::DynamicImage;

use crate::{foundation::core::FrameIndex, job::JobId, params::ParameterSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SchedulerState {
    Loading = 0,
    Ready = 1,
    Dreaming = 2,
    /// The backend failed to load. Terminal.
    Failed = 3,
}

impl SchedulerState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Loading => "Loading models...",
            Self::Ready => "Ready.",
            Self::Dreaming => "Dreaming...",
            Self::Failed => "Failed.",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Loading,
            1 => Self::Ready,
            2 => Self::Dreaming,
            _ => Self::Failed,
        }
    }
}

/// Lock-free cell for the scheduler state: written by the worker, read from anywhere.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SchedulerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SchedulerState {
        SchedulerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SchedulerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Per-step progress of the running job.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub job: JobId,
    pub state: SchedulerState,
    pub text: String,
    pub step: u32,
    pub total_steps: u32,
    /// 0-based position of the frame inside the job.
    pub frame: u64,
    pub total_frames: u64,
}

impl ProgressEvent {
    /// Job completion in `[0, 1]`.
    pub fn completion(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        let within = if self.total_steps > 1 {
            f64::from(self.step) / f64::from(self.total_steps - 1)
        } else {
            0.0
        };
        ((self.frame as f64 + within) / self.total_frames as f64).clamp(0.0, 1.0)
    }
}

/// Files written for one artifact.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub image: PathBuf,
    pub raw: Option<PathBuf>,
    pub metadata: PathBuf,
}

/// A generated image plus the exact parameters that produced it.
#[derive(Clone, Debug)]
pub struct GeneratedArtifact {
    /// Normalized parameters as sent to the backend.
    pub params: ParameterSet,
    pub final_image: Arc<DynamicImage>,
    /// Pre-post-processing image, when post-processing ran.
    pub raw_image: Option<Arc<DynamicImage>>,
    pub paths: ArtifactPaths,
}

#[derive(Clone, Debug)]
pub struct ResultEvent {
    pub job: JobId,
    /// Timeline frame for sequence jobs, 0 for image jobs.
    pub frame: FrameIndex,
    pub total_frames: u64,
    pub artifact: GeneratedArtifact,
    /// Set when writing the artifact to the library failed; the images are still delivered.
    pub persist_error: Option<String>,
}

impl ResultEvent {
    pub fn params(&self) -> &ParameterSet {
        &self.artifact.params
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { frames: u64 },
    Cancelled { frames: u64 },
    Failed { frames: u64, error: String },
}

impl JobOutcome {
    /// Frames produced before the job ended.
    pub fn frames(&self) -> u64 {
        match self {
            Self::Completed { frames }
            | Self::Cancelled { frames }
            | Self::Failed { frames, .. } => *frames,
        }
    }
}

#[derive(Clone, Debug)]
pub enum SchedulerEvent {
    StateChanged(SchedulerState),
    Progress(ProgressEvent),
    Result(ResultEvent),
    JobFinished { job: JobId, outcome: JobOutcome },
}

/// Fans events out to every subscriber.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<SchedulerEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> mpsc::Receiver<SchedulerEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: SchedulerEvent) {
        let mut subs = self.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<SchedulerEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
