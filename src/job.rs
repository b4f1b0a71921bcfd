use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rand::Rng;

use crate::{
    foundation::core::FrameRange,
    foundation::error::{ReverieError, ReverieResult},
    params::{OutputSettings, ParameterSet},
    timeline::Timeline,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Unit of scheduler work.
#[derive(Clone, Debug, PartialEq)]
pub enum Job {
    /// One image. `path` is relative to the library; `None` derives a timestamped name.
    Image {
        params: ParameterSet,
        path: Option<PathBuf>,
    },
    /// Every frame of `range`, resolved from the timeline. Output goes to `timeline.path()`.
    Sequence { timeline: Timeline, range: FrameRange },
}

impl Job {
    pub fn image(params: ParameterSet) -> Self {
        Self::Image { params, path: None }
    }

    pub fn image_at(params: ParameterSet, path: impl Into<PathBuf>) -> Self {
        Self::Image {
            params,
            path: Some(path.into()),
        }
    }

    /// All frames of `timeline`.
    pub fn sequence(timeline: Timeline) -> Self {
        let range = FrameRange::first(timeline.length());
        Self::Sequence { timeline, range }
    }

    pub fn sequence_range(timeline: Timeline, range: FrameRange) -> ReverieResult<Self> {
        let job = Self::Sequence { timeline, range };
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> ReverieResult<()> {
        match self {
            Self::Image { .. } => Ok(()),
            Self::Sequence { timeline, range } => {
                timeline.validate()?;
                if range.is_empty() {
                    return Err(ReverieError::validation(
                        "sequence job frame range must be non-empty",
                    ));
                }
                if range.end.0 > timeline.length() {
                    return Err(ReverieError::validation(format!(
                        "sequence job frame range ends at {} but the timeline has {} frames",
                        range.end,
                        timeline.length()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Frames this job produces when it runs to completion.
    pub fn frame_count(&self) -> u64 {
        match self {
            Self::Image { .. } => 1,
            Self::Sequence { range, .. } => range.len_frames(),
        }
    }

    pub fn output_path(&self) -> Option<&Path> {
        match self {
            Self::Image { path, .. } => path.as_deref(),
            Self::Sequence { timeline, .. } => timeline.path(),
        }
    }

    pub fn output_settings(&self) -> &OutputSettings {
        match self {
            Self::Image { params, .. } => &params.output,
            Self::Sequence { timeline, .. } => timeline.output(),
        }
    }

    pub fn randomize_seeds<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        match self {
            Self::Image { params, .. } => params.randomize_seeds(rng),
            Self::Sequence { timeline, .. } => timeline.randomize_seeds(rng),
        }
    }
}

/// Caller-side handle of a submitted job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    id: JobId,
    cancel: Arc<AtomicBool>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, cancel: Arc<AtomicBool>) -> Self {
        Self { id, cancel }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Cancel this job. A queued job is skipped; a running sequence stops before its next frame.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}
