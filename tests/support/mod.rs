#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

use reverie::{
    FrameMetadata, GenerationBackend, Generated, JobId, JobOutcome, Library, ParameterSet,
    ReverieError, ReverieResult, SchedulerEvent, SchedulerOpts, StepState, output,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "reverie_{name}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ))
}

pub fn fast_opts() -> SchedulerOpts {
    SchedulerOpts {
        poll_interval: Duration::from_millis(20),
        ..SchedulerOpts::default()
    }
}

/// Small parameters so generation stays cheap.
pub fn small_params(steps: u32) -> ParameterSet {
    let mut p = ParameterSet::default();
    p.generator.steps = steps;
    p.output.width = 64;
    p.output.height = 64;
    p
}

/// Test side of a [`ScriptedBackend`] gate.
pub struct GateControl {
    entered: mpsc::Receiver<usize>,
    release: mpsc::Sender<()>,
}

impl GateControl {
    /// Block until the backend has entered generate call `call` (0-based).
    pub fn wait_entered(&self, call: usize) {
        loop {
            let got = self.entered.recv_timeout(TIMEOUT).unwrap();
            if got >= call {
                return;
            }
        }
    }

    pub fn release(&self, calls: usize) {
        for _ in 0..calls {
            self.release.send(()).unwrap();
        }
    }
}

pub(crate) struct Gate {
    entered: mpsc::Sender<usize>,
    release: mpsc::Receiver<()>,
}

/// Backend with scripted failures that records every parameter set it receives.
#[derive(Default)]
pub struct ScriptedBackend {
    pub fail_load: bool,
    pub fail_on: Option<usize>,
    pub panic_on: Option<usize>,
    pub(crate) gate: Option<Gate>,
    pub(crate) calls: usize,
    pub(crate) seen: Arc<Mutex<Vec<ParameterSet>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every generate call blocks until the test releases it.
    pub fn gated() -> (Self, GateControl) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let backend = Self {
            gate: Some(Gate {
                entered: entered_tx,
                release: release_rx,
            }),
            ..Self::default()
        };
        let control = GateControl {
            entered: entered_rx,
            release: release_tx,
        };
        (backend, control)
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<ParameterSet>>> {
        self.seen.clone()
    }
}

impl GenerationBackend for ScriptedBackend {
    fn load(&mut self) -> ReverieResult<()> {
        if self.fail_load {
            return Err(ReverieError::backend("weights not found"));
        }
        Ok(())
    }

    fn generate(
        &mut self,
        params: &ParameterSet,
        on_step: &mut dyn FnMut(StepState<'_>),
    ) -> ReverieResult<Generated> {
        let call = self.calls;
        self.calls += 1;
        self.seen.lock().unwrap().push(params.clone());

        if let Some(gate) = &self.gate {
            gate.entered.send(call).ok();
            gate.release
                .recv_timeout(TIMEOUT)
                .map_err(|_| ReverieError::backend("gate never released"))?;
        }
        if self.panic_on == Some(call) {
            panic!("scripted panic on call {call}");
        }
        if self.fail_on == Some(call) {
            return Err(ReverieError::backend(format!("scripted failure on call {call}")));
        }

        for step in 0..params.generator.steps {
            on_step(StepState {
                step,
                latents: None,
            });
        }
        let img = image::RgbImage::new(params.output.width, params.output.height);
        Ok(Generated::single(image::DynamicImage::ImageRgb8(img)))
    }
}

/// In-memory library that records the paths it was asked to write.
#[derive(Clone, Default)]
pub struct MemoryLibrary {
    pub fail: bool,
    pub written: Arc<Mutex<Vec<PathBuf>>>,
    pub metadata: Arc<Mutex<Vec<FrameMetadata>>>,
}

impl MemoryLibrary {
    fn check(&self) -> ReverieResult<()> {
        if self.fail {
            return Err(ReverieError::persistence("disk full"));
        }
        Ok(())
    }
}

impl Library for MemoryLibrary {
    fn compose_path(
        &self,
        relative: &Path,
        suffix: Option<&str>,
        extension: Option<&str>,
    ) -> PathBuf {
        Path::new("mem").join(output::compose_path(relative, suffix, extension))
    }

    fn save_image(&self, _image: &image::DynamicImage, path: &Path) -> ReverieResult<()> {
        self.check()?;
        self.written.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn save_metadata(&self, metadata: &FrameMetadata, path: &Path) -> ReverieResult<()> {
        self.check()?;
        self.written.lock().unwrap().push(path.to_path_buf());
        self.metadata.lock().unwrap().push(metadata.clone());
        Ok(())
    }
}

/// Collect events until `jobs` jobs have finished.
pub fn collect_jobs(rx: &mpsc::Receiver<SchedulerEvent>, jobs: usize) -> Vec<SchedulerEvent> {
    let mut out = Vec::new();
    let mut finished = 0;
    while finished < jobs {
        let ev = rx.recv_timeout(TIMEOUT).expect("timed out waiting for events");
        if matches!(ev, SchedulerEvent::JobFinished { .. }) {
            finished += 1;
        }
        out.push(ev);
    }
    out
}

/// Collect events until the `StateChanged` event that follows the last finished job.
pub fn collect_jobs_settled(
    rx: &mpsc::Receiver<SchedulerEvent>,
    jobs: usize,
) -> Vec<SchedulerEvent> {
    let mut out = collect_jobs(rx, jobs);
    let ev = rx.recv_timeout(TIMEOUT).expect("timed out waiting for Ready");
    out.push(ev);
    out
}

pub fn outcomes(events: &[SchedulerEvent]) -> Vec<(JobId, JobOutcome)> {
    events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::JobFinished { job, outcome } => Some((*job, outcome.clone())),
            _ => None,
        })
        .collect()
}
