//! Single-worker job scheduler.
//!
//! One dedicated thread owns the [`GenerationBackend`] and the [`Library`] and runs jobs strictly
//! in submission order. Callers talk to it through a lock-protected queue, a handful of atomic
//! flags and the event channels returned by [`Scheduler::subscribe`].
//!
//! ```text
//! Loading ──load ok──▶ Ready ◀──job done──┐
//!    │                   │                 │
//!    └─load failed─▶ Failed  └─job dequeued─▶ Dreaming
//! ```
//!
//! A failing or panicking job never leaves the worker in `Dreaming`: the error is logged, the job
//! is reported as [`JobOutcome::Failed`] and the worker returns to `Ready` for the next job.

use std::{
    any::Any,
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Context as _;

use crate::{
    backend::{GenerationBackend, StepState},
    events::{
        ArtifactPaths, EventBus, GeneratedArtifact, JobOutcome, ProgressEvent, ResultEvent,
        SchedulerEvent, SchedulerState, StateCell,
    },
    foundation::core::FrameIndex,
    foundation::error::{ReverieError, ReverieResult},
    job::{Job, JobHandle, JobId},
    library::{FrameMetadata, Library},
    output::{self, OutputNamer},
    params::ParameterSet,
    timeline::Timeline,
};

#[derive(Clone, Debug)]
pub struct SchedulerOpts {
    /// Bounded wait on an empty queue; the stop flag is re-checked after each wait.
    pub poll_interval: Duration,
    pub thread_name: String,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            thread_name: "reverie-worker".to_string(),
        }
    }
}

struct QueuedJob {
    id: JobId,
    job: Job,
    cancel: Arc<AtomicBool>,
}

struct Shared {
    queue: Mutex<VecDeque<QueuedJob>>,
    available: Condvar,
    state: StateCell,
    stop: AtomicBool,
    current: Mutex<Option<(JobId, Arc<AtomicBool>)>>,
    bus: EventBus,
    next_id: AtomicU64,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<QueuedJob>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current(&self) -> MutexGuard<'_, Option<(JobId, Arc<AtomicBool>)>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pop(&self, timeout: Duration) -> Option<QueuedJob> {
        let mut queue = self.queue();
        if queue.is_empty() {
            queue = self
                .available
                .wait_timeout(queue, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
        queue.pop_front()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.set(state);
        self.bus.emit(SchedulerEvent::StateChanged(state));
    }
}

/// Handle to the worker thread and its job queue.
///
/// Dropping the scheduler requests a stop and joins the worker.
pub struct Scheduler {
    shared: Arc<Shared>,
    opts: SchedulerOpts,
    worker: Option<JoinHandle<ReverieResult<()>>>,
}

impl Scheduler {
    /// A scheduler that is not running yet. Subscribe and queue jobs, then [`start`](Self::start).
    pub fn new(opts: SchedulerOpts) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                state: StateCell::new(SchedulerState::Loading),
                stop: AtomicBool::new(false),
                current: Mutex::new(None),
                bus: EventBus::default(),
                next_id: AtomicU64::new(1),
            }),
            opts,
            worker: None,
        }
    }

    /// `new` followed by `start`.
    pub fn spawn(
        backend: impl GenerationBackend + 'static,
        library: impl Library + 'static,
        opts: SchedulerOpts,
    ) -> ReverieResult<Self> {
        let mut scheduler = Self::new(opts);
        scheduler.start(backend, library)?;
        Ok(scheduler)
    }

    /// Move the backend and library onto a new worker thread and start processing jobs.
    pub fn start(
        &mut self,
        backend: impl GenerationBackend + 'static,
        library: impl Library + 'static,
    ) -> ReverieResult<()> {
        if self.worker.is_some() {
            return Err(ReverieError::validation("scheduler is already started"));
        }
        let worker = Worker {
            shared: self.shared.clone(),
            backend: Box::new(backend),
            library: Box::new(library),
            namer: OutputNamer::new(),
            poll_interval: self.opts.poll_interval,
        };
        let handle = std::thread::Builder::new()
            .name(self.opts.thread_name.clone())
            .spawn(move || worker.run())
            .context("spawn scheduler worker thread")?;
        self.worker = Some(handle);
        Ok(())
    }

    /// New event channel. Only events emitted after this call are delivered.
    pub fn subscribe(&self) -> mpsc::Receiver<SchedulerEvent> {
        self.shared.bus.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state.get()
    }

    /// Jobs waiting in the queue (the running job is not counted).
    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    /// Id of the job currently running, if any.
    pub fn current_job(&self) -> Option<JobId> {
        self.shared.current().as_ref().map(|(id, _)| *id)
    }

    /// Queue a job. Seeds flagged for randomization are rolled here, on the queued copy.
    pub fn submit(&self, mut job: Job) -> ReverieResult<JobHandle> {
        job.validate()?;
        job.randomize_seeds(&mut rand::rng());
        Ok(self.enqueue(job))
    }

    /// Queue a single image; the output name is derived from the current time.
    pub fn submit_image_job(&self, params: &ParameterSet) -> JobHandle {
        let mut job = Job::image(params.clone());
        job.randomize_seeds(&mut rand::rng());
        self.enqueue(job)
    }

    pub fn submit_image_job_at(&self, params: &ParameterSet, path: impl Into<PathBuf>) -> JobHandle {
        let mut job = Job::image_at(params.clone(), path);
        job.randomize_seeds(&mut rand::rng());
        self.enqueue(job)
    }

    /// Queue every frame of `timeline`. The timeline is copied; later edits do not affect the job.
    pub fn submit_sequence_job(&self, timeline: &Timeline) -> ReverieResult<JobHandle> {
        self.submit(Job::sequence(timeline.clone()))
    }

    /// Cancel the running job. Frames already produced are kept; queued jobs are unaffected.
    /// Returns whether a job was running.
    pub fn request_cancel_current(&self) -> bool {
        match self.shared.current().as_ref() {
            Some((id, cancel)) => {
                tracing::info!(job = %id, "cancel requested");
                cancel.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Drop every queued job. The running job continues. Returns the number of dropped jobs.
    pub fn clear_queue(&self) -> usize {
        let dropped: Vec<QueuedJob> = self.shared.queue().drain(..).collect();
        for q in &dropped {
            q.cancel.store(true, Ordering::Release);
            self.shared.bus.emit(SchedulerEvent::JobFinished {
                job: q.id,
                outcome: JobOutcome::Cancelled { frames: 0 },
            });
        }
        if !dropped.is_empty() {
            tracing::info!(count = dropped.len(), "queue cleared");
        }
        dropped.len()
    }

    /// Ask the worker to exit after its current wait or job. Queued jobs are not drained.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.available.notify_all();
    }

    /// Wait for the worker thread to exit. Returns the backend load error, if that is why it exited.
    pub fn join(&mut self) -> ReverieResult<()> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|p| ReverieError::backend(format!("worker thread panicked: {}", panic_message(&*p))))?
    }

    /// `request_stop` followed by `join`.
    pub fn stop(mut self) -> ReverieResult<()> {
        self.request_stop();
        self.join()
    }

    fn enqueue(&self, job: Job) -> JobHandle {
        let id = JobId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = Arc::new(AtomicBool::new(false));
        tracing::debug!(job = %id, frames = job.frame_count(), "job queued");
        self.shared.queue().push_back(QueuedJob {
            id,
            job,
            cancel: cancel.clone(),
        });
        self.shared.available.notify_one();
        JobHandle::new(id, cancel)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.request_stop();
        let _ = self.join();
    }
}

/// Per-call progress context, closed over by the backend step callback.
#[derive(Clone, Copy, Debug)]
struct FrameContext {
    job: JobId,
    frame: FrameIndex,
    position: u64,
    total_frames: u64,
    in_sequence: bool,
}

impl FrameContext {
    fn progress_text(&self) -> String {
        if self.total_frames == 1 {
            SchedulerState::Dreaming.label().to_string()
        } else {
            format!("Dreaming {} of {}...", self.position + 1, self.total_frames)
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    backend: Box<dyn GenerationBackend>,
    library: Box<dyn Library>,
    namer: OutputNamer,
    poll_interval: Duration,
}

impl Worker {
    fn run(mut self) -> ReverieResult<()> {
        self.shared.set_state(SchedulerState::Loading);
        tracing::info!("loading generation backend");

        let loaded = catch_unwind(AssertUnwindSafe(|| self.backend.load())).unwrap_or_else(|p| {
            Err(ReverieError::backend(format!(
                "backend panicked while loading: {}",
                panic_message(&*p)
            )))
        });
        if let Err(e) = loaded {
            tracing::error!(error = %e, "generation backend failed to load");
            self.shared.set_state(SchedulerState::Failed);
            return Err(e);
        }

        self.shared.set_state(SchedulerState::Ready);
        tracing::info!("scheduler ready");

        while !self.shared.stop.load(Ordering::Acquire) {
            if let Some(queued) = self.shared.pop(self.poll_interval) {
                self.run_job(queued);
            }
        }

        tracing::info!(queued = self.shared.queue().len(), "scheduler stopped");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(job = %queued.id))]
    fn run_job(&mut self, queued: QueuedJob) {
        let QueuedJob { id, job, cancel } = queued;

        if cancel.load(Ordering::Acquire) {
            tracing::info!("skipping cancelled job");
            self.shared.bus.emit(SchedulerEvent::JobFinished {
                job: id,
                outcome: JobOutcome::Cancelled { frames: 0 },
            });
            return;
        }

        *self.shared.current() = Some((id, cancel.clone()));
        self.shared.set_state(SchedulerState::Dreaming);
        tracing::info!(frames = job.frame_count(), "job started");

        let mut produced = 0u64;
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.execute(id, &job, &cancel, &mut produced)
        }))
        .unwrap_or_else(|p| {
            Err(ReverieError::backend(format!(
                "job panicked: {}",
                panic_message(&*p)
            )))
        });

        let outcome = match result {
            Ok(false) => JobOutcome::Completed { frames: produced },
            Ok(true) => JobOutcome::Cancelled { frames: produced },
            Err(e) => {
                tracing::error!(error = %e, frames = produced, "job failed");
                JobOutcome::Failed {
                    frames: produced,
                    error: e.to_string(),
                }
            }
        };
        tracing::info!(?outcome, "job finished");

        self.shared.bus.emit(SchedulerEvent::JobFinished { job: id, outcome });
        *self.shared.current() = None;
        self.shared.set_state(SchedulerState::Ready);
    }

    /// Runs every frame of `job`. Returns `true` when it stopped early because of a cancel.
    fn execute(
        &mut self,
        id: JobId,
        job: &Job,
        cancel: &AtomicBool,
        produced: &mut u64,
    ) -> ReverieResult<bool> {
        let format = job.output_settings().format;
        let base = match job.output_path() {
            Some(p) => output::with_format_extension(p, format),
            None => self.namer.next_path(format),
        };
        let total_frames = job.frame_count();

        match job {
            Job::Image { params, .. } => {
                let ctx = FrameContext {
                    job: id,
                    frame: FrameIndex(0),
                    position: 0,
                    total_frames,
                    in_sequence: false,
                };
                self.generate_frame(ctx, params, &base)?;
                *produced += 1;
                Ok(false)
            }
            Job::Sequence { timeline, range } => {
                for (position, frame) in (0u64..).zip(range.iter()) {
                    if cancel.load(Ordering::Acquire) {
                        tracing::info!(frame = frame.0, "sequence cancelled");
                        return Ok(true);
                    }
                    let ctx = FrameContext {
                        job: id,
                        frame,
                        position,
                        total_frames,
                        in_sequence: true,
                    };
                    let params = timeline.resolve(frame);
                    let path = output::frame_file_name(&base, frame);
                    self.generate_frame(ctx, &params, &path)?;
                    *produced += 1;
                }
                Ok(false)
            }
        }
    }

    #[tracing::instrument(skip(self, ctx, params), fields(frame = ctx.frame.0))]
    fn generate_frame(
        &mut self,
        ctx: FrameContext,
        params: &ParameterSet,
        path: &Path,
    ) -> ReverieResult<()> {
        let params = params.normalized();
        let total_steps = params.generator.steps;
        let text = ctx.progress_text();

        let bus = &self.shared.bus;
        let mut on_step = |s: StepState<'_>| {
            bus.emit(SchedulerEvent::Progress(ProgressEvent {
                job: ctx.job,
                state: SchedulerState::Dreaming,
                text: text.clone(),
                step: s.step,
                total_steps,
                frame: ctx.position,
                total_frames: ctx.total_frames,
            }));
        };
        let generated = self.backend.generate(&params, &mut on_step)?;

        let final_image = Arc::new(generated.final_image);
        let raw_image = generated.raw_image.map(Arc::new);
        let paths = ArtifactPaths {
            image: self.library.compose_path(path, None, None),
            raw: raw_image
                .as_ref()
                .map(|_| self.library.compose_path(path, Some(".raw"), None)),
            metadata: self.library.compose_path(path, None, Some("json")),
        };

        let metadata = FrameMetadata::new(path, ctx.in_sequence.then_some(ctx.frame), params.clone());
        let persist_error = self
            .persist(&paths, &final_image, raw_image.as_deref(), &metadata)
            .err()
            .map(|e| {
                tracing::warn!(error = %e, path = %paths.image.display(), "failed to persist artifact");
                e.to_string()
            });
        if persist_error.is_none() {
            tracing::debug!(path = %paths.image.display(), "frame saved");
        }

        self.shared.bus.emit(SchedulerEvent::Result(ResultEvent {
            job: ctx.job,
            frame: ctx.frame,
            total_frames: ctx.total_frames,
            artifact: GeneratedArtifact {
                params,
                final_image,
                raw_image,
                paths,
            },
            persist_error,
        }));
        Ok(())
    }

    fn persist(
        &self,
        paths: &ArtifactPaths,
        final_image: &image::DynamicImage,
        raw_image: Option<&image::DynamicImage>,
        metadata: &FrameMetadata,
    ) -> ReverieResult<()> {
        self.library.save_image(final_image, &paths.image)?;
        if let (Some(raw), Some(raw_path)) = (raw_image, paths.raw.as_deref()) {
            self.library.save_image(raw, raw_path)?;
        }
        self.library.save_metadata(metadata, &paths.metadata)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
