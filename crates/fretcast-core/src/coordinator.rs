use std::{
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::{
    capture::{
        CaptureError, DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES, FrameExactCapture, FramePolicy,
        SNAPSHOT_PATTERN, SnapshotStore, StreamingCapture,
    },
    encoder::{EncoderBackend, EncoderFactory, SequenceParams, StreamParams, StreamSink},
    export::{ExportArtifact, ExportSettings, build_data_export, data_export_bytes},
    job::{CancellationToken, Cancelled, JobOutcome, JobStatus, RenderJob, RenderRequest},
    playback::{ManualClock, SystemClock},
    progress::{
        DEFAULT_PROGRESS_INTERVAL, Phase, PhasePlan, ProgressObserver, ProgressTracker,
        estimate_remaining,
    },
    quality::{CaptureStrategy, ExportFormat},
    sampler::Sampler,
    surface::{Compositor, DEFAULT_BACKGROUND, Rgba, SharedSurface, SurfaceLease},
    time::frame_count,
    timeline::{DEFAULT_MIN_SEGMENT_MS, Timeline},
};

pub const DEFAULT_CANCEL_COOLDOWN: Duration = Duration::from_millis(250);
pub const MAX_EXPORT_FPS: u32 = 120;
/// Snapshot names carry six digits.
pub const MAX_EXPORT_FRAMES: u64 = 999_999;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("render job already in progress: {0}")]
    JobInProgress(Uuid),
    #[error("render cancelled recently; retry in {remaining_ms} ms")]
    CoolingDown { remaining_ms: u64 },
    #[error("timeline is empty; nothing to render")]
    EmptyTimeline,
    #[error("unsupported export frame rate: {0} (expected 1..={MAX_EXPORT_FPS})")]
    InvalidFrameRate(u32),
    #[error("timeline needs {frames} frames; exports are limited to {MAX_EXPORT_FRAMES}")]
    TimelineTooLong { frames: u64 },
    #[error("drawing surface has no area ({width}x{height})")]
    EmptySurface { width: u32, height: u32 },
    #[error("drawing surface is held by another export")]
    SurfaceBusy,
    #[error("failed to spawn render worker: {0}")]
    Worker(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPacing {
    #[default]
    RealTime,
    Virtual,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_consecutive_frame_failures: u32,
    pub cancel_cooldown: Duration,
    pub progress_interval: Duration,
    pub work_dir: Option<PathBuf>,
    pub pacing: StreamPacing,
    pub background: Rgba,
    pub min_segment_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_frame_failures: DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES,
            cancel_cooldown: DEFAULT_CANCEL_COOLDOWN,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            work_dir: None,
            pacing: StreamPacing::default(),
            background: DEFAULT_BACKGROUND,
            min_segment_ms: DEFAULT_MIN_SEGMENT_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSource {
    pub timeline: Arc<Timeline>,
    pub sampler: Sampler,
    pub theme: Value,
}

#[derive(Default)]
struct CoordinatorState {
    job: Option<RenderJob>,
    started_at: Option<Instant>,
    cancelled_at: Option<Instant>,
    worker: Option<JoinHandle<()>>,
    outcome: Option<(Uuid, JobOutcome)>,
}

impl CoordinatorState {
    fn active_job(&self) -> Option<&RenderJob> {
        self.job.as_ref().filter(|job| job.status.is_active())
    }

    fn job_mut(&mut self, id: Uuid) -> Option<&mut RenderJob> {
        self.job.as_mut().filter(|job| job.id == id)
    }
}

#[derive(Clone)]
pub struct JobCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    token: CancellationToken,
    // Held while forwarding progress and while cancelling, so nothing is
    // forwarded after `cancel` returns. Re-entrant for observers that cancel.
    gate: Arc<ReentrantMutex<()>>,
    factory: Arc<dyn EncoderFactory>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl JobCoordinator {
    #[must_use]
    pub fn new(factory: Arc<dyn EncoderFactory>, config: CoordinatorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            token: CancellationToken::new(),
            gate: Arc::new(ReentrantMutex::new(())),
            factory,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[instrument(skip(self, source, surface, observer), fields(format = %request.format, quality = %request.quality, fps = request.fps))]
    pub fn start(
        &self,
        request: RenderRequest,
        source: RenderSource,
        surface: &SharedSurface,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<JobHandle, CoordinatorError> {
        if request.fps == 0 || request.fps > MAX_EXPORT_FPS {
            return Err(CoordinatorError::InvalidFrameRate(request.fps));
        }
        if source.timeline.is_empty() {
            return Err(CoordinatorError::EmptyTimeline);
        }
        let total_frames = if request.format.is_video() {
            let frames = frame_count(source.timeline.total_duration_ms(), request.fps);
            if frames > MAX_EXPORT_FRAMES {
                return Err(CoordinatorError::TimelineTooLong { frames });
            }
            let (width, height) = surface.size();
            if width == 0 || height == 0 {
                return Err(CoordinatorError::EmptySurface { width, height });
            }
            frames
        } else {
            0
        };

        let mut state = self.state.lock();
        if let Some(job) = state.active_job() {
            return Err(CoordinatorError::JobInProgress(job.id));
        }
        if let Some(cancelled_at) = state.cancelled_at {
            let since = cancelled_at.elapsed();
            if since < self.config.cancel_cooldown {
                let remaining = self.config.cancel_cooldown - since;
                return Err(CoordinatorError::CoolingDown {
                    remaining_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
        // A terminal job's worker is past every checkpoint; let it wind down.
        drop(state.worker.take());

        let lease = match request.capture_strategy() {
            Some(_) => Some(
                surface
                    .acquire_export()
                    .map_err(|_| CoordinatorError::SurfaceBusy)?,
            ),
            None => None,
        };

        self.token.rearm();
        state.cancelled_at = None;

        let job = RenderJob::new(&request, total_frames);
        let job_id = job.id;
        let context = JobContext {
            id: job_id,
            request,
            strategy: job.strategy,
            source,
            config: self.config.clone(),
            factory: Arc::clone(&self.factory),
            token: self.token.clone(),
            shared: Arc::clone(&self.state),
        };
        let reporter = Arc::new(JobReporter {
            job_id,
            shared: Arc::clone(&self.state),
            inner: Arc::clone(&observer),
            token: self.token.clone(),
            gate: Arc::clone(&self.gate),
        });

        // The worker blocks on the state lock until the job is registered.
        let worker = thread::Builder::new()
            .name(format!("fretcast-render-{}", &job_id.simple().to_string()[..8]))
            .spawn(move || run_job(context, lease, reporter, observer))?;

        info!(
            job_id = %job_id,
            total_frames,
            strategy = ?job.strategy,
            "render job started"
        );
        state.job = Some(job);
        state.started_at = Some(Instant::now());
        state.worker = Some(worker);
        state.outcome = None;

        Ok(JobHandle {
            id: job_id,
            coordinator: self.clone(),
        })
    }

    #[instrument(skip(self))]
    pub fn cancel(&self) -> bool {
        let _gate = self.gate.lock();
        let mut state = self.state.lock();
        let Some(job_id) = state.active_job().map(|job| job.id) else {
            debug!("cancel ignored: no active job");
            return false;
        };
        self.token.cancel();
        state.cancelled_at = Some(Instant::now());
        info!(job_id = %job_id, "render cancellation requested");
        true
    }

    #[must_use]
    pub fn status(&self) -> Option<JobStatus> {
        self.state.lock().job.as_ref().map(|job| job.status)
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        self.state
            .lock()
            .job
            .as_ref()
            .map_or(0.0, |job| job.progress_percent)
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.state.lock().active_job().is_some()
    }

    #[must_use]
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let state = self.state.lock();
        let job = state.active_job()?;
        estimate_remaining(state.started_at?.elapsed(), job.progress_percent)
    }

    #[must_use]
    pub fn current_job(&self) -> Option<RenderJob> {
        self.state.lock().job.clone()
    }

    #[must_use]
    pub fn last_outcome(&self) -> Option<JobOutcome> {
        self.state
            .lock()
            .outcome
            .as_ref()
            .map(|(_, outcome)| outcome.clone())
    }

    pub fn wait(&self) -> Option<JobOutcome> {
        let worker = self.state.lock().worker.take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!("render worker panicked");
            let mut state = self.state.lock();
            if let Some(job) = state.job.as_mut().filter(|job| job.status.is_active()) {
                let _ = job.transition(JobStatus::Failed);
                job.message = Some("render worker panicked".to_string());
                let id = job.id;
                state.outcome = Some((id, JobOutcome::Failed("render worker panicked".into())));
            }
        }
        self.last_outcome()
    }
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    coordinator: JobCoordinator,
}

impl JobHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn wait(&self) -> Option<JobOutcome> {
        self.coordinator.wait();
        let state = self.coordinator.state.lock();
        state
            .outcome
            .as_ref()
            .filter(|(id, _)| *id == self.id)
            .map(|(_, outcome)| outcome.clone())
    }
}

// Forwards nothing once the job is cancelled.
struct JobReporter {
    job_id: Uuid,
    shared: Arc<Mutex<CoordinatorState>>,
    inner: Arc<dyn ProgressObserver>,
    token: CancellationToken,
    gate: Arc<ReentrantMutex<()>>,
}

impl ProgressObserver for JobReporter {
    fn on_progress(&self, percent: f64) {
        if let Some(job) = self.shared.lock().job_mut(self.job_id) {
            job.record_progress(percent);
        }
        let _gate = self.gate.lock();
        if !self.token.is_cancelled() {
            self.inner.on_progress(percent);
        }
    }

    fn on_status(&self, message: &str) {
        if let Some(job) = self.shared.lock().job_mut(self.job_id) {
            job.message = Some(message.to_string());
        }
        let _gate = self.gate.lock();
        if !self.token.is_cancelled() {
            self.inner.on_status(message);
        }
    }
}

struct JobContext {
    id: Uuid,
    request: RenderRequest,
    strategy: Option<CaptureStrategy>,
    source: RenderSource,
    config: CoordinatorConfig,
    factory: Arc<dyn EncoderFactory>,
    token: CancellationToken,
    shared: Arc<Mutex<CoordinatorState>>,
}

impl JobContext {
    fn set_status(&self, next: JobStatus) {
        let mut state = self.shared.lock();
        let Some(job) = state.job_mut(self.id) else {
            return;
        };
        if job.status == next {
            return;
        }
        match job.transition(next) {
            Ok(()) => debug!(status = ?next, "job status changed"),
            Err(error) => warn!(error = %error, "job status change rejected"),
        }
    }

    fn frame_policy(&self) -> FramePolicy {
        FramePolicy {
            max_consecutive_failures: self.config.max_consecutive_frame_failures,
        }
    }
}

// Dropping this releases everything a job holds.
struct JobResources {
    lease: Option<SurfaceLease>,
    encoder: Option<Box<dyn EncoderBackend>>,
    sink: Option<Box<dyn StreamSink>>,
    snapshots: Option<SnapshotStore>,
}

impl Drop for JobResources {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.abort();
        }
        if let Some(store) = self.snapshots.take() {
            let artifacts = store.artifacts().len();
            match store.close() {
                Ok(()) => debug!(artifacts, "snapshot artifacts removed"),
                Err(error) => warn!(error = %format!("{error:#}"), "snapshot cleanup failed"),
            }
        }
        if let Some(encoder) = self.encoder.take() {
            debug!(encoder = encoder.name(), "encoder torn down");
        }
        self.lease = None;
        debug!("job resources released");
    }
}

enum Interrupt {
    Cancelled,
    Failed(String),
}

impl From<Cancelled> for Interrupt {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<anyhow::Error> for Interrupt {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(format!("{error:#}"))
    }
}

impl From<CaptureError> for Interrupt {
    fn from(error: CaptureError) -> Self {
        match error {
            CaptureError::Cancelled(_) => Self::Cancelled,
            other => Self::Failed(other.to_string()),
        }
    }
}

fn run_job(
    context: JobContext,
    lease: Option<SurfaceLease>,
    reporter: Arc<JobReporter>,
    observer: Arc<dyn ProgressObserver>,
) {
    let span = info_span!("render_job", job_id = %context.id, format = %context.request.format);
    let _entered = span.enter();

    let mut tracker = ProgressTracker::new(
        PhasePlan::for_strategy(context.strategy),
        reporter,
        context.token.clone(),
        context.config.progress_interval,
    );
    let mut resources = JobResources {
        lease,
        encoder: None,
        sink: None,
        snapshots: None,
    };

    let result = execute(&context, &mut resources, &mut tracker);
    drop(resources);

    let outcome = match result {
        Ok(artifact) => JobOutcome::Complete(artifact),
        Err(_) if context.token.is_cancelled() => JobOutcome::Cancelled,
        Err(Interrupt::Cancelled) => JobOutcome::Cancelled,
        Err(Interrupt::Failed(message)) => JobOutcome::Failed(message),
    };

    {
        let mut state = context.shared.lock();
        if let Some(job) = state.job_mut(context.id) {
            if let Err(error) = job.transition(outcome.status()) {
                warn!(error = %error, "terminal status rejected");
            }
            match &outcome {
                JobOutcome::Complete(_) => job.record_progress(100.0),
                JobOutcome::Cancelled => job.message = Some("render cancelled".to_string()),
                JobOutcome::Failed(message) => job.message = Some(message.clone()),
            }
        }
        state.outcome = Some((context.id, outcome.clone()));
    }

    match &outcome {
        JobOutcome::Complete(artifact) => info!(
            bytes = artifact.bytes.len(),
            frames = artifact.frame_count,
            "render job complete"
        ),
        JobOutcome::Cancelled => info!("render job cancelled"),
        JobOutcome::Failed(message) => error!(message = %message, "render job failed"),
    }
    observer.on_complete(&outcome);
}

fn execute(
    context: &JobContext,
    resources: &mut JobResources,
    tracker: &mut ProgressTracker,
) -> Result<ExportArtifact, Interrupt> {
    let artifact = match context.strategy {
        None => export_data(context, tracker)?,
        Some(CaptureStrategy::FrameExact) => render_frame_exact(context, resources, tracker)?,
        Some(CaptureStrategy::Streaming) => render_streaming(context, resources, tracker)?,
    };

    context.token.check()?;
    tracker.status(Phase::Finalize, "");
    tracker.report(Phase::Finalize, 1.0);
    Ok(artifact)
}

fn export_data(
    context: &JobContext,
    tracker: &mut ProgressTracker,
) -> Result<ExportArtifact, Interrupt> {
    context.set_status(JobStatus::Encoding);
    context.token.check()?;
    tracker.status(Phase::Encode, "building data export");

    let settings = ExportSettings {
        fps: context.request.fps,
        quality: context.request.quality,
        transition_window_ms: context.source.sampler.transition_window_ms,
        min_segment_ms: context.config.min_segment_ms,
    };
    let document = build_data_export(
        &context.source.timeline,
        settings,
        context.source.theme.clone(),
    );
    let bytes = data_export_bytes(&document)?;
    tracker.report(Phase::Encode, 1.0);
    Ok(ExportArtifact::new(ExportFormat::Json, bytes, 0))
}

fn prepare(context: &JobContext, lease: &SurfaceLease) -> Result<Compositor, Interrupt> {
    context.token.check()?;
    let params = context.request.quality.params();
    let compositor = Compositor::new(lease.size(), params.scale, context.config.background);
    debug!(size = ?compositor.size(), scale = params.scale, "compositor prepared");
    Ok(compositor)
}

fn render_frame_exact(
    context: &JobContext,
    resources: &mut JobResources,
    tracker: &mut ProgressTracker,
) -> Result<ExportArtifact, Interrupt> {
    let Some(lease) = resources.lease.as_ref() else {
        return Err(Interrupt::Failed("export surface was not acquired".into()));
    };
    let mut compositor = prepare(context, lease)?;
    let (width, height) = compositor.size();

    context.set_status(JobStatus::Capturing);
    let store = resources.snapshots.insert(SnapshotStore::new_in(
        context.config.work_dir.as_deref(),
    )?);
    let capture = FrameExactCapture {
        timeline: &context.source.timeline,
        sampler: context.source.sampler,
        fps: context.request.fps,
        policy: context.frame_policy(),
    };
    tracker.status(
        Phase::Capture,
        &format!("{} frames at {width}x{height}", capture.total_frames()),
    );
    let summary = capture.run(lease, &mut compositor, store, &context.token, tracker)?;

    context.set_status(JobStatus::Encoding);
    context.token.check()?;
    tracker.status(Phase::Encode, "");
    let encoder = resources.encoder.insert(context.factory.create()?);
    let sequence = SequenceParams {
        format: context.request.format,
        frame_dir: store.dir().to_path_buf(),
        pattern: SNAPSHOT_PATTERN.to_string(),
        frame_count: summary.frames,
        width,
        height,
        fps: context.request.fps,
        params: context.request.quality.params(),
    };
    let bytes = encoder.encode_sequence(&sequence, &context.token, &mut |fraction| {
        tracker.report(Phase::Encode, fraction);
    })?;
    context.token.check()?;

    Ok(ExportArtifact::new(
        context.request.format,
        bytes,
        summary.frames,
    ))
}

fn render_streaming(
    context: &JobContext,
    resources: &mut JobResources,
    tracker: &mut ProgressTracker,
) -> Result<ExportArtifact, Interrupt> {
    let Some(lease) = resources.lease.as_ref() else {
        return Err(Interrupt::Failed("export surface was not acquired".into()));
    };
    let mut compositor = prepare(context, lease)?;
    let (width, height) = compositor.size();

    context.set_status(JobStatus::Capturing);
    context.token.check()?;
    let encoder = resources.encoder.insert(context.factory.create()?);
    let sink = resources.sink.insert(encoder.open_stream(&StreamParams {
        format: context.request.format,
        width,
        height,
        fps: context.request.fps,
        params: context.request.quality.params(),
    })?);
    tracker.status(Phase::Capture, &format!("streaming at {width}x{height}"));

    let capture = StreamingCapture {
        timeline: &context.source.timeline,
        sampler: context.source.sampler,
        fps: context.request.fps,
    };
    let summary = match context.config.pacing {
        StreamPacing::RealTime => capture.run(
            lease,
            SystemClock::default(),
            &mut compositor,
            &mut **sink,
            &context.token,
            tracker,
        )?,
        StreamPacing::Virtual => capture.run(
            lease,
            ManualClock::new(),
            &mut compositor,
            &mut **sink,
            &context.token,
            tracker,
        )?,
    };

    context.set_status(JobStatus::Encoding);
    context.token.check()?;
    tracker.status(Phase::Encode, "flushing stream");
    let sink = resources
        .sink
        .take()
        .ok_or_else(|| Interrupt::Failed("stream encoder was not opened".into()))?;
    let bytes = sink.finish()?;
    tracker.report(Phase::Encode, 1.0);

    Ok(ExportArtifact::new(
        context.request.format,
        bytes,
        summary.frames,
    ))
}
