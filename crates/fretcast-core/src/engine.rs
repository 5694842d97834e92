use std::{sync::Arc, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::{
    coordinator::{CoordinatorError, JobCoordinator, JobHandle, RenderSource},
    job::{DEFAULT_EXPORT_FPS, JobStatus, RenderJob, RenderRequest},
    playback::{
        Clock, DEFAULT_PROGRESS_INTERVAL_MS, PlaybackClock, PlaybackSession, PlaybackStatus,
        SystemClock, TickOutcome,
    },
    progress::ProgressObserver,
    quality::{ExportFormat, QualityTier},
    sampler::{RenderState, Sampler},
    surface::{LiveTarget, SharedSurface},
    timeline::{ChordSegment, DEFAULT_MIN_SEGMENT_MS, Timeline},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    pub sampler: Sampler,
    pub min_segment_ms: u64,
    pub export_fps: u32,
    pub progress_interval_ms: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sampler: Sampler::default(),
            min_segment_ms: DEFAULT_MIN_SEGMENT_MS,
            export_fps: DEFAULT_EXPORT_FPS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

pub struct Engine<C: Clock = SystemClock> {
    chords: Vec<ChordSegment>,
    timeline: Arc<Timeline>,
    options: EngineOptions,
    surface: SharedSurface,
    playback: PlaybackClock<C, LiveTarget>,
    coordinator: JobCoordinator,
    theme: Value,
}

impl<C: Clock> Engine<C> {
    #[must_use]
    pub fn new(
        surface: SharedSurface,
        clock: C,
        coordinator: JobCoordinator,
        options: EngineOptions,
    ) -> Self {
        let timeline = Arc::new(Timeline::default());
        let playback = PlaybackClock::new(
            Arc::clone(&timeline),
            options.sampler,
            clock,
            surface.live_target(),
        )
        .with_progress_interval_ms(options.progress_interval_ms);

        Self {
            chords: Vec::new(),
            timeline,
            options,
            surface,
            playback,
            coordinator,
            theme: Value::Null,
        }
    }

    #[must_use]
    pub fn with_playback_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.playback = self.playback.with_observer(observer);
        self
    }

    #[must_use]
    pub fn chords(&self) -> &[ChordSegment] {
        &self.chords
    }

    #[must_use]
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    #[must_use]
    pub fn surface(&self) -> &SharedSurface {
        &self.surface
    }

    #[must_use]
    pub fn coordinator(&self) -> &JobCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn theme(&self) -> &Value {
        &self.theme
    }

    pub fn set_theme(&mut self, theme: Value) {
        self.theme = theme;
    }

    #[instrument(skip(self, chords), fields(chords = chords.len()))]
    pub fn set_chords(&mut self, chords: Vec<ChordSegment>) {
        let timeline = Timeline::compile_with_floor(&chords, self.options.min_segment_ms);
        info!(
            segments = timeline.len(),
            total_ms = timeline.total_duration_ms(),
            "timeline compiled"
        );
        self.chords = chords;
        self.timeline = Arc::new(timeline);
        self.playback.set_timeline(Arc::clone(&self.timeline));
    }

    #[must_use]
    pub fn playback_status(&self) -> PlaybackStatus {
        self.playback.status()
    }

    #[must_use]
    pub fn playback_session(&self) -> PlaybackSession {
        self.playback.session()
    }

    #[must_use]
    pub fn playback_clock(&self) -> &C {
        self.playback.clock()
    }

    #[must_use]
    pub fn last_state(&self) -> Option<RenderState> {
        self.playback.last_state()
    }

    pub fn start_animation(&mut self) -> u64 {
        self.playback.start()
    }

    pub fn tick(&mut self, session_id: u64) -> TickOutcome {
        self.playback.tick(session_id)
    }

    pub fn pause_animation(&mut self) {
        self.playback.pause();
    }

    pub fn resume_animation(&mut self) -> Option<u64> {
        self.playback.resume()
    }

    pub fn seek(&mut self, progress: f64) -> Option<RenderState> {
        self.playback.seek(progress)
    }

    pub fn stop_animation(&mut self) {
        self.playback.stop();
    }

    pub fn handle_render(
        &mut self,
        format: ExportFormat,
        quality: QualityTier,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<JobHandle, EngineError> {
        let request = RenderRequest::new(format, quality).with_fps(self.options.export_fps);
        self.render(request, observer)
    }

    // Live playback is paused first so it never competes for the surface.
    #[instrument(skip(self, observer), fields(format = %request.format, quality = %request.quality))]
    pub fn render(
        &mut self,
        request: RenderRequest,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<JobHandle, EngineError> {
        if self.playback.status() == PlaybackStatus::Playing {
            debug!("pausing live playback for export");
            self.playback.pause();
        }

        let source = RenderSource {
            timeline: Arc::clone(&self.timeline),
            sampler: self.options.sampler,
            theme: self.theme.clone(),
        };
        let handle = self
            .coordinator
            .start(request, source, &self.surface, observer)?;
        Ok(handle)
    }

    pub fn cancel_render(&self) -> bool {
        self.coordinator.cancel()
    }

    #[must_use]
    pub fn render_status(&self) -> Option<JobStatus> {
        self.coordinator.status()
    }

    #[must_use]
    pub fn render_progress(&self) -> f64 {
        self.coordinator.progress()
    }

    #[must_use]
    pub fn estimated_time(&self) -> Option<Duration> {
        self.coordinator.estimated_remaining()
    }

    #[must_use]
    pub fn current_job(&self) -> Option<RenderJob> {
        self.coordinator.current_job()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        coordinator::{CoordinatorConfig, StreamPacing},
        fixtures::{InMemoryEncoderFactory, PatternSurface, RecordingObserver, demo_progression},
        job::JobOutcome,
        playback::ManualClock,
        timeline::ChordRef,
    };

    fn engine_under_test() -> (Engine<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let coordinator = JobCoordinator::new(
            Arc::new(InMemoryEncoderFactory::new()),
            CoordinatorConfig {
                pacing: StreamPacing::Virtual,
                progress_interval: Duration::ZERO,
                ..CoordinatorConfig::default()
            },
        );
        let mut engine = Engine::new(
            SharedSurface::new(PatternSurface::new(64, 36)),
            clock.clone(),
            coordinator,
            EngineOptions::default(),
        );
        engine.set_chords(demo_progression());
        (engine, clock)
    }

    #[test]
    fn seek_while_paused_draws_once_and_stays_paused() {
        let (mut engine, clock) = engine_under_test();
        let session = engine.start_animation();
        clock.advance(200.0);
        engine.tick(session);
        engine.pause_animation();

        let state = engine.seek(0.5).expect("seek draws");
        assert_eq!(engine.last_state(), Some(state));
        assert!(!engine.playback_session().is_playing);
        assert_eq!(engine.playback_status(), PlaybackStatus::Paused);
        assert_eq!(engine.tick(session), TickOutcome::Ignored);
    }

    #[test]
    fn set_chords_recompiles_and_stops_playback() {
        let (mut engine, _clock) = engine_under_test();
        engine.start_animation();
        engine.set_chords(vec![ChordSegment::new(ChordRef::new("A"), 20)]);

        assert_eq!(engine.playback_status(), PlaybackStatus::Idle);
        assert_eq!(engine.timeline().total_duration_ms(), DEFAULT_MIN_SEGMENT_MS);
        assert_eq!(engine.chords().len(), 1);
    }

    #[test]
    fn render_pauses_live_playback_first() {
        let (mut engine, clock) = engine_under_test();
        engine.set_theme(json!({ "neck": "maple" }));
        let session = engine.start_animation();
        clock.advance(100.0);
        engine.tick(session);

        let observer = Arc::new(RecordingObserver::new());
        let handle = engine
            .handle_render(ExportFormat::Json, QualityTier::Low, observer.clone())
            .expect("json export starts");
        assert_eq!(engine.playback_status(), PlaybackStatus::Paused);

        let outcome = handle.wait().expect("job finished");
        let JobOutcome::Complete(artifact) = outcome else {
            panic!("expected complete, got {outcome:?}");
        };
        let document = crate::export::parse_data_export(&artifact.bytes).expect("valid json");
        assert_eq!(document.theme["neck"], "maple");
        assert_eq!(document.chords.len(), engine.chords().len());
        assert_eq!(engine.render_status(), Some(JobStatus::Complete));
        assert!((engine.render_progress() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_progressions_fail_fast() {
        let (mut engine, _clock) = engine_under_test();
        engine.set_chords(Vec::new());
        let result = engine.handle_render(
            ExportFormat::Mp4,
            QualityTier::High,
            Arc::new(RecordingObserver::new()),
        );
        assert!(matches!(
            result,
            Err(EngineError::Coordinator(CoordinatorError::EmptyTimeline))
        ));
        assert_eq!(engine.render_status(), None);
        assert!(!engine.cancel_render());
    }
}
