use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    progress::ProgressObserver,
    sampler::{RenderState, Sampler},
    surface::FrameTarget,
    timeline::Timeline,
};

pub const DEFAULT_PROGRESS_INTERVAL_MS: f64 = 50.0;

pub trait Clock: Send {
    fn now_ms(&self) -> f64;

    fn sleep_ms(&self, ms: f64);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1_000.0
    }

    fn sleep_ms(&self, ms: f64) {
        if ms.is_finite() && ms > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(ms / 1_000.0));
        }
    }
}

// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: f64) {
        if ms.is_finite() && ms > 0.0 {
            *self.now.lock() += ms;
        }
    }

    pub fn set(&self, ms: f64) {
        *self.now.lock() = ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }

    fn sleep_ms(&self, ms: f64) {
        self.advance(ms);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PlaybackSession {
    pub session_id: u64,
    pub elapsed_ms: f64,
    pub is_playing: bool,
    pub is_paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Ignored,
    Drew(RenderState),
    Completed(RenderState),
}

pub struct PlaybackClock<C: Clock, T: FrameTarget> {
    timeline: Arc<Timeline>,
    sampler: Sampler,
    clock: C,
    target: T,
    observer: Option<Arc<dyn ProgressObserver>>,
    status: PlaybackStatus,
    session_id: u64,
    elapsed_ms: f64,
    start_perf_ms: f64,
    progress_interval_ms: f64,
    last_emit_ms: Option<f64>,
    last_state: Option<RenderState>,
    auto_reset: bool,
}

impl<C: Clock, T: FrameTarget> PlaybackClock<C, T> {
    #[must_use]
    pub fn new(timeline: Arc<Timeline>, sampler: Sampler, clock: C, target: T) -> Self {
        Self {
            timeline,
            sampler,
            clock,
            target,
            observer: None,
            status: PlaybackStatus::Idle,
            session_id: 0,
            elapsed_ms: 0.0,
            start_perf_ms: 0.0,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            last_emit_ms: None,
            last_state: None,
            auto_reset: true,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn with_progress_interval_ms(mut self, interval_ms: f64) -> Self {
        self.progress_interval_ms = if interval_ms.is_finite() {
            interval_ms.max(0.0)
        } else {
            DEFAULT_PROGRESS_INTERVAL_MS
        };
        self
    }

    // Export capture relies on the final frame staying on the target.
    #[must_use]
    pub fn with_auto_reset(mut self, auto_reset: bool) -> Self {
        self.auto_reset = auto_reset;
        self
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    #[must_use]
    pub fn session(&self) -> PlaybackSession {
        PlaybackSession {
            session_id: self.session_id,
            elapsed_ms: self.elapsed_ms,
            is_playing: self.status == PlaybackStatus::Playing,
            is_paused: self.status == PlaybackStatus::Paused,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    #[must_use]
    pub fn last_state(&self) -> Option<RenderState> {
        self.last_state
    }

    #[must_use]
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    #[must_use]
    pub fn target(&self) -> &T {
        &self.target
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        let total = self.total_ms();
        if total <= 0.0 {
            return 0.0;
        }
        (self.elapsed_ms / total).clamp(0.0, 1.0)
    }

    fn total_ms(&self) -> f64 {
        self.timeline.total_duration_ms() as f64
    }

    pub fn set_timeline(&mut self, timeline: Arc<Timeline>) {
        self.timeline = timeline;
        self.stop();
    }

    #[instrument(skip(self), fields(total_ms = self.timeline.total_duration_ms()))]
    pub fn start(&mut self) -> u64 {
        if self.timeline.is_empty() {
            warn!("start ignored: timeline is empty");
            return self.session_id;
        }

        self.session_id += 1;
        self.elapsed_ms = 0.0;
        self.start_perf_ms = self.clock.now_ms();
        self.last_emit_ms = None;
        self.status = PlaybackStatus::Playing;
        info!(session_id = self.session_id, "playback started");
        self.session_id
    }

    pub fn tick(&mut self, session_id: u64) -> TickOutcome {
        if session_id != self.session_id || self.status != PlaybackStatus::Playing {
            trace!(
                session_id,
                current = self.session_id,
                status = ?self.status,
                "stale tick ignored"
            );
            return TickOutcome::Ignored;
        }

        let now = self.clock.now_ms();
        let total = self.total_ms();
        self.elapsed_ms = (now - self.start_perf_ms).clamp(0.0, total);

        let Some(state) = self.draw_at(self.elapsed_ms) else {
            return TickOutcome::Ignored;
        };

        if self.elapsed_ms >= total {
            self.emit_progress(now, true);
            self.complete();
            return TickOutcome::Completed(state);
        }

        self.emit_progress(now, false);
        TickOutcome::Drew(state)
    }

    #[instrument(skip(self), fields(session_id = self.session_id))]
    pub fn pause(&mut self) {
        if self.status != PlaybackStatus::Playing {
            debug!(status = ?self.status, "pause ignored");
            return;
        }

        let total = self.total_ms();
        self.elapsed_ms = (self.clock.now_ms() - self.start_perf_ms).clamp(0.0, total);
        self.status = PlaybackStatus::Paused;
        info!(elapsed_ms = self.elapsed_ms, "playback paused");
    }

    #[instrument(skip(self), fields(session_id = self.session_id))]
    pub fn resume(&mut self) -> Option<u64> {
        if self.status != PlaybackStatus::Paused || self.timeline.is_empty() {
            debug!(status = ?self.status, "resume ignored");
            return None;
        }

        self.session_id += 1;
        self.start_perf_ms = self.clock.now_ms() - self.elapsed_ms;
        self.last_emit_ms = None;
        self.status = PlaybackStatus::Playing;
        info!(
            session_id = self.session_id,
            elapsed_ms = self.elapsed_ms,
            "playback resumed"
        );
        Some(self.session_id)
    }

    #[instrument(skip(self), fields(session_id = self.session_id))]
    pub fn seek(&mut self, progress: f64) -> Option<RenderState> {
        if self.timeline.is_empty() {
            warn!("seek ignored: timeline is empty");
            return None;
        }

        let progress = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.elapsed_ms = progress * self.total_ms();
        self.status = PlaybackStatus::Paused;

        let state = self.draw_at(self.elapsed_ms)?;
        let now = self.clock.now_ms();
        self.emit_progress(now, true);
        debug!(elapsed_ms = self.elapsed_ms, chord_index = state.chord_index, "seeked");
        Some(state)
    }

    #[instrument(skip(self), fields(session_id = self.session_id))]
    pub fn stop(&mut self) {
        if self.status == PlaybackStatus::Idle {
            return;
        }
        self.status = PlaybackStatus::Idle;
        self.elapsed_ms = 0.0;
        self.last_emit_ms = None;
        info!("playback stopped");
    }

    fn draw_at(&mut self, time_ms: f64) -> Option<RenderState> {
        let state = self.sampler.sample(&self.timeline, time_ms)?;
        self.target.draw(&state);
        self.last_state = Some(state);
        Some(state)
    }

    fn complete(&mut self) {
        self.status = PlaybackStatus::Stopped;
        if self.auto_reset {
            self.elapsed_ms = 0.0;
            let resting = RenderState::resting();
            self.target.draw(&resting);
            self.last_state = Some(resting);
            if let Some(observer) = &self.observer {
                observer.on_progress(0.0);
            }
        }
        info!(session_id = self.session_id, "playback completed");
    }

    fn emit_progress(&mut self, now: f64, force: bool) {
        let Some(observer) = &self.observer else {
            return;
        };
        let due = force
            || self
                .last_emit_ms
                .is_none_or(|last| now - last >= self.progress_interval_ms);
        if due {
            observer.on_progress(self.progress() * 100.0);
            self.last_emit_ms = Some(now);
        }
    }
}
