use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{
    job::{CancellationToken, JobOutcome},
    quality::CaptureStrategy,
};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

/// Estimates longer than this are treated as noise from a stalled start.
pub const MAX_PLAUSIBLE_ESTIMATE: Duration = Duration::from_secs(60 * 60);

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, percent: f64);

    fn on_status(&self, _message: &str) {}

    fn on_complete(&self, _outcome: &JobOutcome) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_progress(&self, _percent: f64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Capture,
    Encode,
    Finalize,
}

impl Phase {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Capture => "capturing frames",
            Self::Encode => "encoding",
            Self::Finalize => "finalizing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePlan {
    capture: (f64, f64),
    encode: (f64, f64),
    finalize: (f64, f64),
}

impl PhasePlan {
    #[must_use]
    pub fn for_strategy(strategy: Option<CaptureStrategy>) -> Self {
        match strategy {
            Some(CaptureStrategy::FrameExact) => Self {
                capture: (0.0, 20.0),
                encode: (20.0, 95.0),
                finalize: (95.0, 100.0),
            },
            // The stream encodes while it captures; only the flush is left.
            Some(CaptureStrategy::Streaming) => Self {
                capture: (0.0, 90.0),
                encode: (90.0, 95.0),
                finalize: (95.0, 100.0),
            },
            None => Self {
                capture: (0.0, 0.0),
                encode: (0.0, 95.0),
                finalize: (95.0, 100.0),
            },
        }
    }

    #[must_use]
    pub fn span(&self, phase: Phase) -> (f64, f64) {
        match phase {
            Phase::Capture => self.capture,
            Phase::Encode => self.encode,
            Phase::Finalize => self.finalize,
        }
    }

    #[must_use]
    pub fn percent(&self, phase: Phase, fraction: f64) -> f64 {
        let (start, end) = self.span(phase);
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        start + (end - start) * fraction
    }
}

#[must_use]
pub fn estimate_remaining(elapsed: Duration, percent: f64) -> Option<Duration> {
    if !percent.is_finite() || percent <= 0.0 {
        return None;
    }
    if percent >= 100.0 {
        return Some(Duration::ZERO);
    }

    let ratio = percent / 100.0;
    let elapsed_secs = elapsed.as_secs_f64();
    let remaining = elapsed_secs / ratio - elapsed_secs;
    if !remaining.is_finite() || remaining > MAX_PLAUSIBLE_ESTIMATE.as_secs_f64() {
        return None;
    }
    Some(Duration::from_secs_f64(remaining.max(0.0)))
}

pub struct ProgressTracker {
    plan: PhasePlan,
    observer: Arc<dyn ProgressObserver>,
    token: CancellationToken,
    min_interval: Duration,
    started: Instant,
    percent: f64,
    last_emit: Option<(Instant, Phase)>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(
        plan: PhasePlan,
        observer: Arc<dyn ProgressObserver>,
        token: CancellationToken,
        min_interval: Duration,
    ) -> Self {
        Self {
            plan,
            observer,
            token,
            min_interval,
            started: Instant::now(),
            percent: 0.0,
            last_emit: None,
        }
    }

    #[must_use]
    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn report(&mut self, phase: Phase, fraction: f64) -> f64 {
        self.percent = self.plan.percent(phase, fraction).max(self.percent);
        if self.token.is_cancelled() {
            return self.percent;
        }

        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some((at, last_phase)) => {
                last_phase != phase
                    || self.percent >= 100.0
                    || now.duration_since(at) >= self.min_interval
            }
        };
        if due {
            trace!(phase = ?phase, percent = self.percent, "progress emitted");
            self.observer.on_progress(self.percent);
            self.last_emit = Some((now, phase));
        }
        self.percent
    }

    pub fn status(&self, phase: Phase, detail: &str) {
        if self.token.is_cancelled() {
            return;
        }
        let message = if detail.is_empty() {
            format!("{:.0}% - {}", self.percent, phase.label())
        } else {
            format!("{:.0}% - {}: {detail}", self.percent, phase.label())
        };
        self.observer.on_status(&message);
    }

    #[must_use]
    pub fn estimated_remaining(&self) -> Option<Duration> {
        estimate_remaining(self.started.elapsed(), self.percent)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect {
        values: Mutex<Vec<f64>>,
    }

    impl ProgressObserver for Collect {
        fn on_progress(&self, percent: f64) {
            self.values.lock().push(percent);
        }
    }

    #[test]
    fn frame_exact_plan_weights_phases() {
        let plan = PhasePlan::for_strategy(Some(CaptureStrategy::FrameExact));
        assert!((plan.percent(Phase::Capture, 0.5) - 10.0).abs() < 1e-9);
        assert!((plan.percent(Phase::Encode, 0.0) - 20.0).abs() < 1e-9);
        assert!((plan.percent(Phase::Encode, 1.0) - 95.0).abs() < 1e-9);
        assert!((plan.percent(Phase::Finalize, 2.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn tracker_never_goes_backwards() {
        let observer = Arc::new(Collect::default());
        let mut tracker = ProgressTracker::new(
            PhasePlan::for_strategy(Some(CaptureStrategy::FrameExact)),
            observer.clone(),
            CancellationToken::new(),
            Duration::ZERO,
        );
        tracker.report(Phase::Encode, 0.5);
        tracker.report(Phase::Capture, 1.0);
        tracker.report(Phase::Finalize, 1.0);

        let values = observer.values.lock().clone();
        assert!(values.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!((values.last().copied().unwrap_or_default() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn throttled_reports_still_emit_phase_changes() {
        let observer = Arc::new(Collect::default());
        let mut tracker = ProgressTracker::new(
            PhasePlan::for_strategy(Some(CaptureStrategy::FrameExact)),
            observer.clone(),
            CancellationToken::new(),
            Duration::from_secs(3_600),
        );
        for step in 0..10 {
            tracker.report(Phase::Capture, f64::from(step) / 10.0);
        }
        tracker.report(Phase::Encode, 0.1);
        assert_eq!(observer.values.lock().len(), 2);
    }

    #[test]
    fn cancellation_silences_tracker() {
        let observer = Arc::new(Collect::default());
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new(
            PhasePlan::for_strategy(None),
            observer.clone(),
            token.clone(),
            Duration::ZERO,
        );
        tracker.report(Phase::Encode, 0.2);
        token.cancel();
        tracker.report(Phase::Encode, 0.9);
        assert_eq!(observer.values.lock().len(), 1);
    }

    #[test]
    fn implausible_estimates_are_rejected() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0.0), None);
        assert_eq!(
            estimate_remaining(Duration::from_secs(10), 50.0),
            Some(Duration::from_secs(10))
        );
        assert_eq!(estimate_remaining(Duration::from_secs(60), 0.01), None);
        assert_eq!(
            estimate_remaining(Duration::from_secs(5), 100.0),
            Some(Duration::ZERO)
        );
    }
}
