use serde::{Deserialize, Serialize};

use crate::timeline::Timeline;

pub const DEFAULT_TRANSITION_WINDOW_MS: f64 = 530.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RenderState {
    pub chord_index: usize,
    pub transition_progress: f64,
    pub build_progress: f64,
    pub chord_progress: f64,
}

impl RenderState {
    #[must_use]
    pub fn resting() -> Self {
        Self {
            chord_index: 0,
            transition_progress: 0.0,
            build_progress: 1.0,
            chord_progress: 0.0,
        }
    }

    fn entering(chord_index: usize) -> Self {
        Self {
            chord_index,
            ..Self::resting()
        }
    }

    fn holding(chord_index: usize) -> Self {
        Self {
            chord_index,
            chord_progress: 0.5,
            ..Self::resting()
        }
    }

    fn finished(chord_index: usize) -> Self {
        Self {
            chord_index,
            chord_progress: 1.0,
            ..Self::resting()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentWindows {
    pub in_half_ms: f64,
    pub static_ms: f64,
    pub out_half_ms: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sampler {
    pub transition_window_ms: f64,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSITION_WINDOW_MS)
    }
}

impl Sampler {
    #[must_use]
    pub fn new(transition_window_ms: f64) -> Self {
        let transition_window_ms = if transition_window_ms.is_finite() {
            transition_window_ms.max(0.0)
        } else {
            DEFAULT_TRANSITION_WINDOW_MS
        };
        Self {
            transition_window_ms,
        }
    }

    // Both halves are clamped by the shorter neighbour.
    #[must_use]
    pub fn windows(&self, timeline: &Timeline, index: usize) -> Option<SegmentWindows> {
        let segments = timeline.segments();
        let current = segments.get(index)?.duration_ms as f64;
        let window = self.transition_window_ms;

        let transition_in = match index.checked_sub(1).and_then(|prev| segments.get(prev)) {
            Some(prev) => window.min(current).min(prev.duration_ms as f64),
            None => 0.0,
        };
        let transition_out = match segments.get(index + 1) {
            Some(next) => window.min(current).min(next.duration_ms as f64),
            None => 0.0,
        };

        let in_half_ms = transition_in / 2.0;
        let out_half_ms = transition_out / 2.0;
        Some(SegmentWindows {
            in_half_ms,
            static_ms: (current - in_half_ms - out_half_ms).max(0.0),
            out_half_ms,
        })
    }

    #[must_use]
    pub fn sample(&self, timeline: &Timeline, time_ms: f64) -> Option<RenderState> {
        if timeline.is_empty() {
            return None;
        }

        if time_ms.is_nan() || time_ms <= 0.0 {
            return Some(RenderState::resting());
        }

        let Some(index) = timeline.segment_at(time_ms) else {
            return Some(RenderState::finished(timeline.len() - 1));
        };

        let segment = timeline.segment(index)?;
        let windows = self.windows(timeline, index)?;
        let is_last = index + 1 == timeline.len();

        let mut cursor = segment.start_ms as f64;
        if time_ms < cursor + windows.in_half_ms {
            return Some(RenderState::entering(index));
        }

        cursor += windows.in_half_ms;
        if time_ms < cursor + windows.static_ms || windows.out_half_ms <= 0.0 {
            return Some(RenderState::holding(index));
        }

        cursor += windows.static_ms;
        let ratio = ((time_ms - cursor) / windows.out_half_ms).clamp(0.0, 1.0);
        Some(RenderState {
            chord_index: index,
            transition_progress: if is_last { 0.0 } else { ratio },
            build_progress: 1.0,
            chord_progress: ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{ChordRef, ChordSegment};

    fn timeline(durations: &[u64]) -> Timeline {
        let events: Vec<ChordSegment> = durations
            .iter()
            .map(|duration| ChordSegment::new(ChordRef::new("X"), *duration))
            .collect();
        Timeline::compile(&events)
    }

    #[test]
    fn short_neighbour_limits_transition() {
        let timeline = timeline(&[500, 2_000]);
        let sampler = Sampler::new(530.0);

        let first = sampler.windows(&timeline, 0).expect("first segment");
        assert!((first.in_half_ms).abs() < f64::EPSILON);
        assert!((first.out_half_ms - 250.0).abs() < f64::EPSILON);
        assert!((first.static_ms - 250.0).abs() < f64::EPSILON);

        let second = sampler.windows(&timeline, 1).expect("second segment");
        assert!((second.in_half_ms - 250.0).abs() < f64::EPSILON);
        assert!((second.out_half_ms).abs() < f64::EPSILON);
    }

    #[test]
    fn single_chord_start_and_end_states() {
        let timeline = timeline(&[1_000]);
        let sampler = Sampler::default();

        assert_eq!(sampler.sample(&timeline, 0.0), Some(RenderState::resting()));
        let end = sampler.sample(&timeline, 1_000.0).expect("end state");
        assert_eq!(end.chord_index, 0);
        assert!((end.chord_progress - 1.0).abs() < f64::EPSILON);
        assert!((end.transition_progress).abs() < f64::EPSILON);
    }

    #[test]
    fn phases_follow_in_static_out_order() {
        let timeline = timeline(&[500, 2_000]);
        let sampler = Sampler::new(530.0);

        let holding = sampler.sample(&timeline, 100.0).expect("static");
        assert!((holding.chord_progress - 0.5).abs() < f64::EPSILON);

        let out = sampler.sample(&timeline, 375.0).expect("out");
        assert_eq!(out.chord_index, 0);
        assert!((out.transition_progress - 0.5).abs() < 1e-9);
        assert!((out.chord_progress - 0.5).abs() < 1e-9);

        let entering = sampler.sample(&timeline, 600.0).expect("in");
        assert_eq!(entering, RenderState::entering(1));

        let settled = sampler.sample(&timeline, 900.0).expect("static second");
        assert_eq!(settled, RenderState::holding(1));
    }

    #[test]
    fn empty_timeline_samples_nothing() {
        assert_eq!(Sampler::default().sample(&Timeline::default(), 10.0), None);
    }

    #[test]
    fn nan_and_negative_infinity_rest_at_the_start() {
        let timeline = timeline(&[800, 800]);
        let sampler = Sampler::default();
        for time_ms in [f64::NAN, f64::NEG_INFINITY] {
            assert_eq!(
                sampler.sample(&timeline, time_ms),
                Some(RenderState::resting())
            );
        }
    }

    #[test]
    fn positive_infinity_clamps_to_the_end_like_large_times() {
        let timeline = timeline(&[800, 800]);
        let sampler = Sampler::default();
        let at_infinity = sampler.sample(&timeline, f64::INFINITY);
        assert_eq!(at_infinity, sampler.sample(&timeline, 1e12));
        assert_eq!(at_infinity, Some(RenderState::finished(1)));
    }
}
