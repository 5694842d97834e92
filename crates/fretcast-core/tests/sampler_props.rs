use std::sync::Arc;

use fretcast_core::{
    ChordRef, ChordSegment, FrameTarget, ManualClock, PlaybackClock, RenderState, Sampler,
    TickOutcome, Timeline,
    timeline::DEFAULT_MIN_SEGMENT_MS,
};
use proptest::prelude::*;

#[derive(Default)]
struct LastDrawn(Option<RenderState>);

impl FrameTarget for LastDrawn {
    fn draw(&mut self, state: &RenderState) {
        self.0 = Some(*state);
    }
}

fn compile(durations: &[u64]) -> Timeline {
    let events: Vec<ChordSegment> = durations
        .iter()
        .enumerate()
        .map(|(index, duration)| ChordSegment::new(ChordRef::new(format!("C{index}")), *duration))
        .collect();
    Timeline::compile(&events)
}

fn in_unit(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn compiled_boundaries_are_contiguous(durations in prop::collection::vec(0u64..5_000, 0..24)) {
        let timeline = compile(&durations);
        let expected_total: u64 = durations
            .iter()
            .map(|duration| (*duration).max(DEFAULT_MIN_SEGMENT_MS))
            .sum();

        prop_assert_eq!(timeline.len(), durations.len());
        prop_assert_eq!(timeline.total_duration_ms(), expected_total);
        for pair in timeline.segments().windows(2) {
            prop_assert_eq!(pair[0].start_ms + pair[0].duration_ms, pair[1].start_ms);
            prop_assert!(pair[1].start_ms > pair[0].start_ms);
        }
    }

    #[test]
    fn sampling_is_pure_and_bounded(
        durations in prop::collection::vec(1u64..4_000, 1..16),
        window in 0.0f64..2_000.0,
        position in -0.2f64..1.2,
    ) {
        let timeline = compile(&durations);
        let sampler = Sampler::new(window);
        let time_ms = position * timeline.total_duration_ms() as f64;

        let first = sampler.sample(&timeline, time_ms);
        let second = sampler.sample(&timeline, time_ms);
        prop_assert_eq!(first, second);

        let state = first.expect("non-empty timelines always sample");
        prop_assert!(state.chord_index < timeline.len());
        prop_assert!(in_unit(state.transition_progress));
        prop_assert!(in_unit(state.build_progress));
        prop_assert!(in_unit(state.chord_progress));
    }

    #[test]
    fn neighbouring_transitions_are_symmetric(
        durations in prop::collection::vec(1u64..3_000, 2..12),
        window in 0.0f64..1_500.0,
    ) {
        let timeline = compile(&durations);
        let sampler = Sampler::new(window);

        for index in 0..timeline.len() - 1 {
            let current = sampler.windows(&timeline, index).expect("segment exists");
            let next = sampler.windows(&timeline, index + 1).expect("segment exists");
            let d_i = timeline.segments()[index].duration_ms as f64;
            let d_next = timeline.segments()[index + 1].duration_ms as f64;
            let expected = window.min(d_i).min(d_next) / 2.0;

            prop_assert!((current.out_half_ms - expected).abs() < 1e-9);
            prop_assert!((next.in_half_ms - expected).abs() < 1e-9);
            prop_assert!(current.static_ms >= 0.0);
        }
    }

    #[test]
    fn seek_matches_continuous_playback(
        durations in prop::collection::vec(100u64..2_000, 1..8),
        progress in 0.0f64..0.999,
        steps in 1usize..12,
    ) {
        let timeline = Arc::new(compile(&durations));
        let target_ms = progress * timeline.total_duration_ms() as f64;

        let manual = ManualClock::new();
        let mut playing = PlaybackClock::new(
            Arc::clone(&timeline),
            Sampler::default(),
            manual.clone(),
            LastDrawn::default(),
        );
        let session = playing.start();
        for step in 1..steps {
            manual.set(target_ms * step as f64 / steps as f64);
            playing.tick(session);
        }
        manual.set(target_ms);
        let outcome = playing.tick(session);
        prop_assert!(matches!(outcome, TickOutcome::Drew(_)));

        let mut seeking = PlaybackClock::new(
            Arc::clone(&timeline),
            Sampler::default(),
            ManualClock::new(),
            LastDrawn::default(),
        );
        let sought = seeking.seek(progress).expect("seek draws");

        prop_assert_eq!(playing.target().0, Some(sought));
        prop_assert_eq!(Sampler::default().sample(&timeline, target_ms), Some(sought));
    }
}

#[test]
fn two_chord_scenario_splits_the_short_window() {
    let timeline = compile(&[500, 2_000]);
    let sampler = Sampler::new(530.0);

    let first = sampler.windows(&timeline, 0).expect("first");
    assert!((first.out_half_ms - 250.0).abs() < f64::EPSILON);
    assert!((first.static_ms - 250.0).abs() < f64::EPSILON);

    let holding = sampler.sample(&timeline, 100.0).expect("state");
    assert_eq!(holding.chord_index, 0);
    assert!((holding.transition_progress).abs() < f64::EPSILON);

    let mid_out = sampler.sample(&timeline, 375.0).expect("state");
    assert_eq!(mid_out.chord_index, 0);
    assert!((mid_out.transition_progress - 0.5).abs() < 1e-9);

    let entering = sampler.sample(&timeline, 600.0).expect("state");
    assert_eq!(entering.chord_index, 1);
    assert!((entering.chord_progress).abs() < f64::EPSILON);
}

#[test]
fn empty_timelines_sample_nothing() {
    let timeline = compile(&[]);
    assert_eq!(timeline.total_duration_ms(), 0);
    assert_eq!(Sampler::default().sample(&timeline, 10.0), None);
}
