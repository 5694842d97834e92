use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

pub const DEFAULT_MIN_SEGMENT_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChordRef {
    pub label: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub diagram: Value,
}

impl ChordRef {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            diagram: Value::Null,
        }
    }

    #[must_use]
    pub fn with_diagram(label: impl Into<String>, diagram: Value) -> Self {
        Self {
            label: label.into(),
            diagram,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChordSegment {
    pub chord: ChordRef,
    pub duration_ms: u64,
}

impl ChordSegment {
    #[must_use]
    pub fn new(chord: ChordRef, duration_ms: u64) -> Self {
        Self { chord, duration_ms }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimedSegment {
    pub chord: ChordRef,
    pub start_ms: u64,
    pub duration_ms: u64,
}

impl TimedSegment {
    #[must_use]
    pub fn end_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Timeline {
    segments: Vec<TimedSegment>,
    total_duration_ms: u64,
}

impl Timeline {
    #[must_use]
    pub fn compile(events: &[ChordSegment]) -> Self {
        Self::compile_with_floor(events, DEFAULT_MIN_SEGMENT_MS)
    }

    #[instrument(skip(events), fields(event_count = events.len(), min_segment_ms))]
    #[must_use]
    pub fn compile_with_floor(events: &[ChordSegment], min_segment_ms: u64) -> Self {
        let floor = min_segment_ms.max(1);
        let mut segments = Vec::with_capacity(events.len());
        let mut cursor = 0_u64;

        for (index, event) in events.iter().enumerate() {
            let duration_ms = if event.duration_ms < floor {
                warn!(
                    index,
                    chord = %event.chord.label,
                    requested_ms = event.duration_ms,
                    floor,
                    "segment duration raised to minimum"
                );
                floor
            } else {
                event.duration_ms
            };

            segments.push(TimedSegment {
                chord: event.chord.clone(),
                start_ms: cursor,
                duration_ms,
            });
            cursor = cursor.saturating_add(duration_ms);
        }

        debug!(
            segments = segments.len(),
            total_duration_ms = cursor,
            "timeline compiled"
        );
        Self {
            segments,
            total_duration_ms: cursor,
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[TimedSegment] {
        &self.segments
    }

    #[must_use]
    pub fn segment(&self, index: usize) -> Option<&TimedSegment> {
        self.segments.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    #[must_use]
    pub fn segment_at(&self, time_ms: f64) -> Option<usize> {
        let index = self
            .segments
            .partition_point(|segment| segment.end_ms() as f64 <= time_ms);
        (index < self.segments.len()).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(durations: &[u64]) -> Vec<ChordSegment> {
        durations
            .iter()
            .enumerate()
            .map(|(index, duration)| ChordSegment::new(ChordRef::new(format!("C{index}")), *duration))
            .collect()
    }

    #[test]
    fn boundaries_are_cumulative() {
        let timeline = Timeline::compile(&events(&[500, 2_000, 750]));
        let starts: Vec<u64> = timeline.segments().iter().map(|s| s.start_ms).collect();
        assert_eq!(starts, vec![0, 500, 2_500]);
        assert_eq!(timeline.total_duration_ms(), 3_250);
    }

    #[test]
    fn zero_duration_is_raised_to_floor() {
        let timeline = Timeline::compile(&events(&[0, 400]));
        assert_eq!(timeline.segments()[0].duration_ms, DEFAULT_MIN_SEGMENT_MS);
        assert_eq!(timeline.segments()[1].start_ms, DEFAULT_MIN_SEGMENT_MS);
        assert_eq!(timeline.total_duration_ms(), 500);
    }

    #[test]
    fn empty_input_yields_zero_duration() {
        let timeline = Timeline::compile(&[]);
        assert!(timeline.is_empty());
        assert_eq!(timeline.total_duration_ms(), 0);
        assert_eq!(timeline.segment_at(0.0), None);
    }

    #[test]
    fn segment_lookup_uses_half_open_ranges() {
        let timeline = Timeline::compile(&events(&[500, 2_000]));
        assert_eq!(timeline.segment_at(-5.0), Some(0));
        assert_eq!(timeline.segment_at(499.9), Some(0));
        assert_eq!(timeline.segment_at(500.0), Some(1));
        assert_eq!(timeline.segment_at(2_499.0), Some(1));
        assert_eq!(timeline.segment_at(2_500.0), None);
    }
}
