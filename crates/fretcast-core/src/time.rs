#[must_use]
pub fn frame_interval_ms(fps: u32) -> f64 {
    if fps == 0 {
        return 0.0;
    }

    1_000.0 / f64::from(fps)
}

#[must_use]
pub fn frame_count(total_duration_ms: u64, fps: u32) -> u64 {
    if total_duration_ms == 0 || fps == 0 {
        return 0;
    }

    // Integer ceil of total * fps / 1000 avoids float drift on exact multiples.
    let frames = (u128::from(total_duration_ms) * u128::from(fps)).div_ceil(1_000);
    u64::try_from(frames).unwrap_or(u64::MAX)
}

#[must_use]
pub fn frame_time_ms(frame_index: u64, fps: u32) -> f64 {
    frame_index as f64 * frame_interval_ms(fps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_rounds_up_partial_frames() {
        assert_eq!(frame_count(2_000, 30), 60);
        assert_eq!(frame_count(1_001, 30), 31);
        assert_eq!(frame_count(10, 60), 1);
        assert_eq!(frame_count(0, 60), 0);
        assert_eq!(frame_count(1_000, 0), 0);
    }

    #[test]
    fn frame_times_are_evenly_spaced() {
        assert!((frame_time_ms(3, 30) - 100.0).abs() < 1e-9);
        assert!((frame_time_ms(0, 24)).abs() < f64::EPSILON);
        assert!((frame_interval_ms(50) - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn frame_count_survives_very_long_timelines() {
        assert_eq!(frame_count(u64::MAX / 10, 30), 55_340_232_221_128_655);
        assert_eq!(frame_count(u64::MAX, u32::MAX), u64::MAX);
    }
}
