use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::{
    fixtures::PatternSurface,
    sampler::{RenderState, Sampler},
    surface::{Compositor, DEFAULT_BACKGROUND, DrawingSurface},
    time::{frame_count, frame_time_ms},
    timeline::Timeline,
};

const PARITY_SCHEMA_VERSION: u32 = 1;
const PARITY_SURFACE_SIZE: (u32, u32) = (160, 90);
const STATE_QUANTUM: f64 = 1_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParityReport {
    pub schema_version: u32,
    pub segment_count: usize,
    pub total_duration_ms: u64,
    pub fps: u32,
    pub frame_count: u64,
    pub state_hash: String,
    pub frame_hash: String,
}

#[instrument(skip(timeline, sampler), fields(segments = timeline.len(), fps))]
pub fn generate_parity_report(
    timeline: &Timeline,
    sampler: &Sampler,
    fps: u32,
) -> Result<ParityReport> {
    let total_frames = frame_count(timeline.total_duration_ms(), fps);
    let end_ms = timeline.total_duration_ms() as f64;

    let mut surface = PatternSurface::new(PARITY_SURFACE_SIZE.0, PARITY_SURFACE_SIZE.1);
    let mut compositor = Compositor::new(surface.size(), 1.0, DEFAULT_BACKGROUND);
    let mut states = Sha256::new();
    let mut frames = Sha256::new();

    for frame_index in 0..total_frames {
        let time_ms = frame_time_ms(frame_index, fps).min(end_ms);
        let Some(state) = sampler.sample(timeline, time_ms) else {
            break;
        };
        states.update(quantize(&state));

        surface.draw_frame(&state);
        let frame = compositor
            .composite(surface.layers())
            .with_context(|| format!("failed to composite parity frame {frame_index}"))?;
        frames.update(frame.pixels());
    }

    Ok(ParityReport {
        schema_version: PARITY_SCHEMA_VERSION,
        segment_count: timeline.len(),
        total_duration_ms: timeline.total_duration_ms(),
        fps,
        frame_count: total_frames,
        state_hash: format!("{:x}", states.finalize()),
        frame_hash: format!("{:x}", frames.finalize()),
    })
}

fn quantize(state: &RenderState) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(&(state.chord_index as u64).to_le_bytes());
    for value in [
        state.transition_progress,
        state.build_progress,
        state.chord_progress,
    ] {
        let quantized = (value.clamp(0.0, 1.0) * STATE_QUANTUM).round() as u64;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    bytes
}

pub fn read_parity_report(path: &Path) -> Result<ParityReport> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read parity report: {}", path.display()))?;
    let report: ParityReport =
        serde_json::from_slice(&bytes).context("failed to parse parity report json")?;
    Ok(report)
}

pub fn write_parity_report(path: &Path, report: &ParityReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parity directory: {}", parent.display()))?;
    }

    let json = serde_json::to_vec_pretty(report).context("failed to encode parity report json")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write parity report: {}", path.display()))?;
    Ok(())
}
