use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::{
    encoder::{EncoderBackend, EncoderFactory, SequenceParams, StreamParams, StreamSink},
    job::{CancellationToken, JobOutcome},
    progress::ProgressObserver,
    sampler::RenderState,
    surface::{DrawingSurface, Frame, Layer},
    timeline::{ChordRef, ChordSegment},
};

const STRING_COUNT: u32 = 6;
const FRET_COUNT: u32 = 5;

fn shape(label: &str, frets: [i8; 6], duration_ms: u64) -> ChordSegment {
    ChordSegment::new(
        ChordRef::with_diagram(label, json!({ "frets": frets, "base_fret": 1 })),
        duration_ms,
    )
}

#[must_use]
pub fn demo_progression() -> Vec<ChordSegment> {
    vec![
        shape("G", [3, 2, 0, 0, 0, 3], 1_200),
        shape("C", [-1, 3, 2, 0, 1, 0], 800),
        shape("D", [-1, -1, 0, 2, 3, 2], 600),
        shape("Em", [0, 2, 2, 0, 0, 0], 1_000),
        shape("C", [-1, 3, 2, 0, 1, 0], 500),
        shape("G", [3, 2, 0, 0, 0, 3], 900),
    ]
}

// `fail_on_draws` holds 1-based draw counts whose marker layer gets truncated.
#[derive(Debug, Clone)]
pub struct PatternSurface {
    width: u32,
    height: u32,
    layers: Vec<Layer>,
    draws: usize,
    fail_on_draws: Vec<usize>,
}

impl PatternSurface {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let mut background = Layer::new("neck", width, height);
        background.frame.fill([92, 58, 33, 255]);

        let mut strings = Layer::new("strings", width, height);
        for string in 0..STRING_COUNT {
            let y = (string + 1) * height / (STRING_COUNT + 1);
            strings.frame.fill_rect(0, y, width, 1, [220, 220, 210, 255]);
        }
        for fret in 1..=FRET_COUNT {
            let x = fret * width / (FRET_COUNT + 1);
            strings.frame.fill_rect(x, 0, 2, height, [180, 180, 190, 200]);
        }

        Self {
            width,
            height,
            layers: vec![background, strings, Layer::new("marker", width, height)],
            draws: 0,
            fail_on_draws: Vec::new(),
        }
    }

    #[must_use]
    pub fn failing_on(mut self, draws: impl IntoIterator<Item = usize>) -> Self {
        self.fail_on_draws = draws.into_iter().collect();
        self
    }

    #[must_use]
    pub fn draws(&self) -> usize {
        self.draws
    }
}

impl Default for PatternSurface {
    fn default() -> Self {
        Self::new(320, 180)
    }
}

impl DrawingSurface for PatternSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn draw_frame(&mut self, state: &RenderState) {
        self.draws += 1;
        let (width, height) = (self.width, self.height);
        let marker = &mut self.layers[2];

        if self.fail_on_draws.contains(&self.draws) {
            marker.frame = Frame::from_raw(width, height, Vec::new());
            return;
        }

        let mut frame = Frame::new(width, height);
        let slot = width / 8;
        let position = (state.chord_index % 8) as f64 + state.transition_progress;
        let x = (position * f64::from(slot)) as u32;
        let bar_height = ((0.25 + 0.75 * state.chord_progress) * f64::from(height)) as u32;
        let alpha = (state.build_progress.clamp(0.0, 1.0) * 255.0).round() as u8;
        frame.fill_rect(x, height - bar_height.min(height), slot.max(1), bar_height, [40, 200, 255, alpha]);
        marker.frame = frame;
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// The "container" is a header line plus one SHA-256 per frame.
#[derive(Debug, Default)]
pub struct InMemoryEncoder {
    fail_sequence: bool,
    aborted: Arc<AtomicUsize>,
}

impl EncoderBackend for InMemoryEncoder {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn open_stream(&mut self, params: &StreamParams) -> Result<Box<dyn StreamSink>> {
        Ok(Box::new(InMemoryStream {
            header: format!(
                "stream {} {}x{}@{}",
                params.format, params.width, params.height, params.fps
            ),
            digests: Vec::new(),
            aborted: Arc::clone(&self.aborted),
        }))
    }

    fn encode_sequence(
        &mut self,
        params: &SequenceParams,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>> {
        if self.fail_sequence {
            bail!("in-memory encoder configured to fail");
        }

        let mut frames: Vec<_> = WalkDir::new(&params.frame_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .map(walkdir::DirEntry::into_path)
            .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
            .collect();
        frames.sort();

        let total = frames.len().max(1) as f64;
        let mut output = format!(
            "sequence {} {}x{}@{} frames={}\n",
            params.format,
            params.width,
            params.height,
            params.fps,
            frames.len()
        );
        for (index, path) in frames.iter().enumerate() {
            if cancel.is_cancelled() {
                bail!("encode cancelled");
            }
            let image = image::open(path)
                .with_context(|| format!("failed to decode snapshot: {}", path.display()))?
                .to_rgba8();
            output.push_str(&digest_hex(image.as_raw()));
            output.push('\n');
            progress((index + 1) as f64 / total);
        }
        Ok(output.into_bytes())
    }
}

struct InMemoryStream {
    header: String,
    digests: Vec<String>,
    aborted: Arc<AtomicUsize>,
}

impl StreamSink for InMemoryStream {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.digests.push(digest_hex(frame.pixels()));
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.digests.len() as u64
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        let mut output = format!("{} frames={}\n", self.header, self.digests.len());
        for digest in &self.digests {
            output.push_str(digest);
            output.push('\n');
        }
        Ok(output.into_bytes())
    }

    fn abort(self: Box<Self>) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryEncoderFactory {
    created: Arc<AtomicUsize>,
    aborted: Arc<AtomicUsize>,
    fail_sequence: bool,
}

impl InMemoryEncoderFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_sequence: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn aborted_streams(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for InMemoryEncoderFactory {
    fn create(&self) -> Result<Box<dyn EncoderBackend>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryEncoder {
            fail_sequence: self.fail_sequence,
            aborted: Arc::clone(&self.aborted),
        }))
    }
}

type ProgressHook = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Default)]
pub struct RecordingObserver {
    progress: Mutex<Vec<f64>>,
    statuses: Mutex<Vec<String>>,
    outcome: Mutex<Option<JobOutcome>>,
    hook: Option<ProgressHook>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_hook(hook: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self {
            hook: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn progress(&self) -> Vec<f64> {
        self.progress.lock().clone()
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.lock().clone()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, percent: f64) {
        self.progress.lock().push(percent);
        if let Some(hook) = &self.hook {
            hook(percent);
        }
    }

    fn on_status(&self, message: &str) {
        self.statuses.lock().push(message.to_string());
    }

    fn on_complete(&self, outcome: &JobOutcome) {
        *self.outcome.lock() = Some(outcome.clone());
    }
}
