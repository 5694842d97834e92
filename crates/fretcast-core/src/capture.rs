use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::{
    encoder::StreamSink,
    job::{CancellationToken, Cancelled},
    playback::{Clock, PlaybackClock, TickOutcome},
    progress::{Phase, ProgressTracker},
    sampler::Sampler,
    surface::{Compositor, Frame, SurfaceLease},
    time::{frame_count, frame_interval_ms, frame_time_ms},
    timeline::Timeline,
};

pub const SNAPSHOT_PATTERN: &str = "frame_%06d.png";
pub const DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("{failures} consecutive frames failed to capture; last at frame {frame_index}: {reason}")]
    TooManyFrameFailures {
        failures: u32,
        frame_index: u64,
        reason: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// Removed from disk when dropped, whichever way the job ends.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: tempfile::TempDir,
    written: u64,
}

impl SnapshotStore {
    pub fn new_in(parent: Option<&Path>) -> anyhow::Result<Self> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("fretcast-frames-");
            builder
        };
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create snapshot parent: {}", parent.display())
                })?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .context("failed to create snapshot directory")?;

        debug!(dir = %dir.path().display(), "snapshot store created");
        Ok(Self { dir, written: 0 })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn frame_path(&self, frame_index: u64) -> PathBuf {
        self.dir.path().join(format!("frame_{frame_index:06}.png"))
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write(&mut self, frame_index: u64, frame: &Frame) -> anyhow::Result<()> {
        let path = self.frame_path(frame_index);
        let image = image::RgbaImage::from_raw(frame.width(), frame.height(), frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame {frame_index} pixel buffer does not match its size"))?;
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
        self.written += 1;
        Ok(())
    }

    pub fn duplicate(&mut self, from_index: u64, frame_index: u64) -> anyhow::Result<()> {
        let from = self.frame_path(from_index);
        let to = self.frame_path(frame_index);
        fs::copy(&from, &to).with_context(|| {
            format!(
                "failed to duplicate snapshot {} to {}",
                from.display(),
                to.display()
            )
        })?;
        self.written += 1;
        Ok(())
    }

    #[must_use]
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = WalkDir::new(self.dir.path())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
            .collect();
        paths.sort();
        paths
    }

    pub fn close(self) -> anyhow::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("failed to remove snapshot directory: {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePolicy {
    pub max_consecutive_failures: u32,
}

impl Default for FramePolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: u64,
    pub failed_frames: u64,
}

pub struct FrameExactCapture<'a> {
    pub timeline: &'a Timeline,
    pub sampler: Sampler,
    pub fps: u32,
    pub policy: FramePolicy,
}

impl FrameExactCapture<'_> {
    #[must_use]
    pub fn total_frames(&self) -> u64 {
        frame_count(self.timeline.total_duration_ms(), self.fps)
    }

    // A failed frame reuses the previous snapshot so the sequence stays gap-free.
    #[instrument(skip_all, fields(fps = self.fps, total_frames = self.total_frames()))]
    pub fn run(
        &self,
        lease: &SurfaceLease,
        compositor: &mut Compositor,
        store: &mut SnapshotStore,
        token: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<CaptureSummary, CaptureError> {
        let total_frames = self.total_frames();
        let end_ms = self.timeline.total_duration_ms() as f64;
        let mut consecutive_failures = 0_u32;
        let mut failed_frames = 0_u64;
        let mut last_good: Option<u64> = None;

        for frame_index in 0..total_frames {
            token.check()?;

            let time_ms = frame_time_ms(frame_index, self.fps).min(end_ms);
            let Some(state) = self.sampler.sample(self.timeline, time_ms) else {
                break;
            };
            lease.draw(&state);

            let captured = match lease.composite_into(compositor) {
                Ok(frame) => {
                    token.check()?;
                    store.write(frame_index, frame)
                }
                Err(error) => Err(anyhow::Error::new(error)),
            };

            match captured {
                Ok(()) => {
                    consecutive_failures = 0;
                    last_good = Some(frame_index);
                }
                Err(error) => {
                    consecutive_failures += 1;
                    failed_frames += 1;
                    warn!(frame_index, consecutive_failures, error = %error, "frame capture failed");
                    if consecutive_failures > self.policy.max_consecutive_failures {
                        return Err(CaptureError::TooManyFrameFailures {
                            failures: consecutive_failures,
                            frame_index,
                            reason: format!("{error:#}"),
                        });
                    }
                    token.check()?;
                    match last_good {
                        Some(previous) => store.duplicate(previous, frame_index)?,
                        None => store.write(frame_index, &compositor.blank())?,
                    }
                }
            }

            tracker.report(Phase::Capture, (frame_index + 1) as f64 / total_frames as f64);
        }

        info!(frames = store.written(), failed_frames, "frame-exact capture finished");
        Ok(CaptureSummary {
            frames: store.written(),
            failed_frames,
        })
    }
}

pub struct StreamingCapture<'a> {
    pub timeline: &'a Arc<Timeline>,
    pub sampler: Sampler,
    pub fps: u32,
}

impl StreamingCapture<'_> {
    #[instrument(skip_all, fields(fps = self.fps, total_ms = self.timeline.total_duration_ms()))]
    pub fn run<C: Clock>(
        &self,
        lease: &SurfaceLease,
        clock: C,
        compositor: &mut Compositor,
        sink: &mut dyn StreamSink,
        token: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<CaptureSummary, CaptureError> {
        let interval_ms = frame_interval_ms(self.fps);
        let mut playback = PlaybackClock::new(Arc::clone(self.timeline), self.sampler, clock, lease)
            .with_auto_reset(false);
        let session = playback.start();

        loop {
            token.check()?;
            let tick_started = playback.clock().now_ms();
            let outcome = playback.tick(session);
            if outcome == TickOutcome::Ignored {
                break;
            }

            let frame = playback
                .target()
                .composite_into(compositor)
                .map_err(anyhow::Error::new)?;
            token.check()?;
            sink.write_frame(frame)?;
            tracker.report(Phase::Capture, playback.progress());

            if matches!(outcome, TickOutcome::Completed(_)) {
                break;
            }

            let spent = playback.clock().now_ms() - tick_started;
            playback.clock().sleep_ms(interval_ms - spent);
        }

        info!(frames = sink.frames_written(), "streaming capture finished");
        Ok(CaptureSummary {
            frames: sink.frames_written(),
            failed_frames: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_store_writes_ordered_pngs_and_cleans_up() {
        let parent = tempfile::tempdir().expect("tempdir should work");
        let mut store = SnapshotStore::new_in(Some(parent.path())).expect("store");
        let frame = Frame::filled(4, 2, [10, 20, 30, 255]);

        store.write(1, &frame).expect("write frame 1");
        store.write(0, &frame).expect("write frame 0");
        store.duplicate(1, 2).expect("duplicate");

        let names: Vec<String> = store
            .artifacts()
            .iter()
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(
            names,
            vec!["frame_000000.png", "frame_000001.png", "frame_000002.png"]
        );

        let decoded = image::open(store.frame_path(2)).expect("png decodes").to_rgba8();
        assert_eq!(decoded.dimensions(), (4, 2));
        assert_eq!(decoded.get_pixel(3, 1).0, [10, 20, 30, 255]);

        let dir = store.dir().to_path_buf();
        store.close().expect("close");
        assert!(!dir.exists());
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let mut store = SnapshotStore::new_in(None).expect("store");
        let broken = Frame::from_raw(4, 4, vec![0; 7]);
        assert!(store.write(0, &broken).is_err());
        assert_eq!(store.written(), 0);
    }
}
