use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    export::ExportArtifact,
    quality::{CaptureStrategy, ExportFormat, QualityTier},
};

pub const DEFAULT_EXPORT_FPS: u32 = 30;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("invalid job status transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("render cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn rearm(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Capturing,
    Encoding,
    Complete,
    Cancelled,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Capturing => 1,
            Self::Encoding => 2,
            Self::Complete | Self::Cancelled | Self::Failed => 3,
        }
    }

    // Terminal statuses never change again.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Cancelled | Self::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderRequest {
    pub format: ExportFormat,
    pub quality: QualityTier,
    pub fps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<CaptureStrategy>,
}

impl RenderRequest {
    #[must_use]
    pub fn new(format: ExportFormat, quality: QualityTier) -> Self {
        Self {
            format,
            quality,
            fps: DEFAULT_EXPORT_FPS,
            strategy: None,
        }
    }

    #[must_use]
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: CaptureStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn capture_strategy(&self) -> Option<CaptureStrategy> {
        if self.format.is_video() {
            self.strategy.or(self.format.default_strategy())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderJob {
    pub id: Uuid,
    pub format: ExportFormat,
    pub quality: QualityTier,
    pub strategy: Option<CaptureStrategy>,
    pub fps: u32,
    pub total_frames: u64,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RenderJob {
    #[must_use]
    pub fn new(request: &RenderRequest, total_frames: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            format: request.format,
            quality: request.quality,
            strategy: request.capture_strategy(),
            fps: request.fps,
            total_frames,
            status: JobStatus::Pending,
            progress_percent: 0.0,
            message: None,
            created_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn record_progress(&mut self, percent: f64) {
        if percent.is_finite() {
            self.progress_percent = self.progress_percent.max(percent.clamp(0.0, 100.0));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Complete(ExportArtifact),
    Cancelled,
    Failed(String),
}

impl JobOutcome {
    #[must_use]
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Complete(_) => JobStatus::Complete,
            Self::Cancelled => JobStatus::Cancelled,
            Self::Failed(_) => JobStatus::Failed,
        }
    }

    #[must_use]
    pub fn artifact(&self) -> Option<&ExportArtifact> {
        match self {
            Self::Complete(artifact) => Some(artifact),
            Self::Cancelled | Self::Failed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_only_move_forward() {
        let mut job = RenderJob::new(&RenderRequest::new(ExportFormat::Mp4, QualityTier::High), 60);
        job.transition(JobStatus::Capturing).expect("capture");
        assert!(job.transition(JobStatus::Pending).is_err());
        job.transition(JobStatus::Encoding).expect("encode");
        job.transition(JobStatus::Complete).expect("complete");
        assert_eq!(
            job.transition(JobStatus::Failed),
            Err(JobError::InvalidTransition {
                from: JobStatus::Complete,
                to: JobStatus::Failed,
            })
        );
    }

    #[test]
    fn cancelled_is_terminal() {
        let mut job = RenderJob::new(&RenderRequest::new(ExportFormat::Webm, QualityTier::Low), 10);
        job.transition(JobStatus::Capturing).expect("capture");
        job.transition(JobStatus::Cancelled).expect("cancel");
        assert!(job.transition(JobStatus::Encoding).is_err());
        assert!(job.transition(JobStatus::Cancelled).is_err());
    }

    #[test]
    fn data_exports_skip_capture() {
        let request = RenderRequest::new(ExportFormat::Json, QualityTier::High)
            .with_strategy(CaptureStrategy::FrameExact);
        assert_eq!(request.capture_strategy(), None);
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Encoding));
    }

    #[test]
    fn token_rearms() {
        let token = CancellationToken::new();
        let shared = token.clone();
        shared.cancel();
        assert_eq!(token.check(), Err(Cancelled));
        token.rearm();
        assert!(shared.check().is_ok());
    }

    #[test]
    fn progress_never_regresses() {
        let mut job = RenderJob::new(&RenderRequest::new(ExportFormat::Mp4, QualityTier::High), 1);
        job.record_progress(40.0);
        job.record_progress(10.0);
        job.record_progress(f64::NAN);
        assert!((job.progress_percent - 40.0).abs() < f64::EPSILON);
    }
}
