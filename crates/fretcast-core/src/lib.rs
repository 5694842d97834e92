pub mod capture;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod encoder;
pub mod engine;
pub mod export;
pub mod fixtures;
pub mod job;
pub mod parity;
pub mod playback;
pub mod progress;
pub mod quality;
pub mod sampler;
pub mod surface;
pub mod time;
pub mod timeline;

pub use capture::{CaptureError, FramePolicy, SnapshotStore};
pub use config::AppConfig;
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, JobCoordinator, JobHandle, RenderSource, StreamPacing,
};
pub use diagnostics::{TelemetryGuard, TracingOptions, init_tracing, init_tracing_with_options};
pub use encoder::{EncoderBackend, EncoderFactory, FfmpegEncoderFactory, StreamSink};
pub use engine::{Engine, EngineError, EngineOptions};
pub use export::{DataExport, ExportArtifact, build_data_export, write_artifact};
pub use job::{CancellationToken, JobOutcome, JobStatus, RenderJob, RenderRequest};
pub use parity::{ParityReport, generate_parity_report};
pub use playback::{Clock, ManualClock, PlaybackClock, PlaybackStatus, SystemClock, TickOutcome};
pub use progress::{NullObserver, ProgressObserver};
pub use quality::{CaptureStrategy, ExportFormat, QualityTier};
pub use sampler::{RenderState, Sampler};
pub use surface::{DrawingSurface, Frame, FrameTarget, Layer, SharedSurface};
pub use timeline::{ChordRef, ChordSegment, Timeline};
