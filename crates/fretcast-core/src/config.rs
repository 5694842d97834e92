use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    capture::DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES,
    coordinator::{CoordinatorConfig, DEFAULT_CANCEL_COOLDOWN, StreamPacing},
    diagnostics::{
        self, DEFAULT_LOG_FILTER, DEFAULT_TRACE_FILE_PREFIX, TelemetryGuard, TracingOptions,
    },
    engine::EngineOptions,
    job::{DEFAULT_EXPORT_FPS, RenderRequest},
    playback::DEFAULT_PROGRESS_INTERVAL_MS,
    progress::DEFAULT_PROGRESS_INTERVAL,
    quality::{CaptureStrategy, ExportFormat, QualityTier},
    sampler::{DEFAULT_TRANSITION_WINDOW_MS, Sampler},
    surface::DEFAULT_BACKGROUND,
    timeline::DEFAULT_MIN_SEGMENT_MS,
};

pub const CONFIG_FILE_NAME: &str = "fretcast.config.toml";
pub const CONFIG_PATH_ENV: &str = "FRETCAST_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub playback: PlaybackConfig,
    pub export: ExportConfig,
    pub diagnostics: DiagnosticsConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub transition_window_ms: f64,
    pub min_segment_ms: u64,
    pub progress_interval_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    pub ffmpeg_binary: String,
    pub fps: u32,
    pub format: ExportFormat,
    pub quality: QualityTier,
    pub strategy: Option<CaptureStrategy>,
    pub max_consecutive_frame_failures: u32,
    pub cancel_cooldown_ms: u64,
    pub progress_interval_ms: u64,
    pub realtime_streaming: bool,
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub rust_log_filter: String,
    pub trace_file_prefix: String,
    pub stdout_json: bool,
    pub span_timings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub logs_dir: PathBuf,
    pub export_dir: PathBuf,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            transition_window_ms: DEFAULT_TRANSITION_WINDOW_MS,
            min_segment_ms: DEFAULT_MIN_SEGMENT_MS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: "ffmpeg".to_string(),
            fps: DEFAULT_EXPORT_FPS,
            format: ExportFormat::Mp4,
            quality: QualityTier::default(),
            strategy: None,
            max_consecutive_frame_failures: DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES,
            cancel_cooldown_ms: u64::try_from(DEFAULT_CANCEL_COOLDOWN.as_millis())
                .unwrap_or(250),
            progress_interval_ms: u64::try_from(DEFAULT_PROGRESS_INTERVAL.as_millis())
                .unwrap_or(50),
            realtime_streaming: true,
            work_dir: None,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rust_log_filter: DEFAULT_LOG_FILTER.to_string(),
            trace_file_prefix: DEFAULT_TRACE_FILE_PREFIX.to_string(),
            stdout_json: false,
            span_timings: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
            export_dir: PathBuf::from("data/exports"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = discover_config_path().with_context(|| {
            format!("failed to locate {CONFIG_FILE_NAME}; looked in cwd and parent directory")
        })?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse config TOML from {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).context("invalid config TOML")?;
        Ok(config)
    }

    // A file that exists but does not parse is still an error.
    pub fn load_or_default() -> Result<Self> {
        match discover_config_path() {
            Ok(path) => Self::load_from(&path),
            Err(error) => {
                debug!(%error, "no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            sampler: Sampler::new(self.playback.transition_window_ms),
            min_segment_ms: self.playback.min_segment_ms,
            export_fps: self.export.fps,
            progress_interval_ms: self.playback.progress_interval_ms,
        }
    }

    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_consecutive_frame_failures: self.export.max_consecutive_frame_failures,
            cancel_cooldown: Duration::from_millis(self.export.cancel_cooldown_ms),
            progress_interval: Duration::from_millis(self.export.progress_interval_ms),
            work_dir: self.export.work_dir.clone(),
            pacing: if self.export.realtime_streaming {
                StreamPacing::RealTime
            } else {
                StreamPacing::Virtual
            },
            background: DEFAULT_BACKGROUND,
            min_segment_ms: self.playback.min_segment_ms,
        }
    }

    #[must_use]
    pub fn render_request(
        &self,
        format: Option<ExportFormat>,
        quality: Option<QualityTier>,
    ) -> RenderRequest {
        let request = RenderRequest::new(
            format.unwrap_or(self.export.format),
            quality.unwrap_or(self.export.quality),
        )
        .with_fps(self.export.fps);
        match self.export.strategy {
            Some(strategy) => request.with_strategy(strategy),
            None => request,
        }
    }
}

impl DiagnosticsConfig {
    pub fn init_tracing(&self, log_dir: &Path) -> Result<TelemetryGuard> {
        diagnostics::init_tracing_with_options(
            log_dir,
            &TracingOptions {
                file_prefix: &self.trace_file_prefix,
                default_filter: &self.rust_log_filter,
                stdout_json: self.stdout_json,
                span_timings: self.span_timings,
            },
        )
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        warn!(path = %path.display(), "{CONFIG_PATH_ENV} does not point at a file");
    }

    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let candidates = [
        cwd.join(CONFIG_FILE_NAME),
        cwd.join("..").join(CONFIG_FILE_NAME),
    ];

    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| anyhow::anyhow!("{CONFIG_FILE_NAME} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_keep_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [export]
            fps = 24
            quality = "ultra"
            strategy = "frame_exact"

            [playback]
            transition_window_ms = 400.0
            "#,
        )
        .expect("config parses");

        assert_eq!(config.export.fps, 24);
        assert_eq!(config.export.quality, QualityTier::Ultra);
        assert_eq!(config.export.ffmpeg_binary, "ffmpeg");
        assert_eq!(config.playback.min_segment_ms, DEFAULT_MIN_SEGMENT_MS);
        assert_eq!(config.diagnostics.trace_file_prefix, "fretcast");

        let request = config.render_request(Some(ExportFormat::Webm), None);
        assert_eq!(request.fps, 24);
        assert_eq!(request.capture_strategy(), Some(CaptureStrategy::FrameExact));
        assert!((config.engine_options().sampler.transition_window_ms - 400.0).abs() < 1e-9);
    }

    #[test]
    fn coordinator_settings_follow_export_section() {
        let config = AppConfig::from_toml_str(
            r#"
            [export]
            cancel_cooldown_ms = 1000
            realtime_streaming = false
            max_consecutive_frame_failures = 7
            "#,
        )
        .expect("config parses");
        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.cancel_cooldown, Duration::from_secs(1));
        assert_eq!(coordinator.pacing, StreamPacing::Virtual);
        assert_eq!(coordinator.max_consecutive_frame_failures, 7);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(AppConfig::from_toml_str("[export]\nfps = \"fast\"").is_err());
    }

    #[test]
    fn shipped_sample_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join(CONFIG_FILE_NAME);
        let config = AppConfig::load_from(&path).expect("sample config parses");
        assert_eq!(config.export.fps, DEFAULT_EXPORT_FPS);
    }
}
