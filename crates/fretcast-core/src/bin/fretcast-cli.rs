use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fretcast_core::{
    AppConfig, Clock, Engine, ExportFormat, JobCoordinator, JobOutcome, ProgressObserver,
    QualityTier, SharedSurface, SystemClock, TickOutcome,
    encoder::{EncoderFactory, FfmpegEncoderFactory},
    fixtures::{InMemoryEncoderFactory, PatternSurface, demo_progression},
    generate_parity_report,
    parity::write_parity_report,
    write_artifact,
};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "fretcast-cli")]
#[command(about = "Headless tools for fretcast playback/export/parity workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Render {
        #[arg(long, value_enum)]
        format: Option<VideoFormat>,

        #[arg(long, value_enum)]
        quality: Option<QualityArg>,

        #[arg(long)]
        fps: Option<u32>,

        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        dry_run: bool,
    },
    ExportJson {
        #[arg(long, default_value = "data/exports/demo.json")]
        output: PathBuf,
    },
    ParityReport {
        #[arg(long, default_value = "data/parity/report.json")]
        output: PathBuf,

        #[arg(long)]
        fps: Option<u32>,
    },
    Play {
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VideoFormat {
    Webm,
    Mp4,
}

impl From<VideoFormat> for ExportFormat {
    fn from(value: VideoFormat) -> Self {
        match value {
            VideoFormat::Webm => Self::Webm,
            VideoFormat::Mp4 => Self::Mp4,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QualityArg {
    Low,
    Medium,
    High,
    Ultra,
}

impl From<QualityArg> for QualityTier {
    fn from(value: QualityArg) -> Self {
        match value {
            QualityArg::Low => Self::Low,
            QualityArg::Medium => Self::Medium,
            QualityArg::High => Self::High,
            QualityArg::Ultra => Self::Ultra,
        }
    }
}

struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_progress(&self, percent: f64) {
        info!("progress {percent:.1}%");
    }

    fn on_status(&self, message: &str) {
        info!(%message, "status");
    }
}

struct ScaledClock {
    inner: SystemClock,
    speed: f64,
}

impl Clock for ScaledClock {
    fn now_ms(&self) -> f64 {
        self.inner.now_ms() * self.speed
    }

    fn sleep_ms(&self, ms: f64) {
        self.inner.sleep_ms(ms / self.speed);
    }
}

fn build_engine<C: Clock>(
    config: &AppConfig,
    clock: C,
    factory: Arc<dyn EncoderFactory>,
) -> Engine<C> {
    let coordinator = JobCoordinator::new(factory, config.coordinator_config());
    let mut engine = Engine::new(
        SharedSurface::new(PatternSurface::default()),
        clock,
        coordinator,
        config.engine_options(),
    );
    engine.set_theme(json!({ "neck": "rosewood", "markers": "dots" }));
    engine.set_chords(demo_progression());
    engine
}

fn finish(outcome: Option<JobOutcome>, output: &Path) -> anyhow::Result<()> {
    match outcome {
        Some(JobOutcome::Complete(artifact)) => {
            write_artifact(output, &artifact)?;
            info!(
                path = %output.display(),
                bytes = artifact.bytes.len(),
                frames = artifact.frame_count,
                "export written"
            );
            Ok(())
        }
        Some(JobOutcome::Cancelled) => bail!("export was cancelled"),
        Some(JobOutcome::Failed(message)) => bail!("export failed: {message}"),
        None => bail!("export finished without an outcome"),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_or_default()?,
    };
    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| config.paths.logs_dir.clone());
    let _telemetry = config.diagnostics.init_tracing(&log_dir)?;

    match cli.command {
        Commands::Render {
            format,
            quality,
            fps,
            output,
            dry_run,
        } => {
            let factory: Arc<dyn EncoderFactory> = if dry_run {
                Arc::new(InMemoryEncoderFactory::new())
            } else {
                Arc::new(FfmpegEncoderFactory::new(
                    &config.export.ffmpeg_binary,
                    config.export.work_dir.clone(),
                ))
            };
            let mut engine = build_engine(&config, SystemClock::default(), factory);
            let mut request =
                config.render_request(format.map(Into::into), quality.map(Into::into));
            if let Some(fps) = fps {
                request = request.with_fps(fps);
            }
            if !request.format.is_video() {
                bail!("render expects a video format; use export-json for data exports");
            }
            let output = output.unwrap_or_else(|| {
                config
                    .paths
                    .export_dir
                    .join(format!("demo.{}", request.format.extension()))
            });

            let handle = engine
                .render(request, Arc::new(LogObserver))
                .context("failed to start render")?;
            info!(job_id = %handle.id(), "render started");
            finish(handle.wait(), &output)?;
        }
        Commands::ExportJson { output } => {
            let mut engine = build_engine(
                &config,
                SystemClock::default(),
                Arc::new(InMemoryEncoderFactory::new()),
            );
            let handle = engine
                .handle_render(
                    ExportFormat::Json,
                    config.export.quality,
                    Arc::new(LogObserver),
                )
                .context("failed to start data export")?;
            finish(handle.wait(), &output)?;
        }
        Commands::ParityReport { output, fps } => {
            let engine = build_engine(
                &config,
                SystemClock::default(),
                Arc::new(InMemoryEncoderFactory::new()),
            );
            let options = config.engine_options();
            let report = generate_parity_report(
                engine.timeline(),
                &options.sampler,
                fps.unwrap_or(options.export_fps),
            )?;
            write_parity_report(&output, &report)?;
            info!(path = %output.display(), "parity report generated");
        }
        Commands::Play { speed } => {
            if !speed.is_finite() || speed <= 0.0 {
                bail!("speed must be a positive number, got {speed}");
            }
            let clock = ScaledClock {
                inner: SystemClock::default(),
                speed,
            };
            let mut engine = build_engine(
                &config,
                clock,
                Arc::new(InMemoryEncoderFactory::new()),
            )
            .with_playback_observer(Arc::new(LogObserver));
            let session = engine.start_animation();
            loop {
                match engine.tick(session) {
                    TickOutcome::Drew(_) => {}
                    TickOutcome::Completed(state) => {
                        info!(chord_index = state.chord_index, "playback finished");
                        break;
                    }
                    TickOutcome::Ignored => {
                        warn!("playback stopped unexpectedly");
                        break;
                    }
                }
                std::thread::sleep(Duration::from_millis(16));
            }
        }
    }

    Ok(())
}
