use std::{
    fs,
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::{
    job::CancellationToken,
    quality::{EncoderParams, ExportFormat},
    surface::Frame,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub format: ExportFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub params: EncoderParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceParams {
    pub format: ExportFormat,
    pub frame_dir: PathBuf,
    pub pattern: String,
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub params: EncoderParams,
}

pub trait StreamSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    fn frames_written(&self) -> u64;

    fn finish(self: Box<Self>) -> Result<Vec<u8>>;

    fn abort(self: Box<Self>);
}

pub trait EncoderBackend: Send {
    fn name(&self) -> &'static str;

    fn open_stream(&mut self, params: &StreamParams) -> Result<Box<dyn StreamSink>>;

    // Must return promptly once `cancel` is set.
    fn encode_sequence(
        &mut self,
        params: &SequenceParams,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>>;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn EncoderBackend>>;
}

fn cpu_used_for_preset(preset: &str) -> u8 {
    match preset {
        "ultrafast" | "superfast" => 8,
        "veryfast" | "faster" => 6,
        "fast" | "medium" => 4,
        _ => 2,
    }
}

#[must_use]
pub fn video_codec_args(format: ExportFormat, params: &EncoderParams) -> Vec<String> {
    let bitrate = params.video_bitrate_kbps;
    match format {
        ExportFormat::Mp4 => vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            params.preset.to_string(),
            "-crf".to_string(),
            params.crf.to_string(),
            "-maxrate".to_string(),
            format!("{bitrate}k"),
            "-bufsize".to_string(),
            format!("{}k", bitrate.saturating_mul(2)),
            "-pix_fmt".to_string(),
            params.pixel_format.to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ],
        ExportFormat::Webm => vec![
            "-c:v".to_string(),
            "libvpx-vp9".to_string(),
            "-b:v".to_string(),
            format!("{bitrate}k"),
            "-deadline".to_string(),
            "realtime".to_string(),
            "-cpu-used".to_string(),
            cpu_used_for_preset(params.preset).to_string(),
            "-pix_fmt".to_string(),
            params.pixel_format.to_string(),
        ],
        ExportFormat::Json => Vec::new(),
    }
}

#[must_use]
pub fn stream_args(params: &StreamParams, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-s".to_string(),
        format!("{}x{}", params.width, params.height),
        "-r".to_string(),
        params.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
    ];
    args.extend(video_codec_args(params.format, &params.params));
    args.push(output.to_string_lossy().into_owned());
    args
}

#[must_use]
pub fn sequence_args(params: &SequenceParams, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-nostats".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-framerate".to_string(),
        params.fps.to_string(),
        "-start_number".to_string(),
        "0".to_string(),
        "-i".to_string(),
        params
            .frame_dir
            .join(&params.pattern)
            .to_string_lossy()
            .into_owned(),
    ];
    args.extend(video_codec_args(params.format, &params.params));
    args.push(output.to_string_lossy().into_owned());
    args
}

#[must_use]
pub fn parse_progress_frame(line: &str) -> Option<u64> {
    line.trim().strip_prefix("frame=")?.trim().parse().ok()
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    binary: PathBuf,
    work_dir: Option<PathBuf>,
}

impl FfmpegEncoderFactory {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, work_dir: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir,
        }
    }
}

impl Default for FfmpegEncoderFactory {
    fn default() -> Self {
        Self::new("ffmpeg", None)
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self) -> Result<Box<dyn EncoderBackend>> {
        let scratch = match &self.work_dir {
            Some(dir) => {
                fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create encoder work directory: {}", dir.display())
                })?;
                tempfile::Builder::new()
                    .prefix("fretcast-encode-")
                    .tempdir_in(dir)
            }
            None => tempfile::Builder::new().prefix("fretcast-encode-").tempdir(),
        }
        .context("failed to create encoder scratch directory")?;

        Ok(Box::new(FfmpegEncoder {
            binary: self.binary.clone(),
            scratch,
        }))
    }
}

#[derive(Debug)]
pub struct FfmpegEncoder {
    binary: PathBuf,
    scratch: tempfile::TempDir,
}

impl FfmpegEncoder {
    fn output_path(&self, format: ExportFormat, stem: &str) -> PathBuf {
        self.scratch
            .path()
            .join(format!("{stem}.{}", format.extension()))
    }
}

impl EncoderBackend for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    #[instrument(skip(self, params), fields(format = %params.format, width = params.width, height = params.height, fps = params.fps))]
    fn open_stream(&mut self, params: &StreamParams) -> Result<Box<dyn StreamSink>> {
        let output = self.output_path(params.format, "stream");
        let args = stream_args(params, &output);
        debug!(binary = %self.binary.display(), args = %args.join(" "), "spawning stream encoder");

        let mut process = FfmpegProcess::spawn(
            Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::null()),
            &self.binary,
        )?;
        let stdin = process
            .child_mut()
            .and_then(|child| child.stdin.take())
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdin was not captured"))?;

        Ok(Box::new(FfmpegStreamSink {
            process,
            stdin: Some(stdin),
            output,
            frame_len: params.width as usize * params.height as usize * 4,
            frames: 0,
        }))
    }

    #[instrument(skip(self, params, cancel, progress), fields(format = %params.format, frame_count = params.frame_count, fps = params.fps))]
    fn encode_sequence(
        &mut self,
        params: &SequenceParams,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>> {
        let output = self.output_path(params.format, "sequence");
        let args = sequence_args(params, &output);
        debug!(binary = %self.binary.display(), args = %args.join(" "), "spawning batch encoder");

        let mut process = FfmpegProcess::spawn(
            Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped()),
            &self.binary,
        )?;
        let stdout = process
            .child_mut()
            .and_then(|child| child.stdout.take())
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdout was not captured"))?;
        let total = params.frame_count.max(1) as f64;

        for line in BufReader::new(stdout).lines() {
            if cancel.is_cancelled() {
                warn!("batch encode cancelled; killing ffmpeg");
                process.kill();
                let _ = fs::remove_file(&output);
                bail!("encode cancelled");
            }

            let line = line.context("failed to read ffmpeg progress")?;
            if let Some(frame) = parse_progress_frame(&line) {
                progress((frame as f64 / total).min(1.0));
            }
        }

        let (status, stderr) = process.wait()?;
        if !status.success() {
            bail!(
                "ffmpeg exited with status {status} while encoding {}: {}",
                params.format,
                stderr.trim()
            );
        }

        let bytes = fs::read(&output)
            .with_context(|| format!("failed to read encoded output: {}", output.display()))?;
        let _ = fs::remove_file(&output);
        info!(bytes = bytes.len(), "batch encode completed");
        Ok(bytes)
    }
}

// Dropping this kills and reaps the child unless it was already waited on.
struct FfmpegProcess {
    child: Option<Child>,
    stderr: Option<JoinHandle<String>>,
}

impl FfmpegProcess {
    fn spawn(command: &mut Command, binary: &Path) -> Result<Self> {
        let child = command
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn ffmpeg: {}", binary.display()))?;
        let mut process = Self {
            child: Some(child),
            stderr: None,
        };

        if let Some(mut pipe) = process.child_mut().and_then(|child| child.stderr.take()) {
            let reader = thread::Builder::new()
                .name("fretcast-ffmpeg-stderr".to_string())
                .spawn(move || {
                    let mut text = String::new();
                    let _ = pipe.read_to_string(&mut text);
                    text
                })
                .context("failed to start ffmpeg stderr reader")?;
            process.stderr = Some(reader);
        }
        Ok(process)
    }

    fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    fn wait(&mut self) -> Result<(ExitStatus, String)> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg was already reaped"))?;
        let status = child.wait().context("failed to wait for ffmpeg")?;
        Ok((status, self.collect_stderr()))
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            debug!(pid = child.id(), "ffmpeg killed");
        }
        let _ = self.collect_stderr();
    }

    fn collect_stderr(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

struct FfmpegStreamSink {
    process: FfmpegProcess,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    frame_len: usize,
    frames: u64,
}

impl StreamSink for FfmpegStreamSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.pixels().len() != self.frame_len {
            bail!(
                "stream frame has {} bytes, encoder expects {}",
                frame.pixels().len(),
                self.frame_len
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("stream encoder input already closed"))?;
        stdin
            .write_all(frame.pixels())
            .context("failed to write frame to ffmpeg")?;
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>> {
        // Closing stdin is the end-of-stream signal.
        drop(self.stdin.take());
        let (status, stderr) = self.process.wait()?;
        if !status.success() {
            bail!(
                "ffmpeg exited with status {status} while finishing stream: {}",
                stderr.trim()
            );
        }

        let bytes = fs::read(&self.output).with_context(|| {
            format!("failed to read streamed output: {}", self.output.display())
        })?;
        let _ = fs::remove_file(&self.output);
        info!(frames = self.frames, bytes = bytes.len(), "stream encode completed");
        Ok(bytes)
    }

    fn abort(mut self: Box<Self>) {
        self.teardown();
    }
}

impl FfmpegStreamSink {
    fn teardown(&mut self) {
        drop(self.stdin.take());
        self.process.kill();
        let _ = fs::remove_file(&self.output);
    }
}

impl Drop for FfmpegStreamSink {
    fn drop(&mut self) {
        self.teardown();
    }
}
