use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::{
    quality::{ExportFormat, QualityTier},
    sampler::Sampler,
    timeline::{DEFAULT_MIN_SEGMENT_MS, Timeline},
};

pub const DATA_EXPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub frame_count: u64,
}

impl ExportArtifact {
    #[must_use]
    pub fn new(format: ExportFormat, bytes: Vec<u8>, frame_count: u64) -> Self {
        Self {
            format,
            mime_type: format.mime_type().to_string(),
            bytes,
            frame_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportedChord {
    pub index: usize,
    pub label: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub diagram: Value,
    pub start_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportSettings {
    pub fps: u32,
    pub quality: QualityTier,
    pub transition_window_ms: f64,
    pub min_segment_ms: u64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            fps: crate::job::DEFAULT_EXPORT_FPS,
            quality: QualityTier::default(),
            transition_window_ms: Sampler::default().transition_window_ms,
            min_segment_ms: DEFAULT_MIN_SEGMENT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataExport {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub chords: Vec<ExportedChord>,
    pub settings: ExportSettings,
    #[serde(default)]
    pub theme: Value,
}

#[instrument(skip(timeline, theme), fields(segments = timeline.len()))]
#[must_use]
pub fn build_data_export(timeline: &Timeline, settings: ExportSettings, theme: Value) -> DataExport {
    let chords = timeline
        .segments()
        .iter()
        .enumerate()
        .map(|(index, segment)| ExportedChord {
            index,
            label: segment.chord.label.clone(),
            diagram: segment.chord.diagram.clone(),
            start_ms: segment.start_ms,
            duration_ms: segment.duration_ms,
        })
        .collect();

    DataExport {
        schema_version: DATA_EXPORT_SCHEMA_VERSION,
        exported_at: Utc::now(),
        total_duration_ms: timeline.total_duration_ms(),
        chords,
        settings,
        theme,
    }
}

pub fn data_export_bytes(document: &DataExport) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(document).context("failed to encode data export json")
}

pub fn parse_data_export(bytes: &[u8]) -> Result<DataExport> {
    serde_json::from_slice(bytes).context("invalid data export json")
}

// Written through a sibling temp file so readers never see a partial export.
#[instrument(skip(artifact), fields(path = %path.display(), format = %artifact.format, bytes = artifact.bytes.len()))]
pub fn write_artifact(path: &Path, artifact: &ExportArtifact) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create export directory: {}", parent.display()))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(&parent)
        .context("failed to create temp export file")?;
    temp_file
        .write_all(&artifact.bytes)
        .context("failed to write temp export file")?;
    temp_file
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist export: {}", path.display()))?;

    info!("export written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::timeline::{ChordRef, ChordSegment};

    #[test]
    fn document_lists_positions_and_settings() {
        let timeline = Timeline::compile(&[
            ChordSegment::new(
                ChordRef::with_diagram("G", json!({ "frets": [3, 2, 0, 0, 0, 3] })),
                1_200,
            ),
            ChordSegment::new(ChordRef::new("Em"), 800),
        ]);
        let document = build_data_export(
            &timeline,
            ExportSettings::default(),
            json!({ "neck": "rosewood" }),
        );

        assert_eq!(document.total_duration_ms, 2_000);
        assert_eq!(document.chords[1].start_ms, 1_200);
        assert_eq!(document.chords[0].diagram["frets"][0], 3);
        assert_eq!(document.theme["neck"], "rosewood");

        let bytes = data_export_bytes(&document).expect("encode");
        let parsed = parse_data_export(&bytes).expect("decode");
        assert_eq!(parsed, document);
    }

    #[test]
    fn artifacts_are_written_atomically() {
        let temp_dir = tempfile::tempdir().expect("tempdir should work");
        let path = temp_dir.path().join("nested").join("out.json");
        let artifact = ExportArtifact::new(ExportFormat::Json, b"{}".to_vec(), 0);

        write_artifact(&path, &artifact).expect("write should succeed");
        assert_eq!(fs::read(&path).expect("read back"), b"{}");
    }
}
