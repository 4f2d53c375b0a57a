use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ArtStatus, ErrorCode, TagStatus};
use crate::resolve::Action;

/// Manifest filename, fixed relative to the output root.
pub const MANIFEST_FILENAME: &str = "podprep-manifest.jsonl";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One line per build attempt. Write-once: records are appended during a
/// run and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub run_id: String,
    pub timestamp: String,
    pub album_id: String,
    pub source_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub action: Action,
    pub output_codec: Option<String>,
    pub output_sample_rate_hz: Option<u32>,
    pub output_bit_depth: Option<u16>,
    pub aac_bitrate_kbps: Option<u32>,
    pub dither_applied: bool,
    pub duration_seconds: Option<f64>,
    pub output_size_bytes: Option<u64>,
    pub tag_status: TagStatus,
    pub art_status: ArtStatus,
    /// True when the track was served from the fingerprint cache.
    pub cached: bool,
    pub error_code: Option<ErrorCode>,
}

/// Append-only JSONL writer at `<output_root>/podprep-manifest.jsonl`.
/// All appends go through one owning handle; workers hand results back
/// to the thread that holds this.
pub struct ManifestWriter {
    writer: BufWriter<std::fs::File>,
    path: PathBuf,
}

impl ManifestWriter {
    pub fn open(output_root: &Path) -> Result<Self, ManifestError> {
        std::fs::create_dir_all(output_root)?;
        let path = output_root.join(MANIFEST_FILENAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &ManifestRecord) -> Result<(), ManifestError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        // Flush per record so an interrupted run still leaves every
        // completed attempt on disk.
        self.writer.flush()?;
        Ok(())
    }
}

/// Read back all records, skipping lines that don't parse.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRecord>, ManifestError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
