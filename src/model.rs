use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Audio formats we recognize in source libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AudioFormat {
    Flac,
    Wav,
    Aiff,
    Alac,
    Aac,
    Mp3,
    Ogg,
    Opus,
    Wma,
    M4a,
    Ape,
    Wv,
    Shn,
    Unknown,
}

impl AudioFormat {
    /// Map an ffprobe codec name to a format.
    pub fn from_codec(codec: &str) -> Self {
        match codec.to_lowercase().as_str() {
            "flac" => Self::Flac,
            "pcm_s16le" | "pcm_s24le" | "pcm_s32le" | "pcm_f32le" => Self::Wav,
            "pcm_s16be" | "pcm_s24be" | "pcm_s32be" => Self::Aiff,
            "alac" => Self::Alac,
            "aac" => Self::Aac,
            "mp3" | "mp3float" => Self::Mp3,
            "vorbis" => Self::Ogg,
            "opus" => Self::Opus,
            "wmav1" | "wmav2" | "wmalossless" => Self::Wma,
            "ape" => Self::Ape,
            "wavpack" => Self::Wv,
            "shorten" => Self::Shn,
            _ => Self::Unknown,
        }
    }

    /// Map a file extension (with or without leading dot) to a format.
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "flac" => Self::Flac,
            "wav" => Self::Wav,
            "aiff" | "aif" => Self::Aiff,
            "m4a" => Self::M4a,
            "aac" => Self::Aac,
            "mp3" => Self::Mp3,
            "ogg" | "oga" => Self::Ogg,
            "opus" => Self::Opus,
            "wma" => Self::Wma,
            "ape" => Self::Ape,
            "wv" => Self::Wv,
            "shn" => Self::Shn,
            _ => Self::Unknown,
        }
    }

    pub fn is_lossless(self) -> bool {
        matches!(
            self,
            Self::Flac | Self::Wav | Self::Aiff | Self::Alac | Self::Ape | Self::Wv | Self::Shn
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flac => "FLAC",
            Self::Wav => "WAV",
            Self::Aiff => "AIFF",
            Self::Alac => "ALAC",
            Self::Aac => "AAC",
            Self::Mp3 => "MP3",
            Self::Ogg => "OGG",
            Self::Opus => "OPUS",
            Self::Wma => "WMA",
            Self::M4a => "M4A",
            Self::Ape => "APE",
            Self::Wv => "WV",
            Self::Shn => "SHN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag quality tri-state for an album.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagStatus {
    Green,
    Yellow,
    Red,
}

/// Artwork quality tri-state for an album.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtStatus {
    Green,
    Yellow,
    Red,
}

/// Machine-readable error codes surfaced in the plan and manifest.
/// These cross component boundaries instead of raw error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ExtractionFailed,
    InvalidAction,
    InvalidBitrate,
    TranscodeFailed,
    VerifyFailed,
    TagWriteFailed,
    ArtMissing,
    ArtAmbiguous,
    OutputCollision,
    PlanLocked,
    SchemaMismatch,
    IoError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExtractionFailed => "EXTRACTION_FAILED",
            Self::InvalidAction => "INVALID_ACTION",
            Self::InvalidBitrate => "INVALID_BITRATE",
            Self::TranscodeFailed => "TRANSCODE_FAILED",
            Self::VerifyFailed => "VERIFY_FAILED",
            Self::TagWriteFailed => "TAG_WRITE_FAILED",
            Self::ArtMissing => "ART_MISSING",
            Self::ArtAmbiguous => "ART_AMBIGUOUS",
            Self::OutputCollision => "OUTPUT_COLLISION",
            Self::PlanLocked => "PLAN_LOCKED",
            Self::SchemaMismatch => "SCHEMA_MISMATCH",
            Self::IoError => "IO_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Technical and metadata facts for one audio file, as reported by the
/// spec extractor. Ephemeral: never persisted, only aggregated.
#[derive(Debug, Clone)]
pub struct TrackFact {
    pub path: PathBuf,
    pub format: AudioFormat,
    pub sample_rate_hz: u32,
    /// None for lossy sources (bit depth is not meaningful there).
    pub bit_depth: Option<u16>,
    pub channels: u16,
    pub duration_seconds: f64,

    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: Option<u32>,
    pub track_total: Option<u32>,
    pub disc_number: Option<u32>,
    pub disc_total: Option<u32>,
    pub year: Option<i32>,
    pub compilation: bool,

    pub has_embedded_art: bool,
    pub embedded_art_width: Option<u32>,
    pub embedded_art_height: Option<u32>,

    // Source fingerprint for the incremental-build cache
    pub size_bytes: u64,
    pub mtime_unix: i64,
}

/// Aggregated facts for one album directory, produced by the scanner.
#[derive(Debug, Clone)]
pub struct AlbumFacts {
    pub album_id: String,
    pub source_path: PathBuf,
    pub tracks: Vec<TrackFact>,

    pub artist: String,
    pub album: String,
    pub album_artist: Option<String>,
    pub year: Option<i32>,
    pub is_compilation: bool,

    pub art_candidates: Vec<PathBuf>,
    pub art_sizes: Vec<(u32, u32)>,

    pub max_sample_rate_hz: u32,
    pub max_bit_depth: Option<u16>,
    pub source_formats: BTreeSet<AudioFormat>,
}

impl AlbumFacts {
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn has_lossless(&self) -> bool {
        self.source_formats.iter().any(|f| f.is_lossless())
    }

    pub fn is_mp3_only(&self) -> bool {
        !self.source_formats.is_empty()
            && self.source_formats.iter().all(|f| *f == AudioFormat::Mp3)
    }

    /// Formats joined for display/plan rows, e.g. "FLAC;MP3".
    pub fn formats_joined(&self) -> String {
        self.source_formats
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Stable album identity derived from the path relative to the library
/// root. Must not change across rescans of the same directory.
pub fn album_id(library_root: &Path, album_path: &Path) -> String {
    let rel = album_path.strip_prefix(library_root).unwrap_or(album_path);
    // Normalize separators so the id is stable across platforms
    let normalized = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let digest = Sha256::digest(normalized.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}
