use std::path::Path;
use std::process::Command;

use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{AudioFormat, TrackFact};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffprobe failed for {path}: {message}")]
    Ffprobe { path: String, message: String },
    #[error("no audio stream in {0}")]
    NoAudioStream(String),
    #[error("invalid ffprobe output for {0}")]
    InvalidOutput(String),
}

/// Spec-extractor boundary: inspects one file and reports technical and
/// metadata facts. Implemented by ffprobe in production; tests use stubs.
pub trait TrackProber: Send + Sync {
    fn probe(&self, path: &Path) -> Result<TrackFact, ProbeError>;

    /// Dimensions of a standalone image file, if determinable.
    fn probe_image(&self, path: &Path) -> Option<(u32, u32)>;
}

/// Production prober: ffprobe for stream facts, lofty for tags.
pub struct FfprobeProber {
    ffprobe_path: String,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    fn run_ffprobe(&self, path: &Path) -> Result<FfprobeOutput, ProbeError> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .output()?;

        if !output.status.success() {
            return Err(ProbeError::Ffprobe {
                path: path.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|_| ProbeError::InvalidOutput(path.display().to_string()))
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl TrackProber for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<TrackFact, ProbeError> {
        let meta = std::fs::metadata(path)?;
        let probe = self.run_ffprobe(path)?;

        let audio = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
            .ok_or_else(|| ProbeError::NoAudioStream(path.display().to_string()))?;

        // Embedded cover art surfaces as an attached video stream
        let art = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"));

        let codec = audio.codec_name.as_deref().unwrap_or("unknown");
        let mut format = AudioFormat::from_codec(codec);
        if format == AudioFormat::Unknown {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            format = AudioFormat::from_extension(ext);
        }

        let sample_rate_hz = audio
            .sample_rate
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(44_100);

        // bits_per_sample is often 0 for compressed codecs; fall back to
        // bits_per_raw_sample (a string in ffprobe's JSON)
        let bit_depth = match audio.bits_per_sample {
            Some(b) if b > 0 => Some(b),
            _ => audio
                .bits_per_raw_sample
                .as_deref()
                .and_then(|s| s.parse().ok())
                .filter(|b| *b > 0),
        };

        let duration_seconds = probe
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .or(audio.duration.as_deref())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        let tags = read_tags(path);

        Ok(TrackFact {
            path: path.to_path_buf(),
            format,
            sample_rate_hz,
            bit_depth,
            channels: audio.channels.unwrap_or(2),
            duration_seconds,
            title: tags.title,
            artist: tags.artist,
            album: tags.album,
            album_artist: tags.album_artist,
            track_number: tags.track_number,
            track_total: tags.track_total,
            disc_number: tags.disc_number,
            disc_total: tags.disc_total,
            year: tags.year,
            compilation: tags.compilation,
            has_embedded_art: art.is_some(),
            embedded_art_width: art.and_then(|s| s.width),
            embedded_art_height: art.and_then(|s| s.height),
            size_bytes: meta.len(),
            mtime_unix: mtime_unix(&meta),
        })
    }

    fn probe_image(&self, path: &Path) -> Option<(u32, u32)> {
        let probe = self.run_ffprobe(path).ok()?;
        let video = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))?;
        Some((video.width?, video.height?))
    }
}

fn mtime_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    // ffprobe reports these numerics as strings
    sample_rate: Option<String>,
    bits_per_raw_sample: Option<String>,
    duration: Option<String>,
    bits_per_sample: Option<u16>,
    channels: Option<u16>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

struct TagInfo {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    album_artist: Option<String>,
    track_number: Option<u32>,
    track_total: Option<u32>,
    disc_number: Option<u32>,
    disc_total: Option<u32>,
    year: Option<i32>,
    compilation: bool,
}

/// Read tags from an audio file. Returns empty tags on failure; files
/// without readable tags still get technical facts from ffprobe.
fn read_tags(path: &Path) -> TagInfo {
    let empty = TagInfo {
        title: None,
        artist: None,
        album: None,
        album_artist: None,
        track_number: None,
        track_total: None,
        disc_number: None,
        disc_total: None,
        year: None,
        compilation: false,
    };

    let tagged_file = match lofty::read_from_path(path) {
        Ok(f) => f,
        Err(e) => {
            log::debug!("Could not read tags from {}: {}", path.display(), e);
            return empty;
        }
    };

    let tag = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag());

    let tag = match tag {
        Some(t) => t,
        None => return empty,
    };

    let compilation = tag
        .get_string(&ItemKey::FlagCompilation)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    TagInfo {
        title: tag.title().map(|s| s.to_string()),
        artist: tag.artist().map(|s| s.to_string()),
        album: tag.album().map(|s| s.to_string()),
        album_artist: tag
            .get_string(&ItemKey::AlbumArtist)
            .map(|s| s.to_string()),
        track_number: tag.track(),
        track_total: tag.track_total(),
        disc_number: tag.disk(),
        disc_total: tag.disk_total(),
        year: tag.year().map(|y| y as i32),
        compilation,
    }
}
