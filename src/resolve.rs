use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{AlbumFacts, AudioFormat, ErrorCode, TrackFact};
use crate::plan::AlbumRecord;

/// Bitrates the lossy encoder accepts. Anything else is rejected, never
/// clamped.
pub const ALLOWED_AAC_BITRATES: &[u32] = &[128, 192, 256, 320];

/// Fallback bitrate when the album row leaves it blank.
pub const DEFAULT_AAC_BITRATE: u32 = 256;

/// Protective attenuation applied when folding multichannel down to stereo.
pub const DOWNMIX_HEADROOM_DB: f64 = -3.0;

/// Per-album conversion action. Closed set: unknown plan values are
/// rejected with INVALID_ACTION, never passed through as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Lossless output at source parameters, downconverting only when the
    /// source exceeds the device ceiling.
    Preserve,
    /// Lossless output clamped to the device ceiling (still never above
    /// the source's own values).
    ForceCeiling,
    /// Re-encode to the device's lossy codec.
    LossyReencode,
    /// Copy an already-compatible file into the output untouched.
    Passthrough,
    Skip,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preserve => "PRESERVE",
            Self::ForceCeiling => "FORCE_CEILING",
            Self::LossyReencode => "LOSSY_REENCODE",
            Self::Passthrough => "PASSTHROUGH",
            Self::Skip => "SKIP",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ResolveError;

    /// Accepts the canonical spellings plus the handful of variants people
    /// actually type into the plan file.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "PRESERVE" | "ALAC" | "ALAC_PRESERVE" => Ok(Self::Preserve),
            "FORCE_CEILING" | "CEILING" | "REDBOOK" => Ok(Self::ForceCeiling),
            "LOSSY_REENCODE" | "AAC" | "LOSSY" => Ok(Self::LossyReencode),
            "PASSTHROUGH" | "PASS" | "COPY" | "MP3" => Ok(Self::Passthrough),
            "SKIP" | "NONE" => Ok(Self::Skip),
            other => Err(ResolveError::InvalidAction(other.to_string())),
        }
    }
}

/// Output codec driven by the resolved action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCodec {
    Alac,
    Aac,
    /// Stream copy; passthrough keeps the source codec.
    Copy,
}

impl OutputCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alac => "alac",
            Self::Aac => "aac",
            Self::Copy => "copy",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Alac | Self::Aac => "m4a",
            Self::Copy => "mp3",
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("invalid action '{0}' (valid: PRESERVE, FORCE_CEILING, LOSSY_REENCODE, PASSTHROUGH, SKIP)")]
    InvalidAction(String),
    #[error("invalid AAC bitrate {0} kbps (allowed: 128, 192, 256, 320)")]
    InvalidBitrate(u32),
}

impl ResolveError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidAction(_) => ErrorCode::InvalidAction,
            Self::InvalidBitrate(_) => ErrorCode::InvalidBitrate,
        }
    }
}

/// The most the target device productively plays back. Downconversion
/// target, never an upconversion target.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCeiling {
    pub max_sample_rate_hz: u32,
    pub max_bit_depth: u16,
    pub max_channels: u16,
}

impl Default for DeviceCeiling {
    fn default() -> Self {
        Self {
            max_sample_rate_hz: 48_000,
            max_bit_depth: 16,
            max_channels: 2,
        }
    }
}

/// Fully resolved per-track conversion target. Comparison-stable; its
/// hash (plus tool version) keys the fingerprint cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub action: Action,
    pub output_codec: OutputCodec,
    pub output_sample_rate_hz: u32,
    /// None for lossy output.
    pub output_bit_depth: Option<u16>,
    pub output_channels: u16,
    pub aac_bitrate_kbps: Option<u32>,
    pub apply_dither: bool,
    pub downmix_headroom_db: Option<f64>,
}

impl ResolvedTarget {
    pub fn is_skip(&self) -> bool {
        self.action == Action::Skip
    }

    /// Stable hash over every field plus the tool version. A tool-version
    /// bump therefore invalidates every cache entry implicitly.
    pub fn settings_hash(&self, tool_version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.action.as_str());
        hasher.update(b":");
        hasher.update(self.output_codec.as_str());
        hasher.update(b":");
        hasher.update(self.output_sample_rate_hz.to_string());
        hasher.update(b":");
        hasher.update(self.output_bit_depth.unwrap_or(0).to_string());
        hasher.update(b":");
        hasher.update(self.output_channels.to_string());
        hasher.update(b":");
        hasher.update(self.aac_bitrate_kbps.unwrap_or(0).to_string());
        hasher.update(b":");
        hasher.update(if self.apply_dither { "d1" } else { "d0" });
        hasher.update(b":");
        hasher.update(
            self.downmix_headroom_db
                .map(|v| format!("{v:.1}"))
                .unwrap_or_default(),
        );
        hasher.update(b":");
        hasher.update(tool_version);
        let digest = hasher.finalize();
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

/// Resolve the effective action for an album row: a valid non-blank user
/// override wins, otherwise the scan's default. `skip` short-circuits
/// everything.
pub fn effective_action(record: &AlbumRecord) -> Result<Action, ResolveError> {
    if record.skip {
        return Ok(Action::Skip);
    }
    match record.user_action.as_deref() {
        Some(s) if !s.trim().is_empty() => s.parse(),
        _ => Ok(record.default_action),
    }
}

/// Compute the final per-track conversion target.
///
/// Never-upscale invariant: every numeric output parameter is
/// `min(source, ceiling)`. An override can lower the ceiling's effect but
/// can never push output above the source's own values.
pub fn resolve(
    record: &AlbumRecord,
    fact: &TrackFact,
    ceiling: &DeviceCeiling,
) -> Result<ResolvedTarget, ResolveError> {
    let action = effective_action(record)?;

    if action == Action::Skip {
        return Ok(ResolvedTarget {
            action,
            output_codec: OutputCodec::Copy,
            output_sample_rate_hz: fact.sample_rate_hz,
            output_bit_depth: fact.bit_depth,
            output_channels: fact.channels,
            aac_bitrate_kbps: None,
            apply_dither: false,
            downmix_headroom_db: None,
        });
    }

    if action == Action::Passthrough {
        // Copying the stream changes nothing, so the target mirrors the
        // source exactly.
        return Ok(ResolvedTarget {
            action,
            output_codec: OutputCodec::Copy,
            output_sample_rate_hz: fact.sample_rate_hz,
            output_bit_depth: fact.bit_depth,
            output_channels: fact.channels,
            aac_bitrate_kbps: None,
            apply_dither: false,
            downmix_headroom_db: None,
        });
    }

    let output_sample_rate_hz = fact.sample_rate_hz.min(ceiling.max_sample_rate_hz);
    let output_channels = fact.channels.min(ceiling.max_channels);
    let downmix_headroom_db = if output_channels < fact.channels {
        Some(DOWNMIX_HEADROOM_DB)
    } else {
        None
    };

    match action {
        Action::Preserve | Action::ForceCeiling => {
            // Lossy sources converted to lossless get the ceiling depth;
            // there is no meaningful source depth to preserve.
            let source_depth = fact.bit_depth.unwrap_or(ceiling.max_bit_depth);
            let output_bit_depth = source_depth.min(ceiling.max_bit_depth);
            let apply_dither = output_bit_depth < source_depth;

            Ok(ResolvedTarget {
                action,
                output_codec: OutputCodec::Alac,
                output_sample_rate_hz,
                output_bit_depth: Some(output_bit_depth),
                output_channels,
                aac_bitrate_kbps: None,
                apply_dither,
                downmix_headroom_db,
            })
        }
        Action::LossyReencode => {
            let bitrate = match record.aac_target_kbps {
                Some(b) if ALLOWED_AAC_BITRATES.contains(&b) => b,
                Some(b) => return Err(ResolveError::InvalidBitrate(b)),
                None => DEFAULT_AAC_BITRATE,
            };
            Ok(ResolvedTarget {
                action,
                output_codec: OutputCodec::Aac,
                output_sample_rate_hz,
                output_bit_depth: None,
                output_channels,
                aac_bitrate_kbps: Some(bitrate),
                apply_dither: false,
                downmix_headroom_db,
            })
        }
        Action::Passthrough | Action::Skip => unreachable!("handled above"),
    }
}

/// Tag describing the conversion, embedded in the output filename.
/// `[ALAC]`, `[ALAC-RedBook]` when downconverted, `[AAC-256k]`, `[MP3]`.
pub fn conversion_tag(fact: &TrackFact, target: &ResolvedTarget) -> String {
    match target.output_codec {
        OutputCodec::Copy => "[MP3]".to_string(),
        OutputCodec::Aac => format!("[AAC-{}k]", target.aac_bitrate_kbps.unwrap_or(DEFAULT_AAC_BITRATE)),
        OutputCodec::Alac => {
            let downsampled = target.output_sample_rate_hz < fact.sample_rate_hz;
            let bit_reduced = match (fact.bit_depth, target.output_bit_depth) {
                (Some(s), Some(t)) => t < s,
                _ => false,
            };
            if downsampled || bit_reduced {
                "[ALAC-RedBook]".to_string()
            } else {
                "[ALAC]".to_string()
            }
        }
    }
}

/// Remove characters that are invalid in output path components.
fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    cleaned.trim().trim_end_matches('.').to_string()
}

/// Compute the output path for one track:
/// `<root>/<album artist>/<year - album>/<disc->NN title [TAG].<ext>`
pub fn output_path(
    output_root: &Path,
    facts: &AlbumFacts,
    fact: &TrackFact,
    target: &ResolvedTarget,
) -> PathBuf {
    let album_artist = facts
        .album_artist
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(if facts.artist.is_empty() { "Unknown Artist" } else { facts.artist.as_str() });
    let album_name = if facts.album.is_empty() { "Unknown Album" } else { &facts.album };

    let album_folder = match facts.year {
        Some(y) => format!("{} - {}", y, sanitize(album_name)),
        None => sanitize(album_name),
    };

    let title = fact
        .title
        .clone()
        .unwrap_or_else(|| fact.path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default());

    let disc_prefix = if facts.is_compilation || fact.disc_total.is_some_and(|t| t > 1) {
        format!("{}-", fact.disc_number.unwrap_or(1))
    } else {
        String::new()
    };

    let filename = format!(
        "{}{:02} {} {}.{}",
        disc_prefix,
        fact.track_number.unwrap_or(0),
        sanitize(&title),
        conversion_tag(fact, target),
        extension_for(fact, target),
    );

    output_root
        .join(sanitize(album_artist))
        .join(album_folder)
        .join(filename)
}

/// Passthrough keeps the source's extension; encoded output is .m4a.
fn extension_for(fact: &TrackFact, target: &ResolvedTarget) -> &'static str {
    match target.output_codec {
        OutputCodec::Copy => match fact.format {
            AudioFormat::Mp3 => "mp3",
            _ => "m4a",
        },
        other => other.extension(),
    }
}

/// Deterministic suffix for albums whose output folders collide: the first
/// 8 chars of the album id, stable across runs.
pub fn collision_suffix(album_id: &str) -> String {
    format!(" [{}]", &album_id[..album_id.len().min(8)])
}
