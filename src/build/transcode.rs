use std::path::Path;
use std::process::Command;

use thiserror::Error;

use crate::model::TrackFact;
use crate::resolve::{OutputCodec, ResolvedTarget};

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("failed to run ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("ffmpeg exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Transcode boundary: given a source and a fully resolved target, produce
/// the temporary output file. The engine passes only semantic parameters;
/// how they're achieved is this capability's business.
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        fact: &TrackFact,
        target: &ResolvedTarget,
        temp_out: &Path,
    ) -> Result<(), TranscodeError>;
}

/// Production transcoder shelling out to ffmpeg.
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Build the ffmpeg argv for a job. Split out so tests can assert on
    /// the exact flags without running anything.
    pub fn build_args(fact: &TrackFact, target: &ResolvedTarget, temp_out: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            fact.path.to_string_lossy().to_string(),
            "-vn".into(),
            // Carry source tags into the output container
            "-map_metadata".into(),
            "0".into(),
        ];

        if target.output_codec == OutputCodec::Copy {
            args.extend(["-c:a".into(), "copy".into()]);
            args.push(temp_out.to_string_lossy().to_string());
            return args;
        }

        let mut filters: Vec<String> = Vec::new();

        // Headroom before folding multichannel down to stereo, so the
        // downmix sum can't clip
        if let Some(db) = target.downmix_headroom_db {
            filters.push(format!("volume={db}dB"));
        }

        let needs_resample = target.output_sample_rate_hz != fact.sample_rate_hz;
        if needs_resample || target.apply_dither {
            // soxr at high precision; triangular high-pass dither shapes
            // quantization noise away from sensitive frequencies
            let mut parts = vec![
                format!("aresample={}", target.output_sample_rate_hz),
                "resampler=soxr".to_string(),
                "precision=28".to_string(),
            ];
            if target.apply_dither {
                parts.push("dither_method=triangular_hp".to_string());
            }
            filters.push(parts.join(":"));
        }

        if !filters.is_empty() {
            args.extend(["-af".into(), filters.join(",")]);
        }

        args.extend(["-ac".into(), target.output_channels.to_string()]);

        match target.output_codec {
            OutputCodec::Alac => {
                args.extend([
                    "-c:a".into(),
                    "alac".into(),
                    "-ar".into(),
                    target.output_sample_rate_hz.to_string(),
                ]);
                // ALAC carries 24-bit in the s32p sample format
                if let Some(depth) = target.output_bit_depth {
                    let fmt = if depth <= 16 { "s16p" } else { "s32p" };
                    args.extend(["-sample_fmt".into(), fmt.into()]);
                }
            }
            OutputCodec::Aac => {
                args.extend([
                    "-c:a".into(),
                    "aac".into(),
                    // AAC-LC for device compatibility
                    "-profile:a".into(),
                    "aac_low".into(),
                    "-b:a".into(),
                    format!("{}k", target.aac_bitrate_kbps.unwrap_or(256)),
                    "-ar".into(),
                    target.output_sample_rate_hz.to_string(),
                ]);
            }
            OutputCodec::Copy => unreachable!("handled above"),
        }

        args.push(temp_out.to_string_lossy().to_string());
        args
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(
        &self,
        fact: &TrackFact,
        target: &ResolvedTarget,
        temp_out: &Path,
    ) -> Result<(), TranscodeError> {
        let args = Self::build_args(fact, target, temp_out);
        log::debug!("ffmpeg {}", args.join(" "));

        let output = Command::new(&self.ffmpeg_path).args(&args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Keep the tail; ffmpeg's actual error is at the end
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(TranscodeError::Failed {
                status: output.status.to_string(),
                stderr: tail,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AudioFormat;
    use crate::plan::AlbumRecord;
    use crate::resolve::{Action, DeviceCeiling, resolve};
    use std::path::PathBuf;

    fn fact(sr: u32, bd: Option<u16>, channels: u16) -> TrackFact {
        TrackFact {
            path: PathBuf::from("/music/a/01.flac"),
            format: AudioFormat::Flac,
            sample_rate_hz: sr,
            bit_depth: bd,
            channels,
            duration_seconds: 200.0,
            title: None,
            artist: None,
            album: None,
            album_artist: None,
            track_number: Some(1),
            track_total: None,
            disc_number: None,
            disc_total: None,
            year: None,
            compilation: false,
            has_embedded_art: false,
            embedded_art_width: None,
            embedded_art_height: None,
            size_bytes: 1000,
            mtime_unix: 0,
        }
    }

    fn record(action: Action, kbps: Option<u32>) -> AlbumRecord {
        AlbumRecord {
            album_id: "0123456789abcdef".into(),
            source_path: PathBuf::from("/music/a"),
            artist: "A".into(),
            album: "Alb".into(),
            year: None,
            track_count: 1,
            source_formats: "FLAC".into(),
            max_sample_rate_hz: 96_000,
            max_bit_depth: Some(24),
            default_action: action,
            tag_status: crate::model::TagStatus::Green,
            art_status: crate::model::ArtStatus::Green,
            notes: String::new(),
            user_action: None,
            aac_target_kbps: kbps,
            skip: false,
            plan_hash: None,
            last_built_at: None,
            error_code: None,
        }
    }

    #[test]
    fn hires_alac_args_resample_and_dither() {
        let f = fact(96_000, Some(24), 2);
        let t = resolve(&record(Action::Preserve, None), &f, &DeviceCeiling::default()).unwrap();
        let args = FfmpegTranscoder::build_args(&f, &t, Path::new("/out/x.tmp.m4a"));
        let joined = args.join(" ");

        assert!(joined.contains("aresample=48000:resampler=soxr:precision=28:dither_method=triangular_hp"), "{joined}");
        assert!(joined.contains("-c:a alac"), "{joined}");
        assert!(joined.contains("-sample_fmt s16p"), "{joined}");
        assert!(!joined.contains("volume="), "{joined}");
    }

    #[test]
    fn multichannel_gets_headroom_filter() {
        let f = fact(48_000, Some(24), 6);
        let t = resolve(&record(Action::Preserve, None), &f, &DeviceCeiling::default()).unwrap();
        let args = FfmpegTranscoder::build_args(&f, &t, Path::new("/out/x.tmp.m4a"));
        let joined = args.join(" ");

        assert!(joined.contains("volume=-3dB"), "{joined}");
        assert!(joined.contains("-ac 2"), "{joined}");
    }

    #[test]
    fn cd_quality_alac_needs_no_filters() {
        let f = fact(44_100, Some(16), 2);
        let t = resolve(&record(Action::Preserve, None), &f, &DeviceCeiling::default()).unwrap();
        let args = FfmpegTranscoder::build_args(&f, &t, Path::new("/out/x.tmp.m4a"));
        let joined = args.join(" ");

        assert!(!joined.contains("-af"), "{joined}");
        assert!(joined.contains("-c:a alac"), "{joined}");
    }

    #[test]
    fn aac_args_carry_profile_and_bitrate() {
        let f = fact(44_100, None, 2);
        let t = resolve(&record(Action::LossyReencode, Some(192)), &f, &DeviceCeiling::default()).unwrap();
        let args = FfmpegTranscoder::build_args(&f, &t, Path::new("/out/x.tmp.m4a"));
        let joined = args.join(" ");

        assert!(joined.contains("-c:a aac"), "{joined}");
        assert!(joined.contains("-profile:a aac_low"), "{joined}");
        assert!(joined.contains("-b:a 192k"), "{joined}");
    }

    #[test]
    fn passthrough_is_stream_copy() {
        let mut f = fact(44_100, None, 2);
        f.format = AudioFormat::Mp3;
        let t = resolve(&record(Action::Passthrough, None), &f, &DeviceCeiling::default()).unwrap();
        let args = FfmpegTranscoder::build_args(&f, &t, Path::new("/out/x.tmp.mp3"));
        let joined = args.join(" ");

        assert!(joined.contains("-c:a copy"), "{joined}");
        assert!(!joined.contains("-af"), "{joined}");
        assert!(!joined.contains("-b:a"), "{joined}");
    }
}
