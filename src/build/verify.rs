use std::path::Path;

use crate::model::{AudioFormat, TrackFact};
use crate::resolve::{OutputCodec, ResolvedTarget};
use crate::scanner::probe::TrackProber;

/// Facts about a verified output file, recorded in the manifest.
#[derive(Debug, Clone)]
pub struct VerifiedOutput {
    pub codec: AudioFormat,
    pub sample_rate_hz: u32,
    pub bit_depth: Option<u16>,
    pub duration_seconds: f64,
    pub size_bytes: u64,
}

/// Sample rates are compared with a small slack; some encoders report
/// container-rounded values.
const SAMPLE_RATE_TOLERANCE_HZ: u32 = 100;

/// Probe a produced file and check it against the resolved target:
/// codec family, sample rate, bit depth, and duration within tolerance of
/// the source (catches silent truncation, forgives container rounding).
pub fn verify_output(
    prober: &dyn TrackProber,
    output_path: &Path,
    fact: &TrackFact,
    target: &ResolvedTarget,
    duration_tolerance_secs: f64,
) -> Result<VerifiedOutput, String> {
    let meta = std::fs::metadata(output_path)
        .map_err(|e| format!("output missing: {e}"))?;
    if meta.len() == 0 {
        return Err("output file is empty".to_string());
    }

    let probed = prober
        .probe(output_path)
        .map_err(|e| format!("probe failed: {e}"))?;

    let expected_format = match target.output_codec {
        OutputCodec::Alac => AudioFormat::Alac,
        OutputCodec::Aac => AudioFormat::Aac,
        // Stream copy keeps the source codec
        OutputCodec::Copy => fact.format,
    };
    if probed.format != expected_format {
        return Err(format!(
            "codec mismatch: got {}, expected {}",
            probed.format, expected_format
        ));
    }

    if target.output_codec != OutputCodec::Copy {
        let diff = probed.sample_rate_hz.abs_diff(target.output_sample_rate_hz);
        if diff > SAMPLE_RATE_TOLERANCE_HZ {
            return Err(format!(
                "sample rate mismatch: got {} Hz, expected {} Hz",
                probed.sample_rate_hz, target.output_sample_rate_hz
            ));
        }
    }

    // The container may carry a wider sample format (ALAC stores 24-bit
    // in s32p), so reject only outputs narrower than the target.
    if let (Some(expected), Some(got)) = (target.output_bit_depth, probed.bit_depth) {
        if got < expected {
            return Err(format!(
                "bit depth mismatch: got {got}-bit, expected {expected}-bit"
            ));
        }
    }

    let drift = (probed.duration_seconds - fact.duration_seconds).abs();
    if drift > duration_tolerance_secs {
        return Err(format!(
            "duration mismatch: output {:.2}s vs source {:.2}s (tolerance {:.2}s)",
            probed.duration_seconds, fact.duration_seconds, duration_tolerance_secs
        ));
    }

    Ok(VerifiedOutput {
        codec: probed.format,
        sample_rate_hz: probed.sample_rate_hz,
        bit_depth: probed.bit_depth,
        duration_seconds: probed.duration_seconds,
        size_bytes: meta.len(),
    })
}
