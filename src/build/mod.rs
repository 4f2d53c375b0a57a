pub mod transcode;
pub mod verify;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{CacheError, FingerprintCache};
use crate::manifest::{ManifestError, ManifestRecord, ManifestWriter};
use crate::model::{AlbumFacts, ArtStatus, ErrorCode, TagStatus, TrackFact};
use crate::plan::Plan;
use crate::resolve::{self, DeviceCeiling, ResolvedTarget};
use transcode::Transcoder;
use verify::{VerifiedOutput, verify_output};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

pub struct BuildOptions {
    pub output_root: PathBuf,
    pub dry_run: bool,
    /// Bypass cache reads (still records fresh entries on success).
    pub force: bool,
    /// Stop scheduling new units after the first failure.
    pub fail_fast: bool,
    pub jobs: usize,
    pub duration_tolerance_secs: f64,
    pub tool_version: String,
}

/// One track's worth of work, fully resolved before any building starts.
#[derive(Debug, Clone)]
struct TrackUnit {
    album_id: String,
    fact: TrackFact,
    target: ResolvedTarget,
    output_path: PathBuf,
    tag_status: TagStatus,
    art_status: ArtStatus,
}

#[derive(Debug, Default)]
pub struct BuildTotals {
    pub built: u64,
    pub cached: u64,
    pub failed: u64,
    /// Dry-run only: units that would transcode.
    pub planned: u64,
    pub skipped_albums: u64,
    /// Ctrl-C drained the run before all units were scheduled.
    pub interrupted: bool,
    /// Fail-fast stopped the run early.
    pub aborted: bool,
    pub failures_by_code: BTreeMap<String, u64>,
}

/// Per-album rollup used to update the plan once, after the run.
#[derive(Debug, Default, Clone)]
pub struct AlbumOutcome {
    pub error_code: Option<ErrorCode>,
    pub track_hashes: Vec<String>,
    pub tracks_ok: usize,
    pub tracks_failed: usize,
}

pub struct BuildReport {
    pub totals: BuildTotals,
    pub album_outcomes: BTreeMap<String, AlbumOutcome>,
}

/// Drive an apply run: expand the plan into per-track units, consult the
/// fingerprint cache, transcode what needs building on a worker pool, and
/// append one manifest record per attempt.
///
/// Workers own one track end-to-end through transcode/verify/commit; cache
/// writes and manifest appends happen on this thread between chunks, so
/// concurrent producers never touch shared aggregation state.
pub fn run_apply(
    plan: &Plan,
    albums: &[AlbumFacts],
    prober: &dyn crate::scanner::probe::TrackProber,
    transcoder: &dyn Transcoder,
    cache: &FingerprintCache,
    ceiling: &DeviceCeiling,
    options: &BuildOptions,
    cancel: &AtomicBool,
) -> Result<BuildReport, BuildError> {
    let run_id = format!(
        "run-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    );
    let mut totals = BuildTotals::default();
    let mut outcomes: BTreeMap<String, AlbumOutcome> = BTreeMap::new();

    let mut manifest = if options.dry_run {
        None
    } else {
        Some(ManifestWriter::open(&options.output_root)?)
    };

    // Expand albums into track units; resolution failures are recorded
    // per album and the run continues (unless fail-fast).
    let mut units: Vec<TrackUnit> = Vec::new();
    'albums: for facts in albums {
        let Some(record) = plan.get(&facts.album_id) else {
            log::warn!(
                "No plan row for {}, re-run scan first",
                facts.source_path.display()
            );
            continue;
        };

        if record.skip {
            totals.skipped_albums += 1;
            continue;
        }

        for fact in &facts.tracks {
            match resolve::resolve(record, fact, ceiling) {
                Ok(target) if target.is_skip() => {
                    totals.skipped_albums += 1;
                    continue 'albums;
                }
                Ok(target) => {
                    let output_path =
                        resolve::output_path(&options.output_root, facts, fact, &target);
                    units.push(TrackUnit {
                        album_id: facts.album_id.clone(),
                        fact: fact.clone(),
                        target,
                        output_path,
                        tag_status: record.tag_status,
                        art_status: record.art_status,
                    });
                }
                Err(e) => {
                    // Album-level failure: every track gets a manifest row
                    // with the code, then the album is dropped from the run
                    log::error!("{}: {}", facts.source_path.display(), e);
                    let code = e.code();
                    for f in &facts.tracks {
                        totals.failed += 1;
                        *totals
                            .failures_by_code
                            .entry(code.as_str().to_string())
                            .or_insert(0) += 1;
                        if let Some(writer) = manifest.as_mut() {
                            writer.append(&resolution_failure_record(
                                &run_id, record, f, code,
                            ))?;
                        }
                    }
                    let outcome = outcomes.entry(facts.album_id.clone()).or_default();
                    outcome.error_code = Some(code);
                    outcome.tracks_failed += facts.tracks.len();
                    units.retain(|u| u.album_id != facts.album_id);
                    if options.fail_fast {
                        totals.aborted = true;
                        return Ok(BuildReport {
                            totals,
                            album_outcomes: outcomes,
                        });
                    }
                    continue 'albums;
                }
            }
        }
    }

    resolve_collisions(&mut units);

    // Cache consultation. A hit needs a matching fingerprint AND an
    // existing output that re-verifies; presence alone is never trusted.
    let mut to_build: Vec<TrackUnit> = Vec::new();
    for unit in units {
        let hit = if options.force {
            None
        } else {
            cache
                .lookup(&unit.fact, &unit.target, &options.tool_version)?
                .filter(|entry| entry.output_path == unit.output_path)
                .filter(|entry| {
                    if options.dry_run {
                        entry.output_path.exists()
                    } else {
                        verify_output(
                            prober,
                            &entry.output_path,
                            &unit.fact,
                            &unit.target,
                            options.duration_tolerance_secs,
                        )
                        .map_err(|e| {
                            log::info!(
                                "Cache entry for {} failed re-verification ({e}); rebuilding",
                                unit.fact.path.display()
                            )
                        })
                        .is_ok()
                    }
                })
        };

        match hit {
            Some(_) => {
                totals.cached += 1;
                let outcome = outcomes.entry(unit.album_id.clone()).or_default();
                outcome.tracks_ok += 1;
                outcome
                    .track_hashes
                    .push(unit.target.settings_hash(&options.tool_version));
                if let Some(writer) = manifest.as_mut() {
                    writer.append(&success_record(&run_id, &unit, None, true))?;
                }
            }
            None => to_build.push(unit),
        }
    }

    if options.dry_run {
        for unit in &to_build {
            log::info!(
                "would build: {} -> {} ({})",
                unit.fact.path.display(),
                unit.output_path.display(),
                unit.target.action
            );
        }
        totals.planned = to_build.len() as u64;
        return Ok(BuildReport {
            totals,
            album_outcomes: outcomes,
        });
    }

    let pb = ProgressBar::new(to_build.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .build()
        .unwrap();
    let chunk_size = options.jobs.max(1) * 2;

    'chunks: for chunk in to_build.chunks(chunk_size) {
        if cancel.load(Ordering::Relaxed) {
            log::warn!("Interrupted, letting in-flight tracks finish");
            totals.interrupted = true;
            break;
        }

        let results: Vec<(
            &TrackUnit,
            Result<VerifiedOutput, (ErrorCode, String)>,
        )> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|unit| {
                    let result = build_one(
                        unit,
                        prober,
                        transcoder,
                        options.duration_tolerance_secs,
                    );
                    pb.inc(1);
                    (unit, result)
                })
                .collect()
        });

        // Single-writer merge: cache + manifest + counters on this thread
        let mut chunk_failed = false;
        for (unit, result) in results {
            let outcome = outcomes.entry(unit.album_id.clone()).or_default();
            match result {
                Ok(verified) => {
                    cache.record_success(
                        &unit.fact,
                        &unit.target,
                        &options.tool_version,
                        &unit.output_path,
                    )?;
                    totals.built += 1;
                    outcome.tracks_ok += 1;
                    outcome
                        .track_hashes
                        .push(unit.target.settings_hash(&options.tool_version));
                    if let Some(writer) = manifest.as_mut() {
                        writer.append(&success_record(&run_id, unit, Some(&verified), false))?;
                    }
                }
                Err((code, message)) => {
                    log::error!("{}: {}", unit.fact.path.display(), message);
                    totals.failed += 1;
                    outcome.tracks_failed += 1;
                    outcome.error_code.get_or_insert(code);
                    *totals
                        .failures_by_code
                        .entry(code.as_str().to_string())
                        .or_insert(0) += 1;
                    chunk_failed = true;
                    if let Some(writer) = manifest.as_mut() {
                        writer.append(&failure_record(&run_id, unit, code))?;
                    }
                }
            }
        }
        pb.set_message(format!("{} built, {} failed", totals.built, totals.failed));

        if options.fail_fast && chunk_failed {
            totals.aborted = true;
            break 'chunks;
        }
    }

    pb.finish_with_message(format!(
        "Done: {} built, {} cached, {} failed",
        totals.built, totals.cached, totals.failed
    ));

    Ok(BuildReport {
        totals,
        album_outcomes: outcomes,
    })
}

/// Build one track through the unit state machine:
/// transcode to a temp file, verify it, then commit atomically. Any
/// failure removes the temp file and leaves the final path untouched.
fn build_one(
    unit: &TrackUnit,
    prober: &dyn crate::scanner::probe::TrackProber,
    transcoder: &dyn Transcoder,
    duration_tolerance_secs: f64,
) -> Result<VerifiedOutput, (ErrorCode, String)> {
    if let Some(parent) = unit.output_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| (ErrorCode::IoError, format!("mkdir failed: {e}")))?;
    }

    let temp = temp_path(&unit.output_path);

    if let Err(e) = transcoder.transcode(&unit.fact, &unit.target, &temp) {
        cleanup(&temp);
        return Err((ErrorCode::TranscodeFailed, e.to_string()));
    }

    let verified =
        match verify_output(prober, &temp, &unit.fact, &unit.target, duration_tolerance_secs) {
            Ok(v) => v,
            Err(message) => {
                cleanup(&temp);
                return Err((ErrorCode::VerifyFailed, message));
            }
        };

    if let Err(e) = std::fs::rename(&temp, &unit.output_path) {
        cleanup(&temp);
        return Err((ErrorCode::IoError, format!("commit failed: {e}")));
    }

    Ok(verified)
}

/// Temp file beside the final path, keeping the real extension last so
/// the transcoder still recognizes the container: `x.m4a` → `x.tmp.m4a`.
fn temp_path(final_path: &Path) -> PathBuf {
    let ext = final_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("out");
    final_path.with_extension(format!("tmp.{ext}"))
}

fn cleanup(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Could not remove temp file {}: {e}", path.display());
        }
    }
}

/// Distinct albums landing on the same output folder get a deterministic
/// suffix derived from the album id, identical across repeated runs.
fn resolve_collisions(units: &mut [TrackUnit]) {
    let mut folders: BTreeMap<PathBuf, std::collections::BTreeSet<String>> = BTreeMap::new();
    for unit in units.iter() {
        if let Some(folder) = unit.output_path.parent() {
            folders
                .entry(folder.to_path_buf())
                .or_default()
                .insert(unit.album_id.clone());
        }
    }

    for (folder, ids) in folders {
        if ids.len() < 2 {
            continue;
        }
        log::warn!(
            "Output collision on {} between {} albums; applying suffixes",
            folder.display(),
            ids.len()
        );
        // The lexicographically-first album keeps the bare folder
        for id in ids.iter().skip(1) {
            let suffixed = suffixed_folder(&folder, id);
            for unit in units.iter_mut() {
                if unit.album_id == *id && unit.output_path.parent() == Some(folder.as_path()) {
                    let name = unit.output_path.file_name().unwrap().to_os_string();
                    unit.output_path = suffixed.join(name);
                }
            }
        }
    }
}

fn suffixed_folder(folder: &Path, album_id: &str) -> PathBuf {
    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    folder.with_file_name(format!("{}{}", name, resolve::collision_suffix(album_id)))
}

/// Update the plan's build fields once from aggregated outcomes: the
/// single write after a run, never during it.
pub fn update_plan(plan: &mut Plan, report: &BuildReport, completed_at: &str) {
    for (album_id, outcome) in &report.album_outcomes {
        let Some(record) = plan.get_mut(album_id) else {
            continue;
        };
        record.error_code = outcome.error_code;
        if outcome.error_code.is_none() && outcome.tracks_failed == 0 && outcome.tracks_ok > 0 {
            record.plan_hash = Some(combined_hash(&outcome.track_hashes));
            record.last_built_at = Some(completed_at.to_string());
        }
    }
    plan.recompute_summary();
}

/// Album-level hash over the sorted per-track settings hashes.
fn combined_hash(track_hashes: &[String]) -> String {
    let mut sorted = track_hashes.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for h in sorted {
        hasher.update(h.as_bytes());
        hasher.update(b"|");
    }
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn success_record(
    run_id: &str,
    unit: &TrackUnit,
    verified: Option<&VerifiedOutput>,
    cached: bool,
) -> ManifestRecord {
    ManifestRecord {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        album_id: unit.album_id.clone(),
        source_path: unit.fact.path.clone(),
        output_path: Some(unit.output_path.clone()),
        action: unit.target.action,
        output_codec: Some(unit.target.output_codec.as_str().to_string()),
        output_sample_rate_hz: Some(unit.target.output_sample_rate_hz),
        output_bit_depth: unit.target.output_bit_depth,
        aac_bitrate_kbps: unit.target.aac_bitrate_kbps,
        dither_applied: unit.target.apply_dither,
        duration_seconds: verified.map(|v| v.duration_seconds),
        output_size_bytes: verified.map(|v| v.size_bytes),
        tag_status: unit.tag_status,
        art_status: unit.art_status,
        cached,
        error_code: None,
    }
}

fn failure_record(run_id: &str, unit: &TrackUnit, code: ErrorCode) -> ManifestRecord {
    ManifestRecord {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        album_id: unit.album_id.clone(),
        source_path: unit.fact.path.clone(),
        output_path: None,
        action: unit.target.action,
        output_codec: Some(unit.target.output_codec.as_str().to_string()),
        output_sample_rate_hz: Some(unit.target.output_sample_rate_hz),
        output_bit_depth: unit.target.output_bit_depth,
        aac_bitrate_kbps: unit.target.aac_bitrate_kbps,
        dither_applied: unit.target.apply_dither,
        duration_seconds: None,
        output_size_bytes: None,
        tag_status: unit.tag_status,
        art_status: unit.art_status,
        cached: false,
        error_code: Some(code),
    }
}

fn resolution_failure_record(
    run_id: &str,
    record: &crate::plan::AlbumRecord,
    fact: &TrackFact,
    code: ErrorCode,
) -> ManifestRecord {
    ManifestRecord {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        album_id: record.album_id.clone(),
        source_path: fact.path.clone(),
        output_path: None,
        action: record.default_action,
        output_codec: None,
        output_sample_rate_hz: None,
        output_bit_depth: None,
        aac_bitrate_kbps: None,
        dither_applied: false,
        duration_seconds: None,
        output_size_bytes: None,
        tag_status: record.tag_status,
        art_status: record.art_status,
        cached: false,
        error_code: Some(code),
    }
}
