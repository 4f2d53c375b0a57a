use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AlbumFacts, ArtStatus, ErrorCode, TagStatus};
use crate::resolve::Action;
use crate::scanner::classify::Classification;

/// Bumped whenever the plan layout changes incompatibly. Loaders refuse
/// other versions instead of attempting a lossy best-effort read.
pub const SCHEMA_VERSION: u32 = 1;

/// Marker prefixed onto `notes` when a scan no longer sees the album's
/// source directory. The row (and its user edits) is kept, not deleted.
pub const STALE_PREFIX: &str = "STALE:";

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plan parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("plan file not found: {0}")]
    NotFound(PathBuf),
    #[error("incompatible plan schema version {found} (this build reads version {expected}); \
             re-run scan with --recreate to start a new plan")]
    SchemaMismatch { found: u32, expected: u32 },
    #[error("plan file is locked by another process: {0}")]
    Locked(PathBuf),
    #[error("duplicate album_id {0} in plan")]
    DuplicateAlbumId(String),
}

impl PlanError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::SchemaMismatch { .. } => Some(ErrorCode::SchemaMismatch),
            Self::Locked(_) => Some(ErrorCode::PlanLocked),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// One row per album directory. Scan-owned fields are replaced on every
/// merge; user-owned fields (`user_action`, `aac_target_kbps`, `skip`)
/// survive every merge until an explicit `--recreate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumRecord {
    pub album_id: String,

    // Scan-owned
    pub source_path: PathBuf,
    pub artist: String,
    pub album: String,
    pub year: Option<i32>,
    pub track_count: usize,
    /// Formats present in the source, joined with ';' (e.g. "FLAC;MP3").
    pub source_formats: String,
    pub max_sample_rate_hz: u32,
    pub max_bit_depth: Option<u16>,
    pub default_action: Action,
    pub tag_status: TagStatus,
    pub art_status: ArtStatus,
    #[serde(default)]
    pub notes: String,

    // User-owned. Kept as the raw string so an invalid edit survives a
    // save/load cycle and is reported as INVALID_ACTION at resolve time.
    #[serde(default)]
    pub user_action: Option<String>,
    #[serde(default)]
    pub aac_target_kbps: Option<u32>,
    #[serde(default)]
    pub skip: bool,

    // Build provenance
    #[serde(default)]
    pub plan_hash: Option<String>,
    #[serde(default)]
    pub last_built_at: Option<String>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
}

impl AlbumRecord {
    /// Build a fresh scan row from aggregated facts and classification.
    /// User-owned and build fields start unset.
    pub fn from_scan(facts: &AlbumFacts, classification: &Classification) -> Self {
        Self {
            album_id: facts.album_id.clone(),
            source_path: facts.source_path.clone(),
            artist: facts
                .album_artist
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| facts.artist.clone()),
            album: facts.album.clone(),
            year: facts.year,
            track_count: facts.track_count(),
            source_formats: facts.formats_joined(),
            max_sample_rate_hz: facts.max_sample_rate_hz,
            max_bit_depth: facts.max_bit_depth,
            default_action: classification.default_action,
            tag_status: classification.tag_status,
            art_status: classification.art_status,
            notes: classification.notes.join("; "),
            user_action: None,
            aac_target_kbps: None,
            skip: false,
            plan_hash: None,
            last_built_at: None,
            error_code: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.notes.starts_with(STALE_PREFIX)
    }
}

/// Summary block persisted at the top of the plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub schema_version: u32,
    pub library_root: PathBuf,
    #[serde(default)]
    pub last_scan_at: Option<String>,
    #[serde(default)]
    pub total_albums: usize,
    #[serde(default)]
    pub total_tracks: usize,
    #[serde(default)]
    pub tag_status_counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub art_status_counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub action_counts: BTreeMap<String, usize>,
}

/// The durable conversion plan: a summary block plus one row per album.
/// Lifecycle is explicit: load, mutate in memory, save atomically. No
/// ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub summary: PlanSummary,
    pub albums: Vec<AlbumRecord>,
}

impl Plan {
    pub fn new(library_root: &Path) -> Self {
        Self {
            summary: PlanSummary {
                schema_version: SCHEMA_VERSION,
                library_root: library_root.to_path_buf(),
                last_scan_at: None,
                total_albums: 0,
                total_tracks: 0,
                tag_status_counts: BTreeMap::new(),
                art_status_counts: BTreeMap::new(),
                action_counts: BTreeMap::new(),
            },
            albums: Vec::new(),
        }
    }

    /// Load a plan, failing fast on version or identity problems before
    /// any caller mutates durable state.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PlanError::NotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;

        // Check the schema version before committing to the full layout,
        // so a future plan fails with SCHEMA_MISMATCH rather than a parse
        // error about fields we don't know.
        let value: serde_yaml::Value = serde_yaml::from_str(&contents)?;
        let found = value
            .get("summary")
            .and_then(|s| s.get("schema_version"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if found != SCHEMA_VERSION {
            return Err(PlanError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }

        let plan: Plan = serde_yaml::from_value(value)?;

        let mut seen = std::collections::BTreeSet::new();
        for record in &plan.albums {
            if !seen.insert(record.album_id.clone()) {
                return Err(PlanError::DuplicateAlbumId(record.album_id.clone()));
            }
        }

        Ok(plan)
    }

    /// Row-level issues that don't block loading: invalid user actions and
    /// bitrates, reported as (album_id, error code, message). The rows
    /// themselves fail individually at resolve time.
    pub fn validation_issues(&self) -> Vec<(String, ErrorCode, String)> {
        let mut issues = Vec::new();
        for record in &self.albums {
            if let Some(action) = record.user_action.as_deref() {
                if !action.trim().is_empty() {
                    if let Err(e) = action.parse::<Action>() {
                        issues.push((record.album_id.clone(), ErrorCode::InvalidAction, e.to_string()));
                    }
                }
            }
            if let Some(kbps) = record.aac_target_kbps {
                if !crate::resolve::ALLOWED_AAC_BITRATES.contains(&kbps) {
                    issues.push((
                        record.album_id.clone(),
                        ErrorCode::InvalidBitrate,
                        format!("invalid AAC bitrate {kbps} kbps"),
                    ));
                }
            }
        }
        issues
    }

    /// Union a fresh scan into this plan.
    ///
    /// - album present in both: scan-owned fields take the fresh values,
    ///   user-owned and build fields are carried over unchanged;
    /// - album only in the fresh scan: inserted with defaults;
    /// - album only in the existing plan: retained, marked stale.
    pub fn merge(&mut self, fresh: Vec<AlbumRecord>, scanned_at: &str) {
        let mut existing: BTreeMap<String, AlbumRecord> = self
            .albums
            .drain(..)
            .map(|r| (r.album_id.clone(), r))
            .collect();

        let mut merged = Vec::with_capacity(fresh.len());
        for mut row in fresh {
            if let Some(prev) = existing.remove(&row.album_id) {
                row.user_action = prev.user_action;
                row.aac_target_kbps = prev.aac_target_kbps;
                row.skip = prev.skip;
                row.plan_hash = prev.plan_hash;
                row.last_built_at = prev.last_built_at;
                row.error_code = prev.error_code;
            }
            merged.push(row);
        }

        // Whatever remains wasn't seen by this scan: source directory
        // removed or renamed. Keep the row so user decisions survive.
        for (_, mut row) in existing {
            if !row.is_stale() {
                row.notes = if row.notes.is_empty() {
                    format!("{STALE_PREFIX} source directory not found by last scan")
                } else {
                    format!("{STALE_PREFIX} source directory not found by last scan; {}", row.notes)
                };
            }
            merged.push(row);
        }

        merged.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        self.albums = merged;
        self.summary.last_scan_at = Some(scanned_at.to_string());
        self.recompute_summary();
    }

    pub fn recompute_summary(&mut self) {
        let mut tag = BTreeMap::new();
        let mut art = BTreeMap::new();
        let mut actions = BTreeMap::new();
        let mut tracks = 0usize;

        for record in &self.albums {
            tracks += record.track_count;
            *tag.entry(status_key(&record.tag_status)).or_insert(0) += 1;
            *art.entry(art_key(&record.art_status)).or_insert(0) += 1;

            // Count the effective action; unparseable overrides count as
            // INVALID so they show up in `status` output.
            let action = if record.skip {
                "SKIP".to_string()
            } else {
                match record.user_action.as_deref() {
                    Some(s) if !s.trim().is_empty() => match s.parse::<Action>() {
                        Ok(a) => a.as_str().to_string(),
                        Err(_) => "INVALID".to_string(),
                    },
                    _ => record.default_action.as_str().to_string(),
                }
            };
            *actions.entry(action).or_insert(0) += 1;
        }

        self.summary.schema_version = SCHEMA_VERSION;
        self.summary.total_albums = self.albums.len();
        self.summary.total_tracks = tracks;
        self.summary.tag_status_counts = tag;
        self.summary.art_status_counts = art;
        self.summary.action_counts = actions;
    }

    pub fn get(&self, album_id: &str) -> Option<&AlbumRecord> {
        self.albums.iter().find(|r| r.album_id == album_id)
    }

    pub fn get_mut(&mut self, album_id: &str) -> Option<&mut AlbumRecord> {
        self.albums.iter_mut().find(|r| r.album_id == album_id)
    }

    /// Atomic save: honor external locks, back up the previous version,
    /// stage to a side file, then promote with a rename. A crash or a
    /// concurrent reader never observes a partial plan.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if path.exists() {
            check_external_lock(path)?;
            let backup = backup_path(path);
            fs::copy(path, &backup)?;
            log::debug!("Plan backed up to {}", backup.display());
        }

        let mut contents = String::from(PLAN_HEADER);
        contents.push_str(&serde_yaml::to_string(self)?);

        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn status_key(s: &TagStatus) -> String {
    match s {
        TagStatus::Green => "GREEN",
        TagStatus::Yellow => "YELLOW",
        TagStatus::Red => "RED",
    }
    .to_string()
}

fn art_key(s: &ArtStatus) -> String {
    match s {
        ArtStatus::Green => "GREEN",
        ArtStatus::Yellow => "YELLOW",
        ArtStatus::Red => "RED",
    }
    .to_string()
}

/// Refuse to overwrite a plan another process holds exclusively open
/// (e.g. an editor with file locking). Lock is probed and released; the
/// actual write happens via rename so readers never see a torn file.
fn check_external_lock(path: &Path) -> Result<()> {
    let file = File::open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = fs2::FileExt::unlock(&file);
            Ok(())
        }
        Err(_) => Err(PlanError::Locked(path.to_path_buf())),
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "plan".to_string());
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    path.with_file_name(format!("{stem}.{timestamp}.yaml"))
}

const PLAN_HEADER: &str = "\
# podprep conversion plan.
#
# Edit these fields per album, then run `podprep apply`:
#   user_action:      PRESERVE | FORCE_CEILING | LOSSY_REENCODE | PASSTHROUGH | SKIP
#   aac_target_kbps:  128 | 192 | 256 | 320   (LOSSY_REENCODE only)
#   skip:             true to exclude the album
#
# Everything else is rewritten on every scan. Your edits survive rescans;
# `podprep scan --recreate` discards them.

";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArtStatus, TagStatus};

    fn row(id: &str, path: &str) -> AlbumRecord {
        AlbumRecord {
            album_id: id.to_string(),
            source_path: PathBuf::from(path),
            artist: "Artist".into(),
            album: "Album".into(),
            year: Some(1977),
            track_count: 10,
            source_formats: "FLAC".into(),
            max_sample_rate_hz: 44_100,
            max_bit_depth: Some(16),
            default_action: Action::Preserve,
            tag_status: TagStatus::Green,
            art_status: ArtStatus::Green,
            notes: String::new(),
            user_action: None,
            aac_target_kbps: None,
            skip: false,
            plan_hash: None,
            last_built_at: None,
            error_code: None,
        }
    }

    #[test]
    fn merge_preserves_user_edits_over_scan_changes() {
        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "2026-01-01T00:00:00Z");

        {
            let rec = plan.get_mut("a1").unwrap();
            rec.user_action = Some("AAC".into());
            rec.aac_target_kbps = Some(192);
            rec.skip = false;
        }

        // Fresh scan with changed scan-owned facts
        let mut fresh = row("a1", "/music/x");
        fresh.max_sample_rate_hz = 96_000;
        fresh.max_bit_depth = Some(24);
        fresh.default_action = Action::Preserve;
        plan.merge(vec![fresh], "2026-01-02T00:00:00Z");

        let rec = plan.get("a1").unwrap();
        assert_eq!(rec.user_action.as_deref(), Some("AAC"));
        assert_eq!(rec.aac_target_kbps, Some(192));
        assert_eq!(rec.max_sample_rate_hz, 96_000);
        assert_eq!(rec.max_bit_depth, Some(24));
    }

    #[test]
    fn merge_inserts_new_rows_with_defaults() {
        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "t");
        plan.merge(vec![row("a1", "/music/x"), row("b2", "/music/y")], "t");

        assert_eq!(plan.albums.len(), 2);
        let rec = plan.get("b2").unwrap();
        assert!(rec.user_action.is_none());
        assert!(!rec.skip);
    }

    #[test]
    fn merge_marks_missing_rows_stale_instead_of_deleting() {
        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x"), row("b2", "/music/y")], "t");
        plan.get_mut("b2").unwrap().user_action = Some("SKIP".into());

        // Next scan no longer sees b2
        plan.merge(vec![row("a1", "/music/x")], "t2");

        assert_eq!(plan.albums.len(), 2);
        let rec = plan.get("b2").unwrap();
        assert!(rec.is_stale());
        assert_eq!(rec.user_action.as_deref(), Some("SKIP"));

        // A stale row doesn't double-mark on a further scan
        plan.merge(vec![row("a1", "/music/x")], "t3");
        let rec = plan.get("b2").unwrap();
        assert_eq!(rec.notes.matches(STALE_PREFIX).count(), 1);
    }

    #[test]
    fn stale_marker_clears_when_directory_reappears() {
        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "t");
        plan.merge(vec![], "t2");
        assert!(plan.get("a1").unwrap().is_stale());

        plan.merge(vec![row("a1", "/music/x")], "t3");
        assert!(!plan.get("a1").unwrap().is_stale());
    }

    #[test]
    fn merge_preserves_build_provenance() {
        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "t");
        {
            let rec = plan.get_mut("a1").unwrap();
            rec.plan_hash = Some("cafebabe".into());
            rec.last_built_at = Some("2026-01-01T12:00:00Z".into());
        }
        plan.merge(vec![row("a1", "/music/x")], "t2");
        let rec = plan.get("a1").unwrap();
        assert_eq!(rec.plan_hash.as_deref(), Some("cafebabe"));
        assert!(rec.last_built_at.is_some());
    }

    #[test]
    fn save_load_round_trips_user_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");

        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "2026-01-01T00:00:00Z");
        {
            let rec = plan.get_mut("a1").unwrap();
            rec.user_action = Some("FORCE_CEILING".into());
            rec.aac_target_kbps = Some(320);
            rec.skip = true;
        }
        plan.save(&path).unwrap();

        let loaded = Plan::load(&path).unwrap();
        let rec = loaded.get("a1").unwrap();
        assert_eq!(rec.user_action.as_deref(), Some("FORCE_CEILING"));
        assert_eq!(rec.aac_target_kbps, Some(320));
        assert!(rec.skip);
        assert_eq!(loaded.summary.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn save_keeps_a_backup_of_the_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");

        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "t");
        plan.save(&path).unwrap();
        plan.save(&path).unwrap();

        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("plan.") && name != "plan.yaml"
            })
            .count();
        assert!(backups >= 1);
    }

    #[test]
    fn load_rejects_incompatible_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        fs::write(
            &path,
            "summary:\n  schema_version: 99\n  library_root: /music\nalbums: []\n",
        )
        .unwrap();

        let err = Plan::load(&path).unwrap_err();
        assert!(matches!(err, PlanError::SchemaMismatch { found: 99, .. }));
        assert_eq!(err.code(), Some(ErrorCode::SchemaMismatch));
    }

    #[test]
    fn load_rejects_duplicate_album_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");

        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "t");
        plan.albums.push(row("a1", "/music/y"));
        plan.save(&path).unwrap();

        let err = Plan::load(&path).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateAlbumId(_)));
    }

    #[test]
    fn save_refuses_when_externally_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");

        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x")], "t");
        plan.save(&path).unwrap();

        let holder = File::open(&path).unwrap();
        holder.lock_exclusive().unwrap();

        let err = plan.save(&path).unwrap_err();
        assert!(matches!(err, PlanError::Locked(_)));
        assert_eq!(err.code(), Some(ErrorCode::PlanLocked));

        fs2::FileExt::unlock(&holder).unwrap();
        plan.save(&path).unwrap();
    }

    #[test]
    fn validation_flags_bad_user_values_without_blocking_load() {
        let mut plan = Plan::new(Path::new("/music"));
        plan.merge(vec![row("a1", "/music/x"), row("b2", "/music/y")], "t");
        plan.get_mut("a1").unwrap().user_action = Some("BOGUS".into());
        plan.get_mut("b2").unwrap().aac_target_kbps = Some(999);

        let issues = plan.validation_issues();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|(id, code, _)| id == "a1" && *code == ErrorCode::InvalidAction));
        assert!(issues.iter().any(|(id, code, _)| id == "b2" && *code == ErrorCode::InvalidBitrate));
    }

    #[test]
    fn summary_counts_effective_actions() {
        let mut plan = Plan::new(Path::new("/music"));
        let mut a = row("a1", "/music/x");
        a.user_action = Some("AAC".into());
        let mut b = row("b2", "/music/y");
        b.skip = true;
        plan.merge(vec![a, b, row("c3", "/music/z")], "t");

        assert_eq!(plan.summary.action_counts.get("LOSSY_REENCODE"), Some(&1));
        assert_eq!(plan.summary.action_counts.get("SKIP"), Some(&1));
        assert_eq!(plan.summary.action_counts.get("PRESERVE"), Some(&1));
        assert_eq!(plan.summary.total_albums, 3);
        assert_eq!(plan.summary.total_tracks, 30);
    }
}
