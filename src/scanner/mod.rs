pub mod classify;
pub mod probe;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::SUPPORTED_EXTENSIONS;
use crate::model::{AlbumFacts, TrackFact, album_id};
use probe::TrackProber;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("library root does not exist: {0}")]
    MissingRoot(PathBuf),
}

/// Filename stems we treat as folder artwork candidates.
const ART_STEMS: &[&str] = &["cover", "folder", "front", "album", "art"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

pub struct ScanOutput {
    pub albums: Vec<AlbumFacts>,
    pub tracks_probed: u64,
    pub errors: u64,
}

/// Scan a library: every directory containing at least one audio file is
/// an album. Tracks are probed on a worker pool sized for I/O-bound work;
/// aggregation happens after all of an album's probes complete, with no
/// shared mutable state between workers.
pub fn scan_library(
    library_root: &Path,
    prober: &dyn TrackProber,
    threads: usize,
) -> Result<ScanOutput, ScanError> {
    if !library_root.is_dir() {
        return Err(ScanError::MissingRoot(library_root.to_path_buf()));
    }

    // First pass: group audio files by their directory
    let mut dirs: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(library_root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            let dir = entry.path().parent().unwrap_or(library_root).to_path_buf();
            dirs.entry(dir).or_default().push(entry.path().to_path_buf());
        }
    }

    // Stable order inside each album
    let mut flat: Vec<(usize, PathBuf)> = Vec::new();
    let album_dirs: Vec<PathBuf> = dirs.keys().cloned().collect();
    for (idx, dir) in album_dirs.iter().enumerate() {
        let mut files = dirs.remove(dir).unwrap_or_default();
        files.sort_by_key(|p| p.file_name().map(|n| n.to_ascii_lowercase()));
        for f in files {
            flat.push((idx, f));
        }
    }

    let pb = ProgressBar::new(flat.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    pb.set_message("Scanning...");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .unwrap();

    let mut probed: Vec<Vec<TrackFact>> = vec![Vec::new(); album_dirs.len()];
    let mut tracks_probed: u64 = 0;
    let mut errors: u64 = 0;

    // Probe in chunks: a chunk fans out across the pool, then results
    // merge on this thread before the next chunk starts.
    let chunk_size = (threads.max(1)) * 2;
    for chunk in flat.chunks(chunk_size) {
        let results: Vec<(usize, Result<TrackFact, probe::ProbeError>)> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|(idx, path)| {
                    let result = prober.probe(path);
                    pb.inc(1);
                    (*idx, result)
                })
                .collect()
        });

        for (idx, result) in results {
            match result {
                Ok(fact) => {
                    tracks_probed += 1;
                    probed[idx].push(fact);
                }
                Err(e) => {
                    log::warn!("Extraction failed: {e}");
                    errors += 1;
                }
            }
        }
    }

    pb.finish_with_message(format!("Done: {tracks_probed} tracks, {errors} errors"));

    let mut albums = Vec::new();
    for (idx, dir) in album_dirs.iter().enumerate() {
        let mut tracks = std::mem::take(&mut probed[idx]);
        // Parallel probing may deliver out of order
        tracks.sort_by_key(|t| t.path.file_name().map(|n| n.to_ascii_lowercase()));
        albums.push(aggregate_album(library_root, dir, tracks, prober));
    }

    Ok(ScanOutput {
        albums,
        tracks_probed,
        errors,
    })
}

/// Find folder artwork candidates in an album directory.
pub fn artwork_candidates(dir: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return candidates;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) && ART_STEMS.contains(&stem.as_str()) {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates
}

/// Aggregate one directory's probed tracks into album-level facts.
fn aggregate_album(
    library_root: &Path,
    dir: &Path,
    tracks: Vec<TrackFact>,
    prober: &dyn TrackProber,
) -> AlbumFacts {
    let art_candidates = artwork_candidates(dir);
    let art_sizes: Vec<(u32, u32)> = art_candidates
        .iter()
        .filter_map(|p| prober.probe_image(p))
        .collect();

    let artist = most_common(tracks.iter().filter_map(|t| t.artist.as_deref())).unwrap_or_default();
    let album = most_common(tracks.iter().filter_map(|t| t.album.as_deref())).unwrap_or_default();
    let album_artist = most_common(tracks.iter().filter_map(|t| t.album_artist.as_deref()));
    let year = most_common_by(tracks.iter().filter_map(|t| t.year));
    let is_compilation = tracks.iter().any(|t| t.compilation);

    let max_sample_rate_hz = tracks.iter().map(|t| t.sample_rate_hz).max().unwrap_or(0);
    let max_bit_depth = tracks.iter().filter_map(|t| t.bit_depth).max();
    let source_formats = tracks.iter().map(|t| t.format).collect();

    AlbumFacts {
        album_id: album_id(library_root, dir),
        source_path: dir.to_path_buf(),
        artist: artist.to_string(),
        album: album.to_string(),
        album_artist: album_artist.map(|s| s.to_string()),
        year,
        is_compilation,
        art_candidates,
        art_sizes,
        max_sample_rate_hz,
        max_bit_depth,
        source_formats,
        tracks,
    }
}

/// Most frequent value; ties break toward the smaller value so the result
/// is deterministic regardless of probe order.
fn most_common<'a>(items: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(v, _)| v)
}

fn most_common_by<T: Ord + Copy>(items: impl Iterator<Item = T>) -> Option<T> {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(v, _)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AudioFormat;
    use probe::ProbeError;
    use std::fs;

    /// Prober stub: derives facts from the filename, fails on "bad".
    struct StubProber;

    impl TrackProber for StubProber {
        fn probe(&self, path: &Path) -> Result<TrackFact, ProbeError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.contains("bad") {
                return Err(ProbeError::NoAudioStream(name));
            }
            let ext = path.extension().unwrap().to_string_lossy().to_string();
            let format = AudioFormat::from_extension(&ext);
            let hires = name.contains("hires");
            Ok(TrackFact {
                path: path.to_path_buf(),
                format,
                sample_rate_hz: if hires { 96_000 } else { 44_100 },
                bit_depth: if format.is_lossless() {
                    Some(if hires { 24 } else { 16 })
                } else {
                    None
                },
                channels: 2,
                duration_seconds: 180.0,
                title: Some(name.clone()),
                artist: Some("Artist".into()),
                album: Some("Album".into()),
                album_artist: None,
                track_number: Some(1),
                track_total: None,
                disc_number: None,
                disc_total: None,
                year: Some(1999),
                compilation: false,
                has_embedded_art: false,
                embedded_art_width: None,
                embedded_art_height: None,
                size_bytes: 1000,
                mtime_unix: 0,
            })
        }

        fn probe_image(&self, _path: &Path) -> Option<(u32, u32)> {
            Some((600, 600))
        }
    }

    #[test]
    fn one_album_per_directory_with_audio() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Artist/AlbumA")).unwrap();
        fs::create_dir_all(root.join("Artist/AlbumB")).unwrap();
        fs::create_dir_all(root.join("Artist/Empty")).unwrap();
        fs::write(root.join("Artist/AlbumA/01 a.flac"), b"x").unwrap();
        fs::write(root.join("Artist/AlbumA/02 a.flac"), b"x").unwrap();
        fs::write(root.join("Artist/AlbumB/01 b.mp3"), b"x").unwrap();
        fs::write(root.join("Artist/AlbumB/notes.txt"), b"x").unwrap();

        let out = scan_library(root, &StubProber, 4).unwrap();
        assert_eq!(out.albums.len(), 2);
        assert_eq!(out.tracks_probed, 3);
        assert_eq!(out.errors, 0);

        let a = out
            .albums
            .iter()
            .find(|a| a.source_path.ends_with("AlbumA"))
            .unwrap();
        assert_eq!(a.track_count(), 2);
        assert!(a.source_formats.contains(&AudioFormat::Flac));
    }

    #[test]
    fn probe_failures_count_but_do_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("A")).unwrap();
        fs::write(root.join("A/01 good.flac"), b"x").unwrap();
        fs::write(root.join("A/02 bad.flac"), b"x").unwrap();

        let out = scan_library(root, &StubProber, 2).unwrap();
        assert_eq!(out.errors, 1);
        assert_eq!(out.albums.len(), 1);
        assert_eq!(out.albums[0].track_count(), 1);
    }

    #[test]
    fn aggregation_rolls_up_max_rates_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("A")).unwrap();
        fs::write(root.join("A/01 hires.flac"), b"x").unwrap();
        fs::write(root.join("A/02 t.mp3"), b"x").unwrap();

        let out = scan_library(root, &StubProber, 2).unwrap();
        let album = &out.albums[0];
        assert_eq!(album.max_sample_rate_hz, 96_000);
        assert_eq!(album.max_bit_depth, Some(24));
        assert!(album.has_lossless());
        assert!(!album.is_mp3_only());
    }

    #[test]
    fn artwork_candidates_match_known_stems() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("A")).unwrap();
        fs::write(root.join("A/01 t.flac"), b"x").unwrap();
        fs::write(root.join("A/cover.jpg"), b"x").unwrap();
        fs::write(root.join("A/back.jpg"), b"x").unwrap();
        fs::write(root.join("A/folder.png"), b"x").unwrap();

        let candidates = artwork_candidates(&root.join("A"));
        assert_eq!(candidates.len(), 2);

        let out = scan_library(root, &StubProber, 2).unwrap();
        assert_eq!(out.albums[0].art_candidates.len(), 2);
        assert_eq!(out.albums[0].art_sizes.len(), 2);
    }

    #[test]
    fn hidden_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("A")).unwrap();
        fs::write(root.join("A/01 t.flac"), b"x").unwrap();
        fs::write(root.join("A/._01 t.flac"), b"x").unwrap();

        let out = scan_library(root, &StubProber, 2).unwrap();
        assert_eq!(out.tracks_probed, 1);
    }

    #[test]
    fn album_ids_are_stable_across_scans() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("A")).unwrap();
        fs::write(root.join("A/01 t.flac"), b"x").unwrap();

        let first = scan_library(root, &StubProber, 2).unwrap();
        let second = scan_library(root, &StubProber, 2).unwrap();
        assert_eq!(first.albums[0].album_id, second.albums[0].album_id);
    }
}
