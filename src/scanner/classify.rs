use crate::model::{AlbumFacts, ArtStatus, TagStatus, TrackFact};
use crate::resolve::Action;

/// Classification of one scanned album: the default conversion action plus
/// tag/art quality tri-states and the notes that explain them.
#[derive(Debug, Clone)]
pub struct Classification {
    pub default_action: Action,
    pub tag_status: TagStatus,
    pub art_status: ArtStatus,
    pub notes: Vec<String>,
}

/// Classify an album from its aggregated facts. Pure, no side effects.
pub fn classify(facts: &AlbumFacts, art_min_size: u32) -> Classification {
    let default_action = default_action(facts);
    let (tag_status, mut notes) = tag_status(&facts.tracks);
    let (art_status, art_notes) = art_status(facts, art_min_size);
    notes.extend(art_notes);

    Classification {
        default_action,
        tag_status,
        art_status,
        notes,
    }
}

/// Default action decision table, evaluated in order:
/// 1. All tracks already device-native lossy (MP3) → passthrough.
/// 2. Any lossless source → preserve (downconverts at build time if the
///    source exceeds the ceiling).
/// 3. Other lossy formats → re-encode to the device codec.
pub fn default_action(facts: &AlbumFacts) -> Action {
    if facts.source_formats.is_empty() {
        return Action::Skip;
    }
    if facts.is_mp3_only() {
        return Action::Passthrough;
    }
    if facts.has_lossless() {
        return Action::Preserve;
    }
    Action::LossyReencode
}

/// Tag quality: RED when identity fields (title, album, track number) are
/// missing or numbering is inconsistent; YELLOW when only the year is
/// missing or inconsistent; GREEN otherwise.
pub fn tag_status(tracks: &[TrackFact]) -> (TagStatus, Vec<String>) {
    let mut notes = Vec::new();

    if tracks.is_empty() {
        return (TagStatus::Red, vec!["No tracks found".to_string()]);
    }

    let missing_title = tracks.iter().filter(|t| t.title.is_none()).count();
    let missing_album = tracks.iter().filter(|t| t.album.is_none()).count();
    let missing_track_no = tracks.iter().filter(|t| t.track_number.is_none()).count();

    if missing_title > 0 {
        notes.push(format!("{missing_title} tracks missing title"));
    }
    if missing_album > 0 {
        notes.push(format!("{missing_album} tracks missing album"));
    }
    if missing_track_no > 0 {
        notes.push(format!("{missing_track_no} tracks missing track number"));
    }
    if missing_title > 0 || missing_album > 0 || missing_track_no > 0 {
        return (TagStatus::Red, notes);
    }

    let album_names: std::collections::BTreeSet<&str> = tracks
        .iter()
        .filter_map(|t| t.album.as_deref())
        .collect();
    if album_names.len() > 1 {
        notes.push(format!("Inconsistent album names: {album_names:?}"));
        return (TagStatus::Red, notes);
    }

    // Duplicate track numbers within a disc mean the numbering is broken
    let mut seen = std::collections::BTreeSet::new();
    for t in tracks {
        let key = (t.disc_number.unwrap_or(1), t.track_number.unwrap_or(0));
        if !seen.insert(key) {
            notes.push("Duplicate track numbers".to_string());
            return (TagStatus::Red, notes);
        }
    }

    let years: std::collections::BTreeSet<i32> =
        tracks.iter().filter_map(|t| t.year).collect();
    if years.is_empty() {
        notes.push("Missing year".to_string());
        return (TagStatus::Yellow, notes);
    }
    if years.len() > 1 {
        notes.push(format!("Inconsistent years: {years:?}"));
        return (TagStatus::Yellow, notes);
    }

    (TagStatus::Green, notes)
}

/// Artwork quality: RED with no candidate at all; YELLOW when candidates
/// are ambiguous (multiple differing folder images) or below the minimum
/// resolution; GREEN for exactly one unambiguous candidate meeting it.
pub fn art_status(facts: &AlbumFacts, min_size: u32) -> (ArtStatus, Vec<String>) {
    let mut notes = Vec::new();

    let has_embedded = facts.tracks.iter().any(|t| t.has_embedded_art);
    let embedded_meets_threshold = facts.tracks.iter().any(|t| {
        matches!(
            (t.embedded_art_width, t.embedded_art_height),
            (Some(w), Some(h)) if w >= min_size && h >= min_size
        )
    });

    if !has_embedded && facts.art_candidates.is_empty() {
        return (ArtStatus::Red, vec!["No artwork found".to_string()]);
    }

    if facts.art_candidates.len() > 1 {
        let names: Vec<String> = facts
            .art_candidates
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        notes.push(format!("Multiple folder images: {}", names.join(", ")));
        return (ArtStatus::Yellow, notes);
    }

    let folder_meets_threshold = facts
        .art_sizes
        .iter()
        .any(|(w, h)| *w >= min_size && *h >= min_size);

    if embedded_meets_threshold || folder_meets_threshold {
        return (ArtStatus::Green, notes);
    }

    if has_embedded {
        notes.push(format!("Embedded art below {min_size}x{min_size}"));
    }
    if !facts.art_candidates.is_empty() {
        notes.push(format!("Folder art below {min_size}x{min_size}"));
    }
    (ArtStatus::Yellow, notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AudioFormat;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn fact(n: u32) -> TrackFact {
        TrackFact {
            path: PathBuf::from(format!("/music/a/alb/{n:02} t.flac")),
            format: AudioFormat::Flac,
            sample_rate_hz: 44_100,
            bit_depth: Some(16),
            channels: 2,
            duration_seconds: 200.0,
            title: Some(format!("Track {n}")),
            artist: Some("A".into()),
            album: Some("Alb".into()),
            album_artist: None,
            track_number: Some(n),
            track_total: Some(10),
            disc_number: None,
            disc_total: None,
            year: Some(1977),
            compilation: false,
            has_embedded_art: false,
            embedded_art_width: None,
            embedded_art_height: None,
            size_bytes: 1000,
            mtime_unix: 0,
        }
    }

    fn album(formats: &[AudioFormat], tracks: Vec<TrackFact>) -> AlbumFacts {
        AlbumFacts {
            album_id: "0123456789abcdef".into(),
            source_path: PathBuf::from("/music/a/alb"),
            tracks,
            artist: "A".into(),
            album: "Alb".into(),
            album_artist: None,
            year: Some(1977),
            is_compilation: false,
            art_candidates: vec![],
            art_sizes: vec![],
            max_sample_rate_hz: 44_100,
            max_bit_depth: Some(16),
            source_formats: formats.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn mp3_only_is_passthrough() {
        let a = album(&[AudioFormat::Mp3], vec![fact(1)]);
        assert_eq!(default_action(&a), Action::Passthrough);
    }

    #[test]
    fn any_lossless_is_preserve() {
        let a = album(&[AudioFormat::Flac, AudioFormat::Mp3], vec![fact(1)]);
        assert_eq!(default_action(&a), Action::Preserve);
        let b = album(&[AudioFormat::Shn], vec![fact(1)]);
        assert_eq!(default_action(&b), Action::Preserve);
    }

    #[test]
    fn lossy_non_mp3_is_reencode() {
        let a = album(&[AudioFormat::Ogg], vec![fact(1)]);
        assert_eq!(default_action(&a), Action::LossyReencode);
        let b = album(&[AudioFormat::Ogg, AudioFormat::Mp3], vec![fact(1)]);
        assert_eq!(default_action(&b), Action::LossyReencode);
    }

    #[test]
    fn empty_album_is_skip() {
        let a = album(&[], vec![]);
        assert_eq!(default_action(&a), Action::Skip);
    }

    #[test]
    fn complete_tags_are_green() {
        let (status, notes) = tag_status(&[fact(1), fact(2)]);
        assert_eq!(status, TagStatus::Green);
        assert!(notes.is_empty());
    }

    #[test]
    fn missing_title_is_red() {
        let mut t = fact(1);
        t.title = None;
        let (status, _) = tag_status(&[t, fact(2)]);
        assert_eq!(status, TagStatus::Red);
    }

    #[test]
    fn missing_track_number_is_red() {
        let mut t = fact(1);
        t.track_number = None;
        let (status, _) = tag_status(&[t]);
        assert_eq!(status, TagStatus::Red);
    }

    #[test]
    fn duplicate_track_numbers_are_red() {
        let mut t = fact(2);
        t.track_number = Some(1);
        let (status, notes) = tag_status(&[fact(1), t]);
        assert_eq!(status, TagStatus::Red);
        assert!(notes.iter().any(|n| n.contains("Duplicate")));
    }

    #[test]
    fn same_number_on_different_discs_is_fine() {
        let mut t = fact(2);
        t.track_number = Some(1);
        t.disc_number = Some(2);
        let (status, _) = tag_status(&[fact(1), t]);
        assert_eq!(status, TagStatus::Green);
    }

    #[test]
    fn missing_year_is_yellow() {
        let mut a = fact(1);
        let mut b = fact(2);
        a.year = None;
        b.year = None;
        let (status, notes) = tag_status(&[a, b]);
        assert_eq!(status, TagStatus::Yellow);
        assert!(notes.iter().any(|n| n.contains("year")));
    }

    #[test]
    fn inconsistent_years_are_yellow() {
        let mut b = fact(2);
        b.year = Some(1978);
        let (status, _) = tag_status(&[fact(1), b]);
        assert_eq!(status, TagStatus::Yellow);
    }

    #[test]
    fn inconsistent_album_names_are_red() {
        let mut b = fact(2);
        b.album = Some("Other".into());
        let (status, _) = tag_status(&[fact(1), b]);
        assert_eq!(status, TagStatus::Red);
    }

    #[test]
    fn no_art_is_red() {
        let a = album(&[AudioFormat::Flac], vec![fact(1)]);
        let (status, _) = art_status(&a, 300);
        assert_eq!(status, ArtStatus::Red);
    }

    #[test]
    fn single_large_folder_art_is_green() {
        let mut a = album(&[AudioFormat::Flac], vec![fact(1)]);
        a.art_candidates = vec![PathBuf::from("/music/a/alb/cover.jpg")];
        a.art_sizes = vec![(600, 600)];
        let (status, _) = art_status(&a, 300);
        assert_eq!(status, ArtStatus::Green);
    }

    #[test]
    fn multiple_folder_images_are_ambiguous() {
        let mut a = album(&[AudioFormat::Flac], vec![fact(1)]);
        a.art_candidates = vec![
            PathBuf::from("/music/a/alb/cover.jpg"),
            PathBuf::from("/music/a/alb/folder.png"),
        ];
        a.art_sizes = vec![(600, 600), (1200, 1200)];
        let (status, notes) = art_status(&a, 300);
        assert_eq!(status, ArtStatus::Yellow);
        assert!(notes.iter().any(|n| n.contains("Multiple")));
    }

    #[test]
    fn small_art_is_yellow() {
        let mut a = album(&[AudioFormat::Flac], vec![fact(1)]);
        a.art_candidates = vec![PathBuf::from("/music/a/alb/cover.jpg")];
        a.art_sizes = vec![(150, 150)];
        let (status, _) = art_status(&a, 300);
        assert_eq!(status, ArtStatus::Yellow);
    }

    #[test]
    fn large_embedded_art_is_green() {
        let mut t = fact(1);
        t.has_embedded_art = true;
        t.embedded_art_width = Some(500);
        t.embedded_art_height = Some(500);
        let a = album(&[AudioFormat::Flac], vec![t]);
        let (status, _) = art_status(&a, 300);
        assert_eq!(status, ArtStatus::Green);
    }

    #[test]
    fn tag_and_art_statuses_stay_independent() {
        // Broken tags with perfect art: neither degrades the other
        let mut t = fact(1);
        t.title = None;
        t.has_embedded_art = true;
        t.embedded_art_width = Some(500);
        t.embedded_art_height = Some(500);
        let a = album(&[AudioFormat::Flac], vec![t]);
        let c = classify(&a, 300);
        assert_eq!(c.tag_status, TagStatus::Red);
        assert_eq!(c.art_status, ArtStatus::Green);
    }
}
