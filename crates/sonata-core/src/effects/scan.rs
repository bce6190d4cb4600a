//! Scan effect: walk directories, read tags, produce track records.

use std::path::Path;
use std::time::UNIX_EPOCH;

use lofty::prelude::*;
use lofty::probe::Probe;

use super::library::{fnv1a, TrackRecord};

/// Audio extensions the renderer can decode.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "wav", "alac"];

const MAX_SCAN_DEPTH: usize = 32;

/// Scan `dir` recursively. Unreadable entries are skipped.
pub fn scan_directory(dir: &Path) -> Vec<TrackRecord> {
    let mut out = Vec::new();
    scan_inner(dir, 0, &mut out);
    out
}

fn scan_inner(dir: &Path, depth: usize, out: &mut Vec<TrackRecord>) {
    if depth > MAX_SCAN_DEPTH {
        log::warn!("sonata: scan depth limit reached at {}", dir.display());
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("sonata: cannot read {}: {}", dir.display(), e);
            return;
        }
    };

    let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        // Symlinked directories can loop.
        let is_symlink = std::fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if path.is_dir() {
            if !is_symlink {
                scan_inner(&path, depth + 1, out);
            }
        } else if path.is_file() {
            if let Some(track) = read_track(&path) {
                out.push(track);
            }
        }
    }
}

/// Build a record for one file; `None` if it is not audio.
pub fn read_track(path: &Path) -> Option<TrackRecord> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    if !AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let path_text = path.to_str()?;
    let filename = path.file_name()?.to_str()?;
    let fallback_title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown")
        .to_string();

    let mut track = TrackRecord {
        id: stable_id(path_text, filename),
        title: fallback_title,
        artist: None,
        album: None,
        genre: None,
        duration_ms: 0,
        path: path_text.to_string(),
        date_added: modified_secs(path),
        art_uri: None,
    };

    match Probe::open(path).and_then(|p| p.read()) {
        Ok(tagged) => {
            if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
                if let Some(title) = tag.title() {
                    track.title = title.to_string();
                }
                track.artist = tag.artist().map(|s| s.to_string());
                track.album = tag.album().map(|s| s.to_string());
                track.genre = tag.genre().map(|s| s.to_string());
            }
            track.duration_ms = tagged.properties().duration().as_millis() as u64;
        }
        Err(e) => log::debug!("sonata: no tags in {}: {}", path.display(), e),
    }
    if track.album.is_some() {
        track.art_uri = track.album_id().map(|id| crate::paths::album_art_uri(&id));
    }
    Some(track)
}

fn modified_secs(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stable id from the file path: same file, same id across scans.
pub fn stable_id(file_path: &str, filename: &str) -> String {
    format!("{}_{:016x}", sanitize_id(filename), fnv1a(file_path.as_bytes()))
}

fn sanitize_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
