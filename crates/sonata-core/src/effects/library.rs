//! In-memory data provider over plain track records.
//!
//! Hosts either hand over a JSON array of [`TrackRecord`]s or let the
//! scanner build them. Albums, artists and genres are derived from the
//! track tags; their ids are stable hashes of the tag text.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::catalog::DataProvider;
use crate::error::ProviderError;
use crate::models::{EntityKind, Filter, Query, Row, SortKey};

/// One audio file known to the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    /// File path or `file://` URI handed to the renderer.
    pub path: String,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub date_added: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub art_uri: Option<String>,
}

impl TrackRecord {
    pub fn album_id(&self) -> Option<String> {
        tag(&self.album).map(group_id)
    }

    pub fn artist_id(&self) -> Option<String> {
        tag(&self.artist).map(group_id)
    }

    pub fn genre_id(&self) -> Option<String> {
        tag(&self.genre).map(group_id)
    }

    fn to_row(&self) -> Row {
        Row {
            id: Some(self.id.clone()),
            title: Some(self.title.clone()),
            subtitle: self.album.clone(),
            description: self.artist.clone(),
            parent_group_id: self.album_id(),
            duration_ms: Some(self.duration_ms),
            media_uri: Some(self.path.clone()),
            icon_uri: self.art_uri.clone(),
        }
    }
}

/// Non-blank tag text.
fn tag(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// FNV-1a over `bytes`. Same input, same hash, across runs and platforms.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Group id for an album, artist or genre name. Case-insensitive.
pub fn group_id(name: &str) -> String {
    format!("{:016x}", fnv1a(name.trim().to_lowercase().as_bytes()))
}

// ---------------------------------------------------------------------------
// LibraryProvider
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct LibraryProvider {
    tracks: RwLock<Vec<TrackRecord>>,
}

impl LibraryProvider {
    pub fn new(tracks: Vec<TrackRecord>) -> Self {
        Self { tracks: RwLock::new(tracks) }
    }

    pub fn from_json(json: &str) -> Result<Self, ProviderError> {
        Ok(Self::new(parse_tracks(json)?))
    }

    /// Replace the track list. Takes effect on the next catalog load.
    pub fn set_tracks(&self, tracks: Vec<TrackRecord>) {
        *self.tracks.write() = tracks;
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    fn songs(&self, filter: &Filter, sort: SortKey) -> Vec<Row> {
        let tracks = self.tracks.read();
        let mut matching: Vec<&TrackRecord> = tracks
            .iter()
            .filter(|t| match filter {
                Filter::All => true,
                Filter::MinDuration(min) => t.duration_ms >= *min,
                Filter::Album(id) => t.album_id().as_deref() == Some(id.as_str()),
                Filter::Artist(id) => t.artist_id().as_deref() == Some(id.as_str()),
                Filter::Genre(id) => t.genre_id().as_deref() == Some(id.as_str()),
            })
            .collect();
        match sort {
            SortKey::Title | SortKey::Name => {
                matching.sort_by_key(|t| t.title.to_lowercase());
            }
            SortKey::DateAdded => {
                matching.sort_by(|a, b| {
                    a.date_added
                        .cmp(&b.date_added)
                        .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
                });
            }
        }
        matching.into_iter().map(TrackRecord::to_row).collect()
    }

    /// One row per distinct tag value, first occurrence wins.
    fn groups(&self, pick: impl Fn(&TrackRecord) -> Option<&str>, with_details: bool) -> Vec<Row> {
        let tracks = self.tracks.read();
        let mut rows: Vec<Row> = Vec::new();
        for track in tracks.iter() {
            let Some(name) = pick(track) else { continue };
            let id = group_id(name);
            if rows.iter().any(|r| r.id.as_deref() == Some(id.as_str())) {
                continue;
            }
            let mut row = Row {
                id: Some(id),
                title: Some(name.to_string()),
                ..Row::default()
            };
            if with_details {
                row.subtitle = track.artist.clone();
                row.icon_uri = track.art_uri.clone();
            }
            rows.push(row);
        }
        rows.sort_by_key(|r| r.title.as_deref().unwrap_or_default().to_lowercase());
        rows
    }
}

impl DataProvider for LibraryProvider {
    fn query(&self, query: &Query) -> Result<Vec<Row>, ProviderError> {
        let rows = match query.kind {
            EntityKind::Songs => self.songs(&query.filter, query.sort),
            EntityKind::Albums => self.groups(|t| tag(&t.album), true),
            EntityKind::Artists => self.groups(|t| tag(&t.artist), false),
            EntityKind::Genres => self.groups(|t| tag(&t.genre), false),
        };
        Ok(rows)
    }
}

/// Parse a JSON array of track records.
pub fn parse_tracks(json: &str) -> Result<Vec<TrackRecord>, ProviderError> {
    serde_json::from_str(json).map_err(|e| ProviderError::Malformed(e.to_string()))
}
