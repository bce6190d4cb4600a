//! Now-playing metadata.

use serde::{Deserialize, Serialize};

/// Metadata for a playable item, handed to "now playing" consumers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub media_id: String,
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub art_uri: String,
    pub media_uri: String,
    pub duration_ms: u64,
}

/// `m:ss` rendering of a millisecond duration. Minutes are not wrapped into
/// hours.
pub fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}
