//! Browse-tree id conventions.
//!
//! Browsable nodes have path-like ids; playable leaves keep the provider's
//! row id. Pure functions only.

// ---------------------------------------------------------------------------
// Roots
// ---------------------------------------------------------------------------

pub const ROOT_ID: &str = "/";
pub const SONGS_ROOT_ID: &str = "/songs";
pub const ALBUMS_ROOT_ID: &str = "/albums";
pub const ARTISTS_ROOT_ID: &str = "/artists";
pub const GENRES_ROOT_ID: &str = "/genres";

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

pub fn album_path(album_id: &str) -> String {
    format!("{}/{}", ALBUMS_ROOT_ID, album_id)
}

pub fn artist_path(artist_id: &str) -> String {
    format!("{}/{}", ARTISTS_ROOT_ID, artist_id)
}

pub fn genre_path(genre_id: &str) -> String {
    format!("{}/{}", GENRES_ROOT_ID, genre_id)
}

// ---------------------------------------------------------------------------
// Icons
// ---------------------------------------------------------------------------

/// Icon shown for every genre node.
pub const GENRE_ICON_URI: &str = "sonata://icons/music_note";

/// Album art locator for a provider album id.
pub fn album_art_uri(album_id: &str) -> String {
    format!("sonata://albumart/{}", album_id)
}

/// True for ids of browsable nodes (as opposed to playable leaves).
pub fn is_browse_id(id: &str) -> bool {
    id.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_paths_nest_under_their_root() {
        assert_eq!(album_path("12"), "/albums/12");
        assert_eq!(artist_path("7"), "/artists/7");
        assert_eq!(genre_path("3"), "/genres/3");
    }

    #[test]
    fn leaves_are_not_browse_ids() {
        assert!(is_browse_id(SONGS_ROOT_ID));
        assert!(is_browse_id(ROOT_ID));
        assert!(!is_browse_id("song_0001"));
    }
}
