//! Browse-tree nodes and the data-provider row/query shapes.

use serde::{Deserialize, Serialize};

use super::media::MediaMetadata;

/// Load state of the catalog; drives the ready gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogState {
    #[default]
    Created,
    Initializing,
    Initialized,
    Error,
}

impl CatalogState {
    /// True once a load has finished, successfully or not.
    pub fn is_settled(self) -> bool {
        matches!(self, CatalogState::Initialized | CatalogState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Browsable,
    Playable { media_uri: String, duration_ms: u64 },
}

/// One entry of the browse tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogNode {
    pub id: String,
    pub title: String,
    pub subtitle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_uri: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl CatalogNode {
    pub fn browsable(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            subtitle: String::new(),
            description: None,
            icon_uri: None,
            kind: NodeKind::Browsable,
        }
    }

    pub fn is_browsable(&self) -> bool {
        matches!(self.kind, NodeKind::Browsable)
    }

    /// Metadata view of a playable node; `None` for browsable nodes.
    pub fn to_metadata(&self) -> Option<MediaMetadata> {
        match &self.kind {
            NodeKind::Browsable => None,
            NodeKind::Playable { media_uri, duration_ms } => Some(MediaMetadata {
                media_id: self.id.clone(),
                title: self.title.clone(),
                subtitle: self.subtitle.clone(),
                description: self.description.clone().unwrap_or_default(),
                art_uri: self.icon_uri.clone().unwrap_or_default(),
                media_uri: media_uri.clone(),
                duration_ms: *duration_ms,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Data provider contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Songs,
    Albums,
    Artists,
    Genres,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    /// Songs at least this long.
    MinDuration(u64),
    Album(String),
    Artist(String),
    Genre(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Title,
    Name,
    DateAdded,
}

/// Query shape handed to a data provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub kind: EntityKind,
    pub filter: Filter,
    pub sort: SortKey,
}

impl Query {
    pub fn new(kind: EntityKind, filter: Filter, sort: SortKey) -> Self {
        Self { kind, filter, sort }
    }
}

/// One result row. Every column may be missing; the catalog decides which
/// ones it requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub id: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub parent_group_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub media_uri: Option<String>,
    pub icon_uri: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playable_node_converts_to_metadata() {
        let node = CatalogNode {
            id: "42".into(),
            title: "Song".into(),
            subtitle: "Album".into(),
            description: Some("Artist".into()),
            icon_uri: None,
            kind: NodeKind::Playable {
                media_uri: "/music/song.flac".into(),
                duration_ms: 1234,
            },
        };
        let meta = node.to_metadata().unwrap();
        assert_eq!(meta.media_id, "42");
        assert_eq!(meta.description, "Artist");
        assert_eq!(meta.art_uri, "");
        assert_eq!(meta.duration_ms, 1234);
    }

    #[test]
    fn browsable_node_has_no_metadata() {
        let node = CatalogNode::browsable("/songs", "Songs");
        assert!(node.is_browsable());
        assert!(node.to_metadata().is_none());
    }

    #[test]
    fn node_json_flattens_kind() {
        let node = CatalogNode::browsable("/albums", "Albums");
        let v = serde_json::to_value(&node).unwrap();
        assert_eq!(v["kind"], "browsable");
        assert_eq!(v["id"], "/albums");
        assert!(v.get("icon_uri").is_none());
    }
}
