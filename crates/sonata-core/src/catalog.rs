//! Catalog: the browse tree built from a data provider, plus the ready gate.
//!
//! The tree is rebuilt wholesale on every load and swapped in as a single
//! `Arc`, so readers never see a half-built tree. Queries issued before the
//! first load settles are parked on the ready gate and answered exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::error::{CatalogError, ProviderError};
use crate::models::{
    CatalogNode, CatalogState, EntityKind, Filter, MediaMetadata, NodeKind, Query, Row, SortKey,
};
use crate::paths;

/// Source of catalog rows (the platform's content query layer).
pub trait DataProvider: Send + Sync {
    fn query(&self, query: &Query) -> Result<Vec<Row>, ProviderError>;
}

/// Ready-gate callback; receives `true` if the catalog loaded.
pub type ReadyFn = Box<dyn FnOnce(bool) + Send>;

pub const SONGS_TITLE: &str = "Songs";
pub const ALBUMS_TITLE: &str = "Albums";
pub const ARTISTS_TITLE: &str = "Artists";
pub const GENRES_TITLE: &str = "Genres";

/// "1 song" / "N songs".
pub fn song_count_label(count: usize) -> String {
    if count == 1 {
        "1 song".to_string()
    } else {
        format!("{} songs", count)
    }
}

#[derive(Default)]
struct Tree {
    children: HashMap<String, Vec<CatalogNode>>,
    playable: HashMap<String, CatalogNode>,
}

struct Gate {
    state: CatalogState,
    queue: VecDeque<ReadyFn>,
    flushing: bool,
}

pub struct Catalog {
    provider: Arc<dyn DataProvider>,
    min_song_duration_ms: u64,
    tree: RwLock<Arc<Tree>>,
    gate: Mutex<Gate>,
    /// Held for the whole of a load so loads never interleave.
    loading: Mutex<()>,
}

impl Catalog {
    pub fn new(provider: Arc<dyn DataProvider>, min_song_duration_ms: u64) -> Self {
        Self {
            provider,
            min_song_duration_ms,
            tree: RwLock::new(Arc::new(Tree::default())),
            gate: Mutex::new(Gate {
                state: CatalogState::Created,
                queue: VecDeque::new(),
                flushing: false,
            }),
            loading: Mutex::new(()),
        }
    }

    pub fn state(&self) -> CatalogState {
        self.gate.lock().state
    }

    pub fn root_id(&self) -> &'static str {
        paths::ROOT_ID
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Load on a background thread. The handle yields the settled state.
    pub fn load(self: &Arc<Self>) -> JoinHandle<CatalogState> {
        let catalog = Arc::clone(self);
        std::thread::spawn(move || catalog.load_blocking())
    }

    /// Build the tree on the calling thread.
    ///
    /// Ready-gate callbacks run on this thread before it returns. They must
    /// not call `load_blocking` themselves.
    pub fn load_blocking(&self) -> CatalogState {
        let _serial = self.loading.lock();
        self.set_state(CatalogState::Initializing);

        let settled = match self.build() {
            Ok(tree) => {
                log::info!(
                    "sonata: catalog loaded, {} playable items",
                    tree.playable.len()
                );
                *self.tree.write() = Arc::new(tree);
                CatalogState::Initialized
            }
            Err(e) => {
                log::warn!("sonata: catalog load failed: {}", e);
                *self.tree.write() = Arc::new(Tree::default());
                CatalogState::Error
            }
        };
        self.set_state(settled);
        settled
    }

    fn build(&self) -> Result<Tree, ProviderError> {
        let mut tree = Tree::default();
        tree.children.insert(
            paths::ROOT_ID.to_string(),
            vec![
                CatalogNode::browsable(paths::SONGS_ROOT_ID, SONGS_TITLE),
                CatalogNode::browsable(paths::ALBUMS_ROOT_ID, ALBUMS_TITLE),
                CatalogNode::browsable(paths::ARTISTS_ROOT_ID, ARTISTS_TITLE),
                CatalogNode::browsable(paths::GENRES_ROOT_ID, GENRES_TITLE),
            ],
        );

        let songs = self.songs(
            Filter::MinDuration(self.min_song_duration_ms),
            SortKey::Title,
            &mut tree,
        )?;
        tree.children.insert(paths::SONGS_ROOT_ID.to_string(), songs);

        // Albums
        let mut albums = Vec::new();
        for row in self.query(EntityKind::Albums, Filter::All, SortKey::Name)? {
            let Some(album_id) = non_blank(&row.id) else {
                log::warn!("sonata: {}", CatalogError::UnknownMediaItem("album without id".into()));
                continue;
            };
            let id = paths::album_path(album_id);
            let songs = self.songs(Filter::Album(album_id.to_string()), SortKey::DateAdded, &mut tree)?;
            albums.push(CatalogNode {
                id: id.clone(),
                title: row.title.clone().unwrap_or_default(),
                subtitle: row.subtitle.clone().unwrap_or_default(),
                description: None,
                icon_uri: Some(
                    row.icon_uri
                        .clone()
                        .unwrap_or_else(|| paths::album_art_uri(album_id)),
                ),
                kind: NodeKind::Browsable,
            });
            tree.children.insert(id, songs);
        }
        log::debug!("sonata: albums={}", albums.len());
        tree.children.insert(paths::ALBUMS_ROOT_ID.to_string(), albums);

        // Artists
        let mut artists = Vec::new();
        for row in self.query(EntityKind::Artists, Filter::All, SortKey::Name)? {
            let Some(artist_id) = non_blank(&row.id) else {
                log::warn!("sonata: {}", CatalogError::UnknownMediaItem("artist without id".into()));
                continue;
            };
            let id = paths::artist_path(artist_id);
            let songs = self.songs(Filter::Artist(artist_id.to_string()), SortKey::DateAdded, &mut tree)?;
            artists.push(CatalogNode {
                id: id.clone(),
                title: row.title.clone().unwrap_or_default(),
                subtitle: song_count_label(songs.len()),
                description: None,
                icon_uri: songs.first().and_then(|s| s.icon_uri.clone()),
                kind: NodeKind::Browsable,
            });
            tree.children.insert(id, songs);
        }
        log::debug!("sonata: artists={}", artists.len());
        tree.children.insert(paths::ARTISTS_ROOT_ID.to_string(), artists);

        // Genres; id and name may both be missing.
        let mut genres = Vec::new();
        for row in self.query(EntityKind::Genres, Filter::All, SortKey::Name)? {
            let (Some(genre_id), Some(name)) = (non_blank(&row.id), non_blank(&row.title)) else {
                continue;
            };
            let id = paths::genre_path(genre_id);
            let songs = self.songs(Filter::Genre(genre_id.to_string()), SortKey::Title, &mut tree)?;
            genres.push(CatalogNode {
                id: id.clone(),
                title: name.to_string(),
                subtitle: song_count_label(songs.len()),
                description: None,
                icon_uri: Some(paths::GENRE_ICON_URI.to_string()),
                kind: NodeKind::Browsable,
            });
            tree.children.insert(id, songs);
        }
        log::debug!("sonata: genres={}", genres.len());
        tree.children.insert(paths::GENRES_ROOT_ID.to_string(), genres);

        Ok(tree)
    }

    fn query(&self, kind: EntityKind, filter: Filter, sort: SortKey) -> Result<Vec<Row>, ProviderError> {
        self.provider.query(&Query::new(kind, filter, sort))
    }

    /// Query songs and turn them into playable nodes, indexing each one.
    fn songs(&self, filter: Filter, sort: SortKey, tree: &mut Tree) -> Result<Vec<CatalogNode>, ProviderError> {
        let rows = self.query(EntityKind::Songs, filter, sort)?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            match playable_node(row) {
                Ok(node) => {
                    tree.playable.insert(node.id.clone(), node.clone());
                    nodes.push(node);
                }
                Err(e) => log::warn!("sonata: skipping row: {}", e),
            }
        }
        Ok(nodes)
    }

    // -----------------------------------------------------------------------
    // Ready gate
    // -----------------------------------------------------------------------

    /// Run `callback(loaded)` now if the catalog has settled (returns `true`),
    /// otherwise park it until the load settles (returns `false`).
    pub fn when_ready(&self, callback: impl FnOnce(bool) + Send + 'static) -> bool {
        let mut gate = self.gate.lock();
        if gate.flushing || !gate.state.is_settled() {
            gate.queue.push_back(Box::new(callback));
            return false;
        }
        let loaded = gate.state == CatalogState::Initialized;
        drop(gate);
        callback(loaded);
        true
    }

    fn set_state(&self, state: CatalogState) {
        let mut gate = self.gate.lock();
        gate.state = state;
        if !state.is_settled() || gate.flushing {
            return;
        }
        gate.flushing = true;
        loop {
            if !gate.state.is_settled() {
                break;
            }
            let Some(callback) = gate.queue.pop_front() else { break };
            let loaded = gate.state == CatalogState::Initialized;
            // Callbacks may re-enter the catalog.
            drop(gate);
            callback(loaded);
            gate = self.gate.lock();
        }
        gate.flushing = false;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn children(&self, browse_id: &str) -> Result<Vec<CatalogNode>, CatalogError> {
        let tree = Arc::clone(&self.tree.read());
        tree.children
            .get(browse_id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownBrowseId(browse_id.to_string()))
    }

    pub fn find_by_id(&self, media_id: &str) -> Option<MediaMetadata> {
        let tree = Arc::clone(&self.tree.read());
        tree.playable.get(media_id).and_then(CatalogNode::to_metadata)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

fn playable_node(row: Row) -> Result<CatalogNode, CatalogError> {
    let id = non_blank(&row.id)
        .ok_or_else(|| CatalogError::UnknownMediaItem("song without id".into()))?
        .to_string();
    let media_uri = non_blank(&row.media_uri)
        .ok_or_else(|| CatalogError::UnknownMediaItem(format!("song {} without uri", id)))?
        .to_string();
    let icon_uri = row
        .icon_uri
        .or_else(|| row.parent_group_id.as_deref().map(paths::album_art_uri));
    Ok(CatalogNode {
        id,
        title: row.title.unwrap_or_default(),
        subtitle: row.subtitle.unwrap_or_default(),
        description: row.description,
        icon_uri,
        kind: NodeKind::Playable {
            media_uri,
            duration_ms: row.duration_ms.unwrap_or(0),
        },
    })
}
