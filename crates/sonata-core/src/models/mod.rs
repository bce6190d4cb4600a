//! sonata data models.
//!
//! Sum types where the state machine needs them, plain records elsewhere.
//! Everything that crosses the FFI boundary is serde-serializable.

pub mod catalog;
pub mod media;
pub mod playback;

pub use catalog::{CatalogNode, CatalogState, EntityKind, Filter, NodeKind, Query, Row, SortKey};
pub use media::{format_duration, MediaMetadata};
pub use playback::{
    ErrorInfo, PlaybackSnapshot, PlaybackStateCode, PlayerEvent, PlayerState, TransportCommand,
};
