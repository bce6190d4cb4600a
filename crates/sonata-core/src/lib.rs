//! sonata-core: playback orchestration for a background audio player.
//!
//! Transport commands go in, playback snapshots come out. Interruptions
//! (other apps taking audio focus, headphones unplugged) are arbitrated on
//! the way, and a position clock keeps the UI's estimate moving between
//! updates.
//!
//! # Architecture
//!
//! ```text
//! Engine (timeline thread)
//!   ├─ PlaybackOrchestrator ── AudioFocusArbiter ── PlayerStateMachine ── Renderer
//!   │          └─ Catalog (browse tree, ready gate) ── DataProvider
//!   └─ PositionClock ── Position events
//! ```

pub mod catalog;
pub mod clock;
pub mod config;
pub mod effects;
pub mod engine;
pub mod error;
pub mod focus;
pub mod models;
pub mod paths;
pub mod player;
pub mod session;

pub use catalog::{Catalog, DataProvider};
pub use clock::{ManualTime, PositionClock, TimeSource, WallClock};
pub use config::EngineConfig;
pub use engine::{ChildrenResult, Engine};
pub use error::{CatalogError, CommandError, ConfigError, EngineError, FocusError, ProviderError, RendererError};
pub use focus::{AudioFocusArbiter, FocusChange};
pub use models::*;
pub use player::PlayerStateMachine;
pub use session::{PlaybackOrchestrator, SessionParts};
