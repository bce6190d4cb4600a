//! Error taxonomy.
//!
//! Renderer and focus errors never escape the player: they are folded into
//! `PlayerState::Error` or logged. Catalog errors are returned to the caller.

use thiserror::Error;

/// Failure reported by a renderer, either synchronously from `prepare` or
/// asynchronously through its `Reporter`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendererError {
    #[error("Renderer: IO error")]
    Io,
    #[error("Renderer: media malformed")]
    Malformed,
    #[error("Renderer: media unsupported")]
    Unsupported,
    #[error("Renderer: timed out")]
    TimedOut,
    #[error("Renderer: server died")]
    ServerDied,
    #[error("Renderer: not valid for progressive playback")]
    NotValidForProgressive,
    /// The source could not be opened at all (bad path, bad scheme).
    #[error("{0}")]
    Source(String),
    #[error("Renderer: unknown error occurred")]
    Unknown(i32),
}

impl RendererError {
    /// Numeric code exposed through the playback snapshot.
    pub fn code(&self) -> i32 {
        match self {
            RendererError::Io => -1004,
            RendererError::Malformed => -1007,
            RendererError::Unsupported => -1010,
            RendererError::TimedOut => -110,
            RendererError::ServerDied => 100,
            RendererError::NotValidForProgressive => 200,
            RendererError::Source(_) => -1,
            RendererError::Unknown(code) => *code,
        }
    }
}

/// Failure from a catalog data provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed provider data: {0}")]
    Malformed(String),
}

/// Errors surfaced by catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Unknown Browse Id={0}")]
    UnknownBrowseId(String),
    #[error("malformed media item: {0}")]
    UnknownMediaItem(String),
    #[error("catalog failed to load")]
    NotLoaded,
    #[error("catalog load failed: {0}")]
    Load(#[from] ProviderError),
}

/// Audio focus could not be requested.
#[derive(Debug, Clone, Error)]
#[error("audio focus request failed: {0}")]
pub struct FocusError(pub String);

/// A transport command the orchestrator refuses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{0} is not supported")]
    Unsupported(&'static str),
}

/// Errors from the engine's inbound interface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("engine is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("engine config unreadable: {0}")]
    Io(#[from] std::io::Error),
}
