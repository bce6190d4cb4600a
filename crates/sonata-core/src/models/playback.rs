//! Player states, the canonical playback snapshot, transport commands and
//! outbound events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::media::MediaMetadata;

/// State of the player state machine.
///
/// Only `Error` carries a payload; the code and message cannot outlive the
/// error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlayerState {
    Initialized,
    Preparing,
    Prepared,
    Playing,
    Buffering,
    Paused,
    Ended,
    Stopped,
    Error { code: i32, message: String },
}

impl PlayerState {
    /// Session-facing code for this state.
    pub fn code(&self) -> PlaybackStateCode {
        match self {
            PlayerState::Initialized => PlaybackStateCode::None,
            PlayerState::Preparing => PlaybackStateCode::Connecting,
            PlayerState::Prepared => PlaybackStateCode::Paused,
            PlayerState::Playing => PlaybackStateCode::Playing,
            PlayerState::Buffering => PlaybackStateCode::Buffering,
            PlayerState::Ended | PlayerState::Paused => PlaybackStateCode::Paused,
            PlayerState::Stopped => PlaybackStateCode::Stopped,
            PlayerState::Error { .. } => PlaybackStateCode::Error,
        }
    }

    pub fn error_info(&self) -> Option<ErrorInfo> {
        match self {
            PlayerState::Error { code, message } => Some(ErrorInfo {
                code: *code,
                message: message.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PlayerState::Error { .. })
    }
}

/// Playback state as published to the session and notification layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStateCode {
    #[default]
    None,
    Connecting,
    Paused,
    Playing,
    Buffering,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: String,
}

/// The canonical playback state broadcast to every listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub state: PlaybackStateCode,
    pub position_ms: i64,
    pub speed: f32,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl PlaybackSnapshot {
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackStateCode::Playing
    }
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            state: PlaybackStateCode::None,
            position_ms: 0,
            speed: 0.0,
            timestamp_ms: 0,
            media_id: None,
            error: None,
        }
    }
}

/// Inbound transport command from the session/UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransportCommand {
    Play,
    Pause,
    Stop,
    PrepareFromId { id: String },
    PlayFromId { id: String },
    SeekTo { position_ms: u64 },
    SkipToNext,
    SkipToPrevious,
}

impl TransportCommand {
    pub fn from_value(v: &Value) -> Option<Self> {
        serde_json::from_value(v.clone()).ok()
    }
}

/// Outbound event for the session/notification layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// Playback is about to start; hosts promote their service to foreground.
    StartingPlayback,
    MetadataChanged(MediaMetadata),
    PlaybackStateChanged(PlaybackSnapshot),
    /// Interpolated position from the position clock.
    Position(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_follow_session_mapping() {
        assert_eq!(PlayerState::Initialized.code(), PlaybackStateCode::None);
        assert_eq!(PlayerState::Preparing.code(), PlaybackStateCode::Connecting);
        assert_eq!(PlayerState::Prepared.code(), PlaybackStateCode::Paused);
        assert_eq!(PlayerState::Ended.code(), PlaybackStateCode::Paused);
        assert_eq!(PlayerState::Stopped.code(), PlaybackStateCode::Stopped);
        let err = PlayerState::Error {
            code: -1004,
            message: "Renderer: IO error".into(),
        };
        assert_eq!(err.code(), PlaybackStateCode::Error);
        assert_eq!(err.error_info().map(|e| e.code), Some(-1004));
        assert!(PlayerState::Playing.error_info().is_none());
    }

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd = TransportCommand::from_value(&serde_json::json!({
            "action": "play_from_id",
            "id": "42"
        }));
        assert_eq!(cmd, Some(TransportCommand::PlayFromId { id: "42".into() }));

        let seek = TransportCommand::from_value(&serde_json::json!({
            "action": "seek_to",
            "position_ms": 1500
        }));
        assert_eq!(seek, Some(TransportCommand::SeekTo { position_ms: 1500 }));

        assert!(TransportCommand::from_value(&serde_json::json!({"action": "rewind"})).is_none());
    }

    #[test]
    fn snapshot_json_omits_absent_fields() {
        let snap = PlaybackSnapshot {
            state: PlaybackStateCode::Playing,
            position_ms: 10,
            speed: 1.0,
            timestamp_ms: 99,
            media_id: None,
            error: None,
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["state"], "playing");
        assert!(v.get("media_id").is_none());
        assert!(v.get("error").is_none());
    }
}
