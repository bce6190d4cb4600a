//! Audio focus arbitration.
//!
//! Turns play/pause requests into focus requests and focus changes into
//! play-when-ready decisions on the player.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::effects::{AudioFocus, FocusGrant};
use crate::models::PlayerState;
use crate::player::PlayerStateMachine;

/// Focus change delivered by the platform after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusChange {
    Gain,
    Loss,
    LossTransient,
    LossTransientCanDuck,
}

impl FocusChange {
    /// Numeric codes as used by mobile audio managers.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(FocusChange::Gain),
            -1 => Some(FocusChange::Loss),
            -2 => Some(FocusChange::LossTransient),
            -3 => Some(FocusChange::LossTransientCanDuck),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            FocusChange::Gain => 1,
            FocusChange::Loss => -1,
            FocusChange::LossTransient => -2,
            FocusChange::LossTransientCanDuck => -3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FocusState {
    pub granted: bool,
    /// A delayed grant is pending; playback starts on `Gain`.
    pub delayed: bool,
    /// Playback was interrupted by a transient loss and resumes on `Gain`.
    pub resume_on_regain: bool,
}

pub struct AudioFocusArbiter {
    focus: Arc<dyn AudioFocus>,
    state: FocusState,
}

impl AudioFocusArbiter {
    pub fn new(focus: Arc<dyn AudioFocus>) -> Self {
        Self { focus, state: FocusState::default() }
    }

    pub fn state(&self) -> FocusState {
        self.state
    }

    /// Ask for focus and start playback if granted.
    ///
    /// No-op while a delayed grant is pending, or when the player already
    /// wants playback and is not sitting in `Stopped`/`Ended`.
    pub fn request_play(&mut self, player: &mut PlayerStateMachine) {
        let idle = matches!(player.state(), PlayerState::Stopped | PlayerState::Ended);
        if self.state.delayed || (player.play_when_ready() && !idle) {
            log::debug!("sonata: play request absorbed (delayed={})", self.state.delayed);
            return;
        }
        match self.focus.request() {
            Ok(FocusGrant::Granted) => {
                self.state.delayed = false;
                self.state.granted = true;
                player.set_play_when_ready(true);
            }
            Ok(FocusGrant::Delayed) => {
                log::info!("sonata: audio focus delayed");
                self.state.delayed = true;
            }
            Ok(FocusGrant::Denied) => {
                log::info!("sonata: audio focus denied");
                self.state.delayed = false;
            }
            Err(e) => {
                log::warn!("sonata: {}", e);
                self.state.delayed = false;
            }
        }
    }

    pub fn request_pause_or_stop(&mut self, player: &mut PlayerStateMachine, stop: bool) {
        self.state.delayed = false;
        if stop {
            player.stop();
        } else {
            player.set_play_when_ready(false);
        }
        self.focus.abandon();
        self.state.granted = false;
    }

    pub fn on_focus_change(&mut self, change: FocusChange, player: &mut PlayerStateMachine) {
        match change {
            FocusChange::Gain => {
                if self.state.resume_on_regain || self.state.delayed {
                    self.state.resume_on_regain = false;
                    self.state.delayed = false;
                    self.state.granted = true;
                    player.set_play_when_ready(true);
                }
            }
            FocusChange::Loss => {
                self.state = FocusState::default();
                player.set_play_when_ready(false);
            }
            FocusChange::LossTransient => {
                self.state.resume_on_regain = player.play_when_ready();
                player.set_play_when_ready(false);
            }
            FocusChange::LossTransientCanDuck => {
                log::debug!("sonata: focus loss (can duck), playback continues");
            }
        }
    }
}
