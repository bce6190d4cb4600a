//! Player state machine over one renderer.
//!
//! Every operation is callable from any state. Calls that make no sense in
//! the current state are absorbed; renderer failures become
//! `PlayerState::Error`. Nothing here panics.

use std::sync::Arc;

use crate::effects::{EventDispatch, Renderer, RendererEvent, Reporter};
use crate::models::PlayerState;

/// What the listener sees on every state mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: PlayerState,
    /// Seek position at the moment of the change.
    pub position_ms: u64,
}

pub type StateListener = Box<dyn FnMut(StateChange) + Send>;

pub struct PlayerStateMachine {
    renderer: Arc<dyn Renderer>,
    dispatch: EventDispatch,
    state: PlayerState,
    play_when_ready: bool,
    /// Last prepared source; re-prepared when playing from `Stopped`.
    uri: Option<String>,
    /// Bumped by prepare, reset, stop and release.
    generation: u64,
    released: bool,
    listener: Option<StateListener>,
}

impl PlayerStateMachine {
    /// `dispatch` receives renderer events tagged with their generation. It
    /// must queue them, not call back into the player.
    pub fn new(renderer: Arc<dyn Renderer>, dispatch: EventDispatch) -> Self {
        Self {
            renderer,
            dispatch,
            state: PlayerState::Initialized,
            play_when_ready: false,
            uri: None,
            generation: 0,
            released: false,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: impl FnMut(StateChange) + Send + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn clear_listener(&mut self) {
        self.listener = None;
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    pub fn play_when_ready(&self) -> bool {
        self.play_when_ready
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub fn prepare(&mut self, uri: &str) {
        if self.is_dead("prepare") {
            return;
        }
        if self.state != PlayerState::Initialized {
            self.renderer.reset();
        }
        self.generation += 1;
        self.uri = Some(uri.to_string());

        let reporter = Reporter::new(self.generation, Arc::clone(&self.dispatch));
        match self.renderer.prepare(uri, reporter) {
            Ok(()) => self.set_state(PlayerState::Preparing),
            Err(e) => {
                log::warn!("sonata: cannot prepare {}: {}", uri, e);
                self.set_state(PlayerState::Error {
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }

    pub fn set_play_when_ready(&mut self, play: bool) {
        if self.is_dead("set_play_when_ready") {
            return;
        }
        self.play_when_ready = play;
        if play {
            match self.state {
                PlayerState::Stopped => {
                    if let Some(uri) = self.uri.clone() {
                        self.prepare(&uri);
                    }
                }
                PlayerState::Prepared | PlayerState::Paused => {
                    self.renderer.start();
                    self.set_state(PlayerState::Playing);
                }
                PlayerState::Ended => {
                    self.renderer.seek(0);
                    self.renderer.start();
                    self.set_state(PlayerState::Playing);
                }
                _ => {}
            }
        } else if matches!(self.state, PlayerState::Playing | PlayerState::Buffering) {
            self.renderer.pause();
            self.set_state(PlayerState::Paused);
        }
    }

    /// 0 unless playing or paused.
    pub fn seek_position(&self) -> u64 {
        match self.state {
            PlayerState::Playing | PlayerState::Paused if !self.released => self.renderer.position_ms(),
            _ => 0,
        }
    }

    pub fn set_seek_position(&mut self, position_ms: u64) {
        if self.is_dead("seek") {
            return;
        }
        if matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            self.renderer.seek(position_ms);
        }
    }

    pub fn stop(&mut self) {
        if self.is_dead("stop") {
            return;
        }
        match self.state {
            PlayerState::Prepared
            | PlayerState::Playing
            | PlayerState::Paused
            | PlayerState::Buffering
            | PlayerState::Ended => {
                self.generation += 1;
                self.renderer.stop();
                self.set_state(PlayerState::Stopped);
            }
            PlayerState::Preparing => self.reset(),
            PlayerState::Initialized | PlayerState::Stopped | PlayerState::Error { .. } => {}
        }
    }

    pub fn reset(&mut self) {
        if self.is_dead("reset") {
            return;
        }
        self.generation += 1;
        self.renderer.reset();
        self.set_state(PlayerState::Initialized);
    }

    /// Release the renderer. Terminal.
    pub fn release(&mut self) {
        if self.is_dead("release") {
            return;
        }
        self.generation += 1;
        self.released = true;
        self.renderer.release();
    }

    // -----------------------------------------------------------------------
    // Renderer events
    // -----------------------------------------------------------------------

    pub fn handle_renderer_event(&mut self, generation: u64, event: RendererEvent) {
        if self.released || generation != self.generation {
            log::debug!(
                "sonata: dropping {:?} from generation {} (current {})",
                event,
                generation,
                self.generation
            );
            return;
        }
        match event {
            RendererEvent::Prepared => {
                if self.state != PlayerState::Preparing {
                    return;
                }
                if self.play_when_ready {
                    self.renderer.start();
                    self.set_state(PlayerState::Playing);
                } else {
                    self.set_state(PlayerState::Prepared);
                }
            }
            RendererEvent::BufferingStart => {
                if matches!(
                    self.state,
                    PlayerState::Prepared | PlayerState::Playing | PlayerState::Paused
                ) {
                    self.set_state(PlayerState::Buffering);
                }
            }
            RendererEvent::BufferingEnd => {
                if self.state == PlayerState::Buffering {
                    let next = if self.play_when_ready {
                        PlayerState::Playing
                    } else {
                        PlayerState::Paused
                    };
                    self.set_state(next);
                }
            }
            RendererEvent::Error(e) => {
                log::warn!("sonata: renderer error: {}", e);
                self.set_state(PlayerState::Error {
                    code: e.code(),
                    message: e.to_string(),
                });
            }
            RendererEvent::Completed => {
                if self.state.is_error() {
                    log::debug!("sonata: ignoring completion after error");
                    return;
                }
                self.set_state(PlayerState::Ended);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn is_dead(&self, op: &str) -> bool {
        if self.released {
            log::warn!("sonata: player released, ignoring {}", op);
        }
        self.released
    }

    fn set_state(&mut self, state: PlayerState) {
        self.state = state.clone();
        let position_ms = self.seek_position();
        if let Some(listener) = self.listener.as_mut() {
            listener(StateChange { state, position_ms });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RendererError;
    use parking_lot::Mutex;

    /// Renderer that records calls and can be told to reject sources.
    #[derive(Default)]
    pub(crate) struct FakeRenderer {
        pub calls: Mutex<Vec<String>>,
        pub position: Mutex<u64>,
        pub reject: Mutex<Option<RendererError>>,
    }

    impl FakeRenderer {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    impl Renderer for FakeRenderer {
        fn prepare(&self, uri: &str, _: Reporter) -> Result<(), RendererError> {
            self.record(format!("prepare {}", uri));
            match self.reject.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        fn start(&self) {
            self.record("start");
        }
        fn pause(&self) {
            self.record("pause");
        }
        fn stop(&self) {
            self.record("stop");
        }
        fn reset(&self) {
            self.record("reset");
        }
        fn release(&self) {
            self.record("release");
        }
        fn seek(&self, position_ms: u64) {
            self.record(format!("seek {}", position_ms));
            *self.position.lock() = position_ms;
        }
        fn position_ms(&self) -> u64 {
            *self.position.lock()
        }
    }

    struct Rig {
        renderer: Arc<FakeRenderer>,
        player: PlayerStateMachine,
        changes: Arc<Mutex<Vec<StateChange>>>,
    }

    impl Rig {
        fn new() -> Self {
            let renderer = Arc::new(FakeRenderer::default());
            let mut player = PlayerStateMachine::new(renderer.clone(), Arc::new(|_: u64, _: RendererEvent| {}));
            let changes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&changes);
            player.set_listener(move |c| sink.lock().push(c));
            Self { renderer, player, changes }
        }

        fn event(&mut self, event: RendererEvent) {
            let generation = self.player.generation();
            self.player.handle_renderer_event(generation, event);
        }

        fn states(&self) -> Vec<PlayerState> {
            self.changes.lock().iter().map(|c| c.state.clone()).collect()
        }

        fn playing(&mut self) {
            self.player.set_play_when_ready(true);
            self.player.prepare("/a.mp3");
            self.event(RendererEvent::Prepared);
            assert_eq!(*self.player.state(), PlayerState::Playing);
        }
    }

    #[test]
    fn prepare_without_intent_lands_on_prepared() {
        let mut rig = Rig::new();
        rig.player.prepare("/a.mp3");
        assert_eq!(*rig.player.state(), PlayerState::Preparing);
        rig.event(RendererEvent::Prepared);
        assert_eq!(rig.states(), vec![PlayerState::Preparing, PlayerState::Prepared]);
        assert_eq!(rig.renderer.calls(), vec!["prepare /a.mp3"]);
    }

    #[test]
    fn prepare_with_intent_starts_playback() {
        let mut rig = Rig::new();
        rig.playing();
        assert_eq!(rig.renderer.calls(), vec!["prepare /a.mp3", "start"]);
    }

    #[test]
    fn prepare_from_other_states_resets_first() {
        let mut rig = Rig::new();
        rig.playing();
        rig.player.prepare("/b.mp3");
        assert_eq!(
            rig.renderer.calls(),
            vec!["prepare /a.mp3", "start", "reset", "prepare /b.mp3"]
        );
    }

    #[test]
    fn synchronous_rejection_becomes_error() {
        let mut rig = Rig::new();
        *rig.renderer.reject.lock() = Some(RendererError::Source("no such file".into()));
        rig.player.prepare("/missing.mp3");
        assert_eq!(
            *rig.player.state(),
            PlayerState::Error { code: -1, message: "no such file".into() }
        );
    }

    #[test]
    fn two_prepares_keep_only_the_second() {
        let mut rig = Rig::new();
        rig.player.prepare("/a.mp3");
        let stale = rig.player.generation();
        rig.player.prepare("/b.mp3");
        rig.player.handle_renderer_event(stale, RendererEvent::Prepared);
        assert_eq!(*rig.player.state(), PlayerState::Preparing);
        rig.event(RendererEvent::Prepared);
        assert_eq!(*rig.player.state(), PlayerState::Prepared);

        // Re-preparing from Stopped uses the second source.
        rig.player.set_play_when_ready(true);
        rig.player.stop();
        rig.player.set_play_when_ready(true);
        assert_eq!(rig.renderer.calls().last().map(String::as_str), Some("prepare /b.mp3"));
    }

    #[test]
    fn play_when_ready_transitions() {
        let mut rig = Rig::new();
        rig.playing();

        rig.player.set_play_when_ready(false);
        assert_eq!(*rig.player.state(), PlayerState::Paused);
        rig.player.set_play_when_ready(true);
        assert_eq!(*rig.player.state(), PlayerState::Playing);

        rig.event(RendererEvent::Completed);
        assert_eq!(*rig.player.state(), PlayerState::Ended);
        rig.player.set_play_when_ready(true);
        assert_eq!(*rig.player.state(), PlayerState::Playing);
        assert!(rig.renderer.calls().contains(&"seek 0".to_string()));
    }

    #[test]
    fn play_from_stopped_re_prepares() {
        let mut rig = Rig::new();
        rig.playing();
        rig.player.stop();
        assert_eq!(*rig.player.state(), PlayerState::Stopped);
        rig.player.set_play_when_ready(true);
        assert_eq!(*rig.player.state(), PlayerState::Preparing);
        rig.event(RendererEvent::Prepared);
        assert_eq!(*rig.player.state(), PlayerState::Playing);
    }

    #[test]
    fn intent_is_recorded_in_other_states() {
        let mut rig = Rig::new();
        rig.player.set_play_when_ready(true);
        assert!(rig.player.play_when_ready());
        assert_eq!(*rig.player.state(), PlayerState::Initialized);
        assert!(rig.changes.lock().is_empty());
    }

    #[test]
    fn buffering_returns_per_intent() {
        let mut rig = Rig::new();
        rig.playing();
        rig.event(RendererEvent::BufferingStart);
        assert_eq!(*rig.player.state(), PlayerState::Buffering);
        rig.event(RendererEvent::BufferingEnd);
        assert_eq!(*rig.player.state(), PlayerState::Playing);

        rig.event(RendererEvent::BufferingStart);
        rig.player.set_play_when_ready(false);
        assert_eq!(*rig.player.state(), PlayerState::Paused);
        rig.event(RendererEvent::BufferingStart);
        rig.event(RendererEvent::BufferingEnd);
        assert_eq!(*rig.player.state(), PlayerState::Paused);
    }

    #[test]
    fn buffering_while_preparing_still_starts_on_prepared() {
        let mut rig = Rig::new();
        rig.player.set_play_when_ready(true);
        rig.player.prepare("/a.mp3");
        rig.event(RendererEvent::BufferingStart);
        assert_eq!(*rig.player.state(), PlayerState::Preparing);

        rig.event(RendererEvent::Prepared);
        rig.event(RendererEvent::BufferingEnd);
        assert_eq!(*rig.player.state(), PlayerState::Playing);
        assert_eq!(rig.renderer.calls(), vec!["prepare /a.mp3", "start"]);
    }

    #[test]
    fn error_is_sticky_against_completion() {
        let mut rig = Rig::new();
        rig.playing();
        rig.event(RendererEvent::Error(RendererError::Io));
        rig.event(RendererEvent::Completed);
        assert_eq!(
            *rig.player.state(),
            PlayerState::Error { code: -1004, message: "Renderer: IO error".into() }
        );
    }

    #[test]
    fn seek_position_only_while_playing_or_paused() {
        let mut rig = Rig::new();
        rig.player.set_seek_position(500);
        assert_eq!(rig.player.seek_position(), 0);
        assert!(rig.renderer.calls().is_empty());

        rig.playing();
        rig.player.set_seek_position(500);
        assert_eq!(rig.player.seek_position(), 500);

        rig.player.stop();
        assert_eq!(rig.player.seek_position(), 0);
    }

    #[test]
    fn stop_edges() {
        let mut rig = Rig::new();
        rig.player.stop();
        assert!(rig.changes.lock().is_empty());

        rig.player.prepare("/a.mp3");
        rig.player.stop();
        assert_eq!(*rig.player.state(), PlayerState::Initialized);

        rig.playing();
        rig.player.stop();
        let before = rig.changes.lock().len();
        rig.player.stop();
        assert_eq!(rig.changes.lock().len(), before);
    }

    #[test]
    fn stop_drops_pending_events() {
        let mut rig = Rig::new();
        rig.playing();
        let old = rig.player.generation();
        rig.player.stop();
        rig.player.handle_renderer_event(old, RendererEvent::Completed);
        assert_eq!(*rig.player.state(), PlayerState::Stopped);
    }

    #[test]
    fn listener_sees_position_at_change() {
        let mut rig = Rig::new();
        rig.playing();
        rig.player.set_seek_position(1200);
        rig.player.set_play_when_ready(false);
        let last = rig.changes.lock().last().cloned().unwrap();
        assert_eq!(last, StateChange { state: PlayerState::Paused, position_ms: 1200 });
    }

    #[test]
    fn release_is_terminal() {
        let mut rig = Rig::new();
        rig.playing();
        rig.player.release();
        let calls = rig.renderer.calls().len();
        rig.player.prepare("/b.mp3");
        rig.player.set_play_when_ready(false);
        rig.player.stop();
        rig.player.reset();
        rig.player.release();
        rig.event(RendererEvent::Completed);
        assert_eq!(rig.renderer.calls().len(), calls);
        assert_eq!(*rig.player.state(), PlayerState::Playing);
        assert!(rig.player.is_released());
    }

    #[test]
    fn no_arg_operations_never_panic_from_any_state() {
        let events = [
            RendererEvent::Prepared,
            RendererEvent::BufferingStart,
            RendererEvent::BufferingEnd,
            RendererEvent::Completed,
            RendererEvent::Error(RendererError::Malformed),
        ];
        for event in events {
            let mut rig = Rig::new();
            rig.player.prepare("/a.mp3");
            rig.event(event.clone());
            rig.player.set_play_when_ready(true);
            rig.player.stop();
            rig.player.set_play_when_ready(false);
            rig.player.reset();
            rig.player.stop();
            rig.player.seek_position();
            rig.player.release();
        }
    }
}
