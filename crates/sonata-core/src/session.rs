//! Playback orchestrator: transport commands in, canonical snapshot out.
//!
//! Resolves media ids through the catalog, drives the player through the
//! focus arbiter, and owns the wake resource and the becoming-noisy
//! registration. Every player state change becomes a [`PlaybackSnapshot`]
//! published to the single event sink.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::catalog::Catalog;
use crate::clock::TimeSource;
use crate::config::EngineConfig;
use crate::effects::{
    AudioFocus, EventDispatch, NoisyReceiver, NoisyRegistration, NoopRenderer, PolicyFocus, Renderer,
    RendererEvent, TimedWakeLock, WakeLock,
};
use crate::error::CommandError;
use crate::focus::{AudioFocusArbiter, FocusChange, FocusState};
use crate::models::{PlaybackSnapshot, PlaybackStateCode, PlayerEvent, PlayerState, TransportCommand};
use crate::player::{PlayerStateMachine, StateChange};

/// Platform collaborators the orchestrator drives.
#[derive(Clone)]
pub struct SessionParts {
    pub renderer: Arc<dyn Renderer>,
    pub focus: Arc<dyn AudioFocus>,
    pub wake: Arc<dyn WakeLock>,
    pub noisy: Arc<dyn NoisyReceiver>,
}

impl SessionParts {
    /// Headless collaborators around the given renderer.
    pub fn with_renderer(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            focus: Arc::new(PolicyFocus::granting()),
            wake: Arc::new(TimedWakeLock::new()),
            noisy: Arc::new(NoisyRegistration::new()),
        }
    }

    /// No device at all.
    pub fn headless() -> Self {
        Self::with_renderer(Arc::new(NoopRenderer::new()))
    }
}

pub type EventSink = Box<dyn FnMut(PlayerEvent) + Send>;

#[derive(Default)]
struct Canonical {
    last_code: PlaybackStateCode,
    snapshot: PlaybackSnapshot,
    media_id: Option<String>,
}

/// Read handle on the canonical snapshot, usable from any thread.
#[derive(Clone, Default)]
pub struct SharedSnapshot(Arc<Mutex<Canonical>>);

impl SharedSnapshot {
    pub fn get(&self) -> PlaybackSnapshot {
        self.0.lock().snapshot.clone()
    }

    pub fn last_code(&self) -> PlaybackStateCode {
        self.0.lock().last_code
    }

    pub fn media_id(&self) -> Option<String> {
        self.0.lock().media_id.clone()
    }
}

type SharedSink = Arc<Mutex<Option<EventSink>>>;

fn emit(sink: &SharedSink, event: PlayerEvent) {
    if let Some(sink) = sink.lock().as_mut() {
        sink(event);
    }
}

pub struct PlaybackOrchestrator {
    player: PlayerStateMachine,
    arbiter: AudioFocusArbiter,
    catalog: Arc<Catalog>,
    wake: Arc<dyn WakeLock>,
    wake_timeout: Duration,
    noisy: Arc<dyn NoisyReceiver>,
    noisy_registered: bool,
    time: Arc<dyn TimeSource>,
    speed: f32,
    canonical: SharedSnapshot,
    sink: SharedSink,
    released: bool,
}

impl PlaybackOrchestrator {
    pub fn new(
        catalog: Arc<Catalog>,
        parts: SessionParts,
        dispatch: EventDispatch,
        time: Arc<dyn TimeSource>,
        config: &EngineConfig,
    ) -> Self {
        let canonical = SharedSnapshot::default();
        let sink: SharedSink = Arc::new(Mutex::new(None));

        let mut player = PlayerStateMachine::new(parts.renderer, dispatch);
        {
            let canonical = canonical.clone();
            let sink = Arc::clone(&sink);
            let time = Arc::clone(&time);
            let speed = config.speed;
            player.set_listener(move |change: StateChange| {
                let snapshot = {
                    let mut c = canonical.0.lock();
                    c.last_code = change.state.code();
                    c.snapshot = PlaybackSnapshot {
                        state: c.last_code,
                        position_ms: change.position_ms as i64,
                        speed,
                        timestamp_ms: time.now_ms(),
                        media_id: c.media_id.clone(),
                        error: change.state.error_info(),
                    };
                    c.snapshot.clone()
                };
                emit(&sink, PlayerEvent::PlaybackStateChanged(snapshot));
            });
        }

        Self {
            player,
            arbiter: AudioFocusArbiter::new(parts.focus),
            catalog,
            wake: parts.wake,
            wake_timeout: config.wake_lock_timeout(),
            noisy: parts.noisy,
            noisy_registered: false,
            time,
            speed: config.speed,
            canonical,
            sink,
            released: false,
        }
    }

    pub fn set_sink(&mut self, sink: impl FnMut(PlayerEvent) + Send + 'static) {
        *self.sink.lock() = Some(Box::new(sink));
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.canonical.get()
    }

    pub fn shared_snapshot(&self) -> SharedSnapshot {
        self.canonical.clone()
    }

    pub fn player_state(&self) -> &PlayerState {
        self.player.state()
    }

    /// Generation of the player's current preparation attempt.
    pub fn generation(&self) -> u64 {
        self.player.generation()
    }

    pub fn focus_state(&self) -> FocusState {
        self.arbiter.state()
    }

    pub fn noisy_registered(&self) -> bool {
        self.noisy_registered
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    pub fn handle(&mut self, command: TransportCommand) -> Result<(), CommandError> {
        match command {
            TransportCommand::Play => self.on_play(),
            TransportCommand::Pause => self.on_pause(),
            TransportCommand::Stop => self.on_stop(),
            TransportCommand::PrepareFromId { id } => {
                self.on_prepare_from_id(&id);
            }
            TransportCommand::PlayFromId { id } => self.on_play_from_id(&id),
            TransportCommand::SeekTo { position_ms } => self.on_seek_to(position_ms),
            TransportCommand::SkipToNext => return self.on_skip_to_next(),
            TransportCommand::SkipToPrevious => return self.on_skip_to_previous(),
        }
        Ok(())
    }

    pub fn on_play(&mut self) {
        if self.is_released("play") {
            return;
        }
        self.wake.acquire(self.wake_timeout);
        self.arbiter.request_play(&mut self.player);
        self.register_noisy();
        emit(&self.sink, PlayerEvent::StartingPlayback);
    }

    pub fn on_pause(&mut self) {
        self.pause_or_stop(false);
    }

    pub fn on_stop(&mut self) {
        self.pause_or_stop(true);
    }

    fn pause_or_stop(&mut self, stop: bool) {
        if self.is_released(if stop { "stop" } else { "pause" }) {
            return;
        }
        if self.wake.is_held() {
            self.wake.release();
        }
        self.arbiter.request_pause_or_stop(&mut self.player, stop);
        self.unregister_noisy();
    }

    /// Resolve `media_id`, announce its metadata and prepare it. Returns
    /// whether the id was found.
    pub fn on_prepare_from_id(&mut self, media_id: &str) -> bool {
        if self.is_released("prepare") {
            return false;
        }
        let Some(metadata) = self.catalog.find_by_id(media_id) else {
            log::warn!("sonata: no playable item with id {}", media_id);
            return false;
        };
        self.canonical.0.lock().media_id = Some(media_id.to_string());
        let uri = metadata.media_uri.clone();
        emit(&self.sink, PlayerEvent::MetadataChanged(metadata));
        self.player.prepare(&uri);
        true
    }

    pub fn on_play_from_id(&mut self, media_id: &str) {
        if self.on_prepare_from_id(media_id) {
            self.on_play();
        }
    }

    pub fn on_seek_to(&mut self, position_ms: u64) {
        if self.is_released("seek") {
            return;
        }
        self.player.set_seek_position(position_ms);
        let snapshot = {
            let mut c = self.canonical.0.lock();
            let error = if c.last_code == PlaybackStateCode::Error {
                c.snapshot.error.clone()
            } else {
                None
            };
            c.snapshot = PlaybackSnapshot {
                state: c.last_code,
                position_ms: position_ms as i64,
                speed: self.speed,
                timestamp_ms: self.time.now_ms(),
                media_id: c.media_id.clone(),
                error,
            };
            c.snapshot.clone()
        };
        emit(&self.sink, PlayerEvent::PlaybackStateChanged(snapshot));
    }

    pub fn on_skip_to_next(&mut self) -> Result<(), CommandError> {
        Err(CommandError::Unsupported("skip to next"))
    }

    pub fn on_skip_to_previous(&mut self) -> Result<(), CommandError> {
        Err(CommandError::Unsupported("skip to previous"))
    }

    // -----------------------------------------------------------------------
    // Platform signals
    // -----------------------------------------------------------------------

    /// Headphones unplugged. Only acted on while registered.
    pub fn on_becoming_noisy(&mut self) {
        if self.released || !self.noisy_registered {
            return;
        }
        self.arbiter.request_play(&mut self.player);
    }

    pub fn on_focus_change(&mut self, change: FocusChange) {
        if self.is_released("focus change") {
            return;
        }
        self.arbiter.on_focus_change(change, &mut self.player);
    }

    pub fn handle_renderer_event(&mut self, generation: u64, event: RendererEvent) {
        self.player.handle_renderer_event(generation, event);
    }

    /// Detach the sink and let go of every resource. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        *self.sink.lock() = None;
        self.arbiter.request_pause_or_stop(&mut self.player, true);
        self.player.release();
        self.unregister_noisy();
        if self.wake.is_held() {
            self.wake.release();
        }
    }

    fn register_noisy(&mut self) {
        if !self.noisy_registered {
            self.noisy.register();
            self.noisy_registered = true;
        }
    }

    fn unregister_noisy(&mut self) {
        if self.noisy_registered {
            self.noisy.unregister();
            self.noisy_registered = false;
        }
    }

    fn is_released(&self, op: &str) -> bool {
        if self.released {
            log::warn!("sonata: session released, ignoring {}", op);
        }
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;
    use crate::effects::library::{LibraryProvider, TrackRecord};
    use crate::effects::FocusGrant;
    use crate::models::MediaMetadata;

    struct Rig {
        session: PlaybackOrchestrator,
        pending: Arc<Mutex<Vec<(u64, RendererEvent)>>>,
        events: Arc<Mutex<Vec<PlayerEvent>>>,
        focus: Arc<PolicyFocus>,
        wake: Arc<TimedWakeLock>,
        noisy: Arc<NoisyRegistration>,
        time: ManualTime,
    }

    impl Rig {
        fn new() -> Self {
            let provider = Arc::new(LibraryProvider::new(vec![TrackRecord {
                id: "42".into(),
                title: "Answer".into(),
                artist: Some("Deep Thought".into()),
                album: Some("Guide".into()),
                genre: None,
                duration_ms: 42_000,
                path: "/music/42.mp3".into(),
                date_added: 1,
                art_uri: None,
            }]));
            let catalog = Arc::new(Catalog::new(provider, 5000));
            catalog.load_blocking();

            let pending = Arc::new(Mutex::new(Vec::new()));
            let queue = Arc::clone(&pending);
            let dispatch: EventDispatch =
                Arc::new(move |g: u64, e: RendererEvent| queue.lock().push((g, e)));

            let focus = Arc::new(PolicyFocus::granting());
            let wake = Arc::new(TimedWakeLock::new());
            let noisy = Arc::new(NoisyRegistration::new());
            let time = ManualTime::new(1_000);
            let parts = SessionParts {
                renderer: Arc::new(NoopRenderer::new()),
                focus: focus.clone(),
                wake: wake.clone(),
                noisy: noisy.clone(),
            };
            let mut session = PlaybackOrchestrator::new(
                catalog,
                parts,
                dispatch,
                Arc::new(time.clone()),
                &EngineConfig::default(),
            );
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            session.set_sink(move |e| sink.lock().push(e));
            Self { session, pending, events, focus, wake, noisy, time }
        }

        /// Deliver queued renderer events, as the engine timeline would.
        fn pump(&mut self) {
            let pending: Vec<_> = self.pending.lock().drain(..).collect();
            for (generation, event) in pending {
                self.session.handle_renderer_event(generation, event);
            }
        }

        fn codes(&self) -> Vec<PlaybackStateCode> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    PlayerEvent::PlaybackStateChanged(s) => Some(s.state),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn play_from_id_reaches_playing() {
        let mut rig = Rig::new();
        rig.session.on_play_from_id("42");
        rig.pump();

        let events = rig.events.lock().clone();
        assert!(matches!(&events[0], PlayerEvent::MetadataChanged(MediaMetadata { media_id, .. }) if media_id == "42"));
        assert!(events.contains(&PlayerEvent::StartingPlayback));
        assert_eq!(
            rig.codes(),
            vec![PlaybackStateCode::Connecting, PlaybackStateCode::Playing]
        );
        let snapshot = rig.session.snapshot();
        assert!(snapshot.is_playing());
        assert_eq!(snapshot.media_id.as_deref(), Some("42"));
        assert_eq!(snapshot.speed, 1.0);
        assert_eq!(snapshot.timestamp_ms, 1_000);
        assert!(rig.wake.is_held());
        assert!(rig.noisy.is_registered());
    }

    #[test]
    fn unknown_id_is_a_quiet_no_op() {
        let mut rig = Rig::new();
        rig.session.on_play_from_id("unknownId");
        rig.pump();
        assert!(rig.events.lock().is_empty());
        assert_eq!(*rig.session.player_state(), PlayerState::Initialized);
        assert!(!rig.wake.is_held());
    }

    #[test]
    fn prepare_from_id_does_not_start() {
        let mut rig = Rig::new();
        rig.session.on_prepare_from_id("42");
        rig.pump();
        assert_eq!(*rig.session.player_state(), PlayerState::Prepared);
        assert_eq!(rig.session.snapshot().state, PlaybackStateCode::Paused);
    }

    #[test]
    fn pause_and_stop_release_resources() {
        let mut rig = Rig::new();
        rig.session.on_play_from_id("42");
        rig.pump();

        rig.session.on_pause();
        assert_eq!(rig.session.snapshot().state, PlaybackStateCode::Paused);
        assert!(!rig.wake.is_held());
        assert!(!rig.noisy.is_registered());

        rig.session.on_play();
        assert_eq!(rig.session.snapshot().state, PlaybackStateCode::Playing);

        rig.session.on_stop();
        assert_eq!(rig.session.snapshot().state, PlaybackStateCode::Stopped);
        assert!(!rig.session.noisy_registered());
    }

    #[test]
    fn seek_emits_snapshot_with_last_code() {
        let mut rig = Rig::new();
        rig.session.on_play_from_id("42");
        rig.pump();
        rig.time.advance(500);
        rig.session.on_seek_to(30_000);

        let last = rig.events.lock().last().cloned();
        match last {
            Some(PlayerEvent::PlaybackStateChanged(s)) => {
                assert_eq!(s.state, PlaybackStateCode::Playing);
                assert_eq!(s.position_ms, 30_000);
                assert_eq!(s.timestamp_ms, 1_500);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn skips_are_unsupported() {
        let mut rig = Rig::new();
        assert_eq!(
            rig.session.handle(TransportCommand::SkipToNext),
            Err(CommandError::Unsupported("skip to next"))
        );
        assert!(rig.session.handle(TransportCommand::SkipToPrevious).is_err());
        assert!(rig.session.handle(TransportCommand::Play).is_ok());
    }

    #[test]
    fn noisy_signal_only_while_registered() {
        let mut rig = Rig::new();
        rig.session.on_prepare_from_id("42");
        rig.pump();
        rig.session.on_becoming_noisy();
        assert_eq!(*rig.session.player_state(), PlayerState::Prepared);

        rig.focus.set_policy(FocusGrant::Delayed);
        rig.session.on_play();
        assert!(rig.session.focus_state().delayed);
        rig.session.on_becoming_noisy();
        assert_eq!(*rig.session.player_state(), PlayerState::Prepared);
    }

    #[test]
    fn transient_focus_loss_round_trip() {
        let mut rig = Rig::new();
        rig.session.on_play_from_id("42");
        rig.pump();
        rig.session.on_focus_change(FocusChange::LossTransient);
        assert!(rig.session.focus_state().resume_on_regain);
        assert_eq!(*rig.session.player_state(), PlayerState::Paused);
        rig.session.on_focus_change(FocusChange::Gain);
        assert_eq!(*rig.session.player_state(), PlayerState::Playing);
    }

    #[test]
    fn renderer_error_reaches_snapshot() {
        let mut rig = Rig::new();
        rig.session.on_play_from_id("42");
        rig.pump();
        let generation = rig.session.generation();
        rig.session
            .handle_renderer_event(generation, RendererEvent::Error(crate::error::RendererError::Io));
        let snapshot = rig.session.snapshot();
        assert_eq!(snapshot.state, PlaybackStateCode::Error);
        assert_eq!(snapshot.error.map(|e| e.code), Some(-1004));
    }

    #[test]
    fn release_twice_is_harmless() {
        let mut rig = Rig::new();
        rig.session.on_play_from_id("42");
        rig.pump();
        let before = rig.events.lock().len();

        rig.session.release();
        rig.session.release();
        assert_eq!(rig.events.lock().len(), before);
        assert!(!rig.wake.is_held());
        assert!(!rig.noisy.is_registered());

        rig.session.on_play();
        rig.pump();
        assert_eq!(rig.events.lock().len(), before);
        assert_eq!(rig.session.shared_snapshot().last_code(), PlaybackStateCode::Stopped);
    }
}
