//! sonata engine: the command timeline.
//!
//! One thread owns the orchestrator and the position clock. Transport
//! commands, renderer events, focus changes and the noisy signal all arrive
//! over one channel and are handled in arrival order; clock ticks run on the
//! same thread between messages. Catalog loads run on their own threads.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::catalog::Catalog;
use crate::clock::{PositionClock, TimeSource, WallClock};
use crate::config::EngineConfig;
use crate::effects::{EventDispatch, RendererEvent};
use crate::error::{CatalogError, CommandError, EngineError};
use crate::focus::FocusChange;
use crate::models::{CatalogNode, CatalogState, PlaybackSnapshot, PlayerEvent, TransportCommand};
use crate::session::{PlaybackOrchestrator, SessionParts, SharedSnapshot};

/// Result handed to `load_children` callers.
pub type ChildrenResult = Result<Vec<CatalogNode>, CatalogError>;

enum Event {
    Command(TransportCommand),
    Renderer { generation: u64, event: RendererEvent },
    Focus(FocusChange),
    Noisy,
    /// Re-check the clock; sent by hosts that drive virtual time.
    Wake,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Fan-out of player events to any number of subscribers.
#[derive(Default)]
struct Broadcaster {
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl Broadcaster {
    fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: PlayerEvent) {
        // Closed receivers drop out here.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The sonata playback engine.
pub struct Engine {
    catalog: Arc<Catalog>,
    tx: Mutex<Sender<Event>>,
    /// The timeline before `start` moves it onto its thread.
    pending: Mutex<Option<Timeline>>,
    snapshot: SharedSnapshot,
    events: Arc<Broadcaster>,
    time: Arc<dyn TimeSource>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Engine {
    pub fn new(catalog: Arc<Catalog>, parts: SessionParts, config: EngineConfig) -> Self {
        Self::with_time(catalog, parts, config, Arc::new(WallClock))
    }

    /// Boot with a custom time source (`ManualTime` for virtual time).
    pub fn with_time(
        catalog: Arc<Catalog>,
        parts: SessionParts,
        config: EngineConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let renderer_tx = Mutex::new(tx.clone());
        let dispatch: EventDispatch = Arc::new(move |generation: u64, event: RendererEvent| {
            // The timeline may already be gone.
            let _ = renderer_tx.lock().send(Event::Renderer { generation, event });
        });

        let events = Arc::new(Broadcaster::default());
        let outbox: Arc<Mutex<Vec<PlayerEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let mut session =
            PlaybackOrchestrator::new(Arc::clone(&catalog), parts, dispatch, Arc::clone(&time), &config);
        {
            let outbox = Arc::clone(&outbox);
            session.set_sink(move |event| outbox.lock().push(event));
        }
        let snapshot = session.shared_snapshot();

        let timeline = Timeline {
            rx,
            session,
            clock: PositionClock::new(Arc::clone(&time), config.tick_interval()),
            outbox,
            events: Arc::clone(&events),
            time: Arc::clone(&time),
            duration_ms: 0,
        };

        Self {
            catalog,
            tx: Mutex::new(tx),
            pending: Mutex::new(Some(timeline)),
            snapshot,
            events,
            time,
            handle: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Spawn the timeline thread. Idempotent.
    pub fn start(&self) {
        let Some(timeline) = self.pending.lock().take() else {
            return;
        };
        *self.handle.lock() = Some(thread::spawn(move || timeline.run()));
    }

    /// Stop the timeline and release the session. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Never started: release in place.
        if let Some(mut timeline) = self.pending.lock().take() {
            timeline.session.release();
            return;
        }
        log_err(self.tx.lock().send(Event::Shutdown), "shutdown signal");
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("sonata: timeline thread panicked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Post a transport command. Skips are refused here, without a round trip.
    pub fn command(&self, command: TransportCommand) -> Result<(), EngineError> {
        match command {
            TransportCommand::SkipToNext => {
                return Err(CommandError::Unsupported("skip to next").into())
            }
            TransportCommand::SkipToPrevious => {
                return Err(CommandError::Unsupported("skip to previous").into())
            }
            _ => {}
        }
        self.post(Event::Command(command))
    }

    pub fn focus_changed(&self, change: FocusChange) -> Result<(), EngineError> {
        self.post(Event::Focus(change))
    }

    pub fn becoming_noisy(&self) -> Result<(), EngineError> {
        self.post(Event::Noisy)
    }

    /// Re-check the position clock now. Hosts that advance a `ManualTime`
    /// call this afterwards.
    pub fn wake(&self) -> Result<(), EngineError> {
        self.post(Event::Wake)
    }

    /// Media access was granted: load the catalog in the background.
    pub fn access_granted(&self) -> JoinHandle<CatalogState> {
        log::info!("sonata: access granted, loading catalog");
        self.catalog.load()
    }

    fn post(&self, event: Event) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        self.tx.lock().send(event).map_err(|_| EngineError::ShutDown)
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn playback_state(&self) -> PlaybackSnapshot {
        self.snapshot.get()
    }

    pub fn now_playing(&self) -> Option<String> {
        self.snapshot.media_id()
    }

    pub fn now_ms(&self) -> i64 {
        self.time.now_ms()
    }

    // -----------------------------------------------------------------------
    // Browse
    // -----------------------------------------------------------------------

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn root_id(&self) -> &'static str {
        self.catalog.root_id()
    }

    /// Deliver the children of `parent` once the catalog is ready.
    ///
    /// Returns `true` if `deliver` already ran, `false` if it was parked on
    /// the ready gate. A failed load is delivered as `CatalogError::NotLoaded`.
    pub fn load_children(
        &self,
        parent: &str,
        deliver: impl FnOnce(ChildrenResult) + Send + 'static,
    ) -> bool {
        let catalog: Weak<Catalog> = Arc::downgrade(&self.catalog);
        let parent = parent.to_string();
        self.catalog.when_ready(move |loaded| {
            let result = match catalog.upgrade() {
                Some(catalog) if loaded => catalog.children(&parent),
                _ => Err(CatalogError::NotLoaded),
            };
            deliver(result);
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

struct Timeline {
    rx: Receiver<Event>,
    session: PlaybackOrchestrator,
    clock: PositionClock,
    /// Events the session emitted while handling the current message.
    outbox: Arc<Mutex<Vec<PlayerEvent>>>,
    events: Arc<Broadcaster>,
    time: Arc<dyn TimeSource>,
    /// Duration of the current item; clock ticks stop there.
    duration_ms: u64,
}

impl Timeline {
    fn run(mut self) {
        loop {
            let next = match self.clock.next_deadline() {
                Some(due) => {
                    let wait = (due - self.time.now_ms()).max(0) as u64;
                    match self.rx.recv_timeout(Duration::from_millis(wait)) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
            };
            match next {
                Some(Event::Shutdown) => break,
                Some(event) => self.handle(event),
                None => {}
            }
            self.flush();
            self.clock.poll();
        }

        self.session.release();
        self.clock.stop_and_detach(|_| {});
        log::debug!("sonata: timeline stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => {
                log::debug!("sonata: command {:?}", command);
                if let Err(e) = self.session.handle(command) {
                    log::info!("sonata: {}", e);
                }
            }
            Event::Renderer { generation, event } => {
                self.session.handle_renderer_event(generation, event)
            }
            Event::Focus(change) => self.session.on_focus_change(change),
            Event::Noisy => self.session.on_becoming_noisy(),
            Event::Wake | Event::Shutdown => {}
        }
    }

    /// Publish what the session emitted and keep the clock in step with the
    /// latest snapshot.
    fn flush(&mut self) {
        let emitted: Vec<PlayerEvent> = self.outbox.lock().drain(..).collect();
        for event in emitted {
            let snapshot = match &event {
                PlayerEvent::MetadataChanged(meta) => {
                    self.duration_ms = meta.duration_ms;
                    None
                }
                PlayerEvent::PlaybackStateChanged(snapshot) => Some(snapshot.clone()),
                _ => None,
            };
            self.events.publish(event);
            if let Some(snapshot) = snapshot {
                self.reseed(&snapshot);
            }
        }
    }

    fn reseed(&mut self, snapshot: &PlaybackSnapshot) {
        let events = Arc::clone(&self.events);
        if snapshot.is_playing() {
            let duration = self.duration_ms as i64;
            self.clock.start_and_attach(
                snapshot.position_ms,
                snapshot.timestamp_ms,
                snapshot.speed,
                move |position| {
                    if duration > 0 && position >= duration {
                        events.publish(PlayerEvent::Position(duration));
                        return ControlFlow::Break(());
                    }
                    events.publish(PlayerEvent::Position(position));
                    ControlFlow::Continue(())
                },
            );
        } else {
            self.clock
                .seed(snapshot.position_ms, snapshot.timestamp_ms, 0.0);
            self.clock
                .stop_and_detach(|position| events.publish(PlayerEvent::Position(position)));
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Log and swallow a side-effect failure.
fn log_err<T, E: std::fmt::Display>(result: Result<T, E>, context: &str) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            log::warn!("sonata: {} failed: {}", context, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;
    use crate::effects::library::{LibraryProvider, TrackRecord};
    use crate::effects::{NoisyRegistration, NoopRenderer, PolicyFocus, TimedWakeLock};
    use crate::models::PlaybackStateCode;

    const WAIT: Duration = Duration::from_secs(5);

    fn catalog() -> Arc<Catalog> {
        let provider = Arc::new(LibraryProvider::new(vec![TrackRecord {
            id: "song-1".into(),
            title: "One".into(),
            artist: Some("A".into()),
            album: Some("B".into()),
            genre: Some("C".into()),
            duration_ms: 180_000,
            path: "/music/one.mp3".into(),
            date_added: 0,
            art_uri: None,
        }]));
        Arc::new(Catalog::new(provider, 5000))
    }

    fn parts() -> SessionParts {
        SessionParts {
            renderer: Arc::new(NoopRenderer::new()),
            focus: Arc::new(PolicyFocus::granting()),
            wake: Arc::new(TimedWakeLock::new()),
            noisy: Arc::new(NoisyRegistration::new()),
        }
    }

    fn wait_for(rx: &Receiver<PlayerEvent>, pred: impl Fn(&PlayerEvent) -> bool) -> PlayerEvent {
        loop {
            let event = rx.recv_timeout(WAIT).expect("event in time");
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn play_from_id_reaches_playing_and_ticks() {
        let time = ManualTime::new(10_000);
        let engine = Engine::with_time(catalog(), parts(), EngineConfig::default(), Arc::new(time.clone()));
        engine.access_granted().join().unwrap();
        let rx = engine.subscribe();
        engine.start();

        engine
            .command(TransportCommand::PlayFromId { id: "song-1".into() })
            .unwrap();
        wait_for(&rx, |e| {
            matches!(e, PlayerEvent::PlaybackStateChanged(s) if s.state == PlaybackStateCode::Playing)
        });
        assert_eq!(wait_for(&rx, |e| matches!(e, PlayerEvent::Position(_))), PlayerEvent::Position(0));

        time.advance(1000);
        engine.wake().unwrap();
        assert_eq!(
            wait_for(&rx, |e| matches!(e, PlayerEvent::Position(_))),
            PlayerEvent::Position(1000)
        );
        assert!(engine.playback_state().is_playing());
        assert_eq!(engine.now_playing().as_deref(), Some("song-1"));
        engine.shutdown();
    }

    #[test]
    fn pause_delivers_final_position() {
        let time = ManualTime::new(0);
        let engine = Engine::with_time(catalog(), parts(), EngineConfig::default(), Arc::new(time.clone()));
        engine.catalog().load_blocking();
        let rx = engine.subscribe();
        engine.start();
        engine.command(TransportCommand::PlayFromId { id: "song-1".into() }).unwrap();
        wait_for(&rx, |e| matches!(e, PlayerEvent::Position(_)));

        engine.command(TransportCommand::SeekTo { position_ms: 7000 }).unwrap();
        wait_for(&rx, |e| matches!(e, PlayerEvent::Position(7000)));
        engine.command(TransportCommand::Pause).unwrap();
        wait_for(&rx, |e| {
            matches!(e, PlayerEvent::PlaybackStateChanged(s) if s.state == PlaybackStateCode::Paused)
        });
        // NoopRenderer keeps the sought position.
        assert_eq!(wait_for(&rx, |e| matches!(e, PlayerEvent::Position(_))), PlayerEvent::Position(7000));
    }

    #[test]
    fn skips_are_refused_without_a_round_trip() {
        let engine = Engine::new(catalog(), parts(), EngineConfig::default());
        assert!(matches!(
            engine.command(TransportCommand::SkipToNext),
            Err(EngineError::Command(CommandError::Unsupported(_)))
        ));
        assert!(engine.command(TransportCommand::SkipToPrevious).is_err());
    }

    #[test]
    fn load_children_waits_for_the_gate() {
        let engine = Engine::new(catalog(), parts(), EngineConfig::default());
        let (tx, rx) = mpsc::channel();
        let immediate = engine.load_children("/songs", move |r| {
            let _ = tx.send(r.map(|nodes| nodes.len()));
        });
        assert!(!immediate);
        assert!(rx.try_recv().is_err());

        engine.access_granted().join().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), 1);

        let (tx, rx) = mpsc::channel();
        assert!(engine.load_children("/nowhere", move |r| {
            let _ = tx.send(r.is_err());
        }));
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn shutdown_is_idempotent_and_refuses_later_commands() {
        let engine = Engine::new(catalog(), parts(), EngineConfig::default());
        engine.start();
        engine.start();
        engine.shutdown();
        engine.shutdown();
        assert!(matches!(engine.command(TransportCommand::Play), Err(EngineError::ShutDown)));
        assert_eq!(engine.root_id(), "/");
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let broadcaster = Broadcaster::default();
        let keep = broadcaster.subscribe();
        drop(broadcaster.subscribe());
        broadcaster.publish(PlayerEvent::StartingPlayback);
        assert_eq!(broadcaster.subscribers.lock().len(), 1);
        assert_eq!(keep.try_recv().unwrap(), PlayerEvent::StartingPlayback);
    }
}
