//! Platform seams: the renderer, audio focus, wake resource and the
//! becoming-noisy signal.
//!
//! The engine only talks to these traits. Every trait has a headless
//! implementation here so the engine runs (and is tested) without a device.
//! All methods take `&self`; implementations manage their own concurrency.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{FocusError, RendererError};

#[cfg(feature = "native")]
pub mod audio;
pub mod library;
pub mod scan;

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Asynchronous notification from a renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendererEvent {
    Prepared,
    BufferingStart,
    BufferingEnd,
    Error(RendererError),
    Completed,
}

/// Where renderer events go: `(generation, event)`.
pub type EventDispatch = Arc<dyn Fn(u64, RendererEvent) + Send + Sync>;

/// Handle a renderer uses to report events for one preparation attempt.
///
/// Every event is tagged with the attempt's generation so the player can drop
/// reports from attempts it has already superseded.
#[derive(Clone)]
pub struct Reporter {
    generation: u64,
    dispatch: EventDispatch,
}

impl Reporter {
    pub fn new(generation: u64, dispatch: EventDispatch) -> Self {
        Self { generation, dispatch }
    }

    /// A reporter that goes nowhere.
    pub fn detached() -> Self {
        Self::new(0, Arc::new(|_: u64, _: RendererEvent| {}))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn report(&self, event: RendererEvent) {
        (self.dispatch)(self.generation, event);
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Contract for the decode/render engine.
///
/// `prepare` must return quickly; readiness, buffering, completion and
/// failures arrive through the reporter. Implementations must not panic.
pub trait Renderer: Send + Sync {
    fn prepare(&self, uri: &str, reporter: Reporter) -> Result<(), RendererError>;
    fn start(&self);
    fn pause(&self);
    fn stop(&self);
    fn reset(&self);
    fn release(&self);
    fn seek(&self, position_ms: u64);
    fn position_ms(&self) -> u64;
}

/// Headless renderer: every source is instantly ready, position stays where
/// it was last put.
#[derive(Default)]
pub struct NoopRenderer {
    position_ms: Mutex<u64>,
}

impl NoopRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Renderer for NoopRenderer {
    fn prepare(&self, _: &str, reporter: Reporter) -> Result<(), RendererError> {
        *self.position_ms.lock() = 0;
        reporter.report(RendererEvent::Prepared);
        Ok(())
    }
    fn start(&self) {}
    fn pause(&self) {}
    fn stop(&self) {}
    fn reset(&self) {
        *self.position_ms.lock() = 0;
    }
    fn release(&self) {}
    fn seek(&self, position_ms: u64) {
        *self.position_ms.lock() = position_ms;
    }
    fn position_ms(&self) -> u64 {
        *self.position_ms.lock()
    }
}

// ---------------------------------------------------------------------------
// Audio focus
// ---------------------------------------------------------------------------

/// Outcome of a focus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusGrant {
    Granted,
    Delayed,
    Denied,
}

/// System audio focus ("may duck, accepts delayed grant").
///
/// Focus changes after the request are delivered by the platform to
/// `Engine::focus_changed`.
pub trait AudioFocus: Send + Sync {
    fn request(&self) -> Result<FocusGrant, FocusError>;
    fn abandon(&self);
}

/// Focus decided by a policy the host can change at runtime. Desktop hosts
/// leave it on `Granted`.
pub struct PolicyFocus {
    policy: AtomicU8,
}

impl PolicyFocus {
    pub fn new(policy: FocusGrant) -> Self {
        Self { policy: AtomicU8::new(encode_grant(policy)) }
    }

    pub fn granting() -> Self {
        Self::new(FocusGrant::Granted)
    }

    pub fn set_policy(&self, policy: FocusGrant) {
        self.policy.store(encode_grant(policy), Ordering::SeqCst);
    }

    pub fn policy(&self) -> FocusGrant {
        match self.policy.load(Ordering::SeqCst) {
            0 => FocusGrant::Granted,
            1 => FocusGrant::Delayed,
            _ => FocusGrant::Denied,
        }
    }
}

fn encode_grant(grant: FocusGrant) -> u8 {
    match grant {
        FocusGrant::Granted => 0,
        FocusGrant::Delayed => 1,
        FocusGrant::Denied => 2,
    }
}

impl AudioFocus for PolicyFocus {
    fn request(&self) -> Result<FocusGrant, FocusError> {
        Ok(self.policy())
    }

    fn abandon(&self) {}
}

// ---------------------------------------------------------------------------
// Wake resource
// ---------------------------------------------------------------------------

/// Keeps the device awake while audio plays.
pub trait WakeLock: Send + Sync {
    /// Acquire (or renew) for at most `timeout`.
    fn acquire(&self, timeout: Duration);
    fn release(&self);
    fn is_held(&self) -> bool;
}

/// Wake resource that only tracks its own deadline. Hosts poll `is_held` and
/// mirror it onto the platform lock.
#[derive(Default)]
pub struct TimedWakeLock {
    held_until: Mutex<Option<Instant>>,
}

impl TimedWakeLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WakeLock for TimedWakeLock {
    fn acquire(&self, timeout: Duration) {
        *self.held_until.lock() = Some(Instant::now() + timeout);
    }

    fn release(&self) {
        *self.held_until.lock() = None;
    }

    fn is_held(&self) -> bool {
        self.held_until
            .lock()
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Becoming noisy
// ---------------------------------------------------------------------------

/// Registration for the "audio becoming noisy" broadcast (headphones
/// unplugged). The signal itself reaches the engine via
/// `Engine::becoming_noisy`.
pub trait NoisyReceiver: Send + Sync {
    fn register(&self);
    fn unregister(&self);
}

/// Tracks whether the host should currently forward the noisy signal.
#[derive(Default)]
pub struct NoisyRegistration {
    registered: AtomicBool,
}

impl NoisyRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

impl NoisyReceiver for NoisyRegistration {
    fn register(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    fn unregister(&self) {
        self.registered.store(false, Ordering::SeqCst);
    }
}
