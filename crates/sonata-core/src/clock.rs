//! Position clock: interpolates the playback position between snapshots.
//!
//! The clock does not own a thread. The engine's timeline calls
//! [`PositionClock::poll`] whenever [`PositionClock::next_deadline`] passes,
//! so ticks run on the same timeline as transport commands.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Time sources
// ---------------------------------------------------------------------------

/// Millisecond wall time.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// System time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Virtual time, advanced by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    now: Arc<AtomicI64>,
}

impl ManualTime {
    pub fn new(start_ms: i64) -> Self {
        Self { now: Arc::new(AtomicI64::new(start_ms)) }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// PositionClock
// ---------------------------------------------------------------------------

/// Tick callback. Returning `ControlFlow::Break` cancels the schedule.
pub type TickFn = Box<dyn FnMut(i64) -> ControlFlow<()> + Send>;

pub struct PositionClock {
    time: Arc<dyn TimeSource>,
    interval_ms: i64,
    base_position: i64,
    base_timestamp: i64,
    speed: f32,
    on_tick: Option<TickFn>,
    /// Wall time of the next scheduled tick; `None` while stopped.
    next_due: Option<i64>,
}

impl PositionClock {
    pub fn new(time: Arc<dyn TimeSource>, interval: Duration) -> Self {
        Self {
            time,
            interval_ms: (interval.as_millis() as i64).max(1),
            base_position: 0,
            base_timestamp: 0,
            speed: 1.0,
            on_tick: None,
            next_due: None,
        }
    }

    /// Seed the clock, tick once immediately and keep ticking every interval.
    pub fn start_and_attach(
        &mut self,
        base_position: i64,
        base_timestamp: i64,
        speed: f32,
        on_tick: impl FnMut(i64) -> ControlFlow<()> + Send + 'static,
    ) {
        self.stop();
        self.base_position = base_position;
        self.base_timestamp = base_timestamp;
        self.speed = speed;
        self.on_tick = Some(Box::new(on_tick));
        self.fire();
    }

    /// Replace the seed without touching the schedule.
    pub fn seed(&mut self, base_position: i64, base_timestamp: i64, speed: f32) {
        self.base_position = base_position;
        self.base_timestamp = base_timestamp;
        self.speed = speed;
    }

    /// Deliver one final value, then stop and forget the attached callback.
    pub fn stop_and_detach(&mut self, on_final: impl FnOnce(i64)) {
        on_final(self.compute());
        self.stop();
        self.on_tick = None;
    }

    /// Resume ticking from the stored seed. The first tick is due now.
    pub fn start(&mut self) {
        if self.on_tick.is_some() {
            self.next_due = Some(self.time.now_ms());
        }
    }

    /// Pause ticking; the seed and callback are kept.
    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.next_due
    }

    /// Run the tick if it is due. Returns whether it fired.
    pub fn poll(&mut self) -> bool {
        match self.next_due {
            Some(due) if self.time.now_ms() >= due => {
                self.fire();
                true
            }
            _ => false,
        }
    }

    /// `base + (now - base_timestamp) * speed`
    pub fn compute(&self) -> i64 {
        let elapsed = self.time.now_ms() - self.base_timestamp;
        self.base_position + (elapsed as f64 * self.speed as f64) as i64
    }

    fn fire(&mut self) {
        let value = self.compute();
        // Reschedule before the callback so a Break from it wins.
        self.next_due = Some(self.time.now_ms() + self.interval_ms);
        if let Some(on_tick) = self.on_tick.as_mut() {
            if on_tick(value).is_break() {
                self.next_due = None;
            }
        }
    }
}
