//! NAS Timer Management
//!
//! The engine only relies on the [`TimerService`] start/stop contract. The
//! daemon drives a [`TimerWheel`], a BTreeMap-ordered single-shot timer set
//! polled from the run loop.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::context::UeId;

/// Timer identifier handed out by the timer service
pub type TimerId = u64;

/// Time until the next expiry when no timer is armed
pub const INFINITE_TIME: Duration = Duration::MAX;

// ============================================================================
// Timer Kinds and Events
// ============================================================================

/// EMM timers driven through the timer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NasTimerKind {
    /// T3470 - Identity request sent
    T3470,
    /// Retry timer of an owning (specific) procedure
    SpecificRetry,
}

impl NasTimerKind {
    /// Get timer name
    pub fn name(&self) -> &'static str {
        match self {
            Self::T3470 => "T3470",
            Self::SpecificRetry => "SPECIFIC_RETRY",
        }
    }
}

impl fmt::Display for NasTimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload delivered when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Identifier the timer was armed with
    pub id: TimerId,
    /// Which timer
    pub kind: NasTimerKind,
    /// Subscriber the timer belongs to
    pub ue_id: UeId,
}

/// Single-shot timer service
pub trait TimerService: Send + Sync {
    /// Arm a timer and return its identifier
    fn start(&self, kind: NasTimerKind, ue_id: UeId, duration: Duration) -> TimerId;

    /// Cancel a timer. Returns false if it already fired or was stopped.
    fn stop(&self, id: TimerId) -> bool;
}

// ============================================================================
// Timer Handle
// ============================================================================

/// Timer handle owned by a procedure. `None` is the inactive sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NasTimer {
    kind: NasTimerKind,
    id: Option<TimerId>,
}

impl NasTimer {
    pub fn new(kind: NasTimerKind) -> Self {
        Self { kind, id: None }
    }

    pub fn kind(&self) -> NasTimerKind {
        self.kind
    }

    pub fn id(&self) -> Option<TimerId> {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    /// True if `id` is the identifier of the currently armed timer
    pub fn matches(&self, id: TimerId) -> bool {
        self.id == Some(id)
    }

    /// Arm the timer, cancelling any previous arming first
    pub fn start(&mut self, timers: &dyn TimerService, ue_id: UeId, duration: Duration) {
        self.stop(timers);
        self.id = Some(timers.start(self.kind, ue_id, duration));
    }

    /// Disarm the timer if active
    pub fn stop(&mut self, timers: &dyn TimerService) {
        if let Some(id) = self.id.take() {
            timers.stop(id);
        }
    }

    /// Record that the armed timer fired; the service has already dropped it
    pub fn mark_fired(&mut self) {
        self.id = None;
    }
}

// ============================================================================
// Timer Wheel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    timeout: u128, // nanoseconds since epoch
    id: TimerId,   // tie-breaker for same timeout
}

#[derive(Debug, Default)]
struct WheelInner {
    tree: BTreeMap<TimerKey, TimerEvent>,
    keys: HashMap<TimerId, TimerKey>,
    next_id: TimerId,
}

impl WheelInner {
    fn remove(&mut self, id: TimerId) -> Option<TimerEvent> {
        let key = self.keys.remove(&id)?;
        self.tree.remove(&key)
    }
}

/// Timer wheel ordered by expiry
#[derive(Debug)]
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    epoch: Instant,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WheelInner {
                next_id: 1,
                ..Default::default()
            }),
            epoch: Instant::now(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, WheelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instant_to_nanos(&self, instant: Instant) -> u128 {
        instant.saturating_duration_since(self.epoch).as_nanos()
    }

    /// Time until the next timer expires
    pub fn next(&self) -> Duration {
        let inner = self.inner();
        match inner.tree.first_key_value() {
            Some((key, _)) => {
                let now = self.instant_to_nanos(Instant::now());
                if key.timeout > now {
                    Duration::from_nanos(u64::try_from(key.timeout - now).unwrap_or(u64::MAX))
                } else {
                    Duration::ZERO
                }
            }
            None => INFINITE_TIME,
        }
    }

    /// Remove and return every timer that has expired by now
    pub fn expire(&self) -> Vec<TimerEvent> {
        self.expire_at(Instant::now())
    }

    /// Remove and return every timer expired at `now`, in expiry order
    pub fn expire_at(&self, now: Instant) -> Vec<TimerEvent> {
        let now_nanos = self.instant_to_nanos(now);
        let mut inner = self.inner();

        let expired_keys: Vec<TimerKey> = inner
            .tree
            .range(..=TimerKey { timeout: now_nanos, id: TimerId::MAX })
            .map(|(k, _)| *k)
            .collect();

        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(event) = inner.tree.remove(&key) {
                inner.keys.remove(&event.id);
                expired.push(event);
            }
        }
        expired
    }

    /// Fire one timer immediately regardless of its deadline
    pub fn fire(&self, id: TimerId) -> Option<TimerEvent> {
        self.inner().remove(id)
    }

    /// Identifier of the armed timer of `kind` for `ue_id`, if any
    pub fn pending(&self, ue_id: UeId, kind: NasTimerKind) -> Option<TimerId> {
        self.inner()
            .tree
            .values()
            .find(|event| event.ue_id == ue_id && event.kind == kind)
            .map(|event| event.id)
    }

    /// Number of armed timers
    pub fn count(&self) -> usize {
        self.inner().tree.len()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for TimerWheel {
    fn start(&self, kind: NasTimerKind, ue_id: UeId, duration: Duration) -> TimerId {
        let timeout = self.instant_to_nanos(Instant::now()) + duration.as_nanos();
        let mut inner = self.inner();

        let id = inner.next_id;
        inner.next_id += 1;

        let key = TimerKey { timeout, id };
        inner.tree.insert(key, TimerEvent { id, kind, ue_id });
        inner.keys.insert(id, key);

        log::debug!("[ue_id={}] {} started (id={}, {:?})", ue_id, kind, id, duration);
        id
    }

    fn stop(&self, id: TimerId) -> bool {
        match self.inner().remove(id) {
            Some(event) => {
                log::debug!("[ue_id={}] {} stopped (id={})", event.ue_id, event.kind, id);
                true
            }
            None => false,
        }
    }
}
