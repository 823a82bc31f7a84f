//! Time sources and cross-process clock reconciliation.
//!
//! Each process has two clocks: a monotonic one (milliseconds since the
//! process started, like a browser's `performance.now()`) used for every
//! latency figure, and a wall clock (Unix epoch milliseconds) used only for
//! milestone stamps and report file names.

use std::time::Instant;

/// Milliseconds as carried on the wire.
pub type Millis = f64;

pub trait Clock {
    /// Monotonic milliseconds in this process's own clock domain.
    fn monotonic_ms(&self) -> Millis;
    /// Unix epoch milliseconds.
    fn wall_ms(&self) -> Millis;
}

/// The process clock. Monotonic time counts from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> Millis {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    fn wall_ms(&self) -> Millis {
        chrono::Utc::now().timestamp_millis() as f64
    }
}

/// Result of trying to express an origin timestamp in the local domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciled {
    /// Offset known; value is the origin timestamp in local milliseconds
    Local(Millis),
    /// Offset undefined for this session; the sample must be suppressed
    Unavailable,
}

impl Reconciled {
    pub fn value(self) -> Option<Millis> {
        match self {
            Reconciled::Local(v) => Some(v),
            Reconciled::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Anchor {
    Unset,
    Offset(Millis),
    /// The first observation lacked an origin timestamp
    Undefined,
}

/// Maps one remote clock onto the local monotonic clock.
///
/// The offset is fixed by the first observation of a session and never
/// re-synchronised, so drift between the two clocks shows up as a slow
/// trend in the derived samples.
#[derive(Debug, Clone)]
pub struct ClockReconciler {
    anchor: Anchor,
}

impl ClockReconciler {
    pub fn new() -> Self {
        Self {
            anchor: Anchor::Unset,
        }
    }

    /// Feed one observation: the remote stamp (if the remote sent one) and
    /// the local monotonic time it was observed at.
    ///
    /// The first call decides the offset for the rest of the session.
    pub fn observe(&mut self, origin: Option<Millis>, local_now: Millis) -> Reconciled {
        if self.anchor == Anchor::Unset {
            self.anchor = match origin {
                Some(origin) if origin.is_finite() => Anchor::Offset(local_now - origin),
                _ => Anchor::Undefined,
            };
        }
        match origin {
            Some(origin) => self.to_local(origin),
            None => Reconciled::Unavailable,
        }
    }

    /// Express an origin timestamp in local milliseconds.
    pub fn to_local(&self, origin: Millis) -> Reconciled {
        match self.anchor {
            Anchor::Offset(offset) => Reconciled::Local(origin + offset),
            Anchor::Unset | Anchor::Undefined => Reconciled::Unavailable,
        }
    }

    /// Local-domain transit for an observation: how much later than the
    /// anchored relationship this stamp arrived. Zero for the anchor itself.
    pub fn transit(&mut self, origin: Option<Millis>, local_now: Millis) -> Option<Millis> {
        self.observe(origin, local_now)
            .value()
            .map(|expected| local_now - expected)
    }

    pub fn offset(&self) -> Option<Millis> {
        match self.anchor {
            Anchor::Offset(offset) => Some(offset),
            _ => None,
        }
    }

    /// Forget the anchor; the next observation starts a new session.
    pub fn reset(&mut self) {
        self.anchor = Anchor::Unset;
    }
}

impl Default for ClockReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_fixes_offset() {
        let mut rec = ClockReconciler::new();
        assert_eq!(rec.observe(Some(100.0), 5100.0), Reconciled::Local(5100.0));
        assert_eq!(rec.offset(), Some(5000.0));
        // Later stamps use the same offset, no re-sync
        assert_eq!(rec.observe(Some(250.0), 5400.0), Reconciled::Local(5250.0));
        assert_eq!(rec.offset(), Some(5000.0));
    }

    #[test]
    fn test_transit_is_relative_to_anchor() {
        let mut rec = ClockReconciler::new();
        assert_eq!(rec.transit(Some(0.0), 1000.0), Some(0.0));
        assert_eq!(rec.transit(Some(150.0), 1150.0), Some(0.0));
        assert_eq!(rec.transit(Some(300.0), 1312.5), Some(12.5));
    }

    #[test]
    fn test_missing_first_origin_suppresses_session() {
        let mut rec = ClockReconciler::new();
        assert_eq!(rec.observe(None, 10.0), Reconciled::Unavailable);
        // Later chunks carry a stamp, but the offset stays undefined
        assert_eq!(rec.observe(Some(20.0), 30.0), Reconciled::Unavailable);
        assert_eq!(rec.transit(Some(40.0), 50.0), None);
        assert_eq!(rec.offset(), None);
    }

    #[test]
    fn test_reset_starts_new_session() {
        let mut rec = ClockReconciler::new();
        rec.observe(None, 0.0);
        rec.reset();
        assert_eq!(rec.observe(Some(10.0), 15.0), Reconciled::Local(15.0));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
        assert!(clock.wall_ms() > 0.0);
    }
}
