//! All-slots-agree debounce window.
//!
//! A shift window of the last `depth` raw observations.  A new value is
//! accepted only when the window is full and **every** slot agrees on it;
//! a single dissenting sample restarts the wait.  Used for adapter
//! presence (sampled every tick) and the NTC temperature band (sampled
//! at 1 s cadence).

use heapless::Vec;

/// Debouncer over any small `Copy + PartialEq` value.
///
/// `N` is the compile-time window capacity; the runtime `depth` (derived
/// from config) may use fewer slots but never more.
pub struct Debouncer<T: Copy + PartialEq, const N: usize> {
    window: Vec<T, N>,
    depth: usize,
    accepted: T,
}

impl<T: Copy + PartialEq, const N: usize> Debouncer<T, N> {
    /// `depth` is clamped to `1..=N`.
    pub fn new(depth: usize, initial: T) -> Self {
        Self {
            window: Vec::new(),
            depth: depth.clamp(1, N),
            accepted: initial,
        }
    }

    /// Feed one raw observation.  Returns `Some(new)` exactly once per
    /// accepted change.
    pub fn update(&mut self, raw: T) -> Option<T> {
        if self.window.len() == self.depth {
            self.window.remove(0);
        }
        // Capacity is guaranteed by the removal above.
        let _ = self.window.push(raw);

        if self.window.len() < self.depth || raw == self.accepted {
            return None;
        }
        if self.window.iter().all(|v| *v == raw) {
            self.accepted = raw;
            Some(raw)
        } else {
            None
        }
    }

    /// The last accepted (debounced) value.
    pub fn value(&self) -> T {
        self.accepted
    }

    /// Drop pending observations, keeping the accepted value.  Called on
    /// resume so stale pre-suspend samples cannot vote.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}
