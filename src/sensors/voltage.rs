//! Battery voltage pipeline.
//!
//! Raw ADC samples land in a fixed ring every 100 ms.  A *real* voltage
//! is only computed over a window taken while the charger is disabled
//! (the relaxed pack), using an 80th-percentile pick that rejects the
//! charger-inflated top of the distribution.  Accepted reports then pass
//! a monotonicity rule so the displayed value never jitters backwards.

use log::debug;

/// Sample cadence (every 2nd control tick).
pub const SAMPLE_PERIOD_MS: u32 = 100;

/// Ring capacity: 3 s of history at the sample cadence.
pub const SAMPLE_RING_CAP: usize = 30;

const SAMPLES_PER_SEC: usize = (1000 / SAMPLE_PERIOD_MS) as usize;

/// Plausible single-cell bounds; anything outside is a bad conversion.
pub const SAMPLE_VALID_MIN_MV: u16 = 2200;
pub const SAMPLE_VALID_MAX_MV: u16 = 4800;

/// A persisted boot seed further than this from the first real
/// measurement is considered stale and discarded.
pub const PERSIST_SEED_DIFF_MAX_MV: u32 = 400;

/// ADC counts to millivolts for the battery divider.
pub fn raw_to_mv(raw: u16) -> u32 {
    u32::from(raw) * 300 / 1024
}

/// Inverse conversion, used by tests and the OVP threshold comparison.
pub fn mv_to_raw(mv: u32) -> u16 {
    (mv * 1024 / 300) as u16
}

// ---------------------------------------------------------------------------
// Sample ring + percentile filter
// ---------------------------------------------------------------------------

/// Fixed ring of recent battery samples (millivolts).
pub struct VoltageSampler {
    ring: [u16; SAMPLE_RING_CAP],
    head: usize,
    count: usize,
}

impl Default for VoltageSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl VoltageSampler {
    pub fn new() -> Self {
        Self {
            ring: [0; SAMPLE_RING_CAP],
            head: 0,
            count: 0,
        }
    }

    /// Push one converted sample; out-of-range conversions are dropped.
    pub fn push(&mut self, mv: u16) {
        if !(SAMPLE_VALID_MIN_MV..=SAMPLE_VALID_MAX_MV).contains(&mv) {
            debug!("voltage sample {} mv out of range, dropped", mv);
            return;
        }
        self.ring[self.head] = mv;
        self.head = (self.head + 1) % SAMPLE_RING_CAP;
        self.count = (self.count + 1).min(SAMPLE_RING_CAP);
    }

    /// Number of valid samples currently held.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 80th-percentile pick over the most recent `seconds` of samples.
    ///
    /// Returns `None` when fewer samples than the window needs are
    /// available.  The window is sorted ascending and the value at rank
    /// `n * 4 / 5 - 1` returned, rejecting the highest ~20 % which carry
    /// charger-induced inflation.
    pub fn windowed_percentile(&self, seconds: u16) -> Option<u32> {
        let n = seconds as usize * SAMPLES_PER_SEC;
        if n == 0 || n > self.count {
            return None;
        }
        let mut window: heapless::Vec<u16, SAMPLE_RING_CAP> = heapless::Vec::new();
        for i in 0..n {
            let idx = (self.head + SAMPLE_RING_CAP - n + i) % SAMPLE_RING_CAP;
            let _ = window.push(self.ring[idx]);
        }
        window.sort_unstable();
        let rank = n * 4 / 5 - 1;
        Some(u32::from(window[rank]))
    }

    /// Drop all history (suspend/resume, post-fault).
    pub fn reset(&mut self) {
        self.head = 0;
        self.count = 0;
    }
}

// ---------------------------------------------------------------------------
// Monotonic accept rule
// ---------------------------------------------------------------------------

/// Tracks the externally reported voltage.
///
/// While a charge session is running (and the battery is believed
/// present) the report may only rise; otherwise it may only fall.  This
/// keeps the user-visible gauge from bouncing as load and charger state
/// shift between measurements.
pub struct VoltageReport {
    reported: Option<u32>,
}

impl Default for VoltageReport {
    fn default() -> Self {
        Self::new()
    }
}

impl VoltageReport {
    pub fn new() -> Self {
        Self { reported: None }
    }

    /// Feed a fresh measurement through the monotonicity rule and return
    /// the value to report.
    pub fn accept(&mut self, candidate: u32, charge_session: bool, battery_present: bool) -> u32 {
        let v = match self.reported {
            None => candidate,
            Some(prev) => {
                if charge_session && battery_present {
                    prev.max(candidate)
                } else {
                    prev.min(candidate)
                }
            }
        };
        self.reported = Some(v);
        v
    }

    /// Last reported value, if any measurement has completed.
    pub fn current(&self) -> Option<u32> {
        self.reported
    }

    /// Choose between the persisted boot seed and the first real
    /// measurement: the seed wins only when plausibly fresh.
    pub fn reconcile_seed(persisted_mv: u32, first_real_mv: u32) -> u32 {
        if persisted_mv.abs_diff(first_real_mv) <= PERSIST_SEED_DIFF_MAX_MV {
            persisted_mv
        } else {
            first_real_mv
        }
    }
}

// ---------------------------------------------------------------------------
// Capacity mapping
// ---------------------------------------------------------------------------

/// Map a reported voltage to percent via the 11-entry level table
/// (0, 10, .. 100 %), interpolating linearly inside a segment.
pub fn capacity_percent(mv: u32, table: &[u16; 11]) -> u8 {
    if mv <= u32::from(table[0]) {
        return 0;
    }
    if mv >= u32::from(table[10]) {
        return 100;
    }
    for i in 0..10 {
        let lo = u32::from(table[i]);
        let hi = u32::from(table[i + 1]);
        if mv < hi {
            let frac = (mv - lo) * 10 / (hi - lo);
            return (i as u32 * 10 + frac) as u8;
        }
    }
    100
}
