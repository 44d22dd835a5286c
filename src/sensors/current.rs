//! Charge-current averaging.
//!
//! The chip's instantaneous current reading is sampled once per second
//! while the charge path is enabled.  Stop-by-current decisions use the
//! ring average rather than any single reading.

/// Ring capacity (seconds of history).
pub const CURRENT_RING_CAP: usize = 8;

pub struct CurrentMonitor {
    ring: [u16; CURRENT_RING_CAP],
    head: usize,
    count: usize,
}

impl Default for CurrentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentMonitor {
    pub fn new() -> Self {
        Self {
            ring: [0; CURRENT_RING_CAP],
            head: 0,
            count: 0,
        }
    }

    /// Push one 1 Hz reading.  Zero readings (charge path just gated off,
    /// measurement gap) are skipped so they cannot drag the average down.
    pub fn push(&mut self, ma: u16) {
        if ma == 0 {
            return;
        }
        self.ring[self.head] = ma;
        self.head = (self.head + 1) % CURRENT_RING_CAP;
        self.count = (self.count + 1).min(CURRENT_RING_CAP);
    }

    /// Ring average; 0 until the first nonzero sample.
    pub fn average(&self) -> u16 {
        if self.count == 0 {
            return 0;
        }
        let sum: u32 = self.ring[..self.count.min(CURRENT_RING_CAP)]
            .iter()
            .map(|&v| u32::from(v))
            .sum();
        (sum / self.count as u32) as u16
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.count = 0;
    }
}
