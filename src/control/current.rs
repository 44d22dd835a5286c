//! Charge-current planning: the hardware level table, the stepped CC
//! ramp, and the CV setpoint offset search.

use log::debug;

/// Current levels the charger hardware can regulate (mA).
pub const CURRENT_LEVELS_MA: [u16; 16] = [
    10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 120, 140, 160, 180, 200, 240,
];

/// Ramp entry level: larger CC targets start here and step up only after
/// a voltage re-check confirms the pack is taking the current well.
pub const RAMP_FIRST_LEVEL_MA: u16 = 60;

/// Ramp increment per completed re-check.
pub const RAMP_STEP_MA: u16 = 60;

/// Snap to the highest hardware level at or below `ma` (minimum 10 mA).
pub fn snap_level(ma: u16) -> u16 {
    let mut best = CURRENT_LEVELS_MA[0];
    for &level in &CURRENT_LEVELS_MA {
        if level <= ma {
            best = level;
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Stepped CC ramp
// ---------------------------------------------------------------------------

/// Plans the constant-current level over a charge session.
///
/// Targets above [`RAMP_FIRST_LEVEL_MA`] start at the entry level and
/// [`advance`](CurrentRamp::advance) one step per completed voltage
/// re-check.  Targets at or below the entry level (or sessions already in
/// CV) go straight to the target.
pub struct CurrentRamp {
    target_ma: u16,
    level_ma: u16,
    stepping: bool,
}

impl CurrentRamp {
    pub fn new() -> Self {
        Self {
            target_ma: 0,
            level_ma: 0,
            stepping: false,
        }
    }

    /// Decide the starting level for a (re)started session.
    pub fn plan(&mut self, target_ma: u16, cv_active: bool) {
        self.target_ma = snap_level(target_ma);
        if cv_active || self.target_ma <= RAMP_FIRST_LEVEL_MA {
            self.level_ma = self.target_ma;
            self.stepping = false;
        } else {
            self.level_ma = RAMP_FIRST_LEVEL_MA;
            self.stepping = true;
        }
        debug!(
            "ramp plan: target {} mA, start {} mA",
            self.target_ma, self.level_ma
        );
    }

    /// The level to command right now.
    pub fn level(&self) -> u16 {
        self.level_ma
    }

    /// Step up after a completed voltage re-check.  Returns the new level,
    /// or `None` once the target is reached.
    pub fn advance(&mut self) -> Option<u16> {
        if !self.stepping {
            return None;
        }
        let next = snap_level(self.level_ma.saturating_add(RAMP_STEP_MA).min(self.target_ma));
        if next <= self.level_ma {
            self.stepping = false;
            return None;
        }
        self.level_ma = next;
        if next >= self.target_ma {
            self.stepping = false;
        }
        Some(next)
    }
}

impl Default for CurrentRamp {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// CV setpoint offset search
// ---------------------------------------------------------------------------

/// Direction agreement needed to call the search converged.
const CONVERGED_RUN: u8 = 3;
/// Absolute cap on search iterations.
const STEP_CEILING: u8 = 16;
/// Hardware offset field width (signed steps).
const OFFSET_LIMIT: i8 = 16;
/// Measurements this close to target need no correction.
const DEADBAND_MV: u64 = 5;

/// Bounded monotonic search for the CV setpoint correction.
///
/// Once per invocation the offset is nudged one step toward the target
/// voltage.  The search completes when the nudge direction has not
/// changed sign for [`CONVERGED_RUN`] consecutive steps, when the
/// measurement lands inside the deadband, or at the step ceiling.  A
/// completed search is cached for the rest of the charge session; stop
/// conditions are not evaluated before it completes.
pub struct CvOffsetSearch {
    offset: i8,
    steps: u8,
    last_dir: i8,
    run: u8,
    completed: bool,
}

impl CvOffsetSearch {
    pub fn new() -> Self {
        Self {
            offset: 0,
            steps: 0,
            last_dir: 0,
            run: 0,
            completed: false,
        }
    }

    /// One search iteration.  Returns the offset to program.
    pub fn step(&mut self, target_mv: u32, measured_mv: u32) -> i8 {
        if self.completed {
            return self.offset;
        }
        let diff = i64::from(target_mv) - i64::from(measured_mv);
        if diff.unsigned_abs() <= DEADBAND_MV {
            self.completed = true;
            return self.offset;
        }
        let dir: i8 = if diff > 0 { 1 } else { -1 };
        self.offset = (self.offset + dir).clamp(-OFFSET_LIMIT, OFFSET_LIMIT);
        self.steps += 1;
        if dir == self.last_dir {
            self.run += 1;
        } else {
            self.run = 1;
        }
        self.last_dir = dir;
        if self.run >= CONVERGED_RUN || self.steps >= STEP_CEILING {
            self.completed = true;
        }
        self.offset
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn offset(&self) -> i8 {
        self.offset
    }

    /// Start over; called at the beginning of each charge session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for CvOffsetSearch {
    fn default() -> Self {
        Self::new()
    }
}
