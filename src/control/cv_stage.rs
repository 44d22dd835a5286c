//! Constant-voltage stage detection.
//!
//! While the charger chip regulates in CV mode the charge current tapers;
//! how far it has tapered tells us how close the pack is to full.  Stages:
//!
//! - 0: chip still in CC regulation (or current above half the setpoint)
//! - 1: CV, current below ~50 % of the CC setpoint
//! - 2: CV, current below ~20 % of the CC setpoint (taper nearly done)
//!
//! Instantaneous readings are noisy, so stage samples are pushed into a
//! fixed sliding window once per second and a stage is only *believed*
//! when every slot in the full window agrees.

use heapless::Vec;
use log::info;

/// Sliding window length (seconds of agreement required).
pub const CV_WINDOW_SLOTS: usize = 8;

/// Small CC setpoints taper so slowly that stage 2 may never classify;
/// promote a long-held stage 1 instead.
const LOW_CC_ESCALATE_MA: u16 = 80;
const STAGE1_ESCALATE_MS: u64 = 3_600_000;

/// Hard cap on time spent in stage 2 before charge is forced to terminate.
const STAGE2_LIMIT_MS: u64 = 3_600_000;

/// Classify one instantaneous reading against the CC setpoint.
pub fn stage_for(cc_mode: bool, current_ma: u16, setpoint_ma: u16) -> u8 {
    if cc_mode || setpoint_ma == 0 {
        return 0;
    }
    let pct = u32::from(current_ma) * 100 / u32::from(setpoint_ma);
    if pct < 20 {
        2
    } else if pct < 50 {
        1
    } else {
        0
    }
}

/// Windowed CV stage tracker with escalation timers.
pub struct CvTracker {
    window: Vec<u8, CV_WINDOW_SLOTS>,
    stage: u8,
    stage1_since_ms: Option<u64>,
    stage2_since_ms: Option<u64>,
}

impl Default for CvTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CvTracker {
    pub fn new() -> Self {
        Self {
            window: Vec::new(),
            stage: 0,
            stage1_since_ms: None,
            stage2_since_ms: None,
        }
    }

    /// Push one 1 Hz sample and return the current believed stage.
    ///
    /// The believed stage only moves when the full window agrees; until
    /// then the previous belief stands.
    pub fn update(&mut self, now_ms: u64, cc_mode: bool, current_ma: u16, setpoint_ma: u16) -> u8 {
        if self.window.len() == CV_WINDOW_SLOTS {
            self.window.remove(0);
        }
        let _ = self.window.push(stage_for(cc_mode, current_ma, setpoint_ma));

        let Some(agreed) = self.classify() else {
            return self.stage;
        };

        let mut stage = agreed;
        match stage {
            0 => {
                self.stage1_since_ms = None;
                self.stage2_since_ms = None;
            }
            1 => {
                let since = *self.stage1_since_ms.get_or_insert(now_ms);
                if setpoint_ma <= LOW_CC_ESCALATE_MA
                    && now_ms.saturating_sub(since) >= STAGE1_ESCALATE_MS
                {
                    info!("CV: low-CC pack held stage 1 too long, escalating to stage 2");
                    stage = 2;
                }
            }
            _ => {}
        }
        if stage == 2 && self.stage2_since_ms.is_none() {
            self.stage2_since_ms = Some(now_ms);
            info!("CV: stage 2 (deep taper) begins");
        }

        self.stage = stage;
        stage
    }

    /// Window consensus: `None` until the window is full, stage 0 unless
    /// every slot agrees.
    fn classify(&self) -> Option<u8> {
        if self.window.len() < CV_WINDOW_SLOTS {
            return None;
        }
        let first = self.window[0];
        if self.window.iter().all(|s| *s == first) {
            Some(first)
        } else {
            Some(0)
        }
    }

    /// Current believed stage (0, 1 or 2).
    pub fn stage(&self) -> u8 {
        self.stage
    }

    /// When stage 2 began, if it has.
    pub fn stage2_since(&self) -> Option<u64> {
        self.stage2_since_ms
    }

    /// True once stage 2 has run past its hard time cap.
    pub fn stage2_over_limit(&self, now_ms: u64) -> bool {
        self.stage2_since_ms
            .is_some_and(|t| now_ms.saturating_sub(t) >= STAGE2_LIMIT_MS)
    }

    /// Forget everything; called when a charge session starts or ends.
    pub fn reset(&mut self) {
        self.window.clear();
        self.stage = 0;
        self.stage1_since_ms = None;
        self.stage2_since_ms = None;
    }
}
