//! Closed-loop control building blocks: debounce windows, CV stage
//! classification, and constant-current ramp / CV offset search.

pub mod current;
pub mod cv_stage;
pub mod debounce;
