//! Battery measurement pipelines: voltage sample ring with percentile
//! filtering, and charge-current averaging.

pub mod current;
pub mod voltage;
