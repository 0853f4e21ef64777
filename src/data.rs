mod config_detector;
mod filesystem_access;
mod snapshot;
mod time_calc;
mod training_schedule;

pub use config_detector::*;
pub use filesystem_access::FsAccess;
pub use snapshot::*;
pub use time_calc::TimeCalc;
pub use training_schedule::TrainingSchedule;

pub(crate) const CROSS_MARK: &str = "❌";
