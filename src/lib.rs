pub mod config;
pub mod db;
mod error;
pub mod logging;
pub mod merge;

pub use config::{DependentTableSpec, MergeConfig, MergeTables, PrimaryTableSpec};
pub use error::{AppError, AppResult};
pub use merge::report::{MergeReport, MergeStatus};
pub use merge::{plan_merge, run_merge, MergePlan};
