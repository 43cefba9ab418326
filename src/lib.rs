#[macro_use]
extern crate tracing;

pub mod config;
pub mod manager;
pub mod providers;
pub mod relabel;
pub mod target;
pub mod target_set;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, JobConfig, validate_jobs};
pub use discovery::{LabelSet, TargetGroup};
pub use manager::TargetManager;
pub use target::{ResolveError, Target, populate_labels};
pub use target_set::TargetSet;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;
