//! `cronkeeper-core` — configuration and error types shared by every
//! cronkeeper crate.

pub mod config;
pub mod error;

pub use config::{CronkeeperConfig, DatabaseConfig, SchedulerConfig};
pub use error::{CoreError, Result};
