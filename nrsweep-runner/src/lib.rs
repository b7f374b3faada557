//! nrsweep runner: sweep orchestration on top of `nrsweep-core`.
//!
//! - TOML sweep configuration and the built-in NR presets
//! - Shell executor for the simulator, with optional per-run timeout
//! - Sweep driver for random and exhaustive sweeps, with progress and cancellation

pub mod config;
pub mod driver;
pub mod executor;

pub use config::{ConfigError, SweepConfig, PRESET_NAMES};
pub use driver::{FailedTrial, FailureKind, SweepDriver, SweepError, SweepMode, SweepProgress, SweepReport};
pub use executor::{ExecutionError, RunExecutor, RunOutput, ShellExecutor};
