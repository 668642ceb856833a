//! Host-side driver for a whole tree.

mod runner;
pub mod shutdown;

pub use runner::{check, run, RunOptions, ShutdownOptions};
