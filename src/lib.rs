#![forbid(unsafe_code)]

//! Launch, discover and supervise Session Manager tunnels.
//!
//! The [`orchestrator::supervisor::Supervisor`] owns the lifecycle; the
//! registry under [`persistence`] is its restart-durable record of every
//! active tunnel.

pub mod command;
pub mod config;
pub mod deps;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod ports;
pub mod process;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
