//! Tunnel orchestration modules.
//!
//! Covers launcher process spawning, the connection supervisor (launch,
//! reconcile, terminate) and the background reconcile monitor.

pub mod reconcile_monitor;
pub mod spawner;
pub mod supervisor;
