//! Process table adapter.
//!
//! The supervisor only sees the OS through [`ProcessTable`]; production
//! uses [`system::SystemProcessTable`], tests substitute an in-memory table.

pub mod system;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

pub use system::SystemProcessTable;

/// One live OS process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: u32,
    /// Parent process id, when known.
    pub parent_pid: Option<u32>,
    /// Executable name as reported by the OS.
    pub name: String,
    /// Full argv, including argv\[0\].
    pub args: Vec<String>,
    /// Start time in seconds since the Unix epoch.
    pub start_time: u64,
}

impl ProcessInfo {
    /// Argv joined with single spaces.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Enumerates and terminates OS processes.
///
/// Both calls may block; async callers run them on the blocking pool.
pub trait ProcessTable: Send + Sync {
    /// Snapshot of all live processes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the process table cannot be read.
    fn list_processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Terminate `pid` and its descendants: children first, then the root,
    /// wait up to `grace`, then force-kill survivors.
    ///
    /// Returns `true` when nothing in the tree survives. A process that is
    /// already gone counts as terminated.
    fn terminate_tree(&self, pid: u32, grace: Duration) -> bool;
}
