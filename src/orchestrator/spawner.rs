//! External launcher process spawner.
//!
//! Tunnels outlive the handle that started them: children are spawned
//! without `kill_on_drop` and the handle is dropped right away. Tokio reaps
//! exited children in the background.

use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::command::LaunchCommand;
use crate::{AppError, Result};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Starts launch commands on the host.
pub trait Launcher: Send + Sync {
    /// Spawn `command` detached, returning the spawned pid when known.
    ///
    /// The spawned pid is often a wrapper, not the tunnel process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the OS refuses to start the program.
    fn spawn(&self, command: &LaunchCommand) -> Result<Option<u32>>;
}

/// Spawns launch commands with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn spawn(&self, command: &LaunchCommand) -> Result<Option<u32>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        if !command.hints.visible_console {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            #[cfg(windows)]
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd.spawn().map_err(|err| {
            AppError::Process(format!("failed to spawn {}: {err}", command.program))
        })?;
        let pid = child.id();

        info!(
            program = %command.program,
            pid = pid.unwrap_or(0),
            visible = command.hints.visible_console,
            wrapped = command.hints.shell_wrapper,
            "launcher process spawned"
        );
        Ok(pid)
    }
}
