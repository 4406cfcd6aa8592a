//! Desktop RDP client pointed at a local forward.

use super::builder::{LaunchCommand, LaunchHints, Platform};
use crate::models::target::validate_port;
use crate::Result;

/// Client invocation for an RDP forward listening on `local_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdpClientCommand {
    /// Local end of the forward.
    pub local_port: u16,
    /// Host platform, selecting the client.
    pub platform: Platform,
}

impl RdpClientCommand {
    /// Client for `local_port` on `platform`.
    #[must_use]
    pub fn new(local_port: u16, platform: Platform) -> Self {
        Self {
            local_port,
            platform,
        }
    }

    /// The command that opens the client.
    ///
    /// Linux uses remmina, Windows `mstsc` and macOS hands an `rdp://` URL
    /// to `open`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for port 0.
    pub fn launch(&self) -> Result<LaunchCommand> {
        validate_port(self.local_port, "local")?;
        let port = self.local_port;
        let (program, args): (&str, Vec<String>) = match self.platform {
            Platform::Linux => (
                "remmina",
                vec![
                    "-c".into(),
                    format!("rdp://localhost:{port}"),
                    "--no-tray-icon".into(),
                ],
            ),
            Platform::Windows => ("mstsc", vec![format!("/v:localhost:{port}")]),
            Platform::MacOs => (
                "open",
                vec![format!("rdp://full%20address=s:localhost:{port}")],
            ),
        };
        Ok(LaunchCommand {
            program: program.into(),
            args,
            hints: LaunchHints {
                visible_console: true,
                shell_wrapper: false,
            },
        })
    }
}
