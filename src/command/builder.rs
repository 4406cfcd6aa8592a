//! Builds the external launch command, its process-table search signature
//! and the platform launch hints. Pure construction, no side effects.

use std::path::Path;

use super::{session_args, SessionSpec};
use crate::config::LauncherConfig;
use crate::models::connection::ConnectionMethod;
use crate::models::target::{
    validate_port, validate_profile, validate_region, validate_remote_host, validate_target_id,
};
use crate::process::ProcessInfo;
use crate::{AppError, Result};

/// Host platform, selecting console and wrapper conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux desktop.
    Linux,
    /// macOS.
    MacOs,
    /// Windows.
    Windows,
}

impl Platform {
    /// Platform this binary was compiled for.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }
}

/// How the launch command should be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchHints {
    /// Run in a visible console window instead of hidden in the background.
    pub visible_console: bool,
    /// The launcher runs inside a shell or console wrapper, so the spawned
    /// pid is not the tunnel's pid.
    pub shell_wrapper: bool,
}

/// Program and argv to hand to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Console and wrapper hints.
    pub hints: LaunchHints,
}

/// Identifies the real launcher process in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSignature {
    /// Normalised executable name (lowercase, no `.exe`).
    pub executable: String,
    /// Command-line fragment unique to this invocation.
    pub fragment: String,
}

impl SearchSignature {
    /// Whether `process` is the launcher with this invocation's fragment.
    #[must_use]
    pub fn matches(&self, process: &ProcessInfo) -> bool {
        executable_matches(&process.name, &self.executable)
            && process
                .command_line()
                .to_lowercase()
                .contains(&self.fragment.to_lowercase())
    }
}

/// Output of [`CommandBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    /// Launcher arguments, unwrapped.
    pub session_args: Vec<String>,
    /// What actually gets spawned.
    pub launch: LaunchCommand,
    /// Signature for PID discovery.
    pub signature: SearchSignature,
}

/// Normalised executable name for comparisons.
#[must_use]
pub fn normalize_executable(name: &str) -> String {
    let file = Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(name)
        .to_lowercase();
    file.strip_suffix(".exe").map_or_else(|| file.clone(), str::to_owned)
}

/// Whether a process name is the expected (normalised) executable.
#[must_use]
pub fn executable_matches(process_name: &str, expected: &str) -> bool {
    normalize_executable(process_name) == expected
}

/// Builds session commands for one launcher on one platform.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    executable: String,
    terminal: String,
    platform: Platform,
}

impl CommandBuilder {
    /// Builder for the configured launcher on `platform`.
    #[must_use]
    pub fn new(launcher: &LauncherConfig, platform: Platform) -> Self {
        Self {
            executable: launcher.executable.clone(),
            terminal: launcher.terminal.clone(),
            platform,
        }
    }

    /// Normalised launcher name as it appears in the process table.
    #[must_use]
    pub fn process_name(&self) -> String {
        normalize_executable(&self.executable)
    }

    /// Validate `spec` and produce the launch command and search signature.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the target id, region, profile,
    /// remote host or ports are malformed, if a forwarding method lacks its
    /// ports, or if the reason tag is missing.
    pub fn build(&self, spec: &SessionSpec) -> Result<SessionCommand> {
        validate_request(spec)?;
        if spec.method.is_forwarding() {
            let local = spec.local_port.ok_or_else(|| {
                AppError::Validation(format!("{} requires a local port", spec.method))
            })?;
            validate_port(local, "local")?;
        }

        let reason = spec
            .reason
            .clone()
            .ok_or_else(|| AppError::Validation("reason tag is required".into()))?;
        let session_args = session_args(spec);
        let launch = self.wrap(&session_args, spec.method);

        Ok(SessionCommand {
            session_args,
            launch,
            signature: SearchSignature {
                executable: self.process_name(),
                fragment: format!("--reason {reason}"),
            },
        })
    }

    fn wrap(&self, session_args: &[String], method: ConnectionMethod) -> LaunchCommand {
        let visible = !method.is_forwarding();
        let mut tokens = vec![self.executable.clone()];
        tokens.extend(session_args.iter().cloned());

        match (self.platform, visible) {
            (Platform::Linux, true) => LaunchCommand {
                program: self.terminal.clone(),
                args: vec![
                    "--".into(),
                    "bash".into(),
                    "-c".into(),
                    shell_join(&tokens, self.platform),
                ],
                hints: LaunchHints {
                    visible_console: true,
                    shell_wrapper: true,
                },
            },
            (Platform::MacOs, true) => LaunchCommand {
                program: "osascript".into(),
                args: vec![
                    "-e".into(),
                    format!(
                        "tell application \"Terminal\" to do script \"{}\"",
                        shell_join(&tokens, self.platform).replace('"', "\\\"")
                    ),
                ],
                hints: LaunchHints {
                    visible_console: true,
                    shell_wrapper: true,
                },
            },
            (Platform::Windows, true) => {
                let mut args: Vec<String> =
                    vec!["/c".into(), "start".into(), "cmd".into(), "/k".into()];
                args.extend(tokens);
                LaunchCommand {
                    program: "cmd".into(),
                    args,
                    hints: LaunchHints {
                        visible_console: true,
                        shell_wrapper: true,
                    },
                }
            }
            (Platform::Windows, false) => LaunchCommand {
                program: "powershell".into(),
                args: vec![
                    "-WindowStyle".into(),
                    "Hidden".into(),
                    "-Command".into(),
                    shell_join(&tokens, self.platform),
                ],
                hints: LaunchHints {
                    visible_console: false,
                    shell_wrapper: true,
                },
            },
            (Platform::Linux | Platform::MacOs, false) => LaunchCommand {
                program: self.executable.clone(),
                args: session_args.to_vec(),
                hints: LaunchHints {
                    visible_console: false,
                    shell_wrapper: false,
                },
            },
        }
    }
}

/// Validate a launch request before a local port is assigned.
///
/// Checks target id, region, profile, remote port and remote host; the
/// local port, when present, must be non-zero.
///
/// # Errors
///
/// Returns `AppError::Validation` describing the first bad field.
pub fn validate_request(spec: &SessionSpec) -> Result<()> {
    validate_target_id(&spec.target_id)?;
    let region = spec
        .region
        .as_deref()
        .ok_or_else(|| AppError::Validation("region is required".into()))?;
    validate_region(region)?;
    let profile = spec
        .profile
        .as_deref()
        .ok_or_else(|| AppError::Validation("profile is required".into()))?;
    validate_profile(profile)?;

    if !spec.method.is_forwarding() {
        if spec.local_port.is_some() || spec.remote_port.is_some() || spec.remote_host.is_some() {
            return Err(AppError::Validation(
                "interactive shells take no ports or remote host".into(),
            ));
        }
        return Ok(());
    }

    let remote = spec.remote_port.ok_or_else(|| {
        AppError::Validation(format!("{} requires a remote port", spec.method))
    })?;
    validate_port(remote, "remote")?;
    if let Some(local) = spec.local_port {
        validate_port(local, "local")?;
    }

    match (spec.method, spec.remote_host.as_deref()) {
        (ConnectionMethod::RemoteHostPortForward, Some(host)) => validate_remote_host(host),
        (ConnectionMethod::RemoteHostPortForward, None) => Err(AppError::Validation(
            "remote-host-port-forward requires a remote host".into(),
        )),
        (_, Some(_)) => Err(AppError::Validation(format!(
            "{} does not take a remote host",
            spec.method
        ))),
        (_, None) => Ok(()),
    }
}

/// Join tokens into one shell command line, quoting tokens with whitespace.
fn shell_join(tokens: &[String], platform: Platform) -> String {
    let mut quoted_head = false;
    let parts: Vec<String> = tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            if !token.chars().any(char::is_whitespace) {
                return token.clone();
            }
            if i == 0 {
                quoted_head = true;
            }
            match platform {
                Platform::Windows => format!("'{}'", token.replace('\'', "''")),
                Platform::Linux | Platform::MacOs => {
                    format!("'{}'", token.replace('\'', "'\\''"))
                }
            }
        })
        .collect();
    let line = parts.join(" ");
    if quoted_head && platform == Platform::Windows {
        format!("& {line}")
    } else {
        line
    }
}
