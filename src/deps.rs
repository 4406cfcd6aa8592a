//! Local tool check for the session launcher and its plugin.

use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

/// Reported when a tool binary cannot be run.
pub const NOT_INSTALLED: &str = "Not Installed";
/// Reported when a tool runs but its version cannot be read.
pub const UNKNOWN: &str = "Unknown";

const PLUGIN_EXECUTABLE: &str = "session-manager-plugin";

/// Installed versions of the external tools tunnels depend on.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DependencyReport {
    /// Launcher CLI version.
    pub awscli: String,
    /// Session Manager plugin version.
    pub session_manager_plugin: String,
}

impl DependencyReport {
    /// Whether both tools are present.
    #[must_use]
    pub fn installed(&self) -> bool {
        self.awscli != NOT_INSTALLED && self.session_manager_plugin != NOT_INSTALLED
    }
}

/// Run `<launcher> --version` and `session-manager-plugin --version`.
pub async fn check_dependencies(launcher: &str) -> DependencyReport {
    let awscli = match version_output(launcher).await {
        Some(out) => parse_awscli_version(&out).unwrap_or_else(|| UNKNOWN.into()),
        None => NOT_INSTALLED.into(),
    };
    let session_manager_plugin = match version_output(PLUGIN_EXECUTABLE).await {
        Some(out) => parse_plugin_version(&out).unwrap_or_else(|| UNKNOWN.into()),
        None => NOT_INSTALLED.into(),
    };

    let report = DependencyReport {
        awscli,
        session_manager_plugin,
    };
    info!(
        awscli = %report.awscli,
        plugin = %report.session_manager_plugin,
        "dependency check complete"
    );
    report
}

async fn version_output(program: &str) -> Option<String> {
    let output = match Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            warn!(program, %err, "tool not found");
            return None;
        }
    };
    if !output.status.success() {
        warn!(program, status = %output.status, "version command failed");
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Some(text)
}

/// Extract `X.Y.Z` from `aws-cli/X.Y.Z Python/...`.
#[must_use]
pub fn parse_awscli_version(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"aws-cli/([0-9.]+)").ok())
        .as_ref()?
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_owned())
}

/// First `X.Y.Z` in the plugin's version output.
#[must_use]
pub fn parse_plugin_version(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\d+\.\d+\.\d+(?:\.\d+)?").ok())
        .as_ref()?
        .find(output)
        .map(|m| m.as_str().to_owned())
}
