//! Global configuration parsing and validation.
//!
//! Every section of `config.toml` is optional; a missing file yields the
//! defaults. The parsed [`GlobalConfig`] is also the preferences source for
//! the port allocator (port range and sticky ports).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::ports::Preferences;
use crate::{AppError, Result};

/// Local port range probed for ephemeral forwards.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PortsConfig {
    /// First port of the range, inclusive.
    #[serde(default = "default_port_start")]
    pub start: u16,
    /// Last port of the range, inclusive.
    #[serde(default = "default_port_end")]
    pub end: u16,
    /// Maximum candidates probed per allocation.
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    /// Connect timeout for a single probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_port_start() -> u16 {
    60000
}

fn default_port_end() -> u16 {
    65535
}

fn default_probe_attempts() -> u32 {
    20
}

fn default_probe_timeout_ms() -> u64 {
    250
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            probe_attempts: default_probe_attempts(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// External session launcher settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LauncherConfig {
    /// Launcher executable (`aws` / `aws.exe`).
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Terminal emulator used for visible consoles on Linux.
    #[serde(default = "default_terminal")]
    pub terminal: String,
}

fn default_executable() -> String {
    if cfg!(windows) {
        "aws.exe".into()
    } else {
        "aws".into()
    }
}

fn default_terminal() -> String {
    "gnome-terminal".into()
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            terminal: default_terminal(),
        }
    }
}

/// PID discovery polling after a launch.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DiscoveryConfig {
    /// Number of process-table scans before giving up.
    #[serde(default = "default_discovery_attempts")]
    pub attempts: u32,
    /// Delay between scans.
    #[serde(default = "default_discovery_delay_ms")]
    pub delay_ms: u64,
}

fn default_discovery_attempts() -> u32 {
    10
}

fn default_discovery_delay_ms() -> u64 {
    1000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            attempts: default_discovery_attempts(),
            delay_ms: default_discovery_delay_ms(),
        }
    }
}

/// Process-tree termination settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TerminationConfig {
    /// Grace period between the polite signal and the force kill.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

fn default_grace_seconds() -> u64 {
    3
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            grace_seconds: default_grace_seconds(),
        }
    }
}

/// Background reconcile loop used by `watch`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReconcileConfig {
    /// Seconds between background reconcile passes.
    #[serde(default = "default_reconcile_interval")]
    pub interval_seconds: u64,
}

fn default_reconcile_interval() -> u64 {
    10
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_reconcile_interval(),
        }
    }
}

/// A sticky local port for one remote endpoint of a target.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StickyPort {
    /// Remote port on the target (or remote host).
    pub remote_port: u16,
    /// Fixed local port to use.
    pub local_port: u16,
    /// Remote host for remote-host forwards.
    #[serde(default)]
    pub remote_host: Option<String>,
}

/// Operator preferences for one named target.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TargetPreferences {
    /// Target name (or id for unnamed targets).
    pub name: String,
    /// Sticky port assignments.
    #[serde(default)]
    pub ports: Vec<StickyPort>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the registry database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Ephemeral port range.
    #[serde(default)]
    pub ports: PortsConfig,
    /// Launcher settings.
    #[serde(default)]
    pub launcher: LauncherConfig,
    /// PID discovery budget.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Termination grace period.
    #[serde(default)]
    pub termination: TerminationConfig,
    /// Background reconcile interval.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Per-target sticky ports.
    #[serde(default)]
    pub targets: Vec<TargetPreferences>,
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    home.join(".tunnel-warden")
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ports: PortsConfig::default(),
            launcher: LauncherConfig::default(),
            discovery: DiscoveryConfig::default(),
            termination: TerminationConfig::default(),
            reconcile: ReconcileConfig::default(),
            targets: Vec::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an existing file fails to parse.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` registry database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Delay between PID-discovery scans.
    #[must_use]
    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery.delay_ms)
    }

    /// Grace period before survivors are force-killed.
    #[must_use]
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination.grace_seconds)
    }

    /// Timeout for a single port probe.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.ports.probe_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            return Err(AppError::Config(format!(
                "invalid port range {}-{}",
                self.ports.start, self.ports.end
            )));
        }

        if self.ports.probe_attempts == 0 {
            return Err(AppError::Config(
                "ports.probe_attempts must be greater than zero".into(),
            ));
        }

        if self.discovery.attempts == 0 {
            return Err(AppError::Config(
                "discovery.attempts must be greater than zero".into(),
            ));
        }

        if self.launcher.executable.trim().is_empty() {
            return Err(AppError::Config(
                "launcher.executable must not be empty".into(),
            ));
        }

        for target in &self.targets {
            if let Some(bad) = target
                .ports
                .iter()
                .find(|p| p.local_port == 0 || p.remote_port == 0)
            {
                return Err(AppError::Config(format!(
                    "target {} has a zero sticky port ({} -> {})",
                    target.name, bad.remote_port, bad.local_port
                )));
            }
        }

        Ok(())
    }
}

impl Preferences for GlobalConfig {
    fn port_range(&self) -> (u16, u16) {
        (self.ports.start, self.ports.end)
    }

    fn sticky_port(
        &self,
        target_name: &str,
        remote_port: u16,
        remote_host: Option<&str>,
    ) -> Option<u16> {
        self.targets
            .iter()
            .filter(|target| target.name == target_name)
            .flat_map(|target| target.ports.iter())
            .find(|port| port.remote_port == remote_port && port.remote_host.as_deref() == remote_host)
            .map(|port| port.local_port)
    }
}
