//! Connection model, tunnel methods and connection-id / reason-tag helpers.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::validate_target_id;

/// Remote port that turns a local forward into an RDP forward.
pub const RDP_PORT: u16 = 3389;

/// Kind of tunnel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMethod {
    /// Interactive shell in a visible console.
    InteractiveShell,
    /// Local forward to the target's RDP port.
    RdpForward,
    /// Local forward to an arbitrary port on the target.
    LocalPortForward,
    /// Local forward to a host reachable from the target.
    RemoteHostPortForward,
}

impl ConnectionMethod {
    /// Whether this method binds a local port.
    #[must_use]
    pub fn is_forwarding(self) -> bool {
        !matches!(self, Self::InteractiveShell)
    }

    /// Wire name, as persisted and printed.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InteractiveShell => "interactive-shell",
            Self::RdpForward => "rdp-forward",
            Self::LocalPortForward => "local-port-forward",
            Self::RemoteHostPortForward => "remote-host-port-forward",
        }
    }

    /// Short method prefix used in connection ids.
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::InteractiveShell => "shell",
            Self::RdpForward => "rdp",
            Self::LocalPortForward => "port",
            Self::RemoteHostPortForward => "host",
        }
    }

    /// Inverse of [`ConnectionMethod::slug`].
    #[must_use]
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "shell" => Some(Self::InteractiveShell),
            "rdp" => Some(Self::RdpForward),
            "port" => Some(Self::LocalPortForward),
            "host" => Some(Self::RemoteHostPortForward),
            _ => None,
        }
    }

    /// Canonical method for a requested method and remote port.
    ///
    /// A local forward to 3389 is recorded as an RDP forward, which keeps
    /// launched and adopted records of the same tunnel identical.
    #[must_use]
    pub fn canonical(self, remote_port: Option<u16>) -> Self {
        match (self, remote_port) {
            (Self::LocalPortForward, Some(RDP_PORT)) => Self::RdpForward,
            (method, _) => method,
        }
    }
}

impl std::fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a connection record.
///
/// The registry only ever holds `Active` entries; dead ones are deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Backing process is live and correctly signatured.
    Active,
    /// Terminated by the caller.
    Terminated,
}

/// Credential profile and region a tunnel is launched with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionContext {
    /// Credential profile name.
    pub profile: Option<String>,
    /// Region code.
    pub region: Option<String>,
}

impl SessionContext {
    /// Context with both profile and region set.
    #[must_use]
    pub fn new(profile: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            profile: Some(profile.into()),
            region: Some(region.into()),
        }
    }
}

/// Persisted registry entry for one live tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    /// Logical connection id; also the reason tag embedded in the command.
    pub connection_id: String,
    /// Resource id of the owning target.
    pub target_id: String,
    /// Cosmetic target name at launch time.
    pub target_name: Option<String>,
    /// Tunnel kind.
    pub method: ConnectionMethod,
    /// Credential profile used to launch.
    pub profile: Option<String>,
    /// Region used to launch.
    pub region: Option<String>,
    /// OS process id of the discovered backing process.
    pub pid: u32,
    /// Creation timestamp, whole seconds.
    pub created_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: ConnectionStatus,
    /// Local listening port (forwarding methods only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Remote port (forwarding methods only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Remote host (remote-host forwarding only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
}

/// Current time truncated to whole seconds, the granularity of ids.
#[must_use]
pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Build a fresh connection id: `<slug>_<target>_<unix seconds>_<suffix>`.
///
/// The random suffix keeps two launches to the same target in the same
/// second apart.
#[must_use]
pub fn new_connection_id(
    method: ConnectionMethod,
    target_id: &str,
    created_at: DateTime<Utc>,
) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}",
        method.slug(),
        target_id,
        created_at.timestamp(),
        &suffix[..8]
    )
}

/// Id for an adopted process that carries no reason tag.
#[must_use]
pub fn adopted_connection_id(
    method: ConnectionMethod,
    target_id: &str,
    created_at: DateTime<Utc>,
    pid: u32,
) -> String {
    format!(
        "{}_{}_{}_{pid}",
        method.slug(),
        target_id,
        created_at.timestamp()
    )
}

/// Fields recovered from a well-formed reason tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonTag {
    /// Method encoded in the tag prefix.
    pub method: ConnectionMethod,
    /// Target id encoded in the tag.
    pub target_id: String,
    /// Creation timestamp encoded in the tag.
    pub created_at: DateTime<Utc>,
}

/// Parse a reason tag produced by [`new_connection_id`].
///
/// Returns `None` for tags written by other tools.
#[must_use]
pub fn parse_reason_tag(tag: &str) -> Option<ReasonTag> {
    let mut parts = tag.split('_');
    let method = ConnectionMethod::from_slug(parts.next()?)?;
    let target_id = parts.next()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    let suffix = parts.next()?;
    if parts.next().is_some() || suffix.is_empty() {
        return None;
    }
    validate_target_id(target_id).ok()?;
    Some(ReasonTag {
        method,
        target_id: target_id.to_owned(),
        created_at: DateTime::from_timestamp(seconds, 0)?,
    })
}
