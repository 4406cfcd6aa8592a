//! Session command construction and its inverse.
//!
//! [`builder`] lays out `ssm start-session` arguments and wraps them for the
//! host platform; [`parser`] turns a live process's argv back into the same
//! structured [`SessionSpec`], accepting only argv that round-trips.
//! [`rdp_client`] opens a desktop client on an RDP forward.

pub mod builder;
pub mod parser;
pub mod rdp_client;

pub use builder::{CommandBuilder, LaunchCommand, LaunchHints, Platform, SearchSignature, SessionCommand};
pub use parser::parse_session_args;
pub use rdp_client::RdpClientCommand;

use crate::models::connection::ConnectionMethod;

/// Document used for local forwards (including RDP).
pub const DOCUMENT_LOCAL: &str = "AWS-StartPortForwardingSession";
/// Document used for forwards to a host behind the target.
pub const DOCUMENT_REMOTE_HOST: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// Structured form of one `ssm start-session` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    /// Tunnel kind.
    pub method: ConnectionMethod,
    /// Target resource id.
    pub target_id: String,
    /// Credential profile.
    pub profile: Option<String>,
    /// Region code.
    pub region: Option<String>,
    /// Reason tag (the connection id for tunnels launched here).
    pub reason: Option<String>,
    /// Local port for forwards.
    pub local_port: Option<u16>,
    /// Remote port for forwards.
    pub remote_port: Option<u16>,
    /// Remote host for remote-host forwards.
    pub remote_host: Option<String>,
}

/// Argument layout after the executable, without any wrapper.
///
/// Port and host fields are emitted only for forwarding methods with the
/// fields populated.
#[must_use]
pub fn session_args(spec: &SessionSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "ssm".into(),
        "start-session".into(),
        "--target".into(),
        spec.target_id.clone(),
    ];
    if let Some(region) = &spec.region {
        args.extend(["--region".into(), region.clone()]);
    }
    if let Some(profile) = &spec.profile {
        args.extend(["--profile".into(), profile.clone()]);
    }
    if let Some(reason) = &spec.reason {
        args.extend(["--reason".into(), reason.clone()]);
    }

    match (spec.method, spec.local_port, spec.remote_port) {
        (ConnectionMethod::RdpForward | ConnectionMethod::LocalPortForward, Some(local), Some(remote)) => {
            args.extend([
                "--document-name".into(),
                DOCUMENT_LOCAL.into(),
                "--parameters".into(),
                format!("portNumber={remote},localPortNumber={local}"),
            ]);
        }
        (ConnectionMethod::RemoteHostPortForward, Some(local), Some(remote)) => {
            if let Some(host) = &spec.remote_host {
                args.extend([
                    "--document-name".into(),
                    DOCUMENT_REMOTE_HOST.into(),
                    "--parameters".into(),
                    format!("localPortNumber={local},host={host},portNumber={remote}"),
                ]);
            }
        }
        _ => {}
    }
    args
}
