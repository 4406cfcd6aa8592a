//! Inverse of the session argument layout.
//!
//! Recovers a [`SessionSpec`] from a live launcher's argv so tunnels started
//! before a restart (or by another tool) can be adopted. Flags may appear in
//! any order; anything unknown, duplicated or malformed is rejected, and the
//! result must rebuild to the same flag set.

use std::collections::BTreeMap;

use super::{session_args, SessionSpec, DOCUMENT_LOCAL, DOCUMENT_REMOTE_HOST};
use crate::models::connection::ConnectionMethod;
use crate::models::target::{
    validate_profile, validate_region, validate_remote_host, validate_target_id,
};

const KNOWN_FLAGS: &[&str] = &[
    "--target",
    "--region",
    "--profile",
    "--reason",
    "--document-name",
    "--parameters",
];

/// Parse launcher argv (optionally preceded by an interpreter and script
/// path) into a session spec.
///
/// Returns `None` when the argv is not an `ssm start-session` invocation in
/// the layout produced by [`session_args`].
#[must_use]
pub fn parse_session_args(argv: &[String]) -> Option<SessionSpec> {
    let start = argv
        .windows(2)
        .position(|pair| pair[0] == "ssm" && pair[1] == "start-session")?;
    let tail = &argv[start + 2..];

    let flags = flag_map(tail)?;
    let spec = spec_from_flags(&flags)?;

    let rebuilt = session_args(&spec);
    let rebuilt_flags = flag_map(&rebuilt[2..])?;
    if normalized(&rebuilt_flags)? != normalized(&flags)? {
        return None;
    }
    Some(spec)
}

fn flag_map(tail: &[String]) -> Option<BTreeMap<String, String>> {
    if tail.len() % 2 != 0 {
        return None;
    }
    let mut flags = BTreeMap::new();
    for pair in tail.chunks(2) {
        let (flag, value) = (&pair[0], &pair[1]);
        if !KNOWN_FLAGS.contains(&flag.as_str()) || value.starts_with("--") || value.is_empty() {
            return None;
        }
        if flags.insert(flag.clone(), value.clone()).is_some() {
            return None;
        }
    }
    Some(flags)
}

fn parameter_map(raw: &str) -> Option<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for item in raw.split(',') {
        let (key, value) = item.split_once('=')?;
        if !matches!(key, "portNumber" | "localPortNumber" | "host") || value.is_empty() {
            return None;
        }
        if params.insert(key.to_owned(), value.to_owned()).is_some() {
            return None;
        }
    }
    Some(params)
}

/// Flags with `--parameters` replaced by its order-insensitive form.
fn normalized(flags: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    let mut out = flags.clone();
    if let Some(raw) = flags.get("--parameters") {
        let params = parameter_map(raw)?;
        let canonical: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        out.insert("--parameters".into(), canonical.join(","));
    }
    Some(out)
}

fn port(params: &BTreeMap<String, String>, key: &str) -> Option<u16> {
    params
        .get(key)?
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
}

fn spec_from_flags(flags: &BTreeMap<String, String>) -> Option<SessionSpec> {
    let target_id = flags.get("--target")?.clone();
    validate_target_id(&target_id).ok()?;

    let region = flags.get("--region").cloned();
    if let Some(region) = &region {
        validate_region(region).ok()?;
    }
    let profile = flags.get("--profile").cloned();
    if let Some(profile) = &profile {
        validate_profile(profile).ok()?;
    }

    let mut spec = SessionSpec {
        method: ConnectionMethod::InteractiveShell,
        target_id,
        profile,
        region,
        reason: flags.get("--reason").cloned(),
        local_port: None,
        remote_port: None,
        remote_host: None,
    };

    match (flags.get("--document-name"), flags.get("--parameters")) {
        (None, None) => {}
        (Some(document), Some(raw)) => {
            let params = parameter_map(raw)?;
            let local = port(&params, "localPortNumber")?;
            let remote = port(&params, "portNumber")?;
            let host = params.get("host").cloned();
            spec.local_port = Some(local);
            spec.remote_port = Some(remote);

            match (document.as_str(), host) {
                (DOCUMENT_LOCAL, None) => {
                    spec.method = ConnectionMethod::LocalPortForward.canonical(Some(remote));
                }
                (DOCUMENT_REMOTE_HOST, Some(host)) => {
                    validate_remote_host(&host).ok()?;
                    spec.method = ConnectionMethod::RemoteHostPortForward;
                    spec.remote_host = Some(host);
                }
                _ => return None,
            }
        }
        _ => return None,
    }
    Some(spec)
}
