//! Remote compute targets and the argument-shape validators shared by the
//! command builder and the inverse parser.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

const TARGET_ID_PATTERN: &str = r"^i-[0-9a-f]{8,17}$";
// Also admits partitioned regions such as `us-gov-west-1`.
const REGION_PATTERN: &str = r"^[a-z]{2}(-[a-z]+)+-\d$";
const PROFILE_PATTERN: &str = r"^[A-Za-z0-9._+=@-]+$";
const HOST_PATTERN: &str = r"^[A-Za-z0-9.-]{1,253}$";

/// A remote compute resource a tunnel connects to.
///
/// Identity is the `id` alone; `name` is cosmetic and may change between
/// listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    /// Provider resource id, e.g. `i-0123456789abcdef0`.
    pub id: String,
    /// Optional human-readable name.
    pub name: Option<String>,
}

impl Target {
    /// Construct a target after validating the resource id shape.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if `id` is not a resource id.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Result<Self> {
        let id = id.into();
        validate_target_id(&id)?;
        Ok(Self { id, name })
    }

    /// Name used for sticky-port lookups: the name when present, else the id.
    #[must_use]
    pub fn lookup_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

static TARGET_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();
static REGION_RE: OnceLock<Option<Regex>> = OnceLock::new();
static PROFILE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static HOST_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Match `value` against `pattern`, compiled once into `cell`.
fn matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, value: &str) -> Result<bool> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .map(|re| re.is_match(value))
        .ok_or_else(|| AppError::Validation(format!("invalid pattern {pattern}")))
}

/// Validate a resource id such as `i-0123456789abcdef0`.
///
/// # Errors
///
/// Returns `AppError::Validation` when the id does not match.
pub fn validate_target_id(id: &str) -> Result<()> {
    if matches(&TARGET_ID_RE, TARGET_ID_PATTERN, id)? {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid target id: {id}")))
    }
}

/// Validate a region code such as `eu-west-1`.
///
/// # Errors
///
/// Returns `AppError::Validation` when the region does not match.
pub fn validate_region(region: &str) -> Result<()> {
    if matches(&REGION_RE, REGION_PATTERN, region)? {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid region: {region}")))
    }
}

/// Validate a credential profile name.
///
/// # Errors
///
/// Returns `AppError::Validation` when the profile is empty or contains
/// characters that are unsafe on a command line.
pub fn validate_profile(profile: &str) -> Result<()> {
    if matches(&PROFILE_RE, PROFILE_PATTERN, profile)? {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid profile: {profile:?}")))
    }
}

/// Validate a remote host name or address for remote-host forwarding.
///
/// # Errors
///
/// Returns `AppError::Validation` when the host is malformed.
pub fn validate_remote_host(host: &str) -> Result<()> {
    if matches(&HOST_RE, HOST_PATTERN, host)? {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid remote host: {host:?}")))
    }
}

/// Validate a TCP port number.
///
/// # Errors
///
/// Returns `AppError::Validation` for port 0.
pub fn validate_port(port: u16, what: &str) -> Result<()> {
    if port == 0 {
        Err(AppError::Validation(format!("{what} port must be non-zero")))
    } else {
        Ok(())
    }
}
