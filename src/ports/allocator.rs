//! Random-probe local port allocator with sticky per-target overrides.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::index;
use tracing::{debug, error, info};

use super::probe::port_accepts;
use super::Preferences;
use crate::models::target::Target;

/// Allocates local ports for forwarding sessions.
#[derive(Clone)]
pub struct PortAllocator {
    preferences: Arc<dyn Preferences>,
    probe_attempts: u32,
    probe_timeout: Duration,
}

impl PortAllocator {
    /// Create an allocator reading range and sticky ports from `preferences`.
    #[must_use]
    pub fn new(
        preferences: Arc<dyn Preferences>,
        probe_attempts: u32,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            preferences,
            probe_attempts,
            probe_timeout,
        }
    }

    /// Return a local port for `target` and the given remote endpoint.
    ///
    /// Returns `None` when no free port was found within the probe budget.
    pub async fn allocate(
        &self,
        target: &Target,
        remote_port: u16,
        remote_host: Option<&str>,
    ) -> Option<u16> {
        self.allocate_excluding(target, remote_port, remote_host, &HashSet::new())
            .await
    }

    /// Like [`PortAllocator::allocate`], additionally skipping `in_use`
    /// ports (typically those held by registry records).
    ///
    /// A sticky port is returned unconditionally, even when busy or listed
    /// in `in_use`.
    pub async fn allocate_excluding(
        &self,
        target: &Target,
        remote_port: u16,
        remote_host: Option<&str>,
        in_use: &HashSet<u16>,
    ) -> Option<u16> {
        if let Some(port) =
            self.preferences
                .sticky_port(target.lookup_name(), remote_port, remote_host)
        {
            info!(
                port,
                target = target.lookup_name(),
                remote_port,
                "using sticky local port"
            );
            return Some(port);
        }

        let (start, end) = self.preferences.port_range();
        if start > end {
            error!(start, end, "empty port range");
            return None;
        }

        for port in self.candidates(start, end) {
            if in_use.contains(&port) {
                debug!(port, "port held by a tracked connection");
                continue;
            }
            if port_accepts(port, self.probe_timeout).await {
                debug!(port, "port is in use");
                continue;
            }
            info!(port, "found free port");
            return Some(port);
        }

        error!(
            start,
            end,
            attempts = self.probe_attempts,
            "no free port found"
        );
        None
    }

    /// Up to `probe_attempts` distinct random ports from `[start, end]`.
    fn candidates(&self, start: u16, end: u16) -> Vec<u16> {
        let span = usize::from(end - start) + 1;
        let budget = usize::try_from(self.probe_attempts)
            .unwrap_or(usize::MAX)
            .min(span);
        let mut rng = rand::thread_rng();
        index::sample(&mut rng, span, budget)
            .into_iter()
            .filter_map(|offset| u16::try_from(offset).ok())
            .map(|offset| start + offset)
            .collect()
    }
}
