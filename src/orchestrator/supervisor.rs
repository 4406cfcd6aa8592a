//! Connection supervisor: launch, PID discovery, reconcile, terminate.
//!
//! A connection moves `LAUNCHING -> DISCOVERING_PID -> ACTIVE` inside
//! [`Supervisor::launch`]; only active connections reach the registry.
//! [`Supervisor::reconcile`] prunes records whose process is gone or no
//! longer carries the expected signature, then adopts launcher processes
//! the registry does not know about. There is no launch lock; the only
//! serialisation points are the registry's own read-modify-write lock and
//! the short-lived reservation of local ports for in-flight launches.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use super::spawner::Launcher;
use crate::command::builder::{executable_matches, validate_request};
use crate::command::{
    parse_session_args, CommandBuilder, Platform, RdpClientCommand, SearchSignature, SessionSpec,
};
use crate::config::GlobalConfig;
use crate::models::connection::{
    adopted_connection_id, new_connection_id, now_seconds, parse_reason_tag, Connection,
    ConnectionMethod, ConnectionStatus, SessionContext, RDP_PORT,
};
use crate::models::target::Target;
use crate::persistence::connection_registry::ConnectionRegistry;
use crate::ports::probe::port_accepts;
use crate::ports::{PortAllocator, Preferences};
use crate::process::{ProcessInfo, ProcessTable};
use crate::{AppError, Result};

/// A request to open one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Requested tunnel kind.
    pub method: ConnectionMethod,
    /// Target to connect to.
    pub target: Target,
    /// Profile and region.
    pub context: SessionContext,
    /// Remote port for forwards (`rdp-forward` defaults to 3389).
    pub remote_port: Option<u16>,
    /// Remote host for remote-host forwards.
    pub remote_host: Option<String>,
}

/// Connection ids changed by one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records removed because their process failed the liveness check.
    pub pruned: Vec<String>,
    /// Records added for untracked launcher processes.
    pub adopted: Vec<String>,
}

impl ReconcileReport {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pruned.is_empty() && self.adopted.is_empty()
    }
}

/// Local ports claimed by launches that have not settled yet.
type PendingPorts = Arc<Mutex<HashSet<u16>>>;

/// A local port held for one in-flight launch, released on drop.
///
/// Sticky ports may be shared by concurrent launches; only the first
/// claimant owns the entry.
struct PortReservation {
    pending: PendingPorts,
    port: u16,
    owned: bool,
}

impl PortReservation {
    fn claim(pending: &PendingPorts, port: u16) -> Option<Self> {
        let inserted = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port);
        inserted.then(|| Self {
            pending: Arc::clone(pending),
            port,
            owned: true,
        })
    }

    fn shared(pending: &PendingPorts, port: u16) -> Self {
        Self {
            pending: Arc::clone(pending),
            port,
            owned: false,
        }
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.owned {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.port);
        }
    }
}

/// Owns the tunnel lifecycle and is the registry's only writer.
#[derive(Clone)]
pub struct Supervisor {
    registry: ConnectionRegistry,
    processes: Arc<dyn ProcessTable>,
    launcher: Arc<dyn Launcher>,
    builder: CommandBuilder,
    platform: Platform,
    allocator: PortAllocator,
    discovery_attempts: u32,
    discovery_delay: Duration,
    termination_grace: Duration,
    probe_timeout: Duration,
    pending_ports: PendingPorts,
}

impl Supervisor {
    /// Assemble a supervisor from configuration and its collaborators.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        registry: ConnectionRegistry,
        processes: Arc<dyn ProcessTable>,
        launcher: Arc<dyn Launcher>,
        platform: Platform,
    ) -> Self {
        let builder = CommandBuilder::new(&config.launcher, platform);
        let discovery_attempts = config.discovery.attempts;
        let discovery_delay = config.discovery_delay();
        let termination_grace = config.termination_grace();
        let probe_timeout = config.probe_timeout();
        let probe_attempts = config.ports.probe_attempts;
        let preferences: Arc<dyn Preferences> = config;

        Self {
            registry,
            processes,
            launcher,
            builder,
            platform,
            allocator: PortAllocator::new(preferences, probe_attempts, probe_timeout),
            discovery_attempts,
            discovery_delay,
            termination_grace,
            probe_timeout,
            pending_ports: Arc::default(),
        }
    }

    /// The registry this supervisor writes to.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Launch a tunnel and register it once its backing process is found.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for a malformed target, context, host or port.
    /// - `AppError::NoFreePort` when the probe budget is exhausted.
    /// - `AppError::PidDiscovery` when the launcher fails to start or no
    ///   matching process appears within the retry budget. A spawned wrapper
    ///   is left for the OS to reap.
    /// - `AppError::Db` if the registry cannot be written.
    pub async fn launch(&self, request: LaunchRequest) -> Result<Connection> {
        let remote_port = match (request.method, request.remote_port) {
            (ConnectionMethod::RdpForward, None) => Some(RDP_PORT),
            (_, port) => port,
        };
        let method = request.method.canonical(remote_port);
        let span = info_span!("launch", method = %method, target = %request.target.id);
        self.launch_inner(request, method, remote_port)
            .instrument(span)
            .await
    }

    /// Open a desktop RDP client on an RDP forward's local port.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` unless `connection` is an RDP forward with a
    ///   local port.
    /// - `AppError::Process` if the client cannot be started.
    pub fn open_rdp_client(&self, connection: &Connection) -> Result<()> {
        let (ConnectionMethod::RdpForward, Some(local_port)) =
            (connection.method, connection.local_port)
        else {
            return Err(AppError::Validation(format!(
                "connection {} is not an rdp forward",
                connection.connection_id
            )));
        };
        let command = RdpClientCommand::new(local_port, self.platform).launch()?;
        self.launcher.spawn(&command)?;
        info!(
            connection_id = %connection.connection_id,
            local_port,
            client = %command.program,
            "rdp client opened"
        );
        Ok(())
    }

    async fn launch_inner(
        &self,
        request: LaunchRequest,
        method: ConnectionMethod,
        remote_port: Option<u16>,
    ) -> Result<Connection> {
        let LaunchRequest {
            target,
            context,
            remote_host,
            ..
        } = request;

        let mut spec = SessionSpec {
            method,
            target_id: target.id.clone(),
            profile: context.profile.clone(),
            region: context.region.clone(),
            reason: None,
            local_port: None,
            remote_port: if method.is_forwarding() { remote_port } else { None },
            remote_host: remote_host.clone(),
        };
        if !method.is_forwarding() && remote_port.is_some() {
            return Err(AppError::Validation(
                "interactive shells take no remote port".into(),
            ));
        }
        validate_request(&spec)?;

        let reservation = match spec.remote_port {
            Some(remote) => Some(
                self.reserve_local_port(&target, remote, remote_host.as_deref())
                    .await?,
            ),
            None => None,
        };
        spec.local_port = reservation.as_ref().map(|r| r.port);

        // The reservation lives until the record is registered or the
        // launch fails or is dropped.
        self.spawn_and_register(&target, context, spec).await
    }

    /// Allocate a local port skipping ports held by registry records or by
    /// launches still discovering their pid, and reserve it until the
    /// launch settles.
    ///
    /// Probing runs without any lock held. A port claimed by a concurrent
    /// launch in the meantime is excluded and the allocation retried.
    async fn reserve_local_port(
        &self,
        target: &Target,
        remote_port: u16,
        remote_host: Option<&str>,
    ) -> Result<PortReservation> {
        let tracked: HashSet<u16> = self
            .registry
            .get_all()
            .await?
            .iter()
            .filter_map(|c| c.local_port)
            .collect();
        let mut lost: HashSet<u16> = HashSet::new();

        loop {
            let mut excluded = tracked.clone();
            excluded.extend(lost.iter().copied());
            excluded.extend(
                self.pending_ports
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .copied(),
            );

            let local = self
                .allocator
                .allocate_excluding(target, remote_port, remote_host, &excluded)
                .await
                .ok_or_else(|| {
                    AppError::NoFreePort(format!(
                        "no free local port for {} -> {remote_port}",
                        target.lookup_name()
                    ))
                })?;

            if let Some(reservation) = PortReservation::claim(&self.pending_ports, local) {
                return Ok(reservation);
            }
            if excluded.contains(&local) {
                // Sticky ports are returned regardless of exclusions.
                return Ok(PortReservation::shared(&self.pending_ports, local));
            }
            debug!(local_port = local, "port claimed by a concurrent launch, retrying");
            lost.insert(local);
        }
    }

    async fn spawn_and_register(
        &self,
        target: &Target,
        context: SessionContext,
        mut spec: SessionSpec,
    ) -> Result<Connection> {
        let method = spec.method;
        let created_at = now_seconds();
        let connection_id = new_connection_id(method, &target.id, created_at);
        spec.reason = Some(connection_id.clone());
        let command = self.builder.build(&spec)?;

        self.launcher.spawn(&command.launch).map_err(|err| {
            AppError::PidDiscovery(format!("launcher did not start: {err}"))
        })?;

        let pid = self.discover_pid(&command.signature).await.ok_or_else(|| {
            AppError::PidDiscovery(format!(
                "no {} process matching {} after {} attempts",
                command.signature.executable, command.signature.fragment, self.discovery_attempts
            ))
        })?;

        let connection = Connection {
            connection_id: connection_id.clone(),
            target_id: target.id.clone(),
            target_name: target.name.clone(),
            method,
            profile: context.profile,
            region: context.region,
            pid,
            created_at,
            status: ConnectionStatus::Active,
            local_port: spec.local_port,
            remote_port: spec.remote_port,
            remote_host: spec.remote_host,
        };

        if self.registry.insert_unique(&connection).await? {
            info!(
                connection_id = %connection_id,
                pid,
                local_port = connection.local_port,
                "connection active"
            );
            return Ok(connection);
        }

        // A concurrent reconcile may have adopted the process first.
        if let Some(existing) = self.registry.find(&connection_id).await? {
            debug!(connection_id = %connection_id, "connection already adopted by reconcile");
            return Ok(existing);
        }
        Err(AppError::PidDiscovery(format!(
            "discovered pid {pid} is already tracked by another connection"
        )))
    }

    async fn discover_pid(&self, signature: &SearchSignature) -> Option<u32> {
        for attempt in 1..=self.discovery_attempts {
            match self.snapshot().await {
                Ok(processes) => {
                    if let Some(found) = processes.iter().find(|p| signature.matches(p)) {
                        debug!(attempt, pid = found.pid, "backing process discovered");
                        return Some(found.pid);
                    }
                }
                Err(err) => warn!(attempt, %err, "process scan failed during discovery"),
            }
            if attempt < self.discovery_attempts {
                tokio::time::sleep(self.discovery_delay).await;
            }
        }
        None
    }

    async fn snapshot(&self) -> Result<Vec<ProcessInfo>> {
        let table = Arc::clone(&self.processes);
        tokio::task::spawn_blocking(move || table.list_processes())
            .await
            .map_err(|err| AppError::Process(format!("process scan task failed: {err}")))?
    }

    /// Reconcile, then return a copy of every active connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read.
    pub async fn list_active(&self) -> Result<Vec<Connection>> {
        self.reconcile().await;
        self.registry.get_all().await
    }

    /// Prune dead or re-signatured records, then adopt untracked launcher
    /// processes. Failures are logged and leave the registry unchanged.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconcile_inner()
            .instrument(info_span!("reconcile"))
            .await
    }

    async fn reconcile_inner(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut processes = match self.snapshot().await {
            Ok(processes) => processes,
            Err(err) => {
                warn!(%err, "process enumeration failed, skipping reconcile");
                return report;
            }
        };
        processes.sort_by_key(|p| p.pid);
        let by_pid: HashMap<u32, &ProcessInfo> = processes.iter().map(|p| (p.pid, p)).collect();

        let entries = match self.registry.get_all().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "registry read failed, skipping reconcile");
                return report;
            }
        };

        for entry in &entries {
            if self.is_healthy(entry, by_pid.get(&entry.pid).copied()).await {
                continue;
            }
            match self.registry.remove(entry).await {
                Ok(true) => {
                    info!(connection_id = %entry.connection_id, pid = entry.pid, "pruned connection");
                    report.pruned.push(entry.connection_id.clone());
                }
                Ok(false) => {}
                Err(err) => warn!(connection_id = %entry.connection_id, %err, "failed to prune"),
            }
        }

        let tracked: HashSet<u32> = match self.registry.get_all().await {
            Ok(entries) => entries.iter().map(|c| c.pid).collect(),
            Err(err) => {
                warn!(%err, "registry read failed, skipping adoption");
                return report;
            }
        };
        let launcher = self.builder.process_name();

        for process in &processes {
            if tracked.contains(&process.pid) || !executable_matches(&process.name, &launcher) {
                continue;
            }
            let Some(connection) = adopt_record(process) else {
                debug!(pid = process.pid, "launcher process not adoptable");
                continue;
            };
            if !self.is_healthy(&connection, Some(process)).await {
                debug!(pid = process.pid, "skipping adoption of unhealthy tunnel");
                continue;
            }
            match self.registry.insert_unique(&connection).await {
                Ok(true) => {
                    info!(connection_id = %connection.connection_id, pid = process.pid, "adopted connection");
                    report.adopted.push(connection.connection_id);
                }
                Ok(false) => debug!(pid = process.pid, "connection id already tracked"),
                Err(err) => warn!(pid = process.pid, %err, "failed to adopt"),
            }
        }

        report
    }

    /// Liveness check: process alive, still carrying this record's
    /// signature, and (for forwards) its local port accepting connections.
    async fn is_healthy(&self, entry: &Connection, process: Option<&ProcessInfo>) -> bool {
        let Some(process) = process else {
            return false;
        };
        if !self.carries_signature(entry, process) {
            return false;
        }
        match entry.local_port {
            Some(port) if entry.method.is_forwarding() => {
                port_accepts(port, self.probe_timeout).await
            }
            _ => !entry.method.is_forwarding(),
        }
    }

    /// Whether `process` is the launcher process that backs `entry`.
    fn carries_signature(&self, entry: &Connection, process: &ProcessInfo) -> bool {
        executable_matches(&process.name, &self.builder.process_name())
            && adopt_record(process).is_some_and(|expected| same_tunnel(entry, &expected))
    }

    /// Terminate the connection's process tree and drop its record.
    ///
    /// The tree is only killed while the recorded pid still carries this
    /// connection's signature; a pid that exited or now belongs to another
    /// program is left alone. The record is removed either way, and a
    /// surviving tunnel is re-adopted by the next reconcile.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id, `AppError::Process`
    /// if the process table cannot be read, or `AppError::Db` if the
    /// registry cannot be read or written.
    pub async fn terminate(&self, connection_id: &str) -> Result<Connection> {
        let span = info_span!("terminate", connection_id = %connection_id);
        self.terminate_inner(connection_id).instrument(span).await
    }

    async fn terminate_inner(&self, connection_id: &str) -> Result<Connection> {
        let Some(mut record) = self.registry.find(connection_id).await? else {
            return Err(AppError::NotFound(format!(
                "connection {connection_id} not found"
            )));
        };

        let pid = record.pid;
        let processes = self.snapshot().await?;
        match processes.iter().find(|p| p.pid == pid) {
            Some(process) if self.carries_signature(&record, process) => {
                let table = Arc::clone(&self.processes);
                let grace = self.termination_grace;
                let killed = tokio::task::spawn_blocking(move || table.terminate_tree(pid, grace))
                    .await
                    .unwrap_or_else(|err| {
                        warn!(pid, %err, "termination task failed");
                        false
                    });
                if !killed {
                    warn!(pid, "process tree not fully terminated");
                }
            }
            Some(process) => warn!(
                pid,
                process = %process.name,
                "pid now belongs to another process, not killing it"
            ),
            None => debug!(pid, "backing process already exited"),
        }

        self.registry.remove(&record).await?;
        info!(pid, "connection terminated");
        record.status = ConnectionStatus::Terminated;
        Ok(record)
    }
}

/// Whether `entry` and the record parsed from its process describe the
/// same tunnel.
fn same_tunnel(entry: &Connection, parsed: &Connection) -> bool {
    entry.connection_id == parsed.connection_id
        && entry.target_id == parsed.target_id
        && entry.method == parsed.method
        && entry.local_port == parsed.local_port
        && entry.remote_port == parsed.remote_port
        && entry.remote_host == parsed.remote_host
}

/// Structured record for a live launcher process, or `None` when its argv
/// does not parse.
///
/// Well-formed reason tags become the connection id and supply the
/// creation time; otherwise the id is derived from the process start time
/// and pid so repeated passes agree on it.
fn adopt_record(process: &ProcessInfo) -> Option<Connection> {
    let spec = parse_session_args(&process.args)?;
    let tag = spec.reason.as_deref().and_then(parse_reason_tag);

    let (connection_id, created_at) = match (&spec.reason, tag) {
        (Some(reason), Some(tag)) if tag.target_id == spec.target_id && tag.method == spec.method => {
            (reason.clone(), tag.created_at)
        }
        _ => {
            let started = start_time(process)?;
            (
                adopted_connection_id(spec.method, &spec.target_id, started, process.pid),
                started,
            )
        }
    };

    Some(Connection {
        connection_id,
        target_id: spec.target_id,
        target_name: None,
        method: spec.method,
        profile: spec.profile,
        region: spec.region,
        pid: process.pid,
        created_at,
        status: ConnectionStatus::Active,
        local_port: spec.local_port,
        remote_port: spec.remote_port,
        remote_host: spec.remote_host,
    })
}

fn start_time(process: &ProcessInfo) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(process.start_time).ok()?, 0)
}
