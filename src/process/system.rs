//! `sysinfo`-backed process table.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

use super::{ProcessInfo, ProcessTable};
use crate::Result;

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Process table over the live OS, via `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    /// Create the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn refresh(system: &mut System, which: ProcessesToUpdate<'_>) {
    system.refresh_processes_specifics(which, true, ProcessRefreshKind::everything());
}

fn is_live(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// `root` and all of its descendants, deepest first, root last.
fn tree_children_first(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        order.push(current);
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|kid| !seen.contains(*kid)));
        }
    }
    order.reverse();
    order
}

fn survivors(system: &System, tree: &[Pid]) -> Vec<Pid> {
    tree.iter()
        .copied()
        .filter(|pid| system.process(*pid).is_some_and(is_live))
        .collect()
}

impl ProcessTable for SystemProcessTable {
    fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut system = System::new();
        refresh(&mut system, ProcessesToUpdate::All);

        Ok(system
            .processes()
            .iter()
            .filter(|(_, process)| is_live(process))
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(Pid::as_u32),
                name: process.name().to_string_lossy().into_owned(),
                args: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
                start_time: process.start_time(),
            })
            .collect())
    }

    fn terminate_tree(&self, pid: u32, grace: Duration) -> bool {
        let root = Pid::from_u32(pid);
        let mut system = System::new();
        refresh(&mut system, ProcessesToUpdate::All);

        if !system.process(root).is_some_and(is_live) {
            debug!(pid, "process already gone");
            return true;
        }

        let tree = tree_children_first(&system, root);
        for member in &tree {
            if let Some(process) = system.process(*member) {
                // Platforms without SIGTERM fall back to a plain kill.
                if process.kill_with(Signal::Term).is_none() {
                    process.kill();
                }
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            refresh(&mut system, ProcessesToUpdate::Some(&tree));
            let alive = survivors(&system, &tree);
            if alive.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pid, survivors = alive.len(), "grace period elapsed, force-killing");
                for member in &alive {
                    if let Some(process) = system.process(*member) {
                        process.kill();
                    }
                }
                std::thread::sleep(EXIT_POLL);
                refresh(&mut system, ProcessesToUpdate::Some(&tree));
                return survivors(&system, &tree).is_empty();
            }
            std::thread::sleep(EXIT_POLL);
        }
    }
}
