use std::collections::HashSet;
use std::sync::Arc;

use serial_test::serial;
use tunnel_warden::command::Platform;
use tunnel_warden::models::connection::{ConnectionMethod, ConnectionStatus, SessionContext};
use tunnel_warden::models::target::Target;
use tunnel_warden::orchestrator::spawner::Launcher;
use tunnel_warden::orchestrator::supervisor::{LaunchRequest, ReconcileReport, Supervisor};
use tunnel_warden::persistence::connection_registry::ConnectionRegistry;
use tunnel_warden::persistence::db;
use tunnel_warden::persistence::kv_store::KvStore;
use tunnel_warden::process::ProcessTable;

use super::test_helpers::{
    as_strs, external_forward, free_port, harness, test_config, OTHER_TARGET, START_TIME, TARGET,
};

fn forward(remote_port: u16) -> LaunchRequest {
    LaunchRequest {
        method: ConnectionMethod::LocalPortForward,
        target: Target::new(TARGET, None).expect("valid target"),
        context: SessionContext::new("prod", "eu-west-1"),
        remote_port: Some(remote_port),
        remote_host: None,
    }
}

#[tokio::test]
#[serial]
async fn healthy_registry_is_left_alone() {
    let h = harness(62100, 62199).await;
    h.supervisor.launch(forward(8080)).await.expect("launch");
    h.supervisor.launch(forward(8081)).await.expect("launch");
    let before = h.registry.get_all().await.expect("get all");

    let report = h.supervisor.reconcile().await;
    assert!(report.is_empty(), "unexpected changes: {report:?}");
    assert_eq!(h.registry.get_all().await.expect("get all"), before);
}

#[tokio::test]
#[serial]
async fn prunes_exactly_the_exited_entries() {
    let h = harness(62100, 62199).await;
    let a = h.supervisor.launch(forward(8080)).await.expect("launch");
    let b = h.supervisor.launch(forward(8081)).await.expect("launch");
    let c = h.supervisor.launch(forward(8082)).await.expect("launch");

    h.host.exit(a.pid);
    h.host.exit(c.pid);

    let report = h.supervisor.reconcile().await;
    let mut pruned = report.pruned.clone();
    pruned.sort();
    let mut expected = vec![a.connection_id, c.connection_id];
    expected.sort();
    assert_eq!(pruned, expected);
    assert!(report.adopted.is_empty());
    assert_eq!(h.registry.get_all().await.expect("get all"), vec![b]);
}

#[tokio::test]
#[serial]
async fn prunes_forward_whose_listener_closed() {
    let h = harness(62100, 62199).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");

    h.host.close_listener(connection.pid);

    let report = h.supervisor.reconcile().await;
    assert_eq!(report.pruned, vec![connection.connection_id]);
    // Still alive but not listening, so not re-adopted either.
    assert!(report.adopted.is_empty());
    assert!(h.registry.get_all().await.expect("get all").is_empty());
    assert!(h.supervisor.reconcile().await.is_empty());
}

#[tokio::test]
#[serial]
async fn prunes_entry_whose_pid_was_reused() {
    let h = harness(62100, 62199).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");

    h.host
        .reuse_pid(connection.pid, "bash", &["bash", "-c", "sleep 100"]);

    let report = h.supervisor.reconcile().await;
    assert_eq!(report.pruned, vec![connection.connection_id]);
    assert!(report.adopted.is_empty());
}

#[tokio::test]
#[serial]
async fn prunes_entry_whose_pid_now_runs_another_tunnel() {
    let h = harness(62100, 62199).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    let port = connection.local_port.expect("local port");

    let other = external_forward(
        OTHER_TARGET,
        port,
        8080,
        "port_i-0fedcba9876543210_1700000000_deadbeef",
    );
    h.host.reuse_pid(connection.pid, "aws", &as_strs(&other));

    let report = h.supervisor.reconcile().await;
    assert_eq!(report.pruned, vec![connection.connection_id]);
}

#[tokio::test]
#[serial]
async fn adopts_tagged_tunnel_with_its_own_id() {
    let h = harness(62100, 62199).await;
    let port = free_port();
    let reason = "port_i-0fedcba9876543210_1699999999_deadbeef";
    let argv = external_forward(OTHER_TARGET, port, 5432, reason);
    let pid = h.host.add_process("aws", &as_strs(&argv), Some(port));

    let report = h.supervisor.reconcile().await;
    assert_eq!(report.adopted, vec![reason.to_owned()]);

    let all = h.registry.get_all().await.expect("get all");
    assert_eq!(all.len(), 1);
    let adopted = &all[0];
    assert_eq!(adopted.connection_id, reason);
    assert_eq!(adopted.pid, pid);
    assert_eq!(adopted.target_id, OTHER_TARGET);
    assert_eq!(adopted.method, ConnectionMethod::LocalPortForward);
    assert_eq!(adopted.local_port, Some(port));
    assert_eq!(adopted.remote_port, Some(5432));
    assert_eq!(adopted.remote_host, None);
    assert_eq!(adopted.profile.as_deref(), Some("prod"));
    assert_eq!(adopted.region.as_deref(), Some("eu-west-1"));
    assert_eq!(adopted.status, ConnectionStatus::Active);
    assert_eq!(adopted.created_at.timestamp(), 1_699_999_999);
}

#[tokio::test]
#[serial]
async fn foreign_reason_gets_a_synthesized_id() {
    let h = harness(62100, 62199).await;
    let port = free_port();
    let argv = external_forward(TARGET, port, 3389, "maintenance");
    let pid = h.host.add_process("aws", &as_strs(&argv), Some(port));

    let report = h.supervisor.reconcile().await;
    let expected = format!("rdp_{TARGET}_{START_TIME}_{pid}");
    assert_eq!(report.adopted, vec![expected.clone()]);

    let adopted = h.registry.find(&expected).await.expect("find").expect("adopted");
    assert_eq!(adopted.method, ConnectionMethod::RdpForward);
    assert_eq!(
        u64::try_from(adopted.created_at.timestamp()).expect("positive"),
        START_TIME
    );

    assert!(h.supervisor.reconcile().await.is_empty());
}

#[tokio::test]
#[serial]
async fn adopts_untagged_shell_session() {
    let h = harness(62100, 62199).await;
    let pid = h.host.add_process(
        "aws",
        &[
            "aws",
            "ssm",
            "start-session",
            "--target",
            TARGET,
            "--region",
            "eu-west-1",
        ],
        None,
    );

    let report = h.supervisor.reconcile().await;
    assert_eq!(report.adopted.len(), 1);
    let adopted = h.registry.get_all().await.expect("get all");
    assert_eq!(adopted[0].pid, pid);
    assert_eq!(adopted[0].method, ConnectionMethod::InteractiveShell);
    assert_eq!(adopted[0].profile, None);
    assert_eq!(adopted[0].local_port, None);
}

#[tokio::test]
#[serial]
async fn ignores_unparseable_and_foreign_processes() {
    let h = harness(62100, 62199).await;
    h.host.add_process("aws", &["aws", "s3", "ls"], None);
    h.host.add_process(
        "aws",
        &["aws", "ssm", "start-session", "--target", "web-01"],
        None,
    );
    h.host.add_process("sshd", &["sshd", "-D"], None);
    let port = free_port();
    let argv = external_forward(TARGET, port, 8080, "maintenance");
    h.host.add_process("python3", &as_strs(&argv), Some(port));

    let report = h.supervisor.reconcile().await;
    assert!(report.is_empty(), "unexpected changes: {report:?}");
    assert!(h.registry.get_all().await.expect("get all").is_empty());
}

#[tokio::test]
#[serial]
async fn forward_without_listener_is_not_adopted() {
    let h = harness(62100, 62199).await;
    let port = free_port();
    let argv = external_forward(TARGET, port, 8080, "maintenance");
    h.host.add_process("aws", &as_strs(&argv), None);

    assert!(h.supervisor.reconcile().await.is_empty());
}

#[tokio::test]
#[serial]
async fn reconcile_is_idempotent() {
    let h = harness(62100, 62199).await;
    let kept = h.supervisor.launch(forward(8080)).await.expect("launch");
    let gone = h.supervisor.launch(forward(8081)).await.expect("launch");
    h.host.exit(gone.pid);
    let port = free_port();
    let argv = external_forward(TARGET, port, 9000, "maintenance");
    h.host.add_process("aws", &as_strs(&argv), Some(port));

    let first = h.supervisor.reconcile().await;
    assert_eq!(first.pruned, vec![gone.connection_id]);
    assert_eq!(first.adopted.len(), 1);
    let after_first = h.registry.get_all().await.expect("get all");

    let second = h.supervisor.reconcile().await;
    assert_eq!(second, ReconcileReport::default());
    assert_eq!(h.registry.get_all().await.expect("get all"), after_first);
    assert!(after_first.iter().any(|c| c.connection_id == kept.connection_id));
}

#[tokio::test]
#[serial]
async fn concurrent_reconciles_never_duplicate_a_pid() {
    let h = harness(62100, 62199).await;
    for remote in [8080, 8081, 8082] {
        let port = free_port();
        let argv = external_forward(TARGET, port, remote, "maintenance");
        h.host.add_process("aws", &as_strs(&argv), Some(port));
    }

    let (a, b, c) = tokio::join!(
        h.supervisor.reconcile(),
        h.supervisor.reconcile(),
        h.supervisor.reconcile()
    );
    assert_eq!(a.adopted.len() + b.adopted.len() + c.adopted.len(), 3);

    let all = h.registry.get_all().await.expect("get all");
    let pids: HashSet<u32> = all.iter().map(|c| c.pid).collect();
    assert_eq!(all.len(), 3);
    assert_eq!(pids.len(), 3);
}

#[tokio::test]
#[serial]
async fn enumeration_failure_changes_nothing() {
    let h = harness(62100, 62199).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    h.host.exit(connection.pid);
    h.host.set_fail_listing(true);

    let report = h.supervisor.reconcile().await;
    assert!(report.is_empty());
    let listed = h.supervisor.list_active().await.expect("list still answers");
    assert_eq!(listed, vec![connection.clone()]);

    h.host.set_fail_listing(false);
    assert_eq!(h.supervisor.reconcile().await.pruned, vec![connection.connection_id]);
}

#[tokio::test]
#[serial]
async fn list_active_reconciles_first() {
    let h = harness(62100, 62199).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    h.host.exit(connection.pid);

    let port = free_port();
    let argv = external_forward(TARGET, port, 9000, "maintenance");
    let pid = h.host.add_process("aws", &as_strs(&argv), Some(port));

    let listed = h.supervisor.list_active().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid, pid);
}

#[tokio::test]
#[serial]
async fn tunnels_survive_a_registry_reset() {
    let h = harness(62100, 62199).await;
    let launched = h.supervisor.launch(forward(8080)).await.expect("launch");

    // Fresh store, same live processes: as after a restart with a lost db.
    let pool = db::connect_memory().await.expect("db connect");
    let registry = ConnectionRegistry::new(KvStore::new(Arc::new(pool)));
    let restarted = Supervisor::new(
        Arc::new(test_config(62100, 62199)),
        registry.clone(),
        Arc::clone(&h.host) as Arc<dyn ProcessTable>,
        Arc::clone(&h.host) as Arc<dyn Launcher>,
        Platform::Linux,
    );

    let listed = restarted.list_active().await.expect("list");
    assert_eq!(listed.len(), 1);
    let recovered = &listed[0];
    assert_eq!(recovered.connection_id, launched.connection_id);
    assert_eq!(recovered.pid, launched.pid);
    assert_eq!(recovered.created_at, launched.created_at);
    assert_eq!(recovered.local_port, launched.local_port);
    assert_eq!(recovered.remote_port, launched.remote_port);
    assert_eq!(recovered.method, launched.method);
}
