use serial_test::serial;
use tunnel_warden::models::connection::{ConnectionMethod, ConnectionStatus, SessionContext};
use tunnel_warden::models::target::Target;
use tunnel_warden::orchestrator::supervisor::LaunchRequest;
use tunnel_warden::AppError;

use super::test_helpers::{harness, TARGET};

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
async fn terminate_kills_and_clears_the_record() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    let other = h.supervisor.launch(forward(8081)).await.expect("launch");

    let terminated = h
        .supervisor
        .terminate(&connection.connection_id)
        .await
        .expect("terminate succeeds");
    assert_eq!(terminated.status, ConnectionStatus::Terminated);
    assert_eq!(terminated.connection_id, connection.connection_id);
    assert!(!h.host.is_alive(connection.pid));

    let listed = h.supervisor.list_active().await.expect("list");
    assert!(listed.iter().all(|c| c.connection_id != connection.connection_id));
    assert_eq!(listed, vec![other]);
}

#[tokio::test]
#[serial]
async fn terminating_unknown_id_is_not_found() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    let before = h.registry.get_all().await.expect("get all");

    let err = h
        .supervisor
        .terminate("port_i-0123456789abcdef0_1700000000_00000000")
        .await
        .expect_err("unknown id");
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(err.code(), "NOT_FOUND");
    assert_eq!(h.registry.get_all().await.expect("get all"), before);
    assert!(h.host.is_alive(connection.pid));
}

#[tokio::test]
#[serial]
async fn terminating_twice_reports_not_found() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");

    h.supervisor
        .terminate(&connection.connection_id)
        .await
        .expect("first terminate");
    assert!(matches!(
        h.supervisor.terminate(&connection.connection_id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
#[serial]
async fn already_exited_process_still_terminates() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    h.host.exit(connection.pid);

    let terminated = h
        .supervisor
        .terminate(&connection.connection_id)
        .await
        .expect("gone counts as terminated");
    assert_eq!(terminated.status, ConnectionStatus::Terminated);
    assert!(h.registry.get_all().await.expect("get all").is_empty());
}

#[tokio::test]
#[serial]
async fn surviving_process_is_readopted() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    h.host.set_survive_termination(true);

    h.supervisor
        .terminate(&connection.connection_id)
        .await
        .expect("best-effort terminate");
    assert!(h.registry.get_all().await.expect("get all").is_empty());
    assert!(h.host.is_alive(connection.pid));

    let listed = h.supervisor.list_active().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid, connection.pid);
    assert_eq!(listed[0].connection_id, connection.connection_id);
}

#[tokio::test]
#[serial]
async fn terminate_racing_reconcile_leaves_no_record() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");

    let (terminated, _) = tokio::join!(
        h.supervisor.terminate(&connection.connection_id),
        h.supervisor.reconcile()
    );
    terminated.expect("terminate succeeds");

    h.supervisor.reconcile().await;
    assert!(h.registry.get_all().await.expect("get all").is_empty());
}

#[tokio::test]
#[serial]
async fn reused_pid_is_not_killed() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    h.host.reuse_pid(connection.pid, "vim", &["vim", "notes.txt"]);

    let terminated = h
        .supervisor
        .terminate(&connection.connection_id)
        .await
        .expect("stale record is still cleared");
    assert_eq!(terminated.status, ConnectionStatus::Terminated);
    assert!(h.host.is_alive(connection.pid));
    assert!(h.registry.get_all().await.expect("get all").is_empty());
}

#[tokio::test]
#[serial]
async fn unreadable_process_table_keeps_the_record() {
    let h = harness(62200, 62299).await;
    let connection = h.supervisor.launch(forward(8080)).await.expect("launch");
    h.host.set_fail_listing(true);

    let err = h
        .supervisor
        .terminate(&connection.connection_id)
        .await
        .expect_err("cannot verify the pid");
    assert!(matches!(err, AppError::Process(_)));
    assert!(h.host.is_alive(connection.pid));
    assert_eq!(
        h.registry.get_all().await.expect("get all"),
        vec![connection]
    );
}
