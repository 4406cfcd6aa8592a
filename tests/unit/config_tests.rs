use std::path::PathBuf;

use tunnel_warden::ports::Preferences;
use tunnel_warden::{config::GlobalConfig, AppError};

fn sample_toml(data_dir: &str) -> String {
    format!(
        r#"
data_dir = '{data_dir}'

[ports]
start = 61000
end = 61100
probe_attempts = 5
probe_timeout_ms = 100

[launcher]
executable = "aws"
terminal = "xterm"

[discovery]
attempts = 4
delay_ms = 50

[termination]
grace_seconds = 1

[reconcile]
interval_seconds = 30

[[targets]]
name = "bastion"

[[targets.ports]]
remote_port = 3389
local_port = 53389

[[targets.ports]]
remote_port = 5432
local_port = 55432
remote_host = "db.internal"
"#
    )
}

#[test]
fn parses_valid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"));

    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");

    assert_eq!(config.ports.start, 61000);
    assert_eq!(config.ports.end, 61100);
    assert_eq!(config.launcher.terminal, "xterm");
    assert_eq!(config.discovery.attempts, 4);
    assert_eq!(config.discovery_delay().as_millis(), 50);
    assert_eq!(config.termination_grace().as_secs(), 1);
    assert_eq!(config.probe_timeout().as_millis(), 100);
    assert_eq!(config.reconcile.interval_seconds, 30);
    assert_eq!(config.db_path(), temp.path().join("registry.db"));
}

#[test]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config.ports.start, 60000);
    assert_eq!(config.ports.end, 65535);
    assert_eq!(config.ports.probe_attempts, 20);
    assert_eq!(config.discovery.attempts, 10);
    assert_eq!(config.discovery.delay_ms, 1000);
    assert_eq!(config.termination.grace_seconds, 3);
    assert!(config.targets.is_empty());
    assert!(config.data_dir.ends_with(".tunnel-warden"));
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::load_or_default(temp.path().join("absent.toml"))
        .expect("defaults load");
    assert_eq!(config, GlobalConfig::default());
}

#[test]
fn loads_from_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, sample_toml(temp.path().to_str().expect("utf8 path")))
        .expect("write config");

    let config = GlobalConfig::load_or_default(&path).expect("config loads");
    assert_eq!(config.data_dir, PathBuf::from(temp.path()));
    assert_eq!(config.targets.len(), 1);
}

#[test]
fn rejects_inverted_port_range() {
    let result = GlobalConfig::from_toml_str("[ports]\nstart = 62000\nend = 61000\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn rejects_zero_probe_attempts() {
    let result = GlobalConfig::from_toml_str("[ports]\nprobe_attempts = 0\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn rejects_zero_discovery_attempts() {
    let result = GlobalConfig::from_toml_str("[discovery]\nattempts = 0\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn rejects_empty_launcher() {
    let result = GlobalConfig::from_toml_str("[launcher]\nexecutable = \"  \"\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn rejects_zero_sticky_port() {
    let toml = r#"
[[targets]]
name = "web"

[[targets.ports]]
remote_port = 80
local_port = 0
"#;
    let result = GlobalConfig::from_toml_str(toml);
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn rejects_malformed_toml() {
    let result = GlobalConfig::from_toml_str("[ports\nstart = 1");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn sticky_lookup_matches_name_port_and_host() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::from_toml_str(&sample_toml(
        temp.path().to_str().expect("utf8 path"),
    ))
    .expect("config parses");

    assert_eq!(config.port_range(), (61000, 61100));
    assert_eq!(config.sticky_port("bastion", 3389, None), Some(53389));
    assert_eq!(config.sticky_port("bastion", 5432, Some("db.internal")), Some(55432));
    assert_eq!(config.sticky_port("bastion", 5432, None), None);
    assert_eq!(config.sticky_port("bastion", 3389, Some("db.internal")), None);
    assert_eq!(config.sticky_port("other", 3389, None), None);
}
