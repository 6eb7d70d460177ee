use crate::*;

/// Valid configuration apart from where the brokers are.
fn base_env(mqtt_url: &str, health_port: u16) -> Vec<(&'static str, String)> {
    vec![
        ("MQTT_URL", mqtt_url.to_string()),
        ("MQTT_TOPIC", "transit/vehicles".to_string()),
        ("MQTT_CLIENT_ID_PREFIX", "forwarder-it-".to_string()),
        ("MQTT_CLIENT_ID_SUFFIX_LENGTH", "6".to_string()),
        ("PULSAR_SERVICE_URL", "pulsar://127.0.0.1:6650".to_string()),
        ("PULSAR_TOPICS_PATTERN", "persistent://public/default/.*".to_string()),
        ("PULSAR_SUBSCRIPTION", "forwarder-it".to_string()),
        ("HEALTH_CHECK_PORT", health_port.to_string()),
    ]
}

fn run(vars: &[(&'static str, String)]) -> Option<Child> {
    let Some(bin) = daemon_bin() else {
        eprintln!("SKIP: forwarderd not built, run cargo build -p forwarderd first");
        return None;
    };
    let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
    Some(daemon_command(&bin, &vars).spawn().expect("failed to spawn forwarderd"))
}

#[test]
fn missing_required_variable_exits_1() {
    let Some(child) = run(&[]) else { return };
    let (status, output) = wait_for_exit(child, Duration::from_secs(20)).unwrap();
    assert_eq!(status.code(), Some(1), "{output}");
    assert!(output.contains("MQTT_URL must be defined"), "{output}");
}

#[test]
fn invalid_quality_level_exits_1() {
    let mut vars = base_env("mqtt://127.0.0.1:1883", free_port());
    vars.push(("MQTT_QOS", "3".to_string()));
    let Some(child) = run(&vars) else { return };
    let (status, output) = wait_for_exit(child, Duration::from_secs(20)).unwrap();
    assert_eq!(status.code(), Some(1), "{output}");
    assert!(output.contains("MQTT_QOS"), "{output}");
}

#[test]
fn unreachable_broker_exits_1() {
    let mqtt_port = free_port();
    let vars = base_env(&format!("mqtt://127.0.0.1:{mqtt_port}"), free_port());
    let Some(child) = run(&vars) else { return };
    let (status, output) = wait_for_exit(child, Duration::from_secs(30)).unwrap();
    assert_eq!(status.code(), Some(1), "{output}");
    assert!(output.contains("failed to connect to mqtt"), "{output}");
    assert!(output.contains("close health check server"), "{output}");
}

/// A broker that accepts TCP but never answers CONNECT keeps the daemon in
/// bring-up long enough to signal it there.
fn signal_during_startup(signal: libc::c_int, expected: i32) {
    let silent_broker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mqtt_port = silent_broker.local_addr().unwrap().port();
    let health_port = free_port();
    let vars = base_env(&format!("mqtt://127.0.0.1:{mqtt_port}"), health_port);
    let Some(child) = run(&vars) else { return };

    if let Err(e) = wait_for_port(health_port, Duration::from_secs(10)) {
        let _ = wait_for_exit(child, Duration::from_secs(1));
        panic!("{e}");
    }
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, signal) };
    assert_eq!(rc, 0);

    let (status, output) = wait_for_exit(child, Duration::from_secs(20)).unwrap();
    assert_eq!(status.code(), Some(expected), "{output}");
    assert!(output.contains("start exiting gracefully"), "{output}");
    drop(silent_broker);
}

#[test]
fn sigterm_during_startup_exits_143() {
    signal_during_startup(libc::SIGTERM, 143);
}

#[test]
fn sigint_during_startup_exits_130() {
    signal_during_startup(libc::SIGINT, 130);
}
