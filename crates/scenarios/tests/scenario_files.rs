//! Loading scenario files from disk

use scenarios::{ConfigError, ImpairmentKind, Presets, ProtocolTest, ScenarioSpec};
use std::io::Write;

#[test]
fn test_load_scenario_file() {
    let text = r#"{
        "name": "wan_handshake",
        "description": "handshake over a slow link",
        "nodes": [{"name": "client"}, {"name": "server"}],
        "links": [{
            "a": "client", "b": "server",
            "addr_a": "10.9.0.1", "addr_b": "10.9.0.2", "prefix_len": 24,
            "mtu": 1400, "iface_a": "wan-c", "iface_b": "wan-s"
        }],
        "impairments": [{
            "node": "client", "link": 0,
            "profile": {"name": "wan", "kind": "latency", "magnitude": "80ms", "variance": "10ms"}
        }],
        "protocol_test": {"test": "tcp_handshake", "client": "client", "server": "server", "port": 443}
    }"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();

    let spec = ScenarioSpec::from_path(file.path()).unwrap();
    assert_eq!(spec.name, "wan_handshake");
    assert_eq!(spec.links[0].iface_a.as_deref(), Some("wan-c"));
    assert_eq!(spec.impairments[0].profile.kind(), ImpairmentKind::Latency);
    match &spec.protocol_test {
        ProtocolTest::TcpHandshake { port, policy, .. } => {
            assert_eq!(*port, 443);
            assert!(policy.verify_acknowledgements);
        }
        other => panic!("unexpected test {:?}", other),
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ScenarioSpec::from_path(dir.path().join("absent.json"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_presets_survive_disk_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    for spec in Presets::basic_scenarios() {
        let path = dir.path().join(format!("{}.json", spec.name));
        std::fs::write(&path, spec.to_json_pretty().unwrap()).unwrap();
        assert_eq!(ScenarioSpec::from_path(&path).unwrap(), spec);
    }
}
