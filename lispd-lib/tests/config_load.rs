use lispd_lib::config::{load_from_path, DeviceMode};
use std::fs;
use std::path::PathBuf;

fn write_config(dir: &tempfile::TempDir, name: &str, toml: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, toml).unwrap();
    path
}

#[test]
fn loads_minimal_xtr_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "minimal.toml",
        r#"
mode = "xtr"

[[eid]]
prefix = "10.0.0.0/24"

[[map-resolver]]
address = "192.0.2.1"

[[map-server]]
address = "192.0.2.2"
key = "secret"
"#,
    );

    let cfg = load_from_path(&path).unwrap();
    assert_eq!(cfg.mode, DeviceMode::Xtr);
    assert_eq!(cfg.mtu, 1500);
    assert_eq!(cfg.eids.len(), 1);
    assert_eq!(cfg.eids[0].prefix.to_string(), "10.0.0.0/24");
    assert!(cfg.eids[0].iid.is_none());
    let ms = &cfg.map_servers[0];
    assert_eq!(ms.key_id, 1, "HMAC-SHA1-96 by default");
    assert!(ms.want_map_notify, "map-notify requested by default");
    assert!(!ms.proxy_reply);
}

#[test]
fn loads_full_options_and_instance_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "full.toml",
        r#"
mode = "mn"
mtu = 1400
debug = 2
status_socket = "/run/lispd.status"

[[eid]]
prefix = "10.0.0.0/24"
iid = 27

[[map-resolver]]
address = "192.0.2.1"

[[map-server]]
address = "192.0.2.2"
key = "secret"
key-id = 2
proxy-reply = true
want-map-notify = false

[[rtr]]
address = "198.51.100.7"

[[interface]]
name = "eth0"
"#,
    );

    let cfg = load_from_path(&path).unwrap();
    assert_eq!(cfg.mode, DeviceMode::Mn);
    assert_eq!(cfg.mtu, 1400);
    assert_eq!(cfg.debug, 2);
    assert_eq!(cfg.eids[0].iid, Some(27));
    assert_eq!(cfg.map_servers[0].key_id, 2);
    assert!(cfg.map_servers[0].proxy_reply);
    assert!(!cfg.map_servers[0].want_map_notify);
    assert_eq!(cfg.rtrs.len(), 1);
    assert_eq!(cfg.interfaces[0].name, "eth0");
}

#[test]
fn xtr_without_a_map_resolver_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "no-resolver.toml",
        r#"
mode = "xtr"

[[eid]]
prefix = "10.0.0.0/24"

[[map-server]]
address = "192.0.2.2"
key = "secret"
"#,
    );
    let err = load_from_path(&path).unwrap_err();
    assert!(err.to_string().contains("map-resolver"), "got: {err}");
}

#[test]
fn mobile_node_registers_exactly_one_eid() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "mn-two-eids.toml",
        r#"
mode = "mn"

[[eid]]
prefix = "10.0.0.0/24"

[[eid]]
prefix = "10.1.0.0/24"

[[map-resolver]]
address = "192.0.2.1"

[[map-server]]
address = "192.0.2.2"
key = "secret"
"#,
    );
    assert!(load_from_path(&path).is_err());
}

#[test]
fn unknown_key_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "bad-key-id.toml",
        r#"
mode = "xtr"

[[eid]]
prefix = "10.0.0.0/24"

[[map-resolver]]
address = "192.0.2.1"

[[map-server]]
address = "192.0.2.2"
key = "secret"
key-id = 9
"#,
    );
    let err = load_from_path(&path).unwrap_err();
    assert!(err.to_string().contains("key-id"), "got: {err}");
}

#[test]
fn map_server_mode_requires_sites() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "ms-empty.toml", "mode = \"ms\"\n");
    assert!(load_from_path(&path).is_err());

    let path = write_config(
        &dir,
        "ms-ok.toml",
        r#"
mode = "ms"

[[site]]
prefix = "10.0.0.0/16"
key = "site-secret"
proxy-reply = true
"#,
    );
    let cfg = load_from_path(&path).unwrap();
    assert_eq!(cfg.sites.len(), 1);
    assert!(cfg.sites[0].proxy_reply);
}

#[test]
fn bad_prefix_strings_surface_the_offending_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "bad-prefix.toml",
        r#"
mode = "xtr"

[[eid]]
prefix = "10.0.0.0/40"

[[map-resolver]]
address = "192.0.2.1"

[[map-server]]
address = "192.0.2.2"
key = "secret"
"#,
    );
    let err = load_from_path(&path).unwrap_err();
    assert!(err.to_string().contains("10.0.0.0/40"), "got: {err}");
}

#[test]
fn debug_level_out_of_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "bad-debug.toml",
        r#"
mode = "xtr"
debug = 7

[[eid]]
prefix = "10.0.0.0/24"

[[map-resolver]]
address = "192.0.2.1"

[[map-server]]
address = "192.0.2.2"
key = "secret"
"#,
    );
    assert!(load_from_path(&path).is_err());
}
