//! End-to-end tests of the secpol binary.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use predicates::prelude::*;
use secpol_image::{CanonicalTarHasher, LayerHasher};
use secpol_oci::image::media_types;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const OPEN_DOOR_BASE64: &str =
    "eyJhbGxvd19hbGwiOnRydWUsImNvbnRhaW5lcnMiOnsibGVuZ3RoIjowLCJlbGVtZW50cyI6e319fQ==";

fn secpol() -> Command {
    let mut cmd = Command::cargo_bin("secpol").unwrap();
    cmd.env_remove("RUST_LOG").env_remove("SECPOL_CONFIG");
    cmd
}

fn write(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path.display().to_string()
}

fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[test]
fn allow_all_prints_the_open_door_policy() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "group.json", r#"{"allow_all": true}"#);

    // No configuration file exists; allow_all never reads it.
    secpol()
        .args(["-i", &input, "--config", "/nonexistent/config.json"])
        .assert()
        .success()
        .stdout(format!("{OPEN_DOOR_BASE64}\n"));
}

#[test]
fn allow_all_from_toml_with_json_line() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "group.toml", "allow_all = true\n");

    secpol()
        .args(["-i", &input, "--json"])
        .assert()
        .success()
        .stdout(format!(
            "{{\"allow_all\":true,\"containers\":{{\"length\":0,\"elements\":{{}}}}}}\n{OPEN_DOOR_BASE64}\n"
        ));
}

#[test]
fn missing_config_fails_without_output() {
    let dir = TempDir::new().unwrap();
    let input = write(
        dir.path(),
        "group.json",
        r#"{"containers": [{"image_name": "alpine"}]}"#,
    );

    secpol()
        .args(["-i", &input, "--config", &dir.path().join("absent.json").display().to_string()])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn malformed_input_fails_without_output() {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "group.yaml", "containers: [unterminated\n");

    secpol()
        .args(["-i", &input])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

#[test]
fn conflicting_credentials_fail_validation() {
    let dir = TempDir::new().unwrap();
    let config = write(dir.path(), "config.json", r#"{"version": "1"}"#);
    let input = write(
        dir.path(),
        "group.json",
        r#"{"containers": [{"image_name": "alpine",
            "auth": {"username": "u", "password": "p", "token": "t"}}]}"#,
    );

    secpol()
        .args(["-i", &input, "--config", &config])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Invalid policy input"));
}

#[test]
fn compiles_against_a_registry() {
    let mut layer_builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(3);
    header.set_mode(0o755);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(1_700_000_000);
    header.set_entry_type(tar::EntryType::Regular);
    layer_builder
        .append_data(&mut header, "usr/bin/app", &b"app"[..])
        .unwrap();
    let layer = layer_builder.into_inner().unwrap();
    let expected_root = CanonicalTarHasher.root_digest(&mut &layer[..]).unwrap();

    let image_config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Entrypoint": ["/usr/bin/app"], "Cmd": ["--serve"]},
        "rootfs": {"type": "layers", "diff_ids": []}
    })
    .to_string();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::MANIFEST,
        "config": {"mediaType": media_types::CONFIG, "digest": digest(image_config.as_bytes()), "size": image_config.len()},
        "layers": [{"mediaType": media_types::LAYER_TAR, "digest": digest(&layer), "size": layer.len()}]
    })
    .to_string();

    let mut server = mockito::Server::new();
    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_body(&manifest)
        .create();
    server
        .mock("GET", format!("/v2/team/app/blobs/{}", digest(image_config.as_bytes())).as_str())
        .with_status(200)
        .with_body(&image_config)
        .create();
    server
        .mock("GET", format!("/v2/team/app/blobs/{}", digest(&layer)).as_str())
        .with_status(200)
        .with_body(&layer)
        .create();

    let dir = TempDir::new().unwrap();
    let config = write(
        dir.path(),
        "config.json",
        r#"{
            "version": "1",
            "env_defaults": {"platform_bootstrap": {"environment_variables": [{"name": "TERM", "value": "xterm"}]}},
            "mount": {
                "source_table": [{"mount_type": "emptyDir", "source": "sandbox:///tmp/atlas/emptydir/.+"}],
                "default_mounts_global_inject_policy": [
                    {"destination": "/dev/shm", "source": "sandbox:///dev/shm", "type": "bind", "options": ["rbind", "rw"]}
                ]
            }
        }"#,
    );
    let input = write(
        dir.path(),
        "group.json",
        &serde_json::json!({
            "containers": [{
                "image_name": format!("{}/team/app:v1", server.host_with_port()),
                "mounts": [{"mount_type": "emptyDir", "mount_path": "/scratch"}]
            }]
        })
        .to_string(),
    );

    let output = secpol()
        .args(["-i", &input, "--config", &config, "--json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(BASE64.decode(lines[1]).unwrap(), lines[0].as_bytes());

    let policy: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(policy["allow_all"], false);
    assert_eq!(policy["containers"]["length"], 1);

    let container = &policy["containers"]["elements"]["0"];
    assert_eq!(container["layers"]["elements"]["0"], expected_root.as_str());
    assert_eq!(container["command"]["length"], 2);
    assert_eq!(container["command"]["elements"]["1"], "--serve");
    assert_eq!(container["working_dir"], "/");
    assert_eq!(container["env_rules"]["elements"]["0"]["rule"], "TERM=xterm");
    assert_eq!(container["mounts"]["length"], 2);
    assert_eq!(container["mounts"]["elements"]["0"]["source"], "sandbox:///tmp/atlas/emptydir/.+");
    assert_eq!(container["mounts"]["elements"]["0"]["options"]["elements"]["2"], "rw");
    assert_eq!(container["mounts"]["elements"]["1"]["destination"], "/dev/shm");
}
