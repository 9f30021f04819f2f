mod common;

use common::{Script, Suite, rsa_key, spawn_server};
use sshenum::{DEFAULT_CLIENT_ID, Error, ProbeConfig, check_user};
use std::fs;
use std::path::Path;
use std::time::Duration;

fn probe(port: u16, user: &str, ssh_dir: &Path) -> Result<bool, Error> {
    check_user(&ProbeConfig {
        host: "127.0.0.1",
        port,
        user,
        client_id: DEFAULT_CLIENT_ID,
        identity_prefix: "id_rsa",
        ssh_dir,
        timeout: Duration::from_secs(5),
    })
}

#[test]
fn nonexistent_user_is_reported_absent() {
    let dir = tempfile::tempdir().unwrap();
    let (port, handle) = spawn_server(Script::AbsentUser, Suite::default(), rsa_key(1024));
    let present = probe(port, "alice", dir.path()).unwrap();
    assert!(!present);
    handle.join().unwrap();
}

#[test]
fn info_request_then_close_means_user_exists() {
    let dir = tempfile::tempdir().unwrap();
    let (port, handle) = spawn_server(Script::PresentUser, Suite::default(), rsa_key(1024));
    let present = probe(port, "bob", dir.path()).unwrap();
    assert!(present);
    handle.join().unwrap();
}

#[test]
fn full_success_path_opens_a_channel() {
    let dir = tempfile::tempdir().unwrap();
    let (port, handle) = spawn_server(Script::SuccessChannel, Suite::default(), rsa_key(1024));
    let present = probe(port, "root", dir.path()).unwrap();
    assert!(present);
    handle.join().unwrap();
}

#[test]
fn cbc_and_sha1_suite_also_completes() {
    let dir = tempfile::tempdir().unwrap();
    let suite = Suite {
        kex: "diffie-hellman-group1-sha1",
        enc: "aes128-cbc",
        mac: "hmac-sha1",
    };
    let (port, handle) = spawn_server(Script::AbsentUser, suite, rsa_key(1024));
    let present = probe(port, "alice", dir.path()).unwrap();
    assert!(!present);
    handle.join().unwrap();
}

#[test]
fn short_host_key_modulus_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (port, handle) = spawn_server(Script::AbsentUser, Suite::default(), rsa_key(768));
    let err = probe(port, "alice", dir.path()).unwrap_err();
    assert!(matches!(err, Error::WeakHostKey(bits) if bits < 1024));
    handle.join().unwrap();
}

#[test]
fn tampered_packet_fails_mac_verification() {
    let dir = tempfile::tempdir().unwrap();
    let (port, handle) = spawn_server(Script::TamperMac, Suite::default(), rsa_key(1024));
    let err = probe(port, "alice", dir.path()).unwrap_err();
    assert!(matches!(err, Error::MacMismatch));
    handle.join().unwrap();
}

#[test]
fn host_key_is_recorded_once_across_probes() {
    let dir = tempfile::tempdir().unwrap();
    let key = rsa_key(1024);

    let (port, handle) = spawn_server(Script::AbsentUser, Suite::default(), key.clone());
    probe(port, "alice", dir.path()).unwrap();
    handle.join().unwrap();

    let known_hosts = dir.path().join("known_hosts");
    let first = fs::read_to_string(&known_hosts).unwrap();
    assert_eq!(first.lines().count(), 1);
    assert!(first.starts_with("127.0.0.1 ssh-rsa "));

    // Same host key again: trust on first use must not append a duplicate
    let (port, handle) = spawn_server(Script::AbsentUser, Suite::default(), key);
    probe(port, "bob", dir.path()).unwrap();
    handle.join().unwrap();

    let second = fs::read_to_string(&known_hosts).unwrap();
    assert_eq!(second, first);
}
