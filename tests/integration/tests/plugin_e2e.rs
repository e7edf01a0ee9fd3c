//! End-to-end tests: real plugin binary against a mock Egide server.

use std::collections::BTreeMap;

use egide_kms_integration_tests::{MockEgide, TestPlugin};

const CLIENT_ID: &str = "client-1";
const CLIENT_SECRET: &str = "secret-1";
const KEY_ID: &str = "test-key";

fn universal_args() -> Vec<&'static str> {
    vec![
        "--ua-client-id",
        CLIENT_ID,
        "--ua-client-secret",
        CLIENT_SECRET,
    ]
}

#[tokio::test]
async fn test_round_trip_and_health_through_full_stack() {
    let mock = MockEgide::start(CLIENT_ID, CLIENT_SECRET, KEY_ID).await.unwrap();
    let plugin = TestPlugin::start(&mock.base_url(), 18731, &universal_args())
        .await
        .unwrap();

    let mut client = plugin.client().await.unwrap();

    // Status certifies the whole chain, backend included.
    let status = client.status().await.unwrap();
    assert_eq!(status.version, "v2");
    assert_eq!(status.healthz, "ok");
    assert_eq!(status.key_id, KEY_ID);

    // Encrypt/decrypt round-trip preserves the payload byte for byte.
    let plaintext = b"storage encryption key material";
    let encrypted = client.encrypt("uid-1", plaintext).await.unwrap();
    assert_eq!(encrypted.key_id, KEY_ID);
    assert!(encrypted.annotations.is_empty());

    let decrypted = client
        .decrypt("uid-2", &encrypted.ciphertext, &encrypted.key_id, BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(decrypted, plaintext);

    // Decrypting with an unknown key is a call-level error, nothing more.
    let result = client
        .decrypt("uid-3", &encrypted.ciphertext, "other-key", BTreeMap::new())
        .await;
    assert!(result.is_err());

    // The connection and the plugin survived the failed call.
    let status = client.status().await.unwrap();
    assert_eq!(status.healthz, "ok");

    // External monitors get a fresh end-to-end probe.
    let resp = reqwest::get(plugin.healthz_url()).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");

    mock.stop().await;
}

#[tokio::test]
async fn test_universal_auth_has_precedence_over_identity_id() {
    let mock = MockEgide::start(CLIENT_ID, CLIENT_SECRET, KEY_ID).await.unwrap();

    // A leftover identity id must not shadow explicit client credentials.
    let mut args = universal_args();
    args.extend(["--identity-id", "machine-1"]);
    let _plugin = TestPlugin::start(&mock.base_url(), 18732, &args)
        .await
        .unwrap();

    assert_eq!(mock.logins(), vec!["universal".to_string()]);

    mock.stop().await;
}

#[tokio::test]
async fn test_startup_fails_without_credentials() {
    let mock = MockEgide::start(CLIENT_ID, CLIENT_SECRET, KEY_ID).await.unwrap();

    let output = TestPlugin::run_to_exit(&mock.base_url(), 0, &[]).unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no valid authentication"),
        "stderr: {}",
        stderr
    );
    // Nothing was hit on the backend.
    assert!(mock.logins().is_empty());

    mock.stop().await;
}

// Uses a multi-threaded runtime: the body blocks on `run_to_exit`'s synchronous
// `Command::output()`, so the in-process mock server needs another worker thread
// to answer the plugin's login request instead of being starved.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_fails_when_login_rejected() {
    let mock = MockEgide::start(CLIENT_ID, CLIENT_SECRET, KEY_ID).await.unwrap();

    let output = TestPlugin::run_to_exit(
        &mock.base_url(),
        0,
        &["--ua-client-id", CLIENT_ID, "--ua-client-secret", "wrong"],
    )
    .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("UNIVERSAL_MACHINE_IDENTITY"),
        "stderr: {}",
        stderr
    );
    // The failing strategy was the only one attempted.
    assert_eq!(mock.logins(), vec!["universal".to_string()]);

    mock.stop().await;
}

#[tokio::test]
async fn test_sigterm_exits_cleanly_and_removes_socket() {
    let mock = MockEgide::start(CLIENT_ID, CLIENT_SECRET, KEY_ID).await.unwrap();
    let mut plugin = TestPlugin::start(&mock.base_url(), 18733, &universal_args())
        .await
        .unwrap();

    plugin.terminate().unwrap();
    let status = plugin.wait_for_exit().await.unwrap();

    assert!(status.success(), "exit status: {}", status);
    assert!(!plugin.socket_path.exists());

    mock.stop().await;
}

#[tokio::test]
async fn test_healthz_degrades_when_backend_unreachable() {
    let mock = MockEgide::start(CLIENT_ID, CLIENT_SECRET, KEY_ID).await.unwrap();
    let plugin = TestPlugin::start(&mock.base_url(), 18734, &universal_args())
        .await
        .unwrap();

    let resp = reqwest::get(plugin.healthz_url()).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // Take the backend away; probes must flip to 503 while the plugin stays up.
    mock.stop().await;

    let resp = reqwest::get(plugin.healthz_url()).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    let mut client = plugin.client().await.unwrap();
    assert!(client.status().await.is_err());
}
