//! End-to-end exercise of the sidecar core against a scripted control plane
//! on an in-memory transport.

use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::sync::watch;

use depot::link::protocol::{payload, read_frame, write_frame, Envelope, Route};
use depot::link::SessionEnd;
use depot::{Config, Depot};

const STORED_ID: &str = "11111111-1111-1111-1111-111111111111";
const GRANTED_ID: &str = "22222222-2222-2222-2222-222222222222";

async fn recv(peer: &mut DuplexStream) -> Envelope {
    let raw = read_frame(peer).await.unwrap();
    Envelope::decode(&raw).unwrap()
}

async fn send(peer: &mut DuplexStream, envelope: &Envelope) {
    let frame = envelope.encode().unwrap();
    write_frame(peer, &frame).await.unwrap();
}

#[tokio::test]
async fn test_full_session_against_scripted_control_plane() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    std::fs::write(temp.path().join(format!("{STORED_ID}.zip")), b"archive")?;
    std::fs::write(temp.path().join("notes.txt"), b"stray")?;

    let config = Arc::new(Config::parse_from([
        "depot",
        "--storage-path",
        temp.path().to_str().unwrap(),
        "--control-host",
        "control.test",
        "--control-token",
        "bearer-secret",
    ]));

    let (depot, mut manager) = Depot::new(config).await?;

    // Scan picked up the item and ignored the stray file.
    assert!(depot.item_exists(STORED_ID).await);
    assert_eq!(depot.stored_count().await, 1);

    let (ours, mut control) = tokio::io::duplex(64 * 1024);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let session =
        tokio::spawn(async move { manager.run_session(ours, &mut shutdown_rx).await });

    // Handshake: bearer credential and client identifier, first frame.
    let hello = recv(&mut control).await;
    assert_eq!(hello.route, "hello");
    assert_eq!(
        hello.data.get("token").and_then(|v| v.as_str()),
        Some("bearer-secret")
    );

    // A capacity report follows every (re)connect.
    let usage = recv(&mut control).await;
    assert_eq!(usage.route, "disk-usage");
    assert!(usage.data.get("total").and_then(|v| v.as_u64()).unwrap() > 0);

    // Control plane grants an upload.
    send(
        &mut control,
        &Envelope::request(
            Route::ExpectUpload,
            "cmd-1".to_string(),
            payload([("id", json!(GRANTED_ID))]),
        ),
    )
    .await;
    let ack = recv(&mut control).await;
    assert_eq!(ack.route, "expect-upload");
    assert_eq!(ack.correlation_id.as_deref(), Some("cmd-1"));

    // The upload handler consumes the grant exactly once.
    assert!(depot.consume_expected_upload(GRANTED_ID).await);
    assert!(!depot.consume_expected_upload(GRANTED_ID).await);

    // Bytes hit the disk, then the upload is recorded and reported.
    std::fs::write(depot.item_path(GRANTED_ID), b"uploaded-bytes")?;
    let size = depot.record_uploaded(GRANTED_ID).await?;
    assert_eq!(size, 14);

    let uploaded = recv(&mut control).await;
    assert_eq!(uploaded.route, "uploaded");
    assert_eq!(
        uploaded.data.get("id").and_then(|v| v.as_str()),
        Some(GRANTED_ID)
    );
    assert_eq!(uploaded.data.get("size").and_then(|v| v.as_u64()), Some(14));

    // Download authorization round-trips through the control plane.
    let verifier = {
        let depot = depot.clone();
        tokio::spawn(async move { depot.verify_download_token(STORED_ID, "tok").await })
    };
    let request = recv(&mut control).await;
    assert_eq!(request.route, "verify-download-token");
    assert_eq!(
        request.data.get("token").and_then(|v| v.as_str()),
        Some("tok")
    );
    send(
        &mut control,
        &Envelope::reply(
            Route::VerifyDownloadToken,
            request.correlation_id.clone(),
            payload([("allowed", json!(true)), ("name", json!("report.zip"))]),
        ),
    )
    .await;
    assert_eq!(verifier.await?, (true, "report.zip".to_string()));

    depot.downloaded(STORED_ID).await;
    let downloaded = recv(&mut control).await;
    assert_eq!(downloaded.route, "downloaded");

    // Control plane deletes the stored item: file goes, usage is reported,
    // the command is acked.
    send(
        &mut control,
        &Envelope::request(
            Route::Delete,
            "cmd-2".to_string(),
            payload([("id", json!(STORED_ID))]),
        ),
    )
    .await;
    let usage = recv(&mut control).await;
    assert_eq!(usage.route, "disk-usage");
    let deleted = recv(&mut control).await;
    assert_eq!(deleted.route, "deleted");
    assert_eq!(deleted.correlation_id.as_deref(), Some("cmd-2"));
    assert!(!depot.item_exists(STORED_ID).await);
    assert!(!depot.item_path(STORED_ID).exists());

    // Graceful shutdown: bye on the wire, then the session ends.
    shutdown_tx.send(true)?;
    let bye = recv(&mut control).await;
    assert_eq!(bye.route, "bye");
    drop(control);
    assert_eq!(session.await?, SessionEnd::Shutdown);

    Ok(())
}

#[tokio::test]
async fn test_verify_token_short_circuits_unknown_items() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(Config::parse_from([
        "depot",
        "--storage-path",
        temp.path().to_str().unwrap(),
        "--control-host",
        "control.test",
        "--control-token",
        "bearer-secret",
    ]));

    let (depot, _manager) = Depot::new(config).await?;

    // No round trip happens for an item we do not have, so this resolves
    // immediately even though no connection exists.
    let (allowed, name) = depot.verify_download_token(STORED_ID, "tok").await;
    assert!(!allowed);
    assert!(name.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_malformed_verify_response_denies() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    std::fs::write(temp.path().join(format!("{STORED_ID}.zip")), b"archive")?;

    let config = Arc::new(Config::parse_from([
        "depot",
        "--storage-path",
        temp.path().to_str().unwrap(),
        "--control-host",
        "control.test",
        "--control-token",
        "bearer-secret",
    ]));

    let (depot, mut manager) = Depot::new(config).await?;

    let (ours, mut control) = tokio::io::duplex(64 * 1024);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let session =
        tokio::spawn(async move { manager.run_session(ours, &mut shutdown_rx).await });

    recv(&mut control).await; // hello
    recv(&mut control).await; // disk-usage

    let verifier = {
        let depot = depot.clone();
        tokio::spawn(async move { depot.verify_download_token(STORED_ID, "tok").await })
    };
    let request = recv(&mut control).await;

    // "allowed" is a string instead of a bool.
    send(
        &mut control,
        &Envelope::reply(
            Route::VerifyDownloadToken,
            request.correlation_id.clone(),
            payload([("allowed", json!("yes")), ("name", json!("x"))]),
        ),
    )
    .await;

    assert_eq!(verifier.await?, (false, String::new()));

    shutdown_tx.send(true)?;
    drop(control);
    session.await?;
    Ok(())
}
