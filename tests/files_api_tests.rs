//! File API tests: round trips, versioning, idempotent uploads, restore,
//! rename, delete and the boundary behaviors.

mod common;

use common::TestApp;

const T0: &str = "2024-01-01T00:00:00Z";
const T1: &str = "2024-01-01T01:00:00Z";

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_returns_ok() {
    let app = TestApp::new().await;

    let response = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body.get("uptime_secs").is_some());
    assert!(body.get("timestamp").is_some());
}

// ============================================================================
// Basic round trip (scenario: fresh root, one upload)
// ============================================================================

#[tokio::test]
async fn test_upload_then_list_and_download() {
    let app = TestApp::new().await;

    let response = app.upload_safe("note.txt", b"a", "alice", T0).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["file"]["version"], 1);
    assert_eq!(body["file"]["size"], 1);

    let listing: serde_json::Value = app
        .client
        .get(app.url("/files"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = listing.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "note.txt");
    assert_eq!(entries[0]["version"], 1);
    assert_eq!(entries[0]["size"], 1);
    assert_eq!(entries[0]["client_id"], "alice");
    assert_eq!(entries[0]["total_versions"], 1);

    let download = app.download("note.txt").await;
    assert_eq!(download.status(), 200);
    assert_eq!(download.bytes().await.unwrap().as_ref(), b"a");
}

// ============================================================================
// Versioning (scenario: two uploads of diverging content)
// ============================================================================

#[tokio::test]
async fn test_second_upload_creates_version_two() {
    let app = TestApp::new().await;

    app.upload_safe("note.txt", b"a", "alice", T0).await;
    let response = app.upload_safe("note.txt", b"ab", "alice", T1).await;
    assert_eq!(response.status(), 200);

    let versions: serde_json::Value = app
        .client
        .get(app.url("/files/note.txt/versions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let versions = versions.as_array().unwrap();
    assert_eq!(versions.len(), 2);
    // Latest first.
    assert_eq!(versions[0]["version"], 2);
    assert_eq!(versions[0]["size"], 2);
    assert_eq!(versions[1]["version"], 1);
    assert_eq!(versions[1]["size"], 1);

    // Historic version download is byte-identical to what was uploaded.
    let v1 = app
        .client
        .get(app.url("/files/note.txt/versions/1/download"))
        .send()
        .await
        .unwrap();
    assert_eq!(v1.status(), 200);
    assert_eq!(v1.bytes().await.unwrap().as_ref(), b"a");

    let current = app.download("note.txt").await;
    assert_eq!(current.bytes().await.unwrap().as_ref(), b"ab");
}

// ============================================================================
// Idempotent re-upload
// ============================================================================

#[tokio::test]
async fn test_identical_reupload_creates_no_version() {
    let app = TestApp::new().await;

    app.upload_safe("note.txt", b"a", "alice", T0).await;
    let response = app.upload_safe("note.txt", b"a", "alice", T1).await;
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body["message"],
        "File already up-to-date, no new version created"
    );
    assert_eq!(body["duplicate"], true);
    assert_eq!(body["file"]["version"], 1);

    let versions = app.state.metadata.get_all_versions("note.txt").await.unwrap();
    assert_eq!(versions.len(), 1);
}

// ============================================================================
// Version numbering invariant
// ============================================================================

#[tokio::test]
async fn test_versions_are_contiguous_from_one() {
    let app = TestApp::new().await;

    for (i, content) in [b"1".as_slice(), b"22", b"333", b"4444"].iter().enumerate() {
        let lm = format!("2024-01-01T0{}:00:00Z", i);
        let response = app.upload_safe("note.txt", content, "alice", &lm).await;
        assert_eq!(response.status(), 200);
    }

    let records = app.state.metadata.get_all_versions("note.txt").await.unwrap();
    let mut versions: Vec<u64> = records.iter().map(|r| r.version).collect();
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3, 4]);
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test]
async fn test_restore_copies_old_bytes_as_new_version() {
    let app = TestApp::new().await;

    app.upload_safe("note.txt", b"a", "alice", T0).await;
    app.upload_safe("note.txt", b"ab", "alice", T1).await;

    let response = app
        .client
        .post(app.url("/files/note.txt/restore/1"))
        .json(&serde_json::json!({ "client_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["file"]["version"], 3);
    assert_eq!(body["file"]["restored_from"], 1);

    let current = app.download("note.txt").await;
    assert_eq!(current.bytes().await.unwrap().as_ref(), b"a");
}

#[tokio::test]
async fn test_restore_missing_version_is_404() {
    let app = TestApp::new().await;
    app.upload_safe("note.txt", b"a", "alice", T0).await;

    let response = app
        .client
        .post(app.url("/files/note.txt/restore/9"))
        .json(&serde_json::json!({ "client_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

// ============================================================================
// Rename
// ============================================================================

#[tokio::test]
async fn test_rename_moves_blobs_and_history() {
    let app = TestApp::new().await;

    app.upload_safe("old.txt", b"a", "alice", T0).await;
    app.upload_safe("old.txt", b"ab", "alice", T1).await;

    let response = app
        .client
        .post(app.url("/files/old.txt/rename"))
        .json(&serde_json::json!({ "new_name": "new.txt" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Old name is fully gone.
    assert_eq!(app.download("old.txt").await.status(), 404);
    assert!(app.state.metadata.get_all_versions("old.txt").await.unwrap().is_empty());

    // New name carries the exact history the old one had.
    let versions = app.state.metadata.get_all_versions("new.txt").await.unwrap();
    assert_eq!(versions.len(), 2);
    let current = app.download("new.txt").await;
    assert_eq!(current.bytes().await.unwrap().as_ref(), b"ab");
}

#[tokio::test]
async fn test_rename_to_existing_name_is_409() {
    let app = TestApp::new().await;

    app.upload_safe("a.txt", b"a", "alice", T0).await;
    app.upload_safe("b.txt", b"b", "alice", T0).await;

    let response = app
        .client
        .post(app.url("/files/a.txt/rename"))
        .json(&serde_json::json!({ "new_name": "b.txt" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_rename_missing_file_is_404() {
    let app = TestApp::new().await;

    let response = app
        .client
        .post(app.url("/files/ghost.txt/rename"))
        .json(&serde_json::json!({ "new_name": "new.txt" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_unlists_but_keeps_history() {
    let app = TestApp::new().await;

    app.upload_safe("note.txt", b"a", "alice", T0).await;
    app.upload_safe("note.txt", b"ab", "alice", T1).await;

    let response = app
        .client
        .delete(app.url("/files/note.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Unlisted, current download gone.
    let listing: serde_json::Value = app
        .client
        .get(app.url("/files"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing.as_array().unwrap().is_empty());
    assert_eq!(app.download("note.txt").await.status(), 404);

    // History remains downloadable.
    let v1 = app
        .client
        .get(app.url("/files/note.txt/versions/1/download"))
        .send()
        .await
        .unwrap();
    assert_eq!(v1.status(), 200);
    assert_eq!(v1.bytes().await.unwrap().as_ref(), b"a");
}

#[tokio::test]
async fn test_delete_cascade_removes_history() {
    let app = TestApp::with_config(|c| c.storage.delete_cascade = true).await;

    app.upload_safe("note.txt", b"a", "alice", T0).await;
    app.upload_safe("note.txt", b"ab", "alice", T1).await;

    app.client
        .delete(app.url("/files/note.txt"))
        .send()
        .await
        .unwrap();

    assert!(app.state.metadata.get_all_versions("note.txt").await.unwrap().is_empty());
    let v1 = app
        .client
        .get(app.url("/files/note.txt/versions/1/download"))
        .send()
        .await
        .unwrap();
    assert_eq!(v1.status(), 404);
}

#[tokio::test]
async fn test_delete_missing_file_is_404() {
    let app = TestApp::new().await;

    let response = app
        .client
        .delete(app.url("/files/ghost.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn test_upload_missing_fields_is_400() {
    let app = TestApp::new().await;

    // file_name present but no client_id / last_modified / file.
    let form = reqwest::multipart::Form::new().text("file_name", "note.txt");
    let response = app
        .client
        .post(app.url("/files/upload-safe"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_upload_with_path_separator_is_400() {
    let app = TestApp::new().await;
    let response = app.upload_safe("../escape.txt", b"a", "alice", T0).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_download_missing_file_is_404() {
    let app = TestApp::new().await;
    assert_eq!(app.download("ghost.txt").await.status(), 404);
}

#[tokio::test]
async fn test_download_missing_version_is_404() {
    let app = TestApp::new().await;
    app.upload_safe("note.txt", b"a", "alice", T0).await;

    let response = app
        .client
        .get(app.url("/files/note.txt/versions/5/download"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_oversize_upload_is_413() {
    let app = TestApp::with_config(|c| c.server.max_upload_bytes = 1024).await;

    let big = vec![0x42u8; 8 * 1024];
    let response = app.upload_safe("big.bin", &big, "alice", T0).await;
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn test_current_blob_always_matches_latest_version() {
    let app = TestApp::new().await;

    app.upload_safe("note.txt", b"one", "alice", T0).await;
    app.upload_safe("note.txt", b"two", "alice", T1).await;

    let latest = app.state.metadata.get_latest("note.txt").await.unwrap().unwrap();
    let current = app.download("note.txt").await.bytes().await.unwrap();
    let versioned = app
        .client
        .get(app.url(&format!(
            "/files/note.txt/versions/{}/download",
            latest.version
        )))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(current, versioned);
    assert_eq!(latest.size as usize, current.len());
}
