//! Supervisor end-to-end: spawn real worker processes, dispatch through the
//! public proxy, kill a worker externally and watch the fleet recover.

#![cfg(unix)]

use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use syncbox::Config;
use syncbox::supervisor::{Supervisor, SupervisorStatus};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn fetch_status(client: &reqwest::Client, url: &str) -> Option<SupervisorStatus> {
    let resp = client
        .get(url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .ok()?;
    resp.json().await.ok()
}

#[tokio::test]
async fn test_supervisor_spawns_dispatches_and_recovers() {
    let root = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.storage.shared_root = root.path().to_string_lossy().into_owned();
    config.supervisor.host = "127.0.0.1".to_string();
    config.supervisor.port = free_port().await;
    config.supervisor.worker_base_port = free_port().await;
    config.supervisor.min_instances = 2;
    config.supervisor.max_instances = 4;
    config.supervisor.health_check_interval_secs = 1;
    config.supervisor.unhealthy_kill_secs = 5;
    config.supervisor.spawn_stagger_ms = 100;
    config.supervisor.shutdown_grace_secs = 1;
    config.supervisor.worker_binary = env!("CARGO_BIN_EXE_syncbox-server").to_string();

    let supervisor = Supervisor::new(config.clone());
    let run_handle = tokio::spawn(supervisor.clone().run());

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", config.supervisor.port);
    let status_url = format!("{}/supervisor/status", base);

    // The fleet comes up healthy.
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut status = None;
    while Instant::now() < deadline {
        if let Some(s) = fetch_status(&client, &status_url).await {
            if s.healthy_servers >= 2 {
                status = Some(s);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    let status = status.expect("fleet never became healthy");
    assert!(status.healthy_servers <= status.total_servers);

    // Requests dispatch through the proxy to a worker.
    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"proxied".to_vec()).file_name("note.txt"),
        )
        .text("file_name", "note.txt")
        .text("client_id", "alice")
        .text("last_modified", "2024-01-01T00:00:00Z");
    let upload = client
        .post(format!("{}/files/upload-safe", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(upload.status(), 200);

    let listing = client.get(format!("{}/files", base)).send().await.unwrap();
    assert_eq!(listing.status(), 200);
    let listing: serde_json::Value = listing.json().await.unwrap();
    assert_eq!(listing.as_array().unwrap()[0]["name"], "note.txt");

    // Kill one worker out from under the supervisor.
    let victim_pid = status.servers[0].pid.expect("worker has a pid");
    let killed = std::process::Command::new("kill")
        .args(["-9", &victim_pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    // Requests keep being served by the survivor while the fleet refills;
    // the one-retry dispatch hides the dead worker.
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut recovered = false;
    while Instant::now() < deadline {
        let resp = client
            .get(format!("{}/files", base))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "listing must not fail during recovery");

        if let Some(s) = fetch_status(&client, &status_url).await {
            if s.healthy_servers >= 2 && s.servers.iter().all(|w| w.pid != Some(victim_pid)) {
                recovered = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(recovered, "fleet did not return to min_instances within 30s");

    // Tear down: stop the supervisor task and kill the remaining workers so
    // the test leaves no processes behind.
    let final_status = fetch_status(&client, &status_url).await;
    run_handle.abort();
    if let Some(status) = final_status {
        for worker in status.servers {
            if let Some(pid) = worker.pid {
                let _ = std::process::Command::new("kill")
                    .args(["-9", &pid.to_string()])
                    .status();
            }
        }
    }
}

#[tokio::test]
async fn test_proxy_returns_503_with_no_workers() {
    let root = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.storage.shared_root = root.path().to_string_lossy().into_owned();
    config.supervisor.host = "127.0.0.1".to_string();
    config.supervisor.port = free_port().await;
    config.supervisor.worker_base_port = free_port().await;
    // No workers at all: dispatch must degrade to 503, not hang.
    config.supervisor.min_instances = 0;
    config.supervisor.max_instances = 0;
    config.supervisor.health_check_interval_secs = 1;
    config.supervisor.worker_binary = env!("CARGO_BIN_EXE_syncbox-server").to_string();

    let supervisor = Supervisor::new(config.clone());
    let run_handle = tokio::spawn(supervisor.run());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://127.0.0.1:{}/files", config.supervisor.port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "service_unavailable");

    run_handle.abort();
}
