//! Process supervisor and load balancer.
//!
//! Owns the single public listener, spawns N backend workers over the shared
//! on-disk store, round-robin-dispatches requests across the healthy subset
//! and recovers failed workers within `[min_instances, max_instances]`.

pub mod proxy;
pub mod worker;

pub use worker::{WorkerProcess, resolve_worker_binary, spawn_worker, terminate_worker};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};

use crate::config::Config;
use crate::error::Result;

/// Timeout for one `/health` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Delay before replacing a crashed worker while other healthy workers
/// remain. A zero-healthy fleet respawns immediately instead.
const RESPAWN_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusInfo {
    pub port: u16,
    pub pid: Option<u32>,
    pub healthy: bool,
    pub uptime_secs: u64,
    pub last_health_check_secs_ago: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub proxy_port: u16,
    pub bind_address: String,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub shared_storage_root: String,
    pub servers: Vec<WorkerStatusInfo>,
}

pub struct Supervisor {
    config: Config,
    http: reqwest::Client,
    workers: Mutex<Vec<WorkerProcess>>,
    next_worker: AtomicUsize,
    next_port: AtomicU16,
}

impl Supervisor {
    pub fn new(config: Config) -> Arc<Self> {
        let next_port = AtomicU16::new(config.supervisor.worker_base_port);
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            workers: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
            next_port,
        })
    }

    /// Runs the supervisor: initial fleet, health loop, public proxy.
    /// Returns after ctrl-c once every worker has been shut down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let supervisor_config = self.config.supervisor.clone();

        // Staggered initial spawns: the first worker runs the metadata
        // migration; the pause keeps the rest from contending on it.
        for i in 0..supervisor_config.min_instances {
            self.spawn_slot().await?;
            if i + 1 < supervisor_config.min_instances {
                tokio::time::sleep(Duration::from_millis(supervisor_config.spawn_stagger_ms)).await;
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let health_handle = tokio::spawn(
            self.clone().health_loop(shutdown_tx.subscribe()),
        );

        let app = proxy::router(self.clone());
        let addr = format!("{}:{}", supervisor_config.host, supervisor_config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(
            min_instances = supervisor_config.min_instances,
            max_instances = supervisor_config.max_instances,
            "Supervisor listening on http://{}",
            addr
        );

        let shutdown_signal = {
            let shutdown_tx = shutdown_tx.clone();
            async move {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to install CTRL+C handler");
                tracing::info!("Shutdown signal received");
                shutdown_tx.send(()).ok();
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        health_handle.abort();
        self.shutdown_workers().await;
        Ok(())
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Body cap for proxied requests: the worker limit plus multipart slack,
    /// so the worker's own 413 stays authoritative.
    pub(crate) fn proxy_body_limit(&self) -> usize {
        self.config.server.max_upload_bytes + 1024 * 1024
    }

    fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    /// Spawns one worker on the next internal port.
    async fn spawn_slot(&self) -> Result<()> {
        let port = self.allocate_port();
        let worker = spawn_worker(&self.config, port)?;
        self.workers.lock().await.push(worker);
        Ok(())
    }

    /// Round-robin pick over the healthy subset.
    pub(crate) async fn pick_healthy(&self) -> Option<u16> {
        let workers = self.workers.lock().await;
        let healthy: Vec<u16> = workers.iter().filter(|w| w.healthy).map(|w| w.port).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx])
    }

    /// Marks a worker unhealthy after a transport-level dispatch failure so
    /// the retry skips it and the health loop takes over.
    pub(crate) async fn mark_unhealthy(&self, port: u16) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.port == port) {
            if worker.healthy {
                tracing::warn!(port, "Worker marked unhealthy after dispatch failure");
            }
            worker.healthy = false;
            worker.unhealthy_since.get_or_insert(Instant::now());
        }
    }

    pub async fn status(&self) -> SupervisorStatus {
        let workers = self.workers.lock().await;
        let servers: Vec<WorkerStatusInfo> = workers
            .iter()
            .map(|w| WorkerStatusInfo {
                port: w.port,
                pid: w.pid(),
                healthy: w.healthy,
                uptime_secs: w.started_at.elapsed().as_secs(),
                last_health_check_secs_ago: w
                    .last_health_check_at
                    .map(|at| at.elapsed().as_secs()),
            })
            .collect();
        let healthy_servers = servers.iter().filter(|s| s.healthy).count();
        SupervisorStatus {
            proxy_port: self.config.supervisor.port,
            bind_address: self.config.supervisor.host.clone(),
            total_servers: servers.len(),
            healthy_servers,
            shared_storage_root: self.config.storage.shared_root.clone(),
            servers,
        }
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.config.supervisor.health_check_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(interval_secs = interval.as_secs(), "Health loop started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Health loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.health_pass().await;
                }
            }
        }
    }

    /// One round: reap exited workers, probe the rest, kill the long-term
    /// unhealthy, refill the fleet.
    async fn health_pass(&self) {
        // Reap workers whose process exited on its own.
        let ports: Vec<u16> = {
            let mut workers = self.workers.lock().await;
            workers.retain_mut(|w| match w.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::warn!(port = w.port, %status, "Worker process exited");
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(port = w.port, error = %e, "Failed to poll worker process");
                    true
                }
            });
            workers.iter().map(|w| w.port).collect()
        };

        // Probe outside the lock so dispatch is not blocked for the probe
        // round.
        let probes = futures::future::join_all(
            ports.iter().map(|&port| self.probe(port)),
        )
        .await;

        let mut overdue = Vec::new();
        {
            let mut workers = self.workers.lock().await;
            let now = Instant::now();
            let kill_after = Duration::from_secs(self.config.supervisor.unhealthy_kill_secs);

            for (&port, &ok) in ports.iter().zip(probes.iter()) {
                let Some(worker) = workers.iter_mut().find(|w| w.port == port) else {
                    continue;
                };
                worker.last_health_check_at = Some(now);
                if ok {
                    if !worker.healthy {
                        tracing::info!(port, "Worker is healthy");
                    }
                    worker.healthy = true;
                    worker.unhealthy_since = None;
                } else {
                    if worker.healthy {
                        tracing::warn!(port, "Worker failed its health check");
                    }
                    worker.healthy = false;
                    worker.unhealthy_since.get_or_insert(now);
                }
            }

            let mut i = 0;
            while i < workers.len() {
                let kill = workers[i]
                    .unhealthy_since
                    .map(|since| since.elapsed() > kill_after)
                    .unwrap_or(false);
                if kill {
                    overdue.push(workers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }

        let grace = Duration::from_secs(self.config.supervisor.shutdown_grace_secs);
        for mut worker in overdue {
            tracing::warn!(port = worker.port, "Terminating worker unhealthy beyond threshold");
            terminate_worker(&mut worker, grace).await;
        }

        self.ensure_capacity().await;
    }

    async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/health", port);
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Refills the fleet after crashes: immediately when nothing is healthy,
    /// after a short delay otherwise, never past `max_instances`.
    async fn ensure_capacity(&self) {
        let (healthy, total) = {
            let workers = self.workers.lock().await;
            (
                workers.iter().filter(|w| w.healthy).count(),
                workers.len(),
            )
        };
        let supervisor_config = &self.config.supervisor;

        if total >= supervisor_config.max_instances || healthy >= supervisor_config.min_instances {
            return;
        }

        if healthy > 0 {
            tokio::time::sleep(RESPAWN_DELAY).await;
        }

        tracing::info!(healthy, total, "Refilling worker fleet");
        if let Err(e) = self.spawn_slot().await {
            tracing::error!(error = %e, "Failed to spawn replacement worker");
        }
    }

    /// Terminates every worker: gentle signal first, hard kill after the
    /// grace window, all in parallel.
    async fn shutdown_workers(&self) {
        let workers: Vec<WorkerProcess> = self.workers.lock().await.drain(..).collect();
        let grace = Duration::from_secs(self.config.supervisor.shutdown_grace_secs);

        futures::future::join_all(workers.into_iter().map(|mut worker| async move {
            terminate_worker(&mut worker, grace).await;
        }))
        .await;

        tracing::info!("All workers shut down");
    }
}
