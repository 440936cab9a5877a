// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Two independent ticks — a frequent heartbeat and a
//! slower full telemetry snapshot — both skipped silently while the RPC channel reports
//! disconnected, both non-fatal on send failure.

use crate::cameras::CameraRegistry;
use crate::config::TelemetryConfig;
use crate::retention::RetentionEngine;
use crate::rpc::RpcClient;
use crate::supervisor::{Component, Context};
use async_trait::async_trait;
use base::clock::Clocks;
use base::Error;
use db::Database;
use proto::{CameraTelemetry, TelemetryData};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::{debug, warn};

pub struct TelemetryCollector<C: Clocks> {
    db: Arc<Database<C>>,
    clocks: C,
    cameras: Arc<CameraRegistry<C>>,
    retention: Arc<RetentionEngine<C>>,
    rpc: Arc<dyn RpcClient>,
    edge_id: String,
    cfg: TelemetryConfig,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<C: Clocks> TelemetryCollector<C> {
    pub fn new(
        db: Arc<Database<C>>,
        clocks: C,
        cameras: Arc<CameraRegistry<C>>,
        retention: Arc<RetentionEngine<C>>,
        rpc: Arc<dyn RpcClient>,
        edge_id: String,
        cfg: TelemetryConfig,
    ) -> Self {
        TelemetryCollector { db, clocks, cameras, retention, rpc, edge_id, cfg, task: parking_lot::Mutex::new(None) }
    }

    fn compose(&self) -> Result<TelemetryData, Error> {
        let mut sys = System::new_all();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu_percent = sys.global_cpu_usage() as f64;
        let mem_used_bytes = sys.used_memory();
        let mem_total_bytes = sys.total_memory();

        let disks = Disks::new_with_refreshed_list();
        let (disk_used_bytes, disk_total_bytes) = disks
            .iter()
            .max_by_key(|d| d.total_space())
            .map(|d| (d.total_space() - d.available_space(), d.total_space()))
            .unwrap_or((0, 0));

        let queue_length = self.db.queue_stats()?.size;
        let cameras = self.cameras.list(false);
        let active_cameras = cameras.iter().filter(|c| c.enabled).count() as i64;
        let storage = self.db.list_storage_entries(None)?;
        let storage_count = storage.len() as i64;
        let storage_bytes: u64 = storage.iter().map(|e| e.size as u64).sum();

        let now = self.clocks.realtime();
        let now_secs = now.as_second();
        let camera_telemetry = cameras
            .iter()
            .map(|c| CameraTelemetry {
                id: c.id.clone(),
                online: c.last_seen.is_some_and(|ts| now_secs - ts.as_second() < 120),
                last_seen_unix: c.last_seen.map(|ts| ts.as_second()).unwrap_or(0),
                status_message: if c.enabled { "enabled".to_owned() } else { "disabled".to_owned() },
            })
            .collect();

        Ok(TelemetryData {
            timestamp_ns: now.as_nanosecond() as i64,
            edge_id: self.edge_id.clone(),
            cpu_percent,
            mem_used_bytes,
            mem_total_bytes,
            disk_used_bytes,
            disk_total_bytes,
            disk_percent: self.retention.last_used_percent(),
            queue_length,
            active_cameras,
            storage_count,
            storage_bytes,
            cameras: camera_telemetry,
        })
    }

    async fn send_telemetry(&self) {
        if !self.rpc.is_connected() {
            debug!("skipping telemetry send: tunnel not connected");
            return;
        }
        let data = match self.compose() {
            Ok(d) => d,
            Err(e) => {
                warn!(err = %e.chain(), "failed to compose telemetry snapshot");
                return;
            }
        };
        if let Err(e) = self.rpc.send_telemetry(data).await {
            warn!(err = %e.chain(), "telemetry send failed");
        }
    }

    async fn send_heartbeat(&self) {
        if !self.rpc.is_connected() {
            debug!("skipping heartbeat: tunnel not connected");
            return;
        }
        let now_ns = self.clocks.realtime().as_nanosecond() as i64;
        if let Err(e) = self.rpc.heartbeat(&self.edge_id, now_ns).await {
            warn!(err = %e.chain(), "heartbeat failed");
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: crate::supervisor::CancelToken) {
        let heartbeat_interval = Duration::from_secs(self.cfg.heartbeat_interval_secs.max(1));
        let telemetry_interval = heartbeat_interval * 10;

        // Both ticks fire immediately on start rather than waiting a full interval.
        self.send_heartbeat().await;
        self.send_telemetry().await;

        let mut heartbeat_tick = tokio::time::interval(heartbeat_interval);
        heartbeat_tick.tick().await;
        let mut telemetry_tick = tokio::time::interval(telemetry_interval);
        telemetry_tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = heartbeat_tick.tick() => self.send_heartbeat().await,
                _ = telemetry_tick.tick() => self.send_telemetry().await,
            }
        }
    }
}

#[async_trait]
impl<C: Clocks + Send + Sync + 'static> Component for TelemetryCollector<C> {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn start(self: Arc<Self>, ctx: &Context) -> Result<(), Error> {
        let cancel = ctx.cancel.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop(cancel).await });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), Error> {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::RetentionConfig;
    use crate::rpc::mock::MockRpcClient;
    use base::clock::SimulatedClocks;
    use db::testutil::TestDb;
    use tempfile::tempdir;

    fn collector(
        rpc: Arc<MockRpcClient>,
    ) -> TelemetryCollector<SimulatedClocks> {
        let t = TestDb::new();
        let db = Arc::new(t.db);
        let cameras = Arc::new(CameraRegistry::new(db.clone()));
        cameras.reload().unwrap();
        let dir = tempdir().unwrap();
        let retention = Arc::new(RetentionEngine::new(
            db.clone(),
            EventBus::new(),
            dir.path().to_path_buf(),
            RetentionConfig::default(),
        ));
        TelemetryCollector::new(db, t.clocks, cameras, retention, rpc, "edge-1".to_owned(), TelemetryConfig::default())
    }

    #[tokio::test]
    async fn send_heartbeat_skips_silently_when_disconnected() {
        let rpc = Arc::new(MockRpcClient::default());
        let collector = collector(rpc.clone());
        collector.send_heartbeat().await;
        assert!(rpc.heartbeats.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_heartbeat_reaches_backend_when_connected() {
        let rpc = Arc::new(MockRpcClient::connected());
        let collector = collector(rpc.clone());
        collector.send_heartbeat().await;
        assert_eq!(rpc.heartbeats.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_telemetry_includes_queue_length() {
        let rpc = Arc::new(MockRpcClient::connected());
        let collector = collector(rpc.clone());
        collector.send_telemetry().await;
        let calls = rpc.telemetry_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].edge_id, "edge-1");
    }
}
