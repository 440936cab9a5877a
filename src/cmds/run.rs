// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand that wires every component together and runs the edge appliance until signalled
//! to stop.

use crate::bus::EventBus;
use crate::cameras::{CameraRegistry, Discovered};
use crate::config::Config;
use crate::detector::{AnomalyDetector, BrightnessDetector, Detector};
use crate::muxer::{FfmpegMuxer, Muxer};
use crate::producer::Producer;
use crate::retention::RetentionEngine;
use crate::rpc::{ChannelHandle, RpcClient, TonicRpcClient};
use crate::supervisor::Supervisor;
use crate::telemetry::TelemetryCollector;
use crate::transmitter::{NoLabels, Transmitter};
use crate::tunnel::{TunnelSupervisor, WgQuickDriver};
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use db::{CameraKind, Database};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs the edge orchestrator: starts every component and blocks until SIGINT/SIGTERM.
#[derive(Bpaf, Clone, Debug)]
pub struct Args {
    /// Path to the TOML config file.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from("edged.toml")))]
    config: PathBuf,

    /// Seconds to wait for components to stop cleanly before giving up.
    #[bpaf(long, argument("SECS"), fallback(30))]
    shutdown_timeout_secs: u64,
}

async fn run_async(args: Args) -> Result<(), Error> {
    let cfg = Config::load(&args.config)?;
    let clocks = RealClocks;
    let bus = EventBus::new();

    let db = Arc::new(Database::open(&cfg.db_path(), clocks)?);
    let recovered = db.recover_pending()?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "resuming transmission of events recovered at boot");
    }

    let cameras = Arc::new(CameraRegistry::new(db.clone()));
    for c in &cfg.cameras {
        let kind = CameraKind::parse(&c.kind)
            .ok_or_else(|| Error::msg(base::ErrorKind::ConfigInvalid, format!("unknown camera kind {:?}", c.kind)))?;
        cameras.register(Discovered {
            id: c.id.clone(),
            name: c.name.clone(),
            kind,
            source: c.source.clone(),
        })?;
        db.set_camera_enabled(&c.id, c.enabled)?;
    }

    let retention = Arc::new(RetentionEngine::new(db.clone(), bus.clone(), cfg.data_dir.clone(), cfg.retention.clone()));
    let muxer: Arc<dyn Muxer> = Arc::new(FfmpegMuxer::default());
    let producer = Arc::new(Producer::new(db.clone(), retention.clone(), muxer.clone(), cfg.clips_dir(), cfg.snapshots_dir()));
    let detector: Arc<dyn Detector> = Arc::new(BrightnessDetector);
    let anomaly_detector = Arc::new(AnomalyDetector::new(
        db.clone(),
        clocks,
        cameras.clone(),
        producer.clone(),
        muxer,
        detector,
        bus.clone(),
        cfg.detector.clone(),
        cfg.transmitter.max_queue_size,
    ));

    let channel = ChannelHandle::new();
    let rpc: Arc<dyn RpcClient> = Arc::new(TonicRpcClient::new(channel.clone()));
    let tunnel_driver = Arc::new(WgQuickDriver::new(cfg.tunnel.config_path.clone()));
    let tunnel = Arc::new(TunnelSupervisor::new(
        cfg.tunnel.config_path.clone(),
        tunnel_driver,
        channel,
        bus.clone(),
        cfg.tunnel.clone(),
    ));

    let telemetry = Arc::new(TelemetryCollector::new(
        db.clone(),
        clocks,
        cameras.clone(),
        retention.clone(),
        rpc.clone(),
        cfg.edge_id.clone(),
        cfg.telemetry.clone(),
    ));
    let transmitter = Arc::new(Transmitter::new(
        db.clone(),
        clocks,
        cameras.clone(),
        rpc,
        Arc::new(NoLabels),
        bus.clone(),
        cfg.transmitter.clone(),
    ));

    let mut supervisor = Supervisor::new(bus.clone());
    supervisor.register(cameras, Duration::from_secs(5));
    supervisor.register(retention, Duration::from_secs(5));
    supervisor.register(anomaly_detector, Duration::from_secs(5));
    supervisor.register(tunnel, Duration::from_secs(5));
    supervisor.register(telemetry, Duration::from_secs(5));
    supervisor.register(transmitter, Duration::from_secs(5));

    supervisor.start_all().await;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping components");
    supervisor.shutdown(Duration::from_secs(args.shutdown_timeout_secs)).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, "building tokio runtime", e))?;
    match rt.block_on(run_async(args)) {
        Ok(()) => Ok(0),
        Err(e) => {
            warn!(err = %e.chain(), "edge orchestrator exited with an error");
            Err(e)
        }
    }
}
