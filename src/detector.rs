// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A scheduled per-camera brightness check against a rolling
//! baseline. The brightness signal is a deliberate stand-in for a real model — it lives behind
//! the [`Detector`] trait precisely so it can be replaced without touching the scheduler, the
//! store, or the wire shape of the events it emits.

use crate::bus::{BusEvent, EventBus};
use crate::cameras::CameraRegistry;
use crate::config::DetectorConfig;
use crate::muxer::Muxer;
use crate::producer::Producer;
use crate::supervisor::{Component, Context};
use async_trait::async_trait;
use base::clock::Clocks;
use base::{Error, ErrorKind};
use db::{new_event, Database, EventType, Metadata};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A pluggable anomaly scorer. `BrightnessDetector` is the only implementation today; the trait
/// exists so a heavier model can be swapped in behind the same `score` contract.
pub trait Detector: Send + Sync {
    /// Returns a scalar score for `frame` (a decoded JPEG byte buffer) comparable against a
    /// baseline of the same unit.
    fn score(&self, frame: &[u8]) -> Result<f32, Error>;
}

pub struct BrightnessDetector;

impl Detector for BrightnessDetector {
    fn score(&self, frame: &[u8]) -> Result<f32, Error> {
        let img = image::load_from_memory_with_format(frame, image::ImageFormat::Jpeg)
            .map_err(|e| Error::wrap(ErrorKind::DecodeFailed, "decoding frame for brightness", e))?
            .to_rgb8();
        if img.is_empty() {
            return Err(Error::msg(ErrorKind::DecodeFailed, "empty frame"));
        }
        let mut total = 0f64;
        for px in img.pixels() {
            let [r, g, b] = px.0;
            total += 0.2126 * r as f64 + 0.7152 * g as f64 + 0.0722 * b as f64;
        }
        Ok((total / img.pixels().len() as f64) as f32)
    }
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    mean_brightness: f32,
    updated_at: std::time::Instant,
}

pub struct AnomalyDetector<C: Clocks> {
    db: Arc<Database<C>>,
    clocks: C,
    cameras: Arc<CameraRegistry<C>>,
    producer: Arc<Producer<C>>,
    muxer: Arc<dyn Muxer>,
    detector: Arc<dyn Detector>,
    bus: EventBus,
    cfg: DetectorConfig,
    max_queue_size: i64,
    baselines: RwLock<HashMap<String, Baseline>>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<C: Clocks> AnomalyDetector<C> {
    pub fn new(
        db: Arc<Database<C>>,
        clocks: C,
        cameras: Arc<CameraRegistry<C>>,
        producer: Arc<Producer<C>>,
        muxer: Arc<dyn Muxer>,
        detector: Arc<dyn Detector>,
        bus: EventBus,
        cfg: DetectorConfig,
        max_queue_size: i64,
    ) -> Self {
        AnomalyDetector {
            db,
            clocks,
            cameras,
            producer,
            muxer,
            detector,
            bus,
            cfg,
            max_queue_size,
            baselines: RwLock::new(HashMap::new()),
            task: parking_lot::Mutex::new(None),
        }
    }

    fn baseline_is_fresh(&self, camera_id: &str) -> Option<f32> {
        let baselines = self.baselines.read();
        let b = baselines.get(camera_id)?;
        if b.updated_at.elapsed() < Duration::from_secs(self.cfg.baseline_refresh_secs) {
            Some(b.mean_brightness)
        } else {
            None
        }
    }

    fn seed_baseline(&self, camera_id: &str, brightness: f32) {
        self.baselines.write().insert(
            camera_id.to_owned(),
            Baseline { mean_brightness: brightness, updated_at: std::time::Instant::now() },
        );
    }

    /// Runs one detection pass over every enabled camera. Errors capturing or decoding a single
    /// camera's frame are logged at debug and never stop the loop for the rest.
    pub async fn tick(&self) {
        for camera in self.cameras.list(true) {
            if let Err(e) = self.check_camera(&camera.id, &camera.source).await {
                debug!(camera_id = %camera.id, err = %e.chain(), "anomaly check failed for camera");
            }
        }
    }

    async fn check_camera(&self, camera_id: &str, source: &[String]) -> Result<(), Error> {
        let Some(url) = source.first() else {
            return Err(Error::msg(ErrorKind::ConfigInvalid, "camera has no source"));
        };
        let frame = self.muxer.capture_frame(url, 85).await?;
        let brightness = self.detector.score(&frame)?;

        let baseline_mean = match self.baseline_is_fresh(camera_id) {
            Some(mean) => mean,
            None => {
                // A real baseline refresh averages labelled "normal" samples; absent that
                // external store, seed directly from the current frame the first time through.
                self.seed_baseline(camera_id, brightness);
                info!(camera_id, brightness, "seeded brightness baseline");
                return Ok(());
            }
        };

        let score = (brightness - baseline_mean).abs();
        if self.cfg.threshold <= 0.0 || score < self.cfg.threshold {
            return Ok(());
        }

        let confidence = (score / self.cfg.threshold).min(1.0);
        let now = self.clocks.realtime();
        let mut event = new_event(camera_id, EventType::AnomalyDetected, now, confidence);
        let mut metadata = Metadata::new();
        metadata.insert("anomaly_score".to_owned(), serde_json::json!(score));
        metadata.insert("baseline_brightness".to_owned(), serde_json::json!(baseline_mean));
        metadata.insert("ts_utc".to_owned(), serde_json::json!(now.to_string()));
        event.metadata = metadata;

        match self.producer.save_snapshot(camera_id, Some(event.id), &frame, now) {
            Ok(path) => event.snapshot_path = Some(path),
            Err(e) => warn!(camera_id, err = %e.chain(), "snapshot capture failed for anomaly event"),
        }

        let clip_duration = Duration::from_secs(self.cfg.clip_secs + self.cfg.pre_event_secs);
        match self.producer.save_clip(camera_id, url, Some(event.id), clip_duration, now).await {
            Ok(path) => event.clip_path = Some(path),
            Err(e) => warn!(camera_id, err = %e.chain(), "clip capture failed for anomaly event"),
        }

        let queue_size = self.db.queue_stats()?.size;
        if queue_size >= self.max_queue_size {
            warn!(camera_id, queue_size, max_queue_size = self.max_queue_size, "queue at capacity, persisting event without enqueuing");
            event.metadata.insert("needs_attention".to_owned(), serde_json::json!(true));
            self.db.save_event_without_queue(event.clone())?;
            self.bus.publish(BusEvent::QueueFull { camera_id: camera_id.to_owned() });
            return Err(Error::new(ErrorKind::QueueFull));
        }
        self.db.enqueue(event.clone(), 1)?;
        self.bus.publish(BusEvent::AnomalyDetected { camera_id: camera_id.to_owned(), event_id: event.id });
        if let Some(path) = &event.clip_path {
            self.bus.publish(BusEvent::ClipReady { event_id: event.id, path: path.clone() });
        }
        info!(camera_id, %score, confidence, "anomaly detected");
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, cancel: crate::supervisor::CancelToken) {
        let interval = Duration::from_secs(self.cfg.interval_secs.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => self.tick().await,
            }
        }
    }
}

#[async_trait]
impl<C: Clocks + Send + Sync + 'static> Component for AnomalyDetector<C> {
    fn name(&self) -> &'static str {
        "anomaly-detector"
    }

    async fn start(self: Arc<Self>, ctx: &Context) -> Result<(), Error> {
        if !self.cfg.enabled {
            info!("anomaly detector disabled by configuration");
            return Ok(());
        }
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
    use crate::config::RetentionConfig;
    use crate::muxer::FakeMuxer;
    use crate::retention::RetentionEngine;
    use base::clock::SimulatedClocks;
    use db::testutil::TestDb;
    use tempfile::tempdir;

    struct FixedScore(f32);
    impl Detector for FixedScore {
        fn score(&self, _frame: &[u8]) -> Result<f32, Error> {
            Ok(self.0)
        }
    }

    fn harness(
        dir: &std::path::Path,
        threshold: f32,
        score: f32,
    ) -> (AnomalyDetector<SimulatedClocks>, Arc<Database<SimulatedClocks>>) {
        harness_with_queue_cap(dir, threshold, score, 100)
    }

    fn harness_with_queue_cap(
        dir: &std::path::Path,
        threshold: f32,
        score: f32,
        max_queue_size: i64,
    ) -> (AnomalyDetector<SimulatedClocks>, Arc<Database<SimulatedClocks>>) {
        let t = TestDb::new();
        let db = Arc::new(t.db);
        let cameras = Arc::new(CameraRegistry::new(db.clone()));
        cameras.reload().unwrap();
        let retention = Arc::new(RetentionEngine::new(
            db.clone(),
            EventBus::new(),
            dir.to_path_buf(),
            RetentionConfig::default(),
        ));
        let muxer: Arc<dyn Muxer> = Arc::new(FakeMuxer::solid_color(16, 16, [100, 100, 100]));
        let producer = Arc::new(Producer::new(
            db.clone(),
            retention,
            muxer.clone(),
            dir.join("clips"),
            dir.join("snapshots"),
        ));
        let detector = AnomalyDetector::new(
            db.clone(),
            t.clocks.clone(),
            cameras,
            producer,
            muxer,
            Arc::new(FixedScore(score)),
            EventBus::new(),
            DetectorConfig { threshold, ..Default::default() },
            max_queue_size,
        );
        (detector, db)
    }

    #[tokio::test]
    async fn first_pass_seeds_baseline_without_emitting() {
        let dir = tempdir().unwrap();
        let (detector, db) = harness(dir.path(), 30.0, 100.0);
        detector.tick().await;
        assert_eq!(db.queue_stats().unwrap().size, 0);
    }

    #[tokio::test]
    async fn deviation_past_threshold_emits_anomaly_with_expected_confidence() {
        let dir = tempdir().unwrap();
        let (detector, db) = harness(dir.path(), 30.0, 100.0);
        detector.tick().await; // seeds baseline at 100.0
        detector.seed_baseline(db::testutil::TEST_CAMERA_ID, 100.0);
        // Swap in a detector reporting the post-anomaly brightness for the second pass.
        let detector = {
            let AnomalyDetector { db, clocks, cameras, producer, muxer, bus, cfg, max_queue_size, baselines, .. } = detector;
            AnomalyDetector {
                db,
                clocks,
                cameras,
                producer,
                muxer,
                detector: Arc::new(FixedScore(145.0)),
                bus,
                cfg,
                max_queue_size,
                baselines,
                task: parking_lot::Mutex::new(None),
            }
        };
        detector.tick().await;
        let stats = db.queue_stats().unwrap();
        assert_eq!(stats.size, 1);
        let events = db.drain(1).unwrap();
        let event = &events[0];
        assert!((event.confidence - 1.0).abs() < 1e-6);
        assert_eq!(event.metadata["anomaly_score"], serde_json::json!(45.0));
        assert_eq!(event.metadata["baseline_brightness"], serde_json::json!(100.0));
    }

    #[tokio::test]
    async fn queue_at_capacity_persists_without_enqueuing() {
        let dir = tempdir().unwrap();
        let (detector, db) = harness_with_queue_cap(dir.path(), 30.0, 100.0, 0);
        detector.tick().await; // seeds baseline, queue still empty
        detector.seed_baseline(db::testutil::TEST_CAMERA_ID, 100.0);
        let detector = {
            let AnomalyDetector { db, clocks, cameras, producer, muxer, bus, cfg, max_queue_size, baselines, .. } = detector;
            AnomalyDetector {
                db,
                clocks,
                cameras,
                producer,
                muxer,
                detector: Arc::new(FixedScore(145.0)),
                bus,
                cfg,
                max_queue_size,
                baselines,
                task: parking_lot::Mutex::new(None),
            }
        };
        let err = detector.check_camera(db::testutil::TEST_CAMERA_ID, &[String::new()]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert_eq!(db.queue_stats().unwrap().size, 0, "event recorded but not queued");
    }
}
