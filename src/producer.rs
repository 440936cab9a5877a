// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Encodes JPEG snapshots (plus thumbnails), drives the external
//! muxer to produce clips, and registers every artifact it writes in the store.

use crate::muxer::Muxer;
use crate::retention::RetentionEngine;
use base::clock::Clocks;
use base::{Error, ErrorKind};
use db::{Database, StorageEntryToInsert, StorageKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const THUMB_MAX_DIM: u32 = 320;

pub struct Producer<C: Clocks> {
    db: Arc<Database<C>>,
    retention: Arc<RetentionEngine<C>>,
    muxer: Arc<dyn Muxer>,
    clips_dir: PathBuf,
    snapshots_dir: PathBuf,
    jpeg_quality: u8,
}

impl<C: Clocks> Producer<C> {
    pub fn new(
        db: Arc<Database<C>>,
        retention: Arc<RetentionEngine<C>>,
        muxer: Arc<dyn Muxer>,
        clips_dir: PathBuf,
        snapshots_dir: PathBuf,
    ) -> Self {
        Producer {
            db,
            retention,
            muxer,
            clips_dir,
            snapshots_dir,
            jpeg_quality: 85,
        }
    }

    fn dated_path(root: &Path, camera_id: &str, now: jiff::Timestamp, suffix: &str, ext: &str) -> PathBuf {
        let zoned = now.to_zoned(jiff::tz::TimeZone::UTC);
        let day = zoned.strftime("%Y-%m-%d").to_string();
        let stamp = zoned.strftime("%H%M%S").to_string();
        root.join(day).join(format!("{camera_id}_{stamp}{suffix}.{ext}"))
    }

    /// Re-encodes `jpeg_bytes` at the configured quality and writes a resized thumbnail
    /// alongside it. Registers both files in the store. Returns the full-size snapshot path.
    pub fn save_snapshot(
        &self,
        camera_id: &str,
        event_id: Option<Uuid>,
        jpeg_bytes: &[u8],
        now: jiff::Timestamp,
    ) -> Result<String, Error> {
        let img = image::load_from_memory_with_format(jpeg_bytes, image::ImageFormat::Jpeg)
            .map_err(|e| Error::wrap(ErrorKind::DecodeFailed, "decoding captured frame", e))?;

        let full_path = Self::dated_path(&self.snapshots_dir, camera_id, now, "", "jpg");
        self.write_jpeg(&full_path, &img)?;
        let full_size = std::fs::metadata(&full_path)
            .map_err(|e| Error::wrap(ErrorKind::StoreUnavailable, "stat snapshot", e))?
            .len() as i64;
        self.db.save_storage_entry(StorageEntryToInsert {
            path: full_path.to_string_lossy().into_owned(),
            kind: StorageKind::Snapshot,
            size: full_size,
            camera_id: Some(camera_id.to_owned()),
            event_id,
            expires_at: None,
        })?;

        let thumb = img.resize(THUMB_MAX_DIM, THUMB_MAX_DIM, image::imageops::FilterType::Nearest);
        let thumb_path = Self::dated_path(&self.snapshots_dir, camera_id, now, "_thumb", "jpg");
        self.write_jpeg(&thumb_path, &thumb)?;
        let thumb_size = std::fs::metadata(&thumb_path)
            .map_err(|e| Error::wrap(ErrorKind::StoreUnavailable, "stat thumbnail", e))?
            .len() as i64;
        self.db.save_storage_entry(StorageEntryToInsert {
            path: thumb_path.to_string_lossy().into_owned(),
            kind: StorageKind::Snapshot,
            size: thumb_size,
            camera_id: Some(camera_id.to_owned()),
            event_id,
            expires_at: None,
        })?;

        Ok(full_path.to_string_lossy().into_owned())
    }

    fn write_jpeg(&self, path: &Path, img: &image::DynamicImage) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::wrap(ErrorKind::StoreUnavailable, "creating snapshot directory", e))?;
        }
        let mut encoded = std::io::BufWriter::new(
            std::fs::File::create(path).map_err(|e| Error::wrap(ErrorKind::StoreUnavailable, "creating snapshot file", e))?,
        );
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, self.jpeg_quality);
        img.write_with_encoder(encoder)
            .map_err(|e| Error::wrap(ErrorKind::DecodeFailed, "encoding snapshot", e))
    }

    /// Drives the external muxer to write a clip and registers its `StorageEntry` once the file
    /// lands. Declines with `DiskFull` if the retention engine has signalled pressure.
    pub async fn save_clip(
        &self,
        camera_id: &str,
        source: &str,
        event_id: Option<Uuid>,
        duration: Duration,
        now: jiff::Timestamp,
    ) -> Result<String, Error> {
        if self.retention.should_pause_recording() {
            return Err(Error::new(ErrorKind::DiskFull));
        }
        let out_path = Self::dated_path(&self.clips_dir, camera_id, now, "", "mp4");
        self.muxer.produce_clip(source, duration, &out_path).await?;

        // The muxer may still be flushing when it returns; give it a moment before stat'ing.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let size = match std::fs::metadata(&out_path) {
            Ok(m) => m.len() as i64,
            Err(e) => {
                debug!(path = %out_path.display(), err = %e, "clip file missing after muxer returned");
                return Err(Error::wrap(ErrorKind::CaptureFailed, "stat clip output", e));
            }
        };
        self.db.save_storage_entry(StorageEntryToInsert {
            path: out_path.to_string_lossy().into_owned(),
            kind: StorageKind::Clip,
            size,
            camera_id: Some(camera_id.to_owned()),
            event_id,
            expires_at: None,
        })?;
        Ok(out_path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::RetentionConfig;
    use crate::muxer::FakeMuxer;
    use db::testutil::TestDb;
    use tempfile::tempdir;

    fn producer(
        dir: &std::path::Path,
    ) -> (Producer<base::clock::SimulatedClocks>, Arc<Database<base::clock::SimulatedClocks>>, base::clock::SimulatedClocks) {
        let t = TestDb::new();
        let db = Arc::new(t.db);
        let retention = Arc::new(RetentionEngine::new(
            db.clone(),
            EventBus::new(),
            dir.to_path_buf(),
            RetentionConfig::default(),
        ));
        let muxer = Arc::new(FakeMuxer::solid_color(64, 48, [10, 10, 10]));
        let p = Producer::new(
            db.clone(),
            retention,
            muxer,
            dir.join("clips"),
            dir.join("snapshots"),
        );
        (p, db, t.clocks)
    }

    #[test]
    fn save_snapshot_registers_full_and_thumbnail() {
        let dir = tempdir().unwrap();
        let (p, db, clocks) = producer(dir.path());
        let frame = image::RgbImage::new(64, 48);
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(frame)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        let path = p.save_snapshot("cam-test", None, &buf, clocks.realtime()).unwrap();
        assert!(std::path::Path::new(&path).exists());
        assert_eq!(db.list_storage_entries(Some(StorageKind::Snapshot)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn save_clip_declines_when_paused() {
        let dir = tempdir().unwrap();
        let (p, _db, clocks) = producer(dir.path());
        p.retention.enforce().unwrap();
        // statvfs on a fresh tempdir won't be over threshold; force the flag the way a real
        // pressure reading would set it.
        p.retention.force_pause_for_test(true);
        let err = p
            .save_clip("cam-test", "rtsp://x", None, Duration::from_secs(1), clocks.realtime())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiskFull);
    }
}
