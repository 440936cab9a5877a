// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The embedded store and the durable event queue built on top of it.
//!
//! [`Database`] owns a single writer connection behind a mutex and opens a fresh, short-lived
//! connection for each read. This mirrors a single-process, single-writer/multi-reader SQLite
//! deployment: write-ahead logging lets readers proceed without blocking on the writer, and
//! there is no cross-connection state to keep coherent beyond what SQLite itself guarantees.

use crate::raw;
use crate::types::{
    Camera, CameraKind, CameraUpsert, Event, EventType, QueueEntry, QueueStats, StorageEntry,
    StorageEntryToInsert, StorageKind,
};
use base::clock::Clocks;
use base::{Error, ErrorKind, ResultExt as _};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Default cap on the number of un-transmitted events recovered at boot.
pub const MAX_RECOVERED_EVENTS: i64 = 1000;

/// Default retry ceiling before an event is poisoned.
pub const DEFAULT_MAX_RETRIES: i32 = 10;

/// Where the backing SQLite database lives.
enum ConnSource {
    /// A real file on disk; each reader opens its own connection to the same path.
    File(PathBuf),

    /// An in-memory, shared-cache database identified by a unique URI, used by tests so that
    /// the writer and any readers see the same data without touching the filesystem.
    Memory(String),
}

impl ConnSource {
    fn open(&self) -> Result<rusqlite::Connection, Error> {
        match self {
            ConnSource::File(path) => {
                rusqlite::Connection::open(path).err_kind(ErrorKind::StoreUnavailable)
            }
            ConnSource::Memory(uri) => {
                let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_SHARED_CACHE;
                rusqlite::Connection::open_with_flags(uri, flags)
                    .err_kind(ErrorKind::StoreUnavailable)
            }
        }
    }
}

/// The embedded relational store. Typically wrapped in an `Arc` once at startup and shared with
/// every component that needs persistence.
pub struct Database<C: Clocks> {
    clocks: C,
    source: ConnSource,
    writer: Mutex<rusqlite::Connection>,
}

impl<C: Clocks> Database<C> {
    /// Opens (creating if necessary) the store at `path`, enabling WAL mode and foreign keys.
    pub fn open(path: &Path, clocks: C) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).err_kind(ErrorKind::StoreUnavailable)?;
        }
        let writer =
            rusqlite::Connection::open(path).err_kind(ErrorKind::StoreUnavailable)?;
        writer
            .pragma_update(None, "journal_mode", "WAL")
            .err_kind(ErrorKind::StoreUnavailable)?;
        raw::init(&writer)?;
        Ok(Database {
            clocks,
            source: ConnSource::File(path.to_owned()),
            writer: Mutex::new(writer),
        })
    }

    /// Opens a private, shared-cache in-memory database. Used by tests; see [`crate::testutil`].
    pub fn open_in_memory(name: &str, clocks: C) -> Result<Self, Error> {
        let uri = format!("file:{name}?mode=memory&cache=shared");
        let source = ConnSource::Memory(uri);
        let writer = source.open()?;
        // SQLite drops an in-memory shared-cache database once its last connection closes; hold
        // one extra connection open for the database's lifetime so readers can always attach.
        std::mem::forget(source.open()?);
        raw::init(&writer)?;
        Ok(Database {
            clocks,
            source,
            writer: Mutex::new(writer),
        })
    }

    fn reader(&self) -> Result<rusqlite::Connection, Error> {
        let conn = self.source.open()?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .err_kind(ErrorKind::StoreUnavailable)?;
        Ok(conn)
    }

    fn now(&self) -> jiff::Timestamp {
        self.clocks.realtime()
    }

    // --- Camera registry persistence ---------------------------------------------------------

    /// Upserts a camera, preserving `enabled` across re-registration of an already-known id.
    pub fn save_camera(&self, c: CameraUpsert) -> Result<Camera, Error> {
        let w = self.writer.lock();
        let enabled = raw::get_camera(&w, &c.id)?.map(|e| e.enabled).unwrap_or(true);
        let camera = Camera {
            id: c.id,
            name: c.name,
            kind: c.kind,
            source: c.source,
            enabled,
            last_seen: None,
            capabilities: c.capabilities,
        };
        raw::save_camera(&w, &camera)?;
        Ok(camera)
    }

    /// Sets `enabled` explicitly, bypassing the preserve-on-upsert behavior of `save_camera`.
    pub fn set_camera_enabled(&self, id: &str, enabled: bool) -> Result<(), Error> {
        let w = self.writer.lock();
        let mut camera = raw::get_camera(&w, id)?
            .ok_or_else(|| Error::msg(ErrorKind::InvalidRef, format!("no such camera {id}")))?;
        camera.enabled = enabled;
        raw::save_camera(&w, &camera)
    }

    pub fn get_camera(&self, id: &str) -> Result<Option<Camera>, Error> {
        raw::get_camera(&self.reader()?, id)
    }

    pub fn list_cameras(&self, enabled_only: bool) -> Result<Vec<Camera>, Error> {
        raw::list_cameras(&self.reader()?, enabled_only)
    }

    pub fn delete_camera(&self, id: &str) -> Result<(), Error> {
        raw::delete_camera(&self.writer.lock(), id)
    }

    pub fn touch_camera(&self, id: &str) -> Result<bool, Error> {
        raw::touch_camera(&self.writer.lock(), id, self.now())
    }

    // --- Event queue + store ------------------------------------------------------------------

    /// Persists `event` and, if not already transmitted, its queue entry — in one transaction.
    /// Idempotent on `event.id`.
    pub fn enqueue(&self, event: Event, priority: i32) -> Result<(), Error> {
        let mut w = self.writer.lock();
        let now = self.now();
        let tx = w.transaction().err_kind(ErrorKind::StoreUnavailable)?;
        raw::save_event(&tx, &event, priority, now)?;
        tx.commit().err_kind(ErrorKind::StoreUnavailable)?;
        Ok(())
    }

    /// Persists `event` without a queue entry. Used when the queue is at capacity: the event
    /// isn't lost, but it won't reach the transmitter until something re-enqueues it.
    pub fn save_event_without_queue(&self, event: Event) -> Result<(), Error> {
        let mut w = self.writer.lock();
        let tx = w.transaction().err_kind(ErrorKind::StoreUnavailable)?;
        raw::save_event_row(&tx, &event)?;
        tx.commit().err_kind(ErrorKind::StoreUnavailable)?;
        Ok(())
    }

    /// Returns up to `limit` pending events in `priority DESC, enqueued_at ASC` order. Does not
    /// remove them from the queue; callers must follow up with [`Database::mark_transmitted`]
    /// or [`Database::fail`].
    pub fn drain(&self, limit: i64) -> Result<Vec<Event>, Error> {
        raw::pending_events(&self.reader()?, limit)
    }

    /// Atomically marks `event_id` transmitted and removes its queue entry.
    pub fn mark_transmitted(&self, event_id: Uuid) -> Result<(), Error> {
        let mut w = self.writer.lock();
        let now = self.now();
        let tx = w.transaction().err_kind(ErrorKind::StoreUnavailable)?;
        raw::mark_transmitted(&tx, event_id, now)?;
        tx.commit().err_kind(ErrorKind::StoreUnavailable)
    }

    /// Increments `retry_count` for `event_id`. If it reaches `max_retries`, the queue entry is
    /// removed (the event is "poisoned") and `true` is returned so the caller can publish
    /// `EventPoisoned`.
    pub fn fail(&self, event_id: Uuid, max_retries: i32) -> Result<bool, Error> {
        let mut w = self.writer.lock();
        let tx = w.transaction().err_kind(ErrorKind::StoreUnavailable)?;
        let retry_count = raw::increment_retry(&tx, event_id)?;
        let poisoned = match retry_count {
            Some(n) if n >= max_retries => {
                raw::remove_queue_entry(&tx, event_id)?;
                true
            }
            _ => false,
        };
        tx.commit().err_kind(ErrorKind::StoreUnavailable)?;
        if poisoned {
            warn!(%event_id, "event poisoned after {max_retries} failed delivery attempts");
        }
        Ok(poisoned)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, Error> {
        raw::queue_stats(&self.reader()?, self.now())
    }

    pub fn queue_entry(&self, event_id: Uuid) -> Result<Option<QueueEntry>, Error> {
        raw::queue_entry(&self.reader()?, event_id)
    }

    pub fn get_event(&self, id: Uuid) -> Result<Option<Event>, Error> {
        raw::get_event(&self.reader()?, id)
    }

    /// Deletes transmitted events older than `max_age`. Cascades to storage entries that
    /// referenced them only by nulling the foreign key (the retention engine owns file removal).
    pub fn purge_old_events(&self, max_age: jiff::Span) -> Result<usize, Error> {
        raw::purge_old_events(&self.writer.lock(), max_age, self.now())
    }

    /// Re-hydrates the transmitter's backlog at boot: the most recent `MAX_RECOVERED_EVENTS`
    /// un-transmitted events, oldest first within priority.
    pub fn recover_pending(&self) -> Result<Vec<Event>, Error> {
        let events = raw::pending_events(&self.reader()?, MAX_RECOVERED_EVENTS)?;
        info!(count = events.len(), "recovered pending events from store");
        Ok(events)
    }

    // --- Storage entries ----------------------------------------------------------------------

    pub fn save_storage_entry(&self, e: StorageEntryToInsert) -> Result<StorageEntry, Error> {
        let w = self.writer.lock();
        let now = self.now();
        let id = raw::save_storage_entry(&w, &e, now)?;
        Ok(StorageEntry {
            id,
            path: e.path,
            kind: e.kind,
            size: e.size,
            camera_id: e.camera_id,
            event_id: e.event_id,
            created_at: now,
            expires_at: e.expires_at,
        })
    }

    /// Deletes the row and returns the path that was registered, if any, so the caller can
    /// unlink the file.
    pub fn delete_storage_entry(&self, id: i64) -> Result<Option<String>, Error> {
        raw::delete_storage_entry(&self.writer.lock(), id)
    }

    pub fn list_storage_entries(&self, kind: Option<StorageKind>) -> Result<Vec<StorageEntry>, Error> {
        raw::list_storage_entries(&self.reader()?, kind)
    }

    pub fn oldest_storage_entries(&self, limit: i64) -> Result<Vec<StorageEntry>, Error> {
        raw::oldest_storage_entries(&self.reader()?, limit)
    }

    pub fn purge_old_storage_entries(&self, max_age: jiff::Span) -> Result<Vec<StorageEntry>, Error> {
        raw::purge_old_storage_entries(&self.writer.lock(), max_age, self.now())
    }

    // --- Free-form small state ------------------------------------------------------------------

    pub fn kv_put(&self, key: &str, value: &str) -> Result<(), Error> {
        raw::kv_put(&self.writer.lock(), key, value)
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, Error> {
        raw::kv_get(&self.reader()?, key)
    }
}

/// Constructs an [`Event`] ready to pass to [`Database::enqueue`]. Producers (the anomaly
/// detector) fill in the fields that vary; `id`, and the transmitted/zero state are fixed here
/// so callers can't accidentally construct an already-transmitted event.
pub fn new_event(
    camera_id: impl Into<String>,
    type_: EventType,
    timestamp: jiff::Timestamp,
    confidence: f32,
) -> Event {
    Event {
        id: Uuid::now_v7(),
        camera_id: camera_id.into(),
        type_,
        timestamp,
        metadata: Default::default(),
        snapshot_path: None,
        clip_path: None,
        confidence,
        transmitted: false,
        transmitted_at: None,
    }
}

/// Returns an error if `kind` isn't a known camera kind string, for config parsing call sites.
pub fn parse_camera_kind(kind: &str) -> Result<CameraKind, Error> {
    CameraKind::parse(kind)
        .ok_or_else(|| Error::msg(ErrorKind::ConfigInvalid, format!("unknown camera kind {kind}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use base::clock::SimulatedClocks;

    fn test_db(name: &str) -> Database<SimulatedClocks> {
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        Database::open_in_memory(name, clocks).unwrap()
    }

    fn test_camera(db: &Database<SimulatedClocks>, id: &str) {
        db.save_camera(CameraUpsert {
            id: id.to_owned(),
            name: "front door".to_owned(),
            kind: CameraKind::Rtsp,
            source: vec!["rtsp://example/cam".to_owned()],
            capabilities: Metadata::default(),
        })
        .unwrap();
    }

    #[test]
    fn enqueue_is_idempotent() {
        let db = test_db("enqueue_is_idempotent");
        test_camera(&db, "cam-1");
        let event = new_event("cam-1", EventType::AnomalyDetected, db.now(), 0.9);
        db.enqueue(event.clone(), 1).unwrap();
        db.enqueue(event.clone(), 1).unwrap();
        assert_eq!(db.queue_stats().unwrap().size, 1);
    }

    #[test]
    fn mark_transmitted_removes_queue_entry() {
        let db = test_db("mark_transmitted_removes_queue_entry");
        test_camera(&db, "cam-1");
        let event = new_event("cam-1", EventType::AnomalyDetected, db.now(), 0.9);
        db.enqueue(event.clone(), 0).unwrap();
        db.mark_transmitted(event.id).unwrap();
        assert_eq!(db.queue_stats().unwrap().size, 0);
        assert!(db.get_event(event.id).unwrap().unwrap().transmitted);
    }

    #[test]
    fn fail_poisons_after_max_retries() {
        let db = test_db("fail_poisons_after_max_retries");
        test_camera(&db, "cam-1");
        let event = new_event("cam-1", EventType::AnomalyDetected, db.now(), 0.9);
        db.enqueue(event.clone(), 0).unwrap();
        for _ in 0..2 {
            assert!(!db.fail(event.id, 3).unwrap());
        }
        assert!(db.fail(event.id, 3).unwrap());
        assert_eq!(db.queue_stats().unwrap().size, 0);
        let row = db.get_event(event.id).unwrap().unwrap();
        assert!(!row.transmitted);
    }

    #[test]
    fn drain_orders_by_priority_then_fifo() {
        let db = test_db("drain_orders_by_priority_then_fifo");
        test_camera(&db, "cam-1");
        let low = new_event("cam-1", EventType::AnomalyDetected, db.now(), 0.1);
        let high = new_event("cam-1", EventType::AnomalyDetected, db.now(), 0.2);
        db.enqueue(low.clone(), 0).unwrap();
        db.enqueue(high.clone(), 5).unwrap();
        let drained = db.drain(10).unwrap();
        assert_eq!(drained[0].id, high.id);
        assert_eq!(drained[1].id, low.id);
    }

    #[test]
    fn enqueue_rejects_unknown_camera() {
        let db = test_db("enqueue_rejects_unknown_camera");
        let event = new_event("no-such-cam", EventType::AnomalyDetected, db.now(), 0.9);
        let err = db.enqueue(event, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRef);
    }

    #[test]
    fn save_camera_preserves_enabled_on_reregister() {
        let db = test_db("save_camera_preserves_enabled_on_reregister");
        test_camera(&db, "cam-1");
        db.set_camera_enabled("cam-1", false).unwrap();
        test_camera(&db, "cam-1");
        assert!(!db.get_camera("cam-1").unwrap().unwrap().enabled);
    }

    #[test]
    fn purge_old_events_ignores_fresh_transmitted_events() {
        let db = test_db("purge_old_events_ignores_fresh_transmitted_events");
        test_camera(&db, "cam-1");
        let event = new_event("cam-1", EventType::AnomalyDetected, db.now(), 0.9);
        db.enqueue(event.clone(), 0).unwrap();
        db.mark_transmitted(event.id).unwrap();
        let deleted = db.purge_old_events(jiff::Span::new().hours(1)).unwrap();
        assert_eq!(deleted, 0, "not old enough yet");
    }
}
