// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Typed rows for the entities the store persists. See `schema.sql` for the backing tables.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A `Uuid` wrapper that stores as SQLite text, matching `uuid::Uuid::to_string`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SqlUuid(pub Uuid);

impl FromSql for SqlUuid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Uuid::parse_str(s)
            .map(SqlUuid)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for SqlUuid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.0.to_string().into())
    }
}

/// Open map of event metadata, stored as a JSON text column.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CameraKind {
    Rtsp,
    Usb,
    Onvif,
}

impl CameraKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CameraKind::Rtsp => "rtsp",
            CameraKind::Usb => "usb",
            CameraKind::Onvif => "onvif",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rtsp" => Some(CameraKind::Rtsp),
            "usb" => Some(CameraKind::Usb),
            "onvif" => Some(CameraKind::Onvif),
            _ => None,
        }
    }
}

impl std::fmt::Display for CameraKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered camera. The camera registry is the sole writer.
#[derive(Clone, Debug)]
pub struct Camera {
    pub id: String,
    pub name: String,
    pub kind: CameraKind,
    pub source: Vec<String>,
    pub enabled: bool,
    pub last_seen: Option<jiff::Timestamp>,
    pub capabilities: Metadata,
}

/// Fields accepted when registering or updating a camera. Separate from [`Camera`] because
/// `register` preserves `enabled` across an upsert rather than overwriting it.
#[derive(Clone, Debug)]
pub struct CameraUpsert {
    pub id: String,
    pub name: String,
    pub kind: CameraKind,
    pub source: Vec<String>,
    pub capabilities: Metadata,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventType {
    AnomalyDetected,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::AnomalyDetected => "anomaly_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anomaly_detected" => Some(EventType::AnomalyDetected),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event reported (or pending report) to the remote backend.
#[derive(Clone, Debug)]
pub struct Event {
    pub id: Uuid,
    pub camera_id: String,
    pub type_: EventType,
    pub timestamp: jiff::Timestamp,
    pub metadata: Metadata,
    pub snapshot_path: Option<String>,
    pub clip_path: Option<String>,
    pub confidence: f32,
    pub transmitted: bool,
    pub transmitted_at: Option<jiff::Timestamp>,
}

/// The pending-transmission pointer for an un-transmitted event.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub event_id: Uuid,
    pub priority: i32,
    pub retry_count: i32,
    pub enqueued_at: jiff::Timestamp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageKind {
    Clip,
    Snapshot,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Clip => "clip",
            StorageKind::Snapshot => "snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clip" => Some(StorageKind::Clip),
            "snapshot" => Some(StorageKind::Snapshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A clip, snapshot, or thumbnail file registered on disk.
#[derive(Clone, Debug)]
pub struct StorageEntry {
    pub id: i64,
    pub path: String,
    pub kind: StorageKind,
    pub size: i64,
    pub camera_id: Option<String>,
    pub event_id: Option<Uuid>,
    pub created_at: jiff::Timestamp,
    pub expires_at: Option<jiff::Timestamp>,
}

/// Fields accepted when registering a new storage entry; `id` is assigned by the store.
#[derive(Clone, Debug)]
pub struct StorageEntryToInsert {
    pub path: String,
    pub kind: StorageKind,
    pub size: i64,
    pub camera_id: Option<String>,
    pub event_id: Option<Uuid>,
    pub expires_at: Option<jiff::Timestamp>,
}

/// Summary counters for the event queue, as returned by `Database::queue_stats`.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub size: i64,
    pub oldest_age_secs: Option<i64>,
}
