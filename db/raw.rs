// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQLite statements which do not touch any cached state.

use crate::types::{
    Camera, CameraKind, Event, EventType, Metadata, QueueEntry, QueueStats, SqlUuid,
    StorageEntry, StorageEntryToInsert, StorageKind,
};
use base::{Error, ErrorKind, ResultExt as _};
use rusqlite::{named_params, params, OptionalExtension};
use uuid::Uuid;

/// Schema for the embedded store. Idempotent; run once at open under `Database::open`.
///
/// Foreign keys are enabled separately via a pragma (`PRAGMA` statements aren't reliably
/// batched with DDL across all rusqlite backends), and WAL mode likewise.
pub const SCHEMA_SQL: &str = r#"
create table if not exists camera (
    id            text primary key,
    name          text not null,
    kind          text not null,
    source        text not null,  -- JSON array of strings
    enabled       integer not null default 1,
    last_seen     text,
    capabilities  text not null default '{}'
);

create table if not exists event (
    id              text primary key,
    camera_id       text not null references camera (id) on delete cascade,
    type            text not null,
    timestamp       text not null,
    metadata        text not null default '{}',
    snapshot_path   text,
    clip_path       text,
    confidence      real not null default 0,
    transmitted     integer not null default 0,
    transmitted_at  text
);

create index if not exists event_camera_id on event (camera_id);
create index if not exists event_transmitted on event (transmitted);

create table if not exists queue_entry (
    event_id      text primary key references event (id) on delete cascade,
    priority      integer not null default 0,
    retry_count   integer not null default 0,
    enqueued_at   text not null
);

create index if not exists queue_entry_order on queue_entry (priority desc, enqueued_at asc);

create table if not exists storage_entry (
    id            integer primary key,
    path          text not null unique,
    kind          text not null,
    size          integer not null,
    camera_id     text references camera (id) on delete set null,
    event_id      text references event (id) on delete set null,
    created_at    text not null,
    expires_at    text
);

create index if not exists storage_entry_kind on storage_entry (kind);
create index if not exists storage_entry_created_at on storage_entry (created_at);

create table if not exists system_kv (
    key   text primary key,
    value text not null
);

create table if not exists schema_version (
    version integer not null
);
"#;

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

pub(crate) fn init(conn: &rusqlite::Connection) -> Result<(), base::Error> {
    conn.pragma_update(None, "foreign_keys", "ON")
        .err_kind(ErrorKind::StoreUnavailable)?;
    conn.execute_batch(SCHEMA_SQL)
        .err_kind(ErrorKind::StoreUnavailable)?;
    let have_version: i32 = conn
        .query_row("select count(*) from schema_version", params![], |r| {
            r.get(0)
        })
        .err_kind(ErrorKind::StoreUnavailable)?;
    if have_version == 0 {
        conn.execute(
            "insert into schema_version (version) values (?)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .err_kind(ErrorKind::StoreUnavailable)?;
    }
    Ok(())
}

/// Classifies a rusqlite error as `InvalidRef` if it's a foreign-key/unique constraint
/// violation, else `StoreUnavailable`.
fn classify(context: &'static str, err: rusqlite::Error) -> Error {
    let is_constraint = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    );
    if is_constraint {
        Error::wrap(ErrorKind::InvalidRef, context, err)
    } else {
        Error::wrap(ErrorKind::StoreUnavailable, context, err)
    }
}

fn ts_to_sql(ts: jiff::Timestamp) -> String {
    ts.to_string()
}

fn ts_from_sql(s: &str) -> Result<jiff::Timestamp, base::Error> {
    s.parse::<jiff::Timestamp>()
        .err_kind(ErrorKind::StoreUnavailable)
}

fn metadata_to_sql(m: &Metadata) -> Result<String, base::Error> {
    serde_json::to_string(m).err_kind(ErrorKind::Internal)
}

fn metadata_from_sql(s: &str) -> Result<Metadata, base::Error> {
    serde_json::from_str(s).err_kind(ErrorKind::StoreUnavailable)
}

fn source_to_sql(source: &[String]) -> Result<String, base::Error> {
    serde_json::to_string(source).err_kind(ErrorKind::Internal)
}

fn source_from_sql(s: &str) -> Result<Vec<String>, base::Error> {
    serde_json::from_str(s).err_kind(ErrorKind::StoreUnavailable)
}

fn camera_from_row(row: &rusqlite::Row) -> rusqlite::Result<Camera> {
    let kind: String = row.get("kind")?;
    let source: String = row.get("source")?;
    let capabilities: String = row.get("capabilities")?;
    let last_seen: Option<String> = row.get("last_seen")?;
    Ok(Camera {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: CameraKind::parse(&kind).unwrap_or(CameraKind::Rtsp),
        source: source_from_sql(&source).unwrap_or_default(),
        enabled: row.get::<_, i64>("enabled")? != 0,
        last_seen: last_seen.and_then(|s| ts_from_sql(&s).ok()),
        capabilities: metadata_from_sql(&capabilities).unwrap_or_default(),
    })
}

pub(crate) fn save_camera(
    conn: &rusqlite::Connection,
    c: &Camera,
) -> Result<(), base::Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            insert into camera (id, name, kind, source, enabled, last_seen, capabilities)
                        values (:id, :name, :kind, :source, :enabled, :last_seen, :capabilities)
            on conflict (id) do update set
                name = excluded.name,
                kind = excluded.kind,
                source = excluded.source,
                enabled = excluded.enabled,
                last_seen = excluded.last_seen,
                capabilities = excluded.capabilities
            "#,
        )
        .err_kind(ErrorKind::StoreUnavailable)?;
    stmt.execute(named_params! {
        ":id": &c.id,
        ":name": &c.name,
        ":kind": c.kind.as_str(),
        ":source": source_to_sql(&c.source)?,
        ":enabled": c.enabled as i64,
        ":last_seen": c.last_seen.map(ts_to_sql),
        ":capabilities": metadata_to_sql(&c.capabilities)?,
    })
    .err_kind(ErrorKind::StoreUnavailable)?;
    Ok(())
}

pub(crate) fn get_camera(
    conn: &rusqlite::Connection,
    id: &str,
) -> Result<Option<Camera>, base::Error> {
    conn.query_row(
        "select id, name, kind, source, enabled, last_seen, capabilities from camera where id = ?",
        params![id],
        camera_from_row,
    )
    .optional()
    .err_kind(ErrorKind::StoreUnavailable)
}

pub(crate) fn list_cameras(
    conn: &rusqlite::Connection,
    enabled_only: bool,
) -> Result<Vec<Camera>, base::Error> {
    let sql = if enabled_only {
        "select id, name, kind, source, enabled, last_seen, capabilities from camera where enabled = 1 order by id"
    } else {
        "select id, name, kind, source, enabled, last_seen, capabilities from camera order by id"
    };
    let mut stmt = conn.prepare_cached(sql).err_kind(ErrorKind::StoreUnavailable)?;
    let rows = stmt
        .query_map(params![], camera_from_row)
        .err_kind(ErrorKind::StoreUnavailable)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.err_kind(ErrorKind::StoreUnavailable)?);
    }
    Ok(out)
}

pub(crate) fn delete_camera(conn: &rusqlite::Connection, id: &str) -> Result<(), base::Error> {
    conn.execute("delete from camera where id = ?", params![id])
        .err_kind(ErrorKind::StoreUnavailable)?;
    Ok(())
}

pub(crate) fn touch_camera(
    conn: &rusqlite::Connection,
    id: &str,
    now: jiff::Timestamp,
) -> Result<bool, base::Error> {
    let n = conn
        .execute(
            "update camera set last_seen = ? where id = ?",
            params![ts_to_sql(now), id],
        )
        .err_kind(ErrorKind::StoreUnavailable)?;
    Ok(n == 1)
}

fn event_from_row(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let id: SqlUuid = row.get("id")?;
    let type_: String = row.get("type")?;
    let timestamp: String = row.get("timestamp")?;
    let metadata: String = row.get("metadata")?;
    let transmitted_at: Option<String> = row.get("transmitted_at")?;
    Ok(Event {
        id: id.0,
        camera_id: row.get("camera_id")?,
        type_: EventType::parse(&type_).unwrap_or(EventType::AnomalyDetected),
        timestamp: ts_from_sql(&timestamp).unwrap_or(jiff::Timestamp::UNIX_EPOCH),
        metadata: metadata_from_sql(&metadata).unwrap_or_default(),
        snapshot_path: row.get("snapshot_path")?,
        clip_path: row.get("clip_path")?,
        confidence: row.get("confidence")?,
        transmitted: row.get::<_, i64>("transmitted")? != 0,
        transmitted_at: transmitted_at.and_then(|s| ts_from_sql(&s).ok()),
    })
}

const EVENT_COLUMNS: &str = "id, camera_id, type, timestamp, metadata, snapshot_path, clip_path, \
    confidence, transmitted, transmitted_at";

/// Upserts an event. If the event is newly inserted and not transmitted, also inserts a
/// `queue_entry` with the given priority. Idempotent on `event.id`: re-saving an already-queued
/// event does not create a second `queue_entry`.
pub(crate) fn save_event(
    tx: &rusqlite::Transaction,
    e: &Event,
    priority: i32,
    now: jiff::Timestamp,
) -> Result<(), base::Error> {
    save_event_row(tx, e)?;

    if !e.transmitted {
        let mut stmt = tx
            .prepare_cached(
                r#"
                insert into queue_entry (event_id, priority, retry_count, enqueued_at)
                values (:event_id, :priority, 0, :enqueued_at)
                on conflict (event_id) do nothing
                "#,
            )
            .err_kind(ErrorKind::StoreUnavailable)?;
        stmt.execute(named_params! {
            ":event_id": SqlUuid(e.id),
            ":priority": priority,
            ":enqueued_at": ts_to_sql(now),
        })
        .err_kind(ErrorKind::StoreUnavailable)?;
    }
    Ok(())
}

/// Upserts the `event` row only, without touching `queue_entry`. Used for the back-pressure
/// fallback: the event is durably recorded but not handed to the transmitter.
pub(crate) fn save_event_row(tx: &rusqlite::Transaction, e: &Event) -> Result<(), base::Error> {
    let mut stmt = tx
        .prepare_cached(&format!(
            r#"
            insert into event ({EVENT_COLUMNS})
            values (:id, :camera_id, :type, :timestamp, :metadata, :snapshot_path, :clip_path,
                    :confidence, :transmitted, :transmitted_at)
            on conflict (id) do update set
                camera_id = excluded.camera_id,
                type = excluded.type,
                timestamp = excluded.timestamp,
                metadata = excluded.metadata,
                snapshot_path = excluded.snapshot_path,
                clip_path = excluded.clip_path,
                confidence = excluded.confidence
            "#
        ))
        .err_kind(ErrorKind::StoreUnavailable)?;
    stmt.execute(named_params! {
        ":id": SqlUuid(e.id),
        ":camera_id": &e.camera_id,
        ":type": e.type_.as_str(),
        ":timestamp": ts_to_sql(e.timestamp),
        ":metadata": metadata_to_sql(&e.metadata)?,
        ":snapshot_path": &e.snapshot_path,
        ":clip_path": &e.clip_path,
        ":confidence": e.confidence,
        ":transmitted": e.transmitted as i64,
        ":transmitted_at": e.transmitted_at.map(ts_to_sql),
    })
    .map_err(|err| classify("saving event (dangling camera_id?)", err))?;
    Ok(())
}

pub(crate) fn get_event(
    conn: &rusqlite::Connection,
    id: Uuid,
) -> Result<Option<Event>, base::Error> {
    conn.query_row(
        &format!("select {EVENT_COLUMNS} from event where id = ?"),
        params![SqlUuid(id)],
        event_from_row,
    )
    .optional()
    .err_kind(ErrorKind::StoreUnavailable)
}

/// Atomically marks an event transmitted and removes its queue entry.
pub(crate) fn mark_transmitted(
    tx: &rusqlite::Transaction,
    id: Uuid,
    now: jiff::Timestamp,
) -> Result<bool, base::Error> {
    let n = tx
        .execute(
            "update event set transmitted = 1, transmitted_at = ? where id = ? and transmitted = 0",
            params![ts_to_sql(now), SqlUuid(id)],
        )
        .err_kind(ErrorKind::StoreUnavailable)?;
    tx.execute("delete from queue_entry where event_id = ?", params![SqlUuid(id)])
        .err_kind(ErrorKind::StoreUnavailable)?;
    Ok(n == 1)
}

/// Increments `retry_count`. Returns the new count, or `None` if there was no queue entry
/// (already transmitted or poisoned).
pub(crate) fn increment_retry(
    tx: &rusqlite::Transaction,
    id: Uuid,
) -> Result<Option<i32>, base::Error> {
    tx.query_row(
        "update queue_entry set retry_count = retry_count + 1 where event_id = ? \
         returning retry_count",
        params![SqlUuid(id)],
        |row| row.get(0),
    )
    .optional()
    .err_kind(ErrorKind::StoreUnavailable)
}

pub(crate) fn remove_queue_entry(
    tx: &rusqlite::Transaction,
    id: Uuid,
) -> Result<(), base::Error> {
    tx.execute("delete from queue_entry where event_id = ?", params![SqlUuid(id)])
        .err_kind(ErrorKind::StoreUnavailable)?;
    Ok(())
}

/// Returns up to `limit` pending events ordered `priority desc, enqueued_at asc`.
pub(crate) fn pending_events(
    conn: &rusqlite::Connection,
    limit: i64,
) -> Result<Vec<Event>, base::Error> {
    let mut stmt = conn
        .prepare_cached(&format!(
            r#"
            select {EVENT_COLUMNS} from event
            where id in (
                select event_id from queue_entry order by priority desc, enqueued_at asc limit :limit
            )
            order by (select priority from queue_entry where queue_entry.event_id = event.id) desc,
                     (select enqueued_at from queue_entry where queue_entry.event_id = event.id) asc
            "#
        ))
        .err_kind(ErrorKind::StoreUnavailable)?;
    let rows = stmt
        .query_map(named_params! {":limit": limit}, event_from_row)
        .err_kind(ErrorKind::StoreUnavailable)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.err_kind(ErrorKind::StoreUnavailable)?);
    }
    Ok(out)
}

pub(crate) fn queue_stats(
    conn: &rusqlite::Connection,
    now: jiff::Timestamp,
) -> Result<QueueStats, base::Error> {
    let size: i64 = conn
        .query_row("select count(*) from queue_entry", params![], |r| r.get(0))
        .err_kind(ErrorKind::StoreUnavailable)?;
    let oldest: Option<String> = conn
        .query_row(
            "select enqueued_at from queue_entry order by enqueued_at asc limit 1",
            params![],
            |r| r.get(0),
        )
        .optional()
        .err_kind(ErrorKind::StoreUnavailable)?;
    let oldest_age_secs = match oldest {
        Some(s) => {
            let ts = ts_from_sql(&s)?;
            Some((now - ts).get_seconds().max(0))
        }
        None => None,
    };
    Ok(QueueStats {
        size,
        oldest_age_secs,
    })
}

pub(crate) fn queue_entry(
    conn: &rusqlite::Connection,
    id: Uuid,
) -> Result<Option<QueueEntry>, base::Error> {
    conn.query_row(
        "select event_id, priority, retry_count, enqueued_at from queue_entry where event_id = ?",
        params![SqlUuid(id)],
        |row| {
            let event_id: SqlUuid = row.get(0)?;
            let enqueued_at: String = row.get(3)?;
            Ok(QueueEntry {
                event_id: event_id.0,
                priority: row.get(1)?,
                retry_count: row.get(2)?,
                enqueued_at: enqueued_at
                    .parse()
                    .unwrap_or(jiff::Timestamp::UNIX_EPOCH),
            })
        },
    )
    .optional()
    .err_kind(ErrorKind::StoreUnavailable)
}

/// Deletes transmitted events older than `max_age`. Cascades to their (already-absent) queue
/// entries and nulls out referencing storage entries.
pub(crate) fn purge_old_events(
    conn: &rusqlite::Connection,
    max_age: jiff::Span,
    now: jiff::Timestamp,
) -> Result<usize, base::Error> {
    let cutoff = now
        .checked_sub(max_age)
        .err_kind(ErrorKind::Internal)?;
    conn.execute(
        "delete from event where transmitted = 1 and transmitted_at < ?",
        params![ts_to_sql(cutoff)],
    )
    .err_kind(ErrorKind::StoreUnavailable)
}

fn storage_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<StorageEntry> {
    let kind: String = row.get("kind")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    let event_id: Option<SqlUuid> = row.get("event_id")?;
    Ok(StorageEntry {
        id: row.get("id")?,
        path: row.get("path")?,
        kind: StorageKind::parse(&kind).unwrap_or(StorageKind::Snapshot),
        size: row.get("size")?,
        camera_id: row.get("camera_id")?,
        event_id: event_id.map(|u| u.0),
        created_at: created_at
            .parse()
            .unwrap_or(jiff::Timestamp::UNIX_EPOCH),
        expires_at: expires_at.and_then(|s| s.parse().ok()),
    })
}

const STORAGE_ENTRY_COLUMNS: &str =
    "id, path, kind, size, camera_id, event_id, created_at, expires_at";

pub(crate) fn save_storage_entry(
    conn: &rusqlite::Connection,
    e: &StorageEntryToInsert,
    now: jiff::Timestamp,
) -> Result<i64, base::Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            insert into storage_entry (path, kind, size, camera_id, event_id, created_at, expires_at)
                                values (:path, :kind, :size, :camera_id, :event_id, :created_at, :expires_at)
            "#,
        )
        .err_kind(ErrorKind::StoreUnavailable)?;
    stmt.execute(named_params! {
        ":path": &e.path,
        ":kind": e.kind.as_str(),
        ":size": e.size,
        ":camera_id": &e.camera_id,
        ":event_id": e.event_id.map(SqlUuid),
        ":created_at": ts_to_sql(now),
        ":expires_at": e.expires_at.map(ts_to_sql),
    })
    .map_err(|err| classify("saving storage entry (dangling camera_id/event_id?)", err))?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn delete_storage_entry(
    conn: &rusqlite::Connection,
    id: i64,
) -> Result<Option<String>, base::Error> {
    let path: Option<String> = conn
        .query_row(
            "select path from storage_entry where id = ?",
            params![id],
            |r| r.get(0),
        )
        .optional()
        .err_kind(ErrorKind::StoreUnavailable)?;
    if path.is_some() {
        conn.execute("delete from storage_entry where id = ?", params![id])
            .err_kind(ErrorKind::StoreUnavailable)?;
    }
    Ok(path)
}

pub(crate) fn list_storage_entries(
    conn: &rusqlite::Connection,
    kind: Option<StorageKind>,
) -> Result<Vec<StorageEntry>, base::Error> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "select {STORAGE_ENTRY_COLUMNS} from storage_entry \
             where (:kind is null or kind = :kind) order by created_at asc"
        ))
        .err_kind(ErrorKind::StoreUnavailable)?;
    let rows = stmt
        .query_map(named_params! {":kind": kind.map(StorageKind::as_str)}, storage_entry_from_row)
        .err_kind(ErrorKind::StoreUnavailable)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.err_kind(ErrorKind::StoreUnavailable)?);
    }
    Ok(out)
}

/// Lists the oldest `limit` storage entries by `created_at`, used by pressure eviction.
pub(crate) fn oldest_storage_entries(
    conn: &rusqlite::Connection,
    limit: i64,
) -> Result<Vec<StorageEntry>, base::Error> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "select {STORAGE_ENTRY_COLUMNS} from storage_entry order by created_at asc limit :limit"
        ))
        .err_kind(ErrorKind::StoreUnavailable)?;
    let rows = stmt
        .query_map(named_params! {":limit": limit}, storage_entry_from_row)
        .err_kind(ErrorKind::StoreUnavailable)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.err_kind(ErrorKind::StoreUnavailable)?);
    }
    Ok(out)
}

/// Deletes storage entries (rows only; unlinking the file is the retention engine's job) older
/// than `max_age`.
pub(crate) fn purge_old_storage_entries(
    conn: &rusqlite::Connection,
    max_age: jiff::Span,
    now: jiff::Timestamp,
) -> Result<Vec<StorageEntry>, base::Error> {
    let cutoff = now
        .checked_sub(max_age)
        .err_kind(ErrorKind::Internal)?;
    let entries = {
        let mut stmt = conn
            .prepare_cached(&format!(
                "select {STORAGE_ENTRY_COLUMNS} from storage_entry where created_at < :cutoff"
            ))
            .err_kind(ErrorKind::StoreUnavailable)?;
        let rows = stmt
            .query_map(named_params! {":cutoff": ts_to_sql(cutoff)}, storage_entry_from_row)
            .err_kind(ErrorKind::StoreUnavailable)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.err_kind(ErrorKind::StoreUnavailable)?);
        }
        out
    };
    conn.execute(
        "delete from storage_entry where created_at < ?",
        params![ts_to_sql(cutoff)],
    )
    .err_kind(ErrorKind::StoreUnavailable)?;
    Ok(entries)
}

pub(crate) fn kv_put(conn: &rusqlite::Connection, key: &str, value: &str) -> Result<(), base::Error> {
    conn.execute(
        "insert into system_kv (key, value) values (?, ?) \
         on conflict (key) do update set value = excluded.value",
        params![key, value],
    )
    .err_kind(ErrorKind::StoreUnavailable)?;
    Ok(())
}

pub(crate) fn kv_get(
    conn: &rusqlite::Connection,
    key: &str,
) -> Result<Option<String>, base::Error> {
    conn.query_row("select value from system_kv where key = ?", params![key], |r| {
        r.get(0)
    })
    .optional()
    .err_kind(ErrorKind::StoreUnavailable)
}
