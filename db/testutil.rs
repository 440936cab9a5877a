// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving the store. Used by this crate's own tests and by
//! the binary crate's component tests.

use crate::db::Database;
use crate::types::{CameraKind, CameraUpsert, Metadata};
use base::clock::SimulatedClocks;
use std::sync::atomic::{AtomicU64, Ordering};

static INIT: std::sync::Once = std::sync::Once::new();
static NEXT_DB_NAME: AtomicU64 = AtomicU64::new(0);

pub const TEST_CAMERA_ID: &str = "cam-test";

/// Performs global initialization for tests: sets up logging once per process.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

/// An in-memory store seeded with one enabled camera, backed by a [`SimulatedClocks`] so tests
/// can control `now()` deterministically.
pub struct TestDb {
    pub db: Database<SimulatedClocks>,
    pub clocks: SimulatedClocks,
}

impl TestDb {
    /// Creates a fresh in-memory database with one camera (`TEST_CAMERA_ID`).
    pub fn new() -> Self {
        init();
        // Every shared-cache in-memory database needs a name unique within the process, or
        // concurrently-run tests would see each other's rows.
        let n = NEXT_DB_NAME.fetch_add(1, Ordering::Relaxed);
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let db = Database::open_in_memory(&format!("testdb-{n}"), clocks.clone()).unwrap();
        db.save_camera(CameraUpsert {
            id: TEST_CAMERA_ID.to_owned(),
            name: "test camera".to_owned(),
            kind: CameraKind::Rtsp,
            source: vec!["rtsp://test-camera/main".to_owned()],
            capabilities: Metadata::default(),
        })
        .unwrap();
        TestDb { db, clocks }
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
