// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The sole writer of `Camera` rows, with an in-memory index reloaded
//! from the store on start.

use crate::supervisor::{Component, Context};
use async_trait::async_trait;
use base::clock::Clocks;
use base::Error;
use db::{Camera, CameraKind, CameraUpsert, Database};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A camera as discovered by an external collaborator (LAN discovery is out of scope here;
/// this is also how config-file-declared cameras are registered at start).
#[derive(Debug, Clone)]
pub struct Discovered {
    pub id: String,
    pub name: String,
    pub kind: CameraKind,
    pub source: Vec<String>,
}

pub struct CameraRegistry<C: Clocks> {
    db: Arc<Database<C>>,
    index: RwLock<BTreeMap<String, Camera>>,
}

impl<C: Clocks> CameraRegistry<C> {
    pub fn new(db: Arc<Database<C>>) -> Self {
        CameraRegistry {
            db,
            index: RwLock::new(BTreeMap::new()),
        }
    }

    /// Reloads the in-memory index from the store. Called at start and safe to call again.
    pub fn reload(&self) -> Result<(), Error> {
        let cameras = self.db.list_cameras(false)?;
        let mut index = self.index.write();
        index.clear();
        for c in cameras {
            index.insert(c.id.clone(), c);
        }
        Ok(())
    }

    /// Upserts a discovered device, preserving `enabled` if the camera is already known.
    pub fn register(&self, discovered: Discovered) -> Result<(), Error> {
        self.db.save_camera(CameraUpsert {
            id: discovered.id.clone(),
            name: discovered.name,
            kind: discovered.kind,
            source: discovered.source,
            capabilities: Default::default(),
        })?;
        if let Some(c) = self.db.get_camera(&discovered.id)? {
            self.index.write().insert(c.id.clone(), c);
        }
        Ok(())
    }

    pub fn list(&self, enabled_only: bool) -> Vec<Camera> {
        self.index
            .read()
            .values()
            .filter(|c| !enabled_only || c.enabled)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Camera> {
        self.index.read().get(id).cloned()
    }

    pub fn touch(&self, id: &str) -> Result<(), Error> {
        self.db.touch_camera(id)?;
        if let Some(c) = self.db.get_camera(id)? {
            self.index.write().insert(c.id.clone(), c);
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Clocks + Send + Sync + 'static> Component for CameraRegistry<C> {
    fn name(&self) -> &'static str {
        "camera-registry"
    }

    async fn start(self: Arc<Self>, _ctx: &Context) -> Result<(), Error> {
        self.reload()
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::testutil::TestDb;

    #[test]
    fn register_preserves_enabled_across_rediscovery() {
        let t = TestDb::new();
        let reg = CameraRegistry::new(Arc::new(t.db));
        reg.reload().unwrap();
        reg.db
            .set_camera_enabled(db::testutil::TEST_CAMERA_ID, false)
            .unwrap();
        reg.register(Discovered {
            id: db::testutil::TEST_CAMERA_ID.to_owned(),
            name: "renamed".to_owned(),
            kind: CameraKind::Rtsp,
            source: vec!["rtsp://renamed".to_owned()],
        })
        .unwrap();
        let c = reg.get(db::testutil::TEST_CAMERA_ID).unwrap();
        assert_eq!(c.name, "renamed");
        assert!(!c.enabled);
    }

    #[test]
    fn list_enabled_only_filters() {
        let t = TestDb::new();
        let reg = CameraRegistry::new(Arc::new(t.db));
        reg.reload().unwrap();
        reg.db
            .set_camera_enabled(db::testutil::TEST_CAMERA_ID, false)
            .unwrap();
        reg.reload().unwrap();
        assert!(reg.list(true).is_empty());
        assert_eq!(reg.list(false).len(), 1);
    }
}
