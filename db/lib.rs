// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod db;
mod raw;
pub mod testutil;
pub mod types;

pub use crate::db::{
    new_event, parse_camera_kind, Database, DEFAULT_MAX_RETRIES, MAX_RECOVERED_EVENTS,
};
pub use crate::types::*;
