// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
