// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Generated client/server stubs for the tunnel-gated RPC surface, compiled from `edge.proto`
//! at build time. Kept in its own crate so the binary and any future test harness can depend on
//! the wire types without recompiling the whole orchestrator.

tonic::include_proto!("edge");
