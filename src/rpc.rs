// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The RPC surface the transmitter and telemetry collector use to reach the remote
//! backend. Every call is gated on the tunnel: [`ChannelHandle`] holds the current
//! `tonic::transport::Channel` when the tunnel supervisor reports the link up, and `None`
//! otherwise, so callers can check [`RpcClient::is_connected`] before attempting work that would
//! just queue up behind a dead connection.

use async_trait::async_trait;
use base::{Error, ErrorKind};
use parking_lot::RwLock;
use proto::control_client::ControlClient;
use proto::events_client::EventsClient;
use proto::streaming_client::StreamingClient;
use proto::telemetry_client::TelemetryClient;
use proto::{
    EventRecord, GetClipInfoRequest, GetClipInfoResponse, HeartbeatRequest, SendEventsResponse,
    StreamClipChunk, SyncCapabilitiesRequest, SyncCapabilitiesResponse, TelemetryData,
};
use std::sync::Arc;
use tonic::transport::Channel;

/// Shared slot the tunnel supervisor fills and clears as the link comes up and down.
#[derive(Clone, Default)]
pub struct ChannelHandle(Arc<RwLock<Option<Channel>>>);

impl ChannelHandle {
    pub fn new() -> Self {
        ChannelHandle::default()
    }

    pub fn set(&self, channel: Channel) {
        *self.0.write() = Some(channel);
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }

    pub fn get(&self) -> Option<Channel> {
        self.0.read().clone()
    }
}

#[async_trait]
pub trait RpcClient: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn send_events(&self, events: Vec<EventRecord>) -> Result<SendEventsResponse, Error>;
    async fn send_telemetry(&self, data: TelemetryData) -> Result<(), Error>;
    async fn heartbeat(&self, edge_id: &str, timestamp_ns: i64) -> Result<i64, Error>;
    async fn sync_capabilities(&self, req: SyncCapabilitiesRequest) -> Result<SyncCapabilitiesResponse, Error>;
    async fn get_clip_info(&self, req: GetClipInfoRequest) -> Result<GetClipInfoResponse, Error>;
    async fn stream_clip(
        &self,
        chunks: tokio_stream::wrappers::ReceiverStream<StreamClipChunk>,
    ) -> Result<(), Error>;
}

pub struct TonicRpcClient {
    channel: ChannelHandle,
}

impl TonicRpcClient {
    pub fn new(channel: ChannelHandle) -> Self {
        TonicRpcClient { channel }
    }

    fn channel(&self) -> Result<Channel, Error> {
        self.channel.get().ok_or_else(|| Error::new(ErrorKind::TunnelDown))
    }
}

/// `InvalidArgument`/`PermissionDenied`/`Unauthenticated` indicate a payload or credential the
/// backend will never accept; everything else (`Unavailable`, `DeadlineExceeded`, ...) is worth
/// retrying once the tunnel is healthy again.
fn map_status(e: tonic::Status) -> Error {
    use tonic::Code;
    let kind = match e.code() {
        Code::InvalidArgument | Code::PermissionDenied | Code::Unauthenticated | Code::FailedPrecondition => {
            ErrorKind::RpcFatal
        }
        _ => ErrorKind::RpcRetryable,
    };
    Error::wrap(kind, format!("rpc failed: {}", e.code()), e)
}

#[async_trait]
impl RpcClient for TonicRpcClient {
    fn is_connected(&self) -> bool {
        self.channel.get().is_some()
    }

    async fn send_events(&self, events: Vec<EventRecord>) -> Result<SendEventsResponse, Error> {
        let mut client = EventsClient::new(self.channel()?);
        let resp = client
            .send_batch(proto::SendEventsRequest { events })
            .await
            .map_err(map_status)?;
        Ok(resp.into_inner())
    }

    async fn send_telemetry(&self, data: TelemetryData) -> Result<(), Error> {
        let mut client = TelemetryClient::new(self.channel()?);
        let resp = client
            .send(proto::SendTelemetryRequest { data: Some(data) })
            .await
            .map_err(map_status)?
            .into_inner();
        if !resp.success {
            return Err(Error::msg(ErrorKind::RpcRetryable, resp.error));
        }
        Ok(())
    }

    async fn heartbeat(&self, edge_id: &str, timestamp_ns: i64) -> Result<i64, Error> {
        let mut client = TelemetryClient::new(self.channel()?);
        let resp = client
            .heartbeat(HeartbeatRequest { edge_id: edge_id.to_owned(), timestamp_ns })
            .await
            .map_err(map_status)?
            .into_inner();
        if !resp.success {
            return Err(Error::msg(ErrorKind::RpcRetryable, "heartbeat rejected"));
        }
        Ok(resp.server_timestamp_ns)
    }

    async fn sync_capabilities(&self, req: SyncCapabilitiesRequest) -> Result<SyncCapabilitiesResponse, Error> {
        let mut client = ControlClient::new(self.channel()?);
        let resp = client.sync_capabilities(req).await.map_err(map_status)?;
        Ok(resp.into_inner())
    }

    async fn get_clip_info(&self, req: GetClipInfoRequest) -> Result<GetClipInfoResponse, Error> {
        let mut client = StreamingClient::new(self.channel()?);
        let resp = client.get_clip_info(req).await.map_err(map_status)?;
        Ok(resp.into_inner())
    }

    async fn stream_clip(
        &self,
        chunks: tokio_stream::wrappers::ReceiverStream<StreamClipChunk>,
    ) -> Result<(), Error> {
        let mut client = StreamingClient::new(self.channel()?);
        let resp = client.stream_clip(chunks).await.map_err(map_status)?.into_inner();
        if !resp.success {
            return Err(Error::msg(ErrorKind::RpcRetryable, resp.error));
        }
        Ok(())
    }
}

/// In-memory double used by tests: records every call, answers successfully unless told not to.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct MockRpcClient {
        pub connected: std::sync::atomic::AtomicBool,
        pub sent_events: StdMutex<Vec<EventRecord>>,
        pub telemetry_calls: StdMutex<Vec<TelemetryData>>,
        pub heartbeats: StdMutex<Vec<i64>>,
        pub fail_send_events: std::sync::atomic::AtomicBool,
        pub fail_send_events_fatally: std::sync::atomic::AtomicBool,
        pub streamed_chunks: StdMutex<Vec<StreamClipChunk>>,
        pub streamed_bytes: std::sync::atomic::AtomicU64,
        pub sync_capabilities_calls: std::sync::atomic::AtomicU64,
    }

    impl MockRpcClient {
        pub fn connected() -> Self {
            let m = MockRpcClient::default();
            m.connected.store(true, std::sync::atomic::Ordering::Relaxed);
            m
        }
    }

    #[async_trait]
    impl RpcClient for MockRpcClient {
        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::Relaxed)
        }

        async fn send_events(&self, events: Vec<EventRecord>) -> Result<SendEventsResponse, Error> {
            if self.fail_send_events_fatally.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(Error::new(ErrorKind::RpcFatal));
            }
            if self.fail_send_events.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(Error::new(ErrorKind::RpcRetryable));
            }
            let accepted_ids = events.iter().map(|e| e.id.clone()).collect();
            self.sent_events.lock().unwrap().extend(events);
            Ok(SendEventsResponse { success: true, error: String::new(), accepted_ids })
        }

        async fn send_telemetry(&self, data: TelemetryData) -> Result<(), Error> {
            self.telemetry_calls.lock().unwrap().push(data);
            Ok(())
        }

        async fn heartbeat(&self, _edge_id: &str, timestamp_ns: i64) -> Result<i64, Error> {
            self.heartbeats.lock().unwrap().push(timestamp_ns);
            Ok(timestamp_ns)
        }

        async fn sync_capabilities(&self, _req: SyncCapabilitiesRequest) -> Result<SyncCapabilitiesResponse, Error> {
            self.sync_capabilities_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(SyncCapabilitiesResponse { success: true, error: String::new() })
        }

        async fn get_clip_info(&self, _req: GetClipInfoRequest) -> Result<GetClipInfoResponse, Error> {
            let size = self.streamed_bytes.load(std::sync::atomic::Ordering::Relaxed);
            Ok(GetClipInfoResponse { success: true, size, duration_s: 0.0, format: "mp4".to_owned() })
        }

        async fn stream_clip(
            &self,
            mut chunks: tokio_stream::wrappers::ReceiverStream<StreamClipChunk>,
        ) -> Result<(), Error> {
            use tokio_stream::StreamExt;
            while let Some(chunk) = chunks.next().await {
                if let Some(proto::stream_clip_chunk::Part::Data(d)) = &chunk.part {
                    self.streamed_bytes
                        .fetch_add(d.len() as u64, std::sync::atomic::Ordering::Relaxed);
                }
                self.streamed_chunks.lock().unwrap().push(chunk);
            }
            Ok(())
        }
    }
}
