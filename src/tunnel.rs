// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Parses a small subset of the WireGuard INI grammar, brings the
//! interface up through a pluggable [`TunnelDriver`], and runs a health tick that flips the
//! published state and gates the RPC channel the rest of the system sends through.

use crate::bus::{BusEvent, EventBus};
use crate::config::TunnelConfig;
use crate::rpc::ChannelHandle;
use crate::supervisor::{Component, Context};
use async_trait::async_trait;
use base::{Error, ErrorKind};
use nom::bytes::complete::{is_not, take_while1};
use nom::character::complete::{char, line_ending, space0};
use nom::combinator::{map, opt};
use nom::multi::many0;
use nom::sequence::{delimited, terminated, tuple};
use nom::{IResult, Parser};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgConfig {
    pub private_key: String,
    pub address: Option<String>,
    pub peer_public_key: String,
    pub peer_allowed_ips: Option<String>,
    pub peer_endpoint: Option<String>,
    pub peer_preshared_key: Option<String>,
    pub peer_persistent_keepalive: Option<u32>,
}

#[derive(Debug, Clone)]
enum Line {
    Section(String),
    KeyValue(String, String),
    Blank,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn section_line(input: &str) -> IResult<&str, Line> {
    map(
        delimited(char('['), take_while1(is_ident_char), char(']')),
        |s: &str| Line::Section(s.to_owned()),
    )
    .parse(input)
}

fn kv_line(input: &str) -> IResult<&str, Line> {
    let (input, key) = take_while1(|c: char| c != '=' && !c.is_whitespace())(input)?;
    let (input, _) = tuple((space0, char('='), space0))(input)?;
    let (input, value) = opt(is_not("\r\n")).parse(input)?;
    Ok((input, Line::KeyValue(key.to_owned(), value.unwrap_or("").trim().to_owned())))
}

/// Matches only a genuinely blank or `#`-comment line; anything else fails so `alt` falls
/// through to [`kv_line`]. A version of this that matched greedily on `space0` alone would
/// consume zero input for a real key/value line and send `many0` into an infinite loop.
fn comment_or_blank(input: &str) -> IResult<&str, Line> {
    // Fails on a fully empty input so `many0` can terminate normally instead of tripping its
    // zero-consumption guard on a trailing blank "line" at end of file.
    if input.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Eof)));
    }
    let (rest, _) = space0(input)?;
    if rest.starts_with('#') {
        let (rest, _) = is_not("\r\n")(rest)?;
        Ok((rest, Line::Blank))
    } else if rest.starts_with('\r') || rest.starts_with('\n') {
        Ok((rest, Line::Blank))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Tag)))
    }
}

fn one_line(input: &str) -> IResult<&str, Line> {
    terminated(
        nom::branch::alt((section_line, comment_or_blank, kv_line)),
        opt(line_ending),
    )
    .parse(input)
}

/// Parses the tiny INI subset the tunnel supervisor consumes: `[Interface]` with `PrivateKey`/
/// `Address`, and `[Peer]` with `PublicKey` and optional `AllowedIPs`/`Endpoint`/`PresharedKey`/
/// `PersistentKeepalive`. Blank lines and `#` comments are ignored.
pub fn parse_wg_config(input: &str) -> Result<WgConfig, Error> {
    let (_, lines) = many0(one_line)
        .parse(input)
        .map_err(|e| Error::msg(ErrorKind::ConfigInvalid, format!("malformed tunnel config: {e}")))?;

    let mut cfg = WgConfig::default();
    let mut section = String::new();
    for line in lines {
        match line {
            Line::Section(name) => section = name,
            Line::KeyValue(key, value) => match (section.as_str(), key.as_str()) {
                ("Interface", "PrivateKey") => cfg.private_key = value,
                ("Interface", "Address") => cfg.address = Some(value),
                ("Peer", "PublicKey") => cfg.peer_public_key = value,
                ("Peer", "AllowedIPs") => cfg.peer_allowed_ips = Some(value),
                ("Peer", "Endpoint") => cfg.peer_endpoint = Some(value),
                ("Peer", "PresharedKey") => cfg.peer_preshared_key = Some(value),
                ("Peer", "PersistentKeepalive") => cfg.peer_persistent_keepalive = value.parse().ok(),
                _ => {}
            },
            Line::Blank => {}
        }
    }

    if cfg.private_key.is_empty() {
        return Err(Error::msg(ErrorKind::ConfigInvalid, "tunnel config missing [Interface] PrivateKey"));
    }
    if cfg.peer_public_key.is_empty() {
        return Err(Error::msg(ErrorKind::ConfigInvalid, "tunnel config missing [Peer] PublicKey"));
    }
    Ok(cfg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Down = 0,
    ComingUp = 1,
    Up = 2,
    GoingDown = 3,
}

impl From<u8> for TunnelState {
    fn from(v: u8) -> Self {
        match v {
            1 => TunnelState::ComingUp,
            2 => TunnelState::Up,
            3 => TunnelState::GoingDown,
            _ => TunnelState::Down,
        }
    }
}

/// Sentinel returned by a failed latency probe, so the health loop can treat "no reply" as a
/// very bad latency rather than special-casing an error variant.
pub const PING_FAILED_LATENCY: Duration = Duration::from_secs(u64::MAX / 2);

#[async_trait]
pub trait TunnelDriver: Send + Sync {
    async fn bring_up(&self, cfg: &WgConfig) -> Result<String, Error>;
    async fn bring_down(&self) -> Result<(), Error>;
    async fn probe_latency(&self, backend_addr: &str, timeout: Duration) -> Duration;
}

/// Shells out to `wg-quick`; the interface's reachability is then probed with a plain TCP
/// connect to the backend address rather than ICMP, which needs privileges this process doesn't
/// otherwise need.
pub struct WgQuickDriver {
    config_path: std::path::PathBuf,
}

impl WgQuickDriver {
    pub fn new(config_path: std::path::PathBuf) -> Self {
        WgQuickDriver { config_path }
    }
}

#[async_trait]
impl TunnelDriver for WgQuickDriver {
    async fn bring_up(&self, cfg: &WgConfig) -> Result<String, Error> {
        let status = tokio::process::Command::new("wg-quick")
            .arg("up")
            .arg(&self.config_path)
            .status()
            .await
            .map_err(|e| Error::wrap(ErrorKind::TunnelDown, "spawning wg-quick up", e))?;
        if !status.success() {
            return Err(Error::msg(ErrorKind::TunnelDown, format!("wg-quick up exited {status}")));
        }
        let backend = cfg
            .peer_allowed_ips
            .as_deref()
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.split('/').next())
            .unwrap_or("127.0.0.1")
            .to_owned();
        Ok(backend)
    }

    async fn bring_down(&self) -> Result<(), Error> {
        let status = tokio::process::Command::new("wg-quick")
            .arg("down")
            .arg(&self.config_path)
            .status()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Internal, "spawning wg-quick down", e))?;
        if !status.success() {
            warn!(%status, "wg-quick down exited non-zero");
        }
        Ok(())
    }

    async fn probe_latency(&self, backend_addr: &str, timeout: Duration) -> Duration {
        let target = format!("{backend_addr}:50051");
        let start = std::time::Instant::now();
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&target)).await {
            Ok(Ok(_)) => start.elapsed(),
            _ => PING_FAILED_LATENCY,
        }
    }
}

pub struct FakeTunnelDriver {
    pub healthy: std::sync::atomic::AtomicBool,
}

impl Default for FakeTunnelDriver {
    fn default() -> Self {
        FakeTunnelDriver { healthy: std::sync::atomic::AtomicBool::new(true) }
    }
}

#[async_trait]
impl TunnelDriver for FakeTunnelDriver {
    async fn bring_up(&self, _cfg: &WgConfig) -> Result<String, Error> {
        Ok("127.0.0.1".to_owned())
    }

    async fn bring_down(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn probe_latency(&self, _backend_addr: &str, _timeout: Duration) -> Duration {
        if self.healthy.load(Ordering::Relaxed) {
            Duration::from_millis(5)
        } else {
            PING_FAILED_LATENCY
        }
    }
}

pub struct TunnelSupervisor {
    config_path: std::path::PathBuf,
    driver: std::sync::Arc<dyn TunnelDriver>,
    channel: ChannelHandle,
    bus: EventBus,
    cfg: TunnelConfig,
    state: AtomicU8,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TunnelSupervisor {
    pub fn new(
        config_path: std::path::PathBuf,
        driver: std::sync::Arc<dyn TunnelDriver>,
        channel: ChannelHandle,
        bus: EventBus,
        cfg: TunnelConfig,
    ) -> Self {
        TunnelSupervisor {
            config_path,
            driver,
            channel,
            bus,
            cfg,
            state: AtomicU8::new(TunnelState::Down as u8),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, s: TunnelState) {
        self.state.store(s as u8, Ordering::Relaxed);
    }

    fn load_config(&self) -> Result<WgConfig, Error> {
        let text = std::fs::read_to_string(&self.config_path)
            .map_err(|e| Error::wrap(ErrorKind::ConfigInvalid, "reading tunnel config", e))?;
        parse_wg_config(&text)
    }

    async fn connect(&self) -> Result<(), Error> {
        self.set_state(TunnelState::ComingUp);
        let wg = self.load_config()?;
        let backend_addr = self.driver.bring_up(&wg).await?;
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{backend_addr}:50051"))
            .map_err(|e| Error::wrap(ErrorKind::TunnelDown, "building backend endpoint", e))?;
        self.channel.set(endpoint.connect_lazy());
        self.set_state(TunnelState::Up);
        self.bus.publish(BusEvent::TunnelUp);
        info!(backend_addr, "tunnel up");
        Ok(())
    }

    async fn disconnect(&self) {
        self.set_state(TunnelState::GoingDown);
        self.channel.clear();
        if let Err(e) = self.driver.bring_down().await {
            warn!(err = %e.chain(), "tunnel bring-down failed");
        }
        self.set_state(TunnelState::Down);
        self.bus.publish(BusEvent::TunnelDown);
    }

    async fn health_check(&self) {
        if self.state() != TunnelState::Up {
            return;
        }
        let wg = match self.load_config() {
            Ok(wg) => wg,
            Err(_) => return,
        };
        let backend_addr = wg
            .peer_allowed_ips
            .as_deref()
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.split('/').next())
            .unwrap_or("127.0.0.1")
            .to_owned();
        let latency = self
            .driver
            .probe_latency(&backend_addr, Duration::from_secs(self.cfg.ping_timeout_secs))
            .await;
        if latency == PING_FAILED_LATENCY {
            warn!("tunnel health probe failed, tearing down for reconnect");
            self.disconnect().await;
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: crate::supervisor::CancelToken) {
        let health_interval = Duration::from_secs(self.cfg.health_tick_secs.max(1));
        let reconnect_delay = Duration::from_secs(self.cfg.reconnect_delay_secs.max(1));

        loop {
            if self.state() == TunnelState::Down {
                if let Err(e) = self.connect().await {
                    warn!(err = %e.chain(), "tunnel connect failed, will retry");
                    self.set_state(TunnelState::Down);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(reconnect_delay) => continue,
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(health_interval) => self.health_check().await,
            }
        }
    }
}

#[async_trait]
impl Component for TunnelSupervisor {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    async fn start(self: Arc<Self>, ctx: &Context) -> Result<(), Error> {
        let cancel = ctx.cancel.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop(cancel).await });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), Error> {
        if self.state() == TunnelState::Up {
            self.disconnect().await;
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "[Interface]\nPrivateKey = abc123\nAddress = 10.0.0.2/24\n\n# comment\n[Peer]\nPublicKey = def456\nAllowedIPs = 10.0.0.1/32\nEndpoint = edge.example.com:51820\nPersistentKeepalive = 25\n";

    #[test]
    fn parses_interface_and_peer_sections() {
        let cfg = parse_wg_config(SAMPLE).unwrap();
        assert_eq!(cfg.private_key, "abc123");
        assert_eq!(cfg.address.as_deref(), Some("10.0.0.2/24"));
        assert_eq!(cfg.peer_public_key, "def456");
        assert_eq!(cfg.peer_allowed_ips.as_deref(), Some("10.0.0.1/32"));
        assert_eq!(cfg.peer_endpoint.as_deref(), Some("edge.example.com:51820"));
        assert_eq!(cfg.peer_persistent_keepalive, Some(25));
    }

    #[test]
    fn missing_private_key_is_config_invalid() {
        let err = parse_wg_config("[Peer]\nPublicKey = def456\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn missing_peer_public_key_is_config_invalid() {
        let err = parse_wg_config("[Interface]\nPrivateKey = abc123\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn health_check_tears_down_on_failed_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.conf");
        std::fs::write(&path, SAMPLE).unwrap();
        let driver = std::sync::Arc::new(FakeTunnelDriver::default());
        let channel = ChannelHandle::new();
        let sup = TunnelSupervisor::new(path, driver.clone(), channel, EventBus::new(), TunnelConfig::default());
        sup.connect().await.unwrap();
        assert_eq!(sup.state(), TunnelState::Up);
        driver.healthy.store(false, Ordering::Relaxed);
        sup.health_check().await;
        assert_eq!(sup.state(), TunnelState::Down);
    }
}
