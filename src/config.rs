// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration, loaded from a single TOML file.

use base::{Error, ErrorKind, ResultExt as _};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/edge-orchestrator")
}

fn default_tunnel_config_path() -> PathBuf {
    PathBuf::from("/etc/wireguard/wg0.conf")
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identifier this edge reports to the backend. Required: there is no compiled-in default.
    pub edge_id: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub cameras: Vec<CameraConfig>,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub transmitter: TransmitterConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let raw = std::fs::read_to_string(path)
            .context(ErrorKind::ConfigInvalid, format!("reading {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .context(ErrorKind::ConfigInvalid, format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.edge_id.trim().is_empty() {
            return Err(Error::msg(ErrorKind::ConfigInvalid, "edge_id must not be empty"));
        }
        for c in &self.cameras {
            if c.id.trim().is_empty() {
                return Err(Error::msg(ErrorKind::ConfigInvalid, "camera id must not be empty"));
            }
            if c.source.is_empty() {
                return Err(Error::msg(
                    ErrorKind::ConfigInvalid,
                    format!("camera {} has no source", c.id),
                ));
            }
            db::parse_camera_kind(&c.kind).map_err(|_| {
                Error::msg(
                    ErrorKind::ConfigInvalid,
                    format!("camera {} has unknown kind {:?}", c.id, c.kind),
                )
            })?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("edge.db")
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.data_dir.join("clips")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub source: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_kind() -> String {
    "rtsp".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_days: i64,
    pub max_percent: f64,
    pub hysteresis_pp: f64,
    pub tick_interval_secs: u64,
    pub batch_size: usize,
    pub disk_cache_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            retention_days: 30,
            max_percent: 80.0,
            hysteresis_pp: 5.0,
            tick_interval_secs: 3600,
            batch_size: 10,
            disk_cache_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub threshold: f32,
    pub clip_secs: u64,
    pub pre_event_secs: u64,
    pub baseline_refresh_secs: u64,
    pub baseline_samples: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            enabled: true,
            interval_secs: 10,
            threshold: 30.0,
            clip_secs: 10,
            pre_event_secs: 5,
            baseline_refresh_secs: 300,
            baseline_samples: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub heartbeat_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub config_path: PathBuf,
    pub health_tick_secs: u64,
    pub reconnect_delay_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            config_path: default_tunnel_config_path(),
            health_tick_secs: 10,
            reconnect_delay_secs: 5,
            ping_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransmitterConfig {
    pub batch_size: i64,
    pub tick_interval_secs: u64,
    pub retry_backoff_secs: u64,
    pub max_queue_size: i64,
    pub capability_sync_interval_secs: u64,
    pub required_normal_samples: i64,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        TransmitterConfig {
            batch_size: 10,
            tick_interval_secs: 1,
            retry_backoff_secs: 5,
            max_queue_size: 10_000,
            capability_sync_interval_secs: 300,
            required_normal_samples: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let toml = r#"
            edge_id = "edge-test-1"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.retention.retention_days, 30);
        assert_eq!(cfg.transmitter.batch_size, 10);
        assert!(cfg.cameras.is_empty());
    }

    #[test]
    fn empty_edge_id_is_rejected() {
        let toml = r#"
            edge_id = ""
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn camera_without_source_is_rejected() {
        let toml = r#"
            edge_id = "edge-test-1"
            [[cameras]]
            id = "cam-1"
            name = "front door"
            source = []
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert!(cfg.validate().is_err());
    }
}
