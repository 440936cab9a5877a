// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The frame decoder / muxer is an external media tool that turns a camera URL or device path
//! into JPEG frames and MP4 clips, deliberately kept out of this process. This module defines
//! only the contract the core consumes, plus a real implementation that shells out to `ffmpeg`
//! and a fake used by tests.

use async_trait::async_trait;
use base::{Error, ErrorKind};
use std::path::Path;
use std::time::Duration;

#[async_trait]
pub trait Muxer: Send + Sync {
    /// Captures a single JPEG frame from `source` at the given quality (0-100).
    async fn capture_frame(&self, source: &str, quality: u8) -> Result<Vec<u8>, Error>;

    /// Writes an MP4 clip covering roughly `duration` from `source` to `out_path`.
    async fn produce_clip(&self, source: &str, duration: Duration, out_path: &Path) -> Result<(), Error>;
}

/// Shells out to `ffmpeg`, the conventional choice for this contract.
pub struct FfmpegMuxer {
    binary: String,
    timeout: Duration,
}

impl FfmpegMuxer {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        FfmpegMuxer { binary: binary.into(), timeout }
    }
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        FfmpegMuxer::new("ffmpeg", Duration::from_secs(5))
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn capture_frame(&self, source: &str, quality: u8) -> Result<Vec<u8>, Error> {
        // ffmpeg's qscale is inverted (2 = best, 31 = worst); map our 0-100 "quality" onto it.
        let qscale = (2 + (100 - quality.min(100)) as u32 * 29 / 100).to_string();
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args([
            "-y", "-rtsp_transport", "tcp", "-i", source, "-frames:v", "1", "-q:v", &qscale,
            "-f", "image2pipe", "-vcodec", "mjpeg", "-",
        ])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::new(ErrorKind::CaptureFailed))?
            .map_err(|e| Error::wrap(ErrorKind::CaptureFailed, "spawning ffmpeg", e))?;
        if !output.status.success() || output.stdout.is_empty() {
            return Err(Error::msg(ErrorKind::CaptureFailed, format!("ffmpeg exited {}", output.status)));
        }
        Ok(output.stdout)
    }

    async fn produce_clip(&self, source: &str, duration: Duration, out_path: &Path) -> Result<(), Error> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).err_kind_capture()?;
        }
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args([
            "-y", "-rtsp_transport", "tcp", "-i", source, "-t", &duration.as_secs().to_string(),
            "-c", "copy",
        ])
        .arg(out_path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
        let status = cmd.status().await.map_err(|e| Error::wrap(ErrorKind::CaptureFailed, "spawning ffmpeg", e))?;
        if !status.success() {
            return Err(Error::msg(ErrorKind::CaptureFailed, format!("ffmpeg exited {status}")));
        }
        Ok(())
    }
}

trait IoResultExt<T> {
    fn err_kind_capture(self) -> Result<T, Error>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn err_kind_capture(self) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(ErrorKind::CaptureFailed, "preparing clip output directory", e))
    }
}

/// In-memory fake used by tests: returns a fixed frame and writes a placeholder file.
pub struct FakeMuxer {
    pub frame: Vec<u8>,
}

impl FakeMuxer {
    pub fn solid_color(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut img = image::RgbImage::new(width, height);
        for px in img.pixels_mut() {
            *px = image::Rgb(rgb);
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .expect("encoding a fixed-size in-memory test image never fails");
        FakeMuxer { frame: buf }
    }
}

#[async_trait]
impl Muxer for FakeMuxer {
    async fn capture_frame(&self, _source: &str, _quality: u8) -> Result<Vec<u8>, Error> {
        Ok(self.frame.clone())
    }

    async fn produce_clip(&self, _source: &str, _duration: Duration, out_path: &Path) -> Result<(), Error> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).err_kind_capture()?;
        }
        std::fs::write(out_path, b"fake-mp4-bytes").err_kind_capture()
    }
}
