// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A small, dependency-free error type shared by every crate in the workspace.
//!
//! Rather than a large enum of source-level error types, callers classify failures into a
//! closed set of semantic [`ErrorKind`]s (borrowed from the gRPC status code taxonomy, which
//! is a reasonable general-purpose classification) and attach an optional message and cause.

use std::fmt::{self, Write as _};

/// Semantic error classification used across the edge runtime.
///
/// These are the kinds the core event pipeline is documented to distinguish: store failures,
/// dangling foreign keys, backpressure, disk exhaustion, contended retention passes, invalid
/// tunnel configuration, tunnel-down, retryable vs. fatal RPC failures, frame decode/capture
/// failures, poisoned events, and shutdown deadlines.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    StoreUnavailable,
    InvalidRef,
    QueueFull,
    DiskFull,
    Busy,
    ConfigInvalid,
    TunnelDown,
    RpcRetryable,
    RpcFatal,
    DecodeFailed,
    CaptureFailed,
    EventPoisoned,
    ShutdownTimeout,
    /// Catch-all for errors that don't fit a more specific kind above.
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StoreUnavailable => "store unavailable",
            ErrorKind::InvalidRef => "invalid reference",
            ErrorKind::QueueFull => "queue full",
            ErrorKind::DiskFull => "disk full",
            ErrorKind::Busy => "busy",
            ErrorKind::ConfigInvalid => "invalid configuration",
            ErrorKind::TunnelDown => "tunnel down",
            ErrorKind::RpcRetryable => "retryable rpc error",
            ErrorKind::RpcFatal => "fatal rpc error",
            ErrorKind::DecodeFailed => "decode failed",
            ErrorKind::CaptureFailed => "capture failed",
            ErrorKind::EventPoisoned => "event poisoned",
            ErrorKind::ShutdownTimeout => "shutdown timeout",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workspace-wide error type.
///
/// Carries a required [`ErrorKind`], an optional human-readable message, and an optional
/// boxed cause for context chaining (see [`Error::chain`]).
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            cause: None,
        }
    }

    pub fn msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            cause: None,
        }
    }

    pub fn wrap(
        kind: ErrorKind,
        msg: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Renders this error and its full cause chain as a single multi-line string, suitable
    /// for a top-level log line (`error!(err = %e.chain(), ...)`).
    pub fn chain(&self) -> String {
        let mut s = String::new();
        write!(&mut s, "{self}").unwrap();
        let mut cause: Option<&(dyn std::error::Error + 'static)> =
            self.cause.as_deref().map(|c| c as _);
        while let Some(c) = cause {
            write!(&mut s, "\ncaused by: {c}").unwrap();
            cause = c.source();
        }
        s
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            None => write!(f, "{}", self.kind),
            Some(m) => write!(f, "{}: {}", self.kind, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("msg", &self.msg)
            .finish_non_exhaustive()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::wrap(ErrorKind::Internal, "i/o error", e)
    }
}

/// Extension methods for attaching an [`ErrorKind`] to a foreign error.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind, losing its original type but preserving its
    /// `Display` output as the cause chain.
    ///
    /// ```
    /// use edge_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;

    /// Like [`ResultExt::err_kind`], but with a caller-supplied message.
    fn context(self, k: ErrorKind, msg: impl Into<String>) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e.to_string(), e))
    }

    fn context(self, k: ErrorKind, msg: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, msg.into(), e))
    }
}

/// Like `anyhow::bail!`, but the first argument names an [`ErrorKind`].
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $msg:expr) => {
        return Err($crate::Error::msg($crate::ErrorKind::$t, $msg));
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::msg($crate::ErrorKind::$t, format!($fmt, $($arg)+)));
    };
}

/// Like `anyhow::format_err!`, but the first argument names an [`ErrorKind`].
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $msg:expr) => {
        $crate::Error::msg($crate::ErrorKind::$t, $msg)
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        $crate::Error::msg($crate::ErrorKind::$t, format!($fmt, $($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let e = Error::msg(ErrorKind::DiskFull, "clips volume at 97%");
        assert_eq!(e.to_string(), "disk full: clips volume at 97%");
    }

    #[test]
    fn chain_includes_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let e = Error::wrap(ErrorKind::StoreUnavailable, "opening db", io);
        let chain = e.chain();
        assert!(chain.contains("store unavailable: opening db"));
        assert!(chain.contains("caused by: no such file"));
    }

    #[test]
    fn bail_macro_sets_kind() {
        fn f() -> Result<(), Error> {
            bail_t!(Busy, "retention already running");
        }
        let e = f().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Busy);
    }
}
