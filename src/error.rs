// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error taxonomy for the filtering pipeline.
//!
//! Every variant is fatal for the current run. The driver aborts the frame
//! loop on the first error and tears down whatever was set up so far. The
//! only exception is an expected source interruption (see
//! [`Error::is_expected`]), which is reported as a clean shutdown.

use std::{fmt::Display, io};

/// All errors raised by the filtering pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Video source unavailable, stream start failure, acquire or release
    /// failure.
    #[error("video source {op} failed{}: {message}", fmt_code(.code))]
    Source {
        op: &'static str,
        code: Option<i32>,
        message: String,
        expected: bool,
    },

    /// Platform or device enumeration, context, program, kernel or queue
    /// creation failure. Compile failures carry the compiler's build log.
    #[error("GPU setup {op} failed (code {code})")]
    GpuSetup {
        op: &'static str,
        code: i32,
        log: Option<String>,
    },

    /// The GPU runtime refused to wrap a host memory region.
    #[error("GPU {op} of {size} bytes failed (code {code})")]
    GpuAllocation {
        op: &'static str,
        size: usize,
        code: i32,
    },

    /// Argument binding, dispatch or completion wait failure.
    #[error("kernel {op} failed (code {code})")]
    KernelExecution { op: &'static str, code: i32 },

    /// Output sink or kernel source I/O failure.
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The source produced more distinct buffers than the ring it was
    /// configured with.
    #[error("buffer registry full: {capacity} distinct buffers already mapped")]
    TooManyBuffers { capacity: usize },

    /// A frame does not fit the configured NV12 geometry.
    #[error("frame of {size} bytes does not fit the output buffer ({expected} bytes)")]
    FrameSize { size: usize, expected: usize },

    /// Invalid geometry or run parameters, rejected before streaming.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (code {code})"),
        None => String::new(),
    }
}

impl Error {
    /// Builds a [`Error::Source`] from any displayable collaborator error.
    pub fn video(op: &'static str, err: impl Display) -> Self {
        Error::Source {
            op,
            code: None,
            message: err.to_string(),
            expected: false,
        }
    }

    /// Source-side interruption that should end the run without failing it,
    /// such as the video service restarting or a replay reaching its end.
    pub fn interrupted(op: &'static str, message: impl Into<String>) -> Self {
        Error::Source {
            op,
            code: None,
            message: message.into(),
            expected: true,
        }
    }

    /// Returns a closure wrapping an [`io::Error`] with the failing
    /// operation's name, for use with `map_err`.
    pub fn io(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Io { op, source }
    }

    pub fn is_expected(&self) -> bool {
        matches!(self, Error::Source { expected: true, .. })
    }

    /// Stable integer code for log correlation.
    ///
    /// - 1xx: video source
    /// - 2xx: GPU setup and allocation
    /// - 3xx: kernel execution
    /// - 4xx: I/O
    /// - 5xx: buffer and geometry contracts
    pub fn error_code(&self) -> u32 {
        match self {
            Error::Source { expected: true, .. } => 100,
            Error::Source { .. } => 101,
            Error::GpuSetup { log: Some(_), .. } => 200,
            Error::GpuSetup { .. } => 201,
            Error::GpuAllocation { .. } => 202,
            Error::KernelExecution { .. } => 300,
            Error::Io { .. } => 400,
            Error::TooManyBuffers { .. } => 500,
            Error::FrameSize { .. } => 501,
            Error::Config(_) => 502,
        }
    }

    /// Compiler diagnostics attached to a failed program build.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Error::GpuSetup { log: Some(log), .. } => Some(log),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_only_for_flagged_source_errors() {
        assert!(Error::interrupted("get_buffer", "service restarting").is_expected());
        assert!(!Error::video("get_buffer", "device gone").is_expected());
        assert!(!Error::TooManyBuffers { capacity: 3 }.is_expected());
    }

    #[test]
    fn display_includes_operation_and_code() {
        let err = Error::KernelExecution {
            op: "enqueue",
            code: -54,
        };
        assert_eq!(err.to_string(), "kernel enqueue failed (code -54)");

        let err = Error::Source {
            op: "release_buffer",
            code: Some(5),
            message: "busy".into(),
            expected: false,
        };
        assert_eq!(
            err.to_string(),
            "video source release_buffer failed (code 5): busy"
        );
    }

    #[test]
    fn build_log_is_exposed() {
        let err = Error::GpuSetup {
            op: "build_program",
            code: -11,
            log: Some("error: expected ';'".into()),
        };
        assert_eq!(err.build_log(), Some("error: expected ';'"));
        assert_eq!(err.error_code(), 200);
    }

    #[test]
    fn io_helper_keeps_source() {
        let err = Error::io("write frame")(io::Error::new(io::ErrorKind::WriteZero, "disk full"));
        assert!(matches!(err, Error::Io { op: "write frame", .. }));
        assert!(std::error::Error::source(&err).is_some());
    }
}
