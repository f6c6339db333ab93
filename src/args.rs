// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use vdo_cl_filter::{
    kernel::{KernelVariant, RenderArea},
    output::OutputMemory,
};
use videostream::camera::Mirror;

/// Camera image mirroring options.
///
/// Determines how the camera image should be flipped before filtering.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum MirrorSetting {
    /// No mirroring
    None,
    /// Flip horizontally (left-right)
    Horizontal,
    /// Flip vertically (top-bottom)
    Vertical,
    /// Flip both horizontally and vertically (180-degree rotation)
    Both,
}

impl From<MirrorSetting> for Mirror {
    fn from(setting: MirrorSetting) -> Self {
        match setting {
            MirrorSetting::None => Mirror::None,
            MirrorSetting::Horizontal => Mirror::Horizontal,
            MirrorSetting::Vertical => Mirror::Vertical,
            MirrorSetting::Both => Mirror::Both,
        }
    }
}

/// Device the Sobel kernel runs on.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum Backend {
    /// Host reference implementation of the kernel
    Software,
    /// First OpenCL platform's default device
    #[cfg(feature = "opencl")]
    Opencl,
}

/// Command-line arguments for the filter demo.
///
/// Streams NV12 frames from a camera, or replays them from a raw file,
/// runs a Sobel edge filter over each one without copying the frame and
/// appends the filtered frames to the output file. Arguments can be
/// specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Five 720p frames from the camera, left half filtered
/// vdo-cl-filter --camera /dev/video3 --output /tmp/sobel.yuv
///
/// # Replay a recording through the full-frame 3x1 kernel
/// vdo-cl-filter --input capture.nv12 --area full --kernel sobel3x1 --frames 100
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Camera capture device path (e.g., /dev/video0)
    #[arg(short, long, env = "CAMERA", default_value = "/dev/video3")]
    pub camera: String,

    /// Replay raw NV12 frames from this file instead of the camera
    #[arg(short, long, env = "INPUT")]
    pub input: Option<PathBuf>,

    /// Frame resolution in pixels (width height)
    #[arg(
        long,
        env = "SIZE",
        default_value = "1280 720",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub size: Vec<u32>,

    /// Number of frames to filter
    #[arg(short, long, env = "FRAMES", default_value = "5")]
    pub frames: u32,

    /// Buffers in the capture ring
    #[arg(long, env = "BUFFER_COUNT", default_value = "3")]
    pub buffer_count: usize,

    /// Sobel kernel variant
    #[arg(short, long, env = "KERNEL", default_value = "sobel3x3", value_enum)]
    pub kernel: KernelVariant,

    /// Part of each frame to filter
    #[arg(short, long, env = "AREA", default_value = "half", value_enum)]
    pub area: RenderArea,

    /// Kernel source file, replacing the built-in kernel
    #[arg(long, env = "KERNEL_SOURCE")]
    pub kernel_source: Option<PathBuf>,

    /// File the filtered NV12 frames are written to
    #[arg(short, long, env = "OUTPUT", default_value = "/tmp/sobel.yuv")]
    pub output: PathBuf,

    /// Device the kernel runs on
    #[arg(long, env = "BACKEND", default_value = "software", value_enum)]
    pub backend: Backend,

    /// Memory backing the output frame buffer
    #[arg(long, env = "OUTPUT_MEMORY", default_value = "anonymous", value_enum)]
    pub output_memory: OutputMemory,

    /// Camera image mirroring setting
    #[arg(long, env = "MIRROR", default_value = "none", value_enum)]
    pub mirror: MirrorSetting,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,

    /// Application log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub rust_log: LevelFilter,
}

impl Args {
    pub fn width(&self) -> u32 {
        self.size[0]
    }

    pub fn height(&self) -> u32 {
        self.size[1]
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.verbose {
            self.rust_log.max(LevelFilter::DEBUG)
        } else {
            self.rust_log
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["vdo-cl-filter"]).unwrap();
        assert_eq!((args.width(), args.height()), (1280, 720));
        assert_eq!(args.frames, 5);
        assert_eq!(args.buffer_count, 3);
        assert_eq!(args.kernel, KernelVariant::Sobel3x3);
        assert_eq!(args.area, RenderArea::Half);
        assert_eq!(args.backend, Backend::Software);
    }

    #[test]
    fn verbose_raises_level() {
        let args = Args::try_parse_from(["vdo-cl-filter", "--rust-log", "warn", "-v"]).unwrap();
        assert_eq!(args.log_level(), LevelFilter::DEBUG);

        let args = Args::try_parse_from(["vdo-cl-filter", "--rust-log", "trace", "-v"]).unwrap();
        assert_eq!(args.log_level(), LevelFilter::TRACE);
    }

    #[test]
    fn size_takes_two_values() {
        let args = Args::try_parse_from(["vdo-cl-filter", "--size", "640", "480"]).unwrap();
        assert_eq!((args.width(), args.height()), (640, 480));
        assert!(Args::try_parse_from(["vdo-cl-filter", "--size", "640"]).is_err());
    }
}
