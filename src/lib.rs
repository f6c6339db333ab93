// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # Zero-Copy Video Filtering
//!
//! This library streams NV12 video frames into a GPU compute kernel without
//! copying them, runs a Sobel edge filter over the luma plane and writes the
//! filtered frames out, one frame at a time.
//!
//! ## Features
//!
//! - **Zero-copy input**: Each buffer of the video source's ring is wrapped
//!   for the GPU once and reused for every frame delivered in it.
//! - **Reusable output**: One page-mapped NV12 output frame, optionally
//!   allocated from the CMA DMA heap, wrapped once for the whole run.
//! - **Two stencils**: Full 3x3 Sobel and a cheaper 3x1 variant, over the
//!   whole frame or its left half.
//! - **Backends**: OpenCL (feature `opencl`) and a host reference device
//!   with identical output.
//! - **Sources**: V4L2 capture through videostream, or replay of raw NV12
//!   recordings.
//!
//! ## Example
//!
//! ```no_run
//! use vdo_cl_filter::{
//!     pipeline::{run_pipeline, Cancellation, PipelineConfig},
//!     replay::ReplaySource,
//!     software::SoftwareDevice,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let source = ReplaySource::open("capture.nv12")?;
//! let output = std::fs::File::create("/tmp/sobel.yuv")?;
//!
//! let report = run_pipeline(&config, SoftwareDevice::new(), source, output, &Cancellation::new())?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! Handing host memory to a GPU runtime is inherently unsafe. The unsafe
//! surface is limited to [`video::VideoFrame`], which promises the frame
//! memory outlives its stream, and [`gpu::ComputeDevice::wrap_host_memory`].
//! The pipeline orders teardown so every memory object is released before
//! the memory it wraps.

pub mod camera;
pub mod error;
pub mod executor;
pub mod gpu;
pub mod image;
pub mod kernel;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod replay;
pub mod software;
pub mod video;

pub use error::{Error, Result};
