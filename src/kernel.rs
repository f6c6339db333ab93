// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The Sobel program and its two entry points.

use crate::{
    error::{Error, Result},
    gpu::ComputeDevice,
};
use std::{fmt, fs, path::Path};
use tracing::{error, info};

/// Kernel source bundled with the application.
pub const EMBEDDED_SOURCE: &str = include_str!("../kernels/sobel_nv12.cl");

/// Largest kernel source accepted from disk.
pub const MAX_SOURCE_SIZE: usize = 0x100000;

/// Sobel stencil selection.
#[derive(clap::ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelVariant {
    /// Full 3x3 stencil
    #[value(name = "sobel3x3")]
    Sobel3x3,
    /// Cheaper stencil whose horizontal gradient skips the centre row
    #[value(name = "sobel3x1")]
    Sobel3x1,
}

impl KernelVariant {
    pub const fn entry_point(&self) -> &'static str {
        match self {
            KernelVariant::Sobel3x3 => "sobel_3x3",
            KernelVariant::Sobel3x1 => "sobel_3x1",
        }
    }

    pub fn from_entry_point(name: &str) -> Option<Self> {
        match name {
            "sobel_3x3" => Some(KernelVariant::Sobel3x3),
            "sobel_3x1" => Some(KernelVariant::Sobel3x1),
            _ => None,
        }
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Which part of each frame is filtered.
#[derive(clap::ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum RenderArea {
    /// Filter the whole frame
    Full,
    /// Filter the left half of every row; the rest keeps the source video
    Half,
}

impl RenderArea {
    /// Luma columns covered by one work item along grid axis 1.
    pub const fn group_width(&self) -> usize {
        match self {
            RenderArea::Full => 8,
            RenderArea::Half => 16,
        }
    }
}

impl fmt::Display for RenderArea {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RenderArea::Full => f.write_str("full"),
            RenderArea::Half => f.write_str("half"),
        }
    }
}

/// Reads kernel source text from `path`.
pub fn load_source(path: &Path) -> Result<String> {
    let source = fs::read_to_string(path).map_err(Error::io("read kernel source"))?;
    if source.len() > MAX_SOURCE_SIZE {
        return Err(Error::Config(format!(
            "kernel source {} is {} bytes, limit is {}",
            path.display(),
            source.len(),
            MAX_SOURCE_SIZE
        )));
    }
    info!(
        "read cl file \"{}\", size of {} bytes",
        path.display(),
        source.len()
    );
    Ok(source)
}

/// A program compiled for one device.
pub struct KernelProgram<D: ComputeDevice> {
    program: D::Program,
}

impl<D: ComputeDevice> KernelProgram<D> {
    /// Compiles `source`, logging the compiler diagnostics on failure.
    pub fn build(device: &D, source: &str) -> Result<Self> {
        match device.build_program(source, "") {
            Ok(program) => Ok(Self { program }),
            Err(err) => {
                error!("could not build cl program: {}", err);
                if let Some(log) = err.build_log() {
                    error!("{}", log);
                }
                Err(err)
            }
        }
    }

    pub fn create_kernel(&self, device: &D, variant: KernelVariant) -> Result<D::Kernel> {
        device.create_kernel(&self.program, variant.entry_point())
    }
}
