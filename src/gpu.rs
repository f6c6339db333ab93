// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Contract consumed from the GPU compute runtime.
//!
//! A [`ComputeDevice`] is the selected platform/device together with its
//! context and in-order command queue. Programs, kernels and memory objects
//! are owned values released when dropped; owners must drop them before the
//! device itself.

use crate::error::Result;
use std::{fmt, ptr::NonNull};

/// How a kernel accesses a memory object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
}

impl fmt::Display for MemAccess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemAccess::ReadOnly => f.write_str("read-only"),
            MemAccess::WriteOnly => f.write_str("write-only"),
        }
    }
}

/// A two dimensional NDRange.
///
/// Axis 0 runs over frame rows, axis 1 over column groups.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkGrid {
    pub global: [usize; 2],
    pub local: [usize; 2],
    pub offset: [usize; 2],
}

impl WorkGrid {
    pub fn work_items(&self) -> usize {
        self.global[0] * self.global[1]
    }

    /// Whether every global dimension is a multiple of the local one.
    pub fn is_evenly_divided(&self) -> bool {
        self.local
            .iter()
            .zip(self.global.iter())
            .all(|(&local, &global)| local != 0 && global % local == 0)
    }
}

impl fmt::Display for WorkGrid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "global {}x{} local {}x{} offset {},{}",
            self.global[0],
            self.global[1],
            self.local[0],
            self.local[1],
            self.offset[0],
            self.offset[1]
        )
    }
}

/// A compute device with a context and a command queue.
pub trait ComputeDevice {
    type Program;
    type Kernel;
    type Memory;

    /// Human readable platform properties (profile, version, name, vendor,
    /// extensions) as label/value pairs.
    fn platform_info(&self) -> Vec<(&'static str, String)>;

    /// Compiles `source` for this device. Build failures carry the
    /// compiler's log in [`crate::Error::GpuSetup`].
    fn build_program(&self, source: &str, options: &str) -> Result<Self::Program>;

    fn create_kernel(&self, program: &Self::Program, entry_point: &str) -> Result<Self::Kernel>;

    /// Wraps `len` bytes of existing host memory at `host` without copying.
    ///
    /// # Safety
    ///
    /// The region must stay valid and at the same address for as long as
    /// the returned memory object exists, and for write-only objects must
    /// not be read while kernels writing it are in flight.
    unsafe fn wrap_host_memory(
        &self,
        host: NonNull<u8>,
        len: usize,
        access: MemAccess,
    ) -> Result<Self::Memory>;

    fn set_arg_memory(&self, kernel: &mut Self::Kernel, index: u32, memory: &Self::Memory)
        -> Result<()>;

    fn set_arg_uint(&self, kernel: &mut Self::Kernel, index: u32, value: u32) -> Result<()>;

    /// Queues `kernel` over `grid`. Arguments must all be bound.
    fn enqueue(&self, kernel: &Self::Kernel, grid: &WorkGrid) -> Result<()>;

    /// Blocks until all queued work has completed.
    fn finish(&self) -> Result<()>;
}
