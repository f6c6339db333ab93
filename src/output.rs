// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The output frame buffer shared between the host and the GPU.

use crate::{
    error::{Error, Result},
    gpu::{ComputeDevice, MemAccess},
    image::{MappedRegion, Nv12Layout},
};
use dma_heap::{Heap, HeapKind};
use std::{fmt, io, ptr::NonNull};
use tracing::{debug, info};

/// Where the output buffer's memory comes from.
#[derive(clap::ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputMemory {
    /// Private anonymous page mapping
    Anonymous,
    /// Contiguous DMA heap buffer, shareable with other processes and devices
    Cma,
}

impl fmt::Display for OutputMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutputMemory::Anonymous => f.write_str("anonymous"),
            OutputMemory::Cma => f.write_str("cma"),
        }
    }
}

/// One NV12 frame of host memory, allocated once and reused for the whole
/// run, with its luma and chroma planes wrapped as write-only zero-copy
/// memory objects.
///
/// Fields drop in declaration order, so both memory objects are released
/// before the region they wrap is unmapped.
pub struct OutputBuffer<M> {
    luma: M,
    chroma: M,
    region: MappedRegion,
    layout: Nv12Layout,
}

impl<M> OutputBuffer<M> {
    pub fn new<D>(device: &D, layout: Nv12Layout, memory: OutputMemory) -> Result<Self>
    where
        D: ComputeDevice<Memory = M>,
    {
        let size = layout.frame_size();
        let region = match memory {
            OutputMemory::Anonymous => MappedRegion::anonymous(size),
            OutputMemory::Cma => {
                let heap = Heap::new(HeapKind::Cma)
                    .map_err(|e| io::Error::other(format!("open cma heap: {e}")))
                    .map_err(Error::io("allocate output"))?;
                let fd = heap
                    .allocate(size)
                    .map_err(|e| io::Error::other(format!("allocate {size} bytes: {e}")))
                    .map_err(Error::io("allocate output"))?;
                MappedRegion::owned(fd, size)
            }
        }
        .map_err(Error::io("map output"))?;

        let base = region.as_ptr();
        // The chroma plane starts right after the luma plane inside `region`.
        let chroma_ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(layout.luma_size())) };

        // `region` is owned by the returned buffer and outlives both objects.
        let luma =
            unsafe { device.wrap_host_memory(base, layout.luma_size(), MemAccess::WriteOnly)? };
        let chroma = unsafe {
            device.wrap_host_memory(chroma_ptr, layout.chroma_size(), MemAccess::WriteOnly)?
        };

        info!("allocated {} output buffer for {} ({} bytes)", memory, layout, size);
        Ok(Self {
            luma,
            chroma,
            region,
            layout,
        })
    }

    pub fn luma(&self) -> &M {
        &self.luma
    }

    pub fn chroma(&self) -> &M {
        &self.chroma
    }

    pub fn layout(&self) -> Nv12Layout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Host view of the frame. Only meaningful once the GPU has finished
    /// writing it.
    pub fn as_slice(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        self.region.as_slice_mut()
    }
}

impl<M> Drop for OutputBuffer<M> {
    fn drop(&mut self) {
        debug!("releasing output memory objects for {}", self.layout);
    }
}
