// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::{
    ffi::c_void,
    fmt, io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{debug, warn};
use videostream::fourcc::FourCC;

/// NV12 4:2:0 YUV semi-planar format: a full resolution luma plane followed
/// by a half-height plane of interleaved CbCr samples.
pub const NV12: FourCC = FourCC(*b"NV12");

/// Neutral chroma value written for every CbCr sample of a filtered frame.
pub const CHROMA_NEUTRAL: u8 = 128;

/// Plane geometry of an NV12 frame.
///
/// Both planes share the same row stride, which is the frame width.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Nv12Layout {
    pub width: u32,
    pub height: u32,
}

impl Nv12Layout {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn stride(&self) -> usize {
        self.width as usize
    }

    pub const fn luma_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Interleaved CbCr plane: half the rows of the luma plane, same stride.
    pub const fn chroma_size(&self) -> usize {
        self.luma_size() / 2
    }

    pub const fn frame_size(&self) -> usize {
        self.luma_size() + self.chroma_size()
    }

    pub const fn chroma_rows(&self) -> usize {
        self.height as usize / 2
    }

    /// The same frame as delivered by a stream rotated 90 or 270 degrees.
    pub const fn transposed(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

impl fmt::Display for Nv12Layout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, NV12)
    }
}

/// Page-mapped host memory region, unmapped exactly once when dropped.
///
/// Regions are either private anonymous memory or a shared mapping of a
/// file descriptor (DMA heap allocations, V4L2 DMA buffers). A region
/// created from an owned descriptor keeps it open for the lifetime of the
/// mapping.
///
/// # Safety
///
/// While the API is safe, the region is routinely handed to a GPU runtime
/// as zero-copy host memory. Callers must not read results before the GPU
/// has confirmed completion of the work writing them.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    _fd: Option<OwnedFd>,
}

impl MappedRegion {
    /// Maps `len` bytes of zero-initialised private anonymous memory.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let ptr = map(len, MAP_PRIVATE | MAP_ANONYMOUS, -1)?;
        debug!("mapped {} anonymous bytes", len);
        Ok(Self { ptr, len, _fd: None })
    }

    /// Maps `len` bytes of the buffer behind `fd`, shared with its other
    /// users. The descriptor is not retained.
    pub fn shared(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        let ptr = map(len, MAP_SHARED, fd.as_raw_fd())?;
        debug!("mapped {} bytes of fd {}", len, fd.as_raw_fd());
        Ok(Self { ptr, len, _fd: None })
    }

    /// Maps `len` bytes of the buffer behind `fd` and takes ownership of the
    /// descriptor.
    pub fn owned(fd: OwnedFd, len: usize) -> io::Result<Self> {
        let ptr = map(len, MAP_SHARED, fd.as_raw_fd())?;
        debug!("mapped {} bytes of owned fd {}", len, fd.as_raw_fd());
        Ok(Self {
            ptr,
            len,
            _fd: Some(fd),
        })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

fn map(len: usize, flags: i32, fd: i32) -> io::Result<NonNull<u8>> {
    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot map an empty region",
        ));
    }
    let ptr = unsafe { mmap(null_mut(), len, PROT_READ | PROT_WRITE, flags, fd, 0) };
    if ptr == MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if unsafe { munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        } else {
            debug!("unmapped {} bytes", self.len);
        }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
