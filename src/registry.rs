// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Cache of GPU memory objects wrapping the video source's buffers.
//!
//! The source cycles through a small fixed ring of buffers. Each buffer is
//! wrapped for the GPU the first time it is seen and the memory object is
//! reused for every later frame delivered in it. Entries are keyed by the
//! source's buffer id; the host address is remembered so a buffer that
//! moved is re-wrapped instead of aliasing stale memory.

use crate::{
    error::{Error, Result},
    gpu::{ComputeDevice, MemAccess},
    video::{BufferId, VideoFrame},
};
use std::{collections::HashMap, ptr::NonNull};
use tracing::{debug, warn};

struct Entry<M> {
    host: NonNull<u8>,
    len: usize,
    memory: M,
}

pub struct BufferRegistry<M> {
    entries: HashMap<BufferId, Entry<M>>,
    capacity: usize,
}

impl<M> BufferRegistry<M> {
    /// Creates a registry that accepts at most `capacity` distinct buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the read-only memory object wrapping the first `len` bytes
    /// of `frame`'s buffer, creating it on first sight.
    ///
    /// Fails with [`Error::TooManyBuffers`] when a new buffer would exceed
    /// the configured capacity, and with [`Error::GpuAllocation`] when the
    /// runtime cannot wrap the region.
    pub fn resolve<D, F>(&mut self, device: &D, frame: &F, len: usize) -> Result<&M>
    where
        D: ComputeDevice<Memory = M>,
        F: VideoFrame + ?Sized,
    {
        if len > frame.size() {
            return Err(Error::FrameSize {
                size: frame.size(),
                expected: len,
            });
        }

        let id = frame.buffer_id();
        let host = frame.host_ptr();
        let stale = match self.entries.get(&id) {
            Some(entry) => entry.host != host || entry.len != len,
            None => {
                if self.entries.len() == self.capacity {
                    return Err(Error::TooManyBuffers {
                        capacity: self.capacity,
                    });
                }
                false
            }
        };

        if stale {
            warn!("buffer {} moved, re-wrapping it", id);
            self.entries.remove(&id);
        }

        if !self.entries.contains_key(&id) {
            // VideoFrame guarantees the region outlives the stream, and the
            // registry is dropped before the stream.
            let memory = unsafe { device.wrap_host_memory(host, len, MemAccess::ReadOnly)? };
            debug!(
                "mapped buffer {} at {:p} ({} bytes), {} of {} in use",
                id,
                host,
                len,
                self.entries.len() + 1,
                self.capacity
            );
            self.entries.insert(id, Entry { host, len, memory });
        }

        self.entries
            .get(&id)
            .map(|entry| &entry.memory)
            .ok_or(Error::TooManyBuffers {
                capacity: self.capacity,
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Releases every registered memory object.
    pub fn clear(&mut self) {
        let released = self.entries.len();
        self.entries.clear();
        debug!("released {} input memory objects", released);
    }
}

impl<M> Drop for BufferRegistry<M> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::MappedRegion, software::SoftwareDevice};

    struct TestFrame {
        id: BufferId,
        ptr: NonNull<u8>,
        size: usize,
    }

    unsafe impl VideoFrame for TestFrame {
        fn host_ptr(&self) -> NonNull<u8> {
            self.ptr
        }

        fn size(&self) -> usize {
            self.size
        }

        fn sequence(&self) -> u32 {
            0
        }

        fn buffer_id(&self) -> BufferId {
            self.id
        }
    }

    fn frame(id: BufferId, region: &MappedRegion) -> TestFrame {
        TestFrame {
            id,
            ptr: region.as_ptr(),
            size: region.len(),
        }
    }

    #[test]
    fn resolving_twice_returns_the_same_object() {
        let device = SoftwareDevice::new();
        let region = MappedRegion::anonymous(4096).unwrap();
        let mut registry = BufferRegistry::new(3);

        let first = registry.resolve(&device, &frame(0, &region), 1024).unwrap().id();
        let second = registry.resolve(&device, &frame(0, &region), 1024).unwrap().id();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let device = SoftwareDevice::new();
        let regions: Vec<_> = (0..4).map(|_| MappedRegion::anonymous(4096).unwrap()).collect();
        let mut registry = BufferRegistry::new(3);

        for (id, region) in regions.iter().take(3).enumerate() {
            registry.resolve(&device, &frame(id as BufferId, region), 4096).unwrap();
        }
        assert_eq!(registry.len(), 3);

        let err = registry
            .resolve(&device, &frame(3, &regions[3]), 4096)
            .unwrap_err();
        assert!(matches!(err, Error::TooManyBuffers { capacity: 3 }));

        // Known buffers still resolve once the registry is full.
        assert!(registry.resolve(&device, &frame(1, &regions[1]), 4096).is_ok());
    }

    #[test]
    fn moved_buffer_is_rewrapped() {
        let device = SoftwareDevice::new();
        let a = MappedRegion::anonymous(4096).unwrap();
        let b = MappedRegion::anonymous(4096).unwrap();
        let mut registry = BufferRegistry::new(1);

        let before = registry.resolve(&device, &frame(7, &a), 4096).unwrap().id();
        let after = registry.resolve(&device, &frame(7, &b), 4096).unwrap();
        assert_ne!(before, after.id());
        assert_eq!(after.host_ptr(), b.as_ptr());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn wrapping_more_than_the_frame_fails() {
        let device = SoftwareDevice::new();
        let region = MappedRegion::anonymous(4096).unwrap();
        let mut registry = BufferRegistry::new(1);
        assert!(matches!(
            registry.resolve(&device, &frame(0, &region), 8192),
            Err(Error::FrameSize { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_releases_everything() {
        let device = SoftwareDevice::new();
        let region = MappedRegion::anonymous(4096).unwrap();
        let mut registry = BufferRegistry::new(2);
        registry.resolve(&device, &frame(0, &region), 4096).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.capacity(), 2);
    }
}
