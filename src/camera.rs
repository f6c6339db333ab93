// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! V4L2 capture source backed by the videostream library.
//!
//! Camera buffers are DMA buffers exported by the capture driver. Each
//! distinct buffer is host-mapped the first time it is seen and the mapping
//! is kept until the stream is dropped, so the address handed to the GPU for
//! a given buffer never changes.

use crate::{
    error::{Error, Result},
    image::{MappedRegion, NV12},
    video::{BufferId, StreamConfig, StreamInfo, VideoFrame, VideoSource, VideoStream},
};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    os::fd::RawFd,
    ptr::NonNull,
};
use tracing::{debug, info, warn};
use unix_ts::Timestamp;
use videostream::camera::{create_camera, CameraBuffer, CameraReader, Mirror};

pub struct CameraSource {
    device: String,
    mirror: Mirror,
}

impl CameraSource {
    pub fn new(device: impl Into<String>, mirror: Mirror) -> Self {
        Self {
            device: device.into(),
            mirror,
        }
    }
}

impl VideoSource for CameraSource {
    type Stream = CameraStream;

    fn start(self, config: &StreamConfig) -> Result<CameraStream> {
        if config.subformat != NV12 {
            return Err(Error::video(
                "start",
                format!("camera capture requires {NV12}, not {}", config.subformat),
            ));
        }

        let cam = create_camera()
            .with_device(&self.device)
            .with_resolution(config.width as i32, config.height as i32)
            .with_format(config.subformat)
            .with_mirror(self.mirror)
            .open()
            .map_err(|e| Error::video("open", format!("{}: {e}", self.device)))?;
        cam.start().map_err(|e| Error::video("start", e))?;

        if cam.width() != config.width as i32 || cam.height() != config.height as i32 {
            warn!(
                "requested {}x{} resolution but camera set {}x{}",
                config.width,
                config.height,
                cam.width(),
                cam.height()
            );
        }
        info!(
            "camera {} started: {}x{} {} mirrored {}",
            self.device,
            cam.width(),
            cam.height(),
            cam.format(),
            cam.mirror()
        );

        Ok(CameraStream {
            mappings: RefCell::new(HashMap::with_capacity(config.buffer_count)),
            sequence: Cell::new(0),
            cam,
        })
    }
}

pub struct CameraStream {
    mappings: RefCell<HashMap<RawFd, MappedRegion>>,
    sequence: Cell<u32>,
    cam: CameraReader,
}

impl CameraStream {
    fn map_buffer(&self, buffer: &CameraBuffer<'_>) -> Result<NonNull<u8>> {
        let fd = buffer.rawfd();
        let len = buffer.length() as usize;
        let mut mappings = self.mappings.borrow_mut();
        if let Some(region) = mappings.get(&fd) {
            // Remapping would move memory the GPU may still be wrapping.
            if region.len() < len {
                return Err(Error::video(
                    "map buffer",
                    format!("buffer fd {fd} grew from {} to {len} bytes", region.len()),
                ));
            }
            return Ok(region.as_ptr());
        }

        let region = MappedRegion::shared(buffer.fd(), len).map_err(|e| Error::Source {
            op: "map buffer",
            code: e.raw_os_error(),
            message: e.to_string(),
            expected: false,
        })?;
        debug!("mapped camera buffer fd {} ({} bytes)", fd, len);
        let ptr = region.as_ptr();
        mappings.insert(fd, region);
        Ok(ptr)
    }
}

impl VideoStream for CameraStream {
    type Frame<'a> = CameraFrame<'a>;

    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: self.cam.width() as u32,
            height: self.cam.height() as u32,
            subformat: self.cam.format(),
            framerate: None,
        }
    }

    fn get_buffer(&self) -> Result<CameraFrame<'_>> {
        let buffer = self.cam.read().map_err(|e| Error::video("get_buffer", e))?;
        let ptr = self.map_buffer(&buffer)?;
        let sequence = self.sequence.get();
        self.sequence.set(sequence.wrapping_add(1));
        Ok(CameraFrame {
            ptr,
            size: buffer.length() as usize,
            id: buffer.rawfd() as BufferId,
            timestamp: buffer.timestamp(),
            sequence,
            buffer,
        })
    }

    fn release_buffer<'a>(&'a self, frame: CameraFrame<'a>) -> Result<()> {
        // Dropping the camera buffer queues it back to the driver.
        drop(frame);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        debug!(
            "camera stream stopped after {} frames, {} buffers mapped",
            self.sequence.get(),
            self.mappings.borrow().len()
        );
        Ok(())
    }
}

pub struct CameraFrame<'a> {
    ptr: NonNull<u8>,
    size: usize,
    id: BufferId,
    timestamp: Timestamp,
    sequence: u32,
    #[allow(dead_code)]
    buffer: CameraBuffer<'a>,
}

// Buffer mappings live in the stream and are only unmapped when it drops.
unsafe impl VideoFrame for CameraFrame<'_> {
    fn host_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn size(&self) -> usize {
        self.size
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn buffer_id(&self) -> BufferId {
        self.id
    }

    fn timestamp(&self) -> Option<Timestamp> {
        Some(self.timestamp)
    }
}
