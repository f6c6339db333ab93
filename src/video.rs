// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Contracts consumed from the video capture collaborator.
//!
//! A [`VideoSource`] is configured and started once, yielding a
//! [`VideoStream`]. Frames are borrowed from the stream, which owns their
//! memory, and handed back with [`VideoStream::release_buffer`] so the
//! source can refill them. Releasing takes the frame by value, so a frame
//! can never be released twice.

use crate::{error::Result, image::Nv12Layout};
use std::{fmt, ptr::NonNull, slice::from_raw_parts};
use unix_ts::Timestamp;
use videostream::fourcc::FourCC;

/// Stream parameters requested from the video source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub subformat: FourCC,
    /// Number of physical buffers the source cycles through.
    pub buffer_count: usize,
}

impl StreamConfig {
    pub fn layout(&self) -> Nv12Layout {
        Nv12Layout::new(self.width, self.height)
    }
}

/// What the source actually delivers once started.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub subformat: FourCC,
    pub framerate: Option<f32>,
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "yuv in {}, {}x{}", self.subformat, self.width, self.height)?;
        match self.framerate {
            Some(fps) => write!(f, ", {fps} fps"),
            None => Ok(()),
        }
    }
}

/// Stable identity of one physical buffer in the source's ring.
pub type BufferId = u64;

/// A captured frame whose memory belongs to the video source.
///
/// # Safety
///
/// Implementors guarantee that [`VideoFrame::host_ptr`] points to at least
/// [`VideoFrame::size`] readable bytes, and that the region stays mapped at
/// the same address until the stream that produced the frame is dropped,
/// not merely until the frame is released. GPU memory objects wrapping the
/// region are kept across frames and rely on this.
pub unsafe trait VideoFrame {
    fn host_ptr(&self) -> NonNull<u8>;

    /// Bytes of image data in this buffer.
    fn size(&self) -> usize;

    fn sequence(&self) -> u32;

    /// Identity of the physical buffer, stable across reuse of the buffer.
    fn buffer_id(&self) -> BufferId;

    /// Whether this is the final sub-buffer of the frame. Replay and camera
    /// buffers always hold a whole frame, so neither overrides this.
    fn is_last_buffer(&self) -> bool {
        true
    }

    fn timestamp(&self) -> Option<Timestamp> {
        None
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { from_raw_parts(self.host_ptr().as_ptr(), self.size()) }
    }
}

/// A started stream handing out frames on demand.
pub trait VideoStream {
    type Frame<'a>: VideoFrame
    where
        Self: 'a;

    fn info(&self) -> StreamInfo;

    /// Blocks until the next frame is available.
    fn get_buffer(&self) -> Result<Self::Frame<'_>>;

    /// Returns the frame's buffer to the source for reuse.
    fn release_buffer<'a>(&'a self, frame: Self::Frame<'a>) -> Result<()>;

    /// Detaches from the source. Called once at teardown.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A video capture service that can be configured and started.
pub trait VideoSource {
    type Stream: VideoStream;

    fn start(self, config: &StreamConfig) -> Result<Self::Stream>;
}
