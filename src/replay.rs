// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! File-backed video source.
//!
//! Replays raw NV12 frames, concatenated with no header, from any reader.
//! Frames are loaded into a fixed ring of page-mapped buffers that behaves
//! like a capture service's buffer ring: a buffer handed out is not refilled
//! until it has been released, and the buffer addresses never change while
//! the stream is alive.

use crate::{
    error::{Error, Result},
    image::{MappedRegion, Nv12Layout, NV12},
    video::{BufferId, StreamConfig, StreamInfo, VideoFrame, VideoSource, VideoStream},
};
use std::{
    cell::{Cell, RefCell},
    fs::File,
    io::{self, Read},
    marker::PhantomData,
    path::Path,
    ptr::NonNull,
    slice::from_raw_parts_mut,
};
use tracing::{debug, info, warn};

pub struct ReplaySource {
    reader: Box<dyn Read>,
}

impl ReplaySource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| Error::Source {
            op: "open replay input",
            code: e.raw_os_error(),
            message: format!("{}: {e}", path.as_ref().display()),
            expected: false,
        })?;
        Ok(Self::from_reader(file))
    }

    pub fn from_reader(reader: impl Read + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }
}

impl VideoSource for ReplaySource {
    type Stream = ReplayStream;

    fn start(self, config: &StreamConfig) -> Result<ReplayStream> {
        if config.subformat != NV12 {
            return Err(Error::video(
                "start",
                format!("replay only supports {NV12}, not {}", config.subformat),
            ));
        }
        if config.buffer_count == 0 {
            return Err(Error::video("start", "buffer ring cannot be empty"));
        }

        let layout = config.layout();
        let slots = (0..config.buffer_count)
            .map(|_| MappedRegion::anonymous(layout.frame_size()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| Error::Source {
                op: "allocate replay buffers",
                code: e.raw_os_error(),
                message: e.to_string(),
                expected: false,
            })?;

        info!(
            "replay stream {} with {} buffers of {} bytes",
            layout,
            slots.len(),
            layout.frame_size()
        );

        Ok(ReplayStream {
            reader: RefCell::new(self.reader),
            in_use: RefCell::new(vec![false; slots.len()]),
            slots,
            layout,
            sequence: Cell::new(0),
            released: Cell::new(0),
        })
    }
}

pub struct ReplayStream {
    reader: RefCell<Box<dyn Read>>,
    in_use: RefCell<Vec<bool>>,
    slots: Vec<MappedRegion>,
    layout: Nv12Layout,
    sequence: Cell<u32>,
    released: Cell<u32>,
}

impl ReplayStream {
    /// Frames handed out so far.
    pub fn acquired(&self) -> u32 {
        self.sequence.get()
    }

    pub fn released(&self) -> u32 {
        self.released.get()
    }
}

impl VideoStream for ReplayStream {
    type Frame<'a> = ReplayFrame<'a>;

    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: self.layout.width,
            height: self.layout.height,
            subformat: NV12,
            framerate: None,
        }
    }

    fn get_buffer(&self) -> Result<ReplayFrame<'_>> {
        let sequence = self.sequence.get();
        let slot = sequence as usize % self.slots.len();
        if self.in_use.borrow()[slot] {
            return Err(Error::video(
                "get_buffer",
                format!("all {} buffers are held by the client", self.slots.len()),
            ));
        }

        let region = &self.slots[slot];
        let ptr = region.as_ptr();
        // The slot is not handed out, so nothing else references its bytes.
        let dst = unsafe { from_raw_parts_mut(ptr.as_ptr(), region.len()) };
        match self.reader.borrow_mut().read_exact(dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::interrupted(
                    "get_buffer",
                    format!("replay input ended after {sequence} frames"),
                ));
            }
            Err(e) => {
                return Err(Error::Source {
                    op: "get_buffer",
                    code: e.raw_os_error(),
                    message: e.to_string(),
                    expected: false,
                })
            }
        }

        self.in_use.borrow_mut()[slot] = true;
        self.sequence.set(sequence.wrapping_add(1));
        Ok(ReplayFrame {
            ptr,
            size: region.len(),
            slot,
            sequence,
            _stream: PhantomData,
        })
    }

    fn release_buffer<'a>(&'a self, frame: ReplayFrame<'a>) -> Result<()> {
        let mut in_use = self.in_use.borrow_mut();
        match in_use.get_mut(frame.slot) {
            Some(held) if *held => {
                *held = false;
                self.released.set(self.released.get() + 1);
                Ok(())
            }
            _ => Err(Error::video(
                "release_buffer",
                format!("buffer {} is not held", frame.slot),
            )),
        }
    }

    fn stop(&mut self) -> Result<()> {
        let held = self.in_use.borrow().iter().filter(|&&held| held).count();
        if held > 0 {
            warn!("replay stream stopped with {} buffers still held", held);
        }
        debug!(
            "replay stream stopped after {} frames, {} released",
            self.acquired(),
            self.released()
        );
        Ok(())
    }
}

/// A frame held in one of the replay ring's buffers.
#[derive(Debug)]
pub struct ReplayFrame<'a> {
    ptr: NonNull<u8>,
    size: usize,
    slot: usize,
    sequence: u32,
    _stream: PhantomData<&'a ReplayStream>,
}

// The ring buffers are mapped once in `start` and unmapped when the stream
// is dropped.
unsafe impl VideoFrame for ReplayFrame<'_> {
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
        self.slot as BufferId
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(buffer_count: usize) -> StreamConfig {
        StreamConfig {
            width: 16,
            height: 4,
            subformat: NV12,
            buffer_count,
        }
    }

    fn frames(count: usize) -> Vec<u8> {
        let size = Nv12Layout::new(16, 4).frame_size();
        (0..count).flat_map(|i| vec![i as u8; size]).collect()
    }

    #[test]
    fn frames_cycle_through_the_ring() {
        let stream = ReplaySource::from_reader(Cursor::new(frames(5)))
            .start(&config(3))
            .unwrap();

        let mut ids = Vec::new();
        for n in 0..5u32 {
            let frame = stream.get_buffer().unwrap();
            assert_eq!(frame.sequence(), n);
            assert_eq!(frame.size(), 96);
            assert!(frame.is_last_buffer());
            assert!(frame.as_bytes().iter().all(|&b| b == n as u8));
            ids.push(frame.buffer_id());
            stream.release_buffer(frame).unwrap();
        }
        assert_eq!(ids, vec![0, 1, 2, 0, 1]);
        assert_eq!(stream.acquired(), 5);
        assert_eq!(stream.released(), 5);
    }

    #[test]
    fn end_of_input_is_expected() {
        let stream = ReplaySource::from_reader(Cursor::new(frames(1)))
            .start(&config(2))
            .unwrap();
        let frame = stream.get_buffer().unwrap();
        stream.release_buffer(frame).unwrap();

        let err = stream.get_buffer().unwrap_err();
        assert!(err.is_expected());
    }

    #[test]
    fn exhausted_ring_is_an_error() {
        let stream = ReplaySource::from_reader(Cursor::new(frames(3)))
            .start(&config(2))
            .unwrap();
        let first = stream.get_buffer().unwrap();
        let second = stream.get_buffer().unwrap();

        let err = stream.get_buffer().unwrap_err();
        assert!(!err.is_expected());

        stream.release_buffer(first).unwrap();
        stream.release_buffer(second).unwrap();
    }

    #[test]
    fn rejects_other_formats() {
        let mut cfg = config(2);
        cfg.subformat = videostream::fourcc::FourCC(*b"Y800");
        assert!(ReplaySource::from_reader(Cursor::new(Vec::new()))
            .start(&cfg)
            .is_err());
    }
}
