// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{
    cell::{Cell, RefCell},
    error::Error,
    io::{self, Cursor, Write},
    marker::PhantomData,
    ptr::NonNull,
    rc::Rc,
};
use vdo_cl_filter::{
    image::{MappedRegion, Nv12Layout, CHROMA_NEUTRAL, NV12},
    kernel::{KernelVariant, RenderArea},
    pipeline::{Cancellation, Pipeline, PipelineConfig, StopReason},
    replay::ReplaySource,
    software::{sobel_magnitude, SoftwareDevice},
    video::{BufferId, StreamConfig, StreamInfo, VideoFrame, VideoSource, VideoStream},
    Error as FilterError,
};

/// Luma test pattern with edges in both directions; chroma bytes are a
/// value the kernel never writes.
fn fill_frame(dst: &mut [u8], layout: Nv12Layout, n: u32) {
    let (w, h) = (layout.width as usize, layout.height as usize);
    for y in 0..h {
        for x in 0..w {
            dst[y * w + x] = ((x * 7 + y * 13 + n as usize * 31) % 251) as u8;
        }
    }
    dst[w * h..].fill(77);
}

#[derive(Default)]
struct Counters {
    started: Cell<bool>,
    stopped: Cell<bool>,
    acquired: Cell<u32>,
    released: Cell<u32>,
}

/// Video source serving a fixed number of generated frames.
struct ScriptedSource {
    counters: Rc<Counters>,
    available: u32,
    /// Distinct buffers cycled through, defaults to the configured ring.
    ring: Option<usize>,
    /// Cancel this token and fail the read once the frames run out,
    /// like a blocking read interrupted by a signal.
    interrupt: Option<Cancellation>,
    /// Cancel this token while handing out this frame, counting from 0.
    cancel_on: Option<(u32, Cancellation)>,
    /// Width reported by the started stream instead of the configured one.
    reported_width: Option<u32>,
}

impl ScriptedSource {
    fn new(available: u32) -> (Self, Rc<Counters>) {
        let counters = Rc::new(Counters::default());
        let source = Self {
            counters: counters.clone(),
            available,
            ring: None,
            interrupt: None,
            cancel_on: None,
            reported_width: None,
        };
        (source, counters)
    }
}

struct ScriptedStream {
    slots: Vec<MappedRegion>,
    layout: Nv12Layout,
    counters: Rc<Counters>,
    available: u32,
    interrupt: Option<Cancellation>,
    cancel_on: Option<(u32, Cancellation)>,
    reported_width: Option<u32>,
}

impl VideoSource for ScriptedSource {
    type Stream = ScriptedStream;

    fn start(self, config: &StreamConfig) -> vdo_cl_filter::Result<ScriptedStream> {
        let layout = config.layout();
        let slots = (0..self.ring.unwrap_or(config.buffer_count))
            .map(|_| MappedRegion::anonymous(layout.frame_size()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| FilterError::video("start", e))?;
        self.counters.started.set(true);
        Ok(ScriptedStream {
            slots,
            layout,
            counters: self.counters,
            available: self.available,
            interrupt: self.interrupt,
            cancel_on: self.cancel_on,
            reported_width: self.reported_width,
        })
    }
}

struct ScriptedFrame<'a> {
    ptr: NonNull<u8>,
    size: usize,
    slot: usize,
    sequence: u32,
    _stream: PhantomData<&'a ScriptedStream>,
}

unsafe impl VideoFrame for ScriptedFrame<'_> {
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

impl VideoStream for ScriptedStream {
    type Frame<'a> = ScriptedFrame<'a>;

    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: self.reported_width.unwrap_or(self.layout.width),
            height: self.layout.height,
            subformat: NV12,
            framerate: Some(30.0),
        }
    }

    fn get_buffer(&self) -> vdo_cl_filter::Result<ScriptedFrame<'_>> {
        let sequence = self.counters.acquired.get();
        if sequence >= self.available {
            return Err(match &self.interrupt {
                Some(cancel) => {
                    cancel.cancel();
                    FilterError::video("get_buffer", "interrupted system call")
                }
                None => FilterError::interrupted("get_buffer", "service restarting"),
            });
        }

        let slot = sequence as usize % self.slots.len();
        let region = &self.slots[slot];
        let dst = unsafe { std::slice::from_raw_parts_mut(region.as_ptr().as_ptr(), region.len()) };
        fill_frame(dst, self.layout, sequence);

        self.counters.acquired.set(sequence + 1);
        if let Some((n, cancel)) = &self.cancel_on {
            if *n == sequence {
                cancel.cancel();
            }
        }
        Ok(ScriptedFrame {
            ptr: region.as_ptr(),
            size: region.len(),
            slot,
            sequence,
            _stream: PhantomData,
        })
    }

    fn release_buffer<'a>(&'a self, _frame: ScriptedFrame<'a>) -> vdo_cl_filter::Result<()> {
        self.counters.released.set(self.counters.released.get() + 1);
        Ok(())
    }

    fn stop(&mut self) -> vdo_cl_filter::Result<()> {
        self.counters.stopped.set(true);
        Ok(())
    }
}

#[derive(Default)]
struct SinkLog {
    writes: u32,
    bytes: usize,
    last: Vec<u8>,
    flushed: bool,
}

/// Output sink recording every write.
struct CountingSink {
    log: Rc<RefCell<SinkLog>>,
    /// Cancel this token once this many frames were written.
    cancel_after: Option<(u32, Cancellation)>,
    /// Fail the write of this frame, counting from 1.
    fail_on: Option<u32>,
    /// Accept half of this frame, cancel the token, then fail every write.
    torn_on: Option<(u32, Cancellation)>,
    torn: bool,
}

impl CountingSink {
    fn new() -> (Self, Rc<RefCell<SinkLog>>) {
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let sink = Self {
            log: log.clone(),
            cancel_after: None,
            fail_on: None,
            torn_on: None,
            torn: false,
        };
        (sink, log)
    }
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut log = self.log.borrow_mut();
        if self.torn || self.fail_on == Some(log.writes + 1) {
            return Err(io::Error::other("disk full"));
        }
        if let Some((n, cancel)) = &self.torn_on {
            if *n == log.writes + 1 {
                self.torn = true;
                cancel.cancel();
                log.bytes += buf.len() / 2;
                return Ok(buf.len() / 2);
            }
        }
        log.writes += 1;
        log.bytes += buf.len();
        log.last = buf.to_vec();
        if let Some((after, cancel)) = &self.cancel_after {
            if log.writes == *after {
                cancel.cancel();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.log.borrow_mut().flushed = true;
        Ok(())
    }
}

fn small_config(area: RenderArea, variant: KernelVariant) -> PipelineConfig {
    PipelineConfig {
        width: 64,
        height: 16,
        frames: 3,
        area,
        variant,
        ..Default::default()
    }
}

#[test]
fn test_half_area_720p() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig::default();
    let (source, counters) = ScriptedSource::new(10);
    let (sink, log) = CountingSink::new();

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let report = pipeline.run(&Cancellation::new())?;
    assert!(pipeline.mapped_buffers() <= 3);
    assert_eq!(pipeline.device().completed(), 5);
    pipeline.teardown()?;

    let frame = 1280 * 720 + 1280 * 720 / 2;
    assert_eq!(report.frames, 5);
    assert_eq!(report.bytes, 5 * frame as u64);
    assert_eq!(report.stop, StopReason::Completed);

    let log = log.borrow();
    assert_eq!(log.writes, 5);
    assert_eq!(log.bytes, 5 * frame);
    assert!(log.flushed);
    assert_eq!(counters.acquired.get(), 5);
    assert_eq!(counters.released.get(), 5);
    assert!(counters.stopped.get());

    Ok(())
}

#[test]
fn test_zero_frames() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig {
        frames: 0,
        ..small_config(RenderArea::Full, KernelVariant::Sobel3x3)
    };
    let (source, counters) = ScriptedSource::new(10);
    let (sink, log) = CountingSink::new();

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let report = pipeline.run(&Cancellation::new())?;
    pipeline.teardown()?;

    assert_eq!(report.frames, 0);
    assert_eq!(log.borrow().writes, 0);
    assert_eq!(counters.acquired.get(), 0);
    Ok(())
}

#[test]
fn test_compile_failure() {
    let config = PipelineConfig {
        kernel_source: "kernel void sobel_3x3(global const uchar *in_y { }".to_string(),
        ..PipelineConfig::default()
    };
    let (source, counters) = ScriptedSource::new(5);
    let (sink, log) = CountingSink::new();

    let err = match Pipeline::init(&config, SoftwareDevice::new(), source, sink) {
        Ok(_) => panic!("malformed kernel source was accepted"),
        Err(err) => err,
    };
    assert!(matches!(err, FilterError::GpuSetup { .. }));
    assert!(err.build_log().is_some());
    assert!(!err.is_expected());

    assert!(!counters.started.get());
    assert_eq!(counters.acquired.get(), 0);
    assert_eq!(log.borrow().bytes, 0);
}

#[test]
fn test_missing_entry_point() {
    let config = PipelineConfig {
        kernel_source: "kernel void sobel_3x3() {}".to_string(),
        variant: KernelVariant::Sobel3x1,
        ..PipelineConfig::default()
    };
    let (source, counters) = ScriptedSource::new(5);
    let (sink, _log) = CountingSink::new();

    let result = Pipeline::init(&config, SoftwareDevice::new(), source, sink);
    assert!(matches!(result, Err(FilterError::GpuSetup { .. })));
    assert!(!counters.started.get());
}

#[test]
fn test_cancel_after_third_frame() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig::default();
    let cancel = Cancellation::new();
    let (source, counters) = ScriptedSource::new(5);
    let (mut sink, log) = CountingSink::new();
    sink.cancel_after = Some((3, cancel.clone()));

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let report = pipeline.run(&cancel)?;
    assert_eq!(pipeline.device().pending(), 0);
    pipeline.teardown()?;

    assert_eq!(report.frames, 3);
    assert_eq!(report.stop, StopReason::Cancelled);
    assert_eq!(log.borrow().writes, 3);
    assert_eq!(log.borrow().bytes, 3 * 1382400);
    assert_eq!(counters.acquired.get(), counters.released.get());
    assert!(counters.stopped.get());

    Ok(())
}

#[test]
fn test_error_after_cancel_is_clean() -> Result<(), Box<dyn Error>> {
    let config = small_config(RenderArea::Full, KernelVariant::Sobel3x3);
    let cancel = Cancellation::new();
    let (mut source, counters) = ScriptedSource::new(2);
    source.interrupt = Some(cancel.clone());
    let (sink, _log) = CountingSink::new();

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let report = pipeline.run(&cancel)?;
    pipeline.teardown()?;

    assert_eq!(report.frames, 2);
    assert_eq!(report.stop, StopReason::Cancelled);
    assert_eq!(counters.released.get(), 2);
    Ok(())
}

#[test]
fn test_cancel_after_acquire() -> Result<(), Box<dyn Error>> {
    let config = small_config(RenderArea::Full, KernelVariant::Sobel3x3);
    let cancel = Cancellation::new();
    let (mut source, counters) = ScriptedSource::new(5);
    source.cancel_on = Some((2, cancel.clone()));
    let (sink, log) = CountingSink::new();

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let report = pipeline.run(&cancel)?;
    assert_eq!(pipeline.device().completed(), 2);
    pipeline.teardown()?;

    assert_eq!(report.frames, 2);
    assert_eq!(report.stop, StopReason::Cancelled);
    assert_eq!(log.borrow().writes, 2);
    assert_eq!(counters.acquired.get(), 3);
    assert_eq!(counters.released.get(), 3);
    Ok(())
}

#[test]
fn test_write_error_after_cancel_fails() -> Result<(), Box<dyn Error>> {
    let config = small_config(RenderArea::Full, KernelVariant::Sobel3x3);
    let frame = config.layout().frame_size();
    let cancel = Cancellation::new();
    let (source, counters) = ScriptedSource::new(5);
    let (mut sink, log) = CountingSink::new();
    sink.torn_on = Some((2, cancel.clone()));

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let err = pipeline.run(&cancel).unwrap_err();
    assert!(matches!(err, FilterError::Io { op: "write frame", .. }));
    assert!(!err.is_expected());
    pipeline.teardown()?;

    assert!(cancel.is_cancelled());
    assert_eq!(log.borrow().writes, 1);
    assert_eq!(log.borrow().bytes, frame + frame / 2);
    assert_eq!(counters.acquired.get(), 2);
    assert_eq!(counters.released.get(), 2);
    Ok(())
}

#[test]
fn test_geometry_mismatch_stops_source() {
    let config = small_config(RenderArea::Full, KernelVariant::Sobel3x3);
    let (mut source, counters) = ScriptedSource::new(5);
    source.reported_width = Some(32);
    let (sink, _log) = CountingSink::new();

    let result = Pipeline::init(&config, SoftwareDevice::new(), source, sink);
    assert!(matches!(result, Err(FilterError::Config(_))));
    assert!(counters.started.get());
    assert!(counters.stopped.get());
    assert_eq!(counters.acquired.get(), 0);
}

#[test]
fn test_expected_interruption() -> Result<(), Box<dyn Error>> {
    let config = small_config(RenderArea::Half, KernelVariant::Sobel3x1);
    let (source, counters) = ScriptedSource::new(2);
    let (sink, log) = CountingSink::new();

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let report = pipeline.run(&Cancellation::new())?;
    pipeline.teardown()?;

    assert_eq!(report.frames, 2);
    assert_eq!(report.stop, StopReason::SourceInterrupted);
    assert_eq!(log.borrow().writes, 2);
    assert_eq!(counters.acquired.get(), 2);
    assert_eq!(counters.released.get(), 2);
    Ok(())
}

#[test]
fn test_write_error_releases_frame() -> Result<(), Box<dyn Error>> {
    let config = small_config(RenderArea::Full, KernelVariant::Sobel3x3);
    let (source, counters) = ScriptedSource::new(10);
    let (mut sink, log) = CountingSink::new();
    sink.fail_on = Some(2);

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let err = pipeline.run(&Cancellation::new()).unwrap_err();
    assert!(matches!(err, FilterError::Io { op: "write frame", .. }));
    pipeline.teardown()?;

    assert_eq!(log.borrow().writes, 1);
    assert_eq!(counters.acquired.get(), 2);
    assert_eq!(counters.released.get(), 2);
    assert!(counters.stopped.get());
    Ok(())
}

#[test]
fn test_buffer_churn_is_fatal() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig {
        frames: 6,
        ..small_config(RenderArea::Full, KernelVariant::Sobel3x3)
    };
    let (mut source, counters) = ScriptedSource::new(10);
    source.ring = Some(4);
    let (sink, log) = CountingSink::new();

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    let err = pipeline.run(&Cancellation::new()).unwrap_err();
    assert!(matches!(err, FilterError::TooManyBuffers { capacity: 3 }));
    assert_eq!(pipeline.mapped_buffers(), 3);
    pipeline.teardown()?;

    assert_eq!(log.borrow().writes, 3);
    assert_eq!(counters.acquired.get(), 4);
    assert_eq!(counters.released.get(), 4);
    Ok(())
}

#[test]
fn test_full_area_output() -> Result<(), Box<dyn Error>> {
    for variant in [KernelVariant::Sobel3x3, KernelVariant::Sobel3x1] {
        let config = small_config(RenderArea::Full, variant);
        let layout = config.layout();
        let (w, h) = (64, 16);
        let (source, _counters) = ScriptedSource::new(3);
        let (sink, log) = CountingSink::new();

        let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
        pipeline.run(&Cancellation::new())?;
        pipeline.teardown()?;

        let mut input = vec![0u8; layout.frame_size()];
        fill_frame(&mut input, layout, 2);
        let log = log.borrow();
        let (luma, chroma) = log.last.split_at(layout.luma_size());

        assert!(chroma.iter().all(|&c| c == CHROMA_NEUTRAL));
        for y in 0..h {
            for x in 0..w {
                let out = luma[y * w + x];
                if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
                    assert_eq!(out, 0, "{variant} border pixel {x},{y} was written");
                } else {
                    let expected = sobel_magnitude(&input, w, x, y, variant);
                    assert_eq!(out, expected, "{variant} at {x},{y}");
                }
            }
        }
    }
    Ok(())
}

#[test]
fn test_half_area_keeps_source() -> Result<(), Box<dyn Error>> {
    let config = small_config(RenderArea::Half, KernelVariant::Sobel3x3);
    let layout = config.layout();
    let (w, h) = (64, 16);
    let (source, _counters) = ScriptedSource::new(3);
    let (sink, log) = CountingSink::new();

    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, sink)?;
    pipeline.run(&Cancellation::new())?;
    pipeline.teardown()?;

    let mut input = vec![0u8; layout.frame_size()];
    fill_frame(&mut input, layout, 2);
    let log = log.borrow();
    let (luma, chroma) = log.last.split_at(layout.luma_size());

    assert!(chroma.iter().all(|&c| c == CHROMA_NEUTRAL));
    for y in 0..h {
        for x in 0..w {
            let filtered = x >= 1 && x < w / 2 && y >= 1 && y < h - 1;
            let expected = if filtered {
                sobel_magnitude(&input, w, x, y, KernelVariant::Sobel3x3)
            } else {
                input[y * w + x]
            };
            assert_eq!(luma[y * w + x], expected, "pixel {x},{y}");
        }
    }
    Ok(())
}

#[test]
fn test_replay_end_to_end() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig {
        frames: 10,
        ..small_config(RenderArea::Full, KernelVariant::Sobel3x3)
    };
    let layout = config.layout();
    let mut recording = vec![0u8; 4 * layout.frame_size()];
    for (n, frame) in recording.chunks_mut(layout.frame_size()).enumerate() {
        fill_frame(frame, layout, n as u32);
    }

    let source = ReplaySource::from_reader(Cursor::new(recording));
    let mut pipeline = Pipeline::init(&config, SoftwareDevice::new(), source, Vec::new())?;
    let report = pipeline.run(&Cancellation::new())?;
    assert_eq!(pipeline.stream().acquired(), 4);
    assert_eq!(pipeline.stream().released(), 4);
    let output = pipeline.teardown()?;

    assert_eq!(report.frames, 4);
    assert_eq!(report.stop, StopReason::SourceInterrupted);
    assert_eq!(output.len(), 4 * layout.frame_size());
    Ok(())
}

#[test]
fn test_geometry_validation() {
    let config = small_config(RenderArea::Full, KernelVariant::Sobel3x3);
    let source = ReplaySource::from_reader(Cursor::new(Vec::new()));
    let other = PipelineConfig {
        width: 32,
        ..config.clone()
    };
    assert!(Pipeline::init(&other, SoftwareDevice::new(), source, Vec::new()).is_ok());

    let config = PipelineConfig {
        width: 1000,
        ..config
    };
    let source = ReplaySource::from_reader(Cursor::new(Vec::new()));
    assert!(matches!(
        Pipeline::init(&config, SoftwareDevice::new(), source, Vec::new()),
        Err(FilterError::Config(_))
    ));
}
