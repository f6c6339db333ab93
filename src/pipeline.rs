// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame pipeline driver.
//!
//! One [`Pipeline`] owns everything a run needs: the started video stream,
//! the compute device with its program and kernel, the buffer registry, the
//! output buffer and the output sink. [`Pipeline::run`] processes frames
//! strictly in acquisition order, one at a time:
//!
//! 1. acquire a frame from the stream (blocking)
//! 2. in half-area mode, copy the frame into the output buffer so the
//!    unfiltered half keeps the source video
//! 3. resolve the frame's GPU memory object through the registry
//! 4. filter into the output buffer and wait for the device
//! 5. write one frame of output to the sink
//! 6. release the frame back to the stream
//!
//! Every acquired frame is released exactly once, including when a step
//! fails or the run is cancelled.

use crate::{
    error::{Error, Result},
    executor::FilterExecutor,
    gpu::ComputeDevice,
    image::{Nv12Layout, NV12},
    kernel::{KernelProgram, KernelVariant, RenderArea, EMBEDDED_SOURCE},
    output::{OutputBuffer, OutputMemory},
    registry::BufferRegistry,
    video::{StreamConfig, VideoFrame, VideoSource, VideoStream},
};
use std::{
    fmt,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{debug, info, info_span, warn};

/// Parameters of one bounded run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    /// Frames to process before stopping.
    pub frames: u32,
    /// Buffers in the video source's ring, and the registry's capacity.
    pub buffer_count: usize,
    pub variant: KernelVariant,
    pub area: RenderArea,
    pub kernel_source: String,
    pub output_memory: OutputMemory,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frames: 5,
            buffer_count: 3,
            variant: KernelVariant::Sobel3x3,
            area: RenderArea::Half,
            kernel_source: EMBEDDED_SOURCE.to_string(),
            output_memory: OutputMemory::Anonymous,
        }
    }
}

impl PipelineConfig {
    pub fn layout(&self) -> Nv12Layout {
        Nv12Layout::new(self.width, self.height)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            width: self.width,
            height: self.height,
            subformat: NV12,
            buffer_count: self.buffer_count,
        }
    }

    /// Rejects geometry the kernel cannot process.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.width % 16 != 0 {
            return Err(Error::Config(format!(
                "width {} must be a non-zero multiple of 16",
                self.width
            )));
        }
        if self.height < 4 || self.height % 2 != 0 {
            return Err(Error::Config(format!(
                "height {} must be even and at least 4",
                self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(Error::Config("buffer count must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Shared stop request, checked by the driver between pipeline stages.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// All requested frames were processed.
    Completed,
    /// The run was cancelled before all frames were processed.
    Cancelled,
    /// The video source ended the stream in an expected way.
    SourceInterrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StopReason::Completed => f.write_str("completed"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::SourceInterrupted => f.write_str("source interrupted"),
        }
    }
}

/// Summary of a run that ended without error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// Frames written to the sink.
    pub frames: u32,
    /// Bytes written to the sink.
    pub bytes: u64,
    pub stop: StopReason,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} frames, {} bytes, {}", self.frames, self.bytes, self.stop)
    }
}

/// Everything but the stream, so a frame borrowed from the stream can be
/// processed while the rest of the pipeline is mutably borrowed.
///
/// Fields drop in declaration order: the memory objects held by the
/// registry and the output buffer go first, then the kernel, the program
/// and finally the device.
struct FrameProcessor<D: ComputeDevice, W: Write> {
    registry: BufferRegistry<D::Memory>,
    output: OutputBuffer<D::Memory>,
    executor: FilterExecutor<D>,
    _program: KernelProgram<D>,
    device: D,
    sink: W,
    area: RenderArea,
}

impl<D: ComputeDevice, W: Write> FrameProcessor<D, W> {
    fn process<F: VideoFrame>(&mut self, frame: &F) -> Result<usize> {
        let layout = self.output.layout();
        let size = frame.size();
        if size > self.output.len() || size < layout.luma_size() {
            return Err(Error::FrameSize {
                size,
                expected: self.output.len(),
            });
        }

        let start = Instant::now();
        if self.area != RenderArea::Full {
            self.output.as_slice_mut()[..size].copy_from_slice(frame.as_bytes());
        }
        let input = self.registry.resolve(&self.device, frame, layout.luma_size())?;
        let prepared = Instant::now();

        self.executor.run(&self.device, input, &self.output)?;
        let filtered = Instant::now();

        self.sink
            .write_all(&self.output.as_slice()[..size])
            .map_err(Error::io("write frame"))?;
        let emitted = Instant::now();

        debug!(
            "prepare {:?} filter {:?} emit {:?}",
            prepared - start,
            filtered - prepared,
            emitted - filtered
        );
        Ok(size)
    }
}

/// A set-up run, ready to stream.
///
/// `core` is declared before `stream`, so every GPU object wrapping stream
/// memory is released before the stream unmaps it.
pub struct Pipeline<D: ComputeDevice, S: VideoStream, W: Write> {
    core: FrameProcessor<D, W>,
    stream: S,
    frames: u32,
}

impl<D: ComputeDevice, S: VideoStream, W: Write> Pipeline<D, S, W> {
    /// Validates `config`, builds the kernel, allocates the output buffer
    /// and starts `source`.
    ///
    /// The program is built before the source is started, so a compile
    /// failure never touches the video source or the sink.
    pub fn init<Src>(config: &PipelineConfig, device: D, source: Src, sink: W) -> Result<Self>
    where
        Src: VideoSource<Stream = S>,
    {
        config.validate()?;
        let layout = config.layout();

        for (label, value) in device.platform_info() {
            info!("platform {}: {}", label, value);
        }

        let program = KernelProgram::build(&device, &config.kernel_source)?;
        let kernel = program.create_kernel(&device, config.variant)?;
        let executor = FilterExecutor::new(kernel, config.variant, layout, config.area)?;
        let output = OutputBuffer::new(&device, layout, config.output_memory)?;

        let mut stream = source.start(&config.stream_config())?;
        let info = stream.info();
        info!("{}", info);
        if info.width != config.width || info.height != config.height || info.subformat != NV12 {
            if let Err(err) = stream.stop() {
                warn!("stop after geometry mismatch: {}", err);
            }
            return Err(Error::Config(format!(
                "source delivers {}x{} {} but the pipeline is set up for {}",
                info.width, info.height, info.subformat, layout
            )));
        }

        Ok(Self {
            core: FrameProcessor {
                registry: BufferRegistry::new(config.buffer_count),
                output,
                executor,
                _program: program,
                device,
                sink,
                area: config.area,
            },
            stream,
            frames: config.frames,
        })
    }

    pub fn device(&self) -> &D {
        &self.core.device
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn sink(&self) -> &W {
        &self.core.sink
    }

    /// Distinct source buffers wrapped for the device so far.
    pub fn mapped_buffers(&self) -> usize {
        self.core.registry.len()
    }

    /// Host view of the most recently filtered frame.
    pub fn output(&self) -> &[u8] {
        self.core.output.as_slice()
    }

    /// Processes frames until the configured count is reached, `cancel` is
    /// triggered or the source interrupts the stream.
    ///
    /// Source errors raised after cancellation was requested, and expected
    /// source interruptions, end the run cleanly. Prepare, filter and emit
    /// failures are returned even when cancelled.
    pub fn run(&mut self, cancel: &Cancellation) -> Result<RunReport> {
        let mut report = RunReport {
            frames: 0,
            bytes: 0,
            stop: StopReason::Completed,
        };

        while report.frames < self.frames {
            if cancel.is_cancelled() {
                report.stop = StopReason::Cancelled;
                break;
            }

            let acquired = Instant::now();
            let frame = match self.stream.get_buffer() {
                Ok(frame) => frame,
                Err(err) => {
                    report.stop = Self::stop_reason(err, cancel)?;
                    break;
                }
            };

            let span = info_span!("frame", sequence = frame.sequence());
            let _enter = span.enter();
            debug!("acquire {:?}", acquired.elapsed());

            if cancel.is_cancelled() {
                if let Err(err) = self.stream.release_buffer(frame) {
                    debug!("release after cancellation: {}", err);
                }
                report.stop = StopReason::Cancelled;
                break;
            }

            if frame.is_last_buffer() {
                debug!("frame {} size {}", frame.sequence(), frame.size());
            }

            let processed = self.core.process(&frame);
            let released = self.stream.release_buffer(frame);

            let size = match processed.and_then(|size| released.map(|()| size)) {
                Ok(size) => size,
                Err(err) => {
                    report.stop = Self::stop_reason(err, cancel)?;
                    break;
                }
            };
            report.frames += 1;
            report.bytes += size as u64;

            if let Some(client) = tracy_client::Client::running() {
                client.frame_mark();
            }
        }

        info!("run finished: {}", report);
        Ok(report)
    }

    /// Maps a loop error to a clean stop, or hands it back as a failure.
    fn stop_reason(err: Error, cancel: &Cancellation) -> Result<StopReason> {
        if cancel.is_cancelled() && matches!(err, Error::Source { .. }) {
            debug!("source error after cancellation: {}", err);
            Ok(StopReason::Cancelled)
        } else if err.is_expected() {
            warn!("{}", err);
            Ok(StopReason::SourceInterrupted)
        } else {
            Err(err)
        }
    }

    /// Flushes the sink, releases every GPU object and detaches from the
    /// source, in that order. Returns the sink.
    pub fn teardown(self) -> Result<W> {
        let Pipeline {
            core, mut stream, ..
        } = self;
        let FrameProcessor {
            registry,
            output,
            executor,
            _program,
            device,
            mut sink,
            ..
        } = core;

        let flushed = sink.flush().map_err(Error::io("flush output"));
        drop(registry);
        drop(output);
        drop(executor);
        drop(_program);
        drop(device);
        let stopped = stream.stop();
        drop(stream);
        debug!("pipeline torn down");

        flushed?;
        stopped?;
        Ok(sink)
    }
}

/// Sets up a pipeline, runs it to completion and tears it down.
///
/// Teardown happens on every path, including when the run fails.
pub fn run_pipeline<D, Src, W>(
    config: &PipelineConfig,
    device: D,
    source: Src,
    sink: W,
    cancel: &Cancellation,
) -> Result<RunReport>
where
    D: ComputeDevice,
    Src: VideoSource,
    W: Write,
{
    let mut pipeline = Pipeline::init(config, device, source, sink)?;
    let result = pipeline.run(cancel);
    let teardown = pipeline.teardown();
    let report = result?;
    teardown?;
    Ok(report)
}
