// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::{Args, Backend};
use clap::Parser;
use std::{error::Error as _, fs::File, process::ExitCode};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};
use vdo_cl_filter::{
    camera::CameraSource,
    gpu::ComputeDevice,
    kernel::{load_source, EMBEDDED_SOURCE},
    pipeline::{run_pipeline, Cancellation, PipelineConfig, RunReport},
    replay::ReplaySource,
    software::SoftwareDevice,
    Error, Result,
};

fn init_logging(args: &Args) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let level = args.log_level();
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(level);

    // journald is not reachable everywhere, e.g. inside containers.
    let journald = tracing_journald::layer()
        .ok()
        .map(|layer| layer.with_filter(level));

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(level))
    } else {
        None
    };

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn pipeline_config(args: &Args) -> Result<PipelineConfig> {
    let kernel_source = match &args.kernel_source {
        Some(path) => load_source(path)?,
        None => EMBEDDED_SOURCE.to_string(),
    };
    Ok(PipelineConfig {
        width: args.width(),
        height: args.height(),
        frames: args.frames,
        buffer_count: args.buffer_count,
        variant: args.kernel,
        area: args.area,
        kernel_source,
        output_memory: args.output_memory,
    })
}

fn run_with<D: ComputeDevice>(
    args: &Args,
    config: &PipelineConfig,
    device: D,
    cancel: &Cancellation,
) -> Result<RunReport> {
    let output = File::create(&args.output).map_err(Error::io("open output"))?;
    info!("writing filtered frames to {}", args.output.display());

    match &args.input {
        Some(path) => run_pipeline(config, device, ReplaySource::open(path)?, output, cancel),
        None => {
            let camera = CameraSource::new(&args.camera, args.mirror.into());
            run_pipeline(config, device, camera, output, cancel)
        }
    }
}

fn run(args: &Args, cancel: &Cancellation) -> Result<RunReport> {
    let config = pipeline_config(args)?;

    match args.backend {
        Backend::Software => run_with(args, &config, SoftwareDevice::new(), cancel),
        #[cfg(feature = "opencl")]
        Backend::Opencl => {
            let device = vdo_cl_filter::opencl::OpenClDevice::new()?;
            run_with(args, &config, device, cancel)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_logging(&args) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let cancel = Cancellation::new();
    let handler = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler.cancel()) {
        warn!("could not install interrupt handler: {}", err);
    }

    match run(&args, &cancel) {
        Ok(report) => {
            info!("done: {}", report);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{} (error {})", err, err.error_code());
            if let Some(source) = err.source() {
                error!("caused by: {}", source);
            }
            ExitCode::FAILURE
        }
    }
}
