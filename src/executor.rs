// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Error, Result},
    gpu::{ComputeDevice, WorkGrid},
    image::Nv12Layout,
    kernel::{KernelVariant, RenderArea},
    output::OutputBuffer,
};
use tracing::{debug, instrument, warn};

/// Work-group shape used for every dispatch.
///
/// Global sizes must divide evenly by it on both axes, also when the stream
/// is rotated 90 or 270 degrees; uneven division produces wrong output on
/// some drivers rather than just slower execution.
pub const LOCAL_WORK_SIZE: [usize; 2] = [8, 4];

/// Rows start at 1: the first row is a border row and never filtered.
pub const GLOBAL_WORK_OFFSET: [usize; 2] = [1, 0];

const ARG_INPUT: u32 = 0;
const ARG_OUTPUT_LUMA: u32 = 1;
const ARG_OUTPUT_CHROMA: u32 = 2;
const ARG_WIDTH: u32 = 3;
const ARG_HEIGHT: u32 = 4;

impl WorkGrid {
    /// Grid covering `layout` in the given render area: one work item per
    /// row and column group.
    pub fn for_frame(layout: Nv12Layout, area: RenderArea) -> Result<Self> {
        let group = area.group_width();
        if layout.width as usize % group != 0 {
            return Err(Error::Config(format!(
                "width {} is not a multiple of {} for {} area",
                layout.width, group, area
            )));
        }

        let grid = WorkGrid {
            global: [layout.height as usize, layout.width as usize / group],
            local: LOCAL_WORK_SIZE,
            offset: GLOBAL_WORK_OFFSET,
        };
        if !grid.is_evenly_divided() {
            return Err(Error::Config(format!(
                "work grid {} does not divide by the local work size for {}",
                grid, layout
            )));
        }
        Ok(grid)
    }
}

/// Binds kernel arguments, dispatches the grid and waits for completion.
pub struct FilterExecutor<D: ComputeDevice> {
    kernel: D::Kernel,
    variant: KernelVariant,
    grid: WorkGrid,
    layout: Nv12Layout,
}

impl<D: ComputeDevice> FilterExecutor<D> {
    pub fn new(
        kernel: D::Kernel,
        variant: KernelVariant,
        layout: Nv12Layout,
        area: RenderArea,
    ) -> Result<Self> {
        let grid = WorkGrid::for_frame(layout, area)?;
        if WorkGrid::for_frame(layout.transposed(), area).is_err() {
            warn!(
                "{} area grid for {} would not divide evenly if the stream were rotated",
                area, layout
            );
        }
        debug!("{} dispatch {}", variant, grid);
        Ok(Self {
            kernel,
            variant,
            grid,
            layout,
        })
    }

    pub fn grid(&self) -> &WorkGrid {
        &self.grid
    }

    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    /// Filters the luma plane wrapped by `input` into `output`, blocking
    /// until the device reports completion.
    ///
    /// Any binding, dispatch or wait failure is reported as
    /// [`Error::KernelExecution`].
    #[instrument(skip_all, fields(kernel = %self.variant))]
    pub fn run(
        &mut self,
        device: &D,
        input: &D::Memory,
        output: &OutputBuffer<D::Memory>,
    ) -> Result<()> {
        if output.layout() != self.layout {
            return Err(Error::Config(format!(
                "output buffer is {} but the kernel was set up for {}",
                output.layout(),
                self.layout
            )));
        }

        device.set_arg_memory(&mut self.kernel, ARG_INPUT, input)?;
        device.set_arg_memory(&mut self.kernel, ARG_OUTPUT_LUMA, output.luma())?;
        device.set_arg_memory(&mut self.kernel, ARG_OUTPUT_CHROMA, output.chroma())?;
        device.set_arg_uint(&mut self.kernel, ARG_WIDTH, self.layout.width)?;
        device.set_arg_uint(&mut self.kernel, ARG_HEIGHT, self.layout.height)?;

        device.enqueue(&self.kernel, &self.grid)?;
        device.finish()
    }
}
