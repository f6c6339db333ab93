// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! OpenCL device: first platform, default device, one in-order queue.

use crate::{
    error::{Error, Result},
    gpu::{ComputeDevice, MemAccess, WorkGrid},
};
use opencl3::{
    command_queue::CommandQueue,
    context::Context,
    device::{Device, CL_DEVICE_TYPE_DEFAULT},
    error_codes::ClError,
    kernel::Kernel,
    memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_USE_HOST_PTR, CL_MEM_WRITE_ONLY},
    platform::{get_platforms, Platform},
    program::Program,
    types::{cl_mem, cl_uchar, cl_uint},
};
use std::{ffi::c_void, ptr::NonNull};
use tracing::{debug, info};

const CL_DEVICE_NOT_FOUND: i32 = -1;
const CL_BUILD_PROGRAM_FAILURE: i32 = -11;

fn setup_error(op: &'static str) -> impl FnOnce(ClError) -> Error {
    move |err| Error::GpuSetup {
        op,
        code: err.0,
        log: None,
    }
}

fn kernel_error(op: &'static str) -> impl FnOnce(ClError) -> Error {
    move |err| Error::KernelExecution { op, code: err.0 }
}

/// Fields drop in declaration order: the queue is released before the
/// context it was created on.
pub struct OpenClDevice {
    queue: CommandQueue,
    context: Context,
    device: Device,
    platform: Platform,
}

impl OpenClDevice {
    /// Selects the first platform and its default device.
    pub fn new() -> Result<Self> {
        let platform = get_platforms()
            .map_err(setup_error("get platform ids"))?
            .into_iter()
            .next()
            .ok_or(Error::GpuSetup {
                op: "get platform ids",
                code: CL_DEVICE_NOT_FOUND,
                log: None,
            })?;
        let device_id = platform
            .get_devices(CL_DEVICE_TYPE_DEFAULT)
            .map_err(setup_error("get device ids"))?
            .into_iter()
            .next()
            .ok_or(Error::GpuSetup {
                op: "get device ids",
                code: CL_DEVICE_NOT_FOUND,
                log: None,
            })?;
        let device = Device::new(device_id);
        let context = Context::from_device(&device).map_err(setup_error("create context"))?;

        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, 0)
            .map_err(setup_error("create command queue"))?;

        info!(
            "opencl device {} ({})",
            device.name().unwrap_or_default(),
            device.version().unwrap_or_default()
        );
        Ok(Self {
            queue,
            context,
            device,
            platform,
        })
    }

    pub fn device_name(&self) -> String {
        self.device.name().unwrap_or_default()
    }
}

pub struct OpenClMemory {
    buffer: Buffer<cl_uchar>,
    len: usize,
}

impl OpenClMemory {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ComputeDevice for OpenClDevice {
    type Program = Program;
    type Kernel = Kernel;
    type Memory = OpenClMemory;

    fn platform_info(&self) -> Vec<(&'static str, String)> {
        let p = &self.platform;
        vec![
            ("profile", p.profile().unwrap_or_default()),
            ("version", p.version().unwrap_or_default()),
            ("name", p.name().unwrap_or_default()),
            ("vendor", p.vendor().unwrap_or_default()),
            ("extensions", p.extensions().unwrap_or_default()),
        ]
    }

    fn build_program(&self, source: &str, options: &str) -> Result<Program> {
        Program::create_and_build_from_source(&self.context, source, options).map_err(|log| {
            Error::GpuSetup {
                op: "build_program",
                code: CL_BUILD_PROGRAM_FAILURE,
                log: Some(log),
            }
        })
    }

    fn create_kernel(&self, program: &Program, entry_point: &str) -> Result<Kernel> {
        Kernel::create(program, entry_point).map_err(setup_error("create_kernel"))
    }

    unsafe fn wrap_host_memory(
        &self,
        host: NonNull<u8>,
        len: usize,
        access: MemAccess,
    ) -> Result<OpenClMemory> {
        let flags = match access {
            MemAccess::ReadOnly => CL_MEM_READ_ONLY,
            MemAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        } | CL_MEM_USE_HOST_PTR;
        let host_ptr = host.as_ptr().cast::<c_void>();
        let buffer = Buffer::<cl_uchar>::create(&self.context, flags, len, host_ptr).map_err(
            |err| Error::GpuAllocation {
                op: "create buffer",
                size: len,
                code: err.0,
            },
        )?;
        debug!("wrapped {} host bytes at {:p} as {} buffer", len, host, access);
        Ok(OpenClMemory { buffer, len })
    }

    fn set_arg_memory(&self, kernel: &mut Kernel, index: u32, memory: &OpenClMemory) -> Result<()> {
        let mem: cl_mem = memory.buffer.get();
        unsafe { kernel.set_arg(index as cl_uint, &mem) }.map_err(kernel_error("set_arg"))
    }

    fn set_arg_uint(&self, kernel: &mut Kernel, index: u32, value: u32) -> Result<()> {
        let value = value as cl_uint;
        unsafe { kernel.set_arg(index as cl_uint, &value) }.map_err(kernel_error("set_arg"))
    }

    fn enqueue(&self, kernel: &Kernel, grid: &WorkGrid) -> Result<()> {
        unsafe {
            self.queue.enqueue_nd_range_kernel(
                kernel.get(),
                2,
                grid.offset.as_ptr(),
                grid.global.as_ptr(),
                grid.local.as_ptr(),
                &[],
            )
        }
        .map(|_event| ())
        .map_err(kernel_error("enqueue"))
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish().map_err(kernel_error("finish"))
    }
}
