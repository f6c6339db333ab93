// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! CPU reference device.
//!
//! Runs the two Sobel entry points of `kernels/sobel_nv12.cl` on the host
//! with the same NDRange semantics as the GPU: global offset, one eight
//! pixel column group per work item, chroma fill sized by the grid width.
//! Work is queued by [`ComputeDevice::enqueue`] and only executed by
//! [`ComputeDevice::finish`], so output memory is not valid before the
//! completion wait, as on a real device.
//!
//! Status codes mirror the OpenCL ones so logs read the same for both
//! devices.

use crate::{
    error::{Error, Result},
    gpu::{ComputeDevice, MemAccess, WorkGrid},
    image::CHROMA_NEUTRAL,
    kernel::KernelVariant,
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    ops::Range,
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{debug, warn};

const CL_BUILD_PROGRAM_FAILURE: i32 = -11;
const CL_INVALID_VALUE: i32 = -30;
const CL_INVALID_MEM_OBJECT: i32 = -38;
const CL_INVALID_KERNEL_NAME: i32 = -46;
const CL_INVALID_ARG_INDEX: i32 = -49;
const CL_INVALID_KERNEL_ARGS: i32 = -52;
const CL_INVALID_WORK_GROUP_SIZE: i32 = -54;
const CL_INVALID_BUFFER_SIZE: i32 = -61;

/// Columns filtered by one work item.
const GROUP: usize = 8;

const ARG_COUNT: usize = 5;

/// Sobel gradient magnitude of the luma pixel at (`x`, `y`), clamped to
/// `[1, 255]`. The pixel must not lie on the frame border.
pub fn sobel_magnitude(
    luma: &[u8],
    width: usize,
    x: usize,
    y: usize,
    variant: KernelVariant,
) -> u8 {
    let i = y * width + x;
    let px = |j: usize| luma[j] as i32;
    let (ul, uc, ur) = (px(i - width - 1), px(i - width), px(i - width + 1));
    let (ml, mr) = (px(i - 1), px(i + 1));
    let (dl, dc, dr) = (px(i + width - 1), px(i + width), px(i + width + 1));

    let gx = match variant {
        KernelVariant::Sobel3x3 => (ur + 2 * mr + dr) - (ul + 2 * ml + dl),
        KernelVariant::Sobel3x1 => (ur + dr) - (ul + dl),
    };
    let gy = (dl + 2 * dc + dr) - (ul + 2 * uc + ur);
    (gx.abs() + gy.abs()).clamp(1, 255) as u8
}

#[derive(Default)]
pub struct SoftwareDevice {
    next_id: Cell<u64>,
    queue: RefCell<Vec<Job>>,
    completed: Cell<u64>,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel launches executed so far.
    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    /// Kernel launches queued but not yet executed.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        let pending = self.queue.get_mut().len();
        if pending > 0 {
            warn!("software device dropped with {} queued launches", pending);
        }
    }
}

/// Entry points found in a successfully built source.
#[derive(Debug)]
pub struct SoftwareProgram {
    entry_points: BTreeSet<String>,
}

impl SoftwareProgram {
    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.entry_points.iter().map(String::as_str)
    }
}

#[derive(Copy, Clone, Debug)]
struct MemRef {
    ptr: NonNull<u8>,
    len: usize,
    access: MemAccess,
}

impl MemRef {
    fn range(&self) -> Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.len
    }
}

#[derive(Copy, Clone, Debug)]
enum KernelArg {
    Memory(MemRef),
    Uint(u32),
}

#[derive(Debug)]
pub struct SoftwareKernel {
    variant: KernelVariant,
    args: [Option<KernelArg>; ARG_COUNT],
}

/// Host memory wrapped for kernel access.
#[derive(Debug)]
pub struct SoftwareMemory {
    id: u64,
    mem: MemRef,
}

impl SoftwareMemory {
    /// Identity of this memory object, unique per device.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host_ptr(&self) -> NonNull<u8> {
        self.mem.ptr
    }

    pub fn len(&self) -> usize {
        self.mem.len
    }

    pub fn is_empty(&self) -> bool {
        self.mem.len == 0
    }

    pub fn access(&self) -> MemAccess {
        self.mem.access
    }
}

struct Job {
    variant: KernelVariant,
    input: MemRef,
    out_y: MemRef,
    out_cbcr: MemRef,
    width: usize,
    height: usize,
    grid: WorkGrid,
}

fn kernel_error(op: &'static str, code: i32) -> Error {
    Error::KernelExecution { op, code }
}

/// Removes block and line comments so braces inside them are not counted.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |end| &after[end + 2..]);
            out.push(' ');
        } else if let Some(after) = rest.strip_prefix("//") {
            rest = after.find('\n').map_or("", |end| &after[end..]);
        } else {
            let ch = rest.chars().next().unwrap_or_default();
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }
    out
}

fn check_balanced(source: &str) -> std::result::Result<(), String> {
    let mut stack = Vec::new();
    for (line, text) in source.lines().enumerate() {
        for ch in text.chars() {
            match ch {
                '{' | '(' | '[' => stack.push((ch, line + 1)),
                '}' | ')' | ']' => {
                    let open = match ch {
                        '}' => '{',
                        ')' => '(',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((c, _)) if c == open => {}
                        _ => {
                            return Err(format!(
                                "<source>:{}: error: unexpected '{}'",
                                line + 1,
                                ch
                            ))
                        }
                    }
                }
                _ => {}
            }
        }
    }
    match stack.pop() {
        Some((ch, line)) => Err(format!("<source>:{line}: error: unmatched '{ch}'")),
        None => Ok(()),
    }
}

fn find_entry_points(source: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut rest = source;
    while let Some(pos) = rest.find("kernel void ") {
        let after = &rest[pos + "kernel void ".len()..];
        let name: String = after
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        let prefix_ok = pos == 0 || !rest.as_bytes()[pos - 1].is_ascii_alphanumeric();
        if prefix_ok && !name.is_empty() {
            found.insert(name);
        }
        rest = after;
    }
    found
}

impl ComputeDevice for SoftwareDevice {
    type Program = SoftwareProgram;
    type Kernel = SoftwareKernel;
    type Memory = SoftwareMemory;

    fn platform_info(&self) -> Vec<(&'static str, String)> {
        vec![
            ("profile", "FULL_PROFILE".to_string()),
            ("version", "host reference".to_string()),
            ("name", "software".to_string()),
            ("vendor", env!("CARGO_PKG_NAME").to_string()),
            ("extensions", String::new()),
        ]
    }

    fn build_program(&self, source: &str, _options: &str) -> Result<SoftwareProgram> {
        let code = strip_comments(source);
        let build_error = |log: String| Error::GpuSetup {
            op: "build_program",
            code: CL_BUILD_PROGRAM_FAILURE,
            log: Some(log),
        };

        check_balanced(&code).map_err(build_error)?;
        let entry_points = find_entry_points(&code);
        if entry_points.is_empty() {
            return Err(build_error(
                "<source>: error: no kernel functions declared".to_string(),
            ));
        }
        debug!("built software program with entry points {:?}", entry_points);
        Ok(SoftwareProgram { entry_points })
    }

    fn create_kernel(
        &self,
        program: &SoftwareProgram,
        entry_point: &str,
    ) -> Result<SoftwareKernel> {
        let variant = KernelVariant::from_entry_point(entry_point)
            .filter(|_| program.entry_points.contains(entry_point))
            .ok_or(Error::GpuSetup {
                op: "create_kernel",
                code: CL_INVALID_KERNEL_NAME,
                log: None,
            })?;
        Ok(SoftwareKernel {
            variant,
            args: [None; ARG_COUNT],
        })
    }

    unsafe fn wrap_host_memory(
        &self,
        host: NonNull<u8>,
        len: usize,
        access: MemAccess,
    ) -> Result<SoftwareMemory> {
        if len == 0 {
            return Err(Error::GpuAllocation {
                op: "wrap host memory",
                size: len,
                code: CL_INVALID_BUFFER_SIZE,
            });
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Ok(SoftwareMemory {
            id,
            mem: MemRef {
                ptr: host,
                len,
                access,
            },
        })
    }

    fn set_arg_memory(
        &self,
        kernel: &mut SoftwareKernel,
        index: u32,
        memory: &SoftwareMemory,
    ) -> Result<()> {
        let slot = kernel
            .args
            .get_mut(index as usize)
            .ok_or(kernel_error("set_arg", CL_INVALID_ARG_INDEX))?;
        *slot = Some(KernelArg::Memory(memory.mem));
        Ok(())
    }

    fn set_arg_uint(&self, kernel: &mut SoftwareKernel, index: u32, value: u32) -> Result<()> {
        let slot = kernel
            .args
            .get_mut(index as usize)
            .ok_or(kernel_error("set_arg", CL_INVALID_ARG_INDEX))?;
        *slot = Some(KernelArg::Uint(value));
        Ok(())
    }

    fn enqueue(&self, kernel: &SoftwareKernel, grid: &WorkGrid) -> Result<()> {
        let mem = |i: usize| match kernel.args[i] {
            Some(KernelArg::Memory(m)) => Ok(m),
            _ => Err(kernel_error("enqueue", CL_INVALID_KERNEL_ARGS)),
        };
        let uint = |i: usize| match kernel.args[i] {
            Some(KernelArg::Uint(v)) => Ok(v as usize),
            _ => Err(kernel_error("enqueue", CL_INVALID_KERNEL_ARGS)),
        };
        let (input, out_y, out_cbcr) = (mem(0)?, mem(1)?, mem(2)?);
        let (width, height) = (uint(3)?, uint(4)?);

        if !grid.is_evenly_divided() {
            return Err(kernel_error("enqueue", CL_INVALID_WORK_GROUP_SIZE));
        }
        if width < 3 || height < 3 || grid.global[1] == 0 || width % grid.global[1] != 0 {
            return Err(kernel_error("enqueue", CL_INVALID_VALUE));
        }
        let luma = width * height;
        if input.len < luma || out_y.len < luma || out_cbcr.len < luma / 2 {
            return Err(kernel_error("enqueue", CL_INVALID_BUFFER_SIZE));
        }
        if input.access != MemAccess::ReadOnly
            || out_y.access != MemAccess::WriteOnly
            || out_cbcr.access != MemAccess::WriteOnly
        {
            return Err(kernel_error("enqueue", CL_INVALID_MEM_OBJECT));
        }
        let overlaps = |a: &MemRef, b: &MemRef| {
            let (a, b) = (a.range(), b.range());
            a.start < b.end && b.start < a.end
        };
        if overlaps(&input, &out_y) || overlaps(&input, &out_cbcr) || overlaps(&out_y, &out_cbcr) {
            return Err(kernel_error("enqueue", CL_INVALID_MEM_OBJECT));
        }

        self.queue.borrow_mut().push(Job {
            variant: kernel.variant,
            input,
            out_y,
            out_cbcr,
            width,
            height,
            grid: *grid,
        });
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let jobs = std::mem::take(&mut *self.queue.borrow_mut());
        for job in jobs {
            job.run();
            self.completed.set(self.completed.get() + 1);
        }
        Ok(())
    }
}

impl Job {
    fn run(&self) {
        let (w, h) = (self.width, self.height);
        // Sizes, access modes and disjointness were checked at enqueue time.
        let src = unsafe { from_raw_parts(self.input.ptr.as_ptr(), w * h) };
        let dst_y = unsafe { from_raw_parts_mut(self.out_y.ptr.as_ptr(), w * h) };
        let dst_c = unsafe { from_raw_parts_mut(self.out_cbcr.ptr.as_ptr(), w * h / 2) };

        let [rows, groups] = self.grid.global;
        let row_offset = self.grid.offset[0];
        let span = w / groups;

        for y in row_offset..row_offset + rows {
            for group in 0..groups {
                let row = y - row_offset;
                if row % 2 == 0 && row / 2 < h / 2 {
                    let start = (row / 2) * w + group * span;
                    dst_c[start..start + span].fill(CHROMA_NEUTRAL);
                }

                if y < 1 || y >= h - 1 {
                    continue;
                }
                let x0 = group * GROUP;
                for x in (x0..x0 + GROUP).filter(|&x| x >= 1 && x < w - 1) {
                    dst_y[y * w + x] = sobel_magnitude(src, w, x, y, self.variant);
                }
            }
        }
    }
}
