//! Accelerator backends
//!
//! A backend compiles kernel text for its device, binds the destination
//! buffer to the first parameter and the inputs to the rest, runs the kernel
//! at least once and leaves the result in the destination buffer.

pub mod cpu;
pub mod parse;

use serde::{Deserialize, Serialize};

use crate::error::BackendResult;
use crate::kernel::KernelSource;

pub use cpu::CpuBackend;

/// Executes generated kernels
pub trait Backend {
    /// Run `kernel` with `output` bound to parameter 0 and `inputs[i]` to
    /// parameter `i + 1`. Inputs are never written.
    fn execute(
        &self,
        kernel: &KernelSource,
        output: &mut [f32],
        inputs: &[&[f32]],
    ) -> BackendResult<()>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn execute(
        &self,
        kernel: &KernelSource,
        output: &mut [f32],
        inputs: &[&[f32]],
    ) -> BackendResult<()> {
        (**self).execute(kernel, output, inputs)
    }
}

/// Launch grid for a kernel dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Execution units that each run the whole kernel body
    pub work_items: usize,
    /// Worker threads; 0 uses the global pool
    pub threads: usize,
}

impl LaunchConfig {
    pub fn new(work_items: usize, threads: usize) -> Self {
        Self { work_items, threads }
    }

    /// One execution unit on the calling thread's pool
    pub fn single() -> Self {
        Self::new(1, 0)
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new(4, 0)
    }
}
