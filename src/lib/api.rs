//! # Native Call Layer
//!
//! [`RuntimeApi`] is the seam between the launch protocol and whatever
//! actually talks to the device. Each method corresponds to exactly one
//! native call and reports its outcome as a raw [`Status`]; translating that
//! status into an error is the caller's job (see [`crate::error::check`]).
//!
//! Implementations in this crate:
//! - [`crate::recording::RecordingRuntime`]: in-process dry-run driver.
//! - `crate::cuda::CudaRuntime` (feature `cuda`): CUDA driver API via `cudarc`.

use crate::error::Status;
use crate::kernel::{CacheConfig, FunctionAttributes};
use crate::launch::Dim3;
use crate::stream::StreamHandle;

pub trait RuntimeApi {
    /// Stages the grid/block/shared-memory/stream settings for the next launch.
    fn configure_call(
        &mut self,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: usize,
        stream: StreamHandle,
    ) -> Status;

    /// Copies `arg` into the pending parameter buffer at byte `offset`.
    fn setup_argument(&mut self, arg: &[u8], offset: usize) -> Status;

    /// Launches `kernel` with the staged configuration and arguments.
    fn launch(&mut self, kernel: &str) -> Status;

    /// Fills `attrs` with the compiled attributes of `kernel`.
    fn func_get_attributes(&mut self, attrs: &mut FunctionAttributes, kernel: &str) -> Status;

    /// Sets the on-chip memory preference of `kernel`.
    fn func_set_cache_config(&mut self, kernel: &str, config: CacheConfig) -> Status;
}

impl<T: RuntimeApi + ?Sized> RuntimeApi for &mut T {
    fn configure_call(
        &mut self,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: usize,
        stream: StreamHandle,
    ) -> Status {
        (**self).configure_call(grid, block, shared_mem_bytes, stream)
    }

    fn setup_argument(&mut self, arg: &[u8], offset: usize) -> Status {
        (**self).setup_argument(arg, offset)
    }

    fn launch(&mut self, kernel: &str) -> Status {
        (**self).launch(kernel)
    }

    fn func_get_attributes(&mut self, attrs: &mut FunctionAttributes, kernel: &str) -> Status {
        (**self).func_get_attributes(attrs, kernel)
    }

    fn func_set_cache_config(&mut self, kernel: &str, config: CacheConfig) -> Status {
        (**self).func_set_cache_config(kernel, config)
    }
}
