//! # CUDA Driver Backend
//!
//! Implements [`RuntimeApi`] on top of the CUDA driver API through `cudarc`.
//! Kernels are resolved by name from a single PTX module loaded at start-up.
//!
//! The driver API has no `cudaConfigureCall`/`cudaSetupArgument` pair, so the
//! staging half of the protocol is kept on the host: `configure_call` records
//! the pending launch, `setup_argument` writes into a host parameter buffer,
//! and `launch` hands `cuLaunchKernel` one pointer per staged argument into
//! that buffer.
//!
//! Driver error codes are folded into the runtime status codes used by the
//! rest of the crate; codes without a counterpart become `UNKNOWN` and are
//! logged with their raw value.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::path::Path;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaDevice, DriverError};
use tracing::{info, warn};

use crate::api::RuntimeApi;
use crate::error::{status, LaunchError, Result, Status, SUCCESS};
use crate::kernel::{CacheConfig, FunctionAttributes};
use crate::launch::Dim3;
use crate::stream::StreamHandle;

#[derive(Copy, Clone, Debug)]
struct PendingCall {
    grid: Dim3,
    block: Dim3,
    shared_mem_bytes: u32,
    stream: StreamHandle,
}

/// Launches kernels from one PTX module on one device.
pub struct CudaRuntime {
    // Keeps the primary context alive for the module and functions below.
    _device: Arc<CudaDevice>,
    module: sys::CUmodule,
    functions: HashMap<String, sys::CUfunction>,
    pending: Option<PendingCall>,
    params: Vec<u8>,
    offsets: Vec<usize>,
}

impl CudaRuntime {
    /// Initializes device `ordinal` and loads the PTX module at `ptx_path`.
    pub fn new(ordinal: usize, ptx_path: impl AsRef<Path>) -> Result<Self> {
        let ptx_path = ptx_path.as_ref();
        let device = CudaDevice::new(ordinal).map_err(driver_error)?;

        let source = std::fs::read(ptx_path).map_err(|e| LaunchError::LibraryOpen {
            path: ptx_path.to_path_buf(),
            message: e.to_string(),
        })?;
        let image = CString::new(source).map_err(|_| LaunchError::LibraryOpen {
            path: ptx_path.to_path_buf(),
            message: "PTX image contains a NUL byte".to_string(),
        })?;
        let module =
            unsafe { result::module::load_data(image.as_ptr() as *const c_void) }.map_err(driver_error)?;

        info!(
            "Loaded PTX module {} on CUDA device {}",
            ptx_path.display(),
            ordinal
        );

        Ok(Self {
            _device: device,
            module,
            functions: HashMap::new(),
            pending: None,
            params: Vec::new(),
            offsets: Vec::new(),
        })
    }

    fn function(&mut self, name: &str) -> std::result::Result<sys::CUfunction, Status> {
        if let Some(f) = self.functions.get(name) {
            return Ok(*f);
        }
        let c_name = CString::new(name).map_err(|_| status::INVALID_VALUE)?;
        let f = unsafe { result::module::get_function(self.module, c_name) }.map_err(to_status)?;
        self.functions.insert(name.to_string(), f);
        Ok(f)
    }

    fn attribute(f: sys::CUfunction, attr: sys::CUfunction_attribute) -> std::result::Result<i32, Status> {
        let mut value = 0i32;
        let rc = unsafe { sys::lib().cuFuncGetAttribute(&mut value, attr, f) };
        if rc == sys::CUresult::CUDA_SUCCESS {
            Ok(value)
        } else {
            Err(to_status(DriverError(rc)))
        }
    }
}

impl RuntimeApi for CudaRuntime {
    fn configure_call(
        &mut self,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: usize,
        stream: StreamHandle,
    ) -> Status {
        if grid.volume() == 0 || block.volume() == 0 {
            return status::INVALID_CONFIGURATION;
        }
        let Ok(shared_mem_bytes) = u32::try_from(shared_mem_bytes) else {
            return status::INVALID_CONFIGURATION;
        };
        self.pending = Some(PendingCall {
            grid,
            block,
            shared_mem_bytes,
            stream,
        });
        self.params.clear();
        self.offsets.clear();
        SUCCESS
    }

    fn setup_argument(&mut self, arg: &[u8], offset: usize) -> Status {
        if self.pending.is_none() {
            return status::MISSING_CONFIGURATION;
        }
        let Some(end) = offset.checked_add(arg.len()) else {
            return status::INVALID_VALUE;
        };
        if self.params.len() < end {
            self.params.resize(end, 0);
        }
        self.params[offset..end].copy_from_slice(arg);
        if let Err(pos) = self.offsets.binary_search(&offset) {
            self.offsets.insert(pos, offset);
        }
        SUCCESS
    }

    fn launch(&mut self, kernel: &str) -> Status {
        let Some(pending) = self.pending else {
            return status::MISSING_CONFIGURATION;
        };
        let f = match self.function(kernel) {
            Ok(f) => f,
            Err(code) => return code,
        };

        let base = self.params.as_mut_ptr();
        let mut kernel_params: Vec<*mut c_void> = self
            .offsets
            .iter()
            .map(|&offset| unsafe { base.add(offset) } as *mut c_void)
            .collect();

        let launched = unsafe {
            result::launch_kernel(
                f,
                (pending.grid.x, pending.grid.y, pending.grid.z),
                (pending.block.x, pending.block.y, pending.block.z),
                pending.shared_mem_bytes,
                pending.stream.0 as sys::CUstream,
                &mut kernel_params,
            )
        };
        match launched {
            Ok(()) => {
                self.pending = None;
                self.params.clear();
                self.offsets.clear();
                SUCCESS
            }
            Err(e) => to_status(e),
        }
    }

    fn func_get_attributes(&mut self, attrs: &mut FunctionAttributes, kernel: &str) -> Status {
        use sys::CUfunction_attribute_enum as A;

        let f = match self.function(kernel) {
            Ok(f) => f,
            Err(code) => return code,
        };
        let fetch = || -> std::result::Result<FunctionAttributes, Status> {
            Ok(FunctionAttributes {
                shared_size_bytes: Self::attribute(f, A::CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES)? as usize,
                const_size_bytes: Self::attribute(f, A::CU_FUNC_ATTRIBUTE_CONST_SIZE_BYTES)? as usize,
                local_size_bytes: Self::attribute(f, A::CU_FUNC_ATTRIBUTE_LOCAL_SIZE_BYTES)? as usize,
                max_threads_per_block: Self::attribute(f, A::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?
                    as u32,
                num_regs: Self::attribute(f, A::CU_FUNC_ATTRIBUTE_NUM_REGS)? as u32,
                ptx_version: Self::attribute(f, A::CU_FUNC_ATTRIBUTE_PTX_VERSION)? as u32,
                binary_version: Self::attribute(f, A::CU_FUNC_ATTRIBUTE_BINARY_VERSION)? as u32,
            })
        };
        match fetch() {
            Ok(fetched) => {
                *attrs = fetched;
                SUCCESS
            }
            Err(code) => code,
        }
    }

    fn func_set_cache_config(&mut self, kernel: &str, config: CacheConfig) -> Status {
        use sys::CUfunc_cache_enum as C;

        let f = match self.function(kernel) {
            Ok(f) => f,
            Err(code) => return code,
        };
        let native = match config {
            CacheConfig::PreferNone => C::CU_FUNC_CACHE_PREFER_NONE,
            CacheConfig::PreferShared => C::CU_FUNC_CACHE_PREFER_SHARED,
            CacheConfig::PreferL1 => C::CU_FUNC_CACHE_PREFER_L1,
            CacheConfig::PreferEqual => C::CU_FUNC_CACHE_PREFER_EQUAL,
        };
        let rc = unsafe { sys::lib().cuFuncSetCacheConfig(f, native) };
        if rc == sys::CUresult::CUDA_SUCCESS {
            SUCCESS
        } else {
            to_status(DriverError(rc))
        }
    }
}

impl Drop for CudaRuntime {
    fn drop(&mut self) {
        unsafe {
            result::module::unload(self.module).ok();
        }
    }
}

/// Maps a driver API error onto the runtime status codes.
fn to_status(err: DriverError) -> Status {
    use sys::cudaError_enum as E;

    match err.0 {
        E::CUDA_SUCCESS => SUCCESS,
        E::CUDA_ERROR_INVALID_VALUE => status::INVALID_VALUE,
        E::CUDA_ERROR_OUT_OF_MEMORY => status::MEMORY_ALLOCATION,
        E::CUDA_ERROR_NOT_INITIALIZED | E::CUDA_ERROR_DEINITIALIZED => {
            status::INITIALIZATION_ERROR
        }
        E::CUDA_ERROR_INVALID_DEVICE => status::INVALID_DEVICE,
        E::CUDA_ERROR_NOT_FOUND => status::INVALID_DEVICE_FUNCTION,
        E::CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => status::LAUNCH_OUT_OF_RESOURCES,
        E::CUDA_ERROR_LAUNCH_TIMEOUT => status::LAUNCH_TIMEOUT,
        E::CUDA_ERROR_LAUNCH_FAILED => status::LAUNCH_FAILURE,
        other => {
            warn!("Unmapped CUDA driver error {:?}", other);
            status::UNKNOWN
        }
    }
}

fn driver_error(err: DriverError) -> LaunchError {
    let code = to_status(err);
    LaunchError::Driver {
        code,
        description: crate::error::describe(code),
    }
}
