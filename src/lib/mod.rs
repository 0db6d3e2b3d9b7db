#![allow(missing_docs)]
//! # Kernel Launch Protocol
//!
//! This crate implements the host side of a kernel launch: staging a
//! grid/block/shared-memory/stream configuration, marshaling scalar and
//! pointer arguments into the kernel's parameter buffer at alignment-correct
//! offsets, and triggering the launch. It also keeps track of native
//! libraries loaded to provide kernels.
//!
//! ## Core Modules
//!
//! - `api`: the native call layer (`RuntimeApi`), one method per driver call.
//! - `error`: status-code translation and the `LaunchError` type.
//! - `align`: power-of-two offset rounding.
//! - `args`: kernel argument kinds, parameter layout and marshaling.
//! - `launch`: `Dim3`, `LaunchConfig` and the `LaunchContext` state machine.
//! - `kernel`: named kernel handles, attributes and cache preferences.
//! - `library`: registry of `dlopen`ed libraries with bulk teardown.
//! - `recording`: in-process dry-run driver.
//! - `plan`: JSON launch plans.
//! - `cuda` (feature `cuda`): CUDA driver backend built on `cudarc`.
//!
//! ## Typical sequence
//!
//! ```no_run
//! use klaunch::{KernelArg, KernelHandle, LaunchConfig, LaunchContext, RecordingRuntime};
//!
//! # fn main() -> klaunch::Result<()> {
//! let mut api = RecordingRuntime::new();
//! api.register_kernel("scale", Default::default());
//! let mut ctx = LaunchContext::new();
//! let kernel = KernelHandle::new("scale");
//!
//! ctx.configure(&mut api, LaunchConfig::new(64u32, 256u32))?;
//! ctx.setup_args(&mut api, &[KernelArg::Float(2.0), KernelArg::Int(16384)])?;
//! kernel.launch(&mut api, &mut ctx)?;
//! # Ok(())
//! # }
//! ```

pub mod align;
pub mod api;
pub mod args;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod error;
pub mod kernel;
pub mod launch;
pub mod library;
pub mod plan;
pub mod pointer;
pub mod recording;
pub mod stream;

pub use align::align_up;
pub use api::RuntimeApi;
pub use args::{ArgLayout, ArgSlot, HostValue, KernelArg};
pub use error::{check, LaunchError, Result, Status};
pub use kernel::{CacheConfig, FunctionAttributes, KernelHandle};
pub use launch::{Dim3, LaunchConfig, LaunchContext, LaunchPhase, PendingLaunch};
pub use library::{DlLoader, LibraryLoader, LibraryRegistry};
pub use plan::LaunchPlan;
pub use pointer::{DeviceAddress, DevicePtr, POINTER_SIZE};
pub use recording::{Call, CallKind, LaunchRecord, RecordingRuntime};
pub use stream::{NativeStream, StreamHandle, StreamSelector};

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
