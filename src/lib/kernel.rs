//! # Kernel Handles
//!
//! A [`KernelHandle`] is just the device-side symbol name. It does not own any
//! device state; it addresses three independent pieces of driver state:
//! compiled attributes, the cache preference, and the currently staged launch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::RuntimeApi;
use crate::error::{check, LaunchError, Result};
use crate::launch::LaunchContext;

/// Snapshot of a kernel's compiled attributes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionAttributes {
    /// Statically allocated shared memory per block, in bytes
    pub shared_size_bytes: usize,
    /// Constant memory used by the kernel, in bytes
    pub const_size_bytes: usize,
    /// Local memory per thread, in bytes
    pub local_size_bytes: usize,
    /// Upper bound on threads per block for this kernel
    pub max_threads_per_block: u32,
    /// Registers per thread
    pub num_regs: u32,
    /// PTX virtual architecture, e.g. 80 for `compute_80`
    pub ptx_version: u32,
    /// Binary architecture, e.g. 86 for `sm_86`
    pub binary_version: u32,
}

/// Preferred split between shared memory and L1 cache for a kernel.
#[repr(i32)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheConfig {
    #[default]
    PreferNone = 0,
    PreferShared = 1,
    PreferL1 = 2,
    PreferEqual = 3,
}

impl TryFrom<i32> for CacheConfig {
    type Error = LaunchError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(CacheConfig::PreferNone),
            1 => Ok(CacheConfig::PreferShared),
            2 => Ok(CacheConfig::PreferL1),
            3 => Ok(CacheConfig::PreferEqual),
            other => Err(LaunchError::InvalidCacheConfig(other)),
        }
    }
}

impl FromStr for CacheConfig {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "prefer-none" => Ok(CacheConfig::PreferNone),
            "shared" | "prefer-shared" => Ok(CacheConfig::PreferShared),
            "l1" | "prefer-l1" => Ok(CacheConfig::PreferL1),
            "equal" | "prefer-equal" => Ok(CacheConfig::PreferEqual),
            other => Err(format!("unknown cache configuration `{}`", other)),
        }
    }
}

/// Identifies a kernel entry point by its device-side name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    name: String,
}

impl KernelHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetches a fresh attribute snapshot from the driver.
    pub fn attributes<A: RuntimeApi + ?Sized>(&self, api: &mut A) -> Result<FunctionAttributes> {
        let mut attrs = FunctionAttributes::default();
        check(api.func_get_attributes(&mut attrs, &self.name))?;
        Ok(attrs)
    }

    /// Applies `config` to this kernel and returns it.
    pub fn set_cache_config<A: RuntimeApi + ?Sized>(
        &self,
        api: &mut A,
        config: CacheConfig,
    ) -> Result<CacheConfig> {
        check(api.func_set_cache_config(&self.name, config))?;
        Ok(config)
    }

    /// Launches this kernel with whatever `ctx` has configured and staged.
    ///
    /// The pending configuration is consumed on success, so the next launch
    /// of any kernel needs a fresh [`LaunchContext::configure`].
    ///
    /// Without a pending configuration the launch is refused here as
    /// [`LaunchError::OutOfSequence`]; the driver is never called, so no
    /// status code (such as missing configuration) is available.
    pub fn launch<A: RuntimeApi + ?Sized>(
        &self,
        api: &mut A,
        ctx: &mut LaunchContext,
    ) -> Result<&Self> {
        let pending = ctx.begin_launch()?;
        if let Err(e) = check(api.launch(&self.name)) {
            ctx.fail();
            return Err(e);
        }
        let consumed = ctx.finish_launch();
        info!(
            "Launched {} grid={} block={} shared={}B stream={:#x} args={}",
            self.name,
            pending.config.grid,
            pending.config.block,
            pending.config.shared_mem_bytes,
            pending.stream.0,
            consumed
        );
        Ok(self)
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
