//! # Launch Plans
//!
//! A `LaunchPlan` is a complete launch sequence written down as data: which
//! libraries to load, which kernel to run, how to configure it and what to
//! pass it. Plans are read from JSON files or assembled from command-line
//! flags, then driven through [`LaunchPlan::execute`].
//!
//! ```json
//! {
//!   "kernel": "vector_add",
//!   "grid": [64, 1, 1],
//!   "block": [256, 1, 1],
//!   "shared_mem_bytes": 0,
//!   "stream": null,
//!   "cache_config": "prefer-shared",
//!   "args": [{"ptr": 4096}, {"ptr": 8192}, {"i32": 16384}]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::RuntimeApi;
use crate::args::HostValue;
use crate::kernel::{CacheConfig, KernelHandle};
use crate::launch::{Dim3, LaunchConfig, LaunchContext};
use crate::library::{LibraryLoader, LibraryRegistry};
use crate::stream::StreamSelector;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchPlan {
    /// Device-side kernel name
    pub kernel: String,
    #[serde(default)]
    pub grid: Dim3,
    #[serde(default)]
    pub block: Dim3,
    #[serde(default)]
    pub shared_mem_bytes: usize,
    /// `null` or `"default"` for the default stream; anything else falls back
    /// to it with a warning
    #[serde(default)]
    pub stream: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_config: Option<CacheConfig>,
    #[serde(default)]
    pub args: Vec<HostValue>,
    /// Shared libraries to load before launching
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<PathBuf>,
}

impl LaunchPlan {
    pub fn new(kernel: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            grid: Dim3::default(),
            block: Dim3::default(),
            shared_mem_bytes: 0,
            stream: serde_json::Value::Null,
            cache_config: None,
            args: Vec::new(),
            libraries: Vec::new(),
        }
    }

    /// Reads a plan from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read launch plan {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid launch plan {:?}", path))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize launch plan")
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig::new(self.grid, self.block)
            .with_shared_mem(self.shared_mem_bytes)
            .on_stream(StreamSelector::from_plan_value(&self.stream))
    }

    /// Loads the plan's libraries, then runs configure, marshal and launch.
    pub fn execute<A, L>(
        &self,
        api: &mut A,
        ctx: &mut LaunchContext,
        libraries: &mut LibraryRegistry<L>,
    ) -> Result<()>
    where
        A: RuntimeApi + ?Sized,
        L: LibraryLoader,
    {
        for lib in &self.libraries {
            libraries.load_lib_file(lib)?;
        }

        let kernel = KernelHandle::new(&self.kernel);
        if let Some(config) = self.cache_config {
            kernel
                .set_cache_config(api, config)
                .with_context(|| format!("Failed to set cache config of {}", kernel))?;
        }

        ctx.configure(api, self.launch_config())
            .with_context(|| format!("Failed to configure launch of {}", kernel))?;
        ctx.setup_host_values(api, &self.args)
            .with_context(|| format!("Failed to stage arguments of {}", kernel))?;
        kernel
            .launch(api, ctx)
            .with_context(|| format!("Failed to launch {}", kernel))?;

        info!("Executed plan for {} ({} args)", kernel, self.args.len());
        Ok(())
    }
}
