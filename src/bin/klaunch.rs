#![deny(missing_docs)]
//! # Launch Driver
//!
//! The `klaunch` binary runs one kernel launch sequence end to end: it loads
//! any requested shared libraries, optionally queries the kernel's attributes
//! and sets its cache preference, configures the launch, marshals the
//! arguments and triggers the launch.
//!
//! The sequence comes either from a JSON launch plan (`--plan`) or from the
//! command-line flags. Arguments are given as `kind:value` pairs:
//!
//! ```text
//! klaunch --kernel saxpy --grid 64 --block 256 \
//!     --arg f32:2.0 --arg ptr:0x7f0000001000 --arg ptr:0x7f0000002000 --arg i32:16384
//! ```
//!
//! ## Drivers
//!
//! - **dry run (default)**: the in-process recording driver. The kernel is
//!   registered with `--max-threads` as its block limit, and every native call
//!   plus the staged parameter buffer ends up in the `--out` report.
//! - **CUDA (feature `cuda`)**: with `--module <ptx>`, kernels are resolved
//!   from that PTX module and launched on `--device`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};

use klaunch::args::to_kernel_args;
use klaunch::{
    ArgLayout, CacheConfig, Dim3, FunctionAttributes, HostValue, KernelHandle, LaunchContext, LaunchPlan,
    LibraryRegistry, RecordingRuntime, RuntimeApi,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Host-side kernel launch driver")]
/// Command-line arguments for the launch driver.
struct Args {
    /// Kernel name (ignored when --plan is given)
    #[arg(long)]
    kernel: Option<String>,

    /// Grid dimensions as x[,y[,z]]
    #[arg(long, default_value = "1")]
    grid: Dim3,

    /// Block dimensions as x[,y[,z]]
    #[arg(long, default_value = "1")]
    block: Dim3,

    /// Dynamic shared memory in bytes
    #[arg(long, default_value = "0")]
    shared_mem: usize,

    /// Stream to launch on; only "default" is recognized
    #[arg(long)]
    stream: Option<String>,

    /// Kernel argument as kind:value (repeatable, in order)
    #[arg(long = "arg")]
    args: Vec<HostValue>,

    /// Shared library to load before launching (repeatable)
    #[arg(long = "lib")]
    libs: Vec<PathBuf>,

    /// Cache preference: none, shared, l1 or equal
    #[arg(long)]
    cache_config: Option<CacheConfig>,

    /// Query and print the kernel's attributes before launching
    #[arg(long)]
    attributes: bool,

    /// JSON launch plan
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Output file for the launch report
    #[arg(long)]
    out: Option<PathBuf>,

    /// Block size limit of the dry-run kernel (0 disables the check)
    #[arg(long, default_value = "1024")]
    max_threads: u32,

    /// PTX module to load kernels from
    #[cfg(feature = "cuda")]
    #[arg(long)]
    module: Option<PathBuf>,

    /// CUDA device ordinal
    #[cfg(feature = "cuda")]
    #[arg(long, default_value = "0")]
    device: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let plan = build_plan(&args)?;
    info!(
        "[KLAUNCH:INIT] Kernel: {}, grid {}, block {}, {} args",
        plan.kernel,
        plan.grid,
        plan.block,
        plan.args.len()
    );

    #[cfg(feature = "cuda")]
    if let Some(ref module) = args.module {
        info!("[KLAUNCH:INIT] Driver: CUDA device {}", args.device);
        let mut api = klaunch::CudaRuntime::new(args.device, module)
            .with_context(|| format!("Failed to open CUDA module {:?}", module))?;
        let report = run_with(&mut api, &plan, &args)?;
        return save_report(&report, &args);
    }

    info!("[KLAUNCH:INIT] Driver: dry run");
    let mut api = RecordingRuntime::new();
    api.register_kernel(
        plan.kernel.clone(),
        FunctionAttributes {
            max_threads_per_block: args.max_threads,
            ..Default::default()
        },
    );

    let mut report = run_with(&mut api, &plan, &args)?;
    report["calls"] = serde_json::to_value(api.calls())?;
    report["launches"] = serde_json::to_value(api.launches())?;
    save_report(&report, &args)
}

/// Builds the plan from `--plan`, or from the individual flags.
fn build_plan(args: &Args) -> Result<LaunchPlan> {
    let mut plan = match (&args.plan, &args.kernel) {
        (Some(path), _) => LaunchPlan::from_file(path)?,
        (None, Some(kernel)) => {
            let mut plan = LaunchPlan::new(kernel);
            plan.grid = args.grid;
            plan.block = args.block;
            plan.shared_mem_bytes = args.shared_mem;
            plan.args = args.args.clone();
            plan.cache_config = args.cache_config;
            if let Some(ref stream) = args.stream {
                plan.stream = json!(stream);
            }
            plan
        }
        (None, None) => bail!("either --kernel or --plan is required"),
    };
    plan.libraries.extend(args.libs.iter().cloned());
    Ok(plan)
}

/// Runs the plan against `api` and returns the report.
fn run_with<A: RuntimeApi>(api: &mut A, plan: &LaunchPlan, args: &Args) -> Result<serde_json::Value> {
    let mut ctx = LaunchContext::new();
    let mut libraries = LibraryRegistry::new();

    let attributes = if args.attributes {
        let kernel = KernelHandle::new(&plan.kernel);
        let attrs = kernel
            .attributes(api)
            .with_context(|| format!("Failed to query attributes of {}", kernel))?;
        info!(
            "[KLAUNCH:ATTR] {}: max threads {}, {} regs, {} B shared, {} B const, {} B local",
            kernel,
            attrs.max_threads_per_block,
            attrs.num_regs,
            attrs.shared_size_bytes,
            attrs.const_size_bytes,
            attrs.local_size_bytes
        );
        Some(attrs)
    } else {
        None
    };

    if let Err(e) = plan.execute(api, &mut ctx, &mut libraries) {
        error!("[KLAUNCH:LAUNCH] {:#} (phase: {})", e, ctx.phase());
        return Err(e);
    }
    // The context drops its staged slots once launched; recompute for the report.
    let layout = ArgLayout::of(&to_kernel_args(&plan.args)?);
    info!(
        "[KLAUNCH:LAUNCH] Launched {} ({} bytes of parameters)",
        plan.kernel,
        layout.total_size()
    );

    let loaded: Vec<PathBuf> = libraries.paths().map(|p| p.to_path_buf()).collect();
    libraries
        .unload_all()
        .context("Failed to unload libraries")?;

    Ok(json!({
        "kernel": plan.kernel,
        "phase": ctx.phase().as_str(),
        "launch_count": ctx.launch_count(),
        "config": {
            "grid": plan.grid,
            "block": plan.block,
            "shared_mem_bytes": plan.shared_mem_bytes,
            "stream": plan.stream,
        },
        "args": layout.slots(),
        "param_bytes": layout.total_size(),
        "attributes": attributes,
        "libraries": loaded,
    }))
}

fn save_report(report: &serde_json::Value, args: &Args) -> Result<()> {
    let Some(ref path) = args.out else {
        return Ok(());
    };
    std::fs::write(path, serde_json::to_string_pretty(report)?)
        .with_context(|| format!("Failed to write report {:?}", path))?;
    info!("[KLAUNCH:DONE] Report saved to {}", path.display());
    Ok(())
}
