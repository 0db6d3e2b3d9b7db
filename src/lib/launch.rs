//! # Launch Configuration and Sequencing
//!
//! A kernel launch is a three-step conversation with the driver:
//!
//! ```text
//!   configure ──> setup_args ──> launch
//!   (grid, block,   (one call per     (consumes both)
//!    shared, stream) argument)
//! ```
//!
//! The driver keeps the staged configuration and arguments as implicit
//! global state. [`LaunchContext`] mirrors that state on the host side so the
//! sequence is explicit: it records what is pending, rejects calls made out of
//! order, and forces a fresh `configure` after any failure.
//!
//! ## State machine
//!
//! ```text
//!   Idle ──configure──> Configured ──setup_args──> ArgumentsStaged
//!                           │                            │
//!                           └───────────launch───────────┴──> Launched
//!
//!   any failure ──> Failed        (only `configure` leaves Failed/Launched)
//! ```
//!
//! Arguments are staged once per configuration. The driver only ever
//! overwrites parameter bytes, so a second pass would leave the tail of the
//! first one behind; it is refused and needs a fresh `configure`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::RuntimeApi;
use crate::args::{self, ArgSlot, HostValue, KernelArg};
use crate::error::{check, LaunchError, Result};
use crate::stream::{StreamHandle, StreamSelector};

/// Three-dimensional extent used for grid and block sizes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional extent `(n, 1, 1)`.
    pub const fn linear(n: u32) -> Self {
        Self::new(n, 1, 1)
    }

    /// Total number of elements (blocks or threads).
    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::linear(x)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Self::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

impl From<[u32; 3]> for Dim3 {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl From<Dim3> for [u32; 3] {
    fn from(d: Dim3) -> Self {
        [d.x, d.y, d.z]
    }
}

impl FromStr for Dim3 {
    type Err = String;

    /// Accepts `x`, `x,y` or `x,y,z`; missing components default to 1.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid dimension `{}`: {}", s, e))?;
        match parts.as_slice() {
            [x] => Ok(Dim3::new(*x, 1, 1)),
            [x, y] => Ok(Dim3::new(*x, *y, 1)),
            [x, y, z] => Ok(Dim3::new(*x, *y, *z)),
            _ => Err(format!("expected 1 to 3 dimensions, got `{}`", s)),
        }
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Settings for the next launch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
    /// Dynamic shared memory per block, in bytes
    pub shared_mem_bytes: usize,
    pub stream: StreamSelector,
}

impl LaunchConfig {
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_mem_bytes: 0,
            stream: StreamSelector::Default,
        }
    }

    pub fn with_shared_mem(mut self, bytes: usize) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn on_stream(mut self, stream: impl Into<StreamSelector>) -> Self {
        self.stream = stream.into();
        self
    }
}

/// A configuration accepted by the driver and not yet consumed by a launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingLaunch {
    pub config: LaunchConfig,
    /// Stream the configuration resolved to
    pub stream: StreamHandle,
}

/// Where a launch sequence currently stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LaunchPhase {
    Idle,
    Configured,
    ArgumentsStaged,
    Launched,
    Failed,
}

impl LaunchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchPhase::Idle => "idle",
            LaunchPhase::Configured => "configured",
            LaunchPhase::ArgumentsStaged => "arguments-staged",
            LaunchPhase::Launched => "launched",
            LaunchPhase::Failed => "failed",
        }
    }

    fn accepts_args(&self) -> bool {
        matches!(self, LaunchPhase::Configured)
    }

    fn accepts_launch(&self) -> bool {
        matches!(self, LaunchPhase::Configured | LaunchPhase::ArgumentsStaged)
    }
}

impl fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-side view of the driver's staged launch state.
///
/// One context drives one sequence at a time; every method takes `&mut self`
/// so two sequences cannot interleave on the same context.
#[derive(Debug)]
pub struct LaunchContext {
    phase: LaunchPhase,
    pending: Option<PendingLaunch>,
    staged: Vec<ArgSlot>,
    launches: u64,
}

impl Default for LaunchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchContext {
    pub fn new() -> Self {
        Self {
            phase: LaunchPhase::Idle,
            pending: None,
            staged: Vec::new(),
            launches: 0,
        }
    }

    pub fn phase(&self) -> LaunchPhase {
        self.phase
    }

    pub fn pending(&self) -> Option<&PendingLaunch> {
        self.pending.as_ref()
    }

    /// Arguments staged by the latest marshaling pass.
    pub fn staged_args(&self) -> &[ArgSlot] {
        &self.staged
    }

    /// Number of successful launches driven through this context.
    pub fn launch_count(&self) -> u64 {
        self.launches
    }

    /// Stages `config` for the next launch, replacing any pending one.
    pub fn configure<A: RuntimeApi + ?Sized>(
        &mut self,
        api: &mut A,
        config: LaunchConfig,
    ) -> Result<()> {
        let stream = config.stream.resolve();
        if self.pending.is_some() {
            debug!("Replacing unconsumed launch configuration");
        }
        // Whatever was staged belongs to the configuration being replaced.
        self.staged.clear();

        let status = api.configure_call(config.grid, config.block, config.shared_mem_bytes, stream);
        if let Err(e) = check(status) {
            self.fail();
            return Err(e);
        }

        debug!(
            "Configured launch grid={} block={} shared={}B stream={:#x}",
            config.grid, config.block, config.shared_mem_bytes, stream.0
        );
        self.pending = Some(PendingLaunch { config, stream });
        self.phase = LaunchPhase::Configured;
        Ok(())
    }

    /// Marshals `args` for the pending launch.
    ///
    /// Allowed once per configuration, starting at offset 0. On failure the
    /// sequence is marked failed and must be restarted with
    /// [`configure`](Self::configure).
    pub fn setup_args<A: RuntimeApi + ?Sized>(
        &mut self,
        api: &mut A,
        args: &[KernelArg],
    ) -> Result<()> {
        self.require(LaunchPhase::accepts_args, "setup_args")?;
        if let Err(e) = args::marshal(api, args, &mut self.staged) {
            self.fail();
            return Err(e);
        }
        self.phase = LaunchPhase::ArgumentsStaged;
        Ok(())
    }

    /// Like [`setup_args`](Self::setup_args) for loosely-typed values.
    ///
    /// The whole list is checked first; an unsupported kind fails the
    /// sequence without issuing any native call.
    pub fn setup_host_values<A: RuntimeApi + ?Sized>(
        &mut self,
        api: &mut A,
        values: &[HostValue],
    ) -> Result<()> {
        self.require(LaunchPhase::accepts_args, "setup_args")?;
        let args = match args::to_kernel_args(values) {
            Ok(args) => args,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };
        self.setup_args(api, &args)
    }

    /// Takes the pending configuration for a launch about to be issued.
    pub(crate) fn begin_launch(&mut self) -> Result<PendingLaunch> {
        match self.pending.take() {
            Some(pending) if self.phase.accepts_launch() => Ok(pending),
            _ => {
                let phase = self.phase.as_str();
                self.fail();
                Err(LaunchError::OutOfSequence {
                    operation: "launch",
                    phase,
                })
            }
        }
    }

    /// Records a successful launch; returns how many arguments it consumed.
    pub(crate) fn finish_launch(&mut self) -> usize {
        let consumed = self.staged.len();
        self.staged.clear();
        self.phase = LaunchPhase::Launched;
        self.launches += 1;
        consumed
    }

    pub(crate) fn fail(&mut self) {
        self.pending = None;
        self.phase = LaunchPhase::Failed;
    }

    fn require(&mut self, allowed: fn(&LaunchPhase) -> bool, operation: &'static str) -> Result<()> {
        if allowed(&self.phase) {
            return Ok(());
        }
        let phase = self.phase.as_str();
        self.fail();
        Err(LaunchError::OutOfSequence { operation, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ArgLayout;
    use crate::error::status;
    use crate::kernel::{FunctionAttributes, KernelHandle};
    use crate::pointer::DevicePtr;
    use crate::recording::{Call, RecordingRuntime};

    fn runtime_with(kernel: &str) -> RecordingRuntime {
        let mut rt = RecordingRuntime::new();
        rt.register_kernel(kernel, FunctionAttributes::default());
        rt
    }

    #[test]
    fn test_dim3_parse_and_display() {
        assert_eq!("4".parse::<Dim3>().unwrap(), Dim3::new(4, 1, 1));
        assert_eq!("4, 2".parse::<Dim3>().unwrap(), Dim3::new(4, 2, 1));
        assert_eq!("4,2,3".parse::<Dim3>().unwrap(), Dim3::new(4, 2, 3));
        assert!("4,2,3,1".parse::<Dim3>().is_err());
        assert!("four".parse::<Dim3>().is_err());
        assert_eq!(Dim3::new(4, 2, 3).to_string(), "(4, 2, 3)");
        assert_eq!(Dim3::new(4, 2, 3).volume(), 24);
    }

    #[test]
    fn test_dim3_json_is_array() {
        let d: Dim3 = serde_json::from_str("[8, 4, 1]").unwrap();
        assert_eq!(d, Dim3::new(8, 4, 1));
        assert_eq!(serde_json::to_string(&d).unwrap(), "[8,4,1]");
    }

    #[test]
    fn test_full_sequence() {
        let mut rt = runtime_with("axpy");
        let mut ctx = LaunchContext::new();
        assert_eq!(ctx.phase(), LaunchPhase::Idle);

        ctx.configure(
            &mut rt,
            LaunchConfig::new((16u32, 2u32), 128u32).with_shared_mem(1024),
        )
        .unwrap();
        assert_eq!(ctx.phase(), LaunchPhase::Configured);
        assert_eq!(ctx.pending().unwrap().stream, StreamHandle::DEFAULT);

        let args = [
            KernelArg::Int(1024),
            KernelArg::Pointer(DevicePtr(0x7000)),
            KernelArg::Float(2.0),
        ];
        ctx.setup_args(&mut rt, &args).unwrap();
        assert_eq!(ctx.phase(), LaunchPhase::ArgumentsStaged);
        assert_eq!(ctx.staged_args().len(), 3);

        KernelHandle::new("axpy").launch(&mut rt, &mut ctx).unwrap();
        assert_eq!(ctx.phase(), LaunchPhase::Launched);
        assert!(ctx.pending().is_none());
        assert_eq!(ctx.launch_count(), 1);

        let record = &rt.launches()[0];
        assert_eq!(record.kernel, "axpy");
        assert_eq!(record.grid, Dim3::new(16, 2, 1));
        assert_eq!(record.shared_mem_bytes, 1024);
        assert_eq!(record.params.len(), ArgLayout::of(&args).total_size());
    }

    #[test]
    fn test_launch_without_configure_is_rejected_locally() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();

        let err = KernelHandle::new("k").launch(&mut rt, &mut ctx).unwrap_err();
        assert_eq!(
            err,
            LaunchError::OutOfSequence {
                operation: "launch",
                phase: "idle"
            }
        );
        assert!(rt.calls().is_empty());
        assert_eq!(ctx.phase(), LaunchPhase::Failed);
    }

    #[test]
    fn test_configuration_is_consumed_by_launch() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();
        let kernel = KernelHandle::new("k");

        ctx.configure(&mut rt, LaunchConfig::new(1u32, 1u32)).unwrap();
        kernel.launch(&mut rt, &mut ctx).unwrap();

        // A second launch needs a new configuration.
        assert!(matches!(
            kernel.launch(&mut rt, &mut ctx),
            Err(LaunchError::OutOfSequence { .. })
        ));
    }

    #[test]
    fn test_reconfigure_overwrites_pending() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();

        ctx.configure(&mut rt, LaunchConfig::new(1u32, 32u32)).unwrap();
        ctx.configure(&mut rt, LaunchConfig::new(2u32, 64u32)).unwrap();
        KernelHandle::new("k").launch(&mut rt, &mut ctx).unwrap();

        assert_eq!(rt.launches().len(), 1);
        assert_eq!(rt.launches()[0].grid, Dim3::linear(2));
        assert_eq!(rt.launches()[0].block, Dim3::linear(64));
    }

    #[test]
    fn test_configure_failure_marks_failed() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();

        let err = ctx
            .configure(&mut rt, LaunchConfig::new(0u32, 32u32))
            .unwrap_err();
        assert_eq!(err.status(), Some(status::INVALID_CONFIGURATION));
        assert_eq!(ctx.phase(), LaunchPhase::Failed);
        assert!(ctx.pending().is_none());
    }

    #[test]
    fn test_marshal_failure_requires_restart() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();
        let kernel = KernelHandle::new("k");

        ctx.configure(&mut rt, LaunchConfig::new(1u32, 1u32)).unwrap();
        rt.fail_setup_argument_at(0, status::INVALID_VALUE);
        assert!(ctx.setup_args(&mut rt, &[KernelArg::Int(1)]).is_err());
        assert_eq!(ctx.phase(), LaunchPhase::Failed);

        // Launching straight after a failed pass is refused.
        assert!(matches!(
            kernel.launch(&mut rt, &mut ctx),
            Err(LaunchError::OutOfSequence { phase: "failed", .. })
        ));

        // A fresh configure restarts the sequence.
        ctx.configure(&mut rt, LaunchConfig::new(1u32, 1u32)).unwrap();
        ctx.setup_args(&mut rt, &[KernelArg::Int(1)]).unwrap();
        kernel.launch(&mut rt, &mut ctx).unwrap();
        assert_eq!(rt.launches().len(), 1);
    }

    #[test]
    fn test_type_mismatch_issues_no_native_call() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();
        ctx.configure(&mut rt, LaunchConfig::new(1u32, 1u32)).unwrap();
        let before = rt.calls().len();

        let err = ctx
            .setup_host_values(
                &mut rt,
                &[HostValue::I32(1), HostValue::I64(2), HostValue::F32(3.0)],
            )
            .unwrap_err();
        assert!(matches!(err, LaunchError::TypeMismatch { index: 1, kind: "i64" }));
        assert_eq!(rt.calls().len(), before);
        assert_eq!(ctx.phase(), LaunchPhase::Failed);
    }

    #[test]
    fn test_unrecognized_stream_configures_default() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();

        ctx.configure(
            &mut rt,
            LaunchConfig::new(1u32, 1u32).on_stream(StreamSelector::Unrecognized("\"fast\"".into())),
        )
        .unwrap();
        assert_eq!(ctx.pending().unwrap().stream, StreamHandle::DEFAULT);
        assert!(matches!(
            rt.calls().last(),
            Some(Call::ConfigureCall { stream, .. }) if stream.is_default()
        ));
    }

    #[test]
    fn test_native_stream_is_passed_through() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();

        ctx.configure(&mut rt, LaunchConfig::new(1u32, 1u32).on_stream(StreamHandle(0x55)))
            .unwrap();
        KernelHandle::new("k").launch(&mut rt, &mut ctx).unwrap();
        assert_eq!(rt.launches()[0].stream, StreamHandle(0x55));
    }

    #[test]
    fn test_second_marshal_pass_needs_new_configure() {
        let mut rt = runtime_with("k");
        let mut ctx = LaunchContext::new();
        let kernel = KernelHandle::new("k");
        ctx.configure(&mut rt, LaunchConfig::new(1u32, 1u32)).unwrap();

        ctx.setup_args(&mut rt, &[KernelArg::Int(1), KernelArg::Int(2)])
            .unwrap();
        let err = ctx.setup_args(&mut rt, &[KernelArg::Float(3.0)]).unwrap_err();
        assert_eq!(
            err,
            LaunchError::OutOfSequence {
                operation: "setup_args",
                phase: "arguments-staged"
            }
        );
        assert_eq!(ctx.phase(), LaunchPhase::Failed);
        assert_eq!(rt.setup_argument_calls(), 2);

        // Restaging from a fresh configure leaves nothing of the first pass.
        ctx.configure(&mut rt, LaunchConfig::new(1u32, 1u32)).unwrap();
        ctx.setup_args(&mut rt, &[KernelArg::Float(3.0)]).unwrap();
        assert_eq!(ctx.staged_args(), &[ArgSlot { offset: 0, size: 4 }]);
        kernel.launch(&mut rt, &mut ctx).unwrap();
        assert_eq!(rt.launches()[0].params, 3.0f32.to_ne_bytes().to_vec());
    }
}
