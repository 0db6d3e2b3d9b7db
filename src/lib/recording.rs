//! # Dry-Run Driver
//!
//! `RecordingRuntime` implements [`RuntimeApi`] entirely in process. It keeps
//! the same implicit state a real runtime keeps (one pending configuration, a
//! parameter buffer, per-kernel cache preferences), answers with the same
//! status codes, and records every call and every successful launch so they
//! can be inspected or written out as JSON.
//!
//! It backs the unit tests and the `klaunch` binary's default mode.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::api::RuntimeApi;
use crate::error::{status, Status, SUCCESS};
use crate::kernel::{CacheConfig, FunctionAttributes};
use crate::launch::Dim3;
use crate::stream::StreamHandle;

/// One native call as seen by the dry-run driver.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    ConfigureCall {
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: usize,
        stream: StreamHandle,
    },
    SetupArgument {
        offset: usize,
        size: usize,
    },
    Launch {
        kernel: String,
    },
    FuncGetAttributes {
        kernel: String,
    },
    FuncSetCacheConfig {
        kernel: String,
        config: CacheConfig,
    },
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Call::ConfigureCall { .. } => CallKind::ConfigureCall,
            Call::SetupArgument { .. } => CallKind::SetupArgument,
            Call::Launch { .. } => CallKind::Launch,
            Call::FuncGetAttributes { .. } => CallKind::FuncGetAttributes,
            Call::FuncSetCacheConfig { .. } => CallKind::FuncSetCacheConfig,
        }
    }
}

/// Native call discriminant, used for failure injection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    ConfigureCall,
    SetupArgument,
    Launch,
    FuncGetAttributes,
    FuncSetCacheConfig,
}

/// A launch the dry-run driver accepted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LaunchRecord {
    pub kernel: String,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: usize,
    pub stream: StreamHandle,
    /// Parameter buffer exactly as staged
    pub params: Vec<u8>,
}

#[derive(Copy, Clone, Debug)]
struct PendingCall {
    grid: Dim3,
    block: Dim3,
    shared_mem_bytes: usize,
    stream: StreamHandle,
}

#[derive(Clone, Debug)]
struct KernelEntry {
    attrs: FunctionAttributes,
    cache_config: CacheConfig,
}

/// In-process driver that records instead of executing.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    kernels: HashMap<String, KernelEntry>,
    pending: Option<PendingCall>,
    params: Vec<u8>,
    launches: Vec<LaunchRecord>,
    calls: Vec<Call>,
    injected: HashMap<CallKind, Status>,
    // (n-th setup_argument call after the latest configure, status)
    setup_failure: Option<(usize, Status)>,
    setups_since_configure: usize,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `name` resolvable with the given attributes.
    ///
    /// A `max_threads_per_block` of 0 means the block size is not checked.
    pub fn register_kernel(&mut self, name: impl Into<String>, attrs: FunctionAttributes) {
        self.kernels.insert(
            name.into(),
            KernelEntry {
                attrs,
                cache_config: CacheConfig::PreferNone,
            },
        );
    }

    /// The next call of `kind` returns `code` instead of running.
    pub fn fail_next(&mut self, kind: CallKind, code: Status) {
        self.injected.insert(kind, code);
    }

    /// The `index`-th `setup_argument` call after the latest configure
    /// (0-based) returns `code`.
    pub fn fail_setup_argument_at(&mut self, index: usize, code: Status) {
        self.setup_failure = Some((index, code));
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn setup_argument_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| c.kind() == CallKind::SetupArgument)
            .count()
    }

    pub fn launches(&self) -> &[LaunchRecord] {
        &self.launches
    }

    /// Parameter buffer staged for the pending launch.
    pub fn param_bytes(&self) -> &[u8] {
        &self.params
    }

    pub fn has_pending_configuration(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cache_config(&self, kernel: &str) -> Option<CacheConfig> {
        self.kernels.get(kernel).map(|k| k.cache_config)
    }

    fn injected(&mut self, kind: CallKind) -> Option<Status> {
        self.injected.remove(&kind)
    }
}

impl RuntimeApi for RecordingRuntime {
    fn configure_call(
        &mut self,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: usize,
        stream: StreamHandle,
    ) -> Status {
        self.calls.push(Call::ConfigureCall {
            grid,
            block,
            shared_mem_bytes,
            stream,
        });
        if let Some(code) = self.injected(CallKind::ConfigureCall) {
            return code;
        }
        if grid.volume() == 0 || block.volume() == 0 {
            return status::INVALID_CONFIGURATION;
        }

        self.pending = Some(PendingCall {
            grid,
            block,
            shared_mem_bytes,
            stream,
        });
        self.params.clear();
        self.setups_since_configure = 0;
        SUCCESS
    }

    fn setup_argument(&mut self, arg: &[u8], offset: usize) -> Status {
        self.calls.push(Call::SetupArgument {
            offset,
            size: arg.len(),
        });
        let nth = self.setups_since_configure;
        self.setups_since_configure += 1;

        if let Some(code) = self.injected(CallKind::SetupArgument) {
            return code;
        }
        if let Some((index, code)) = self.setup_failure {
            if index == nth {
                self.setup_failure = None;
                return code;
            }
        }
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
        SUCCESS
    }

    fn launch(&mut self, kernel: &str) -> Status {
        self.calls.push(Call::Launch {
            kernel: kernel.to_string(),
        });
        if let Some(code) = self.injected(CallKind::Launch) {
            return code;
        }
        let Some(pending) = self.pending else {
            return status::MISSING_CONFIGURATION;
        };
        let Some(entry) = self.kernels.get(kernel) else {
            return status::INVALID_DEVICE_FUNCTION;
        };
        let max_threads = entry.attrs.max_threads_per_block as u64;
        if max_threads > 0 && pending.block.volume() > max_threads {
            return status::LAUNCH_OUT_OF_RESOURCES;
        }

        self.pending = None;
        let params = std::mem::take(&mut self.params);
        debug!(
            "Dry-run launch of {} with {} parameter bytes",
            kernel,
            params.len()
        );
        self.launches.push(LaunchRecord {
            kernel: kernel.to_string(),
            grid: pending.grid,
            block: pending.block,
            shared_mem_bytes: pending.shared_mem_bytes,
            stream: pending.stream,
            params,
        });
        SUCCESS
    }

    fn func_get_attributes(&mut self, attrs: &mut FunctionAttributes, kernel: &str) -> Status {
        self.calls.push(Call::FuncGetAttributes {
            kernel: kernel.to_string(),
        });
        if let Some(code) = self.injected(CallKind::FuncGetAttributes) {
            return code;
        }
        match self.kernels.get(kernel) {
            Some(entry) => {
                *attrs = entry.attrs;
                SUCCESS
            }
            None => status::INVALID_DEVICE_FUNCTION,
        }
    }

    fn func_set_cache_config(&mut self, kernel: &str, config: CacheConfig) -> Status {
        self.calls.push(Call::FuncSetCacheConfig {
            kernel: kernel.to_string(),
            config,
        });
        if let Some(code) = self.injected(CallKind::FuncSetCacheConfig) {
            return code;
        }
        match self.kernels.get_mut(kernel) {
            Some(entry) => {
                entry.cache_config = config;
                SUCCESS
            }
            None => status::INVALID_DEVICE_FUNCTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(max_threads: u32) -> FunctionAttributes {
        FunctionAttributes {
            max_threads_per_block: max_threads,
            ..Default::default()
        }
    }

    #[test]
    fn test_launch_without_configuration() {
        let mut rt = RecordingRuntime::new();
        rt.register_kernel("k", limited(0));
        assert_eq!(rt.launch("k"), status::MISSING_CONFIGURATION);
    }

    #[test]
    fn test_setup_without_configuration() {
        let mut rt = RecordingRuntime::new();
        assert_eq!(rt.setup_argument(&[0; 4], 0), status::MISSING_CONFIGURATION);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let mut rt = RecordingRuntime::new();
        let code = rt.configure_call(Dim3::new(1, 0, 1), Dim3::linear(1), 0, StreamHandle::DEFAULT);
        assert_eq!(code, status::INVALID_CONFIGURATION);
        assert!(!rt.has_pending_configuration());
    }

    #[test]
    fn test_block_larger_than_kernel_limit() {
        let mut rt = RecordingRuntime::new();
        rt.register_kernel("k", limited(256));
        rt.configure_call(Dim3::linear(1), Dim3::new(16, 32, 1), 0, StreamHandle::DEFAULT);
        assert_eq!(rt.launch("k"), status::LAUNCH_OUT_OF_RESOURCES);
        // The configuration survives a rejected launch.
        assert!(rt.has_pending_configuration());
    }

    #[test]
    fn test_params_written_at_offsets() {
        let mut rt = RecordingRuntime::new();
        rt.register_kernel("k", limited(0));
        rt.configure_call(Dim3::linear(1), Dim3::linear(1), 0, StreamHandle::DEFAULT);
        assert_eq!(rt.setup_argument(&[1, 2, 3, 4], 8), SUCCESS);
        assert_eq!(rt.setup_argument(&[9, 9, 9, 9], 0), SUCCESS);
        assert_eq!(rt.launch("k"), SUCCESS);

        let record = &rt.launches()[0];
        assert_eq!(record.params, vec![9, 9, 9, 9, 0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(rt.param_bytes().is_empty());
        assert!(!rt.has_pending_configuration());
    }

    #[test]
    fn test_overflowing_offset_rejected() {
        let mut rt = RecordingRuntime::new();
        rt.configure_call(Dim3::linear(1), Dim3::linear(1), 0, StreamHandle::DEFAULT);
        assert_eq!(rt.setup_argument(&[0; 4], usize::MAX - 1), status::INVALID_VALUE);
        assert!(rt.param_bytes().is_empty());
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let mut rt = RecordingRuntime::new();
        rt.fail_next(CallKind::ConfigureCall, status::INITIALIZATION_ERROR);
        let first = rt.configure_call(Dim3::linear(1), Dim3::linear(1), 0, StreamHandle::DEFAULT);
        let second = rt.configure_call(Dim3::linear(1), Dim3::linear(1), 0, StreamHandle::DEFAULT);
        assert_eq!(first, status::INITIALIZATION_ERROR);
        assert_eq!(second, SUCCESS);
        assert_eq!(rt.calls().len(), 2);
    }

    #[test]
    fn test_call_log_serializes() {
        let mut rt = RecordingRuntime::new();
        rt.setup_argument(&[0; 8], 16);
        let json = serde_json::to_value(&rt.calls()[0]).unwrap();
        assert_eq!(json["call"], "setup_argument");
        assert_eq!(json["offset"], 16);
        assert_eq!(json["size"], 8);
    }
}
