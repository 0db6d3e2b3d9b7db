//! # Stream Selection
//!
//! Launches are queued on an execution stream. The stream itself is owned
//! elsewhere; this module only deals with turning whatever the caller passed
//! into the raw handle the native layer expects.

use serde::{Deserialize, Serialize};

/// Raw native stream handle. Zero is the default stream.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    /// The device's default (legacy) stream.
    pub const DEFAULT: StreamHandle = StreamHandle(0);

    /// Whether this is the default stream.
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

/// Anything that wraps a native stream.
pub trait NativeStream {
    /// Underlying native handle.
    fn raw_handle(&self) -> StreamHandle;
}

impl NativeStream for StreamHandle {
    fn raw_handle(&self) -> StreamHandle {
        *self
    }
}

/// The stream argument of a launch configuration.
///
/// `Unrecognized` holds values that came from a loosely-typed source (a
/// launch plan, the command line) and do not name a stream. They resolve to
/// the default stream instead of failing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StreamSelector {
    #[default]
    Default,
    Native(StreamHandle),
    Unrecognized(String),
}

impl StreamSelector {
    /// Builds a selector from a stream object.
    pub fn from_stream<S: NativeStream + ?Sized>(stream: &S) -> Self {
        StreamSelector::Native(stream.raw_handle())
    }

    /// Interprets a JSON value from a launch plan.
    ///
    /// `null` and `"default"` select the default stream; every other value is
    /// kept as `Unrecognized`.
    pub fn from_plan_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StreamSelector::Default,
            serde_json::Value::String(s) if s.eq_ignore_ascii_case("default") => {
                StreamSelector::Default
            }
            other => StreamSelector::Unrecognized(other.to_string()),
        }
    }

    /// Resolves the selector to the handle passed to the native layer.
    pub fn resolve(&self) -> StreamHandle {
        match self {
            StreamSelector::Default => StreamHandle::DEFAULT,
            StreamSelector::Native(handle) => *handle,
            StreamSelector::Unrecognized(value) => {
                tracing::warn!(
                    "Stream value {} is not a stream handle, launching on the default stream",
                    value
                );
                StreamHandle::DEFAULT
            }
        }
    }
}

impl From<StreamHandle> for StreamSelector {
    fn from(handle: StreamHandle) -> Self {
        StreamSelector::Native(handle)
    }
}

impl<S: NativeStream> From<Option<&S>> for StreamSelector {
    fn from(stream: Option<&S>) -> Self {
        stream.map_or(StreamSelector::Default, StreamSelector::from_stream)
    }
}
