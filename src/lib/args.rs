//! # Kernel Argument Marshaling
//!
//! Kernel parameters are passed to the driver as raw bytes placed at explicit
//! offsets inside a parameter buffer. This module decides how big each
//! argument is, where it goes, and issues one `setup_argument` call per
//! argument.
//!
//! ## Layout rule
//!
//! Every argument is aligned to its own size: 32-bit integers and floats to
//! 4 bytes, device pointers to the platform pointer size. The cursor starts at
//! zero for each marshaling pass and advances past each argument after it is
//! placed.
//!
//! ```text
//!   args:    i32      ptr (8 bytes)       f32
//!   offset:  0        8                   16
//!          +----+----+--------+--------+----+
//!          | a0 |pad |       a1        | a2 |
//!          +----+----+--------+--------+----+
//! ```

use std::fmt;
use std::str::FromStr;

use half::f16;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::align::align_up;
use crate::api::RuntimeApi;
use crate::error::{check, LaunchError, Result};
use crate::pointer::{DevicePtr, POINTER_SIZE};

/// A kernel argument of one of the kinds the launch protocol understands.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum KernelArg {
    Int(i32),
    Float(f32),
    Pointer(DevicePtr),
}

impl KernelArg {
    /// Size of the argument in the parameter buffer; doubles as its alignment.
    pub fn size(&self) -> usize {
        match self {
            KernelArg::Int(_) | KernelArg::Float(_) => 4,
            KernelArg::Pointer(_) => POINTER_SIZE,
        }
    }

    /// Raw native-endian bytes, exactly [`size`](Self::size) long.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            KernelArg::Int(v) => bytemuck::bytes_of(v).to_vec(),
            KernelArg::Float(v) => bytemuck::bytes_of(v).to_vec(),
            KernelArg::Pointer(p) => p.to_ne_bytes(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KernelArg::Int(_) => "i32",
            KernelArg::Float(_) => "f32",
            KernelArg::Pointer(_) => "ptr",
        }
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        KernelArg::Int(v)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        KernelArg::Float(v)
    }
}

impl From<DevicePtr> for KernelArg {
    fn from(p: DevicePtr) -> Self {
        KernelArg::Pointer(p)
    }
}

/// A loosely-typed host value, as found in launch plans and on the command
/// line. Only `i32`, `f32` and `ptr` can be passed to a kernel.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    /// Written as a plain number, like `f16:0.5` on the command line
    F16(#[serde(with = "f16_as_f32")] f16),
    F32(f32),
    F64(f64),
    Ptr(DevicePtr),
}

mod f16_as_f32 {
    use half::f16;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f32(value.to_f32())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f16, D::Error> {
        f32::deserialize(deserializer).map(f16::from_f32)
    }
}

impl HostValue {
    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::I8(_) => "i8",
            HostValue::I16(_) => "i16",
            HostValue::I32(_) => "i32",
            HostValue::I64(_) => "i64",
            HostValue::U32(_) => "u32",
            HostValue::U64(_) => "u64",
            HostValue::F16(_) => "f16",
            HostValue::F32(_) => "f32",
            HostValue::F64(_) => "f64",
            HostValue::Ptr(_) => "ptr",
        }
    }
}

impl TryFrom<HostValue> for KernelArg {
    /// Kind of the rejected value.
    type Error = &'static str;

    fn try_from(value: HostValue) -> std::result::Result<Self, Self::Error> {
        match value {
            HostValue::I32(v) => Ok(KernelArg::Int(v)),
            HostValue::F32(v) => Ok(KernelArg::Float(v)),
            HostValue::Ptr(p) => Ok(KernelArg::Pointer(p)),
            other => Err(other.kind()),
        }
    }
}

/// Converts a whole argument list, rejecting it if any element has an
/// unsupported kind.
pub fn to_kernel_args(values: &[HostValue]) -> Result<Vec<KernelArg>> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            KernelArg::try_from(*value).map_err(|kind| LaunchError::TypeMismatch { index, kind })
        })
        .collect()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseHostValueError {
    #[error("expected `kind:value`, got `{0}`")]
    MissingKind(String),
    #[error("unknown argument kind `{0}`")]
    UnknownKind(String),
    #[error("invalid {kind} value `{value}`")]
    InvalidValue { kind: String, value: String },
}

impl FromStr for HostValue {
    type Err = ParseHostValueError;

    /// Parses `kind:value`, e.g. `i32:-3`, `f32:0.5`, `ptr:0x7f0000001000`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| ParseHostValueError::MissingKind(s.to_string()))?;
        let kind = kind.trim().to_ascii_lowercase();
        let value = value.trim();
        let invalid = || ParseHostValueError::InvalidValue {
            kind: kind.clone(),
            value: value.to_string(),
        };

        let parsed = match kind.as_str() {
            "i8" => HostValue::I8(value.parse().map_err(|_| invalid())?),
            "i16" => HostValue::I16(value.parse().map_err(|_| invalid())?),
            "i32" => HostValue::I32(value.parse().map_err(|_| invalid())?),
            "i64" => HostValue::I64(value.parse().map_err(|_| invalid())?),
            "u32" => HostValue::U32(value.parse().map_err(|_| invalid())?),
            "u64" => HostValue::U64(value.parse().map_err(|_| invalid())?),
            "f16" => HostValue::F16(f16::from_f32(value.parse().map_err(|_| invalid())?)),
            "f32" => HostValue::F32(value.parse().map_err(|_| invalid())?),
            "f64" => HostValue::F64(value.parse().map_err(|_| invalid())?),
            "ptr" => {
                let addr = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => value.parse(),
                }
                .map_err(|_| invalid())?;
                HostValue::Ptr(DevicePtr(addr))
            }
            _ => return Err(ParseHostValueError::UnknownKind(kind)),
        };
        Ok(parsed)
    }
}

/// Placement of one argument in the parameter buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArgSlot {
    pub offset: usize,
    pub size: usize,
}

/// Parameter-buffer layout of an argument list, computed without the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArgLayout {
    slots: Vec<ArgSlot>,
}

impl ArgLayout {
    pub fn of(args: &[KernelArg]) -> Self {
        let mut cursor = 0;
        let slots = args
            .iter()
            .map(|arg| place(&mut cursor, arg.size()))
            .collect();
        Self { slots }
    }

    pub fn slots(&self) -> &[ArgSlot] {
        &self.slots
    }

    pub fn offsets(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.offset).collect()
    }

    /// Bytes spanned by the parameter buffer (end of the last argument).
    pub fn total_size(&self) -> usize {
        self.slots.last().map_or(0, |s| s.offset + s.size)
    }
}

/// Aligns the cursor to `size`, returns the slot and moves the cursor past it.
#[inline]
fn place(cursor: &mut usize, size: usize) -> ArgSlot {
    let offset = align_up(*cursor, size);
    *cursor = offset + size;
    ArgSlot { offset, size }
}

/// Stages `args` with the driver, one `setup_argument` call per argument.
///
/// Slots that were staged successfully are appended to `staged` even when a
/// later argument fails, so the caller can see how far the pass got.
pub fn marshal<A: RuntimeApi + ?Sized>(
    api: &mut A,
    args: &[KernelArg],
    staged: &mut Vec<ArgSlot>,
) -> Result<()> {
    let mut cursor = 0;
    for (index, arg) in args.iter().enumerate() {
        let bytes = arg.to_bytes();
        let slot = place(&mut cursor, bytes.len());
        check(api.setup_argument(&bytes, slot.offset))?;
        debug!(
            "Staged argument {} ({}) at offset {} ({} bytes)",
            index,
            arg.kind(),
            slot.offset,
            slot.size
        );
        staged.push(slot);
    }
    Ok(())
}

impl fmt::Display for KernelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Int(v) => write!(f, "i32:{}", v),
            KernelArg::Float(v) => write!(f, "f32:{}", v),
            KernelArg::Pointer(p) => write!(f, "ptr:{:#x}", p.0),
        }
    }
}
