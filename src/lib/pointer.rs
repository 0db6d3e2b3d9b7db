//! Device pointer arguments.

use std::ffi::c_void;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Size in bytes of a pointer on the host platform.
pub const POINTER_SIZE: usize = std::mem::size_of::<*const c_void>();

/// Anything that refers to device (or pinned host) memory.
pub trait DeviceAddress {
    /// Raw address as seen by the device.
    fn device_address(&self) -> u64;
}

/// An opaque device address passed to a kernel by value.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn from_address<A: DeviceAddress + ?Sized>(buffer: &A) -> Self {
        DevicePtr(buffer.device_address())
    }

    /// Native-endian bytes of the address, exactly [`POINTER_SIZE`] long.
    pub fn to_ne_bytes(self) -> Vec<u8> {
        // Truncation only matters on 32-bit hosts, where device addresses
        // fit in a pointer anyway.
        (self.0 as usize).to_ne_bytes().to_vec()
    }
}

impl DeviceAddress for DevicePtr {
    fn device_address(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}
