// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! C1: the transport façade. Abstracts a single FPGA device's character file
//! (`/dev/tapasco*`) behind a small, thread-safe trait so the scheduler never
//! speaks `ioctl` directly. Two implementations are provided: [`device`] talks
//! to a real kernel driver, [`sim`] is an in-memory stand-in used by tests and
//! by the seed scenarios in `spec.md` §8.

pub mod device;
pub mod sim;

use std::fmt;

use tapasco_abi::MAX_SLOTS;

/// An address in device DRAM, as returned by [`Transport::alloc`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevAddr(pub u64);

/// An address on the control (MMIO) bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusAddr(pub u64);

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A half-open `[base, base+len)` window used to validate `read_ctl`/
/// `write_ctl` addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressRange {
    pub base: u64,
    pub len: u64,
}

impl AddressRange {
    pub const fn new(base: u64, len: u64) -> Self {
        AddressRange { base, len }
    }

    pub fn contains(&self, addr: BusAddr, access_len: usize) -> bool {
        let end = addr.0.saturating_add(access_len as u64);
        addr.0 >= self.base && end <= self.base + self.len
    }
}

/// Flags accepted by `alloc`/`dealloc`. Non-blocking copy is explicitly out
/// of scope (`spec.md` §9, Open Question 3), so this is presently empty but
/// kept as a named type at the API boundary rather than a bare `()`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocFlags;

/// Every transport call returns `Ok` or `TransportError`; the scheduler maps
/// all of these one-to-one onto `Error::Device(DeviceError::PlatformFailure)`
/// (`spec.md` §4.1).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("address {0} is outside the requested window")]
    InvalidAddress(BusAddr),
    #[error("transport call failed with code {0}")]
    Failure(i32),
}

/// The abstract device interface consumed by the scheduler. Implementations
/// must be safe to call from multiple threads concurrently; `read_ctl`/
/// `write_ctl` must be thread-safe per word (`spec.md` §4.1).
pub trait Transport: Send + Sync {
    fn alloc(&self, len: usize, flags: AllocFlags) -> Result<DevAddr, TransportError>;
    fn dealloc(&self, addr: DevAddr, flags: AllocFlags) -> Result<(), TransportError>;

    fn read_mem(&self, addr: DevAddr, buf: &mut [u8]) -> Result<(), TransportError>;
    fn write_mem(&self, addr: DevAddr, buf: &[u8]) -> Result<(), TransportError>;

    fn read_ctl(&self, addr: BusAddr, buf: &mut [u8]) -> Result<(), TransportError>;
    fn write_ctl(&self, addr: BusAddr, buf: &[u8]) -> Result<(), TransportError>;

    /// The window containing PE control registers.
    fn arch_range(&self) -> AddressRange;
    /// The window containing infrastructure components and the status
    /// descriptor.
    fn platform_range(&self) -> AddressRange;

    /// An infinite, blocking stream of completion slot ids, in
    /// device-notification order. Ids outside `[0, MAX_SLOTS)` signal a
    /// transport protocol error and are surfaced to the caller rather than
    /// silently dropped; [`scheduler`](../tapasco_scheduler) is the one that
    /// decides to log-and-skip them.
    fn completion_events(&self) -> Box<dyn Iterator<Item = Result<u16, TransportError>> + Send>;
}

/// Shared address-window validation used by every `Transport` impl: `buf.len`
/// must be a non-zero multiple of 4, and `addr` must land fully inside
/// `arch_range` or `platform_range`.
pub fn validate_ctl_access(
    t: &dyn Transport,
    addr: BusAddr,
    len: usize,
) -> Result<(), TransportError> {
    if len == 0 || len % 4 != 0 {
        return Err(TransportError::InvalidAddress(addr));
    }
    if t.arch_range().contains(addr, len) || t.platform_range().contains(addr, len) {
        Ok(())
    } else {
        Err(TransportError::InvalidAddress(addr))
    }
}

/// Validate that a completion slot id from the wire is in range.
pub fn validate_slot_id(raw: u32) -> Option<u16> {
    if (raw as usize) < MAX_SLOTS {
        Some(raw as u16)
    } else {
        None
    }
}
