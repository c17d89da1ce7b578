// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! Shared wire types, constants, and the error taxonomy for the TaPaSCo host
//! runtime. Every other crate in the workspace depends on this one and
//! nothing else, so it stays free of I/O.

use bitflags::bitflags;

mod info;
pub use info::{BaseMap, Clocks, Composition, DeviceInfo, Versions};

/// Sentinel written at the start of the on-chip status descriptor.
pub const STATUS_MAGIC: u32 = 0xE5AE_1337;

/// A `cap0` value that some older bitstreams leave behind from a dead
/// register; decoders must treat it as "no capabilities" rather than as a
/// real bitfield.
pub const CAP0_DEAD_VALUE: u32 = 0x1337_1337;

/// Build-time maximum number of PE slots (`N` in `spec.md`).
pub const MAX_SLOTS: usize = 128;

/// Build-time maximum number of argument slots per job (`A` in `spec.md`).
pub const MAX_ARGS: usize = 32;

/// Fixed capacity of the job-id pool (`Q` in `spec.md`).
pub const JOB_POOL_CAPACITY: usize = 250;

/// Offset added to a job-id-pool index to produce a host-visible job id.
/// Zero is reserved to mean "no job".
pub const JOB_ID_OFFSET: u32 = 1;

/// PE control-register layout, relative to a slot's base address
/// (`spec.md` §6, bit-exact).
pub mod reg {
    pub const CTRL: u64 = 0x00;
    pub const GIER: u64 = 0x04;
    pub const IER: u64 = 0x08;
    pub const IAR: u64 = 0x0C;
    pub const RET: u64 = 0x10;
    pub const ARG_BASE: u64 = 0x20;
    pub const ARG_STRIDE: u64 = 0x10;

    /// Offset of a PE's local-memory scratchpad within its own control
    /// window, past the last possible argument register (`MAX_ARGS` args
    /// at `ARG_STRIDE` bytes each, rounded up).
    pub const SCRATCHPAD_WINDOW: u64 = 0x1000;

    pub const CTRL_START: u32 = 1;
    pub const GIER_ENABLE: u32 = 1;
    pub const IER_AP_DONE: u32 = 1;
    pub const IAR_ACK: u32 = 1;
}

bitflags! {
    /// Capability bits published by the status descriptor's `cap0` field.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// PEs may carry a private local-memory scratchpad.
        const PE_LOCAL_MEM = 1 << 0;
        /// The address map may be re-derived at runtime rather than fixed
        /// at synthesis time.
        const DYNAMIC_ADDRESS_MAP = 1 << 1;
    }
}

impl Capabilities {
    /// Decode a raw `cap0` register value, filtering the known dead value.
    pub fn from_raw(raw: u32) -> Self {
        if raw == CAP0_DEAD_VALUE {
            Self::empty()
        } else {
            Self::from_bits_truncate(raw)
        }
    }
}

/// Numeric identifier for an accelerator kernel. Zero means "no kernel" /
/// "slot is empty".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelId(pub u32);

impl KernelId {
    pub const NONE: KernelId = KernelId(0);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for KernelId {
    fn from(v: u32) -> Self {
        KernelId(v)
    }
}

/// An index into the fixed PE slot table, `[0, MAX_SLOTS)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u16);

impl SlotId {
    pub fn new(index: usize) -> Option<Self> {
        if index < MAX_SLOTS {
            Some(SlotId(index as u16))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A host-visible job id, always `>= JOB_ID_OFFSET`. Zero is never a valid
/// `JobId` value; it is reserved to signal "no job" at the API boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u32);

impl JobId {
    /// Construct from a job-id-pool index (not a host-visible id).
    pub fn from_pool_index(index: usize) -> Self {
        JobId(index as u32 + JOB_ID_OFFSET)
    }

    /// The job-id-pool index this id was derived from, if it is in range.
    pub fn pool_index(self) -> Option<usize> {
        self.0.checked_sub(JOB_ID_OFFSET).map(|i| i as usize)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Direction of a host/device data transfer attached to a job argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    To,
    From,
    Both,
}

impl TransferDirection {
    pub const fn includes_to(self) -> bool {
        matches!(self, TransferDirection::To | TransferDirection::Both)
    }

    pub const fn includes_from(self) -> bool {
        matches!(self, TransferDirection::From | TransferDirection::Both)
    }
}

/// Where a transfer's device-side buffer lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    Global,
    PeLocal,
}

/// Access mode a transport is opened with (`spec.md` §6 supplement).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Sole control of the device; a second open fails with `DeviceBusy`.
    Exclusive,
    /// May coexist with other `Shared` opens.
    Shared,
    /// Read-only; mutating calls fail with `PlatformFailure`.
    Monitor,
}

/// The broad taxonomy every public error falls into (`spec.md` §7).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Resource,
    Lifecycle,
    Device,
    Config,
    Programming,
}

/// The verbatim error list from `spec.md` §6, shared by every layer so that
/// translation between components never loses information.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("no process context is available")]
    ContextNotAvailable,
    #[error("no matching device was found")]
    DeviceNotFound,
    #[error("device is already opened in an incompatible access mode")]
    DeviceBusy,
    #[error("out of device or local memory")]
    OutOfMemory,
    #[error("no job id is available")]
    NoJobIdAvailable,
    #[error("argument index out of range")]
    InvalidArgIndex,
    #[error("argument size must be 4 or 8 bytes")]
    InvalidArgSize,
    #[error("job id does not refer to a live job")]
    JobIdNotFound,
    #[error("no PE of the requested kernel is available")]
    PeUnavailable,
    #[error("transport call failed")]
    PlatformFailure,
    #[error("status core not found or magic mismatch")]
    StatusCoreNotFound,
    #[error("device and host runtime versions are incompatible")]
    VersionMismatch,
    #[error("slot id out of range")]
    InvalidSlotId,
    #[error("address lies outside the requested window")]
    InvalidAddress,
    #[error("kernel name does not match any known kernel id")]
    UnknownDevice,
}

impl ErrorCode {
    pub const fn kind(self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            InvalidArgIndex | InvalidArgSize => ErrorKind::Argument,
            OutOfMemory | NoJobIdAvailable | PeUnavailable => ErrorKind::Resource,
            JobIdNotFound => ErrorKind::Lifecycle,
            PlatformFailure | StatusCoreNotFound => ErrorKind::Device,
            VersionMismatch | UnknownDevice | DeviceNotFound | DeviceBusy
            | ContextNotAvailable => ErrorKind::Config,
            InvalidSlotId | InvalidAddress => ErrorKind::Programming,
        }
    }

    /// Stable numeric code, analogous to `drv_fpga_api::FpgaError`'s
    /// `From<FpgaError> for u16` mapping: high byte selects the kind, low
    /// byte distinguishes within it.
    pub const fn code(self) -> u16 {
        use ErrorCode::*;
        match self {
            ContextNotAvailable => 0x0100,
            DeviceNotFound => 0x0101,
            DeviceBusy => 0x0102,
            VersionMismatch => 0x0103,
            UnknownDevice => 0x0104,
            InvalidArgIndex => 0x0200,
            InvalidArgSize => 0x0201,
            OutOfMemory => 0x0300,
            NoJobIdAvailable => 0x0301,
            PeUnavailable => 0x0302,
            JobIdNotFound => 0x0400,
            PlatformFailure => 0x0500,
            StatusCoreNotFound => 0x0501,
            InvalidSlotId => 0x0600,
            InvalidAddress => 0x0601,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_round_trips_through_pool_index() {
        let id = JobId::from_pool_index(7);
        assert_eq!(id.raw(), 7 + JOB_ID_OFFSET);
        assert_eq!(id.pool_index(), Some(7));
    }

    #[test]
    fn capabilities_filters_dead_value() {
        assert_eq!(Capabilities::from_raw(CAP0_DEAD_VALUE), Capabilities::empty());
        assert_eq!(
            Capabilities::from_raw(0x1),
            Capabilities::PE_LOCAL_MEM
        );
    }

    #[test]
    fn error_code_kind_matches_taxonomy() {
        assert_eq!(ErrorCode::InvalidArgSize.kind(), ErrorKind::Argument);
        assert_eq!(ErrorCode::OutOfMemory.kind(), ErrorKind::Resource);
        assert_eq!(ErrorCode::JobIdNotFound.kind(), ErrorKind::Lifecycle);
        assert_eq!(ErrorCode::PlatformFailure.kind(), ErrorKind::Device);
        assert_eq!(ErrorCode::VersionMismatch.kind(), ErrorKind::Config);
        assert_eq!(ErrorCode::InvalidSlotId.kind(), ErrorKind::Programming);
    }
}
