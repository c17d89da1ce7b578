// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! C3: the address map. Pure, side-effect-free lookups over a cached
//! [`DeviceInfo`] — no I/O, no state of its own.

use tapasco_abi::{reg, DeviceInfo, ErrorCode};

/// Named PE control register, per `spec.md` §6's bit-exact layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NamedRegister {
    Ctrl,
    Gier,
    Ier,
    Iar,
    Ret,
}

impl NamedRegister {
    const fn offset(self) -> u64 {
        match self {
            NamedRegister::Ctrl => reg::CTRL,
            NamedRegister::Gier => reg::GIER,
            NamedRegister::Ier => reg::IER,
            NamedRegister::Iar => reg::IAR,
            NamedRegister::Ret => reg::RET,
        }
    }
}

/// Well-known base for the `Status` platform component when the status
/// descriptor itself does not publish one (`spec.md` §4.3).
pub const DEFAULT_STATUS_BASE: u64 = 0x0000;

/// `slot_base(s) = arch[s]`; fails if `s` does not name a populated PE slot
/// (`spec.md` §4.3).
pub fn slot_base(info: &DeviceInfo, slot: usize) -> Result<u64, ErrorCode> {
    if !info.composition.is_pe_slot(slot) {
        return Err(ErrorCode::InvalidSlotId);
    }
    info.base
        .arch
        .get(slot)
        .copied()
        .ok_or(ErrorCode::InvalidSlotId)
}

/// `arg_register(s, i) = slot_base(s) + 0x20 + i*0x10`.
pub fn arg_register(info: &DeviceInfo, slot: usize, index: usize) -> Result<u64, ErrorCode> {
    let base = slot_base(info, slot)?;
    Ok(base + reg::ARG_BASE + (index as u64) * reg::ARG_STRIDE)
}

/// `named_register(s, reg) = slot_base(s) + offset(reg)`.
pub fn named_register(
    info: &DeviceInfo,
    slot: usize,
    register: NamedRegister,
) -> Result<u64, ErrorCode> {
    let base = slot_base(info, slot)?;
    Ok(base + register.offset())
}

/// `component_base(c) = platform[c]`, with a well-known fallback base for
/// `"Status"`.
pub fn component_base(info: &DeviceInfo, component: &str) -> Result<u64, ErrorCode> {
    if let Some(base) = info.base.platform.get(component) {
        return Ok(*base);
    }
    if component == "Status" {
        return Ok(DEFAULT_STATUS_BASE);
    }
    Err(ErrorCode::InvalidAddress)
}
