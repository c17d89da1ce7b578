// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! The immutable device-wide data model produced once by the status reader
//! (C2) and consumed read-only by every other component (`spec.md` §3).

use crate::{Capabilities, KernelId, MAX_SLOTS};
use std::collections::HashMap;

/// The static map from slot index to (kernel id, local-memory size).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Composition {
    /// `kernel[s]`: `KernelId::NONE` for an empty or memory-bearing slot.
    pub kernel: Vec<KernelId>,
    /// `memory[s]`: local-memory size in bytes; `0` for PE-bearing slots
    /// without a scratchpad and for empty slots.
    pub memory: Vec<u32>,
}

impl Composition {
    pub fn empty() -> Self {
        Composition {
            kernel: vec![KernelId::NONE; MAX_SLOTS],
            memory: vec![0; MAX_SLOTS],
        }
    }

    /// True if slot `s` holds a schedulable PE (kernel id present, slot is
    /// not itself a memory-only entry).
    pub fn is_pe_slot(&self, s: usize) -> bool {
        self.kernel.get(s).map(|k| !k.is_none()).unwrap_or(false)
    }

    /// Local-memory size declared for PE slot `s`, or `0`.
    pub fn memory_of(&self, s: usize) -> u32 {
        self.memory.get(s).copied().unwrap_or(0)
    }
}

/// Bus addresses for every populated slot and every known platform
/// component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BaseMap {
    /// `arch[s]`: bus address of slot `s`'s register window.
    pub arch: Vec<u64>,
    /// `platform[name]`: bus address of a named platform component.
    pub platform: HashMap<String, u64>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Versions {
    pub tapasco: u32,
    pub vivado: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Clocks {
    pub host_mhz: u32,
    pub design_mhz: u32,
    pub memory_mhz: u32,
}

/// Everything the status reader discovers about a device, cached and
/// immutable for the lifetime of the device context (`spec.md` §3,
/// invariant 5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub magic: u32,
    pub composition: Composition,
    pub base: BaseMap,
    pub versions: Versions,
    pub clocks: Clocks,
    pub capabilities: Capabilities,
}

impl DeviceInfo {
    /// Number of PE-bearing slots of a given kernel id.
    pub fn count_of_kernel(&self, kernel_id: KernelId) -> usize {
        self.composition
            .kernel
            .iter()
            .filter(|&&k| k == kernel_id)
            .count()
    }
}
