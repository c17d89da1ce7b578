// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! C4: the local-memory allocator. One free-list arena per PE-bearing slot
//! that declares a scratchpad, independent of the global device-memory
//! allocator exposed by the transport.

use std::sync::Mutex;

use tapasco_abi::{DeviceInfo, ErrorCode};

/// One PE's private scratchpad, addressed in a flat local address space
/// that is the concatenation of every arena's range (`spec.md` §4.4).
struct Arena {
    pe_slot: usize,
    base: u64,
    size: u64,
    free_list: Mutex<Vec<(u64, u64)>>,
}

impl Arena {
    fn try_alloc(&self, size: u64) -> Option<u64> {
        let mut free = self.free_list.lock().unwrap();
        for i in 0..free.len() {
            let (offset, len) = free[i];
            if len >= size {
                if len == size {
                    free.remove(i);
                } else {
                    free[i] = (offset + size, len - size);
                }
                return Some(self.base + offset);
            }
        }
        None
    }

    fn free(&self, addr: u64, size: u64) {
        let offset = addr - self.base;
        self.free_list.lock().unwrap().push((offset, size));
    }

    fn bytes_free(&self) -> u64 {
        self.free_list.lock().unwrap().iter().map(|(_, l)| l).sum()
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// The per-device collection of scratchpad arenas, indexed by the owning
/// PE's slot id. The synthetic memory-bearing slot emitted by the status
/// decoder (`s+1`) never appears here directly; its size is folded into the
/// arena keyed on the PE slot `s` it belongs to.
pub struct LocalMem {
    arenas: Vec<Arena>,
}

impl LocalMem {
    /// Builds one arena per PE-bearing slot with a non-zero scratchpad,
    /// laid out back to back starting at address 0 in slot order.
    pub fn new(info: &DeviceInfo) -> Self {
        let mut arenas = Vec::new();
        let mut cursor = 0u64;
        for slot in 0..tapasco_abi::MAX_SLOTS {
            if !info.composition.is_pe_slot(slot) {
                continue;
            }
            let size = info.composition.memory_of(slot + 1) as u64;
            if size == 0 {
                continue;
            }
            arenas.push(Arena {
                pe_slot: slot,
                base: cursor,
                size,
                free_list: Mutex::new(vec![(0, size)]),
            });
            cursor += size;
        }
        LocalMem { arenas }
    }

    fn search_from(&self, slot_hint: usize) -> impl Iterator<Item = &Arena> {
        let start = self
            .arenas
            .iter()
            .position(|a| a.pe_slot >= slot_hint)
            .unwrap_or(self.arenas.len());
        self.arenas[start..].iter()
    }

    /// Allocates `size` bytes, preferring `slot_hint`'s own arena and
    /// spilling to the next PE-bearing arena on failure.
    pub fn alloc(&self, slot_hint: usize, size: u64) -> Result<u64, ErrorCode> {
        for arena in self.search_from(slot_hint) {
            if let Some(addr) = arena.try_alloc(size) {
                return Ok(addr);
            }
        }
        Err(ErrorCode::OutOfMemory)
    }

    /// Frees a previously allocated range. `slot_hint` narrows the search
    /// but any arena containing `addr` will do.
    pub fn dealloc(&self, slot_hint: usize, addr: u64, size: u64) {
        for arena in self.search_from(slot_hint) {
            if arena.contains(addr) {
                arena.free(addr, size);
                return;
            }
        }
        log::warn!("dealloc({addr:#x}) did not match any local-memory arena");
    }

    /// Reverse lookup from a local-memory address to its owning PE slot.
    pub fn slot_of(&self, addr: u64) -> Option<usize> {
        self.arenas
            .iter()
            .find(|a| a.contains(addr))
            .map(|a| a.pe_slot)
    }

    /// Base address of `slot`'s own arena in the flat local address space,
    /// used by callers that need to express an allocation as an
    /// arena-relative offset.
    pub fn arena_base(&self, slot: usize) -> Option<u64> {
        self.arenas.iter().find(|a| a.pe_slot == slot).map(|a| a.base)
    }

    pub fn bytes_total(&self, slot: usize) -> u64 {
        self.arenas
            .iter()
            .find(|a| a.pe_slot == slot)
            .map(|a| a.size)
            .unwrap_or(0)
    }

    pub fn bytes_free(&self, slot: usize) -> u64 {
        self.arenas
            .iter()
            .find(|a| a.pe_slot == slot)
            .map(Arena::bytes_free)
            .unwrap_or(0)
    }
}
