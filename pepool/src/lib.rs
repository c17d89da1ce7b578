// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! C5: the PE pool. Groups discovered PEs by kernel id and hands them out
//! under a blocking, fair-as-the-queue-allows discipline (`spec.md` §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

use tapasco_abi::{reg, ErrorCode, KernelId};
use tapasco_addrmap::{named_register, NamedRegister};
use tapasco_transport::{BusAddr, Transport};

const IDLE: u8 = 0;
const BUSY: u8 = 1;

struct PeRecord {
    kernel_id: KernelId,
    state: AtomicU8,
}

/// A FIFO of Idle slot indices that doubles as a counting semaphore: its
/// length is the count, and pushing wakes exactly one blocked popper.
#[derive(Default)]
struct KernelGroup {
    queue: Mutex<VecDeque<usize>>,
    cv: Condvar,
}

impl KernelGroup {
    fn push(&self, slot: usize) {
        self.queue.lock().unwrap().push_back(slot);
        self.cv.notify_one();
    }

    fn pop_blocking(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        while queue.is_empty() {
            queue = self.cv.wait(queue).unwrap();
        }
        queue.pop_front().unwrap()
    }
}

/// One device's PE pool. `pes[s]` is populated iff slot `s` is PE-bearing.
pub struct PePool {
    pes: Vec<Option<PeRecord>>,
    groups: HashMap<KernelId, KernelGroup>,
}

impl PePool {
    /// Walks the composition, builds one kernel group per distinct kernel
    /// id, and performs one-time per-PE interrupt setup: `GIER=1`,
    /// `IER=1`, read-then-ack `IAR` (`spec.md` §4.5).
    pub fn new(info: &tapasco_abi::DeviceInfo, transport: &dyn Transport) -> Result<Self, ErrorCode> {
        let mut pes: Vec<Option<PeRecord>> = (0..tapasco_abi::MAX_SLOTS).map(|_| None).collect();
        let mut groups: HashMap<KernelId, KernelGroup> = HashMap::new();

        for slot in 0..tapasco_abi::MAX_SLOTS {
            if !info.composition.is_pe_slot(slot) {
                continue;
            }
            let kernel_id = info.composition.kernel[slot];
            pes[slot] = Some(PeRecord {
                kernel_id,
                state: AtomicU8::new(IDLE),
            });
            groups.entry(kernel_id).or_default().push(slot);

            setup_interrupts(info, transport, slot)?;
        }

        Ok(PePool { pes, groups })
    }

    /// Blocks until a PE of `kernel_id` is Idle, then transitions it
    /// Idle→Busy and returns its slot.
    pub fn acquire(&self, kernel_id: KernelId) -> Result<usize, ErrorCode> {
        let group = self.groups.get(&kernel_id).ok_or(ErrorCode::PeUnavailable)?;
        let slot = group.pop_blocking();
        let pe = self.pes[slot].as_ref().expect("group only holds PE-bearing slots");
        pe.state
            .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
            .expect("slot popped from the Idle queue must itself be Idle");
        Ok(slot)
    }

    /// Transitions `slot` Busy→Idle and returns it to its kernel group.
    /// Releasing an already-Idle slot is a programming error.
    pub fn release(&self, slot: usize) -> Result<(), ErrorCode> {
        let pe = self
            .pes
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(ErrorCode::InvalidSlotId)?;
        pe.state
            .compare_exchange(BUSY, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ErrorCode::InvalidSlotId)?;
        self.groups
            .get(&pe.kernel_id)
            .expect("every populated PE has a group")
            .push(slot);
        Ok(())
    }

    /// Number of PEs implementing `kernel_id` (observability only).
    pub fn count(&self, kernel_id: KernelId) -> usize {
        self.pes
            .iter()
            .flatten()
            .filter(|p| p.kernel_id == kernel_id)
            .count()
    }
}

fn setup_interrupts(
    info: &tapasco_abi::DeviceInfo,
    transport: &dyn Transport,
    slot: usize,
) -> Result<(), ErrorCode> {
    let write_word = |register, value: u32| -> Result<(), ErrorCode> {
        let addr = named_register(info, slot, register).map_err(|_| ErrorCode::InvalidSlotId)?;
        transport
            .write_ctl(BusAddr(addr), &value.to_le_bytes())
            .map_err(|_| ErrorCode::PlatformFailure)
    };
    write_word(NamedRegister::Gier, reg::GIER_ENABLE)?;
    write_word(NamedRegister::Ier, reg::IER_AP_DONE)?;

    let iar_addr = named_register(info, slot, NamedRegister::Iar).map_err(|_| ErrorCode::InvalidSlotId)?;
    let mut pending = [0u8; 4];
    transport
        .read_ctl(BusAddr(iar_addr), &mut pending)
        .map_err(|_| ErrorCode::PlatformFailure)?;
    write_word(NamedRegister::Iar, reg::IAR_ACK)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tapasco_abi::{BaseMap, Capabilities, Clocks, Composition, Versions};
    use tapasco_transport::sim::SimTransport;
    use tapasco_transport::AddressRange;

    fn info_with_two_pes_of_kernel(kernel: u32) -> tapasco_abi::DeviceInfo {
        let mut composition = Composition::empty();
        composition.kernel[0] = KernelId::from(kernel);
        composition.kernel[1] = KernelId::from(kernel);
        let mut arch = vec![0u64; tapasco_abi::MAX_SLOTS];
        arch[0] = 0x1000;
        arch[1] = 0x2000;
        tapasco_abi::DeviceInfo {
            magic: tapasco_abi::STATUS_MAGIC,
            composition,
            base: BaseMap {
                arch,
                platform: Default::default(),
            },
            versions: Versions::default(),
            clocks: Clocks::default(),
            capabilities: Capabilities::empty(),
        }
    }

    fn sim() -> Arc<SimTransport> {
        SimTransport::new(AddressRange::new(0, 0x1_0000), AddressRange::new(0x1_0000, 0x1000), 1 << 20)
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let transport = sim();
        let info = info_with_two_pes_of_kernel(10);
        let pool = PePool::new(&info, transport.as_ref()).unwrap();
        assert_eq!(pool.count(KernelId::from(10)), 2);

        let a = pool.acquire(KernelId::from(10)).unwrap();
        let b = pool.acquire(KernelId::from(10)).unwrap();
        assert_ne!(a, b);
        pool.release(a).unwrap();
        pool.release(b).unwrap();
    }

    #[test]
    fn releasing_idle_pe_is_a_programming_error() {
        let transport = sim();
        let info = info_with_two_pes_of_kernel(10);
        let pool = PePool::new(&info, transport.as_ref()).unwrap();
        let slot = pool.acquire(KernelId::from(10)).unwrap();
        pool.release(slot).unwrap();
        assert_eq!(pool.release(slot), Err(ErrorCode::InvalidSlotId));
    }

    #[test]
    fn unknown_kernel_is_unavailable() {
        let transport = sim();
        let info = info_with_two_pes_of_kernel(10);
        let pool = PePool::new(&info, transport.as_ref()).unwrap();
        assert_eq!(pool.acquire(KernelId::from(99)), Err(ErrorCode::PeUnavailable));
    }
}
