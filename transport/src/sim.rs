// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! In-memory transport used by tests and by anything exercising the seed
//! scenarios from `spec.md` §8 without real hardware. A "PE behavior" can be
//! registered per slot to emulate what a real accelerator would do once its
//! `CTRL` register is started: read its own argument registers, touch
//! device memory, write `RET`, and eventually complete.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use tapasco_abi::reg;

use crate::{AddressRange, AllocFlags, BusAddr, DevAddr, Transport, TransportError};

type Behavior = dyn Fn(&SimTransport, u16) + Send + Sync;

struct SimState {
    ctl: HashMap<u64, u8>,
    mem: Vec<u8>,
    free_list: Vec<(u64, u64)>,
    live_allocs: HashMap<u64, u64>,
    mem_cursor: u64,
    completions: VecDeque<u16>,
    slot_bases: HashMap<u64, u16>,
    behaviors: HashMap<u16, Arc<Behavior>>,
}

/// A fake device, good enough to drive the launch/finish protocol end to
/// end in tests.
pub struct SimTransport {
    state: Mutex<SimState>,
    cv: Condvar,
    self_weak: Mutex<Weak<SimTransport>>,
    arch_range: AddressRange,
    platform_range: AddressRange,
}

impl SimTransport {
    pub fn new(arch_range: AddressRange, platform_range: AddressRange, mem_size: u64) -> Arc<Self> {
        let t = Arc::new(SimTransport {
            state: Mutex::new(SimState {
                ctl: HashMap::new(),
                mem: vec![0u8; mem_size as usize],
                free_list: Vec::new(),
                live_allocs: HashMap::new(),
                mem_cursor: 0,
                completions: VecDeque::new(),
                slot_bases: HashMap::new(),
                behaviors: HashMap::new(),
            }),
            cv: Condvar::new(),
            self_weak: Mutex::new(Weak::new()),
            arch_range,
            platform_range,
        });
        *t.self_weak.lock().unwrap() = Arc::downgrade(&t);
        t
    }

    /// Register slot `slot` at `slot_base` with a behavior run (on a
    /// dedicated thread) whenever `CTRL` is started. Real PE semantics
    /// (arrayinit writes, arraysum reduces, ...) live in test code, not
    /// here.
    pub fn register_pe(
        &self,
        slot_base: BusAddr,
        slot: u16,
        behavior: impl Fn(&SimTransport, u16) + Send + Sync + 'static,
    ) {
        let mut st = self.state.lock().unwrap();
        st.slot_bases.insert(slot_base.0, slot);
        st.behaviors.insert(slot, Arc::new(behavior));
    }

    fn post_completion(&self, slot: u16) {
        let mut st = self.state.lock().unwrap();
        st.completions.push_back(slot);
        self.cv.notify_all();
    }

    fn write_ctl_bytes(st: &mut SimState, addr: u64, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            st.ctl.insert(addr + i as u64, *b);
        }
    }

    fn read_ctl_bytes(st: &SimState, addr: u64, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *st.ctl.get(&(addr + i as u64)).unwrap_or(&0);
        }
    }
}

impl Transport for SimTransport {
    fn alloc(&self, len: usize, _flags: AllocFlags) -> Result<DevAddr, TransportError> {
        let mut st = self.state.lock().unwrap();
        let len = len as u64;
        let addr = if let Some(pos) = st.free_list.iter().position(|&(_, l)| l >= len) {
            st.free_list.remove(pos).0
        } else {
            let addr = st.mem_cursor;
            let end = addr + len;
            if end > st.mem.len() as u64 {
                return Err(TransportError::OutOfMemory);
            }
            st.mem_cursor = end;
            addr
        };
        st.live_allocs.insert(addr, len);
        Ok(DevAddr(addr))
    }

    fn dealloc(&self, addr: DevAddr, _flags: AllocFlags) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        if let Some(len) = st.live_allocs.remove(&addr.0) {
            st.free_list.push((addr.0, len));
        }
        Ok(())
    }

    fn read_mem(&self, addr: DevAddr, buf: &mut [u8]) -> Result<(), TransportError> {
        let st = self.state.lock().unwrap();
        let start = addr.0 as usize;
        let end = start + buf.len();
        if end > st.mem.len() {
            return Err(TransportError::Failure(libc::EFAULT));
        }
        buf.copy_from_slice(&st.mem[start..end]);
        Ok(())
    }

    fn write_mem(&self, addr: DevAddr, buf: &[u8]) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        let start = addr.0 as usize;
        let end = start + buf.len();
        if end > st.mem.len() {
            return Err(TransportError::Failure(libc::EFAULT));
        }
        st.mem[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn read_ctl(&self, addr: BusAddr, buf: &mut [u8]) -> Result<(), TransportError> {
        crate::validate_ctl_access(self, addr, buf.len())?;
        let st = self.state.lock().unwrap();
        Self::read_ctl_bytes(&st, addr.0, buf);
        Ok(())
    }

    fn write_ctl(&self, addr: BusAddr, buf: &[u8]) -> Result<(), TransportError> {
        crate::validate_ctl_access(self, addr, buf.len())?;
        let (slot, behavior) = {
            let mut st = self.state.lock().unwrap();
            Self::write_ctl_bytes(&mut st, addr.0, buf);

            let mut started = None;
            if buf.len() == 4 && u32::from_le_bytes(buf.try_into().unwrap()) & reg::CTRL_START != 0
            {
                for (&base, &slot) in &st.slot_bases {
                    if addr.0 == base + reg::CTRL {
                        started = Some(slot);
                        break;
                    }
                }
            }
            match started {
                Some(slot) => (Some(slot), st.behaviors.get(&slot).cloned()),
                None => (None, None),
            }
        };

        if let Some(slot) = slot {
            let weak = self.self_weak.lock().unwrap().clone();
            thread::spawn(move || {
                if let Some(strong) = weak.upgrade() {
                    if let Some(b) = behavior {
                        b(&strong, slot);
                    }
                    strong.post_completion(slot);
                }
            });
        }
        Ok(())
    }

    fn arch_range(&self) -> AddressRange {
        self.arch_range
    }

    fn platform_range(&self) -> AddressRange {
        self.platform_range
    }

    fn completion_events(&self) -> Box<dyn Iterator<Item = Result<u16, TransportError>> + Send> {
        // The iterator only needs to outlive the collector thread that owns
        // it, so it is fine for it to hold an `Arc` back to this transport
        // even though `Transport::completion_events` takes `&self`.
        let strong = self
            .self_weak
            .lock()
            .unwrap()
            .upgrade()
            .expect("SimTransport must be held behind an Arc");
        Box::new(CompletionStream { transport: strong })
    }
}

struct CompletionStream {
    transport: Arc<SimTransport>,
}

impl Iterator for CompletionStream {
    type Item = Result<u16, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut st = self.transport.state.lock().unwrap();
        while st.completions.is_empty() {
            st = self.transport.cv.wait(st).unwrap();
        }
        Some(Ok(st.completions.pop_front().unwrap()))
    }
}
