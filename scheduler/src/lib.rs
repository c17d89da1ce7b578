// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! C6: the scheduler and signaling subsystem. Owns the job table, drives
//! the per-job launch/finish protocol, and runs the single collector task
//! that demultiplexes completion events onto per-slot semaphores.

pub mod job;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tapasco_abi::{reg, DeviceInfo, ErrorCode, JobId, KernelId, Placement, TransferDirection};
use tapasco_addrmap::{arg_register, named_register, NamedRegister};
use tapasco_localmem::LocalMem;
use tapasco_pepool::PePool;
use tapasco_transport::{AllocFlags, BusAddr, DevAddr, Transport};

use job::{ArgSlot, JobState, JobTable, Transfer};

pub use job::HostBuffer;

/// A per-slot counting semaphore posted by the collector and drained by
/// `wait_for_slot`. Modeled as a queue rather than a bare counter so a
/// future latency callback can inspect arrival order.
#[derive(Default)]
struct CompletionSlot {
    pending: Mutex<VecDeque<()>>,
    cv: Condvar,
}

impl CompletionSlot {
    fn post(&self) {
        self.pending.lock().unwrap().push_back(());
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while pending.is_empty() {
            pending = self.cv.wait(pending).unwrap();
        }
        pending.pop_front();
    }
}

/// Callback invoked by the collector with each batch of newly-completed
/// slot ids, before the corresponding semaphores are posted
/// (`spec.md` §4.6: "to support latency counters").
pub type CompletionCallback = dyn Fn(&[u16]) + Send + Sync;

struct Collector {
    handle: Option<JoinHandle<()>>,
}

impl Collector {
    fn spawn(
        transport: Arc<dyn Transport>,
        completions: Arc<Vec<CompletionSlot>>,
        callback: Option<Arc<CompletionCallback>>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            for event in transport.completion_events() {
                match event {
                    Ok(slot) => {
                        if let Some(cb) = &callback {
                            cb(&[slot]);
                        }
                        match completions.get(slot as usize) {
                            Some(semaphore) => semaphore.post(),
                            None => log::warn!("collector: slot {slot} out of range, dropping"),
                        }
                    }
                    Err(err) => log::warn!("collector: transport error, skipping: {err}"),
                }
            }
        });
        Collector {
            handle: Some(handle),
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // The collector blocks forever on `completion_events()`; per
        // `spec.md` §5 cancellation is out of scope, so we detach rather
        // than join on teardown.
        self.handle.take();
    }
}

/// The device-wide scheduler: owns the PE pool, the local-memory
/// allocator, the job table, and the completion collector.
pub struct Scheduler {
    transport: Arc<dyn Transport>,
    info: DeviceInfo,
    pe_pool: PePool,
    local_mem: LocalMem,
    jobs: JobTable,
    completions: Arc<Vec<CompletionSlot>>,
    _collector: Collector,
}

impl Scheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        info: DeviceInfo,
        job_capacity: usize,
    ) -> Result<Self, ErrorCode> {
        Self::with_completion_callback(transport, info, job_capacity, None)
    }

    /// Like [`Scheduler::new`], additionally registering a callback that
    /// observes each batch of newly-completed slot ids before the matching
    /// semaphores are posted.
    pub fn with_completion_callback(
        transport: Arc<dyn Transport>,
        info: DeviceInfo,
        job_capacity: usize,
        callback: Option<Arc<CompletionCallback>>,
    ) -> Result<Self, ErrorCode> {
        let pe_pool = PePool::new(&info, transport.as_ref())?;
        let local_mem = LocalMem::new(&info);
        let completions: Arc<Vec<CompletionSlot>> = Arc::new(
            (0..tapasco_abi::MAX_SLOTS)
                .map(|_| CompletionSlot::default())
                .collect(),
        );
        let collector = Collector::spawn(transport.clone(), completions.clone(), callback);

        Ok(Scheduler {
            transport,
            info,
            pe_pool,
            local_mem,
            jobs: JobTable::new(job_capacity),
            completions,
            _collector: collector,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn acquire_job_id(&self, kernel_id: KernelId) -> Result<JobId, ErrorCode> {
        self.jobs.acquire_id(kernel_id)
    }

    pub fn release_job_id(&self, id: JobId) -> Result<(), ErrorCode> {
        self.jobs.release_id(id)
    }

    pub fn set_arg(&self, id: JobId, index: usize, value: u64, is64: bool) -> Result<(), ErrorCode> {
        if index >= tapasco_abi::MAX_ARGS {
            return Err(ErrorCode::InvalidArgIndex);
        }
        self.jobs.with_job(id, |job| {
            if job.state != JobState::Requested {
                return Err(ErrorCode::JobIdNotFound);
            }
            job.args[index] = ArgSlot {
                value,
                is64,
                transfer: None,
            };
            job.args_len = job.args_len.max(index + 1);
            Ok(())
        })
    }

    pub fn set_arg_transfer(
        &self,
        id: JobId,
        index: usize,
        host: HostBuffer,
        direction: TransferDirection,
        placement: Placement,
    ) -> Result<(), ErrorCode> {
        if index >= tapasco_abi::MAX_ARGS {
            return Err(ErrorCode::InvalidArgIndex);
        }
        self.jobs.with_job(id, |job| {
            if job.state != JobState::Requested {
                return Err(ErrorCode::JobIdNotFound);
            }
            if host.is_empty() {
                job.args[index] = ArgSlot::default();
            } else {
                job.args[index].transfer = Some(Transfer {
                    host,
                    direction,
                    placement,
                    device_handle: 0,
                    preloaded: false,
                });
            }
            job.args_len = job.args_len.max(index + 1);
            Ok(())
        })
    }

    pub fn return_value(&self, id: JobId) -> Result<u64, ErrorCode> {
        self.jobs.with_job(id, |job| Ok(job.return_value))
    }

    pub fn arg_value(&self, id: JobId, index: usize) -> Result<u64, ErrorCode> {
        if index >= tapasco_abi::MAX_ARGS {
            return Err(ErrorCode::InvalidArgIndex);
        }
        self.jobs.with_job(id, |job| Ok(job.args[index].value))
    }

    pub fn wait_for_slot(&self, slot: usize) {
        if let Some(semaphore) = self.completions.get(slot) {
            semaphore.wait();
        }
    }

    /// Waits for a non-blocking job's PE and runs the finish protocol. The
    /// host-facing "wait/collect a non-blocking job" operation from
    /// `spec.md` §6.
    pub fn collect(&self, id: JobId) -> Result<(), ErrorCode> {
        let slot = self.jobs.with_job(id, |job| job.slot.ok_or(ErrorCode::JobIdNotFound))?;
        self.wait_for_slot(slot);
        self.finish(id)
    }

    /// Runs the five-step launch protocol from `spec.md` §4.6. On success
    /// with `blocking = true` the job has already been waited on and
    /// finished; with `blocking = false` the caller must later call
    /// [`Scheduler::wait_for_slot`] and [`Scheduler::finish`].
    pub fn launch(&self, id: JobId, blocking: bool) -> Result<(), ErrorCode> {
        let kernel_id = self.jobs.with_job(id, |job| Ok(job.kernel_id))?;

        // Step 1: stage Global transfers ahead of PE acquisition.
        if let Err(err) = self.stage_global_transfers(id) {
            return Err(err);
        }

        // Step 2: acquire a PE; this may block.
        let slot = match self.pe_pool.acquire(kernel_id) {
            Ok(slot) => slot,
            Err(err) => {
                self.free_global_transfers(id);
                return Err(err);
            }
        };

        if let Err(err) = self.run_launch_after_acquire(id, slot) {
            self.unwind_launch_failure(id, slot);
            return Err(err);
        }

        if blocking {
            self.wait_for_slot(slot);
            self.finish(id)?;
        }
        Ok(())
    }

    fn stage_global_transfers(&self, id: JobId) -> Result<(), ErrorCode> {
        self.jobs.with_job(id, |job| {
            if job.state != JobState::Requested {
                return Err(ErrorCode::JobIdNotFound);
            }
            for slot in job.args.iter_mut().take(job.args_len) {
                let Some(transfer) = slot.transfer.as_mut() else {
                    continue;
                };
                if transfer.placement != Placement::Global {
                    continue;
                }
                let len = unsafe { transfer.host.as_slice() }.len();
                let addr = self
                    .transport
                    .alloc(len, AllocFlags::default())
                    .map_err(|_| ErrorCode::OutOfMemory)?;
                if transfer.direction.includes_to() {
                    let bytes = unsafe { transfer.host.as_slice() };
                    self.transport
                        .write_mem(addr, bytes)
                        .map_err(|_| ErrorCode::PlatformFailure)?;
                }
                transfer.device_handle = addr.0;
                transfer.preloaded = true;
            }
            Ok(())
        })
    }

    fn free_global_transfers(&self, id: JobId) {
        let _ = self.jobs.with_job(id, |job| {
            for slot in job.args.iter_mut().take(job.args_len) {
                if let Some(transfer) = slot.transfer.as_mut() {
                    if transfer.placement == Placement::Global && transfer.preloaded {
                        let _ = self.transport.dealloc(DevAddr(transfer.device_handle), AllocFlags::default());
                        transfer.preloaded = false;
                    }
                }
            }
            Ok(())
        });
    }

    fn run_launch_after_acquire(&self, id: JobId, slot: usize) -> Result<(), ErrorCode> {
        self.jobs.with_job(id, |job| {
            job.slot = Some(slot);
            job.state = JobState::Scheduled;

            for i in 0..job.args_len {
                let handle = if let Some(transfer) = job.args[i].transfer.as_mut() {
                    match transfer.placement {
                        Placement::Global => transfer.device_handle,
                        Placement::PeLocal => {
                            let len = unsafe { transfer.host.as_slice() }.len() as u64;
                            let addr = self
                                .local_mem
                                .alloc(slot, len)
                                .map_err(|_| ErrorCode::OutOfMemory)?;
                            if transfer.direction.includes_to() {
                                write_scratchpad(
                                    &self.info,
                                    self.transport.as_ref(),
                                    &self.local_mem,
                                    slot,
                                    addr,
                                    unsafe { transfer.host.as_slice() },
                                )?;
                            }
                            let base = self.local_mem.arena_base(slot).unwrap_or(0);
                            let relative = addr - base;
                            transfer.device_handle = relative;
                            transfer.preloaded = true;
                            relative
                        }
                    }
                } else {
                    job.args[i].value
                };

                let addr = arg_register(&self.info, slot, i).map_err(|_| ErrorCode::InvalidSlotId)?;
                let is64 = job.args[i].is64;
                write_arg_register(self.transport.as_ref(), addr, handle, is64)?;
            }

            job.state = JobState::Running;
            let ctrl = named_register(&self.info, slot, NamedRegister::Ctrl)
                .map_err(|_| ErrorCode::InvalidSlotId)?;
            self.transport
                .write_ctl(BusAddr(ctrl), &reg::CTRL_START.to_le_bytes())
                .map_err(|_| ErrorCode::PlatformFailure)?;
            Ok(())
        })
    }

    /// Failure after PE acquisition: release the PE, free any buffers
    /// already staged, and put the job back in `Requested` so the caller
    /// may retry or release it (`spec.md` §4.6 failure semantics).
    fn unwind_launch_failure(&self, id: JobId, slot: usize) {
        let _ = self.pe_pool.release(slot);
        let _ = self.jobs.with_job(id, |job| {
            for arg in job.args.iter_mut().take(job.args_len) {
                if let Some(transfer) = arg.transfer.as_mut() {
                    match transfer.placement {
                        Placement::Global if transfer.preloaded => {
                            let _ = self
                                .transport
                                .dealloc(DevAddr(transfer.device_handle), AllocFlags::default());
                            transfer.preloaded = false;
                        }
                        Placement::PeLocal if transfer.preloaded => {
                            let base = self.local_mem.arena_base(slot).unwrap_or(0);
                            let len = unsafe { transfer.host.as_slice() }.len() as u64;
                            self.local_mem.dealloc(slot, base + transfer.device_handle, len);
                            transfer.preloaded = false;
                        }
                        _ => {}
                    }
                }
            }
            job.state = JobState::Requested;
            job.slot = None;
            Ok(())
        });
    }

    /// Runs the four-step finish protocol. The caller must have already
    /// observed the slot's completion (via `wait_for_slot` or equivalent).
    pub fn finish(&self, id: JobId) -> Result<(), ErrorCode> {
        let slot = self.jobs.with_job(id, |job| job.slot.ok_or(ErrorCode::JobIdNotFound))?;

        let iar = named_register(&self.info, slot, NamedRegister::Iar).map_err(|_| ErrorCode::InvalidSlotId)?;
        self.transport
            .write_ctl(BusAddr(iar), &reg::IAR_ACK.to_le_bytes())
            .map_err(|_| ErrorCode::PlatformFailure)?;

        let ret_addr = named_register(&self.info, slot, NamedRegister::Ret).map_err(|_| ErrorCode::InvalidSlotId)?;
        let mut ret_buf = [0u8; 8];
        self.transport
            .read_ctl(BusAddr(ret_addr), &mut ret_buf)
            .map_err(|_| ErrorCode::PlatformFailure)?;

        self.jobs.with_job(id, |job| {
            job.return_value = u64::from_le_bytes(ret_buf);

            for i in 0..job.args_len {
                let addr = arg_register(&self.info, slot, i).map_err(|_| ErrorCode::InvalidSlotId)?;
                let is64 = job.args[i].is64;
                job.args[i].value = read_arg_register(self.transport.as_ref(), addr, is64)?;

                if let Some(transfer) = job.args[i].transfer.as_mut() {
                    if transfer.direction.includes_from() {
                        match transfer.placement {
                            Placement::Global => {
                                let bytes = unsafe { transfer.host.as_mut_slice() };
                                self.transport
                                    .read_mem(DevAddr(transfer.device_handle), bytes)
                                    .map_err(|_| ErrorCode::PlatformFailure)?;
                            }
                            Placement::PeLocal => {
                                let base = self.local_mem.arena_base(slot).unwrap_or(0);
                                let absolute = base + transfer.device_handle;
                                let bytes = unsafe { transfer.host.as_mut_slice() };
                                read_scratchpad(&self.info, self.transport.as_ref(), slot, absolute, base, bytes)?;
                            }
                        }
                    }
                    match transfer.placement {
                        Placement::Global => {
                            let _ = self
                                .transport
                                .dealloc(DevAddr(transfer.device_handle), AllocFlags::default());
                        }
                        Placement::PeLocal => {
                            let base = self.local_mem.arena_base(slot).unwrap_or(0);
                            let len = unsafe { transfer.host.as_slice() }.len() as u64;
                            self.local_mem.dealloc(slot, base + transfer.device_handle, len);
                        }
                    }
                }
            }
            Ok(())
        })?;

        self.pe_pool.release(slot)?;
        self.jobs.with_job(id, |job| {
            job.state = JobState::Finished;
            job.slot = None;
            Ok(())
        })
    }
}

fn write_arg_register(transport: &dyn Transport, addr: u64, value: u64, is64: bool) -> Result<(), ErrorCode> {
    if is64 {
        transport.write_ctl(BusAddr(addr), &value.to_le_bytes())
    } else {
        transport.write_ctl(BusAddr(addr), &(value as u32).to_le_bytes())
    }
    .map_err(|_| ErrorCode::PlatformFailure)
}

fn read_arg_register(transport: &dyn Transport, addr: u64, is64: bool) -> Result<u64, ErrorCode> {
    if is64 {
        let mut buf = [0u8; 8];
        transport
            .read_ctl(BusAddr(addr), &mut buf)
            .map_err(|_| ErrorCode::PlatformFailure)?;
        Ok(u64::from_le_bytes(buf))
    } else {
        let mut buf = [0u8; 4];
        transport
            .read_ctl(BusAddr(addr), &mut buf)
            .map_err(|_| ErrorCode::PlatformFailure)?;
        Ok(u32::from_le_bytes(buf) as u64)
    }
}

/// Scratchpad access rides the PE's own control window (`spec.md` §4.6), at
/// `slot_base(slot) + SCRATCHPAD_WINDOW + (addr - arena_base)`.
fn write_scratchpad(
    info: &DeviceInfo,
    transport: &dyn Transport,
    local_mem: &LocalMem,
    slot: usize,
    addr: u64,
    bytes: &[u8],
) -> Result<(), ErrorCode> {
    let base = local_mem.arena_base(slot).unwrap_or(0);
    let window = tapasco_addrmap::slot_base(info, slot).map_err(|_| ErrorCode::InvalidSlotId)?
        + reg::SCRATCHPAD_WINDOW
        + (addr - base);
    transport
        .write_ctl(BusAddr(window), bytes)
        .map_err(|_| ErrorCode::PlatformFailure)
}

fn read_scratchpad(
    info: &DeviceInfo,
    transport: &dyn Transport,
    slot: usize,
    addr: u64,
    arena_base: u64,
    bytes: &mut [u8],
) -> Result<(), ErrorCode> {
    let window = tapasco_addrmap::slot_base(info, slot).map_err(|_| ErrorCode::InvalidSlotId)?
        + reg::SCRATCHPAD_WINDOW
        + (addr - arena_base);
    transport
        .read_ctl(BusAddr(window), bytes)
        .map_err(|_| ErrorCode::PlatformFailure)
}
