// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! The Job table: fixed-capacity pool of job records plus a wait-free index
//! pool for job ids (`spec.md` §4.6).

use std::sync::Mutex;

use crossbeam::queue::ArrayQueue;
use tapasco_abi::{ErrorCode, JobId, KernelId, Placement, TransferDirection, MAX_ARGS};

/// A caller-owned host buffer attached to a transfer. The scheduler treats
/// the pointer as valid for the lifetime of the transfer (from
/// `set_arg_transfer` through the matching `finish`); upholding that is the
/// caller's contract, mirroring the raw `host_buf` pointers the transport
/// layer already accepts.
#[derive(Copy, Clone)]
pub struct HostBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the pointer is only ever dereferenced for the duration of one
// launch/finish pair, which the caller is required to outlive.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub fn new(slice: &mut [u8]) -> Self {
        HostBuffer {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The caller-supplied buffer must still be alive and exclusively
    /// accessible for the duration of the borrow.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    /// # Safety
    /// Same contract as [`as_mut_slice`](Self::as_mut_slice).
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

#[derive(Clone, Copy)]
pub struct Transfer {
    pub host: HostBuffer,
    pub direction: TransferDirection,
    pub placement: Placement,
    /// Resolved once the transfer has been staged: a `DevAddr` for
    /// `Global`, an arena-relative offset for `PeLocal`.
    pub device_handle: u64,
    pub preloaded: bool,
}

#[derive(Clone, Copy, Default)]
pub struct ArgSlot {
    pub value: u64,
    pub is64: bool,
    pub transfer: Option<Transfer>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Requested,
    Scheduled,
    Running,
    Finished,
}

pub struct Job {
    pub kernel_id: KernelId,
    pub state: JobState,
    pub args: [ArgSlot; MAX_ARGS],
    pub args_len: usize,
    pub return_value: u64,
    pub slot: Option<usize>,
}

impl Job {
    fn empty() -> Self {
        Job {
            kernel_id: KernelId::NONE,
            state: JobState::Ready,
            args: [ArgSlot::default(); MAX_ARGS],
            args_len: 0,
            return_value: 0,
            slot: None,
        }
    }
}

/// Owns every job record and the wait-free pool of free indices
/// (`spec.md` §4.6: "acquire/release are O(1) and wait-free").
pub struct JobTable {
    jobs: Vec<Mutex<Job>>,
    free_ids: ArrayQueue<usize>,
}

impl JobTable {
    pub fn new(capacity: usize) -> Self {
        let free_ids = ArrayQueue::new(capacity);
        for i in 0..capacity {
            free_ids.push(i).expect("queue sized to capacity");
        }
        JobTable {
            jobs: (0..capacity).map(|_| Mutex::new(Job::empty())).collect(),
            free_ids,
        }
    }

    pub fn acquire_id(&self, kernel_id: KernelId) -> Result<JobId, ErrorCode> {
        let index = self.free_ids.pop().ok_or(ErrorCode::NoJobIdAvailable)?;
        let mut job = self.jobs[index].lock().unwrap();
        *job = Job::empty();
        job.kernel_id = kernel_id;
        job.state = JobState::Requested;
        Ok(JobId::from_pool_index(index))
    }

    fn index_of(&self, id: JobId) -> Result<usize, ErrorCode> {
        id.pool_index()
            .filter(|&i| i < self.jobs.len())
            .ok_or(ErrorCode::JobIdNotFound)
    }

    pub fn with_job<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> Result<R, ErrorCode>) -> Result<R, ErrorCode> {
        let index = self.index_of(id)?;
        let mut job = self.jobs[index].lock().unwrap();
        f(&mut job)
    }

    /// Releases a job id after it has returned to `Ready`-eligible state
    /// (`Finished`), zeroing the record and pushing the index back.
    pub fn release_id(&self, id: JobId) -> Result<(), ErrorCode> {
        let index = self.index_of(id)?;
        {
            let mut job = self.jobs[index].lock().unwrap();
            if job.state != JobState::Finished {
                return Err(ErrorCode::JobIdNotFound);
            }
            *job = Job::empty();
        }
        self.free_ids
            .push(index)
            .map_err(|_| ErrorCode::JobIdNotFound)?;
        Ok(())
    }
}
