// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! Host-facing library surface for the TaPaSCo runtime (`spec.md` §6):
//! process/device lifecycle, job submission, and the stable error
//! taxonomy. Everything interesting happens in the component crates this
//! one wires together — [`tapasco_scheduler`] owns the job lifecycle,
//! [`tapasco_status`] decodes device identity, [`tapasco_transport`]
//! speaks to the hardware or a [`tapasco_transport::sim::SimTransport`].

use std::sync::Arc;

pub use tapasco_abi::{AccessMode, DeviceInfo, ErrorCode, JobId, KernelId, Placement, TransferDirection};
pub use tapasco_scheduler::HostBuffer;
pub use tapasco_transport::{AddressRange, Transport};

/// The runtime's aggregated error type. Most failures are a bare
/// [`ErrorCode`] from the shared taxonomy; decode failures during device
/// open carry the richer [`tapasco_status::StatusError`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Code(#[from] ErrorCode),
    #[error("failed to read device status: {0}")]
    Status(#[from] tapasco_status::StatusError),
    #[error("failed to open device: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for opening one device context. Mirrors the access-mode
/// and address-window knobs a real `tlkm` open call takes.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub access_mode: AccessMode,
    pub job_capacity: usize,
    pub arch_range: AddressRange,
    pub platform_range: AddressRange,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            access_mode: AccessMode::Exclusive,
            job_capacity: tapasco_abi::JOB_POOL_CAPACITY,
            arch_range: AddressRange::new(0x0000_0000, 0x0100_0000),
            platform_range: AddressRange::new(0x0100_0000, 0x0100_0000),
        }
    }
}

impl DeviceConfig {
    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = mode;
        self
    }

    pub fn with_job_capacity(mut self, capacity: usize) -> Self {
        self.job_capacity = capacity;
        self
    }

    pub fn with_address_ranges(mut self, arch: AddressRange, platform: AddressRange) -> Self {
        self.arch_range = arch;
        self.platform_range = platform;
        self
    }
}

/// A process-wide handle that owns logging initialization. `spec.md` §9
/// treats log flushing as a destructor of the top-level context rather
/// than a signal-handler concern; this is that destructor.
pub struct ProcessContext {
    _private: (),
}

impl ProcessContext {
    /// Initializes logging once per process. Safe to call more than once;
    /// later calls are no-ops.
    pub fn init() -> Self {
        let _ = env_logger::try_init();
        ProcessContext { _private: () }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        log::logger().flush();
    }
}

/// Resolves a vendor kernel name to its numeric id. The table mirrors the
/// example kernels shipped with the reference platform image.
pub fn kernel_id_for_name(name: &str) -> Result<KernelId, Error> {
    match name {
        "counter" => Ok(KernelId::from(14)),
        "arrayinit" => Ok(KernelId::from(11)),
        "arraysum" => Ok(KernelId::from(10)),
        "arrayupdate" => Ok(KernelId::from(9)),
        _ => Err(Error::Code(ErrorCode::UnknownDevice)),
    }
}

/// One open FPGA device: status, address map, and (outside `Monitor` mode)
/// the PE pool and scheduler, bundled behind the stable host API.
pub struct DeviceContext {
    transport: Arc<dyn Transport>,
    info: DeviceInfo,
    /// Absent when opened in [`AccessMode::Monitor`]: a monitor must never
    /// perturb a running job, and building a [`tapasco_scheduler::Scheduler`]
    /// writes the interrupt-enable registers of every PE it discovers
    /// (`PePool::new`'s `setup_interrupts`), which a read-only transport
    /// rejects outright.
    scheduler: Option<tapasco_scheduler::Scheduler>,
}

impl DeviceContext {
    /// Opens a device context over an already-constructed transport (a
    /// real [`tapasco_transport::device::DeviceTransport`] or a
    /// [`tapasco_transport::sim::SimTransport`] in tests).
    ///
    /// `AccessMode::Monitor` opens a status-only context: job submission is
    /// unavailable (`DeviceBusy`), and no control register is ever written.
    pub fn open(transport: Arc<dyn Transport>, config: DeviceConfig) -> Result<Self, Error> {
        let reader = tapasco_status::StatusReader::new();
        let info = reader.read(transport.as_ref())?.clone();
        let scheduler = match config.access_mode {
            AccessMode::Monitor => None,
            _ => Some(
                tapasco_scheduler::Scheduler::new(transport.clone(), info.clone(), config.job_capacity)
                    .map_err(Error::Code)?,
            ),
        };
        Ok(DeviceContext {
            transport,
            info,
            scheduler,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn has_capability(&self, capability: tapasco_abi::Capabilities) -> bool {
        self.info.capabilities.contains(capability)
    }

    fn scheduler(&self) -> Result<&tapasco_scheduler::Scheduler, Error> {
        self.scheduler.as_ref().ok_or(Error::Code(ErrorCode::DeviceBusy))
    }

    pub fn acquire_job_id(&self, kernel_id: KernelId) -> Result<JobId, Error> {
        self.scheduler()?.acquire_job_id(kernel_id).map_err(Error::Code)
    }

    pub fn release_job_id(&self, id: JobId) -> Result<(), Error> {
        self.scheduler()?.release_job_id(id).map_err(Error::Code)
    }

    pub fn set_arg(&self, id: JobId, index: usize, value: u64, is64: bool) -> Result<(), Error> {
        self.scheduler()?.set_arg(id, index, value, is64).map_err(Error::Code)
    }

    pub fn set_arg_transfer(
        &self,
        id: JobId,
        index: usize,
        buffer: HostBuffer,
        direction: TransferDirection,
        placement: Placement,
    ) -> Result<(), Error> {
        self.scheduler()?
            .set_arg_transfer(id, index, buffer, direction, placement)
            .map_err(Error::Code)
    }

    /// Launches and blocks until the job has finished.
    pub fn launch_blocking(&self, id: JobId) -> Result<(), Error> {
        self.scheduler()?.launch(id, true).map_err(Error::Code)
    }

    /// Launches without blocking; pair with [`DeviceContext::collect`].
    pub fn launch_non_blocking(&self, id: JobId) -> Result<(), Error> {
        self.scheduler()?.launch(id, false).map_err(Error::Code)
    }

    /// Waits for a non-blocking job's completion and runs the finish
    /// protocol.
    pub fn collect(&self, id: JobId) -> Result<(), Error> {
        self.scheduler()?.collect(id).map_err(Error::Code)
    }

    pub fn return_value(&self, id: JobId) -> Result<u64, Error> {
        self.scheduler()?.return_value(id).map_err(Error::Code)
    }

    pub fn arg_value(&self, id: JobId, index: usize) -> Result<u64, Error> {
        self.scheduler()?.arg_value(id, index).map_err(Error::Code)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapasco_abi::{BaseMap, Capabilities, Clocks, Composition};
    use tapasco_transport::sim::SimTransport;
    use tapasco_transport::BusAddr;

    const ARCH_BASE: u64 = 0x1000_0000;
    const PLATFORM_BASE: u64 = 0x2000_0000;

    /// Builds a `DeviceContext` directly from a hand-built `DeviceInfo`,
    /// bypassing `StatusReader` — the decode path itself is covered by
    /// `tapasco-status`'s own tests.
    fn context_with_counter_pe() -> DeviceContext {
        let transport = SimTransport::new(
            AddressRange::new(ARCH_BASE, 0x1_0000),
            AddressRange::new(PLATFORM_BASE, 0x1_0000),
            1 << 16,
        );
        transport.register_pe(BusAddr(ARCH_BASE), 0, move |t, _slot| {
            let mut arg_buf = [0u8; 4];
            t.read_ctl(BusAddr(ARCH_BASE + tapasco_abi::reg::ARG_BASE), &mut arg_buf)
                .unwrap();
            let v = u32::from_le_bytes(arg_buf) as u64;
            t.write_ctl(
                BusAddr(ARCH_BASE + tapasco_abi::reg::RET),
                &v.to_le_bytes(),
            )
            .unwrap();
        });

        let mut composition = Composition::empty();
        composition.kernel[0] = KernelId::from(14);
        let mut arch = vec![0u64; tapasco_abi::MAX_SLOTS];
        arch[0] = ARCH_BASE;
        let info = DeviceInfo {
            magic: tapasco_abi::STATUS_MAGIC,
            composition,
            base: BaseMap {
                arch,
                platform: Default::default(),
            },
            versions: Default::default(),
            clocks: Clocks::default(),
            capabilities: Capabilities::PE_LOCAL_MEM,
        };

        let scheduler = tapasco_scheduler::Scheduler::new(transport.clone(), info.clone(), 16).unwrap();
        DeviceContext {
            transport,
            info,
            scheduler: Some(scheduler),
        }
    }

    #[test]
    fn kernel_name_lookup_matches_known_table() {
        assert_eq!(kernel_id_for_name("counter").unwrap(), KernelId::from(14));
        assert_eq!(kernel_id_for_name("arrayinit").unwrap(), KernelId::from(11));
        assert!(kernel_id_for_name("nonexistent").is_err());
    }

    #[test]
    fn process_context_init_is_idempotent() {
        let _a = ProcessContext::init();
        let _b = ProcessContext::init();
    }

    /// A context opened in `Monitor` mode carries no scheduler: status and
    /// capability introspection still work, but job submission is refused
    /// rather than attempting a control-register write a monitor transport
    /// would reject.
    #[test]
    fn monitor_mode_context_refuses_job_submission() {
        let transport = SimTransport::new(
            AddressRange::new(ARCH_BASE, 0x1_0000),
            AddressRange::new(PLATFORM_BASE, 0x1_0000),
            1 << 16,
        );
        let mut composition = Composition::empty();
        composition.kernel[0] = KernelId::from(14);
        let mut arch = vec![0u64; tapasco_abi::MAX_SLOTS];
        arch[0] = ARCH_BASE;
        let info = DeviceInfo {
            magic: tapasco_abi::STATUS_MAGIC,
            composition,
            base: BaseMap {
                arch,
                platform: Default::default(),
            },
            versions: Default::default(),
            clocks: Clocks::default(),
            capabilities: Capabilities::empty(),
        };
        let ctx = DeviceContext {
            transport,
            info,
            scheduler: None,
        };

        assert!(!ctx.has_capability(Capabilities::PE_LOCAL_MEM));
        match ctx.acquire_job_id(KernelId::from(14)) {
            Err(Error::Code(ErrorCode::DeviceBusy)) => {}
            other => panic!("expected DeviceBusy, got {other:?}"),
        }
    }

    #[test]
    fn device_context_blocking_launch_round_trips_scalar() {
        let ctx = context_with_counter_pe();
        let job = ctx.acquire_job_id(KernelId::from(14)).unwrap();
        ctx.set_arg(job, 0, 42, false).unwrap();
        ctx.launch_blocking(job).unwrap();
        assert_eq!(ctx.return_value(job).unwrap(), 42);
        ctx.release_job_id(job).unwrap();
    }

    #[test]
    fn device_context_non_blocking_launch_then_collect() {
        let ctx = context_with_counter_pe();
        let job = ctx.acquire_job_id(KernelId::from(14)).unwrap();
        ctx.set_arg(job, 0, 7, false).unwrap();
        ctx.launch_non_blocking(job).unwrap();
        ctx.collect(job).unwrap();
        assert_eq!(ctx.return_value(job).unwrap(), 7);
        ctx.release_job_id(job).unwrap();
    }

    #[test]
    fn capability_bit_reads_back() {
        let ctx = context_with_counter_pe();
        assert!(ctx.has_capability(Capabilities::PE_LOCAL_MEM));
        assert!(!ctx.has_capability(Capabilities::DYNAMIC_ADDRESS_MAP));
    }

    /// Two scalar arguments survive the write/start/finish/read-back
    /// round trip unmodified when the PE never touches them.
    #[test]
    fn multiple_scalar_args_round_trip() {
        let transport = SimTransport::new(
            AddressRange::new(ARCH_BASE, 0x1_0000),
            AddressRange::new(PLATFORM_BASE, 0x1_0000),
            1 << 16,
        );
        transport.register_pe(BusAddr(ARCH_BASE), 0, move |t, _slot| {
            t.write_ctl(
                BusAddr(ARCH_BASE + tapasco_abi::reg::RET),
                &0u64.to_le_bytes(),
            )
            .unwrap();
        });
        let mut composition = Composition::empty();
        composition.kernel[0] = KernelId::from(21);
        let mut arch = vec![0u64; tapasco_abi::MAX_SLOTS];
        arch[0] = ARCH_BASE;
        let info = DeviceInfo {
            magic: tapasco_abi::STATUS_MAGIC,
            composition,
            base: BaseMap {
                arch,
                platform: Default::default(),
            },
            versions: Default::default(),
            clocks: Clocks::default(),
            capabilities: Capabilities::empty(),
        };
        let scheduler = tapasco_scheduler::Scheduler::new(transport.clone(), info.clone(), 16).unwrap();
        let ctx = DeviceContext {
            transport,
            info,
            scheduler: Some(scheduler),
        };

        let job = ctx.acquire_job_id(KernelId::from(21)).unwrap();
        ctx.set_arg(job, 0, 11, false).unwrap();
        ctx.set_arg(job, 1, 22, false).unwrap();
        ctx.launch_blocking(job).unwrap();
        assert_eq!(ctx.arg_value(job, 0).unwrap(), 11);
        assert_eq!(ctx.arg_value(job, 1).unwrap(), 22);
        ctx.release_job_id(job).unwrap();
    }

    /// A `PeLocal` transfer actually lands in the PE's own scratchpad
    /// window: the PE doubles each byte it finds there and the host sees
    /// the doubled result after `finish`.
    #[test]
    fn pe_local_transfer_round_trips_through_scratchpad() {
        let transport = SimTransport::new(
            AddressRange::new(ARCH_BASE, 0x1_0000),
            AddressRange::new(PLATFORM_BASE, 0x1_0000),
            1 << 16,
        );
        transport.register_pe(BusAddr(ARCH_BASE), 0, move |t, _slot| {
            let mut off_buf = [0u8; 4];
            t.read_ctl(
                BusAddr(ARCH_BASE + tapasco_abi::reg::ARG_BASE),
                &mut off_buf,
            )
            .unwrap();
            let offset = u32::from_le_bytes(off_buf) as u64;
            let window = BusAddr(ARCH_BASE + tapasco_abi::reg::SCRATCHPAD_WINDOW + offset);
            let mut data = [0u8; 4];
            t.read_ctl(window, &mut data).unwrap();
            for b in data.iter_mut() {
                *b = b.wrapping_mul(2);
            }
            t.write_ctl(window, &data).unwrap();
            t.write_ctl(
                BusAddr(ARCH_BASE + tapasco_abi::reg::RET),
                &0u64.to_le_bytes(),
            )
            .unwrap();
        });

        let mut composition = Composition::empty();
        composition.kernel[0] = KernelId::from(33);
        composition.memory[1] = 64;
        let mut arch = vec![0u64; tapasco_abi::MAX_SLOTS];
        arch[0] = ARCH_BASE;
        arch[1] = ARCH_BASE + 0x1000;
        let info = DeviceInfo {
            magic: tapasco_abi::STATUS_MAGIC,
            composition,
            base: BaseMap {
                arch,
                platform: Default::default(),
            },
            versions: Default::default(),
            clocks: Clocks::default(),
            capabilities: Capabilities::PE_LOCAL_MEM,
        };
        let scheduler = tapasco_scheduler::Scheduler::new(transport.clone(), info.clone(), 16).unwrap();
        let ctx = DeviceContext {
            transport,
            info,
            scheduler: Some(scheduler),
        };

        let job = ctx.acquire_job_id(KernelId::from(33)).unwrap();
        let mut buf = [1u8, 2, 3, 4];
        ctx.set_arg_transfer(
            job,
            0,
            HostBuffer::new(&mut buf),
            TransferDirection::Both,
            Placement::PeLocal,
        )
        .unwrap();
        ctx.launch_blocking(job).unwrap();
        assert_eq!(buf, [2u8, 4, 6, 8]);
        ctx.release_job_id(job).unwrap();
    }

    /// Two independently-scheduled PEs with their own scratchpad arenas
    /// never see each other's local-memory contents.
    #[test]
    fn local_memory_partitions_stay_disjoint_under_concurrency() {
        let transport = SimTransport::new(
            AddressRange::new(ARCH_BASE, 0x1_0000),
            AddressRange::new(PLATFORM_BASE, 0x1_0000),
            1 << 16,
        );
        let slot_bases = [ARCH_BASE, ARCH_BASE + 0x200];
        for (slot, &base) in slot_bases.iter().enumerate() {
            transport.register_pe(BusAddr(base), slot as u16, move |t, _slot| {
                let mut off_buf = [0u8; 4];
                t.read_ctl(BusAddr(base + tapasco_abi::reg::ARG_BASE), &mut off_buf)
                    .unwrap();
                let offset = u32::from_le_bytes(off_buf) as u64;
                let window = BusAddr(base + tapasco_abi::reg::SCRATCHPAD_WINDOW + offset);
                let mut data = [0u8; 4];
                t.read_ctl(window, &mut data).unwrap();
                for b in data.iter_mut() {
                    *b = b.wrapping_add(100);
                }
                t.write_ctl(window, &data).unwrap();
                t.write_ctl(BusAddr(base + tapasco_abi::reg::RET), &0u64.to_le_bytes())
                    .unwrap();
            });
        }

        let mut composition = Composition::empty();
        composition.kernel[0] = KernelId::from(44);
        composition.memory[1] = 32;
        composition.kernel[2] = KernelId::from(45);
        composition.memory[3] = 32;
        let mut arch = vec![0u64; tapasco_abi::MAX_SLOTS];
        arch[0] = slot_bases[0];
        arch[1] = slot_bases[0] + 0x1000;
        arch[2] = slot_bases[1];
        arch[3] = slot_bases[1] + 0x1000;
        let info = DeviceInfo {
            magic: tapasco_abi::STATUS_MAGIC,
            composition,
            base: BaseMap {
                arch,
                platform: Default::default(),
            },
            versions: Default::default(),
            clocks: Clocks::default(),
            capabilities: Capabilities::PE_LOCAL_MEM,
        };
        let scheduler = tapasco_scheduler::Scheduler::new(transport.clone(), info.clone(), 16).unwrap();
        let ctx = Arc::new(DeviceContext {
            transport,
            info,
            scheduler: Some(scheduler),
        });

        let handles: Vec<_> = [(44u32, 10u8), (45u32, 20u8)]
            .into_iter()
            .map(|(kernel, seed)| {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    let job = ctx.acquire_job_id(KernelId::from(kernel)).unwrap();
                    let mut buf = [seed; 4];
                    ctx.set_arg_transfer(
                        job,
                        0,
                        HostBuffer::new(&mut buf),
                        TransferDirection::Both,
                        Placement::PeLocal,
                    )
                    .unwrap();
                    ctx.launch_blocking(job).unwrap();
                    ctx.release_job_id(job).unwrap();
                    buf
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], [110u8; 4]);
        assert_eq!(results[1], [120u8; 4]);
    }

    /// Completions route back to the job that caused them, never to a
    /// sibling running on the other PE.
    #[test]
    fn completions_route_to_the_correct_job() {
        let transport = SimTransport::new(
            AddressRange::new(ARCH_BASE, 0x1_0000),
            AddressRange::new(PLATFORM_BASE, 0x1_0000),
            1 << 16,
        );
        let slot_bases = [ARCH_BASE, ARCH_BASE + 0x200];
        for (slot, &base) in slot_bases.iter().enumerate() {
            transport.register_pe(BusAddr(base), slot as u16, move |t, _slot| {
                let mut arg_buf = [0u8; 4];
                t.read_ctl(BusAddr(base + tapasco_abi::reg::ARG_BASE), &mut arg_buf)
                    .unwrap();
                let v = u32::from_le_bytes(arg_buf) as u64;
                t.write_ctl(BusAddr(base + tapasco_abi::reg::RET), &v.to_le_bytes())
                    .unwrap();
            });
        }
        let mut composition = Composition::empty();
        composition.kernel[0] = KernelId::from(55);
        composition.kernel[1] = KernelId::from(55);
        let mut arch = vec![0u64; tapasco_abi::MAX_SLOTS];
        arch[0] = slot_bases[0];
        arch[1] = slot_bases[1];
        let info = DeviceInfo {
            magic: tapasco_abi::STATUS_MAGIC,
            composition,
            base: BaseMap {
                arch,
                platform: Default::default(),
            },
            versions: Default::default(),
            clocks: Clocks::default(),
            capabilities: Capabilities::empty(),
        };
        let scheduler = tapasco_scheduler::Scheduler::new(transport.clone(), info.clone(), 64).unwrap();
        let ctx = Arc::new(DeviceContext {
            transport,
            info,
            scheduler: Some(scheduler),
        });

        let handles: Vec<_> = (0..20u64)
            .map(|input| {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    let job = ctx.acquire_job_id(KernelId::from(55)).unwrap();
                    ctx.set_arg(job, 0, input, false).unwrap();
                    ctx.launch_blocking(job).unwrap();
                    let result = ctx.return_value(job).unwrap();
                    ctx.release_job_id(job).unwrap();
                    (input, result)
                })
            })
            .collect();

        for h in handles {
            let (input, result) = h.join().unwrap();
            assert_eq!(input, result);
        }
    }

    #[test]
    fn process_context_drop_order_is_irrelevant() {
        let a = ProcessContext::init();
        let b = ProcessContext::init();
        drop(a);
        drop(b);
        let _c = ProcessContext::init();
    }
}
