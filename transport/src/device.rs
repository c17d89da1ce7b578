// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! Real transport backed by a `/dev/tapasco*` character device, driven
//! through the kernel driver's `ioctl` interface. Grounded on
//! `platform_device_operations.c`'s `default_alloc`/`default_read_ctl`/etc.,
//! which wrap the same four `tlkm_*` commands used here.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::sync::Mutex;

use tapasco_abi::AccessMode;

use crate::{AddressRange, AllocFlags, BusAddr, DevAddr, Transport, TransportError};

/// `tlkm_mm_cmd`: request/response for `alloc`/`dealloc`.
#[repr(C)]
#[derive(Copy, Clone)]
struct MmCmd {
    sz: u64,
    dev_addr: i64,
}

/// `tlkm_copy_cmd`: request/response for bulk and control-register copies.
#[repr(C)]
#[derive(Copy, Clone)]
struct CopyCmd {
    length: u64,
    dev_addr: u64,
    user_addr: u64,
}

const TLKM_IOCTL_MAGIC: u8 = b'T';

nix::ioctl_readwrite!(tlkm_alloc, TLKM_IOCTL_MAGIC, 1, MmCmd);
nix::ioctl_readwrite!(tlkm_free, TLKM_IOCTL_MAGIC, 2, MmCmd);
nix::ioctl_readwrite!(tlkm_copy_to, TLKM_IOCTL_MAGIC, 3, CopyCmd);
nix::ioctl_readwrite!(tlkm_copy_from, TLKM_IOCTL_MAGIC, 4, CopyCmd);
nix::ioctl_readwrite!(tlkm_ctl_read, TLKM_IOCTL_MAGIC, 5, CopyCmd);
nix::ioctl_readwrite!(tlkm_ctl_write, TLKM_IOCTL_MAGIC, 6, CopyCmd);

fn translate(ret: nix::Result<libc::c_int>) -> Result<(), TransportError> {
    ret.map(|_| ())
        .map_err(|errno| TransportError::Failure(errno as i32))
}

/// A transport talking to a real kernel driver file.
pub struct DeviceTransport {
    ctrl: Mutex<File>,
    arch_range: AddressRange,
    platform_range: AddressRange,
    mode: AccessMode,
}

impl DeviceTransport {
    /// Open the device file at `path` in the given access mode.
    ///
    /// `arch_range`/`platform_range` come from the platform's fixed address
    /// layout (the same constants the status reader uses as translation
    /// bases, `spec.md` §4.2).
    pub fn open(
        path: &str,
        mode: AccessMode,
        arch_range: AddressRange,
        platform_range: AddressRange,
    ) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!matches!(mode, AccessMode::Monitor))
            .open(path)?;
        Ok(DeviceTransport {
            ctrl: Mutex::new(file),
            arch_range,
            platform_range,
            mode,
        })
    }

    fn deny_if_monitor(&self) -> Result<(), TransportError> {
        if self.mode == AccessMode::Monitor {
            Err(TransportError::Failure(libc::EROFS))
        } else {
            Ok(())
        }
    }
}

impl Transport for DeviceTransport {
    fn alloc(&self, len: usize, _flags: AllocFlags) -> Result<DevAddr, TransportError> {
        self.deny_if_monitor()?;
        let file = self.ctrl.lock().unwrap();
        let mut cmd = MmCmd {
            sz: len as u64,
            dev_addr: -1,
        };
        // SAFETY: `cmd` is a plain-old-data struct matching the driver's
        // expected layout, and the fd stays open for the call's duration.
        unsafe { tlkm_alloc(file.as_raw_fd(), &mut cmd) }
            .map_err(|_| TransportError::OutOfMemory)?;
        Ok(DevAddr(cmd.dev_addr as u64))
    }

    fn dealloc(&self, addr: DevAddr, _flags: AllocFlags) -> Result<(), TransportError> {
        self.deny_if_monitor()?;
        let file = self.ctrl.lock().unwrap();
        let mut cmd = MmCmd {
            sz: 0,
            dev_addr: addr.0 as i64,
        };
        // SAFETY: see `alloc`.
        translate(unsafe { tlkm_free(file.as_raw_fd(), &mut cmd) })
    }

    fn read_mem(&self, addr: DevAddr, buf: &mut [u8]) -> Result<(), TransportError> {
        let file = self.ctrl.lock().unwrap();
        let mut cmd = CopyCmd {
            length: buf.len() as u64,
            dev_addr: addr.0,
            user_addr: buf.as_mut_ptr() as u64,
        };
        // SAFETY: `buf` outlives the call and the driver only writes
        // `cmd.length` bytes into it.
        translate(unsafe { tlkm_copy_from(file.as_raw_fd(), &mut cmd) })
    }

    fn write_mem(&self, addr: DevAddr, buf: &[u8]) -> Result<(), TransportError> {
        self.deny_if_monitor()?;
        let file = self.ctrl.lock().unwrap();
        let mut cmd = CopyCmd {
            length: buf.len() as u64,
            dev_addr: addr.0,
            user_addr: buf.as_ptr() as u64,
        };
        // SAFETY: see `read_mem`; the driver only reads `cmd.length` bytes.
        translate(unsafe { tlkm_copy_to(file.as_raw_fd(), &mut cmd) })
    }

    fn read_ctl(&self, addr: BusAddr, buf: &mut [u8]) -> Result<(), TransportError> {
        crate::validate_ctl_access(self, addr, buf.len())?;
        let file = self.ctrl.lock().unwrap();
        let mut cmd = CopyCmd {
            length: buf.len() as u64,
            dev_addr: addr.0,
            user_addr: buf.as_mut_ptr() as u64,
        };
        // SAFETY: see `read_mem`.
        translate(unsafe { tlkm_ctl_read(file.as_raw_fd(), &mut cmd) })
    }

    fn write_ctl(&self, addr: BusAddr, buf: &[u8]) -> Result<(), TransportError> {
        self.deny_if_monitor()?;
        crate::validate_ctl_access(self, addr, buf.len())?;
        let file = self.ctrl.lock().unwrap();
        let mut cmd = CopyCmd {
            length: buf.len() as u64,
            dev_addr: addr.0,
            user_addr: buf.as_ptr() as u64,
        };
        // SAFETY: see `write_mem`.
        translate(unsafe { tlkm_ctl_write(file.as_raw_fd(), &mut cmd) })
    }

    fn arch_range(&self) -> AddressRange {
        self.arch_range
    }

    fn platform_range(&self) -> AddressRange {
        self.platform_range
    }

    fn completion_events(&self) -> Box<dyn Iterator<Item = Result<u16, TransportError>> + Send> {
        let file = self.ctrl.lock().unwrap().try_clone().expect("dup device fd");
        Box::new(CompletionStream { file })
    }
}

/// Reads little-endian `u32` slot ids off the device file's blocking `read`
/// side (`spec.md` §6).
struct CompletionStream {
    file: File,
}

impl Iterator for CompletionStream {
    type Item = Result<u16, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut raw = [0u8; 4];
        match self.file.read_exact(&mut raw) {
            Ok(()) => {
                let slot = u32::from_le_bytes(raw);
                Some(
                    crate::validate_slot_id(slot)
                        .ok_or(TransportError::Failure(libc::EPROTO)),
                )
            }
            Err(e) => Some(Err(TransportError::Failure(
                e.raw_os_error().unwrap_or(libc::EIO),
            ))),
        }
    }
}

const TLKM_CTRL_IOCTL_MAGIC: u8 = b'C';
const TLKM_DEVICE_NAME_LEN: usize = 64;

/// `tlkm_device_info`: one entry returned by the control device's
/// enumeration ioctl.
#[repr(C)]
#[derive(Copy, Clone)]
struct DeviceInfoCmd {
    dev_id: i32,
    vendor_id: u32,
    product_id: u32,
    name: [u8; TLKM_DEVICE_NAME_LEN],
}

nix::ioctl_read!(tlkm_enumerate_count, TLKM_CTRL_IOCTL_MAGIC, 1, u32);
nix::ioctl_readwrite!(tlkm_enumerate_device, TLKM_CTRL_IOCTL_MAGIC, 2, DeviceInfoCmd);

/// One device entry as published by the control device (`spec.md` §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: i32,
    pub vendor_id: u32,
    pub product_id: u32,
    pub name: String,
}

/// The `/dev/tapasco` control device: device discovery only, never used for
/// control-register or memory access.
pub struct ControlDevice {
    file: File,
}

impl ControlDevice {
    pub fn open(path: &str) -> std::io::Result<Self> {
        Ok(ControlDevice {
            file: OpenOptions::new().read(true).open(path)?,
        })
    }

    pub fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let mut count: u32 = 0;
        // SAFETY: `count` is a plain `u32` the driver fills in.
        unsafe { tlkm_enumerate_count(self.file.as_raw_fd(), &mut count) }
            .map_err(|errno| TransportError::Failure(errno as i32))?;

        let mut devices = Vec::with_capacity(count as usize);
        for dev_id in 0..count as i32 {
            let mut cmd = DeviceInfoCmd {
                dev_id,
                vendor_id: 0,
                product_id: 0,
                name: [0u8; TLKM_DEVICE_NAME_LEN],
            };
            // SAFETY: `cmd` matches the driver's plain-old-data layout.
            unsafe { tlkm_enumerate_device(self.file.as_raw_fd(), &mut cmd) }
                .map_err(|errno| TransportError::Failure(errno as i32))?;
            let name_len = cmd.name.iter().position(|&b| b == 0).unwrap_or(cmd.name.len());
            devices.push(DeviceDescriptor {
                id: cmd.dev_id,
                vendor_id: cmd.vendor_id,
                product_id: cmd.product_id,
                name: String::from_utf8_lossy(&cmd.name[..name_len]).into_owned(),
            });
        }
        Ok(devices)
    }
}
