// This program is free software: you can redistribute it and/or modify it
// under the terms of the GNU Lesser General Public License, version 3 of
// the License, or (at your option) any later version. See <https://www.gnu.org/licenses/>.

//! Thin device-enumeration and status-dump CLI. Carries no scheduling
//! logic of its own; it only opens a [`tapasco::DeviceContext`] (or the
//! control device) and prints what it finds.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tapasco::{AddressRange, DeviceConfig};

#[derive(Debug, Parser)]
#[clap(about = "Inspect TaPaSCo devices")]
struct Args {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List every device the control device knows about.
    List {
        #[clap(long, default_value = "/dev/tapasco")]
        control_device: String,
    },
    /// Dump one device's decoded status descriptor.
    Info {
        #[clap(long, default_value = "/dev/tapasco0")]
        device: String,
        #[clap(long, default_value_t = 0x0000_0000)]
        arch_base: u64,
        #[clap(long, default_value_t = 0x0100_0000)]
        platform_base: u64,
        #[clap(long, default_value_t = 0x0100_0000)]
        window_len: u64,
    },
}

fn main() -> Result<()> {
    let _ctx = tapasco::ProcessContext::init();
    let args = Args::parse();
    match args.cmd {
        Cmd::List { control_device } => list(&control_device),
        Cmd::Info {
            device,
            arch_base,
            platform_base,
            window_len,
        } => info(&device, arch_base, platform_base, window_len),
    }
}

fn list(control_device: &str) -> Result<()> {
    let control = tapasco_transport::device::ControlDevice::open(control_device)
        .with_context(|| format!("opening {control_device}"))?;
    let devices = control.enumerate().context("enumerating devices")?;
    if devices.is_empty() {
        println!("no devices found");
    }
    for dev in devices {
        println!(
            "{:>3}  vendor={:#06x} product={:#06x}  {}",
            dev.id, dev.vendor_id, dev.product_id, dev.name
        );
    }
    Ok(())
}

fn info(device: &str, arch_base: u64, platform_base: u64, window_len: u64) -> Result<()> {
    use std::sync::Arc;
    use tapasco_transport::device::DeviceTransport;

    let arch_range = AddressRange::new(arch_base, window_len);
    let platform_range = AddressRange::new(platform_base, window_len);
    let transport: Arc<dyn tapasco::Transport> = Arc::new(
        DeviceTransport::open(device, tapasco_abi::AccessMode::Monitor, arch_range, platform_range)
            .with_context(|| format!("opening {device}"))?,
    );

    let config = DeviceConfig::default()
        .with_access_mode(tapasco_abi::AccessMode::Monitor)
        .with_address_ranges(arch_range, platform_range);
    let ctx = tapasco::DeviceContext::open(transport, config).context("reading device status")?;
    print_info(ctx.info());
    Ok(())
}

fn print_info(info: &tapasco_abi::DeviceInfo) {
    println!("magic:        {:#010x}", info.magic);
    println!(
        "clocks:       host={} MHz design={} MHz memory={} MHz",
        info.clocks.host_mhz, info.clocks.design_mhz, info.clocks.memory_mhz
    );
    println!(
        "versions:     tapasco={:#010x} vivado={:#010x}",
        info.versions.tapasco, info.versions.vivado
    );
    println!("capabilities: {:?}", info.capabilities);
    println!("composition:");
    for (slot, kernel) in info.composition.kernel.iter().enumerate() {
        if kernel.is_none() {
            continue;
        }
        let mem = info.composition.memory_of(slot + 1);
        let base = info.base.arch.get(slot).copied().unwrap_or(0);
        if mem > 0 {
            println!(
                "  slot {slot:>3}: kernel={:>4} base={base:#010x} local_mem={mem} bytes",
                kernel.0
            );
        } else {
            println!("  slot {slot:>3}: kernel={:>4} base={base:#010x}", kernel.0);
        }
    }
    println!("platform components:");
    for (name, addr) in &info.base.platform {
        println!("  {name:<20} {addr:#010x}");
    }
}
