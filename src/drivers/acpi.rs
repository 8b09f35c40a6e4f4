//! ACPI table parsing
//!
//! The kernel needs exactly two things from ACPI: the set of local APIC
//! ids (one per logical CPU) and the interrupt source overrides that
//! map ISA IRQs onto global system interrupts. Both come from the MADT.
//! Tables are read through the identity mapping.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::kern::cpu;
use crate::types::{Error, Result};

const RSDP_SEARCH_START: usize = 0xE0000;
const RSDP_SEARCH_END: usize = 0x100000;
const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

const MADT_ENTRY_LAPIC: u8 = 0;
const MADT_ENTRY_IOAPIC: u8 = 1;
const MADT_ENTRY_OVERRIDE: u8 = 2;

const LAPIC_FLAG_ENABLED: u32 = 1;

const NO_OVERRIDE: u32 = u32::MAX;

/// ISA IRQ -> GSI overrides from the MADT
static IRQ_OVERRIDES: [AtomicU32; 16] = [const { AtomicU32::new(NO_OVERRIDE) }; 16];

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_addr: u32,
}

#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct MadtHeader {
    sdt: SdtHeader,
    lapic_addr: u32,
    flags: u32,
}

#[repr(C, packed)]
struct MadtEntry {
    entry_type: u8,
    length: u8,
}

#[repr(C, packed)]
struct MadtLapic {
    entry: MadtEntry,
    processor_id: u8,
    apic_id: u8,
    flags: u32,
}

#[repr(C, packed)]
struct MadtIoApic {
    entry: MadtEntry,
    ioapic_id: u8,
    reserved: u8,
    addr: u32,
    gsi_base: u32,
}

#[repr(C, packed)]
struct MadtOverride {
    entry: MadtEntry,
    bus: u8,
    source: u8,
    gsi: u32,
    flags: u16,
}

fn checksum_ok(addr: usize, length: usize) -> bool {
    let mut sum: u8 = 0;
    for offset in 0..length {
        sum = sum.wrapping_add(unsafe { ((addr + offset) as *const u8).read() });
    }
    sum == 0
}

fn find_rsdp() -> Option<usize> {
    let mut addr = RSDP_SEARCH_START;
    while addr < RSDP_SEARCH_END {
        let signature = unsafe { (addr as *const [u8; 8]).read() };
        if &signature == RSDP_SIGNATURE && checksum_ok(addr, core::mem::size_of::<Rsdp>()) {
            return Some(addr);
        }
        addr += 16;
    }
    None
}

/// Walk the MADT: register every enabled local APIC as a CPU, record
/// the IO APIC base and the ISA interrupt overrides.
fn parse_madt(addr: usize) {
    let madt = unsafe { &*(addr as *const MadtHeader) };
    let length = madt.sdt.length as usize;

    let mut offset = core::mem::size_of::<MadtHeader>();
    while offset + core::mem::size_of::<MadtEntry>() <= length {
        let entry = unsafe { &*((addr + offset) as *const MadtEntry) };
        let entry_len = entry.length as usize;
        if entry_len == 0 || offset + entry_len > length {
            break;
        }

        match entry.entry_type {
            MADT_ENTRY_LAPIC => {
                let lapic = unsafe { &*((addr + offset) as *const MadtLapic) };
                let flags = lapic.flags;
                if flags & LAPIC_FLAG_ENABLED != 0 {
                    let apic_id = lapic.apic_id as u32;
                    if cpu::cpu_table().register(apic_id).is_none() {
                        log::warn!("no cpu slot for lapic {}", apic_id);
                    }
                }
            }
            MADT_ENTRY_IOAPIC => {
                let ioapic = unsafe { &*((addr + offset) as *const MadtIoApic) };
                let base = ioapic.addr;
                let gsi_base = ioapic.gsi_base;
                if gsi_base == 0 {
                    crate::drivers::ioapic::set_base(base as u64);
                }
            }
            MADT_ENTRY_OVERRIDE => {
                let redirect = unsafe { &*((addr + offset) as *const MadtOverride) };
                let gsi = redirect.gsi;
                record_override(redirect.source, gsi);
            }
            _ => {}
        }

        offset += entry_len;
    }
}

fn record_override(irq: u8, gsi: u32) {
    if let Some(slot) = IRQ_OVERRIDES.get(irq as usize) {
        slot.store(gsi, Ordering::Release);
    }
}

/// Locate the RSDP, walk the RSDT and parse the MADT. Must run before
/// any CPU beyond the boot processor can be addressed.
pub fn parse() -> Result<()> {
    let rsdp_addr = find_rsdp().ok_or(Error::NotFound)?;
    let rsdp = unsafe { &*(rsdp_addr as *const Rsdp) };

    let rsdt_addr = rsdp.rsdt_addr as usize;
    let rsdt = unsafe { &*(rsdt_addr as *const SdtHeader) };
    let rsdt_signature = rsdt.signature;
    if &rsdt_signature != b"RSDT" || !checksum_ok(rsdt_addr, rsdt.length as usize) {
        return Err(Error::Unsuccessful);
    }

    let header_len = core::mem::size_of::<SdtHeader>();
    let entries = (rsdt.length as usize - header_len) / 4;
    let mut found_madt = false;

    for index in 0..entries {
        let table_addr =
            unsafe { ((rsdt_addr + header_len + 4 * index) as *const u32).read_unaligned() }
                as usize;
        let table = unsafe { &*(table_addr as *const SdtHeader) };

        let table_signature = table.signature;
        if &table_signature == b"APIC" && checksum_ok(table_addr, table.length as usize) {
            parse_madt(table_addr);
            found_madt = true;
        }
    }

    if !found_madt {
        return Err(Error::NotFound);
    }
    Ok(())
}

/// ACPI-normalized global system interrupt for an ISA IRQ
pub fn gsi_by_irq(irq: u8) -> u32 {
    match IRQ_OVERRIDES.get(irq as usize) {
        Some(slot) => match slot.load(Ordering::Acquire) {
            NO_OVERRIDE => irq as u32,
            gsi => gsi,
        },
        None => irq as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gsi_identity_without_override() {
        assert_eq!(gsi_by_irq(4), 4);
        assert_eq!(gsi_by_irq(100), 100);
    }

    #[test]
    fn test_gsi_override() {
        record_override(9, 21);
        assert_eq!(gsi_by_irq(9), 21);
    }

    #[test]
    fn test_checksum() {
        let block = [0x10u8, 0xF0];
        assert!(checksum_ok(block.as_ptr() as usize, 2));
        let bad = [0x10u8, 0xF1];
        assert!(!checksum_ok(bad.as_ptr() as usize, 2));
    }

    #[test]
    fn test_parse_madt_overrides() {
        // A synthetic MADT carrying one IO APIC and one override entry.
        let mut buffer = [0u8; 64];

        let madt_len = core::mem::size_of::<MadtHeader>()
            + core::mem::size_of::<MadtIoApic>()
            + core::mem::size_of::<MadtOverride>();
        buffer[0..4].copy_from_slice(b"APIC");
        buffer[4..8].copy_from_slice(&(madt_len as u32).to_le_bytes());

        let mut offset = core::mem::size_of::<MadtHeader>();
        buffer[offset] = MADT_ENTRY_IOAPIC;
        buffer[offset + 1] = core::mem::size_of::<MadtIoApic>() as u8;
        buffer[offset + 4..offset + 8].copy_from_slice(&0xFEC0_0000u32.to_le_bytes());
        buffer[offset + 8..offset + 12].copy_from_slice(&0u32.to_le_bytes());

        offset += core::mem::size_of::<MadtIoApic>();
        buffer[offset] = MADT_ENTRY_OVERRIDE;
        buffer[offset + 1] = core::mem::size_of::<MadtOverride>() as u8;
        buffer[offset + 2] = 0; // ISA bus
        buffer[offset + 3] = 0; // IRQ 0
        buffer[offset + 4..offset + 8].copy_from_slice(&2u32.to_le_bytes());

        parse_madt(buffer.as_ptr() as usize);
        assert_eq!(gsi_by_irq(0), 2);
    }
}
