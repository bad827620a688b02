//! Procedure-linkage-table patching.
//!
//! Once the loader has filled the GOT, each PLT entry is rewritten into a
//! direct jump to its resolved target, removing the indirect branch through
//! the GOT slot. Targets out of direct-branch range get an indirect
//! sequence through a scratch register instead. Entries whose slot is still
//! zero and entries already rewritten are left alone, so a second pass
//! changes nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::Arch;
use crate::runtime::aarch64::{self, Insn, IP0};
use crate::runtime::region::{CodeRegion, RegionError};
use crate::runtime::x86_64;

#[derive(Debug, Error)]
pub enum PltError {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("PLT of {len:#x} bytes does not hold whole {entry}-byte entries after a {header}-byte header")]
    Misaligned { len: usize, header: usize, entry: usize },

    #[error("Unrecognized PLT entry at {addr:#x}")]
    UnknownEntry { addr: u64 },

    #[error("GOT slot {slot:#x} of PLT entry {entry:#x} is not readable")]
    MissingSlot { entry: u64, slot: u64 },
}

/// Reads resolved addresses out of GOT slots.
pub trait SlotMemory {
    fn read_slot(&self, addr: u64) -> Option<u64>;
}

impl SlotMemory for BTreeMap<u64, u64> {
    fn read_slot(&self, addr: u64) -> Option<u64> {
        self.get(&addr).copied()
    }
}

/// GOT slots of the running process.
pub struct ProcessSlots {
    _private: (),
}

impl ProcessSlots {
    /// # Safety
    ///
    /// Every slot address decoded from the patched table must be readable.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl SlotMemory for ProcessSlots {
    fn read_slot(&self, addr: u64) -> Option<u64> {
        if addr == 0 {
            return None;
        }
        // SAFETY: guaranteed by the contract of `ProcessSlots::new`.
        Some(unsafe { std::ptr::read_unaligned(addr as *const u64) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Direct,
    /// Target out of branch range; jumps through a scratch register.
    Indirect,
    AlreadyPatched,
    EmptySlot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PltReport {
    /// Entry address and what happened to it.
    pub entries: Vec<(u64, EntryOutcome)>,
}

impl PltReport {
    pub fn count(&self, outcome: EntryOutcome) -> usize {
        self.entries.iter().filter(|(_, o)| *o == outcome).count()
    }

    /// Entries rewritten in this pass.
    pub fn patched(&self) -> usize {
        self.count(EntryOutcome::Direct) + self.count(EntryOutcome::Indirect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PltPatcher {
    arch: Arch,
}

impl PltPatcher {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    pub fn header_size(&self) -> usize {
        match self.arch {
            Arch::X86_64 => 16,
            Arch::Aarch64 => 32,
        }
    }

    pub fn entry_size(&self) -> usize {
        16
    }

    /// Rewrite every entry of the table in `region`.
    ///
    /// All changes go out in one patch covering the entries, so the table
    /// flips protection once per pass; a pass with nothing to do does not
    /// touch the region at all.
    pub fn patch_all<R: CodeRegion, M: SlotMemory>(&self, region: &mut R, slots: &M) -> Result<PltReport, PltError> {
        let (header, entry) = (self.header_size(), self.entry_size());
        let len = region.len();
        if len < header || (len - header) % entry != 0 {
            return Err(PltError::Misaligned { len, header, entry });
        }

        let base = region.base();
        let mut image = region.bytes().to_vec();
        let mut report = PltReport::default();
        for offset in (header..len).step_by(entry) {
            let addr = base + offset as u64;
            let bytes = &mut image[offset..offset + entry];
            let outcome = match self.arch {
                Arch::X86_64 => patch_x86_64(addr, bytes, slots)?,
                Arch::Aarch64 => patch_aarch64(addr, bytes, slots)?,
            };
            debug!(entry = format!("{addr:#x}"), ?outcome, "plt entry");
            report.entries.push((addr, outcome));
        }

        if report.patched() > 0 {
            region.patch(header, &image[header..])?;
        }
        info!(
            patched = report.patched(),
            indirect = report.count(EntryOutcome::Indirect),
            skipped = report.count(EntryOutcome::AlreadyPatched) + report.count(EntryOutcome::EmptySlot),
            "patched procedure linkage table"
        );
        Ok(report)
    }
}

fn read_target<M: SlotMemory>(slots: &M, entry: u64, slot: u64) -> Result<u64, PltError> {
    slots.read_slot(slot).ok_or(PltError::MissingSlot { entry, slot })
}

fn patch_x86_64<M: SlotMemory>(addr: u64, bytes: &mut [u8], slots: &M) -> Result<EntryOutcome, PltError> {
    if x86_64::is_patched(bytes) {
        return Ok(EntryOutcome::AlreadyPatched);
    }
    let disp = x86_64::decode_jmp_rip(bytes).ok_or(PltError::UnknownEntry { addr })?;
    let slot = addr.wrapping_add(x86_64::JMP_RIP_LEN).wrapping_add(disp as i64 as u64);
    let target = read_target(slots, addr, slot)?;
    if target == 0 {
        return Ok(EntryOutcome::EmptySlot);
    }
    match x86_64::jmp_rel32(addr, target) {
        Some(jmp) => {
            bytes[..jmp.len()].copy_from_slice(&jmp);
            Ok(EntryOutcome::Direct)
        }
        None => {
            let jmp = x86_64::jmp_absolute(target);
            bytes[..jmp.len()].copy_from_slice(&jmp);
            Ok(EntryOutcome::Indirect)
        }
    }
}

fn word(bytes: &[u8], index: usize) -> u32 {
    u32::from_le_bytes([bytes[index * 4], bytes[index * 4 + 1], bytes[index * 4 + 2], bytes[index * 4 + 3]])
}

fn put_word(bytes: &mut [u8], index: usize, value: u32) {
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

fn patch_aarch64<M: SlotMemory>(addr: u64, bytes: &mut [u8], slots: &M) -> Result<EntryOutcome, PltError> {
    if matches!(aarch64::decode(word(bytes, 0)), Some(Insn::B { .. })) || word(bytes, 2) == aarch64::br(IP0) {
        return Ok(EntryOutcome::AlreadyPatched);
    }
    let (Some(Insn::Adrp { rd: IP0, pages }), Some(Insn::AddImm { rd: IP0, rn: IP0, imm, shift12: false })) =
        (aarch64::decode(word(bytes, 0)), aarch64::decode(word(bytes, 2)))
    else {
        return Err(PltError::UnknownEntry { addr });
    };
    let slot = (addr & !0xfff).wrapping_add((pages << 12) as u64).wrapping_add(u64::from(imm));
    let target = read_target(slots, addr, slot)?;
    if target == 0 {
        return Ok(EntryOutcome::EmptySlot);
    }
    let offset = (target as i64).wrapping_sub(addr as i64);
    if aarch64::branch_in_range(offset) {
        put_word(bytes, 0, aarch64::b(offset / 4));
        Ok(EntryOutcome::Direct)
    } else {
        put_word(bytes, 1, aarch64::ldr(IP0, IP0, imm));
        put_word(bytes, 2, aarch64::br(IP0));
        Ok(EntryOutcome::Indirect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_slots_read_live_memory() {
        let value = Box::new(0x1234_5678u64);
        let slots = unsafe { ProcessSlots::new() };
        assert_eq!(slots.read_slot(&*value as *const u64 as u64), Some(0x1234_5678));
        assert_eq!(slots.read_slot(0), None);
    }
}
