//! x86-64 jump encodings used by the PLT patcher.

/// `jmp *rel32(%rip)`, the first instruction of a lazy PLT entry.
pub const JMP_RIP_INDIRECT: [u8; 2] = [0xff, 0x25];
pub const JMP_REL32: u8 = 0xe9;
/// `movabs $imm64, %r11`
pub const MOVABS_R11: [u8; 2] = [0x49, 0xbb];
/// `jmp *%r11`
pub const JMP_R11: [u8; 3] = [0x41, 0xff, 0xe3];

/// Length of `jmp *rel32(%rip)`.
pub const JMP_RIP_LEN: u64 = 6;
pub const JMP_REL32_LEN: u64 = 5;

/// Displacement of `jmp *rel32(%rip)` at the start of `bytes`.
pub fn decode_jmp_rip(bytes: &[u8]) -> Option<i32> {
    if bytes.len() < 6 || bytes[..2] != JMP_RIP_INDIRECT {
        return None;
    }
    Some(i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]))
}

/// `jmp rel32` from `from` to `to`, if the displacement fits.
pub fn jmp_rel32(from: u64, to: u64) -> Option<[u8; 5]> {
    let delta = (to as i64).wrapping_sub(from.wrapping_add(JMP_REL32_LEN) as i64);
    let rel = i32::try_from(delta).ok()?;
    let mut out = [JMP_REL32, 0, 0, 0, 0];
    out[1..].copy_from_slice(&rel.to_le_bytes());
    Some(out)
}

/// `movabs $target, %r11; jmp *%r11`
pub fn jmp_absolute(target: u64) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[..2].copy_from_slice(&MOVABS_R11);
    out[2..10].copy_from_slice(&target.to_le_bytes());
    out[10..].copy_from_slice(&JMP_R11);
    out
}

/// Whether `bytes` starts with one of the sequences the patcher writes.
pub fn is_patched(bytes: &[u8]) -> bool {
    bytes.first() == Some(&JMP_REL32) || bytes.starts_with(&MOVABS_R11)
}
