//! AArch64 instruction encoding and decoding for the subset the runtime
//! patches: address materialization, compares, branches and loads.

/// Register the call site pins the target identifier into.
pub const ID_REG: u8 = 13;
/// Scratch register holding `id - min` in range entries.
pub const DELTA_REG: u8 = 14;
/// Scratch register for materialized constants.
pub const CONST_REG: u8 = 15;
/// Intra-procedure-call scratch register used by PLT sequences.
pub const IP0: u8 = 16;
pub const IP1: u8 = 17;

pub const NOP: u32 = 0xD503_201F;

/// Condition codes used by the sled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Ne = 1,
    Hi = 8,
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// `rd = page(pc) + pages * 4096`
    Adrp { rd: u8, pages: i64 },
    AddImm { rd: u8, rn: u8, imm: u32, shift12: bool },
    SubImm { rd: u8, rn: u8, imm: u32, shift12: bool },
    SubReg { rd: u8, rn: u8, rm: u8 },
    CmpReg { rn: u8, rm: u8 },
    CmpImm { rn: u8, imm: u32, shift12: bool },
    /// Offsets are in instructions, relative to this instruction.
    BCond { cond: Cond, offset: i64 },
    B { offset: i64 },
    Movz { rd: u8, imm: u16, shift: u8 },
    Movk { rd: u8, imm: u16, shift: u8 },
    /// 64-bit load, byte offset.
    Ldr { rt: u8, rn: u8, offset: u32 },
    Br { rn: u8 },
    Blr { rn: u8 },
    Nop,
    Brk { imm: u16 },
}

fn reg(r: u8) -> u32 {
    u32::from(r & 0x1f)
}

pub fn adrp(rd: u8, pages: i64) -> u32 {
    let imm = (pages as u32) & 0x1f_ffff;
    0x9000_0000 | ((imm & 0b11) << 29) | ((imm >> 2) << 5) | reg(rd)
}

pub fn add_imm(rd: u8, rn: u8, imm: u32, shift12: bool) -> u32 {
    0x9100_0000 | (u32::from(shift12) << 22) | ((imm & 0xfff) << 10) | (reg(rn) << 5) | reg(rd)
}

pub fn sub_imm(rd: u8, rn: u8, imm: u32, shift12: bool) -> u32 {
    0xD100_0000 | (u32::from(shift12) << 22) | ((imm & 0xfff) << 10) | (reg(rn) << 5) | reg(rd)
}

pub fn sub_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0xCB00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd)
}

pub fn cmp_reg(rn: u8, rm: u8) -> u32 {
    0xEB00_001F | (reg(rm) << 16) | (reg(rn) << 5)
}

pub fn cmp_imm(rn: u8, imm: u32, shift12: bool) -> u32 {
    0xF100_001F | (u32::from(shift12) << 22) | ((imm & 0xfff) << 10) | (reg(rn) << 5)
}

pub fn b_cond(cond: Cond, offset: i64) -> u32 {
    0x5400_0000 | (((offset as u32) & 0x7_ffff) << 5) | cond as u32
}

pub fn b(offset: i64) -> u32 {
    0x1400_0000 | ((offset as u32) & 0x3ff_ffff)
}

pub fn movz(rd: u8, imm: u16, shift: u8) -> u32 {
    0xD280_0000 | (u32::from(shift / 16) << 21) | (u32::from(imm) << 5) | reg(rd)
}

pub fn movk(rd: u8, imm: u16, shift: u8) -> u32 {
    0xF280_0000 | (u32::from(shift / 16) << 21) | (u32::from(imm) << 5) | reg(rd)
}

/// `ldr xt, [xn, #offset]`; `offset` must be a multiple of 8 below 32 KiB.
pub fn ldr(rt: u8, rn: u8, offset: u32) -> u32 {
    0xF940_0000 | (((offset / 8) & 0xfff) << 10) | (reg(rn) << 5) | reg(rt)
}

pub fn br(rn: u8) -> u32 {
    0xD61F_0000 | (reg(rn) << 5)
}

pub fn blr(rn: u8) -> u32 {
    0xD63F_0000 | (reg(rn) << 5)
}

pub fn brk(imm: u16) -> u32 {
    0xD420_0000 | (u32::from(imm) << 5)
}

/// `movz` plus one `movk` per non-zero upper half-word.
pub fn load_constant(rd: u8, value: u64) -> Vec<u32> {
    let mut out = vec![movz(rd, (value & 0xffff) as u16, 0)];
    for shift in [16u8, 32, 48] {
        let part = ((value >> shift) & 0xffff) as u16;
        if part != 0 {
            out.push(movk(rd, part, shift));
        }
    }
    out
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((u64::from(value) << shift) as i64) >> shift
}

/// Whether `offset` bytes fits a `b` instruction (+/-128 MiB, word aligned).
pub fn branch_in_range(offset: i64) -> bool {
    offset % 4 == 0 && (-(1i64 << 27)..(1i64 << 27)).contains(&offset)
}

/// Whether a page distance fits `adrp` (+/-4 GiB).
pub fn adrp_in_range(pages: i64) -> bool {
    (-(1i64 << 20)..(1i64 << 20)).contains(&pages)
}

pub fn decode(word: u32) -> Option<Insn> {
    let rd = (word & 0x1f) as u8;
    let rn = ((word >> 5) & 0x1f) as u8;
    let rm = ((word >> 16) & 0x1f) as u8;
    let imm12 = (word >> 10) & 0xfff;
    let shift12 = (word >> 22) & 1 == 1;

    if word & 0x9F00_0000 == 0x9000_0000 {
        let raw = (((word >> 5) & 0x7_ffff) << 2) | ((word >> 29) & 0b11);
        return Some(Insn::Adrp { rd, pages: sign_extend(raw, 21) });
    }
    match word & 0xFF80_0000 {
        0x9100_0000 => return Some(Insn::AddImm { rd, rn, imm: imm12, shift12 }),
        0xD100_0000 => return Some(Insn::SubImm { rd, rn, imm: imm12, shift12 }),
        0xF100_0000 if rd == 31 => return Some(Insn::CmpImm { rn, imm: imm12, shift12 }),
        0xD280_0000 => {
            return Some(Insn::Movz { rd, imm: ((word >> 5) & 0xffff) as u16, shift: (((word >> 21) & 3) * 16) as u8 })
        }
        0xF280_0000 => {
            return Some(Insn::Movk { rd, imm: ((word >> 5) & 0xffff) as u16, shift: (((word >> 21) & 3) * 16) as u8 })
        }
        _ => {}
    }
    if word & 0xFFE0_FC00 == 0xCB00_0000 {
        return Some(Insn::SubReg { rd, rn, rm });
    }
    if word & 0xFFE0_FC1F == 0xEB00_001F {
        return Some(Insn::CmpReg { rn, rm });
    }
    if word & 0xFF00_0010 == 0x5400_0000 {
        let cond = match word & 0xf {
            1 => Cond::Ne,
            8 => Cond::Hi,
            _ => return None,
        };
        return Some(Insn::BCond { cond, offset: sign_extend((word >> 5) & 0x7_ffff, 19) });
    }
    if word & 0xFC00_0000 == 0x1400_0000 {
        return Some(Insn::B { offset: sign_extend(word & 0x3ff_ffff, 26) });
    }
    if word & 0xFFC0_0000 == 0xF940_0000 {
        return Some(Insn::Ldr { rt: rd, rn, offset: imm12 * 8 });
    }
    if word & 0xFFFF_FC1F == 0xD61F_0000 {
        return Some(Insn::Br { rn });
    }
    if word & 0xFFFF_FC1F == 0xD63F_0000 {
        return Some(Insn::Blr { rn });
    }
    if word == NOP {
        return Some(Insn::Nop);
    }
    if word & 0xFFE0_001F == 0xD420_0000 {
        return Some(Insn::Brk { imm: ((word >> 5) & 0xffff) as u16 });
    }
    None
}

/// Whether `word` is `br xN` or `blr xN`.
pub fn is_indirect_branch(word: u32) -> bool {
    matches!(word & 0xFFFF_FC1F, 0xD61F_0000 | 0xD63F_0000)
}
