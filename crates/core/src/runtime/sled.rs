//! Runtime branch sled.
//!
//! A sled is `capacity` instruction words followed by one fallback word.
//! Execution enters at word 0 with the identifier in `x13` and walks a chain
//! of entries; each entry either branches to its target or falls through to
//! the next one. The chain always ends in a link word that branches to the
//! fallback word, which jumps to the resolver (primary sled) or traps
//! (secondary sled).
//!
//! Entries are appended at the link word. When an entry plus its link word
//! no longer fits, writing restarts at word 0 and a new generation begins:
//! entries past the new link word stop being checked, their ranges may be
//! registered again, and single identifiers are re-learned on their next
//! miss. The fallback word is written once and never touched again.

use thiserror::Error;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::runtime::aarch64::{self, Cond, Insn, CONST_REG, DELTA_REG, ID_REG};
use crate::runtime::region::{CodeRegion, RegionError};

#[derive(Debug, Error)]
pub enum SledError {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("Region of {len:#x} bytes cannot hold a sled needing {needed:#x} bytes")]
    RegionTooSmall { needed: usize, len: usize },

    #[error("Invalid identifier range {min}..={max}")]
    InvalidRange { min: u64, max: u64 },

    #[error("Identifier range {min}..={max} overlaps registered range {existing_min}..={existing_max}")]
    OverlappingRange { min: u64, max: u64, existing_min: u64, existing_max: u64 },

    #[error("Branch from {from:#x} to {to:#x} is out of range")]
    OutOfRange { from: u64, to: u64 },

    #[error("Entry of {words} words does not fit a sled of {capacity} words")]
    EntryTooLarge { words: usize, capacity: usize },

    #[error("Undecodable word {word:#010x} at sled index {index}")]
    Undecodable { index: usize, word: u32 },

    #[error("Sled walk did not terminate for identifier {0:#x}")]
    Runaway(u64),

    #[error("No target known for identifier {0:#x}")]
    Unresolved(u64),

    #[error("Identifier {0:#x} trapped")]
    Trapped(u64),
}

/// What the fallback word does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Branch to the resolver entry at this address.
    Resolver(u64),
    Trap,
}

/// Fill state of the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SledState {
    /// Only the link word to the fallback.
    Empty,
    Partial,
    /// Not even the smallest entry fits; the next write wraps.
    Full,
}

/// Words in the smallest entry either kind of append can produce.
const MIN_ENTRY_WORDS: usize = 4;

/// Where an identifier ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Target(u64),
    Fallback,
    Trap,
}

/// Serves sled misses.
pub trait SledResolver {
    /// Address for `id`, or `None` if it is not a valid target.
    fn resolve(&mut self, id: u64) -> Option<u64>;
}

impl<F> SledResolver for F
where
    F: FnMut(u64) -> Option<u64>,
{
    fn resolve(&mut self, id: u64) -> Option<u64> {
        self(id)
    }
}

pub struct BranchSled<R: CodeRegion> {
    region: R,
    capacity: usize,
    /// Index of the current link word.
    cursor: usize,
    wrapped: bool,
    fallback: Fallback,
    /// Ranges reachable in the current generation.
    ranges: Vec<(u64, u64)>,
    entries: usize,
    /// Entries written since the last wrap.
    live: usize,
}

/// Bytes a sled of `capacity` words occupies.
pub fn sled_len(capacity: usize) -> usize {
    (capacity + 1) * 4
}

impl<R: CodeRegion> BranchSled<R> {
    /// Lay out an empty sled at the start of `region`.
    pub fn new(mut region: R, capacity: usize, fallback: Fallback) -> Result<Self, SledError> {
        let needed = sled_len(capacity);
        if region.len() < needed || capacity == 0 {
            return Err(SledError::RegionTooSmall { needed, len: region.len() });
        }
        let fallback_word = match fallback {
            Fallback::Resolver(target) => branch(region.base(), capacity, target)?,
            Fallback::Trap => aarch64::brk(1),
        };
        region.write_words(capacity, &[fallback_word])?;
        let mut sled = Self {
            region,
            capacity,
            cursor: 0,
            wrapped: false,
            fallback,
            ranges: Vec::new(),
            entries: 0,
            live: 0,
        };
        let link = sled.link_word(0);
        sled.region.write_words(0, &[link])?;
        Ok(sled)
    }

    /// The general sled, falling back to `resolver`.
    pub fn primary(region: R, config: &RuntimeConfig, resolver: u64) -> Result<Self, SledError> {
        Self::new(region, config.sled_capacity, Fallback::Resolver(resolver))
    }

    /// The secondary sled, which only serves registered ranges and traps otherwise.
    pub fn secondary(region: R, config: &RuntimeConfig) -> Result<Self, SledError> {
        Self::new(region, config.secondary_capacity, Fallback::Trap)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries written so far, including overwritten ones.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Entries reachable from the sled entry point.
    pub fn live_entries(&self) -> usize {
        self.live
    }

    /// Whether writing has restarted at word 0 at least once.
    pub fn has_wrapped(&self) -> bool {
        self.wrapped
    }

    pub fn state(&self) -> SledState {
        if self.cursor + MIN_ENTRY_WORDS + 1 > self.capacity {
            SledState::Full
        } else if self.live == 0 {
            SledState::Empty
        } else {
            SledState::Partial
        }
    }

    pub fn entry_address(&self) -> u64 {
        self.region.base()
    }

    pub fn fallback_address(&self) -> u64 {
        self.address(self.capacity)
    }

    pub fn fallback(&self) -> Fallback {
        self.fallback
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn into_region(self) -> R {
        self.region
    }

    fn address(&self, index: usize) -> u64 {
        self.region.base() + (index as u64) * 4
    }

    fn link_word(&self, index: usize) -> u32 {
        aarch64::b((self.capacity - index) as i64)
    }

    /// Add an entry sending exactly `id` to `target`. An identifier the
    /// sled already routes to a target is left alone.
    pub fn learn(&mut self, id: u64, target: u64) -> Result<(), SledError> {
        if let Route::Target(existing) = self.route(id)? {
            debug!(id, existing = format!("{existing:#x}"), "identifier already in sled");
            return Ok(());
        }
        let base = self.region.base();
        self.append(|index| {
            let here = base + (index as u64) * 4;
            let mut words = Vec::with_capacity(6);
            let pages = ((id & !0xfff) as i64).wrapping_sub((here & !0xfff) as i64) >> 12;
            if id == target && aarch64::adrp_in_range(pages) {
                words.push(aarch64::adrp(CONST_REG, pages));
                words.push(aarch64::add_imm(CONST_REG, CONST_REG, (id & 0xfff) as u32, false));
            } else {
                words.extend(aarch64::load_constant(CONST_REG, id));
            }
            words.push(aarch64::cmp_reg(ID_REG, CONST_REG));
            words.push(aarch64::b_cond(Cond::Ne, 2));
            words.push(branch(base, index + words.len(), target)?);
            Ok(words)
        })?;
        debug!(id, target = format!("{target:#x}"), entries = self.entries, "learned sled entry");
        Ok(())
    }

    /// Send every identifier in `min..=max` to `handler`.
    pub fn register_handler(&mut self, handler: u64, min: u64, max: u64) -> Result<(), SledError> {
        if min > max {
            return Err(SledError::InvalidRange { min, max });
        }
        if let Some((existing_min, existing_max)) = self.ranges.iter().find(|(a, b)| min <= *b && *a <= max) {
            return Err(SledError::OverlappingRange { min, max, existing_min: *existing_min, existing_max: *existing_max });
        }
        let base = self.region.base();
        self.append(|index| {
            let mut words = Vec::new();
            if min <= 0xff_ffff {
                words.push(aarch64::sub_imm(DELTA_REG, ID_REG, (min & 0xfff) as u32, false));
                if min > 0xfff {
                    words.push(aarch64::sub_imm(DELTA_REG, DELTA_REG, ((min >> 12) & 0xfff) as u32, true));
                }
            } else {
                words.extend(aarch64::load_constant(CONST_REG, min));
                words.push(aarch64::sub_reg(DELTA_REG, ID_REG, CONST_REG));
            }
            let span = max - min;
            if span < 4096 {
                words.push(aarch64::cmp_imm(DELTA_REG, span as u32, false));
            } else {
                words.extend(aarch64::load_constant(CONST_REG, span));
                words.push(aarch64::cmp_reg(DELTA_REG, CONST_REG));
            }
            words.push(aarch64::b_cond(Cond::Hi, 2));
            words.push(branch(base, index + words.len(), handler)?);
            Ok(words)
        })?;
        self.ranges.push((min, max));
        info!(handler = format!("{handler:#x}"), min, max, "registered sled handler");
        Ok(())
    }

    /// Write an entry at the link word, wrapping when it does not fit.
    fn append(&mut self, build: impl Fn(usize) -> Result<Vec<u32>, SledError>) -> Result<(), SledError> {
        let mut index = self.cursor;
        let mut words = build(index)?;
        if words.len() + 1 > self.capacity {
            return Err(SledError::EntryTooLarge { words: words.len(), capacity: self.capacity });
        }
        if index + words.len() + 1 > self.capacity {
            debug!(entries = self.entries, live = self.live, "sled full, wrapping around");
            self.wrapped = true;
            self.live = 0;
            self.ranges.clear();
            index = 0;
            words = build(index)?;
        }
        let end = index + words.len();
        words.push(self.link_word(end));
        self.region.write_words(index, &words)?;
        self.cursor = end;
        self.entries += 1;
        self.live += 1;
        Ok(())
    }

    /// Walk the sled for `id` without executing it.
    pub fn route(&self, id: u64) -> Result<Route, SledError> {
        let mut regs = [0u64; 32];
        regs[ID_REG as usize] = id;
        let mut flags = (0u64, 0u64);
        let mut pc = 0usize;

        for _ in 0..4 * (self.capacity + 1) {
            if pc == self.capacity {
                return Ok(match self.fallback {
                    Fallback::Resolver(_) => Route::Fallback,
                    Fallback::Trap => Route::Trap,
                });
            }
            let word = self.region.read_word(pc).ok_or(SledError::Undecodable { index: pc, word: 0 })?;
            let insn = aarch64::decode(word).ok_or(SledError::Undecodable { index: pc, word })?;
            let here = self.address(pc);
            let mut next = pc + 1;
            match insn {
                Insn::Adrp { rd, pages } => {
                    regs[rd as usize] = (here & !0xfff).wrapping_add((pages << 12) as u64);
                }
                Insn::AddImm { rd, rn, imm, shift12 } => {
                    regs[rd as usize] = regs[rn as usize].wrapping_add(shifted(imm, shift12));
                }
                Insn::SubImm { rd, rn, imm, shift12 } => {
                    regs[rd as usize] = regs[rn as usize].wrapping_sub(shifted(imm, shift12));
                }
                Insn::SubReg { rd, rn, rm } => {
                    regs[rd as usize] = regs[rn as usize].wrapping_sub(regs[rm as usize]);
                }
                Insn::CmpReg { rn, rm } => flags = (regs[rn as usize], regs[rm as usize]),
                Insn::CmpImm { rn, imm, shift12 } => flags = (regs[rn as usize], shifted(imm, shift12)),
                Insn::Movz { rd, imm, shift } => regs[rd as usize] = u64::from(imm) << shift,
                Insn::Movk { rd, imm, shift } => {
                    let r = &mut regs[rd as usize];
                    *r = (*r & !(0xffffu64 << shift)) | (u64::from(imm) << shift);
                }
                Insn::BCond { cond, offset } => {
                    let taken = match cond {
                        Cond::Ne => flags.0 != flags.1,
                        Cond::Hi => flags.0 > flags.1,
                    };
                    if taken {
                        next = (pc as i64 + offset) as usize;
                    }
                }
                Insn::B { offset } => {
                    let target = here.wrapping_add((offset * 4) as u64);
                    match self.index_of(target) {
                        Some(index) => next = index,
                        None => return Ok(Route::Target(target)),
                    }
                }
                Insn::Brk { .. } => return Ok(Route::Trap),
                Insn::Nop => {}
                Insn::Ldr { .. } | Insn::Br { .. } | Insn::Blr { .. } => {
                    return Err(SledError::Undecodable { index: pc, word })
                }
            }
            pc = next;
        }
        Err(SledError::Runaway(id))
    }

    fn index_of(&self, addr: u64) -> Option<usize> {
        let base = self.region.base();
        if addr < base || addr > self.fallback_address() || (addr - base) % 4 != 0 {
            return None;
        }
        Some(((addr - base) / 4) as usize)
    }

    /// Route `id`, learning it from `resolver` on a miss.
    pub fn dispatch(&mut self, id: u64, resolver: &mut impl SledResolver) -> Result<u64, SledError> {
        match self.route(id)? {
            Route::Target(target) => Ok(target),
            Route::Trap => Err(SledError::Trapped(id)),
            Route::Fallback => {
                let target = resolver.resolve(id).ok_or(SledError::Unresolved(id))?;
                self.learn(id, target)?;
                match self.route(id)? {
                    Route::Target(found) => Ok(found),
                    _ => Err(SledError::Unresolved(id)),
                }
            }
        }
    }
}

fn shifted(imm: u32, shift12: bool) -> u64 {
    u64::from(imm) << if shift12 { 12 } else { 0 }
}

/// `b target` placed at word `index` of a sled at `base`.
fn branch(base: u64, index: usize, target: u64) -> Result<u32, SledError> {
    let from = base + (index as u64) * 4;
    let offset = (target as i64).wrapping_sub(from as i64);
    if !aarch64::branch_in_range(offset) {
        return Err(SledError::OutOfRange { from, to: target });
    }
    Ok(aarch64::b(offset / 4))
}
