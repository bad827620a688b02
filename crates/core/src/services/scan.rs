//! Residual indirect-branch scanning of linked binaries.
//!
//! Backends implement [`ScanBackend`] and are looked up by name through a
//! [`ScanRegistry`]. The pattern scanner matches `br`/`blr` encodings word by
//! word and is always available; the disassembling scanner lives behind the
//! `capstone-backend` feature.

use std::collections::HashMap;
use std::path::PathBuf;

use goblin::elf::{header, program_header, section_header};
use goblin::Object;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::runtime::aarch64::{self, Insn};

/// Startup code allowed to branch indirectly near its entry: symbol and
/// the largest tolerated offset.
const TOLERATED_PROLOGUES: &[(&str, u64)] = &[("libc_start_init", 0x100)];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Binary not found at {0}")]
    MissingBinary(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Backend {backend} does not support architecture {arch}")]
    UnsupportedArch { backend: String, arch: String },

    #[error("Scan backend error: {0}")]
    Backend(String),

    #[error("Scan backend not found: {name} (available: {available})")]
    MissingBackend { name: String, available: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub path: PathBuf,
    /// Overrides the architecture from the ELF header (`aarch64`, `x86_64`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// An indirect branch found in executable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectBranch {
    pub address: u64,
    /// Nearest preceding function symbol.
    pub symbol: Option<String>,
    /// Distance from that symbol.
    pub offset: u64,
    pub mnemonic: String,
    /// False for branches in tolerated startup code.
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub backend: String,
    pub arch: String,
    pub branches: Vec<IndirectBranch>,
}

impl ScanReport {
    pub fn critical_count(&self) -> usize {
        self.branches.iter().filter(|b| b.critical).count()
    }
}

pub trait ScanBackend: Send + Sync {
    fn scan(&self, request: &ScanRequest) -> Result<ScanReport, ScanError>;
    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct ScanRegistry {
    backends: HashMap<String, Box<dyn ScanBackend>>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self { backends: HashMap::new() }
    }

    pub fn register<B: ScanBackend + 'static>(&mut self, backend: B) -> &mut Self {
        self.backends.insert(backend.name().to_string(), Box::new(backend));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn ScanBackend> {
        self.backends.get(name).map(|b| &**b)
    }

    /// Like [`get`](Self::get), with the available names in the error.
    pub fn require(&self, name: &str) -> Result<&dyn ScanBackend, ScanError> {
        self.get(name)
            .ok_or_else(|| ScanError::MissingBackend { name: name.to_string(), available: self.names().join(", ") })
    }

    /// Sorted backend names, for help text and errors.
    pub fn names(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.backends.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Registry with every backend compiled in.
pub fn default_scan_registry() -> ScanRegistry {
    let mut registry = ScanRegistry::new();
    registry.register(PatternScanner);
    #[cfg(feature = "capstone-backend")]
    {
        registry.register(crate::services::backends::CapstoneScanner);
    }
    registry
}

/// Executable bytes mapped at `addr`, as a range of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CodeRange {
    pub addr: u64,
    pub start: usize,
    pub end: usize,
}

/// What the scanners need from an ELF file.
#[derive(Debug, Clone)]
pub(crate) struct ElfImage {
    pub arch: String,
    pub code: Vec<CodeRange>,
    /// Function symbols sorted by address.
    pub symbols: Vec<(u64, String)>,
}

impl ElfImage {
    /// Executable `PT_LOAD` segments; object files without program headers
    /// fall back to executable sections.
    pub fn parse(path: &PathBuf, bytes: &[u8]) -> Result<Self, ScanError> {
        let parse_error = |reason: String| ScanError::Parse { path: path.clone(), reason };
        let elf = match Object::parse(bytes) {
            Ok(Object::Elf(elf)) => elf,
            Ok(_) => return Err(parse_error("not an ELF file".to_string())),
            Err(e) => return Err(parse_error(e.to_string())),
        };

        let arch = match elf.header.e_machine {
            header::EM_AARCH64 => "aarch64".to_string(),
            header::EM_X86_64 => "x86_64".to_string(),
            other => format!("elf-machine-{other}"),
        };

        let clamp = |addr: u64, offset: u64, size: u64| {
            let start = (offset as usize).min(bytes.len());
            let end = (offset.saturating_add(size) as usize).min(bytes.len());
            (end > start).then_some(CodeRange { addr, start, end })
        };

        let mut code: Vec<CodeRange> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == program_header::PT_LOAD && ph.p_flags & program_header::PF_X != 0)
            .filter_map(|ph| clamp(ph.p_vaddr, ph.p_offset, ph.p_filesz))
            .collect();
        if code.is_empty() {
            code = elf
                .section_headers
                .iter()
                .filter(|sh| {
                    sh.sh_flags & u64::from(section_header::SHF_EXECINSTR) != 0
                        && sh.sh_type != section_header::SHT_NOBITS
                })
                .filter_map(|sh| clamp(sh.sh_addr, sh.sh_offset, sh.sh_size))
                .collect();
        }

        let mut symbols = Vec::new();
        for (syms, strtab) in [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)] {
            for sym in syms.iter() {
                if !sym.is_function() || sym.st_shndx == section_header::SHN_UNDEF as usize {
                    continue;
                }
                match strtab.get_at(sym.st_name) {
                    Some(name) if !name.is_empty() => symbols.push((sym.st_value, name.to_string())),
                    _ => {}
                }
            }
        }
        symbols.sort();
        symbols.dedup();

        debug!(path = %path.display(), arch = %arch, ranges = code.len(), symbols = symbols.len(), "parsed ELF");
        Ok(Self { arch, code, symbols })
    }

    /// Nearest function symbol at or before `addr`, with the distance.
    pub fn symbolize(&self, addr: u64) -> (Option<String>, u64) {
        let idx = self.symbols.partition_point(|(a, _)| *a <= addr);
        match idx.checked_sub(1).and_then(|i| self.symbols.get(i)) {
            Some((start, name)) => (Some(name.clone()), addr - start),
            None => (None, addr),
        }
    }

    pub fn branch(&self, address: u64, mnemonic: impl Into<String>) -> IndirectBranch {
        let (symbol, offset) = self.symbolize(address);
        let critical = !is_tolerated(symbol.as_deref(), offset);
        IndirectBranch { address, symbol, offset, mnemonic: mnemonic.into(), critical }
    }
}

fn is_tolerated(symbol: Option<&str>, offset: u64) -> bool {
    symbol.is_some_and(|s| TOLERATED_PROLOGUES.iter().any(|(name, limit)| *name == s && offset <= *limit))
}

pub(crate) fn read_binary(path: &PathBuf) -> Result<Vec<u8>, ScanError> {
    if !path.is_file() {
        return Err(ScanError::MissingBinary(path.clone()));
    }
    std::fs::read(path).map_err(|source| ScanError::Io { path: path.clone(), source })
}

/// Normalize architecture spellings.
pub(crate) fn canonical_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "arm64" | "aarch64" => "aarch64".to_string(),
        "amd64" | "x86_64" | "x86-64" => "x86_64".to_string(),
        other => other.to_string(),
    }
}

/// Word-pattern scanner for AArch64.
pub struct PatternScanner;

impl ScanBackend for PatternScanner {
    fn scan(&self, request: &ScanRequest) -> Result<ScanReport, ScanError> {
        let bytes = read_binary(&request.path)?;
        let image = ElfImage::parse(&request.path, &bytes)?;
        let arch = canonical_arch(request.arch.as_deref().unwrap_or(&image.arch));
        if arch != "aarch64" {
            return Err(ScanError::UnsupportedArch { backend: self.name().to_string(), arch });
        }

        let mut branches = Vec::new();
        for range in &image.code {
            for (i, chunk) in bytes[range.start..range.end].chunks_exact(4).enumerate() {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if !aarch64::is_indirect_branch(word) {
                    continue;
                }
                let mnemonic = match aarch64::decode(word) {
                    Some(Insn::Br { rn }) => format!("br x{rn}"),
                    Some(Insn::Blr { rn }) => format!("blr x{rn}"),
                    _ => format!("{word:#010x}"),
                };
                branches.push(image.branch(range.addr + (i as u64) * 4, mnemonic));
            }
        }

        let report = ScanReport { backend: self.name().to_string(), arch, branches };
        info!(
            path = %request.path.display(),
            found = report.branches.len(),
            critical = report.critical_count(),
            "scanned for indirect branches"
        );
        Ok(report)
    }

    fn name(&self) -> &'static str {
        "pattern"
    }
}
