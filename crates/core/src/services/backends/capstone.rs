use capstone::{arch, prelude::*, Capstone, InsnGroupId};

use crate::services::scan::{
    canonical_arch, read_binary, ElfImage, IndirectBranch, ScanBackend, ScanError, ScanReport, ScanRequest,
};

/// Disassembling scanner for x86-64 and AArch64.
///
/// Reports every call or jump whose target is not an immediate, so it also
/// catches `call *%rax` and `jmp *(%rip)` forms the word scanner cannot see.
pub struct CapstoneScanner;

fn capstone_version() -> String {
    let (major, minor) = Capstone::lib_version();
    format!("{major}.{minor}")
}

fn make_cs(arch: &str) -> Result<Capstone, ScanError> {
    let built = match arch {
        "x86_64" => Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).detail(true).build(),
        "aarch64" => Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).detail(true).build(),
        other => {
            return Err(ScanError::UnsupportedArch { backend: "capstone".to_string(), arch: other.to_string() })
        }
    };
    built.map_err(|e| ScanError::Backend(format!("capstone init failed: {e}")))
}

fn has_group(detail: &capstone::InsnDetail, group: u8) -> bool {
    detail.groups().iter().any(|g| *g == InsnGroupId(group))
}

fn is_immediate(op: &capstone::arch::ArchOperand) -> bool {
    match op {
        capstone::arch::ArchOperand::X86Operand(x) => {
            matches!(x.op_type, capstone::arch::x86::X86OperandType::Imm(_))
        }
        capstone::arch::ArchOperand::Arm64Operand(x) => {
            matches!(x.op_type, capstone::arch::arm64::Arm64OperandType::Imm(_))
        }
        _ => false,
    }
}

impl ScanBackend for CapstoneScanner {
    fn scan(&self, request: &ScanRequest) -> Result<ScanReport, ScanError> {
        let bytes = read_binary(&request.path)?;
        let image = ElfImage::parse(&request.path, &bytes)?;
        let arch = canonical_arch(request.arch.as_deref().unwrap_or(&image.arch));
        let cs = make_cs(&arch)?;

        let mut branches: Vec<IndirectBranch> = Vec::new();
        for range in &image.code {
            let insns = cs
                .disasm_all(&bytes[range.start..range.end], range.addr)
                .map_err(|e| ScanError::Backend(format!("disassembly failed at {:#x}: {e}", range.addr)))?;
            for insn in insns.iter() {
                let Ok(detail) = cs.insn_detail(insn) else { continue };
                let is_transfer = has_group(&detail, capstone::InsnGroupType::CS_GRP_CALL as u8)
                    || has_group(&detail, capstone::InsnGroupType::CS_GRP_JUMP as u8);
                if !is_transfer || has_group(&detail, capstone::InsnGroupType::CS_GRP_RET as u8) {
                    continue;
                }
                let operands = detail.arch_detail().operands();
                if operands.is_empty() || operands.iter().any(is_immediate) {
                    continue;
                }
                let text = format!("{} {}", insn.mnemonic().unwrap_or(""), insn.op_str().unwrap_or(""));
                branches.push(image.branch(insn.address(), text.trim()));
            }
        }

        tracing::info!(
            path = %request.path.display(),
            capstone = %capstone_version(),
            found = branches.len(),
            "disassembled for indirect branches"
        );
        Ok(ScanReport { backend: self.name().to_string(), arch, branches })
    }

    fn name(&self) -> &'static str {
        "capstone"
    }
}
