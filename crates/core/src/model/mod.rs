//! Core data model (IR) for programs, functions, blocks and instructions.
//!
//! The hardening stages operate on an explicit, serializable program value:
//! - `Program` owns functions, globals and the constructor list
//! - `Function` carries a `Signature` and an optional `Body` (declarations have none)
//! - `Body` is an instruction arena plus an ordered list of basic blocks
//!
//! Handles (`FuncId`, `GlobalId`, `BlockId`, `InstId`) are indices and stay
//! stable while instructions are inserted, moved between blocks or erased.

pub mod builder;
pub mod interp;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use builder::Builder;

/// Value types understood by the matcher and the code generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Void,
    Int(u32),
    Float(u32),
    Ptr,
    Struct(Vec<Type>),
    Array(Box<Type>, u32),
}

impl Type {
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Ptr)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Struct(_) | Type::Array(..))
    }

    /// Size in bits for the given pointer width. `Void` is unsized (0).
    pub fn size_bits(&self, pointer_bits: u32) -> u32 {
        match self {
            Type::Void => 0,
            Type::Int(bits) | Type::Float(bits) => *bits,
            Type::Ptr => pointer_bits,
            Type::Struct(fields) => fields.iter().map(|f| f.size_bits(pointer_bits)).sum(),
            Type::Array(elem, len) => elem.size_bits(pointer_bits) * len,
        }
    }

    /// Field types of an aggregate, expanded for arrays.
    pub fn fields(&self) -> Vec<Type> {
        match self {
            Type::Struct(fields) => fields.clone(),
            Type::Array(elem, len) => vec![(**elem).clone(); *len as usize],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Float(bits) => write!(f, "f{bits}"),
            Type::Ptr => write!(f, "ptr"),
            Type::Struct(fields) => {
                write!(f, "{{")?;
                for (idx, field) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "}}")
            }
            Type::Array(elem, len) => write!(f, "[{len} x {elem}]"),
        }
    }
}

/// Function type: parameters, return type and variadic flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
    #[serde(default)]
    pub variadic: bool,
}

impl Signature {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret, variadic: false }
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }
}

/// Target architecture of the program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Aarch64,
    X86_64,
}

impl Arch {
    /// Register that carries the raw identifier into the runtime resolver.
    pub fn scratch_register(self) -> &'static str {
        match self {
            Arch::Aarch64 => "x13",
            Arch::X86_64 => "r11",
        }
    }

    /// Speculation barrier mnemonic emitted at the top of dispatch cases.
    pub fn barrier_mnemonic(self) -> &'static str {
        match self {
            Arch::Aarch64 => "csdb",
            Arch::X86_64 => "lfence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstId(pub u32);

/// Program-wide handle of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstRef {
    pub func: FuncId,
    pub inst: InstId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    #[default]
    Internal,
    External,
}

/// Constant operands. Floats are stored as raw IEEE bits so values stay `Eq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Const {
    Int { bits: u32, value: u64 },
    Float { bits: u32, raw: u64 },
    Null,
    /// Pointer-typed integer, e.g. a function identifier after replacement.
    Addr(u64),
}

impl Const {
    pub fn float(bits: u32, value: f64) -> Self {
        let raw = if bits == 32 { (value as f32).to_bits() as u64 } else { value.to_bits() };
        Const::Float { bits, raw }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Arg(u32),
    Inst(InstId),
    Const(Const),
    Func(FuncId),
    Global(GlobalId),
    Undef(Type),
}

impl Value {
    pub fn int(bits: u32, value: u64) -> Self {
        Value::Const(Const::Int { bits, value })
    }

    pub fn addr(value: u64) -> Self {
        Value::Const(Const::Addr(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Direct(FuncId),
    Indirect(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastOp {
    Bitcast,
    PtrToInt,
    IntToPtr,
    IntCast { signed: bool },
    FpCast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Ult,
    Ugt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstKind {
    Call { callee: Callee, args: Vec<Value>, #[serde(default)] tail: bool },
    Cast { op: CastOp, value: Value },
    Binary { op: BinOp, lhs: Value, rhs: Value },
    Cmp { op: CmpOp, lhs: Value, rhs: Value },
    ExtractValue { aggregate: Value, index: u32 },
    InsertValue { aggregate: Value, value: Value, index: u32 },
    Load { global: GlobalId, index: u32 },
    Store { global: GlobalId, index: u32, value: Value },
    Phi { incoming: Vec<(BlockId, Value)> },
    SpeculationBarrier,
    /// Moves a raw identifier into the architecture's resolver register.
    PinScratch { value: Value },
    /// Reads the resolver register (pointer typed).
    ReadScratch,
    Diagnostic { message: String, value: Value },
    Br { target: BlockId },
    CondBr { cond: Value, then_block: BlockId, else_block: BlockId },
    Switch { value: Value, default: BlockId, cases: Vec<(u64, BlockId)> },
    Ret { value: Option<Value> },
    Trap,
    Unreachable,
}

/// One instruction: its operation and the type of the value it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    #[serde(default = "void_type")]
    pub ty: Type,
}

fn void_type() -> Type {
    Type::Void
}

impl Inst {
    pub fn new(kind: InstKind, ty: Type) -> Self {
        Self { kind, ty }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::Ret { .. }
                | InstKind::Trap
                | InstKind::Unreachable
        )
    }

    pub fn is_indirect_call(&self) -> bool {
        matches!(self.kind, InstKind::Call { callee: Callee::Indirect(_), .. })
    }

    /// Successor blocks of a terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match &self.kind {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr { then_block, else_block, .. } => vec![*then_block, *else_block],
            InstKind::Switch { default, cases, .. } => {
                let mut out = vec![*default];
                out.extend(cases.iter().map(|(_, b)| *b));
                out
            }
            _ => Vec::new(),
        }
    }

    /// Visit every value operand. Direct callees are not values and are skipped.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match &mut self.kind {
            InstKind::Call { callee, args, .. } => {
                if let Callee::Indirect(v) = callee {
                    f(v);
                }
                args.iter_mut().for_each(f);
            }
            InstKind::Cast { value, .. }
            | InstKind::PinScratch { value }
            | InstKind::Diagnostic { value, .. }
            | InstKind::Store { value, .. } => f(value),
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::ExtractValue { aggregate, .. } => f(aggregate),
            InstKind::InsertValue { aggregate, value, .. } => {
                f(aggregate);
                f(value);
            }
            InstKind::Phi { incoming } => incoming.iter_mut().for_each(|(_, v)| f(v)),
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Switch { value, .. } => f(value),
            InstKind::Ret { value: Some(v) } => f(v),
            _ => {}
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        let mut out = Vec::new();
        let mut copy = self.clone();
        copy.for_each_operand_mut(|v| out.push(v.clone()));
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub insts: Vec<InstId>,
}

/// Instruction arena plus block layout. Block 0 is the entry block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
}

impl Body {
    pub fn new() -> Self {
        Self { blocks: vec![Block::default()], insts: Vec::new() }
    }

    pub fn add_block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        BlockId(self.blocks.len() as u32 - 1)
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Allocate an instruction and place it in `block` at `pos` (append when `None`).
    pub fn insert(&mut self, block: BlockId, pos: Option<usize>, inst: Inst) -> InstId {
        self.insts.push(inst);
        let id = InstId(self.insts.len() as u32 - 1);
        let insts = &mut self.blocks[block.0 as usize].insts;
        match pos {
            Some(p) if p <= insts.len() => insts.insert(p, id),
            _ => insts.push(id),
        }
        id
    }

    /// Block and position of a placed instruction.
    pub fn locate(&self, id: InstId) -> Option<(BlockId, usize)> {
        self.blocks.iter().enumerate().find_map(|(b, block)| {
            block.insts.iter().position(|i| *i == id).map(|p| (BlockId(b as u32), p))
        })
    }

    /// Unlink an instruction from its block. The arena slot stays behind.
    pub fn erase(&mut self, id: InstId) {
        if let Some((block, pos)) = self.locate(id) {
            self.blocks[block.0 as usize].insts.remove(pos);
        }
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        self.blocks[block.0 as usize]
            .insts
            .last()
            .copied()
            .filter(|id| self.inst(*id).is_terminator())
    }

    /// Move `insts[pos..]` of `block` into a fresh block and return it.
    ///
    /// `block` is left without a terminator. Phi nodes in the successors of the
    /// moved terminator are rewired to the new block.
    pub fn split_block_before(&mut self, block: BlockId, pos: usize) -> BlockId {
        let tail: Vec<InstId> = self.blocks[block.0 as usize].insts.split_off(pos);
        let new_block = self.add_block();
        let successors = tail
            .last()
            .map(|t| self.inst(*t))
            .filter(|i| i.is_terminator())
            .map(|i| i.successors())
            .unwrap_or_default();
        self.blocks[new_block.0 as usize].insts = tail;
        self.retarget_phis(&successors, block, new_block);
        new_block
    }

    /// Rewrite phi edges `from -> succ` into `to -> succ` for each successor.
    pub fn retarget_phis(&mut self, successors: &[BlockId], from: BlockId, to: BlockId) {
        let unique: BTreeSet<BlockId> = successors.iter().copied().collect();
        for succ in unique {
            let ids = self.blocks[succ.0 as usize].insts.clone();
            for id in ids {
                match &mut self.insts[id.0 as usize].kind {
                    InstKind::Phi { incoming } => {
                        for (pred, _) in incoming.iter_mut() {
                            if *pred == from {
                                *pred = to;
                            }
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    /// Replace every use of `old` by `new` in placed instructions.
    pub fn replace_all_uses(&mut self, old: &Value, new: &Value) {
        let placed: Vec<InstId> =
            self.blocks.iter().flat_map(|b| b.insts.iter().copied()).collect();
        for id in placed {
            self.insts[id.0 as usize].for_each_operand_mut(|v| {
                if v == old {
                    *v = new.clone();
                }
            });
        }
    }

    /// Whether any placed instruction still reads `value`.
    pub fn has_uses(&self, value: &Value) -> bool {
        self.placed().any(|(_, inst)| inst.operands().iter().any(|v| v == value))
    }

    /// Placed instructions in block order.
    pub fn placed(&self) -> impl Iterator<Item = (InstId, &Inst)> + '_ {
        self.blocks.iter().flat_map(move |b| b.insts.iter().map(move |id| (*id, self.inst(*id))))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub sig: Signature,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub body: Option<Body>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }
}

/// A global variable made of typed cells. Cells may hold function references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub cells: Vec<Value>,
    #[serde(default)]
    pub constant: bool,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Function {0} has no body")]
    NoBody(String),
    #[error("Instruction {inst} does not exist in {function}")]
    UnknownInstruction { function: String, inst: u32 },
    #[error("{context} refers to {kind} {index}, which does not exist")]
    DanglingHandle { context: String, kind: &'static str, index: u32 },
    #[error("Function {0} has a body without an entry block")]
    MissingEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub arch: Arch,
    #[serde(default = "default_pointer_bits")]
    pub pointer_bits: u32,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub globals: Vec<Global>,
    /// Functions run before `main`, in order.
    #[serde(default)]
    pub ctors: Vec<FuncId>,
}

fn default_pointer_bits() -> u32 {
    64
}

impl Program {
    pub fn new(name: impl Into<String>, arch: Arch) -> Self {
        Self {
            name: name.into(),
            arch,
            pointer_bits: 64,
            functions: Vec::new(),
            globals: Vec::new(),
            ctors: Vec::new(),
        }
    }

    pub fn intptr(&self) -> Type {
        Type::Int(self.pointer_bits)
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions.iter().position(|f| f.name == name).map(|i| FuncId(i as u32))
    }

    pub fn lookup(&self, name: &str) -> Result<FuncId, ModelError> {
        self.function_by_name(name).ok_or_else(|| ModelError::UnknownFunction(name.to_string()))
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        self.functions.push(function);
        FuncId(self.functions.len() as u32 - 1)
    }

    /// Declare a function without a body.
    pub fn declare(&mut self, name: impl Into<String>, sig: Signature, linkage: Linkage) -> FuncId {
        self.add_function(Function { name: name.into(), sig, linkage, body: None })
    }

    /// Return the function named `name`, declaring it with `sig` when missing.
    pub fn get_or_insert_function(&mut self, name: &str, sig: Signature) -> FuncId {
        match self.function_by_name(name) {
            Some(id) => id,
            None => self.declare(name, sig, Linkage::External),
        }
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        self.globals.push(global);
        GlobalId(self.globals.len() as u32 - 1)
    }

    pub fn add_ctor(&mut self, func: FuncId) {
        if !self.ctors.contains(&func) {
            self.ctors.push(func);
        }
    }

    pub fn body(&self, id: FuncId) -> Result<&Body, ModelError> {
        let f = self.function(id);
        f.body.as_ref().ok_or_else(|| ModelError::NoBody(f.name.clone()))
    }

    pub fn body_mut(&mut self, id: FuncId) -> Result<&mut Body, ModelError> {
        let f = self.function_mut(id);
        let name = f.name.clone();
        f.body.as_mut().ok_or(ModelError::NoBody(name))
    }

    pub fn inst(&self, at: InstRef) -> Result<&Inst, ModelError> {
        let body = self.body(at.func)?;
        body.insts.get(at.inst.0 as usize).ok_or_else(|| ModelError::UnknownInstruction {
            function: self.function(at.func).name.clone(),
            inst: at.inst.0,
        })
    }

    /// Type of `value` as seen from inside function `func`.
    pub fn value_type(&self, func: FuncId, value: &Value) -> Type {
        match value {
            Value::Arg(idx) => {
                self.function(func).sig.params.get(*idx as usize).cloned().unwrap_or(Type::Void)
            }
            Value::Inst(id) => self
                .function(func)
                .body
                .as_ref()
                .and_then(|b| b.insts.get(id.0 as usize))
                .map(|i| i.ty.clone())
                .unwrap_or(Type::Void),
            Value::Const(Const::Int { bits, .. }) => Type::Int(*bits),
            Value::Const(Const::Float { bits, .. }) => Type::Float(*bits),
            Value::Const(Const::Null) | Value::Const(Const::Addr(_)) => Type::Ptr,
            Value::Func(_) | Value::Global(_) => Type::Ptr,
            Value::Undef(ty) => ty.clone(),
        }
    }

    /// Every placed instruction of every defined function.
    pub fn instructions(&self) -> impl Iterator<Item = (InstRef, &Inst)> + '_ {
        self.function_ids().flat_map(move |func| {
            self.function(func)
                .body
                .iter()
                .flat_map(move |body| body.placed().map(move |(inst, i)| (InstRef { func, inst }, i)))
        })
    }

    /// Functions whose reference appears as a value in code or global data.
    pub fn address_taken(&self) -> BTreeSet<FuncId> {
        let mut out = BTreeSet::new();
        for (_, inst) in self.instructions() {
            for v in inst.operands() {
                if let Value::Func(f) = v {
                    out.insert(f);
                }
            }
        }
        for g in &self.globals {
            for cell in &g.cells {
                if let Value::Func(f) = cell {
                    out.insert(*f);
                }
            }
        }
        out
    }

    /// Check that every handle stored in the program points at something.
    ///
    /// Accessors index directly, so deserialized input must pass this before
    /// any stage looks at it.
    pub fn validate(&self) -> Result<(), ModelError> {
        let dangling = |context: &str, kind: &'static str, index: u32| ModelError::DanglingHandle {
            context: context.to_string(),
            kind,
            index,
        };
        let funcs = self.functions.len();
        let globals = self.globals.len();
        let check_value = |context: &str, value: &Value, insts: usize| match value {
            Value::Func(f) if f.0 as usize >= funcs => Err(dangling(context, "function", f.0)),
            Value::Global(g) if g.0 as usize >= globals => Err(dangling(context, "global", g.0)),
            Value::Inst(i) if i.0 as usize >= insts => Err(dangling(context, "instruction", i.0)),
            _ => Ok(()),
        };

        for ctor in &self.ctors {
            if ctor.0 as usize >= funcs {
                return Err(dangling("constructor list", "function", ctor.0));
            }
        }
        for global in &self.globals {
            for cell in &global.cells {
                check_value(&global.name, cell, 0)?;
            }
        }

        for f in &self.functions {
            let Some(body) = &f.body else { continue };
            if body.blocks.is_empty() {
                return Err(ModelError::MissingEntry(f.name.clone()));
            }
            let insts = body.insts.len();
            let blocks = body.blocks.len();
            for block in &body.blocks {
                for id in &block.insts {
                    if id.0 as usize >= insts {
                        return Err(dangling(&f.name, "instruction", id.0));
                    }
                }
            }
            for inst in &body.insts {
                for operand in inst.operands() {
                    check_value(&f.name, &operand, insts)?;
                }
                let mut blocks_used = inst.successors();
                match &inst.kind {
                    InstKind::Call { callee: Callee::Direct(target), .. } if target.0 as usize >= funcs => {
                        return Err(dangling(&f.name, "function", target.0));
                    }
                    InstKind::Load { global, .. } | InstKind::Store { global, .. }
                        if global.0 as usize >= globals =>
                    {
                        return Err(dangling(&f.name, "global", global.0));
                    }
                    InstKind::Phi { incoming } => blocks_used.extend(incoming.iter().map(|(b, _)| *b)),
                    _ => {}
                }
                if let Some(block) = blocks_used.iter().find(|b| b.0 as usize >= blocks) {
                    return Err(dangling(&f.name, "block", block.0));
                }
            }
        }
        Ok(())
    }

    /// Turn `call (funcref)` into a direct call so only real indirect calls remain.
    pub fn canonicalize_direct_calls(&mut self) {
        for f in &mut self.functions {
            if let Some(body) = f.body.as_mut() {
                for inst in &mut body.insts {
                    if let InstKind::Call { callee, .. } = &mut inst.kind {
                        let target = match callee {
                            Callee::Indirect(Value::Func(target)) => *target,
                            _ => continue,
                        };
                        *callee = Callee::Direct(target);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sizes_sum_fields() {
        let ty = Type::Struct(vec![Type::Int(32), Type::Ptr, Type::Array(Box::new(Type::Int(8)), 4)]);
        assert_eq!(ty.size_bits(64), 32 + 64 + 32);
        assert_eq!(Type::Void.size_bits(64), 0);
    }

    #[test]
    fn split_block_rewires_successor_phis() {
        let mut body = Body::new();
        let exit = body.add_block();
        let entry = BlockId(0);
        body.insert(entry, None, Inst::new(InstKind::SpeculationBarrier, Type::Void));
        body.insert(entry, None, Inst::new(InstKind::Br { target: exit }, Type::Void));
        let phi = body.insert(
            exit,
            None,
            Inst::new(InstKind::Phi { incoming: vec![(entry, Value::int(32, 1))] }, Type::Int(32)),
        );

        let tail = body.split_block_before(entry, 1);

        assert_eq!(body.block(entry).insts.len(), 1);
        assert!(body.terminator(entry).is_none());
        match &body.inst(phi).kind {
            InstKind::Phi { incoming } => assert_eq!(incoming[0].0, tail),
            other => panic!("expected phi, got {other:?}"),
        }
    }

    #[test]
    fn canonicalize_turns_funcref_callee_into_direct_call() {
        let mut p = Program::new("t", Arch::Aarch64);
        let callee = p.declare("f", Signature::new(vec![], Type::Void), Linkage::External);
        let mut body = Body::new();
        let call = body.insert(
            BlockId(0),
            None,
            Inst::new(
                InstKind::Call { callee: Callee::Indirect(Value::Func(callee)), args: vec![], tail: false },
                Type::Void,
            ),
        );
        let main = p.add_function(Function {
            name: "main".into(),
            sig: Signature::new(vec![], Type::Void),
            linkage: Linkage::External,
            body: Some(body),
        });

        p.canonicalize_direct_calls();

        let inst = p.inst(InstRef { func: main, inst: call }).expect("inst");
        assert!(!inst.is_indirect_call());
        assert!(p.address_taken().is_empty());
    }

    #[test]
    fn validate_rejects_dangling_handles() {
        let mut p = Program::new("t", Arch::X86_64);
        p.add_global(Global { name: "table".into(), cells: vec![Value::Func(FuncId(7))], constant: true });
        assert!(matches!(
            p.validate(),
            Err(ModelError::DanglingHandle { kind: "function", index: 7, .. })
        ));

        let mut p = Program::new("t", Arch::X86_64);
        let mut body = Body::new();
        body.insert(BlockId(0), None, Inst::new(InstKind::Br { target: BlockId(3) }, Type::Void));
        p.add_function(Function {
            name: "main".into(),
            sig: Signature::new(vec![], Type::Void),
            linkage: Linkage::External,
            body: Some(body),
        });
        let err = p.validate().unwrap_err();
        assert_eq!(err.to_string(), "main refers to block 3, which does not exist");

        let mut p = Program::new("t", Arch::X86_64);
        let mut body = Body::new();
        body.blocks[0].insts.push(InstId(4));
        p.add_function(Function {
            name: "main".into(),
            sig: Signature::new(vec![], Type::Void),
            linkage: Linkage::External,
            body: Some(body),
        });
        assert!(matches!(p.validate(), Err(ModelError::DanglingHandle { kind: "instruction", index: 4, .. })));
    }
}
