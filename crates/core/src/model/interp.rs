//! Reference interpreter for `Program`.
//!
//! Functions are placed at synthetic addresses (`function_address`) so that a
//! raw function pointer and a small integer identifier are distinguishable at
//! run time. Declarations are served by named host hooks, which also see the
//! resolver scratch register. Calling through an address that is not a
//! function is reported as `InterpError::WildCall`.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::{
    BinOp, BlockId, CastOp, CmpOp, Const, FuncId, GlobalId, InstId, InstKind, ModelError,
    Program, Type, Value,
};
use crate::model::Callee;

/// Base address of the first function.
pub const FUNC_BASE: u64 = 0x10_0000;
/// Distance between two function addresses.
pub const FUNC_STRIDE: u64 = 0x10;
pub const GLOBAL_BASE: u64 = 0x80_0000;
pub const GLOBAL_STRIDE: u64 = 0x1000;

const DEFAULT_FUEL: u64 = 1_000_000;

pub fn function_address(func: FuncId) -> u64 {
    FUNC_BASE + func.0 as u64 * FUNC_STRIDE
}

/// Function placed at `addr`, if any.
pub fn function_at(program: &Program, addr: u64) -> Option<FuncId> {
    if addr < FUNC_BASE || (addr - FUNC_BASE) % FUNC_STRIDE != 0 {
        return None;
    }
    let idx = (addr - FUNC_BASE) / FUNC_STRIDE;
    (idx < program.functions.len() as u64).then_some(FuncId(idx as u32))
}

#[derive(Debug, Clone, PartialEq)]
pub enum RtValue {
    Void,
    Int { bits: u32, value: u64 },
    Float { bits: u32, value: f64 },
    Ptr(u64),
    Aggregate(Vec<RtValue>),
    Undef,
}

impl RtValue {
    pub fn int(bits: u32, value: u64) -> Self {
        RtValue::Int { bits, value: mask(value, bits) }
    }

    /// Integer view of ints and pointers.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RtValue::Int { value, .. } => Some(*value),
            RtValue::Ptr(addr) => Some(*addr),
            _ => None,
        }
    }
}

fn mask(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

fn sign_extend(value: u64, from_bits: u32) -> u64 {
    if from_bits == 0 || from_bits >= 64 {
        return value;
    }
    let shift = 64 - from_bits;
    (((value << shift) as i64) >> shift) as u64
}

#[derive(Debug, Error)]
pub enum InterpError {
    #[error("trap in {function}")]
    Trap { function: String },
    #[error("reached unreachable code in {function}")]
    Unreachable { function: String },
    #[error("call through non-function address 0x{addr:x} in {function}")]
    WildCall { addr: u64, function: String },
    #[error("no host hook for external function {0}")]
    MissingHook(String),
    #[error("step budget exhausted")]
    OutOfFuel,
    #[error("malformed program: {0}")]
    Malformed(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// What a host hook sees when a declaration is called.
pub struct HostCall<'a> {
    pub name: &'a str,
    pub args: &'a [RtValue],
    pub scratch: Option<&'a RtValue>,
}

pub type HostFn = Box<dyn FnMut(&HostCall<'_>) -> Result<RtValue, InterpError>>;

pub struct Interpreter<'p> {
    program: &'p Program,
    hooks: HashMap<String, HostFn>,
    memory: Vec<Vec<RtValue>>,
    scratch: Option<RtValue>,
    trace: Vec<String>,
    diagnostics: Vec<String>,
    fuel: u64,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program) -> Self {
        let memory = program
            .globals
            .iter()
            .map(|g| g.cells.iter().map(|c| eval_static(c)).collect())
            .collect();
        Self {
            program,
            hooks: HashMap::new(),
            memory,
            scratch: None,
            trace: Vec::new(),
            diagnostics: Vec::new(),
            fuel: DEFAULT_FUEL,
        }
    }

    pub fn with_hook(
        mut self,
        name: impl Into<String>,
        hook: impl FnMut(&HostCall<'_>) -> Result<RtValue, InterpError> + 'static,
    ) -> Self {
        self.hooks.insert(name.into(), Box::new(hook));
        self
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    /// Names of functions entered so far, in call order.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn scratch(&self) -> Option<&RtValue> {
        self.scratch.as_ref()
    }

    pub fn global_cell(&self, global: GlobalId, index: u32) -> Option<&RtValue> {
        self.memory.get(global.0 as usize).and_then(|cells| cells.get(index as usize))
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    pub fn run_ctors(&mut self) -> Result<(), InterpError> {
        for ctor in self.program.ctors.clone() {
            self.call_id(ctor, Vec::new())?;
        }
        Ok(())
    }

    pub fn call(&mut self, name: &str, args: Vec<RtValue>) -> Result<RtValue, InterpError> {
        let func = self.program.lookup(name)?;
        self.call_id(func, args)
    }

    pub fn call_id(&mut self, func: FuncId, args: Vec<RtValue>) -> Result<RtValue, InterpError> {
        let program = self.program;
        let f = program.function(func);
        self.trace.push(f.name.clone());
        let Some(body) = f.body.as_ref() else {
            return self.host(&f.name, &args);
        };

        let mut values: HashMap<InstId, RtValue> = HashMap::new();
        let mut block = BlockId(0);
        let mut prev: Option<BlockId> = None;

        'blocks: loop {
            let insts = &body
                .blocks
                .get(block.0 as usize)
                .ok_or_else(|| InterpError::Malformed(format!("missing block {}", block.0)))?
                .insts;

            // Phis read their inputs before any of them is written.
            let mut first = 0;
            let mut incoming_values = Vec::new();
            while let Some(id) = insts.get(first) {
                let InstKind::Phi { incoming } = &body.inst(*id).kind else { break };
                let pred = prev.ok_or_else(|| {
                    InterpError::Malformed(format!("phi in entry block of {}", f.name))
                })?;
                let (_, v) = incoming.iter().find(|(b, _)| *b == pred).ok_or_else(|| {
                    InterpError::Malformed(format!("phi without edge from block {} in {}", pred.0, f.name))
                })?;
                incoming_values.push((*id, eval(v, &args, &values)?));
                first += 1;
            }
            values.extend(incoming_values);

            for id in &insts[first..] {
                self.tick()?;
                let inst = body.inst(*id);
                let result = match &inst.kind {
                    InstKind::Call { callee, args: call_args, .. } => {
                        let mut actual = Vec::with_capacity(call_args.len());
                        for a in call_args {
                            actual.push(eval(a, &args, &values)?);
                        }
                        let target = match callee {
                            Callee::Direct(target) => *target,
                            Callee::Indirect(v) => {
                                let addr = eval(v, &args, &values)?.as_u64().unwrap_or(0);
                                function_at(program, addr).ok_or_else(|| InterpError::WildCall {
                                    addr,
                                    function: f.name.clone(),
                                })?
                            }
                        };
                        self.call_id(target, actual)?
                    }
                    InstKind::Cast { op, value } => cast(*op, eval(value, &args, &values)?, &inst.ty),
                    InstKind::Binary { op, lhs, rhs } => {
                        binary(*op, eval(lhs, &args, &values)?, eval(rhs, &args, &values)?)
                    }
                    InstKind::Cmp { op, lhs, rhs } => {
                        let l = eval(lhs, &args, &values)?.as_u64().unwrap_or(0);
                        let r = eval(rhs, &args, &values)?.as_u64().unwrap_or(0);
                        let hit = match op {
                            CmpOp::Eq => l == r,
                            CmpOp::Ne => l != r,
                            CmpOp::Ult => l < r,
                            CmpOp::Ugt => l > r,
                        };
                        RtValue::int(1, hit as u64)
                    }
                    InstKind::ExtractValue { aggregate, index } => {
                        match eval(aggregate, &args, &values)? {
                            RtValue::Aggregate(fields) => {
                                fields.get(*index as usize).cloned().unwrap_or(RtValue::Undef)
                            }
                            _ => RtValue::Undef,
                        }
                    }
                    InstKind::InsertValue { aggregate, value, index } => {
                        let mut fields = match eval(aggregate, &args, &values)? {
                            RtValue::Aggregate(fields) => fields,
                            _ => vec![RtValue::Undef; inst.ty.fields().len()],
                        };
                        let idx = *index as usize;
                        if idx >= fields.len() {
                            fields.resize(idx + 1, RtValue::Undef);
                        }
                        fields[idx] = eval(value, &args, &values)?;
                        RtValue::Aggregate(fields)
                    }
                    InstKind::Load { global, index } => {
                        self.global_cell(*global, *index).cloned().unwrap_or(RtValue::Undef)
                    }
                    InstKind::Store { global, index, value } => {
                        let v = eval(value, &args, &values)?;
                        let cells = self.memory.get_mut(global.0 as usize).ok_or_else(|| {
                            InterpError::Malformed(format!("unknown global {}", global.0))
                        })?;
                        let idx = *index as usize;
                        if idx >= cells.len() {
                            cells.resize(idx + 1, RtValue::Undef);
                        }
                        cells[idx] = v;
                        RtValue::Void
                    }
                    InstKind::Phi { .. } => {
                        return Err(InterpError::Malformed(format!(
                            "phi after non-phi instruction in {}",
                            f.name
                        )))
                    }
                    InstKind::SpeculationBarrier => RtValue::Void,
                    InstKind::PinScratch { value } => {
                        self.scratch = Some(eval(value, &args, &values)?);
                        RtValue::Void
                    }
                    InstKind::ReadScratch => self.scratch.clone().unwrap_or(RtValue::Undef),
                    InstKind::Diagnostic { message, value } => {
                        let v = eval(value, &args, &values)?;
                        let shown = v.as_u64().map(|n| n.to_string()).unwrap_or_else(|| format!("{v:?}"));
                        self.diagnostics.push(format!("{message} [{shown}]"));
                        RtValue::Void
                    }
                    InstKind::Br { target } => {
                        prev = Some(block);
                        block = *target;
                        continue 'blocks;
                    }
                    InstKind::CondBr { cond, then_block, else_block } => {
                        let taken = eval(cond, &args, &values)?.as_u64().unwrap_or(0) != 0;
                        prev = Some(block);
                        block = if taken { *then_block } else { *else_block };
                        continue 'blocks;
                    }
                    InstKind::Switch { value, default, cases } => {
                        let key = eval(value, &args, &values)?.as_u64().unwrap_or(u64::MAX);
                        prev = Some(block);
                        block = cases.iter().find(|(k, _)| *k == key).map(|(_, b)| *b).unwrap_or(*default);
                        continue 'blocks;
                    }
                    InstKind::Ret { value } => {
                        return match value {
                            Some(v) => eval(v, &args, &values),
                            None => Ok(RtValue::Void),
                        };
                    }
                    InstKind::Trap => return Err(InterpError::Trap { function: f.name.clone() }),
                    InstKind::Unreachable => {
                        return Err(InterpError::Unreachable { function: f.name.clone() })
                    }
                };
                values.insert(*id, result);
            }

            return Err(InterpError::Malformed(format!(
                "block {} of {} has no terminator",
                block.0, f.name
            )));
        }
    }

    fn host(&mut self, name: &str, args: &[RtValue]) -> Result<RtValue, InterpError> {
        let scratch = self.scratch.clone();
        let hook = self.hooks.get_mut(name).ok_or_else(|| InterpError::MissingHook(name.to_string()))?;
        hook(&HostCall { name, args, scratch: scratch.as_ref() })
    }

    fn tick(&mut self) -> Result<(), InterpError> {
        if self.fuel == 0 {
            return Err(InterpError::OutOfFuel);
        }
        self.fuel -= 1;
        Ok(())
    }
}

fn eval_static(value: &Value) -> RtValue {
    eval(value, &[], &HashMap::new()).unwrap_or(RtValue::Undef)
}

fn eval(value: &Value, args: &[RtValue], values: &HashMap<InstId, RtValue>) -> Result<RtValue, InterpError> {
    Ok(match value {
        Value::Arg(idx) => args.get(*idx as usize).cloned().unwrap_or(RtValue::Undef),
        Value::Inst(id) => values
            .get(id)
            .cloned()
            .ok_or_else(|| InterpError::Malformed(format!("use of %{} before definition", id.0)))?,
        Value::Const(Const::Int { bits, value }) => RtValue::int(*bits, *value),
        Value::Const(Const::Float { bits, raw }) => RtValue::Float { bits: *bits, value: float_from_raw(*bits, *raw) },
        Value::Const(Const::Null) => RtValue::Ptr(0),
        Value::Const(Const::Addr(addr)) => RtValue::Ptr(*addr),
        Value::Func(f) => RtValue::Ptr(function_address(*f)),
        Value::Global(g) => RtValue::Ptr(GLOBAL_BASE + g.0 as u64 * GLOBAL_STRIDE),
        Value::Undef(_) => RtValue::Undef,
    })
}

fn float_from_raw(bits: u32, raw: u64) -> f64 {
    if bits == 32 {
        f32::from_bits(raw as u32) as f64
    } else {
        f64::from_bits(raw)
    }
}

fn float_to_raw(bits: u32, value: f64) -> u64 {
    if bits == 32 {
        (value as f32).to_bits() as u64
    } else {
        value.to_bits()
    }
}

fn cast(op: CastOp, value: RtValue, to: &Type) -> RtValue {
    let to_bits = match to {
        Type::Int(bits) | Type::Float(bits) => *bits,
        _ => 64,
    };
    match (op, value) {
        (_, RtValue::Undef) => RtValue::Undef,
        (CastOp::IntToPtr, v) | (CastOp::Bitcast, v @ RtValue::Ptr(_)) if to.is_ptr() => {
            RtValue::Ptr(v.as_u64().unwrap_or(0))
        }
        (CastOp::PtrToInt, v) => RtValue::int(to_bits, v.as_u64().unwrap_or(0)),
        (CastOp::IntCast { signed }, RtValue::Int { bits, value }) => {
            let widened = if signed && to_bits > bits { sign_extend(value, bits) } else { value };
            RtValue::int(to_bits, widened)
        }
        (CastOp::Bitcast, RtValue::Float { bits, value }) if to.is_int() => {
            RtValue::int(to_bits, float_to_raw(bits, value))
        }
        (CastOp::Bitcast, RtValue::Int { value, .. }) if to.is_float() => {
            RtValue::Float { bits: to_bits, value: float_from_raw(to_bits, value) }
        }
        (CastOp::FpCast, RtValue::Float { value, .. }) => {
            let value = if to_bits == 32 { value as f32 as f64 } else { value };
            RtValue::Float { bits: to_bits, value }
        }
        (_, other) => other,
    }
}

fn binary(op: BinOp, lhs: RtValue, rhs: RtValue) -> RtValue {
    let r = rhs.as_u64().unwrap_or(0);
    match lhs {
        RtValue::Int { bits, value } => RtValue::int(
            bits,
            match op {
                BinOp::Add => value.wrapping_add(r),
                BinOp::Sub => value.wrapping_sub(r),
                BinOp::Mul => value.wrapping_mul(r),
            },
        ),
        RtValue::Ptr(addr) => RtValue::Ptr(match op {
            BinOp::Add => addr.wrapping_add(r),
            BinOp::Sub => addr.wrapping_sub(r),
            BinOp::Mul => addr.wrapping_mul(r),
        }),
        RtValue::Float { bits, value } => {
            let rf = match rhs {
                RtValue::Float { value, .. } => value,
                _ => 0.0,
            };
            RtValue::Float {
                bits,
                value: match op {
                    BinOp::Add => value + rf,
                    BinOp::Sub => value - rf,
                    BinOp::Mul => value * rf,
                },
            }
        }
        _ => RtValue::Undef,
    }
}
