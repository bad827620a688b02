//! Cursor-style instruction builder used by the code generator and by tests.

use crate::model::{
    BinOp, BlockId, Body, Callee, CastOp, CmpOp, Const, FuncId, GlobalId, Inst, InstId, InstKind,
    Program, Signature, Type, Value,
};

/// Inserts instructions into one body at a movable position.
///
/// When `pos` is `None` instructions are appended to the current block,
/// otherwise they are inserted at `pos`, which then advances.
pub struct Builder<'a> {
    body: &'a mut Body,
    params: Vec<Type>,
    pointer_bits: u32,
    block: BlockId,
    pos: Option<usize>,
}

impl<'a> Builder<'a> {
    pub fn new(body: &'a mut Body, params: Vec<Type>, pointer_bits: u32) -> Self {
        Self { body, params, pointer_bits, block: BlockId(0), pos: None }
    }

    /// Builder over the body of `func`; returns `None` for declarations.
    pub fn for_function(program: &'a mut Program, func: FuncId) -> Option<Self> {
        let pointer_bits = program.pointer_bits;
        let f = program.function_mut(func);
        let params = f.sig.params.clone();
        f.body.as_mut().map(|body| Builder::new(body, params, pointer_bits))
    }

    pub fn body(&mut self) -> &mut Body {
        self.body
    }

    pub fn current_block(&self) -> BlockId {
        self.block
    }

    /// Append at the end of `block`.
    pub fn position_at_end(&mut self, block: BlockId) {
        self.block = block;
        self.pos = None;
    }

    /// Insert before the instruction currently at `pos` in `block`.
    pub fn position_at(&mut self, block: BlockId, pos: usize) {
        self.block = block;
        self.pos = Some(pos);
    }

    pub fn add_block(&mut self) -> BlockId {
        self.body.add_block()
    }

    pub fn intptr(&self) -> Type {
        Type::Int(self.pointer_bits)
    }

    pub fn type_of(&self, value: &Value) -> Type {
        match value {
            Value::Arg(idx) => self.params.get(*idx as usize).cloned().unwrap_or(Type::Void),
            Value::Inst(id) => self.body.inst(*id).ty.clone(),
            Value::Const(Const::Int { bits, .. }) => Type::Int(*bits),
            Value::Const(Const::Float { bits, .. }) => Type::Float(*bits),
            Value::Const(_) | Value::Func(_) | Value::Global(_) => Type::Ptr,
            Value::Undef(ty) => ty.clone(),
        }
    }

    pub fn emit(&mut self, kind: InstKind, ty: Type) -> InstId {
        let id = self.body.insert(self.block, self.pos, Inst::new(kind, ty));
        if let Some(p) = self.pos.as_mut() {
            *p += 1;
        }
        id
    }

    fn emit_value(&mut self, kind: InstKind, ty: Type) -> Value {
        Value::Inst(self.emit(kind, ty))
    }

    pub fn arg(&self, idx: u32) -> Value {
        Value::Arg(idx)
    }

    pub fn int(&self, bits: u32, value: u64) -> Value {
        Value::int(bits, value)
    }

    pub fn call(&mut self, callee: Callee, args: Vec<Value>, ret: Type) -> Value {
        self.emit_value(InstKind::Call { callee, args, tail: false }, ret)
    }

    pub fn call_direct(&mut self, func: FuncId, args: Vec<Value>, ret: Type) -> Value {
        self.call(Callee::Direct(func), args, ret)
    }

    pub fn call_indirect(&mut self, target: Value, args: Vec<Value>, ret: Type) -> Value {
        self.call(Callee::Indirect(target), args, ret)
    }

    /// Call using the callee's declared return type.
    pub fn call_sig(&mut self, func: FuncId, sig: &Signature, args: Vec<Value>) -> Value {
        self.call_direct(func, args, sig.ret.clone())
    }

    pub fn cast(&mut self, op: CastOp, value: Value, ty: Type) -> Value {
        self.emit_value(InstKind::Cast { op, value }, ty)
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.type_of(&lhs);
        self.emit_value(InstKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn cmp(&mut self, op: CmpOp, lhs: Value, rhs: Value) -> Value {
        self.emit_value(InstKind::Cmp { op, lhs, rhs }, Type::Int(1))
    }

    pub fn extract_value(&mut self, aggregate: Value, index: u32) -> Value {
        let ty = self.type_of(&aggregate).fields().get(index as usize).cloned().unwrap_or(Type::Void);
        self.emit_value(InstKind::ExtractValue { aggregate, index }, ty)
    }

    pub fn insert_value(&mut self, aggregate: Value, value: Value, index: u32) -> Value {
        let ty = self.type_of(&aggregate);
        self.emit_value(InstKind::InsertValue { aggregate, value, index }, ty)
    }

    pub fn load(&mut self, global: GlobalId, index: u32, ty: Type) -> Value {
        self.emit_value(InstKind::Load { global, index }, ty)
    }

    pub fn store(&mut self, global: GlobalId, index: u32, value: Value) {
        self.emit(InstKind::Store { global, index, value }, Type::Void);
    }

    pub fn phi(&mut self, ty: Type) -> InstId {
        self.emit(InstKind::Phi { incoming: Vec::new() }, ty)
    }

    pub fn add_incoming(&mut self, phi: InstId, block: BlockId, value: Value) {
        if let InstKind::Phi { incoming } = &mut self.body.inst_mut(phi).kind {
            incoming.push((block, value));
        }
    }

    pub fn barrier(&mut self) {
        self.emit(InstKind::SpeculationBarrier, Type::Void);
    }

    pub fn pin_scratch(&mut self, value: Value) {
        self.emit(InstKind::PinScratch { value }, Type::Void);
    }

    pub fn read_scratch(&mut self) -> Value {
        self.emit_value(InstKind::ReadScratch, Type::Ptr)
    }

    pub fn diagnostic(&mut self, message: impl Into<String>, value: Value) {
        self.emit(InstKind::Diagnostic { message: message.into(), value }, Type::Void);
    }

    pub fn br(&mut self, target: BlockId) {
        self.emit(InstKind::Br { target }, Type::Void);
    }

    pub fn cond_br(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.emit(InstKind::CondBr { cond, then_block, else_block }, Type::Void);
    }

    pub fn switch(&mut self, value: Value, default: BlockId, cases: Vec<(u64, BlockId)>) -> InstId {
        self.emit(InstKind::Switch { value, default, cases }, Type::Void)
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.emit(InstKind::Ret { value }, Type::Void);
    }

    pub fn trap(&mut self) {
        self.emit(InstKind::Trap, Type::Void);
    }
}

impl Program {
    /// Add a function with a body produced by `build`.
    pub fn define(
        &mut self,
        name: impl Into<String>,
        sig: Signature,
        linkage: crate::model::Linkage,
        build: impl FnOnce(&mut Builder<'_>),
    ) -> FuncId {
        let id = self.declare(name, sig, linkage);
        self.define_body(id, build);
        id
    }

    /// Give `func` a fresh body (replacing any existing one).
    pub fn define_body(&mut self, func: FuncId, build: impl FnOnce(&mut Builder<'_>)) {
        let pointer_bits = self.pointer_bits;
        let f = self.function_mut(func);
        let params = f.sig.params.clone();
        let body = f.body.insert(Body::new());
        let mut builder = Builder::new(body, params, pointer_bits);
        build(&mut builder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Arch, Linkage};

    #[test]
    fn positioned_builder_inserts_in_order() {
        let mut p = Program::new("t", Arch::X86_64);
        let f = p.define("f", Signature::new(vec![Type::Int(32)], Type::Int(32)), Linkage::Internal, |b| {
            b.ret(Some(b.arg(0)));
        });
        let mut b = Builder::for_function(&mut p, f).expect("body");
        b.position_at(BlockId(0), 0);
        b.barrier();
        b.barrier();
        let body = p.body(f).expect("body");
        let kinds: Vec<_> = body.placed().map(|(_, i)| i.kind.clone()).collect();
        assert!(matches!(kinds[0], InstKind::SpeculationBarrier));
        assert!(matches!(kinds[1], InstKind::SpeculationBarrier));
        assert!(matches!(kinds[2], InstKind::Ret { .. }));
    }
}
