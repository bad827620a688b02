//! Rewriting of indirect call sites.

use tracing::debug;

use crate::analysis::registry::ResolveSite;
use crate::codegen::coerce::{cast_to, cast_to_or_undef};
use crate::codegen::handler::DEFAULT_HANDLER;
use crate::codegen::{CodegenError, Generator};
use crate::model::{
    Arch, BlockId, Body, Builder, Callee, FuncId, InstId, InstKind, InstRef, Linkage, Signature, Type, Value,
};

/// Minimum candidate count for a site to use a shared dispatcher.
const SHARED_MIN_TARGETS: usize = 4;

/// The pieces of the original indirect call a rewrite needs.
struct IndirectCall {
    at: InstRef,
    callee: Value,
    args: Vec<Value>,
    tail: bool,
    ret: Type,
}

impl IndirectCall {
    fn result(&self) -> Value {
        Value::Inst(self.at.inst)
    }
}

fn mark_tail(body: &mut Body, value: &Value) {
    if let Value::Inst(id) = value {
        if let InstKind::Call { tail, .. } = &mut body.inst_mut(*id).kind {
            *tail = true;
        }
    }
}

/// Coerce call arguments to the parameters of `sig`.
///
/// An aggregate parameter that cannot take an argument directly is built
/// from consecutive arguments, one per field. Extra arguments are forwarded
/// to variadic targets; missing ones become undefined.
fn coerce_arguments(
    b: &mut Builder<'_>,
    site: &ResolveSite,
    target: &str,
    sig: &Signature,
    args: &[Value],
) -> Result<Vec<Value>, CodegenError> {
    let mismatch = |index: usize, from: Type, to: &Type| CodegenError::ArgumentCoercion {
        site: site.name.clone(),
        index,
        from,
        to: to.clone(),
        target: target.to_string(),
    };

    let mut out = Vec::with_capacity(sig.params.len());
    let mut ci = 0;
    let mut fi = 0;
    while ci < args.len() {
        if let Some(param) = sig.params.get(fi) {
            let arg = args[ci].clone();
            let from = b.type_of(&arg);
            match cast_to(b, arg, param) {
                Some(v) => out.push(v),
                None if param.is_aggregate() => {
                    let fields = param.fields();
                    let mut aggregate = Value::Undef(param.clone());
                    for (j, field) in fields.iter().enumerate() {
                        let part = args.get(ci + j).cloned().ok_or_else(|| mismatch(ci + j, Type::Void, field))?;
                        let part_ty = b.type_of(&part);
                        let part = cast_to(b, part, field).ok_or_else(|| mismatch(ci + j, part_ty, field))?;
                        aggregate = b.insert_value(aggregate, part, j as u32);
                    }
                    ci += fields.len().saturating_sub(1);
                    out.push(aggregate);
                }
                None => return Err(mismatch(ci, from, param)),
            }
        } else if sig.variadic {
            out.push(args[ci].clone());
        }
        ci += 1;
        fi += 1;
    }
    while out.len() < sig.params.len() {
        out.push(Value::Undef(sig.params[out.len()].clone()));
    }
    Ok(out)
}

impl<'a> Generator<'a> {
    pub(crate) fn generate_call(&mut self, site: &ResolveSite) -> Result<(), CodegenError> {
        let Some(at) = site.call else { return Ok(()) };
        let inst = self.program.inst(at)?.clone();
        let InstKind::Call { callee, args, tail } = inst.kind else {
            return Err(CodegenError::NotACall { site: site.name.clone() });
        };
        let Callee::Indirect(callee) = callee else {
            debug!(site = %site.name, "call is already direct");
            return Ok(());
        };
        let call = IndirectCall { at, callee, args, tail, ret: inst.ty };
        let caller = self.program.function(at.func).name.clone();

        if self.config.resolve_all && !self.config.is_init_function(&caller) {
            if self.program.arch == Arch::Aarch64 {
                return self.call_runtime_resolver(site, &call);
            }
            self.warn(format!("resolve-everything mode is aarch64 only; generating dispatch for {}", site.name));
        }

        if let Some(hash) = &site.hash {
            if self.registry.hash_count(hash) >= self.config.dispatcher_limit
                && site.targets.len() > SHARED_MIN_TARGETS
            {
                return self.call_shared_dispatcher(site, hash, &call);
            }
        }

        if site.targets.len() == 1 && !site.external {
            return self.call_single_target(site, &call);
        }
        self.call_switch(site, &call)
    }

    /// Pin the identifier and hand the call to the runtime resolver.
    fn call_runtime_resolver(&mut self, site: &ResolveSite, call: &IndirectCall) -> Result<(), CodegenError> {
        let handler = self.default_handler(call);
        let (block, pos) = self.locate(site, call.at)?;
        let params = self.program.function(call.at.func).sig.params.clone();
        let pointer_bits = self.program.pointer_bits;
        let body = self.program.body_mut(call.at.func)?;

        let mut b = Builder::new(body, params, pointer_bits);
        b.position_at(block, pos);
        b.pin_scratch(call.callee.clone());
        let result = b.call_direct(handler, call.args.clone(), call.ret.clone());
        let body = b.body();
        body.replace_all_uses(&call.result(), &result);
        body.erase(call.at.inst);
        self.report.runtime += 1;
        Ok(())
    }

    fn default_handler(&mut self, call: &IndirectCall) -> FuncId {
        let params = call.args.iter().map(|a| self.program.value_type(call.at.func, a)).collect();
        self.program.get_or_insert_function(DEFAULT_HANDLER, Signature::new(params, call.ret.clone()))
    }

    /// Route the call through `__tg_dispatcher_<hash>`, creating it on first use.
    fn call_shared_dispatcher(&mut self, site: &ResolveSite, hash: &str, call: &IndirectCall) -> Result<(), CodegenError> {
        let name = format!("__tg_dispatcher_{hash}");
        let dispatcher = match self.program.function_by_name(&name) {
            Some(existing) => existing,
            None => {
                let arg_types: Vec<Type> =
                    call.args.iter().map(|a| self.program.value_type(call.at.func, a)).collect();
                let forwarded = arg_types.len() as u32;
                let mut params = arg_types;
                params.push(Type::Ptr);
                let ret = call.ret.clone();
                let mut inner = InstId(0);
                let sig = Signature::new(params, ret.clone());
                let func = self.program.define(name.clone(), sig, Linkage::Internal, |b| {
                    let args = (0..forwarded).map(Value::Arg).collect();
                    let result = b.call_indirect(Value::Arg(forwarded), args, ret.clone());
                    if let Value::Inst(id) = result {
                        inner = id;
                    }
                    b.ret(if ret.is_void() { None } else { Some(result) });
                });

                let mut inner_site = site.clone();
                inner_site.call = Some(InstRef { func, inst: inner });
                inner_site.hash = None;
                self.generate_call(&inner_site)?;
                debug!(dispatcher = %name, targets = site.targets.len(), "created shared dispatcher");
                self.report.dispatchers.push(name.clone());
                func
            }
        };

        let sig = self.program.function(dispatcher).sig.clone();
        let (block, pos) = self.locate(site, call.at)?;
        let params = self.program.function(call.at.func).sig.params.clone();
        let pointer_bits = self.program.pointer_bits;
        let body = self.program.body_mut(call.at.func)?;

        let mut b = Builder::new(body, params, pointer_bits);
        b.position_at(block, pos);
        let mut args = Vec::with_capacity(sig.params.len());
        for (index, (arg, param)) in call.args.iter().zip(sig.params.iter()).enumerate() {
            let from = b.type_of(arg);
            let v = cast_to(&mut b, arg.clone(), param).ok_or_else(|| CodegenError::ArgumentCoercion {
                site: site.name.clone(),
                index,
                from,
                to: param.clone(),
                target: name.clone(),
            })?;
            args.push(v);
        }
        let callee_ty = b.type_of(&call.callee);
        let raw = cast_to(&mut b, call.callee.clone(), &Type::Ptr)
            .ok_or_else(|| CodegenError::Identifier { site: site.name.clone(), ty: callee_ty })?;
        args.push(raw);

        let result = b.call_direct(dispatcher, args, sig.ret.clone());
        if b.body().has_uses(&call.result()) {
            let v = cast_to_or_undef(&mut b, result, &call.ret).ok_or_else(|| CodegenError::ResultCoercion {
                site: site.name.clone(),
                from: sig.ret.clone(),
                to: call.ret.clone(),
            })?;
            b.body().replace_all_uses(&call.result(), &v);
        }
        b.body().erase(call.at.inst);
        self.report.shared += 1;
        Ok(())
    }

    /// Replace the call with a direct call to the only candidate.
    fn call_single_target(&mut self, site: &ResolveSite, call: &IndirectCall) -> Result<(), CodegenError> {
        let target = site.targets[0];
        let target_fn = self.program.function(target);
        let (target_name, sig) = (target_fn.name.clone(), target_fn.sig.clone());
        let (block, pos) = self.locate(site, call.at)?;
        let params = self.program.function(call.at.func).sig.params.clone();
        let pointer_bits = self.program.pointer_bits;
        let body = self.program.body_mut(call.at.func)?;

        let mut b = Builder::new(body, params, pointer_bits);
        b.position_at(block, pos);
        let args = coerce_arguments(&mut b, site, &target_name, &sig, &call.args)?;
        let result = b.call_direct(target, args, sig.ret.clone());
        if call.tail {
            mark_tail(b.body(), &result);
        }
        if b.body().has_uses(&call.result()) {
            let v = cast_to_or_undef(&mut b, result, &call.ret).ok_or_else(|| CodegenError::ResultCoercion {
                site: site.name.clone(),
                from: sig.ret.clone(),
                to: call.ret.clone(),
            })?;
            b.body().replace_all_uses(&call.result(), &v);
        }
        b.body().erase(call.at.inst);
        self.report.direct += 1;
        Ok(())
    }

    /// Inline switch over the identifier with one direct call per candidate.
    fn call_switch(&mut self, site: &ResolveSite, call: &IndirectCall) -> Result<(), CodegenError> {
        let mut targets = Vec::new();
        for (func, id) in self.numbered_targets(site) {
            let f = self.program.function(func);
            targets.push((func, id, f.name.clone(), f.sig.clone()));
        }
        let fallback = if site.external { Some(self.default_handler(call)) } else { None };
        let barrier = self.config.protect_spectre_v1;
        let diagnostic = self.config.debug.then(|| {
            let ids: Vec<String> = targets.iter().map(|(_, id, _, _)| id.to_string()).collect();
            format!(
                "[TG-Enforce] Invalid call target detected! Call '{}' with target %ld (=%p) (valid targets: {})",
                site.name,
                ids.join(",")
            )
        });

        let (block, pos) = self.locate(site, call.at)?;
        let params = self.program.function(call.at.func).sig.params.clone();
        let pointer_bits = self.program.pointer_bits;
        let body = self.program.body_mut(call.at.func)?;
        let cont = body.split_block_before(block, pos);

        let mut b = Builder::new(body, params, pointer_bits);
        b.position_at_end(block);
        let callee_ty = b.type_of(&call.callee);
        let intptr = b.intptr();
        let fid = cast_to(&mut b, call.callee.clone(), &intptr)
            .ok_or_else(|| CodegenError::Identifier { site: site.name.clone(), ty: callee_ty })?;
        let default_block = b.add_block();

        let case_count = targets.len() + usize::from(fallback.is_some());
        let phi = if !call.ret.is_void() && case_count > 0 {
            b.position_at(cont, 0);
            Some(b.phi(call.ret.clone()))
        } else {
            None
        };

        let mut cases: Vec<(u64, BlockId)> = Vec::with_capacity(targets.len());
        let mut duplicates = Vec::new();
        for (func, id, name, sig) in &targets {
            let case_block = b.add_block();
            b.position_at_end(case_block);
            if barrier {
                b.barrier();
            }
            let args = coerce_arguments(&mut b, site, name, sig, &call.args)?;
            let result = b.call_direct(*func, args, sig.ret.clone());
            if call.tail {
                mark_tail(b.body(), &result);
            }
            if let Some(phi) = phi {
                let incoming = match cast_to_or_undef(&mut b, result.clone(), &call.ret) {
                    Some(v) => Some(v),
                    None if sig.ret.is_aggregate() => {
                        let first = b.extract_value(result, 0);
                        cast_to_or_undef(&mut b, first, &call.ret)
                    }
                    None => None,
                };
                let incoming = incoming.ok_or_else(|| CodegenError::ResultCoercion {
                    site: site.name.clone(),
                    from: sig.ret.clone(),
                    to: call.ret.clone(),
                })?;
                b.add_incoming(phi, case_block, incoming);
            }
            b.br(cont);
            if cases.iter().any(|(existing, _)| existing == id) {
                duplicates.push(name.clone());
            } else {
                cases.push((*id, case_block));
            }
        }

        b.position_at_end(default_block);
        match fallback {
            Some(handler) => {
                b.pin_scratch(call.callee.clone());
                let result = b.call_direct(handler, call.args.clone(), call.ret.clone());
                if let Some(phi) = phi {
                    b.add_incoming(phi, default_block, result);
                }
                b.br(cont);
            }
            None => {
                if let Some(message) = diagnostic {
                    b.diagnostic(message, fid.clone());
                }
                b.trap();
            }
        }

        b.position_at_end(block);
        b.switch(fid, default_block, cases);

        let mut dead_result = false;
        let body = b.body();
        match phi {
            Some(phi) => body.replace_all_uses(&call.result(), &Value::Inst(phi)),
            None if body.has_uses(&call.result()) => {
                body.replace_all_uses(&call.result(), &Value::Undef(call.ret.clone()));
                dead_result = true;
            }
            None => {}
        }
        body.erase(call.at.inst);

        for name in duplicates {
            self.warn(format!("site {}: {} shares an identifier with another candidate", site.name, name));
        }
        if dead_result {
            self.warn(format!("site {} has no targets but its result is used; result is undefined", site.name));
        }
        self.report.switched += 1;
        Ok(())
    }
}
