//! Translation of identifiers back into addresses.
//!
//! Values below the identifier floor are sentinels such as `SIG_IGN` and pass
//! through unchanged. Known identifiers map to their function. Anything else
//! is assumed to be an address from elsewhere and is returned as is.

use tracing::debug;

use crate::analysis::facts::SiteKind;
use crate::analysis::registry::ResolveSite;
use crate::codegen::coerce::cast_to;
use crate::codegen::{CodegenError, Generator};
use crate::model::{Builder, CastOp, CmpOp, InstKind, InstRef, Type, Value};

impl<'a> Generator<'a> {
    pub(crate) fn generate_resolve(&mut self, site: &ResolveSite) -> Result<(), CodegenError> {
        let Some(at) = site.call else { return Ok(()) };
        let InstKind::Call { args, .. } = &self.program.inst(at)?.kind else {
            return Err(CodegenError::NotACall { site: site.name.clone() });
        };
        let index = match site.kind {
            SiteKind::ResolveArgument => site.resolve_arg,
            _ => 0,
        };
        let old = args
            .get(index as usize)
            .cloned()
            .ok_or_else(|| CodegenError::ResolveArgument { site: site.name.clone(), index })?;

        let translated = self.back_translate(site, at, old)?;
        let ret = self.program.inst(at)?.ty.clone();
        let body = self.program.body_mut(at.func)?;

        match site.kind {
            SiteKind::ResolveArgument => {
                if let InstKind::Call { args, .. } = &mut body.inst_mut(at.inst).kind {
                    args[index as usize] = translated;
                }
            }
            _ => {
                if !ret.is_void() {
                    let (block, pos) = body
                        .locate(at.inst)
                        .ok_or_else(|| CodegenError::MissingInstruction { site: site.name.clone() })?;
                    let params = self.program.function(at.func).sig.params.clone();
                    let pointer_bits = self.program.pointer_bits;
                    let body = self.program.body_mut(at.func)?;
                    let mut b = Builder::new(body, params, pointer_bits);
                    b.position_at(block, pos);
                    let value = cast_to(&mut b, translated, &ret).ok_or_else(|| CodegenError::ResultCoercion {
                        site: site.name.clone(),
                        from: Type::Ptr,
                        to: ret.clone(),
                    })?;
                    b.body().replace_all_uses(&Value::Inst(at.inst), &value);
                }
                self.program.body_mut(at.func)?.erase(at.inst);
            }
        }
        self.report.translated += 1;
        Ok(())
    }

    /// Emit the identifier-to-address mapping before the call at `at` and
    /// return the resulting pointer.
    pub(crate) fn back_translate(&mut self, site: &ResolveSite, at: InstRef, old: Value) -> Result<Value, CodegenError> {
        let targets = self.numbered_targets(site);
        let min_id = self.config.min_id;
        let (block, pos) = self.locate(site, at)?;
        let params = self.program.function(at.func).sig.params.clone();
        let pointer_bits = self.program.pointer_bits;
        let body = self.program.body_mut(at.func)?;
        let cont = body.split_block_before(block, pos);

        let mut b = Builder::new(body, params, pointer_bits);
        b.position_at(cont, 0);
        let phi = b.phi(Type::Ptr);

        b.position_at_end(block);
        let old_ty = b.type_of(&old);
        let intptr = b.intptr();
        let fid = cast_to(&mut b, old.clone(), &intptr)
            .ok_or_else(|| CodegenError::Identifier { site: site.name.clone(), ty: old_ty })?;
        let below_floor = b.cmp(CmpOp::Ult, fid.clone(), Value::int(pointer_bits, min_id));
        let passthrough = b.add_block();
        let lookup = b.add_block();
        b.cond_br(below_floor, passthrough, lookup);

        b.position_at_end(passthrough);
        let raw = cast_to(&mut b, old, &Type::Ptr).unwrap_or(Value::Undef(Type::Ptr));
        b.add_incoming(phi, passthrough, raw);
        b.br(cont);

        let mut cases = Vec::with_capacity(targets.len());
        for (func, id) in &targets {
            let case_block = b.add_block();
            b.position_at_end(case_block);
            b.add_incoming(phi, case_block, Value::Func(*func));
            b.br(cont);
            cases.push((*id, case_block));
        }

        let default_block = b.add_block();
        b.position_at_end(default_block);
        let unknown = b.cast(CastOp::IntToPtr, fid.clone(), Type::Ptr);
        b.add_incoming(phi, default_block, unknown);
        b.br(cont);

        b.position_at_end(lookup);
        b.switch(fid, default_block, cases);

        debug!(site = %site.name, targets = targets.len(), "emitted back translation");
        Ok(Value::Inst(phi))
    }
}
