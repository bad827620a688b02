//! Runtime-facing helper functions emitted into the program.

use tracing::info;

use crate::analysis::facts::{SiteKind, REGISTER_HANDLER};
use crate::analysis::registry::{ResolveSite, TargetRegistry};
use crate::model::{FuncId, InstKind, InstRef, Linkage, Program, Signature, Type, Value};

/// Resolver entry for identifiers no inline dispatch knows about.
pub const DEFAULT_HANDLER: &str = "__noic_default_handler";
/// Internal dispatcher over every known identifier.
pub const ALL_ID_HANDLER: &str = "__noic_all_id_handler";
/// Constructor registering [`ALL_ID_HANDLER`] with the runtime.
pub const REGISTER_CTOR: &str = "__noic_all_id_handler_register";

/// Register-sized arguments forwarded by the all-identifier handler.
const FORWARDED_ARGS: u32 = 8;

/// Add the all-identifier handler and its resolve site.
///
/// The handler reads the identifier from the scratch register and calls
/// through it, so its single call site has every live function as candidate.
pub fn add_all_id_handler(program: &mut Program, registry: &mut TargetRegistry) -> FuncId {
    let word = program.intptr();
    let params = vec![word.clone(); FORWARDED_ARGS as usize];
    let shape = Signature::new(params.clone(), word.clone());

    let mut call = None;
    let handler = program.define(ALL_ID_HANDLER, shape.clone(), Linkage::Internal, |b| {
        let target = b.read_scratch();
        let args = (0..FORWARDED_ARGS).map(Value::Arg).collect();
        let result = b.call_indirect(target, args, word.clone());
        if let Value::Inst(id) = result {
            call = Some(id);
        }
        b.ret(Some(result));
    });

    let targets: Vec<FuncId> = registry.functions().filter(|f| !f.removed).map(|f| f.func).collect();
    info!(targets = targets.len(), "added all-identifier handler");
    registry.add_site(ResolveSite {
        kind: SiteKind::Call,
        name: format!("call in {ALL_ID_HANDLER}"),
        external: false,
        targets,
        call: call.map(|inst| InstRef { func: handler, inst }),
        resolve_arg: 0,
        hash: None,
        shape,
    });
    handler
}

/// Add a constructor that registers `handler` for `first..=last`.
pub fn add_register_ctor(program: &mut Program, handler: FuncId, first: u64, last: u64) -> FuncId {
    let word = program.intptr();
    let bits = program.pointer_bits;
    let register = program.get_or_insert_function(
        REGISTER_HANDLER,
        Signature::new(vec![Type::Ptr, word.clone(), word], Type::Void),
    );
    let ctor = program.define(REGISTER_CTOR, Signature::new(vec![], Type::Void), Linkage::Internal, |b| {
        b.call_direct(register, vec![Value::Func(handler), Value::int(bits, first), Value::int(bits, last)], Type::Void);
        b.ret(None);
    });
    program.add_ctor(ctor);
    info!(first, last, "registered all-identifier handler");
    ctor
}

/// Mark every call in `func` as a tail call.
pub fn mark_tail_calls(program: &mut Program, func: FuncId) {
    let Some(body) = program.function_mut(func).body.as_mut() else { return };
    let placed: Vec<_> = body.placed().map(|(id, _)| id).collect();
    for id in placed {
        if let InstKind::Call { tail, .. } = &mut body.inst_mut(id).kind {
            *tail = true;
        }
    }
}
