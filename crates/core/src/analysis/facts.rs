//! Input facts describing indirect uses of function values.
//!
//! A fact set is normally produced by an external front-end and loaded from
//! disk. `collect_facts` derives an equivalent set straight from a `Program`
//! for inputs that come without one.

use serde::{Deserialize, Serialize};

use crate::model::{Callee, InstKind, Linkage, Program, Type, Value};

/// Prefix of routines whose pointer result must be translated from an
/// identifier back into a raw address.
pub const RESOLVE_PREFIX: &str = "__noic_resolve_";
pub const REGISTER_HANDLER: &str = "__noic_register_handler";
pub const REGISTER_HANDLER_NOVT: &str = "__novt_register_handler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    /// Indirect call.
    Call,
    /// Function value passed as an argument to code outside the program.
    ResolveArgument,
    /// Identifier returned by a `__noic_resolve_*` routine.
    ResolveReturn,
}

impl SiteKind {
    /// Label used in the statistics file.
    pub fn stats_label(self) -> &'static str {
        match self {
            SiteKind::Call => "call",
            SiteKind::ResolveArgument => "resolve",
            SiteKind::ResolveReturn => "resolvefunc",
        }
    }
}

/// One indirect use of a function value.
///
/// `args`/`ret` describe the call shape for `call` sites and the shape of the
/// resolved function type for the resolve kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFact {
    pub kind: SiteKind,
    /// Name of the function containing the instruction.
    pub function: String,
    /// Instruction index inside that function's body.
    pub inst: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Vec<Type>,
    #[serde(default = "void")]
    pub ret: Type,
    #[serde(default)]
    pub variadic: bool,
    /// Known target; `None` means "any compatible address-taken function".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Argument position for `resolve_argument` sites.
    #[serde(default)]
    pub resolve_arg: u32,
    /// Overrides the configured external-resolver default for call sites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    /// Shape unknown: every address-taken function is a candidate.
    #[serde(default)]
    pub unconstrained: bool,
}

fn void() -> Type {
    Type::Void
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFact {
    pub name: String,
    #[serde(default)]
    pub address_taken: bool,
    #[serde(default)]
    pub leaking: bool,
    /// Deleted by an earlier stage; never numbered or matched.
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSet {
    #[serde(default)]
    pub sites: Vec<SiteFact>,
    #[serde(default)]
    pub functions: Vec<FunctionFact>,
}

impl FactSet {
    pub fn function(&self, name: &str) -> Option<&FunctionFact> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Derive facts from the program itself.
///
/// - every indirect call is a `call` site with unknown target
/// - a call to `__noic_resolve_*` is a `resolve_return` site
/// - a function reference passed to a declaration is a `resolve_argument` site
///   naming that function
pub fn collect_facts(program: &Program) -> FactSet {
    let mut facts = FactSet::default();
    let address_taken = program.address_taken();

    for func in program.function_ids() {
        let f = program.function(func);
        let Some(body) = f.body.as_ref() else { continue };
        for (id, inst) in body.placed() {
            let InstKind::Call { callee, args, .. } = &inst.kind else { continue };
            let arg_types: Vec<Type> = args.iter().map(|a| program.value_type(func, a)).collect();
            match callee {
                Callee::Indirect(_) => facts.sites.push(SiteFact {
                    kind: SiteKind::Call,
                    function: f.name.clone(),
                    inst: id.0,
                    name: Some(format!("<unnamed call> in {}", f.name)),
                    args: arg_types,
                    ret: inst.ty.clone(),
                    variadic: false,
                    target: None,
                    resolve_arg: 0,
                    external: None,
                    unconstrained: false,
                }),
                Callee::Direct(target) => {
                    let callee_fn = program.function(*target);
                    if !callee_fn.is_declaration() {
                        continue;
                    }
                    if callee_fn.name.starts_with(RESOLVE_PREFIX) {
                        facts.sites.push(SiteFact {
                            kind: SiteKind::ResolveReturn,
                            function: f.name.clone(),
                            inst: id.0,
                            name: Some(format!("RP {}", callee_fn.name)),
                            args: Vec::new(),
                            ret: Type::Void,
                            variadic: false,
                            target: None,
                            resolve_arg: 0,
                            external: None,
                            unconstrained: true,
                        });
                        continue;
                    }
                    if callee_fn.name == REGISTER_HANDLER || callee_fn.name == REGISTER_HANDLER_NOVT {
                        continue;
                    }
                    for (idx, arg) in args.iter().enumerate() {
                        let Value::Func(referenced) = arg else { continue };
                        let target_fn = program.function(*referenced);
                        facts.sites.push(SiteFact {
                            kind: SiteKind::ResolveArgument,
                            function: f.name.clone(),
                            inst: id.0,
                            name: Some(format!("{}#{idx} in {}", callee_fn.name, f.name)),
                            args: target_fn.sig.params.clone(),
                            ret: target_fn.sig.ret.clone(),
                            variadic: target_fn.sig.variadic,
                            target: Some(target_fn.name.clone()),
                            resolve_arg: idx as u32,
                            external: None,
                            unconstrained: false,
                        });
                    }
                }
            }
        }
    }

    for func in program.function_ids() {
        let f = program.function(func);
        let taken = address_taken.contains(&func);
        facts.functions.push(FunctionFact {
            name: f.name.clone(),
            address_taken: taken,
            leaking: taken && f.linkage == Linkage::External,
            removed: false,
        });
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Arch, Signature};

    #[test]
    fn collects_calls_resolve_points_and_escaping_arguments() {
        let mut p = Program::new("t", Arch::Aarch64);
        let cb = p.define("cb", Signature::new(vec![Type::Ptr], Type::Void), Linkage::External, |b| b.ret(None));
        let atexit = p.declare("atexit", Signature::new(vec![Type::Ptr], Type::Int(32)), Linkage::External);
        let resolve = p.declare(
            "__noic_resolve_cb",
            Signature::new(vec![Type::Ptr], Type::Ptr),
            Linkage::External,
        );
        p.define("main", Signature::new(vec![Type::Ptr], Type::Void), Linkage::External, |b| {
            b.call_direct(atexit, vec![Value::Func(cb)], Type::Int(32));
            b.call_direct(resolve, vec![b.arg(0)], Type::Ptr);
            b.call_indirect(b.arg(0), vec![Value::Const(crate::model::Const::Null)], Type::Void);
            b.ret(None);
        });

        let facts = collect_facts(&p);
        let kinds: Vec<SiteKind> = facts.sites.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SiteKind::ResolveArgument, SiteKind::ResolveReturn, SiteKind::Call]);
        assert_eq!(facts.sites[0].target.as_deref(), Some("cb"));
        assert_eq!(facts.sites[2].args, vec![Type::Ptr]);

        let cb_fact = facts.function("cb").expect("cb fact");
        assert!(cb_fact.address_taken);
        assert!(cb_fact.leaking);
        assert!(!facts.function("main").expect("main").address_taken);
    }
}
