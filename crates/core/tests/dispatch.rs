mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{id_of, table_program};
use switchboard_core::analysis::collect_facts;
use switchboard_core::codegen::{find_residuals, CodegenError};
use switchboard_core::config::CfiConfig;
use switchboard_core::model::interp::{InterpError, Interpreter, RtValue};
use switchboard_core::model::{Arch, BinOp, InstKind, Linkage, Program, Signature, Type};
use switchboard_core::services::{harden, HardenReport, PipelineError};

fn hardened(mut p: Program, config: &CfiConfig) -> (Program, HardenReport) {
    let facts = collect_facts(&p);
    let report = harden(&mut p, &facts, config).expect("harden");
    (p, report)
}

fn call_main(p: &Program, id: u64, x: u64) -> Result<RtValue, InterpError> {
    Interpreter::new(p).call("main", vec![RtValue::Ptr(id), RtValue::int(32, x)])
}

#[test]
fn identifiers_reach_their_candidate() {
    let config = CfiConfig::default();
    let (p, report) = hardened(table_program(Arch::X86_64, &[1, 10]), &config);

    assert_eq!(report.codegen.switched, 1);
    assert!(find_residuals(&p, &config).is_empty());

    let add_1 = id_of(&report, "add_1");
    let add_10 = id_of(&report, "add_10");
    assert_ne!(add_1, add_10);
    assert!(add_1 >= config.min_id && add_10 >= config.min_id);

    assert_eq!(call_main(&p, add_1, 5).expect("add_1"), RtValue::int(32, 6));
    assert_eq!(call_main(&p, add_10, 5).expect("add_10"), RtValue::int(32, 15));
}

#[test]
fn unknown_identifier_traps() {
    let (p, report) = hardened(table_program(Arch::X86_64, &[1, 10]), &CfiConfig::default());
    let bogus = id_of(&report, "add_1") + id_of(&report, "add_10") + 100;
    let err = call_main(&p, bogus, 5).unwrap_err();
    assert!(matches!(err, InterpError::Trap { ref function } if function == "main"), "{err:?}");
}

#[test]
fn debug_mode_dumps_the_valid_set_before_trapping() {
    let config = CfiConfig { debug: true, ..CfiConfig::default() };
    let (p, report) = hardened(table_program(Arch::X86_64, &[1, 10]), &config);

    let mut interp = Interpreter::new(&p);
    let result = interp.call("main", vec![RtValue::Ptr(999), RtValue::int(32, 1)]);
    assert!(matches!(result, Err(InterpError::Trap { .. })));

    let diagnostics = interp.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    let message = &diagnostics[0];
    assert!(message.starts_with("[TG-Enforce] Invalid call target detected! Call '<unnamed call> in main'"));
    assert!(message.contains(&id_of(&report, "add_1").to_string()));
    assert!(message.contains(&id_of(&report, "add_10").to_string()));
    assert!(message.ends_with("[999]"));
}

#[test]
fn single_candidate_becomes_a_direct_call() {
    let (p, report) = hardened(table_program(Arch::X86_64, &[3]), &CfiConfig::default());
    assert_eq!(report.codegen.direct, 1);
    assert_eq!(report.codegen.switched, 0);

    let main = p.lookup("main").expect("main");
    let body = p.body(main).expect("body");
    assert!(!body.placed().any(|(_, inst)| inst.is_indirect_call()));
    assert_eq!(call_main(&p, id_of(&report, "add_3"), 1).expect("call"), RtValue::int(32, 4));
}

#[test]
fn external_sites_fall_back_to_the_resolver() {
    let config = CfiConfig { external_resolver: true, ..CfiConfig::default() };
    let (p, report) = hardened(table_program(Arch::X86_64, &[1, 10]), &config);
    assert_eq!(report.codegen.switched, 1);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    let mut interp = Interpreter::new(&p).with_hook("__noic_default_handler", move |call| {
        let id = call.scratch.and_then(|s| s.as_u64()).unwrap_or(0);
        log.borrow_mut().push(id);
        Ok(RtValue::int(32, id))
    });

    let known = id_of(&report, "add_10");
    assert_eq!(interp.call("main", vec![RtValue::Ptr(known), RtValue::int(32, 1)]).expect("known"), RtValue::int(32, 11));
    assert_eq!(interp.call("main", vec![RtValue::Ptr(777), RtValue::int(32, 1)]).expect("miss"), RtValue::int(32, 777));
    assert_eq!(*seen.borrow(), vec![777]);
}

#[test]
fn resolve_everything_uses_the_resolver_on_aarch64() {
    let config = CfiConfig { resolve_all: true, ..CfiConfig::default() };
    let (p, report) = hardened(table_program(Arch::Aarch64, &[1, 10]), &config);
    assert_eq!(report.codegen.runtime, 1);
    assert_eq!(report.codegen.switched, 0);

    let mut interp = Interpreter::new(&p).with_hook("__noic_default_handler", |call| {
        let id = call.scratch.and_then(|s| s.as_u64()).unwrap_or(0);
        Ok(RtValue::int(32, id + 1000))
    });
    let id = id_of(&report, "add_1");
    assert_eq!(interp.call("main", vec![RtValue::Ptr(id), RtValue::int(32, 1)]).expect("call"), RtValue::int(32, id + 1000));
}

#[test]
fn resolve_everything_is_ignored_with_a_warning_elsewhere() {
    let config = CfiConfig { resolve_all: true, ..CfiConfig::default() };
    let (_, report) = hardened(table_program(Arch::X86_64, &[1, 10]), &config);
    assert_eq!(report.codegen.runtime, 0);
    assert_eq!(report.codegen.switched, 1);
    assert!(report.warnings().iter().any(|w| w.contains("aarch64 only")));
}

#[test]
fn speculation_barrier_heads_every_case() {
    let config = CfiConfig { protect_spectre_v1: true, ..CfiConfig::default() };
    let (p, _) = hardened(table_program(Arch::X86_64, &[1, 2, 3]), &config);
    let main = p.lookup("main").expect("main");
    let barriers = p
        .body(main)
        .expect("body")
        .placed()
        .filter(|(_, inst)| matches!(inst.kind, InstKind::SpeculationBarrier))
        .count();
    assert_eq!(barriers, 3);
}

#[test]
fn table_cells_hold_identifiers_after_hardening() {
    let (p, report) = hardened(table_program(Arch::X86_64, &[1, 10]), &CfiConfig::default());
    let interp = Interpreter::new(&p);
    let table = switchboard_core::model::GlobalId(0);
    assert_eq!(interp.global_cell(table, 0), Some(&RtValue::Ptr(id_of(&report, "add_1"))));
    assert_eq!(interp.global_cell(table, 1), Some(&RtValue::Ptr(id_of(&report, "add_10"))));
}

#[test]
fn site_without_candidates_yields_undefined_result() {
    let (p, report) = hardened(table_program(Arch::X86_64, &[]), &CfiConfig::default());
    assert_eq!(report.codegen.switched, 1);
    assert!(report
        .warnings()
        .iter()
        .any(|w| w == "site <unnamed call> in main has no targets but its result is used; result is undefined"));

    let main = p.lookup("main").expect("main");
    assert!(!p.body(main).expect("body").placed().any(|(_, inst)| inst.is_indirect_call()));
    assert!(matches!(call_main(&p, 2, 1), Err(InterpError::Trap { .. })));
}

/// `main(fp, x: f64) = fp(x)` with the site pinned to `takes_ptr(p: ptr)`.
#[test]
fn float_argument_cannot_reach_a_pointer_parameter() {
    let mut p = Program::new("mismatch", Arch::X86_64);
    p.define("takes_ptr", Signature::new(vec![Type::Ptr], Type::Int(32)), Linkage::Internal, |b| {
        b.ret(Some(b.int(32, 0)));
    });
    p.define("main", Signature::new(vec![Type::Ptr, Type::Float(64)], Type::Int(32)), Linkage::External, |b| {
        let r = b.call_indirect(b.arg(0), vec![b.arg(1)], Type::Int(32));
        b.ret(Some(r));
    });
    let mut facts = collect_facts(&p);
    facts.sites[0].target = Some("takes_ptr".to_string());

    let err = harden(&mut p, &facts, &CfiConfig::default()).unwrap_err();
    match err {
        PipelineError::Codegen(CodegenError::ArgumentCoercion { index, from, to, target, .. }) => {
            assert_eq!(index, 0);
            assert_eq!(from, Type::Float(64));
            assert_eq!(to, Type::Ptr);
            assert_eq!(target, "takes_ptr");
        }
        other => panic!("expected an argument coercion error, got {other:?}"),
    }
}

/// Two scalar arguments fill the fields of a pair parameter.
#[test]
fn aggregate_parameter_is_built_field_by_field() {
    let pair = Type::Struct(vec![Type::Int(32), Type::Int(32)]);
    let mut p = Program::new("pair", Arch::X86_64);
    p.define("sum_pair", Signature::new(vec![pair], Type::Int(32)), Linkage::Internal, |b| {
        let lo = b.extract_value(b.arg(0), 0);
        let hi = b.extract_value(b.arg(0), 1);
        let sum = b.binary(BinOp::Add, lo, hi);
        b.ret(Some(sum));
    });
    p.define(
        "main",
        Signature::new(vec![Type::Ptr, Type::Int(32), Type::Int(32)], Type::Int(32)),
        Linkage::External,
        |b| {
            let r = b.call_indirect(b.arg(0), vec![b.arg(1), b.arg(2)], Type::Int(32));
            b.ret(Some(r));
        },
    );
    let mut facts = collect_facts(&p);
    facts.sites[0].target = Some("sum_pair".to_string());

    let report = harden(&mut p, &facts, &CfiConfig::default()).expect("harden");
    assert_eq!(report.codegen.direct, 1);

    let main = p.lookup("main").expect("main");
    let inserts = p
        .body(main)
        .expect("body")
        .placed()
        .filter(|(_, inst)| matches!(inst.kind, InstKind::InsertValue { .. }))
        .count();
    assert_eq!(inserts, 2);

    let result = Interpreter::new(&p)
        .call("main", vec![RtValue::Ptr(id_of(&report, "sum_pair")), RtValue::int(32, 3), RtValue::int(32, 4)])
        .expect("call");
    assert_eq!(result, RtValue::int(32, 7));
}
