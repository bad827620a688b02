use std::collections::BTreeSet;

use switchboard_core::analysis::{assign_ids, collect_facts, FactSet, RegistryError, SiteKind, TargetRegistry};
use switchboard_core::config::CfiConfig;
use switchboard_core::model::{Arch, BinOp, FuncId, Global, Linkage, Program, Signature, Type, Value};

fn i32t() -> Type {
    Type::Int(32)
}

/// One-parameter `a*`, two-parameter `b*`, a variadic-shaped caller that
/// reaches both and a fixed caller that reaches only the `b*`.
fn mixed_arity_program() -> (Program, FactSet) {
    let mut p = Program::new("arity", Arch::X86_64);
    let mut cells = Vec::new();
    for name in ["a1", "a2", "a3"] {
        let f = p.define(name, Signature::new(vec![i32t()], i32t()), Linkage::Internal, |b| {
            b.ret(Some(b.arg(0)));
        });
        cells.push(Value::Func(f));
    }
    for name in ["b1", "b2", "b3", "b4", "b5"] {
        let f = p.define(name, Signature::new(vec![i32t(), i32t()], i32t()), Linkage::Internal, |b| {
            let sum = b.binary(BinOp::Add, b.arg(0), b.arg(1));
            b.ret(Some(sum));
        });
        cells.push(Value::Func(f));
    }
    let cb = p.define("cb", Signature::new(vec![Type::Ptr], Type::Void), Linkage::Internal, |b| b.ret(None));
    cells.push(Value::Func(cb));
    p.add_global(Global { name: "table".to_string(), cells, constant: true });

    for caller in ["any_arity", "two_args"] {
        p.define(
            caller,
            Signature::new(vec![Type::Ptr, i32t(), i32t()], i32t()),
            Linkage::External,
            |b| {
                let r = b.call_indirect(b.arg(0), vec![b.arg(1), b.arg(2)], i32t());
                b.ret(Some(r));
            },
        );
    }

    let mut facts = collect_facts(&p);
    for site in &mut facts.sites {
        if site.function == "any_arity" {
            site.variadic = true;
        }
    }
    (p, facts)
}

fn names(p: &Program, funcs: &[FuncId]) -> Vec<String> {
    funcs.iter().map(|f| p.function(*f).name.clone()).collect()
}

#[test]
fn candidate_sets_cover_every_legal_target() {
    let (p, facts) = mixed_arity_program();
    let registry = TargetRegistry::populate(&p, &facts, &CfiConfig::default()).expect("populate");

    let by_caller = |caller: &str| {
        let site = registry
            .sites()
            .iter()
            .find(|s| s.name == format!("<unnamed call> in {caller}"))
            .expect("site");
        names(&p, &site.targets)
    };
    assert_eq!(by_caller("any_arity"), vec!["a1", "a2", "a3", "b1", "b2", "b3", "b4", "b5"]);
    assert_eq!(by_caller("two_args"), vec!["b1", "b2", "b3", "b4", "b5"]);
}

#[test]
fn identifiers_are_unique_per_site() {
    let (p, facts) = mixed_arity_program();
    let config = CfiConfig::default();
    let mut registry = TargetRegistry::populate(&p, &facts, &config).expect("populate");
    assign_ids(&mut registry, &config, p.pointer_bits);

    for site in registry.sites() {
        let ids: Vec<u64> = site.targets.iter().map(|f| registry.id_of(*f).expect("numbered")).collect();
        let distinct: BTreeSet<u64> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), ids.len(), "site {}", site.name);
        assert!(ids.iter().all(|id| *id >= config.min_id));
    }
}

#[test]
fn largest_inner_site_is_numbered_contiguously_first() {
    let (p, facts) = mixed_arity_program();
    let config = CfiConfig::default();
    let mut registry = TargetRegistry::populate(&p, &facts, &config).expect("populate");
    let density = assign_ids(&mut registry, &config, p.pointer_bits);

    let id = |name: &str| registry.id_of(p.function_by_name(name).expect("function")).expect("id");
    let b_ids: Vec<u64> = ["b1", "b2", "b3", "b4", "b5"].iter().map(|n| id(n)).collect();
    let a_ids: Vec<u64> = ["a1", "a2", "a3"].iter().map(|n| id(n)).collect();
    assert_eq!(b_ids, vec![2, 3, 4, 5, 6]);
    assert_eq!(a_ids, vec![7, 8, 9]);

    // `cb` shares no site and takes the next shared id; nothing else is
    // in the shared space yet.
    assert_eq!(id("cb"), 2);

    assert_eq!(density.sites, 2);
    assert_eq!(density.worst, 1.0);
    assert_eq!(density.max_id, 9);
}

#[test]
fn sites_with_identical_shape_and_targets_share_a_hash() {
    let (p, facts) = mixed_arity_program();
    let config = CfiConfig::default();
    let mut registry = TargetRegistry::populate(&p, &facts, &config).expect("populate");
    assign_ids(&mut registry, &config, p.pointer_bits);

    let hashes: Vec<&str> = registry.sites().iter().map(|s| s.hash.as_deref().expect("hash")).collect();
    assert_eq!(hashes.len(), 2);
    assert_ne!(hashes[0], hashes[1]);
    assert!(hashes.iter().all(|h| h.len() == 16));
    assert_eq!(registry.hash_count(hashes[0]), 1);
}

/// Five adders reached from callers `c0`..`c4`; only `c0` may fall back to
/// the runtime resolver.
fn one_external_caller() -> (Program, FactSet) {
    let mut p = Program::new("mixed", Arch::X86_64);
    let mut cells = Vec::new();
    for k in 1..=5u64 {
        let f = p.define(format!("add_{k}"), Signature::new(vec![i32t()], i32t()), Linkage::Internal, |b| {
            let sum = b.binary(BinOp::Add, b.arg(0), b.int(32, k));
            b.ret(Some(sum));
        });
        cells.push(Value::Func(f));
    }
    p.add_global(Global { name: "table".to_string(), cells, constant: true });
    for i in 0..5 {
        p.define(format!("c{i}"), Signature::new(vec![Type::Ptr, i32t()], i32t()), Linkage::External, |b| {
            let r = b.call_indirect(b.arg(0), vec![b.arg(1)], i32t());
            b.ret(Some(r));
        });
    }
    let mut facts = collect_facts(&p);
    for site in &mut facts.sites {
        site.external = Some(site.function == "c0");
    }
    (p, facts)
}

#[test]
fn resolver_fallback_separates_site_hashes() {
    let (p, facts) = one_external_caller();
    let config = CfiConfig::default();
    let mut registry = TargetRegistry::populate(&p, &facts, &config).expect("populate");
    assign_ids(&mut registry, &config, p.pointer_bits);

    let hash_of = |caller: &str| {
        registry
            .sites()
            .iter()
            .find(|s| s.name == format!("<unnamed call> in {caller}"))
            .and_then(|s| s.hash.clone())
            .expect("hash")
    };
    assert_ne!(hash_of("c0"), hash_of("c1"));
    assert_eq!(hash_of("c1"), hash_of("c4"));
    assert_eq!(registry.hash_count(&hash_of("c0")), 1);
    assert_eq!(registry.hash_count(&hash_of("c1")), 4);
}

#[test]
fn unreachable_functions_take_the_shared_counter() {
    let mut p = Program::new("lonely", Arch::X86_64);
    let exported = p.define("add_1", Signature::new(vec![i32t()], i32t()), Linkage::External, |b| {
        b.ret(Some(b.arg(0)));
    });
    let internal = p.define("add_2", Signature::new(vec![i32t()], i32t()), Linkage::Internal, |b| {
        b.ret(Some(b.arg(0)));
    });
    let lonely = p.define("lonely", Signature::new(vec![Type::Ptr], Type::Void), Linkage::Internal, |b| b.ret(None));
    p.add_global(Global {
        name: "table".to_string(),
        cells: vec![Value::Func(exported), Value::Func(internal), Value::Func(lonely)],
        constant: true,
    });
    p.define("main", Signature::new(vec![Type::Ptr, i32t()], i32t()), Linkage::External, |b| {
        let r = b.call_indirect(b.arg(0), vec![b.arg(1)], i32t());
        b.ret(Some(r));
    });

    let facts = collect_facts(&p);
    let config = CfiConfig::default();
    let mut registry = TargetRegistry::populate(&p, &facts, &config).expect("populate");
    assign_ids(&mut registry, &config, p.pointer_bits);

    // The exported adder pulls its site into the shared space.
    assert_eq!(registry.id_of(exported), Some(2));
    assert_eq!(registry.id_of(internal), Some(3));
    assert_eq!(registry.id_of(lonely), Some(4));
    assert_eq!(registry.next_id(), 5);
}

#[test]
fn repeated_site_facts_are_rejected() {
    let (p, mut facts) = one_external_caller();
    let again = facts.sites[1].clone();
    facts.sites.push(again);

    match TargetRegistry::populate(&p, &facts, &CfiConfig::default()) {
        Err(RegistryError::DuplicateSite { function, kind, .. }) => {
            assert_eq!(function, "c1");
            assert_eq!(kind, SiteKind::Call);
        }
        other => panic!("expected a duplicate site error, got {other:?}"),
    }
}
