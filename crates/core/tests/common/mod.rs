//! Program builders shared by the integration tests.
#![allow(dead_code)]

use switchboard_core::model::{BinOp, FuncId, Global, Linkage, Program, Signature, Type, Value};
use switchboard_core::services::HardenReport;

fn int_to_int() -> Signature {
    Signature::new(vec![Type::Int(32)], Type::Int(32))
}

/// `add_<k>(x) = x + k` for every `k`, all stored in a constant table.
pub fn add_adders(p: &mut Program, adders: &[u64]) -> Vec<FuncId> {
    let mut funcs = Vec::new();
    for &k in adders {
        let f = p.define(format!("add_{k}"), int_to_int(), Linkage::Internal, |b| {
            let sum = b.binary(BinOp::Add, b.arg(0), b.int(32, k));
            b.ret(Some(sum));
        });
        funcs.push(f);
    }
    p.add_global(Global {
        name: "table".to_string(),
        cells: funcs.iter().map(|f| Value::Func(*f)).collect(),
        constant: true,
    });
    funcs
}

/// `name(fp, x) = fp(x)`.
pub fn add_caller(p: &mut Program, name: &str) -> FuncId {
    p.define(name, Signature::new(vec![Type::Ptr, Type::Int(32)], Type::Int(32)), Linkage::External, |b| {
        let r = b.call_indirect(b.arg(0), vec![b.arg(1)], Type::Int(32));
        b.ret(Some(r));
    })
}

/// Adders plus a single caller named `main`.
pub fn table_program(arch: switchboard_core::model::Arch, adders: &[u64]) -> Program {
    let mut p = Program::new("table", arch);
    add_adders(&mut p, adders);
    add_caller(&mut p, "main");
    p
}

/// Identifier of `name` from the listing in the report.
pub fn id_of(report: &HardenReport, name: &str) -> u64 {
    for line in report.ids.lines() {
        let Some(rest) = line.trim().strip_prefix("- [ID ") else { continue };
        let Some((id, tail)) = rest.split_once("] ") else { continue };
        let listed = tail.trim_end_matches(" (internal)");
        if listed == name {
            return id.parse().expect("numeric id");
        }
    }
    panic!("{name} not in id listing:\n{}", report.ids);
}
