//! Fixtures shared by the CLI tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use switchboard_core::document::write_document;
use switchboard_core::model::{Arch, BinOp, Global, Linkage, Program, Signature, Type, Value};

/// `add_1`, `add_10` in a constant table, and `main(fp, x) = fp(x)`.
pub fn table_program() -> Program {
    let mut p = Program::new("table", Arch::X86_64);
    let mut funcs = Vec::new();
    for k in [1u64, 10] {
        funcs.push(p.define(
            format!("add_{k}"),
            Signature::new(vec![Type::Int(32)], Type::Int(32)),
            Linkage::Internal,
            |b| {
                let sum = b.binary(BinOp::Add, b.arg(0), b.int(32, k));
                b.ret(Some(sum));
            },
        ));
    }
    p.add_global(Global {
        name: "table".to_string(),
        cells: funcs.iter().map(|f| Value::Func(*f)).collect(),
        constant: true,
    });
    p.define("main", Signature::new(vec![Type::Ptr, Type::Int(32)], Type::Int(32)), Linkage::External, |b| {
        let r = b.call_indirect(b.arg(0), vec![b.arg(1)], Type::Int(32));
        b.ret(Some(r));
    });
    p
}

/// Write the table program as `table.json` into `dir`.
pub fn write_table_program(dir: &Path) -> PathBuf {
    let path = dir.join("table.json");
    write_document(&path, &table_program()).expect("write program");
    path
}

/// Identifier of `name` in an `ids` listing.
pub fn id_in_listing(listing: &str, name: &str) -> u64 {
    for line in listing.lines() {
        let Some(rest) = line.trim().strip_prefix("- [ID ") else { continue };
        let Some((id, tail)) = rest.split_once("] ") else { continue };
        if tail.trim_end_matches(" (internal)") == name {
            return id.parse().expect("numeric id");
        }
    }
    panic!("{name} not in listing:\n{listing}");
}
