use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

use switchboard_core::model::interp::{function_address, Interpreter, RtValue};
use switchboard_core::model::{Program, Type};

use crate::commands::load_program;
use crate::{parse_assignment, parse_u64};

#[derive(Debug, Serialize)]
pub struct ExecOutcome {
    pub function: String,
    pub result: String,
    pub diagnostics: Vec<String>,
}

/// Run `function` of a serialized program in the reference interpreter.
///
/// Arguments are typed by the callee's signature; `@name` passes the address
/// of a function. Each `stub` is `name=value` and answers calls to the
/// declaration `name` with a constant.
pub fn exec_command(
    program_path: &Path,
    function: &str,
    args: &[String],
    stubs: &[String],
    run_ctors: bool,
    json: bool,
) -> Result<()> {
    let program = load_program(program_path)?;
    let callee = program.lookup(function)?;
    let sig = &program.function(callee).sig;

    if args.len() < sig.params.len() || (args.len() > sig.params.len() && !sig.variadic) {
        bail!("{function} takes {} argument(s), got {}", sig.params.len(), args.len());
    }
    let values = args
        .iter()
        .enumerate()
        .map(|(i, text)| parse_argument(&program, sig.params.get(i).unwrap_or(&Type::Int(64)), text))
        .collect::<Result<Vec<_>>>()?;

    let mut interp = Interpreter::new(&program);
    for stub in stubs {
        let (name, text) = parse_assignment(stub)?;
        let declared = program.lookup(name).with_context(|| format!("Cannot stub unknown function {name}"))?;
        let value = parse_argument(&program, &program.function(declared).sig.ret, text)?;
        interp = interp.with_hook(name, move |_| Ok(value.clone()));
    }

    let outcome = (|| {
        if run_ctors {
            interp.run_ctors()?;
        }
        interp.call_id(callee, values)
    })();

    let diagnostics = interp.diagnostics().to_vec();
    for line in &diagnostics {
        eprintln!("{line}");
    }
    let result = outcome.with_context(|| format!("Execution of {function} failed"))?;

    let outcome = ExecOutcome { function: function.to_string(), result: render(&result), diagnostics };
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.result);
    }
    Ok(())
}

fn parse_argument(program: &Program, ty: &Type, text: &str) -> Result<RtValue> {
    if let Some(name) = text.strip_prefix('@') {
        return Ok(RtValue::Ptr(function_address(program.lookup(name)?)));
    }
    match ty {
        Type::Void => Ok(RtValue::Void),
        Type::Int(bits) => Ok(RtValue::int(*bits, parse_integer(text)?)),
        Type::Ptr => Ok(RtValue::Ptr(parse_integer(text)?)),
        Type::Float(bits) => {
            let value = text.trim().parse::<f64>().map_err(|e| anyhow!("Invalid float '{text}': {e}"))?;
            Ok(RtValue::Float { bits: *bits, value })
        }
        other => bail!("Cannot pass {other:?} from the command line"),
    }
}

/// Two's complement for negative input.
fn parse_integer(text: &str) -> Result<u64> {
    match text.trim().strip_prefix('-') {
        Some(magnitude) => Ok(parse_u64(magnitude)?.wrapping_neg()),
        None => parse_u64(text),
    }
}

fn render(value: &RtValue) -> String {
    match value {
        RtValue::Void => "void".to_string(),
        RtValue::Int { value, .. } => value.to_string(),
        RtValue::Float { value, .. } => value.to_string(),
        RtValue::Ptr(addr) => format!("{addr:#x}"),
        RtValue::Undef => "undef".to_string(),
        RtValue::Aggregate(fields) => format!("{{{}}}", fields.iter().map(render).collect::<Vec<_>>().join(", ")),
    }
}
