//! Value coercions inserted around rewritten calls.

use crate::model::{Builder, CastOp, Type, Value};

/// Convert `value` to `to`, or `None` when no cast sequence exists.
///
/// Integer narrowing/widening is signed; float-to-integer and
/// integer-to-float reinterpret the raw bits and zero-extend.
pub fn cast_to(b: &mut Builder<'_>, value: Value, to: &Type) -> Option<Value> {
    let from = b.type_of(&value);
    if &from == to {
        return Some(value);
    }
    match (to, from) {
        (Type::Ptr, Type::Ptr) => Some(value),
        (Type::Ptr, Type::Int(_)) => Some(b.cast(CastOp::IntToPtr, value, Type::Ptr)),
        (Type::Int(_), Type::Ptr) => Some(b.cast(CastOp::PtrToInt, value, to.clone())),
        (Type::Int(_), Type::Int(_)) => Some(b.cast(CastOp::IntCast { signed: true }, value, to.clone())),
        (Type::Int(bits), Type::Float(fbits)) => {
            if *bits == fbits {
                return Some(b.cast(CastOp::Bitcast, value, to.clone()));
            }
            let raw = b.cast(CastOp::Bitcast, value, Type::Int(fbits));
            Some(b.cast(CastOp::IntCast { signed: false }, raw, to.clone()))
        }
        (Type::Float(_), Type::Float(_)) => Some(b.cast(CastOp::FpCast, value, to.clone())),
        (Type::Float(fbits), Type::Int(ibits)) if *fbits > 0 => {
            let raw = if ibits != *fbits {
                b.cast(CastOp::IntCast { signed: false }, value, Type::Int(*fbits))
            } else {
                value
            };
            Some(b.cast(CastOp::Bitcast, raw, to.clone()))
        }
        _ => None,
    }
}

/// Like `cast_to`, but a `void` result feeding a value becomes undefined.
pub fn cast_to_or_undef(b: &mut Builder<'_>, value: Value, to: &Type) -> Option<Value> {
    if b.type_of(&value).is_void() && !to.is_void() {
        return Some(Value::Undef(to.clone()));
    }
    cast_to(b, value, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Body, InstKind};

    #[test]
    fn integer_to_pointer_uses_inttoptr() {
        let mut body = Body::new();
        let mut b = Builder::new(&mut body, vec![Type::Int(64)], 64);
        let v = cast_to(&mut b, Value::Arg(0), &Type::Ptr).expect("cast");
        let Value::Inst(id) = v else { panic!("expected instruction") };
        assert!(matches!(body.inst(id).kind, InstKind::Cast { op: CastOp::IntToPtr, .. }));
    }

    #[test]
    fn aggregates_do_not_coerce() {
        let mut body = Body::new();
        let mut b = Builder::new(&mut body, vec![Type::Int(64)], 64);
        let agg = Type::Struct(vec![Type::Int(32), Type::Int(32)]);
        assert!(cast_to(&mut b, Value::Arg(0), &agg).is_none());
    }

    #[test]
    fn void_result_becomes_undef() {
        let mut body = Body::new();
        let mut b = Builder::new(&mut body, vec![], 64);
        let call = b.call_indirect(Value::addr(0), vec![], Type::Void);
        assert_eq!(cast_to_or_undef(&mut b, call, &Type::Int(32)), Some(Value::Undef(Type::Int(32))));
    }
}
