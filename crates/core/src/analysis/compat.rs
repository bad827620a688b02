//! Structural signature matching between a site and a candidate function.

use crate::model::{Signature, Type};

/// Whether `callee` may be reached from a site whose call shape is `site`.
///
/// Only definitely-incompatible pairs are rejected: pointers match pointers,
/// integers match integers and floats match floats regardless of width; a
/// float never matches a non-float; anything else must agree in size.
pub fn is_compatible(site: &Signature, callee: &Signature, pointer_bits: u32) -> bool {
    let supplied = site.params.len();
    let accepted = callee.params.len();
    let variadic = site.variadic || callee.variadic;
    if !(accepted == supplied || (variadic && accepted < supplied)) {
        return false;
    }

    for (actual, formal) in site.params.iter().zip(callee.params.iter()) {
        if !same_class_or_size(actual, formal, pointer_bits) {
            return false;
        }
    }

    if site.ret.is_void() {
        return true;
    }
    if callee.ret.is_void() {
        return false;
    }
    same_class_or_size(&site.ret, &callee.ret, pointer_bits)
}

fn same_class_or_size(a: &Type, b: &Type, pointer_bits: u32) -> bool {
    if (a.is_ptr() && b.is_ptr()) || (a.is_int() && b.is_int()) || (a.is_float() && b.is_float()) {
        return true;
    }
    if a.is_float() != b.is_float() {
        return false;
    }
    a.size_bits(pointer_bits) == b.size_bits(pointer_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(params: Vec<Type>, ret: Type) -> Signature {
        Signature::new(params, ret)
    }

    #[test]
    fn ints_of_any_width_match() {
        assert!(is_compatible(&sig(vec![Type::Int(8)], Type::Int(64)), &sig(vec![Type::Int(32)], Type::Int(16)), 64));
    }

    #[test]
    fn pointer_and_integer_need_equal_width() {
        assert!(is_compatible(&sig(vec![Type::Int(64)], Type::Void), &sig(vec![Type::Ptr], Type::Void), 64));
        assert!(!is_compatible(&sig(vec![Type::Int(32)], Type::Void), &sig(vec![Type::Ptr], Type::Void), 64));
    }

    #[test]
    fn void_callee_cannot_feed_a_used_result() {
        assert!(!is_compatible(&sig(vec![], Type::Int(32)), &sig(vec![], Type::Void), 64));
        assert!(is_compatible(&sig(vec![], Type::Void), &sig(vec![], Type::Int(32)), 64));
    }

    #[test]
    fn floats_never_match_integers_of_equal_width() {
        assert!(!is_compatible(&sig(vec![Type::Float(64)], Type::Void), &sig(vec![Type::Int(64)], Type::Void), 64));
        assert!(!is_compatible(&sig(vec![Type::Int(32)], Type::Void), &sig(vec![Type::Float(32)], Type::Void), 64));
        assert!(!is_compatible(&sig(vec![Type::Ptr], Type::Void), &sig(vec![Type::Float(64)], Type::Void), 64));
        assert!(is_compatible(&sig(vec![Type::Float(32)], Type::Void), &sig(vec![Type::Float(64)], Type::Void), 64));
    }

    #[test]
    fn float_return_needs_a_float_site() {
        assert!(!is_compatible(&sig(vec![], Type::Int(64)), &sig(vec![], Type::Float(64)), 64));
        assert!(!is_compatible(&sig(vec![], Type::Float(32)), &sig(vec![], Type::Int(32)), 64));
        assert!(is_compatible(&sig(vec![], Type::Float(64)), &sig(vec![], Type::Float(32)), 64));
        assert!(is_compatible(&sig(vec![], Type::Void), &sig(vec![], Type::Float(64)), 64));
    }

    #[test]
    fn pointers_match_pointers() {
        assert!(is_compatible(&sig(vec![Type::Ptr, Type::Ptr], Type::Ptr), &sig(vec![Type::Ptr, Type::Ptr], Type::Ptr), 32));
    }
}
