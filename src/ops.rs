// ABOUTME: Prefix and infix operator semantics over runtime objects

use crate::ast::{InfixOp, PrefixOp};
use crate::error::EvalFault;
use crate::object::Object;

pub fn prefix(op: PrefixOp, operand: &Object) -> Object {
    match (op, operand) {
        (PrefixOp::Neg, Object::Number(n)) => Object::Number(n.neg()),
        (PrefixOp::Not, value) => Object::Bool(!value.is_truthy()),
        (PrefixOp::BitNot, Object::Number(n)) => Object::Number(n.bit_not()),
        (PrefixOp::BitNot, Object::Bytes(data)) => {
            Object::Bytes(data.iter().map(|b| !b).collect())
        }
        (op, value) => Object::Error(EvalFault::type_mismatch(
            &format!("{}", op),
            "number",
            value.type_name(),
        )),
    }
}

pub fn infix(op: InfixOp, left: &Object, right: &Object) -> Object {
    match op {
        InfixOp::Eq => return Object::Bool(left.object_eq(right)),
        InfixOp::NotEq => return Object::Bool(!left.object_eq(right)),
        _ => {}
    }
    // list prepend/append bind before string coercion: `"x" +: xs` grows the list
    match (op, left, right) {
        (InfixOp::Prepend, _, Object::List(_))
        | (InfixOp::Append, Object::List(_), _)
        | (InfixOp::Add, Object::List(_), Object::List(_)) => return lists(op, left, right),
        _ => {}
    }
    match (left, right) {
        (Object::Number(a), Object::Number(b)) => numeric(op, a, b),
        (Object::Str(_), _) | (_, Object::Str(_)) => stringy(op, left, right),
        (Object::Bytes(a), Object::Bytes(b)) => bytes_pair(op, a, b),
        (Object::Bytes(_), _) | (_, Object::Bytes(_)) => bytes_mixed(op, left, right),
        (Object::List(_), _) | (_, Object::List(_)) => lists(op, left, right),
        _ => Object::Error(EvalFault::UnknownOperator(format!(
            "{} {} {}",
            left.type_name(),
            op,
            right.type_name()
        ))),
    }
}

fn numeric(op: InfixOp, a: &crate::number::Number, b: &crate::number::Number) -> Object {
    use std::cmp::Ordering;
    let number = |n| Object::Number(n);
    match op {
        InfixOp::Add => number(a.add(b)),
        InfixOp::Sub => number(a.sub(b)),
        InfixOp::Mul => number(a.mul(b)),
        InfixOp::Div => number(a.div(b)),
        InfixOp::Rem => number(a.rem(b)),
        InfixOp::BitAnd => number(a.bit_and(b)),
        InfixOp::BitOr => number(a.bit_or(b)),
        InfixOp::BitXor => number(a.bit_xor(b)),
        InfixOp::Shl => number(a.shl(b)),
        InfixOp::Shr => number(a.shr(b)),
        InfixOp::Lt => Object::Bool(a.cmp(b) == Some(Ordering::Less)),
        InfixOp::Gt => Object::Bool(a.cmp(b) == Some(Ordering::Greater)),
        InfixOp::LtEq => Object::Bool(matches!(
            a.cmp(b),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )),
        InfixOp::GtEq => Object::Bool(matches!(
            a.cmp(b),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )),
        other => Object::Error(EvalFault::UnknownOperator(format!(
            "number {} number",
            other
        ))),
    }
}

/// Mixed operations involving strings: `+` concatenates display forms,
/// `*` with a number repeats, comparisons are lexicographic.
fn stringy(op: InfixOp, left: &Object, right: &Object) -> Object {
    match (op, left, right) {
        (InfixOp::Add, _, _) => Object::Str(format!("{}{}", left, right)),
        (InfixOp::Mul, Object::Str(s), Object::Number(n))
        | (InfixOp::Mul, Object::Number(n), Object::Str(s)) => match n.to_index() {
            Some(count) => Object::Str(s.repeat(count)),
            None => Object::Error(EvalFault::type_mismatch(
                "*",
                "non-negative integer",
                &n.to_string(),
            )),
        },
        (InfixOp::Lt, Object::Str(a), Object::Str(b)) => Object::Bool(a < b),
        (InfixOp::Gt, Object::Str(a), Object::Str(b)) => Object::Bool(a > b),
        (InfixOp::LtEq, Object::Str(a), Object::Str(b)) => Object::Bool(a <= b),
        (InfixOp::GtEq, Object::Str(a), Object::Str(b)) => Object::Bool(a >= b),
        (op, left, right) => Object::Error(EvalFault::UnknownOperator(format!(
            "{} {} {}",
            left.type_name(),
            op,
            right.type_name()
        ))),
    }
}

/// Elementwise bytes operations cycle the shorter side over the longer.
fn cycle_zip(op: impl Fn(u8, u8) -> u8, a: &[u8], b: &[u8]) -> Vec<u8> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| op(a[i % a.len()], b[i % b.len()]))
        .collect()
}

fn bytes_pair(op: InfixOp, a: &[u8], b: &[u8]) -> Object {
    match op {
        InfixOp::Add => {
            let mut out = a.to_vec();
            out.extend_from_slice(b);
            Object::Bytes(out)
        }
        InfixOp::BitAnd => Object::Bytes(cycle_zip(|x, y| x & y, a, b)),
        InfixOp::BitOr => Object::Bytes(cycle_zip(|x, y| x | y, a, b)),
        InfixOp::BitXor => Object::Bytes(cycle_zip(|x, y| x ^ y, a, b)),
        other => Object::Error(EvalFault::UnknownOperator(format!(
            "bytes {} bytes",
            other
        ))),
    }
}

/// `n +: bytes` prepends a byte, `bytes :+ n` appends one.
fn bytes_mixed(op: InfixOp, left: &Object, right: &Object) -> Object {
    match (op, left, right) {
        (InfixOp::Prepend, Object::Number(n), Object::Bytes(data)) => match n.to_i64() {
            Some(b @ 0..=255) => {
                let mut out = Vec::with_capacity(data.len() + 1);
                out.push(b as u8);
                out.extend_from_slice(data);
                Object::Bytes(out)
            }
            _ => Object::Error(EvalFault::type_mismatch("+:", "byte value", &n.to_string())),
        },
        (InfixOp::Append, Object::Bytes(data), Object::Number(n)) => match n.to_i64() {
            Some(b @ 0..=255) => {
                let mut out = data.clone();
                out.push(b as u8);
                Object::Bytes(out)
            }
            _ => Object::Error(EvalFault::type_mismatch(":+", "byte value", &n.to_string())),
        },
        (op, left, right) => Object::Error(EvalFault::UnknownOperator(format!(
            "{} {} {}",
            left.type_name(),
            op,
            right.type_name()
        ))),
    }
}

fn lists(op: InfixOp, left: &Object, right: &Object) -> Object {
    match (op, left, right) {
        (InfixOp::Add, Object::List(a), Object::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Object::List(out)
        }
        (InfixOp::Prepend, value, Object::List(items)) => {
            let mut out = Vec::with_capacity(items.len() + 1);
            out.push(value.clone());
            out.extend(items.iter().cloned());
            Object::List(out)
        }
        (InfixOp::Append, Object::List(items), value) => {
            let mut out = items.clone();
            out.push(value.clone());
            Object::List(out)
        }
        (op, left, right) => Object::Error(EvalFault::UnknownOperator(format!(
            "{} {} {}",
            left.type_name(),
            op,
            right.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;

    fn num(s: &str) -> Object {
        Object::Number(Number::parse(s))
    }

    fn string(s: &str) -> Object {
        Object::Str(s.to_string())
    }

    #[test]
    fn test_numeric_operators() {
        assert!(infix(InfixOp::Add, &num("2"), &num("3")).object_eq(&num("5")));
        assert!(infix(InfixOp::Shl, &num("1"), &num("3")).object_eq(&num("8")));
        assert!(matches!(
            infix(InfixOp::Lt, &num("1"), &num("2")),
            Object::Bool(true)
        ));
    }

    #[test]
    fn test_string_coercion() {
        assert!(infix(InfixOp::Add, &string("a"), &num("1")).object_eq(&string("a1")));
        assert!(infix(InfixOp::Add, &num("1"), &string("a")).object_eq(&string("1a")));
        assert!(infix(InfixOp::Add, &string("a"), &Object::Nil).object_eq(&string("anil")));
    }

    #[test]
    fn test_string_repeat() {
        assert!(infix(InfixOp::Mul, &string("ab"), &num("3")).object_eq(&string("ababab")));
        assert!(matches!(
            infix(InfixOp::Mul, &string("ab"), &num("-1")),
            Object::Error(_)
        ));
    }

    #[test]
    fn test_list_concat_prepend_append() {
        let list = Object::List(vec![num("2")]);
        assert!(infix(InfixOp::Prepend, &num("1"), &list)
            .object_eq(&Object::List(vec![num("1"), num("2")])));
        assert!(infix(InfixOp::Append, &list, &num("3"))
            .object_eq(&Object::List(vec![num("2"), num("3")])));
        assert!(infix(InfixOp::Add, &list, &Object::List(vec![num("9")]))
            .object_eq(&Object::List(vec![num("2"), num("9")])));
    }

    #[test]
    fn test_bytes_elementwise_cycles_shorter_side() {
        let a = Object::Bytes(vec![0xFF, 0x0F, 0xF0, 0xAA]);
        let b = Object::Bytes(vec![0x0F]);
        match infix(InfixOp::BitAnd, &a, &b) {
            Object::Bytes(out) => assert_eq!(out, vec![0x0F, 0x0F, 0x00, 0x0A]),
            other => panic!("expected bytes, got {:?}", other),
        }
        match infix(InfixOp::BitXor, &b, &a) {
            Object::Bytes(out) => assert_eq!(out.len(), 4),
            other => panic!("expected bytes, got {:?}", other),
        }
    }

    #[test]
    fn test_bytes_concat_and_edges() {
        let a = Object::Bytes(vec![1, 2]);
        let b = Object::Bytes(vec![3]);
        match infix(InfixOp::Add, &a, &b) {
            Object::Bytes(out) => assert_eq!(out, vec![1, 2, 3]),
            other => panic!("expected bytes, got {:?}", other),
        }
        match infix(InfixOp::Prepend, &num("0"), &a) {
            Object::Bytes(out) => assert_eq!(out, vec![0, 1, 2]),
            other => panic!("expected bytes, got {:?}", other),
        }
        match infix(InfixOp::Append, &a, &num("9")) {
            Object::Bytes(out) => assert_eq!(out, vec![1, 2, 9]),
            other => panic!("expected bytes, got {:?}", other),
        }
        assert!(matches!(
            infix(InfixOp::Append, &a, &num("300")),
            Object::Error(_)
        ));
    }

    #[test]
    fn test_bytes_not() {
        match prefix(PrefixOp::BitNot, &Object::Bytes(vec![0x00, 0xFF])) {
            Object::Bytes(out) => assert_eq!(out, vec![0xFF, 0x00]),
            other => panic!("expected bytes, got {:?}", other),
        }
    }

    #[test]
    fn test_equality_across_types() {
        assert!(matches!(
            infix(InfixOp::Eq, &num("1"), &string("1")),
            Object::Bool(false)
        ));
        assert!(matches!(
            infix(InfixOp::NotEq, &num("1"), &string("1")),
            Object::Bool(true)
        ));
    }

    #[test]
    fn test_unknown_operator_faults() {
        assert!(matches!(
            infix(InfixOp::Sub, &Object::Nil, &Object::Bool(true)),
            Object::Error(EvalFault::UnknownOperator(_))
        ));
    }
}
