//! Constants, arithmetic, comparisons and variable slots.

use std::rc::Rc;

use num_bigint::BigInt;
use vireo::{Interp, Op, Value, VmError};

use crate::util::{eval, function, function_value};

#[test]
fn adds_unboxed_numbers() {
    let v = eval(|b| {
        b.load_number(2.0).load_number(2.5).emit(Op::Add).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(4.5));
}

#[test]
fn concatenates_strings_on_the_fast_path() {
    let v = eval(|b| {
        b.load_string("foo").load_string("bar").emit(Op::Add).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::str("foobar"));
}

#[test]
fn add_coerces_mixed_operands_through_support() {
    let v = eval(|b| {
        b.load_number(3.0).load_string("x").emit(Op::Add).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::str("3x"));
}

#[test]
fn unboxed_boxed_and_coerced_operands_agree() {
    // (a - b) * a / b, fed each way the same doubles can arrive
    let expr = function("expr", 2, 0, |b| {
        b.emit_byte(Op::GetVar1, 0).emit_byte(Op::GetVar1, 1).emit(Op::Sub);
        b.emit_byte(Op::GetVar1, 0).emit(Op::Mul);
        b.emit_byte(Op::GetVar1, 1).emit(Op::Div);
        b.emit(Op::Return);
    });
    let mut interp = Interp::new();
    let f = function_value(&interp, &expr);

    let unboxed = eval(|b| {
        b.load_number(7.5).load_number(2.5).emit(Op::Sub);
        b.load_number(7.5).emit(Op::Mul);
        b.load_number(2.5).emit(Op::Div);
        b.emit(Op::Return);
    })
    .unwrap();
    let boxed = interp
        .call_function(&f, &Value::Undefined, &[Value::Number(7.5), Value::Number(2.5)])
        .unwrap();
    let coerced = interp
        .call_function(&f, &Value::Undefined, &[Value::str("7.5"), Value::str("2.5")])
        .unwrap();

    assert_eq!(unboxed, Value::Number(15.0));
    assert_eq!(boxed, unboxed);
    assert_eq!(coerced, unboxed);
}

#[test]
fn subtracts_and_divides() {
    let v = eval(|b| {
        b.load_number(10.0)
            .load_number(4.0)
            .emit(Op::Sub)
            .load_number(3.0)
            .emit(Op::Div)
            .emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(2.0));
}

#[test]
fn exponentiation() {
    let v = eval(|b| {
        b.load_number(2.0).load_number(10.0).emit(Op::Exp).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(1024.0));
}

#[test]
fn numeric_comparison() {
    let v = eval(|b| {
        b.load_number(1.0).load_number(2.0).emit(Op::Lt).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Bool(true));
}

#[test]
fn string_comparison_is_lexicographic() {
    let v = eval(|b| {
        b.load_string("apple").load_string("banana").emit(Op::Lt).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Bool(true));
}

#[test]
fn nan_compares_false_in_every_direction() {
    for op in [Op::Lt, Op::Le, Op::Gt, Op::Ge] {
        let v = eval(|b| {
            b.load_number(f64::NAN).load_number(1.0).emit(op).emit(Op::Return);
        })
        .unwrap();
        assert_eq!(v, Value::Bool(false), "{}", op.name());
    }
}

#[test]
fn loose_equality_coerces() {
    let v = eval(|b| {
        b.load_string("1").load_number(1.0).emit(Op::Eq).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Bool(true));
}

#[test]
fn strict_equality_does_not_coerce() {
    let v = eval(|b| {
        b.load_string("1").load_number(1.0).emit(Op::StrictEq).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Bool(false));
}

#[test]
fn typeof_of_a_string() {
    let v = eval(|b| {
        b.load_string("s").emit(Op::Typeof).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::str("string"));
}

#[test]
fn typeof_name_of_an_unbound_name_is_undefined() {
    let v = eval(|b| {
        b.string_reg("no_such_binding").emit(Op::TypeofName).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::str("undefined"));
}

#[test]
fn vars_round_trip_through_slots() {
    let v = eval(|b| {
        b.params_and_vars(0, 1);
        b.load_number(7.0).emit_byte(Op::SetVar1, 0).emit(Op::Pop);
        b.emit_byte(Op::GetVar1, 0).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(7.0));
}

#[test]
fn var_inc_dec_prefix_and_postfix() {
    // prefix increment pushes the new value
    let v = eval(|b| {
        b.params_and_vars(0, 1);
        b.load_number(5.0).emit_byte(Op::SetVar1, 0).emit(Op::Pop);
        b.index(0).emit_byte(Op::VarIncDec, 0).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(6.0));

    // postfix increment pushes the old value but still writes the new one
    let v = eval(|b| {
        b.params_and_vars(0, 1);
        b.load_number(5.0).emit_byte(Op::SetVar1, 0).emit(Op::Pop);
        b.index(0).emit_byte(Op::VarIncDec, 0x2).emit(Op::Pop);
        b.emit_byte(Op::GetVar1, 0).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(6.0));
}

#[test]
fn second_write_to_a_const_var_throws() {
    let err = eval(|b| {
        b.params_and_vars(0, 1);
        b.mark_const_var(0);
        b.load_number(1.0).index(0).emit(Op::SetConstVar).emit(Op::Pop);
        b.load_number(2.0).index(0).emit(Op::SetConstVar).emit(Op::Pop);
        b.emit(Op::RetUndef);
    })
    .unwrap_err();
    assert!(matches!(err, VmError::Thrown { .. }), "{err}");
}

#[test]
fn swap_exchanges_the_top_pair() {
    let v = eval(|b| {
        b.load_number(1.0).load_number(2.0).emit(Op::Swap).emit(Op::Sub).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(1.0));
}

#[test]
fn dup_duplicates_the_top_slot() {
    let v = eval(|b| {
        b.load_number(3.0).emit(Op::Dup).emit(Op::Mul).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(9.0));
}

#[test]
fn bit_ops_truncate_to_int32() {
    let v = eval(|b| {
        b.load_number(6.0).load_number(3.0).emit(Op::BitAnd).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(2.0));

    let v = eval(|b| {
        b.load_number(-1.0).load_number(28.0).emit(Op::Ursh).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(15.0));
}

#[test]
fn bigint_arithmetic_stays_exact() {
    let v = eval(|b| {
        b.load_big_int(BigInt::from(1_000_000_007u64))
            .load_big_int(BigInt::from(3))
            .emit(Op::Mul)
            .emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::BigInt(Rc::new(BigInt::from(3_000_000_021u64))));
}

#[test]
fn bigint_division_by_zero_throws_range_error() {
    let err = eval(|b| {
        b.load_big_int(BigInt::from(1)).load_big_int(BigInt::from(0)).emit(Op::Div).emit(Op::Return);
    })
    .unwrap_err();
    assert!(matches!(err, VmError::Thrown { .. }), "{err}");
}

#[test]
fn negation_handles_both_numeric_kinds() {
    let v = eval(|b| {
        b.load_number(4.0).emit(Op::Neg).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Number(-4.0));

    let v = eval(|b| {
        b.load_big_int(BigInt::from(4)).emit(Op::Neg).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::BigInt(Rc::new(BigInt::from(-4))));
}

#[test]
fn not_uses_boolean_coercion() {
    let v = eval(|b| {
        b.load_string("").emit(Op::Not).emit(Op::Return);
    })
    .unwrap();
    assert_eq!(v, Value::Bool(true));
}
