//! Fault routing: catch scopes, cleanup subroutines, handler selection,
//! host-fault policy and stack traces.

use vireo::{HostFaultPolicy, Interp, NativeFn, Op, Value, VmError};

use crate::util::{eval, function, function_value, global, script};

#[test]
fn thrown_value_reaches_the_catch_handler() {
    let v = eval(|b| {
        b.locals(3);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let done = b.label();
        b.bind(t_start);
        b.load_string("boom");
        b.emit_at_line(Op::Throw, 3);
        b.bind(t_end);
        b.emit_jump(Op::Goto, done);
        b.bind(handler);
        b.index(1).emit(Op::LocalLoad);
        b.index(2).string_reg("e").emit_byte(Op::CatchScope, 0);
        b.index(2).emit(Op::ScopeLoad);
        b.string_reg("e").emit(Op::Name);
        b.emit(Op::Return);
        b.bind(done).emit(Op::RetUndef);
        b.guarded_region(t_start, t_end, handler, false, 1, 0);
    })
    .unwrap();
    assert_eq!(v, Value::str("boom"));
}

#[test]
fn code_after_an_untriggered_region_runs_normally() {
    let v = eval(|b| {
        b.locals(3);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let done = b.label();
        b.bind(t_start);
        b.load_number(5.0).emit(Op::PopResult);
        b.bind(t_end);
        b.emit_jump(Op::Goto, done);
        b.bind(handler);
        b.load_number(-1.0).emit(Op::Return);
        b.bind(done).emit(Op::ReturnResult);
        b.guarded_region(t_start, t_end, handler, false, 1, 0);
    })
    .unwrap();
    assert_eq!(v, Value::Number(5.0));
}

/// Standard cleanup shape: a finally region whose handler runs the
/// subroutine and rethrows the parked fault.
fn finally_script(fail: bool) -> std::rc::Rc<vireo::CompiledUnit> {
    script(|b| {
        b.locals(3);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let fin = b.label();
        let done = b.label();
        b.bind(t_start);
        b.load_number(42.0).emit(Op::PopResult);
        if fail {
            b.load_string("boom");
            b.emit_at_line(Op::Throw, 5);
        }
        b.bind(t_end);
        b.emit_jump(Op::Gosub, fin);
        b.emit_jump(Op::Goto, done);
        b.bind(handler);
        b.emit_jump(Op::Gosub, fin);
        b.index(1).emit(Op::RethrowLocal);
        b.bind(fin);
        b.index(2).emit(Op::StartSub);
        b.string_reg("hits").emit(Op::BindName);
        b.string_reg("hits").emit(Op::Name);
        b.load_number(1.0).emit(Op::Add);
        b.string_reg("hits").emit(Op::SetName).emit(Op::Pop);
        b.index(2).emit(Op::RetSub);
        b.bind(done).emit(Op::ReturnResult);
        b.guarded_region(t_start, t_end, handler, true, 1, 0);
    })
}

#[test]
fn cleanup_runs_on_normal_completion() {
    let mut interp = Interp::new();
    interp.define_global("hits", Value::Number(0.0)).unwrap();
    let v = interp.exec(&finally_script(false)).unwrap();
    assert_eq!(v, Value::Number(42.0));
    assert_eq!(global(&interp, "hits"), Value::Number(1.0));
}

#[test]
fn cleanup_runs_once_then_the_fault_continues() {
    let mut interp = Interp::new();
    interp.define_global("hits", Value::Number(0.0)).unwrap();
    let err = interp.exec(&finally_script(true)).unwrap_err();
    assert!(matches!(err, VmError::Thrown { .. }), "{err}");
    assert_eq!(global(&interp, "hits"), Value::Number(1.0));
}

#[test]
fn innermost_region_wins() {
    // an outer cleanup region wraps an inner catch region; the catch wins
    // and the outer cleanup is never entered
    let mut interp = Interp::new();
    interp.define_global("hits", Value::Number(0.0)).unwrap();
    let unit = script(|b| {
        b.locals(4);
        b.index(0).emit(Op::ScopeSave);
        let o_start = b.label();
        let o_end = b.label();
        let o_handler = b.label();
        let i_start = b.label();
        let i_end = b.label();
        let i_handler = b.label();
        let done = b.label();
        b.bind(o_start);
        b.emit(Op::Undef).emit(Op::Pop); // padding so the regions start apart
        b.bind(i_start);
        b.load_string("boom");
        b.emit_at_line(Op::Throw, 9);
        b.bind(i_end);
        b.emit_jump(Op::Goto, done);
        b.bind(o_end);
        b.emit_jump(Op::Goto, done);
        b.bind(i_handler);
        b.index(1).emit(Op::LocalLoad);
        b.index(3).string_reg("e").emit_byte(Op::CatchScope, 0);
        b.index(3).emit(Op::ScopeLoad);
        b.string_reg("e").emit(Op::Name);
        b.emit(Op::Return);
        b.bind(o_handler);
        b.string_reg("hits").emit(Op::BindName);
        b.load_number(1.0);
        b.string_reg("hits").emit(Op::SetName).emit(Op::Pop);
        b.index(2).emit(Op::RethrowLocal);
        b.bind(done).emit(Op::RetUndef);
        b.guarded_region(i_start, i_end, i_handler, false, 1, 0);
        b.guarded_region(o_start, o_end, o_handler, true, 2, 0);
    });
    let v = interp.exec(&unit).unwrap();
    assert_eq!(v, Value::str("boom"));
    assert_eq!(global(&interp, "hits"), Value::Number(0.0));
}

fn faulting_call_in_catch_region(interp: &mut Interp) -> Result<Value, VmError> {
    let unit = script(|b| {
        b.locals(3);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let done = b.label();
        b.bind(t_start);
        b.string_reg("fail").emit(Op::Name);
        b.emit(Op::Undef);
        b.index(0).emit(Op::Call);
        b.emit(Op::Pop);
        b.bind(t_end);
        b.emit_jump(Op::Goto, done);
        b.bind(handler);
        b.index(1).emit(Op::LocalLoad);
        b.index(2).string_reg("e").emit_byte(Op::CatchScope, 0);
        b.index(2).emit(Op::ScopeLoad);
        b.string_reg("e").emit(Op::Name);
        b.emit(Op::Return);
        b.bind(done).emit(Op::RetUndef);
        b.guarded_region(t_start, t_end, handler, false, 1, 0);
    });
    interp.exec(&unit)
}

#[test]
fn host_faults_bypass_catch_by_default() {
    let mut interp = Interp::new();
    interp
        .define_global(
            "fail",
            Value::Native(NativeFn::new("fail", |_i, _t, _a| {
                Err(VmError::host_fault("backend unavailable"))
            })),
        )
        .unwrap();
    let err = faulting_call_in_catch_region(&mut interp).unwrap_err();
    assert!(matches!(err, VmError::HostFault { .. }), "{err}");
}

#[test]
fn host_faults_are_catchable_under_the_permissive_policy() {
    let mut interp = Interp::new();
    interp.set_host_fault_policy(HostFaultPolicy::Catchable);
    interp
        .define_global(
            "fail",
            Value::Native(NativeFn::new("fail", |_i, _t, _a| {
                Err(VmError::host_fault("backend unavailable"))
            })),
        )
        .unwrap();
    let v = faulting_call_in_catch_region(&mut interp).unwrap();
    assert_eq!(v, Value::str("host fault: backend unavailable"));
}

#[test]
fn fatal_faults_skip_cleanup() {
    let mut interp = Interp::new();
    interp.define_global("hits", Value::Number(0.0)).unwrap();
    interp
        .define_global(
            "corrupt",
            Value::Native(NativeFn::new("corrupt", |_i, _t, _a| {
                Err(VmError::fatal("icode corrupt"))
            })),
        )
        .unwrap();
    let unit = script(|b| {
        b.locals(3);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let fin = b.label();
        let done = b.label();
        b.bind(t_start);
        b.string_reg("corrupt").emit(Op::Name);
        b.emit(Op::Undef);
        b.index(0).emit(Op::Call);
        b.emit(Op::Pop);
        b.bind(t_end);
        b.emit_jump(Op::Gosub, fin);
        b.emit_jump(Op::Goto, done);
        b.bind(handler);
        b.emit_jump(Op::Gosub, fin);
        b.index(1).emit(Op::RethrowLocal);
        b.bind(fin);
        b.index(2).emit(Op::StartSub);
        b.string_reg("hits").emit(Op::BindName);
        b.load_number(1.0);
        b.string_reg("hits").emit(Op::SetName).emit(Op::Pop);
        b.index(2).emit(Op::RetSub);
        b.bind(done).emit(Op::RetUndef);
        b.guarded_region(t_start, t_end, handler, true, 1, 0);
    });
    let err = interp.exec(&unit).unwrap_err();
    assert!(matches!(err, VmError::Fatal { .. }), "{err}");
    assert_eq!(global(&interp, "hits"), Value::Number(0.0));
}

#[test]
fn uncaught_faults_carry_a_script_stack() {
    let inner = function("inner", 0, 0, |b| {
        b.emit_line(7);
        b.load_string("kaput");
        b.emit_at_line(Op::Throw, 7);
    });
    let mut interp = Interp::new();
    let f = function_value(&interp, &inner);
    interp.define_global("inner", f).unwrap();
    let unit = script(|b| {
        b.emit_line(2);
        b.string_reg("inner").emit(Op::Name);
        b.emit(Op::Undef);
        b.index(0).emit(Op::Call);
        b.emit(Op::Return);
    });
    let err = interp.exec(&unit).unwrap_err();
    let VmError::Thrown { value, stack } = err else {
        panic!("expected a thrown value, got {err}");
    };
    assert_eq!(value, Value::str("kaput"));
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0].function.as_deref(), Some("inner"));
    assert_eq!(stack[0].line, Some(7));
    assert_eq!(stack[1].function, None);
    assert_eq!(stack[1].line, Some(2));
}

#[test]
fn rethrow_from_a_nested_region_reaches_the_outer_handler() {
    // inner catch rethrows; the outer catch observes the same value
    let v = eval(|b| {
        b.locals(5);
        b.index(0).emit(Op::ScopeSave);
        let o_start = b.label();
        let o_end = b.label();
        let o_handler = b.label();
        let i_start = b.label();
        let i_end = b.label();
        let i_handler = b.label();
        let done = b.label();
        b.bind(o_start);
        b.emit(Op::Undef).emit(Op::Pop);
        b.bind(i_start);
        b.load_string("boom");
        b.emit_at_line(Op::Throw, 4);
        b.bind(i_end);
        b.emit_jump(Op::Goto, done);
        // the inner handler sits inside the outer region, so its rethrow
        // routes outward
        b.bind(i_handler);
        b.index(1).emit(Op::RethrowLocal);
        b.bind(o_end);
        b.emit_jump(Op::Goto, done);
        b.bind(o_handler);
        b.index(2).emit(Op::LocalLoad);
        b.index(3).string_reg("e").emit_byte(Op::CatchScope, 0);
        b.index(3).emit(Op::ScopeLoad);
        b.string_reg("e").emit(Op::Name);
        b.emit(Op::Return);
        b.bind(done).emit(Op::RetUndef);
        b.guarded_region(i_start, i_end, i_handler, false, 1, 0);
        b.guarded_region(o_start, o_end, o_handler, false, 2, 0);
    })
    .unwrap();
    assert_eq!(v, Value::str("boom"));
}
