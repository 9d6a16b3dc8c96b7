//! Instruction accounting and the periodic observer callback.

use std::cell::Cell;
use std::rc::Rc;

use vireo::{Interp, Op, Value, VmError};

use crate::util::script;

fn loop_script(iterations: f64) -> Rc<vireo::CompiledUnit> {
    // i = 0; while (i < iterations) i = i + 1; return i
    script(|b| {
        b.params_and_vars(0, 1);
        let top = b.label();
        let out = b.label();
        b.load_number(0.0);
        b.emit_byte(Op::SetVar1, 0).emit(Op::Pop);
        b.bind(top);
        b.emit_byte(Op::GetVar1, 0);
        b.load_number(iterations);
        b.emit(Op::Lt);
        b.emit_jump(Op::IfFalse, out);
        b.emit_byte(Op::GetVar1, 0);
        b.load_number(1.0).emit(Op::Add);
        b.emit_byte(Op::SetVar1, 0).emit(Op::Pop);
        b.emit_jump(Op::Goto, top);
        b.bind(out);
        b.emit_byte(Op::GetVar1, 0);
        b.emit(Op::Return);
    })
}

#[test]
fn observer_fires_while_a_loop_runs() {
    let mut interp = Interp::new();
    let fired = Rc::new(Cell::new(0u32));
    let seen = fired.clone();
    interp.set_instruction_observer(10, move |count| {
        assert!(count > 10);
        seen.set(seen.get() + 1);
        Ok(())
    });
    let v = interp.exec(&loop_script(50.0)).unwrap();
    assert_eq!(v, Value::Number(50.0));
    assert!(fired.get() > 1, "observer fired {} times", fired.get());
}

#[test]
fn observer_error_aborts_execution() {
    let mut interp = Interp::new();
    interp.set_instruction_observer(10, |_count| {
        Err(VmError::host_fault("instruction quota exhausted"))
    });
    let err = interp.exec(&loop_script(1_000_000.0)).unwrap_err();
    assert!(matches!(err, VmError::HostFault { .. }), "{err}");
}

#[test]
fn clearing_the_observer_stops_callbacks() {
    let mut interp = Interp::new();
    let fired = Rc::new(Cell::new(0u32));
    let seen = fired.clone();
    interp.set_instruction_observer(10, move |_count| {
        seen.set(seen.get() + 1);
        Ok(())
    });
    interp.clear_instruction_observer();
    interp.exec(&loop_script(50.0)).unwrap();
    assert_eq!(fired.get(), 0);
}
