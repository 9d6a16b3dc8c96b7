//! Generator suspension, resumption, injected exceptions and closing.

use std::cell::RefCell;
use std::rc::Rc;

use vireo::{
    CodeBuilder, CompiledUnit, GeneratorOp, GeneratorResult, Interp, NativeFn, Op, Value, VmError,
};

use crate::util::{function, function_value, global};

fn counter_unit() -> Rc<CompiledUnit> {
    function("counter", 0, 0, |b| {
        b.emit_at_line(Op::GeneratorCreate, 1);
        b.load_number(1.0);
        b.emit_at_line(Op::Yield, 2);
        b.emit(Op::Pop);
        b.load_number(2.0);
        b.emit_at_line(Op::Yield, 3);
        b.emit(Op::Pop);
        b.load_number(99.0);
        b.emit_at_line(Op::GeneratorReturn, 4);
    })
}

fn create(interp: &mut Interp, unit: &Rc<CompiledUnit>) -> Value {
    let f = function_value(interp, unit);
    interp
        .call_function(&f, &Value::Undefined, &[])
        .expect("creation should not run the body")
}

#[test]
fn creation_returns_a_generator_without_running_the_body() {
    let mut interp = Interp::new();
    let generator = create(&mut interp, &counter_unit());
    assert!(matches!(generator, Value::Generator(_)), "{generator:?}");
}

#[test]
fn send_steps_through_yields_to_the_return() {
    let mut interp = Interp::new();
    let unit = counter_unit();
    let generator = create(&mut interp, &unit);

    let r = interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Yielded(Value::Number(1.0)));

    let r = interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Yielded(Value::Number(2.0)));

    let r = interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Returned(Value::Number(99.0)));
}

#[test]
fn sent_values_become_the_yield_result() {
    // echo: yields its argument back doubled each round
    let unit = function("echo", 0, 0, |b| {
        b.emit_at_line(Op::GeneratorCreate, 1);
        b.emit(Op::Undef);
        b.emit_at_line(Op::Yield, 2);
        b.emit(Op::Dup).emit(Op::Add);
        b.emit_at_line(Op::Yield, 3);
        b.emit_at_line(Op::GeneratorReturn, 4);
    });
    let mut interp = Interp::new();
    let generator = create(&mut interp, &unit);

    interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    let r = interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Number(21.0))
        .unwrap();
    assert_eq!(r, GeneratorResult::Yielded(Value::Number(42.0)));
}

#[test]
fn resuming_a_finished_generator_is_an_error() {
    let mut interp = Interp::new();
    let unit = counter_unit();
    let generator = create(&mut interp, &unit);
    for _ in 0..3 {
        interp
            .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
            .unwrap();
    }
    let err = interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap_err();
    assert!(matches!(err, VmError::Thrown { .. } | VmError::Type { .. }), "{err}");
}

#[test]
fn closing_a_finished_generator_is_a_no_op() {
    let mut interp = Interp::new();
    let unit = counter_unit();
    let generator = create(&mut interp, &unit);
    for _ in 0..3 {
        interp
            .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
            .unwrap();
    }
    let r = interp
        .resume_generator(&generator, GeneratorOp::Close, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Closed(Value::Undefined));
}

#[test]
fn throw_injects_at_the_suspension_point() {
    let mut interp = Interp::new();
    let unit = counter_unit();
    let generator = create(&mut interp, &unit);
    interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    let err = interp
        .resume_generator(&generator, GeneratorOp::Throw, Value::str("bang"))
        .unwrap_err();
    let VmError::Thrown { value, .. } = err else {
        panic!("expected the injected value to surface");
    };
    assert_eq!(value, Value::str("bang"));
}

#[test]
fn resumed_frames_attach_to_the_resuming_invocation() {
    // a fault injected mid-resume must trace into the script that drove
    // the resume, not the long-gone creation site
    let mut interp = Interp::new();
    let generator = create(&mut interp, &counter_unit());
    interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    interp.define_global("g", generator).unwrap();

    let sources = Rc::new(RefCell::new(Vec::new()));
    let seen = sources.clone();
    interp
        .define_global(
            "inject",
            Value::Native(NativeFn::new("inject", move |interp, _this, args| {
                let err = interp
                    .resume_generator(&args[0], GeneratorOp::Throw, Value::str("bang"))
                    .expect_err("the injected fault should surface");
                if let VmError::Thrown { stack, .. } = &err {
                    for el in stack {
                        seen.borrow_mut().push(el.source.to_string());
                    }
                }
                Ok(Value::Undefined)
            })),
        )
        .unwrap();

    let driver = {
        let mut b = CodeBuilder::new("driver", "driver.vs");
        b.script();
        b.string_reg("inject").emit(Op::Name);
        b.emit(Op::Undef);
        b.string_reg("g").emit(Op::Name);
        b.index(1).emit(Op::Call);
        b.emit(Op::Return);
        b.build().unwrap()
    };
    interp.exec(&driver).unwrap();
    assert_eq!(
        *sources.borrow(),
        vec!["test.vs".to_string(), "driver.vs".to_string()]
    );
}

fn cleanup_generator() -> Rc<CompiledUnit> {
    // one yield wrapped in a cleanup region that bumps the `hits` global
    function("gen", 0, 0, |b| {
        b.locals(3);
        b.emit_at_line(Op::GeneratorCreate, 1);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let fin = b.label();
        let done = b.label();
        b.bind(t_start);
        b.load_number(1.0);
        b.emit_at_line(Op::Yield, 3);
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
        b.string_reg("hits").emit(Op::Name);
        b.load_number(1.0).emit(Op::Add);
        b.string_reg("hits").emit(Op::SetName).emit(Op::Pop);
        b.index(2).emit(Op::RetSub);
        b.bind(done);
        b.load_number(7.0);
        b.emit_at_line(Op::GeneratorReturn, 9);
        b.guarded_region(t_start, t_end, handler, true, 1, 0);
    })
}

#[test]
fn close_runs_cleanup_blocks() {
    let mut interp = Interp::new();
    interp.define_global("hits", Value::Number(0.0)).unwrap();
    let unit = cleanup_generator();
    let generator = create(&mut interp, &unit);

    let r = interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Yielded(Value::Number(1.0)));

    let r = interp
        .resume_generator(&generator, GeneratorOp::Close, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Closed(Value::Undefined));
    assert_eq!(global(&interp, "hits"), Value::Number(1.0));
}

#[test]
fn close_does_not_enter_catch_handlers() {
    // a catch region around the yield must not swallow the close signal
    let unit = function("gen", 0, 0, |b| {
        b.locals(3);
        b.emit_at_line(Op::GeneratorCreate, 1);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let done = b.label();
        b.bind(t_start);
        b.load_number(1.0);
        b.emit_at_line(Op::Yield, 3);
        b.emit(Op::Pop);
        b.bind(t_end);
        b.emit_jump(Op::Goto, done);
        b.bind(handler);
        b.load_number(-1.0);
        b.emit_at_line(Op::GeneratorReturn, 5);
        b.bind(done);
        b.load_number(7.0);
        b.emit_at_line(Op::GeneratorReturn, 7);
        b.guarded_region(t_start, t_end, handler, false, 1, 0);
    });
    let mut interp = Interp::new();
    let generator = create(&mut interp, &unit);
    interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    let r = interp
        .resume_generator(&generator, GeneratorOp::Close, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Closed(Value::Undefined));
}

#[test]
fn yield_while_closing_is_a_type_error() {
    // the cleanup subroutine itself yields, which a closing generator
    // cannot allow
    let unit = function("gen", 0, 0, |b| {
        b.locals(3);
        b.emit_at_line(Op::GeneratorCreate, 1);
        b.index(0).emit(Op::ScopeSave);
        let t_start = b.label();
        let t_end = b.label();
        let handler = b.label();
        let fin = b.label();
        let done = b.label();
        b.bind(t_start);
        b.load_number(1.0);
        b.emit_at_line(Op::Yield, 3);
        b.emit(Op::Pop);
        b.bind(t_end);
        b.emit_jump(Op::Gosub, fin);
        b.emit_jump(Op::Goto, done);
        b.bind(handler);
        b.emit_jump(Op::Gosub, fin);
        b.index(1).emit(Op::RethrowLocal);
        b.bind(fin);
        b.index(2).emit(Op::StartSub);
        b.load_number(5.0);
        b.emit_at_line(Op::Yield, 6);
        b.emit(Op::Pop);
        b.index(2).emit(Op::RetSub);
        b.bind(done);
        b.emit_at_line(Op::GeneratorEnd, 8);
        b.guarded_region(t_start, t_end, handler, true, 1, 0);
    });
    let mut interp = Interp::new();
    let generator = create(&mut interp, &unit);
    interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    let err = interp
        .resume_generator(&generator, GeneratorOp::Close, Value::Undefined)
        .unwrap_err();
    assert!(matches!(err, VmError::Thrown { .. }), "{err}");
}

#[test]
fn generator_end_completes_with_undefined() {
    let unit = function("gen", 0, 0, |b| {
        b.emit_at_line(Op::GeneratorCreate, 1);
        b.load_number(1.0);
        b.emit_at_line(Op::Yield, 2);
        b.emit(Op::Pop);
        b.emit_at_line(Op::GeneratorEnd, 3);
    });
    let mut interp = Interp::new();
    let generator = create(&mut interp, &unit);
    interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    let r = interp
        .resume_generator(&generator, GeneratorOp::Send, Value::Undefined)
        .unwrap();
    assert_eq!(r, GeneratorResult::Returned(Value::Undefined));
}
