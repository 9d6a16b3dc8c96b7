//! The dispatch engine: trampoline driver, instruction loop, fault routing
//!
//! Execution is a trampoline: [`run_frame`] executes instructions of one
//! frame until it returns, transfers to a callee, yields, or faults, and
//! the driver in [`interpret_loop`] swaps the current frame without growing
//! the native call stack. Faults carry an internal [`Throwable`] that the
//! router walks up the frame chain, consulting each unit's exception table.

use std::rc::Rc;

use num_bigint::BigInt;

use crate::code::CompiledUnit;
use crate::error::VmError;
use crate::interpreter::continuation::{self, ContinuationJump};
use crate::interpreter::frame::{materialize, CallOp, FrameHandle, FrameRef, ATTR_CONST_INIT};
use crate::interpreter::generator::{Generator, GeneratorOp, GeneratorState};
use crate::interpreter::{
    capture_stack, enter_frame, exit_frame, init_frame, set_call_result, HostFaultPolicy, Interp,
};
use crate::opcode::Op;
use crate::support::RuntimeSupport;
use crate::value::{
    bigint_arith, double_arith, to_int32, to_uint32, ArithOp, InterpFn, LiteralStage, Numeric,
    Value,
};

pub(crate) const INVOCATION_COST: u64 = 100;
pub(crate) const EXCEPTION_COST: u64 = 100;

/// An in-flight fault travelling from a throw site to a handler, a cleanup
/// block, or the embedder.
#[derive(Clone)]
pub enum Throwable {
    /// A script-level thrown value; routable to catch handlers.
    Language {
        value: Value,
        source: Rc<str>,
        line: Option<u32>,
    },
    /// Infrastructure failure from runtime support or a native function.
    Host(VmError),
    /// Non-recoverable failure: no handlers, no cleanup, full unwind.
    Fatal(VmError),
    /// A continuation is being re-entered; cleanup-only while unwinding.
    Jump(ContinuationJump),
    /// A generator is being closed; its value is delivered to cleanup
    /// blocks only.
    GeneratorClose(Value),
}

impl Throwable {
    pub fn from_vm_error(
        e: VmError,
        source: Rc<str>,
        line: Option<u32>,
        support: &dyn RuntimeSupport,
    ) -> Throwable {
        match &e {
            VmError::Type { .. }
            | VmError::Range { .. }
            | VmError::Reference { .. }
            | VmError::Syntax { .. }
            | VmError::Thrown { .. } => Throwable::Language {
                value: support.error_to_value(&e),
                source,
                line,
            },
            VmError::HostFault { .. } => Throwable::Host(e),
            _ => Throwable::Fatal(e),
        }
    }

    /// The value a catch handler binds for this fault.
    fn catch_value(&self, support: &dyn RuntimeSupport) -> Value {
        match self {
            Throwable::Language { value, .. } => value.clone(),
            Throwable::Host(e) => support.error_to_value(e),
            Throwable::Fatal(e) => support.error_to_value(e),
            Throwable::Jump(_) | Throwable::GeneratorClose(_) => Value::Undefined,
        }
    }
}

/// How far a fault may be routed into script handlers.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ExState {
    Catch,
    FinallyOnly,
    NoRoute,
}

fn classify(t: &Throwable, policy: HostFaultPolicy) -> ExState {
    match t {
        Throwable::Language { .. } => ExState::Catch,
        Throwable::Host(_) => match policy {
            HostFaultPolicy::Catchable => ExState::Catch,
            HostFaultPolicy::FinallyOnly => ExState::FinallyOnly,
        },
        Throwable::Fatal(_) => ExState::NoRoute,
        Throwable::Jump(_) | Throwable::GeneratorClose(_) => ExState::FinallyOnly,
    }
}

/// Why the current frame stopped executing.
pub(crate) enum Exit {
    /// The frame completed; its result fields are set.
    Return,
    /// Control transferred to a callee frame.
    Transfer(FrameRef),
    /// A generator frame froze itself and produced a value.
    Yield(Value),
}

enum Flow {
    Next,
    Exit(Exit),
}

/// Outcome of one whole interpreter invocation.
pub(crate) enum LoopResult {
    Complete(Value),
    /// A generator yielded; the frozen frame is handed back for storage.
    Yielded(Value, FrameRef),
    /// A generator close request finished unwinding the generator body.
    Closed(Value),
}

/// How an invocation starts: a fresh (or thawed) frame, or the restart of a
/// detached continuation.
pub(crate) enum Entry {
    Frame(FrameRef),
    Restart(ContinuationJump),
}

struct DispatchState {
    stack_top: usize,
    index_reg: usize,
    string_reg: Rc<str>,
    bigint_reg: Option<Rc<BigInt>>,
}

/// Run one invocation to completion, yield, or error. This is the only
/// entry into the trampoline; generator resumption and continuation
/// restarts both come through here.
pub(crate) fn interpret_loop(
    interp: &mut Interp,
    entry: Entry,
    mut gen_state: Option<&mut GeneratorState>,
) -> Result<LoopResult, VmError> {
    if let Some(last) = interp.last_frame.take() {
        interp.previous_invocations.push(last);
    }
    let result = drive(interp, entry, &mut gen_state);
    interp.last_frame = interp.previous_invocations.pop();
    result
}

fn drive(
    interp: &mut Interp,
    entry: Entry,
    gen_state: &mut Option<&mut GeneratorState>,
) -> Result<LoopResult, VmError> {
    let mut current = match entry {
        Entry::Frame(frame) => {
            if gen_state.is_some() {
                enter_frame(interp, &frame, &[], true);
            }
            frame
        }
        Entry::Restart(jump) => continuation::rewind(interp, &jump)?,
    };

    loop {
        interp.last_frame = Some(current.clone());
        match run_frame(interp, &current, gen_state.as_deref_mut()) {
            Ok(Exit::Yield(value)) => return Ok(LoopResult::Yielded(value, current)),
            Ok(Exit::Transfer(callee)) => current = callee,
            Ok(Exit::Return) => {
                exit_frame(interp, &current, None);
                let (result, result_dbl, parent) = {
                    let f = current.borrow();
                    (f.result.clone(), f.result_dbl, f.parent.clone())
                };
                match parent {
                    Some(parent) => {
                        let parent = if parent.borrow().frozen {
                            let clone = parent.borrow().clone_frozen();
                            Rc::new(std::cell::RefCell::new(clone))
                        } else {
                            parent
                        };
                        set_call_result(&parent, result, result_dbl)?;
                        current = parent;
                    }
                    None => {
                        let value = match result {
                            Value::DoubleMark => Value::Number(result_dbl),
                            other => other,
                        };
                        return Ok(LoopResult::Complete(value));
                    }
                }
            }
            Err(t) => match route_fault(interp, current.clone(), t)? {
                Routed::Resume(frame) => current = frame,
                Routed::Done(value) => return Ok(LoopResult::Complete(value)),
                Routed::Closed(value) => return Ok(LoopResult::Closed(value)),
            },
        }
    }
}

enum Routed {
    Resume(FrameRef),
    /// A continuation result was delivered at the invocation root.
    Done(Value),
    /// A generator close request consumed the whole generator chain.
    Closed(Value),
}

fn route_fault(interp: &mut Interp, frame: FrameRef, mut t: Throwable) -> Result<Routed, VmError> {
    let mut ex_state = classify(&t, interp.host_fault_policy);

    if interp.counting() {
        if let Err(e) = add_instruction_count(interp, &frame, EXCEPTION_COST) {
            match &e {
                VmError::HostFault { .. } => {
                    t = Throwable::Host(e);
                    ex_state = ExState::FinallyOnly;
                }
                _ => {
                    t = Throwable::Fatal(e);
                    ex_state = ExState::NoRoute;
                }
            }
        }
    }

    if let Some(hook) = interp.debug.clone() {
        match &t {
            Throwable::Language { value, .. } => hook.on_exception(&VmError::Thrown {
                value: value.clone(),
                stack: Vec::new(),
            }),
            Throwable::Host(e) => hook.on_exception(e),
            _ => {}
        }
    }

    // Trace must be taken before frames are unwound.
    let trace = capture_stack(&frame);

    let mut frame_opt = Some(frame);
    loop {
        let Some(frame) = frame_opt.clone() else { break };
        if ex_state != ExState::NoRoute {
            let only_finally = ex_state != ExState::Catch;
            let idx = {
                let f = frame.borrow();
                // pc was advanced past the opcode before routing
                f.unit
                    .exception_handler_index((f.pc - 1) as u32, only_finally)
            };
            if let Some(idx) = idx {
                return Ok(Routed::Resume(recover_handler(interp, frame, idx, t)));
            }
        }
        exit_frame(interp, &frame, Some(&t));
        frame_opt = frame.borrow().parent.clone();
        if let (Some(parent), Throwable::Jump(jump)) = (&frame_opt, &t) {
            if let Some(branch) = &jump.branch {
                if Rc::ptr_eq(branch, parent) {
                    break;
                }
            }
        }
    }

    match t {
        Throwable::Jump(jump) => {
            match (&jump.branch, &frame_opt) {
                (None, None) => {}
                (Some(b), Some(f)) if Rc::ptr_eq(b, f) => {}
                _ => {
                    return Err(VmError::internal(
                        "continuation unwind missed its branch frame",
                    ));
                }
            }
            if jump.captured.is_none() {
                // an empty continuation: just deliver the result
                let value = match jump.result {
                    Value::DoubleMark => Value::Number(jump.result_dbl),
                    other => other,
                };
                return Ok(Routed::Done(value));
            }
            Ok(Routed::Resume(continuation::rewind(interp, &jump)?))
        }
        Throwable::GeneratorClose(value) if frame_opt.is_none() => Ok(Routed::Closed(value)),
        Throwable::Language { value, .. } => Err(VmError::Thrown {
            value,
            stack: trace,
        }),
        Throwable::Host(e) | Throwable::Fatal(e) => Err(e),
        Throwable::GeneratorClose(_) => Err(VmError::internal(
            "generator close escaped through a live frame chain",
        )),
    }
}

/// Transfer control to the handler at `exception_table[idx]`: restore the
/// scope saved for the region, park the throwable in the exception slot,
/// and reset the operand stack.
fn recover_handler(interp: &Interp, frame: FrameRef, idx: usize, t: Throwable) -> FrameRef {
    let frame = if frame.borrow().frozen {
        let clone = frame.borrow().clone_frozen();
        Rc::new(std::cell::RefCell::new(clone))
    } else {
        frame
    };
    {
        let mut f = frame.borrow_mut();
        let rec = f.unit.exception_table[idx].clone();
        f.pc = rec.handler_pc as usize;
        if interp.counting() {
            f.pc_prev_branch = f.pc;
        }
        f.saved_stack_top = f.empty_stack_top;
        let scope_local = f.local_shift + rec.scope_slot as usize;
        let ex_local = f.local_shift + rec.exception_slot as usize;
        let scope = f.slot(scope_local);
        f.scope = scope;
        f.set_slot(ex_local, Value::Throwable(Rc::new(t)));
    }
    frame
}

fn run_frame(
    interp: &mut Interp,
    frame: &FrameRef,
    mut gen_state: Option<&mut GeneratorState>,
) -> Result<Exit, Throwable> {
    let unit = frame.borrow().unit.clone();
    let mut ds = DispatchState {
        stack_top: frame.borrow().saved_stack_top,
        index_reg: 0,
        string_reg: Rc::from(""),
        bigint_reg: None,
    };
    loop {
        let pc = frame.borrow().pc;
        match step(interp, frame, &unit, &mut ds, pc, gen_state.as_deref_mut()) {
            Ok(Flow::Next) => {}
            Ok(Flow::Exit(exit)) => return Ok(exit),
            Err(t) => {
                // the router expects pc just past the faulting opcode
                frame.borrow_mut().pc = pc + 1;
                return Err(t);
            }
        }
    }
}

fn step(
    interp: &mut Interp,
    frame: &FrameRef,
    unit: &Rc<CompiledUnit>,
    ds: &mut DispatchState,
    pc: usize,
    gen_state: Option<&mut GeneratorState>,
) -> Result<Flow, Throwable> {
    let byte = *unit
        .icode
        .get(pc)
        .ok_or_else(|| Throwable::Fatal(VmError::internal(format!("pc {pc} out of range"))))?;
    let op = Op::from_byte(byte).map_err(Throwable::Fatal)?;
    let opc = pc + 1;
    frame.borrow_mut().pc = opc;
    let support = interp.support.clone();

    match op {
        // constants
        Op::Zero => push_number(frame, ds, 0.0),
        Op::One => push_number(frame, ds, 1.0),
        Op::ShortNumber => {
            let n = unit.get_short(opc) as f64;
            frame.borrow_mut().pc = opc + 2;
            push_number(frame, ds, n)
        }
        Op::IntNumber => {
            let n = unit.get_int(opc) as f64;
            frame.borrow_mut().pc = opc + 4;
            push_number(frame, ds, n)
        }
        Op::Number => {
            let n = unit.double(ds.index_reg).map_err(Throwable::Fatal)?;
            push_number(frame, ds, n)
        }
        Op::String => push(frame, ds, Value::Str(ds.string_reg.clone())),
        Op::BigInt => {
            let b = ds
                .bigint_reg
                .clone()
                .ok_or_else(|| Throwable::Fatal(VmError::internal("bigint register empty")))?;
            push(frame, ds, Value::BigInt(b))
        }
        Op::Regex => {
            let r = unit.regexp(ds.index_reg).map_err(Throwable::Fatal)?;
            push(frame, ds, Value::Regex(r))
        }
        Op::True => push(frame, ds, Value::Bool(true)),
        Op::False => push(frame, ds, Value::Bool(false)),
        Op::Null => push(frame, ds, Value::Null),
        Op::Undef => push(frame, ds, Value::Undefined),
        Op::This => {
            let this = frame.borrow().this_obj.clone();
            push(frame, ds, this)
        }
        Op::ThisFn => {
            let func = frame.borrow().func.clone();
            push(frame, ds, Value::Function(func))
        }

        // registers
        Op::RegInd1 => {
            ds.index_reg = unit.icode[opc] as usize;
            frame.borrow_mut().pc = opc + 1;
            Ok(Flow::Next)
        }
        Op::RegInd2 => {
            ds.index_reg = unit.get_index(opc);
            frame.borrow_mut().pc = opc + 2;
            Ok(Flow::Next)
        }
        Op::RegInd4 => {
            ds.index_reg = unit.get_int(opc) as u32 as usize;
            frame.borrow_mut().pc = opc + 4;
            Ok(Flow::Next)
        }
        Op::RegStr1 => {
            ds.string_reg = unit
                .string(unit.icode[opc] as usize)
                .map_err(Throwable::Fatal)?;
            frame.borrow_mut().pc = opc + 1;
            Ok(Flow::Next)
        }
        Op::RegStr2 => {
            ds.string_reg = unit.string(unit.get_index(opc)).map_err(Throwable::Fatal)?;
            frame.borrow_mut().pc = opc + 2;
            Ok(Flow::Next)
        }
        Op::RegStr4 => {
            ds.string_reg = unit
                .string(unit.get_int(opc) as u32 as usize)
                .map_err(Throwable::Fatal)?;
            frame.borrow_mut().pc = opc + 4;
            Ok(Flow::Next)
        }
        Op::RegBigInt1 => {
            ds.bigint_reg = Some(
                unit.big_int(unit.icode[opc] as usize)
                    .map_err(Throwable::Fatal)?,
            );
            frame.borrow_mut().pc = opc + 1;
            Ok(Flow::Next)
        }
        Op::RegBigInt2 => {
            ds.bigint_reg = Some(unit.big_int(unit.get_index(opc)).map_err(Throwable::Fatal)?);
            frame.borrow_mut().pc = opc + 2;
            Ok(Flow::Next)
        }

        // stack shuffling
        Op::Pop => {
            frame.set_slot(ds.stack_top, Value::Undefined);
            ds.stack_top -= 1;
            Ok(Flow::Next)
        }
        Op::PopResult => {
            let (v, d) = frame.pair(ds.stack_top);
            {
                let mut f = frame.borrow_mut();
                f.result = v;
                f.result_dbl = d;
            }
            frame.set_slot(ds.stack_top, Value::Undefined);
            ds.stack_top -= 1;
            Ok(Flow::Next)
        }
        Op::Dup => {
            let (v, d) = frame.pair(ds.stack_top);
            ds.stack_top += 1;
            frame.set_pair(ds.stack_top, v, d);
            Ok(Flow::Next)
        }
        Op::Dup2 => {
            let (v1, d1) = frame.pair(ds.stack_top - 1);
            let (v2, d2) = frame.pair(ds.stack_top);
            frame.set_pair(ds.stack_top + 1, v1, d1);
            frame.set_pair(ds.stack_top + 2, v2, d2);
            ds.stack_top += 2;
            Ok(Flow::Next)
        }
        Op::Swap => {
            let (v1, d1) = frame.pair(ds.stack_top - 1);
            let (v2, d2) = frame.pair(ds.stack_top);
            frame.set_pair(ds.stack_top - 1, v2, d2);
            frame.set_pair(ds.stack_top, v1, d1);
            Ok(Flow::Next)
        }

        // vars and locals
        Op::GetVar => do_get_var(frame, ds, ds.index_reg),
        Op::SetVar => do_set_var(frame, ds, ds.index_reg),
        Op::SetConstVar => do_set_const_var(frame, unit, ds, ds.index_reg),
        Op::GetVar1 => {
            let i = unit.icode[opc] as usize;
            frame.borrow_mut().pc = opc + 1;
            do_get_var(frame, ds, i)
        }
        Op::SetVar1 => {
            let i = unit.icode[opc] as usize;
            frame.borrow_mut().pc = opc + 1;
            do_set_var(frame, ds, i)
        }
        Op::SetConstVar1 => {
            let i = unit.icode[opc] as usize;
            frame.borrow_mut().pc = opc + 1;
            do_set_const_var(frame, unit, ds, i)
        }
        Op::VarIncDec => {
            let flags = unit.icode[opc];
            frame.borrow_mut().pc = opc + 1;
            do_var_inc_dec(frame, &*support, ds, flags)
        }
        Op::LocalLoad => {
            let local = frame.borrow().local_shift + ds.index_reg;
            let (v, d) = frame.pair(local);
            ds.stack_top += 1;
            frame.set_pair(ds.stack_top, v, d);
            Ok(Flow::Next)
        }
        Op::LocalClear => {
            let local = frame.borrow().local_shift + ds.index_reg;
            frame.set_slot(local, Value::Undefined);
            Ok(Flow::Next)
        }

        // arithmetic
        Op::Add => do_add(frame, &*support, ds),
        Op::Sub => do_arithmetic(frame, &*support, ds, ArithOp::Sub),
        Op::Mul => do_arithmetic(frame, &*support, ds, ArithOp::Mul),
        Op::Div => do_arithmetic(frame, &*support, ds, ArithOp::Div),
        Op::Mod => do_arithmetic(frame, &*support, ds, ArithOp::Mod),
        Op::Exp => do_arithmetic(frame, &*support, ds, ArithOp::Exp),
        Op::Neg => {
            let v = frame.value_at(ds.stack_top);
            match support.to_numeric(&v).map_err(|e| fault(frame, &*support, e))? {
                Numeric::Double(d) => frame.set_number(ds.stack_top, -d),
                Numeric::Big(b) => {
                    frame.set_slot(ds.stack_top, Value::BigInt(Rc::new(-(*b).clone())))
                }
            }
            Ok(Flow::Next)
        }
        Op::Pos => {
            let d = stack_double(frame, &*support, ds.stack_top)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_number(ds.stack_top, d);
            Ok(Flow::Next)
        }
        Op::Not => {
            let b = stack_boolean(frame, &*support, ds.stack_top);
            frame.set_slot(ds.stack_top, Value::Bool(!b));
            Ok(Flow::Next)
        }
        Op::BitNot => {
            let i = stack_int32(frame, &*support, ds.stack_top)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_number(ds.stack_top, !i as f64);
            Ok(Flow::Next)
        }
        Op::BitAnd | Op::BitOr | Op::BitXor | Op::Lsh | Op::Rsh => {
            let r = stack_int32(frame, &*support, ds.stack_top)
                .map_err(|e| fault(frame, &*support, e))?;
            ds.stack_top -= 1;
            let l = stack_int32(frame, &*support, ds.stack_top)
                .map_err(|e| fault(frame, &*support, e))?;
            let v = match op {
                Op::BitAnd => l & r,
                Op::BitOr => l | r,
                Op::BitXor => l ^ r,
                Op::Lsh => l.wrapping_shl(r as u32 & 0x1f),
                _ => l.wrapping_shr(r as u32 & 0x1f),
            };
            frame.set_number(ds.stack_top, v as f64);
            Ok(Flow::Next)
        }
        Op::Ursh => {
            let r = stack_int32(frame, &*support, ds.stack_top)
                .map_err(|e| fault(frame, &*support, e))? as u32;
            ds.stack_top -= 1;
            let l = stack_double(frame, &*support, ds.stack_top)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_number(ds.stack_top, (to_uint32(l) >> (r & 0x1f)) as f64);
            Ok(Flow::Next)
        }

        // comparisons
        Op::Lt | Op::Le | Op::Gt | Op::Ge => do_compare(frame, &*support, ds, op),
        Op::Eq | Op::Ne => do_equals(frame, &*support, ds, op == Op::Ne),
        Op::StrictEq | Op::StrictNe => do_strict_equals(frame, ds, op == Op::StrictNe),
        Op::Typeof => {
            let v = frame.value_at(ds.stack_top);
            frame.set_slot(ds.stack_top, Value::str(support.type_of(&v)));
            Ok(Flow::Next)
        }
        Op::TypeofName => {
            let scope = frame.borrow().scope.clone();
            let t = support
                .type_of_name(&scope, &ds.string_reg)
                .map_err(|e| fault(frame, &*support, e))?;
            push(frame, ds, Value::str(t))
        }

        // names and properties
        Op::Name => {
            let scope = frame.borrow().scope.clone();
            let v = support
                .name(&scope, &ds.string_reg)
                .map_err(|e| fault(frame, &*support, e))?;
            push(frame, ds, v)
        }
        Op::BindName => {
            let scope = frame.borrow().scope.clone();
            let bound = support
                .bind(&scope, &ds.string_reg)
                .map_err(|e| fault(frame, &*support, e))?;
            push(frame, ds, bound)
        }
        Op::SetName => {
            let value = frame.value_at(ds.stack_top);
            ds.stack_top -= 1;
            let target = frame.value_at(ds.stack_top);
            let result = support
                .set_name(&target, &ds.string_reg, value)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(ds.stack_top, result);
            Ok(Flow::Next)
        }
        Op::GetProp => {
            let obj = frame.value_at(ds.stack_top);
            let v = support
                .get_prop(&obj, &ds.string_reg)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(ds.stack_top, v);
            Ok(Flow::Next)
        }
        Op::SetProp => {
            let value = frame.value_at(ds.stack_top);
            ds.stack_top -= 1;
            let obj = frame.value_at(ds.stack_top);
            let result = support
                .set_prop(&obj, &ds.string_reg, value)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(ds.stack_top, result);
            Ok(Flow::Next)
        }
        Op::GetElem => {
            let key = frame.value_at(ds.stack_top);
            ds.stack_top -= 1;
            let obj = frame.value_at(ds.stack_top);
            let v = support
                .get_elem(&obj, &key)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(ds.stack_top, v);
            Ok(Flow::Next)
        }
        Op::SetElem => {
            let value = frame.value_at(ds.stack_top);
            let key = frame.value_at(ds.stack_top - 1);
            ds.stack_top -= 2;
            let obj = frame.value_at(ds.stack_top);
            let result = support
                .set_elem(&obj, &key, value)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(ds.stack_top, result);
            Ok(Flow::Next)
        }
        Op::DelProp => {
            let key = frame.value_at(ds.stack_top);
            ds.stack_top -= 1;
            let obj = frame.value_at(ds.stack_top);
            let deleted = support
                .del_prop(&obj, &key)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(ds.stack_top, Value::Bool(deleted));
            Ok(Flow::Next)
        }

        // scopes
        Op::ScopeSave => {
            let local = frame.borrow().local_shift + ds.index_reg;
            let scope = frame.borrow().scope.clone();
            frame.set_slot(local, scope);
            Ok(Flow::Next)
        }
        Op::ScopeLoad => {
            let local = frame.borrow().local_shift + ds.index_reg;
            let scope = frame.slot(local);
            frame.borrow_mut().scope = scope;
            Ok(Flow::Next)
        }
        Op::CatchScope => {
            let after_first = unit.icode[opc] != 0;
            frame.borrow_mut().pc = opc + 1;
            let local = frame.borrow().local_shift + ds.index_reg;
            let thrown = frame.slot(ds.stack_top);
            ds.stack_top -= 1;
            let caught = match thrown {
                Value::Throwable(t) => t.catch_value(&*support),
                other => other,
            };
            // chained catch scopes nest inside the previous one
            let parent_scope = if after_first {
                frame.slot(local)
            } else {
                frame.borrow().scope.clone()
            };
            let scope = support
                .new_catch_scope(caught, &parent_scope, &ds.string_reg)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(local, scope);
            Ok(Flow::Next)
        }

        // control transfer
        Op::Goto => take_branch(interp, frame, unit, opc),
        Op::IfTrue => {
            let b = stack_boolean(frame, &*support, ds.stack_top);
            frame.set_slot(ds.stack_top, Value::Undefined);
            ds.stack_top -= 1;
            if b {
                take_branch(interp, frame, unit, opc)
            } else {
                frame.borrow_mut().pc = opc + 2;
                Ok(Flow::Next)
            }
        }
        Op::IfFalse => {
            let b = stack_boolean(frame, &*support, ds.stack_top);
            frame.set_slot(ds.stack_top, Value::Undefined);
            ds.stack_top -= 1;
            if !b {
                take_branch(interp, frame, unit, opc)
            } else {
                frame.borrow_mut().pc = opc + 2;
                Ok(Flow::Next)
            }
        }
        Op::IfFalsePop => {
            let b = stack_boolean(frame, &*support, ds.stack_top);
            frame.set_slot(ds.stack_top, Value::Undefined);
            ds.stack_top -= 1;
            if !b {
                // discard the value beneath the condition as well
                frame.set_slot(ds.stack_top, Value::Undefined);
                ds.stack_top -= 1;
                take_branch(interp, frame, unit, opc)
            } else {
                frame.borrow_mut().pc = opc + 2;
                Ok(Flow::Next)
            }
        }
        Op::Gosub => {
            // push the return address for the matching RetSub
            ds.stack_top += 1;
            frame.set_number(ds.stack_top, (opc + 2) as f64);
            take_branch(interp, frame, unit, opc)
        }
        Op::StartSub => {
            let local = frame.borrow().local_shift + ds.index_reg;
            let (v, d) = frame.pair(ds.stack_top);
            frame.set_pair(local, v, d);
            ds.stack_top -= 1;
            Ok(Flow::Next)
        }
        Op::RetSub => {
            if interp.counting() {
                add_instruction_count(interp, frame, 0)
                    .map_err(|e| fault(frame, &*support, e))?;
            }
            let local = frame.borrow().local_shift + ds.index_reg;
            let (v, d) = frame.pair(local);
            match v {
                // a fault parked by the cleanup entry: resume unwinding
                Value::Throwable(t) => Err((*t).clone()),
                Value::DoubleMark => {
                    let target = d as usize;
                    let mut f = frame.borrow_mut();
                    f.pc = target;
                    if interp.counting() {
                        f.pc_prev_branch = target;
                    }
                    Ok(Flow::Next)
                }
                _ => Err(Throwable::Fatal(VmError::internal(
                    "finally return slot holds neither address nor throwable",
                ))),
            }
        }
        Op::Line => {
            frame.borrow_mut().pc_source_line_start = Some(opc);
            if let Some(hook) = &interp.debug {
                hook.on_line_change(unit.get_index(opc) as u32);
            }
            frame.borrow_mut().pc = opc + 2;
            Ok(Flow::Next)
        }
        Op::Debugger => {
            if let Some(hook) = &interp.debug {
                hook.on_debugger_statement();
            }
            Ok(Flow::Next)
        }

        // literals
        Op::LiteralNewObject => {
            let keys = unit.keys(ds.index_reg).map_err(Throwable::Fatal)?;
            let stage = LiteralStage {
                values: Vec::with_capacity(keys.len()),
                keys: Some(keys),
            };
            push(
                frame,
                ds,
                Value::Stage(Rc::new(std::cell::RefCell::new(stage))),
            )
        }
        Op::LiteralNewArray => {
            let stage = LiteralStage {
                keys: None,
                values: Vec::with_capacity(ds.index_reg),
            };
            push(
                frame,
                ds,
                Value::Stage(Rc::new(std::cell::RefCell::new(stage))),
            )
        }
        Op::LiteralSet => {
            let value = frame.value_at(ds.stack_top);
            ds.stack_top -= 1;
            match frame.slot(ds.stack_top) {
                Value::Stage(stage) => {
                    stage.borrow_mut().values.push(value);
                    Ok(Flow::Next)
                }
                _ => Err(Throwable::Fatal(VmError::internal(
                    "literal element outside a literal",
                ))),
            }
        }
        Op::ObjectLit => match frame.slot(ds.stack_top) {
            Value::Stage(stage) => {
                let stage = stage.borrow();
                let keys = stage
                    .keys
                    .clone()
                    .ok_or_else(|| Throwable::Fatal(VmError::internal("array staged as object")))?;
                let obj = support.new_object();
                support
                    .fill_object_literal(&obj, &keys, stage.values.clone())
                    .map_err(|e| fault(frame, &*support, e))?;
                frame.set_slot(ds.stack_top, obj);
                Ok(Flow::Next)
            }
            _ => Err(Throwable::Fatal(VmError::internal(
                "object literal finished without a stage",
            ))),
        },
        Op::ArrayLit => match frame.slot(ds.stack_top) {
            Value::Stage(stage) => {
                let values = stage.borrow().values.clone();
                frame.set_slot(ds.stack_top, support.new_array(values));
                Ok(Flow::Next)
            }
            _ => Err(Throwable::Fatal(VmError::internal(
                "array literal finished without a stage",
            ))),
        },

        // closures and calls
        Op::Closure => {
            let nested = unit.nested_unit(ds.index_reg).map_err(Throwable::Fatal)?;
            let scope = frame.borrow().scope.clone();
            push(
                frame,
                ds,
                Value::Function(Rc::new(InterpFn {
                    unit: nested,
                    parent_scope: scope,
                    home_object: None,
                })),
            )
        }
        Op::Call => do_call(interp, frame, ds, false),
        Op::TailCall => do_call(interp, frame, ds, true),
        Op::New => do_new(interp, frame, ds),
        Op::Return => {
            let (v, d) = frame.pair(ds.stack_top);
            ds.stack_top -= 1;
            let mut f = frame.borrow_mut();
            f.result = v;
            f.result_dbl = d;
            Ok(Flow::Exit(Exit::Return))
        }
        Op::ReturnResult => Ok(Flow::Exit(Exit::Return)),
        Op::RetUndef => {
            let mut f = frame.borrow_mut();
            f.result = Value::Undefined;
            f.result_dbl = 0.0;
            Ok(Flow::Exit(Exit::Return))
        }

        // exceptions
        Op::Throw => {
            let value = frame.value_at(ds.stack_top);
            ds.stack_top -= 1;
            let line = unit.get_index(opc) as u32;
            Err(Throwable::Language {
                value,
                source: unit.source_file.clone(),
                line: Some(line),
            })
        }
        Op::RethrowLocal => {
            let local = frame.borrow().local_shift + ds.index_reg;
            match frame.slot(local) {
                Value::Throwable(t) => Err((*t).clone()),
                _ => Err(Throwable::Fatal(VmError::internal(
                    "rethrow slot does not hold a throwable",
                ))),
            }
        }

        // generators
        Op::GeneratorCreate => {
            if !frame.borrow().frozen {
                // return the new generator; the resume re-runs this opcode
                frame.borrow_mut().pc = pc;
                let gen_frame = crate::interpreter::generator::capture_frame_for_generator(frame);
                let mut f = frame.borrow_mut();
                f.result = Value::Generator(Rc::new(Generator::new(gen_frame)));
                f.result_dbl = 0.0;
                return Ok(Flow::Exit(Exit::Return));
            }
            thaw(frame, unit, ds, opc, gen_state, false)
        }
        Op::Yield => {
            if frame.borrow().frozen {
                return thaw(frame, unit, ds, opc, gen_state, true);
            }
            let gs = gen_state.ok_or_else(|| {
                Throwable::Fatal(VmError::internal("yield outside a generator invocation"))
            })?;
            if gs.operation == GeneratorOp::Close {
                return Err(fault(
                    frame,
                    &*support,
                    VmError::type_error("a closing generator cannot yield"),
                ));
            }
            let value = {
                let mut f = frame.borrow_mut();
                f.frozen = true;
                let (v, d) = f.pair(ds.stack_top);
                f.result = v.clone();
                f.result_dbl = d;
                f.saved_stack_top = ds.stack_top;
                // resume re-executes this opcode in the thawed state
                f.pc = pc;
                match v {
                    Value::DoubleMark => Value::Number(d),
                    other => other,
                }
            };
            if frame.borrow().use_activation {
                support.exit_activation();
            }
            Ok(Flow::Exit(Exit::Yield(value)))
        }
        Op::GeneratorEnd => {
            let gs = gen_state.ok_or_else(|| {
                Throwable::Fatal(VmError::internal("generator end outside a generator"))
            })?;
            frame.borrow_mut().frozen = true;
            gs.produced_return = Some(Value::Undefined);
            Ok(Flow::Exit(Exit::Return))
        }
        Op::GeneratorReturn => {
            let gs = gen_state.ok_or_else(|| {
                Throwable::Fatal(VmError::internal("generator return outside a generator"))
            })?;
            let value = frame.value_at(ds.stack_top);
            ds.stack_top -= 1;
            {
                let mut f = frame.borrow_mut();
                f.frozen = true;
                f.result = value.clone();
                f.result_dbl = 0.0;
            }
            gs.produced_return = Some(value);
            Ok(Flow::Exit(Exit::Return))
        }
    }
}

/// Resume a frozen generator frame at its suspension opcode.
fn thaw(
    frame: &FrameRef,
    unit: &Rc<CompiledUnit>,
    ds: &mut DispatchState,
    opc: usize,
    gen_state: Option<&mut GeneratorState>,
    is_yield: bool,
) -> Result<Flow, Throwable> {
    let gs = gen_state.ok_or_else(|| {
        Throwable::Fatal(VmError::internal("frozen frame resumed without generator state"))
    })?;
    let line = unit.get_index(opc) as u32;
    {
        let mut f = frame.borrow_mut();
        f.frozen = false;
        // skip the line-number operand
        f.pc = opc + 2;
    }
    match gs.operation {
        GeneratorOp::Throw => Err(Throwable::Language {
            value: gs.value.clone(),
            source: unit.source_file.clone(),
            line: Some(line),
        }),
        GeneratorOp::Close => Err(Throwable::GeneratorClose(gs.value.clone())),
        GeneratorOp::Send => {
            if is_yield {
                // the sent value becomes the result of the yield expression
                frame.set_pair(ds.stack_top, gs.value.clone(), 0.0);
            }
            Ok(Flow::Next)
        }
    }
}

fn do_get_var(frame: &FrameRef, ds: &mut DispatchState, i: usize) -> Result<Flow, Throwable> {
    let (v, d) = frame.pair(i);
    ds.stack_top += 1;
    frame.set_pair(ds.stack_top, v, d);
    Ok(Flow::Next)
}

fn do_set_var(frame: &FrameRef, ds: &mut DispatchState, i: usize) -> Result<Flow, Throwable> {
    let (v, d) = frame.pair(ds.stack_top);
    frame.set_pair(i, v, d);
    Ok(Flow::Next)
}

fn do_set_const_var(
    frame: &FrameRef,
    unit: &Rc<CompiledUnit>,
    ds: &mut DispatchState,
    i: usize,
) -> Result<Flow, Throwable> {
    if unit.const_vars.get(i).copied().unwrap_or(false) {
        if frame.attr(i) & ATTR_CONST_INIT != 0 {
            let source = unit.source_file.clone();
            let line = frame.borrow().current_line();
            return Err(Throwable::Language {
                value: Value::str("TypeError: assignment to constant variable"),
                source,
                line,
            });
        }
        frame.set_attr(i, ATTR_CONST_INIT);
    }
    do_set_var(frame, ds, i)
}

fn do_var_inc_dec(
    frame: &FrameRef,
    support: &dyn RuntimeSupport,
    ds: &mut DispatchState,
    flags: u8,
) -> Result<Flow, Throwable> {
    const DECREMENT: u8 = 0x1;
    const POSTFIX: u8 = 0x2;
    let i = ds.index_reg;
    let old = stack_double(frame, support, i).map_err(|e| fault(frame, support, e))?;
    let new = if flags & DECREMENT != 0 { old - 1.0 } else { old + 1.0 };
    frame.set_number(i, new);
    ds.stack_top += 1;
    frame.set_number(ds.stack_top, if flags & POSTFIX != 0 { old } else { new });
    Ok(Flow::Next)
}

fn do_add(
    frame: &FrameRef,
    support: &dyn RuntimeSupport,
    ds: &mut DispatchState,
) -> Result<Flow, Throwable> {
    ds.stack_top -= 1;
    let st = ds.stack_top;
    let (lv, ld) = frame.pair(st);
    let (rv, rd) = frame.pair(st + 1);
    match (&lv, &rv) {
        (Value::DoubleMark | Value::Number(_), Value::DoubleMark | Value::Number(_)) => {
            let l = if let Value::Number(n) = lv { n } else { ld };
            let r = if let Value::Number(n) = rv { n } else { rd };
            frame.set_number(st, l + r);
        }
        (Value::Str(l), Value::Str(r)) => {
            let mut s = String::with_capacity(l.len() + r.len());
            s.push_str(l);
            s.push_str(r);
            frame.set_slot(st, Value::str(s));
        }
        (Value::BigInt(l), Value::BigInt(r)) => {
            frame.set_slot(st, Value::BigInt(Rc::new(&**l + &**r)));
        }
        _ => {
            let l = resolve_pair(lv, ld);
            let r = resolve_pair(rv, rd);
            let v = support.add(&l, &r).map_err(|e| fault(frame, support, e))?;
            frame.set_slot(st, v);
        }
    }
    frame.set_slot(st + 1, Value::Undefined);
    Ok(Flow::Next)
}

fn do_arithmetic(
    frame: &FrameRef,
    support: &dyn RuntimeSupport,
    ds: &mut DispatchState,
    op: ArithOp,
) -> Result<Flow, Throwable> {
    ds.stack_top -= 1;
    let st = ds.stack_top;
    let (lv, ld) = frame.pair(st);
    let (rv, rd) = frame.pair(st + 1);
    if let (Value::DoubleMark | Value::Number(_), Value::DoubleMark | Value::Number(_)) =
        (&lv, &rv)
    {
        let l = if let Value::Number(n) = lv { n } else { ld };
        let r = if let Value::Number(n) = rv { n } else { rd };
        frame.set_number(st, double_arith(op, l, r));
        frame.set_slot(st + 1, Value::Undefined);
        return Ok(Flow::Next);
    }
    let l = support
        .to_numeric(&resolve_pair(lv, ld))
        .map_err(|e| fault(frame, support, e))?;
    let r = support
        .to_numeric(&resolve_pair(rv, rd))
        .map_err(|e| fault(frame, support, e))?;
    match (l, r) {
        (Numeric::Double(l), Numeric::Double(r)) => frame.set_number(st, double_arith(op, l, r)),
        (Numeric::Big(l), Numeric::Big(r)) => {
            let v = bigint_arith(op, &l, &r).map_err(|e| fault(frame, support, e))?;
            frame.set_slot(st, Value::BigInt(Rc::new(v)));
        }
        _ => {
            return Err(fault(
                frame,
                support,
                VmError::type_error("cannot mix bigint and number arithmetic"),
            ));
        }
    }
    frame.set_slot(st + 1, Value::Undefined);
    Ok(Flow::Next)
}

fn do_compare(
    frame: &FrameRef,
    support: &dyn RuntimeSupport,
    ds: &mut DispatchState,
    op: Op,
) -> Result<Flow, Throwable> {
    ds.stack_top -= 1;
    let st = ds.stack_top;
    let (lv, ld) = frame.pair(st);
    let (rv, rd) = frame.pair(st + 1);
    let result = match (&lv, &rv) {
        (Value::Str(l), Value::Str(r)) => apply_cmp(op, str_cmp(l, r)),
        _ => {
            let l = match &lv {
                Value::DoubleMark => ld,
                Value::Number(n) => *n,
                other => support.to_number(other).map_err(|e| fault(frame, support, e))?,
            };
            let r = match &rv {
                Value::DoubleMark => rd,
                Value::Number(n) => *n,
                other => support.to_number(other).map_err(|e| fault(frame, support, e))?,
            };
            match l.partial_cmp(&r) {
                Some(ord) => apply_cmp(op, ord),
                // NaN compares false every way
                None => false,
            }
        }
    };
    frame.set_slot(st, Value::Bool(result));
    frame.set_slot(st + 1, Value::Undefined);
    Ok(Flow::Next)
}

fn str_cmp(l: &str, r: &str) -> std::cmp::Ordering {
    l.cmp(r)
}

fn apply_cmp(op: Op, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        Op::Lt => ord == Less,
        Op::Le => ord != Greater,
        Op::Gt => ord == Greater,
        _ => ord != Less,
    }
}

fn do_equals(
    frame: &FrameRef,
    support: &dyn RuntimeSupport,
    ds: &mut DispatchState,
    negate: bool,
) -> Result<Flow, Throwable> {
    ds.stack_top -= 1;
    let st = ds.stack_top;
    let l = frame.value_at(st);
    let r = frame.value_at(st + 1);
    let eq = support.loose_eq(&l, &r).map_err(|e| fault(frame, support, e))?;
    frame.set_slot(st, Value::Bool(eq != negate));
    frame.set_slot(st + 1, Value::Undefined);
    Ok(Flow::Next)
}

fn do_strict_equals(
    frame: &FrameRef,
    ds: &mut DispatchState,
    negate: bool,
) -> Result<Flow, Throwable> {
    ds.stack_top -= 1;
    let st = ds.stack_top;
    let l = frame.value_at(st);
    let r = frame.value_at(st + 1);
    let eq = l == r;
    frame.set_slot(st, Value::Bool(eq != negate));
    frame.set_slot(st + 1, Value::Undefined);
    Ok(Flow::Next)
}

fn do_call(
    interp: &mut Interp,
    frame: &FrameRef,
    ds: &mut DispatchState,
    tail: bool,
) -> Result<Flow, Throwable> {
    if interp.counting() {
        interp.add_raw_instructions(INVOCATION_COST);
    }
    let argc = ds.index_reg;
    // stack: function thisObj arg0 .. argN -> result
    ds.stack_top -= 1 + argc;
    let st = ds.stack_top;
    let support = interp.support.clone();

    let mut fun = frame.slot(st);
    let mut this_obj = frame.value_at(st + 1);
    let mut bound_prefix: Vec<Value> = Vec::new();

    // peel bound functions so their targets stay in this dispatch loop and
    // continuations keep working across them
    while let Value::Bound(b) = fun {
        this_obj = b.bound_this.clone();
        let mut prefix = b.bound_args.clone();
        prefix.append(&mut bound_prefix);
        bound_prefix = prefix;
        fun = b.target.clone();
    }

    match fun {
        Value::Function(ifn) => {
            let same_domain = frame.borrow().unit.domain == ifn.unit.domain;
            if same_domain {
                let callee_scope = frame.borrow().scope.clone();
                let parent = if tail {
                    let p = frame.borrow().parent.clone();
                    exit_frame(interp, frame, None);
                    p
                } else {
                    Some(frame.clone())
                };
                let callee = {
                    let values_rc = frame.borrow().values.clone();
                    let vals = values_rc.borrow();
                    init_frame(
                        interp,
                        &callee_scope,
                        this_obj,
                        &bound_prefix,
                        &vals.slots[st + 2..st + 2 + argc],
                        Some(&vals.dbl[st + 2..st + 2 + argc]),
                        &ifn,
                        parent,
                    )
                    .map_err(|e| fault(frame, &*support, e))?
                };
                if !tail {
                    let mut f = frame.borrow_mut();
                    f.saved_stack_top = st;
                    f.saved_call_op = Some(CallOp::Value);
                }
                return Ok(Flow::Exit(Exit::Transfer(callee)));
            }
            // cross-domain call: route through a fresh host-level invocation
            let args = {
                let values_rc = frame.borrow().values.clone();
                let vals = values_rc.borrow();
                materialize(
                    &bound_prefix,
                    &vals.slots[st + 2..st + 2 + argc],
                    Some(&vals.dbl[st + 2..st + 2 + argc]),
                )
            };
            {
                let mut f = frame.borrow_mut();
                f.saved_stack_top = st;
                f.saved_call_op = Some(CallOp::Value);
            }
            interp.last_frame = Some(frame.clone());
            let result = interp
                .invoke_interpreted(ifn, this_obj, &args)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(st, result);
            Ok(Flow::Next)
        }
        Value::Continuation(c) => {
            let mut jump = ContinuationJump::new(&c, Some(frame.clone()))
                .map_err(Throwable::Fatal)?;
            if argc > 0 {
                let (v, d) = frame.pair(st + 2);
                jump.result = v;
                jump.result_dbl = d;
            }
            Err(Throwable::Jump(jump))
        }
        Value::Native(native) => {
            let args = {
                let values_rc = frame.borrow().values.clone();
                let vals = values_rc.borrow();
                materialize(
                    &bound_prefix,
                    &vals.slots[st + 2..st + 2 + argc],
                    Some(&vals.dbl[st + 2..st + 2 + argc]),
                )
            };
            {
                let mut f = frame.borrow_mut();
                f.saved_stack_top = st;
                f.saved_call_op = Some(CallOp::Value);
            }
            interp.last_frame = Some(frame.clone());
            let result = native
                .call(interp, &this_obj, &args)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(st, result);
            Ok(Flow::Next)
        }
        other => Err(fault(
            frame,
            &*support,
            VmError::type_error(format!("{} is not a function", other.type_name())),
        )),
    }
}

fn do_new(interp: &mut Interp, frame: &FrameRef, ds: &mut DispatchState) -> Result<Flow, Throwable> {
    if interp.counting() {
        interp.add_raw_instructions(INVOCATION_COST);
    }
    let argc = ds.index_reg;
    // stack: function arg0 .. argN -> newResult
    ds.stack_top -= argc;
    let st = ds.stack_top;
    let support = interp.support.clone();

    match frame.slot(st) {
        Value::Function(ifn) => {
            let same_domain = frame.borrow().unit.domain == ifn.unit.domain;
            if !same_domain {
                return Err(fault(
                    frame,
                    &*support,
                    VmError::type_error("cannot construct across execution domains"),
                ));
            }
            let instance = support
                .new_instance(&ifn)
                .map_err(|e| fault(frame, &*support, e))?;
            let callee_scope = frame.borrow().scope.clone();
            let callee = {
                let values_rc = frame.borrow().values.clone();
                let vals = values_rc.borrow();
                init_frame(
                    interp,
                    &callee_scope,
                    instance.clone(),
                    &[],
                    &vals.slots[st + 1..st + 1 + argc],
                    Some(&vals.dbl[st + 1..st + 1 + argc]),
                    &ifn,
                    Some(frame.clone()),
                )
                .map_err(|e| fault(frame, &*support, e))?
            };
            frame.set_slot(st, instance);
            {
                let mut f = frame.borrow_mut();
                f.saved_stack_top = st;
                f.saved_call_op = Some(CallOp::Construct);
            }
            Ok(Flow::Exit(Exit::Transfer(callee)))
        }
        Value::Native(native) => {
            let args = {
                let values_rc = frame.borrow().values.clone();
                let vals = values_rc.borrow();
                materialize(&[], &vals.slots[st + 1..st + 1 + argc], Some(&vals.dbl[st + 1..st + 1 + argc]))
            };
            {
                let mut f = frame.borrow_mut();
                f.saved_stack_top = st;
                f.saved_call_op = Some(CallOp::Construct);
            }
            interp.last_frame = Some(frame.clone());
            let result = native
                .call(interp, &Value::Undefined, &args)
                .map_err(|e| fault(frame, &*support, e))?;
            frame.set_slot(st, result);
            Ok(Flow::Next)
        }
        other => Err(fault(
            frame,
            &*support,
            VmError::type_error(format!("{} is not a constructor", other.type_name())),
        )),
    }
}

fn take_branch(
    interp: &mut Interp,
    frame: &FrameRef,
    unit: &Rc<CompiledUnit>,
    opc: usize,
) -> Result<Flow, Throwable> {
    if interp.counting() {
        let support = interp.support.clone();
        add_instruction_count(interp, frame, 2).map_err(|e| fault(frame, &*support, e))?;
    }
    let offset = unit.get_short(opc);
    let target = if offset != 0 {
        // offset is relative to the branch opcode itself
        (opc as i64 - 1 + offset as i64) as usize
    } else {
        *unit.long_jumps.get(&opc).ok_or_else(|| {
            Throwable::Fatal(VmError::internal(format!("missing long jump at pc {opc}")))
        })?
    };
    let mut f = frame.borrow_mut();
    f.pc = target;
    if interp.counting() {
        f.pc_prev_branch = target;
    }
    Ok(Flow::Next)
}

pub(crate) fn add_instruction_count(
    interp: &mut Interp,
    frame: &FrameRef,
    extra: u64,
) -> Result<(), VmError> {
    let delta = {
        let f = frame.borrow();
        f.pc.saturating_sub(f.pc_prev_branch) as u64
    };
    interp.note_instructions(delta + extra)
}

fn push(frame: &FrameRef, ds: &mut DispatchState, v: Value) -> Result<Flow, Throwable> {
    ds.stack_top += 1;
    frame.set_slot(ds.stack_top, v);
    Ok(Flow::Next)
}

fn push_number(frame: &FrameRef, ds: &mut DispatchState, n: f64) -> Result<Flow, Throwable> {
    ds.stack_top += 1;
    frame.set_number(ds.stack_top, n);
    Ok(Flow::Next)
}

fn resolve_pair(v: Value, d: f64) -> Value {
    match v {
        Value::DoubleMark => Value::Number(d),
        other => other,
    }
}

fn stack_double(frame: &FrameRef, support: &dyn RuntimeSupport, i: usize) -> Result<f64, VmError> {
    let (v, d) = frame.pair(i);
    match v {
        Value::DoubleMark => Ok(d),
        other => support.to_number(&other),
    }
}

fn stack_int32(frame: &FrameRef, support: &dyn RuntimeSupport, i: usize) -> Result<i32, VmError> {
    Ok(to_int32(stack_double(frame, support, i)?))
}

fn stack_boolean(frame: &FrameRef, support: &dyn RuntimeSupport, i: usize) -> bool {
    let (v, d) = frame.pair(i);
    match v {
        Value::DoubleMark => d != 0.0 && !d.is_nan(),
        Value::Bool(b) => b,
        other => support.to_boolean(&other),
    }
}

/// Wrap a support or native error as the right fault kind, stamped with the
/// current source position.
pub(crate) fn fault(frame: &FrameRef, support: &dyn RuntimeSupport, e: VmError) -> Throwable {
    let (source, line) = {
        let f = frame.borrow();
        (f.unit.source_file.clone(), f.current_line())
    };
    Throwable::from_vm_error(e, source, line, support)
}
