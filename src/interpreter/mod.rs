//! The interpreter: public entry points and call linkage
//!
//! [`Interp`] owns everything one interpretation context needs: the
//! runtime-support seam, the optional debug hook, instruction accounting
//! and the frame bookkeeping that generators and continuations rely on.
//! One `Interp` is single-threaded; frames and values are `Rc`-based and
//! never cross threads.

pub(crate) mod continuation;
pub(crate) mod dispatch;
pub(crate) mod frame;
pub(crate) mod generator;

use std::cell::RefCell;
use std::rc::Rc;

use crate::code::{CompiledUnit, DomainToken};
use crate::debug::DebugHook;
use crate::error::{ScriptStackElement, VmError};
use crate::support::{BasicHost, RuntimeSupport};
use crate::value::{InterpFn, Value};

use continuation::ContinuationJump;
use dispatch::{interpret_loop, Entry, LoopResult, Throwable};
use frame::{materialize, CallOp, Frame, FrameRef};
use generator::{GeneratorOp, GeneratorResult, GeneratorState};

/// How faults raised by runtime support and native functions interact
/// with script catch handlers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum HostFaultPolicy {
    /// Host faults are catchable like thrown script values.
    Catchable,
    /// Host faults run cleanup blocks but bypass catch handlers.
    #[default]
    FinallyOnly,
}

type InstructionObserver = Box<dyn FnMut(u64) -> Result<(), VmError>>;

const DEFAULT_MAX_FRAME_DEPTH: usize = 1000;

pub struct Interp {
    pub(crate) support: Rc<dyn RuntimeSupport>,
    pub(crate) debug: Option<Rc<dyn DebugHook>>,
    pub(crate) host_fault_policy: HostFaultPolicy,
    /// Innermost interpreted frame of the current invocation, consulted by
    /// natives that capture continuations.
    pub(crate) last_frame: Option<FrameRef>,
    /// Saved `last_frame` values of enclosing invocations.
    pub(crate) previous_invocations: Vec<FrameRef>,
    instruction_count: u64,
    instruction_threshold: u64,
    observer: Option<InstructionObserver>,
    max_frame_depth: usize,
    current_domain: DomainToken,
    global: Value,
}

impl Default for Interp {
    fn default() -> Self {
        Interp::new()
    }
}

impl Interp {
    pub fn new() -> Interp {
        Interp::with_support(Rc::new(BasicHost::new()))
    }

    pub fn with_support(support: Rc<dyn RuntimeSupport>) -> Interp {
        let global = support.new_scope();
        Interp {
            support,
            debug: None,
            host_fault_policy: HostFaultPolicy::default(),
            last_frame: None,
            previous_invocations: Vec::new(),
            instruction_count: 0,
            instruction_threshold: 0,
            observer: None,
            max_frame_depth: DEFAULT_MAX_FRAME_DEPTH,
            current_domain: DomainToken::default(),
            global,
        }
    }

    pub fn support(&self) -> &Rc<dyn RuntimeSupport> {
        &self.support
    }

    pub fn global_scope(&self) -> Value {
        self.global.clone()
    }

    pub fn define_global(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        let global = self.global.clone();
        self.support.set_prop(&global, name, value)?;
        Ok(())
    }

    pub fn set_debug_hook(&mut self, hook: Option<Rc<dyn DebugHook>>) {
        self.debug = hook;
    }

    pub fn set_host_fault_policy(&mut self, policy: HostFaultPolicy) {
        self.host_fault_policy = policy;
    }

    pub fn set_max_frame_depth(&mut self, depth: usize) {
        self.max_frame_depth = depth;
    }

    /// Install an instruction observer. It runs every time roughly
    /// `threshold` instructions have been executed since the last run, and
    /// may abort execution by returning an error.
    pub fn set_instruction_observer(
        &mut self,
        threshold: u64,
        observer: impl FnMut(u64) -> Result<(), VmError> + 'static,
    ) {
        self.instruction_threshold = threshold;
        self.instruction_count = 0;
        self.observer = Some(Box::new(observer));
    }

    pub fn clear_instruction_observer(&mut self) {
        self.observer = None;
        self.instruction_count = 0;
    }

    /// Execute a script unit against the global scope.
    pub fn exec(&mut self, unit: &Rc<CompiledUnit>) -> Result<Value, VmError> {
        self.exec_unit(unit, false)
    }

    /// Execute a script unit in an invocation that allows continuation
    /// capture. Cannot be nested inside another interpreted invocation.
    pub fn exec_with_continuations(&mut self, unit: &Rc<CompiledUnit>) -> Result<Value, VmError> {
        self.require_no_active_frames()?;
        self.exec_unit(unit, true)
    }

    fn exec_unit(&mut self, unit: &Rc<CompiledUnit>, continuations_top: bool) -> Result<Value, VmError> {
        if !unit.is_script {
            return Err(VmError::usage(
                "exec requires a script unit; use call_function for functions",
            ));
        }
        let ifn = Rc::new(InterpFn {
            unit: unit.clone(),
            parent_scope: self.global.clone(),
            home_object: None,
        });
        let this = self.global.clone();
        self.run_root(ifn, this, &[], continuations_top)
    }

    /// Call a callable value with the given receiver and arguments.
    pub fn call_function(
        &mut self,
        fun: &Value,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        self.call_value(fun, this, args, false)
    }

    /// Like [`call_function`](Interp::call_function), in an invocation that
    /// allows continuation capture. Cannot be nested inside another
    /// interpreted invocation.
    pub fn call_with_continuations(
        &mut self,
        fun: &Value,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        self.require_no_active_frames()?;
        self.call_value(fun, this, args, true)
    }

    fn call_value(
        &mut self,
        fun: &Value,
        this: &Value,
        args: &[Value],
        continuations_top: bool,
    ) -> Result<Value, VmError> {
        match fun {
            Value::Function(ifn) => {
                let saved = self.current_domain;
                self.current_domain = ifn.unit.domain;
                let result = self.run_root(ifn.clone(), this.clone(), args, continuations_top);
                self.current_domain = saved;
                result
            }
            Value::Bound(b) => {
                let mut full = b.bound_args.clone();
                full.extend_from_slice(args);
                self.call_value(&b.target, &b.bound_this, &full, continuations_top)
            }
            Value::Native(native) if !continuations_top => native.call(self, this, args),
            Value::Native(_) => Err(VmError::usage(
                "continuation capture requires an interpreted function",
            )),
            other => Err(VmError::type_error(format!(
                "{} is not a function",
                other.type_name()
            ))),
        }
    }

    /// Dispatch-loop entry for calls that cross an execution-domain
    /// boundary; runs the callee as its own invocation under its domain.
    pub(crate) fn invoke_interpreted(
        &mut self,
        ifn: Rc<InterpFn>,
        this: Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let saved = self.current_domain;
        self.current_domain = ifn.unit.domain;
        let result = self.run_root(ifn, this, args, false);
        self.current_domain = saved;
        result
    }

    fn run_root(
        &mut self,
        ifn: Rc<InterpFn>,
        this: Value,
        args: &[Value],
        continuations_top: bool,
    ) -> Result<Value, VmError> {
        let scope = ifn.parent_scope.clone();
        let frame = init_frame(self, &scope, this, &[], args, None, &ifn, None)?;
        {
            let mut f = frame.borrow_mut();
            f.is_continuations_top = continuations_top;
            f.prev_interpreter_frame = self.last_frame.clone();
        }
        match interpret_loop(self, Entry::Frame(frame), None)? {
            LoopResult::Complete(value) => Ok(value),
            _ => Err(VmError::internal(
                "generator control escaped a plain invocation",
            )),
        }
    }

    /// Drive a suspended generator one step: deliver a value, inject an
    /// exception, or close it.
    pub fn resume_generator(
        &mut self,
        generator: &Value,
        operation: GeneratorOp,
        value: Value,
    ) -> Result<GeneratorResult, VmError> {
        let Value::Generator(generator) = generator else {
            return Err(VmError::type_error(format!(
                "{} is not a generator",
                generator.type_name()
            )));
        };
        if generator.is_done() {
            return match operation {
                // closing an exhausted generator is a no-op
                GeneratorOp::Close => Ok(GeneratorResult::Closed(Value::Undefined)),
                _ => Err(VmError::type_error("generator has already finished")),
            };
        }
        let parked = generator.take_frame()?;
        // the parked snapshot stays immutable; execution runs on a shallow
        // clone re-attached to this resume's invocation boundary
        let frame = {
            let f = parked.borrow();
            Rc::new(RefCell::new(f.shallow_clone_frozen(self.last_frame.clone())))
        };
        let mut state = GeneratorState {
            operation,
            value,
            produced_return: None,
        };
        match interpret_loop(self, Entry::Frame(frame), Some(&mut state)) {
            Ok(LoopResult::Yielded(value, frame)) => {
                generator.park(frame);
                Ok(GeneratorResult::Yielded(value))
            }
            Ok(LoopResult::Complete(value)) => {
                generator.finish();
                match state.produced_return {
                    Some(returned) => Ok(GeneratorResult::Returned(returned)),
                    None => Ok(GeneratorResult::Returned(value)),
                }
            }
            Ok(LoopResult::Closed(value)) => {
                generator.finish();
                Ok(GeneratorResult::Closed(value))
            }
            Err(e) => {
                generator.finish();
                Err(e)
            }
        }
    }

    /// Freeze the live frame chain and return it as a continuation value.
    /// Only valid while a native called under a continuations-enabled
    /// invocation is running.
    pub fn capture_continuation(&mut self) -> Result<Value, VmError> {
        Ok(Value::Continuation(Rc::new(continuation::capture(self)?)))
    }

    /// Restart a captured continuation as a fresh invocation, delivering
    /// `value` as the result of the capture point's pending call.
    pub fn resume_continuation(
        &mut self,
        continuation: &Value,
        value: Value,
    ) -> Result<Value, VmError> {
        let Value::Continuation(c) = continuation else {
            return Err(VmError::type_error(format!(
                "{} is not a continuation",
                continuation.type_name()
            )));
        };
        self.require_no_active_frames()?;
        if c.frame.is_none() {
            return Ok(value);
        }
        let jump = ContinuationJump {
            captured: c.frame.clone(),
            branch: None,
            result: value,
            result_dbl: 0.0,
        };
        match interpret_loop(self, Entry::Restart(jump), None)? {
            LoopResult::Complete(value) => Ok(value),
            _ => Err(VmError::internal(
                "generator control escaped a continuation restart",
            )),
        }
    }

    fn require_no_active_frames(&self) -> Result<(), VmError> {
        if self.last_frame.is_some() || !self.previous_invocations.is_empty() {
            return Err(VmError::usage(
                "continuation entry points cannot be nested inside a running invocation",
            ));
        }
        Ok(())
    }

    pub(crate) fn counting(&self) -> bool {
        self.observer.is_some()
    }

    pub(crate) fn note_instructions(&mut self, n: u64) -> Result<(), VmError> {
        self.instruction_count += n;
        if self.instruction_count > self.instruction_threshold {
            let count = self.instruction_count;
            self.instruction_count = 0;
            if let Some(observer) = self.observer.as_mut() {
                observer(count)?;
            }
        }
        Ok(())
    }

    /// Flat cost accounting for calls and throws; checked against the
    /// threshold at the next branch.
    pub(crate) fn add_raw_instructions(&mut self, n: u64) {
        self.instruction_count += n;
    }
}

/// Build and enter a callee frame for an interpreted call.
#[allow(clippy::too_many_arguments)]
pub(crate) fn init_frame(
    interp: &mut Interp,
    callee_scope: &Value,
    this: Value,
    bound_prefix: &[Value],
    args: &[Value],
    args_dbl: Option<&[f64]>,
    ifn: &Rc<InterpFn>,
    parent: Option<FrameRef>,
) -> Result<FrameRef, VmError> {
    let debugged = interp.debug.is_some();
    let mut frame = Frame::new(ifn.clone(), this, parent, interp.max_frame_depth, debugged)?;
    frame.initialize_args(&*interp.support, callee_scope, bound_prefix, args, args_dbl)?;
    let frame = Rc::new(RefCell::new(frame));
    if debugged {
        let hook_args = materialize(bound_prefix, args, args_dbl);
        enter_frame(interp, &frame, &hook_args, false);
    } else {
        enter_frame(interp, &frame, &[], false);
    }
    Ok(frame)
}

pub(crate) fn enter_frame(interp: &Interp, frame: &FrameRef, args: &[Value], resumed: bool) {
    let f = frame.borrow();
    if f.use_activation {
        interp.support.enter_activation(&f.scope);
    }
    if let Some(hook) = &interp.debug {
        hook.on_enter(&f.unit, &f.this_obj, args, resumed);
    }
}

pub(crate) fn exit_frame(interp: &Interp, frame: &FrameRef, throwable: Option<&Throwable>) {
    let f = frame.borrow();
    if f.use_activation {
        interp.support.exit_activation();
    }
    if let Some(hook) = &interp.debug {
        hook.on_exit(&f.unit, throwable.is_some());
    }
}

/// Deliver a callee result into the caller's pending call site.
pub(crate) fn set_call_result(
    frame: &FrameRef,
    result: Value,
    result_dbl: f64,
) -> Result<(), VmError> {
    let mut f = frame.borrow_mut();
    let op = f
        .saved_call_op
        .take()
        .ok_or_else(|| VmError::internal("return into a frame with no pending call"))?;
    let top = f.saved_stack_top;
    match op {
        CallOp::Value => f.set_pair(top, result, result_dbl),
        CallOp::Construct => {
            // a constructor result only replaces the instance when it is
            // itself an object
            if matches!(
                result,
                Value::Object(_)
                    | Value::Function(_)
                    | Value::Bound(_)
                    | Value::Native(_)
                    | Value::Generator(_)
                    | Value::Continuation(_)
            ) {
                f.set_slot(top, result);
            }
        }
    }
    Ok(())
}

/// Script-level stack trace rooted at `frame`, following frame parents and
/// hopping across invocation boundaries.
pub(crate) fn capture_stack(frame: &FrameRef) -> Vec<ScriptStackElement> {
    let mut out = Vec::new();
    let mut walk = Some(frame.clone());
    while let Some(frame) = walk {
        let f = frame.borrow();
        out.push(ScriptStackElement {
            source: f.unit.source_file.clone(),
            function: if f.unit.is_script {
                None
            } else {
                Some(f.unit.name.clone())
            },
            line: f.current_line(),
        });
        walk = f.parent.clone().or_else(|| f.prev_interpreter_frame.clone());
    }
    out
}
