//! Activation frames and their dual-representation value arrays
//!
//! A frame owns one flat array split into three zones: variables (params
//! followed by declared vars), scratch locals used by the exception and
//! finally machinery, then the operand stack. Each slot has a parallel
//! unboxed double; a slot holding [`Value::DoubleMark`] means the live
//! number is in the double array. Frames link upward to their caller, so a
//! chain doubles as a snapshot for generators and continuations once
//! frozen.

use std::cell::RefCell;
use std::rc::Rc;

use crate::code::CompiledUnit;
use crate::error::VmError;
use crate::support::RuntimeSupport;
use crate::value::{InterpFn, Value};

pub(crate) type FrameRef = Rc<RefCell<Frame>>;

/// Slot attribute: a const variable that has received its one assignment.
pub(crate) const ATTR_CONST_INIT: u8 = 1;

/// Pending call shape recorded in a caller while its callee runs. Controls
/// how the callee's result is spliced back into the caller's stack.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CallOp {
    Value,
    Construct,
}

/// The zoned slot storage of one frame.
///
/// Kept behind its own `Rc` so a generator's shallow frozen clone shares
/// the arrays while a continuation's deep clone copies them.
#[derive(Clone)]
pub(crate) struct ValueArray {
    pub slots: Vec<Value>,
    pub dbl: Vec<f64>,
    pub attrs: Vec<u8>,
}

impl ValueArray {
    fn new(len: usize) -> Self {
        ValueArray {
            slots: vec![Value::Undefined; len],
            dbl: vec![0.0; len],
            attrs: vec![0; len],
        }
    }
}

pub(crate) struct Frame {
    /// Caller frame, `None` at an invocation boundary.
    pub parent: Option<FrameRef>,
    /// Innermost frame of the host-level invocation below this one, used to
    /// stitch stack traces across resumption boundaries.
    pub prev_interpreter_frame: Option<FrameRef>,
    /// Depth of this frame within its chain.
    pub frame_index: usize,
    /// A frozen frame is an immutable snapshot; execution resumes on a
    /// clone, never in place.
    pub frozen: bool,
    pub func: Rc<InterpFn>,
    pub unit: Rc<CompiledUnit>,
    pub values: Rc<RefCell<ValueArray>>,
    /// First slot of the locals zone (== vars length).
    pub local_shift: usize,
    /// Stack-empty sentinel: the operand stack occupies slots above this.
    pub empty_stack_top: usize,
    pub use_activation: bool,
    pub debugged: bool,
    /// Set on the outermost frame of invocations that allow continuation
    /// capture.
    pub is_continuations_top: bool,
    pub this_obj: Value,
    pub result: Value,
    pub result_dbl: f64,
    pub pc: usize,
    /// pc after the last taken branch, for instruction accounting.
    pub pc_prev_branch: usize,
    /// Operand pc of the last `Line` instruction executed.
    pub pc_source_line_start: Option<usize>,
    pub scope: Value,
    /// Stack top preserved across calls, handler entry and freezing.
    pub saved_stack_top: usize,
    pub saved_call_op: Option<CallOp>,
}

impl Frame {
    pub fn new(
        func: Rc<InterpFn>,
        this_obj: Value,
        parent: Option<FrameRef>,
        max_depth: usize,
        debugged: bool,
    ) -> Result<Frame, VmError> {
        let frame_index = match &parent {
            Some(p) => p.borrow().frame_index + 1,
            None => 0,
        };
        if frame_index > max_depth {
            return Err(VmError::StackDepthExceeded { depth: max_depth });
        }
        let unit = func.unit.clone();
        let local_shift = unit.param_and_var_count;
        // the slot at empty_stack_top itself is a dead sentinel between the
        // locals zone and the stack zone, so the index never underflows
        let empty_stack_top = local_shift + unit.max_locals;
        let values = ValueArray::new(unit.max_frame_array);
        let use_activation = debugged || unit.needs_activation;
        Ok(Frame {
            parent,
            prev_interpreter_frame: None,
            frame_index,
            frozen: false,
            func,
            unit,
            values: Rc::new(RefCell::new(values)),
            local_shift,
            empty_stack_top,
            use_activation,
            debugged,
            is_continuations_top: false,
            this_obj,
            result: Value::Undefined,
            result_dbl: 0.0,
            pc: 0,
            pc_prev_branch: 0,
            pc_source_line_start: None,
            scope: Value::Undefined,
            saved_stack_top: empty_stack_top,
            saved_call_op: None,
        })
    }

    /// Populate the vars zone and establish the frame scope. `bound_prefix`
    /// holds arguments peeled off bound functions, logically preceding the
    /// caller-supplied window. A rest parameter claims the last parameter
    /// slot and receives the surplus arguments as an array.
    pub fn initialize_args(
        &mut self,
        support: &dyn RuntimeSupport,
        caller_scope: &Value,
        bound_prefix: &[Value],
        args: &[Value],
        args_dbl: Option<&[f64]>,
    ) -> Result<(), VmError> {
        let param_count = self.unit.param_count;
        let has_rest = self.unit.args_has_rest && param_count > 0;
        let positional = if has_rest { param_count - 1 } else { param_count };
        let mut vals = self.values.borrow_mut();
        let mut slot = 0;
        for v in bound_prefix {
            if slot >= positional {
                break;
            }
            vals.slots[slot] = v.clone();
            slot += 1;
        }
        for (i, v) in args.iter().enumerate() {
            if slot >= positional {
                break;
            }
            vals.slots[slot] = v.clone();
            if let (Value::DoubleMark, Some(dbl)) = (v, args_dbl) {
                vals.dbl[slot] = dbl[i];
            }
            slot += 1;
        }
        drop(vals);
        if has_rest {
            let all = materialize(bound_prefix, args, args_dbl);
            let surplus = all.get(positional..).map(<[Value]>::to_vec).unwrap_or_default();
            self.set_slot(positional, support.new_array(surplus));
        }

        if self.unit.is_script {
            self.scope = caller_scope.clone();
        } else {
            self.scope = self.func.parent_scope.clone();
            if self.use_activation {
                let materialized = materialize(bound_prefix, args, args_dbl);
                self.scope = support.create_activation(
                    &self.func,
                    &materialized,
                    &self.scope,
                    self.func.home_object.as_ref(),
                )?;
            }
        }
        Ok(())
    }

    pub fn slot(&self, i: usize) -> Value {
        self.values.borrow().slots[i].clone()
    }

    pub fn set_slot(&self, i: usize, v: Value) {
        self.values.borrow_mut().slots[i] = v;
    }

    /// Store an unboxed number: mark the slot and park the payload.
    pub fn set_number(&self, i: usize, d: f64) {
        let mut vals = self.values.borrow_mut();
        vals.slots[i] = Value::DoubleMark;
        vals.dbl[i] = d;
    }

    /// Raw slot plus its double payload, for mark-preserving moves.
    pub fn pair(&self, i: usize) -> (Value, f64) {
        let vals = self.values.borrow();
        (vals.slots[i].clone(), vals.dbl[i])
    }

    pub fn set_pair(&self, i: usize, v: Value, d: f64) {
        let mut vals = self.values.borrow_mut();
        vals.slots[i] = v;
        vals.dbl[i] = d;
    }

    /// Slot content with the double mark resolved to a boxed number.
    pub fn value_at(&self, i: usize) -> Value {
        let vals = self.values.borrow();
        match &vals.slots[i] {
            Value::DoubleMark => Value::Number(vals.dbl[i]),
            other => other.clone(),
        }
    }

    pub fn attr(&self, i: usize) -> u8 {
        self.values.borrow().attrs[i]
    }

    pub fn set_attr(&self, i: usize, a: u8) {
        self.values.borrow_mut().attrs[i] = a;
    }

    /// Deep copy for resuming a frozen snapshot: fresh value arrays, not
    /// frozen, everything else carried over.
    pub fn clone_frozen(&self) -> Frame {
        debug_assert!(self.frozen);
        Frame {
            parent: self.parent.clone(),
            prev_interpreter_frame: self.prev_interpreter_frame.clone(),
            frame_index: self.frame_index,
            frozen: false,
            func: self.func.clone(),
            unit: self.unit.clone(),
            values: Rc::new(RefCell::new(self.values.borrow().clone())),
            local_shift: self.local_shift,
            empty_stack_top: self.empty_stack_top,
            use_activation: self.use_activation,
            debugged: self.debugged,
            is_continuations_top: self.is_continuations_top,
            this_obj: self.this_obj.clone(),
            result: self.result.clone(),
            result_dbl: self.result_dbl,
            pc: self.pc,
            pc_prev_branch: self.pc_prev_branch,
            pc_source_line_start: self.pc_source_line_start,
            scope: self.scope.clone(),
            saved_stack_top: self.saved_stack_top,
            saved_call_op: self.saved_call_op,
        }
    }

    /// Shallow copy for re-attaching a generator frame to a new invocation
    /// boundary: the value arrays stay shared, the snapshot stays frozen.
    pub fn shallow_clone_frozen(&self, prev_interpreter_frame: Option<FrameRef>) -> Frame {
        debug_assert!(self.frozen);
        Frame {
            parent: None,
            prev_interpreter_frame,
            frame_index: 0,
            frozen: true,
            func: self.func.clone(),
            unit: self.unit.clone(),
            values: self.values.clone(),
            local_shift: self.local_shift,
            empty_stack_top: self.empty_stack_top,
            use_activation: self.use_activation,
            debugged: self.debugged,
            is_continuations_top: self.is_continuations_top,
            this_obj: self.this_obj.clone(),
            result: self.result.clone(),
            result_dbl: self.result_dbl,
            pc: self.pc,
            pc_prev_branch: self.pc_prev_branch,
            pc_source_line_start: self.pc_source_line_start,
            scope: self.scope.clone(),
            saved_stack_top: self.saved_stack_top,
            saved_call_op: self.saved_call_op,
        }
    }

    /// Source line currently executing, from the last `Line` instruction.
    pub fn current_line(&self) -> Option<u32> {
        match self.pc_source_line_start {
            Some(p) => Some(self.unit.get_index(p) as u32),
            None => self.unit.first_line,
        }
    }
}

/// Resolve a caller stack window into plain values for host consumption.
pub(crate) fn materialize(
    bound_prefix: &[Value],
    args: &[Value],
    args_dbl: Option<&[f64]>,
) -> Vec<Value> {
    let mut out = Vec::with_capacity(bound_prefix.len() + args.len());
    out.extend_from_slice(bound_prefix);
    for (i, v) in args.iter().enumerate() {
        match (v, args_dbl) {
            (Value::DoubleMark, Some(dbl)) => out.push(Value::Number(dbl[i])),
            _ => out.push(v.clone()),
        }
    }
    out
}

/// Slot access forwarded through the shared handle. Each call takes a short
/// borrow of the frame header, so callers must not hold one across these.
pub(crate) trait FrameHandle {
    fn slot(&self, i: usize) -> Value;
    fn set_slot(&self, i: usize, v: Value);
    fn pair(&self, i: usize) -> (Value, f64);
    fn set_pair(&self, i: usize, v: Value, d: f64);
    fn set_number(&self, i: usize, d: f64);
    fn value_at(&self, i: usize) -> Value;
    fn attr(&self, i: usize) -> u8;
    fn set_attr(&self, i: usize, a: u8);
}

impl FrameHandle for FrameRef {
    fn slot(&self, i: usize) -> Value {
        self.borrow().slot(i)
    }

    fn set_slot(&self, i: usize, v: Value) {
        self.borrow().set_slot(i, v);
    }

    fn pair(&self, i: usize) -> (Value, f64) {
        self.borrow().pair(i)
    }

    fn set_pair(&self, i: usize, v: Value, d: f64) {
        self.borrow().set_pair(i, v, d);
    }

    fn set_number(&self, i: usize, d: f64) {
        self.borrow().set_number(i, d);
    }

    fn value_at(&self, i: usize) -> Value {
        self.borrow().value_at(i)
    }

    fn attr(&self, i: usize) -> u8 {
        self.borrow().attr(i)
    }

    fn set_attr(&self, i: usize, a: u8) {
        self.borrow().set_attr(i, a);
    }
}
