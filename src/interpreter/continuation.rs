//! First-class continuations: captured frame chains and their restarts
//!
//! Capturing freezes the live frame chain in place; execution continues on
//! the frozen frames and any later write clones them first. Invoking a
//! captured continuation raises a [`ContinuationJump`] that unwinds to the
//! deepest frame shared with the capture, then replays the captured chain
//! from there.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::VmError;
use crate::interpreter::frame::{CallOp, FrameRef};
use crate::interpreter::{enter_frame, set_call_result, Interp};
use crate::value::Value;

/// A captured execution state. Invoking it like a function restarts the
/// program at the capture point with the argument as the capture's result.
pub struct Continuation {
    pub(crate) frame: Option<FrameRef>,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("captured", &self.frame.is_some())
            .finish()
    }
}

/// The transfer raised when a continuation is invoked: unwind to `branch`
/// (the deepest frame shared between the current chain and the captured
/// one), then rewind the captured chain and deliver `result`.
#[derive(Clone)]
pub(crate) struct ContinuationJump {
    pub captured: Option<FrameRef>,
    pub branch: Option<FrameRef>,
    pub result: Value,
    pub result_dbl: f64,
}

impl ContinuationJump {
    pub fn new(c: &Continuation, current: Option<FrameRef>) -> Result<ContinuationJump, VmError> {
        let captured = c.frame.clone();
        let mut branch = None;
        if let (Some(cap), Some(cur)) = (&captured, &current) {
            branch = common_ancestor(cap, cur);
            if let Some(b) = &branch {
                if !b.borrow().frozen {
                    return Err(VmError::internal("continuation branch frame is not frozen"));
                }
            }
        }
        Ok(ContinuationJump {
            captured,
            branch,
            result: Value::Undefined,
            result_dbl: 0.0,
        })
    }
}

/// Deepest frame present in both chains, found by equalizing depths and
/// walking up in lockstep.
fn common_ancestor(a: &FrameRef, b: &FrameRef) -> Option<FrameRef> {
    let mut x = Some(a.clone());
    let mut y = Some(b.clone());
    let depth = |f: &Option<FrameRef>| f.as_ref().map_or(0, |f| f.borrow().frame_index + 1);
    while depth(&x) > depth(&y) {
        let parent = x.as_ref().and_then(|f| f.borrow().parent.clone());
        x = parent;
    }
    while depth(&y) > depth(&x) {
        let parent = y.as_ref().and_then(|f| f.borrow().parent.clone());
        y = parent;
    }
    loop {
        match (&x, &y) {
            (Some(fx), Some(fy)) => {
                if Rc::ptr_eq(fx, fy) {
                    return x;
                }
                let px = fx.borrow().parent.clone();
                let py = fy.borrow().parent.clone();
                x = px;
                y = py;
            }
            _ => return None,
        }
    }
}

/// Freeze the live chain from the innermost interpreted frame outward and
/// hand it back as a continuation. Values above each frame's pending call
/// are dropped; the pending call result slot is cleared so the restart can
/// plant the delivered value there.
pub(crate) fn capture(interp: &Interp) -> Result<Continuation, VmError> {
    let Some(start) = interp.last_frame.clone() else {
        return Err(VmError::usage(
            "no interpreted frame is active to capture".to_string(),
        ));
    };
    require_continuations_top_frame(&start)?;
    let mut walk = Some(start.clone());
    while let Some(frame) = walk {
        if frame.borrow().frozen {
            break;
        }
        let parent = {
            let mut f = frame.borrow_mut();
            f.frozen = true;
            let saved_top = f.saved_stack_top;
            let clear_result_slot = match f.saved_call_op {
                Some(CallOp::Value) => true,
                Some(CallOp::Construct) => false,
                None => {
                    return Err(VmError::internal(
                        "captured frame has no pending call",
                    ));
                }
            };
            {
                let mut vals = f.values.borrow_mut();
                let len = vals.slots.len();
                for slot in &mut vals.slots[saved_top + 1..len] {
                    *slot = Value::Undefined;
                }
                if clear_result_slot {
                    vals.slots[saved_top] = Value::Undefined;
                }
            }
            f.parent.clone()
        };
        walk = parent;
    }
    Ok(Continuation { frame: Some(start) })
}

fn require_continuations_top_frame(frame: &FrameRef) -> Result<(), VmError> {
    let mut walk = frame.clone();
    loop {
        let parent = walk.borrow().parent.clone();
        match parent {
            Some(p) => walk = p,
            None => break,
        }
    }
    if walk.borrow().is_continuations_top {
        Ok(())
    } else {
        Err(VmError::usage(
            "continuations can only be captured under a continuations-enabled call".to_string(),
        ))
    }
}

/// Re-enter a captured chain: replay activation and debugger entries for
/// the frames being restored, thaw the innermost frame by cloning, and
/// plant the jump's result as the pending call's value.
pub(crate) fn rewind(interp: &mut Interp, jump: &ContinuationJump) -> Result<FrameRef, VmError> {
    let captured = jump
        .captured
        .clone()
        .ok_or_else(|| VmError::internal("rewind without a captured frame"))?;

    let rewind_count = {
        let base = jump.branch.as_ref().map_or(0, |b| b.borrow().frame_index + 1);
        captured.borrow().frame_index + 1 - base
    };
    let mut replay = Vec::new();
    let mut walk = Some(captured.clone());
    for _ in 0..rewind_count {
        let frame = walk
            .clone()
            .ok_or_else(|| VmError::internal("captured chain shorter than its index"))?;
        if frame.borrow().use_activation || frame.borrow().debugged {
            replay.push(frame.clone());
        }
        walk = frame.borrow().parent.clone();
    }
    for frame in replay.iter().rev() {
        enter_frame(interp, frame, &[], true);
    }

    let thawed = Rc::new(RefCell::new(captured.borrow().clone_frozen()));
    set_call_result(&thawed, jump.result.clone(), jump.result_dbl)?;
    Ok(thawed)
}
