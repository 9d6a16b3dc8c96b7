//! Generator objects: frozen frames that can be re-entered
//!
//! A generator holds the frozen activation of its body between resumes.
//! Resuming hands the frame back to the trampoline with a
//! [`GeneratorState`] describing what the caller wants: deliver a value,
//! inject an exception, or close the body by running its cleanup blocks.

use std::cell::{Cell, RefCell};

use crate::error::VmError;
use crate::interpreter::frame::FrameRef;
use crate::value::Value;

/// What a resume asks the suspended body to do.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GeneratorOp {
    /// Resume with a value; it becomes the result of the pending yield.
    Send,
    /// Resume by throwing the value at the pending yield.
    Throw,
    /// Unwind the body, running cleanup blocks but no catch handlers.
    Close,
}

/// How one resume step completed.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorResult {
    /// The body suspended again at a yield.
    Yielded(Value),
    /// The body ran to completion; the generator is exhausted.
    Returned(Value),
    /// A close request finished unwinding the body.
    Closed(Value),
}

/// Per-resume communication channel between the driver and the dispatch
/// loop.
pub(crate) struct GeneratorState {
    pub operation: GeneratorOp,
    pub value: Value,
    /// Set when the body terminates through a return or end opcode.
    pub produced_return: Option<Value>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Suspended,
    Running,
    Done,
}

pub struct Generator {
    lifecycle: Cell<Lifecycle>,
    frame: RefCell<Option<FrameRef>>,
}

impl Generator {
    pub(crate) fn new(frame: FrameRef) -> Generator {
        Generator {
            lifecycle: Cell::new(Lifecycle::Suspended),
            frame: RefCell::new(Some(frame)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.lifecycle.get() == Lifecycle::Done
    }

    /// Claim the frozen frame for one resume step. Re-entrancy and resuming
    /// an exhausted generator are usage errors.
    pub(crate) fn take_frame(&self) -> Result<FrameRef, VmError> {
        match self.lifecycle.get() {
            Lifecycle::Running => Err(VmError::type_error("generator is already running")),
            Lifecycle::Done => Err(VmError::type_error("generator has already finished")),
            Lifecycle::Suspended => {
                let frame = self
                    .frame
                    .borrow_mut()
                    .take()
                    .ok_or_else(|| VmError::internal("suspended generator lost its frame"))?;
                self.lifecycle.set(Lifecycle::Running);
                Ok(frame)
            }
        }
    }

    /// Park the frame again after a yield.
    pub(crate) fn park(&self, frame: FrameRef) {
        *self.frame.borrow_mut() = Some(frame);
        self.lifecycle.set(Lifecycle::Suspended);
    }

    pub(crate) fn finish(&self) {
        *self.frame.borrow_mut() = None;
        self.lifecycle.set(Lifecycle::Done);
    }
}

/// Detach a frozen snapshot of the creating frame for later resumes. The
/// live frame keeps running to return the generator object itself.
pub(crate) fn capture_frame_for_generator(frame: &FrameRef) -> FrameRef {
    frame.borrow_mut().frozen = true;
    let mut snapshot = frame.borrow().clone_frozen();
    snapshot.frozen = true;
    snapshot.parent = None;
    snapshot.frame_index = 0;
    frame.borrow_mut().frozen = false;
    std::rc::Rc::new(RefCell::new(snapshot))
}
