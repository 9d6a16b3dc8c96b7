//! Observation hooks for frame entry, line changes and faults
//!
//! A hook sees every frame transition the dispatch loop performs, including
//! re-entry of resumed generator and continuation frames, so enter and exit
//! notifications always balance.

use std::rc::Rc;

use crate::code::CompiledUnit;
use crate::error::VmError;
use crate::value::Value;

/// Callbacks driven by the dispatch loop. All methods default to no-ops;
/// implementors use interior mutability to record what they need.
pub trait DebugHook {
    /// A frame was entered. `resumed` distinguishes re-entry of a thawed
    /// frame from a fresh call.
    fn on_enter(&self, _unit: &Rc<CompiledUnit>, _this: &Value, _args: &[Value], _resumed: bool) {}

    /// The current source line changed (a `Line` instruction executed).
    fn on_line_change(&self, _line: u32) {}

    /// A fault began routing. Fired once per throw, before handler search.
    fn on_exception(&self, _err: &VmError) {}

    /// A frame was exited. `by_throw` is set when the exit is part of
    /// unwinding rather than a return.
    fn on_exit(&self, _unit: &Rc<CompiledUnit>, _by_throw: bool) {}

    /// A `Debugger` instruction executed.
    fn on_debugger_statement(&self) {}
}
