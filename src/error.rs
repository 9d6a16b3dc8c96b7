//! Error types surfaced by the interpreter to embedders

use crate::interpreter::continuation::Continuation;
use crate::value::Value;
use std::rc::Rc;
use thiserror::Error;

/// One entry of a script stack trace, innermost first.
#[derive(Debug, Clone)]
pub struct ScriptStackElement {
    pub source: Rc<str>,
    pub function: Option<Rc<str>>,
    pub line: Option<u32>,
}

impl std::fmt::Display for ScriptStackElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.function.as_deref().unwrap_or("<anonymous>");
        match self.line {
            Some(line) => write!(f, "    at {} ({}:{})", name, self.source, line),
            None => write!(f, "    at {} ({})", name, self.source),
        }
    }
}

/// Main error type for the interpreter
#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("TypeError: {message}")]
    Type { message: String },

    #[error("RangeError: {message}")]
    Range { message: String },

    #[error("ReferenceError: {name} is not defined")]
    Reference { name: String },

    #[error("SyntaxError: {message}")]
    Syntax { message: String },

    /// A script-level value was thrown and no handler caught it.
    #[error("uncaught exception: {value}\n{}", format_stack(stack))]
    Thrown {
        value: Value,
        stack: Vec<ScriptStackElement>,
    },

    /// Failure raised by a runtime-support callback or a native function.
    /// Routing of these through catch handlers is controlled by
    /// [`HostFaultPolicy`](crate::interpreter::HostFaultPolicy).
    #[error("host fault: {message}")]
    HostFault { message: String },

    /// Non-recoverable failure. Never routed to script handlers; the
    /// unwind skips cleanup blocks as well.
    #[error("fatal error: {message}")]
    Fatal { message: String },

    #[error("exceeded maximum interpreter frame depth ({depth})")]
    StackDepthExceeded { depth: usize },

    /// A native function requested suspension of the whole interpreter
    /// invocation. The embedder resumes it later with
    /// [`Interp::resume_continuation`](crate::Interp::resume_continuation).
    #[error("continuation pending")]
    ContinuationPending { continuation: Rc<Continuation> },

    /// Misuse of the public API, such as resuming a generator that is
    /// already running.
    #[error("{0}")]
    Usage(String),

    #[error("code builder: {0}")]
    Builder(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn format_stack(stack: &[ScriptStackElement]) -> String {
    stack
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl VmError {
    pub fn type_error(message: impl Into<String>) -> Self {
        VmError::Type {
            message: message.into(),
        }
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        VmError::Range {
            message: message.into(),
        }
    }

    pub fn reference_error(name: impl Into<String>) -> Self {
        VmError::Reference { name: name.into() }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        VmError::Syntax {
            message: message.into(),
        }
    }

    pub fn host_fault(message: impl Into<String>) -> Self {
        VmError::HostFault {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        VmError::Fatal {
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        VmError::Usage(message.into())
    }

    /// Create an internal error for unexpected interpreter states.
    /// These should never happen in correctly-written bytecode.
    pub fn internal(message: impl Into<String>) -> Self {
        VmError::Internal(message.into())
    }

    /// The script stack captured when the error escaped the interpreter,
    /// if any. Only thrown script values carry one.
    pub fn script_stack(&self) -> &[ScriptStackElement] {
        match self {
            VmError::Thrown { stack, .. } => stack,
            _ => &[],
        }
    }
}
