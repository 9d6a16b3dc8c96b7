//! Embeddable bytecode interpreter core for a dynamic language
//!
//! The crate executes [`CompiledUnit`]s: linear bytecode with constant
//! pools and an exception table, produced by [`CodeBuilder`]. Calls are
//! dispatched on a trampoline over heap-allocated activation frames, so
//! deep recursion never grows the native stack and suspended frames can
//! outlive their callers. That one property carries the two headline
//! features: resumable generators and first-class continuations.
//!
//! Object-model and coercion semantics stay outside the core, behind the
//! [`RuntimeSupport`] seam; [`BasicHost`] is the bundled implementation.
//!
//! # Example
//!
//! ```
//! use vireo::{CodeBuilder, Interp, Op, Value};
//!
//! let mut b = CodeBuilder::new("sum", "example.vs");
//! b.script().stack(2);
//! b.load_number(2.0).load_number(40.0).emit(Op::Add).emit(Op::Return);
//! let unit = b.build().unwrap();
//!
//! let mut interp = Interp::new();
//! let result = interp.exec(&unit).unwrap();
//! assert_eq!(result, Value::Number(42.0));
//! ```

pub mod code;
pub mod debug;
pub mod error;
pub mod interpreter;
pub mod opcode;
pub mod support;
pub mod value;

pub use code::CodeBuilder;
pub use code::CompiledUnit;
pub use code::DomainToken;
pub use code::ExceptionRecord;
pub use code::Label;
pub use code::RegexLiteral;
pub use debug::DebugHook;
pub use error::ScriptStackElement;
pub use error::VmError;
pub use interpreter::HostFaultPolicy;
pub use interpreter::Interp;
pub use interpreter::continuation::Continuation;
pub use interpreter::generator::Generator;
pub use interpreter::generator::GeneratorOp;
pub use interpreter::generator::GeneratorResult;
pub use opcode::Op;
pub use support::BasicHost;
pub use support::RuntimeSupport;
pub use value::BoundFn;
pub use value::CheapClone;
pub use value::InterpFn;
pub use value::NativeFn;
pub use value::Value;
