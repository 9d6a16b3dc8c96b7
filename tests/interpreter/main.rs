//! Integration tests for the interpreter, organized by feature
//!
//! Every test assembles bytecode through `CodeBuilder` and runs it through
//! the public API; no front end is involved.

mod basics;
mod counting;
mod exceptions;
mod generators;
