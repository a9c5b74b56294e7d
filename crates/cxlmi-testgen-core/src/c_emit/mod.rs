//! C source emission for libcxlmi test programs.

mod program;
mod structs;

pub use program::{assemble, AssertMode, EmitOptions, GeneratedProgram, Transport};
pub use structs::{render, Assertion, Place, Rendered, Seq};
