//! A small speculative JIT for a dynamic language: bytecode and a type
//! profile go in, AMD64 machine code that deoptimizes back into the
//! interpreter comes out.
//!
//! The pipeline is [`builder`] → [`passes`] → [`lower`] → [`schedule`] →
//! [`regalloc`] → [`linearize`] → [`codegen`], driven by [`compile`].

pub mod arch;
pub mod builder;
pub mod bytecode;
pub mod bytecode_parse;
pub mod codegen;
pub mod compiler;
pub mod deopt;
pub mod error;
pub mod fragments;
pub mod interp;
pub mod ir;
pub mod linearize;
pub mod lower;
pub mod passes;
pub mod profile;
pub mod regalloc;
pub mod runtime;
pub mod schedule;
pub mod value;

pub use bytecode::Insn;
pub use bytecode_parse::parse_listing;
pub use compiler::{CompileOptions, CompiledMethod, compile, compile_graph};
pub use error::{JitError, Result};
pub use profile::Profile;
pub use value::{Kind, Value};

/// Runs `insns` in the interpreter, recording a profile of every send.
pub fn profile_run(
    insns: &[Insn],
    receiver: Value,
    args: Vec<Value>,
    profile: &mut Profile,
) -> Result<Value> {
    interp::run(insns, interp::Frame::new(receiver, args), Some(profile))
}
