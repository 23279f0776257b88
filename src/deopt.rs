//! Transfer from compiled code back into the interpreter.
//!
//! Each guard's frame state becomes a [`ResumePoint`] naming the register
//! that holds every interpreter-visible value. When a guard fails, its
//! trampoline pushes the allocatable registers in [`SAVED_REGISTERS`] order
//! and calls [`deopt_entry`], which rebuilds a [`Frame`] from them and runs
//! the rest of the method in the interpreter.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

use crate::bytecode::Insn;
use crate::error::{JitError, Result};
use crate::interp::{self, Frame};
use crate::regalloc::{R8, R9, R10, R11, RCX, RDI, RDX, RSI, Register};
use crate::runtime;
use crate::value::{self, Value};

/// Push order of the trampoline. After the last push, register
/// `SAVED_REGISTERS[k]` sits `7 - k` words above the stack pointer.
pub const SAVED_REGISTERS: [Register; 8] = [RCX, RDX, RSI, RDI, R8, R9, R10, R11];

/// Interpreter state at a guard, in terms of registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub ip: usize,
    pub insns: Arc<[Insn]>,
    pub receiver: Register,
    pub args: Vec<Register>,
    pub stack: Vec<Register>,
    pub locals: Vec<(String, Register)>,
}

impl ResumePoint {
    /// Builds the interpreter frame from the words saved by a trampoline.
    /// `word` reads a register's saved contents.
    pub fn frame(&self, word: impl Fn(Register) -> Result<u64>) -> Result<Frame> {
        let read = |r: Register| runtime::decode(word(r)?);
        let mut frame = Frame::new(
            read(self.receiver)?,
            self.args.iter().map(|r| read(*r)).collect::<Result<_>>()?,
        );
        frame.stack = self.stack.iter().map(|r| read(*r)).collect::<Result<_>>()?;
        frame.locals = self
            .locals
            .iter()
            .map(|(name, r)| Ok((name.clone(), read(*r)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        frame.ip = self.ip;
        Ok(frame)
    }
}

/// What a trampoline hands to [`deopt_entry`]. Lives in a `Box` owned by
/// the compiled method so its address can be embedded in the code.
#[derive(Debug)]
pub struct DeoptInfo {
    pub resume: ResumePoint,
    count: AtomicU64,
}

impl DeoptInfo {
    pub fn new(resume: ResumePoint) -> Self {
        Self {
            resume,
            count: AtomicU64::new(0),
        }
    }

    /// How many times compiled code has deoptimized here.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

fn saved_slot(r: Register) -> Result<usize> {
    SAVED_REGISTERS
        .iter()
        .position(|s| *s == r)
        .map(|k| SAVED_REGISTERS.len() - 1 - k)
        .ok_or_else(|| JitError::Unsupported(format!("{r} is not saved by deopt trampolines")))
}

/// Resumes the interpreter from the registers in `saved`.
///
/// # Safety
///
/// `saved` must point at the eight words a trampoline pushed.
pub unsafe fn resume(saved: *const u64, info: &DeoptInfo) -> Result<Value> {
    info.count.fetch_add(1, Ordering::Relaxed);
    let frame = info.resume.frame(|r| {
        let slot = saved_slot(r)?;
        // SAFETY: the caller guarantees eight readable words.
        Ok(unsafe { *saved.add(slot) })
    })?;
    interp::run(&info.resume.insns, frame, None)
}

/// Called by deopt trampolines with `(rbp, rsp after the pushes, &DeoptInfo)`.
/// Returns the method's result word; failures are logged and become `nil`.
///
/// # Safety
///
/// Only generated code calls this, with `saved` and `info` as described.
#[cfg(target_arch = "x86_64")]
pub unsafe extern "sysv64" fn deopt_entry(
    frame_base: *const u64,
    saved: *const u64,
    info: *const DeoptInfo,
) -> u64 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `info` is a live Box owned by the compiled method.
        let info = unsafe { &*info };
        debug!(
            ip = info.resume.ip,
            frame_base = ?frame_base,
            "deoptimizing"
        );
        // SAFETY: forwarded from the trampoline.
        unsafe { resume(saved, info) }.map(|v| runtime::encode(&v))
    }));
    match result {
        Ok(Ok(word)) => word,
        Ok(Err(e)) => {
            error!(error = %e, "deoptimized execution failed");
            value::NIL
        }
        Err(_) => {
            error!("deoptimized execution panicked");
            value::NIL
        }
    }
}

pub fn deopt_entry_address() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        deopt_entry as usize as u64
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}
