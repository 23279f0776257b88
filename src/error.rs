use thiserror::Error;

use crate::arch::x64::AsmError;
use crate::arch::x64_disasm::DisasmError;

/// Everything that can go wrong between reading a listing and running the
/// installed code.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("unknown bytecode op `{0}`")]
    UnknownOp(String),

    #[error("malformed instruction at {ip}: {reason}")]
    Malformed { ip: usize, reason: String },

    #[error("instruction {ip} branches to {target}, which is not an instruction index")]
    InvalidBranchTarget { ip: usize, target: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("listing parse error: {0}")]
    Parse(String),

    #[error("operand stack underflow at instruction {0}")]
    StackUnderflow(usize),

    #[error("no free register for n{node} ({available} registers, spilling is not implemented)")]
    OutOfRegisters { node: usize, available: usize },

    #[error("scheduler stuck: no valid anchor for {}", fmt_nodes(.0))]
    Stuck(Vec<usize>),

    #[error("undefined method `{name}` for {receiver}")]
    NoMethod { name: String, receiver: String },

    #[error("invalid value handle {0:#x}")]
    BadHandle(u64),

    #[error(transparent)]
    Asm(#[from] AsmError),

    #[error(transparent)]
    Disasm(#[from] DisasmError),

    #[error("failed to install code: {0}")]
    Install(#[from] std::io::Error),
}

fn fmt_nodes(nodes: &[usize]) -> String {
    nodes
        .iter()
        .map(|n| format!("n{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = JitError> = std::result::Result<T, E>;
