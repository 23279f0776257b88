//! The flat instruction list the graph builder consumes.

use std::fmt;

use crate::value::Value;

/// One stack-machine instruction. Branch targets are instruction indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Insn {
    /// Push the n-th method argument.
    Arg(usize),
    /// Push the receiver.
    SelfValue,
    Load(String),
    Store(String),
    Push(Value),
    /// Pop `argc` arguments and a receiver, push the result.
    Send {
        name: String,
        argc: usize,
    },
    Branch(usize),
    /// Pop a value and branch if it is truthy.
    BranchIf(usize),
    Not,
    Trace(u32),
    Return,
}

impl Insn {
    pub fn send(name: &str, argc: usize) -> Insn {
        Insn::Send {
            name: name.to_string(),
            argc,
        }
    }

    pub fn branch_target(&self) -> Option<usize> {
        match self {
            Insn::Branch(t) | Insn::BranchIf(t) => Some(*t),
            _ => None,
        }
    }

    /// Whether execution can continue with the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(self, Insn::Branch(_) | Insn::Return)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Arg(n) => write!(f, "[:arg, {n}]"),
            Insn::SelfValue => write!(f, "[:self]"),
            Insn::Load(name) => write!(f, "[:load, :{name}]"),
            Insn::Store(name) => write!(f, "[:store, :{name}]"),
            Insn::Push(value) => write!(f, "[:push, {value}]"),
            Insn::Send { name, argc } => write!(f, "[:send, :{name}, {argc}]"),
            Insn::Branch(t) => write!(f, "[:branch, {t}]"),
            Insn::BranchIf(t) => write!(f, "[:branchif, {t}]"),
            Insn::Not => write!(f, "[:not]"),
            Insn::Trace(line) => write!(f, "[:trace, {line}]"),
            Insn::Return => write!(f, "[:return]"),
        }
    }
}

/// Renders a whole listing, one instruction per line.
pub fn listing(insns: &[Insn]) -> String {
    insns.iter().map(|i| format!("{i}\n")).collect()
}
