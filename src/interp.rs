//! Reference stack interpreter. Compiled code deoptimizes into it, and it
//! records the profiles the optimizer speculates on.

use std::collections::BTreeMap;

use tracing::trace;

use crate::bytecode::Insn;
use crate::error::{JitError, Result};
use crate::profile::Profile;
use crate::runtime;
use crate::value::Value;

/// Interpreter-visible state of one activation.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub receiver: Value,
    pub args: Vec<Value>,
    pub locals: BTreeMap<String, Value>,
    pub stack: Vec<Value>,
    pub ip: usize,
}

impl Frame {
    /// A fresh activation at the first instruction.
    pub fn new(receiver: Value, args: Vec<Value>) -> Self {
        Self {
            receiver,
            args,
            locals: BTreeMap::new(),
            stack: Vec::new(),
            ip: 0,
        }
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(JitError::StackUnderflow(self.ip))
    }
}

/// Runs `insns` from `frame.ip` until a `return`.
pub fn run(insns: &[Insn], mut frame: Frame, mut profile: Option<&mut Profile>) -> Result<Value> {
    loop {
        let ip = frame.ip;
        let insn = insns.get(ip).ok_or_else(|| JitError::Malformed {
            ip,
            reason: "execution ran off the end of the listing".into(),
        })?;
        trace!(ip, %insn, depth = frame.stack.len(), "interp");
        frame.ip += 1;
        match insn {
            Insn::Arg(n) => {
                let value = frame.args.get(*n).cloned().ok_or_else(|| JitError::Malformed {
                    ip,
                    reason: format!("argument {n} out of range"),
                })?;
                frame.stack.push(value);
            }
            Insn::SelfValue => frame.stack.push(frame.receiver.clone()),
            Insn::Load(name) => {
                let value = frame.locals.get(name).cloned().unwrap_or(Value::Nil);
                frame.stack.push(value);
            }
            Insn::Store(name) => {
                let value = frame.pop()?;
                frame.locals.insert(name.clone(), value);
            }
            Insn::Push(value) => frame.stack.push(value.clone()),
            Insn::Send { name, argc } => {
                if frame.stack.len() < argc + 1 {
                    return Err(JitError::StackUnderflow(ip));
                }
                let args = frame.stack.split_off(frame.stack.len() - argc);
                let receiver = frame.pop()?;
                if let Some(profile) = profile.as_deref_mut() {
                    let kinds: Vec<_> = args.iter().map(Value::kind).collect();
                    profile.record(ip, receiver.kind(), &kinds);
                }
                frame.stack.push(runtime::send(&receiver, name, &args)?);
            }
            Insn::Branch(target) => frame.ip = *target,
            Insn::BranchIf(target) => {
                if frame.pop()?.is_truthy() {
                    frame.ip = *target;
                }
            }
            Insn::Not => {
                let value = frame.pop()?;
                frame.stack.push(Value::bool(!value.is_truthy()));
            }
            Insn::Trace(_) => {}
            Insn::Return => return frame.pop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode_parse::parse_listing;
    use crate::value::Kind;

    fn call(src: &str, args: Vec<Value>) -> Value {
        let insns = parse_listing(src).unwrap();
        run(&insns, Frame::new(Value::Nil, args), None).unwrap()
    }

    #[test]
    fn adds_two_arguments() {
        let src = "[:arg, 0] [:arg, 1] [:send, :+, 1] [:return]";
        assert_eq!(
            call(src, vec![Value::Fixnum(14), Value::Fixnum(2)]),
            Value::Fixnum(16)
        );
    }

    #[test]
    fn branches_and_locals() {
        // max(a, b)
        let src = "
            [:arg, 0] [:arg, 1] [:send, :>, 1] [:branchif, 7]
            [:arg, 1] [:store, :m] [:branch, 9]
            [:arg, 0] [:store, :m]
            [:load, :m] [:return]
        ";
        assert_eq!(
            call(src, vec![Value::Fixnum(3), Value::Fixnum(7)]),
            Value::Fixnum(7)
        );
        assert_eq!(
            call(src, vec![Value::Fixnum(9), Value::Fixnum(7)]),
            Value::Fixnum(9)
        );
    }

    #[test]
    fn records_profiles() {
        let insns = parse_listing("[:arg, 0] [:arg, 1] [:send, :+, 1] [:return]").unwrap();
        let mut profile = Profile::new();
        for (a, b) in [(1, 2), (3, 4)] {
            let frame = Frame::new(Value::Nil, vec![Value::Fixnum(a), Value::Fixnum(b)]);
            run(&insns, frame, Some(&mut profile)).unwrap();
        }
        let site = profile.site(2).unwrap();
        assert_eq!(site.monomorphic_receiver(), Some(Kind::Fixnum));
        assert_eq!(site.monomorphic_arg(0), Some(Kind::Fixnum));
    }

    #[test]
    fn resumes_mid_method() {
        let insns = parse_listing("[:arg, 0] [:arg, 1] [:send, :+, 1] [:return]").unwrap();
        let frame = Frame {
            receiver: Value::Nil,
            args: vec![Value::Fixnum(14), Value::Fixnum(2)],
            locals: BTreeMap::new(),
            stack: vec![Value::Fixnum(14), Value::Fixnum(2)],
            ip: 2,
        };
        assert_eq!(run(&insns, frame, None).unwrap(), Value::Fixnum(16));
    }

    #[test]
    fn underflow_is_an_error() {
        let insns = parse_listing("[:send, :+, 1]").unwrap();
        let err = run(&insns, Frame::new(Value::Nil, vec![]), None).unwrap_err();
        assert!(matches!(err, JitError::StackUnderflow(0)));
    }
}
