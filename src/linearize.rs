//! Linearizer: turns scheduled, register-allocated blocks into a flat list
//! of pseudo-instructions per block.
//!
//! Each scheduled node becomes at most one [`LinearOp`] naming registers
//! instead of nodes. Control flow between blocks is explicit: every block
//! ends in a `return`, a `branch` or a `jump`, until [`Linear::simplify`]
//! turns jumps to the next block into fallthrough.

use std::collections::HashMap;
use std::fmt;

use crate::deopt::ResumePoint;
use crate::error::{JitError, Result};
use crate::ir::{Graph, IntOp, Name, NodeId, Op, Test};
use crate::regalloc::{Allocation, Register};
use crate::schedule::Block;
use crate::value::Value;

// ─── Operands ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Register),
    Imm(i64),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(n) => write!(f, "{n}"),
        }
    }
}

/// Index of a block in [`Linear::blocks`].
pub type BlockIndex = usize;

// ─── LinearOp ───────────────────────────────────────────────────────────────

/// A single instruction in the linearized program.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOp {
    // ── Values ──
    SelfValue {
        dst: Register,
    },
    Arg {
        dst: Register,
        index: u32,
    },
    Constant {
        dst: Register,
        value: Value,
    },
    Move {
        dst: Register,
        src: Register,
    },
    Int64 {
        op: IntOp,
        dst: Register,
        left: Register,
        right: Operand,
    },
    /// Its value arrives through the moves of the predecessors.
    Phi {
        dst: Register,
    },
    CallManaged {
        dst: Option<Register>,
        receiver: Register,
        name: Register,
        args: Vec<Register>,
    },

    // ── Deoptimization ──
    /// Marks where frame state `id` was scheduled. Emits nothing.
    FrameState {
        id: usize,
    },
    /// Deoptimizes with frame state `frame_state` unless `test` holds on
    /// `condition`.
    Guard {
        test: Test,
        condition: Register,
        frame_state: usize,
    },
    Nop,

    // ── Control ──
    Return {
        value: Register,
    },
    Jump(BlockIndex),
    Branch {
        test: Test,
        condition: Register,
        if_true: BlockIndex,
        if_false: BlockIndex,
    },
    /// Jumps when `test` holds, else falls through.
    BranchIf {
        test: Test,
        condition: Register,
        target: BlockIndex,
    },
    /// Jumps when `test` does not hold, else falls through.
    BranchUnless {
        test: Test,
        condition: Register,
        target: BlockIndex,
    },
}

impl fmt::Display for LinearOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearOp::SelfValue { dst } => write!(f, "{dst} = self"),
            LinearOp::Arg { dst, index } => write!(f, "{dst} = arg {index}"),
            LinearOp::Constant { dst, value } => write!(f, "{dst} = constant {value}"),
            LinearOp::Move { dst, src } => write!(f, "{dst} = move {src}"),
            LinearOp::Int64 {
                op,
                dst,
                left,
                right,
            } => write!(f, "{dst} = {} {left}, {right}", op.name()),
            LinearOp::Phi { dst } => write!(f, "{dst} = phi"),
            LinearOp::CallManaged {
                dst,
                receiver,
                name,
                args,
            } => {
                if let Some(dst) = dst {
                    write!(f, "{dst} = ")?;
                }
                write!(f, "call_managed {receiver}, {name}")?;
                for a in args {
                    write!(f, ", {a}")?;
                }
                Ok(())
            }
            LinearOp::FrameState { id } => write!(f, "frame_state #{id}"),
            LinearOp::Guard {
                test,
                condition,
                frame_state,
            } => write!(f, "guard {test} {condition} else deopt #{frame_state}"),
            LinearOp::Nop => f.write_str("nop"),
            LinearOp::Return { value } => write!(f, "return {value}"),
            LinearOp::Jump(b) => write!(f, "jump b{b}"),
            LinearOp::Branch {
                test,
                condition,
                if_true,
                if_false,
            } => write!(f, "branch {test} {condition} ? b{if_true} : b{if_false}"),
            LinearOp::BranchIf {
                test,
                condition,
                target,
            } => write!(f, "branch_if {test} {condition} b{target}"),
            LinearOp::BranchUnless {
                test,
                condition,
                target,
            } => write!(f, "branch_unless {test} {condition} b{target}"),
        }
    }
}

// ─── Linear ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Linear {
    pub blocks: Vec<Vec<LinearOp>>,
    /// Indexed by the `frame_state` of guards.
    pub frame_states: Vec<ResumePoint>,
}

impl fmt::Display for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ops) in self.blocks.iter().enumerate() {
            writeln!(f, "b{i}:")?;
            for op in ops {
                writeln!(f, "  {op}")?;
            }
        }
        Ok(())
    }
}

impl Linear {
    /// Drops moves within one register and jumps to the next block, and
    /// rewrites two-way branches so one side falls through.
    pub fn simplify(&mut self) {
        let count = self.blocks.len();
        for (i, ops) in self.blocks.iter_mut().enumerate() {
            ops.retain(|op| !matches!(op, LinearOp::Move { dst, src } if dst == src));
            let next = (i + 1 < count).then_some(i + 1);
            match ops.pop() {
                Some(LinearOp::Jump(t)) if Some(t) == next => {}
                Some(LinearOp::Branch {
                    test,
                    condition,
                    if_true,
                    if_false,
                }) => {
                    if Some(if_false) == next {
                        ops.push(LinearOp::BranchIf {
                            test,
                            condition,
                            target: if_true,
                        });
                    } else if Some(if_true) == next {
                        ops.push(LinearOp::BranchUnless {
                            test,
                            condition,
                            target: if_false,
                        });
                    } else {
                        ops.push(LinearOp::BranchIf {
                            test,
                            condition,
                            target: if_true,
                        });
                        ops.push(LinearOp::Jump(if_false));
                    }
                }
                Some(other) => ops.push(other),
                None => {}
            }
        }
    }
}

// ─── Linearizer ─────────────────────────────────────────────────────────────

struct Linearizer<'a> {
    graph: &'a Graph,
    alloc: &'a Allocation,
    block_of: HashMap<NodeId, BlockIndex>,
    frame_state_ids: HashMap<NodeId, usize>,
    frame_states: Vec<ResumePoint>,
}

impl Linearizer<'_> {
    fn reg(&self, n: NodeId) -> Result<Register> {
        self.alloc.register(n).ok_or_else(|| {
            JitError::Unsupported(format!("{n} ({}) has no register", self.graph.op(n)))
        })
    }

    fn input(&self, n: NodeId, name: Name) -> Result<NodeId> {
        self.graph.input(n, name).ok_or_else(|| {
            JitError::Unsupported(format!("{n} ({}) has no {name:?} input", self.graph.op(n)))
        })
    }

    fn input_reg(&self, n: NodeId, name: Name) -> Result<Register> {
        self.reg(self.input(n, name)?)
    }

    fn block(&self, n: NodeId) -> Result<BlockIndex> {
        self.block_of
            .get(&n)
            .copied()
            .ok_or_else(|| JitError::Unsupported(format!("{n} does not start a block")))
    }

    fn frame_state(&mut self, fs: NodeId) -> Result<usize> {
        if let Some(id) = self.frame_state_ids.get(&fs) {
            return Ok(*id);
        }
        let graph = self.graph;
        let Op::FrameState(info) = graph.op(fs) else {
            return Err(JitError::Unsupported(format!(
                "{fs} ({}) is not a frame state",
                graph.op(fs)
            )));
        };
        let resume = ResumePoint {
            ip: info.ip,
            insns: info.insns.clone(),
            receiver: self.input_reg(fs, Name::Receiver)?,
            args: (0..info.arity)
                .map(|i| self.input_reg(fs, Name::Arg(i)))
                .collect::<Result<_>>()?,
            stack: (0..info.stack_depth)
                .map(|i| self.input_reg(fs, Name::Stack(i)))
                .collect::<Result<_>>()?,
            locals: info
                .locals
                .iter()
                .enumerate()
                .map(|(i, name)| Ok((name.clone(), self.input_reg(fs, Name::Local(i as u32))?)))
                .collect::<Result<_>>()?,
        };
        let id = self.frame_states.len();
        self.frame_states.push(resume);
        self.frame_state_ids.insert(fs, id);
        Ok(id)
    }

    fn op(&mut self, n: NodeId) -> Result<Option<LinearOp>> {
        let graph = self.graph;
        let dst = self.alloc.register(n);
        let op = match graph.op(n) {
            Op::Start | Op::Merge | Op::Connector | Op::Immediate(_) => return Ok(None),
            Op::Trace { .. } => LinearOp::Nop,
            Op::Finish => LinearOp::Return {
                value: self.input_reg(n, Name::Value)?,
            },
            Op::Branch { test, .. } => LinearOp::Branch {
                test: *test,
                condition: self.input_reg(n, Name::Condition)?,
                if_true: self.successor_block(n, true)?,
                if_false: self.successor_block(n, false)?,
            },
            Op::Guard { test } => {
                let fs = graph.input(n, Name::FrameState).ok_or_else(|| {
                    JitError::Unsupported(format!("guard {n} has no frame state to deopt to"))
                })?;
                LinearOp::Guard {
                    test: *test,
                    condition: self.input_reg(n, Name::Condition)?,
                    frame_state: self.frame_state(fs)?,
                }
            }
            Op::FrameState(_) => LinearOp::FrameState {
                id: self.frame_state(n)?,
            },
            // Values nobody reads get no register and no code.
            _ if dst.is_none() && !matches!(graph.op(n), Op::CallManaged { .. }) => {
                return self.unlowered(n).map(|()| None);
            }
            Op::SelfValue => LinearOp::SelfValue { dst: self.reg(n)? },
            Op::Arg(index) => LinearOp::Arg {
                dst: self.reg(n)?,
                index: *index,
            },
            Op::Constant(value) => LinearOp::Constant {
                dst: self.reg(n)?,
                value: value.clone(),
            },
            Op::Move => LinearOp::Move {
                dst: self.reg(n)?,
                src: self.input_reg(n, Name::Value)?,
            },
            Op::Phi => LinearOp::Phi { dst: self.reg(n)? },
            Op::Int64(op) => {
                let left = self.input(n, Name::Left)?;
                if let Op::Immediate(value) = graph.op(left) {
                    return Err(JitError::Unsupported(format!(
                        "immediate {value} as the left operand of {}",
                        op.name()
                    )));
                }
                let right = self.input(n, Name::Right)?;
                let right = match graph.op(right) {
                    Op::Immediate(value) => Operand::Imm(*value),
                    _ => Operand::Reg(self.reg(right)?),
                };
                LinearOp::Int64 {
                    op: *op,
                    dst: self.reg(n)?,
                    left: self.reg(left)?,
                    right,
                }
            }
            Op::CallManaged { argc } => LinearOp::CallManaged {
                dst,
                receiver: self.input_reg(n, Name::Receiver)?,
                name: self.input_reg(n, Name::MethodName)?,
                args: (0..*argc)
                    .map(|i| self.input_reg(n, Name::Arg(i)))
                    .collect::<Result<_>>()?,
            },
            _ => return self.unlowered(n).map(|()| None),
        };
        Ok(Some(op))
    }

    /// Errors for ops lowering should have removed.
    fn unlowered(&self, n: NodeId) -> Result<()> {
        match self.graph.op(n) {
            Op::SelfValue | Op::Arg(_) | Op::Constant(_) | Op::Move | Op::Phi | Op::Int64(_) => {
                Ok(())
            }
            op => Err(JitError::Unsupported(format!(
                "{op} ({n}) has no machine form"
            ))),
        }
    }

    fn successor_block(&self, n: NodeId, side: bool) -> Result<BlockIndex> {
        let succ = self.graph.successor(n, Name::Branch(side)).ok_or_else(|| {
            JitError::Unsupported(format!("branch {n} has no {side} successor"))
        })?;
        self.block(succ)
    }

    fn block_ops(&mut self, block: &Block) -> Result<Vec<LinearOp>> {
        let mut ops = Vec::new();
        for n in &block.nodes {
            if let Some(op) = self.op(*n)? {
                ops.push(op);
            }
        }
        match self.graph.op(block.terminator) {
            Op::Branch { .. } | Op::Finish => {}
            _ => {
                if let [(_, next)] = self.graph.successors(block.terminator).as_slice() {
                    ops.push(LinearOp::Jump(self.block(*next)?));
                }
            }
        }
        Ok(ops)
    }
}

/// Emits one block of pseudo-instructions per scheduled block, in order.
pub fn linearize(graph: &Graph, blocks: &[Block], alloc: &Allocation) -> Result<Linear> {
    let mut l = Linearizer {
        graph,
        alloc,
        block_of: blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.leader, i))
            .collect(),
        frame_state_ids: HashMap::new(),
        frame_states: Vec::new(),
    };
    let blocks = blocks
        .iter()
        .map(|b| l.block_ops(b))
        .collect::<Result<Vec<_>>>()?;
    Ok(Linear {
        blocks,
        frame_states: l.frame_states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::bytecode_parse::parse_listing;
    use crate::fragments::fixnum_binop;
    use crate::ir::Arith;
    use crate::lower::lower;
    use crate::passes::run_default_passes;
    use crate::profile::Profile;
    use crate::regalloc::{RDI, RDX, RSI, RegisterSet, allocate};
    use crate::schedule::schedule;
    use crate::value::Kind;

    fn linear(mut g: Graph) -> Linear {
        lower(&mut g).unwrap();
        let mut blocks = schedule(&mut g).unwrap();
        let alloc = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap();
        let mut linear = linearize(&g, &blocks, &alloc).unwrap();
        linear.simplify();
        linear
    }

    #[test]
    fn fragment_falls_through_to_the_fast_path() {
        let l = linear(fixnum_binop(Arith::Add).graph);
        assert_eq!(l.blocks.len(), 4, "{l}");
        assert!(l.frame_states.is_empty());

        assert!(
            matches!(
                l.blocks[0].last(),
                Some(LinearOp::BranchUnless {
                    test: Test::NotZero,
                    target: 2,
                    ..
                })
            ),
            "{l}"
        );
        assert!(
            l.blocks[1]
                .iter()
                .any(|op| matches!(op, LinearOp::Int64 { op: IntOp::Add, .. })),
            "{l}"
        );
        assert_eq!(l.blocks[1].last(), Some(&LinearOp::Jump(3)), "{l}");
        assert!(
            l.blocks[2]
                .iter()
                .any(|op| matches!(op, LinearOp::CallManaged { args, .. } if args.len() == 1)),
            "{l}"
        );
        assert!(!matches!(l.blocks[2].last(), Some(LinearOp::Jump(_))), "{l}");
        assert!(matches!(l.blocks[3].last(), Some(LinearOp::Return { .. })), "{l}");
    }

    #[test]
    fn moves_feed_the_phi_register() {
        let l = linear(fixnum_binop(Arith::Sub).graph);
        let Some(LinearOp::Phi { dst }) = l.blocks[3].first() else {
            panic!("merge block should start with the phi:\n{l}");
        };
        for b in [1, 2] {
            assert!(
                l.blocks[b]
                    .iter()
                    .any(|op| matches!(op, LinearOp::Move { dst: d, .. } if d == dst)),
                "b{b} has no move into {dst}:\n{l}"
            );
        }
    }

    #[test]
    fn guards_carry_resume_points() {
        let insns =
            parse_listing("[:trace, 1] [:arg, 0] [:arg, 1] [:send, :+, 1] [:return]").unwrap();
        let mut profile = Profile::new();
        profile.record(3, Kind::Fixnum, &[Kind::Fixnum]);
        let mut g = build(&insns, 2, Some(&profile)).unwrap();
        run_default_passes(&mut g);
        let l = linear(g);

        assert_eq!(l.blocks.len(), 1, "{l}");
        let guards: Vec<usize> = l.blocks[0]
            .iter()
            .filter_map(|op| match op {
                LinearOp::Guard { frame_state, .. } => Some(*frame_state),
                _ => None,
            })
            .collect();
        assert_eq!(guards, vec![0, 0], "{l}");

        let [resume] = l.frame_states.as_slice() else {
            panic!("expected one resume point:\n{l}");
        };
        assert_eq!(resume.ip, 3);
        assert_eq!(resume.receiver, RDI);
        assert_eq!(resume.args, vec![RSI, RDX]);
        assert_eq!(resume.stack, vec![RSI, RDX]);
    }

    #[test]
    fn simplify_keeps_a_jump_when_neither_side_follows() {
        let r = Register(1);
        let mut l = Linear {
            blocks: vec![
                vec![LinearOp::Branch {
                    test: Test::Zero,
                    condition: r,
                    if_true: 2,
                    if_false: 3,
                }],
                vec![LinearOp::Jump(2)],
                vec![LinearOp::Return { value: r }],
                vec![LinearOp::Return { value: r }],
            ],
            frame_states: Vec::new(),
        };
        l.simplify();
        insta::assert_snapshot!(l.to_string().trim_end(), @r"
        b0:
          branch_if zero? rcx b2
          jump b3
        b1:
        b2:
          return rcx
        b3:
          return rcx
        ");
    }

    #[test]
    fn simplify_drops_moves_within_a_register() {
        let (rcx, rdx) = (Register(1), Register(2));
        let mut l = Linear {
            blocks: vec![vec![
                LinearOp::Move { dst: rcx, src: rcx },
                LinearOp::Move { dst: rdx, src: rcx },
                LinearOp::Return { value: rdx },
            ]],
            frame_states: Vec::new(),
        };
        l.simplify();
        insta::assert_snapshot!(l.to_string().trim_end(), @r"
        b0:
          rdx = move rcx
          return rdx
        ");
    }
}
