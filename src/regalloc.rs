//! Linear-scan register allocation over the scheduled blocks.
//!
//! Live ranges are measured in [`sequence`] numbers, which order nodes by
//! data dependency rather than by where the scheduler left them; each block
//! is re-emitted in that order. Arguments and `self` are pinned to their ABI
//! registers from sequence 0. There is no spilling; running out of
//! registers is an error.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use tracing::debug;

use crate::error::{JitError, Result};
use crate::ir::{EdgeKind, Graph, Name, NodeId, Op};
use crate::schedule::{Block, produces_value};

/// A machine register, by hardware number. Numbers past the sixteen
/// general-purpose registers only come from [`RegisterSet::infinite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u32);

const NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NAMES.get(self.0 as usize) {
            Some(name) => f.write_str(name),
            None => write!(f, "v{}", self.0),
        }
    }
}

pub const RCX: Register = Register(1);
pub const RDX: Register = Register(2);
pub const RSI: Register = Register(6);
pub const RDI: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);

/// The registers an allocation may hand out, and the calling convention
/// that pins incoming values.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    pool: Vec<Register>,
    self_register: Option<Register>,
    arg_registers: Vec<Register>,
    unbounded: bool,
}

impl RegisterSet {
    /// Caller-saved registers of the System V AMD64 ABI; `rax` is left as
    /// the code generator's scratch register.
    pub fn amd64() -> Self {
        Self {
            pool: vec![RCX, RDX, RSI, RDI, R8, R9, R10, R11],
            self_register: Some(RDI),
            arg_registers: vec![RSI, RDX, RCX, R8, R9],
            unbounded: false,
        }
    }

    /// Hands every value a register of its own and pins nothing.
    pub fn infinite() -> Self {
        Self {
            pool: Vec::new(),
            self_register: None,
            arg_registers: Vec::new(),
            unbounded: true,
        }
    }

    pub fn pool(&self) -> &[Register] {
        &self.pool
    }

    fn pin(&self, op: &Op) -> Result<Option<Register>> {
        if self.unbounded {
            return Ok(None);
        }
        match op {
            Op::SelfValue => Ok(self.self_register),
            Op::Arg(i) => self
                .arg_registers
                .get(*i as usize)
                .copied()
                .map(Some)
                .ok_or_else(|| {
                    JitError::Unsupported(format!(
                        "argument {i} is not passed in a register"
                    ))
                }),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRange {
    pub node: NodeId,
    pub start: u32,
    pub end: u32,
    pub pinned: Option<Register>,
}

#[derive(Debug, Default)]
pub struct Allocation {
    registers: HashMap<NodeId, Register>,
    pub ranges: Vec<LiveRange>,
}

impl Allocation {
    pub fn register(&self, n: NodeId) -> Option<Register> {
        self.registers.get(&n).copied()
    }

    /// Every register holding some value.
    pub fn used(&self) -> BTreeSet<Register> {
        self.registers.values().copied().collect()
    }
}

/// Rebuilds the `local_schedule` chain of a block after nodes were inserted.
fn rechain(graph: &mut Graph, block: &Block) {
    for n in &block.nodes {
        let stale: Vec<_> = graph
            .outputs(*n)
            .filter(|(_, e)| e.output == Name::LocalSchedule)
            .map(|(e, _)| e)
            .collect();
        for e in stale {
            graph.remove_edge(e);
        }
    }
    for pair in block.nodes.windows(2) {
        graph.output_to(pair[0], Name::LocalSchedule, pair[1], Name::LocalSchedule);
    }
}

/// Feeds every phi input through a `move` at the end of the block that
/// supplies it. Returns the moves and the phi each one writes.
fn insert_phi_moves(graph: &mut Graph, blocks: &mut [Block]) -> Vec<(NodeId, NodeId)> {
    let block_of: HashMap<NodeId, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.terminator, i))
        .collect();
    let phis: Vec<NodeId> = blocks
        .iter()
        .flat_map(|b| b.nodes.iter().copied())
        .filter(|n| graph.op(*n).is_phi())
        .collect();

    let mut moves = Vec::new();
    let mut touched = BTreeSet::new();
    for phi in phis {
        let Some(merge) = graph.input(phi, Name::Switch) else {
            continue;
        };
        let inputs: Vec<_> = graph
            .inputs(phi)
            .filter_map(|(e, edge)| match edge.input {
                Name::PhiValue(t) => Some((e, t, edge.from, edge.output)),
                _ => None,
            })
            .collect();
        for (e, case, source, output) in inputs {
            let Some(tail) = graph.merge_case_source(merge, case) else {
                continue;
            };
            let Some(&b) = block_of.get(&tail) else {
                continue;
            };
            let m = graph.add(Op::Move);
            graph.remove_edge(e);
            graph.output_to(source, output, m, Name::Value);
            graph.value(m, phi, Name::PhiValue(case));
            graph.output_to(tail, Name::GlobalSchedule, m, Name::GlobalSchedule);

            let nodes = &mut blocks[b].nodes;
            if produces_value(graph.op(tail)) {
                nodes.push(m);
            } else {
                let at = nodes.len() - 1;
                nodes.insert(at, m);
            }
            touched.insert(b);
            moves.push((m, phi));
        }
    }
    for b in touched {
        rechain(graph, &blocks[b]);
    }
    moves
}

/// Numbers every scheduled node, block by block, in data-dependency order.
///
/// A node gets a number only once every producer it has in the same block
/// is numbered; nodes whose producers are ready are numbered in the order
/// they became ready. Fixed nodes keep their control order, and a block
/// ending in a jump or branch numbers its terminator last.
pub fn sequence(graph: &Graph, blocks: &[Block]) -> HashMap<NodeId, u32> {
    let mut seq = HashMap::new();
    let mut next = 0;
    for block in blocks {
        let residents: HashSet<NodeId> = block.nodes.iter().copied().collect();
        let closing = !produces_value(graph.op(block.terminator));
        let mut waiting: HashMap<NodeId, usize> = HashMap::new();
        let mut unblocks: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut previous_fixed = None;
        for &n in &block.nodes {
            let mut deps: Vec<NodeId> = graph
                .inputs(n)
                .filter(|(_, e)| matches!(e.kind, EdgeKind::Data | EdgeKind::FrameState))
                .map(|(_, e)| e.from)
                .filter(|p| residents.contains(p))
                .collect();
            if graph.is_fixed(n) {
                deps.extend(previous_fixed);
                previous_fixed = Some(n);
            }
            if closing && n == block.terminator {
                deps.extend(block.nodes.iter().copied().filter(|m| *m != n));
            }
            deps.sort();
            deps.dedup();
            waiting.insert(n, deps.len());
            for d in deps {
                unblocks.entry(d).or_default().push(n);
            }
        }

        let mut ready: VecDeque<NodeId> = block
            .nodes
            .iter()
            .copied()
            .filter(|n| waiting[n] == 0)
            .collect();
        while let Some(n) = ready.pop_front() {
            seq.insert(n, next);
            next += 1;
            for u in unblocks.remove(&n).unwrap_or_default() {
                if let Some(w) = waiting.get_mut(&u) {
                    *w -= 1;
                    if *w == 0 {
                        ready.push_back(u);
                    }
                }
            }
        }
        // Dependency cycles cannot come out of the scheduler; keep block
        // order for anything left over all the same.
        for &n in &block.nodes {
            if !seq.contains_key(&n) {
                seq.insert(n, next);
                next += 1;
            }
        }
    }
    seq
}

/// Re-emits every block in sequence order.
fn resequence(graph: &mut Graph, blocks: &mut [Block], seq: &HashMap<NodeId, u32>) {
    for block in blocks.iter_mut() {
        block.nodes.sort_by_key(|n| seq[n]);
        rechain(graph, block);
    }
}

/// Last sequence number at which `n`'s value is needed.
fn last_use(graph: &Graph, n: NodeId, pos: &HashMap<NodeId, u32>) -> u32 {
    let mut end = pos[&n];
    for e in graph.users(n) {
        let e = graph.edge(e);
        let at = match graph.op(e.to) {
            Op::Move => pos[&e.to] + 1,
            Op::FrameState(_) => graph
                .users(e.to)
                .iter()
                .map(|u| pos[&graph.edge(*u).to])
                .max()
                .unwrap_or(pos[&e.to]),
            _ => pos[&e.to],
        };
        end = end.max(at);
    }
    end
}

/// Assigns a register to every scheduled value, inserting phi moves into
/// `blocks` (and the graph) on the way.
pub fn allocate(graph: &mut Graph, blocks: &mut [Block], set: &RegisterSet) -> Result<Allocation> {
    let moves = insert_phi_moves(graph, blocks);
    let pos = sequence(graph, blocks);
    resequence(graph, blocks, &pos);

    let mut ranges = Vec::new();
    for n in blocks.iter().flat_map(|b| b.nodes.iter().copied()) {
        let op = graph.op(n);
        if !produces_value(op) || matches!(op, Op::Move) || graph.users(n).is_empty() {
            continue;
        }
        let pinned = set.pin(op)?;
        let start = if pinned.is_some() {
            0
        } else if op.is_phi() {
            moves
                .iter()
                .filter(|(_, phi)| *phi == n)
                .map(|(m, _)| pos[m])
                .min()
                .unwrap_or(pos[&n])
        } else {
            pos[&n]
        };
        ranges.push(LiveRange {
            node: n,
            start,
            end: last_use(graph, n, &pos),
            pinned,
        });
    }
    ranges.sort_by_key(|r| (r.start, r.pinned.is_none(), r.node));

    let mut alloc = Allocation::default();
    let mut active: Vec<(u32, Register)> = Vec::new();
    let mut fresh = NAMES.len() as u32;
    for r in &ranges {
        active.retain(|(end, _)| *end > r.start);
        let reg = if let Some(reg) = r.pinned {
            if active.iter().any(|(_, a)| *a == reg) {
                return Err(JitError::Unsupported(format!("{reg} is pinned twice")));
            }
            reg
        } else if set.unbounded {
            fresh += 1;
            Register(fresh - 1)
        } else {
            set.pool
                .iter()
                .copied()
                .find(|reg| active.iter().all(|(_, a)| a != reg))
                .ok_or(JitError::OutOfRegisters {
                    node: r.node.index(),
                    available: set.pool.len(),
                })?
        };
        active.push((r.end, reg));
        alloc.registers.insert(r.node, reg);
    }
    for (m, phi) in &moves {
        if let Some(reg) = alloc.registers.get(phi).copied() {
            alloc.registers.insert(*m, reg);
        }
    }
    alloc.ranges = ranges;
    debug!(
        values = alloc.ranges.len(),
        registers = alloc.used().len(),
        moves = moves.len(),
        "allocated registers"
    );
    Ok(alloc)
}

/// Whether every phi input comes from a node holding the phi's register.
pub fn check_phi_convergence(graph: &Graph, alloc: &Allocation) -> bool {
    graph.node_ids().into_iter().filter(|n| graph.op(*n).is_phi()).all(|phi| {
        graph
            .inputs(phi)
            .filter(|(_, e)| e.kind == EdgeKind::Data && matches!(e.input, Name::PhiValue(_)))
            .all(|(_, e)| alloc.register(e.from) == alloc.register(phi))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::builder::build;
    use crate::bytecode_parse::parse_listing;
    use crate::ir::{FrameStateInfo, IntOp, Test};
    use crate::lower::lower;
    use crate::passes::run_default_passes;
    use crate::profile::Profile;
    use crate::schedule::{is_scheduled, schedule};
    use crate::value::{Kind, Value};

    const MAX: &str = "
        [:arg, 0] [:arg, 1] [:send, :>, 1] [:branchif, 6]
        [:arg, 1] [:return]
        [:arg, 0] [:return]
    ";

    fn scheduled_max() -> (Graph, Vec<Block>) {
        let insns = parse_listing(MAX).unwrap();
        let mut profile = Profile::new();
        profile.record(2, Kind::Fixnum, &[Kind::Fixnum]);
        let mut g = build(&insns, 2, Some(&profile)).unwrap();
        run_default_passes(&mut g);
        lower(&mut g).unwrap();
        let blocks = schedule(&mut g).unwrap();
        (g, blocks)
    }

    #[test]
    fn infinite_registers_are_unique() {
        let (mut g, mut blocks) = scheduled_max();
        let alloc = allocate(&mut g, &mut blocks, &RegisterSet::infinite()).unwrap();
        let mut seen = HashMap::new();
        for n in g.node_ids() {
            if matches!(g.op(n), Op::Move) {
                continue;
            }
            if let Some(reg) = alloc.register(n) {
                if let Some(other) = seen.insert(reg, n) {
                    panic!("{other} and {n} share {reg}");
                }
            }
        }
        assert!(!seen.is_empty());
    }

    #[test]
    fn phi_inputs_share_the_phi_register() {
        let (mut g, mut blocks) = scheduled_max();
        let alloc = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap();
        assert!(check_phi_convergence(&g, &alloc));

        let phi = g.input(g.finish, Name::Value).unwrap();
        assert!(g.op(phi).is_phi());
        let moves: Vec<_> = g
            .inputs(phi)
            .filter(|(_, e)| matches!(e.input, Name::PhiValue(_)))
            .map(|(_, e)| e.from)
            .collect();
        assert_eq!(moves.len(), 2);
        for m in moves {
            assert_eq!(g.op(m), &Op::Move);
            assert!(is_scheduled(&g, m));
        }
    }

    #[test]
    fn arguments_are_pinned() {
        let (mut g, mut blocks) = scheduled_max();
        let alloc = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap();
        for n in g.node_ids() {
            match g.op(n) {
                Op::Arg(0) => assert_eq!(alloc.register(n), Some(RSI)),
                Op::Arg(1) => assert_eq!(alloc.register(n), Some(RDX)),
                Op::SelfValue => assert_eq!(alloc.register(n), Some(RDI)),
                _ => {}
            }
        }
    }

    #[test]
    fn too_many_live_values_fail() {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(0));
        let fs = g.add(Op::FrameState(Box::new(FrameStateInfo {
            ip: 0,
            insns: Arc::from(Vec::new()),
            arity: 0,
            stack_depth: 9,
            locals: Vec::new(),
        })));
        for i in 0..9 {
            let c = g.add(Op::Constant(Value::Fixnum(i)));
            g.value(c, fs, Name::Stack(i as u32));
        }
        let guard = g.add(Op::Guard { test: Test::NotZero });
        let (start, finish) = (g.start, g.finish);
        g.control(start, guard);
        g.control(guard, finish);
        g.value(x, guard, Name::Condition);
        g.output_to(fs, Name::FrameState, guard, Name::FrameState);
        g.value(x, finish, Name::Value);

        let mut blocks = schedule(&mut g).unwrap();
        let err = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap_err();
        assert!(matches!(err, JitError::OutOfRegisters { available: 8, .. }));
    }

    #[test]
    fn sixth_argument_is_unsupported() {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(5));
        let (start, finish) = (g.start, g.finish);
        g.control(start, finish);
        g.value(x, finish, Name::Value);
        let mut blocks = schedule(&mut g).unwrap();
        let err = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap_err();
        assert!(matches!(err, JitError::Unsupported(_)));
    }

    /// `start → guard(x) → guard(y & 1) → finish(x)`, with every value
    /// floating.
    fn two_guards() -> (Graph, [NodeId; 8]) {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(0));
        let y = g.add(Op::Arg(1));
        let imm = g.add(Op::Immediate(1));
        let s = g.add(Op::Int64(IntOp::And));
        g.value(y, s, Name::Left);
        g.value(imm, s, Name::Right);
        let g1 = g.add(Op::Guard { test: Test::NotZero });
        let g2 = g.add(Op::Guard { test: Test::NotZero });
        let (start, finish) = (g.start, g.finish);
        g.control(start, g1);
        g.control(g1, g2);
        g.control(g2, finish);
        g.value(x, g1, Name::Condition);
        g.value(s, g2, Name::Condition);
        g.value(x, finish, Name::Value);
        (g, [start, x, g1, y, imm, s, g2, finish])
    }

    #[test]
    fn sequence_numbers_values_as_soon_as_their_inputs_are() {
        let (mut g, nodes) = two_guards();
        let [start, x, g1, y, imm, s, g2, finish] = nodes;
        let blocks = schedule(&mut g).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].nodes, nodes);

        let seq = sequence(&g, &blocks);
        let order = [start, x, y, imm, g1, s, g2, finish];
        for (i, n) in order.iter().enumerate() {
            assert_eq!(seq[n], i as u32, "{n} ({})", g.op(*n));
        }
        assert_ne!(seq[&y], 3);
    }

    #[test]
    fn ranges_run_from_producer_to_last_consumer() {
        let (mut g, [start, x, _, y, imm, s, g2, finish]) = two_guards();
        let mut blocks = schedule(&mut g).unwrap();
        let alloc = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap();
        assert_eq!(blocks[0].nodes[..4], [start, x, y, imm]);
        assert_eq!(blocks[0].nodes.last(), Some(&finish));

        let range = |n: NodeId| alloc.ranges.iter().find(|r| r.node == n).cloned().unwrap();
        // Pinned arguments live from the start up to their last reader:
        // `finish` (7) for x and the `and` (5) for y.
        assert_eq!((range(x).start, range(x).end), (0, 7));
        assert_eq!((range(y).start, range(y).end), (0, 5));
        assert_eq!(range(s).pinned, None);
        assert_eq!((range(s).start, range(s).end), (5, 6));
        assert!(alloc.ranges.iter().all(|r| r.node != imm));
        assert!(g.inputs(g2).any(|(_, e)| e.from == s));
        assert_eq!(alloc.register(x), Some(RSI));
        assert!(!matches!(alloc.register(s), Some(RSI | RDX) | None));
    }
}
