//! Turns a flat instruction list into a graph by abstract interpretation of
//! the operand stack.
//!
//! Only forward branches are accepted, so blocks can be visited in
//! instruction order and every predecessor of a block is built before the
//! block itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::bytecode::Insn;
use crate::error::{JitError, Result};
use crate::ir::{FrameStateInfo, Graph, Name, NodeId, Op, SendSite, Test};
use crate::profile::Profile;
use crate::value::Value;

#[derive(Debug, Clone, Default)]
struct State {
    stack: Vec<NodeId>,
    locals: BTreeMap<String, NodeId>,
}

/// A control edge waiting for the block it enters.
struct Incoming {
    tail: NodeId,
    output: Name,
    state: State,
}

struct Builder<'a> {
    graph: Graph,
    insns: Arc<[Insn]>,
    arity: usize,
    profile: Option<&'a Profile>,
    receiver: Option<NodeId>,
    args: Vec<Option<NodeId>>,
    incoming: BTreeMap<usize, Vec<Incoming>>,
    returns: Vec<(NodeId, Name, NodeId)>,
}

/// Builds the graph for a method taking `arity` arguments.
pub fn build(insns: &[Insn], arity: usize, profile: Option<&Profile>) -> Result<Graph> {
    validate(insns, arity)?;
    let mut b = Builder {
        graph: Graph::new(),
        insns: insns.into(),
        arity,
        profile,
        receiver: None,
        args: vec![None; arity],
        incoming: BTreeMap::new(),
        returns: Vec::new(),
    };
    let start = b.graph.start;
    b.incoming.insert(
        0,
        vec![Incoming {
            tail: start,
            output: Name::Control,
            state: State::default(),
        }],
    );

    let leaders = leaders(insns);
    let bounds: Vec<usize> = leaders.iter().copied().chain([insns.len()]).collect();
    for pair in bounds.windows(2) {
        b.block(pair[0], pair[1])?;
    }
    b.finish()?;
    debug!(insns = insns.len(), nodes = b.graph.len(), "built graph");
    Ok(b.graph)
}

fn validate(insns: &[Insn], arity: usize) -> Result<()> {
    if insns.is_empty() {
        return Err(JitError::Malformed {
            ip: 0,
            reason: "empty listing".into(),
        });
    }
    for (ip, insn) in insns.iter().enumerate() {
        if let Some(target) = insn.branch_target() {
            if target >= insns.len() {
                return Err(JitError::InvalidBranchTarget { ip, target });
            }
            if target <= ip {
                return Err(JitError::Unsupported(format!(
                    "backward branch from {ip} to {target}"
                )));
            }
        }
        if let Insn::Arg(n) = insn {
            if *n >= arity {
                return Err(JitError::Malformed {
                    ip,
                    reason: format!("argument {n} of a method taking {arity}"),
                });
            }
        }
    }
    Ok(())
}

fn leaders(insns: &[Insn]) -> BTreeSet<usize> {
    let mut leaders = BTreeSet::from([0]);
    for (ip, insn) in insns.iter().enumerate() {
        if let Some(target) = insn.branch_target() {
            leaders.insert(target);
        }
        if matches!(insn, Insn::Branch(_) | Insn::BranchIf(_) | Insn::Return) && ip + 1 < insns.len()
        {
            leaders.insert(ip + 1);
        }
    }
    leaders
}

impl Builder<'_> {
    fn receiver(&mut self) -> NodeId {
        *self
            .receiver
            .get_or_insert_with(|| self.graph.add(Op::SelfValue))
    }

    fn arg(&mut self, n: usize) -> NodeId {
        if let Some(id) = self.args[n] {
            return id;
        }
        let id = self.graph.add(Op::Arg(n as u32));
        self.args[n] = Some(id);
        id
    }

    fn constant(&mut self, value: Value) -> NodeId {
        self.graph.add(Op::Constant(value))
    }

    fn block(&mut self, first: usize, end: usize) -> Result<()> {
        let Some(incoming) = self.incoming.remove(&first) else {
            debug!(ip = first, "skipping unreachable block");
            return Ok(());
        };
        let Incoming {
            mut tail,
            mut output,
            mut state,
        } = self.join(first, incoming)?;

        let insns = self.insns.clone();
        for ip in first..end {
            let pop = |state: &mut State| state.stack.pop().ok_or(JitError::StackUnderflow(ip));
            match &insns[ip] {
                Insn::Arg(n) => {
                    let id = self.arg(*n);
                    state.stack.push(id);
                }
                Insn::SelfValue => {
                    let id = self.receiver();
                    state.stack.push(id);
                }
                Insn::Load(name) => {
                    let id = match state.locals.get(name) {
                        Some(id) => *id,
                        None => self.constant(Value::Nil),
                    };
                    state.stack.push(id);
                }
                Insn::Store(name) => {
                    let value = pop(&mut state)?;
                    state.locals.insert(name.clone(), value);
                }
                Insn::Push(value) => {
                    let id = self.constant(value.clone());
                    state.stack.push(id);
                }
                Insn::Send { name, argc } => {
                    let send = self.send(ip, name, *argc, &mut state, tail, output)?;
                    (tail, output) = (send, Name::Control);
                }
                Insn::Branch(target) => {
                    self.enter(*target, tail, output, state);
                    return Ok(());
                }
                Insn::BranchIf(target) => {
                    let condition = pop(&mut state)?;
                    let branch = self.graph.add(Op::Branch {
                        test: Test::NotZero,
                        uncommon: None,
                    });
                    self.graph.output_to(tail, output, branch, Name::Control);
                    self.graph.value(condition, branch, Name::Condition);
                    self.enter(*target, branch, Name::Branch(true), state.clone());
                    self.enter(ip + 1, branch, Name::Branch(false), state);
                    return Ok(());
                }
                // Only a `not` that a branch consumes right away stays a
                // node of its own; lowering folds it into the branch test.
                Insn::Not if ip + 1 < end && matches!(insns[ip + 1], Insn::BranchIf(_)) => {
                    let value = pop(&mut state)?;
                    let not = self.graph.add(Op::Not);
                    self.graph.value(value, not, Name::Value);
                    state.stack.push(not);
                }
                Insn::Not => {
                    let send = self.send(ip, "!", 0, &mut state, tail, output)?;
                    (tail, output) = (send, Name::Control);
                }
                Insn::Trace(line) => {
                    let trace = self.graph.add(Op::Trace { line: *line });
                    self.graph.output_to(tail, output, trace, Name::Control);
                    (tail, output) = (trace, Name::Control);
                }
                Insn::Return => {
                    let value = pop(&mut state)?;
                    self.returns.push((tail, output, value));
                    return Ok(());
                }
            }
        }

        if end == self.insns.len() {
            return Err(JitError::Malformed {
                ip: end - 1,
                reason: "execution falls off the end of the listing".into(),
            });
        }
        self.enter(end, tail, output, state);
        Ok(())
    }

    /// Chains a send of `name` to the top `argc + 1` stack slots after
    /// `tail` and leaves its result on the stack.
    fn send(
        &mut self,
        ip: usize,
        name: &str,
        argc: usize,
        state: &mut State,
        tail: NodeId,
        output: Name,
    ) -> Result<NodeId> {
        if state.stack.len() < argc + 1 {
            return Err(JitError::StackUnderflow(ip));
        }
        let frame_state = self.frame_state(ip, state);
        let mut site = SendSite::new(name, argc as u32);
        site.profile = self.profile.and_then(|p| p.site(ip)).cloned();
        let send = self.graph.add(Op::Send(Box::new(site)));
        let args = state.stack.split_off(state.stack.len() - argc);
        let receiver = state.stack.pop().ok_or(JitError::StackUnderflow(ip))?;
        self.graph.value(receiver, send, Name::Receiver);
        for (i, arg) in args.into_iter().enumerate() {
            self.graph.value(arg, send, Name::Arg(i as u32));
        }
        self.graph
            .output_to(frame_state, Name::FrameState, send, Name::FrameState);
        self.graph.output_to(tail, output, send, Name::Control);
        state.stack.push(send);
        Ok(send)
    }

    fn enter(&mut self, target: usize, tail: NodeId, output: Name, state: State) {
        self.incoming.entry(target).or_default().push(Incoming {
            tail,
            output,
            state,
        });
    }

    /// A control tail that may feed a merge: branch outputs go through a
    /// connector first.
    fn mergeable(&mut self, tail: NodeId, output: Name) -> NodeId {
        if let Name::Branch(_) = output {
            let conn = self.graph.add(Op::Connector);
            self.graph.output_to(tail, output, conn, Name::Control);
            conn
        } else {
            tail
        }
    }

    /// One value per predecessor, collapsed when they agree.
    fn phi(&mut self, merge: NodeId, values: &[NodeId]) -> NodeId {
        if values.iter().all(|v| *v == values[0]) {
            return values[0];
        }
        let phi = self.graph.add(Op::Phi);
        self.graph.output_to(merge, Name::Switch, phi, Name::Switch);
        for (case, v) in values.iter().enumerate() {
            self.graph.value(*v, phi, Name::PhiValue(case as u32));
        }
        phi
    }

    fn join(&mut self, ip: usize, mut incoming: Vec<Incoming>) -> Result<Incoming> {
        if incoming.len() == 1 {
            return Ok(incoming.remove(0));
        }
        let depth = incoming[0].state.stack.len();
        if incoming.iter().any(|i| i.state.stack.len() != depth) {
            return Err(JitError::Malformed {
                ip,
                reason: "operand stack heights differ where control flow joins".into(),
            });
        }

        let merge = self.graph.add(Op::Merge);
        for (case, inc) in incoming.iter().enumerate() {
            let tail = self.mergeable(inc.tail, inc.output);
            self.graph
                .output_to(tail, Name::Control, merge, Name::Case(case as u32));
        }

        let mut state = State::default();
        for slot in 0..depth {
            let values: Vec<NodeId> = incoming.iter().map(|i| i.state.stack[slot]).collect();
            let id = self.phi(merge, &values);
            state.stack.push(id);
        }
        let names: BTreeSet<String> = incoming
            .iter()
            .flat_map(|i| i.state.locals.keys().cloned())
            .collect();
        for name in names {
            let mut values = Vec::with_capacity(incoming.len());
            for inc in &incoming {
                let id = match inc.state.locals.get(&name) {
                    Some(id) => *id,
                    None => self.constant(Value::Nil),
                };
                values.push(id);
            }
            let id = self.phi(merge, &values);
            state.locals.insert(name, id);
        }
        Ok(Incoming {
            tail: merge,
            output: Name::Control,
            state,
        })
    }

    /// Interpreter state just before the instruction at `ip` executes.
    fn frame_state(&mut self, ip: usize, state: &State) -> NodeId {
        let info = FrameStateInfo {
            ip,
            insns: self.insns.clone(),
            arity: self.arity as u32,
            stack_depth: state.stack.len() as u32,
            locals: state.locals.keys().cloned().collect(),
        };
        let fs = self.graph.add(Op::FrameState(Box::new(info)));
        let receiver = self.receiver();
        self.graph.value(receiver, fs, Name::Receiver);
        for n in 0..self.arity {
            let arg = self.arg(n);
            self.graph.value(arg, fs, Name::Arg(n as u32));
        }
        for (i, v) in state.stack.iter().enumerate() {
            self.graph.value(*v, fs, Name::Stack(i as u32));
        }
        for (i, v) in state.locals.values().enumerate() {
            self.graph.value(*v, fs, Name::Local(i as u32));
        }
        fs
    }

    fn finish(&mut self) -> Result<()> {
        let finish = self.graph.finish;
        let returns = std::mem::take(&mut self.returns);
        match returns.as_slice() {
            [] => Err(JitError::Malformed {
                ip: 0,
                reason: "no reachable return".into(),
            }),
            [(tail, output, value)] => {
                self.graph.output_to(*tail, *output, finish, Name::Control);
                self.graph.value(*value, finish, Name::Value);
                Ok(())
            }
            _ => {
                let merge = self.graph.add(Op::Merge);
                for (case, (tail, output, _)) in returns.iter().enumerate() {
                    let tail = self.mergeable(*tail, *output);
                    self.graph
                        .output_to(tail, Name::Control, merge, Name::Case(case as u32));
                }
                let values: Vec<NodeId> = returns.iter().map(|(_, _, v)| *v).collect();
                let value = self.phi(merge, &values);
                self.graph.control(merge, finish);
                self.graph.value(value, finish, Name::Value);
                Ok(())
            }
        }
    }
}
