//! Turns the sea of nodes back into ordered basic blocks.
//!
//! Fixed nodes are numbered along control flow, every floating node is
//! anchored to the latest fixed node that dominates all of its uses, and
//! each block's residents are then chained in dependency order. The result
//! is recorded on the graph as `global_schedule` and `local_schedule` edges.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::{JitError, Result};
use crate::ir::{EdgeKind, Graph, Name, NodeId, Op};

/// A basic block: its resident nodes in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// First fixed node.
    pub leader: NodeId,
    /// Last fixed node.
    pub terminator: NodeId,
    pub nodes: Vec<NodeId>,
}

#[derive(Default)]
pub struct Scheduler {
    seq: HashMap<NodeId, u32>,
    anchor: HashMap<NodeId, NodeId>,
    dominators: HashMap<NodeId, HashSet<NodeId>>,
    blocks: Vec<Block>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of a fixed node after [`Self::partially_order`].
    pub fn seq(&self, n: NodeId) -> Option<u32> {
        self.seq.get(&n).copied()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Numbers fixed nodes: one more than the largest number among their
    /// control predecessors, 0 for nodes without any.
    pub fn partially_order(&mut self, graph: &Graph) {
        let fixed: Vec<NodeId> = graph
            .node_ids()
            .into_iter()
            .filter(|n| graph.is_fixed(*n))
            .collect();
        let mut pending: HashMap<NodeId, usize> = fixed
            .iter()
            .map(|n| (*n, graph.predecessors(*n).len()))
            .collect();
        let mut queue: VecDeque<NodeId> = fixed
            .iter()
            .copied()
            .filter(|n| pending[n] == 0)
            .collect();

        self.seq.clear();
        self.dominators.clear();
        while let Some(n) = queue.pop_front() {
            let preds = graph.predecessors(n);
            let seq = preds
                .iter()
                .filter_map(|(_, p)| self.seq.get(p))
                .max()
                .map_or(0, |s| s + 1);
            self.seq.insert(n, seq);

            // Control flow is acyclic, so one pass in topological order
            // computes dominators exactly.
            let mut dom: Option<HashSet<NodeId>> = None;
            for (_, p) in &preds {
                let pd = &self.dominators[p];
                dom = Some(match dom {
                    None => pd.clone(),
                    Some(d) => d.intersection(pd).copied().collect(),
                });
            }
            let mut dom = dom.unwrap_or_default();
            dom.insert(n);
            self.dominators.insert(n, dom);

            for (_, s) in graph.successors(n) {
                if let Some(count) = pending.get_mut(&s) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(s);
                    }
                }
            }
        }
        debug!(fixed = self.seq.len(), "partially ordered");
    }

    fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        self.dominators.get(&b).is_some_and(|d| d.contains(&a))
    }

    /// Where a use of some value by `consumer` through `input` happens.
    fn use_site(&self, graph: &Graph, consumer: NodeId, input: Name) -> Option<NodeId> {
        match (graph.op(consumer), input) {
            (Op::Phi, Name::PhiValue(t)) => {
                let merge = graph.input(consumer, Name::Switch)?;
                graph.merge_case_source(merge, t)
            }
            _ if graph.is_fixed(consumer) => Some(consumer),
            _ => self.anchor.get(&consumer).copied(),
        }
    }

    /// Fixed nodes whose results `n` depends on, looking through floating
    /// producers. A phi stands for its merge.
    fn fixed_producers(&self, graph: &Graph, n: NodeId) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut stack = vec![n];
        while let Some(m) = stack.pop() {
            for (_, e) in graph.inputs(m) {
                if e.kind == EdgeKind::Schedule || !seen.insert(e.from) {
                    continue;
                }
                let from = e.from;
                if graph.is_fixed(from) {
                    out.insert(from);
                } else if matches!(graph.op(from), Op::Phi) {
                    if let Some(merge) = graph.input(from, Name::Switch) {
                        out.insert(merge);
                    }
                } else {
                    stack.push(from);
                }
            }
        }
        out
    }

    fn reaches(
        graph: &Graph,
        from: NodeId,
        to: NodeId,
        memo: &mut HashMap<NodeId, HashSet<NodeId>>,
    ) -> bool {
        let set = memo.entry(from).or_insert_with(|| {
            let mut seen = HashSet::from([from]);
            let mut stack = vec![from];
            while let Some(n) = stack.pop() {
                for (_, s) in graph.successors(n) {
                    if seen.insert(s) {
                        stack.push(s);
                    }
                }
            }
            seen
        });
        set.contains(&to)
    }

    /// Anchors every floating node to a fixed node with a `global_schedule`
    /// edge. A node is placed only after all of its consumers are, at the
    /// latest fixed node that dominates every use and is reachable from
    /// every fixed producer.
    pub fn global_schedule(&mut self, graph: &mut Graph) -> Result<()> {
        self.anchor.clear();
        let mut floating = Vec::new();
        for n in graph.node_ids() {
            if graph.is_fixed(n) {
                continue;
            }
            if matches!(graph.op(n), Op::Phi) {
                let merge = graph
                    .input(n, Name::Switch)
                    .unwrap_or_else(|| panic!("{n} (phi) has no merge"));
                self.anchor.insert(n, merge);
            } else {
                floating.push(n);
            }
        }

        let fixed: Vec<NodeId> = {
            let mut v: Vec<NodeId> = self.seq.keys().copied().collect();
            v.sort_by_key(|n| (self.seq[n], *n));
            v
        };
        let mut reach = HashMap::new();

        while !floating.is_empty() {
            let ready = floating.iter().position(|n| {
                graph
                    .users(*n)
                    .iter()
                    .map(|e| graph.edge(*e))
                    .all(|e| graph.is_fixed(e.to) || self.anchor.contains_key(&e.to))
            });
            let Some(i) = ready else {
                return Err(JitError::Stuck(floating.iter().map(|n| n.index()).collect()));
            };
            let n = floating.swap_remove(i);

            let mut sites = Vec::new();
            for e in graph.users(n) {
                let e = graph.edge(e);
                match self.use_site(graph, e.to, e.input) {
                    Some(site) => sites.push(site),
                    None => return Err(JitError::Stuck(vec![n.index()])),
                }
            }
            let producers = self.fixed_producers(graph, n);

            let best = fixed.iter().rev().copied().find(|c| {
                sites.iter().all(|s| self.dominates(*c, *s))
                    && producers.iter().all(|p| Self::reaches(graph, *p, *c, &mut reach))
            });
            let Some(anchor) = best else {
                return Err(JitError::Stuck(vec![n.index()]));
            };
            self.anchor.insert(n, anchor);
        }

        for (n, anchor) in &self.anchor {
            graph.output_to(*anchor, Name::GlobalSchedule, *n, Name::GlobalSchedule);
        }
        debug!(floating = self.anchor.len(), "globally scheduled");
        Ok(())
    }

    /// Splits the fixed nodes into basic blocks, in control order.
    fn fixed_blocks(&self, graph: &Graph) -> Vec<Vec<NodeId>> {
        let is_leader = |n: NodeId| {
            n == graph.start
                || matches!(graph.op(n), Op::Merge)
                || graph
                    .inputs(n)
                    .any(|(_, e)| matches!(e.output, Name::Branch(_)))
        };
        let mut leaders: Vec<NodeId> = self.seq.keys().copied().filter(|n| is_leader(*n)).collect();
        leaders.sort_by_key(|n| (self.seq[n], *n));

        leaders
            .into_iter()
            .map(|leader| {
                let mut block = vec![leader];
                let mut n = leader;
                loop {
                    if matches!(graph.op(n), Op::Branch { .. } | Op::Finish) {
                        break;
                    }
                    let succs = graph.successors(n);
                    match succs.as_slice() {
                        [(_, next)] if !is_leader(*next) => {
                            block.push(*next);
                            n = *next;
                        }
                        _ => break,
                    }
                }
                block
            })
            .collect()
    }

    /// Orders each block's residents and chains them with `local_schedule`
    /// edges.
    pub fn local_schedule(&mut self, graph: &mut Graph) -> &[Block] {
        let fixed_blocks = self.fixed_blocks(graph);
        let block_of: HashMap<NodeId, usize> = fixed_blocks
            .iter()
            .enumerate()
            .flat_map(|(i, b)| b.iter().map(move |n| (*n, i)))
            .collect();

        let mut residents: Vec<BTreeSet<NodeId>> = vec![BTreeSet::new(); fixed_blocks.len()];
        for (n, anchor) in &self.anchor {
            if let Some(b) = block_of.get(anchor) {
                residents[*b].insert(*n);
            }
        }

        self.blocks.clear();
        for (fixed, floating) in fixed_blocks.into_iter().zip(residents) {
            let mut order = Vec::new();
            let mut placed = HashSet::new();
            for f in &fixed {
                place(graph, *f, &floating, &mut placed, &mut order);
            }
            let leftovers: Vec<NodeId> = floating
                .iter()
                .copied()
                .filter(|n| !placed.contains(n))
                .collect();
            let mut tail = Vec::new();
            for n in leftovers {
                place(graph, n, &floating, &mut placed, &mut tail);
            }
            let terminator = *fixed.last().expect("blocks are never empty");
            if produces_value(graph.op(terminator)) {
                order.extend(tail);
            } else {
                let at = order.len() - 1;
                order.splice(at..at, tail);
            }

            for pair in order.windows(2) {
                graph.output_to(pair[0], Name::LocalSchedule, pair[1], Name::LocalSchedule);
            }
            self.blocks.push(Block {
                leader: fixed[0],
                terminator,
                nodes: order,
            });
        }
        debug!(blocks = self.blocks.len(), "locally scheduled");
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }
}

/// Appends `n` to `order`, after whichever of its floating producers in
/// `residents` are not placed yet.
fn place(
    graph: &Graph,
    n: NodeId,
    residents: &BTreeSet<NodeId>,
    placed: &mut HashSet<NodeId>,
    order: &mut Vec<NodeId>,
) {
    if !placed.insert(n) {
        return;
    }
    let producers: Vec<NodeId> = graph
        .inputs(n)
        .filter(|(_, e)| matches!(e.kind, EdgeKind::Data | EdgeKind::FrameState))
        .map(|(_, e)| e.from)
        .filter(|p| residents.contains(p))
        .collect();
    for p in producers {
        place(graph, p, residents, placed, order);
    }
    order.push(n);
}

/// Whether a node's result occupies a register.
pub fn produces_value(op: &Op) -> bool {
    matches!(
        op,
        Op::Arg(_)
            | Op::SelfValue
            | Op::Constant(_)
            | Op::Int64(_)
            | Op::CallManaged { .. }
            | Op::Send(_)
            | Op::Phi
            | Op::Move
    )
}

/// Whether a node has a place in the schedule: fixed, or carrying a
/// schedule edge.
pub fn is_scheduled(graph: &Graph, n: NodeId) -> bool {
    graph.is_fixed(n) || graph.inputs(n).any(|(_, e)| e.kind == EdgeKind::Schedule)
}

/// Runs all three scheduling steps.
pub fn schedule(graph: &mut Graph) -> Result<Vec<Block>> {
    let mut scheduler = Scheduler::new();
    scheduler.partially_order(graph);
    scheduler.global_schedule(graph)?;
    scheduler.local_schedule(graph);
    Ok(scheduler.into_blocks())
}
