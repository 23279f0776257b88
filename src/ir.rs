//! Sea-of-nodes intermediate representation.
//!
//! Nodes live in an arena and are referenced by stable [`Id`]s. Edges live
//! in a second arena; every node owns only the lists of edge ids that enter
//! and leave it. An edge carries two names, one as seen by the producer and
//! one as seen by the consumer, and its [`EdgeKind`] is derived from those
//! names when it is created.
//!
//! Order is never stored on nodes: a node is *fixed* when it has a control
//! edge and *floating* otherwise.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::bytecode::Insn;
use crate::profile::SiteProfile;
use crate::value::{Kind, Value, wrap_fixnum};

// ─── Arena and ID types ─────────────────────────────────────────────────────

/// Typed index into an [`Arena`].
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

// Manual impls so Id<T> does not inherit T's bounds.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.index)
    }
}

impl<T> Id<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// The raw index into the arena.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Vec-backed arena whose slots can be vacated. Ids are never reused.
pub struct Arena<T> {
    items: Vec<Option<T>>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            live: 0,
        }
    }

    pub fn push(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(Some(item));
        self.live += 1;
        id
    }

    pub fn remove(&mut self, id: Id<T>) -> Option<T> {
        let item = self.items.get_mut(id.index())?.take();
        if item.is_some() {
            self.live -= 1;
        }
        item
    }

    pub fn contains(&self, id: Id<T>) -> bool {
        matches!(self.items.get(id.index()), Some(Some(_)))
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.index())?.as_ref()
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_ref().map(|item| (Id::new(i as u32), item)))
    }

    pub fn ids(&self) -> Vec<Id<T>> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        match self.items.get(id.index()) {
            Some(Some(item)) => item,
            _ => panic!("stale id {id}"),
        }
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        match self.items.get_mut(id.index()) {
            Some(Some(item)) => item,
            _ => panic!("stale id {id}"),
        }
    }
}

// ─── Type aliases ───────────────────────────────────────────────────────────

pub type NodeId = Id<Node>;
pub type EdgeId = Id<Edge>;

// ─── Operations ─────────────────────────────────────────────────────────────

/// Zero test applied to a branch or guard condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Test {
    Zero,
    NotZero,
}

impl Test {
    pub fn negate(self) -> Test {
        match self {
            Test::Zero => Test::NotZero,
            Test::NotZero => Test::Zero,
        }
    }

    pub fn holds(self, word: i64) -> bool {
        match self {
            Test::Zero => word == 0,
            Test::NotZero => word != 0,
        }
    }
}

impl fmt::Display for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Test::Zero => f.write_str("zero?"),
            Test::NotZero => f.write_str("not_zero?"),
        }
    }
}

/// Fixnum arithmetic on tagged operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arith {
    Add,
    Sub,
    Mul,
}

impl Arith {
    pub fn from_method(name: &str) -> Option<Arith> {
        match name {
            "+" => Some(Arith::Add),
            "-" => Some(Arith::Sub),
            "*" => Some(Arith::Mul),
            _ => None,
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            Arith::Add => "+",
            Arith::Sub => "-",
            Arith::Mul => "*",
        }
    }

    /// Fixnum semantics: wraps to the 63 bits a tagged word can hold.
    pub fn apply(self, a: i64, b: i64) -> i64 {
        let r = match self {
            Arith::Add => a.wrapping_add(b),
            Arith::Sub => a.wrapping_sub(b),
            Arith::Mul => a.wrapping_mul(b),
        };
        wrap_fixnum(r)
    }

    pub fn int_op(self) -> IntOp {
        match self {
            Arith::Add => IntOp::Add,
            Arith::Sub => IntOp::Sub,
            Arith::Mul => IntOp::Mul,
        }
    }
}

/// Raw 64-bit integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    ShiftLeft,
    ShiftRight,
}

impl IntOp {
    pub fn name(self) -> &'static str {
        match self {
            IntOp::Add => "int64_add",
            IntOp::Sub => "int64_sub",
            IntOp::Mul => "int64_mul",
            IntOp::And => "int64_and",
            IntOp::ShiftLeft => "int64_shift_left",
            IntOp::ShiftRight => "int64_shift_right",
        }
    }
}

/// A dynamic method call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SendSite {
    pub name: String,
    pub argc: u32,
    /// Set when an inline cache has established the receiver's kind.
    pub receiver_kind: Option<Kind>,
    /// Generic dispatch; never specialised further.
    pub megamorphic: bool,
    pub profile: Option<SiteProfile>,
}

impl SendSite {
    pub fn new(name: &str, argc: u32) -> Self {
        Self {
            name: name.to_string(),
            argc,
            receiver_kind: None,
            megamorphic: false,
            profile: None,
        }
    }

    pub fn megamorphic(name: &str, argc: u32) -> Self {
        Self {
            megamorphic: true,
            ..Self::new(name, argc)
        }
    }
}

/// Where to resume the interpreter. The node's inputs supply the receiver,
/// `arity` arguments, `stack_depth` operand stack slots and one value per
/// entry of `locals`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameStateInfo {
    pub ip: usize,
    pub insns: Arc<[Insn]>,
    pub arity: u32,
    pub stack_depth: u32,
    pub locals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    Finish,
    Merge,
    /// Control pass-through; keeps a branch from feeding a merge directly.
    Connector,
    /// `uncommon` names the successor the profile never took.
    Branch {
        test: Test,
        uncommon: Option<bool>,
    },
    Guard {
        test: Test,
    },
    Phi,
    Trace {
        line: u32,
    },
    Arg(u32),
    SelfValue,
    Constant(Value),
    /// A raw machine integer operand, never a managed value.
    Immediate(i64),
    Send(Box<SendSite>),
    Not,
    KindIs(Kind),
    IsTaggedFixnum,
    IsTruthy,
    Fixnum(Arith),
    Tag,
    Untag,
    Int64(IntOp),
    Int64Zero,
    Int64NotZero,
    CallManaged {
        argc: u32,
    },
    FrameState(Box<FrameStateInfo>),
    Move,
}

impl Op {
    pub fn is_phi(&self) -> bool {
        matches!(self, Op::Phi)
    }

    /// Predicates that produce a raw 0/non-0 word rather than a managed boolean.
    pub fn is_native_condition(&self) -> bool {
        matches!(
            self,
            Op::IsTaggedFixnum | Op::IsTruthy | Op::Int64Zero | Op::Int64NotZero
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Start => f.write_str("start"),
            Op::Finish => f.write_str("finish"),
            Op::Merge => f.write_str("merge"),
            Op::Connector => f.write_str("connector"),
            Op::Branch { test, uncommon } => match uncommon {
                Some(side) => write!(f, "branch({test}, uncommon: {side})"),
                None => write!(f, "branch({test})"),
            },
            Op::Guard { test } => write!(f, "guard({test})"),
            Op::Phi => f.write_str("phi"),
            Op::Trace { line } => write!(f, "trace({line})"),
            Op::Arg(n) => write!(f, "arg({n})"),
            Op::SelfValue => f.write_str("self"),
            Op::Constant(v) => write!(f, "constant({v})"),
            Op::Immediate(n) => write!(f, "immediate({n})"),
            Op::Send(site) => {
                write!(f, "send(:{}, {}", site.name, site.argc)?;
                if site.megamorphic {
                    f.write_str(", megamorphic")?;
                }
                if let Some(kind) = site.receiver_kind {
                    write!(f, ", {kind}")?;
                }
                f.write_str(")")
            }
            Op::Not => f.write_str("not"),
            Op::KindIs(kind) => write!(f, "kind_is?({kind})"),
            Op::IsTaggedFixnum => f.write_str("is_tagged_fixnum?"),
            Op::IsTruthy => f.write_str("is_truthy?"),
            Op::Fixnum(Arith::Add) => f.write_str("fixnum_add"),
            Op::Fixnum(Arith::Sub) => f.write_str("fixnum_sub"),
            Op::Fixnum(Arith::Mul) => f.write_str("fixnum_mul"),
            Op::Tag => f.write_str("tag"),
            Op::Untag => f.write_str("untag"),
            Op::Int64(op) => f.write_str(op.name()),
            Op::Int64Zero => f.write_str("int64_zero?"),
            Op::Int64NotZero => f.write_str("int64_not_zero?"),
            Op::CallManaged { argc } => write!(f, "call_managed({argc})"),
            Op::FrameState(info) => write!(f, "frame_state(ip {})", info.ip),
            Op::Move => f.write_str("move"),
        }
    }
}

// ─── Edges ──────────────────────────────────────────────────────────────────

/// The name of one end of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Name {
    Control,
    /// Output of a branch: `control(true)` / `control(false)`.
    Branch(bool),
    /// Input of a merge, one per predecessor.
    Case(u32),
    Value,
    Receiver,
    Arg(u32),
    Left,
    Right,
    Condition,
    Switch,
    /// Phi input fed through merge case `n`.
    PhiValue(u32),
    Stack(u32),
    Local(u32),
    MethodName,
    FrameState,
    GlobalSchedule,
    LocalSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Control,
    Data,
    Schedule,
    FrameState,
}

impl Name {
    pub fn kind(self) -> EdgeKind {
        match self {
            Name::Control | Name::Branch(_) | Name::Case(_) => EdgeKind::Control,
            Name::FrameState => EdgeKind::FrameState,
            Name::GlobalSchedule | Name::LocalSchedule => EdgeKind::Schedule,
            _ => EdgeKind::Data,
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Control => f.write_str("control"),
            Name::Branch(side) => write!(f, "control({side})"),
            Name::Case(n) => write!(f, "control({n})"),
            Name::Value => f.write_str("value"),
            Name::Receiver => f.write_str("receiver"),
            Name::Arg(n) => write!(f, "arg({n})"),
            Name::Left => f.write_str("left"),
            Name::Right => f.write_str("right"),
            Name::Condition => f.write_str("condition"),
            Name::Switch => f.write_str("switch"),
            Name::PhiValue(n) => write!(f, "value({n})"),
            Name::Stack(n) => write!(f, "stack({n})"),
            Name::Local(n) => write!(f, "local({n})"),
            Name::MethodName => f.write_str("name"),
            Name::FrameState => f.write_str("frame_state"),
            Name::GlobalSchedule => f.write_str("global_schedule"),
            Name::LocalSchedule => f.write_str("local_schedule"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub output: Name,
    pub to: NodeId,
    pub input: Name,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<EdgeId>,
    pub outputs: Vec<EdgeId>,
}

/// How [`Graph::replace`] reconnects the edges of the node it removes.
#[derive(Debug, Default)]
pub struct Replacement {
    /// Receives the old node's control inputs.
    pub start: Option<NodeId>,
    /// Feeds the old node's control outputs.
    pub finish: Option<NodeId>,
    /// `(old input name, consumer, consumer input name)`: each data or
    /// frame-state input of the old node is fed to every listed consumer.
    pub users: Vec<(Name, NodeId, Name)>,
    /// Produces what the old node produced.
    pub value: Option<NodeId>,
}

// ─── Graph ──────────────────────────────────────────────────────────────────

pub struct Graph {
    nodes: Arena<Node>,
    edges: Arena<Edge>,
    pub start: NodeId,
    pub finish: NodeId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut nodes = Arena::new();
        let start = nodes.push(Node {
            op: Op::Start,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        let finish = nodes.push(Node {
            op: Op::Finish,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        Self {
            nodes,
            edges: Arena::new(),
            start,
            finish,
        }
    }

    pub fn add(&mut self, op: Op) -> NodeId {
        self.nodes.push(Node {
            op,
            inputs: Vec::new(),
            outputs: Vec::new(),
        })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn op(&self, id: NodeId) -> &Op {
        &self.nodes[id].op
    }

    /// Changes a node's operation in place, keeping its edges.
    pub fn set_op(&mut self, id: NodeId, op: Op) {
        self.nodes[id].op = op;
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Every live node, in id order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.ids()
    }

    /// Creates an edge `from.output → to.input`.
    ///
    /// Panics on self loops, on names that disagree about the edge kind, and
    /// on phi inputs not named `value(n)` or `switch`.
    pub fn output_to(&mut self, from: NodeId, output: Name, to: NodeId, input: Name) -> EdgeId {
        assert_ne!(from, to, "self loop on {from} ({output} → {input})");
        assert!(self.contains(from) && self.contains(to), "edge to a removed node");
        let kind = output.kind();
        assert_eq!(
            kind,
            input.kind(),
            "edge {from}.{output} → {to}.{input} mixes edge kinds"
        );
        let to_phi = self.op(to).is_phi();
        if kind != EdgeKind::Schedule {
            assert!(
                !to_phi || matches!(input, Name::PhiValue(_) | Name::Switch),
                "phi input {to}.{input} must be value(n) or switch"
            );
            assert!(
                to_phi || !matches!(input, Name::PhiValue(_) | Name::Switch),
                "{input} input on non-phi {to}"
            );
        }
        let id = self.edges.push(Edge {
            from,
            output,
            to,
            input,
            kind,
        });
        self.nodes[from].outputs.push(id);
        self.nodes[to].inputs.push(id);
        id
    }

    /// `from.control → to.control`.
    pub fn control(&mut self, from: NodeId, to: NodeId) -> EdgeId {
        self.output_to(from, Name::Control, to, Name::Control)
    }

    /// `from.value → to.input`.
    pub fn value(&mut self, from: NodeId, to: NodeId, input: Name) -> EdgeId {
        self.output_to(from, Name::Value, to, input)
    }

    pub fn remove_edge(&mut self, id: EdgeId) {
        let Some(edge) = self.edges.remove(id) else {
            return;
        };
        if let Some(node) = self.nodes.items.get_mut(edge.from.index()).and_then(Option::as_mut) {
            node.outputs.retain(|e| *e != id);
        }
        if let Some(node) = self.nodes.items.get_mut(edge.to.index()).and_then(Option::as_mut) {
            node.inputs.retain(|e| *e != id);
        }
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) {
        if !self.contains(id) {
            return;
        }
        let node = &self.nodes[id];
        let edges: Vec<EdgeId> = node.inputs.iter().chain(&node.outputs).copied().collect();
        for e in edges {
            self.remove_edge(e);
        }
        self.nodes.remove(id);
    }

    pub fn inputs(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.nodes[id].inputs.iter().map(|e| (*e, &self.edges[*e]))
    }

    pub fn outputs(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.nodes[id].outputs.iter().map(|e| (*e, &self.edges[*e]))
    }

    pub fn input_edge(&self, id: NodeId, name: Name) -> Option<EdgeId> {
        self.inputs(id).find(|(_, e)| e.input == name).map(|(e, _)| e)
    }

    /// The node feeding input `name`.
    pub fn input(&self, id: NodeId, name: Name) -> Option<NodeId> {
        self.inputs(id).find(|(_, e)| e.input == name).map(|(_, e)| e.from)
    }

    /// `(input name, source)` of every control input.
    pub fn predecessors(&self, id: NodeId) -> Vec<(Name, NodeId)> {
        self.inputs(id)
            .filter(|(_, e)| e.kind == EdgeKind::Control)
            .map(|(_, e)| (e.input, e.from))
            .collect()
    }

    /// `(output name, target)` of every control output.
    pub fn successors(&self, id: NodeId) -> Vec<(Name, NodeId)> {
        self.outputs(id)
            .filter(|(_, e)| e.kind == EdgeKind::Control)
            .map(|(_, e)| (e.output, e.to))
            .collect()
    }

    /// The successor reached through output `name`.
    pub fn successor(&self, id: NodeId, name: Name) -> Option<NodeId> {
        self.successors(id)
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, to)| to)
    }

    /// The single control predecessor of a node that is not a merge.
    pub fn control_pred(&self, id: NodeId) -> Option<NodeId> {
        let preds = self.predecessors(id);
        assert!(preds.len() <= 1, "{id} ({}) has {} control inputs", self.op(id), preds.len());
        preds.first().map(|(_, from)| *from)
    }

    /// Outgoing data and frame-state edges.
    pub fn users(&self, id: NodeId) -> Vec<EdgeId> {
        self.outputs(id)
            .filter(|(_, e)| matches!(e.kind, EdgeKind::Data | EdgeKind::FrameState))
            .map(|(e, _)| e)
            .collect()
    }

    pub fn has_users(&self, id: NodeId) -> bool {
        !self.nodes[id].outputs.is_empty()
    }

    pub fn is_fixed(&self, id: NodeId) -> bool {
        self.inputs(id)
            .chain(self.outputs(id))
            .any(|(_, e)| e.kind == EdgeKind::Control)
    }

    /// The node supplying merge case `case`.
    pub fn merge_case_source(&self, merge: NodeId, case: u32) -> Option<NodeId> {
        self.input(merge, Name::Case(case))
    }

    /// Phis switched by `merge`.
    pub fn phis_of(&self, merge: NodeId) -> Vec<NodeId> {
        self.outputs(merge)
            .filter(|(_, e)| e.output == Name::Switch)
            .map(|(_, e)| e.to)
            .collect()
    }

    /// Nodes connected to `start` by any chain of edges, in discovery order.
    pub fn reachable(&self) -> Vec<NodeId> {
        let mut seen = HashSet::from([self.start]);
        let mut order = vec![self.start];
        let mut queue = VecDeque::from([self.start]);
        while let Some(n) = queue.pop_front() {
            let neighbours = self
                .inputs(n)
                .map(|(_, e)| e.from)
                .chain(self.outputs(n).map(|(_, e)| e.to));
            for m in neighbours.collect::<Vec<_>>() {
                if seen.insert(m) {
                    order.push(m);
                    queue.push_back(m);
                }
            }
        }
        order
    }

    /// Moves every data and frame-state output of `old` onto `new`.
    pub fn reroute_users(&mut self, old: NodeId, new: NodeId) {
        for e in self.users(old) {
            let edge = self.edges[e].clone();
            self.remove_edge(e);
            self.output_to(new, edge.output, edge.to, edge.input);
        }
    }

    /// Replaces `old` by a subgraph and deletes it. Schedule edges are dropped.
    pub fn replace(&mut self, old: NodeId, r: Replacement) {
        let inputs: Vec<Edge> = self.inputs(old).map(|(_, e)| e.clone()).collect();
        let outputs: Vec<Edge> = self.outputs(old).map(|(_, e)| e.clone()).collect();
        self.remove_node(old);

        for e in inputs {
            match e.kind {
                EdgeKind::Control => {
                    let start = r.start.expect("replacement of a fixed node needs a start");
                    self.output_to(e.from, e.output, start, Name::Control);
                }
                EdgeKind::Data | EdgeKind::FrameState => {
                    for (name, consumer, input) in &r.users {
                        if *name == e.input {
                            self.output_to(e.from, e.output, *consumer, *input);
                        }
                    }
                }
                EdgeKind::Schedule => {}
            }
        }
        for e in outputs {
            match e.kind {
                EdgeKind::Control => {
                    let finish = r.finish.expect("replacement of a fixed node needs a finish");
                    self.output_to(finish, Name::Control, e.to, e.input);
                }
                EdgeKind::Data | EdgeKind::FrameState => {
                    let value = r.value.expect("replacement of a used node needs a value");
                    self.output_to(value, e.output, e.to, e.input);
                }
                EdgeKind::Schedule => {}
            }
        }
    }

    /// Removes a node with one control input and one control output,
    /// connecting its predecessor straight to its successor.
    pub fn splice_out(&mut self, id: NodeId) {
        let pred = self.inputs(id).find(|(_, e)| e.kind == EdgeKind::Control);
        let succ = self.outputs(id).find(|(_, e)| e.kind == EdgeKind::Control);
        let (Some((_, pred)), Some((_, succ))) = (pred, succ) else {
            panic!("{id} ({}) is not a control pass-through", self.op(id));
        };
        let (pred, succ) = (pred.clone(), succ.clone());
        assert_eq!(self.predecessors(id).len(), 1);
        assert_eq!(self.successors(id).len(), 1);
        assert!(
            self.users(id).is_empty(),
            "{id} ({}) still has users",
            self.op(id)
        );
        self.remove_node(id);
        self.output_to(pred.from, pred.output, succ.to, succ.input);
    }

    /// Asserts edge symmetry: each edge is listed by both endpoints, and
    /// every listed edge exists.
    pub fn verify(&self) {
        for (id, edge) in self.edges.iter() {
            assert!(self.nodes[edge.from].outputs.contains(&id), "{id:?} missing from {}", edge.from);
            assert!(self.nodes[edge.to].inputs.contains(&id), "{id:?} missing from {}", edge.to);
        }
        for (id, node) in self.nodes.iter() {
            for e in &node.inputs {
                assert_eq!(self.edges[*e].to, id);
            }
            for e in &node.outputs {
                assert_eq!(self.edges[*e].from, id);
            }
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, node) in self.nodes.iter() {
            write!(f, "{id} = {}", node.op)?;
            let inputs: Vec<String> = node
                .inputs
                .iter()
                .map(|e| &self.edges[*e])
                .filter(|e| e.kind != EdgeKind::Schedule)
                .map(|e| {
                    if e.output == Name::Value || e.output == Name::Control {
                        format!("{}: {}", e.input, e.from)
                    } else {
                        format!("{}: {}.{}", e.input, e.from, e.output)
                    }
                })
                .collect();
            if !inputs.is_empty() {
                write!(f, " <- {}", inputs.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
