//! Backend lowering: rewrites the optimized graph from managed-value
//! operations down to raw 64-bit machine operations.
//!
//! The four passes run once each, in order, and are not interleaved with the
//! optimizing pipeline.

use tracing::debug;

use crate::error::{JitError, Result};
use crate::ir::{EdgeKind, Graph, IntOp, Name, NodeId, Op};
use crate::passes::dead_code;
use crate::value::{Kind, TRUTHY_MASK, Value};

fn immediate(graph: &mut Graph, n: i64) -> NodeId {
    graph.add(Op::Immediate(n))
}

/// A fresh `int64 op (left, right)` node.
fn int64(graph: &mut Graph, op: IntOp, left: NodeId, right: NodeId) -> NodeId {
    let n = graph.add(Op::Int64(op));
    graph.value(left, n, Name::Left);
    graph.value(right, n, Name::Right);
    n
}

/// Moves the edge feeding `n.from` to `n.to`, returning its source.
fn rename_input(graph: &mut Graph, n: NodeId, from: Name, to: Name) -> Option<NodeId> {
    let e = graph.input_edge(n, from)?;
    let edge = graph.edge(e).clone();
    graph.remove_edge(e);
    graph.output_to(edge.from, edge.output, n, to);
    Some(edge.from)
}

fn set_condition(graph: &mut Graph, n: NodeId, condition: NodeId) {
    if let Some(e) = graph.input_edge(n, Name::Condition) {
        graph.remove_edge(e);
    }
    graph.value(condition, n, Name::Condition);
}

fn negate_test(graph: &mut Graph, n: NodeId) {
    let op = match graph.op(n).clone() {
        Op::Branch { test, uncommon } => Op::Branch {
            test: test.negate(),
            uncommon,
        },
        Op::Guard { test } => Op::Guard {
            test: test.negate(),
        },
        other => other,
    };
    graph.set_op(n, op);
}

fn is_test(op: &Op) -> bool {
    matches!(op, Op::Branch { .. } | Op::Guard { .. })
}

/// Replaces kind checks and fixnum arithmetic with explicit tag operations,
/// and makes every branch condition a native 0/non-0 word.
pub fn add_tagging(graph: &mut Graph) -> Result<()> {
    for n in graph.node_ids() {
        match graph.op(n) {
            Op::KindIs(Kind::Fixnum) => graph.set_op(n, Op::IsTaggedFixnum),
            Op::KindIs(kind) => {
                return Err(JitError::Unsupported(format!("no native check for kind {kind}")));
            }
            _ => {}
        }
    }

    for n in graph.node_ids() {
        let Op::Fixnum(op) = *graph.op(n) else {
            continue;
        };
        let (Some(left), Some(right)) = (graph.input(n, Name::Left), graph.input(n, Name::Right))
        else {
            panic!("{n} ({}) is missing an operand", graph.op(n));
        };
        let untag_left = graph.add(Op::Untag);
        graph.value(left, untag_left, Name::Value);
        let untag_right = graph.add(Op::Untag);
        graph.value(right, untag_right, Name::Value);
        let raw = int64(graph, op.int_op(), untag_left, untag_right);
        let tag = graph.add(Op::Tag);
        graph.value(raw, tag, Name::Value);
        graph.reroute_users(n, tag);
        graph.remove_node(n);
    }

    for n in graph.node_ids() {
        if !is_test(graph.op(n)) {
            continue;
        }
        let Some(mut condition) = graph.input(n, Name::Condition) else {
            continue;
        };
        while matches!(graph.op(condition), Op::Not) {
            let Some(inner) = graph.input(condition, Name::Value) else {
                break;
            };
            set_condition(graph, n, inner);
            negate_test(graph, n);
            condition = inner;
        }
        if !graph.op(condition).is_native_condition() {
            let truthy = graph.add(Op::IsTruthy);
            graph.value(condition, truthy, Name::Value);
            set_condition(graph, n, truthy);
        }
    }

    for n in graph.node_ids() {
        if graph.contains(n) && matches!(graph.op(n), Op::Not) {
            if graph.has_users(n) {
                return Err(JitError::Unsupported(format!(
                    "`not` used as a value ({n})"
                )));
            }
            graph.remove_node(n);
        }
    }
    Ok(())
}

/// Expands tag operations into shifts, masks and adds.
pub fn expand_tagging(graph: &mut Graph) {
    for n in graph.node_ids() {
        match graph.op(n) {
            Op::IsTaggedFixnum => {
                let Some(x) = graph.input(n, Name::Value) else {
                    continue;
                };
                if let Some(e) = graph.input_edge(n, Name::Value) {
                    graph.remove_edge(e);
                }
                let one = immediate(graph, 1);
                let low_bit = int64(graph, IntOp::And, x, one);
                graph.set_op(n, Op::Int64NotZero);
                graph.value(low_bit, n, Name::Value);
            }
            Op::IsTruthy => {
                let Some(x) = graph.input(n, Name::Value) else {
                    continue;
                };
                if let Some(e) = graph.input_edge(n, Name::Value) {
                    graph.remove_edge(e);
                }
                let mask = immediate(graph, TRUTHY_MASK);
                let masked = int64(graph, IntOp::And, x, mask);
                let two = immediate(graph, 2);
                let offset = int64(graph, IntOp::Sub, masked, two);
                graph.set_op(n, Op::Int64NotZero);
                graph.value(offset, n, Name::Value);
            }
            Op::Untag => {
                rename_input(graph, n, Name::Value, Name::Left);
                let one = immediate(graph, 1);
                graph.value(one, n, Name::Right);
                graph.set_op(n, Op::Int64(IntOp::ShiftRight));
            }
            Op::Tag => {
                let Some(x) = graph.input(n, Name::Value) else {
                    continue;
                };
                if let Some(e) = graph.input_edge(n, Name::Value) {
                    graph.remove_edge(e);
                }
                let one = immediate(graph, 1);
                let shifted = int64(graph, IntOp::ShiftLeft, x, one);
                let one = immediate(graph, 1);
                graph.value(shifted, n, Name::Left);
                graph.value(one, n, Name::Right);
                graph.set_op(n, Op::Int64(IntOp::Add));
            }
            _ => {}
        }
    }
}

/// Folds `int64_zero?`/`int64_not_zero?` conditions into the test of the
/// branch or guard that consumes them.
pub fn specialise_branches(graph: &mut Graph) {
    for n in graph.node_ids() {
        if !is_test(graph.op(n)) {
            continue;
        }
        let Some(condition) = graph.input(n, Name::Condition) else {
            continue;
        };
        let negate = match graph.op(condition) {
            Op::Int64NotZero => false,
            Op::Int64Zero => true,
            _ => continue,
        };
        let Some(x) = graph.input(condition, Name::Value) else {
            continue;
        };
        set_condition(graph, n, x);
        if negate {
            negate_test(graph, n);
        }
    }
}

/// Turns every remaining `send` into a call through the managed runtime.
pub fn expand_calls(graph: &mut Graph) {
    for n in graph.node_ids() {
        let Op::Send(site) = graph.op(n) else {
            continue;
        };
        let (argc, method) = (site.argc, site.name.clone());
        let name = graph.add(Op::Constant(Value::Symbol(method)));
        let frame_states: Vec<_> = graph
            .inputs(n)
            .filter(|(_, e)| e.kind == EdgeKind::FrameState)
            .map(|(e, _)| e)
            .collect();
        for e in frame_states {
            graph.remove_edge(e);
        }
        graph.value(name, n, Name::MethodName);
        graph.set_op(n, Op::CallManaged { argc });
    }
}

/// Runs the lowering passes in order and sweeps whatever they orphaned.
pub fn lower(graph: &mut Graph) -> Result<()> {
    add_tagging(graph)?;
    expand_tagging(graph);
    specialise_branches(graph);
    expand_calls(graph);
    while dead_code(graph) {}
    debug!(nodes = graph.len(), "lowered");
    Ok(())
}
