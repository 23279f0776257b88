use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::ir::{EdgeKind, Graph, Name, NodeId, Op, Test};

/// Deletes the control region only reachable through `root`. Merges die
/// when all of their predecessors do; the merges that survive are returned.
fn delete_region(graph: &mut Graph, root: NodeId) -> BTreeSet<NodeId> {
    let mut doomed = HashSet::new();
    let mut merges = BTreeSet::new();
    let mut worklist = vec![root];
    while let Some(n) = worklist.pop() {
        if doomed.contains(&n) {
            continue;
        }
        assert_ne!(n, graph.finish, "uncommon region reaches finish");
        if matches!(graph.op(n), Op::Merge) {
            let all_doomed = graph
                .predecessors(n)
                .iter()
                .all(|(_, p)| doomed.contains(p));
            if !all_doomed {
                merges.insert(n);
                continue;
            }
            merges.remove(&n);
        }
        doomed.insert(n);
        worklist.extend(graph.successors(n).into_iter().map(|(_, to)| to));
    }
    for n in &doomed {
        graph.remove_node(*n);
    }
    merges
}

/// Drops phi inputs whose merge case is gone and collapses a merge left
/// with a single predecessor.
fn prune_merge(graph: &mut Graph, merge: NodeId) {
    let live: Vec<(Name, NodeId)> = graph.predecessors(merge);
    let cases: HashSet<u32> = live
        .iter()
        .filter_map(|(name, _)| match name {
            Name::Case(t) => Some(*t),
            _ => None,
        })
        .collect();
    for phi in graph.phis_of(merge) {
        let stale: Vec<_> = graph
            .inputs(phi)
            .filter(|(_, e)| matches!(e.input, Name::PhiValue(t) if !cases.contains(&t)))
            .map(|(e, _)| e)
            .collect();
        for e in stale {
            graph.remove_edge(e);
        }
    }
    if live.len() != 1 {
        return;
    }

    for phi in graph.phis_of(merge) {
        let source = graph
            .inputs(phi)
            .find(|(_, e)| matches!(e.input, Name::PhiValue(_)))
            .map(|(_, e)| e.from);
        if let Some(source) = source {
            graph.reroute_users(phi, source);
        }
        graph.remove_node(phi);
    }
    let pred = graph
        .inputs(merge)
        .find(|(_, e)| e.kind == EdgeKind::Control)
        .map(|(_, e)| (e.from, e.output));
    let succs: Vec<_> = graph
        .outputs(merge)
        .filter(|(_, e)| e.kind == EdgeKind::Control)
        .map(|(_, e)| (e.to, e.input))
        .collect();
    graph.remove_node(merge);
    if let Some((from, output)) = pred {
        for (to, input) in succs {
            graph.output_to(from, output, to, input);
        }
    }
}

/// Turns a branch with an uncommon side into a guard on its common side,
/// deleting everything only the uncommon side reached.
fn convert(graph: &mut Graph, branch: NodeId, test: Test, uncommon: bool) -> bool {
    let (Some(condition), Some(frame_state)) = (
        graph.input(branch, Name::Condition),
        graph.input(branch, Name::FrameState),
    ) else {
        return false;
    };
    let pred = graph
        .inputs(branch)
        .find(|(_, e)| e.kind == EdgeKind::Control)
        .map(|(_, e)| (e.from, e.output));
    let common = graph
        .outputs(branch)
        .find(|(_, e)| e.output == Name::Branch(!uncommon))
        .map(|(_, e)| (e.to, e.input));
    let rare = graph.successor(branch, Name::Branch(uncommon));
    let (Some((from, output)), Some((to, input)), Some(rare)) = (pred, common, rare) else {
        return false;
    };

    let test = if uncommon { test.negate() } else { test };
    debug!(%branch, %test, "branch becomes guard");
    let guard = graph.add(Op::Guard { test });
    graph.output_to(from, output, guard, Name::Control);
    graph.value(condition, guard, Name::Condition);
    graph.output_to(frame_state, Name::FrameState, guard, Name::FrameState);
    graph.output_to(guard, Name::Control, to, input);
    graph.remove_node(branch);

    for merge in delete_region(graph, rare) {
        if graph.contains(merge) {
            prune_merge(graph, merge);
        }
    }
    true
}

pub fn deoptimise(graph: &mut Graph) -> bool {
    let mut changed = false;
    for n in graph.node_ids() {
        if !graph.contains(n) {
            continue;
        }
        if let Op::Branch {
            test,
            uncommon: Some(side),
        } = *graph.op(n)
        {
            changed |= convert(graph, n, test, side);
        }
    }
    changed
}
