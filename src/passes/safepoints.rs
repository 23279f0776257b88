use crate::ir::{Graph, Name, Op};

/// Removes `trace` nodes. Compiled code can deoptimize at any instruction
/// boundary, so no explicit safepoints are kept.
pub fn insert_safepoints(graph: &mut Graph) -> bool {
    let mut changed = false;
    for n in graph.node_ids() {
        if !matches!(graph.op(n), Op::Trace { .. }) {
            continue;
        }
        let from_branch = graph
            .inputs(n)
            .any(|(_, e)| matches!(e.output, Name::Branch(_)));
        let into_merge = graph
            .successors(n)
            .iter()
            .any(|(_, to)| matches!(graph.op(*to), Op::Merge));
        if from_branch && into_merge {
            graph.set_op(n, Op::Connector);
        } else {
            graph.splice_out(n);
        }
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Test;

    #[test]
    fn traces_are_spliced_out() {
        let mut g = Graph::new();
        let t1 = g.add(Op::Trace { line: 1 });
        let t2 = g.add(Op::Trace { line: 2 });
        let (start, finish) = (g.start, g.finish);
        g.control(start, t1);
        g.control(t1, t2);
        g.control(t2, finish);
        assert!(insert_safepoints(&mut g));
        g.verify();
        assert_eq!(g.successors(g.start), vec![(Name::Control, g.finish)]);
        assert!(!insert_safepoints(&mut g));
    }

    #[test]
    fn branch_to_merge_keeps_a_connector() {
        let mut g = Graph::new();
        let c = g.add(Op::Arg(0));
        let branch = g.add(Op::Branch {
            test: Test::NotZero,
            uncommon: None,
        });
        let t = g.add(Op::Trace { line: 4 });
        let other = g.add(Op::Connector);
        let merge = g.add(Op::Merge);
        let (start, finish) = (g.start, g.finish);
        g.control(start, branch);
        g.value(c, branch, Name::Condition);
        g.output_to(branch, Name::Branch(true), t, Name::Control);
        g.output_to(branch, Name::Branch(false), other, Name::Control);
        g.output_to(t, Name::Control, merge, Name::Case(0));
        g.output_to(other, Name::Control, merge, Name::Case(1));
        g.control(merge, finish);

        assert!(insert_safepoints(&mut g));
        assert_eq!(g.op(t), &Op::Connector);
        assert_eq!(g.successors(branch).len(), 2);
    }
}
