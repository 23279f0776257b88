use crate::ir::{Graph, Name, NodeId, Op};

/// Replaces a phi whose value inputs all come from one node by that node.
pub fn remove_no_choice_phis(graph: &mut Graph) -> bool {
    let plan: Vec<(NodeId, NodeId)> = graph
        .node_ids()
        .into_iter()
        .filter(|n| matches!(graph.op(*n), Op::Phi))
        .filter_map(|phi| {
            let mut sources = graph
                .inputs(phi)
                .filter(|(_, e)| matches!(e.input, Name::PhiValue(_)))
                .map(|(_, e)| e.from);
            let first = sources.next()?;
            sources.all(|s| s == first).then_some((phi, first))
        })
        .collect();

    for (phi, source) in &plan {
        graph.reroute_users(*phi, *source);
        graph.remove_node(*phi);
    }
    !plan.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn merge_with_phi(g: &mut Graph, a: NodeId, b: NodeId) -> NodeId {
        let merge = g.add(Op::Merge);
        let phi = g.add(Op::Phi);
        g.output_to(merge, Name::Switch, phi, Name::Switch);
        g.value(a, phi, Name::PhiValue(0));
        g.value(b, phi, Name::PhiValue(1));
        g.value(phi, g.finish, Name::Value);
        phi
    }

    #[test]
    fn single_source_phi_is_bypassed() {
        let mut g = Graph::new();
        let c = g.add(Op::Constant(Value::Fixnum(3)));
        let phi = merge_with_phi(&mut g, c, c);
        assert!(remove_no_choice_phis(&mut g));
        assert!(!g.contains(phi));
        assert_eq!(g.input(g.finish, Name::Value), Some(c));
        g.verify();
    }

    #[test]
    fn real_choices_stay() {
        let mut g = Graph::new();
        let a = g.add(Op::Constant(Value::Fixnum(3)));
        let b = g.add(Op::Constant(Value::Fixnum(4)));
        let phi = merge_with_phi(&mut g, a, b);
        assert!(!remove_no_choice_phis(&mut g));
        assert!(g.contains(phi));
    }
}
