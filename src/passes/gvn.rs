use std::collections::HashMap;

use crate::ir::{EdgeKind, Graph, Name, NodeId, Op};

/// Inputs of a floating node as `(input name, source, source output)`.
pub type InputKey = Vec<(Name, NodeId, Name)>;

/// What makes a floating node interchangeable with another: its operation
/// and its sorted data inputs. Fixed nodes and raw immediates have no
/// identity.
pub fn identity(graph: &Graph, n: NodeId) -> Option<(Op, InputKey)> {
    let op = graph.op(n);
    if graph.is_fixed(n) || matches!(op, Op::Immediate(_) | Op::Start | Op::Finish) {
        return None;
    }
    let mut inputs: InputKey = graph
        .inputs(n)
        .filter(|(_, e)| e.kind != EdgeKind::Schedule)
        .map(|(_, e)| (e.input, e.from, e.output))
        .collect();
    inputs.sort();
    Some((op.clone(), inputs))
}

/// Collapses floating nodes with the same identity onto the first one.
pub fn global_value_numbering(graph: &mut Graph) -> bool {
    let mut seen: HashMap<(Op, InputKey), NodeId> = HashMap::new();
    let mut changed = false;
    for n in graph.node_ids() {
        let Some(key) = identity(graph, n) else {
            continue;
        };
        match seen.get(&key) {
            Some(&canonical) => {
                graph.reroute_users(n, canonical);
                graph.remove_node(n);
                changed = true;
            }
            None => {
                seen.insert(key, n);
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Arith;

    #[test]
    fn equal_expressions_share_a_node() {
        let mut g = Graph::new();
        let a0 = g.add(Op::Arg(0));
        let a1 = g.add(Op::Arg(0));
        let b = g.add(Op::Arg(1));
        let x = g.add(Op::Fixnum(Arith::Add));
        g.value(a0, x, Name::Left);
        g.value(b, x, Name::Right);
        let y = g.add(Op::Fixnum(Arith::Add));
        g.value(a1, y, Name::Left);
        g.value(b, y, Name::Right);
        let z = g.add(Op::Fixnum(Arith::Mul));
        g.value(x, z, Name::Left);
        g.value(y, z, Name::Right);
        let (start, finish) = (g.start, g.finish);
        g.control(start, finish);
        g.value(z, finish, Name::Value);

        assert!(global_value_numbering(&mut g));
        g.verify();
        assert!(!g.contains(a1));
        assert!(!g.contains(y));
        assert_eq!(g.input(z, Name::Left), Some(x));
        assert_eq!(g.input(z, Name::Right), Some(x));
        assert!(!global_value_numbering(&mut g));
    }

    #[test]
    fn operand_order_matters() {
        let mut g = Graph::new();
        let a = g.add(Op::Arg(0));
        let b = g.add(Op::Arg(1));
        let x = g.add(Op::Fixnum(Arith::Sub));
        g.value(a, x, Name::Left);
        g.value(b, x, Name::Right);
        let y = g.add(Op::Fixnum(Arith::Sub));
        g.value(b, y, Name::Left);
        g.value(a, y, Name::Right);
        assert_ne!(identity(&g, x), identity(&g, y));
        assert!(!global_value_numbering(&mut g));
    }

    #[test]
    fn fixed_nodes_are_never_merged() {
        let mut g = Graph::new();
        let start = g.start;
        let t = g.add(Op::Trace { line: 1 });
        g.control(start, t);
        assert_eq!(identity(&g, t), None);
    }
}
