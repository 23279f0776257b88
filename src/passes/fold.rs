use crate::ir::{Graph, Name, NodeId, Op};
use crate::value::{Kind, Value};

enum Rewrite {
    /// Users of the node read this node instead.
    Forward(NodeId),
    /// The node is this constant.
    Constant(Value),
    /// The branch or guard tests this node with the opposite test.
    NegateCondition(NodeId),
}

fn constant(graph: &Graph, n: NodeId) -> Option<&Value> {
    match graph.op(n) {
        Op::Constant(v) => Some(v),
        _ => None,
    }
}

fn rule(graph: &Graph, n: NodeId) -> Option<Rewrite> {
    let operand = |name| graph.input(n, name);
    match graph.op(n) {
        Op::Tag => {
            let x = operand(Name::Value)?;
            matches!(graph.op(x), Op::Untag).then_some(Rewrite::Forward(graph.input(x, Name::Value)?))
        }
        Op::Untag => {
            let x = operand(Name::Value)?;
            matches!(graph.op(x), Op::Tag).then_some(Rewrite::Forward(graph.input(x, Name::Value)?))
        }
        Op::IsTaggedFixnum => {
            let x = operand(Name::Value)?;
            match graph.op(x) {
                Op::Tag => Some(Rewrite::Constant(Value::True)),
                Op::Constant(v) => Some(Rewrite::Constant(Value::bool(v.kind() == Kind::Fixnum))),
                _ => None,
            }
        }
        Op::KindIs(kind) => {
            let v = constant(graph, operand(Name::Value)?)?;
            Some(Rewrite::Constant(Value::bool(v.kind() == *kind)))
        }
        Op::Not => {
            let v = constant(graph, operand(Name::Value)?)?;
            Some(Rewrite::Constant(Value::bool(!v.is_truthy())))
        }
        Op::Fixnum(op) => {
            let a = constant(graph, operand(Name::Left)?)?.as_fixnum()?;
            let b = constant(graph, operand(Name::Right)?)?.as_fixnum()?;
            Some(Rewrite::Constant(Value::Fixnum(op.apply(a, b))))
        }
        Op::Branch { .. } | Op::Guard { .. } => {
            let c = operand(Name::Condition)?;
            matches!(graph.op(c), Op::Not)
                .then_some(Rewrite::NegateCondition(graph.input(c, Name::Value)?))
        }
        _ => None,
    }
}

/// Applies the first matching peephole rewrite, if any. One rewrite per
/// call; the runner provides repetition.
pub fn constant_fold(graph: &mut Graph) -> bool {
    let Some((n, rewrite)) = graph
        .node_ids()
        .into_iter()
        .find_map(|n| rule(graph, n).map(|r| (n, r)))
    else {
        return false;
    };

    match rewrite {
        Rewrite::Forward(x) => {
            graph.reroute_users(n, x);
            graph.remove_node(n);
        }
        Rewrite::Constant(value) => {
            let c = graph.add(Op::Constant(value));
            graph.reroute_users(n, c);
            graph.remove_node(n);
        }
        Rewrite::NegateCondition(x) => {
            if let Some(e) = graph.input_edge(n, Name::Condition) {
                graph.remove_edge(e);
            }
            graph.value(x, n, Name::Condition);
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
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Arith, Test};

    fn returning(g: &mut Graph, value: NodeId) {
        let start = g.start;
        let finish = g.finish;
        g.control(start, finish);
        g.value(value, finish, Name::Value);
    }

    fn unary(g: &mut Graph, op: Op, x: NodeId) -> NodeId {
        let n = g.add(op);
        g.value(x, n, Name::Value);
        n
    }

    #[test]
    fn tag_of_untag_is_identity() {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(0));
        let untag = unary(&mut g, Op::Untag, x);
        let tag = unary(&mut g, Op::Tag, untag);
        returning(&mut g, tag);
        assert!(constant_fold(&mut g));
        assert_eq!(g.input(g.finish, Name::Value), Some(x));
        g.verify();
    }

    #[test]
    fn tagged_values_are_fixnums() {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(0));
        let tag = unary(&mut g, Op::Tag, x);
        let check = unary(&mut g, Op::IsTaggedFixnum, tag);
        returning(&mut g, check);
        assert!(constant_fold(&mut g));
        let result = g.input(g.finish, Name::Value).unwrap();
        assert_eq!(g.op(result), &Op::Constant(Value::True));
    }

    #[test]
    fn folds_constant_arithmetic_one_step_at_a_time() {
        let mut g = Graph::new();
        let a = g.add(Op::Constant(Value::Fixnum(14)));
        let b = g.add(Op::Constant(Value::Fixnum(2)));
        let add = g.add(Op::Fixnum(Arith::Add));
        g.value(a, add, Name::Left);
        g.value(b, add, Name::Right);
        let not = unary(&mut g, Op::Not, add);
        returning(&mut g, not);

        assert!(constant_fold(&mut g));
        assert!(!g.contains(add));
        assert!(constant_fold(&mut g));
        let result = g.input(g.finish, Name::Value).unwrap();
        assert_eq!(g.op(result), &Op::Constant(Value::False));
        assert!(!constant_fold(&mut g));
    }

    #[test]
    fn branch_on_not_flips_the_test() {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(0));
        let not = unary(&mut g, Op::Not, x);
        let guard = g.add(Op::Guard { test: Test::NotZero });
        let start = g.start;
        let finish = g.finish;
        g.control(start, guard);
        g.control(guard, finish);
        g.value(not, guard, Name::Condition);
        g.value(x, finish, Name::Value);

        assert!(constant_fold(&mut g));
        assert_eq!(g.op(guard), &Op::Guard { test: Test::Zero });
        assert_eq!(g.input(guard, Name::Condition), Some(x));
        assert!(!g.has_users(not));
    }
}
