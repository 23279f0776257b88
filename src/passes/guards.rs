use tracing::warn;

use crate::ir::{Graph, Name, NodeId, Op, Test};

use super::gvn::identity;

fn same_condition(graph: &Graph, a: NodeId, b: NodeId) -> bool {
    a == b || identity(graph, a).is_some_and(|key| Some(key) == identity(graph, b))
}

/// Whether an earlier guard in the same block as `guard` already
/// checks the same thing.
fn dominated(graph: &Graph, guard: NodeId, test: Test, condition: NodeId) -> bool {
    let mut n = guard;
    while let Some(p) = graph.control_pred(n) {
        match graph.op(p) {
            Op::Merge | Op::Start | Op::Branch { .. } => return false,
            Op::Guard { test: t } if *t == test => {
                if let Some(c) = graph.input(p, Name::Condition)
                    && same_condition(graph, c, condition)
                {
                    return true;
                }
            }
            _ => {}
        }
        n = p;
    }
    false
}

enum Verdict {
    Redundant,
    AlwaysFails,
    Needed,
}

fn verdict(graph: &Graph, guard: NodeId, test: Test) -> Verdict {
    let Some(condition) = graph.input(guard, Name::Condition) else {
        return Verdict::Needed;
    };
    if let Op::Constant(v) = graph.op(condition) {
        let holds = match test {
            Test::NotZero => v.is_truthy(),
            Test::Zero => !v.is_truthy(),
        };
        return if holds {
            Verdict::Redundant
        } else {
            Verdict::AlwaysFails
        };
    }
    if dominated(graph, guard, test, condition) {
        Verdict::Redundant
    } else {
        Verdict::Needed
    }
}

/// Drops guards that are statically true or repeat a dominating guard.
pub fn remove_redundant_guards(graph: &mut Graph) -> bool {
    let mut changed = false;
    for n in graph.node_ids() {
        let Op::Guard { test } = *graph.op(n) else {
            continue;
        };
        match verdict(graph, n, test) {
            Verdict::Redundant => {
                graph.splice_out(n);
                changed = true;
            }
            Verdict::AlwaysFails => warn!(guard = %n, "guard always deoptimizes"),
            Verdict::Needed => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Kind, Value};

    /// start → guard(a) → guard(b) → finish, with `x` returned.
    fn two_guards(first: NodeId, second: NodeId, g: &mut Graph) -> (NodeId, NodeId) {
        let g1 = g.add(Op::Guard { test: Test::NotZero });
        let g2 = g.add(Op::Guard { test: Test::NotZero });
        let (start, finish) = (g.start, g.finish);
        g.control(start, g1);
        g.control(g1, g2);
        g.control(g2, finish);
        g.value(first, g1, Name::Condition);
        g.value(second, g2, Name::Condition);
        (g1, g2)
    }

    #[test]
    fn repeated_guard_is_removed() {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(0));
        let k1 = g.add(Op::KindIs(Kind::Fixnum));
        g.value(x, k1, Name::Value);
        let k2 = g.add(Op::KindIs(Kind::Fixnum));
        g.value(x, k2, Name::Value);
        let (g1, g2) = two_guards(k1, k2, &mut g);

        assert!(remove_redundant_guards(&mut g));
        g.verify();
        assert!(g.contains(g1));
        assert!(!g.contains(g2));
        assert_eq!(g.successors(g1), vec![(Name::Control, g.finish)]);
    }

    #[test]
    fn different_conditions_both_stay() {
        let mut g = Graph::new();
        let x = g.add(Op::Arg(0));
        let y = g.add(Op::Arg(1));
        two_guards(x, y, &mut g);
        assert!(!remove_redundant_guards(&mut g));
    }

    #[test]
    fn constant_true_guard_is_removed() {
        let mut g = Graph::new();
        let t = g.add(Op::Constant(Value::True));
        let x = g.add(Op::Arg(0));
        let (g1, g2) = two_guards(t, x, &mut g);
        assert!(remove_redundant_guards(&mut g));
        assert!(!g.contains(g1));
        assert_eq!(g.successors(g.start), vec![(Name::Control, g2)]);
    }

    #[test]
    fn constant_false_guard_stays() {
        let mut g = Graph::new();
        let f = g.add(Op::Constant(Value::False));
        let x = g.add(Op::Arg(0));
        let (g1, _) = two_guards(f, x, &mut g);
        assert!(!remove_redundant_guards(&mut g));
        assert!(g.contains(g1));
    }
}
