//! Hand-built graphs for the core-library methods the inliner knows.
//!
//! Each fragment assumes its receiver is already known to be a fixnum (it
//! is only spliced in under a kind guard) and checks the argument itself:
//!
//! ```text
//! start → branch(is_tagged_fixnum?(arg 0))
//!           true  → connector ─────────────┐
//!           false → send(megamorphic) ─────┤
//!                                          merge → finish
//! finish.value = phi(fixnum_op(self, arg 0), send)
//! ```

use crate::ir::{Arith, Graph, Name, NodeId, Op, SendSite, Test};

/// Named nodes of a fragment, for splicing.
pub struct Fragment {
    pub graph: Graph,
    pub receiver: NodeId,
    pub arg: NodeId,
    pub branch: NodeId,
    pub fallback: NodeId,
}

pub fn fixnum_binop(op: Arith) -> Fragment {
    let mut g = Graph::new();
    let receiver = g.add(Op::SelfValue);
    let arg = g.add(Op::Arg(0));

    let check = g.add(Op::IsTaggedFixnum);
    g.value(arg, check, Name::Value);
    let branch = g.add(Op::Branch {
        test: Test::NotZero,
        uncommon: None,
    });
    g.control(g.start, branch);
    g.value(check, branch, Name::Condition);

    let fast = g.add(Op::Connector);
    g.output_to(branch, Name::Branch(true), fast, Name::Control);
    let result = g.add(Op::Fixnum(op));
    g.value(receiver, result, Name::Left);
    g.value(arg, result, Name::Right);

    let fallback = g.add(Op::Send(Box::new(SendSite::megamorphic(op.method(), 1))));
    g.output_to(branch, Name::Branch(false), fallback, Name::Control);
    g.value(receiver, fallback, Name::Receiver);
    g.value(arg, fallback, Name::Arg(0));

    let merge = g.add(Op::Merge);
    g.output_to(fast, Name::Control, merge, Name::Case(0));
    g.output_to(fallback, Name::Control, merge, Name::Case(1));
    let phi = g.add(Op::Phi);
    g.output_to(merge, Name::Switch, phi, Name::Switch);
    g.value(result, phi, Name::PhiValue(0));
    g.value(fallback, phi, Name::PhiValue(1));

    let finish = g.finish;
    g.control(merge, finish);
    g.value(phi, finish, Name::Value);

    Fragment {
        graph: g,
        receiver,
        arg,
        branch,
        fallback,
    }
}

/// The fragment for a method name, if there is one.
pub fn for_method(name: &str, argc: u32) -> Option<Fragment> {
    if argc != 1 {
        return None;
    }
    Arith::from_method(name).map(fixnum_binop)
}
