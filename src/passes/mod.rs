//! Graph-to-graph optimizations and the fixpoint runner that drives them.
//!
//! Every pass inspects the graph, collects its rewrite plan, applies it, and
//! reports whether anything changed. The runner repeats the whole list until
//! one full round changes nothing.

use tracing::{debug, trace};

use crate::ir::Graph;

mod dead_code;
mod deoptimise;
mod fold;
mod guards;
mod gvn;
mod inline_cache;
mod inlining;
mod phi;
mod safepoints;

pub use dead_code::dead_code;
pub use deoptimise::deoptimise;
pub use fold::constant_fold;
pub use guards::remove_redundant_guards;
pub use gvn::{global_value_numbering, identity};
pub use inline_cache::inline_caching;
pub use inlining::inlining;
pub use phi::remove_no_choice_phis;
pub use safepoints::insert_safepoints;

/// A named graph rewrite. `run` returns whether it modified the graph.
#[derive(Clone, Copy)]
pub struct Pass {
    pub name: &'static str,
    pub run: fn(&mut Graph) -> bool,
}

pub const DEFAULT_PASSES: &[Pass] = &[
    Pass {
        name: "dead_code",
        run: dead_code,
    },
    Pass {
        name: "no_choice_phi",
        run: remove_no_choice_phis,
    },
    Pass {
        name: "constant_fold",
        run: constant_fold,
    },
    Pass {
        name: "gvn",
        run: global_value_numbering,
    },
    Pass {
        name: "redundant_guards",
        run: remove_redundant_guards,
    },
    Pass {
        name: "inline_caching",
        run: inline_caching,
    },
    Pass {
        name: "inlining",
        run: inlining,
    },
    Pass {
        name: "insert_safepoints",
        run: insert_safepoints,
    },
    Pass {
        name: "deoptimise",
        run: deoptimise,
    },
];

/// Rounds after which a pipeline that keeps reporting changes is a bug.
const MAX_ROUNDS: usize = 1000;

/// Runs `passes` until a full round reports no change. Returns whether any
/// pass changed anything.
pub fn run_passes(graph: &mut Graph, passes: &[Pass]) -> bool {
    let mut changed_any = false;
    for round in 1..=MAX_ROUNDS {
        let mut changed = false;
        for pass in passes {
            if (pass.run)(graph) {
                trace!(pass = pass.name, round, nodes = graph.len(), "pass changed graph");
                changed = true;
            }
        }
        if !changed {
            debug!(rounds = round, nodes = graph.len(), "pass pipeline reached fixpoint");
            return changed_any;
        }
        changed_any = true;
    }
    panic!("pass pipeline still changing the graph after {MAX_ROUNDS} rounds");
}

pub fn run_default_passes(graph: &mut Graph) -> bool {
    run_passes(graph, DEFAULT_PASSES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::bytecode_parse::parse_listing;
    use crate::ir::{Name, Op, Test};
    use crate::profile::Profile;
    use crate::value::Kind;

    const ADD: &str = "[:trace, 1] [:arg, 0] [:arg, 1] [:send, :+, 1] [:return]";

    fn fixnum_profile() -> Profile {
        let mut profile = Profile::new();
        profile.record(3, Kind::Fixnum, &[Kind::Fixnum]);
        profile
    }

    fn optimized_add() -> Graph {
        let insns = parse_listing(ADD).unwrap();
        let mut g = build(&insns, 2, Some(&fixnum_profile())).unwrap();
        run_default_passes(&mut g);
        g
    }

    #[test]
    fn pipeline_is_idempotent() {
        let mut g = optimized_add();
        g.verify();
        let before = g.to_string();
        assert!(!run_default_passes(&mut g));
        assert_eq!(g.to_string(), before);
    }

    #[test]
    fn speculated_add_is_two_guards_and_an_add() {
        let g = optimized_add();
        let ops: Vec<String> = g.node_ids().iter().map(|n| g.op(*n).to_string()).collect();
        assert!(!ops.iter().any(|o| o.starts_with("send")), "{g}");
        assert!(!ops.iter().any(|o| o.starts_with("trace")), "{g}");
        assert!(!ops.iter().any(|o| o == "merge" || o == "phi"), "{g}");
        assert_eq!(ops.iter().filter(|o| o.starts_with("guard")).count(), 2, "{g}");
        assert_eq!(ops.iter().filter(|o| *o == "frame_state(ip 3)").count(), 1, "{g}");

        let result = g.input(g.finish, Name::Value).unwrap();
        assert_eq!(g.op(result).to_string(), "fixnum_add");

        // Both guards sit on the single control path from start to finish.
        let mut n = g.finish;
        let mut guards = Vec::new();
        while let Some(p) = g.control_pred(n) {
            if let Op::Guard { test } = g.op(p) {
                guards.push(*test);
            }
            n = p;
        }
        assert_eq!(n, g.start);
        assert_eq!(guards, vec![Test::NotZero, Test::NotZero]);
    }

    #[test]
    fn no_profile_leaves_the_send_alone() {
        let insns = parse_listing(ADD).unwrap();
        let mut g = build(&insns, 2, None).unwrap();
        run_default_passes(&mut g);
        let send = g.control_pred(g.finish).unwrap();
        assert!(matches!(g.op(send), Op::Send(site) if !site.megamorphic));
    }

    #[test]
    fn polymorphic_receivers_are_not_cached() {
        let insns = parse_listing(ADD).unwrap();
        let mut profile = fixnum_profile();
        profile.record(3, Kind::Float, &[Kind::Float]);
        let mut g = build(&insns, 2, Some(&profile)).unwrap();
        run_default_passes(&mut g);
        assert!(!g.node_ids().iter().any(|n| matches!(g.op(*n), Op::Branch { .. })));
    }
}
