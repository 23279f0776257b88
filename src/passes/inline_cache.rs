use tracing::debug;

use crate::ir::{Graph, Name, NodeId, Op, Replacement, SendSite, Test};
use crate::value::Kind;

/// A send worth caching, with the kind its receiver always had.
fn candidate(graph: &Graph, n: NodeId) -> Option<(SendSite, Kind)> {
    let Op::Send(site) = graph.op(n) else {
        return None;
    };
    if site.megamorphic || site.receiver_kind.is_some() {
        return None;
    }
    let kind = site.profile.as_ref()?.monomorphic_receiver()?;
    // Only kinds with a native check can be cached.
    if kind != Kind::Fixnum {
        return None;
    }
    if graph.predecessors(n).len() != 1 || graph.successors(n).len() != 1 {
        return None;
    }
    Some(((**site).clone(), kind))
}

/// Splits a monomorphic send into a kind check choosing between a send
/// specialised for that kind and a generic one.
pub fn inline_caching(graph: &mut Graph) -> bool {
    let mut changed = false;
    for n in graph.node_ids() {
        let Some((site, kind)) = candidate(graph, n) else {
            continue;
        };
        debug!(send = %n, method = %site.name, %kind, "inline caching");

        let check = graph.add(Op::KindIs(kind));
        let branch = graph.add(Op::Branch {
            test: Test::NotZero,
            uncommon: Some(false),
        });
        graph.value(check, branch, Name::Condition);

        let mono = graph.add(Op::Send(Box::new(SendSite {
            receiver_kind: Some(kind),
            ..site.clone()
        })));
        let mega = graph.add(Op::Send(Box::new(SendSite::megamorphic(&site.name, site.argc))));
        graph.output_to(branch, Name::Branch(true), mono, Name::Control);
        graph.output_to(branch, Name::Branch(false), mega, Name::Control);

        let merge = graph.add(Op::Merge);
        graph.output_to(mono, Name::Control, merge, Name::Case(0));
        graph.output_to(mega, Name::Control, merge, Name::Case(1));
        let phi = graph.add(Op::Phi);
        graph.output_to(merge, Name::Switch, phi, Name::Switch);
        graph.value(mono, phi, Name::PhiValue(0));
        graph.value(mega, phi, Name::PhiValue(1));

        let mut users = vec![
            (Name::Receiver, check, Name::Value),
            (Name::Receiver, mono, Name::Receiver),
            (Name::Receiver, mega, Name::Receiver),
            (Name::FrameState, branch, Name::FrameState),
            (Name::FrameState, mono, Name::FrameState),
            (Name::FrameState, mega, Name::FrameState),
        ];
        for i in 0..site.argc {
            users.push((Name::Arg(i), mono, Name::Arg(i)));
            users.push((Name::Arg(i), mega, Name::Arg(i)));
        }
        graph.replace(
            n,
            Replacement {
                start: Some(branch),
                finish: Some(merge),
                users,
                value: Some(phi),
            },
        );
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::bytecode_parse::parse_listing;
    use crate::profile::Profile;

    fn add_graph(profile: &Profile) -> Graph {
        let insns = parse_listing("[:arg, 0] [:arg, 1] [:send, :+, 1] [:return]").unwrap();
        build(&insns, 2, Some(profile)).unwrap()
    }

    #[test]
    fn caches_a_fixnum_send() {
        let mut profile = Profile::new();
        profile.record(2, Kind::Fixnum, &[Kind::Fixnum]);
        let mut g = add_graph(&profile);
        assert!(inline_caching(&mut g));
        g.verify();

        let branch = g.successor(g.start, Name::Control).unwrap();
        assert_eq!(
            g.op(branch),
            &Op::Branch {
                test: Test::NotZero,
                uncommon: Some(false)
            }
        );
        let check = g.input(branch, Name::Condition).unwrap();
        assert_eq!(g.op(check), &Op::KindIs(Kind::Fixnum));
        assert_eq!(g.op(g.input(check, Name::Value).unwrap()), &Op::Arg(0));

        let mono = g.successor(branch, Name::Branch(true)).unwrap();
        assert_eq!(g.op(mono).to_string(), "send(:+, 1, fixnum)");
        let mega = g.successor(branch, Name::Branch(false)).unwrap();
        assert_eq!(g.op(mega).to_string(), "send(:+, 1, megamorphic)");
        assert!(g.input(branch, Name::FrameState).is_some());

        let phi = g.input(g.finish, Name::Value).unwrap();
        assert_eq!(g.input(phi, Name::PhiValue(0)), Some(mono));
        assert_eq!(g.input(phi, Name::PhiValue(1)), Some(mega));

        // Neither new send is a candidate.
        assert!(!inline_caching(&mut g));
    }

    #[test]
    fn leaves_floats_generic() {
        let mut profile = Profile::new();
        profile.record(2, Kind::Float, &[Kind::Float]);
        let mut g = add_graph(&profile);
        assert!(!inline_caching(&mut g));
    }
}
