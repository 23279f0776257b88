use std::collections::HashMap;

use tracing::debug;

use crate::fragments::{self, Fragment};
use crate::ir::{Graph, Name, NodeId, Op, Replacement};
use crate::value::Kind;

struct Site {
    fragment: Fragment,
    arg_is_fixnum: bool,
}

fn candidate(graph: &Graph, n: NodeId) -> Option<Site> {
    let Op::Send(site) = graph.op(n) else {
        return None;
    };
    if site.megamorphic || site.receiver_kind != Some(Kind::Fixnum) {
        return None;
    }
    if graph.predecessors(n).len() != 1 || graph.successors(n).len() != 1 {
        return None;
    }
    let fragment = fragments::for_method(&site.name, site.argc)?;
    let arg_is_fixnum = site
        .profile
        .as_ref()
        .is_some_and(|p| p.monomorphic_arg(0) == Some(Kind::Fixnum));
    Some(Site {
        fragment,
        arg_is_fixnum,
    })
}

/// Copies `site`'s fragment into `graph` in place of `send`.
fn splice(graph: &mut Graph, send: NodeId, site: Site) {
    let Site {
        fragment: f,
        arg_is_fixnum,
    } = site;
    let fg = &f.graph;
    let result = fg
        .input(fg.finish, Name::Value)
        .expect("fragment returns a value");

    let mut map = HashMap::new();
    for n in fg.node_ids() {
        if n == f.receiver || n == f.arg {
            continue;
        }
        let op = if n == fg.start || n == fg.finish {
            Op::Connector
        } else {
            fg.op(n).clone()
        };
        map.insert(n, graph.add(op));
    }

    let mut users = vec![
        (Name::FrameState, map[&f.branch], Name::FrameState),
        (Name::FrameState, map[&f.fallback], Name::FrameState),
    ];
    for n in fg.node_ids() {
        for (_, e) in fg.outputs(n) {
            if e.to == fg.finish && e.input == Name::Value {
                continue;
            }
            if e.from == f.receiver {
                users.push((Name::Receiver, map[&e.to], e.input));
            } else if e.from == f.arg {
                users.push((Name::Arg(0), map[&e.to], e.input));
            } else {
                graph.output_to(map[&e.from], e.output, map[&e.to], e.input);
            }
        }
    }

    let branch = map[&f.branch];
    if arg_is_fixnum && let Op::Branch { test, .. } = *graph.op(branch) {
        graph.set_op(
            branch,
            Op::Branch {
                test,
                uncommon: Some(false),
            },
        );
    }

    graph.replace(
        send,
        Replacement {
            start: Some(map[&fg.start]),
            finish: Some(map[&fg.finish]),
            users,
            value: Some(map[&result]),
        },
    );
}

/// Replaces fixnum-receiver sends of core arithmetic with their fast paths.
pub fn inlining(graph: &mut Graph) -> bool {
    let mut changed = false;
    for n in graph.node_ids() {
        if !graph.contains(n) {
            continue;
        }
        let Some(site) = candidate(graph, n) else {
            continue;
        };
        debug!(send = %n, "inlining core fragment");
        splice(graph, n, site);
        changed = true;
    }
    changed
}
