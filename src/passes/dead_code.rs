use crate::ir::{Graph, NodeId};

/// Removes every node nothing consumes, except `finish`.
///
/// Side effects are control-chained, so an effectful node always has a
/// control user and is never collected here.
pub fn dead_code(graph: &mut Graph) -> bool {
    let dead: Vec<NodeId> = graph
        .node_ids()
        .into_iter()
        .filter(|n| *n != graph.finish && !graph.has_users(*n))
        .collect();
    for n in &dead {
        graph.remove_node(*n);
    }
    !dead.is_empty()
}
