use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

/// Finds one concrete cycle in `graph`, listing every node on it in order.
///
/// Among all strongly connected components that contain a cycle, the one
/// holding the lowest node index is chosen, and the shortest cycle through
/// that node is returned. `None` if the graph is acyclic.
pub(crate) fn find_cycle<N, E>(graph: &DiGraph<N, E>) -> Option<Vec<NodeIndex>> {
    let component = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .min_by_key(|scc| scc.iter().map(|n| n.index()).min())?;

    let start = *component.iter().min_by_key(|n| n.index())?;
    if graph.contains_edge(start, start) {
        return Some(vec![start]);
    }

    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by_key(|n| n.index());

        for neighbor in next {
            if neighbor == start {
                let mut path = vec![node];
                let mut current = node;
                while current != start {
                    current = parents[&current];
                    path.push(current);
                }
                path.reverse();
                return Some(path);
            }

            if !parents.contains_key(&neighbor) {
                parents.insert(neighbor, node);
                queue.push_back(neighbor);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acyclic() {
        let mut graph = DiGraph::<&str, ()>::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        graph.add_edge(a, b, ());

        assert!(find_cycle(&graph).is_none());
    }

    #[test]
    fn test_lists_whole_cycle() {
        let mut graph = DiGraph::<&str, ()>::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        let d = graph.add_node("d");
        graph.add_edge(d, a, ());
        graph.add_edge(a, b, ());
        graph.add_edge(b, c, ());
        graph.add_edge(c, a, ());

        let cycle = find_cycle(&graph).unwrap();
        let names: Vec<&str> = cycle.iter().map(|&n| graph[n]).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_loop() {
        let mut graph = DiGraph::<&str, ()>::new();
        let a = graph.add_node("a");
        graph.add_edge(a, a, ());

        assert_eq!(find_cycle(&graph).unwrap(), vec![a]);
    }
}
