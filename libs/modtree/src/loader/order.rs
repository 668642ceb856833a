//! Start order of sibling services.

use std::collections::{BTreeSet, HashMap};

/// Topological order over `names`, dependencies first.
///
/// `deps[i]` lists what `names[i]` depends on; names outside `names` (resolved from an
/// ancestor) and self references are ignored. Among ready nodes the one with the
/// smallest index goes first, so the result is stable with respect to discovery order.
/// A cycle is returned as its node path, closed by repeating the first node.
pub(crate) fn service_order(names: &[String], deps: &[Vec<String>]) -> Result<Vec<usize>, Vec<String>> {
    let idx: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();

    // edge dep -> dependant
    let mut adj = vec![Vec::<usize>::new(); names.len()];
    for (u, list) in deps.iter().enumerate() {
        for d in list {
            if let Some(&v) = idx.get(d.as_str()) {
                if v != u && !adj[v].contains(&u) {
                    adj[v].push(u);
                }
            }
        }
    }

    if let Some(cycle) = detect_cycle_with_path(names, &adj) {
        return Err(cycle);
    }

    let mut indeg = vec![0usize; names.len()];
    for targets in &adj {
        for &t in targets {
            indeg[t] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..names.len()).filter(|&i| indeg[i] == 0).collect();
    let mut order = Vec::with_capacity(names.len());
    while let Some(u) = ready.pop_first() {
        order.push(u);
        for &w in &adj[u] {
            indeg[w] -= 1;
            if indeg[w] == 0 {
                ready.insert(w);
            }
        }
    }
    Ok(order)
}

fn detect_cycle_with_path(names: &[String], adj: &[Vec<usize>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn dfs(
        node: usize,
        names: &[String],
        adj: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &next in &adj[node] {
            match colors[next] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == next) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&i| names[i].clone()).collect();
                        cycle.push(names[next].clone());
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(next, names, adj, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; names.len()];
    let mut path = Vec::new();
    for i in 0..names.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    fn order_of(names: &[&str], deps: &[&[&str]]) -> Result<Vec<String>, Vec<String>> {
        let names = s(names);
        let deps: Vec<Vec<String>> = deps.iter().map(|d| s(d)).collect();
        service_order(&names, &deps).map(|o| o.into_iter().map(|i| names[i].clone()).collect())
    }

    #[test]
    fn dependency_goes_first() {
        assert_eq!(order_of(&["X", "Y"], &[&["Y"], &[]]).unwrap(), s(&["Y", "X"]));
    }

    #[test]
    fn ties_follow_discovery_order() {
        assert_eq!(
            order_of(&["C", "A", "B", "D"], &[&[], &[], &["D"], &[]]).unwrap(),
            s(&["C", "A", "D", "B"])
        );
    }

    #[test]
    fn outside_and_self_references_are_ignored() {
        assert_eq!(
            order_of(&["A", "B"], &[&["A", "Ancestor"], &["A"]]).unwrap(),
            s(&["A", "B"])
        );
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let err = order_of(&["A", "B", "C"], &[&["C"], &["A"], &["B"]]).unwrap_err();
        assert_eq!(err.first(), err.last());
        assert_eq!(err.len(), 4);
        for n in ["A", "B", "C"] {
            assert!(err.contains(&n.to_string()));
        }
    }
}
