use std::collections::{BTreeMap, BTreeSet, HashMap};

use pve_core::{CircularDependency, Deadline, ProductId, ProductRelationship, RelationshipType, Severity};

/// Rank used both for the pairwise tie-break and for picking the edge kind
/// kept between two nodes.
pub fn strength(t: RelationshipType) -> u8 {
    match t {
        RelationshipType::Incompatible => 4,
        RelationshipType::Requires => 3,
        RelationshipType::Recommends => 2,
        RelationshipType::Alternative => 1,
        RelationshipType::Optional => 0,
    }
}

/// Relationships with a blank endpoint, or a self-edge of any kind other than
/// `requires`.
pub fn is_malformed(rel: &ProductRelationship) -> bool {
    let src = rel.source_product_id.as_str().trim();
    let dst = rel.target_product_id.as_str().trim();
    src.is_empty() || dst.is_empty() || (src == dst && rel.relationship_type != RelationshipType::Requires)
}

fn unordered(a: &ProductId, b: &ProductId) -> (ProductId, ProductId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Directed relationship graph restricted to the selected products, built
/// once from a bulk relationship fetch.
#[derive(Clone, Debug, Default)]
pub struct RelationshipGraph {
    /// Sorted adjacency; the value holds every distinct kind declared
    /// `u -> v`, strongest first.
    adjacency: BTreeMap<ProductId, BTreeMap<ProductId, Vec<RelationshipType>>>,
    /// Strongest kind in either direction, keyed by the ordered pair.
    pairs: HashMap<(ProductId, ProductId), RelationshipType>,
}

impl RelationshipGraph {
    pub fn build(selected: &[ProductId], relationships: &[ProductRelationship]) -> Self {
        let nodes: BTreeSet<&ProductId> = selected.iter().collect();
        let mut g = Self::default();
        for id in &nodes {
            g.adjacency.entry((*id).clone()).or_default();
        }
        for rel in relationships {
            if is_malformed(rel) {
                continue;
            }
            let (src, dst) = (&rel.source_product_id, &rel.target_product_id);
            if !nodes.contains(src) || !nodes.contains(dst) {
                continue;
            }
            let kind = rel.relationship_type;
            let kinds = g.adjacency.entry(src.clone()).or_default().entry(dst.clone()).or_default();
            if !kinds.contains(&kind) {
                kinds.push(kind);
                kinds.sort_by_key(|k| std::cmp::Reverse(strength(*k)));
            }
            if src != dst {
                let slot = g.pairs.entry(unordered(src, dst)).or_insert(kind);
                if strength(kind) > strength(*slot) {
                    *slot = kind;
                }
            }
        }
        g
    }

    pub fn pair(&self, a: &ProductId, b: &ProductId) -> Option<RelationshipType> {
        self.pairs.get(&unordered(a, b)).copied()
    }

    /// Strongest kind declared `from -> to`.
    pub fn edge(&self, from: &ProductId, to: &ProductId) -> Option<RelationshipType> {
        self.kinds(from, to).first().copied()
    }

    pub fn kinds(&self, from: &ProductId, to: &ProductId) -> &[RelationshipType] {
        self.adjacency
            .get(from)
            .and_then(|m| m.get(to))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterative three-colour DFS over the edges `follow` accepts. Every
    /// back-edge closes a cycle; cycles are rotated to start at their
    /// smallest id and reported once. Returns the cycles and whether every
    /// root was visited before `deadline` expired.
    pub fn find_cycles<F>(&self, follow: F, deadline: Deadline) -> (Vec<Vec<ProductId>>, bool)
    where
        F: Fn(RelationshipType) -> bool,
    {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Gray,
            Black,
        }

        let mut colour: HashMap<&ProductId, Colour> = self.adjacency.keys().map(|k| (k, Colour::White)).collect();
        let mut seen: BTreeSet<Vec<ProductId>> = BTreeSet::new();
        let mut cycles = vec![];

        for root in self.adjacency.keys() {
            if colour.get(root) != Some(&Colour::White) {
                continue;
            }
            if deadline.expired() {
                return (cycles, false);
            }
            // (node, remaining successors); `path` mirrors the gray nodes.
            let mut stack: Vec<(&ProductId, Vec<&ProductId>)> = vec![(root, self.successors(root, &follow))];
            let mut path: Vec<&ProductId> = vec![root];
            colour.insert(root, Colour::Gray);

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let Some(next) = top.1.pop() else {
                    colour.insert(node, Colour::Black);
                    stack.pop();
                    path.pop();
                    continue;
                };
                match colour.get(next).copied().unwrap_or(Colour::Black) {
                    Colour::White => {
                        colour.insert(next, Colour::Gray);
                        path.push(next);
                        stack.push((next, self.successors(next, &follow)));
                    }
                    Colour::Gray => {
                        if let Some(start) = path.iter().position(|p| *p == next) {
                            let cycle = canonical(&path[start..]);
                            if seen.insert(cycle.clone()) {
                                cycles.push(cycle);
                            }
                        }
                    }
                    Colour::Black => {}
                }
            }
        }
        (cycles, true)
    }

    /// Successors in reverse order so that popping visits them ascending.
    fn successors<F>(&self, node: &ProductId, follow: &F) -> Vec<&ProductId>
    where
        F: Fn(RelationshipType) -> bool,
    {
        let mut out: Vec<&ProductId> = self
            .adjacency
            .get(node)
            .map(|m| {
                m.iter()
                    .filter(|(_, kinds)| kinds.iter().any(|k| follow(*k)))
                    .map(|(id, _)| id)
                    .collect()
            })
            .unwrap_or_default();
        out.reverse();
        out
    }
}

/// Rotates an open cycle to start at its smallest id and closes it.
fn canonical(open: &[&ProductId]) -> Vec<ProductId> {
    let start = open
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut out: Vec<ProductId> = open[start..].iter().chain(&open[..start]).map(|p| (*p).clone()).collect();
    if let Some(first) = out.first().cloned() {
        out.push(first);
    }
    out
}

/// Cycle severity: `error` when every step is backed by a `requires` edge,
/// else `warning`.
pub fn cycle_severity(graph: &RelationshipGraph, path: &[ProductId]) -> Severity {
    let all_requires = path
        .windows(2)
        .all(|w| graph.kinds(&w[0], &w[1]).contains(&RelationshipType::Requires));
    if all_requires {
        Severity::Error
    } else {
        Severity::Warning
    }
}

pub fn to_circular(graph: &RelationshipGraph, cycles: Vec<Vec<ProductId>>) -> Vec<CircularDependency> {
    cycles
        .into_iter()
        .map(|path| CircularDependency {
            severity: cycle_severity(graph, &path),
            path,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(a: &str, b: &str, t: RelationshipType) -> ProductRelationship {
        ProductRelationship {
            source_product_id: a.into(),
            target_product_id: b.into(),
            relationship_type: t,
            quantity: None,
            condition: None,
        }
    }

    fn ids(v: &[&str]) -> Vec<ProductId> {
        v.iter().map(|s| ProductId::from_str(*s)).collect()
    }

    fn requires(t: RelationshipType) -> bool {
        t == RelationshipType::Requires
    }

    #[test]
    fn two_node_cycle_is_reported_once() {
        let g = RelationshipGraph::build(
            &ids(&["X", "Y"]),
            &[rel("X", "Y", RelationshipType::Requires), rel("Y", "X", RelationshipType::Requires)],
        );
        let (cycles, complete) = g.find_cycles(requires, Deadline::none());
        assert!(complete);
        assert_eq!(cycles, vec![ids(&["X", "Y", "X"])]);
    }

    #[test]
    fn rotations_collapse_to_smallest_start() {
        let g = RelationshipGraph::build(
            &ids(&["A", "B", "C"]),
            &[
                rel("B", "C", RelationshipType::Requires),
                rel("C", "A", RelationshipType::Requires),
                rel("A", "B", RelationshipType::Requires),
            ],
        );
        let (cycles, _) = g.find_cycles(requires, Deadline::none());
        assert_eq!(cycles, vec![ids(&["A", "B", "C", "A"])]);
    }

    #[test]
    fn self_loop_is_a_one_node_cycle() {
        let g = RelationshipGraph::build(&ids(&["S"]), &[rel("S", "S", RelationshipType::Requires)]);
        let (cycles, _) = g.find_cycles(requires, Deadline::none());
        assert_eq!(cycles, vec![ids(&["S", "S"])]);
    }

    #[test]
    fn unselected_nodes_are_ignored() {
        let g = RelationshipGraph::build(
            &ids(&["X"]),
            &[rel("X", "Y", RelationshipType::Requires), rel("Y", "X", RelationshipType::Requires)],
        );
        let (cycles, _) = g.find_cycles(requires, Deadline::none());
        assert!(cycles.is_empty());
    }

    #[test]
    fn dag_has_no_cycles() {
        let g = RelationshipGraph::build(
            &ids(&["A", "B", "C", "D"]),
            &[
                rel("A", "B", RelationshipType::Requires),
                rel("A", "C", RelationshipType::Requires),
                rel("B", "D", RelationshipType::Requires),
                rel("C", "D", RelationshipType::Requires),
            ],
        );
        assert!(g.find_cycles(requires, Deadline::none()).0.is_empty());
    }

    #[test]
    fn strongest_pair_kind_wins() {
        let g = RelationshipGraph::build(
            &ids(&["A", "B"]),
            &[rel("A", "B", RelationshipType::Requires), rel("B", "A", RelationshipType::Incompatible)],
        );
        assert_eq!(g.pair(&"A".into(), &"B".into()), Some(RelationshipType::Incompatible));
        assert_eq!(g.pair(&"B".into(), &"A".into()), Some(RelationshipType::Incompatible));
        assert_eq!(g.edge(&"A".into(), &"B".into()), Some(RelationshipType::Requires));
    }

    #[test]
    fn requires_cycle_survives_stronger_parallel_edge() {
        let g = RelationshipGraph::build(
            &ids(&["A", "B"]),
            &[
                rel("A", "B", RelationshipType::Requires),
                rel("A", "B", RelationshipType::Incompatible),
                rel("B", "A", RelationshipType::Requires),
            ],
        );
        assert_eq!(g.edge(&"A".into(), &"B".into()), Some(RelationshipType::Incompatible));
        let (cycles, _) = g.find_cycles(requires, Deadline::none());
        assert_eq!(cycles, vec![ids(&["A", "B", "A"])]);
        assert_eq!(cycle_severity(&g, &cycles[0]), Severity::Error);
    }

    #[test]
    fn malformed_edges_are_detected() {
        assert!(is_malformed(&rel(" ", "A", RelationshipType::Requires)));
        assert!(is_malformed(&rel("A", "A", RelationshipType::Incompatible)));
        assert!(!is_malformed(&rel("A", "A", RelationshipType::Requires)));
    }

    #[test]
    fn expired_deadline_reports_incomplete() {
        let g = RelationshipGraph::build(&ids(&["A"]), &[]);
        let (_, complete) = g.find_cycles(requires, Deadline::after(std::time::Duration::ZERO));
        assert!(!complete);
    }
}
