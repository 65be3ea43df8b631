//! Reference graph builder
//!
//! Turns declarations into a DAG whose edges run from producer to consumer,
//! and orders it topologically. Ties are broken by declaration order
//! (providers first, then resources) so unchanged inputs always yield the same
//! plan.

use crate::error::DeclarationError;
use crate::spec::Declarations;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// What a graph node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Provider,
    Resource,
}

/// A declared provider or resource
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Position in the declaration set (providers first)
    pub position: usize,
}

/// Dependency graph over declarations
#[derive(Debug, Clone)]
pub struct ReferenceGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    /// Producers of each node
    dependencies: Vec<Vec<usize>>,
    /// Consumers of each node
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl ReferenceGraph {
    /// Build the graph, rejecting duplicates, dangling references and cycles
    pub fn build(decls: &Declarations) -> Result<Self, DeclarationError> {
        decls.check_unique_names()?;

        let mut nodes = Vec::with_capacity(decls.providers.len() + decls.resources.len());
        for provider in &decls.providers {
            nodes.push(Node {
                name: provider.name.clone(),
                kind: NodeKind::Provider,
                position: nodes.len(),
            });
        }
        for resource in &decls.resources {
            nodes.push(Node {
                name: resource.name.clone(),
                kind: NodeKind::Resource,
                position: nodes.len(),
            });
        }
        let index: HashMap<String, usize> = nodes
            .iter()
            .map(|n| (n.name.clone(), n.position))
            .collect();

        let resource_target = |consumer: &str, target: &str| -> Result<usize, DeclarationError> {
            match index.get(target) {
                Some(&i) if nodes[i].kind == NodeKind::Resource => Ok(i),
                _ => Err(DeclarationError::DanglingReference {
                    consumer: consumer.to_string(),
                    target: target.to_string(),
                }),
            }
        };

        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        for (i, provider) in decls.providers.iter().enumerate() {
            for target in provider.referenced_resources() {
                dependencies[i].insert(resource_target(&provider.name, target)?);
            }
        }
        let offset = decls.providers.len();
        for (j, resource) in decls.resources.iter().enumerate() {
            let i = offset + j;
            for target in resource.referenced_resources() {
                dependencies[i].insert(resource_target(&resource.name, target)?);
            }
            if let Some(provider) = resource.provider.name() {
                match index.get(provider) {
                    Some(&p) if nodes[p].kind == NodeKind::Provider => {
                        dependencies[i].insert(p);
                    }
                    _ => {
                        return Err(DeclarationError::DanglingReference {
                            consumer: resource.name.clone(),
                            target: provider.to_string(),
                        });
                    }
                }
            }
        }

        let dependencies: Vec<Vec<usize>> = dependencies
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect();
        let order = topological_order(&dependencies).map_err(|cycle| DeclarationError::Cycle {
            names: cycle.iter().map(|&i| nodes[i].name.clone()).collect(),
        })?;
        let dependents = invert(&dependencies);

        log::debug!("Built reference graph with {} nodes", nodes.len());
        Ok(Self {
            nodes,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Node indices in topological order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Node names in topological order
    pub fn ordered_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].name.as_str()).collect()
    }

    /// Producers of each node, indexed like the nodes
    pub fn dependency_lists(&self) -> &[Vec<usize>] {
        &self.dependencies
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependencies)
    }

    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependents)
    }

    /// Resource producers of a node (provider bindings excluded)
    pub fn resource_dependencies_of(&self, name: &str) -> Vec<String> {
        self.index_of(name)
            .map(|i| {
                self.dependencies[i]
                    .iter()
                    .filter(|&&d| self.nodes[d].kind == NodeKind::Resource)
                    .map(|&d| self.nodes[d].name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn neighbours<'a>(&'a self, name: &str, lists: &'a [Vec<usize>]) -> Vec<&'a str> {
        self.index_of(name)
            .map(|i| lists[i].iter().map(|&d| self.nodes[d].name.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Kahn's algorithm over `dependencies[i]` = producers of `i`
///
/// Ready nodes are taken lowest index first. On failure returns one cycle as
/// node indices, first node repeated at the end.
pub fn topological_order(dependencies: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = dependencies.len();
    let dependents = invert(dependencies);
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| remaining[i] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &consumer in &dependents[node] {
            remaining[consumer] -= 1;
            if remaining[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err(find_cycle(dependencies, &remaining))
    }
}

/// Walk producer edges among unfinished nodes until one repeats
fn find_cycle(dependencies: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let Some(start) = (0..remaining.len()).find(|&i| remaining[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen_at: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        // Every unfinished node has at least one unfinished producer.
        let Some(&next) = dependencies[current].iter().find(|&&d| remaining[d] > 0) else {
            return path;
        };
        if let Some(&pos) = seen_at.get(&next) {
            // Producer edges were followed, so reverse into producer -> consumer order.
            let mut cycle: Vec<usize> = path[pos..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            return cycle;
        }
        seen_at.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

/// Deletion prerequisites of applied entries, given as `(name, dependencies)`
///
/// For each entry, lists the entries that depend on it and so must be deleted
/// first. Dependencies outside the set are ignored; several entries may share
/// a name (a replaced instance and its successor).
pub fn deletion_prerequisites(entries: &[(&str, &[String])]) -> Vec<Vec<usize>> {
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, (name, _)) in entries.iter().enumerate() {
        by_name.entry(*name).or_default().push(i);
    }

    let mut producers: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, (_, dependencies)) in entries.iter().enumerate() {
        for dependency in *dependencies {
            for &p in by_name.get(dependency.as_str()).into_iter().flatten() {
                if p != i && !producers[i].contains(&p) {
                    producers[i].push(p);
                }
            }
        }
    }
    invert(&producers)
}

/// Order in which applied entries can be deleted, consumers first
///
/// Falls back to the given order when recorded dependencies form a cycle.
pub fn deletion_order(entries: &[(&str, &[String])]) -> Vec<usize> {
    topological_order(&deletion_prerequisites(entries)).unwrap_or_else(|cycle| {
        log::warn!("Recorded dependencies contain a cycle through {} entries", cycle.len());
        (0..entries.len()).collect()
    })
}

/// Turn producer lists into consumer lists
pub fn invert(dependencies: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut dependents = vec![Vec::new(); dependencies.len()];
    for (consumer, producers) in dependencies.iter().enumerate() {
        for &producer in producers {
            dependents[producer].push(consumer);
        }
    }
    dependents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ProviderSpec, ResourceSpec};

    fn vm_declarations() -> Declarations {
        Declarations::new()
            .with_provider(ProviderSpec::new("provider", "libvirt"))
            .with_resource(ResourceSpec::new("pool", "libvirt:pool").provider("provider"))
            .with_resource(
                ResourceSpec::new("v1", "libvirt:volume")
                    .arg_ref("pool", "pool", "name")
                    .unwrap(),
            )
            .with_resource(
                ResourceSpec::new("v2", "libvirt:volume")
                    .arg_ref("base_volume_id", "v1", "id")
                    .unwrap(),
            )
            .with_resource(ResourceSpec::new("net", "libvirt:network"))
            .with_resource(
                ResourceSpec::new("domain", "libvirt:domain")
                    .arg_ref("disk", "v2", "id")
                    .unwrap()
                    .arg_ref("network_id", "net", "id")
                    .unwrap(),
            )
    }

    fn position(order: &[&str], name: &str) -> usize {
        order.iter().position(|n| *n == name).unwrap()
    }

    #[test]
    fn test_producers_precede_consumers() {
        let graph = ReferenceGraph::build(&vm_declarations()).unwrap();
        let order = graph.ordered_names();
        assert_eq!(order.len(), 6);
        assert!(position(&order, "provider") < position(&order, "pool"));
        assert!(position(&order, "pool") < position(&order, "v1"));
        assert!(position(&order, "v1") < position(&order, "v2"));
        assert!(position(&order, "v2") < position(&order, "domain"));
        assert!(position(&order, "net") < position(&order, "domain"));
    }

    #[test]
    fn test_order_is_stable_by_declaration() {
        let graph = ReferenceGraph::build(&vm_declarations()).unwrap();
        assert_eq!(
            graph.ordered_names(),
            vec!["provider", "pool", "v1", "v2", "net", "domain"]
        );
    }

    #[test]
    fn test_cycle_is_reported_with_members() {
        let decls = Declarations::new()
            .with_resource(ResourceSpec::new("free", "k"))
            .with_resource(ResourceSpec::new("a", "k").arg_ref("x", "b", "id").unwrap())
            .with_resource(ResourceSpec::new("b", "k").arg_ref("x", "c", "id").unwrap())
            .with_resource(ResourceSpec::new("c", "k").arg_ref("x", "a", "id").unwrap());
        match ReferenceGraph::build(&decls) {
            Err(DeclarationError::Cycle { names }) => {
                assert_eq!(names.first(), names.last());
                let members: BTreeSet<&str> = names.iter().map(String::as_str).collect();
                assert_eq!(members, BTreeSet::from(["a", "b", "c"]));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let decls = Declarations::new()
            .with_resource(ResourceSpec::new("a", "k").arg_ref("x", "a", "id").unwrap());
        assert!(matches!(
            ReferenceGraph::build(&decls),
            Err(DeclarationError::Cycle { .. })
        ));
    }

    #[test]
    fn test_dangling_reference() {
        let decls = Declarations::new()
            .with_resource(ResourceSpec::new("v1", "k").arg_ref("pool", "missing", "name").unwrap());
        assert_eq!(
            ReferenceGraph::build(&decls).unwrap_err(),
            DeclarationError::DanglingReference {
                consumer: "v1".into(),
                target: "missing".into()
            }
        );
    }

    #[test]
    fn test_unknown_provider_binding_is_dangling() {
        let decls =
            Declarations::new().with_resource(ResourceSpec::new("v1", "k").provider("nowhere"));
        assert!(matches!(
            ReferenceGraph::build(&decls),
            Err(DeclarationError::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_deletion_order_removes_consumers_first() {
        let pool: Vec<String> = Vec::new();
        let v1 = vec!["pool".to_string()];
        let domain = vec!["v1".to_string(), "gone".to_string()];
        let entries: Vec<(&str, &[String])> = vec![
            ("pool", pool.as_slice()),
            ("v1", v1.as_slice()),
            ("domain", domain.as_slice()),
            ("other", pool.as_slice()),
        ];
        let order: Vec<&str> = deletion_order(&entries)
            .into_iter()
            .map(|i| entries[i].0)
            .collect();
        assert_eq!(order, vec!["domain", "v1", "pool", "other"]);
    }

    #[test]
    fn test_deletion_prerequisites_with_shared_names() {
        let none: Vec<String> = Vec::new();
        let uses_v1 = vec!["v1".to_string()];
        let entries: Vec<(&str, &[String])> = vec![
            ("v1", none.as_slice()),
            ("v1", none.as_slice()),
            ("domain", uses_v1.as_slice()),
        ];
        let prerequisites = deletion_prerequisites(&entries);
        assert_eq!(prerequisites, vec![vec![2], vec![2], Vec::new()]);
    }

    #[test]
    fn test_neighbour_queries() {
        let graph = ReferenceGraph::build(&vm_declarations()).unwrap();
        assert_eq!(graph.dependencies_of("domain"), vec!["v2", "net"]);
        assert_eq!(graph.dependents_of("v1"), vec!["v2"]);
        assert_eq!(graph.resource_dependencies_of("pool"), Vec::<String>::new());
        assert_eq!(graph.dependencies_of("pool"), vec!["provider"]);
    }
}
