use crate::error::{RuntimeError, RuntimeResult};

use std::collections::HashMap;

pub(crate) mod build;
mod group;

/// Scope of a locality domain, ordered coarse to fine. Group domains
/// are created by the grouping transforms and sit outside the
/// hardware ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Undefined,
    Global,
    Node,
    Module,
    Numa,
    Core,
    Group,
}

impl Scope {
    /// The next finer hardware scope.
    pub fn finer(&self) -> Scope {
        match self {
            Scope::Global => Scope::Node,
            Scope::Node => Scope::Module,
            Scope::Module => Scope::Numa,
            Scope::Numa => Scope::Core,
            _ => Scope::Undefined,
        }
    }

    /// The next coarser hardware scope.
    pub fn coarser(&self) -> Scope {
        match self {
            Scope::Core => Scope::Numa,
            Scope::Numa => Scope::Module,
            Scope::Module => Scope::Node,
            Scope::Node => Scope::Global,
            _ => Scope::Undefined,
        }
    }
}

/// Caller-facing snapshot of one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainInfo {
    pub tag: String,
    pub scope: Scope,
    pub level: u16,
    pub relative_index: u16,
    pub unit_ids: Vec<u16>,
    pub num_units: usize,
    pub num_nodes: usize,
    pub num_cores: u16,
    pub host: String,
    pub num_children: usize,
}

pub(crate) struct DomainNode {
    pub(crate) tag: String,
    pub(crate) scope: Scope,
    pub(crate) level: u16,
    pub(crate) relative_index: u16,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) unit_ids: Vec<u16>,
    pub(crate) num_nodes: usize,
    pub(crate) num_cores: u16,
    pub(crate) host: String,
}

/// The locality hierarchy of one team: a tree of domains addressed by
/// dotted-integer tags, rooted at the team-wide global domain.
///
/// Nodes live in a flat arena with parent and child links as arena
/// indices; the grouping transforms rewrite links and tags in place
/// and unreachable arena slots are simply retired.
pub struct DomainTree {
    pub(crate) team_id: u16,
    pub(crate) nodes: Vec<DomainNode>,
    pub(crate) index: HashMap<String, usize>,
}

pub(crate) const ROOT: usize = 0;

pub(crate) fn child_tag(parent_tag: &str, idx: usize) -> String {
    if parent_tag == "." {
        format!(".{}", idx)
    } else {
        format!("{}.{}", parent_tag, idx)
    }
}

pub(crate) fn tag_components(tag: &str) -> RuntimeResult<Vec<usize>> {
    if !tag.starts_with('.') {
        return Err(RuntimeError::NotFound);
    }
    tag.split('.')
        .filter(|c| !c.is_empty())
        .map(|c| c.parse::<usize>().map_err(|_| RuntimeError::NotFound))
        .collect()
}

pub(crate) fn tag_from_components(components: &[usize]) -> String {
    if components.is_empty() {
        ".".to_owned()
    } else {
        let mut tag = String::new();
        for c in components {
            tag.push('.');
            tag.push_str(&c.to_string());
        }
        tag
    }
}

impl DomainTree {
    pub fn team_id(&self) -> u16 {
        self.team_id
    }

    pub fn num_units(&self) -> usize {
        self.nodes[ROOT].unit_ids.len()
    }

    fn info(&self, idx: usize) -> DomainInfo {
        let n = &self.nodes[idx];
        DomainInfo {
            tag: n.tag.clone(),
            scope: n.scope,
            level: n.level,
            relative_index: n.relative_index,
            unit_ids: n.unit_ids.clone(),
            num_units: n.unit_ids.len(),
            num_nodes: n.num_nodes,
            num_cores: n.num_cores,
            host: n.host.clone(),
            num_children: n.children.len(),
        }
    }

    pub fn root(&self) -> DomainInfo {
        self.info(ROOT)
    }

    /// Resolve a domain by tag. Stored tags resolve directly, which
    /// keeps group domains addressable after later groupings shifted
    /// their position; any other tag is resolved by descending the
    /// index components from the root. Fails with `NotFound` when a
    /// component is out of range or the walk reaches a leaf before
    /// the tag is exhausted.
    pub fn domain_at(&self, tag: &str) -> RuntimeResult<DomainInfo> {
        if let Ok(idx) = self.lookup(tag) {
            return Ok(self.info(idx));
        }
        self.walk(tag).map(|idx| self.info(idx))
    }

    pub(crate) fn walk(&self, tag: &str) -> RuntimeResult<usize> {
        let mut idx = ROOT;
        for comp in tag_components(tag)? {
            let node = &self.nodes[idx];
            if comp >= node.children.len() {
                return Err(RuntimeError::NotFound);
            }
            idx = node.children[comp];
        }
        Ok(idx)
    }

    /// Resolve a domain by its stored tag, including group domains
    /// whose tag no longer matches their position.
    pub(crate) fn lookup(&self, tag: &str) -> RuntimeResult<usize> {
        self.index.get(tag).copied().ok_or(RuntimeError::NotFound)
    }

    /// Tags of all descendants at the given scope, in pre-order. The
    /// recursion does not descend past a match.
    pub fn scope_domains(&self, scope: Scope) -> RuntimeResult<Vec<String>> {
        let mut out = Vec::new();
        self.scope_rec(ROOT, scope, &mut out);
        if out.is_empty() {
            return Err(RuntimeError::NotFound);
        }
        Ok(out)
    }

    fn scope_rec(&self, idx: usize, scope: Scope, out: &mut Vec<String>) {
        let node = &self.nodes[idx];
        if node.scope == scope {
            out.push(node.tag.clone());
        } else {
            for &c in &node.children {
                self.scope_rec(c, scope, out);
            }
        }
    }

    /// Partition the domains at `scope` into `num_parts` balanced
    /// groups of tags: ceiling-sized groups, the last group taking
    /// the remainder.
    pub fn split(&self, scope: Scope, num_parts: usize) -> RuntimeResult<Vec<Vec<String>>> {
        if num_parts == 0 {
            return Err(RuntimeError::InvalidArgument);
        }
        let tags = self.scope_domains(scope)?;
        let max = tags.len().div_ceil(num_parts);
        let mut groups = Vec::with_capacity(num_parts);
        let mut first = 0;
        for g in 0..num_parts {
            let n = if (g + 1) * max > tags.len() {
                tags.len().saturating_sub(g * max)
            } else {
                max
            };
            groups.push(tags[first..first + n].to_vec());
            first += n;
        }
        Ok(groups)
    }

    pub(crate) fn rebuild_index(&mut self) {
        let mut index = HashMap::new();
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            index.insert(self.nodes[idx].tag.clone(), idx);
            stack.extend(self.nodes[idx].children.iter().copied());
        }
        self.index = index;
    }

    /// Rewrite a subtree's tags after it moved to a new position;
    /// descendants are renumbered positionally.
    pub(crate) fn retag_subtree(&mut self, idx: usize, new_tag: String) {
        self.nodes[idx].tag = new_tag;
        let children = self.nodes[idx].children.clone();
        let parent_tag = self.nodes[idx].tag.clone();
        for (i, c) in children.into_iter().enumerate() {
            self.retag_subtree(c, child_tag(&parent_tag, i));
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        // child unit sets are disjoint and union to the parent's, and
        // relative indices match positions
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !node.children.is_empty() {
                let mut seen = std::collections::HashSet::new();
                let mut total = 0;
                for (i, &c) in node.children.iter().enumerate() {
                    let child = &self.nodes[c];
                    assert_eq!(i as u16, child.relative_index, "index of {}", child.tag);
                    assert_eq!(Some(idx), child.parent, "parent of {}", child.tag);
                    for u in &child.unit_ids {
                        assert!(seen.insert(*u), "unit {} duplicated under {}", u, node.tag);
                    }
                    total += child.unit_ids.len();
                    stack.push(c);
                }
                assert_eq!(node.unit_ids.len(), total, "unit union under {}", node.tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::build::{build_tree, UnitRecord};
    use super::*;

    fn record(host: &str) -> UnitRecord {
        UnitRecord {
            host: host.to_owned(),
            num_modules: 1,
            num_numa: 1,
            num_cores: 4,
        }
    }

    fn two_node_tree() -> DomainTree {
        let members: Vec<u16> = (0..8).collect();
        let records: Vec<UnitRecord> = (0..8)
            .map(|u| record(if u < 4 { "h0" } else { "h1" }))
            .collect();
        build_tree(0, &members, &records)
    }

    #[test]
    fn scope_helpers_step_between_levels() {
        assert_eq!(Scope::Node, Scope::Global.finer());
        assert_eq!(Scope::Core, Scope::Numa.finer());
        assert_eq!(Scope::Undefined, Scope::Core.finer());
        assert_eq!(Scope::Global, Scope::Node.coarser());
        assert_eq!(Scope::Undefined, Scope::Group.coarser());
    }

    #[test]
    fn scope_domains_finds_nodes() {
        let tree = two_node_tree();
        assert_eq!(vec![".".to_owned()], tree.scope_domains(Scope::Global).unwrap());
        assert_eq!(
            vec![".0".to_owned(), ".1".to_owned()],
            tree.scope_domains(Scope::Node).unwrap()
        );
        assert_eq!(8, tree.scope_domains(Scope::Core).unwrap().len());
        assert_eq!(
            Err(RuntimeError::NotFound),
            tree.scope_domains(Scope::Group)
        );
    }

    #[test]
    fn domain_at_walks_tags() {
        let tree = two_node_tree();
        let root = tree.domain_at(".").unwrap();
        assert_eq!(Scope::Global, root.scope);
        assert_eq!(8, root.num_units);
        assert_eq!(2, root.num_nodes);

        let node1 = tree.domain_at(".1").unwrap();
        assert_eq!(Scope::Node, node1.scope);
        assert_eq!(vec![4, 5, 6, 7], node1.unit_ids);
        assert_eq!("h1", node1.host);

        // every stored tag resolves to itself
        for n in &tree.nodes {
            assert_eq!(n.tag, tree.domain_at(&n.tag).unwrap().tag);
        }
    }

    #[test]
    fn domain_at_rejects_bad_tags() {
        let tree = two_node_tree();
        assert_eq!(Err(RuntimeError::NotFound), tree.domain_at(".7"));
        assert_eq!(Err(RuntimeError::NotFound), tree.domain_at(".0.0.0.0.9"));
        assert_eq!(Err(RuntimeError::NotFound), tree.domain_at(".0.0.0.0.0.0"));
        assert_eq!(Err(RuntimeError::NotFound), tree.domain_at("0.1"));
        assert_eq!(Err(RuntimeError::NotFound), tree.domain_at(".x"));
    }

    #[test]
    fn split_balances_groups() {
        let tree = two_node_tree();
        let parts = tree.split(Scope::Node, 2).unwrap();
        assert_eq!(vec![vec![".0".to_owned()], vec![".1".to_owned()]], parts);

        let parts = tree.split(Scope::Core, 3).unwrap();
        assert_eq!(3, parts.len());
        assert_eq!(3, parts[0].len());
        assert_eq!(3, parts[1].len());
        assert_eq!(2, parts[2].len());

        // more parts than domains leaves trailing groups empty
        let parts = tree.split(Scope::Node, 3).unwrap();
        assert_eq!(vec![1, 1, 0], parts.iter().map(|p| p.len()).collect::<Vec<_>>());
    }

    #[test]
    fn invariants_hold_after_build() {
        let tree = two_node_tree();
        tree.check_invariants();
    }
}
