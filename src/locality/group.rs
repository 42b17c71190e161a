use crate::error::{RuntimeError, RuntimeResult};
use crate::locality::{
    child_tag, tag_components, tag_from_components, DomainNode, DomainTree, Scope,
};

use std::collections::HashSet;

impl DomainTree {
    /// Move a subset of `parent`'s immediate children into a new group
    /// domain.
    ///
    /// The child list is rebuilt as pre-existing groups, then the
    /// remaining children, then the new group last, so that tags of
    /// untouched siblings stay stable. Remaining children are retagged
    /// to their new positions; tags of pre-existing groups are left
    /// unchanged. Fails with `NotFound` if any subset tag is not an
    /// immediate child of `parent`.
    pub fn group_subdomains(&mut self, parent_tag: &str, subset: &[String]) -> RuntimeResult<()> {
        if subset.is_empty() {
            return Err(RuntimeError::InvalidArgument);
        }
        let parent_idx = self.lookup(parent_tag)?;

        // sorted copy of the subset, so the ordered child list
        // partitions in a single pass
        let mut sorted: Vec<(Vec<usize>, String)> = subset
            .iter()
            .map(|t| Ok((tag_components(t)?, t.clone())))
            .collect::<RuntimeResult<_>>()?;
        sorted.sort();

        let children = self.nodes[parent_idx].children.clone();
        let mut groups = Vec::new();
        let mut chosen = Vec::new();
        let mut remaining = Vec::new();
        let mut sdt = 0;
        for c in children {
            let node = &self.nodes[c];
            if node.scope == Scope::Group {
                groups.push(c);
            } else if sdt < sorted.len() && node.tag == sorted[sdt].1 {
                chosen.push(c);
                sdt += 1;
            } else {
                remaining.push(c);
            }
        }
        if sdt != sorted.len() {
            return Err(RuntimeError::NotFound);
        }

        let parent_tag = self.nodes[parent_idx].tag.clone();
        let parent_level = self.nodes[parent_idx].level;
        let parent_host = self.nodes[parent_idx].host.clone();
        let group_pos = groups.len() + remaining.len();
        let group_tag = self.free_child_tag(parent_idx, group_pos);

        let mut unit_ids = Vec::new();
        let mut num_nodes = 0;
        let mut num_cores = 0;
        for &c in &chosen {
            unit_ids.extend_from_slice(&self.nodes[c].unit_ids);
            num_nodes += self.nodes[c].num_nodes;
            num_cores += self.nodes[c].num_cores;
        }
        let g_idx = self.nodes.len();
        self.nodes.push(DomainNode {
            tag: group_tag.clone(),
            scope: Scope::Group,
            level: parent_level + 1,
            relative_index: group_pos as u16,
            parent: Some(parent_idx),
            children: chosen.clone(),
            unit_ids,
            num_nodes,
            num_cores,
            host: parent_host,
        });

        for (i, &c) in chosen.iter().enumerate() {
            self.nodes[c].parent = Some(g_idx);
            self.nodes[c].relative_index = i as u16;
            self.retag_subtree(c, child_tag(&group_tag, i));
            self.relevel_subtree(c, parent_level + 2);
        }
        for (i, &c) in groups.iter().enumerate() {
            self.nodes[c].relative_index = i as u16;
        }
        for (j, &c) in remaining.iter().enumerate() {
            let pos = groups.len() + j;
            self.nodes[c].relative_index = pos as u16;
            self.retag_subtree(c, child_tag(&parent_tag, pos));
        }

        let mut new_children = groups;
        new_children.extend(remaining);
        new_children.push(g_idx);
        self.nodes[parent_idx].children = new_children;
        self.rebuild_index();
        Ok(())
    }

    /// For each group spec, find the lowest common ancestor of the
    /// named domains and group them under it: directly when all of
    /// them are immediate children, otherwise by copying the selected
    /// branches under a new group domain and pruning everything else
    /// out of the copy.
    pub fn group(&mut self, specs: &[Vec<String>]) -> RuntimeResult<()> {
        if specs.is_empty() {
            return Err(RuntimeError::InvalidArgument);
        }
        for spec in specs {
            if spec.is_empty() {
                return Err(RuntimeError::InvalidArgument);
            }
            let comp_lists: Vec<Vec<usize>> = spec
                .iter()
                .map(|t| tag_components(t))
                .collect::<RuntimeResult<_>>()?;
            let mut prefix = comp_lists[0].clone();
            for cl in &comp_lists[1..] {
                let common = prefix
                    .iter()
                    .zip(cl.iter())
                    .take_while(|(a, b)| a == b)
                    .count();
                prefix.truncate(common);
            }
            // a spec naming a domain and nothing outside it groups
            // under that domain's parent
            if comp_lists.iter().any(|cl| cl.len() == prefix.len()) {
                prefix.pop();
            }
            let lca_tag = tag_from_components(&prefix);
            if comp_lists.iter().all(|cl| cl.len() == prefix.len() + 1) {
                self.group_subdomains(&lca_tag, spec)?;
            } else {
                self.group_indirect(&lca_tag, prefix.len(), &comp_lists)?;
            }
        }
        Ok(())
    }

    fn group_indirect(
        &mut self,
        lca_tag: &str,
        lca_len: usize,
        comp_lists: &[Vec<usize>],
    ) -> RuntimeResult<()> {
        let parent_idx = self.lookup(lca_tag)?;

        // immediate children of the ancestor that contain selected
        // domains, deduplicated
        let mut imm: Vec<Vec<usize>> = comp_lists
            .iter()
            .map(|cl| cl[..lca_len + 1].to_vec())
            .collect();
        imm.sort();
        imm.dedup();

        let parent_level = self.nodes[parent_idx].level;
        let parent_host = self.nodes[parent_idx].host.clone();
        let group_pos = self.nodes[parent_idx].children.len();
        let group_tag = self.free_child_tag(parent_idx, group_pos);
        let g_idx = self.nodes.len();
        self.nodes.push(DomainNode {
            tag: group_tag.clone(),
            scope: Scope::Group,
            level: parent_level + 1,
            relative_index: group_pos as u16,
            parent: Some(parent_idx),
            children: Vec::new(),
            unit_ids: Vec::new(),
            num_nodes: 0,
            num_cores: 0,
            host: parent_host,
        });

        for (i, imm_comps) in imm.iter().enumerate() {
            let src = self.lookup(&tag_from_components(imm_comps))?;
            let copy = self.copy_subtree(src, g_idx);
            self.nodes[g_idx].children.push(copy);
            self.prune_to_selection(copy, comp_lists);
            self.nodes[copy].relative_index = i as u16;
            self.retag_subtree(copy, child_tag(&group_tag, i));
            self.relevel_subtree(copy, parent_level + 2);
        }

        let mut unit_ids = Vec::new();
        let mut num_nodes = 0;
        let mut num_cores = 0;
        for &c in &self.nodes[g_idx].children.clone() {
            unit_ids.extend_from_slice(&self.nodes[c].unit_ids);
            num_nodes += self.nodes[c].num_nodes;
            num_cores += self.nodes[c].num_cores;
        }
        self.nodes[g_idx].unit_ids = unit_ids;
        self.nodes[g_idx].num_nodes = num_nodes;
        self.nodes[g_idx].num_cores = num_cores;

        self.nodes[parent_idx].children.push(g_idx);
        self.rebuild_index();
        Ok(())
    }

    fn copy_subtree(&mut self, src: usize, parent: usize) -> usize {
        let idx = self.nodes.len();
        let node = DomainNode {
            tag: self.nodes[src].tag.clone(),
            scope: self.nodes[src].scope,
            level: self.nodes[src].level,
            relative_index: self.nodes[src].relative_index,
            parent: Some(parent),
            children: Vec::new(),
            unit_ids: self.nodes[src].unit_ids.clone(),
            num_nodes: self.nodes[src].num_nodes,
            num_cores: self.nodes[src].num_cores,
            host: self.nodes[src].host.clone(),
        };
        self.nodes.push(node);
        let src_children = self.nodes[src].children.clone();
        for c in src_children {
            let cc = self.copy_subtree(c, idx);
            self.nodes[idx].children.push(cc);
        }
        idx
    }

    // Drop every branch of the copied subtree that neither contains
    // nor sits below a selected domain, and refresh the aggregates on
    // the kept interior nodes. Runs before retagging, while the copy
    // still carries the source tags the selection refers to.
    fn prune_to_selection(&mut self, idx: usize, selected: &[Vec<usize>]) {
        let node_comps = match tag_components(&self.nodes[idx].tag) {
            Ok(c) => c,
            Err(_) => return,
        };
        if selected.iter().any(|s| node_comps.starts_with(s)) {
            return;
        }
        let children = self.nodes[idx].children.clone();
        let mut kept = Vec::new();
        for c in children {
            let c_comps = match tag_components(&self.nodes[c].tag) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if selected
                .iter()
                .any(|s| s.starts_with(&c_comps) || c_comps.starts_with(s))
            {
                kept.push(c);
            }
        }
        let mut unit_ids = Vec::new();
        let mut num_nodes = 0;
        let mut num_cores = 0;
        for (i, &c) in kept.iter().enumerate() {
            self.nodes[c].relative_index = i as u16;
            self.prune_to_selection(c, selected);
            unit_ids.extend_from_slice(&self.nodes[c].unit_ids);
            num_nodes += self.nodes[c].num_nodes;
            num_cores += self.nodes[c].num_cores;
        }
        self.nodes[idx].children = kept;
        self.nodes[idx].unit_ids = unit_ids;
        self.nodes[idx].num_nodes = num_nodes.max(1);
        self.nodes[idx].num_cores = num_cores;
    }

    // First unused child tag at or after `from_pos`. Only tags of
    // pre-existing group children can conflict, everything else is
    // renumbered to the positions below `from_pos`; a later grouping
    // can still find the positional tag taken by a preserved group
    // tag, in which case the next free suffix is used.
    fn free_child_tag(&self, parent_idx: usize, from_pos: usize) -> String {
        let parent_tag = &self.nodes[parent_idx].tag;
        let taken: HashSet<&str> = self.nodes[parent_idx]
            .children
            .iter()
            .filter(|&&c| self.nodes[c].scope == Scope::Group)
            .map(|&c| self.nodes[c].tag.as_str())
            .collect();
        let mut pos = from_pos;
        loop {
            let tag = child_tag(parent_tag, pos);
            if !taken.contains(tag.as_str()) {
                return tag;
            }
            pos += 1;
        }
    }

    fn relevel_subtree(&mut self, idx: usize, level: u16) {
        self.nodes[idx].level = level;
        let children = self.nodes[idx].children.clone();
        for c in children {
            self.relevel_subtree(c, level + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::RuntimeError;
    use crate::locality::build::{build_tree, UnitRecord};
    use crate::locality::{DomainTree, Scope};

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
    fn group_one_node_under_root() {
        let mut tree = two_node_tree();
        let units_before = tree.root().unit_ids.clone();

        tree.group_subdomains(".", &[".0".to_owned()]).unwrap();
        tree.check_invariants();

        let root = tree.root();
        assert_eq!(2, root.num_children);
        assert_eq!(units_before, root.unit_ids);

        // the remaining node moved to the front and was retagged
        let first = tree.domain_at(".0").unwrap();
        assert_eq!(Scope::Node, first.scope);
        assert_eq!("h1", first.host);

        // the group sits last
        let group = tree.domain_at(".1").unwrap();
        assert_eq!(Scope::Group, group.scope);
        assert_eq!(4, group.num_units);
        assert_eq!(vec![0, 1, 2, 3], group.unit_ids);

        // the grouped node and its subtree were renumbered
        let inner = tree.domain_at(".1.0").unwrap();
        assert_eq!(Scope::Node, inner.scope);
        assert_eq!("h0", inner.host);
        assert_eq!(Scope::Core, tree.domain_at(".1.0.0.0.3").unwrap().scope);
    }

    #[test]
    fn group_subdomains_rejects_non_children() {
        let mut tree = two_node_tree();
        assert_eq!(
            Err(RuntimeError::NotFound),
            tree.group_subdomains(".", &[".0.0".to_owned()])
        );
        assert_eq!(
            Err(RuntimeError::NotFound),
            tree.group_subdomains(".", &[".5".to_owned()])
        );
    }

    #[test]
    fn second_grouping_keeps_existing_group_tag() {
        let mut tree = two_node_tree();
        tree.group_subdomains(".", &[".0".to_owned()]).unwrap();
        // the first group now carries tag .1
        tree.group_subdomains(".", &[".0".to_owned()]).unwrap();

        let root = tree.root();
        assert_eq!(2, root.num_children);
        assert_eq!(8, root.num_units);

        // first child is the preserved group, tag unchanged
        let kept = tree.domain_at(".1").unwrap();
        assert_eq!(Scope::Group, kept.scope);
        assert_eq!(0, kept.relative_index);
        // the new group took the next free suffix
        let newest = tree.domain_at(".2").unwrap();
        assert_eq!(Scope::Group, newest.scope);
        assert_eq!(vec![4, 5, 6, 7], newest.unit_ids);
    }

    #[test]
    fn split_then_group_scope_level() {
        let mut tree = two_node_tree();
        let parts = tree.split(Scope::Node, 2).unwrap();
        assert_eq!(2, parts.len());
        assert_eq!(1, parts[0].len());

        tree.group(&parts[..1]).unwrap();
        tree.check_invariants();
        let group = tree.domain_at(".1").unwrap();
        assert_eq!(Scope::Group, group.scope);
        assert_eq!(4, group.num_units);
    }

    #[test]
    fn indirect_group_copies_and_prunes() {
        let mut tree = two_node_tree();
        // two cores of the first node plus one of the second
        let spec = vec![
            ".0.0.0.0".to_owned(),
            ".0.0.0.1".to_owned(),
            ".1.0.0.0".to_owned(),
        ];
        tree.group(&[spec]).unwrap();

        let root = tree.root();
        assert_eq!(3, root.num_children);
        let group = tree.domain_at(".2").unwrap();
        assert_eq!(Scope::Group, group.scope);
        assert_eq!(vec![0, 1, 4], group.unit_ids);
        assert_eq!(2, group.num_children);

        // the copies were pruned to the selected branches
        let first_copy = tree.domain_at(".2.0").unwrap();
        assert_eq!(Scope::Node, first_copy.scope);
        assert_eq!(vec![0, 1], first_copy.unit_ids);
        let second_copy = tree.domain_at(".2.1").unwrap();
        assert_eq!(vec![4], second_copy.unit_ids);

        // the originals are still in place
        assert_eq!(4, tree.domain_at(".0").unwrap().num_units);
        assert_eq!(4, tree.domain_at(".1").unwrap().num_units);
    }

    #[test]
    fn single_tag_spec_groups_under_its_parent() {
        let mut tree = two_node_tree();
        tree.group(&[vec![".0.0.0.1".to_owned()]]).unwrap();
        // grouped under the numa domain .0.0.0
        let numa = tree.domain_at(".0.0.0").unwrap();
        assert_eq!(4, numa.num_children);
        let group = tree.domain_at(".0.0.0.3").unwrap();
        assert_eq!(Scope::Group, group.scope);
        assert_eq!(vec![1], group.unit_ids);
    }
}
