use crate::locality::{child_tag, DomainNode, DomainTree, Scope, ROOT};
use crate::transport::HwInfo;

use std::collections::HashMap;

pub(crate) const HOST_MAX: usize = 64;

/// Locality facts one unit reports about itself, exchanged between
/// all members when a team is created.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UnitRecord {
    pub(crate) host: String,
    pub(crate) num_modules: u16,
    pub(crate) num_numa: u16,
    pub(crate) num_cores: u16,
}

impl UnitRecord {
    pub(crate) const WIRE_SIZE: usize = HOST_MAX + 8;

    pub(crate) fn from_hwinfo(hw: &HwInfo) -> UnitRecord {
        UnitRecord {
            host: hw.host.clone(),
            num_modules: hw.num_modules,
            num_numa: hw.num_numa,
            num_cores: hw.num_cores,
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        let host = self.host.as_bytes();
        let len = host.len().min(HOST_MAX);
        out[..len].copy_from_slice(&host[..len]);
        out[HOST_MAX..HOST_MAX + 2].copy_from_slice(&self.num_modules.to_le_bytes());
        out[HOST_MAX + 2..HOST_MAX + 4].copy_from_slice(&self.num_numa.to_le_bytes());
        out[HOST_MAX + 4..HOST_MAX + 6].copy_from_slice(&self.num_cores.to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> UnitRecord {
        let host_end = bytes[..HOST_MAX]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HOST_MAX);
        UnitRecord {
            host: String::from_utf8_lossy(&bytes[..host_end]).into_owned(),
            num_modules: u16::from_le_bytes(bytes[HOST_MAX..HOST_MAX + 2].try_into().unwrap()),
            num_numa: u16::from_le_bytes(bytes[HOST_MAX + 2..HOST_MAX + 4].try_into().unwrap()),
            num_cores: u16::from_le_bytes(bytes[HOST_MAX + 4..HOST_MAX + 6].try_into().unwrap()),
        }
    }
}

// ceiling-sized contiguous bands, used to spread a host's units over
// its modules and a module's units over its NUMA nodes
fn banded(n_items: usize, n_groups: usize) -> Vec<std::ops::Range<usize>> {
    let n_groups = n_groups.max(1);
    let max = n_items.div_ceil(n_groups);
    let mut out = Vec::new();
    let mut first = 0;
    for _ in 0..n_groups {
        let n = max.min(n_items - first);
        out.push(first..first + n);
        first += n;
        if first == n_items {
            break;
        }
    }
    out
}

/// Build a team's locality tree from the exchanged unit records.
///
/// Units are grouped by host into node domains (ordered by first
/// appearance), spread across each host's modules and NUMA nodes, and
/// end in one core domain per unit.
pub(crate) fn build_tree(team_id: u16, members: &[u16], records: &[UnitRecord]) -> DomainTree {
    debug_assert_eq!(members.len(), records.len());

    let mut hosts: Vec<String> = Vec::new();
    let mut by_host: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, r) in records.iter().enumerate() {
        if !by_host.contains_key(&r.host) {
            hosts.push(r.host.clone());
        }
        by_host.entry(r.host.clone()).or_default().push(i);
    }

    let mut tree = DomainTree {
        team_id,
        nodes: Vec::new(),
        index: HashMap::new(),
    };
    tree.nodes.push(DomainNode {
        tag: ".".to_owned(),
        scope: Scope::Global,
        level: 0,
        relative_index: 0,
        parent: None,
        children: Vec::new(),
        unit_ids: members.to_vec(),
        num_nodes: hosts.len(),
        num_cores: records.iter().map(|r| r.num_cores).sum(),
        host: String::new(),
    });

    for (h, host) in hosts.iter().enumerate() {
        let host_units = &by_host[host];
        let hw = &records[host_units[0]];
        let node_idx = push_child(
            &mut tree,
            ROOT,
            h,
            Scope::Node,
            host_units.iter().map(|&i| members[i]).collect(),
            1,
            host_units.iter().map(|&i| records[i].num_cores).sum(),
            host.clone(),
        );

        let modules = banded(host_units.len(), hw.num_modules as usize);
        for (m, module_range) in modules.into_iter().enumerate() {
            let module_units = &host_units[module_range];
            let module_idx = push_child(
                &mut tree,
                node_idx,
                m,
                Scope::Module,
                module_units.iter().map(|&i| members[i]).collect(),
                1,
                module_units.iter().map(|&i| records[i].num_cores).sum(),
                host.clone(),
            );

            let numas = banded(module_units.len(), hw.num_numa as usize);
            for (n, numa_range) in numas.into_iter().enumerate() {
                let numa_units = &module_units[numa_range];
                let numa_idx = push_child(
                    &mut tree,
                    module_idx,
                    n,
                    Scope::Numa,
                    numa_units.iter().map(|&i| members[i]).collect(),
                    1,
                    numa_units.iter().map(|&i| records[i].num_cores).sum(),
                    host.clone(),
                );

                for (c, &i) in numa_units.iter().enumerate() {
                    push_child(
                        &mut tree,
                        numa_idx,
                        c,
                        Scope::Core,
                        vec![members[i]],
                        1,
                        records[i].num_cores,
                        host.clone(),
                    );
                }
            }
        }
    }

    tree.rebuild_index();
    tree
}

#[allow(clippy::too_many_arguments)]
fn push_child(
    tree: &mut DomainTree,
    parent: usize,
    relative_index: usize,
    scope: Scope,
    unit_ids: Vec<u16>,
    num_nodes: usize,
    num_cores: u16,
    host: String,
) -> usize {
    let idx = tree.nodes.len();
    let tag = child_tag(&tree.nodes[parent].tag, relative_index);
    let level = tree.nodes[parent].level + 1;
    tree.nodes.push(DomainNode {
        tag,
        scope,
        level,
        relative_index: relative_index as u16,
        parent: Some(parent),
        children: Vec::new(),
        unit_ids,
        num_nodes,
        num_cores,
        host,
    });
    tree.nodes[parent].children.push(idx);
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wire_round_trip() {
        let r = UnitRecord {
            host: "cn-042".to_owned(),
            num_modules: 2,
            num_numa: 4,
            num_cores: 64,
        };
        assert_eq!(r, UnitRecord::from_bytes(&r.to_bytes()));
    }

    #[test]
    fn oversized_host_is_truncated() {
        let r = UnitRecord {
            host: "h".repeat(100),
            num_modules: 1,
            num_numa: 1,
            num_cores: 1,
        };
        let back = UnitRecord::from_bytes(&r.to_bytes());
        assert_eq!(HOST_MAX, back.host.len());
    }

    #[test]
    fn banded_spreads_remainder() {
        assert_eq!(vec![0..4], banded(4, 1));
        assert_eq!(vec![0..2, 2..4], banded(4, 2));
        assert_eq!(vec![0..2, 2..4, 4..5], banded(5, 3));
        // empty trailing groups are dropped
        assert_eq!(vec![0..1, 1..2], banded(2, 3));
    }

    #[test]
    fn numa_fanout() {
        let members: Vec<u16> = (0..4).collect();
        let records: Vec<UnitRecord> = (0..4)
            .map(|_| UnitRecord {
                host: "h0".to_owned(),
                num_modules: 1,
                num_numa: 2,
                num_cores: 2,
            })
            .collect();
        let tree = build_tree(0, &members, &records);
        tree.check_invariants();

        let node = tree.domain_at(".0").unwrap();
        assert_eq!(4, node.num_units);
        let numa0 = tree.domain_at(".0.0.0").unwrap();
        let numa1 = tree.domain_at(".0.0.1").unwrap();
        assert_eq!(Scope::Numa, numa0.scope);
        assert_eq!(vec![0, 1], numa0.unit_ids);
        assert_eq!(vec![2, 3], numa1.unit_ids);
    }
}
