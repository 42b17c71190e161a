use serial_test::serial;
use std::sync::Arc;
use std::thread;

use stratum::{Runtime, Scope, ThreadedFabric, ThreadedFabricBuilder, TEAM_ALL};

fn run_units<F>(fabric: ThreadedFabric, f: F)
where
    F: Fn(Runtime) + Send + Sync + 'static,
{
    let fabric = Arc::new(fabric);
    let f = Arc::new(f);
    let workers: Vec<_> = (0..fabric.num_units())
        .map(|rank| {
            let fabric = fabric.clone();
            let f = f.clone();
            thread::spawn(move || {
                let runtime = Runtime::init(fabric.transport(rank)).unwrap();
                f(runtime);
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
}

fn two_by_four() -> ThreadedFabric {
    let hosts: Vec<String> = (0..8)
        .map(|u| if u < 4 { "n0".to_owned() } else { "n1".to_owned() })
        .collect();
    ThreadedFabricBuilder::new(8).with_hosts(hosts).build()
}

#[test]
#[serial]
fn node_domains_of_a_two_by_four_job() {
    run_units(two_by_four(), |rt| {
        let root = rt.team_domain(TEAM_ALL).unwrap();
        assert_eq!(Scope::Global, root.scope);
        assert_eq!(8, root.num_units);
        assert_eq!(2, root.num_nodes);

        let nodes = rt.scope_domains(TEAM_ALL, Scope::Node).unwrap();
        assert_eq!(vec![".0".to_owned(), ".1".to_owned()], nodes);

        let n0 = rt.domain_at(TEAM_ALL, ".0").unwrap();
        assert_eq!("n0", n0.host);
        assert_eq!(vec![0, 1, 2, 3], n0.unit_ids);

        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn split_then_group_forms_a_group_domain() {
    run_units(two_by_four(), |rt| {
        let parts = rt.domain_split(TEAM_ALL, Scope::Node, 2).unwrap();
        assert_eq!(2, parts.len());
        assert_eq!(1, parts[0].len());
        assert_eq!(1, parts[1].len());

        rt.domain_group(TEAM_ALL, &parts[..1]).unwrap();
        let root = rt.team_domain(TEAM_ALL).unwrap();
        assert_eq!(2, root.num_children);

        // the new group is the last child
        let group = rt.domain_at(TEAM_ALL, ".1").unwrap();
        assert_eq!(Scope::Group, group.scope);
        assert_eq!(4, group.num_units);
        assert_eq!(vec![0, 1, 2, 3], group.unit_ids);

        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn grouping_preserves_unit_population() {
    run_units(two_by_four(), |rt| {
        let before = rt.team_domain(TEAM_ALL).unwrap().unit_ids;
        rt.domain_group_subdomains(TEAM_ALL, ".", &[".1".to_owned()])
            .unwrap();
        let after = rt.team_domain(TEAM_ALL).unwrap().unit_ids;
        assert_eq!(before, after);

        // remaining node is renumbered to the front
        let first = rt.domain_at(TEAM_ALL, ".0").unwrap();
        assert_eq!(Scope::Node, first.scope);
        assert_eq!("n0", first.host);

        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn subteams_carry_their_own_tree() {
    run_units(two_by_four(), |rt| {
        let me = rt.my_unit();
        // one unit from each node
        let team = rt.team_create(TEAM_ALL, &[0, 4]).unwrap();
        if let Some(team_id) = team {
            assert!(me == 0 || me == 4);
            let root = rt.team_domain(team_id).unwrap();
            assert_eq!(2, root.num_units);
            assert_eq!(2, root.num_nodes);
            let nodes = rt.scope_domains(team_id, Scope::Node).unwrap();
            assert_eq!(2, nodes.len());
            rt.team_destroy(team_id).unwrap();
        }
        rt.barrier(TEAM_ALL).unwrap();
        rt.finalize().unwrap();
    });
}
