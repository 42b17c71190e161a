use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use stratum::{
    DataType, ReduceOp, Runtime, RuntimeError, ThreadedFabric, ThreadedFabricBuilder, TEAM_ALL,
};

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

#[test]
#[serial]
fn seeded_segment_reads() {
    run_units(ThreadedFabricBuilder::new(4).build(), |rt| {
        let me = rt.my_unit();
        let base = rt.team_memalloc(TEAM_ALL, 1000, DataType::U32).unwrap();

        // every unit seeds its own part of the segment
        let seed: Vec<u32> = (0..1000).map(|i| me as u32 * 1000 + i).collect();
        let mut own = base;
        own.set_unit(me);
        rt.put_blocking(own, &seed).unwrap();
        rt.barrier(TEAM_ALL).unwrap();

        if me != 0 {
            // 100 elements starting at element 500 of unit 0
            let mut gptr = base;
            gptr.incr_addr(500 * 4);
            let mut buf = vec![0u32; 100];
            rt.get(&mut buf, gptr).unwrap();
            let expected: Vec<u32> = (0..100).map(|i| 500 + i).collect();
            assert_eq!(expected, buf);

            // and from a non-root target
            let mut gptr = base;
            gptr.set_unit(2);
            gptr.incr_addr(500 * 4);
            rt.get(&mut buf, gptr).unwrap();
            let expected: Vec<u32> = (0..100).map(|i| 2500 + i).collect();
            assert_eq!(expected, buf);
        }

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn two_chunk_transfers() {
    // a small per-call limit forces the chunks-plus-remainder path
    let fabric = ThreadedFabricBuilder::new(2)
        .with_max_contig_elements(1000)
        .without_colocation()
        .build();
    run_units(fabric, |rt| {
        let me = rt.my_unit();
        let nelem = 2500usize;
        let base = rt.team_memalloc(TEAM_ALL, nelem, DataType::U8).unwrap();
        let pattern: Vec<u8> = (0..nelem).map(|i| (i % 251) as u8).collect();

        // remote chunked get
        let mut own = base;
        own.set_unit(me);
        rt.put_blocking(own, &pattern).unwrap();
        rt.barrier(TEAM_ALL).unwrap();
        if me == 1 {
            let mut buf = vec![0u8; nelem];
            rt.get(&mut buf, base).unwrap();
            assert_eq!(pattern, buf);
        }
        rt.barrier(TEAM_ALL).unwrap();

        // remote chunked put, visible after a flush
        if me == 0 {
            let shifted: Vec<u8> = pattern.iter().map(|b| b.wrapping_add(1)).collect();
            let mut remote = base;
            remote.set_unit(1);
            rt.put(remote, &shifted).unwrap();
            rt.flush(remote).unwrap();
        }
        rt.barrier(TEAM_ALL).unwrap();
        if me == 1 {
            let mut buf = vec![0u8; nelem];
            let mut own = base;
            own.set_unit(1);
            rt.get(&mut buf, own).unwrap();
            let expected: Vec<u8> = pattern.iter().map(|b| b.wrapping_add(1)).collect();
            assert_eq!(expected, buf);
        }

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

fn exercise_roundtrip(fabric: ThreadedFabric) {
    run_units(fabric, |rt| {
        let me = rt.my_unit();
        let base = rt.team_memalloc(TEAM_ALL, 64, DataType::U64).unwrap();

        if me == 0 {
            let values: Vec<u64> = (0..64).map(|i| i * 3 + 7).collect();
            let mut remote = base;
            remote.set_unit(1);
            rt.put(remote, &values).unwrap();
            rt.flush(remote).unwrap();
        }
        rt.barrier(TEAM_ALL).unwrap();

        let mut readback = vec![0u64; 64];
        let mut target = base;
        target.set_unit(1);
        rt.get(&mut readback, target).unwrap();
        let expected: Vec<u64> = (0..64).map(|i| i * 3 + 7).collect();
        assert_eq!(expected, readback);

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn roundtrip_observes_the_same_bytes_with_and_without_colocation() {
    exercise_roundtrip(ThreadedFabricBuilder::new(2).build());
    exercise_roundtrip(ThreadedFabricBuilder::new(2).without_colocation().build());
}

#[test]
#[serial]
fn handles_complete_and_clear() {
    let fabric = ThreadedFabricBuilder::new(2).without_colocation().build();
    run_units(fabric, |rt| {
        let me = rt.my_unit();
        let base = rt.team_memalloc(TEAM_ALL, 32, DataType::U32).unwrap();

        if me == 0 {
            let values: Vec<u32> = (0..32).collect();
            let mut remote = base;
            remote.set_unit(1);
            let mut handle = unsafe { rt.put_handle(remote, &values).unwrap() };
            assert!(handle.is_some());
            rt.wait(&mut handle).unwrap();
            assert!(handle.is_none());
            assert!(rt.test_local(&mut handle).unwrap());
        }
        rt.barrier(TEAM_ALL).unwrap();

        let mut bufs = vec![vec![0u32; 32], vec![0u32; 32]];
        let (first, second) = bufs.split_at_mut(1);
        let mut target = base;
        target.set_unit(1);
        let mut handles = vec![
            unsafe { rt.get_handle(&mut first[0], target).unwrap() },
            unsafe { rt.get_handle(&mut second[0], target).unwrap() },
        ];
        rt.waitall(&mut handles).unwrap();
        assert!(handles.iter().all(|h| h.is_none()));
        assert!(rt.testall_local(&mut handles).unwrap());
        let expected: Vec<u32> = (0..32).collect();
        assert_eq!(expected, bufs[0]);
        assert_eq!(expected, bufs[1]);

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn colocated_handles_complete_eagerly() {
    run_units(ThreadedFabricBuilder::new(2).build(), |rt| {
        let base = rt.team_memalloc(TEAM_ALL, 8, DataType::U32).unwrap();
        let values: Vec<u32> = (10..18).collect();
        let mut remote = base;
        remote.set_unit(1 - rt.my_unit());
        let handle = unsafe { rt.put_handle(remote, &values).unwrap() };
        assert!(handle.is_none());
        rt.barrier(TEAM_ALL).unwrap();

        let mut buf = vec![0u32; 8];
        let mut own = base;
        own.set_unit(rt.my_unit());
        let handle = unsafe { rt.get_handle(&mut buf, own).unwrap() };
        assert!(handle.is_none());
        assert_eq!(values, buf);

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn compare_and_swap_sequence() {
    run_units(ThreadedFabricBuilder::new(2).build(), |rt| {
        let me = rt.my_unit();
        let base = rt.team_memalloc(TEAM_ALL, 1, DataType::U64).unwrap();

        if me == 0 {
            rt.put_blocking(base, &[7u64]).unwrap();
        }
        rt.barrier(TEAM_ALL).unwrap();

        if me == 0 {
            let old = rt.compare_and_swap(base, &9u64, &7u64).unwrap();
            assert_eq!(7, old);
        }
        rt.barrier(TEAM_ALL).unwrap();
        if me == 1 {
            let old = rt.compare_and_swap(base, &11u64, &7u64).unwrap();
            assert_eq!(9, old);
            let mut value = [0u64];
            rt.get(&mut value, base).unwrap();
            assert_eq!(9, value[0]);
        }

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn compare_and_swap_race_has_one_winner() {
    run_units(ThreadedFabricBuilder::new(4).build(), |rt| {
        let base = rt.team_memalloc(TEAM_ALL, 1, DataType::U64).unwrap();
        rt.barrier(TEAM_ALL).unwrap();

        let old = rt.compare_and_swap(base, &1u64, &0u64).unwrap();
        let won = (old == 0) as u32;
        let mut winners = [0u32];
        rt.allreduce(&[won], &mut winners, ReduceOp::Sum, TEAM_ALL)
            .unwrap();
        assert_eq!(1, winners[0]);

        let mut value = [0u64];
        rt.get(&mut value, base).unwrap();
        assert_eq!(1, value[0]);

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn compare_and_swap_rejects_floats() {
    run_units(ThreadedFabricBuilder::new(2).build(), |rt| {
        let base = rt.team_memalloc(TEAM_ALL, 1, DataType::F64).unwrap();
        assert_eq!(
            Err(RuntimeError::InvalidArgument),
            rt.compare_and_swap(base, &1.0f64, &0.0f64)
        );
        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn accumulate_and_fetch_ops() {
    run_units(ThreadedFabricBuilder::new(4).build(), |rt| {
        let base = rt.team_memalloc(TEAM_ALL, 2, DataType::U32).unwrap();
        rt.barrier(TEAM_ALL).unwrap();

        rt.accumulate(base, &[1u32, 2u32], ReduceOp::Sum).unwrap();
        rt.flush(base).unwrap();
        rt.barrier(TEAM_ALL).unwrap();
        if rt.my_unit() == 0 {
            let mut sums = [0u32; 2];
            rt.get(&mut sums, base).unwrap();
            assert_eq!([4, 8], sums);
        }
        rt.barrier(TEAM_ALL).unwrap();

        // second element is a shared counter
        let mut counter = base;
        counter.incr_addr(4);
        let old = rt.fetch_and_op(counter, &1u32, ReduceOp::Sum).unwrap();
        assert!((8..12).contains(&old));
        rt.flush(counter).unwrap();
        rt.barrier(TEAM_ALL).unwrap();
        if rt.my_unit() == 0 {
            let mut value = [0u32];
            rt.get(&mut value, counter).unwrap();
            assert_eq!(12, value[0]);
        }

        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn subset_barrier_rendezvous() {
    let entered = Arc::new(AtomicUsize::new(0));
    let entered_in_closure = entered.clone();
    run_units(ThreadedFabricBuilder::new(4).build(), move |rt| {
        let me = rt.my_unit();
        // units outside the subset return immediately
        rt.sync_units(&[1, 3]).unwrap();
        if me == 1 || me == 3 {
            entered_in_closure.fetch_add(1, Ordering::SeqCst);
        }
        rt.barrier(TEAM_ALL).unwrap();

        // the whole team as a subset behaves like a barrier
        rt.sync_units(&[0, 1, 2, 3]).unwrap();
        rt.finalize().unwrap();
    });
    assert_eq!(2, entered.load(Ordering::SeqCst));
}

#[test]
#[serial]
fn allgatherv_variable_counts() {
    run_units(ThreadedFabricBuilder::new(4).build(), |rt| {
        let me = rt.my_unit() as u32;
        let send: Vec<u32> = (0..=me).map(|j| me * 10 + j).collect();
        let counts = [1usize, 2, 3, 4];
        let displs = [0usize, 1, 3, 6];
        let mut recv = vec![0u32; 10];
        rt.allgatherv(&send, &mut recv, &counts, &displs, TEAM_ALL)
            .unwrap();
        assert_eq!(vec![0, 10, 11, 20, 21, 22, 30, 31, 32, 33], recv);
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn collectives_move_the_right_elements() {
    run_units(ThreadedFabricBuilder::new(4).build(), |rt| {
        let me = rt.my_unit();

        let mut buf = if me == 1 { [7u32, 8, 9] } else { [0u32; 3] };
        rt.broadcast(&mut buf, 1, TEAM_ALL).unwrap();
        assert_eq!([7, 8, 9], buf);

        let send: Vec<u32> = (0..8).collect();
        let mut part = [0u32; 2];
        let root_send = if me == 0 { Some(&send[..]) } else { None };
        rt.scatter(root_send, &mut part, 0, TEAM_ALL).unwrap();
        assert_eq!([me as u32 * 2, me as u32 * 2 + 1], part);

        let mine = [me as u32 * 10, me as u32 * 10 + 1];
        let mut gathered = vec![0u32; 8];
        let root_recv = if me == 2 { Some(&mut gathered[..]) } else { None };
        rt.gather(&mine, root_recv, 2, TEAM_ALL).unwrap();
        if me == 2 {
            assert_eq!(vec![0, 1, 10, 11, 20, 21, 30, 31], gathered);
        }

        let mut all = vec![0u32; 4];
        rt.allgather(&[me as u32], &mut all, TEAM_ALL).unwrap();
        assert_eq!(vec![0, 1, 2, 3], all);

        let mut sum = [0u32];
        rt.allreduce(&[me as u32 + 1], &mut sum, ReduceOp::Sum, TEAM_ALL)
            .unwrap();
        assert_eq!(10, sum[0]);

        let mut max = [0u32];
        let root_recv = if me == 0 { Some(&mut max[..]) } else { None };
        rt.reduce(&[me as u32], root_recv, ReduceOp::Max, 0, TEAM_ALL)
            .unwrap();
        if me == 0 {
            assert_eq!(3, max[0]);
        }

        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn reductions_refuse_chunked_lengths() {
    let fabric = ThreadedFabricBuilder::new(2)
        .with_max_contig_elements(1000)
        .build();
    run_units(fabric, |rt| {
        let send = vec![1u32; 1500];
        let mut recv = vec![0u32; 1500];
        assert_eq!(
            Err(RuntimeError::InvalidArgument),
            rt.allreduce(&send, &mut recv, ReduceOp::Sum, TEAM_ALL)
        );
        assert_eq!(
            Err(RuntimeError::InvalidArgument),
            rt.reduce(&send, None, ReduceOp::Sum, 1, TEAM_ALL)
        );

        // undersized receive buffers are rejected, not indexed
        let send = vec![1u32; 8];
        let mut short = vec![0u32; 4];
        assert_eq!(
            Err(RuntimeError::InvalidArgument),
            rt.allreduce(&send, &mut short, ReduceOp::Sum, TEAM_ALL)
        );
        if rt.my_unit() == 0 {
            assert_eq!(
                Err(RuntimeError::InvalidArgument),
                rt.reduce(&send, Some(&mut short), ReduceOp::Sum, 0, TEAM_ALL)
            );
        }
        rt.barrier(TEAM_ALL).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn send_recv_and_sendrecv() {
    run_units(ThreadedFabricBuilder::new(2).build(), |rt| {
        let me = rt.my_unit();
        if me == 0 {
            rt.send(&[41u32, 42], 99, 1).unwrap();
            let mut back = [0u32; 2];
            rt.recv(&mut back, 100, 1).unwrap();
            assert_eq!([43, 44], back);
        } else {
            let mut incoming = [0u32; 2];
            rt.recv(&mut incoming, 99, 0).unwrap();
            assert_eq!([41, 42], incoming);
            rt.send(&[43u32, 44], 100, 0).unwrap();
        }

        let mut swapped = [0u32; 1];
        rt.sendrecv(&[me as u32], 7, 1 - me, &mut swapped, 7, 1 - me)
            .unwrap();
        assert_eq!(1 - me as u32, swapped[0]);

        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn subteam_allocation_and_transfer() {
    run_units(ThreadedFabricBuilder::new(4).build(), |rt| {
        let me = rt.my_unit();
        let team = rt.team_create(TEAM_ALL, &[0, 2]).unwrap();
        match team {
            Some(team_id) => {
                assert_eq!(2, rt.team_size(team_id).unwrap());
                let my_rank = rt.team_my_rank(team_id).unwrap();
                assert_eq!(if me == 0 { 0 } else { 1 }, my_rank);

                let base = rt.team_memalloc(team_id, 16, DataType::U64).unwrap();
                if my_rank == 0 {
                    let values: Vec<u64> = (100..116).collect();
                    let mut remote = base;
                    remote.set_unit(1);
                    rt.put_blocking(remote, &values).unwrap();
                }
                rt.barrier(team_id).unwrap();
                if my_rank == 1 {
                    let mut buf = vec![0u64; 16];
                    let mut own = base;
                    own.set_unit(1);
                    rt.get(&mut buf, own).unwrap();
                    let expected: Vec<u64> = (100..116).collect();
                    assert_eq!(expected, buf);
                }
                rt.barrier(team_id).unwrap();
                rt.team_memfree(base).unwrap();
                rt.team_destroy(team_id).unwrap();
            }
            None => {
                assert!(me == 1 || me == 3);
            }
        }
        rt.barrier(TEAM_ALL).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn invalid_targets_are_rejected() {
    run_units(ThreadedFabricBuilder::new(2).build(), |rt| {
        let mut base = rt.team_memalloc(TEAM_ALL, 4, DataType::U32).unwrap();
        let mut buf = [0u32; 4];

        let mut unknown_team = base;
        unknown_team.team_id = 55;
        assert_eq!(
            Err(RuntimeError::InvalidArgument),
            rt.get(&mut buf, unknown_team)
        );

        base.set_unit(9);
        assert_eq!(Err(RuntimeError::InvalidArgument), rt.get(&mut buf, base));
        assert_eq!(Err(RuntimeError::InvalidArgument), rt.flush(base));

        let mut unbound = base;
        unbound.set_unit(0);
        unbound.segment_id = 17;
        assert_eq!(Err(RuntimeError::InvalidArgument), rt.get(&mut buf, unbound));

        base.set_unit(0);
        rt.barrier(TEAM_ALL).unwrap();
        rt.team_memfree(base).unwrap();
        rt.finalize().unwrap();
    });
}

#[test]
#[serial]
fn local_pool_transfers() {
    run_units(ThreadedFabricBuilder::new(2).build(), |rt| {
        let me = rt.my_unit();
        let g = rt.memalloc_local(8, DataType::U32).unwrap();
        assert_eq!(0, g.segment_id);

        let values: Vec<u32> = (0..8).map(|i| me as u32 * 100 + i).collect();
        rt.put_blocking(g, &values).unwrap();

        // publish the pointer and read the peer's allocation
        let mut ptrs = vec![0u8; 32];
        rt.allgather(&g.to_le_bytes(), &mut ptrs, TEAM_ALL).unwrap();
        let peer = 1 - me;
        let peer_ptr =
            stratum::GlobalPtr::from_le_bytes(ptrs[peer as usize * 16..][..16].try_into().unwrap());
        let mut buf = vec![0u32; 8];
        rt.get(&mut buf, peer_ptr).unwrap();
        let expected: Vec<u32> = (0..8).map(|i| peer as u32 * 100 + i).collect();
        assert_eq!(expected, buf);

        rt.barrier(TEAM_ALL).unwrap();
        rt.memfree_local(g).unwrap();
        rt.finalize().unwrap();
    });
}
