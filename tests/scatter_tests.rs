mod util;

use dist_assembly::prelude::*;
use dist_assembly::scatter::PlanStats;
use util::{concat, run_ranks, split};

#[test]
fn index_sets_of_different_length_fail_before_communicating() {
    let err = ScatterPlan::create(
        &NoComm,
        &IndexSpace::Local(3),
        &IndexSet::identity(3),
        &IndexSpace::Local(3),
        &IndexSet::identity(2),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        DistError::SizeMismatch { expected: 3, got: 2, .. }
    ));
}

#[test]
fn out_of_range_slot_is_rejected() {
    let err = ScatterPlan::create(
        &NoComm,
        &IndexSpace::Local(2),
        &IndexSet::general(vec![0, 2]),
        &IndexSpace::Local(2),
        &IndexSet::identity(2),
    )
    .unwrap_err();
    assert!(matches!(err, DistError::IndexOutOfRange { index: 2, .. }));
}

#[test]
fn gather_plan_is_reusable_and_reversible() {
    let out = run_ranks(2, |comm| {
        let me = comm.rank();
        let layout = split(6, 2);
        let wanted = if me == 0 { vec![5, 4, 3] } else { vec![0, 1, 2] };
        let plan = ScatterPlan::create(
            &comm,
            &IndexSpace::Distributed(layout.clone()),
            &IndexSet::general(wanted),
            &IndexSpace::Local(3),
            &IndexSet::identity(3),
        )
        .unwrap();
        let stats = plan.stats();

        let owned = layout.owned_indices(me);
        let mut ys = Vec::new();
        for scale in [1.0, 10.0] {
            let x: Vec<f64> = owned.iter().map(|&g| scale * (g + 1) as f64).collect();
            let mut y = vec![0.0; 3];
            let h = plan
                .begin(&comm, &x, &mut y, CombineMode::Insert, Direction::Forward)
                .unwrap();
            plan.end(h, &mut y).unwrap();
            ys.push(y);
        }

        let mut back = vec![0.0; 3];
        let h = plan
            .begin(&comm, &ys[1], &mut back, CombineMode::Add, Direction::Reverse)
            .unwrap();
        plan.end(h, &mut back).unwrap();
        (stats, ys, back)
    });

    let (stats0, ys0, back0) = &out[0];
    let (_, ys1, back1) = &out[1];
    assert_eq!(
        *stats0,
        PlanStats {
            send_peers: 1,
            recv_peers: 1,
            send_len: 3,
            recv_len: 3,
            local_len: 0,
        }
    );
    assert_eq!(ys0[0], vec![6.0, 5.0, 4.0]);
    assert_eq!(ys1[0], vec![1.0, 2.0, 3.0]);
    assert_eq!(ys0[1], vec![60.0, 50.0, 40.0]);
    assert_eq!(ys1[1], vec![10.0, 20.0, 30.0]);
    assert_eq!(concat(vec![back0.clone(), back1.clone()]), vec![
        10.0, 20.0, 30.0, 40.0, 50.0, 60.0
    ]);
}

#[test]
fn distributed_permutation_mixes_local_and_remote_legs() {
    const N: usize = 9;
    let out = run_ranks(3, |comm| {
        let me = comm.rank();
        let layout = split(N, 3);
        let owned = layout.owned_indices(me);
        let mirrored: Vec<usize> = owned.iter().map(|&g| N - 1 - g).collect();
        let plan = ScatterPlan::create(
            &comm,
            &IndexSpace::Distributed(layout.clone()),
            &IndexSet::general(owned.clone()),
            &IndexSpace::Distributed(layout.clone()),
            &IndexSet::general(mirrored),
        )
        .unwrap();
        let x: Vec<f64> = owned.iter().map(|&g| g as f64).collect();
        let mut y = vec![-1.0; 3];
        let h = plan
            .begin(&comm, &x, &mut y, CombineMode::Insert, Direction::Forward)
            .unwrap();
        plan.end(h, &mut y).unwrap();
        (plan.stats().local_len, y)
    });
    // the middle rank owns both ends of its own mirror
    assert_eq!(out[0].0, 0);
    assert_eq!(out[1].0, 3);
    let y = concat(out.into_iter().map(|(_, y)| y).collect());
    let expect: Vec<f64> = (0..N).rev().map(|g| g as f64).collect();
    assert_eq!(y, expect);
}

#[test]
fn two_plans_may_be_in_flight_at_once() {
    let out = run_ranks(2, |comm| {
        let me = comm.rank();
        let layout = split(4, 2);
        let other = if me == 0 { vec![2, 3] } else { vec![0, 1] };
        let make = || {
            ScatterPlan::create(
                &comm,
                &IndexSpace::Distributed(layout.clone()),
                &IndexSet::general(other.clone()),
                &IndexSpace::Local(2),
                &IndexSet::identity(2),
            )
            .unwrap()
        };
        let a = make();
        let b = make();
        let x: Vec<f64> = layout.owned_indices(me).iter().map(|&g| g as f64).collect();
        let x2: Vec<f64> = x.iter().map(|v| v * 100.0).collect();
        let (mut ya, mut yb) = (vec![0.0; 2], vec![0.0; 2]);
        let ha = a
            .begin(&comm, &x, &mut ya, CombineMode::Insert, Direction::Forward)
            .unwrap();
        let hb = b
            .begin(&comm, &x2, &mut yb, CombineMode::Insert, Direction::Forward)
            .unwrap();
        b.end(hb, &mut yb).unwrap();
        a.end(ha, &mut ya).unwrap();
        (ya, yb)
    });
    assert_eq!(out[0], (vec![2.0, 3.0], vec![200.0, 300.0]));
    assert_eq!(out[1], (vec![0.0, 1.0], vec![0.0, 100.0]));
}

#[test]
fn ghost_round_trip_scales_by_one_plus_sharers() {
    // global 0 is owned by rank 0 and ghosted on the two other ranks
    let out = run_ranks(3, |comm| {
        let me = comm.rank();
        let ghosts = if me == 0 { Vec::new() } else { vec![0] };
        let mut v = DistVec::<f64, _>::with_ghosts(comm, split(6, 3), ghosts).unwrap();
        if me == 0 {
            v.set(0, 2.0, CombineMode::Insert).unwrap();
        }
        v.assemble().unwrap();
        v.global_to_local().unwrap();
        let ghost_seen = v.get_local(0);
        v.local_to_global().unwrap();
        (ghost_seen, v.owned_values().to_vec())
    });
    assert_eq!(out[1].0, Some(2.0));
    assert_eq!(out[2].0, Some(2.0));
    assert_eq!(out[0].1, vec![6.0, 0.0]);
}

#[test]
fn ghost_updates_follow_owner_changes() {
    let out = run_ranks(2, |comm| {
        let me = comm.rank();
        let ghosts = if me == 0 { vec![3] } else { vec![0, 1] };
        let mut v = DistVec::<f64, _>::with_ghosts(comm, split(4, 2), ghosts).unwrap();
        let mut seen = Vec::new();
        for round in 1..=2 {
            for x in v.owned_values_mut() {
                *x = round as f64 * 10.0 + me as f64;
            }
            v.global_to_local().unwrap();
            seen.push(v.local_form().to_vec());
        }
        seen
    });
    assert_eq!(out[0][0], vec![10.0, 10.0, 11.0]);
    assert_eq!(out[0][1], vec![20.0, 20.0, 21.0]);
    assert_eq!(out[1][1], vec![21.0, 21.0, 20.0, 20.0]);
}

fn gather_plan(comm: &ThreadComm) -> Result<ScatterPlan, DistError> {
    ScatterPlan::create(
        comm,
        &IndexSpace::Distributed(split(4, 2)),
        &IndexSet::identity(4),
        &IndexSpace::Local(4),
        &IndexSet::identity(4),
    )
}

#[test]
fn plans_built_during_a_flush_never_reuse_its_tags() {
    let out = run_ranks(2, |comm| {
        let mut v = DistVec::<f64, _>::new(comm.clone(), split(4, 2)).unwrap();
        if comm.rank() == 1 {
            v.set(0, 1.0, CombineMode::Add).unwrap();
        }
        v.assembly_begin().unwrap();
        // far more plans than the tag space holds at once
        for _ in 0..6000 {
            gather_plan(&comm).unwrap();
        }
        v.assembly_end().unwrap();
        v.owned_values().to_vec()
    });
    assert_eq!(concat(out), vec![1.0, 0.0, 0.0, 0.0]);
}

#[test]
fn running_out_of_tags_is_an_error_not_a_collision() {
    let out = run_ranks(2, |comm| {
        let mut v = DistVec::<f64, _>::new(comm.clone(), split(4, 2)).unwrap();
        let mut held = Vec::new();
        let exhausted = loop {
            match comm.reserve_tags(6) {
                Ok(lease) => held.push(lease),
                Err(e) => break e,
            }
        };
        assert!(matches!(exhausted, DistError::TagsExhausted { requested: 6, .. }));
        assert!(matches!(
            gather_plan(&comm),
            Err(DistError::TagsExhausted { .. })
        ));

        if comm.rank() == 1 {
            v.set(0, 1.0, CombineMode::Add).unwrap();
        }
        v.assembly_begin().unwrap();
        held.clear();
        let plan = gather_plan(&comm).unwrap();
        v.assembly_end().unwrap();
        drop(plan);
        v.owned_values().to_vec()
    });
    assert_eq!(concat(out), vec![1.0, 0.0, 0.0, 0.0]);
}

#[test]
fn vectors_move_between_partitions_and_back() {
    let from = split(7, 3);
    let to = std::sync::Arc::new(Layout::from_owners(vec![2, 0, 1, 2, 0, 1, 0], 3).unwrap());
    let out = run_ranks(3, |comm| {
        let me = comm.rank();
        let moves = VecRedistribution::new(&comm, from.clone(), to.clone()).unwrap();
        let mut x = DistVec::<f64, _>::new(comm.clone(), from.clone()).unwrap();
        for (v, g) in x.owned_values_mut().iter_mut().zip(from.owned_indices(me)) {
            *v = 10.0 * g as f64;
        }
        let mut y = DistVec::new(comm.clone(), to.clone()).unwrap();
        moves.forward(&x, &mut y).unwrap();
        let moved = y.owned_values().to_vec();

        let mut back = DistVec::new(comm.clone(), from.clone()).unwrap();
        moves.reverse(&y, &mut back).unwrap();
        // the plan is reusable after a round trip
        y.zero().unwrap();
        moves.forward(&back, &mut y).unwrap();
        let wrong_way = moves.forward(&y, &mut back);
        (
            moved,
            back.owned_values() == x.owned_values(),
            y.owned_values().to_vec(),
            matches!(wrong_way, Err(DistError::InvalidLayout(_))),
        )
    });
    assert_eq!(out[0].0, vec![10.0, 40.0, 60.0]);
    assert_eq!(out[1].0, vec![20.0, 50.0]);
    assert_eq!(out[2].0, vec![0.0, 30.0]);
    for (moved, round_trip, again, wrong_way) in out {
        assert!(round_trip);
        assert_eq!(again, moved);
        assert!(wrong_way);
    }
}

#[test]
fn redistribution_needs_equal_global_sizes() {
    let err = VecRedistribution::new(&NoComm, split(3, 1), split(4, 1)).unwrap_err();
    assert!(matches!(err, DistError::SizeMismatch { expected: 3, got: 4, .. }));
}
