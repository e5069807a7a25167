mod util;

use dist_assembly::io::{MAT_CLASSID, VEC_CLASSID, read_mat, read_vec, write_mat, write_vec};
use dist_assembly::prelude::*;
use util::{concat, run_ranks, split};

#[test]
fn vector_written_on_three_ranks_reads_on_two() {
    let files = run_ranks(3, |comm| {
        let me = comm.rank();
        let mut v = DistVec::<f64, _>::new(comm, split(7, 3)).unwrap();
        let layout = v.layout().clone();
        for (x, g) in v.owned_values_mut().iter_mut().zip(layout.owned_indices(me)) {
            *x = g as f64 * 1.5;
        }
        let mut out = Vec::new();
        write_vec(&v, &mut out).unwrap();
        out
    });
    assert!(files[1].is_empty() && files[2].is_empty());
    let file = files[0].clone();
    assert_eq!(&file[..4], &VEC_CLASSID.to_be_bytes());
    assert_eq!(file.len(), 8 + 7 * 8);

    let parts = run_ranks(2, |comm| {
        let v: DistVec<f64, _> = if comm.rank() == 0 {
            read_vec(comm, &mut file.as_slice()).unwrap()
        } else {
            read_vec(comm, &mut std::io::empty()).unwrap()
        };
        assert_eq!(v.local_size(), if v.rank() == 0 { 4 } else { 3 });
        v.owned_values().to_vec()
    });
    let expect: Vec<f64> = (0..7).map(|g| g as f64 * 1.5).collect();
    assert_eq!(concat(parts), expect);
}

#[test]
fn matrix_round_trip_across_rank_counts() {
    let files = run_ranks(2, |comm| {
        let mut a = DistMatrix::<f64, _>::new(comm.clone(), split(5, 2), split(3, 2)).unwrap();
        if comm.rank() == 1 {
            for r in 0..5 {
                a.set(r, r % 3, (r + 1) as f64, CombineMode::Insert).unwrap();
                a.set(r, 2, -1.0, CombineMode::Insert).unwrap();
            }
        }
        a.assemble().unwrap();
        let mut out = Vec::new();
        write_mat(&a, &mut out).unwrap();
        out
    });
    let file = files[0].clone();
    assert_eq!(&file[..4], &MAT_CLASSID.to_be_bytes());

    let rows = run_ranks(3, |comm| {
        let me = comm.rank();
        let a: DistMatrix<f64, _> = if me == 0 {
            read_mat(comm, &mut file.as_slice()).unwrap()
        } else {
            read_mat(comm, &mut std::io::empty()).unwrap()
        };
        let n_local = a.row_layout().local_size(me);
        (0..n_local)
            .map(|lr| a.owned_row(lr).unwrap())
            .collect::<Vec<_>>()
    });
    let all: Vec<Vec<(usize, f64)>> = rows.into_iter().flatten().collect();
    assert_eq!(all.len(), 5);
    assert_eq!(all[0], vec![(0, 1.0), (2, -1.0)]);
    assert_eq!(all[1], vec![(1, 2.0), (2, -1.0)]);
    assert_eq!(all[2], vec![(2, -1.0)]);
    assert_eq!(all[3], vec![(0, 4.0), (2, -1.0)]);
    assert_eq!(all[4], vec![(1, 5.0), (2, -1.0)]);
}

#[test]
fn format_errors_reach_every_rank() {
    let mut bad = Vec::new();
    bad.extend_from_slice(&VEC_CLASSID.to_be_bytes());
    bad.extend_from_slice(&(-3i32).to_be_bytes());
    let out = run_ranks(2, |comm| {
        let res: Result<DistVec<f64, _>, _> = if comm.rank() == 0 {
            read_vec(comm, &mut bad.as_slice())
        } else {
            read_vec(comm, &mut std::io::empty())
        };
        res.map(|_| ()).unwrap_err()
    });
    for err in out {
        assert!(matches!(&err, DistError::Format(m) if m.contains("negative")), "{err}");
    }
}

#[test]
fn unassembled_matrix_is_not_written() {
    let mut a = DistMatrix::<f64, _>::new(NoComm, split(2, 1), split(2, 1)).unwrap();
    a.set(0, 0, 1.0, CombineMode::Add).unwrap();
    let mut out = Vec::new();
    assert!(matches!(
        write_mat(&a, &mut out),
        Err(DistError::StateError { .. })
    ));
    assert!(out.is_empty());
}
