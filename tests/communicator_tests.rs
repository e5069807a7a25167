mod util;

use dist_assembly::algs::communicator::{CommTag, Communicator, NoComm, ThreadComm, Wait};
use dist_assembly::dist_error::DistError;
use util::run_ranks;

#[test]
fn thread_round_trip() {
    let tag = CommTag::new(0x1000);
    let world = ThreadComm::world(2);
    let _s = world[0].isend(1, tag.as_u16(), b"hello");
    let got = world[1].irecv(0, tag.as_u16(), 5).wait().unwrap();
    assert_eq!(&got, b"hello");
}

#[test]
fn thread_fifo_order() {
    let tag = CommTag::new(0x1001);
    let world = ThreadComm::world(2);
    for i in 0..10u8 {
        world[0].isend(1, tag.as_u16(), &[i]);
    }
    let out: Vec<u8> = (0..10)
        .map(|_| world[1].irecv(0, tag.as_u16(), 1).wait().unwrap()[0])
        .collect();
    assert_eq!(out, (0u8..10).collect::<Vec<_>>());
}

#[test]
fn tags_keep_messages_apart() {
    let world = ThreadComm::world(2);
    world[0].isend(1, 7, &[7]);
    world[0].isend(1, 8, &[8]);
    assert_eq!(world[1].irecv(0, 8, 1).wait().unwrap(), vec![8]);
    assert_eq!(world[1].irecv(0, 7, 1).wait().unwrap(), vec![7]);
}

#[test]
fn allgather_orders_by_rank() {
    let out = run_ranks(3, |comm| {
        let me = [comm.rank() as u8 * 10, 1];
        let mut all = vec![0u8; 6];
        comm.allgather(&me, &mut all).unwrap();
        all
    });
    for all in out {
        assert_eq!(all, vec![0, 1, 10, 1, 20, 1]);
    }
}

#[test]
fn allgather_rejects_short_buffer() {
    let mut all = vec![0u8; 3];
    assert!(matches!(
        NoComm.allgather(&[1, 2], &mut all),
        Err(DistError::SizeMismatch { expected: 2, got: 3, .. })
    ));
}

#[test]
fn broadcast_from_non_zero_root() {
    let out = run_ranks(3, |comm| {
        let data = if comm.rank() == 2 { b"root".to_vec() } else { Vec::new() };
        comm.broadcast(2, &data).unwrap()
    });
    assert!(out.iter().all(|d| d == b"root"));
}

#[test]
fn reserved_tags_agree_across_ranks() {
    let out = run_ranks(2, |comm| {
        let a = comm.reserve_tags(2).unwrap();
        let b = comm.reserve_tags(6).unwrap();
        let (a, b) = (a.base(), b.base());
        comm.barrier().unwrap();
        (a, b)
    });
    assert_eq!(out[0], out[1]);
    assert_eq!(out[0].1.as_u16(), out[0].0.as_u16() + 2);
}

#[test]
fn commtag_offset() {
    let tag = CommTag::new(0x200);
    assert_eq!(tag.offset(3).as_u16(), 0x203);
}
