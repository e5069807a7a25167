//! Scatter plans: who sends which local slots to whom.
//!
//! A plan pairs the i-th index of a source set with the i-th index of a
//! destination set on every rank. Construction is collective and runs two
//! rounds:
//!
//! 1. each caller routes `(source offset, destination rank, destination
//!    offset)` requests to the owner of the source index;
//! 2. each source owner orders what it serves by destination rank (then by
//!    requesting rank) and forwards the destination offsets in that order, so
//!    sender and receiver agree on the layout of every message.
//!
//! Plans depend only on index sets, never on values, and are reused across
//! any number of begin/end cycles in either direction.

use crate::algs::communicator::{CommTag, Communicator, TagLease};
use crate::algs::size_exchange::exchange_all;
use crate::algs::wire::{WireIndex, WireRoute, cast_slice, read_records};
use crate::data::index_set::IndexSet;
use crate::data::layout::Layout;
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;
use std::mem::size_of;
use std::sync::Arc;

/// Address space an index set refers to.
#[derive(Clone, Debug)]
pub enum IndexSpace {
    /// Global indices of a distributed container; routed to their owner.
    Distributed(Arc<Layout>),
    /// Slots of a process-local array of the given length.
    Local(usize),
}

impl IndexSpace {
    /// Length of this rank's piece.
    pub fn local_len(&self, rank: usize) -> usize {
        match self {
            IndexSpace::Distributed(layout) => layout.local_size(rank),
            IndexSpace::Local(len) => *len,
        }
    }

    fn locate(&self, rank: usize, idx: usize) -> Result<(usize, usize), DistError> {
        match self {
            IndexSpace::Distributed(layout) => layout.locate(idx),
            IndexSpace::Local(len) if idx < *len => Ok((rank, idx)),
            IndexSpace::Local(len) => Err(DistError::IndexOutOfRange {
                index: idx,
                size: *len,
            }),
        }
    }

    fn check_ranks(&self, num_ranks: usize) -> Result<(), DistError> {
        match self {
            IndexSpace::Distributed(layout) if layout.num_ranks() != num_ranks => {
                Err(DistError::InvalidLayout(format!(
                    "layout spans {} ranks, communicator has {num_ranks}",
                    layout.num_ranks()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Slots exchanged with one peer, in message order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerLeg {
    pub peer: usize,
    pub slots: Vec<usize>,
}

/// Message counts of a plan as seen from one rank (forward direction).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub send_peers: usize,
    pub recv_peers: usize,
    pub send_len: usize,
    pub recv_len: usize,
    pub local_len: usize,
}

/// Immutable, reusable transfer plan.
#[derive(Clone, Debug)]
pub struct ScatterPlan {
    pub(crate) sends: Vec<PeerLeg>,
    pub(crate) recvs: Vec<PeerLeg>,
    pub(crate) local: Vec<(usize, usize)>,
    pub(crate) src_len: usize,
    pub(crate) dst_len: usize,
    pub(crate) forward_tag: CommTag,
    pub(crate) reverse_tag: CommTag,
    // shared by clones; the tags return to the pool with the last one
    _tags: Arc<TagLease>,
}

// round 1 (2 tags) + round 2 (2 tags), released once the plan is built
const SETUP_TAGS: u16 = 4;
// forward + reverse, held for the life of the plan
const EXEC_TAGS: u16 = 2;

impl ScatterPlan {
    /// Collective plan construction.
    ///
    /// Fails with `SizeMismatch` (before any communication) when the two
    /// index sets differ in length.
    pub fn create<C: Communicator>(
        comm: &C,
        src: &IndexSpace,
        src_is: &IndexSet,
        dst: &IndexSpace,
        dst_is: &IndexSet,
    ) -> Result<Self, DistError> {
        if src_is.len() != dst_is.len() {
            return Err(DistError::SizeMismatch {
                context: "scatter index sets",
                expected: src_is.len(),
                got: dst_is.len(),
            });
        }
        let me = comm.rank();
        let nranks = comm.size();
        src.check_ranks(nranks)?;
        dst.check_ranks(nranks)?;

        // Resolve every pair locally before talking to anyone.
        let mut requests: Vec<Vec<WireRoute>> = vec![Vec::new(); nranks];
        for (s, d) in src_is.iter().zip(dst_is.iter()) {
            let (src_rank, src_off) = src.locate(me, s)?;
            let (dst_rank, dst_off) = dst.locate(me, d)?;
            requests[src_rank].push(WireRoute::new(src_off, dst_rank, dst_off));
        }

        let exec_tags = comm.reserve_tags(EXEC_TAGS)?;
        let setup_tags = comm.reserve_tags(SETUP_TAGS)?;
        let base = setup_tags.base();
        let own_requests = std::mem::take(&mut requests[me]);

        // Round 1: requests travel to the source owners.
        let outgoing: Vec<(usize, usize, Vec<u8>)> = requests
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(peer, r)| (peer, r.len(), cast_slice(r).to_vec()))
            .collect();
        let mut served: Vec<(usize, Vec<WireRoute>)> = Vec::new();
        for (peer, n, bytes) in exchange_all(comm, base, outgoing, |n| n * WireRoute::SIZE)? {
            served.push((peer, read_records(&bytes, n).map_err(|e| DistError::comm(peer, e))?));
        }
        served.push((me, own_requests));
        served.sort_by_key(|(requester, _)| *requester);

        let mut send_lists: Vec<Vec<(usize, usize)>> = vec![Vec::new(); nranks];
        let mut local = Vec::new();
        for route in served.iter().flat_map(|(_, routes)| routes) {
            let (src_off, dst_rank, dst_off) = route.decode();
            if dst_rank >= nranks {
                return Err(DistError::comm(me, format!("route to unknown rank {dst_rank}")));
            }
            if dst_rank == me {
                local.push((src_off, dst_off));
            } else {
                send_lists[dst_rank].push((src_off, dst_off));
            }
        }

        // Round 2: destinations learn the slot order of each incoming message.
        let outgoing: Vec<(usize, usize, Vec<u8>)> = send_lists
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(peer, l)| {
                let offs: Vec<WireIndex> = l.iter().map(|&(_, d)| WireIndex::of(d)).collect();
                (peer, l.len(), cast_slice(&offs).to_vec())
            })
            .collect();
        let incoming = exchange_all(comm, base.offset(2), outgoing, |n| {
            n * size_of::<WireIndex>()
        })?;
        let mut recvs = Vec::with_capacity(incoming.len());
        for (peer, n, bytes) in incoming {
            let offs: Vec<WireIndex> =
                read_records(&bytes, n).map_err(|e| DistError::comm(peer, e))?;
            recvs.push(PeerLeg {
                peer,
                slots: offs.iter().map(WireIndex::get).collect(),
            });
        }

        let sends = send_lists
            .into_iter()
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(peer, l)| PeerLeg {
                peer,
                slots: l.into_iter().map(|(s, _)| s).collect(),
            })
            .collect();

        let plan = ScatterPlan {
            sends,
            recvs,
            local,
            src_len: src.local_len(me),
            dst_len: dst.local_len(me),
            forward_tag: exec_tags.base(),
            reverse_tag: exec_tags.base().offset(1),
            _tags: Arc::new(exec_tags),
        };
        plan.debug_assert_invariants();
        let st = plan.stats();
        log::debug!(
            "[rank {me}] scatter plan: {} values to {} ranks, {} values from {} ranks, {} local",
            st.send_len,
            st.send_peers,
            st.recv_len,
            st.recv_peers,
            st.local_len
        );
        Ok(plan)
    }

    pub fn stats(&self) -> PlanStats {
        PlanStats {
            send_peers: self.sends.len(),
            recv_peers: self.recvs.len(),
            send_len: self.sends.iter().map(|l| l.slots.len()).sum(),
            recv_len: self.recvs.iter().map(|l| l.slots.len()).sum(),
            local_len: self.local.len(),
        }
    }

    /// Length of this rank's source piece.
    pub fn source_len(&self) -> usize {
        self.src_len
    }

    /// Length of this rank's destination piece.
    pub fn dest_len(&self) -> usize {
        self.dst_len
    }

    /// Forward send legs (source slots per destination rank).
    pub fn send_legs(&self) -> &[PeerLeg] {
        &self.sends
    }

    /// Forward receive legs (destination slots per source rank).
    pub fn recv_legs(&self) -> &[PeerLeg] {
        &self.recvs
    }

    /// Same-process `(source slot, destination slot)` pairs.
    pub fn local_pairs(&self) -> &[(usize, usize)] {
        &self.local
    }
}

impl DebugInvariants for ScatterPlan {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "ScatterPlan");
    }

    fn validate_invariants(&self) -> Result<(), DistError> {
        let out_of = |slot: usize, len: usize| DistError::IndexOutOfRange { index: slot, size: len };
        for leg in &self.sends {
            if let Some(&s) = leg.slots.iter().find(|&&s| s >= self.src_len) {
                return Err(out_of(s, self.src_len));
            }
        }
        for leg in &self.recvs {
            if let Some(&d) = leg.slots.iter().find(|&&d| d >= self.dst_len) {
                return Err(out_of(d, self.dst_len));
            }
        }
        for &(s, d) in &self.local {
            if s >= self.src_len {
                return Err(out_of(s, self.src_len));
            }
            if d >= self.dst_len {
                return Err(out_of(d, self.dst_len));
            }
        }
        let sorted = |legs: &[PeerLeg]| legs.windows(2).all(|w| w[0].peer < w[1].peer);
        if !sorted(&self.sends) || !sorted(&self.recvs) {
            return Err(DistError::InvalidLayout("plan legs not sorted by peer".into()));
        }
        Ok(())
    }
}
