//! Global index partition: which rank owns each global index, and where.
//!
//! A [`Layout`] is either *contiguous* (rank `r` owns `[start_r, end_r)`) or
//! *explicit* (an arbitrary owner per global index). In the explicit case the
//! local offset of an index is its position among the indices owned by the
//! same rank, in increasing global order.
//!
//! Layouts are immutable once built and are shared between containers through
//! `Arc<Layout>`.

use crate::algs::communicator::Communicator;
use crate::algs::wire::{WireIndex, cast_slice, read_records};
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Local size request for [`Layout::create`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalSize {
    /// Let the balanced split decide.
    Auto,
    /// This rank owns exactly this many indices.
    Fixed(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Ownership {
    /// `ranges[r]..ranges[r + 1]` is owned by rank `r`.
    Contiguous { ranges: Vec<usize> },
    Explicit {
        owners: Vec<usize>,
        offsets: Vec<usize>,
        members: Vec<Vec<usize>>,
    },
}

/// Partition of `[0, N)` over `P` ranks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    global_size: usize,
    ownership: Ownership,
}

impl Layout {
    /// Balanced contiguous split: every rank gets `N / P` indices and the
    /// first `N % P` ranks get one more.
    pub fn split(global_size: usize, num_ranks: usize) -> Result<Self, DistError> {
        if num_ranks == 0 {
            return Err(DistError::InvalidLayout("layout needs at least one rank".into()));
        }
        let base = global_size / num_ranks;
        let extra = global_size % num_ranks;
        let sizes: Vec<usize> = (0..num_ranks)
            .map(|r| base + usize::from(r < extra))
            .collect();
        Self::from_local_sizes(&sizes)
    }

    /// Contiguous layout with caller-chosen per-rank sizes.
    pub fn from_local_sizes(sizes: &[usize]) -> Result<Self, DistError> {
        if sizes.is_empty() {
            return Err(DistError::InvalidLayout("layout needs at least one rank".into()));
        }
        let mut ranges = Vec::with_capacity(sizes.len() + 1);
        let mut acc = 0usize;
        ranges.push(0);
        for &n in sizes {
            acc = acc
                .checked_add(n)
                .ok_or_else(|| DistError::InvalidLayout("local sizes overflow usize".into()))?;
            ranges.push(acc);
        }
        let layout = Self {
            global_size: acc,
            ownership: Ownership::Contiguous { ranges },
        };
        layout.debug_assert_invariants();
        Ok(layout)
    }

    /// Explicit layout: `owners[g]` is the rank owning global index `g`.
    pub fn from_owners(owners: Vec<usize>, num_ranks: usize) -> Result<Self, DistError> {
        if num_ranks == 0 {
            return Err(DistError::InvalidLayout("layout needs at least one rank".into()));
        }
        let mut members = vec![Vec::new(); num_ranks];
        let mut offsets = Vec::with_capacity(owners.len());
        for (g, &r) in owners.iter().enumerate() {
            let list = members.get_mut(r).ok_or_else(|| {
                DistError::InvalidLayout(format!(
                    "index {g} assigned to rank {r}, but only {num_ranks} ranks exist"
                ))
            })?;
            offsets.push(list.len());
            list.push(g);
        }
        let layout = Self {
            global_size: owners.len(),
            ownership: Ownership::Explicit {
                owners,
                offsets,
                members,
            },
        };
        layout.debug_assert_invariants();
        Ok(layout)
    }

    /// Collective construction.
    ///
    /// With [`LocalSize::Auto`] the balanced split of `global_size` is used,
    /// so the total must be given. With [`LocalSize::Fixed`] the local sizes
    /// are all-gathered; a given total must equal their sum.
    pub fn create<C: Communicator>(
        comm: &C,
        local: LocalSize,
        global_size: Option<usize>,
    ) -> Result<Self, DistError> {
        match local {
            LocalSize::Auto => {
                let n = global_size.ok_or_else(|| {
                    DistError::InvalidLayout(
                        "either the global size or the local size must be given".into(),
                    )
                })?;
                Self::split(n, comm.size())
            }
            LocalSize::Fixed(n) => {
                let mine = [WireIndex::of(n)];
                let mut all = vec![0u8; comm.size() * std::mem::size_of::<WireIndex>()];
                comm.allgather(cast_slice(&mine), &mut all)?;
                let sizes: Vec<usize> = read_records::<WireIndex>(&all, comm.size())
                    .map_err(|e| DistError::comm(comm.rank(), e))?
                    .iter()
                    .map(WireIndex::get)
                    .collect();
                let layout = Self::from_local_sizes(&sizes)?;
                if let Some(total) = global_size {
                    if total != layout.global_size {
                        return Err(DistError::SizeMismatch {
                            context: "sum of local sizes vs. global size",
                            expected: total,
                            got: layout.global_size,
                        });
                    }
                }
                log::debug!(
                    "[rank {}] layout from local sizes {:?} (N = {})",
                    comm.rank(),
                    sizes,
                    layout.global_size
                );
                Ok(layout)
            }
        }
    }

    #[inline]
    pub fn global_size(&self) -> usize {
        self.global_size
    }

    #[inline]
    pub fn num_ranks(&self) -> usize {
        match &self.ownership {
            Ownership::Contiguous { ranges } => ranges.len() - 1,
            Ownership::Explicit { members, .. } => members.len(),
        }
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        matches!(self.ownership, Ownership::Contiguous { .. })
    }

    /// Number of indices owned by `rank` (zero for unknown ranks).
    pub fn local_size(&self, rank: usize) -> usize {
        match &self.ownership {
            Ownership::Contiguous { ranges } if rank + 1 < ranges.len() => {
                ranges[rank + 1] - ranges[rank]
            }
            Ownership::Explicit { members, .. } => members.get(rank).map_or(0, Vec::len),
            _ => 0,
        }
    }

    /// Per-rank local sizes.
    pub fn local_sizes(&self) -> Vec<usize> {
        (0..self.num_ranks()).map(|r| self.local_size(r)).collect()
    }

    /// Owned range of `rank`; `None` for explicit layouts or unknown ranks.
    pub fn owned_range(&self, rank: usize) -> Option<Range<usize>> {
        match &self.ownership {
            Ownership::Contiguous { ranges } if rank + 1 < ranges.len() => {
                Some(ranges[rank]..ranges[rank + 1])
            }
            _ => None,
        }
    }

    /// Global indices owned by `rank`, in local-offset order.
    pub fn owned_indices(&self, rank: usize) -> Vec<usize> {
        match &self.ownership {
            Ownership::Contiguous { .. } => self
                .owned_range(rank)
                .map_or_else(Vec::new, |r| r.collect()),
            Ownership::Explicit { members, .. } => {
                members.get(rank).cloned().unwrap_or_default()
            }
        }
    }

    /// Owning rank of global index `g`.
    pub fn owner_of(&self, g: usize) -> Result<usize, DistError> {
        self.locate(g).map(|(r, _)| r)
    }

    /// Offset of `g` within its owner's local storage.
    pub fn local_offset(&self, g: usize) -> Result<usize, DistError> {
        self.locate(g).map(|(_, off)| off)
    }

    /// `(owner, local offset)` of global index `g`.
    pub fn locate(&self, g: usize) -> Result<(usize, usize), DistError> {
        if g >= self.global_size {
            return Err(DistError::IndexOutOfRange {
                index: g,
                size: self.global_size,
            });
        }
        Ok(match &self.ownership {
            Ownership::Contiguous { ranges } => {
                // last range start <= g; empty ranks share a start and are skipped
                let r = ranges.partition_point(|&start| start <= g) - 1;
                (r, g - ranges[r])
            }
            Ownership::Explicit {
                owners, offsets, ..
            } => (owners[g], offsets[g]),
        })
    }

    /// Global index stored at `offset` on `rank`.
    pub fn global_index(&self, rank: usize, offset: usize) -> Result<usize, DistError> {
        let size = self.local_size(rank);
        if offset >= size {
            return Err(DistError::IndexOutOfRange {
                index: offset,
                size,
            });
        }
        Ok(match &self.ownership {
            Ownership::Contiguous { ranges } => ranges[rank] + offset,
            Ownership::Explicit { members, .. } => members[rank][offset],
        })
    }

    /// True when both layouts give every index the same owner and offset,
    /// whichever way they are represented.
    pub fn same_partition(&self, other: &Layout) -> bool {
        if self == other {
            return true;
        }
        self.global_size == other.global_size
            && self.num_ranks() == other.num_ranks()
            && (0..self.global_size).all(|g| self.locate(g).ok() == other.locate(g).ok())
    }

    /// The same indices gathered onto the first rank of every group of
    /// `group_size` consecutive ranks. The other ranks of a group end up
    /// owning nothing; the rank count is unchanged.
    pub fn consolidate(&self, group_size: usize) -> Result<Self, DistError> {
        if group_size == 0 {
            return Err(DistError::InvalidLayout("group size must be positive".into()));
        }
        let leader = |r: usize| r - r % group_size;
        match &self.ownership {
            Ownership::Contiguous { .. } => {
                let mut sizes = vec![0; self.num_ranks()];
                for r in 0..self.num_ranks() {
                    sizes[leader(r)] += self.local_size(r);
                }
                Self::from_local_sizes(&sizes)
            }
            Ownership::Explicit { owners, .. } => Self::from_owners(
                owners.iter().map(|&r| leader(r)).collect(),
                self.num_ranks(),
            ),
        }
    }
}

impl DebugInvariants for Layout {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Layout");
    }

    fn validate_invariants(&self) -> Result<(), DistError> {
        match &self.ownership {
            Ownership::Contiguous { ranges } => {
                if ranges.first() != Some(&0) || ranges.last() != Some(&self.global_size) {
                    return Err(DistError::InvalidLayout(format!(
                        "ranges {ranges:?} do not cover [0, {})",
                        self.global_size
                    )));
                }
                if ranges.windows(2).any(|w| w[0] > w[1]) {
                    return Err(DistError::InvalidLayout(format!(
                        "ranges {ranges:?} are not monotone"
                    )));
                }
            }
            Ownership::Explicit {
                owners,
                offsets,
                members,
            } => {
                let total: usize = members.iter().map(Vec::len).sum();
                if total != self.global_size || owners.len() != self.global_size {
                    return Err(DistError::InvalidLayout(format!(
                        "members cover {total} of {} indices",
                        self.global_size
                    )));
                }
                for (r, list) in members.iter().enumerate() {
                    for (off, &g) in list.iter().enumerate() {
                        if owners[g] != r || offsets[g] != off {
                            return Err(DistError::InvalidLayout(format!(
                                "index {g} listed on rank {r} at {off}, recorded as ({}, {})",
                                owners[g], offsets[g]
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
