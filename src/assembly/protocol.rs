//! Two-phase assembly: flush stashed off-process entries to their owners.
//!
//! ```text
//! Unassembled --begin--> BeginIssued --end--> Assembled
//!      ^                                          |
//!      +-------------------- set -----------------+
//! ```
//!
//! `begin` sends every peer the number of entries it will get (zero
//! included) together with the payloads and posts the count receives; it
//! never blocks. `end` waits for the counts, receives the payloads of the
//! negotiated length, and hands every entry to the caller's apply function.
//! Messages are applied in ascending source-rank order.
//!
//! INSERT from several ranks onto one index has no defined winner.

use crate::algs::communicator::{Communicator, ExchangeTags, TagLease};
use crate::algs::size_exchange::{
    PostedCounts, PostedSends, post_counts, post_payloads, post_receives,
};
use crate::assembly::stash::{Stash, StashEntry, decode, message_len};
use crate::data::combine::CombineMode;
use crate::dist_error::DistError;
use crate::options::AssemblyOptions;

/// Where a container is in the assembly cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssemblyState {
    Unassembled,
    BeginIssued,
    Assembled,
}

struct Pending<C: Communicator> {
    counts: PostedCounts<C>,
    sends: PostedSends<C>,
    mode: Option<CombineMode>,
}

/// Insertion buffer plus the protocol state of one container.
pub struct Assembler<C: Communicator, E: StashEntry> {
    comm: C,
    tags: ExchangeTags,
    _lease: TagLease,
    stash: Stash<E>,
    state: AssemblyState,
    mode: Option<CombineMode>,
    options: AssemblyOptions,
    dropped: usize,
    pending: Option<Pending<C>>,
}

impl<C: Communicator + Clone, E: StashEntry> Assembler<C, E> {
    /// Collective: reserves this container's tag pair.
    pub fn new(comm: C, options: AssemblyOptions) -> Result<Self, DistError> {
        let lease = comm.reserve_tags(2)?;
        let tags = ExchangeTags::from_base(lease.base());
        let stash = Stash::new(comm.size());
        Ok(Self {
            comm,
            tags,
            _lease: lease,
            stash,
            state: AssemblyState::Unassembled,
            mode: None,
            options,
            dropped: 0,
            pending: None,
        })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    /// Combine mode of the current cycle, once a value has been set.
    pub fn mode(&self) -> Option<CombineMode> {
        self.mode
    }

    /// Entries waiting in the stash.
    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    /// Gate every mutation: no sets while a flush is in flight, one combine
    /// mode per cycle.
    pub fn check_set(
        &mut self,
        operation: &'static str,
        mode: CombineMode,
    ) -> Result<(), DistError> {
        if self.state == AssemblyState::BeginIssued {
            return Err(DistError::state(
                operation,
                "cannot set values between assembly_begin and assembly_end",
            ));
        }
        match self.mode {
            Some(existing) if existing != mode => Err(DistError::CombineModeConflict {
                existing,
                requested: mode,
                peer: None,
            }),
            _ => Ok(()),
        }
    }

    /// Record that a value was set with `mode` (after [`Self::check_set`]).
    pub fn mark_set(&mut self, mode: CombineMode) {
        self.mode = Some(mode);
        self.state = AssemblyState::Unassembled;
    }

    /// Queue an entry owned by `dest`.
    pub fn stash(&mut self, dest: usize, entry: E) {
        if self.options.ignore_off_process_entries {
            self.dropped += 1;
            return;
        }
        self.stash.push(dest, entry);
    }

    /// Start the flush. Never blocks.
    pub fn begin(&mut self) -> Result<(), DistError> {
        if self.state == AssemblyState::BeginIssued {
            return Err(DistError::state(
                "assembly_begin",
                "assembly_begin called twice without assembly_end",
            ));
        }
        let me = self.comm.rank();
        if self.dropped > 0 {
            log::warn!(
                "[rank {me}] dropped {} off-process entries (ignore_off_process_entries)",
                self.dropped
            );
            self.dropped = 0;
        }
        log::debug!(
            "[rank {me}] assembly_begin: {} stashed entries for {} ranks",
            self.stash.len(),
            self.stash.num_destinations()
        );

        let counts = self.stash.counts();
        let posted = post_counts(&self.comm, self.tags.sizes, &counts)?;
        let messages = self.stash.drain_messages(self.mode)?;
        let sends = post_payloads(&self.comm, self.tags.data, &messages);
        self.pending = Some(Pending {
            counts: posted,
            sends,
            mode: self.mode,
        });
        self.state = AssemblyState::BeginIssued;
        Ok(())
    }

    /// Finish the flush, calling `apply` for every received entry.
    ///
    /// On error every outstanding handle is still drained and the container
    /// falls back to `Unassembled`.
    pub fn end<F>(&mut self, apply: F) -> Result<(), DistError>
    where
        F: FnMut(E, CombineMode) -> Result<(), DistError>,
    {
        let pending = match (self.state, self.pending.take()) {
            (AssemblyState::BeginIssued, Some(p)) => p,
            _ => {
                return Err(DistError::state(
                    "assembly_end",
                    "assembly_end called without a matching assembly_begin",
                ));
            }
        };
        let result = self.finish(pending, apply);
        self.mode = None;
        self.state = match result {
            Ok(()) => AssemblyState::Assembled,
            Err(_) => AssemblyState::Unassembled,
        };
        result
    }

    fn finish<F>(&self, pending: Pending<C>, mut apply: F) -> Result<(), DistError>
    where
        F: FnMut(E, CombineMode) -> Result<(), DistError>,
    {
        let me = self.comm.rank();
        let counts = match pending.counts.wait() {
            Ok(c) => c,
            Err(e) => {
                pending.sends.wait();
                return Err(e);
            }
        };
        let lens: Vec<(usize, usize)> = counts
            .iter()
            .enumerate()
            .filter(|&(p, &n)| p != me && n > 0)
            .map(|(p, &n)| {
                log::trace!("[rank {me}] expecting {n} entries from rank {p}");
                (p, message_len::<E>(n))
            })
            .collect();
        let received = post_receives(&self.comm, self.tags.data, &lens).wait();
        pending.sends.wait();

        // Decode and check every message before touching storage.
        let mut cycle_mode = pending.mode;
        let mut batches = Vec::new();
        for (peer, bytes) in received? {
            let (peer_mode, entries) = decode::<E>(peer, &bytes)?;
            let peer_mode = peer_mode.ok_or_else(|| {
                DistError::comm(peer, "entries received without a combine mode")
            })?;
            match cycle_mode {
                Some(existing) if existing != peer_mode => {
                    return Err(DistError::CombineModeConflict {
                        existing,
                        requested: peer_mode,
                        peer: Some(peer),
                    });
                }
                _ => cycle_mode = Some(peer_mode),
            }
            batches.push((peer_mode, entries));
        }
        for (mode, entries) in batches {
            for e in entries {
                apply(e, mode)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::assembly::stash::VecEntry;

    fn serial() -> Assembler<NoComm, VecEntry<f64>> {
        Assembler::new(NoComm, AssemblyOptions::default()).unwrap()
    }

    #[test]
    fn end_without_begin_is_state_error() {
        let mut a = serial();
        let err = a.end(|_, _| Ok(())).unwrap_err();
        assert!(matches!(err, DistError::StateError { operation: "assembly_end", .. }));
        assert_eq!(a.state(), AssemblyState::Unassembled);
    }

    #[test]
    fn double_begin_is_state_error() {
        let mut a = serial();
        a.begin().unwrap();
        assert!(matches!(a.begin(), Err(DistError::StateError { .. })));
        a.end(|_, _| Ok(())).unwrap();
        assert_eq!(a.state(), AssemblyState::Assembled);
    }

    #[test]
    fn set_during_begin_is_rejected() {
        let mut a = serial();
        a.begin().unwrap();
        assert!(matches!(
            a.check_set("set", CombineMode::Add),
            Err(DistError::StateError { .. })
        ));
        a.end(|_, _| Ok(())).unwrap();
        a.check_set("set", CombineMode::Add).unwrap();
    }

    #[test]
    fn modes_do_not_mix_within_a_cycle() {
        let mut a = serial();
        a.check_set("set", CombineMode::Insert).unwrap();
        a.mark_set(CombineMode::Insert);
        assert!(matches!(
            a.check_set("set", CombineMode::Add),
            Err(DistError::CombineModeConflict { peer: None, .. })
        ));
        a.begin().unwrap();
        a.end(|_, _| Ok(())).unwrap();
        // a completed cycle resets the mode
        a.check_set("set", CombineMode::Add).unwrap();
    }

    #[test]
    fn ignored_entries_never_reach_the_stash() {
        let mut a: Assembler<NoComm, VecEntry<f64>> = Assembler::new(
            NoComm,
            AssemblyOptions {
                ignore_off_process_entries: true,
                ..Default::default()
            },
        )
        .unwrap();
        a.stash(0, VecEntry { index: 0, value: 1.0 });
        assert_eq!(a.stashed(), 0);
    }
}
