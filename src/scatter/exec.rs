//! Executing a [`ScatterPlan`] as a non-blocking begin/end pair.
//!
//! `begin` posts the receives, packs and sends the outgoing values and runs
//! every same-process leg synchronously. `end` waits for this rank's own
//! peers and combines what arrived. A begun scatter cannot be cancelled: the
//! handle must be passed to `end`, and dropping it leaves messages in flight
//! that will poison the next cycle on the same plan.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::size_exchange::{PostedRecvs, PostedSends, post_payloads, post_receives};
use crate::algs::wire::{scalars_from_bytes, scalars_to_bytes};
use crate::data::combine::{CombineMode, Scalar};
use crate::dist_error::DistError;
use crate::scatter::plan::{PeerLeg, ScatterPlan};
use std::marker::PhantomData;
use std::mem::size_of;

/// Which way values flow through a plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    /// Source slots to destination slots.
    Forward,
    /// Destination slots back to source slots, same plan.
    Reverse,
}

/// An in-flight scatter; complete it with [`ScatterPlan::end`].
#[must_use = "a begun scatter must be completed with `ScatterPlan::end`"]
pub struct ScatterHandle<C: Communicator, T> {
    recvs: Option<PostedRecvs<C>>,
    sends: Option<PostedSends<C>>,
    mode: CombineMode,
    direction: Direction,
    tag: CommTag,
    _values: PhantomData<fn() -> T>,
}

impl<C: Communicator, T> ScatterHandle<C, T> {
    pub fn mode(&self) -> CombineMode {
        self.mode
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl<C: Communicator, T> Drop for ScatterHandle<C, T> {
    fn drop(&mut self) {
        if self.recvs.is_some() || self.sends.is_some() {
            log::error!(
                "scatter handle ({:?}, tag {:#x}) dropped without `end`; transfers left in flight",
                self.direction,
                self.tag.as_u16()
            );
        }
    }
}

struct Roles<'a> {
    send: &'a [PeerLeg],
    recv: &'a [PeerLeg],
    tag: CommTag,
    from_len: usize,
    to_len: usize,
}

impl ScatterPlan {
    fn roles(&self, direction: Direction) -> Roles<'_> {
        match direction {
            Direction::Forward => Roles {
                send: &self.sends,
                recv: &self.recvs,
                tag: self.forward_tag,
                from_len: self.src_len,
                to_len: self.dst_len,
            },
            Direction::Reverse => Roles {
                send: &self.recvs,
                recv: &self.sends,
                tag: self.reverse_tag,
                from_len: self.dst_len,
                to_len: self.src_len,
            },
        }
    }

    fn post<C: Communicator, T: Scalar>(
        &self,
        comm: &C,
        x: &[T],
        mode: CombineMode,
        direction: Direction,
    ) -> ScatterHandle<C, T> {
        let roles = self.roles(direction);
        let lens: Vec<(usize, usize)> = roles
            .recv
            .iter()
            .map(|leg| (leg.peer, leg.slots.len() * size_of::<T>()))
            .collect();
        let recvs = post_receives(comm, roles.tag, &lens);
        let outgoing: Vec<(usize, Vec<u8>)> = roles
            .send
            .iter()
            .map(|leg| {
                let packed: Vec<T> = leg.slots.iter().map(|&s| x[s]).collect();
                (leg.peer, scalars_to_bytes(&packed))
            })
            .collect();
        let sends = post_payloads(comm, roles.tag, &outgoing);
        ScatterHandle {
            recvs: Some(recvs),
            sends: Some(sends),
            mode,
            direction,
            tag: roles.tag,
            _values: PhantomData,
        }
    }

    /// Start moving `x` into `y` (`x` and `y` are this rank's pieces).
    ///
    /// Same-process legs are applied to `y` before returning.
    pub fn begin<C: Communicator, T: Scalar>(
        &self,
        comm: &C,
        x: &[T],
        y: &mut [T],
        mode: CombineMode,
        direction: Direction,
    ) -> Result<ScatterHandle<C, T>, DistError> {
        let roles = self.roles(direction);
        if x.len() != roles.from_len {
            return Err(DistError::SizeMismatch {
                context: "scatter input",
                expected: roles.from_len,
                got: x.len(),
            });
        }
        if y.len() != roles.to_len {
            return Err(DistError::SizeMismatch {
                context: "scatter output",
                expected: roles.to_len,
                got: y.len(),
            });
        }
        let handle = self.post(comm, x, mode, direction);
        for &(s, d) in &self.local {
            let (from, to) = match direction {
                Direction::Forward => (s, d),
                Direction::Reverse => (d, s),
            };
            mode.apply(&mut y[to], x[from]);
        }
        Ok(handle)
    }

    /// Like [`Self::begin`] when source and destination share one buffer.
    ///
    /// Same-process legs that map a slot onto itself are skipped: the value is
    /// already in place, under ADD as well as INSERT.
    pub fn begin_in_place<C: Communicator, T: Scalar>(
        &self,
        comm: &C,
        buf: &mut [T],
        mode: CombineMode,
        direction: Direction,
    ) -> Result<ScatterHandle<C, T>, DistError> {
        let need = self.src_len.max(self.dst_len);
        if buf.len() < need {
            return Err(DistError::SizeMismatch {
                context: "in-place scatter buffer",
                expected: need,
                got: buf.len(),
            });
        }
        let handle = self.post(comm, buf, mode, direction);
        let moves: Vec<(usize, T)> = self
            .local
            .iter()
            .filter(|(s, d)| s != d)
            .map(|&(s, d)| match direction {
                Direction::Forward => (d, buf[s]),
                Direction::Reverse => (s, buf[d]),
            })
            .collect();
        for (to, v) in moves {
            mode.apply(&mut buf[to], v);
        }
        Ok(handle)
    }

    /// Wait for this rank's incoming messages and combine them into `y`.
    pub fn end<C: Communicator, T: Scalar>(
        &self,
        mut handle: ScatterHandle<C, T>,
        y: &mut [T],
    ) -> Result<(), DistError> {
        let roles = self.roles(handle.direction);
        let (recvs, sends) = match (handle.recvs.take(), handle.sends.take()) {
            (Some(r), Some(s)) => (r, s),
            _ => return Err(DistError::state("scatter end", "handle already completed")),
        };
        let received = recvs.wait();
        sends.wait();
        if handle.tag != roles.tag {
            return Err(DistError::state(
                "scatter end",
                "handle was begun on a different plan",
            ));
        }
        if y.len() < roles.to_len {
            return Err(DistError::SizeMismatch {
                context: "scatter output",
                expected: roles.to_len,
                got: y.len(),
            });
        }
        for (peer, bytes) in received? {
            let leg = roles
                .recv
                .binary_search_by_key(&peer, |l| l.peer)
                .map(|i| &roles.recv[i])
                .map_err(|_| DistError::comm(peer, "unexpected scatter message"))?;
            let values: Vec<T> = scalars_from_bytes(&bytes);
            for (&slot, v) in leg.slots.iter().zip(values) {
                handle.mode.apply(&mut y[slot], v);
            }
        }
        Ok(())
    }
}
