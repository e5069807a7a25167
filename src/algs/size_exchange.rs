//! Split-phase "counts then payloads" exchange between all ranks.
//!
//! Stage 1 tells every peer how many records to expect (zero included), so a
//! receiver always knows which payloads are coming and how long they are.
//! Stage 2 moves the payloads themselves. Both stages are posted in one call
//! and completed in another, and both guarantee that every send/receive handle
//! is drained before returning, even if an error occurs.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, read_records};
use crate::dist_error::DistError;
use std::mem::size_of;

/// Outstanding count exchange; see [`post_counts`].
#[must_use = "posted counts must be completed with `wait`"]
pub struct PostedCounts<C: Communicator> {
    recvs: Vec<(usize, C::RecvHandle)>,
    sends: Vec<C::SendHandle>,
    nranks: usize,
}

/// Send `counts[p]` to every peer `p != rank` and post a count receive from each.
///
/// `counts.len()` must equal `comm.size()`; the own slot is ignored.
pub fn post_counts<C: Communicator>(
    comm: &C,
    tag: CommTag,
    counts: &[usize],
) -> Result<PostedCounts<C>, DistError> {
    let nranks = comm.size();
    let me = comm.rank();
    if counts.len() != nranks {
        return Err(DistError::SizeMismatch {
            context: "per-rank count table",
            expected: nranks,
            got: counts.len(),
        });
    }

    let wire_counts = counts
        .iter()
        .map(|&n| WireCount::new(n))
        .collect::<Result<Vec<_>, _>>()?;

    // 1) post all receives first
    let mut recvs = Vec::with_capacity(nranks.saturating_sub(1));
    for peer in (0..nranks).filter(|&p| p != me) {
        recvs.push((peer, comm.irecv(peer, tag.as_u16(), size_of::<WireCount>())));
    }

    // 2) then all sends
    let mut sends = Vec::with_capacity(nranks.saturating_sub(1));
    for peer in (0..nranks).filter(|&p| p != me) {
        log::trace!("[rank {me}] count {} -> rank {peer}", counts[peer]);
        sends.push(comm.isend(
            peer,
            tag.as_u16(),
            cast_slice(std::slice::from_ref(&wire_counts[peer])),
        ));
    }

    Ok(PostedCounts {
        recvs,
        sends,
        nranks,
    })
}

impl<C: Communicator> PostedCounts<C> {
    /// Wait for every incoming count. Returns one entry per rank (own slot zero).
    pub fn wait(self) -> Result<Vec<usize>, DistError> {
        let mut counts = vec![0usize; self.nranks];
        let mut maybe_err = None;
        for (nbr, h) in self.recvs {
            match h.wait() {
                Some(data) if data.len() == size_of::<WireCount>() => {
                    if maybe_err.is_none() {
                        match read_records::<WireCount>(&data, 1) {
                            Ok(c) => counts[nbr] = c[0].get(),
                            Err(e) => maybe_err = Some(DistError::comm(nbr, e)),
                        }
                    }
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(DistError::comm(
                        nbr,
                        format!(
                            "expected {} bytes for count header, got {}",
                            size_of::<WireCount>(),
                            data.len()
                        ),
                    ));
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(DistError::comm(
                        nbr,
                        format!("failed to receive count from rank {nbr}"),
                    ));
                }
                _ => {} // already have an error; just drain
            }
        }

        // always drain all send handles before returning
        for send in self.sends {
            let _ = send.wait();
        }

        match maybe_err {
            Some(err) => Err(err),
            None => Ok(counts),
        }
    }
}

/// Outstanding payload sends; completed by [`PostedSends::wait`].
#[must_use = "posted sends must be drained with `wait`"]
pub struct PostedSends<C: Communicator> {
    sends: Vec<C::SendHandle>,
}

/// Post one payload send per `(peer, bytes)` pair. Empty payloads are skipped.
pub fn post_payloads<C: Communicator>(
    comm: &C,
    tag: CommTag,
    outgoing: &[(usize, Vec<u8>)],
) -> PostedSends<C> {
    let sends = outgoing
        .iter()
        .filter(|(_, bytes)| !bytes.is_empty())
        .map(|(peer, bytes)| comm.isend(*peer, tag.as_u16(), bytes))
        .collect();
    PostedSends { sends }
}

impl<C: Communicator> PostedSends<C> {
    pub fn wait(self) {
        for send in self.sends {
            let _ = send.wait();
        }
    }
}

/// Outstanding payload receives; completed by [`PostedRecvs::wait`].
#[must_use = "posted receives must be completed with `wait`"]
pub struct PostedRecvs<C: Communicator> {
    recvs: Vec<(usize, usize, C::RecvHandle)>,
}

/// Post one receive per `(peer, byte_len)` pair with a nonzero length.
pub fn post_receives<C: Communicator>(
    comm: &C,
    tag: CommTag,
    incoming: &[(usize, usize)],
) -> PostedRecvs<C> {
    let recvs = incoming
        .iter()
        .filter(|(_, len)| *len > 0)
        .map(|&(peer, len)| (peer, len, comm.irecv(peer, tag.as_u16(), len)))
        .collect();
    PostedRecvs { recvs }
}

impl<C: Communicator> PostedRecvs<C> {
    /// Number of receives still outstanding.
    pub fn len(&self) -> usize {
        self.recvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recvs.is_empty()
    }

    /// Wait for every payload and check its negotiated length.
    ///
    /// Payloads come back sorted by ascending source rank.
    pub fn wait(self) -> Result<Vec<(usize, Vec<u8>)>, DistError> {
        let mut out = Vec::with_capacity(self.recvs.len());
        let mut maybe_err = None;
        for (nbr, expected, h) in self.recvs {
            match h.wait() {
                Some(data) if data.len() == expected => {
                    if maybe_err.is_none() {
                        out.push((nbr, data));
                    }
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(DistError::BufferSizeMismatch {
                        neighbor: nbr,
                        expected,
                        got: data.len(),
                    });
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(DistError::comm(
                        nbr,
                        format!("failed to receive payload from rank {nbr}"),
                    ));
                }
                _ => {}
            }
        }
        if let Some(err) = maybe_err {
            return Err(err);
        }
        out.sort_unstable_by_key(|(nbr, _)| *nbr);
        Ok(out)
    }
}

/// Blocking convenience: counts then payloads in one call.
///
/// `outgoing` holds at most one entry per peer; `record_len` converts a count
/// into a byte length. Used by collective setup code (plan creation).
pub fn exchange_all<C: Communicator>(
    comm: &C,
    tag: CommTag,
    outgoing: Vec<(usize, usize, Vec<u8>)>,
    record_len: impl Fn(usize) -> usize,
) -> Result<Vec<(usize, usize, Vec<u8>)>, DistError> {
    let data_tag = tag.offset(1);
    let mut counts = vec![0usize; comm.size()];
    for (peer, n, _) in &outgoing {
        counts[*peer] = *n;
    }
    let posted = post_counts(comm, tag, &counts)?;
    let payloads: Vec<(usize, Vec<u8>)> =
        outgoing.into_iter().map(|(p, _, bytes)| (p, bytes)).collect();
    let sends = post_payloads(comm, data_tag, &payloads);

    let incoming = match posted.wait() {
        Ok(c) => c,
        Err(e) => {
            sends.wait();
            return Err(e);
        }
    };
    let lens: Vec<(usize, usize)> = incoming
        .iter()
        .enumerate()
        .filter(|&(p, &n)| p != comm.rank() && n > 0)
        .map(|(p, &n)| (p, record_len(n)))
        .collect();
    let recvs = post_receives(comm, data_tag, &lens);
    let res = recvs.wait();
    sends.wait();
    Ok(res?
        .into_iter()
        .map(|(p, bytes)| (p, incoming[p], bytes))
        .collect())
}
