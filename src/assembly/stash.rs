//! Insertion buffer for entries owned by other ranks.
//!
//! Entries are queued per destination rank until assembly flushes them. A
//! flushed message is laid out as
//!
//! ```text
//! [WireHdr][WireCount n][n * KEYS WireIndex][n values]
//! ```
//!
//! so its byte length follows from `n` alone.

use crate::algs::wire::{
    KIND_MAT_ENTRIES, KIND_VEC_ENTRIES, WIRE_VERSION, WireCount, WireHdr, WireIndex, cast_slice,
    get_scalar, put_scalar, read_records,
};
use crate::data::combine::{CombineMode, Scalar};
use crate::dist_error::DistError;
use std::mem::size_of;

/// A pending off-process entry.
pub trait StashEntry: Copy + Send + Sync + 'static {
    type Value: Scalar;
    /// Message kind written into the wire header.
    const KIND: u16;
    /// Number of indices per entry.
    const KEYS: usize;

    fn value(&self) -> Self::Value;
    fn push_keys(&self, out: &mut Vec<WireIndex>);
    fn from_parts(keys: &[WireIndex], value: Self::Value) -> Self;
}

/// Vector entry `(index, value)`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VecEntry<T> {
    pub index: usize,
    pub value: T,
}

impl<T: Scalar> StashEntry for VecEntry<T> {
    type Value = T;
    const KIND: u16 = KIND_VEC_ENTRIES;
    const KEYS: usize = 1;

    fn value(&self) -> T {
        self.value
    }
    fn push_keys(&self, out: &mut Vec<WireIndex>) {
        out.push(WireIndex::of(self.index));
    }
    fn from_parts(keys: &[WireIndex], value: T) -> Self {
        Self {
            index: keys[0].get(),
            value,
        }
    }
}

/// Matrix entry `(row, col, value)`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MatEntry<T> {
    pub row: usize,
    pub col: usize,
    pub value: T,
}

impl<T: Scalar> StashEntry for MatEntry<T> {
    type Value = T;
    const KIND: u16 = KIND_MAT_ENTRIES;
    const KEYS: usize = 2;

    fn value(&self) -> T {
        self.value
    }
    fn push_keys(&self, out: &mut Vec<WireIndex>) {
        out.push(WireIndex::of(self.row));
        out.push(WireIndex::of(self.col));
    }
    fn from_parts(keys: &[WireIndex], value: T) -> Self {
        Self {
            row: keys[0].get(),
            col: keys[1].get(),
            value,
        }
    }
}

const PREFIX: usize = size_of::<WireHdr>() + size_of::<WireCount>();

/// Byte length of a message carrying `n` entries.
pub fn message_len<E: StashEntry>(n: usize) -> usize {
    PREFIX + n * (E::KEYS * size_of::<WireIndex>() + size_of::<E::Value>())
}

/// Per-destination queue of pending entries.
#[derive(Clone, Debug)]
pub struct Stash<E> {
    per_rank: Vec<Vec<E>>,
    len: usize,
}

impl<E: StashEntry> Stash<E> {
    pub fn new(num_ranks: usize) -> Self {
        Self {
            per_rank: vec![Vec::new(); num_ranks],
            len: 0,
        }
    }

    /// Queue `entry` for `dest`.
    pub fn push(&mut self, dest: usize, entry: E) {
        self.per_rank[dest].push(entry);
        self.len += 1;
    }

    /// Total number of queued entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of ranks with at least one queued entry.
    pub fn num_destinations(&self) -> usize {
        self.per_rank.iter().filter(|v| !v.is_empty()).count()
    }

    /// Entries queued per rank.
    pub fn counts(&self) -> Vec<usize> {
        self.per_rank.iter().map(Vec::len).collect()
    }

    /// Encode every non-empty queue and clear the stash.
    ///
    /// Nothing is cleared if any queue fails to encode.
    pub fn drain_messages(
        &mut self,
        mode: Option<CombineMode>,
    ) -> Result<Vec<(usize, Vec<u8>)>, DistError> {
        let out = self
            .per_rank
            .iter()
            .enumerate()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(dest, entries)| Ok((dest, encode(entries, mode)?)))
            .collect::<Result<Vec<_>, DistError>>()?;
        self.per_rank.iter_mut().for_each(Vec::clear);
        self.len = 0;
        Ok(out)
    }
}

fn encode<E: StashEntry>(entries: &[E], mode: Option<CombineMode>) -> Result<Vec<u8>, DistError> {
    let n = entries.len();
    let mut out = Vec::with_capacity(message_len::<E>(n));
    let hdr = WireHdr::new(E::KIND, CombineMode::to_wire(mode));
    out.extend_from_slice(cast_slice(std::slice::from_ref(&hdr)));
    out.extend_from_slice(cast_slice(std::slice::from_ref(&WireCount::new(n)?)));
    let mut keys = Vec::with_capacity(n * E::KEYS);
    for e in entries {
        e.push_keys(&mut keys);
    }
    out.extend_from_slice(cast_slice(&keys));
    for e in entries {
        put_scalar(&mut out, e.value());
    }
    Ok(out)
}

/// Decode a message received from `peer`.
pub fn decode<E: StashEntry>(
    peer: usize,
    bytes: &[u8],
) -> Result<(Option<CombineMode>, Vec<E>), DistError> {
    let hdr = read_records::<WireHdr>(bytes, 1).map_err(|e| DistError::comm(peer, e))?[0];
    if hdr.version() != WIRE_VERSION {
        return Err(DistError::comm(
            peer,
            format!("wire version {} (expected {WIRE_VERSION})", hdr.version()),
        ));
    }
    if hdr.kind() != E::KIND {
        return Err(DistError::comm(
            peer,
            format!("message kind {} (expected {})", hdr.kind(), E::KIND),
        ));
    }
    let mode = CombineMode::from_wire(hdr.mode()).map_err(|e| DistError::comm(peer, e))?;
    let n = read_records::<WireCount>(&bytes[size_of::<WireHdr>()..], 1)
        .map_err(|e| DistError::comm(peer, e))?[0]
        .get();
    let expected = message_len::<E>(n);
    if bytes.len() != expected {
        return Err(DistError::BufferSizeMismatch {
            neighbor: peer,
            expected,
            got: bytes.len(),
        });
    }

    let keys_len = n * E::KEYS * size_of::<WireIndex>();
    let keys = read_records::<WireIndex>(&bytes[PREFIX..], n * E::KEYS)
        .map_err(|e| DistError::comm(peer, e))?;
    let entries = bytes[PREFIX + keys_len..]
        .chunks_exact(size_of::<E::Value>())
        .zip(keys.chunks_exact(E::KEYS))
        .map(|(v, k)| E::from_parts(k, get_scalar(v)))
        .collect();
    Ok((mode, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_per_destination() {
        let mut s = Stash::<VecEntry<f64>>::new(3);
        s.push(2, VecEntry { index: 9, value: 1.0 });
        s.push(2, VecEntry { index: 8, value: 2.0 });
        s.push(1, VecEntry { index: 4, value: 3.0 });
        assert_eq!(s.len(), 3);
        assert_eq!(s.counts(), vec![0, 1, 2]);
        assert_eq!(s.num_destinations(), 2);

        let msgs = s.drain_messages(Some(CombineMode::Add)).unwrap();
        assert!(s.is_empty());
        assert_eq!(msgs.iter().map(|(d, _)| *d).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(msgs[1].1.len(), message_len::<VecEntry<f64>>(2));
    }

    #[test]
    fn matrix_message_decodes_with_mode() {
        let mut s = Stash::<MatEntry<f32>>::new(2);
        s.push(1, MatEntry { row: 5, col: 0, value: -2.5 });
        s.push(1, MatEntry { row: 6, col: 3, value: 4.0 });
        let msgs = s.drain_messages(Some(CombineMode::Insert)).unwrap();
        let (mode, entries) = decode::<MatEntry<f32>>(0, &msgs[0].1).unwrap();
        assert_eq!(mode, Some(CombineMode::Insert));
        assert_eq!(entries[1], MatEntry { row: 6, col: 3, value: 4.0 });
    }

    #[test]
    fn wrong_kind_is_a_comm_error() {
        let mut s = Stash::<VecEntry<f64>>::new(2);
        s.push(1, VecEntry { index: 1, value: 1.0 });
        let msgs = s.drain_messages(None).unwrap();
        assert!(matches!(
            decode::<MatEntry<f64>>(0, &msgs[0].1),
            Err(DistError::CommError { neighbor: 0, .. })
        ));
    }

    #[test]
    fn truncated_message_is_rejected() {
        let mut s = Stash::<VecEntry<f64>>::new(2);
        s.push(1, VecEntry { index: 1, value: 1.0 });
        let mut msg = s.drain_messages(None).unwrap().remove(0).1;
        msg.pop();
        assert!(matches!(
            decode::<VecEntry<f64>>(1, &msg),
            Err(DistError::BufferSizeMismatch { neighbor: 1, .. })
        ));
    }
}
