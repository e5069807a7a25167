//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! Posting a send or a receive never blocks; every handle is **waitable** and
//! callers `.wait()` before they trust that a receive buffer is ready.
//! Messages between one `(source, destination, tag)` triple are delivered in
//! the order they were sent.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::dist_error::DistError;

/// Tags at or above this value are reserved for the built-in collectives.
///
/// Every tag stays within 32767, the smallest `MPI_TAG_UB` an MPI
/// implementation may report.
pub const RESERVED_TAG_BASE: u16 = 0x7F00;
/// First tag handed out by [`TagCounter`].
pub const FIRST_USER_TAG: u16 = 0x0100;

const TAG_ALLGATHER: u16 = RESERVED_TAG_BASE;
const TAG_BCAST_LEN: u16 = RESERVED_TAG_BASE + 1;
const TAG_BCAST_DATA: u16 = RESERVED_TAG_BASE + 2;

/// Largest tag every MPI implementation must accept.
pub const MIN_MPI_TAG_UB: u16 = 32767;

static_assertions::const_assert!(TAG_BCAST_DATA <= MIN_MPI_TAG_UB);

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CommTag(pub u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Tag `k` positions after this one.
    #[inline]
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Tag pair for a "sizes then data" exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExchangeTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

impl ExchangeTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// Per-process tag allocator.
///
/// Containers and plans lease their tags at construction and hand them back
/// when dropped. Construction and drop are collective, so every rank sees the
/// same sequence of reservations and releases and draws the same tags.
/// Freed blocks are reused lowest-first; running out is an error, never a
/// silent wrap onto tags that may still be in use.
#[derive(Debug)]
pub struct TagCounter {
    state: Mutex<TagState>,
}

#[derive(Debug)]
struct TagState {
    next: u16,
    // base -> length of each released block, coalesced
    free: BTreeMap<u16, u16>,
}

impl Default for TagCounter {
    fn default() -> Self {
        Self {
            state: Mutex::new(TagState {
                next: FIRST_USER_TAG,
                free: BTreeMap::new(),
            }),
        }
    }
}

impl TagCounter {
    /// Reserve `count` consecutive tags below [`RESERVED_TAG_BASE`].
    pub fn reserve(&self, count: u16) -> Result<CommTag, DistError> {
        let count = count.max(1);
        let mut st = self.state.lock();
        let reuse = st
            .free
            .iter()
            .find(|&(_, &len)| len >= count)
            .map(|(&base, &len)| (base, len));
        if let Some((base, len)) = reuse {
            st.free.remove(&base);
            if len > count {
                st.free.insert(base + count, len - count);
            }
            return Ok(CommTag(base));
        }
        let available = RESERVED_TAG_BASE - st.next;
        if count > available {
            return Err(DistError::TagsExhausted {
                requested: count,
                available,
            });
        }
        let base = st.next;
        st.next += count;
        Ok(CommTag(base))
    }

    /// Return a block obtained from [`Self::reserve`].
    pub fn release(&self, base: CommTag, count: u16) {
        let count = count.max(1);
        let mut st = self.state.lock();
        let mut base = base.as_u16();
        let mut len = count;
        if let Some((&prev, &plen)) = st.free.range(..base).next_back() {
            if prev + plen == base {
                st.free.remove(&prev);
                base = prev;
                len += plen;
            }
        }
        if let Some(nlen) = st.free.remove(&(base + len)) {
            len += nlen;
        }
        if base + len == st.next {
            st.next = base;
        } else {
            st.free.insert(base, len);
        }
    }

    /// Lease `count` tags from a shared counter; they return on drop.
    pub fn lease(self: &Arc<Self>, count: u16) -> Result<TagLease, DistError> {
        let base = self.reserve(count)?;
        Ok(TagLease {
            base,
            count: count.max(1),
            counter: Some(Arc::clone(self)),
        })
    }

    /// Tags currently handed out.
    pub fn in_use(&self) -> usize {
        let st = self.state.lock();
        let freed: usize = st.free.values().map(|&l| usize::from(l)).sum();
        usize::from(st.next - FIRST_USER_TAG) - freed
    }
}

/// A block of consecutive tags owned by one container, plan or exchange.
#[derive(Debug)]
pub struct TagLease {
    base: CommTag,
    count: u16,
    counter: Option<Arc<TagCounter>>,
}

impl TagLease {
    /// Lease not backed by a counter (single-process backends).
    pub fn unmanaged(base: CommTag, count: u16) -> Self {
        Self {
            base,
            count,
            counter: None,
        }
    }

    #[inline]
    pub fn base(&self) -> CommTag {
        self.base
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Drop for TagLease {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take() {
            counter.release(self.base, self.count);
        }
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer`. The bytes are copied before returning.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;

    /// Post a receive of a `len`-byte message from `peer`.
    ///
    /// `wait()` yields the message as sent; callers compare its length against
    /// `len` to detect protocol mismatches.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Number of processes.
    fn size(&self) -> usize;

    /// Lease `count` consecutive tags (collective, same order on all ranks).
    ///
    /// The tags return to the pool when the lease is dropped.
    fn reserve_tags(&self, count: u16) -> Result<TagLease, DistError>;

    /// Gather `sendbuf` from every rank into `recvbuf`, ordered by rank.
    ///
    /// All ranks contribute the same number of bytes and `recvbuf` holds
    /// `size() * sendbuf.len()` bytes.
    fn allgather(&self, sendbuf: &[u8], recvbuf: &mut [u8]) -> Result<(), DistError> {
        let n = sendbuf.len();
        let size = self.size();
        let me = self.rank();
        if recvbuf.len() != n * size {
            return Err(DistError::SizeMismatch {
                context: "allgather receive buffer",
                expected: n * size,
                got: recvbuf.len(),
            });
        }

        let mut recvs = Vec::with_capacity(size.saturating_sub(1));
        for peer in (0..size).filter(|&p| p != me) {
            recvs.push((peer, self.irecv(peer, TAG_ALLGATHER, n)));
        }
        let mut sends = Vec::with_capacity(size.saturating_sub(1));
        for peer in (0..size).filter(|&p| p != me) {
            sends.push(self.isend(peer, TAG_ALLGATHER, sendbuf));
        }
        recvbuf[me * n..(me + 1) * n].copy_from_slice(sendbuf);

        let mut maybe_err = None;
        for (peer, h) in recvs {
            match h.wait() {
                Some(data) if data.len() == n => {
                    recvbuf[peer * n..(peer + 1) * n].copy_from_slice(&data);
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(DistError::BufferSizeMismatch {
                        neighbor: peer,
                        expected: n,
                        got: data.len(),
                    });
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(DistError::comm(peer, "allgather receive returned no data"));
                }
                _ => {}
            }
        }
        for s in sends {
            let _ = s.wait();
        }
        maybe_err.map_or(Ok(()), Err)
    }

    /// Broadcast `data` from `root`; non-root ranks ignore their `data`.
    fn broadcast(&self, root: usize, data: &[u8]) -> Result<Vec<u8>, DistError> {
        if self.rank() == root {
            let len = (data.len() as u64).to_le_bytes();
            let mut sends = Vec::new();
            for peer in (0..self.size()).filter(|&p| p != root) {
                sends.push(self.isend(peer, TAG_BCAST_LEN, &len));
                sends.push(self.isend(peer, TAG_BCAST_DATA, data));
            }
            for s in sends {
                let _ = s.wait();
            }
            return Ok(data.to_vec());
        }

        let raw = self
            .irecv(root, TAG_BCAST_LEN, 8)
            .wait()
            .ok_or_else(|| DistError::comm(root, "broadcast length not received"))?;
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| DistError::BufferSizeMismatch {
                neighbor: root,
                expected: 8,
                got: raw.len(),
            })?;
        let len = u64::from_le_bytes(bytes) as usize;
        let payload = self
            .irecv(root, TAG_BCAST_DATA, len)
            .wait()
            .ok_or_else(|| DistError::comm(root, "broadcast payload not received"))?;
        if payload.len() != len {
            return Err(DistError::BufferSizeMismatch {
                neighbor: root,
                expected: len,
                got: payload.len(),
            });
        }
        Ok(payload)
    }

    /// Synchronize all ranks.
    fn barrier(&self) -> Result<(), DistError> {
        let mut sink = vec![0u8; self.size()];
        self.allgather(&[1], &mut sink)
    }
}

/// Compile-time no-op comm for single-process use and serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn reserve_tags(&self, count: u16) -> Result<TagLease, DistError> {
        Ok(TagLease::unmanaged(CommTag(FIRST_USER_TAG), count))
    }
}

// --- ThreadComm: one rank per thread inside a single process ---
type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Mailbox {
    slots: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    signal: Condvar,
}

impl Mailbox {
    fn deliver(&self, key: Key, payload: Bytes) {
        self.slots.entry(key).or_default().push_back(payload);
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    fn try_take(&self, key: &Key) -> Option<Bytes> {
        let mut queue = self.slots.get_mut(key)?;
        queue.pop_front()
    }

    fn take(&self, key: Key) -> Bytes {
        loop {
            if let Some(b) = self.try_take(&key) {
                return b;
            }
            let mut guard = self.lock.lock();
            if let Some(b) = self.try_take(&key) {
                return b;
            }
            self.signal.wait_for(&mut guard, Duration::from_millis(5));
        }
    }
}

/// Receive handle of [`ThreadComm`]: the message is taken from the mailbox on `wait`.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        Some(self.mailbox.take(self.key).to_vec())
    }
}

/// Thread-backed communicator: each rank runs on its own thread and all ranks
/// of one world share a mailbox.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    tags: Arc<TagCounter>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ThreadComm {
    /// Create the communicators of a fresh `size`-rank world, indexed by rank.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
                tags: Arc::new(TagCounter::default()),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .deliver((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _len: usize) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reserve_tags(&self, count: u16) -> Result<TagLease, DistError> {
        self.tags.lease(count)
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{CommTag, TagCounter, TagLease, Wait};
    use crate::dist_error::DistError;
    use mpi::request::StaticScope;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::sync::Arc;

    struct MpiInner {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
        tags: Arc<TagCounter>,
        // Dropped last: finalizes MPI.
        _universe: mpi::environment::Universe,
    }

    // One control thread per process drives all communication.
    unsafe impl Send for MpiInner {}
    unsafe impl Sync for MpiInner {}

    /// MPI world communicator.
    #[derive(Clone)]
    pub struct MpiComm {
        inner: Arc<MpiInner>,
    }

    impl MpiComm {
        /// Initialize MPI and wrap the world communicator.
        pub fn new() -> Result<Self, DistError> {
            let universe = mpi::initialize()
                .ok_or_else(|| DistError::comm(0, "MPI was already initialized"))?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                inner: Arc::new(MpiInner {
                    world,
                    rank,
                    size,
                    tags: Arc::new(TagCounter::default()),
                    _universe: universe,
                }),
            })
        }
    }

    /// Outstanding MPI request plus the heap buffer it borrows.
    pub struct MpiHandle {
        waiter: Option<Box<dyn FnOnce()>>,
        buf: *mut [u8],
        is_recv: bool,
    }

    impl Wait for MpiHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(w) = self.waiter.take() {
                w();
            }
            // SAFETY: `buf` came from `Box::leak` and the request borrowing it
            // has completed above.
            let owned = unsafe { Box::from_raw(self.buf) };
            if self.is_recv { Some(owned.into_vec()) } else { None }
        }
    }

    impl super::Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            let shared: &'static [u8] = leaked;
            let req = self
                .inner
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, shared, tag as i32);
            MpiHandle {
                waiter: Some(Box::new(move || {
                    req.wait();
                })),
                buf: ptr,
                is_recv: false,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> MpiHandle {
            let leaked: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            let req = self
                .inner
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, leaked, tag as i32);
            MpiHandle {
                waiter: Some(Box::new(move || {
                    req.wait();
                })),
                buf: ptr,
                is_recv: true,
            }
        }

        fn rank(&self) -> usize {
            self.inner.rank
        }

        fn size(&self) -> usize {
            self.inner.size
        }

        fn reserve_tags(&self, count: u16) -> Result<TagLease, DistError> {
            self.inner.tags.lease(count)
        }

        fn barrier(&self) -> Result<(), DistError> {
            self.inner.world.barrier();
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_roundtrip_two_ranks() {
        let world = ThreadComm::world(2);
        let recv_handle = world[1].irecv(0, 7, 4);
        world[0].isend(1, 7, &[1, 2, 3, 4]).wait();
        let data = recv_handle
            .wait()
            .expect("Expected to receive data from rank 0");
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn worlds_are_isolated() {
        let a = ThreadComm::world(2);
        let b = ThreadComm::world(2);
        a[0].isend(1, 3, &[1]);
        b[0].isend(1, 3, &[2]);
        assert_eq!(b[1].irecv(0, 3, 1).wait(), Some(vec![2]));
        assert_eq!(a[1].irecv(0, 3, 1).wait(), Some(vec![1]));
    }

    #[test]
    fn tag_counter_hands_out_disjoint_blocks() {
        let c = TagCounter::default();
        let a = c.reserve(4).unwrap();
        let b = c.reserve(2).unwrap();
        assert_eq!(a, CommTag(FIRST_USER_TAG));
        assert_eq!(b, CommTag(FIRST_USER_TAG + 4));
        assert_eq!(c.in_use(), 6);
    }

    #[test]
    fn tag_counter_reports_exhaustion_instead_of_wrapping() {
        let c = TagCounter::default();
        let span = RESERVED_TAG_BASE - FIRST_USER_TAG;
        c.reserve(span - 1).unwrap();
        assert!(matches!(
            c.reserve(8),
            Err(DistError::TagsExhausted {
                requested: 8,
                available: 1
            })
        ));
        assert_eq!(c.reserve(1).unwrap(), CommTag(RESERVED_TAG_BASE - 1));
    }

    #[test]
    fn released_blocks_are_reused_lowest_first() {
        let c = TagCounter::default();
        let a = c.reserve(6).unwrap();
        let b = c.reserve(2).unwrap();
        let d = c.reserve(6).unwrap();
        c.release(a, 6);
        c.release(b, 2);
        // a and b coalesce into one 8-tag block at the bottom
        assert_eq!(c.reserve(7).unwrap(), a);
        assert_eq!(c.reserve(1).unwrap(), a.offset(7));
        c.release(d, 6);
        assert_eq!(c.in_use(), 8);
    }

    #[test]
    fn dropped_leases_return_their_tags() {
        let c = Arc::new(TagCounter::default());
        let span = usize::from(RESERVED_TAG_BASE - FIRST_USER_TAG);
        for _ in 0..2 * span {
            let lease = c.lease(6).unwrap();
            assert_eq!(lease.base(), CommTag(FIRST_USER_TAG));
        }
        assert_eq!(c.in_use(), 0);
    }

    #[test]
    fn nocomm_allgather_copies_local() {
        let mut out = [0u8; 3];
        NoComm.allgather(&[4, 5, 6], &mut out).unwrap();
        assert_eq!(out, [4, 5, 6]);
    }

    #[test]
    fn exchange_tags_are_consecutive() {
        let t = ExchangeTags::from_base(CommTag::new(0x200));
        assert_eq!(t.sizes.as_u16(), 0x200);
        assert_eq!(t.data.as_u16(), 0x201);
    }
}
