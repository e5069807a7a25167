//! Fixed, versioned, little-endian wire types for assembly and scatter traffic.

use crate::dist_error::DistError;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Stashed vector entries `(index, value)`.
pub const KIND_VEC_ENTRIES: u16 = 1;
/// Stashed matrix entries `(row, col, value)`.
pub const KIND_MAT_ENTRIES: u16 = 2;

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    /// Combine mode of the sender, see [`crate::data::combine::CombineMode::to_wire`].
    pub mode_le: u16,
    pub reserved_le: u16, // keep zero
}

impl WireHdr {
    pub fn new(kind: u16, mode: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            mode_le: mode.to_le(),
            reserved_le: 0,
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn mode(&self) -> u16 {
        u16::from_le(self.mode_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32, // count of following records
}

impl WireCount {
    /// Fails when `n` does not fit the 32-bit wire field.
    pub fn new(n: usize) -> Result<Self, DistError> {
        let n = u32::try_from(n).map_err(|_| DistError::WireOverflow {
            field: "record count",
            value: n,
        })?;
        Ok(Self { n_le: n.to_le() })
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A global or local index carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireIndex {
    pub idx_le: u64,
}

impl WireIndex {
    pub fn of(idx: usize) -> Self {
        Self {
            idx_le: (idx as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.idx_le) as usize
    }
}

/// Scatter routing request: "send your slot `src_off` to `dst_rank` slot `dst_off`".
/// NOTE: `dst_rank_le` is u32 (never usize) on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireRoute {
    pub src_off_le: u64,
    pub dst_off_le: u64,
    pub dst_rank_le: u32,
    pub _pad: u32, // pad to 8-byte alignment (explicit)
}

impl WireRoute {
    pub const SIZE: usize = 24;
    pub fn new(src_off: usize, dst_rank: usize, dst_off: usize) -> Self {
        Self {
            src_off_le: (src_off as u64).to_le(),
            dst_off_le: (dst_off as u64).to_le(),
            dst_rank_le: (dst_rank as u32).to_le(),
            _pad: 0,
        }
    }
    pub fn decode(&self) -> (usize, usize, usize) {
        (
            u64::from_le(self.src_off_le) as usize,
            u32::from_le(self.dst_rank_le) as usize,
            u64::from_le(self.dst_off_le) as usize,
        )
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireIndex>(), 8);
const_assert_eq!(size_of::<WireRoute>(), WireRoute::SIZE);

// ===== Helpers =============================================================

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode `n` consecutive `R` records from a possibly unaligned byte slice.
pub fn read_records<R: Pod>(bytes: &[u8], n: usize) -> Result<Vec<R>, String> {
    let need = n * size_of::<R>();
    if bytes.len() < need {
        return Err(format!("expected {need} bytes of records, got {}", bytes.len()));
    }
    Ok(bytes[..need]
        .chunks_exact(size_of::<R>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

/// Append a scalar in little-endian byte order.
#[inline]
pub fn put_scalar<T: Pod>(out: &mut Vec<u8>, v: T) {
    let b = bytemuck::bytes_of(&v);
    if cfg!(target_endian = "big") {
        out.extend(b.iter().rev());
    } else {
        out.extend_from_slice(b);
    }
}

/// Read a little-endian scalar from exactly `size_of::<T>()` bytes.
#[inline]
pub fn get_scalar<T: Pod>(chunk: &[u8]) -> T {
    if cfg!(target_endian = "big") {
        let mut tmp = chunk.to_vec();
        tmp.reverse();
        bytemuck::pod_read_unaligned(&tmp)
    } else {
        bytemuck::pod_read_unaligned(chunk)
    }
}

/// Encode a slice of scalars little-endian.
pub fn scalars_to_bytes<T: Pod>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * size_of::<T>());
    for &v in values {
        put_scalar(&mut out, v);
    }
    out
}

/// Decode exactly `bytes.len() / size_of::<T>()` little-endian scalars.
pub fn scalars_from_bytes<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(size_of::<T>()).map(get_scalar).collect()
}
