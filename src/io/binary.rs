//! Big-endian binary files for vectors and matrices.
//!
//! Layouts (every integer a big-endian `i32`, values big-endian `T`):
//!
//! ```text
//! vector: VEC_CLASSID  N  v[0] .. v[N-1]
//! matrix: MAT_CLASSID  M  N  nz  len[0] .. len[M-1]  col[0] .. col[nz-1]  val[0] .. val[nz-1]
//! ```
//!
//! Matrix rows are stored in order with columns ascending inside each row.
//! Writing gathers everything to rank 0, which alone touches the writer.
//! Reading parses on rank 0, broadcasts the dimensions (or the parse error)
//! and then assembles into a balanced layout, so a file written from any
//! number of ranks can be read back on any other number.

use crate::algs::communicator::Communicator;
use crate::algs::size_exchange::exchange_all;
use crate::algs::wire::{WireIndex, read_records, scalars_from_bytes, scalars_to_bytes};
use crate::data::combine::{CombineMode, Scalar};
use crate::data::layout::Layout;
use crate::dist_error::DistError;
use crate::mat::DistMatrix;
use crate::vec::DistVec;
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};
use std::mem::size_of;
use std::sync::Arc;

pub const VEC_CLASSID: i32 = 1_211_214;
pub const MAT_CLASSID: i32 = 1_211_216;

const ROOT: usize = 0;
const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

fn format_err(msg: impl Into<String>) -> DistError {
    DistError::Format(msg.into())
}

fn to_i32(v: usize, what: &str) -> Result<i32, DistError> {
    i32::try_from(v).map_err(|_| format_err(format!("{what} {v} does not fit the 32-bit file format")))
}

fn put_be<T: Scalar>(buf: &mut BytesMut, v: T) {
    let b = bytemuck::bytes_of(&v);
    if cfg!(target_endian = "little") {
        buf.extend(b.iter().rev());
    } else {
        buf.put_slice(b);
    }
}

fn get_be<T: Scalar>(buf: &mut &[u8]) -> T {
    let mut tmp = vec![0u8; size_of::<T>()];
    buf.copy_to_slice(&mut tmp);
    if cfg!(target_endian = "little") {
        tmp.reverse();
    }
    bytemuck::pod_read_unaligned(&tmp)
}

fn take_i32(buf: &mut &[u8], what: &str) -> Result<i32, DistError> {
    if buf.remaining() < 4 {
        return Err(format_err(format!("file truncated before {what}")));
    }
    Ok(buf.get_i32())
}

fn take_len(buf: &mut &[u8], what: &str) -> Result<usize, DistError> {
    let v = take_i32(buf, what)?;
    usize::try_from(v).map_err(|_| format_err(format!("negative {what} {v}")))
}

/// Share rank 0's parse outcome: every rank gets the dimensions or the error.
///
/// Rank 0 passes `Err(message)` when parsing failed; other ranks' `local` is
/// ignored.
fn share_status<C: Communicator>(
    comm: &C,
    local: Result<Vec<usize>, String>,
) -> Result<Vec<usize>, DistError> {
    let mut msg = Vec::new();
    if comm.rank() == ROOT {
        match &local {
            Ok(dims) => {
                msg.push(STATUS_OK);
                for &d in dims {
                    msg.extend_from_slice(bytemuck::bytes_of(&WireIndex::of(d)));
                }
            }
            Err(text) => {
                msg.push(STATUS_ERR);
                msg.extend_from_slice(text.as_bytes());
            }
        }
    }
    let shared = comm.broadcast(ROOT, &msg)?;
    if comm.rank() == ROOT {
        return local.map_err(format_err);
    }
    match shared.split_first() {
        Some((&STATUS_OK, rest)) => {
            let dims: Vec<WireIndex> =
                read_records(rest, rest.len() / size_of::<WireIndex>()).map_err(format_err)?;
            Ok(dims.iter().map(WireIndex::get).collect())
        }
        Some((_, rest)) => Err(format_err(String::from_utf8_lossy(rest).into_owned())),
        None => Err(DistError::comm(ROOT, "empty status broadcast")),
    }
}

fn status_text(e: &DistError) -> String {
    match e {
        DistError::Format(m) => m.clone(),
        other => other.to_string(),
    }
}

fn read_all<R: Read>(input: &mut R) -> Result<Vec<u8>, DistError> {
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;
    Ok(data)
}

// ===== Vectors ==============================================================

/// Write `v` to `out`. Collective; only rank 0 writes.
pub fn write_vec<T, C, W>(v: &DistVec<T, C>, out: &mut W) -> Result<(), DistError>
where
    T: Scalar,
    C: Communicator + Clone,
    W: Write,
{
    let comm = v.comm();
    let layout = v.layout();
    let n = to_i32(layout.global_size(), "vector size")?;
    let tags = comm.reserve_tags(2)?;
    let tag = tags.base();
    let owned = layout.owned_indices(comm.rank());

    let mut outgoing = Vec::new();
    if comm.rank() != ROOT && !owned.is_empty() {
        let idx: Vec<WireIndex> = owned.iter().map(|&g| WireIndex::of(g)).collect();
        let mut bytes = bytemuck::cast_slice(&idx).to_vec();
        bytes.extend(scalars_to_bytes(v.owned_values()));
        outgoing.push((ROOT, bytes.len(), bytes));
    }
    let received = exchange_all(comm, tag, outgoing, |n| n)?;
    if comm.rank() != ROOT {
        return Ok(());
    }

    let mut full = vec![T::zero(); layout.global_size()];
    for (&g, &x) in owned.iter().zip(v.owned_values()) {
        full[g] = x;
    }
    let rec = size_of::<WireIndex>() + size_of::<T>();
    for (peer, len, bytes) in received {
        let count = len / rec;
        let idx: Vec<WireIndex> = read_records(&bytes, count).map_err(|e| DistError::comm(peer, e))?;
        let vals: Vec<T> = scalars_from_bytes(&bytes[count * size_of::<WireIndex>()..]);
        for (i, x) in idx.iter().zip(vals) {
            let g = i.get();
            if g >= full.len() {
                return Err(DistError::comm(peer, format!("gathered index {g} out of range")));
            }
            full[g] = x;
        }
    }

    let mut buf = BytesMut::with_capacity(8 + full.len() * size_of::<T>());
    buf.put_i32(VEC_CLASSID);
    buf.put_i32(n);
    for x in full {
        put_be(&mut buf, x);
    }
    out.write_all(&buf)?;
    log::debug!("wrote vector of {} entries", layout.global_size());
    Ok(())
}

fn parse_vec<T: Scalar>(data: &[u8]) -> Result<Vec<T>, DistError> {
    let mut buf = data;
    let classid = take_i32(&mut buf, "class id")?;
    if classid != VEC_CLASSID {
        return Err(format_err(format!("class id {classid} is not a vector")));
    }
    let n = take_len(&mut buf, "vector size")?;
    if buf.remaining() < n * size_of::<T>() {
        return Err(format_err(format!(
            "vector of {n} entries needs {} value bytes, found {}",
            n * size_of::<T>(),
            buf.remaining()
        )));
    }
    Ok((0..n).map(|_| get_be(&mut buf)).collect())
}

/// Read a vector written by [`write_vec`]. Collective; only rank 0 reads
/// `input`, other ranks may pass [`std::io::empty`].
pub fn read_vec<T, C, R>(comm: C, input: &mut R) -> Result<DistVec<T, C>, DistError>
where
    T: Scalar,
    C: Communicator + Clone,
    R: Read,
{
    let parsed = if comm.rank() == ROOT {
        read_all(input).and_then(|d| parse_vec::<T>(&d))
    } else {
        Ok(Vec::new())
    };
    let local = parsed.as_ref().map(|v| vec![v.len()]).map_err(status_text);
    let dims = match share_status(&comm, local) {
        Ok(d) => d,
        Err(e) => return Err(parsed.err().unwrap_or(e)),
    };
    let [n] = dims[..] else {
        return Err(format_err("malformed vector dimensions"));
    };
    let values = parsed?;

    let layout = Arc::new(Layout::split(n, comm.size())?);
    let mut v = DistVec::new(comm, layout)?;
    if v.rank() == ROOT {
        let indices: Vec<usize> = (0..n).collect();
        v.set_many(&indices, &values, CombineMode::Insert)?;
    }
    v.assemble()?;
    Ok(v)
}

// ===== Matrices =============================================================

/// Write `m` to `out`. Collective; `m` must be assembled.
pub fn write_mat<T, C, W>(m: &DistMatrix<T, C>, out: &mut W) -> Result<(), DistError>
where
    T: Scalar,
    C: Communicator + Clone,
    W: Write,
{
    if m.state() != crate::assembly::AssemblyState::Assembled {
        return Err(DistError::state("write_mat", "matrix is not assembled"));
    }
    let comm = m.comm();
    let rows = m.row_layout();
    let n_rows = to_i32(rows.global_size(), "row count")?;
    let n_cols = to_i32(m.col_layout().global_size(), "column count")?;
    let tags = comm.reserve_tags(2)?;
    let tag = tags.base();
    let owned = rows.owned_indices(comm.rank());

    let mut local_rows = Vec::with_capacity(owned.len());
    for (lr, &g) in owned.iter().enumerate() {
        local_rows.push((g, m.owned_row(lr)?));
    }

    let mut outgoing = Vec::new();
    if comm.rank() != ROOT && !local_rows.is_empty() {
        let bytes = encode_rows(&local_rows);
        outgoing.push((ROOT, bytes.len(), bytes));
    }
    let received = exchange_all(comm, tag, outgoing, |n| n)?;
    if comm.rank() != ROOT {
        return Ok(());
    }

    let mut all: Vec<Vec<(usize, T)>> = vec![Vec::new(); rows.global_size()];
    for (g, r) in local_rows {
        all[g] = r;
    }
    for (peer, _, bytes) in received {
        for (g, r) in decode_rows::<T>(&bytes).map_err(|e| DistError::comm(peer, e))? {
            let slot = all
                .get_mut(g)
                .ok_or_else(|| DistError::comm(peer, format!("gathered row {g} out of range")))?;
            *slot = r;
        }
    }

    let nz: usize = all.iter().map(Vec::len).sum();
    let nz_i32 = to_i32(nz, "nonzero count")?;
    let mut buf = BytesMut::with_capacity(16 + 4 * (all.len() + nz) + nz * size_of::<T>());
    buf.put_i32(MAT_CLASSID);
    buf.put_i32(n_rows);
    buf.put_i32(n_cols);
    buf.put_i32(nz_i32);
    for r in &all {
        buf.put_i32(to_i32(r.len(), "row length")?);
    }
    for &(c, _) in all.iter().flatten() {
        buf.put_i32(to_i32(c, "column index")?);
    }
    for &(_, x) in all.iter().flatten() {
        put_be(&mut buf, x);
    }
    out.write_all(&buf)?;
    log::debug!(
        "wrote {}x{} matrix with {nz} stored entries",
        rows.global_size(),
        m.col_layout().global_size()
    );
    Ok(())
}

/// `[n_rows][nnz] ([row][len])* col* val*`, integers as [`WireIndex`].
fn encode_rows<T: Scalar>(rows: &[(usize, Vec<(usize, T)>)]) -> Vec<u8> {
    let nnz: usize = rows.iter().map(|(_, r)| r.len()).sum();
    let mut idx = vec![WireIndex::of(rows.len()), WireIndex::of(nnz)];
    for (g, r) in rows {
        idx.push(WireIndex::of(*g));
        idx.push(WireIndex::of(r.len()));
    }
    idx.extend(rows.iter().flat_map(|(_, r)| r.iter().map(|&(c, _)| WireIndex::of(c))));
    let vals: Vec<T> = rows.iter().flat_map(|(_, r)| r.iter().map(|&(_, v)| v)).collect();
    let mut bytes = bytemuck::cast_slice(&idx).to_vec();
    bytes.extend(scalars_to_bytes(&vals));
    bytes
}

type Rows<T> = Vec<(usize, Vec<(usize, T)>)>;

fn decode_rows<T: Scalar>(bytes: &[u8]) -> Result<Rows<T>, String> {
    let w = size_of::<WireIndex>();
    let head: Vec<WireIndex> = read_records(bytes, 2)?;
    let (n_rows, nnz) = (head[0].get(), head[1].get());
    let n_idx = 2 + 2 * n_rows + nnz;
    let idx: Vec<WireIndex> = read_records(bytes, n_idx)?;
    let vals_bytes = &bytes[n_idx * w..];
    if vals_bytes.len() != nnz * size_of::<T>() {
        return Err(format!(
            "expected {} value bytes, got {}",
            nnz * size_of::<T>(),
            vals_bytes.len()
        ));
    }
    let vals: Vec<T> = scalars_from_bytes(vals_bytes);
    let mut cols = idx[2 + 2 * n_rows..].iter().map(WireIndex::get).zip(vals);
    let mut out = Vec::with_capacity(n_rows);
    for pair in idx[2..2 + 2 * n_rows].chunks_exact(2) {
        let (g, len) = (pair[0].get(), pair[1].get());
        let row: Vec<(usize, T)> = cols.by_ref().take(len).collect();
        if row.len() != len {
            return Err(format!("row {g} claims {len} entries beyond the payload"));
        }
        out.push((g, row));
    }
    Ok(out)
}

struct MatImage<T> {
    n_rows: usize,
    n_cols: usize,
    row_lens: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<T>,
}

fn parse_mat<T: Scalar>(data: &[u8]) -> Result<MatImage<T>, DistError> {
    let mut buf = data;
    let classid = take_i32(&mut buf, "class id")?;
    if classid != MAT_CLASSID {
        return Err(format_err(format!("class id {classid} is not a matrix")));
    }
    let n_rows = take_len(&mut buf, "row count")?;
    let n_cols = take_len(&mut buf, "column count")?;
    let nz = take_len(&mut buf, "nonzero count")?;
    let need = 4 * (n_rows + nz) + nz * size_of::<T>();
    if buf.remaining() < need {
        return Err(format_err(format!(
            "matrix body needs {need} bytes, found {}",
            buf.remaining()
        )));
    }
    let row_lens = (0..n_rows)
        .map(|_| take_len(&mut buf, "row length"))
        .collect::<Result<Vec<_>, _>>()?;
    let total: usize = row_lens.iter().sum();
    if total != nz {
        return Err(format_err(format!("row lengths sum to {total}, header says {nz}")));
    }
    let cols = (0..nz)
        .map(|_| take_len(&mut buf, "column index"))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(&c) = cols.iter().find(|&&c| c >= n_cols) {
        return Err(format_err(format!("column index {c} out of range for {n_cols} columns")));
    }
    let vals = (0..nz).map(|_| get_be(&mut buf)).collect();
    Ok(MatImage {
        n_rows,
        n_cols,
        row_lens,
        cols,
        vals,
    })
}

/// Read a matrix written by [`write_mat`]. Collective; only rank 0 reads
/// `input`. Rows and columns get balanced layouts.
pub fn read_mat<T, C, R>(comm: C, input: &mut R) -> Result<DistMatrix<T, C>, DistError>
where
    T: Scalar,
    C: Communicator + Clone,
    R: Read,
{
    let parsed = if comm.rank() == ROOT {
        read_all(input).and_then(|d| parse_mat::<T>(&d)).map(Some)
    } else {
        Ok(None)
    };
    let local_dims = match &parsed {
        Ok(Some(img)) => Ok(vec![img.n_rows, img.n_cols]),
        Ok(None) => Ok(Vec::new()),
        Err(e) => Err(status_text(e)),
    };
    let dims = match share_status(&comm, local_dims) {
        Ok(d) => d,
        Err(e) => return Err(parsed.err().unwrap_or(e)),
    };
    let [n_rows, n_cols] = dims[..] else {
        return Err(format_err("malformed matrix dimensions"));
    };
    let image = parsed?;

    let rows = Arc::new(Layout::split(n_rows, comm.size())?);
    let cols = Arc::new(Layout::split(n_cols, comm.size())?);
    let mut m = DistMatrix::new(comm, rows, cols)?;
    if let Some(img) = image {
        let mut entries = img.cols.into_iter().zip(img.vals);
        for (row, &len) in img.row_lens.iter().enumerate() {
            for (col, v) in entries.by_ref().take(len) {
                m.set(row, col, v, CombineMode::Insert)?;
            }
        }
    }
    m.assemble()?;
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn vector_file_is_big_endian() {
        let layout = Arc::new(Layout::split(2, 1).unwrap());
        let mut v = DistVec::<f64, NoComm>::new(NoComm, layout).unwrap();
        v.owned_values_mut().copy_from_slice(&[1.0, -2.5]);
        let mut out = Vec::new();
        write_vec(&v, &mut out).unwrap();
        assert_eq!(&out[..4], &VEC_CLASSID.to_be_bytes());
        assert_eq!(&out[4..8], &2i32.to_be_bytes());
        assert_eq!(&out[8..16], &1.0f64.to_be_bytes());
        assert_eq!(&out[16..24], &(-2.5f64).to_be_bytes());

        let back: DistVec<f64, NoComm> = read_vec(NoComm, &mut out.as_slice()).unwrap();
        assert_eq!(back.owned_values(), &[1.0, -2.5]);
    }

    #[test]
    fn matrix_file_layout() {
        let layout = Arc::new(Layout::split(3, 1).unwrap());
        let mut m = DistMatrix::<f64, NoComm>::new(NoComm, layout.clone(), layout).unwrap();
        m.set(0, 2, 5.0, CombineMode::Insert).unwrap();
        m.set(0, 0, 1.0, CombineMode::Insert).unwrap();
        m.set(2, 1, 7.0, CombineMode::Insert).unwrap();
        m.assemble().unwrap();
        let mut out = Vec::new();
        write_mat(&m, &mut out).unwrap();

        let ints: Vec<i32> = out[..4 * 9]
            .chunks_exact(4)
            .map(|c| i32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        // classid, M, N, nz, row lengths, columns
        assert_eq!(ints, vec![MAT_CLASSID, 3, 3, 3, 2, 0, 1, 0, 2]);
        let tail: Vec<f64> = out[4 * 10..]
            .chunks_exact(8)
            .map(|c| f64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(&out[36..40], &1i32.to_be_bytes());
        assert_eq!(tail, vec![1.0, 5.0, 7.0]);

        let back: DistMatrix<f64, NoComm> = read_mat(NoComm, &mut out.as_slice()).unwrap();
        assert_eq!(back.get(0, 2).unwrap(), 5.0);
        assert_eq!(back.get(2, 1).unwrap(), 7.0);
        assert_eq!(back.get(1, 1).unwrap(), 0.0);
    }

    #[test]
    fn wrong_class_id_is_a_format_error() {
        let mut data = Vec::new();
        data.extend_from_slice(&MAT_CLASSID.to_be_bytes());
        data.extend_from_slice(&0i32.to_be_bytes());
        let err = read_vec::<f64, _, _>(NoComm, &mut data.as_slice()).unwrap_err();
        assert!(matches!(err, DistError::Format(_)));
    }

    #[test]
    fn truncated_values_are_a_format_error() {
        let mut data = Vec::new();
        data.extend_from_slice(&VEC_CLASSID.to_be_bytes());
        data.extend_from_slice(&4i32.to_be_bytes());
        data.extend_from_slice(&1.0f64.to_be_bytes());
        let err = read_vec::<f64, _, _>(NoComm, &mut data.as_slice()).unwrap_err();
        assert!(matches!(err, DistError::Format(_)));
    }

    #[test]
    fn inconsistent_row_lengths_are_rejected() {
        let mut data = Vec::new();
        for v in [MAT_CLASSID, 1, 1, 2, 1, 0, 0] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        data.extend_from_slice(&[0u8; 16]);
        let err = read_mat::<f64, _, _>(NoComm, &mut data.as_slice()).unwrap_err();
        assert!(matches!(err, DistError::Format(_)));
    }
}
