//! Row-partitioned sparse matrix with diagonal and off-diagonal blocks.
//!
//! Each rank owns a contiguous (or explicit) set of rows. Within its rows,
//! entries whose column is owned by the same rank in the column layout go to
//! the *diagonal* block, indexed by local column offset; all others go to the
//! *off-diagonal* block, indexed by global column. At assembly end the
//! off-diagonal columns are compacted into a sorted column map (`garray`)
//! and a scatter plan gathering those columns of `x` is built. The plan is
//! rebuilt only when some rank's column map changed.

use crate::algs::communicator::Communicator;
use crate::assembly::protocol::{Assembler, AssemblyState};
use crate::assembly::stash::MatEntry;
use crate::data::combine::{CombineMode, Scalar};
use crate::data::index_set::IndexSet;
use crate::data::layout::{Layout, LocalSize};
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;
use crate::mat::block::SparseBlock;
use crate::options::MatOptions;
use crate::scatter::{Direction, IndexSpace, ScatterPlan};
use crate::vec::DistVec;
use std::sync::Arc;

/// Distributed AIJ matrix.
pub struct DistMatrix<T: Scalar, C: Communicator + Clone> {
    rows: Arc<Layout>,
    cols: Arc<Layout>,
    rank: usize,
    diag: SparseBlock<T>,
    offdiag: SparseBlock<T>,
    compact: SparseBlock<T>,
    garray: Vec<usize>,
    ghost_plan: Option<ScatterPlan>,
    lvec: Vec<T>,
    structure_locked: bool,
    assembler: Assembler<C, MatEntry<T>>,
}

impl<T: Scalar, C: Communicator + Clone> DistMatrix<T, C> {
    /// Collective: empty matrix over the given row and column layouts.
    pub fn new(comm: C, rows: Arc<Layout>, cols: Arc<Layout>) -> Result<Self, DistError> {
        Self::with_options(comm, rows, cols, MatOptions::default())
    }

    pub fn with_options(
        comm: C,
        rows: Arc<Layout>,
        cols: Arc<Layout>,
        opts: MatOptions,
    ) -> Result<Self, DistError> {
        for layout in [&rows, &cols] {
            if layout.num_ranks() != comm.size() {
                return Err(DistError::InvalidLayout(format!(
                    "layout spans {} ranks, communicator has {}",
                    layout.num_ranks(),
                    comm.size()
                )));
            }
        }
        let rank = comm.rank();
        let n_rows = rows.local_size(rank);
        Ok(Self {
            rows,
            cols,
            rank,
            diag: SparseBlock::new(n_rows),
            offdiag: SparseBlock::new(n_rows),
            compact: SparseBlock::new(n_rows),
            garray: Vec::new(),
            ghost_plan: None,
            lvec: Vec::new(),
            structure_locked: false,
            assembler: Assembler::new(comm, opts.assembly)?,
        })
    }

    /// Collective: build both layouts from local size requests.
    pub fn create(
        comm: C,
        local_rows: LocalSize,
        global_rows: Option<usize>,
        local_cols: LocalSize,
        global_cols: Option<usize>,
    ) -> Result<Self, DistError> {
        let rows = Layout::create(&comm, local_rows, global_rows)?;
        let cols = Layout::create(&comm, local_cols, global_cols)?;
        Self::new(comm, Arc::new(rows), Arc::new(cols))
    }

    pub fn row_layout(&self) -> &Arc<Layout> {
        &self.rows
    }

    pub fn col_layout(&self) -> &Arc<Layout> {
        &self.cols
    }

    pub fn comm(&self) -> &C {
        self.assembler.comm()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn state(&self) -> AssemblyState {
        self.assembler.state()
    }

    /// Stored entries in the diagonal block on this rank.
    pub fn nnz_diag(&self) -> usize {
        self.diag.nnz()
    }

    /// Stored entries in the off-diagonal block on this rank.
    pub fn nnz_offdiag(&self) -> usize {
        self.offdiag.nnz()
    }

    /// Sorted global columns of the off-diagonal block (as of the last assembly).
    pub fn garray(&self) -> &[usize] {
        &self.garray
    }

    fn insert_owned(
        &mut self,
        local_row: usize,
        entry: MatEntry<T>,
        mode: CombineMode,
    ) -> Result<(), DistError> {
        place(
            (&mut self.diag, &mut self.offdiag),
            &self.cols,
            self.rank,
            self.structure_locked,
            local_row,
            entry,
            mode,
        )
    }

    fn skip_zero(&self, value: T, mode: CombineMode) -> bool {
        mode == CombineMode::Add
            && self.assembler.options().ignore_zero_entries
            && value == T::zero()
    }

    /// Combine `value` into `(row, col)`; off-process rows are stashed.
    pub fn set(
        &mut self,
        row: usize,
        col: usize,
        value: T,
        mode: CombineMode,
    ) -> Result<(), DistError> {
        let (owner, local_row) = self.rows.locate(row)?;
        self.cols.locate(col)?;
        self.assembler.check_set("set", mode)?;
        self.assembler.mark_set(mode);
        if self.skip_zero(value, mode) {
            return Ok(());
        }
        let entry = MatEntry { row, col, value };
        if owner == self.rank {
            self.insert_owned(local_row, entry, mode)
        } else {
            self.assembler.stash(owner, entry);
            Ok(())
        }
    }

    /// Combine a dense row-major block: `values[i * cols.len() + j]` goes to
    /// `(rows[i], cols[j])`. Nothing changes on a size or index error.
    pub fn set_values(
        &mut self,
        rows: &[usize],
        cols: &[usize],
        values: &[T],
        mode: CombineMode,
    ) -> Result<(), DistError> {
        if values.len() != rows.len() * cols.len() {
            return Err(DistError::SizeMismatch {
                context: "set_values block",
                expected: rows.len() * cols.len(),
                got: values.len(),
            });
        }
        let located = rows
            .iter()
            .map(|&r| self.rows.locate(r))
            .collect::<Result<Vec<_>, _>>()?;
        for &c in cols {
            self.cols.locate(c)?;
        }
        self.assembler.check_set("set_values", mode)?;
        self.assembler.mark_set(mode);
        for (i, (&row, (owner, local_row))) in rows.iter().zip(located).enumerate() {
            for (j, &col) in cols.iter().enumerate() {
                let value = values[i * cols.len() + j];
                if self.skip_zero(value, mode) {
                    continue;
                }
                let entry = MatEntry { row, col, value };
                if owner == self.rank {
                    self.insert_owned(local_row, entry, mode)?;
                } else {
                    self.assembler.stash(owner, entry);
                }
            }
        }
        Ok(())
    }

    /// Start flushing stashed entries. Never blocks.
    pub fn assembly_begin(&mut self) -> Result<(), DistError> {
        self.assembler.begin()
    }

    /// Finish the flush, then refresh the column map and its scatter plan.
    pub fn assembly_end(&mut self) -> Result<(), DistError> {
        let flushed = self.flush_stash();
        self.complete_assembly(flushed)
    }

    fn flush_stash(&mut self) -> Result<(), DistError> {
        let rows = &self.rows;
        let cols = &self.cols;
        let rank = self.rank;
        let locked = self.structure_locked;
        let diag = &mut self.diag;
        let offdiag = &mut self.offdiag;
        self.assembler.end(|e, mode| {
            let (owner, local_row) = rows.locate(e.row)?;
            if owner != rank {
                return Err(DistError::comm(
                    owner,
                    format!("received entry for row {} owned by rank {owner}", e.row),
                ));
            }
            place((&mut *diag, &mut *offdiag), cols, rank, locked, local_row, e, mode)
        })
    }

    /// Collective tail of every assembly; `flushed` is this rank's outcome so far.
    fn complete_assembly(&mut self, flushed: Result<(), DistError>) -> Result<(), DistError> {
        self.setup_offdiag(flushed)?;
        self.diag.debug_assert_invariants();
        self.offdiag.debug_assert_invariants();
        self.compact.debug_assert_invariants();
        Ok(())
    }

    /// `assembly_begin` followed by `assembly_end`.
    pub fn assemble(&mut self) -> Result<(), DistError> {
        self.assembly_begin()?;
        self.assembly_end()
    }

    fn setup_offdiag(&mut self, flushed: Result<(), DistError>) -> Result<(), DistError> {
        const UNCHANGED: u8 = 0;
        const CHANGED: u8 = 1;
        const FAILED: u8 = 2;

        let garray = self.offdiag.columns();
        let status = match &flushed {
            Err(_) => FAILED,
            Ok(()) if garray != self.garray || self.ghost_plan.is_none() => CHANGED,
            Ok(()) => UNCHANGED,
        };

        // Plan creation is collective: every rank learns whether any rank
        // failed the flush or changed its column map before going further.
        let comm = self.assembler.comm();
        let mut flags = vec![UNCHANGED; comm.size()];
        comm.allgather(&[status], &mut flags)?;
        flushed?;
        if let Some(peer) = flags.iter().position(|&f| f == FAILED) {
            return Err(DistError::comm(peer, "assembly failed on a peer rank"));
        }
        self.compact = self
            .offdiag
            .map_columns(|c| garray.partition_point(|&g| g < c));
        if flags.iter().all(|&f| f == UNCHANGED) {
            self.garray = garray;
            return Ok(());
        }

        let n = garray.len();
        let plan = ScatterPlan::create(
            comm,
            &IndexSpace::Distributed(Arc::clone(&self.cols)),
            &IndexSet::general(garray.clone()),
            &IndexSpace::Local(n),
            &IndexSet::identity(n),
        )?;
        log::debug!(
            "[rank {}] rebuilt off-diagonal scatter for {n} ghost columns",
            self.rank
        );
        self.ghost_plan = Some(plan);
        self.garray = garray;
        self.lvec = vec![T::zero(); n];
        Ok(())
    }

    fn check_vec(
        &self,
        context: &'static str,
        layout: &Arc<Layout>,
        v: &DistVec<T, C>,
    ) -> Result<(), DistError> {
        if v.global_size() != layout.global_size() {
            return Err(DistError::SizeMismatch {
                context,
                expected: layout.global_size(),
                got: v.global_size(),
            });
        }
        if v.local_size() != layout.local_size(self.rank) {
            return Err(DistError::SizeMismatch {
                context,
                expected: layout.local_size(self.rank),
                got: v.local_size(),
            });
        }
        if !Arc::ptr_eq(layout, v.layout()) && !layout.same_partition(v.layout()) {
            return Err(DistError::InvalidLayout(format!(
                "{context}: vector is partitioned differently from the matrix"
            )));
        }
        Ok(())
    }

    /// `y = A x`. Collective.
    ///
    /// The gather of off-process `x` entries overlaps the diagonal product.
    pub fn mult(&mut self, x: &DistVec<T, C>, y: &mut DistVec<T, C>) -> Result<(), DistError> {
        self.check_vec("mult input", &self.cols, x)?;
        self.check_vec("mult output", &self.rows, y)?;
        let plan = assembled_plan(&self.ghost_plan, self.state(), "mult")?;
        let comm = self.assembler.comm();

        let handle = plan.begin(
            comm,
            x.owned_values(),
            &mut self.lvec,
            CombineMode::Insert,
            Direction::Forward,
        )?;
        let yv = y.owned_values_mut();
        yv.fill(T::zero());
        self.diag.mult_add(x.owned_values(), yv);
        plan.end(handle, &mut self.lvec)?;
        self.compact.mult_add(&self.lvec, yv);
        Ok(())
    }

    /// `y = A^T x`. Collective.
    ///
    /// Off-diagonal contributions are computed locally and sent back to the
    /// owners of their columns with a reverse ADD over the same plan.
    pub fn mult_transpose(
        &mut self,
        x: &DistVec<T, C>,
        y: &mut DistVec<T, C>,
    ) -> Result<(), DistError> {
        self.check_vec("mult_transpose input", &self.rows, x)?;
        self.check_vec("mult_transpose output", &self.cols, y)?;
        let plan = assembled_plan(&self.ghost_plan, self.state(), "mult_transpose")?;
        let comm = self.assembler.comm();

        self.lvec.fill(T::zero());
        self.compact.mult_transpose_add(x.owned_values(), &mut self.lvec);
        let yv = y.owned_values_mut();
        yv.fill(T::zero());
        let handle = plan.begin(comm, &self.lvec, yv, CombineMode::Add, Direction::Reverse)?;
        self.diag.mult_transpose_add(x.owned_values(), yv);
        plan.end(handle, yv)
    }

    /// Value at `(row, col)` for a row owned by this rank (zero if not stored).
    pub fn get(&self, row: usize, col: usize) -> Result<T, DistError> {
        let (owner, local_row) = self.rows.locate(row)?;
        if owner != self.rank {
            return Err(DistError::state(
                "get",
                format!("row {row} is owned by rank {owner}"),
            ));
        }
        let (col_owner, col_off) = self.cols.locate(col)?;
        let v = if col_owner == self.rank {
            self.diag.get(local_row, col_off)
        } else {
            self.offdiag.get(local_row, col)
        };
        Ok(v.unwrap_or_else(T::zero))
    }

    /// Stored entries of an owned row as `(global column, value)`, ascending.
    pub fn owned_row(&self, local_row: usize) -> Result<Vec<(usize, T)>, DistError> {
        if local_row >= self.diag.n_rows() {
            return Err(DistError::IndexOutOfRange {
                index: local_row,
                size: self.diag.n_rows(),
            });
        }
        let mut out = Vec::with_capacity(
            self.diag.row(local_row).len() + self.offdiag.row(local_row).len(),
        );
        for &(off, v) in self.diag.row(local_row) {
            out.push((self.cols.global_index(self.rank, off)?, v));
        }
        out.extend_from_slice(self.offdiag.row(local_row));
        out.sort_unstable_by_key(|&(c, _)| c);
        Ok(out)
    }

    /// Stored entries on this rank (both blocks).
    pub fn nnz_local(&self) -> usize {
        self.diag.nnz() + self.offdiag.nnz()
    }

    /// Values of every stored entry, row by row in ascending global column
    /// order (the order [`Self::owned_row`] reports and
    /// [`Self::update_values`] expects).
    pub fn local_values(&self) -> Result<Vec<T>, DistError> {
        let mut out = Vec::with_capacity(self.nnz_local());
        for lr in 0..self.diag.n_rows() {
            out.extend(self.owned_row(lr)?.into_iter().map(|(_, v)| v));
        }
        Ok(out)
    }

    /// Lock or unlock the sparsity pattern.
    ///
    /// While locked, setting an entry that is not stored yet fails with a
    /// `StateError` (on the owning rank, at `set` or at `assembly_end`).
    pub fn set_structure_locked(&mut self, locked: bool) {
        self.structure_locked = locked;
    }

    pub fn structure_locked(&self) -> bool {
        self.structure_locked
    }

    /// Replace the values of the stored entries, keeping the pattern, the
    /// column map and the ghost plan. Local; `values` follows the order of
    /// [`Self::local_values`].
    pub fn update_values(&mut self, values: &[T]) -> Result<(), DistError> {
        if self.state() != AssemblyState::Assembled {
            return Err(DistError::state("update_values", "matrix is not assembled"));
        }
        if values.len() != self.nnz_local() {
            return Err(DistError::SizeMismatch {
                context: "update_values",
                expected: self.nnz_local(),
                got: values.len(),
            });
        }
        let mut k = 0;
        for lr in 0..self.diag.n_rows() {
            // (global column, in diagonal block, position in its block row)
            let mut slots = Vec::with_capacity(
                self.diag.row(lr).len() + self.offdiag.row(lr).len(),
            );
            for (i, &(off, _)) in self.diag.row(lr).iter().enumerate() {
                slots.push((self.cols.global_index(self.rank, off)?, true, i));
            }
            for (i, &(c, _)) in self.offdiag.row(lr).iter().enumerate() {
                slots.push((c, false, i));
            }
            slots.sort_unstable_by_key(|&(c, _, _)| c);
            for (_, in_diag, i) in slots {
                let block = if in_diag {
                    &mut self.diag
                } else {
                    &mut self.offdiag
                };
                block.row_mut(lr)[i].1 = values[k];
                k += 1;
            }
        }
        let garray = &self.garray;
        self.compact = self
            .offdiag
            .map_columns(|c| garray.partition_point(|&g| g < c));
        Ok(())
    }

    /// Collective: a copy of this matrix over new row and column layouts.
    ///
    /// Every stored entry travels to the owner of its row in `rows` through
    /// the ordinary assembly protocol. With [`Layout::consolidate`] this
    /// gathers the rows of each rank group onto the group's first rank.
    pub fn redistribute(&self, rows: Arc<Layout>, cols: Arc<Layout>) -> Result<Self, DistError> {
        self.check_redistribution("redistribute", &rows, &cols)?;
        let mut assembly = self.assembler.options().clone();
        assembly.ignore_off_process_entries = false;
        let opts = MatOptions { assembly };
        let mut target = Self::with_options(self.comm().clone(), rows, cols, opts)?;
        self.send_entries(&mut target)?;
        Ok(target)
    }

    /// Collective: overwrite the values of `target`, an earlier
    /// [`Self::redistribute`] result, with this matrix's current values.
    ///
    /// The pattern of `target` is locked during the transfer, so its column
    /// map and ghost plan are kept. An entry missing from that pattern makes
    /// the call fail on every rank.
    pub fn redistribute_into(&self, target: &mut Self) -> Result<(), DistError> {
        self.check_redistribution("redistribute_into", target.row_layout(), target.col_layout())?;
        if target.assembler.options().ignore_off_process_entries {
            return Err(DistError::state(
                "redistribute_into",
                "target drops off-process entries",
            ));
        }
        let was_locked = target.structure_locked;
        target.structure_locked = true;
        let res = self.send_entries(target);
        target.structure_locked = was_locked;
        res
    }

    fn check_redistribution(
        &self,
        operation: &'static str,
        rows: &Layout,
        cols: &Layout,
    ) -> Result<(), DistError> {
        if self.state() != AssemblyState::Assembled {
            return Err(DistError::state(operation, "matrix is not assembled"));
        }
        for (context, mine, theirs) in [
            ("redistributed rows", &self.rows, rows),
            ("redistributed columns", &self.cols, cols),
        ] {
            if mine.global_size() != theirs.global_size() {
                return Err(DistError::SizeMismatch {
                    context,
                    expected: mine.global_size(),
                    got: theirs.global_size(),
                });
            }
        }
        Ok(())
    }

    fn send_entries(&self, target: &mut Self) -> Result<(), DistError> {
        let owned = self.rows.owned_indices(self.rank);
        let mut placed = Ok(());
        'rows: for (lr, &row) in owned.iter().enumerate() {
            for (col, v) in self.owned_row(lr)? {
                if let Err(e) = target.set(row, col, v, CombineMode::Insert) {
                    placed = Err(e);
                    break 'rows;
                }
            }
        }
        // every rank takes part in the assembly, even after a local failure
        target.assembly_begin()?;
        let flushed = target.flush_stash();
        target.complete_assembly(placed.and(flushed))
    }
}

/// Put one entry of owned row `local_row` into the block its column selects.
///
/// With a locked structure only entries already stored may change.
fn place<T: Scalar>(
    (diag, offdiag): (&mut SparseBlock<T>, &mut SparseBlock<T>),
    cols: &Layout,
    rank: usize,
    locked: bool,
    local_row: usize,
    entry: MatEntry<T>,
    mode: CombineMode,
) -> Result<(), DistError> {
    let (col_owner, col_off) = cols.locate(entry.col)?;
    let (block, col) = if col_owner == rank {
        (diag, col_off)
    } else {
        (offdiag, entry.col)
    };
    if !locked {
        block.insert(local_row, col, entry.value, mode);
    } else if !block.update(local_row, col, entry.value, mode) {
        return Err(DistError::state(
            "set",
            format!(
                "entry ({}, {}) is not part of the locked structure",
                entry.row, entry.col
            ),
        ));
    }
    Ok(())
}

fn assembled_plan<'a>(
    plan: &'a Option<ScatterPlan>,
    state: AssemblyState,
    operation: &'static str,
) -> Result<&'a ScatterPlan, DistError> {
    match (state, plan) {
        (AssemblyState::Assembled, Some(p)) => Ok(p),
        _ => Err(DistError::state(operation, "matrix is not assembled")),
    }
}

impl<T: Scalar, C: Communicator + Clone> std::fmt::Debug for DistMatrix<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistMatrix")
            .field("rank", &self.rank)
            .field("rows", &self.rows.global_size())
            .field("cols", &self.cols.global_size())
            .field("nnz_diag", &self.diag.nnz())
            .field("nnz_offdiag", &self.offdiag.nnz())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn serial(n: usize) -> DistMatrix<f64, NoComm> {
        let l = Arc::new(Layout::split(n, 1).unwrap());
        DistMatrix::new(NoComm, Arc::clone(&l), l).unwrap()
    }

    #[test]
    fn serial_entries_are_all_diagonal() {
        let mut m = serial(3);
        m.set_values(&[0, 2], &[0, 1], &[1.0, 2.0, 3.0, 4.0], CombineMode::Insert)
            .unwrap();
        m.assemble().unwrap();
        assert_eq!(m.nnz_diag(), 4);
        assert_eq!(m.nnz_offdiag(), 0);
        assert_eq!(m.get(2, 1).unwrap(), 4.0);
        assert_eq!(m.get(1, 1).unwrap(), 0.0);
        assert!(m.garray().is_empty());
    }

    #[test]
    fn mult_requires_assembly() {
        let mut m = serial(2);
        let l = Arc::clone(m.row_layout());
        let x = DistVec::new(NoComm, Arc::clone(&l)).unwrap();
        let mut y = DistVec::new(NoComm, l).unwrap();
        m.set(0, 0, 1.0, CombineMode::Insert).unwrap();
        assert!(matches!(
            m.mult(&x, &mut y),
            Err(DistError::StateError { operation: "mult", .. })
        ));
    }

    #[test]
    fn serial_mult_and_transpose() {
        let mut m = serial(2);
        m.set_values(&[0, 1], &[0, 1], &[1.0, 2.0, 3.0, 4.0], CombineMode::Insert)
            .unwrap();
        m.assemble().unwrap();
        let l = Arc::clone(m.row_layout());
        let mut x = DistVec::new(NoComm, Arc::clone(&l)).unwrap();
        x.owned_values_mut().copy_from_slice(&[1.0, 1.0]);
        let mut y = DistVec::new(NoComm, l).unwrap();
        m.mult(&x, &mut y).unwrap();
        assert_eq!(y.owned_values(), &[3.0, 7.0]);
        m.mult_transpose(&x, &mut y).unwrap();
        assert_eq!(y.owned_values(), &[4.0, 6.0]);
    }

    #[test]
    fn zero_adds_can_be_ignored() {
        let l = Arc::new(Layout::split(2, 1).unwrap());
        let opts = MatOptions {
            assembly: crate::options::AssemblyOptions {
                ignore_zero_entries: true,
                ..Default::default()
            },
        };
        let mut m = DistMatrix::<f64, _>::with_options(NoComm, Arc::clone(&l), l, opts).unwrap();
        m.set(0, 1, 0.0, CombineMode::Add).unwrap();
        // a skipped zero still fixes the mode of the cycle
        assert!(m.set(1, 1, 0.0, CombineMode::Insert).is_err());
        m.assemble().unwrap();
        assert_eq!(m.nnz_diag(), 0);
    }
}
