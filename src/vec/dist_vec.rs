//! Distributed vector: owned values plus optional ghost copies.
//!
//! ```rust
//! use dist_assembly::prelude::*;
//! use std::sync::Arc;
//!
//! let layout = Arc::new(Layout::split(4, 1).unwrap());
//! let mut v = DistVec::<f64, _>::new(NoComm, layout).unwrap();
//! v.set(2, 1.5, CombineMode::Add).unwrap();
//! v.set(2, 1.0, CombineMode::Add).unwrap();
//! v.assembly_begin().unwrap();
//! v.assembly_end().unwrap();
//! assert_eq!(v.owned_values(), &[0.0, 0.0, 2.5, 0.0]);
//! ```

use crate::algs::communicator::Communicator;
use crate::assembly::protocol::{Assembler, AssemblyState};
use crate::assembly::stash::VecEntry;
use crate::data::combine::{CombineMode, Scalar};
use crate::data::ghost_map::GhostMap;
use crate::data::index_set::IndexSet;
use crate::data::layout::{Layout, LocalSize};
use crate::data::local_storage::LocalStorage;
use crate::dist_error::DistError;
use crate::options::VecOptions;
use crate::scatter::{Direction, IndexSpace, ScatterHandle, ScatterPlan};
use std::sync::Arc;

/// A vector partitioned by a [`Layout`], optionally caching ghost values.
pub struct DistVec<T: Scalar, C: Communicator + Clone> {
    layout: Arc<Layout>,
    rank: usize,
    storage: LocalStorage<T>,
    ghosts: GhostMap,
    assembler: Assembler<C, VecEntry<T>>,
    ghost_plan: Option<ScatterPlan>,
}

impl<T: Scalar, C: Communicator + Clone> DistVec<T, C> {
    /// Collective: a vector without ghosts.
    pub fn new(comm: C, layout: Arc<Layout>) -> Result<Self, DistError> {
        Self::with_options(comm, layout, VecOptions::default())
    }

    /// Collective: a vector caching the given remotely owned indices.
    pub fn with_ghosts(
        comm: C,
        layout: Arc<Layout>,
        ghosts: Vec<usize>,
    ) -> Result<Self, DistError> {
        Self::with_options(
            comm,
            layout,
            VecOptions {
                ghosts,
                ..Default::default()
            },
        )
    }

    pub fn with_options(comm: C, layout: Arc<Layout>, opts: VecOptions) -> Result<Self, DistError> {
        if layout.num_ranks() != comm.size() {
            return Err(DistError::InvalidLayout(format!(
                "layout spans {} ranks, communicator has {}",
                layout.num_ranks(),
                comm.size()
            )));
        }
        let rank = comm.rank();
        let ghosts = GhostMap::new(&layout, rank, opts.ghosts)?;
        let storage = LocalStorage::zeroed(layout.local_size(rank), ghosts.len());
        Ok(Self {
            layout,
            rank,
            storage,
            ghosts,
            assembler: Assembler::new(comm, opts.assembly)?,
            ghost_plan: None,
        })
    }

    /// Collective: build the layout from a local size request, then the vector.
    pub fn create(
        comm: C,
        local: LocalSize,
        global_size: Option<usize>,
    ) -> Result<Self, DistError> {
        let layout = Layout::create(&comm, local, global_size)?;
        Self::new(comm, Arc::new(layout))
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn comm(&self) -> &C {
        self.assembler.comm()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn global_size(&self) -> usize {
        self.layout.global_size()
    }

    /// Number of owned entries on this rank.
    pub fn local_size(&self) -> usize {
        self.storage.n_owned()
    }

    pub fn ghost_indices(&self) -> &[usize] {
        self.ghosts.indices()
    }

    pub fn state(&self) -> AssemblyState {
        self.assembler.state()
    }

    /// Entries waiting for the next assembly.
    pub fn stashed(&self) -> usize {
        self.assembler.stashed()
    }

    /// Combine `value` into global entry `index`.
    ///
    /// Owned entries change immediately; others are stashed until assembly.
    pub fn set(&mut self, index: usize, value: T, mode: CombineMode) -> Result<(), DistError> {
        let (owner, off) = self.layout.locate(index)?;
        self.assembler.check_set("set", mode)?;
        self.assembler.mark_set(mode);
        if owner == self.rank {
            mode.apply(&mut self.storage.owned_mut()[off], value);
        } else {
            self.assembler.stash(owner, VecEntry { index, value });
        }
        Ok(())
    }

    /// Combine `values[i]` into entry `indices[i]`. Nothing changes on error.
    pub fn set_many(
        &mut self,
        indices: &[usize],
        values: &[T],
        mode: CombineMode,
    ) -> Result<(), DistError> {
        if indices.len() != values.len() {
            return Err(DistError::SizeMismatch {
                context: "set_many values",
                expected: indices.len(),
                got: values.len(),
            });
        }
        let located = indices
            .iter()
            .map(|&g| self.layout.locate(g))
            .collect::<Result<Vec<_>, _>>()?;
        self.assembler.check_set("set_many", mode)?;
        self.assembler.mark_set(mode);
        for ((&index, &value), (owner, off)) in indices.iter().zip(values).zip(located) {
            if owner == self.rank {
                mode.apply(&mut self.storage.owned_mut()[off], value);
            } else {
                self.assembler.stash(owner, VecEntry { index, value });
            }
        }
        Ok(())
    }

    /// Start flushing stashed entries to their owners. Never blocks.
    pub fn assembly_begin(&mut self) -> Result<(), DistError> {
        self.assembler.begin()
    }

    /// Finish the flush started by [`Self::assembly_begin`].
    pub fn assembly_end(&mut self) -> Result<(), DistError> {
        let layout = &self.layout;
        let rank = self.rank;
        let owned = self.storage.owned_mut();
        self.assembler.end(|e, mode| {
            let (owner, off) = layout.locate(e.index)?;
            if owner != rank {
                return Err(DistError::comm(
                    owner,
                    format!("received entry {} owned by rank {owner}", e.index),
                ));
            }
            mode.apply(&mut owned[off], e.value);
            Ok(())
        })
    }

    /// `assembly_begin` followed by `assembly_end`.
    pub fn assemble(&mut self) -> Result<(), DistError> {
        self.assembly_begin()?;
        self.assembly_end()
    }

    /// Value of `global` if it is owned or ghosted here.
    pub fn get_local(&self, global: usize) -> Option<T> {
        match self.layout.locate(global) {
            Ok((owner, off)) if owner == self.rank => Some(self.storage.owned()[off]),
            Ok(_) => self
                .ghosts
                .slot_of(global)
                .map(|slot| self.storage.local_form()[slot]),
            Err(_) => None,
        }
    }

    pub fn owned_values(&self) -> &[T] {
        self.storage.owned()
    }

    /// Direct access to owned values, bypassing the insertion buffer.
    pub fn owned_values_mut(&mut self) -> &mut [T] {
        self.storage.owned_mut()
    }

    /// Owned values followed by ghost values.
    pub fn local_form(&self) -> &[T] {
        self.storage.local_form()
    }

    pub fn local_form_mut(&mut self) -> &mut [T] {
        self.storage.local_form_mut()
    }

    /// Set every owned entry to `value`.
    pub fn set_all(&mut self, value: T) -> Result<(), DistError> {
        if self.state() == AssemblyState::BeginIssued {
            return Err(DistError::state(
                "set_all",
                "cannot set values between assembly_begin and assembly_end",
            ));
        }
        self.storage.fill_owned(value);
        Ok(())
    }

    pub fn zero(&mut self) -> Result<(), DistError> {
        self.set_all(T::zero())
    }

    /// Sum of the owned entries on this rank.
    pub fn sum_local(&self) -> T {
        self.storage.owned().iter().fold(T::zero(), |mut acc, &v| {
            acc += v;
            acc
        })
    }

    fn ensure_ghost_plan(&mut self) -> Result<(), DistError> {
        if self.ghost_plan.is_some() {
            return Ok(());
        }
        let mut src = self.layout.owned_indices(self.rank);
        src.extend_from_slice(self.ghosts.indices());
        let n_local = self.storage.len();
        let plan = ScatterPlan::create(
            self.assembler.comm(),
            &IndexSpace::Distributed(Arc::clone(&self.layout)),
            &IndexSet::general(src),
            &IndexSpace::Local(n_local),
            &IndexSet::identity(n_local),
        )?;
        self.ghost_plan = Some(plan);
        Ok(())
    }

    /// Start a ghost update on the local form. Collective.
    ///
    /// `Forward` copies owner values into ghost slots; `Reverse` sends ghost
    /// slots back to their owners. The plan is built on first use.
    pub fn ghost_update_begin(
        &mut self,
        mode: CombineMode,
        direction: Direction,
    ) -> Result<ScatterHandle<C, T>, DistError> {
        if self.state() == AssemblyState::BeginIssued {
            return Err(DistError::state("ghost_update_begin", "assembly in progress"));
        }
        self.ensure_ghost_plan()?;
        let plan = self
            .ghost_plan
            .as_ref()
            .ok_or_else(|| DistError::state("ghost_update_begin", "ghost plan missing"))?;
        plan.begin_in_place(
            self.assembler.comm(),
            self.storage.local_form_mut(),
            mode,
            direction,
        )
    }

    pub fn ghost_update_end(&mut self, handle: ScatterHandle<C, T>) -> Result<(), DistError> {
        let plan = self.ghost_plan.as_ref().ok_or_else(|| {
            DistError::state("ghost_update_end", "no ghost update was begun")
        })?;
        plan.end(handle, self.storage.local_form_mut())
    }

    /// Refresh ghost slots from their owners (forward INSERT).
    pub fn global_to_local(&mut self) -> Result<(), DistError> {
        let h = self.ghost_update_begin(CombineMode::Insert, Direction::Forward)?;
        self.ghost_update_end(h)
    }

    /// Add ghost contributions into their owners (reverse ADD).
    pub fn local_to_global(&mut self) -> Result<(), DistError> {
        let h = self.ghost_update_begin(CombineMode::Add, Direction::Reverse)?;
        self.ghost_update_end(h)
    }
}

impl<T: Scalar, C: Communicator + Clone> std::fmt::Debug for DistVec<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistVec")
            .field("rank", &self.rank)
            .field("global_size", &self.layout.global_size())
            .field("owned", &self.storage.n_owned())
            .field("ghosts", &self.ghosts.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn serial(n: usize) -> DistVec<f64, NoComm> {
        DistVec::new(NoComm, Arc::new(Layout::split(n, 1).unwrap())).unwrap()
    }

    #[test]
    fn insert_overwrites_add_accumulates() {
        let mut v = serial(3);
        v.set(0, 2.0, CombineMode::Insert).unwrap();
        v.set(0, 5.0, CombineMode::Insert).unwrap();
        v.assemble().unwrap();
        v.set_many(&[0, 0, 2], &[1.0, 1.0, 4.0], CombineMode::Add).unwrap();
        v.assemble().unwrap();
        assert_eq!(v.owned_values(), &[7.0, 0.0, 4.0]);
        assert_eq!(v.sum_local(), 11.0);
    }

    #[test]
    fn bad_arguments_leave_vector_untouched() {
        let mut v = serial(3);
        assert!(matches!(
            v.set_many(&[0, 5], &[1.0, 1.0], CombineMode::Add),
            Err(DistError::IndexOutOfRange { index: 5, size: 3 })
        ));
        assert!(matches!(
            v.set_many(&[0, 1], &[1.0], CombineMode::Add),
            Err(DistError::SizeMismatch { .. })
        ));
        assert_eq!(v.owned_values(), &[0.0; 3]);
        assert_eq!(v.state(), AssemblyState::Unassembled);
    }

    #[test]
    fn mixing_modes_needs_an_assembly() {
        let mut v = serial(2);
        v.set(0, 1.0, CombineMode::Add).unwrap();
        assert!(matches!(
            v.set(1, 1.0, CombineMode::Insert),
            Err(DistError::CombineModeConflict { .. })
        ));
        v.assemble().unwrap();
        v.set(1, 1.0, CombineMode::Insert).unwrap();
    }

    #[test]
    fn set_during_begin_is_state_error() {
        let mut v = serial(2);
        v.assembly_begin().unwrap();
        assert!(matches!(
            v.set(0, 1.0, CombineMode::Add),
            Err(DistError::StateError { .. })
        ));
        assert!(v.set_all(1.0).is_err());
        v.assembly_end().unwrap();
    }

    #[test]
    fn get_local_sees_owned_only_without_ghosts() {
        let mut v = serial(2);
        v.set_all(3.0).unwrap();
        assert_eq!(v.get_local(1), Some(3.0));
        assert_eq!(v.get_local(2), None);
    }

    #[test]
    fn layout_must_match_communicator() {
        let layout = Arc::new(Layout::split(4, 2).unwrap());
        assert!(matches!(
            DistVec::<f64, _>::new(NoComm, layout),
            Err(DistError::InvalidLayout(_))
        ));
    }
}
