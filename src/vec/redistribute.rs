//! Moving vector values between two partitions of the same index range.

use crate::algs::communicator::Communicator;
use crate::assembly::protocol::AssemblyState;
use crate::data::combine::{CombineMode, Scalar};
use crate::data::index_set::IndexSet;
use crate::data::layout::Layout;
use crate::dist_error::DistError;
use crate::scatter::{Direction, IndexSpace, ScatterPlan};
use crate::vec::DistVec;
use std::sync::Arc;

/// A reusable plan mapping every global index of `from` onto the same index
/// of `to`. Built once, run any number of times in either direction.
#[derive(Clone, Debug)]
pub struct VecRedistribution {
    plan: ScatterPlan,
    from: Arc<Layout>,
    to: Arc<Layout>,
}

impl VecRedistribution {
    /// Collective. Both layouts must cover the same number of indices.
    pub fn new<C: Communicator>(
        comm: &C,
        from: Arc<Layout>,
        to: Arc<Layout>,
    ) -> Result<Self, DistError> {
        if from.global_size() != to.global_size() {
            return Err(DistError::SizeMismatch {
                context: "redistribution layouts",
                expected: from.global_size(),
                got: to.global_size(),
            });
        }
        // each rank pairs the indices it owns in `from` with themselves
        let owned = IndexSet::general(from.owned_indices(comm.rank()));
        let plan = ScatterPlan::create(
            comm,
            &IndexSpace::Distributed(Arc::clone(&from)),
            &owned,
            &IndexSpace::Distributed(Arc::clone(&to)),
            &owned,
        )?;
        Ok(Self { plan, from, to })
    }

    pub fn from_layout(&self) -> &Arc<Layout> {
        &self.from
    }

    pub fn to_layout(&self) -> &Arc<Layout> {
        &self.to
    }

    pub fn plan(&self) -> &ScatterPlan {
        &self.plan
    }

    /// Copy `x` (partitioned by `from`) into `y` (partitioned by `to`).
    pub fn forward<T: Scalar, C: Communicator + Clone>(
        &self,
        x: &DistVec<T, C>,
        y: &mut DistVec<T, C>,
    ) -> Result<(), DistError> {
        self.run(x, &self.from, y, &self.to, Direction::Forward)
    }

    /// Copy `y` (partitioned by `to`) back into `x` (partitioned by `from`).
    pub fn reverse<T: Scalar, C: Communicator + Clone>(
        &self,
        y: &DistVec<T, C>,
        x: &mut DistVec<T, C>,
    ) -> Result<(), DistError> {
        self.run(y, &self.to, x, &self.from, Direction::Reverse)
    }

    fn run<T: Scalar, C: Communicator + Clone>(
        &self,
        src: &DistVec<T, C>,
        src_layout: &Arc<Layout>,
        dst: &mut DistVec<T, C>,
        dst_layout: &Arc<Layout>,
        direction: Direction,
    ) -> Result<(), DistError> {
        for (context, v, layout) in [
            ("redistribution source", &*src, src_layout),
            ("redistribution target", &*dst, dst_layout),
        ] {
            if v.state() == AssemblyState::BeginIssued {
                return Err(DistError::state(context, "assembly in progress"));
            }
            if !Arc::ptr_eq(v.layout(), layout) && !v.layout().same_partition(layout) {
                return Err(DistError::InvalidLayout(format!(
                    "{context}: vector is partitioned differently from the plan"
                )));
            }
        }
        let comm = src.comm();
        let handle = self.plan.begin(
            comm,
            src.owned_values(),
            dst.owned_values_mut(),
            CombineMode::Insert,
            direction,
        )?;
        self.plan.end(handle, dst.owned_values_mut())
    }
}
