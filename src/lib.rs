#![cfg_attr(docsrs, feature(doc_cfg))]
//! # dist-assembly
//!
//! Distributed sparse vectors and matrices with deferred off-process
//! assembly, plus the reusable scatter engine that moves values between
//! any two index sets.
//!
//! ## Features
//! - [`Layout`](data::layout::Layout): which rank owns which global entries
//! - [`DistVec`](vec::DistVec): owned values, optional ghost copies and an
//!   insertion buffer flushed by a split `assembly_begin`/`assembly_end`
//! - [`DistMatrix`](mat::DistMatrix): rows split into a diagonal block and an
//!   off-diagonal block, with an overlapped matrix-vector product
//! - [`ScatterPlan`](scatter::ScatterPlan): build once, run forward or
//!   reverse with INSERT or ADD as often as needed
//! - Pluggable communication backends (serial, threads, MPI)
//! - Binary persistence independent of the number of ranks
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! dist-assembly = "0.1"
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! Every operation that communicates is collective: all ranks of the
//! container's communicator must call it, in the same order.

pub mod algs;
pub mod assembly;
pub mod data;
pub mod debug_invariants;
pub mod dist_error;
pub mod io;
pub mod mat;
pub mod options;
pub mod registry;
pub mod scatter;
pub mod vec;

pub use debug_invariants::DebugInvariants;
pub use dist_error::DistError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::assembly::AssemblyState;
    pub use crate::data::combine::{CombineMode, Scalar};
    pub use crate::data::index_set::IndexSet;
    pub use crate::data::layout::{Layout, LocalSize};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::dist_error::DistError;
    pub use crate::mat::DistMatrix;
    pub use crate::options::{AssemblyOptions, MatOptions, VecOptions};
    pub use crate::registry::Registry;
    pub use crate::scatter::{Direction, IndexSpace, ScatterPlan};
    pub use crate::vec::{DistVec, VecRedistribution};
}
