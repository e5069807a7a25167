//! Explicit type registry: type tag → constructor.
//!
//! Build one registry at start-up (usually [`Registry::default`]) and pass
//! it to whatever creates containers. Nothing is registered globally.

use crate::algs::communicator::Communicator;
use crate::data::combine::Scalar;
use crate::data::layout::Layout;
use crate::dist_error::DistError;
use crate::mat::DistMatrix;
use crate::options::{MatOptions, VecOptions};
use crate::vec::DistVec;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type VecCtor<T, C> = fn(C, Arc<Layout>, &VecOptions) -> Result<DistVec<T, C>, DistError>;
pub type MatCtor<T, C> =
    fn(C, Arc<Layout>, Arc<Layout>, &MatOptions) -> Result<DistMatrix<T, C>, DistError>;

/// Vector without ghosts; `opts.ghosts` is ignored.
pub const VEC_STANDARD: &str = "standard";
/// Vector caching `opts.ghosts`.
pub const VEC_GHOSTED: &str = "ghosted";
/// Diagonal/off-diagonal sparse matrix.
pub const MAT_AIJ: &str = "aij";

fn standard_vec<T: Scalar, C: Communicator + Clone>(
    comm: C,
    layout: Arc<Layout>,
    opts: &VecOptions,
) -> Result<DistVec<T, C>, DistError> {
    let opts = VecOptions {
        ghosts: Vec::new(),
        assembly: opts.assembly.clone(),
    };
    DistVec::with_options(comm, layout, opts)
}

fn ghosted_vec<T: Scalar, C: Communicator + Clone>(
    comm: C,
    layout: Arc<Layout>,
    opts: &VecOptions,
) -> Result<DistVec<T, C>, DistError> {
    DistVec::with_options(comm, layout, opts.clone())
}

fn aij_mat<T: Scalar, C: Communicator + Clone>(
    comm: C,
    rows: Arc<Layout>,
    cols: Arc<Layout>,
    opts: &MatOptions,
) -> Result<DistMatrix<T, C>, DistError> {
    DistMatrix::with_options(comm, rows, cols, opts.clone())
}

/// Constructors for vectors and matrices, looked up by tag.
pub struct Registry<T: Scalar, C: Communicator + Clone> {
    vecs: BTreeMap<String, VecCtor<T, C>>,
    mats: BTreeMap<String, MatCtor<T, C>>,
}

impl<T: Scalar, C: Communicator + Clone> Default for Registry<T, C> {
    /// Registry holding the built-in types.
    fn default() -> Self {
        let mut r = Self::empty();
        r.register_vec(VEC_STANDARD, standard_vec::<T, C>);
        r.register_vec(VEC_GHOSTED, ghosted_vec::<T, C>);
        r.register_mat(MAT_AIJ, aij_mat::<T, C>);
        r
    }
}

impl<T: Scalar, C: Communicator + Clone> Registry<T, C> {
    pub fn empty() -> Self {
        Self {
            vecs: BTreeMap::new(),
            mats: BTreeMap::new(),
        }
    }

    /// Register (or replace) a vector type; returns the previous constructor.
    pub fn register_vec(&mut self, tag: impl Into<String>, ctor: VecCtor<T, C>) -> Option<VecCtor<T, C>> {
        self.vecs.insert(tag.into(), ctor)
    }

    /// Register (or replace) a matrix type; returns the previous constructor.
    pub fn register_mat(&mut self, tag: impl Into<String>, ctor: MatCtor<T, C>) -> Option<MatCtor<T, C>> {
        self.mats.insert(tag.into(), ctor)
    }

    pub fn create_vec(
        &self,
        tag: &str,
        comm: C,
        layout: Arc<Layout>,
        opts: &VecOptions,
    ) -> Result<DistVec<T, C>, DistError> {
        let ctor = self
            .vecs
            .get(tag)
            .ok_or_else(|| DistError::UnknownType(tag.to_string()))?;
        ctor(comm, layout, opts)
    }

    pub fn create_mat(
        &self,
        tag: &str,
        comm: C,
        rows: Arc<Layout>,
        cols: Arc<Layout>,
        opts: &MatOptions,
    ) -> Result<DistMatrix<T, C>, DistError> {
        let ctor = self
            .mats
            .get(tag)
            .ok_or_else(|| DistError::UnknownType(tag.to_string()))?;
        ctor(comm, rows, cols, opts)
    }

    /// Registered vector tags, sorted.
    pub fn vec_types(&self) -> impl Iterator<Item = &str> {
        self.vecs.keys().map(String::as_str)
    }

    /// Registered matrix tags, sorted.
    pub fn mat_types(&self) -> impl Iterator<Item = &str> {
        self.mats.keys().map(String::as_str)
    }
}
