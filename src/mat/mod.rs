//! Distributed sparse matrices.

pub mod aij;
pub mod block;

pub use aij::DistMatrix;
pub use block::SparseBlock;
