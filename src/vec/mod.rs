//! Distributed vectors.

pub mod dist_vec;
pub mod redistribute;

pub use dist_vec::DistVec;
pub use redistribute::VecRedistribution;
