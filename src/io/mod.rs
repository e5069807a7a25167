//! Persistence of assembled vectors and matrices.
//!
//! Only the big-endian binary format is supported. Every call is collective
//! over the container's communicator.

pub mod binary;

pub use binary::{MAT_CLASSID, VEC_CLASSID, read_mat, read_vec, write_mat, write_vec};
