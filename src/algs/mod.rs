//! Communication building blocks shared by assembly and scatters.

pub mod communicator;
pub mod size_exchange;
pub mod wire;

pub use communicator::{CommTag, Communicator, NoComm, ThreadComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
