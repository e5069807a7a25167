//! Insertion buffer and the begin/end assembly protocol.

pub mod protocol;
pub mod stash;

pub use protocol::{Assembler, AssemblyState};
pub use stash::{MatEntry, Stash, StashEntry, VecEntry};
