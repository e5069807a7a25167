//! Data model: layouts, ghost maps, index sets and local storage.

pub mod combine;
pub mod ghost_map;
pub mod index_set;
pub mod layout;
pub mod local_storage;

pub use combine::{CombineMode, Scalar};
pub use ghost_map::GhostMap;
pub use index_set::IndexSet;
pub use layout::{Layout, LocalSize};
pub use local_storage::LocalStorage;
