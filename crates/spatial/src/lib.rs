#![forbid(unsafe_code)]

pub mod index;
pub mod kdtree;

pub use index::{BruteForceIndex, NeighborIndex};
pub use kdtree::KdTreeIndex;
