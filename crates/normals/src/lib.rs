#![forbid(unsafe_code)]

pub mod estimate;

pub use estimate::{estimate_chunk_normals, estimate_normals_with_index};
