#![forbid(unsafe_code)]

pub mod chunk;

pub use chunk::{CloudChunk, Colors, Normals, Origins, Variances};
