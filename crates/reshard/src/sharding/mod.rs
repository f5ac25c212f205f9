//! How checkpoint tensors are laid out over tensor- and pipeline-parallel ranks.

mod mesh;
mod spec;

pub use mesh::*;
pub use spec::*;
