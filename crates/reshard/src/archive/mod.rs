//! On-disk checkpoint archives.
//!
//! An archive is a directory holding `manifest.json` and one blob per shard. Blobs hold
//! raw little-endian tensor bytes in manifest order, each tensor aligned to its element
//! size.

mod lock;
mod manifest;
mod reader;
mod writer;

pub use lock::OutputGuard;
pub use manifest::*;
pub use reader::ArchiveReader;
pub use writer::{ArchiveWriter, write_checkpoint};
