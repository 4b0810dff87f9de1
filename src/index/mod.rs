//! Trailing index frames: the seekable index (always written) and the
//! optional genomic index that precedes it.

mod genomic;
mod seekable;

pub use genomic::{GenomicEntry, GenomicIndex};
pub use seekable::{SeekTarget, SeekableEntry, SeekableIndex};
