//! Reassembly of files (mostly images) downlinked as numbered blocks.
//!
//! A file group is split into lines and each line into blocks. Block 0 of a
//! line carries [`FileMetadata`](crate::codec::FileMetadata); blocks `1..=n`
//! carry data. Blocks arrive out of order, duplicated or with corrupted
//! headers, so counts and IDs are settled by majority vote across blocks.

mod assembler;
mod export;
mod group;
mod line;

pub use assembler::{FileBlockAssembler, TAKEN_MEMORY};
pub use export::{ExportedFiles, ImageWriter, debayer_rggb};
pub use group::{AssembledFile, FileGroup};
pub use line::LineAssembly;

/// Most common value, ties going to the first seen, and whether every
/// value agreed.
pub(crate) fn majority<T: PartialEq + Copy>(values: impl IntoIterator<Item = T>) -> Option<(T, bool)> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for v in values {
        match counts.iter_mut().find(|(seen, _)| *seen == v) {
            Some((_, n)) => *n += 1,
            None => counts.push((v, 1)),
        }
    }
    let unanimous = counts.len() == 1;
    let mut best: Option<(T, usize)> = None;
    for (v, n) in counts {
        if best.is_none_or(|(_, top)| n > top) {
            best = Some((v, n));
        }
    }
    best.map(|(v, _)| (v, unanimous))
}
