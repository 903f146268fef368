//! Reassembly of one line of a file group.

use std::fmt;

use tracing::warn;

use super::majority;
use crate::codec::payload::{FileBlockPayload, FileMetadata};

/// Blocks of one line, placed by block number as they arrive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineAssembly {
    metadata: Option<FileMetadata>,
    /// Data blocks in arrival order, duplicates included.
    received: Vec<FileBlockPayload>,
    /// Slot `n - 1` holds block `n`.
    ordered: Vec<Option<Vec<u8>>>,
}

impl LineAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    /// Data blocks received so far, duplicates included.
    pub fn blocks_received(&self) -> usize {
        self.received.len()
    }

    /// Slots currently allocated.
    pub fn total_blocks(&self) -> usize {
        self.ordered.len()
    }

    pub fn slots_filled(&self) -> usize {
        self.ordered.iter().filter(|s| s.is_some()).count()
    }

    pub fn add_block(&mut self, block: FileBlockPayload) {
        let target = usize::from(block.total_blocks.max(block.block_number).max(1));
        if target < self.ordered.len() && self.ordered[target..].iter().all(Option::is_none) {
            self.ordered.truncate(target);
        }
        if target > self.ordered.len() {
            self.ordered.resize(target, None);
        }

        if block.is_metadata {
            if block.file_metadata.is_none() {
                warn!(fgid = block.file_group_id, line = block.line_number, "metadata block without metadata");
            }
            self.metadata = block.file_metadata.or(self.metadata);
            return;
        }
        if block.block_number == 0 {
            warn!(fgid = block.file_group_id, line = block.line_number, "data block numbered 0, placing first");
        }
        let slot = usize::from(block.block_number.saturating_sub(1));
        self.ordered[slot] = Some(block.data.clone());
        self.received.push(block);
    }

    /// Every slot is filled. Duplicates count toward the received total but
    /// fill only one slot.
    pub fn is_complete(&self) -> bool {
        self.received.len() >= self.ordered.len() && self.ordered.iter().all(Option::is_some)
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// Majority line number reported by the data blocks.
    pub fn line_number(&self) -> Option<u16> {
        majority(self.received.iter().map(|b| b.line_number)).map(|(v, _)| v)
    }

    /// Majority file group ID reported by the data blocks.
    pub fn file_group_id(&self) -> Option<u16> {
        majority(self.received.iter().map(|b| b.file_group_id)).map(|(v, _)| v)
    }

    pub fn has_corrupted_blocks(&self) -> bool {
        self.received.iter().any(|b| b.possible_corruption)
    }

    /// Runs every consistency check, warning about each failure.
    pub fn validate(&self) -> bool {
        let mut valid = true;
        if let Some((line, false)) = majority(self.received.iter().map(|b| b.line_number)) {
            warn!(line, "blocks of a line disagree on its line number, using majority");
            valid = false;
        }
        if let Some((fgid, false)) = majority(self.received.iter().map(|b| b.file_group_id)) {
            warn!(fgid, line = ?self.line_number(), "blocks of a line disagree on file group, using majority");
            valid = false;
        }
        let allocated = self.ordered.len();
        if self.received.iter().any(|b| usize::from(b.total_blocks) != allocated) {
            let claimed: Vec<u16> = self.received.iter().map(|b| b.total_blocks).collect();
            warn!(line = ?self.line_number(), allocated, ?claimed, "blocks of a line disagree on total blocks");
            valid = false;
        }
        if self.has_corrupted_blocks() {
            warn!(line = ?self.line_number(), "line contains possibly corrupted blocks");
            valid = false;
        }
        valid
    }

    /// Blocks concatenated in order; missing blocks contribute nothing.
    pub fn assemble(&self) -> Vec<u8> {
        self.ordered.iter().flatten().flatten().copied().collect()
    }
}

impl fmt::Display for LineAssembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {:>4} fgid {:>6} blocks {}/{} ({} received){}{}",
            self.line_number().map_or_else(|| "?".to_string(), |n| n.to_string()),
            self.file_group_id().map_or_else(|| "?".to_string(), |n| n.to_string()),
            self.slots_filled(),
            self.total_blocks(),
            self.received.len(),
            if self.is_complete() { " complete" } else { "" },
            if self.has_corrupted_blocks() { " corrupt" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u16, total: u16, data: &[u8]) -> FileBlockPayload {
        FileBlockPayload::data_block(7, 2, n, total, data)
    }

    #[test]
    fn grows_and_fills_out_of_order() {
        let mut line = LineAssembly::new();
        line.add_block(block(3, 3, b"CC"));
        line.add_block(block(1, 3, b"AA"));
        assert!(!line.is_complete());
        line.add_block(block(2, 3, b"BB"));
        assert!(line.is_complete());
        assert_eq!(line.assemble(), b"AABBCC");
        assert!(line.validate());
    }

    #[test]
    fn duplicates_do_not_complete_a_line() {
        let mut line = LineAssembly::new();
        line.add_block(block(1, 2, b"AA"));
        line.add_block(block(1, 2, b"AA"));
        assert_eq!(line.blocks_received(), 2);
        assert!(!line.is_complete());
    }

    #[test]
    fn corrupt_total_grows_then_shrinks_back() {
        let mut line = LineAssembly::new();
        line.add_block(block(1, 40, b"AA"));
        assert_eq!(line.total_blocks(), 40);
        line.add_block(block(2, 2, b"BB"));
        assert_eq!(line.total_blocks(), 2);
        assert!(line.is_complete());
        assert!(!line.validate());
    }

    #[test]
    fn never_shrinks_over_data() {
        let mut line = LineAssembly::new();
        line.add_block(block(5, 5, b"EE"));
        line.add_block(block(1, 2, b"AA"));
        assert_eq!(line.total_blocks(), 5);
        assert_eq!(line.assemble(), b"AAEE");
    }

    #[test]
    fn majority_line_number_wins() {
        let mut line = LineAssembly::new();
        line.add_block(FileBlockPayload::data_block(7, 2, 1, 3, b"A".to_vec()));
        line.add_block(FileBlockPayload::data_block(7, 9, 2, 3, b"B".to_vec()));
        line.add_block(FileBlockPayload::data_block(7, 2, 3, 3, b"C".to_vec()));
        assert_eq!(line.line_number(), Some(2));
        assert!(!line.validate());
    }
}
