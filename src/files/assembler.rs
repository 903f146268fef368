//! Routes file blocks to their file groups.

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::{debug, info};

use super::group::{AssembledFile, FileGroup};
use crate::codec::payload::{FileBlockPayload, Payload};

/// Recently taken file group IDs remembered so late duplicates are ignored.
pub const TAKEN_MEMORY: usize = 256;

/// In-progress file groups keyed by file group ID.
#[derive(Debug, Clone)]
pub struct FileBlockAssembler {
    groups: BTreeMap<u16, FileGroup>,
    pad: u8,
    taken: HashSet<u16>,
    taken_order: VecDeque<u16>,
}

impl Default for FileBlockAssembler {
    fn default() -> Self {
        Self::new(0xAA)
    }
}

impl FileBlockAssembler {
    /// `pad` fills short lines when a group is assembled.
    pub fn new(pad: u8) -> Self {
        Self { groups: BTreeMap::new(), pad, taken: HashSet::new(), taken_order: VecDeque::new() }
    }

    /// Adds a block. Returns its file group ID if that group just became
    /// complete. Blocks for a group taken within the last [`TAKEN_MEMORY`]
    /// groups are ignored.
    pub fn add_block(&mut self, block: FileBlockPayload) -> Option<u16> {
        let fgid = block.file_group_id;
        if self.taken.contains(&fgid) {
            debug!(fgid, block = block.block_number, line = block.line_number, "block for an exported file group, ignoring");
            return None;
        }
        let group = self.groups.entry(fgid).or_insert_with(|| {
            info!(fgid, "new file group");
            FileGroup::new()
        });
        let was_complete = group.is_complete();
        group.add_block(block);
        debug!(fgid, "{group}");
        (!was_complete && group.is_complete()).then_some(fgid)
    }

    /// Adds every file block among `payloads`, returning the groups completed.
    pub fn add_payloads<'a>(&mut self, payloads: impl IntoIterator<Item = &'a Payload>) -> Vec<u16> {
        payloads
            .into_iter()
            .filter_map(|p| match p {
                Payload::FileBlock(b) => self.add_block(b.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn group(&self, file_group_id: u16) -> Option<&FileGroup> {
        self.groups.get(&file_group_id)
    }

    pub fn in_progress(&self) -> impl Iterator<Item = (u16, &FileGroup)> {
        self.groups.iter().map(|(id, g)| (*id, g))
    }

    /// Assembles and forgets a group. Later blocks for the same ID are
    /// ignored, so a second call returns `None`.
    pub fn take(&mut self, file_group_id: u16) -> Option<AssembledFile> {
        let group = self.groups.remove(&file_group_id)?;
        if self.taken.insert(file_group_id) {
            self.taken_order.push_back(file_group_id);
        }
        while self.taken_order.len() > TAKEN_MEMORY {
            if let Some(old) = self.taken_order.pop_front() {
                self.taken.remove(&old);
            }
        }
        Some(group.assemble(file_group_id, self.pad))
    }

    /// Assembles and forgets every group, complete or not.
    pub fn drain(&mut self) -> Vec<AssembledFile> {
        let ids: Vec<u16> = self.groups.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::{FileMetadata, FileType};

    fn metadata(total_lines: u16) -> FileMetadata {
        FileMetadata { callback_id: 3, timestamp_ms: 0, file_type: FileType::Image, camera_num: 1, total_lines, sensor_mode: 0 }
    }

    #[test]
    fn reports_completion_once_and_exports_once() {
        let mut assembler = FileBlockAssembler::default();
        assert_eq!(assembler.add_block(FileBlockPayload::metadata_block(5, 0, 2, metadata(1))), None);
        assert_eq!(assembler.add_block(FileBlockPayload::data_block(5, 0, 2, 2, b"YY".to_vec())), None);
        assert_eq!(assembler.add_block(FileBlockPayload::data_block(5, 0, 1, 2, b"XX".to_vec())), Some(5));
        assert_eq!(assembler.add_block(FileBlockPayload::data_block(5, 0, 1, 2, b"XX".to_vec())), None);

        let file = assembler.take(5).unwrap();
        assert_eq!(file.grid, b"XXYY");
        assert!(file.complete);
        assert!(assembler.take(5).is_none());
        assert_eq!(assembler.in_progress().count(), 0);

        // A late duplicate does not reopen the exported group.
        assert_eq!(assembler.add_block(FileBlockPayload::data_block(5, 0, 2, 2, b"YY".to_vec())), None);
        assert_eq!(assembler.in_progress().count(), 0);
    }

    #[test]
    fn taken_ids_are_forgotten_eventually() {
        let mut assembler = FileBlockAssembler::new(0);
        for fgid in 0..=TAKEN_MEMORY as u16 {
            assembler.add_block(FileBlockPayload::data_block(fgid, 0, 1, 1, b"A".to_vec()));
            assert!(assembler.take(fgid).is_some());
        }
        assembler.add_block(FileBlockPayload::data_block(0, 0, 1, 1, b"B".to_vec()));
        assert!(assembler.group(0).is_some());
        assembler.add_block(FileBlockPayload::data_block(1, 0, 1, 1, b"B".to_vec()));
        assert!(assembler.group(1).is_none());
    }

    #[test]
    fn groups_are_kept_apart() {
        let mut assembler = FileBlockAssembler::new(0);
        let payloads = [
            Payload::FileBlock(FileBlockPayload::data_block(1, 0, 1, 1, b"A".to_vec())),
            Payload::FileBlock(FileBlockPayload::data_block(2, 0, 1, 1, b"B".to_vec())),
            crate::test_utils::fixtures::telemetry(1),
        ];
        assert!(assembler.add_payloads(&payloads).is_empty());
        assert_eq!(assembler.in_progress().count(), 2);
        let drained = assembler.drain();
        assert_eq!(drained.iter().map(|f| f.file_group_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(drained.iter().all(|f| !f.complete));
    }
}
