//! All lines of one downlinked file.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use super::line::LineAssembly;
use super::majority;
use crate::codec::payload::FileBlockPayload;

/// Assembled contents of a file group, padded into a rectangle.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFile {
    pub file_group_id: u16,
    /// Each line as reassembled, unpadded. Missing lines are empty.
    pub lines: Vec<Vec<u8>>,
    pub rows: usize,
    pub cols: usize,
    /// Row-major `rows * cols` bytes.
    pub grid: Vec<u8>,
    pub complete: bool,
    /// Lines that failed a consistency check.
    pub invalid_lines: usize,
}

impl AssembledFile {
    pub fn valid(&self) -> bool {
        self.invalid_lines == 0
    }
}

/// Lines of one file group keyed by line number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileGroup {
    lines: BTreeMap<u16, LineAssembly>,
}

impl FileGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, block: FileBlockPayload) {
        let line_number = block.line_number;
        let fgid = block.file_group_id;
        let reported = block.file_metadata.map(|m| m.total_lines).filter(|n| *n > 0);
        let new_line = !self.lines.contains_key(&line_number);
        let line = self.lines.entry(line_number).or_insert_with(|| {
            if !block.is_metadata && line_number % 100 == 0 {
                debug!(fgid, line = line_number, "line started without its metadata block");
            }
            LineAssembly::new()
        });
        line.add_block(block);

        let Some((total, _)) = self.reported_total() else {
            return;
        };
        if let Some(reported) = reported
            && reported != total
        {
            warn!(fgid, line = line_number, reported, total, "metadata disagrees on total line count, using majority");
        }
        if new_line && self.lines.len() > usize::from(total) {
            warn!(fgid, line = line_number, total, found = self.lines.len(), "more lines than the reported total, possible corruption");
        }
    }

    /// Majority non-zero `total_lines` across the lines' metadata and whether
    /// every report agreed.
    fn reported_total(&self) -> Option<(u16, bool)> {
        majority(self.lines.values().filter_map(|l| l.metadata()).map(|m| m.total_lines).filter(|n| *n > 0))
    }

    pub fn line(&self, line_number: u16) -> Option<&LineAssembly> {
        self.lines.get(&line_number)
    }

    pub fn lines(&self) -> impl Iterator<Item = (u16, &LineAssembly)> {
        self.lines.iter().map(|(n, l)| (*n, l))
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn lines_complete(&self) -> usize {
        self.lines.values().filter(|l| l.is_complete()).count()
    }

    /// Majority `total_lines` across the lines' metadata, never fewer than
    /// the lines already seen. `None` until some metadata reports a count.
    pub fn total_lines(&self) -> Option<usize> {
        let (total, _) = self.reported_total()?;
        Some(usize::from(total).max(self.lines.len()))
    }

    /// Majority file group ID of the lines.
    pub fn file_group_id(&self) -> Option<u16> {
        majority(self.lines.values().filter_map(|l| l.file_group_id())).map(|(v, _)| v)
    }

    pub fn callback_id(&self) -> Option<u16> {
        majority(self.lines.values().filter_map(|l| l.metadata()).map(|m| m.callback_id)).map(|(v, _)| v)
    }

    pub fn camera_num(&self) -> Option<u8> {
        majority(self.lines.values().filter_map(|l| l.metadata()).map(|m| m.camera_num)).map(|(v, _)| v)
    }

    pub fn is_complete(&self) -> bool {
        self.total_lines() == Some(self.lines.len()) && self.lines.values().all(LineAssembly::is_complete)
    }

    /// Runs every group and line check, warning about each failure.
    pub fn validate(&self) -> bool {
        let mut valid = true;
        let ids = self.lines.values().filter_map(|l| l.file_group_id());
        if let Some((fgid, false)) = majority(ids) {
            warn!(fgid, "lines disagree on file group ID, using majority");
            valid = false;
        }
        if let Some((callback, false)) = majority(self.lines.values().filter_map(|l| l.metadata()).map(|m| m.callback_id))
        {
            warn!(callback, "lines disagree on callback ID, using majority");
            valid = false;
        }
        if let Some((camera, false)) = majority(self.lines.values().filter_map(|l| l.metadata()).map(|m| m.camera_num)) {
            warn!(camera, "lines disagree on camera number, using majority");
            valid = false;
        }
        // Run every line check so each one logs.
        self.lines.values().fold(valid, |acc, l| l.validate() && acc)
    }

    /// Pads every line to the longest with `pad` and lays them out by line
    /// number. Lines numbered past the file's row count are dropped and
    /// counted as invalid.
    pub fn assemble(&self, file_group_id: u16, pad: u8) -> AssembledFile {
        // Rows never exceed the line count, so a corrupted line number
        // cannot blow up the grid.
        let rows = self.total_lines().unwrap_or(self.lines.len());
        let mut lines = vec![Vec::new(); rows];
        let mut invalid_lines = 0;
        for (n, line) in &self.lines {
            let Some(slot) = lines.get_mut(usize::from(*n)) else {
                warn!(fgid = file_group_id, line = n, rows, "line number beyond the file, dropping line");
                invalid_lines += 1;
                continue;
            };
            *slot = line.assemble();
            if !line.validate() {
                invalid_lines += 1;
            }
        }
        let cols = lines.iter().map(Vec::len).max().unwrap_or(0);
        let mut grid = Vec::with_capacity(rows * cols);
        for line in &lines {
            grid.extend_from_slice(line);
            grid.resize(grid.len() + cols - line.len(), pad);
        }
        AssembledFile { file_group_id, lines, rows, cols, grid, complete: self.is_complete(), invalid_lines }
    }
}

impl fmt::Display for FileGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file group {}: {}/{} lines complete",
            self.file_group_id().map_or_else(|| "?".to_string(), |n| n.to_string()),
            self.lines_complete(),
            self.total_lines().map_or_else(|| "?".to_string(), |n| n.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::{FileMetadata, FileType};
    use proptest::prelude::*;

    fn metadata(total_lines: u16) -> FileMetadata {
        FileMetadata {
            callback_id: 1,
            timestamp_ms: 0,
            file_type: FileType::Image,
            camera_num: 0,
            total_lines,
            sensor_mode: 0,
        }
    }

    #[test]
    fn out_of_order_line_completes_before_file() {
        let mut group = FileGroup::new();
        group.add_block(FileBlockPayload::data_block(7, 2, 2, 3, b"BB".to_vec()));
        group.add_block(FileBlockPayload::metadata_block(7, 2, 3, metadata(5)));
        group.add_block(FileBlockPayload::data_block(7, 2, 1, 3, b"AA".to_vec()));
        group.add_block(FileBlockPayload::data_block(7, 2, 3, 3, b"CC".to_vec()));

        let line = group.line(2).unwrap();
        assert!(line.is_complete());
        assert_eq!(line.assemble(), b"AABBCC");
        assert_eq!(group.total_lines(), Some(5));
        assert!(!group.is_complete());
    }

    #[test]
    fn assembles_padded_grid() {
        let mut group = FileGroup::new();
        group.add_block(FileBlockPayload::metadata_block(1, 0, 1, metadata(2)));
        group.add_block(FileBlockPayload::data_block(1, 0, 1, 1, b"ABC".to_vec()));
        group.add_block(FileBlockPayload::data_block(1, 1, 1, 1, b"D".to_vec()));
        assert!(group.is_complete());
        let file = group.assemble(1, 0xAA);
        assert_eq!((file.rows, file.cols), (2, 3));
        assert_eq!(file.grid, b"ABCD\xAA\xAA");
        assert!(file.valid() && file.complete);
    }

    #[test]
    fn total_lines_unknown_without_metadata() {
        let mut group = FileGroup::new();
        group.add_block(FileBlockPayload::data_block(1, 0, 1, 1, b"A".to_vec()));
        assert_eq!(group.total_lines(), None);
        assert!(!group.is_complete());
    }

    #[test]
    fn inconsistent_lines_are_counted() {
        let mut group = FileGroup::new();
        group.add_block(FileBlockPayload::metadata_block(1, 0, 1, metadata(1)));
        let mut bad = FileBlockPayload::data_block(1, 0, 1, 1, b"A".to_vec());
        bad.possible_corruption = true;
        group.add_block(bad);
        let file = group.assemble(1, 0);
        assert_eq!(file.invalid_lines, 1);
        assert!(!file.valid());
    }

    #[test]
    fn corrupted_line_number_does_not_grow_the_grid() {
        let mut group = FileGroup::new();
        group.add_block(FileBlockPayload::metadata_block(1, 0, 1, metadata(2)));
        group.add_block(FileBlockPayload::data_block(1, 0, 1, 1, b"AB".to_vec()));
        group.add_block(FileBlockPayload::data_block(1, 1, 1, 1, b"CD".to_vec()));
        group.add_block(FileBlockPayload::data_block(1, 0xFFF0, 1, 1, b"ZZ".to_vec()));
        assert_eq!(group.total_lines(), Some(3));
        let file = group.assemble(1, 0);
        assert_eq!((file.rows, file.cols), (3, 2));
        assert_eq!(file.grid, b"ABCD\0\0");
        assert_eq!(file.invalid_lines, 1);

        let mut bare = FileGroup::new();
        bare.add_block(FileBlockPayload::data_block(2, 40000, 1, 1, b"X".to_vec()));
        assert_eq!(bare.assemble(2, 0).rows, 1);
    }

    #[test]
    fn total_lines_is_a_pure_query() {
        let mut group = FileGroup::new();
        group.add_block(FileBlockPayload::metadata_block(1, 0, 1, metadata(2)));
        group.add_block(FileBlockPayload::metadata_block(1, 1, 1, metadata(2)));
        group.add_block(FileBlockPayload::metadata_block(1, 2, 1, metadata(9)));
        let first = group.total_lines();
        assert_eq!(first, Some(3));
        assert_eq!(group.total_lines(), first);
    }

    fn blocks_strategy() -> impl Strategy<Value = Vec<FileBlockPayload>> {
        (1u16..4, 1u16..4).prop_flat_map(|(lines, blocks)| {
            let mut all = Vec::new();
            for line in 0..lines {
                all.push(FileBlockPayload::metadata_block(9, line, blocks, metadata(lines)));
                for b in 1..=blocks {
                    all.push(FileBlockPayload::data_block(9, line, b, blocks, vec![line as u8, b as u8]));
                }
            }
            Just(all).prop_shuffle()
        })
    }

    proptest! {
        #[test]
        fn completion_is_order_independent(
            blocks in blocks_strategy(),
            dup in proptest::collection::vec(any::<prop::sample::Index>(), 0..4),
            missing in any::<prop::sample::Index>(),
            drop_one in any::<bool>(),
        ) {
            let mut feed = blocks.clone();
            for d in &dup {
                feed.push(d.get(&blocks).clone());
            }
            // Metadata blocks are repeated per line, so only data blocks leave holes.
            let data_indices: Vec<usize> = (0..blocks.len()).filter(|i| !blocks[*i].is_metadata).collect();
            let dropped = drop_one.then(|| *missing.get(&data_indices));
            let dropped_block = dropped.map(|i| blocks[i].clone());

            let mut group = FileGroup::new();
            for (i, b) in feed.into_iter().enumerate() {
                if Some(i) != dropped {
                    group.add_block(b);
                }
            }

            // A lost block leaves a hole unless a duplicate supplied it again.
            let resupplied = dropped_block.as_ref().is_some_and(|lost| dup.iter().any(|d| d.get(&blocks) == lost));
            let expected = dropped.is_none() || resupplied;
            prop_assert_eq!(group.is_complete(), expected);

            if expected {
                let mut ordered = FileGroup::new();
                let mut sorted = blocks.clone();
                sorted.sort_by_key(|b| (b.line_number, b.block_number));
                for b in sorted {
                    ordered.add_block(b);
                }
                prop_assert_eq!(group.assemble(9, 0).grid, ordered.assemble(9, 0).grid);
            }
        }
    }
}
