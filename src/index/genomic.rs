//! The genomic index: an optional trailing skippable frame mapping
//! `(reference, begin, end)` ranges to the uncompressed offset of the data
//! frame containing them.
//!
//! Reference ids are stored shifted by one so that the conventional `-1`
//! "unmapped" id maps to section 0. Coordinates are 32-bit on disk in this
//! revision; out-of-range coordinates are rejected when the entry is added
//! rather than silently truncated.
//!
//! The frame ends with an 8-byte back-pointer footer `[size: u32][magic: u32]`
//! holding the frame's own on-disk size, so a reader that has located the
//! seekable index can look 8 bytes before it and seek back to the genomic
//! frame start.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, FormatError, IndexError, Result};
use crate::frame::{GENOMIC_FOOTER_MAGIC, META_MAGIC};

/// On-disk bytes per entry: tid + begin + end as u32, frame_start as u64
const ENTRY_SIZE: usize = 20;

/// Upper bound on addressable reference sequences. Shifted reference ids at
/// or above this are rejected rather than driving the per-reference table to
/// absurd sizes.
const MAX_REFERENCES: u32 = 1 << 24;

/// A range of records on one reference, contained in one data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenomicEntry {
    /// Shifted reference id (0 = unmapped)
    pub tid: u32,
    pub begin: i64,
    pub end: i64,
    /// Uncompressed offset of the data frame holding the first record,
    /// suitable as a `seek` argument
    pub frame_start: u64,
}

/// Per-reference ordered lists of [`GenomicEntry`] values.
#[derive(Debug, Default)]
pub struct GenomicIndex {
    refs: Vec<Vec<GenomicEntry>>,
    /// Frame and reference of the most recent entry, for merging
    last: Option<(u64, u32)>,
}

impl GenomicIndex {
    /// Records that a range on `tid` begins at uncompressed offset `offset`
    /// inside the frame starting at `frame`. Consecutive ranges in the same
    /// frame and on the same reference expand the previous entry instead of
    /// creating a new one; the entry keeps the offset of its first range.
    pub(crate) fn add(
        &mut self,
        tid: i32,
        begin: i64,
        end: i64,
        frame: u64,
        offset: u64,
    ) -> Result<()> {
        let shifted = i64::from(tid) + 1;
        if !(0..i64::from(MAX_REFERENCES)).contains(&shifted) {
            return Err(IndexError::InvalidReference(tid).into());
        }
        for coord in [begin, end] {
            if coord < 0 || coord > i64::from(u32::MAX) {
                return Err(IndexError::CoordinateOverflow(coord).into());
            }
        }
        let stored = shifted as u32;
        if self.refs.len() <= stored as usize {
            self.refs.resize_with(stored as usize + 1, Vec::new);
        }

        if self.last == Some((frame, stored)) {
            let entry = self.refs[stored as usize]
                .last_mut()
                .expect("merge target exists");
            entry.begin = entry.begin.min(begin);
            entry.end = entry.end.max(end);
        } else {
            self.refs[stored as usize].push(GenomicEntry {
                tid: stored,
                begin,
                end,
                frame_start: offset,
            });
            self.last = Some((frame, stored));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.iter().all(Vec::is_empty)
    }

    #[must_use]
    pub fn num_references(&self) -> usize {
        self.refs.len()
    }

    /// Returns the uncompressed offset of the first data frame that may hold
    /// records overlapping `[begin, end]` on reference `tid`: the first entry
    /// on that reference whose end reaches `begin`, else the first entry of
    /// any later reference. `None` means past the end of the indexed data.
    /// The caller filters records that do not actually fall in the range.
    #[must_use]
    pub fn query(&self, tid: i32, begin: i64, _end: i64) -> Option<u64> {
        let shifted = i64::from(tid) + 1;
        if !(0..i64::from(MAX_REFERENCES)).contains(&shifted) {
            return None;
        }
        let stored = shifted as usize;

        if let Some(entries) = self.refs.get(stored) {
            if let Some(entry) = entries.iter().find(|e| e.end >= begin) {
                return Some(entry.frame_start);
            }
        }
        // Nothing left on this reference: first entry of any later one
        self.refs
            .iter()
            .skip(stored + 1)
            .find_map(|entries| entries.first().map(|e| e.frame_start))
    }

    /// On-disk size of the whole frame, including the 8-byte frame header.
    fn frame_size(&self) -> u32 {
        let payload: usize = 1
            + 4
            + self
                .refs
                .iter()
                .map(|entries| 1 + 4 + entries.len() * ENTRY_SIZE)
                .sum::<usize>()
            + 8;
        8 + payload as u32
    }

    /// Serializes the index as a skippable frame with back-pointer footer.
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let frame_size = self.frame_size();
        w.write_u32::<LittleEndian>(META_MAGIC)?;
        w.write_u32::<LittleEndian>(frame_size - 8)?;
        w.write_u8(0)?; // reserved
        w.write_u32::<LittleEndian>(self.refs.len() as u32)?;
        for entries in &self.refs {
            w.write_u8(0)?; // reserved
            w.write_u32::<LittleEndian>(entries.len() as u32)?;
            for entry in entries {
                w.write_u32::<LittleEndian>(entry.tid)?;
                w.write_u32::<LittleEndian>(entry.begin as u32)?;
                w.write_u32::<LittleEndian>(entry.end as u32)?;
                w.write_u64::<LittleEndian>(entry.frame_start)?;
            }
        }
        w.write_u32::<LittleEndian>(frame_size)?;
        w.write_u32::<LittleEndian>(GENOMIC_FOOTER_MAGIC)?;
        Ok(())
    }

    /// Loads the genomic index that precedes the seekable index frame
    /// starting at `seekable_start`, or `None` when the file has none.
    /// Rewinds to the file start afterwards.
    pub(crate) fn load_before<R: Read + Seek>(
        src: &mut R,
        seekable_start: u64,
    ) -> Result<Option<Self>> {
        if seekable_start < 8 {
            return Ok(None);
        }
        src.seek(SeekFrom::Start(seekable_start - 8))
            .map_err(Error::from_seek)?;
        let size_back = src.read_u32::<LittleEndian>()?;
        let magic = src.read_u32::<LittleEndian>()?;
        if magic != GENOMIC_FOOTER_MAGIC {
            src.seek(SeekFrom::Start(0))?;
            return Ok(None);
        }
        if u64::from(size_back) > seekable_start || size_back < 8 {
            return Err(IndexError::Corrupt("back-pointer out of range").into());
        }

        src.seek(SeekFrom::Start(seekable_start - u64::from(size_back)))?;
        let head_magic = src.read_u32::<LittleEndian>()?;
        if head_magic != META_MAGIC {
            return Err(FormatError::InvalidMagic(head_magic).into());
        }
        let declared = src.read_u32::<LittleEndian>()?;
        let expected = size_back - 8;
        if declared != expected {
            return Err(FormatError::LengthMismatch { declared, expected }.into());
        }

        src.read_u8()?; // reserved
        let nchr = src.read_u32::<LittleEndian>()?;

        // Bytes left for the per-reference sections: the flag byte and
        // reference count are consumed, the back-pointer footer is not part
        // of them. Declared counts must fit this budget before anything is
        // allocated or read.
        let mut budget = u64::from(declared)
            .checked_sub(1 + 4 + 8)
            .ok_or(IndexError::Corrupt("frame too small for its header"))?;
        if nchr > MAX_REFERENCES || u64::from(nchr) * 5 > budget {
            return Err(IndexError::Corrupt("reference count exceeds frame size").into());
        }

        let mut index = Self::default();
        index.refs.resize_with(nchr as usize, Vec::new);
        for entries in &mut index.refs {
            src.read_u8()?; // reserved
            let frame_count = src.read_u32::<LittleEndian>()?;
            budget = budget
                .checked_sub(5)
                .ok_or(IndexError::Corrupt("section overruns frame size"))?;
            if u64::from(frame_count) * ENTRY_SIZE as u64 > budget {
                return Err(IndexError::Corrupt("entry count exceeds frame size").into());
            }
            budget -= u64::from(frame_count) * ENTRY_SIZE as u64;
            for _ in 0..frame_count {
                let tid = src.read_u32::<LittleEndian>()?;
                let begin = i64::from(src.read_u32::<LittleEndian>()?);
                let end = i64::from(src.read_u32::<LittleEndian>()?);
                let frame_start = src.read_u64::<LittleEndian>()?;
                entries.push(GenomicEntry {
                    tid,
                    begin,
                    end,
                    frame_start,
                });
            }
        }

        if index.frame_size() != size_back {
            return Err(IndexError::Corrupt("frame size disagrees with footer").into());
        }

        src.seek(SeekFrom::Start(0))?;
        Ok(Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_index() -> GenomicIndex {
        let mut index = GenomicIndex::default();
        index.add(0, 10, 20, 0, 0).unwrap();
        index.add(0, 200, 250, 1000, 1000).unwrap();
        index.add(1, 5, 9, 2000, 2000).unwrap();
        index
    }

    #[test]
    fn test_query_on_reference() {
        let index = sample_index();
        assert_eq!(index.query(0, 15, 25), Some(0));
        assert_eq!(index.query(0, 21, 100), Some(1000));
        assert_eq!(index.query(1, 0, 100), Some(2000));
    }

    #[test]
    fn test_query_walks_to_later_reference() {
        let index = sample_index();
        // Past the last range on reference 0: first frame of reference 1
        assert_eq!(index.query(0, 300, 400), Some(2000));
        // Nothing at or after reference 2
        assert_eq!(index.query(2, 0, 100), None);
    }

    #[test]
    fn test_unmapped_reference_shift() {
        let mut index = GenomicIndex::default();
        index.add(-1, 0, 1, 0, 0).unwrap();
        assert_eq!(index.query(-1, 0, 10), Some(0));
        assert_eq!(index.num_references(), 1);
    }

    #[test]
    fn test_same_frame_entries_merge() {
        let mut index = GenomicIndex::default();
        index.add(0, 10, 20, 0, 0).unwrap();
        index.add(0, 30, 45, 0, 120).unwrap();
        index.add(0, 5, 8, 0, 250).unwrap();
        assert_eq!(index.refs[1].len(), 1);
        assert_eq!(index.refs[1][0].begin, 5);
        assert_eq!(index.refs[1][0].end, 45);
        // The merged entry keeps the offset of its first range
        assert_eq!(index.refs[1][0].frame_start, 0);
    }

    #[test]
    fn test_new_frame_starts_new_entry() {
        let mut index = GenomicIndex::default();
        index.add(0, 10, 20, 0, 0).unwrap();
        index.add(0, 30, 45, 500, 500).unwrap();
        assert_eq!(index.refs[1].len(), 2);
    }

    #[test]
    fn test_coordinate_overflow_rejected() {
        let mut index = GenomicIndex::default();
        let err = index.add(0, 0, i64::from(u32::MAX) + 1, 0, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::Index(IndexError::CoordinateOverflow(_))
        ));
        let err = index.add(0, -5, 10, 0, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::Index(IndexError::CoordinateOverflow(-5))
        ));
    }

    #[test]
    fn test_invalid_reference_rejected() {
        let mut index = GenomicIndex::default();
        assert!(matches!(
            index.add(-2, 0, 1, 0, 0),
            Err(Error::Index(IndexError::InvalidReference(-2)))
        ));
    }

    #[test]
    fn test_reference_upper_bound_rejected() {
        let mut index = GenomicIndex::default();
        // tid + 1 would overflow i32 arithmetic
        assert!(matches!(
            index.add(i32::MAX, 0, 1, 0, 0),
            Err(Error::Index(IndexError::InvalidReference(_)))
        ));
        // Within i32 range but an absurd reference table size
        assert!(matches!(
            index.add(2_000_000_000, 0, 1, 0, 0),
            Err(Error::Index(IndexError::InvalidReference(_)))
        ));
        assert!(index.is_empty());
        assert_eq!(index.query(i32::MAX, 0, 1), None);
        assert_eq!(index.query(2_000_000_000, 0, 1), None);
    }

    #[test]
    fn test_write_load_round_trip() {
        let index = sample_index();
        let mut file = Vec::new();
        index.write_to(&mut file).unwrap();
        let seekable_start = file.len() as u64;

        let mut src = Cursor::new(file);
        let loaded = GenomicIndex::load_before(&mut src, seekable_start)
            .unwrap()
            .expect("index present");
        assert_eq!(loaded.refs, index.refs);
        assert_eq!(src.position(), 0);
    }

    #[test]
    fn test_load_absent_index() {
        let file = vec![0u8; 32];
        let mut src = Cursor::new(file);
        assert!(GenomicIndex::load_before(&mut src, 32).unwrap().is_none());
        assert!(GenomicIndex::load_before(&mut src, 4).unwrap().is_none());
    }

    #[test]
    fn test_load_rejects_oversized_reference_count() {
        let index = sample_index();
        let mut file = Vec::new();
        index.write_to(&mut file).unwrap();
        // nchr sits after the 8-byte frame header and the flag byte
        file[9..13].copy_from_slice(&u32::MAX.to_le_bytes());
        let seekable_start = file.len() as u64;

        let mut src = Cursor::new(file);
        let err = GenomicIndex::load_before(&mut src, seekable_start).unwrap_err();
        assert!(matches!(err, Error::Index(IndexError::Corrupt(_))));
    }

    #[test]
    fn test_load_rejects_oversized_entry_count() {
        let index = sample_index();
        let mut file = Vec::new();
        index.write_to(&mut file).unwrap();
        // First section's frame_count follows its flag byte at offset 13
        file[14..18].copy_from_slice(&u32::MAX.to_le_bytes());
        let seekable_start = file.len() as u64;

        let mut src = Cursor::new(file);
        let err = GenomicIndex::load_before(&mut src, seekable_start).unwrap_err();
        assert!(matches!(err, Error::Index(IndexError::Corrupt(_))));
    }
}
