//! The seekable index: a trailing skippable frame mapping every frame in the
//! file to its compressed and uncompressed size.
//!
//! The format matches the zstd seekable-format seek table. Entries appear in
//! file order and cover *all* frames, including skippable ones: a skippable
//! frame is recorded with an uncompressed size of zero and its whole on-disk
//! length as the compressed size, so prefix sums over the table yield exact
//! compressed file offsets. No per-entry checksums are written; zstd frames
//! already carry their own.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, FormatError, Result};
use crate::frame::{SEEKABLE_FOOTER_MAGIC, SEEKABLE_MAGIC};

/// Footer flag bit marking 4 extra checksum bytes per entry
const FLAG_CHECKSUM: u8 = 0x80;
/// Footer flag bits that must be zero
const FLAG_RESERVED: u8 = 0x7C;
/// Fixed footer size: `[n: u32][flags: u8][magic: u32]`
const FOOTER_SIZE: u64 = 9;

/// One frame in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekableEntry {
    /// On-disk size of the frame
    pub comp_sz: u32,
    /// Uncompressed size; zero for skippable frames
    pub uncomp_sz: u32,
    /// Compressed file offset of the frame start (prefix sum)
    pub comp_pos: u64,
    /// Uncompressed stream offset at the frame start (prefix sum)
    pub uncomp_pos: u64,
}

/// The target of a positioned read, resolved from an uncompressed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekTarget {
    /// Compressed file offset to seek to; sits on the preface (or header)
    /// frame preceding the chosen data frame
    pub comp_pos: u64,
    /// Uncompressed stream offset at the start of the chosen data frame
    pub uncomp_start: u64,
}

/// Ordered list of `(comp, uncomp)` frame sizes with derived running totals.
#[derive(Debug, Default)]
pub struct SeekableIndex {
    entries: Vec<SeekableEntry>,
    total_uncomp: u64,
    total_comp: u64,
    /// On-disk size of the index frame itself; known after `load`
    frame_bytes: u64,
}

impl SeekableIndex {
    /// Appends a frame in file order, maintaining the running totals.
    pub(crate) fn push(&mut self, uncomp_sz: u32, comp_sz: u32) {
        self.entries.push(SeekableEntry {
            comp_sz,
            uncomp_sz,
            comp_pos: self.total_comp,
            uncomp_pos: self.total_uncomp,
        });
        self.total_comp += u64::from(comp_sz);
        self.total_uncomp += u64::from(uncomp_sz);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total uncompressed bytes covered by the index
    #[must_use]
    pub fn total_uncompressed(&self) -> u64 {
        self.total_uncomp
    }

    /// Total compressed bytes covered by the index: the file offset where the
    /// trailing index frames begin
    #[must_use]
    pub fn total_compressed(&self) -> u64 {
        self.total_comp
    }

    #[must_use]
    pub fn entries(&self) -> &[SeekableEntry] {
        &self.entries
    }

    /// On-disk size of the index frame; only meaningful after [`load`](Self::load).
    #[must_use]
    pub fn frame_bytes(&self) -> u64 {
        self.frame_bytes
    }

    /// Serializes the index as the trailing skippable frame.
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let n = self.entries.len() as u32;
        w.write_u32::<LittleEndian>(SEEKABLE_MAGIC)?;
        w.write_u32::<LittleEndian>(n * 8 + FOOTER_SIZE as u32)?;
        for entry in &self.entries {
            w.write_u32::<LittleEndian>(entry.comp_sz)?;
            w.write_u32::<LittleEndian>(entry.uncomp_sz)?;
        }
        w.write_u32::<LittleEndian>(n)?;
        w.write_u8(0)?; // no per-entry checksums
        w.write_u32::<LittleEndian>(SEEKABLE_FOOTER_MAGIC)?;
        Ok(())
    }

    /// Loads the index from the tail of `src`, then rewinds to the file
    /// start.
    ///
    /// Errors: [`Error::NoIndex`] when no index frame is present,
    /// [`Error::NonSeekable`] when the stream cannot seek, [`Error::Format`]
    /// when an index frame is present but corrupt.
    pub fn load<R: Read + Seek>(src: &mut R) -> Result<Self> {
        let file_len = src.seek(SeekFrom::End(0)).map_err(Error::from_seek)?;

        // Smallest possible index frame: 8-byte header + empty + footer
        if file_len < 8 + FOOTER_SIZE {
            src.seek(SeekFrom::Start(0))?;
            return Err(Error::NoIndex);
        }

        src.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))
            .map_err(Error::from_seek)?;
        let n = src.read_u32::<LittleEndian>()?;
        let flags = src.read_u8()?;
        let magic = src.read_u32::<LittleEndian>()?;

        if magic != SEEKABLE_FOOTER_MAGIC || flags & FLAG_RESERVED != 0 {
            src.seek(SeekFrom::Start(0))?;
            return Err(Error::NoIndex);
        }

        let has_checksum = flags & FLAG_CHECKSUM != 0;
        let entry_size = 4 * (2 + u64::from(has_checksum));
        let frame_bytes = 8 + u64::from(n) * entry_size + FOOTER_SIZE;
        if frame_bytes > file_len {
            src.seek(SeekFrom::Start(0))?;
            return Err(Error::NoIndex);
        }

        src.seek(SeekFrom::End(-(frame_bytes as i64)))?;
        let head_magic = src.read_u32::<LittleEndian>()?;
        if head_magic != SEEKABLE_MAGIC {
            return Err(FormatError::InvalidMagic(head_magic).into());
        }
        let declared = src.read_u32::<LittleEndian>()?;
        let expected = (frame_bytes - 8) as u32;
        if declared != expected {
            return Err(FormatError::LengthMismatch { declared, expected }.into());
        }

        let mut index = Self::default();
        for _ in 0..n {
            let comp_sz = src.read_u32::<LittleEndian>()?;
            let uncomp_sz = src.read_u32::<LittleEndian>()?;
            if has_checksum {
                src.read_u32::<LittleEndian>()?;
            }
            index.push(uncomp_sz, comp_sz);
        }
        index.frame_bytes = frame_bytes;

        src.seek(SeekFrom::Start(0))?;
        Ok(index)
    }

    /// Resolves an uncompressed offset to the frame holding it.
    ///
    /// The binary search may land on a skippable entry (uncompressed size
    /// zero); those are transparent, so the search skips forward to the next
    /// data entry, fails with [`Error::Range`] past the end of the data, and
    /// finally walks backward over the run of skippable entries so the
    /// returned offset sits on the preface preceding the data frame. Reading
    /// from there consumes the preface before the data frame itself.
    pub fn query(&self, upos: u64) -> Result<SeekTarget> {
        if upos >= self.total_uncomp {
            return Err(Error::Range {
                requested: upos,
                available: self.total_uncomp,
            });
        }

        // Last entry starting at or before upos
        let mut i = self.entries.partition_point(|e| e.uncomp_pos <= upos) - 1;

        // Step over skippable entries and any data entry whose range ends at
        // or before the target
        while i < self.entries.len() {
            let e = &self.entries[i];
            if e.uncomp_sz > 0 && upos < e.uncomp_pos + u64::from(e.uncomp_sz) {
                break;
            }
            i += 1;
        }
        if i >= self.entries.len() {
            return Err(Error::Range {
                requested: upos,
                available: self.total_uncomp,
            });
        }

        let uncomp_start = self.entries[i].uncomp_pos;

        // Back onto the preface (and any other meta frames) for this block
        while i > 0 && self.entries[i - 1].uncomp_sz == 0 {
            i -= 1;
        }

        Ok(SeekTarget {
            comp_pos: self.entries[i].comp_pos,
            uncomp_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// header frame, then two preface+data pairs
    fn sample_index() -> SeekableIndex {
        let mut index = SeekableIndex::default();
        index.push(0, 28); // header frame
        index.push(0, 12); // preface
        index.push(1000, 700); // data
        index.push(0, 12); // preface
        index.push(500, 400); // data
        index
    }

    #[test]
    fn test_prefix_sums() {
        let index = sample_index();
        assert_eq!(index.total_uncompressed(), 1500);
        assert_eq!(index.total_compressed(), 28 + 12 + 700 + 12 + 400);
        assert_eq!(index.entries()[2].comp_pos, 40);
        assert_eq!(index.entries()[2].uncomp_pos, 0);
        assert_eq!(index.entries()[4].comp_pos, 752);
        assert_eq!(index.entries()[4].uncomp_pos, 1000);
    }

    #[test]
    fn test_query_walks_back_over_meta_frames() {
        let index = sample_index();
        // Offset in the first block: walk back over preface and header frame
        let target = index.query(0).unwrap();
        assert_eq!(target.comp_pos, 0);
        assert_eq!(target.uncomp_start, 0);

        let target = index.query(999).unwrap();
        assert_eq!(target.comp_pos, 0);
        assert_eq!(target.uncomp_start, 0);

        // Second block: walk back over its preface only
        let target = index.query(1000).unwrap();
        assert_eq!(target.comp_pos, 740);
        assert_eq!(target.uncomp_start, 1000);

        let target = index.query(1499).unwrap();
        assert_eq!(target.comp_pos, 740);
        assert_eq!(target.uncomp_start, 1000);
    }

    #[test]
    fn test_query_past_end() {
        let index = sample_index();
        assert!(matches!(index.query(1500), Err(Error::Range { .. })));
        assert!(matches!(index.query(u64::MAX), Err(Error::Range { .. })));
    }

    #[test]
    fn test_query_empty_index() {
        let index = SeekableIndex::default();
        assert!(matches!(index.query(0), Err(Error::Range { .. })));
    }

    #[test]
    fn test_write_load_round_trip() {
        let index = sample_index();
        let mut file = Vec::new();
        index.write_to(&mut file).unwrap();

        let mut src = Cursor::new(file);
        let loaded = SeekableIndex::load(&mut src).unwrap();
        assert_eq!(loaded.entries(), index.entries());
        assert_eq!(loaded.total_uncompressed(), 1500);
        assert_eq!(loaded.frame_bytes(), 8 + 5 * 8 + 9);
        // Rewound for subsequent reading
        assert_eq!(src.position(), 0);
    }

    #[test]
    fn test_load_missing_index() {
        let mut src = Cursor::new(vec![0u8; 64]);
        assert!(matches!(
            SeekableIndex::load(&mut src),
            Err(Error::NoIndex)
        ));
    }

    #[test]
    fn test_load_corrupt_footer_magic() {
        let index = sample_index();
        let mut file = Vec::new();
        index.write_to(&mut file).unwrap();
        let last = file.len() - 1;
        file[last] ^= 0xFF;

        let mut src = Cursor::new(file);
        assert!(matches!(
            SeekableIndex::load(&mut src),
            Err(Error::NoIndex)
        ));
    }

    #[test]
    fn test_load_reserved_flag_bits() {
        let index = sample_index();
        let mut file = Vec::new();
        index.write_to(&mut file).unwrap();
        let flags_at = file.len() - 5;
        file[flags_at] = 0x04;

        let mut src = Cursor::new(file);
        assert!(matches!(
            SeekableIndex::load(&mut src),
            Err(Error::NoIndex)
        ));
    }

    #[test]
    fn test_load_empty_index() {
        let index = SeekableIndex::default();
        let mut file = Vec::new();
        index.write_to(&mut file).unwrap();

        let mut src = Cursor::new(file);
        let loaded = SeekableIndex::load(&mut src).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.total_uncompressed(), 0);
    }
}
