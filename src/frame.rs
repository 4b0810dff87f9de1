//! On-disk frame codec.
//!
//! A BGZF2 file is a sequence of Zstd frames. Data frames are ordinary Zstd
//! compressed frames; everything else rides in skippable frames, which any
//! conforming Zstd decoder ignores:
//!
//! - a header frame (`"BGZ2"` tag plus a short uncompressed preview),
//! - a 12-byte preface before each data frame publishing the compressed size
//!   of that frame (pzstd compatible),
//! - the trailing genomic and seekable index frames.
//!
//! Every skippable frame starts with `[magic: u32 LE][length: u32 LE]` where
//! `length` counts the payload bytes that follow.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::buffer::Buffer;
use crate::codec;
use crate::error::{FormatError, Result};
use crate::MAX_BLOCK_SIZE;

/// First magic in the skippable frame range
pub(crate) const SKIPPABLE_MAGIC_MIN: u32 = 0x184D2A50;
/// Last magic in the skippable frame range
pub(crate) const SKIPPABLE_MAGIC_MAX: u32 = 0x184D2A5F;

/// Preface frame magic (pzstd compatibility: size of next frame)
pub(crate) const PREFACE_MAGIC: u32 = 0x184D2A50;
/// Header frame and genomic index frame magic (distinguished by context)
pub(crate) const META_MAGIC: u32 = 0x184D2A5B;
/// Seekable index frame magic
pub(crate) const SEEKABLE_MAGIC: u32 = 0x184D2A5E;

/// Trailing magic of the seekable index footer; doubles as the EOF marker
pub(crate) const SEEKABLE_FOOTER_MAGIC: u32 = 0x8F92EAB1;
/// Trailing magic of the genomic index footer
pub(crate) const GENOMIC_FOOTER_MAGIC: u32 = 0x8F92EABB;

/// Magic number of a Zstd data frame, as read little-endian
pub(crate) const ZSTD_FRAME_MAGIC: u32 = 0xFD2FB528;

/// Tag identifying the header frame payload
pub(crate) const HEADER_TAG: &[u8; 4] = b"BGZ2";
/// Bytes of uncompressed preview stored in the header frame
pub(crate) const HEADER_PREVIEW: usize = 16;

/// On-disk size of a preface frame: 8-byte skippable header + u32 payload
pub(crate) const PREFACE_FRAME_SIZE: u32 = 12;

/// The outcome of parsing forward to the next data frame.
#[derive(Debug)]
pub(crate) enum NextFrame {
    /// A complete data frame was read into the compressed buffer.
    /// `content_size` is the frame's declared uncompressed size, if present.
    Data { content_size: Option<u64> },
    /// The input is exhausted
    Eof,
}

/// Writes the file header frame: `"BGZ2"` plus up to 16 bytes of uncompressed
/// preview from the first block. Returns the frame's on-disk size.
pub(crate) fn write_header_frame<W: Write>(w: &mut W, preview: &[u8]) -> io::Result<u32> {
    let n = preview.len().min(HEADER_PREVIEW);
    w.write_u32::<LittleEndian>(META_MAGIC)?;
    w.write_u32::<LittleEndian>((HEADER_TAG.len() + n) as u32)?;
    w.write_all(HEADER_TAG)?;
    w.write_all(&preview[..n])?;
    Ok(8 + (HEADER_TAG.len() + n) as u32)
}

/// Writes a preface frame announcing the compressed size of the data frame
/// that follows it.
pub(crate) fn write_preface<W: Write>(w: &mut W, comp_sz: u32) -> io::Result<()> {
    w.write_u32::<LittleEndian>(PREFACE_MAGIC)?;
    w.write_u32::<LittleEndian>(4)?;
    w.write_u32::<LittleEndian>(comp_sz)?;
    Ok(())
}

/// Parses forward to the next data frame, filling `comp` with its compressed
/// bytes. Skippable frames other than the preface are skipped inline; a
/// preface is identified only by magic *and* `length == 4` together, so an
/// unrelated 4-byte skippable from another tool cannot be misread as one.
pub(crate) fn read_next_frame<R: Read>(src: &mut R, comp: &mut Buffer) -> Result<NextFrame> {
    loop {
        let magic = match read_magic(src)? {
            Some(magic) => magic,
            None => return Ok(NextFrame::Eof),
        };

        if (SKIPPABLE_MAGIC_MIN..=SKIPPABLE_MAGIC_MAX).contains(&magic) {
            let length = read_u32(src)?;
            if magic == PREFACE_MAGIC && length == 4 {
                let comp_sz = read_u32(src)?;
                return read_data_frame(src, comp, comp_sz);
            }
            // Unknown or unrelated skippable frame
            skip_exact(src, u64::from(length))?;
        } else if magic == ZSTD_FRAME_MAGIC {
            return Err(FormatError::RawZstdStream.into());
        } else {
            return Err(FormatError::InvalidMagic(magic).into());
        }
    }
}

/// Reads a data frame of `comp_sz` compressed bytes into `comp` and probes
/// its declared uncompressed size.
fn read_data_frame<R: Read>(src: &mut R, comp: &mut Buffer, comp_sz: u32) -> Result<NextFrame> {
    if comp_sz == 0 {
        return Err(FormatError::EmptyDataFrame.into());
    }
    // A frame larger than the bound for a maximum-size block cannot be valid
    let max_comp = zstd::zstd_safe::compress_bound(MAX_BLOCK_SIZE);
    if comp_sz as usize > max_comp {
        return Err(crate::Error::Limit {
            declared: u64::from(comp_sz),
            max: max_comp as u64,
        });
    }

    comp.clear();
    comp.reserve(comp_sz as usize);
    src.read_exact(&mut comp.space_mut()[..comp_sz as usize])
        .map_err(map_truncation)?;
    comp.sz = comp_sz as usize;

    let content_size = codec::frame_content_size(comp.as_slice())?;
    if let Some(n) = content_size {
        if n > MAX_BLOCK_SIZE as u64 {
            return Err(crate::Error::Limit {
                declared: n,
                max: MAX_BLOCK_SIZE as u64,
            });
        }
    }
    Ok(NextFrame::Data { content_size })
}

/// Reads a 4-byte frame magic, distinguishing clean EOF (`None`) from a
/// truncated magic (error).
fn read_magic<R: Read>(src: &mut R) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut nread = 0;
    while nread < 4 {
        match src.read(&mut buf[nread..]) {
            Ok(0) if nread == 0 => return Ok(None),
            Ok(0) => return Err(FormatError::TruncatedFrame(nread as u64).into()),
            Ok(n) => nread += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

fn read_u32<R: Read>(src: &mut R) -> Result<u32> {
    src.read_u32::<LittleEndian>().map_err(map_truncation)
}

fn map_truncation(e: io::Error) -> crate::Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::TruncatedFrame(0).into()
    } else {
        e.into()
    }
}

/// Discards exactly `n` payload bytes from the stream.
fn skip_exact<R: Read>(src: &mut R, n: u64) -> Result<()> {
    let copied = io::copy(&mut src.by_ref().take(n), &mut io::sink())?;
    if copied != n {
        return Err(FormatError::TruncatedFrame(copied).into());
    }
    Ok(())
}
