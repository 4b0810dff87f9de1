#![doc = include_str!("../README.md")]
//!
//! # Format
//!
//! A BGZF2 file is a sequence of Zstd frames:
//!
//! ```text
//! [header skippable frame]                           (written on first flush)
//! { [preface skippable frame] [Zstd data frame] }*   (one pair per block)
//! [genomic index skippable frame]                    (only when ranges were registered)
//! [seekable index skippable frame]                   (always, on finish)
//! ```
//!
//! Every skippable frame is ignored by conforming Zstd decoders, so the file
//! as a whole remains a valid Zstd stream. The preface before each data frame
//! carries that frame's compressed size (pzstd compatible), which is what
//! lets the parallel decoder dispatch whole frames without an index scan. The
//! trailing seekable index lists the compressed and uncompressed size of
//! every frame for random access by uncompressed offset.

#![allow(clippy::module_inception)]

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Buffer primitives shared by the readers, writers, and jobs
mod buffer;

/// Zstd context management and block (de)compression
mod codec;

/// Error definitions
pub mod error;

/// On-disk frame codec
mod frame;

/// Seekable and genomic index frames
pub mod index;

/// Pipeline jobs and their free list
mod job;

/// Worker pool and ordered result queue
mod pool;

/// Stream reader and parallel decoder
pub mod reader;

/// Stream writer and parallel encoder
pub mod writer;

pub use error::{CodecError, Error, FormatError, IndexError, Result};
pub use index::{GenomicEntry, GenomicIndex, SeekTarget, SeekableEntry, SeekableIndex};
pub use pool::ThreadPool;
pub use reader::{EofStatus, Reader};
pub use writer::{Writer, WriterBuilder};

/// Default target uncompressed bytes per data frame
pub const DEFAULT_BLOCK_SIZE: usize = 256_000;

/// Default Zstd compression level
pub const DEFAULT_LEVEL: i32 = 5;

/// Maximum uncompressed bytes per data frame. Frames declaring more are
/// rejected on read.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

/// A file opened by [`open`], in either direction.
pub enum Bgzf2 {
    Read(Box<Reader<BufReader<File>>>),
    Write(Box<Writer<BufWriter<File>>>),
}

impl Bgzf2 {
    /// Reads up to `buf.len()` bytes; 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Read(reader) => reader.read(buf),
            Self::Write(_) => Err(Error::InvalidMode("read on write handle".to_string())),
        }
    }

    /// Appends `buf` to the stream; see [`Writer::write`] for `can_split`.
    pub fn write(&mut self, buf: &[u8], can_split: bool) -> Result<usize> {
        match self {
            Self::Write(writer) => writer.write(buf, can_split),
            Self::Read(_) => Err(Error::InvalidMode("write on read handle".to_string())),
        }
    }

    /// Repositions a read handle at an uncompressed offset.
    pub fn seek(&mut self, upos: u64) -> Result<()> {
        match self {
            Self::Read(reader) => reader.seek(upos),
            Self::Write(_) => Err(Error::InvalidMode("seek on write handle".to_string())),
        }
    }

    /// Flushes the buffered block of a write handle.
    pub fn flush(&mut self) -> Result<()> {
        match self {
            Self::Write(writer) => writer.flush(),
            Self::Read(_) => Ok(()),
        }
    }

    /// Changes the target block size of a write handle; see
    /// [`Writer::set_block_size`].
    pub fn set_block_size(&mut self, block_size: usize) -> Result<()> {
        match self {
            Self::Write(writer) => writer.set_block_size(block_size),
            Self::Read(_) => Err(Error::InvalidMode(
                "set_block_size on read handle".to_string(),
            )),
        }
    }

    /// Flushes if `size` more bytes would overflow the current block; see
    /// [`Writer::flush_try`].
    pub fn flush_try(&mut self, size: usize) -> Result<()> {
        match self {
            Self::Write(writer) => writer.flush_try(size),
            Self::Read(_) => Err(Error::InvalidMode("flush_try on read handle".to_string())),
        }
    }

    /// Registers a genomic range on a write handle; see [`Writer::idx_add`].
    pub fn idx_add(&mut self, tid: i32, begin: i64, end: i64) -> Result<()> {
        match self {
            Self::Write(writer) => writer.idx_add(tid, begin, end),
            Self::Read(_) => Err(Error::InvalidMode("idx_add on read handle".to_string())),
        }
    }

    /// Resolves a genomic range query on a read handle; see
    /// [`Reader::query`].
    pub fn query(&mut self, tid: i32, begin: i64, end: i64) -> Result<Option<u64>> {
        match self {
            Self::Read(reader) => reader.query(tid, begin, end),
            Self::Write(_) => Err(Error::InvalidMode("query on write handle".to_string())),
        }
    }

    /// Loads the seekable index of a read handle eagerly; see
    /// [`Reader::load_seekable_index`].
    pub fn load_seekable_index(&mut self) -> Result<()> {
        match self {
            Self::Read(reader) => reader.load_seekable_index(),
            Self::Write(_) => Err(Error::InvalidMode(
                "load_seekable_index on write handle".to_string(),
            )),
        }
    }

    /// Checks a read handle for the trailing EOF marker; see
    /// [`Reader::check_eof`].
    pub fn check_eof(&mut self) -> Result<EofStatus> {
        match self {
            Self::Read(reader) => reader.check_eof(),
            Self::Write(_) => Err(Error::InvalidMode("check_eof on write handle".to_string())),
        }
    }

    /// Returns the next byte of a read handle without consuming it.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        match self {
            Self::Read(reader) => reader.peek(),
            Self::Write(_) => Err(Error::InvalidMode("peek on write handle".to_string())),
        }
    }

    /// Reads one delimited line from a read handle; see [`Reader::getline`].
    pub fn getline(&mut self, delim: u8, out: &mut Vec<u8>) -> Result<Option<usize>> {
        match self {
            Self::Read(reader) => reader.getline(delim, out),
            Self::Write(_) => Err(Error::InvalidMode("getline on write handle".to_string())),
        }
    }

    /// Attaches a worker pool to either side of the handle; see
    /// [`Reader::attach_thread_pool`] and [`Writer::attach_thread_pool`].
    pub fn attach_thread_pool(
        &mut self,
        pool: std::sync::Arc<ThreadPool>,
        queue_size: usize,
    ) -> Result<()> {
        match self {
            Self::Read(reader) => reader.attach_thread_pool(pool, queue_size),
            Self::Write(writer) => writer.attach_thread_pool(pool, queue_size),
        }
    }

    /// Finishes and closes the handle. For writers this appends the trailing
    /// index frames.
    pub fn close(self) -> Result<()> {
        match self {
            Self::Read(_) => Ok(()),
            Self::Write(mut writer) => writer.finish(),
        }
    }
}

/// Opens `path` with a mode string: `"r"` to read, `"w"` to write at the
/// default level, or `"w1"` through `"w19"` to choose a compression level.
pub fn open<P: AsRef<Path>>(path: P, mode: &str) -> Result<Bgzf2> {
    match parse_mode(mode)? {
        Mode::Read => {
            let file = File::open(path)?;
            Ok(Bgzf2::Read(Box::new(Reader::new(BufReader::new(file)))))
        }
        Mode::Write(level) => {
            let file = File::create(path)?;
            let writer = Writer::<BufWriter<File>>::builder()
                .level(level)
                .build(BufWriter::new(file))?;
            Ok(Bgzf2::Write(Box::new(writer)))
        }
    }
}

enum Mode {
    Read,
    Write(i32),
}

fn parse_mode(mode: &str) -> Result<Mode> {
    match mode.split_at(1.min(mode.len())) {
        ("r", "") => Ok(Mode::Read),
        ("w", "") => Ok(Mode::Write(DEFAULT_LEVEL)),
        ("w", digits) => digits
            .parse::<i32>()
            .ok()
            .filter(|level| *level >= 1)
            .map(Mode::Write)
            .ok_or_else(|| Error::InvalidMode(mode.to_string())),
        _ => Err(Error::InvalidMode(mode.to_string())),
    }
}
