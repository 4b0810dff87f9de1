use std::io;

/// Custom Result type for bgzf2 operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the bgzf2 library, encompassing all possible error
/// cases that can occur while reading or writing block-compressed streams.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Standard I/O errors from the underlying file handle
    #[error("Error with IO: {0}")]
    Io(#[from] io::Error),

    /// Errors related to the on-disk frame layout
    #[error("Error processing frame: {0}")]
    Format(#[from] FormatError),

    /// Errors related to the seekable or genomic index
    #[error("Error processing index: {0}")]
    Index(#[from] IndexError),

    /// Errors reported by the Zstandard codec
    #[error("Error in codec: {0}")]
    Codec(#[from] CodecError),

    /// A frame declared an uncompressed size beyond the permitted maximum
    #[error("Declared uncompressed size ({declared}) exceeds maximum block size ({max})")]
    Limit { declared: u64, max: u64 },

    /// A seek or query addressed a position past the end of the data
    #[error("Requested position ({requested}) is past end of data ({available})")]
    Range { requested: u64, available: u64 },

    /// Seeking was required on a stream that does not support it
    #[error("Stream is not seekable")]
    NonSeekable,

    /// A seek or query required an index that is not present
    #[error("No index found in file")]
    NoIndex,

    /// The mode string passed to `open` was not recognised
    #[error("Invalid open mode: {0:?}")]
    InvalidMode(String),

    /// A worker pool or I/O thread could not service the request
    #[error("Resource failure: {0}")]
    Resource(&'static str),
}

/// Errors related to parsing and validating on-disk frames
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    /// A frame began with a magic number that is neither a Zstd data frame
    /// nor a skippable frame
    #[error("Invalid frame magic number: {0:#010x}")]
    InvalidMagic(u32),

    /// The stream ended in the middle of a frame
    #[error("Frame truncated after {0} bytes")]
    TruncatedFrame(u64),

    /// A frame's declared payload length disagrees with its content
    #[error("Frame length mismatch: declared {declared}, expected {expected}")]
    LengthMismatch { declared: u32, expected: u32 },

    /// Reserved flag bits were set in an index footer
    #[error("Reserved flag bits set in index footer: {0:#04x}")]
    ReservedBits(u8),

    /// A data frame appeared without a preceding preface frame. Decoding a
    /// raw Zstd stream is not supported.
    #[error("Zstd data frame without preface frame (raw zstd stream?)")]
    RawZstdStream,

    /// A preface frame declared a zero-length data frame
    #[error("Preface frame declares an empty data frame")]
    EmptyDataFrame,
}

/// Errors related to building and querying the genomic index
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// A genomic coordinate does not fit the 32-bit on-disk representation
    #[error("Genomic coordinate {0} does not fit the 32-bit on-disk format")]
    CoordinateOverflow(i64),

    /// A reference id below the unmapped sentinel (-1) was supplied
    #[error("Invalid reference id: {0}")]
    InvalidReference(i32),

    /// The genomic index frame is internally inconsistent
    #[error("Genomic index frame corrupt: {0}")]
    Corrupt(&'static str),
}

/// Errors reported by Zstandard, or mismatches between declared and actual
/// decompressed sizes
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The underlying codec reported an error
    #[error("Zstd error: {0}")]
    Zstd(String),

    /// A frame decompressed to a different size than its header declared
    ///
    /// The first parameter is the declared size, the second the actual size
    #[error("Decompressed size mismatch: declared {0}, got {1}")]
    SizeMismatch(u64, u64),
}

impl Error {
    /// Maps a failed seek to [`Error::NonSeekable`] when the underlying
    /// stream reports it cannot seek (ESPIPE), and to [`Error::Io`] otherwise.
    pub(crate) fn from_seek(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotSeekable || e.raw_os_error() == Some(29) {
            Self::NonSeekable
        } else {
            Self::Io(e)
        }
    }
}
