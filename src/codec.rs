//! Zstandard wrappers used by both the synchronous paths and the worker
//! pools.
//!
//! Each thread keeps one compression and one decompression context in
//! thread-local storage, lazily created and reset between uses. Contexts are
//! freed when the thread exits.

use std::cell::RefCell;

use zstd::zstd_safe::{
    self, CCtx, CParameter, DCtx, InBuffer, OutBuffer, ResetDirective,
};

use crate::buffer::Buffer;
use crate::error::{CodecError, FormatError, Result};
use crate::MAX_BLOCK_SIZE;

thread_local! {
    static CCTX: RefCell<CCtx<'static>> = RefCell::new(CCtx::create());
    static DCTX: RefCell<DCtx<'static>> = RefCell::new(DCtx::create());
}

fn zerr(code: zstd_safe::ErrorCode) -> crate::Error {
    CodecError::Zstd(zstd_safe::get_error_name(code).to_string()).into()
}

/// Probes a compressed frame for its declared uncompressed size.
/// Returns `None` when the frame does not carry a content-size field.
pub(crate) fn frame_content_size(comp: &[u8]) -> Result<Option<u64>> {
    zstd_safe::get_frame_content_size(comp)
        .map_err(|_| CodecError::Zstd("corrupt frame header".to_string()).into())
}

/// Compresses `src` into `comp` at the given level, writing the content-size
/// and checksum fields into the frame header.
pub(crate) fn compress_into(src: &[u8], comp: &mut Buffer, level: i32) -> Result<()> {
    CCTX.with(|cell| {
        let mut cctx = cell.borrow_mut();
        cctx.reset(ResetDirective::SessionOnly).map_err(zerr)?;
        cctx.set_parameter(CParameter::CompressionLevel(level))
            .map_err(zerr)?;
        cctx.set_parameter(CParameter::ContentSizeFlag(true))
            .map_err(zerr)?;
        cctx.set_parameter(CParameter::ChecksumFlag(true))
            .map_err(zerr)?;

        let bound = zstd_safe::compress_bound(src.len());
        comp.clear();
        comp.reserve(bound);
        let n = cctx
            .compress2(&mut comp.space_mut()[..bound], src)
            .map_err(zerr)?;
        comp.sz = n;
        Ok(())
    })
}

/// Decompresses a frame into `uncomp`, using the one-shot path when the
/// declared content size is known and the streaming path otherwise.
pub(crate) fn decompress_into(
    comp: &[u8],
    uncomp: &mut Buffer,
    content_size: Option<u64>,
) -> Result<()> {
    match content_size {
        Some(n) => decompress_known(comp, uncomp, n),
        None => decompress_streaming(comp, uncomp),
    }
}

/// One-shot decompression with size verification against the frame header.
fn decompress_known(comp: &[u8], uncomp: &mut Buffer, declared: u64) -> Result<()> {
    uncomp.clear();
    uncomp.reserve(declared as usize);
    DCTX.with(|cell| {
        let mut dctx = cell.borrow_mut();
        let n = dctx
            .decompress(&mut uncomp.space_mut()[..declared as usize], comp)
            .map_err(zerr)?;
        if n as u64 != declared {
            return Err(CodecError::SizeMismatch(declared, n as u64).into());
        }
        uncomp.sz = n;
        uncomp.pos = 0;
        Ok(())
    })
}

/// Streaming decompression for frames without a content-size field (as
/// produced by pzstd). The output buffer grows with the observed compression
/// ratio plus 5% headroom and a 1000-byte bias; if it saturates after all
/// input is consumed it grows by 1.5x plus 100,000 bytes.
fn decompress_streaming(comp: &[u8], uncomp: &mut Buffer) -> Result<()> {
    DCTX.with(|cell| {
        let mut dctx = cell.borrow_mut();
        dctx.reset(ResetDirective::SessionOnly).map_err(zerr)?;

        let mut cap = (comp.len() * 2 + 1000).min(MAX_BLOCK_SIZE);
        let mut written = 0usize;
        let mut in_buf = InBuffer::around(comp);
        uncomp.clear();
        uncomp.reserve(cap);

        loop {
            let mut out = OutBuffer::around_pos(&mut uncomp.space_mut()[..cap], written);
            let hint = dctx.decompress_stream(&mut out, &mut in_buf).map_err(zerr)?;
            written = out.pos();

            if hint == 0 {
                if in_buf.pos < comp.len() {
                    return Err(
                        CodecError::Zstd("trailing bytes after frame".to_string()).into()
                    );
                }
                break;
            }
            if written == cap {
                let grown = if in_buf.pos < comp.len() {
                    let ratio = written as f64 / in_buf.pos.max(1) as f64;
                    ((comp.len() as f64 * ratio * 1.05) as usize + 1000).max(cap + 1000)
                } else {
                    written + written / 2 + 100_000
                };
                let grown = grown.min(MAX_BLOCK_SIZE);
                if grown <= cap {
                    return Err(crate::Error::Limit {
                        declared: grown as u64 + 1,
                        max: MAX_BLOCK_SIZE as u64,
                    });
                }
                cap = grown;
                uncomp.reserve(cap);
            } else if in_buf.pos >= comp.len() {
                // The stream wants more input but the frame is exhausted
                return Err(FormatError::TruncatedFrame(in_buf.pos as u64).into());
            }
        }

        uncomp.sz = written;
        uncomp.pos = 0;
        Ok(())
    })
}
