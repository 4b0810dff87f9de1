//! Writer for BGZF2 streams.
//!
//! The writer fills an uncompressed block buffer and emits one preface plus
//! one Zstd data frame per flush, recording every frame in the seekable
//! index. The index (and the genomic index, when ranges were registered) is
//! appended when the writer finishes.
//!
//! With a thread pool attached the flush path changes shape: the caller
//! thread copies the block into a recycled job and dispatches a compression
//! task; a dedicated I/O thread consumes finished jobs in dispatch order,
//! writes the frames, and owns all index state until the writer is finished.
//!
//! # Example
//!
//! ```rust,no_run
//! use bgzf2::Writer;
//! use std::fs::File;
//!
//! let file = File::create("example.bgz2").unwrap();
//! let mut writer = Writer::<File>::builder()
//!     .level(7)
//!     .block_size(65536)
//!     .build(file)
//!     .unwrap();
//! writer.write(b"some payload", true).unwrap();
//! writer.finish().unwrap();
//! ```

use std::io::Write;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::Buffer;
use crate::codec;
use crate::error::{Error, Result};
use crate::frame;
use crate::index::{GenomicIndex, SeekableIndex};
use crate::job::{Job, JobPool};
use crate::pool::{ProcessQueue, Reserve, ThreadPool};
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_LEVEL, MAX_BLOCK_SIZE};

/// Blocks written between flushes of the underlying sink on the I/O thread
const SYNC_INTERVAL: u32 = 32;

/// A builder for configured [`Writer`] instances.
#[derive(Debug, Clone)]
pub struct WriterBuilder {
    level: i32,
    block_size: usize,
}

impl Default for WriterBuilder {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl WriterBuilder {
    /// Sets the Zstd compression level. Levels outside the codec's supported
    /// range are clamped by the codec itself.
    #[must_use]
    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Sets the target uncompressed bytes per data frame.
    #[must_use]
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Builds a [`Writer`] over `sink` with the configured settings.
    pub fn build<W: Write>(self, sink: W) -> Result<Writer<W>> {
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::Limit {
                declared: self.block_size as u64,
                max: MAX_BLOCK_SIZE as u64,
            });
        }
        let block_size = self.block_size.max(1);
        let mut uncomp = Buffer::with_capacity(block_size);
        uncomp.sz = block_size;
        Ok(Writer {
            io: Some(IoState {
                sink,
                index: SeekableIndex::default(),
                wrote_header: false,
                blocks_since_sync: 0,
            }),
            level: self.level,
            uncomp,
            comp: Buffer::default(),
            genomic: GenomicIndex::default(),
            frame_pos: 0,
            last_flush_try: 0,
            finished: false,
            pipeline: None,
        })
    }
}

/// Sink-side state: the file handle, the seekable index, and the header
/// bookkeeping. Owned by the caller thread until a pool is attached, then by
/// the dedicated I/O thread until the writer finishes.
struct IoState<W> {
    sink: W,
    index: SeekableIndex,
    wrote_header: bool,
    blocks_since_sync: u32,
}

impl<W: Write> IoState<W> {
    /// Emits the frames for one block: the header frame on the first call,
    /// then the preface and the data frame, with matching index entries.
    fn write_block(&mut self, uncomp: &[u8], comp: &[u8]) -> Result<()> {
        if !self.wrote_header {
            let sz = frame::write_header_frame(&mut self.sink, uncomp)?;
            self.index.push(0, sz);
            self.wrote_header = true;
        }
        frame::write_preface(&mut self.sink, comp.len() as u32)?;
        self.index.push(0, frame::PREFACE_FRAME_SIZE);
        self.index.push(uncomp.len() as u32, comp.len() as u32);
        self.sink.write_all(comp)?;
        Ok(())
    }

    /// Periodic sink flush, amortised over [`SYNC_INTERVAL`] blocks.
    fn maybe_sync(&mut self) -> Result<()> {
        self.blocks_since_sync += 1;
        if self.blocks_since_sync >= SYNC_INTERVAL {
            self.blocks_since_sync = 0;
            self.sink.flush()?;
        }
        Ok(())
    }

    /// Appends the trailing index frames: genomic first (when non-empty),
    /// then the seekable index, which must come last in the file.
    fn write_trailer(&mut self, genomic: &GenomicIndex) -> Result<()> {
        if !genomic.is_empty() {
            genomic.write_to(&mut self.sink)?;
        }
        self.index.write_to(&mut self.sink)?;
        self.sink.flush()?;
        Ok(())
    }
}

struct EncodeState {
    jobs: JobPool,
    jobs_pending: usize,
    error: Option<Error>,
    failed: bool,
}

struct EncodeShared {
    state: Mutex<EncodeState>,
}

struct EncodePipeline<W> {
    pool: Arc<ThreadPool>,
    queue: Arc<ProcessQueue<Job>>,
    shared: Arc<EncodeShared>,
    io_thread: Option<thread::JoinHandle<IoState<W>>>,
}

/// Writer for BGZF2 streams. See the [module docs](self) for the file
/// structure and the threading model.
pub struct Writer<W: Write> {
    /// `None` while the I/O thread owns the sink and index
    io: Option<IoState<W>>,
    level: i32,
    /// Block accumulation buffer: `sz` is the target block size, `pos` the
    /// number of buffered bytes awaiting flush
    uncomp: Buffer,
    /// Compressed scratch for the synchronous path
    comp: Buffer,
    genomic: GenomicIndex,
    /// Uncompressed offset at which the next data frame starts
    frame_pos: u64,
    /// Buffered offset of the most recent record-group start, reset on flush
    last_flush_try: usize,
    finished: bool,
    pipeline: Option<EncodePipeline<W>>,
}

impl<W: Write> Writer<W> {
    /// Returns a builder for configuring a writer.
    #[must_use]
    pub fn builder() -> WriterBuilder {
        WriterBuilder::default()
    }

    /// The configured compression level
    #[must_use]
    pub fn level(&self) -> i32 {
        self.level
    }

    /// The current target block size
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.uncomp.sz
    }

    /// Changes the target block size, flushing any buffered data first.
    pub fn set_block_size(&mut self, block_size: usize) -> Result<()> {
        if block_size > MAX_BLOCK_SIZE {
            return Err(Error::Limit {
                declared: block_size as u64,
                max: MAX_BLOCK_SIZE as u64,
            });
        }
        self.flush()?;
        let block_size = block_size.max(1);
        self.uncomp.reserve(block_size);
        self.uncomp.sz = block_size;
        Ok(())
    }

    /// Appends `buf` to the stream.
    ///
    /// With `can_split` the bytes may straddle any block boundary. Without
    /// it, the write either fits in the current block (flushing a full one
    /// first if needed) or, when `buf` is at least a whole block long, is
    /// emitted as a standalone frame of exactly `buf.len()` bytes.
    ///
    /// Returns the number of bytes consumed, which is `buf.len()` unless an
    /// error occurs.
    pub fn write(&mut self, buf: &[u8], can_split: bool) -> Result<usize> {
        self.check_pipeline_error()?;
        let mut remaining = buf;
        let mut written = 0;
        while !remaining.is_empty() {
            let block_size = self.uncomp.sz;
            if self.uncomp.pos == block_size {
                self.flush()?;
            }
            let space = block_size - self.uncomp.pos;
            let consumes = space.min(remaining.len());

            if consumes == remaining.len() || can_split {
                // Whole item, or splitting is allowed
                self.uncomp.push(&remaining[..consumes]);
                remaining = &remaining[consumes..];
                written += consumes;
            } else {
                // Can't split and doesn't fit: flush, and emit oversize
                // items as their own standalone frame
                self.flush()?;
                if remaining.len() >= block_size {
                    if remaining.len() > MAX_BLOCK_SIZE {
                        return Err(Error::Limit {
                            declared: remaining.len() as u64,
                            max: MAX_BLOCK_SIZE as u64,
                        });
                    }
                    self.emit_block(remaining)?;
                    self.frame_pos += remaining.len() as u64;
                    self.last_flush_try = 0;
                    written += remaining.len();
                    remaining = &[];
                }
                // else it fits on the next loop iteration now that we flushed
            }
        }
        Ok(written)
    }

    /// Flushes the buffered block, if any, as one preface + data frame pair.
    pub fn flush(&mut self) -> Result<()> {
        self.check_pipeline_error()?;
        if self.uncomp.pos == 0 {
            return Ok(());
        }
        let block = std::mem::take(&mut self.uncomp);
        let result = self.emit_block(block.filled());
        let flushed = block.pos;
        self.uncomp = block;
        self.uncomp.pos = 0;
        self.last_flush_try = 0;
        result?;
        self.frame_pos += flushed as u64;
        Ok(())
    }

    /// Flushes now if appending `size` more bytes would overflow the block;
    /// otherwise records the current fill level as a record-group start for
    /// the genomic index.
    pub fn flush_try(&mut self, size: usize) -> Result<()> {
        if self.uncomp.pos + size > self.uncomp.sz {
            self.flush()
        } else {
            self.last_flush_try = self.uncomp.pos;
            Ok(())
        }
    }

    /// Registers a record range on reference `tid` (use `-1` for unmapped)
    /// starting in the current or upcoming data frame. Builds the genomic
    /// index that is appended when the writer finishes.
    pub fn idx_add(&mut self, tid: i32, begin: i64, end: i64) -> Result<()> {
        self.genomic.add(
            tid,
            begin,
            end,
            self.frame_pos,
            self.frame_pos + self.last_flush_try as u64,
        )
    }

    /// Compresses and writes one block, through the pipeline when attached.
    fn emit_block(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(pipeline) = &self.pipeline {
            let mut job = pipeline.shared.state.lock().jobs.alloc();
            job.uncomp.clear();
            job.uncomp.push(bytes);

            let ticket = match pipeline.queue.reserve() {
                Reserve::Slot(ticket) => ticket,
                _ => return Err(Error::Resource("encode queue is shut down")),
            };
            pipeline.shared.state.lock().jobs_pending += 1;

            let shared = pipeline.shared.clone();
            let queue = pipeline.queue.clone();
            let level = self.level;
            let dispatched = pipeline.pool.execute(move || {
                let mut job = job;
                if let Err(e) = codec::compress_into(job.uncomp.as_slice(), &mut job.comp, level)
                {
                    job.errcode = Some(e);
                }
                if let Some(job) = queue.complete(ticket, job) {
                    // Queue reset or shut down under us: recycle directly
                    let mut state = shared.state.lock();
                    state.jobs_pending -= 1;
                    state.jobs.release(job);
                }
            });
            if dispatched.is_err() {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.shared.state.lock().jobs_pending -= 1;
                }
            }
            dispatched
        } else {
            codec::compress_into(bytes, &mut self.comp, self.level)?;
            let io = self
                .io
                .as_mut()
                .ok_or(Error::Resource("writer sink unavailable"))?;
            io.write_block(bytes, self.comp.as_slice())
        }
    }

    /// Surfaces an error latched by the I/O thread at this entry point.
    fn check_pipeline_error(&mut self) -> Result<()> {
        if let Some(pipeline) = &self.pipeline {
            let mut state = pipeline.shared.state.lock();
            if let Some(e) = state.error.take() {
                state.failed = true;
                return Err(e);
            }
            if state.failed {
                return Err(Error::Resource("writer pipeline previously failed"));
            }
        }
        Ok(())
    }

    /// Flushes remaining data, drains the pipeline, writes the genomic index
    /// (when ranges were registered) and the seekable index, and flushes the
    /// sink. Called automatically on drop, but calling it explicitly is the
    /// only way to observe errors.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let flushed = self.flush();

        if let Some(mut pipeline) = self.pipeline.take() {
            // An end-of-stream job ordered after every dispatched block
            let mut sentinel = pipeline.shared.state.lock().jobs.alloc();
            sentinel.hit_eof = true;
            match pipeline.queue.reserve() {
                Reserve::Slot(ticket) => {
                    pipeline.queue.complete(ticket, sentinel);
                }
                _ => return Err(Error::Resource("encode queue is shut down")),
            }

            let io = pipeline
                .io_thread
                .take()
                .expect("I/O thread running")
                .join()
                .map_err(|_| Error::Resource("writer I/O thread panicked"))?;
            pipeline.queue.shutdown();
            self.io = Some(io);

            let mut state = pipeline.shared.state.lock();
            debug_assert_eq!(state.jobs_pending, 0);
            if let Some(e) = state.error.take() {
                state.failed = true;
                return Err(e);
            }
        }
        flushed?;

        let io = self
            .io
            .as_mut()
            .ok_or(Error::Resource("writer sink unavailable"))?;
        io.write_trailer(&self.genomic)
    }
}

impl<W: Write + Send + 'static> Writer<W> {
    /// Attaches a worker pool: subsequent flushes dispatch compression jobs
    /// and a dedicated I/O thread writes finished frames in dispatch order.
    /// `queue_size` bounds the in-flight blocks; `0` selects twice the pool's
    /// worker count.
    pub fn attach_thread_pool(&mut self, pool: Arc<ThreadPool>, queue_size: usize) -> Result<()> {
        if self.pipeline.is_some() {
            return Err(Error::Resource("thread pool already attached"));
        }
        // Anything buffered so far goes through the synchronous path
        self.flush()?;

        let depth = if queue_size == 0 {
            2 * pool.workers()
        } else {
            queue_size
        };
        let queue = Arc::new(ProcessQueue::new(depth));
        let shared = Arc::new(EncodeShared {
            state: Mutex::new(EncodeState {
                jobs: JobPool::default(),
                jobs_pending: 0,
                error: None,
                failed: false,
            }),
        });

        let io = self
            .io
            .take()
            .ok_or(Error::Resource("writer sink unavailable"))?;
        debug!(workers = pool.workers(), depth, "starting encode pipeline");

        let thread_queue = queue.clone();
        let thread_shared = shared.clone();
        let io_thread = thread::Builder::new()
            .name("bgzf2-writer-io".to_string())
            .spawn(move || writer_io_thread(io, thread_shared, thread_queue))
            .map_err(|_| Error::Resource("failed to spawn writer I/O thread"))?;

        self.pipeline = Some(EncodePipeline {
            pool,
            queue,
            shared,
            io_thread: Some(io_thread),
        });
        Ok(())
    }

    /// Finishes the stream and returns the underlying sink.
    pub fn into_inner(mut self) -> Result<W> {
        self.finish()?;
        Ok(self
            .io
            .take()
            .expect("sink present after finish")
            .sink)
    }
}

/// The dedicated I/O thread: consumes compressed jobs in dispatch order,
/// writes their frames, maintains the index, and recycles the jobs. Errors
/// are latched for the next caller entry point; consumption continues so the
/// queue still drains.
fn writer_io_thread<W: Write>(
    mut io: IoState<W>,
    shared: Arc<EncodeShared>,
    queue: Arc<ProcessQueue<Job>>,
) -> IoState<W> {
    let mut last_job_num = None;
    while let Some(mut job) = queue.next_result() {
        // Jobs arrive in dispatch order; job numbers are issued in the same
        // order by the single dispatcher
        debug_assert!(last_job_num.map_or(true, |n| job.job_num > n));
        last_job_num = Some(job.job_num);

        if job.hit_eof {
            shared.state.lock().jobs.release(job);
            break;
        }
        let result = match job.errcode.take() {
            Some(e) => Err(e),
            None => io
                .write_block(job.uncomp.as_slice(), job.comp.as_slice())
                .and_then(|()| io.maybe_sync()),
        };

        let mut state = shared.state.lock();
        state.jobs_pending -= 1;
        if let Err(e) = result {
            debug!("writer I/O thread latched error: {e}");
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        state.jobs.release(job);
    }
    io
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish();
        }
    }
}

impl<W: Write> std::io::Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Writer::write(self, buf, true).map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Writer::flush(self).map_err(std::io::Error::other)
    }
}
