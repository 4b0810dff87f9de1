//! Reader for BGZF2 streams.
//!
//! The synchronous path parses one preface + data frame pair at a time,
//! decompresses it into the current block buffer, and serves byte reads,
//! peeks, and line reads from it. Random access goes through the trailing
//! seekable index; genomic range queries through the optional genomic index.
//!
//! With a thread pool attached, a dedicated reader thread owns the file
//! handle: it parses frame headers (the preface makes the compressed size of
//! every data frame known up front), dispatches whole-frame decompression
//! jobs to the pool, and services a command channel for mid-stream seeks and
//! shutdown. The caller thread consumes decompressed blocks strictly in file
//! order from the ordered queue.
//!
//! ## Reader thread states
//!
//! The reader thread is a small state machine: `Reading` (steady-state
//! dispatch), `AfterEof` (input exhausted, waiting on the command channel; a
//! seek restarts it), and `Shutdown`. On end of input it dispatches a
//! sentinel job so the consumer observes EOF strictly after all data.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread;

use byteorder::{LittleEndian, ReadBytesExt};
use memchr::memchr;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::buffer::Buffer;
use crate::codec;
use crate::error::{Error, IndexError, Result};
use crate::frame::{self, NextFrame, SEEKABLE_FOOTER_MAGIC};
use crate::index::{GenomicIndex, SeekableIndex};
use crate::job::{Job, JobPool};
use crate::pool::{ProcessQueue, Reserve, ThreadPool};

/// Result of probing a stream for the trailing end-of-file marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofStatus {
    /// The trailing seekable-index magic is present
    Present,
    /// The marker is absent; the file was not closed cleanly or is not BGZF2
    Absent,
    /// The stream cannot seek, so the marker cannot be checked
    NonSeekable,
}

/// Commands exchanged with the reader thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmd {
    None,
    Seek,
    SeekDone,
    SeekFail,
    HasEof,
    HasEofDone,
    Close,
}

struct CommandState {
    cmd: Cmd,
    /// Absolute target while a seek is pending; rewritten to the intra-block
    /// offset once the reader thread has repositioned the file
    seek_to: u64,
    error: Option<Error>,
    eof_status: EofStatus,
}

struct CommandChannel {
    state: Mutex<CommandState>,
    cond: Condvar,
}

impl CommandChannel {
    fn new() -> Self {
        Self {
            state: Mutex::new(CommandState {
                cmd: Cmd::None,
                seek_to: 0,
                error: None,
                eof_status: EofStatus::Absent,
            }),
            cond: Condvar::new(),
        }
    }
}

struct DecodeShared {
    command: CommandChannel,
    jobs: Mutex<JobPool>,
}

struct DecodePipeline {
    queue: Arc<ProcessQueue<Job>>,
    shared: Arc<DecodeShared>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

/// Reader for BGZF2 streams. See the [module docs](self) for the threading
/// model.
pub struct Reader<R> {
    /// `None` while the reader thread owns the handle
    src: Option<R>,
    /// Current decoded block: `sz` is the decompressed length, `pos` the
    /// consumer cursor
    uncomp: Buffer,
    /// Compressed scratch for the synchronous path
    comp: Buffer,
    index: Option<SeekableIndex>,
    genomic: Option<GenomicIndex>,
    genomic_loaded: bool,
    eof: bool,
    pipeline: Option<DecodePipeline>,
}

impl<R> Reader<R> {
    /// Wraps a stream. No bytes are consumed until the first read.
    #[must_use]
    pub fn new(src: R) -> Self {
        Self {
            src: Some(src),
            uncomp: Buffer::default(),
            comp: Buffer::default(),
            index: None,
            genomic: None,
            genomic_loaded: false,
            eof: false,
            pipeline: None,
        }
    }

    /// The loaded seekable index, if any.
    #[must_use]
    pub fn index(&self) -> Option<&SeekableIndex> {
        self.index.as_ref()
    }

    /// Consumes the next decoded block from the pipeline, in file order.
    fn decode_block_mt(&mut self) -> Result<()> {
        let (queue, shared) = {
            let pipeline = self.pipeline.as_ref().expect("pipeline attached");
            (pipeline.queue.clone(), pipeline.shared.clone())
        };
        let Some(mut job) = queue.next_result() else {
            return Err(Error::Resource("decode queue is shut down"));
        };
        if let Some(e) = job.errcode.take() {
            self.eof = true;
            self.uncomp.clear();
            shared.jobs.lock().release(job);
            return Err(e);
        }
        if job.hit_eof {
            self.eof = true;
            self.uncomp.clear();
            shared.jobs.lock().release(job);
            return Ok(());
        }

        // Swap the decoded block in; the old buffer rides back to the free
        // list with the job
        std::mem::swap(&mut self.uncomp, &mut job.uncomp);
        self.uncomp.pos = 0;

        // Apply the intra-block offset left behind by a completed seek
        {
            let mut cs = shared.command.state.lock();
            if cs.seek_to != 0 {
                self.uncomp.pos = (cs.seek_to as usize).min(self.uncomp.sz);
                cs.seek_to = 0;
            }
        }
        shared.jobs.lock().release(job);
        Ok(())
    }

    /// Requests a seek from the reader thread and waits for the outcome.
    fn seek_mt(&mut self, upos: u64) -> Result<()> {
        let (queue, shared) = {
            let pipeline = self.pipeline.as_ref().expect("pipeline attached");
            (pipeline.queue.clone(), pipeline.shared.clone())
        };
        {
            let mut cs = shared.command.state.lock();
            cs.cmd = Cmd::Seek;
            cs.seek_to = upos;
            cs.error = None;
            shared.command.cond.notify_all();
        }
        // The reader thread may be blocked waiting for queue space
        queue.interrupt();

        let mut cs = shared.command.state.lock();
        loop {
            match cs.cmd {
                Cmd::SeekDone => {
                    cs.cmd = Cmd::None;
                    self.eof = false;
                    self.uncomp.clear();
                    return Ok(());
                }
                Cmd::SeekFail => {
                    cs.cmd = Cmd::None;
                    let e = cs
                        .error
                        .take()
                        .unwrap_or(Error::Resource("seek failed on reader thread"));
                    drop(cs);
                    self.eof = true;
                    self.uncomp.clear();
                    return Err(e);
                }
                // Spurious wakeup before the reader thread saw the command
                Cmd::Seek => {
                    shared.command.cond.notify_all();
                }
                _ => {}
            }
            shared.command.cond.wait(&mut cs);
        }
    }

    /// Probes the EOF marker through the reader thread.
    fn check_eof_mt(&mut self) -> Result<EofStatus> {
        let (queue, shared) = {
            let pipeline = self.pipeline.as_ref().expect("pipeline attached");
            (pipeline.queue.clone(), pipeline.shared.clone())
        };
        {
            let mut cs = shared.command.state.lock();
            cs.cmd = Cmd::HasEof;
            cs.error = None;
            shared.command.cond.notify_all();
        }
        queue.interrupt();

        let mut cs = shared.command.state.lock();
        loop {
            match cs.cmd {
                Cmd::HasEofDone => {
                    cs.cmd = Cmd::None;
                    if let Some(e) = cs.error.take() {
                        return Err(e);
                    }
                    return Ok(cs.eof_status);
                }
                Cmd::HasEof => {
                    shared.command.cond.notify_all();
                }
                _ => {}
            }
            shared.command.cond.wait(&mut cs);
        }
    }

    /// Stops the reader thread and tears down the queue.
    fn shutdown_pipeline(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            {
                let mut cs = pipeline.shared.command.state.lock();
                cs.cmd = Cmd::Close;
                pipeline.shared.command.cond.notify_all();
            }
            pipeline.queue.interrupt();
            if let Some(handle) = pipeline.reader_thread.take() {
                let _ = handle.join();
            }
            pipeline.queue.shutdown();
        }
    }
}

impl<R: Read> Reader<R> {
    /// Decodes the next block into the current buffer, through the pipeline
    /// when one is attached.
    fn fill(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            self.decode_block_mt()
        } else {
            self.read_block()
        }
    }

    /// Synchronous path: parse the next data frame and decompress it.
    fn read_block(&mut self) -> Result<()> {
        let src = self
            .src
            .as_mut()
            .ok_or(Error::Resource("file handle owned by reader thread"))?;
        match frame::read_next_frame(src, &mut self.comp)? {
            NextFrame::Data { content_size } => {
                codec::decompress_into(self.comp.as_slice(), &mut self.uncomp, content_size)
            }
            NextFrame::Eof => {
                self.eof = true;
                self.uncomp.clear();
                Ok(())
            }
        }
    }

    /// Reads up to `buf.len()` bytes. Returns 0 at end of stream, and keeps
    /// returning 0 on subsequent calls.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            if self.uncomp.pos == self.uncomp.sz {
                if self.eof {
                    break;
                }
                self.fill()?;
                continue;
            }
            let chunk = self.uncomp.remaining();
            let n = chunk.len().min(buf.len() - total);
            buf[total..total + n].copy_from_slice(&chunk[..n]);
            self.uncomp.pos += n;
            total += n;
        }
        Ok(total)
    }

    /// Returns up to `n` bytes of the current block without copying,
    /// advancing the cursor. Shorter slices occur at block boundaries; an
    /// empty slice means end of stream.
    pub fn read_zero_copy(&mut self, n: usize) -> Result<&[u8]> {
        while self.uncomp.pos == self.uncomp.sz {
            if self.eof {
                return Ok(&[]);
            }
            self.fill()?;
        }
        Ok(self.uncomp.take(n))
    }

    /// Returns the next byte without consuming it, or `None` at end of
    /// stream.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        while self.uncomp.pos == self.uncomp.sz {
            if self.eof {
                return Ok(None);
            }
            self.fill()?;
        }
        Ok(Some(self.uncomp.remaining()[0]))
    }

    /// Reads bytes up to and excluding `delim` into `out` (cleared first).
    /// When `delim` is a newline, a trailing carriage return is stripped.
    /// Returns the line length, or `None` at end of stream with no data.
    pub fn getline(&mut self, delim: u8, out: &mut Vec<u8>) -> Result<Option<usize>> {
        out.clear();
        loop {
            if self.uncomp.pos == self.uncomp.sz {
                if self.eof {
                    break;
                }
                self.fill()?;
                continue;
            }
            let window = self.uncomp.remaining();
            match memchr(delim, window) {
                Some(i) => {
                    out.extend_from_slice(&window[..i]);
                    self.uncomp.pos += i + 1;
                    if delim == b'\n' && out.last() == Some(&b'\r') {
                        out.pop();
                    }
                    return Ok(Some(out.len()));
                }
                None => {
                    out.extend_from_slice(window);
                    self.uncomp.pos = self.uncomp.sz;
                }
            }
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out.len()))
        }
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Loads the seekable index from the file tail and rewinds the stream to
    /// the start. Loaded lazily by [`seek`](Self::seek); calling it directly
    /// distinguishes missing-index from other failures early.
    pub fn load_seekable_index(&mut self) -> Result<()> {
        if self.index.is_some() {
            return Ok(());
        }
        let src = self
            .src
            .as_mut()
            .ok_or(Error::Resource("file handle owned by reader thread"))?;
        self.index = Some(SeekableIndex::load(src)?);
        // The stream is repositioned at the file start
        self.uncomp.clear();
        self.comp.clear();
        self.eof = false;
        Ok(())
    }

    /// Loads the genomic index, if the file carries one. Requires the
    /// seekable index to locate the trailing frames.
    pub fn load_genomic_index(&mut self) -> Result<()> {
        if self.genomic_loaded {
            return Ok(());
        }
        self.load_seekable_index()?;
        let frame_bytes = self
            .index
            .as_ref()
            .expect("seekable index loaded")
            .frame_bytes();
        let src = self
            .src
            .as_mut()
            .ok_or(Error::Resource("file handle owned by reader thread"))?;
        let file_len = src.seek(SeekFrom::End(0)).map_err(Error::from_seek)?;
        self.genomic = GenomicIndex::load_before(src, file_len - frame_bytes)?;
        self.genomic_loaded = true;
        self.uncomp.clear();
        self.comp.clear();
        self.eof = false;
        Ok(())
    }

    /// Resolves a genomic range to the uncompressed offset of the first
    /// frame that may contain it, suitable for [`seek`](Self::seek).
    /// `Ok(None)` means past the end of the indexed data. With a pipeline
    /// attached the index must have been loaded beforehand.
    pub fn query(&mut self, tid: i32, begin: i64, end: i64) -> Result<Option<u64>> {
        if !self.genomic_loaded {
            if self.pipeline.is_some() {
                return Err(Error::NoIndex);
            }
            self.load_genomic_index()?;
        }
        match &self.genomic {
            Some(genomic) => Ok(genomic.query(tid, begin, end)),
            None => Err(Error::NoIndex),
        }
    }

    /// Repositions the stream at uncompressed offset `upos`.
    ///
    /// Seeking to the total uncompressed length succeeds and yields EOF on
    /// the next read; seeking past it fails with [`Error::Range`]. With a
    /// pipeline attached the seek is carried out by the reader thread, which
    /// discards all in-flight blocks first.
    pub fn seek(&mut self, upos: u64) -> Result<()> {
        if self.pipeline.is_some() {
            return self.seek_mt(upos);
        }
        self.load_seekable_index()?;
        let index = self.index.as_ref().expect("seekable index loaded");
        let total = index.total_uncompressed();
        if upos > total {
            return Err(Error::Range {
                requested: upos,
                available: total,
            });
        }
        if upos == total {
            self.uncomp.clear();
            self.eof = true;
            return Ok(());
        }

        let target = index.query(upos)?;
        let src = self
            .src
            .as_mut()
            .ok_or(Error::Resource("file handle owned by reader thread"))?;
        src.seek(SeekFrom::Start(target.comp_pos))
            .map_err(Error::from_seek)?;
        self.eof = false;
        self.uncomp.clear();
        self.read_block()?;
        let intra = (upos - target.uncomp_start) as usize;
        if intra > self.uncomp.sz {
            return Err(IndexError::Corrupt("block shorter than index entry").into());
        }
        self.uncomp.pos = intra;
        Ok(())
    }

    /// Checks for the trailing EOF marker without disturbing the read
    /// position. A missing marker usually means the writer did not finish
    /// cleanly.
    pub fn check_eof(&mut self) -> Result<EofStatus> {
        if self.pipeline.is_some() {
            return self.check_eof_mt();
        }
        let src = self
            .src
            .as_mut()
            .ok_or(Error::Resource("file handle owned by reader thread"))?;
        probe_eof(src)
    }
}

impl<R: Read + Seek + Send + 'static> Reader<R> {
    /// Attaches a worker pool: a dedicated reader thread takes over the file
    /// handle, parses frames, and dispatches whole-frame decompression jobs.
    /// `queue_size` bounds the in-flight blocks; `0` selects twice the
    /// pool's worker count.
    pub fn attach_thread_pool(&mut self, pool: Arc<ThreadPool>, queue_size: usize) -> Result<()> {
        if self.pipeline.is_some() {
            return Err(Error::Resource("thread pool already attached"));
        }
        let depth = if queue_size == 0 {
            2 * pool.workers()
        } else {
            queue_size
        };
        let queue = Arc::new(ProcessQueue::new(depth));
        let shared = Arc::new(DecodeShared {
            command: CommandChannel::new(),
            jobs: Mutex::new(JobPool::default()),
        });

        let src = self
            .src
            .take()
            .ok_or(Error::Resource("file handle unavailable"))?;
        let index = self.index.take();
        debug!(workers = pool.workers(), depth, "starting decode pipeline");

        let thread_queue = queue.clone();
        let thread_shared = shared.clone();
        let reader_thread = thread::Builder::new()
            .name("bgzf2-reader-io".to_string())
            .spawn(move || reader_io_thread(src, index, pool, thread_queue, thread_shared))
            .map_err(|_| Error::Resource("failed to spawn reader I/O thread"))?;

        self.pipeline = Some(DecodePipeline {
            queue,
            shared,
            reader_thread: Some(reader_thread),
        });
        Ok(())
    }
}

impl<R> Drop for Reader<R> {
    fn drop(&mut self) {
        self.shutdown_pipeline();
    }
}

impl<R: Read> std::io::Read for Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Reader::read(self, buf).map_err(std::io::Error::other)
    }
}

/// Probes the last four bytes for the seekable footer magic, restoring the
/// stream position afterwards.
fn probe_eof<R: Read + Seek>(src: &mut R) -> Result<EofStatus> {
    let pos = match src.stream_position() {
        Ok(pos) => pos,
        Err(e) => {
            return match Error::from_seek(e) {
                Error::NonSeekable => Ok(EofStatus::NonSeekable),
                other => Err(other),
            }
        }
    };
    let len = src.seek(SeekFrom::End(0))?;
    let status = if len >= 4 {
        src.seek(SeekFrom::End(-4))?;
        if src.read_u32::<LittleEndian>()? == SEEKABLE_FOOTER_MAGIC {
            EofStatus::Present
        } else {
            EofStatus::Absent
        }
    } else {
        EofStatus::Absent
    };
    src.seek(SeekFrom::Start(pos))?;
    Ok(status)
}

/// Reader thread states; see the module docs for the transition table.
enum ReaderState {
    Reading,
    AfterEof,
    Shutdown,
}

/// The dedicated reader thread: steady-state frame dispatch plus command
/// servicing.
fn reader_io_thread<R: Read + Seek>(
    mut src: R,
    mut index: Option<SeekableIndex>,
    pool: Arc<ThreadPool>,
    queue: Arc<ProcessQueue<Job>>,
    shared: Arc<DecodeShared>,
) {
    let mut state = ReaderState::Reading;
    loop {
        state = match state {
            ReaderState::Reading => reading_step(&mut src, &mut index, &pool, &queue, &shared),
            ReaderState::AfterEof => {
                let cmd = wait_command(&shared);
                match cmd {
                    Cmd::Close => ReaderState::Shutdown,
                    Cmd::Seek => {
                        if handle_seek(&mut src, &mut index, &queue, &shared) {
                            ReaderState::Reading
                        } else {
                            ReaderState::AfterEof
                        }
                    }
                    Cmd::HasEof => {
                        handle_has_eof(&mut src, &shared);
                        ReaderState::AfterEof
                    }
                    _ => ReaderState::AfterEof,
                }
            }
            ReaderState::Shutdown => break,
        };
    }
    debug!("reader I/O thread shut down");
}

/// One step of the steady-state loop: service a pending command, then parse
/// and dispatch the next frame.
fn reading_step<R: Read + Seek>(
    src: &mut R,
    index: &mut Option<SeekableIndex>,
    pool: &Arc<ThreadPool>,
    queue: &Arc<ProcessQueue<Job>>,
    shared: &Arc<DecodeShared>,
) -> ReaderState {
    match poll_command(shared) {
        Some(Cmd::Close) => return ReaderState::Shutdown,
        Some(Cmd::Seek) => {
            return if handle_seek(src, index, queue, shared) {
                ReaderState::Reading
            } else {
                ReaderState::AfterEof
            };
        }
        Some(Cmd::HasEof) => {
            handle_has_eof(src, shared);
            return ReaderState::Reading;
        }
        _ => {}
    }

    // Reserve the dispatch slot first so a command can interrupt the wait
    // before any input is consumed
    let ticket = match queue.reserve() {
        Reserve::Slot(ticket) => ticket,
        Reserve::Interrupted => return ReaderState::Reading,
        Reserve::Shutdown => return ReaderState::Shutdown,
    };

    let mut job = shared.jobs.lock().alloc();
    match frame::read_next_frame(src, &mut job.comp) {
        Ok(NextFrame::Data { content_size }) => {
            job.content_size = content_size;
            let worker_queue = queue.clone();
            let worker_shared = shared.clone();
            let dispatched = pool.execute(move || {
                let mut job = job;
                if let Err(e) =
                    codec::decompress_into(job.comp.as_slice(), &mut job.uncomp, job.content_size)
                {
                    job.errcode = Some(e);
                }
                if let Some(job) = worker_queue.complete(ticket, job) {
                    // Queue was reset by a seek while this job was in flight
                    worker_shared.jobs.lock().release(job);
                }
            });
            if dispatched.is_err() {
                // Workers are gone; surface the failure in order
                let mut job = shared.jobs.lock().alloc();
                job.errcode = Some(Error::Resource("thread pool workers exited"));
                if let Some(job) = queue.complete(ticket, job) {
                    shared.jobs.lock().release(job);
                }
                return ReaderState::AfterEof;
            }
            ReaderState::Reading
        }
        Ok(NextFrame::Eof) => {
            // Sentinel delivered through the same ordered slot
            job.hit_eof = true;
            if let Some(job) = queue.complete(ticket, job) {
                shared.jobs.lock().release(job);
            }
            ReaderState::AfterEof
        }
        Err(e) => {
            job.errcode = Some(e);
            if let Some(job) = queue.complete(ticket, job) {
                shared.jobs.lock().release(job);
            }
            ReaderState::AfterEof
        }
    }
}

/// Non-blocking command check, used between dispatches.
fn poll_command(shared: &DecodeShared) -> Option<Cmd> {
    let cs = shared.command.state.lock();
    match cs.cmd {
        Cmd::None | Cmd::SeekDone | Cmd::SeekFail | Cmd::HasEofDone => None,
        cmd => Some(cmd),
    }
}

/// Blocking command wait, used after EOF.
fn wait_command(shared: &DecodeShared) -> Cmd {
    let mut cs = shared.command.state.lock();
    loop {
        match cs.cmd {
            Cmd::Seek | Cmd::HasEof | Cmd::Close => return cs.cmd,
            _ => shared.command.cond.wait(&mut cs),
        }
    }
}

/// Services a seek on the reader thread: discard in-flight results, load the
/// index if absent, reposition the file, and publish the intra-block offset.
/// Returns whether the seek succeeded.
fn handle_seek<R: Read + Seek>(
    src: &mut R,
    index: &mut Option<SeekableIndex>,
    queue: &Arc<ProcessQueue<Job>>,
    shared: &Arc<DecodeShared>,
) -> bool {
    let upos = shared.command.state.lock().seek_to;
    debug!(upos, "reader thread servicing seek");

    // No stale block may reach the consumer
    for job in queue.reset() {
        shared.jobs.lock().release(job);
    }

    let result = (|| -> Result<u64> {
        if index.is_none() {
            *index = Some(SeekableIndex::load(src)?);
        }
        let ix = index.as_ref().expect("index loaded");
        let total = ix.total_uncompressed();
        if upos > total {
            return Err(Error::Range {
                requested: upos,
                available: total,
            });
        }
        if upos == total {
            // Reposition at the trailing frames: parsing skips them and the
            // EOF sentinel follows immediately
            src.seek(SeekFrom::Start(ix.total_compressed()))
                .map_err(Error::from_seek)?;
            return Ok(0);
        }
        let target = ix.query(upos)?;
        src.seek(SeekFrom::Start(target.comp_pos))
            .map_err(Error::from_seek)?;
        Ok(upos - target.uncomp_start)
    })();

    let mut cs = shared.command.state.lock();
    let ok = match result {
        Ok(intra) => {
            cs.seek_to = intra;
            cs.cmd = Cmd::SeekDone;
            true
        }
        Err(e) => {
            cs.error = Some(e);
            cs.cmd = Cmd::SeekFail;
            false
        }
    };
    shared.command.cond.notify_all();
    ok
}

/// Services an EOF-marker probe on the reader thread.
fn handle_has_eof<R: Read + Seek>(src: &mut R, shared: &Arc<DecodeShared>) {
    let result = probe_eof(src);
    let mut cs = shared.command.state.lock();
    match result {
        Ok(status) => cs.eof_status = status,
        Err(e) => cs.error = Some(e),
    }
    cs.cmd = Cmd::HasEofDone;
    shared.command.cond.notify_all();
}
