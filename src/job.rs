//! Units of work moving between the caller thread, the worker pool, and the
//! dedicated I/O thread.
//!
//! A job owns its compressed and uncompressed buffers while in flight;
//! ownership passes main -> worker -> I/O thread on encode and
//! reader -> worker -> consumer on decode. Finished jobs return to a
//! free list so their buffer allocations are reused.

use crate::buffer::Buffer;
use crate::error::Error;

/// A block in flight through one of the pipelines.
#[derive(Debug, Default)]
pub(crate) struct Job {
    pub uncomp: Buffer,
    pub comp: Buffer,
    /// Error raised while processing this job, surfaced in queue order
    pub errcode: Option<Error>,
    /// Marks the end-of-stream sentinel on the decode side
    pub hit_eof: bool,
    /// Declared uncompressed size of the frame, when its header carries one
    pub content_size: Option<u64>,
    /// Monotonic dispatch number, for ordering assertions
    pub job_num: u64,
}

impl Job {
    /// Clears per-dispatch state, keeping the buffer allocations.
    fn recycle(&mut self) {
        self.uncomp.clear();
        self.comp.clear();
        self.errcode = None;
        self.hit_eof = false;
        self.content_size = None;
    }
}

/// Free list of recycled jobs. Held behind the pipeline mutex.
#[derive(Debug, Default)]
pub(crate) struct JobPool {
    free: Vec<Job>,
    next_job_num: u64,
}

impl JobPool {
    /// Takes a recycled job, or allocates a fresh one on exhaustion.
    pub fn alloc(&mut self) -> Job {
        let mut job = self.free.pop().unwrap_or_default();
        job.recycle();
        job.job_num = self.next_job_num;
        self.next_job_num += 1;
        job
    }

    pub fn release(&mut self, job: Job) {
        self.free.push(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_are_recycled() {
        let mut pool = JobPool::default();
        let mut job = pool.alloc();
        job.uncomp.push(b"some data");
        job.hit_eof = true;
        let cap = job.uncomp.capacity();
        pool.release(job);

        let job = pool.alloc();
        assert_eq!(job.uncomp.sz, 0);
        assert!(!job.hit_eof);
        assert_eq!(job.uncomp.capacity(), cap);
    }

    #[test]
    fn test_job_numbers_are_monotonic() {
        let mut pool = JobPool::default();
        let a = pool.alloc();
        let b = pool.alloc();
        pool.release(a);
        let c = pool.alloc();
        assert_eq!(b.job_num, 1);
        assert_eq!(c.job_num, 2);
    }
}
