//! The parallel generate/verify pipeline.
//!
//! N worker threads claim fixed-size segments of one of two shared buffers
//! and fill them with PRNG data. Whichever worker runs out of segments last
//! rotates the buffers and performs the device I/O on the finished buffer
//! while the others already generate into the fresh one, so disk and CPU
//! work overlap. A single mutex guards every piece of shared state; the
//! paired condition variable parks workers between buffer cycles.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use nix::errno::Errno;
use nix::unistd;
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use pearnd::{Offset, Sbox};

use crate::buffers::BufferPool;
use crate::config::Geometry;

/// Direction of the streaming run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Generate PRNG data and write it to the fd.
    Write,
    /// Read from the fd and compare against regenerated PRNG data.
    Verify,
}

/// Write failures treated as a normal end of stream: the sink is full or
/// gone, not broken.
fn is_soft_eof(err: Errno) -> bool {
    matches!(
        err,
        Errno::ENOSPC | Errno::EPIPE | Errno::EDQUOT | Errno::EFBIG
    )
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("data mismatch at byte offset {offset} (verification started at byte offset {start})")]
    Mismatch { offset: u64, start: u64 },
}

/// Final accounting of a pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub start_pos: u64,
    pub end_pos: u64,
    pub num_errors: u64,
    /// Offset of the first differing byte; only set by a verify run that
    /// found one.
    pub first_error_pos: Option<u64>,
}

impl RunSummary {
    pub fn bytes_processed(&self) -> u64 {
        self.end_pos - self.start_pos
    }
}

/// Input chunk read during the previous buffer cycle, waiting to be
/// compared against the reference its offsets were generated into.
struct PendingInput {
    buf: usize,
    len: usize,
    pos: u64,
    eof: bool,
}

/// Pipeline state shared between workers; every field is only touched with
/// the pipeline mutex held.
struct Shared {
    /// Which of the two buffers segments are currently claimed from.
    active_buf: usize,
    /// Bytes of the active buffer already assigned to workers. Always a
    /// multiple of the segment size; equals the buffer size once the buffer
    /// is fully claimed.
    claimed: usize,
    /// Absolute byte offset of the next segment to be assigned.
    pos: u64,
    /// Workers not currently waiting on the condition variable.
    active_threads: usize,
    /// One-way flag; never reverts once set.
    shutdown_requested: bool,
    pending: Option<PendingInput>,
    /// Where the stream ended, once known.
    end_pos: Option<u64>,
    first_error_pos: Option<u64>,
    num_errors: u64,
}

enum Switchover {
    /// The stream goes on; keep claiming segments.
    Continue,
    /// The stream ended normally; initiate the shutdown.
    Finished,
}

pub struct Pipeline {
    shared: Mutex<Shared>,
    wakeup: Condvar,
    pool: BufferPool,
    sbox: &'static Sbox,
    mode: StreamMode,
    io_fd: RawFd,
    segment_size: usize,
    buffer_size: usize,
    start_pos: u64,
}

impl Pipeline {
    pub fn new(
        sbox: &'static Sbox,
        geometry: &Geometry,
        mode: StreamMode,
        io_fd: RawFd,
        start_pos: u64,
    ) -> anyhow::Result<Self> {
        let pool = BufferPool::new(geometry.buffer_size)?;
        Ok(Pipeline {
            shared: Mutex::new(Shared {
                active_buf: 0,
                // In verify mode the first buffer starts out fully claimed,
                // forcing a read-and-switch as the very first worker action.
                claimed: match mode {
                    StreamMode::Write => 0,
                    StreamMode::Verify => geometry.buffer_size,
                },
                pos: start_pos,
                active_threads: 0,
                shutdown_requested: false,
                pending: None,
                end_pos: None,
                first_error_pos: None,
                num_errors: 0,
            }),
            wakeup: Condvar::new(),
            pool,
            sbox,
            mode,
            io_fd,
            segment_size: geometry.segment_size,
            buffer_size: geometry.buffer_size,
            start_pos,
        })
    }

    /// Runs `worker_threads` workers to completion and returns the final
    /// accounting. The first error wins; follow-up errors of the shutdown
    /// it triggered are dropped.
    pub fn run(self: &Arc<Self>, worker_threads: usize) -> anyhow::Result<RunSummary> {
        let mut handles = Vec::with_capacity(worker_threads);
        let mut first_error = None;
        for i in 0..worker_threads {
            let pipeline = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("prng worker {i}"))
                .spawn(move || pipeline.run_worker());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Take the workers already running down before reporting.
                    let mut shared = self.shared.lock();
                    shared.shutdown_requested = true;
                    drop(shared);
                    self.wakeup.notify_all();
                    first_error =
                        Some(anyhow::Error::new(e).context("could not create worker thread"));
                    break;
                }
            }
        }
        for handle in handles {
            let result = match handle.join() {
                Ok(res) => res,
                Err(_) => Err(anyhow!("worker thread panicked")),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    debug!("follow-up worker error dropped: {e:#}");
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        let shared = self.shared.lock();
        debug_assert_eq!(shared.active_threads, 0);
        Ok(RunSummary {
            start_pos: self.start_pos,
            end_pos: shared.end_pos.unwrap_or(shared.pos),
            num_errors: shared.num_errors,
            first_error_pos: shared.first_error_pos,
        })
    }

    fn run_worker(&self) -> anyhow::Result<()> {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.worker_loop())) {
            Ok(res) => res,
            Err(panic) => {
                // The loop's bookkeeping is unknown at this point; the flag
                // alone is enough for the other workers to drain.
                let mut shared = self.shared.lock();
                shared.shutdown_requested = true;
                drop(shared);
                self.wakeup.notify_all();
                std::panic::resume_unwind(panic);
            }
        }
    }

    /// Worker thread body: claim segments and generate them until the
    /// active buffer runs dry, then either take over the I/O step or wait
    /// for the buffers to switch.
    fn worker_loop(&self) -> anyhow::Result<()> {
        let mut shared = self.shared.lock();
        shared.active_threads += 1;
        loop {
            debug_assert!(shared.active_threads >= 1);
            debug_assert!(shared.claimed <= self.buffer_size);
            debug_assert_eq!(shared.claimed % self.segment_size, 0);
            debug_assert_eq!((shared.pos - self.start_pos) % self.segment_size as u64, 0);
            if shared.shutdown_requested {
                shared.active_threads -= 1;
                return Ok(());
            }
            if shared.claimed == self.buffer_size {
                if shared.active_threads == 1 {
                    // Everyone else is waiting and every segment of the
                    // active buffer has been processed: this thread runs the
                    // switchover and the I/O for this cycle. It stays
                    // counted in active_threads throughout, which is what
                    // keeps the switchover unique per cycle.
                    let outcome = match self.mode {
                        StreamMode::Write => self.write_switchover(&mut shared),
                        StreamMode::Verify => self.verify_switchover(&mut shared),
                    };
                    match outcome {
                        Ok(Switchover::Continue) => {}
                        Ok(Switchover::Finished) => {
                            shared.shutdown_requested = true;
                            shared.active_threads -= 1;
                            drop(shared);
                            self.wakeup.notify_all();
                            return Ok(());
                        }
                        Err(e) => {
                            shared.shutdown_requested = true;
                            shared.active_threads -= 1;
                            drop(shared);
                            self.wakeup.notify_all();
                            return Err(e);
                        }
                    }
                } else {
                    debug_assert!(shared.active_threads >= 2);
                    shared.active_threads -= 1;
                    self.wakeup.wait(&mut shared);
                    shared.active_threads += 1;
                }
            } else {
                // Seize the next work segment, then generate it without the
                // lock so the other workers can seize theirs.
                let buf = shared.active_buf;
                let offset = shared.claimed;
                shared.claimed += self.segment_size;
                let seg_pos = shared.pos;
                shared.pos += self.segment_size as u64;
                MutexGuard::unlocked(&mut shared, || {
                    // Safety: segment claims are disjoint, so this is the
                    // only live reference into this range.
                    let segment = unsafe { self.pool.slice_mut(buf, offset, self.segment_size) };
                    let mut cursor = Offset::at(seg_pos);
                    self.sbox.generate(segment, &mut cursor);
                });
            }
        }
    }

    /// Rotates the freshly generated buffer out for writing and makes the
    /// other one the active segment source. The write itself runs without
    /// the lock so the other workers fill the next buffer in parallel.
    fn write_switchover(&self, shared: &mut MutexGuard<'_, Shared>) -> anyhow::Result<Switchover> {
        let out_buf = shared.active_buf;
        let out_pos = shared.pos - self.buffer_size as u64;
        shared.active_buf ^= 1;
        shared.claimed = 0;
        let io_result = MutexGuard::unlocked(shared, || {
            // Wake the other threads so they start on the new buffer.
            self.wakeup.notify_all();
            self.write_out(out_buf, out_pos)
        });
        let (written, soft_eof) = io_result?;
        if soft_eof {
            // The sink does not accept any more data - we are done.
            let end = out_pos + written as u64;
            shared.end_pos = Some(end);
            eprintln!();
            eprintln!("Success!");
            eprintln!();
            eprintln!("Output stopped at byte offset {end}!");
            eprintln!("(Output did start at byte offset {})", self.start_pos);
            eprintln!("Total bytes written: {}", end - self.start_pos);
            return Ok(Switchover::Finished);
        }
        Ok(Switchover::Continue)
    }

    /// Writes one full buffer to the fd. Returns the bytes the sink
    /// accepted and whether it signalled end-of-stream.
    fn write_out(&self, buf: usize, start: u64) -> anyhow::Result<(usize, bool)> {
        let mut done = 0usize;
        while done < self.buffer_size {
            // Safety: this buffer is out of rotation until the next
            // switchover; nothing writes it concurrently.
            let rest = unsafe { self.pool.slice(buf, done, self.buffer_size - done) };
            match unistd::write(self.io_fd, rest) {
                Ok(0) => return Ok((done, true)),
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(err) if is_soft_eof(err) => return Ok((done, true)),
                Err(err) => {
                    let at = start + done as u64;
                    eprintln!("Write error at byte offset {at}!");
                    eprintln!("(Output did start at byte offset {})", self.start_pos);
                    eprintln!("Total bytes written so far: {}", at - self.start_pos);
                    return Err(anyhow::Error::new(err).context("write failed"));
                }
            }
        }
        Ok((done, false))
    }

    /// Verify-mode switchover, the symmetric dual of the write path: settle
    /// the input chunk read during the last cycle against the reference the
    /// workers just finished, then rotate the buffers and read the next
    /// chunk while the workers regenerate ahead.
    fn verify_switchover(&self, shared: &mut MutexGuard<'_, Shared>) -> anyhow::Result<Switchover> {
        if let Some(chunk) = shared.pending.take() {
            let ref_buf = shared.active_buf;
            debug_assert_eq!(chunk.buf, ref_buf ^ 1);
            debug_assert_eq!(chunk.pos + self.buffer_size as u64, shared.pos);
            // Compare without the lock: every other worker is parked on the
            // condvar and nothing wakes them before the broadcast below, so
            // both buffers stay stable.
            let mismatch = MutexGuard::unlocked(shared, || {
                // Safety: neither buffer is written until after the rotate.
                let input = unsafe { self.pool.slice(chunk.buf, 0, chunk.len) };
                let reference = unsafe { self.pool.slice(ref_buf, 0, chunk.len) };
                input.iter().zip(reference).position(|(a, b)| a != b)
            });
            if let Some(i) = mismatch {
                let offset = chunk.pos + i as u64;
                shared.first_error_pos = Some(offset);
                shared.num_errors += 1;
                shared.end_pos = Some(offset);
                eprintln!();
                eprintln!("Verification FAILED at byte offset {offset}!");
                eprintln!("(Verification did start at byte offset {})", self.start_pos);
                return Err(VerifyError::Mismatch {
                    offset,
                    start: self.start_pos,
                }
                .into());
            }
            if chunk.eof {
                let end = chunk.pos + chunk.len as u64;
                shared.end_pos = Some(end);
                eprintln!();
                eprintln!("Success!");
                eprintln!();
                eprintln!("Verification stopped at byte offset {end}!");
                eprintln!("(Verification did start at byte offset {})", self.start_pos);
                eprintln!("Total bytes verified: {}", end - self.start_pos);
                eprintln!("Mismatching bytes: 0");
                return Ok(Switchover::Finished);
            }
        }
        // Rotate: the settled input buffer becomes the next segment source
        // and the old reference buffer receives the next input chunk.
        let read_buf = shared.active_buf;
        let read_pos = shared.pos;
        shared.active_buf ^= 1;
        shared.claimed = 0;
        let chunk = MutexGuard::unlocked(shared, || {
            self.wakeup.notify_all();
            self.read_chunk(read_buf, read_pos)
        })?;
        shared.pending = Some(chunk);
        Ok(Switchover::Continue)
    }

    /// Reads up to one buffer of input. A read of zero or EFBIG marks the
    /// end of the stream.
    fn read_chunk(&self, buf: usize, pos: u64) -> anyhow::Result<PendingInput> {
        let mut done = 0usize;
        let mut eof = false;
        while done < self.buffer_size {
            // Safety: this buffer is out of rotation until the next
            // switchover.
            let dst = unsafe { self.pool.slice_mut(buf, done, self.buffer_size - done) };
            match unistd::read(self.io_fd, dst) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EFBIG) => {
                    eof = true;
                    break;
                }
                Err(err) => {
                    let at = pos + done as u64;
                    eprintln!("Read error at byte offset {at}!");
                    eprintln!("(Reading did start at byte offset {})", self.start_pos);
                    eprintln!("Total bytes read so far: {}", at - self.start_pos);
                    return Err(anyhow::Error::new(err).context("read failed"));
                }
            }
        }
        Ok(PendingInput {
            buf,
            len: done,
            pos,
            eof,
        })
    }
}
