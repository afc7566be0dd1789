//! Run configuration: the command line surface, seed loading and the
//! thread/segment/buffer geometry.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

/// Target size of one shared buffer before rounding; two get allocated.
pub const APPROXIMATE_BUFFER_SIZE: usize = 16 << 20;

/// Starting point for the number of work segments per buffer; the planner
/// snaps it to a multiple of the worker count.
const DEFAULT_WORK_SEGMENTS: usize = 64;

/// Operating mode, selecting the direction of the data stream.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Write the PRNG stream to standard output
    Write,
    /// Compare PRNG data against standard input, stopping at the first
    /// difference
    Verify,
    /// Like verify, but report every byte ("should" and "is")
    Compare,
    /// Like compare, but only report differing bytes
    Diff,
}

impl Mode {
    pub fn reads_input(self) -> bool {
        !matches!(self, Mode::Write)
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Fills a block device or stream with reproducible pseudorandom bytes, \
             or reads it back to verify them",
    after_help = "The seed file determines which pseudo-random byte sequence is \
written or expected; use the same seed file for a 'write' and its matching \
'verify'. Create one with e.g.:\n\n\
  dd if=/dev/random bs=1 count=16 > my_seed_file.bin\n\n\
Typical procedure: 'write' fills the device (or the filesystem, measuring its \
real uncompressible capacity), 'verify' finds the offset of the first \
difference, and 'compare' or 'diff' - piped through head or more - shows what \
exactly differs there."
)]
pub struct Args {
    /// Worker threads for write/verify (0 or omitted: one per CPU core)
    #[arg(short = 't', value_name = "N")]
    pub threads: Option<usize>,

    /// Don't be nice: keep the initial CPU and I/O priorities
    #[arg(short = 'N')]
    pub not_nice: bool,

    /// Don't flush the block device cache before reading from it
    #[arg(short = 'F')]
    pub never_flush: bool,

    /// Operating mode
    #[arg(value_enum)]
    pub mode: Mode,

    /// File of 1..=256 arbitrary bytes seeding the PRNG
    pub seed_file: PathBuf,

    /// Byte offset where writing/verifying starts; must be a multiple of
    /// the I/O block size
    #[arg(default_value_t = 0)]
    pub start_offset: u64,
}

/// Reads the PRNG seed. The file must hold between 1 and 256 bytes; the
/// read caps out one byte past the limit so an accidental device path is
/// never slurped whole.
pub fn load_seed(path: &Path) -> anyhow::Result<Vec<u8>> {
    let file = File::open(path)
        .with_context(|| format!("cannot read seed file {}", path.display()))?;
    let mut seed = Vec::with_capacity(pearnd::MAX_KEY_LEN + 1);
    file.take(pearnd::MAX_KEY_LEN as u64 + 1)
        .read_to_end(&mut seed)
        .with_context(|| format!("cannot read seed file {}", path.display()))?;
    if seed.len() > pearnd::MAX_KEY_LEN {
        bail!(
            "seed file {} is larger than the supported {} bytes",
            path.display(),
            pearnd::MAX_KEY_LEN
        );
    }
    if seed.is_empty() {
        bail!("seed file {} must not be empty", path.display());
    }
    Ok(seed)
}

/// Sizes driving the worker pool, derived once at startup from the CPU
/// count and the I/O block size.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// PRNG workers generating data.
    pub threads: usize,
    /// OS threads to spawn: one extra on top of `threads` covers the main
    /// thread's idleness while it waits for the run to end.
    pub spawn_threads: usize,
    pub work_segments: usize,
    /// Size of one work segment; always a multiple of the block size.
    pub segment_size: usize,
    /// Size of each of the two shared buffers.
    pub buffer_size: usize,
}

impl Geometry {
    /// Plans the segment layout. A `requested_threads` of 0 or `None`
    /// means one worker per detected core; compare and diff always run
    /// single threaded.
    pub fn plan(
        mode: Mode,
        requested_threads: Option<usize>,
        cores: usize,
        block_size: usize,
        approximate_buffer_size: usize,
    ) -> Self {
        let (threads, spawn_threads, work_segments) = match mode {
            Mode::Compare | Mode::Diff => (1, 0, DEFAULT_WORK_SEGMENTS),
            Mode::Write | Mode::Verify => {
                let threads = match requested_threads {
                    Some(n) if n >= 1 && n <= cores => n,
                    _ => cores,
                };
                let work_segments = if threads == 1 {
                    1
                } else if threads < DEFAULT_WORK_SEGMENTS {
                    DEFAULT_WORK_SEGMENTS / threads * threads
                } else {
                    threads
                };
                (threads, threads + 1, work_segments)
            }
        };
        let segment_size = ceil_div(approximate_buffer_size, work_segments);
        let segment_size = ceil_div(segment_size, block_size) * block_size;
        Geometry {
            threads,
            spawn_threads,
            work_segments,
            segment_size,
            buffer_size: segment_size * work_segments,
        }
    }
}

const fn ceil_div(num: usize, den: usize) -> usize {
    (num + den - 1) / den
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn single_thread_runs_one_segment() {
        let g = Geometry::plan(Mode::Write, Some(1), 8, 512, 16 << 20);
        assert_eq!(g.threads, 1);
        assert_eq!(g.spawn_threads, 2);
        assert_eq!(g.work_segments, 1);
        assert_eq!(g.buffer_size, g.segment_size);
        assert_eq!(g.segment_size % 512, 0);
        assert_eq!(g.segment_size, 16 << 20);
    }

    #[test]
    fn segments_snap_to_a_thread_multiple() {
        let g = Geometry::plan(Mode::Write, None, 6, 512, 16 << 20);
        assert_eq!(g.threads, 6);
        assert_eq!(g.spawn_threads, 7);
        assert_eq!(g.work_segments, 60);
        assert_eq!(g.work_segments % g.threads, 0);
    }

    #[test]
    fn many_cores_get_one_segment_each() {
        let g = Geometry::plan(Mode::Verify, None, 96, 512, 16 << 20);
        assert_eq!(g.threads, 96);
        assert_eq!(g.work_segments, 96);
    }

    #[test]
    fn requested_threads_cap_at_the_core_count() {
        let g = Geometry::plan(Mode::Write, Some(64), 4, 512, 16 << 20);
        assert_eq!(g.threads, 4);
        // 0 is the explicit spelling of "autodetect".
        let g = Geometry::plan(Mode::Write, Some(0), 4, 512, 16 << 20);
        assert_eq!(g.threads, 4);
    }

    #[test]
    fn compare_is_single_threaded() {
        let g = Geometry::plan(Mode::Diff, Some(12), 16, 4096, 16 << 20);
        assert_eq!(g.threads, 1);
        assert_eq!(g.spawn_threads, 0);
        assert_eq!(g.segment_size % 4096, 0);
    }

    #[test]
    fn segment_size_is_a_block_multiple() {
        let g = Geometry::plan(Mode::Write, None, 5, 4096, 1 << 20);
        assert_eq!(g.segment_size % 4096, 0);
        assert_eq!(g.buffer_size, g.segment_size * g.work_segments);
        assert!(g.buffer_size >= 1 << 20);
    }

    #[test]
    fn seed_length_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = |name: &str, content: &[u8]| {
            let path = dir.path().join(name);
            File::create(&path).unwrap().write_all(content).unwrap();
            path
        };
        assert!(load_seed(&fixture("empty", b"")).is_err());
        assert_eq!(load_seed(&fixture("one", b"x")).unwrap(), b"x");
        assert_eq!(load_seed(&fixture("max", &[9u8; 256])).unwrap().len(), 256);
        assert!(load_seed(&fixture("over", &[9u8; 257])).is_err());
        assert!(load_seed(Path::new("/nonexistent/seed")).is_err());
    }

    #[test]
    fn args_parse() {
        use clap::CommandFactory;
        Args::command().debug_assert();
        let args =
            Args::try_parse_from(["mediatester", "-t", "4", "-N", "write", "seed.bin", "4096"])
                .unwrap();
        assert_eq!(args.threads, Some(4));
        assert!(args.not_nice);
        assert!(!args.never_flush);
        assert_eq!(args.mode, Mode::Write);
        assert_eq!(args.start_offset, 4096);
        let args = Args::try_parse_from(["mediatester", "diff", "seed.bin"]).unwrap();
        assert_eq!(args.mode, Mode::Diff);
        assert_eq!(args.start_offset, 0);
        assert!(Args::try_parse_from(["mediatester", "write"]).is_err());
        assert!(Args::try_parse_from(["mediatester", "sing", "seed.bin"]).is_err());
    }
}
