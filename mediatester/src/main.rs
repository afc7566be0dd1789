use std::io::BufWriter;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use mediatester::blockdev;
use mediatester::buffers::BufferPool;
use mediatester::compare;
use mediatester::config::{self, Args, Geometry, Mode};
use mediatester::pipeline::{Pipeline, StreamMode};
use mediatester::sys;

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // -h and -V are successful exits; everything else is a usage
            // failure, reported with exit code 1 rather than clap's 2.
            let code = i32::from(err.use_stderr());
            let _ = err.print();
            std::process::exit(code);
        }
    };
    init_logging();
    if let Err(err) = run(args) {
        let argv0 = std::env::args()
            .next()
            .unwrap_or_else(|| "mediatester".into());
        eprintln!("{argv0} failed: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    let seed = config::load_seed(&args.seed_file)?;
    let sbox = pearnd::init(&seed).context("could not key the PRNG")?;

    if !args.not_nice {
        sys::be_nice()?;
    }
    sys::ignore_sigpipe()?;

    let io_fd: RawFd = if args.mode.reads_input() {
        libc::STDIN_FILENO
    } else {
        libc::STDOUT_FILENO
    };
    let block_size = blockdev::io_block_size(io_fd)?;
    if args.mode.reads_input() && !args.never_flush && blockdev::is_block_device(io_fd)? {
        blockdev::flush_device_cache(io_fd)?;
    }

    let start_pos = args.start_offset;
    if start_pos != 0 {
        if start_pos % block_size as u64 != 0 {
            anyhow::bail!(
                "the starting offset must be a multiple of the I/O block size ({block_size})"
            );
        }
        blockdev::seek_to_start(io_fd, start_pos)?;
    }

    let cores = std::thread::available_parallelism()
        .context("could not determine the number of available CPU cores")?
        .get();
    let geometry = Geometry::plan(
        args.mode,
        args.threads,
        cores,
        block_size,
        config::APPROXIMATE_BUFFER_SIZE,
    );

    let direction = if args.mode.reads_input() { "input" } else { "output" };
    info!("starting {direction} offset: {start_pos} bytes");
    info!("I/O block size: {block_size} bytes");
    info!("PRNG worker threads: {}", geometry.threads);
    info!("worker segment size: {} bytes", geometry.segment_size);
    info!("worker segments per buffer: {}", geometry.work_segments);
    info!("buffer size: {} bytes, 2 buffers", geometry.buffer_size);

    match args.mode {
        Mode::Write => {
            info!("writing PRNG data to standard output...");
            let pipeline = Arc::new(Pipeline::new(
                sbox,
                &geometry,
                StreamMode::Write,
                io_fd,
                start_pos,
            )?);
            pipeline.run(geometry.spawn_threads)?;
        }
        Mode::Verify => {
            info!("reading PRNG data from standard input...");
            let pipeline = Arc::new(Pipeline::new(
                sbox,
                &geometry,
                StreamMode::Verify,
                io_fd,
                start_pos,
            )?);
            pipeline.run(geometry.spawn_threads)?;
        }
        Mode::Compare | Mode::Diff => {
            info!("reading PRNG data from standard input...");
            let pool = BufferPool::new(geometry.buffer_size)?;
            let mut report = BufWriter::new(std::io::stderr().lock());
            compare::slow_comparison(sbox, &pool, io_fd, args.mode, start_pos, &mut report)?;
        }
    }
    Ok(())
}
