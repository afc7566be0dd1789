//! The slow single-threaded comparator behind the `compare` and `diff`
//! modes. Unlike `verify` it never stops at the first difference: it
//! reports bytes one line each - every byte for `compare`, differing bytes
//! for `diff` - until the input ends.

use std::io::Write;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::unistd;

use pearnd::{Offset, Sbox};

use crate::buffers::BufferPool;
use crate::config::Mode;

/// Totals reported after a comparison run.
#[derive(Debug, Clone, Copy)]
pub struct CompareSummary {
    pub start_pos: u64,
    pub end_pos: u64,
    pub differences: u64,
}

impl CompareSummary {
    pub fn bytes_compared(&self) -> u64 {
        self.end_pos - self.start_pos
    }
}

/// Reads the input stream one buffer at a time into `pool` buffer 0,
/// regenerates the expected bytes into buffer 1 and reports them to
/// `report`. Ends at end-of-input (a read of zero or EFBIG).
pub fn slow_comparison(
    sbox: &Sbox,
    pool: &BufferPool,
    input_fd: RawFd,
    mode: Mode,
    start_pos: u64,
    report: &mut impl Write,
) -> anyhow::Result<CompareSummary> {
    debug_assert!(matches!(mode, Mode::Compare | Mode::Diff));
    let buffer_size = pool.len();
    let mut differences = 0u64;
    let mut pos = start_pos;
    // The reference cursor advances a whole buffer per cycle; past the end
    // of the input the surplus tail is generated but never looked at. Only
    // `pos` tracks the real byte count.
    let mut cursor = Offset::at(start_pos);
    writeln!(report, "\nEX RD A XOR BYTE_OFFSET")?;
    loop {
        let (len, eof) = read_into(pool, 0, input_fd, pos, start_pos)?;
        if len > 0 {
            // Safety: single threaded; the slices below never overlap.
            let reference = unsafe { pool.slice_mut(1, 0, buffer_size) };
            sbox.generate(reference, &mut cursor);
            let input = unsafe { pool.slice(0, 0, len) };
            for (i, (&rd, &ex)) in input.iter().zip(reference.iter()).enumerate() {
                if mode == Mode::Diff && rd == ex {
                    continue;
                }
                let xor = rd ^ ex;
                if xor != 0 {
                    differences += 1;
                }
                let shown = if (0x20..0x7f).contains(&rd) {
                    rd as char
                } else {
                    '.'
                };
                writeln!(report, "{ex:02X} {rd:02X} {shown} {xor:08b} {}", pos + i as u64)?;
            }
            pos += len as u64;
        }
        if eof {
            break;
        }
    }
    writeln!(report, "\nComparison complete!\n")?;
    writeln!(report, "Reading stopped at byte offset {pos}!")?;
    writeln!(report, "(Reading did start at byte offset {start_pos})")?;
    writeln!(report, "Different bytes encountered: {differences}")?;
    writeln!(report, "Total bytes compared: {}", pos - start_pos)?;
    report.flush()?;
    Ok(CompareSummary {
        start_pos,
        end_pos: pos,
        differences,
    })
}

/// Fills pool buffer `buf` from the input fd. Returns the bytes read and
/// whether the stream ended.
fn read_into(
    pool: &BufferPool,
    buf: usize,
    fd: RawFd,
    pos: u64,
    start_pos: u64,
) -> anyhow::Result<(usize, bool)> {
    let size = pool.len();
    let mut done = 0usize;
    while done < size {
        // Safety: single threaded; no other reference into this buffer.
        let dst = unsafe { pool.slice_mut(buf, done, size - done) };
        match unistd::read(fd, dst) {
            Ok(0) => return Ok((done, true)),
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EFBIG) => return Ok((done, true)),
            Err(err) => {
                let at = pos + done as u64;
                eprintln!("Read error at byte offset {at}!");
                eprintln!("(Reading did start at byte offset {start_pos})");
                eprintln!("Total bytes read so far: {}", at - start_pos);
                return Err(anyhow::Error::new(err).context("read failed"));
            }
        }
    }
    Ok((done, false))
}
