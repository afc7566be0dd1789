//! I/O block size probing and block device helpers.

use std::os::unix::io::RawFd;

use anyhow::{bail, Context};
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::{lseek, sysconf, SysconfVar, Whence};

/// Lower bound for the I/O block size; the final value is the next power
/// of two at or above every probed size.
pub const MIN_BLOCK_SIZE: usize = 512;

// Request values from <linux/fs.h>; nix does not wrap the block layer.
const BLKSSZGET: libc::c_ulong = 0x1268;
const BLKPBSZGET: libc::c_ulong = 0x127b;
const BLKIOOPT: libc::c_ulong = 0x1279;
const BLKFLSBUF: libc::c_ulong = 0x1261;

nix::ioctl_read_bad!(blk_logical_sector_size, BLKSSZGET, libc::c_int);
nix::ioctl_read_bad!(blk_physical_sector_size, BLKPBSZGET, libc::c_uint);
nix::ioctl_read_bad!(blk_optimal_io_size, BLKIOOPT, libc::c_uint);
nix::ioctl_none_bad!(blk_flush_buffer, BLKFLSBUF);

pub fn is_block_device(fd: RawFd) -> anyhow::Result<bool> {
    let st = fstat(fd).context("cannot examine the file descriptor to be used for I/O")?;
    Ok(st.st_mode & SFlag::S_IFMT.bits() == SFlag::S_IFBLK.bits())
}

/// Best I/O block size for the stream behind `fd`: for block devices the
/// largest of the logical, physical and optimal I/O sizes, otherwise the
/// larger of the MMU page size and the atomic pipe buffer size. Always a
/// power of two of at least [`MIN_BLOCK_SIZE`].
pub fn io_block_size(fd: RawFd) -> anyhow::Result<usize> {
    let mut blksz = 0usize;
    if is_block_device(fd)? {
        let mut logical: libc::c_int = 0;
        unsafe { blk_logical_sector_size(fd, &mut logical) }
            .context("unable to determine the logical sector size")?;
        blksz = blksz.max(logical as usize);
        let mut physical: libc::c_uint = 0;
        unsafe { blk_physical_sector_size(fd, &mut physical) }
            .context("unable to determine the physical sector size")?;
        blksz = blksz.max(physical as usize);
        let mut optimal: libc::c_uint = 0;
        unsafe { blk_optimal_io_size(fd, &mut optimal) }
            .context("unable to determine the optimal I/O size")?;
        blksz = blksz.max(optimal as usize);
    } else {
        let page = sysconf(SysconfVar::PAGE_SIZE)
            .context("cannot query the MMU page size")?
            .unwrap_or(0);
        blksz = blksz.max(page as usize);
        blksz = blksz.max(libc::PIPE_BUF);
    }
    round_up_block_size(blksz)
}

fn round_up_block_size(blksz: usize) -> anyhow::Result<usize> {
    match blksz.max(MIN_BLOCK_SIZE).checked_next_power_of_two() {
        Some(size) => Ok(size),
        None => bail!("could not determine a suitable I/O block size"),
    }
}

/// Drops the device cache so a verifying read hits the medium, not memory.
pub fn flush_device_cache(fd: RawFd) -> anyhow::Result<()> {
    unsafe { blk_flush_buffer(fd) }
        .context("unable to flush the device buffer before starting the operation")?;
    Ok(())
}

/// Repositions `fd` to `pos` and confirms the kernel really ended up there.
pub fn seek_to_start(fd: RawFd, pos: u64) -> anyhow::Result<()> {
    if pos > i64::MAX as u64 {
        bail!("numeric overflow in the starting offset");
    }
    lseek(fd, pos as i64, Whence::SeekSet)
        .context("could not reposition the standard stream to the starting offset")?;
    let got = lseek(fd, 0, Whence::SeekCur)
        .context("could not read back the standard stream position")?;
    if got != pos as i64 {
        bail!("could not reposition the standard stream to the starting offset");
    }
    Ok(())
}
