//! Anonymous memory mappings backing the double-buffered pipeline.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use anyhow::Context;
use nix::sys::mman::{self, MapFlags, ProtFlags};

/// Two equally sized anonymous mappings. Workers fill disjoint segments of
/// one buffer while the other is being written out or compared, so the pool
/// hands out raw slices and the callers keep the ranges disjoint.
pub struct BufferPool {
    maps: [Option<NonNull<u8>>; 2],
    len: usize,
}

// The pool itself is a pair of stable pointers into mappings that live as
// long as the pool; the slice accessors carry the aliasing contract.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(len: usize) -> anyhow::Result<Self> {
        let size = NonZeroUsize::new(len).context("I/O buffer size must not be zero")?;
        let mut pool = BufferPool {
            maps: [None, None],
            len,
        };
        for slot in pool.maps.iter_mut() {
            let ptr = unsafe {
                mman::mmap(
                    None,
                    size,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            }
            .context("could not allocate I/O buffer")?;
            *slot = Some(NonNull::new(ptr.cast::<u8>()).context("mmap returned a null pointer")?);
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shared view of `buf[offset..offset + len]`.
    ///
    /// Safety: the caller must ensure nothing writes the range for the
    /// lifetime of the slice.
    pub unsafe fn slice(&self, buf: usize, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.maps[buf].unwrap().as_ptr().add(offset), len)
    }

    /// Exclusive view of `buf[offset..offset + len]`.
    ///
    /// Safety: the caller must ensure the range is not otherwise referenced
    /// for the lifetime of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, buf: usize, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.maps[buf].unwrap().as_ptr().add(offset), len)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for slot in self.maps.iter_mut() {
            if let Some(ptr) = slot.take() {
                let _res = unsafe { mman::munmap(ptr.as_ptr().cast(), self.len) };
                #[cfg(debug_assertions)]
                _res.expect("unmapping I/O buffer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_stable_and_disjoint() {
        let pool = BufferPool::new(8192).unwrap();
        unsafe {
            pool.slice_mut(0, 0, 4096).fill(0xaa);
            pool.slice_mut(0, 4096, 4096).fill(0xbb);
            pool.slice_mut(1, 0, 8192).fill(0xcc);
            assert!(pool.slice(0, 0, 4096).iter().all(|&b| b == 0xaa));
            assert!(pool.slice(0, 4096, 4096).iter().all(|&b| b == 0xbb));
            assert!(pool.slice(1, 0, 8192).iter().all(|&b| b == 0xcc));
        }
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(BufferPool::new(0).is_err());
    }
}
