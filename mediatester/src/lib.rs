//! Media tester: fills a block device or data stream with reproducible
//! pseudorandom bytes, or reads one back to verify that the bytes written
//! earlier are still there. Write and verify spread the PRNG work over all
//! available cores, and double buffering lets device I/O overlap data
//! generation.

pub mod blockdev;
pub mod buffers;
pub mod compare;
pub mod config;
pub mod pipeline;
pub mod sys;
