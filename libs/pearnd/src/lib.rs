//! Pseudo-random byte generation based on Pearson's hashing idea.
//!
//! An sbox holding an arbitrary permutation of all 256 byte values is built
//! from a binary key with the ARCFOUR key schedule. The stream byte at
//! absolute position `p` is the Pearson hash of `p` written as a
//! little-endian base-256 number with as few limbs as possible, so small
//! offsets hash faster. The sbox never changes after setup, which makes the
//! stream position-addressable: any caller may generate any part of it from
//! just the absolute offset.

use once_cell::sync::OnceCell;
use thiserror::Error;

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 256;

const SBOX_LEN: usize = 256;

/// ARC4-drop3072: shuffle rounds discarded before the permutation is used.
const DROP_ROUNDS: usize = 3072;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("PRNG seed key must not be empty")]
    Empty,
    #[error("PRNG seed key is {0} bytes, larger than the supported {MAX_KEY_LEN}")]
    TooLong(usize),
    #[error("the PRNG sequence for this process has already been keyed")]
    AlreadyKeyed,
}

static SBOX: OnceCell<Sbox> = OnceCell::new();

/// Selects the PRNG sequence for the whole process. Only one sequence per
/// run is supported; a second call fails regardless of the key.
pub fn init(key: &[u8]) -> Result<&'static Sbox, KeyError> {
    let mut fresh = false;
    let sbox = SBOX.get_or_try_init(|| {
        fresh = true;
        Sbox::from_key(key)
    })?;
    if !fresh {
        return Err(KeyError::AlreadyKeyed);
    }
    Ok(sbox)
}

/// A byte permutation selecting one PRNG sequence.
#[derive(Debug)]
pub struct Sbox([u8; SBOX_LEN]);

impl Sbox {
    /// Derives the permutation from `key`: plain ARCFOUR key setup over the
    /// identity permutation, followed by the drop rounds.
    pub fn from_key(key: &[u8]) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong(key.len()));
        }
        let mut sbox = [0u8; SBOX_LEN];
        for (i, slot) in sbox.iter_mut().enumerate() {
            *slot = i as u8;
        }
        let mut j = 0usize;
        for i in 0..SBOX_LEN {
            j = (j + sbox[i] as usize + key[i % key.len()] as usize) % SBOX_LEN;
            sbox.swap(i, j);
        }
        let mut i = 0usize;
        j = 0;
        for _ in 0..DROP_ROUNDS {
            i = (i + 1) % SBOX_LEN;
            j = (j + sbox[i] as usize) % SBOX_LEN;
            sbox.swap(i, j);
        }
        Ok(Sbox(sbox))
    }

    /// Fills `dst` with stream bytes starting at `off`, leaving `off` just
    /// past the last generated byte.
    pub fn generate(&self, dst: &mut [u8], off: &mut Offset) {
        let sbox = &self.0;
        for out in dst.iter_mut() {
            let mut mac = 0u8;
            for &limb in &off.pos[..off.limbs] {
                mac = sbox[(mac ^ limb) as usize];
            }
            *out = mac;
            off.advance();
        }
    }
}

/// Absolute stream position as little-endian base-256 limbs. Only the limbs
/// up to the highest nonzero one take part in hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offset {
    pos: [u8; 8],
    limbs: usize,
}

impl Offset {
    /// Encodes `pos` with the minimum number of limbs; position 0 is one
    /// limb of value 0.
    pub fn at(pos: u64) -> Self {
        let mut limbs = [0u8; 8];
        let mut n = 0;
        let mut rest = pos;
        loop {
            limbs[n] = rest as u8;
            n += 1;
            rest >>= 8;
            if rest == 0 {
                break;
            }
        }
        Offset { pos: limbs, limbs: n }
    }

    pub fn limbs(&self) -> usize {
        self.limbs
    }

    /// Little-endian increment. A carry out of the current high limb grows
    /// the limb count; a carry out of the last limb wraps, like the 64-bit
    /// position it stands for.
    fn advance(&mut self) {
        for i in 0.. {
            if i == self.limbs {
                if i == self.pos.len() {
                    break;
                }
                self.pos[i] = 0;
                self.limbs = i + 1;
            }
            self.pos[i] = self.pos[i].wrapping_add(1);
            if self.pos[i] != 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sbox(key: &[u8]) -> Sbox {
        Sbox::from_key(key).unwrap()
    }

    #[test]
    fn sbox_is_a_permutation() {
        for key in [&[0u8][..], &b"abc"[..], &[0xffu8; 256][..]] {
            let s = sbox(key);
            let mut seen = [false; 256];
            for &b in &s.0 {
                seen[b as usize] = true;
            }
            assert!(seen.iter().all(|&hit| hit), "key {key:02x?}");
        }
    }

    #[test]
    fn key_length_bounds() {
        assert_eq!(Sbox::from_key(&[]).unwrap_err(), KeyError::Empty);
        assert_eq!(Sbox::from_key(&[7u8; 257]).unwrap_err(), KeyError::TooLong(257));
        assert!(Sbox::from_key(&[1]).is_ok());
        assert!(Sbox::from_key(&[7u8; 256]).is_ok());
    }

    #[test]
    fn seek_uses_minimal_limbs() {
        assert_eq!(Offset::at(0).limbs(), 1);
        assert_eq!(Offset::at(255).limbs(), 1);
        assert_eq!(Offset::at(256).limbs(), 2);
        assert_eq!(Offset::at(65535).limbs(), 2);
        assert_eq!(Offset::at(65536).limbs(), 3);
        assert_eq!(Offset::at(u64::MAX).limbs(), 8);
    }

    #[test]
    fn generation_is_deterministic() {
        let a = sbox(b"determinism");
        let b = sbox(b"determinism");
        let mut x = vec![0u8; 4096];
        let mut y = vec![0u8; 4096];
        a.generate(&mut x, &mut Offset::at(0));
        b.generate(&mut y, &mut Offset::at(0));
        assert_eq!(x, y);
    }

    #[test]
    fn generation_is_position_pure() {
        let s = sbox(b"pure");
        let mut whole = vec![0u8; 3000];
        s.generate(&mut whole, &mut Offset::at(0));
        // Any suffix equals a fresh generation seeked to its offset,
        // including suffixes crossing the limb boundary at 256.
        for start in [1usize, 17, 255, 256, 257, 1024, 2999] {
            let mut part = vec![0u8; 3000 - start];
            s.generate(&mut part, &mut Offset::at(start as u64));
            assert_eq!(part, whole[start..], "suffix at {start}");
        }
    }

    #[test]
    fn cursor_growth_matches_reseek() {
        let s = sbox(b"carry");
        // Generate across the limb-growth boundary at 2^16.
        let base = (1u64 << 16) - 8;
        let mut run = [0u8; 16];
        let mut off = Offset::at(base);
        s.generate(&mut run, &mut off);
        assert_eq!(off.limbs(), 3);
        let mut tail = [0u8; 8];
        s.generate(&mut tail, &mut Offset::at(base + 8));
        assert_eq!(tail, run[8..]);
    }

    #[test]
    fn distinct_keys_disagree() {
        let a = sbox(b"one");
        let b = sbox(b"two");
        let mut x = [0u8; 512];
        let mut y = [0u8; 512];
        a.generate(&mut x, &mut Offset::at(0));
        b.generate(&mut y, &mut Offset::at(0));
        assert_ne!(x[..], y[..]);
    }
}
