//! Key and value encoding.
//!
//! Every key and value lives in an `AtomicU64` so optimistic readers never
//! race on plain memory: a reader may see a stale or mixed pair, but the
//! version check that follows every read rejects it. [`Word`] is the
//! bijection between a type and its 64-bit cell.
//!
//! Hashed leaves consume the key through a pluggable [`HashFn`]; the bytes
//! fed to it are the little-endian encoding of the key's word.

use std::fmt::Debug;

/// A value that round-trips through one 64-bit word.
pub trait Word: Copy + Send + Sync + 'static {
    /// Encode into the atomic cell representation.
    fn to_word(self) -> u64;

    /// Decode from the atomic cell representation.
    ///
    /// Must accept any word produced by [`Word::to_word`]. Words read
    /// optimistically may be garbage, so decoding must never panic.
    fn from_word(word: u64) -> Self;
}

/// A totally ordered index key.
pub trait IndexKey: Word + Ord + Debug {
    /// Bytes fed to the leaf hash functions.
    #[inline(always)]
    fn hash_bytes(self) -> [u8; 8] {
        self.to_word().to_le_bytes()
    }
}

/// An opaque value stored in leaves.
pub trait IndexValue: Word {}

impl<T: Word> IndexValue for T {}

macro_rules! impl_word_unsigned {
    ($($t:ty),*) => {$(
        impl Word for $t {
            #[inline(always)]
            fn to_word(self) -> u64 {
                self as u64
            }

            #[inline(always)]
            #[allow(clippy::cast_possible_truncation)]
            fn from_word(word: u64) -> Self {
                word as $t
            }
        }

        impl IndexKey for $t {}
    )*};
}

macro_rules! impl_word_signed {
    ($($t:ty),*) => {$(
        impl Word for $t {
            #[inline(always)]
            #[allow(clippy::cast_sign_loss)]
            fn to_word(self) -> u64 {
                self as i64 as u64
            }

            #[inline(always)]
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            fn from_word(word: u64) -> Self {
                word as i64 as $t
            }
        }

        impl IndexKey for $t {}
    )*};
}

impl_word_unsigned!(u8, u16, u32, u64, usize);
impl_word_signed!(i8, i16, i32, i64, isize);

impl Word for bool {
    #[inline(always)]
    fn to_word(self) -> u64 {
        u64::from(self)
    }

    #[inline(always)]
    fn from_word(word: u64) -> Self {
        word != 0
    }
}

impl Word for f64 {
    #[inline(always)]
    fn to_word(self) -> u64 {
        self.to_bits()
    }

    #[inline(always)]
    fn from_word(word: u64) -> Self {
        Self::from_bits(word)
    }
}

impl Word for char {
    #[inline(always)]
    fn to_word(self) -> u64 {
        u64::from(u32::from(self))
    }

    #[inline(always)]
    #[allow(clippy::cast_possible_truncation)]
    fn from_word(word: u64) -> Self {
        Self::from_u32(word as u32).unwrap_or(Self::REPLACEMENT_CHARACTER)
    }
}

impl IndexKey for char {}

// ============================================================================
//  Hashing
// ============================================================================

/// A seeded hash function over key bytes.
///
/// Hashed leaves call it once per candidate bucket with seeds
/// `0..hash_funcs`; different seeds must behave as independent functions.
pub type HashFn = fn(&[u8], u64) -> u64;

/// Default [`HashFn`], built on `ahash` with the seed folded into its keys.
#[must_use]
pub fn default_hash(bytes: &[u8], seed: u64) -> u64 {
    let state = ahash::RandomState::with_seeds(
        seed,
        seed ^ 0x9e37_79b9_7f4a_7c15,
        0x517c_c1b7_2722_0a95,
        0xbf58_476d_1ce4_e5b9,
    );
    state.hash_one(bytes)
}

/// Fingerprint tag derived from a key hash.
///
/// Never zero: a zero fingerprint marks an empty bucket slot.
#[inline(always)]
#[must_use]
pub const fn fingerprint(hash: u64) -> u8 {
    ((hash >> 56) as u8) | 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_roundtrip_signed() {
        for v in [i64::MIN, -1, 0, 1, i64::MAX] {
            assert_eq!(i64::from_word(v.to_word()), v);
        }
        assert_eq!(i32::from_word((-7i32).to_word()), -7);
    }

    #[test]
    fn test_char_garbage_word_does_not_panic() {
        assert_eq!(char::from_word(0xD800), char::REPLACEMENT_CHARACTER);
        assert_eq!(char::from_word('x'.to_word()), 'x');
    }

    #[test]
    fn test_default_hash_seeds_differ() {
        let bytes = 42u64.hash_bytes();
        assert_ne!(default_hash(&bytes, 0), default_hash(&bytes, 1));
        assert_eq!(default_hash(&bytes, 3), default_hash(&bytes, 3));
    }

    #[test]
    fn test_fingerprint_never_zero() {
        for h in [0u64, 1, u64::MAX, 0x00ff_ffff_ffff_ffff] {
            assert_ne!(fingerprint(h), 0);
        }
    }
}
