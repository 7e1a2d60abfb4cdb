//! Index key traits and fixed-width generic keys.

use std::cmp::Ordering;

/// A fixed-width key storable inline in tree pages.
///
/// Keys encode to exactly `ENCODED_SIZE` bytes; encoding and decoding are
/// infallible. Ordering is supplied separately through a [`KeyComparator`],
/// so the same storage format can serve multiple collations.
pub trait IndexKey: Copy + Send + Sync + std::fmt::Debug + 'static {
    /// On-page size of an encoded key in bytes.
    const ENCODED_SIZE: usize;

    /// Encodes this key into the first `ENCODED_SIZE` bytes of `buf`.
    fn encode_into(&self, buf: &mut [u8]);

    /// Decodes a key from the first `ENCODED_SIZE` bytes of `buf`.
    fn decode(buf: &[u8]) -> Self;
}

/// Total-order comparator over keys.
pub trait KeyComparator<K>: Send + Sync {
    /// Compares two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Comparator that uses the key type's own `Ord` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// An opaque fixed-width key of `N` bytes.
///
/// The tree is instantiated for several widths (4, 8, 16, 32, 64 bytes)
/// selected at construction. Byte order is the key's collation order under
/// [`OrdComparator`], so integer-derived keys are stored big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenericKey<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> GenericKey<N> {
    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Reinterprets the tail of the key as a big-endian integer.
    ///
    /// Inverse of the `From<u64>` construction for values that fit.
    pub fn as_u64(&self) -> u64 {
        let mut be = [0u8; 8];
        if N >= 8 {
            be.copy_from_slice(&self.bytes[N - 8..]);
        } else {
            be[8 - N..].copy_from_slice(&self.bytes);
        }
        u64::from_be_bytes(be)
    }
}

impl<const N: usize> From<u64> for GenericKey<N> {
    /// Builds a key whose byte order matches the integer order.
    ///
    /// The value is written big-endian into the tail of the key; for
    /// widths under 8 bytes the value is truncated to the low bytes.
    fn from(value: u64) -> Self {
        let mut bytes = [0u8; N];
        let be = value.to_be_bytes();
        if N >= 8 {
            bytes[N - 8..].copy_from_slice(&be);
        } else {
            bytes.copy_from_slice(&be[8 - N..]);
        }
        Self { bytes }
    }
}

impl<const N: usize> IndexKey for GenericKey<N> {
    const ENCODED_SIZE: usize = N;

    #[inline]
    fn encode_into(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.bytes);
    }

    #[inline]
    fn decode(buf: &[u8]) -> Self {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&buf[..N]);
        Self { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_key_from_u64_roundtrip() {
        for value in [0u64, 1, 255, 256, 1 << 20, u32::MAX as u64, 1 << 40] {
            let key = GenericKey::<8>::from(value);
            assert_eq!(key.as_u64(), value);
        }
    }

    #[test]
    fn test_generic_key_ordering_matches_integers() {
        let a = GenericKey::<8>::from(3);
        let b = GenericKey::<8>::from(200);
        let c = GenericKey::<8>::from(70_000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_generic_key_ordering_wide_widths() {
        let a = GenericKey::<16>::from(9);
        let b = GenericKey::<16>::from(10);
        assert!(a < b);

        let a = GenericKey::<64>::from(1 << 50);
        let b = GenericKey::<64>::from((1 << 50) + 1);
        assert!(a < b);
    }

    #[test]
    fn test_generic_key_narrow_width() {
        let a = GenericKey::<4>::from(5);
        let b = GenericKey::<4>::from(6);
        assert!(a < b);
        assert_eq!(a.as_u64(), 5);
    }

    #[test]
    fn test_generic_key_encode_decode() {
        let key = GenericKey::<32>::from(123_456);
        let mut buf = [0u8; 40];
        key.encode_into(&mut buf);
        let decoded = GenericKey::<32>::decode(&buf);
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_encoded_size_matches_width() {
        assert_eq!(GenericKey::<4>::ENCODED_SIZE, 4);
        assert_eq!(GenericKey::<8>::ENCODED_SIZE, 8);
        assert_eq!(GenericKey::<64>::ENCODED_SIZE, 64);
    }

    #[test]
    fn test_ord_comparator() {
        let cmp = OrdComparator;
        let a = GenericKey::<8>::from(1);
        let b = GenericKey::<8>::from(2);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
        assert_eq!(cmp.compare(&b, &a), Ordering::Greater);
        assert_eq!(cmp.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_reverse_comparator_customization() {
        struct ReverseComparator;
        impl<K: Ord> KeyComparator<K> for ReverseComparator {
            fn compare(&self, a: &K, b: &K) -> Ordering {
                b.cmp(a)
            }
        }

        let cmp = ReverseComparator;
        let a = GenericKey::<8>::from(1);
        let b = GenericKey::<8>::from(2);
        assert_eq!(cmp.compare(&a, &b), Ordering::Greater);
    }
}
