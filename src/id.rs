//! M-bit ring identifiers and their modular algebra.
//!
//! An [Id] is an unsigned big-endian integer of M bits, where M is fixed by
//! the configured hash primitive (160 for sha1). All identifiers of one ring
//! share the same width, so byte-wise lexicographic comparison is unsigned
//! comparison and the derived `Ord` is the ring order.

use std::fmt;

use num_bigint::BigUint;
use serde::Deserialize;
use serde::Serialize;

/// An identifier on the ring R(2^M).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(Vec<u8>);

impl Id {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Parse a hex string into an Id. Test helper and REPL convenience.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Bit width of this identifier.
    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }

    /// Clockwise distance from `self` to `other`, i.e. `(other - self) mod 2^M`.
    /// Used to merge candidate streams by how far back from a key they sit.
    pub fn distance_to(&self, other: &Id, bits: usize) -> BigUint {
        let ring = BigUint::from(2u8).pow(bits as u32);
        let a = BigUint::from_bytes_be(&self.0);
        let b = BigUint::from_bytes_be(&other.0);
        (ring.clone() + b - a) % ring
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl From<&Id> for BigUint {
    fn from(id: &Id) -> BigUint {
        BigUint::from_bytes_be(&id.0)
    }
}

/// True iff `x` lies strictly inside the open arc `(a, b)` going clockwise.
/// When `a == b` the arc is the whole circle minus the point `a`.
pub fn between(a: &Id, b: &Id, x: &Id) -> bool {
    if a == b {
        return x != a;
    }
    if a < b {
        a < x && x < b
    } else {
        // The arc wraps through zero.
        a < x || x < b
    }
}

/// True iff `x` lies inside the half-open arc `(a, b]` going clockwise.
/// When `a == b` the arc wraps the full circle, so every `x` qualifies.
pub fn between_right_incl(a: &Id, b: &Id, x: &Id) -> bool {
    if a == b {
        return true;
    }
    if a < b {
        a < x && x <= b
    } else {
        a < x || x <= b
    }
}

/// `(id + 2^k) mod 2^M`, re-padded to M/8 big-endian bytes.
pub fn power_offset(id: &Id, k: usize, bits: usize) -> Id {
    let ring = BigUint::from(2u8).pow(bits as u32);
    let sum = (BigUint::from_bytes_be(id.as_bytes()) + BigUint::from(2u8).pow(k as u32)) % ring;
    let mut bytes = sum.to_bytes_be();
    let width = bits / 8;
    let mut padded = vec![0u8; width - bytes.len()];
    padded.append(&mut bytes);
    Id(padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Id {
        Id::from_hex(s).unwrap()
    }

    #[test]
    fn test_between_plain_arc() {
        let (a, b) = (id("20"), id("c0"));
        assert!(between(&a, &b, &id("80")));
        assert!(!between(&a, &b, &id("20")));
        assert!(!between(&a, &b, &id("c0")));
        assert!(!between(&a, &b, &id("f0")));
    }

    #[test]
    fn test_between_wrapped_arc() {
        let (a, b) = (id("c0"), id("20"));
        assert!(between(&a, &b, &id("f0")));
        assert!(between(&a, &b, &id("10")));
        assert!(!between(&a, &b, &id("80")));
        assert!(!between(&a, &b, &id("c0")));
        assert!(!between(&a, &b, &id("20")));
    }

    #[test]
    fn test_between_degenerate_arc() {
        let a = id("42");
        assert!(!between(&a, &a, &a));
        assert!(between(&a, &a, &id("00")));
        assert!(between(&a, &a, &id("ff")));
    }

    #[test]
    fn test_between_right_incl() {
        let (a, b) = (id("20"), id("c0"));
        assert!(between_right_incl(&a, &b, &id("c0")));
        assert!(!between_right_incl(&a, &b, &id("20")));

        let (a, b) = (id("c0"), id("20"));
        assert!(between_right_incl(&a, &b, &id("20")));
        assert!(between_right_incl(&a, &b, &id("01")));
        assert!(!between_right_incl(&a, &b, &id("c0")));

        // (a, a] covers the whole circle, a itself included.
        let a = id("42");
        assert!(between_right_incl(&a, &a, &a));
        assert!(between_right_incl(&a, &a, &id("00")));
        assert!(between_right_incl(&a, &a, &id("ff")));
    }

    #[test]
    fn test_power_offset() {
        let zero = id("0000");
        assert_eq!(power_offset(&zero, 0, 16), id("0001"));
        assert_eq!(power_offset(&zero, 15, 16), id("8000"));

        // Wraps around the top of the ring.
        let high = id("ffff");
        assert_eq!(power_offset(&high, 0, 16), id("0000"));
        assert_eq!(power_offset(&high, 15, 16), id("7fff"));
    }

    #[test]
    fn test_power_offset_keeps_width() {
        let low = id("00000001");
        let shifted = power_offset(&low, 2, 32);
        assert_eq!(shifted.as_bytes().len(), 4);
        assert_eq!(shifted, id("00000005"));
    }

    #[test]
    fn test_distance_to() {
        let (a, b) = (id("10"), id("30"));
        assert_eq!(a.distance_to(&b, 8), BigUint::from(0x20u8));
        assert_eq!(b.distance_to(&a, 8), BigUint::from(0xe0u8));
        assert_eq!(a.distance_to(&a, 8), BigUint::from(0u8));
    }
}
