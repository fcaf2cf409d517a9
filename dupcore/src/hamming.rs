//! A 64-bit hash under Hamming distance, shared by every index in the core.
//!
//! A `Hamming(u64)` newtype with `distance_to` via `count_ones`, a base64 `Display`, and
//! `rand`-backed test helpers for building hashes at an exact or bounded distance from one
//! another.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Hamming(pub u64);

impl Hamming {
    pub const ZERO: Hamming = Hamming(0);
    pub const ONES: Hamming = Hamming(u64::MAX);

    pub fn distance_to(self, other: Hamming) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn bit(self, i: u32) -> bool {
        debug_assert!(i < 64);
        (self.0 >> i) & 1 == 1
    }

    /// Number of set bits, used by the video-frame "insufficient detail" filter.
    pub fn count_ones(self) -> u32 {
        self.0.count_ones()
    }

    pub fn count_zeros(self) -> u32 {
        self.0.count_zeros()
    }
}

impl From<u64> for Hamming {
    fn from(value: u64) -> Self {
        Hamming(value)
    }
}

impl From<Hamming> for u64 {
    fn from(value: Hamming) -> Self {
        value.0
    }
}

impl fmt::Display for Hamming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base64::encode(self.0.to_be_bytes()))
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::Hamming;
    use rand::Rng;

    /// A hash exactly `dist` bits away from `from`.
    pub fn random_at_distance(rng: &mut impl Rng, from: Hamming, dist: u32) -> Hamming {
        assert!(dist <= 64);
        let mut bits: Vec<u32> = (0..64).collect();
        for i in (1..bits.len()).rev() {
            let j = rng.gen_range(0..=i);
            bits.swap(i, j);
        }
        let mut value = from.0;
        for &b in bits.iter().take(dist as usize) {
            value ^= 1 << b;
        }
        Hamming(value)
    }

    pub fn random_within(rng: &mut impl Rng, from: Hamming, max_dist: u32) -> Hamming {
        let dist = rng.gen_range(0..=max_dist);
        random_at_distance(rng, from, dist)
    }

    pub fn random_outside(rng: &mut impl Rng, from: Hamming, min_dist: u32) -> Hamming {
        let dist = rng.gen_range(min_dist..=64);
        random_at_distance(rng, from, dist)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        let a = Hamming(0x00);
        let b = Hamming(0xFF);
        assert_eq!(a.distance_to(b), b.distance_to(a));
        assert_eq!(a.distance_to(b), 8);
    }

    #[test]
    fn zero_distance_to_self() {
        let a = Hamming(0xDEAD_BEEF_1234_5678);
        assert_eq!(a.distance_to(a), 0);
    }

    #[test]
    fn counts() {
        assert_eq!(Hamming::ZERO.count_ones(), 0);
        assert_eq!(Hamming::ONES.count_ones(), 64);
        assert_eq!(Hamming::ZERO.count_zeros(), 64);
    }
}
