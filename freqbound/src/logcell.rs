//! Shared math for the probabilistic log-encoded counter cells. A cell
//! splits into an exponent (high bits) and a mantissa (low `mantissa_bits`
//! bits); values up to twice the base are stored verbatim, everything above
//! advances with a probability that halves per exponent step, keeping the
//! decoded expectation equal to the true count.

use crate::hash::murmur3_x86_32;
use rand::RngCore;

pub(crate) const fn decode(value: u32, mantissa_bits: u32) -> i64 {
    let base = 1u32 << mantissa_bits;
    if value <= 2 * base {
        value as i64
    } else {
        let mantissa = (value & (base - 1)) as i64;
        let exponent = value >> mantissa_bits;
        (base as i64 + mantissa) << (exponent - 1)
    }
}

pub(crate) fn should_inc<R: RngCore>(value: u32, mantissa_bits: u32, rng: &mut R) -> bool {
    let base = 1u32 << mantissa_bits;
    if value < 2 * base {
        return true;
    }
    probability_mask(value >> mantissa_bits) & rng.next_u32() == 0
}

/// Mask of `exponent - 1` low bits: a draw hits with probability
/// 2^(1 - exponent).
const fn probability_mask(exponent: u32) -> u32 {
    if exponent >= 33 {
        u32::MAX
    } else {
        u32::MAX >> (33 - exponent)
    }
}

/// Combines two cells by re-encoding the sum of their decoded values. The
/// sum rarely lands on a representable value; the remainder below the band's
/// step is resolved by a seeded draw so both sides of a lockstep merge agree.
pub(crate) fn merge(v1: u32, v2: u32, mantissa_bits: u32, seed: u32) -> u32 {
    let base = 1i64 << mantissa_bits;
    let decoded = decode(v1, mantissa_bits) + decode(v2, mantissa_bits);
    if decoded <= 2 * base {
        return decoded as u32;
    }

    let mut exponent = 1u32;
    let mut h = decoded;
    while h >= 2 * base {
        exponent += 1;
        h >>= 1;
    }

    let mask = probability_mask(exponent);
    // The hash input must stay an 8-byte little-endian view of the sum for
    // merges to be reproducible against existing state.
    let r = murmur3_x86_32(&(decoded as u64).to_le_bytes(), seed);
    let remainder = (decoded as u64 & mask as u64) as u32;
    let round_up = (mask & r) < remainder;
    (exponent << mantissa_bits) + (h as u32 & (base as u32 - 1)) + round_up as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::{rand_core::SeedableRng, Xoshiro256PlusPlus};

    #[test]
    fn decode_base8() {
        for value in 0..=16 {
            assert_eq!(decode(value, 3), value as i64);
        }
        assert_eq!(decode(17, 3), 18);
        assert_eq!(decode(24, 3), 32);
        assert_eq!(decode(255, 3), 15 << 30);
    }

    #[test]
    fn decode_base1024() {
        for value in (0..=2048).step_by(97) {
            assert_eq!(decode(value, 10), value as i64);
        }
        assert_eq!(decode(2049, 10), 2050);
        assert_eq!(decode(3072, 10), 4096);
    }

    #[test]
    fn increment_is_deterministic_below_twice_base() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        for value in 0..16 {
            assert!(should_inc(value, 3, &mut rng));
        }
        for value in 0..2048 {
            assert!(should_inc(value, 10, &mut rng));
        }
    }

    #[test]
    fn increment_probability_halves_per_exponent() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let trials = 20_000;
        let hits = |value: u32, rng: &mut Xoshiro256PlusPlus| {
            (0..trials).filter(|_| should_inc(value, 3, rng)).count()
        };
        let at_16 = hits(16, &mut rng); // exponent 2, p = 1/2
        assert!((9_000..=11_000).contains(&at_16), "{at_16}");
        let at_24 = hits(24, &mut rng); // exponent 3, p = 1/4
        assert!((4_200..=5_800).contains(&at_24), "{at_24}");
    }

    #[test]
    fn merge_of_small_sums_is_exact() {
        assert_eq!(merge(10, 5, 3, 99), 15);
        assert_eq!(merge(16, 0, 3, 99), 16);
        assert_eq!(merge(16, 4, 3, 7), 18); // 20 re-encodes exactly
        assert_eq!(merge(17, 17, 3, 123), 25); // 36 re-encodes exactly
        assert_eq!(merge(1024, 1024, 10, 5), 2048);
    }

    #[test]
    fn merge_is_unbiased() {
        // 4099 encodes as 4096 or 4100; the expectation over seeds must
        // stay on the sum.
        let v1 = 2048 + 1024; // decodes to 4096 with base 1024
        assert_eq!(decode(v1, 10), 4096);
        let mut sum = 0i64;
        let trials = 4_000;
        for seed in 0..trials {
            sum += decode(merge(v1, 3, 10, seed), 10);
        }
        let mean = sum as f64 / trials as f64;
        assert!((mean - 4099.0).abs() < 1.0, "{mean}");
    }

    #[test]
    fn counter_expectation_tracks_true_count() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let trials = 400;
        let true_count = 500;
        let mut sum = 0i64;
        for _ in 0..trials {
            let mut cell = 0u32;
            for _ in 0..true_count {
                if should_inc(cell, 3, &mut rng) {
                    cell += 1;
                }
            }
            sum += decode(cell, 3);
        }
        let mean = sum as f64 / trials as f64;
        assert!((mean - true_count as f64).abs() < 50.0, "{mean}");
    }
}
