use crate::{error::Error, hash::murmur3_x86_32, Result};
use std::fmt;

/// Seed used when keys are hashed by the estimator itself rather than by an
/// embedding sketch.
const DEFAULT_HASH_SEED: u32 = 314;

/// HyperLogLog cardinality estimator over 2^k byte-wide rank registers.
#[derive(Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    k: u32,
    registers: Box<[u8]>,
}

impl HyperLogLog {
    pub fn new(k: u32) -> Self {
        assert!((1..=30).contains(&k), "2^{k} registers are not addressable by a 32-bit hash");
        Self {
            k,
            registers: vec![0; 1 << k].into_boxed_slice(),
        }
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn size(&self) -> usize {
        self.registers.len()
    }

    /// Records a precomputed 32-bit hash. The top k bits pick a register,
    /// the rank is the position of the first set bit in the rest.
    pub fn add(&mut self, hash: u32) {
        let index = (hash >> (32 - self.k)) as usize;
        let rank = (((hash << self.k) >> self.k).leading_zeros() - self.k + 1) as u8;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    pub fn add_bytes(&mut self, key: impl AsRef<[u8]>) {
        self.add(murmur3_x86_32(key.as_ref(), DEFAULT_HASH_SEED));
    }

    pub fn cardinality(&self) -> f64 {
        const TWO_32: f64 = 4294967296.0;

        let size = self.registers.len() as f64;
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / size),
        };

        let mut sum = 0.0;
        for &rank in self.registers.iter() {
            sum += 2f64.powi(-(rank as i32));
        }
        let mut estimate = alpha * size * size / sum;

        if estimate <= 2.5 * size {
            let zeros = self.registers.iter().filter(|&&rank| rank == 0).count();
            if zeros != 0 {
                estimate = size * (size / zeros as f64).ln();
            }
        }
        if estimate > TWO_32 / 30.0 {
            estimate = -TWO_32 * (1.0 - estimate / TWO_32).ln();
        }
        estimate
    }

    /// Register-wise max. `other` is unaffected.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if other.registers.len() != self.registers.len() {
            return Err(Error::RegisterCountMismatch);
        }
        for (dest, &src) in self.registers.iter_mut().zip(other.registers.iter()) {
            if src > *dest {
                *dest = src;
            }
        }
        Ok(())
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    pub(crate) fn load_registers(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.registers.len() {
            return Err(Error::InvalidDump("register block length mismatch"));
        }
        self.registers.copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for HyperLogLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperLogLog")
            .field("k", &self.k)
            .field("size", &self.registers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::{
        rand_core::{RngCore, SeedableRng},
        Xoshiro256PlusPlus,
    };

    #[test]
    fn rank_and_index() {
        let mut hll = HyperLogLog::new(16);
        hll.add(0xabcd0001);
        assert_eq!(hll.registers()[0xabcd], 16); // 15 leading zeros in the low half, rank 16
        hll.add(0xabcd0000);
        assert_eq!(hll.registers()[0xabcd], 17); // all-zero low half saturates the rank
        hll.add(0xabcd8000);
        assert_eq!(hll.registers()[0xabcd], 17); // lower rank never overwrites
    }

    #[test]
    fn small_range_correction() {
        let mut hll = HyperLogLog::new(4);
        for index in 1..=3u32 {
            // rank 1 in three distinct registers
            hll.add((index << 28) | 0x0800_0000);
        }
        let expected = 16.0 * (16.0f64 / 13.0).ln();
        assert!((hll.cardinality() - expected).abs() < 1e-9);
        assert_eq!(hll.cardinality() as u64, 3);
    }

    #[test]
    fn merge_takes_register_max() {
        let mut a = HyperLogLog::new(4);
        let mut b = HyperLogLog::new(4);
        a.add(0x1800_0000); // register 1
        b.add(0x1400_0000); // register 1, higher rank
        b.add(0x2800_0000); // register 2
        a.merge(&b).unwrap();
        assert_eq!(a.registers()[1], 2);
        assert_eq!(a.registers()[2], 1);
        assert_eq!(
            HyperLogLog::new(4).merge(&HyperLogLog::new(8)),
            Err(Error::RegisterCountMismatch)
        );
    }

    #[test]
    fn registers_are_monotone() {
        let mut hll = HyperLogLog::new(8);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let initial = hll.cardinality();
        let mut prev = hll.registers().to_vec();
        for _ in 0..1000 {
            hll.add(rng.next_u32());
            for (new, old) in hll.registers().iter().zip(&prev) {
                assert!(new >= old);
            }
            prev = hll.registers().to_vec();
        }
        assert!(hll.cardinality() >= initial);
    }

    #[test]
    fn approximation_error() {
        let mut hll = HyperLogLog::new(16);
        let mut checkpoint = 100;
        for i in 1i64..=100_000 {
            hll.add_bytes(i.to_le_bytes());
            if i != checkpoint {
                continue;
            }
            let estimate = hll.cardinality();
            let max_err = (i as f64 * 0.05).max(5.0);
            assert!(
                (estimate - i as f64).abs() <= max_err,
                "estimate {estimate} for {i} distinct keys"
            );
            checkpoint *= 10;
        }
    }
}
