use crate::{
    error::Error, floor_power_of_two, hash::murmur3_x86_32, hyperloglog::HyperLogLog, logcell,
    Result,
};
use bytes::Bytes;
use rand::RngCore;
use rand_xoshiro::{rand_core::SeedableRng, Xoshiro256PlusPlus};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_DEPTH: usize = 32;

const HLL_K: u32 = 16;
const LOG8_MANTISSA_BITS: u32 = 3;
const LOG1024_MANTISSA_BITS: u32 = 10;

/// Storage primitive of a sketch cell.
pub trait Cell: Copy + Ord + Default + fmt::Debug {
    const BYTES: usize;
    const MAX: Self;

    fn inc(self) -> Self;
    fn add_wrapping(self, n: u64) -> Self;
    fn write_ne(self, out: &mut Vec<u8>);
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_cell {
    ($($t:ty),*) => {$(
        impl Cell for $t {
            const BYTES: usize = std::mem::size_of::<$t>();
            const MAX: Self = <$t>::MAX;

            fn inc(self) -> Self {
                self.wrapping_add(1)
            }

            fn add_wrapping(self, n: u64) -> Self {
                self.wrapping_add(n as $t)
            }

            fn write_ne(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn read_ne(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_ne_bytes(buf)
            }
        }
    )*};
}

impl_cell!(u8, u16, u32, u64);

/// Cell discipline of a sketch variant: how a cell advances, what it decodes
/// to and how two cells combine during a merge.
pub trait CellCodec {
    type Cell: Cell;

    /// Tag identifying the discipline in dumps.
    const TAG: &'static str;

    fn should_inc<R: RngCore>(value: Self::Cell, rng: &mut R) -> bool;
    fn decode(value: Self::Cell) -> i64;
    fn merge_cells(v1: Self::Cell, v2: Self::Cell, merge_seed: u32) -> Self::Cell;

    /// Applies `n` single increments to a cell value.
    fn bump<R: RngCore>(value: Self::Cell, n: i64, rng: &mut R) -> Self::Cell {
        let mut value = value;
        for _ in 0..n {
            if Self::should_inc(value, rng) {
                value = value.inc();
            }
        }
        value
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Linear32;

impl CellCodec for Linear32 {
    type Cell = u32;
    const TAG: &'static str = "cms32";

    fn should_inc<R: RngCore>(_value: u32, _rng: &mut R) -> bool {
        true
    }

    fn decode(value: u32) -> i64 {
        value as i64
    }

    fn merge_cells(v1: u32, v2: u32, _merge_seed: u32) -> u32 {
        v1.wrapping_add(v2)
    }

    fn bump<R: RngCore>(value: u32, n: i64, _rng: &mut R) -> u32 {
        value.add_wrapping(n as u64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Linear64;

impl CellCodec for Linear64 {
    type Cell = u64;
    const TAG: &'static str = "cms64";

    fn should_inc<R: RngCore>(_value: u64, _rng: &mut R) -> bool {
        true
    }

    fn decode(value: u64) -> i64 {
        value as i64
    }

    fn merge_cells(v1: u64, v2: u64, _merge_seed: u32) -> u64 {
        v1.wrapping_add(v2)
    }

    fn bump<R: RngCore>(value: u64, n: i64, _rng: &mut R) -> u64 {
        value.add_wrapping(n as u64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Log8;

impl CellCodec for Log8 {
    type Cell = u8;
    const TAG: &'static str = "log8";

    fn should_inc<R: RngCore>(value: u8, rng: &mut R) -> bool {
        logcell::should_inc(value as u32, LOG8_MANTISSA_BITS, rng)
    }

    fn decode(value: u8) -> i64 {
        logcell::decode(value as u32, LOG8_MANTISSA_BITS)
    }

    fn merge_cells(v1: u8, v2: u8, merge_seed: u32) -> u8 {
        logcell::merge(v1 as u32, v2 as u32, LOG8_MANTISSA_BITS, merge_seed) as u8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Log1024;

impl CellCodec for Log1024 {
    type Cell = u16;
    const TAG: &'static str = "log1024";

    fn should_inc<R: RngCore>(value: u16, rng: &mut R) -> bool {
        logcell::should_inc(value as u32, LOG1024_MANTISSA_BITS, rng)
    }

    fn decode(value: u16) -> i64 {
        logcell::decode(value as u32, LOG1024_MANTISSA_BITS)
    }

    fn merge_cells(v1: u16, v2: u16, merge_seed: u32) -> u16 {
        logcell::merge(v1 as u32, v2 as u32, LOG1024_MANTISSA_BITS, merge_seed) as u16
    }
}

/// Count-Min sketch with conservative update. Row `i` indexes with
/// murmur3 seeded by `i`; an embedded HyperLogLog fed from row 0's hash
/// tracks the number of distinct keys.
#[derive(Clone)]
pub struct CountMin<C: CellCodec> {
    depth: usize,
    width: usize,
    hash_mask: u32,
    total: i64,
    table: Vec<C::Cell>,
    hll: HyperLogLog,
    rng: Xoshiro256PlusPlus,
}

pub type Cms32 = CountMin<Linear32>;
pub type Cms64 = CountMin<Linear64>;
pub type CmsLog8 = CountMin<Log8>;
pub type CmsLog1024 = CountMin<Log1024>;

impl<C: CellCodec> CountMin<C> {
    /// `width` is rounded down to a power of two (0 becomes 1); `depth`
    /// must be between 1 and 32.
    pub fn new(width: u32, depth: u16) -> Result<Self> {
        Self::with_rng(width, depth, seed_from_entropy())
    }

    /// Deterministic twin of [`CountMin::new`] for reproducible runs.
    pub fn with_seed(width: u32, depth: u16, seed: u64) -> Result<Self> {
        Self::with_rng(width, depth, Xoshiro256PlusPlus::seed_from_u64(seed))
    }

    fn with_rng(width: u32, depth: u16, rng: Xoshiro256PlusPlus) -> Result<Self> {
        if depth < 1 || depth as usize > MAX_DEPTH {
            return Err(Error::DepthOutOfRange);
        }
        let width = floor_power_of_two(width as u64) as usize;
        Ok(Self {
            depth: depth as usize,
            width,
            hash_mask: width as u32 - 1,
            total: 0,
            table: vec![C::Cell::default(); depth as usize * width],
            hll: HyperLogLog::new(HLL_K),
            rng,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Sum of all requested increments.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Estimated number of distinct keys seen.
    pub fn cardinality(&self) -> u64 {
        self.hll.cardinality() as u64
    }

    pub fn increment(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        self.increment_by(key, 1)
    }

    pub fn increment_by(&mut self, key: impl AsRef<[u8]>, n: i64) -> Result<()> {
        let key = key.as_ref();
        if n < 0 {
            return Err(Error::NegativeIncrement);
        }
        if n == 0 {
            return Ok(());
        }
        self.total += n;

        let mut buckets = [0usize; MAX_DEPTH];
        let mut values = [C::Cell::default(); MAX_DEPTH];
        let mut min_value = C::Cell::MAX;
        for row in 0..self.depth {
            let hash = murmur3_x86_32(key, row as u32);
            if row == 0 {
                self.hll.add(hash);
            }
            let bucket = (hash & self.hash_mask) as usize;
            let value = self.table[row * self.width + bucket];
            buckets[row] = bucket;
            values[row] = value;
            if value < min_value {
                min_value = value;
            }
        }

        // Conservative update: only cells sitting on the current minimum
        // move, and none past the new minimum.
        let result = C::bump(min_value, n, &mut self.rng);
        if result > min_value {
            for row in 0..self.depth {
                if values[row] < result {
                    self.table[row * self.width + buckets[row]] = result;
                }
            }
        }
        Ok(())
    }

    /// Estimated count for `key`; never below the true count under the
    /// linear disciplines.
    pub fn get(&self, key: impl AsRef<[u8]>) -> i64 {
        let key = key.as_ref();
        let mut min_value = C::Cell::MAX;
        for row in 0..self.depth {
            let hash = murmur3_x86_32(key, row as u32);
            let value = self.table[row * self.width + (hash & self.hash_mask) as usize];
            if value < min_value {
                min_value = value;
            }
        }
        C::decode(min_value)
    }

    /// Folds `other` into `self` cell by cell; `other` is unaffected.
    /// Probabilistic disciplines draw one seed per call, so repeating a
    /// merge in lockstep on both sides gives identical results.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if other.width != self.width || other.depth != self.depth {
            return Err(Error::ShapeMismatch);
        }
        let merge_seed = self.rng.next_u32();
        tracing::trace!("merging {} sketch with seed {:#010x}", C::TAG, merge_seed);
        for (dest, &src) in self.table.iter_mut().zip(&other.table) {
            *dest = C::merge_cells(*dest, src, merge_seed);
        }
        self.total += other.total;
        self.hll.merge(&other.hll)?;
        Ok(())
    }

    pub fn update<I>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        for key in keys {
            self.increment(key)?;
        }
        Ok(())
    }

    pub fn update_counts<I, K>(&mut self, counts: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, i64)>,
        K: AsRef<[u8]>,
    {
        for (key, n) in counts {
            self.increment_by(key, n)?;
        }
        Ok(())
    }

    pub fn dump(&self) -> SketchDump {
        let mut rows = Vec::with_capacity(self.depth);
        for row in self.table.chunks_exact(self.width) {
            let mut bytes = Vec::with_capacity(self.width * C::Cell::BYTES);
            for &cell in row {
                cell.write_ne(&mut bytes);
            }
            rows.push(Bytes::from(bytes));
        }
        SketchDump {
            algorithm: C::TAG.to_owned(),
            width: self.width as u32,
            depth: self.depth as u16,
            rows,
            hll_registers: Bytes::copy_from_slice(self.hll.registers()),
            total: self.total,
        }
    }

    pub fn restore(dump: &SketchDump) -> Result<Self> {
        if dump.algorithm != C::TAG {
            return Err(Error::AlgorithmMismatch {
                expected: C::TAG,
                found: dump.algorithm.clone(),
            });
        }
        let mut sketch = Self::new(dump.width, dump.depth)?;
        if sketch.width != dump.width as usize || dump.rows.len() != sketch.depth {
            return Err(Error::InvalidDump("row count or width mismatch"));
        }
        for (row, bytes) in dump.rows.iter().enumerate() {
            if bytes.len() != sketch.width * C::Cell::BYTES {
                return Err(Error::InvalidDump("row length mismatch"));
            }
            let cells = &mut sketch.table[row * sketch.width..(row + 1) * sketch.width];
            for (cell, chunk) in cells.iter_mut().zip(bytes.chunks_exact(C::Cell::BYTES)) {
                *cell = C::Cell::read_ne(chunk);
            }
        }
        sketch.hll.load_registers(&dump.hll_registers)?;
        sketch.total = dump.total;
        Ok(sketch)
    }
}

// Equality is over observable state; the private RNG is excluded.
impl<C: CellCodec> PartialEq for CountMin<C> {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth
            && self.width == other.width
            && self.total == other.total
            && self.table == other.table
            && self.hll == other.hll
    }
}

impl<C: CellCodec> fmt::Debug for CountMin<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountMin")
            .field("algorithm", &C::TAG)
            .field("width", &self.width)
            .field("depth", &self.depth)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Byte-exact sketch state: one native-endian block per row, the embedded
/// estimator's registers and the increment total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SketchDump {
    pub algorithm: String,
    pub width: u32,
    pub depth: u16,
    pub rows: Vec<Bytes>,
    pub hll_registers: Bytes,
    pub total: i64,
}

fn seed_from_entropy() -> Xoshiro256PlusPlus {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    Xoshiro256PlusPlus::from_seed(seed)
}
