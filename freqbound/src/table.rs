use crate::{
    error::Error, floor_power_of_two, hash::murmur3_x86_32, hyperloglog::HyperLogLog, Result,
};
use bstr::ByteSlice;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

const HASH_SEED: u32 = 42;
const HLL_K: u32 = 16;
const MIN_BUCKETS: u64 = 4;
const HISTO_BUCKETS: usize = 256;
/// Bytes per cell record in a dump: a pointer-wide occupancy flag plus the
/// count. Also the per-bucket cost used to turn a memory budget into a
/// bucket count.
const CELL_RECORD_BYTES: usize = 16;
const MAX_CHUNK_CELLS: usize = 1 << 24;

/// Construction parameters for [`BoundedCounter`]. At least one of
/// `size_mb` and `buckets` is required; an explicit bucket count wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableParams {
    pub size_mb: Option<u64>,
    pub buckets: Option<u64>,
    pub use_unicode: bool,
}

impl Default for TableParams {
    fn default() -> Self {
        Self {
            size_mb: None,
            buckets: None,
            use_unicode: true,
        }
    }
}

impl TableParams {
    pub fn build(self) -> Result<BoundedCounter> {
        let requested = match (self.size_mb, self.buckets) {
            (_, Some(buckets)) => buckets,
            (Some(size_mb), None) => size_mb.saturating_mul(1 << 19) / CELL_RECORD_BYTES as u64,
            (None, None) => return Err(Error::MissingCapacity),
        };
        let buckets = floor_power_of_two(requested);
        if buckets < MIN_BUCKETS {
            return Err(Error::TableTooSmall);
        }
        Ok(BoundedCounter {
            slots: vec![Slot::default(); buckets as usize],
            hash_mask: buckets as usize - 1,
            size: 0,
            total: 0,
            str_allocated: 0,
            histo: [0; HISTO_BUCKETS],
            max_prune: 0,
            hll: HyperLogLog::new(HLL_K),
            use_unicode: self.use_unicode,
            size_mb: self.size_mb,
        })
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
struct Slot {
    key: Option<Box<[u8]>>,
    count: i64,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{:?}={}", key.as_bstr(), self.count),
            None => f.write_str("(empty)"),
        }
    }
}

/// Exact counter over byte-string keys in a fixed number of buckets.
/// Open-addressed with linear probing; when load reaches 3/4 the
/// lowest-count keys are evicted, guided by a 256-bucket histogram of
/// counts. `total` keeps counting every increment ever requested, while
/// lookups and iteration reflect only the surviving keys.
#[derive(Clone, PartialEq, Eq)]
pub struct BoundedCounter {
    slots: Vec<Slot>,
    hash_mask: usize,
    size: usize,
    total: i64,
    str_allocated: u64,
    histo: [u32; HISTO_BUCKETS],
    max_prune: i64,
    hll: HyperLogLog,
    use_unicode: bool,
    size_mb: Option<u64>,
}

impl BoundedCounter {
    pub fn with_buckets(buckets: u64) -> Result<Self> {
        TableParams {
            buckets: Some(buckets),
            ..TableParams::default()
        }
        .build()
    }

    pub fn with_size_mb(size_mb: u64) -> Result<Self> {
        TableParams {
            size_mb: Some(size_mb),
            ..TableParams::default()
        }
        .build()
    }

    pub fn buckets(&self) -> usize {
        self.slots.len()
    }

    /// Sum of all increments ever requested; pruning does not lower it.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Number of keys with a non-zero count.
    pub fn len(&self) -> u64 {
        self.size as u64 - self.histo[0] as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Greatest prune boundary ever applied; 0 while the table is exact.
    pub fn max_prune(&self) -> i64 {
        self.max_prune
    }

    pub fn use_unicode(&self) -> bool {
        self.use_unicode
    }

    /// Exact while nothing was ever pruned, an estimate afterwards.
    /// Deletions never rewind the estimator, so after deletions this is an
    /// upper bound rather than an estimate.
    pub fn cardinality(&self) -> u64 {
        if self.max_prune == 0 {
            self.len()
        } else {
            self.hll.cardinality() as u64
        }
    }

    /// Estimated load relative to the prune threshold.
    pub fn quality(&self) -> f64 {
        let estimate = if self.max_prune == 0 {
            self.len() as f64
        } else {
            self.hll.cardinality()
        };
        estimate / (self.slots.len() as f64 * 0.75)
    }

    fn validate_key(key: &[u8]) -> Result<()> {
        if key.contains(&0) {
            return Err(Error::NulInKey);
        }
        Ok(())
    }

    fn probe(&self, key: &[u8], hash: u32) -> (usize, bool) {
        let mut index = hash as usize & self.hash_mask;
        loop {
            match &self.slots[index].key {
                None => return (index, false),
                Some(existing) if existing.as_ref() == key => return (index, true),
                Some(_) => index = (index + 1) & self.hash_mask,
            }
        }
    }

    fn load_limit(&self) -> usize {
        self.slots.len() / 4 * 3
    }

    /// Slot for a key that is about to receive a count, allocating (and
    /// pruning, at the load limit) when the key is new.
    fn slot_for_update(&mut self, key: &[u8], hash: u32) -> usize {
        let (mut index, found) = self.probe(key, hash);
        if found {
            return index;
        }
        if self.size >= self.load_limit() {
            let boundary = self.prune_size_boundary();
            self.prune_to(boundary);
            index = self.probe(key, hash).0;
        }
        let slot = &mut self.slots[index];
        slot.key = Some(key.into());
        slot.count = 0;
        self.histo[0] += 1;
        self.size += 1;
        self.str_allocated += key.len() as u64 + 1;
        index
    }

    pub fn increment(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        self.increment_by(key, 1)
    }

    pub fn increment_by(&mut self, key: impl AsRef<[u8]>, n: i64) -> Result<()> {
        let key = key.as_ref();
        Self::validate_key(key)?;
        if n < 0 {
            return Err(Error::NegativeIncrement);
        }
        if n == 0 {
            return Ok(());
        }
        let hash = murmur3_x86_32(key, HASH_SEED);
        let index = self.slot_for_update(key, hash);
        let slot = &mut self.slots[index];
        if slot.count > i64::MAX - n {
            return Err(Error::CounterOverflow);
        }
        self.total += n;
        self.histo[count_bucket(slot.count)] -= 1;
        slot.count += n;
        self.histo[count_bucket(slot.count)] += 1;
        // the estimator gets the unmasked hash, not the bucket index
        self.hll.add(hash);
        Ok(())
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> i64 {
        let key = key.as_ref();
        let (index, found) = self.probe(key, murmur3_x86_32(key, HASH_SEED));
        if found {
            self.slots[index].count
        } else {
            0
        }
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, count: i64) -> Result<()> {
        let key = key.as_ref();
        Self::validate_key(key)?;
        if count < 0 {
            return Err(Error::NegativeCount);
        }
        let hash = murmur3_x86_32(key, HASH_SEED);
        if count == 0 {
            let (index, found) = self.probe(key, hash);
            if found {
                let slot = &mut self.slots[index];
                self.total -= slot.count;
                self.histo[count_bucket(slot.count)] -= 1;
                slot.count = 0;
                self.histo[0] += 1;
            }
            return Ok(());
        }
        let index = self.slot_for_update(key, hash);
        let slot = &mut self.slots[index];
        self.total += count - slot.count;
        self.histo[count_bucket(slot.count)] -= 1;
        slot.count = count;
        self.histo[count_bucket(slot.count)] += 1;
        self.hll.add(hash);
        Ok(())
    }

    /// Clears the count but keeps the key in its slot, so probe chains
    /// running through it stay intact.
    pub fn remove(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        self.set(key, 0)
    }

    /// Evicts every key whose count is at most `boundary`.
    pub fn prune(&mut self, boundary: i64) -> Result<()> {
        if boundary < 0 {
            return Err(Error::NegativeBoundary);
        }
        self.prune_to(boundary);
        Ok(())
    }

    /// Smallest boundary that evicts enough cells to bring the table back
    /// to half capacity, at histogram granularity.
    fn prune_size_boundary(&self) -> i64 {
        let needed = (self.size as u64).saturating_sub(self.slots.len() as u64 / 2);
        let mut cumulative = 0u64;
        for (index, &count) in self.histo.iter().enumerate() {
            cumulative += count as u64;
            if cumulative >= needed {
                return if index + 1 < HISTO_BUCKETS {
                    bucket_floor(index + 1) - 1
                } else {
                    i64::MAX
                };
            }
        }
        i64::MAX
    }

    fn prune_to(&mut self, boundary: i64) {
        if boundary > self.max_prune {
            self.max_prune = boundary;
        }
        // The load bound keeps at least one slot empty. Anchoring the sweep
        // there means every surviving cell's home bucket lies at or after
        // the anchor in sweep order, which makes backward moves safe.
        let Some(anchor) = self.slots.iter().position(|slot| slot.key.is_none()) else {
            return;
        };
        let mask = self.hash_mask;
        let before = self.size;
        self.histo = [0; HISTO_BUCKETS];
        let mut last_free = anchor;
        let mut kept = 0usize;
        for step in 1..self.slots.len() {
            let index = (anchor + step) & mask;
            let Some(key) = self.slots[index].key.as_deref() else {
                last_free = index;
                continue;
            };
            if self.slots[index].count <= boundary {
                self.str_allocated -= key.len() as u64 + 1;
                self.slots[index] = Slot::default();
                last_free = index;
                continue;
            }
            let home = murmur3_x86_32(key, HASH_SEED) as usize & mask;
            let count = self.slots[index].count;
            let free_distance = index.wrapping_sub(last_free) & mask;
            let home_distance = index.wrapping_sub(home) & mask;
            // When the most recent hole is behind the home bucket, every
            // slot from home to here is occupied and the cell must stay.
            // Otherwise a hole opened inside the probe window: move the
            // cell to the first empty slot at or after its home bucket.
            if free_distance <= home_distance {
                let mut dest = home;
                while self.slots[dest].key.is_some() {
                    dest = (dest + 1) & mask;
                }
                self.slots[dest] = std::mem::take(&mut self.slots[index]);
                last_free = index;
            }
            kept += 1;
            self.histo[count_bucket(count)] += 1;
        }
        self.size = kept;
        tracing::debug!(
            "pruned {} of {} cells at boundary {}",
            before - kept,
            before,
            boundary
        );
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

    /// Adds every live count of `other` to this table, one increment at a
    /// time; counts `other` lost to pruning are gone and stay gone.
    pub fn merge(&mut self, other: &BoundedCounter) -> Result<()> {
        for (key, count) in other.iter() {
            self.increment_by(key, count)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            slots: &self.slots,
            index: 0,
        }
    }

    pub fn keys(&self) -> Keys<'_> {
        Keys(self.iter())
    }

    pub fn values(&self) -> Values<'_> {
        Values(self.iter())
    }

    pub fn dump(&self) -> TableDump {
        let mut chunks = Vec::new();
        let mut strings = Vec::with_capacity(self.str_allocated as usize);
        for cells in self.slots.chunks(MAX_CHUNK_CELLS) {
            let mut chunk = Vec::with_capacity(cells.len() * CELL_RECORD_BYTES);
            for slot in cells {
                // Key pointers are not portable; they dump as a bare
                // occupancy flag and the keys travel in the strings block.
                chunk.extend_from_slice(&(slot.key.is_some() as u64).to_ne_bytes());
                chunk.extend_from_slice(&slot.count.to_ne_bytes());
                if let Some(key) = slot.key.as_deref() {
                    strings.extend_from_slice(key);
                    strings.push(0);
                }
            }
            chunks.push(Bytes::from(chunk));
        }
        let mut histogram = Vec::with_capacity(HISTO_BUCKETS * 4);
        for &count in &self.histo {
            histogram.extend_from_slice(&count.to_ne_bytes());
        }
        TableDump {
            size_mb: self.size_mb,
            buckets: self.slots.len() as u64,
            total: self.total,
            str_allocated: self.str_allocated,
            size: self.size as u32,
            max_prune: self.max_prune,
            table_chunks: chunks,
            strings: strings.into(),
            histogram: histogram.into(),
            hll_registers: Bytes::copy_from_slice(self.hll.registers()),
        }
    }

    pub fn restore(dump: &TableDump) -> Result<Self> {
        let mut table = TableParams {
            size_mb: dump.size_mb,
            buckets: Some(dump.buckets),
            ..TableParams::default()
        }
        .build()?;
        if table.slots.len() as u64 != dump.buckets {
            return Err(Error::InvalidDump("bucket count is not a power of two"));
        }
        let mut strings = &dump.strings[..];
        let mut index = 0usize;
        let mut size = 0usize;
        let mut str_allocated = 0u64;
        for chunk in &dump.table_chunks {
            if chunk.len() % CELL_RECORD_BYTES != 0
                || chunk.len() / CELL_RECORD_BYTES > MAX_CHUNK_CELLS
            {
                return Err(Error::InvalidDump("malformed table chunk"));
            }
            for record in chunk.chunks_exact(CELL_RECORD_BYTES) {
                if index >= table.slots.len() {
                    return Err(Error::InvalidDump("more cell records than buckets"));
                }
                let occupied = u64::from_ne_bytes(record[..8].try_into().unwrap());
                let count = i64::from_ne_bytes(record[8..].try_into().unwrap());
                match occupied {
                    0 if count == 0 => {}
                    0 => return Err(Error::InvalidDump("count on an empty cell")),
                    1 => {
                        if count < 0 {
                            return Err(Error::InvalidDump("negative count"));
                        }
                        let Some(end) = strings.find_byte(0) else {
                            return Err(Error::InvalidDump("strings block exhausted"));
                        };
                        let key: Box<[u8]> = strings[..end].into();
                        strings = &strings[end + 1..];
                        str_allocated += key.len() as u64 + 1;
                        table.slots[index] = Slot {
                            key: Some(key),
                            count,
                        };
                        size += 1;
                    }
                    _ => return Err(Error::InvalidDump("invalid occupancy flag")),
                }
                index += 1;
            }
        }
        if index != table.slots.len() {
            return Err(Error::InvalidDump("cell record count mismatch"));
        }
        if !strings.is_empty() || str_allocated != dump.str_allocated {
            return Err(Error::InvalidDump("strings block length mismatch"));
        }
        if size != dump.size as usize {
            return Err(Error::InvalidDump("occupied cell count mismatch"));
        }
        if dump.histogram.len() != HISTO_BUCKETS * 4 {
            return Err(Error::InvalidDump("histogram block length mismatch"));
        }
        for (bucket, bytes) in table.histo.iter_mut().zip(dump.histogram.chunks_exact(4)) {
            *bucket = u32::from_ne_bytes(bytes.try_into().unwrap());
        }
        table.hll.load_registers(&dump.hll_registers)?;
        table.total = dump.total;
        table.str_allocated = dump.str_allocated;
        table.size = size;
        table.max_prune = dump.max_prune;
        Ok(table)
    }
}

impl fmt::Debug for BoundedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCounter")
            .field("buckets", &self.slots.len())
            .field("len", &self.len())
            .field("total", &self.total)
            .field("max_prune", &self.max_prune)
            .finish_non_exhaustive()
    }
}

impl<'a> IntoIterator for &'a BoundedCounter {
    type Item = (&'a [u8], i64);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Cursor over live cells, in table order. Keys with a zero count are
/// skipped.
pub struct Iter<'a> {
    slots: &'a [Slot],
    index: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], i64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.slots.len() {
            let slot = &self.slots[self.index];
            self.index += 1;
            if slot.count > 0 {
                if let Some(key) = slot.key.as_deref() {
                    return Some((key, slot.count));
                }
            }
        }
        None
    }
}

pub struct Keys<'a>(Iter<'a>);

impl<'a> Iterator for Keys<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(key, _)| key)
    }
}

pub struct Values<'a>(Iter<'a>);

impl Iterator for Values<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(_, count)| count)
    }
}

/// Histogram bucket for a count, using the base-8 log-cell layout: exact
/// below 16, then eight mantissa steps per power of two.
fn count_bucket(count: i64) -> usize {
    debug_assert!(count >= 0);
    if count < 16 {
        count as usize
    } else if count >= 0x3C0000000 {
        255
    } else {
        let exponent = 64 - count.leading_zeros() as usize - 3;
        (exponent << 3) | ((count >> (exponent - 1)) as usize & 7)
    }
}

/// Smallest count that lands in `index`; inverse of [`count_bucket`].
fn bucket_floor(index: usize) -> i64 {
    if index < 16 {
        index as i64
    } else {
        ((8 + (index & 7)) as i64) << ((index >> 3) - 1)
    }
}

/// Byte-exact table state. Cell records travel in chunks of at most 2^24
/// cells; occupied slots re-read their keys from `strings` in table order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDump {
    pub size_mb: Option<u64>,
    pub buckets: u64,
    pub total: i64,
    pub str_allocated: u64,
    pub size: u32,
    pub max_prune: i64,
    pub table_chunks: Vec<Bytes>,
    pub strings: Bytes,
    pub histogram: Bytes,
    pub hll_registers: Bytes,
}
