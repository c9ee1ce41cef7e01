//! Interlocked Bitmap
//!
//! A bit array stored as 64-bit chunks, mutated entirely with interlocked
//! operations so that callers need no external lock. The paging-file slot
//! allocator is the primary user: every slot is one bit, and a running
//! `unset_spaces` counter tracks how many slots remain free.
//!
//! Out-of-range queries and failed searches return [`BITMAP_NOT_FOUND`];
//! callers must treat it as "no result".

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Sentinel returned by searches that find nothing.
pub const BITMAP_NOT_FOUND: u64 = u64::MAX;

const BITS_PER_CHUNK: u64 = 64;

/// Lock-free bit array with an interlocked free-space counter.
pub struct InterlockedBitmap {
    data: Box<[AtomicU64]>,
    size_in_bits: u64,
    unset_spaces: AtomicI64,
}

impl InterlockedBitmap {
    /// Create a bitmap with all bits clear.
    pub fn new(size_in_bits: u64) -> Self {
        let chunks = size_in_bits.div_ceil(BITS_PER_CHUNK) as usize;
        let data = (0..chunks).map(|_| AtomicU64::new(0)).collect();
        Self {
            data,
            size_in_bits,
            unset_spaces: AtomicI64::new(size_in_bits as i64),
        }
    }

    /// Number of bits in the bitmap.
    #[inline]
    pub fn size_in_bits(&self) -> u64 {
        self.size_in_bits
    }

    #[inline]
    fn chunk_index(bit_index: u64) -> usize {
        (bit_index / BITS_PER_CHUNK) as usize
    }

    #[inline]
    fn bit_offset(bit_index: u64) -> u32 {
        (bit_index % BITS_PER_CHUNK) as u32
    }

    /// Non-atomic read of a single bit. Out-of-range reads as clear.
    pub fn get_bit(&self, bit_index: u64) -> bool {
        if bit_index >= self.size_in_bits {
            return false;
        }
        let chunk = self.data[Self::chunk_index(bit_index)].load(Ordering::Relaxed);
        (chunk >> Self::bit_offset(bit_index)) & 1 != 0
    }

    /// Atomically set a bit, returning whether it was previously set.
    ///
    /// Out-of-range indices report `true` so that callers treat the claim
    /// as lost.
    pub fn set_bit(&self, bit_index: u64) -> bool {
        if bit_index >= self.size_in_bits {
            return true;
        }
        let mask = 1u64 << Self::bit_offset(bit_index);
        let prior = self.data[Self::chunk_index(bit_index)].fetch_or(mask, Ordering::AcqRel);
        let was_set = prior & mask != 0;
        if !was_set {
            self.unset_spaces.fetch_sub(1, Ordering::AcqRel);
        }
        was_set
    }

    /// Atomically clear a bit, returning whether it was previously set.
    pub fn unset_bit(&self, bit_index: u64) -> bool {
        if bit_index >= self.size_in_bits {
            return false;
        }
        let mask = 1u64 << Self::bit_offset(bit_index);
        let prior = self.data[Self::chunk_index(bit_index)].fetch_and(!mask, Ordering::AcqRel);
        let was_set = prior & mask != 0;
        if was_set {
            self.unset_spaces.fetch_add(1, Ordering::AcqRel);
        }
        was_set
    }

    /// Read an entire chunk. Atomic at chunk width.
    pub fn chunk_value(&self, chunk_index: u64) -> u64 {
        if chunk_index as usize >= self.data.len() {
            return 0;
        }
        self.data[chunk_index as usize].load(Ordering::Acquire)
    }

    /// Compare-and-swap an entire chunk.
    ///
    /// On success `unset_spaces` is adjusted by the population-count delta.
    /// Returns the observed prior value; callers compare it against
    /// `expected` to detect failure. Out-of-range returns the sentinel.
    pub fn cas_chunk(&self, chunk_index: u64, expected: u64, new: u64) -> u64 {
        if chunk_index as usize >= self.data.len() {
            return BITMAP_NOT_FOUND;
        }
        let result = self.data[chunk_index as usize].compare_exchange(
            expected,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match result {
            Ok(prior) => {
                let delta_set = new.count_ones() as i64 - prior.count_ones() as i64;
                self.unset_spaces.fetch_sub(delta_set, Ordering::AcqRel);
                prior
            }
            Err(prior) => prior,
        }
    }

    /// Number of clear bits.
    pub fn unset_spaces(&self) -> u64 {
        self.unset_spaces.load(Ordering::Acquire).max(0) as u64
    }

    /// Number of set bits.
    pub fn set_spaces(&self) -> u64 {
        self.size_in_bits - self.unset_spaces()
    }

    /// Scan for a set bit starting at `start_index`.
    ///
    /// With `consume` the bit is atomically cleared on the way out. The
    /// caller owns the bit either way; a concurrent unset loses the race.
    pub fn find_set_bit(&self, start_index: u64, consume: bool) -> u64 {
        if start_index >= self.size_in_bits {
            return BITMAP_NOT_FOUND;
        }

        let mut offset = Self::bit_offset(start_index);
        for chunk_idx in Self::chunk_index(start_index)..self.data.len() {
            let chunk = self.data[chunk_idx].load(Ordering::Acquire);
            if chunk != 0 {
                for bit in offset..BITS_PER_CHUNK as u32 {
                    if chunk & (1u64 << bit) != 0 {
                        let found = chunk_idx as u64 * BITS_PER_CHUNK + bit as u64;
                        if found >= self.size_in_bits {
                            break;
                        }
                        if consume {
                            self.unset_bit(found);
                        }
                        return found;
                    }
                }
            }
            offset = 0;
        }
        BITMAP_NOT_FOUND
    }

    /// Scan for a clear bit starting at `start_index`.
    ///
    /// With `produce` the bit is atomically set; losing the set race moves
    /// the scan forward rather than returning a bit another thread owns.
    pub fn find_unset_bit(&self, start_index: u64, produce: bool) -> u64 {
        if start_index >= self.size_in_bits {
            return BITMAP_NOT_FOUND;
        }

        let mut offset = Self::bit_offset(start_index);
        for chunk_idx in Self::chunk_index(start_index)..self.data.len() {
            let chunk = self.data[chunk_idx].load(Ordering::Acquire);
            if chunk != u64::MAX {
                for bit in offset..BITS_PER_CHUNK as u32 {
                    if chunk & (1u64 << bit) == 0 {
                        let found = chunk_idx as u64 * BITS_PER_CHUNK + bit as u64;
                        if found >= self.size_in_bits {
                            break;
                        }
                        if produce && self.set_bit(found) {
                            // Lost the claim; keep scanning.
                            continue;
                        }
                        return found;
                    }
                }
            }
            offset = 0;
        }
        BITMAP_NOT_FOUND
    }
}
