//! Worker-core bitmask and allocation pool
//!
//! Cores are tracked as a fixed array of `u32` words, one bit per core.
//! The word layout is also the wire format of `HELLO_RESP`.
//!
//! # Allocation order
//!
//! `reserve` walks the words in ascending order and takes the lowest set
//! bit of the current word until the request is satisfied, so a request
//! always receives the lowest-numbered available cores.

use core::fmt;

use crate::error::{Error, Result};

/// Highest core id + 1 that can be represented
pub const MAX_CORES: usize = 128;

/// Number of `u32` words in a [`CoreMask`]
pub const CORE_MASK_WORDS: usize = MAX_CORES / 32;

/// A set of worker cores
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CoreMask([u32; CORE_MASK_WORDS]);

impl CoreMask {
    pub const EMPTY: CoreMask = CoreMask([0; CORE_MASK_WORDS]);

    #[inline]
    pub const fn from_words(words: [u32; CORE_MASK_WORDS]) -> Self {
        CoreMask(words)
    }

    #[inline]
    pub const fn words(&self) -> &[u32; CORE_MASK_WORDS] {
        &self.0
    }

    /// Build a mask from core ids
    pub fn from_cores<I: IntoIterator<Item = usize>>(cores: I) -> Result<Self> {
        let mut mask = CoreMask::EMPTY;
        for core in cores {
            if core >= MAX_CORES {
                return Err(Error::InvalidArgument(format!(
                    "core {} exceeds maximum {}",
                    core,
                    MAX_CORES - 1
                )));
            }
            mask.set(core);
        }
        Ok(mask)
    }

    /// Parse a core list such as `"1,2,4-7"`
    pub fn parse_list(list: &str) -> Result<Self> {
        let mut cores = Vec::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let bad = || Error::InvalidArgument(format!("bad core list entry '{}'", part));
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: usize = lo.trim().parse().map_err(|_| bad())?;
                    let hi: usize = hi.trim().parse().map_err(|_| bad())?;
                    if lo > hi {
                        return Err(bad());
                    }
                    cores.extend(lo..=hi);
                }
                None => cores.push(part.parse().map_err(|_| bad())?),
            }
        }
        Self::from_cores(cores)
    }

    #[inline]
    pub fn set(&mut self, core: usize) {
        self.0[core / 32] |= 1 << (core % 32);
    }

    #[inline]
    pub fn clear(&mut self, core: usize) {
        self.0[core / 32] &= !(1 << (core % 32));
    }

    #[inline]
    pub fn is_set(&self, core: usize) -> bool {
        core < MAX_CORES && self.0[core / 32] & (1 << (core % 32)) != 0
    }

    /// Number of cores in the set
    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// True if any core is in both sets
    pub fn intersects(&self, other: &CoreMask) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    /// True if every core of `self` is in `other`
    pub fn is_subset_of(&self, other: &CoreMask) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a & !b == 0)
    }

    pub fn union(&self, other: &CoreMask) -> CoreMask {
        let mut out = *self;
        for (o, b) in out.0.iter_mut().zip(other.0.iter()) {
            *o |= b;
        }
        out
    }

    /// Iterate core ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            core::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(i * 32 + bit)
            })
        })
    }
}

impl fmt::Debug for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Pool of worker cores available to client processes
pub struct CorePool {
    /// Every core the pool was built with
    full: CoreMask,
    /// Cores not currently granted
    available: CoreMask,
    /// Popcount of `available`
    avail_count: u32,
}

impl CorePool {
    pub fn new(cores: CoreMask) -> Self {
        Self {
            full: cores,
            available: cores,
            avail_count: cores.count(),
        }
    }

    /// Number of cores that can still be reserved
    #[inline]
    pub fn available(&self) -> u32 {
        self.avail_count
    }

    /// Total number of cores managed by the pool
    #[inline]
    pub fn total(&self) -> u32 {
        self.full.count()
    }

    pub fn available_mask(&self) -> CoreMask {
        self.available
    }

    /// Reserve `count` cores, lowest ids first
    ///
    /// Fails without side effects if fewer than `count` cores are free.
    pub fn reserve(&mut self, count: u32) -> Result<CoreMask> {
        if count > self.avail_count {
            return Err(Error::InsufficientCores {
                requested: count,
                available: self.avail_count,
            });
        }

        let mut granted = CoreMask::EMPTY;
        let mut remaining = count;
        for (i, word) in self.available.0.iter_mut().enumerate() {
            let mut w = *word;
            while w != 0 && remaining > 0 {
                let bit = w.trailing_zeros();
                w &= w - 1;
                granted.0[i] |= 1 << bit;
                remaining -= 1;
            }
            *word &= !granted.0[i];
            if remaining == 0 {
                break;
            }
        }

        self.avail_count -= count;
        Ok(granted)
    }

    /// Give previously reserved cores back to the pool
    ///
    /// A mask containing a core that is already available, or that the
    /// pool never managed, means the caller's accounting is corrupt; it is
    /// rejected whole and reported as an invariant violation.
    pub fn return_cores(&mut self, mask: &CoreMask) -> Result<()> {
        if !mask.is_subset_of(&self.full) {
            return Err(Error::invariant(format!(
                "returned cores {:?} outside pool {:?}",
                mask, self.full
            )));
        }
        if mask.intersects(&self.available) {
            return Err(Error::invariant(format!(
                "returned cores {:?} overlap available {:?}",
                mask, self.available
            )));
        }

        self.available = self.available.union(mask);
        self.avail_count += mask.count();
        Ok(())
    }
}
