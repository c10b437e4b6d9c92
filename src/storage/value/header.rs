//! Fixed binary headers of value slots
//!
//! # Indirect layouts (Light / Normal)
//!
//! ```text
//! word 0: MetaHeader
//!   bits  0..8   number of materialized columns
//!   bits  8..16  layout tag
//!   bits 16..24  header size in 8-byte words
//!   bits 24..64  column bitset (1 = column allocated)
//! Normal only:
//! word 1: global step   (i64)
//! word 2: freq counter  (i64)
//! ```
//!
//! # Fixed-length layouts (Contiguous / Device)
//!
//! ```text
//! word 0: bits  0..48  global step (signed, 48 bits)
//!         bits 48..64  column initialized flags
//! word 1: freq counter (i64)
//! ```
//!
//! All words are atomics: readers test column bits without taking the slot
//! lock, and the frequency counter is bumped with compare-and-swap.

use super::LayoutType;
use std::hint;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Bits available for the column bitset in a MetaHeader
pub const COLUMN_BITSET_SIZE: usize = 40;

/// Column flags available in a FixedLengthHeader
pub const FIXED_COLUMN_FLAGS: usize = 16;

const EMBED_NUM_SHIFT: u32 = 0;
const LAYOUT_SHIFT: u32 = 8;
const HEADER_SIZE_SHIFT: u32 = 16;
const BITSET_SHIFT: u32 = 24;

const STEP_BITS: u32 = 48;
const STEP_MASK: u64 = (1 << STEP_BITS) - 1;

/// Decoded MetaHeader word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaWord(u64);

impl MetaWord {
    pub fn new(layout: LayoutType, header_words: usize) -> Self {
        Self(
            ((layout as u64) << LAYOUT_SHIFT)
                | (((header_words as u64) & 0xff) << HEADER_SIZE_SHIFT),
        )
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn embed_num(self) -> usize {
        ((self.0 >> EMBED_NUM_SHIFT) & 0xff) as usize
    }

    pub fn layout(self) -> Option<LayoutType> {
        LayoutType::from_tag(((self.0 >> LAYOUT_SHIFT) & 0xff) as u8)
    }

    pub fn header_words(self) -> usize {
        ((self.0 >> HEADER_SIZE_SHIFT) & 0xff) as usize
    }

    pub fn column_bitset(self) -> u64 {
        self.0 >> BITSET_SHIFT
    }

    pub fn test_column(self, column: usize) -> bool {
        column < COLUMN_BITSET_SIZE && (self.column_bitset() >> column) & 1 == 1
    }

    /// Mark `column` allocated and bump the column count
    pub fn with_column(self, column: usize) -> Self {
        debug_assert!(column < COLUMN_BITSET_SIZE);
        let bitset = self.column_bitset() | (1 << column);
        let embed_num = (self.embed_num() as u64 + 1) & 0xff;
        Self(
            (bitset << BITSET_SHIFT)
                | (self.0 & (0xffff << LAYOUT_SHIFT))
                | (embed_num << EMBED_NUM_SHIFT),
        )
    }
}

/// Header of the indirect layout without bookkeeping
#[repr(C)]
pub struct LightHeader {
    pub(crate) meta: AtomicU64,
}

/// Header of the indirect layout with step and frequency
#[repr(C)]
pub struct NormalHeader {
    pub(crate) meta: AtomicU64,
    global_step: AtomicI64,
    freq_counter: AtomicI64,
}

/// Header shared by contiguous and device layouts
#[repr(C)]
pub struct FixedLengthHeader {
    step_and_flags: AtomicU64,
    freq_counter: AtomicI64,
}

const _: () = assert!(size_of::<LightHeader>() == 8);
const _: () = assert!(size_of::<LightHeader>() <= 23);
const _: () = assert!(size_of::<NormalHeader>() == 24);
const _: () = assert!(size_of::<FixedLengthHeader>() == 16);

/// Shared access to the MetaHeader word of indirect headers
pub trait IndirectHeader: Send + Sync {
    const LAYOUT: LayoutType;

    fn new() -> Self;

    fn meta(&self) -> &AtomicU64;

    fn load_meta(&self) -> MetaWord {
        MetaWord::from_raw(self.meta().load(Ordering::Acquire))
    }
}

impl IndirectHeader for LightHeader {
    const LAYOUT: LayoutType = LayoutType::Light;

    fn new() -> Self {
        let words = size_of::<Self>() / size_of::<u64>();
        Self {
            meta: AtomicU64::new(MetaWord::new(Self::LAYOUT, words).raw()),
        }
    }

    fn meta(&self) -> &AtomicU64 {
        &self.meta
    }
}

impl IndirectHeader for NormalHeader {
    const LAYOUT: LayoutType = LayoutType::Normal;

    fn new() -> Self {
        let words = size_of::<Self>() / size_of::<u64>();
        Self {
            meta: AtomicU64::new(MetaWord::new(Self::LAYOUT, words).raw()),
            global_step: AtomicI64::new(-1),
            freq_counter: AtomicI64::new(0),
        }
    }

    fn meta(&self) -> &AtomicU64 {
        &self.meta
    }
}

impl NormalHeader {
    pub fn step(&self) -> i64 {
        self.global_step.load(Ordering::Relaxed)
    }

    pub fn set_step(&self, step: i64) {
        self.global_step.store(step, Ordering::Relaxed);
    }

    pub fn freq(&self) -> i64 {
        self.freq_counter.load(Ordering::Relaxed)
    }

    pub fn set_freq(&self, freq: i64) {
        self.freq_counter.store(freq, Ordering::Relaxed);
    }

    pub fn add_freq(&self, count: i64) {
        cas_add(&self.freq_counter, count);
    }
}

impl FixedLengthHeader {
    pub fn new() -> Self {
        Self {
            step_and_flags: AtomicU64::new(encode_step(-1)),
            freq_counter: AtomicI64::new(0),
        }
    }

    pub fn step(&self) -> i64 {
        decode_step(self.step_and_flags.load(Ordering::Relaxed))
    }

    /// Replace the step bits, preserving the column flags
    pub fn set_step(&self, step: i64) {
        let mut cur = self.step_and_flags.load(Ordering::Relaxed);
        loop {
            let next = (cur & !STEP_MASK) | encode_step(step);
            match self.step_and_flags.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn freq(&self) -> i64 {
        self.freq_counter.load(Ordering::Relaxed)
    }

    pub fn set_freq(&self, freq: i64) {
        self.freq_counter.store(freq, Ordering::Relaxed);
    }

    pub fn add_freq(&self, count: i64) {
        cas_add(&self.freq_counter, count);
    }

    pub fn is_initialized(&self, column: usize) -> bool {
        column < FIXED_COLUMN_FLAGS
            && (self.step_and_flags.load(Ordering::Acquire) >> (STEP_BITS as usize + column)) & 1
                == 1
    }

    /// Publish `column` as initialized; pairs with the acquire in `is_initialized`
    pub fn set_initialized(&self, column: usize) {
        debug_assert!(column < FIXED_COLUMN_FLAGS);
        self.step_and_flags
            .fetch_or(1 << (STEP_BITS as usize + column), Ordering::Release);
    }

    /// Copy both words from another header
    pub fn copy_from(&self, other: &FixedLengthHeader) {
        self.step_and_flags.store(
            other.step_and_flags.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.freq_counter
            .store(other.freq_counter.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl Default for FixedLengthHeader {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_step(step: i64) -> u64 {
    (step as u64) & STEP_MASK
}

fn decode_step(word: u64) -> i64 {
    // sign-extend the low 48 bits
    (((word & STEP_MASK) << (64 - STEP_BITS)) as i64) >> (64 - STEP_BITS)
}

/// Single-attempt CAS increment; may lose updates under contention
fn cas_add(counter: &AtomicI64, count: i64) {
    let cur = counter.load(Ordering::Relaxed);
    let _ = counter.compare_exchange(cur, cur + count, Ordering::Relaxed, Ordering::Relaxed);
}

/// Test-and-set spin flag guarding the check-then-allocate sequence
#[derive(Debug, Default)]
pub struct SpinFlag {
    locked: AtomicBool,
}

impl SpinFlag {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinGuard { flag: self }
    }
}

/// Clears the flag on drop
pub struct SpinGuard<'a> {
    flag: &'a SpinFlag,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.flag.locked.store(false, Ordering::Release);
    }
}
