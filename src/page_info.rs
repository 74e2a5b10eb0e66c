//! The per-frame tracking record.
//!
//! Every frame owns one [`PageInfo`] slot in a side table indexed by PFN.
//! The record never points back at its page with an owning reference; it
//! stores the raw PFN, with `0` meaning "unlinked". Placement on the LAP
//! and deferred lists is tagged through the `TRACKED`/`DEFERRED` bits, and
//! the lists themselves live under the owning node's lru lock.
use std::sync::atomic::{
    AtomicI32,
    AtomicU32,
    AtomicU64,
    AtomicU8,
    Ordering,
};

use crate::page::Pfn;


pub const ACCESS_HISTORY_SIZE: u32 = 8;
pub const MAX_ACCESS_LEVEL: u32 = ACCESS_HISTORY_SIZE;
pub const MEDIAN_ACCESS_LEVEL: u32 = ACCESS_HISTORY_SIZE >> 1;

pub const NO_CPU: i32 = -1;


pub struct PageInfo {
    pfn:           AtomicU64,
    last_cpu:      AtomicI32,
    access_bitmap: AtomicU8,
    flags:         AtomicU32,
}


impl PageInfo {
    const TRACKED: u32 = 1 << 0;
    const DEFERRED: u32 = 1 << 1;
    const DEMOTED: u32 = 1 << 2;
    const BUSY_LOCK: u32 = 1 << 3;
    const BALANCING: u32 = 1 << 4;

    fn new() -> Self {
        Self {
            pfn:           AtomicU64::new(0),
            last_cpu:      AtomicI32::new(NO_CPU),
            access_bitmap: AtomicU8::new(0),
            flags:         AtomicU32::new(0),
        }
    }

    pub fn pfn(&self) -> Pfn {
        Pfn::new(self.pfn.load(Ordering::SeqCst))
    }

    pub fn set_pfn(
        &self,
        pfn: Pfn,
    ) {
        self.pfn.store(pfn.get(), Ordering::SeqCst);
    }

    pub fn last_cpu(&self) -> i32 {
        self.last_cpu.load(Ordering::SeqCst)
    }

    pub fn set_last_cpu(
        &self,
        cpu: i32,
    ) {
        self.last_cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn access_bitmap(&self) -> u8 {
        self.access_bitmap.load(Ordering::SeqCst)
    }

    pub fn set_access_bitmap(
        &self,
        bitmap: u8,
    ) {
        self.access_bitmap.store(bitmap, Ordering::SeqCst);
    }

    /// Access level: the number of sampling intervals among the last eight
    /// in which the page was referenced.
    pub fn access_level(&self) -> u32 {
        self.access_bitmap().count_ones()
    }

    /// Shifts the history left by one interval, recording `accessed` as the
    /// newest bit. Returns the level before the shift.
    pub fn mod_access_level(
        &self,
        accessed: bool,
    ) -> u32 {
        let prev = self.access_level();
        let mut bitmap = self.access_bitmap() << 1;
        if accessed {
            bitmap |= 0x1;
        } else {
            bitmap &= 0xfe;
        }
        self.set_access_bitmap(bitmap);
        prev
    }

    /// Newly observed pages start with a full history: every bit set, so
    /// they classify as maximally hot until real samples age that out.
    pub fn reset_access_level(&self) {
        self.set_access_bitmap(u8::MAX);
    }

    fn test(&self, bit: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & bit != 0
    }

    fn set(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::SeqCst);
    }

    fn clear(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::SeqCst);
    }

    pub fn tracked(&self) -> bool {
        self.test(Self::TRACKED)
    }

    pub fn set_tracked(&self) {
        self.set(Self::TRACKED)
    }

    pub fn clear_tracked(&self) {
        self.clear(Self::TRACKED)
    }

    pub fn deferred(&self) -> bool {
        self.test(Self::DEFERRED)
    }

    pub fn set_deferred(&self) {
        self.set(Self::DEFERRED)
    }

    pub fn clear_deferred(&self) {
        self.clear(Self::DEFERRED)
    }

    pub fn demoted(&self) -> bool {
        self.test(Self::DEMOTED)
    }

    pub fn set_demoted(&self) {
        self.set(Self::DEMOTED)
    }

    pub fn clear_demoted(&self) {
        self.clear(Self::DEMOTED)
    }

    pub fn busy(&self) -> bool {
        self.test(Self::BUSY_LOCK)
    }

    /// Advisory non-blocking lock: a single compare-and-swap raising the
    /// busy bit; returns whether this caller won it.
    pub fn trylock_busy(&self) -> bool {
        self.flags.fetch_or(Self::BUSY_LOCK, Ordering::SeqCst) & Self::BUSY_LOCK == 0
    }

    pub fn lock_busy(&self) {
        self.set(Self::BUSY_LOCK);
    }

    pub fn unlock_busy(&self) {
        self.clear(Self::BUSY_LOCK);
    }

    pub fn initialized(&self) -> bool {
        self.test(Self::BALANCING)
    }

    /// First-touch initialization of an early-allocated frame.
    pub fn init_balancing(&self) {
        self.set(Self::BALANCING);
        self.clear(Self::TRACKED | Self::DEFERRED | Self::DEMOTED);
        self.pfn.store(0, Ordering::SeqCst);
        self.last_cpu.store(NO_CPU, Ordering::SeqCst);
        self.reset_access_level();
    }

    pub fn clear_info(&self) {
        self.pfn.store(0, Ordering::SeqCst);
        self.access_bitmap.store(0, Ordering::SeqCst);
    }
}


/// Side table with one slot per frame, indexed by PFN.
pub struct PageInfoTable {
    slots: Box<[PageInfo]>,
}


impl PageInfoTable {
    pub fn new(nr_frames: usize) -> Self {
        let mut slots = Vec::with_capacity(nr_frames);
        slots.resize_with(nr_frames, PageInfo::new);
        Self { slots: slots.into_boxed_slice() }
    }

    pub fn slot(
        &self,
        pfn: Pfn,
    ) -> &PageInfo {
        &self.slots[pfn.as_usize()]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Access-bitmap transfer for ordinary migration: the history follows
    /// the contents onto the new frame.
    pub fn copy_info(
        &self,
        old: Pfn,
        new: Pfn,
    ) {
        let bitmap = self.slot(old).access_bitmap();
        self.slot(new).set_access_bitmap(bitmap);
    }

    /// Access-bitmap exchange between the two participants of a pairwise
    /// swap. The PFN back-pointers stay put; they are re-derived from the
    /// frames, not part of the identity.
    pub fn exchange_info(
        &self,
        from: Pfn,
        to: Pfn,
    ) {
        let from_bitmap = self.slot(from).access_bitmap();
        let to_bitmap = self.slot(to).access_bitmap();
        self.slot(from).set_access_bitmap(to_bitmap);
        self.slot(to).set_access_bitmap(from_bitmap);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_popcount_of_last_eight_samples() {
        let info = PageInfo::new();
        let samples = [
            true, false, true, true, false, false, true, false, true, true, false, true,
        ];

        let mut window: Vec<bool> = Vec::new();
        for &accessed in samples.iter() {
            let prev = info.mod_access_level(accessed);
            let expected_prev =
                window.iter().rev().take(8).filter(|&&b| b).count() as u32;
            assert_eq!(prev, expected_prev);
            window.push(accessed);
        }

        let expected = window.iter().rev().take(8).filter(|&&b| b).count() as u32;
        assert_eq!(info.access_level(), expected);
        assert!(info.access_level() <= MAX_ACCESS_LEVEL);
    }

    #[test]
    fn reset_marks_page_maximally_hot() {
        let info = PageInfo::new();
        assert_eq!(info.access_level(), 0);
        info.reset_access_level();
        assert_eq!(info.access_bitmap(), 0xFF);
        assert_eq!(info.access_level(), MAX_ACCESS_LEVEL);
    }

    #[test]
    fn busy_trylock_is_won_exactly_once() {
        let info = PageInfo::new();
        assert!(info.trylock_busy());
        assert!(!info.trylock_busy());
        info.unlock_busy();
        assert!(info.trylock_busy());
    }

    #[test]
    fn exchange_info_swaps_only_the_bitmaps() {
        let table = PageInfoTable::new(8);
        table.slot(Pfn::new(2)).set_pfn(Pfn::new(2));
        table.slot(Pfn::new(5)).set_pfn(Pfn::new(5));
        table.slot(Pfn::new(2)).set_access_bitmap(0b1100_0011);
        table.slot(Pfn::new(5)).set_access_bitmap(0b0000_0001);

        table.exchange_info(Pfn::new(2), Pfn::new(5));

        assert_eq!(table.slot(Pfn::new(2)).access_bitmap(), 0b0000_0001);
        assert_eq!(table.slot(Pfn::new(5)).access_bitmap(), 0b1100_0011);
        assert_eq!(table.slot(Pfn::new(2)).pfn(), Pfn::new(2));
        assert_eq!(table.slot(Pfn::new(5)).pfn(), Pfn::new(5));
    }

    #[test]
    fn init_balancing_resets_membership_and_history() {
        let info = PageInfo::new();
        info.set_tracked();
        info.set_deferred();
        info.set_demoted();
        info.set_pfn(Pfn::new(42));
        info.set_last_cpu(3);

        info.init_balancing();

        assert!(info.initialized());
        assert!(!info.tracked());
        assert!(!info.deferred());
        assert!(!info.demoted());
        assert!(info.pfn().is_none());
        assert_eq!(info.last_cpu(), NO_CPU);
        assert_eq!(info.access_level(), MAX_ACCESS_LEVEL);
    }
}
