//! Per-page flag word.
//!
//! ```text
//! Flags that travel with the logical identity of a page during an
//! exchange (read-and-clear on both sides, then cross-assigned):
//!
//!      ERROR         IO error occurred
//!      REFERENCED    page has been referenced since last LRU enqueue
//!      UPTODATE      page has up-to-date data
//!      ACTIVE        page is on the active LRU list
//!      UNEVICTABLE   page is pinned off the reclaimable LRU lists
//!      CHECKED       filesystem-private consistency bit
//!      MAPPEDTODISK  page has disk blocks allocated
//!      DIRTY         page has been written to
//!      YOUNG         accessed since the last idle-tracking sweep
//!      IDLE          not accessed since it was marked idle
//!      SWAPCACHE     page has an associated swap entry
//!      WRITEBACK     page is being synced to disk
//!      DOUBLEMAP     compound page is also mapped by base-page entries
//!
//! Flags that stay with the physical frame:
//!
//!      LRU           page is on one of its node's LRU lists
//!      SWAPBACKED    page is backed by swap/RAM (exchanged as part of
//!                    the mapping identity, not the flag transfer)
//!      PRIVATE       filesystem buffers are attached
//!      KSM           page is a kernel-samepage-merging page
//! ```
//!
//! All operations are atomic on a single word so flag movement during an
//! exchange never tears.
use std::{
    fmt,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};


#[derive(Default)]
pub struct PageFlags(AtomicU64);


impl PageFlags {
    const ACTIVE_BIT: u32 = 5;
    const CHECKED_BIT: u32 = 7;
    const DIRTY_BIT: u32 = 3;
    const DOUBLEMAP_BIT: u32 = 14;
    const ERROR_BIT: u32 = 0;
    const IDLE_BIT: u32 = 10;
    const KSM_BIT: u32 = 16;
    const LRU_BIT: u32 = 4;
    const MAPPEDTODISK_BIT: u32 = 8;
    const PRIVATE_BIT: u32 = 15;
    const REFERENCED_BIT: u32 = 1;
    const SWAPBACKED_BIT: u32 = 12;
    const SWAPCACHE_BIT: u32 = 11;
    const UNEVICTABLE_BIT: u32 = 13;
    const UPTODATE_BIT: u32 = 2;
    const WRITEBACK_BIT: u32 = 6;
    const YOUNG_BIT: u32 = 9;

    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn test(&self, bit: u32) -> bool {
        self.0.load(Ordering::SeqCst) & (1u64 << bit) != 0
    }

    fn set(&self, bit: u32) {
        self.0.fetch_or(1u64 << bit, Ordering::SeqCst);
    }

    fn clear(&self, bit: u32) {
        self.0.fetch_and(!(1u64 << bit), Ordering::SeqCst);
    }

    fn test_and_clear(&self, bit: u32) -> bool {
        self.0.fetch_and(!(1u64 << bit), Ordering::SeqCst) & (1u64 << bit) != 0
    }

    fn test_and_set(&self, bit: u32) -> bool {
        self.0.fetch_or(1u64 << bit, Ordering::SeqCst) & (1u64 << bit) != 0
    }

    pub fn error(&self) -> bool {
        self.test(Self::ERROR_BIT)
    }

    pub fn set_error(&self) {
        self.set(Self::ERROR_BIT)
    }

    pub fn clear_error(&self) {
        self.clear(Self::ERROR_BIT)
    }

    pub fn referenced(&self) -> bool {
        self.test(Self::REFERENCED_BIT)
    }

    pub fn set_referenced(&self) {
        self.set(Self::REFERENCED_BIT)
    }

    pub fn test_and_clear_referenced(&self) -> bool {
        self.test_and_clear(Self::REFERENCED_BIT)
    }

    pub fn uptodate(&self) -> bool {
        self.test(Self::UPTODATE_BIT)
    }

    pub fn set_uptodate(&self) {
        self.set(Self::UPTODATE_BIT)
    }

    pub fn clear_uptodate(&self) {
        self.clear(Self::UPTODATE_BIT)
    }

    pub fn dirty(&self) -> bool {
        self.test(Self::DIRTY_BIT)
    }

    pub fn set_dirty(&self) {
        self.set(Self::DIRTY_BIT)
    }

    pub fn clear_dirty(&self) {
        self.clear(Self::DIRTY_BIT)
    }

    pub fn lru(&self) -> bool {
        self.test(Self::LRU_BIT)
    }

    pub fn set_lru(&self) {
        self.set(Self::LRU_BIT)
    }

    pub fn clear_lru(&self) {
        self.clear(Self::LRU_BIT)
    }

    pub fn test_and_clear_lru(&self) -> bool {
        self.test_and_clear(Self::LRU_BIT)
    }

    pub fn active(&self) -> bool {
        self.test(Self::ACTIVE_BIT)
    }

    pub fn set_active(&self) {
        self.set(Self::ACTIVE_BIT)
    }

    pub fn clear_active(&self) {
        self.clear(Self::ACTIVE_BIT)
    }

    pub fn test_and_clear_active(&self) -> bool {
        self.test_and_clear(Self::ACTIVE_BIT)
    }

    pub fn writeback(&self) -> bool {
        self.test(Self::WRITEBACK_BIT)
    }

    pub fn test_and_set_writeback(&self) -> bool {
        self.test_and_set(Self::WRITEBACK_BIT)
    }

    pub fn test_and_clear_writeback(&self) -> bool {
        self.test_and_clear(Self::WRITEBACK_BIT)
    }

    pub fn checked(&self) -> bool {
        self.test(Self::CHECKED_BIT)
    }

    pub fn set_checked(&self) {
        self.set(Self::CHECKED_BIT)
    }

    pub fn clear_checked(&self) {
        self.clear(Self::CHECKED_BIT)
    }

    pub fn mappedtodisk(&self) -> bool {
        self.test(Self::MAPPEDTODISK_BIT)
    }

    pub fn set_mappedtodisk(&self) {
        self.set(Self::MAPPEDTODISK_BIT)
    }

    pub fn clear_mappedtodisk(&self) {
        self.clear(Self::MAPPEDTODISK_BIT)
    }

    pub fn young(&self) -> bool {
        self.test(Self::YOUNG_BIT)
    }

    pub fn set_young(&self) {
        self.set(Self::YOUNG_BIT)
    }

    pub fn test_and_clear_young(&self) -> bool {
        self.test_and_clear(Self::YOUNG_BIT)
    }

    pub fn idle(&self) -> bool {
        self.test(Self::IDLE_BIT)
    }

    pub fn set_idle(&self) {
        self.set(Self::IDLE_BIT)
    }

    pub fn clear_idle(&self) {
        self.clear(Self::IDLE_BIT)
    }

    pub fn swapcache(&self) -> bool {
        self.test(Self::SWAPCACHE_BIT)
    }

    pub fn set_swapcache(&self) {
        self.set(Self::SWAPCACHE_BIT)
    }

    pub fn clear_swapcache(&self) {
        self.clear(Self::SWAPCACHE_BIT)
    }

    pub fn swapbacked(&self) -> bool {
        self.test(Self::SWAPBACKED_BIT)
    }

    pub fn set_swapbacked(&self) {
        self.set(Self::SWAPBACKED_BIT)
    }

    pub fn clear_swapbacked(&self) {
        self.clear(Self::SWAPBACKED_BIT)
    }

    pub fn unevictable(&self) -> bool {
        self.test(Self::UNEVICTABLE_BIT)
    }

    pub fn set_unevictable(&self) {
        self.set(Self::UNEVICTABLE_BIT)
    }

    pub fn clear_unevictable(&self) {
        self.clear(Self::UNEVICTABLE_BIT)
    }

    pub fn test_and_clear_unevictable(&self) -> bool {
        self.test_and_clear(Self::UNEVICTABLE_BIT)
    }

    pub fn doublemap(&self) -> bool {
        self.test(Self::DOUBLEMAP_BIT)
    }

    pub fn set_doublemap(&self) {
        self.set(Self::DOUBLEMAP_BIT)
    }

    pub fn private(&self) -> bool {
        self.test(Self::PRIVATE_BIT)
    }

    pub fn set_private(&self) {
        self.set(Self::PRIVATE_BIT)
    }

    pub fn clear_private(&self) {
        self.clear(Self::PRIVATE_BIT)
    }

    pub fn ksm(&self) -> bool {
        self.test(Self::KSM_BIT)
    }

    pub fn set_ksm(&self) {
        self.set(Self::KSM_BIT)
    }

    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}


impl fmt::Debug for PageFlags {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        let mut bits = Vec::with_capacity(8);
        if self.error() {
            bits.push("ERROR");
        }
        if self.referenced() {
            bits.push("REFERENCED");
        }
        if self.uptodate() {
            bits.push("UPTODATE");
        }
        if self.dirty() {
            bits.push("DIRTY");
        }
        if self.lru() {
            bits.push("LRU");
        }
        if self.active() {
            bits.push("ACTIVE");
        }
        if self.writeback() {
            bits.push("WRITEBACK");
        }
        if self.checked() {
            bits.push("CHECKED");
        }
        if self.mappedtodisk() {
            bits.push("MAPPEDTODISK");
        }
        if self.young() {
            bits.push("YOUNG");
        }
        if self.idle() {
            bits.push("IDLE");
        }
        if self.swapcache() {
            bits.push("SWAPCACHE");
        }
        if self.swapbacked() {
            bits.push("SWAPBACKED");
        }
        if self.unevictable() {
            bits.push("UNEVICTABLE");
        }
        if self.doublemap() {
            bits.push("DOUBLEMAP");
        }
        if self.private() {
            bits.push("PRIVATE");
        }
        if self.ksm() {
            bits.push("KSM");
        }

        f.debug_struct("PageFlags")
            .field("value", &format_args!("{:#b}", self.snapshot()))
            .field("bits", &bits.as_slice())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_clear_returns_prior_value() {
        let flags = PageFlags::new();
        assert!(!flags.test_and_clear_referenced());

        flags.set_referenced();
        assert!(flags.referenced());
        assert!(flags.test_and_clear_referenced());
        assert!(!flags.referenced());
    }

    #[test]
    fn bits_are_independent() {
        let flags = PageFlags::new();
        flags.set_dirty();
        flags.set_active();
        flags.set_swapbacked();

        assert!(flags.dirty());
        assert!(flags.active());
        assert!(flags.swapbacked());
        assert!(!flags.unevictable());

        flags.clear_dirty();
        assert!(!flags.dirty());
        assert!(flags.active());
        assert!(flags.swapbacked());
    }

    #[test]
    fn debug_lists_set_bit_names() {
        let flags = PageFlags::new();
        flags.set_lru();
        flags.set_dirty();

        let rendered = format!("{:?}", flags);
        assert!(rendered.contains("LRU"));
        assert!(rendered.contains("DIRTY"));
        assert!(!rendered.contains("WRITEBACK"));
    }
}
