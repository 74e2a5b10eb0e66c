//! Page descriptors.
//!
//! A [`PhysicalPage`] plays the role of `struct page`: the per-frame record
//! carrying the reference count, the map count, the mapping identity
//! (`index` + root handle) and the flag word. Frames never move; an exchange
//! swaps the identities and contents of two descriptors in place.
use std::{
    fmt,
    sync::{
        atomic::{
            AtomicI64,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
    },
};

use crate::{
    deps::derive_more,
    flags::PageFlags,
    frames::FrameArena,
    rmap::{
        AddressSpace,
        AnonVma,
        BufferHeads,
    },
};


/// Page frame number. `0` never names a real frame; it doubles as the
/// "unlinked" sentinel in the page-info side table.
#[derive(
    Copy,
    Clone,
    PartialOrd,
    PartialEq,
    Eq,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    derive_more::LowerHex,
    derive_more::UpperHex,
)]
#[repr(transparent)]
pub struct Pfn(u64);


impl Pfn {
    pub const NONE: Pfn = Pfn(0);

    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// The pfn of the `k`-th base page within a compound page headed here.
    pub const fn offset(&self, k: u64) -> Pfn {
        Pfn(self.0 + k)
    }
}


impl fmt::Debug for Pfn {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}


/// What `page->mapping` points at.
#[derive(Clone)]
pub enum PageRoot {
    None,
    Anon(Arc<AnonVma>),
    File(Arc<AddressSpace>),
}


impl PageRoot {
    pub fn is_none(&self) -> bool {
        matches!(self, PageRoot::None)
    }

    pub fn is_anon(&self) -> bool {
        matches!(self, PageRoot::Anon(_))
    }
}


impl fmt::Debug for PageRoot {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            PageRoot::None => write!(f, "None"),
            PageRoot::Anon(av) => write!(f, "Anon({})", av.id()),
            PageRoot::File(mapping) => write!(f, "File({})", mapping.id()),
        }
    }
}


/// The per-page sleeping lock plus the writeback wait channel.
///
/// Unlike a guard-based mutex this lock may be taken in one function and
/// released in another, which is how the exchange kernel holds both
/// participants across the unmap/swap/remap pipeline.
pub struct PageLock {
    state:   Mutex<bool>,
    cv:      Condvar,
    waiters: AtomicUsize,
}


impl PageLock {
    pub fn new() -> Self {
        Self {
            state:   Mutex::new(false),
            cv:      Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn try_lock(&self) -> bool {
        let mut locked = self.state.lock().unwrap();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    pub fn lock(&self) {
        let mut locked = self.state.lock().unwrap();
        while *locked {
            self.waiters.fetch_add(1, Ordering::SeqCst);
            locked = self.cv.wait(locked).unwrap();
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
        *locked = true;
    }

    pub fn unlock(&self) {
        let mut locked = self.state.lock().unwrap();
        *locked = false;
        self.cv.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        *self.state.lock().unwrap()
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }
}


pub struct PhysicalPage {
    pfn:      Pfn,
    nid:      usize,
    order:    u8,
    hugetlb:  bool,
    arena:    Arc<FrameArena>,
    flags:    PageFlags,
    refcount: AtomicUsize,
    mapcount: AtomicUsize,
    index:    AtomicU64,
    root:     Mutex<PageRoot>,
    cpupid:   AtomicI64,
    memcg:    AtomicU64,
    buffers:  Mutex<Option<Arc<BufferHeads>>>,
    lock:     PageLock,
    wb_gate:  Mutex<()>,
    wb_cv:    Condvar,
}


impl PhysicalPage {
    pub fn new(
        pfn: Pfn,
        nid: usize,
        order: u8,
        hugetlb: bool,
        arena: Arc<FrameArena>,
    ) -> Self {
        Self {
            pfn,
            nid,
            order,
            hugetlb,
            arena,
            flags: PageFlags::new(),
            refcount: AtomicUsize::new(1),
            mapcount: AtomicUsize::new(0),
            index: AtomicU64::new(0),
            root: Mutex::new(PageRoot::None),
            cpupid: AtomicI64::new(-1),
            memcg: AtomicU64::new(0),
            buffers: Mutex::new(None),
            lock: PageLock::new(),
            wb_gate: Mutex::new(()),
            wb_cv: Condvar::new(),
        }
    }

    pub const fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub const fn nid(&self) -> usize {
        self.nid
    }

    pub const fn compound_order(&self) -> u8 {
        self.order
    }

    pub const fn nr_pages(&self) -> usize {
        1 << self.order
    }

    pub const fn is_compound(&self) -> bool {
        self.order > 0
    }

    pub const fn is_huge(&self) -> bool {
        self.hugetlb
    }

    pub const fn is_trans_huge(&self) -> bool {
        self.order > 0 && !self.hugetlb
    }

    pub fn flags(&self) -> &PageFlags {
        &self.flags
    }

    pub fn lock(&self) -> &PageLock {
        &self.lock
    }

    // ---- data --------------------------------------------------------

    pub fn data(&self) -> &[std::sync::atomic::AtomicU64] {
        self.arena.frame_words(self.pfn.as_usize(), self.nr_pages())
    }

    pub fn fill(
        &self,
        byte: u8,
    ) {
        self.arena.fill(self.pfn.as_usize(), self.nr_pages(), byte);
    }

    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.arena.snapshot(self.pfn.as_usize(), self.nr_pages())
    }

    // ---- reference count ---------------------------------------------

    pub fn page_count(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn get_page(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get_page_unless_zero(&self) -> bool {
        let mut count = self.refcount.load(Ordering::SeqCst);
        loop {
            if count == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
    }

    /// Drops one reference and reports the remaining count. The machine is
    /// responsible for releasing a page that reaches zero.
    pub(crate) fn put_page_return(&self) -> usize {
        let prior = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prior > 0, "refcount underflow on {:?}", self.pfn);
        prior - 1
    }

    /// Freezes the reference count to zero if it currently equals
    /// `expected`, blocking new lookups through the mapping tree.
    pub fn ref_freeze(
        &self,
        expected: usize,
    ) -> bool {
        self.refcount
            .compare_exchange(expected, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn ref_unfreeze(
        &self,
        count: usize,
    ) {
        debug_assert_eq!(self.refcount.load(Ordering::SeqCst), 0);
        self.refcount.store(count, Ordering::SeqCst);
    }

    // ---- map count ---------------------------------------------------

    pub fn mapcount(&self) -> usize {
        self.mapcount.load(Ordering::SeqCst)
    }

    pub fn page_mapped(&self) -> bool {
        self.mapcount() > 0
    }

    pub(crate) fn mapcount_inc(&self) {
        self.mapcount.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mapcount_dec(&self) {
        let prior = self.mapcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prior > 0, "mapcount underflow on {:?}", self.pfn);
    }

    // ---- mapping identity --------------------------------------------

    pub fn index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    pub fn set_index(
        &self,
        index: u64,
    ) {
        self.index.store(index, Ordering::SeqCst);
    }

    pub fn root(&self) -> PageRoot {
        self.root.lock().unwrap().clone()
    }

    pub fn set_root(
        &self,
        root: PageRoot,
    ) {
        *self.root.lock().unwrap() = root;
    }

    pub fn is_anon(&self) -> bool {
        self.root.lock().unwrap().is_anon()
    }

    pub fn is_ksm(&self) -> bool {
        self.flags.ksm()
    }

    /// `page_mapping()`: the file mapping serving this page, if any. Anonymous
    /// and unlinked pages report none.
    pub fn mapping_file(&self) -> Option<Arc<AddressSpace>> {
        match &*self.root.lock().unwrap() {
            PageRoot::File(mapping) => Some(Arc::clone(mapping)),
            _ => None,
        }
    }

    /// `page_is_file_cache()`: file-backed pages are the ones not backed by
    /// swap or RAM.
    pub fn is_file_cache(&self) -> bool {
        !self.flags.swapbacked()
    }

    // ---- numa hint ----------------------------------------------------

    pub fn cpupid_xchg(
        &self,
        value: i64,
    ) -> i64 {
        self.cpupid.swap(value, Ordering::SeqCst)
    }

    pub fn memcg(&self) -> u64 {
        self.memcg.load(Ordering::SeqCst)
    }

    pub fn set_memcg(
        &self,
        id: u64,
    ) {
        self.memcg.store(id, Ordering::SeqCst);
    }

    // ---- filesystem private data -------------------------------------

    pub fn has_buffers(&self) -> bool {
        self.buffers.lock().unwrap().is_some()
    }

    pub fn page_has_private(&self) -> bool {
        self.flags.private()
    }

    pub fn buffer_heads(&self) -> Option<Arc<BufferHeads>> {
        self.buffers.lock().unwrap().clone()
    }

    pub fn attach_buffers(
        &self,
        heads: Arc<BufferHeads>,
    ) {
        *self.buffers.lock().unwrap() = Some(heads);
        self.flags.set_private();
    }

    pub fn take_buffers(&self) -> Option<Arc<BufferHeads>> {
        let taken = self.buffers.lock().unwrap().take();
        if taken.is_some() {
            self.flags.clear_private();
        }
        taken
    }

    // ---- writeback ----------------------------------------------------

    pub fn set_writeback(&self) {
        self.flags.test_and_set_writeback();
    }

    pub fn end_writeback(&self) {
        let _gate = self.wb_gate.lock().unwrap();
        self.flags.test_and_clear_writeback();
        self.wb_cv.notify_all();
    }

    /// Transfers the writeback bit during a flag exchange, waking any
    /// waiters blocked on this page.
    pub fn test_and_clear_writeback(&self) -> bool {
        let _gate = self.wb_gate.lock().unwrap();
        let was = self.flags.test_and_clear_writeback();
        self.wb_cv.notify_all();
        was
    }

    pub fn wait_on_writeback(&self) {
        let mut gate = self.wb_gate.lock().unwrap();
        while self.flags.writeback() {
            gate = self.wb_cv.wait(gate).unwrap();
        }
    }
}


impl fmt::Debug for PhysicalPage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("pfn", &self.pfn)
            .field("nid", &self.nid)
            .field("order", &self.order)
            .field("refcount", &self.page_count())
            .field("mapcount", &self.mapcount())
            .field("index", &self.index())
            .field("root", &*self.root.lock().unwrap())
            .field("flags", &self.flags)
            .finish()
    }
}
